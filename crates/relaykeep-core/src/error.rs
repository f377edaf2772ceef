//! Error types and the fault classification shared by every session.

use std::io;
use thiserror::Error;

/// How a fault affects the session that observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// The connection is gone or going; reconnect with backoff.
    Transient,
    /// Parse artifacts from the protocol layer; the session is still usable.
    ProtocolNoise,
    /// Not recognized; session state can no longer be trusted.
    Fatal,
}

const NOISE_MARKERS: &[&str] = &["PartialReadError", "Chunk size", "partial packet"];

const TRANSIENT_MARKERS: &[&str] = &[
    "econnreset",
    "epipe",
    "timed out",
    "connection reset",
    "broken pipe",
    "kicked",
];

/// Classifies a fault from its text.
///
/// The protocol layer only reports some failures as free text, so the
/// substring heuristics live here and nowhere else.
pub fn classify_fault(text: &str) -> FaultClass {
    if NOISE_MARKERS.iter().any(|m| text.contains(m)) {
        return FaultClass::ProtocolNoise;
    }
    let lower = text.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return FaultClass::Transient;
    }
    FaultClass::Fatal
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    ConnectionReset,
    BrokenPipe,
    TimedOut,
    Closed,
    Refused,
    Unsupported,
    Other,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Closed, message)
    }

    pub fn unsupported(what: &str) -> Self {
        Self::new(
            TransportErrorKind::Unsupported,
            format!("{what} is not supported by this transport"),
        )
    }

    /// True when the peer is gone and nothing more can be written.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::ConnectionReset
                | TransportErrorKind::BrokenPipe
                | TransportErrorKind::Closed
        )
    }

    pub fn class(&self) -> FaultClass {
        match self.kind {
            TransportErrorKind::ConnectionReset
            | TransportErrorKind::BrokenPipe
            | TransportErrorKind::TimedOut
            | TransportErrorKind::Closed
            | TransportErrorKind::Refused => FaultClass::Transient,
            TransportErrorKind::Unsupported | TransportErrorKind::Other => {
                classify_fault(&self.message)
            }
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                TransportErrorKind::ConnectionReset
            }
            io::ErrorKind::BrokenPipe => TransportErrorKind::BrokenPipe,
            io::ErrorKind::TimedOut => TransportErrorKind::TimedOut,
            io::ErrorKind::ConnectionRefused => TransportErrorKind::Refused,
            io::ErrorKind::NotConnected | io::ErrorKind::UnexpectedEof => {
                TransportErrorKind::Closed
            }
            _ => TransportErrorKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
