//! The protocol client seen from a session: a handle to write through and
//! a stream of lifecycle events.

pub mod line;
pub mod mock;

use crate::error::TransportError;
use async_trait::async_trait;
use std::{fmt, sync::Arc};
use tokio::sync::mpsc;

pub use line::LineConnector;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Handshake finished; the server knows us as `identity`.
    Connected { identity: String },
    Spawned,
    Text(String),
    Kicked(String),
    TransportError(TransportError),
    /// Raw error text from the protocol layer.
    ProtocolError(String),
    Disconnected,
}

pub trait Connection: Send + Sync + fmt::Debug {
    fn is_open(&self) -> bool;

    /// False while the transport is momentarily backed up.
    fn is_writable(&self) -> bool;

    fn send(&self, text: &str) -> Result<(), TransportError>;

    fn activate_held_item(&self) -> Result<(), TransportError> {
        Err(TransportError::unsupported("activating the held item"))
    }

    fn close(&self) -> Result<(), TransportError>;
}

pub struct Opened {
    pub connection: Arc<dyn Connection>,
    pub events: mpsc::Receiver<ConnectionEvent>,
}

impl fmt::Debug for Opened {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Opened")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &ConnectTarget) -> Result<Opened, TransportError>;
}
