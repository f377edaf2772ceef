//! Newline-delimited UTF-8 text over TCP.
//!
//! The TCP handshake stands in for login: once connected the reader emits
//! `Connected` then `Spawned`, and every received line becomes `Text`.

use super::{ConnectTarget, Connection, ConnectionEvent, Connector, Opened};
use crate::error::{TransportError, TransportErrorKind};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use memchr::memchr;
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    time::{timeout, Duration},
};
use tracing::debug;

const EVENT_BUFFER: usize = 64;
const MAX_LINE_LEN: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct LineConnector {
    pub connect_timeout: Duration,
    pub write_buffer: usize,
    /// Longer lines are cut to this many bytes; the rest is dropped.
    pub max_line_len: usize,
}

impl Default for LineConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            write_buffer: 32,
            max_line_len: MAX_LINE_LEN,
        }
    }
}

#[derive(Debug)]
pub struct LineConnection {
    outbound: mpsc::Sender<String>,
    closed: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl Connection for LineConnection {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.outbound.is_closed()
    }

    fn is_writable(&self) -> bool {
        self.is_open() && self.outbound.capacity() > 0
    }

    fn send(&self, text: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::closed("connection closed"));
        }
        self.outbound
            .try_send(text.to_string())
            .map_err(|err| match err {
                TrySendError::Full(_) => {
                    TransportError::new(TransportErrorKind::Other, "write buffer full")
                }
                TrySendError::Closed(_) => TransportError::closed("writer stopped"),
            })
    }

    fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(TransportError::closed("already closed"));
        }
        let _ = self.shutdown.send(true);
        Ok(())
    }
}

#[async_trait]
impl Connector for LineConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<Opened, TransportError> {
        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect((target.address.as_str(), target.port)),
        )
        .await
        .map_err(|_| TransportError::new(TransportErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.write_buffer.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(write_lines(
            write_half,
            outbound_rx,
            shutdown_rx.clone(),
            events_tx.clone(),
            closed.clone(),
        ));
        tokio::spawn(read_lines(
            LineReader::new(read_half, self.max_line_len),
            target.username.clone(),
            shutdown_rx,
            events_tx,
            closed.clone(),
        ));

        Ok(Opened {
            connection: Arc::new(LineConnection {
                outbound: outbound_tx,
                closed,
                shutdown: shutdown_tx,
            }),
            events: events_rx,
        })
    }
}

/// Byte-level line splitter with a hard cap on buffered input.
#[derive(Debug)]
struct LineReader<R> {
    inner: R,
    buf: BytesMut,
    max_line_len: usize,
    /// Dropping the tail of an over-long line up to its newline.
    discarding: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R, max_line_len: usize) -> Self {
        let max_line_len = max_line_len.max(1);
        Self {
            inner,
            buf: BytesMut::with_capacity(max_line_len.min(MAX_LINE_LEN)),
            max_line_len,
            discarding: false,
        }
    }

    /// Next line without its `\n` or `\r\n`. `Ok(None)` at end of stream.
    async fn read_line(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            if let Some(i) = memchr(b'\n', &self.buf) {
                let raw = self.buf.split_to(i + 1).freeze();
                if std::mem::take(&mut self.discarding) {
                    continue;
                }
                let mut line = trim_crlf(raw);
                if line.len() > self.max_line_len {
                    debug!(max = self.max_line_len, "inbound line too long, truncated");
                    line.truncate(self.max_line_len);
                }
                return Ok(Some(line));
            }

            if self.buf.len() > self.max_line_len {
                if self.discarding {
                    self.buf.clear();
                } else {
                    let head = self.buf.split_to(self.max_line_len).freeze();
                    self.buf.clear();
                    self.discarding = true;
                    debug!(max = self.max_line_len, "inbound line too long, truncated");
                    return Ok(Some(head));
                }
            }

            if self.inner.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() || self.discarding {
                    self.buf.clear();
                    return Ok(None);
                }
                let rest = self.buf.split().freeze();
                return Ok(Some(trim_crlf(rest)));
            }
        }
    }
}

fn trim_crlf(mut line: Bytes) -> Bytes {
    let mut end = line.len();
    if end > 0 && line[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && line[end - 1] == b'\r' {
        end -= 1;
    }
    line.truncate(end);
    line
}

async fn read_lines(
    mut reader: LineReader<OwnedReadHalf>,
    identity: String,
    mut shutdown: watch::Receiver<bool>,
    events: mpsc::Sender<ConnectionEvent>,
    closed: Arc<AtomicBool>,
) {
    let _ = events.send(ConnectionEvent::Connected { identity }).await;
    let _ = events.send(ConnectionEvent::Spawned).await;

    loop {
        tokio::select! {
            next = reader.read_line() => match next {
                Ok(Some(line)) => {
                    // Undecodable bytes become U+FFFD; the line still counts.
                    let text = String::from_utf8_lossy(&line).into_owned();
                    if events.send(ConnectionEvent::Text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    let _ = events.send(ConnectionEvent::TransportError(err.into())).await;
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    closed.store(true, Ordering::Release);
    let _ = events.send(ConnectionEvent::Disconnected).await;
}

async fn write_lines(
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
    events: mpsc::Sender<ConnectionEvent>,
    closed: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(mut line) = next else { break };
                line.push('\n');
                if let Err(err) = write_half.write_all(line.as_bytes()).await {
                    closed.store(true, Ordering::Release);
                    let _ = events.send(ConnectionEvent::TransportError(err.into())).await;
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    if let Err(err) = write_half.shutdown().await {
        debug!(error = %err, "line writer shutdown failed");
    }
}
