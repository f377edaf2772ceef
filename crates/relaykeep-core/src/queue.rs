//! Per-session outbound buffer with a minimum gap between sends.

use crate::config::EngineConfig;
use crate::connection::Connection;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::time::{sleep, Duration, Instant};
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub capacity: usize,
    pub min_gap: Duration,
    pub not_writable_retry: Duration,
}

impl QueueConfig {
    pub fn from_engine(engine: &EngineConfig) -> Self {
        Self {
            capacity: engine.queue_capacity,
            min_gap: Duration::from_millis(engine.send_gap_ms),
            not_writable_retry: Duration::from_millis(engine.not_writable_retry_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    Dropped,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<String>,
    /// A message popped by the drain loop but not yet sent.
    in_flight: bool,
    processing: bool,
    last_sent: Option<Instant>,
}

impl QueueState {
    fn occupied(&self) -> usize {
        self.pending.len() + usize::from(self.in_flight)
    }
}

/// FIFO of text waiting to go out on one connection.
///
/// At most one drain task runs per queue; `processing` guards it.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    session: Arc<str>,
    connection: Arc<dyn Connection>,
    config: QueueConfig,
    state: Arc<Mutex<QueueState>>,
}

impl OutboundQueue {
    pub fn new(session: &str, connection: Arc<dyn Connection>, config: QueueConfig) -> Self {
        Self {
            session: Arc::from(session),
            connection,
            config,
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends `message` unless the queue is full, in which case the new
    /// message is dropped. Starts a drain task if none is running.
    pub fn enqueue(&self, message: impl Into<String>) -> EnqueueOutcome {
        let message = message.into();
        let start_drain = {
            let mut state = self.lock();
            if state.occupied() >= self.config.capacity {
                drop(state);
                warn!(session = %self.session, %message, "outbound queue full, dropping message");
                return EnqueueOutcome::Dropped;
            }
            state.pending.push_back(message);
            !std::mem::replace(&mut state.processing, true)
        };
        if start_drain {
            tokio::spawn(self.clone().drain());
        }
        EnqueueOutcome::Queued
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    pub fn is_processing(&self) -> bool {
        self.lock().processing
    }

    pub fn pending(&self) -> Vec<String> {
        self.lock().pending.iter().cloned().collect()
    }

    /// Discards everything not yet sent. A send already in progress
    /// completes or fails on its own.
    pub fn clear(&self) {
        self.lock().pending.clear();
    }

    fn abandon(&self) {
        let mut state = self.lock();
        state.pending.clear();
        state.in_flight = false;
        state.processing = false;
    }

    async fn drain(self) {
        loop {
            let (message, last_sent) = {
                let mut state = self.lock();
                match state.pending.pop_front() {
                    Some(message) => {
                        state.in_flight = true;
                        (message, state.last_sent)
                    }
                    None => {
                        state.processing = false;
                        return;
                    }
                }
            };

            if let Some(last) = last_sent {
                let since = last.elapsed();
                if since < self.config.min_gap {
                    sleep(self.config.min_gap - since).await;
                }
            }

            if !self.connection.is_open() {
                warn!(session = %self.session, "connection closed, clearing outbound queue");
                self.abandon();
                return;
            }

            if !self.connection.is_writable() {
                warn!(session = %self.session, "transport not writable, requeueing message");
                {
                    let mut state = self.lock();
                    state.pending.push_front(message);
                    state.in_flight = false;
                }
                sleep(self.config.not_writable_retry).await;
                continue;
            }

            match self.connection.send(&message) {
                Ok(()) => {
                    let mut state = self.lock();
                    state.in_flight = false;
                    state.last_sent = Some(Instant::now());
                }
                Err(err) if err.is_connection_lost() => {
                    warn!(session = %self.session, error = %err, "connection lost, clearing outbound queue");
                    self.abandon();
                    return;
                }
                Err(err) => {
                    error!(session = %self.session, error = %err, "failed to send message");
                    self.lock().in_flight = false;
                }
            }
        }
    }
}
