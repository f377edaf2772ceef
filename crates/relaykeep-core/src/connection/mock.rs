//! In-memory connection doubles for exercising sessions without a server.

use super::{ConnectTarget, Connection, ConnectionEvent, Connector, Opened};
use crate::error::{TransportError, TransportErrorKind};
use async_trait::async_trait;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::mpsc;

#[derive(Debug)]
struct MockState {
    open: bool,
    writable: bool,
    sent: Vec<String>,
    failures: VecDeque<TransportError>,
    activations: usize,
    closes: usize,
}

#[derive(Debug)]
pub struct MockConnection {
    state: Mutex<MockState>,
}

impl MockConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                open: true,
                writable: true,
                sent: Vec::new(),
                failures: VecDeque::new(),
                activations: 0,
                closes: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    pub fn set_open(&self, open: bool) {
        self.lock().open = open;
    }

    pub fn set_writable(&self, writable: bool) {
        self.lock().writable = writable;
    }

    /// The next `send` fails with `err` instead of recording the text.
    pub fn fail_next_send(&self, err: TransportError) {
        self.lock().failures.push_back(err);
    }

    pub fn activations(&self) -> usize {
        self.lock().activations
    }

    pub fn closes(&self) -> usize {
        self.lock().closes
    }
}

impl Connection for MockConnection {
    fn is_open(&self) -> bool {
        self.lock().open
    }

    fn is_writable(&self) -> bool {
        let state = self.lock();
        state.open && state.writable
    }

    fn send(&self, text: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.open {
            return Err(TransportError::closed("mock connection closed"));
        }
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        state.sent.push(text.to_string());
        Ok(())
    }

    fn activate_held_item(&self) -> Result<(), TransportError> {
        self.lock().activations += 1;
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.closes += 1;
        if !state.open {
            return Err(TransportError::closed("already closed"));
        }
        state.open = false;
        Ok(())
    }
}

/// One connection handed out by [`MockConnector`], with the sending side of
/// its event stream.
#[derive(Debug, Clone)]
pub struct MockLink {
    pub target: ConnectTarget,
    pub connection: Arc<MockConnection>,
    pub events: mpsc::Sender<ConnectionEvent>,
}

#[derive(Debug, Default)]
struct ConnectorState {
    attempts: usize,
    refuse: usize,
}

#[derive(Debug)]
pub struct MockConnector {
    state: Mutex<ConnectorState>,
    links: mpsc::UnboundedSender<MockLink>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockLink>) {
        let (links, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            state: Mutex::new(ConnectorState::default()),
            links,
        });
        (connector, rx)
    }

    fn lock(&self) -> MutexGuard<'_, ConnectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The next `n` connect calls are refused.
    pub fn refuse_next(&self, n: usize) {
        self.lock().refuse = n;
    }

    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<Opened, TransportError> {
        {
            let mut state = self.lock();
            state.attempts += 1;
            if state.refuse > 0 {
                state.refuse -= 1;
                return Err(TransportError::new(
                    TransportErrorKind::Refused,
                    "mock connection refused",
                ));
            }
        }
        let connection = MockConnection::new();
        let (events_tx, events_rx) = mpsc::channel(64);
        let _ = self.links.send(MockLink {
            target: target.clone(),
            connection: connection.clone(),
            events: events_tx,
        });
        Ok(Opened {
            connection,
            events: events_rx,
        })
    }
}
