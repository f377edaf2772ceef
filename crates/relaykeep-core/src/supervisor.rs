//! Owns every session: staggered startup, orderly shutdown and the
//! process-level fault policy for sessions whose actor panicked.

use crate::config::SessionConfig;
use crate::error::{classify_fault, FaultClass};
use crate::session::{spawn_session, SessionDeps, SessionHandle, SessionSnapshot};
use actor_model::{allows_restart, watch, ActorError, RestartPolicy, Termination};
use std::sync::{Arc, RwLock};
use tokio::{
    sync::mpsc,
    time::{sleep, Duration},
};
use tracing::{debug, error, info, warn};

/// A session actor died in a way the engine cannot recover from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessFault {
    pub session: String,
    pub class: FaultClass,
    pub message: String,
}

/// Read-only view of the running sessions, cheap to clone into other tasks.
#[derive(Clone, Default)]
pub struct Roster {
    handles: Arc<RwLock<Vec<SessionHandle>>>,
}

impl Roster {
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        self.read().clone()
    }

    /// Snapshots of every session that still answers.
    pub async fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut out = Vec::new();
        for handle in self.handles() {
            match handle.snapshot().await {
                Ok(snapshot) => out.push(snapshot),
                Err(err) => {
                    debug!(component = "supervisor", session = handle.name(), error = %err, "no snapshot")
                }
            }
        }
        out
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<SessionHandle>> {
        self.handles.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<SessionHandle>> {
        self.handles.write().unwrap_or_else(|e| e.into_inner())
    }
}

struct Member {
    config: SessionConfig,
    handle: SessionHandle,
    restarts: usize,
    epoch: u64,
}

#[derive(Debug)]
struct Notice {
    index: usize,
    epoch: u64,
    termination: Termination,
}

pub struct Supervisor {
    deps: SessionDeps,
    stagger: Duration,
    restart: RestartPolicy,
    members: Vec<Member>,
    roster: Roster,
    next_epoch: u64,
    notices_tx: mpsc::UnboundedSender<Notice>,
    notices_rx: mpsc::UnboundedReceiver<Notice>,
}

impl Supervisor {
    pub fn new(deps: SessionDeps, restart: RestartPolicy) -> Self {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        Self {
            stagger: deps.engine.start_stagger(),
            deps,
            restart,
            members: Vec::new(),
            roster: Roster::default(),
            next_epoch: 0,
            notices_tx,
            notices_rx,
        }
    }

    pub fn roster(&self) -> Roster {
        self.roster.clone()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub async fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.roster.snapshots().await
    }

    /// Starts one session per config with a fixed gap between consecutive
    /// starts. Sessions started before this future is dropped stay running.
    pub async fn start_all(&mut self, configs: Vec<SessionConfig>) -> Result<(), ActorError> {
        let total = configs.len();
        for (i, config) in configs.into_iter().enumerate() {
            if i > 0 {
                sleep(self.stagger).await;
            }
            info!(component = "supervisor", session = %config.username, "starting session {}/{total}", i + 1);
            let handle = self.launch(self.members.len(), config.clone())?;
            self.members.push(Member {
                config,
                handle: handle.clone(),
                restarts: 0,
                epoch: self.next_epoch,
            });
            self.roster.write().push(handle.clone());
            handle.connect().await?;
        }
        Ok(())
    }

    /// Stops every session and forgets them. Calling it again is harmless.
    pub async fn stop_all(&mut self) {
        if self.members.is_empty() {
            return;
        }
        info!(component = "supervisor", sessions = self.members.len(), "stopping all sessions");
        self.roster.write().clear();
        for member in self.members.drain(..) {
            if let Err(err) = member.handle.stop().await {
                warn!(component = "supervisor", session = member.handle.name(), error = %err, "stop did not complete");
            }
        }
    }

    /// Waits until a session fails in a way that needs the whole process to
    /// go down. Recoverable panics are handled here by restarting the
    /// session, so this only returns for unrecoverable ones.
    pub async fn next_fault(&mut self) -> ProcessFault {
        loop {
            let Some(notice) = self.notices_rx.recv().await else {
                return std::future::pending().await;
            };
            let Some(member) = self.members.get(notice.index) else {
                continue;
            };
            if member.epoch != notice.epoch {
                continue;
            }
            let message = match notice.termination {
                Termination::Panic(message) => message,
                Termination::Clean(exit) => {
                    debug!(component = "supervisor", session = member.handle.name(), ?exit, "session actor exited");
                    continue;
                }
                Termination::Cancelled => continue,
            };

            let session = member.config.username.clone();
            let class = classify_fault(&message);
            if class != FaultClass::Fatal && allows_restart(self.restart, member.restarts) {
                warn!(component = "supervisor", %session, ?class, %message, "session crashed, restarting");
                if let Err(err) = self.restart_member(notice.index).await {
                    error!(component = "supervisor", %session, error = %err, "restart failed");
                    return ProcessFault {
                        session,
                        class: FaultClass::Fatal,
                        message: err.to_string(),
                    };
                }
                continue;
            }
            error!(component = "supervisor", %session, ?class, %message, "unrecoverable session fault");
            return ProcessFault {
                session,
                class,
                message,
            };
        }
    }

    async fn restart_member(&mut self, index: usize) -> Result<(), ActorError> {
        let Some(member) = self.members.get(index) else {
            return Ok(());
        };
        let config = member.config.clone();
        let old = member.handle.clone();
        old.stop().await?;

        let handle = self.launch(index, config)?;
        let epoch = self.next_epoch;
        if let Some(member) = self.members.get_mut(index) {
            member.handle = handle.clone();
            member.restarts += 1;
            member.epoch = epoch;
        }
        if let Some(slot) = self.roster.write().get_mut(index) {
            *slot = handle.clone();
        }
        handle.connect().await
    }

    /// Spawns the session actor and a watcher that reports how it ended.
    fn launch(&mut self, index: usize, config: SessionConfig) -> Result<SessionHandle, ActorError> {
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let (handle, join) = spawn_session(config, self.deps.clone())?;
        let notices = self.notices_tx.clone();
        tokio::spawn(async move {
            let termination = watch(join).await;
            let _ = notices.send(Notice {
                index,
                epoch,
                termination,
            });
        });
        Ok(handle)
    }
}
