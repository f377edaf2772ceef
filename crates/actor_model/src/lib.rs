use std::future::Future;
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{channel, Sender, WeakSender},
        oneshot::{self, Sender as ReplyTx},
    },
    task::{JoinError, JoinHandle},
    time::{interval_at, sleep, timeout, Duration, Instant, MissedTickBehavior},
};

// === Generic actor runtime ===
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActorError {
    #[error("actor mailbox capacity must be at least 1")]
    InvalidCapacity,
    #[error("actor mailbox is closed")]
    SendFailed,
    #[error("actor dropped the reply channel")]
    ResponseDropped,
    #[error("actor did not answer in time")]
    Timeout,
}

#[derive(Debug)]
pub enum ActorCtrl {
    Continue,
    Stop,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ExitReason {
    StoppedByMessage,
    AllSendersDropped,
}

#[derive(Clone, Copy, Debug)]
pub enum RestartPolicy {
    MaxRetries { n: usize },
    Never,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Termination {
    Clean(ExitReason),
    Panic(String),
    Cancelled,
}

pub fn allows_restart(policy: RestartPolicy, attempts_so_far: usize) -> bool {
    match policy {
        RestartPolicy::MaxRetries { n } => attempts_so_far < n,
        RestartPolicy::Never => false,
    }
}

/// Waits for an actor task and reports how it ended, recovering the panic
/// message when there is one.
pub async fn watch(join: JoinHandle<ExitReason>) -> Termination {
    match join.await {
        Ok(exit) => Termination::Clean(exit),
        Err(err) => termination_from(err),
    }
}

fn termination_from(err: JoinError) -> Termination {
    if !err.is_panic() {
        return Termination::Cancelled;
    }
    let payload = err.into_panic();
    let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    };
    Termination::Panic(message)
}

/// Spawns an actor whose state is built from a weak handle to its own
/// mailbox, so the state can schedule messages to itself without keeping
/// the actor alive after every external sender is gone.
pub fn spawn_actor<State, Msg, Init, Handler, Fut>(
    capacity: usize,
    init: Init,
    handler: Handler,
) -> Result<(Sender<Msg>, JoinHandle<ExitReason>), ActorError>
where
    State: Send + 'static,
    Msg: Send + 'static,
    Init: FnOnce(WeakSender<Msg>) -> State,
    Handler: FnMut(&mut State, Msg) -> Fut + Send + 'static,
    Fut: Future<Output = ActorCtrl> + Send + 'static,
{
    if capacity == 0 {
        return Err(ActorError::InvalidCapacity);
    }
    let (tx, mut rx) = channel::<Msg>(capacity);
    let initial_state = init(tx.downgrade());
    let join = tokio::spawn(async move {
        let mut state = initial_state;
        let mut handler = handler;
        while let Some(msg) = rx.recv().await {
            match handler(&mut state, msg).await {
                ActorCtrl::Continue => {}
                ActorCtrl::Stop => return ExitReason::StoppedByMessage,
            }
        }
        ExitReason::AllSendersDropped
    });
    Ok((tx, join))
}

/// Sends a message carrying a reply channel and waits for the answer.
pub async fn request<Msg, T>(
    mailbox: &Sender<Msg>,
    within: Duration,
    make_msg: impl FnOnce(ReplyTx<T>) -> Msg,
) -> Result<T, ActorError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let exchange = async {
        mailbox
            .send(make_msg(reply_tx))
            .await
            .map_err(|_| ActorError::SendFailed)?;
        reply_rx.await.map_err(|_| ActorError::ResponseDropped)
    };
    match timeout(within, exchange).await {
        Ok(res) => res,
        Err(_) => Err(ActorError::Timeout),
    }
}

// === Timers ===

/// A message scheduled for delivery to an actor mailbox.
///
/// Dropping the timer cancels it. A message that was already delivered
/// stays in the mailbox, so receivers must tolerate late expiries.
#[derive(Debug)]
pub struct Timer {
    join: JoinHandle<()>,
}

impl Timer {
    pub fn once<Msg>(mailbox: &WeakSender<Msg>, after: Duration, msg: Msg) -> Self
    where
        Msg: Send + 'static,
    {
        let mailbox = mailbox.clone();
        let join = tokio::spawn(async move {
            sleep(after).await;
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx.send(msg).await;
            }
        });
        Self { join }
    }

    /// Delivers `make()` every `period`, first after one full period.
    pub fn every<Msg, F>(mailbox: &WeakSender<Msg>, period: Duration, mut make: F) -> Self
    where
        Msg: Send + 'static,
        F: FnMut() -> Msg + Send + 'static,
    {
        let mailbox = mailbox.clone();
        let join = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let Some(tx) = mailbox.upgrade() else { return };
                if tx.send(make()).await.is_err() {
                    return;
                }
            }
        });
        Self { join }
    }

    pub fn cancel(self) {}
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.join.abort();
    }
}
