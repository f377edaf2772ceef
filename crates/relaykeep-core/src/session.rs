//! One supervised connection lifecycle, run as an actor.
//!
//! Lifecycle decisions come from [`session_fsm::step`]; this module owns the
//! side effects: timers, the live connection, the outbound queue and the
//! relay policy. Every input (connection events, timer expiries, operator
//! requests) arrives through the actor mailbox and is handled one at a time.

use crate::backoff::Backoff;
use crate::config::{EngineConfig, SessionConfig};
use crate::connection::{ConnectTarget, Connection, ConnectionEvent, Connector, Opened};
use crate::error::{classify_fault, FaultClass, TransportError};
use crate::parser::parse_relay;
use crate::policy::{RelayDecision, RelayPolicy};
use crate::queue::{EnqueueOutcome, OutboundQueue, QueueConfig};
use crate::resolve::Resolve;
use actor_model::{request, spawn_actor, ActorCtrl, ActorError, ExitReason, Timer};
use session_fsm::{step, Action, Ctx, EndCause, Event, Phase};
use std::sync::Arc;
use tokio::{
    sync::{
        mpsc::{Sender, WeakSender},
        oneshot::Sender as ReplyTx,
    },
    task::JoinHandle,
    time::Duration,
};
use tracing::{debug, error, info, warn};

const MAILBOX_CAPACITY: usize = 128;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared collaborators and constants handed to every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub engine: Arc<EngineConfig>,
    pub connector: Arc<dyn Connector>,
    pub resolver: Arc<dyn Resolve>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub name: String,
    pub phase: Phase,
    pub attempts: u32,
    pub connected: bool,
    pub stopped: bool,
    pub allowed_sender: String,
    pub queued: usize,
    /// Senders with a live cooldown entry.
    pub tracked_senders: usize,
    pub keep_alive_checks: u64,
}

enum SessionMsg {
    Connect,
    Opened {
        generation: u64,
        result: Result<Opened, TransportError>,
    },
    Event {
        generation: u64,
        event: ConnectionEvent,
    },
    LoginTimeout {
        generation: u64,
    },
    KeepAlive {
        generation: u64,
    },
    SweepCooldowns,
    Snapshot {
        reply: ReplyTx<SessionSnapshot>,
    },
    Stop {
        reply: ReplyTx<()>,
    },
}

#[derive(Clone)]
pub struct SessionHandle {
    name: Arc<str>,
    mailbox: Sender<SessionMsg>,
}

impl SessionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn connect(&self) -> Result<(), ActorError> {
        self.mailbox
            .send(SessionMsg::Connect)
            .await
            .map_err(|_| ActorError::SendFailed)
    }

    /// Stops the session for good. Stopping twice is fine.
    pub async fn stop(&self) -> Result<(), ActorError> {
        match request(&self.mailbox, REQUEST_TIMEOUT, |reply| SessionMsg::Stop { reply }).await {
            Err(ActorError::SendFailed) => Ok(()),
            other => other,
        }
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, ActorError> {
        request(&self.mailbox, REQUEST_TIMEOUT, |reply| SessionMsg::Snapshot { reply }).await
    }
}

pub fn spawn_session(
    config: SessionConfig,
    deps: SessionDeps,
) -> Result<(SessionHandle, JoinHandle<ExitReason>), ActorError> {
    let name: Arc<str> = Arc::from(config.username.as_str());
    let (mailbox, join) = spawn_actor(
        MAILBOX_CAPACITY,
        move |weak| Session::new(config, deps, weak),
        |session: &mut Session, msg| std::future::ready(session.handle(msg)),
    )?;
    Ok((SessionHandle { name, mailbox }, join))
}

struct Session {
    name: String,
    config: SessionConfig,
    engine: Arc<EngineConfig>,
    connector: Arc<dyn Connector>,
    resolver: Arc<dyn Resolve>,
    backoff: Backoff,
    mailbox: WeakSender<SessionMsg>,

    phase: Phase,
    ctx: Ctx,
    generation: u64,
    policy: RelayPolicy,
    connection: Option<Arc<dyn Connection>>,
    incoming: Option<Opened>,
    queue: Option<OutboundQueue>,

    open_task: Option<JoinHandle<()>>,
    login_timer: Option<Timer>,
    keep_alive_timer: Option<Timer>,
    reconnect_timer: Option<Timer>,
    sweep_timer: Option<Timer>,
    keep_alive_checks: u64,
}

impl Session {
    fn new(config: SessionConfig, deps: SessionDeps, mailbox: WeakSender<SessionMsg>) -> Self {
        let sweep_timer = Timer::every(&mailbox, deps.engine.cooldown_sweep_interval(), || {
            SessionMsg::SweepCooldowns
        });
        Self {
            name: config.username.clone(),
            ctx: Ctx::new(config.auto_activate_item),
            policy: RelayPolicy::new(&config, &deps.engine),
            backoff: Backoff::from_engine(&deps.engine),
            config,
            engine: deps.engine,
            connector: deps.connector,
            resolver: deps.resolver,
            mailbox,
            phase: Phase::Idle,
            generation: 0,
            connection: None,
            incoming: None,
            queue: None,
            open_task: None,
            login_timer: None,
            keep_alive_timer: None,
            reconnect_timer: None,
            sweep_timer: Some(sweep_timer),
            keep_alive_checks: 0,
        }
    }

    fn handle(&mut self, msg: SessionMsg) -> ActorCtrl {
        match msg {
            SessionMsg::Connect => {
                self.reconnect_timer = None;
                self.apply(Event::Connect);
            }
            SessionMsg::Opened { generation, result } => self.on_opened(generation, result),
            SessionMsg::Event { generation, event } => {
                if generation != self.generation {
                    debug!(session = %self.name, ?event, "ignoring event from an earlier connection");
                } else {
                    self.on_event(event);
                }
            }
            SessionMsg::LoginTimeout { generation } => {
                if generation == self.generation
                    && matches!(self.phase, Phase::Connecting | Phase::AwaitingLogin)
                {
                    warn!(session = %self.name, "login timeout, destroying connection");
                    self.apply(Event::LoginTimeout);
                }
            }
            SessionMsg::KeepAlive { generation } => self.keep_alive(generation),
            SessionMsg::SweepCooldowns => {
                let removed = self.policy.sweep_cooldowns(self.engine.cooldown_max_age());
                if removed > 0 {
                    debug!(session = %self.name, removed, "swept expired cooldowns");
                }
            }
            SessionMsg::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            SessionMsg::Stop { reply } => {
                self.apply(Event::Stop);
                let _ = reply.send(());
            }
        }
        ActorCtrl::Continue
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            name: self.name.clone(),
            phase: self.phase,
            attempts: self.ctx.attempts,
            connected: self.ctx.connected,
            stopped: self.ctx.stopped,
            allowed_sender: self.policy.allowed_sender().to_string(),
            queued: self.queue.as_ref().map_or(0, OutboundQueue::len),
            tracked_senders: self.policy.tracked_senders(),
            keep_alive_checks: self.keep_alive_checks,
        }
    }

    fn apply(&mut self, event: Event) {
        let (next, actions) = step(self.phase, event, &mut self.ctx);
        if next != self.phase {
            debug!(session = %self.name, from = ?self.phase, to = ?next, ?event, "phase change");
        }
        self.phase = next;
        for action in actions {
            self.perform(action);
        }
    }

    fn perform(&mut self, action: Action) {
        match action {
            Action::OpenConnection { attempt } => self.open(attempt),
            Action::ArmWatchdog => {
                let msg = SessionMsg::LoginTimeout {
                    generation: self.generation,
                };
                self.login_timer = Some(Timer::once(&self.mailbox, self.engine.login_timeout(), msg));
            }
            Action::CancelWatchdog => self.login_timer = None,
            Action::StartKeepAlive => {
                let generation = self.generation;
                self.keep_alive_timer = Some(Timer::every(
                    &self.mailbox,
                    self.engine.keep_alive_interval(),
                    move || SessionMsg::KeepAlive { generation },
                ));
            }
            Action::StopKeepAlive => self.keep_alive_timer = None,
            Action::ActivateItem => {
                if let Some(conn) = &self.connection {
                    match conn.activate_held_item() {
                        Ok(()) => info!(session = %self.name, "activated held item"),
                        Err(err) => {
                            error!(session = %self.name, error = %err, "failed to activate item")
                        }
                    }
                }
            }
            Action::ClearQueue => {
                if let Some(queue) = &self.queue {
                    queue.clear();
                }
            }
            Action::CloseConnection => {
                if let Some(conn) = self.connection.take() {
                    if let Err(err) = conn.close() {
                        debug!(session = %self.name, error = %err, "close failed (can be ignored)");
                    }
                }
            }
            Action::CloseGracefully => {
                self.sweep_timer = None;
                if let Some(task) = self.open_task.take() {
                    task.abort();
                }
                if let Some(conn) = self.connection.take() {
                    if let Err(err) = conn.close() {
                        debug!(session = %self.name, error = %err, "destroy error (can be ignored)");
                    }
                }
                info!(session = %self.name, "session stopped");
            }
            Action::DiscardConnection => {
                if let Some(opened) = self.incoming.take() {
                    debug!(session = %self.name, "closing connection that opened too late");
                    let _ = opened.connection.close();
                }
            }
            Action::ScheduleReconnect { attempt, cause } => self.schedule_reconnect(attempt, cause),
            Action::CancelReconnect => self.reconnect_timer = None,
        }
    }

    fn open(&mut self, attempt: u32) {
        self.generation += 1;
        let generation = self.generation;
        let mailbox = self.mailbox.clone();
        let connector = self.connector.clone();
        let resolver = self.resolver.clone();
        let name = self.name.clone();
        let host = self.config.host.clone();
        let fallback = self.config.fallback_address.clone();
        let port = self.config.port;
        let username = self.config.username.clone();
        let version = self.config.version.clone();

        self.open_task = Some(tokio::spawn(async move {
            let address = resolver.resolve(&host, fallback.as_deref()).await;
            info!(session = %name, "connecting to {address}:{port} (attempt #{attempt})");
            let target = ConnectTarget {
                address,
                port,
                username,
                version,
            };
            let result = connector.connect(&target).await;
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx.send(SessionMsg::Opened { generation, result }).await;
            }
        }));
    }

    fn on_opened(&mut self, generation: u64, result: Result<Opened, TransportError>) {
        if generation != self.generation {
            if let Ok(opened) = result {
                let _ = opened.connection.close();
            }
            return;
        }
        self.open_task = None;
        match result {
            Ok(opened) => {
                self.incoming = Some(opened);
                self.apply(Event::Opened);
                if let Some(Opened { connection, events }) = self.incoming.take() {
                    self.adopt(connection, events);
                }
            }
            Err(err) => {
                error!(session = %self.name, error = %err, "failed to open connection");
                self.apply(Event::OpenFailed);
            }
        }
    }

    fn adopt(
        &mut self,
        connection: Arc<dyn Connection>,
        mut events: tokio::sync::mpsc::Receiver<ConnectionEvent>,
    ) {
        let queue_config = QueueConfig::from_engine(&self.engine);
        self.queue = Some(OutboundQueue::new(&self.name, connection.clone(), queue_config));
        self.connection = Some(connection);

        let generation = self.generation;
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(tx) = mailbox.upgrade() else { return };
                if tx.send(SessionMsg::Event { generation, event }).await.is_err() {
                    return;
                }
            }
            // The stream ended without saying so.
            if let Some(tx) = mailbox.upgrade() {
                let event = ConnectionEvent::Disconnected;
                let _ = tx.send(SessionMsg::Event { generation, event }).await;
            }
        });
    }

    fn on_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { identity } => {
                info!(session = %self.name, %identity, "successfully logged in");
                self.apply(Event::LoggedIn);
            }
            ConnectionEvent::Spawned => {
                info!(session = %self.name, "spawned in world");
                self.apply(Event::Spawned);
            }
            ConnectionEvent::Text(line) => {
                if matches!(self.phase, Phase::AwaitingLogin | Phase::Active) {
                    self.on_text(&line);
                }
            }
            ConnectionEvent::Kicked(reason) => {
                warn!(session = %self.name, %reason, "kicked");
                self.apply(Event::Kicked);
            }
            ConnectionEvent::TransportError(err) => self.on_fault(err.class(), &err.to_string()),
            ConnectionEvent::ProtocolError(text) => self.on_fault(classify_fault(&text), &text),
            ConnectionEvent::Disconnected => {
                info!(session = %self.name, "disconnected");
                self.apply(Event::StreamEnd);
            }
        }
    }

    fn on_fault(&mut self, class: FaultClass, detail: &str) {
        match class {
            FaultClass::ProtocolNoise => {
                debug!(session = %self.name, %detail, "ignored packet parsing error");
                return;
            }
            FaultClass::Transient => {
                warn!(session = %self.name, %detail, "connection error (will reconnect)");
            }
            FaultClass::Fatal => {
                error!(session = %self.name, %detail, "connection error");
            }
        }
        self.apply(Event::TransportFault);
    }

    fn on_text(&mut self, line: &str) {
        // Any line mentioning the prompt triggers a reply, even after a
        // successful login.
        let lower = line.to_lowercase();
        if lower.contains("/login") {
            self.enqueue(format!("/login {}", self.config.password));
            info!(session = %self.name, "auto-login triggered");
            return;
        }
        if lower.contains("/register") {
            let password = &self.config.password;
            self.enqueue(format!("/register {password} {password}"));
            info!(session = %self.name, "auto-register triggered");
            return;
        }

        let Some(instruction) = parse_relay(line) else {
            return;
        };
        let sender = instruction.sender.clone();
        match self.policy.decide(&instruction) {
            RelayDecision::OnCooldown => {
                info!(session = %self.name, %sender, "relay ignored (cooldown)");
            }
            RelayDecision::AdminOpened { reply } => {
                self.enqueue(reply);
                info!(session = %self.name, admin = %sender, "relay opened to everyone");
            }
            RelayDecision::AdminRestricted { reply } => {
                self.enqueue(reply);
                info!(session = %self.name, admin = %sender, "relay restricted to admin");
            }
            RelayDecision::Denied { reply } => {
                if let Some(conn) = &self.connection {
                    if let Err(err) = conn.send(&reply) {
                        warn!(session = %self.name, error = %err, "failed to send denial");
                    }
                }
                info!(
                    session = %self.name,
                    %sender,
                    payload = %instruction.payload,
                    "permission denied"
                );
            }
            RelayDecision::Blocked { verb, reply } => {
                self.enqueue(reply);
                info!(session = %self.name, %sender, %verb, "blocked command");
            }
            RelayDecision::Execute { command } => {
                info!(session = %self.name, %sender, %command, "executing command");
                self.enqueue(command);
            }
            RelayDecision::Chat { text } => {
                info!(session = %self.name, %sender, %text, "relaying chat");
                self.enqueue(text);
            }
        }
    }

    fn enqueue(&self, message: String) {
        match &self.queue {
            Some(queue) => {
                if queue.enqueue(message) == EnqueueOutcome::Dropped {
                    debug!(session = %self.name, "outbound message dropped");
                }
            }
            None => warn!(session = %self.name, "no connection, dropping outbound message"),
        }
    }

    fn keep_alive(&mut self, generation: u64) {
        if generation != self.generation || self.phase != Phase::Active {
            return;
        }
        self.keep_alive_checks += 1;
        if let Some(conn) = &self.connection {
            if conn.is_writable() {
                debug!(session = %self.name, "keep-alive check: OK");
            } else {
                warn!(session = %self.name, "transport not writable, may disconnect soon");
            }
        }
    }

    fn schedule_reconnect(&mut self, attempt: u32, cause: EndCause) {
        if let Some(conn) = self.connection.take() {
            let _ = conn.close();
        }
        if self.ctx.stopped {
            return;
        }
        let delay = self.backoff.delay(attempt);
        info!(
            session = %self.name,
            ?cause,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnecting in {}s",
            delay.as_secs_f64().round()
        );
        self.reconnect_timer = Some(Timer::once(&self.mailbox, delay, SessionMsg::Connect));
    }
}
