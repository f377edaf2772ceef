use relaykeep_core::config::{EngineConfig, SessionConfig};
use relaykeep_core::connection::mock::{MockConnector, MockLink};
use relaykeep_core::connection::{ConnectionEvent, Connector};
use relaykeep_core::error::{TransportError, TransportErrorKind};
use relaykeep_core::policy::{REPLY_BLOCKED, REPLY_DENIED, REPLY_OPENED, REPLY_RESTRICTED};
use relaykeep_core::resolve::StaticResolver;
use relaykeep_core::session::{spawn_session, SessionDeps, SessionHandle};
use session_fsm::Phase;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, Duration};

struct Harness {
    handle: SessionHandle,
    connector: Arc<MockConnector>,
    links: UnboundedReceiver<MockLink>,
}

fn session_config() -> SessionConfig {
    SessionConfig {
        host: "play.example.net".into(),
        fallback_address: Some("203.0.113.7".into()),
        port: 25565,
        username: "keeper1".into(),
        password: "13579".into(),
        version: Some("1.21.7".into()),
        allowed_sender: Some("alice".into()),
        admin_user: "root".into(),
        auto_activate_item: false,
    }
}

fn engine() -> EngineConfig {
    EngineConfig {
        reconnect_jitter_ms: 0,
        ..EngineConfig::default()
    }
}

async fn start(config: SessionConfig, engine: EngineConfig) -> Harness {
    let (connector, links) = MockConnector::new();
    let dyn_connector: Arc<dyn Connector> = connector.clone();
    let deps = SessionDeps {
        engine: Arc::new(engine),
        connector: dyn_connector,
        resolver: Arc::new(StaticResolver::new("198.51.100.4")),
    };
    let (handle, _join) = spawn_session(config, deps).unwrap();
    handle.connect().await.unwrap();
    Harness {
        handle,
        connector,
        links,
    }
}

async fn settle() {
    sleep(Duration::from_millis(5)).await;
}

async fn push(link: &MockLink, event: ConnectionEvent) {
    link.events.send(event).await.unwrap();
    settle().await;
}

async fn say(link: &MockLink, line: &str) {
    push(link, ConnectionEvent::Text(line.to_string())).await;
}

/// Waits for the next connection and walks it through login and spawn.
async fn logged_in(h: &mut Harness) -> MockLink {
    let link = h.links.recv().await.unwrap();
    push(
        &link,
        ConnectionEvent::Connected {
            identity: "keeper1".into(),
        },
    )
    .await;
    push(&link, ConnectionEvent::Spawned).await;
    link
}

#[tokio::test(start_paused = true)]
async fn test_connect_uses_resolved_address() {
    let mut h = start(session_config(), engine()).await;
    let link = logged_in(&mut h).await;
    assert_eq!(link.target.address, "198.51.100.4");
    assert_eq!(link.target.port, 25565);
    assert_eq!(link.target.username, "keeper1");

    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, Phase::Active);
    assert!(snapshot.connected);
    assert_eq!(snapshot.attempts, 0);
    assert_eq!(snapshot.allowed_sender, "alice");
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_sender_is_denied_without_queueing() {
    let mut h = start(session_config(), engine()).await;
    let link = logged_in(&mut h).await;

    say(&link, "[mallory -> keeper1] /say hi").await;
    assert_eq!(link.connection.sent(), vec![format!("/msg mallory {REPLY_DENIED}")]);
    assert_eq!(h.handle.snapshot().await.unwrap().queued, 0);
}

#[tokio::test(start_paused = true)]
async fn test_admin_opens_and_restricts_relay() {
    let mut h = start(session_config(), engine()).await;
    let link = logged_in(&mut h).await;

    say(&link, "[root -> keeper1] /all").await;
    assert_eq!(h.handle.snapshot().await.unwrap().allowed_sender, "*");
    say(&link, "[bob -> keeper1] /tp 100 64 100").await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(
        link.connection.sent(),
        vec![format!("/msg root {REPLY_OPENED}"), "/tp 100 64 100".to_string()]
    );

    // Cooldown for root has to pass before the next directive.
    sleep(Duration::from_secs(3)).await;
    say(&link, "[ROOT -> keeper1] /ME").await;
    assert_eq!(h.handle.snapshot().await.unwrap().allowed_sender, "root");
    sleep(Duration::from_secs(3)).await;
    say(&link, "[bob -> keeper1] /tp 0 0 0").await;
    sleep(Duration::from_millis(200)).await;
    let sent = link.connection.sent();
    assert_eq!(sent[2], format!("/msg ROOT {REPLY_RESTRICTED}"));
    assert_eq!(sent[3], format!("/msg bob {REPLY_DENIED}"));
    assert_eq!(sent.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_disallowed_verb_is_rejected() {
    let mut h = start(session_config(), engine()).await;
    let link = logged_in(&mut h).await;

    say(&link, "[alice -> keeper1] /ban someone").await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(link.connection.sent(), vec![format!("/msg alice {REPLY_BLOCKED}")]);
}

#[tokio::test(start_paused = true)]
async fn test_chat_and_commands_are_relayed_with_cooldown() {
    let mut h = start(session_config(), engine()).await;
    let link = logged_in(&mut h).await;

    say(&link, "[alice -> keeper1]   hello there  ").await;
    say(&link, "[alice -> keeper1] /home").await;
    sleep(Duration::from_secs(3)).await;
    say(&link, "[Alice -> keeper1] /home").await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(link.connection.sent(), vec!["hello there", "/home"]);
}

#[tokio::test(start_paused = true)]
async fn test_auth_prompts_are_answered() {
    let mut h = start(session_config(), engine()).await;
    let link = h.links.recv().await.unwrap();

    say(&link, "Please /register <password> <password>").await;
    sleep(Duration::from_millis(200)).await;
    say(&link, "Use /login <password> to continue").await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(
        link.connection.sent(),
        vec!["/register 13579 13579", "/login 13579"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_transport_end_clears_queue_and_reconnects() {
    let mut h = start(session_config(), engine()).await;
    let link = h.links.recv().await.unwrap();
    settle().await;
    let before = h.handle.snapshot().await.unwrap();
    assert_eq!(before.phase, Phase::AwaitingLogin);
    assert_eq!(before.attempts, 1);

    link.connection.set_writable(false);
    say(&link, "Please /login").await;
    say(&link, "[alice -> keeper1] /spawn").await;
    assert_eq!(h.handle.snapshot().await.unwrap().queued, 2);

    push(&link, ConnectionEvent::Disconnected).await;
    let ended = h.handle.snapshot().await.unwrap();
    assert_eq!(ended.phase, Phase::Ended);
    assert_eq!(ended.queued, 0);
    assert!(!ended.connected);

    link.connection.set_writable(true);
    sleep(Duration::from_secs(2)).await;
    assert!(link.connection.sent().is_empty());

    let next = h.links.recv().await.unwrap();
    settle().await;
    let after = h.handle.snapshot().await.unwrap();
    assert_eq!(after.attempts, before.attempts + 1);
    assert_eq!(after.phase, Phase::AwaitingLogin);
    assert_eq!(h.connector.attempts(), 2);
    assert!(next.connection.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_login_timeout_destroys_connection_and_retries() {
    let mut h = start(session_config(), engine()).await;
    let link = h.links.recv().await.unwrap();

    sleep(Duration::from_millis(20_500)).await;
    assert_eq!(link.connection.closes(), 1);
    assert_eq!(h.handle.snapshot().await.unwrap().phase, Phase::Ended);

    // base 5s * 1.5 for the first retry
    let _next = h.links.recv().await.unwrap();
    assert_eq!(h.handle.snapshot().await.unwrap().attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_protocol_noise_is_ignored_but_fatal_errors_end_the_session() {
    let mut h = start(session_config(), engine()).await;
    let link = logged_in(&mut h).await;

    push(
        &link,
        ConnectionEvent::ProtocolError("PartialReadError: Read past end of buffer".into()),
    )
    .await;
    assert_eq!(h.handle.snapshot().await.unwrap().phase, Phase::Active);

    push(
        &link,
        ConnectionEvent::TransportError(TransportError::new(
            TransportErrorKind::ConnectionReset,
            "read ECONNRESET",
        )),
    )
    .await;
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, Phase::Ended);
    assert_eq!(link.connection.closes(), 1);

    // The stream end that follows the reset does not schedule a second retry.
    push(&link, ConnectionEvent::Disconnected).await;
    let _next = logged_in(&mut h).await;
    sleep(Duration::from_secs(120)).await;
    assert_eq!(h.connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_kick_ends_session() {
    let mut h = start(session_config(), engine()).await;
    let link = logged_in(&mut h).await;

    push(&link, ConnectionEvent::Kicked("You logged in from another location".into())).await;
    assert_eq!(h.handle.snapshot().await.unwrap().phase, Phase::Ended);
    assert_eq!(link.connection.closes(), 1);
    let next = h.links.recv().await.unwrap();
    assert_eq!(next.target.username, "keeper1");
}

#[tokio::test(start_paused = true)]
async fn test_refused_connect_backs_off_and_retries() {
    let (connector, mut links) = MockConnector::new();
    connector.refuse_next(2);
    let dyn_connector: Arc<dyn Connector> = connector.clone();
    let deps = SessionDeps {
        engine: Arc::new(engine()),
        connector: dyn_connector,
        resolver: Arc::new(StaticResolver::new("198.51.100.4")),
    };
    let (handle, _join) = spawn_session(session_config(), deps).unwrap();
    handle.connect().await.unwrap();

    let _link = links.recv().await.unwrap();
    assert_eq!(connector.attempts(), 3);
    assert_eq!(handle.snapshot().await.unwrap().attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn test_held_item_activates_once_per_connection() {
    let config = SessionConfig {
        auto_activate_item: true,
        ..session_config()
    };
    let mut h = start(config, engine()).await;
    let link = logged_in(&mut h).await;
    push(&link, ConnectionEvent::Spawned).await;
    assert_eq!(link.connection.activations(), 1);

    push(&link, ConnectionEvent::Disconnected).await;
    let next = logged_in(&mut h).await;
    assert_eq!(next.connection.activations(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_terminal() {
    let mut h = start(session_config(), engine()).await;
    let link = logged_in(&mut h).await;

    h.handle.stop().await.unwrap();
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, Phase::Stopped);
    assert!(snapshot.stopped);
    assert_eq!(link.connection.closes(), 1);

    // Late events and connect requests change nothing.
    let _ = link.events.send(ConnectionEvent::Disconnected).await;
    h.handle.connect().await.unwrap();
    h.handle.stop().await.unwrap();
    sleep(Duration::from_secs(120)).await;
    assert_eq!(h.connector.attempts(), 1);
    assert_eq!(h.handle.snapshot().await.unwrap().phase, Phase::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_sweep_runs_on_its_own_schedule() {
    let mut h = start(session_config(), engine()).await;
    let link = logged_in(&mut h).await;

    say(&link, "[alice -> keeper1] /home").await;
    assert_eq!(h.handle.snapshot().await.unwrap().tracked_senders, 1);

    // Sweeps at 60s intervals keep entries younger than 300s.
    sleep(Duration::from_secs(240)).await;
    assert_eq!(h.handle.snapshot().await.unwrap().tracked_senders, 1);

    sleep(Duration::from_secs(121)).await;
    assert_eq!(h.handle.snapshot().await.unwrap().tracked_senders, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_cooldown_sweep() {
    let mut h = start(session_config(), engine()).await;
    let link = logged_in(&mut h).await;

    say(&link, "[alice -> keeper1] /home").await;
    h.handle.stop().await.unwrap();
    sleep(Duration::from_secs(600)).await;
    assert_eq!(h.handle.snapshot().await.unwrap().tracked_senders, 1);
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_checks_only_while_active() {
    let mut h = start(session_config(), engine()).await;
    let link = logged_in(&mut h).await;

    sleep(Duration::from_secs(61)).await;
    assert_eq!(h.handle.snapshot().await.unwrap().keep_alive_checks, 2);

    // Not writable is only logged; the session stays up.
    link.connection.set_writable(false);
    sleep(Duration::from_secs(30)).await;
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.keep_alive_checks, 3);
    assert_eq!(snapshot.phase, Phase::Active);

    push(&link, ConnectionEvent::Disconnected).await;
    sleep(Duration::from_secs(90)).await;
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_ne!(snapshot.phase, Phase::Active);
    assert_eq!(snapshot.keep_alive_checks, 3);
}
