//! Pure lifecycle state machine for one supervised session.
//!
//! `step` never touches timers or sockets; it returns the actions the
//! session actor must carry out, in order.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    AwaitingLogin,
    Active,
    Ended,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Connect,
    Opened,
    OpenFailed,
    LoggedIn,
    Spawned,
    LoginTimeout,
    Kicked,
    TransportFault,
    StreamEnd,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndCause {
    OpenFailed,
    LoginTimeout,
    Kicked,
    TransportFault,
    StreamEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    OpenConnection { attempt: u32 },
    ArmWatchdog,
    CancelWatchdog,
    StartKeepAlive,
    StopKeepAlive,
    ActivateItem,
    ClearQueue,
    /// Forcibly tear down the current connection.
    CloseConnection,
    /// Best-effort close on operator shutdown; failures are not interesting.
    CloseGracefully,
    /// A connection finished opening after its attempt was abandoned.
    DiscardConnection,
    ScheduleReconnect { attempt: u32, cause: EndCause },
    CancelReconnect,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Ctx {
    pub attempts: u32,
    pub connected: bool,
    pub stopped: bool,
    pub auto_activate_item: bool,
    pub item_activated: bool,
}

impl Ctx {
    pub fn new(auto_activate_item: bool) -> Self {
        Self {
            auto_activate_item,
            ..Self::default()
        }
    }
}

pub fn step(phase: Phase, event: Event, ctx: &mut Ctx) -> (Phase, Vec<Action>) {
    use Phase::*;

    if ctx.stopped || phase == Stopped {
        let actions = match event {
            Event::Opened => vec![Action::DiscardConnection],
            _ => vec![],
        };
        return (Stopped, actions);
    }

    match (phase, event) {
        (_, Event::Stop) => {
            ctx.stopped = true;
            ctx.connected = false;
            (
                Stopped,
                vec![
                    Action::CancelWatchdog,
                    Action::StopKeepAlive,
                    Action::CancelReconnect,
                    Action::ClearQueue,
                    Action::CloseGracefully,
                ],
            )
        }
        (Idle | Ended, Event::Connect) => {
            ctx.attempts += 1;
            ctx.item_activated = false;
            (
                Connecting,
                vec![
                    Action::OpenConnection {
                        attempt: ctx.attempts,
                    },
                    Action::ArmWatchdog,
                ],
            )
        }
        (Connecting, Event::Opened) => (AwaitingLogin, vec![]),
        (_, Event::Opened) => (phase, vec![Action::DiscardConnection]),
        (Connecting, Event::OpenFailed) => (
            Ended,
            vec![
                Action::CancelWatchdog,
                Action::ScheduleReconnect {
                    attempt: ctx.attempts,
                    cause: EndCause::OpenFailed,
                },
            ],
        ),
        (AwaitingLogin, Event::LoggedIn) => {
            ctx.attempts = 0;
            ctx.connected = true;
            (Active, vec![Action::CancelWatchdog, Action::StartKeepAlive])
        }
        (Active, Event::Spawned) if ctx.auto_activate_item && !ctx.item_activated => {
            ctx.item_activated = true;
            (Active, vec![Action::ActivateItem])
        }
        (Connecting | AwaitingLogin, Event::LoginTimeout) => {
            ctx.connected = false;
            (
                Ended,
                vec![
                    Action::CloseConnection,
                    Action::ClearQueue,
                    Action::ScheduleReconnect {
                        attempt: ctx.attempts,
                        cause: EndCause::LoginTimeout,
                    },
                ],
            )
        }
        (AwaitingLogin | Active, Event::Kicked | Event::TransportFault | Event::StreamEnd) => {
            ctx.connected = false;
            let cause = match event {
                Event::Kicked => EndCause::Kicked,
                Event::TransportFault => EndCause::TransportFault,
                _ => EndCause::StreamEnd,
            };
            let mut actions = vec![
                Action::CancelWatchdog,
                Action::StopKeepAlive,
                Action::ClearQueue,
            ];
            if cause != EndCause::StreamEnd {
                actions.push(Action::CloseConnection);
            }
            actions.push(Action::ScheduleReconnect {
                attempt: ctx.attempts,
                cause,
            });
            (Ended, actions)
        }
        _ => (phase, vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(events: &[Event], ctx: &mut Ctx) -> (Phase, Vec<Action>) {
        let mut phase = Phase::Idle;
        let mut all = Vec::new();
        for &event in events {
            let (next, actions) = step(phase, event, ctx);
            phase = next;
            all.extend(actions);
        }
        (phase, all)
    }

    fn reconnects(actions: &[Action]) -> Vec<(u32, EndCause)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::ScheduleReconnect { attempt, cause } => Some((*attempt, *cause)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_happy_path_reaches_active_and_resets_attempts() {
        let mut ctx = Ctx::new(false);
        let (phase, actions) = run(&[Event::Connect, Event::Opened, Event::LoggedIn], &mut ctx);
        assert_eq!(phase, Phase::Active);
        assert_eq!(ctx.attempts, 0);
        assert!(ctx.connected);
        assert_eq!(
            actions,
            vec![
                Action::OpenConnection { attempt: 1 },
                Action::ArmWatchdog,
                Action::CancelWatchdog,
                Action::StartKeepAlive,
            ]
        );
    }

    #[test]
    fn test_stream_end_schedules_one_reconnect_with_incremented_attempt() {
        let mut ctx = Ctx::new(false);
        let (phase, _) = run(&[Event::Connect, Event::Opened, Event::LoginTimeout], &mut ctx);
        assert_eq!(phase, Phase::Ended);
        let before = ctx.attempts;

        let (phase, actions) = run(&[Event::Connect, Event::Opened], &mut ctx);
        assert_eq!(phase, Phase::AwaitingLogin);
        assert!(actions.contains(&Action::OpenConnection { attempt: before + 1 }));

        let (phase, actions) = step(Phase::AwaitingLogin, Event::StreamEnd, &mut ctx);
        assert_eq!(phase, Phase::Ended);
        assert!(actions.contains(&Action::ClearQueue));
        assert_eq!(reconnects(&actions), vec![(before + 1, EndCause::StreamEnd)]);

        // Further terminal signals for the same connection are absorbed.
        let (phase, actions) = step(Phase::Ended, Event::StreamEnd, &mut ctx);
        assert_eq!(phase, Phase::Ended);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_active_end_after_login_uses_attempt_zero() {
        let mut ctx = Ctx::new(false);
        let (_, actions) = run(
            &[Event::Connect, Event::Opened, Event::LoggedIn, Event::Kicked],
            &mut ctx,
        );
        assert!(!ctx.connected);
        assert!(actions.contains(&Action::CloseConnection));
        assert_eq!(reconnects(&actions), vec![(0, EndCause::Kicked)]);
    }

    #[test]
    fn test_attempts_grow_across_failed_opens() {
        let mut ctx = Ctx::new(false);
        let (_, actions) = run(
            &[
                Event::Connect,
                Event::OpenFailed,
                Event::Connect,
                Event::OpenFailed,
                Event::Connect,
                Event::OpenFailed,
            ],
            &mut ctx,
        );
        let attempts: Vec<u32> = reconnects(&actions).into_iter().map(|(a, _)| a).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[test]
    fn test_watchdog_during_open_abandons_attempt() {
        let mut ctx = Ctx::new(false);
        let (phase, actions) = run(&[Event::Connect, Event::LoginTimeout], &mut ctx);
        assert_eq!(phase, Phase::Ended);
        assert_eq!(reconnects(&actions), vec![(1, EndCause::LoginTimeout)]);

        // The open completing late is discarded, not adopted.
        let (phase, actions) = step(phase, Event::Opened, &mut ctx);
        assert_eq!(phase, Phase::Ended);
        assert_eq!(actions, vec![Action::DiscardConnection]);
    }

    #[test]
    fn test_late_watchdog_after_login_is_ignored() {
        let mut ctx = Ctx::new(false);
        let (phase, _) = run(&[Event::Connect, Event::Opened, Event::LoggedIn], &mut ctx);
        let (phase, actions) = step(phase, Event::LoginTimeout, &mut ctx);
        assert_eq!(phase, Phase::Active);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_connect_while_connected_is_ignored() {
        let mut ctx = Ctx::new(false);
        let (phase, _) = run(&[Event::Connect, Event::Opened, Event::LoggedIn], &mut ctx);
        let (phase, actions) = step(phase, Event::Connect, &mut ctx);
        assert_eq!(phase, Phase::Active);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_item_activates_once_per_connection() {
        let mut ctx = Ctx::new(true);
        let (_, actions) = run(
            &[
                Event::Connect,
                Event::Opened,
                Event::LoggedIn,
                Event::Spawned,
                Event::Spawned,
            ],
            &mut ctx,
        );
        assert_eq!(
            actions.iter().filter(|a| **a == Action::ActivateItem).count(),
            1
        );

        let mut quiet = Ctx::new(false);
        let (_, actions) = run(
            &[Event::Connect, Event::Opened, Event::LoggedIn, Event::Spawned],
            &mut quiet,
        );
        assert!(!actions.contains(&Action::ActivateItem));
    }

    #[test]
    fn test_stop_is_terminal() {
        let mut ctx = Ctx::new(false);
        let (phase, _) = run(&[Event::Connect, Event::Opened, Event::LoggedIn], &mut ctx);
        let (phase, actions) = step(phase, Event::Stop, &mut ctx);
        assert_eq!(phase, Phase::Stopped);
        assert!(ctx.stopped);
        assert!(actions.contains(&Action::CloseGracefully));
        assert!(actions.contains(&Action::CancelReconnect));

        for event in [Event::Connect, Event::StreamEnd, Event::Stop, Event::LoggedIn] {
            let (next, actions) = step(phase, event, &mut ctx);
            assert_eq!(next, Phase::Stopped);
            assert!(actions.is_empty());
        }
        let (_, actions) = step(phase, Event::Opened, &mut ctx);
        assert_eq!(actions, vec![Action::DiscardConnection]);
    }
}
