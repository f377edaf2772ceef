//! Sender authorization and per-sender cooldown for relay instructions.

use crate::config::{EngineConfig, SessionConfig, WILDCARD_SENDER};
use crate::cooldown::{CooldownKey, CooldownTracker};
use crate::parser::{command_verb, is_command, sanitize_payload, RelayInstruction};
use tokio::time::Duration;

const OPEN_VERB: &str = "/all";
const RESTRICT_VERB: &str = "/me";

pub const REPLY_OPENED: &str = "relay opened to everyone";
pub const REPLY_RESTRICTED: &str = "relay restricted to admin";
pub const REPLY_DENIED: &str = "you are not allowed to use this relay";
pub const REPLY_BLOCKED: &str = "command not permitted";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayDecision {
    OnCooldown,
    AdminOpened { reply: String },
    AdminRestricted { reply: String },
    /// Sender is not authorized. The reply is written straight to the
    /// connection, never queued.
    Denied { reply: String },
    Blocked { verb: String, reply: String },
    Execute { command: String },
    Chat { text: String },
}

pub fn whisper(to: &str, text: &str) -> String {
    format!("/msg {to} {text}")
}

/// Authorization state owned by one session. `allowed_sender` is the only
/// piece of configuration that changes at runtime.
#[derive(Debug)]
pub struct RelayPolicy {
    session: String,
    admin_user: String,
    allowed_sender: String,
    allowed_commands: Vec<String>,
    cooldown_window: Duration,
    max_command_length: usize,
    cooldowns: CooldownTracker,
}

impl RelayPolicy {
    pub fn new(config: &SessionConfig, engine: &EngineConfig) -> Self {
        Self {
            session: config.username.clone(),
            admin_user: config.admin_user.clone(),
            allowed_sender: config.allowed_sender().to_string(),
            allowed_commands: engine
                .allowed_commands
                .iter()
                .map(|c| c.to_lowercase())
                .collect(),
            cooldown_window: engine.command_cooldown(),
            max_command_length: engine.max_command_length,
            cooldowns: CooldownTracker::new(),
        }
    }

    pub fn allowed_sender(&self) -> &str {
        &self.allowed_sender
    }

    pub fn is_admin(&self, sender: &str) -> bool {
        sender.eq_ignore_ascii_case(&self.admin_user)
    }

    pub fn has_permission(&self, sender: &str) -> bool {
        self.allowed_sender == WILDCARD_SENDER || sender.eq_ignore_ascii_case(&self.allowed_sender)
    }

    pub fn is_allowed_verb(&self, verb: &str) -> bool {
        self.allowed_commands.iter().any(|c| c == verb)
    }

    pub fn decide(&mut self, instruction: &RelayInstruction) -> RelayDecision {
        let sender = instruction.sender.as_str();
        let payload = sanitize_payload(&instruction.payload, self.max_command_length);
        let key = CooldownKey::new(self.session.as_str(), sender);

        // Admin directives share the same cooldown as everything else.
        if self.cooldowns.is_on_cooldown(&key, self.cooldown_window) {
            return RelayDecision::OnCooldown;
        }
        self.cooldowns.set_cooldown(key);

        if self.is_admin(sender) {
            match payload.to_lowercase().as_str() {
                OPEN_VERB => {
                    self.allowed_sender = WILDCARD_SENDER.to_string();
                    return RelayDecision::AdminOpened {
                        reply: whisper(sender, REPLY_OPENED),
                    };
                }
                RESTRICT_VERB => {
                    self.allowed_sender = self.admin_user.clone();
                    return RelayDecision::AdminRestricted {
                        reply: whisper(sender, REPLY_RESTRICTED),
                    };
                }
                _ => {}
            }
        }

        if !self.has_permission(sender) {
            return RelayDecision::Denied {
                reply: whisper(sender, REPLY_DENIED),
            };
        }

        if !is_command(&payload) {
            return RelayDecision::Chat { text: payload };
        }
        let verb = command_verb(&payload);
        if !self.is_allowed_verb(&verb) {
            return RelayDecision::Blocked {
                verb,
                reply: whisper(sender, REPLY_BLOCKED),
            };
        }
        RelayDecision::Execute { command: payload }
    }

    pub fn sweep_cooldowns(&mut self, max_age: Duration) -> usize {
        self.cooldowns.sweep(max_age)
    }

    pub fn tracked_senders(&self) -> usize {
        self.cooldowns.len()
    }
}
