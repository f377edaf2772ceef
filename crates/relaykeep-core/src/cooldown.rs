use std::collections::HashMap;
use tokio::time::{Duration, Instant};

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct CooldownKey {
    pub session: String,
    pub sender: String,
}

impl CooldownKey {
    pub fn new(session: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            sender: sender.into(),
        }
    }
}

/// Last-action timestamps per (session, sender).
///
/// This is a memory-bounded cache: losing an entry early only shortens a
/// rate limit, it never grants access.
#[derive(Debug, Default)]
pub struct CooldownTracker {
    last_seen: HashMap<CooldownKey, Instant>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_on_cooldown(&self, key: &CooldownKey, window: Duration) -> bool {
        self.is_on_cooldown_at(key, window, Instant::now())
    }

    pub fn is_on_cooldown_at(&self, key: &CooldownKey, window: Duration, now: Instant) -> bool {
        match self.last_seen.get(key) {
            Some(&at) => now.saturating_duration_since(at) < window,
            None => false,
        }
    }

    pub fn set_cooldown(&mut self, key: CooldownKey) {
        self.set_cooldown_at(key, Instant::now());
    }

    pub fn set_cooldown_at(&mut self, key: CooldownKey, now: Instant) {
        self.last_seen.insert(key, now);
    }

    pub fn clear(&mut self, key: &CooldownKey) {
        self.last_seen.remove(key);
    }

    /// Drops entries older than `max_age`; returns how many were removed.
    pub fn sweep(&mut self, max_age: Duration) -> usize {
        self.sweep_at(max_age, Instant::now())
    }

    pub fn sweep_at(&mut self, max_age: Duration, now: Instant) -> usize {
        let before = self.last_seen.len();
        self.last_seen
            .retain(|_, at| now.saturating_duration_since(*at) <= max_age);
        before - self.last_seen.len()
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}
