use std::time::{Duration, Instant};

use crate::types::CommandKind;

/// Per-kind request cooldown. The first request of each kind is always
/// allowed; after that, same-kind requests must be `min_interval` apart.
#[derive(Debug, Clone)]
pub struct CommandCooldown {
    last_set_mode: Option<Instant>,
    last_arm: Option<Instant>,
    min_interval: Duration,
}

impl CommandCooldown {
    pub fn new(min_interval: Duration) -> Self {
        Self { last_set_mode: None, last_arm: None, min_interval }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn ready(&self, kind: CommandKind, now: Instant) -> bool {
        match self.last(kind) {
            Some(t) => now.saturating_duration_since(t) >= self.min_interval,
            None => true,
        }
    }

    /// Check and, if allowed, start a new window at `now`.
    pub fn allow(&mut self, kind: CommandKind, now: Instant) -> bool {
        if !self.ready(kind, now) {
            return false;
        }
        *self.slot(kind) = Some(now);
        true
    }

    pub fn last(&self, kind: CommandKind) -> Option<Instant> {
        match kind {
            CommandKind::SetMode => self.last_set_mode,
            CommandKind::Arm => self.last_arm,
        }
    }

    fn slot(&mut self, kind: CommandKind) -> &mut Option<Instant> {
        match kind {
            CommandKind::SetMode => &mut self.last_set_mode,
            CommandKind::Arm => &mut self.last_arm,
        }
    }
}
