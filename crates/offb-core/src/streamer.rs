use tracing::{debug, warn};

use crate::command::CommandSink;
use crate::types::Setpoint;

/// Publish-side link health as seen by the streamer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishHealth {
    pub published: u64,
    pub failed: u64,
    pub consecutive_failures: u32,
}

/// Keeps the autopilot's offboard watchdog fed: one setpoint per tick, no
/// matter what the arbiter is doing.
pub struct SetpointStreamer {
    health: PublishHealth,
    degraded_after: u32,
}

impl SetpointStreamer {
    pub fn new(degraded_after: u32) -> Self {
        Self { health: PublishHealth::default(), degraded_after: degraded_after.max(1) }
    }

    /// Publish `setpoint`. Failures are counted, never propagated.
    pub fn tick<C: CommandSink + ?Sized>(&mut self, sink: &mut C, setpoint: &Setpoint) {
        match sink.publish_setpoint(setpoint) {
            Ok(()) => {
                if self.health.consecutive_failures >= self.degraded_after {
                    debug!("streamer: publish recovered after {} failures", self.health.consecutive_failures);
                }
                self.health.published += 1;
                self.health.consecutive_failures = 0;
            }
            Err(e) => {
                self.health.failed += 1;
                self.health.consecutive_failures = self.health.consecutive_failures.saturating_add(1);
                // one line when the link goes bad, not one per tick
                if self.health.consecutive_failures == 1 || self.health.consecutive_failures == self.degraded_after {
                    warn!("streamer: {} (consecutive={})", e, self.health.consecutive_failures);
                }
            }
        }
    }

    /// Attempts so far, successful or not.
    pub fn attempts(&self) -> u64 {
        self.health.published + self.health.failed
    }

    pub fn health(&self) -> &PublishHealth {
        &self.health
    }

    pub fn link_degraded(&self) -> bool {
        self.health.consecutive_failures >= self.degraded_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{OffboardError, Result};
    use crate::types::{CommandOutcome, FlightMode};

    struct FlakySink {
        fail: bool,
        seen: Vec<Setpoint>,
    }

    impl CommandSink for FlakySink {
        fn set_mode(&mut self, _mode: FlightMode) -> Result<CommandOutcome> {
            Ok(CommandOutcome::Accepted)
        }

        fn arm(&mut self, _arm: bool) -> Result<CommandOutcome> {
            Ok(CommandOutcome::Accepted)
        }

        fn publish_setpoint(&mut self, setpoint: &Setpoint) -> Result<()> {
            if self.fail {
                return Err(OffboardError::PublishFailed("link down".into()));
            }
            self.seen.push(*setpoint);
            Ok(())
        }
    }

    #[test]
    fn publishes_the_given_setpoint() {
        let mut sink = FlakySink { fail: false, seen: Vec::new() };
        let mut st = SetpointStreamer::new(3);
        let sp = Setpoint::position(100.0, 100.0, 0.0);
        st.tick(&mut sink, &sp);
        st.tick(&mut sink, &sp);
        assert_eq!(sink.seen, vec![sp, sp]);
        assert_eq!(st.health().published, 2);
        assert_eq!(st.attempts(), 2);
    }

    #[test]
    fn failures_degrade_then_recover() {
        let mut sink = FlakySink { fail: true, seen: Vec::new() };
        let mut st = SetpointStreamer::new(3);
        let sp = Setpoint::velocity(1.0, 0.0, 0.0);

        st.tick(&mut sink, &sp);
        st.tick(&mut sink, &sp);
        assert!(!st.link_degraded());
        st.tick(&mut sink, &sp);
        assert!(st.link_degraded());
        assert_eq!(st.attempts(), 3);

        sink.fail = false;
        st.tick(&mut sink, &sp);
        assert!(!st.link_degraded());
        assert_eq!(st.health(), &PublishHealth { published: 1, failed: 3, consecutive_failures: 0 });
    }

    #[test]
    fn zero_threshold_is_clamped() {
        let st = SetpointStreamer::new(0);
        assert!(!st.link_degraded());
    }
}
