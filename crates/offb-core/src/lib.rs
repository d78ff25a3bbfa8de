pub mod arbiter;
pub mod command;
pub mod cooldown;
pub mod doctor;
pub mod error;
pub mod health;
pub mod sim;
pub mod streamer;
pub mod supervisor;
pub mod telemetry;
pub mod types;

pub use arbiter::{ArbiterState, ModeArbiter};
pub use command::CommandSink;
pub use error::OffboardError;
pub use supervisor::{RunSummary, Supervisor};
pub use telemetry::{ChannelTelemetry, TelemetryCache, TelemetrySource};
pub use types::{CommandKind, CommandOutcome, FlightMode, Setpoint, Vec3, VehicleState};

use serde::Deserialize;
use std::time::Duration;

/// `[control]` section: loop timing and retry policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Control loop rate. Must stay well above the autopilot's 2 Hz floor.
    pub rate_hz: f32,

    /// Minimum spacing between two requests of the same kind.
    pub cooldown_ms: u64,

    /// Setpoints streamed before the first offboard request.
    pub warmup_setpoints: u32,

    /// How long to wait for the first heartbeat. 0 waits forever.
    pub connect_timeout_ms: u64,

    /// Telemetry older than this counts as a lost connection.
    pub telemetry_timeout_ms: u64,

    /// Consecutive command or publish failures before health is degraded.
    pub degraded_after_failures: u32,

    pub health_log_interval_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            rate_hz: 20.0,
            cooldown_ms: 5_000,
            warmup_setpoints: 100,
            connect_timeout_ms: 0,
            telemetry_timeout_ms: 1_500,
            degraded_after_failures: 3,
            health_log_interval_ms: 5_000,
        }
    }
}

impl SupervisorConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.rate_hz.max(0.1)))
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }

    pub fn telemetry_timeout(&self) -> Duration {
        Duration::from_millis(self.telemetry_timeout_ms)
    }

    pub fn health_log_interval(&self) -> Duration {
        Duration::from_millis(self.health_log_interval_ms)
    }
}
