use serde::Serialize;

use crate::arbiter::ArbiterState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Ok,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeReason {
    /// No telemetry for longer than the configured timeout.
    TelemetryStale,
    /// Arm/mode requests keep failing or cannot reach the vehicle.
    CommandSinkUnavailable,
    /// Setpoint publishes keep failing.
    PublishFailing,
}

/// Point-in-time view of the control loop, for logs and external monitors.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub ts_unix_ms: i64,
    pub level: HealthLevel,
    pub reasons: Vec<DegradeReason>,
    pub arbiter: ArbiterState,
    pub connected: bool,
    pub armed: bool,
    pub mode: String,
    pub telemetry_age_ms: Option<u64>,
    pub ticks: u64,
    /// Control-loop publishes, matching `ticks` while the link is healthy.
    pub published: u64,
    pub publish_failures: u64,
    pub warmup_published: u64,
    pub consecutive_publish_failures: u32,
    pub consecutive_command_failures: u32,
    pub distance_to_target_m: Option<f32>,
}

impl HealthReport {
    pub fn is_degraded(&self) -> bool {
        self.level == HealthLevel::Degraded
    }
}

pub(crate) fn level_for(reasons: &[DegradeReason]) -> HealthLevel {
    if reasons.is_empty() { HealthLevel::Ok } else { HealthLevel::Degraded }
}

pub(crate) fn now_unix_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_reason_degrades() {
        assert_eq!(level_for(&[]), HealthLevel::Ok);
        assert_eq!(level_for(&[DegradeReason::PublishFailing]), HealthLevel::Degraded);
    }

    #[test]
    fn serializes_snake_case() {
        let r = HealthReport {
            ts_unix_ms: 1,
            level: HealthLevel::Degraded,
            reasons: vec![DegradeReason::TelemetryStale],
            arbiter: ArbiterState::AwaitingConnection,
            connected: false,
            armed: false,
            mode: "MANUAL".into(),
            telemetry_age_ms: Some(2000),
            ticks: 10,
            published: 10,
            publish_failures: 0,
            warmup_published: 100,
            consecutive_publish_failures: 0,
            consecutive_command_failures: 0,
            distance_to_target_m: None,
        };
        let s = serde_json::to_string(&r).unwrap();
        assert!(s.contains("\"level\":\"degraded\""));
        assert!(s.contains("\"telemetry_stale\""));
        assert!(s.contains("\"arbiter\":\"AwaitingConnection\""));
    }
}
