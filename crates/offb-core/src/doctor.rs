use anyhow::Result;

use crate::types::Setpoint;
use crate::SupervisorConfig;

/// Below this the autopilot drops out of offboard on its own.
pub const MIN_STREAM_RATE_HZ: f32 = 2.0;

pub fn check_control(cfg: &SupervisorConfig) -> Result<()> {
    anyhow::ensure!(cfg.rate_hz.is_finite(), "control.rate_hz must be a number");
    anyhow::ensure!(
        cfg.rate_hz > MIN_STREAM_RATE_HZ && cfg.rate_hz <= 250.0,
        "control.rate_hz must be in ({}, 250] Hz, got {}",
        MIN_STREAM_RATE_HZ,
        cfg.rate_hz
    );
    anyhow::ensure!(cfg.cooldown_ms >= 1000, "control.cooldown_ms too small; the autopilot needs time to process requests");
    anyhow::ensure!(
        cfg.period() * cfg.warmup_setpoints >= std::time::Duration::from_secs(1),
        "control.warmup_setpoints too low: warm-up should last at least 1s at {} Hz",
        cfg.rate_hz
    );
    anyhow::ensure!(
        cfg.telemetry_timeout_ms >= 2 * cfg.period().as_millis() as u64,
        "control.telemetry_timeout_ms must cover at least two control periods"
    );
    anyhow::ensure!(cfg.degraded_after_failures >= 1, "control.degraded_after_failures must be >= 1");
    Ok(())
}

pub fn check_setpoint(sp: &Setpoint) -> Result<()> {
    let (Setpoint::Position { target, yaw } | Setpoint::Velocity { target, yaw }) = sp;
    anyhow::ensure!(
        target.x.is_finite() && target.y.is_finite() && target.z.is_finite(),
        "setpoint contains a non-finite component"
    );
    if let Some(y) = yaw {
        anyhow::ensure!(y.is_finite(), "setpoint.yaw is not finite");
    }
    Ok(())
}
