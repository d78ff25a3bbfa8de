use anyhow::{ensure, Result};

use offb_core::SupervisorConfig;

use crate::link::parse_serial_url;
use crate::{Backend, FcConfig};

/// A command round trip blocks the control loop, so it must stay well inside
/// the autopilot's offboard-loss timeout.
pub const MAX_ACK_TIMEOUT_MS: u64 = 1_000;

pub fn check_fc(fc: &FcConfig, control: &SupervisorConfig) -> Result<()> {
    ensure!(fc.ack_timeout_ms > 0, "fc.ack_timeout_ms must be > 0");
    ensure!(
        fc.ack_timeout_ms < control.cooldown_ms && fc.ack_timeout_ms <= MAX_ACK_TIMEOUT_MS,
        "fc.ack_timeout_ms={} must be below control.cooldown_ms={} and at most {}",
        fc.ack_timeout_ms,
        control.cooldown_ms,
        MAX_ACK_TIMEOUT_MS
    );
    ensure!(
        (0.2..=10.0).contains(&fc.send_heartbeat_hz),
        "fc.send_heartbeat_hz must be in [0.2, 10], got {}",
        fc.send_heartbeat_hz
    );
    ensure!(
        (fc.sys_id, fc.comp_id) != (fc.target_sys, fc.target_comp),
        "fc: our ids {}/{} collide with the autopilot's",
        fc.sys_id,
        fc.comp_id
    );

    if fc.backend == Backend::Sim {
        return Ok(());
    }

    match fc.static_url() {
        Some(url) => {
            if url.starts_with("serial:") {
                ensure!(parse_serial_url(&url).is_some(), "fc.url {} is not serial:<dev>:<baud>", url);
            }
        }
        None => {
            ensure!(fc.autodetect, "fc: set url, serial_dev+baud, or autodetect=true");
            let (devs, bauds) = fc.candidates();
            ensure!(!devs.is_empty() && !bauds.is_empty(), "fc: autodetect needs at least one candidate dev and baud");
            ensure!(fc.heartbeat_timeout_ms >= 100, "fc.heartbeat_timeout_ms too small to catch a 1 Hz heartbeat");
        }
    }
    Ok(())
}
