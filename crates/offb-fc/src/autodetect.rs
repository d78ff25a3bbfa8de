use anyhow::Result;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::link::{probe_heartbeat, serial_url, LinkParams};

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub dev: String,
    pub baud: u32,
    pub hb_seen: bool,
    pub elapsed_ms: u64,
    pub note: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutodetectResult {
    pub chosen: Option<(String, u32)>,
    pub probes: Vec<ProbeResult>,
}

impl AutodetectResult {
    pub fn chosen_url(&self) -> Option<String> {
        self.chosen.as_ref().map(|(dev, baud)| serial_url(dev, *baud))
    }
}

pub fn default_candidate_devs() -> Vec<String> {
    vec![
        "/dev/ttyACM0".into(),
        "/dev/ttyACM1".into(),
        "/dev/ttyUSB0".into(),
        "/dev/ttyUSB1".into(),
        "/dev/serial0".into(),
        "/dev/ttyAMA0".into(),
        "/dev/ttyTHS1".into(),
    ]
}

/// PX4 TELEM ports default to 57600; USB and companion links usually run faster.
pub fn default_candidate_bauds() -> Vec<u32> {
    vec![57600, 115200, 921600]
}

/// Try every dev/baud pair until one yields an autopilot heartbeat.
///
/// A probe that opens but stays silent is not an error; it is recorded and the
/// next candidate is tried. Each probe closes its port before the next one
/// opens.
pub fn autodetect_fc(
    candidate_devs: &[String],
    candidate_bauds: &[u32],
    heartbeat_timeout: Duration,
    params: &LinkParams,
) -> Result<AutodetectResult> {
    let mut probes = Vec::new();

    for dev in candidate_devs {
        for &baud in candidate_bauds {
            let start = Instant::now();
            let (hb_seen, note) = match probe_heartbeat(&serial_url(dev, baud), params, heartbeat_timeout) {
                Ok(true) => (true, "heartbeat".to_string()),
                Ok(false) => (false, "no heartbeat".to_string()),
                Err(e) => {
                    warn!("fc autodetect probe failed dev={} baud={} err={:#}", dev, baud, e);
                    (false, format!("open failed: {:#}", e))
                }
            };

            probes.push(ProbeResult {
                dev: dev.clone(),
                baud,
                hb_seen,
                elapsed_ms: start.elapsed().as_millis() as u64,
                note,
            });
            if hb_seen {
                info!("fc autodetect: OK {} @ {}", dev, baud);
                return Ok(AutodetectResult { chosen: Some((dev.clone(), baud)), probes });
            }
        }
    }

    Ok(AutodetectResult { chosen: None, probes })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chosen_url_is_serial() {
        let res = AutodetectResult { chosen: Some(("/dev/ttyACM0".into(), 57600)), probes: vec![] };
        assert_eq!(res.chosen_url().as_deref(), Some("serial:/dev/ttyACM0:57600"));
        assert_eq!(AutodetectResult { chosen: None, probes: vec![] }.chosen_url(), None);
    }

    #[test]
    fn missing_devices_are_recorded_not_fatal() {
        let params = LinkParams {
            sys_id: 1,
            comp_id: 191,
            target_sys: 1,
            target_comp: 1,
            ack_timeout: Duration::from_millis(250),
            heartbeat_interval: Duration::from_secs(1),
        };
        let devs = vec!["/dev/offb-does-not-exist".to_string()];
        let res = autodetect_fc(&devs, &[57600, 115200], Duration::from_millis(50), &params).unwrap();
        assert!(res.chosen.is_none());
        assert_eq!(res.probes.len(), 2);
        assert!(res.probes.iter().all(|p| !p.hb_seen && p.note.starts_with("open failed")));
    }
}
