pub mod autodetect;
pub mod decode;
pub mod doctor;
pub mod link;
pub mod px4;

use std::time::Duration;

use anyhow::{bail, Result};
use serde::Deserialize;
use tracing::info;

use crate::autodetect::{autodetect_fc, default_candidate_bauds, default_candidate_devs};
use crate::link::{serial_url, LinkParams};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Mavlink,
    /// In-process simulated vehicle, no hardware needed.
    Sim,
}

/// `[fc]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FcConfig {
    pub backend: Backend,

    /// Any `mavlink::connect` address, e.g. "udpin:0.0.0.0:14540" for PX4 SITL.
    /// Takes precedence over everything below.
    pub url: Option<String>,

    /// Fixed serial port, used when `url` is unset.
    pub serial_dev: Option<String>,
    pub baud: Option<u32>,

    /// Probe candidate serial ports/bauds and pick the first that yields an
    /// autopilot HEARTBEAT.
    pub autodetect: bool,
    pub candidate_devs: Option<Vec<String>>,
    pub candidate_bauds: Option<Vec<u32>>,

    /// Heartbeat wait per probe attempt
    pub heartbeat_timeout_ms: u64,

    /// MAVLink ids we use (companion side). 191 is MAV_COMP_ID_ONBOARD_COMPUTER.
    pub sys_id: u8,
    pub comp_id: u8,

    /// Autopilot ids. PX4 defaults to 1/1.
    pub target_sys: u8,
    pub target_comp: u8,

    /// Longest wait for a COMMAND_ACK.
    pub ack_timeout_ms: u64,

    /// Companion heartbeat rate.
    pub send_heartbeat_hz: f32,

    /// Sim backend only: setpoints the vehicle must see before it accepts OFFBOARD.
    pub sim_offboard_min_setpoints: Option<u64>,
}

impl Default for FcConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Mavlink,
            url: None,
            serial_dev: None,
            baud: None,
            autodetect: false,
            candidate_devs: None,
            candidate_bauds: None,
            heartbeat_timeout_ms: 1_500,
            sys_id: 1,
            comp_id: 191,
            target_sys: 1,
            target_comp: 1,
            ack_timeout_ms: 250,
            send_heartbeat_hz: 1.0,
            sim_offboard_min_setpoints: None,
        }
    }
}

impl FcConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn link_params(&self) -> LinkParams {
        LinkParams {
            sys_id: self.sys_id,
            comp_id: self.comp_id,
            target_sys: self.target_sys,
            target_comp: self.target_comp,
            ack_timeout: self.ack_timeout(),
            heartbeat_interval: Duration::from_secs_f64(1.0 / f64::from(self.send_heartbeat_hz.max(0.1))),
        }
    }

    pub fn candidates(&self) -> (Vec<String>, Vec<u32>) {
        (
            self.candidate_devs.clone().unwrap_or_else(default_candidate_devs),
            self.candidate_bauds.clone().unwrap_or_else(default_candidate_bauds),
        )
    }

    /// The address to open without probing anything, if one is configured.
    pub fn static_url(&self) -> Option<String> {
        if let Some(url) = &self.url {
            return Some(url.clone());
        }
        match (&self.serial_dev, self.baud) {
            (Some(dev), Some(baud)) => Some(serial_url(dev, baud)),
            _ => None,
        }
    }

    /// Static address, or the result of a serial probe when `autodetect` is on.
    pub fn resolve_url(&self) -> Result<String> {
        if let Some(url) = self.static_url() {
            return Ok(url);
        }
        if !self.autodetect {
            bail!("fc: no url, no serial_dev/baud and autodetect=false");
        }

        let (devs, bauds) = self.candidates();
        let res = autodetect_fc(&devs, &bauds, self.heartbeat_timeout(), &self.link_params())?;
        match res.chosen_url() {
            Some(url) => {
                info!("FC: autodetected {}", url);
                Ok(url)
            }
            None => bail!("fc autodetect found no heartbeat on {} candidate(s)", res.probes.len()),
        }
    }
}
