use std::time::Instant;

use mavlink::common::{MavMessage, MavModeFlag, MavType};
use mavlink::MavHeader;

use offb_core::types::{FlightMode, Vec3, VehicleState};

use crate::px4;

/// Folds the autopilot's message stream into whole `VehicleState` snapshots.
///
/// Only traffic from the target system/component counts. Every accepted
/// message yields a complete snapshot, never a partial field update.
#[derive(Debug, Clone)]
pub struct StateDecoder {
    target_sys: u8,
    target_comp: u8,
    state: VehicleState,
    heartbeats: u64,
}

impl StateDecoder {
    pub fn new(target_sys: u8, target_comp: u8) -> Self {
        Self { target_sys, target_comp, state: VehicleState::default(), heartbeats: 0 }
    }

    pub fn target_sys(&self) -> u8 {
        self.target_sys
    }

    pub fn heartbeats(&self) -> u64 {
        self.heartbeats
    }

    pub fn feed(&mut self, now: Instant, hdr: &MavHeader, msg: &MavMessage) -> Option<VehicleState> {
        if hdr.system_id != self.target_sys {
            return None;
        }
        match msg {
            MavMessage::HEARTBEAT(hb) => {
                if hdr.component_id != self.target_comp || hb.mavtype == MavType::MAV_TYPE_GCS {
                    return None;
                }
                self.heartbeats += 1;
                self.state.connected = true;
                self.state.armed = hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
                self.state.mode = if hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED) {
                    px4::decode(hb.custom_mode)
                } else {
                    FlightMode::Unknown(hb.custom_mode)
                };
            }
            MavMessage::LOCAL_POSITION_NED(p) => {
                self.state.position = Some(Vec3::new(p.x, p.y, p.z));
            }
            _ => return None,
        }
        self.state.stamp = Some(now);
        Some(self.state)
    }
}
