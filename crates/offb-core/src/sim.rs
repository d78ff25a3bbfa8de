//! In-process stand-in for an autopilot.
//!
//! Models just the rules the supervisor has to satisfy: offboard is only
//! accepted after a minimum number of setpoints, arming needs a connection,
//! and accepted changes show up in telemetry on the next drain. Operator
//! overrides and link faults can be injected from another thread.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tracing::debug;

use crate::command::CommandSink;
use crate::error::{OffboardError, Result};
use crate::telemetry::ChannelTelemetry;
use crate::types::{CommandKind, CommandOutcome, FlightMode, Setpoint, Vec3, VehicleState};

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Setpoints the vehicle must have seen before it accepts OFFBOARD.
    pub offboard_min_setpoints: u64,
    /// Fraction of the remaining distance covered per position setpoint.
    pub approach_gain: f32,
    pub start_connected: bool,
    pub start_mode: FlightMode,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            offboard_min_setpoints: 10,
            approach_gain: 0.05,
            start_connected: true,
            start_mode: FlightMode::Position,
        }
    }
}

struct SimInner {
    cfg: SimConfig,
    connected: bool,
    armed: bool,
    mode: FlightMode,
    position: Vec3,
    setpoints_seen: u64,
    reject_set_mode: u32,
    reject_arm: u32,
    drop_acks: bool,
    unreachable: bool,
    publish_failing: bool,
    tx: Sender<VehicleState>,
}

impl SimInner {
    fn emit(&self) {
        let snapshot = VehicleState {
            connected: self.connected,
            armed: self.armed,
            mode: self.mode,
            position: Some(self.position),
            stamp: Some(Instant::now()),
        };
        // receiver gone just means nobody is listening any more
        let _ = self.tx.send(snapshot);
    }
}

/// Handle on a simulated vehicle. Clones share the same vehicle.
#[derive(Clone)]
pub struct SimVehicle {
    inner: Arc<Mutex<SimInner>>,
}

impl SimVehicle {
    /// Create the vehicle and the telemetry source that observes it.
    pub fn new(cfg: SimConfig) -> (Self, ChannelTelemetry) {
        let (tx, rx) = mpsc::channel();
        let inner = SimInner {
            connected: cfg.start_connected,
            armed: false,
            mode: cfg.start_mode,
            position: Vec3::default(),
            setpoints_seen: 0,
            reject_set_mode: 0,
            reject_arm: 0,
            drop_acks: false,
            unreachable: false,
            publish_failing: false,
            cfg,
            tx,
        };
        inner.emit();
        (Self { inner: Arc::new(Mutex::new(inner)) }, ChannelTelemetry::new(rx))
    }

    fn lock(&self) -> MutexGuard<'_, SimInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> VehicleState {
        let s = self.lock();
        VehicleState { connected: s.connected, armed: s.armed, mode: s.mode, position: Some(s.position), stamp: None }
    }

    pub fn setpoints_received(&self) -> u64 {
        self.lock().setpoints_seen
    }

    pub fn set_connected(&self, connected: bool) {
        let mut s = self.lock();
        s.connected = connected;
        s.emit();
    }

    /// Mode switch from the RC transmitter or a GCS.
    pub fn operator_set_mode(&self, mode: FlightMode) {
        let mut s = self.lock();
        s.mode = mode;
        s.emit();
    }

    /// Failsafe or operator disarm.
    pub fn force_disarm(&self) {
        let mut s = self.lock();
        s.armed = false;
        s.emit();
    }

    /// Reject the next `n` requests of `kind`.
    pub fn reject_next(&self, kind: CommandKind, n: u32) {
        let mut s = self.lock();
        match kind {
            CommandKind::SetMode => s.reject_set_mode = n,
            CommandKind::Arm => s.reject_arm = n,
        }
    }

    /// Apply requests but never answer them.
    pub fn set_drop_acks(&self, drop: bool) {
        self.lock().drop_acks = drop;
    }

    /// Every call fails as if the transport were gone.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn set_publish_failing(&self, failing: bool) {
        self.lock().publish_failing = failing;
    }

    fn answer(s: &SimInner, accepted: bool) -> CommandOutcome {
        if s.drop_acks {
            CommandOutcome::TimedOut
        } else if accepted {
            CommandOutcome::Accepted
        } else {
            CommandOutcome::Rejected
        }
    }
}

impl CommandSink for SimVehicle {
    fn set_mode(&mut self, mode: FlightMode) -> Result<CommandOutcome> {
        let mut s = self.lock();
        if s.unreachable {
            return Err(OffboardError::Link("sim: unreachable".into()));
        }
        if !s.connected {
            return Ok(CommandOutcome::TimedOut);
        }
        if s.reject_set_mode > 0 {
            s.reject_set_mode -= 1;
            return Ok(Self::answer(&s, false));
        }
        if mode.is_offboard() && s.setpoints_seen < s.cfg.offboard_min_setpoints {
            debug!("sim: offboard refused, only {} setpoints seen", s.setpoints_seen);
            return Ok(Self::answer(&s, false));
        }
        s.mode = mode;
        s.emit();
        Ok(Self::answer(&s, true))
    }

    fn arm(&mut self, arm: bool) -> Result<CommandOutcome> {
        let mut s = self.lock();
        if s.unreachable {
            return Err(OffboardError::Link("sim: unreachable".into()));
        }
        if !s.connected {
            return Ok(CommandOutcome::TimedOut);
        }
        if s.reject_arm > 0 {
            s.reject_arm -= 1;
            return Ok(Self::answer(&s, false));
        }
        s.armed = arm;
        s.emit();
        Ok(Self::answer(&s, true))
    }

    fn publish_setpoint(&mut self, setpoint: &Setpoint) -> Result<()> {
        let mut s = self.lock();
        if s.unreachable || s.publish_failing {
            return Err(OffboardError::PublishFailed("sim: link down".into()));
        }
        if !s.connected {
            return Ok(());
        }
        s.setpoints_seen += 1;

        if s.armed && s.mode.is_offboard() {
            let gain = s.cfg.approach_gain;
            let p = s.position;
            s.position = match setpoint {
                Setpoint::Position { target, .. } => Vec3::new(
                    p.x + (target.x - p.x) * gain,
                    p.y + (target.y - p.y) * gain,
                    p.z + (target.z - p.z) * gain,
                ),
                Setpoint::Velocity { target, .. } => Vec3::new(p.x + target.x * gain, p.y + target.y * gain, p.z + target.z * gain),
            };
        }
        // stands in for the autopilot's own periodic HEARTBEAT/position stream
        s.emit();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{TelemetryCache, TelemetrySource};

    #[test]
    fn initial_snapshot_is_delivered() {
        let (_sim, mut tel) = SimVehicle::new(SimConfig::default());
        let cache = TelemetryCache::new();
        assert_eq!(tel.drain_into(&cache), 1);
        let st = cache.read();
        assert!(st.connected);
        assert_eq!(st.mode, FlightMode::Position);
    }

    #[test]
    fn offboard_needs_setpoint_stream_first() {
        let (mut sim, _tel) = SimVehicle::new(SimConfig { offboard_min_setpoints: 3, ..SimConfig::default() });
        assert_eq!(sim.set_mode(FlightMode::Offboard).unwrap(), CommandOutcome::Rejected);
        for _ in 0..3 {
            sim.publish_setpoint(&Setpoint::position(0.0, 0.0, -2.0)).unwrap();
        }
        assert_eq!(sim.set_mode(FlightMode::Offboard).unwrap(), CommandOutcome::Accepted);
        assert_eq!(sim.state().mode, FlightMode::Offboard);
    }

    #[test]
    fn disconnected_vehicle_times_out_commands() {
        let (mut sim, _tel) = SimVehicle::new(SimConfig { start_connected: false, ..SimConfig::default() });
        assert_eq!(sim.arm(true).unwrap(), CommandOutcome::TimedOut);
        sim.publish_setpoint(&Setpoint::position(0.0, 0.0, 0.0)).unwrap();
        assert_eq!(sim.setpoints_received(), 0);
    }

    #[test]
    fn injected_faults() {
        let (mut sim, _tel) = SimVehicle::new(SimConfig::default());
        sim.reject_next(CommandKind::Arm, 1);
        assert_eq!(sim.arm(true).unwrap(), CommandOutcome::Rejected);
        assert_eq!(sim.arm(true).unwrap(), CommandOutcome::Accepted);
        assert!(sim.state().armed);
        assert_eq!(sim.arm(false).unwrap(), CommandOutcome::Accepted);
        assert!(!sim.state().armed);

        sim.set_drop_acks(true);
        assert_eq!(sim.arm(true).unwrap(), CommandOutcome::TimedOut);
        // applied anyway, just never acknowledged
        assert!(sim.state().armed);

        sim.set_unreachable(true);
        assert!(matches!(sim.arm(true), Err(OffboardError::Link(_))));
        assert!(matches!(sim.publish_setpoint(&Setpoint::position(0.0, 0.0, 0.0)), Err(OffboardError::PublishFailed(_))));
    }

    #[test]
    fn every_accepted_setpoint_refreshes_telemetry() {
        let (mut sim, mut tel) = SimVehicle::new(SimConfig::default());
        let cache = TelemetryCache::new();
        tel.drain_into(&cache);
        let first = cache.read().stamp.unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        sim.publish_setpoint(&Setpoint::position(0.0, 0.0, -2.0)).unwrap();
        assert_eq!(tel.drain_into(&cache), 1);
        assert!(cache.read().stamp.unwrap() > first);
        assert_eq!(cache.read().mode, FlightMode::Position);

        sim.set_connected(false);
        tel.drain_into(&cache);
        sim.publish_setpoint(&Setpoint::position(0.0, 0.0, -2.0)).unwrap();
        assert_eq!(tel.drain_into(&cache), 0);
    }

    #[test]
    fn vehicle_moves_toward_target_when_flying_offboard() {
        let (mut sim, _tel) = SimVehicle::new(SimConfig { offboard_min_setpoints: 0, approach_gain: 0.5, ..SimConfig::default() });
        sim.set_mode(FlightMode::Offboard).unwrap();
        sim.arm(true).unwrap();
        let sp = Setpoint::position(10.0, 0.0, 0.0);
        sim.publish_setpoint(&sp).unwrap();
        sim.publish_setpoint(&sp).unwrap();
        let p = sim.state().position.unwrap();
        assert!((p.x - 7.5).abs() < 1e-4);
    }
}
