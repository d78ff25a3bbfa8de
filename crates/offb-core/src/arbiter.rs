//! Mode/arming arbitration.
//!
//! The arbiter keeps asserting the intended vehicle state (offboard, armed)
//! for as long as it runs. It never trusts a request outcome as proof: the
//! only confirmation is what telemetry reports on a later tick. Each tick
//! makes at most one state transition, then acts for the state it landed in.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::command::CommandSink;
use crate::cooldown::CommandCooldown;
use crate::error::OffboardError;
use crate::types::{CommandKind, CommandOutcome, FlightMode, VehicleState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArbiterState {
    AwaitingConnection,
    RequestingOffboard,
    RequestingArm,
    Nominal,
}

impl fmt::Display for ArbiterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArbiterState::AwaitingConnection => "awaiting-connection",
            ArbiterState::RequestingOffboard => "requesting-offboard",
            ArbiterState::RequestingArm => "requesting-arm",
            ArbiterState::Nominal => "nominal",
        };
        f.write_str(s)
    }
}

/// A request the arbiter sent this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssuedRequest {
    pub kind: CommandKind,
    pub at: Instant,
    /// `None` when the request never reached the vehicle.
    pub outcome: Option<CommandOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbiterTick {
    pub state: ArbiterState,
    pub previous: ArbiterState,
    pub request: Option<IssuedRequest>,
}

impl ArbiterTick {
    pub fn transitioned(&self) -> bool {
        self.state != self.previous
    }
}

pub struct ModeArbiter {
    state: ArbiterState,
    cooldown: CommandCooldown,
    consecutive_failures: u32,
    requests_issued: u64,
}

impl ModeArbiter {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            state: ArbiterState::AwaitingConnection,
            cooldown: CommandCooldown::new(cooldown),
            consecutive_failures: 0,
            requests_issued: 0,
        }
    }

    pub fn state(&self) -> ArbiterState {
        self.state
    }

    /// Failed requests (rejected, timed out or unreachable) since the last
    /// accepted one.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn requests_issued(&self) -> u64 {
        self.requests_issued
    }

    pub fn tick<C: CommandSink + ?Sized>(&mut self, now: Instant, vehicle: &VehicleState, sink: &mut C) -> ArbiterTick {
        let previous = self.state;
        self.state = next_state(previous, vehicle);
        if self.state != previous {
            info!("arbiter: {} -> {} (mode={}, armed={})", previous, self.state, vehicle.mode, vehicle.armed);
        }

        let request = match self.state {
            ArbiterState::RequestingOffboard if !vehicle.mode.is_offboard() => {
                self.request(CommandKind::SetMode, now, sink)
            }
            ArbiterState::RequestingArm if !vehicle.armed => self.request(CommandKind::Arm, now, sink),
            _ => None,
        };

        ArbiterTick { state: self.state, previous, request }
    }

    fn request<C: CommandSink + ?Sized>(&mut self, kind: CommandKind, now: Instant, sink: &mut C) -> Option<IssuedRequest> {
        if !self.cooldown.allow(kind, now) {
            return None;
        }
        self.requests_issued += 1;

        let res = match kind {
            CommandKind::SetMode => sink.set_mode(FlightMode::Offboard),
            CommandKind::Arm => sink.arm(true),
        };

        let outcome = match res {
            Ok(CommandOutcome::Accepted) => {
                self.consecutive_failures = 0;
                match kind {
                    CommandKind::SetMode => info!("arbiter: offboard request accepted, waiting for mode report"),
                    CommandKind::Arm => info!("arbiter: arm request accepted, waiting for armed report"),
                }
                Some(CommandOutcome::Accepted)
            }
            Ok(CommandOutcome::Rejected) => {
                self.note_failure(OffboardError::CommandRejected { kind });
                Some(CommandOutcome::Rejected)
            }
            Ok(CommandOutcome::TimedOut) => {
                self.note_failure(OffboardError::CommandTimedOut { kind });
                Some(CommandOutcome::TimedOut)
            }
            Err(e) => {
                self.note_failure(e);
                None
            }
        };

        Some(IssuedRequest { kind, at: now, outcome })
    }

    fn note_failure(&mut self, err: OffboardError) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        warn!(
            "arbiter: {} (failures={}, retry in {:?})",
            err,
            self.consecutive_failures,
            self.cooldown.min_interval()
        );
    }
}

fn next_state(state: ArbiterState, v: &VehicleState) -> ArbiterState {
    if !v.connected {
        return ArbiterState::AwaitingConnection;
    }
    let offboard = v.mode.is_offboard();
    match state {
        ArbiterState::AwaitingConnection => ArbiterState::RequestingOffboard,
        ArbiterState::RequestingOffboard => {
            if offboard { ArbiterState::RequestingArm } else { ArbiterState::RequestingOffboard }
        }
        ArbiterState::RequestingArm | ArbiterState::Nominal => {
            if !offboard { ArbiterState::RequestingOffboard }
            else if v.armed { ArbiterState::Nominal }
            else { ArbiterState::RequestingArm }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::types::Setpoint;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::VecDeque;

    const COOLDOWN: Duration = Duration::from_secs(5);

    /// Sink that answers from a script, then falls back to a default.
    struct ScriptedSink {
        script: VecDeque<Result<CommandOutcome>>,
        fallback: CommandOutcome,
        calls: Vec<CommandKind>,
    }

    impl ScriptedSink {
        fn accepting() -> Self {
            Self { script: VecDeque::new(), fallback: CommandOutcome::Accepted, calls: Vec::new() }
        }

        fn answering(fallback: CommandOutcome) -> Self {
            Self { script: VecDeque::new(), fallback, calls: Vec::new() }
        }

        fn next(&mut self) -> Result<CommandOutcome> {
            self.script.pop_front().unwrap_or(Ok(self.fallback))
        }
    }

    impl CommandSink for ScriptedSink {
        fn set_mode(&mut self, mode: FlightMode) -> Result<CommandOutcome> {
            assert_eq!(mode, FlightMode::Offboard);
            self.calls.push(CommandKind::SetMode);
            self.next()
        }

        fn arm(&mut self, arm: bool) -> Result<CommandOutcome> {
            assert!(arm);
            self.calls.push(CommandKind::Arm);
            self.next()
        }

        fn publish_setpoint(&mut self, _setpoint: &Setpoint) -> Result<()> {
            Ok(())
        }
    }

    fn vs(connected: bool, mode: FlightMode, armed: bool) -> VehicleState {
        VehicleState { connected, armed, mode, position: None, stamp: Some(Instant::now()) }
    }

    #[test]
    fn waits_while_disconnected() {
        let mut arb = ModeArbiter::new(COOLDOWN);
        let mut sink = ScriptedSink::accepting();
        let t0 = Instant::now();
        for i in 0..10 {
            let out = arb.tick(t0 + Duration::from_millis(50 * i), &vs(false, FlightMode::Manual, false), &mut sink);
            assert_eq!(out.state, ArbiterState::AwaitingConnection);
            assert!(out.request.is_none());
        }
        assert!(sink.calls.is_empty());
    }

    #[test]
    fn reaches_nominal_in_three_qualifying_ticks() {
        let mut arb = ModeArbiter::new(COOLDOWN);
        let mut sink = ScriptedSink::accepting();
        let t0 = Instant::now();
        let seq = [
            vs(false, FlightMode::Manual, false),
            vs(true, FlightMode::Manual, false),
            vs(true, FlightMode::Offboard, false),
            vs(true, FlightMode::Offboard, true),
        ];
        let states: Vec<_> = seq
            .iter()
            .enumerate()
            .map(|(i, v)| arb.tick(t0 + Duration::from_millis(50 * i as u64), v, &mut sink))
            .collect();

        assert_eq!(states[0].state, ArbiterState::AwaitingConnection);
        assert!(!states[0].transitioned());
        assert_eq!(states[1].state, ArbiterState::RequestingOffboard);
        assert_eq!(states[2].state, ArbiterState::RequestingArm);
        assert_eq!(states[3].state, ArbiterState::Nominal);
        assert_eq!(states.iter().filter(|t| t.transitioned()).count(), 3);
        assert_eq!(sink.calls, vec![CommandKind::SetMode, CommandKind::Arm]);
    }

    #[test]
    fn rejected_outcomes_do_not_change_transition_count() {
        let mut arb = ModeArbiter::new(COOLDOWN);
        let mut sink = ScriptedSink::accepting();
        sink.script.push_back(Ok(CommandOutcome::Rejected));
        sink.script.push_back(Ok(CommandOutcome::TimedOut));
        let t0 = Instant::now();

        let out = arb.tick(t0, &vs(true, FlightMode::Manual, false), &mut sink);
        assert_eq!(out.request.unwrap().outcome, Some(CommandOutcome::Rejected));
        assert_eq!(arb.consecutive_failures(), 1);

        // stays put; retried only after cooldown
        let out = arb.tick(t0 + Duration::from_secs(1), &vs(true, FlightMode::Manual, false), &mut sink);
        assert_eq!(out.state, ArbiterState::RequestingOffboard);
        assert!(out.request.is_none());

        let out = arb.tick(t0 + COOLDOWN, &vs(true, FlightMode::Manual, false), &mut sink);
        assert_eq!(out.request.unwrap().outcome, Some(CommandOutcome::TimedOut));
        assert_eq!(arb.consecutive_failures(), 2);

        let out = arb.tick(t0 + COOLDOWN * 2, &vs(true, FlightMode::Manual, false), &mut sink);
        assert_eq!(out.request.unwrap().outcome, Some(CommandOutcome::Accepted));
        assert_eq!(arb.consecutive_failures(), 0);

        let out = arb.tick(t0 + COOLDOWN * 2 + Duration::from_millis(50), &vs(true, FlightMode::Offboard, false), &mut sink);
        assert_eq!(out.state, ArbiterState::RequestingArm);
        let out = arb.tick(t0 + COOLDOWN * 2 + Duration::from_millis(100), &vs(true, FlightMode::Offboard, true), &mut sink);
        assert_eq!(out.state, ArbiterState::Nominal);
    }

    #[test]
    fn accepted_request_waits_for_telemetry_confirmation() {
        let mut arb = ModeArbiter::new(COOLDOWN);
        let mut sink = ScriptedSink::accepting();
        let t0 = Instant::now();
        arb.tick(t0, &vs(true, FlightMode::Manual, false), &mut sink);
        for i in 1..20 {
            let out = arb.tick(t0 + Duration::from_millis(50 * i), &vs(true, FlightMode::Manual, false), &mut sink);
            assert_eq!(out.state, ArbiterState::RequestingOffboard);
        }
        assert_eq!(sink.calls.len(), 1);
    }

    #[test]
    fn mode_flip_in_nominal_reasserts_offboard_next_tick() {
        let mut arb = ModeArbiter::new(COOLDOWN);
        let mut sink = ScriptedSink::accepting();
        let t0 = Instant::now();
        arb.tick(t0, &vs(true, FlightMode::Manual, false), &mut sink);
        arb.tick(t0 + Duration::from_millis(50), &vs(true, FlightMode::Offboard, false), &mut sink);
        arb.tick(t0 + Duration::from_millis(100), &vs(true, FlightMode::Offboard, true), &mut sink);
        assert_eq!(arb.state(), ArbiterState::Nominal);

        // operator override; cooldown from the first request has long passed
        let t = t0 + Duration::from_secs(10);
        let out = arb.tick(t, &vs(true, FlightMode::Manual, true), &mut sink);
        assert_eq!(out.state, ArbiterState::RequestingOffboard);
        assert_eq!(out.request.map(|r| r.kind), Some(CommandKind::SetMode));
    }

    #[test]
    fn disarm_in_nominal_reasserts_arm() {
        let mut arb = ModeArbiter::new(COOLDOWN);
        let mut sink = ScriptedSink::accepting();
        let t0 = Instant::now();
        arb.tick(t0, &vs(true, FlightMode::Offboard, true), &mut sink);
        arb.tick(t0, &vs(true, FlightMode::Offboard, true), &mut sink);
        arb.tick(t0, &vs(true, FlightMode::Offboard, true), &mut sink);
        assert_eq!(arb.state(), ArbiterState::Nominal);

        let out = arb.tick(t0 + Duration::from_millis(50), &vs(true, FlightMode::Offboard, false), &mut sink);
        assert_eq!(out.state, ArbiterState::RequestingArm);
        assert_eq!(out.request.map(|r| r.kind), Some(CommandKind::Arm));
    }

    #[test]
    fn losing_offboard_before_arming_goes_back() {
        let mut arb = ModeArbiter::new(COOLDOWN);
        let mut sink = ScriptedSink::accepting();
        let t0 = Instant::now();
        arb.tick(t0, &vs(true, FlightMode::Manual, false), &mut sink);
        arb.tick(t0, &vs(true, FlightMode::Offboard, false), &mut sink);
        assert_eq!(arb.state(), ArbiterState::RequestingArm);
        let out = arb.tick(t0, &vs(true, FlightMode::Position, false), &mut sink);
        assert_eq!(out.state, ArbiterState::RequestingOffboard);
    }

    #[test]
    fn connection_loss_resets_to_awaiting() {
        let mut arb = ModeArbiter::new(COOLDOWN);
        let mut sink = ScriptedSink::accepting();
        let t0 = Instant::now();
        for _ in 0..3 {
            arb.tick(t0, &vs(true, FlightMode::Offboard, true), &mut sink);
        }
        assert_eq!(arb.state(), ArbiterState::Nominal);
        let out = arb.tick(t0, &vs(false, FlightMode::Offboard, true), &mut sink);
        assert_eq!(out.state, ArbiterState::AwaitingConnection);
    }

    #[test]
    fn unreachable_sink_counts_as_failure() {
        let mut arb = ModeArbiter::new(COOLDOWN);
        let mut sink = ScriptedSink::accepting();
        sink.script.push_back(Err(OffboardError::Link("port gone".into())));
        let out = arb.tick(Instant::now(), &vs(true, FlightMode::Manual, false), &mut sink);
        let req = out.request.unwrap();
        assert_eq!(req.outcome, None);
        assert_eq!(arb.consecutive_failures(), 1);
        assert_eq!(out.state, ArbiterState::RequestingOffboard);
    }

    #[test]
    fn same_kind_requests_respect_cooldown_for_random_telemetry() {
        for seed in 0..20u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut arb = ModeArbiter::new(COOLDOWN);
            let mut sink = ScriptedSink::answering(CommandOutcome::Rejected);
            let t0 = Instant::now();
            let modes = [FlightMode::Manual, FlightMode::Offboard, FlightMode::Position];
            let mut last: [Option<Instant>; 2] = [None, None];

            for i in 0..2_000u64 {
                let now = t0 + Duration::from_millis(50 * i);
                let v = vs(rng.gen_bool(0.9), modes[rng.gen_range(0..modes.len())], rng.gen_bool(0.5));
                if rng.gen_bool(0.3) {
                    sink.fallback = CommandOutcome::Accepted;
                } else {
                    sink.fallback = CommandOutcome::Rejected;
                }
                let out = arb.tick(now, &v, &mut sink);
                if let Some(req) = out.request {
                    let idx = match req.kind {
                        CommandKind::SetMode => 0,
                        CommandKind::Arm => 1,
                    };
                    if let Some(prev) = last[idx] {
                        assert!(req.at - prev >= COOLDOWN, "seed {} kind {:?} gap {:?}", seed, req.kind, req.at - prev);
                    }
                    last[idx] = Some(req.at);
                }
            }
            assert!(arb.requests_issued() > 0);
        }
    }
}
