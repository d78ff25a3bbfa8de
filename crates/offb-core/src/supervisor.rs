//! Fixed-rate control loop.
//!
//! One tick: drain telemetry, arbitrate, publish. The loop never stops
//! publishing because a command failed; the only thing that ends it is the
//! shutdown flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::arbiter::{ArbiterState, ArbiterTick, ModeArbiter};
use crate::command::CommandSink;
use crate::error::{OffboardError, Result};
use crate::health::{self, DegradeReason, HealthLevel, HealthReport};
use crate::streamer::{PublishHealth, SetpointStreamer};
use crate::telemetry::{TelemetryCache, TelemetrySource};
use crate::types::{Setpoint, VehicleState};
use crate::SupervisorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub arbiter: ArbiterTick,
    pub deliveries: usize,
    pub telemetry_stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// False if shutdown arrived before the first control tick.
    pub entered_main_loop: bool,
    pub warmup_published: u64,
    pub warmup_failures: u64,
    pub ticks: u64,
    /// Control-loop publishes only; warm-up is counted separately.
    pub published: u64,
    pub publish_failures: u64,
    pub requests_issued: u64,
    pub final_state: ArbiterState,
}

pub struct Supervisor<T, C> {
    cfg: SupervisorConfig,
    telemetry: T,
    sink: C,
    cache: TelemetryCache,
    arbiter: ModeArbiter,
    streamer: SetpointStreamer,
    setpoint: Setpoint,

    ticks: u64,
    /// Streamer counters at the end of warm-up.
    warmup: PublishHealth,
    entered_main_loop: bool,
    last_vehicle: VehicleState,
    last_now: Option<Instant>,
    telemetry_stale: bool,
    level: HealthLevel,
    last_health_log: Option<Instant>,
}

impl<T: TelemetrySource, C: CommandSink> Supervisor<T, C> {
    pub fn new(cfg: SupervisorConfig, telemetry: T, sink: C, setpoint: Setpoint) -> Self {
        Self {
            arbiter: ModeArbiter::new(cfg.cooldown()),
            streamer: SetpointStreamer::new(cfg.degraded_after_failures),
            cfg,
            telemetry,
            sink,
            cache: TelemetryCache::new(),
            setpoint,
            ticks: 0,
            warmup: PublishHealth::default(),
            entered_main_loop: false,
            last_vehicle: VehicleState::default(),
            last_now: None,
            telemetry_stale: false,
            level: HealthLevel::Ok,
            last_health_log: None,
        }
    }

    /// Shared handle on the vehicle-state cache.
    pub fn cache(&self) -> TelemetryCache {
        self.cache.clone()
    }

    pub fn setpoint(&self) -> Setpoint {
        self.setpoint
    }

    /// Replace the target. Takes effect on the next publish.
    pub fn set_setpoint(&mut self, setpoint: Setpoint) {
        self.setpoint = setpoint;
    }

    pub fn arbiter_state(&self) -> ArbiterState {
        self.arbiter.state()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn sink(&self) -> &C {
        &self.sink
    }

    /// One control period. Order matters: telemetry, then arbitration, then
    /// the publish, so a decision made now is reflected in this tick.
    pub fn tick(&mut self, now: Instant) -> TickReport {
        let deliveries = self.telemetry.drain_into(&self.cache);
        let mut vehicle = self.cache.read();

        let stale = vehicle.age(now).map(|a| a > self.cfg.telemetry_timeout()).unwrap_or(false);
        if stale != self.telemetry_stale {
            if stale {
                warn!("supervisor: telemetry stale (age {:?}), treating vehicle as disconnected", vehicle.age(now));
            } else {
                info!("supervisor: telemetry fresh again");
            }
            self.telemetry_stale = stale;
        }
        if stale {
            vehicle.connected = false;
        }

        let arbiter = self.arbiter.tick(now, &vehicle, &mut self.sink);
        self.streamer.tick(&mut self.sink, &self.setpoint);
        self.ticks += 1;

        self.last_vehicle = vehicle;
        self.last_now = Some(now);
        self.refresh_health(now);

        TickReport { arbiter, deliveries, telemetry_stale: stale }
    }

    pub fn health(&self) -> HealthReport {
        let v = &self.last_vehicle;
        let reasons = self.degrade_reasons();
        let (published, publish_failures) = self.loop_publishes();
        let publish = self.streamer.health();
        let distance_to_target_m = match (&self.setpoint, v.position) {
            (Setpoint::Position { target, .. }, Some(pos)) => Some(target.distance(&pos)),
            _ => None,
        };
        HealthReport {
            ts_unix_ms: health::now_unix_ms(),
            level: health::level_for(&reasons),
            reasons,
            arbiter: self.arbiter.state(),
            connected: v.connected,
            armed: v.armed,
            mode: v.mode.to_string(),
            telemetry_age_ms: self.last_now.and_then(|now| v.age(now)).map(|a| a.as_millis() as u64),
            ticks: self.ticks,
            published,
            publish_failures,
            warmup_published: self.warmup.published,
            consecutive_publish_failures: publish.consecutive_failures,
            consecutive_command_failures: self.arbiter.consecutive_failures(),
            distance_to_target_m,
        }
    }

    /// Block until the vehicle reports a fresh connection.
    ///
    /// Returns `Ok(false)` if shutdown was requested while waiting, and
    /// `ConnectionNotYetEstablished` once `connect_timeout` runs out (a zero
    /// timeout waits forever).
    pub fn wait_for_connection(&mut self, shutdown: &AtomicBool) -> Result<bool> {
        let start = Instant::now();
        let timeout = self.cfg.connect_timeout();
        let period = self.cfg.period();
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return Ok(false);
            }
            self.telemetry.drain_into(&self.cache);
            let now = Instant::now();
            let v = self.cache.read();
            let fresh = v.age(now).map(|a| a <= self.cfg.telemetry_timeout()).unwrap_or(false);
            if v.connected && fresh {
                info!("supervisor: vehicle connected after {:?} (mode={}, armed={})", start.elapsed(), v.mode, v.armed);
                return Ok(true);
            }
            if let Some(limit) = timeout {
                if start.elapsed() >= limit {
                    return Err(OffboardError::ConnectionNotYetEstablished { waited: start.elapsed() });
                }
            }
            thread::sleep(period);
        }
    }

    /// Pre-publish the configured number of setpoints at the loop rate. The
    /// autopilot refuses offboard until it has seen a stream for a while.
    pub fn warm_up(&mut self, shutdown: &AtomicBool) -> u64 {
        let n = self.cfg.warmup_setpoints;
        let period = self.cfg.period();
        info!("supervisor: warming up with {} setpoints ({:?})", n, period * n);
        let mut sent = 0;
        for _ in 0..n {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.telemetry.drain_into(&self.cache);
            self.streamer.tick(&mut self.sink, &self.setpoint);
            sent += 1;
            thread::sleep(period);
        }
        self.warmup = self.streamer.health().clone();
        sent
    }

    /// Connect, warm up, then tick at the configured rate until `shutdown`.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<RunSummary> {
        info!("supervisor: waiting for vehicle connection");
        if !self.wait_for_connection(shutdown)? {
            info!("supervisor: shutdown before connection");
            return Ok(self.summary());
        }
        self.warm_up(shutdown);

        let period = self.cfg.period();
        if !shutdown.load(Ordering::SeqCst) {
            info!("supervisor: entering control loop at {:.1} Hz", self.cfg.rate_hz);
        }

        let mut next = Instant::now();
        while !shutdown.load(Ordering::SeqCst) {
            self.entered_main_loop = true;
            self.tick(Instant::now());

            next += period;
            let after = Instant::now();
            if next > after {
                thread::sleep(next - after);
            } else {
                debug!("supervisor: tick overran by {:?}", after - next);
                next = after;
            }
        }

        let summary = self.summary();
        info!(
            "supervisor: stopped after {} ticks (published={}, failures={}, state={})",
            summary.ticks, summary.published, summary.publish_failures, summary.final_state
        );
        Ok(summary)
    }

    pub fn summary(&self) -> RunSummary {
        let (published, publish_failures) = self.loop_publishes();
        RunSummary {
            entered_main_loop: self.entered_main_loop,
            warmup_published: self.warmup.published,
            warmup_failures: self.warmup.failed,
            ticks: self.ticks,
            published,
            publish_failures,
            requests_issued: self.arbiter.requests_issued(),
            final_state: self.arbiter.state(),
        }
    }

    /// (published, failed) since warm-up ended.
    fn loop_publishes(&self) -> (u64, u64) {
        let p = self.streamer.health();
        (p.published.saturating_sub(self.warmup.published), p.failed.saturating_sub(self.warmup.failed))
    }

    fn degrade_reasons(&self) -> Vec<DegradeReason> {
        let mut reasons = Vec::new();
        if self.telemetry_stale {
            reasons.push(DegradeReason::TelemetryStale);
        }
        if self.arbiter.consecutive_failures() >= self.cfg.degraded_after_failures.max(1) {
            reasons.push(DegradeReason::CommandSinkUnavailable);
        }
        if self.streamer.link_degraded() {
            reasons.push(DegradeReason::PublishFailing);
        }
        reasons
    }

    fn refresh_health(&mut self, now: Instant) {
        let level = health::level_for(&self.degrade_reasons());
        let changed = level != self.level;
        let due = self
            .last_health_log
            .map(|t| now.saturating_duration_since(t) >= self.cfg.health_log_interval())
            .unwrap_or(true);
        if !changed && !due {
            return;
        }

        let report = self.health();
        if changed && level == HealthLevel::Degraded {
            warn!(reasons = ?report.reasons, arbiter = %report.arbiter, "supervisor: health degraded");
        } else if changed {
            info!(arbiter = %report.arbiter, "supervisor: health ok");
        } else {
            info!(
                level = ?report.level,
                arbiter = %report.arbiter,
                mode = %report.mode,
                armed = report.armed,
                ticks = report.ticks,
                published = report.published,
                "supervisor: health"
            );
        }
        self.level = level;
        self.last_health_log = Some(now);
    }
}
