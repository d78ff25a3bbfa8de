use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mavlink::{
    common::{
        MavAutopilot, MavCmd, MavFrame, MavMessage, MavModeFlag, MavResult, MavState, MavType,
        PositionTargetTypemask, COMMAND_LONG_DATA, HEARTBEAT_DATA,
        SET_POSITION_TARGET_LOCAL_NED_DATA,
    },
    MavConnection, MavHeader,
};
use tracing::{debug, info, warn};

use offb_core::error::OffboardError;
use offb_core::telemetry::ChannelTelemetry;
use offb_core::types::{CommandOutcome, FlightMode, Setpoint, VehicleState};
use offb_core::CommandSink;

use crate::decode::StateDecoder;
use crate::px4;

type Conn = Arc<dyn MavConnection<MavMessage> + Send + Sync>;

/// COMMAND_ACK as routed from the reader to the sink: (command, result).
pub type Ack = (MavCmd, MavResult);

/// Addressing and timing for one autopilot link.
#[derive(Debug, Clone)]
pub struct LinkParams {
    pub sys_id: u8,
    pub comp_id: u8,
    pub target_sys: u8,
    pub target_comp: u8,
    pub ack_timeout: Duration,
    pub heartbeat_interval: Duration,
}

/// Stops the reader thread when dropped. The thread may linger until its
/// current blocking receive returns, so probing goes through
/// [`probe_heartbeat`] instead of a full link.
pub struct ReaderGuard {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // detach; joining could block on a silent link
        self.handle.take();
    }
}

pub struct FcLink {
    pub sink: MavCommandSink,
    pub telemetry: ChannelTelemetry,
    pub reader: ReaderGuard,
}

impl FcLink {
    /// Open `url` (any `mavlink::connect` address) and start the reader.
    pub fn open(url: &str, params: &LinkParams) -> Result<Self> {
        check_serial(url)?;
        let conn: Conn = Arc::from(connect(url)?);
        info!("FC: link open on {} (us {}/{}, target {}/{})", url, params.sys_id, params.comp_id, params.target_sys, params.target_comp);

        let (state_tx, state_rx) = mpsc::channel();
        let (ack_tx, ack_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));

        let handle = spawn_reader(
            conn.clone(),
            StateDecoder::new(params.target_sys, params.target_comp),
            state_tx,
            ack_tx,
            stop.clone(),
        )
        .context("spawn fc reader thread")?;

        Ok(Self {
            sink: MavCommandSink::new(conn, params, ack_rx),
            telemetry: ChannelTelemetry::new(state_rx),
            reader: ReaderGuard { stop, handle: Some(handle) },
        })
    }
}

fn spawn_reader(
    conn: Conn,
    mut decoder: StateDecoder,
    state_tx: Sender<VehicleState>,
    ack_tx: Sender<Ack>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<thread::JoinHandle<()>> {
    let target_sys = decoder.target_sys();
    thread::Builder::new().name("fc-reader".into()).spawn(move || {
        while !stop.load(Ordering::SeqCst) {
            match conn.recv() {
                Ok((hdr, msg)) => {
                    if let MavMessage::COMMAND_ACK(ack) = &msg {
                        if hdr.system_id == target_sys {
                            // sink gone is fine, acks just go nowhere
                            let _ = ack_tx.send((ack.command, ack.result));
                        }
                        continue;
                    }
                    if let Some(snapshot) = decoder.feed(Instant::now(), &hdr, &msg) {
                        if decoder.heartbeats() == 1 && snapshot.connected {
                            info!("FC: first heartbeat (mode={}, armed={})", snapshot.mode, snapshot.armed);
                        }
                        if state_tx.send(snapshot).is_err() {
                            debug!("FC: telemetry consumer gone, reader exiting");
                            break;
                        }
                    }
                }
                Err(e) => {
                    debug!("FC: recv error: {:?}", e);
                    // avoid a busy loop on a dead port
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
    })
}

/// Command side of the link: arm/mode requests with ack tracking, setpoint
/// stream, and the companion heartbeat.
pub struct MavCommandSink {
    conn: Conn,
    hdr: MavHeader,
    target_sys: u8,
    target_comp: u8,
    acks: Receiver<Ack>,
    ack_timeout: Duration,
    heartbeat_interval: Duration,
    last_heartbeat: Option<Instant>,
    boot: Instant,
}

impl MavCommandSink {
    fn new(conn: Conn, params: &LinkParams, acks: Receiver<Ack>) -> Self {
        Self {
            conn,
            hdr: MavHeader { system_id: params.sys_id, component_id: params.comp_id, sequence: 0 },
            target_sys: params.target_sys,
            target_comp: params.target_comp,
            acks,
            ack_timeout: params.ack_timeout,
            heartbeat_interval: params.heartbeat_interval,
            last_heartbeat: None,
            boot: Instant::now(),
        }
    }

    pub fn send_heartbeat(&mut self) -> Result<(), OffboardError> {
        let hb = HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_ONBOARD_CONTROLLER,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: MavModeFlag::empty(),
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        };
        self.send(MavMessage::HEARTBEAT(hb)).map_err(OffboardError::Link)
    }

    fn send(&mut self, msg: MavMessage) -> Result<(), String> {
        self.hdr.sequence = self.hdr.sequence.wrapping_add(1);
        self.conn
            .send(&self.hdr, &msg)
            .context("mavlink send")
            .map(|_| ())
            .map_err(|e| format!("{:#}", e))
    }

    fn command_long(&mut self, command: MavCmd, params: [f32; 7]) -> Result<CommandOutcome, OffboardError> {
        flush_acks(&self.acks);

        let cmd = COMMAND_LONG_DATA {
            target_system: self.target_sys,
            target_component: self.target_comp,
            command,
            confirmation: 0,
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            param5: params[4],
            param6: params[5],
            param7: params[6],
        };
        self.send(MavMessage::COMMAND_LONG(cmd)).map_err(OffboardError::Link)?;
        await_ack(&self.acks, command, self.ack_timeout)
    }

    fn heartbeat_due(&self, now: Instant) -> bool {
        self.last_heartbeat.map(|t| now.duration_since(t) >= self.heartbeat_interval).unwrap_or(true)
    }
}

impl CommandSink for MavCommandSink {
    fn set_mode(&mut self, mode: FlightMode) -> Result<CommandOutcome, OffboardError> {
        let (main, sub) = px4::encode(mode).ok_or_else(|| OffboardError::Link(format!("mode {} cannot be requested", mode)))?;
        info!("FC: requesting mode {}", mode);
        let base = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits() as f32;
        self.command_long(MavCmd::MAV_CMD_DO_SET_MODE, [base, f32::from(main), f32::from(sub), 0.0, 0.0, 0.0, 0.0])
    }

    fn arm(&mut self, arm: bool) -> Result<CommandOutcome, OffboardError> {
        info!("FC: requesting {}", if arm { "arm" } else { "disarm" });
        let p1 = if arm { 1.0 } else { 0.0 };
        self.command_long(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [p1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
    }

    fn publish_setpoint(&mut self, setpoint: &Setpoint) -> Result<(), OffboardError> {
        let now = Instant::now();
        if self.heartbeat_due(now) {
            if let Err(e) = self.send_heartbeat() {
                warn!("FC: companion heartbeat failed: {}", e);
            }
            self.last_heartbeat = Some(now);
        }

        let time_boot_ms = self.boot.elapsed().as_millis() as u32;
        let msg = setpoint_message(setpoint, time_boot_ms, self.target_sys, self.target_comp);
        self.send(MavMessage::SET_POSITION_TARGET_LOCAL_NED(msg)).map_err(OffboardError::PublishFailed)
    }
}

/// Fail early with a readable error instead of inside the codec.
fn check_serial(url: &str) -> Result<()> {
    if let Some((dev, baud)) = parse_serial_url(url) {
        let _ = tokio_serial::new(dev, baud)
            .timeout(Duration::from_millis(100))
            .open()
            .with_context(|| format!("open fc serial device {}", dev))?;
    }
    Ok(())
}

fn connect(url: &str) -> Result<Box<dyn MavConnection<MavMessage> + Send + Sync>> {
    mavlink::connect::<MavMessage>(url).with_context(|| format!("mavlink connect {}", url))
}

/// Drop acks left over from requests that already timed out.
pub fn flush_acks(acks: &Receiver<Ack>) -> usize {
    let mut n = 0;
    while acks.try_recv().is_ok() {
        n += 1;
    }
    n
}

/// Wait up to `timeout` for the final ack of `command`. Acks for other
/// commands are skipped; IN_PROGRESS keeps waiting within the same bound.
pub fn await_ack(acks: &Receiver<Ack>, command: MavCmd, timeout: Duration) -> Result<CommandOutcome, OffboardError> {
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Ok(CommandOutcome::TimedOut);
        }
        match acks.recv_timeout(left) {
            Ok((cmd, result)) if cmd == command => match classify_ack(result) {
                Some(outcome) => return Ok(outcome),
                None => debug!("FC: {:?} in progress", command),
            },
            Ok((other, _)) => debug!("FC: ignoring ack for {:?}", other),
            Err(RecvTimeoutError::Timeout) => return Ok(CommandOutcome::TimedOut),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(OffboardError::Link("fc reader stopped".into()));
            }
        }
    }
}

/// Open `url` without a reader thread and wait for an autopilot heartbeat.
/// The connection is closed before this returns, so the port is free for the
/// next probe or for the real link.
pub fn probe_heartbeat(url: &str, params: &LinkParams, timeout: Duration) -> Result<bool> {
    check_serial(url)?;
    let conn = connect(url)?;
    let mut decoder = StateDecoder::new(params.target_sys, params.target_comp);
    let seen = heartbeat_within(|| conn.recv().ok(), &mut decoder, timeout);
    drop(conn);
    Ok(seen)
}

/// Pull messages from `next` until the decoder reports a connected vehicle
/// or `timeout` runs out. `None` from `next` means nothing was read.
pub fn heartbeat_within<F>(mut next: F, decoder: &mut StateDecoder, timeout: Duration) -> bool
where
    F: FnMut() -> Option<(MavHeader, MavMessage)>,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        match next() {
            Some((hdr, msg)) => {
                if decoder.feed(Instant::now(), &hdr, &msg).map(|s| s.connected).unwrap_or(false) {
                    return true;
                }
            }
            None => thread::sleep(Duration::from_millis(25)),
        }
    }
    false
}

/// `None` means keep waiting.
pub fn classify_ack(result: MavResult) -> Option<CommandOutcome> {
    match result {
        MavResult::MAV_RESULT_ACCEPTED => Some(CommandOutcome::Accepted),
        MavResult::MAV_RESULT_IN_PROGRESS => None,
        _ => Some(CommandOutcome::Rejected),
    }
}

pub fn setpoint_message(sp: &Setpoint, time_boot_ms: u32, target_sys: u8, target_comp: u8) -> SET_POSITION_TARGET_LOCAL_NED_DATA {
    let accel = PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AX_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AY_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AZ_IGNORE;
    let pos = PositionTargetTypemask::POSITION_TARGET_TYPEMASK_X_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_Y_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_Z_IGNORE;
    let vel = PositionTargetTypemask::POSITION_TARGET_TYPEMASK_VX_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_VY_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_VZ_IGNORE;

    let mut mask = accel | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_RATE_IGNORE;
    let (mut x, mut y, mut z, mut vx, mut vy, mut vz) = (0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
    match sp {
        Setpoint::Position { target, .. } => {
            mask |= vel;
            (x, y, z) = (target.x, target.y, target.z);
        }
        Setpoint::Velocity { target, .. } => {
            mask |= pos;
            (vx, vy, vz) = (target.x, target.y, target.z);
        }
    }
    let yaw = match sp.yaw() {
        Some(yaw) => yaw,
        None => {
            mask |= PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_IGNORE;
            0.0
        }
    };

    SET_POSITION_TARGET_LOCAL_NED_DATA {
        time_boot_ms,
        target_system: target_sys,
        target_component: target_comp,
        coordinate_frame: MavFrame::MAV_FRAME_LOCAL_NED,
        type_mask: mask,
        x,
        y,
        z,
        vx,
        vy,
        vz,
        afx: 0.0,
        afy: 0.0,
        afz: 0.0,
        yaw,
        yaw_rate: 0.0,
    }
}

/// `serial:<dev>:<baud>` -> (dev, baud).
pub fn parse_serial_url(url: &str) -> Option<(&str, u32)> {
    let rest = url.strip_prefix("serial:")?;
    let (dev, baud) = rest.rsplit_once(':')?;
    Some((dev, baud.parse().ok()?))
}

pub fn serial_url(dev: &str, baud: u32) -> String {
    format!("serial:{}:{}", dev, baud)
}
