use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Local NED vector, metres or metres/second depending on context.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn distance(&self, other: &Vec3) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2) + (self.z - other.z).powi(2)).sqrt()
    }
}

/// Sub-modes of the autopilot's AUTO main mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoMode {
    Ready,
    Takeoff,
    Loiter,
    Mission,
    Rtl,
    Land,
    FollowTarget,
    Precland,
    Other(u8),
}

/// Flight mode reported by (or requested from) the autopilot.
///
/// Parsed once at the boundary; the rest of the crate compares variants,
/// never strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightMode {
    Manual,
    Altitude,
    Position,
    Acro,
    Stabilized,
    Rattitude,
    Offboard,
    Auto(AutoMode),
    /// Raw mode word we could not classify.
    Unknown(u32),
}

impl Default for FlightMode {
    fn default() -> Self {
        FlightMode::Unknown(0)
    }
}

impl FlightMode {
    pub fn is_offboard(&self) -> bool {
        matches!(self, FlightMode::Offboard)
    }

    /// Names accepted by `FromStr`, in the autopilot's own spelling.
    pub const NAMES: &'static [&'static str] = &[
        "MANUAL",
        "ALTCTL",
        "POSCTL",
        "ACRO",
        "STABILIZED",
        "RATTITUDE",
        "OFFBOARD",
        "AUTO.READY",
        "AUTO.TAKEOFF",
        "AUTO.LOITER",
        "AUTO.MISSION",
        "AUTO.RTL",
        "AUTO.LAND",
        "AUTO.FOLLOW_TARGET",
        "AUTO.PRECLAND",
    ];
}

impl fmt::Display for FlightMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlightMode::Manual => f.write_str("MANUAL"),
            FlightMode::Altitude => f.write_str("ALTCTL"),
            FlightMode::Position => f.write_str("POSCTL"),
            FlightMode::Acro => f.write_str("ACRO"),
            FlightMode::Stabilized => f.write_str("STABILIZED"),
            FlightMode::Rattitude => f.write_str("RATTITUDE"),
            FlightMode::Offboard => f.write_str("OFFBOARD"),
            FlightMode::Auto(sub) => match sub {
                AutoMode::Ready => f.write_str("AUTO.READY"),
                AutoMode::Takeoff => f.write_str("AUTO.TAKEOFF"),
                AutoMode::Loiter => f.write_str("AUTO.LOITER"),
                AutoMode::Mission => f.write_str("AUTO.MISSION"),
                AutoMode::Rtl => f.write_str("AUTO.RTL"),
                AutoMode::Land => f.write_str("AUTO.LAND"),
                AutoMode::FollowTarget => f.write_str("AUTO.FOLLOW_TARGET"),
                AutoMode::Precland => f.write_str("AUTO.PRECLAND"),
                AutoMode::Other(n) => write!(f, "AUTO.{}", n),
            },
            FlightMode::Unknown(raw) => write!(f, "UNKNOWN(0x{:08x})", raw),
        }
    }
}

impl FromStr for FlightMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mode = match s.trim().to_ascii_uppercase().as_str() {
            "MANUAL" => FlightMode::Manual,
            "ALTCTL" => FlightMode::Altitude,
            "POSCTL" => FlightMode::Position,
            "ACRO" => FlightMode::Acro,
            "STABILIZED" => FlightMode::Stabilized,
            "RATTITUDE" => FlightMode::Rattitude,
            "OFFBOARD" => FlightMode::Offboard,
            "AUTO.READY" => FlightMode::Auto(AutoMode::Ready),
            "AUTO.TAKEOFF" => FlightMode::Auto(AutoMode::Takeoff),
            "AUTO.LOITER" => FlightMode::Auto(AutoMode::Loiter),
            "AUTO.MISSION" => FlightMode::Auto(AutoMode::Mission),
            "AUTO.RTL" => FlightMode::Auto(AutoMode::Rtl),
            "AUTO.LAND" => FlightMode::Auto(AutoMode::Land),
            "AUTO.FOLLOW_TARGET" => FlightMode::Auto(AutoMode::FollowTarget),
            "AUTO.PRECLAND" => FlightMode::Auto(AutoMode::Precland),
            other => return Err(format!("unknown flight mode: {}", other)),
        };
        Ok(mode)
    }
}

/// Latest known vehicle state, as delivered by the telemetry source.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VehicleState {
    pub connected: bool,
    pub armed: bool,
    pub mode: FlightMode,
    /// Local NED position, when the autopilot reports one.
    pub position: Option<Vec3>,
    /// When this snapshot was produced. `None` until the first delivery.
    pub stamp: Option<Instant>,
}

impl VehicleState {
    /// Age of the snapshot relative to `now`. `None` if never stamped.
    pub fn age(&self, now: Instant) -> Option<std::time::Duration> {
        self.stamp.map(|t| now.saturating_duration_since(t))
    }
}

/// What the vehicle should track this tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Setpoint {
    Position { target: Vec3, yaw: Option<f32> },
    Velocity { target: Vec3, yaw: Option<f32> },
}

impl Setpoint {
    pub fn position(x: f32, y: f32, z: f32) -> Self {
        Setpoint::Position { target: Vec3::new(x, y, z), yaw: None }
    }

    pub fn velocity(vx: f32, vy: f32, vz: f32) -> Self {
        Setpoint::Velocity { target: Vec3::new(vx, vy, vz), yaw: None }
    }

    pub fn with_yaw(self, yaw_rad: f32) -> Self {
        match self {
            Setpoint::Position { target, .. } => Setpoint::Position { target, yaw: Some(yaw_rad) },
            Setpoint::Velocity { target, .. } => Setpoint::Velocity { target, yaw: Some(yaw_rad) },
        }
    }

    pub fn yaw(&self) -> Option<f32> {
        match self {
            Setpoint::Position { yaw, .. } | Setpoint::Velocity { yaw, .. } => *yaw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CommandKind {
    SetMode,
    Arm,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::SetMode => f.write_str("set_mode"),
            CommandKind::Arm => f.write_str("arm"),
        }
    }
}

/// Result of one arm/mode request. Consumed by the arbiter in the same tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Accepted,
    Rejected,
    TimedOut,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_names_parse_back_to_themselves() {
        for name in FlightMode::NAMES {
            let mode: FlightMode = name.parse().unwrap();
            assert_eq!(mode.to_string(), *name);
        }
    }

    #[test]
    fn mode_parse_is_case_insensitive() {
        assert_eq!("offboard".parse::<FlightMode>().unwrap(), FlightMode::Offboard);
        assert_eq!(" auto.loiter ".parse::<FlightMode>().unwrap(), FlightMode::Auto(AutoMode::Loiter));
    }

    #[test]
    fn unknown_mode_name_is_an_error() {
        assert!("WARP".parse::<FlightMode>().is_err());
    }

    #[test]
    fn default_state_is_disconnected_and_unstamped() {
        let st = VehicleState::default();
        assert!(!st.connected);
        assert!(!st.armed);
        assert!(!st.mode.is_offboard());
        assert!(st.stamp.is_none());
        assert!(st.age(Instant::now()).is_none());
    }

    #[test]
    fn with_yaw_keeps_target() {
        let sp = Setpoint::position(1.0, 2.0, -3.0).with_yaw(1.57);
        assert_eq!(sp, Setpoint::Position { target: Vec3::new(1.0, 2.0, -3.0), yaw: Some(1.57) });
        assert_eq!(sp.yaw(), Some(1.57));
    }
}
