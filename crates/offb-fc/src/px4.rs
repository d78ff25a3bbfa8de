//! PX4 custom-mode word <-> `FlightMode`.
//!
//! PX4 packs its mode into HEARTBEAT.custom_mode: main mode in bits 16..24,
//! sub mode in bits 24..32.

use offb_core::types::{AutoMode, FlightMode};

pub const MAIN_MANUAL: u8 = 1;
pub const MAIN_ALTCTL: u8 = 2;
pub const MAIN_POSCTL: u8 = 3;
pub const MAIN_AUTO: u8 = 4;
pub const MAIN_ACRO: u8 = 5;
pub const MAIN_OFFBOARD: u8 = 6;
pub const MAIN_STABILIZED: u8 = 7;
pub const MAIN_RATTITUDE: u8 = 8;

const AUTO_READY: u8 = 1;
const AUTO_TAKEOFF: u8 = 2;
const AUTO_LOITER: u8 = 3;
const AUTO_MISSION: u8 = 4;
const AUTO_RTL: u8 = 5;
const AUTO_LAND: u8 = 6;
const AUTO_FOLLOW_TARGET: u8 = 8;
const AUTO_PRECLAND: u8 = 9;

pub fn split(custom_mode: u32) -> (u8, u8) {
    (((custom_mode >> 16) & 0xff) as u8, ((custom_mode >> 24) & 0xff) as u8)
}

pub fn join(main: u8, sub: u8) -> u32 {
    (u32::from(main) << 16) | (u32::from(sub) << 24)
}

pub fn decode(custom_mode: u32) -> FlightMode {
    let (main, sub) = split(custom_mode);
    match main {
        MAIN_MANUAL => FlightMode::Manual,
        MAIN_ALTCTL => FlightMode::Altitude,
        MAIN_POSCTL => FlightMode::Position,
        MAIN_AUTO => FlightMode::Auto(match sub {
            AUTO_READY => AutoMode::Ready,
            AUTO_TAKEOFF => AutoMode::Takeoff,
            AUTO_LOITER => AutoMode::Loiter,
            AUTO_MISSION => AutoMode::Mission,
            AUTO_RTL => AutoMode::Rtl,
            AUTO_LAND => AutoMode::Land,
            AUTO_FOLLOW_TARGET => AutoMode::FollowTarget,
            AUTO_PRECLAND => AutoMode::Precland,
            n => AutoMode::Other(n),
        }),
        MAIN_ACRO => FlightMode::Acro,
        MAIN_OFFBOARD => FlightMode::Offboard,
        MAIN_STABILIZED => FlightMode::Stabilized,
        MAIN_RATTITUDE => FlightMode::Rattitude,
        _ => FlightMode::Unknown(custom_mode),
    }
}

/// (main, sub) to put in MAV_CMD_DO_SET_MODE param2/param3.
/// `None` for modes we cannot request.
pub fn encode(mode: FlightMode) -> Option<(u8, u8)> {
    let pair = match mode {
        FlightMode::Manual => (MAIN_MANUAL, 0),
        FlightMode::Altitude => (MAIN_ALTCTL, 0),
        FlightMode::Position => (MAIN_POSCTL, 0),
        FlightMode::Acro => (MAIN_ACRO, 0),
        FlightMode::Offboard => (MAIN_OFFBOARD, 0),
        FlightMode::Stabilized => (MAIN_STABILIZED, 0),
        FlightMode::Rattitude => (MAIN_RATTITUDE, 0),
        FlightMode::Auto(sub) => (
            MAIN_AUTO,
            match sub {
                AutoMode::Ready => AUTO_READY,
                AutoMode::Takeoff => AUTO_TAKEOFF,
                AutoMode::Loiter => AUTO_LOITER,
                AutoMode::Mission => AUTO_MISSION,
                AutoMode::Rtl => AUTO_RTL,
                AutoMode::Land => AUTO_LAND,
                AutoMode::FollowTarget => AUTO_FOLLOW_TARGET,
                AutoMode::Precland => AUTO_PRECLAND,
                AutoMode::Other(n) => n,
            },
        ),
        FlightMode::Unknown(_) => return None,
    };
    Some(pair)
}
