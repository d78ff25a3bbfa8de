use crate::error::Result;
use crate::types::{CommandOutcome, FlightMode, Setpoint};

/// The autopilot's command interface, as seen by the control loop.
///
/// `set_mode` and `arm` are request/response and must return within a
/// bounded round trip; an `Err` means the request never reached the vehicle.
/// `publish_setpoint` is fire-and-forget.
pub trait CommandSink {
    fn set_mode(&mut self, mode: FlightMode) -> Result<CommandOutcome>;

    fn arm(&mut self, arm: bool) -> Result<CommandOutcome>;

    fn publish_setpoint(&mut self, setpoint: &Setpoint) -> Result<()>;
}

impl<C: CommandSink + ?Sized> CommandSink for &mut C {
    fn set_mode(&mut self, mode: FlightMode) -> Result<CommandOutcome> {
        (**self).set_mode(mode)
    }

    fn arm(&mut self, arm: bool) -> Result<CommandOutcome> {
        (**self).arm(arm)
    }

    fn publish_setpoint(&mut self, setpoint: &Setpoint) -> Result<()> {
        (**self).publish_setpoint(setpoint)
    }
}

impl<C: CommandSink + ?Sized> CommandSink for Box<C> {
    fn set_mode(&mut self, mode: FlightMode) -> Result<CommandOutcome> {
        (**self).set_mode(mode)
    }

    fn arm(&mut self, arm: bool) -> Result<CommandOutcome> {
        (**self).arm(arm)
    }

    fn publish_setpoint(&mut self, setpoint: &Setpoint) -> Result<()> {
        (**self).publish_setpoint(setpoint)
    }
}
