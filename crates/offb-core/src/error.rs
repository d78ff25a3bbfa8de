use std::time::Duration;

use thiserror::Error;

use crate::types::CommandKind;

/// Everything that can go wrong between the supervisor and the vehicle.
///
/// Only `ConnectionNotYetEstablished` ever escapes the supervisor; the rest
/// are logged, counted towards health and retried.
#[derive(Debug, Error)]
pub enum OffboardError {
    #[error("vehicle not connected after {waited:?}")]
    ConnectionNotYetEstablished { waited: Duration },

    #[error("{kind} request rejected by autopilot")]
    CommandRejected { kind: CommandKind },

    #[error("{kind} request timed out")]
    CommandTimedOut { kind: CommandKind },

    #[error("setpoint publish failed: {0}")]
    PublishFailed(String),

    #[error("command link unavailable: {0}")]
    Link(String),
}

pub type Result<T, E = OffboardError> = std::result::Result<T, E>;
