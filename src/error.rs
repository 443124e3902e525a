use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::Role;

/// Errors surfaced to the issuer of a command.
///
/// Each variant maps to a stable `code()` so that callers on the far side of
/// the command channel can match on it without parsing messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("{} already active", role.label())]
    AlreadyActive { role: Role },

    #[error("{} not active", role.label())]
    NotActive { role: Role },

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("{0}")]
    UnexpectedFailure(String),
}

impl BridgeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotActive { role: Role::Server } => "1000",
            Self::AlreadyActive { role: Role::HotplugWatcher } => "1001",
            Self::NotActive { role: Role::HotplugWatcher } => "1002",
            Self::AlreadyActive { role: Role::Server } => "1003",
            Self::DeviceNotFound(_) => "1004",
            Self::UnsupportedOperation(_) => "unsupportedOperation",
            Self::UnexpectedFailure(_) => "generalException",
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::UnexpectedFailure(message.into())
    }

    pub fn to_wire(&self) -> WireError {
        WireError {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<DeviceError> for BridgeError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Unsupported(op) => Self::UnsupportedOperation(op.to_string()),
            other => Self::UnexpectedFailure(other.to_string()),
        }
    }
}

/// Serializable form of a [`BridgeError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

/// Errors reported by a concrete device driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("{0} is not supported by this device")]
    Unsupported(&'static str),

    #[error("device is not open")]
    NotOpen,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("device I/O failed: {0}")]
    Io(String),
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(BridgeError::NotActive { role: Role::Server }.code(), "1000");
        assert_eq!(
            BridgeError::AlreadyActive { role: Role::Server }.code(),
            "1003"
        );
        assert_eq!(
            BridgeError::AlreadyActive { role: Role::HotplugWatcher }.code(),
            "1001"
        );
        assert_eq!(BridgeError::DeviceNotFound("x".into()).code(), "1004");
    }

    #[test]
    fn test_device_error_mapping() {
        let err: BridgeError = DeviceError::Unsupported("setMargin").into();
        assert_eq!(err, BridgeError::UnsupportedOperation("setMargin".into()));

        let err: BridgeError = DeviceError::Io("pipe stalled".into()).into();
        assert_eq!(err.code(), "generalException");
        assert!(err.to_string().contains("pipe stalled"));
    }
}
