//! Inbound command surface.
//!
//! [`Dispatcher`] validates a named command, hands it to the control context
//! and waits for the outcome. Every failure comes back as a [`BridgeError`]
//! with a stable code; unknown names come back as
//! [`DispatchOutcome::NotImplemented`].

mod command;
mod router;

pub use command::Command;
pub(crate) use router::execute;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::engine::control::{ControlMessage, ControlSender};
use crate::engine::{Role, SessionSnapshot};
use crate::error::BridgeError;

/// Result of dispatching one command
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Success(Value),
    NotImplemented,
    Failure(BridgeError),
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// `None` for `NotImplemented`
    pub fn into_result(self) -> Option<Result<Value, BridgeError>> {
        match self {
            Self::Success(value) => Some(Ok(value)),
            Self::Failure(err) => Some(Err(err)),
            Self::NotImplemented => None,
        }
    }
}

/// Cloneable handle to the control context
#[derive(Clone)]
pub struct Dispatcher {
    control: ControlSender,
}

impl Dispatcher {
    pub(crate) fn new(control: ControlSender) -> Self {
        Self { control }
    }

    pub async fn dispatch(&self, name: &str, payload: Value) -> DispatchOutcome {
        let command = match Command::parse(name, &payload) {
            Ok(Some(command)) => command,
            Ok(None) => {
                debug!("{} is not implemented", name);
                return DispatchOutcome::NotImplemented;
            }
            Err(e) => return DispatchOutcome::Failure(e),
        };

        match self.send(command).await {
            Ok(value) => DispatchOutcome::Success(value),
            Err(e) => DispatchOutcome::Failure(e),
        }
    }

    /// Dispatch an already parsed command
    pub async fn send(&self, command: Command) -> Result<Value, BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(ControlMessage::Dispatch { command, reply })
            .map_err(|_| BridgeError::unexpected("bridge is shut down"))?;

        rx.await
            .map_err(|_| BridgeError::unexpected("control context dropped the command"))?
    }

    /// Current (or last retired) session for `role`
    pub async fn session_snapshot(&self, role: Role) -> Option<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.control.send(ControlMessage::Snapshot { role, reply }).ok()?;
        rx.await.ok().flatten()
    }
}
