use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use super::binding::BindingHandle;
use super::state::SessionState;
use crate::events::{BridgeEvent, EventSink};
use crate::hal::{DeviceControl, DeviceDescriptor, SessionArguments, WatchGuard};

/// Logical purpose of a session. Each role admits one active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Server,
    HotplugWatcher,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Server => "Server",
            Self::HotplugWatcher => "Hot-plug watcher",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Read-only view of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub role: Role,
    pub device_name: Option<String>,
    pub arguments: Option<SessionArguments>,
    pub state: SessionState,
    /// Whether `DeviceClose` went out for this session
    pub close_announced: bool,
    /// First failure recorded, kept after the session is stopped
    pub last_error: Option<String>,
}

/// Lets sample data through only while the session is `Open`.
///
/// Publishing happens under the read lock so that closing the gate orders
/// every earlier buffer before the `DeviceClose` that follows.
#[derive(Clone, Default)]
pub(crate) struct DataGate(Arc<RwLock<bool>>);

impl DataGate {
    pub(crate) fn open(&self) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = true;
    }

    pub(crate) fn close(&self) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = false;
    }

    pub(crate) fn forward(&self, sink: &EventSink, data: &[u8]) -> bool {
        let open = self.0.read().unwrap_or_else(|e| e.into_inner());
        if *open {
            sink.publish(BridgeEvent::data(data));
        }
        *open
    }
}

/// The radio session behind the server role
pub(crate) struct ServerSession {
    pub(crate) id: SessionId,
    pub(crate) descriptor: DeviceDescriptor,
    pub(crate) device: Arc<dyn DeviceControl>,
    pub(crate) arguments: SessionArguments,
    pub(crate) state: SessionState,
    pub(crate) binding: Option<BindingHandle>,
    pub(crate) gate: DataGate,
    /// The driver owns a worker that has not been told to close or
    /// reported closing
    pub(crate) driver_active: bool,
    pub(crate) close_announced: bool,
    pub(crate) last_error: Option<String>,
}

impl ServerSession {
    pub(crate) fn new(
        id: SessionId,
        descriptor: DeviceDescriptor,
        arguments: SessionArguments,
    ) -> Self {
        let device = descriptor.handle();
        Self {
            id,
            descriptor,
            device,
            arguments,
            state: SessionState::Binding,
            binding: None,
            gate: DataGate::default(),
            driver_active: false,
            close_announced: false,
            last_error: None,
        }
    }

    /// Move to `next`, logging illegal moves. Returns whether it happened.
    pub(crate) fn transition(&mut self, next: SessionState) -> bool {
        transition(Role::Server, self.id, &mut self.state, next)
    }

    pub(crate) fn record_error(&mut self, reason: &str) {
        if self.last_error.is_none() {
            self.last_error = Some(reason.to_string());
        }
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            role: Role::Server,
            device_name: Some(self.descriptor.display_name.clone()),
            arguments: Some(self.arguments),
            state: self.state.clone(),
            close_announced: self.close_announced,
            last_error: self.last_error.clone(),
        }
    }
}

/// The hot-plug monitoring session
pub(crate) struct WatcherSession {
    pub(crate) id: SessionId,
    pub(crate) state: SessionState,
    pub(crate) binding: Option<BindingHandle>,
    pub(crate) guard: Option<WatchGuard>,
    pub(crate) last_error: Option<String>,
}

impl WatcherSession {
    pub(crate) fn new(id: SessionId) -> Self {
        Self {
            id,
            state: SessionState::Binding,
            binding: None,
            guard: None,
            last_error: None,
        }
    }

    pub(crate) fn transition(&mut self, next: SessionState) -> bool {
        transition(Role::HotplugWatcher, self.id, &mut self.state, next)
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            role: Role::HotplugWatcher,
            device_name: None,
            arguments: None,
            state: self.state.clone(),
            close_announced: false,
            last_error: self.last_error.clone(),
        }
    }
}

fn transition(role: Role, id: SessionId, state: &mut SessionState, next: SessionState) -> bool {
    if !state.can_transition_to(&next) {
        warn!(
            "{} session {}: ignoring {} -> {}",
            role.label(),
            id,
            state.name(),
            next.name()
        );
        return false;
    }

    info!("{} session {}: {} -> {}", role.label(), id, state.name(), next.name());
    *state = next;
    true
}
