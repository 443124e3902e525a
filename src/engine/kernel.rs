use anyhow::anyhow;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::binding::{BindingHandle, BindingHost};
use super::control::{ControlMessage, ControlSender, DriverSignal, SessionReporter};
use super::session::{Role, ServerSession, SessionId, SessionSnapshot, WatcherSession};
use super::state::SessionState;
use crate::error::{BridgeError, DeviceResult};
use crate::events::{BridgeEvent, EventSink};
use crate::hal::{DeviceControl, DeviceRegistry, HotplugNotifier, SessionArguments, UsbWatcher};

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run a device call, turning a panic into `UnexpectedFailure`
fn guarded<T>(op: &str, f: impl FnOnce() -> DeviceResult<T>) -> Result<T, BridgeError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result.map_err(BridgeError::from),
        Err(payload) => {
            let message = panic_message(&*payload);
            error!("{} panicked: {}", op, message);
            Err(BridgeError::unexpected(format!("{} failed: {}", op, message)))
        }
    }
}

/// Stop the driver and drop the binding. Safe to call more than once.
fn release_server(session: &mut ServerSession) {
    session.gate.close();
    if session.driver_active {
        session.driver_active = false;
        if let Err(e) = guarded("close", || session.device.close()) {
            warn!("Server session {}: close failed: {}", session.id, e);
        }
    }
    session.binding.take();
}

/// Emit `DeviceClose` unless this session already did
fn announce_close(session: &mut ServerSession, sink: &EventSink) {
    if !session.close_announced {
        session.close_announced = true;
        sink.publish(BridgeEvent::DeviceClose);
    }
}

/// Per-role session state machine.
///
/// Lives inside the control context; every method runs there, so state is
/// never mutated concurrently. Asynchronous work (binding acquisition,
/// driver workers) reports back through `ControlMessage`s tagged with the
/// session id, and reports for a session that no longer occupies its slot
/// are dropped.
pub struct SessionKernel {
    registry: Arc<DeviceRegistry>,
    sink: EventSink,
    bindings: Arc<dyn BindingHost>,
    usb_watcher: Arc<dyn UsbWatcher>,
    control: ControlSender,

    server: Option<ServerSession>,
    watcher: Option<WatcherSession>,
    retired_server: Option<SessionSnapshot>,
    retired_watcher: Option<SessionSnapshot>,
    next_id: u64,
}

impl SessionKernel {
    pub(crate) fn new(
        registry: Arc<DeviceRegistry>,
        sink: EventSink,
        bindings: Arc<dyn BindingHost>,
        usb_watcher: Arc<dyn UsbWatcher>,
        control: ControlSender,
    ) -> Self {
        Self {
            registry,
            sink,
            bindings,
            usb_watcher,
            control,
            server: None,
            watcher: None,
            retired_server: None,
            retired_watcher: None,
            next_id: 1,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    fn next_session_id(&mut self) -> SessionId {
        let id = SessionId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Current session for `role`, or the last one retired
    pub fn snapshot(&self, role: Role) -> Option<SessionSnapshot> {
        match role {
            Role::Server => self
                .server
                .as_ref()
                .map(|s| s.snapshot())
                .or_else(|| self.retired_server.clone()),
            Role::HotplugWatcher => self
                .watcher
                .as_ref()
                .map(|s| s.snapshot())
                .or_else(|| self.retired_watcher.clone()),
        }
    }

    pub fn is_active(&self, role: Role) -> bool {
        match role {
            Role::Server => self.server.is_some(),
            Role::HotplugWatcher => self.watcher.is_some(),
        }
    }

    fn spawn_acquire(&self, role: Role, session: SessionId) {
        let host = Arc::clone(&self.bindings);
        let control = self.control.clone();
        tokio::spawn(async move {
            // A panic in `acquire` comes back as a failed acquisition
            let result = match tokio::spawn(async move { host.acquire(role).await }).await {
                Ok(result) => result,
                Err(e) => {
                    error!("{} binding acquisition task failed: {}", role.label(), e);
                    Err(anyhow!("binding acquisition failed: {}", e))
                }
            };
            if control
                .send(ControlMessage::BindingReady { role, session, result })
                .is_err()
            {
                debug!("Control context gone, releasing {} binding", role.label());
            }
        });
    }

    fn watch_binding(&self, role: Role, session: SessionId, handle: &mut BindingHandle) {
        let Some(lost) = handle.take_lost_signal() else {
            return;
        };
        let control = self.control.clone();
        tokio::spawn(async move {
            // Err means the handle was released normally
            if lost.await.is_ok() {
                let _ = control.send(ControlMessage::BindingLost { role, session });
            }
        });
    }

    /// Admit a server session for `device_name`.
    ///
    /// Returns once the session is in `Binding`; opening continues
    /// asynchronously and ends in `DeviceOpen` or `DeviceClose`.
    pub async fn start_server(
        &mut self,
        device_name: &str,
        arguments: SessionArguments,
    ) -> Result<(), BridgeError> {
        if let Some(current) = &self.server {
            info!(
                "Rejecting start of {}: server session {} is {}",
                device_name,
                current.id,
                current.state.name()
            );
            return Err(BridgeError::AlreadyActive { role: Role::Server });
        }

        let descriptor = self
            .registry
            .find_by_name(device_name)
            .await
            .ok_or_else(|| BridgeError::DeviceNotFound(device_name.to_string()))?;

        let id = self.next_session_id();
        info!(
            "Starting server session {} on {} (provider {}, {:?})",
            id, descriptor.display_name, descriptor.provider_name, arguments
        );
        self.server = Some(ServerSession::new(id, descriptor, arguments));
        self.spawn_acquire(Role::Server, id);
        Ok(())
    }

    /// Tear down the server session and free the role.
    pub fn stop_server(&mut self) -> Result<(), BridgeError> {
        let Some(mut session) = self.server.take() else {
            return Err(BridgeError::NotActive { role: Role::Server });
        };

        if session.state != SessionState::Closed {
            session.transition(SessionState::Closing);
            release_server(&mut session);
            session.transition(SessionState::Closed);
        }
        announce_close(&mut session, &self.sink);

        info!("Server session {} stopped", session.id);
        self.retired_server = Some(session.snapshot());
        Ok(())
    }

    pub fn start_service(&mut self) -> Result<(), BridgeError> {
        if self.watcher.is_some() {
            return Err(BridgeError::AlreadyActive {
                role: Role::HotplugWatcher,
            });
        }

        let id = self.next_session_id();
        info!("Starting hot-plug watcher session {}", id);
        self.watcher = Some(WatcherSession::new(id));
        self.spawn_acquire(Role::HotplugWatcher, id);
        Ok(())
    }

    pub fn stop_service(&mut self) -> Result<(), BridgeError> {
        let Some(mut session) = self.watcher.take() else {
            return Err(BridgeError::NotActive {
                role: Role::HotplugWatcher,
            });
        };

        if session.state != SessionState::Closed {
            session.transition(SessionState::Closing);
            session.guard.take();
            session.binding.take();
            session.transition(SessionState::Closed);
        }

        info!("Hot-plug watcher session {} stopped", session.id);
        self.retired_watcher = Some(session.snapshot());
        Ok(())
    }

    /// Run a capability call against the server's device
    pub fn with_device<T>(
        &self,
        op: &str,
        f: impl FnOnce(&dyn DeviceControl) -> DeviceResult<T>,
    ) -> Result<T, BridgeError> {
        let session = self
            .server
            .as_ref()
            .ok_or(BridgeError::NotActive { role: Role::Server })?;
        guarded(op, || f(session.device.as_ref()))
    }

    pub(crate) fn on_binding_ready(
        &mut self,
        role: Role,
        session: SessionId,
        result: anyhow::Result<BindingHandle>,
    ) {
        match role {
            Role::Server => self.server_binding_ready(session, result),
            Role::HotplugWatcher => self.watcher_binding_ready(session, result),
        }
    }

    fn server_binding_ready(&mut self, id: SessionId, result: anyhow::Result<BindingHandle>) {
        let waiting = self
            .server
            .as_ref()
            .is_some_and(|s| s.id == id && s.state == SessionState::Binding);
        if !waiting {
            debug!("Binding for retired server session {} released", id);
            return;
        }

        let mut handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Server session {}: binding failed: {:#}", id, e);
                self.end_server(SessionState::failed(format!("binding failed: {:#}", e)));
                return;
            }
        };
        self.watch_binding(Role::Server, id, &mut handle);

        let control = self.control.clone();
        let sink = self.sink.clone();
        let Some(session) = self.server.as_mut() else {
            return;
        };
        session.binding = Some(handle);
        session.transition(SessionState::Opening);

        let reporter = Arc::new(SessionReporter::new(id, control, sink, session.gate.clone()));
        let arguments = session.arguments;
        let device = Arc::clone(&session.device);
        match guarded("openAsync", || device.open_async(arguments, reporter)) {
            Ok(()) => session.driver_active = true,
            Err(e) => {
                warn!("Server session {}: openAsync rejected: {}", id, e);
                self.end_server(SessionState::failed(e.to_string()));
            }
        }
    }

    fn watcher_binding_ready(&mut self, id: SessionId, result: anyhow::Result<BindingHandle>) {
        let sink = self.sink.clone();
        let usb_watcher = Arc::clone(&self.usb_watcher);
        let Some(session) = self
            .watcher
            .as_mut()
            .filter(|s| s.id == id && s.state == SessionState::Binding)
        else {
            debug!("Binding for retired hot-plug watcher session {} released", id);
            return;
        };

        let mut handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                let reason = format!("binding failed: {:#}", e);
                warn!("Hot-plug watcher session {}: {}", id, reason);
                session.last_error = Some(reason.clone());
                session.transition(SessionState::failed(reason));
                return;
            }
        };

        if let Some(lost) = handle.take_lost_signal() {
            let control = self.control.clone();
            tokio::spawn(async move {
                if lost.await.is_ok() {
                    let _ = control.send(ControlMessage::BindingLost {
                        role: Role::HotplugWatcher,
                        session: id,
                    });
                }
            });
        }
        session.transition(SessionState::Opening);

        let watched = panic::catch_unwind(AssertUnwindSafe(|| {
            usb_watcher.watch(HotplugNotifier::new(sink))
        }));
        match watched {
            Ok(Ok(guard)) => {
                session.binding = Some(handle);
                session.guard = Some(guard);
                session.transition(SessionState::Open);
            }
            Ok(Err(e)) => {
                let reason = format!("hot-plug registration failed: {:#}", e);
                warn!("Hot-plug watcher session {}: {}", id, reason);
                session.last_error = Some(reason.clone());
                session.transition(SessionState::failed(reason));
            }
            Err(payload) => {
                let reason = format!(
                    "hot-plug registration panicked: {}",
                    panic_message(&*payload)
                );
                error!("Hot-plug watcher session {}: {}", id, reason);
                session.last_error = Some(reason.clone());
                session.transition(SessionState::failed(reason));
            }
        }
    }

    pub(crate) fn on_binding_lost(&mut self, role: Role, id: SessionId) {
        match role {
            Role::Server => {
                let Some(state) = self
                    .server
                    .as_ref()
                    .filter(|s| s.id == id)
                    .map(|s| s.state.clone())
                else {
                    debug!("Binding loss for retired server session {} ignored", id);
                    return;
                };
                warn!("Server session {}: platform binding lost while {}", id, state.name());
                match state {
                    SessionState::Binding | SessionState::Opening => {
                        self.end_server(SessionState::failed("platform binding lost"))
                    }
                    SessionState::Open => self.end_server(SessionState::Closed),
                    _ => {}
                }
            }
            Role::HotplugWatcher => {
                let Some(session) = self.watcher.as_mut().filter(|s| s.id == id) else {
                    debug!("Binding loss for retired hot-plug watcher session {} ignored", id);
                    return;
                };
                warn!("Hot-plug watcher session {}: platform binding lost", id);
                let next = match session.state {
                    SessionState::Open => SessionState::Closed,
                    SessionState::Binding | SessionState::Opening => {
                        session.last_error = Some("platform binding lost".to_string());
                        SessionState::failed("platform binding lost")
                    }
                    _ => return,
                };
                session.guard.take();
                session.binding.take();
                session.transition(next);
            }
        }
    }

    pub(crate) fn on_driver(&mut self, id: SessionId, signal: DriverSignal) {
        let Some(session) = self.server.as_mut().filter(|s| s.id == id) else {
            debug!("Ignoring {:?} from retired server session {}", signal, id);
            return;
        };

        let next = match signal {
            DriverSignal::Opened => {
                if session.state != SessionState::Opening {
                    info!(
                        "Server session {}: suppressing stale open report while {}",
                        id,
                        session.state.name()
                    );
                    return;
                }
                session.transition(SessionState::Open);
                self.sink.publish(BridgeEvent::DeviceOpen);
                session.gate.open();
                return;
            }
            DriverSignal::Closed(error) => {
                session.driver_active = false;
                match (&session.state, error) {
                    (SessionState::Binding | SessionState::Opening, Some(e)) => {
                        SessionState::failed(e.to_string())
                    }
                    (SessionState::Binding | SessionState::Opening, None) => {
                        SessionState::failed("device closed before opening")
                    }
                    (SessionState::Open, Some(e)) => SessionState::failed(e.to_string()),
                    (SessionState::Open, None) => SessionState::Closed,
                    (state, _) => {
                        debug!(
                            "Server session {}: duplicate close report while {}",
                            id,
                            state.name()
                        );
                        return;
                    }
                }
            }
        };

        self.end_server(next);
    }

    /// The device side ended without `stop`: record the outcome, release
    /// driver and binding, and announce the close once. The role stays
    /// occupied until `stop_server`.
    fn end_server(&mut self, next: SessionState) {
        let Some(session) = self.server.as_mut() else {
            return;
        };
        if let SessionState::Failed { reason } = &next {
            session.record_error(reason);
        }
        if !session.transition(next) {
            return;
        }
        release_server(session);
        announce_close(session, &self.sink);
    }

    /// Stop every session
    pub fn shutdown(&mut self) {
        if self.server.is_some() {
            let _ = self.stop_server();
        }
        if self.watcher.is_some() {
            let _ = self.stop_service();
        }
    }
}
