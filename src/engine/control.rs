use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::binding::BindingHandle;
use super::kernel::SessionKernel;
use super::session::{DataGate, Role, SessionId, SessionSnapshot};
use crate::dispatch::Command;
use crate::error::{BridgeError, DeviceError};
use crate::events::EventSink;
use crate::hal::SessionListener;

/// What a driver worker reported
#[derive(Debug)]
pub(crate) enum DriverSignal {
    Opened,
    Closed(Option<DeviceError>),
}

/// Everything the control context reacts to
pub(crate) enum ControlMessage {
    Dispatch {
        command: Command,
        reply: oneshot::Sender<Result<Value, BridgeError>>,
    },
    BindingReady {
        role: Role,
        session: SessionId,
        result: anyhow::Result<BindingHandle>,
    },
    BindingLost {
        role: Role,
        session: SessionId,
    },
    Driver {
        session: SessionId,
        signal: DriverSignal,
    },
    Snapshot {
        role: Role,
        reply: oneshot::Sender<Option<SessionSnapshot>>,
    },
    Shutdown {
        reply: Option<oneshot::Sender<()>>,
    },
}

pub(crate) type ControlSender = mpsc::UnboundedSender<ControlMessage>;

/// `SessionListener` handed to the driver for one server session.
///
/// Lifecycle reports go through the control context; sample data goes
/// straight to the sink while the session's data gate is open.
pub(crate) struct SessionReporter {
    session: SessionId,
    control: ControlSender,
    sink: EventSink,
    gate: DataGate,
}

impl SessionReporter {
    pub(crate) fn new(
        session: SessionId,
        control: ControlSender,
        sink: EventSink,
        gate: DataGate,
    ) -> Self {
        Self {
            session,
            control,
            sink,
            gate,
        }
    }

    fn report(&self, signal: DriverSignal) {
        if self.control.send(ControlMessage::Driver { session: self.session, signal }).is_err() {
            debug!("Control context gone, dropping report from session {}", self.session);
        }
    }
}

impl SessionListener for SessionReporter {
    fn on_open(&self) {
        self.report(DriverSignal::Opened);
    }

    fn on_closed(&self, error: Option<DeviceError>) {
        self.report(DriverSignal::Closed(error));
    }

    fn on_data(&self, data: &[u8]) {
        self.gate.forward(&self.sink, data);
    }
}

/// The single control context. Owns the kernel; nothing else touches
/// session state.
pub(crate) async fn run_control_loop(
    mut kernel: SessionKernel,
    mut rx: mpsc::UnboundedReceiver<ControlMessage>,
) {
    info!("Control context started");

    while let Some(message) = rx.recv().await {
        match message {
            ControlMessage::Dispatch { command, reply } => {
                let name = command.name();
                let result = crate::dispatch::execute(&mut kernel, command).await;
                if let Err(e) = &result {
                    debug!("{} failed: {} ({})", name, e, e.code());
                }
                let _ = reply.send(result);
            }
            ControlMessage::BindingReady { role, session, result } => {
                kernel.on_binding_ready(role, session, result);
            }
            ControlMessage::BindingLost { role, session } => {
                kernel.on_binding_lost(role, session);
            }
            ControlMessage::Driver { session, signal } => {
                kernel.on_driver(session, signal);
            }
            ControlMessage::Snapshot { role, reply } => {
                let _ = reply.send(kernel.snapshot(role));
            }
            ControlMessage::Shutdown { reply } => {
                kernel.shutdown();
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                break;
            }
        }
    }

    info!("Control context stopped");
}
