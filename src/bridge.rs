use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::BridgeConfig;
use crate::dispatch::Dispatcher;
use crate::engine::control::{run_control_loop, ControlMessage, ControlSender};
use crate::engine::{BindingHost, LocalBindingHost, SessionKernel};
use crate::events::{EventSink, EventStream};
use crate::hal::{DeviceProvider, DeviceRegistry, NullUsbWatcher, UsbWatcher};

/// Assembles a [`Bridge`]
pub struct BridgeBuilder {
    config: BridgeConfig,
    registry: DeviceRegistry,
    bindings: Option<Arc<dyn BindingHost>>,
    usb_watcher: Option<Arc<dyn UsbWatcher>>,
}

impl BridgeBuilder {
    pub fn new(config: BridgeConfig) -> Self {
        let registry = DeviceRegistry::new().with_enumeration_timeout(config.enumeration_timeout());
        Self {
            config,
            registry,
            bindings: None,
            usb_watcher: None,
        }
    }

    /// Register a device provider. Enumeration follows registration order.
    pub fn provider(mut self, provider: impl DeviceProvider + 'static) -> Self {
        self.registry.register(provider);
        self
    }

    pub fn binding_host(mut self, host: Arc<dyn BindingHost>) -> Self {
        self.bindings = Some(host);
        self
    }

    pub fn usb_watcher(mut self, watcher: Arc<dyn UsbWatcher>) -> Self {
        self.usb_watcher = Some(watcher);
        self
    }

    /// Spawn the control context. Must be called inside a tokio runtime.
    pub fn build(self) -> Bridge {
        let sink = EventSink::with_capacity(self.config.event_queue_capacity);
        let bindings = self
            .bindings
            .unwrap_or_else(|| Arc::new(LocalBindingHost::new()));
        let usb_watcher = self.usb_watcher.unwrap_or_else(|| {
            debug!("No hot-plug source configured, watcher sessions will stay silent");
            Arc::new(NullUsbWatcher)
        });

        info!("Starting bridge with providers {:?}", self.registry.provider_names());

        let (control, rx) = mpsc::unbounded_channel();
        let kernel = SessionKernel::new(
            Arc::new(self.registry),
            sink.clone(),
            bindings,
            usb_watcher,
            control.clone(),
        );
        let task = tokio::spawn(run_control_loop(kernel, rx));

        Bridge {
            dispatcher: Dispatcher::new(control.clone()),
            sink,
            control,
            task: Some(task),
        }
    }
}

/// Running bridge: the command surface plus the event sink.
///
/// Dropping it stops every session; `shutdown` does the same and waits.
pub struct Bridge {
    dispatcher: Dispatcher,
    sink: EventSink,
    control: ControlSender,
    task: Option<JoinHandle<()>>,
}

impl Bridge {
    pub fn builder(config: BridgeConfig) -> BridgeBuilder {
        BridgeBuilder::new(config)
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    pub fn events(&self) -> &EventSink {
        &self.sink
    }

    /// Attach a subscriber, replacing the current one
    pub fn subscribe(&self) -> EventStream {
        self.sink.attach()
    }

    /// Stop all sessions and wait for the control context to exit
    pub async fn shutdown(mut self) {
        let (reply, done) = oneshot::channel();
        if self
            .control
            .send(ControlMessage::Shutdown { reply: Some(reply) })
            .is_ok()
        {
            let _ = done.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if self.task.take().is_some() {
            let _ = self.control.send(ControlMessage::Shutdown { reply: None });
        }
    }
}
