//! USB hot-plug monitoring.
//!
//! A [`UsbWatcher`] turns platform attach/detach notifications into
//! [`BridgeEvent::UsbAttached`] / [`BridgeEvent::UsbDetached`] on the event
//! sink. It is independent of any open radio session.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::UsbDeviceInfo;
use crate::events::{BridgeEvent, EventSink};

/// Host USB bus enumeration
pub trait UsbBus: Send + Sync {
    fn devices(&self) -> Result<Vec<UsbDeviceInfo>>;
}

/// Publishes hot-plug notifications to the event sink
#[derive(Clone)]
pub struct HotplugNotifier {
    sink: EventSink,
}

impl HotplugNotifier {
    pub fn new(sink: EventSink) -> Self {
        Self { sink }
    }

    pub fn attached(&self) {
        debug!("USB device attached");
        self.sink.publish(BridgeEvent::UsbAttached);
    }

    pub fn detached(&self) {
        debug!("USB device detached");
        self.sink.publish(BridgeEvent::UsbDetached);
    }
}

/// Keeps a watch registered; dropping it unregisters.
pub struct WatchGuard {
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchGuard {
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            stop: Some(Box::new(stop)),
        }
    }

    /// A guard with nothing to tear down
    pub fn noop() -> Self {
        Self { stop: None }
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

/// Platform source of attach/detach notifications
pub trait UsbWatcher: Send + Sync {
    fn watch(&self, notifier: HotplugNotifier) -> Result<WatchGuard>;
}

/// Watcher for hosts without a hot-plug source. Never reports anything.
pub struct NullUsbWatcher;

impl UsbWatcher for NullUsbWatcher {
    fn watch(&self, _notifier: HotplugNotifier) -> Result<WatchGuard> {
        debug!("No hot-plug source, watch is a no-op");
        Ok(WatchGuard::noop())
    }
}

/// Watcher that polls a [`UsbBus`] and diffs the device set.
///
/// The first poll only records the devices already present. Once the guard
/// is dropped no further notification is published, even from a poll that
/// was already running.
pub struct PollingUsbWatcher {
    bus: Arc<dyn UsbBus>,
    interval: Duration,
}

impl PollingUsbWatcher {
    pub fn new(bus: Arc<dyn UsbBus>, interval: Duration) -> Self {
        Self { bus, interval }
    }
}

async fn poll_bus(bus: Arc<dyn UsbBus>) -> Result<HashSet<UsbDeviceInfo>> {
    tokio::task::spawn_blocking(move || bus.devices())
        .await
        .context("USB poll task failed")?
        .map(|devices| devices.into_iter().collect())
}

fn lock_flag(flag: &Mutex<bool>) -> MutexGuard<'_, bool> {
    flag.lock().unwrap_or_else(|e| e.into_inner())
}

impl UsbWatcher for PollingUsbWatcher {
    fn watch(&self, notifier: HotplugNotifier) -> Result<WatchGuard> {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let active = Arc::new(Mutex::new(true));
        let bus = Arc::clone(&self.bus);
        let interval = self.interval;

        let loop_active = Arc::clone(&active);
        tokio::spawn(async move {
            let mut known: Option<HashSet<UsbDeviceInfo>> = None;
            info!("USB polling watcher started");

            loop {
                let current = tokio::select! {
                    _ = &mut stop_rx => break,
                    polled = poll_bus(Arc::clone(&bus)) => polled,
                };

                match current {
                    Ok(current) => {
                        // Nothing is published once the guard has cleared the flag
                        let active = lock_flag(&loop_active);
                        if !*active {
                            break;
                        }
                        match &known {
                            None => debug!("USB baseline: {} devices present", current.len()),
                            Some(previous) => {
                                for _ in current.difference(previous) {
                                    notifier.attached();
                                }
                                for _ in previous.difference(&current) {
                                    notifier.detached();
                                }
                            }
                        }
                        known = Some(current);
                    }
                    Err(e) => warn!("USB poll failed: {:#}", e),
                }

                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }

            info!("USB polling watcher stopped");
        });

        Ok(WatchGuard::new(move || {
            *lock_flag(&active) = false;
            let _ = stop_tx.send(());
        }))
    }
}
