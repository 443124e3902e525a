use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::hal::hotplug::{HotplugNotifier, UsbBus, UsbWatcher, WatchGuard};
use crate::hal::UsbDeviceInfo;

/// In-memory USB bus whose device set tests can change
#[derive(Default)]
pub struct SimulatedUsbBus {
    devices: Mutex<Vec<UsbDeviceInfo>>,
    failing: AtomicBool,
}

impl SimulatedUsbBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: Vec<UsbDeviceInfo>) -> Self {
        Self {
            devices: Mutex::new(devices),
            failing: AtomicBool::new(false),
        }
    }

    pub fn plug(&self, device: UsbDeviceInfo) {
        self.devices.lock().unwrap_or_else(|e| e.into_inner()).push(device);
    }

    pub fn unplug(&self, path: &str) {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|d| d.path != path);
    }

    /// Simulate missing USB permission
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl UsbBus for SimulatedUsbBus {
    fn devices(&self) -> Result<Vec<UsbDeviceInfo>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("permission denied for USB bus"));
        }
        Ok(self.devices.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

/// Hot-plug watcher fired by hand
#[derive(Default)]
pub struct ManualUsbWatcher {
    notifier: Arc<Mutex<Option<HotplugNotifier>>>,
    refuse: AtomicBool,
}

impl ManualUsbWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `watch` calls fail
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn is_watching(&self) -> bool {
        self.notifier.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Fire an attach notification. Returns `false` when nobody is watching.
    pub fn attach(&self) -> bool {
        match self.notifier.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(notifier) => {
                notifier.attached();
                true
            }
            None => false,
        }
    }

    pub fn detach(&self) -> bool {
        match self.notifier.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(notifier) => {
                notifier.detached();
                true
            }
            None => false,
        }
    }
}

impl UsbWatcher for ManualUsbWatcher {
    fn watch(&self, notifier: HotplugNotifier) -> Result<WatchGuard> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(anyhow!("hot-plug receiver registration refused"));
        }

        *self.notifier.lock().unwrap_or_else(|e| e.into_inner()) = Some(notifier);

        let slot = Arc::clone(&self.notifier);
        Ok(WatchGuard::new(move || {
            slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        }))
    }
}
