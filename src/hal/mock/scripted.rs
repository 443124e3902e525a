use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{DeviceError, DeviceResult};
use crate::hal::traits::{DeviceControl, DeviceProvider, SessionListener};
use crate::hal::types::{DeviceDescriptor, DeviceFamily, SessionArguments};

/// `DeviceControl` whose worker is the test itself.
///
/// `open_async` only records the listener; the test then calls
/// [`report_open`](Self::report_open), [`report_closed`](Self::report_closed)
/// or [`push_data`](Self::push_data) to play the driver. With `auto_open`
/// the device reports open (and, on close, closed) from its own thread.
pub struct ScriptedDevice {
    name: String,
    auto_open: bool,
    listener: Mutex<Option<Arc<dyn SessionListener>>>,
    last_arguments: Mutex<Option<SessionArguments>>,
    calls: Mutex<Vec<String>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    reject_open: AtomicBool,
    panic_on_query: AtomicBool,
    frequency_hz: AtomicI64,
    sample_rate_hz: AtomicI64,
    ppm: AtomicI32,
    gain: AtomicI32,
    margin: AtomicI32,
}

impl ScriptedDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            auto_open: false,
            listener: Mutex::new(None),
            last_arguments: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            reject_open: AtomicBool::new(false),
            panic_on_query: AtomicBool::new(false),
            frequency_hz: AtomicI64::new(0),
            sample_rate_hz: AtomicI64::new(0),
            ppm: AtomicI32::new(0),
            gain: AtomicI32::new(0),
            margin: AtomicI32::new(0),
        }
    }

    pub fn auto_open(mut self) -> Self {
        self.auto_open = true;
        self
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call.into());
    }

    fn listener(&self) -> Option<Arc<dyn SessionListener>> {
        self.listener.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Every capability call made so far, by command name
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn last_arguments(&self) -> Option<SessionArguments> {
        *self.last_arguments.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `open_async` fail synchronously
    pub fn set_reject_open(&self, reject: bool) {
        self.reject_open.store(reject, Ordering::SeqCst);
    }

    /// Make `frequency()` panic
    pub fn set_panic_on_query(&self, panic: bool) {
        self.panic_on_query.store(panic, Ordering::SeqCst);
    }

    /// Whether `open_async` has handed us a listener yet
    pub fn is_opening(&self) -> bool {
        self.listener().is_some()
    }

    pub fn report_open(&self) -> bool {
        self.listener().map(|l| l.on_open()).is_some()
    }

    pub fn report_closed(&self, error: Option<DeviceError>) -> bool {
        self.listener().map(|l| l.on_closed(error)).is_some()
    }

    pub fn push_data(&self, data: &[u8]) -> bool {
        self.listener().map(|l| l.on_data(data)).is_some()
    }
}

impl DeviceControl for ScriptedDevice {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Simulated
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn open_async(
        &self,
        arguments: SessionArguments,
        listener: Arc<dyn SessionListener>,
    ) -> DeviceResult<()> {
        self.record("openAsync");
        if self.reject_open.load(Ordering::SeqCst) {
            return Err(DeviceError::InvalidArgument("open rejected".to_string()));
        }

        self.opens.fetch_add(1, Ordering::SeqCst);
        *self.last_arguments.lock().unwrap_or_else(|e| e.into_inner()) = Some(arguments);
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&listener));

        if self.auto_open {
            std::thread::spawn(move || listener.on_open());
        }
        Ok(())
    }

    fn close(&self) -> DeviceResult<()> {
        self.record("close");
        self.closes.fetch_add(1, Ordering::SeqCst);

        if self.auto_open {
            if let Some(listener) = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take() {
                std::thread::spawn(move || listener.on_closed(None));
            }
        }
        Ok(())
    }

    fn set_frequency(&self, frequency_hz: i64) -> DeviceResult<()> {
        self.record("setFrequency");
        self.frequency_hz.store(frequency_hz, Ordering::SeqCst);
        Ok(())
    }

    fn frequency(&self) -> DeviceResult<i64> {
        self.record("getFrequency");
        if self.panic_on_query.load(Ordering::SeqCst) {
            panic!("native driver crashed");
        }
        Ok(self.frequency_hz.load(Ordering::SeqCst))
    }

    fn set_sample_rate(&self, sample_rate_hz: i64) -> DeviceResult<()> {
        self.record("setSamplingrate");
        self.sample_rate_hz.store(sample_rate_hz, Ordering::SeqCst);
        Ok(())
    }

    fn sample_rate(&self) -> DeviceResult<i64> {
        self.record("getSamplingrate");
        Ok(self.sample_rate_hz.load(Ordering::SeqCst))
    }

    fn set_frequency_correction(&self, ppm: i32) -> DeviceResult<()> {
        self.record("setFrequencyCorrection");
        self.ppm.store(ppm, Ordering::SeqCst);
        Ok(())
    }

    fn frequency_correction(&self) -> DeviceResult<i32> {
        self.record("getFrequencyCorrection");
        Ok(self.ppm.load(Ordering::SeqCst))
    }

    fn set_tuner_gain(&self, gain: i32) -> DeviceResult<()> {
        self.record("setTunergain");
        self.gain.store(gain, Ordering::SeqCst);
        Ok(())
    }

    fn tuner_gain(&self) -> DeviceResult<i32> {
        self.record("getTunergain");
        Ok(self.gain.load(Ordering::SeqCst))
    }

    fn set_margin(&self, margin: i32) -> DeviceResult<()> {
        self.record("setMargin");
        self.margin.store(margin, Ordering::SeqCst);
        Ok(())
    }

    fn margin(&self) -> DeviceResult<i32> {
        self.record("getMargin");
        Ok(self.margin.load(Ordering::SeqCst))
    }
}

/// Provider returning a fixed device list, optionally failing or stalling
pub struct SimulatedProvider {
    name: String,
    devices: Vec<Arc<dyn DeviceControl>>,
    fail: bool,
    delay: Duration,
}

impl SimulatedProvider {
    pub fn new(name: impl Into<String>, devices: Vec<Arc<dyn DeviceControl>>) -> Self {
        Self {
            name: name.into(),
            devices,
            fail: false,
            delay: Duration::ZERO,
        }
    }

    /// Provider whose enumeration always fails
    pub fn failing(name: impl Into<String>) -> Self {
        Self {
            fail: true,
            ..Self::new(name, Vec::new())
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl DeviceProvider for SimulatedProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(anyhow!("{}: permission denied", self.name));
        }

        Ok(self
            .devices
            .iter()
            .map(|d| DeviceDescriptor::new(self.name.clone(), d.name(), Arc::clone(d)))
            .collect())
    }
}
