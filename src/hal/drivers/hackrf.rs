use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use super::{spawn_worker, WorkerState};
use crate::error::{DeviceError, DeviceResult};
use crate::hal::hotplug::UsbBus;
use crate::hal::traits::{DeviceControl, DeviceProvider, SessionListener};
use crate::hal::types::{DeviceDescriptor, DeviceFamily, SessionArguments, UsbDeviceInfo};

pub const HACKRF_USB_IDS: &[(u16, u16)] = &[
    (0x1d50, 0x604b), // HackRF Jawbreaker
    (0x1d50, 0x6089), // HackRF One
    (0x1d50, 0xcc15), // rad1o
];

const PROVIDER_NAME: &str = "HackRF";

/// Seconds of samples the transfer queue holds per direction
const BUFFER_TIME_SECS: f64 = 0.1;

/// Transfer queue size for a given sample rate
pub fn queue_size(sample_rate_hz: i64) -> usize {
    (2.0 * BUFFER_TIME_SECS * sample_rate_hz.max(0) as f64) as usize
}

pub trait HackRfBackend: Send + Sync {
    fn open(
        &self,
        device: &UsbDeviceInfo,
        queue_size: usize,
    ) -> DeviceResult<Box<dyn HackRfNative>>;
}

/// One open HackRF. Dropping it closes the USB handle.
pub trait HackRfNative: Send + Sync {
    fn set_frequency(&self, frequency_hz: u64) -> DeviceResult<()>;
    fn set_sample_rate(&self, rate_hz: u32) -> DeviceResult<()>;
    fn set_amp_enable(&self, on: bool) -> DeviceResult<()>;
    /// Receive until `stop`. A stop issued before this call makes it return
    /// immediately.
    fn receive(&self, on_samples: &mut dyn FnMut(&[u8])) -> DeviceResult<()>;
    fn stop(&self);
}

/// HackRF transceiver used as a receiver.
///
/// The hardware has no getters, so the last applied frequency and sample
/// rate are cached here.
pub struct HackRfDevice {
    info: UsbDeviceInfo,
    backend: Arc<dyn HackRfBackend>,
    state: Arc<WorkerState<dyn HackRfNative>>,
    frequency_hz: Arc<AtomicI64>,
    sample_rate_hz: Arc<AtomicI64>,
}

impl HackRfDevice {
    pub fn new(info: UsbDeviceInfo, backend: Arc<dyn HackRfBackend>) -> Self {
        Self {
            info,
            backend,
            state: Arc::new(WorkerState::new()),
            frequency_hz: Arc::new(AtomicI64::new(0)),
            sample_rate_hz: Arc::new(AtomicI64::new(0)),
        }
    }
}

fn to_u64(value: i64) -> DeviceResult<u64> {
    u64::try_from(value)
        .map_err(|_| DeviceError::InvalidArgument(format!("frequency out of range: {}", value)))
}

fn to_u32(value: i64) -> DeviceResult<u32> {
    u32::try_from(value)
        .map_err(|_| DeviceError::InvalidArgument(format!("sample rate out of range: {}", value)))
}

impl DeviceControl for HackRfDevice {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::HackRf
    }

    fn name(&self) -> String {
        "HackRF".to_string()
    }

    fn open_async(
        &self,
        arguments: SessionArguments,
        listener: Arc<dyn SessionListener>,
    ) -> DeviceResult<()> {
        let info = self.info.clone();
        let backend = Arc::clone(&self.backend);
        let state = Arc::clone(&self.state);
        let frequency_hz = Arc::clone(&self.frequency_hz);
        let sample_rate_hz = Arc::clone(&self.sample_rate_hz);
        let worker_listener = Arc::clone(&listener);

        spawn_worker("hackrf-worker", Arc::clone(&self.state), listener, move || {
            info!("Opening HackRF at {}", info.path);
            let native: Arc<dyn HackRfNative> =
                Arc::from(backend.open(&info, queue_size(arguments.sample_rate_hz))?);

            native.set_sample_rate(to_u32(arguments.sample_rate_hz)?)?;
            sample_rate_hz.store(arguments.sample_rate_hz, Ordering::Relaxed);
            native.set_frequency(to_u64(arguments.frequency_hz)?)?;
            frequency_hz.store(arguments.frequency_hz, Ordering::Relaxed);
            if let Err(e) = native.set_amp_enable(arguments.amplitude_on) {
                warn!("Failed to set HackRF amplifier: {}", e);
            }

            if !state.publish(Arc::clone(&native)) {
                info!("Close requested while opening HackRF");
                return Ok(());
            }

            worker_listener.on_open();
            let result = native.receive(&mut |buf| worker_listener.on_data(buf));
            info!("Closing HackRF");
            result
        })
    }

    fn close(&self) -> DeviceResult<()> {
        if let Some(native) = self.state.cancel() {
            native.stop();
        }
        Ok(())
    }

    fn set_frequency(&self, frequency_hz: i64) -> DeviceResult<()> {
        let hz = to_u64(frequency_hz)?;
        self.state.with_native(|n| n.set_frequency(hz))?;
        self.frequency_hz.store(frequency_hz, Ordering::Relaxed);
        Ok(())
    }

    fn frequency(&self) -> DeviceResult<i64> {
        self.state.with_native(|_| Ok(self.frequency_hz.load(Ordering::Relaxed)))
    }

    fn set_sample_rate(&self, sample_rate_hz: i64) -> DeviceResult<()> {
        let hz = to_u32(sample_rate_hz)?;
        self.state.with_native(|n| n.set_sample_rate(hz))?;
        self.sample_rate_hz.store(sample_rate_hz, Ordering::Relaxed);
        Ok(())
    }

    fn sample_rate(&self) -> DeviceResult<i64> {
        self.state.with_native(|_| Ok(self.sample_rate_hz.load(Ordering::Relaxed)))
    }

    fn set_amplitude(&self, on: bool) -> DeviceResult<()> {
        self.state.with_native(|n| n.set_amp_enable(on))
    }
}

/// Lists HackRF boards present on the USB bus
pub struct HackRfProvider {
    bus: Arc<dyn UsbBus>,
    backend: Arc<dyn HackRfBackend>,
}

impl HackRfProvider {
    pub fn new(bus: Arc<dyn UsbBus>, backend: Arc<dyn HackRfBackend>) -> Self {
        Self { bus, backend }
    }
}

#[async_trait]
impl DeviceProvider for HackRfProvider {
    fn provider_name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let bus = Arc::clone(&self.bus);
        let usb_devices = tokio::task::spawn_blocking(move || bus.devices())
            .await
            .context("USB enumeration task failed")??;

        Ok(usb_devices
            .into_iter()
            .filter(|d| d.matches(HACKRF_USB_IDS))
            .map(|d| {
                let device = HackRfDevice::new(d, Arc::clone(&self.backend));
                DeviceDescriptor::new(PROVIDER_NAME, device.name(), Arc::new(device))
            })
            .collect())
    }
}
