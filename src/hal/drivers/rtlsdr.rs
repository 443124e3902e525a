use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use super::{spawn_worker, WorkerState};
use crate::error::{DeviceError, DeviceResult};
use crate::hal::hotplug::UsbBus;
use crate::hal::traits::{DeviceControl, DeviceProvider, SessionListener};
use crate::hal::types::{DeviceDescriptor, DeviceFamily, SessionArguments, UsbDeviceInfo};

/// Known RTL2832U dongles (vendor id, product id)
pub const RTLSDR_USB_IDS: &[(u16, u16)] = &[
    (0x0bda, 0x2832), // Generic RTL2832U
    (0x0bda, 0x2838), // Generic RTL2832U OEM
    (0x0413, 0x6680), // DigitalNow Quad DVB-T PCI-E
    (0x0ccd, 0x00a9), // Terratec Cinergy T Stick Black
    (0x0ccd, 0x00b3), // Terratec NOXON DAB/DAB+
    (0x185b, 0x0620), // Compro Videomate U620F
    (0x1f4d, 0xb803), // GTek T803
    (0x1b80, 0xd3a4), // Twintech UT-40
];

const PROVIDER_NAME: &str = "RtlSdr";
const DC_OFFSET: i32 = 127;

/// Opens RTL2832 dongles. Implemented by the native driver.
pub trait RtlSdrBackend: Send + Sync {
    fn open(&self, device: &UsbDeviceInfo) -> DeviceResult<Box<dyn RtlSdrNative>>;
}

/// One open RTL2832 dongle. Dropping it closes the USB handle.
pub trait RtlSdrNative: Send + Sync {
    fn set_freq_correction(&self, ppm: i32) -> DeviceResult<()>;
    fn freq_correction(&self) -> i32;
    fn set_sample_rate(&self, rate_hz: u32) -> DeviceResult<()>;
    fn sample_rate(&self) -> u32;
    fn set_center_freq(&self, frequency_hz: u32) -> DeviceResult<()>;
    fn center_freq(&self) -> u32;
    /// `true` selects manual gain
    fn set_tuner_gain_mode(&self, manual: bool) -> DeviceResult<()>;
    /// Gain in tenths of a dB
    fn set_tuner_gain(&self, gain: i32) -> DeviceResult<()>;
    fn tuner_gain(&self) -> i32;
    /// Supported gains in tenths of a dB, ascending
    fn tuner_gains(&self) -> Vec<i32>;
    fn set_agc_mode(&self, on: bool) -> DeviceResult<()>;
    fn set_offset_tuning(&self, on: bool) -> DeviceResult<()>;
    fn set_direct_sampling(&self, mode: i32) -> DeviceResult<()>;
    /// (RTL2832 crystal, tuner crystal) in Hz
    fn xtal_freq(&self) -> (u32, u32);
    fn reset_buffer(&self) -> DeviceResult<()>;
    /// Stream sample buffers until `cancel_async`. A cancel issued before
    /// this call makes it return immediately.
    fn read_async(&self, on_samples: &mut dyn FnMut(&[u8])) -> DeviceResult<()>;
    fn cancel_async(&self);
}

/// Trim a buffer to the span whose samples leave the `127 ± margin` band.
///
/// With `margin <= 0` the whole buffer passes. Returns `None` when nothing
/// in the buffer exceeds the band.
pub fn squelch(buf: &[u8], margin: i32) -> Option<&[u8]> {
    if buf.is_empty() {
        return None;
    }
    if margin <= 0 {
        return Some(buf);
    }

    let outside = |b: &u8| {
        let v = *b as i32;
        v < DC_OFFSET - margin || v > DC_OFFSET + margin
    };
    let first = buf.iter().position(outside)?;
    let last = buf.iter().rposition(outside)?;
    Some(&buf[first..=last])
}

fn to_u32(value: i64, what: &str) -> DeviceResult<u32> {
    u32::try_from(value)
        .map_err(|_| DeviceError::InvalidArgument(format!("{} out of range: {}", what, value)))
}

fn apply_tuner_gain(native: &dyn RtlSdrNative, gain: i32) -> DeviceResult<()> {
    if gain == 0 {
        native.set_tuner_gain_mode(false)
    } else {
        native.set_tuner_gain_mode(true)?;
        native.set_tuner_gain(gain)
    }
}

/// Startup sequence run on the worker before streaming
fn configure(native: &dyn RtlSdrNative, args: &SessionArguments) -> DeviceResult<()> {
    if args.ppm_correction != 0 {
        if let Err(e) = native.set_freq_correction(args.ppm_correction) {
            warn!("Failed to set ppm to {}: {}", args.ppm_correction, e);
        }
    }

    native.set_sample_rate(to_u32(args.sample_rate_hz, "sample rate")?)?;
    info!("Set sampling rate to {}", args.sample_rate_hz);

    native.set_center_freq(to_u32(args.frequency_hz, "frequency")?)?;

    if args.gain == 0 {
        if let Err(e) = native.set_tuner_gain_mode(false) {
            warn!("Failed to enable automatic gain: {}", e);
        }
    } else {
        if let Err(e) = native.set_tuner_gain_mode(true) {
            warn!("Failed to enable manual gain: {}", e);
        }
        match native.set_tuner_gain(args.gain) {
            Ok(()) => info!("Tuner gain set to {:.1} dB", args.gain as f64 / 10.0),
            Err(e) => warn!("Failed to set tuner gain: {}", e),
        }
    }

    if let Err(e) = native.reset_buffer() {
        warn!("Failed to reset buffers: {}", e);
    }

    Ok(())
}

/// RTL2832-based receiver
pub struct RtlSdrDevice {
    info: UsbDeviceInfo,
    backend: Arc<dyn RtlSdrBackend>,
    state: Arc<WorkerState<dyn RtlSdrNative>>,
    margin: Arc<AtomicI32>,
}

impl RtlSdrDevice {
    pub fn new(info: UsbDeviceInfo, backend: Arc<dyn RtlSdrBackend>) -> Self {
        Self {
            info,
            backend,
            state: Arc::new(WorkerState::new()),
            margin: Arc::new(AtomicI32::new(0)),
        }
    }

    pub fn usb_info(&self) -> &UsbDeviceInfo {
        &self.info
    }
}

impl DeviceControl for RtlSdrDevice {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::RtlSdr
    }

    fn name(&self) -> String {
        format!("rtl-sdr {}", self.info.path)
    }

    fn open_async(
        &self,
        arguments: SessionArguments,
        listener: Arc<dyn SessionListener>,
    ) -> DeviceResult<()> {
        let info = self.info.clone();
        let backend = Arc::clone(&self.backend);
        let state = Arc::clone(&self.state);
        let margin = Arc::clone(&self.margin);
        let worker_listener = Arc::clone(&listener);

        spawn_worker("rtlsdr-worker", Arc::clone(&self.state), listener, move || {
            info!("Opening {}", info.path);
            let native: Arc<dyn RtlSdrNative> = Arc::from(backend.open(&info)?);
            configure(&*native, &arguments)?;

            if !state.publish(Arc::clone(&native)) {
                info!("Close requested while opening {}", info.path);
                return Ok(());
            }

            worker_listener.on_open();
            native.read_async(&mut |buf| {
                if let Some(span) = squelch(buf, margin.load(Ordering::Relaxed)) {
                    worker_listener.on_data(span);
                }
            })
        })
    }

    fn close(&self) -> DeviceResult<()> {
        if let Some(native) = self.state.cancel() {
            native.cancel_async();
        }
        Ok(())
    }

    fn set_frequency(&self, frequency_hz: i64) -> DeviceResult<()> {
        let hz = to_u32(frequency_hz, "frequency")?;
        self.state.with_native(|n| n.set_center_freq(hz))
    }

    fn frequency(&self) -> DeviceResult<i64> {
        self.state.with_native(|n| Ok(n.center_freq() as i64))
    }

    fn set_sample_rate(&self, sample_rate_hz: i64) -> DeviceResult<()> {
        let hz = to_u32(sample_rate_hz, "sample rate")?;
        self.state.with_native(|n| n.set_sample_rate(hz))
    }

    fn sample_rate(&self) -> DeviceResult<i64> {
        self.state.with_native(|n| Ok(n.sample_rate() as i64))
    }

    fn set_frequency_correction(&self, ppm: i32) -> DeviceResult<()> {
        self.state.with_native(|n| n.set_freq_correction(ppm))
    }

    fn frequency_correction(&self) -> DeviceResult<i32> {
        self.state.with_native(|n| Ok(n.freq_correction()))
    }

    fn set_gain_mode(&self, mode: i32) -> DeviceResult<()> {
        self.state.with_native(|n| n.set_tuner_gain_mode(mode != 0))
    }

    fn set_tuner_gain(&self, gain: i32) -> DeviceResult<()> {
        self.state.with_native(|n| apply_tuner_gain(n, gain))
    }

    fn tuner_gain(&self) -> DeviceResult<i32> {
        self.state.with_native(|n| Ok(n.tuner_gain()))
    }

    fn set_tuner_gain_percentage(&self, percent: i32) -> DeviceResult<()> {
        self.state.with_native(|n| {
            let gains = n.tuner_gains();
            if gains.is_empty() {
                return Err(DeviceError::Io("tuner reports no gain steps".to_string()));
            }
            let count = gains.len() as i64;
            let index = (percent.max(0) as i64 * count / 100).clamp(0, count - 1);
            n.set_tuner_gain(gains[index as usize])
        })
    }

    fn set_margin(&self, margin: i32) -> DeviceResult<()> {
        self.margin.store(margin, Ordering::Relaxed);
        Ok(())
    }

    fn margin(&self) -> DeviceResult<i32> {
        Ok(self.margin.load(Ordering::Relaxed))
    }

    fn set_agc_mode(&self, on: bool) -> DeviceResult<()> {
        self.state.with_native(|n| n.set_agc_mode(on))
    }

    fn set_offset_tuning(&self, on: bool) -> DeviceResult<()> {
        self.state.with_native(|n| n.set_offset_tuning(on))
    }

    fn set_direct_sampling(&self, mode: i32) -> DeviceResult<()> {
        self.state.with_native(|n| n.set_direct_sampling(mode))
    }

    fn rtl_xtal_frequency(&self) -> DeviceResult<i64> {
        self.state.with_native(|n| Ok(n.xtal_freq().0 as i64))
    }

    fn tuner_xtal_frequency(&self) -> DeviceResult<i64> {
        self.state.with_native(|n| Ok(n.xtal_freq().1 as i64))
    }
}

/// Lists RTL2832 dongles present on the USB bus
pub struct RtlSdrProvider {
    bus: Arc<dyn UsbBus>,
    backend: Arc<dyn RtlSdrBackend>,
}

impl RtlSdrProvider {
    pub fn new(bus: Arc<dyn UsbBus>, backend: Arc<dyn RtlSdrBackend>) -> Self {
        Self { bus, backend }
    }
}

#[async_trait]
impl DeviceProvider for RtlSdrProvider {
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
            .filter(|d| d.matches(RTLSDR_USB_IDS))
            .map(|d| {
                let device = RtlSdrDevice::new(d, Arc::clone(&self.backend));
                DeviceDescriptor::new(PROVIDER_NAME, device.name(), Arc::new(device))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_squelch_passes_everything_without_margin() {
        let buf = [127u8, 127, 200, 127];
        assert_eq!(squelch(&buf, 0), Some(&buf[..]));
    }

    #[test]
    fn test_squelch_trims_to_signal_span() {
        let buf = [127u8, 128, 10, 127, 240, 126, 127];
        assert_eq!(squelch(&buf, 5), Some(&[10u8, 127, 240][..]));
    }

    #[test]
    fn test_squelch_drops_quiet_buffer() {
        let buf = [125u8, 127, 129, 130];
        assert_eq!(squelch(&buf, 5), None);
        assert_eq!(squelch(&[], 0), None);
    }

    #[test]
    fn test_display_name_uses_usb_path() {
        struct NoBackend;
        impl RtlSdrBackend for NoBackend {
            fn open(&self, _device: &UsbDeviceInfo) -> DeviceResult<Box<dyn RtlSdrNative>> {
                Err(DeviceError::Io("no hardware".into()))
            }
        }

        let dev = RtlSdrDevice::new(
            UsbDeviceInfo::new("/dev/bus/usb/001/004", 0x0bda, 0x2838),
            Arc::new(NoBackend),
        );
        assert_eq!(dev.name(), "rtl-sdr /dev/bus/usb/001/004");
        assert_eq!(dev.frequency(), Err(DeviceError::NotOpen));
        assert_eq!(dev.set_amplitude(true), Err(DeviceError::Unsupported("setAmplitude")));
    }
}
