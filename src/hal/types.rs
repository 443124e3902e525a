use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::traits::DeviceControl;

/// Hardware family. Adding a new family means adding a variant and a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceFamily {
    RtlSdr,
    HackRf,
    /// Test and demo devices
    Simulated,
}

/// A USB device as reported by the host bus
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbDeviceInfo {
    /// Bus path, e.g. "/dev/bus/usb/001/004"
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl UsbDeviceInfo {
    pub fn new(path: impl Into<String>, vendor_id: u16, product_id: u16) -> Self {
        Self {
            path: path.into(),
            vendor_id,
            product_id,
        }
    }

    pub fn matches(&self, filter: &[(u16, u16)]) -> bool {
        filter
            .iter()
            .any(|(vid, pid)| *vid == self.vendor_id && *pid == self.product_id)
    }
}

/// Selectable hardware instance produced by a provider.
///
/// Descriptors are produced fresh on every enumeration and never mutated.
#[derive(Clone)]
pub struct DeviceDescriptor {
    pub provider_name: String,
    pub display_name: String,
    handle: Arc<dyn DeviceControl>,
}

impl DeviceDescriptor {
    pub fn new(
        provider_name: impl Into<String>,
        display_name: impl Into<String>,
        handle: Arc<dyn DeviceControl>,
    ) -> Self {
        Self {
            provider_name: provider_name.into(),
            display_name: display_name.into(),
            handle,
        }
    }

    /// Capability handle for the device behind this descriptor
    pub fn handle(&self) -> Arc<dyn DeviceControl> {
        Arc::clone(&self.handle)
    }

    pub fn family(&self) -> DeviceFamily {
        self.handle.family()
    }
}

impl fmt::Debug for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceDescriptor")
            .field("provider_name", &self.provider_name)
            .field("display_name", &self.display_name)
            .field("family", &self.family())
            .finish()
    }
}

/// Startup arguments for a server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionArguments {
    /// Tuner gain in tenths of a dB; 0 selects automatic gain
    pub gain: i32,
    pub sample_rate_hz: i64,
    pub frequency_hz: i64,
    pub ppm_correction: i32,
    pub amplitude_on: bool,
}

impl SessionArguments {
    pub const DEFAULT_GAIN: i32 = 24;
    pub const DEFAULT_PPM: i32 = 0;
    pub const DEFAULT_FREQUENCY_HZ: i64 = 100_000_000;
    pub const DEFAULT_SAMPLE_RATE_HZ: i64 = 2_048_000;

    pub fn new(
        gain: i32,
        sample_rate_hz: i64,
        frequency_hz: i64,
        ppm_correction: i32,
        amplitude_on: bool,
    ) -> Self {
        Self {
            gain,
            sample_rate_hz,
            frequency_hz,
            ppm_correction,
            amplitude_on,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arguments_keep_explicit_values() {
        let args = SessionArguments::new(
            SessionArguments::DEFAULT_GAIN,
            SessionArguments::DEFAULT_SAMPLE_RATE_HZ,
            SessionArguments::DEFAULT_FREQUENCY_HZ,
            SessionArguments::DEFAULT_PPM,
            true,
        );
        assert_eq!(args.gain, 24);
        assert_eq!(args.ppm_correction, 0);
        assert_eq!(args.frequency_hz, 100_000_000);
        assert_eq!(args.sample_rate_hz, 2_048_000);
        assert!(args.amplitude_on);
    }

    #[test]
    fn test_usb_filter_match() {
        let dev = UsbDeviceInfo::new("/dev/bus/usb/001/004", 0x0bda, 0x2838);
        assert!(dev.matches(&[(0x0bda, 0x2832), (0x0bda, 0x2838)]));
        assert!(!dev.matches(&[(0x1d50, 0x6089)]));
    }
}
