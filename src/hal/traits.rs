use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use super::types::{DeviceDescriptor, DeviceFamily, SessionArguments};
use crate::error::{DeviceError, DeviceResult};

/// Trait implemented by providers for device discovery
#[async_trait]
pub trait DeviceProvider: Send + Sync {
    /// Provider name used in logs and descriptors (e.g., "RtlSdr", "HackRF")
    fn provider_name(&self) -> &str;

    /// Enumerate currently available devices
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>>;
}

/// Receives asynchronous notifications from a device worker.
///
/// Implementations must be cheap and non-blocking; they are called from the
/// driver's own worker threads.
pub trait SessionListener: Send + Sync {
    /// The device is open and streaming
    fn on_open(&self);

    /// The device stopped. `error` is `None` for a clean shutdown.
    fn on_closed(&self, error: Option<DeviceError>);

    /// A buffer of raw samples
    fn on_data(&self, data: &[u8]);
}

/// Control surface of one hardware device.
///
/// Every tuning operation defaults to [`DeviceError::Unsupported`]; drivers
/// override what their hardware can do.
pub trait DeviceControl: Send + Sync {
    fn family(&self) -> DeviceFamily;

    /// Friendly name shown to the user
    fn name(&self) -> String;

    /// Start opening the device on a driver-owned worker and return at once.
    ///
    /// Success and failure are reported later through `listener`. An `Err`
    /// here means the call itself was invalid (e.g. already opening), never
    /// an I/O failure.
    fn open_async(
        &self,
        arguments: SessionArguments,
        listener: Arc<dyn SessionListener>,
    ) -> DeviceResult<()>;

    /// Ask the device to stop. Must not block on the worker and must be safe
    /// to call at any point, including mid-open and repeatedly.
    fn close(&self) -> DeviceResult<()>;

    fn set_frequency(&self, _frequency_hz: i64) -> DeviceResult<()> {
        Err(DeviceError::Unsupported("setFrequency"))
    }

    fn frequency(&self) -> DeviceResult<i64> {
        Err(DeviceError::Unsupported("getFrequency"))
    }

    fn set_sample_rate(&self, _sample_rate_hz: i64) -> DeviceResult<()> {
        Err(DeviceError::Unsupported("setSamplingrate"))
    }

    fn sample_rate(&self) -> DeviceResult<i64> {
        Err(DeviceError::Unsupported("getSamplingrate"))
    }

    fn set_frequency_correction(&self, _ppm: i32) -> DeviceResult<()> {
        Err(DeviceError::Unsupported("setFrequencyCorrection"))
    }

    fn frequency_correction(&self) -> DeviceResult<i32> {
        Err(DeviceError::Unsupported("getFrequencyCorrection"))
    }

    fn set_gain_mode(&self, _mode: i32) -> DeviceResult<()> {
        Err(DeviceError::Unsupported("setGainMode"))
    }

    fn set_tuner_gain(&self, _gain: i32) -> DeviceResult<()> {
        Err(DeviceError::Unsupported("setTunergain"))
    }

    fn tuner_gain(&self) -> DeviceResult<i32> {
        Err(DeviceError::Unsupported("getTunergain"))
    }

    fn set_tuner_gain_percentage(&self, _percent: i32) -> DeviceResult<()> {
        Err(DeviceError::Unsupported("setTunergainByPercentage"))
    }

    fn set_margin(&self, _margin: i32) -> DeviceResult<()> {
        Err(DeviceError::Unsupported("setMargin"))
    }

    fn margin(&self) -> DeviceResult<i32> {
        Err(DeviceError::Unsupported("getMargin"))
    }

    fn set_amplitude(&self, _on: bool) -> DeviceResult<()> {
        Err(DeviceError::Unsupported("setAmplitude"))
    }

    fn set_agc_mode(&self, _on: bool) -> DeviceResult<()> {
        Err(DeviceError::Unsupported("setAgcMode"))
    }

    fn set_offset_tuning(&self, _on: bool) -> DeviceResult<()> {
        Err(DeviceError::Unsupported("setOffsetTuning"))
    }

    fn set_direct_sampling(&self, _mode: i32) -> DeviceResult<()> {
        Err(DeviceError::Unsupported("setDirectSampling"))
    }

    fn rtl_xtal_frequency(&self) -> DeviceResult<i64> {
        Err(DeviceError::Unsupported("getRtlXtalFrequency"))
    }

    fn tuner_xtal_frequency(&self) -> DeviceResult<i64> {
        Err(DeviceError::Unsupported("getTunerXtalFrequency"))
    }
}
