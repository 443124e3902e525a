//! Simulated native radio backends.
//!
//! Both produce interleaved unsigned 8-bit IQ around the 127 DC offset: a
//! single tone whose amplitude can be turned down to test the squelch.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{DeviceError, DeviceResult};
use crate::hal::drivers::{HackRfBackend, HackRfNative, RtlSdrBackend, RtlSdrNative};
use crate::hal::UsbDeviceInfo;

/// Gain table of an R820T tuner, tenths of a dB
pub const R820T_GAINS: &[i32] = &[
    0, 9, 14, 27, 37, 77, 87, 125, 144, 157, 166, 197, 207, 229, 254, 280, 297, 328, 338, 364,
    372, 386, 402, 421, 434, 439, 445, 480, 496,
];

struct IqGenerator {
    tone_hz: f64,
    sample_rate: f64,
    amplitude: f64,
    phase: f64,
}

impl IqGenerator {
    fn new(tone_hz: f64, amplitude: f64) -> Self {
        Self {
            tone_hz,
            sample_rate: 2_048_000.0,
            amplitude,
            phase: 0.0,
        }
    }

    fn next_buffer(&mut self, iq_pairs: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(iq_pairs * 2);
        let delta_phase = 2.0 * PI * self.tone_hz / self.sample_rate;

        for _ in 0..iq_pairs {
            buf.push((127.0 + self.amplitude * self.phase.cos()).round() as u8);
            buf.push((127.0 + self.amplitude * self.phase.sin()).round() as u8);
            self.phase += delta_phase;
            if self.phase > 2.0 * PI {
                self.phase -= 2.0 * PI;
            }
        }

        buf
    }
}

/// Knobs shared by the simulated backends
#[derive(Debug, Clone)]
pub struct SimulationProfile {
    /// Delay before the native open completes
    pub open_delay: Duration,
    /// Time between sample buffers
    pub buffer_interval: Duration,
    /// IQ pairs per buffer
    pub buffer_pairs: usize,
    /// Tone amplitude, 0..=127
    pub amplitude: f64,
    /// Fail the stream after this many buffers
    pub fail_after_buffers: Option<usize>,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            open_delay: Duration::ZERO,
            buffer_interval: Duration::from_millis(10),
            buffer_pairs: 256,
            amplitude: 100.0,
            fail_after_buffers: None,
        }
    }
}

/// Counters observable from tests
#[derive(Default)]
pub struct SimulationStats {
    opens: AtomicUsize,
    releases: AtomicUsize,
    buffers: AtomicUsize,
}

impl SimulationStats {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Native handles dropped so far
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn buffers(&self) -> usize {
        self.buffers.load(Ordering::SeqCst)
    }
}

/// Cancellable sample pump shared by both simulated radios
struct Stream {
    profile: SimulationProfile,
    generator: Mutex<IqGenerator>,
    cancel_tx: Sender<()>,
    cancel_rx: Receiver<()>,
    stats: Arc<SimulationStats>,
}

impl Stream {
    fn new(profile: SimulationProfile, stats: Arc<SimulationStats>) -> Self {
        let (cancel_tx, cancel_rx) = bounded(1);
        let generator = IqGenerator::new(25_000.0, profile.amplitude);
        Self {
            profile,
            generator: Mutex::new(generator),
            cancel_tx,
            cancel_rx,
            stats,
        }
    }

    fn run(&self, on_samples: &mut dyn FnMut(&[u8])) -> DeviceResult<()> {
        let mut produced = 0usize;
        loop {
            match self.cancel_rx.recv_timeout(self.profile.buffer_interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return Ok(()),
                Err(RecvTimeoutError::Timeout) => {}
            }

            if self.profile.fail_after_buffers == Some(produced) {
                return Err(DeviceError::Io("simulated transfer error".to_string()));
            }

            let buf = self
                .generator
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .next_buffer(self.profile.buffer_pairs);
            self.stats.buffers.fetch_add(1, Ordering::SeqCst);
            on_samples(&buf);
            produced += 1;
        }
    }

    fn cancel(&self) {
        let _ = self.cancel_tx.try_send(());
    }

    fn set_sample_rate(&self, rate_hz: u32) {
        let mut generator = self.generator.lock().unwrap_or_else(|e| e.into_inner());
        generator.sample_rate = rate_hz.max(1) as f64;
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.stats.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Last values programmed into a simulated RTL dongle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RtlRegisters {
    pub freq_correction: i32,
    pub sample_rate: u32,
    pub center_freq: u32,
    pub manual_gain: bool,
    pub tuner_gain: i32,
    pub agc: bool,
    pub offset_tuning: bool,
    pub direct_sampling: i32,
    pub buffer_resets: usize,
}

struct SimulatedRtlSdr {
    registers: Arc<Mutex<RtlRegisters>>,
    stream: Stream,
}

impl SimulatedRtlSdr {
    fn regs(&self) -> std::sync::MutexGuard<'_, RtlRegisters> {
        self.registers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RtlSdrNative for SimulatedRtlSdr {
    fn set_freq_correction(&self, ppm: i32) -> DeviceResult<()> {
        self.regs().freq_correction = ppm;
        Ok(())
    }

    fn freq_correction(&self) -> i32 {
        self.regs().freq_correction
    }

    fn set_sample_rate(&self, rate_hz: u32) -> DeviceResult<()> {
        // RTL2832 accepts 225001..=300000 and 900001..=3200000
        if !(225_001..=300_000).contains(&rate_hz) && !(900_001..=3_200_000).contains(&rate_hz) {
            return Err(DeviceError::InvalidArgument(format!("invalid sample rate {}", rate_hz)));
        }
        self.regs().sample_rate = rate_hz;
        self.stream.set_sample_rate(rate_hz);
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.regs().sample_rate
    }

    fn set_center_freq(&self, frequency_hz: u32) -> DeviceResult<()> {
        self.regs().center_freq = frequency_hz;
        Ok(())
    }

    fn center_freq(&self) -> u32 {
        self.regs().center_freq
    }

    fn set_tuner_gain_mode(&self, manual: bool) -> DeviceResult<()> {
        self.regs().manual_gain = manual;
        Ok(())
    }

    fn set_tuner_gain(&self, gain: i32) -> DeviceResult<()> {
        self.regs().tuner_gain = gain;
        Ok(())
    }

    fn tuner_gain(&self) -> i32 {
        self.regs().tuner_gain
    }

    fn tuner_gains(&self) -> Vec<i32> {
        R820T_GAINS.to_vec()
    }

    fn set_agc_mode(&self, on: bool) -> DeviceResult<()> {
        self.regs().agc = on;
        Ok(())
    }

    fn set_offset_tuning(&self, on: bool) -> DeviceResult<()> {
        self.regs().offset_tuning = on;
        Ok(())
    }

    fn set_direct_sampling(&self, mode: i32) -> DeviceResult<()> {
        if !(0..=2).contains(&mode) {
            return Err(DeviceError::InvalidArgument(format!("direct sampling mode {}", mode)));
        }
        self.regs().direct_sampling = mode;
        Ok(())
    }

    fn xtal_freq(&self) -> (u32, u32) {
        (28_800_000, 28_800_000)
    }

    fn reset_buffer(&self) -> DeviceResult<()> {
        self.regs().buffer_resets += 1;
        Ok(())
    }

    fn read_async(&self, on_samples: &mut dyn FnMut(&[u8])) -> DeviceResult<()> {
        self.stream.run(on_samples)
    }

    fn cancel_async(&self) {
        self.stream.cancel();
    }
}

/// Hands out simulated RTL dongles
pub struct SimulatedRtlSdrBackend {
    profile: SimulationProfile,
    fail_open: AtomicBool,
    registers: Arc<Mutex<RtlRegisters>>,
    stats: Arc<SimulationStats>,
}

impl SimulatedRtlSdrBackend {
    pub fn new(profile: SimulationProfile) -> Self {
        Self {
            profile,
            fail_open: AtomicBool::new(false),
            registers: Arc::new(Mutex::new(RtlRegisters::default())),
            stats: Arc::new(SimulationStats::default()),
        }
    }

    /// Make subsequent opens fail as if the USB claim was refused
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn registers(&self) -> RtlRegisters {
        self.registers.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn stats(&self) -> Arc<SimulationStats> {
        Arc::clone(&self.stats)
    }
}

impl Default for SimulatedRtlSdrBackend {
    fn default() -> Self {
        Self::new(SimulationProfile::default())
    }
}

impl RtlSdrBackend for SimulatedRtlSdrBackend {
    fn open(&self, device: &UsbDeviceInfo) -> DeviceResult<Box<dyn RtlSdrNative>> {
        std::thread::sleep(self.profile.open_delay);
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(DeviceError::Io(format!("usb_claim_interface failed on {}", device.path)));
        }

        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedRtlSdr {
            registers: Arc::clone(&self.registers),
            stream: Stream::new(self.profile.clone(), Arc::clone(&self.stats)),
        }))
    }
}

/// Last values programmed into a simulated HackRF
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HackRfRegisters {
    pub frequency: u64,
    pub sample_rate: u32,
    pub amp_enabled: bool,
    pub queue_size: usize,
}

struct SimulatedHackRf {
    registers: Arc<Mutex<HackRfRegisters>>,
    stream: Stream,
}

impl SimulatedHackRf {
    fn regs(&self) -> std::sync::MutexGuard<'_, HackRfRegisters> {
        self.registers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl HackRfNative for SimulatedHackRf {
    fn set_frequency(&self, frequency_hz: u64) -> DeviceResult<()> {
        self.regs().frequency = frequency_hz;
        Ok(())
    }

    fn set_sample_rate(&self, rate_hz: u32) -> DeviceResult<()> {
        self.regs().sample_rate = rate_hz;
        self.stream.set_sample_rate(rate_hz);
        Ok(())
    }

    fn set_amp_enable(&self, on: bool) -> DeviceResult<()> {
        self.regs().amp_enabled = on;
        Ok(())
    }

    fn receive(&self, on_samples: &mut dyn FnMut(&[u8])) -> DeviceResult<()> {
        self.stream.run(on_samples)
    }

    fn stop(&self) {
        self.stream.cancel();
    }
}

/// Hands out simulated HackRF boards
pub struct SimulatedHackRfBackend {
    profile: SimulationProfile,
    registers: Arc<Mutex<HackRfRegisters>>,
    stats: Arc<SimulationStats>,
}

impl SimulatedHackRfBackend {
    pub fn new(profile: SimulationProfile) -> Self {
        Self {
            profile,
            registers: Arc::new(Mutex::new(HackRfRegisters::default())),
            stats: Arc::new(SimulationStats::default()),
        }
    }

    pub fn registers(&self) -> HackRfRegisters {
        self.registers.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn stats(&self) -> Arc<SimulationStats> {
        Arc::clone(&self.stats)
    }
}

impl Default for SimulatedHackRfBackend {
    fn default() -> Self {
        Self::new(SimulationProfile::default())
    }
}

impl HackRfBackend for SimulatedHackRfBackend {
    fn open(
        &self,
        _device: &UsbDeviceInfo,
        queue_size: usize,
    ) -> DeviceResult<Box<dyn HackRfNative>> {
        std::thread::sleep(self.profile.open_delay);
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        self.registers.lock().unwrap_or_else(|e| e.into_inner()).queue_size = queue_size;

        Ok(Box::new(SimulatedHackRf {
            registers: Arc::clone(&self.registers),
            stream: Stream::new(self.profile.clone(), Arc::clone(&self.stats)),
        }))
    }
}
