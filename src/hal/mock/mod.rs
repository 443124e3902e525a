pub mod radio;
pub mod scripted;
pub mod usb;

pub use radio::{
    HackRfRegisters, RtlRegisters, SimulatedHackRfBackend, SimulatedRtlSdrBackend,
    SimulationProfile, SimulationStats, R820T_GAINS,
};
pub use scripted::{ScriptedDevice, SimulatedProvider};
pub use usb::{ManualUsbWatcher, SimulatedUsbBus};
