pub mod drivers;
pub mod hotplug;
pub mod mock;
pub mod registry;
pub mod traits;
pub mod types;

pub use hotplug::{
    HotplugNotifier, NullUsbWatcher, PollingUsbWatcher, UsbBus, UsbWatcher, WatchGuard,
};
pub use registry::DeviceRegistry;
pub use traits::{DeviceControl, DeviceProvider, SessionListener};
pub use types::{DeviceDescriptor, DeviceFamily, SessionArguments, UsbDeviceInfo};
