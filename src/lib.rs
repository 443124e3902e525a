pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod hal;
pub mod logging;

pub use bridge::{Bridge, BridgeBuilder};
pub use config::{BridgeConfig, ConfigStore};
pub use dispatch::{Command, DispatchOutcome, Dispatcher};
pub use engine::{Role, SessionSnapshot, SessionState};
pub use error::{BridgeError, DeviceError};
pub use events::{BridgeEvent, EventSink, EventStream};
