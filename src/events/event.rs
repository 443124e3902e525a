use serde::{Deserialize, Serialize};

/// Events delivered to the subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum BridgeEvent {
    /// Raw samples from the open device
    Data { content: Vec<u8>, length: usize },
    UsbAttached,
    UsbDetached,
    DeviceOpen,
    DeviceClose,
}

impl BridgeEvent {
    pub fn data(content: &[u8]) -> Self {
        Self::Data {
            content: content.to_vec(),
            length: content.len(),
        }
    }

    /// Sample data may be shed under back-pressure; lifecycle events may not.
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Data { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Data { .. } => "Data",
            Self::UsbAttached => "UsbAttached",
            Self::UsbDetached => "UsbDetached",
            Self::DeviceOpen => "DeviceOpen",
            Self::DeviceClose => "DeviceClose",
        }
    }
}
