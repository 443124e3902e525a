use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{DeviceDescriptor, DeviceProvider};

/// Ordered set of device providers
pub struct DeviceRegistry {
    providers: Vec<Arc<dyn DeviceProvider>>,
    enumeration_timeout: Duration,
}

impl DeviceRegistry {
    pub const DEFAULT_ENUMERATION_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            enumeration_timeout: Self::DEFAULT_ENUMERATION_TIMEOUT,
        }
    }

    pub fn with_enumeration_timeout(mut self, timeout: Duration) -> Self {
        self.enumeration_timeout = timeout;
        self
    }

    /// Register a provider. Enumeration follows registration order.
    pub fn register(&mut self, provider: impl DeviceProvider + 'static) {
        self.providers.push(Arc::new(provider));
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers
            .iter()
            .map(|p| p.provider_name().to_string())
            .collect()
    }

    /// Enumerate every provider concurrently and concatenate the results in
    /// registration order. A provider that fails, panics or times out
    /// contributes nothing.
    pub async fn list_devices(&self) -> Vec<DeviceDescriptor> {
        let timeout = self.enumeration_timeout;
        let handles: Vec<_> = self
            .providers
            .iter()
            .map(|provider| {
                let provider = Arc::clone(provider);
                tokio::spawn(async move {
                    tokio::time::timeout(timeout, provider.list_devices()).await
                })
            })
            .collect();

        let mut devices = Vec::new();
        for (provider, handle) in self.providers.iter().zip(handles) {
            let name = provider.provider_name();
            match handle.await {
                Ok(Ok(Ok(found))) => {
                    info!("{}: found {} device opening options", name, found.len());
                    devices.extend(found);
                }
                Ok(Ok(Err(e))) => {
                    warn!("{}: enumeration failed: {:#}", name, e);
                }
                Ok(Err(_)) => {
                    warn!("{}: enumeration timed out after {:?}", name, timeout);
                }
                Err(e) => {
                    warn!("{}: enumeration task failed: {}", name, e);
                }
            }
        }

        devices
    }

    /// Resolve a display name. The first match in enumeration order wins.
    pub async fn find_by_name(&self, display_name: &str) -> Option<DeviceDescriptor> {
        self.list_devices()
            .await
            .into_iter()
            .find(|d| d.display_name == display_name)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
