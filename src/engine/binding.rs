//! Platform binding for a session.
//!
//! A role must hold a binding from the host platform (on a phone this is the
//! bound foreground service) while its session is alive. The handle releases
//! the binding when dropped and carries a one-shot signal that fires if the
//! platform tears the binding down on its own.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::Role;

/// Held binding. Dropping it releases the binding.
pub struct BindingHandle {
    role: Role,
    id: u64,
    lost: Option<oneshot::Receiver<()>>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl BindingHandle {
    pub fn new(
        role: Role,
        id: u64,
        lost: oneshot::Receiver<()>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            role,
            id,
            lost: Some(lost),
            release: Some(Box::new(release)),
        }
    }

    /// Signal that resolves with `Ok(())` when the platform drops the
    /// binding. Can be taken once.
    pub fn take_lost_signal(&mut self) -> Option<oneshot::Receiver<()>> {
        self.lost.take()
    }
}

impl Drop for BindingHandle {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            debug!("Releasing {} binding {}", self.role.label(), self.id);
            release();
        }
    }
}

impl std::fmt::Debug for BindingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingHandle")
            .field("role", &self.role)
            .field("id", &self.id)
            .finish()
    }
}

/// Source of platform bindings
#[async_trait]
pub trait BindingHost: Send + Sync {
    async fn acquire(&self, role: Role) -> Result<BindingHandle>;
}

struct Held {
    role: Role,
    lost_tx: oneshot::Sender<()>,
}

/// In-process binding host.
///
/// Bindings are bookkeeping only; `revoke` simulates the platform killing
/// the bound service.
#[derive(Clone, Default)]
pub struct LocalBindingHost {
    held: Arc<Mutex<HashMap<u64, Held>>>,
    next_id: Arc<AtomicU64>,
    refuse: Arc<AtomicBool>,
    delay: Arc<Mutex<Duration>>,
}

impl LocalBindingHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse subsequent acquisitions
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Delay subsequent acquisitions
    pub fn set_acquire_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Bindings currently held
    pub fn active_count(&self) -> usize {
        self.held.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_held(&self, role: Role) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .any(|h| h.role == role)
    }

    /// Tear down every binding held for `role`. Returns how many were held.
    pub fn revoke(&self, role: Role) -> usize {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        let ids: Vec<u64> = held
            .iter()
            .filter(|(_, h)| h.role == role)
            .map(|(id, _)| *id)
            .collect();

        for id in &ids {
            if let Some(h) = held.remove(id) {
                info!("Platform revoked {} binding {}", role.label(), id);
                let _ = h.lost_tx.send(());
            }
        }
        ids.len()
    }
}

#[async_trait]
impl BindingHost for LocalBindingHost {
    async fn acquire(&self, role: Role) -> Result<BindingHandle> {
        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.refuse.load(Ordering::SeqCst) {
            return Err(anyhow!("platform refused to bind {}", role.label()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (lost_tx, lost_rx) = oneshot::channel();
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Held { role, lost_tx });
        debug!("Bound {} binding {}", role.label(), id);

        let held = Arc::clone(&self.held);
        Ok(BindingHandle::new(role, id, lost_rx, move || {
            held.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
        }))
    }
}
