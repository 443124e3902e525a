pub mod hackrf;
pub mod rtlsdr;

pub use hackrf::{HackRfBackend, HackRfDevice, HackRfNative, HackRfProvider, HACKRF_USB_IDS};
pub use rtlsdr::{
    squelch, RtlSdrBackend, RtlSdrDevice, RtlSdrNative, RtlSdrProvider, RTLSDR_USB_IDS,
};

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error};

use super::SessionListener;
use crate::error::{DeviceError, DeviceResult};

/// Owned native handle shared between a device's worker thread and its
/// control surface.
///
/// The worker publishes the handle once the hardware is configured and takes
/// it back when streaming ends, so the last `Arc` (and with it the USB
/// handle) is dropped on every exit path.
pub(crate) struct WorkerState<N: ?Sized> {
    native: Mutex<Option<Arc<N>>>,
    cancelled: AtomicBool,
    running: AtomicBool,
}

impl<N: ?Sized + Send + Sync + 'static> WorkerState<N> {
    pub(crate) fn new() -> Self {
        Self {
            native: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<N>>> {
        self.native.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Make the opened handle visible. Returns `false` when a close request
    /// arrived while the worker was still opening.
    pub(crate) fn publish(&self, native: Arc<N>) -> bool {
        let mut slot = self.slot();
        if self.is_cancelled() {
            return false;
        }
        *slot = Some(native);
        true
    }

    pub(crate) fn current(&self) -> Option<Arc<N>> {
        self.slot().clone()
    }

    pub(crate) fn with_native<R>(&self, f: impl FnOnce(&N) -> DeviceResult<R>) -> DeviceResult<R> {
        let native = self.current().ok_or(DeviceError::NotOpen)?;
        f(&native)
    }

    /// Flag the worker to stop and return the live handle, if any, so the
    /// caller can interrupt it.
    pub(crate) fn cancel(&self) -> Option<Arc<N>> {
        let slot = self.slot();
        self.cancelled.store(true, Ordering::Release);
        slot.clone()
    }

    fn finish(&self) {
        self.slot().take();
        self.running.store(false, Ordering::Release);
    }
}

/// Run `body` on a named worker thread, then release the native handle and
/// report the outcome to `listener`.
pub(crate) fn spawn_worker<N, F>(
    thread_name: &str,
    state: Arc<WorkerState<N>>,
    listener: Arc<dyn SessionListener>,
    body: F,
) -> DeviceResult<()>
where
    N: ?Sized + Send + Sync + 'static,
    F: FnOnce() -> DeviceResult<()> + Send + 'static,
{
    if state.running.swap(true, Ordering::AcqRel) {
        return Err(DeviceError::InvalidArgument(
            "device is already open or opening".to_string(),
        ));
    }
    state.cancelled.store(false, Ordering::Release);

    let worker_state = Arc::clone(&state);
    let name = thread_name.to_string();
    let spawned = std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("{} panicked: {}", name, message);
                Err(DeviceError::Io(format!("driver worker panicked: {}", message)))
            });
            worker_state.finish();
            debug!("{} finished: {:?}", name, result);
            listener.on_closed(result.err());
        });

    if let Err(e) = spawned {
        state.running.store(false, Ordering::Release);
        return Err(DeviceError::Io(format!("failed to spawn worker: {}", e)));
    }

    Ok(())
}
