use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::BridgeEvent;

struct Subscription {
    id: u64,
    tx: mpsc::UnboundedSender<BridgeEvent>,
    pending_data: Arc<AtomicUsize>,
}

struct SinkInner {
    slot: Mutex<Option<Subscription>>,
    data_capacity: usize,
    next_id: AtomicU64,
    dropped_data: AtomicU64,
}

/// Single-subscriber event sink.
///
/// Attaching replaces the current subscriber (last writer wins). Events
/// published with no subscriber attached are dropped. `Data` events beyond
/// `data_capacity` undelivered buffers are shed; other events always queue.
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<SinkInner>,
}

impl EventSink {
    pub const DEFAULT_DATA_CAPACITY: usize = 64;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_DATA_CAPACITY)
    }

    pub fn with_capacity(data_capacity: usize) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                slot: Mutex::new(None),
                data_capacity: data_capacity.max(1),
                next_id: AtomicU64::new(1),
                dropped_data: AtomicU64::new(0),
            }),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Subscription>> {
        self.inner.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach a new subscriber, replacing any previous one.
    pub fn attach(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending_data = Arc::new(AtomicUsize::new(0));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let previous = self.slot().replace(Subscription {
            id,
            tx,
            pending_data: Arc::clone(&pending_data),
        });

        if let Some(old) = previous {
            info!("Event subscriber {} replaced by {}", old.id, id);
        } else {
            info!("Event subscriber {} attached", id);
        }

        EventStream {
            id,
            rx,
            pending_data,
        }
    }

    pub fn detach(&self) {
        if let Some(old) = self.slot().take() {
            info!("Event subscriber {} detached", old.id);
        }
    }

    pub fn is_attached(&self) -> bool {
        self.slot().is_some()
    }

    /// Number of `Data` events shed because the subscriber fell behind
    pub fn dropped_data_count(&self) -> u64 {
        self.inner.dropped_data.load(Ordering::Relaxed)
    }

    /// Queue an event for the current subscriber. Never blocks.
    pub fn publish(&self, event: BridgeEvent) {
        let mut slot = self.slot();

        let Some(sub) = slot.as_ref() else {
            trace!("No subscriber, dropping {} event", event.name());
            return;
        };

        let is_data = event.is_data();
        if is_data {
            if sub.pending_data.load(Ordering::Acquire) >= self.inner.data_capacity {
                self.inner.dropped_data.fetch_add(1, Ordering::Relaxed);
                trace!("Subscriber {} saturated, shedding sample data", sub.id);
                return;
            }
            sub.pending_data.fetch_add(1, Ordering::AcqRel);
        }

        if sub.tx.send(event).is_err() {
            // The stream was dropped without detaching
            debug!("Subscriber {} went away, clearing slot", sub.id);
            *slot = None;
        }
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half handed to the subscriber
pub struct EventStream {
    id: u64,
    rx: mpsc::UnboundedReceiver<BridgeEvent>,
    pending_data: Arc<AtomicUsize>,
}

impl EventStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn delivered(&self, event: &BridgeEvent) {
        if event.is_data() {
            self.pending_data.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Next event, or `None` once this subscriber has been replaced or
    /// detached and everything already queued has been drained.
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        let event = self.rx.recv().await?;
        self.delivered(&event);
        Some(event)
    }

    pub fn try_recv(&mut self) -> Option<BridgeEvent> {
        let event = self.rx.try_recv().ok()?;
        self.delivered(&event);
        Some(event)
    }

    /// Drive the stream on its own task, handing each event to `handler` in
    /// order.
    pub fn spawn_forwarder<F>(mut self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(BridgeEvent) + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(event) = self.recv().await {
                handler(event);
            }
        })
    }
}
