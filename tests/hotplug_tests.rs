use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sdrbridge::engine::{BindingHandle, BindingHost, LocalBindingHost};
use sdrbridge::hal::mock::{ManualUsbWatcher, SimulatedUsbBus};
use sdrbridge::hal::{HotplugNotifier, PollingUsbWatcher, UsbBus, UsbDeviceInfo, UsbWatcher};
use sdrbridge::*;

async fn next_event(events: &mut EventStream) -> BridgeEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

async fn watcher_state(dispatcher: &Dispatcher) -> Option<String> {
    dispatcher
        .session_snapshot(Role::HotplugWatcher)
        .await
        .map(|s| s.state.name().to_string())
}

async fn wait_for_watcher(dispatcher: &Dispatcher, name: &str) {
    for _ in 0..200 {
        if watcher_state(dispatcher).await.as_deref() == Some(name) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("watcher never reached {}", name);
}

fn bridge(watcher: Arc<ManualUsbWatcher>, host: &LocalBindingHost) -> Bridge {
    Bridge::builder(BridgeConfig::default())
        .usb_watcher(watcher)
        .binding_host(Arc::new(host.clone()))
        .build()
}

#[tokio::test]
async fn test_service_forwards_attach_and_detach() {
    let watcher = Arc::new(ManualUsbWatcher::new());
    let host = LocalBindingHost::new();
    let bridge = bridge(watcher.clone(), &host);
    let mut events = bridge.subscribe();
    let dispatcher = bridge.dispatcher();

    // Nothing is watching yet
    assert!(!watcher.attach());

    dispatcher.dispatch("startService", Value::Null).await;
    wait_for_watcher(&dispatcher, "Open").await;
    assert!(host.is_held(Role::HotplugWatcher));

    assert!(watcher.attach());
    assert!(watcher.detach());
    assert_eq!(next_event(&mut events).await, BridgeEvent::UsbAttached);
    assert_eq!(next_event(&mut events).await, BridgeEvent::UsbDetached);

    dispatcher.dispatch("stopService", Value::Null).await;
    assert!(!watcher.is_watching());
    assert!(!host.is_held(Role::HotplugWatcher));
    assert_eq!(watcher_state(&dispatcher).await.as_deref(), Some("Closed"));

    // Watcher sessions never announce device open/close
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(events.try_recv(), None);
}

#[tokio::test]
async fn test_service_is_independent_of_server() {
    let watcher = Arc::new(ManualUsbWatcher::new());
    let host = LocalBindingHost::new();
    let bridge = bridge(watcher.clone(), &host);
    let mut events = bridge.subscribe();
    let dispatcher = bridge.dispatcher();

    dispatcher.dispatch("startService", Value::Null).await;
    wait_for_watcher(&dispatcher, "Open").await;

    let outcome = dispatcher.dispatch("stopServer", Value::Null).await;
    assert_eq!(
        outcome,
        DispatchOutcome::Failure(BridgeError::NotActive { role: Role::Server })
    );

    watcher.attach();
    assert_eq!(next_event(&mut events).await, BridgeEvent::UsbAttached);
}

#[tokio::test]
async fn test_refused_registration_fails_watcher() {
    let watcher = Arc::new(ManualUsbWatcher::new());
    watcher.set_refuse(true);
    let host = LocalBindingHost::new();
    let bridge = bridge(watcher.clone(), &host);
    let dispatcher = bridge.dispatcher();

    dispatcher.dispatch("startService", Value::Null).await;
    wait_for_watcher(&dispatcher, "Failed").await;
    assert_eq!(host.active_count(), 0);

    // Role stays taken until stopped
    let outcome = dispatcher.dispatch("startService", Value::Null).await;
    assert_eq!(
        outcome,
        DispatchOutcome::Failure(BridgeError::AlreadyActive { role: Role::HotplugWatcher })
    );
    assert!(dispatcher.dispatch("stopService", Value::Null).await.is_success());

    watcher.set_refuse(false);
    dispatcher.dispatch("startService", Value::Null).await;
    wait_for_watcher(&dispatcher, "Open").await;
}

#[tokio::test]
async fn test_binding_loss_unregisters_watcher() {
    let watcher = Arc::new(ManualUsbWatcher::new());
    let host = LocalBindingHost::new();
    let bridge = bridge(watcher.clone(), &host);
    let dispatcher = bridge.dispatcher();

    dispatcher.dispatch("startService", Value::Null).await;
    wait_for_watcher(&dispatcher, "Open").await;

    host.revoke(Role::HotplugWatcher);
    wait_for_watcher(&dispatcher, "Closed").await;
    assert!(!watcher.is_watching());
    assert!(dispatcher.dispatch("stopService", Value::Null).await.is_success());
}

#[tokio::test]
async fn test_polling_watcher_diffs_bus() {
    let bus = Arc::new(SimulatedUsbBus::with_devices(vec![UsbDeviceInfo::new(
        "/dev/bus/usb/001/004",
        0x0bda,
        0x2838,
    )]));
    let sink = EventSink::new();
    let mut events = sink.attach();

    let watcher = PollingUsbWatcher::new(bus.clone(), Duration::from_millis(20));
    let guard = watcher.watch(HotplugNotifier::new(sink.clone())).unwrap();

    // Let the first poll record the devices already present
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(events.try_recv(), None);

    bus.plug(UsbDeviceInfo::new("/dev/bus/usb/001/005", 0x1d50, 0x6089));
    assert_eq!(next_event(&mut events).await, BridgeEvent::UsbAttached);

    bus.unplug("/dev/bus/usb/001/004");
    assert_eq!(next_event(&mut events).await, BridgeEvent::UsbDetached);

    // A failing poll is skipped, not reported
    bus.set_failing(true);
    tokio::time::sleep(Duration::from_millis(60)).await;
    bus.set_failing(false);

    drop(guard);
    tokio::time::sleep(Duration::from_millis(60)).await;
    bus.plug(UsbDeviceInfo::new("/dev/bus/usb/001/006", 0x0bda, 0x2832));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(events.try_recv(), None);
}

/// Bus whose first read is instant and later reads stall, then report a
/// newly plugged device
struct StallingBus {
    reads: AtomicUsize,
}

impl UsbBus for StallingBus {
    fn devices(&self) -> Result<Vec<UsbDeviceInfo>> {
        if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(Vec::new());
        }
        std::thread::sleep(Duration::from_millis(200));
        Ok(vec![UsbDeviceInfo::new("/dev/bus/usb/001/007", 0x0bda, 0x2838)])
    }
}

#[tokio::test]
async fn test_dropping_guard_discards_poll_in_flight() {
    let bus = Arc::new(StallingBus {
        reads: AtomicUsize::new(0),
    });
    let sink = EventSink::new();
    let mut events = sink.attach();

    let watcher = PollingUsbWatcher::new(bus.clone(), Duration::from_millis(20));
    let guard = watcher.watch(HotplugNotifier::new(sink.clone())).unwrap();

    // Wait until the second, stalling read is under way
    for _ in 0..100 {
        if bus.reads.load(Ordering::SeqCst) >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(bus.reads.load(Ordering::SeqCst) >= 2);

    drop(guard);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(events.try_recv(), None);
}

struct PanickingHost;

#[async_trait]
impl BindingHost for PanickingHost {
    async fn acquire(&self, _role: Role) -> Result<BindingHandle> {
        panic!("binding service crashed");
    }
}

#[tokio::test]
async fn test_panicking_binding_host_fails_watcher() {
    let watcher = Arc::new(ManualUsbWatcher::new());
    let bridge = Bridge::builder(BridgeConfig::default())
        .usb_watcher(watcher.clone())
        .binding_host(Arc::new(PanickingHost))
        .build();
    let dispatcher = bridge.dispatcher();

    dispatcher.dispatch("startService", Value::Null).await;
    wait_for_watcher(&dispatcher, "Failed").await;
    assert!(!watcher.is_watching());

    let snapshot = dispatcher.session_snapshot(Role::HotplugWatcher).await.unwrap();
    assert!(snapshot.last_error.unwrap().contains("binding"));
    assert!(dispatcher.dispatch("stopService", Value::Null).await.is_success());
}
