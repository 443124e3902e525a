use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use sdrbridge::engine::{BindingHandle, BindingHost, LocalBindingHost};
use sdrbridge::hal::mock::{ScriptedDevice, SimulatedProvider};
use sdrbridge::hal::DeviceControl;
use sdrbridge::*;

struct Harness {
    bridge: Bridge,
    dispatcher: Dispatcher,
    events: EventStream,
    host: LocalBindingHost,
    device: Arc<ScriptedDevice>,
}

fn harness() -> Harness {
    let device = Arc::new(ScriptedDevice::new("A"));
    let host = LocalBindingHost::new();
    let bridge = Bridge::builder(BridgeConfig::default())
        .provider(SimulatedProvider::new(
            "Sim",
            vec![device.clone() as Arc<dyn DeviceControl>],
        ))
        .binding_host(Arc::new(host.clone()))
        .build();
    let events = bridge.subscribe();
    let dispatcher = bridge.dispatcher();

    Harness {
        bridge,
        dispatcher,
        events,
        host,
        device,
    }
}

fn start_payload(name: &str) -> Value {
    json!([name, {"gain": 24, "samplerateHz": 2048000, "frequencyHz": 100000000, "ppm": 0}])
}

async fn next_event(events: &mut EventStream) -> BridgeEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

async fn assert_quiet(events: &mut EventStream) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(events.try_recv(), None);
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

async fn server_state(dispatcher: &Dispatcher) -> Option<SessionState> {
    dispatcher
        .session_snapshot(Role::Server)
        .await
        .map(|s| s.state)
}

async fn wait_for_state(dispatcher: &Dispatcher, name: &str) {
    for _ in 0..200 {
        if server_state(dispatcher).await.is_some_and(|s| s.name() == name) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server never reached {}", name);
}

/// Start a server on "A" and wait until the driver has been asked to open
async fn start(h: &Harness) {
    let before = h.device.open_count();
    let outcome = h.dispatcher.dispatch("startServer", start_payload("A")).await;
    assert_eq!(outcome, DispatchOutcome::Success(json!("OK")));
    let device = h.device.clone();
    wait_until(move || device.open_count() > before).await;
}

#[tokio::test]
async fn test_open_then_stop_emits_open_and_single_close() {
    let mut h = harness();
    start(&h).await;
    assert_eq!(server_state(&h.dispatcher).await, Some(SessionState::Opening));
    assert_eq!(h.host.active_count(), 1);

    assert!(h.device.report_open());
    assert_eq!(next_event(&mut h.events).await, BridgeEvent::DeviceOpen);
    wait_for_state(&h.dispatcher, "Open").await;

    let outcome = h.dispatcher.dispatch("stopServer", Value::Null).await;
    assert_eq!(outcome, DispatchOutcome::Success(json!("OK")));
    assert_eq!(next_event(&mut h.events).await, BridgeEvent::DeviceClose);
    assert_eq!(h.device.close_count(), 1);
    assert_eq!(h.host.active_count(), 0);

    // The worker's own close report arrives after the session is gone
    h.device.report_closed(None);
    assert_quiet(&mut h.events).await;

    let snapshot = h.dispatcher.session_snapshot(Role::Server).await.unwrap();
    assert_eq!(snapshot.state, SessionState::Closed);
    assert!(snapshot.close_announced);
    h.bridge.shutdown().await;
}

#[tokio::test]
async fn test_second_start_is_rejected_without_side_effects() {
    let mut h = harness();
    start(&h).await;

    let outcome = h.dispatcher.dispatch("startServer", start_payload("A")).await;
    match outcome {
        DispatchOutcome::Failure(e) => {
            assert_eq!(e, BridgeError::AlreadyActive { role: Role::Server });
            assert_eq!(e.code(), "1003");
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(h.device.open_count(), 1);
    assert_eq!(h.host.active_count(), 1);
    assert_quiet(&mut h.events).await;

    // Still rejected with an unknown name: the role check comes first
    let outcome = h.dispatcher.dispatch("startServer", start_payload("nope")).await;
    assert_eq!(
        outcome,
        DispatchOutcome::Failure(BridgeError::AlreadyActive { role: Role::Server })
    );
}

#[tokio::test]
async fn test_stop_before_open_emits_exactly_one_close() {
    let mut h = harness();
    start(&h).await;

    h.dispatcher.dispatch("stopServer", Value::Null).await;
    assert_eq!(next_event(&mut h.events).await, BridgeEvent::DeviceClose);
    assert_eq!(h.host.active_count(), 0);
    assert_eq!(h.device.close_count(), 1);
    assert_quiet(&mut h.events).await;
}

#[tokio::test]
async fn test_stop_while_binding_releases_late_binding() {
    let mut h = harness();
    h.host.set_acquire_delay(Duration::from_millis(100));

    h.dispatcher.dispatch("startServer", start_payload("A")).await;
    assert_eq!(server_state(&h.dispatcher).await, Some(SessionState::Binding));

    h.dispatcher.dispatch("stopServer", Value::Null).await;
    assert_eq!(next_event(&mut h.events).await, BridgeEvent::DeviceClose);

    // The binding arrives after the session is gone and is handed back
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.host.active_count(), 0);
    assert_eq!(h.device.open_count(), 0);
    assert_quiet(&mut h.events).await;
}

#[tokio::test]
async fn test_late_open_report_after_stop_is_suppressed() {
    let mut h = harness();
    start(&h).await;

    h.dispatcher.dispatch("stopServer", Value::Null).await;
    assert_eq!(next_event(&mut h.events).await, BridgeEvent::DeviceClose);

    h.device.report_open();
    h.device.report_closed(Some(DeviceError::Io("usb reset".into())));
    assert_quiet(&mut h.events).await;

    assert_eq!(server_state(&h.dispatcher).await, Some(SessionState::Closed));
}

#[tokio::test]
async fn test_open_failure_fails_session_and_keeps_role() {
    let mut h = harness();
    start(&h).await;

    h.device.report_closed(Some(DeviceError::Io("usb_claim_interface failed".into())));
    assert_eq!(next_event(&mut h.events).await, BridgeEvent::DeviceClose);
    wait_for_state(&h.dispatcher, "Failed").await;
    assert_eq!(h.host.active_count(), 0);

    let snapshot = h.dispatcher.session_snapshot(Role::Server).await.unwrap();
    assert!(snapshot.last_error.unwrap().contains("usb_claim_interface"));

    // The failed session still holds the role until stopped
    let outcome = h.dispatcher.dispatch("startServer", start_payload("A")).await;
    assert!(!outcome.is_success());

    h.dispatcher.dispatch("stopServer", Value::Null).await;
    assert_quiet(&mut h.events).await;

    start(&h).await;
    assert_eq!(h.device.open_count(), 2);
}

#[tokio::test]
async fn test_duplicate_close_reports_emit_one_close() {
    let mut h = harness();
    start(&h).await;
    h.device.report_open();
    assert_eq!(next_event(&mut h.events).await, BridgeEvent::DeviceOpen);

    h.device.report_closed(None);
    h.device.report_closed(None);
    h.device.report_closed(Some(DeviceError::Io("late".into())));

    assert_eq!(next_event(&mut h.events).await, BridgeEvent::DeviceClose);
    wait_for_state(&h.dispatcher, "Closed").await;

    h.dispatcher.dispatch("stopServer", Value::Null).await;
    assert_quiet(&mut h.events).await;
    // The worker already finished, so no close call is needed
    assert_eq!(h.device.close_count(), 0);
}

#[tokio::test]
async fn test_binding_loss_while_open_closes_once() {
    let mut h = harness();
    start(&h).await;
    h.device.report_open();
    assert_eq!(next_event(&mut h.events).await, BridgeEvent::DeviceOpen);

    assert_eq!(h.host.revoke(Role::Server), 1);
    assert_eq!(next_event(&mut h.events).await, BridgeEvent::DeviceClose);
    wait_for_state(&h.dispatcher, "Closed").await;
    assert_eq!(h.device.close_count(), 1);

    h.device.report_closed(None);
    h.dispatcher.dispatch("stopServer", Value::Null).await;
    assert_quiet(&mut h.events).await;
}

#[tokio::test]
async fn test_binding_loss_while_opening_fails() {
    let mut h = harness();
    start(&h).await;

    h.host.revoke(Role::Server);
    assert_eq!(next_event(&mut h.events).await, BridgeEvent::DeviceClose);
    wait_for_state(&h.dispatcher, "Failed").await;

    // A late open report must not resurrect the session
    h.device.report_open();
    assert_quiet(&mut h.events).await;
}

#[tokio::test]
async fn test_refused_binding_fails_without_opening() {
    let mut h = harness();
    h.host.set_refuse(true);

    h.dispatcher.dispatch("startServer", start_payload("A")).await;
    assert_eq!(next_event(&mut h.events).await, BridgeEvent::DeviceClose);
    wait_for_state(&h.dispatcher, "Failed").await;
    assert_eq!(h.device.open_count(), 0);
    assert_eq!(h.device.close_count(), 0);
}

#[tokio::test]
async fn test_rejected_open_fails_session() {
    let mut h = harness();
    h.device.set_reject_open(true);

    h.dispatcher.dispatch("startServer", start_payload("A")).await;
    assert_eq!(next_event(&mut h.events).await, BridgeEvent::DeviceClose);
    wait_for_state(&h.dispatcher, "Failed").await;
    assert_eq!(h.host.active_count(), 0);
}

#[tokio::test]
async fn test_data_only_flows_while_open() {
    let mut h = harness();
    start(&h).await;

    h.device.push_data(&[1, 2, 3]);
    h.device.report_open();
    assert_eq!(next_event(&mut h.events).await, BridgeEvent::DeviceOpen);
    wait_for_state(&h.dispatcher, "Open").await;

    h.device.push_data(&[4, 5]);
    assert_eq!(next_event(&mut h.events).await, BridgeEvent::data(&[4, 5]));

    h.dispatcher.dispatch("stopServer", Value::Null).await;
    h.device.push_data(&[6]);
    assert_eq!(next_event(&mut h.events).await, BridgeEvent::DeviceClose);
    assert_quiet(&mut h.events).await;
}

#[tokio::test]
async fn test_start_stop_cycles_never_double_open() {
    let h = harness();

    for _ in 0..5 {
        start(&h).await;
        let again = h.dispatcher.dispatch("startServer", start_payload("A")).await;
        assert!(!again.is_success());
        assert!(h.host.active_count() <= 1);
        h.dispatcher.dispatch("stopServer", Value::Null).await;
    }

    assert_eq!(h.device.open_count(), 5);
    assert_eq!(h.device.close_count(), 5);
    assert_eq!(h.host.active_count(), 0);
}

#[tokio::test]
async fn test_arguments_reach_driver() {
    let h = harness();
    let payload = json!(["A", {
        "gain": 0,
        "samplerateHz": 1024000,
        "frequencyHz": 433920000,
        "ppm": 12,
        "amplitude": true
    }]);
    h.dispatcher.dispatch("startServer", payload).await;
    let device = h.device.clone();
    wait_until(move || device.is_opening()).await;

    let args = h.device.last_arguments().unwrap();
    assert_eq!(args.gain, 0);
    assert_eq!(args.sample_rate_hz, 1_024_000);
    assert_eq!(args.frequency_hz, 433_920_000);
    assert_eq!(args.ppm_correction, 12);
    assert!(args.amplitude_on);
}

#[tokio::test]
async fn test_shutdown_closes_active_session() {
    let mut h = harness();
    start(&h).await;
    h.device.report_open();
    assert_eq!(next_event(&mut h.events).await, BridgeEvent::DeviceOpen);

    h.bridge.shutdown().await;
    assert_eq!(next_event(&mut h.events).await, BridgeEvent::DeviceClose);
    assert_eq!(h.host.active_count(), 0);

    let outcome = h.dispatcher.dispatch("getServerState", Value::Null).await;
    assert_eq!(
        outcome,
        DispatchOutcome::Failure(BridgeError::unexpected("bridge is shut down"))
    );
}

struct PanickingHost;

#[async_trait]
impl BindingHost for PanickingHost {
    async fn acquire(&self, _role: Role) -> Result<BindingHandle> {
        panic!("binding service crashed");
    }
}

#[tokio::test]
async fn test_panicking_binding_host_fails_session() {
    let device = Arc::new(ScriptedDevice::new("A"));
    let bridge = Bridge::builder(BridgeConfig::default())
        .provider(SimulatedProvider::new(
            "Sim",
            vec![device.clone() as Arc<dyn DeviceControl>],
        ))
        .binding_host(Arc::new(PanickingHost))
        .build();
    let mut events = bridge.subscribe();
    let dispatcher = bridge.dispatcher();

    let outcome = dispatcher.dispatch("startServer", start_payload("A")).await;
    assert_eq!(outcome, DispatchOutcome::Success(json!("OK")));

    assert_eq!(next_event(&mut events).await, BridgeEvent::DeviceClose);
    wait_for_state(&dispatcher, "Failed").await;
    assert_eq!(device.open_count(), 0);

    let snapshot = dispatcher.session_snapshot(Role::Server).await.unwrap();
    assert!(snapshot.last_error.unwrap().contains("binding"));

    // The control context survived and the role can be freed
    assert!(dispatcher.dispatch("stopServer", Value::Null).await.is_success());
    assert_quiet(&mut events).await;
}
