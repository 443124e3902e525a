use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use sdrbridge::hal::drivers::{HackRfProvider, RtlSdrProvider};
use sdrbridge::hal::mock::{SimulatedHackRfBackend, SimulatedRtlSdrBackend, SimulatedUsbBus};
use sdrbridge::hal::{PollingUsbWatcher, UsbDeviceInfo};
use sdrbridge::logging::init_logging;
use sdrbridge::{Bridge, BridgeConfig, BridgeEvent, ConfigStore, DispatchOutcome};

async fn load_config() -> BridgeConfig {
    let store = match ConfigStore::default_path() {
        Ok(path) => ConfigStore::new(path),
        Err(_) => return BridgeConfig::default(),
    };
    match store.load().await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Using default config: {:#}", e);
            BridgeConfig::default()
        }
    }
}

fn show(command: &str, outcome: &DispatchOutcome) {
    match outcome {
        DispatchOutcome::Success(value) => info!("{} -> {}", command, value),
        DispatchOutcome::Failure(e) => warn!("{} -> error {} ({})", command, e.code(), e),
        DispatchOutcome::NotImplemented => warn!("{} -> not implemented", command),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config().await;
    init_logging(&config.log_filter);

    info!("sdrbridge demo (simulated hardware)");

    let bus = Arc::new(SimulatedUsbBus::with_devices(vec![
        UsbDeviceInfo::new("/dev/bus/usb/001/004", 0x0bda, 0x2838),
        UsbDeviceInfo::new("/dev/bus/usb/001/005", 0x1d50, 0x6089),
    ]));
    let watcher = PollingUsbWatcher::new(bus.clone(), config.hotplug_poll_interval());

    let bridge = Bridge::builder(config)
        .provider(RtlSdrProvider::new(bus.clone(), Arc::new(SimulatedRtlSdrBackend::default())))
        .provider(HackRfProvider::new(bus.clone(), Arc::new(SimulatedHackRfBackend::default())))
        .usb_watcher(Arc::new(watcher))
        .build();

    let printer = bridge.subscribe().spawn_forwarder({
        let mut buffers = 0u64;
        move |event| match event {
            BridgeEvent::Data { length, .. } => {
                buffers += 1;
                if buffers % 50 == 1 {
                    info!("Data: buffer {} ({} bytes)", buffers, length);
                }
            }
            other => info!("Event: {}", other.name()),
        }
    });

    let dispatcher = bridge.dispatcher();
    let run = |name: &'static str, payload: Value| {
        let dispatcher = dispatcher.clone();
        async move {
            let outcome = dispatcher.dispatch(name, payload).await;
            show(name, &outcome);
            outcome
        }
    };

    run("startService", Value::Null).await;

    let names = match run("listDevices", Value::Null).await {
        DispatchOutcome::Success(Value::Array(names)) => names,
        _ => Vec::new(),
    };
    let Some(first) = names.first().and_then(Value::as_str).map(str::to_string) else {
        warn!("No devices found");
        bridge.shutdown().await;
        return Ok(());
    };

    run(
        "startServer",
        json!([first, {"gain": 0, "samplerateHz": 2048000, "frequencyHz": 100000000, "ppm": 0}]),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    run("setFrequency", json!(433_920_000)).await;
    run("getFrequency", Value::Null).await;
    run("setTunergainByPercentage", json!(50)).await;
    run("getTunergain", Value::Null).await;
    run("setAmplitude", json!(1)).await;
    run("getServerState", Value::Null).await;
    let settings = json!({"gain": 0, "samplerateHz": 2048000, "frequencyHz": 1, "ppm": 0});
    run("startServer", json!([first, settings])).await;

    bus.plug(UsbDeviceInfo::new("/dev/bus/usb/001/006", 0x0bda, 0x2832));
    tokio::time::sleep(Duration::from_millis(1500)).await;

    run("stopServer", Value::Null).await;
    run("stopServer", Value::Null).await;
    run("stopService", Value::Null).await;
    run("getServerState", Value::Null).await;

    bridge.shutdown().await;
    printer.abort();

    Ok(())
}
