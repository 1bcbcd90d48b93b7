use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use wearable_link::domain::permissions::StaticPlatform;
use wearable_link::domain::settings::SettingsService;
use wearable_link::infrastructure::logging::init_logger;
use wearable_link::infrastructure::store::{DeviceStore, JsonFileStore};
use wearable_link::infrastructure::transport::{
    FirmwareStatus, FirmwareUpdate, SimulatedDevice, SimulatorHandle, TransportFactory,
    TransportKind,
};
use wearable_link::{
    ConnectionPhase, DeviceConfig, DeviceEvent, DeviceManager, FirmwareChoice, GestureId,
    ManagerOptions, Requirement, SensorId, UpdateInterval,
};

const TICK: Duration = Duration::from_millis(50);
const RUN_LIMIT: Duration = Duration::from_secs(20);

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let settings = SettingsService::new()?.get().clone();
    let _guard = init_logger(&settings.log_settings)?;
    info!("Starting wearable link demo");

    let simulator = SimulatorHandle::new();
    simulator.set_latency(Duration::from_millis(120));
    simulator.add_device(SimulatedDevice::sample("frames-01", "Frames", -48));
    simulator.add_device(
        SimulatedDevice::sample("buds-02", "Buds", -71).with_firmware(FirmwareStatus {
            sufficient: true,
            update: FirmwareUpdate::Optional,
        }),
    );

    let store_path = match &settings.store_path {
        Some(path) => PathBuf::from(path),
        None => JsonFileStore::default_path()?,
    };
    let store = JsonFileStore::open(store_path);
    let last_device = store.last_device_uid();

    let kind = match settings.transport {
        TransportKind::Simulated => TransportKind::Simulated,
        other => {
            warn!(?other, "no native bridge in the demo, using the simulator");
            TransportKind::Simulated
        }
    };
    let mut manager = DeviceManager::new(
        ManagerOptions::from_settings(&settings),
        TransportFactory::with_simulator(simulator.clone()),
        kind,
        Box::new(StaticPlatform::all_granted()),
        Box::new(store),
    )?;
    let mut events = manager.subscribe();

    let motion = Requirement::with_config(
        "motion",
        DeviceConfig::disabled()
            .with_sensor(SensorId::Accelerometer)
            .with_interval(UpdateInterval::Ms160),
    );
    let head_tracking = Requirement::with_config(
        "head-tracking",
        DeviceConfig::disabled()
            .with_sensor(SensorId::Gyroscope)
            .with_gesture(GestureId::HeadNod)
            .with_interval(UpdateInterval::Ms80),
    );

    let start = Instant::now();
    match last_device {
        Some(uid) => {
            info!(%uid, "trying last device first");
            manager.reconnect_to_last(start)?;
        }
        None => manager.search(start),
    }

    let mut ticker = tokio::time::interval(TICK);
    let mut registered = false;
    let mut readback = None;

    loop {
        ticker.tick().await;
        let now = Instant::now();
        manager.tick(now);

        while let Ok(event) = events.try_recv() {
            info!(?event, "device event");
            match event {
                DeviceEvent::DevicesUpdated(devices)
                    if manager.phase() == ConnectionPhase::Searching =>
                {
                    if let Some(strongest) = devices.into_iter().next() {
                        manager.connect(strongest, now);
                    }
                }
                DeviceEvent::FirmwareUpdateAvailable {
                    mandatory: false, ..
                } => manager.respond_to_firmware(FirmwareChoice::Continue),
                DeviceEvent::ConnectionStatusChanged {
                    phase: ConnectionPhase::Connected,
                    ..
                } if !registered => {
                    manager.register_requirement(&motion);
                    manager.register_requirement(&head_tracking);
                    registered = true;
                }
                DeviceEvent::ConfigurationSucceeded(_) if readback.is_none() => {
                    readback = Some(manager.request_configuration()?);
                }
                _ => {}
            }
        }

        if let Some(reply) = readback.as_mut() {
            if let Ok(config) = reply.try_recv() {
                info!(
                    sensors = ?config.enabled_sensors(),
                    gestures = ?config.enabled_gestures(),
                    interval_ms = config.update_interval().millis(),
                    "device configuration read back"
                );
                break;
            }
        }
        if now.duration_since(start) >= RUN_LIMIT {
            warn!(phase = ?manager.phase(), "demo did not finish in time");
            break;
        }
    }

    manager.shutdown();
    info!("Demo finished");
    Ok(())
}
