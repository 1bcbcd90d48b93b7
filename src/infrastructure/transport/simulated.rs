//! Simulated Transport
//!
//! An in-process device whose behaviour is scripted through a
//! [`SimulatorHandle`]. Every call is queued and answered on a later
//! [`tick`](TransportProvider::tick), after the configured latency, just
//! like a real link would.

use crate::domain::config::DeviceConfig;
use crate::domain::intent::{IntentProfile, IntentValidationResult};
use crate::domain::models::{
    Device, DeviceStatus, DynamicDeviceInfo, GestureFlags, IntervalFlags, NoiseReductionMode,
    SensorFlags,
};
use crate::domain::permissions::{OsService, Permission};
use crate::infrastructure::transport::{
    ConfigurationRequests, FirmwareStatus, TransportEvent, TransportEventSender, TransportKind,
    TransportProvider,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, trace};

/// A scripted device and how it answers each step of the handshake.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub device: Device,
    pub firmware: FirmwareStatus,
    pub accept_pairing: bool,
    /// Reported alongside a failed intent validation.
    pub intent_update_available: bool,
    pub reject_sensors: bool,
    pub reject_gestures: bool,
}

impl SimulatedDevice {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            firmware: FirmwareStatus::default(),
            accept_pairing: true,
            intent_update_available: false,
            reject_sensors: false,
            reject_gestures: false,
        }
    }

    /// A device advertising every capability.
    pub fn sample(uid: &str, name: &str, rssi: i32) -> Self {
        Self::new(Device {
            uid: uid.to_string(),
            name: name.to_string(),
            firmware_version: "4.5.2".to_string(),
            rssi,
            available_sensors: SensorFlags::all(),
            available_gestures: GestureFlags::all(),
            available_intervals: IntervalFlags::all(),
            product_id: 0x400c,
            variant_id: 1,
            dynamic_info: DynamicDeviceInfo {
                available_noise_reduction_modes: vec![
                    NoiseReductionMode::Off,
                    NoiseReductionMode::Low,
                    NoiseReductionMode::High,
                ],
                ..DynamicDeviceInfo::default()
            },
        })
    }

    pub fn with_firmware(mut self, firmware: FirmwareStatus) -> Self {
        self.firmware = firmware;
        self
    }

    pub fn with_sensors(mut self, sensors: SensorFlags) -> Self {
        self.device.available_sensors = sensors;
        self
    }

    pub fn with_status(mut self, status: DeviceStatus) -> Self {
        self.device.dynamic_info.device_status = status;
        self
    }

    pub fn rejecting_pairing(mut self) -> Self {
        self.accept_pairing = false;
        self
    }

    pub fn with_intent_update(mut self) -> Self {
        self.intent_update_available = true;
        self
    }

    pub fn rejecting_configuration(mut self, sensors: bool, gestures: bool) -> Self {
        self.reject_sensors = sensors;
        self.reject_gestures = gestures;
        self
    }
}

#[derive(Debug, Clone)]
enum Operation {
    Discover,
    Open(String),
    CheckFirmware,
    Pair,
    ValidateIntent(IntentProfile),
    Apply(DeviceConfig),
    ReadConfig,
}

#[derive(Debug)]
struct Scheduled {
    operation: Operation,
    due: Option<Instant>,
}

#[derive(Debug)]
struct SearchState {
    profile: Option<IntentProfile>,
    last_uid: Option<String>,
}

#[derive(Debug, Default)]
struct SimulatorState {
    devices: Vec<SimulatedDevice>,
    latency: Duration,
    permissions: Vec<Permission>,
    services: Vec<OsService>,
    search: Option<SearchState>,
    connecting: Option<String>,
    session: Option<String>,
    connect_failure: Option<Option<String>>,
    dynamic: Option<DynamicDeviceInfo>,
    applied: DeviceConfig,
    queue: Vec<Scheduled>,
    config_requests: ConfigurationRequests,
    search_calls: usize,
    cancel_calls: usize,
    pushed: Vec<DeviceConfig>,
}

impl SimulatorState {
    fn schedule(&mut self, operation: Operation) {
        trace!(?operation, "simulated operation queued");
        self.queue.push(Scheduled {
            operation,
            due: None,
        });
    }

    fn find(&self, uid: &str) -> Option<&SimulatedDevice> {
        self.devices.iter().find(|d| d.device.uid == uid)
    }

    fn session_device(&self) -> Option<&SimulatedDevice> {
        self.session.as_deref().and_then(|uid| self.find(uid))
    }
}

/// Shared script and probe for a simulated device population.
#[derive(Debug, Clone, Default)]
pub struct SimulatorHandle {
    state: Rc<RefCell<SimulatorState>>,
}

impl SimulatorHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.borrow_mut().latency = latency;
    }

    /// Preconditions the transport reports to the permission gate.
    pub fn require(&self, permissions: &[Permission], services: &[OsService]) {
        let mut state = self.state.borrow_mut();
        state.permissions = permissions.to_vec();
        state.services = services.to_vec();
    }

    pub fn add_device(&self, device: SimulatedDevice) {
        self.state.borrow_mut().devices.push(device);
    }

    pub fn remove_device(&self, uid: &str) {
        self.state.borrow_mut().devices.retain(|d| d.device.uid != uid);
    }

    /// The next connection attempt fails with `message`.
    pub fn fail_next_connect(&self, message: Option<&str>) {
        self.state.borrow_mut().connect_failure = Some(message.map(str::to_string));
    }

    /// The device closes the session on its own.
    pub fn drop_connection(&self) {
        let mut state = self.state.borrow_mut();
        if let Some(uid) = state.session.take() {
            info!(%uid, "simulated device dropped the connection");
        }
        state.dynamic = None;
        state.applied = DeviceConfig::disabled();
    }

    /// Replace the live dynamic info of the connected device.
    pub fn set_dynamic_info(&self, info: DynamicDeviceInfo) {
        let mut state = self.state.borrow_mut();
        if state.session.is_some() {
            state.dynamic = Some(info);
        }
    }

    pub fn dynamic_info(&self) -> Option<DynamicDeviceInfo> {
        self.state.borrow().dynamic.clone()
    }

    pub fn open_search_handles(&self) -> usize {
        usize::from(self.state.borrow().search.is_some())
    }

    pub fn open_session_handles(&self) -> usize {
        let state = self.state.borrow();
        usize::from(state.session.is_some()) + usize::from(state.connecting.is_some())
    }

    pub fn search_calls(&self) -> usize {
        self.state.borrow().search_calls
    }

    pub fn cancel_calls(&self) -> usize {
        self.state.borrow().cancel_calls
    }

    /// Every configuration pushed through `set_configuration`, in order.
    pub fn pushed_configs(&self) -> Vec<DeviceConfig> {
        self.state.borrow().pushed.clone()
    }

    pub fn applied_config(&self) -> DeviceConfig {
        self.state.borrow().applied.clone()
    }
}

pub struct SimulatedTransport {
    state: SimulatorHandle,
    events: TransportEventSender,
}

impl SimulatedTransport {
    pub fn new(state: SimulatorHandle, events: TransportEventSender) -> Self {
        Self { state, events }
    }

    fn send(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn execute(&self, operation: Operation) {
        let mut state = self.state.state.borrow_mut();
        match operation {
            Operation::Discover => {
                let Some(search) = state.search.as_ref() else {
                    return;
                };
                let mut found: Vec<Device> = state
                    .devices
                    .iter()
                    .map(|d| d.device.clone())
                    .filter(|d| {
                        search
                            .profile
                            .as_ref()
                            .map_or(true, |p| p.is_satisfied_by(d))
                    })
                    .collect();
                if let Some(last) = search.last_uid.as_deref() {
                    found.sort_by_key(|d| d.uid != last);
                }
                debug!(count = found.len(), "simulated discovery");
                drop(state);
                self.send(TransportEvent::DevicesUpdated(found));
            }
            Operation::Open(uid) => {
                if state.connecting.as_deref() != Some(uid.as_str()) {
                    return;
                }
                state.connecting = None;
                if let Some(message) = state.connect_failure.take() {
                    drop(state);
                    self.send(TransportEvent::ConnectionFailed { message });
                    return;
                }
                let Some(dynamic) = state.find(&uid).map(|d| d.device.dynamic_info.clone())
                else {
                    drop(state);
                    self.send(TransportEvent::ConnectionFailed {
                        message: Some(format!("device {uid} not found")),
                    });
                    return;
                };
                info!(%uid, "simulated session open");
                state.session = Some(uid);
                state.dynamic = Some(dynamic);
                state.applied = DeviceConfig::disabled();
            }
            Operation::CheckFirmware => {
                let Some(firmware) = state.session_device().map(|d| d.firmware) else {
                    return;
                };
                drop(state);
                self.send(TransportEvent::FirmwareChecked(firmware));
            }
            Operation::Pair => {
                let Some(accepted) = state.session_device().map(|d| d.accept_pairing) else {
                    return;
                };
                if accepted {
                    if let Some(dynamic) = state.dynamic.as_mut() {
                        dynamic.device_status.insert(DeviceStatus::ALREADY_PAIRED);
                    }
                }
                drop(state);
                self.send(TransportEvent::PairingCompleted { accepted });
            }
            Operation::ValidateIntent(profile) => {
                let Some(result) = state.session_device().map(|d| IntentValidationResult {
                    supported: profile.is_satisfied_by(&d.device),
                    update_would_satisfy: d.intent_update_available,
                }) else {
                    return;
                };
                drop(state);
                self.send(TransportEvent::IntentValidated(result));
            }
            Operation::Apply(config) => {
                let (sensors_ok, gestures_ok) = match state.session_device() {
                    Some(d) => (!d.reject_sensors, !d.reject_gestures),
                    None => (false, false),
                };
                if state.session.is_some() {
                    let sensors = if sensors_ok { &config } else { &state.applied };
                    let gestures = if gestures_ok { &config } else { &state.applied };
                    state.applied = DeviceConfig::combine(sensors, gestures);
                }
                state.pushed.push(config);
                drop(state);
                self.send(TransportEvent::ConfigurationApplied {
                    sensors_ok,
                    gestures_ok,
                });
            }
            Operation::ReadConfig => {
                let applied = state.applied.clone();
                state.config_requests.complete(&applied);
            }
        }
    }
}

impl TransportProvider for SimulatedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Simulated
    }

    fn required_permissions(&self) -> Vec<Permission> {
        self.state.state.borrow().permissions.clone()
    }

    fn required_services(&self) -> Vec<OsService> {
        self.state.state.borrow().services.clone()
    }

    fn search(
        &mut self,
        profile: Option<&IntentProfile>,
        last_uid: Option<&str>,
        _timeout: Duration,
    ) {
        let mut state = self.state.state.borrow_mut();
        state.search = Some(SearchState {
            profile: profile.cloned(),
            last_uid: last_uid.map(str::to_string),
        });
        state.search_calls += 1;
        state.schedule(Operation::Discover);
    }

    fn stop_search(&mut self) {
        let mut state = self.state.state.borrow_mut();
        state.search = None;
        state
            .queue
            .retain(|s| !matches!(s.operation, Operation::Discover));
    }

    fn cancel(&mut self) {
        let mut state = self.state.state.borrow_mut();
        state.search = None;
        state.connecting = None;
        state.session = None;
        state.dynamic = None;
        state.queue.clear();
        state.config_requests.abandon();
        state.cancel_calls += 1;
        debug!("simulated transport cancelled");
    }

    fn connect(&mut self, device: &Device) {
        let mut state = self.state.state.borrow_mut();
        state.connecting = Some(device.uid.clone());
        state.schedule(Operation::Open(device.uid.clone()));
    }

    fn disconnect(&mut self) {
        let mut state = self.state.state.borrow_mut();
        state.connecting = None;
        state.session = None;
        state.dynamic = None;
        state.applied = DeviceConfig::disabled();
        state.queue.clear();
        state.config_requests.abandon();
    }

    fn is_session_open(&self) -> bool {
        self.state.state.borrow().session.is_some()
    }

    fn connected_device(&self) -> Option<Device> {
        let state = self.state.state.borrow();
        let device = state.session_device()?.device.clone();
        Some(match state.dynamic.clone() {
            Some(info) => device.with_dynamic_info(info),
            None => device,
        })
    }

    fn check_firmware(&mut self) {
        self.state
            .state
            .borrow_mut()
            .schedule(Operation::CheckFirmware);
    }

    fn begin_secure_pairing(&mut self) {
        self.state.state.borrow_mut().schedule(Operation::Pair);
    }

    fn set_configuration(&mut self, config: &DeviceConfig) {
        self.state
            .state
            .borrow_mut()
            .schedule(Operation::Apply(config.clone()));
    }

    fn request_configuration(&mut self, reply: oneshot::Sender<DeviceConfig>) {
        let mut state = self.state.state.borrow_mut();
        if state.config_requests.add(reply) {
            state.schedule(Operation::ReadConfig);
        }
    }

    fn validate_intent(&mut self, profile: &IntentProfile) {
        self.state
            .state
            .borrow_mut()
            .schedule(Operation::ValidateIntent(profile.clone()));
    }

    fn dynamic_info(&self) -> Option<DynamicDeviceInfo> {
        self.state.state.borrow().dynamic.clone()
    }

    fn tick(&mut self, now: Instant) {
        let due: Vec<Operation> = {
            let mut state = self.state.state.borrow_mut();
            let latency = state.latency;
            for scheduled in state.queue.iter_mut() {
                scheduled.due.get_or_insert(now + latency);
            }
            let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.queue)
                .into_iter()
                .partition(|s| s.due.is_some_and(|due| due <= now));
            state.queue = waiting;
            ready.into_iter().map(|s| s.operation).collect()
        };

        for operation in due {
            self.execute(operation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::SensorId;
    use tokio::sync::mpsc;

    fn transport(handle: &SimulatorHandle) -> (SimulatedTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SimulatedTransport::new(handle.clone(), tx), rx)
    }

    #[test]
    fn test_results_arrive_on_a_later_tick() {
        let handle = SimulatorHandle::new();
        handle.add_device(SimulatedDevice::sample("a", "Frames", -40));
        let (mut transport, mut rx) = transport(&handle);

        transport.search(None, None, Duration::from_secs(1));
        assert!(rx.try_recv().is_err());

        transport.tick(Instant::now());
        match rx.try_recv().unwrap() {
            TransportEvent::DevicesUpdated(devices) => assert_eq!(devices.len(), 1),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_latency_delays_results() {
        let handle = SimulatorHandle::new();
        handle.set_latency(Duration::from_millis(200));
        handle.add_device(SimulatedDevice::sample("a", "Frames", -40));
        let (mut transport, mut rx) = transport(&handle);
        let start = Instant::now();

        transport.search(None, None, Duration::from_secs(1));
        transport.tick(start);
        assert!(rx.try_recv().is_err());
        transport.tick(start + Duration::from_millis(200));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_search_prefers_last_uid_and_filters_by_profile() {
        let handle = SimulatorHandle::new();
        handle.add_device(SimulatedDevice::sample("a", "Frames", -40));
        handle.add_device(SimulatedDevice::sample("b", "Buds", -70));
        handle.add_device(
            SimulatedDevice::sample("c", "Speaker", -30).with_sensors(SensorFlags::empty()),
        );
        let (mut transport, mut rx) = transport(&handle);

        let profile = IntentProfile::new().with_sensor(SensorId::Gyroscope);
        transport.search(Some(&profile), Some("b"), Duration::from_secs(1));
        transport.tick(Instant::now());

        let Ok(TransportEvent::DevicesUpdated(devices)) = rx.try_recv() else {
            panic!("expected discovery results");
        };
        let uids: Vec<_> = devices.iter().map(|d| d.uid.as_str()).collect();
        assert_eq!(uids, vec!["b", "a"]);
    }

    #[test]
    fn test_cancel_closes_everything() {
        let handle = SimulatorHandle::new();
        handle.add_device(SimulatedDevice::sample("a", "Frames", -40));
        let (mut transport, _rx) = transport(&handle);

        transport.search(None, None, Duration::from_secs(1));
        transport.connect(&SimulatedDevice::sample("a", "Frames", -40).device);
        assert_eq!(handle.open_search_handles(), 1);
        assert_eq!(handle.open_session_handles(), 1);

        transport.cancel();
        transport.tick(Instant::now());
        assert_eq!(handle.open_search_handles(), 0);
        assert_eq!(handle.open_session_handles(), 0);
        assert!(!transport.is_session_open());

        // Idempotent when idle.
        transport.cancel();
        assert_eq!(handle.cancel_calls(), 2);
    }

    #[test]
    fn test_partial_configuration_rejection() {
        let handle = SimulatorHandle::new();
        let sim = SimulatedDevice::sample("a", "Frames", -40).rejecting_configuration(true, false);
        let device = sim.device.clone();
        handle.add_device(sim);
        let (mut transport, mut rx) = transport(&handle);
        let now = Instant::now();

        transport.connect(&device);
        transport.tick(now);
        assert!(transport.is_session_open());

        let config = DeviceConfig::disabled()
            .with_sensor(SensorId::Accelerometer)
            .with_gesture(crate::domain::models::GestureId::DoubleTap);
        transport.set_configuration(&config);
        transport.tick(now);

        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::ConfigurationApplied {
                sensors_ok: false,
                gestures_ok: true
            }
        );
        let applied = handle.applied_config();
        assert!(!applied.any_sensor_enabled());
        assert_eq!(applied.enabled_gestures(), GestureFlags::DOUBLE_TAP);
        assert_eq!(handle.pushed_configs(), vec![config]);
    }

    #[test]
    fn test_configuration_reads_coalesce() {
        let handle = SimulatorHandle::new();
        let sim = SimulatedDevice::sample("a", "Frames", -40);
        let device = sim.device.clone();
        handle.add_device(sim);
        let (mut transport, _rx) = transport(&handle);
        let now = Instant::now();
        transport.connect(&device);
        transport.tick(now);

        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        transport.request_configuration(tx1);
        transport.request_configuration(tx2);
        transport.tick(now);

        assert_eq!(rx1.try_recv().unwrap(), DeviceConfig::disabled());
        assert_eq!(rx2.try_recv().unwrap(), DeviceConfig::disabled());
    }
}
