//! Connection session state machine.
//!
//! One session drives one transport through the handshake:
//!
//! ```text
//! Idle ─► Searching ─► Connecting ─► CheckFirmware ─┬─► SecurePairing ─┐
//!                                                   │                  ▼
//!                         AwaitFirmwareResponse ◄───┴──────────► CheckIntents
//!                                                                      │
//!                         Succeeded ◄── GeneratingIntentResponse ◄─────┘
//!                             │
//!                             ▼
//!                         Connected ─► Disconnected
//! ```
//!
//! `Failed` and `Cancelled` reset to `Idle` on the next tick, `Succeeded`
//! becomes `Connected`. Transport results are fed in through
//! [`ConnectionSession::handle_event`]; timers advance in
//! [`ConnectionSession::tick`]. Observable changes are queued as
//! [`SessionEvent`]s for the owner to drain.

use crate::domain::intent::{IntentProfile, IntentValidationResult};
use crate::domain::models::Device;
use crate::infrastructure::transport::{
    FirmwareStatus, FirmwareUpdate, TransportEvent, TransportProvider,
};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionPhase {
    Idle,
    Searching,
    Connecting,
    CheckFirmware,
    AwaitFirmwareResponse,
    SecurePairing,
    CheckIntents,
    GeneratingIntentResponse,
    Succeeded,
    Failed,
    Cancelled,
    Connected,
    Disconnected,
}

impl ConnectionPhase {
    /// Between starting a search and reaching a terminal state.
    pub fn is_attempt_in_progress(self) -> bool {
        matches!(
            self,
            ConnectionPhase::Searching
                | ConnectionPhase::Connecting
                | ConnectionPhase::CheckFirmware
                | ConnectionPhase::AwaitFirmwareResponse
                | ConnectionPhase::SecurePairing
                | ConnectionPhase::CheckIntents
                | ConnectionPhase::GeneratingIntentResponse
        )
    }
}

/// Answer to a firmware update prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareChoice {
    Update,
    Continue,
}

fn default_search_poll_interval_ms() -> u64 {
    1000
}

fn default_connect_poll_interval_ms() -> u64 {
    250
}

fn default_connect_timeout_ms() -> u64 {
    15_000
}

fn default_auto_reconnect_timeout_ms() -> u64 {
    5000
}

/// Timer settings for the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTimings {
    #[serde(default = "default_search_poll_interval_ms")]
    pub search_poll_interval_ms: u64,
    #[serde(default = "default_connect_poll_interval_ms")]
    pub connect_poll_interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_auto_reconnect_timeout_ms")]
    pub auto_reconnect_timeout_ms: u64,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            search_poll_interval_ms: default_search_poll_interval_ms(),
            connect_poll_interval_ms: default_connect_poll_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            auto_reconnect_timeout_ms: default_auto_reconnect_timeout_ms(),
        }
    }
}

impl SessionTimings {
    /// Delay between discovery polls
    pub fn search_poll_interval(&self) -> Duration {
        Duration::from_millis(self.search_poll_interval_ms)
    }

    /// Delay between connection status polls
    pub fn connect_poll_interval(&self) -> Duration {
        Duration::from_millis(self.connect_poll_interval_ms)
    }

    /// How long `Connecting` may last
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// How long to wait for the last device before showing results
    pub fn auto_reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.auto_reconnect_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PhaseChanged {
        phase: ConnectionPhase,
        device: Option<Device>,
        message: Option<String>,
    },
    /// Discovery results, strongest signal first.
    DevicesUpdated(Vec<Device>),
    FirmwareUpdate {
        mandatory: bool,
        device: Device,
    },
    AutoReconnectTimedOut,
    IntentValidated(bool),
}

/// Where to pick up after the user continues past an optional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resume {
    AfterFirmware,
    Succeed,
}

#[derive(Debug, Clone, Copy)]
struct FirmwarePrompt {
    mandatory: bool,
    resume: Resume,
}

#[derive(Debug, Clone)]
struct AutoReconnect {
    uid: String,
    deadline: Instant,
}

#[derive(Debug)]
pub struct ConnectionSession {
    timings: SessionTimings,
    phase: ConnectionPhase,
    target: Option<Device>,
    intent: Option<IntentProfile>,
    next_deadline: Option<Instant>,
    connect_deadline: Option<Instant>,
    auto_reconnect: Option<AutoReconnect>,
    devices: Vec<Device>,
    /// Whether this search has published a device list yet.
    devices_reported: bool,
    firmware: Option<FirmwareStatus>,
    prompt: Option<FirmwarePrompt>,
    optional_update_surfaced: bool,
    events: Vec<SessionEvent>,
}

impl ConnectionSession {
    pub fn new(timings: SessionTimings) -> Self {
        Self {
            timings,
            phase: ConnectionPhase::Idle,
            target: None,
            intent: None,
            next_deadline: None,
            connect_deadline: None,
            auto_reconnect: None,
            devices: Vec::new(),
            devices_reported: false,
            firmware: None,
            prompt: None,
            optional_update_surfaced: false,
            events: Vec::new(),
        }
    }

    /// Current phase
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// The device being connected to, or the connected one.
    pub fn device(&self) -> Option<&Device> {
        self.target.as_ref()
    }

    /// Devices found by the current search, strongest signal first
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Whether the search is waiting for the last device
    pub fn is_auto_reconnecting(&self) -> bool {
        self.auto_reconnect.is_some()
    }

    pub fn intent_profile(&self) -> Option<&IntentProfile> {
        self.intent.as_ref()
    }

    /// Takes effect on the next search or intent check.
    pub fn set_intent_profile(&mut self, profile: Option<IntentProfile>) {
        self.intent = profile;
    }

    /// Swap in a fresher snapshot of the connected device.
    pub fn update_device(&mut self, device: Device) {
        if self.target.as_ref().is_some_and(|t| t.same_device(&device)) {
            self.target = Some(device);
        }
    }

    /// Drain events produced since the last call
    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Start discovery. With `reconnect_uid`, a discovered device with that
    /// uid is connected to directly; other results stay hidden until the
    /// auto-reconnect timeout elapses.
    ///
    /// Returns false while connected; disconnect first.
    pub fn begin_search(
        &mut self,
        transport: &mut dyn TransportProvider,
        now: Instant,
        reconnect_uid: Option<String>,
    ) -> bool {
        if self.phase == ConnectionPhase::Connected {
            debug!("search ignored while connected");
            return false;
        }
        if self.phase.is_attempt_in_progress() {
            debug!(phase = ?self.phase, "superseding in-progress attempt");
            transport.cancel();
        }

        self.reset_attempt();
        self.devices.clear();
        self.devices_reported = false;
        self.auto_reconnect = reconnect_uid.map(|uid| AutoReconnect {
            uid,
            deadline: now + self.timings.auto_reconnect_timeout(),
        });
        self.set_phase(ConnectionPhase::Searching, None);
        self.poll_search(transport, now);
        true
    }

    /// Connect to `device`. Valid while searching or idle.
    pub fn select_device(
        &mut self,
        transport: &mut dyn TransportProvider,
        device: Device,
        now: Instant,
    ) -> bool {
        match self.phase {
            ConnectionPhase::Searching => transport.stop_search(),
            ConnectionPhase::Idle | ConnectionPhase::Disconnected => {}
            _ => {
                debug!(phase = ?self.phase, "device selection ignored");
                return false;
            }
        }

        info!(uid = %device.uid, name = %device.name, "connecting");
        self.reset_attempt();
        self.auto_reconnect = None;
        transport.connect(&device);
        self.target = Some(device);
        self.next_deadline = Some(now + self.timings.connect_poll_interval());
        self.connect_deadline = Some(now + self.timings.connect_timeout());
        self.set_phase(ConnectionPhase::Connecting, None);
        true
    }

    /// Abort the current attempt. Releases the transport exactly once; a
    /// no-op when nothing is in progress.
    pub fn cancel(&mut self, transport: &mut dyn TransportProvider) -> bool {
        if !self.phase.is_attempt_in_progress() {
            return false;
        }
        info!(phase = ?self.phase, "connection attempt cancelled");
        transport.cancel();
        self.reset_attempt();
        self.auto_reconnect = None;
        self.set_phase(ConnectionPhase::Cancelled, None);
        true
    }

    /// Close the connected session, or cancel an attempt in progress.
    pub fn disconnect(&mut self, transport: &mut dyn TransportProvider) -> bool {
        match self.phase {
            ConnectionPhase::Connected => {
                transport.disconnect();
                self.enter_disconnected();
                true
            }
            phase if phase.is_attempt_in_progress() => self.cancel(transport),
            _ => false,
        }
    }

    /// Continue or stop after a firmware update prompt
    pub fn respond_to_firmware(
        &mut self,
        transport: &mut dyn TransportProvider,
        choice: FirmwareChoice,
    ) -> bool {
        if self.phase != ConnectionPhase::AwaitFirmwareResponse {
            return false;
        }
        let Some(prompt) = self.prompt.take() else {
            return false;
        };

        match (choice, prompt.mandatory) {
            (FirmwareChoice::Update, _) => {
                info!("disconnecting for firmware update");
                transport.disconnect();
                self.reset_attempt();
                self.set_phase(
                    ConnectionPhase::Cancelled,
                    Some("disconnected for firmware update".to_string()),
                );
            }
            (FirmwareChoice::Continue, true) => {
                self.fail(transport, "mandatory firmware update declined");
            }
            (FirmwareChoice::Continue, false) => match prompt.resume {
                Resume::AfterFirmware => self.enter_pairing_or_intents(transport),
                Resume::Succeed => self.succeed(transport),
            },
        }
        true
    }

    /// Apply a transport result
    pub fn handle_event(
        &mut self,
        transport: &mut dyn TransportProvider,
        event: TransportEvent,
        now: Instant,
    ) {
        match event {
            TransportEvent::DevicesUpdated(devices) => self.on_devices(transport, devices, now),
            TransportEvent::ConnectionFailed { message } => {
                if self.phase.is_attempt_in_progress() && self.phase != ConnectionPhase::Searching
                {
                    warn!(reason = ?message, "transport reported connection failure");
                    self.fail(
                        transport,
                        message.as_deref().unwrap_or("connection failed"),
                    );
                }
            }
            TransportEvent::FirmwareChecked(status) => {
                if self.phase == ConnectionPhase::CheckFirmware {
                    self.on_firmware(transport, status);
                }
            }
            TransportEvent::PairingCompleted { accepted } => {
                if self.phase == ConnectionPhase::SecurePairing {
                    if accepted {
                        self.refresh_target(transport);
                        self.enter_check_intents(transport);
                    } else {
                        self.fail(transport, "secure pairing declined");
                    }
                }
            }
            TransportEvent::IntentValidated(result) => {
                if self.phase == ConnectionPhase::CheckIntents {
                    self.events.push(SessionEvent::IntentValidated(result.supported));
                    self.on_intent_result(transport, result);
                }
            }
            TransportEvent::ConfigurationApplied { .. } => {}
        }
    }

    /// Run the search and connection timers
    pub fn tick(&mut self, transport: &mut dyn TransportProvider, now: Instant) {
        match self.phase {
            ConnectionPhase::Succeeded => {
                info!(uid = ?self.target.as_ref().map(|d| &d.uid), "connected");
                self.set_phase(ConnectionPhase::Connected, None);
            }
            ConnectionPhase::Failed | ConnectionPhase::Cancelled => {
                self.target = None;
                self.set_phase(ConnectionPhase::Idle, None);
            }
            ConnectionPhase::Searching => {
                if self
                    .auto_reconnect
                    .as_ref()
                    .is_some_and(|auto| now >= auto.deadline)
                {
                    info!("auto-reconnect timed out, showing search results");
                    self.auto_reconnect = None;
                    self.events.push(SessionEvent::AutoReconnectTimedOut);
                    self.events
                        .push(SessionEvent::DevicesUpdated(self.devices.clone()));
                }
                if self.next_deadline.is_some_and(|deadline| now >= deadline) {
                    self.poll_search(transport, now);
                }
            }
            ConnectionPhase::Connecting => {
                if self.connect_deadline.is_some_and(|deadline| now >= deadline) {
                    self.fail(transport, "connection timed out");
                    return;
                }
                if self.next_deadline.is_some_and(|deadline| now >= deadline) {
                    self.next_deadline = Some(now + self.timings.connect_poll_interval());
                    if transport.is_session_open() {
                        self.connect_deadline = None;
                        self.next_deadline = None;
                        self.refresh_target(transport);
                        self.set_phase(ConnectionPhase::CheckFirmware, None);
                        transport.check_firmware();
                    }
                }
            }
            ConnectionPhase::Connected => {
                if !transport.is_session_open() {
                    info!("device closed the session");
                    self.enter_disconnected();
                }
            }
            _ => {}
        }
    }

    fn poll_search(&mut self, transport: &mut dyn TransportProvider, now: Instant) {
        let timeout = match &self.auto_reconnect {
            Some(auto) => auto.deadline.saturating_duration_since(now),
            None => self.timings.search_poll_interval(),
        };
        transport.search(
            self.intent.as_ref(),
            self.auto_reconnect.as_ref().map(|auto| auto.uid.as_str()),
            timeout,
        );
        self.next_deadline = Some(now + self.timings.search_poll_interval());
    }

    fn on_devices(
        &mut self,
        transport: &mut dyn TransportProvider,
        mut devices: Vec<Device>,
        now: Instant,
    ) {
        if self.phase != ConnectionPhase::Searching {
            return;
        }
        devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));

        if let Some(auto) = &self.auto_reconnect {
            if let Some(found) = devices.iter().find(|d| d.uid == auto.uid).cloned() {
                info!(uid = %found.uid, "last device found, reconnecting");
                self.devices = devices;
                self.select_device(transport, found, now);
                return;
            }
            self.devices = devices;
            return;
        }

        if !self.devices_reported || devices != self.devices {
            self.devices_reported = true;
            self.devices = devices;
            self.events
                .push(SessionEvent::DevicesUpdated(self.devices.clone()));
        }
    }

    fn on_firmware(&mut self, transport: &mut dyn TransportProvider, status: FirmwareStatus) {
        debug!(?status, "firmware checked");
        self.firmware = Some(status);
        if status.sufficient {
            self.enter_pairing_or_intents(transport);
            return;
        }
        match status.update {
            FirmwareUpdate::None => self.fail(transport, "firmware is not supported"),
            FirmwareUpdate::Optional => self.prompt_firmware(false, Resume::AfterFirmware),
            FirmwareUpdate::Mandatory => self.prompt_firmware(true, Resume::AfterFirmware),
        }
    }

    fn on_intent_result(
        &mut self,
        transport: &mut dyn TransportProvider,
        result: IntentValidationResult,
    ) {
        self.set_phase(ConnectionPhase::GeneratingIntentResponse, None);
        if result.supported {
            let optional_pending = self
                .firmware
                .is_some_and(|f| f.update == FirmwareUpdate::Optional);
            if optional_pending && !self.optional_update_surfaced {
                self.prompt_firmware(false, Resume::Succeed);
            } else {
                self.succeed(transport);
            }
        } else if result.update_would_satisfy {
            self.prompt_firmware(true, Resume::Succeed);
        } else {
            self.fail(transport, "device does not support the requested intents");
        }
    }

    fn enter_pairing_or_intents(&mut self, transport: &mut dyn TransportProvider) {
        let needs_pairing = self
            .target
            .as_ref()
            .is_some_and(|d| d.requires_secure_pairing() && !d.is_paired());
        if needs_pairing {
            self.set_phase(ConnectionPhase::SecurePairing, None);
            transport.begin_secure_pairing();
        } else {
            self.enter_check_intents(transport);
        }
    }

    fn enter_check_intents(&mut self, transport: &mut dyn TransportProvider) {
        self.set_phase(ConnectionPhase::CheckIntents, None);
        match self.intent.as_ref().filter(|p| !p.is_empty()) {
            Some(profile) => transport.validate_intent(profile),
            None => self.on_intent_result(
                transport,
                IntentValidationResult {
                    supported: true,
                    update_would_satisfy: false,
                },
            ),
        }
    }

    fn prompt_firmware(&mut self, mandatory: bool, resume: Resume) {
        if !mandatory {
            self.optional_update_surfaced = true;
        }
        self.prompt = Some(FirmwarePrompt { mandatory, resume });
        self.set_phase(ConnectionPhase::AwaitFirmwareResponse, None);
        if let Some(device) = self.target.clone() {
            self.events
                .push(SessionEvent::FirmwareUpdate { mandatory, device });
        }
    }

    fn succeed(&mut self, transport: &mut dyn TransportProvider) {
        self.refresh_target(transport);
        self.prompt = None;
        self.set_phase(ConnectionPhase::Succeeded, None);
    }

    fn fail(&mut self, transport: &mut dyn TransportProvider, message: &str) {
        warn!(phase = ?self.phase, reason = message, "connection attempt failed");
        transport.cancel();
        self.reset_attempt();
        self.auto_reconnect = None;
        self.set_phase(ConnectionPhase::Failed, Some(message.to_string()));
    }

    fn enter_disconnected(&mut self) {
        self.set_phase(ConnectionPhase::Disconnected, None);
        self.target = None;
        self.reset_attempt();
    }

    fn refresh_target(&mut self, transport: &dyn TransportProvider) {
        if let Some(device) = transport.connected_device() {
            self.target = Some(device);
        }
    }

    fn reset_attempt(&mut self) {
        self.next_deadline = None;
        self.connect_deadline = None;
        self.firmware = None;
        self.prompt = None;
        self.optional_update_surfaced = false;
    }

    fn set_phase(&mut self, phase: ConnectionPhase, message: Option<String>) {
        debug!(from = ?self.phase, to = ?phase, "phase changed");
        self.phase = phase;
        self.events.push(SessionEvent::PhaseChanged {
            phase,
            device: self.target.clone(),
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{DeviceStatus, SensorFlags, SensorId};
    use crate::infrastructure::transport::{
        SimulatedDevice, SimulatedTransport, SimulatorHandle, TransportEventReceiver,
    };
    use tokio::sync::mpsc;

    struct Harness {
        sim: SimulatorHandle,
        transport: SimulatedTransport,
        rx: TransportEventReceiver,
        session: ConnectionSession,
        now: Instant,
        events: Vec<SessionEvent>,
    }

    impl Harness {
        fn new(devices: Vec<SimulatedDevice>) -> Self {
            Self::with_timings(devices, SessionTimings::default())
        }

        fn with_timings(devices: Vec<SimulatedDevice>, timings: SessionTimings) -> Self {
            let sim = SimulatorHandle::new();
            for device in devices {
                sim.add_device(device);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                transport: SimulatedTransport::new(sim.clone(), tx),
                sim,
                rx,
                session: ConnectionSession::new(timings),
                now: Instant::now(),
                events: Vec::new(),
            }
        }

        fn step(&mut self, ms: u64) {
            self.now += Duration::from_millis(ms);
            self.transport.tick(self.now);
            while let Ok(event) = self.rx.try_recv() {
                self.session.handle_event(&mut self.transport, event, self.now);
            }
            self.session.tick(&mut self.transport, self.now);
            self.events.extend(self.session.take_events());
        }

        fn run_until(&mut self, phase: ConnectionPhase) -> bool {
            for _ in 0..400 {
                if self.session.phase() == phase {
                    return true;
                }
                self.step(50);
            }
            false
        }

        fn search(&mut self) {
            assert!(self.session.begin_search(&mut self.transport, self.now, None));
            self.step(0);
        }

        fn connect_first(&mut self) {
            self.search();
            let device = self.session.devices()[0].clone();
            assert!(self
                .session
                .select_device(&mut self.transport, device, self.now));
        }

        fn phases(&self) -> Vec<ConnectionPhase> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    SessionEvent::PhaseChanged { phase, .. } => Some(*phase),
                    _ => None,
                })
                .collect()
        }

        fn last_message(&self) -> Option<String> {
            self.events.iter().rev().find_map(|e| match e {
                SessionEvent::PhaseChanged { message, .. } => message.clone(),
                _ => None,
            })
        }

        fn firmware_prompts(&self) -> Vec<bool> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    SessionEvent::FirmwareUpdate { mandatory, .. } => Some(*mandatory),
                    _ => None,
                })
                .collect()
        }
    }

    fn frames() -> SimulatedDevice {
        SimulatedDevice::sample("frames-01", "Frames", -45)
    }

    fn optional_update(sufficient: bool) -> FirmwareStatus {
        FirmwareStatus {
            sufficient,
            update: FirmwareUpdate::Optional,
        }
    }

    #[test]
    fn test_happy_path_reaches_connected() {
        let mut h = Harness::new(vec![frames()]);
        h.connect_first();
        assert!(h.run_until(ConnectionPhase::Connected));

        assert_eq!(
            h.phases(),
            vec![
                ConnectionPhase::Searching,
                ConnectionPhase::Connecting,
                ConnectionPhase::CheckFirmware,
                ConnectionPhase::CheckIntents,
                ConnectionPhase::GeneratingIntentResponse,
                ConnectionPhase::Succeeded,
                ConnectionPhase::Connected,
            ]
        );
        assert_eq!(h.session.device().map(|d| d.uid.as_str()), Some("frames-01"));
        assert_eq!(h.sim.open_search_handles(), 0);
    }

    #[test]
    fn test_devices_sorted_by_signal() {
        let mut h = Harness::new(vec![
            SimulatedDevice::sample("weak", "Weak", -80),
            SimulatedDevice::sample("strong", "Strong", -30),
            SimulatedDevice::sample("mid", "Mid", -55),
        ]);
        h.search();
        let uids: Vec<_> = h.session.devices().iter().map(|d| d.uid.as_str()).collect();
        assert_eq!(uids, vec!["strong", "mid", "weak"]);
        assert!(matches!(h.events.last(), Some(SessionEvent::DevicesUpdated(d)) if d.len() == 3));
    }

    #[test]
    fn test_empty_search_reports_once() {
        let mut h = Harness::new(vec![]);
        h.search();
        assert_eq!(h.events.last(), Some(&SessionEvent::DevicesUpdated(vec![])));

        h.step(1000);
        assert_eq!(h.sim.search_calls(), 2);
        let reports = h
            .events
            .iter()
            .filter(|e| matches!(e, SessionEvent::DevicesUpdated(_)))
            .count();
        assert_eq!(reports, 1);
    }

    #[test]
    fn test_search_repolls_on_interval() {
        let mut h = Harness::new(vec![frames()]);
        h.search();
        assert_eq!(h.sim.search_calls(), 1);
        h.step(999);
        assert_eq!(h.sim.search_calls(), 1);
        h.step(1);
        assert_eq!(h.sim.search_calls(), 2);
    }

    #[test]
    fn test_cancel_from_every_attempt_phase() {
        let cases = [
            (ConnectionPhase::Searching, frames(), None),
            (ConnectionPhase::Connecting, frames(), None),
            (ConnectionPhase::CheckFirmware, frames(), None),
            (
                ConnectionPhase::AwaitFirmwareResponse,
                frames().with_firmware(optional_update(false)),
                None,
            ),
            (
                ConnectionPhase::SecurePairing,
                frames().with_status(DeviceStatus::SECURE_PAIRING_REQUIRED),
                None,
            ),
            (
                ConnectionPhase::CheckIntents,
                frames(),
                Some(IntentProfile::new().with_sensor(SensorId::Gyroscope)),
            ),
        ];

        for (target, device, profile) in cases {
            let mut h = Harness::new(vec![device]);
            h.session.set_intent_profile(profile);
            if target == ConnectionPhase::Searching {
                h.search();
            } else {
                h.connect_first();
            }
            assert!(h.run_until(target), "never reached {target:?}");

            assert!(h.session.cancel(&mut h.transport));
            assert_eq!(h.session.phase(), ConnectionPhase::Cancelled);
            assert_eq!(h.sim.open_search_handles(), 0, "{target:?}");
            assert_eq!(h.sim.open_session_handles(), 0, "{target:?}");

            h.step(50);
            assert_eq!(h.session.phase(), ConnectionPhase::Idle);
            assert_eq!(h.sim.cancel_calls(), 1, "{target:?}");
        }
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut h = Harness::new(vec![frames()]);
        assert!(!h.session.cancel(&mut h.transport));
        assert_eq!(h.sim.cancel_calls(), 0);

        h.search();
        assert!(h.session.cancel(&mut h.transport));
        assert!(!h.session.cancel(&mut h.transport));
        h.step(50);
        assert!(!h.session.cancel(&mut h.transport));
        assert_eq!(h.sim.cancel_calls(), 1);
    }

    #[test]
    fn test_auto_reconnect_matches_last_device() {
        let mut h = Harness::new(vec![
            SimulatedDevice::sample("other", "Other", -30),
            frames(),
        ]);
        h.session
            .begin_search(&mut h.transport, h.now, Some("frames-01".to_string()));
        h.step(0);

        assert_eq!(h.session.phase(), ConnectionPhase::Connecting);
        assert_eq!(h.session.device().map(|d| d.uid.as_str()), Some("frames-01"));
        assert!(!h
            .events
            .iter()
            .any(|e| matches!(e, SessionEvent::DevicesUpdated(_))));
    }

    #[test]
    fn test_auto_reconnect_falls_back_to_search() {
        let mut h = Harness::new(vec![SimulatedDevice::sample("other", "Other", -30)]);
        h.session
            .begin_search(&mut h.transport, h.now, Some("frames-01".to_string()));
        h.step(0);
        assert!(h.session.is_auto_reconnecting());

        h.step(4999);
        assert!(!h.events.contains(&SessionEvent::AutoReconnectTimedOut));

        h.step(1);
        assert!(h.events.contains(&SessionEvent::AutoReconnectTimedOut));
        assert_eq!(h.session.phase(), ConnectionPhase::Searching);
        assert!(!h.session.is_auto_reconnecting());
        assert!(h
            .events
            .iter()
            .any(|e| matches!(e, SessionEvent::DevicesUpdated(d) if d[0].uid == "other")));
    }

    #[test]
    fn test_insufficient_firmware_without_update_fails() {
        let mut h = Harness::new(vec![frames().with_firmware(FirmwareStatus {
            sufficient: false,
            update: FirmwareUpdate::None,
        })]);
        h.connect_first();
        assert!(h.run_until(ConnectionPhase::Idle));
        assert!(h.phases().contains(&ConnectionPhase::Failed));
        assert_eq!(h.last_message().as_deref(), Some("firmware is not supported"));
        assert_eq!(h.sim.open_session_handles(), 0);
    }

    #[test]
    fn test_optional_update_continue_succeeds() {
        let mut h = Harness::new(vec![frames().with_firmware(optional_update(false))]);
        h.connect_first();
        assert!(h.run_until(ConnectionPhase::AwaitFirmwareResponse));
        assert_eq!(h.firmware_prompts(), vec![false]);

        assert!(h
            .session
            .respond_to_firmware(&mut h.transport, FirmwareChoice::Continue));
        assert!(h.run_until(ConnectionPhase::Connected));
        assert!(h.phases().contains(&ConnectionPhase::Succeeded));
        assert_eq!(h.firmware_prompts(), vec![false], "prompt surfaced once");
    }

    #[test]
    fn test_optional_update_with_sufficient_firmware_surfaces_after_intents() {
        let mut h = Harness::new(vec![frames().with_firmware(optional_update(true))]);
        h.connect_first();
        assert!(h.run_until(ConnectionPhase::AwaitFirmwareResponse));
        assert!(h.phases().contains(&ConnectionPhase::GeneratingIntentResponse));

        h.session
            .respond_to_firmware(&mut h.transport, FirmwareChoice::Continue);
        assert_eq!(h.session.phase(), ConnectionPhase::Succeeded);
        h.step(50);
        assert_eq!(h.session.phase(), ConnectionPhase::Connected);
    }

    #[test]
    fn test_mandatory_update_declined_fails() {
        let mut h = Harness::new(vec![frames().with_firmware(FirmwareStatus {
            sufficient: false,
            update: FirmwareUpdate::Mandatory,
        })]);
        h.connect_first();
        assert!(h.run_until(ConnectionPhase::AwaitFirmwareResponse));
        assert_eq!(h.firmware_prompts(), vec![true]);

        h.session
            .respond_to_firmware(&mut h.transport, FirmwareChoice::Continue);
        assert_eq!(h.session.phase(), ConnectionPhase::Failed);
        assert_eq!(h.sim.open_session_handles(), 0);
    }

    #[test]
    fn test_update_accepted_ends_session() {
        let mut h = Harness::new(vec![frames().with_firmware(FirmwareStatus {
            sufficient: false,
            update: FirmwareUpdate::Mandatory,
        })]);
        h.connect_first();
        assert!(h.run_until(ConnectionPhase::AwaitFirmwareResponse));

        h.session
            .respond_to_firmware(&mut h.transport, FirmwareChoice::Update);
        assert_eq!(h.session.phase(), ConnectionPhase::Cancelled);
        assert_eq!(h.sim.open_session_handles(), 0);
        assert_eq!(
            h.last_message().as_deref(),
            Some("disconnected for firmware update")
        );
    }

    #[test]
    fn test_secure_pairing() {
        let paired = frames().with_status(DeviceStatus::SECURE_PAIRING_REQUIRED);
        let mut h = Harness::new(vec![paired]);
        h.connect_first();
        assert!(h.run_until(ConnectionPhase::Connected));
        assert!(h.phases().contains(&ConnectionPhase::SecurePairing));
        assert!(h.session.device().is_some_and(|d| d.is_paired()));

        let rejecting = frames()
            .with_status(DeviceStatus::SECURE_PAIRING_REQUIRED)
            .rejecting_pairing();
        let mut h = Harness::new(vec![rejecting]);
        h.connect_first();
        assert!(h.run_until(ConnectionPhase::Idle));
        assert_eq!(h.last_message().as_deref(), Some("secure pairing declined"));
    }

    #[test]
    fn test_already_paired_skips_pairing() {
        let device = frames()
            .with_status(DeviceStatus::SECURE_PAIRING_REQUIRED | DeviceStatus::ALREADY_PAIRED);
        let mut h = Harness::new(vec![device]);
        h.connect_first();
        assert!(h.run_until(ConnectionPhase::Connected));
        assert!(!h.phases().contains(&ConnectionPhase::SecurePairing));
    }

    #[test]
    fn test_intent_validation() {
        let profile = IntentProfile::new().with_sensor(SensorId::Gyroscope);

        let mut h = Harness::new(vec![frames()]);
        h.session.set_intent_profile(Some(profile.clone()));
        h.connect_first();
        assert!(h.run_until(ConnectionPhase::Connected));
        assert!(h.events.contains(&SessionEvent::IntentValidated(true)));

        // Discovery filters by profile, so connect to the device directly.
        let lacking = frames().with_sensors(SensorFlags::ACCELEROMETER);
        let mut h = Harness::new(vec![lacking.clone()]);
        h.session.set_intent_profile(Some(profile.clone()));
        h.session
            .select_device(&mut h.transport, lacking.device.clone(), h.now);
        assert!(h.run_until(ConnectionPhase::Idle));
        assert!(h.events.contains(&SessionEvent::IntentValidated(false)));
        assert!(h.phases().contains(&ConnectionPhase::Failed));

        let remedied = lacking.with_intent_update();
        let mut h = Harness::new(vec![remedied.clone()]);
        h.session.set_intent_profile(Some(profile));
        h.session
            .select_device(&mut h.transport, remedied.device.clone(), h.now);
        assert!(h.run_until(ConnectionPhase::AwaitFirmwareResponse));
        assert_eq!(h.firmware_prompts(), vec![true]);
    }

    #[test]
    fn test_connect_timeout() {
        let timings = SessionTimings {
            connect_timeout_ms: 2000,
            ..SessionTimings::default()
        };
        let mut h = Harness::with_timings(vec![frames()], timings);
        h.sim.set_latency(Duration::from_secs(60));
        h.session
            .select_device(&mut h.transport, frames().device, h.now);

        h.step(1950);
        assert_eq!(h.session.phase(), ConnectionPhase::Connecting);
        h.step(50);
        assert!(h.phases().contains(&ConnectionPhase::Failed));
        assert_eq!(h.last_message().as_deref(), Some("connection timed out"));
        assert_eq!(h.sim.open_session_handles(), 0);
    }

    #[test]
    fn test_transport_failure_message() {
        let mut h = Harness::new(vec![frames()]);
        h.sim.fail_next_connect(Some("radio off"));
        h.connect_first();
        assert!(h.run_until(ConnectionPhase::Idle));
        assert_eq!(h.last_message().as_deref(), Some("radio off"));
    }

    #[test]
    fn test_device_initiated_disconnect() {
        let mut h = Harness::new(vec![frames()]);
        h.connect_first();
        assert!(h.run_until(ConnectionPhase::Connected));

        h.sim.drop_connection();
        h.step(50);
        assert_eq!(h.session.phase(), ConnectionPhase::Disconnected);
        assert!(h.session.device().is_none());
        assert!(matches!(
            h.events.last(),
            Some(SessionEvent::PhaseChanged { phase: ConnectionPhase::Disconnected, device: Some(d), .. })
                if d.uid == "frames-01"
        ));
    }

    #[test]
    fn test_search_ignored_while_connected() {
        let mut h = Harness::new(vec![frames()]);
        h.connect_first();
        assert!(h.run_until(ConnectionPhase::Connected));
        assert!(!h.session.begin_search(&mut h.transport, h.now, None));

        assert!(h.session.disconnect(&mut h.transport));
        assert_eq!(h.session.phase(), ConnectionPhase::Disconnected);
        assert!(h.session.begin_search(&mut h.transport, h.now, None));
    }
}
