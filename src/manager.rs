//! Device Manager
//!
//! The single entry point for applications. Owns the active transport, the
//! connection session, the permission gate, the requirement registry and
//! the intent profile, and republishes everything as [`DeviceEvent`]s.
//!
//! ## Tick pipeline
//!
//! ```text
//! tick(now)
//!   ├─ transport.tick            deliver due transport results
//!   ├─ drain transport events    session handshake, push completions
//!   ├─ permission gate poll      may start the pending search
//!   ├─ session.tick              timers, terminal resets, disconnect watch
//!   ├─ drain session events      publish, arm resolution on connect
//!   ├─ dynamic info poll         device snapshot refresh
//!   └─ resolve + push            registry/override changes, debounce gate
//! ```

use crate::domain::config::DeviceConfig;
use crate::domain::events::DeviceEvent;
use crate::domain::intent::{IntentProfile, IntentValidationStatus};
use crate::domain::models::Device;
use crate::domain::permissions::{GateStatus, PermissionGate, PermissionPlatform};
use crate::domain::requirement::{Requirement, RequirementHandle, RequirementRegistry};
use crate::domain::resolver;
use crate::domain::session::{
    ConnectionPhase, ConnectionSession, FirmwareChoice, SessionEvent, SessionTimings,
};
use crate::domain::settings::Settings;
use crate::domain::update_gate::{UpdateGate, DEFAULT_COOLDOWN};
use crate::error::{Error, Result};
use crate::infrastructure::store::DeviceStore;
use crate::infrastructure::transport::{
    TransportEvent, TransportEventReceiver, TransportFactory, TransportKind, TransportProvider,
};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerOptions {
    pub timings: SessionTimings,
    pub update_cooldown: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            timings: SessionTimings::default(),
            update_cooldown: DEFAULT_COOLDOWN,
        }
    }
}

impl ManagerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            timings: settings.session,
            update_cooldown: settings.update_cooldown(),
        }
    }
}

pub struct DeviceManager {
    options: ManagerOptions,
    factory: TransportFactory,
    transport: Box<dyn TransportProvider>,
    transport_events: TransportEventReceiver,
    session: ConnectionSession,
    permissions: PermissionGate,
    platform: Box<dyn PermissionPlatform>,
    store: Box<dyn DeviceStore>,
    requirements: RequirementRegistry,
    override_config: Option<DeviceConfig>,
    intent: Option<IntentProfile>,
    intent_status: IntentValidationStatus,
    gate: UpdateGate,
    /// What the device is believed to run.
    applied: DeviceConfig,
    /// The push awaiting an answer.
    in_flight: Option<DeviceConfig>,
    resolve_requested: bool,
    /// Search waiting on the permission gate; the inner value is the
    /// auto-reconnect uid.
    pending_search: Option<Option<String>>,
    device: Option<Device>,
    subscribers: Vec<mpsc::UnboundedSender<DeviceEvent>>,
}

impl DeviceManager {
    pub fn new(
        options: ManagerOptions,
        factory: TransportFactory,
        kind: TransportKind,
        platform: Box<dyn PermissionPlatform>,
        store: Box<dyn DeviceStore>,
    ) -> Result<Self> {
        let (transport, transport_events) = factory.create(kind)?;
        let permissions = gate_for(transport.as_ref());

        Ok(Self {
            options,
            factory,
            transport,
            transport_events,
            session: ConnectionSession::new(options.timings),
            permissions,
            platform,
            store,
            requirements: RequirementRegistry::new(),
            override_config: None,
            intent: None,
            intent_status: IntentValidationStatus::Unknown,
            gate: UpdateGate::new(options.update_cooldown),
            applied: DeviceConfig::disabled(),
            in_flight: None,
            resolve_requested: false,
            pending_search: None,
            device: None,
            subscribers: Vec::new(),
        })
    }

    /// Receive every event published from now on.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<DeviceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Transport currently in use
    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Current connection phase
    pub fn phase(&self) -> ConnectionPhase {
        self.session.phase()
    }

    /// Where precondition validation stands
    pub fn permission_status(&self) -> GateStatus {
        self.permissions.status()
    }

    /// Snapshot of the connected device, if any
    pub fn connected_device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    /// Latest discovery results, strongest signal first.
    pub fn devices(&self) -> &[Device] {
        self.session.devices()
    }

    /// Configuration the device last accepted
    pub fn applied_config(&self) -> &DeviceConfig {
        &self.applied
    }

    /// Result of the last intent profile check
    pub fn intent_status(&self) -> IntentValidationStatus {
        self.intent_status
    }

    /// Validate preconditions, then start discovery.
    pub fn search(&mut self, now: Instant) {
        self.begin_validation(None, now);
    }

    /// Like [`search`](Self::search), connecting straight to the last
    /// connected device if it shows up before the auto-reconnect timeout.
    pub fn reconnect_to_last(&mut self, now: Instant) -> Result<()> {
        let uid = self.store.last_device_uid().ok_or(Error::NoLastDevice)?;
        info!(%uid, "reconnecting to last device");
        self.begin_validation(Some(uid), now);
        Ok(())
    }

    /// Abort the pending search or connection attempt
    pub fn cancel(&mut self) {
        self.permissions.cancel();
        self.pending_search = None;
        self.session.cancel(self.transport.as_mut());
        self.process_session_events();
    }

    /// Connect to a device from the search results
    pub fn connect(&mut self, device: Device, now: Instant) {
        self.session
            .select_device(self.transport.as_mut(), device, now);
        self.process_session_events();
    }

    /// Close the session with the connected device
    pub fn disconnect(&mut self) {
        self.session.disconnect(self.transport.as_mut());
        self.process_session_events();
    }

    /// Answer a firmware update prompt
    pub fn respond_to_firmware(&mut self, choice: FirmwareChoice) {
        self.session
            .respond_to_firmware(self.transport.as_mut(), choice);
        self.process_session_events();
    }

    /// Act on the precondition the gate is halted on: prompt for a
    /// permission, or re-validate after the user enabled a service.
    pub fn request_permission(&mut self) -> bool {
        self.permissions.request(self.platform.as_mut())
    }

    /// Record that the user declined the blocking permission
    pub fn deny_permission(&mut self) {
        if let Some(permission) = self.permissions.deny() {
            self.pending_search = None;
            self.publish(DeviceEvent::PermissionDenied(permission));
        }
    }

    /// Track `requirement` until it is unregistered or dropped
    pub fn register_requirement(&mut self, requirement: &Requirement) -> RequirementHandle {
        self.requirements.register(requirement)
    }

    /// Stop tracking a requirement. False for a stale handle
    pub fn unregister_requirement(&mut self, handle: RequirementHandle) -> bool {
        self.requirements.unregister(handle)
    }

    /// Replace aggregation with a hand-edited configuration.
    pub fn set_override(&mut self, config: DeviceConfig) {
        self.override_config = Some(config);
        self.resolve_requested = true;
    }

    /// Go back to aggregating registered requirements
    pub fn clear_override(&mut self) {
        self.override_config = None;
        self.resolve_requested = true;
    }

    /// Replace the intent profile and re-resolve
    pub fn set_intent_profile(&mut self, profile: Option<IntentProfile>) {
        self.session.set_intent_profile(profile.clone());
        self.intent = profile;
        self.intent_status = IntentValidationStatus::Unknown;
        self.resolve_requested = true;
    }

    /// Check the connected device against the current profile.
    pub fn validate_intent_profile(&mut self) {
        match self.intent.as_ref().filter(|p| !p.is_empty()) {
            Some(profile) if self.session.phase() == ConnectionPhase::Connected => {
                self.transport.validate_intent(profile);
                self.intent_status = IntentValidationStatus::Validating;
            }
            Some(_) => self.intent_status = IntentValidationStatus::Unknown,
            None => self.intent_status = IntentValidationStatus::Disabled,
        }
    }

    /// Read back the configuration the device is running.
    pub fn request_configuration(&mut self) -> Result<oneshot::Receiver<DeviceConfig>> {
        if self.session.phase() != ConnectionPhase::Connected {
            return Err(Error::NotConnected);
        }
        let (tx, rx) = oneshot::channel();
        self.transport.request_configuration(tx);
        Ok(rx)
    }

    /// Tear down the current transport and switch to `kind`.
    pub fn select_transport(&mut self, kind: TransportKind) -> Result<()> {
        let (transport, events) = self.factory.create(kind)?;
        self.teardown();

        info!(?kind, "transport selected");
        self.transport = transport;
        self.transport_events = events;
        self.permissions = gate_for(self.transport.as_ref());
        self.session = ConnectionSession::new(self.options.timings);
        self.session.set_intent_profile(self.intent.clone());
        Ok(())
    }

    /// Release the transport and close every subscription.
    pub fn shutdown(&mut self) {
        info!("device manager shutting down");
        self.teardown();
        self.subscribers.clear();
    }

    /// Advance every component by one step
    pub fn tick(&mut self, now: Instant) {
        self.transport.tick(now);
        self.drain_transport_events(now);
        self.poll_permissions(now);

        self.session.tick(self.transport.as_mut(), now);
        self.process_session_events();
        self.poll_dynamic_info();

        let registry_changed = self.requirements.take_changed();
        let requested = std::mem::take(&mut self.resolve_requested);
        if registry_changed || requested {
            self.request_resolve(now);
        }
        if self.gate.poll(now) {
            self.run_resolve(now);
        }
    }

    fn begin_validation(&mut self, reconnect_uid: Option<String>, now: Instant) {
        if self.session.phase() == ConnectionPhase::Connected {
            warn!("already connected, disconnect before searching");
            return;
        }
        self.pending_search = Some(reconnect_uid);
        self.permissions.start();
        self.poll_permissions(now);
    }

    fn poll_permissions(&mut self, now: Instant) {
        let Some(status) = self.permissions.poll(self.platform.as_mut()) else {
            return;
        };
        match status {
            GateStatus::RequirementsMet => {
                self.publish(DeviceEvent::RequirementsMet);
                if let Some(reconnect_uid) = self.pending_search.take() {
                    self.session
                        .begin_search(self.transport.as_mut(), now, reconnect_uid);
                    self.process_session_events();
                }
            }
            GateStatus::Blocked(item) => {
                info!(?item, "search blocked on precondition");
                self.publish(DeviceEvent::PermissionRequired(item));
            }
            _ => {}
        }
    }

    fn drain_transport_events(&mut self, now: Instant) {
        while let Ok(event) = self.transport_events.try_recv() {
            match event {
                TransportEvent::ConfigurationApplied {
                    sensors_ok,
                    gestures_ok,
                } => self.on_configuration_applied(sensors_ok, gestures_ok, now),
                TransportEvent::IntentValidated(result)
                    if self.session.phase() == ConnectionPhase::Connected =>
                {
                    self.on_intent_validated(result.supported);
                }
                event => {
                    self.session
                        .handle_event(self.transport.as_mut(), event, now);
                }
            }
        }
    }

    fn process_session_events(&mut self) {
        for event in self.session.take_events() {
            match event {
                SessionEvent::PhaseChanged {
                    phase,
                    device,
                    message,
                } => {
                    self.on_phase_changed(phase, device.as_ref());
                    self.publish(DeviceEvent::ConnectionStatusChanged {
                        phase,
                        device,
                        message,
                    });
                }
                SessionEvent::DevicesUpdated(devices) => {
                    self.publish(DeviceEvent::DevicesUpdated(devices));
                }
                SessionEvent::FirmwareUpdate { mandatory, device } => {
                    self.publish(DeviceEvent::FirmwareUpdateAvailable { mandatory, device });
                }
                SessionEvent::AutoReconnectTimedOut => {
                    self.publish(DeviceEvent::AutoReconnectTimedOut);
                }
                SessionEvent::IntentValidated(supported) => self.on_intent_validated(supported),
            }
        }
    }

    fn on_phase_changed(&mut self, phase: ConnectionPhase, device: Option<&Device>) {
        match phase {
            ConnectionPhase::Connecting => {
                self.intent_status = IntentValidationStatus::Unknown;
            }
            ConnectionPhase::CheckIntents => {
                self.intent_status = match self.intent.as_ref() {
                    Some(profile) if !profile.is_empty() => IntentValidationStatus::Validating,
                    _ => IntentValidationStatus::Disabled,
                };
            }
            ConnectionPhase::Connected => {
                self.clear_configuration();
                self.device = device.cloned();
                if let Some(device) = device {
                    info!(uid = %device.uid, name = %device.name, "device connected");
                    if let Err(e) = self.store.set_last_device_uid(&device.uid) {
                        error!(error = %e, "failed to remember last device");
                    }
                }
                // Connecting resets the device, so resolve even without changes.
                self.resolve_requested = true;
            }
            ConnectionPhase::Disconnected | ConnectionPhase::Idle => {
                if self.device.is_some() {
                    info!("device disconnected");
                }
                self.clear_configuration();
                self.device = None;
            }
            _ => {}
        }
    }

    fn on_intent_validated(&mut self, supported: bool) {
        if supported {
            self.intent_status = IntentValidationStatus::Success;
            self.publish(DeviceEvent::IntentValidationSucceeded);
        } else {
            self.intent_status = IntentValidationStatus::Failure;
            self.publish(DeviceEvent::IntentValidationFailed);
        }
    }

    /// Reset the applied configuration to all-disabled, publishing the
    /// halves that were enabled.
    fn clear_configuration(&mut self) {
        self.gate.reset();
        self.in_flight = None;
        let previous = std::mem::take(&mut self.applied);
        self.publish_config_changes(&previous);
    }

    fn publish_config_changes(&mut self, previous: &DeviceConfig) {
        if !self.applied.sensors_match(previous) {
            self.publish(DeviceEvent::SensorsUpdated {
                sensors: self.applied.enabled_sensors(),
                interval: self.applied.update_interval(),
            });
        }
        if !self.applied.gestures_match(previous) {
            self.publish(DeviceEvent::GesturesUpdated(self.applied.enabled_gestures()));
        }
    }

    fn request_resolve(&mut self, now: Instant) {
        if self.session.phase() != ConnectionPhase::Connected {
            return;
        }
        if self.gate.request() {
            self.run_resolve(now);
        }
    }

    fn run_resolve(&mut self, now: Instant) {
        if self.session.phase() != ConnectionPhase::Connected {
            self.gate.finish_apply(false, now);
            return;
        }

        let configs = self.requirements.live_configs();
        let resolution = resolver::resolve(
            &configs,
            self.override_config.as_ref(),
            self.device.as_ref(),
            self.intent.as_ref(),
        );
        for warning in resolution.warnings {
            self.publish(DeviceEvent::ResolverWarning(warning));
        }

        let pushed = self.in_flight.is_none()
            && resolver::differs(&resolution.config, &self.applied);
        if pushed {
            debug!(
                sensors = ?resolution.config.enabled_sensors(),
                gestures = ?resolution.config.enabled_gestures(),
                interval = ?resolution.config.update_interval(),
                "pushing configuration"
            );
            self.transport.set_configuration(&resolution.config);
            self.in_flight = Some(resolution.config);
        }
        self.gate.finish_apply(pushed, now);
    }

    fn on_configuration_applied(&mut self, sensors_ok: bool, gestures_ok: bool, now: Instant) {
        let Some(pushed) = self.in_flight.take() else {
            debug!("configuration answer without a push in flight");
            return;
        };
        self.gate.push_completed(now);

        let sensors = if sensors_ok { &pushed } else { &self.applied };
        let gestures = if gestures_ok { &pushed } else { &self.applied };
        let applied = DeviceConfig::combine(sensors, gestures);
        let previous = std::mem::replace(&mut self.applied, applied);
        self.publish_config_changes(&previous);

        if sensors_ok && gestures_ok {
            self.publish(DeviceEvent::ConfigurationSucceeded(self.applied.clone()));
        } else {
            warn!(sensors_ok, gestures_ok, "device rejected part of the configuration");
            self.publish(DeviceEvent::ConfigurationFailed {
                sensors_failed: !sensors_ok,
                gestures_failed: !gestures_ok,
            });
        }
    }

    fn poll_dynamic_info(&mut self) {
        if self.session.phase() != ConnectionPhase::Connected {
            return;
        }
        let Some(current) = self.device.clone() else {
            return;
        };
        let Some(info) = self.transport.dynamic_info() else {
            return;
        };
        if info == current.dynamic_info {
            return;
        }

        let previous = &current.dynamic_info;
        let device = current.with_dynamic_info(info.clone());
        self.device = Some(device.clone());
        self.session.update_device(device.clone());
        self.publish(DeviceEvent::DeviceInfoUpdated(device));

        match (previous.is_service_suspended(), info.is_service_suspended()) {
            (false, true) => {
                let reason = info.suspension_reason.unwrap_or_default();
                warn!(?reason, "sensor service suspended");
                self.publish(DeviceEvent::SensorServiceSuspended(reason));
            }
            (true, false) => {
                info!("sensor service resumed");
                self.publish(DeviceEvent::SensorServiceResumed);
            }
            _ => {}
        }
        if previous.feature_levels() != info.feature_levels() {
            self.publish(DeviceEvent::FeatureLevelChanged(info.feature_levels()));
        }
    }

    fn teardown(&mut self) {
        self.permissions.cancel();
        self.pending_search = None;
        if !self.session.disconnect(self.transport.as_mut()) {
            self.transport.cancel();
        }
        self.process_session_events();
        while self.transport_events.try_recv().is_ok() {}
    }

    fn publish(&mut self, event: DeviceEvent) {
        debug!(?event, "publishing");
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

fn gate_for(transport: &dyn TransportProvider) -> PermissionGate {
    PermissionGate::new(
        &transport.required_permissions(),
        &transport.required_services(),
    )
}
