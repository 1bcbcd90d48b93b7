//! Transport Module
//!
//! The seam between the connection logic and a concrete link to the
//! device (radio, wired, or simulated).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     DeviceManager                        │
//! │     (owns exactly one provider, selected by kind)        │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │  TransportProvider (non-blocking calls)
//!         ┌─────────────┼─────────────┐
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌───────────┐
//! │  Radio    │  │   Wired    │  │ Simulated │
//! │ (bridge)  │  │  (bridge)  │  │           │
//! └───────────┘  └────────────┘  └───────────┘
//!         │             │             │
//!         └─────────────┴─────────────┘
//!                       │  TransportEvent (mpsc, observed on a later tick)
//!                       ▼
//! ```
//!
//! Radio and wired providers are native bridges registered at runtime
//! through [`TransportFactory::register`]; only the simulated provider ships
//! with the crate.
//!
//! ## Modules
//!
//! - [`simulated`] - scripted in-process device

pub mod simulated;

use crate::domain::config::DeviceConfig;
use crate::domain::intent::{IntentProfile, IntentValidationResult};
use crate::domain::models::{Device, DynamicDeviceInfo};
use crate::domain::permissions::{OsService, Permission};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

pub use simulated::{SimulatedDevice, SimulatedTransport, SimulatorHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Radio,
    Wired,
    #[default]
    Simulated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FirmwareUpdate {
    #[default]
    None,
    Optional,
    Mandatory,
}

/// Result of comparing the device firmware against what this client needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareStatus {
    pub sufficient: bool,
    pub update: FirmwareUpdate,
}

impl Default for FirmwareStatus {
    fn default() -> Self {
        Self {
            sufficient: true,
            update: FirmwareUpdate::None,
        }
    }
}

/// Everything a provider reports back. Always delivered on a later tick
/// than the call that caused it.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    DevicesUpdated(Vec<Device>),
    ConnectionFailed { message: Option<String> },
    FirmwareChecked(FirmwareStatus),
    PairingCompleted { accepted: bool },
    IntentValidated(IntentValidationResult),
    /// Sensor and gesture halves of a push succeed or fail independently.
    ConfigurationApplied { sensors_ok: bool, gestures_ok: bool },
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// A link to the device.
///
/// No call blocks and no call reports failure directly: results arrive as
/// [`TransportEvent`]s on the sender the provider was built with.
pub trait TransportProvider {
    fn kind(&self) -> TransportKind;

    fn required_permissions(&self) -> Vec<Permission> {
        Vec::new()
    }

    fn required_services(&self) -> Vec<OsService> {
        Vec::new()
    }

    /// Begin or continue discovery. `last_uid` is set when the caller is
    /// trying to reconnect, so the provider can look for it first.
    fn search(&mut self, profile: Option<&IntentProfile>, last_uid: Option<&str>, timeout: Duration);

    fn stop_search(&mut self);

    /// Abort any in-progress attempt, closing search and session handles.
    /// Safe to call at any time, including when idle.
    fn cancel(&mut self);

    fn connect(&mut self, device: &Device);

    fn disconnect(&mut self);

    fn is_session_open(&self) -> bool;

    /// Fresh snapshot of the device behind the open session.
    fn connected_device(&self) -> Option<Device>;

    fn check_firmware(&mut self);

    fn begin_secure_pairing(&mut self);

    /// At most one call may be outstanding.
    fn set_configuration(&mut self, config: &DeviceConfig);

    /// Concurrent callers share one in-flight read.
    fn request_configuration(&mut self, reply: oneshot::Sender<DeviceConfig>);

    fn validate_intent(&mut self, profile: &IntentProfile);

    /// Cheap enough to call every tick.
    fn dynamic_info(&self) -> Option<DynamicDeviceInfo>;

    /// Drive timers and deliver due results.
    fn tick(&mut self, now: Instant);
}

/// Coalesces configuration read-backs onto one in-flight request.
#[derive(Debug, Default)]
pub struct ConfigurationRequests {
    waiters: Vec<oneshot::Sender<DeviceConfig>>,
}

impl ConfigurationRequests {
    /// Queue a caller. Returns true when no request is in flight yet and
    /// the provider must start one.
    pub fn add(&mut self, reply: oneshot::Sender<DeviceConfig>) -> bool {
        self.waiters.retain(|w| !w.is_closed());
        self.waiters.push(reply);
        self.waiters.len() == 1
    }

    pub fn in_flight(&self) -> bool {
        !self.waiters.is_empty()
    }

    /// Answer every waiting caller.
    pub fn complete(&mut self, config: &DeviceConfig) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(config.clone());
        }
    }

    /// Drop every waiting caller; their receivers see the channel close.
    pub fn abandon(&mut self) {
        self.waiters.clear();
    }
}

pub type TransportConstructor = Box<dyn Fn(TransportEventSender) -> Box<dyn TransportProvider>>;

/// Builds a provider for a [`TransportKind`].
#[derive(Default)]
pub struct TransportFactory {
    constructors: HashMap<TransportKind, TransportConstructor>,
}

impl TransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with the simulated provider registered against `simulator`.
    pub fn with_simulator(simulator: SimulatorHandle) -> Self {
        let mut factory = Self::new();
        factory.register(
            TransportKind::Simulated,
            Box::new(move |events| {
                Box::new(SimulatedTransport::new(simulator.clone(), events))
                    as Box<dyn TransportProvider>
            }),
        );
        factory
    }

    pub fn register(&mut self, kind: TransportKind, constructor: TransportConstructor) {
        debug!(?kind, "transport provider registered");
        self.constructors.insert(kind, constructor);
    }

    pub fn is_available(&self, kind: TransportKind) -> bool {
        self.constructors.contains_key(&kind)
    }

    /// Build a provider together with the receiving end of its events.
    pub fn create(
        &self,
        kind: TransportKind,
    ) -> Result<(Box<dyn TransportProvider>, TransportEventReceiver)> {
        let constructor = self
            .constructors
            .get(&kind)
            .ok_or(Error::TransportUnavailable(kind))?;
        let (tx, rx) = mpsc::unbounded_channel();
        info!(?kind, "creating transport provider");
        Ok((constructor(tx), rx))
    }
}
