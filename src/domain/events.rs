//! Events published by the device manager to its subscribers.

use crate::domain::config::DeviceConfig;
use crate::domain::models::{
    Device, FeatureLevels, GestureFlags, SensorFlags, SuspensionReason, UpdateInterval,
};
use crate::domain::permissions::{Permission, Precondition};
use crate::domain::resolver::ResolverWarning;
use crate::domain::session::ConnectionPhase;

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    ConnectionStatusChanged {
        phase: ConnectionPhase,
        device: Option<Device>,
        message: Option<String>,
    },
    DevicesUpdated(Vec<Device>),
    FirmwareUpdateAvailable {
        mandatory: bool,
        device: Device,
    },
    AutoReconnectTimedOut,

    PermissionRequired(Precondition),
    RequirementsMet,
    PermissionDenied(Permission),

    SensorsUpdated {
        sensors: SensorFlags,
        interval: UpdateInterval,
    },
    GesturesUpdated(GestureFlags),
    ConfigurationSucceeded(DeviceConfig),
    /// Which halves of a push the device rejected. The other half, if any,
    /// was kept.
    ConfigurationFailed {
        sensors_failed: bool,
        gestures_failed: bool,
    },
    ResolverWarning(ResolverWarning),

    SensorServiceSuspended(SuspensionReason),
    SensorServiceResumed,
    IntentValidationSucceeded,
    IntentValidationFailed,
    FeatureLevelChanged(FeatureLevels),
    DeviceInfoUpdated(Device),
}
