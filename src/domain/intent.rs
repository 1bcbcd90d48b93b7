//! Intent profiles: the capabilities an application declares it needs.

use crate::domain::config::DeviceConfig;
use crate::domain::models::{
    Device, GestureFlags, GestureId, IntervalFlags, SensorFlags, SensorId, UpdateInterval,
};
use serde::{Deserialize, Serialize};

/// Declared capability contract, used to pre-filter discovery and to
/// validate a connected device.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IntentProfile {
    pub sensors: SensorFlags,
    pub gestures: GestureFlags,
    pub intervals: IntervalFlags,
}

impl IntentProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sensor(mut self, id: SensorId) -> Self {
        self.sensors |= id.flag();
        self
    }

    pub fn with_gesture(mut self, id: GestureId) -> Self {
        self.gestures |= id.flag();
        self
    }

    pub fn with_interval(mut self, interval: UpdateInterval) -> Self {
        self.intervals |= interval.flag();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty() && self.gestures.is_empty() && self.intervals.is_empty()
    }

    /// Whether the device advertises every declared capability.
    pub fn is_satisfied_by(&self, device: &Device) -> bool {
        device.available_sensors.contains(self.sensors)
            && device.available_gestures.contains(self.gestures)
            && device.available_intervals.contains(self.intervals)
    }

    /// Capabilities enabled in `config` that this profile does not declare.
    pub fn excess(&self, config: &DeviceConfig) -> IntentExcess {
        let sensors = config.enabled_sensors() - self.sensors;
        let gestures = config.enabled_gestures() - self.gestures;
        let interval = (config.any_sensor_enabled()
            && !self.intervals.is_empty()
            && !self.intervals.has(config.update_interval()))
        .then_some(config.update_interval());

        IntentExcess {
            sensors,
            gestures,
            interval,
        }
    }
}

/// What a configuration asks for beyond a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntentExcess {
    pub sensors: SensorFlags,
    pub gestures: GestureFlags,
    pub interval: Option<UpdateInterval>,
}

impl IntentExcess {
    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty() && self.gestures.is_empty() && self.interval.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IntentValidationStatus {
    #[default]
    Unknown,
    Validating,
    Success,
    Failure,
    Disabled,
}

/// Transport answer to an intent validation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentValidationResult {
    pub supported: bool,
    /// A firmware update exists that would make the profile supported.
    pub update_would_satisfy: bool,
}
