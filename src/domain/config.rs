//! Desired and applied device configuration.

use crate::domain::models::{GestureFlags, GestureId, SensorFlags, SensorId, UpdateInterval};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SensorConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GestureConfig {
    pub enabled: bool,
}

/// Per-capability enable flags plus the shared sensor update interval.
///
/// A configuration with no sensor enabled carries the slowest interval;
/// [`DeviceConfig::normalized`] restores that convention after edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    sensors: [SensorConfig; SensorId::COUNT],
    gestures: [GestureConfig; GestureId::COUNT],
    update_interval: UpdateInterval,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

impl DeviceConfig {
    /// Everything off, slowest interval.
    pub fn disabled() -> Self {
        Self {
            sensors: [SensorConfig::default(); SensorId::COUNT],
            gestures: [GestureConfig::default(); GestureId::COUNT],
            update_interval: UpdateInterval::SLOWEST,
        }
    }

    pub fn sensor(&self, id: SensorId) -> SensorConfig {
        self.sensors[id.index()]
    }

    pub fn set_sensor(&mut self, id: SensorId, enabled: bool) {
        self.sensors[id.index()].enabled = enabled;
    }

    pub fn gesture(&self, id: GestureId) -> GestureConfig {
        self.gestures[id.index()]
    }

    pub fn set_gesture(&mut self, id: GestureId, enabled: bool) {
        self.gestures[id.index()].enabled = enabled;
    }

    pub fn update_interval(&self) -> UpdateInterval {
        self.update_interval
    }

    pub fn set_update_interval(&mut self, interval: UpdateInterval) {
        self.update_interval = interval;
    }

    pub fn with_sensor(mut self, id: SensorId) -> Self {
        self.set_sensor(id, true);
        self
    }

    pub fn with_gesture(mut self, id: GestureId) -> Self {
        self.set_gesture(id, true);
        self
    }

    pub fn with_interval(mut self, interval: UpdateInterval) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn enabled_sensors(&self) -> SensorFlags {
        SensorId::ALL
            .into_iter()
            .filter(|id| self.sensor(*id).enabled)
            .fold(SensorFlags::empty(), |acc, id| acc | id.flag())
    }

    pub fn enabled_gestures(&self) -> GestureFlags {
        GestureId::ALL
            .into_iter()
            .filter(|id| self.gesture(*id).enabled)
            .fold(GestureFlags::empty(), |acc, id| acc | id.flag())
    }

    pub fn any_sensor_enabled(&self) -> bool {
        self.sensors.iter().any(|s| s.enabled)
    }

    pub fn enabled_sensor_count(&self) -> usize {
        self.sensors.iter().filter(|s| s.enabled).count()
    }

    /// Same sensor flags and, when any sensor is on, the same interval.
    pub fn sensors_match(&self, other: &DeviceConfig) -> bool {
        self.sensors == other.sensors
            && (!self.any_sensor_enabled() || self.update_interval == other.update_interval)
    }

    pub fn gestures_match(&self, other: &DeviceConfig) -> bool {
        self.gestures == other.gestures
    }

    /// Sensor half (flags + interval) from `sensors`, gesture half from
    /// `gestures`.
    pub fn combine(sensors: &DeviceConfig, gestures: &DeviceConfig) -> DeviceConfig {
        DeviceConfig {
            sensors: sensors.sensors,
            gestures: gestures.gestures,
            update_interval: sensors.update_interval,
        }
        .normalized()
    }

    pub fn normalized(mut self) -> Self {
        if !self.any_sensor_enabled() {
            self.update_interval = UpdateInterval::SLOWEST;
        }
        self
    }
}
