//! Folds every live requirement into the single configuration pushed to
//! the device.
//!
//! ```text
//!  requirements ──► aggregate ──┐
//!                               ├──► sanitize ──► diff vs applied ──► push?
//!  override ────────────────────┘
//! ```

use crate::domain::config::DeviceConfig;
use crate::domain::intent::{IntentExcess, IntentProfile};
use crate::domain::models::{Device, GestureId, SensorId, UpdateInterval};
use std::fmt;
use tracing::warn;

/// Sensor count at which the fastest interval is throttled.
pub const THROTTLE_SENSOR_COUNT: usize = 3;

/// Non-fatal adjustment made while resolving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverWarning {
    SensorUnavailable(SensorId),
    GestureUnavailable(GestureId),
    IntervalUnsupported {
        requested: UpdateInterval,
        applied: UpdateInterval,
    },
    IntervalThrottled {
        requested: UpdateInterval,
        applied: UpdateInterval,
    },
    IntentMismatch(IntentExcess),
}

impl fmt::Display for ResolverWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SensorUnavailable(id) => {
                write!(f, "sensor {id:?} is not available on the connected device")
            }
            Self::GestureUnavailable(id) => {
                write!(f, "gesture {id:?} is not available on the connected device")
            }
            Self::IntervalUnsupported { requested, applied } => write!(
                f,
                "update interval {}ms is not supported, using {}ms",
                requested.millis(),
                applied.millis()
            ),
            Self::IntervalThrottled { requested, applied } => write!(
                f,
                "{THROTTLE_SENSOR_COUNT} or more sensors at {}ms, throttled to {}ms",
                requested.millis(),
                applied.millis()
            ),
            Self::IntentMismatch(excess) => write!(
                f,
                "configuration exceeds the intent profile (sensors {:?}, gestures {:?}, interval {:?})",
                excess.sensors, excess.gestures, excess.interval
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub config: DeviceConfig,
    pub warnings: Vec<ResolverWarning>,
}

/// Logical OR of every flag; fastest interval among configs that enable
/// at least one sensor, slowest otherwise.
pub fn aggregate<'a>(configs: impl IntoIterator<Item = &'a DeviceConfig>) -> DeviceConfig {
    let mut merged = DeviceConfig::disabled();
    let mut interval: Option<UpdateInterval> = None;

    for config in configs {
        for id in SensorId::ALL {
            if config.sensor(id).enabled {
                merged.set_sensor(id, true);
            }
        }
        for id in GestureId::ALL {
            if config.gesture(id).enabled {
                merged.set_gesture(id, true);
            }
        }
        if config.any_sensor_enabled() {
            let candidate = config.update_interval();
            interval = Some(interval.map_or(candidate, |current| current.min(candidate)));
        }
    }

    merged.set_update_interval(interval.unwrap_or(UpdateInterval::SLOWEST));
    merged
}

/// Strip what the device cannot do and apply the device-side interval
/// limits. Without a device only the interval convention is enforced.
pub fn sanitize(
    config: DeviceConfig,
    device: Option<&Device>,
    warnings: &mut Vec<ResolverWarning>,
) -> DeviceConfig {
    let Some(device) = device else {
        return config.normalized();
    };
    let mut config = config;

    for id in SensorId::ALL {
        if config.sensor(id).enabled && !device.available_sensors.has(id) {
            config.set_sensor(id, false);
            warnings.push(ResolverWarning::SensorUnavailable(id));
        }
    }
    for id in GestureId::ALL {
        if config.gesture(id).enabled && !device.available_gestures.has(id) {
            config.set_gesture(id, false);
            warnings.push(ResolverWarning::GestureUnavailable(id));
        }
    }

    if !config.any_sensor_enabled() {
        return config.normalized();
    }

    let requested = config.update_interval();
    if let Some(supported) = device.available_intervals.clamp(requested) {
        if supported != requested {
            config.set_update_interval(supported);
            warnings.push(ResolverWarning::IntervalUnsupported {
                requested,
                applied: supported,
            });
        }
    }

    // An empty interval set means the device did not advertise any; treat
    // the full range as available.
    let intervals = device.available_intervals;
    let interval = config.update_interval();
    let fastest = intervals.fastest().unwrap_or(UpdateInterval::FASTEST);
    if config.enabled_sensor_count() >= THROTTLE_SENSOR_COUNT && interval == fastest {
        let slower = if intervals.is_empty() {
            interval.next_slower()
        } else {
            intervals.next_slower_than(interval)
        };
        if let Some(slower) = slower {
            config.set_update_interval(slower);
            warnings.push(ResolverWarning::IntervalThrottled {
                requested: interval,
                applied: slower,
            });
        }
    }

    config
}

/// Full resolution pass. An override replaces aggregation entirely but is
/// still sanitized.
pub fn resolve(
    requirements: &[DeviceConfig],
    override_config: Option<&DeviceConfig>,
    device: Option<&Device>,
    intent: Option<&IntentProfile>,
) -> Resolution {
    let mut warnings = Vec::new();
    let merged = match override_config {
        Some(config) => config.clone(),
        None => aggregate(requirements),
    };
    let config = sanitize(merged, device, &mut warnings);

    if let Some(profile) = intent.filter(|p| !p.is_empty()) {
        let excess = profile.excess(&config);
        if !excess.is_empty() {
            warnings.push(ResolverWarning::IntentMismatch(excess));
        }
    }

    for warning in &warnings {
        warn!("{}", warning);
    }

    Resolution { config, warnings }
}

/// Whether `resolved` differs element-wise from what the device has.
pub fn differs(resolved: &DeviceConfig, applied: &DeviceConfig) -> bool {
    !resolved.sensors_match(applied) || !resolved.gestures_match(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{DynamicDeviceInfo, GestureFlags, IntervalFlags, SensorFlags};

    fn device(sensors: SensorFlags, intervals: IntervalFlags) -> Device {
        Device {
            uid: "qc35-7f".to_string(),
            name: "Headphones".to_string(),
            firmware_version: "4.5.2".to_string(),
            rssi: -60,
            available_sensors: sensors,
            available_gestures: GestureFlags::all(),
            available_intervals: intervals,
            product_id: 0x4020,
            variant_id: 2,
            dynamic_info: DynamicDeviceInfo::default(),
        }
    }

    #[test]
    fn test_aggregate_ors_flags_and_takes_fastest_interval() {
        let a = DeviceConfig::disabled()
            .with_sensor(SensorId::Accelerometer)
            .with_interval(UpdateInterval::Ms160);
        let b = DeviceConfig::disabled()
            .with_sensor(SensorId::Gyroscope)
            .with_interval(UpdateInterval::Ms80);

        let merged = aggregate([&a, &b]);
        assert_eq!(
            merged.enabled_sensors(),
            SensorFlags::ACCELEROMETER | SensorFlags::GYROSCOPE
        );
        assert!(merged.enabled_gestures().is_empty());
        assert_eq!(merged.update_interval(), UpdateInterval::Ms80);
    }

    #[test]
    fn test_gesture_only_requirement_does_not_speed_up_interval() {
        let sensors = DeviceConfig::disabled()
            .with_sensor(SensorId::RotationVector)
            .with_interval(UpdateInterval::Ms160);
        let gestures = DeviceConfig::disabled()
            .with_gesture(GestureId::DoubleTap)
            .with_interval(UpdateInterval::Ms20);

        let merged = aggregate([&sensors, &gestures]);
        assert_eq!(merged.update_interval(), UpdateInterval::Ms160);
        assert!(merged.gesture(GestureId::DoubleTap).enabled);

        let only_gestures = aggregate([&gestures]);
        assert_eq!(only_gestures.update_interval(), UpdateInterval::SLOWEST);
    }

    #[test]
    fn test_empty_aggregate_is_disabled() {
        assert_eq!(aggregate(std::iter::empty()), DeviceConfig::disabled());
    }

    #[test]
    fn test_sanitize_strips_unavailable_sensor() {
        let config = DeviceConfig::disabled()
            .with_sensor(SensorId::Accelerometer)
            .with_sensor(SensorId::Gyroscope)
            .with_interval(UpdateInterval::Ms80);
        let device = device(SensorFlags::GYROSCOPE, IntervalFlags::all());

        let resolution = resolve(&[config], None, Some(&device), None);
        assert!(!resolution.config.sensor(SensorId::Accelerometer).enabled);
        assert!(resolution.config.sensor(SensorId::Gyroscope).enabled);
        assert_eq!(
            resolution.warnings,
            vec![ResolverWarning::SensorUnavailable(SensorId::Accelerometer)]
        );
    }

    #[test]
    fn test_three_sensors_at_fastest_are_throttled() {
        let config = DeviceConfig::disabled()
            .with_sensor(SensorId::Accelerometer)
            .with_sensor(SensorId::Gyroscope)
            .with_sensor(SensorId::RotationVector)
            .with_interval(UpdateInterval::Ms20);
        let device = device(SensorFlags::all(), IntervalFlags::all());

        let resolution = resolve(&[config.clone()], None, Some(&device), None);
        assert_eq!(resolution.config.update_interval(), UpdateInterval::Ms40);
        assert!(resolution
            .warnings
            .contains(&ResolverWarning::IntervalThrottled {
                requested: UpdateInterval::Ms20,
                applied: UpdateInterval::Ms40,
            }));

        // Two sensors at the fastest interval are fine.
        let mut two = config;
        two.set_sensor(SensorId::RotationVector, false);
        let resolution = resolve(&[two], None, Some(&device), None);
        assert_eq!(resolution.config.update_interval(), UpdateInterval::Ms20);
    }

    #[test]
    fn test_throttle_uses_device_fastest_interval() {
        let config = DeviceConfig::disabled()
            .with_sensor(SensorId::Accelerometer)
            .with_sensor(SensorId::Gyroscope)
            .with_sensor(SensorId::GameRotationVector)
            .with_interval(UpdateInterval::Ms20);
        let device = device(
            SensorFlags::all(),
            IntervalFlags::MS_40 | IntervalFlags::MS_80 | IntervalFlags::MS_320,
        );

        let resolution = resolve(&[config], None, Some(&device), None);
        assert_eq!(resolution.config.update_interval(), UpdateInterval::Ms80);
        assert_eq!(resolution.warnings.len(), 2);
    }

    #[test]
    fn test_throttle_without_advertised_intervals() {
        let config = DeviceConfig::disabled()
            .with_sensor(SensorId::Accelerometer)
            .with_sensor(SensorId::Gyroscope)
            .with_sensor(SensorId::RotationVector)
            .with_interval(UpdateInterval::Ms20);
        let device = device(SensorFlags::all(), IntervalFlags::empty());

        let resolution = resolve(&[config], None, Some(&device), None);
        assert_eq!(resolution.config.update_interval(), UpdateInterval::Ms40);
        assert_eq!(
            resolution.warnings,
            vec![ResolverWarning::IntervalThrottled {
                requested: UpdateInterval::Ms20,
                applied: UpdateInterval::Ms40,
            }]
        );
    }

    #[test]
    fn test_override_replaces_requirements_but_is_sanitized() {
        let requirement = DeviceConfig::disabled().with_sensor(SensorId::Gyroscope);
        let manual = DeviceConfig::disabled()
            .with_sensor(SensorId::Accelerometer)
            .with_gesture(GestureId::HeadShake)
            .with_interval(UpdateInterval::Ms40);
        let device = device(SensorFlags::GYROSCOPE, IntervalFlags::all());

        let resolution = resolve(&[requirement], Some(&manual), Some(&device), None);
        assert!(!resolution.config.any_sensor_enabled());
        assert!(resolution.config.gesture(GestureId::HeadShake).enabled);
        assert_eq!(resolution.config.update_interval(), UpdateInterval::SLOWEST);
    }

    #[test]
    fn test_intent_mismatch_is_a_warning_only() {
        let profile = IntentProfile::new().with_sensor(SensorId::Gyroscope);
        let config = DeviceConfig::disabled()
            .with_sensor(SensorId::Gyroscope)
            .with_gesture(GestureId::DoubleTap)
            .with_interval(UpdateInterval::Ms80);

        let resolution = resolve(&[config], None, None, Some(&profile));
        assert!(resolution.config.gesture(GestureId::DoubleTap).enabled);
        assert!(matches!(
            resolution.warnings.as_slice(),
            [ResolverWarning::IntentMismatch(excess)] if excess.gestures == GestureFlags::DOUBLE_TAP
        ));
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let configs = vec![
            DeviceConfig::disabled()
                .with_sensor(SensorId::Accelerometer)
                .with_interval(UpdateInterval::Ms160),
            DeviceConfig::disabled().with_gesture(GestureId::HeadNod),
        ];
        let device = device(SensorFlags::all(), IntervalFlags::all());

        let first = resolve(&configs, None, Some(&device), None);
        let second = resolve(&configs, None, Some(&device), None);
        assert_eq!(first, second);
        assert!(!differs(&second.config, &first.config));
        assert!(differs(&first.config, &DeviceConfig::disabled()));
    }
}
