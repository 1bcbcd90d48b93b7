//! Device identity and capability value types.
//!
//! A [`Device`] is an immutable snapshot. When fresher dynamic information
//! arrives the whole snapshot is replaced, never patched in place.

use crate::error::Error;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Motion sensors a device may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SensorId {
    Accelerometer = 0,
    Gyroscope = 1,
    RotationVector = 2,
    GameRotationVector = 3,
}

impl SensorId {
    pub const COUNT: usize = 4;
    pub const ALL: [SensorId; Self::COUNT] = [
        Self::Accelerometer,
        Self::Gyroscope,
        Self::RotationVector,
        Self::GameRotationVector,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn flag(self) -> SensorFlags {
        match self {
            Self::Accelerometer => SensorFlags::ACCELEROMETER,
            Self::Gyroscope => SensorFlags::GYROSCOPE,
            Self::RotationVector => SensorFlags::ROTATION_VECTOR,
            Self::GameRotationVector => SensorFlags::GAME_ROTATION_VECTOR,
        }
    }
}

impl TryFrom<u8> for SensorId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(Error::InvalidId {
                kind: "sensor",
                value,
            })
    }
}

/// Gestures a device may recognise on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GestureId {
    DoubleTap = 0,
    HeadNod = 1,
    HeadShake = 2,
    TouchAndHold = 3,
    Input = 4,
    AffirmativeInput = 5,
    NegativeInput = 6,
}

impl GestureId {
    pub const COUNT: usize = 7;
    pub const ALL: [GestureId; Self::COUNT] = [
        Self::DoubleTap,
        Self::HeadNod,
        Self::HeadShake,
        Self::TouchAndHold,
        Self::Input,
        Self::AffirmativeInput,
        Self::NegativeInput,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn flag(self) -> GestureFlags {
        match self {
            Self::DoubleTap => GestureFlags::DOUBLE_TAP,
            Self::HeadNod => GestureFlags::HEAD_NOD,
            Self::HeadShake => GestureFlags::HEAD_SHAKE,
            Self::TouchAndHold => GestureFlags::TOUCH_AND_HOLD,
            Self::Input => GestureFlags::INPUT,
            Self::AffirmativeInput => GestureFlags::AFFIRMATIVE_INPUT,
            Self::NegativeInput => GestureFlags::NEGATIVE_INPUT,
        }
    }
}

impl TryFrom<u8> for GestureId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(Error::InvalidId {
                kind: "gesture",
                value,
            })
    }
}

/// Sensor sampling period.
///
/// Variants are declared fastest first, so the derived `Ord` makes
/// `min()` pick the fastest interval.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum UpdateInterval {
    Ms20,
    Ms40,
    Ms80,
    Ms160,
    #[default]
    Ms320,
}

impl UpdateInterval {
    pub const FASTEST: UpdateInterval = UpdateInterval::Ms20;
    pub const SLOWEST: UpdateInterval = UpdateInterval::Ms320;
    pub const ALL: [UpdateInterval; 5] = [
        Self::Ms20,
        Self::Ms40,
        Self::Ms80,
        Self::Ms160,
        Self::Ms320,
    ];

    pub fn millis(self) -> u32 {
        match self {
            Self::Ms20 => 20,
            Self::Ms40 => 40,
            Self::Ms80 => 80,
            Self::Ms160 => 160,
            Self::Ms320 => 320,
        }
    }

    /// The next slower interval, or `None` at the slowest.
    pub fn next_slower(self) -> Option<UpdateInterval> {
        Self::ALL.get(self as usize + 1).copied()
    }

    pub fn flag(self) -> IntervalFlags {
        match self {
            Self::Ms20 => IntervalFlags::MS_20,
            Self::Ms40 => IntervalFlags::MS_40,
            Self::Ms80 => IntervalFlags::MS_80,
            Self::Ms160 => IntervalFlags::MS_160,
            Self::Ms320 => IntervalFlags::MS_320,
        }
    }
}

impl TryFrom<u8> for UpdateInterval {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(Error::InvalidId {
                kind: "update interval",
                value,
            })
    }
}

bitflags! {
    /// Set of sensors, as advertised by a device or declared by a profile.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct SensorFlags: u8 {
        const ACCELEROMETER        = 1 << 0;
        const GYROSCOPE            = 1 << 1;
        const ROTATION_VECTOR      = 1 << 2;
        const GAME_ROTATION_VECTOR = 1 << 3;
    }
}

impl SensorFlags {
    pub fn has(self, id: SensorId) -> bool {
        self.contains(id.flag())
    }

    pub fn ids(self) -> impl Iterator<Item = SensorId> {
        SensorId::ALL.into_iter().filter(move |id| self.has(*id))
    }
}

bitflags! {
    /// Set of gestures.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct GestureFlags: u8 {
        const DOUBLE_TAP        = 1 << 0;
        const HEAD_NOD          = 1 << 1;
        const HEAD_SHAKE        = 1 << 2;
        const TOUCH_AND_HOLD    = 1 << 3;
        const INPUT             = 1 << 4;
        const AFFIRMATIVE_INPUT = 1 << 5;
        const NEGATIVE_INPUT    = 1 << 6;
    }
}

impl GestureFlags {
    pub fn has(self, id: GestureId) -> bool {
        self.contains(id.flag())
    }

    pub fn ids(self) -> impl Iterator<Item = GestureId> {
        GestureId::ALL.into_iter().filter(move |id| self.has(*id))
    }
}

bitflags! {
    /// Set of sampling intervals.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct IntervalFlags: u8 {
        const MS_20  = 1 << 0;
        const MS_40  = 1 << 1;
        const MS_80  = 1 << 2;
        const MS_160 = 1 << 3;
        const MS_320 = 1 << 4;
    }
}

impl IntervalFlags {
    pub fn has(self, interval: UpdateInterval) -> bool {
        self.contains(interval.flag())
    }

    pub fn fastest(self) -> Option<UpdateInterval> {
        UpdateInterval::ALL.into_iter().find(|i| self.has(*i))
    }

    /// Fastest member strictly slower than `interval`.
    pub fn next_slower_than(self, interval: UpdateInterval) -> Option<UpdateInterval> {
        UpdateInterval::ALL
            .into_iter()
            .find(|i| *i > interval && self.has(*i))
    }

    /// `interval` if it is a member, otherwise the nearest slower member,
    /// otherwise the slowest member. `None` for an empty set.
    pub fn clamp(self, interval: UpdateInterval) -> Option<UpdateInterval> {
        if self.has(interval) {
            return Some(interval);
        }
        self.next_slower_than(interval)
            .or_else(|| UpdateInterval::ALL.into_iter().rev().find(|i| self.has(*i)))
    }
}

bitflags! {
    /// Status bits reported by the device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct DeviceStatus: u16 {
        const SECURE_PAIRING_REQUIRED = 1 << 0;
        const ALREADY_PAIRED          = 1 << 1;
        const SERVICE_SUSPENDED       = 1 << 2;
        const CALIBRATED              = 1 << 3;
    }
}

/// Why the device stopped streaming sensor data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SuspensionReason {
    #[default]
    Unknown,
    MultipointConnectionActive,
    VoiceAssistantInUse,
    MusicSharingActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NoiseReductionMode {
    #[default]
    Off,
    Low,
    High,
    Wind,
}

/// Feature levels the user can change on the device while connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeatureLevels {
    pub noise_reduction_mode: NoiseReductionMode,
    pub cnc_level: u8,
    pub cnc_enabled: bool,
}

/// Device fields that may change during a live session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DynamicDeviceInfo {
    pub device_status: DeviceStatus,
    pub suspension_reason: Option<SuspensionReason>,
    pub transmission_period: u8,
    pub noise_reduction_mode: NoiseReductionMode,
    pub available_noise_reduction_modes: Vec<NoiseReductionMode>,
    pub cnc_level: u8,
    pub cnc_enabled: bool,
}

impl DynamicDeviceInfo {
    pub fn feature_levels(&self) -> FeatureLevels {
        FeatureLevels {
            noise_reduction_mode: self.noise_reduction_mode,
            cnc_level: self.cnc_level,
            cnc_enabled: self.cnc_enabled,
        }
    }

    pub fn is_service_suspended(&self) -> bool {
        self.device_status.contains(DeviceStatus::SERVICE_SUSPENDED)
    }
}

/// Snapshot of a discovered or connected device.
///
/// Identity is the `uid`; `PartialEq` compares by value and is used for
/// change detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub uid: String,
    pub name: String,
    pub firmware_version: String,
    pub rssi: i32,
    pub available_sensors: SensorFlags,
    pub available_gestures: GestureFlags,
    pub available_intervals: IntervalFlags,
    pub product_id: u16,
    pub variant_id: u8,
    pub dynamic_info: DynamicDeviceInfo,
}

impl Device {
    pub fn same_device(&self, other: &Device) -> bool {
        self.uid == other.uid
    }

    /// A fresh snapshot carrying `info` in place of the current dynamic info.
    pub fn with_dynamic_info(&self, info: DynamicDeviceInfo) -> Device {
        Device {
            dynamic_info: info,
            ..self.clone()
        }
    }

    pub fn device_status(&self) -> DeviceStatus {
        self.dynamic_info.device_status
    }

    pub fn requires_secure_pairing(&self) -> bool {
        self.device_status()
            .contains(DeviceStatus::SECURE_PAIRING_REQUIRED)
    }

    pub fn is_paired(&self) -> bool {
        self.device_status().contains(DeviceStatus::ALREADY_PAIRED)
    }
}
