//! Discovery, connection and live reconfiguration of wearable sensor
//! devices over interchangeable transports.
//!
//! Applications declare [`Requirement`]s describing the sensors, gestures
//! and update rate they need; the [`DeviceManager`] folds them into one
//! configuration and keeps the connected device in sync with it.

pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod manager;

pub use domain::config::DeviceConfig;
pub use domain::events::DeviceEvent;
pub use domain::intent::IntentProfile;
pub use domain::models::{Device, GestureId, SensorId, UpdateInterval};
pub use domain::requirement::{Requirement, RequirementHandle};
pub use domain::session::{ConnectionPhase, FirmwareChoice};
pub use error::{Error, Result};
pub use manager::{DeviceManager, ManagerOptions};
