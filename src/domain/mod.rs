//! Domain Module
//!
//! Transport-independent types and state machines.
//!
//! ## Modules
//!
//! - [`models`] - device snapshots, capability ids and flag sets
//! - [`config`] - desired sensor/gesture/interval configuration
//! - [`intent`] - declared capability contracts
//! - [`requirement`] - caller-owned requirements and their registry
//! - [`resolver`] - folds requirements into one configuration
//! - [`update_gate`] - debounce and lock for configuration pushes
//! - [`permissions`] - OS precondition chain
//! - [`session`] - connection handshake state machine
//! - [`events`] - events published to subscribers
//! - [`settings`] - persisted application settings

pub mod config;
pub mod events;
pub mod intent;
pub mod models;
pub mod permissions;
pub mod requirement;
pub mod resolver;
pub mod session;
pub mod settings;
pub mod update_gate;
