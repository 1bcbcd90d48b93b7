//! Infrastructure Module
//!
//! - [`transport`] - links to the device
//! - [`store`] - last connected device persistence
//! - [`logging`] - tracing subscriber setup

pub mod logging;
pub mod store;
pub mod transport;
