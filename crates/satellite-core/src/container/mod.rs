//! # Satellite Container
//!
//! Configuration and the `Core` supervisor that owns every subsystem.

pub mod config;
pub mod core;

pub use self::config::{BillingProvider, Config, ConfigError};
pub use self::core::{BuildError, Core, CoreError};
