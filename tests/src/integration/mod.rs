//! # Supervisor Integration Tests
//!
//! Full construction over in-memory repositories, exercising the core the
//! way the binary does.

pub mod close;
pub mod config_file;
pub mod construction;
pub mod run;
