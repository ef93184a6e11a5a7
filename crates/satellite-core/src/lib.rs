//! # Satellite Core Library
//!
//! The background machinery of a storage-network satellite and the
//! supervisor that constructs, runs and closes it. The `satellite-core`
//! binary is a thin wrapper over [`Core`].
//!
//! ## Layout
//!
//! - `container/` - configuration and the `Core` supervisor
//! - `registry/` - the `Subsystem` contract, group run and ordered close
//! - `adapters/` - in-memory repository implementations
//! - everything else - one module per subsystem

#![allow(clippy::module_name_repetitions)]

pub mod accounting;
pub mod adapters;
pub mod audit;
pub mod chore;
pub mod contact;
pub mod container;
pub mod dbcleanup;
pub mod downtime;
pub mod gc;
pub mod gracefulexit;
pub mod metainfo;
pub mod metrics;
pub mod orders;
pub mod overlay;
pub mod payments;
pub mod registry;
pub mod repair;
pub mod rpc;
pub mod version;

pub use container::{Config, Core, CoreError};
pub use registry::{CloseErrors, RunFailure, Subsystem, SubsystemError, SubsystemId, SubsystemState};
