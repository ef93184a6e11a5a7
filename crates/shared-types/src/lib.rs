//! # Shared Types Crate
//!
//! Types that cross subsystem boundaries inside the satellite core.
//!
//! ## Contents
//!
//! - **Identity**: `FullIdentity`, `PeerIdentity`, `NodeId` (derived from the public key)
//! - **Version**: `VersionInfo`, `SemVer`, `NodeVersion`
//! - **Entities**: pointers, node records, tallies, transfer queue items, order limits
//! - **Repositories**: the storage ports each subsystem is given a subset of
//!
//! ## Design Principles
//!
//! - **Ports, not backends**: repositories are traits; concrete backends live
//!   with the process that wires them.
//! - **Immutable identity**: key material never changes after construction.

pub mod entities;
pub mod errors;
pub mod identity;
pub mod repositories;
pub mod version;

pub use entities::*;
pub use errors::*;
pub use identity::{FullIdentity, NodeId, PeerIdentity};
pub use repositories::*;
pub use version::{NodeVersion, SemVer, VersionInfo};
