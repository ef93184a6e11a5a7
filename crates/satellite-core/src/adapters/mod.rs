//! # Adapter Implementations
//!
//! Concrete backends for the repository ports in `shared_types`.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  satellite-core subsystems                   │
//! │        ↓ uses Arc<dyn Port>                  │
//! │  shared_types::repositories (ports)          │
//! │        ↑ implements                          │
//! │  adapters::memory (in-process backends)      │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Only in-memory backends ship with the core; persistent stores are wired by
//! the deployment that owns them.

pub mod memory;

pub use memory::MemoryRepositories;
