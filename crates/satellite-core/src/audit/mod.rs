//! # Audit
//!
//! ```text
//!   Chore ──samples segments──→ Queue ──→ Worker ──→ Verifier ──Report──→ Reporter ──→ overlay
//!     ↑                                                  │                    │
//!   metainfo loop                                    containment ←────────────┘
//! ```
//!
//! The chore refills the queue from a loop pass; the worker drains it. The
//! queue is the only state the two share.

pub mod chore;
pub mod queue;
pub mod reporter;
pub mod verifier;
pub mod worker;

pub use chore::Chore;
pub use queue::Queue;
pub use reporter::Reporter;
pub use verifier::{Report, Verifier};
pub use worker::Worker;
