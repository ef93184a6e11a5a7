//! # Repair
//!
//! The checker finds segments whose healthy piece count fell to the repair
//! threshold and queues them; the repairer drains the queue, replacing pieces
//! held by unreliable nodes.

pub mod checker;
pub mod repairer;

pub use checker::{Checker, CheckerStats};
pub use repairer::{Repairer, SegmentRepairer};
