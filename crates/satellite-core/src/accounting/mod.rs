//! # Accounting
//!
//! | Type | Role |
//! |------|------|
//! | `ProjectUsage` | storage limit checks against tallied + live usage |
//! | `Tally` | per-project and per-node storage totals from one loop pass |
//! | `Rollup` | daily aggregation of node tallies |

pub mod rollup;
pub mod tally;
pub mod usage;

pub use rollup::Rollup;
pub use tally::Tally;
pub use usage::ProjectUsage;
