//! # Satellite Core Test Suite
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! ├── harness.rs        # Core fixtures and failing repositories
//! └── integration/
//!     ├── construction.rs   # Build pipeline and teardown
//!     ├── run.rs            # Group run, cancellation and failures
//!     ├── close.rs          # Ordered, idempotent close
//!     └── config_file.rs    # TOML-driven construction
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p satellite-tests
//! cargo test -p satellite-tests integration::run::
//! ```

pub mod harness;
pub mod integration;
