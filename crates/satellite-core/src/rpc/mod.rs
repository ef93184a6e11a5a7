//! # Secure Transport
//!
//! TLS option validation and the dialer every outbound-calling subsystem
//! shares. The handshake itself is outside this crate; `Options` carries the
//! identity checks a handshake would apply to a peer.

pub mod dialer;
pub mod tls;

pub use dialer::Dialer;
pub use tls::{Options, TlsError};
