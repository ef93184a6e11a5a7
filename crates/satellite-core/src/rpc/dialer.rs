//! Outbound connections to storage nodes.

use std::sync::Arc;
use std::time::Duration;

use shared_types::{NodeAddress, NodeId};
use tokio::net::TcpStream;
use tracing::trace;

use super::tls::Options;
use crate::registry::SubsystemError;

/// Dials peers after checking them against the TLS options.
#[derive(Debug, Clone)]
pub struct Dialer {
    options: Arc<Options>,
    timeout: Duration,
}

impl Dialer {
    pub fn new(options: Arc<Options>, timeout: Duration) -> Self {
        Self { options, timeout }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open a connection to `peer` at `address`.
    pub async fn dial(&self, peer: &NodeId, address: &NodeAddress) -> Result<TcpStream, SubsystemError> {
        let dial_err = |reason: String| SubsystemError::Dial {
            address: address.address.clone(),
            reason,
        };

        self.options
            .verify_peer(peer)
            .map_err(|e| dial_err(e.to_string()))?;

        trace!(peer = %peer, address = %address.address, "Dialing");
        match tokio::time::timeout(self.timeout, TcpStream::connect(&address.address)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(dial_err(e.to_string())),
            Err(_) => Err(dial_err(format!("timed out after {:?}", self.timeout))),
        }
    }

    /// Check that `peer` accepts connections.
    pub async fn ping(&self, peer: &NodeId, address: &NodeAddress) -> Result<(), SubsystemError> {
        self.dial(peer, address).await.map(drop)
    }
}
