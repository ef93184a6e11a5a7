//! Contact service: the satellite's self description and node check-ins.
//!
//! Built before the overlay service, so the overlay is attached afterwards
//! through [`Service::bind_overlay`]. Check-ins received before the overlay is
//! attached are still answered; they are just not recorded.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use shared_types::{NodeAddress, NodeDossier, NodeId, PeerIdentities, PeerIdentity};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::overlay;
use crate::registry::{Lifecycle, Subsystem, SubsystemError, SubsystemId, SubsystemState};
use crate::rpc::Dialer;

pub struct Service {
    local: NodeDossier,
    dialer: Dialer,
    peers: Arc<dyn PeerIdentities>,
    overlay: OnceLock<Arc<overlay::Service>>,
    closed: CancellationToken,
    lifecycle: Lifecycle,
}

impl Service {
    pub fn new(local: NodeDossier, dialer: Dialer, peers: Arc<dyn PeerIdentities>) -> Self {
        Self {
            local,
            dialer,
            peers,
            overlay: OnceLock::new(),
            closed: CancellationToken::new(),
            lifecycle: Lifecycle::new(),
        }
    }

    /// The dossier this satellite advertises.
    pub fn local(&self) -> &NodeDossier {
        &self.local
    }

    /// Attach the overlay; false if one was already attached.
    pub fn bind_overlay(&self, overlay: Arc<overlay::Service>) -> bool {
        self.overlay.set(overlay).is_ok()
    }

    /// Dial a node without touching any stored state.
    pub async fn ping_node(&self, id: &NodeId, address: &NodeAddress) -> Result<(), SubsystemError> {
        self.dialer.ping(id, address).await
    }

    /// Handle a node check-in: remember its identity, dial it back and record
    /// whether it was reachable.
    pub async fn ping_back(&self, peer: PeerIdentity, address: NodeAddress) -> Result<bool, SubsystemError> {
        let id = peer.id;
        self.peers.set(peer).await?;

        let reachable = match self.dialer.ping(&id, &address).await {
            Ok(()) => true,
            Err(err) => {
                debug!(subsystem = "contact:service", node = %id, error = %err, "Ping back failed");
                false
            }
        };

        if let Some(overlay) = self.overlay.get() {
            overlay.update_check_in(&id, address, reachable).await?;
        }

        info!(subsystem = "contact:service", node = %id, reachable, "Node checked in");
        Ok(reachable)
    }
}

#[async_trait]
impl Subsystem for Service {
    fn id(&self) -> SubsystemId {
        SubsystemId::ContactService
    }

    async fn run(&self, token: CancellationToken) -> Result<(), SubsystemError> {
        if !self.lifecycle.start() {
            return Ok(());
        }
        tokio::select! {
            _ = token.cancelled() => Err(SubsystemError::Canceled),
            _ = self.closed.cancelled() => Ok(()),
        }
    }

    fn close(&self) -> Result<(), SubsystemError> {
        self.lifecycle.stop();
        self.closed.cancel();
        Ok(())
    }

    fn state(&self) -> SubsystemState {
        self.lifecycle.state()
    }
}
