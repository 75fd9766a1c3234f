//! Opening endpoints between mesh bases.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use mesh_comm::{memory_pair, LinkControl, MessageEndpoint, RetryPolicy};
use mesh_kernel::NetMeshBaseIdentifier;
use parking_lot::RwLock;
use tracing::debug;

use crate::{
    error::{NetError, NetResult},
    meshbase::NetMeshBase,
    message::XprisoMessage,
};

/// Produces a started endpoint from `local` to `partner`.
#[async_trait]
pub trait ProxyEndpointFactory: Send + Sync {
    async fn connect(
        &self,
        local: &NetMeshBaseIdentifier,
        partner: &NetMeshBaseIdentifier,
    ) -> NetResult<Arc<dyn MessageEndpoint<XprisoMessage>>>;
}

/// Wire `partner` to `local` in memory. The partner's proxy is activated on
/// its side; the returned endpoint is for the caller's proxy.
pub fn link_in_memory(
    local: &NetMeshBaseIdentifier,
    partner: &NetMeshBase,
    retry: RetryPolicy,
) -> (Arc<dyn MessageEndpoint<XprisoMessage>>, LinkControl) {
    let (ours, theirs, control) = memory_pair::<XprisoMessage>(
        format!("{local}->{}", partner.identifier()),
        format!("{}->{local}", partner.identifier()),
        retry,
    );
    ours.start_communicating();
    theirs.start_communicating();
    partner.connect_with(local, theirs);
    let ours: Arc<dyn MessageEndpoint<XprisoMessage>> = ours;
    (ours, control)
}

/// Mesh bases living in one process, reachable from each other in memory.
/// Identifiers not registered here go to the fallback factory, if any.
pub struct MemoryMeshNetwork {
    bases: DashMap<NetMeshBaseIdentifier, Weak<NetMeshBase>>,
    links: DashMap<(NetMeshBaseIdentifier, NetMeshBaseIdentifier), LinkControl>,
    retry: RetryPolicy,
    fallback: RwLock<Option<Arc<dyn ProxyEndpointFactory>>>,
}

impl MemoryMeshNetwork {
    pub fn new(retry: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            bases: DashMap::new(),
            links: DashMap::new(),
            retry,
            fallback: RwLock::new(None),
        })
    }

    /// Make `net` reachable and let it reach the others through this network.
    pub fn register(self: &Arc<Self>, net: &Arc<NetMeshBase>) {
        self.bases
            .insert(net.identifier().clone(), Arc::downgrade(net));
        net.set_endpoint_factory(self.clone());
    }

    pub fn set_fallback(&self, factory: Arc<dyn ProxyEndpointFactory>) {
        *self.fallback.write() = Some(factory);
    }

    /// Switches for the most recent link opened from `from` to `to`.
    pub fn link(&self, from: &NetMeshBaseIdentifier, to: &NetMeshBaseIdentifier) -> Option<LinkControl> {
        self.links
            .get(&(from.clone(), to.clone()))
            .map(|l| l.value().clone())
    }
}

#[async_trait]
impl ProxyEndpointFactory for MemoryMeshNetwork {
    async fn connect(
        &self,
        local: &NetMeshBaseIdentifier,
        partner: &NetMeshBaseIdentifier,
    ) -> NetResult<Arc<dyn MessageEndpoint<XprisoMessage>>> {
        let target = self.bases.get(partner).and_then(|w| w.value().upgrade());
        let Some(target) = target else {
            let fallback = self.fallback.read().clone();
            return match fallback {
                Some(factory) => factory.connect(local, partner).await,
                None => Err(NetError::Unreachable {
                    partner: partner.clone(),
                    reason: "not registered with this network".to_string(),
                }),
            };
        };
        if target.is_dead() {
            return Err(NetError::Dead(partner.clone()));
        }
        let (endpoint, control) = link_in_memory(local, &target, self.retry.clone());
        self.links
            .insert((local.clone(), partner.clone()), control);
        debug!(local = %local, partner = %partner, "Opened in-memory link");
        Ok(endpoint)
    }
}
