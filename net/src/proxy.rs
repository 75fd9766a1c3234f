//! A proxy runs the replication protocol with one partner mesh base.
//!
//! Incoming messages are queued on an inbox and applied one at a time by a
//! task owned by the proxy. A response is handed to the waiting caller only
//! after its content has been applied, so a caller that awaited a lock or a
//! replica observes it immediately.

use std::{
    collections::BTreeSet,
    sync::{Arc, Weak},
    time::Duration,
};

use mesh_comm::{
    CarriesInvocationId, EndpointError, InvocationIdGenerator, MessageEndpoint,
    MessageEndpointListener, Subscription, WaitForResponseEndpoint,
};
use mesh_kernel::{ChangeEvent, ChangeSet, MeshObjectIdentifier, NetMeshBaseIdentifier};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    error::{NetError, NetResult},
    meshbase::NetMeshBase,
    message::XprisoMessage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// Known partner without a live endpoint.
    Placeholder,
    Active,
    /// One side asked to stop replicating.
    Ceased,
}

struct Link {
    endpoint: Arc<dyn MessageEndpoint<XprisoMessage>>,
    rpc: Arc<WaitForResponseEndpoint<XprisoMessage>>,
    inbox: mpsc::UnboundedSender<XprisoMessage>,
    _subscription: Subscription,
}

pub struct Proxy {
    local: NetMeshBaseIdentifier,
    partner: NetMeshBaseIdentifier,
    net: Weak<NetMeshBase>,
    ids: Arc<InvocationIdGenerator>,
    rpc_timeout: Duration,
    state: Mutex<ProxyState>,
    link: Mutex<Option<Arc<Link>>>,
    connecting: tokio::sync::Mutex<()>,
    /// Objects whose lock we are forcibly reclaiming from the partner.
    reclaiming: Mutex<BTreeSet<MeshObjectIdentifier>>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("local", &self.local)
            .field("partner", &self.partner)
            .field("state", &self.state())
            .finish()
    }
}

impl Proxy {
    pub(crate) fn new(
        local: NetMeshBaseIdentifier,
        partner: NetMeshBaseIdentifier,
        net: Weak<NetMeshBase>,
        ids: Arc<InvocationIdGenerator>,
        rpc_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            partner,
            net,
            ids,
            rpc_timeout,
            state: Mutex::new(ProxyState::Placeholder),
            link: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
            reclaiming: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn partner(&self) -> &NetMeshBaseIdentifier {
        &self.partner
    }

    pub fn state(&self) -> ProxyState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ProxyState::Active && self.current_link().is_some()
    }

    /// Messages queued towards the partner but not yet delivered.
    pub fn messages_to_be_sent(&self) -> Vec<XprisoMessage> {
        self.current_link()
            .map(|link| link.endpoint.messages_to_be_sent())
            .unwrap_or_default()
    }

    /// Serializes connection attempts for this partner.
    pub(crate) async fn connecting(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.connecting.lock().await
    }

    /// Attach a started endpoint and begin processing incoming messages.
    pub(crate) fn activate(self: &Arc<Self>, endpoint: Arc<dyn MessageEndpoint<XprisoMessage>>) {
        let rpc = WaitForResponseEndpoint::unattached(
            Arc::clone(&endpoint),
            Arc::clone(&self.ids),
            self.rpc_timeout,
        );
        let (inbox, rx) = mpsc::unbounded_channel();
        let listener: Arc<dyn MessageEndpointListener<XprisoMessage>> = self.clone();
        let subscription = endpoint.add_weak_listener(&listener);
        let link = Arc::new(Link {
            endpoint,
            rpc: Arc::clone(&rpc),
            inbox,
            _subscription: subscription,
        });
        if let Some(previous) = self.link.lock().replace(link) {
            previous.endpoint.stop_communicating();
        }
        *self.state.lock() = ProxyState::Active;
        tokio::spawn(Self::run_inbox(Arc::downgrade(self), rx, rpc));
        info!(local = %self.local, partner = %self.partner, "Proxy active");
    }

    fn current_link(&self) -> Option<Arc<Link>> {
        self.link.lock().clone()
    }

    fn net(&self) -> NetResult<Arc<NetMeshBase>> {
        self.net
            .upgrade()
            .ok_or_else(|| NetError::Dead(self.local.clone()))
    }

    fn new_message(&self) -> XprisoMessage {
        XprisoMessage::new(self.local.clone(), self.partner.clone())
    }

    fn send(&self, message: XprisoMessage) -> NetResult<()> {
        let link = self
            .current_link()
            .ok_or_else(|| NetError::NotCommunicating(self.partner.clone()))?;
        link.endpoint.enqueue_message_for_send(message)?;
        Ok(())
    }

    pub(crate) async fn call(&self, message: XprisoMessage) -> NetResult<XprisoMessage> {
        let link = self
            .current_link()
            .ok_or_else(|| NetError::NotCommunicating(self.partner.clone()))?;
        Ok(link.rpc.call(message).await?)
    }

    async fn run_inbox(
        weak: Weak<Self>,
        mut rx: mpsc::UnboundedReceiver<XprisoMessage>,
        rpc: Arc<WaitForResponseEndpoint<XprisoMessage>>,
    ) {
        while let Some(message) = rx.recv().await {
            let Some(proxy) = weak.upgrade() else {
                return;
            };
            proxy.process_incoming(message, &rpc).await;
        }
        debug!("Proxy inbox closed");
    }

    async fn process_incoming(
        &self,
        message: XprisoMessage,
        rpc: &WaitForResponseEndpoint<XprisoMessage>,
    ) {
        let Ok(net) = self.net() else {
            return;
        };
        let misaddressed = message.sender.as_ref().is_some_and(|s| *s != self.partner)
            || message.receiver.as_ref().is_some_and(|r| *r != self.local);
        if misaddressed {
            warn!(
                partner = %self.partner,
                sender = ?message.sender,
                receiver = ?message.receiver,
                "Dropping misaddressed message"
            );
            return;
        }

        if let Err(e) = net.apply_incoming(&self.partner, &message) {
            warn!(
                partner = %self.partner,
                error = %e,
                "Incoming message could not be applied, dropping its content"
            );
            if message.response_id().is_some() {
                rpc.complete(message);
            }
            return;
        }

        let base = net.mesh_base();
        if base.has_store() && base.is_dirty() {
            match base.flush().await {
                Ok(written) => {
                    debug!(partner = %self.partner, written, "Flushed changes received from partner")
                }
                Err(e) => {
                    warn!(partner = %self.partner, error = %e, "Failed to flush changes received from partner")
                }
            }
        }

        let replicas = net.replicas();
        for id in &message.pushed_lock_objects {
            replicas.acquire_lock(id, Some(&self.partner));
        }
        for id in &message.pushed_home_replicas {
            replicas.acquire_home(id, &self.partner);
        }

        for (id, path) in &message.redirects {
            if path.partner != *net.identifier() && replicas.redirect_forward_reference(id, path.clone()) {
                debug!(object = %id, partner = %path.partner, "Forward reference redirected");
            }
        }

        let mut response = self.new_message();
        if let Some(id) = message.request_id() {
            response.set_response_id(id);
        }

        for id in &message.reclaimed_lock_objects {
            let crossing = self.reclaiming.lock().contains(id);
            if crossing && self.local < self.partner {
                info!(object = %id, partner = %self.partner, "Crossing lock reclaim, keeping the lock");
                response.reclaimed_lock_objects.push(id.clone());
            } else {
                replicas.surrender_lock(id, &self.partner);
            }
        }

        for id in &message.requested_canceled_objects {
            replicas.cancel_replication(id, &self.partner);
        }

        for id in &message.requested_first_time_objects {
            if let Some(state) = replicas.get(id).filter(|s| s.is_forward_reference) {
                debug!(object = %id, "Not replicating a forward reference");
                if let Some(path) = state.access_path.filter(|p| p.partner != self.partner) {
                    response.redirects.push((id.clone(), path));
                }
                continue;
            }
            match net.mesh_base().find(id) {
                Some(object) => {
                    replicas.register_replication(id, &self.partner);
                    response.convey(object);
                }
                None => debug!(object = %id, partner = %self.partner, "Requested object not found"),
            }
        }

        for id in &message.requested_home_replicas {
            if self.grant_home(&net, id).await {
                if let Some(object) = net.mesh_base().find(id) {
                    response.convey(object);
                }
                response.pushed_home_replicas.push(id.clone());
            }
        }

        for id in &message.requested_lock_objects {
            if self.grant_lock(&net, id).await {
                if let Some(object) = net.mesh_base().find(id) {
                    response.convey(object);
                }
                response.pushed_lock_objects.push(id.clone());
            }
        }

        if message.cease_communications {
            info!(partner = %self.partner, "Partner ceased communications");
            replicas.forget_partner(&self.partner);
            *self.state.lock() = ProxyState::Ceased;
        }

        if message.request_id().is_some() || !response.is_empty() {
            if let Err(e) = self.send(response) {
                warn!(partner = %self.partner, error = %e, "Failed to send response");
            }
        }

        if message.response_id().is_some() {
            rpc.complete(message);
        }
    }

    /// Give the partner our lock on `id`, fetching it from its current holder
    /// first if that is a third mesh base.
    async fn grant_lock(&self, net: &Arc<NetMeshBase>, id: &MeshObjectIdentifier) -> bool {
        if !net.mesh_base().contains(id) {
            return false;
        }
        let replicas = net.replicas();
        if replicas.surrender_lock_if_held(id, &self.partner) {
            return true;
        }
        let Some(state) = replicas.get(id) else {
            return false;
        };
        if !state.will_give_up_lock {
            info!(object = %id, partner = %self.partner, "Refusing to give up lock");
            return false;
        }
        let Some(holder) = state.towards_lock.filter(|h| *h != self.partner) else {
            return false;
        };
        let Some(proxy) = net.proxy(&holder) else {
            return false;
        };
        if let Err(e) = proxy.try_to_obtain_locks(std::slice::from_ref(id)).await {
            warn!(object = %id, holder = %holder, error = %e, "Could not fetch lock on behalf of partner");
            return false;
        }
        replicas.surrender_lock_if_held(id, &self.partner)
    }

    async fn grant_home(&self, net: &Arc<NetMeshBase>, id: &MeshObjectIdentifier) -> bool {
        if !net.mesh_base().contains(id) {
            return false;
        }
        let replicas = net.replicas();
        if replicas.surrender_home_if_held(id, &self.partner) {
            return true;
        }
        let Some(state) = replicas.get(id) else {
            return false;
        };
        if !state.will_give_up_home_replica {
            info!(object = %id, partner = %self.partner, "Refusing to give up home replica");
            return false;
        }
        let Some(holder) = state.towards_home.filter(|h| *h != self.partner) else {
            return false;
        };
        let Some(proxy) = net.proxy(&holder) else {
            return false;
        };
        if let Err(e) = proxy
            .try_to_obtain_home_replicas(std::slice::from_ref(id))
            .await
        {
            warn!(object = %id, holder = %holder, error = %e, "Could not fetch home replica on behalf of partner");
            return false;
        }
        replicas.surrender_home_if_held(id, &self.partner)
    }

    /// Ask the partner for first-time replicas of `ids`.
    pub async fn obtain_replicas(&self, ids: &[MeshObjectIdentifier]) -> NetResult<()> {
        let mut message = self.new_message();
        message.requested_first_time_objects = ids.to_vec();
        self.call(message).await?;
        Ok(())
    }

    /// Returns the subset of `ids` whose lock we hold afterwards.
    pub async fn try_to_obtain_locks(
        &self,
        ids: &[MeshObjectIdentifier],
    ) -> NetResult<Vec<MeshObjectIdentifier>> {
        let net = self.net()?;
        let mut message = self.new_message();
        message.requested_lock_objects = ids.to_vec();
        self.call(message).await?;
        Ok(ids
            .iter()
            .filter(|id| net.replicas().has_lock(id))
            .cloned()
            .collect())
    }

    pub async fn try_to_obtain_home_replicas(
        &self,
        ids: &[MeshObjectIdentifier],
    ) -> NetResult<Vec<MeshObjectIdentifier>> {
        let net = self.net()?;
        let mut message = self.new_message();
        message.requested_home_replicas = ids.to_vec();
        self.call(message).await?;
        Ok(ids
            .iter()
            .filter(|id| net.replicas().is_home(id))
            .cloned()
            .collect())
    }

    /// Hand the locks we hold among `ids` to the partner without waiting
    /// for an answer. Returns the identifiers actually pushed.
    pub fn try_to_push_locks(
        &self,
        ids: &[MeshObjectIdentifier],
    ) -> NetResult<Vec<MeshObjectIdentifier>> {
        let net = self.net()?;
        let mut message = self.new_message();
        for id in ids {
            let Some(object) = net.mesh_base().find(id) else {
                continue;
            };
            if net.replicas().hand_over_lock(id, &self.partner) {
                message.convey(object);
                message.pushed_lock_objects.push(id.clone());
            }
        }
        let pushed = message.pushed_lock_objects.clone();
        if !pushed.is_empty() {
            self.send(message)?;
        }
        Ok(pushed)
    }

    pub fn try_to_push_home_replicas(
        &self,
        ids: &[MeshObjectIdentifier],
    ) -> NetResult<Vec<MeshObjectIdentifier>> {
        let net = self.net()?;
        let mut message = self.new_message();
        for id in ids {
            let Some(object) = net.mesh_base().find(id) else {
                continue;
            };
            if net.replicas().hand_over_home(id, &self.partner) {
                message.convey(object);
                message.pushed_home_replicas.push(id.clone());
            }
        }
        let pushed = message.pushed_home_replicas.clone();
        if !pushed.is_empty() {
            self.send(message)?;
        }
        Ok(pushed)
    }

    /// Take the locks back from the partner regardless of its policy. Only a
    /// home replica may do this. When both sides reclaim the same lock at
    /// once, the mesh base with the lower identifier keeps it.
    pub async fn force_obtain_locks(
        &self,
        ids: &[MeshObjectIdentifier],
    ) -> NetResult<Vec<MeshObjectIdentifier>> {
        let net = self.net()?;
        let replicas = net.replicas();
        if let Some(id) = ids.iter().find(|id| !replicas.is_home(id)) {
            return Err(NetError::NotHomeReplica(id.clone()));
        }
        for id in ids {
            replicas.acquire_lock(id, Some(&self.partner));
        }
        self.reclaiming.lock().extend(ids.iter().cloned());

        let mut message = self.new_message();
        message.reclaimed_lock_objects = ids.to_vec();
        let result = self.call(message).await;

        {
            let mut reclaiming = self.reclaiming.lock();
            for id in ids {
                reclaiming.remove(id);
            }
        }
        result?;
        Ok(ids
            .iter()
            .filter(|id| replicas.has_lock(id))
            .cloned()
            .collect())
    }

    /// Tell the partner we no longer want updates for these replicas.
    pub fn cancel_replicas(&self, ids: &[MeshObjectIdentifier]) -> NetResult<()> {
        let mut message = self.new_message();
        message.requested_canceled_objects = ids.to_vec();
        self.send(message)
    }

    pub fn initiate_cease_communications(&self) -> NetResult<()> {
        let net = self.net()?;
        let mut message = self.new_message();
        message.cease_communications = true;
        self.send(message)?;
        net.replicas().forget_partner(&self.partner);
        *self.state.lock() = ProxyState::Ceased;
        info!(partner = %self.partner, "Ceased communications");
        Ok(())
    }

    /// Forward a committed transaction to the partner.
    ///
    /// Changes received from the partner are not echoed back. Relating a
    /// replicated object to one the partner has never seen conveys the new
    /// neighbor in full instead of sending the relationship events.
    pub(crate) fn transaction_committed(&self, net: &NetMeshBase, changes: &ChangeSet) {
        if !self.is_active() {
            return;
        }
        let replicas = net.replicas();
        let relevant: Vec<&ChangeEvent> = changes
            .not_from(&self.partner)
            .map(|c| &c.event)
            .collect();

        let mut conveyed: Vec<MeshObjectIdentifier> = Vec::new();
        for event in &relevant {
            let (ChangeEvent::NeighborAdded { identifier, neighbor }
            | ChangeEvent::RolesAdded {
                identifier,
                neighbor,
                ..
            }) = event
            else {
                continue;
            };
            for (known, other) in [(identifier, neighbor), (neighbor, identifier)] {
                if replicas.is_replicated_with(known, &self.partner)
                    && !replicas.is_replicated_with(other, &self.partner)
                    && !replicas.is_forward_reference(other)
                    && !conveyed.contains(other)
                {
                    conveyed.push(other.clone());
                }
            }
        }

        let mut message = self.new_message();
        for event in relevant {
            if matches!(event, ChangeEvent::Created { .. }) {
                continue;
            }
            let affected = event.affected();
            let counterpart = event.counterpart();
            if conveyed.contains(affected) || counterpart.is_some_and(|c| conveyed.contains(c)) {
                continue;
            }
            let shared = replicas.is_replicated_with(affected, &self.partner)
                || counterpart.is_some_and(|c| replicas.is_replicated_with(c, &self.partner))
                || matches!(event, ChangeEvent::Deleted { object } if object
                    .neighbors()
                    .chain(object.equivalents())
                    .any(|n| replicas.is_replicated_with(n, &self.partner)));
            if shared {
                message.events.push(event.clone());
            }
        }
        for id in &conveyed {
            if let Some(object) = net.mesh_base().find(id) {
                replicas.register_replication(id, &self.partner);
                message.convey(object);
            }
        }

        if message.is_empty() {
            return;
        }
        debug!(
            partner = %self.partner,
            events = message.events.len(),
            conveyed = message.conveyed_objects.len(),
            "Forwarding committed changes"
        );
        if let Err(e) = self.send(message) {
            warn!(partner = %self.partner, error = %e, "Failed to forward changes");
        }
    }
}

impl MessageEndpointListener<XprisoMessage> for Proxy {
    fn message_received(&self, _endpoint: &str, message: XprisoMessage) {
        match self.current_link() {
            Some(link) => {
                if link.inbox.send(message).is_err() {
                    debug!(partner = %self.partner, "Inbox closed, dropping message");
                }
            }
            None => debug!(partner = %self.partner, "No link, dropping message"),
        }
    }

    fn disabling_error(&self, _endpoint: &str, undelivered: &[XprisoMessage], error: &EndpointError) {
        warn!(
            partner = %self.partner,
            undelivered = undelivered.len(),
            error = %error,
            "Lost connection to partner"
        );
        let link = self.link.lock().take();
        if let Some(link) = link {
            link.rpc.fail_pending(error);
        }
        let mut state = self.state.lock();
        if *state == ProxyState::Active {
            *state = ProxyState::Placeholder;
        }
    }
}
