// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

//! The local peer: the node's own acceptor farm. It owns the silo, the
//! decision cache, the placement catalog, the eviction timers and the
//! rebalancer queue, and serves the nine peer RPCs for every block this
//! node holds.

use crate::{
    catalog::{Catalog, DecisionCache},
    paxos::{client::{ClientPeer, PaxosClient}, server::PaxosServer},
    persistence::{self, DecisionRecord, SiloEntry},
    rebalancer::{self, RebalanceItem, RebalanceQueue},
};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex},
    task::JoinHandle,
};
use torus_config::ConsensusConfig;
use torus_network::Peer;
use torus_overlay::{Overlay, OverlayEvent};
use torus_silo::Silo;
use torus_types::{
    Address, Block, Error, GetResponse, NodeId, PromiseResponse, Proposal,
    ProtocolVersion, Quorum, RemoveSignature, SerializationContext, StoreMode,
    Value,
};
use tracing::{debug, trace, warn};

/// What a silo key resolved to.
pub(crate) enum Loaded {
    Decision(Arc<AsyncMutex<PaxosServer>>),
    Block(Block),
}

pub struct LocalPeer {
    node_id: NodeId,
    config: ConsensusConfig,
    protocol: ProtocolVersion,
    silo: Arc<dyn Silo>,
    overlay: OnceCell<Arc<dyn Overlay>>,
    decisions: AsyncMutex<DecisionCache>,
    catalog: Mutex<Catalog>,
    queue: RebalanceQueue,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<RebalanceItem>>>,
    evictions: Mutex<HashMap<NodeId, JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl LocalPeer {
    pub fn new(
        node_id: NodeId,
        config: ConsensusConfig,
        protocol: ProtocolVersion,
        silo: Arc<dyn Silo>,
    ) -> Arc<Self> {
        let (queue, queue_rx) = RebalanceQueue::new();
        Arc::new(Self {
            node_id,
            decisions: AsyncMutex::new(DecisionCache::new(
                config.decision_cache_size,
            )),
            config,
            protocol,
            silo,
            overlay: OnceCell::new(),
            catalog: Mutex::new(Catalog::new()),
            queue,
            queue_rx: Mutex::new(Some(queue_rx)),
            evictions: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Wires the overlay and spawns the background machinery: the
    /// overlay event listener, the rebalancer loop and, when configured,
    /// the startup inspector.
    pub fn start(self: &Arc<Self>, overlay: Arc<dyn Overlay>) {
        let mut events = overlay.subscribe();
        if self.overlay.set(overlay).is_err() {
            warn!(node = %self.node_id, "local peer started twice");
            return;
        }
        let mut tasks = self.tasks.lock();

        let weak = Arc::downgrade(self);
        tasks.push(tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let Some(local) = weak.upgrade() else { break };
                match event {
                    OverlayEvent::Discover(id) => local.discovered(id),
                    OverlayEvent::Disappear(id) => local.disappeared(id),
                }
            }
        }));

        let queue_rx = self
            .queue_rx
            .lock()
            .take()
            .expect("rebalancer queue consumed twice");
        tasks.push(tokio::spawn(rebalancer::run(
            Arc::downgrade(self),
            queue_rx,
        )));

        if self.config.rebalance_inspect && self.config.replication_factor > 1
        {
            tasks
                .push(tokio::spawn(rebalancer::inspect(Arc::downgrade(self))));
        }
    }

    /// Cancels every background task and timer. Pending RPCs finish on
    /// their own; nothing new is scheduled afterwards.
    pub fn stop(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for (_, timer) in self.evictions.lock().drain() {
            timer.abort();
        }
    }

    /// Resigns from every mutable block this node still owns, then
    /// stops. Spec'd shutdown order: hand blocks off first, cancel the
    /// machinery second.
    pub async fn shutdown(self: &Arc<Self>) {
        rebalancer::resign(self).await;
        self.stop();
    }

    pub fn id(&self) -> NodeId {
        self.node_id
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    pub(crate) fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub(crate) fn silo(&self) -> &Arc<dyn Silo> {
        &self.silo
    }

    pub(crate) fn catalog(&self) -> &Mutex<Catalog> {
        &self.catalog
    }

    pub(crate) fn context(&self) -> SerializationContext {
        SerializationContext::new(self.protocol)
    }

    pub(crate) fn overlay(&self) -> Result<&Arc<dyn Overlay>, Error> {
        self.overlay
            .get()
            .ok_or_else(|| Error::Unavailable("node not started".into()))
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Queues `address` for quorum expansion.
    pub(crate) fn schedule_block(&self, address: Address) {
        trace!(node = %self.node_id, %address, "scheduled for rebalancing");
        self.queue.push(RebalanceItem::Block(address));
    }

    pub(crate) fn queue(&self) -> &RebalanceQueue {
        &self.queue
    }

    pub(crate) fn eviction_armed(&self, id: &NodeId) -> bool {
        self.evictions.lock().contains_key(id)
    }

    fn discovered(self: &Arc<Self>, id: NodeId) {
        self.catalog.lock().node_discovered(id);
        if let Some(timer) = self.evictions.lock().remove(&id) {
            timer.abort();
        }
        if self.config.rebalance_auto_expand {
            self.queue.push(RebalanceItem::NewPeer(id));
        }
    }

    fn disappeared(self: &Arc<Self>, id: NodeId) {
        if self.catalog.lock().node_disappeared(id) {
            self.schedule_eviction(id);
        }
    }

    fn schedule_eviction(self: &Arc<Self>, id: NodeId) {
        let timeout = Duration::from_millis(self.config.node_timeout_ms);
        debug!(node = %self.node_id, peer = %id, ?timeout,
               "peer disappeared, eviction armed");
        let weak = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(local) = weak.upgrade() else { return };
            warn!(node = %local.node_id, peer = %id,
                  "lost contact past the node timeout, evicting");
            local.evictions.lock().remove(&id);
            Box::pin(rebalancer::evict(&local, id)).await;
        });
        if let Some(old) = self.evictions.lock().insert(id, timer) {
            old.abort();
        }
    }

    /// Resolves a silo key into either a decision state machine (cached
    /// and shared) or a raw immutable block. `create` supplies the
    /// quorum for a decision that may not exist yet (insert semantics).
    pub(crate) async fn load(
        &self,
        address: Address,
        create: Option<Quorum>,
    ) -> Result<Loaded, Error> {
        let mut cache = self.decisions.lock().await;
        if let Some(entry) = cache.get(&address) {
            return Ok(Loaded::Decision(entry));
        }
        match self.silo.get(address).await {
            Ok(bytes) => match persistence::decode(&self.context(), &bytes)? {
                SiloEntry::Block(block) => {
                    drop(cache);
                    self.note_immutable(address).await;
                    Ok(Loaded::Block(block))
                },
                SiloEntry::Decision(record) => {
                    trace!(node = %self.node_id, %address,
                           "reloaded decision from storage");
                    let server =
                        PaxosServer::from_state(self.node_id, record.state);
                    Ok(Loaded::Decision(
                        self.index_decision(&mut cache, address, server),
                    ))
                },
            },
            Err(torus_silo::SiloError::MissingKey(_)) => match create {
                Some(quorum) => {
                    trace!(node = %self.node_id, %address,
                           "creating decision state");
                    let server = PaxosServer::new(self.node_id, quorum);
                    Ok(Loaded::Decision(
                        self.index_decision(&mut cache, address, server),
                    ))
                },
                None => Err(Error::MissingBlock(address)),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Caches a decision and mirrors its quorum into the catalog,
    /// scheduling expansion when it is under-replicated.
    fn index_decision(
        &self,
        cache: &mut DecisionCache,
        address: Address,
        server: PaxosServer,
    ) -> Arc<AsyncMutex<PaxosServer>> {
        let quorum = server.quorum().clone();
        let has_value = server.has_value();
        self.catalog.lock().cache(address, false, quorum.clone());
        if self.config.rebalance_auto_expand
            && has_value
            && quorum.len() < self.config.replication_factor
        {
            self.schedule_block(address);
        }
        let entry = Arc::new(AsyncMutex::new(server));
        cache.insert(address, entry.clone());
        entry
    }

    /// First sighting of an immutable block: record who should hold it
    /// and queue expansion if the overlay cannot name enough owners.
    async fn note_immutable(&self, address: Address) {
        if self.catalog.lock().repartition(&address).is_some() {
            return;
        }
        if !self.config.rebalance_auto_expand {
            return;
        }
        let Ok(overlay) = self.overlay() else { return };
        let quorum: Quorum = overlay
            .lookup(address, self.config.replication_factor)
            .await
            .iter()
            .filter_map(|weak| weak.upgrade())
            .map(|peer| peer.id())
            .collect();
        let undersized = quorum.len() < self.config.replication_factor;
        self.catalog.lock().cache(address, true, quorum);
        if undersized {
            self.schedule_block(address);
        }
    }

    pub(crate) async fn persist(
        &self,
        address: Address,
        server: &PaxosServer,
    ) -> Result<(), Error> {
        let entry =
            SiloEntry::Decision(DecisionRecord::new(server.state().clone()));
        let bytes = persistence::encode(&self.context(), &entry)?;
        self.silo.set(address, bytes, true, true).await?;
        Ok(())
    }

    /// Erases one address everywhere: silo, decision cache, catalog.
    pub(crate) async fn remove_local(
        &self,
        address: Address,
    ) -> Result<(), Error> {
        self.silo.erase(address).await?;
        self.decisions.lock().await.remove(&address);
        self.catalog.lock().remove(address);
        Ok(())
    }

    /// Unloads a decision nothing is using; a no-op while any operation
    /// shares it.
    pub(crate) async fn drop_idle_decision(&self, address: Address) {
        self.decisions.lock().await.drop_if_idle(&address);
    }

    /// Resolves every member of `quorum` into a client peer. Members
    /// the overlay cannot find stay in the set as unresolved handles so
    /// the majority is still computed over the full quorum.
    pub(crate) async fn lookup_client_peers(
        &self,
        quorum: &Quorum,
    ) -> Result<Vec<ClientPeer>, Error> {
        let overlay = self.overlay()?;
        let mut found = overlay.lookup_nodes(quorum).await;
        Ok(quorum
            .iter()
            .map(|id| match found.remove(id) {
                Some(weak) => ClientPeer::new(*id, weak),
                None => ClientPeer::unresolved(*id),
            })
            .collect())
    }

    pub(crate) fn client(
        &self,
        address: Address,
        peers: Vec<ClientPeer>,
    ) -> PaxosClient {
        PaxosClient::new(self.node_id, address, peers, false, self.protocol)
    }

    async fn expect_decision(
        &self,
        address: Address,
        create: Option<Quorum>,
    ) -> Result<Arc<AsyncMutex<PaxosServer>>, Error> {
        match self.load(address, create).await? {
            Loaded::Decision(entry) => Ok(entry),
            Loaded::Block(_) => Err(Error::ProtocolViolation(format!(
                "immutable block at {} where a decision was expected",
                address
            ))),
        }
    }
}

#[async_trait]
impl Peer for LocalPeer {
    fn id(&self) -> NodeId {
        self.node_id
    }

    async fn propose(
        &self,
        quorum: &Quorum,
        address: Address,
        proposal: Proposal,
        insert: bool,
    ) -> Result<PromiseResponse, Error> {
        trace!(node = %self.node_id, %address, %proposal, insert, "propose");
        if !address.is_mutable() {
            return Err(Error::ProtocolViolation(format!(
                "consensus propose on immutable address {}",
                address
            )));
        }
        let entry = self
            .expect_decision(address, insert.then(|| quorum.clone()))
            .await?;
        let mut server = entry.lock().await;
        let response = server.propose(quorum, proposal)?;
        self.persist(address, &server).await?;
        Ok(response)
    }

    async fn accept(
        &self,
        quorum: &Quorum,
        address: Address,
        proposal: Proposal,
        value: Value,
    ) -> Result<Proposal, Error> {
        trace!(node = %self.node_id, %address, %proposal, "accept");
        let entry = self.expect_decision(address, None).await?;
        let mut server = entry.lock().await;
        if let Value::Block(block) = &value {
            if block.address() != address {
                return Err(Error::ProtocolViolation(format!(
                    "block addressed {} accepted at {}",
                    block.address(),
                    address
                )));
            }
            block.validate()?;
            if let Some(previous) =
                server.current_value().and_then(|a| a.value.as_block())
            {
                block.validate_against(previous)?;
            }
        }
        let highest = server.accept(quorum, proposal, value)?;
        self.persist(address, &server).await?;
        Ok(highest)
    }

    async fn confirm(
        &self,
        quorum: &Quorum,
        address: Address,
        proposal: Proposal,
    ) -> Result<(), Error> {
        trace!(node = %self.node_id, %address, %proposal, "confirm");
        if !address.is_mutable() {
            // Membership confirmation for directly replicated storage.
            let undersized =
                quorum.len() < self.config.replication_factor;
            self.catalog.lock().cache(address, true, quorum.clone());
            if self.config.rebalance_auto_expand && undersized {
                self.schedule_block(address);
            }
            return Ok(());
        }
        let entry = self.expect_decision(address, None).await?;
        let mut server = entry.lock().await;
        let had_value = server.has_value();
        let elected = server.confirm(quorum, proposal)?;
        self.persist(address, &server).await?;
        let applied = match elected {
            Some(quorum) => Some(quorum),
            // A confirmation on a decision that never held a value
            // settles its membership too.
            None if !had_value => Some(server.quorum().clone()),
            None => None,
        };
        let has_value = server.has_value();
        drop(server);
        if let Some(applied) = applied {
            if !applied.contains(&self.node_id) {
                debug!(node = %self.node_id, %address,
                       "evicted from quorum, dropping local state");
                self.remove_local(address).await?;
            } else {
                let undersized =
                    applied.len() < self.config.replication_factor;
                self.catalog.lock().cache(address, false, applied);
                if self.config.rebalance_auto_expand
                    && has_value
                    && undersized
                {
                    self.schedule_block(address);
                }
            }
        }
        Ok(())
    }

    async fn get(
        &self,
        quorum: &Quorum,
        address: Address,
        local_version: Option<u64>,
    ) -> Result<Option<GetResponse>, Error> {
        trace!(node = %self.node_id, %address, "get");
        let entry = self.expect_decision(address, None).await?;
        let server = entry.lock().await;
        server.get(quorum, local_version)
    }

    async fn store(&self, block: Block, mode: StoreMode) -> Result<(), Error> {
        let address = block.address();
        trace!(node = %self.node_id, %address, ?mode, "store");
        if block.is_mutable() {
            return Err(Error::ValidationFailed(
                "bypassing consensus for a mutable block".into(),
            ));
        }
        block.validate()?;
        match self.silo.get(address).await {
            Ok(bytes) => {
                match persistence::decode(&self.context(), &bytes)? {
                    SiloEntry::Decision(_) => {
                        return Err(Error::ValidationFailed(format!(
                            "immutable store over consensus state at {}",
                            address
                        )))
                    },
                    SiloEntry::Block(previous) => {
                        block.validate_against(&previous)?;
                        // Re-inserting identical content is a no-op.
                        if mode == StoreMode::Insert {
                            return Ok(());
                        }
                    },
                }
            },
            Err(torus_silo::SiloError::MissingKey(_)) => {},
            Err(e) => return Err(e.into()),
        }
        let bytes = persistence::encode(
            &self.context(),
            &SiloEntry::Block(block),
        )?;
        self.silo
            .set(
                address,
                bytes,
                mode == StoreMode::Insert,
                mode == StoreMode::Update,
            )
            .await?;
        Ok(())
    }

    async fn fetch(
        &self,
        address: Address,
        _local_version: Option<u64>,
    ) -> Result<Option<Block>, Error> {
        trace!(node = %self.node_id, %address, "fetch");
        let bytes = self.silo.get(address).await?;
        match persistence::decode(&self.context(), &bytes)? {
            SiloEntry::Block(block) => Ok(Some(block)),
            SiloEntry::Decision(_) => Err(Error::ProtocolViolation(format!(
                "direct fetch of consensus-managed block {}",
                address
            ))),
        }
    }

    async fn remove(
        &self,
        address: Address,
        signature: RemoveSignature,
    ) -> Result<(), Error> {
        trace!(node = %self.node_id, %address, "remove");
        match self.load(address, None).await? {
            Loaded::Block(block) => block.validate_remove(&signature)?,
            Loaded::Decision(entry) => {
                let server = entry.lock().await;
                match server.current_value().and_then(|a| a.value.as_block())
                {
                    Some(block) => block.validate_remove(&signature)?,
                    None => warn!(
                        node = %self.node_id, %address,
                        "no accepted value, removal cannot be validated"
                    ),
                }
            },
        }
        self.remove_local(address).await
    }

    async fn reconcile(&self, address: Address) -> Result<bool, Error> {
        trace!(node = %self.node_id, %address, "reconcile");
        if !address.is_mutable() {
            warn!(node = %self.node_id, %address,
                  "reconcile called on an immutable block");
            return Ok(false);
        }
        let entry = match self.load(address, None).await {
            Ok(Loaded::Decision(entry)) => entry,
            // Nothing local to drop.
            Ok(Loaded::Block(_)) | Err(Error::MissingBlock(_)) => {
                return Ok(false)
            },
            Err(e) => return Err(e),
        };
        let quorum = entry.lock().await.quorum().clone();
        let peers = self.lookup_client_peers(&quorum).await?;
        let mut client = self.client(address, peers);
        match client.state().await {
            Err(Error::MissingBlock(_)) => {
                debug!(node = %self.node_id, %address,
                       "cluster dropped the block, removing trailing state");
                match self.remove_local(address).await {
                    Ok(()) | Err(Error::MissingBlock(_)) => Ok(true),
                    Err(e) => Err(e),
                }
            },
            _ => Ok(false),
        }
    }

    async fn propagate(
        &self,
        quorum: &Quorum,
        block: Block,
        proposal: Proposal,
    ) -> Result<(), Error> {
        let address = block.address();
        if !block.is_mutable() {
            return Err(Error::ProtocolViolation(format!(
                "propagate of immutable block {}",
                address
            )));
        }
        block.validate()?;
        let entry =
            self.expect_decision(address, Some(quorum.clone())).await?;
        let mut server = entry.lock().await;
        if server.latest_decree().is_some() {
            trace!(node = %self.node_id, %address, "already propagated");
            return Ok(());
        }
        debug!(node = %self.node_id, %address, %proposal, "propagate");
        server.install(quorum, block, proposal)?;
        self.persist(address, &server).await?;
        let installed = server.quorum().clone();
        drop(server);
        self.catalog.lock().cache(address, false, installed);
        Ok(())
    }
}
