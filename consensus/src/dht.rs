// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

//! The public face of the store: `store`, `fetch` and `remove` over the
//! DHT, plus operator-driven rebalancing and placement inspection.
//! Immutable blocks take the direct-replication path; mutable blocks go
//! through Paxos.

use crate::{
    local_peer::LocalPeer,
    paxos::client::{ClientPeer, PaxosClient},
    rebalancer::{self, QuorumPlan},
};
use ed25519_dalek::Keypair;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::{collections::HashMap, sync::Arc};
use torus_overlay::{Overlay, WeakPeer};
use torus_types::{
    Address, Block, Error, NodeId, Proposal, Quorum, RemoveSignature,
    StoreMode, Value,
};
use tracing::{debug, trace};

const FANOUT: usize = 10;

/// Merges a losing write with the value the cluster chose instead.
/// Returning `None` abandons the write and surfaces the conflict.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, local: &Block, remote: &Block) -> Option<Block>;
}

impl<F> ConflictResolver for F
where
    F: Fn(&Block, &Block) -> Option<Block> + Send + Sync,
{
    fn resolve(&self, local: &Block, remote: &Block) -> Option<Block> {
        self(local, remote)
    }
}

/// Placement report for one address.
#[derive(Clone, Debug)]
pub struct BlockStatus {
    pub address: Address,
    pub quorum: Quorum,
    pub proposal: Option<Proposal>,
}

pub struct Dht {
    local: Arc<LocalPeer>,
    overlay: Arc<dyn Overlay>,
    keypair: Arc<Keypair>,
    transfers: Mutex<HashMap<NodeId, usize>>,
}

impl Dht {
    /// Wires a local peer to its overlay and starts the background
    /// machinery.
    pub fn new(
        local: Arc<LocalPeer>,
        overlay: Arc<dyn Overlay>,
        keypair: Arc<Keypair>,
    ) -> Self {
        local.start(overlay.clone());
        Self { local, overlay, keypair, transfers: Mutex::new(HashMap::new()) }
    }

    pub fn id(&self) -> NodeId {
        self.local.id()
    }

    pub fn local(&self) -> &Arc<LocalPeer> {
        &self.local
    }

    /// Resigns owned blocks to the rest of the cluster and stops every
    /// background task.
    pub async fn shutdown(&self) {
        self.local.shutdown().await;
    }

    /// Stores a block on its quorum. Mutable conflicts are folded
    /// through `resolver` when one is given.
    pub async fn store(
        &self,
        block: Block,
        mode: StoreMode,
        resolver: Option<&dyn ConflictResolver>,
    ) -> Result<(), Error> {
        let address = block.address();
        debug!(node = %self.id(), %address, ?mode, "store");
        let factor = self.local.config().replication_factor;
        let owners = match mode {
            StoreMode::Insert => self.overlay.allocate(address, factor).await,
            StoreMode::Update => self.overlay.lookup(address, factor).await,
        };
        let peers = to_client_peers(owners);
        if peers.is_empty() {
            return Err(Error::NoPeersAvailable(address));
        }
        if block.is_mutable() {
            self.store_mutable(block, mode, peers, resolver).await
        } else {
            let reached = rebalancer::send_immutable_block(
                self.local.protocol(),
                peers,
                &block,
                Quorum::new(),
            )
            .await?;
            if reached == 0 {
                return Err(Error::NoPeersAvailable(address));
            }
            Ok(())
        }
    }

    async fn store_mutable(
        &self,
        mut block: Block,
        mode: StoreMode,
        peers: Vec<ClientPeer>,
        resolver: Option<&dyn ConflictResolver>,
    ) -> Result<(), Error> {
        let address = block.address();
        let mut client = PaxosClient::new(
            self.id(),
            address,
            peers,
            mode == StoreMode::Insert,
            self.local.protocol(),
        );
        loop {
            let version = block.version();
            match client.choose(version, Value::Block(block.clone())).await {
                Ok(None) => return Ok(()),
                Ok(Some(chosen)) => {
                    let next = chosen.proposal.version + 1;
                    match chosen.value {
                        Value::Quorum(elected) => {
                            // Rebalancing beat us to this version; retry
                            // the write past it against the elected
                            // membership.
                            debug!(%address, "another quorum was elected");
                            block.hint_version(next);
                            block.seal(&self.keypair);
                            self.swap_peers(&mut client, &elected).await?;
                        },
                        Value::Block(theirs) => {
                            if theirs == block {
                                // Our bytes won through another proposer.
                                return Ok(());
                            }
                            let Some(resolver) = resolver else {
                                return Err(conflict(theirs));
                            };
                            trace!(%address, "running conflict resolution");
                            let Some(mut merged) =
                                resolver.resolve(&block, &theirs)
                            else {
                                return Err(conflict(theirs));
                            };
                            merged.hint_version(next);
                            merged.seal(&self.keypair);
                            block = merged;
                        },
                    }
                },
                Err(Error::WrongQuorum { expected, .. }) => {
                    self.swap_peers(&mut client, &expected).await?;
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn swap_peers(
        &self,
        client: &mut PaxosClient,
        quorum: &Quorum,
    ) -> Result<(), Error> {
        let peers = self.local.lookup_client_peers(quorum).await?;
        if peers.is_empty() {
            return Err(Error::TooFewPeers { reached: 0, total: quorum.len() });
        }
        client.replace_peers(peers);
        Ok(())
    }

    /// Fetches a block. Returns `None` when the cluster's latest version
    /// equals `local_version`.
    pub async fn fetch(
        &self,
        address: Address,
        local_version: Option<u64>,
    ) -> Result<Option<Block>, Error> {
        trace!(node = %self.id(), %address, "fetch");
        if address.is_mutable() {
            self.fetch_mutable(address, local_version).await
        } else {
            self.fetch_immutable(address, local_version).await
        }
    }

    async fn fetch_mutable(
        &self,
        address: Address,
        local_version: Option<u64>,
    ) -> Result<Option<Block>, Error> {
        let factor = self.local.config().replication_factor;
        let peers = to_client_peers(self.overlay.lookup(address, factor).await);
        if peers.is_empty() {
            return Err(Error::MissingBlock(address));
        }
        if let Some(version) = local_version {
            // Cheap probe first: if a majority agrees our version is
            // current, skip moving the block at all.
            if self.probe_current(address, version, &peers).await {
                return Ok(None);
            }
        }
        let mut client = PaxosClient::new(
            self.id(),
            address,
            peers,
            false,
            self.local.protocol(),
        );
        loop {
            match client.state().await {
                Ok(state) => {
                    let (Some(proposal), Some(mut block)) =
                        (state.proposal, state.value)
                    else {
                        return Err(Error::MissingBlock(address));
                    };
                    if local_version == Some(block.version()) {
                        return Ok(None);
                    }
                    if proposal.version != block.version() {
                        // Make the next writer supersede the latest
                        // decree, not just the latest content.
                        block.hint_version(proposal.version + 1);
                    }
                    return Ok(Some(block));
                },
                Err(Error::WrongQuorum { expected, .. }) => {
                    self.swap_peers(&mut client, &expected).await?;
                },
                Err(e @ Error::MissingBlock(_)) => {
                    self.reconcile_survivors(address, &client).await;
                    return Err(e);
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Asks peers that still reference a majority-missing block to
    /// recheck and garbage-collect it.
    async fn reconcile_survivors(&self, address: Address, client: &PaxosClient) {
        let missing = client.last_missing().clone();
        let survivors: Vec<ClientPeer> = client
            .peers()
            .iter()
            .filter(|peer| !missing.contains(&peer.id))
            .cloned()
            .collect();
        let results: Vec<Result<bool, Error>> =
            stream::iter(survivors.into_iter().map(|peer| async move {
                match peer.lock() {
                    None => {
                        Err(Error::Unavailable("peer handle expired".into()))
                    },
                    Some(p) => p.reconcile(address).await,
                }
            }))
            .buffer_unordered(FANOUT)
            .collect()
            .await;
        for result in results {
            if let Err(e) = result {
                trace!(%address, error = %e, "reconcile failed");
            }
        }
    }

    /// Majority probe over `get` with the block elided: true when the
    /// caller's version is already the chosen one.
    async fn probe_current(
        &self,
        address: Address,
        version: u64,
        peers: &[ClientPeer],
    ) -> bool {
        let quorum: Quorum = peers.iter().map(|peer| peer.id).collect();
        let quorum = &quorum;
        let results: Vec<Option<(Proposal, bool)>> =
            stream::iter(peers.iter().map(|peer| {
                let peer = peer.clone();
                async move {
                    let record = match peer.lock() {
                        None => return None,
                        Some(p) => {
                            p.get(quorum, address, Some(version)).await.ok()?
                        },
                    };
                    record.map(|r| (r.proposal, r.confirmed && r.value.is_none()))
                }
            }))
            .buffer_unordered(FANOUT)
            .collect()
            .await;
        let majority = peers.len() / 2 + 1;
        let mut agreeing: HashMap<Proposal, usize> = HashMap::new();
        for result in results.into_iter().flatten() {
            if let (proposal, true) = result {
                *agreeing.entry(proposal).or_default() += 1;
            }
        }
        agreeing.values().any(|count| *count >= majority)
    }

    async fn fetch_immutable(
        &self,
        address: Address,
        local_version: Option<u64>,
    ) -> Result<Option<Block>, Error> {
        let factor = self.local.config().replication_factor;
        let mut peers =
            to_client_peers(self.overlay.lookup(address, factor).await);
        if peers.is_empty() {
            return Err(Error::MissingBlock(address));
        }
        if self.local.config().balanced_transfers && peers.len() > 1 {
            // Spread load: random tie-break, then fewest outstanding
            // transfers first.
            peers.shuffle(&mut rand::thread_rng());
            let transfers = self.transfers.lock();
            peers.sort_by_key(|peer| {
                transfers.get(&peer.id).copied().unwrap_or(0)
            });
        }
        for peer in peers {
            let Some(p) = peer.lock() else { continue };
            *self.transfers.lock().entry(peer.id).or_default() += 1;
            let result = p.fetch(address, local_version).await;
            if let Some(count) = self.transfers.lock().get_mut(&peer.id) {
                *count = count.saturating_sub(1);
            }
            match result {
                Ok(block) => return Ok(block),
                Err(e) => {
                    trace!(%address, peer = %peer.id, error = %e,
                           "fetch attempt failed")
                },
            }
        }
        Err(Error::MissingBlock(address))
    }

    /// Removes a block from its quorum. Each peer validates the
    /// signature against the last value it accepted.
    pub async fn remove(
        &self,
        address: Address,
        signature: RemoveSignature,
    ) -> Result<(), Error> {
        debug!(node = %self.id(), %address, "remove");
        let factor = self.local.config().replication_factor;
        let peers = to_client_peers(self.overlay.lookup(address, factor).await);
        if peers.is_empty() {
            return Err(Error::NoPeersAvailable(address));
        }
        let results: Vec<Result<(), Error>> =
            stream::iter(peers.into_iter().map(|peer| {
                let signature = signature.clone();
                async move {
                    match peer.lock() {
                        None => Err(Error::Unavailable(
                            "peer handle expired".into(),
                        )),
                        Some(p) => p.remove(address, signature).await,
                    }
                }
            }))
            .buffer_unordered(FANOUT)
            .collect()
            .await;
        let mut succeeded = false;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(()) => succeeded = true,
                // A rejected signature is a real answer, not churn.
                Err(
                    e @ (Error::ValidationFailed(_)
                    | Error::Conflict { .. }
                    | Error::ProtocolViolation(_)),
                ) => return Err(e),
                Err(e) => {
                    first_error.get_or_insert(e);
                },
            }
        }
        if succeeded {
            Ok(())
        } else {
            Err(first_error
                .unwrap_or_else(|| Error::NoPeersAvailable(address)))
        }
    }

    /// Operator-driven rebalancing of one address toward the replication
    /// factor. Returns whether membership changed.
    pub async fn rebalance(&self, address: Address) -> Result<bool, Error> {
        self.rebalance_with(address, QuorumPlan::Extend).await
    }

    /// Rebalances one address onto an explicit membership.
    pub async fn rebalance_to(
        &self,
        address: Address,
        quorum: Quorum,
    ) -> Result<bool, Error> {
        self.rebalance_with(address, QuorumPlan::Target(quorum)).await
    }

    async fn rebalance_with(
        &self,
        address: Address,
        plan: QuorumPlan,
    ) -> Result<bool, Error> {
        if !address.is_mutable() {
            // Immutable duplication runs on the background queue.
            self.local.schedule_block(address);
            return Ok(false);
        }
        let factor = self.local.config().replication_factor;
        let peers = to_client_peers(self.overlay.lookup(address, factor).await);
        if peers.is_empty() {
            return Err(Error::MissingBlock(address));
        }
        let mut client = self.local.client(address, peers);
        rebalancer::rebalance_mutable(&self.local, &mut client, address, plan)
            .await
    }

    /// Reports the quorum and latest proposal for one address.
    pub async fn stat(&self, address: Address) -> Result<BlockStatus, Error> {
        if let Some(repartition) =
            self.local.catalog().lock().repartition(&address)
        {
            return Ok(BlockStatus {
                address,
                quorum: repartition.quorum.clone(),
                proposal: None,
            });
        }
        if !address.is_mutable() {
            let factor = self.local.config().replication_factor;
            let quorum = to_client_peers(
                self.overlay.lookup(address, factor).await,
            )
            .into_iter()
            .map(|peer| peer.id)
            .collect();
            return Ok(BlockStatus { address, quorum, proposal: None });
        }
        let factor = self.local.config().replication_factor;
        let peers = to_client_peers(self.overlay.lookup(address, factor).await);
        if peers.is_empty() {
            return Err(Error::MissingBlock(address));
        }
        let mut client = self.local.client(address, peers);
        let state = rebalancer::latest(&self.local, &mut client, address).await?;
        Ok(BlockStatus {
            address,
            quorum: state.quorum,
            proposal: state.proposal,
        })
    }
}

fn conflict(current: Block) -> Error {
    Error::Conflict {
        reason: "another value was chosen".into(),
        current: Some(Box::new(current)),
    }
}

fn to_client_peers(handles: Vec<WeakPeer>) -> Vec<ClientPeer> {
    handles
        .into_iter()
        .filter_map(|weak| {
            weak.upgrade().map(|peer| ClientPeer::new(peer.id(), weak))
        })
        .collect()
}
