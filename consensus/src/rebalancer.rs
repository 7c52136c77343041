// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

//! Background replication upkeep: expanding under-replicated quorums to
//! new peers, evicting disappeared peers after the node timeout,
//! duplicating immutable blocks, resigning on shutdown and inspecting
//! the silo at startup.
//!
//! One loop per node drains a deduplicated queue of `(address | new
//! peer)` work items. Failures here are logged and rescheduled; they
//! never reach user operations.

use crate::{
    local_peer::{Loaded, LocalPeer},
    paxos::client::{ClientPeer, ClientState, PaxosClient},
};
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_retry::strategy::ExponentialBackoff;
use torus_types::{
    Address, Block, Error, NodeId, Proposal, ProtocolVersion, Quorum,
    StoreMode, Value,
};
use tracing::{debug, trace, warn};

const FANOUT: usize = 10;

/// Passes in a row the resignation loop tolerates without progress
/// before giving up; the node timeout of the surviving peers covers
/// whatever is left behind.
const MAX_STALLED_PASSES: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum RebalanceItem {
    Block(Address),
    NewPeer(NodeId),
}

/// The rebalancer work queue, deduplicated by item.
pub(crate) struct RebalanceQueue {
    tx: mpsc::UnboundedSender<RebalanceItem>,
    pending: Mutex<HashSet<RebalanceItem>>,
}

impl RebalanceQueue {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<RebalanceItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, pending: Mutex::new(HashSet::new()) }, rx)
    }

    pub(crate) fn push(&self, item: RebalanceItem) {
        if self.pending.lock().insert(item) {
            let _ = self.tx.send(item);
        }
    }

    pub(crate) fn take(&self, item: &RebalanceItem) {
        self.pending.lock().remove(item);
    }
}

/// The per-node rebalancer loop.
pub(crate) async fn run(
    local: Weak<LocalPeer>,
    mut rx: mpsc::UnboundedReceiver<RebalanceItem>,
) {
    while let Some(item) = rx.recv().await {
        let Some(local) = local.upgrade() else { break };
        local.queue().take(&item);
        if local.is_shutting_down() {
            break;
        }
        let result = match item {
            RebalanceItem::Block(address) => {
                rebalance_block(&local, address).await
            },
            RebalanceItem::NewPeer(id) => expand_to_peer(&local, id).await,
        };
        if let Err(e) = result {
            warn!(node = %local.id(), ?item, error = %e,
                  "rebalancing pass failed");
        }
    }
}

/// How a rebalancing attempt picks the next quorum from the current one.
pub(crate) enum QuorumPlan {
    /// Fill up to the replication factor from the overlay.
    Extend,
    /// Bring one specific peer in (discovery path).
    Add(NodeId),
    /// Take one peer out (resignation path).
    Remove(NodeId),
    /// Move to an explicit membership (operator path).
    Target(Quorum),
}

impl QuorumPlan {
    async fn apply(
        &self,
        local: &Arc<LocalPeer>,
        address: Address,
        current: &Quorum,
    ) -> Result<Quorum, Error> {
        let factor = local.config().replication_factor;
        Ok(match self {
            QuorumPlan::Extend => {
                extend_quorum(local, address, current).await?
            },
            QuorumPlan::Add(id) => {
                let mut quorum = current.clone();
                if quorum.len() < factor {
                    quorum.insert(*id);
                }
                quorum
            },
            QuorumPlan::Remove(id) => {
                let mut quorum = current.clone();
                quorum.remove(id);
                if quorum.is_empty() {
                    // Never resign the last replica away.
                    current.clone()
                } else {
                    quorum
                }
            },
            QuorumPlan::Target(quorum) => quorum.clone(),
        })
    }
}

async fn extend_quorum(
    local: &Arc<LocalPeer>,
    address: Address,
    current: &Quorum,
) -> Result<Quorum, Error> {
    let factor = local.config().replication_factor;
    let overlay = local.overlay()?;
    let mut quorum = current.clone();
    for handle in overlay.allocate(address, factor).await {
        if quorum.len() >= factor {
            break;
        }
        if let Some(peer) = handle.upgrade() {
            quorum.insert(peer.id());
        }
    }
    Ok(quorum)
}

/// Reads the latest cluster state, chasing `WrongQuorum` redirections.
pub(crate) async fn latest(
    local: &Arc<LocalPeer>,
    client: &mut PaxosClient,
    address: Address,
) -> Result<ClientState, Error> {
    loop {
        match client.state().await {
            Err(Error::WrongQuorum { expected, .. }) => {
                trace!(%address, "state redirected to fresher quorum");
                let peers = local.lookup_client_peers(&expected).await?;
                client.replace_peers(peers);
            },
            other => return other,
        }
    }
}

/// One queued block: expand a mutable quorum through Paxos, or
/// re-replicate an immutable block directly.
async fn rebalance_block(
    local: &Arc<LocalPeer>,
    address: Address,
) -> Result<(), Error> {
    debug!(node = %local.id(), %address, "rebalance");
    match local.load(address, None).await {
        // The block was deleted in the meantime.
        Err(Error::MissingBlock(_)) => Ok(()),
        Err(e) => Err(e),
        Ok(Loaded::Decision(entry)) => {
            let quorum = entry.lock().await.quorum().clone();
            let peers = local.lookup_client_peers(&quorum).await?;
            let mut client = local.client(address, peers);
            rebalance_mutable(local, &mut client, address, QuorumPlan::Extend)
                .await
                .map(|_| ())
        },
        Ok(Loaded::Block(block)) => {
            let Some(repartition) =
                local.catalog().lock().repartition(&address).cloned()
            else {
                return Ok(());
            };
            let current = repartition.quorum;
            let extended = extend_quorum(local, address, &current).await?;
            if extended == current {
                debug!(%address, "unable to find any new owner");
                return Ok(());
            }
            let peers = local.lookup_client_peers(&extended).await?;
            let sent = send_immutable_block(
                local.protocol(),
                peers,
                &block,
                current,
            )
            .await?;
            if sent > 0 {
                debug!(node = %local.id(), %address, "block re-replicated");
            }
            Ok(())
        },
    }
}

/// A peer was discovered: push every under-replicated block that does
/// not already include it onto the new member.
async fn expand_to_peer(
    local: &Arc<LocalPeer>,
    id: NodeId,
) -> Result<(), Error> {
    let factor = local.config().replication_factor;
    let targets = local.catalog().lock().expansion_targets(factor, &id);
    if targets.is_empty() {
        return Ok(());
    }
    debug!(node = %local.id(), peer = %id, blocks = targets.len(),
           "rebalancing to newly discovered peer");
    for (address, repartition) in targets {
        if !local.catalog().lock().is_live(&id) || local.eviction_armed(&id) {
            trace!(peer = %id, "peer disappeared, stop rebalancing to it");
            break;
        }
        let result = if repartition.immutable {
            expand_immutable(local, address, &repartition.quorum, id).await
        } else {
            expand_mutable(local, address, id).await
        };
        if let Err(e) = result {
            warn!(%address, error = %e, "rebalancing failed");
        }
    }
    Ok(())
}

async fn expand_immutable(
    local: &Arc<LocalPeer>,
    address: Address,
    current: &Quorum,
    id: NodeId,
) -> Result<(), Error> {
    let Loaded::Block(block) = local.load(address, None).await? else {
        return Err(Error::ProtocolViolation(format!(
            "decision state at immutable address {}",
            address
        )));
    };
    let mut extended = current.clone();
    extended.insert(id);
    let peers = local.lookup_client_peers(&extended).await?;
    let sent = send_immutable_block(
        local.protocol(),
        peers,
        &block,
        current.clone(),
    )
    .await?;
    if sent > 0 {
        debug!(node = %local.id(), %address, peer = %id,
               "block duplicated to new peer");
    }
    Ok(())
}

async fn expand_mutable(
    local: &Arc<LocalPeer>,
    address: Address,
    id: NodeId,
) -> Result<(), Error> {
    let Loaded::Decision(entry) = local.load(address, None).await? else {
        return Ok(());
    };
    let quorum = entry.lock().await.quorum().clone();
    if quorum.len() >= local.config().replication_factor
        || quorum.contains(&id)
    {
        return Ok(());
    }
    let peers = local.lookup_client_peers(&quorum).await?;
    let mut client = local.client(address, peers);
    rebalance_mutable(local, &mut client, address, QuorumPlan::Add(id))
        .await
        .map(|_| ())
}

/// Elects a new quorum for `address` through Paxos and seeds the value
/// into the fresh members. Returns whether membership changed.
pub(crate) async fn rebalance_mutable(
    local: &Arc<LocalPeer>,
    client: &mut PaxosClient,
    address: Address,
    plan: QuorumPlan,
) -> Result<bool, Error> {
    let factor = local.config().replication_factor;
    let state = latest(local, client, address).await?;
    if matches!(plan, QuorumPlan::Extend) && state.quorum.len() >= factor {
        trace!(%address, "block is already well balanced");
        return Ok(false);
    }
    let mut old_quorum = state.quorum.clone();
    let mut new_quorum = plan.apply(local, address, &old_quorum).await?;
    if new_quorum == old_quorum {
        return Ok(false);
    }
    let mut version = state.proposal.map_or(0, |p| p.version);
    loop {
        trace!(%address, ?new_quorum, version, "electing quorum");
        match client
            .choose(version + 1, Value::Quorum(new_quorum.clone()))
            .await
        {
            Ok(None) => {
                let proposal =
                    client.last_proposal().unwrap_or_else(Proposal::empty);
                debug!(node = %local.id(), %address,
                       replicas = new_quorum.len(),
                       "successfully rebalanced");
                propagate_value(
                    local, address, proposal, &old_quorum, &new_quorum,
                )
                .await;
                return Ok(true);
            },
            Ok(Some(chosen)) => match chosen.value {
                Value::Quorum(theirs) if theirs == new_quorum => {
                    trace!(%address, "conflicted into the quorum we picked");
                    propagate_value(
                        local,
                        address,
                        chosen.proposal,
                        &old_quorum,
                        &new_quorum,
                    )
                    .await;
                    return Ok(true);
                },
                Value::Quorum(theirs) => {
                    let candidate =
                        plan.apply(local, address, &theirs).await?;
                    if candidate == theirs {
                        trace!(%address,
                               "conflicted into a satisfying quorum");
                        propagate_value(
                            local,
                            address,
                            chosen.proposal,
                            &old_quorum,
                            &theirs,
                        )
                        .await;
                        return Ok(true);
                    }
                    version = chosen.proposal.version;
                    let peers = local.lookup_client_peers(&theirs).await?;
                    client.replace_peers(peers);
                    old_quorum = theirs;
                    new_quorum = candidate;
                },
                Value::Block(_) => {
                    // Someone wrote data while we rebalanced; try again
                    // past their version.
                    version = chosen.proposal.version;
                },
            },
            Err(Error::WrongQuorum { expected, .. }) => {
                let peers = local.lookup_client_peers(&expected).await?;
                client.replace_peers(peers);
                new_quorum = plan.apply(local, address, &expected).await?;
                if new_quorum == expected {
                    return Ok(!matches!(plan, QuorumPlan::Extend));
                }
                old_quorum = expected;
                let state = latest(local, client, address).await?;
                version = state.proposal.map_or(0, |p| p.version);
            },
            Err(e) => return Err(e),
        }
    }
}

/// Seeds the current block value into quorum members that were not part
/// of the previous membership, skipping the Paxos rounds.
async fn propagate_value(
    local: &Arc<LocalPeer>,
    address: Address,
    proposal: Proposal,
    old_quorum: &Quorum,
    new_quorum: &Quorum,
) {
    let Ok(Loaded::Decision(entry)) = local.load(address, None).await else {
        return;
    };
    let block = entry
        .lock()
        .await
        .current_value()
        .and_then(|a| a.value.as_block().cloned());
    let Some(block) = block else { return };
    let fresh: Quorum =
        new_quorum.difference(old_quorum).copied().collect();
    if fresh.is_empty() {
        return;
    }
    let peers = match local.lookup_client_peers(&fresh).await {
        Ok(peers) => peers,
        Err(e) => {
            warn!(%address, error = %e, "cannot resolve propagation targets");
            return;
        },
    };
    let results: Vec<(NodeId, Result<(), Error>)> =
        stream::iter(peers.into_iter().map(|peer| {
            let block = block.clone();
            let new_quorum = new_quorum.clone();
            async move {
                let result = match peer.lock() {
                    None => {
                        Err(Error::Unavailable("peer handle expired".into()))
                    },
                    Some(p) => {
                        p.propagate(&new_quorum, block, proposal).await
                    },
                };
                (peer.id, result)
            }
        }))
        .buffer_unordered(FANOUT)
        .collect()
        .await;
    for (id, result) in results {
        match result {
            Ok(()) => {
                trace!(%address, peer = %id, "value propagated")
            },
            // Peers predating the propagate RPC will catch up through a
            // regular fetch.
            Err(Error::UnknownRpc(_)) => {},
            Err(e) => {
                trace!(%address, peer = %id, error = %e,
                       "propagation failed")
            },
        }
    }
}

/// Stores an immutable block on every listed peer not already holding
/// it, then confirms the widened membership. Returns how many new peers
/// were reached; a weak error is surfaced only if nobody was.
pub(crate) async fn send_immutable_block(
    protocol: ProtocolVersion,
    peers: Vec<ClientPeer>,
    block: &Block,
    mut current: Quorum,
) -> Result<usize, Error> {
    let address = block.address();
    let (existing, candidates): (Vec<ClientPeer>, Vec<ClientPeer>) = peers
        .into_iter()
        .partition(|peer| current.contains(&peer.id));
    let results: Vec<(ClientPeer, Result<(), Error>)> =
        stream::iter(candidates.into_iter().map(|peer| {
            let block = block.clone();
            async move {
                let result = match peer.lock() {
                    None => {
                        Err(Error::Unavailable("peer handle expired".into()))
                    },
                    Some(p) => p.store(block, StoreMode::Insert).await,
                };
                (peer, result)
            }
        }))
        .buffer_unordered(FANOUT)
        .collect()
        .await;

    let mut reached = Vec::new();
    let mut weak_error = None;
    for (peer, result) in results {
        match result {
            Ok(()) => {
                current.insert(peer.id);
                reached.push(peer);
            },
            Err(Error::Unavailable(reason)) => {
                trace!(%address, peer = %peer.id, %reason,
                       "sending block failed");
            },
            Err(e @ Error::WeakError(_)) => {
                trace!(%address, peer = %peer.id, error = %e, "weak error");
                weak_error.get_or_insert(e);
            },
            Err(e) => return Err(e),
        }
    }
    if reached.is_empty() {
        return match weak_error {
            Some(e) => Err(e),
            None => Ok(0),
        };
    }
    if protocol.mandatory_confirm() {
        let confirmed = reached.len();
        let to_confirm: Vec<ClientPeer> =
            existing.into_iter().chain(reached.iter().cloned()).collect();
        let current = &current;
        let results: Vec<Result<(), Error>> =
            stream::iter(to_confirm.into_iter().map(|peer| async move {
                match peer.lock() {
                    None => {
                        Err(Error::Unavailable("peer handle expired".into()))
                    },
                    Some(p) => {
                        p.confirm(current, address, Proposal::empty()).await
                    },
                }
            }))
            .buffer_unordered(FANOUT)
            .collect()
            .await;
        for result in results {
            if let Err(e) = result {
                trace!(%address, error = %e, "confirming block failed");
            }
        }
        return Ok(confirmed);
    }
    Ok(reached.len())
}

/// Evicts a lost peer from every quorum it belonged to, contacting the
/// original membership of each block.
pub(crate) async fn evict(local: &Arc<LocalPeer>, lost: NodeId) {
    let blocks = local.catalog().lock().blocks_of(&lost);
    debug!(node = %local.id(), peer = %lost, blocks = blocks.len(),
           "evicting lost peer");
    for address in blocks {
        match local.load(address, None).await {
            Ok(Loaded::Decision(entry)) => {
                let mut quorum = entry.lock().await.quorum().clone();
                loop {
                    let mut target = quorum.clone();
                    if !target.remove(&lost) {
                        break;
                    }
                    let peers =
                        match local.lookup_client_peers(&quorum).await {
                            Ok(peers) => peers,
                            Err(e) => {
                                warn!(%address, error = %e,
                                      "eviction lookup failed");
                                break;
                            },
                        };
                    let mut client = local.client(address, peers);
                    let version = entry.lock().await.current_version();
                    match client
                        .choose(version + 1, Value::Quorum(target))
                        .await
                    {
                        Ok(_) => {
                            debug!(node = %local.id(), %address,
                                   peer = %lost, "evicted from quorum");
                            break;
                        },
                        Err(Error::WrongQuorum { expected, .. }) => {
                            quorum = expected;
                        },
                        Err(e) => {
                            trace!(%address, error = %e, "eviction failed");
                            break;
                        },
                    }
                }
            },
            Ok(Loaded::Block(_)) => {
                let repartition =
                    local.catalog().lock().repartition(&address).cloned();
                if let Some(repartition) = repartition {
                    let mut quorum = repartition.quorum;
                    if quorum.remove(&lost) {
                        let undersized = quorum.len()
                            < local.config().replication_factor;
                        local.catalog().lock().cache(address, true, quorum);
                        if undersized {
                            local.schedule_block(address);
                        }
                    }
                }
            },
            // Deleted in the meantime.
            Err(_) => {},
        }
    }
}

/// Rebalances the local node out of every mutable block it owns, with
/// exponential backoff between failed passes.
pub(crate) async fn resign(local: &Arc<LocalPeer>) {
    let config = local.config();
    let mut backoff =
        ExponentialBackoff::from_millis(config.resign_backoff_floor_ms)
            .max_delay(Duration::from_millis(config.resign_backoff_ceiling_ms));
    let mut stalled = 0usize;
    loop {
        let owned: Vec<Address> = local
            .catalog()
            .lock()
            .blocks_of(&local.id())
            .into_iter()
            .filter(|address| address.is_mutable())
            .collect();
        if owned.is_empty() {
            debug!(node = %local.id(), "resignation complete");
            return;
        }
        let mut progressed = false;
        for address in owned {
            trace!(node = %local.id(), %address, "resigning");
            match resign_block(local, address).await {
                Ok(true) | Err(Error::MissingBlock(_)) => progressed = true,
                Ok(false) => {},
                Err(e) => {
                    warn!(node = %local.id(), %address, error = %e,
                          "unable to resign")
                },
            }
        }
        if progressed {
            stalled = 0;
        } else {
            stalled += 1;
            if stalled >= MAX_STALLED_PASSES {
                warn!(node = %local.id(),
                      "resignation stalled, leaving eviction to peers");
                return;
            }
            let delay = backoff.next().unwrap_or(Duration::from_millis(
                config.resign_backoff_ceiling_ms,
            ));
            tokio::time::sleep(delay).await;
        }
    }
}

async fn resign_block(
    local: &Arc<LocalPeer>,
    address: Address,
) -> Result<bool, Error> {
    let Loaded::Decision(entry) = local.load(address, None).await? else {
        return Ok(false);
    };
    let quorum = entry.lock().await.quorum().clone();
    if !quorum.contains(&local.id()) {
        // Stale index entry; refresh it.
        local.catalog().lock().cache(address, false, quorum);
        return Ok(true);
    }
    let peers = local.lookup_client_peers(&quorum).await?;
    let mut client = local.client(address, peers);
    rebalance_mutable(
        local,
        &mut client,
        address,
        QuorumPlan::Remove(local.id()),
    )
    .await
}

/// Startup sweep over the silo: reload every decision, let loading queue
/// the under-replicated ones, and unload the healthy ones again.
pub(crate) async fn inspect(weak: Weak<LocalPeer>) {
    let (addresses, throttle) = {
        let Some(local) = weak.upgrade() else { return };
        let throttle = Duration::from_millis(
            local.config().rebalance_inspect_throttle_ms,
        );
        match local.silo().list().await {
            Ok(addresses) => (addresses, throttle),
            Err(e) => {
                warn!(node = %local.id(), error = %e,
                      "silo inspection failed");
                return;
            },
        }
    };
    for address in addresses {
        tokio::time::sleep(throttle).await;
        let Some(local) = weak.upgrade() else { return };
        if local.is_shutting_down() {
            return;
        }
        match local.load(address, None).await {
            Ok(Loaded::Decision(entry)) => {
                let satisfied = entry.lock().await.quorum().len()
                    >= local.config().replication_factor;
                drop(entry);
                if satisfied {
                    local.drop_idle_decision(address).await;
                } else {
                    debug!(node = %local.id(), %address,
                           "under-replicated on disk");
                }
            },
            // Immutable entries index themselves on load; deleted
            // entries are gone.
            Ok(Loaded::Block(_)) | Err(_) => {},
        }
    }
    debug!("startup inspection finished");
}
