// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use torus_types::{
    Address, Block, Error, GetResponse, NodeId, PromiseResponse, Proposal,
    Quorum, RemoveSignature, StoreMode, Value,
};

/// A node holding blocks, local or remote. This is the complete
/// capability set of a peer; both the in-process server and the RPC stub
/// implement it, so consensus code never cares which one it talks to.
#[async_trait]
pub trait Peer: Send + Sync + 'static {
    fn id(&self) -> NodeId;

    /// Paxos phase 1: ask the acceptor for a promise on `proposal`.
    /// With `insert`, a missing decision is created over `quorum`.
    async fn propose(
        &self,
        quorum: &Quorum,
        address: Address,
        proposal: Proposal,
        insert: bool,
    ) -> Result<PromiseResponse, Error>;

    /// Paxos phase 2. Returns the highest proposal the acceptor has seen;
    /// a value greater than `proposal` means the decree was lost.
    async fn accept(
        &self,
        quorum: &Quorum,
        address: Address,
        proposal: Proposal,
        value: Value,
    ) -> Result<Proposal, Error>;

    /// Finalizes the value accepted at `proposal`.
    async fn confirm(
        &self,
        quorum: &Quorum,
        address: Address,
        proposal: Proposal,
    ) -> Result<(), Error>;

    /// Reads the accepted record, eliding the block body when its version
    /// equals `local_version`.
    async fn get(
        &self,
        quorum: &Quorum,
        address: Address,
        local_version: Option<u64>,
    ) -> Result<Option<GetResponse>, Error>;

    /// Direct storage of an immutable block, bypassing Paxos.
    async fn store(&self, block: Block, mode: StoreMode) -> Result<(), Error>;

    /// Reads a block. `None` means the peer holds exactly `local_version`.
    async fn fetch(
        &self,
        address: Address,
        local_version: Option<u64>,
    ) -> Result<Option<Block>, Error>;

    /// Removes a block after validating `signature` against the last
    /// value the peer accepted.
    async fn remove(
        &self,
        address: Address,
        signature: RemoveSignature,
    ) -> Result<(), Error>;

    /// Asks the peer to recheck an address the caller believes absent
    /// from its quorum, dropping it if the cluster agrees. Returns
    /// whether the peer dropped local state.
    async fn reconcile(&self, address: Address) -> Result<bool, Error>;

    /// Seeds a block into a fresh quorum member without running Paxos
    /// rounds: the receiver installs `quorum` and synthesizes the decree
    /// at `proposal` locally.
    async fn propagate(
        &self,
        quorum: &Quorum,
        block: Block,
        proposal: Proposal,
    ) -> Result<(), Error>;
}
