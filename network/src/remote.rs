// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

//! RPC stub implementing [`Peer`] over an established [`Connection`].
//!
//! Error remapping contract: transport failures surface as
//! `Unavailable`; a remote `MissingBlock` raised during a propose or a
//! fetch surfaces as `WeakError` so Paxos may proceed with the peers
//! that still hold the block.

use crate::{peer::Peer, transport::Connection, wire::{RpcRequest, RpcResponse}};
use async_trait::async_trait;
use torus_types::{
    Address, Block, Error, GetResponse, NodeId, PromiseResponse, Proposal,
    ProtocolVersion, Quorum, RemoveSignature, StoreMode, Value,
};

pub struct RemotePeer {
    connection: Connection,
}

impl RemotePeer {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.connection.protocol()
    }
}

fn unexpected(response: RpcResponse) -> Error {
    Error::Serialization(format!("unexpected response {:?}", response))
}

#[async_trait]
impl Peer for RemotePeer {
    fn id(&self) -> NodeId {
        self.connection.peer_id()
    }

    async fn propose(
        &self,
        quorum: &Quorum,
        address: Address,
        proposal: Proposal,
        insert: bool,
    ) -> Result<PromiseResponse, Error> {
        // Below 0.9 the flag does not exist and propose always inserts.
        let insert = insert || !self.protocol().insert_flag();
        let request = RpcRequest::Propose {
            quorum: quorum.clone(),
            address,
            proposal,
            insert,
        };
        match self.connection.call(request).await {
            Ok(RpcResponse::Promise(promise)) => Ok(promise),
            Ok(other) => Err(unexpected(other)),
            Err(e @ Error::MissingBlock(_)) => Err(Error::weak(e)),
            Err(e) => Err(e),
        }
    }

    async fn accept(
        &self,
        quorum: &Quorum,
        address: Address,
        proposal: Proposal,
        value: Value,
    ) -> Result<Proposal, Error> {
        if value.as_quorum().is_some() && !self.protocol().quorum_values() {
            // The peer predates membership changes; treat it as absent
            // rather than feed it a value it cannot decode.
            return Err(Error::Unavailable(format!(
                "peer {} speaks {} which cannot accept quorum values",
                self.id(),
                self.protocol()
            )));
        }
        let request = RpcRequest::Accept {
            quorum: quorum.clone(),
            address,
            proposal,
            value,
        };
        match self.connection.call(request).await {
            Ok(RpcResponse::Proposal(highest)) => Ok(highest),
            Ok(other) => Err(unexpected(other)),
            Err(e) => Err(e),
        }
    }

    async fn confirm(
        &self,
        quorum: &Quorum,
        address: Address,
        proposal: Proposal,
    ) -> Result<(), Error> {
        let request =
            RpcRequest::Confirm { quorum: quorum.clone(), address, proposal };
        match self.connection.call(request).await {
            Ok(RpcResponse::Unit) => Ok(()),
            Ok(other) => Err(unexpected(other)),
            Err(e) => Err(e),
        }
    }

    async fn get(
        &self,
        quorum: &Quorum,
        address: Address,
        local_version: Option<u64>,
    ) -> Result<Option<GetResponse>, Error> {
        let request = RpcRequest::Get {
            quorum: quorum.clone(),
            address,
            local_version,
        };
        match self.connection.call(request).await {
            Ok(RpcResponse::Get(record)) => Ok(record),
            Ok(other) => Err(unexpected(other)),
            Err(e) => Err(e),
        }
    }

    async fn store(&self, block: Block, mode: StoreMode) -> Result<(), Error> {
        match self.connection.call(RpcRequest::Store { block, mode }).await {
            Ok(RpcResponse::Unit) => Ok(()),
            Ok(other) => Err(unexpected(other)),
            Err(e) => Err(e),
        }
    }

    async fn fetch(
        &self,
        address: Address,
        local_version: Option<u64>,
    ) -> Result<Option<Block>, Error> {
        let request = RpcRequest::Fetch { address, local_version };
        match self.connection.call(request).await {
            Ok(RpcResponse::Block(block)) => Ok(block),
            Ok(other) => Err(unexpected(other)),
            Err(e @ Error::MissingBlock(_)) => Err(Error::weak(e)),
            Err(e) => Err(e),
        }
    }

    async fn remove(
        &self,
        address: Address,
        signature: RemoveSignature,
    ) -> Result<(), Error> {
        match self
            .connection
            .call(RpcRequest::Remove { address, signature })
            .await
        {
            Ok(RpcResponse::Unit) => Ok(()),
            Ok(other) => Err(unexpected(other)),
            Err(e) => Err(e),
        }
    }

    async fn reconcile(&self, address: Address) -> Result<bool, Error> {
        match self.connection.call(RpcRequest::Reconcile { address }).await {
            Ok(RpcResponse::Reconciled(removed)) => Ok(removed),
            Ok(other) => Err(unexpected(other)),
            Err(e) => Err(e),
        }
    }

    async fn propagate(
        &self,
        quorum: &Quorum,
        block: Block,
        proposal: Proposal,
    ) -> Result<(), Error> {
        if !self.protocol().propagate_rpc() {
            return Err(Error::UnknownRpc("propagate".into()));
        }
        let request = RpcRequest::Propagate {
            quorum: quorum.clone(),
            block,
            proposal,
        };
        match self.connection.call(request).await {
            Ok(RpcResponse::Unit) => Ok(()),
            Ok(other) => Err(unexpected(other)),
            Err(e) => Err(e),
        }
    }
}
