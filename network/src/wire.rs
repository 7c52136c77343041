// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

//! Wire envelope: the handshake and the request/response frames carrying
//! the nine peer RPCs. Frames are bcs-encoded and length-prefixed by the
//! transport codec.

use ed25519_dalek::{Keypair, PublicKey, Signature, Signer, Verifier};
use serde::{Deserialize, Serialize};
use torus_types::{
    Address, Block, Error, GetResponse, NodeId, PromiseResponse, Proposal,
    ProtocolVersion, Quorum, RemoveSignature, StoreMode, Value,
};

/// First frame of every connection, client to server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol: ProtocolVersion,
    pub node_id: NodeId,
    pub public_key: PublicKey,
    pub signature: Signature,
}

impl HandshakeRequest {
    pub fn new(identity: &Keypair, protocol: ProtocolVersion) -> Self {
        Self {
            protocol,
            node_id: NodeId::from_public_key(&identity.public),
            public_key: identity.public,
            signature: identity.sign(&session_signing_bytes(protocol)),
        }
    }

    /// Whether the handshake proves control of the claimed node id.
    pub fn authenticates(&self) -> bool {
        NodeId::from_public_key(&self.public_key) == self.node_id
            && self
                .public_key
                .verify(
                    &session_signing_bytes(self.protocol),
                    &self.signature,
                )
                .is_ok()
    }
}

/// Server reply: the negotiated version and the server identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub protocol: ProtocolVersion,
    pub node_id: NodeId,
}

fn session_signing_bytes(protocol: ProtocolVersion) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(18);
    bytes.extend_from_slice(b"torus:session");
    bytes.extend_from_slice(&protocol.major.to_le_bytes());
    bytes.extend_from_slice(&protocol.minor.to_le_bytes());
    bytes
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcRequest {
    Propose {
        quorum: Quorum,
        address: Address,
        proposal: Proposal,
        insert: bool,
    },
    Accept {
        quorum: Quorum,
        address: Address,
        proposal: Proposal,
        value: Value,
    },
    Confirm {
        quorum: Quorum,
        address: Address,
        proposal: Proposal,
    },
    Get {
        quorum: Quorum,
        address: Address,
        local_version: Option<u64>,
    },
    Store {
        block: Block,
        mode: StoreMode,
    },
    Fetch {
        address: Address,
        local_version: Option<u64>,
    },
    Remove {
        address: Address,
        signature: RemoveSignature,
    },
    Reconcile {
        address: Address,
    },
    Propagate {
        quorum: Quorum,
        block: Block,
        proposal: Proposal,
    },
}

impl RpcRequest {
    /// Method name, for dispatch errors and logs.
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::Propose { .. } => "propose",
            RpcRequest::Accept { .. } => "accept",
            RpcRequest::Confirm { .. } => "confirm",
            RpcRequest::Get { .. } => "get",
            RpcRequest::Store { .. } => "store",
            RpcRequest::Fetch { .. } => "fetch",
            RpcRequest::Remove { .. } => "remove",
            RpcRequest::Reconcile { .. } => "reconcile",
            RpcRequest::Propagate { .. } => "propagate",
        }
    }

    /// Whether this request mutates state and therefore requires an
    /// authenticated session.
    pub fn mutates(&self) -> bool {
        !matches!(
            self,
            RpcRequest::Confirm { .. }
                | RpcRequest::Get { .. }
                | RpcRequest::Fetch { .. }
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcResponse {
    Promise(PromiseResponse),
    Proposal(Proposal),
    Get(Option<GetResponse>),
    Block(Option<Block>),
    Reconciled(bool),
    Unit,
    Err(Error),
}

impl RpcResponse {
    pub fn into_result(self) -> Result<RpcResponse, Error> {
        match self {
            RpcResponse::Err(error) => Err(error),
            other => Ok(other),
        }
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    bcs::to_bytes(value).map_err(|e| Error::Serialization(e.to_string()))
}

pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, Error> {
    bcs::from_bytes(bytes).map_err(|e| Error::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn handshake_authentication() {
        let identity = Keypair::generate(&mut OsRng);
        let handshake =
            HandshakeRequest::new(&identity, ProtocolVersion::CURRENT);
        assert!(handshake.authenticates());

        // A claimed id that does not match the key is rejected.
        let mut forged = handshake.clone();
        forged.node_id = NodeId::random();
        assert!(!forged.authenticates());

        // A signature over another version is rejected.
        let mut replayed =
            HandshakeRequest::new(&identity, ProtocolVersion::V0_5);
        replayed.protocol = ProtocolVersion::CURRENT;
        assert!(!replayed.authenticates());
    }

    #[test]
    fn frames_round_trip() {
        let request = RpcRequest::Get {
            quorum: Quorum::new(),
            address: Address::random_mutable(),
            local_version: Some(3),
        };
        let bytes = encode(&request).unwrap();
        let decoded: RpcRequest = decode(&bytes).unwrap();
        assert_eq!(decoded.method(), "get");
        assert!(!decoded.mutates());
    }
}
