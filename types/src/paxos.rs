// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

//! Paxos wire vocabulary: proposals, values, accepted records.

use crate::{address::NodeId, block::Block};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt};

/// The ordered set of node ids currently responsible for a block.
pub type Quorum = BTreeSet<NodeId>;

/// A Paxos proposal. Field order matters: proposals are compared
/// lexicographically by (version, round, proposer).
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Proposal {
    pub version: u64,
    pub round: u64,
    pub proposer: NodeId,
}

impl Proposal {
    pub fn new(version: u64, round: u64, proposer: NodeId) -> Self {
        Self { version, round, proposer }
    }

    /// The proposal broadcast alongside immutable-block confirmations,
    /// which carry no Paxos decree.
    pub fn empty() -> Self {
        Self { version: 0, round: 0, proposer: NodeId::ZERO }
    }
}

impl fmt::Display for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.version, self.round, self.proposer)
    }
}

impl fmt::Debug for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Proposal({})", self)
    }
}

/// A Paxos payload: either a block value or a membership change. Electing
/// quorums through the same decree slot as data writes is what linearizes
/// membership changes with updates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Block(Block),
    Quorum(Quorum),
}

impl Value {
    pub fn as_block(&self) -> Option<&Block> {
        match self {
            Value::Block(block) => Some(block),
            Value::Quorum(_) => None,
        }
    }

    pub fn as_quorum(&self) -> Option<&Quorum> {
        match self {
            Value::Block(_) => None,
            Value::Quorum(quorum) => Some(quorum),
        }
    }
}

impl From<Block> for Value {
    fn from(block: Block) -> Self {
        Value::Block(block)
    }
}

impl From<Quorum> for Value {
    fn from(quorum: Quorum) -> Self {
        Value::Quorum(quorum)
    }
}

/// A value accepted by an acceptor, possibly confirmed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Accepted {
    pub proposal: Proposal,
    pub value: Value,
    pub confirmed: bool,
}

/// Reply to a propose.
///
/// `previous` is the highest decree the acceptor has seen, confirmed or
/// not; it is what keeps proposers safe and version-monotonic. `value`
/// is the latest *confirmed block* decree, which may be older than
/// `previous` when the most recent decree elected a quorum.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromiseResponse {
    pub previous: Option<Accepted>,
    pub value: Option<Accepted>,
}

impl PromiseResponse {
    /// Whether the acceptor already persisted a block value.
    pub fn value_present(&self) -> bool {
        self.value.is_some()
    }
}

/// Reply to a get: the accepted record, with the block body elided when
/// the caller's local version is already current.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetResponse {
    pub proposal: Proposal,
    pub confirmed: bool,
    pub value: Option<Value>,
}
