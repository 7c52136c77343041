// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-address single-decree Paxos acceptor with a mutable quorum.
//!
//! The state machine is pure: persistence and validation wrap it in the
//! local peer. Two records are tracked per address: the latest decree
//! (`accepted`, confirmed or in flight, block or quorum) and the latest
//! confirmed *block* decree (`value`). Keeping both is what lets reads
//! return data across membership changes while writers still observe the
//! version floor set by a quorum election.

use serde::{Deserialize, Serialize};
use torus_types::{
    Accepted, Error, GetResponse, NodeId, PromiseResponse, Proposal, Quorum,
    Value,
};

/// The persisted face of an acceptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaxosServerState {
    pub quorum: Quorum,
    pub promised: Option<Proposal>,
    pub accepted: Option<Accepted>,
    pub value: Option<Accepted>,
}

pub struct PaxosServer {
    id: NodeId,
    state: PaxosServerState,
}

impl PaxosServer {
    pub fn new(id: NodeId, quorum: Quorum) -> Self {
        Self {
            id,
            state: PaxosServerState {
                quorum,
                promised: None,
                accepted: None,
                value: None,
            },
        }
    }

    pub fn from_state(id: NodeId, state: PaxosServerState) -> Self {
        Self { id, state }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn state(&self) -> &PaxosServerState {
        &self.state
    }

    pub fn quorum(&self) -> &Quorum {
        &self.state.quorum
    }

    /// The latest confirmed block decree.
    pub fn current_value(&self) -> Option<&Accepted> {
        match &self.state.accepted {
            Some(a) if a.confirmed && matches!(a.value, Value::Block(_)) => {
                Some(a)
            },
            _ => self.state.value.as_ref(),
        }
    }

    /// The highest decree known, block or quorum, confirmed or not.
    pub fn latest_decree(&self) -> Option<&Accepted> {
        self.state.accepted.as_ref().or(self.state.value.as_ref())
    }

    /// Version of the highest decree; new decrees must supersede it.
    pub fn current_version(&self) -> u64 {
        self.latest_decree().map_or(0, |a| a.proposal.version)
    }

    pub fn has_value(&self) -> bool {
        self.current_value().is_some()
    }

    fn check_quorum(&self, quorum: &Quorum) -> Result<(), Error> {
        if *quorum != self.state.quorum {
            return Err(Error::WrongQuorum {
                expected: self.state.quorum.clone(),
                proposal: self.state.accepted.as_ref().map(|a| a.proposal),
            });
        }
        Ok(())
    }

    /// Phase 1: promise not to accept anything below `proposal` and
    /// report the records the proposer must reckon with.
    pub fn propose(
        &mut self,
        quorum: &Quorum,
        proposal: Proposal,
    ) -> Result<PromiseResponse, Error> {
        self.check_quorum(quorum)?;
        if self.state.promised.map_or(true, |p| proposal > p) {
            self.state.promised = Some(proposal);
        }
        Ok(PromiseResponse {
            previous: self.latest_decree().cloned(),
            value: self.current_value().cloned(),
        })
    }

    /// Phase 2: accept `value` at `proposal` unless a higher promise was
    /// made. Returns the highest proposal seen; anything above the
    /// argument means the decree was refused.
    pub fn accept(
        &mut self,
        quorum: &Quorum,
        proposal: Proposal,
        value: Value,
    ) -> Result<Proposal, Error> {
        self.check_quorum(quorum)?;
        if let Some(promised) = self.state.promised {
            if proposal < promised {
                return Ok(promised);
            }
        }
        if let Some(previous) = self.state.accepted.take() {
            // A confirmed block decree superseded by a higher version
            // becomes the stored value; everything else is replaced.
            if previous.confirmed
                && proposal.version > previous.proposal.version
                && matches!(previous.value, Value::Block(_))
            {
                self.state.value = Some(previous);
            }
        }
        self.state.promised = Some(proposal);
        self.state.accepted =
            Some(Accepted { proposal, value, confirmed: false });
        Ok(proposal)
    }

    /// Phase 3: finalize the decree at `proposal`. Returns the quorum
    /// this confirmation put in charge, if the decree was a membership
    /// change.
    pub fn confirm(
        &mut self,
        quorum: &Quorum,
        proposal: Proposal,
    ) -> Result<Option<Quorum>, Error> {
        self.check_quorum(quorum)?;
        if let Some(accepted) = &mut self.state.accepted {
            if accepted.proposal == proposal && !accepted.confirmed {
                accepted.confirmed = true;
                if let Value::Quorum(new_quorum) = &accepted.value {
                    let new_quorum = new_quorum.clone();
                    self.state.quorum = new_quorum.clone();
                    return Ok(Some(new_quorum));
                }
            }
        }
        // Stale or repeated confirmations are harmless; the broadcast is
        // best-effort.
        Ok(None)
    }

    /// Read the latest decree, eliding the block body when the caller's
    /// `local_version` is already current.
    pub fn get(
        &self,
        quorum: &Quorum,
        local_version: Option<u64>,
    ) -> Result<Option<GetResponse>, Error> {
        self.check_quorum(quorum)?;
        let Some(accepted) = self.latest_decree() else {
            return Ok(None);
        };
        let value = match (&accepted.value, local_version) {
            (Value::Block(block), Some(version))
                if block.version() == version =>
            {
                None
            },
            (value, _) => Some(value.clone()),
        };
        Ok(Some(GetResponse {
            proposal: accepted.proposal,
            confirmed: accepted.confirmed,
            value,
        }))
    }

    /// Installs a propagated value: synthesizes the propose, accept and
    /// confirm of `block` at the sender's proposal without any network
    /// round.
    pub fn install(
        &mut self,
        quorum: &Quorum,
        block: torus_types::Block,
        proposal: Proposal,
    ) -> Result<(), Error> {
        self.propose(quorum, proposal)?;
        self.accept(quorum, proposal, Value::Block(block))?;
        self.confirm(quorum, proposal)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok, assert_some};
    use ed25519_dalek::Keypair;
    use rand::rngs::OsRng;
    use torus_types::{block::OwnerKeyedBlock, Block};

    fn quorum_of(ids: &[NodeId]) -> Quorum {
        ids.iter().copied().collect()
    }

    fn block(version: u64) -> Block {
        let owner = Keypair::generate(&mut OsRng);
        let mut block = OwnerKeyedBlock::new(&owner);
        block.set_payload(vec![version as u8]);
        block.seal_at(&owner, version);
        Block::OwnerKeyed(block)
    }

    fn proposal(version: u64, round: u64, node: NodeId) -> Proposal {
        Proposal::new(version, round, node)
    }

    #[test]
    fn promise_accept_confirm() {
        let node = NodeId::random();
        let quorum = quorum_of(&[node]);
        let mut server = PaxosServer::new(node, quorum.clone());

        let p = proposal(1, 0, node);
        let promise = server.propose(&quorum, p).unwrap();
        assert_eq!(promise.previous, None);
        assert!(!promise.value_present());

        let b = block(1);
        assert_eq!(
            server.accept(&quorum, p, Value::Block(b.clone())).unwrap(),
            p
        );
        assert_eq!(server.confirm(&quorum, p).unwrap(), None);

        let current = assert_some!(server.current_value());
        assert_eq!(current.value, Value::Block(b));
        assert!(current.confirmed);
        assert_eq!(server.current_version(), 1);
    }

    #[test]
    fn wrong_quorum_is_rejected_with_expected() {
        let node = NodeId::random();
        let quorum = quorum_of(&[node]);
        let mut server = PaxosServer::new(node, quorum.clone());
        let stale = quorum_of(&[node, NodeId::random()]);
        let result = server.propose(&stale, proposal(1, 0, node));
        match result {
            Err(Error::WrongQuorum { expected, .. }) => {
                assert_eq!(expected, quorum)
            },
            other => panic!("expected WrongQuorum, got {:?}", other),
        }
    }

    #[test]
    fn higher_promise_refuses_lower_accept() {
        let node = NodeId::random();
        let other = NodeId::random();
        let quorum = quorum_of(&[node, other]);
        let mut server = PaxosServer::new(node, quorum.clone());

        let low = proposal(1, 0, node);
        let high = proposal(1, 5, other);
        assert_ok!(server.propose(&quorum, low));
        assert_ok!(server.propose(&quorum, high));
        // The accept at the low proposal reports the higher promise.
        assert_eq!(
            server.accept(&quorum, low, Value::Block(block(1))).unwrap(),
            high
        );
        assert_eq!(server.latest_decree(), None);
    }

    #[test]
    fn quorum_decree_changes_membership_and_keeps_value() {
        let a = NodeId::random();
        let b = NodeId::random();
        let c = NodeId::random();
        let old = quorum_of(&[a, b]);
        let new = quorum_of(&[a, b, c]);
        let mut server = PaxosServer::new(a, old.clone());

        // Confirm a block at version 1.
        let p1 = proposal(1, 0, a);
        let data = block(1);
        assert_ok!(server.propose(&old, p1));
        assert_ok!(server.accept(&old, p1, Value::Block(data.clone())));
        assert_ok!(server.confirm(&old, p1));

        // Elect the wider quorum at version 2.
        let p2 = proposal(2, 0, a);
        assert_ok!(server.propose(&old, p2));
        assert_ok!(server.accept(&old, p2, Value::Quorum(new.clone())));
        assert_eq!(server.confirm(&old, p2).unwrap(), Some(new.clone()));

        // Membership changed, the data survived, the version floor moved.
        assert_eq!(server.quorum(), &new);
        let value = assert_some!(server.current_value());
        assert_eq!(value.value, Value::Block(data));
        assert_eq!(server.current_version(), 2);

        // The old quorum is now refused.
        assert_err!(server.propose(&old, proposal(3, 0, a)));
        // The new quorum sees both the decree and the value.
        let promise = server.propose(&new, proposal(3, 0, a)).unwrap();
        assert_eq!(assert_some!(promise.previous).proposal, p2);
        assert_eq!(assert_some!(promise.value).proposal, p1);
    }

    #[test]
    fn superseded_block_decree_settles_into_value_slot() {
        let node = NodeId::random();
        let quorum = quorum_of(&[node]);
        let mut server = PaxosServer::new(node, quorum.clone());

        for version in 1..=3u64 {
            let p = proposal(version, 0, node);
            assert_ok!(server.propose(&quorum, p));
            assert_ok!(server.accept(&quorum, p, Value::Block(block(version))));
            assert_ok!(server.confirm(&quorum, p));
        }
        assert_eq!(server.current_version(), 3);
        let value = assert_some!(server.current_value());
        assert_eq!(value.value.as_block().unwrap().version(), 3);
    }

    #[test]
    fn get_elides_known_versions() {
        let node = NodeId::random();
        let quorum = quorum_of(&[node]);
        let mut server = PaxosServer::new(node, quorum.clone());
        let p = proposal(4, 0, node);
        assert_ok!(server.propose(&quorum, p));
        assert_ok!(server.accept(&quorum, p, Value::Block(block(4))));
        assert_ok!(server.confirm(&quorum, p));

        let full = server.get(&quorum, Some(3)).unwrap().unwrap();
        assert_some!(full.value);
        let elided = server.get(&quorum, Some(4)).unwrap().unwrap();
        assert_eq!(elided.value, None);
        assert_eq!(elided.proposal, p);
        assert!(elided.confirmed);
    }

    #[test]
    fn install_synthesizes_a_confirmed_decree() {
        let node = NodeId::random();
        let sender = NodeId::random();
        let quorum = quorum_of(&[node, sender]);
        let mut server = PaxosServer::new(node, quorum.clone());
        let p = proposal(7, 2, sender);
        let data = block(7);
        assert_ok!(server.install(&quorum, data.clone(), p));
        let value = assert_some!(server.current_value());
        assert!(value.confirmed);
        assert_eq!(value.value, Value::Block(data));
        assert_eq!(server.current_version(), 7);
    }
}
