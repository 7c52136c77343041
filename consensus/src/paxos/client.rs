// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

//! Proposer and learner for one address, driving a value to completion
//! across a snapshot of peer handles.
//!
//! The client is deliberately dumb about membership: any `WrongQuorum`
//! bubbles up so the caller can refresh the peer set through the overlay
//! and restart the attempt.

use futures::{stream, StreamExt};
use std::{
    collections::HashSet,
    sync::{Arc, Weak},
};
use torus_network::Peer;
use torus_types::{
    Accepted, Address, Block, Error, NodeId, PromiseResponse, Proposal,
    ProtocolVersion, Quorum, Value,
};
use tracing::{debug, trace};

/// RPC fan-out width per phase.
const FANOUT: usize = 10;

/// How many times a read will chase an in-flight decree before reporting
/// partial state.
const COMMIT_ATTEMPTS: usize = 3;

/// One member of the quorum. A member the overlay could not resolve (or
/// whose handle died) still counts toward the quorum size; it simply
/// fails as unavailable when called. Majorities are majorities of the
/// quorum, not of whoever happens to answer.
#[derive(Clone)]
pub struct ClientPeer {
    pub id: NodeId,
    handle: Option<Weak<dyn Peer>>,
}

impl ClientPeer {
    pub fn new(id: NodeId, handle: Weak<dyn Peer>) -> Self {
        Self { id, handle: Some(handle) }
    }

    /// A quorum member the overlay failed to resolve.
    pub fn unresolved(id: NodeId) -> Self {
        Self { id, handle: None }
    }

    pub fn lock(&self) -> Option<Arc<dyn Peer>> {
        self.handle.as_ref()?.upgrade()
    }
}

/// Outcome of a read: the quorum consulted, the latest decree proposal
/// (the version floor for writers) and the latest block value.
#[derive(Clone, Debug)]
pub struct ClientState {
    pub quorum: Quorum,
    pub proposal: Option<Proposal>,
    pub value: Option<Block>,
}

struct Tally {
    promises: Vec<PromiseResponse>,
    missing: HashSet<NodeId>,
    fatal: Option<Error>,
}

pub struct PaxosClient {
    node_id: NodeId,
    address: Address,
    peers: Vec<ClientPeer>,
    insert: bool,
    protocol: ProtocolVersion,
    round: u64,
    last_proposal: Option<Proposal>,
    missing: HashSet<NodeId>,
}

impl PaxosClient {
    pub fn new(
        node_id: NodeId,
        address: Address,
        peers: Vec<ClientPeer>,
        insert: bool,
        protocol: ProtocolVersion,
    ) -> Self {
        Self {
            node_id,
            address,
            peers,
            insert,
            protocol,
            round: 0,
            last_proposal: None,
            missing: HashSet::new(),
        }
    }

    pub fn peers(&self) -> &[ClientPeer] {
        &self.peers
    }

    /// Swaps the peer snapshot, typically after a `WrongQuorum` pointed
    /// at fresher membership.
    pub fn replace_peers(&mut self, peers: Vec<ClientPeer>) {
        self.peers = peers;
        self.missing.clear();
    }

    /// The quorum this client is talking to.
    pub fn quorum(&self) -> Quorum {
        self.peers.iter().map(|peer| peer.id).collect()
    }

    /// Peers that reported the block missing during the last phase.
    pub fn last_missing(&self) -> &HashSet<NodeId> {
        &self.missing
    }

    /// Proposal of the last decree this client drove or observed.
    pub fn last_proposal(&self) -> Option<Proposal> {
        self.last_proposal
    }

    fn majority(&self) -> usize {
        self.peers.len() / 2 + 1
    }

    fn next_round(&mut self) -> u64 {
        self.round += 1;
        self.round
    }

    /// Chooses a value for `version`. Returns `None` when our value took
    /// effect, or the decree that won instead so the caller can detect
    /// the conflict.
    pub async fn choose(
        &mut self,
        version: u64,
        value: Value,
    ) -> Result<Option<Accepted>, Error> {
        let quorum = self.quorum();
        let mut proposal =
            Proposal::new(version, self.next_round(), self.node_id);
        loop {
            trace!(address = %self.address, %proposal, "prepare");
            let tally = self.prepare(&quorum, proposal).await?;
            let best = tally
                .promises
                .iter()
                .filter_map(|p| p.previous.as_ref())
                .max_by_key(|a| a.proposal)
                .cloned();
            let mut chosen = value.clone();
            if let Some(best) = best {
                if best.proposal.version > version
                    || (best.proposal.version == version && best.confirmed)
                {
                    // Someone already decided this version (or a later
                    // one); hand the decree back as the conflict.
                    debug!(
                        address = %self.address,
                        theirs = %best.proposal,
                        "another value was chosen"
                    );
                    self.last_proposal = Some(best.proposal);
                    return Ok(Some(best));
                }
                if best.proposal.version == version {
                    if best.proposal.round >= proposal.round {
                        // Outbid; come back with a bigger round.
                        proposal.round = best.proposal.round + 1;
                        self.round = proposal.round;
                        continue;
                    }
                    // An unconfirmed decree below us: Paxos safety
                    // demands we adopt its value instead of ours.
                    chosen = best.value.clone();
                }
            }
            match self.accept_phase(&quorum, proposal, chosen.clone()).await? {
                AcceptOutcome::Accepted => {
                    self.confirm_phase(&quorum, proposal).await;
                    self.last_proposal = Some(proposal);
                    return Ok(if chosen != value {
                        Some(Accepted {
                            proposal,
                            value: chosen,
                            confirmed: true,
                        })
                    } else {
                        None
                    });
                },
                AcceptOutcome::Outbid(highest) => {
                    proposal.round = highest.round + 1;
                    self.round = proposal.round;
                },
            }
        }
    }

    /// Read-only equivalent: a round-only propose to learn the majority
    /// view, committing the latest accepted value if it was left in
    /// flight.
    pub async fn state(&mut self) -> Result<ClientState, Error> {
        let quorum = self.quorum();
        let probe = Proposal::new(0, self.next_round(), self.node_id);
        let tally = self.prepare(&quorum, probe).await?;
        let decree = tally
            .promises
            .iter()
            .filter_map(|p| p.previous.as_ref())
            .max_by_key(|a| a.proposal)
            .cloned();
        let value = tally
            .promises
            .iter()
            .filter_map(|p| p.value.as_ref())
            .max_by_key(|a| a.proposal)
            .cloned();
        let Some(decree) = decree else {
            return Ok(ClientState { quorum, proposal: None, value: None });
        };
        let decree = if decree.confirmed {
            decree
        } else {
            self.commit(&quorum, decree).await?
        };
        self.last_proposal = Some(decree.proposal);
        let block = match &decree.value {
            Value::Block(block) => Some(block.clone()),
            Value::Quorum(_) => {
                value.and_then(|a| a.value.as_block().cloned())
            },
        };
        Ok(ClientState {
            quorum,
            proposal: Some(decree.proposal),
            value: block,
        })
    }

    /// Drives an in-flight decree to confirmation.
    async fn commit(
        &mut self,
        quorum: &Quorum,
        decree: Accepted,
    ) -> Result<Accepted, Error> {
        let mut round = self.next_round().max(decree.proposal.round + 1);
        for _ in 0..COMMIT_ATTEMPTS {
            let proposal = Proposal::new(
                decree.proposal.version,
                round,
                self.node_id,
            );
            match self
                .accept_phase(quorum, proposal, decree.value.clone())
                .await
            {
                Ok(AcceptOutcome::Accepted) => {
                    self.confirm_phase(quorum, proposal).await;
                    return Ok(Accepted {
                        proposal,
                        value: decree.value,
                        confirmed: true,
                    });
                },
                Ok(AcceptOutcome::Outbid(highest)) => {
                    round = round.max(highest.round) + 1;
                    self.round = round;
                },
                Err(Error::TooFewPeers { .. }) => {
                    return Err(Error::PartialState(self.address))
                },
                Err(e) => return Err(e),
            }
        }
        Err(Error::PartialState(self.address))
    }

    async fn prepare(
        &mut self,
        quorum: &Quorum,
        proposal: Proposal,
    ) -> Result<Tally, Error> {
        let address = self.address;
        let insert = self.insert;
        let results: Vec<(NodeId, Result<PromiseResponse, Error>)> =
            stream::iter(self.peers.iter().map(|peer| {
                let peer = peer.clone();
                let quorum = quorum.clone();
                async move {
                    let result = match peer.lock() {
                        None => Err(Error::Unavailable(
                            "peer handle expired".into(),
                        )),
                        Some(p) => {
                            p.propose(&quorum, address, proposal, insert).await
                        },
                    };
                    (peer.id, result)
                }
            }))
            .buffer_unordered(FANOUT)
            .collect()
            .await;

        let mut tally = Tally {
            promises: Vec::new(),
            missing: HashSet::new(),
            fatal: None,
        };
        for (id, result) in results {
            match result {
                Ok(promise) => tally.promises.push(promise),
                Err(e @ Error::WrongQuorum { .. }) => return Err(e),
                Err(e) if e.is_missing_block() => {
                    tally.missing.insert(id);
                },
                Err(Error::Unavailable(reason)) => {
                    trace!(peer = %id, %reason, "peer unreachable");
                },
                Err(Error::WeakError(inner)) => {
                    trace!(peer = %id, error = %inner, "weak error");
                },
                Err(e) => {
                    if tally.fatal.is_none() {
                        tally.fatal = Some(e);
                    }
                },
            }
        }
        self.missing = tally.missing.clone();
        if tally.promises.len() < self.majority() {
            if let Some(fatal) = tally.fatal {
                return Err(fatal);
            }
            if tally.missing.len() >= self.majority() {
                return Err(Error::MissingBlock(self.address));
            }
            return Err(Error::TooFewPeers {
                reached: tally.promises.len(),
                total: self.peers.len(),
            });
        }
        Ok(tally)
    }

    async fn accept_phase(
        &self,
        quorum: &Quorum,
        proposal: Proposal,
        value: Value,
    ) -> Result<AcceptOutcome, Error> {
        let address = self.address;
        let results: Vec<Result<Proposal, Error>> =
            stream::iter(self.peers.iter().map(|peer| {
                let peer = peer.clone();
                let value = value.clone();
                let quorum = quorum.clone();
                async move {
                    match peer.lock() {
                        None => Err(Error::Unavailable(
                            "peer handle expired".into(),
                        )),
                        Some(p) => {
                            p.accept(&quorum, address, proposal, value).await
                        },
                    }
                }
            }))
            .buffer_unordered(FANOUT)
            .collect()
            .await;

        let mut accepted = 0usize;
        let mut highest = proposal;
        for result in results {
            match result {
                Ok(returned) if returned == proposal => accepted += 1,
                Ok(returned) => highest = highest.max(returned),
                Err(e @ Error::WrongQuorum { .. }) => return Err(e),
                Err(
                    e @ (Error::Conflict { .. } | Error::ValidationFailed(_)),
                ) => return Err(e),
                Err(e) => trace!(error = %e, "accept failed"),
            }
        }
        if highest > proposal {
            return Ok(AcceptOutcome::Outbid(highest));
        }
        if accepted < self.majority() {
            return Err(Error::TooFewPeers {
                reached: accepted,
                total: self.peers.len(),
            });
        }
        Ok(AcceptOutcome::Accepted)
    }

    /// Best-effort confirm broadcast; mandatory from protocol 0.6 on.
    async fn confirm_phase(&self, quorum: &Quorum, proposal: Proposal) {
        if !self.protocol.mandatory_confirm() {
            return;
        }
        let address = self.address;
        let results: Vec<Result<(), Error>> =
            stream::iter(self.peers.iter().map(|peer| {
                let peer = peer.clone();
                let quorum = quorum.clone();
                async move {
                    match peer.lock() {
                        None => Err(Error::Unavailable(
                            "peer handle expired".into(),
                        )),
                        Some(p) => p.confirm(&quorum, address, proposal).await,
                    }
                }
            }))
            .buffer_unordered(FANOUT)
            .collect()
            .await;
        for result in results {
            if let Err(e) = result {
                trace!(error = %e, "confirm failed");
            }
        }
    }
}

enum AcceptOutcome {
    Accepted,
    Outbid(Proposal),
}
