// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

//! Silo persistence format: one key per address, holding either a raw
//! block (immutable storage) or a Paxos decision record. Encoding is
//! length-prefixed bcs, gated by the [`SerializationContext`] protocol
//! version: peers below 0.5 persist no pending proposal and cannot
//! represent quorum-valued decrees.

use crate::paxos::server::PaxosServerState;
use serde::{Deserialize, Serialize};
use torus_types::{
    Accepted, Block, Error, SerializationContext, Value,
};

/// A decision record: the acceptor state plus the version of the last
/// decree it confirmed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub chosen_version: Option<u64>,
    pub state: PaxosServerState,
}

impl DecisionRecord {
    pub fn new(state: PaxosServerState) -> Self {
        let chosen_version = state
            .accepted
            .iter()
            .chain(state.value.iter())
            .filter(|a| a.confirmed)
            .map(|a| a.proposal.version)
            .max();
        Self { chosen_version, state }
    }
}

/// The union stored under a silo key, tagged by flavor.
#[derive(Clone, Debug, PartialEq)]
pub enum SiloEntry {
    Block(Block),
    Decision(DecisionRecord),
}

#[derive(Serialize, Deserialize)]
enum PersistedEntry {
    Block(Block),
    Decision(PersistedDecision),
}

#[derive(Serialize, Deserialize)]
struct PersistedDecision {
    chosen_version: Option<u64>,
    quorum: torus_types::Quorum,
    promised: Option<torus_types::Proposal>,
    accepted: Option<Accepted>,
    value: Option<Accepted>,
}

/// Pre-0.5 layout: no pending proposal, block decrees only.
#[derive(Serialize, Deserialize)]
enum LegacyEntry {
    Block(Block),
    Decision(LegacyDecision),
}

#[derive(Serialize, Deserialize)]
struct LegacyDecision {
    chosen_version: Option<u64>,
    quorum: torus_types::Quorum,
    accepted: Option<Accepted>,
    value: Option<Accepted>,
}

pub fn encode(
    context: &SerializationContext,
    entry: &SiloEntry,
) -> Result<Vec<u8>, Error> {
    let result = if context.protocol.quorum_values() {
        let persisted = match entry {
            SiloEntry::Block(block) => PersistedEntry::Block(block.clone()),
            SiloEntry::Decision(decision) => {
                PersistedEntry::Decision(PersistedDecision {
                    chosen_version: decision.chosen_version,
                    quorum: decision.state.quorum.clone(),
                    promised: decision.state.promised,
                    accepted: decision.state.accepted.clone(),
                    value: decision.state.value.clone(),
                })
            },
        };
        bcs::to_bytes(&persisted)
    } else {
        let legacy = match entry {
            SiloEntry::Block(block) => LegacyEntry::Block(block.clone()),
            SiloEntry::Decision(decision) => {
                LegacyEntry::Decision(LegacyDecision {
                    chosen_version: decision.chosen_version,
                    quorum: decision.state.quorum.clone(),
                    accepted: strip_quorum_decree(&decision.state.accepted),
                    value: decision.state.value.clone(),
                })
            },
        };
        bcs::to_bytes(&legacy)
    };
    result.map_err(|e| Error::Serialization(e.to_string()))
}

pub fn decode(
    context: &SerializationContext,
    bytes: &[u8],
) -> Result<SiloEntry, Error> {
    if context.protocol.quorum_values() {
        let persisted: PersistedEntry = bcs::from_bytes(bytes)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(match persisted {
            PersistedEntry::Block(block) => SiloEntry::Block(block),
            PersistedEntry::Decision(decision) => {
                SiloEntry::Decision(DecisionRecord {
                    chosen_version: decision.chosen_version,
                    state: PaxosServerState {
                        quorum: decision.quorum,
                        promised: decision.promised,
                        accepted: decision.accepted,
                        value: decision.value,
                    },
                })
            },
        })
    } else {
        let legacy: LegacyEntry = bcs::from_bytes(bytes)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(match legacy {
            LegacyEntry::Block(block) => SiloEntry::Block(block),
            LegacyEntry::Decision(decision) => {
                SiloEntry::Decision(DecisionRecord {
                    chosen_version: decision.chosen_version,
                    state: PaxosServerState {
                        quorum: decision.quorum,
                        promised: None,
                        accepted: decision.accepted,
                        value: decision.value,
                    },
                })
            },
        })
    }
}

fn strip_quorum_decree(accepted: &Option<Accepted>) -> Option<Accepted> {
    accepted
        .as_ref()
        .filter(|a| matches!(a.value, Value::Block(_)))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Keypair;
    use rand::rngs::OsRng;
    use torus_types::{
        block::OwnerKeyedBlock, NodeId, Proposal, ProtocolVersion, Quorum,
    };

    fn sample_block(version: u64) -> Block {
        let owner = Keypair::generate(&mut OsRng);
        let mut block = OwnerKeyedBlock::new(&owner);
        block.set_payload(b"payload".to_vec());
        block.seal_at(&owner, version);
        Block::OwnerKeyed(block)
    }

    fn sample_state(with_quorum_decree: bool) -> PaxosServerState {
        let a = NodeId::random();
        let b = NodeId::random();
        let quorum: Quorum = [a, b].into_iter().collect();
        let block_decree = Accepted {
            proposal: Proposal::new(1, 0, a),
            value: Value::Block(sample_block(1)),
            confirmed: true,
        };
        let accepted = if with_quorum_decree {
            Some(Accepted {
                proposal: Proposal::new(2, 1, b),
                value: Value::Quorum(quorum.clone()),
                confirmed: false,
            })
        } else {
            Some(block_decree.clone())
        };
        PaxosServerState {
            quorum,
            promised: Some(Proposal::new(2, 1, b)),
            accepted,
            value: Some(block_decree),
        }
    }

    #[test]
    fn round_trip_current_version() {
        for with_quorum_decree in [false, true] {
            let context = SerializationContext::current();
            let entry = SiloEntry::Decision(DecisionRecord::new(sample_state(
                with_quorum_decree,
            )));
            let bytes = encode(&context, &entry).unwrap();
            assert_eq!(decode(&context, &bytes).unwrap(), entry);
            // encode(decode(bytes)) is byte-stable.
            let again =
                encode(&context, &decode(&context, &bytes).unwrap()).unwrap();
            assert_eq!(bytes, again);
        }
    }

    #[test]
    fn round_trip_block_entry() {
        for protocol in [ProtocolVersion::V0_4, ProtocolVersion::V0_9] {
            let context = SerializationContext::new(protocol);
            let entry = SiloEntry::Block(sample_block(0));
            let bytes = encode(&context, &entry).unwrap();
            assert_eq!(decode(&context, &bytes).unwrap(), entry);
        }
    }

    #[test]
    fn legacy_context_drops_pending_state() {
        let context = SerializationContext::new(ProtocolVersion::V0_4);
        let entry =
            SiloEntry::Decision(DecisionRecord::new(sample_state(true)));
        let bytes = encode(&context, &entry).unwrap();
        let SiloEntry::Decision(decoded) = decode(&context, &bytes).unwrap()
        else {
            panic!("expected a decision record");
        };
        // No pending proposal and no quorum decree below 0.5.
        assert_eq!(decoded.state.promised, None);
        assert_eq!(decoded.state.accepted, None);
        // The block value survives.
        assert!(decoded.state.value.is_some());
    }

    #[test]
    fn versions_decode_their_own_encoding() {
        for protocol in
            [ProtocolVersion::V0_4, ProtocolVersion::V0_5, ProtocolVersion::V0_9]
        {
            let context = SerializationContext::new(protocol);
            let entry =
                SiloEntry::Decision(DecisionRecord::new(sample_state(false)));
            let bytes = encode(&context, &entry).unwrap();
            let decoded = decode(&context, &bytes).unwrap();
            let again = encode(&context, &decoded).unwrap();
            assert_eq!(bytes, again);
        }
    }
}
