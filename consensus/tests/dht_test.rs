// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end cluster scenarios: in-process nodes over memory silos and
//! a static overlay, exercising the public store/fetch/remove surface,
//! rebalancing, eviction and resignation.

use claims::{assert_matches, assert_none, assert_ok, assert_some};
use ed25519_dalek::Keypair;
use rand::rngs::OsRng;
use std::{future::Future, sync::Arc, time::Duration};
use torus_config::ConsensusConfig;
use torus_consensus::{Dht, LocalPeer};
use torus_network::Peer;
use torus_overlay::{Overlay, StaticOverlay};
use torus_silo::MemorySilo;
use torus_types::{
    block::{AclBlock, AclEntry, ImmutableBlock, NamedBlock, OwnerKeyedBlock},
    Block, Error, NodeId, ProtocolVersion, RemoveSignature, StoreMode,
};

struct TestNode {
    id: NodeId,
    silo: Arc<MemorySilo>,
    overlay: Arc<StaticOverlay>,
    handle: Arc<dyn Peer>,
    dht: Dht,
}

struct Cluster {
    user: Arc<Keypair>,
    config: ConsensusConfig,
    nodes: Vec<TestNode>,
}

impl Cluster {
    fn new(config: ConsensusConfig) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        Self {
            user: Arc::new(Keypair::generate(&mut OsRng)),
            config,
            nodes: Vec::new(),
        }
    }

    async fn with_nodes(config: ConsensusConfig, count: usize) -> Self {
        let mut cluster = Self::new(config);
        for _ in 0..count {
            cluster.add_node();
        }
        cluster
    }

    fn add_node(&mut self) -> NodeId {
        let identity = Keypair::generate(&mut OsRng);
        let id = NodeId::from_public_key(&identity.public);
        self.add_node_with(id, Arc::new(MemorySilo::new()))
    }

    /// Adds a node with a fixed identity and silo, as after a restart.
    fn add_node_with(&mut self, id: NodeId, silo: Arc<MemorySilo>) -> NodeId {
        let local = LocalPeer::new(
            id,
            self.config,
            ProtocolVersion::CURRENT,
            silo.clone(),
        );
        let overlay = Arc::new(StaticOverlay::new());
        let handle: Arc<dyn Peer> = local.clone();
        let dht = Dht::new(
            local,
            overlay.clone() as Arc<dyn Overlay>,
            self.user.clone(),
        );
        overlay.connect(&handle);
        for other in &self.nodes {
            overlay.connect(&other.handle);
            other.overlay.connect(&handle);
        }
        self.nodes.push(TestNode { id, silo, overlay, handle, dht });
        id
    }

    fn dht(&self, index: usize) -> &Dht {
        &self.nodes[index].dht
    }

    fn node(&self, id: NodeId) -> &TestNode {
        self.nodes.iter().find(|node| node.id == id).expect("no such node")
    }

    /// Stops a node dead: no resignation, no goodbye.
    fn kill(&mut self, index: usize) -> (NodeId, Arc<MemorySilo>) {
        let node = self.nodes.remove(index);
        node.dht.local().stop();
        let id = node.id;
        let silo = node.silo.clone();
        drop(node);
        for other in &self.nodes {
            other.overlay.disconnect(id);
        }
        (id, silo)
    }

    /// Disconnects `id` from every other node's overlay without
    /// dropping it, then resigns it gracefully.
    async fn retire(&mut self, index: usize) {
        let id = self.nodes[index].id;
        for (i, other) in self.nodes.iter().enumerate() {
            if i != index {
                other.overlay.disconnect(id);
            }
        }
        self.nodes[index].dht.shutdown().await;
        self.nodes.remove(index);
    }

    fn owner_keyed(&self, payload: &[u8]) -> Block {
        let mut block = OwnerKeyedBlock::new(&self.user);
        block.set_payload(payload.to_vec());
        block.seal(&self.user);
        Block::OwnerKeyed(block)
    }
}

async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn config(factor: usize) -> ConsensusConfig {
    ConsensusConfig { replication_factor: factor, ..Default::default() }
}

#[tokio::test]
async fn immutable_block_round_trip() {
    let cluster = Cluster::with_nodes(config(3), 3).await;
    let block = Block::Immutable(ImmutableBlock::new(
        &cluster.user.public,
        b"hello".to_vec(),
    ));
    let address = block.address();

    assert_ok!(
        cluster.dht(0).store(block.clone(), StoreMode::Insert, None).await
    );
    for node in &cluster.nodes {
        let fetched =
            assert_some!(node.dht.fetch(address, None).await.unwrap());
        assert_eq!(fetched.payload(), b"hello");
    }

    // Re-inserting identical content is a no-op.
    assert_ok!(cluster.dht(1).store(block, StoreMode::Insert, None).await);

    let signature = RemoveSignature::new(&cluster.user, address);
    assert_ok!(cluster.dht(0).remove(address, signature).await);
    for node in &cluster.nodes {
        assert_matches!(
            node.dht.fetch(address, None).await,
            Err(Error::MissingBlock(_))
        );
    }
}

#[tokio::test]
async fn mutable_block_update() {
    let cluster = Cluster::with_nodes(config(3), 3).await;
    let block = cluster.owner_keyed(b"A");
    let address = block.address();
    assert_eq!(block.version(), 1);

    assert_ok!(cluster.dht(0).store(block, StoreMode::Insert, None).await);
    let fetched =
        assert_some!(cluster.dht(1).fetch(address, None).await.unwrap());
    assert_eq!(fetched.payload(), b"A");
    assert_eq!(fetched.version(), 1);

    let Block::OwnerKeyed(mut update) = fetched else {
        panic!("expected an owner-keyed block")
    };
    update.set_payload(b"AA".to_vec());
    update.seal(&cluster.user);
    assert!(update.version > 1);
    assert_ok!(cluster
        .dht(1)
        .store(Block::OwnerKeyed(update), StoreMode::Update, None)
        .await);

    let fetched =
        assert_some!(cluster.dht(2).fetch(address, None).await.unwrap());
    assert_eq!(fetched.payload(), b"AA");
    assert_eq!(fetched.version(), 2);

    // Version elision: a reader already at the chosen version gets no
    // block back.
    assert_none!(cluster.dht(2).fetch(address, Some(2)).await.unwrap());
    let stale =
        assert_some!(cluster.dht(2).fetch(address, Some(1)).await.unwrap());
    assert_eq!(stale.payload(), b"AA");
}

#[tokio::test]
async fn availability_degrades_with_the_quorum() {
    let mut cluster = Cluster::with_nodes(config(3), 3).await;
    let block = cluster.owner_keyed(b"A");
    let address = block.address();
    assert_ok!(cluster
        .dht(0)
        .store(block.clone(), StoreMode::Insert, None)
        .await);

    // Two of three replicas keep the block readable and writable.
    cluster.kill(2);
    let fetched =
        assert_some!(cluster.dht(0).fetch(address, None).await.unwrap());
    assert_eq!(fetched.payload(), b"A");

    let Block::OwnerKeyed(mut update) = fetched else {
        panic!("expected an owner-keyed block")
    };
    update.set_payload(b"AA".to_vec());
    update.seal(&cluster.user);
    let update = Block::OwnerKeyed(update);
    assert_ok!(cluster
        .dht(0)
        .store(update.clone(), StoreMode::Update, None)
        .await);

    // One of three does not.
    cluster.kill(1);
    let Block::OwnerKeyed(mut stale) = update else { unreachable!() };
    stale.set_payload(b"AAA".to_vec());
    stale.seal(&cluster.user);
    assert_matches!(
        cluster
            .dht(0)
            .store(Block::OwnerKeyed(stale), StoreMode::Update, None)
            .await,
        Err(Error::TooFewPeers { .. })
    );
    assert_matches!(
        cluster.dht(0).fetch(address, None).await,
        Err(Error::TooFewPeers { .. })
    );
}

#[tokio::test]
async fn concurrent_update_runs_the_resolver() {
    let cluster = Cluster::with_nodes(config(3), 3).await;
    let block = cluster.owner_keyed(b"A");
    let address = block.address();
    assert_ok!(cluster.dht(0).store(block, StoreMode::Insert, None).await);

    let base = assert_some!(cluster.dht(0).fetch(address, None).await.unwrap());
    let diverge = |payload: &[u8]| {
        let Block::OwnerKeyed(mut b) = base.clone() else { unreachable!() };
        b.set_payload(payload.to_vec());
        b.seal(&cluster.user);
        Block::OwnerKeyed(b)
    };
    let winner = diverge(b"AB");
    let loser = diverge(b"AC");

    assert_ok!(cluster.dht(0).store(winner, StoreMode::Update, None).await);

    // The losing writer merges with what actually won.
    let resolver = |local: &Block, remote: &Block| -> Option<Block> {
        let Block::OwnerKeyed(remote) = remote else { return None };
        let mut merged = remote.clone();
        let mut payload = remote.payload.clone();
        payload.extend_from_slice(local.payload());
        merged.set_payload(payload);
        Some(Block::OwnerKeyed(merged))
    };
    assert_ok!(cluster
        .dht(1)
        .store(loser, StoreMode::Update, Some(&resolver))
        .await);

    let merged =
        assert_some!(cluster.dht(2).fetch(address, None).await.unwrap());
    assert_eq!(merged.payload(), b"ABAC");
    assert_eq!(merged.version(), 3);

    // Without a resolver the conflict surfaces, carrying the winner.
    let stale = diverge(b"AD");
    match cluster.dht(1).store(stale, StoreMode::Update, None).await {
        Err(Error::Conflict { current, .. }) => {
            assert_eq!(assert_some!(current).payload(), b"ABAC");
        },
        other => panic!("expected a conflict, got {:?}", other),
    }
}

#[tokio::test]
async fn discovery_expands_the_quorum() {
    let mut cluster = Cluster::with_nodes(config(3), 2).await;
    let block = cluster.owner_keyed(b"replicate me");
    let address = block.address();
    assert_ok!(cluster.dht(0).store(block, StoreMode::Insert, None).await);

    let status = cluster.dht(0).stat(address).await.unwrap();
    assert_eq!(status.quorum.len(), 2);

    let newcomer = cluster.add_node();
    eventually("the quorum to grow to 3", || async {
        cluster
            .dht(0)
            .stat(address)
            .await
            .map(|status| status.quorum.len() == 3)
            .unwrap_or(false)
    })
    .await;

    // Every member agrees on the membership, including the newcomer.
    for node in &cluster.nodes {
        eventually("every catalog to observe the new quorum", || async {
            node.dht
                .stat(address)
                .await
                .map(|status| status.quorum.contains(&newcomer))
                .unwrap_or(false)
        })
        .await;
    }

    // The propagated value landed on the new member itself.
    let status = cluster.dht(0).stat(address).await.unwrap();
    let held = cluster
        .node(newcomer)
        .handle
        .get(&status.quorum, address, None)
        .await
        .unwrap();
    let record = assert_some!(held);
    let value = assert_some!(record.value);
    assert_eq!(value.as_block().unwrap().payload(), b"replicate me");

    let fetched = assert_some!(cluster
        .node(newcomer)
        .dht
        .fetch(address, None)
        .await
        .unwrap());
    assert_eq!(fetched.payload(), b"replicate me");
}

#[tokio::test]
async fn disappearance_evicts_after_the_node_timeout() {
    let mut config = config(3);
    config.node_timeout_ms = 200;
    let mut cluster = Cluster::with_nodes(config, 3).await;
    let block = cluster.owner_keyed(b"survivor");
    let address = block.address();
    assert_ok!(cluster.dht(0).store(block, StoreMode::Insert, None).await);

    let (lost, _) = cluster.kill(2);
    eventually("the lost peer to be evicted", || async {
        cluster
            .dht(0)
            .stat(address)
            .await
            .map(|status| {
                status.quorum.len() == 2 && !status.quorum.contains(&lost)
            })
            .unwrap_or(false)
    })
    .await;

    // The shrunken quorum still serves the pre-kill value.
    let fetched =
        assert_some!(cluster.dht(0).fetch(address, None).await.unwrap());
    assert_eq!(fetched.payload(), b"survivor");
}

#[tokio::test]
async fn shutdown_resigns_owned_blocks() {
    let cluster_config = config(2);
    let mut cluster = Cluster::with_nodes(cluster_config, 3).await;
    let block = cluster.owner_keyed(b"handover");
    let address = block.address();
    assert_ok!(cluster.dht(0).store(block, StoreMode::Insert, None).await);

    let status = cluster.dht(0).stat(address).await.unwrap();
    assert_eq!(status.quorum.len(), 2);
    let leaving = *status.quorum.iter().next().unwrap();
    let index = cluster
        .nodes
        .iter()
        .position(|node| node.id == leaving)
        .expect("quorum member not in cluster");

    cluster.retire(index).await;

    // The survivor took over, and the block is still there.
    let survivor = &cluster.nodes[0].dht;
    eventually("the resigned peer to leave the quorum", || async {
        survivor
            .stat(address)
            .await
            .map(|status| !status.quorum.contains(&leaving))
            .unwrap_or(false)
    })
    .await;
    let fetched = assert_some!(survivor.fetch(address, None).await.unwrap());
    assert_eq!(fetched.payload(), b"handover");

    // And the hole gets refilled from the remaining nodes.
    eventually("the quorum to be refilled", || async {
        survivor
            .stat(address)
            .await
            .map(|status| status.quorum.len() == 2)
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn restart_reloads_persisted_state() {
    let mut cluster = Cluster::with_nodes(config(1), 1).await;
    let block = cluster.owner_keyed(b"durable");
    let address = block.address();
    assert_ok!(cluster.dht(0).store(block, StoreMode::Insert, None).await);
    let immutable = Block::Immutable(ImmutableBlock::new(
        &cluster.user.public,
        b"durable too".to_vec(),
    ));
    let immutable_address = immutable.address();
    assert_ok!(cluster.dht(0).store(immutable, StoreMode::Insert, None).await);

    let (id, silo) = cluster.kill(0);
    cluster.add_node_with(id, silo);

    let fetched =
        assert_some!(cluster.dht(0).fetch(address, None).await.unwrap());
    assert_eq!(fetched.payload(), b"durable");
    let fetched = assert_some!(cluster
        .dht(0)
        .fetch(immutable_address, None)
        .await
        .unwrap());
    assert_eq!(fetched.payload(), b"durable too");
}

#[tokio::test]
async fn named_blocks_are_single_assignment() {
    let cluster = Cluster::with_nodes(config(3), 3).await;
    let first = Block::Named(NamedBlock::new(
        &cluster.user,
        "readme".into(),
        b"v1".to_vec(),
    ));
    let address = first.address();
    assert_ok!(cluster.dht(0).store(first, StoreMode::Insert, None).await);
    let fetched =
        assert_some!(cluster.dht(1).fetch(address, None).await.unwrap());
    assert_eq!(fetched.payload(), b"v1");

    // Same owner and name, different payload: refused.
    let second = Block::Named(NamedBlock::new(
        &cluster.user,
        "readme".into(),
        b"v2".to_vec(),
    ));
    assert_eq!(second.address(), address);
    assert_matches!(
        cluster.dht(0).store(second, StoreMode::Insert, None).await,
        Err(Error::ValidationFailed(_))
    );

    // Deletable only by the owner.
    let stranger = Keypair::generate(&mut OsRng);
    assert_matches!(
        cluster
            .dht(1)
            .remove(address, RemoveSignature::new(&stranger, address))
            .await,
        Err(Error::ValidationFailed(_))
    );
    assert_ok!(
        cluster
            .dht(1)
            .remove(address, RemoveSignature::new(&cluster.user, address))
            .await
    );
}

#[tokio::test]
async fn acl_blocks_enforce_write_authority() {
    let cluster = Cluster::with_nodes(config(3), 3).await;
    let writer = Keypair::generate(&mut OsRng);
    let intruder = Keypair::generate(&mut OsRng);

    let mut block = AclBlock::new(&cluster.user);
    block.set_acl(vec![AclEntry {
        principal: writer.public,
        read: true,
        write: true,
    }]);
    block.set_payload(b"shared".to_vec());
    block.seal(&cluster.user);
    let address = block.address;
    assert_ok!(cluster
        .dht(0)
        .store(Block::Acl(block.clone()), StoreMode::Insert, None)
        .await);

    // The granted writer can update.
    let mut update = block.clone();
    update.set_payload(b"shared by writer".to_vec());
    update.seal(&writer);
    assert_ok!(cluster
        .dht(1)
        .store(Block::Acl(update), StoreMode::Update, None)
        .await);

    // An intruder cannot, even by forging an ACL naming himself.
    let fetched =
        assert_some!(cluster.dht(2).fetch(address, None).await.unwrap());
    let Block::Acl(mut forged) = fetched else {
        panic!("expected an ACL block")
    };
    forged.set_acl(vec![AclEntry {
        principal: intruder.public,
        read: true,
        write: true,
    }]);
    forged.set_payload(b"taken over".to_vec());
    forged.seal(&intruder);
    assert_matches!(
        cluster
            .dht(2)
            .store(Block::Acl(forged), StoreMode::Update, None)
            .await,
        Err(Error::ValidationFailed(_))
    );
}
