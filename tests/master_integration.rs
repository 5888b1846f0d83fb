//! End-to-end tests of the master facade over a real single-node raft
//! group: commands travel through propose, commit, and apply before the
//! caller observes a result.

#[allow(dead_code)]
mod common;

use common::MB;
use shoal::config::{MasterConfig, ReplicationConfig};
use shoal::master::server::LogHandle;
use shoal::master::{MasterServer, MasterState, MasterStateMachine};
use shoal::raft::{NoopRpc, RaftConfig, RaftNode};
use shoal::types::ReadMode;
use shoal::ShoalError;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;

struct TestMaster {
    server: MasterServer,
    state: Arc<MasterState>,
    _dir: TempDir,
}

/// Build a master over a raft group, wait for the given role, and hand
/// back the facade.
async fn master(peers: Vec<(u64, String)>, expect_leader: bool) -> TestMaster {
    let dir = tempfile::tempdir().unwrap();
    let replication = ReplicationConfig {
        replica_num: 3,
        chunk_size: 64 * MB,
        ..Default::default()
    };
    let state = Arc::new(MasterState::new(replication));
    let state_machine = MasterStateMachine::new(Arc::clone(&state));

    let raft_config = RaftConfig {
        node_id: 1,
        peers: peers.into_iter().collect(),
        election_timeout_min: Duration::from_millis(10),
        election_timeout_max: Duration::from_millis(20),
        heartbeat_interval: Duration::from_millis(5),
        ..Default::default()
    };
    let (node, command_rx) =
        RaftNode::new(raft_config, dir.path(), state_machine, Arc::new(NoopRpc)).unwrap();
    let command_tx = node.command_sender();
    let mut leadership = node.leadership();
    tokio::spawn(node.run(command_rx));

    if expect_leader {
        timeout(Duration::from_secs(2), async {
            loop {
                if leadership.borrow().is_leader {
                    return;
                }
                leadership.changed().await.unwrap();
            }
        })
        .await
        .expect("single-node group should elect itself");
    } else {
        // Give the node a moment to fail its first election.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let log = LogHandle::new(command_tx, MasterConfig::default().raft.apply_timeout);
    TestMaster {
        server: MasterServer::new(Arc::clone(&state), log, leadership),
        state,
        _dir: dir,
    }
}

async fn leader() -> TestMaster {
    master(vec![], true).await
}

/// A node with unreachable peers never wins an election.
async fn follower() -> TestMaster {
    master(
        vec![(2, "127.0.0.1:1".into()), (3, "127.0.0.1:2".into())],
        false,
    )
    .await
}

#[tokio::test]
async fn test_cold_add() {
    let master = leader().await;
    let a = master.server.register_data_node("10.0.0.1:7000").await.unwrap();
    let b = master.server.register_data_node("10.0.0.2:7000").await.unwrap();
    let c = master.server.register_data_node("10.0.0.3:7000").await.unwrap();

    let response = master
        .server
        .add_file("/", "x", 100 * MB, true)
        .await
        .unwrap();

    assert_eq!(response.node.chunks.len(), 2);
    assert_eq!(response.planned_nodes.len(), 2);
    for planned in &response.planned_nodes {
        let ids: Vec<_> = planned.iter().map(|(id, _)| *id).collect();
        for node in [a, b, c] {
            assert!(ids.contains(&node));
        }
    }

    // Tree has the child; chunks pend on all three targets; nothing is
    // committed yet and nothing is queued.
    let stat = master.server.stat("/x", ReadMode::Latest).unwrap();
    assert_eq!(stat.id, response.node.id);
    for chunk_id in &response.node.chunks {
        let chunk = master.state.chunks.get(*chunk_id).unwrap();
        assert!(chunk.committed.is_empty());
        assert_eq!(chunk.pending.len(), 3);
    }
    assert!(master.state.queue.is_empty());
}

#[tokio::test]
async fn test_mutations_are_leader_only() {
    let follower = follower().await;

    let err = follower
        .server
        .add_file("/", "x", MB, true)
        .await
        .unwrap_err();
    assert!(matches!(err, ShoalError::NotLeader { .. }));
    assert!(err.is_retryable());

    let err = follower.server.remove("/x").await.unwrap_err();
    assert!(matches!(err, ShoalError::NotLeader { .. }));
}

#[tokio::test]
async fn test_stale_read_serves_from_follower() {
    let leader = leader().await;
    leader.server.add_file("/", "x", MB, true).await.unwrap();

    // Latest on the leader sees the file.
    assert!(leader.server.stat("/x", ReadMode::Latest).is_ok());

    // A freshly started follower has not learned about the commit: a
    // Stale read answers (NotFound), a Latest read refuses.
    let follower = follower().await;
    let stale = follower.server.stat("/x", ReadMode::Stale).unwrap_err();
    assert!(matches!(stale, ShoalError::NotFound(_)));
    let latest = follower.server.stat("/x", ReadMode::Latest).unwrap_err();
    assert!(matches!(latest, ShoalError::NotLeader { .. }));
}

#[tokio::test]
async fn test_move_collision_keeps_source() {
    let master = leader().await;
    let server = &master.server;
    server.add_file("/", "a", 0, false).await.unwrap();
    server.add_file("/", "c", 0, false).await.unwrap();
    server.add_file("/a", "b", MB, true).await.unwrap();
    server.add_file("/c", "b", MB, true).await.unwrap();

    let err = server.move_node("/a/b", "/c").await.unwrap_err();
    assert!(matches!(err, ShoalError::AlreadyExists(_)));
    assert!(server.stat("/a/b", ReadMode::Latest).is_ok());

    // A non-colliding move works end to end.
    server.rename("/a/b", "b2").await.unwrap();
    server.move_node("/a/b2", "/c").await.unwrap();
    assert!(server.stat("/c/b2", ReadMode::Latest).is_ok());
    assert!(matches!(
        server.stat("/a/b2", ReadMode::Latest),
        Err(ShoalError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_remove_then_rename_restores() {
    let master = leader().await;
    let server = &master.server;
    let original = server.add_file("/", "x", MB, true).await.unwrap().node;

    let removed = server.remove("/x").await.unwrap();
    assert!(removed.is_deleted);
    assert!(matches!(
        server.stat("/x", ReadMode::Latest),
        Err(ShoalError::NotFound(_))
    ));

    let restored = server.rename("/deletex", "x").await.unwrap();
    assert_eq!(restored, original);
}

#[tokio::test]
async fn test_heartbeat_returns_transfer_orders_with_addresses() {
    let master = leader().await;
    let server = &master.server;
    let holder = server.register_data_node("10.0.0.1:7000").await.unwrap();
    let receiver = server.register_data_node("10.0.0.2:7000").await.unwrap();

    // One under-replicated chunk held by `holder`.
    let state = Arc::clone(&master.state);
    let file = common::add_file(&state, "/", "f", MB, vec![holder]);
    let chunk = file.chunks[0];
    common::heartbeat(&state, holder, vec![chunk]);

    // Plan the repair through the log.
    let sink = common::DirectLog(Arc::clone(&state));
    let repair = shoal::master::RepairLoop::new(
        Arc::clone(&state),
        Arc::new(sink),
        common::replication_config(),
    );
    repair.repair_once().await;

    let orders = server
        .heartbeat(holder, "10.0.0.1:7000", 3, vec![chunk], vec![], vec![], vec![])
        .await
        .unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].chunk_id, chunk);
    assert_eq!(orders[0].receiver, receiver);
    assert_eq!(orders[0].receiver_address, "10.0.0.2:7000");
}

#[tokio::test]
async fn test_chunk_replicas_sorted_by_load() {
    let master = leader().await;
    let server = &master.server;
    let busy = server.register_data_node("10.0.0.1:7000").await.unwrap();
    let idle = server.register_data_node("10.0.0.2:7000").await.unwrap();

    let file = server.add_file("/", "x", MB, true).await.unwrap().node;
    let chunk = file.chunks[0];
    server
        .heartbeat(busy, "10.0.0.1:7000", 80, vec![chunk], vec![], vec![], vec![])
        .await
        .unwrap();
    server
        .heartbeat(idle, "10.0.0.2:7000", 2, vec![chunk], vec![], vec![], vec![])
        .await
        .unwrap();

    let replicas = server.chunk_replicas(chunk, ReadMode::Latest).unwrap();
    assert_eq!(replicas.len(), 2);
    assert_eq!(replicas[0].0, idle);
    assert_eq!(replicas[1].0, busy);
}
