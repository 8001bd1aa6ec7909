//! Three-node Raft cluster tests on loopback: election, replication,
//! and failover after the leader disappears.

use std::sync::Arc;
use std::time::Duration;

use needlehouse_master::{
    Command, ConsensusLog, RaftConfig, RaftNode, RaftService,
};
use needlehouse_proto::raft::raft_server::RaftServer as RaftGrpcServer;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;

struct ClusterNode {
    node: Arc<RaftNode>,
    server: JoinHandle<()>,
    _meta_dir: tempfile::TempDir,
}

/// Reserve an HTTP-address identity whose +10000 gRPC port is also free.
/// The probe listener is returned so the HTTP port stays claimed while
/// the rest of the cluster reserves its own pairs.
async fn reserve_identity() -> (String, tokio::net::TcpListener, tokio::net::TcpListener) {
    for _ in 0..50 {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        if let Ok(grpc) = tokio::net::TcpListener::bind(("127.0.0.1", port + 10000)).await {
            return (format!("127.0.0.1:{}", port), probe, grpc);
        }
    }
    panic!("could not reserve a port pair");
}

async fn start_cluster(size: usize) -> Vec<ClusterNode> {
    let mut identities = Vec::new();
    for _ in 0..size {
        identities.push(reserve_identity().await);
    }
    let peers: Vec<String> = identities.iter().map(|(addr, _, _)| addr.clone()).collect();

    let mut nodes = Vec::new();
    for (address, _probe, grpc_listener) in identities {
        let meta_dir = tempfile::tempdir().unwrap();
        let node = RaftNode::open(RaftConfig {
            address,
            peers: peers.clone(),
            meta_dir: meta_dir.path().to_path_buf(),
            election_timeout: Duration::from_millis(150),
            heartbeat_interval: Duration::from_millis(40),
        })
        .unwrap();
        let service = RaftService::new(Arc::clone(&node));
        let server = tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(RaftGrpcServer::new(service))
                .serve_with_incoming(TcpListenerStream::new(grpc_listener))
                .await
                .unwrap();
        });
        node.start();
        nodes.push(ClusterNode {
            node,
            server,
            _meta_dir: meta_dir,
        });
    }
    nodes
}

async fn wait_for_single_leader(nodes: &[&ClusterNode]) -> usize {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let leaders: Vec<usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.node.is_leader())
            .map(|(i, _)| i)
            .collect();
        if leaders.len() == 1 {
            return leaders[0];
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "cluster never converged on one leader (saw {:?})",
            leaders
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_three_node_cluster_elects_one_leader() {
    let nodes = start_cluster(3).await;
    let refs: Vec<&ClusterNode> = nodes.iter().collect();
    let leader = wait_for_single_leader(&refs).await;

    // Followers learn the leader's address.
    tokio::time::sleep(Duration::from_millis(300)).await;
    for (i, node) in nodes.iter().enumerate() {
        if i != leader {
            assert_eq!(
                node.node.leader_hint(),
                nodes[leader].node.leader_hint(),
                "follower {} disagrees about the leader",
                i
            );
        }
    }
}

#[tokio::test]
async fn test_proposals_replicate_to_followers() {
    let nodes = start_cluster(3).await;
    let refs: Vec<&ClusterNode> = nodes.iter().collect();
    let leader = wait_for_single_leader(&refs).await;

    let state = nodes[leader]
        .node
        .propose(Command::ReserveSequence { amount: 25 })
        .await
        .unwrap();
    assert_eq!(state.sequence_max, 25);

    // Followers apply the entry within a few heartbeats.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let caught_up = nodes
            .iter()
            .all(|n| n.node.applied_state().sequence_max == 25);
        if caught_up {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "followers never applied the entry"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_failover_preserves_sequence_monotonicity() {
    let nodes = start_cluster(3).await;
    let refs: Vec<&ClusterNode> = nodes.iter().collect();
    let first_leader = wait_for_single_leader(&refs).await;

    let before = nodes[first_leader]
        .node
        .propose(Command::ReserveSequence { amount: 100 })
        .await
        .unwrap()
        .sequence_max;

    // Give the followers a moment to replicate, then kill the leader.
    tokio::time::sleep(Duration::from_millis(300)).await;
    nodes[first_leader].node.stop();
    nodes[first_leader].server.abort();

    let survivors: Vec<&ClusterNode> = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != first_leader)
        .map(|(_, n)| n)
        .collect();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let new_leader = loop {
        if let Some(node) = survivors.iter().find(|n| n.node.is_leader()) {
            break node;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no new leader after failover"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    };

    // A reservation on the new leader continues past the old range.
    let after = new_leader
        .node
        .propose(Command::ReserveSequence { amount: 1 })
        .await
        .unwrap()
        .sequence_max;
    assert!(
        after > before,
        "new leader reused ids: {} then {}",
        before,
        after
    );
}
