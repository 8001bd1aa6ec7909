//! Master HTTP surface tests: assign/lookup/status against a live
//! single-node Raft, and follower proxying against a two-master pair.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use needlehouse_core::{ReplicaPlacement, Ttl};
use needlehouse_master::{
    AssignParams, Command, ConsensusLog, LeaderState, Master, MasterConfig, MasterState,
    MemoryLog, RaftConfig, RaftNode, RaftSequencer,
};
use needlehouse_topology::{HeartbeatInfo, VolumeInfo};
use tokio::sync::watch;

fn volume_info(id: u32) -> VolumeInfo {
    VolumeInfo {
        id,
        size: 1024,
        collection: String::new(),
        file_count: 1,
        delete_count: 0,
        deleted_bytes: 0,
        read_only: false,
        replica_placement: ReplicaPlacement::default(),
        ttl: Ttl::NONE,
        version: 3,
        compact_revision: 0,
    }
}

fn heartbeat(ip: &str, vids: &[u32]) -> HeartbeatInfo {
    HeartbeatInfo {
        ip: ip.to_string(),
        port: 8080,
        public_url: format!("{}:8080", ip),
        data_center: "dc1".to_string(),
        rack: "r1".to_string(),
        max_volume_count: 7,
        volumes: vids.iter().map(|id| volume_info(*id)).collect(),
    }
}

async fn raft_master(meta_dir: &std::path::Path) -> Arc<Master> {
    let address = "127.0.0.1:9333".to_string();
    let raft = RaftNode::open(RaftConfig {
        address: address.clone(),
        peers: vec![address.clone()],
        meta_dir: meta_dir.to_path_buf(),
        election_timeout: Duration::from_millis(50),
        heartbeat_interval: Duration::from_millis(20),
    })
    .unwrap();
    raft.start();
    for _ in 0..100 {
        if raft.is_leader() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(raft.is_leader(), "single-node raft never became leader");

    let consensus: Arc<dyn ConsensusLog> = raft;
    let sequencer = Arc::new(RaftSequencer::new(Arc::clone(&consensus)));
    let config = MasterConfig {
        meta_dir: meta_dir.to_path_buf(),
        ..Default::default()
    };
    Master::new(config, consensus, sequencer)
}

async fn serve_http(master: &Arc<Master>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = master.http_router();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_assign_and_lookup_over_http() {
    let meta = tempfile::tempdir().unwrap();
    let master = raft_master(meta.path()).await;
    master.register_heartbeat(heartbeat("10.0.0.1", &[5])).await;
    let base = serve_http(&master).await;

    let client = reqwest::Client::new();
    let assign: serde_json::Value = client
        .post(format!("{}/dir/assign", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let fid = assign["fid"].as_str().unwrap();
    assert!(fid.starts_with("5,"), "fid {fid} should land on volume 5");
    assert_eq!(assign["url"], "10.0.0.1:8080");
    assert_eq!(assign["count"], 1);

    let lookup: serde_json::Value = client
        .get(format!("{}/dir/lookup?volumeId=5", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(lookup["locations"][0]["url"], "10.0.0.1:8080");

    // Unknown volume is a 404
    let missing = client
        .get(format!("{}/dir/lookup?volumeId=99", base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    let status: serde_json::Value = client
        .get(format!("{}/dir/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["Topology"]["dataCenters"][0]["name"], "dc1");
}

#[tokio::test]
async fn test_assigned_ids_are_strictly_increasing() {
    let meta = tempfile::tempdir().unwrap();
    let master = raft_master(meta.path()).await;
    master.register_heartbeat(heartbeat("10.0.0.1", &[1])).await;

    let mut last = 0u64;
    for _ in 0..10 {
        let result = master.assign(&AssignParams::default()).await.unwrap();
        let fid = needlehouse_core::FileId::parse(&result.fid).unwrap();
        assert!(fid.needle_id > last, "ids must never repeat");
        last = fid.needle_id;
    }

    // Batch assigns reserve whole ranges.
    let result = master
        .assign(&AssignParams {
            count: Some(5),
            ..Default::default()
        })
        .await
        .unwrap();
    let fid = needlehouse_core::FileId::parse(&result.fid).unwrap();
    assert!(fid.needle_id > last);
    assert_eq!(result.count, 5);
}

#[tokio::test]
async fn test_sequencer_survives_master_restart() {
    let meta = tempfile::tempdir().unwrap();
    let before = {
        let master = raft_master(meta.path()).await;
        master.register_heartbeat(heartbeat("10.0.0.1", &[1])).await;
        let result = master.assign(&AssignParams::default()).await.unwrap();
        needlehouse_core::FileId::parse(&result.fid).unwrap().needle_id
    };

    let master = raft_master(meta.path()).await;
    master.register_heartbeat(heartbeat("10.0.0.1", &[1])).await;
    let result = master.assign(&AssignParams::default()).await.unwrap();
    let after = needlehouse_core::FileId::parse(&result.fid).unwrap().needle_id;
    assert!(
        after > before,
        "restarted master reused id space: {} then {}",
        before,
        after
    );
}

/// A consensus stub that is permanently a follower with a known leader.
struct FollowerLog {
    leader: String,
    leadership: watch::Sender<LeaderState>,
}

impl FollowerLog {
    fn new(leader: &str) -> Self {
        let (leadership, _) = watch::channel(LeaderState {
            is_leader: false,
            leader: Some(leader.to_string()),
        });
        Self {
            leader: leader.to_string(),
            leadership,
        }
    }
}

#[async_trait]
impl ConsensusLog for FollowerLog {
    async fn propose(&self, _command: Command) -> needlehouse_master::Result<MasterState> {
        Err(needlehouse_master::Error::NotLeader(Some(self.leader.clone())))
    }

    fn applied_state(&self) -> MasterState {
        MasterState::default()
    }

    fn is_leader(&self) -> bool {
        false
    }

    fn leader_hint(&self) -> Option<String> {
        Some(self.leader.clone())
    }

    fn subscribe_leadership(&self) -> watch::Receiver<LeaderState> {
        self.leadership.subscribe()
    }
}

#[tokio::test]
async fn test_follower_proxies_to_leader() {
    // Leader with one registered volume.
    let leader_consensus: Arc<dyn ConsensusLog> = Arc::new(MemoryLog::new("127.0.0.1:9333"));
    let leader = Master::new(
        MasterConfig::default(),
        Arc::clone(&leader_consensus),
        Arc::new(RaftSequencer::new(leader_consensus)),
    );
    leader.register_heartbeat(heartbeat("10.0.0.1", &[3])).await;
    let leader_base = serve_http(&leader).await;
    let leader_addr = leader_base.strip_prefix("http://").unwrap().to_string();

    // Follower that knows where the leader lives.
    let follower_consensus: Arc<dyn ConsensusLog> = Arc::new(FollowerLog::new(&leader_addr));
    let follower = Master::new(
        MasterConfig::default(),
        Arc::clone(&follower_consensus),
        Arc::new(RaftSequencer::new(follower_consensus)),
    );
    let follower_base = serve_http(&follower).await;

    // An assign sent to the follower succeeds via the proxy.
    let assign: serde_json::Value = reqwest::Client::new()
        .post(format!("{}/dir/assign", follower_base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(assign["fid"].as_str().unwrap().starts_with("3,"));
}
