//! End-to-end cluster tests on loopback: one master (single-node Raft),
//! one volume server, a real heartbeat loop, and HTTP clients.

use std::sync::Arc;
use std::time::Duration;

use needlehouse_master::{
    ConsensusLog, Master, MasterConfig, MasterRpcService, RaftConfig, RaftNode, RaftSequencer,
    RaftService,
};
use needlehouse_proto::master::master_server::MasterServer as MasterGrpcServer;
use needlehouse_proto::raft::raft_server::RaftServer as RaftGrpcServer;
use needlehouse_proto::volume::volume_server_server::VolumeServerServer;
use needlehouse_server::{heartbeat_loop, volume_router};
use needlehouse_storage::{
    IndexKind, Location, Store, StoreIdentity, SyncPolicy, VolumeOptions, VolumeRpcService,
};
use tokio_stream::wrappers::TcpListenerStream;

struct Cluster {
    master_base: String,
    _meta_dir: tempfile::TempDir,
    _data_dir: tempfile::TempDir,
    master: Arc<Master>,
}

/// Pick a free port and also reserve port+10000 for the gRPC convention.
async fn free_port_pair() -> (tokio::net::TcpListener, tokio::net::TcpListener) {
    for _ in 0..50 {
        let http = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = http.local_addr().unwrap().port();
        if let Ok(grpc) = tokio::net::TcpListener::bind(("127.0.0.1", port + 10000)).await {
            return (http, grpc);
        }
    }
    panic!("could not find a free port pair");
}

async fn start_cluster() -> Cluster {
    let meta_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();

    // Master with an embedded single-node Raft.
    let (master_http, master_grpc) = free_port_pair().await;
    let master_port = master_http.local_addr().unwrap().port();
    let master_address = format!("127.0.0.1:{}", master_port);
    let raft = RaftNode::open(RaftConfig {
        address: master_address.clone(),
        peers: vec![master_address.clone()],
        meta_dir: meta_dir.path().to_path_buf(),
        election_timeout: Duration::from_millis(50),
        heartbeat_interval: Duration::from_millis(20),
    })
    .unwrap();
    raft.start();

    let consensus: Arc<dyn needlehouse_master::ConsensusLog> =
        raft.clone() as Arc<dyn needlehouse_master::ConsensusLog>;
    let sequencer = Arc::new(RaftSequencer::new(Arc::clone(&consensus)));
    let config = MasterConfig {
        ip: "127.0.0.1".to_string(),
        port: master_port,
        meta_dir: meta_dir.path().to_path_buf(),
        peers: vec![master_address.clone()],
        pulse: Duration::from_millis(100),
        ..Default::default()
    };
    let master = Master::new(config, consensus, sequencer);

    let router = master.http_router();
    tokio::spawn(async move {
        axum::serve(master_http, router).await.unwrap();
    });
    let master_rpc = MasterRpcService::new(Arc::clone(&master));
    let raft_rpc = RaftService::new(Arc::clone(&raft));
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(MasterGrpcServer::new(master_rpc))
            .add_service(RaftGrpcServer::new(raft_rpc))
            .serve_with_incoming(TcpListenerStream::new(master_grpc))
            .await
            .unwrap();
    });

    // Volume server.
    let (volume_http, volume_grpc) = free_port_pair().await;
    let volume_port = volume_http.local_addr().unwrap().port();
    let store = Arc::new(
        Store::open(
            StoreIdentity {
                ip: "127.0.0.1".to_string(),
                port: volume_port,
                public_url: format!("127.0.0.1:{}", volume_port),
                data_center: "dc1".to_string(),
                rack: "r1".to_string(),
            },
            vec![Location {
                directory: data_dir.path().to_path_buf(),
                max_volume_count: 8,
            }],
            VolumeOptions {
                index_kind: IndexKind::Memory,
                size_limit: 64 * 1024 * 1024,
                sync_policy: SyncPolicy::Never,
            },
        )
        .unwrap(),
    );
    let volume_routes = volume_router(Arc::clone(&store));
    tokio::spawn(async move {
        axum::serve(volume_http, volume_routes).await.unwrap();
    });
    let volume_rpc = VolumeRpcService::new(Arc::clone(&store));
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(VolumeServerServer::new(volume_rpc))
            .serve_with_incoming(TcpListenerStream::new(volume_grpc))
            .await
            .unwrap();
    });
    tokio::spawn(heartbeat_loop(
        Arc::clone(&store),
        vec![master_address.clone()],
        Duration::from_millis(100),
    ));

    // Wait for leadership and the first heartbeat to land.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if master.consensus.is_leader() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no leader elected");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    Cluster {
        master_base: format!("http://{}", master_address),
        _meta_dir: meta_dir,
        _data_dir: data_dir,
        master,
    }
}

async fn assign(client: &reqwest::Client, cluster: &Cluster) -> (String, String) {
    let assign: serde_json::Value = client
        .post(format!("{}/dir/assign", cluster.master_base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let fid = assign["fid"].as_str().expect("assign returned no fid").to_string();
    let url = assign["publicUrl"].as_str().unwrap().to_string();
    (fid, url)
}

#[tokio::test]
async fn test_write_then_read_round_trip() {
    let cluster = start_cluster().await;
    let client = reqwest::Client::new();

    // Assign grows a volume on the empty store, then hands out a fid.
    let (fid, url) = assign(&client, &cluster).await;

    let body = "hello world";
    let put = client
        .put(format!("http://{}/{}", url, fid))
        .body(body)
        .send()
        .await
        .unwrap();
    assert!(put.status().is_success(), "put failed: {:?}", put.status());

    let got = client
        .get(format!("http://{}/{}", url, fid))
        .send()
        .await
        .unwrap();
    assert!(got.status().is_success());
    assert_eq!(got.bytes().await.unwrap().as_ref(), body.as_bytes());

    // The master redirect route points at the same volume server.
    let redirect = client
        .get(format!("{}/{}", cluster.master_base, fid))
        .send()
        .await
        .unwrap();
    assert_eq!(redirect.bytes().await.unwrap().as_ref(), body.as_bytes());
}

#[tokio::test]
async fn test_delete_then_read_is_not_found() {
    let cluster = start_cluster().await;
    let client = reqwest::Client::new();
    let (fid, url) = assign(&client, &cluster).await;

    client
        .put(format!("http://{}/{}", url, fid))
        .body("hello world")
        .send()
        .await
        .unwrap();

    let deleted = client
        .delete(format!("http://{}/{}", url, fid))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), reqwest::StatusCode::ACCEPTED);

    let got = client
        .get(format!("http://{}/{}", url, fid))
        .send()
        .await
        .unwrap();
    assert_eq!(got.status(), reqwest::StatusCode::NOT_FOUND);

    // The next heartbeat reports the reclaimable bytes upstream.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let volume_id = fid.split(',').next().unwrap().parse::<u32>().unwrap();
    let topology = cluster.master.topology.read().await;
    let status = topology.to_status();
    drop(topology);
    assert!(status["maxVolumeId"].as_u64().unwrap() >= volume_id as u64);
}

#[tokio::test]
async fn test_wrong_cookie_is_rejected() {
    let cluster = start_cluster().await;
    let client = reqwest::Client::new();
    let (fid, url) = assign(&client, &cluster).await;

    client
        .put(format!("http://{}/{}", url, fid))
        .body("secret bytes")
        .send()
        .await
        .unwrap();

    // Same volume and needle id, forged cookie.
    let parsed = needlehouse_core::FileId::parse(&fid).unwrap();
    let forged = needlehouse_core::FileId::new(
        parsed.volume_id,
        parsed.needle_id,
        parsed.cookie.wrapping_add(1),
    );
    let got = client
        .get(format!("http://{}/{}", url, forged))
        .send()
        .await
        .unwrap();
    assert_eq!(got.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_vacuum_reclaims_deleted_space() {
    let cluster = start_cluster().await;
    let client = reqwest::Client::new();

    // Fill one volume with 200 needles of 1 KiB, then delete half.
    let (first_fid, url) = assign(&client, &cluster).await;
    let volume_id = first_fid.split(',').next().unwrap().to_string();
    let payload = vec![0x5au8; 1024];
    let mut fids = vec![first_fid.clone()];
    for _ in 0..199 {
        let (fid, _) = assign(&client, &cluster).await;
        fids.push(fid);
    }
    // Keep only fids on the first volume so the ratio math is exact.
    fids.retain(|fid| fid.starts_with(&format!("{},", volume_id)));
    for fid in &fids {
        client
            .put(format!("http://{}/{}", url, fid))
            .body(payload.clone())
            .send()
            .await
            .unwrap();
    }
    for fid in fids.iter().take(fids.len() / 2) {
        client
            .delete(format!("http://{}/{}", url, fid))
            .send()
            .await
            .unwrap();
    }
    // Let a heartbeat carry the delete counters to the master.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let vacuum: serde_json::Value = client
        .post(format!(
            "{}/vol/vacuum?garbageThreshold=0.3",
            cluster.master_base
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let reclaimed = vacuum["reclaimedBytes"].as_u64().unwrap();
    let expected = (fids.len() / 2) as u64 * 1024;
    assert!(
        reclaimed >= expected,
        "vacuum reclaimed {} bytes, expected at least {}",
        reclaimed,
        expected
    );

    // Every surviving needle is still readable.
    for fid in fids.iter().skip(fids.len() / 2) {
        let got = client
            .get(format!("http://{}/{}", url, fid))
            .send()
            .await
            .unwrap();
        assert!(got.status().is_success(), "lost {} after vacuum", fid);
    }
}
