//! End-to-end tests of the volume sync protocol: a leader store served
//! over real gRPC on loopback, reconciled into follower volumes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use needlehouse_core::{Needle, ReplicaPlacement, Ttl};
use needlehouse_proto::volume::volume_server_server::VolumeServerServer;
use needlehouse_storage::{
    synchronize, IndexKind, Location, Store, StoreIdentity, SyncConfig, SyncPolicy, Volume,
    VolumeOptions, VolumeRpcService,
};
use tokio_stream::wrappers::TcpListenerStream;

fn test_options() -> VolumeOptions {
    VolumeOptions {
        index_kind: IndexKind::BTree,
        size_limit: 0,
        sync_policy: SyncPolicy::Never,
    }
}

fn needle(id: u64, body: &str) -> Needle {
    Needle::new(id, 0xbeef, Bytes::copy_from_slice(body.as_bytes()))
}

/// Serve `store` on an ephemeral loopback port; returns its endpoint URL.
async fn serve(store: Arc<Store>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(VolumeServerServer::new(VolumeRpcService::new(store)))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });
    // Give the server a moment to start accepting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("http://{}", addr)
}

fn leader_store(dir: &std::path::Path) -> Arc<Store> {
    Arc::new(
        Store::open(
            StoreIdentity::default(),
            vec![Location {
                directory: dir.to_path_buf(),
                max_volume_count: 8,
            }],
            test_options(),
        )
        .unwrap(),
    )
}

fn live_set(volume: &Volume) -> BTreeMap<u64, Bytes> {
    volume
        .index_snapshot()
        .into_iter()
        .map(|(id, _)| (id, volume.read(id, 0xbeef).unwrap().data))
        .collect()
}

#[tokio::test]
async fn test_sync_from_empty_follower() {
    let leader_dir = tempfile::tempdir().unwrap();
    let store = leader_store(leader_dir.path());
    store
        .add_volume(1, "", ReplicaPlacement::default(), Ttl::NONE)
        .unwrap();
    let leader = store.get_volume(1).unwrap();
    for id in 1..=20u64 {
        leader.write(&needle(id, &format!("needle-{id}"))).unwrap();
    }
    for id in [3u64, 7, 11] {
        leader.delete(id, 0xbeef).unwrap();
    }
    let endpoint = serve(store).await;

    let follower_dir = tempfile::tempdir().unwrap();
    let follower = Volume::create(
        follower_dir.path(),
        1,
        "",
        ReplicaPlacement::default(),
        Ttl::NONE,
        test_options(),
    )
    .unwrap();

    synchronize(&follower, &endpoint, &SyncConfig::default())
        .await
        .unwrap();

    assert_eq!(live_set(&follower), live_set(&leader));
    assert_eq!(follower.live_count(), 17);
}

#[tokio::test]
async fn test_sync_applies_remote_deletes_locally() {
    let leader_dir = tempfile::tempdir().unwrap();
    let store = leader_store(leader_dir.path());
    store
        .add_volume(1, "", ReplicaPlacement::default(), Ttl::NONE)
        .unwrap();
    let leader = store.get_volume(1).unwrap();
    for id in 1..=5u64 {
        leader.write(&needle(id, &format!("v{id}"))).unwrap();
    }
    let endpoint = serve(store.clone()).await;

    let follower_dir = tempfile::tempdir().unwrap();
    let follower = Volume::create(
        follower_dir.path(),
        1,
        "",
        ReplicaPlacement::default(),
        Ttl::NONE,
        test_options(),
    )
    .unwrap();
    synchronize(&follower, &endpoint, &SyncConfig::default())
        .await
        .unwrap();
    assert_eq!(follower.live_count(), 5);

    // Leader moves on: one delete, one new write.
    leader.delete(2, 0xbeef).unwrap();
    leader.write(&needle(6, "v6")).unwrap();

    synchronize(&follower, &endpoint, &SyncConfig::default())
        .await
        .unwrap();
    assert_eq!(live_set(&follower), live_set(&leader));
    assert!(follower.read(2, 0xbeef).is_err());
    assert_eq!(follower.read(6, 0xbeef).unwrap().data, Bytes::from("v6"));
}

#[tokio::test]
async fn test_sync_catches_up_through_leader_compaction() {
    let leader_dir = tempfile::tempdir().unwrap();
    let store = leader_store(leader_dir.path());
    store
        .add_volume(1, "", ReplicaPlacement::default(), Ttl::NONE)
        .unwrap();
    let leader = store.get_volume(1).unwrap();
    for id in 1..=100u64 {
        leader.write(&needle(id, &format!("original-{id}"))).unwrap();
    }
    let endpoint = serve(store.clone()).await;

    // Follower converges, then goes offline.
    let follower_dir = tempfile::tempdir().unwrap();
    let follower = Volume::create(
        follower_dir.path(),
        1,
        "",
        ReplicaPlacement::default(),
        Ttl::NONE,
        test_options(),
    )
    .unwrap();
    synchronize(&follower, &endpoint, &SyncConfig::default())
        .await
        .unwrap();
    assert_eq!(follower.live_count(), 100);

    // While the follower is away: 100 new needles, 50 deletes, compaction.
    for id in 101..=200u64 {
        leader.write(&needle(id, &format!("new-{id}"))).unwrap();
    }
    for id in 1..=50u64 {
        leader.delete(id, 0xbeef).unwrap();
    }
    leader.compact().unwrap();
    leader.commit_compact().unwrap();
    assert_eq!(leader.compact_revision(), 1);

    synchronize(&follower, &endpoint, &SyncConfig::default())
        .await
        .unwrap();

    assert_eq!(live_set(&follower), live_set(&leader));
    assert_eq!(follower.live_count(), 150);
    assert_eq!(follower.compact_revision(), 1);
}

#[tokio::test]
async fn test_tail_follow_picks_up_new_writes() {
    let leader_dir = tempfile::tempdir().unwrap();
    let store = leader_store(leader_dir.path());
    store
        .add_volume(1, "", ReplicaPlacement::default(), Ttl::NONE)
        .unwrap();
    let leader = store.get_volume(1).unwrap();
    leader.write(&needle(1, "first")).unwrap();
    let endpoint = serve(store.clone()).await;

    let follower_dir = tempfile::tempdir().unwrap();
    let follower = Arc::new(
        Volume::create(
            follower_dir.path(),
            1,
            "",
            ReplicaPlacement::default(),
            Ttl::NONE,
            test_options(),
        )
        .unwrap(),
    );
    synchronize(&follower, &endpoint, &SyncConfig::default())
        .await
        .unwrap();
    assert_eq!(follower.live_count(), 1);

    let follow_handle = tokio::spawn({
        let follower = Arc::clone(&follower);
        let endpoint = endpoint.clone();
        async move {
            needlehouse_storage::follow(
                &follower,
                &endpoint,
                Duration::from_millis(50),
                &SyncConfig::default(),
            )
            .await;
        }
    });

    // New appends on the leader show up on the follower without another
    // explicit synchronize call.
    leader.write(&needle(2, "second")).unwrap();
    leader.write(&needle(3, "third")).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while follower.live_count() < 3 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "tail follow never caught up"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(follower.read(3, 0xbeef).unwrap().data, Bytes::from("third"));
    follow_handle.abort();
}

#[tokio::test]
async fn test_sync_unknown_volume_exhausts_retries() {
    let leader_dir = tempfile::tempdir().unwrap();
    let store = leader_store(leader_dir.path());
    let endpoint = serve(store).await;

    let follower_dir = tempfile::tempdir().unwrap();
    let follower = Volume::create(
        follower_dir.path(),
        42,
        "",
        ReplicaPlacement::default(),
        Ttl::NONE,
        test_options(),
    )
    .unwrap();

    let config = SyncConfig {
        attempts: 2,
        backoff: Duration::from_millis(10),
    };
    let err = synchronize(&follower, &endpoint, &config).await.unwrap_err();
    assert!(err.to_string().contains("after 2 attempts"), "{err}");
}
