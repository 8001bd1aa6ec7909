//! Volume behavior across every index backend: the contract is identical
//! whichever map sits behind the volume.

use bytes::Bytes;
use needlehouse_core::{Needle, ReplicaPlacement, Ttl};
use needlehouse_storage::volume::VolumeOptions;
use needlehouse_storage::{IndexKind, SyncPolicy, Volume};

const BACKENDS: [IndexKind; 3] = [IndexKind::Memory, IndexKind::BTree, IndexKind::SortedString];

fn options(kind: IndexKind) -> VolumeOptions {
    VolumeOptions {
        index_kind: kind,
        size_limit: 0,
        sync_policy: SyncPolicy::Never,
    }
}

fn needle(id: u64, body: &str) -> Needle {
    Needle::new(id, 0xfeed, Bytes::copy_from_slice(body.as_bytes()))
}

#[test]
fn write_read_delete_behaves_identically_across_backends() {
    for kind in BACKENDS {
        let dir = tempfile::tempdir().unwrap();
        let volume = Volume::create(
            dir.path(),
            1,
            "",
            ReplicaPlacement::default(),
            Ttl::NONE,
            options(kind),
        )
        .unwrap();

        for id in 1..=50u64 {
            volume.write(&needle(id, &format!("payload-{id}"))).unwrap();
        }
        for id in (1..=50u64).filter(|id| id % 5 == 0) {
            volume.delete(id, 0xfeed).unwrap();
        }
        assert_eq!(volume.live_count(), 40, "{kind:?}");
        for id in 1..=50u64 {
            let read = volume.read(id, 0xfeed);
            if id % 5 == 0 {
                assert!(read.is_err(), "{kind:?}: {id} should be deleted");
            } else {
                assert_eq!(
                    read.unwrap().data,
                    Bytes::copy_from_slice(format!("payload-{id}").as_bytes()),
                    "{kind:?}"
                );
            }
        }
    }
}

#[test]
fn persisted_index_reloads_identically_across_backends() {
    for kind in BACKENDS {
        let dir = tempfile::tempdir().unwrap();
        {
            let volume = Volume::create(
                dir.path(),
                1,
                "photos",
                ReplicaPlacement::parse("001").unwrap(),
                Ttl::parse("3d").unwrap(),
                options(kind),
            )
            .unwrap();
            for id in 1..=30u64 {
                volume.write(&needle(id, &format!("v{id}"))).unwrap();
            }
            volume.write(&needle(7, "overwritten")).unwrap();
            volume.delete(9, 0xfeed).unwrap();
            volume.flush().unwrap();
        }
        // Reload with every backend; the journal is backend-agnostic.
        for reload_kind in BACKENDS {
            let volume = Volume::open(dir.path(), 1, "photos", options(reload_kind)).unwrap();
            assert_eq!(volume.live_count(), 29, "{kind:?} -> {reload_kind:?}");
            assert_eq!(
                volume.read(7, 0xfeed).unwrap().data,
                Bytes::from("overwritten"),
                "{kind:?} -> {reload_kind:?}"
            );
            assert!(volume.read(9, 0xfeed).is_err());
            assert_eq!(volume.replica_placement().to_string(), "001");
            assert_eq!(volume.ttl().to_string(), "3d");
        }
    }
}

#[test]
fn compaction_works_across_backends() {
    for kind in BACKENDS {
        let dir = tempfile::tempdir().unwrap();
        let volume = Volume::create(
            dir.path(),
            1,
            "",
            ReplicaPlacement::default(),
            Ttl::NONE,
            options(kind),
        )
        .unwrap();
        // 1000 needles of 1 KiB, half deleted: roughly half the file is
        // garbage afterwards.
        let payload = "k".repeat(1024);
        for id in 1..=1000u64 {
            volume.write(&needle(id, &payload)).unwrap();
        }
        for id in 1..=500u64 {
            volume.delete(id, 0xfeed).unwrap();
        }
        let before = volume.size();
        assert!(volume.garbage_ratio() > 0.45, "{kind:?}");

        volume.compact().unwrap();
        let reclaimed = volume.commit_compact().unwrap();

        assert!(
            reclaimed >= 500 * 1024,
            "{kind:?}: reclaimed only {reclaimed}"
        );
        assert!(volume.size() < before - 500 * 1024, "{kind:?}");
        for id in 501..=1000u64 {
            assert_eq!(volume.read(id, 0xfeed).unwrap().data.len(), 1024, "{kind:?}");
        }
        for id in 1..=500u64 {
            assert!(volume.read(id, 0xfeed).is_err(), "{kind:?}");
        }
    }
}
