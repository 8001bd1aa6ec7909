//! Volume Store - All Volumes on One Node
//!
//! A `Store` owns every volume a volume server hosts, spread across one or
//! more data directories, each with its own volume-count budget. It is the
//! unit the master reasons about: the store's identity (ip, port, data
//! center, rack) plus the status of each volume is exactly what goes into
//! a heartbeat.
//!
//! On open the store discovers `<collection>_<id>.dat` / `<id>.dat` pairs
//! in each directory, deletes scratch files left behind by a crashed
//! compaction, and opens each volume (which runs its own crash recovery).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use needlehouse_core::needle::VolumeId;
use needlehouse_core::{ReplicaPlacement, Ttl};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::volume::{Volume, VolumeOptions};

/// One data directory and its volume budget.
#[derive(Debug, Clone)]
pub struct Location {
    pub directory: PathBuf,
    pub max_volume_count: usize,
}

/// Identity reported in every heartbeat.
#[derive(Debug, Clone, Default)]
pub struct StoreIdentity {
    pub ip: String,
    pub port: u16,
    pub public_url: String,
    pub data_center: String,
    pub rack: String,
}

/// Per-volume inventory line of a heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeStatus {
    pub id: VolumeId,
    pub size: u64,
    pub collection: String,
    pub file_count: u64,
    pub delete_count: u64,
    pub deleted_bytes: u64,
    pub read_only: bool,
    pub replica_placement: ReplicaPlacement,
    pub version: u8,
    pub ttl: Ttl,
    pub compact_revision: u16,
}

pub struct Store {
    identity: StoreIdentity,
    locations: Vec<Location>,
    options: VolumeOptions,
    volumes: RwLock<HashMap<VolumeId, Arc<Volume>>>,
}

impl Store {
    /// Open every volume found under the configured directories.
    pub fn open(
        identity: StoreIdentity,
        locations: Vec<Location>,
        options: VolumeOptions,
    ) -> Result<Self> {
        let mut volumes = HashMap::new();
        for location in &locations {
            std::fs::create_dir_all(&location.directory)?;
            for entry in std::fs::read_dir(&location.directory)? {
                let path = entry?.path();
                match path.extension().and_then(|e| e.to_str()) {
                    Some("dat") => {}
                    // Scratch from a compaction that never committed.
                    Some("cpd") | Some("cpx") => {
                        warn!(path = %path.display(), "removing stale compaction scratch");
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    _ => continue,
                }
                let Some((collection, id)) = parse_volume_file_name(&path) else {
                    warn!(path = %path.display(), "skipping unrecognized data file");
                    continue;
                };
                let volume =
                    Volume::open(&location.directory, id, &collection, options.clone())?;
                volumes.insert(id, Arc::new(volume));
            }
        }
        info!(
            volumes = volumes.len(),
            directories = locations.len(),
            "store opened"
        );
        Ok(Self {
            identity,
            locations,
            options,
            volumes: RwLock::new(volumes),
        })
    }

    pub fn identity(&self) -> &StoreIdentity {
        &self.identity
    }

    /// Total volume budget across all directories.
    pub fn max_volume_count(&self) -> usize {
        self.locations.iter().map(|l| l.max_volume_count).sum()
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.read().len()
    }

    pub fn has_volume(&self, id: VolumeId) -> bool {
        self.volumes.read().contains_key(&id)
    }

    pub fn get_volume(&self, id: VolumeId) -> Option<Arc<Volume>> {
        self.volumes.read().get(&id).cloned()
    }

    /// Create a new empty volume in the least-loaded directory with spare
    /// budget.
    pub fn add_volume(
        &self,
        id: VolumeId,
        collection: &str,
        replica_placement: ReplicaPlacement,
        ttl: Ttl,
    ) -> Result<()> {
        if self.has_volume(id) {
            return Err(Error::VolumeExists(id));
        }
        let counts = self.per_location_counts();
        let location = self
            .locations
            .iter()
            .enumerate()
            .filter(|(i, l)| counts[*i] < l.max_volume_count)
            .min_by_key(|(i, _)| counts[*i])
            .map(|(_, l)| l)
            .ok_or(Error::NoFreeLocation)?;

        let volume = Volume::create(
            &location.directory,
            id,
            collection,
            replica_placement,
            ttl,
            self.options.clone(),
        )?;
        self.volumes.write().insert(id, Arc::new(volume));
        Ok(())
    }

    /// Drop and erase every volume belonging to `collection`.
    pub fn delete_collection(&self, collection: &str) -> Result<usize> {
        let doomed: Vec<Arc<Volume>> = {
            let mut volumes = self.volumes.write();
            let ids: Vec<VolumeId> = volumes
                .values()
                .filter(|v| v.collection() == collection)
                .map(|v| v.id())
                .collect();
            ids.iter().filter_map(|id| volumes.remove(id)).collect()
        };
        let count = doomed.len();
        for volume in doomed {
            volume.destroy()?;
        }
        info!(collection, count, "deleted collection");
        Ok(count)
    }

    /// Inventory for the next heartbeat.
    pub fn status(&self) -> Vec<VolumeStatus> {
        let volumes = self.volumes.read();
        let mut status: Vec<VolumeStatus> = volumes
            .values()
            .map(|v| {
                let stats = v.stats();
                VolumeStatus {
                    id: v.id(),
                    size: v.size(),
                    collection: v.collection().to_string(),
                    file_count: v.live_count(),
                    delete_count: stats.delete_count,
                    deleted_bytes: stats.deleted_bytes,
                    read_only: v.is_read_only(),
                    replica_placement: v.replica_placement(),
                    version: v.version(),
                    ttl: v.ttl(),
                    compact_revision: v.compact_revision(),
                }
            })
            .collect();
        status.sort_by_key(|s| s.id);
        status
    }

    /// Flush every volume (shutdown path).
    pub fn flush(&self) -> Result<()> {
        for volume in self.volumes.read().values() {
            volume.flush()?;
        }
        Ok(())
    }

    fn per_location_counts(&self) -> Vec<usize> {
        let volumes = self.volumes.read();
        self.locations
            .iter()
            .map(|l| {
                volumes
                    .values()
                    .filter(|v| v.directory() == l.directory.as_path())
                    .count()
            })
            .collect()
    }
}

/// `"photos_7.dat"` → `("photos", 7)`; `"7.dat"` → `("", 7)`.
fn parse_volume_file_name(path: &std::path::Path) -> Option<(String, VolumeId)> {
    let stem = path.file_stem()?.to_str()?;
    match stem.rsplit_once('_') {
        Some((collection, id)) => Some((collection.to_string(), id.parse().ok()?)),
        None => Some((String::new(), stem.parse().ok()?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::SyncPolicy;
    use crate::IndexKind;
    use bytes::Bytes;
    use needlehouse_core::Needle;

    fn test_options() -> VolumeOptions {
        VolumeOptions {
            index_kind: IndexKind::Memory,
            size_limit: 0,
            sync_policy: SyncPolicy::Never,
        }
    }

    fn test_store(dir: &std::path::Path, max: usize) -> Store {
        Store::open(
            StoreIdentity {
                ip: "127.0.0.1".into(),
                port: 8080,
                public_url: "127.0.0.1:8080".into(),
                data_center: "dc1".into(),
                rack: "rack1".into(),
            },
            vec![Location {
                directory: dir.to_path_buf(),
                max_volume_count: max,
            }],
            test_options(),
        )
        .unwrap()
    }

    #[test]
    fn test_add_volume_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path(), 4);
        store
            .add_volume(1, "", ReplicaPlacement::default(), Ttl::NONE)
            .unwrap();
        store
            .add_volume(2, "photos", ReplicaPlacement::parse("001").unwrap(), Ttl::NONE)
            .unwrap();

        let volume = store.get_volume(1).unwrap();
        volume
            .write(&Needle::new(1, 7, Bytes::from("hello world")))
            .unwrap();
        volume.delete(1, 7).unwrap();

        let status = store.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].id, 1);
        assert!(status[0].deleted_bytes >= 11);
        assert_eq!(status[1].collection, "photos");
        assert_eq!(status[1].replica_placement.to_string(), "001");
    }

    #[test]
    fn test_volume_budget_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path(), 1);
        store
            .add_volume(1, "", ReplicaPlacement::default(), Ttl::NONE)
            .unwrap();
        assert!(matches!(
            store
                .add_volume(2, "", ReplicaPlacement::default(), Ttl::NONE)
                .unwrap_err(),
            Error::NoFreeLocation
        ));
    }

    #[test]
    fn test_duplicate_volume_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path(), 4);
        store
            .add_volume(1, "", ReplicaPlacement::default(), Ttl::NONE)
            .unwrap();
        assert!(matches!(
            store
                .add_volume(1, "", ReplicaPlacement::default(), Ttl::NONE)
                .unwrap_err(),
            Error::VolumeExists(1)
        ));
    }

    #[test]
    fn test_reopen_discovers_volumes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = test_store(dir.path(), 4);
            store
                .add_volume(3, "", ReplicaPlacement::default(), Ttl::NONE)
                .unwrap();
            store
                .add_volume(4, "photos", ReplicaPlacement::default(), Ttl::NONE)
                .unwrap();
            store
                .get_volume(3)
                .unwrap()
                .write(&Needle::new(9, 1, Bytes::from("persisted")))
                .unwrap();
            store.flush().unwrap();
        }
        let store = test_store(dir.path(), 4);
        assert_eq!(store.volume_count(), 2);
        assert!(store.has_volume(3));
        assert!(store.has_volume(4));
        assert_eq!(
            store.get_volume(3).unwrap().read(9, 1).unwrap().data,
            Bytes::from("persisted")
        );
        assert_eq!(store.get_volume(4).unwrap().collection(), "photos");
    }

    #[test]
    fn test_delete_collection() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path(), 8);
        for id in 1..=3 {
            store
                .add_volume(id, "photos", ReplicaPlacement::default(), Ttl::NONE)
                .unwrap();
        }
        store
            .add_volume(9, "", ReplicaPlacement::default(), Ttl::NONE)
            .unwrap();

        assert_eq!(store.delete_collection("photos").unwrap(), 3);
        assert_eq!(store.volume_count(), 1);
        assert!(store.has_volume(9));
        // Files are gone from disk
        let remaining: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("photos_"))
            .collect();
        assert!(remaining.is_empty());
    }

    #[test]
    fn test_parse_volume_file_name() {
        use std::path::Path;
        assert_eq!(
            parse_volume_file_name(Path::new("/data/7.dat")),
            Some(("".into(), 7))
        );
        assert_eq!(
            parse_volume_file_name(Path::new("/data/photos_12.dat")),
            Some(("photos".into(), 12))
        );
        assert_eq!(parse_volume_file_name(Path::new("/data/junk.dat")), None);
    }
}
