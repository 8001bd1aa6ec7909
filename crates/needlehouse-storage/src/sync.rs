//! Volume-to-Volume Incremental Synchronization
//!
//! Reconciles a local follower volume with a remote leader volume holding
//! the same volume id. The leader may have been written to, deleted from,
//! and compacted any number of times since the follower last saw it.
//!
//! ## Protocol
//!
//! 1. Fetch a snapshot from the leader: its live index entries plus the
//!    current compact revision (`VolumeSyncStatus` + `VolumeSyncIndex`).
//! 2. If this is a retry and the leader's compact revision moved since the
//!    previous attempt, every offset we hold is stale: compact the local
//!    volume (which also resets its own revision bookkeeping) and restart
//!    from the snapshot.
//! 3. Diff: entries the leader has and we don't become fetches; entries we
//!    have and the leader doesn't become local deletes (size 0 in the
//!    delta).
//! 4. Sort the delta by the leader's offsets so our appends land in the
//!    same order as the leader's file.
//! 5. Apply each entry: local delete, or stream the record bytes with
//!    `VolumeSyncData` (the leader rejects the request if its revision
//!    moved) and append + publish locally.
//!
//! A failed fetch aborts the attempt before the index is touched; bytes
//! already appended become garbage for the next compaction to sweep. The
//! whole procedure retries up to [`SyncConfig::attempts`] times with a
//! jittered pause between attempts.

use std::collections::BTreeMap;
use std::time::Duration;

use needlehouse_core::needle::{NeedleId, NEEDLE_PADDING};
use needlehouse_proto::volume::volume_server_client::VolumeServerClient;
use needlehouse_proto::volume::{
    VolumeSyncDataRequest, VolumeSyncIndexRequest, VolumeSyncStatusRequest,
};
use rand::Rng;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::index::{IndexEntry, TOMBSTONE_SIZE};
use crate::volume::Volume;

/// Retry policy for one `synchronize` call.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Bring `volume` up to date with its replica on `peer` (a gRPC endpoint
/// such as `http://10.0.0.5:18080`).
pub async fn synchronize(volume: &Volume, peer: &str, config: &SyncConfig) -> Result<()> {
    let mut client = VolumeServerClient::connect(peer.to_string())
        .await
        .map_err(Error::Transport)?;

    let mut last_error = String::new();
    for attempt in 1..=config.attempts.max(1) {
        let snapshot = match fetch_snapshot(&mut client, volume.id()).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                last_error = err.to_string();
                warn!(volume = volume.id(), peer, attempt, error = %err, "snapshot fetch failed");
                pause(config).await;
                continue;
            }
        };

        // The local superblock remembers which compaction generation this
        // replica last converged at. A leader ahead of it has dropped
        // garbage we still carry; compact locally before diffing so both
        // files stay equivalent generation by generation.
        if (volume.compact_revision() as u32) < snapshot.compact_revision {
            info!(
                volume = volume.id(),
                peer,
                local = volume.compact_revision(),
                remote = snapshot.compact_revision,
                "leader compacted since last sync, compacting local volume"
            );
            volume.compact()?;
            volume.commit_compact()?;
        }

        match apply_delta(volume, &mut client, &snapshot).await {
            Ok(fetched) => {
                info!(volume = volume.id(), peer, attempt, fetched, "sync complete");
                return Ok(());
            }
            Err(err) => {
                last_error = err.to_string();
                warn!(volume = volume.id(), peer, attempt, error = %err, "sync attempt failed");
                pause(config).await;
            }
        }
    }
    Err(Error::SyncExhausted {
        peer: peer.to_string(),
        attempts: config.attempts,
        last: last_error,
    })
}

/// Keep following `peer`: re-synchronize whenever its tail or compact
/// revision moves. Runs until the task is aborted.
pub async fn follow(volume: &Volume, peer: &str, interval: Duration, config: &SyncConfig) {
    loop {
        tokio::time::sleep(interval).await;
        let behind = match peek_remote(volume, peer).await {
            Ok(behind) => behind,
            Err(err) => {
                warn!(volume = volume.id(), peer, error = %err, "tail-follow status check failed");
                continue;
            }
        };
        if !behind {
            continue;
        }
        if let Err(err) = synchronize(volume, peer, config).await {
            warn!(volume = volume.id(), peer, error = %err, "tail-follow sync failed");
        }
    }
}

struct Snapshot {
    entries: BTreeMap<NeedleId, IndexEntry>,
    compact_revision: u32,
    #[allow(dead_code)]
    tail_offset: u64,
}

async fn fetch_snapshot(
    client: &mut VolumeServerClient<Channel>,
    volume_id: u32,
) -> Result<Snapshot> {
    let status = client
        .volume_sync_status(VolumeSyncStatusRequest { volume_id })
        .await?
        .into_inner();

    let mut entries = BTreeMap::new();
    let mut stream = client
        .volume_sync_index(VolumeSyncIndexRequest { volume_id })
        .await?
        .into_inner();
    while let Some(message) = stream.message().await? {
        if message.offset > 0 && message.size != TOMBSTONE_SIZE {
            entries.insert(
                message.needle_id,
                IndexEntry::new(message.offset, message.size),
            );
        } else {
            entries.remove(&message.needle_id);
        }
    }
    debug!(
        volume = volume_id,
        entries = entries.len(),
        revision = status.compact_revision,
        "fetched leader snapshot"
    );
    Ok(Snapshot {
        entries,
        compact_revision: status.compact_revision,
        tail_offset: status.tail_offset,
    })
}

async fn apply_delta(
    volume: &Volume,
    client: &mut VolumeServerClient<Channel>,
    snapshot: &Snapshot,
) -> Result<u64> {
    let local: BTreeMap<NeedleId, IndexEntry> = volume.index_snapshot().into_iter().collect();

    // remote \ local → fetch; local \ remote → delete (size 0).
    let mut delta: Vec<(NeedleId, IndexEntry)> = Vec::new();
    for (id, entry) in &snapshot.entries {
        if !local.contains_key(id) {
            delta.push((*id, *entry));
        }
    }
    for (id, entry) in &local {
        if !snapshot.entries.contains_key(id) {
            delta.push((*id, IndexEntry::new(entry.offset, 0)));
        }
    }
    // Mirror the leader's on-disk append order.
    delta.sort_by_key(|(_, entry)| entry.offset);

    let mut fetched = 0u64;
    for (id, entry) in delta {
        if entry.size == 0 {
            volume.delete(id, 0)?;
            continue;
        }
        let bytes = fetch_needle(client, volume.id(), id, entry, snapshot.compact_revision).await?;
        let offset = volume.append_raw(&bytes)?;
        volume.put_index_entry(
            id,
            IndexEntry::new((offset / NEEDLE_PADDING as u64) as u32, entry.size),
        )?;
        fetched += 1;
    }
    Ok(fetched)
}

async fn fetch_needle(
    client: &mut VolumeServerClient<Channel>,
    volume_id: u32,
    needle_id: NeedleId,
    entry: IndexEntry,
    revision: u32,
) -> Result<Vec<u8>> {
    let mut stream = client
        .volume_sync_data(VolumeSyncDataRequest {
            volume_id,
            revision,
            offset: entry.offset,
            size: entry.size,
            needle_id,
        })
        .await?
        .into_inner();
    let mut bytes = Vec::new();
    while let Some(chunk) = stream.message().await? {
        bytes.extend_from_slice(&chunk.file_content);
    }
    Ok(bytes)
}

async fn peek_remote(volume: &Volume, peer: &str) -> Result<bool> {
    let mut client = VolumeServerClient::connect(peer.to_string())
        .await
        .map_err(Error::Transport)?;
    let status = client
        .volume_sync_status(VolumeSyncStatusRequest {
            volume_id: volume.id(),
        })
        .await?
        .into_inner();
    Ok(status.tail_offset != volume.size()
        || status.compact_revision != volume.compact_revision() as u32)
}

async fn pause(config: &SyncConfig) {
    let jitter = rand::thread_rng().gen_range(0..=config.backoff.as_millis().max(1) as u64 / 2);
    tokio::time::sleep(config.backoff + Duration::from_millis(jitter)).await;
}
