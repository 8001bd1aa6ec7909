//! gRPC service exposed by every volume server.
//!
//! Serves the sync protocol (`VolumeSyncStatus` / `VolumeSyncIndex` /
//! `VolumeSyncData`) plus the master's volume lifecycle directives
//! (`AllocateVolume`, `VacuumVolume`, `DeleteCollection`) on top of a
//! [`Store`]. Streaming responses go through a bounded channel so a slow
//! peer applies backpressure instead of buffering a whole volume.

use std::sync::Arc;

use needlehouse_core::{ReplicaPlacement, Ttl};
use needlehouse_proto::volume::volume_server_server::VolumeServer;
use needlehouse_proto::volume::{
    AllocateVolumeRequest, AllocateVolumeResponse, DeleteCollectionRequest,
    DeleteCollectionResponse, VacuumVolumeRequest, VacuumVolumeResponse, VolumeSyncDataRequest,
    VolumeSyncDataResponse, VolumeSyncIndexRequest, VolumeSyncIndexResponse,
    VolumeSyncStatusRequest, VolumeSyncStatusResponse,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::store::Store;
use crate::volume::Volume;

/// Chunk size for needle content streaming.
const DATA_CHUNK_SIZE: usize = 64 * 1024;

pub struct VolumeRpcService {
    store: Arc<Store>,
}

impl VolumeRpcService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    fn volume(&self, id: u32) -> Result<Arc<Volume>, Status> {
        self.store
            .get_volume(id)
            .ok_or_else(|| Status::not_found(format!("volume {} not found", id)))
    }
}

#[tonic::async_trait]
impl VolumeServer for VolumeRpcService {
    async fn volume_sync_status(
        &self,
        request: Request<VolumeSyncStatusRequest>,
    ) -> Result<Response<VolumeSyncStatusResponse>, Status> {
        let volume = self.volume(request.into_inner().volume_id)?;
        Ok(Response::new(VolumeSyncStatusResponse {
            volume_id: volume.id(),
            tail_offset: volume.size(),
            idx_file_size: volume.idx_file_size(),
            collection: volume.collection().to_string(),
            compact_revision: volume.compact_revision() as u32,
            ttl: volume.ttl().to_string(),
            replication: volume.replica_placement().to_string(),
        }))
    }

    type VolumeSyncIndexStream = ReceiverStream<Result<VolumeSyncIndexResponse, Status>>;

    async fn volume_sync_index(
        &self,
        request: Request<VolumeSyncIndexRequest>,
    ) -> Result<Response<Self::VolumeSyncIndexStream>, Status> {
        let volume = self.volume(request.into_inner().volume_id)?;
        let entries = volume.index_snapshot();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            for (needle_id, entry) in entries {
                let message = VolumeSyncIndexResponse {
                    needle_id,
                    offset: entry.offset,
                    size: entry.size,
                };
                if tx.send(Ok(message)).await.is_err() {
                    return; // peer hung up
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type VolumeSyncDataStream = ReceiverStream<Result<VolumeSyncDataResponse, Status>>;

    async fn volume_sync_data(
        &self,
        request: Request<VolumeSyncDataRequest>,
    ) -> Result<Response<Self::VolumeSyncDataStream>, Status> {
        let request = request.into_inner();
        let volume = self.volume(request.volume_id)?;

        // Offsets from another compaction generation point at garbage.
        let current = volume.compact_revision() as u32;
        if request.revision != current {
            return Err(Status::failed_precondition(format!(
                "compaction revision mismatch: requested {}, current {}",
                request.revision, current
            )));
        }

        let bytes = volume
            .read_raw(request.offset, request.size)
            .map_err(|err| Status::internal(err.to_string()))?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for chunk in bytes.chunks(DATA_CHUNK_SIZE) {
                let message = VolumeSyncDataResponse {
                    file_content: chunk.to_vec(),
                };
                if tx.send(Ok(message)).await.is_err() {
                    return;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn allocate_volume(
        &self,
        request: Request<AllocateVolumeRequest>,
    ) -> Result<Response<AllocateVolumeResponse>, Status> {
        let request = request.into_inner();
        let replica_placement = ReplicaPlacement::parse(&request.replication)
            .map_err(|err| Status::invalid_argument(err.to_string()))?;
        let ttl = Ttl::parse(&request.ttl)
            .map_err(|err| Status::invalid_argument(err.to_string()))?;
        self.store
            .add_volume(request.volume_id, &request.collection, replica_placement, ttl)
            .map_err(|err| Status::internal(err.to_string()))?;
        info!(volume = request.volume_id, collection = %request.collection, "allocated volume");
        Ok(Response::new(AllocateVolumeResponse {}))
    }

    async fn vacuum_volume(
        &self,
        request: Request<VacuumVolumeRequest>,
    ) -> Result<Response<VacuumVolumeResponse>, Status> {
        let volume = self.volume(request.into_inner().volume_id)?;
        // Compaction is file-heavy; keep it off the RPC worker threads.
        let reclaimed = tokio::task::spawn_blocking(move || -> crate::Result<u64> {
            volume.compact()?;
            volume.commit_compact()
        })
        .await
        .map_err(|err| Status::internal(err.to_string()))?
        .map_err(|err| {
            warn!(error = %err, "vacuum failed");
            Status::internal(err.to_string())
        })?;
        Ok(Response::new(VacuumVolumeResponse {
            reclaimed_bytes: reclaimed,
        }))
    }

    async fn delete_collection(
        &self,
        request: Request<DeleteCollectionRequest>,
    ) -> Result<Response<DeleteCollectionResponse>, Status> {
        let collection = request.into_inner().collection;
        let deleted = self
            .store
            .delete_collection(&collection)
            .map_err(|err| Status::internal(err.to_string()))?;
        Ok(Response::new(DeleteCollectionResponse {
            deleted_volume_count: deleted as u32,
        }))
    }
}
