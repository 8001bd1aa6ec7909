//! gRPC surface of the master: heartbeats in, location updates out.

use std::sync::Arc;

use needlehouse_core::{ReplicaPlacement, Ttl};
use needlehouse_proto::master::master_server::Master as MasterGrpc;
use needlehouse_proto::master::{ClientHello, Heartbeat, HeartbeatResponse, VolumeLocation};
use needlehouse_topology::{HeartbeatInfo, VolumeInfo};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use crate::server::Master;

pub struct MasterRpcService {
    master: Arc<Master>,
}

impl MasterRpcService {
    pub fn new(master: Arc<Master>) -> Self {
        Self { master }
    }
}

#[tonic::async_trait]
impl MasterGrpc for MasterRpcService {
    async fn send_heartbeat(
        &self,
        request: Request<Heartbeat>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let master = &self.master;
        if !master.consensus.is_leader() {
            // Tell the volume server where to re-register.
            return Ok(Response::new(HeartbeatResponse {
                volume_size_limit: master.config.volume_size_limit(),
                leader: master.consensus.leader_hint().unwrap_or_default(),
            }));
        }

        let heartbeat = request.into_inner();
        let info = heartbeat_to_info(heartbeat)?;
        debug!(url = %format!("{}:{}", info.ip, info.port), volumes = info.volumes.len(), "heartbeat");
        master.register_heartbeat(info).await;
        Ok(Response::new(HeartbeatResponse {
            volume_size_limit: master.config.volume_size_limit(),
            leader: String::new(),
        }))
    }

    type KeepConnectedStream = ReceiverStream<Result<VolumeLocation, Status>>;

    async fn keep_connected(
        &self,
        request: Request<Streaming<ClientHello>>,
    ) -> Result<Response<Self::KeepConnectedStream>, Status> {
        let mut hello_stream = request.into_inner();
        let hello = hello_stream
            .next()
            .await
            .ok_or_else(|| Status::invalid_argument("expected a client hello"))??;
        let name = if hello.client_name.is_empty() {
            format!("anonymous-{:08x}", rand::random::<u32>())
        } else {
            hello.client_name
        };
        info!(client = %name, "location subscriber connected");

        let mut updates = self.master.notifications.subscribe(&name);
        let snapshot = self.master.location_snapshot().await;
        let (tx, rx) = mpsc::channel(16);
        let master = Arc::clone(&self.master);
        let client = name.clone();
        tokio::spawn(async move {
            // Full picture first, then deltas.
            for location in snapshot {
                if tx.send(Ok(location)).await.is_err() {
                    master.notifications.unsubscribe(&client);
                    return;
                }
            }
            while let Some(delta) = updates.recv().await {
                let message = VolumeLocation {
                    url: delta.url,
                    public_url: delta.public_url,
                    new_vids: delta.new_vids,
                    deleted_vids: delta.deleted_vids,
                };
                if tx.send(Ok(message)).await.is_err() {
                    break;
                }
            }
            master.notifications.unsubscribe(&client);
            debug!(client = %client, "location subscriber disconnected");
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

fn heartbeat_to_info(heartbeat: Heartbeat) -> Result<HeartbeatInfo, Status> {
    let mut volumes = Vec::with_capacity(heartbeat.volumes.len());
    for volume in heartbeat.volumes {
        let ttl = Ttl::parse(&volume.ttl)
            .map_err(|err| Status::invalid_argument(format!("volume {}: {}", volume.id, err)))?;
        if volume.replica_placement > u8::MAX as u32 {
            warn!(volume = volume.id, "heartbeat carries invalid replica placement");
            return Err(Status::invalid_argument("replica placement out of range"));
        }
        volumes.push(VolumeInfo {
            id: volume.id,
            size: volume.size,
            collection: volume.collection,
            file_count: volume.file_count,
            delete_count: volume.delete_count,
            deleted_bytes: volume.deleted_byte_count,
            read_only: volume.read_only,
            replica_placement: ReplicaPlacement::from_byte(volume.replica_placement as u8),
            ttl,
            version: volume.version as u8,
            compact_revision: volume.compact_revision as u16,
        });
    }
    Ok(HeartbeatInfo {
        ip: heartbeat.ip,
        port: heartbeat.port as u16,
        public_url: heartbeat.public_url,
        data_center: heartbeat.data_center,
        rack: heartbeat.rack,
        max_volume_count: heartbeat.max_volume_count as u64,
        volumes,
    })
}
