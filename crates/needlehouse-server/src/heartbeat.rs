//! Volume-server heartbeat loop.
//!
//! Every pulse the store's inventory goes to the current master over
//! gRPC. The response either confirms the master is the leader (and
//! carries the cluster volume size limit) or names the leader to talk to
//! instead; connection failures rotate through the configured master
//! list. The loop never gives up — a cluster with no reachable master
//! heals as soon as one comes back.

use std::sync::Arc;
use std::time::Duration;

use needlehouse_master::grpc_endpoint;
use needlehouse_proto::master::master_client::MasterClient;
use needlehouse_proto::master::{Heartbeat, VolumeInformation};
use needlehouse_storage::Store;
use tracing::{debug, info, warn};

pub fn build_heartbeat(store: &Store) -> Heartbeat {
    let identity = store.identity();
    Heartbeat {
        ip: identity.ip.clone(),
        port: identity.port as u32,
        public_url: identity.public_url.clone(),
        data_center: identity.data_center.clone(),
        rack: identity.rack.clone(),
        max_volume_count: store.max_volume_count() as u32,
        volumes: store
            .status()
            .into_iter()
            .map(|v| VolumeInformation {
                id: v.id,
                size: v.size,
                collection: v.collection,
                file_count: v.file_count,
                delete_count: v.delete_count,
                deleted_byte_count: v.deleted_bytes,
                read_only: v.read_only,
                replica_placement: v.replica_placement.to_byte() as u32,
                version: v.version as u32,
                ttl: v.ttl.to_string(),
                compact_revision: v.compact_revision as u32,
            })
            .collect(),
    }
}

/// Pulse the store's inventory at the masters until cancelled.
pub async fn heartbeat_loop(store: Arc<Store>, masters: Vec<String>, pulse: Duration) {
    let mut target = masters.first().cloned().unwrap_or_default();
    let mut rotation = 0usize;
    info!(master = %target, pulse_seconds = pulse.as_secs(), "heartbeat loop started");
    loop {
        tokio::time::sleep(pulse).await;
        let heartbeat = build_heartbeat(&store);
        let result = async {
            let mut client = MasterClient::connect(grpc_endpoint(&target)).await?;
            Ok::<_, tonic::transport::Error>(client.send_heartbeat(heartbeat).await)
        }
        .await;
        match result {
            Ok(Ok(response)) => {
                let response = response.into_inner();
                if !response.leader.is_empty() && response.leader != target {
                    info!(leader = %response.leader, "redirected to master leader");
                    target = response.leader;
                } else {
                    debug!(master = %target, "heartbeat acknowledged");
                }
            }
            Ok(Err(status)) => {
                warn!(master = %target, error = %status, "heartbeat rejected");
            }
            Err(err) => {
                warn!(master = %target, error = %err, "heartbeat connection failed");
                if !masters.is_empty() {
                    rotation = (rotation + 1) % masters.len();
                    target = masters[rotation].clone();
                }
            }
        }
    }
}
