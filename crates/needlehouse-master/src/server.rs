//! Master Server - HTTP Control Surface and Cluster Operations
//!
//! One [`Master`] ties the pieces together: the topology tree (soft state
//! from heartbeats), the consensus log (hard state: sequence and volume-id
//! counters), the sequencer, and the notification bus. The axum router in
//! [`Master::http_router`] exposes the operator/client surface:
//!
//! | route | purpose |
//! |---|---|
//! | `POST /dir/assign` | reserve a file id and a write location |
//! | `GET /dir/lookup` | all locations of one volume |
//! | `GET /dir/status` | topology dump |
//! | `POST /vol/grow` | force growth for a placement |
//! | `POST /vol/vacuum` | compact volumes above a garbage threshold |
//! | `POST /col/delete` | drop a whole collection |
//! | `GET /{fileId}` | redirect to a volume server |
//!
//! Every mutating route is wrapped in proxy-to-leader: a follower forwards
//! the request to the leader over HTTP, with the number of in-flight
//! proxied requests bounded by a semaphore so a leaderless spell cannot
//! pile up unbounded work.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use needlehouse_core::needle::VolumeId;
use needlehouse_core::{FileId, ReplicaPlacement, Ttl};
use needlehouse_proto::volume::volume_server_client::VolumeServerClient;
use needlehouse_proto::volume::{
    AllocateVolumeRequest, DeleteCollectionRequest, VacuumVolumeRequest,
};
use needlehouse_topology::{
    HeartbeatDelta, HeartbeatInfo, Location, Sequencer, Topology, VolumeGrowOption, VolumeGrowth,
    VolumeInfo, WriteOption,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{info, warn};

use crate::config::{grpc_endpoint, MasterConfig};
use crate::consensus::{Command, ConsensusLog};
use crate::error::{Error, Result};
use crate::notifications::NotificationBus;

/// Maximum concurrent requests proxied to the leader.
const BOUNDED_LEADER_PROXIES: usize = 16;

pub struct Master {
    pub config: MasterConfig,
    pub topology: Arc<RwLock<Topology>>,
    pub consensus: Arc<dyn ConsensusLog>,
    pub sequencer: Arc<dyn Sequencer>,
    pub notifications: Arc<NotificationBus>,
    /// Serializes growth so two assigns cannot claim the same volume id.
    growth_lock: Mutex<()>,
    leader_proxy: Semaphore,
    http: reqwest::Client,
}

impl Master {
    pub fn new(
        config: MasterConfig,
        consensus: Arc<dyn ConsensusLog>,
        sequencer: Arc<dyn Sequencer>,
    ) -> Arc<Self> {
        let topology = Arc::new(RwLock::new(Topology::new(
            config.volume_size_limit(),
            config.pulse,
        )));
        Arc::new(Self {
            config,
            topology,
            consensus,
            sequencer,
            notifications: Arc::new(NotificationBus::new()),
            growth_lock: Mutex::new(()),
            leader_proxy: Semaphore::new(BOUNDED_LEADER_PROXIES),
            http: reqwest::Client::new(),
        })
    }

    /// Fold a heartbeat into the topology and notify subscribers.
    pub async fn register_heartbeat(&self, info: HeartbeatInfo) {
        let delta = self.topology.write().await.register_heartbeat(info);
        self.notifications.publish(&delta);
    }

    /// Current full volume→location picture, one message per node.
    pub async fn location_snapshot(&self) -> Vec<needlehouse_proto::master::VolumeLocation> {
        let topology = self.topology.read().await;
        let mut snapshot = Vec::new();
        for node in topology
            .arena()
            .ids_of_kind(needlehouse_topology::NodeKind::DataNode)
        {
            if let needlehouse_topology::topology::NodeValue::DataNode(value) =
                &topology.arena().get(node).value
            {
                let mut vids: Vec<u32> = value.volumes.keys().copied().collect();
                vids.sort_unstable();
                snapshot.push(needlehouse_proto::master::VolumeLocation {
                    url: value.url.clone(),
                    public_url: value.public_url.clone(),
                    new_vids: vids,
                    deleted_vids: Vec::new(),
                });
            }
        }
        snapshot
    }

    /// Reserve `count` ids on some writable volume, growing one if the
    /// layout has none.
    pub async fn assign(&self, request: &AssignParams) -> Result<AssignResult> {
        if !self.consensus.is_leader() {
            return Err(Error::NotLeader(self.consensus.leader_hint()));
        }
        let count = request.count.unwrap_or(1).max(1);
        let replica_placement = self.parse_replication(request.replication.as_deref())?;
        let ttl = Ttl::parse(request.ttl.as_deref().unwrap_or(""))?;
        let write_option = WriteOption {
            collection: request.collection.clone().unwrap_or_default(),
            replica_placement,
            ttl,
            data_center: request.data_center.clone(),
        };

        let picked = { self.topology.read().await.pick_for_write(&write_option) };
        let (volume_id, locations) = match picked {
            Ok(found) => found,
            Err(needlehouse_topology::Error::NoWritableVolume { .. }) => {
                self.grow_volumes(
                    &VolumeGrowOption {
                        collection: write_option.collection.clone(),
                        replica_placement,
                        ttl,
                        data_center: write_option.data_center.clone(),
                    },
                    VolumeGrowth::target_count(replica_placement),
                )
                .await?;
                self.topology.read().await.pick_for_write(&write_option)?
            }
            Err(err) => return Err(err.into()),
        };

        let first = self.sequencer.next_batch(count).await?;
        let fid = FileId::new(volume_id, first, rand::random::<u32>());
        let location = locations
            .first()
            .cloned()
            .ok_or_else(|| Error::Internal("picked volume has no location".into()))?;
        Ok(AssignResult {
            fid: fid.to_string(),
            url: location.url,
            public_url: location.public_url,
            count,
        })
    }

    pub async fn lookup(&self, volume_id: VolumeId) -> Result<Vec<Location>> {
        Ok(self.topology.read().await.lookup(volume_id)?)
    }

    /// Create `count` new volumes for one layout. Serialized cluster-wide
    /// (on the leader) by the growth lock; each volume id is claimed in
    /// the replicated log before any volume server hears about it.
    pub async fn grow_volumes(
        &self,
        option: &VolumeGrowOption,
        count: usize,
    ) -> Result<Vec<VolumeId>> {
        if !self.consensus.is_leader() {
            return Err(Error::NotLeader(self.consensus.leader_hint()));
        }
        let _guard = self.growth_lock.lock().await;
        let mut grown = Vec::new();
        for _ in 0..count.max(1) {
            let (node_ids, locations, volume_id) = {
                let topology = self.topology.read().await;
                let node_ids = VolumeGrowth::find_empty_slots(&topology, option)?;
                let locations: Vec<Location> = node_ids
                    .iter()
                    .map(|id| topology.node_location(*id))
                    .collect();
                let volume_id = topology
                    .next_volume_id()
                    .max(self.consensus.applied_state().max_volume_id + 1);
                (node_ids, locations, volume_id)
            };

            self.consensus
                .propose(Command::AssignVolumeId { volume_id })
                .await?;

            for location in &locations {
                let mut client =
                    VolumeServerClient::connect(grpc_endpoint(&location.url)).await?;
                client
                    .allocate_volume(AllocateVolumeRequest {
                        volume_id,
                        collection: option.collection.clone(),
                        replication: option.replica_placement.to_string(),
                        ttl: option.ttl.to_string(),
                    })
                    .await?;
            }

            let volume = VolumeInfo {
                id: volume_id,
                size: 0,
                collection: option.collection.clone(),
                file_count: 0,
                delete_count: 0,
                deleted_bytes: 0,
                read_only: false,
                replica_placement: option.replica_placement,
                ttl: option.ttl,
                version: needlehouse_core::CURRENT_VERSION,
                compact_revision: 0,
            };
            {
                let mut topology = self.topology.write().await;
                topology.register_volume(&volume, &node_ids);
            }
            for location in &locations {
                self.notifications.publish(&HeartbeatDelta {
                    url: location.url.clone(),
                    public_url: location.public_url.clone(),
                    new_vids: vec![volume_id],
                    deleted_vids: Vec::new(),
                });
            }
            info!(
                volume = volume_id,
                collection = %option.collection,
                replication = %option.replica_placement,
                copies = locations.len(),
                "grew volume"
            );
            grown.push(volume_id);
        }
        Ok(grown)
    }

    /// Ask every node hosting an over-threshold volume to compact it.
    pub async fn vacuum(&self, garbage_threshold: f64) -> Result<u64> {
        let candidates = {
            self.topology
                .read()
                .await
                .vacuum_candidates(garbage_threshold)
        };
        let mut reclaimed = 0u64;
        for (url, volume_id) in candidates {
            let result = async {
                let mut client = VolumeServerClient::connect(grpc_endpoint(&url)).await?;
                Ok::<_, Error>(
                    client
                        .vacuum_volume(VacuumVolumeRequest { volume_id })
                        .await?
                        .into_inner()
                        .reclaimed_bytes,
                )
            }
            .await;
            match result {
                Ok(bytes) => {
                    info!(volume = volume_id, url = %url, reclaimed = bytes, "vacuumed volume");
                    reclaimed += bytes;
                }
                Err(err) => warn!(volume = volume_id, url = %url, error = %err, "vacuum failed"),
            }
        }
        Ok(reclaimed)
    }

    /// Drop a collection on every node currently hosting part of it.
    pub async fn delete_collection(&self, collection: &str) -> Result<u32> {
        let urls: Vec<String> = {
            let topology = self.topology.read().await;
            topology
                .arena()
                .ids_of_kind(needlehouse_topology::NodeKind::DataNode)
                .into_iter()
                .filter_map(|id| {
                    match &topology.arena().get(id).value {
                        needlehouse_topology::topology::NodeValue::DataNode(value) => {
                            value
                                .volumes
                                .values()
                                .any(|v| v.collection == collection)
                                .then(|| value.url.clone())
                        }
                        _ => None,
                    }
                })
                .collect()
        };
        let mut deleted = 0u32;
        for url in urls {
            let result = async {
                let mut client = VolumeServerClient::connect(grpc_endpoint(&url)).await?;
                Ok::<_, Error>(
                    client
                        .delete_collection(DeleteCollectionRequest {
                            collection: collection.to_string(),
                        })
                        .await?
                        .into_inner()
                        .deleted_volume_count,
                )
            }
            .await;
            match result {
                Ok(count) => deleted += count,
                Err(err) => warn!(url = %url, error = %err, "collection delete failed"),
            }
        }
        Ok(deleted)
    }

    fn parse_replication(&self, replication: Option<&str>) -> Result<ReplicaPlacement> {
        match replication {
            Some(value) if !value.is_empty() => Ok(ReplicaPlacement::parse(value)?),
            _ => Ok(self.config.default_replica_placement),
        }
    }

    /// The operator/client HTTP surface.
    pub fn http_router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/dir/assign", post(dir_assign).get(dir_assign))
            .route("/dir/lookup", get(dir_lookup))
            .route("/dir/status", get(dir_status))
            .route("/vol/grow", post(vol_grow))
            .route("/vol/vacuum", post(vol_vacuum))
            .route("/col/delete", post(col_delete))
            .route("/:file_id", get(redirect_to_volume))
            .with_state(Arc::clone(self))
    }

    /// Forward a request to the current leader, with bounded concurrency.
    async fn proxy_to_leader(&self, method: &Method, uri: &Uri) -> Response {
        let Some(leader) = self.consensus.leader_hint() else {
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "no leader elected yet");
        };
        let _permit = match self.leader_proxy.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                return error_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "too many requests waiting on the leader",
                )
            }
        };
        let target = format!(
            "http://{}{}",
            leader,
            uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        );
        let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .unwrap_or(reqwest::Method::GET);
        match self
            .http
            .request(method, &target)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(upstream) => {
                let status = StatusCode::from_u16(upstream.status().as_u16())
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                let body = upstream.bytes().await.unwrap_or_default();
                (status, body).into_response()
            }
            Err(err) => error_response(
                StatusCode::BAD_GATEWAY,
                &format!("proxy to leader {} failed: {}", leader, err),
            ),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssignParams {
    pub count: Option<u64>,
    pub collection: Option<String>,
    pub replication: Option<String>,
    pub ttl: Option<String>,
    #[serde(rename = "dataCenter")]
    pub data_center: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AssignResult {
    pub fid: String,
    pub url: String,
    #[serde(rename = "publicUrl")]
    pub public_url: String,
    pub count: u64,
}

async fn dir_assign(
    State(master): State<Arc<Master>>,
    method: Method,
    uri: Uri,
    Query(params): Query<AssignParams>,
) -> Response {
    if !master.consensus.is_leader() {
        return master.proxy_to_leader(&method, &uri).await;
    }
    match master.assign(&params).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => master_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct LookupParams {
    #[serde(rename = "volumeId")]
    volume_id: String,
}

async fn dir_lookup(
    State(master): State<Arc<Master>>,
    method: Method,
    uri: Uri,
    Query(params): Query<LookupParams>,
) -> Response {
    if !master.consensus.is_leader() {
        return master.proxy_to_leader(&method, &uri).await;
    }
    // Accept both a bare volume id and a full fid.
    let volume_id = match params.volume_id.split(',').next().and_then(|v| v.parse().ok()) {
        Some(vid) => vid,
        None => return error_response(StatusCode::BAD_REQUEST, "malformed volumeId"),
    };
    match master.lookup(volume_id).await {
        Ok(locations) => Json(json!({
            "volumeId": volume_id.to_string(),
            "locations": locations,
        }))
        .into_response(),
        Err(err) => master_error_response(err),
    }
}

async fn dir_status(State(master): State<Arc<Master>>, method: Method, uri: Uri) -> Response {
    if !master.consensus.is_leader() {
        return master.proxy_to_leader(&method, &uri).await;
    }
    let topology = master.topology.read().await.to_status();
    Json(json!({
        "Topology": topology,
        "Leader": master.consensus.leader_hint(),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct GrowParams {
    count: Option<usize>,
    collection: Option<String>,
    replication: Option<String>,
    ttl: Option<String>,
    #[serde(rename = "dataCenter")]
    data_center: Option<String>,
}

async fn vol_grow(
    State(master): State<Arc<Master>>,
    method: Method,
    uri: Uri,
    Query(params): Query<GrowParams>,
) -> Response {
    if !master.consensus.is_leader() {
        return master.proxy_to_leader(&method, &uri).await;
    }
    let replica_placement = match master.parse_replication(params.replication.as_deref()) {
        Ok(rp) => rp,
        Err(err) => return master_error_response(err),
    };
    let ttl = match Ttl::parse(params.ttl.as_deref().unwrap_or("")) {
        Ok(ttl) => ttl,
        Err(err) => return master_error_response(err.into()),
    };
    let option = VolumeGrowOption {
        collection: params.collection.unwrap_or_default(),
        replica_placement,
        ttl,
        data_center: params.data_center,
    };
    let count = params
        .count
        .unwrap_or_else(|| VolumeGrowth::target_count(replica_placement));
    match master.grow_volumes(&option, count).await {
        Ok(vids) => Json(json!({ "count": vids.len(), "volumeIds": vids })).into_response(),
        Err(err) => master_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct VacuumParams {
    #[serde(rename = "garbageThreshold")]
    garbage_threshold: Option<f64>,
}

async fn vol_vacuum(
    State(master): State<Arc<Master>>,
    method: Method,
    uri: Uri,
    Query(params): Query<VacuumParams>,
) -> Response {
    if !master.consensus.is_leader() {
        return master.proxy_to_leader(&method, &uri).await;
    }
    let threshold = params
        .garbage_threshold
        .unwrap_or(master.config.garbage_threshold);
    match master.vacuum(threshold).await {
        Ok(reclaimed) => Json(json!({ "reclaimedBytes": reclaimed })).into_response(),
        Err(err) => master_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct CollectionParams {
    collection: String,
}

async fn col_delete(
    State(master): State<Arc<Master>>,
    method: Method,
    uri: Uri,
    Query(params): Query<CollectionParams>,
) -> Response {
    if !master.consensus.is_leader() {
        return master.proxy_to_leader(&method, &uri).await;
    }
    match master.delete_collection(&params.collection).await {
        Ok(count) => Json(json!({ "deletedVolumes": count })).into_response(),
        Err(err) => master_error_response(err),
    }
}

async fn redirect_to_volume(
    State(master): State<Arc<Master>>,
    method: Method,
    uri: Uri,
    Path(file_id): Path<String>,
) -> Response {
    if !master.consensus.is_leader() {
        return master.proxy_to_leader(&method, &uri).await;
    }
    let fid = match FileId::parse(&file_id) {
        Ok(fid) => fid,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "malformed file id"),
    };
    match master.lookup(fid.volume_id).await {
        Ok(locations) if !locations.is_empty() => {
            let target = format!("http://{}/{}", locations[0].public_url, file_id);
            Redirect::temporary(&target).into_response()
        }
        _ => error_response(StatusCode::NOT_FOUND, "volume not found"),
    }
}

fn master_error_response(err: Error) -> Response {
    let status = match &err {
        Error::NotLeader(_) | Error::NoLeader => StatusCode::SERVICE_UNAVAILABLE,
        Error::Topology(needlehouse_topology::Error::VolumeNotRegistered(_)) => {
            StatusCode::NOT_FOUND
        }
        Error::Topology(needlehouse_topology::Error::InsufficientPlacement { .. })
        | Error::Topology(needlehouse_topology::Error::NoWritableVolume { .. })
        | Error::Topology(needlehouse_topology::Error::UnknownDataCenter(_)) => {
            StatusCode::NOT_ACCEPTABLE
        }
        Error::Core(needlehouse_core::Error::NotFound) => StatusCode::NOT_FOUND,
        Error::Core(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
