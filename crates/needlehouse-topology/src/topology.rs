//! The topology tree and its bookkeeping.
//!
//! Fed exclusively by volume-server heartbeats (processed in arrival
//! order) and by explicit volume registration from the growth path. Every
//! mutation returns what changed so the master can fan out
//! volume-location notifications to subscribed clients.
//!
//! Writability is tracked per *layout* — the `(collection, replica
//! placement, ttl)` triple — because a writer asking for `"110"` photos
//! with a 3-day TTL can only be pointed at volumes created with exactly
//! those parameters.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use needlehouse_core::needle::VolumeId;
use needlehouse_core::{ReplicaPlacement, Ttl};
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::arena::{Arena, NodeId, NodeKind};
use crate::error::{Error, Result};

pub const DEFAULT_DATA_CENTER: &str = "DefaultDataCenter";
pub const DEFAULT_RACK: &str = "DefaultRack";

/// One volume as reported by the node hosting it.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeInfo {
    pub id: VolumeId,
    pub size: u64,
    pub collection: String,
    pub file_count: u64,
    pub delete_count: u64,
    pub deleted_bytes: u64,
    pub read_only: bool,
    pub replica_placement: ReplicaPlacement,
    pub ttl: Ttl,
    pub version: u8,
    pub compact_revision: u16,
}

/// One heartbeat, already decoded from the wire.
#[derive(Debug, Clone)]
pub struct HeartbeatInfo {
    pub ip: String,
    pub port: u16,
    pub public_url: String,
    pub data_center: String,
    pub rack: String,
    pub max_volume_count: u64,
    pub volumes: Vec<VolumeInfo>,
}

/// Where a volume can be reached.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Location {
    pub url: String,
    #[serde(rename = "publicUrl")]
    pub public_url: String,
}

/// What one heartbeat changed, for the notification bus.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeartbeatDelta {
    pub url: String,
    pub public_url: String,
    pub new_vids: Vec<VolumeId>,
    pub deleted_vids: Vec<VolumeId>,
}

impl HeartbeatDelta {
    pub fn is_empty(&self) -> bool {
        self.new_vids.is_empty() && self.deleted_vids.is_empty()
    }
}

/// Identifies a volume layout: volumes interchangeable for placement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayoutKey {
    pub collection: String,
    pub replica_placement: ReplicaPlacement,
    pub ttl: Ttl,
}

/// Arena payload: inner nodes carry nothing, leaves carry the volume
/// server state.
#[derive(Debug)]
pub enum NodeValue {
    Inner,
    DataNode(DataNodeValue),
}

#[derive(Debug)]
pub struct DataNodeValue {
    pub url: String,
    pub public_url: String,
    pub max_volume_count: u64,
    pub last_heartbeat: Instant,
    pub volumes: HashMap<VolumeId, VolumeInfo>,
}

pub struct Topology {
    arena: Arena<NodeValue>,
    data_centers: HashMap<String, NodeId>,
    node_by_url: HashMap<String, NodeId>,
    /// Which nodes host each volume.
    volume_locations: HashMap<VolumeId, HashSet<NodeId>>,
    /// Writable volume ids per layout.
    writable: HashMap<LayoutKey, Vec<VolumeId>>,
    volume_size_limit: u64,
    pulse: Duration,
    max_volume_id: VolumeId,
}

impl Topology {
    pub fn new(volume_size_limit: u64, pulse: Duration) -> Self {
        Self {
            arena: Arena::new(),
            data_centers: HashMap::new(),
            node_by_url: HashMap::new(),
            volume_locations: HashMap::new(),
            writable: HashMap::new(),
            volume_size_limit,
            pulse,
            max_volume_id: 0,
        }
    }

    pub fn volume_size_limit(&self) -> u64 {
        self.volume_size_limit
    }

    pub fn pulse(&self) -> Duration {
        self.pulse
    }

    pub fn arena(&self) -> &Arena<NodeValue> {
        &self.arena
    }

    /// Highest volume id this topology has ever seen.
    pub fn max_volume_id(&self) -> VolumeId {
        self.max_volume_id
    }

    pub fn next_volume_id(&self) -> VolumeId {
        self.max_volume_id + 1
    }

    /// Fold one heartbeat into the tree, returning what changed.
    pub fn register_heartbeat(&mut self, heartbeat: HeartbeatInfo) -> HeartbeatDelta {
        let url = format!("{}:{}", heartbeat.ip, heartbeat.port);
        let public_url = if heartbeat.public_url.is_empty() {
            url.clone()
        } else {
            heartbeat.public_url.clone()
        };

        let dc_name = non_empty(&heartbeat.data_center, DEFAULT_DATA_CENTER);
        let rack_name = non_empty(&heartbeat.rack, DEFAULT_RACK);
        let dc = *self
            .data_centers
            .entry(dc_name.to_string())
            .or_insert_with(|| {
                self.arena
                    .insert(NodeKind::DataCenter, dc_name.to_string(), None, NodeValue::Inner)
            });
        let rack = self
            .arena
            .child_by_name(dc, rack_name)
            .unwrap_or_else(|| {
                self.arena
                    .insert(NodeKind::Rack, rack_name.to_string(), Some(dc), NodeValue::Inner)
            });

        let node = match self.node_by_url.get(&url) {
            Some(id) => *id,
            None => {
                info!(url, data_center = dc_name, rack = rack_name, "new volume server");
                let id = self.arena.insert(
                    NodeKind::DataNode,
                    url.clone(),
                    Some(rack),
                    NodeValue::DataNode(DataNodeValue {
                        url: url.clone(),
                        public_url: public_url.clone(),
                        max_volume_count: heartbeat.max_volume_count,
                        last_heartbeat: Instant::now(),
                        volumes: HashMap::new(),
                    }),
                );
                self.node_by_url.insert(url.clone(), id);
                id
            }
        };

        let old_vids: HashSet<VolumeId> = match &self.arena.get(node).value {
            NodeValue::DataNode(value) => value.volumes.keys().copied().collect(),
            NodeValue::Inner => HashSet::new(),
        };
        let new_vids: HashSet<VolumeId> = heartbeat.volumes.iter().map(|v| v.id).collect();

        let mut delta = HeartbeatDelta {
            url: url.clone(),
            public_url: public_url.clone(),
            ..Default::default()
        };

        for vid in old_vids.difference(&new_vids) {
            self.unregister_copy(*vid, node);
            delta.deleted_vids.push(*vid);
        }
        for volume in &heartbeat.volumes {
            self.max_volume_id = self.max_volume_id.max(volume.id);
            self.volume_locations
                .entry(volume.id)
                .or_default()
                .insert(node);
            let key = LayoutKey {
                collection: volume.collection.clone(),
                replica_placement: volume.replica_placement,
                ttl: volume.ttl,
            };
            let writable = !volume.read_only && volume.size < self.volume_size_limit;
            self.set_writable(&key, volume.id, writable);
            if !old_vids.contains(&volume.id) {
                delta.new_vids.push(volume.id);
            }
        }

        if let NodeValue::DataNode(value) = &mut self.arena.get_mut(node).value {
            value.public_url = public_url;
            value.max_volume_count = heartbeat.max_volume_count;
            value.last_heartbeat = Instant::now();
            value.volumes = heartbeat.volumes.into_iter().map(|v| (v.id, v)).collect();
        }

        delta.new_vids.sort_unstable();
        delta.deleted_vids.sort_unstable();
        delta
    }

    /// Record a freshly grown volume before its first heartbeat arrives.
    pub fn register_volume(&mut self, volume: &VolumeInfo, nodes: &[NodeId]) {
        self.max_volume_id = self.max_volume_id.max(volume.id);
        let key = LayoutKey {
            collection: volume.collection.clone(),
            replica_placement: volume.replica_placement,
            ttl: volume.ttl,
        };
        for node in nodes {
            self.volume_locations
                .entry(volume.id)
                .or_default()
                .insert(*node);
            if let NodeValue::DataNode(value) = &mut self.arena.get_mut(*node).value {
                value.volumes.insert(volume.id, volume.clone());
            }
        }
        self.set_writable(&key, volume.id, true);
    }

    /// All locations of one volume.
    pub fn lookup(&self, volume_id: VolumeId) -> Result<Vec<Location>> {
        let nodes = self
            .volume_locations
            .get(&volume_id)
            .filter(|nodes| !nodes.is_empty())
            .ok_or(Error::VolumeNotRegistered(volume_id))?;
        Ok(nodes.iter().map(|n| self.node_location(*n)).collect())
    }

    /// Pick a writable volume for the given layout, optionally pinned to a
    /// data center, and return it with all its locations.
    pub fn pick_for_write(
        &self,
        option: &WriteOption,
    ) -> Result<(VolumeId, Vec<Location>)> {
        let key = LayoutKey {
            collection: option.collection.clone(),
            replica_placement: option.replica_placement,
            ttl: option.ttl,
        };
        let candidates: Vec<VolumeId> = self
            .writable
            .get(&key)
            .map(|vids| {
                vids.iter()
                    .copied()
                    .filter(|vid| match &option.data_center {
                        Some(dc) => self.volume_in_data_center(*vid, dc),
                        None => true,
                    })
                    .collect()
            })
            .unwrap_or_default();
        let vid = *candidates
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| Error::NoWritableVolume {
                collection: option.collection.clone(),
                replication: option.replica_placement.to_string(),
            })?;
        Ok((vid, self.lookup(vid)?))
    }

    pub fn writable_count(&self, key: &LayoutKey) -> usize {
        self.writable.get(key).map(|v| v.len()).unwrap_or(0)
    }

    /// Drop volume servers that have not heartbeated within `cutoff`,
    /// pruning racks and data centers left empty. Returns one delta per
    /// evicted node.
    pub fn purge_dead_nodes(&mut self, cutoff: Duration) -> Vec<HeartbeatDelta> {
        let mut deltas = Vec::new();
        for node in self.arena.ids_of_kind(NodeKind::DataNode) {
            let (url, public_url, stale, vids) = match &self.arena.get(node).value {
                NodeValue::DataNode(value) => (
                    value.url.clone(),
                    value.public_url.clone(),
                    value.last_heartbeat.elapsed() > cutoff,
                    value.volumes.keys().copied().collect::<Vec<_>>(),
                ),
                NodeValue::Inner => continue,
            };
            if !stale {
                continue;
            }
            warn!(url, volumes = vids.len(), "evicting dead volume server");
            for vid in &vids {
                self.unregister_copy(*vid, node);
            }
            self.node_by_url.remove(&url);
            let rack = self.arena.get(node).parent;
            self.arena.remove(node);
            if let Some(rack) = rack {
                if self.arena.get(rack).children.is_empty() {
                    let dc = self.arena.get(rack).parent;
                    self.arena.remove(rack);
                    if let Some(dc) = dc {
                        if self.arena.get(dc).children.is_empty() {
                            let name = self.arena.get(dc).name.clone();
                            self.arena.remove(dc);
                            self.data_centers.remove(&name);
                        }
                    }
                }
            }
            let mut deleted_vids = vids;
            deleted_vids.sort_unstable();
            deltas.push(HeartbeatDelta {
                url,
                public_url,
                new_vids: Vec::new(),
                deleted_vids,
            });
        }
        deltas
    }

    /// Re-evaluate writability: volumes that have grown past the size
    /// limit (or turned read-only) leave the writable lists.
    pub fn refresh_writable(&mut self) {
        let mut demote: Vec<(LayoutKey, VolumeId)> = Vec::new();
        for node in self.arena.ids_of_kind(NodeKind::DataNode) {
            if let NodeValue::DataNode(value) = &self.arena.get(node).value {
                for volume in value.volumes.values() {
                    if volume.read_only || volume.size >= self.volume_size_limit {
                        demote.push((
                            LayoutKey {
                                collection: volume.collection.clone(),
                                replica_placement: volume.replica_placement,
                                ttl: volume.ttl,
                            },
                            volume.id,
                        ));
                    }
                }
            }
        }
        for (key, vid) in demote {
            self.set_writable(&key, vid, false);
        }
    }

    /// Volumes whose garbage ratio reached `threshold`, with the url of
    /// each node hosting a copy.
    pub fn vacuum_candidates(&self, threshold: f64) -> Vec<(String, VolumeId)> {
        let mut candidates = Vec::new();
        for node in self.arena.ids_of_kind(NodeKind::DataNode) {
            if let NodeValue::DataNode(value) = &self.arena.get(node).value {
                for volume in value.volumes.values() {
                    if volume.size > 0
                        && volume.deleted_bytes as f64 / volume.size as f64 >= threshold
                    {
                        candidates.push((value.url.clone(), volume.id));
                    }
                }
            }
        }
        candidates
    }

    pub fn data_center_id(&self, name: &str) -> Option<NodeId> {
        self.data_centers.get(name).copied()
    }

    pub fn data_center_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.data_centers.values().copied().collect();
        ids.sort();
        ids
    }

    /// Unused volume slots on a data node.
    pub fn free_slots(&self, node: NodeId) -> u64 {
        match &self.arena.get(node).value {
            NodeValue::DataNode(value) => value
                .max_volume_count
                .saturating_sub(value.volumes.len() as u64),
            NodeValue::Inner => self
                .arena
                .get(node)
                .children
                .iter()
                .map(|c| self.free_slots(*c))
                .sum(),
        }
    }

    pub fn node_location(&self, node: NodeId) -> Location {
        match &self.arena.get(node).value {
            NodeValue::DataNode(value) => Location {
                url: value.url.clone(),
                public_url: value.public_url.clone(),
            },
            NodeValue::Inner => Location {
                url: String::new(),
                public_url: String::new(),
            },
        }
    }

    /// Topology dump for `/dir/status`.
    pub fn to_status(&self) -> Value {
        let mut dcs = Vec::new();
        for dc in self.data_center_ids() {
            let dc_node = self.arena.get(dc);
            let mut racks = Vec::new();
            for rack in &dc_node.children {
                let rack_node = self.arena.get(*rack);
                let mut nodes = Vec::new();
                for leaf in &rack_node.children {
                    if let NodeValue::DataNode(value) = &self.arena.get(*leaf).value {
                        nodes.push(json!({
                            "url": value.url,
                            "publicUrl": value.public_url,
                            "volumes": value.volumes.len(),
                            "maxVolumes": value.max_volume_count,
                        }));
                    }
                }
                racks.push(json!({
                    "name": rack_node.name,
                    "nodes": nodes,
                }));
            }
            dcs.push(json!({
                "name": dc_node.name,
                "freeSlots": self.free_slots(dc),
                "racks": racks,
            }));
        }
        json!({
            "volumeSizeLimit": self.volume_size_limit,
            "maxVolumeId": self.max_volume_id,
            "dataCenters": dcs,
        })
    }

    fn volume_in_data_center(&self, vid: VolumeId, dc_name: &str) -> bool {
        let Some(dc) = self.data_centers.get(dc_name) else {
            return false;
        };
        let Some(nodes) = self.volume_locations.get(&vid) else {
            return false;
        };
        nodes.iter().any(|node| {
            let rack = self.arena.get(*node).parent;
            rack.and_then(|r| self.arena.get(r).parent) == Some(*dc)
        })
    }

    fn set_writable(&mut self, key: &LayoutKey, vid: VolumeId, writable: bool) {
        let list = self.writable.entry(key.clone()).or_default();
        let present = list.contains(&vid);
        if writable && !present {
            list.push(vid);
            list.sort_unstable();
            debug!(volume = vid, collection = %key.collection, "volume writable");
        } else if !writable && present {
            list.retain(|v| *v != vid);
            debug!(volume = vid, collection = %key.collection, "volume no longer writable");
        }
    }

    fn unregister_copy(&mut self, vid: VolumeId, node: NodeId) {
        if let Some(nodes) = self.volume_locations.get_mut(&vid) {
            nodes.remove(&node);
            if nodes.is_empty() {
                self.volume_locations.remove(&vid);
                for list in self.writable.values_mut() {
                    list.retain(|v| *v != vid);
                }
            }
        }
    }
}

/// Parameters of one `pick_for_write` call.
#[derive(Debug, Clone, Default)]
pub struct WriteOption {
    pub collection: String,
    pub replica_placement: ReplicaPlacement,
    pub ttl: Ttl,
    pub data_center: Option<String>,
}

fn non_empty<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() {
        default
    } else {
        value
    }
}
