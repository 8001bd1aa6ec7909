//! Volume Growth - Picking Homes for New Volumes
//!
//! When a layout runs out of writable volumes the master grows it: choose
//! a set of data nodes satisfying the replica placement triple, tell each
//! to allocate the next volume id, and register the result. This module
//! implements the *choosing*; the RPCs live with the master, so growth
//! stays deterministic and unit-testable against a bare topology.
//!
//! ## Placement Constraint
//!
//! For a triple `(dc, rack, node)` = "xyz" the copies are laid out as:
//! - one *main* group: `1 + z` nodes on the same rack (distinct nodes)
//! - `y` more copies on other racks of the main data center
//! - `x` more copies on other data centers
//!
//! So no two copies share a node, at most `1 + z` share a rack, and at
//! most `1 + y + z` share a data center. Candidates at every level are
//! chosen randomly, weighted by free volume slots, so growth spreads load
//! without a central counter.

use needlehouse_core::ReplicaPlacement;
use rand::Rng;
use tracing::debug;

use crate::arena::{NodeId, NodeKind};
use crate::error::{Error, Result};
use crate::topology::Topology;

/// Parameters for one growth decision.
#[derive(Debug, Clone, Default)]
pub struct VolumeGrowOption {
    pub collection: String,
    pub replica_placement: ReplicaPlacement,
    pub ttl: needlehouse_core::Ttl,
    pub data_center: Option<String>,
}

pub struct VolumeGrowth;

impl VolumeGrowth {
    /// How many volumes to create per grow request; more slots when the
    /// placement is cheap, fewer when every volume costs many copies.
    pub fn target_count(replica_placement: ReplicaPlacement) -> usize {
        match replica_placement.copy_count() {
            1 => 7,
            2 => 6,
            3 => 3,
            _ => 1,
        }
    }

    /// Choose the set of data nodes to hold one new volume's copies.
    ///
    /// The returned list is `replica_placement.copy_count()` long and the
    /// first entry is the main (write-entry) node.
    pub fn find_empty_slots(
        topology: &Topology,
        option: &VolumeGrowOption,
    ) -> Result<Vec<NodeId>> {
        let rp = option.replica_placement;
        let needed_other_dcs = rp.diff_data_center_count as usize;
        let needed_other_racks = rp.diff_rack_count as usize;
        let needed_same_rack = rp.same_rack_count as usize;

        // Main data center: requested one, or any that can host the whole
        // main group.
        let mut dc_ids = topology.data_center_ids();
        if let Some(name) = &option.data_center {
            let id = topology
                .data_center_id(name)
                .ok_or_else(|| Error::UnknownDataCenter(name.clone()))?;
            dc_ids = vec![id];
        }
        let main_dc = pick_weighted(topology, &dc_ids, |dc| {
            Self::dc_can_host_main_group(topology, *dc, needed_other_racks, needed_same_rack)
        })
        .ok_or(Error::InsufficientPlacement {
            level: "data center",
            needed: 1 + needed_other_dcs,
            available: 0,
        })?;

        // Other data centers, one copy each.
        let other_dcs = pick_distinct(
            topology,
            &topology
                .data_center_ids()
                .into_iter()
                .filter(|dc| *dc != main_dc)
                .collect::<Vec<_>>(),
            needed_other_dcs,
            "data center",
        )?;

        // Main rack inside the main data center.
        let racks = topology.arena().get(main_dc).children.clone();
        let main_rack = pick_weighted(topology, &racks, |rack| {
            Self::rack_can_host_main_group(topology, *rack, needed_same_rack)
        })
        .ok_or(Error::InsufficientPlacement {
            level: "rack",
            needed: 1 + needed_other_racks,
            available: 0,
        })?;

        // Other racks of the main data center, one copy each.
        let other_racks = pick_distinct(
            topology,
            &racks
                .iter()
                .copied()
                .filter(|rack| *rack != main_rack)
                .collect::<Vec<_>>(),
            needed_other_racks,
            "rack",
        )?;

        // Main group: 1 + z distinct nodes on the main rack.
        let rack_nodes: Vec<NodeId> = topology
            .arena()
            .get(main_rack)
            .children
            .iter()
            .copied()
            .filter(|node| topology.free_slots(*node) > 0)
            .collect();
        if rack_nodes.len() < 1 + needed_same_rack {
            return Err(Error::InsufficientPlacement {
                level: "node",
                needed: 1 + needed_same_rack,
                available: rack_nodes.len(),
            });
        }
        let mut chosen = pick_n_weighted(topology, &rack_nodes, 1 + needed_same_rack);

        // One node with a free slot inside each extra rack / data center.
        for rack in other_racks {
            chosen.push(Self::any_free_node(topology, rack, "rack")?);
        }
        for dc in other_dcs {
            chosen.push(Self::any_free_node(topology, dc, "data center")?);
        }

        debug!(
            replication = %rp,
            nodes = chosen.len(),
            "chose placement for new volume"
        );
        Ok(chosen)
    }

    fn dc_can_host_main_group(
        topology: &Topology,
        dc: NodeId,
        other_racks: usize,
        same_rack: usize,
    ) -> bool {
        let racks = &topology.arena().get(dc).children;
        let racks_with_free = racks
            .iter()
            .filter(|rack| topology.free_slots(**rack) > 0)
            .count();
        racks_with_free >= 1 + other_racks
            && racks
                .iter()
                .any(|rack| Self::rack_can_host_main_group(topology, *rack, same_rack))
    }

    fn rack_can_host_main_group(topology: &Topology, rack: NodeId, same_rack: usize) -> bool {
        topology
            .arena()
            .get(rack)
            .children
            .iter()
            .filter(|node| topology.free_slots(**node) > 0)
            .count()
            >= 1 + same_rack
    }

    fn any_free_node(topology: &Topology, subtree: NodeId, level: &'static str) -> Result<NodeId> {
        let mut nodes: Vec<NodeId> = Vec::new();
        collect_data_nodes(topology, subtree, &mut nodes);
        nodes.retain(|node| topology.free_slots(*node) > 0);
        pick_weighted(topology, &nodes, |_| true).ok_or(Error::InsufficientPlacement {
            level,
            needed: 1,
            available: 0,
        })
    }
}

fn collect_data_nodes(topology: &Topology, root: NodeId, out: &mut Vec<NodeId>) {
    let node = topology.arena().get(root);
    if node.kind == NodeKind::DataNode {
        out.push(root);
        return;
    }
    for child in &node.children {
        collect_data_nodes(topology, *child, out);
    }
}

/// Random choice weighted by free slots, restricted by a predicate.
fn pick_weighted(
    topology: &Topology,
    candidates: &[NodeId],
    eligible: impl Fn(&NodeId) -> bool,
) -> Option<NodeId> {
    let weighted: Vec<(NodeId, u64)> = candidates
        .iter()
        .filter(|id| eligible(id))
        .map(|id| (*id, topology.free_slots(*id)))
        .filter(|(_, free)| *free > 0)
        .collect();
    let total: u64 = weighted.iter().map(|(_, free)| free).sum();
    if total == 0 {
        return None;
    }
    let mut roll = rand::thread_rng().gen_range(0..total);
    for (id, free) in weighted {
        if roll < free {
            return Some(id);
        }
        roll -= free;
    }
    None
}

/// `count` distinct picks, each weighted by free slots.
fn pick_distinct(
    topology: &Topology,
    candidates: &[NodeId],
    count: usize,
    level: &'static str,
) -> Result<Vec<NodeId>> {
    let with_free: Vec<NodeId> = candidates
        .iter()
        .copied()
        .filter(|id| topology.free_slots(*id) > 0)
        .collect();
    if with_free.len() < count {
        return Err(Error::InsufficientPlacement {
            level,
            needed: count,
            available: with_free.len(),
        });
    }
    Ok(pick_n_weighted(topology, &with_free, count))
}

fn pick_n_weighted(topology: &Topology, candidates: &[NodeId], count: usize) -> Vec<NodeId> {
    let mut pool: Vec<NodeId> = candidates.to_vec();
    let mut chosen = Vec::with_capacity(count);
    while chosen.len() < count {
        let Some(pick) = pick_weighted(topology, &pool, |_| true) else {
            break;
        };
        pool.retain(|id| *id != pick);
        chosen.push(pick);
    }
    chosen
}
