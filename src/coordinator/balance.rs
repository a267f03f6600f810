//! Balancing planner
//!
//! Pure computation of master reassignments for one group of devices (a
//! region, or all unbound devices) over the ACTIVE nodes of the group's
//! active tier. The plan brings every pool node to `floor` or `ceil`
//! devices, where `floor = total / pool` and exactly `total % pool` nodes
//! sit at `ceil`, moving as few devices as possible:
//!
//! - devices mastered outside the pool (or not at all) always move,
//! - nodes above `ceil` shed their surplus,
//! - if more nodes sit at `ceil` than the remainder allows, the extra ones
//!   shed down to `floor`,
//! - everything that moves goes to the least loaded node, ties by node id.
//!
//! A group that already satisfies this yields an empty plan, so running
//! the planner again on its own output never reassigns anything.

use std::collections::{BTreeMap, BTreeSet};

use crate::role::{DeviceId, NodeId};

/// Compute `(device, new master)` pairs for a group.
///
/// `devices` maps each device of the group to its current master.
pub fn plan(
    pool: &BTreeSet<NodeId>,
    devices: &BTreeMap<DeviceId, Option<NodeId>>,
) -> Vec<(DeviceId, NodeId)> {
    if pool.is_empty() || devices.is_empty() {
        return Vec::new();
    }

    let total = devices.len();
    let floor = total / pool.len();
    let remainder = total % pool.len();
    let ceil = if remainder == 0 { floor } else { floor + 1 };

    let mut owned: BTreeMap<&NodeId, Vec<&DeviceId>> =
        pool.iter().map(|node| (node, Vec::new())).collect();
    let mut candidates: Vec<&DeviceId> = Vec::new();

    for (device, master) in devices {
        match master.as_ref().and_then(|m| owned.get_mut(m)) {
            Some(list) => list.push(device),
            None => candidates.push(device),
        }
    }

    for list in owned.values_mut() {
        if list.len() > ceil {
            candidates.extend(list.drain(ceil..));
        }
    }

    if ceil > floor {
        let mut at_ceil = 0;
        for list in owned.values_mut() {
            if list.len() == ceil {
                at_ceil += 1;
                if at_ceil > remainder {
                    candidates.extend(list.drain(floor..));
                }
            }
        }
    }

    candidates.sort();

    let mut moves = Vec::new();
    for device in candidates {
        let target: &NodeId = match owned.iter().map(|(node, list)| (list.len(), *node)).min() {
            Some((_, node)) => node,
            None => break,
        };
        if let Some(list) = owned.get_mut(target) {
            list.push(device);
        }
        if devices.get(device).and_then(|m| m.as_ref()) != Some(target) {
            moves.push((device.clone(), target.clone()));
        }
    }

    moves
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(nodes: &[&str]) -> BTreeSet<NodeId> {
        nodes.iter().map(|n| NodeId::new(*n)).collect()
    }

    fn group(assignments: &[(&str, Option<&str>)]) -> BTreeMap<DeviceId, Option<NodeId>> {
        assignments
            .iter()
            .map(|(d, m)| (DeviceId::new(*d), m.map(NodeId::new)))
            .collect()
    }

    /// Apply a plan and return per-node device counts over the pool
    fn apply(
        pool: &BTreeSet<NodeId>,
        devices: &mut BTreeMap<DeviceId, Option<NodeId>>,
        moves: &[(DeviceId, NodeId)],
    ) -> Vec<usize> {
        for (device, node) in moves {
            devices.insert(device.clone(), Some(node.clone()));
        }
        pool.iter()
            .map(|node| devices.values().filter(|m| m.as_ref() == Some(node)).count())
            .collect()
    }

    #[test]
    fn test_unowned_devices_spread_evenly() {
        let pool = pool(&["node-1", "node-2", "node-3"]);
        let mut devices = group(&[
            ("d1", None),
            ("d2", None),
            ("d3", None),
            ("d4", None),
            ("d5", None),
        ]);
        let moves = plan(&pool, &devices);
        assert_eq!(moves.len(), 5);
        let counts = apply(&pool, &mut devices, &moves);
        assert_eq!(counts, vec![2, 2, 1]);
        assert!(plan(&pool, &devices).is_empty());
    }

    #[test]
    fn test_overloaded_node_sheds_surplus_only() {
        let pool = pool(&["node-1", "node-2"]);
        let mut devices = group(&[
            ("d1", Some("node-1")),
            ("d2", Some("node-1")),
            ("d3", Some("node-1")),
            ("d4", Some("node-1")),
        ]);
        let moves = plan(&pool, &devices);
        assert_eq!(moves.len(), 2);
        assert!(moves.iter().all(|(_, n)| n == &NodeId::new("node-2")));
        assert_eq!(apply(&pool, &mut devices, &moves), vec![2, 2]);
    }

    #[test]
    fn test_too_many_nodes_at_ceiling() {
        // 4 devices over 3 nodes: only one node may hold 2
        let pool = pool(&["node-1", "node-2", "node-3"]);
        let mut devices = group(&[
            ("d1", Some("node-1")),
            ("d2", Some("node-1")),
            ("d3", Some("node-2")),
            ("d4", Some("node-2")),
        ]);
        let moves = plan(&pool, &devices);
        assert_eq!(moves, vec![(DeviceId::new("d4"), NodeId::new("node-3"))]);
        assert_eq!(apply(&pool, &mut devices, &moves), vec![2, 1, 1]);
    }

    #[test]
    fn test_fair_group_is_left_alone() {
        let pool = pool(&["node-1", "node-2"]);
        let devices = group(&[
            ("d1", Some("node-2")),
            ("d2", Some("node-1")),
            ("d3", Some("node-2")),
        ]);
        assert!(plan(&pool, &devices).is_empty());
    }

    #[test]
    fn test_masters_outside_pool_move() {
        let pool = pool(&["node-2", "node-3"]);
        let mut devices = group(&[
            ("d1", Some("node-1")),
            ("d2", Some("node-1")),
            ("d3", Some("node-1")),
            ("d4", Some("node-2")),
        ]);
        let moves = plan(&pool, &devices);
        assert_eq!(moves.len(), 3);
        let counts = apply(&pool, &mut devices, &moves);
        assert_eq!(counts, vec![2, 2]);
        assert!(devices.values().all(|m| m.as_ref() != Some(&NodeId::new("node-1"))));
    }

    #[test]
    fn test_empty_pool_plans_nothing() {
        let devices = group(&[("d1", None)]);
        assert!(plan(&BTreeSet::new(), &devices).is_empty());
    }
}
