//! Connected-subnet resolution.
//!
//! Subnet connections form an arbitrary undirected graph, cycles included.
//! The walk is breadth-first over an explicit visited set, so it terminates on
//! any topology and yields every reachable subnet and NIC exactly once.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::error::VnetError;
use crate::model::{Nic, SubnetId};
use crate::store::VnetStore;

#[derive(Clone, Debug, PartialEq)]
pub struct ConnectedComponent {
    pub root: SubnetId,
    /// Reachable subnets in visit order, `root` first.
    pub subnets: Vec<SubnetId>,
    pub nics: Vec<Nic>,
    /// Edges that closed a cycle, as `(smaller, larger)` pairs.
    pub cycle_edges: BTreeSet<(SubnetId, SubnetId)>,
}

impl ConnectedComponent {
    /// The subnet that coordinates rotations for the whole component.
    pub fn leader(&self) -> SubnetId {
        self.subnets.iter().copied().min().unwrap_or(self.root)
    }

    pub fn contains(&self, id: SubnetId) -> bool {
        self.subnets.contains(&id)
    }
}

pub fn resolve(store: &dyn VnetStore, root: SubnetId) -> Result<ConnectedComponent, VnetError> {
    let mut visited = HashSet::from([root]);
    let mut tree_parent: HashMap<SubnetId, SubnetId> = HashMap::new();
    let mut queue = VecDeque::from([root]);
    let mut subnets = Vec::new();
    let mut cycle_edges = BTreeSet::new();

    while let Some(current) = queue.pop_front() {
        subnets.push(current);
        for peer in store.connected(current)? {
            if visited.insert(peer) {
                tree_parent.insert(peer, current);
                queue.push_back(peer);
            } else if tree_parent.get(&current) != Some(&peer) {
                cycle_edges.insert(if current < peer {
                    (current, peer)
                } else {
                    (peer, current)
                });
            }
        }
    }

    let mut nics = Vec::new();
    for subnet in &subnets {
        nics.extend(store.nics_in(*subnet)?);
    }
    if !cycle_edges.is_empty() {
        tracing::debug!(
            subnet_id = %root,
            subnets = subnets.len(),
            cycle_edges = cycle_edges.len(),
            "connected subnets contain cycles"
        );
    }
    Ok(ConnectedComponent {
        root,
        subnets,
        nics,
        cycle_edges,
    })
}

pub fn connected_leader(store: &dyn VnetStore, id: SubnetId) -> Result<SubnetId, VnetError> {
    Ok(resolve(store, id)?.leader())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::model::PrivateSubnet;
    use crate::store::InMemoryVnetStore;

    fn subnets(store: &InMemoryVnetStore, count: usize) -> Vec<SubnetId> {
        (0..count)
            .map(|i| {
                let subnet = PrivateSubnet::new(format!("ps-{i}"), Utc::now());
                store.create_subnet(&subnet).unwrap();
                store
                    .create_nic(&Nic::new(subnet.id, "nic", "10.0.0.2", "fd00::2"))
                    .unwrap();
                subnet.id
            })
            .collect()
    }

    #[test]
    fn cycles_terminate_and_list_each_nic_once() {
        let store = InMemoryVnetStore::new();
        let ids = subnets(&store, 4);
        // Triangle 0-1-2 plus a tail 2-3.
        store.connect(ids[0], ids[1]).unwrap();
        store.connect(ids[1], ids[2]).unwrap();
        store.connect(ids[2], ids[0]).unwrap();
        store.connect(ids[2], ids[3]).unwrap();

        for start in &ids {
            let component = resolve(&store, *start).unwrap();
            assert_eq!(component.subnets.len(), 4);
            assert_eq!(component.nics.len(), 4);
            let unique: HashSet<_> = component.nics.iter().map(|n| n.id).collect();
            assert_eq!(unique.len(), 4);
            assert_eq!(component.cycle_edges.len(), 1);
            assert_eq!(component.leader(), *ids.iter().min().unwrap());
        }
    }

    #[test]
    fn tree_edges_are_not_cycles() {
        let store = InMemoryVnetStore::new();
        let ids = subnets(&store, 3);
        store.connect(ids[0], ids[1]).unwrap();
        store.connect(ids[1], ids[2]).unwrap();

        let component = resolve(&store, ids[1]).unwrap();
        assert_eq!(component.subnets[0], ids[1]);
        assert!(component.cycle_edges.is_empty());
    }

    #[test]
    fn isolated_subnet_leads_itself() {
        let store = InMemoryVnetStore::new();
        let ids = subnets(&store, 2);
        assert_eq!(connected_leader(&store, ids[0]).unwrap(), ids[0]);
        assert_eq!(connected_leader(&store, ids[1]).unwrap(), ids[1]);
    }
}
