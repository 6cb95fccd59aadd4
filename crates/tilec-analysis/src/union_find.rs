//! Union-find over IR values for layout grouping.
//!
//! Supports incremental edge addition and a single connected-components
//! sweep. Nodes are value handles; the structure is a dense array keyed by
//! the handle's integer id.

use tilec_ir::{Handle, HandleMap, Value};

/// An undirected constraint graph over IR values.
#[derive(Debug, Default)]
pub struct ValueGraph {
    /// parent[i] is the union-find parent of value index i; u32::MAX marks
    /// indices that are not nodes.
    parent: Vec<u32>,
}

const ABSENT: u32 = u32::MAX;

impl ValueGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a value as a node (a singleton component until connected).
    pub fn add_node(&mut self, v: Handle<Value>) {
        let index = v.index();
        if index >= self.parent.len() {
            self.parent.resize(index + 1, ABSENT);
        }
        if self.parent[index] == ABSENT {
            self.parent[index] = index as u32;
        }
    }

    /// Returns `true` if the value has been registered.
    pub fn contains(&self, v: Handle<Value>) -> bool {
        v.index() < self.parent.len() && self.parent[v.index()] != ABSENT
    }

    /// Connects two values, registering them as needed.
    pub fn add_edge(&mut self, x: Handle<Value>, y: Handle<Value>) {
        self.add_node(x);
        self.add_node(y);
        let rx = self.find(x.index());
        let ry = self.find(y.index());
        if rx != ry {
            self.parent[ry] = rx as u32;
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] as usize != i {
            // Path halving.
            let grandparent = self.parent[self.parent[i] as usize];
            self.parent[i] = grandparent;
            i = grandparent as usize;
        }
        i
    }

    /// Sweeps all nodes into connected components.
    ///
    /// Returns the member list of each group (groups numbered in first-seen
    /// value order, members in value order) and the value-to-group map.
    pub fn connected_components(
        &mut self,
    ) -> (Vec<Vec<Handle<Value>>>, HandleMap<Value, usize>) {
        let mut groups: Vec<Vec<Handle<Value>>> = Vec::new();
        let mut group_of: HandleMap<Value, usize> = HandleMap::new();
        let mut root_group: Vec<u32> = vec![ABSENT; self.parent.len()];

        for index in 0..self.parent.len() {
            if self.parent[index] == ABSENT {
                continue;
            }
            let root = self.find(index);
            let group = if root_group[root] == ABSENT {
                let id = groups.len();
                root_group[root] = id as u32;
                groups.push(Vec::new());
                id
            } else {
                root_group[root] as usize
            };
            let handle = Handle::from_index(index);
            groups[group].push(handle);
            group_of.insert(handle, group);
        }
        (groups, group_of)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(i: u32) -> Handle<Value> {
        Handle::from_index(i as usize)
    }

    #[test]
    fn singletons_until_connected() {
        let mut g = ValueGraph::new();
        g.add_node(h(0));
        g.add_node(h(2));
        let (groups, group_of) = g.connected_components();
        assert_eq!(groups.len(), 2);
        assert_ne!(group_of.get(h(0)), group_of.get(h(2)));
    }

    #[test]
    fn transitive_connection() {
        let mut g = ValueGraph::new();
        g.add_edge(h(0), h(1));
        g.add_edge(h(1), h(2));
        g.add_node(h(3));
        let (groups, group_of) = g.connected_components();
        assert_eq!(groups.len(), 2);
        assert_eq!(group_of.get(h(0)), group_of.get(h(2)));
        assert_ne!(group_of.get(h(0)), group_of.get(h(3)));
        let big = &groups[*group_of.get(h(0)).unwrap()];
        assert_eq!(big.len(), 3);
    }

    #[test]
    fn group_ids_deterministic() {
        let mut g = ValueGraph::new();
        g.add_edge(h(5), h(6));
        g.add_node(h(1));
        let (_, group_of) = g.connected_components();
        // Value 1 is seen first, so its group id is 0.
        assert_eq!(group_of.get(h(1)), Some(&0));
        assert_eq!(group_of.get(h(5)), Some(&1));
    }
}
