// src/resolver/graph.rs

//! Dependency graph over package matches
//!
//! Nodes live in an arena indexed by insertion order; edges point from a
//! package to the packages it depends on. Cycles are allowed: layering
//! collapses every strongly connected component into one level.

use crate::repository::PackageMatch;
use std::collections::{BTreeMap, BTreeSet, HashMap};

const UNVISITED: usize = usize::MAX;

/// Directed graph of package matches
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<PackageMatch>,
    index: HashMap<PackageMatch, usize>,
    /// Outgoing edges: node -> nodes it depends on
    edges: Vec<BTreeSet<usize>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node, returning its arena index
    pub fn add_node(&mut self, item: PackageMatch) -> usize {
        if let Some(&idx) = self.index.get(&item) {
            return idx;
        }
        let idx = self.nodes.len();
        self.index.insert(item.clone(), idx);
        self.nodes.push(item);
        self.edges.push(BTreeSet::new());
        idx
    }

    /// Add `item` and an edge from it to each of `dependencies`.
    ///
    /// Self edges are dropped.
    pub fn add<'a, I>(&mut self, item: &PackageMatch, dependencies: I)
    where
        I: IntoIterator<Item = &'a PackageMatch>,
    {
        let from = self.add_node(item.clone());
        for dependency in dependencies {
            let to = self.add_node(dependency.clone());
            if from != to {
                self.edges[from].insert(to);
            }
        }
    }

    pub fn contains(&self, item: &PackageMatch) -> bool {
        self.index.contains_key(item)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = &PackageMatch> {
        self.nodes.iter()
    }

    /// Direct dependencies of `item`
    pub fn dependencies(&self, item: &PackageMatch) -> Vec<&PackageMatch> {
        match self.index.get(item) {
            Some(&idx) => self.edges[idx].iter().map(|&d| &self.nodes[d]).collect(),
            None => Vec::new(),
        }
    }

    /// Nodes with an edge to `item`
    pub fn requirers(&self, item: &PackageMatch) -> Vec<&PackageMatch> {
        let Some(&target) = self.index.get(item) else {
            return Vec::new();
        };
        self.edges
            .iter()
            .enumerate()
            .filter(|(_, out)| out.contains(&target))
            .map(|(idx, _)| &self.nodes[idx])
            .collect()
    }

    pub fn adjacency_map(&self) -> BTreeMap<PackageMatch, BTreeSet<PackageMatch>> {
        self.nodes
            .iter()
            .zip(&self.edges)
            .map(|(node, out)| {
                (
                    node.clone(),
                    out.iter().map(|&d| self.nodes[d].clone()).collect(),
                )
            })
            .collect()
    }

    /// Strongly connected components (Tarjan, with an explicit call
    /// stack), emitted dependencies first
    fn components(&self) -> Vec<Vec<usize>> {
        let n = self.nodes.len();
        let successors: Vec<Vec<usize>> = self
            .edges
            .iter()
            .map(|out| out.iter().copied().collect())
            .collect();

        let mut order = vec![UNVISITED; n];
        let mut lowlink = vec![0; n];
        let mut on_stack = vec![false; n];
        let mut stack = Vec::new();
        let mut components = Vec::new();
        let mut counter = 0;

        for root in 0..n {
            if order[root] != UNVISITED {
                continue;
            }
            order[root] = counter;
            lowlink[root] = counter;
            counter += 1;
            stack.push(root);
            on_stack[root] = true;

            // (node, next successor position)
            let mut calls = vec![(root, 0usize)];
            while let Some(&(node, pos)) = calls.last() {
                if let Some(&next) = successors[node].get(pos) {
                    if let Some(call) = calls.last_mut() {
                        call.1 += 1;
                    }
                    if order[next] == UNVISITED {
                        order[next] = counter;
                        lowlink[next] = counter;
                        counter += 1;
                        stack.push(next);
                        on_stack[next] = true;
                        calls.push((next, 0));
                    } else if on_stack[next] {
                        lowlink[node] = lowlink[node].min(order[next]);
                    }
                    continue;
                }

                calls.pop();
                if let Some(&(parent, _)) = calls.last() {
                    lowlink[parent] = lowlink[parent].min(lowlink[node]);
                }
                if lowlink[node] == order[node] {
                    let mut component = Vec::new();
                    while let Some(member) = stack.pop() {
                        on_stack[member] = false;
                        component.push(member);
                        if member == node {
                            break;
                        }
                    }
                    component.sort_unstable();
                    components.push(component);
                }
            }
        }
        components
    }

    /// Layer the graph: a node sits one level above its highest
    /// dependency, nodes without dependencies at level 1. Members of a
    /// cycle share a level. Each level lists nodes in insertion order.
    pub fn levels(&self) -> BTreeMap<usize, Vec<PackageMatch>> {
        let components = self.components();
        let mut component_of = vec![0; self.nodes.len()];
        for (c, members) in components.iter().enumerate() {
            for &member in members {
                component_of[member] = c;
            }
        }

        let mut component_level = vec![1usize; components.len()];
        for (c, members) in components.iter().enumerate() {
            let mut level = 1;
            for &member in members {
                for &dependency in &self.edges[member] {
                    let dc = component_of[dependency];
                    if dc != c {
                        level = level.max(component_level[dc] + 1);
                    }
                }
            }
            component_level[c] = level;
        }

        let mut levels: BTreeMap<usize, Vec<PackageMatch>> = BTreeMap::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            levels
                .entry(component_level[component_of[idx]])
                .or_default()
                .push(node.clone());
        }
        levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(id: i64) -> PackageMatch {
        PackageMatch::new(id, "main")
    }

    fn level_of(levels: &BTreeMap<usize, Vec<PackageMatch>>, item: &PackageMatch) -> usize {
        levels
            .iter()
            .find(|(_, members)| members.contains(item))
            .map(|(level, _)| *level)
            .unwrap()
    }

    #[test]
    fn test_chain_is_layered_dependencies_first() {
        let mut graph = Graph::new();
        graph.add(&m(1), &[m(2)]);
        graph.add(&m(2), &[m(3)]);
        graph.add(&m(3), &[]);

        let levels = graph.levels();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[&1], vec![m(3)]);
        assert_eq!(levels[&2], vec![m(2)]);
        assert_eq!(levels[&3], vec![m(1)]);
    }

    #[test]
    fn test_self_edges_are_dropped() {
        let mut graph = Graph::new();
        graph.add(&m(1), &[m(1), m(2)]);
        assert_eq!(graph.dependencies(&m(1)), vec![&m(2)]);
        assert!(graph.requirers(&m(1)).is_empty());
    }

    #[test]
    fn test_cycle_shares_one_level() {
        let mut graph = Graph::new();
        graph.add(&m(1), &[m(2)]);
        graph.add(&m(2), &[m(3)]);
        graph.add(&m(3), &[m(2), m(4)]);

        let levels = graph.levels();
        assert_eq!(level_of(&levels, &m(4)), 1);
        assert_eq!(level_of(&levels, &m(2)), 2);
        assert_eq!(level_of(&levels, &m(3)), 2);
        assert_eq!(level_of(&levels, &m(1)), 3);
        assert_eq!(levels[&2], vec![m(2), m(3)]);
    }

    #[test]
    fn test_diamond_uses_longest_path() {
        let mut graph = Graph::new();
        graph.add(&m(1), &[m(2), m(4)]);
        graph.add(&m(2), &[m(3)]);
        graph.add(&m(3), &[m(4)]);

        let levels = graph.levels();
        assert_eq!(level_of(&levels, &m(4)), 1);
        assert_eq!(level_of(&levels, &m(1)), 4);
    }

    #[test]
    fn test_requirers_and_adjacency() {
        let mut graph = Graph::new();
        graph.add(&m(1), &[m(3)]);
        graph.add(&m(2), &[m(3)]);

        assert_eq!(graph.requirers(&m(3)), vec![&m(1), &m(2)]);
        let adjacency = graph.adjacency_map();
        assert_eq!(adjacency[&m(1)], BTreeSet::from([m(3)]));
        assert!(adjacency[&m(3)].is_empty());
        assert!(graph.contains(&m(2)));
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn test_long_chain_does_not_recurse() {
        let mut graph = Graph::new();
        for id in 0..20_000 {
            graph.add(&m(id), &[m(id + 1)]);
        }
        let levels = graph.levels();
        assert_eq!(levels.len(), 20_001);
        assert_eq!(levels[&1], vec![m(20_000)]);
    }
}
