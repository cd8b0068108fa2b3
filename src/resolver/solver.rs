// src/resolver/solver.rs

//! Turn a dependency graph into install levels
//!
//! Level 0 holds the installed packages to remove; levels 1..N are the
//! install order, dependencies first.

use super::Resolver;
use super::graph::Graph;
use crate::error::{Collision, Error, Result};
use crate::repository::{PackageId, PackageMatch};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Post-dependencies by the package that pulled them in
pub type PostDependencies = BTreeMap<PackageMatch, BTreeSet<PackageMatch>>;

/// Solved levels, 0 = removals
pub type Levels = BTreeMap<usize, Vec<PackageMatch>>;

pub struct GraphSolver<'a> {
    resolver: &'a Resolver,
}

impl<'a> GraphSolver<'a> {
    pub fn new(resolver: &'a Resolver) -> Self {
        Self { resolver }
    }

    /// Layer `graph`, rejecting key+slot collisions
    pub fn solve(
        &self,
        graph: &Graph,
        post_dependencies: &PostDependencies,
        conflicts: &BTreeSet<PackageId>,
    ) -> Result<Levels> {
        self.check_collisions(graph)?;

        let mut layers: Vec<Vec<PackageMatch>> = graph.levels().into_values().collect();
        if self.resolver.config().asap_scheduling {
            layers = schedule_post_dependencies(graph, layers, post_dependencies);
        }

        let mut levels = Levels::new();
        levels.insert(
            0,
            conflicts.iter().map(|&id| PackageMatch::installed(id)).collect(),
        );
        for (idx, layer) in layers.into_iter().filter(|l| !l.is_empty()).enumerate() {
            levels.insert(idx + 1, layer);
        }
        Ok(levels)
    }

    fn check_collisions(&self, graph: &Graph) -> Result<()> {
        let mut by_key_slot: BTreeMap<(String, String), Vec<PackageMatch>> = BTreeMap::new();
        for node in graph.nodes() {
            if let Some(key_slot) = self.resolver.key_slot(node)? {
                by_key_slot.entry(key_slot).or_default().push(node.clone());
            }
        }

        let collisions: Vec<Collision> = by_key_slot
            .into_iter()
            .filter(|(_, matches)| matches.len() > 1)
            .map(|((key, slot), matches)| Collision {
                key,
                slot,
                matches: matches
                    .into_iter()
                    .map(|m| {
                        let requirers = graph.requirers(&m).into_iter().cloned().collect();
                        (m, requirers)
                    })
                    .collect(),
            })
            .collect();

        if collisions.is_empty() {
            Ok(())
        } else {
            Err(Error::DependenciesCollision(collisions))
        }
    }
}

/// Move each post-dependency into a level of its own right after the
/// package that pulled it in, ahead of unrelated packages, when all its
/// dependencies are installed by then.
pub fn schedule_post_dependencies(
    graph: &Graph,
    mut layers: Vec<Vec<PackageMatch>>,
    post_dependencies: &PostDependencies,
) -> Vec<Vec<PackageMatch>> {
    let position = |item: &PackageMatch, layers: &[Vec<PackageMatch>]| {
        layers.iter().position(|layer| layer.contains(item))
    };

    for (trigger, posts) in post_dependencies {
        for post in posts {
            let (Some(trigger_at), Some(post_at)) =
                (position(trigger, &layers), position(post, &layers))
            else {
                continue;
            };
            // same cycle as the trigger, or already alone right after it
            if post_at <= trigger_at || (post_at == trigger_at + 1 && layers[post_at].len() == 1) {
                continue;
            }
            let blocked = graph
                .dependencies(post)
                .into_iter()
                .any(|dep| position(dep, &layers).is_none_or(|at| at > trigger_at));
            if blocked {
                continue;
            }

            debug!("scheduling post-dependency {} right after {}", post, trigger);
            layers[post_at].retain(|item| item != post);
            layers.insert(trigger_at + 1, vec![post.clone()]);
        }
    }
    layers.retain(|layer| !layer.is_empty());
    layers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(id: i64) -> PackageMatch {
        PackageMatch::new(id, "main")
    }

    fn layers(graph: &Graph) -> Vec<Vec<PackageMatch>> {
        graph.levels().into_values().collect()
    }

    #[test]
    fn test_post_dependency_moves_next_to_trigger() {
        let mut graph = Graph::new();
        graph.add(&m(1), &[]);
        graph.add(&m(2), &[]);
        graph.add(&m(3), &[m(2)]);
        graph.add(&m(5), &[m(3)]);
        // post-dependency of 1
        graph.add(&m(4), &[m(1)]);
        assert_eq!(
            layers(&graph),
            vec![vec![m(1), m(2)], vec![m(3), m(4)], vec![m(5)]]
        );

        let post = PostDependencies::from([(m(1), BTreeSet::from([m(4)]))]);
        let scheduled = schedule_post_dependencies(&graph, layers(&graph), &post);
        assert_eq!(
            scheduled,
            vec![vec![m(1), m(2)], vec![m(4)], vec![m(3)], vec![m(5)]]
        );
    }

    #[test]
    fn test_post_dependency_waits_for_its_dependencies() {
        let mut graph = Graph::new();
        graph.add(&m(1), &[]);
        graph.add(&m(2), &[]);
        graph.add(&m(3), &[m(2)]);
        graph.add(&m(5), &[m(3)]);
        graph.add(&m(4), &[m(1), m(3)]);
        let before = layers(&graph);
        assert_eq!(before, vec![vec![m(1), m(2)], vec![m(3)], vec![m(5), m(4)]]);

        let post = PostDependencies::from([(m(1), BTreeSet::from([m(4)]))]);
        assert_eq!(schedule_post_dependencies(&graph, before.clone(), &post), before);
    }

    #[test]
    fn test_post_dependency_already_in_place() {
        let mut graph = Graph::new();
        graph.add(&m(1), &[]);
        graph.add(&m(4), &[m(1)]);
        let before = layers(&graph);

        let post = PostDependencies::from([(m(1), BTreeSet::from([m(4)]))]);
        assert_eq!(schedule_post_dependencies(&graph, before.clone(), &post), before);

        let unknown = PostDependencies::from([(m(9), BTreeSet::from([m(4)]))]);
        assert_eq!(schedule_post_dependencies(&graph, before.clone(), &unknown), before);
    }
}
