// src/resolver/depgraph.rs

//! Dependency graph construction for install requests
//!
//! Each requested match is walked with an explicit stack. Every visited
//! match contributes its unsatisfied dependencies as graph edges; conflicts
//! with installed packages either become removals or pull in a replacement.
//! Missing dependencies are collected across all requests and reported
//! together once the walk is over.

use super::graph::Graph;
use super::hooks::InstallHooks;
use super::matcher::MatchOptions;
use super::solver::PostDependencies;
use super::unsatisfied::UnsatisfiedFilter;
use super::{InstallOptions, PackageAction, Resolver};
use crate::atom::{Atom, split_or_dependency};
use crate::error::{Error, Result};
use crate::repository::{
    DependencyType, MatchFilter, PackageId, PackageMatch, PackageRepository,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Result of a graph build
#[derive(Debug, Clone, Default)]
pub struct DependencyTree {
    pub graph: Graph,
    /// Post-dependencies by the package that pulled them in
    pub post_dependencies: PostDependencies,
    /// Installed packages to remove
    pub conflicts: BTreeSet<PackageId>,
}

/// Outcome of walking one requested match
#[derive(Default)]
struct Walk {
    not_found: BTreeSet<String>,
    conflicts: BTreeSet<PackageId>,
}

pub struct DependencyGraphBuilder<'a> {
    resolver: &'a Resolver,
    hooks: InstallHooks<'a>,
    options: InstallOptions,
    unsatisfied: UnsatisfiedFilter<'a>,
    graph: Graph,
    /// Matches already walked, across requests
    elements: BTreeSet<PackageMatch>,
    post_dependencies: PostDependencies,
    /// Matches requested by the caller
    selected: BTreeSet<PackageMatch>,
    selected_key_slots: Option<BTreeSet<(String, String)>>,
}

impl<'a> DependencyGraphBuilder<'a> {
    pub fn new(resolver: &'a Resolver, options: &InstallOptions) -> Self {
        Self {
            resolver,
            hooks: InstallHooks::new(resolver),
            options: options.clone(),
            unsatisfied: UnsatisfiedFilter::new(resolver, options.deep, options.relaxed),
            graph: Graph::new(),
            elements: BTreeSet::new(),
            post_dependencies: PostDependencies::new(),
            selected: BTreeSet::new(),
            selected_key_slots: None,
        }
    }

    /// Build the dependency graph of `requested`.
    ///
    /// Fails with [`Error::DependenciesNotFound`] listing every dependency
    /// that could not be matched, over all requests.
    pub fn build(mut self, requested: &[PackageMatch]) -> Result<DependencyTree> {
        if let Some(invalid) = requested.iter().find(|m| m.is_not_found()) {
            return Err(Error::InvalidMatch(invalid.clone()));
        }

        let mut matches = self.system_mask_dependencies()?;
        for pkg in requested {
            if !matches.contains(pkg) {
                matches.push(pkg.clone());
            }
        }
        self.selected = matches.iter().cloned().collect();

        let mut not_found = BTreeSet::new();
        let mut conflicts = BTreeSet::new();
        for pkg in &matches {
            debug!("Sorting dependencies of {}", pkg);
            let walk = self.walk(pkg)?;
            if walk.not_found.is_empty() {
                conflicts.extend(walk.conflicts);
            } else {
                not_found.extend(walk.not_found);
            }
        }

        if !not_found.is_empty() {
            return Err(Error::DependenciesNotFound(not_found));
        }
        Ok(DependencyTree {
            graph: self.graph,
            post_dependencies: self.post_dependencies,
            conflicts,
        })
    }

    /// Repository matches of the system mask that are not installed yet
    fn system_mask_dependencies(&self) -> Result<Vec<PackageMatch>> {
        let mut forced = Vec::new();
        for atom in &self.resolver.config().system_mask {
            let Some(found) = self.resolver.atom_match(atom, &MatchOptions::default())? else {
                continue;
            };
            if forced.contains(&found) {
                continue;
            }
            if self.resolver.package_action(&found)? == PackageAction::Install {
                debug!("system mask pulls in {} ({})", atom, found);
                forced.push(found);
            }
        }
        Ok(forced)
    }

    fn walk(&mut self, root: &PackageMatch) -> Result<Walk> {
        let installed = self.resolver.installed();
        let mut walk = Walk::default();
        let mut stack = vec![root.clone()];
        let mut first = true;
        // installed packages losing a library, by the package dropping it
        let mut inverse_edges: BTreeMap<PackageMatch, BTreeSet<PackageMatch>> = BTreeMap::new();
        let mut walked = Vec::new();

        while let Some(pkg) = stack.pop() {
            if !self.elements.insert(pkg.clone()) {
                continue;
            }
            let repo = self.resolver.open_repository(&pkg.repository)?;

            let mut add_to_graph = true;
            if first {
                first = false;
                if self.options.only_deps {
                    add_to_graph = false;
                } else if repo.mask_filter(pkg.package_id)?.is_none() {
                    let atom = repo
                        .retrieve_atom(pkg.package_id)?
                        .unwrap_or_else(|| "N/A".to_string());
                    debug!("requested package {} is masked", atom);
                    walk.not_found.insert(atom);
                    continue;
                }
            }

            let Some((key, slot)) = repo.retrieve_key_slot(pkg.package_id)? else {
                walk.not_found
                    .insert(format!("unknown_{}_{}", pkg.package_id, pkg.repository));
                continue;
            };

            if let Some(installed_id) = installed.atom_match(&key, &MatchFilter::with_slot(slot))? {
                let children = self.hooks.library_drops(&pkg, installed_id)?;
                let (after, before) = self.hooks.library_breakages(&pkg, installed_id)?;
                let inverse = self.hooks.inverse_dependencies(
                    &pkg,
                    installed_id,
                    self.options.build,
                    &self.elements,
                )?;

                stack.extend(inverse);
                for child in &children {
                    inverse_edges
                        .entry(child.clone())
                        .or_default()
                        .insert(pkg.clone());
                    stack.push(child.clone());
                }
                for extra in after.iter().chain(&before) {
                    if !children.contains(extra) {
                        stack.push(extra.clone());
                    }
                }
                if !before.is_empty() {
                    self.graph.add(&pkg, &before);
                }
            }

            let (dependencies, post) = self.analyze_dependencies(&pkg, repo, &mut stack, &mut walk)?;
            if !post.is_empty() {
                self.post_dependencies
                    .entry(pkg.clone())
                    .or_default()
                    .extend(post.iter().cloned());
            }

            if add_to_graph {
                self.graph.add(&pkg, &dependencies);
            }
            for post_dependency in &post {
                self.graph.add(post_dependency, [&pkg]);
            }
            walked.push(pkg);
        }

        for pkg in walked {
            if let Some(dropping) = inverse_edges.get(&pkg) {
                self.graph.add(&pkg, dropping);
            }
        }
        Ok(walk)
    }

    /// Matched dependencies and post-dependencies of `pkg`, handling its
    /// conflicts on the way
    fn analyze_dependencies(
        &mut self,
        pkg: &PackageMatch,
        repo: &dyn PackageRepository,
        stack: &mut Vec<PackageMatch>,
        walk: &mut Walk,
    ) -> Result<(BTreeSet<PackageMatch>, BTreeSet<PackageMatch>)> {
        let mut exclude = vec![DependencyType::Post];
        if !self.options.build {
            exclude.push(DependencyType::Build);
        }
        let declared = repo.retrieve_dependencies(pkg.package_id, &exclude)?;
        let mut dependencies = self.resolve_or_dependencies(declared)?;
        for conflict in repo.retrieve_conflicts(pkg.package_id)? {
            dependencies.insert(format!("!{}", conflict));
        }

        let mut conflicts: BTreeSet<String> = dependencies
            .iter()
            .filter(|d| d.starts_with('!'))
            .cloned()
            .collect();
        conflicts.extend(self.hooks.inverse_conflicts(pkg)?);
        dependencies.retain(|d| !d.starts_with('!'));
        for conflict in &conflicts {
            self.analyze_conflict(pkg, conflict, stack, &mut walk.conflicts)?;
        }

        if !self.options.empty {
            dependencies = self.unsatisfied.filter(&dependencies)?;
            dependencies = self.rewrite_selected_matches(dependencies)?;
        }

        let mut post: BTreeSet<String> = repo
            .retrieve_dependency_entries(pkg.package_id)?
            .into_iter()
            .filter(|d| d.dep_type == DependencyType::Post)
            .map(|d| d.atom)
            .collect();
        dependencies.retain(|d| !post.contains(d));
        if !self.options.empty && !post.is_empty() {
            let mut kept = BTreeSet::new();
            for dependency in post {
                // already pulled in: would only close a cycle
                let matches = self
                    .resolver
                    .atom_match_multi(&dependency, &MatchOptions::multi_repo())?;
                if matches.is_disjoint(&self.elements) {
                    kept.insert(dependency);
                }
            }
            let resolved = self.resolve_or_dependencies(kept)?;
            post = self.unsatisfied.filter(&resolved)?;
        }

        let mut matches = BTreeSet::new();
        for dependency in &dependencies {
            match self.resolver.atom_match(dependency, &MatchOptions::default())? {
                Some(found) => {
                    if self.options.recursive {
                        stack.push(found.clone());
                    }
                    matches.insert(found);
                }
                None => {
                    debug!("dependency {} of {} not found", dependency, pkg);
                    walk.not_found.insert(dependency.clone());
                }
            }
        }

        let mut post_matches = BTreeSet::new();
        for dependency in &post {
            // a missing post-dependency is not an error
            let Some(found) = self.resolver.atom_match(dependency, &MatchOptions::default())? else {
                continue;
            };
            if self.options.recursive {
                stack.push(found.clone());
            }
            post_matches.insert(found);
        }

        Ok((matches, post_matches))
    }

    fn analyze_conflict(
        &mut self,
        pkg: &PackageMatch,
        conflict: &str,
        stack: &mut Vec<PackageMatch>,
        conflicts: &mut BTreeSet<PackageId>,
    ) -> Result<()> {
        let atom = conflict.trim_start_matches('!');
        let installed = self.resolver.installed();
        let Some(installed_id) = installed.atom_match(atom, &MatchFilter::default())? else {
            return Ok(());
        };

        if let Some(replacement) = self.conflict_replacement(atom, installed_id)? {
            debug!("conflict {} of {} replaced by {}", conflict, pkg, replacement);
            self.graph.add(pkg, [&replacement]);
            stack.push(replacement);
            return Ok(());
        }

        debug!("conflict {} of {} removes installed {}", conflict, pkg, installed_id);
        conflicts.insert(installed_id);
        Ok(())
    }

    /// Repository update of a conflicting installed package that no longer
    /// matches the conflict
    fn conflict_replacement(&self, atom: &str, installed_id: PackageId) -> Result<Option<PackageMatch>> {
        if Atom::parse(atom).is_none_or(|a| a.is_just_name()) {
            return Ok(None);
        }

        let conflict_match = self.resolver.atom_match(atom, &MatchOptions::default())?;
        let Some((key, slot)) = self.resolver.installed().retrieve_key_slot(installed_id)? else {
            return Ok(None);
        };
        let Some(replacement) = self.resolver.atom_match(&key, &MatchOptions::with_slot(slot))? else {
            return Ok(None);
        };
        if conflict_match.as_ref() == Some(&replacement) {
            return Ok(None);
        }
        if !self.options.deep
            && self.resolver.package_action_against(&replacement, installed_id)? == PackageAction::Reinstall
        {
            return Ok(None);
        }
        Ok(Some(replacement))
    }

    fn resolve_or_dependencies(&mut self, dependencies: BTreeSet<String>) -> Result<BTreeSet<String>> {
        let mut resolved = BTreeSet::new();
        for dependency in dependencies {
            match split_or_dependency(&dependency) {
                Some(alternatives) => {
                    let choice = self.resolve_or_dependency(&alternatives)?;
                    debug!("or dependency {} resolved to {}", dependency, choice);
                    resolved.insert(choice);
                }
                None => {
                    resolved.insert(dependency);
                }
            }
        }
        Ok(resolved)
    }

    /// Pick one alternative of an or-dependency: one already selected,
    /// else one installed without colliding with the selected matches,
    /// else the first available, else the first one.
    fn resolve_or_dependency(&mut self, alternatives: &[&str]) -> Result<String> {
        let installed = self.resolver.installed();

        let mut available = Vec::new();
        for alternative in alternatives {
            let matches = self
                .resolver
                .atom_match_multi(alternative, &MatchOptions::multi_repo())?;
            if !matches.is_empty() {
                available.push((*alternative, matches));
            }
        }

        for (alternative, matches) in &available {
            if !matches.is_disjoint(&self.selected) {
                return Ok(alternative.to_string());
            }

            let installed_ids = installed.atom_match_multi(alternative, &MatchFilter::default())?;
            if installed_ids.is_empty() {
                continue;
            }
            let mut key_slots = BTreeSet::new();
            for package_id in installed_ids {
                if let Some(key_slot) = installed.retrieve_key_slot(package_id)? {
                    key_slots.insert(key_slot);
                }
            }
            if key_slots.is_disjoint(self.selected_key_slots()?) {
                return Ok(alternative.to_string());
            }
        }

        Ok(available
            .first()
            .map(|(alternative, _)| *alternative)
            .or_else(|| alternatives.first().copied())
            .unwrap_or_default()
            .to_string())
    }

    fn selected_key_slots(&mut self) -> Result<&BTreeSet<(String, String)>> {
        if self.selected_key_slots.is_none() {
            let mut key_slots = BTreeSet::new();
            for selected in &self.selected {
                if let Some(key_slot) = self.resolver.key_slot(selected)? {
                    key_slots.insert(key_slot);
                }
            }
            self.selected_key_slots = Some(key_slots);
        }
        Ok(self.selected_key_slots.get_or_insert_with(BTreeSet::new))
    }

    /// Point dependencies satisfiable by a requested match at that match's
    /// key and slot
    fn rewrite_selected_matches(&self, dependencies: BTreeSet<String>) -> Result<BTreeSet<String>> {
        if !self.resolver.config().rewrite_selected_matches || self.selected.is_empty() {
            return Ok(dependencies);
        }

        let mut rewritten = BTreeSet::new();
        'dependencies: for dependency in dependencies {
            let matches = self
                .resolver
                .atom_match_multi(&dependency, &MatchOptions::multi_repo())?;
            for selected in matches.intersection(&self.selected) {
                if let Some(key_slot) = self.resolver.key_slot_atom(selected)? {
                    debug!("rewriting {} to selected {}", dependency, key_slot);
                    rewritten.insert(key_slot);
                    continue 'dependencies;
                }
            }
            rewritten.insert(dependency);
        }
        Ok(rewritten)
    }
}
