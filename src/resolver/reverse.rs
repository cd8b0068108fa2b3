// src/resolver/reverse.rs

//! Removal closures
//!
//! Walks reverse dependencies of the packages to remove with an explicit
//! stack. The graph has an edge from each package to the packages that
//! depend on it, so after layering level 1 holds packages nothing left
//! depends on: removals run from level 1 upwards.

use super::graph::Graph;
use super::matcher::MatchOptions;
use super::solver::Levels;
use super::{RemovalOptions, Resolver, SystemMask};
use crate::atom::split_or_dependency;
use crate::error::{Error, Result};
use crate::repository::{
    DependencyType, MatchFilter, PackageId, PackageMatch, PackageRepository,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

const REVERSE_EXCLUDED: [DependencyType; 2] = [DependencyType::Post, DependencyType::Build];

pub struct ReverseDependencyResolver<'a> {
    resolver: &'a Resolver,
    options: RemovalOptions,
    system_mask: SystemMask,
    graph: Graph,
    visited: BTreeSet<PackageMatch>,
    multimatch_cache: HashMap<PackageMatch, BTreeSet<PackageMatch>>,
    /// Remaining providers of each library, by (repository, soname, elf class)
    providers_left: HashMap<(String, String, i32), BTreeSet<PackageId>>,
    /// Deep mode: dependency -> packages still depending on it
    deep_dependencies: BTreeMap<PackageMatch, BTreeSet<PackageMatch>>,
    /// Deep mode: dependency -> removed packages that depended on it
    deep_parents: BTreeMap<PackageMatch, BTreeSet<PackageMatch>>,
}

impl<'a> ReverseDependencyResolver<'a> {
    pub fn new(resolver: &'a Resolver, options: &RemovalOptions) -> Result<Self> {
        Ok(Self {
            resolver,
            options: options.clone(),
            system_mask: resolver.system_mask()?,
            graph: Graph::new(),
            visited: BTreeSet::new(),
            multimatch_cache: HashMap::new(),
            providers_left: HashMap::new(),
            deep_dependencies: BTreeMap::new(),
            deep_parents: BTreeMap::new(),
        })
    }

    /// Layered removal closure of `matches`.
    ///
    /// Fails with [`Error::DependenciesNotRemovable`] when system
    /// protection is on and the closure reaches a protected package.
    pub fn remove_closure(mut self, matches: &[PackageMatch]) -> Result<Levels> {
        let resolver = self.resolver;
        let mut stack: Vec<PackageMatch> = matches.to_vec();
        let mut not_removable = BTreeSet::new();
        let mut empty = self.options.empty;

        while let Some(pkg) = stack.pop() {
            if !self.visited.insert(pkg.clone()) {
                continue;
            }

            if self.options.system_packages
                && !resolver.validate_removal_with(&pkg, &self.system_mask)?
            {
                debug!("{} is a system package, removal forbidden", pkg);
                not_removable.insert(pkg);
                continue;
            }

            let repo = resolver.open_repository(&pkg.repository)?;
            let Some(atom) = repo.retrieve_atom(pkg.package_id)? else {
                debug!("{} not available", pkg);
                continue;
            };
            debug!("Calculating inverse dependencies for {}", atom);

            let mut reverse = self.reverse_dependencies(&pkg, repo)?;
            if resolver.config().elf_needed_scanning {
                reverse.extend(self.library_reverse_dependencies(&pkg, repo)?);
            }

            if self.options.deep {
                let direct = self.direct_dependencies(&pkg, repo)?;
                let dependencies = self.filter_dependencies(direct)?;
                if empty {
                    reverse.extend(dependencies);
                } else {
                    self.track_dependencies(&pkg, dependencies)?;
                }
                empty = false;
            }

            if self.options.recursive {
                stack.extend(reverse.iter().cloned());
            }
            self.graph.add(&pkg, &reverse);
        }

        if !not_removable.is_empty() {
            return Err(Error::DependenciesNotRemovable(not_removable));
        }
        if self.options.deep {
            self.collect_orphans()?;
        }
        Ok(self.graph.levels())
    }

    /// Installed-style reverse dependencies, minus or-dependencies still
    /// satisfied by another alternative and multi-matched dependencies
    fn reverse_dependencies(
        &mut self,
        pkg: &PackageMatch,
        repo: &dyn PackageRepository,
    ) -> Result<BTreeSet<PackageMatch>> {
        let filter = MatchFilter::default();
        let mut reverse = BTreeSet::new();

        for (package_id, dependency) in repo.retrieve_reverse_dependencies(pkg.package_id, &REVERSE_EXCLUDED)? {
            if let Some(alternatives) = split_or_dependency(&dependency) {
                let mut others = BTreeSet::new();
                for alternative in alternatives {
                    if let Some(found) = repo.atom_match(alternative, &filter)? {
                        others.insert(found);
                    }
                }
                others.remove(&pkg.package_id);
                let satisfied = others
                    .into_iter()
                    .map(|id| PackageMatch::new(id, pkg.repository.as_str()))
                    .any(|other| !self.visited.contains(&other));
                if satisfied {
                    debug!("ignoring {} for {}: {} still satisfied", package_id, pkg, dependency);
                    continue;
                }
            }
            reverse.insert(PackageMatch::new(package_id, pkg.repository.as_str()));
        }

        if !reverse.is_empty() {
            reverse = self.filter_multimatched(pkg, reverse)?;
        }
        Ok(reverse)
    }

    /// Drop reverse dependencies whose dependency also matches packages
    /// outside `depends`
    fn filter_multimatched(
        &mut self,
        pkg: &PackageMatch,
        depends: BTreeSet<PackageMatch>,
    ) -> Result<BTreeSet<PackageMatch>> {
        let resolver = self.resolver;
        let filter = MatchFilter::default();
        let mut dropped = BTreeSet::new();

        for dependent in &depends {
            if let Some(cached) = self.multimatch_cache.get(dependent) {
                dropped.extend(cached.iter().cloned());
                continue;
            }

            let repo = resolver.open_repository(&dependent.repository)?;
            let mut satisfied = BTreeSet::new();
            for dependency in repo.retrieve_dependencies(dependent.package_id, &[DependencyType::Build])? {
                let matches: BTreeSet<PackageMatch> = repo
                    .atom_match_multi(&dependency, &filter)?
                    .into_iter()
                    .map(|id| PackageMatch::new(id, dependent.repository.as_str()))
                    .collect();
                if matches.len() > 1
                    && matches.contains(pkg)
                    && matches.iter().any(|m| !depends.contains(m))
                {
                    debug!("{} still satisfied through {}", dependent, dependency);
                    satisfied.insert(dependent.clone());
                }
            }
            dropped.extend(satisfied.iter().cloned());
            self.multimatch_cache.insert(dependent.clone(), satisfied);
        }

        Ok(depends.into_iter().filter(|m| !dropped.contains(m)).collect())
    }

    /// Packages linking against libraries only `pkg` provides
    fn library_reverse_dependencies(
        &mut self,
        pkg: &PackageMatch,
        repo: &dyn PackageRepository,
    ) -> Result<BTreeSet<PackageMatch>> {
        let mut reverse = BTreeSet::new();
        for lib in repo.retrieve_provided_libraries(pkg.package_id)? {
            let key = (pkg.repository.clone(), lib.soname.clone(), lib.elf_class);
            if !self.providers_left.contains_key(&key) {
                let providers = repo
                    .resolve_needed(&lib.soname, lib.elf_class)?
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect();
                self.providers_left.insert(key.clone(), providers);
            }
            let Some(providers) = self.providers_left.get_mut(&key) else {
                continue;
            };
            providers.remove(&pkg.package_id);
            if !providers.is_empty() {
                debug!("{} still provided by {:?}", lib.soname, providers);
                continue;
            }

            for package_id in repo.search_needed(&lib.soname, lib.elf_class)? {
                reverse.insert(PackageMatch::new(package_id, pkg.repository.as_str()));
            }
        }

        if !reverse.is_empty() {
            reverse = self.filter_multimatched(pkg, reverse)?;
        }
        reverse.remove(pkg);

        // a tagged package must not pull in its siblings of other tags
        if !reverse.is_empty() {
            if let Some(record) = repo.retrieve_record(pkg.package_id)? {
                if !record.tag.is_empty() {
                    let key_slot = (record.key(), record.slot);
                    let mut kept = BTreeSet::new();
                    for dependent in reverse {
                        if self.resolver.key_slot(&dependent)?.as_ref() != Some(&key_slot) {
                            kept.insert(dependent);
                        }
                    }
                    reverse = kept;
                }
            }
        }
        Ok(reverse)
    }

    fn direct_dependencies(
        &self,
        pkg: &PackageMatch,
        repo: &dyn PackageRepository,
    ) -> Result<BTreeSet<PackageMatch>> {
        let mut matches = BTreeSet::new();
        for dependency in repo.retrieve_dependencies(pkg.package_id, &[DependencyType::Build])? {
            if pkg.is_installed() {
                if let Some(package_id) = repo.atom_match(&dependency, &MatchFilter::default())? {
                    matches.insert(PackageMatch::installed(package_id));
                }
            } else if let Some(found) = self.resolver.atom_match(&dependency, &MatchOptions::default())? {
                matches.insert(found);
            }
        }
        Ok(matches)
    }

    /// Drop protected packages from deep removal candidates
    fn filter_dependencies(&self, dependencies: BTreeSet<PackageMatch>) -> Result<BTreeSet<PackageMatch>> {
        if !self.options.system_packages {
            return Ok(dependencies);
        }
        let mut kept = BTreeSet::new();
        for dependency in dependencies {
            let repo = self.resolver.open_repository(&dependency.repository)?;
            if repo.is_system_package(dependency.package_id)? {
                debug!("{} is a system package, not removing", dependency);
                continue;
            }
            if dependency.is_installed() && self.system_mask.ids.contains(&dependency.package_id) {
                debug!("{} is in the system mask, not removing", dependency);
                continue;
            }
            kept.insert(dependency);
        }
        Ok(kept)
    }

    fn track_dependencies(&mut self, parent: &PackageMatch, dependencies: BTreeSet<PackageMatch>) -> Result<()> {
        let resolver = self.resolver;
        for dependency in dependencies {
            let repo = resolver.open_repository(&dependency.repository)?;
            let dependents = repo
                .retrieve_reverse_dependencies(dependency.package_id, &REVERSE_EXCLUDED)?
                .into_iter()
                .map(|(id, _)| PackageMatch::new(id, dependency.repository.as_str()))
                .collect();
            self.deep_dependencies.insert(dependency.clone(), dependents);
            self.deep_parents
                .entry(dependency)
                .or_default()
                .insert(parent.clone());
        }
        Ok(())
    }

    /// Add dependencies left without dependents, until none is found.
    ///
    /// Each orphan is removed after the packages that depended on it.
    fn collect_orphans(&mut self) -> Result<()> {
        let resolver = self.resolver;
        let mut removed: BTreeSet<PackageMatch> = self.graph.nodes().cloned().collect();

        loop {
            let mut changed = false;
            let candidates: Vec<PackageMatch> = self.deep_dependencies.keys().cloned().collect();
            for candidate in candidates {
                if removed.contains(&candidate) {
                    continue;
                }
                let Some(dependents) = self.deep_dependencies.get_mut(&candidate) else {
                    continue;
                };
                dependents.retain(|m| !removed.contains(m));
                if !dependents.is_empty() {
                    continue;
                }

                let parents: Vec<PackageMatch> = self
                    .deep_parents
                    .get(&candidate)
                    .map(|p| p.iter().filter(|m| removed.contains(m)).cloned().collect())
                    .unwrap_or_default();
                debug!("{} is no longer needed", candidate);
                self.graph.add(&candidate, &parents);
                removed.insert(candidate.clone());

                let repo = resolver.open_repository(&candidate.repository)?;
                let direct = self.direct_dependencies(&candidate, repo)?;
                let dependencies = self.filter_dependencies(direct)?;
                self.track_dependencies(&candidate, dependencies)?;
                changed = true;
            }
            if !changed {
                return Ok(());
            }
        }
    }
}
