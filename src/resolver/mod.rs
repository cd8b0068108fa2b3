// src/resolver/mod.rs

//! Dependency resolution
//!
//! Turns requested package matches into ordered install and removal
//! queues:
//!
//! - [`AtomMatcher`] picks the best match of an atom across repositories
//! - [`UnsatisfiedFilter`] keeps the dependencies the installed system
//!   does not satisfy
//! - [`DependencyGraphBuilder`] walks dependencies, conflicts and library
//!   breakages into a [`Graph`]
//! - [`GraphSolver`] layers the graph into install levels
//! - [`ReverseDependencyResolver`] computes removal closures
//!
//! [`Resolver`] ties them together over one [`RepositorySet`].

mod depgraph;
mod graph;
mod hooks;
mod matcher;
mod repositories;
mod reverse;
mod solver;
mod unsatisfied;

pub use depgraph::{DependencyGraphBuilder, DependencyTree};
pub use graph::Graph;
pub use hooks::VIRTUAL_CATEGORY;
pub use matcher::{AtomMatcher, MatchCache, MatchOptions};
pub use repositories::RepositorySet;
pub use reverse::ReverseDependencyResolver;
pub use solver::{GraphSolver, Levels, PostDependencies};
pub use unsatisfied::UnsatisfiedFilter;

use crate::atom::{dependency_key, key_slot_atom};
use crate::config::ResolverConfig;
use crate::error::Result;
use crate::repository::{MatchFilter, PackageId, PackageMatch, PackageRepository};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// What installing a repository package does to the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageAction {
    /// No installed package with the same key and slot
    Install,
    /// Same version, tag, revision and digest
    Reinstall,
    Upgrade,
    Downgrade,
}

impl PackageAction {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Install => "install",
            Self::Reinstall => "reinstall",
            Self::Upgrade => "upgrade",
            Self::Downgrade => "downgrade",
        }
    }
}

impl fmt::Display for PackageAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Options of [`Resolver::get_install_queue`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    /// Pull in every dependency, satisfied or not
    pub empty: bool,
    /// Treat same-version packages with a different digest as stale
    pub deep: bool,
    /// Installed packages satisfy their dependencies whatever their version
    pub relaxed: bool,
    /// Include build dependencies
    pub build: bool,
    /// Walk dependencies of dependencies
    pub recursive: bool,
    /// Install the dependencies of the requested packages only
    pub only_deps: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            empty: false,
            deep: false,
            relaxed: false,
            build: false,
            recursive: true,
            only_deps: false,
        }
    }
}

/// Options of [`Resolver::get_removal_queue`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalOptions {
    /// Also remove dependencies nothing else needs anymore
    pub deep: bool,
    /// Walk reverse dependencies of reverse dependencies
    pub recursive: bool,
    /// With `deep`, pull in every direct dependency of the first package
    pub empty: bool,
    /// Refuse to remove system packages
    pub system_packages: bool,
}

impl Default for RemovalOptions {
    fn default() -> Self {
        Self {
            deep: false,
            recursive: true,
            empty: false,
            system_packages: true,
        }
    }
}

/// Ordered install queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallQueue {
    /// Packages to install, dependencies first
    pub install: Vec<PackageMatch>,
    /// Installed packages to remove beforehand
    pub removal: Vec<PackageId>,
}

/// Result of [`Resolver::check_package_update`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCheck {
    pub available: bool,
    /// Repository match of the installed version
    pub matched: Option<PackageMatch>,
}

/// Installed packages protected by [`ResolverConfig::system_mask`]
#[derive(Debug, Clone, Default)]
pub struct SystemMask {
    pub ids: BTreeSet<PackageId>,
    /// Protected ids by package key
    pub keys: BTreeMap<String, BTreeSet<PackageId>>,
}

/// Resolver over one repository set
pub struct Resolver {
    repositories: RepositorySet,
    config: ResolverConfig,
    cache: Arc<MatchCache>,
    fingerprint: String,
}

impl Resolver {
    pub fn new(repositories: RepositorySet, config: ResolverConfig) -> Result<Self> {
        Self::with_cache(repositories, config, Arc::new(MatchCache::new()))
    }

    /// Resolver memoizing matches into a shared cache
    pub fn with_cache(repositories: RepositorySet, config: ResolverConfig, cache: Arc<MatchCache>) -> Result<Self> {
        let fingerprint = repositories.checksum()?;
        debug!("Repository set fingerprint: {}", fingerprint);
        Ok(Self {
            repositories,
            config,
            cache,
            fingerprint,
        })
    }

    pub fn repositories(&self) -> &RepositorySet {
        &self.repositories
    }

    pub fn installed(&self) -> &dyn PackageRepository {
        self.repositories.installed()
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn open_repository(&self, name: &str) -> Result<&dyn PackageRepository> {
        self.repositories.open_repository(name)
    }

    pub fn matcher(&self) -> AtomMatcher<'_> {
        AtomMatcher::with_cache(&self.repositories, &self.cache, &self.fingerprint)
    }

    /// Best repository match of `atom`
    pub fn atom_match(&self, atom: &str, options: &MatchOptions) -> Result<Option<PackageMatch>> {
        self.matcher().atom_match(atom, options)
    }

    pub fn atom_match_multi(&self, atom: &str, options: &MatchOptions) -> Result<BTreeSet<PackageMatch>> {
        self.matcher().atom_match_multi(atom, options)
    }

    /// `(key, slot)` of a match, from whichever repository it names
    pub fn key_slot(&self, pkg: &PackageMatch) -> Result<Option<(String, String)>> {
        self.open_repository(&pkg.repository)?
            .retrieve_key_slot(pkg.package_id)
    }

    /// `key:slot` atom of a match
    pub fn key_slot_atom(&self, pkg: &PackageMatch) -> Result<Option<String>> {
        Ok(self
            .key_slot(pkg)?
            .map(|(key, slot)| key_slot_atom(&key, &slot)))
    }

    /// Compare `pkg` with the installed package of the same key and slot
    pub fn package_action(&self, pkg: &PackageMatch) -> Result<PackageAction> {
        let Some((key, slot)) = self.key_slot(pkg)? else {
            return Ok(PackageAction::Install);
        };
        let installed = self.installed();
        let mut installed_id = None;
        let filter = MatchFilter {
            mask_filter: false,
            ..MatchFilter::with_slot(slot.as_str())
        };
        for package_id in installed.atom_match_multi(&key, &filter)? {
            if installed.retrieve_key_slot(package_id)?.is_some_and(|(_, s)| s == slot) {
                installed_id = installed_id.max(Some(package_id));
            }
        }
        match installed_id {
            Some(installed_id) => self.package_action_against(pkg, installed_id),
            None => Ok(PackageAction::Install),
        }
    }

    /// Compare `pkg` with a given installed package
    pub fn package_action_against(&self, pkg: &PackageMatch, installed_id: PackageId) -> Result<PackageAction> {
        let repo = self.open_repository(&pkg.repository)?;
        let (Some(available), Some(current)) = (
            repo.retrieve_record(pkg.package_id)?,
            self.installed().retrieve_record(installed_id)?,
        ) else {
            return Ok(PackageAction::Install);
        };

        Ok(match available.version_key().cmp(&current.version_key()) {
            Ordering::Equal if available.digest != current.digest => PackageAction::Upgrade,
            Ordering::Equal => PackageAction::Reinstall,
            Ordering::Greater => PackageAction::Upgrade,
            Ordering::Less => PackageAction::Downgrade,
        })
    }

    /// Installed packages matched by the configured system mask
    pub fn system_mask(&self) -> Result<SystemMask> {
        let installed = self.installed();
        let mut mask = SystemMask::default();
        for atom in &self.config.system_mask {
            let ids = installed.atom_match_multi(atom, &MatchFilter::default())?;
            if ids.is_empty() {
                continue;
            }
            if let Some(key) = dependency_key(atom) {
                mask.keys.entry(key).or_default().extend(ids.iter().copied());
            }
            mask.ids.extend(ids);
        }
        Ok(mask)
    }

    /// Whether `pkg` may be removed without breaking the system
    pub fn validate_package_removal(&self, pkg: &PackageMatch) -> Result<bool> {
        let mask = self.system_mask()?;
        self.validate_removal_with(pkg, &mask)
    }

    pub(crate) fn validate_removal_with(&self, pkg: &PackageMatch, mask: &SystemMask) -> Result<bool> {
        let repo = self.open_repository(&pkg.repository)?;
        let Some((key, _)) = repo.retrieve_key_slot(pkg.package_id)? else {
            return Ok(true);
        };

        if pkg.is_installed() && mask.ids.contains(&pkg.package_id) {
            return Ok(mask.keys.get(&key).is_some_and(|ids| ids.len() > 1));
        }

        if !self.is_system_package(pkg, repo)? {
            return Ok(true);
        }
        // another slot or version can take over
        let alternatives = repo.atom_match_multi(&key, &MatchFilter::default())?;
        Ok(alternatives.len() > 1)
    }

    /// Flagged as system, or needed by a package flagged as system
    fn is_system_package(&self, pkg: &PackageMatch, repo: &dyn PackageRepository) -> Result<bool> {
        if repo.is_system_package(pkg.package_id)? {
            return Ok(true);
        }

        let mut seen = BTreeSet::new();
        for (dependent, _) in repo.retrieve_reverse_dependencies(pkg.package_id, &[])? {
            let Some((key, slot)) = repo.retrieve_key_slot(dependent)? else {
                continue;
            };
            if !seen.insert((key.clone(), slot.clone())) {
                continue;
            }
            if repo.is_system_package(dependent)? {
                debug!("{} is needed by system package {}", pkg, dependent);
                return Ok(true);
            }
            let Some(found) = self.atom_match(&key, &MatchOptions::with_slot(slot))? else {
                continue;
            };
            if self
                .open_repository(&found.repository)?
                .is_system_package(found.package_id)?
            {
                debug!("{} is needed by system package {}", pkg, found);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether the installed package matching `atom` has an update with
    /// the same version, and its repository match
    pub fn check_package_update(&self, atom: &str, deep: bool) -> Result<UpdateCheck> {
        let installed = self.installed();
        let not_installed = UpdateCheck {
            available: false,
            matched: None,
        };
        let Some(installed_id) = installed.atom_match(atom, &MatchFilter::default())? else {
            return Ok(not_installed);
        };
        let Some(record) = installed.retrieve_record(installed_id)? else {
            return Ok(not_installed);
        };

        let mut pinned = format!("={}-{}~{}", record.key(), record.version, record.revision);
        if !record.tag.is_empty() {
            pinned.push('#');
            pinned.push_str(&record.tag);
        }

        let mut unsatisfied = UnsatisfiedFilter::new(self, deep, false);
        let available = unsatisfied.is_unsatisfied(&pinned)?
            && self.atom_match(&record.key(), &MatchOptions::default())?.is_some();
        let matched = self.atom_match(&pinned, &MatchOptions::default())?;
        debug!("update check {}: {} (available: {})", atom, pinned, available);
        Ok(UpdateCheck { available, matched })
    }

    /// Ordered install queue for `requested`, plus the installed packages
    /// to remove first
    pub fn get_install_queue(&self, requested: &[PackageMatch], options: &InstallOptions) -> Result<InstallQueue> {
        info!("Calculating dependencies of {} package(s)", requested.len());
        let tree = DependencyGraphBuilder::new(self, options).build(requested)?;
        let levels = GraphSolver::new(self).solve(&tree.graph, &tree.post_dependencies, &tree.conflicts)?;

        let mut queue = InstallQueue::default();
        let mut conflicts = BTreeSet::new();
        for (level, matches) in levels {
            if level == 0 {
                conflicts.extend(matches.into_iter().map(|m| m.package_id));
            } else {
                queue.install.extend(matches);
            }
        }

        // conflicts replaced by the install queue go away on their own
        let mut replaced = BTreeSet::new();
        for pkg in &queue.install {
            if let Some(key_slot) = self.key_slot(pkg)? {
                replaced.insert(key_slot);
            }
        }
        for package_id in conflicts {
            let key_slot = self.installed().retrieve_key_slot(package_id)?;
            if key_slot.is_some_and(|ks| replaced.contains(&ks)) {
                debug!("conflicting {} is replaced by the install queue", package_id);
                continue;
            }
            queue.removal.push(package_id);
        }

        info!(
            "{} package(s) to install, {} to remove",
            queue.install.len(),
            queue.removal.len()
        );
        Ok(queue)
    }

    /// Removal order of installed packages, dependents first
    pub fn get_removal_queue(&self, package_ids: &[PackageId], options: &RemovalOptions) -> Result<Vec<PackageId>> {
        let matches: Vec<PackageMatch> = package_ids
            .iter()
            .map(|&package_id| PackageMatch::installed(package_id))
            .collect();
        Ok(self
            .get_reverse_queue(&matches, options)?
            .into_iter()
            .map(|m| m.package_id)
            .collect())
    }

    /// Removal order of matches from any repository, dependents first
    pub fn get_reverse_queue(&self, matches: &[PackageMatch], options: &RemovalOptions) -> Result<Vec<PackageMatch>> {
        info!("Calculating removal closure of {} package(s)", matches.len());
        let levels = ReverseDependencyResolver::new(self, options)?.remove_closure(matches)?;
        let queue: Vec<PackageMatch> = levels.into_values().flatten().collect();
        info!("{} package(s) to remove", queue.len());
        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::repository::{InMemoryRepository, PackageMetadata};

    fn resolver_with(
        installed: Vec<PackageMetadata>,
        available: Vec<PackageMetadata>,
        config: ResolverConfig,
    ) -> Resolver {
        let mut inst = InMemoryRepository::installed();
        for package in installed {
            inst.add(package);
        }
        let mut repo = InMemoryRepository::new("main");
        for package in available {
            repo.add(package);
        }
        let set = RepositorySet::new(inst).with_repository(repo).unwrap();
        Resolver::new(set, config).unwrap()
    }

    fn resolver(installed: Vec<PackageMetadata>, available: Vec<PackageMetadata>) -> Resolver {
        resolver_with(installed, available, ResolverConfig::default())
    }

    fn main(id: PackageId) -> PackageMatch {
        PackageMatch::new(id, "main")
    }

    #[test]
    fn test_package_action() {
        let resolver = resolver(
            vec![
                PackageMetadata::new("app", "foo", "1.0").digest("aaa"),
                PackageMetadata::new("app", "bar", "2.0"),
            ],
            vec![
                PackageMetadata::new("app", "foo", "1.0").digest("aaa"),
                PackageMetadata::new("app", "foo", "1.0").digest("bbb").slot("1"),
                PackageMetadata::new("app", "foo", "2.0").slot("0"),
                PackageMetadata::new("app", "bar", "1.0"),
                PackageMetadata::new("app", "baz", "1.0"),
            ],
        );

        assert_eq!(resolver.package_action(&main(1)).unwrap(), PackageAction::Reinstall);
        // other slot
        assert_eq!(resolver.package_action(&main(2)).unwrap(), PackageAction::Install);
        assert_eq!(resolver.package_action(&main(3)).unwrap(), PackageAction::Upgrade);
        assert_eq!(resolver.package_action(&main(4)).unwrap(), PackageAction::Downgrade);
        assert_eq!(resolver.package_action(&main(5)).unwrap(), PackageAction::Install);

        assert_eq!(
            resolver.package_action_against(&main(2), 1).unwrap(),
            PackageAction::Upgrade
        );
    }

    #[test]
    fn test_key_slot_atom() {
        let resolver = resolver(vec![], vec![PackageMetadata::new("app", "foo", "1.0").slot("2")]);
        assert_eq!(
            resolver.key_slot_atom(&main(1)).unwrap().as_deref(),
            Some("app/foo:2")
        );
        assert_eq!(resolver.key_slot_atom(&main(7)).unwrap(), None);
        assert!(matches!(
            resolver.key_slot(&PackageMatch::new(1, "nowhere")),
            Err(Error::RepositoryNotFound(_))
        ));
    }

    #[test]
    fn test_install_queue_orders_dependencies_first() {
        let resolver = resolver(
            vec![],
            vec![
                PackageMetadata::new("app", "foo", "1.0").depends("app/bar"),
                PackageMetadata::new("app", "bar", "1.0").depends("app/baz"),
                PackageMetadata::new("app", "baz", "1.0"),
            ],
        );
        let queue = resolver
            .get_install_queue(&[main(1)], &InstallOptions::default())
            .unwrap();
        assert_eq!(queue.install, vec![main(3), main(2), main(1)]);
        assert!(queue.removal.is_empty());
    }

    #[test]
    fn test_install_queue_removes_conflicts() {
        let resolver = resolver(
            vec![
                PackageMetadata::new("app", "foo", "1.0").conflicts("!app/bar"),
                PackageMetadata::new("app", "bar", "1.0"),
            ],
            vec![PackageMetadata::new("app", "foo", "1.1").conflicts("!app/bar")],
        );
        let queue = resolver
            .get_install_queue(&[main(1)], &InstallOptions::default())
            .unwrap();
        assert_eq!(queue.install, vec![main(1)]);
        assert_eq!(queue.removal, vec![2]);
    }

    #[test]
    fn test_install_queue_keeps_replaced_conflicts_out_of_removal() {
        let resolver = resolver(
            vec![PackageMetadata::new("app", "bar", "1.0")],
            vec![
                PackageMetadata::new("app", "foo", "1.0").conflicts("app/bar"),
                PackageMetadata::new("app", "bar", "2.0"),
            ],
        );
        let queue = resolver
            .get_install_queue(&[main(1), main(2)], &InstallOptions::default())
            .unwrap();
        assert!(queue.install.contains(&main(2)));
        assert!(queue.removal.is_empty());
    }

    #[test]
    fn test_install_queue_reports_collisions() {
        let mut first = InMemoryRepository::new("first");
        first.add(PackageMetadata::new("app", "foo", "1.0").depends("=app/lib-1.0"));
        first.add(PackageMetadata::new("app", "lib", "1.0"));
        let mut second = InMemoryRepository::new("second");
        second.add(PackageMetadata::new("app", "bar", "1.0").depends("=app/lib-1.1"));
        second.add(PackageMetadata::new("app", "lib", "1.1"));
        let set = RepositorySet::new(InMemoryRepository::installed())
            .with_repository(first)
            .unwrap()
            .with_repository(second)
            .unwrap();
        let resolver = Resolver::new(set, ResolverConfig::default()).unwrap();

        let requested = [PackageMatch::new(1, "first"), PackageMatch::new(1, "second")];
        match resolver.get_install_queue(&requested, &InstallOptions::default()) {
            Err(Error::DependenciesCollision(collisions)) => {
                assert_eq!(collisions.len(), 1);
                assert_eq!(collisions[0].key, "app/lib");
                assert_eq!(collisions[0].matches.len(), 2);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_removal_queue() {
        let resolver = resolver(
            vec![
                PackageMetadata::new("dev-libs", "lib", "1.0"),
                PackageMetadata::new("app", "foo", "1.0").depends("dev-libs/lib"),
            ],
            vec![],
        );
        let queue = resolver
            .get_removal_queue(&[1], &RemovalOptions::default())
            .unwrap();
        assert_eq!(queue, vec![2, 1]);
    }

    #[test]
    fn test_system_mask_protects_last_installed_match() {
        let config = ResolverConfig {
            system_mask: vec!["sys-kernel/linux".to_string()],
            ..ResolverConfig::default()
        };
        let single = resolver_with(
            vec![PackageMetadata::new("sys-kernel", "linux", "6.1").slot("6.1")],
            vec![],
            config.clone(),
        );
        let mask = single.system_mask().unwrap();
        assert_eq!(mask.ids, BTreeSet::from([1]));
        assert!(!single.validate_package_removal(&PackageMatch::installed(1)).unwrap());

        let double = resolver_with(
            vec![
                PackageMetadata::new("sys-kernel", "linux", "6.1").slot("6.1"),
                PackageMetadata::new("sys-kernel", "linux", "6.6").slot("6.6"),
            ],
            vec![],
            config,
        );
        assert!(double.validate_package_removal(&PackageMatch::installed(1)).unwrap());
    }

    #[test]
    fn test_needed_by_system_package_is_protected() {
        let resolver = resolver(
            vec![
                PackageMetadata::new("virtual", "libc", "1"),
                PackageMetadata::new("sys-apps", "base", "1.0")
                    .system(true)
                    .depends("virtual/libc"),
            ],
            vec![],
        );
        assert!(!resolver.validate_package_removal(&PackageMatch::installed(1)).unwrap());
    }

    #[test]
    fn test_check_package_update() {
        let resolver = resolver(
            vec![PackageMetadata::new("app", "foo", "1.0").digest("aaa")],
            vec![PackageMetadata::new("app", "foo", "1.0").digest("bbb")],
        );

        let shallow = resolver.check_package_update("app/foo", false).unwrap();
        assert!(!shallow.available);
        assert_eq!(shallow.matched, Some(main(1)));

        let deep = resolver.check_package_update("app/foo", true).unwrap();
        assert!(deep.available);
        assert_eq!(deep.matched, Some(main(1)));

        let missing = resolver.check_package_update("app/bar", true).unwrap();
        assert!(!missing.available);
        assert_eq!(missing.matched, None);
    }

    #[test]
    fn test_shared_cache_is_reused() {
        let cache = Arc::new(MatchCache::new());
        let mut repo = InMemoryRepository::new("main");
        repo.add(PackageMetadata::new("app", "foo", "1.0"));
        let set = RepositorySet::new(InMemoryRepository::installed())
            .with_repository(repo)
            .unwrap();
        let resolver = Resolver::with_cache(set, ResolverConfig::default(), Arc::clone(&cache)).unwrap();

        assert!(cache.is_empty());
        let first = resolver.atom_match("app/foo", &MatchOptions::default()).unwrap();
        assert!(!cache.is_empty());
        let second = resolver.atom_match("app/foo", &MatchOptions::default()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, Some(main(1)));
    }
}
