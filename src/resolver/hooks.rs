// src/resolver/hooks.rs

//! Extra packages pulled in when an installed package gets replaced
//!
//! Replacing an installed package can break the packages linking against
//! the libraries it drops, or depending on its exact version. These
//! lookups find the repository updates of such packages so the graph
//! builder can schedule them together with the replacement.

use super::matcher::MatchOptions;
use super::{PackageAction, Resolver};
use crate::error::Result;
use crate::repository::{
    DependencyType, MatchFilter, NeededLibrary, PackageId, PackageMatch, PackageRepository,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use tracing::{debug, warn};

/// Category of meta packages standing in for a real provider
pub const VIRTUAL_CATEGORY: &str = "virtual";

/// `libfoo` for `libfoo.so.1`
fn library_name(soname: &str) -> &str {
    soname.split(".so").next().unwrap_or(soname)
}

fn directory_of(path: &str) -> String {
    Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub struct InstallHooks<'a> {
    resolver: &'a Resolver,
}

impl<'a> InstallHooks<'a> {
    pub fn new(resolver: &'a Resolver) -> Self {
        Self { resolver }
    }

    fn installed(&self) -> &'a dyn PackageRepository {
        self.resolver.installed()
    }

    /// Updates of the installed packages linking against libraries the
    /// installed package provides and `pkg` no longer does
    pub fn library_drops(&self, pkg: &PackageMatch, installed_id: PackageId) -> Result<BTreeSet<PackageMatch>> {
        if !self.resolver.config().elf_needed_scanning {
            return Ok(BTreeSet::new());
        }
        let repo = self.resolver.open_repository(&pkg.repository)?;
        let repo_libs = repo.retrieve_provided_libraries(pkg.package_id)?;
        let installed_libs = self.installed().retrieve_provided_libraries(installed_id)?;

        let mut needing = BTreeSet::new();
        for lib in installed_libs.difference(&repo_libs) {
            needing.extend(self.installed().search_needed(&lib.soname, lib.elf_class)?);
        }
        if needing.is_empty() {
            return Ok(BTreeSet::new());
        }

        let pkg_key_slot = self.resolver.key_slot_atom(pkg)?;
        let mut broken = BTreeSet::new();
        for inst_id in needing {
            let Some(key_slot) = self.resolver.key_slot_atom(&PackageMatch::installed(inst_id))? else {
                continue;
            };
            let Some(update) = self.resolver.atom_match(&key_slot, &MatchOptions::default())? else {
                continue;
            };
            if self.resolver.package_action_against(&update, inst_id)? == PackageAction::Reinstall {
                debug!("library drop breaks {} but no update is available", key_slot);
                continue;
            }
            if &update == pkg || pkg_key_slot.as_deref() == Some(key_slot.as_str()) {
                continue;
            }
            debug!("library drop pulls in {} ({})", key_slot, update);
            broken.insert(update);
        }
        Ok(broken)
    }

    /// Packages to schedule around a soname bump between the installed
    /// package and `pkg`: `(after, before)`, where `before` provide the
    /// new libraries and `after` link against the old ones
    pub fn library_breakages(
        &self,
        pkg: &PackageMatch,
        installed_id: PackageId,
    ) -> Result<(BTreeSet<PackageMatch>, BTreeSet<PackageMatch>)> {
        if !self.resolver.config().elf_needed_scanning {
            return Ok((BTreeSet::new(), BTreeSet::new()));
        }
        let repo = self.resolver.open_repository(&pkg.repository)?;
        let mut repo_needed = repo.retrieve_needed_libraries(pkg.package_id)?;
        let mut installed_needed = self.installed().retrieve_needed_libraries(installed_id)?;

        let common: Vec<NeededLibrary> = repo_needed.intersection(&installed_needed).cloned().collect();
        for lib in &common {
            repo_needed.remove(lib);
            installed_needed.remove(lib);
        }

        let repo_names: BTreeSet<&str> = repo_needed.iter().map(|l| library_name(&l.soname)).collect();
        let installed_side: BTreeSet<NeededLibrary> = installed_needed
            .iter()
            .filter(|l| repo_names.contains(library_name(&l.soname)))
            .cloned()
            .collect();

        let before = self.breakages_available(pkg, &repo_needed)?;
        let mut after = self.breakages_installed(installed_id, &installed_side)?;
        after.remove(pkg);
        after.retain(|m| !before.contains(m));
        Ok((after, before))
    }

    /// Dependencies of `pkg` providing its newly needed libraries
    fn breakages_available(
        &self,
        pkg: &PackageMatch,
        needed: &BTreeSet<NeededLibrary>,
    ) -> Result<BTreeSet<PackageMatch>> {
        if needed.is_empty() {
            return Ok(BTreeSet::new());
        }
        let repo = self.resolver.open_repository(&pkg.repository)?;
        let exclude = [DependencyType::Build];

        let mut matched_deps = BTreeSet::new();
        for dependency in repo.retrieve_dependencies(pkg.package_id, &exclude)? {
            let Some(dep_match) = self.resolver.atom_match(&dependency, &MatchOptions::default())? else {
                continue;
            };
            let dep_repo = self.resolver.open_repository(&dep_match.repository)?;
            let is_virtual = dep_repo
                .retrieve_record(dep_match.package_id)?
                .is_some_and(|r| r.category == VIRTUAL_CATEGORY);
            if is_virtual {
                for inner in dep_repo.retrieve_dependencies(dep_match.package_id, &exclude)? {
                    if let Some(found) = self.resolver.atom_match(&inner, &MatchOptions::default())? {
                        matched_deps.insert(found);
                    }
                }
            }
            matched_deps.insert(dep_match);
        }

        let pkg_key_slot = self.resolver.key_slot_atom(pkg)?;
        let mut providers = BTreeSet::new();
        for lib in needed {
            let mut ldpaths = self.resolver.config().ldpaths.clone();
            ldpaths.extend(lib.rpath.split(':').filter(|p| !p.is_empty()).map(str::to_string));

            let mut found = None;
            'repositories: for candidate_repo in self.resolver.repositories().repositories() {
                for (package_id, path) in candidate_repo.resolve_needed(&lib.soname, lib.elf_class)? {
                    if !ldpaths.contains(&directory_of(&path)) {
                        continue;
                    }
                    let candidate = PackageMatch::new(package_id, candidate_repo.name());
                    if &candidate == pkg || !matched_deps.contains(&candidate) {
                        continue;
                    }
                    if self.resolver.key_slot_atom(&candidate)? == pkg_key_slot {
                        continue;
                    }
                    found = Some(candidate);
                    break 'repositories;
                }
            }

            match found {
                Some(provider) => {
                    providers.insert(provider);
                }
                None => warn!(
                    "No provider of {} (elf class {}) among the dependencies of {}",
                    lib.soname, lib.elf_class, pkg
                ),
            }
        }

        let mut matches = BTreeSet::new();
        for provider in providers {
            if self.resolver.package_action(&provider)? != PackageAction::Reinstall {
                debug!("soname bump pulls in provider {}", provider);
                matches.insert(provider);
            }
        }
        Ok(matches)
    }

    /// Updates of installed packages linking against the libraries being
    /// replaced
    fn breakages_installed(
        &self,
        installed_id: PackageId,
        needed: &BTreeSet<NeededLibrary>,
    ) -> Result<BTreeSet<PackageMatch>> {
        let mut ids = BTreeSet::new();
        for lib in needed {
            ids.extend(self.installed().search_needed(&lib.soname, lib.elf_class)?);
        }
        ids.remove(&installed_id);

        let mut by_key_slot = BTreeMap::new();
        for inst_id in ids {
            if let Some(key_slot) = self.resolver.key_slot_atom(&PackageMatch::installed(inst_id))? {
                by_key_slot.insert(key_slot, inst_id);
            }
        }

        let mut matches = BTreeSet::new();
        for (key_slot, inst_id) in by_key_slot {
            let Some(update) = self.resolver.atom_match(&key_slot, &MatchOptions::default())? else {
                continue;
            };
            if self.resolver.package_action_against(&update, inst_id)? != PackageAction::Reinstall {
                debug!("soname bump pulls in {} ({})", key_slot, update);
                matches.insert(update);
            }
        }
        Ok(matches)
    }

    /// Updates of installed packages depending on the installed package
    /// whose dependencies would no longer match `pkg`
    pub fn inverse_dependencies(
        &self,
        pkg: &PackageMatch,
        installed_id: PackageId,
        build_deps: bool,
        elements: &BTreeSet<PackageMatch>,
    ) -> Result<BTreeSet<PackageMatch>> {
        if self.resolver.package_action_against(pkg, installed_id)? == PackageAction::Reinstall {
            return Ok(BTreeSet::new());
        }
        let exclude: &[DependencyType] = if build_deps { &[] } else { &[DependencyType::Build] };

        let reverse: BTreeSet<PackageId> = self
            .installed()
            .retrieve_reverse_dependencies(installed_id, exclude)?
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        let mut seen = BTreeSet::new();
        let mut match_cache: HashMap<String, Option<PackageMatch>> = HashMap::new();
        let mut results = BTreeSet::new();
        for inst_id in reverse {
            let Some(key_slot) = self.resolver.key_slot_atom(&PackageMatch::installed(inst_id))? else {
                continue;
            };
            if !seen.insert(key_slot.clone()) {
                continue;
            }

            let mut still_matching = false;
            for dependency in self.installed().retrieve_dependencies(inst_id, exclude)? {
                let found = match match_cache.get(&dependency) {
                    Some(found) => found.clone(),
                    None => {
                        let found = self.resolver.atom_match(&dependency, &MatchOptions::default())?;
                        match_cache.insert(dependency, found.clone());
                        found
                    }
                };
                if found.as_ref() == Some(pkg) {
                    still_matching = true;
                    break;
                }
            }
            if still_matching {
                continue;
            }

            let Some(update) = self.resolver.atom_match(&key_slot, &MatchOptions::default())? else {
                continue;
            };
            if self.resolver.package_action_against(&update, inst_id)? == PackageAction::Reinstall {
                continue;
            }
            let pulled = self
                .resolver
                .atom_match_multi(&key_slot, &MatchOptions::multi_repo())?;
            if pulled.iter().any(|m| elements.contains(m)) {
                continue;
            }
            debug!("inverse dependency {} ({})", key_slot, update);
            results.insert(update);
        }
        Ok(results)
    }

    /// `!key:slot` conflicts for installed packages declaring a conflict
    /// that `pkg` matches
    pub fn inverse_conflicts(&self, pkg: &PackageMatch) -> Result<BTreeSet<String>> {
        let mut conflicts = BTreeSet::new();
        if !self.resolver.config().auto_conflicts {
            return Ok(conflicts);
        }
        let repo = self.resolver.open_repository(&pkg.repository)?;
        let Some(record) = repo.retrieve_record(pkg.package_id)? else {
            return Ok(conflicts);
        };

        for (inst_id, conflict) in self.installed().search_conflict(&record.key())? {
            if !repo
                .atom_match_multi(&conflict, &MatchFilter::default())?
                .contains(&pkg.package_id)
            {
                continue;
            }
            if let Some(key_slot) = self.resolver.key_slot_atom(&PackageMatch::installed(inst_id))? {
                debug!("auto-conflict !{} from {}", key_slot, conflict);
                conflicts.insert(format!("!{}", key_slot));
                break;
            }
        }
        Ok(conflicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_name() {
        assert_eq!(library_name("libfoo.so.1"), "libfoo");
        assert_eq!(library_name("libfoo-2.0.so"), "libfoo-2.0");
        assert_eq!(library_name("ld-linux"), "ld-linux");
    }

    #[test]
    fn test_directory_of() {
        assert_eq!(directory_of("/usr/lib64/libfoo.so.1"), "/usr/lib64");
        assert_eq!(directory_of("libfoo.so.1"), "");
    }
}
