// src/resolver/unsatisfied.rs

//! Filter dependencies already satisfied by the installed packages
//!
//! A dependency is unsatisfied when nothing installed matches it, or when
//! the repositories carry a build the installed one should be replaced
//! with. Conflict dependencies (`!atom`) are unsatisfied while the
//! conflicting package is installed.
//!
//! Surviving dependencies can come back rewritten: restricted to the
//! installed slot, or to the tag shared by installed and available
//! packages.

use super::Resolver;
use super::matcher::MatchOptions;
use crate::atom::Atom;
use crate::error::Result;
use crate::repository::{MatchFilter, PackageMatch};
use crate::version::{REVISION_ALWAYS_LATEST, SPM_REVISION, VersionKey};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Dependency filter for one resolution pass.
///
/// Results are memoized per dependency string; the memo is only valid for
/// the `deep`/`relaxed` flags the filter was created with.
pub struct UnsatisfiedFilter<'a> {
    resolver: &'a Resolver,
    deep: bool,
    relaxed: bool,
    cache: HashMap<String, Option<String>>,
}

impl<'a> UnsatisfiedFilter<'a> {
    pub fn new(resolver: &'a Resolver, deep: bool, relaxed: bool) -> Self {
        Self {
            resolver,
            deep,
            relaxed,
            cache: HashMap::new(),
        }
    }

    /// The unsatisfied subset of `dependencies`, possibly rewritten
    pub fn filter<I, S>(&mut self, dependencies: I) -> Result<BTreeSet<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut unsatisfied = BTreeSet::new();
        for dependency in dependencies {
            if let Some(rewritten) = self.check(dependency.as_ref())? {
                unsatisfied.insert(rewritten);
            }
        }
        Ok(unsatisfied)
    }

    pub fn is_unsatisfied(&mut self, dependency: &str) -> Result<bool> {
        Ok(self.check(dependency)?.is_some())
    }

    fn check(&mut self, dependency: &str) -> Result<Option<String>> {
        if let Some(cached) = self.cache.get(dependency) {
            return Ok(cached.clone());
        }
        let result = self.evaluate(dependency)?;
        debug!(
            "unsatisfied filter (deep: {}): {} => {}",
            self.deep,
            dependency,
            result.as_deref().unwrap_or("satisfied")
        );
        self.cache.insert(dependency.to_string(), result.clone());
        Ok(result)
    }

    fn evaluate(&self, dependency: &str) -> Result<Option<String>> {
        let installed = self.resolver.installed();
        let filter = MatchFilter::default();

        if let Some(conflict) = dependency.strip_prefix('!') {
            return Ok(installed
                .atom_match(conflict, &filter)?
                .map(|_| dependency.to_string()));
        }

        let installed_ids = installed.atom_match_multi(dependency, &filter)?;
        if installed_ids.is_empty() {
            return Ok(Some(self.scope_to_installed_tag(dependency)?));
        }

        let mut dependency = dependency.to_string();
        let parsed = Atom::parse(&dependency);

        // ~-1 asks for the latest revision
        let revision_deep =
            !self.deep && parsed.as_ref().and_then(|a| a.revision) == Some(REVISION_ALWAYS_LATEST);
        if !self.deep && !revision_deep && self.relaxed {
            return Ok(None);
        }

        let Some(mut repo_match) = self.resolver.atom_match(&dependency, &MatchOptions::default())? else {
            debug!("unsatisfied filter: {} not available in repositories", dependency);
            return Ok(None);
        };

        if self.resolver.config().slot_intersection {
            if let Some((rewritten, found)) = self.intersect_installed_slot(&dependency)? {
                dependency = rewritten;
                repo_match = found;
            }
        }

        let Some((mut repo_key, mut repo_digest)) = self.versioning(&repo_match)? else {
            debug!("unsatisfied filter: broken repository entry {}", repo_match);
            return Ok(Some(dependency));
        };

        let mut installed_data = Vec::with_capacity(installed_ids.len());
        for package_id in installed_ids {
            let key = installed
                .retrieve_version_key(package_id)?
                .unwrap_or_else(|| VersionKey::new("0", "", 0));
            installed_data.push((key, installed.retrieve_digest(package_id)?));
        }

        let has_tag = Atom::parse(&dependency).is_some_and(|a| a.tag.is_some());
        let installed_tags: BTreeSet<String> = installed_data
            .iter()
            .map(|(key, _)| key.tag.clone())
            .filter(|tag| !tag.is_empty())
            .collect();
        if !has_tag && !installed_tags.is_empty() {
            let available = self.available_tags(&dependency, Some(&installed_tags))?;
            if let (Some(best_tag), Some(atom)) = (available.last(), Atom::parse(&dependency)) {
                let tagged = atom.with_tag(best_tag).to_string();
                if let Some(found) = self.resolver.atom_match(&tagged, &MatchOptions::default())? {
                    if let Some((key, digest)) = self.versioning(&found)? {
                        dependency = tagged;
                        repo_key = key;
                        repo_digest = digest;
                    }
                }
            }
        }

        let spm_override = self.resolver.config().ignore_spm_downgrades;
        for (installed_key, installed_digest) in &installed_data {
            let satisfied = match repo_key.cmp(installed_key) {
                Ordering::Equal => {
                    // digest "0" marks locally generated metadata
                    let stale = installed_digest
                        .as_deref()
                        .is_some_and(|d| d != "0" && d != repo_digest);
                    !(self.deep && stale)
                }
                Ordering::Less => {
                    !(spm_override
                        && installed_key.revision == SPM_REVISION
                        && installed_key.revision != repo_key.revision)
                }
                Ordering::Greater => {
                    repo_key.cmp_version_tag(installed_key) == Ordering::Equal
                        && !self.deep
                        && !revision_deep
                }
            };
            if satisfied {
                return Ok(None);
            }
        }

        Ok(Some(dependency))
    }

    fn versioning(&self, found: &PackageMatch) -> Result<Option<(VersionKey, String)>> {
        let repo = self.resolver.open_repository(&found.repository)?;
        let Some(record) = repo.retrieve_record(found.package_id)? else {
            return Ok(None);
        };
        Ok(Some((record.version_key(), record.digest)))
    }

    /// Restrict a slot-less dependency available in several slots to the
    /// slot of its best installed match
    fn intersect_installed_slot(&self, dependency: &str) -> Result<Option<(String, PackageMatch)>> {
        let available = self
            .resolver
            .atom_match_multi(dependency, &MatchOptions::multi_repo())?;
        let mut slots = BTreeSet::new();
        for found in &available {
            if let Some((_, slot)) = self.resolver.key_slot(found)? {
                slots.insert(slot);
            }
        }
        if slots.len() < 2 {
            return Ok(None);
        }

        let installed = self.resolver.installed();
        let Some(best) = installed.atom_match(dependency, &MatchFilter::default())? else {
            return Ok(None);
        };
        let Some((_, installed_slot)) = installed.retrieve_key_slot(best)? else {
            return Ok(None);
        };
        if !slots.contains(&installed_slot) {
            return Ok(None);
        }

        let options = MatchOptions::with_slot(installed_slot.clone());
        let (Some(found), Some(atom)) = (
            self.resolver.atom_match(dependency, &options)?,
            Atom::parse(dependency),
        ) else {
            return Ok(None);
        };
        let rewritten = atom.with_slot(installed_slot).to_string();
        debug!("slot intersection: {} => {}", dependency, rewritten);
        Ok(Some((rewritten, found)))
    }

    /// Non-empty tags of the repository matches of `dependency`,
    /// optionally restricted to `installed_tags`
    fn available_tags(
        &self,
        dependency: &str,
        installed_tags: Option<&BTreeSet<String>>,
    ) -> Result<Vec<String>> {
        let mut tags = BTreeSet::new();
        for found in self
            .resolver
            .atom_match_multi(dependency, &MatchOptions::multi_repo())?
        {
            let repo = self.resolver.open_repository(&found.repository)?;
            let Some(key) = repo.retrieve_version_key(found.package_id)? else {
                continue;
            };
            if key.tag.is_empty() || installed_tags.is_some_and(|t| !t.contains(&key.tag)) {
                continue;
            }
            tags.insert(key.tag);
        }
        Ok(tags.into_iter().collect())
    }

    /// For a dependency nothing installed satisfies: if an installed
    /// package of the same key carries a tag the repositories also offer in
    /// its slot, scope the dependency to the highest such tag
    fn scope_to_installed_tag(&self, dependency: &str) -> Result<String> {
        let Some(atom) = Atom::parse(dependency) else {
            return Ok(dependency.to_string());
        };
        if atom.tag.is_some() {
            return Ok(dependency.to_string());
        }

        let installed = self.resolver.installed();
        let key = atom.key();
        let mut matching = BTreeSet::new();
        for tag in self.available_tags(dependency, None)? {
            let tagged_key = format!("{}#{}", key, tag);
            for package_id in installed.atom_match_multi(&tagged_key, &MatchFilter::default())? {
                let Some((_, slot)) = installed.retrieve_key_slot(package_id)? else {
                    continue;
                };
                if self
                    .resolver
                    .atom_match(&tagged_key, &MatchOptions::with_slot(slot))?
                    .is_some()
                {
                    matching.insert(tag.clone());
                    break;
                }
            }
        }

        Ok(match matching.last() {
            Some(best_tag) => atom.with_tag(best_tag.clone()).to_string(),
            None => dependency.to_string(),
        })
    }
}
