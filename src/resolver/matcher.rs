// src/resolver/matcher.rs

//! Atom matching across repositories
//!
//! Every repository of the set is asked for its best match; when more than
//! one answers, the candidates go through a short-circuiting cascade of
//! comparators (version, then tag, then revision) and a remaining tie is
//! won by the repository with the highest priority.
//!
//! Results are memoized in a [`MatchCache`] whose keys embed a fingerprint
//! of the repository set, so entries computed against older repository
//! content are simply never looked up again.

use super::repositories::RepositorySet;
use crate::atom::{Atom, split_or_dependency};
use crate::error::Result;
use crate::repository::{MatchFilter, PackageMatch, PackageRepository};
use crate::version::{VersionKey, compare_versions};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use tracing::debug;

/// Options of a multi-repository match
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchOptions {
    /// Required slot, unless the atom carries one
    pub slot: Option<String>,
    /// Required tag, unless the atom carries one
    pub tag: Option<String>,
    /// Only look into these repositories (atom `@repo` restrictions win)
    pub repositories: Option<Vec<String>>,
    /// For multi matches: collect from every repository instead of the
    /// winning one only
    pub multi_repo: bool,
    pub mask_filter: bool,
    pub case_sensitive: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            slot: None,
            tag: None,
            repositories: None,
            multi_repo: false,
            mask_filter: true,
            case_sensitive: true,
        }
    }
}

impl MatchOptions {
    pub fn with_slot(slot: impl Into<String>) -> Self {
        Self {
            slot: Some(slot.into()),
            ..Self::default()
        }
    }

    /// Multi matches over every repository
    pub fn multi_repo() -> Self {
        Self {
            multi_repo: true,
            ..Self::default()
        }
    }

    fn filter(&self) -> MatchFilter {
        MatchFilter {
            slot: self.slot.clone(),
            tag: self.tag.clone(),
            mask_filter: self.mask_filter,
            case_sensitive: self.case_sensitive,
        }
    }
}

#[derive(Debug, Clone)]
enum CachedMatch {
    Single(Option<PackageMatch>),
    Multi(BTreeSet<PackageMatch>),
}

/// Memoized match results, safe to share between resolvers
#[derive(Debug, Default)]
pub struct MatchCache {
    entries: RwLock<HashMap<String, CachedMatch>>,
}

impl MatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    fn get(&self, key: &str) -> Option<CachedMatch> {
        self.entries.read().ok()?.get(key).cloned()
    }

    fn insert(&self, key: String, value: CachedMatch) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key, value);
        }
    }
}

type Tiebreak = fn(&VersionKey, &VersionKey) -> Ordering;

fn by_version(a: &VersionKey, b: &VersionKey) -> Ordering {
    compare_versions(&a.version, &b.version)
}

fn by_tag(a: &VersionKey, b: &VersionKey) -> Ordering {
    a.tag.cmp(&b.tag)
}

fn by_revision(a: &VersionKey, b: &VersionKey) -> Ordering {
    a.revision.cmp(&b.revision)
}

/// Applied in order over the surviving candidates until one is left
const CASCADE: &[(&str, Tiebreak)] = &[
    ("version", by_version),
    ("tag", by_tag),
    ("revision", by_revision),
];

/// Matches atoms against a [`RepositorySet`]
pub struct AtomMatcher<'a> {
    repositories: &'a RepositorySet,
    cache: Option<&'a MatchCache>,
    fingerprint: &'a str,
}

impl<'a> AtomMatcher<'a> {
    /// Matcher without memoization
    pub fn new(repositories: &'a RepositorySet) -> Self {
        Self {
            repositories,
            cache: None,
            fingerprint: "",
        }
    }

    /// Matcher memoizing into `cache`; `fingerprint` must identify the
    /// current content of `repositories`
    pub fn with_cache(repositories: &'a RepositorySet, cache: &'a MatchCache, fingerprint: &'a str) -> Self {
        Self {
            repositories,
            cache: Some(cache),
            fingerprint,
        }
    }

    /// Best match for `atom`, `None` when nothing matches
    pub fn atom_match(&self, atom: &str, options: &MatchOptions) -> Result<Option<PackageMatch>> {
        let key = self.cache_key("single", atom, options);
        if let Some(CachedMatch::Single(found)) = self.cache.and_then(|c| c.get(&key)) {
            return Ok(found);
        }

        let found = self.match_single(atom, options)?;
        if let Some(cache) = self.cache {
            cache.insert(key, CachedMatch::Single(found.clone()));
        }
        Ok(found)
    }

    /// Every match for `atom`: inside the winning repository, or across
    /// all repositories with [`MatchOptions::multi_repo`]
    pub fn atom_match_multi(&self, atom: &str, options: &MatchOptions) -> Result<BTreeSet<PackageMatch>> {
        let key = self.cache_key("multi", atom, options);
        if let Some(CachedMatch::Multi(found)) = self.cache.and_then(|c| c.get(&key)) {
            return Ok(found);
        }

        let found = self.match_multi(atom, options)?;
        if let Some(cache) = self.cache {
            cache.insert(key, CachedMatch::Multi(found.clone()));
        }
        Ok(found)
    }

    fn cache_key(&self, kind: &str, atom: &str, options: &MatchOptions) -> String {
        let mut hasher = Sha256::new();
        hasher.update(
            format!(
                "{}|{}|{:?}|{:?}|{:?}|{}|{}|{}|{}",
                kind,
                atom,
                options.slot,
                options.tag,
                options.repositories,
                options.multi_repo,
                options.mask_filter,
                options.case_sensitive,
                self.fingerprint
            )
            .as_bytes(),
        );
        format!("{:x}", hasher.finalize())
    }

    /// Atom without its repository restriction, and the repositories to
    /// search, in priority order
    fn scope(&self, atom: &str, options: &MatchOptions) -> Option<(String, Vec<&'a dyn PackageRepository>)> {
        let parsed = Atom::parse(atom)?;
        let restriction = parsed.repositories.clone().or_else(|| options.repositories.clone());
        let atom = match parsed.repositories {
            Some(_) => parsed.without_repositories().to_string(),
            None => atom.to_string(),
        };

        let repos: Vec<&'a dyn PackageRepository> = match restriction {
            Some(names) => self
                .repositories
                .repositories()
                .filter(|r| names.iter().any(|n| n == r.name()))
                .collect(),
            None => self.repositories.repositories().collect(),
        };
        Some((atom, repos))
    }

    fn match_single(&self, atom: &str, options: &MatchOptions) -> Result<Option<PackageMatch>> {
        if let Some(alternatives) = split_or_dependency(atom) {
            for alternative in alternatives {
                if let Some(found) = self.match_single(alternative, options)? {
                    return Ok(Some(found));
                }
            }
            return Ok(None);
        }

        let Some((atom, repos)) = self.scope(atom, options) else {
            debug!("atom_match: malformed atom {}", atom);
            return Ok(None);
        };
        let filter = options.filter();

        // (priority, match, version key)
        let mut candidates = Vec::new();
        for (priority, repo) in repos.into_iter().enumerate() {
            if let Some(package_id) = repo.atom_match(&atom, &filter)? {
                if let Some(version_key) = repo.retrieve_version_key(package_id)? {
                    candidates.push((priority, PackageMatch::new(package_id, repo.name()), version_key));
                }
            }
        }

        if candidates.len() > 1 {
            debug!("atom_match: {} found in {} repositories", atom, candidates.len());
        }
        Ok(pick_best(candidates))
    }

    fn match_multi(&self, atom: &str, options: &MatchOptions) -> Result<BTreeSet<PackageMatch>> {
        if let Some(alternatives) = split_or_dependency(atom) {
            for alternative in alternatives {
                let found = self.match_multi(alternative, options)?;
                if !found.is_empty() {
                    return Ok(found);
                }
            }
            return Ok(BTreeSet::new());
        }

        let Some((stripped, repos)) = self.scope(atom, options) else {
            return Ok(BTreeSet::new());
        };
        let filter = options.filter();

        let mut found = BTreeSet::new();
        if options.multi_repo {
            for repo in repos {
                for package_id in repo.atom_match_multi(&stripped, &filter)? {
                    found.insert(PackageMatch::new(package_id, repo.name()));
                }
            }
        } else if let Some(best) = self.match_single(atom, options)? {
            let repo = self.repositories.open_repository(&best.repository)?;
            for package_id in repo.atom_match_multi(&stripped, &filter)? {
                found.insert(PackageMatch::new(package_id, repo.name()));
            }
        }
        Ok(found)
    }
}

/// Run the comparator cascade; what survives it is ordered by priority
fn pick_best(mut candidates: Vec<(usize, PackageMatch, VersionKey)>) -> Option<PackageMatch> {
    for (_, compare) in CASCADE {
        if candidates.len() <= 1 {
            break;
        }
        let Some(best) = candidates
            .iter()
            .map(|(_, _, key)| key)
            .max_by(|a, b| compare(a, b))
            .cloned()
        else {
            break;
        };
        candidates.retain(|(_, _, key)| compare(key, &best) == Ordering::Equal);
    }
    candidates
        .into_iter()
        .min_by_key(|(priority, _, _)| *priority)
        .map(|(_, found, _)| found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{InMemoryRepository, PackageMetadata};

    fn set(repos: Vec<InMemoryRepository>) -> RepositorySet {
        let mut set = RepositorySet::new(InMemoryRepository::installed());
        for repo in repos {
            set.add_repository(repo).unwrap();
        }
        set
    }

    fn repo(name: &str, packages: Vec<PackageMetadata>) -> InMemoryRepository {
        let mut repo = InMemoryRepository::new(name);
        for package in packages {
            repo.add(package);
        }
        repo
    }

    #[test]
    fn test_newest_version_wins_across_repositories() {
        let set = set(vec![
            repo("r1", vec![PackageMetadata::new("app", "foo", "1.0")]),
            repo("r2", vec![PackageMetadata::new("app", "foo", "1.1")]),
        ]);
        let matcher = AtomMatcher::new(&set);
        assert_eq!(
            matcher.atom_match("app/foo", &MatchOptions::default()).unwrap(),
            Some(PackageMatch::new(1, "r2"))
        );
    }

    #[test]
    fn test_tag_then_revision_break_version_ties() {
        let set = set(vec![
            repo("r1", vec![PackageMetadata::new("app", "foo", "1.0").tag("a").revision(5)]),
            repo("r2", vec![PackageMetadata::new("app", "foo", "1.0").tag("b").revision(1)]),
            repo("r3", vec![PackageMetadata::new("app", "foo", "1.0").tag("b").revision(2)]),
        ]);
        let matcher = AtomMatcher::new(&set);
        assert_eq!(
            matcher.atom_match("app/foo", &MatchOptions::default()).unwrap(),
            Some(PackageMatch::new(1, "r3"))
        );
    }

    #[test]
    fn test_full_tie_goes_to_first_repository() {
        let pkg = PackageMetadata::new("app", "foo", "2.0-r0");
        let set = set(vec![
            repo("r1", vec![pkg.clone()]),
            repo("r2", vec![pkg.clone()]),
            repo("r3", vec![pkg]),
        ]);
        let matcher = AtomMatcher::new(&set);
        for _ in 0..3 {
            assert_eq!(
                matcher.atom_match("app/foo", &MatchOptions::default()).unwrap(),
                Some(PackageMatch::new(1, "r1"))
            );
        }
    }

    #[test]
    fn test_repository_restriction() {
        let pkg = PackageMetadata::new("app", "foo", "1.0");
        let set = set(vec![repo("r1", vec![pkg.clone()]), repo("r2", vec![pkg])]);
        let matcher = AtomMatcher::new(&set);

        assert_eq!(
            matcher.atom_match("app/foo@r2", &MatchOptions::default()).unwrap(),
            Some(PackageMatch::new(1, "r2"))
        );
        assert_eq!(
            matcher.atom_match("app/foo::r2", &MatchOptions::default()).unwrap(),
            Some(PackageMatch::new(1, "r2"))
        );
        let options = MatchOptions {
            repositories: Some(vec!["r2".to_string()]),
            ..MatchOptions::default()
        };
        assert_eq!(
            matcher.atom_match("app/foo", &options).unwrap(),
            Some(PackageMatch::new(1, "r2"))
        );
        assert!(matcher.atom_match("app/foo@nope", &MatchOptions::default()).unwrap().is_none());
    }

    #[test]
    fn test_not_found_and_malformed_are_none() {
        let set = set(vec![repo("r1", vec![PackageMetadata::new("app", "foo", "1.0")])]);
        let matcher = AtomMatcher::new(&set);
        assert!(matcher.atom_match("app/bar", &MatchOptions::default()).unwrap().is_none());
        assert!(matcher.atom_match(">=app/foo", &MatchOptions::default()).unwrap().is_none());
        assert!(matcher.atom_match_multi("app/bar", &MatchOptions::multi_repo()).unwrap().is_empty());
    }

    #[test]
    fn test_multi_match_scopes() {
        let set = set(vec![
            repo(
                "r1",
                vec![
                    PackageMetadata::new("app", "foo", "1.0"),
                    PackageMetadata::new("app", "foo", "1.1").slot("1"),
                ],
            ),
            repo("r2", vec![PackageMetadata::new("app", "foo", "2.0")]),
        ]);
        let matcher = AtomMatcher::new(&set);

        let winner_only = matcher.atom_match_multi("app/foo", &MatchOptions::default()).unwrap();
        assert_eq!(winner_only, BTreeSet::from([PackageMatch::new(1, "r2")]));

        let everywhere = matcher.atom_match_multi("app/foo", &MatchOptions::multi_repo()).unwrap();
        assert_eq!(everywhere.len(), 3);
    }

    #[test]
    fn test_or_dependency_across_repositories() {
        let set = set(vec![
            repo("r1", vec![PackageMetadata::new("app", "b", "1.0")]),
            repo("r2", vec![PackageMetadata::new("app", "a", "1.0")]),
        ]);
        let matcher = AtomMatcher::new(&set);
        assert_eq!(
            matcher.atom_match("app/a;app/b?", &MatchOptions::default()).unwrap(),
            Some(PackageMatch::new(1, "r2"))
        );
    }

    #[test]
    fn test_cache_is_keyed_by_fingerprint() {
        let set = set(vec![repo("r1", vec![PackageMetadata::new("app", "foo", "1.0")])]);
        let cache = MatchCache::new();

        let first = AtomMatcher::with_cache(&set, &cache, "one");
        let found = first.atom_match("app/foo", &MatchOptions::default()).unwrap();
        assert_eq!(found, first.atom_match("app/foo", &MatchOptions::default()).unwrap());
        assert_eq!(cache.len(), 1);

        let second = AtomMatcher::with_cache(&set, &cache, "two");
        second.atom_match("app/foo", &MatchOptions::default()).unwrap();
        assert_eq!(cache.len(), 2);

        cache.clear();
        assert!(cache.is_empty());
    }
}
