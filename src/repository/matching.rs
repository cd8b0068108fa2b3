// src/repository/matching.rs

//! Atom matching inside a single repository
//!
//! Resolves an atom against the packages of one [`PackageRepository`]:
//! name lookup (with category inference), slot and tag filtering, the
//! mask filter and version direction filtering. The multi-repository
//! cascade lives in the resolver.

use super::{PackageId, PackageRecord, PackageRepository};
use crate::atom::{Atom, Operator, split_or_dependency};
use crate::error::Result;
use crate::version::parse_version;
use portage_atom::Version;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::debug;

/// Extra constraints applied on top of the atom itself
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchFilter {
    /// Required slot, overridden by a `:slot` in the atom
    pub slot: Option<String>,
    /// Required tag, overridden by a `#tag` in the atom
    pub tag: Option<String>,
    /// Hide masked packages
    pub mask_filter: bool,
    pub case_sensitive: bool,
}

impl Default for MatchFilter {
    fn default() -> Self {
        Self {
            slot: None,
            tag: None,
            mask_filter: true,
            case_sensitive: true,
        }
    }
}

impl MatchFilter {
    pub fn with_slot(slot: impl Into<String>) -> Self {
        Self {
            slot: Some(slot.into()),
            ..Self::default()
        }
    }

    /// Filter that also returns masked packages
    pub fn unmasked() -> Self {
        Self {
            mask_filter: false,
            ..Self::default()
        }
    }
}

/// Every package of `repo` matching `atom`.
///
/// Malformed and ambiguous atoms match nothing.
pub fn atom_match_multi<R: PackageRepository + ?Sized>(
    repo: &R,
    atom: &str,
    filter: &MatchFilter,
) -> Result<BTreeSet<PackageId>> {
    if let Some(alternatives) = split_or_dependency(atom) {
        for alternative in alternatives {
            let found = atom_match_multi(repo, alternative, filter)?;
            if !found.is_empty() {
                return Ok(found);
            }
        }
        return Ok(BTreeSet::new());
    }

    let Some(parsed) = Atom::parse(atom) else {
        debug!("{}: malformed atom {}", repo.name(), atom);
        return Ok(BTreeSet::new());
    };

    let mut found = BTreeSet::new();
    for (package_id, record) in candidates(repo, &parsed, filter)? {
        if filter.mask_filter && repo.mask_filter(package_id)?.is_none() {
            continue;
        }
        if version_matches(&parsed, &record) {
            found.insert(package_id);
        }
    }
    Ok(found)
}

/// Best package of `repo` matching `atom`.
///
/// When no tag is requested, untagged packages win over tagged ones. The
/// highest `(version, tag, revision)` is picked, the lowest id on ties.
pub fn atom_match<R: PackageRepository + ?Sized>(
    repo: &R,
    atom: &str,
    filter: &MatchFilter,
) -> Result<Option<PackageId>> {
    let found = atom_match_multi(repo, atom, filter)?;
    if found.is_empty() {
        return Ok(None);
    }

    let mut records = Vec::with_capacity(found.len());
    for package_id in found {
        if let Some(record) = repo.retrieve_record(package_id)? {
            records.push((package_id, record));
        }
    }

    let tag_requested = filter.tag.is_some() || requested_tag(atom);
    if !tag_requested
        && records.iter().any(|(_, r)| r.tag.is_empty())
        && records.iter().any(|(_, r)| !r.tag.is_empty())
    {
        records.retain(|(_, r)| r.tag.is_empty());
    }

    let mut best: Option<(PackageId, PackageRecord)> = None;
    for (package_id, record) in records {
        let newer = match &best {
            Some((_, current)) => record.version_key() > current.version_key(),
            None => true,
        };
        if newer {
            best = Some((package_id, record));
        }
    }
    Ok(best.map(|(package_id, _)| package_id))
}

fn requested_tag(atom: &str) -> bool {
    match split_or_dependency(atom) {
        Some(alternatives) => alternatives.iter().any(|alt| requested_tag(alt)),
        None => Atom::parse(atom).is_some_and(|a| a.tag.is_some()),
    }
}

/// Packages with the atom's name (and category), passing slot and tag
fn candidates<R: PackageRepository + ?Sized>(
    repo: &R,
    atom: &Atom,
    filter: &MatchFilter,
) -> Result<Vec<(PackageId, PackageRecord)>> {
    let ids = match &atom.category {
        Some(category) if filter.case_sensitive => repo.search_name_category(&atom.name, category)?,
        _ => repo.search_name(&atom.name, filter.case_sensitive)?,
    };

    let mut records = Vec::with_capacity(ids.len());
    for package_id in ids {
        if let Some(record) = repo.retrieve_record(package_id)? {
            records.push((package_id, record));
        }
    }

    match &atom.category {
        Some(category) if !filter.case_sensitive => {
            records.retain(|(_, r)| r.category.eq_ignore_ascii_case(category));
        }
        Some(_) => {}
        None => {
            let categories: BTreeSet<&str> = records.iter().map(|(_, r)| r.category.as_str()).collect();
            if categories.len() > 1 {
                debug!(
                    "{}: {} is ambiguous between {:?}",
                    repo.name(),
                    atom.name,
                    categories
                );
                return Ok(Vec::new());
            }
        }
    }

    let slot = atom.slot.as_ref().or(filter.slot.as_ref());
    let tag = atom.tag.as_ref().or(filter.tag.as_ref());
    records.retain(|(_, r)| {
        slot.is_none_or(|s| &r.slot == s) && tag.is_none_or(|t| &r.tag == t)
    });

    Ok(records)
}

fn version_matches(atom: &Atom, record: &PackageRecord) -> bool {
    let Some(constraint) = atom.version_constraint() else {
        return true;
    };
    let Some(candidate) = parse_version(&record.version) else {
        return false;
    };
    // entropy revision, -1 asks for any
    let revision = atom.revision.filter(|r| *r >= 0);

    match atom.operator.unwrap_or(Operator::Equal) {
        Operator::Equal => {
            candidate.cmp(&constraint) == Ordering::Equal
                && revision.is_none_or(|r| record.revision == r)
        }
        Operator::Approximate => candidate.base() == constraint.base(),
        Operator::Greater => ordering(&candidate, &constraint, record, revision) == Ordering::Greater,
        Operator::GreaterOrEqual => ordering(&candidate, &constraint, record, revision) != Ordering::Less,
        Operator::Less => ordering(&candidate, &constraint, record, revision) == Ordering::Less,
        Operator::LessOrEqual => ordering(&candidate, &constraint, record, revision) != Ordering::Greater,
    }
}

/// Order of the package against the atom version, revision as tie-break
fn ordering(candidate: &Version, constraint: &Version, record: &PackageRecord, revision: Option<i64>) -> Ordering {
    let ord = candidate.cmp(constraint);
    match revision {
        Some(r) if ord == Ordering::Equal => record.revision.cmp(&r),
        _ => ord,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{InMemoryRepository, PackageMetadata};

    fn repo() -> InMemoryRepository {
        let mut repo = InMemoryRepository::new("main");
        repo.add(PackageMetadata::new("app", "foo", "1.0")); // 1
        repo.add(PackageMetadata::new("app", "foo", "1.2")); // 2
        repo.add(PackageMetadata::new("app", "foo", "2.0").slot("2")); // 3
        repo.add(PackageMetadata::new("app", "foo", "1.2").tag("kernel")); // 4
        repo.add(PackageMetadata::new("app", "foo", "1.2").revision(3)); // 5
        repo.add(PackageMetadata::new("dev", "bar", "1.0")); // 6
        repo.add(PackageMetadata::new("net", "bar", "1.0")); // 7
        repo.add(PackageMetadata::new("app", "hidden", "1.0").masked(true)); // 8
        repo
    }

    fn multi(repo: &InMemoryRepository, atom: &str) -> Vec<PackageId> {
        atom_match_multi(repo, atom, &MatchFilter::default())
            .unwrap()
            .into_iter()
            .collect()
    }

    #[test]
    fn test_best_match_prefers_untagged_and_newest() {
        let repo = repo();
        // 2.0 lives in slot 2 and is the newest overall
        assert_eq!(atom_match(&repo, "app/foo", &MatchFilter::default()).unwrap(), Some(3));
        assert_eq!(atom_match(&repo, "app/foo:0", &MatchFilter::default()).unwrap(), Some(5));
        assert_eq!(atom_match(&repo, "app/foo#kernel", &MatchFilter::default()).unwrap(), Some(4));
    }

    #[test]
    fn test_pipe_tag_matches_like_hash_tag() {
        let repo = repo();
        assert_eq!(atom_match(&repo, "app/foo|kernel", &MatchFilter::default()).unwrap(), Some(4));
        assert_eq!(multi(&repo, "=app/foo-1.2|kernel"), vec![4]);
        assert!(atom_match(&repo, "app/foo|missing", &MatchFilter::default()).unwrap().is_none());
    }

    #[test]
    fn test_slot_filter_and_override() {
        let repo = repo();
        let filter = MatchFilter::with_slot("2");
        assert_eq!(atom_match(&repo, "app/foo", &filter).unwrap(), Some(3));
        // slot in the atom wins over the filter
        assert_eq!(atom_match(&repo, "app/foo:0", &filter).unwrap(), Some(5));
    }

    #[test]
    fn test_version_directions() {
        let repo = repo();
        assert_eq!(multi(&repo, "=app/foo-1.2"), vec![2, 4, 5]);
        assert_eq!(multi(&repo, "=app/foo-1.2~3"), vec![5]);
        assert_eq!(multi(&repo, ">app/foo-1.2"), vec![3]);
        assert_eq!(multi(&repo, ">=app/foo-1.2"), vec![2, 3, 4, 5]);
        assert_eq!(multi(&repo, "<app/foo-1.2"), vec![1]);
        assert_eq!(multi(&repo, "<=app/foo-1.0"), vec![1]);
        assert_eq!(multi(&repo, "=app/foo-1*"), vec![1, 2, 4, 5]);
        assert_eq!(multi(&repo, "~app/foo-1.0-r2"), vec![1]);
        assert_eq!(multi(&repo, ">app/foo-1.2~0:0"), vec![5]);
    }

    #[test]
    fn test_missing_category_must_be_unambiguous() {
        let repo = repo();
        assert!(multi(&repo, "bar").is_empty());
        assert_eq!(multi(&repo, "foo").len(), 5);
        assert_eq!(multi(&repo, "dev/bar"), vec![6]);
    }

    #[test]
    fn test_mask_filter() {
        let repo = repo();
        assert!(atom_match(&repo, "app/hidden", &MatchFilter::default()).unwrap().is_none());
        assert_eq!(atom_match(&repo, "app/hidden", &MatchFilter::unmasked()).unwrap(), Some(8));
    }

    #[test]
    fn test_or_dependency_takes_first_available() {
        let repo = repo();
        assert_eq!(
            atom_match(&repo, "app/missing;dev/bar;net/bar?", &MatchFilter::default()).unwrap(),
            Some(6)
        );
        assert!(atom_match(&repo, "app/x;app/y?", &MatchFilter::default()).unwrap().is_none());
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let repo = repo();
        let filter = MatchFilter {
            case_sensitive: false,
            ..MatchFilter::default()
        };
        assert_eq!(atom_match(&repo, "APP/Hidden", &MatchFilter { mask_filter: false, ..filter }).unwrap(), Some(8));
        assert!(atom_match(&repo, "APP/Hidden", &MatchFilter::unmasked()).unwrap().is_none());
    }

    #[test]
    fn test_malformed_atom_matches_nothing() {
        let repo = repo();
        assert!(atom_match(&repo, ">=app/foo", &MatchFilter::default()).unwrap().is_none());
        assert!(atom_match(&repo, "", &MatchFilter::default()).unwrap().is_none());
    }
}
