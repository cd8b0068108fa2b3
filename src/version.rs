// src/version.rs

//! Version ordering
//!
//! Package versions follow the Gentoo grammar
//! `N(.N)*[a-z](_(alpha|beta|pre|rc|p)N?)*(-rN)?` and are ordered by
//! [`portage_atom::Version`]. On top of the version string, every package carries a tag (a secondary
//! qualifier such as a kernel flavour) and an integer revision assigned by
//! the binary repository. [`VersionKey`] orders the whole triple.

use portage_atom::Version;
use std::cmp::Ordering;

/// Revision given to packages built outside the binary repositories
/// (merged from the source package manager). Always considered stale.
pub const SPM_REVISION: i64 = 9999;

/// Atom revision (`~-1`) meaning "always pull the latest revision".
pub const REVISION_ALWAYS_LATEST: i64 = -1;

/// Parse a version string.
///
/// A trailing `*` marks a prefix (glob) version, as written in
/// `=cat/pkg-1.2*` atoms.
pub fn parse_version(version: &str) -> Option<Version> {
    match version.strip_suffix('*') {
        Some(prefix) => {
            let mut parsed = Version::parse(prefix).ok()?;
            parsed.glob = true;
            Some(parsed)
        }
        None => Version::parse(version).ok(),
    }
}

/// Compare two version strings.
///
/// Invalid versions sort below every valid one; two invalid versions
/// compare as plain strings.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    match (parse_version(a), parse_version(b)) {
        (Some(va), Some(vb)) => va.cmp(&vb),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// The `(version, tag, revision)` triple identifying a package build.
///
/// Ordered by version, then by tag (plain string comparison, the empty tag
/// first), then by revision.
#[derive(Debug, Clone)]
pub struct VersionKey {
    pub version: String,
    pub tag: String,
    pub revision: i64,
}

impl VersionKey {
    pub fn new(version: impl Into<String>, tag: impl Into<String>, revision: i64) -> Self {
        Self {
            version: version.into(),
            tag: tag.into(),
            revision,
        }
    }

    /// Compare only the `(version, tag)` part.
    pub fn cmp_version_tag(&self, other: &Self) -> Ordering {
        compare_versions(&self.version, &other.version).then_with(|| self.tag.cmp(&other.tag))
    }
}

impl PartialEq for VersionKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for VersionKey {}

impl PartialOrd for VersionKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_version_tag(other)
            .then_with(|| self.revision.cmp(&other.revision))
    }
}

impl std::fmt::Display for VersionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.version)?;
        if !self.tag.is_empty() {
            write!(f, "#{}", self.tag)?;
        }
        write!(f, "~{}", self.revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn lt(a: &str, b: &str) {
        assert_eq!(compare_versions(a, b), Ordering::Less, "{} < {}", a, b);
        assert_eq!(compare_versions(b, a), Ordering::Greater, "{} > {}", b, a);
    }

    #[test]
    fn test_numeric_components() {
        lt("1.0", "1.1");
        lt("1.9", "1.10");
        lt("2", "10");
        lt("1.0", "1.0.0");
        lt("1", "1.0");
        assert_eq!(compare_versions("1.2.3", "1.2.3"), Ordering::Equal);
    }

    #[test]
    fn test_leading_zero_components_compare_as_fractions() {
        lt("1.02", "1.1");
        lt("1.01", "1.02");
        assert_eq!(compare_versions("1.0", "1.00"), Ordering::Equal);
    }

    #[test]
    fn test_letter_and_suffixes() {
        lt("1.0", "1.0a");
        lt("1.0a", "1.0b");
        lt("1.0_alpha", "1.0_beta");
        lt("1.0_beta2", "1.0_pre1");
        lt("1.0_pre1", "1.0_rc1");
        lt("1.0_rc1", "1.0");
        lt("1.0", "1.0_p1");
        lt("1.0_rc1", "1.0_rc2");
    }

    #[test]
    fn test_gentoo_revision() {
        lt("1.0", "1.0-r1");
        lt("1.0-r1", "1.0-r2");
        lt("1.0-r9", "1.0-r10");
        assert_eq!(compare_versions("1.0-r0", "1.0"), Ordering::Equal);
    }

    #[test]
    fn test_invalid_versions_sort_first() {
        assert!(parse_version("abc").is_none());
        assert!(parse_version("1.0-rc").is_none());
        lt("abc", "0.1");
        lt("abc", "abd");
    }

    #[test]
    fn test_glob_versions() {
        let glob = parse_version("1.2*").unwrap();
        assert!(glob.glob);
        assert_eq!(parse_version("1.2.5").unwrap().cmp(&glob), Ordering::Equal);
        assert_ne!(parse_version("1.3").unwrap().cmp(&glob), Ordering::Equal);
        assert!(!parse_version("1.2").unwrap().glob);
    }

    #[test]
    fn test_version_key_ordering() {
        let untagged = VersionKey::new("1.0", "", 0);
        let tagged = VersionKey::new("1.0", "2.6.32", 0);
        let newer_rev = VersionKey::new("1.0", "", 1);
        let newer = VersionKey::new("1.1", "", 0);

        assert!(untagged < tagged);
        assert!(untagged < newer_rev);
        assert!(tagged < newer);
        assert!(newer_rev < tagged);
        assert_eq!(VersionKey::new("1.0-r0", "", 2), VersionKey::new("1.0", "", 2));
    }

    #[test]
    fn test_tags_compare_as_plain_strings() {
        // "rc10" < "rc9" as strings; kept on purpose
        let rc9 = VersionKey::new("1.0", "rc9", 0);
        let rc10 = VersionKey::new("1.0", "rc10", 0);
        assert!(rc10 < rc9);
    }

    fn version_strategy() -> impl Strategy<Value = String> {
        "[0-9]{1,3}(\\.0?[0-9]{1,2}){0,3}[a-c]?(_(alpha|beta|pre|rc|p)[0-9]{0,2}){0,2}(-r[0-9]{1,2})?"
    }

    proptest! {
        #[test]
        fn prop_compare_is_reflexive(v in version_strategy()) {
            prop_assert!(parse_version(&v).is_some());
            prop_assert_eq!(compare_versions(&v, &v), Ordering::Equal);
        }

        #[test]
        fn prop_compare_is_antisymmetric(a in version_strategy(), b in version_strategy()) {
            prop_assert_eq!(compare_versions(&a, &b), compare_versions(&b, &a).reverse());
        }

        #[test]
        fn prop_compare_is_transitive(
            a in version_strategy(),
            b in version_strategy(),
            c in version_strategy(),
        ) {
            let mut sorted = vec![a, b, c];
            sorted.sort_by(|x, y| compare_versions(x, y));
            prop_assert_ne!(compare_versions(&sorted[0], &sorted[1]), Ordering::Greater);
            prop_assert_ne!(compare_versions(&sorted[1], &sorted[2]), Ordering::Greater);
            prop_assert_ne!(compare_versions(&sorted[0], &sorted[2]), Ordering::Greater);
        }
    }
}
