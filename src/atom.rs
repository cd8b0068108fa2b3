// src/atom.rs

//! Dependency atoms
//!
//! An atom names a package and optionally constrains it:
//!
//! ```text
//! [!][op]category/name[-version[*]][:slot][#tag][~revision][@repo1,repo2]
//! ```
//!
//! The Portage part (operator, key, version, slot and USE dependencies) is
//! parsed by [`portage_atom::Dep`]. On top of it the binary repositories
//! add a tag (`#tag`, or `|tag`), a repository revision (`~N`, `~-1` for
//! the latest one) and a repository restriction (`@r1,r2` or `::repo`).
//! Atoms without an operator but with a version match that exact version,
//! and the category may be left out.
//!
//! Or-dependencies are written `a;b;c?` and handled by
//! [`split_or_dependency`].

use portage_atom::{Dep, SlotDep, Version};
use std::fmt;
use std::str::FromStr;

pub use portage_atom::Operator;

/// Separator between or-dependency alternatives
pub const OR_DEP_SEPARATOR: char = ';';
/// Trailing marker of an or-dependency
pub const OR_DEP_MARKER: char = '?';
/// Category assumed when an atom has none
pub const NULL_CATEGORY: &str = "null";

const OPERATORS: [&str; 6] = [">=", "<=", "=", ">", "<", "~"];
const MARKERS: [char; 4] = [':', '#', '|', '~'];

/// A parsed dependency atom
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Atom {
    /// Leading `!`: the package must not be installed
    pub conflict: bool,
    pub operator: Option<Operator>,
    pub category: Option<String>,
    pub name: String,
    pub version: Option<String>,
    /// Trailing `*` on the version
    pub wildcard: bool,
    pub slot: Option<String>,
    pub tag: Option<String>,
    /// Binary repository revision (`~N`)
    pub revision: Option<i64>,
    /// Repository restriction (`@r1,r2` or `::r1`)
    pub repositories: Option<Vec<String>>,
}

fn split_operator(s: &str) -> (&str, &str) {
    for op in OPERATORS {
        if let Some(rest) = s.strip_prefix(op) {
            return (op, rest);
        }
    }
    ("", s)
}

/// Parse the Portage part of an atom.
///
/// Without an operator, `cat/pkg-1.0` is read as `=cat/pkg-1.0` when that
/// parses, and as a plain key otherwise.
fn parse_dep(op: &str, cpv: &str, suffix: &str) -> Option<Dep> {
    if !op.is_empty() {
        let dep = Dep::parse(&format!("{}{}{}", op, cpv, suffix)).ok()?;
        return dep.version.is_some().then_some(dep);
    }
    match Dep::parse(&format!("={}{}", cpv, suffix)) {
        Ok(dep) if dep.version.is_some() => Some(dep),
        _ => Dep::parse(&format!("{}{}", cpv, suffix)).ok(),
    }
}

fn dep_slot(dep: &Dep) -> Option<String> {
    match &dep.slot_dep {
        Some(SlotDep::Slot { slot: Some(s), .. }) => Some(match &s.subslot {
            Some(subslot) => format!("{}/{}", s.slot, subslot),
            None => s.slot.clone(),
        }),
        _ => None,
    }
}

impl Atom {
    /// Parse an atom string, returning `None` when it is malformed.
    pub fn parse(atom: &str) -> Option<Self> {
        let atom = atom.trim();
        if atom.is_empty() || atom.contains(['(', ')']) {
            return None;
        }

        let (conflict, rest) = match atom.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, atom),
        };

        let (rest, repositories) = if let Some(pos) = rest.rfind('@') {
            let repos: Vec<String> = rest[pos + 1..]
                .split(',')
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
            (&rest[..pos], if repos.is_empty() { None } else { Some(repos) })
        } else if let Some(pos) = rest.find("::") {
            (&rest[..pos], Some(vec![rest[pos + 2..].to_string()]))
        } else {
            (rest, None)
        };

        // USE dependencies go back to the Portage parser after the slot
        let (body, use_deps) = match rest.find('[') {
            Some(pos) => {
                let close = rest[pos..].find(']')? + pos;
                (
                    format!("{}{}", &rest[..pos], &rest[close + 1..]),
                    &rest[pos..=close],
                )
            }
            None => (rest.to_string(), ""),
        };

        let (op, body) = split_operator(&body);

        let marker = body.find(MARKERS).unwrap_or(body.len());
        let (cpv, mut markers) = body.split_at(marker);

        let mut slot = None;
        let mut tag = None;
        let mut revision = None;
        while let Some(kind) = markers.chars().next() {
            let body = &markers[1..];
            let end = body.find(MARKERS).unwrap_or(body.len());
            let value = &body[..end];
            match kind {
                ':' => slot = Some(value),
                '#' | '|' => tag = Some(value.to_string()),
                _ => revision = Some(value.parse::<i64>().ok()?),
            }
            markers = &body[end..];
        }

        let (qualified, has_category) = if cpv.contains('/') {
            (cpv.to_string(), true)
        } else {
            (format!("{}/{}", NULL_CATEGORY, cpv), false)
        };
        let mut suffix = String::new();
        if let Some(slot) = slot.filter(|s| !s.is_empty()) {
            suffix.push(':');
            suffix.push_str(slot);
        }
        suffix.push_str(use_deps);

        let dep = parse_dep(op, &qualified, &suffix)?;
        if dep.blocker.is_some() {
            return None;
        }

        let name = dep.cpn.package.to_string();
        let (version, wildcard) = match &dep.version {
            Some(parsed) => {
                let pv = cpv.rsplit_once('/').map_or(cpv, |(_, pv)| pv);
                let text = pv.strip_prefix(name.as_str())?.strip_prefix('-')?;
                let text = text.strip_suffix('*').unwrap_or(text);
                (Some(text.to_string()), parsed.glob)
            }
            None => (None, false),
        };
        let operator = if op.is_empty() {
            None
        } else {
            dep.version.as_ref().and_then(|v| v.op)
        };

        Some(Atom {
            conflict,
            operator,
            category: has_category.then(|| dep.cpn.category.to_string()),
            name,
            version,
            wildcard,
            slot: dep_slot(&dep),
            tag: tag.filter(|t| !t.is_empty()),
            revision,
            repositories,
        })
    }

    /// The atom version as a comparable [`Version`], glob included
    pub fn version_constraint(&self) -> Option<Version> {
        let mut parsed = Version::parse(self.version.as_deref()?).ok()?;
        parsed.op = None;
        parsed.glob = self.wildcard;
        Some(parsed)
    }

    /// Build a plain `category/name` atom.
    pub fn from_key(key: &str) -> Option<Self> {
        Self::parse(key).filter(|atom| atom.version.is_none())
    }

    /// `category/name`, or just the name when no category was given
    pub fn key(&self) -> String {
        match &self.category {
            Some(category) => format!("{}/{}", category, self.name),
            None => self.name.clone(),
        }
    }

    /// The category, `null` when absent
    pub fn category_or_null(&self) -> &str {
        self.category.as_deref().unwrap_or(NULL_CATEGORY)
    }

    /// Whether the atom is only a key (no version constraint)
    pub fn is_just_name(&self) -> bool {
        self.version.is_none()
    }

    /// Copy of this atom without the conflict marker
    pub fn without_conflict(&self) -> Self {
        Self {
            conflict: false,
            ..self.clone()
        }
    }

    /// Copy of this atom without the repository restriction
    pub fn without_repositories(&self) -> Self {
        Self {
            repositories: None,
            ..self.clone()
        }
    }

    pub fn with_slot(&self, slot: impl Into<String>) -> Self {
        Self {
            slot: Some(slot.into()),
            ..self.clone()
        }
    }

    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            ..self.clone()
        }
    }
}

impl FromStr for Atom {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Atom::parse(s).ok_or_else(|| format!("Invalid atom: {}", s))
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.conflict {
            write!(f, "!")?;
        }
        if let Some(op) = &self.operator {
            write!(f, "{}", op)?;
        }
        write!(f, "{}", self.key())?;
        if let Some(version) = &self.version {
            write!(f, "-{}", version)?;
            if self.wildcard {
                write!(f, "*")?;
            }
        }
        if let Some(slot) = &self.slot {
            write!(f, ":{}", slot)?;
        }
        if let Some(tag) = &self.tag {
            write!(f, "#{}", tag)?;
        }
        if let Some(revision) = self.revision {
            write!(f, "~{}", revision)?;
        }
        if let Some(repos) = &self.repositories {
            write!(f, "@{}", repos.join(","))?;
        }
        Ok(())
    }
}

/// Split an or-dependency (`a;b;c?`) into its alternatives.
///
/// Returns `None` for plain dependencies.
pub fn split_or_dependency(dependency: &str) -> Option<Vec<&str>> {
    let body = dependency.strip_suffix(OR_DEP_MARKER)?;
    Some(
        body.split(OR_DEP_SEPARATOR)
            .filter(|alt| !alt.is_empty())
            .collect(),
    )
}

/// Key of a dependency string, `None` when unparseable.
pub fn dependency_key(dependency: &str) -> Option<String> {
    Atom::parse(dependency).map(|atom| atom.key())
}

/// Build the `key:slot` atom string.
pub fn key_slot_atom(key: &str, slot: &str) -> String {
    format!("{}:{}", key, slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_key() {
        let atom = Atom::parse("app-misc/foo").unwrap();
        assert_eq!(atom.category.as_deref(), Some("app-misc"));
        assert_eq!(atom.name, "foo");
        assert!(atom.is_just_name());
        assert!(atom.operator.is_none());
        assert_eq!(atom.key(), "app-misc/foo");
    }

    #[test]
    fn test_parse_versioned_atom() {
        let atom = Atom::parse(">=dev-libs/glib-2.30.1-r2:2").unwrap();
        assert_eq!(atom.operator, Some(Operator::GreaterOrEqual));
        assert_eq!(atom.name, "glib");
        assert_eq!(atom.version.as_deref(), Some("2.30.1-r2"));
        assert_eq!(atom.slot.as_deref(), Some("2"));
    }

    #[test]
    fn test_parse_dashed_name() {
        let atom = Atom::parse("x11-libs/gtk-engines-2.20").unwrap();
        assert_eq!(atom.name, "gtk-engines");
        assert_eq!(atom.version.as_deref(), Some("2.20"));

        let atom = Atom::parse("media-fonts/dejavu-fonts").unwrap();
        assert_eq!(atom.name, "dejavu-fonts");
        assert!(atom.version.is_none());
    }

    #[test]
    fn test_parse_tag_revision_and_repositories() {
        let atom = Atom::parse("=x11-drivers/nvidia-drivers-260.19#2.6.35~3@main,extra").unwrap();
        assert_eq!(atom.tag.as_deref(), Some("2.6.35"));
        assert_eq!(atom.revision, Some(3));
        assert_eq!(
            atom.repositories,
            Some(vec!["main".to_string(), "extra".to_string()])
        );

        let atom = Atom::parse("app/foo::main").unwrap();
        assert_eq!(atom.repositories, Some(vec!["main".to_string()]));
        assert!(atom.slot.is_none());

        let atom = Atom::parse("=app/foo-1.0~-1").unwrap();
        assert_eq!(atom.revision, Some(-1));
    }

    #[test]
    fn test_parse_conflict_and_wildcard() {
        let atom = Atom::parse("!=app/bar-1.2*").unwrap();
        assert!(atom.conflict);
        assert!(atom.wildcard);
        assert_eq!(atom.version.as_deref(), Some("1.2"));
        assert!(!atom.without_conflict().conflict);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Atom::parse("").is_none());
        assert!(Atom::parse(">=app/foo").is_none());
        assert!(Atom::parse("-app/foo").is_none());
        assert!(Atom::parse("app/foo~x").is_none());
        assert!(Atom::parse("app/(foo)").is_none());
    }

    #[test]
    fn test_display_roundtrips_structure() {
        for input in ["!>=app/foo-1.0:2#tag~3@r1", "app/foo", "=bar-2.0*"] {
            let atom = Atom::parse(input).unwrap();
            assert_eq!(atom.to_string(), input);
        }
        let atom = Atom::parse("app/foo").unwrap().with_slot("1");
        assert_eq!(atom.to_string(), "app/foo:1");
    }

    #[test]
    fn test_version_constraint() {
        let atom = Atom::parse("=app/foo-1.2*").unwrap();
        let constraint = atom.version_constraint().unwrap();
        assert!(constraint.glob);
        assert_eq!(Version::parse("1.2.7").unwrap().cmp(&constraint), std::cmp::Ordering::Equal);

        let atom = Atom::parse("app/foo-1.0-r0").unwrap();
        assert!(atom.operator.is_none());
        assert_eq!(atom.version.as_deref(), Some("1.0-r0"));
        assert!(Atom::parse("app/foo").unwrap().version_constraint().is_none());
    }

    #[test]
    fn test_parse_pipe_tag() {
        let atom = Atom::parse("app/foo|kernel").unwrap();
        assert_eq!(atom.tag.as_deref(), Some("kernel"));
        assert_eq!(atom.key(), "app/foo");
        assert_eq!(atom.to_string(), "app/foo#kernel");

        let atom = Atom::parse("=app/foo-1.0|2.6.35~2").unwrap();
        assert_eq!(atom.tag.as_deref(), Some("2.6.35"));
        assert_eq!(atom.revision, Some(2));
    }

    #[test]
    fn test_parse_use_dependencies_are_ignored() {
        let atom = Atom::parse(">=app/foo-1.0:2[ssl,-debug]").unwrap();
        assert_eq!(atom.slot.as_deref(), Some("2"));
        assert_eq!(atom.version.as_deref(), Some("1.0"));
        assert_eq!(atom.to_string(), ">=app/foo-1.0:2");
    }

    #[test]
    fn test_split_or_dependency() {
        assert_eq!(
            split_or_dependency("app/a;app/b>=1?"),
            Some(vec!["app/a", "app/b>=1"])
        );
        assert_eq!(split_or_dependency("app/a"), None);
    }
}
