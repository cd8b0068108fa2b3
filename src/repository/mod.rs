// src/repository/mod.rs

//! Package repositories
//!
//! This module provides:
//! - The `PackageRepository` query interface the resolver works against
//! - Package matches, dependency types and ELF library metadata
//! - In-memory and SQLite-backed repository implementations
//! - Repository management (add/remove/enable) and index import

pub mod index;
pub mod matching;
pub mod memory;
pub mod sqlite;

pub use index::{PackageMetadata, RepositoryIndex, import_index, load_index};
pub use matching::MatchFilter;
pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use crate::atom::{Atom, dependency_key, split_or_dependency};
use crate::db::models::Repository;
use crate::error::{Error, Result};
use crate::version::VersionKey;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use tracing::info;

/// Package identifier, unique within one repository
pub type PackageId = i64;

/// Package id of a match that was not found
pub const NOT_FOUND_ID: PackageId = -1;

/// Name of the repository holding the installed packages
pub const INSTALLED_REPOSITORY: &str = "__system__";

/// Name used for not-found matches
pub const NOT_FOUND_REPOSITORY: &str = "__not_found__";

/// A package in a specific repository
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageMatch {
    pub package_id: PackageId,
    pub repository: String,
}

impl PackageMatch {
    pub fn new(package_id: PackageId, repository: impl Into<String>) -> Self {
        Self {
            package_id,
            repository: repository.into(),
        }
    }

    /// A match in the installed packages repository
    pub fn installed(package_id: PackageId) -> Self {
        Self::new(package_id, INSTALLED_REPOSITORY)
    }

    pub fn not_found() -> Self {
        Self::new(NOT_FOUND_ID, NOT_FOUND_REPOSITORY)
    }

    pub fn is_not_found(&self) -> bool {
        self.package_id == NOT_FOUND_ID
    }

    pub fn is_installed(&self) -> bool {
        self.repository == INSTALLED_REPOSITORY
    }
}

impl fmt::Display for PackageMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.package_id, self.repository)
    }
}

/// Kind of a dependency edge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyType {
    /// Needed at run time, installed before the dependent
    #[default]
    Runtime,
    /// Installed after the dependent
    Post,
    /// Added by hand by the repository maintainer
    Manual,
    /// Only needed to build the package
    Build,
}

impl DependencyType {
    pub fn as_str(&self) -> &str {
        match self {
            DependencyType::Runtime => "runtime",
            DependencyType::Post => "post",
            DependencyType::Manual => "manual",
            DependencyType::Build => "build",
        }
    }
}

impl FromStr for DependencyType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "runtime" => Ok(DependencyType::Runtime),
            "post" => Ok(DependencyType::Post),
            "manual" => Ok(DependencyType::Manual),
            "build" => Ok(DependencyType::Build),
            _ => Err(format!("Invalid dependency type: {}", s)),
        }
    }
}

/// A dependency string with its type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dependency {
    pub atom: String,
    #[serde(default)]
    pub dep_type: DependencyType,
}

impl Dependency {
    pub fn new(atom: impl Into<String>, dep_type: DependencyType) -> Self {
        Self {
            atom: atom.into(),
            dep_type,
        }
    }
}

/// A shared library shipped by a package
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProvidedLibrary {
    pub soname: String,
    pub path: String,
    pub elf_class: i32,
}

/// A shared library a package links against (ELF `NEEDED`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NeededLibrary {
    pub soname: String,
    pub elf_class: i32,
    #[serde(default)]
    pub rpath: String,
}

/// Base metadata of one package build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub category: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub revision: i64,
    #[serde(default = "default_slot")]
    pub slot: String,
    /// Content digest of the package file
    #[serde(default = "default_digest")]
    pub digest: String,
    /// Flagged as required by the base system
    #[serde(default)]
    pub system: bool,
    /// Hidden by masking policy
    #[serde(default)]
    pub masked: bool,
}

fn default_slot() -> String {
    "0".to_string()
}

fn default_digest() -> String {
    "0".to_string()
}

impl PackageRecord {
    pub fn new(category: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
            version: version.into(),
            tag: String::new(),
            revision: 0,
            slot: default_slot(),
            digest: default_digest(),
            system: false,
            masked: false,
        }
    }

    /// `category/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.category, self.name)
    }

    /// `category/name-version[#tag]`
    pub fn atom(&self) -> String {
        if self.tag.is_empty() {
            format!("{}/{}-{}", self.category, self.name, self.version)
        } else {
            format!("{}/{}-{}#{}", self.category, self.name, self.version, self.tag)
        }
    }

    pub fn version_key(&self) -> VersionKey {
        VersionKey::new(self.version.clone(), self.tag.clone(), self.revision)
    }
}

/// Query interface over one package repository.
///
/// Implementations provide the storage primitives; matching and the
/// derived lookups come as provided methods.
pub trait PackageRepository {
    /// Repository name
    fn name(&self) -> &str;

    /// Fingerprint of the repository content
    fn checksum(&self) -> Result<String>;

    /// Every package id, in ascending order
    fn list_package_ids(&self) -> Result<Vec<PackageId>>;

    /// Packages with the given name, in any category
    fn search_name(&self, name: &str, case_sensitive: bool) -> Result<Vec<PackageId>>;

    fn retrieve_record(&self, package_id: PackageId) -> Result<Option<PackageRecord>>;

    /// Dependencies of every type
    fn retrieve_dependency_entries(&self, package_id: PackageId) -> Result<Vec<Dependency>>;

    fn retrieve_conflicts(&self, package_id: PackageId) -> Result<BTreeSet<String>>;

    fn retrieve_provided_libraries(&self, package_id: PackageId) -> Result<BTreeSet<ProvidedLibrary>>;

    fn retrieve_needed_libraries(&self, package_id: PackageId) -> Result<BTreeSet<NeededLibrary>>;

    /// Packages linking against `soname`
    fn search_needed(&self, soname: &str, elf_class: i32) -> Result<BTreeSet<PackageId>>;

    /// Packages providing `soname`, with the library path
    fn resolve_needed(&self, soname: &str, elf_class: i32) -> Result<BTreeSet<(PackageId, String)>>;

    /// Packages declaring a conflict on `key`, with the conflict string
    fn search_conflict(&self, key: &str) -> Result<BTreeSet<(PackageId, String)>>;

    /// Packages with the given name and category
    fn search_name_category(&self, name: &str, category: &str) -> Result<Vec<PackageId>> {
        let mut found = Vec::new();
        for package_id in self.search_name(name, true)? {
            if let Some(record) = self.retrieve_record(package_id)? {
                if record.category == category {
                    found.push(package_id);
                }
            }
        }
        Ok(found)
    }

    fn retrieve_atom(&self, package_id: PackageId) -> Result<Option<String>> {
        Ok(self.retrieve_record(package_id)?.map(|r| r.atom()))
    }

    fn retrieve_key_slot(&self, package_id: PackageId) -> Result<Option<(String, String)>> {
        Ok(self.retrieve_record(package_id)?.map(|r| (r.key(), r.slot)))
    }

    fn retrieve_version_key(&self, package_id: PackageId) -> Result<Option<VersionKey>> {
        Ok(self.retrieve_record(package_id)?.map(|r| r.version_key()))
    }

    fn retrieve_digest(&self, package_id: PackageId) -> Result<Option<String>> {
        Ok(self.retrieve_record(package_id)?.map(|r| r.digest))
    }

    /// Dependency strings, minus the excluded types
    fn retrieve_dependencies(
        &self,
        package_id: PackageId,
        exclude: &[DependencyType],
    ) -> Result<BTreeSet<String>> {
        Ok(self
            .retrieve_dependency_entries(package_id)?
            .into_iter()
            .filter(|dep| !exclude.contains(&dep.dep_type))
            .map(|dep| dep.atom)
            .collect())
    }

    /// Packages whose dependencies are satisfied by `package_id`, with the
    /// dependency string that matched.
    fn retrieve_reverse_dependencies(
        &self,
        package_id: PackageId,
        exclude: &[DependencyType],
    ) -> Result<BTreeSet<(PackageId, String)>> {
        let Some(record) = self.retrieve_record(package_id)? else {
            return Ok(BTreeSet::new());
        };
        let key = record.key();
        let filter = MatchFilter::default();

        let mut reverse = BTreeSet::new();
        for candidate in self.list_package_ids()? {
            if candidate == package_id {
                continue;
            }
            for dep in self.retrieve_dependency_entries(candidate)? {
                if exclude.contains(&dep.dep_type) {
                    continue;
                }
                if !dependency_may_match(&dep.atom, &key, &record.name) {
                    continue;
                }
                if self.atom_match(&dep.atom, &filter)? == Some(package_id) {
                    reverse.insert((candidate, dep.atom));
                }
            }
        }
        Ok(reverse)
    }

    fn is_system_package(&self, package_id: PackageId) -> Result<bool> {
        Ok(self
            .retrieve_record(package_id)?
            .map(|r| r.system)
            .unwrap_or(false))
    }

    /// `Some(package_id)` when visible, `None` when masked
    fn mask_filter(&self, package_id: PackageId) -> Result<Option<PackageId>> {
        match self.retrieve_record(package_id)? {
            Some(record) if !record.masked => Ok(Some(package_id)),
            _ => Ok(None),
        }
    }

    /// Best package matching `atom` in this repository
    fn atom_match(&self, atom: &str, filter: &MatchFilter) -> Result<Option<PackageId>> {
        matching::atom_match(self, atom, filter)
    }

    /// Every package matching `atom` in this repository
    fn atom_match_multi(&self, atom: &str, filter: &MatchFilter) -> Result<BTreeSet<PackageId>> {
        matching::atom_match_multi(self, atom, filter)
    }
}

/// Cheap pre-check: can `dependency` possibly name the package `key`?
pub(crate) fn dependency_may_match(dependency: &str, key: &str, name: &str) -> bool {
    match split_or_dependency(dependency) {
        Some(alternatives) => alternatives
            .iter()
            .any(|alt| dependency_may_match(alt, key, name)),
        None => match dependency_key(dependency) {
            Some(dep_key) => dep_key == key || dep_key == name,
            None => false,
        },
    }
}

/// Key of a dependency string or, for or-dependencies, of every alternative
pub fn dependency_keys(dependency: &str) -> Vec<String> {
    match split_or_dependency(dependency) {
        Some(alternatives) => alternatives.iter().filter_map(|a| dependency_key(a)).collect(),
        None => dependency_key(dependency).into_iter().collect(),
    }
}

/// Whether the dependency string is a conflict (`!atom`)
pub fn is_conflict(dependency: &str) -> bool {
    dependency.starts_with('!')
}

/// Key of a conflict string, without the `!`
pub fn conflict_key(conflict: &str) -> Option<String> {
    Atom::parse(conflict).map(|atom| atom.key())
}

/// Add a new repository to the database
pub fn add_repository(
    conn: &Connection,
    name: String,
    url: String,
    enabled: bool,
    priority: i32,
) -> Result<Repository> {
    if name == INSTALLED_REPOSITORY {
        return Err(Error::ConflictError(format!(
            "Repository name '{}' is reserved",
            name
        )));
    }
    if Repository::find_by_name(conn, &name)?.is_some() {
        return Err(Error::ConflictError(format!(
            "Repository '{}' already exists",
            name
        )));
    }

    let mut repo = Repository::new(name, url);
    repo.enabled = enabled;
    repo.priority = priority;

    repo.insert(conn)?;

    info!("Added repository: {} ({})", repo.name, repo.url);
    Ok(repo)
}

/// Remove a repository and its packages from the database
pub fn remove_repository(conn: &Connection, name: &str) -> Result<()> {
    let repo = Repository::find_by_name(conn, name)?
        .ok_or_else(|| Error::NotFoundError(format!("Repository '{}' not found", name)))?;
    let id = repo
        .id
        .ok_or_else(|| Error::NotFoundError(format!("Repository '{}' has no id", name)))?;

    Repository::delete(conn, id)?;
    info!("Removed repository: {}", name);
    Ok(())
}

/// Enable or disable a repository
pub fn set_repository_enabled(conn: &Connection, name: &str, enabled: bool) -> Result<()> {
    let mut repo = Repository::find_by_name(conn, name)?
        .ok_or_else(|| Error::NotFoundError(format!("Repository '{}' not found", name)))?;

    repo.enabled = enabled;
    repo.update(conn)?;

    info!(
        "Repository '{}' {}",
        name,
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

/// Get current timestamp as RFC 3339 string
pub(crate) fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
