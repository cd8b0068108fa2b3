// src/repository/index.rs

//! JSON repository indexes
//!
//! A repository index is the serialized package list of one repository.
//! It can be loaded into an [`InMemoryRepository`](super::InMemoryRepository)
//! or imported into the equo database, replacing what was stored before.

use super::{
    Dependency, DependencyType, NeededLibrary, PackageRecord, ProvidedLibrary, current_timestamp,
};
use crate::db::models::{ConflictEntry, DependencyEntry, LibraryEntry, PackageEntry, Repository};
use crate::error::{Error, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Full metadata of one package build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMetadata {
    #[serde(flatten)]
    pub record: PackageRecord,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Conflict atoms, without the leading `!`
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default)]
    pub provided_libraries: Vec<ProvidedLibrary>,
    #[serde(default)]
    pub needed_libraries: Vec<NeededLibrary>,
}

impl PackageMetadata {
    pub fn new(category: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            record: PackageRecord::new(category, name, version),
            dependencies: Vec::new(),
            conflicts: Vec::new(),
            provided_libraries: Vec::new(),
            needed_libraries: Vec::new(),
        }
    }

    pub fn slot(mut self, slot: impl Into<String>) -> Self {
        self.record.slot = slot.into();
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.record.tag = tag.into();
        self
    }

    pub fn revision(mut self, revision: i64) -> Self {
        self.record.revision = revision;
        self
    }

    pub fn digest(mut self, digest: impl Into<String>) -> Self {
        self.record.digest = digest.into();
        self
    }

    pub fn system(mut self, system: bool) -> Self {
        self.record.system = system;
        self
    }

    pub fn masked(mut self, masked: bool) -> Self {
        self.record.masked = masked;
        self
    }

    /// Add a runtime dependency
    pub fn depends(self, atom: impl Into<String>) -> Self {
        self.dependency(atom, DependencyType::Runtime)
    }

    pub fn post_depends(self, atom: impl Into<String>) -> Self {
        self.dependency(atom, DependencyType::Post)
    }

    pub fn build_depends(self, atom: impl Into<String>) -> Self {
        self.dependency(atom, DependencyType::Build)
    }

    pub fn manual_depends(self, atom: impl Into<String>) -> Self {
        self.dependency(atom, DependencyType::Manual)
    }

    fn dependency(mut self, atom: impl Into<String>, dep_type: DependencyType) -> Self {
        self.dependencies.push(Dependency::new(atom, dep_type));
        self
    }

    pub fn conflicts(mut self, atom: impl Into<String>) -> Self {
        let atom = atom.into();
        self.conflicts.push(atom.trim_start_matches('!').to_string());
        self
    }

    pub fn provides_library(mut self, soname: impl Into<String>, path: impl Into<String>, elf_class: i32) -> Self {
        self.provided_libraries.push(ProvidedLibrary {
            soname: soname.into(),
            path: path.into(),
            elf_class,
        });
        self
    }

    pub fn needs_library(mut self, soname: impl Into<String>, elf_class: i32, rpath: impl Into<String>) -> Self {
        self.needed_libraries.push(NeededLibrary {
            soname: soname.into(),
            elf_class,
            rpath: rpath.into(),
        });
        self
    }
}

/// Serialized package list of a repository
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryIndex {
    /// Repository the index was generated for
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub packages: Vec<PackageMetadata>,
}

/// Read a repository index from a JSON file
pub fn load_index(path: impl AsRef<Path>) -> Result<RepositoryIndex> {
    let path = path.as_ref();
    debug!("Loading repository index from {}", path.display());

    let content = fs::read_to_string(path)?;
    let index: RepositoryIndex = serde_json::from_str(&content)?;
    Ok(index)
}

/// Replace the packages of `repo_name` with the content of `index`.
///
/// Runs inside one transaction and stamps the repository's `last_sync`.
/// Returns the number of imported packages.
pub fn import_index(conn: &mut Connection, repo_name: &str, index: &RepositoryIndex) -> Result<usize> {
    let mut repo = Repository::find_by_name(conn, repo_name)?
        .ok_or_else(|| Error::NotFoundError(format!("Repository '{}' not found", repo_name)))?;
    let repo_id = repo
        .id
        .ok_or_else(|| Error::NotFoundError(format!("Repository '{}' has no id", repo_name)))?;

    let count = crate::db::transaction(conn, |tx| {
        PackageEntry::delete_by_repository(tx, repo_id)?;

        for package in &index.packages {
            let mut entry = PackageEntry::new(repo_id, package.record.clone());
            let package_id = entry.insert(tx)?;

            for dep in &package.dependencies {
                DependencyEntry::new(package_id, dep.clone()).insert(tx)?;
            }
            for conflict in &package.conflicts {
                ConflictEntry::new(package_id, conflict.clone()).insert(tx)?;
            }
            for lib in &package.provided_libraries {
                LibraryEntry::insert_provided(tx, package_id, lib)?;
            }
            for lib in &package.needed_libraries {
                LibraryEntry::insert_needed(tx, package_id, lib)?;
            }
        }

        repo.last_sync = Some(current_timestamp());
        repo.update(tx)?;
        Ok(index.packages.len())
    })?;

    info!("Imported {} packages into repository {}", count, repo_name);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_index_json_defaults() {
        let json = r#"{
            "name": "main",
            "packages": [
                {
                    "category": "app",
                    "name": "foo",
                    "version": "1.0",
                    "dependencies": [
                        {"atom": "app/bar"},
                        {"atom": "app/baz", "dep_type": "post"}
                    ]
                }
            ]
        }"#;

        let index: RepositoryIndex = serde_json::from_str(json).unwrap();
        let pkg = &index.packages[0];
        assert_eq!(pkg.record.slot, "0");
        assert_eq!(pkg.record.digest, "0");
        assert_eq!(pkg.dependencies[0].dep_type, DependencyType::Runtime);
        assert_eq!(pkg.dependencies[1].dep_type, DependencyType::Post);
    }

    #[test]
    fn test_load_index_from_file() {
        let index = RepositoryIndex {
            name: "main".to_string(),
            packages: vec![PackageMetadata::new("app", "foo", "1.0").conflicts("!app/bar")],
        };

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string(&index).unwrap().as_bytes()).unwrap();

        let loaded = load_index(file.path()).unwrap();
        assert_eq!(loaded, index);
        assert_eq!(loaded.packages[0].conflicts, vec!["app/bar"]);
    }

    #[test]
    fn test_import_replaces_packages_and_stamps_sync() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();
        db::init(db_path).unwrap();
        let mut conn = db::open(db_path).unwrap();
        crate::repository::add_repository(&conn, "main".to_string(), "file:///main".to_string(), true, 0)
            .unwrap();

        let first = RepositoryIndex {
            name: "main".to_string(),
            packages: vec![
                PackageMetadata::new("app", "foo", "1.0").depends("app/bar"),
                PackageMetadata::new("app", "bar", "1.0"),
            ],
        };
        assert_eq!(import_index(&mut conn, "main", &first).unwrap(), 2);

        let second = RepositoryIndex {
            name: "main".to_string(),
            packages: vec![PackageMetadata::new("app", "foo", "2.0")],
        };
        assert_eq!(import_index(&mut conn, "main", &second).unwrap(), 1);

        let repo = Repository::find_by_name(&conn, "main").unwrap().unwrap();
        assert!(repo.last_sync.is_some());
        let packages = PackageEntry::find_by_repository(&conn, repo.id.unwrap()).unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].record.version, "2.0");
    }

    #[test]
    fn test_import_into_unknown_repository() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();
        db::init(db_path).unwrap();
        let mut conn = db::open(db_path).unwrap();

        let result = import_index(&mut conn, "nope", &RepositoryIndex::default());
        assert!(matches!(result, Err(Error::NotFoundError(_))));
    }
}
