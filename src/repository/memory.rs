// src/repository/memory.rs

//! In-memory package repository
//!
//! Used by tests and by callers that already hold a repository index.

use super::{
    Dependency, INSTALLED_REPOSITORY, NeededLibrary, PackageId, PackageMetadata, PackageRecord,
    PackageRepository, ProvidedLibrary, RepositoryIndex,
};
use crate::atom::dependency_key;
use crate::error::Result;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// A repository kept entirely in memory
#[derive(Debug, Clone)]
pub struct InMemoryRepository {
    name: String,
    packages: BTreeMap<PackageId, PackageMetadata>,
    next_id: PackageId,
}

impl InMemoryRepository {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            packages: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Empty installed packages repository
    pub fn installed() -> Self {
        Self::new(INSTALLED_REPOSITORY)
    }

    /// Build a repository from an index, numbering packages from 1
    pub fn from_index(name: impl Into<String>, index: &RepositoryIndex) -> Self {
        let mut repo = Self::new(name);
        for package in &index.packages {
            repo.add(package.clone());
        }
        repo
    }

    /// Add a package under the next free id
    pub fn add(&mut self, package: PackageMetadata) -> PackageId {
        let package_id = self.next_id;
        self.insert(package_id, package);
        package_id
    }

    /// Add or replace a package under an explicit id
    pub fn insert(&mut self, package_id: PackageId, package: PackageMetadata) {
        self.packages.insert(package_id, package);
        if package_id >= self.next_id {
            self.next_id = package_id + 1;
        }
    }

    pub fn remove(&mut self, package_id: PackageId) -> Option<PackageMetadata> {
        self.packages.remove(&package_id)
    }

    pub fn get(&self, package_id: PackageId) -> Option<&PackageMetadata> {
        self.packages.get(&package_id)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

impl PackageRepository for InMemoryRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn checksum(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        for (package_id, package) in &self.packages {
            hasher.update(package_id.to_le_bytes());
            hasher.update(serde_json::to_vec(package)?);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn list_package_ids(&self) -> Result<Vec<PackageId>> {
        Ok(self.packages.keys().copied().collect())
    }

    fn search_name(&self, name: &str, case_sensitive: bool) -> Result<Vec<PackageId>> {
        Ok(self
            .packages
            .iter()
            .filter(|(_, p)| {
                if case_sensitive {
                    p.record.name == name
                } else {
                    p.record.name.eq_ignore_ascii_case(name)
                }
            })
            .map(|(id, _)| *id)
            .collect())
    }

    fn search_name_category(&self, name: &str, category: &str) -> Result<Vec<PackageId>> {
        Ok(self
            .packages
            .iter()
            .filter(|(_, p)| p.record.name == name && p.record.category == category)
            .map(|(id, _)| *id)
            .collect())
    }

    fn retrieve_record(&self, package_id: PackageId) -> Result<Option<PackageRecord>> {
        Ok(self.packages.get(&package_id).map(|p| p.record.clone()))
    }

    fn retrieve_dependency_entries(&self, package_id: PackageId) -> Result<Vec<Dependency>> {
        Ok(self
            .packages
            .get(&package_id)
            .map(|p| p.dependencies.clone())
            .unwrap_or_default())
    }

    fn retrieve_conflicts(&self, package_id: PackageId) -> Result<BTreeSet<String>> {
        Ok(self
            .packages
            .get(&package_id)
            .map(|p| p.conflicts.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn retrieve_provided_libraries(&self, package_id: PackageId) -> Result<BTreeSet<ProvidedLibrary>> {
        Ok(self
            .packages
            .get(&package_id)
            .map(|p| p.provided_libraries.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn retrieve_needed_libraries(&self, package_id: PackageId) -> Result<BTreeSet<NeededLibrary>> {
        Ok(self
            .packages
            .get(&package_id)
            .map(|p| p.needed_libraries.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn search_needed(&self, soname: &str, elf_class: i32) -> Result<BTreeSet<PackageId>> {
        Ok(self
            .packages
            .iter()
            .filter(|(_, p)| {
                p.needed_libraries
                    .iter()
                    .any(|l| l.soname == soname && l.elf_class == elf_class)
            })
            .map(|(id, _)| *id)
            .collect())
    }

    fn resolve_needed(&self, soname: &str, elf_class: i32) -> Result<BTreeSet<(PackageId, String)>> {
        let mut found = BTreeSet::new();
        for (package_id, package) in &self.packages {
            for lib in &package.provided_libraries {
                if lib.soname == soname && lib.elf_class == elf_class {
                    found.insert((*package_id, lib.path.clone()));
                }
            }
        }
        Ok(found)
    }

    fn search_conflict(&self, key: &str) -> Result<BTreeSet<(PackageId, String)>> {
        let mut found = BTreeSet::new();
        for (package_id, package) in &self.packages {
            for conflict in &package.conflicts {
                if dependency_key(conflict).as_deref() == Some(key) {
                    found.insert((*package_id, conflict.clone()));
                }
            }
        }
        Ok(found)
    }
}
