// src/resolver/repositories.rs

//! The set of repositories a resolution runs against
//!
//! One installed-packages repository plus any number of available
//! repositories, kept in priority order (first = preferred).

use crate::db;
use crate::db::models::Repository;
use crate::error::{Error, Result};
use crate::repository::{INSTALLED_REPOSITORY, PackageRepository, SqliteRepository};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Installed repository plus the available repositories, by priority
pub struct RepositorySet {
    installed: Box<dyn PackageRepository>,
    repositories: Vec<Box<dyn PackageRepository>>,
}

impl RepositorySet {
    pub fn new<R: PackageRepository + 'static>(installed: R) -> Self {
        Self {
            installed: Box::new(installed),
            repositories: Vec::new(),
        }
    }

    /// Append a repository with the lowest priority so far
    pub fn add_repository<R: PackageRepository + 'static>(&mut self, repository: R) -> Result<()> {
        let name = repository.name().to_string();
        if name == INSTALLED_REPOSITORY {
            return Err(Error::ConflictError(format!(
                "Repository name '{}' is reserved",
                name
            )));
        }
        if self.repositories.iter().any(|r| r.name() == name) {
            return Err(Error::ConflictError(format!(
                "Repository '{}' already exists",
                name
            )));
        }
        self.repositories.push(Box::new(repository));
        Ok(())
    }

    pub fn with_repository<R: PackageRepository + 'static>(mut self, repository: R) -> Result<Self> {
        self.add_repository(repository)?;
        Ok(self)
    }

    /// Open the installed repository and every enabled repository of an
    /// equo database, in configured priority order
    pub fn open_database(db_path: &str) -> Result<Self> {
        let installed = SqliteRepository::open(db_path, INSTALLED_REPOSITORY)?;
        let mut set = Self::new(installed);

        let conn = db::open(db_path)?;
        for repo in Repository::list_enabled(&conn)? {
            debug!("Using repository {} (priority {})", repo.name, repo.priority);
            set.add_repository(SqliteRepository::open(db_path, &repo.name)?)?;
        }
        Ok(set)
    }

    pub fn installed(&self) -> &dyn PackageRepository {
        self.installed.as_ref()
    }

    /// Available repositories, highest priority first
    pub fn repositories(&self) -> impl Iterator<Item = &dyn PackageRepository> {
        self.repositories.iter().map(|r| r.as_ref())
    }

    pub fn repository_names(&self) -> Vec<&str> {
        self.repositories.iter().map(|r| r.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }

    /// Look up an available repository, or the installed one by its
    /// reserved name
    pub fn open_repository(&self, name: &str) -> Result<&dyn PackageRepository> {
        if name == INSTALLED_REPOSITORY {
            return Ok(self.installed());
        }
        self.repositories
            .iter()
            .find(|r| r.name() == name)
            .map(|r| r.as_ref())
            .ok_or_else(|| Error::RepositoryNotFound(name.to_string()))
    }

    /// Fingerprint of every repository's content and of their order
    pub fn checksum(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        for repo in std::iter::once(self.installed()).chain(self.repositories()) {
            hasher.update(repo.name().as_bytes());
            hasher.update(b"\0");
            hasher.update(repo.checksum()?.as_bytes());
            hasher.update(b"\n");
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}
