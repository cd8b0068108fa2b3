// src/db/models.rs

//! Data models for equo database entities
//!
//! This module defines Rust structs that correspond to database tables
//! and provides methods for creating, reading, updating, and deleting records.

use crate::error::{Error, Result};
use crate::repository::{
    Dependency, DependencyType, INSTALLED_REPOSITORY, NeededLibrary, PackageRecord,
    ProvidedLibrary,
};
use rusqlite::{Connection, OptionalExtension, Row, params};

/// Repository represents a package index, or the installed packages
#[derive(Debug, Clone)]
pub struct Repository {
    pub id: Option<i64>,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    /// Lower values are consulted first
    pub priority: i32,
    pub last_sync: Option<String>,
    pub created_at: Option<String>,
}

impl Repository {
    /// Create a new Repository
    pub fn new(name: String, url: String) -> Self {
        Self {
            id: None,
            name,
            url,
            enabled: true,
            priority: 0,
            last_sync: None,
            created_at: None,
        }
    }

    /// Insert this repository into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO repositories (name, url, enabled, priority, last_sync)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &self.name,
                &self.url,
                self.enabled as i32,
                &self.priority,
                &self.last_sync,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Register the installed packages repository if it is missing
    pub fn ensure_installed(conn: &Connection) -> Result<Self> {
        if let Some(repo) = Self::find_by_name(conn, INSTALLED_REPOSITORY)? {
            return Ok(repo);
        }

        let mut repo = Self::new(INSTALLED_REPOSITORY.to_string(), "file:///".to_string());
        // never part of the matching order
        repo.enabled = false;
        repo.insert(conn)?;
        Ok(repo)
    }

    /// Find a repository by ID
    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, url, enabled, priority, last_sync, created_at
             FROM repositories WHERE id = ?1",
        )?;

        let repo = stmt.query_row([id], Self::from_row).optional()?;

        Ok(repo)
    }

    /// Find a repository by name
    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, url, enabled, priority, last_sync, created_at
             FROM repositories WHERE name = ?1",
        )?;

        let repo = stmt.query_row([name], Self::from_row).optional()?;

        Ok(repo)
    }

    /// List all package indexes (the installed repository excluded)
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, url, enabled, priority, last_sync, created_at
             FROM repositories WHERE name != ?1 ORDER BY priority ASC, name",
        )?;

        let repos = stmt
            .query_map([INSTALLED_REPOSITORY], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(repos)
    }

    /// List enabled package indexes, in matching order
    pub fn list_enabled(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, url, enabled, priority, last_sync, created_at
             FROM repositories WHERE enabled = 1 AND name != ?1 ORDER BY priority ASC, name",
        )?;

        let repos = stmt
            .query_map([INSTALLED_REPOSITORY], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(repos)
    }

    /// Update repository metadata
    pub fn update(&self, conn: &Connection) -> Result<()> {
        let id = self
            .id
            .ok_or_else(|| Error::InitError("Cannot update repository without ID".to_string()))?;

        conn.execute(
            "UPDATE repositories SET name = ?1, url = ?2, enabled = ?3, priority = ?4,
             last_sync = ?5 WHERE id = ?6",
            params![
                &self.name,
                &self.url,
                self.enabled as i32,
                &self.priority,
                &self.last_sync,
                id,
            ],
        )?;

        Ok(())
    }

    /// Delete a repository by ID
    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM repositories WHERE id = ?1", [id])?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            name: row.get(1)?,
            url: row.get(2)?,
            enabled: row.get::<_, i32>(3)? != 0,
            priority: row.get(4)?,
            last_sync: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

/// One package build stored in a repository
#[derive(Debug, Clone)]
pub struct PackageEntry {
    pub id: Option<i64>,
    pub repository_id: i64,
    pub record: PackageRecord,
}

const PACKAGE_COLUMNS: &str =
    "id, repository_id, category, name, version, tag, revision, slot, digest, system, masked";

impl PackageEntry {
    pub fn new(repository_id: i64, record: PackageRecord) -> Self {
        Self {
            id: None,
            repository_id,
            record,
        }
    }

    /// Insert this package into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        let r = &self.record;
        conn.execute(
            "INSERT INTO packages
             (repository_id, category, name, version, tag, revision, slot, digest, system, masked)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &self.repository_id,
                &r.category,
                &r.name,
                &r.version,
                &r.tag,
                &r.revision,
                &r.slot,
                &r.digest,
                r.system as i32,
                r.masked as i32,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find a package of a repository by ID
    pub fn find_by_id(conn: &Connection, repository_id: i64, id: i64) -> Result<Option<Self>> {
        let sql = format!(
            "SELECT {} FROM packages WHERE id = ?1 AND repository_id = ?2",
            PACKAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;

        let pkg = stmt
            .query_row(params![id, repository_id], Self::from_row)
            .optional()?;

        Ok(pkg)
    }

    /// Package ids with the given name, in any category
    pub fn find_ids_by_name(
        conn: &Connection,
        repository_id: i64,
        name: &str,
        case_sensitive: bool,
    ) -> Result<Vec<i64>> {
        let sql = if case_sensitive {
            "SELECT id FROM packages WHERE repository_id = ?1 AND name = ?2 ORDER BY id"
        } else {
            "SELECT id FROM packages WHERE repository_id = ?1 AND LOWER(name) = LOWER(?2) ORDER BY id"
        };
        let mut stmt = conn.prepare(sql)?;

        let ids = stmt
            .query_map(params![repository_id, name], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(ids)
    }

    /// Package ids with the given name and category
    pub fn find_ids_by_name_category(
        conn: &Connection,
        repository_id: i64,
        name: &str,
        category: &str,
    ) -> Result<Vec<i64>> {
        let mut stmt = conn.prepare(
            "SELECT id FROM packages
             WHERE repository_id = ?1 AND name = ?2 AND category = ?3 ORDER BY id",
        )?;

        let ids = stmt
            .query_map(params![repository_id, name, category], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(ids)
    }

    /// Every package id of a repository
    pub fn list_ids(conn: &Connection, repository_id: i64) -> Result<Vec<i64>> {
        let mut stmt = conn.prepare("SELECT id FROM packages WHERE repository_id = ?1 ORDER BY id")?;

        let ids = stmt
            .query_map([repository_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(ids)
    }

    /// Every package of a repository, ordered by id
    pub fn find_by_repository(conn: &Connection, repository_id: i64) -> Result<Vec<Self>> {
        let sql = format!(
            "SELECT {} FROM packages WHERE repository_id = ?1 ORDER BY id",
            PACKAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;

        let packages = stmt
            .query_map([repository_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// Delete all packages for a repository (used when importing an index)
    pub fn delete_by_repository(conn: &Connection, repository_id: i64) -> Result<()> {
        conn.execute("DELETE FROM packages WHERE repository_id = ?1", [repository_id])?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            repository_id: row.get(1)?,
            record: PackageRecord {
                category: row.get(2)?,
                name: row.get(3)?,
                version: row.get(4)?,
                tag: row.get(5)?,
                revision: row.get(6)?,
                slot: row.get(7)?,
                digest: row.get(8)?,
                system: row.get::<_, i32>(9)? != 0,
                masked: row.get::<_, i32>(10)? != 0,
            },
        })
    }
}

/// A dependency string attached to a package
#[derive(Debug, Clone)]
pub struct DependencyEntry {
    pub id: Option<i64>,
    pub package_id: i64,
    pub dependency: Dependency,
}

impl DependencyEntry {
    pub fn new(package_id: i64, dependency: Dependency) -> Self {
        Self {
            id: None,
            package_id,
            dependency,
        }
    }

    /// Insert this dependency, indexing it by key
    ///
    /// Or-dependencies get a NULL key and are always scanned.
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        let key = if crate::atom::split_or_dependency(&self.dependency.atom).is_some() {
            None
        } else {
            crate::atom::dependency_key(&self.dependency.atom)
        };

        conn.execute(
            "INSERT INTO package_dependencies (package_id, dependency, dependency_key, dep_type)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                &self.package_id,
                &self.dependency.atom,
                &key,
                self.dependency.dep_type.as_str(),
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find the dependencies of a package
    pub fn find_by_package(conn: &Connection, package_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, package_id, dependency, dep_type
             FROM package_dependencies WHERE package_id = ?1 ORDER BY id",
        )?;

        let deps = stmt
            .query_map([package_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(deps)
    }

    /// Packages of a repository having a dependency that may name `key`
    ///
    /// Matches on the dependency key, on the bare `name`, or on
    /// or-dependencies (NULL key).
    pub fn find_candidates(
        conn: &Connection,
        repository_id: i64,
        key: &str,
        name: &str,
    ) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT d.id, d.package_id, d.dependency, d.dep_type
             FROM package_dependencies d
             JOIN packages p ON p.id = d.package_id
             WHERE p.repository_id = ?1
               AND (d.dependency_key = ?2 OR d.dependency_key = ?3 OR d.dependency_key IS NULL)
             ORDER BY d.package_id, d.id",
        )?;

        let deps = stmt
            .query_map(params![repository_id, key, name], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(deps)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let type_str: String = row.get(3)?;
        let dep_type = type_str.parse::<DependencyType>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?;

        Ok(Self {
            id: Some(row.get(0)?),
            package_id: row.get(1)?,
            dependency: Dependency::new(row.get::<_, String>(2)?, dep_type),
        })
    }
}

/// A conflict declared by a package, stored without the leading `!`
#[derive(Debug, Clone)]
pub struct ConflictEntry {
    pub id: Option<i64>,
    pub package_id: i64,
    pub conflict: String,
}

impl ConflictEntry {
    pub fn new(package_id: i64, conflict: String) -> Self {
        Self {
            id: None,
            package_id,
            conflict,
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        let conflict = self.conflict.trim_start_matches('!');
        let key = crate::atom::dependency_key(conflict);

        conn.execute(
            "INSERT INTO package_conflicts (package_id, conflict, conflict_key)
             VALUES (?1, ?2, ?3)",
            params![&self.package_id, conflict, &key],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn find_by_package(conn: &Connection, package_id: i64) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT conflict FROM package_conflicts WHERE package_id = ?1 ORDER BY id",
        )?;

        let conflicts = stmt
            .query_map([package_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(conflicts)
    }

    /// Packages of a repository declaring a conflict on `key`
    pub fn find_by_key(conn: &Connection, repository_id: i64, key: &str) -> Result<Vec<(i64, String)>> {
        let mut stmt = conn.prepare(
            "SELECT c.package_id, c.conflict
             FROM package_conflicts c
             JOIN packages p ON p.id = c.package_id
             WHERE p.repository_id = ?1 AND c.conflict_key = ?2
             ORDER BY c.package_id, c.id",
        )?;

        let conflicts = stmt
            .query_map(params![repository_id, key], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(conflicts)
    }
}

/// ELF library metadata rows
pub struct LibraryEntry;

impl LibraryEntry {
    pub fn insert_provided(conn: &Connection, package_id: i64, lib: &ProvidedLibrary) -> Result<()> {
        conn.execute(
            "INSERT INTO provided_libraries (package_id, soname, path, elf_class)
             VALUES (?1, ?2, ?3, ?4)",
            params![package_id, &lib.soname, &lib.path, lib.elf_class],
        )?;
        Ok(())
    }

    pub fn insert_needed(conn: &Connection, package_id: i64, lib: &NeededLibrary) -> Result<()> {
        conn.execute(
            "INSERT INTO needed_libraries (package_id, soname, elf_class, rpath)
             VALUES (?1, ?2, ?3, ?4)",
            params![package_id, &lib.soname, lib.elf_class, &lib.rpath],
        )?;
        Ok(())
    }

    pub fn find_provided(conn: &Connection, package_id: i64) -> Result<Vec<ProvidedLibrary>> {
        let mut stmt = conn.prepare(
            "SELECT soname, path, elf_class FROM provided_libraries WHERE package_id = ?1",
        )?;

        let libs = stmt
            .query_map([package_id], |row| {
                Ok(ProvidedLibrary {
                    soname: row.get(0)?,
                    path: row.get(1)?,
                    elf_class: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(libs)
    }

    pub fn find_needed(conn: &Connection, package_id: i64) -> Result<Vec<NeededLibrary>> {
        let mut stmt = conn.prepare(
            "SELECT soname, elf_class, rpath FROM needed_libraries WHERE package_id = ?1",
        )?;

        let libs = stmt
            .query_map([package_id], |row| {
                Ok(NeededLibrary {
                    soname: row.get(0)?,
                    elf_class: row.get(1)?,
                    rpath: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(libs)
    }

    /// Packages of a repository linking against `soname`
    pub fn find_needing(
        conn: &Connection,
        repository_id: i64,
        soname: &str,
        elf_class: i32,
    ) -> Result<Vec<i64>> {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT n.package_id FROM needed_libraries n
             JOIN packages p ON p.id = n.package_id
             WHERE p.repository_id = ?1 AND n.soname = ?2 AND n.elf_class = ?3",
        )?;

        let ids = stmt
            .query_map(params![repository_id, soname, elf_class], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(ids)
    }

    /// Packages of a repository providing `soname`, with the library path
    pub fn find_providers(
        conn: &Connection,
        repository_id: i64,
        soname: &str,
        elf_class: i32,
    ) -> Result<Vec<(i64, String)>> {
        let mut stmt = conn.prepare(
            "SELECT l.package_id, l.path FROM provided_libraries l
             JOIN packages p ON p.id = l.package_id
             WHERE p.repository_id = ?1 AND l.soname = ?2 AND l.elf_class = ?3",
        )?;

        let found = stmt
            .query_map(params![repository_id, soname, elf_class], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(found)
    }
}
