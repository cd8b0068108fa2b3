// src/db/schema.rs

//! Database schema definitions and migrations for equo
//!
//! This module defines the SQLite schema for repositories and package
//! metadata and provides a migration system to evolve the schema over time.

use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

/// Set the schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    info!("Current schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        info!("Schema is up to date");
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    info!(
        "Schema migration complete. Now at version {}",
        SCHEMA_VERSION
    );
    Ok(())
}

/// Apply a specific migration version
fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        2 => migrate_v2(conn),
        3 => migrate_v3(conn),
        _ => Err(Error::InitError(format!(
            "Unknown migration version: {}",
            version
        ))),
    }
}

/// Initial schema - Version 1
///
/// - repositories: configured package indexes (plus the installed one)
/// - packages: one row per package build in a repository
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        CREATE TABLE repositories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            url TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            priority INTEGER NOT NULL DEFAULT 0,
            last_sync TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX idx_repositories_priority ON repositories(priority);

        CREATE TABLE packages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            repository_id INTEGER NOT NULL,
            category TEXT NOT NULL,
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            tag TEXT NOT NULL DEFAULT '',
            revision INTEGER NOT NULL DEFAULT 0,
            slot TEXT NOT NULL DEFAULT '0',
            digest TEXT NOT NULL DEFAULT '0',
            system INTEGER NOT NULL DEFAULT 0,
            masked INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (repository_id) REFERENCES repositories(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_packages_repository ON packages(repository_id);
        CREATE INDEX idx_packages_name ON packages(name);
        CREATE INDEX idx_packages_key ON packages(category, name);
        ",
    )?;

    info!("Schema version 1 created successfully");
    Ok(())
}

/// Version 2: dependency and conflict strings
fn migrate_v2(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 2");

    conn.execute_batch(
        "
        CREATE TABLE package_dependencies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id INTEGER NOT NULL,
            dependency TEXT NOT NULL,
            dependency_key TEXT,
            dep_type TEXT NOT NULL CHECK(dep_type IN ('runtime', 'post', 'manual', 'build')),
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_package_dependencies_package ON package_dependencies(package_id);
        CREATE INDEX idx_package_dependencies_key ON package_dependencies(dependency_key);

        CREATE TABLE package_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id INTEGER NOT NULL,
            conflict TEXT NOT NULL,
            conflict_key TEXT,
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_package_conflicts_package ON package_conflicts(package_id);
        CREATE INDEX idx_package_conflicts_key ON package_conflicts(conflict_key);
        ",
    )?;

    info!("Schema version 2 applied successfully");
    Ok(())
}

/// Version 3: ELF library metadata
fn migrate_v3(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 3");

    conn.execute_batch(
        "
        CREATE TABLE provided_libraries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id INTEGER NOT NULL,
            soname TEXT NOT NULL,
            path TEXT NOT NULL,
            elf_class INTEGER NOT NULL,
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_provided_libraries_soname ON provided_libraries(soname, elf_class);
        CREATE INDEX idx_provided_libraries_package ON provided_libraries(package_id);

        CREATE TABLE needed_libraries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id INTEGER NOT NULL,
            soname TEXT NOT NULL,
            elf_class INTEGER NOT NULL,
            rpath TEXT NOT NULL DEFAULT '',
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_needed_libraries_soname ON needed_libraries(soname, elf_class);
        CREATE INDEX idx_needed_libraries_package ON needed_libraries(package_id);
        ",
    )?;

    info!("Schema version 3 applied successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        (temp_file, conn)
    }

    #[test]
    fn test_schema_version_tracking() {
        let (_temp, conn) = create_test_db();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, 0);

        set_schema_version(&conn, 1).unwrap();
        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_migrate_creates_all_tables() {
        let (_temp, conn) = create_test_db();

        migrate(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "repositories",
            "packages",
            "package_dependencies",
            "package_conflicts",
            "provided_libraries",
            "needed_libraries",
            "schema_version",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {}", table);
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let (_temp, conn) = create_test_db();

        migrate(&conn).unwrap();
        let version1 = get_schema_version(&conn).unwrap();

        migrate(&conn).unwrap();
        let version2 = get_schema_version(&conn).unwrap();

        assert_eq!(version1, version2);
        assert_eq!(version1, SCHEMA_VERSION);
    }

    #[test]
    fn test_repository_name_is_unique() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        conn.execute(
            "INSERT INTO repositories (name, url) VALUES (?1, ?2)",
            ["main", "file:///main"],
        )
        .unwrap();

        let result = conn.execute(
            "INSERT INTO repositories (name, url) VALUES (?1, ?2)",
            ["main", "file:///other"],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_dependency_type_constraint() {
        let (_temp, conn) = create_test_db();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        migrate(&conn).unwrap();

        conn.execute(
            "INSERT INTO repositories (name, url) VALUES ('main', 'file:///main')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO packages (repository_id, category, name, version) VALUES (1, 'app', 'foo', '1.0')",
            [],
        )
        .unwrap();

        let result = conn.execute(
            "INSERT INTO package_dependencies (package_id, dependency, dep_type)
             VALUES (1, 'app/bar', 'optional')",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_foreign_key_constraints() {
        let (_temp, conn) = create_test_db();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        migrate(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO packages (repository_id, category, name, version)
             VALUES (999, 'app', 'foo', '1.0')",
            [],
        );
        assert!(result.is_err());
    }
}
