// src/repository/sqlite.rs

//! SQLite-backed package repository
//!
//! A read view over one named repository stored in the equo database.

use super::{
    Dependency, DependencyType, NeededLibrary, PackageId, PackageRecord, PackageRepository,
    ProvidedLibrary, dependency_may_match,
};
use crate::db::models::{ConflictEntry, DependencyEntry, LibraryEntry, PackageEntry, Repository};
use crate::error::{Error, Result};
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use tracing::debug;

/// One repository of an equo database
pub struct SqliteRepository {
    conn: Connection,
    name: String,
    repository_id: i64,
}

impl SqliteRepository {
    /// Open the database at `db_path` and bind to repository `name`
    pub fn open(db_path: &str, name: &str) -> Result<Self> {
        let conn = crate::db::open(db_path)?;
        Self::new(conn, name)
    }

    /// Bind an open connection to repository `name`
    pub fn new(conn: Connection, name: &str) -> Result<Self> {
        let repo = Repository::find_by_name(&conn, name)?
            .ok_or_else(|| Error::RepositoryNotFound(name.to_string()))?;
        let repository_id = repo
            .id
            .ok_or_else(|| Error::RepositoryNotFound(name.to_string()))?;

        debug!("Opened repository {} (id {})", name, repository_id);
        Ok(Self {
            conn,
            name: name.to_string(),
            repository_id,
        })
    }

    pub fn repository_id(&self) -> i64 {
        self.repository_id
    }
}

impl PackageRepository for SqliteRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn checksum(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        for entry in PackageEntry::find_by_repository(&self.conn, self.repository_id)? {
            let r = &entry.record;
            let row = format!(
                "{}|{}/{}-{}#{}~{}:{}|{}|{}{}",
                entry.id.unwrap_or_default(),
                r.category,
                r.name,
                r.version,
                r.tag,
                r.revision,
                r.slot,
                r.digest,
                r.system as i32,
                r.masked as i32
            );
            hasher.update(row.as_bytes());
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn list_package_ids(&self) -> Result<Vec<PackageId>> {
        PackageEntry::list_ids(&self.conn, self.repository_id)
    }

    fn search_name(&self, name: &str, case_sensitive: bool) -> Result<Vec<PackageId>> {
        PackageEntry::find_ids_by_name(&self.conn, self.repository_id, name, case_sensitive)
    }

    fn search_name_category(&self, name: &str, category: &str) -> Result<Vec<PackageId>> {
        PackageEntry::find_ids_by_name_category(&self.conn, self.repository_id, name, category)
    }

    fn retrieve_record(&self, package_id: PackageId) -> Result<Option<PackageRecord>> {
        Ok(PackageEntry::find_by_id(&self.conn, self.repository_id, package_id)?.map(|e| e.record))
    }

    fn retrieve_dependency_entries(&self, package_id: PackageId) -> Result<Vec<Dependency>> {
        Ok(DependencyEntry::find_by_package(&self.conn, package_id)?
            .into_iter()
            .map(|e| e.dependency)
            .collect())
    }

    fn retrieve_conflicts(&self, package_id: PackageId) -> Result<BTreeSet<String>> {
        Ok(ConflictEntry::find_by_package(&self.conn, package_id)?
            .into_iter()
            .collect())
    }

    fn retrieve_provided_libraries(&self, package_id: PackageId) -> Result<BTreeSet<ProvidedLibrary>> {
        Ok(LibraryEntry::find_provided(&self.conn, package_id)?
            .into_iter()
            .collect())
    }

    fn retrieve_needed_libraries(&self, package_id: PackageId) -> Result<BTreeSet<NeededLibrary>> {
        Ok(LibraryEntry::find_needed(&self.conn, package_id)?
            .into_iter()
            .collect())
    }

    fn search_needed(&self, soname: &str, elf_class: i32) -> Result<BTreeSet<PackageId>> {
        Ok(LibraryEntry::find_needing(&self.conn, self.repository_id, soname, elf_class)?
            .into_iter()
            .collect())
    }

    fn resolve_needed(&self, soname: &str, elf_class: i32) -> Result<BTreeSet<(PackageId, String)>> {
        Ok(LibraryEntry::find_providers(&self.conn, self.repository_id, soname, elf_class)?
            .into_iter()
            .collect())
    }

    fn search_conflict(&self, key: &str) -> Result<BTreeSet<(PackageId, String)>> {
        Ok(ConflictEntry::find_by_key(&self.conn, self.repository_id, key)?
            .into_iter()
            .collect())
    }

    /// Narrows the scan with the `dependency_key` index.
    fn retrieve_reverse_dependencies(
        &self,
        package_id: PackageId,
        exclude: &[DependencyType],
    ) -> Result<BTreeSet<(PackageId, String)>> {
        let Some(record) = self.retrieve_record(package_id)? else {
            return Ok(BTreeSet::new());
        };
        let key = record.key();
        let filter = super::MatchFilter::default();

        let mut reverse = BTreeSet::new();
        for entry in DependencyEntry::find_candidates(&self.conn, self.repository_id, &key, &record.name)? {
            if entry.package_id == package_id || exclude.contains(&entry.dependency.dep_type) {
                continue;
            }
            if !dependency_may_match(&entry.dependency.atom, &key, &record.name) {
                continue;
            }
            if self.atom_match(&entry.dependency.atom, &filter)? == Some(package_id) {
                reverse.insert((entry.package_id, entry.dependency.atom));
            }
        }
        Ok(reverse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::repository::{
        INSTALLED_REPOSITORY, InMemoryRepository, MatchFilter, PackageMetadata, RepositoryIndex,
        add_repository, import_index,
    };
    use tempfile::NamedTempFile;

    fn sample_index() -> RepositoryIndex {
        RepositoryIndex {
            name: "main".to_string(),
            packages: vec![
                PackageMetadata::new("app", "foo", "1.0")
                    .depends(">=app/bar-1.0")
                    .post_depends("app/baz")
                    .conflicts("app/old"),
                PackageMetadata::new("app", "bar", "1.0")
                    .provides_library("libbar.so.1", "/usr/lib/libbar.so.1", 2),
                PackageMetadata::new("app", "bar", "1.1").slot("1"),
                PackageMetadata::new("app", "baz", "3.0").depends("app/qux;app/bar?"),
                PackageMetadata::new("app", "user", "1.0").needs_library("libbar.so.1", 2, ""),
            ],
        }
    }

    fn setup() -> (NamedTempFile, SqliteRepository) {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();
        db::init(db_path).unwrap();
        let mut conn = db::open(db_path).unwrap();
        add_repository(&conn, "main".to_string(), "file:///main".to_string(), true, 0).unwrap();
        import_index(&mut conn, "main", &sample_index()).unwrap();
        let repo = SqliteRepository::new(conn, "main").unwrap();
        (temp_file, repo)
    }

    #[test]
    fn test_unknown_repository() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();
        db::init(db_path).unwrap();

        assert!(SqliteRepository::open(db_path, INSTALLED_REPOSITORY).is_ok());
        assert!(matches!(
            SqliteRepository::open(db_path, "nope"),
            Err(Error::RepositoryNotFound(_))
        ));
    }

    #[test]
    fn test_matches_agree_with_memory_backend() {
        let (_temp, sqlite) = setup();
        let memory = InMemoryRepository::from_index("main", &sample_index());

        // both backends number packages from 1 in index order
        for atom in ["app/foo", "app/bar", "app/bar:1", ">app/bar-1.0", "bar", "app/qux;app/bar?", "app/none"] {
            assert_eq!(
                sqlite.atom_match(atom, &MatchFilter::default()).unwrap(),
                memory.atom_match(atom, &MatchFilter::default()).unwrap(),
                "atom {}",
                atom
            );
        }
    }

    #[test]
    fn test_metadata_round_trip_through_tables() {
        let (_temp, repo) = setup();
        let foo = repo.atom_match("app/foo", &MatchFilter::default()).unwrap().unwrap();

        let runtime = repo.retrieve_dependencies(foo, &[DependencyType::Post]).unwrap();
        assert_eq!(runtime, BTreeSet::from([">=app/bar-1.0".to_string()]));
        assert_eq!(repo.retrieve_conflicts(foo).unwrap(), BTreeSet::from(["app/old".to_string()]));
        assert_eq!(repo.search_conflict("app/old").unwrap().len(), 1);
        assert_eq!(repo.retrieve_key_slot(foo).unwrap(), Some(("app/foo".to_string(), "0".to_string())));
    }

    #[test]
    fn test_reverse_dependencies_include_or_dependencies() {
        let (_temp, repo) = setup();
        let old_bar = repo.atom_match("app/bar:0", &MatchFilter::default()).unwrap().unwrap();
        let new_bar = repo.atom_match("app/bar:1", &MatchFilter::default()).unwrap().unwrap();

        let revdeps: Vec<String> = repo
            .retrieve_reverse_dependencies(new_bar, &[])
            .unwrap()
            .into_iter()
            .map(|(_, dep)| dep)
            .collect();
        assert_eq!(
            revdeps,
            vec![">=app/bar-1.0".to_string(), "app/qux;app/bar?".to_string()]
        );

        // the 1.1 build wins every plain and ranged atom
        assert!(repo.retrieve_reverse_dependencies(old_bar, &[]).unwrap().is_empty());
        let post_only = repo
            .retrieve_reverse_dependencies(new_bar, &[DependencyType::Runtime])
            .unwrap();
        assert!(post_only.is_empty());
    }

    #[test]
    fn test_library_queries() {
        let (_temp, repo) = setup();
        let user = repo.atom_match("app/user", &MatchFilter::default()).unwrap().unwrap();
        assert_eq!(repo.search_needed("libbar.so.1", 2).unwrap(), BTreeSet::from([user]));
        assert_eq!(repo.resolve_needed("libbar.so.1", 2).unwrap().len(), 1);
    }

    #[test]
    fn test_checksum_changes_on_import() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();
        db::init(db_path).unwrap();
        let mut conn = db::open(db_path).unwrap();
        add_repository(&conn, "main".to_string(), "file:///main".to_string(), true, 0).unwrap();

        let before = SqliteRepository::open(db_path, "main").unwrap().checksum().unwrap();
        import_index(&mut conn, "main", &sample_index()).unwrap();
        let after = SqliteRepository::open(db_path, "main").unwrap().checksum().unwrap();
        assert_ne!(before, after);
    }
}
