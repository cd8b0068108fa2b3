// src/error.rs

use crate::repository::PackageMatch;
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// A group of package matches sharing the same key and slot, pulled into
/// one install transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collision {
    /// The shared `category/name`
    pub key: String,
    /// The shared slot
    pub slot: String,
    /// Colliding matches, with the matches that directly required each one
    pub matches: Vec<(PackageMatch, Vec<PackageMatch>)>,
}

impl fmt::Display for Collision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} [", self.key, self.slot)?;
        for (i, (pkg_match, _)) in self.matches.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", pkg_match)?;
        }
        write!(f, "]")
    }
}

/// Core error types for equo
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// Generic lookup failure
    #[error("Not found: {0}")]
    NotFoundError(String),

    /// Duplicate or conflicting state
    #[error("Conflict: {0}")]
    ConflictError(String),

    /// Unparseable input
    #[error("Parse error: {0}")]
    ParseError(String),

    /// A package match refers to a repository that is not configured
    #[error("Repository not available: {0}")]
    RepositoryNotFound(String),

    /// A "not found" match was handed to the resolver
    #[error("Invalid package match: {0}")]
    InvalidMatch(PackageMatch),

    /// One or more dependencies could not be matched in any repository
    #[error("Dependencies not found: {}", join(.0))]
    DependenciesNotFound(BTreeSet<String>),

    /// Two or more packages with the same key and slot were pulled in
    #[error("Dependencies collision: {}", join(.0))]
    DependenciesCollision(Vec<Collision>),

    /// System packages block the requested removal
    #[error("Dependencies not removable: {}", join(.0))]
    DependenciesNotRemovable(BTreeSet<PackageMatch>),
}

fn join<T: fmt::Display>(items: impl IntoIterator<Item = T>) -> String {
    items
        .into_iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias using equo's Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependencies_not_found_lists_every_atom() {
        let atoms: BTreeSet<String> = ["app/a", "app/b"].iter().map(|s| s.to_string()).collect();
        let err = Error::DependenciesNotFound(atoms);
        assert_eq!(err.to_string(), "Dependencies not found: app/a, app/b");
    }

    #[test]
    fn test_collision_display() {
        let collision = Collision {
            key: "app/foo".to_string(),
            slot: "0".to_string(),
            matches: vec![
                (PackageMatch::new(1, "r1"), vec![]),
                (PackageMatch::new(2, "r2"), vec![]),
            ],
        };
        assert_eq!(collision.to_string(), "app/foo:0 [1@r1, 2@r2]");
    }
}
