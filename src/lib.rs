// src/lib.rs

//! Equo package manager client
//!
//! Dependency resolution core of a binary package manager: atom matching
//! across prioritized repositories, dependency graphs and ordered
//! install/remove queues.
//!
//! # Architecture
//!
//! - Database-first: repositories and installed packages live in SQLite
//! - Repositories: anything implementing [`repository::PackageRepository`]
//! - Resolver: stateless per call, sharing only a fingerprinted match cache
//! - Queues: level 0 removes conflicts, levels 1..N install dependencies first

pub mod atom;
pub mod config;
pub mod db;
mod error;
pub mod repository;
pub mod resolver;
pub mod version;

pub use error::{Collision, Error, Result};
