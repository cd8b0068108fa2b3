// src/config.rs

//! Resolver configuration
//!
//! Feature switches of the dependency resolver. Defaults enable everything;
//! each switch can be turned off through an `EQUO_DISABLE_*` environment
//! variable or a JSON configuration file.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Linker search paths used when the configuration does not set any
pub const DEFAULT_LDPATHS: &[&str] = &["/lib", "/lib64", "/usr/lib", "/usr/lib64"];

/// Resolver feature switches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Repository packages replace installed packages carrying the
    /// externally-built revision, even when older
    pub ignore_spm_downgrades: bool,
    /// Use ELF `NEEDED` metadata for library breakage and removal closures
    pub elf_needed_scanning: bool,
    /// Pull in conflicts declared by installed packages against new ones
    pub auto_conflicts: bool,
    /// Move post-dependencies right after their trigger when possible
    pub asap_scheduling: bool,
    /// Restrict slot-less dependencies to the slot already installed
    pub slot_intersection: bool,
    /// Rewrite dependencies to the user's requested matches
    pub rewrite_selected_matches: bool,
    /// Atoms whose installed matches are protected like system packages
    pub system_mask: Vec<String>,
    /// Directories where the dynamic linker finds libraries
    pub ldpaths: BTreeSet<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            ignore_spm_downgrades: true,
            elf_needed_scanning: true,
            auto_conflicts: true,
            asap_scheduling: true,
            slot_intersection: true,
            rewrite_selected_matches: true,
            system_mask: Vec::new(),
            ldpaths: DEFAULT_LDPATHS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl ResolverConfig {
    /// Defaults, minus the switches disabled in the environment
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| env::var(name).ok())
    }

    /// Read a JSON configuration file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading resolver configuration from {}", path.display());
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Apply `EQUO_DISABLE_*` switches read through `lookup`
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let disabled = |name: &str| lookup(name).is_some_and(|v| is_truthy(&v));

        if disabled("EQUO_DISABLE_ELF_NEEDED_SCANNING") {
            self.elf_needed_scanning = false;
        }
        if disabled("EQUO_DISABLE_AUTOCONFLICT") {
            self.auto_conflicts = false;
        }
        if disabled("EQUO_DISABLE_ASAP_SCHEDULING") {
            self.asap_scheduling = false;
        }
        if disabled("EQUO_DISABLE_SLOT_INTERSECTION") {
            self.slot_intersection = false;
        }
        if disabled("EQUO_DISABLE_REWRITE_SELECTED_MATCHES") {
            self.rewrite_selected_matches = false;
        }
        self
    }
}

/// Any value except an empty string, `0`, `false` or `off`
fn is_truthy(value: &str) -> bool {
    let lower = value.trim().to_lowercase();
    !(lower.is_empty() || lower == "0" || lower == "false" || lower == "off")
}
