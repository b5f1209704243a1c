//! Dataset registry
//!
//! Maps public slugs to warehouse identifiers. The registry is built once at
//! start-up from a fixed alias table plus the view-list file and is read-only
//! afterwards.
//!
//! Slug derivation: lower-case the identifier and turn `_` and whitespace into
//! `-`, so `COMPANY_INDEX` is exposed as `company-index`. Aliases are checked
//! before derived slugs.
//!
//! ## Configuration
//!
//! - `DATAPRODUCT_VIEW_LIST_PATH`: allow-list file, one identifier per line
//!   (default: `snowflake_view_list.txt`)

use dataproduct_gateway_core::env::env_string;
use dataproduct_gateway_core::validation::validate_warehouse_identifier;
use dataproduct_gateway_core::{DatasetDescriptor, GatewayError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default location of the view-list file
const DEFAULT_VIEW_LIST_PATH: &str = "snowflake_view_list.txt";

/// Friendly names for the flagship datasets.
pub const ALIASES: &[(&str, &str)] = &[
    ("companies", "COMPANY_INDEX"),
    ("fed-reserve", "FEDERAL_RESERVE_TIMESERIES"),
    ("fbi-crime", "FBI_CRIME_TIMESERIES"),
    ("climate", "CLIMATE_WATCH_TIMESERIES"),
    (
        "labor-stats",
        "BUREAU_OF_LABOR_STATISTICS_EMPLOYMENT_TIMESERIES",
    ),
];

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub view_list_path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            view_list_path: PathBuf::from(DEFAULT_VIEW_LIST_PATH),
        }
    }
}

impl RegistryConfig {
    pub fn from_env() -> Self {
        Self {
            view_list_path: env_string("DATAPRODUCT_VIEW_LIST_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_VIEW_LIST_PATH)),
        }
    }
}

/// Derive a slug from a warehouse identifier.
pub fn transliterate(identifier: &str) -> String {
    identifier
        .trim()
        .chars()
        .map(|c| {
            if c == '_' || c.is_whitespace() {
                '-'
            } else {
                c.to_ascii_lowercase()
            }
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct DatasetRegistry {
    aliases: HashMap<String, DatasetDescriptor>,
    derived: HashMap<String, DatasetDescriptor>,
}

impl DatasetRegistry {
    /// Build a registry from an alias table and a list of backing identifiers.
    ///
    /// Alias targets are also reachable through their derived slug.
    /// Identifiers that fail validation are skipped.
    pub fn from_sources<'a, A, I>(aliases: A, identifiers: I) -> Self
    where
        A: IntoIterator<Item = (&'a str, &'a str)>,
        I: IntoIterator<Item = String>,
    {
        let mut registry = Self::default();

        for (slug, identifier) in aliases {
            if let Err(e) = validate_warehouse_identifier(identifier) {
                warn!(slug = %slug, error = %e, "Skipping alias with invalid identifier");
                continue;
            }
            let slug = transliterate(slug);
            registry
                .aliases
                .insert(slug.clone(), DatasetDescriptor::new(slug, identifier));
            registry.add_derived(identifier);
        }

        for identifier in identifiers {
            if let Err(e) = validate_warehouse_identifier(&identifier) {
                warn!(identifier = %identifier, error = %e, "Skipping invalid view-list entry");
                continue;
            }
            registry.add_derived(&identifier);
        }

        registry
    }

    fn add_derived(&mut self, identifier: &str) {
        let slug = transliterate(identifier);
        self.derived
            .entry(slug.clone())
            .or_insert_with(|| DatasetDescriptor::new(slug, identifier));
    }

    /// Load the alias table and the view-list file.
    ///
    /// A missing or unreadable file leaves only the aliases.
    pub fn load(config: &RegistryConfig) -> Self {
        let identifiers = match read_view_list(&config.view_list_path) {
            Ok(identifiers) => identifiers,
            Err(e) => {
                warn!(
                    path = %config.view_list_path.display(),
                    error = %e,
                    "View list not readable, serving aliases only"
                );
                Vec::new()
            }
        };

        let registry = Self::from_sources(ALIASES.iter().copied(), identifiers);
        info!(
            aliases = registry.aliases.len(),
            datasets = registry.derived.len(),
            "Dataset registry loaded"
        );
        registry
    }

    /// Resolve a client-supplied slug (case-insensitive).
    pub fn resolve(&self, slug: &str) -> Result<DatasetDescriptor> {
        let key = transliterate(slug);
        self.aliases
            .get(&key)
            .or_else(|| self.derived.get(&key))
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("View '{}' not found or not allowed.", slug)))
    }

    /// Every exposed descriptor, sorted by slug.
    pub fn list(&self) -> Vec<DatasetDescriptor> {
        let mut all: Vec<_> = self
            .aliases
            .values()
            .chain(self.derived.values())
            .cloned()
            .collect();
        all.sort_by(|a, b| a.slug.cmp(&b.slug));
        all
    }

    pub fn len(&self) -> usize {
        self.aliases.len() + self.derived.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty() && self.derived.is_empty()
    }
}

fn read_view_list(path: &Path) -> std::io::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.eq_ignore_ascii_case("name"))
        .map(str::to_string)
        .collect())
}
