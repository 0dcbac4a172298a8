//! Static asset catalogs, loaded once at startup.
//!
//! Each collection ships as a JSON file listing its assets (`name`, `image`,
//! `mediaType`, free-form `traits`). The catalog is a read-only collaborator:
//! the reservation ledger owns lifecycle state, the catalog only answers
//! "what does this named asset look like" when the coordinator needs the full
//! descriptor for the issuance call.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::SeedItem;
use crate::types::{AssetName, Collection};

/// Errors raised while loading catalog files.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The catalog file could not be read.
    #[error("failed to read catalog file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The catalog file is not a valid JSON asset list.
    #[error("failed to parse catalog file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Two entries in one collection share a name.
    #[error("duplicate asset name {name} in collection {collection}")]
    DuplicateName {
        collection: Collection,
        name: AssetName,
    },
}

/// Full description of one asset, as the issuance action expects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub name: AssetName,
    /// Content reference, typically an `ipfs://` URI.
    pub image: String,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// Free-form trait map passed through to the issuance metadata.
    ///
    /// Some source files use `attributes` instead of `traits`; both are
    /// accepted on input.
    #[serde(default, alias = "attributes")]
    pub traits: serde_json::Map<String, serde_json::Value>,
}

impl AssetDescriptor {
    /// Returns the content reference with any `ipfs://` prefix stripped,
    /// suitable for storing as a bare CID.
    pub fn content_ref(&self) -> &str {
        self.image.strip_prefix("ipfs://").unwrap_or(&self.image)
    }
}

/// Immutable mapping from (collection, asset name) to descriptor.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    collections: HashMap<Collection, HashMap<AssetName, AssetDescriptor>>,
}

impl Catalog {
    /// Loads one collection per (collection, path) pair.
    pub fn load(sources: &[(Collection, PathBuf)]) -> Result<Self, CatalogError> {
        let mut catalog = Catalog::default();
        for (collection, path) in sources {
            catalog.load_collection(collection.clone(), path)?;
        }
        Ok(catalog)
    }

    fn load_collection(
        &mut self,
        collection: Collection,
        path: &Path,
    ) -> Result<(), CatalogError> {
        let raw = fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let descriptors: Vec<AssetDescriptor> =
            serde_json::from_str(&raw).map_err(|source| CatalogError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let mut by_name = HashMap::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let name = descriptor.name.clone();
            if by_name.insert(name.clone(), descriptor).is_some() {
                return Err(CatalogError::DuplicateName { collection, name });
            }
        }
        self.collections.insert(collection, by_name);
        Ok(())
    }

    /// Looks up the full descriptor for a named asset.
    pub fn resolve(&self, collection: &Collection, name: &AssetName) -> Option<&AssetDescriptor> {
        self.collections.get(collection)?.get(name)
    }

    /// Returns the seed rows for one collection, for the ledger's idempotent
    /// catalog seeding at startup.
    pub fn seed_items(&self, collection: &Collection) -> Vec<SeedItem> {
        let Some(by_name) = self.collections.get(collection) else {
            return Vec::new();
        };
        let mut items: Vec<SeedItem> = by_name
            .values()
            .map(|d| SeedItem {
                name: d.name.clone(),
                image: d.content_ref().to_string(),
                media_type: d.media_type.clone(),
            })
            .collect();
        // Deterministic seed order; selection randomness lives in the ledger.
        items.sort_by(|a, b| a.name.cmp(&b.name));
        items
    }

    /// Number of assets loaded for a collection.
    pub fn len(&self, collection: &Collection) -> usize {
        self.collections.get(collection).map_or(0, HashMap::len)
    }
}
