//! Batch source contracts + portal definitions.
//!
//! Crawlers are external: they leave one batch per run either as a JSON file
//! or as a raw collection in the store. Sources here only load those batches.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imoscout_core::Listing;
use imoscout_storage::{CollectionSelector, ConsolidatedStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "imoscout-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Portal {
    Imovirtual,
    Sapo,
}

impl Portal {
    pub fn source_id(self) -> &'static str {
        match self {
            Self::Imovirtual => "imovirtual",
            Self::Sapo => "sapo",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Imovirtual => "Imovirtual",
            Self::Sapo => "Casa Sapo",
        }
    }

    /// Sapo listings carry no numeric id; the cleaner derives `link_id` from the URL.
    pub fn identifier_field(self) -> &'static str {
        match self {
            Self::Imovirtual => "id",
            Self::Sapo => "link_id",
        }
    }

    pub fn raw_collection(self) -> String {
        format!("raw_{}", self.source_id())
    }

    pub fn consolidated_collection(self) -> String {
        format!("consolidated_{}", self.source_id())
    }

    pub fn from_source_id(source_id: &str) -> Option<Self> {
        match source_id {
            "imovirtual" => Some(Self::Imovirtual),
            "sapo" => Some(Self::Sapo),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("reading batch {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing batch {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("batch {path} is neither a listing array nor an object with `listings`")]
    UnexpectedShape { path: PathBuf },
    #[error("batch {path}: element {index} is not a JSON object")]
    NotAnObject { path: PathBuf, index: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One crawl run's output, duplicates included.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadedBatch {
    pub source_id: String,
    /// Crawl time when the batch file records one.
    pub fetched_at: Option<DateTime<Utc>>,
    pub listings: Vec<Listing>,
}

#[async_trait]
pub trait BatchSource: Send + Sync {
    fn source_id(&self) -> &str;
    fn identifier_field(&self) -> &str;

    async fn load_batch(&self) -> Result<LoadedBatch, AdapterError>;
}

/// Envelope some crawlers write around the listing array.
#[derive(Debug, Deserialize)]
struct BatchEnvelope {
    #[serde(default)]
    fetched_at: Option<DateTime<Utc>>,
    listings: Vec<JsonValue>,
}

/// Reads a crawl batch: either a bare JSON array of listing objects or an
/// envelope `{ "fetched_at": ..., "listings": [...] }`.
pub fn read_batch_file(
    path: impl AsRef<Path>,
) -> Result<(Option<DateTime<Utc>>, Vec<Listing>), AdapterError> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).map_err(|source| AdapterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: JsonValue = serde_json::from_str(&data).map_err(|source| AdapterError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let (fetched_at, items) = match value {
        JsonValue::Array(items) => (None, items),
        value @ JsonValue::Object(_) => {
            let envelope: BatchEnvelope =
                serde_json::from_value(value).map_err(|_| AdapterError::UnexpectedShape {
                    path: path.to_path_buf(),
                })?;
            (envelope.fetched_at, envelope.listings)
        }
        _ => {
            return Err(AdapterError::UnexpectedShape {
                path: path.to_path_buf(),
            })
        }
    };

    let listings = items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            Listing::from_json(item).map_err(|_| AdapterError::NotAnObject {
                path: path.to_path_buf(),
                index,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((fetched_at, listings))
}

/// Batch written by a crawler to a JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileBatchSource {
    source_id: String,
    identifier_field: String,
    path: PathBuf,
}

impl JsonFileBatchSource {
    pub fn new(
        source_id: impl Into<String>,
        identifier_field: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            identifier_field: identifier_field.into(),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BatchSource for JsonFileBatchSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn identifier_field(&self) -> &str {
        &self.identifier_field
    }

    async fn load_batch(&self) -> Result<LoadedBatch, AdapterError> {
        let (fetched_at, listings) = read_batch_file(&self.path)?;
        Ok(LoadedBatch {
            source_id: self.source_id.clone(),
            fetched_at,
            listings,
        })
    }
}

/// Batch the crawler appended to a raw collection in the store.
pub struct CollectionBatchSource {
    source_id: String,
    identifier_field: String,
    collection: String,
    store: Arc<dyn ConsolidatedStore>,
}

impl CollectionBatchSource {
    pub fn new(
        source_id: impl Into<String>,
        identifier_field: impl Into<String>,
        collection: impl Into<String>,
        store: Arc<dyn ConsolidatedStore>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            identifier_field: identifier_field.into(),
            collection: collection.into(),
            store,
        }
    }
}

#[async_trait]
impl BatchSource for CollectionBatchSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn identifier_field(&self) -> &str {
        &self.identifier_field
    }

    async fn load_batch(&self) -> Result<LoadedBatch, AdapterError> {
        let listings = self
            .store
            .read(&CollectionSelector::all(self.collection.clone()))
            .await?;
        Ok(LoadedBatch {
            source_id: self.source_id.clone(),
            fetched_at: None,
            listings,
        })
    }
}

/// Where a source's batch comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchLocation {
    File(PathBuf),
    Collection(String),
}

pub fn batch_source_for(
    source_id: &str,
    identifier_field: &str,
    location: BatchLocation,
    store: Arc<dyn ConsolidatedStore>,
) -> Box<dyn BatchSource> {
    match location {
        BatchLocation::File(path) => {
            Box::new(JsonFileBatchSource::new(source_id, identifier_field, path))
        }
        BatchLocation::Collection(collection) => Box::new(CollectionBatchSource::new(
            source_id,
            identifier_field,
            collection,
            store,
        )),
    }
}
