//! Consolidated listing stores + immutable raw batch archive.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imoscout_core::{Listing, ListingId, AVAILABILITY_FIELD};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "imoscout-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid collection name `{0}`")]
    InvalidCollection(String),
    #[error("i/o on collection {collection}: {source}")]
    Io {
        collection: String,
        #[source]
        source: std::io::Error,
    },
    #[error("collection {collection} is malformed: {reason}")]
    Malformed { collection: String, reason: String },
    #[error("serializing collection {collection}: {source}")]
    Serialize {
        collection: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Which records `ConsolidatedStore::read` returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSelector {
    pub collection: String,
    /// Only records whose `is_available` equals this value.
    pub availability: Option<bool>,
    /// Field projection; the identifier field is always kept.
    pub fields: Option<Vec<String>>,
    pub id_field: String,
}

impl CollectionSelector {
    pub fn all(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            availability: None,
            fields: None,
            id_field: imoscout_core::DEFAULT_ID_FIELD.to_string(),
        }
    }

    pub fn available(mut self, availability: bool) -> Self {
        self.availability = Some(availability);
        self
    }

    pub fn project(mut self, fields: Vec<String>, id_field: impl Into<String>) -> Self {
        self.fields = Some(fields);
        self.id_field = id_field.into();
        self
    }

    fn apply(&self, listings: &[Listing]) -> Vec<Listing> {
        listings
            .iter()
            .filter(|listing| {
                self.availability
                    .map_or(true, |wanted| listing.is_available() == wanted)
            })
            .map(|listing| match &self.fields {
                Some(fields) => listing.project(fields, &self.id_field),
                None => listing.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOutcome {
    pub matched: usize,
    pub modified: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedInsert {
    pub id: Option<ListingId>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertOutcome {
    pub inserted: usize,
    pub rejected: Vec<RejectedInsert>,
}

/// Persistence collaborator for reconciliation.
///
/// Implementations enforce uniqueness of the identifier field on insert and
/// never store a duplicate. Reconcile-and-write cycles against one collection
/// must be serialized by the caller.
#[async_trait]
pub trait ConsolidatedStore: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn read(&self, selector: &CollectionSelector) -> Result<Vec<Listing>, StoreError>;

    async fn set_availability(
        &self,
        collection: &str,
        id_field: &str,
        ids: &[ListingId],
        available: bool,
    ) -> Result<UpdateOutcome, StoreError>;

    async fn insert(
        &self,
        collection: &str,
        id_field: &str,
        records: Vec<Listing>,
    ) -> Result<InsertOutcome, StoreError>;

    async fn mark_unavailable(
        &self,
        collection: &str,
        id_field: &str,
        ids: &[ListingId],
    ) -> Result<UpdateOutcome, StoreError> {
        self.set_availability(collection, id_field, ids, false).await
    }

    async fn mark_available(
        &self,
        collection: &str,
        id_field: &str,
        ids: &[ListingId],
    ) -> Result<UpdateOutcome, StoreError> {
        self.set_availability(collection, id_field, ids, true).await
    }
}

fn validate_collection_name(collection: &str) -> Result<(), StoreError> {
    let valid = !collection.is_empty()
        && collection
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidCollection(collection.to_string()))
    }
}

fn apply_availability(
    listings: &mut [Listing],
    id_field: &str,
    ids: &[ListingId],
    available: bool,
) -> UpdateOutcome {
    let targets: HashSet<&ListingId> = ids.iter().collect();
    let wanted = JsonValue::Bool(available);
    let mut outcome = UpdateOutcome::default();
    for listing in listings.iter_mut() {
        let Some(id) = listing.identifier(id_field) else {
            continue;
        };
        if !targets.contains(&id) {
            continue;
        }
        outcome.matched += 1;
        if listing.get(AVAILABILITY_FIELD) != Some(&wanted) {
            listing.set_available(available);
            outcome.modified += 1;
        }
    }
    outcome
}

/// Unique index on the identifier field. A missing identifier is a key of its
/// own: one such record is stored, any further one is a duplicate.
fn insert_unique(listings: &mut Vec<Listing>, id_field: &str, records: Vec<Listing>) -> InsertOutcome {
    let mut known: HashSet<Option<ListingId>> = listings
        .iter()
        .map(|listing| listing.identifier(id_field))
        .collect();
    let mut outcome = InsertOutcome::default();
    for record in records {
        let id = record.identifier(id_field);
        if known.contains(&id) {
            let reason = match &id {
                Some(id) => format!("duplicate key {id_field}={id}"),
                None => format!("duplicate key: record without `{id_field}` already stored"),
            };
            outcome.rejected.push(RejectedInsert { id, reason });
            continue;
        }
        known.insert(id);
        listings.push(record);
        outcome.inserted += 1;
    }
    outcome
}

/// Process-local store, mainly for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<Listing>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a collection verbatim, duplicates included (raw crawl output).
    pub fn with_collection(mut self, collection: impl Into<String>, records: Vec<Listing>) -> Self {
        self.collections.get_mut().insert(collection.into(), records);
        self
    }

    pub async fn collection(&self, collection: &str) -> Vec<Listing> {
        self.collections
            .lock()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConsolidatedStore for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn read(&self, selector: &CollectionSelector) -> Result<Vec<Listing>, StoreError> {
        validate_collection_name(&selector.collection)?;
        let collections = self.collections.lock().await;
        Ok(collections
            .get(&selector.collection)
            .map(|listings| selector.apply(listings))
            .unwrap_or_default())
    }

    async fn set_availability(
        &self,
        collection: &str,
        id_field: &str,
        ids: &[ListingId],
        available: bool,
    ) -> Result<UpdateOutcome, StoreError> {
        validate_collection_name(collection)?;
        let mut collections = self.collections.lock().await;
        Ok(collections
            .get_mut(collection)
            .map(|listings| apply_availability(listings, id_field, ids, available))
            .unwrap_or_default())
    }

    async fn insert(
        &self,
        collection: &str,
        id_field: &str,
        records: Vec<Listing>,
    ) -> Result<InsertOutcome, StoreError> {
        validate_collection_name(collection)?;
        let mut collections = self.collections.lock().await;
        let listings = collections.entry(collection.to_string()).or_default();
        Ok(insert_unique(listings, id_field, records))
    }
}

/// One pretty-printed JSON array per collection under `root`.
///
/// Every write replaces the file through a temp file + atomic rename, so a
/// reader never observes a half-written collection.
#[derive(Debug)]
pub struct JsonFileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn collection_path(&self, collection: &str) -> PathBuf {
        self.root.join(format!("{collection}.json"))
    }

    async fn load(&self, collection: &str) -> Result<Vec<Listing>, StoreError> {
        validate_collection_name(collection)?;
        let path = self.collection_path(collection);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    collection: collection.to_string(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes).map_err(|err| StoreError::Malformed {
            collection: collection.to_string(),
            reason: err.to_string(),
        })
    }

    async fn save(&self, collection: &str, listings: &[Listing]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(listings).map_err(|source| StoreError::Serialize {
            collection: collection.to_string(),
            source,
        })?;
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StoreError::Io {
                collection: collection.to_string(),
                source,
            })?;
        write_atomically(&self.collection_path(collection), &bytes)
            .await
            .map_err(|source| StoreError::Io {
                collection: collection.to_string(),
                source,
            })?;
        debug!(collection, records = listings.len(), "collection written");
        Ok(())
    }
}

#[async_trait]
impl ConsolidatedStore for JsonFileStore {
    fn kind(&self) -> &'static str {
        "json-file"
    }

    async fn read(&self, selector: &CollectionSelector) -> Result<Vec<Listing>, StoreError> {
        let listings = self.load(&selector.collection).await?;
        Ok(selector.apply(&listings))
    }

    async fn set_availability(
        &self,
        collection: &str,
        id_field: &str,
        ids: &[ListingId],
        available: bool,
    ) -> Result<UpdateOutcome, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut listings = self.load(collection).await?;
        let outcome = apply_availability(&mut listings, id_field, ids, available);
        if outcome.modified > 0 {
            self.save(collection, &listings).await?;
        }
        Ok(outcome)
    }

    async fn insert(
        &self,
        collection: &str,
        id_field: &str,
        records: Vec<Listing>,
    ) -> Result<InsertOutcome, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut listings = self.load(collection).await?;
        let outcome = insert_unique(&mut listings, id_field, records);
        if outcome.inserted > 0 {
            self.save(collection, &listings).await?;
        }
        Ok(outcome)
    }
}

/// Writes `bytes` next to `target` and renames over it.
async fn write_atomically(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await
    }
    .await;
    drop(file);

    match written {
        Ok(()) => match fs::rename(&temp_path, target).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err)
            }
        },
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedBatch {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub listing_count: usize,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw crawl batches, one immutable file per content hash.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn batch_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(source_id)
            .join(format!("{content_hash}.json"))
    }

    /// Archives a raw batch exactly as received, before any deduplication.
    pub async fn archive_batch(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        batch: &[Listing],
    ) -> anyhow::Result<ArchivedBatch> {
        let bytes = serde_json::to_vec_pretty(batch)
            .with_context(|| format!("serializing raw batch for {source_id}"))?;
        let content_hash = Self::sha256_hex(&bytes);
        let relative_path = self.batch_relative_path(fetched_at, source_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let mut archived = ArchivedBatch {
            content_hash,
            relative_path,
            absolute_path,
            listing_count: batch.len(),
            byte_size: bytes.len(),
            deduplicated: true,
        };

        if let Some(parent) = archived.absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating archive directory {}", parent.display()))?;
        }

        if fs::try_exists(&archived.absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", archived.absolute_path.display()))?
        {
            return Ok(archived);
        }

        write_atomically(&archived.absolute_path, &bytes)
            .await
            .with_context(|| format!("writing raw batch {}", archived.absolute_path.display()))?;
        archived.deduplicated = false;
        debug!(
            source_id,
            listings = archived.listing_count,
            path = %archived.relative_path.display(),
            "raw batch archived"
        );
        Ok(archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imoscout_core::ReconcileEngine;
    use tempfile::tempdir;

    fn listing(id: i64, available: bool) -> Listing {
        Listing::new()
            .with_field("id", id)
            .with_field("title", format!("T{id} apartment"))
            .with_field(AVAILABILITY_FIELD, available)
    }

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_batches_are_archived_once() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let batch = vec![listing(1, true), listing(1, true)];

        let first = store
            .archive_batch(fetched_at, "imovirtual", &batch)
            .await
            .expect("first archive");
        let second = store
            .archive_batch(fetched_at, "imovirtual", &batch)
            .await
            .expect("second archive");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.listing_count, 2);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("20260224_120000/imovirtual"));
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn memory_store_rejects_duplicate_keys_including_a_second_anonymous_record() {
        let store = MemoryStore::new().with_collection("consolidated", vec![listing(1, true)]);

        let outcome = store
            .insert(
                "consolidated",
                "id",
                vec![
                    listing(2, true),
                    listing(1, true),
                    listing(2, true),
                    Listing::new().with_field("title", "no id"),
                    Listing::new().with_field("title", "no id either"),
                ],
            )
            .await
            .expect("insert");

        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.rejected.len(), 3);
        assert_eq!(outcome.rejected[0].id, Some(ListingId::Int(1)));
        assert_eq!(outcome.rejected[2].id, None);
        assert_eq!(store.collection("consolidated").await.len(), 3);

        let again = store
            .insert("consolidated", "id", vec![Listing::new().with_field("title", "later")])
            .await
            .expect("insert");
        assert_eq!(again.inserted, 0);
        assert_eq!(again.rejected[0].id, None);
    }

    #[tokio::test]
    async fn availability_updates_report_matched_and_modified() {
        let store = MemoryStore::new().with_collection(
            "consolidated",
            vec![listing(1, true), listing(2, false), listing(3, true)],
        );

        let outcome = store
            .mark_unavailable("consolidated", "id", &[ListingId::Int(1), ListingId::Int(2), ListingId::Int(9)])
            .await
            .expect("update");

        assert_eq!(outcome, UpdateOutcome { matched: 2, modified: 1 });
        let unavailable = store
            .read(&CollectionSelector::all("consolidated").available(false))
            .await
            .expect("read");
        assert_eq!(unavailable.len(), 2);

        let revived = store
            .mark_available("consolidated", "id", &[ListingId::Int(2)])
            .await
            .expect("revive");
        assert_eq!(revived.modified, 1);
    }

    #[tokio::test]
    async fn reading_unknown_collection_is_empty() {
        let store = MemoryStore::new();

        let listings = store
            .read(&CollectionSelector::all("consolidated_sapo"))
            .await
            .expect("read");

        assert!(listings.is_empty());
    }

    #[tokio::test]
    async fn selector_projection_keeps_identifier() {
        let store = MemoryStore::new().with_collection("c", vec![listing(1, true)]);

        let listings = store
            .read(&CollectionSelector::all("c").project(vec!["title".into()], "id"))
            .await
            .expect("read");

        assert_eq!(listings[0].len(), 2);
        assert_eq!(listings[0].id(), Some(ListingId::Int(1)));
        assert!(listings[0].get(AVAILABILITY_FIELD).is_none());
    }

    #[tokio::test]
    async fn json_file_store_persists_across_instances() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());

        let outcome = store
            .insert("consolidated_imovirtual", "id", vec![listing(1, true), listing(2, true)])
            .await
            .expect("insert");
        assert_eq!(outcome.inserted, 2);
        store
            .mark_unavailable("consolidated_imovirtual", "id", &[ListingId::Int(2)])
            .await
            .expect("update");

        let reopened = JsonFileStore::new(dir.path());
        let listings = reopened
            .read(&CollectionSelector::all("consolidated_imovirtual"))
            .await
            .expect("read");

        assert_eq!(listings.len(), 2);
        assert!(listings[0].is_available());
        assert!(!listings[1].is_available());
        assert_eq!(listings[0].get("title"), Some(&JsonValue::from("T1 apartment")));
    }

    #[tokio::test]
    async fn json_file_store_surfaces_malformed_collections() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("broken.json"), b"{\"not\": \"an array\"}").expect("write");
        let store = JsonFileStore::new(dir.path());

        let err = store
            .read(&CollectionSelector::all("broken"))
            .await
            .expect_err("malformed");

        assert!(matches!(err, StoreError::Malformed { .. }));
    }

    #[tokio::test]
    async fn collection_names_cannot_escape_the_root() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());

        let err = store
            .read(&CollectionSelector::all("../outside"))
            .await
            .expect_err("invalid name");

        assert!(matches!(err, StoreError::InvalidCollection(_)));
    }

    #[tokio::test]
    async fn applying_a_plan_twice_changes_nothing_the_second_time() {
        let store = MemoryStore::new().with_collection("c", vec![listing(6, true), listing(7, true)]);
        let engine = ReconcileEngine::default();
        let consolidated = store.read(&CollectionSelector::all("c")).await.expect("read");
        let plan = engine.reconcile(vec![listing(7, false), listing(8, false)], &consolidated);

        store.mark_unavailable("c", "id", &plan.mark_unavailable).await.expect("update");
        let first = store.insert("c", "id", plan.insert.clone()).await.expect("insert");
        let second = store.insert("c", "id", plan.insert).await.expect("insert again");

        assert_eq!(first.inserted, 1);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.rejected.len(), 1);
        assert_eq!(store.collection("c").await.len(), 3);
    }
}
