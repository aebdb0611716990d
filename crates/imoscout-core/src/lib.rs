//! Listing record model and the batch reconciliation engine.
//!
//! Everything in this crate is pure: callers hand in fully materialized
//! batches and consolidated sets and get back plain values. Persistence lives
//! in `imoscout-storage`.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "imoscout-core";

/// Identifier field used when a source does not configure its own.
pub const DEFAULT_ID_FIELD: &str = "id";

pub const AVAILABILITY_FIELD: &str = "is_available";

/// Opaque listing identifier, stable across crawls of the same listing.
///
/// No numeric semantics are assumed: `Int(1)` and `Text("1")` are different
/// keys, and numbers never compare equal to strings of the same digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListingId {
    Int(i64),
    /// Integers above `i64::MAX`.
    UInt(u64),
    /// Non-integral numbers, kept exactly as the crawler wrote them.
    Number(serde_json::Number),
    Text(String),
}

impl ListingId {
    /// Reads an identifier out of a JSON value. `null` means "no identifier".
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Null => None,
            JsonValue::String(text) => Some(Self::Text(text.clone())),
            JsonValue::Number(number) => Some(match (number.as_i64(), number.as_u64()) {
                (Some(int), _) => Self::Int(int),
                (None, Some(uint)) => Self::UInt(uint),
                (None, None) => Self::Number(number.clone()),
            }),
            other => Some(Self::Text(other.to_string())),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Int(int) => JsonValue::from(*int),
            Self::UInt(uint) => JsonValue::from(*uint),
            Self::Number(number) => JsonValue::Number(number.clone()),
            Self::Text(text) => JsonValue::String(text.clone()),
        }
    }
}

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(int) => write!(f, "{int}"),
            Self::UInt(uint) => write!(f, "{uint}"),
            Self::Number(number) => write!(f, "{number}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

impl From<i64> for ListingId {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for ListingId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ListingId {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// One scraped listing: an open, insertion-ordered key-value record.
///
/// Only the identifier field and `is_available` carry meaning here; every
/// other field is passed through untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Listing {
    fields: Map<String, JsonValue>,
}

impl Listing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a JSON object. Any other JSON value is handed back unchanged.
    pub fn from_json(value: JsonValue) -> Result<Self, JsonValue> {
        match value {
            JsonValue::Object(fields) => Ok(Self { fields }),
            other => Err(other),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.fields.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Option<JsonValue> {
        self.fields.insert(key.into(), value.into())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Identifier stored under `id_field`, `None` when absent or null.
    pub fn identifier(&self, id_field: &str) -> Option<ListingId> {
        self.fields.get(id_field).and_then(ListingId::from_json)
    }

    /// Identifier under the default `id` field.
    pub fn id(&self) -> Option<ListingId> {
        self.identifier(DEFAULT_ID_FIELD)
    }

    /// Absent or non-boolean availability reads as `false`.
    pub fn is_available(&self) -> bool {
        self.fields
            .get(AVAILABILITY_FIELD)
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }

    pub fn set_available(&mut self, available: bool) {
        self.fields
            .insert(AVAILABILITY_FIELD.to_string(), JsonValue::Bool(available));
    }

    /// Keeps only `keep` plus the identifier field, in the record's own order.
    pub fn project(&self, keep: &[String], id_field: &str) -> Listing {
        let fields = self
            .fields
            .iter()
            .filter(|(key, _)| key.as_str() == id_field || keep.iter().any(|k| k == *key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Listing { fields }
    }
}

impl From<Map<String, JsonValue>> for Listing {
    fn from(fields: Map<String, JsonValue>) -> Self {
        Self { fields }
    }
}

/// What happens to an unavailable consolidated listing that shows up again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReappearancePolicy {
    /// Delisted stays delisted.
    #[default]
    Frozen,
    /// Reappearing listings are flipped back to available.
    Revive,
}

#[derive(Debug, Error)]
#[error("unknown reappearance policy `{0}` (expected `frozen` or `revive`)")]
pub struct ParsePolicyError(String);

impl FromStr for ReappearancePolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "frozen" => Ok(Self::Frozen),
            "revive" => Ok(Self::Revive),
            _ => Err(ParsePolicyError(s.to_string())),
        }
    }
}

impl fmt::Display for ReappearancePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frozen => f.write_str("frozen"),
            Self::Revive => f.write_str("revive"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    pub id_field: String,
    pub reappearance: ReappearancePolicy,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            id_field: DEFAULT_ID_FIELD.to_string(),
            reappearance: ReappearancePolicy::default(),
        }
    }
}

/// Write intents computed for one batch against one consolidated set.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ReconcilePlan {
    pub raw_count: usize,
    pub unique_count: usize,
    pub mark_unavailable: Vec<ListingId>,
    pub mark_available: Vec<ListingId>,
    pub insert: Vec<Listing>,
}

impl ReconcilePlan {
    pub fn duplicates_dropped(&self) -> usize {
        self.raw_count - self.unique_count
    }

    /// True when applying the plan would change nothing.
    pub fn is_empty(&self) -> bool {
        self.mark_unavailable.is_empty() && self.mark_available.is_empty() && self.insert.is_empty()
    }
}

/// Stateless reconciliation over in-memory batches.
#[derive(Debug, Clone, Default)]
pub struct ReconcileEngine {
    config: ReconcileConfig,
}

impl ReconcileEngine {
    pub fn new(config: ReconcileConfig) -> Self {
        Self { config }
    }

    pub fn id_field(&self) -> &str {
        &self.config.id_field
    }

    /// Collapses a batch to one record per identifier, first occurrence wins,
    /// and marks every kept record available.
    ///
    /// Records without an identifier all share the `None` key, so only the
    /// first of them survives.
    pub fn dedup_and_flag(&self, batch: Vec<Listing>) -> Vec<Listing> {
        let mut seen: HashSet<Option<ListingId>> = HashSet::with_capacity(batch.len());
        let mut unique = Vec::with_capacity(batch.len());
        for mut listing in batch {
            if seen.insert(listing.identifier(self.id_field())) {
                listing.set_available(true);
                unique.push(listing);
            }
        }
        unique
    }

    /// Available consolidated identifiers that are missing from `batch`.
    ///
    /// Consolidated records without an identifier are skipped: they cannot be
    /// targeted by an identifier-based update.
    pub fn ids_to_mark_unavailable(&self, consolidated: &[Listing], batch: &[Listing]) -> Vec<ListingId> {
        let present = self.identifier_set(batch);
        consolidated
            .iter()
            .filter(|listing| listing.is_available())
            .filter_map(|listing| listing.identifier(self.id_field()))
            .filter(|id| !present.contains(&Some(id.clone())))
            .collect()
    }

    /// Batch records whose identifier is not in the consolidated set, in batch order.
    pub fn listings_to_insert(&self, consolidated: &[Listing], batch: &[Listing]) -> Vec<Listing> {
        let known = self.identifier_set(consolidated);
        batch
            .iter()
            .filter(|listing| !known.contains(&listing.identifier(self.id_field())))
            .cloned()
            .collect()
    }

    /// Unavailable consolidated identifiers that are back in `batch`.
    ///
    /// Always empty under [`ReappearancePolicy::Frozen`].
    pub fn ids_to_mark_available(&self, consolidated: &[Listing], batch: &[Listing]) -> Vec<ListingId> {
        if self.config.reappearance == ReappearancePolicy::Frozen {
            return Vec::new();
        }
        let present = self.identifier_set(batch);
        consolidated
            .iter()
            .filter(|listing| !listing.is_available())
            .filter_map(|listing| listing.identifier(self.id_field()))
            .filter(|id| present.contains(&Some(id.clone())))
            .collect()
    }

    /// Dedup, then diff for removal, insertion and (per policy) reappearance.
    pub fn reconcile(&self, raw_batch: Vec<Listing>, consolidated: &[Listing]) -> ReconcilePlan {
        let raw_count = raw_batch.len();
        let batch = self.dedup_and_flag(raw_batch);
        let unique_count = batch.len();

        let mark_unavailable = self.ids_to_mark_unavailable(consolidated, &batch);
        let mark_available = self.ids_to_mark_available(consolidated, &batch);

        let insert = self.listings_to_insert(consolidated, &batch);

        ReconcilePlan {
            raw_count,
            unique_count,
            mark_unavailable,
            mark_available,
            insert,
        }
    }

    fn identifier_set(&self, listings: &[Listing]) -> HashSet<Option<ListingId>> {
        listings
            .iter()
            .map(|listing| listing.identifier(self.id_field()))
            .collect()
    }
}

/// Reconciles with the default `id` field and frozen reappearance.
pub fn reconcile(raw_batch: Vec<Listing>, consolidated: &[Listing]) -> ReconcilePlan {
    ReconcileEngine::default().reconcile(raw_batch, consolidated)
}
