use std::path::{Path, PathBuf};

use imoscout_core::{ListingId, ReappearancePolicy};
use imoscout_storage::CollectionSelector;
use imoscout_sync::{SyncConfig, SyncPipeline};
use tempfile::tempdir;

fn fixture_batch(source_id: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(source_id)
        .join("sample")
        .join("batch.json")
}

fn config(root: &Path) -> SyncConfig {
    SyncConfig {
        store_dir: root.join("data"),
        artifacts_dir: root.join("artifacts"),
        reappearance: ReappearancePolicy::Frozen,
        scheduler_enabled: false,
        sync_cron_1: "0 0 6 * * *".into(),
        sync_cron_2: "0 0 18 * * *".into(),
        workspace_root: root.to_path_buf(),
    }
}

#[tokio::test]
async fn imovirtual_fixture_consolidates_once() {
    let dir = tempdir().expect("tempdir");
    let pipeline = SyncPipeline::new(config(dir.path()));

    let first = pipeline
        .consolidate_source("imovirtual", Some(fixture_batch("imovirtual")))
        .await
        .expect("first consolidate");
    let source = &first.sources[0];
    assert_eq!(source.raw_count, 5);
    assert_eq!(source.unique_count, 4);
    assert_eq!(source.inserted_ids.first(), Some(&ListingId::Int(65123401)));
    assert!(source.archived_batch.starts_with("20261001_060000"));

    let second = pipeline
        .consolidate_source("imovirtual", Some(fixture_batch("imovirtual")))
        .await
        .expect("second consolidate");
    assert_eq!(second.total_inserted(), 0);
    assert_eq!(second.total_marked_unavailable(), 0);

    let stored = pipeline
        .store()
        .read(&CollectionSelector::all("consolidated_imovirtual"))
        .await
        .expect("read");
    assert_eq!(stored.len(), 4);
    assert!(stored.iter().all(|listing| listing.is_available()));
    // first occurrence wins, the promoted repeat is dropped
    assert!(stored[0].get("isPromoted").is_none());
}

#[tokio::test]
async fn sapo_fixture_reports_listing_without_link_id() {
    let dir = tempdir().expect("tempdir");
    let pipeline = SyncPipeline::new(config(dir.path()));

    let summary = pipeline
        .consolidate_source("sapo", Some(fixture_batch("sapo")))
        .await
        .expect("consolidate");

    let source = &summary.sources[0];
    assert_eq!(source.identifier_field, "link_id");
    assert_eq!(source.unique_count, 3);
    assert_eq!(source.inserted_ids.len(), 2);
    assert_eq!(source.applied.inserted.inserted, 3);
    assert!(source.rejected.is_empty());
    assert!(Path::new(&summary.parquet_manifest).exists());

    let second = pipeline
        .consolidate_source("sapo", Some(fixture_batch("sapo")))
        .await
        .expect("second consolidate");
    let source = &second.sources[0];
    assert_eq!(source.applied.inserted.inserted, 0);
    assert!(source.inserted_ids.is_empty());
    assert!(source.rejected.is_empty());
    assert!(source.marked_unavailable.is_empty());

    let stored = pipeline
        .store()
        .read(&CollectionSelector::all("consolidated_sapo"))
        .await
        .expect("read");
    assert_eq!(stored.len(), 3);
    assert_eq!(stored.iter().filter(|l| l.identifier("link_id").is_none()).count(), 1);
}
