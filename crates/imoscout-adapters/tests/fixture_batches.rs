// Checked-in crawl batches must stay loadable; the sync pipeline runs on them by default.

use std::path::Path;

use imoscout_adapters::{read_batch_file, Portal};

#[test]
fn every_portal_has_a_loadable_sample_batch() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    for portal in [Portal::Imovirtual, Portal::Sapo] {
        let path = root
            .join("fixtures")
            .join(portal.source_id())
            .join("sample/batch.json");
        let (_fetched_at, listings) = read_batch_file(&path).expect("sample batch loads");
        assert!(!listings.is_empty(), "{} sample batch is empty", portal.source_id());
        assert!(listings
            .iter()
            .any(|listing| listing.identifier(portal.identifier_field()).is_some()));
    }
}
