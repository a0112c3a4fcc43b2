use std::path::PathBuf;

use resurface_adapters::load_snapshot;
use resurface_core::ContentStatus;

fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/snapshot/archive.json")
}

#[test]
fn fixture_archive_loads_titled_entries_in_order() {
    let records = load_snapshot(fixture_path()).expect("fixture loads");
    let titles: Vec<_> = records.iter().map(|r| r.title.as_str()).collect();
    assert_eq!(
        titles,
        [
            "Ocean Heat Hits Record High",
            "Methane Surge Over Wetlands",
            "Drafting the Coastal Adaptation Plan",
            "Glacier Retreat Accelerates",
        ]
    );

    let ocean = &records[0];
    assert_eq!(ocean.stable_id(), Some("65f0a1c2e4b0a1"));
    assert_eq!(ocean.body.len(), 2);
    assert_eq!(ocean.keywords.len(), 2);
    assert_eq!(ocean.status, Some(ContentStatus::Published));
    assert!(ocean.created_at.is_some());

    assert_eq!(records[2].stable_id(), None);
    assert_eq!(records[3].status, Some(ContentStatus::Scheduled));
    assert!(records[3].body.is_empty());
}
