//! Catalog behavior over real directories and real blobs.

use std::fs;

use catalog::{Catalog, FileRecord};
use filetime::FileTime;

#[test]
fn scan_serialize_restore_preserves_every_record() {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join("one.txt"), b"1").unwrap();
    fs::create_dir_all(tmp.path().join("a/b")).unwrap();
    fs::write(tmp.path().join("a/two.txt"), b"22").unwrap();
    fs::write(tmp.path().join("a/b/three.txt"), b"333").unwrap();
    for (path, stamp) in [("one.txt", 1_000), ("a/two.txt", 2_000), ("a/b/three.txt", 3_000)] {
        filetime::set_file_mtime(tmp.path().join(path), FileTime::from_unix_time(stamp, 0))
            .unwrap();
    }

    let scanned = Catalog::scan(tmp.path()).unwrap();
    assert_eq!(scanned.len(), 3);
    assert_eq!(
        scanned.get("/a/b/three.txt"),
        FileRecord {
            modified: 3_000,
            size: 3,
            deleted: false,
        }
    );

    let restored = Catalog::from_bytes(&scanned.to_bytes()).unwrap();
    assert_eq!(restored, scanned);
    assert_eq!(restored.to_bytes(), scanned.to_bytes());
}

#[test]
fn empty_directory_serializes_to_the_count_prefix_alone() {
    let tmp = tempfile::tempdir().unwrap();
    let cat = Catalog::scan(tmp.path()).unwrap();
    assert!(cat.is_empty());
    assert_eq!(cat.to_bytes(), 0u64.to_be_bytes());
}

#[test]
fn blob_written_to_disk_reloads_identically() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cat = Catalog::new();
    cat.upsert_file("/a.txt", 5, 100);
    cat.delete_file("/old", 90);

    let path = tmp.path().join("0.mtd");
    fs::write(&path, cat.to_bytes()).unwrap();
    let reloaded = Catalog::from_bytes(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(reloaded, cat);
    assert_eq!(fs::read(&path).unwrap(), reloaded.to_bytes());
}

#[test]
fn initial_sync_merge_produces_one_pull() {
    // Fresh client against a server that already holds /a.txt @ 100.
    let local = Catalog::new();
    let mut remote = Catalog::new();
    remote.upsert_file("/a.txt", 5, 100);

    let events = Catalog::merge(&local, &remote);
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert!(event.remote);
    assert_eq!(event.path, "/a.txt");
    assert_eq!(event.record.modified, 100);
    assert_eq!(event.record.size, 5);
    assert!(!event.record.deleted);
}

#[test]
fn merge_is_direction_symmetric() {
    let mut here = Catalog::new();
    here.upsert_file("/f", 1, 300);
    let mut there = Catalog::new();
    there.upsert_file("/f", 1, 200);

    let forward = Catalog::merge(&here, &there);
    assert_eq!(forward.len(), 1);
    assert!(!forward[0].remote);

    let backward = Catalog::merge(&there, &here);
    assert_eq!(backward.len(), 1);
    assert!(backward[0].remote);
    assert_eq!(backward[0].record.modified, 300);
}

#[test]
fn tombstone_wins_over_an_older_live_file() {
    let mut local = Catalog::new();
    local.upsert_file("/doc", 10, 100);
    let mut remote = Catalog::new();
    remote.delete_file("/doc", 200);

    let events = Catalog::merge(&local, &remote);
    assert_eq!(events.len(), 1);
    assert!(events[0].remote);
    assert!(events[0].record.deleted);
    assert_eq!(events[0].record.size, 0);
}
