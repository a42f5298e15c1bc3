// Copyright (c) Contributors to the redirfs project.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU32, Ordering};

use rstest::{fixture, rstest};

use super::{FileMemory, LocalMemory, SharedMemory};
use crate::Error;

#[fixture]
fn tmpdir() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("redirfs-test-")
        .tempdir()
        .expect("failed to create dir for test")
}

fn word(region: &super::Region) -> &AtomicU32 {
    // Safety: every test region is at least a few words long and aligned
    unsafe { &*(region.as_ptr() as *const AtomicU32) }
}

#[rstest]
fn test_file_memory_regions_share_writes(tmpdir: tempfile::TempDir) {
    let memory = FileMemory::new(tmpdir.path());
    let first = memory.open("segment", 64).unwrap();
    let second = memory.open("segment", 64).unwrap();
    assert_eq!(word(&first).load(Ordering::Acquire), 0, "new segments are zero-filled");

    word(&first).store(42, Ordering::Release);
    assert_eq!(word(&second).load(Ordering::Acquire), 42);
    assert!(tmpdir.path().join("segment").is_file());
}

#[rstest]
fn test_file_memory_remove(tmpdir: tempfile::TempDir) {
    let memory = FileMemory::new(tmpdir.path());
    let region = memory.open("segment", 64).unwrap();
    word(&region).store(7, Ordering::Release);
    memory.remove("segment").unwrap();
    assert!(!tmpdir.path().join("segment").exists());
    assert_eq!(word(&region).load(Ordering::Acquire), 7, "open regions stay valid");

    let fresh = memory.open("segment", 64).unwrap();
    assert_eq!(word(&fresh).load(Ordering::Acquire), 0);

    memory
        .remove("missing")
        .expect("removing a missing segment is not an error");
}

#[rstest]
fn test_file_memory_resets_segment_without_users(tmpdir: tempfile::TempDir) {
    let memory = FileMemory::new(tmpdir.path());
    let first = memory.open("segment", 64).unwrap();
    word(&first).store(42, Ordering::Release);
    let second = memory.open("segment", 64).unwrap();
    assert_eq!(word(&second).load(Ordering::Acquire), 42, "still in use");

    // the file outlives its users, like it would after a crash
    drop(first);
    drop(second);
    assert!(tmpdir.path().join("segment").is_file());
    let fresh = memory.open("segment", 64).unwrap();
    assert_eq!(word(&fresh).load(Ordering::Acquire), 0);
}

#[rstest]
#[case("")]
#[case(".hidden")]
#[case("nested/name")]
fn test_file_memory_rejects_bad_names(tmpdir: tempfile::TempDir, #[case] name: &str) {
    let memory = FileMemory::new(tmpdir.path());
    let err = memory.open(name, 64).expect_err("name should be rejected");
    assert!(matches!(err, Error::InvalidSegmentName(_)));
}

#[rstest]
fn test_local_memory_regions_share_writes() {
    let memory = LocalMemory::new();
    let first = memory.open("segment", 64).unwrap();
    let second = memory.open("segment", 64).unwrap();
    word(&first).store(42, Ordering::Release);
    assert_eq!(word(&second).load(Ordering::Acquire), 42);

    memory.remove("segment").unwrap();
    assert!(!memory.contains("segment"));
    let fresh = memory.open("segment", 64).unwrap();
    assert_eq!(word(&fresh).load(Ordering::Acquire), 0);
}

#[rstest]
fn test_local_memory_resets_segment_without_users() {
    let memory = LocalMemory::new();
    let first = memory.open("segment", 64).unwrap();
    word(&first).store(42, Ordering::Release);
    drop(first);
    assert!(memory.contains("segment"));

    let fresh = memory.open("segment", 64).unwrap();
    assert_eq!(word(&fresh).load(Ordering::Acquire), 0);
    word(&fresh).store(7, Ordering::Release);
    let second = memory.open("segment", 64).unwrap();
    assert_eq!(word(&second).load(Ordering::Acquire), 7, "still in use");
}

#[rstest]
fn test_local_memory_existing_segment_too_small() {
    let memory = LocalMemory::new();
    let _small = memory.open("segment", 8).unwrap();
    let err = memory.open("segment", 64).expect_err("segment cannot grow");
    assert!(matches!(err, Error::RegionTooSmall { len: 8, required: 64 }));
}
