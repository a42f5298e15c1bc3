// Copyright (c) Contributors to the redirfs project.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};

use redirfs_config::{CrashDumpsType, LogLevel, Parameters};
use rstest::{fixture, rstest};

use super::{Disposition, SharedParameters};
use crate::{Error, FileMemory, LocalMemory, RECORD_SIZE, Region, SharedMemory};

#[fixture]
fn tmpdir() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("redirfs-test-")
        .tempdir()
        .expect("failed to create dir for test")
}

fn creator_params() -> Parameters {
    let mut params = Parameters::new("session");
    params.debug_mode = true;
    params.log_level = LogLevel::Debug;
    params.crash_dumps_type = CrashDumpsType::Full;
    params.crash_dumps_path = "/var/tmp/dumps".into();
    params.delay_process_ms = 50;
    params
}

/// A 32 bit field of the record at the given byte offset
fn record_word(region: &Region, offset: usize) -> &AtomicU32 {
    assert!(offset + 4 <= region.len());
    // Safety: in bounds, and every test offset is a multiple of four
    unsafe { &*(region.as_ptr().add(offset) as *const AtomicU32) }
}

#[rstest]
fn test_second_attachment_sees_creator_defaults(tmpdir: tempfile::TempDir) {
    let memory: Arc<dyn SharedMemory> = Arc::new(FileMemory::new(tmpdir.path()));
    let first = SharedParameters::attach(Arc::clone(&memory), &creator_params()).unwrap();
    assert_eq!(first.disposition(), Disposition::Created);

    // a later process asks for different values, but joins the session as is
    let second = SharedParameters::attach(memory, &Parameters::new("session")).unwrap();
    assert_eq!(second.disposition(), Disposition::Attached);
    assert_eq!(second.snapshot(), creator_params());
    assert_eq!(first.user_count(), 2);
}

#[rstest]
fn test_setters_are_visible_to_other_attachments() {
    let memory: Arc<dyn SharedMemory> = Arc::new(LocalMemory::new());
    let first = SharedParameters::attach(Arc::clone(&memory), &Parameters::new("session")).unwrap();
    let second = SharedParameters::attach(memory, &Parameters::new("session")).unwrap();
    assert!(!second.debug_mode());

    first.set_debug_mode(true);
    first.set_log_level(LogLevel::Error);
    first.set_crash_dumps_type(CrashDumpsType::Mini);
    assert!(second.debug_mode());
    assert_eq!(second.log_level(), LogLevel::Error);
    assert_eq!(second.crash_dumps_type(), CrashDumpsType::Mini);
    assert!(second.snapshot().debug_mode);
}

#[rstest]
fn test_sessions_are_separated_by_token() {
    let memory: Arc<dyn SharedMemory> = Arc::new(LocalMemory::new());
    let first = SharedParameters::attach(Arc::clone(&memory), &Parameters::new("one")).unwrap();
    let second = SharedParameters::attach(memory, &Parameters::new("two")).unwrap();
    assert_eq!(first.disposition(), Disposition::Created);
    assert_eq!(second.disposition(), Disposition::Created);
    assert_ne!(first.segment_name(), second.segment_name());
}

#[rstest]
fn test_last_user_removes_segment() {
    let local = Arc::new(LocalMemory::new());
    let memory: Arc<dyn SharedMemory> = local.clone();
    let params = Parameters::new("session");
    let first = SharedParameters::attach(Arc::clone(&memory), &params).unwrap();
    let second = SharedParameters::attach(Arc::clone(&memory), &params).unwrap();

    drop(first);
    assert!(local.contains(&params.segment_name()), "one user remains");
    assert_eq!(second.user_count(), 1);
    second.set_debug_mode(true);

    drop(second);
    assert!(!local.contains(&params.segment_name()));
    let fresh = SharedParameters::attach(memory, &params).unwrap();
    assert_eq!(fresh.disposition(), Disposition::Created);
    assert!(!fresh.debug_mode(), "a new session starts from its own values");
}

#[rstest]
fn test_invalid_token_is_rejected_before_touching_memory() {
    let local = Arc::new(LocalMemory::new());
    let err = SharedParameters::attach(local.clone(), &Parameters::new("bad token"))
        .expect_err("token should be rejected");
    assert!(matches!(err, Error::Parameters(_)));
    assert!(!local.contains("redirfs-bad token"));
}

#[rstest]
fn test_incompatible_segment_is_rejected(tmpdir: tempfile::TempDir) {
    let params = Parameters::new("session");
    // another build, still running, holds a ready record of a different layout
    let memory = Arc::new(FileMemory::new(tmpdir.path()));
    let foreign = memory.open(&params.segment_name(), RECORD_SIZE).unwrap();
    record_word(&foreign, 0).store(crate::RECORD_MAGIC, Ordering::Release);
    record_word(&foreign, 4).store(99, Ordering::Release);
    record_word(&foreign, 8).store(2, Ordering::Release);

    let err = SharedParameters::attach(memory, &params).expect_err("layout should not match");
    assert!(matches!(err, Error::IncompatibleRecord { version: 99, .. }));
}

#[rstest]
fn test_concurrent_attachments_create_exactly_once() {
    const USERS: usize = 8;
    let memory: Arc<dyn SharedMemory> = Arc::new(LocalMemory::new());
    let barrier = Arc::new(Barrier::new(USERS));
    let handles: Vec<_> = (0..USERS)
        .map(|i| {
            let memory = Arc::clone(&memory);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let mut params = Parameters::new("session");
                params.delay_process_ms = i as u64;
                barrier.wait();
                SharedParameters::attach(memory, &params).unwrap()
            })
        })
        .collect();
    let attachments: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let created: Vec<_> = attachments
        .iter()
        .filter(|a| a.disposition() == Disposition::Created)
        .collect();
    assert_eq!(created.len(), 1);
    let expected = created[0].snapshot();
    for attachment in attachments.iter() {
        assert_eq!(attachment.snapshot(), expected);
    }
    assert_eq!(attachments[0].user_count(), USERS as u32);
}

#[rstest]
#[case::file(true)]
#[case::local(false)]
fn test_unfinished_record_without_users_is_recreated(
    tmpdir: tempfile::TempDir,
    #[case] use_files: bool,
) {
    let memory: Arc<dyn SharedMemory> = if use_files {
        Arc::new(FileMemory::new(tmpdir.path()))
    } else {
        Arc::new(LocalMemory::new())
    };
    let params = Parameters::new("session");
    {
        // a creator that claimed the record and then went away
        let region = memory.open(&params.segment_name(), RECORD_SIZE).unwrap();
        record_word(&region, 8).store(1, Ordering::Release);
    }

    let attachment = SharedParameters::attach(memory, &creator_params()).unwrap();
    assert_eq!(attachment.disposition(), Disposition::Created);
    assert_eq!(attachment.snapshot(), creator_params());
    assert_eq!(attachment.user_count(), 1);
}

/// Set in the environment of [`crashing_attacher`] when it should run
const CRASH_ROOT_VAR: &str = "REDIRFS_TEST_CRASH_ROOT";

/// Runs in a child process of `test_crashed_user_does_not_pin_the_session`,
/// and does nothing otherwise
#[rstest]
fn crashing_attacher() {
    let Some(root) = std::env::var_os(CRASH_ROOT_VAR) else {
        return;
    };
    let memory = Arc::new(FileMemory::new(root));
    let attachment = SharedParameters::attach(memory, &creator_params()).unwrap();
    assert_eq!(attachment.disposition(), Disposition::Created);
    // leave without detaching, as a crash would
    std::process::exit(0);
}

#[cfg(unix)]
#[rstest]
fn test_crashed_user_does_not_pin_the_session(tmpdir: tempfile::TempDir) {
    let status = std::process::Command::new(std::env::current_exe().unwrap())
        .args([
            "--exact",
            "parameters::parameters_test::crashing_attacher",
            "--test-threads=1",
        ])
        .env(CRASH_ROOT_VAR, tmpdir.path())
        .stdout(std::process::Stdio::null())
        .status()
        .unwrap();
    assert!(status.success());

    let params = Parameters::new("session");
    assert!(
        tmpdir.path().join(params.segment_name()).is_file(),
        "the crashed process leaves its record behind"
    );
    let memory = Arc::new(FileMemory::new(tmpdir.path()));
    let attachment = SharedParameters::attach(memory, &params).unwrap();
    assert_eq!(attachment.disposition(), Disposition::Created);
    assert!(!attachment.debug_mode(), "the old session's values are gone");
    assert_eq!(attachment.user_count(), 1);
}
