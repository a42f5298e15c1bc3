// Copyright (c) Contributors to the redirfs project.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rstest::rstest;
use tracing_capture::{CaptureLayer, SharedStorage};
use tracing_subscriber::layer::SubscriberExt;

use super::{HookCallContext, HookGroup, HookResult, last_error};

#[derive(Debug, thiserror::Error)]
#[error("no such mapping")]
struct MissingMapping(#[source] std::io::Error);

enum Behavior {
    Succeed,
    Fail,
    Panic,
}

/// A stand-in for an intercepted API that counts real calls
fn hooked_open(path: &str, behavior: &Behavior, real_calls: &AtomicUsize) -> Option<usize> {
    let outcome = crate::hook_guard!(param = path, {
        match behavior {
            Behavior::Succeed => path.len(),
            Behavior::Fail => {
                let err = std::io::Error::new(std::io::ErrorKind::NotFound, "lookup failed");
                return Err(MissingMapping(err).into());
            }
            Behavior::Panic => panic!("hook logic exploded"),
        }
    });
    real_calls.fetch_add(1, Ordering::SeqCst);
    outcome
}

fn capture<F: FnOnce()>(run: F) -> SharedStorage {
    let storage = SharedStorage::default();
    let subscriber = tracing_subscriber::registry().with(CaptureLayer::new(&storage));
    tracing::subscriber::with_default(subscriber, run);
    storage
}

#[rstest]
fn test_function_name_is_the_enclosing_function() {
    fn enclosing() -> &'static str {
        crate::hook_fn_name!()
    }
    let name = enclosing();
    assert!(name.ends_with("::enclosing"), "got {name}");

    let from_closure = (|| crate::hook_fn_name!())();
    assert!(!from_closure.ends_with("{{closure}}"), "got {from_closure}");
}

#[rstest]
fn test_success_logs_nothing() {
    let real_calls = AtomicUsize::new(0);
    let mut outcome = None;
    let storage = capture(|| outcome = hooked_open("/data", &Behavior::Succeed, &real_calls));
    assert_eq!(outcome, Some(5));
    assert_eq!(real_calls.load(Ordering::SeqCst), 1);
    assert_eq!(storage.lock().all_events().count(), 0);
}

#[rstest]
#[case::error(Behavior::Fail, "hook failed: no such mapping: lookup failed")]
#[case::panic(Behavior::Panic, "hook failed: panicked: hook logic exploded")]
fn test_fault_is_logged_once_and_suppressed(#[case] behavior: Behavior, #[case] expected: &str) {
    let real_calls = AtomicUsize::new(0);
    let mut outcome = Some(0);
    let storage = capture(|| outcome = hooked_open("/data", &behavior, &real_calls));

    assert_eq!(outcome, None);
    assert_eq!(
        real_calls.load(Ordering::SeqCst),
        1,
        "the real call must still happen"
    );
    let storage = storage.lock();
    let events: Vec<_> = storage.all_events().collect();
    assert_eq!(events.len(), 1, "expected exactly one log entry");
    let event = &events[0];
    assert_eq!(*event.metadata().level(), tracing::Level::ERROR);
    let function = event.value("function").and_then(|v| v.as_str());
    assert!(
        function.is_some_and(|f| f.ends_with("::hooked_open")),
        "got {function:?}"
    );
    assert!(event.value("param").is_some());
    assert_eq!(event.message(), Some(expected));
}

#[rstest]
fn test_guard_without_param() {
    let storage = capture(|| {
        let outcome: Option<u32> = crate::hook_guard!({ "x".parse::<u32>()? });
        assert_eq!(outcome, None);
    });
    let storage = storage.lock();
    let events: Vec<_> = storage.all_events().collect();
    assert_eq!(events.len(), 1);
    assert!(events[0].value("param").is_none());
}

/// A hook parameter that cannot be formatted
struct UnprintablePath;

impl std::fmt::Display for UnprintablePath {
    fn fmt(&self, _f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        panic!("path is not printable")
    }
}

/// Log output formatted the way the stderr subscriber would write it
#[derive(Clone, Default)]
struct LogOutput(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for LogOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[rstest]
fn test_fault_description_that_panics_is_contained() {
    let output = LogOutput::default();
    let writer = output.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let outcome = tracing::subscriber::with_default(subscriber, || {
        std::panic::catch_unwind(|| {
            crate::hook_guard!(param = UnprintablePath, { "x".parse::<u32>()? })
        })
    });
    assert!(matches!(outcome, Ok(None)), "nothing may reach the host");

    let output = String::from_utf8(output.0.lock().unwrap().clone()).unwrap();
    assert!(output.contains("ERROR"), "got {output}");
    assert!(
        output.contains("hook failed, and its fault could not be described"),
        "got {output}"
    );
}

#[rstest]
fn test_guard_call_directly() {
    let outcome = super::guard_call("direct", None, || -> HookResult<i32> { Ok(4) });
    assert_eq!(outcome, Some(4));
}

#[rstest]
fn test_same_group_is_exclusive_on_thread() {
    let outer = HookCallContext::with_group(HookGroup::OpenFile);
    assert!(outer.active());
    {
        let nested = HookCallContext::with_group(HookGroup::OpenFile);
        assert!(!nested.active(), "nested hook of the same group should pass through");
        let other = HookCallContext::with_group(HookGroup::FindFiles);
        assert!(other.active(), "other groups are unaffected");
    }
    // other threads keep their own groups
    std::thread::spawn(|| {
        assert!(HookCallContext::with_group(HookGroup::OpenFile).active());
    })
    .join()
    .unwrap();
    drop(outer);
    assert!(HookCallContext::with_group(HookGroup::OpenFile).active());
}

#[rstest]
fn test_inactive_context_does_not_release_group() {
    let outer = HookCallContext::with_group(HookGroup::LoadLibrary);
    drop(HookCallContext::with_group(HookGroup::LoadLibrary));
    assert!(
        !HookCallContext::with_group(HookGroup::LoadLibrary).active(),
        "an inactive nested context must not free the outer claim"
    );
    drop(outer);
}

#[rstest]
fn test_all_group_excludes_everything() {
    {
        let _all = HookCallContext::with_group(HookGroup::All);
        assert!(!HookCallContext::with_group(HookGroup::CreateProcess).active());
        assert!(!HookCallContext::with_group(HookGroup::All).active());
        assert!(HookCallContext::new().active(), "ungrouped hooks always run");
    }
    let _delete = HookCallContext::with_group(HookGroup::DeleteFile);
    assert!(!HookCallContext::with_group(HookGroup::All).active());
}

#[rstest]
fn test_last_error_is_restored() {
    last_error::set(13);
    let call = HookCallContext::new();
    assert_eq!(call.last_error(), 13);

    // the real call leaves its own code behind
    last_error::set(2);
    call.update_last_error();
    // the hook then clobbers it while logging
    last_error::set(99);
    drop(call);
    assert_eq!(last_error::get(), 2);
}
