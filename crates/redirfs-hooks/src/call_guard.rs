// Copyright (c) Contributors to the redirfs project.
// SPDX-License-Identifier: Apache-2.0

//! Fault isolation for intercepted entry points.
//!
//! A hook runs inside the host application, on the host's threads
//! and between the host and the real API. Whatever goes wrong in
//! the custom part of a hook, the host must still reach the real
//! API and must never see a panic or a changed last-error code.
//!
//! ```
//! use redirfs_hooks::{HookCallContext, HookGroup, HookResult, hook_guard};
//!
//! fn real_delete(_path: &str) -> bool {
//!     true
//! }
//!
//! fn hooked_delete(path: &str) -> bool {
//!     let call = HookCallContext::with_group(HookGroup::DeleteFile);
//!     if call.active() {
//!         hook_guard!(param = path, {
//!             let _ = path.parse::<u32>()?;
//!         });
//!     }
//!     let result = real_delete(path);
//!     call.update_last_error();
//!     result
//! }
//!
//! assert!(hooked_delete("not a number"));
//! ```

use std::any::Any;
use std::cell::Cell;
use std::fmt::Display;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};

#[cfg(test)]
#[path = "./call_guard_test.rs"]
mod call_guard_test;

/// Any failure of the custom logic of a hook
pub type HookFault = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The outcome of the custom logic of a hook
pub type HookResult<T = ()> = std::result::Result<T, HookFault>;

/// Run the custom logic of a hook, containing any fault it raises.
///
/// Errors and panics are logged once, naming `function` and `param`,
/// and then suppressed. The value of the logic is returned when it
/// succeeds, so that the caller can still fall back to default
/// behavior when it does not.
///
/// Describing the fault runs user code too (the `Display` of the
/// param and of the error), so it is contained the same way.
pub fn guard_call<T, F>(function: &str, param: Option<&dyn Display>, logic: F) -> Option<T>
where
    F: FnOnce() -> HookResult<T>,
{
    let err = match catch_unwind(AssertUnwindSafe(logic)) {
        Ok(Ok(value)) => return Some(value),
        Ok(Err(err)) => Ok(err),
        Err(payload) => Err(payload),
    };
    let reported = catch_unwind(AssertUnwindSafe(|| {
        let fault = match err {
            Ok(err) => describe_error(err.as_ref()),
            Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        };
        match param {
            Some(param) => tracing::error!(function, param = %param, "hook failed: {fault}"),
            None => tracing::error!(function, "hook failed: {fault}"),
        }
    }));
    if reported.is_err() {
        let _ = catch_unwind(|| {
            tracing::error!(function, "hook failed, and its fault could not be described")
        });
    }
    None
}

/// Format an error together with all of its causes
fn describe_error(err: &(dyn std::error::Error + 'static)) -> String {
    let mut description = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        description.push_str(": ");
        description.push_str(&cause.to_string());
        source = cause.source();
    }
    description
}

/// The message that a thread panicked with, when it has one
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// The path of the function that this macro is expanded in
#[macro_export]
macro_rules! hook_fn_name {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            ::std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        let name = name.strip_suffix("::f").unwrap_or(name);
        name.trim_end_matches("::{{closure}}")
    }};
}

/// Run a block as the custom logic of the surrounding hook.
///
/// The block may use `?` on anything that converts into a
/// [`HookFault`](crate::HookFault). Evaluates to `Some` of the
/// block's value, or `None` after logging the fault.
#[macro_export]
macro_rules! hook_guard {
    (param = $param:expr, $logic:block) => {
        $crate::guard_call(
            $crate::hook_fn_name!(),
            Some(&$param as &dyn ::std::fmt::Display),
            || -> $crate::HookResult<_> { Ok($logic) },
        )
    };
    ($logic:block) => {
        $crate::guard_call($crate::hook_fn_name!(), None, || -> $crate::HookResult<_> {
            Ok($logic)
        })
    };
}

/// Hooks that must not run inside one another on the same thread.
///
/// Intercepted APIs often call other intercepted APIs internally.
/// Opening a call context for a group that is already active makes
/// the nested hook pass straight through to the real API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookGroup {
    /// Excludes, and is excluded by, every other group
    All,
    OpenFile,
    CreateProcess,
    FileAttributes,
    FindFiles,
    LoadLibrary,
    FullPathname,
    DeleteFile,
}

impl HookGroup {
    fn bits(self) -> u32 {
        match self {
            Self::All => u32::MAX,
            Self::OpenFile => 1 << 0,
            Self::CreateProcess => 1 << 1,
            Self::FileAttributes => 1 << 2,
            Self::FindFiles => 1 << 3,
            Self::LoadLibrary => 1 << 4,
            Self::FullPathname => 1 << 5,
            Self::DeleteFile => 1 << 6,
        }
    }
}

thread_local! {
    static ACTIVE_GROUPS: Cell<u32> = const { Cell::new(0) };
}

/// The per-call state of one intercepted entry point.
///
/// Holds the platform last-error code that the caller should see
/// and puts it back in place when dropped, so that anything the hook
/// does afterwards, logging included, cannot change it.
#[must_use]
pub struct HookCallContext {
    claimed: u32,
    active: bool,
    last_error: Cell<i32>,
    _not_send: PhantomData<*const ()>,
}

impl HookCallContext {
    /// A context that does not exclude any other hook
    pub fn new() -> Self {
        Self {
            claimed: 0,
            active: true,
            last_error: Cell::new(last_error::get()),
            _not_send: PhantomData,
        }
    }

    /// A context for a hook of the given group.
    ///
    /// It is inactive if a hook of the same group is already running
    /// on this thread.
    pub fn with_group(group: HookGroup) -> Self {
        let last_error = last_error::get();
        let bits = group.bits();
        let active = ACTIVE_GROUPS.with(|groups| {
            if groups.get() & bits != 0 {
                return false;
            }
            groups.set(groups.get() | bits);
            true
        });
        if !active {
            tracing::trace!(?group, "nested hook passes through");
        }
        Self {
            claimed: if active { bits } else { 0 },
            active,
            last_error: Cell::new(last_error),
            _not_send: PhantomData,
        }
    }

    /// False if this is a nested call that should go straight to
    /// the real API
    pub fn active(&self) -> bool {
        self.active
    }

    /// Capture the last-error code as the real API left it.
    ///
    /// Call this right after the real API returns.
    pub fn update_last_error(&self) {
        self.last_error.set(last_error::get());
    }

    /// The code that is restored when this context ends
    pub fn last_error(&self) -> i32 {
        self.last_error.get()
    }
}

impl Default for HookCallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HookCallContext {
    fn drop(&mut self) {
        if self.claimed != 0 {
            let claimed = self.claimed;
            ACTIVE_GROUPS.with(|groups| groups.set(groups.get() & !claimed));
        }
        last_error::set(self.last_error.get());
    }
}

#[cfg(unix)]
mod last_error {
    use nix::errno::Errno;

    pub(super) fn get() -> i32 {
        Errno::last_raw()
    }

    pub(super) fn set(code: i32) {
        Errno::set_raw(code)
    }
}

#[cfg(windows)]
mod last_error {
    use windows::Win32::Foundation::{SetLastError, WIN32_ERROR};

    pub(super) fn get() -> i32 {
        std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or_default()
    }

    pub(super) fn set(code: i32) {
        // Safety: only changes the calling thread's error slot
        unsafe { SetLastError(WIN32_ERROR(code as u32)) }
    }
}
