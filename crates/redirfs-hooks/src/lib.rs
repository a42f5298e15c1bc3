// Copyright (c) Contributors to the redirfs project.
// SPDX-License-Identifier: Apache-2.0

//! The process-wide context shared by all redirfs hooks.
//!
//! The bootstrap that installs the hooks creates one [`HookContext`]
//! per process and keeps its [`ContextHandle`] until the hooks are
//! removed again. Every intercepted call then reaches the context
//! through [`read_context!`] or [`write_context!`], with its custom
//! logic wrapped in [`hook_guard!`] so that no failure can escape
//! into the host application.

mod call_guard;
mod context;
mod custom_data;
mod delayed;
mod error;
mod lock;
mod logging;
mod module;
mod process;
mod redirection;

#[doc(hidden)]
pub use once_cell;

pub use call_guard::{HookCallContext, HookFault, HookGroup, HookResult, guard_call};
pub use context::{ContextHandle, ContextOptions, HookContext, ReadGuard, WriteGuard};
pub use custom_data::DataId;
pub use delayed::{DelayedWork, drain_delayed};
pub use error::{Error, Result};
pub use lock::{AccessMode, CellRef, CellRefMut, LockGuard, LockUsageError, ReentrantRwLock};
pub use logging::{REDIRFS_LOG, configure_logging, default_filter};
pub use module::ModuleHandle;
pub use process::{current_process_id, process_is_alive};
pub use redirection::{FlatRedirectionTable, RedirectionTable};
pub use {redirfs_config as config, redirfs_shm as shm};
