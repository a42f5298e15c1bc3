// Copyright (c) Contributors to the redirfs project.
// SPDX-License-Identifier: Apache-2.0

use std::any::Any;
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwapOption;
use once_cell::sync::Lazy;
use redirfs_config::{CrashDumpsType, LogLevel, Parameters};
use redirfs_shm::{Disposition, FileMemory, SharedMemory, SharedParameters};

use crate::custom_data::CustomDataRegistry;
use crate::delayed::{DelayedWork, drain_delayed};
use crate::lock::{AccessMode, CellRef, CellRefMut, Held, ReentrantRwLock, ScopedCell};
use crate::process::{current_process_id, process_is_alive};
use crate::{DataId, Error, FlatRedirectionTable, ModuleHandle, RedirectionTable, Result};

#[cfg(test)]
#[path = "./context_test.rs"]
mod context_test;

/// The context of this process, if one has been created
static INSTANCE: Lazy<ArcSwapOption<HookContext>> = Lazy::new(ArcSwapOption::empty);

/// Serializes creation and destruction of the process context
static LIFECYCLE: Mutex<()> = Mutex::new(());

/// Collaborators of a hook context that can be swapped out.
#[derive(Debug)]
pub struct ContextOptions {
    /// Where the shared configuration record lives
    pub memory: Arc<dyn SharedMemory>,
    /// The initial redirections
    pub redirections: Box<dyn RedirectionTable>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            memory: Arc::new(FileMemory::new(FileMemory::default_root())),
            redirections: Box::<FlatRedirectionTable>::default(),
        }
    }
}

/// The state that every hook in this process shares.
///
/// There is at most one context per process. It is created by the
/// bootstrap code with [`HookContext::create`], and from then on is
/// only reachable through the guards returned by
/// [`HookContext::read_access`] and [`HookContext::write_access`].
///
/// Read guards can be held by many threads at once, while a write
/// guard excludes every other thread. A thread that already holds
/// a guard may take more, in the same or a weaker mode, but asking
/// for write access while holding only read access never returns.
pub struct HookContext {
    lock: ReentrantRwLock,
    redirections: ScopedCell<Box<dyn RedirectionTable>>,
    processes: ScopedCell<BTreeSet<u32>>,
    delayed: ScopedCell<Vec<DelayedWork>>,
    debug_mode: AtomicBool,
    parameters: SharedParameters,
    module: ModuleHandle,
    custom_data: CustomDataRegistry,
}

impl HookContext {
    /// Create the context of this process and join the session named
    /// in `params`, using the default shared memory location.
    pub fn create(params: &Parameters, module: ModuleHandle) -> Result<ContextHandle> {
        Self::create_with(params, module, ContextOptions::default())
    }

    /// Create the context of this process with the given collaborators.
    ///
    /// The session's configuration record is created from `params` if
    /// this is the first process of the session, otherwise the values
    /// already in the record win. The calling process is registered.
    #[tracing::instrument(skip_all, fields(instance = %params.instance_name))]
    pub fn create_with(
        params: &Parameters,
        module: ModuleHandle,
        options: ContextOptions,
    ) -> Result<ContextHandle> {
        let _lifecycle = LIFECYCLE.lock().unwrap_or_else(PoisonError::into_inner);
        if INSTANCE.load().is_some() {
            return Err(Error::AlreadyCreated);
        }
        let parameters = SharedParameters::attach(options.memory, params)?;
        let pid = current_process_id();
        let context = Self {
            lock: ReentrantRwLock::new(),
            redirections: ScopedCell::new("redirection table", options.redirections),
            processes: ScopedCell::new("process registry", BTreeSet::from([pid])),
            delayed: ScopedCell::new("delayed work", Vec::new()),
            debug_mode: AtomicBool::new(parameters.debug_mode()),
            parameters,
            module,
            custom_data: CustomDataRegistry::default(),
        };
        tracing::debug!(
            %pid,
            module = ?context.module.path(),
            disposition = ?context.parameters.disposition(),
            "hook context created"
        );
        INSTANCE.store(Some(Arc::new(context)));
        Ok(ContextHandle { live: true })
    }

    /// True if this process currently has a context
    pub fn exists() -> bool {
        INSTANCE.load().is_some()
    }

    fn instance() -> Result<Arc<Self>> {
        INSTANCE.load_full().ok_or(Error::NoContext)
    }

    /// Wait for shared access to the context.
    ///
    /// `source` names the caller in diagnostics only.
    pub fn read_access(source: &str) -> Result<ReadGuard> {
        let context = Self::instance()?;
        let held = context.lock.acquire(AccessMode::Read);
        tracing::trace!(%source, ?held, "context read access");
        Ok(ReadGuard(ContextGuard::new(context, held)))
    }

    /// Wait for exclusive access to the context.
    ///
    /// `source` names the caller in diagnostics only.
    pub fn write_access(source: &str) -> Result<WriteGuard> {
        let context = Self::instance()?;
        let held = context.lock.acquire(AccessMode::Write);
        tracing::trace!(%source, "context write access");
        Ok(WriteGuard(ContextGuard::new(context, held)))
    }

    /// The redirections of this process
    pub fn redirection_table(&self) -> CellRef<'_, Box<dyn RedirectionTable>> {
        self.redirections.borrow()
    }

    /// The session settings as currently stored in the shared record
    pub fn call_parameters(&self) -> Parameters {
        self.parameters.snapshot()
    }

    /// The debug flag as of the last [`Self::update_parameters`]
    pub fn debug_mode(&self) -> bool {
        self.debug_mode.load(Ordering::Acquire)
    }

    /// Refresh the cached settings from the shared record
    pub fn update_parameters(&self) {
        let debug_mode = self.parameters.debug_mode();
        let previous = self.debug_mode.swap(debug_mode, Ordering::AcqRel);
        if previous != debug_mode {
            tracing::debug!(%debug_mode, "session debug mode changed");
        }
    }

    /// Whether this process created the session or joined it
    pub fn disposition(&self) -> Disposition {
        self.parameters.disposition()
    }

    /// The path of the module that hosts the hooks
    pub fn dll_path(&self) -> &Path {
        self.module.path()
    }

    pub fn module(&self) -> &ModuleHandle {
        &self.module
    }

    /// The custom data stored under `id`, created on first use.
    ///
    /// Custom data is not protected by the context guards. Features
    /// that use their data from more than one thread must make the
    /// stored type synchronize itself.
    pub fn custom_data<T>(&self, id: DataId) -> Result<Arc<T>>
    where
        T: Any + Default + Send + Sync,
    {
        self.custom_data.get_or_default(id)
    }

    /// The ids of all processes taking part in the session, in order
    pub fn registered_processes(&self) -> Vec<u32> {
        self.processes.borrow().iter().copied().collect()
    }
}

impl Drop for HookContext {
    fn drop(&mut self) {
        let abandoned = self.delayed.borrow_mut().len();
        if abandoned > 0 {
            tracing::warn!(%abandoned, "background work registered after destruction was not waited on");
        }
    }
}

impl std::fmt::Debug for HookContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookContext")
            .field("module", &self.module)
            .field("parameters", &self.parameters)
            .field("custom_data", &self.custom_data)
            .finish_non_exhaustive()
    }
}

/// Keeps the hook context of this process alive.
///
/// Destroying the handle, explicitly or by dropping it, waits for all
/// registered background work, unregisters the current process and
/// removes the context. Guards that are still held elsewhere keep
/// the old context usable until they are dropped, but no new access
/// is granted.
#[must_use = "the hook context is destroyed when its handle is dropped"]
#[derive(Debug)]
pub struct ContextHandle {
    live: bool,
}

impl ContextHandle {
    /// Destroy the hook context of this process
    pub fn destroy(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if !std::mem::take(&mut self.live) {
            return;
        }
        let _lifecycle = LIFECYCLE.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(context) = INSTANCE.load_full() else {
            return;
        };
        // background work may need the context itself to finish, so
        // it is waited on without holding any guard
        loop {
            let guard = WriteGuard(ContextGuard::new(
                Arc::clone(&context),
                context.lock.acquire(AccessMode::Write),
            ));
            let pending = guard.take_delayed();
            if pending.is_empty() {
                guard.unregister_current_process();
                INSTANCE.store(None);
                break;
            }
            drop(guard);
            let count = pending.len();
            let failures = drain_delayed(pending);
            tracing::debug!(%count, %failures, "waited for background work");
        }
        tracing::debug!("hook context destroyed");
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Holds the lock of one context on the thread that acquired it
struct ContextGuard {
    context: Arc<HookContext>,
    held: Held,
    _not_send: PhantomData<*const ()>,
}

impl ContextGuard {
    fn new(context: Arc<HookContext>, held: Held) -> Self {
        Self {
            context,
            held,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.context.lock.release(self.held);
    }
}

/// Shared access to the hook context, see [`HookContext::read_access`]
#[must_use]
pub struct ReadGuard(ContextGuard);

impl Deref for ReadGuard {
    type Target = HookContext;

    fn deref(&self) -> &HookContext {
        &self.0.context
    }
}

/// Exclusive access to the hook context, see [`HookContext::write_access`]
#[must_use]
pub struct WriteGuard(ContextGuard);

impl Deref for WriteGuard {
    type Target = HookContext;

    fn deref(&self) -> &HookContext {
        &self.0.context
    }
}

impl WriteGuard {
    /// The redirections of this process, for changing them
    pub fn redirection_table_mut(&self) -> CellRefMut<'_, Box<dyn RedirectionTable>> {
        self.redirections.borrow_mut()
    }

    /// Add a process to the session, if it is not already part of it
    pub fn register_process(&self, pid: u32) {
        if self.processes.borrow_mut().insert(pid) {
            tracing::debug!(%pid, "process registered");
        }
    }

    /// Remove the calling process from the session, returning false
    /// if it was not registered
    pub fn unregister_current_process(&self) -> bool {
        let pid = current_process_id();
        let removed = self.processes.borrow_mut().remove(&pid);
        if removed {
            tracing::debug!(%pid, "process unregistered");
        }
        removed
    }

    /// Keep only the registered processes for which `keep` returns
    /// true, returning the ids that were removed
    pub fn retain_processes<F>(&self, mut keep: F) -> Vec<u32>
    where
        F: FnMut(u32) -> bool,
    {
        let mut processes = self.processes.borrow_mut();
        let removed: Vec<u32> = processes.iter().copied().filter(|pid| !keep(*pid)).collect();
        for pid in removed.iter() {
            processes.remove(pid);
        }
        removed
    }

    /// Remove the registered processes that are no longer running
    pub fn prune_stale_processes(&self) -> Vec<u32> {
        let removed = self.retain_processes(process_is_alive);
        if !removed.is_empty() {
            tracing::debug!(?removed, "removed processes that are no longer running");
        }
        removed
    }

    /// Track background work that must finish before destruction
    pub fn register_delayed(&self, work: DelayedWork) {
        tracing::trace!(label = %work.label(), "background work registered");
        self.delayed.borrow_mut().push(work);
    }

    /// All background work registered so far
    pub fn delayed(&self) -> CellRefMut<'_, Vec<DelayedWork>> {
        self.delayed.borrow_mut()
    }

    /// Remove and return all registered background work
    pub fn take_delayed(&self) -> Vec<DelayedWork> {
        std::mem::take(&mut *self.delayed.borrow_mut())
    }

    /// Change the debug flag of the whole session
    pub fn set_debug_mode(&self, debug_mode: bool) {
        self.parameters.set_debug_mode(debug_mode);
        self.debug_mode.store(debug_mode, Ordering::Release);
    }

    /// Change the log level of the whole session
    pub fn set_log_level(&self, level: LogLevel) {
        self.parameters.set_log_level(level);
    }

    /// Change the crash dump type of the whole session
    pub fn set_crash_dumps_type(&self, dump_type: CrashDumpsType) {
        self.parameters.set_crash_dumps_type(dump_type);
    }
}

/// Get shared access to the hook context, named after the calling function
#[macro_export]
macro_rules! read_context {
    () => {
        $crate::HookContext::read_access($crate::hook_fn_name!())
    };
}

/// Get exclusive access to the hook context, named after the calling function
#[macro_export]
macro_rules! write_context {
    () => {
        $crate::HookContext::write_access($crate::hook_fn_name!())
    };
}
