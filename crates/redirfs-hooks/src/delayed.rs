// Copyright (c) Contributors to the redirfs project.
// SPDX-License-Identifier: Apache-2.0

use std::thread::JoinHandle;

use crate::call_guard::panic_message;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./delayed_test.rs"]
mod delayed_test;

/// Background work started by a hook that must finish before the
/// hook context is destroyed.
///
/// The work reports an exit code, where zero means success.
#[derive(Debug)]
pub struct DelayedWork {
    label: String,
    handle: JoinHandle<i32>,
}

impl DelayedWork {
    /// Run `work` on a new thread named after `label`
    pub fn spawn<L, F>(label: L, work: F) -> Result<Self>
    where
        L: Into<String>,
        F: FnOnce() -> i32 + Send + 'static,
    {
        let label = label.into();
        let handle = std::thread::Builder::new()
            .name(format!("redirfs-{label}"))
            .spawn(work)
            .map_err(|err| Error::SpawnDelayed(label.clone(), err))?;
        tracing::debug!(%label, "started background work");
        Ok(Self { label, handle })
    }

    /// Track a thread that was started elsewhere
    pub fn from_handle<L: Into<String>>(label: L, handle: JoinHandle<i32>) -> Self {
        Self {
            label: label.into(),
            handle,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// True once the work has returned or panicked
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the work is done and return its exit code
    pub fn wait(self) -> Result<i32> {
        let Self { label, handle } = self;
        handle.join().map_err(|payload| Error::DelayedPanicked {
            label,
            message: panic_message(payload.as_ref()),
        })
    }
}

/// Wait for every item of work, returning how many of them failed.
///
/// Failures are logged and otherwise ignored, so one broken item
/// never keeps the others from being waited on.
pub fn drain_delayed(work: Vec<DelayedWork>) -> usize {
    let mut failures = 0;
    for item in work {
        let label = item.label.clone();
        match item.wait() {
            Ok(0) => tracing::trace!(%label, "background work finished"),
            Ok(code) => {
                failures += 1;
                tracing::warn!(%label, %code, "background work failed");
            }
            Err(err) => {
                failures += 1;
                tracing::error!(%label, "{err}");
            }
        }
    }
    failures
}
