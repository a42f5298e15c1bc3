// Copyright (c) Contributors to the redirfs project.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use redirfs_config::{CrashDumpsType, LogLevel, Parameters};

use crate::record::{EncodedStrings, RECORD_SIZE, SharedRecord};
use crate::{Error, Region, Result, SharedMemory};

#[cfg(test)]
#[path = "./parameters_test.rs"]
mod parameters_test;

/// How long to wait for another process to finish creating a record
const INITIALIZATION_TIMEOUT: Duration = Duration::from_secs(5);
const INITIALIZATION_POLL: Duration = Duration::from_millis(1);

/// How an attachment came to reference its configuration record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// This attachment created and initialized the record
    Created,
    /// The record already existed and was initialized by someone else
    Attached,
}

/// An attachment to the configuration record of one session.
///
/// Every attachment counts as one user of the session. When the last
/// user drops its attachment, the shared segment is removed so that
/// the next session with the same token starts from fresh settings.
pub struct SharedParameters {
    memory: Arc<dyn SharedMemory>,
    name: String,
    region: Region,
    disposition: Disposition,
}

impl SharedParameters {
    /// Attach to the record of the session named in `params`, or create
    /// and initialize it with `params` if no process has done so yet.
    ///
    /// Only the creating call publishes its values. Later attachments
    /// see the values of the creator, whatever they passed in.
    #[tracing::instrument(skip_all, fields(instance = %params.instance_name))]
    pub fn attach(memory: Arc<dyn SharedMemory>, params: &Parameters) -> Result<Self> {
        params.validate()?;
        let strings = EncodedStrings::new(params)?;
        let name = params.segment_name();
        let region = memory.open(&name, RECORD_SIZE)?;
        if region.len() < RECORD_SIZE {
            return Err(Error::RegionTooSmall {
                len: region.len(),
                required: RECORD_SIZE,
            });
        }
        let align = std::mem::align_of::<SharedRecord>();
        if region.as_ptr() as usize % align != 0 {
            return Err(Error::RegionMisaligned(align));
        }

        // Safety: the region is large enough and aligned for the record, and
        // an all-zero record is valid, whatever state the segment is in
        let record = unsafe { &*(region.as_ptr() as *const SharedRecord) };
        let disposition = if record.try_claim() {
            // Safety: we won the claim for this record
            unsafe { record.initialize(params, &strings) };
            Disposition::Created
        } else {
            wait_until_ready(record, &name)?;
            Disposition::Attached
        };
        record.check_compatible(&name)?;
        let users = record.user_count.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(segment = %name, ?disposition, %users, "attached to shared configuration");

        Ok(Self {
            memory,
            name,
            region,
            disposition,
        })
    }

    fn record(&self) -> &SharedRecord {
        // Safety: validated and published when this attachment was created,
        // and the region stays mapped for as long as we hold it
        unsafe { &*(self.region.as_ptr() as *const SharedRecord) }
    }

    /// Whether this attachment created the record
    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    /// The name of the shared memory segment holding the record
    pub fn segment_name(&self) -> &str {
        &self.name
    }

    /// A copy of the session settings as they are right now.
    ///
    /// Settings changed concurrently by another process may be missed.
    pub fn snapshot(&self) -> Parameters {
        self.record().snapshot()
    }

    /// The session-wide debug flag
    pub fn debug_mode(&self) -> bool {
        self.record().debug_mode.load(Ordering::Acquire)
    }

    /// Change the debug flag for every process of the session
    pub fn set_debug_mode(&self, debug_mode: bool) {
        self.record()
            .debug_mode
            .store(debug_mode, Ordering::Release);
    }

    /// The session-wide log level
    pub fn log_level(&self) -> LogLevel {
        self.record().log_level()
    }

    /// Change the log level for every process of the session
    pub fn set_log_level(&self, level: LogLevel) {
        self.record()
            .log_level
            .store(level.as_raw(), Ordering::Release);
    }

    /// The session-wide crash dump type
    pub fn crash_dumps_type(&self) -> CrashDumpsType {
        self.record().crash_dumps_type()
    }

    /// Change the crash dump type for every process of the session
    pub fn set_crash_dumps_type(&self, dump_type: CrashDumpsType) {
        self.record()
            .crash_dumps_type
            .store(dump_type.as_raw(), Ordering::Release);
    }

    /// The number of attachments currently sharing the record
    pub fn user_count(&self) -> u32 {
        self.record().user_count.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for SharedParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedParameters")
            .field("name", &self.name)
            .field("disposition", &self.disposition)
            .field("region", &self.region)
            .finish()
    }
}

impl Drop for SharedParameters {
    fn drop(&mut self) {
        let previous = self.record().user_count.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |count| Some(count.saturating_sub(1)),
        );
        let remaining = previous.unwrap_or_default().saturating_sub(1);
        tracing::debug!(segment = %self.name, %remaining, "detached from shared configuration");
        if remaining > 0 {
            return;
        }
        if let Err(err) = self.memory.remove(&self.name) {
            tracing::warn!(segment = %self.name, "failed to remove unused shared configuration: {err}");
        }
    }
}

fn wait_until_ready(record: &SharedRecord, name: &str) -> Result<()> {
    let start = Instant::now();
    while !record.is_ready() {
        if start.elapsed() > INITIALIZATION_TIMEOUT {
            return Err(Error::InitializationTimeout(name.to_string()));
        }
        std::thread::sleep(INITIALIZATION_POLL);
    }
    Ok(())
}
