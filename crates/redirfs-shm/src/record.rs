// Copyright (c) Contributors to the redirfs project.
// SPDX-License-Identifier: Apache-2.0

use std::cell::UnsafeCell;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

use redirfs_config::{
    CrashDumpsType,
    LogLevel,
    MAX_CRASH_DUMPS_PATH_LEN,
    MAX_INSTANCE_NAME_LEN,
    Parameters,
};

use crate::{Error, Result};

#[cfg(test)]
#[path = "./record_test.rs"]
mod record_test;

/// Identifies a segment as holding a redirfs configuration record ("RDFS")
pub const RECORD_MAGIC: u32 = u32::from_le_bytes(*b"RDFS");
/// The layout version of [`SharedRecord`], bumped on any layout change
pub const RECORD_VERSION: u32 = 1;
/// The number of bytes that a configuration record occupies
pub const RECORD_SIZE: usize = std::mem::size_of::<SharedRecord>();

const STATE_EMPTY: u32 = 0;
const STATE_INITIALIZING: u32 = 1;
const STATE_READY: u32 = 2;

// one extra byte keeps every stored string nul-terminated
const INSTANCE_NAME_CAPACITY: usize = MAX_INSTANCE_NAME_LEN + 1;
const CRASH_DUMPS_PATH_CAPACITY: usize = MAX_CRASH_DUMPS_PATH_LEN + 1;

/// The configuration record, exactly as it is laid out in shared memory.
///
/// A zero-filled segment is a valid, empty record. Scalar settings
/// can change at any time and are atomics; the strings are written
/// once by the creating process before `state` is published as ready.
#[repr(C)]
pub(crate) struct SharedRecord {
    magic: AtomicU32,
    version: AtomicU32,
    state: AtomicU32,
    pub(crate) user_count: AtomicU32,
    pub(crate) delay_process_ms: AtomicU64,
    pub(crate) debug_mode: AtomicBool,
    pub(crate) log_level: AtomicU8,
    pub(crate) crash_dumps_type: AtomicU8,
    _reserved: [u8; 5],
    instance_name: WriteOnce<[u8; INSTANCE_NAME_CAPACITY]>,
    crash_dumps_path: WriteOnce<[u8; CRASH_DUMPS_PATH_CAPACITY]>,
}

/// Storage that is written by exactly one party before any reader
/// can observe it.
#[repr(transparent)]
struct WriteOnce<T>(UnsafeCell<T>);

impl<T: Copy> WriteOnce<T> {
    /// # Safety
    /// No other reference to the value may exist, which holds for the
    /// process that won the record initialization
    unsafe fn write(&self, value: T) {
        // Safety: exclusive access is guaranteed by the caller
        unsafe { *self.0.get() = value }
    }

    /// # Safety
    /// The value must have been published, and never be written again
    unsafe fn get(&self) -> &T {
        // Safety: the value is immutable once published
        unsafe { &*self.0.get() }
    }
}

/// The string fields of a record, encoded for their fixed-size slots
#[derive(Debug)]
pub(crate) struct EncodedStrings {
    instance_name: [u8; INSTANCE_NAME_CAPACITY],
    crash_dumps_path: [u8; CRASH_DUMPS_PATH_CAPACITY],
}

impl EncodedStrings {
    pub(crate) fn new(params: &Parameters) -> Result<Self> {
        let Some(crash_dumps_path) = params.crash_dumps_path.to_str() else {
            return Err(redirfs_config::Error::InvalidPath(params.crash_dumps_path.clone()).into());
        };
        Ok(Self {
            instance_name: encode("instance_name", &params.instance_name)?,
            crash_dumps_path: encode("crash_dumps_path", crash_dumps_path)?,
        })
    }
}

fn encode<const N: usize>(field: &'static str, value: &str) -> Result<[u8; N]> {
    let bytes = value.as_bytes();
    if bytes.len() >= N || bytes.contains(&0) {
        return Err(redirfs_config::Error::FieldTooLong {
            field,
            len: bytes.len(),
            max: N - 1,
        }
        .into());
    }
    let mut slot = [0; N];
    slot[..bytes.len()].copy_from_slice(bytes);
    Ok(slot)
}

fn decode(slot: &[u8]) -> String {
    let end = slot.iter().position(|b| *b == 0).unwrap_or(slot.len());
    String::from_utf8_lossy(&slot[..end]).into_owned()
}

impl SharedRecord {
    /// Claim the right to initialize this record.
    ///
    /// Exactly one caller ever receives true for a given segment.
    pub(crate) fn try_claim(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_EMPTY,
                STATE_INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Fill in a claimed record and publish it to every other user.
    ///
    /// # Safety
    /// The caller must have won [`Self::try_claim`] for this record
    pub(crate) unsafe fn initialize(&self, params: &Parameters, strings: &EncodedStrings) {
        // Safety: winning the claim gives us exclusive access until the
        // ready state is stored below, and no reader looks before that
        unsafe {
            self.instance_name.write(strings.instance_name);
            self.crash_dumps_path.write(strings.crash_dumps_path);
        }
        self.delay_process_ms
            .store(params.delay_process_ms, Ordering::Relaxed);
        self.debug_mode.store(params.debug_mode, Ordering::Relaxed);
        self.log_level
            .store(params.log_level.as_raw(), Ordering::Relaxed);
        self.crash_dumps_type
            .store(params.crash_dumps_type.as_raw(), Ordering::Relaxed);
        self.magic.store(RECORD_MAGIC, Ordering::Relaxed);
        self.version.store(RECORD_VERSION, Ordering::Relaxed);
        self.state.store(STATE_READY, Ordering::Release);
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_READY
    }

    /// Ensure that a ready record was written with this layout
    pub(crate) fn check_compatible(&self, name: &str) -> Result<()> {
        let magic = self.magic.load(Ordering::Relaxed);
        let version = self.version.load(Ordering::Relaxed);
        if magic != RECORD_MAGIC || version != RECORD_VERSION {
            return Err(Error::IncompatibleRecord {
                name: name.to_string(),
                magic,
                version,
            });
        }
        Ok(())
    }

    /// Copy the current settings out of the record.
    ///
    /// The record must be ready. Settings that are changed concurrently
    /// by another process may or may not be reflected.
    pub(crate) fn snapshot(&self) -> Parameters {
        debug_assert!(self.is_ready());
        // Safety: the strings were published along with the ready state,
        // which every caller has observed with acquire ordering
        let (instance_name, crash_dumps_path) =
            unsafe { (self.instance_name.get(), self.crash_dumps_path.get()) };
        Parameters {
            instance_name: decode(instance_name),
            debug_mode: self.debug_mode.load(Ordering::Acquire),
            log_level: self.log_level(),
            crash_dumps_type: self.crash_dumps_type(),
            crash_dumps_path: PathBuf::from(decode(crash_dumps_path)),
            delay_process_ms: self.delay_process_ms.load(Ordering::Acquire),
        }
    }

    pub(crate) fn log_level(&self) -> LogLevel {
        LogLevel::from_raw(self.log_level.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub(crate) fn crash_dumps_type(&self) -> CrashDumpsType {
        CrashDumpsType::from_raw(self.crash_dumps_type.load(Ordering::Acquire)).unwrap_or_default()
    }
}
