// Copyright (c) Contributors to the redirfs project.
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Errors from creating or attaching shared configuration records.
#[derive(Diagnostic, Debug, Error)]
pub enum Error {
    /// The session parameters cannot be published.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Parameters(#[from] redirfs_config::Error),

    /// A shared memory segment could not be opened or mapped.
    #[error("Failed to open shared memory segment {0}")]
    SegmentOpen(PathBuf, #[source] io::Error),

    /// A shared memory segment could not be removed.
    #[error("Failed to remove shared memory segment {0}")]
    SegmentRemove(PathBuf, #[source] io::Error),

    /// A segment name that cannot be used for shared memory.
    #[error("Invalid shared memory segment name {0:?}")]
    InvalidSegmentName(String),

    /// The mapped region cannot hold the configuration record.
    #[error("Shared memory region is too small ({len} bytes, {required} required)")]
    RegionTooSmall {
        /// The length of the mapped region
        len: usize,
        /// The size of the record
        required: usize,
    },

    /// The mapped region is not suitably aligned for the record.
    #[error("Shared memory region is not aligned to {0} bytes")]
    RegionMisaligned(usize),

    /// The segment holds something other than a record of this version.
    #[error(
        "Shared memory segment {name} holds an incompatible record (magic {magic:#010x}, version {version})"
    )]
    #[diagnostic(
        code("redirfs::incompatible_record"),
        help("All processes of a session must use the same redirfs version")
    )]
    IncompatibleRecord {
        /// The segment name
        name: String,
        /// The magic value found in the segment
        magic: u32,
        /// The layout version found in the segment
        version: u32,
    },

    /// Another process began creating the record but never finished.
    #[error("Timed out waiting for shared memory segment {0} to be initialized")]
    InitializationTimeout(String),
}

/// A specialized result for shared configuration operations
pub type Result<T> = std::result::Result<T, Error>;
