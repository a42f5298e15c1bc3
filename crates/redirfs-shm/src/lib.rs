// Copyright (c) Contributors to the redirfs project.
// SPDX-License-Identifier: Apache-2.0

//! Session configuration shared between processes.
//!
//! The first process of a session creates a fixed-layout record in a
//! named shared memory segment and every later process attaches to
//! that same record. The memory transport is pluggable through the
//! [`SharedMemory`] trait.

#![deny(missing_docs)]

mod error;
mod memory;
mod parameters;
mod record;

pub use error::{Error, Result};
pub use memory::{FileMemory, LocalMemory, Region, SharedMemory};
pub use parameters::{Disposition, SharedParameters};
pub use record::{RECORD_MAGIC, RECORD_SIZE, RECORD_VERSION};
