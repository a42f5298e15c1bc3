// Copyright (c) Contributors to the redirfs project.
// SPDX-License-Identifier: Apache-2.0

//! Session parameters shared by every process taking part in a
//! redirfs session.

mod error;
mod parameters;

pub use error::{Error, Result};

pub use self::parameters::*;
