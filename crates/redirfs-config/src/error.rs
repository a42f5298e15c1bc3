// Copyright (c) Contributors to the redirfs project.
// SPDX-License-Identifier: Apache-2.0

use miette::Diagnostic;
use thiserror::Error;

#[derive(Diagnostic, Debug, Error)]
pub enum Error {
    #[error("Invalid session token {0:?}")]
    #[diagnostic(
        code("redirfs::invalid_session_token"),
        help("Session tokens are 1 to 63 characters of letters, digits, '_', '-' or '.'")
    )]
    InvalidSessionToken(String),

    #[error("{field} is too long for the shared record ({len} bytes, at most {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("Invalid path {0}")]
    InvalidPath(std::path::PathBuf),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
