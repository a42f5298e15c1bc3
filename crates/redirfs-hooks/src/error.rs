// Copyright (c) Contributors to the redirfs project.
// SPDX-License-Identifier: Apache-2.0

use miette::Diagnostic;
use thiserror::Error;

use crate::DataId;

#[derive(Diagnostic, Debug, Error)]
pub enum Error {
    #[error("Failed to set up the session configuration")]
    #[diagnostic(code("redirfs::configuration"))]
    Configuration(#[source] redirfs_shm::Error),

    #[error("No hook context exists in this process")]
    #[diagnostic(
        code("redirfs::no_context"),
        help("The context is only available between its creation and destruction")
    )]
    NoContext,

    #[error("A hook context already exists in this process")]
    AlreadyCreated,

    #[error("Custom data {id} holds a {stored}, not a {requested}")]
    CustomDataType {
        id: DataId,
        stored: &'static str,
        requested: &'static str,
    },

    #[error("Failed to start background work '{0}'")]
    SpawnDelayed(String, #[source] std::io::Error),

    #[error("Background work '{label}' panicked: {message}")]
    DelayedPanicked { label: String, message: String },
}

impl Error {
    /// True for errors that make a session impossible to set up
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

impl From<redirfs_shm::Error> for Error {
    fn from(err: redirfs_shm::Error) -> Self {
        Self::Configuration(err)
    }
}

impl From<redirfs_config::Error> for Error {
    fn from(err: redirfs_config::Error) -> Self {
        Self::Configuration(err.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
