// Copyright (c) Contributors to the redirfs project.
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{Error, Result};

#[cfg(test)]
#[path = "./parameters_test.rs"]
mod parameters_test;

/// The longest session token that fits in the shared record
pub const MAX_INSTANCE_NAME_LEN: usize = 63;
/// The longest crash dump directory that fits in the shared record, in bytes
pub const MAX_CRASH_DUMPS_PATH_LEN: usize = 511;

/// Prefix of environment variables that override loaded parameters
const ENV_PREFIX: &str = "REDIRFS_";
static DEFAULT_INSTANCE_NAME: &str = "redirfs";

/// Names of the fields that can be set through the environment.
///
/// Other `REDIRFS_*` variables (eg: `REDIRFS_LOG`) are not parameters.
const ENV_FIELDS: &[&str] = &[
    "instance_name",
    "debug_mode",
    "log_level",
    "crash_dumps_type",
    "crash_dumps_path",
    "delay_process_ms",
];

/// The minimum severity written to the session log
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString, Deserialize, Serialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    #[default]
    Info = 1,
    Warning = 2,
    Error = 3,
}

impl LogLevel {
    pub fn as_raw(self) -> u8 {
        self as u8
    }

    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Debug),
            1 => Some(Self::Info),
            2 => Some(Self::Warning),
            3 => Some(Self::Error),
            _ => None,
        }
    }
}

/// How much of a crashing process should be written to its dump
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString, Deserialize, Serialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CrashDumpsType {
    #[default]
    None = 0,
    Mini = 1,
    Data = 2,
    Full = 3,
}

impl CrashDumpsType {
    pub fn as_raw(self) -> u8 {
        self as u8
    }

    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Mini),
            2 => Some(Self::Data),
            3 => Some(Self::Full),
            _ => None,
        }
    }
}

/// Settings for one redirfs session.
///
/// The process that creates a session publishes these values in
/// the shared configuration record, and every process that joins
/// the session later reads them back from there.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Parameters {
    /// The session token, common to all cooperating processes
    pub instance_name: String,
    /// Enables extra diagnostics in every process of the session
    pub debug_mode: bool,
    pub log_level: LogLevel,
    pub crash_dumps_type: CrashDumpsType,
    /// Directory that crash dumps are written into, empty to
    /// use the platform default
    pub crash_dumps_path: PathBuf,
    /// Milliseconds that newly hooked processes wait before resuming,
    /// which gives a debugger time to attach
    pub delay_process_ms: u64,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            instance_name: DEFAULT_INSTANCE_NAME.to_string(),
            debug_mode: false,
            log_level: LogLevel::default(),
            crash_dumps_type: CrashDumpsType::default(),
            crash_dumps_path: PathBuf::new(),
            delay_process_ms: 0,
        }
    }
}

impl Parameters {
    /// Default parameters for the named session
    pub fn new<S: Into<String>>(instance_name: S) -> Self {
        Self {
            instance_name: instance_name.into(),
            ..Default::default()
        }
    }

    /// Parse parameters from a toml document
    pub fn load_string<S: AsRef<str>>(conf: S) -> Result<Self> {
        use config::{Config as RawConfig, File, FileFormat};

        let config = RawConfig::builder()
            .add_source(File::from_str(conf.as_ref(), FileFormat::Toml))
            .build()?;
        Ok(Self::deserialize(config)?)
    }

    /// Check that these parameters can be published in a shared record
    pub fn validate(&self) -> Result<()> {
        validate_session_token(&self.instance_name)?;
        // other builds read the path back as utf-8
        if self.crash_dumps_path.to_str().is_none() {
            return Err(Error::InvalidPath(self.crash_dumps_path.clone()));
        }
        let path_len = self.crash_dumps_path.as_os_str().len();
        if path_len > MAX_CRASH_DUMPS_PATH_LEN {
            return Err(Error::FieldTooLong {
                field: "crash_dumps_path",
                len: path_len,
                max: MAX_CRASH_DUMPS_PATH_LEN,
            });
        }
        Ok(())
    }

    /// The name of the shared memory segment that holds this
    /// session's configuration record
    pub fn segment_name(&self) -> String {
        format!("redirfs-{}", self.instance_name)
    }

    pub fn delay_process(&self) -> Duration {
        Duration::from_millis(self.delay_process_ms)
    }
}

/// Ensure that the given token can name a session.
///
/// The token becomes part of a shared memory name, so only a
/// conservative set of characters is allowed.
pub fn validate_session_token(token: &str) -> Result<()> {
    let valid_char = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.');
    if token.is_empty()
        || token.len() > MAX_INSTANCE_NAME_LEN
        || token.starts_with('.')
        || !token.chars().all(valid_char)
    {
        return Err(Error::InvalidSessionToken(token.to_string()));
    }
    Ok(())
}

/// Load the session parameters from disk.
///
/// This includes the system and user configurations (if they exist), then
/// any `REDIRFS_*` environment overrides. When given, `instance_name`
/// takes precedence over every other source.
pub fn load_parameters(instance_name: Option<&str>) -> Result<Parameters> {
    let user_config = dirs::config_dir().map(|dir| dir.join("redirfs").join("redirfs"));
    load_parameters_from(user_config.as_deref(), instance_name)
}

/// Load the session parameters, reading the user configuration
/// from the given file path (without extension) instead of the default.
pub fn load_parameters_from(
    user_config: Option<&Path>,
    instance_name: Option<&str>,
) -> Result<Parameters> {
    use config::{Config as RawConfig, File};

    // the configs can be in any supported format: toml, yaml, json, ini, etc
    let mut config_builder =
        RawConfig::builder().add_source(File::with_name("/etc/redirfs").required(false));
    if let Some(user_config) = user_config {
        let Some(name) = user_config.to_str() else {
            return Err(Error::InvalidPath(user_config.to_owned()));
        };
        config_builder = config_builder.add_source(File::with_name(name).required(false));
    }

    // unrelated variables of the host process may hold any bytes at all
    for (var, value) in std::env::vars_os() {
        let Some(tail) = var.to_str().and_then(|var| var.strip_prefix(ENV_PREFIX)) else {
            continue;
        };
        let key = tail.to_lowercase();
        if !ENV_FIELDS.contains(&key.as_str()) {
            continue;
        }
        let Some(value) = value.to_str() else {
            tracing::warn!(
                var = %var.to_string_lossy(),
                "ignoring environment override that is not valid utf-8"
            );
            continue;
        };
        config_builder = config_builder.set_override(key, value)?;
    }

    if let Some(instance_name) = instance_name {
        config_builder = config_builder.set_override("instance_name", instance_name)?;
    }

    let config = config_builder.build()?;
    let params = Parameters::deserialize(config)?;
    tracing::debug!(instance = %params.instance_name, "loaded session parameters");
    Ok(params)
}
