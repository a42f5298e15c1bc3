// Copyright (c) Contributors to the redirfs project.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[cfg(test)]
#[path = "./redirection_test.rs"]
mod redirection_test;

/// Maps the paths that hooked processes ask for onto the paths that
/// actually get opened.
///
/// The hook context only ever reaches a table through its guards,
/// so implementations need no locking of their own: queries happen
/// under read access and every change under write access.
pub trait RedirectionTable: Send + Sync + std::fmt::Debug {
    /// The real location of a virtual path, if it is redirected at all
    fn query(&self, virtual_path: &Path) -> Option<PathBuf>;

    /// Redirect a virtual path, returning the previous target if any
    fn insert(&mut self, virtual_path: PathBuf, real_path: PathBuf) -> Option<PathBuf>;

    /// Stop redirecting a virtual path, returning its target if any
    fn remove(&mut self, virtual_path: &Path) -> Option<PathBuf>;

    /// The number of redirected paths
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A table that only redirects exact path matches.
#[derive(Debug, Default, Clone)]
pub struct FlatRedirectionTable {
    entries: BTreeMap<PathBuf, PathBuf>,
}

impl FlatRedirectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// All redirections, ordered by virtual path
    pub fn iter(&self) -> impl Iterator<Item = (&Path, &Path)> {
        self.entries
            .iter()
            .map(|(from, to)| (from.as_path(), to.as_path()))
    }
}

impl RedirectionTable for FlatRedirectionTable {
    fn query(&self, virtual_path: &Path) -> Option<PathBuf> {
        self.entries.get(virtual_path).cloned()
    }

    fn insert(&mut self, virtual_path: PathBuf, real_path: PathBuf) -> Option<PathBuf> {
        tracing::trace!(from = ?virtual_path, to = ?real_path, "add redirection");
        self.entries.insert(virtual_path, real_path)
    }

    fn remove(&mut self, virtual_path: &Path) -> Option<PathBuf> {
        self.entries.remove(virtual_path)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<P, Q> FromIterator<(P, Q)> for FlatRedirectionTable
where
    P: Into<PathBuf>,
    Q: Into<PathBuf>,
{
    fn from_iter<I: IntoIterator<Item = (P, Q)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(from, to)| (from.into(), to.into()))
                .collect(),
        }
    }
}
