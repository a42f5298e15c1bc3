// Copyright (c) Contributors to the redirfs project.
// SPDX-License-Identifier: Apache-2.0

use std::any::{Any, type_name};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;

use crate::{Error, Result};

#[cfg(test)]
#[path = "./custom_data_test.rs"]
mod custom_data_test;

static NEXT_DATA_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies one slot of custom data in the hook context.
///
/// Ids are handed out by a process-wide counter, so two features
/// that each allocate their own id can never share a slot. Declare
/// ids with [`data_id!`](crate::data_id).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataId(u32);

impl DataId {
    /// Allocate an id that no other caller in this process will receive
    pub fn allocate() -> Self {
        Self(NEXT_DATA_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for DataId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Declare a static custom data id that is unique within the process.
///
/// ```
/// redirfs_hooks::data_id!(static OPEN_HANDLES);
///
/// let id: redirfs_hooks::DataId = *OPEN_HANDLES;
/// assert_eq!(id, *OPEN_HANDLES);
/// ```
#[macro_export]
macro_rules! data_id {
    ($(#[$meta:meta])* $vis:vis static $name:ident) => {
        $(#[$meta])*
        $vis static $name: $crate::once_cell::sync::Lazy<$crate::DataId> =
            $crate::once_cell::sync::Lazy::new($crate::DataId::allocate);
    };
}

struct Slot {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

/// Typed extension storage for hook features.
///
/// The registry keeps its own slot table consistent, but the values
/// themselves are shared with whoever asks for them: a feature that
/// uses a slot from several threads must synchronize it itself.
#[derive(Default)]
pub(crate) struct CustomDataRegistry {
    slots: DashMap<DataId, Slot>,
}

impl CustomDataRegistry {
    /// Get the value in a slot, creating it with its default on first use.
    ///
    /// The returned value stays the same for the lifetime of the
    /// registry, no matter how many other slots are created.
    pub(crate) fn get_or_default<T>(&self, id: DataId) -> Result<Arc<T>>
    where
        T: Any + Default + Send + Sync,
    {
        let (stored, value) = {
            let slot = self.slots.entry(id).or_insert_with(|| {
                tracing::trace!(%id, kind = type_name::<T>(), "creating custom data");
                Slot {
                    type_name: type_name::<T>(),
                    value: Arc::new(T::default()),
                }
            });
            (slot.type_name, Arc::clone(&slot.value))
        };
        value.downcast::<T>().map_err(|_| Error::CustomDataType {
            id,
            stored,
            requested: type_name::<T>(),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

impl std::fmt::Debug for CustomDataRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomDataRegistry")
            .field("slots", &self.slots.len())
            .finish()
    }
}
