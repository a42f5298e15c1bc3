// Copyright (c) Contributors to the redirfs project.
// SPDX-License-Identifier: Apache-2.0

use std::ffi::c_void;
use std::path::{Path, PathBuf};

/// Identifies the binary module (library or executable) that hosts
/// the hook context.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ModuleHandle {
    path: PathBuf,
}

impl ModuleHandle {
    pub fn from_path<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// The module that this library was linked into.
    ///
    /// Falls back to the main executable when the loader cannot say.
    pub fn current() -> Self {
        let addr = Self::current as fn() -> Self as *const c_void;
        // the loader may only know the main executable by its argv[0]
        if let Some(module) = Self::containing(addr).filter(|m| m.path.is_absolute()) {
            return module;
        }
        match std::env::current_exe() {
            Ok(path) => Self { path },
            Err(err) => {
                tracing::warn!("unable to identify the hosting module: {err}");
                Self {
                    path: PathBuf::new(),
                }
            }
        }
    }

    /// The module whose image contains the given address
    #[cfg(unix)]
    pub fn containing(addr: *const c_void) -> Option<Self> {
        use std::ffi::{CStr, OsStr};
        use std::os::unix::ffi::OsStrExt;

        // Safety: dladdr only inspects the address and fills in the
        // struct, and the file name it returns is owned by the loader
        let path = unsafe {
            let mut info: libc::Dl_info = std::mem::zeroed();
            if libc::dladdr(addr, &mut info) == 0 || info.dli_fname.is_null() {
                return None;
            }
            let name = CStr::from_ptr(info.dli_fname);
            PathBuf::from(OsStr::from_bytes(name.to_bytes()))
        };
        if path.as_os_str().is_empty() {
            return None;
        }
        Some(Self { path })
    }

    /// The module whose image contains the given address
    #[cfg(windows)]
    pub fn containing(addr: *const c_void) -> Option<Self> {
        use std::ffi::OsString;
        use std::os::windows::ffi::OsStringExt;

        use windows::Win32::Foundation::HMODULE;
        use windows::Win32::System::LibraryLoader::{
            GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
            GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
            GetModuleFileNameW,
            GetModuleHandleExW,
        };
        use windows::core::PCWSTR;

        let mut module = HMODULE::default();
        let mut buffer = vec![0u16; 32 * 1024];
        // Safety: with FROM_ADDRESS the name argument is only used as an
        // address, and the buffer outlives the call that fills it
        let len = unsafe {
            GetModuleHandleExW(
                GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
                PCWSTR(addr as *const u16),
                &mut module,
            )
            .ok()?;
            GetModuleFileNameW(module, &mut buffer)
        } as usize;
        if len == 0 {
            return None;
        }
        Some(Self {
            path: OsString::from_wide(&buffer[..len]).into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::ModuleHandle;

    #[rstest]
    fn test_current_module_exists() {
        let module = ModuleHandle::current();
        assert!(
            module.path().exists(),
            "expected an existing module path, got {}",
            module.path().display()
        );
    }

    #[rstest]
    fn test_from_path_is_kept() {
        let module = ModuleHandle::from_path("/opt/hooks/libredirfs.so");
        assert_eq!(module.path(), std::path::Path::new("/opt/hooks/libredirfs.so"));
    }
}
