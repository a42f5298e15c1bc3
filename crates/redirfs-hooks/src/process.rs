// Copyright (c) Contributors to the redirfs project.
// SPDX-License-Identifier: Apache-2.0

/// The id of the calling process
pub fn current_process_id() -> u32 {
    std::process::id()
}

/// Check if the identified process is still running.
///
/// The answer can be stale by the time it is used, and a recycled
/// pid is reported as alive.
#[cfg(unix)]
pub fn process_is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // exists, but belongs to someone we cannot signal
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Check if the identified process is still running.
///
/// The answer can be stale by the time it is used, and a recycled
/// pid is reported as alive.
#[cfg(windows)]
pub fn process_is_alive(pid: u32) -> bool {
    use windows::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
    use windows::Win32::System::Threading::{
        GetExitCodeProcess,
        OpenProcess,
        PROCESS_QUERY_LIMITED_INFORMATION,
    };

    // Safety: the handle is checked before use and closed afterwards
    unsafe {
        let Ok(handle) = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) else {
            return false;
        };
        let mut code = 0u32;
        let alive = GetExitCodeProcess(handle, &mut code).is_ok() && code == STILL_ACTIVE.0 as u32;
        let _ = CloseHandle(handle);
        alive
    }
}
