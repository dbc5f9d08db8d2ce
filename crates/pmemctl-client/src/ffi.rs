//! C ABI for loading and unloading of the driver.
//!
//! Mirrors the classic two-call surface consumed by C tooling: load the
//! driver before use, unload it afterwards. Returns zero on success and a
//! negative errno on failure.

use pmemctl_core::lifecycle::{LifecycleConfig, LifecycleError, LifecycleManager, LinuxHost};
use std::ffi::{c_char, c_int, CStr};
use std::path::Path;
use std::sync::Arc;

fn errno_of(err: &LifecycleError) -> c_int {
    match err {
        LifecycleError::PermissionDenied => libc::EPERM,
        LifecycleError::AlreadyInProgress | LifecycleError::Busy => libc::EBUSY,
        LifecycleError::InvalidState(_) => libc::ENODEV,
        LifecycleError::LoadFailed(source) | LifecycleError::UnloadFailed(source) => {
            source.raw_os_error().unwrap_or(libc::EIO)
        }
    }
}

fn manager() -> LifecycleManager {
    LifecycleManager::new(Arc::new(LinuxHost), LifecycleConfig::default())
}

/// pmem_load - load the acquisition driver
/// @path: pointer to a string with the path to the driver object
///
/// This must be called to load the driver prior to using it.
///
/// Returns zero on success, or -EXXX on failure
#[unsafe(no_mangle)]
pub extern "C" fn pmem_load(path: *const c_char) -> c_int {
    if path.is_null() {
        return -libc::EINVAL;
    }
    let Ok(path) = unsafe { CStr::from_ptr(path) }.to_str() else {
        return -libc::EINVAL;
    };

    match manager().load(Path::new(path)) {
        Ok(()) => 0,
        Err(err) => -errno_of(&err),
    }
}

/// pmem_unload - unload the acquisition driver
///
/// This can be called to unload the driver after using it, also from a
/// different process than the one that loaded it.
///
/// Returns zero on success, or -EXXX on failure
#[unsafe(no_mangle)]
pub extern "C" fn pmem_unload() -> c_int {
    let mgr = manager();
    if !mgr.adopt_running() {
        return -libc::ENODEV;
    }
    match mgr.unload() {
        Ok(()) => 0,
        Err(err) => -errno_of(&err),
    }
}
