//! Driver lifecycle: load and unload of the kernel image and device node.
//!
//! The state machine is strictly sequential
//! (`Unloaded -> Loading -> Loaded -> Unloading -> Unloaded`) and guarded by
//! a single lifecycle lock. A second load or unload attempted while a
//! transition is in flight fails fast with `AlreadyInProgress` instead of
//! blocking. Load is all-or-nothing: if the device node cannot be created
//! the freshly inserted image is rolled back. Unload removes the node first
//! and surfaces a failed image removal as the fatal `UnloadFailed` it is.

use crate::mapper::WindowPool;
use log::{debug, error, warn};
use std::collections::HashSet;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Lifecycle state of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// No image inserted, no device node.
    Unloaded,
    /// Load transition in flight.
    Loading,
    /// Image inserted and device node present.
    Loaded,
    /// Unload transition in flight, or a previous unload failed partway.
    Unloading,
}

/// Errors produced by lifecycle transitions.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The caller lacks the privilege to manage kernel modules.
    #[error("elevated privileges required to load or unload the driver")]
    PermissionDenied,
    /// Another load or unload is in flight.
    #[error("another lifecycle transition is in progress")]
    AlreadyInProgress,
    /// Mapping windows are still active; the driver cannot be unloaded.
    #[error("driver is busy: mapping windows still active")]
    Busy,
    /// The transition is not valid from the current state.
    #[error("operation not valid in driver state {0:?}")]
    InvalidState(DriverState),
    /// Load failed; any partial work was rolled back.
    #[error("driver load failed")]
    LoadFailed(#[source] io::Error),
    /// Image removal failed after the device node was already gone. Fatal:
    /// no automatic retry, the operator must resolve the lingering
    /// reference.
    #[error("driver unload failed; manual cleanup may be required")]
    UnloadFailed(#[source] io::Error),
}

/// Host operations the lifecycle manager needs.
///
/// The production implementation is [`LinuxHost`]; tests script a
/// [`MockHost`] to drive the state machine through every failure path
/// without touching the running kernel.
pub trait ModuleHost: Send + Sync {
    /// Returns true if the caller may manage kernel modules.
    fn is_privileged(&self) -> bool;

    /// Inserts the driver image with the given parameter string.
    fn insert_module(&self, image: &Path, param: &str) -> io::Result<()>;

    /// Removes the driver image by module name.
    fn remove_module(&self, name: &str) -> io::Result<()>;

    /// Creates the character device node.
    fn create_node(&self, path: &Path, major: u32) -> io::Result<()>;

    /// Removes the device node.
    fn remove_node(&self, path: &Path) -> io::Result<()>;

    /// Returns true if the device node exists.
    fn node_exists(&self, path: &Path) -> bool;
}

/// Lifecycle configuration.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Kernel module name, as known to the module loader.
    pub module_name: String,
    /// Device node path created on load.
    pub device_path: PathBuf,
    /// Character device major number, passed to the module as a parameter.
    pub major: u32,
    /// How long unload waits for in-flight reads to drain before reporting
    /// `Busy`.
    pub drain_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        LifecycleConfig {
            module_name: "pmemctl".into(),
            device_path: PathBuf::from("/dev/pmemctl"),
            major: 42,
            drain_timeout: Duration::from_millis(200),
        }
    }
}

/// Serializes load/unload and tracks the driver state.
pub struct LifecycleManager {
    host: Arc<dyn ModuleHost>,
    config: LifecycleConfig,
    state: Mutex<DriverState>,
    pool: Option<Arc<WindowPool>>,
}

impl LifecycleManager {
    /// Creates a manager over `host`.
    pub fn new(host: Arc<dyn ModuleHost>, config: LifecycleConfig) -> Self {
        LifecycleManager {
            host,
            config,
            state: Mutex::new(DriverState::Unloaded),
            pool: None,
        }
    }

    /// Attaches the mapper's window pool so unload can check for in-flight
    /// reads. Without a pool the busy check is left to the kernel's own
    /// reference counting.
    pub fn set_window_pool(&mut self, pool: Arc<WindowPool>) {
        self.pool = Some(pool);
    }

    /// The device node path this manager creates and removes.
    pub fn device_path(&self) -> &Path {
        &self.config.device_path
    }

    /// Current driver state.
    pub fn state(&self) -> DriverState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns true if the device node currently exists.
    pub fn node_ready(&self) -> bool {
        self.host.node_exists(&self.config.device_path)
    }

    /// Adopts a driver loaded by someone else.
    ///
    /// A fresh manager starts in `Unloaded` even when a previous process
    /// already inserted the driver. If the device node exists, the state
    /// becomes `Loaded` so `unload` can run. Returns true if the driver is
    /// loaded afterwards.
    pub fn adopt_running(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == DriverState::Unloaded && self.host.node_exists(&self.config.device_path) {
            debug!("adopting already-loaded driver");
            *state = DriverState::Loaded;
        }
        *state == DriverState::Loaded
    }

    fn lock_state(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, DriverState>, LifecycleError> {
        match self.state.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(LifecycleError::AlreadyInProgress),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        }
    }

    /// Loads the driver image and creates the device node.
    ///
    /// Only valid from `Unloaded`. All-or-nothing: if node creation fails
    /// the image is removed again before the error is returned.
    pub fn load(&self, image: &Path) -> Result<(), LifecycleError> {
        let mut state = self.lock_state()?;
        if *state != DriverState::Unloaded {
            return Err(LifecycleError::InvalidState(*state));
        }
        if !self.host.is_privileged() {
            return Err(LifecycleError::PermissionDenied);
        }

        *state = DriverState::Loading;
        let param = format!("major={}", self.config.major);
        debug!("inserting {} with {:?}", image.display(), param);
        if let Err(err) = self.host.insert_module(image, &param) {
            error!("module was rejected: {}", err);
            *state = DriverState::Unloaded;
            return Err(load_error(err));
        }

        if let Err(err) = self
            .host
            .create_node(&self.config.device_path, self.config.major)
        {
            error!(
                "failed to create {}: {}; rolling back module",
                self.config.device_path.display(),
                err
            );
            if let Err(rollback) = self.host.remove_module(&self.config.module_name) {
                // Image is inserted with no node to reach it. Surface the
                // original failure; the operator must remove the module.
                error!("rollback failed, module left inserted: {}", rollback);
            }
            *state = DriverState::Unloaded;
            return Err(LifecycleError::LoadFailed(err));
        }

        *state = DriverState::Loaded;
        Ok(())
    }

    /// Removes the device node and the driver image.
    ///
    /// Valid from `Loaded`, and from `Unloading` to retry after a failed
    /// image removal. Refuses with `Busy` while mapping windows are active.
    pub fn unload(&self) -> Result<(), LifecycleError> {
        let mut state = self.lock_state()?;
        if !matches!(*state, DriverState::Loaded | DriverState::Unloading) {
            return Err(LifecycleError::InvalidState(*state));
        }
        if !self.host.is_privileged() {
            return Err(LifecycleError::PermissionDenied);
        }
        self.drain_windows()?;

        *state = DriverState::Unloading;
        if self.host.node_exists(&self.config.device_path) {
            if let Err(err) = self.host.remove_node(&self.config.device_path) {
                error!(
                    "failed to remove {}: {}",
                    self.config.device_path.display(),
                    err
                );
                *state = DriverState::Loaded;
                return Err(LifecycleError::UnloadFailed(err));
            }
        }

        if let Err(err) = self.host.remove_module(&self.config.module_name) {
            // The node is gone but the image stayed behind, typically a
            // lingering reference. Do not recreate the node; report the
            // condition and let the operator retry or escalate.
            error!("failed to remove module: {}", err);
            return Err(LifecycleError::UnloadFailed(err));
        }

        *state = DriverState::Unloaded;
        Ok(())
    }

    fn drain_windows(&self) -> Result<(), LifecycleError> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };
        let deadline = Instant::now() + self.config.drain_timeout;
        while pool.active() > 0 {
            if Instant::now() >= deadline {
                warn!("{} mapping windows still active", pool.active());
                return Err(LifecycleError::Busy);
            }
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

fn load_error(err: io::Error) -> LifecycleError {
    match err.raw_os_error() {
        Some(libc::EPERM) | Some(libc::EACCES) => LifecycleError::PermissionDenied,
        _ => LifecycleError::LoadFailed(err),
    }
}

/// Production host backed by Linux syscalls.
pub struct LinuxHost;

impl ModuleHost for LinuxHost {
    fn is_privileged(&self) -> bool {
        // CAP_SYS_MODULE would be enough; euid 0 is the common case.
        unsafe { libc::geteuid() == 0 }
    }

    fn insert_module(&self, image: &Path, param: &str) -> io::Result<()> {
        let file = File::open(image)?;
        let param = CString::new(param)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in module parameter"))?;
        let rc = unsafe {
            libc::syscall(
                libc::SYS_finit_module,
                file.as_raw_fd(),
                param.as_ptr(),
                0,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn remove_module(&self, name: &str) -> io::Result<()> {
        let name = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in module name"))?;
        let rc = unsafe { libc::syscall(libc::SYS_delete_module, name.as_ptr(), libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn create_node(&self, path: &Path, major: u32) -> io::Result<()> {
        let cpath = cstring_path(path)?;
        let rc = unsafe {
            libc::mknod(
                cpath.as_ptr(),
                libc::S_IFCHR | 0o444,
                libc::makedev(major, 0),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // an existing node is silently reused
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(err);
            }
        }
        Ok(())
    }

    fn remove_node(&self, path: &Path) -> io::Result<()> {
        let cpath = cstring_path(path)?;
        let rc = unsafe { libc::unlink(cpath.as_ptr()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err);
            }
        }
        Ok(())
    }

    fn node_exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

fn cstring_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in path"))
}

/// Scriptable in-memory host.
///
/// Tracks inserted modules and created nodes in hash sets and can be told
/// to fail or delay individual operations. Lets the state machine be driven
/// through rollback and failure paths on machines where loading a real
/// module is not an option.
#[derive(Default)]
pub struct MockHost {
    privileged: Mutex<bool>,
    modules: Mutex<HashSet<String>>,
    nodes: Mutex<HashSet<PathBuf>>,
    fail_insert: Mutex<Option<i32>>,
    fail_create_node: Mutex<Option<i32>>,
    fail_remove_module: Mutex<Option<i32>>,
    insert_delay: Mutex<Duration>,
}

impl MockHost {
    /// Creates a privileged mock host with no scripted failures.
    pub fn new() -> Arc<Self> {
        let host = MockHost::default();
        *host.privileged.lock().unwrap() = true;
        Arc::new(host)
    }

    /// Drops the privilege the host reports.
    pub fn deny_privilege(&self) {
        *self.privileged.lock().unwrap() = false;
    }

    /// Fails the next module insertion with `errno`.
    pub fn fail_next_insert(&self, errno: i32) {
        *self.fail_insert.lock().unwrap() = Some(errno);
    }

    /// Fails the next node creation with `errno`.
    pub fn fail_next_create_node(&self, errno: i32) {
        *self.fail_create_node.lock().unwrap() = Some(errno);
    }

    /// Fails module removals with `errno` until cleared with errno 0.
    pub fn fail_remove_module(&self, errno: i32) {
        *self.fail_remove_module.lock().unwrap() = if errno == 0 { None } else { Some(errno) };
    }

    /// Stalls insertions, so a concurrent load can be observed mid-flight.
    pub fn set_insert_delay(&self, delay: Duration) {
        *self.insert_delay.lock().unwrap() = delay;
    }

    /// Number of modules currently inserted.
    pub fn module_count(&self) -> usize {
        self.modules.lock().unwrap().len()
    }

    /// Number of device nodes currently present.
    pub fn node_count(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }
}

impl ModuleHost for MockHost {
    fn is_privileged(&self) -> bool {
        *self.privileged.lock().unwrap()
    }

    fn insert_module(&self, image: &Path, _param: &str) -> io::Result<()> {
        let delay = *self.insert_delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if let Some(errno) = self.fail_insert.lock().unwrap().take() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        let name = image
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.modules.lock().unwrap().insert(name);
        Ok(())
    }

    fn remove_module(&self, _name: &str) -> io::Result<()> {
        if let Some(errno) = *self.fail_remove_module.lock().unwrap() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        self.modules.lock().unwrap().clear();
        Ok(())
    }

    fn create_node(&self, path: &Path, _major: u32) -> io::Result<()> {
        if let Some(errno) = self.fail_create_node.lock().unwrap().take() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        self.nodes.lock().unwrap().insert(path.to_path_buf());
        Ok(())
    }

    fn remove_node(&self, path: &Path) -> io::Result<()> {
        self.nodes.lock().unwrap().remove(path);
        Ok(())
    }

    fn node_exists(&self, path: &Path) -> bool {
        self.nodes.lock().unwrap().contains(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(host: Arc<MockHost>) -> LifecycleManager {
        LifecycleManager::new(host, LifecycleConfig::default())
    }

    #[test]
    fn load_unload_cycle() {
        let host = MockHost::new();
        let mgr = manager(Arc::clone(&host));
        assert_eq!(mgr.state(), DriverState::Unloaded);

        mgr.load(Path::new("pmemctl.ko")).unwrap();
        assert_eq!(mgr.state(), DriverState::Loaded);
        assert!(mgr.node_ready());
        assert_eq!(host.module_count(), 1);

        mgr.unload().unwrap();
        assert_eq!(mgr.state(), DriverState::Unloaded);
        assert_eq!(host.module_count(), 0);
        assert_eq!(host.node_count(), 0);
    }

    #[test]
    fn load_requires_privilege() {
        let host = MockHost::new();
        host.deny_privilege();
        let mgr = manager(host);
        assert!(matches!(
            mgr.load(Path::new("pmemctl.ko")),
            Err(LifecycleError::PermissionDenied)
        ));
        assert_eq!(mgr.state(), DriverState::Unloaded);
    }

    #[test]
    fn load_from_loaded_is_invalid() {
        let host = MockHost::new();
        let mgr = manager(host);
        mgr.load(Path::new("pmemctl.ko")).unwrap();
        assert!(matches!(
            mgr.load(Path::new("pmemctl.ko")),
            Err(LifecycleError::InvalidState(DriverState::Loaded))
        ));
    }

    #[test]
    fn node_creation_failure_rolls_back_image() {
        let host = MockHost::new();
        host.fail_next_create_node(libc::ENOSPC);
        let mgr = manager(Arc::clone(&host));

        assert!(matches!(
            mgr.load(Path::new("pmemctl.ko")),
            Err(LifecycleError::LoadFailed(_))
        ));
        assert_eq!(mgr.state(), DriverState::Unloaded);
        assert_eq!(host.module_count(), 0);
        assert_eq!(host.node_count(), 0);
    }

    #[test]
    fn insert_eperm_maps_to_permission_denied() {
        let host = MockHost::new();
        host.fail_next_insert(libc::EPERM);
        let mgr = manager(host);
        assert!(matches!(
            mgr.load(Path::new("pmemctl.ko")),
            Err(LifecycleError::PermissionDenied)
        ));
    }

    #[test]
    fn concurrent_load_fails_fast() {
        let host = MockHost::new();
        host.set_insert_delay(Duration::from_millis(100));
        let mgr = Arc::new(manager(Arc::clone(&host)));

        let first = {
            let mgr = Arc::clone(&mgr);
            thread::spawn(move || mgr.load(Path::new("pmemctl.ko")))
        };
        // give the first load time to take the lifecycle lock
        thread::sleep(Duration::from_millis(20));
        assert!(matches!(
            mgr.load(Path::new("pmemctl.ko")),
            Err(LifecycleError::AlreadyInProgress)
        ));
        first.join().unwrap().unwrap();
        assert_eq!(mgr.state(), DriverState::Loaded);
    }

    #[test]
    fn unload_refuses_while_windows_active() {
        let host = MockHost::new();
        let pool = WindowPool::new(4);
        let mut mgr = manager(host);
        mgr.config.drain_timeout = Duration::from_millis(20);
        mgr.set_window_pool(Arc::clone(&pool));
        mgr.load(Path::new("pmemctl.ko")).unwrap();

        let permit = pool.try_acquire().unwrap();
        assert!(matches!(mgr.unload(), Err(LifecycleError::Busy)));
        assert_eq!(mgr.state(), DriverState::Loaded);

        drop(permit);
        mgr.unload().unwrap();
        assert_eq!(mgr.state(), DriverState::Unloaded);
    }

    #[test]
    fn failed_image_removal_is_fatal_but_retryable() {
        let host = MockHost::new();
        host.fail_remove_module(libc::EBUSY);
        let mgr = manager(Arc::clone(&host));
        mgr.load(Path::new("pmemctl.ko")).unwrap();

        assert!(matches!(mgr.unload(), Err(LifecycleError::UnloadFailed(_))));
        // node stays gone, image stays behind
        assert_eq!(host.node_count(), 0);
        assert_eq!(host.module_count(), 1);
        assert_eq!(mgr.state(), DriverState::Unloading);

        // once the lingering reference clears, a retry succeeds
        host.fail_remove_module(0);
        mgr.unload().unwrap();
        assert_eq!(mgr.state(), DriverState::Unloaded);
        assert_eq!(host.module_count(), 0);
    }

    #[test]
    fn repeated_cycles_leak_nothing() {
        let host = MockHost::new();
        let mgr = manager(Arc::clone(&host));
        for _ in 0..100 {
            mgr.load(Path::new("pmemctl.ko")).unwrap();
            mgr.unload().unwrap();
        }
        assert_eq!(host.module_count(), 0);
        assert_eq!(host.node_count(), 0);
    }
}
