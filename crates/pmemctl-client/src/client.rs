//! The `Pmem` control handle.

use crate::device::{Device, IoctlDevice, Loopback};
use crate::error::{DeviceError, Error};
use log::{debug, info};
use pmemctl_core::lifecycle::{LifecycleConfig, LifecycleManager, LinuxHost};
use pmemctl_core::protocol::{AccessMode, DeviceHandler, DriverInfo, Request, Response};
use pmemctl_core::pte::Pte;
use pmemctl_core::protocol::{CTL_PTE_GET, CTL_PTE_SET};
use pmemctl_core::PhysAddr;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// How a `Pmem` handle obtains a device transport once the node exists.
pub type Connector = Box<dyn Fn(&Path) -> Result<Box<dyn Device>, DeviceError> + Send + Sync>;

const READY_TIMEOUT: Duration = Duration::from_millis(500);
const READY_POLL: Duration = Duration::from_millis(10);

/// Handle to the acquisition driver.
///
/// Owns the lifecycle manager and, once the driver is reachable, a device
/// transport. All operations are synchronous; the handle does not serialize
/// calls from multiple threads, callers that share one handle must do that
/// themselves.
pub struct Pmem {
    lifecycle: LifecycleManager,
    connector: Connector,
    device: Option<Box<dyn Device>>,
}

impl Pmem {
    /// Creates a handle for the running system with default configuration.
    pub fn new() -> Self {
        Self::with_config(LifecycleConfig::default())
    }

    /// Creates a handle for the running system.
    pub fn with_config(config: LifecycleConfig) -> Self {
        let lifecycle = LifecycleManager::new(Arc::new(LinuxHost), config);
        Self::with_parts(
            lifecycle,
            Box::new(|path| Ok(Box::new(IoctlDevice::open(path)?) as Box<dyn Device>)),
        )
    }

    /// Creates a handle from explicit parts.
    ///
    /// This is the seam tests and simulations use: a scripted lifecycle
    /// manager and a connector that hands out [`Loopback`] transports.
    pub fn with_parts(lifecycle: LifecycleManager, connector: Connector) -> Self {
        Pmem {
            lifecycle,
            connector,
            device: None,
        }
    }

    /// Creates a fully in-process handle over `handler`.
    ///
    /// The lifecycle manager still drives its host; reads short-circuit
    /// into the handler instead of crossing a device node.
    pub fn loopback(lifecycle: LifecycleManager, handler: Arc<DeviceHandler>) -> Self {
        Self::with_parts(
            lifecycle,
            Box::new(move |_| Ok(Box::new(Loopback::new(Arc::clone(&handler))) as Box<dyn Device>)),
        )
    }

    /// The underlying lifecycle manager.
    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// Loads the driver image and waits for the device node.
    ///
    /// The wait is bounded; a load that succeeds without the node ever
    /// appearing fails with `DeviceNotReady`.
    pub fn load(&mut self, image: &Path) -> Result<(), Error> {
        self.lifecycle.load(image)?;
        info!("driver loaded from {}", image.display());
        self.wait_ready()
    }

    /// Unloads the driver and invalidates the device handle.
    pub fn unload(&mut self) -> Result<(), Error> {
        // Drop our transport first; an open handle would keep the module
        // reference count up on a real system.
        self.device = None;
        self.lifecycle.unload()?;
        info!("driver unloaded");
        Ok(())
    }

    /// Reads `len` bytes of physical memory at `addr`.
    pub fn read(&mut self, addr: PhysAddr, len: u64) -> Result<Vec<u8>, Error> {
        let req = Request::Read {
            addr,
            len,
            mode: AccessMode::Buffer,
        };
        let resp = self.transact(req, |source| Error::Read { addr, len, source })?;
        match resp {
            Response::Bytes(bytes) if bytes.len() as u64 == len => Ok(bytes),
            _ => Err(Error::Read {
                addr,
                len,
                source: DeviceError::BadResponse,
            }),
        }
    }

    /// Reads one scalar of the given width at `addr`.
    ///
    /// `mode` must be one of the fixed-width modes.
    pub fn read_scalar(&mut self, addr: PhysAddr, mode: AccessMode) -> Result<u64, Error> {
        let Some(len) = mode.size() else {
            return Err(Error::Read {
                addr,
                len: 0,
                source: DeviceError::Driver(
                    pmemctl_core::protocol::ProtocolError::InvalidArgument(
                        "buffer mode is not a scalar read",
                    ),
                ),
            });
        };
        let req = Request::Read { addr, len, mode };
        match self.transact(req, |source| Error::Read { addr, len, source })? {
            Response::Scalar(value) => Ok(value),
            _ => Err(Error::Read {
                addr,
                len,
                source: DeviceError::BadResponse,
            }),
        }
    }

    /// Queries driver metadata.
    pub fn query(&mut self) -> Result<DriverInfo, Error> {
        match self.transact(Request::Query, Error::Query)? {
            Response::Info(info) => Ok(info),
            _ => Err(Error::Query(DeviceError::BadResponse)),
        }
    }

    /// Issues a raw control operation.
    pub fn control(&mut self, opcode: u32, arg: u64) -> Result<u64, Error> {
        match self.transact(Request::Control { opcode, arg }, |source| Error::Control {
            opcode,
            source,
        })? {
            Response::Control(value) => Ok(value),
            _ => Err(Error::Control {
                opcode,
                source: DeviceError::BadResponse,
            }),
        }
    }

    /// Reads the driver's template PTE.
    pub fn pte_template(&mut self) -> Result<Pte, Error> {
        Ok(Pte::from_raw(self.control(CTL_PTE_GET, 0)?))
    }

    /// Replaces the driver's template PTE.
    pub fn set_pte_template(&mut self, pte: Pte) -> Result<(), Error> {
        self.control(CTL_PTE_SET, pte.raw())?;
        Ok(())
    }

    fn transact(
        &mut self,
        req: Request,
        wrap: impl FnOnce(DeviceError) -> Error,
    ) -> Result<Response, Error> {
        self.device()?.transact(&req).map_err(wrap)
    }

    fn device(&mut self) -> Result<&mut dyn Device, Error> {
        if self.device.is_none() {
            // The driver may have been loaded by another process; connect
            // on demand, but only if the node is actually there.
            if !self.lifecycle.node_ready() {
                return Err(Error::DeviceUnavailable);
            }
            debug!("opening device {}", self.lifecycle.device_path().display());
            let device = (self.connector)(self.lifecycle.device_path())
                .map_err(|_| Error::DeviceUnavailable)?;
            self.device = Some(device);
        }
        match self.device.as_mut() {
            Some(device) => Ok(device.as_mut()),
            None => Err(Error::DeviceUnavailable),
        }
    }

    fn wait_ready(&mut self) -> Result<(), Error> {
        let deadline = Instant::now() + READY_TIMEOUT;
        loop {
            if self.lifecycle.node_ready() {
                if let Ok(device) = (self.connector)(self.lifecycle.device_path()) {
                    self.device = Some(device);
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::DeviceNotReady(
                    self.lifecycle.device_path().to_path_buf(),
                ));
            }
            thread::sleep(READY_POLL);
        }
    }
}

impl Default for Pmem {
    fn default() -> Self {
        Self::new()
    }
}
