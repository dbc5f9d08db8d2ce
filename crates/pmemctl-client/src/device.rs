//! Device transports.
//!
//! A [`Device`] carries one decoded request to the driver and brings back
//! the response. [`IoctlDevice`] talks to a real device node; [`Loopback`]
//! short-circuits into an in-process [`DeviceHandler`], which is how the
//! integration tests (and dry runs on machines without the module) exercise
//! the full protocol path.

use crate::error::DeviceError;
use log::trace;
use pmemctl_core::protocol::wire::{
    ControlXfer, InfoXfer, ReadXfer, IOCTL_CONTROL, IOCTL_QUERY, IOCTL_READ,
};
use pmemctl_core::protocol::{AccessMode, DeviceHandler, DriverInfo, Request, Response};
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;

/// One round-trip to the driver.
pub trait Device: Send {
    /// Carries `req` to the driver and returns its response.
    fn transact(&mut self, req: &Request) -> Result<Response, DeviceError>;
}

/// Transport over a real device node.
pub struct IoctlDevice {
    file: File,
}

impl IoctlDevice {
    /// Opens the device node at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(IoctlDevice {
            file: File::open(path)?,
        })
    }

    fn ioctl(&self, code: u64, arg: *mut libc::c_void) -> Result<(), DeviceError> {
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), code as libc::c_ulong, arg) };
        if rc < 0 {
            let errno = io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO);
            return Err(DeviceError::Errno(errno));
        }
        Ok(())
    }
}

impl Device for IoctlDevice {
    fn transact(&mut self, req: &Request) -> Result<Response, DeviceError> {
        trace!("ioctl transact: {:?}", req);
        match *req {
            Request::Read { addr, len, mode } => {
                let mut buf: Vec<u8> = match mode {
                    AccessMode::Buffer => Vec::with_capacity(len as usize),
                    _ => Vec::new(),
                };
                let mut xfer = ReadXfer {
                    addr: addr.as_u64(),
                    value: 0,
                    buf_ptr: match mode {
                        AccessMode::Buffer => buf.as_mut_ptr() as u64,
                        _ => 0,
                    },
                    buf_len: match mode {
                        AccessMode::Buffer => len,
                        _ => 0,
                    },
                    mode: mode as u8,
                    reserved: [0; 7],
                };
                self.ioctl(IOCTL_READ, &mut xfer as *mut ReadXfer as *mut libc::c_void)?;
                match mode {
                    AccessMode::Buffer => {
                        // The kernel filled the buffer behind the vector's
                        // back and reported the byte count in buf_len.
                        let written = (xfer.buf_len as usize).min(len as usize);
                        unsafe { buf.set_len(written) };
                        Ok(Response::Bytes(buf))
                    }
                    _ => Ok(Response::Scalar(xfer.value)),
                }
            }
            Request::Query => {
                let mut xfer = InfoXfer::default();
                self.ioctl(IOCTL_QUERY, &mut xfer as *mut InfoXfer as *mut libc::c_void)?;
                Ok(Response::Info(DriverInfo {
                    version_major: xfer.version_major,
                    version_minor: xfer.version_minor,
                    max_window: xfer.max_window,
                    page_size: xfer.page_size,
                }))
            }
            Request::Control { opcode, arg } => {
                let mut xfer = ControlXfer {
                    opcode,
                    reserved: 0,
                    arg,
                    out: 0,
                };
                self.ioctl(
                    IOCTL_CONTROL,
                    &mut xfer as *mut ControlXfer as *mut libc::c_void,
                )?;
                Ok(Response::Control(xfer.out))
            }
        }
    }
}

/// In-process transport wired straight into a [`DeviceHandler`].
pub struct Loopback {
    handler: Arc<DeviceHandler>,
}

impl Loopback {
    /// Creates a loopback transport over `handler`.
    pub fn new(handler: Arc<DeviceHandler>) -> Self {
        Loopback { handler }
    }
}

impl Device for Loopback {
    fn transact(&mut self, req: &Request) -> Result<Response, DeviceError> {
        Ok(self.handler.handle(*req)?)
    }
}
