//! Client-side error types.
//!
//! Every error carries a machine-readable [`ErrorKind`]; the display
//! rendering adds the operation context (which call, which address/length)
//! on top of the driver-reported failure, which is passed through unchanged
//! as the source.

use pmemctl_core::lifecycle::LifecycleError;
use pmemctl_core::mapper::MapError;
use pmemctl_core::protocol::ProtocolError;
use pmemctl_core::PhysAddr;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Machine-readable classification of a client error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Elevated privileges are required.
    PermissionDenied,
    /// Another lifecycle transition is in flight.
    AlreadyInProgress,
    /// The driver has in-flight work and refuses the operation.
    Busy,
    /// Loading the driver failed; nothing was left behind.
    LoadFailed,
    /// Unloading the driver failed; manual cleanup may be required.
    UnloadFailed,
    /// The device node did not appear within the readiness timeout.
    DeviceNotReady,
    /// The requested range overlaps a forbidden region.
    ForbiddenRegion,
    /// The driver is out of mapping window slots; retryable.
    OutOfResources,
    /// The request was malformed.
    InvalidArgument,
    /// The driver could not copy the mapped bytes out.
    CopyFailed,
    /// The driver does not implement the requested operation.
    UnsupportedOperation,
    /// No usable device; the driver is not loaded or the handle is stale.
    DeviceUnavailable,
    /// An uncategorised I/O failure.
    Io,
}

/// A failure reported by a device transport.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Rich driver error from an in-process handler.
    #[error(transparent)]
    Driver(#[from] ProtocolError),
    /// Errno reported by a real device node through ioctl.
    #[error("driver returned errno {0}")]
    Errno(i32),
    /// The driver answered with the wrong response shape.
    #[error("unexpected response from driver")]
    BadResponse,
    /// Transport-level I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DeviceError {
    /// Classifies the failure.
    ///
    /// Errno values follow the driver's stable mapping (see
    /// [`ProtocolError::errno`]).
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::Driver(err) => match err {
                ProtocolError::InvalidArgument(_) => ErrorKind::InvalidArgument,
                ProtocolError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
                ProtocolError::CopyFailed => ErrorKind::CopyFailed,
                ProtocolError::Map(MapError::ForbiddenRegion(_)) => ErrorKind::ForbiddenRegion,
                ProtocolError::Map(MapError::OutOfResources) => ErrorKind::OutOfResources,
                ProtocolError::Map(MapError::InvalidArgument(_)) => ErrorKind::InvalidArgument,
                ProtocolError::Map(MapError::Backing(_)) => ErrorKind::Io,
            },
            DeviceError::Errno(errno) => match *errno {
                libc::EINVAL => ErrorKind::InvalidArgument,
                libc::ENOTTY => ErrorKind::UnsupportedOperation,
                libc::EFAULT => ErrorKind::CopyFailed,
                libc::EPERM => ErrorKind::ForbiddenRegion,
                libc::EAGAIN => ErrorKind::OutOfResources,
                libc::ENOENT | libc::ENODEV | libc::EBADF => ErrorKind::DeviceUnavailable,
                _ => ErrorKind::Io,
            },
            DeviceError::BadResponse => ErrorKind::Io,
            DeviceError::Io(err) => match err.raw_os_error() {
                Some(libc::ENOENT) | Some(libc::ENODEV) => ErrorKind::DeviceUnavailable,
                Some(libc::EACCES) | Some(libc::EPERM) => ErrorKind::PermissionDenied,
                _ => ErrorKind::Io,
            },
        }
    }
}

/// Errors returned by the [`crate::Pmem`] control library.
#[derive(Debug, Error)]
pub enum Error {
    /// The device node never appeared after a successful load.
    #[error("device node {} did not appear in time", .0.display())]
    DeviceNotReady(PathBuf),
    /// No device to talk to; the driver is not loaded or the handle was
    /// invalidated by an unload.
    #[error("device unavailable: is the driver loaded?")]
    DeviceUnavailable,
    /// A read operation failed.
    #[error("reading {len} bytes at {addr} failed: {source}")]
    Read {
        /// First physical address of the failed read.
        addr: PhysAddr,
        /// Requested length in bytes.
        len: u64,
        /// Driver-reported failure.
        #[source]
        source: DeviceError,
    },
    /// The metadata query failed.
    #[error("driver query failed: {0}")]
    Query(#[source] DeviceError),
    /// A control operation failed.
    #[error("control opcode {opcode} failed: {source}")]
    Control {
        /// The opcode that was rejected.
        opcode: u32,
        /// Driver-reported failure.
        #[source]
        source: DeviceError,
    },
    /// A lifecycle transition failed.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl Error {
    /// Classifies the failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DeviceNotReady(_) => ErrorKind::DeviceNotReady,
            Error::DeviceUnavailable => ErrorKind::DeviceUnavailable,
            Error::Read { source, .. } => source.kind(),
            Error::Query(source) => source.kind(),
            Error::Control { source, .. } => source.kind(),
            Error::Lifecycle(err) => match err {
                LifecycleError::PermissionDenied => ErrorKind::PermissionDenied,
                LifecycleError::AlreadyInProgress => ErrorKind::AlreadyInProgress,
                LifecycleError::Busy => ErrorKind::Busy,
                LifecycleError::InvalidState(_) => ErrorKind::DeviceUnavailable,
                LifecycleError::LoadFailed(_) => ErrorKind::LoadFailed,
                LifecycleError::UnloadFailed(_) => ErrorKind::UnloadFailed,
            },
        }
    }
}
