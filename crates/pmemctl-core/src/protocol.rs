//! Device protocol: the kernel/user boundary as message passing.
//!
//! Userspace talks to the driver through three logical operations carried
//! over ioctl on the device node: `Read`, `Query` and `Control`. Each
//! operation has one fixed-layout `#[repr(C)]` transfer struct and one ioctl
//! request code; the layout is frozen and growth happens by adding control
//! opcodes, never by reshaping the structs. The ABI version is reported by
//! `Query`.
//!
//! [`DeviceHandler`] is the kernel-side reference implementation of the
//! handler: it decodes requests, drives the mapper, and converts every
//! validation failure into an error return. Malformed input from userspace
//! must never panic the handler.

use crate::addr::PhysAddr;
use crate::mapper::{Mapper, MapError, MappingRequest};
use crate::pte::Pte;
use crate::util::PAGE_SIZE;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;

/// Protocol ABI major version. Bumped on incompatible wire changes.
pub const VERSION_MAJOR: u32 = 1;
/// Protocol ABI minor version. Bumped on compatible additions.
pub const VERSION_MINOR: u32 = 0;

/// ioctl magic byte for all pmemctl request codes.
pub const IOCTL_MAGIC: u8 = b'p';

/// Control opcode: read the template PTE used for acquisition windows.
pub const CTL_PTE_GET: u32 = 1;
/// Control opcode: replace the template PTE used for acquisition windows.
pub const CTL_PTE_SET: u32 = 2;

/// Access granularity of a read operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AccessMode {
    /// Single byte read, result in the scalar slot.
    Byte = 1,
    /// 16-bit read, result in the scalar slot.
    Word = 2,
    /// 32-bit read, result in the scalar slot.
    Dword = 3,
    /// 64-bit read, result in the scalar slot.
    Qword = 4,
    /// Arbitrary-length read into a caller buffer.
    Buffer = 5,
}

impl AccessMode {
    /// Fixed size of scalar modes; `None` for buffer reads.
    pub const fn size(&self) -> Option<u64> {
        match self {
            AccessMode::Byte => Some(1),
            AccessMode::Word => Some(2),
            AccessMode::Dword => Some(4),
            AccessMode::Qword => Some(8),
            AccessMode::Buffer => None,
        }
    }

    /// Decodes the wire tag.
    pub const fn from_wire(tag: u8) -> Option<AccessMode> {
        Some(match tag {
            1 => AccessMode::Byte,
            2 => AccessMode::Word,
            3 => AccessMode::Dword,
            4 => AccessMode::Qword,
            5 => AccessMode::Buffer,
            _ => return None,
        })
    }
}

/// A decoded request from userspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Read `len` bytes of physical memory at `addr`.
    Read {
        /// First physical address to read.
        addr: PhysAddr,
        /// Number of bytes; must equal the mode's fixed size for scalar
        /// modes.
        len: u64,
        /// Access granularity.
        mode: AccessMode,
    },
    /// Query driver metadata.
    Query,
    /// Driver control operation.
    Control {
        /// Operation selector; unknown opcodes are rejected.
        opcode: u32,
        /// Opcode-specific argument.
        arg: u64,
    },
}

/// A successful response to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Buffer read result; exactly as many bytes as requested.
    Bytes(Vec<u8>),
    /// Scalar read result, little-endian truncated to the mode's width.
    Scalar(u64),
    /// Driver metadata.
    Info(DriverInfo),
    /// Control operation result value.
    Control(u64),
}

/// Driver metadata returned by `Query`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverInfo {
    /// Protocol ABI major version.
    pub version_major: u32,
    /// Protocol ABI minor version.
    pub version_minor: u32,
    /// Largest single read accepted, in bytes.
    pub max_window: u64,
    /// Page size the mapper rounds to.
    pub page_size: u32,
}

/// Errors the protocol handler reports back to userspace.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The request was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The control opcode is not known to this driver version.
    #[error("unsupported control opcode {0}")]
    UnsupportedOperation(u32),
    /// The mapped bytes could not be copied to the caller. Nothing partial
    /// was made visible.
    #[error("copy to caller buffer failed")]
    CopyFailed,
    /// The mapper rejected the request.
    #[error(transparent)]
    Map(#[from] MapError),
}

impl ProtocolError {
    /// The errno a kernel-resident handler reports for this error.
    ///
    /// Part of the stable ABI: the userspace library maps these back to
    /// error kinds when talking to a real device node.
    pub fn errno(&self) -> i32 {
        match self {
            ProtocolError::InvalidArgument(_) => libc::EINVAL,
            ProtocolError::UnsupportedOperation(_) => libc::ENOTTY,
            ProtocolError::CopyFailed => libc::EFAULT,
            ProtocolError::Map(MapError::ForbiddenRegion(_)) => libc::EPERM,
            ProtocolError::Map(MapError::OutOfResources) => libc::EAGAIN,
            ProtocolError::Map(MapError::InvalidArgument(_)) => libc::EINVAL,
            ProtocolError::Map(MapError::Backing(_)) => libc::EIO,
        }
    }
}

/// Fixed-layout wire structs and ioctl request codes.
pub mod wire {
    use super::{AccessMode, ProtocolError, Request};
    use crate::addr::PhysAddr;
    use std::mem::size_of;

    /// Encodes an `_IOWR`-style ioctl request code.
    const fn iowr(nr: u8, size: usize) -> u64 {
        // dir(2) | size(14) | type(8) | nr(8)
        (3u64 << 30) | ((size as u64) << 16) | ((super::IOCTL_MAGIC as u64) << 8) | nr as u64
    }

    /// Transfer struct for the `Read` operation.
    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct ReadXfer {
        /// Physical address to read.
        pub addr: u64,
        /// Scalar result slot (modes Byte..Qword).
        pub value: u64,
        /// Userspace destination buffer (mode Buffer), as a raw pointer.
        pub buf_ptr: u64,
        /// Destination buffer length in; bytes written out.
        pub buf_len: u64,
        /// [`AccessMode`] wire tag.
        pub mode: u8,
        /// Must be zero.
        pub reserved: [u8; 7],
    }

    /// Transfer struct for the `Query` operation.
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct InfoXfer {
        /// Protocol ABI major version.
        pub version_major: u32,
        /// Protocol ABI minor version.
        pub version_minor: u32,
        /// Largest single read accepted, in bytes.
        pub max_window: u64,
        /// Page size the mapper rounds to.
        pub page_size: u32,
        /// Must be zero.
        pub reserved: u32,
    }

    /// Transfer struct for the `Control` operation.
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct ControlXfer {
        /// Control opcode.
        pub opcode: u32,
        /// Must be zero.
        pub reserved: u32,
        /// Opcode-specific argument.
        pub arg: u64,
        /// Opcode-specific result.
        pub out: u64,
    }

    /// ioctl request code for [`ReadXfer`].
    pub const IOCTL_READ: u64 = iowr(1, size_of::<ReadXfer>());
    /// ioctl request code for [`InfoXfer`].
    pub const IOCTL_QUERY: u64 = iowr(2, size_of::<InfoXfer>());
    /// ioctl request code for [`ControlXfer`].
    pub const IOCTL_CONTROL: u64 = iowr(3, size_of::<ControlXfer>());

    /// Decodes a raw read transfer into a validated [`Request`].
    ///
    /// This is the handler's first line of defence: tags, lengths and
    /// reserved fields come straight from userspace and are checked before
    /// anything touches the mapper.
    pub fn decode_read(xfer: &ReadXfer) -> Result<Request, ProtocolError> {
        if xfer.reserved != [0; 7] {
            return Err(ProtocolError::InvalidArgument("reserved bytes must be zero"));
        }
        let mode = AccessMode::from_wire(xfer.mode)
            .ok_or(ProtocolError::InvalidArgument("unknown access mode"))?;
        let len = match mode.size() {
            Some(fixed) => fixed,
            None => {
                if xfer.buf_ptr == 0 {
                    return Err(ProtocolError::InvalidArgument("null buffer pointer"));
                }
                xfer.buf_len
            }
        };
        Ok(Request::Read {
            addr: PhysAddr::new(xfer.addr),
            len,
            mode,
        })
    }

    /// Decodes a raw control transfer.
    pub fn decode_control(xfer: &ControlXfer) -> Result<Request, ProtocolError> {
        if xfer.reserved != 0 {
            return Err(ProtocolError::InvalidArgument("reserved bytes must be zero"));
        }
        Ok(Request::Control {
            opcode: xfer.opcode,
            arg: xfer.arg,
        })
    }
}

/// Kernel-side protocol handler.
///
/// Owns the mapper and the driver metadata. One instance per loaded driver;
/// construct it explicitly and hand it to whatever dispatches device
/// requests (the in-process loopback in tests, the ioctl entry point in the
/// kernel build).
pub struct DeviceHandler {
    mapper: Mapper,
    info: DriverInfo,
    pte_template: Mutex<Pte>,
}

impl DeviceHandler {
    /// Creates a handler over `mapper`.
    pub fn new(mapper: Mapper) -> Self {
        let info = DriverInfo {
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            max_window: mapper.max_window(),
            page_size: PAGE_SIZE as u32,
        };
        DeviceHandler {
            mapper,
            info,
            pte_template: Mutex::new(Pte::acquisition_default()),
        }
    }

    /// The mapper behind this handler.
    pub fn mapper(&self) -> &Mapper {
        &self.mapper
    }

    /// Dispatches one decoded request.
    pub fn handle(&self, req: Request) -> Result<Response, ProtocolError> {
        match req {
            Request::Read { addr, len, mode } => self.read(addr, len, mode),
            Request::Query => Ok(Response::Info(self.info)),
            Request::Control { opcode, arg } => self.control(opcode, arg),
        }
    }

    fn read(&self, addr: PhysAddr, len: u64, mode: AccessMode) -> Result<Response, ProtocolError> {
        if let Some(fixed) = mode.size() {
            if len != fixed {
                return Err(ProtocolError::InvalidArgument(
                    "length does not match access mode",
                ));
            }
        }
        let window = self.mapper.map(MappingRequest::new(addr, len))?;
        let mut buf = vec![0u8; window.len()];
        // All-or-nothing: a fault mid-copy discards the buffer, so no
        // partial data is ever visible as success.
        window.copy_out(&mut buf).map_err(|err| {
            warn!("copy of {} bytes at {} failed: {}", len, addr, err);
            ProtocolError::CopyFailed
        })?;
        match mode {
            AccessMode::Buffer => Ok(Response::Bytes(buf)),
            _ => {
                let mut raw = [0u8; 8];
                raw[..buf.len()].copy_from_slice(&buf);
                Ok(Response::Scalar(u64::from_le_bytes(raw)))
            }
        }
    }

    fn control(&self, opcode: u32, arg: u64) -> Result<Response, ProtocolError> {
        let mut template = self
            .pte_template
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match opcode {
            CTL_PTE_GET => Ok(Response::Control(template.raw())),
            CTL_PTE_SET => {
                debug!("template PTE set to 0x{:016x}", arg);
                *template = Pte::from_raw(arg);
                Ok(Response::Control(arg))
            }
            other => Err(ProtocolError::UnsupportedOperation(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::wire::{ControlXfer, ReadXfer, decode_control, decode_read};
    use super::*;
    use crate::mapper::{MapperConfig, MemBacking};
    use crate::regions::ForbiddenRegions;

    fn handler_with_backing() -> (DeviceHandler, MemBacking) {
        let backing = MemBacking::new(1 << 20);
        let mapper = Mapper::new(
            Box::new(backing.clone()),
            ForbiddenRegions::default(),
            MapperConfig {
                max_window: 64 << 10,
                window_slots: 4,
            },
        );
        (DeviceHandler::new(mapper), backing)
    }

    #[test]
    fn buffer_read_round_trip() {
        let (handler, backing) = handler_with_backing();
        let pattern: Vec<u8> = (0..64).collect();
        backing.write(PhysAddr::new(0x1000), &pattern);

        let resp = handler
            .handle(Request::Read {
                addr: PhysAddr::new(0x1000),
                len: 64,
                mode: AccessMode::Buffer,
            })
            .unwrap();
        assert_eq!(resp, Response::Bytes(pattern));
        assert_eq!(handler.mapper().pool().active(), 0);
    }

    #[test]
    fn scalar_read_is_little_endian() {
        let (handler, backing) = handler_with_backing();
        backing.write(PhysAddr::new(0x2000), &[0x78, 0x56, 0x34, 0x12]);

        let resp = handler
            .handle(Request::Read {
                addr: PhysAddr::new(0x2000),
                len: 4,
                mode: AccessMode::Dword,
            })
            .unwrap();
        assert_eq!(resp, Response::Scalar(0x12345678));
    }

    #[test]
    fn scalar_length_mismatch_rejected() {
        let (handler, _) = handler_with_backing();
        let result = handler.handle(Request::Read {
            addr: PhysAddr::new(0x2000),
            len: 8,
            mode: AccessMode::Dword,
        });
        assert!(matches!(result, Err(ProtocolError::InvalidArgument(_))));
    }

    #[test]
    fn copy_fault_reports_copy_failed_and_releases_window() {
        let (handler, backing) = handler_with_backing();
        backing.inject_copy_fault();
        let result = handler.handle(Request::Read {
            addr: PhysAddr::new(0x1000),
            len: 16,
            mode: AccessMode::Buffer,
        });
        assert!(matches!(result, Err(ProtocolError::CopyFailed)));
        assert_eq!(handler.mapper().pool().active(), 0);
        // the fault is one-shot; the retry succeeds
        assert!(
            handler
                .handle(Request::Read {
                    addr: PhysAddr::new(0x1000),
                    len: 16,
                    mode: AccessMode::Buffer,
                })
                .is_ok()
        );
    }

    #[test]
    fn query_reports_abi_and_limits() {
        let (handler, _) = handler_with_backing();
        let Response::Info(info) = handler.handle(Request::Query).unwrap() else {
            panic!("expected info response");
        };
        assert_eq!(info.version_major, VERSION_MAJOR);
        assert_eq!(info.max_window, 64 << 10);
        assert_eq!(info.page_size, PAGE_SIZE as u32);
    }

    #[test]
    fn pte_control_round_trip() {
        let (handler, _) = handler_with_backing();
        let Response::Control(initial) = handler
            .handle(Request::Control {
                opcode: CTL_PTE_GET,
                arg: 0,
            })
            .unwrap()
        else {
            panic!("expected control response");
        };
        assert_eq!(initial, Pte::acquisition_default().raw());

        handler
            .handle(Request::Control {
                opcode: CTL_PTE_SET,
                arg: 0x8000000000000003,
            })
            .unwrap();
        let Response::Control(updated) = handler
            .handle(Request::Control {
                opcode: CTL_PTE_GET,
                arg: 0,
            })
            .unwrap()
        else {
            panic!("expected control response");
        };
        assert_eq!(updated, 0x8000000000000003);
    }

    #[test]
    fn unknown_opcode_rejected() {
        let (handler, _) = handler_with_backing();
        assert!(matches!(
            handler.handle(Request::Control { opcode: 99, arg: 0 }),
            Err(ProtocolError::UnsupportedOperation(99))
        ));
    }

    #[test]
    fn decode_rejects_malformed_wire_requests() {
        let valid = ReadXfer {
            addr: 0x1000,
            value: 0,
            buf_ptr: 0x7f00_0000_0000,
            buf_len: 16,
            mode: AccessMode::Buffer as u8,
            reserved: [0; 7],
        };
        assert!(decode_read(&valid).is_ok());

        let bad_mode = ReadXfer { mode: 0xfe, ..valid };
        assert!(matches!(
            decode_read(&bad_mode),
            Err(ProtocolError::InvalidArgument(_))
        ));

        let null_buf = ReadXfer { buf_ptr: 0, ..valid };
        assert!(matches!(
            decode_read(&null_buf),
            Err(ProtocolError::InvalidArgument(_))
        ));

        let dirty_reserved = ReadXfer {
            reserved: [0, 0, 0, 1, 0, 0, 0],
            ..valid
        };
        assert!(decode_read(&dirty_reserved).is_err());

        let bad_control = ControlXfer {
            opcode: CTL_PTE_GET,
            reserved: 7,
            arg: 0,
            out: 0,
        };
        assert!(decode_control(&bad_control).is_err());
    }

    #[test]
    fn scalar_decode_ignores_buffer_fields() {
        let xfer = ReadXfer {
            addr: 0x3000,
            value: 0,
            buf_ptr: 0,
            buf_len: 0,
            mode: AccessMode::Qword as u8,
            reserved: [0; 7],
        };
        assert_eq!(
            decode_read(&xfer).unwrap(),
            Request::Read {
                addr: PhysAddr::new(0x3000),
                len: 8,
                mode: AccessMode::Qword,
            }
        );
    }

    #[test]
    fn ioctl_codes_are_stable() {
        use super::wire::{IOCTL_CONTROL, IOCTL_QUERY, IOCTL_READ};
        // dir=RW, magic 'p', nr 1..3, struct sizes 40/24/24
        assert_eq!(IOCTL_READ, 0xc028_7001);
        assert_eq!(IOCTL_QUERY, 0xc018_7002);
        assert_eq!(IOCTL_CONTROL, 0xc018_7003);
    }
}
