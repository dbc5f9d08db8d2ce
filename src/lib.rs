//! # pmemctl
//!
//! Physical memory acquisition toolkit for x86_64 Linux. The workspace has
//! two library crates, re-exported here:
//!
//! - [`pmemctl_core`] - the driver core: the physical memory mapper with
//!   its forbidden-region checks and bounded window pool, the ioctl
//!   protocol handler, and the load/unload lifecycle state machine.
//! - [`pmemctl_client`] - the userspace control library: a [`Pmem`] handle
//!   with `load`, `read` and `unload`, plus a C ABI for non-Rust tooling.
//!
//! The `pmemctl` binary (in `pmemctl-bin`) wraps the library for scripts
//! and interactive use.
//!
//! Everything kernel-shaped is built against explicit seams
//! ([`pmemctl_core::mapper::PhysBacking`],
//! [`pmemctl_core::lifecycle::ModuleHost`]), so the whole acquisition path
//! can be exercised in-process; see `tests/integration_test.rs`.

pub use pmemctl_client::{DeviceError, Error, ErrorKind, Pmem};
pub use pmemctl_core::{
    AccessMode, DeviceHandler, DriverInfo, DriverState, ForbiddenRegions, LifecycleConfig,
    LifecycleError, LifecycleManager, MapError, Mapper, MapperConfig, MappingRequest, PhysAddr,
    PhysRange, ProtocolError, Request, Response,
};
