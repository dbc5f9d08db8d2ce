//! # pmemctl core
//!
//! `pmemctl-core` is the driver core of the pmemctl physical-memory
//! acquisition toolkit: the host-testable reference implementation of the
//! logic that lives kernel-side in a deployment, plus the loader that
//! manages the driver's lifecycle.
//!
//! ## Architecture Overview
//!
//! Three components, each behind an explicit context rather than global
//! state, so initialization and teardown order stay visible and everything
//! can be exercised against mock seams:
//!
//! - [`mapper::Mapper`] - validates physical read requests, draws from a
//!   bounded pool of mapping windows and maps page-aligned ranges through a
//!   [`mapper::PhysBacking`].
//!
//! - [`protocol::DeviceHandler`] - decodes the tagged ioctl request/response
//!   exchange ([`protocol::Request`]/[`protocol::Response`]) and drives the
//!   mapper. Malformed userspace input becomes an error return, never a
//!   panic.
//!
//! - [`lifecycle::LifecycleManager`] - the strictly sequential
//!   load/unload state machine over a [`lifecycle::ModuleHost`].
//!
//! ## Platform Support
//!
//! x86_64 Linux. Loading the driver and mapping device memory require root.

#![warn(missing_docs)]

pub mod addr;
pub mod lifecycle;
pub mod mapper;
pub mod protocol;
pub mod pte;
pub mod regions;
pub mod util;

pub use crate::addr::PhysAddr;
pub use crate::lifecycle::{DriverState, LifecycleConfig, LifecycleError, LifecycleManager};
pub use crate::mapper::{MapError, Mapper, MapperConfig, MappingRequest, MappingWindow};
pub use crate::protocol::{AccessMode, DeviceHandler, DriverInfo, ProtocolError, Request, Response};
pub use crate::regions::{ForbiddenRegions, PhysRange};
