//! # pmemctl client
//!
//! Userspace control library for the pmemctl acquisition driver. Exposes
//! the three operations external tooling needs - load the driver, read
//! physical memory, unload the driver - plus the metadata query and the
//! cache-control knobs.
//!
//! The [`Pmem`] handle drives a [`pmemctl_core::lifecycle::LifecycleManager`]
//! for load/unload and a [`device::Device`] transport for reads. On a real
//! system the transport is ioctl on the device node; tests wire the handle
//! to an in-process [`pmemctl_core::protocol::DeviceHandler`] through
//! [`device::Loopback`].
//!
//! Load and unload require root; the library reports `PermissionDenied`
//! instead of attempting any escalation of its own.

#![warn(missing_docs)]

mod client;
pub mod device;
mod error;
pub mod ffi;

pub use client::{Connector, Pmem};
pub use error::{DeviceError, Error, ErrorKind};
