//! Physical address newtype.

use crate::util::{PAGE_MASK, align_down};
use serde::Serialize;
use std::fmt::{self, Debug, Display, Formatter};

/// Physical memory address.
///
/// A newtype wrapper around a 64-bit physical address value. Arithmetic is
/// checked; untrusted request parameters must never be able to wrap around
/// the address space.
#[repr(transparent)]
#[derive(Clone, Copy, Default, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Creates a new physical address.
    pub const fn new(addr: u64) -> Self {
        PhysAddr(addr)
    }

    /// Returns the address as a u64.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the base address of the page containing this address.
    pub const fn page_base(&self) -> PhysAddr {
        PhysAddr(align_down(self.0, 1 << crate::util::PAGE_SHIFT))
    }

    /// Returns the offset of this address within its page.
    pub const fn page_offset(&self) -> usize {
        (self.0 as usize) & PAGE_MASK
    }

    /// Checked addition of a byte offset.
    ///
    /// Returns `None` if the result would wrap past the end of the address
    /// space.
    pub const fn checked_add(&self, offset: u64) -> Option<PhysAddr> {
        match self.0.checked_add(offset) {
            Some(addr) => Some(PhysAddr(addr)),
            None => None,
        }
    }
}

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("PhysAddr(0x{:x})", self.0))
    }
}

impl Display for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("0x{:016x}", self.0))
    }
}

impl From<u64> for PhysAddr {
    fn from(addr: u64) -> Self {
        PhysAddr(addr)
    }
}
