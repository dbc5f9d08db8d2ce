//! x86-64 page-table-entry template for the cache-control operation.
//!
//! The driver maps acquisition windows through a template PTE; operators can
//! inspect and adjust the caching attributes (PWT/PCD/PAT) through the
//! `Control` protocol operation when reading device memory that must not be
//! cached.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// A raw x86-64 page-table entry value.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte(u64);

/// Named fields of a page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PteField {
    /// Present
    P,
    /// Writable
    Rw,
    /// User accessible
    Us,
    /// Write-through caching
    Pwt,
    /// Cache disable
    Pcd,
    /// Accessed
    A,
    /// Dirty
    D,
    /// Page attribute table bit
    Pat,
    /// Global
    G,
    /// Physical frame number (bits 12..52)
    Pfn,
    /// No-execute
    Nx,
}

impl PteField {
    const fn shift(&self) -> u64 {
        match self {
            PteField::P => 0,
            PteField::Rw => 1,
            PteField::Us => 2,
            PteField::Pwt => 3,
            PteField::Pcd => 4,
            PteField::A => 5,
            PteField::D => 6,
            PteField::Pat => 7,
            PteField::G => 8,
            PteField::Pfn => 12,
            PteField::Nx => 63,
        }
    }

    const fn mask(&self) -> u64 {
        match self {
            PteField::Pfn => 0xf_ffff_ffff_f000,
            field => 1 << field.shift(),
        }
    }

    /// Returns true for fields wider than one bit.
    pub const fn is_multi_bit(&self) -> bool {
        matches!(self, PteField::Pfn)
    }
}

/// Error returned when parsing PTE field names.
#[derive(Debug, Error)]
pub enum PteParseError {
    /// The name does not denote a PTE field.
    #[error("unknown PTE field {0:?}")]
    UnknownField(String),
    /// A multi-bit field was used where a flag was expected.
    #[error("field {0:?} is not a single-bit flag")]
    NotAFlag(String),
}

impl FromStr for PteField {
    type Err = PteParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "p" => PteField::P,
            "rw" => PteField::Rw,
            "us" => PteField::Us,
            "pwt" => PteField::Pwt,
            "pcd" => PteField::Pcd,
            "a" => PteField::A,
            "d" => PteField::D,
            "pat" => PteField::Pat,
            "g" => PteField::G,
            "pfn" => PteField::Pfn,
            "nx" => PteField::Nx,
            other => return Err(PteParseError::UnknownField(other.into())),
        })
    }
}

impl Pte {
    /// An all-zero entry.
    pub const fn empty() -> Self {
        Pte(0)
    }

    /// Wraps a raw entry value.
    pub const fn from_raw(value: u64) -> Self {
        Pte(value)
    }

    /// Returns the raw entry value.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Returns a copy with the given single-bit flag set.
    pub const fn with(self, field: PteField) -> Self {
        Pte(self.0 | field.mask())
    }

    /// Returns true if the given flag is set.
    pub const fn has(&self, field: PteField) -> bool {
        self.0 & field.mask() != 0
    }

    /// Returns a copy with the frame number replaced.
    pub const fn with_pfn(self, pfn: u64) -> Self {
        let mask = PteField::Pfn.mask();
        Pte((self.0 & !mask) | ((pfn << PteField::Pfn.shift()) & mask))
    }

    /// Extracts the frame number.
    pub const fn pfn(&self) -> u64 {
        (self.0 & PteField::Pfn.mask()) >> PteField::Pfn.shift()
    }

    /// Template used for acquisition windows: present, writable in kernel
    /// mode only, strongly uncached, never executable.
    pub const fn acquisition_default() -> Self {
        Pte::empty()
            .with(PteField::P)
            .with(PteField::Rw)
            .with(PteField::Pwt)
            .with(PteField::Pcd)
            .with(PteField::Nx)
    }

    /// Assembles a template from single-bit flag names.
    ///
    /// Multi-bit fields (the frame number) cannot be set this way and are
    /// rejected.
    pub fn from_flags<'a, I: IntoIterator<Item = &'a str>>(flags: I) -> Result<Self, PteParseError> {
        let mut pte = Pte::empty();
        for name in flags {
            let field: PteField = name.parse()?;
            if field.is_multi_bit() {
                return Err(PteParseError::NotAFlag(name.into()));
            }
            pte = pte.with(field);
        }
        Ok(pte)
    }
}

impl Display for Pte {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_positions() {
        assert_eq!(Pte::empty().with(PteField::P).raw(), 1);
        assert_eq!(Pte::empty().with(PteField::Nx).raw(), 1 << 63);
        assert_eq!(Pte::empty().with(PteField::Pcd).raw(), 1 << 4);
    }

    #[test]
    fn pfn_round_trip() {
        let pte = Pte::empty().with_pfn(0xabcde);
        assert_eq!(pte.pfn(), 0xabcde);
        assert_eq!(pte.raw(), 0xabcde << 12);
        // replacing the pfn leaves flags untouched
        let pte = pte.with(PteField::P).with_pfn(0x1);
        assert!(pte.has(PteField::P));
        assert_eq!(pte.pfn(), 0x1);
    }

    #[test]
    fn from_flags_parses_names() {
        let pte = Pte::from_flags(["p", "rw", "pcd"]).unwrap();
        assert!(pte.has(PteField::P));
        assert!(pte.has(PteField::Rw));
        assert!(pte.has(PteField::Pcd));
        assert!(!pte.has(PteField::Nx));
    }

    #[test]
    fn from_flags_rejects_pfn_and_unknown() {
        assert!(matches!(
            Pte::from_flags(["pfn"]),
            Err(PteParseError::NotAFlag(_))
        ));
        assert!(matches!(
            Pte::from_flags(["bogus"]),
            Err(PteParseError::UnknownField(_))
        ));
    }
}
