//! Forbidden physical region bookkeeping.
//!
//! The mapper refuses to expose certain physical ranges (firmware holes,
//! device MMIO, the kernel image) because acquisition tools are routinely
//! pointed at operator- or attacker-supplied addresses and a bad mapping can
//! take the host down. This module keeps the deny list: a normalised set of
//! half-open ranges with an overlap query.

use crate::addr::PhysAddr;
use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use thiserror::Error;

/// A half-open physical address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysRange {
    /// First address of the range.
    pub start: u64,
    /// One past the last address of the range.
    pub end: u64,
}

impl PhysRange {
    /// Creates a new range. `end` is exclusive.
    pub const fn new(start: u64, end: u64) -> Self {
        PhysRange { start, end }
    }

    /// Length of the range in bytes.
    pub const fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Returns true for degenerate (empty) ranges.
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Returns true if the two ranges share at least one address.
    pub const fn overlaps(&self, other: &PhysRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `addr` falls inside the range.
    pub const fn contains(&self, addr: PhysAddr) -> bool {
        self.start <= addr.as_u64() && addr.as_u64() < self.end
    }
}

/// Errors that can occur while building a forbidden-region set.
#[derive(Debug, Error)]
pub enum RegionsError {
    /// The configuration file could not be read.
    #[error("failed to read region config: {0}")]
    Io(#[from] std::io::Error),
    /// The configuration file is not valid JSON.
    #[error("failed to parse region config: {0}")]
    Json(#[from] serde_json::Error),
    /// An iomem-style line did not have the expected shape.
    #[error("malformed iomem line: {0:?}")]
    MalformedLine(String),
}

/// The set of physical ranges the mapper refuses to map.
///
/// Ranges are kept sorted and coalesced, so overlap queries are a binary
/// search away and the set can be logged in a readable form.
#[derive(Debug, Clone, Default)]
pub struct ForbiddenRegions {
    ranges: Vec<PhysRange>,
}

/// Legacy VGA/BIOS hole below 1 MiB, forbidden on every x86 host.
const LEGACY_HOLE: PhysRange = PhysRange::new(0xa0000, 0x100000);

impl ForbiddenRegions {
    /// Builds a normalised set from arbitrary ranges.
    ///
    /// Empty ranges are dropped; overlapping and adjacent ranges are merged.
    pub fn new<I: IntoIterator<Item = PhysRange>>(ranges: I) -> Self {
        let ranges = ranges
            .into_iter()
            .filter(|r| !r.is_empty())
            .sorted_by_key(|r| r.start)
            .coalesce(|a, b| {
                if b.start <= a.end {
                    Ok(PhysRange::new(a.start, a.end.max(b.end)))
                } else {
                    Err((a, b))
                }
            })
            .collect();
        ForbiddenRegions { ranges }
    }

    /// The built-in default: only the legacy hole below 1 MiB.
    ///
    /// Real deployments are expected to extend this from a config file or
    /// from `/proc/iomem`.
    pub fn defaults() -> Self {
        Self::new([LEGACY_HOLE])
    }

    /// Loads a JSON array of ranges, merged with the built-in defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, RegionsError> {
        let file = File::open(path)?;
        let mut ranges: Vec<PhysRange> = serde_json::from_reader(BufReader::new(file))?;
        ranges.push(LEGACY_HOLE);
        Ok(Self::new(ranges))
    }

    /// Derives a deny list from `/proc/iomem`-formatted input.
    ///
    /// Every top-level resource that is not `System RAM` is forbidden.
    /// Indented child entries are ignored; they subdivide their parent and
    /// the coarse parent decision is the conservative one.
    pub fn from_iomem<R: BufRead>(reader: R) -> Result<Self, RegionsError> {
        let mut ranges = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.starts_with(' ') || line.is_empty() {
                continue;
            }
            let (span, name) = line
                .split_once(" : ")
                .ok_or_else(|| RegionsError::MalformedLine(line.clone()))?;
            if name.trim() == "System RAM" {
                continue;
            }
            let (start, end) = span
                .split_once('-')
                .ok_or_else(|| RegionsError::MalformedLine(line.clone()))?;
            let start = u64::from_str_radix(start.trim(), 16)
                .map_err(|_| RegionsError::MalformedLine(line.clone()))?;
            let end = u64::from_str_radix(end.trim(), 16)
                .map_err(|_| RegionsError::MalformedLine(line.clone()))?;
            // iomem prints inclusive ranges
            ranges.push(PhysRange::new(start, end.saturating_add(1)));
        }
        let regions = Self::new(ranges);
        debug!("derived {} forbidden regions from iomem", regions.ranges.len());
        Ok(regions)
    }

    /// Reads the running kernel's `/proc/iomem`.
    pub fn from_proc_iomem() -> Result<Self, RegionsError> {
        Self::from_iomem(BufReader::new(File::open("/proc/iomem")?))
    }

    /// Returns the first forbidden range overlapping `range`, if any.
    pub fn overlaps(&self, range: &PhysRange) -> Option<PhysRange> {
        // first range that could overlap: the one before the partition point
        let idx = self.ranges.partition_point(|r| r.end <= range.start);
        self.ranges
            .get(idx)
            .filter(|r| r.overlaps(range))
            .copied()
    }

    /// Iterates the normalised ranges in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &PhysRange> {
        self.ranges.iter()
    }

    /// Number of distinct forbidden ranges.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Returns true if nothing is forbidden.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
