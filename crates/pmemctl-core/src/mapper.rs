//! Physical memory mapper.
//!
//! Validates read requests against the forbidden-region list, draws a slot
//! from a bounded window pool and maps the minimal page-aligned range
//! covering the request through a [`PhysBacking`]. A [`MappingWindow`] is a
//! scoped acquisition: dropping it releases the pool slot and unmaps the
//! pages on every exit path, including failures halfway through a copy.

use crate::addr::PhysAddr;
use crate::regions::{ForbiddenRegions, PhysRange};
use crate::util::{PAGE_SIZE, align_up};
use log::{debug, trace, warn};
use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors produced by the mapper.
#[derive(Debug, Error)]
pub enum MapError {
    /// The request overlaps a range the mapper refuses to expose.
    #[error("request overlaps forbidden region 0x{:x}..0x{:x}", .0.start, .0.end)]
    ForbiddenRegion(PhysRange),
    /// All mapping window slots are in use.
    #[error("no mapping window slot available")]
    OutOfResources,
    /// The request parameters are malformed.
    #[error("invalid mapping request: {0}")]
    InvalidArgument(&'static str),
    /// The backing failed to map the pages.
    #[error("backing store failed to map range")]
    Backing(#[source] io::Error),
}

/// A mapped run of physical pages.
///
/// Implementations unmap on drop. `read` is fallible because the copy out of
/// the window stands in for the kernel/user copy, which can fault.
pub trait MappedPages: Send {
    /// Length of the mapped run in bytes.
    fn len(&self) -> usize;

    /// Copies `out.len()` bytes starting at `offset` within the mapped run.
    fn read(&self, offset: usize, out: &mut [u8]) -> io::Result<()>;
}

/// Source of physical pages.
///
/// The seam between the mapper and the machine: the production
/// implementation maps a memory device node, tests use [`MemBacking`].
pub trait PhysBacking: Send + Sync {
    /// Maps `len` bytes starting at the page-aligned `base`.
    fn map_pages(&self, base: PhysAddr, len: usize) -> io::Result<Box<dyn MappedPages>>;
}

/// Bounded pool of mapping window slots.
///
/// Limits how much address space concurrent requests can pin at once.
/// Exhaustion fails fast instead of queueing; see the lifecycle manager's
/// `Busy` handling for why blocking here would be deadlock-prone.
#[derive(Debug)]
pub struct WindowPool {
    capacity: usize,
    active: AtomicUsize,
}

impl WindowPool {
    /// Creates a pool with `capacity` slots.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(WindowPool {
            capacity,
            active: AtomicUsize::new(0),
        })
    }

    /// Tries to take a slot. Returns `None` when the pool is exhausted.
    pub fn try_acquire(self: &Arc<Self>) -> Option<PoolPermit> {
        let mut current = self.active.load(Ordering::Relaxed);
        loop {
            if current >= self.capacity {
                return None;
            }
            match self.active.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(PoolPermit {
                        pool: Arc::clone(self),
                    });
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Number of slots currently held.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A held window slot. Released on drop.
#[derive(Debug)]
pub struct PoolPermit {
    pool: Arc<WindowPool>,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        self.pool.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A validated request for one read window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingRequest {
    /// First physical address to read.
    pub addr: PhysAddr,
    /// Number of bytes to read.
    pub len: u64,
}

impl MappingRequest {
    /// Creates a request. Validation happens in [`Mapper::map`].
    pub const fn new(addr: PhysAddr, len: u64) -> Self {
        MappingRequest { addr, len }
    }

    fn range(&self) -> Option<PhysRange> {
        let end = self.addr.checked_add(self.len)?;
        Some(PhysRange::new(self.addr.as_u64(), end.as_u64()))
    }
}

/// Mapper configuration.
#[derive(Debug, Clone, Copy)]
pub struct MapperConfig {
    /// Largest request accepted, in bytes.
    pub max_window: u64,
    /// Number of concurrently held mapping windows.
    pub window_slots: usize,
}

impl Default for MapperConfig {
    fn default() -> Self {
        MapperConfig {
            max_window: 4 << 20,
            window_slots: 8,
        }
    }
}

/// The physical memory mapper.
pub struct Mapper {
    backing: Box<dyn PhysBacking>,
    forbidden: ForbiddenRegions,
    pool: Arc<WindowPool>,
    config: MapperConfig,
}

impl Mapper {
    /// Creates a mapper over `backing` with the given deny list.
    pub fn new(
        backing: Box<dyn PhysBacking>,
        forbidden: ForbiddenRegions,
        config: MapperConfig,
    ) -> Self {
        Mapper {
            backing,
            forbidden,
            pool: WindowPool::new(config.window_slots),
            config,
        }
    }

    /// The pool the mapper draws window slots from.
    pub fn pool(&self) -> &Arc<WindowPool> {
        &self.pool
    }

    /// Largest request accepted, in bytes.
    pub fn max_window(&self) -> u64 {
        self.config.max_window
    }

    /// Maps the minimal page-aligned window covering `req`.
    ///
    /// The returned window yields exactly the requested bytes; the page
    /// rounding is internal. Fails without consuming a pool slot.
    pub fn map(&self, req: MappingRequest) -> Result<MappingWindow, MapError> {
        if req.len == 0 {
            return Err(MapError::InvalidArgument("zero-length request"));
        }
        if req.len > self.config.max_window {
            return Err(MapError::InvalidArgument("request exceeds window size limit"));
        }
        if req.range().is_none() {
            return Err(MapError::InvalidArgument("request wraps the address space"));
        }

        let page_base = req.addr.page_base();
        let offset = req.addr.page_offset();
        let map_len = align_up(offset as u64 + req.len, PAGE_SIZE as u64);
        let map_end = page_base
            .as_u64()
            .checked_add(map_len)
            .ok_or(MapError::InvalidArgument("request wraps the address space"))?;
        // The forbidden check covers the whole page-rounded window, not just
        // the requested bytes: the backing maps full pages, and a forbidden
        // range need not be page-aligned.
        let mapped = PhysRange::new(page_base.as_u64(), map_end);
        if let Some(region) = self.forbidden.overlaps(&mapped) {
            warn!("rejecting read of {} (+{}): forbidden", req.addr, req.len);
            return Err(MapError::ForbiddenRegion(region));
        }

        let permit = self.pool.try_acquire().ok_or(MapError::OutOfResources)?;

        let map_len = map_len as usize;
        trace!(
            "mapping {} bytes at {} for {} byte read at {}",
            map_len, page_base, req.len, req.addr
        );
        let pages = self
            .backing
            .map_pages(page_base, map_len)
            .map_err(MapError::Backing)?;
        debug_assert!(pages.len() >= map_len);

        Ok(MappingWindow {
            pages,
            offset,
            len: req.len as usize,
            _permit: permit,
        })
    }
}

/// One mapped acquisition window.
///
/// Owns its pool slot and page mapping; both are released when the window is
/// dropped, whatever path got us there.
pub struct MappingWindow {
    pages: Box<dyn MappedPages>,
    offset: usize,
    len: usize,
    _permit: PoolPermit,
}

impl MappingWindow {
    /// Number of bytes visible through the window.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the window is empty. It never is; requests of length
    /// zero are rejected before a window exists.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies the requested bytes into `out`.
    ///
    /// `out` must be exactly as long as the window. The copy either fills
    /// `out` completely or fails; callers must not expose `out` on error.
    pub fn copy_out(&self, out: &mut [u8]) -> io::Result<()> {
        if out.len() != self.len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "destination length does not match window",
            ));
        }
        self.pages.read(self.offset, out)
    }
}

/// Backing that maps a memory device node (`/dev/mem`-like) read-only.
pub struct DevMemBacking {
    path: PathBuf,
}

impl DevMemBacking {
    /// Creates a backing over the device node at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        DevMemBacking {
            path: path.as_ref().to_path_buf(),
        }
    }
}

struct DevMemPages {
    ptr: *mut libc::c_void,
    len: usize,
}

// The mapping is private and read-only.
unsafe impl Send for DevMemPages {}

impl MappedPages for DevMemPages {
    fn len(&self) -> usize {
        self.len
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> io::Result<()> {
        if offset
            .checked_add(out.len())
            .is_none_or(|end| end > self.len)
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "read outside mapped pages",
            ));
        }
        unsafe {
            ptr::copy_nonoverlapping(
                (self.ptr as *const u8).add(offset),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(())
    }
}

impl Drop for DevMemPages {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.ptr, self.len) };
    }
}

impl PhysBacking for DevMemBacking {
    fn map_pages(&self, base: PhysAddr, len: usize) -> io::Result<Box<dyn MappedPages>> {
        let file = OpenOptions::new().read(true).open(&self.path)?;
        let p = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                base.as_u64() as libc::off_t,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        debug!("mapped {} bytes of {} at {}", len, self.path.display(), base);
        Ok(Box::new(DevMemPages { ptr: p, len }))
    }
}

/// In-memory fake physical memory.
///
/// Serves a flat byte buffer as the machine's physical address space. This
/// is the mock context the core is exercised with in tests: harnesses write
/// known patterns, read them back through the full protocol path, and can
/// inject a copy fault to exercise the `CopyFailed` reporting.
#[derive(Clone)]
pub struct MemBacking {
    mem: Arc<Mutex<Vec<u8>>>,
    copy_fault: Arc<AtomicBool>,
}

impl MemBacking {
    /// Creates `size` bytes of zeroed fake physical memory.
    pub fn new(size: usize) -> Self {
        MemBacking {
            mem: Arc::new(Mutex::new(vec![0u8; size])),
            copy_fault: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Writes `bytes` at physical address `addr`.
    ///
    /// # Panics
    ///
    /// Panics if the write falls outside the backing buffer; harness bug.
    pub fn write(&self, addr: PhysAddr, bytes: &[u8]) {
        let mut mem = self.mem.lock().unwrap_or_else(|e| e.into_inner());
        let start = addr.as_u64() as usize;
        mem[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Makes the next window copy fail, as if the user buffer faulted.
    pub fn inject_copy_fault(&self) {
        self.copy_fault.store(true, Ordering::Release);
    }
}

struct SnapshotPages {
    data: Vec<u8>,
    copy_fault: Arc<AtomicBool>,
}

impl MappedPages for SnapshotPages {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> io::Result<()> {
        if self.copy_fault.swap(false, Ordering::AcqRel) {
            return Err(io::Error::other("injected copy fault"));
        }
        let end = offset
            .checked_add(out.len())
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "read outside mapped pages")
            })?;
        out.copy_from_slice(&self.data[offset..end]);
        Ok(())
    }
}

impl PhysBacking for MemBacking {
    fn map_pages(&self, base: PhysAddr, len: usize) -> io::Result<Box<dyn MappedPages>> {
        let mem = self.mem.lock().unwrap_or_else(|e| e.into_inner());
        let start = base.as_u64() as usize;
        let end = start.checked_add(len).filter(|&end| end <= mem.len());
        let Some(end) = end else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range beyond end of physical memory",
            ));
        };
        Ok(Box::new(SnapshotPages {
            data: mem[start..end].to_vec(),
            copy_fault: Arc::clone(&self.copy_fault),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_mapper(forbidden: ForbiddenRegions) -> (Mapper, MemBacking) {
        let backing = MemBacking::new(1 << 20);
        let mapper = Mapper::new(
            Box::new(backing.clone()),
            forbidden,
            MapperConfig {
                max_window: 64 << 10,
                window_slots: 2,
            },
        );
        (mapper, backing)
    }

    #[test]
    fn map_returns_exact_request_despite_page_rounding() {
        let (mapper, backing) = test_mapper(ForbiddenRegions::default());
        backing.write(PhysAddr::new(0x1ffe), &[0xaa, 0xbb, 0xcc, 0xdd]);

        let window = mapper
            .map(MappingRequest::new(PhysAddr::new(0x1ffe), 4))
            .unwrap();
        assert_eq!(window.len(), 4);
        let mut out = [0u8; 4];
        window.copy_out(&mut out).unwrap();
        assert_eq!(out, [0xaa, 0xbb, 0xcc, 0xdd]);
    }

    #[test]
    fn pool_balance_after_map_unmap() {
        let (mapper, _) = test_mapper(ForbiddenRegions::default());
        assert_eq!(mapper.pool().active(), 0);
        {
            let _w1 = mapper.map(MappingRequest::new(PhysAddr::new(0), 16)).unwrap();
            let _w2 = mapper
                .map(MappingRequest::new(PhysAddr::new(0x4000), 16))
                .unwrap();
            assert_eq!(mapper.pool().active(), 2);
        }
        assert_eq!(mapper.pool().active(), 0);
    }

    #[test]
    fn pool_exhaustion_fails_fast() {
        let (mapper, _) = test_mapper(ForbiddenRegions::default());
        let _w1 = mapper.map(MappingRequest::new(PhysAddr::new(0), 16)).unwrap();
        let _w2 = mapper.map(MappingRequest::new(PhysAddr::new(0), 16)).unwrap();
        assert!(matches!(
            mapper.map(MappingRequest::new(PhysAddr::new(0), 16)),
            Err(MapError::OutOfResources)
        ));
        drop(_w1);
        assert!(mapper.map(MappingRequest::new(PhysAddr::new(0), 16)).is_ok());
    }

    #[test]
    fn forbidden_region_rejected_without_allocation() {
        let (mapper, _) =
            test_mapper(ForbiddenRegions::new([PhysRange::new(0x2000, 0x3000)]));
        let result = mapper.map(MappingRequest::new(PhysAddr::new(0x2ff0), 0x20));
        assert!(matches!(result, Err(MapError::ForbiddenRegion(_))));
        assert_eq!(mapper.pool().active(), 0);
    }

    #[test]
    fn sub_page_forbidden_region_blocks_its_whole_page() {
        // iomem-derived deny lists are not page-aligned; the mapped pages
        // must not cover forbidden bytes even when the requested range
        // stays clear of them
        let (mapper, _) =
            test_mapper(ForbiddenRegions::new([PhysRange::new(0x2800, 0x3000)]));
        let result = mapper.map(MappingRequest::new(PhysAddr::new(0x2000), 0x100));
        assert!(matches!(result, Err(MapError::ForbiddenRegion(_))));
        assert_eq!(mapper.pool().active(), 0);

        // the neighbouring pages stay readable
        assert!(mapper.map(MappingRequest::new(PhysAddr::new(0x1f00), 0x100)).is_ok());
        assert!(mapper.map(MappingRequest::new(PhysAddr::new(0x3000), 0x100)).is_ok());
    }

    #[test]
    fn invalid_requests_rejected() {
        let (mapper, _) = test_mapper(ForbiddenRegions::default());
        assert!(matches!(
            mapper.map(MappingRequest::new(PhysAddr::new(0), 0)),
            Err(MapError::InvalidArgument(_))
        ));
        assert!(matches!(
            mapper.map(MappingRequest::new(PhysAddr::new(u64::MAX), 2)),
            Err(MapError::InvalidArgument(_))
        ));
        assert!(matches!(
            mapper.map(MappingRequest::new(PhysAddr::new(0), (64 << 10) + 1)),
            Err(MapError::InvalidArgument(_))
        ));
    }

    #[test]
    fn backing_failure_releases_slot() {
        let (mapper, _) = test_mapper(ForbiddenRegions::default());
        // beyond the 1 MiB fake memory
        let result = mapper.map(MappingRequest::new(PhysAddr::new(2 << 20), 16));
        assert!(matches!(result, Err(MapError::Backing(_))));
        assert_eq!(mapper.pool().active(), 0);
    }
}
