//! Registered memory regions and address translation.
//!
//! A context can only move bytes through memory it has registered. Transfers
//! name buffers by virtual address; the engine translates an address range by
//! finding the live region that fully contains it. A local miss is a page
//! fault; a remote miss is reported to the sender as a NACK.

use std::alloc::{self, Layout};
use std::collections::BTreeMap;
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use parking_lot::RwLock;

/// Page size used for region alignment.
pub const PAGE_SIZE: usize = 4096;

bitflags! {
    /// Memory access flags for region registration.
    ///
    /// Local read access is always enabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u32 {
        /// The owning context may write the region (GET destination).
        const LOCAL_WRITE = 1 << 0;
        /// Remote contexts may read the region (GET source).
        const REMOTE_READ = 1 << 1;
        /// Remote contexts may write the region (PUT destination).
        const REMOTE_WRITE = 1 << 2;
    }
}

impl Default for Access {
    fn default() -> Self {
        Access::all()
    }
}

/// Marker trait for plain-old-data values that can be copied in and out of a
/// region byte-for-byte.
///
/// # Safety
/// Implementors must be `Copy`, contain no padding-sensitive invariants and be
/// valid for every bit pattern.
pub unsafe trait Plain: Copy {}

unsafe impl Plain for u8 {}
unsafe impl Plain for u16 {}
unsafe impl Plain for u32 {}
unsafe impl Plain for u64 {}
unsafe impl Plain for usize {}
unsafe impl Plain for i8 {}
unsafe impl Plain for i16 {}
unsafe impl Plain for i32 {}
unsafe impl Plain for i64 {}
unsafe impl Plain for isize {}
unsafe impl Plain for f32 {}
unsafe impl Plain for f64 {}
unsafe impl<T: Plain, const N: usize> Plain for [T; N] {}

// =============================================================================
// Region storage
// =============================================================================

pub(crate) struct RegionInner {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
    access: Access,
}

// The region is device-visible memory: the engine thread copies through the
// raw pointer while the owner reads and writes it.
unsafe impl Send for RegionInner {}
unsafe impl Sync for RegionInner {}

impl RegionInner {
    fn alloc(len: usize, access: Access) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "region size must be non-zero",
            ));
        }
        let size = len
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "region too large"))?;
        let layout = Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;

        Ok(Self {
            ptr,
            len,
            layout,
            access,
        })
    }

    #[inline]
    pub(crate) fn base(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    #[inline]
    pub(crate) fn ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for RegionInner {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// A translated address range: the region and the offset into it.
#[derive(Clone)]
pub(crate) struct Translation {
    pub(crate) region: Arc<RegionInner>,
    pub(crate) offset: usize,
}

impl Translation {
    /// Pointer to `offset` bytes past the translated address.
    ///
    /// # Safety
    /// `offset` must stay within the translated span.
    #[inline]
    pub(crate) unsafe fn at(&self, offset: usize) -> *mut u8 {
        unsafe { self.region.ptr().add(self.offset + offset) }
    }
}

/// Copy `len` bytes between two translated ranges.
///
/// # Safety
/// Both ranges must have been translated for a span covering
/// `offset + len` bytes.
#[inline]
pub(crate) unsafe fn copy_segment(
    src: &Translation,
    src_offset: usize,
    dst: &Translation,
    dst_offset: usize,
    len: usize,
) {
    // `copy` rather than `copy_nonoverlapping`: loopback transfers may stay
    // inside one region.
    unsafe { std::ptr::copy(src.at(src_offset), dst.at(dst_offset), len) };
}

// =============================================================================
// Address space
// =============================================================================

/// Registered regions of one context.
pub(crate) struct AddressSpace {
    regions: RwLock<BTreeMap<u64, Arc<RegionInner>>>,
    translation: AtomicBool,
}

impl AddressSpace {
    pub(crate) fn new() -> Self {
        Self {
            regions: RwLock::new(BTreeMap::new()),
            translation: AtomicBool::new(true),
        }
    }

    pub(crate) fn set_translation(&self, enabled: bool) {
        self.translation.store(enabled, Ordering::Release);
    }

    pub(crate) fn translation_enabled(&self) -> bool {
        self.translation.load(Ordering::Acquire)
    }

    fn register(&self, region: Arc<RegionInner>) {
        self.regions.write().insert(region.base(), region);
    }

    fn unregister(&self, base: u64) {
        self.regions.write().remove(&base);
    }

    /// Translate a local buffer `[addr, addr + len)`.
    ///
    /// Fails if translation is disabled, or the range does not lie inside one
    /// region that grants `needed`.
    pub(crate) fn translate(&self, addr: u64, len: usize, needed: Access) -> Option<Translation> {
        if !self.translation_enabled() {
            return None;
        }
        self.lookup(addr, len, needed)
    }

    /// Look up a range on behalf of a remote context. Ignores the local
    /// translation switch.
    pub(crate) fn lookup(&self, addr: u64, len: usize, needed: Access) -> Option<Translation> {
        let end = addr.checked_add(len as u64)?;
        let regions = self.regions.read();
        let (&base, region) = regions.range(..=addr).next_back()?;
        if end > base + region.len as u64 || !region.access.contains(needed) {
            return None;
        }
        Some(Translation {
            region: Arc::clone(region),
            offset: (addr - base) as usize,
        })
    }

    #[cfg(test)]
    pub(crate) fn region_count(&self) -> usize {
        self.regions.read().len()
    }
}

// =============================================================================
// MemoryRegion
// =============================================================================

/// A page-aligned, zero-initialised buffer registered with a context.
///
/// The region is unregistered when dropped; transfers already in flight keep
/// the memory alive until they finish.
///
/// # Concurrency
/// The engine reads and writes the region asynchronously, so the accessors
/// are `unsafe`: a range handed to an in-flight transfer must not be touched
/// until the transfer reports a terminal status. `wait_send`, `fence` and a
/// settled `wait_recv` are the points after which access is sound again.
pub struct MemoryRegion {
    inner: Arc<RegionInner>,
    space: Arc<AddressSpace>,
}

impl MemoryRegion {
    pub(crate) fn register(space: &Arc<AddressSpace>, len: usize, access: Access) -> io::Result<Self> {
        let inner = Arc::new(RegionInner::alloc(len, access)?);
        space.register(Arc::clone(&inner));
        Ok(Self {
            inner,
            space: Arc::clone(space),
        })
    }

    /// Virtual address of the first byte.
    pub fn addr(&self) -> u64 {
        self.inner.base()
    }

    /// Virtual address `offset` bytes into the region.
    pub fn addr_at(&self, offset: usize) -> u64 {
        self.addr() + offset as u64
    }

    /// Registered length in bytes.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn access(&self) -> Access {
        self.inner.access
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.inner.len),
            "access [{}, +{}) out of bounds for region of {} bytes",
            offset,
            len,
            self.inner.len
        );
    }

    /// Read a value at byte `offset`.
    ///
    /// # Safety
    /// No transfer in flight may write `[offset, offset + size_of::<T>())`.
    pub unsafe fn read<T: Plain>(&self, offset: usize) -> T {
        self.check(offset, size_of::<T>());
        unsafe { std::ptr::read_unaligned(self.inner.ptr().add(offset) as *const T) }
    }

    /// Write a value at byte `offset`.
    ///
    /// # Safety
    /// No transfer in flight may read or write `[offset, offset + size_of::<T>())`.
    pub unsafe fn write<T: Plain>(&self, offset: usize, value: T) {
        self.check(offset, size_of::<T>());
        unsafe { std::ptr::write_unaligned(self.inner.ptr().add(offset) as *mut T, value) }
    }

    /// Read `count` consecutive values starting at byte `offset`.
    ///
    /// # Safety
    /// No transfer in flight may write the range read.
    pub unsafe fn read_slice<T: Plain>(&self, offset: usize, count: usize) -> Vec<T> {
        self.check(offset, count.checked_mul(size_of::<T>()).unwrap_or(usize::MAX));
        (0..count)
            .map(|i| unsafe { self.read(offset + i * size_of::<T>()) })
            .collect()
    }

    /// Write `values` consecutively starting at byte `offset`.
    ///
    /// # Safety
    /// No transfer in flight may read or write the range written.
    pub unsafe fn write_slice<T: Plain>(&self, offset: usize, values: &[T]) {
        self.check(offset, std::mem::size_of_val(values));
        for (i, value) in values.iter().enumerate() {
            unsafe { self.write(offset + i * size_of::<T>(), *value) };
        }
    }

    /// Copy `len` bytes starting at `offset` out of the region.
    ///
    /// # Safety
    /// No transfer in flight may write `[offset, offset + len)`.
    pub unsafe fn read_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        self.check(offset, len);
        let mut buf = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.inner.ptr().add(offset), buf.as_mut_ptr(), len);
        }
        buf
    }

    /// Copy `data` into the region at `offset`.
    ///
    /// # Safety
    /// No transfer in flight may read or write `[offset, offset + data.len())`.
    pub unsafe fn write_bytes(&self, offset: usize, data: &[u8]) {
        self.check(offset, data.len());
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.inner.ptr().add(offset), data.len());
        }
    }

    /// Fill the whole region with `pattern`.
    ///
    /// # Safety
    /// No transfer in flight may touch the region.
    pub unsafe fn fill(&self, pattern: u8) {
        unsafe { std::ptr::write_bytes(self.inner.ptr(), pattern, self.inner.len) };
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        self.space.unregister(self.inner.base());
    }
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len())
            .field("access", &self.access())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> Arc<AddressSpace> {
        Arc::new(AddressSpace::new())
    }

    #[test]
    fn test_region_is_zeroed_and_aligned() {
        let space = space();
        let region = MemoryRegion::register(&space, 100, Access::all()).unwrap();
        assert_eq!(region.addr() as usize % PAGE_SIZE, 0);
        assert_eq!(region.len(), 100);
        // No transfers on a bare address space.
        assert!(unsafe { region.read_bytes(0, 100) }.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_length_rejected() {
        let space = space();
        assert!(MemoryRegion::register(&space, 0, Access::all()).is_err());
    }

    #[test]
    fn test_typed_access() {
        let space = space();
        let region = MemoryRegion::register(&space, 64, Access::all()).unwrap();
        unsafe {
            region.write_slice(4, &[1i32, -2, 3]);
            assert_eq!(region.read::<i32>(8), -2);
            assert_eq!(region.read_slice::<i32>(4, 3), vec![1, -2, 3]);
            region.write::<u64>(56, u64::MAX);
            assert_eq!(region.read::<u64>(56), u64::MAX);
        }
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_out_of_bounds_panics() {
        let space = space();
        let region = MemoryRegion::register(&space, 16, Access::all()).unwrap();
        unsafe { region.write::<u64>(12, 0) };
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_read_slice_length_overflow_panics() {
        let space = space();
        let region = MemoryRegion::register(&space, 16, Access::all()).unwrap();
        let _ = unsafe { region.read_slice::<u64>(0, usize::MAX / 4) };
    }

    #[test]
    fn test_translate_inside_and_outside() {
        let space = space();
        let region = MemoryRegion::register(&space, 256, Access::all()).unwrap();
        let base = region.addr();

        let t = space.translate(base + 16, 64, Access::empty()).unwrap();
        assert_eq!(t.offset, 16);
        assert!(space.translate(base, 256, Access::empty()).is_some());
        assert!(space.translate(base + 200, 57, Access::empty()).is_none());
        assert!(space.translate(base - 1, 8, Access::empty()).is_none());
        assert!(space.translate(0, 8, Access::empty()).is_none());
    }

    #[test]
    fn test_translate_checks_access() {
        let space = space();
        let region = MemoryRegion::register(&space, 64, Access::REMOTE_READ).unwrap();
        assert!(space.translate(region.addr(), 8, Access::REMOTE_READ).is_some());
        assert!(space.translate(region.addr(), 8, Access::REMOTE_WRITE).is_none());
        assert!(space.translate(region.addr(), 8, Access::LOCAL_WRITE).is_none());
    }

    #[test]
    fn test_translation_toggle() {
        let space = space();
        let region = MemoryRegion::register(&space, 64, Access::all()).unwrap();
        space.set_translation(false);
        assert!(space.translate(region.addr(), 8, Access::empty()).is_none());
        assert!(space.lookup(region.addr(), 8, Access::empty()).is_some());
        space.set_translation(true);
        assert!(space.translate(region.addr(), 8, Access::empty()).is_some());
    }

    #[test]
    fn test_drop_unregisters() {
        let space = space();
        let region = MemoryRegion::register(&space, 64, Access::all()).unwrap();
        let addr = region.addr();
        assert_eq!(space.region_count(), 1);
        drop(region);
        assert_eq!(space.region_count(), 0);
        assert!(space.translate(addr, 8, Access::empty()).is_none());
    }

    #[test]
    fn test_copy_segment_within_region() {
        let space = space();
        let region = MemoryRegion::register(&space, 64, Access::all()).unwrap();
        let t = space.translate(region.addr(), 64, Access::empty()).unwrap();
        unsafe {
            region.write_bytes(0, &[1, 2, 3, 4, 5, 6, 7, 8]);
            copy_segment(&t, 0, &t, 4, 8);
            assert_eq!(region.read_bytes(0, 12), vec![1, 2, 3, 4, 1, 2, 3, 4, 5, 6, 7, 8]);
        }
    }
}
