//! Mapping primitive over `mmap`/`munmap`/`mprotect`/`madvise`.

use std::ops::Range;
use std::ptr::{self, NonNull};

use blockheap_core::malloc::{MapError, MappedRegion, PageMapper, Protection};

/// Region returned by [`OsMapper`]. Owns its pages until handed back to
/// [`OsMapper::unmap`]; dropping it without unmapping leaks the mapping.
pub struct OsRegion {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is an exclusively owned private anonymous mapping; no
// other handle to its pages exists, so moving it across threads is sound.
unsafe impl Send for OsRegion {}

impl MappedRegion for OsRegion {
    fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    fn len(&self) -> usize {
        self.len
    }

    fn slice(&self, range: Range<usize>) -> &[u8] {
        self.check_range(&range);
        // SAFETY: `range` lies inside the live mapping owned by `self`. The
        // allocator only borrows headers and the payload it is handing out,
        // never bytes a client may be writing through another pointer, and
        // never a range while the region is protected.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(range.start), range.len()) }
    }

    fn slice_mut(&mut self, range: Range<usize>) -> &mut [u8] {
        self.check_range(&range);
        // SAFETY: as in `slice`; `&mut self` excludes every other borrow made
        // through this region.
        unsafe {
            std::slice::from_raw_parts_mut(self.base.as_ptr().add(range.start), range.len())
        }
    }
}

impl OsRegion {
    fn check_range(&self, range: &Range<usize>) {
        assert!(
            range.start <= range.end && range.end <= self.len,
            "range {range:?} out of bounds for a region of {} bytes",
            self.len
        );
    }
}

/// Anonymous private memory straight from the kernel.
#[derive(Debug, Clone, Copy)]
pub struct OsMapper {
    page_size: usize,
}

impl Default for OsMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl OsMapper {
    #[must_use]
    pub fn new() -> Self {
        // SAFETY: sysconf has no preconditions.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Self {
            page_size: usize::try_from(page_size).unwrap_or(4096).max(4096),
        }
    }

    fn round_to_page(&self, size: usize) -> Option<usize> {
        Some(size.checked_add(self.page_size - 1)? & !(self.page_size - 1))
    }
}

unsafe fn os_mmap(len: usize) -> Option<NonNull<u8>> {
    // SAFETY: a fresh anonymous mapping aliases no existing memory.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        None
    } else {
        NonNull::new(ptr.cast())
    }
}

unsafe fn os_munmap(ptr: *mut u8, len: usize) -> bool {
    // SAFETY: caller passes a page-aligned range it owns.
    unsafe { libc::munmap(ptr.cast(), len) == 0 }
}

impl PageMapper for OsMapper {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn map(&mut self, size: usize, align: usize) -> Result<Box<dyn MappedRegion>, MapError> {
        if !align.is_power_of_two() {
            return Err(MapError::InvalidAlignment { align });
        }
        let align = align.max(self.page_size);
        let len = self
            .round_to_page(size)
            .filter(|&len| len > 0)
            .ok_or(MapError::OutOfMemory { size })?;

        if align == self.page_size {
            // SAFETY: `len` is a non-zero page multiple.
            let base = unsafe { os_mmap(len) }.ok_or(MapError::OutOfMemory { size })?;
            return Ok(Box::new(OsRegion { base, len }));
        }

        // Over-map by `align - page` and trim both ends to the aligned window.
        let padded = len
            .checked_add(align - self.page_size)
            .ok_or(MapError::OutOfMemory { size })?;
        // SAFETY: `padded` is a non-zero page multiple.
        let raw = unsafe { os_mmap(padded) }.ok_or(MapError::OutOfMemory { size })?;
        let raw_addr = raw.as_ptr() as usize;
        let aligned_addr = (raw_addr + align - 1) & !(align - 1);
        let head = aligned_addr - raw_addr;
        let tail = padded - head - len;

        // SAFETY: head and tail are page-aligned sub-ranges of the mapping
        // just created, disjoint from the aligned window we keep.
        unsafe {
            if head > 0 {
                os_munmap(raw.as_ptr(), head);
            }
            if tail > 0 {
                os_munmap(raw.as_ptr().add(head + len), tail);
            }
        }
        let base = NonNull::new(raw.as_ptr().wrapping_add(head))
            .ok_or(MapError::OutOfMemory { size })?;
        Ok(Box::new(OsRegion { base, len }))
    }

    fn unmap(&mut self, region: Box<dyn MappedRegion>) -> Result<(), MapError> {
        let (base, len) = (region.base(), region.len());
        drop(region);
        // SAFETY: the region owned exactly this range and has been dropped.
        if unsafe { os_munmap(ptr::with_exposed_provenance_mut(base), len) } {
            Ok(())
        } else {
            Err(MapError::UnmapFailed { base, len })
        }
    }

    fn protect(
        &mut self,
        region: &mut dyn MappedRegion,
        protection: Protection,
    ) -> Result<(), MapError> {
        let prot = match protection {
            Protection::None => libc::PROT_NONE,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        };
        let ptr = ptr::with_exposed_provenance_mut::<u8>(region.base());
        // SAFETY: `ptr..ptr + len` is the region's own mapping.
        if unsafe { libc::mprotect(ptr.cast(), region.len(), prot) } == 0 {
            Ok(())
        } else {
            Err(MapError::ProtectFailed {
                base: region.base(),
                len: region.len(),
            })
        }
    }

    #[cfg(target_os = "linux")]
    fn mark_volatile(&mut self, region: &mut dyn MappedRegion) {
        let ptr = ptr::with_exposed_provenance_mut::<u8>(region.base());
        // SAFETY: the range is the region's own mapping; discarding private
        // anonymous pages only makes them read back as zero.
        unsafe {
            libc::madvise(ptr.cast(), region.len(), libc::MADV_DONTNEED);
        }
    }

    #[cfg(target_os = "linux")]
    fn mark_nonvolatile(&mut self, _region: &mut dyn MappedRegion) -> bool {
        // MADV_DONTNEED discards eagerly, so the contents are always gone.
        true
    }
}
