use crate::{PAGE_SIZE, RblkError, Result};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;

/// Zero-initialised, page-aligned memory used for shared fault areas and
/// registered memory regions.
pub struct PageBuffer {
    ptr: NonNull<u8>,
    len: usize,
    capacity: usize,
    locked: bool,
}

impl PageBuffer {
    /// Allocate a zeroed buffer of `len` usable bytes. The allocation itself
    /// is rounded up to whole pages.
    ///
    /// # Errors
    /// Returns an error if memory allocation fails.
    pub fn zeroed(len: usize) -> Result<Self> {
        let capacity = len.max(1).next_multiple_of(PAGE_SIZE);
        let layout =
            Layout::from_size_align(capacity, PAGE_SIZE).map_err(|_| RblkError::AllocFailed(len))?;

        // SAFETY: layout has a non-zero size and a valid power-of-two alignment
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(RblkError::AllocFailed(capacity))?;

        Ok(Self {
            ptr,
            len,
            capacity,
            locked: false,
        })
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for capacity >= len bytes, all initialised by alloc_zeroed
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len bytes and we hold exclusive access
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes actually reserved, always a whole number of pages.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy `dst.len()` bytes starting at `offset` into `dst`.
    ///
    /// # Errors
    /// Returns `OutOfBounds` if the range leaves the buffer.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let range = self.checked_range(offset, dst.len())?;
        dst.copy_from_slice(&self.as_slice()[range]);
        Ok(())
    }

    /// Copy `src` into the buffer starting at `offset`.
    ///
    /// # Errors
    /// Returns `OutOfBounds` if the range leaves the buffer.
    pub fn write_at(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        let range = self.checked_range(offset, src.len())?;
        self.as_mut_slice()[range].copy_from_slice(src);
        Ok(())
    }

    fn checked_range(&self, offset: usize, len: usize) -> Result<std::ops::Range<usize>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(offset..end),
            _ => Err(RblkError::OutOfBounds {
                position: offset as u64,
                length: len as u64,
                size: self.len as u64,
            }),
        }
    }

    /// Pin the buffer in RAM so remote access never hits a swapped page.
    ///
    /// # Errors
    /// Returns an error if mlock fails (e.g., insufficient privileges or limits).
    #[cfg(target_os = "linux")]
    pub fn mlock(&mut self) -> Result<()> {
        // SAFETY: ptr is valid for capacity bytes
        let result = unsafe { libc::mlock(self.ptr.as_ptr() as *const libc::c_void, self.capacity) };
        if result != 0 {
            return Err(RblkError::MlockFailed(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        self.locked = true;
        Ok(())
    }

    /// Lock the buffer in memory (no-op on non-Linux platforms).
    ///
    /// # Errors
    ///
    /// Returns `Ok(())` on non-Linux platforms (no-op).
    #[cfg(not(target_os = "linux"))]
    pub fn mlock(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        {
            if self.locked {
                // SAFETY: same range that was passed to mlock
                unsafe {
                    libc::munlock(self.ptr.as_ptr() as *const libc::c_void, self.capacity);
                }
            }
        }
        // SAFETY: Layout was valid during allocation, so it must be valid here
        if let Ok(layout) = Layout::from_size_align(self.capacity, PAGE_SIZE) {
            unsafe {
                dealloc(self.ptr.as_ptr(), layout);
            }
        }
    }
}

unsafe impl Send for PageBuffer {}
unsafe impl Sync for PageBuffer {}

impl std::fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("locked", &self.locked)
            .finish()
    }
}
