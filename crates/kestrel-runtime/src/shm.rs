//! Per-worker shared-memory snapshot region
//!
//! One fixed-size anonymous `MAP_SHARED` mapping per worker, allocated
//! by the master before fork so both sides address the same pages. The
//! owning worker is the only writer; the master is the only reader.
//! There are no locks: each snapshot is a self-delimited text blob whose
//! NUL terminator is written strictly after the payload, so a reader
//! that races a writer sees either the previous snapshot or a correctly
//! framed prefix of the new one.

use kestrel_core::error::{ProxyError, ProxyResult};

use std::sync::atomic::{fence, Ordering};

/// Default region size per worker
pub const SHARED_REGION_SIZE: usize = 1 << 20;

/// One worker's snapshot window
pub struct SharedRegion {
    ptr: *mut u8,
    size: usize,
}

// Safety: exactly one writer (the owning worker) and one reader (the
// master) by construction; the NUL framing plus the release fence in
// write_snapshot make torn reads tolerable.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Map an anonymous shared region. Fresh pages are zero-filled, so a
    /// never-written region reads as absent.
    pub fn alloc(size: usize) -> ProxyResult<SharedRegion> {
        if size < 2 {
            return Err(ProxyError::Internal("shared region too small"));
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(crate::os_err());
        }
        Ok(SharedRegion {
            ptr: ptr as *mut u8,
            size,
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Publish one snapshot. Worker side only.
    pub fn write_snapshot(&self, payload: &[u8]) -> ProxyResult<()> {
        if payload.len() + 1 > self.size {
            return Err(ProxyError::Internal("snapshot exceeds shared region"));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), self.ptr, payload.len());
            // terminator goes in after the payload is in place
            fence(Ordering::Release);
            *self.ptr.add(payload.len()) = 0;
        }
        Ok(())
    }

    /// Read the current snapshot. Master side only.
    ///
    /// Returns `None` for a region that is empty or mid-write (no
    /// terminator within bounds).
    pub fn read_snapshot(&self) -> Option<Vec<u8>> {
        fence(Ordering::Acquire);
        let bytes = unsafe { std::slice::from_raw_parts(self.ptr, self.size) };
        let len = bytes.iter().position(|b| *b == 0)?;
        if len == 0 {
            return None;
        }
        Some(bytes[..len].to_vec())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
        self.ptr = std::ptr::null_mut();
    }
}
