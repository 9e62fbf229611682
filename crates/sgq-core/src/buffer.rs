//! Per-thread buffer pool
//!
//! Every in-flight command owns one [`AlignedBuf`]: a page-aligned data area
//! the driver transfers into or out of, plus a heap-pinned sense area. Idle
//! buffers wait on the pool's free list and are reused before anything new
//! is allocated. The pool is owned by one worker and never shared.

use crate::error::BufferError;
use crate::sg::sys::SENSE_BUFF_LEN;
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Fallback when the page size cannot be queried.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// System page size.
pub fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        DEFAULT_PAGE_SIZE
    }
}

/// Page-aligned data buffer with its own sense area.
#[derive(Debug)]
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
    sense: Box<[u8; SENSE_BUFF_LEN]>,
}

// SAFETY: the allocation is uniquely owned; whoever holds the buffer is the
// only one touching it.
unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    /// Allocate `len` zeroed bytes aligned to `align`.
    pub fn new(len: usize, align: usize) -> Result<Self, BufferError> {
        let layout = Layout::from_size_align(len.max(1), align)
            .map_err(|_| BufferError::Layout { len, align })?;
        // SAFETY: layout has non-zero size
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(BufferError::AllocationFailed(layout.size()))?;
        Ok(Self {
            ptr,
            len,
            layout,
            sense: Box::new([0u8; SENSE_BUFF_LEN]),
        })
    }

    /// Data length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a buffer with no data area.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Data pointer handed to the driver.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Data area.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes while self is alive
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutable data area.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len bytes and uniquely borrowed
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Sense pointer handed to the driver. Stable for the buffer's life.
    pub fn sense_ptr(&mut self) -> *mut u8 {
        self.sense.as_mut_ptr()
    }

    /// Sense bytes written by the last completion.
    pub fn sense(&self) -> &[u8] {
        &self.sense[..]
    }

    /// Clear the sense area before reuse.
    pub fn clear_sense(&mut self) {
        self.sense.fill(0);
    }

    /// Allocation alignment.
    pub fn align(&self) -> usize {
        self.layout.align()
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: allocated with this exact layout in new()
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Allocation counters for one pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Fresh allocations.
    pub allocated: u64,
    /// Allocations freed by `drain`.
    pub freed: u64,
    /// Acquisitions served from the free list.
    pub reused: u64,
    /// Most buffers checked out at once.
    pub peak_out: u64,
}

impl BufferPoolStats {
    /// Allocations that were never returned and freed.
    pub fn leaked(&self) -> u64 {
        self.allocated.saturating_sub(self.freed)
    }

    /// True when something allocated was not freed.
    pub fn has_leaks(&self) -> bool {
        self.allocated != self.freed
    }
}

/// Free list of equally sized buffers.
#[derive(Debug)]
pub struct BufferPool {
    free: Vec<AlignedBuf>,
    buf_len: usize,
    align: usize,
    out: u64,
    stats: BufferPoolStats,
}

impl BufferPool {
    /// Pool of page-aligned `buf_len`-byte buffers.
    pub fn new(buf_len: usize) -> Self {
        Self::with_alignment(buf_len, page_size())
    }

    /// Pool with an explicit alignment.
    pub fn with_alignment(buf_len: usize, align: usize) -> Self {
        Self {
            free: Vec::new(),
            buf_len,
            align,
            out: 0,
            stats: BufferPoolStats::default(),
        }
    }

    /// Take a buffer, reusing an idle one when available.
    pub fn acquire(&mut self) -> Result<AlignedBuf, BufferError> {
        let buf = match self.free.pop() {
            Some(mut buf) => {
                self.stats.reused += 1;
                buf.clear_sense();
                buf
            }
            None => {
                let buf = AlignedBuf::new(self.buf_len, self.align)?;
                self.stats.allocated += 1;
                buf
            }
        };
        self.out += 1;
        self.stats.peak_out = self.stats.peak_out.max(self.out);
        Ok(buf)
    }

    /// Return a buffer to the free list.
    pub fn release(&mut self, buf: AlignedBuf) {
        debug_assert_eq!(buf.len(), self.buf_len);
        self.out = self.out.saturating_sub(1);
        self.free.push(buf);
    }

    /// Free every idle buffer; returns how many were freed.
    pub fn drain(&mut self) -> usize {
        let n = self.free.len();
        self.free.clear();
        self.stats.freed += n as u64;
        n
    }

    /// Buffers currently checked out.
    pub fn outstanding(&self) -> u64 {
        self.out
    }

    /// Idle buffers on the free list.
    pub fn idle(&self) -> usize {
        self.free.len()
    }

    /// Data length of every buffer in this pool.
    pub fn buf_len(&self) -> usize {
        self.buf_len
    }

    /// Allocation counters.
    pub fn stats(&self) -> BufferPoolStats {
        self.stats
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.drain();
    }
}
