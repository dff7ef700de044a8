//! Ring-buffer bookkeeping over a fixed slice of sample memory
//!
//! The buffer never owns an allocation. It is handed a region at configure time and only tracks
//! where the next write lands and whether the region has been filled at least once. Every
//! conversion from a ring address to a linear, oldest-first offset goes through
//! [`CircularBuffer::convert_address`].

use core::ptr::NonNull;

/// Fixed memory region with wraparound bookkeeping.
pub struct CircularBuffer {
    base: *mut u8,
    max_size: usize,
    size: usize,
    cursor: usize,
    wrapped: bool,
}

// The region is exclusively owned by whichever engine holds the buffer.
unsafe impl Send for CircularBuffer {}

impl CircularBuffer {
    /// Represents a `CircularBuffer` without any memory behind it
    pub const fn empty() -> Self {
        CircularBuffer {
            base: core::ptr::null_mut(),
            max_size: 0,
            size: 0,
            cursor: 0,
            wrapped: false,
        }
    }

    /// # Safety
    ///
    /// Caller must ensure `base` points to an allocation of at least `max_size` bytes that lives
    /// as long as the buffer, and that nothing but this buffer and the hardware it feeds touches
    /// that memory.
    pub unsafe fn init(base: NonNull<u8>, max_size: usize) -> Self {
        CircularBuffer {
            base: base.as_ptr(),
            max_size,
            size: max_size,
            cursor: 0,
            wrapped: false,
        }
    }

    /// Takes over a whole static region.
    pub fn from_static(region: &'static mut [u8]) -> Self {
        let len = region.len();
        // Safety: the exclusive borrow of a 'static slice is consumed here.
        unsafe { Self::init(NonNull::from(region).cast(), len) }
    }

    /// Shrinks the usable size. Callers trim `actual` to a whole tuple; never call while armed.
    pub fn resize(&mut self, actual: usize) {
        self.size = actual.min(self.max_size);
        self.reset();
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
        self.wrapped = false;
    }

    /// Address of the first byte of the region.
    pub fn base(&self) -> usize {
        self.base as usize
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Offset of the next write.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn wrapped(&self) -> bool {
        self.wrapped
    }

    /// The buffer has completed at least one full pass.
    pub fn full(&self) -> bool {
        self.wrapped
    }

    pub fn used_size(&self) -> usize {
        if self.wrapped {
            self.size
        } else {
            self.cursor
        }
    }

    /// Address of the oldest byte.
    pub fn first_addr(&self) -> usize {
        if self.wrapped {
            self.base() + self.cursor
        } else {
            self.base()
        }
    }

    /// Converts a ring address into a linear offset with the oldest byte at 0.
    pub fn convert_address(&self, addr: usize) -> usize {
        let first = self.first_addr();
        if addr >= first {
            addr - first
        } else {
            addr - self.base() + self.size - self.cursor
        }
    }

    /// Folds an address at or past the end of the region back into it.
    pub fn wrap_address(&self, addr: usize) -> usize {
        match self.size {
            0 => self.base(),
            size => self.base() + (addr - self.base()) % size,
        }
    }

    /// Address of the `len`-byte tuple written last, or the base if nothing was written yet.
    pub fn last_written(&self, len: usize) -> usize {
        if self.cursor >= len {
            self.base() + self.cursor - len
        } else if self.wrapped {
            self.base() + self.size - len
        } else {
            self.base()
        }
    }

    /// Moves the cursor forward by `len` bytes, wrapping at most once.
    pub fn advance(&mut self, len: usize) {
        self.cursor += len;
        if self.cursor >= self.size {
            self.cursor -= self.size;
            self.wrapped = true;
        }
    }

    /// Copies a tuple in at the cursor and advances past it.
    ///
    /// `size` is a whole multiple of the tuple length, so a tuple never straddles the end.
    pub fn write(&mut self, tuple: &[u8]) {
        debug_assert!(self.cursor + tuple.len() <= self.size);
        // Safety: the cursor stays below `size <= max_size`, and `init` guarantees the region.
        unsafe {
            core::ptr::copy_nonoverlapping(tuple.as_ptr(), self.base.add(self.cursor), tuple.len());
        }
        self.advance(tuple.len());
    }

    /// Points the cursor at a hardware write pointer. Wraparound is tracked by the caller.
    pub fn sync_to(&mut self, addr: usize) {
        self.cursor = self.wrap_address(addr) - self.base();
    }

    pub fn mark_wrapped(&mut self) {
        self.wrapped = true;
    }

    /// Captured bytes, oldest first.
    pub fn contents(&self) -> (&[u8], &[u8]) {
        if self.size == 0 {
            return (&[], &[]);
        }
        // Safety: `init` guarantees `max_size` readable bytes behind `base`.
        let mem = unsafe { core::slice::from_raw_parts(self.base, self.size) };
        if self.wrapped {
            let (newer, older) = mem.split_at(self.cursor);
            (older, newer)
        } else {
            (&mem[..self.cursor], &[])
        }
    }
}

impl Default for CircularBuffer {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
pub(crate) fn leak(size: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; size].into_boxed_slice())
}
