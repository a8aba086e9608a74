//! Cursors over caller owned buffers
//!
//! A transfer in flight keeps its buffers as raw cursors so the interrupt
//! handler can reach them without holding a borrow. The bus manager hands
//! buffers in either for the manager's lifetime (non-blocking calls) or for
//! the duration of a blocking call that tears the transfer down before
//! returning. Contexts drop their cursors when a transfer ends, so a cursor
//! never outlives the borrow it was created from.

use core::ptr;

/// Read cursor over a transmit buffer
#[derive(Debug)]
pub(crate) struct TxCursor {
    ptr: *const u8,
    len: usize,
    pos: usize,
}

// Safety: the cursor is only dereferenced by the context owning it, which is
// guarded by a critical section.
unsafe impl Send for TxCursor {}

impl TxCursor {
    pub(crate) const fn empty() -> Self {
        Self {
            ptr: ptr::null(),
            len: 0,
            pos: 0,
        }
    }

    pub(crate) fn new(buffer: &[u8]) -> Self {
        Self {
            ptr: buffer.as_ptr(),
            len: buffer.len(),
            pos: 0,
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.len - self.pos
    }

    pub(crate) fn next(&mut self) -> Option<u8> {
        if self.pos == self.len {
            return None;
        }
        // Safety: `pos < len` and the buffer outlives the cursor.
        let byte = unsafe { self.ptr.add(self.pos).read() };
        self.pos += 1;
        Some(byte)
    }

    /// Unsent part of the buffer, for DMA programming
    pub(crate) fn rest(&self) -> (*mut u8, usize) {
        // Safety: `pos <= len`, so the result stays within the buffer.
        let start = unsafe { self.ptr.add(self.pos) };
        (start as *mut u8, self.remaining())
    }

    /// Account for `count` bytes moved by DMA.
    pub(crate) fn skip(&mut self, count: usize) {
        self.pos = (self.pos + count).min(self.len);
    }
}

/// Write cursor over a receive buffer
#[derive(Debug)]
pub(crate) struct RxCursor {
    ptr: *mut u8,
    len: usize,
    pos: usize,
}

// Safety: see `TxCursor`.
unsafe impl Send for RxCursor {}

impl RxCursor {
    pub(crate) const fn empty() -> Self {
        Self {
            ptr: ptr::null_mut(),
            len: 0,
            pos: 0,
        }
    }

    pub(crate) fn new(buffer: &mut [u8]) -> Self {
        Self {
            ptr: buffer.as_mut_ptr(),
            len: buffer.len(),
            pos: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn received(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.len - self.pos
    }

    /// Store `byte`, returns `false` if the buffer is already full.
    pub(crate) fn push(&mut self, byte: u8) -> bool {
        if self.pos == self.len {
            return false;
        }
        // Safety: `pos < len` and the buffer outlives the cursor.
        unsafe { self.ptr.add(self.pos).write(byte) };
        self.pos += 1;
        true
    }

    /// Unfilled part of the buffer, for DMA programming
    pub(crate) fn rest(&self) -> (*mut u8, usize) {
        // Safety: `pos <= len`, so the result stays within the buffer.
        (unsafe { self.ptr.add(self.pos) }, self.remaining())
    }

    /// Account for `count` bytes stored by DMA.
    pub(crate) fn advance(&mut self, count: usize) {
        self.pos = (self.pos + count).min(self.len);
    }

    /// Turn the cursor back into the buffer it was created from.
    ///
    /// # Safety
    /// The cursor must have been created from a `&'a mut [u8]` and no other
    /// cursor over the same buffer may exist.
    pub(crate) unsafe fn into_slice<'a>(self) -> Option<&'a mut [u8]> {
        if self.ptr.is_null() {
            return None;
        }
        Some(core::slice::from_raw_parts_mut(self.ptr, self.len))
    }
}
