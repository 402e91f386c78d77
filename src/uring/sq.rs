//! Submission side of the ring: descriptor layout, slot reservation, and
//! tail publication.
//!
//! The engine is the only producer; the kernel consumes the tail and
//! advances the head. A descriptor must be fully written before the tail
//! advance makes it visible, so the tail store is Release and head reads
//! are Acquire. Local shadows of both indices keep the hot path free of
//! atomic loads; the shadow head is refreshed only when the ring looks
//! full. Index arithmetic wraps modulo 2^32 and is never compared signed.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::Error;
use crate::uring::sys;

// Byte offsets of the fields within a 64-byte submission descriptor.
pub const OFFSET_SQE_OPCODE: usize = 0;
pub const OFFSET_SQE_FLAGS: usize = 1;
pub const OFFSET_SQE_IOPRIO: usize = 2;
pub const OFFSET_SQE_FD: usize = 4;
pub const OFFSET_SQE_OFF: usize = 8;
pub const OFFSET_SQE_ADDR: usize = 16;
pub const OFFSET_SQE_LEN: usize = 24;
pub const OFFSET_SQE_RW_FLAGS: usize = 28;
pub const OFFSET_SQE_USER_DATA: usize = 32;
pub const SIZEOF_SQE: usize = 64;

/// The ring-buffer submission channel shared with the kernel.
pub struct SubmissionQueue {
    /// Consumer index, advanced by the kernel.
    head: *const AtomicU32,
    /// Producer index, advanced here and read by the kernel.
    tail: *const AtomicU32,
    /// Base of the descriptor array.
    sqes: *mut u8,
    ring_mask: u32,
    ring_entries: u32,
    local_head: u32,
    local_tail: u32,
    enter_fd: RawFd,
    ring_registered: bool,
}

impl SubmissionQueue {
    /// Build a queue over ring memory.
    ///
    /// # Safety
    ///
    /// `head`, `tail` and `sqes` must point to a live ring mapping with
    /// `ring_entries` descriptor slots, and this queue must be the only
    /// producer for that ring.
    pub(crate) unsafe fn from_raw(
        head: *const AtomicU32,
        tail: *const AtomicU32,
        sqes: *mut u8,
        ring_mask: u32,
        ring_entries: u32,
        enter_fd: RawFd,
        ring_registered: bool,
    ) -> Self {
        let local_head = unsafe { (*head).load(Ordering::Acquire) };
        let local_tail = unsafe { (*tail).load(Ordering::Acquire) };
        SubmissionQueue {
            head,
            tail,
            sqes,
            ring_mask,
            ring_entries,
            local_head,
            local_tail,
            enter_fd,
            ring_registered,
        }
    }

    pub fn ring_entries(&self) -> u32 {
        self.ring_entries
    }

    /// Reserve the next writable slot, or `None` if the ring is really full.
    ///
    /// Consults the local shadows first; only when they indicate "full" is
    /// the shared head re-read (one acquire load, one retry). The refresh
    /// cost is thereby amortized over many successful reservations.
    pub fn next_index(&mut self) -> Option<u32> {
        self.assert_open();

        if self.local_tail.wrapping_sub(self.local_head) == self.ring_entries {
            let stale_head = self.local_head;
            self.local_head = unsafe { (*self.head).load(Ordering::Acquire) };
            if stale_head == self.local_head {
                // The head did not move; there really is no space.
                return None;
            }
        }

        let tail = self.local_tail;
        self.local_tail = self.local_tail.wrapping_add(1);
        Some(tail & self.ring_mask)
    }

    /// Populate all descriptor fields for a reserved slot.
    ///
    /// Plain stores; the Release on the tail in `submit` orders them
    /// before the kernel can observe the slot.
    #[allow(clippy::too_many_arguments)]
    pub fn write_sqe(
        &mut self,
        index: u32,
        opcode: u8,
        flags: u8,
        rw_flags: u32,
        fd: RawFd,
        buffer_addr: u64,
        length: u32,
        offset: u64,
        user_data: u64,
    ) {
        self.assert_open();
        debug_assert!(index < self.ring_entries);
        unsafe {
            let sqe = self.sqes.add(index as usize * SIZEOF_SQE);
            std::ptr::write_bytes(sqe, 0, SIZEOF_SQE);
            *sqe.add(OFFSET_SQE_OPCODE) = opcode;
            *sqe.add(OFFSET_SQE_FLAGS) = flags;
            (sqe.add(OFFSET_SQE_IOPRIO) as *mut u16).write(0);
            (sqe.add(OFFSET_SQE_FD) as *mut i32).write(fd);
            (sqe.add(OFFSET_SQE_OFF) as *mut u64).write(offset);
            (sqe.add(OFFSET_SQE_ADDR) as *mut u64).write(buffer_addr);
            (sqe.add(OFFSET_SQE_LEN) as *mut u32).write(length);
            (sqe.add(OFFSET_SQE_RW_FLAGS) as *mut u32).write(rw_flags);
            (sqe.add(OFFSET_SQE_USER_DATA) as *mut u64).write(user_data);
        }
    }

    /// Reserve a slot and write a descriptor into it.
    ///
    /// Returns false when the ring is full; the caller applies its own
    /// backpressure, the protocol never blocks or spins.
    #[allow(clippy::too_many_arguments)]
    pub fn offer(
        &mut self,
        opcode: u8,
        flags: u8,
        rw_flags: u32,
        fd: RawFd,
        buffer_addr: u64,
        length: u32,
        offset: u64,
        user_data: u64,
    ) -> bool {
        let index = match self.next_index() {
            Some(index) => index,
            None => return false,
        };
        self.write_sqe(
            index, opcode, flags, rw_flags, fd, buffer_addr, length, offset, user_data,
        );
        true
    }

    pub fn offer_nop(&mut self, user_data: u64) -> bool {
        self.offer(sys::IORING_OP_NOP, 0, 0, 0, 0, 0, 0, user_data)
    }

    /// Advance the kernel-visible tail over all locally reserved slots.
    /// Returns how many entries became pending.
    pub(crate) fn publish(&mut self) -> u32 {
        let tail = unsafe { (*self.tail).load(Ordering::Acquire) };
        let to_submit = self.local_tail.wrapping_sub(tail);
        if to_submit != 0 {
            unsafe { (*self.tail).store(self.local_tail, Ordering::Release) };
        }
        to_submit
    }

    /// Publish pending entries and notify the kernel without waiting.
    ///
    /// A negative enter result is fatal to the ring. The kernel accepting
    /// fewer entries than published is recoverable: the remainder stays
    /// queued for the next submit cycle.
    pub fn submit(&mut self) -> Result<u32, Error> {
        self.assert_open();
        let to_submit = self.publish();
        if to_submit == 0 {
            return Ok(0);
        }

        let res = sys::io_uring_enter(self.enter_fd, to_submit, 0, self.enter_flags());
        if res < 0 {
            return Err(Error::submit_failed(-res));
        }
        if res as u32 != to_submit {
            tracing::warn!(
                submitted = res,
                requested = to_submit,
                "kernel accepted fewer submission entries than published"
            );
        }
        Ok(to_submit)
    }

    /// Publish pending entries and block until at least one completion is
    /// available. Used only as the idle wait of the event loop.
    pub fn submit_and_wait(&mut self) -> Result<u32, Error> {
        self.assert_open();
        let to_submit = self.publish();

        let res = sys::io_uring_enter(
            self.enter_fd,
            to_submit,
            1,
            self.enter_flags() | sys::IORING_ENTER_GETEVENTS,
        );
        if res < 0 {
            return Err(Error::submit_failed(-res));
        }
        Ok(to_submit)
    }

    fn enter_flags(&self) -> u32 {
        if self.ring_registered {
            sys::IORING_ENTER_REGISTERED_RING
        } else {
            0
        }
    }

    /// Invalidate the queue on ring teardown. Any later use is a
    /// programming error and panics.
    pub(crate) fn on_close(&mut self) {
        self.head = std::ptr::null();
        self.tail = std::ptr::null();
        self.sqes = std::ptr::null_mut();
        self.ring_mask = 0;
        self.ring_entries = 0;
        self.enter_fd = -1;
        self.ring_registered = false;
    }

    fn assert_open(&self) {
        assert!(!self.sqes.is_null(), "submission queue used after close");
    }
}
