//! Completion side of the ring.
//!
//! The kernel is the producer here: it publishes completions with a tail
//! advance, so the tail is read with Acquire and the consumed head is
//! stored with Release. Completions arrive in arbitrary order relative to
//! submission and are matched through user_data alone.

use std::sync::atomic::{AtomicU32, Ordering};

// Byte offsets of the fields within a 16-byte completion record.
pub const OFFSET_CQE_USER_DATA: usize = 0;
pub const OFFSET_CQE_RES: usize = 8;
pub const OFFSET_CQE_FLAGS: usize = 12;
pub const SIZEOF_CQE: usize = 16;

pub struct CompletionQueue {
    /// Consumer index, advanced here and read by the kernel.
    head: *const AtomicU32,
    /// Producer index, advanced by the kernel.
    tail: *const AtomicU32,
    cqes: *const u8,
    ring_mask: u32,
    local_head: u32,
}

impl CompletionQueue {
    /// Build a queue over ring memory.
    ///
    /// # Safety
    ///
    /// `head`, `tail` and `cqes` must point to a live ring mapping, and
    /// this queue must be the only consumer for that ring.
    pub(crate) unsafe fn from_raw(
        head: *const AtomicU32,
        tail: *const AtomicU32,
        cqes: *const u8,
        ring_mask: u32,
    ) -> Self {
        let local_head = unsafe { (*head).load(Ordering::Acquire) };
        CompletionQueue {
            head,
            tail,
            cqes,
            ring_mask,
            local_head,
        }
    }

    /// Whether the kernel has published completions we have not consumed.
    pub fn has_pending(&self) -> bool {
        self.assert_open();
        let tail = unsafe { (*self.tail).load(Ordering::Acquire) };
        tail != self.local_head
    }

    /// Drain all published completions, handing each
    /// (user_data, result, flags) triple to `f`. Returns how many were
    /// consumed. The consumed head is republished so the kernel can reuse
    /// the slots.
    pub fn process<F: FnMut(u64, i32, u32)>(&mut self, mut f: F) -> u32 {
        self.assert_open();
        let tail = unsafe { (*self.tail).load(Ordering::Acquire) };
        let mut head = self.local_head;
        let mut consumed = 0;

        while head != tail {
            let index = head & self.ring_mask;
            unsafe {
                let cqe = self.cqes.add(index as usize * SIZEOF_CQE);
                let user_data = (cqe.add(OFFSET_CQE_USER_DATA) as *const u64).read();
                let res = (cqe.add(OFFSET_CQE_RES) as *const i32).read();
                let flags = (cqe.add(OFFSET_CQE_FLAGS) as *const u32).read();
                f(user_data, res, flags);
            }
            head = head.wrapping_add(1);
            consumed += 1;
        }

        if consumed > 0 {
            self.local_head = head;
            unsafe { (*self.head).store(head, Ordering::Release) };
        }
        consumed
    }

    /// Invalidate the queue on ring teardown.
    pub(crate) fn on_close(&mut self) {
        self.head = std::ptr::null();
        self.tail = std::ptr::null();
        self.cqes = std::ptr::null();
        self.ring_mask = 0;
    }

    fn assert_open(&self) {
        assert!(!self.cqes.is_null(), "completion queue used after close");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// u64-backed completion storage so record reads land aligned, as
    /// they do in the real mapping.
    struct FakeRing {
        entries: u32,
        head: Box<AtomicU32>,
        tail: Box<AtomicU32>,
        cqes: Vec<u64>,
    }

    impl FakeRing {
        fn new(entries: u32) -> Self {
            FakeRing {
                entries,
                head: Box::new(AtomicU32::new(0)),
                tail: Box::new(AtomicU32::new(0)),
                cqes: vec![0u64; entries as usize * SIZEOF_CQE / 8],
            }
        }

        fn cq(&mut self) -> CompletionQueue {
            unsafe {
                CompletionQueue::from_raw(
                    &*self.head,
                    &*self.tail,
                    self.cqes.as_ptr() as *const u8,
                    self.entries - 1,
                )
            }
        }

        /// Publish a completion the way the kernel would.
        fn push(&mut self, user_data: u64, res: i32, flags: u32) {
            let tail = self.tail.load(Ordering::Acquire);
            let base = (tail & (self.entries - 1)) as usize * SIZEOF_CQE;
            unsafe {
                let cqe = (self.cqes.as_mut_ptr() as *mut u8).add(base);
                (cqe.add(OFFSET_CQE_USER_DATA) as *mut u64).write(user_data);
                (cqe.add(OFFSET_CQE_RES) as *mut i32).write(res);
                (cqe.add(OFFSET_CQE_FLAGS) as *mut u32).write(flags);
            }
            self.tail.store(tail.wrapping_add(1), Ordering::Release);
        }
    }

    #[test]
    fn test_process_drains_published_completions() {
        let mut ring = FakeRing::new(4);
        let mut cq = ring.cq();
        assert!(!cq.has_pending());

        ring.push(7, 100, 0);
        ring.push(8, -11, 1);
        assert!(cq.has_pending());

        let mut seen = Vec::new();
        let consumed = cq.process(|user_data, res, flags| seen.push((user_data, res, flags)));
        assert_eq!(consumed, 2);
        assert_eq!(seen, vec![(7, 100, 0), (8, -11, 1)]);

        // Head was republished for the kernel.
        assert_eq!(ring.head.load(Ordering::Acquire), 2);
        assert!(!cq.has_pending());
        assert_eq!(cq.process(|_, _, _| panic!("nothing to consume")), 0);
    }

    #[test]
    fn test_process_wraps_around_the_ring() {
        let mut ring = FakeRing::new(4);
        let mut cq = ring.cq();

        for round in 0..3u64 {
            for i in 0..3 {
                ring.push(round * 10 + i, 0, 0);
            }
            let mut seen = Vec::new();
            cq.process(|user_data, _, _| seen.push(user_data));
            assert_eq!(seen, vec![round * 10, round * 10 + 1, round * 10 + 2]);
        }
        assert_eq!(ring.head.load(Ordering::Acquire), 9);
    }

    #[test]
    #[should_panic(expected = "used after close")]
    fn test_use_after_close_panics() {
        let mut ring = FakeRing::new(4);
        let mut cq = ring.cq();
        cq.on_close();
        let _ = cq.has_pending();
    }
}
