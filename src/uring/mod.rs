//! Ring ownership and lifecycle.
//!
//! `Uring` performs the setup syscall, maps the three shared-memory
//! regions, hands the typed submission/completion queues out, and tears
//! everything down exactly once. All unsafe shared-memory access in the
//! crate lives under this module.

pub mod cq;
pub mod sq;
pub mod sys;
pub mod user_data;

use std::os::fd::RawFd;
use std::sync::atomic::AtomicU32;

pub use cq::CompletionQueue;
pub use sq::SubmissionQueue;
pub use user_data::{OpKind, UserData};

use crate::error::Error;

struct Mmap {
    ptr: *mut u8,
    len: usize,
}

impl Mmap {
    fn map(fd: RawFd, len: usize, offset: i64) -> Result<Mmap, Error> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::RingSetup(format!(
                "mmap of ring region at offset {offset:#x} failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Mmap {
            ptr: ptr as *mut u8,
            len,
        })
    }

    fn unmap(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
            self.ptr = std::ptr::null_mut();
        }
    }

    /// # Safety
    /// `offset` must lie within the mapping and be suitably aligned.
    unsafe fn at(&self, offset: u32) -> *mut u8 {
        unsafe { self.ptr.add(offset as usize) }
    }
}

/// An io_uring instance: ring fd, mapped regions, and the two queues.
pub struct Uring {
    ring_fd: RawFd,
    registered_index: Option<u32>,
    sq_ring: Mmap,
    /// `None` when the kernel serves both rings from a single mapping.
    cq_ring: Option<Mmap>,
    sqes: Mmap,
    pub sq: SubmissionQueue,
    pub cq: CompletionQueue,
    closed: bool,
}

impl Uring {
    /// Create the ring and map its shared memory.
    ///
    /// `entries` must be a power of two. With `register_ring_fd` the ring
    /// fd is registered with the kernel so enter calls go through the
    /// registered-ring fast path; on kernels without that feature the
    /// plain fd is used and a debug event is logged.
    pub fn setup(entries: u32, register_ring_fd: bool) -> Result<Uring, Error> {
        assert!(
            entries.is_power_of_two(),
            "ring entries must be a power of two"
        );

        let mut params = sys::IoUringParams::default();
        let ring_fd = sys::io_uring_setup(entries, &mut params)
            .map_err(|e| Error::RingSetup(format!("io_uring_setup: {e}")))?;

        match Self::map_rings(ring_fd, &params, register_ring_fd) {
            Ok(uring) => Ok(uring),
            Err(e) => {
                unsafe {
                    libc::close(ring_fd);
                }
                Err(e)
            }
        }
    }

    fn map_rings(
        ring_fd: RawFd,
        params: &sys::IoUringParams,
        register_ring_fd: bool,
    ) -> Result<Uring, Error> {
        let sq_ring_len =
            params.sq_off.array as usize + params.sq_entries as usize * std::mem::size_of::<u32>();
        let cq_ring_len = params.cq_off.cqes as usize + params.cq_entries as usize * cq::SIZEOF_CQE;
        let single_mmap = params.features & sys::IORING_FEAT_SINGLE_MMAP != 0;

        let mut sq_ring = if single_mmap {
            Mmap::map(
                ring_fd,
                sq_ring_len.max(cq_ring_len),
                sys::IORING_OFF_SQ_RING,
            )?
        } else {
            Mmap::map(ring_fd, sq_ring_len, sys::IORING_OFF_SQ_RING)?
        };

        let mut cq_ring = if single_mmap {
            None
        } else {
            match Mmap::map(ring_fd, cq_ring_len, sys::IORING_OFF_CQ_RING) {
                Ok(m) => Some(m),
                Err(e) => {
                    sq_ring.unmap();
                    return Err(e);
                }
            }
        };

        let sqes_len = params.sq_entries as usize * sq::SIZEOF_SQE;
        let sqes = match Mmap::map(ring_fd, sqes_len, sys::IORING_OFF_SQES) {
            Ok(m) => m,
            Err(e) => {
                sq_ring.unmap();
                if let Some(ref mut m) = cq_ring {
                    m.unmap();
                }
                return Err(e);
            }
        };

        // The index array never changes after this: identity-map it once so
        // slot publication is just the tail advance.
        unsafe {
            let array = sq_ring.at(params.sq_off.array) as *mut u32;
            for i in 0..params.sq_entries {
                array.add(i as usize).write(i);
            }
        }

        let (enter_fd, registered_index) = if register_ring_fd {
            Self::register_ring_fd(ring_fd)
        } else {
            (ring_fd, None)
        };

        let cq_base = cq_ring.as_ref().unwrap_or(&sq_ring);
        let sq_mask = unsafe { *(sq_ring.at(params.sq_off.ring_mask) as *const u32) };
        let cq_mask = unsafe { *(cq_base.at(params.cq_off.ring_mask) as *const u32) };

        let sq = unsafe {
            SubmissionQueue::from_raw(
                sq_ring.at(params.sq_off.head) as *const AtomicU32,
                sq_ring.at(params.sq_off.tail) as *const AtomicU32,
                sqes.ptr,
                sq_mask,
                params.sq_entries,
                enter_fd,
                registered_index.is_some(),
            )
        };
        let cq = unsafe {
            CompletionQueue::from_raw(
                cq_base.at(params.cq_off.head) as *const AtomicU32,
                cq_base.at(params.cq_off.tail) as *const AtomicU32,
                cq_base.at(params.cq_off.cqes),
                cq_mask,
            )
        };

        Ok(Uring {
            ring_fd,
            registered_index,
            sq_ring,
            cq_ring,
            sqes,
            sq,
            cq,
            closed: false,
        })
    }

    fn register_ring_fd(ring_fd: RawFd) -> (RawFd, Option<u32>) {
        let mut update = sys::RsrcUpdate {
            offset: u32::MAX,
            resv: 0,
            data: ring_fd as u64,
        };
        let res = sys::io_uring_register(
            ring_fd,
            sys::IORING_REGISTER_RING_FDS,
            &mut update as *mut sys::RsrcUpdate as *mut libc::c_void,
            1,
        );
        if res == 1 {
            (update.offset as RawFd, Some(update.offset))
        } else {
            tracing::debug!(errno = -res, "ring fd registration unavailable");
            (ring_fd, None)
        }
    }

    /// Probe whether this kernel supports io_uring at all.
    pub fn is_supported() -> bool {
        let mut params = sys::IoUringParams::default();
        match sys::io_uring_setup(2, &mut params) {
            Ok(fd) => {
                unsafe {
                    libc::close(fd);
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Tear the ring down: unregister, invalidate both queues, unmap all
    /// regions, close the fd. Further queue use fails fast.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(index) = self.registered_index.take() {
            let mut update = sys::RsrcUpdate {
                offset: index,
                resv: 0,
                data: 0,
            };
            // Best effort; the fd close below reclaims it regardless.
            sys::io_uring_register(
                self.ring_fd,
                sys::IORING_UNREGISTER_RING_FDS,
                &mut update as *mut sys::RsrcUpdate as *mut libc::c_void,
                1,
            );
        }

        self.sq.on_close();
        self.cq.on_close();

        self.sqes.unmap();
        self.sq_ring.unmap();
        if let Some(ref mut m) = self.cq_ring {
            m.unmap();
        }

        unsafe {
            libc::close(self.ring_fd);
        }
        self.ring_fd = -1;
    }
}

impl Drop for Uring {
    fn drop(&mut self) {
        self.close();
    }
}
