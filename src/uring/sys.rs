//! Raw io_uring kernel ABI: syscalls, setup structs, and constants.
//!
//! Layouts and values match the Linux UAPI (`linux/io_uring.h`). Everything
//! above this module works with the shared rings through the typed wrappers
//! in `sq`/`cq`; nothing else in the crate issues ring syscalls.

use std::io;
use std::os::fd::RawFd;

pub const SYS_IO_URING_SETUP: libc::c_long = 425;
pub const SYS_IO_URING_ENTER: libc::c_long = 426;
pub const SYS_IO_URING_REGISTER: libc::c_long = 427;

// Opcodes used by this engine.
pub const IORING_OP_NOP: u8 = 0;
pub const IORING_OP_READ: u8 = 22;
pub const IORING_OP_WRITE: u8 = 23;
pub const IORING_OP_SEND: u8 = 26;
pub const IORING_OP_RECV: u8 = 27;

// io_uring_enter flags.
pub const IORING_ENTER_GETEVENTS: u32 = 1 << 0;
pub const IORING_ENTER_REGISTERED_RING: u32 = 1 << 4;

// io_uring_setup features.
pub const IORING_FEAT_SINGLE_MMAP: u32 = 1 << 0;

// mmap offsets for the three ring regions.
pub const IORING_OFF_SQ_RING: i64 = 0;
pub const IORING_OFF_CQ_RING: i64 = 0x800_0000;
pub const IORING_OFF_SQES: i64 = 0x1000_0000;

// io_uring_register opcodes.
pub const IORING_REGISTER_RING_FDS: u32 = 20;
pub const IORING_UNREGISTER_RING_FDS: u32 = 21;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SqringOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub flags: u32,
    pub dropped: u32,
    pub array: u32,
    pub resv1: u32,
    pub resv2: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CqringOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub overflow: u32,
    pub cqes: u32,
    pub flags: u32,
    pub resv1: u32,
    pub resv2: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct IoUringParams {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub flags: u32,
    pub sq_thread_cpu: u32,
    pub sq_thread_idle: u32,
    pub features: u32,
    pub wq_fd: u32,
    pub resv: [u32; 3],
    pub sq_off: SqringOffsets,
    pub cq_off: CqringOffsets,
}

/// Argument for `IORING_REGISTER_RING_FDS` / `IORING_UNREGISTER_RING_FDS`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RsrcUpdate {
    pub offset: u32,
    pub resv: u32,
    pub data: u64,
}

pub fn io_uring_setup(entries: u32, params: &mut IoUringParams) -> io::Result<RawFd> {
    let res = unsafe {
        libc::syscall(
            SYS_IO_URING_SETUP,
            entries as libc::c_ulong,
            params as *mut IoUringParams,
        )
    };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as RawFd)
    }
}

/// Notify the kernel of `to_submit` pending entries and optionally wait for
/// `min_complete` completions. Returns the number of entries consumed, or
/// a negated errno.
pub fn io_uring_enter(fd: RawFd, to_submit: u32, min_complete: u32, flags: u32) -> i32 {
    let res = unsafe {
        libc::syscall(
            SYS_IO_URING_ENTER,
            fd,
            to_submit as libc::c_ulong,
            min_complete as libc::c_ulong,
            flags as libc::c_ulong,
            std::ptr::null::<libc::c_void>(),
            0usize,
        )
    };
    if res < 0 {
        -io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL)
    } else {
        res as i32
    }
}

pub fn io_uring_register(
    fd: RawFd,
    opcode: u32,
    arg: *mut libc::c_void,
    nr_args: u32,
) -> i32 {
    let res = unsafe {
        libc::syscall(
            SYS_IO_URING_REGISTER,
            fd,
            opcode as libc::c_ulong,
            arg,
            nr_args as libc::c_ulong,
        )
    };
    if res < 0 {
        -io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL)
    } else {
        res as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_layout_matches_uapi() {
        // The offsets structs are 40 bytes each and the params header is
        // 40 bytes, giving the 120-byte io_uring_params the kernel expects.
        assert_eq!(std::mem::size_of::<SqringOffsets>(), 40);
        assert_eq!(std::mem::size_of::<CqringOffsets>(), 40);
        assert_eq!(std::mem::size_of::<IoUringParams>(), 120);
        assert_eq!(std::mem::size_of::<RsrcUpdate>(), 16);
    }
}
