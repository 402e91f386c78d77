//! Typed socket-option surface.
//!
//! Each key carries its value type; unsupported keys are reported through
//! `Error::UnsupportedOption` rather than silently ignored.

use std::marker::PhantomData;
use std::os::fd::RawFd;

use crate::error::Error;

/// A typed socket-option key.
pub struct SockOpt<T> {
    name: &'static str,
    level: libc::c_int,
    opt: libc::c_int,
    _value: PhantomData<T>,
}

impl<T> SockOpt<T> {
    const fn new(name: &'static str, level: libc::c_int, opt: libc::c_int) -> Self {
        SockOpt {
            name,
            level,
            opt,
            _value: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

pub const SO_RCVBUF: SockOpt<i32> = SockOpt::new("SO_RCVBUF", libc::SOL_SOCKET, libc::SO_RCVBUF);
pub const SO_SNDBUF: SockOpt<i32> = SockOpt::new("SO_SNDBUF", libc::SOL_SOCKET, libc::SO_SNDBUF);
pub const SO_KEEPALIVE: SockOpt<bool> =
    SockOpt::new("SO_KEEPALIVE", libc::SOL_SOCKET, libc::SO_KEEPALIVE);
pub const SO_REUSEADDR: SockOpt<bool> =
    SockOpt::new("SO_REUSEADDR", libc::SOL_SOCKET, libc::SO_REUSEADDR);
pub const SO_REUSEPORT: SockOpt<bool> =
    SockOpt::new("SO_REUSEPORT", libc::SOL_SOCKET, libc::SO_REUSEPORT);
pub const TCP_NODELAY: SockOpt<bool> =
    SockOpt::new("TCP_NODELAY", libc::IPPROTO_TCP, libc::TCP_NODELAY);
pub const TCP_KEEPIDLE: SockOpt<i32> =
    SockOpt::new("TCP_KEEPIDLE", libc::IPPROTO_TCP, libc::TCP_KEEPIDLE);
pub const TCP_KEEPINTVL: SockOpt<i32> =
    SockOpt::new("TCP_KEEPINTVL", libc::IPPROTO_TCP, libc::TCP_KEEPINTVL);
pub const TCP_KEEPCNT: SockOpt<i32> =
    SockOpt::new("TCP_KEEPCNT", libc::IPPROTO_TCP, libc::TCP_KEEPCNT);

/// Values that convert to/from the kernel's c_int representation.
pub trait OptValue: Copy {
    fn to_c_int(self) -> libc::c_int;
    fn from_c_int(raw: libc::c_int) -> Self;
}

impl OptValue for i32 {
    fn to_c_int(self) -> libc::c_int {
        self
    }
    fn from_c_int(raw: libc::c_int) -> Self {
        raw
    }
}

impl OptValue for bool {
    fn to_c_int(self) -> libc::c_int {
        self as libc::c_int
    }
    fn from_c_int(raw: libc::c_int) -> Self {
        raw != 0
    }
}

/// Option access for one socket fd.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    fd: RawFd,
}

impl Options {
    pub(crate) fn new(fd: RawFd) -> Self {
        Options { fd }
    }

    /// Whether the key is supported on this platform.
    pub fn is_supported<T>(&self, opt: &SockOpt<T>) -> bool {
        // All defined keys exist on Linux; the keepalive tuning knobs are
        // the ones missing elsewhere.
        cfg!(target_os = "linux")
            || !matches!(opt.name, "TCP_KEEPIDLE" | "TCP_KEEPINTVL" | "TCP_KEEPCNT")
    }

    pub fn set<T: OptValue>(&self, opt: &SockOpt<T>, value: T) -> Result<(), Error> {
        if !self.is_supported(opt) {
            return Err(Error::UnsupportedOption(opt.name));
        }
        let raw = value.to_c_int();
        let res = unsafe {
            libc::setsockopt(
                self.fd,
                opt.level,
                opt.opt,
                &raw as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if res < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn get<T: OptValue>(&self, opt: &SockOpt<T>) -> Result<T, Error> {
        if !self.is_supported(opt) {
            return Err(Error::UnsupportedOption(opt.name));
        }
        let mut raw: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let res = unsafe {
            libc::getsockopt(
                self.fd,
                opt.level,
                opt.opt,
                &mut raw as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if res < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(T::from_c_int(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_fd() -> RawFd {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        fd
    }

    #[test]
    fn test_no_delay_round_trip() {
        let fd = tcp_fd();
        let options = Options::new(fd);

        options.set(&TCP_NODELAY, true).unwrap();
        assert!(options.get(&TCP_NODELAY).unwrap());
        options.set(&TCP_NODELAY, false).unwrap();
        assert!(!options.get(&TCP_NODELAY).unwrap());

        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_buffer_sizes() {
        let fd = tcp_fd();
        let options = Options::new(fd);

        options.set(&SO_RCVBUF, 1 << 16).unwrap();
        // The kernel doubles the requested value for bookkeeping.
        assert!(options.get(&SO_RCVBUF).unwrap() >= 1 << 16);

        options.set(&SO_SNDBUF, 1 << 16).unwrap();
        assert!(options.get(&SO_SNDBUF).unwrap() >= 1 << 16);

        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_keepalive_tuning() {
        let fd = tcp_fd();
        let options = Options::new(fd);

        options.set(&SO_KEEPALIVE, true).unwrap();
        assert!(options.get(&SO_KEEPALIVE).unwrap());

        options.set(&TCP_KEEPIDLE, 30).unwrap();
        assert_eq!(options.get(&TCP_KEEPIDLE).unwrap(), 30);
        options.set(&TCP_KEEPINTVL, 5).unwrap();
        assert_eq!(options.get(&TCP_KEEPINTVL).unwrap(), 5);
        options.set(&TCP_KEEPCNT, 4).unwrap();
        assert_eq!(options.get(&TCP_KEEPCNT).unwrap(), 4);

        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_reuse_flags() {
        let fd = tcp_fd();
        let options = Options::new(fd);

        options.set(&SO_REUSEADDR, true).unwrap();
        assert!(options.get(&SO_REUSEADDR).unwrap());
        options.set(&SO_REUSEPORT, true).unwrap();
        assert!(options.get(&SO_REUSEPORT).unwrap());

        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_set_on_bad_fd_reports_io_error() {
        let options = Options::new(-1);
        assert!(matches!(
            options.set(&TCP_NODELAY, true),
            Err(Error::Io(_))
        ));
    }
}
