use std::fmt;
use std::io;

/// Errors returned by the tpcio engine.
#[derive(Debug)]
pub enum Error {
    /// I/O error from a plain syscall.
    Io(io::Error),
    /// Ring setup failed (mmap, io_uring_setup).
    RingSetup(String),
    /// io_uring_enter returned a negative result. Fatal to the ring.
    SubmitFailed {
        /// The kernel errno (positive).
        errno: i32,
        /// Human-readable description of the errno.
        description: String,
    },
    /// Requested backend is not available on this kernel.
    Unsupported(String),
    /// A configuration value failed validation.
    InvalidConfig(String),
    /// The option key is not supported on this platform.
    UnsupportedOption(&'static str),
    /// The reactor thread is gone (shut down or crashed).
    ReactorClosed,
}

impl Error {
    /// Build a `SubmitFailed` from a positive kernel errno.
    pub(crate) fn submit_failed(errno: i32) -> Self {
        Error::SubmitFailed {
            errno,
            description: io::Error::from_raw_os_error(errno).to_string(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::RingSetup(msg) => write!(f, "ring setup: {msg}"),
            Error::SubmitFailed { errno, description } => {
                write!(
                    f,
                    "io_uring_enter failed with errno {errno} '{description}'"
                )
            }
            Error::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            Error::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Error::UnsupportedOption(name) => write!(f, "unsupported socket option: {name}"),
            Error::ReactorClosed => write!(f, "reactor is closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
