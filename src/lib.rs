//! tpcio: a thread-per-core asynchronous I/O engine.
//!
//! Each reactor owns a thread, an io_uring instance driven through raw
//! shared memory, and a private registry of sockets. Application threads
//! interact with a reactor only through lock-free handoff points: the
//! external task queue, the socket flush protocol, and opaque metrics.

pub mod config;
pub mod error;
pub mod reactor;
pub mod scheduler;
pub mod socket;
pub mod uring;

// Public API re-exports
pub use config::{Backend, Config};
pub use error::Error;
pub use reactor::{Reactor, ReactorHandle};
pub use scheduler::NetworkScheduler;
pub use socket::options::{
    SockOpt, SO_KEEPALIVE, SO_RCVBUF, SO_REUSEADDR, SO_REUSEPORT, SO_SNDBUF, TCP_KEEPCNT,
    TCP_KEEPIDLE, TCP_KEEPINTVL, TCP_NODELAY,
};
pub use socket::{AsyncSocket, AsyncSocketBuilder, Metrics, Options, SocketReader};
pub use uring::Uring;
