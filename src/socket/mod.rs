//! Asynchronous sockets and the flush/backpressure protocol.
//!
//! Any thread may enqueue outbound data; exactly one thread at a time is
//! responsible for getting the socket drained. Responsibility is a single
//! atomic cell holding the id of the owning thread (0 = unowned): whoever
//! CASes it from unowned becomes responsible and must hand the socket to
//! the owning reactor's scheduler. A traditional lock would serialize
//! producers on every write; here the common case (already flushed) is one
//! atomic read.

pub mod metrics;
pub mod options;

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use crossbeam_queue::ArrayQueue;

use crate::error::Error;
use crate::reactor::{current_thread_id, ReactorHandle};

pub use metrics::Metrics;
pub use options::{Options, SockOpt};

/// Flush cell value meaning "no one is responsible for draining".
const UNOWNED: u64 = 0;

/// Consumes inbound bytes for a socket.
///
/// `on_read` runs only on the owning reactor thread, is never reentrant,
/// and never runs concurrently with itself for the same socket.
pub trait SocketReader: Send {
    /// Called once when the socket is registered on its reactor.
    fn init(&mut self, _socket: &Arc<AsyncSocket>) {}

    /// Process a window of received bytes. The window is only valid for
    /// the duration of the call.
    fn on_read(&mut self, data: &[u8]);
}

/// A socket whose reads and writes are executed on a reactor.
pub struct AsyncSocket {
    fd: RawFd,
    /// Thread id of the current flush owner, or `UNOWNED`.
    flush_owner: AtomicU64,
    write_queue: ArrayQueue<Bytes>,
    reactor: ReactorHandle,
    metrics: Metrics,
    options: Options,
    started: AtomicBool,
    closed: AtomicBool,
    /// Held until `start` hands it to the reactor.
    reader: Mutex<Option<Box<dyn SocketReader>>>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl AsyncSocket {
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn reactor(&self) -> &ReactorHandle {
        &self.reactor
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    /// Enqueue a write unit without scheduling the socket.
    ///
    /// Returns false when the queue is full; the rejection doubles as the
    /// backpressure signal and a flush is triggered so the queued backlog
    /// starts moving. The caller decides whether to retry or drop.
    pub fn write(self: &Arc<Self>, buf: Bytes) -> bool {
        if self.write_queue.push(buf).is_ok() {
            true
        } else {
            self.flush();
            false
        }
    }

    /// `write` followed by `flush`.
    pub fn write_and_flush(self: &Arc<Self>, buf: Bytes) -> bool {
        let accepted = self.write(buf);
        self.flush();
        accepted
    }

    /// Ensure queued output gets scheduled for draining. Thread-safe.
    pub fn flush(self: &Arc<Self>) {
        if self.flush_owner.load(Ordering::Acquire) != UNOWNED {
            // Someone is already responsible.
            return;
        }

        if self
            .flush_owner
            .compare_exchange(
                UNOWNED,
                current_thread_id(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Lost the race; the winner schedules.
            return;
        }

        // This thread just became responsible for the drain.
        if self.reactor.on_eventloop_thread() {
            self.reactor.scheduler().schedule(self.clone());
        } else {
            self.reactor.scheduler().schedule(self.clone());
            self.reactor.wakeup();
        }
    }

    /// Give up flush ownership after draining the queue to empty.
    ///
    /// Called only by the owning reactor thread. The queue re-check closes
    /// the window where a producer enqueued against the still-owned cell
    /// and skipped triggering a flush; without it that item would sit
    /// unflushed indefinitely.
    pub(crate) fn reset_flushed(self: &Arc<Self>) {
        self.flush_owner.store(UNOWNED, Ordering::Release);

        if self.write_queue.is_empty() {
            return;
        }
        self.flush();
    }

    /// Fused write + flush fast path for the owning reactor thread.
    ///
    /// Skips the cross-thread scheduling machinery of `flush`.
    ///
    /// # Panics
    ///
    /// Panics when called from any thread other than the owning reactor's.
    pub fn inside_write_and_flush(self: &Arc<Self>, buf: Bytes) -> bool {
        assert!(
            self.reactor.on_eventloop_thread(),
            "inside_write_and_flush called off the eventloop thread"
        );

        let triggered = self.flush_owner.load(Ordering::Acquire) == UNOWNED
            && self
                .flush_owner
                .compare_exchange(
                    UNOWNED,
                    current_thread_id(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();

        let accepted = self.write_queue.push(buf).is_ok();

        if triggered {
            // A rejected push means the queue is full, hence non-empty;
            // ownership was taken either way so the drain is scheduled.
            self.reactor.scheduler().schedule(self.clone());
        }

        accepted
    }

    /// Start the socket: register it with the owning reactor, arm the
    /// first receive, and release the builder's flush ownership.
    ///
    /// # Panics
    ///
    /// Panics when the socket is started twice.
    pub fn start(self: &Arc<Self>) -> Result<(), Error> {
        assert!(
            !self.started.swap(true, Ordering::AcqRel),
            "socket already started"
        );
        let reader = self
            .reader
            .lock()
            .unwrap()
            .take()
            .expect("socket reader missing");
        self.reactor.register_socket(self.clone(), reader)
    }

    /// Close the socket. Proxied through the owning reactor when the
    /// socket was started, so teardown never races in-flight submissions.
    pub fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.started.load(Ordering::Acquire) {
            if self.fd >= 0 {
                unsafe {
                    libc::close(self.fd);
                }
            }
            return;
        }
        self.reactor.close_socket(self.fd);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn pop_write(&self) -> Option<Bytes> {
        self.write_queue.pop()
    }

    pub(crate) fn write_queue_is_empty(&self) -> bool {
        self.write_queue.is_empty()
    }

    #[cfg(test)]
    fn flush_owner_raw(&self) -> u64 {
        self.flush_owner.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for AsyncSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSocket")
            .field("fd", &self.fd)
            .field("local", &self.local_addr)
            .field("peer", &self.peer_addr)
            .finish()
    }
}

/// Builder for `AsyncSocket`. Takes ownership of a connected fd.
pub struct AsyncSocketBuilder {
    reactor: ReactorHandle,
    fd: RawFd,
    reader: Option<Box<dyn SocketReader>>,
    write_queue_capacity: usize,
}

impl AsyncSocketBuilder {
    pub fn new(reactor: ReactorHandle, fd: RawFd) -> Self {
        let write_queue_capacity = reactor.default_write_queue_capacity();
        AsyncSocketBuilder {
            reactor,
            fd,
            reader: None,
            write_queue_capacity,
        }
    }

    pub fn reader(mut self, reader: impl SocketReader + 'static) -> Self {
        self.reader = Some(Box::new(reader));
        self
    }

    pub fn write_queue_capacity(mut self, capacity: usize) -> Self {
        self.write_queue_capacity = capacity;
        self
    }

    /// Build the socket. The flush cell starts owned by the calling
    /// thread; `start` releases it once the reactor has taken over.
    pub fn build(self) -> Result<Arc<AsyncSocket>, Error> {
        if self.write_queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "write_queue_capacity must be positive".into(),
            ));
        }

        let socket = Arc::new(AsyncSocket {
            fd: self.fd,
            flush_owner: AtomicU64::new(current_thread_id()),
            write_queue: ArrayQueue::new(self.write_queue_capacity),
            reactor: self.reactor,
            metrics: Metrics::new(),
            options: Options::new(self.fd),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            reader: Mutex::new(None),
            local_addr: sock_name(self.fd, false),
            peer_addr: sock_name(self.fd, true),
        });

        if let Some(mut reader) = self.reader {
            reader.init(&socket);
            *socket.reader.lock().unwrap() = Some(reader);
        }

        Ok(socket)
    }
}

fn sock_name(fd: RawFd, peer: bool) -> Option<SocketAddr> {
    if fd < 0 {
        return None;
    }
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let res = unsafe {
        let addr = &mut storage as *mut _ as *mut libc::sockaddr;
        if peer {
            libc::getpeername(fd, addr, &mut len)
        } else {
            libc::getsockname(fd, addr, &mut len)
        }
    };
    if res != 0 {
        return None;
    }

    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sa.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sa.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sa.sin6_addr.s6_addr),
                u16::from_be(sa.sin6_port),
                sa.sin6_flowinfo,
                sa.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

#[cfg(test)]
pub(crate) struct NopReader;

#[cfg(test)]
impl SocketReader for NopReader {
    fn on_read(&mut self, _data: &[u8]) {}
}
