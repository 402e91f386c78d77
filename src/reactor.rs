//! Reactors: one thread, one event loop, one ring.
//!
//! A reactor never migrates work to another thread. Cross-thread
//! interaction is limited to the external task queue, the scheduler
//! handoff of dirty sockets, and the eventfd wakeup; everything else is
//! owned by the loop.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use slab::Slab;

use crate::config::{Backend, Config};
use crate::error::Error;
use crate::scheduler::NetworkScheduler;
use crate::socket::{AsyncSocket, SocketReader};
use crate::uring::{sys, OpKind, Uring, UserData};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Process-unique id of the calling thread. Id 0 is reserved to mean
/// "no thread" (the unowned flush cell).
pub(crate) fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

enum Task {
    Run(Box<dyn FnOnce() + Send>),
    Register {
        socket: Arc<AsyncSocket>,
        reader: Box<dyn SocketReader>,
        done: Option<Sender<()>>,
    },
    Close {
        fd: RawFd,
    },
}

struct Shared {
    name: String,
    eventfd: RawFd,
    /// Id of the loop thread once it is running; 0 before that.
    eventloop_tid: AtomicU64,
    tasks: Sender<Task>,
    /// Soft capacity for `submit`; control messages bypass it.
    task_capacity: usize,
    scheduler: Arc<NetworkScheduler>,
    shutdown: AtomicBool,
    write_queue_capacity: usize,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if self.eventfd >= 0 {
            unsafe {
                libc::close(self.eventfd);
            }
        }
    }
}

/// Cheap, cloneable handle to a reactor. Everything on it is safe from
/// any thread.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl ReactorHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether the calling thread is the reactor's eventloop thread.
    pub fn on_eventloop_thread(&self) -> bool {
        self.shared.eventloop_tid.load(Ordering::Acquire) == current_thread_id()
    }

    /// Interrupt the reactor's idle wait.
    pub fn wakeup(&self) {
        if self.shared.eventfd >= 0 {
            let one: u64 = 1;
            unsafe {
                libc::write(
                    self.shared.eventfd,
                    &one as *const u64 as *const libc::c_void,
                    8,
                );
            }
        }
    }

    /// Run a closure on the reactor thread. Returns false when the task
    /// queue is at capacity (backpressure) or the reactor is gone.
    pub fn submit(&self, f: impl FnOnce() + Send + 'static) -> bool {
        if self.shared.tasks.len() >= self.shared.task_capacity {
            return false;
        }
        if self.shared.tasks.send(Task::Run(Box::new(f))).is_err() {
            return false;
        }
        self.wakeup();
        true
    }

    pub fn scheduler(&self) -> &NetworkScheduler {
        &self.shared.scheduler
    }

    pub(crate) fn default_write_queue_capacity(&self) -> usize {
        self.shared.write_queue_capacity
    }

    pub(crate) fn register_socket(
        &self,
        socket: Arc<AsyncSocket>,
        reader: Box<dyn SocketReader>,
    ) -> Result<(), Error> {
        if self.on_eventloop_thread() {
            // Same iteration pick-up; waiting here would deadlock.
            self.shared
                .tasks
                .send(Task::Register {
                    socket,
                    reader,
                    done: None,
                })
                .map_err(|_| Error::ReactorClosed)
        } else {
            let (done_tx, done_rx) = crossbeam_channel::bounded(1);
            self.shared
                .tasks
                .send(Task::Register {
                    socket,
                    reader,
                    done: Some(done_tx),
                })
                .map_err(|_| Error::ReactorClosed)?;
            self.wakeup();
            done_rx.recv().map_err(|_| Error::ReactorClosed)
        }
    }

    pub(crate) fn close_socket(&self, fd: RawFd) {
        let _ = self.shared.tasks.send(Task::Close { fd });
        self.wakeup();
    }

    pub(crate) fn bind_current_thread(&self) {
        self.shared
            .eventloop_tid
            .store(current_thread_id(), Ordering::Release);
    }

    /// A handle with no running loop behind it, for protocol tests.
    #[cfg(test)]
    pub(crate) fn detached(max_sockets: usize) -> ReactorHandle {
        let (tasks, task_rx) = crossbeam_channel::unbounded();
        std::mem::forget(task_rx);
        let eventfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        ReactorHandle {
            shared: Arc::new(Shared {
                name: "detached".to_string(),
                eventfd,
                eventloop_tid: AtomicU64::new(0),
                tasks,
                task_capacity: 1024,
                scheduler: Arc::new(NetworkScheduler::new(max_sockets)),
                shutdown: AtomicBool::new(false),
                write_queue_capacity: 1 << 16,
            }),
        }
    }
}

/// Owner of a reactor thread. Dropping it shuts the reactor down.
pub struct Reactor {
    handle: ReactorHandle,
    join: Option<thread::JoinHandle<Result<(), Error>>>,
}

impl Reactor {
    /// Validate the config, resolve the backend, and spawn the loop
    /// thread. Returns once the ring is set up (or setup failed).
    pub fn new(config: Config) -> Result<Reactor, Error> {
        config.validate()?;

        // The portable backend lives out of tree, so both selections
        // resolve to io_uring here.
        match config.backend {
            Backend::Auto | Backend::Uring => {
                if !Uring::is_supported() {
                    return Err(Error::Unsupported(
                        "io_uring is not available on this kernel".to_string(),
                    ));
                }
            }
        }

        let name = config.reactor_name();
        let eventfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if eventfd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        let (task_tx, task_rx) = crossbeam_channel::unbounded();
        let handle = ReactorHandle {
            shared: Arc::new(Shared {
                name: name.clone(),
                eventfd,
                eventloop_tid: AtomicU64::new(0),
                tasks: task_tx,
                task_capacity: config.external_task_queue_capacity,
                scheduler: Arc::new(NetworkScheduler::new(config.max_sockets)),
                shutdown: AtomicBool::new(false),
                write_queue_capacity: config.write_queue_capacity,
            }),
        };

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let thread_handle = {
            let handle = handle.clone();
            thread::Builder::new()
                .name(name)
                .spawn(move || {
                    if let Some(core) = config.pin_to_core {
                        if let Err(e) = pin_to_core(core) {
                            let _ = ready_tx.send(Err(e));
                            return Ok(());
                        }
                    }
                    handle.bind_current_thread();
                    let mut eventloop = match Eventloop::new(&config, handle, task_rx) {
                        Ok(eventloop) => {
                            let _ = ready_tx.send(Ok(()));
                            eventloop
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return Ok(());
                        }
                    };
                    eventloop.run()
                })
                .map_err(Error::Io)?
        };

        ready_rx.recv().map_err(|_| Error::ReactorClosed)??;

        Ok(Reactor {
            handle,
            join: Some(thread_handle),
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Stop the loop, close all sockets and the ring, and join the thread.
    pub fn shutdown(mut self) -> Result<(), Error> {
        self.begin_shutdown();
        match self.join.take() {
            Some(join) => join.join().map_err(|_| Error::ReactorClosed)?,
            None => Ok(()),
        }
    }

    fn begin_shutdown(&self) {
        self.handle.shared.shutdown.store(true, Ordering::Release);
        self.handle.wakeup();
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            self.begin_shutdown();
            let _ = join.join();
        }
    }
}

/// Per-socket state owned by the loop.
struct SocketState {
    socket: Arc<AsyncSocket>,
    reader: Box<dyn SocketReader>,
    recv_buf: Box<[u8]>,
    recv_armed: bool,
    /// Stale-completion guard: completions carry this in their tag.
    generation: u32,
    /// Write unit being sent, possibly a partially-sent remainder.
    current: Option<Bytes>,
    /// Whether an SQE for `current` is in flight.
    submitted: bool,
    closing: bool,
}

struct Eventloop {
    uring: Uring,
    handle: ReactorHandle,
    tasks: Receiver<Task>,
    sockets: Slab<SocketState>,
    by_fd: HashMap<RawFd, usize>,
    cqe_batch: Vec<(u64, i32, u32)>,
    eventfd_buf: u64,
    eventfd_armed: bool,
    batch_size: usize,
    spin: bool,
    recv_buffer_size: usize,
    next_generation: u32,
    /// Sockets whose receive could not be armed because the ring was full.
    unarmed: Vec<usize>,
}

impl Eventloop {
    fn new(config: &Config, handle: ReactorHandle, tasks: Receiver<Task>) -> Result<Self, Error> {
        let uring = Uring::setup(config.sq_entries, true)?;
        Ok(Eventloop {
            uring,
            handle,
            tasks,
            sockets: Slab::new(),
            by_fd: HashMap::new(),
            cqe_batch: Vec::with_capacity(config.sq_entries as usize * 2),
            eventfd_buf: 0,
            eventfd_armed: false,
            batch_size: config.batch_size,
            spin: config.spin,
            recv_buffer_size: config.recv_buffer_size,
            next_generation: 1,
            unarmed: Vec::new(),
        })
    }

    fn run(&mut self) -> Result<(), Error> {
        tracing::debug!(name = %self.handle.name(), "reactor running");
        loop {
            if self.handle.shared.shutdown.load(Ordering::Acquire) {
                self.teardown();
                tracing::debug!(name = %self.handle.name(), "reactor stopped");
                return Ok(());
            }

            self.run_tasks();
            self.rearm_recvs();
            self.drain_scheduled();
            self.arm_eventfd();

            // Only block when the eventfd read is armed, otherwise a
            // cross-thread wakeup could not interrupt the wait.
            let idle = self.eventfd_armed
                && self.tasks.is_empty()
                && self.handle.scheduler().is_empty()
                && !self.uring.cq.has_pending();

            let result = if idle && !self.spin {
                // Blocking idle wait; the armed eventfd read guarantees
                // cross-thread wakeups interrupt it.
                self.uring.sq.submit_and_wait()
            } else {
                self.uring.sq.submit()
            };
            if let Err(e) = result {
                tracing::error!(
                    name = %self.handle.name(),
                    error = %e,
                    "fatal ring failure, tearing down reactor"
                );
                self.teardown();
                return Err(e);
            }

            self.process_completions();

            if idle && self.spin {
                std::hint::spin_loop();
            }
        }
    }

    fn run_tasks(&mut self) {
        for _ in 0..self.batch_size {
            match self.tasks.try_recv() {
                Ok(Task::Run(f)) => f(),
                Ok(Task::Register {
                    socket,
                    reader,
                    done,
                }) => {
                    self.register_socket(socket, reader);
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
                Ok(Task::Close { fd }) => {
                    if let Some(&slot) = self.by_fd.get(&fd) {
                        self.begin_close(slot);
                    }
                }
                Err(_) => break,
            }
        }
    }

    fn register_socket(&mut self, socket: Arc<AsyncSocket>, reader: Box<dyn SocketReader>) {
        if socket.is_closed() {
            // Closed between start and pick-up; the close request may have
            // overtaken the registration, so the fd is released here.
            unsafe {
                libc::close(socket.fd());
            }
            return;
        }

        let generation = self.next_generation & UserData::PAYLOAD_MASK;
        self.next_generation = self.next_generation.wrapping_add(1);

        let fd = socket.fd();
        let slot = self.sockets.insert(SocketState {
            socket: socket.clone(),
            reader,
            recv_buf: vec![0u8; self.recv_buffer_size].into_boxed_slice(),
            recv_armed: false,
            generation,
            current: None,
            submitted: false,
            closing: false,
        });
        self.by_fd.insert(fd, slot);

        self.arm_recv(slot);

        // Release the builder's initial flush ownership. The re-check
        // inside picks up anything written before start.
        socket.reset_flushed();
    }

    fn arm_recv(&mut self, slot: usize) {
        let state = &mut self.sockets[slot];
        if state.recv_armed || state.closing {
            return;
        }
        let ud = UserData::encode(OpKind::Recv, slot as u32, state.generation);
        let fd = state.socket.fd();
        let addr = state.recv_buf.as_mut_ptr() as u64;
        let len = state.recv_buf.len() as u32;
        if self
            .uring
            .sq
            .offer(sys::IORING_OP_RECV, 0, 0, fd, addr, len, 0, ud.raw())
        {
            state.recv_armed = true;
        } else {
            self.unarmed.push(slot);
        }
    }

    fn rearm_recvs(&mut self) {
        if self.unarmed.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.unarmed);
        for slot in pending {
            if self.sockets.contains(slot) {
                self.arm_recv(slot);
            }
        }
    }

    fn drain_scheduled(&mut self) {
        // Bounded by the count at entry: a ring-full re-handoff below must
        // not respin within this iteration.
        let scheduled = self.handle.scheduler().len();
        for _ in 0..scheduled {
            let socket = match self.handle.scheduler().pop() {
                Some(socket) => socket,
                None => break,
            };
            socket.metrics().inc_writes();

            match self.by_fd.get(&socket.fd()) {
                Some(&slot) => self.pump_send(slot),
                None => {
                    // Not (or no longer) registered: drop the output and
                    // release ownership so producers do not stall.
                    while socket.pop_write().is_some() {}
                    socket.reset_flushed();
                }
            }
        }
    }

    /// Move write units from the socket's queue into the ring, one
    /// in-flight send at a time so a socket's bytes hit the wire in
    /// enqueue order.
    fn pump_send(&mut self, slot: usize) {
        loop {
            let state = &mut self.sockets[slot];
            if state.submitted || state.closing {
                return;
            }

            if state.current.is_none() {
                match state.socket.pop_write() {
                    Some(buf) => state.current = Some(buf),
                    None => {
                        // Queue drained; hand ownership back.
                        let socket = state.socket.clone();
                        socket.reset_flushed();
                        return;
                    }
                }
            }

            let buf = state.current.as_ref().unwrap();
            if buf.is_empty() {
                state.current = None;
                continue;
            }

            let ud = UserData::encode(OpKind::Send, slot as u32, state.generation);
            let fd = state.socket.fd();
            let addr = buf.as_ptr() as u64;
            let len = buf.len() as u32;
            if self.uring.sq.offer(
                sys::IORING_OP_SEND,
                0,
                libc::MSG_NOSIGNAL as u32,
                fd,
                addr,
                len,
                0,
                ud.raw(),
            ) {
                state.submitted = true;
                return;
            }

            // Ring full. Ownership stays with the socket; hand it back to
            // the scheduler so the drain resumes once completions free
            // space.
            let socket = state.socket.clone();
            self.handle.scheduler().schedule(socket);
            return;
        }
    }

    fn arm_eventfd(&mut self) {
        if self.eventfd_armed {
            return;
        }
        let ud = UserData::encode(OpKind::EventFdRead, 0, 0);
        let addr = &mut self.eventfd_buf as *mut u64 as u64;
        if self.uring.sq.offer(
            sys::IORING_OP_READ,
            0,
            0,
            self.handle.shared.eventfd,
            addr,
            8,
            0,
            ud.raw(),
        ) {
            self.eventfd_armed = true;
        }
    }

    fn process_completions(&mut self) {
        self.cqe_batch.clear();
        {
            let Eventloop {
                ref mut uring,
                ref mut cqe_batch,
                ..
            } = *self;
            uring.cq.process(|user_data, res, flags| {
                cqe_batch.push((user_data, res, flags));
            });
        }

        for i in 0..self.cqe_batch.len() {
            let (user_data, res, _flags) = self.cqe_batch[i];
            self.dispatch_cqe(user_data, res);
        }
    }

    fn dispatch_cqe(&mut self, user_data: u64, res: i32) {
        let ud = UserData(user_data);
        match ud.kind() {
            Some(OpKind::Recv) => self.handle_recv(ud, res),
            Some(OpKind::Send) => self.handle_send(ud, res),
            Some(OpKind::EventFdRead) => {
                self.eventfd_armed = false;
            }
            Some(OpKind::Nop) | None => {}
        }
    }

    fn handle_recv(&mut self, ud: UserData, res: i32) {
        let slot = ud.slot() as usize;
        match self.sockets.get_mut(slot) {
            Some(state) if state.generation == ud.payload() => state.recv_armed = false,
            _ => return, // stale completion for a recycled slot
        }

        if self.sockets[slot].closing {
            self.finish_close_if_idle(slot);
            return;
        }

        if res == 0 {
            // Peer EOF.
            self.begin_close(slot);
            return;
        }
        if res < 0 {
            let errno = -res;
            if errno == libc::EAGAIN || errno == libc::EINTR {
                self.arm_recv(slot);
                return;
            }
            tracing::debug!(errno, "recv failed, closing socket");
            self.begin_close(slot);
            return;
        }

        let n = res as usize;
        {
            let state = &mut self.sockets[slot];
            state.socket.metrics().inc_bytes_read(n as u64);
            state.socket.metrics().inc_reads();
            let reader = &mut state.reader;
            let window = &state.recv_buf[..n];
            reader.on_read(window);
        }
        self.arm_recv(slot);
    }

    fn handle_send(&mut self, ud: UserData, res: i32) {
        let slot = ud.slot() as usize;
        match self.sockets.get_mut(slot) {
            Some(state) if state.generation == ud.payload() => state.submitted = false,
            _ => return,
        }

        if self.sockets[slot].closing {
            self.finish_close_if_idle(slot);
            return;
        }

        if res < 0 {
            let errno = -res;
            if errno == libc::EAGAIN || errno == libc::EINTR {
                // Resubmit the same unit.
                self.pump_send(slot);
                return;
            }
            tracing::debug!(errno, "send failed, closing socket");
            self.begin_close(slot);
            return;
        }

        let n = res as usize;
        let state = &mut self.sockets[slot];
        let buf = state.current.take().expect("send completion without a unit");
        state.socket.metrics().inc_bytes_written(n as u64);
        if n < buf.len() {
            // Short write: the remainder goes out before the next unit so
            // the stream stays in enqueue order.
            state.current = Some(buf.slice(n..));
        }
        self.pump_send(slot);
    }

    fn begin_close(&mut self, slot: usize) {
        let state = &mut self.sockets[slot];
        if state.closing {
            return;
        }
        state.closing = true;

        // Forces any armed receive to complete so the slot can release.
        unsafe {
            libc::shutdown(state.socket.fd(), libc::SHUT_RDWR);
        }

        // Unsent output is dropped at close. An in-flight unit must stay
        // alive until its completion arrives; it is released with the slot.
        if !state.submitted {
            state.current = None;
        }
        while state.socket.pop_write().is_some() {}

        self.finish_close_if_idle(slot);
    }

    fn finish_close_if_idle(&mut self, slot: usize) {
        {
            let state = &self.sockets[slot];
            if state.recv_armed || state.submitted {
                return;
            }
        }
        let state = self.sockets.remove(slot);
        self.by_fd.remove(&state.socket.fd());
        unsafe {
            libc::close(state.socket.fd());
        }
    }

    fn teardown(&mut self) {
        let slots: Vec<usize> = self.sockets.iter().map(|(slot, _)| slot).collect();
        for slot in slots {
            self.begin_close(slot);
        }

        // Reap in-flight completions so slots release before the ring
        // goes away. Bounded; anything still stuck is force-closed.
        for _ in 0..100 {
            if self.sockets.is_empty() {
                break;
            }
            if self.uring.sq.submit_and_wait().is_err() {
                break;
            }
            self.process_completions();
        }
        let leftover: Vec<usize> = self.sockets.iter().map(|(slot, _)| slot).collect();
        for slot in leftover {
            let state = self.sockets.remove(slot);
            self.by_fd.remove(&state.socket.fd());
            unsafe {
                libc::close(state.socket.fd());
            }
        }

        self.uring.close();
    }
}

fn pin_to_core(core: usize) -> Result<(), Error> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.batch_size = 0;
        assert!(matches!(
            Reactor::new(config),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_thread_ids_are_unique_and_nonzero() {
        let here = current_thread_id();
        assert_ne!(here, 0);
        let there = thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(there, 0);
        assert_ne!(here, there);
        // Stable within a thread.
        assert_eq!(here, current_thread_id());
    }

    #[test]
    fn test_reactor_runs_submitted_tasks() {
        if !Uring::is_supported() {
            eprintln!("skipping: io_uring not available");
            return;
        }
        let reactor = Reactor::new(Config::default()).unwrap();
        let handle = reactor.handle();

        let (tx, rx) = crossbeam_channel::bounded(1);
        assert!(handle.submit(move || {
            let _ = tx.send(current_thread_id());
        }));
        let loop_tid = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(loop_tid, current_thread_id());
        assert!(!handle.on_eventloop_thread());

        reactor.shutdown().unwrap();
    }

    #[test]
    fn test_reactor_names_generated_from_counter() {
        if !Uring::is_supported() {
            eprintln!("skipping: io_uring not available");
            return;
        }
        let a = Reactor::new(Config::default()).unwrap();
        let b = Reactor::new(Config::default()).unwrap();
        assert_ne!(a.name(), b.name());
        a.shutdown().unwrap();
        b.shutdown().unwrap();
    }
}
