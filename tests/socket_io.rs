//! End-to-end socket tests over a Unix socketpair.
//! Skipped on kernels without io_uring.

use std::os::fd::RawFd;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::Sender;

use tpcio::{AsyncSocketBuilder, Config, Reactor, SocketReader, Uring};

struct Collector {
    tx: Sender<Vec<u8>>,
}

impl SocketReader for Collector {
    fn on_read(&mut self, data: &[u8]) {
        let _ = self.tx.send(data.to_vec());
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt().try_init();
}

fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let res = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(res, 0);
    (fds[0], fds[1])
}

fn read_with_timeout(fd: RawFd, buf: &mut [u8]) -> isize {
    let timeout = libc::timeval {
        tv_sec: 5,
        tv_usec: 0,
    };
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &timeout as *const libc::timeval as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        );
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
    }
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        thread::yield_now();
    }
    false
}

#[test]
fn test_outbound_bytes_reach_the_peer() {
    if !Uring::is_supported() {
        eprintln!("skipping: io_uring not available");
        return;
    }
    init_logging();

    let reactor = Reactor::new(Config::default()).unwrap();
    let (ours, theirs) = socketpair();
    let (tx, _rx) = crossbeam_channel::unbounded();

    let socket = AsyncSocketBuilder::new(reactor.handle(), ours)
        .reader(Collector { tx })
        .build()
        .unwrap();
    socket.start().unwrap();

    assert!(socket.write_and_flush(Bytes::from_static(b"ping")));

    let mut buf = [0u8; 16];
    let n = read_with_timeout(theirs, &mut buf);
    assert_eq!(n, 4);
    assert_eq!(&buf[..4], b"ping");

    assert!(wait_until(Duration::from_secs(5), || {
        socket.metrics().bytes_written() == 4
    }));
    assert!(socket.metrics().writes() >= 1);

    socket.close();
    unsafe { libc::close(theirs) };
    reactor.shutdown().unwrap();
}

#[test]
fn test_inbound_bytes_reach_the_reader() {
    if !Uring::is_supported() {
        eprintln!("skipping: io_uring not available");
        return;
    }
    init_logging();

    let reactor = Reactor::new(Config::default()).unwrap();
    let (ours, theirs) = socketpair();
    let (tx, rx) = crossbeam_channel::unbounded();

    let socket = AsyncSocketBuilder::new(reactor.handle(), ours)
        .reader(Collector { tx })
        .build()
        .unwrap();
    socket.start().unwrap();

    let msg = b"hello from the wire";
    let n = unsafe { libc::write(theirs, msg.as_ptr() as *const libc::c_void, msg.len()) };
    assert_eq!(n as usize, msg.len());

    let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(got, msg);
    assert!(socket.metrics().bytes_read() >= msg.len() as u64);
    assert!(socket.metrics().reads() >= 1);

    socket.close();
    unsafe { libc::close(theirs) };
    reactor.shutdown().unwrap();
}

#[test]
fn test_cross_thread_writers_share_one_socket() {
    if !Uring::is_supported() {
        eprintln!("skipping: io_uring not available");
        return;
    }
    init_logging();

    let reactor = Reactor::new(Config::default()).unwrap();
    let (ours, theirs) = socketpair();
    let (tx, _rx) = crossbeam_channel::unbounded();

    let socket = AsyncSocketBuilder::new(reactor.handle(), ours)
        .reader(Collector { tx })
        .build()
        .unwrap();
    socket.start().unwrap();

    const WRITERS: usize = 4;
    const PER_WRITER: usize = 32;
    let payload = [0xabu8; 64];

    let mut handles = Vec::new();
    for _ in 0..WRITERS {
        let socket = socket.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..PER_WRITER {
                loop {
                    if socket.write_and_flush(Bytes::copy_from_slice(&payload)) {
                        break;
                    }
                    thread::yield_now();
                }
            }
        }));
    }

    let expected = WRITERS * PER_WRITER * payload.len();
    let mut received = 0usize;
    let mut buf = [0u8; 4096];
    while received < expected {
        let n = read_with_timeout(theirs, &mut buf);
        assert!(n > 0, "peer read timed out with {received}/{expected} bytes");
        received += n as usize;
    }
    assert_eq!(received, expected);

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || {
        socket.metrics().bytes_written() == expected as u64
    }));

    socket.close();
    unsafe { libc::close(theirs) };
    reactor.shutdown().unwrap();
}
