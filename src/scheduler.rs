//! Per-reactor registry of sockets that have pending output.
//!
//! Any thread that wins a socket's flush ownership hands the socket here;
//! only the owning reactor thread pops and drains. The queue is lock-free
//! so producers never serialize behind each other or the reactor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::socket::AsyncSocket;

pub struct NetworkScheduler {
    queue: ArrayQueue<Arc<AsyncSocket>>,
    registrations: AtomicU64,
}

impl NetworkScheduler {
    pub(crate) fn new(capacity: usize) -> Self {
        NetworkScheduler {
            queue: ArrayQueue::new(capacity),
            registrations: AtomicU64::new(0),
        }
    }

    /// Register a socket for draining. Safe from any thread.
    ///
    /// The queue is sized for the reactor's socket limit and a socket is
    /// registered at most once per flush-ownership acquisition, so a full
    /// queue means the reactor is misconfigured; that is reported rather
    /// than dropping the handoff silently.
    pub(crate) fn schedule(&self, socket: Arc<AsyncSocket>) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
        if self.queue.push(socket).is_err() {
            tracing::error!("network scheduler queue overflow; socket drain delayed");
        }
    }

    /// Pop the next dirty socket. Reactor thread only.
    pub(crate) fn pop(&self) -> Option<Arc<AsyncSocket>> {
        self.queue.pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Total number of handoffs ever made. Producers hand a socket over
    /// exactly once per acquisition of its flush ownership; the reactor
    /// adds a handoff when a drain is cut short by a full ring.
    pub fn registrations(&self) -> u64 {
        self.registrations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::ReactorHandle;
    use crate::socket::AsyncSocketBuilder;

    #[test]
    fn test_fifo_and_counts() {
        let handle = ReactorHandle::detached(16);
        let a = AsyncSocketBuilder::new(handle.clone(), -1).build().unwrap();
        let b = AsyncSocketBuilder::new(handle.clone(), -1).build().unwrap();

        let scheduler = handle.scheduler();
        assert!(scheduler.is_empty());

        scheduler.schedule(a.clone());
        scheduler.schedule(b.clone());
        assert_eq!(scheduler.len(), 2);
        assert_eq!(scheduler.registrations(), 2);

        assert!(Arc::ptr_eq(&scheduler.pop().unwrap(), &a));
        assert!(Arc::ptr_eq(&scheduler.pop().unwrap(), &b));
        assert!(scheduler.pop().is_none());
    }
}
