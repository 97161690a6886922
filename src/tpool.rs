//! Shared worker pool and the per-handle ordered result queue.
//!
//! One [`ThreadPool`] can be shared by any number of handles so that
//! encoders and decoders balance their work across a single set of OS
//! threads. Each handle owning asynchronous work attaches an
//! [`OrderedQueue`], which hands out dispatch serials, applies backpressure
//! when too many jobs are in flight, and delivers completed jobs strictly
//! in dispatch order.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::error::{Error, Result};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A fixed-size pool of worker threads shared between handles.
pub struct ThreadPool {
    tx: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Creates a pool with `nb_threads` workers (at least one).
    pub fn new(nb_threads: usize) -> Self {
        let (tx, rx) = unbounded::<Task>();
        let workers = (0..nb_threads.max(1))
            .map(|i| {
                let rx: Receiver<Task> = rx.clone();
                std::thread::Builder::new()
                    .name(format!("bgzf2-worker-{i}"))
                    .spawn(move || {
                        while let Ok(task) = rx.recv() {
                            task();
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            tx: Some(tx),
            workers,
        }
    }

    /// The number of worker threads.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Runs `f` on one of the workers.
    pub(crate) fn run<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.spawn(Box::new(f));
    }

    fn spawn(&self, task: Task) {
        // The channel outlives all users; send only fails during teardown,
        // at which point the task is dropped unexecuted.
        let _ = self
            .tx
            .as_ref()
            .expect("pool channel present until drop")
            .send(task);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.tx.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Outcome of reserving a dispatch slot.
pub(crate) enum Reserve {
    /// A slot was acquired; the serial orders the result delivery.
    Slot(u64),
    /// [`OrderedQueue::wake_dispatch`] interrupted the wait. The caller
    /// should service its command channel and try again.
    Woken,
}

struct QueueState<T> {
    qsize: usize,
    next_serial: u64,
    next_deliver: u64,
    /// Results completed for serials below this are stale and discarded.
    discard_below: u64,
    in_flight: usize,
    results: BTreeMap<u64, T>,
    shutdown: bool,
    wake: bool,
}

/// Delivers job results in dispatch order, with bounded in-flight work.
pub(crate) struct OrderedQueue<T> {
    state: Mutex<QueueState<T>>,
    /// Signalled when a result lands or the queue shuts down.
    avail: Condvar,
    /// Signalled when an in-flight slot frees up, on wake and on reset.
    space: Condvar,
}

impl<T: Send + 'static> OrderedQueue<T> {
    pub fn new(qsize: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                qsize: qsize.max(1),
                next_serial: 0,
                next_deliver: 0,
                discard_below: 0,
                in_flight: 0,
                results: BTreeMap::new(),
                shutdown: false,
                wake: false,
            }),
            avail: Condvar::new(),
            space: Condvar::new(),
        }
    }

    /// Blocks until an in-flight slot is free and reserves it.
    ///
    /// # Errors
    ///
    /// Fails with a cancelled error once the queue has shut down.
    pub fn reserve(&self) -> Result<Reserve> {
        let mut s = self.state.lock().expect("queue mutex poisoned");
        loop {
            if s.shutdown {
                return Err(Error::cancelled());
            }
            if s.wake {
                s.wake = false;
                return Ok(Reserve::Woken);
            }
            if s.in_flight < s.qsize {
                let serial = s.next_serial;
                s.next_serial += 1;
                s.in_flight += 1;
                return Ok(Reserve::Slot(serial));
            }
            s = self.space.wait(s).expect("queue mutex poisoned");
        }
    }

    /// Hands a completed job back to the queue.
    ///
    /// Results for serials invalidated by [`Self::reset`] are dropped.
    pub fn complete(&self, serial: u64, value: T) {
        let mut s = self.state.lock().expect("queue mutex poisoned");
        if serial < s.discard_below {
            s.in_flight -= 1;
            self.space.notify_all();
        } else {
            s.results.insert(serial, value);
            self.avail.notify_all();
        }
    }

    /// Waits for the next result in dispatch order.
    ///
    /// Returns `None` once the queue has shut down and all in-flight work
    /// has drained.
    pub fn next_result_wait(&self) -> Option<T> {
        let mut s = self.state.lock().expect("queue mutex poisoned");
        loop {
            let serial = s.next_deliver;
            if let Some(value) = s.results.remove(&serial) {
                s.next_deliver += 1;
                s.in_flight -= 1;
                self.space.notify_all();
                return Some(value);
            }
            if s.shutdown && s.in_flight == 0 {
                return None;
            }
            s = self.avail.wait(s).expect("queue mutex poisoned");
        }
    }

    /// Discards everything dispatched so far: queued results are dropped
    /// and results of still-running jobs are dropped on completion.
    pub fn reset(&self) {
        let mut s = self.state.lock().expect("queue mutex poisoned");
        s.discard_below = s.next_serial;
        s.next_deliver = s.next_serial;
        s.in_flight -= s.results.len();
        s.results.clear();
        self.space.notify_all();
    }

    /// Interrupts one blocked or future [`Self::reserve`] call.
    pub fn wake_dispatch(&self) {
        let mut s = self.state.lock().expect("queue mutex poisoned");
        s.wake = true;
        self.space.notify_all();
    }

    /// Blocks until no dispatched job is outstanding.
    pub fn wait_empty(&self) {
        let mut s = self.state.lock().expect("queue mutex poisoned");
        while s.in_flight > 0 && !s.shutdown {
            s = self.space.wait(s).expect("queue mutex poisoned");
        }
    }

    /// Stops the queue. Pending results remain deliverable; further
    /// reservations fail.
    pub fn shutdown(&self) {
        let mut s = self.state.lock().expect("queue mutex poisoned");
        s.shutdown = true;
        self.avail.notify_all();
        self.space.notify_all();
    }
}

/// Reserves a slot and runs `f` on the pool, delivering its return value
/// through `queue` in dispatch order.
///
/// # Errors
///
/// Fails with a cancelled error if the queue shuts down while waiting for a
/// slot.
pub(crate) fn dispatch<T, F>(queue: &Arc<OrderedQueue<T>>, pool: &ThreadPool, f: F) -> Result<()>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    loop {
        match queue.reserve()? {
            Reserve::Slot(serial) => {
                let q = Arc::clone(queue);
                pool.spawn(Box::new(move || q.complete(serial, f())));
                return Ok(());
            }
            // Wake-ups are meant for command-polling dispatchers; plain
            // dispatchers retry.
            Reserve::Woken => {}
        }
    }
}
