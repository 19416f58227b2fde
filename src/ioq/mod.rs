/*!
Asynchronous syscall queue.

A bounded multi-producer, single-consumer pipeline whose workers execute
`openat`/`fstatat`/`close` on behalf of the traversal thread. Two rings
connect the sides: a submission channel the consumer pushes into and the
workers block on, and a completion channel sized to the queue capacity so
workers can never stall while handing results back.

Requests and completions move by value through the channels; nothing on the
worker side allocates. Close requests are fire-and-forget: they occupy no
completion slot, are always accepted regardless of capacity, and are
guaranteed to have executed by the time the queue has shut down (workers
drain the submission ring before exiting).

The queue can instead be backed by a kernel submission ring (`io_uring`)
with identical consumer-visible semantics; see [`Ioq::with_ring`] under the
`ring` feature.
*/

#[cfg(all(target_os = "linux", feature = "ring"))]
mod ring;

use crate::error::ConfigError;
use crate::fs::{FileDes, FileStat};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use std::ffi::CString;
use std::thread::JoinHandle;
use tracing::debug;

/// A unit of work for the queue.
#[derive(Debug)]
pub enum Op {
    /// `openat(parent, name)` with directory-only flags; completes with a descriptor.
    Open {
        /// Raw descriptor of the parent directory, or `None` for `AT_FDCWD`.
        parent: Option<i32>,
        name: CString,
        /// Whether a symlink in the final component is traversed.
        follow: bool,
    },
    /// `fstatat(parent, name)`; completes with a stat buffer.
    Stat {
        parent: Option<i32>,
        name: CString,
        follow: bool,
    },
    /// `close(fd)`. Fire-and-forget: produces no completion and never counts
    /// against capacity. Ownership of the descriptor transfers to the queue.
    Close { fd: i32 },
}

/// Successful payload of a completion.
#[derive(Debug)]
pub enum Output {
    Fd(FileDes),
    Stat(FileStat),
}

/// Result of an executed request, delivered back to the consumer.
#[derive(Debug)]
pub struct Completion {
    /// Sequence number assigned at submission; globally monotonic.
    pub seq: u64,
    /// Opaque caller tag, handed back untouched.
    pub token: u64,
    /// The syscall result, with the raw errno on failure.
    pub result: Result<Output, i32>,
}

#[derive(Debug)]
pub(crate) struct Request {
    pub seq: u64,
    pub token: u64,
    pub op: Op,
}

/// Returned by [`Ioq::submit`] when the queue is at capacity. Carries the
/// rejected operation back so the caller can drain and retry.
#[derive(Debug)]
pub struct QueueFull(pub Op);

impl core::fmt::Display for QueueFull {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "I/O queue is at capacity")
    }
}

impl std::error::Error for QueueFull {}

struct ThreadPool {
    submit_tx: Option<Sender<Request>>,
    complete_rx: Receiver<Completion>,
    workers: Vec<JoinHandle<()>>,
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Disconnecting the submission ring is the exit signal; workers
        // finish everything already queued (closes included) first.
        self.submit_tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        // Completions still buffered are dropped with the receiver, which
        // closes any descriptors they carry.
    }
}

enum Backend {
    Threads(ThreadPool),
    #[cfg(all(target_os = "linux", feature = "ring"))]
    Ring(ring::Ring),
}

/**
The queue handle, owned by the single consumer.

`capacity` bounds the number of outstanding completions (submitted but not
yet collected); [`submit`](Self::submit) refuses counted work beyond it so
the consumer is forced to drain before piling on more. Close operations are
exempt, as they complete nowhere.
*/
pub struct Ioq {
    backend: Backend,
    capacity: usize,
    outstanding: usize,
    next_seq: u64,
}

impl Ioq {
    /// Creates a queue backed by `nthreads` worker threads.
    ///
    /// # Errors
    /// Returns [`ConfigError::Queue`] if a worker thread cannot be spawned.
    pub fn new(capacity: usize, nthreads: usize) -> Result<Self, ConfigError> {
        let capacity = capacity.max(1);
        let nthreads = nthreads.max(1);
        let (submit_tx, submit_rx) = unbounded::<Request>();
        // Sized to capacity so a worker can always push without blocking.
        let (complete_tx, complete_rx) = bounded::<Completion>(capacity);

        let mut workers = Vec::with_capacity(nthreads);
        for index in 0..nthreads {
            let rx = submit_rx.clone();
            let tx = complete_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("bfs-ioq-{index}"))
                .spawn(move || worker(&rx, &tx))
                .map_err(ConfigError::Queue)?;
            workers.push(handle);
        }
        debug!(capacity, nthreads, "I/O queue started");

        Ok(Self {
            backend: Backend::Threads(ThreadPool {
                submit_tx: Some(submit_tx),
                complete_rx,
                workers,
            }),
            capacity,
            outstanding: 0,
            next_seq: 0,
        })
    }

    /// Creates a queue backed by a kernel submission ring instead of a
    /// thread pool. Consumer-visible semantics are identical.
    ///
    /// # Errors
    /// Returns [`ConfigError::Queue`] if the ring cannot be set up.
    #[cfg(all(target_os = "linux", feature = "ring"))]
    pub fn with_ring(capacity: usize) -> Result<Self, ConfigError> {
        let capacity = capacity.max(1);
        Ok(Self {
            backend: Backend::Ring(ring::Ring::new(capacity)?),
            capacity,
            outstanding: 0,
            next_seq: 0,
        })
    }

    /// Number of submitted-but-uncollected completions.
    #[must_use]
    #[inline]
    pub const fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Configured completion capacity.
    #[must_use]
    #[inline]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /**
    Submits an operation without blocking and returns its sequence number.

    # Errors
    Returns [`QueueFull`] with the operation when `capacity` completions are
    already outstanding; drain with [`poll`](Self::poll) or
    [`wait`](Self::wait) and retry. Close operations are never refused.
    */
    pub fn submit(&mut self, op: Op, token: u64) -> Result<u64, QueueFull> {
        let counted = !matches!(op, Op::Close { .. });
        if counted && self.outstanding >= self.capacity {
            return Err(QueueFull(op));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let request = Request { seq, token, op };

        match &mut self.backend {
            Backend::Threads(pool) => {
                let Some(tx) = pool.submit_tx.as_ref() else {
                    // Cancelled. A close must still happen or the descriptor
                    // leaks; everything else bounces.
                    if let Op::Close { fd } = request.op {
                        // SAFETY: ownership of fd was transferred with the op
                        unsafe { libc::close(fd) };
                        return Ok(seq);
                    }
                    return Err(QueueFull(request.op));
                };
                if let Err(refused) = tx.send(request) {
                    // Workers are gone; a close still has to happen here or
                    // the descriptor leaks.
                    if let Op::Close { fd } = refused.0.op {
                        // SAFETY: ownership of fd was transferred with the op
                        unsafe { libc::close(fd) };
                        return Ok(seq);
                    }
                    return Err(QueueFull(refused.0.op));
                }
            }
            #[cfg(all(target_os = "linux", feature = "ring"))]
            Backend::Ring(r) => r.push(request),
        }

        if counted {
            self.outstanding += 1;
        }
        Ok(seq)
    }

    /// Collects one completion if any is ready. Non-blocking.
    pub fn poll(&mut self) -> Option<Completion> {
        let completion = match &mut self.backend {
            Backend::Threads(pool) => pool.complete_rx.try_recv().ok(),
            #[cfg(all(target_os = "linux", feature = "ring"))]
            Backend::Ring(r) => r.poll(),
        }?;
        self.outstanding -= 1;
        Some(completion)
    }

    /// Blocks until a completion is available. Returns `None` once the queue
    /// is drained (nothing outstanding) or shut down.
    pub fn wait(&mut self) -> Option<Completion> {
        if self.outstanding == 0 {
            return None;
        }
        let completion = match &mut self.backend {
            Backend::Threads(pool) => pool.complete_rx.recv().ok(),
            #[cfg(all(target_os = "linux", feature = "ring"))]
            Backend::Ring(r) => r.wait(),
        }?;
        self.outstanding -= 1;
        Some(completion)
    }

    /// Signals shutdown: no further submissions are accepted and workers
    /// exit once they have drained the submission ring. Already-submitted
    /// close operations are guaranteed to execute.
    pub fn cancel(&mut self) {
        debug!(outstanding = self.outstanding, "I/O queue cancelled");
        match &mut self.backend {
            Backend::Threads(pool) => {
                pool.submit_tx.take();
            }
            #[cfg(all(target_os = "linux", feature = "ring"))]
            Backend::Ring(r) => r.cancel(),
        }
    }
}

/// Worker loop: pop, execute, push. Exits when the submission ring
/// disconnects and is empty, which is what makes the close guarantee hold.
fn worker(rx: &Receiver<Request>, tx: &Sender<Completion>) {
    while let Ok(request) = rx.recv() {
        let result = match request.op {
            Op::Close { fd } => {
                // SAFETY: ownership of fd was transferred with the op
                unsafe { libc::close(fd) };
                continue; // no completion slot for closes
            }
            Op::Open {
                parent,
                ref name,
                follow,
            } => crate::fs::open_dir_at(parent, name, follow).map(Output::Fd),
            Op::Stat {
                parent,
                ref name,
                follow,
            } => crate::fs::stat_at(parent, name, follow).map(Output::Stat),
        };

        let completion = Completion {
            seq: request.seq,
            token: request.token,
            result,
        };
        if tx.send(completion).is_err() {
            // Consumer is gone; the dropped completion closes its descriptor.
            return;
        }
    }
}
