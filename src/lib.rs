/*!
Parallel breadth-first directory traversal.

- Syscalls (`openat`, `fstatat`, `close`) run on a worker pool, or on a
  kernel submission ring with the `ring` feature
- Visits are delivered on the calling thread in a strategy-defined order:
  breadth-first, depth-first, or iterative/exponential deepening
- Open directory descriptors live in a bounded pinned LRU cache sized from
  `RLIMIT_NOFILE`, so arbitrarily large trees walk within the limit

# Example

Breadth-first walk printing every path:

```no_run
use bfs::{Traversal, Visit};

# fn main() -> Result<(), bfs::ConfigError> {
let summary = Traversal::init(["."]).build()?.run(|entry| {
    println!("{}", entry.path().display());
    Visit::Continue
})?;
eprintln!("{} visits, {} errors", summary.visits, summary.errors);
# Ok(())
# }
```

# Implementation

Three pieces cooperate:

## `ioq`

A bounded multi-producer, single-consumer syscall queue. The traversal
submits open/stat/close operations; workers execute them and push
completions back. Close operations are fire-and-forget and are guaranteed
to run before the queue finishes shutting down.

## Descriptor cache

Every directory selected for descent briefly owns an open descriptor, used
to read its stream and to anchor `openat`/`fstatat` calls for its children.
The cache bounds how many exist at once: slots pinned by in-flight
operations are immovable, everything else is evicted least-recently-used
and revived on demand by reopening through the ancestor chain (which also
keeps paths longer than `PATH_MAX` working).

## The engine

A single-threaded state machine over the visit queue, the open pipeline and
the completion stream. Entries are visited strictly in queue order; opens
are dispatched ahead, bounded, while entries wait. The callback never runs
on a worker thread, so it may block (or run an `-exec`) while I/O continues
underneath.
*/

mod error;
pub mod fs;
pub mod ioq;
mod walk;

pub use error::ConfigError;
pub use fs::{FileStat, FileType};
pub use walk::{
    Entry, FollowPolicy, MountPolicy, Strategy, Summary, Traversal, TraversalBuilder, Visit,
    VisitKind, raise_fd_limit,
};

#[cfg(test)]
mod test;
