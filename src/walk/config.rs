use crate::error::ConfigError;
use crate::walk::{Entry, Summary, Visit, engine};
use std::ffi::{CString, OsStr};

/// Order in which the frontier is explored, selectable per traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Strict breadth-first: every entry at depth *d* is visited before any
    /// entry at depth *d + 1*. The default.
    #[default]
    Bfs,
    /// Strict depth-first preorder: a directory's subtree is exhausted
    /// before any of its later siblings.
    Dfs,
    /// Iterative deepening: repeated depth-bounded passes, raising the bound
    /// by one each time. Each entry is emitted only on the pass that first
    /// reaches its depth.
    Ids,
    /// Exponential deepening: like [`Ids`](Self::Ids) but the bound doubles
    /// each pass, amortising the re-traversal cost.
    Eds,
}

/// What to do at filesystem boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MountPolicy {
    /// Descend through mount points freely. The default.
    #[default]
    Crossing,
    /// Never descend into a directory on a different device than its parent.
    /// The mount point itself is still visited.
    NoCross,
    /// Only descend into directories on the same device as the root they
    /// were discovered under.
    SameFs,
}

/// How symlinks are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FollowPolicy {
    /// Never follow symlinks. The default.
    #[default]
    Physical,
    /// Follow symlinks given as roots, but nothing discovered below them.
    ComFollow,
    /// Follow every symlink. Cycles are detected against the ancestor chain
    /// and reported as `ELOOP` on the offending directory.
    Logical,
}

/**
Builder for a [`Traversal`].

Collects roots, strategy, policies, depth limits and resource knobs, then
validates the lot in [`build`](Self::build). Every combinator consumes and
returns the builder.
*/
#[expect(
    clippy::struct_excessive_bools,
    reason = "a builder holding independent toggles is exactly this shape"
)]
pub struct TraversalBuilder {
    roots: Vec<std::ffi::OsString>,
    strategy: Strategy,
    mount: MountPolicy,
    follow: FollowPolicy,
    nthreads: Option<usize>,
    min_depth: u32,
    max_depth: u32,
    post_order: bool,
    prune: bool,
    recover: bool,
    stat_all: bool,
    sort: bool,
    fd_limit: Option<usize>,
    #[cfg(all(target_os = "linux", feature = "ring"))]
    kernel_ring: bool,
}

impl TraversalBuilder {
    /// Creates a builder over the given roots, which are visited (and their
    /// errors reported) in the order supplied.
    pub fn new<I, A>(roots: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<OsStr>,
    {
        Self {
            roots: roots.into_iter().map(|r| r.as_ref().to_owned()).collect(),
            strategy: Strategy::default(),
            mount: MountPolicy::default(),
            follow: FollowPolicy::default(),
            nthreads: None,
            min_depth: 0,
            max_depth: u32::MAX,
            post_order: false,
            prune: true,
            recover: false,
            stat_all: false,
            sort: false,
            fd_limit: None,
            #[cfg(all(target_os = "linux", feature = "ring"))]
            kernel_ring: false,
        }
    }

    /// Sets the search strategy, defaults to breadth-first.
    #[must_use]
    pub const fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the mount-point policy, defaults to crossing freely.
    #[must_use]
    pub const fn mount_policy(mut self, mount: MountPolicy) -> Self {
        self.mount = mount;
        self
    }

    /// Sets the symlink policy, defaults to never following.
    #[must_use]
    pub const fn follow(mut self, follow: FollowPolicy) -> Self {
        self.follow = follow;
        self
    }

    /// Sets how many I/O worker threads to run, defaults to the number of
    /// available cores. `None` keeps the default.
    #[must_use]
    pub const fn threads(mut self, threads: Option<usize>) -> Self {
        match threads {
            Some(count) => self.nthreads = Some(count),
            None => return self,
        }
        self
    }

    /// Entries shallower than this are traversed but not reported.
    #[must_use]
    pub const fn min_depth(mut self, depth: u32) -> Self {
        self.min_depth = depth;
        self
    }

    /// Entries deeper than this are neither visited nor discovered;
    /// directories at the limit are not read.
    #[must_use]
    pub const fn max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    /// Also visit directories post-order, after their whole subtree.
    /// Defaults to off.
    #[must_use]
    pub const fn post_order(mut self, yes: bool) -> Self {
        self.post_order = yes;
        self
    }

    /// Whether [`Visit::Prune`](crate::Visit::Prune) from the callback is
    /// honoured. Defaults to on.
    #[must_use]
    pub const fn prune(mut self, yes: bool) -> Self {
        self.prune = yes;
        self
    }

    /// On a directory stream failing mid-read, report the partial listing
    /// plus the error instead of discarding the children read so far.
    /// Defaults to off.
    #[must_use]
    pub const fn recover(mut self, yes: bool) -> Self {
        self.recover = yes;
        self
    }

    /// Prefetch a stat buffer for every entry through the I/O queue rather
    /// than statting lazily on demand. Defaults to off.
    #[must_use]
    pub const fn stat_all(mut self, yes: bool) -> Self {
        self.stat_all = yes;
        self
    }

    /// Sort each directory's children by name before they are visited.
    /// Defaults to off (raw `readdir` order).
    #[must_use]
    pub const fn sort(mut self, yes: bool) -> Self {
        self.sort = yes;
        self
    }

    /// Overrides the descriptor budget the cache capacity is derived from.
    /// Defaults to the soft `RLIMIT_NOFILE`.
    #[must_use]
    pub const fn fd_limit(mut self, limit: Option<usize>) -> Self {
        match limit {
            Some(value) => self.fd_limit = Some(value),
            None => return self,
        }
        self
    }

    /// Backs the I/O queue with the kernel submission ring instead of the
    /// worker pool. Semantics are identical; the choice is fixed here.
    #[cfg(all(target_os = "linux", feature = "ring"))]
    #[must_use]
    pub const fn kernel_ring(mut self, yes: bool) -> Self {
        self.kernel_ring = yes;
        self
    }

    /**
    Validates the configuration and produces a ready-to-run [`Traversal`].

    # Errors
    [`ConfigError::NoRoots`] without any roots, [`ConfigError::DepthRange`]
    when `min_depth > max_depth`, and [`ConfigError::NulRoot`] for a root
    path with an interior NUL byte.
    */
    pub fn build(self) -> Result<Traversal, ConfigError> {
        if self.roots.is_empty() {
            return Err(ConfigError::NoRoots);
        }
        if self.min_depth > self.max_depth {
            return Err(ConfigError::DepthRange {
                min: self.min_depth,
                max: self.max_depth,
            });
        }

        let roots = self
            .roots
            .into_iter()
            .map(|root| CString::new(root.into_encoded_bytes()))
            .collect::<Result<Vec<_>, _>>()?;

        let nthreads = self
            .nthreads
            .unwrap_or_else(|| {
                std::thread::available_parallelism().map_or(1, core::num::NonZeroUsize::get)
            })
            .max(1);

        // One open per worker in both pipeline halves, plus one so a lone
        // worker still has queued work while a completion is being handled.
        let open_cap = 2 * nthreads + 1;

        let budget = self.fd_limit.unwrap_or_else(descriptor_budget);
        let cache_capacity = budget.saturating_sub(FD_RESERVE).clamp(4, 4096);

        Ok(Traversal {
            roots,
            strategy: self.strategy,
            mount: self.mount,
            follow: self.follow,
            nthreads,
            min_depth: self.min_depth,
            max_depth: self.max_depth,
            post_order: self.post_order,
            prune: self.prune,
            recover: self.recover,
            stat_all: self.stat_all,
            sort: self.sort,
            open_cap,
            cache_capacity,
            #[cfg(all(target_os = "linux", feature = "ring"))]
            kernel_ring: self.kernel_ring,
        })
    }
}

/// Descriptors held back from the cache for stdio, the caller's own files
/// and in-flight completions.
const FD_RESERVE: usize = 16;

/// Current soft descriptor limit, with a sane floor if the kernel refuses
/// to answer.
fn descriptor_budget() -> usize {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: writes a caller-owned rlimit struct
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &raw mut limit) } != 0 {
        return 256;
    }
    usize::try_from(limit.rlim_cur).unwrap_or(usize::MAX)
}

/**
Raises the soft `RLIMIT_NOFILE` to the hard limit where permitted and
returns the resulting soft limit.

Entirely optional and never called by the library itself; a caller that
wants the largest possible descriptor cache invokes this once at startup,
before building traversals.
*/
#[allow(clippy::missing_inline_in_public_items)]
pub fn raise_fd_limit() -> Option<u64> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: writes a caller-owned rlimit struct
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &raw mut limit) } != 0 {
        return None;
    }
    if limit.rlim_cur < limit.rlim_max {
        limit.rlim_cur = limit.rlim_max;
        // SAFETY: raising our own soft limit within the hard limit
        if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &raw const limit) } != 0 {
            return None;
        }
    }
    Some(limit.rlim_cur as u64)
}

/**
A validated traversal, ready to run.

[`run`](Self::run) walks every root and invokes the callback once per
reachable entry (twice for directories when post-order visits are enabled),
always on the calling thread. The traversal owns its worker pool for the
duration of the call and tears it down before returning.
*/
#[derive(Debug)]
pub struct Traversal {
    pub(crate) roots: Vec<CString>,
    pub(crate) strategy: Strategy,
    pub(crate) mount: MountPolicy,
    pub(crate) follow: FollowPolicy,
    pub(crate) nthreads: usize,
    pub(crate) min_depth: u32,
    pub(crate) max_depth: u32,
    pub(crate) post_order: bool,
    pub(crate) prune: bool,
    pub(crate) recover: bool,
    pub(crate) stat_all: bool,
    pub(crate) sort: bool,
    pub(crate) open_cap: usize,
    pub(crate) cache_capacity: usize,
    #[cfg(all(target_os = "linux", feature = "ring"))]
    pub(crate) kernel_ring: bool,
}

impl Traversal {
    /// Starts building a traversal over `roots`.
    #[must_use]
    #[inline]
    pub fn init<I, A>(roots: I) -> TraversalBuilder
    where
        I: IntoIterator<Item = A>,
        A: AsRef<OsStr>,
    {
        TraversalBuilder::new(roots)
    }

    /**
    Runs the traversal, invoking `callback` for every entry.

    The callback runs on the calling thread only and may block freely; the
    I/O queue keeps working underneath it. Recoverable errors arrive inside
    entries, never here.

    # Errors
    Only [`ConfigError::Queue`] when the worker pool cannot be stood up,
    before any callback has fired.
    */
    pub fn run<F>(&self, callback: F) -> Result<Summary, ConfigError>
    where
        F: FnMut(&Entry<'_>) -> Visit,
    {
        engine::run(self, callback)
    }
}
