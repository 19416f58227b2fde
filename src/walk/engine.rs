/*!
The traversal state machine.

One consumer thread owns everything here: the visit queue, the subtree slab,
the descriptor cache and the callback. Worker threads only ever see the I/O
queue's rings.

Scheduling in one paragraph: entries join the visit queue when their parent
directory is read (appended at the tail for breadth-first order, reversed at
the front for depth-first), and the callback fires when an entry reaches the
head. Directory opens are dispatched speculatively while their entries wait
in the queue, capped at `2 * nthreads + 1` in flight; a directory whose open
has not settled by visit time is awaited in issuance order, which keeps the
output deterministic no matter how workers reorder completions. A visited
directory's stream is then read immediately and its children appended as one
contiguous block.

The deepening strategies run this same machine repeatedly under per-pass
depth bounds, suppressing callbacks below the pass floor so every entry is
reported exactly once, on the first pass that reaches its depth.
*/

use crate::error::ConfigError;
use crate::fs::{DirReader, Dirent, FileStat, FileType, open_dir_at, stat_at, stat_fd};
use crate::ioq::{Completion, Ioq, Op, Output};
use crate::walk::cache::FdCache;
use crate::walk::config::{FollowPolicy, MountPolicy, Strategy, Traversal};
use crate::walk::path::DirPath;
use crate::walk::{Entry, Summary, Visit, VisitKind};
use core::cell::OnceCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::CString;
use tracing::{debug, trace, warn};

/// High bit distinguishes stat-prefetch tokens from subtree ids.
const STAT_TOKEN: u64 = 1 << 63;

/// Where a subtree's speculative open currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenState {
    Unissued,
    Pending,
    /// Opened at least once; the descriptor is in the cache unless evicted,
    /// and an acquire miss reopens through the ancestor chain.
    Ready,
    Failed,
}

/// Book-keeping for one directory selected for descent.
#[derive(Debug)]
struct Subtree {
    parent: Option<usize>,
    depth: u32,
    /// Full directory path with reserved room for one child name.
    path: DirPath,
    /// Base name relative to the parent (roots carry their whole path).
    name: CString,
    /// Whether the open should resolve a trailing symlink.
    follow: bool,
    open: OpenState,
    /// Set once the directory stream has been consumed (or abandoned).
    sealed: bool,
    /// Queued children that have not finished yet.
    pending_children: usize,
    completed_children: usize,
    /// Outstanding async operations referencing this directory's descriptor.
    refs: usize,
    /// True while an in-flight open of this subtree pins the parent slot.
    parent_pinned: bool,
    dev_ino: Option<(u64, u64)>,
    /// Device of the root this subtree was discovered under.
    root_dev: Option<u64>,
    errno: Option<i32>,
    /// The errno was already delivered on the pre-order visit.
    error_reported: bool,
    /// One forced-eviction retry after EMFILE/ENFILE has been spent.
    retried: bool,
    /// A descendant was cut off by the pass ceiling; the subtree is not
    /// fully explored yet and its post-order visit must wait.
    clipped: bool,
    /// Smallest pass ceiling that fully explores this subtree. Used to fire
    /// each post-order visit on exactly one deepening pass.
    need: u32,
}

/// One entry waiting in the visit queue.
struct Item {
    parent: Option<usize>,
    name: CString,
    depth: u32,
    ftype: FileType,
    /// Present when this entry is a directory selected for descent.
    subtree: Option<usize>,
    stat: OnceCell<Result<FileStat, i32>>,
    stat_token: Option<u64>,
    /// Whether stats of this entry resolve a trailing symlink.
    follow: bool,
}

/// Depth bounds of the current pass. Single-pass strategies use one pass
/// covering everything.
#[derive(Debug, Clone, Copy)]
struct Pass {
    /// Entries shallower than this were reported on an earlier pass.
    floor: u32,
    /// Entries up to this depth are visited; directories strictly below it
    /// are read.
    ceiling: u32,
    prev_ceiling: Option<u32>,
}

struct Engine<'cfg> {
    cfg: &'cfg Traversal,
    ioq: Ioq,
    cache: FdCache,
    subtrees: Vec<Option<Subtree>>,
    free: Vec<usize>,
    queue: VecDeque<Item>,
    /// Subtrees whose opens have not been dispatched, in expected read order.
    to_open: VecDeque<usize>,
    in_flight_opens: usize,
    /// Stat prefetch bookkeeping: token -> pinned parent, interest set,
    /// landed results.
    stat_parent: HashMap<u64, usize>,
    stat_wanted: HashSet<u64>,
    stat_results: HashMap<u64, Result<FileStat, i32>>,
    stat_counter: u64,
    /// Paths the callback pruned, remembered across deepening passes where
    /// the suppressed callback cannot re-prune.
    pruned: Option<HashSet<Vec<u8>>>,
    pass: Pass,
    /// A directory was cut off by the ceiling; another pass is required.
    clipped_pass: bool,
    stopped: bool,
    visits: u64,
    errors: u64,
}

pub(crate) fn run<F>(cfg: &Traversal, mut callback: F) -> Result<Summary, ConfigError>
where
    F: FnMut(&Entry<'_>) -> Visit,
{
    // Capacity covers the open pipeline plus an equal allowance of stat
    // prefetches; closes are uncounted.
    let capacity = cfg.open_cap * 2;
    #[cfg(all(target_os = "linux", feature = "ring"))]
    let ioq = if cfg.kernel_ring {
        Ioq::with_ring(capacity)?
    } else {
        Ioq::new(capacity, cfg.nthreads)?
    };
    #[cfg(not(all(target_os = "linux", feature = "ring")))]
    let ioq = Ioq::new(capacity, cfg.nthreads)?;

    let deepening = matches!(cfg.strategy, Strategy::Ids | Strategy::Eds);
    let mut engine = Engine {
        cfg,
        ioq,
        cache: FdCache::new(cfg.cache_capacity),
        subtrees: Vec::new(),
        free: Vec::new(),
        queue: VecDeque::new(),
        to_open: VecDeque::new(),
        in_flight_opens: 0,
        stat_parent: HashMap::new(),
        stat_wanted: HashSet::new(),
        stat_results: HashMap::new(),
        stat_counter: 0,
        pruned: (deepening && cfg.prune).then(HashSet::new),
        pass: Pass {
            floor: 0,
            ceiling: cfg.max_depth,
            prev_ceiling: None,
        },
        clipped_pass: false,
        stopped: false,
        visits: 0,
        errors: 0,
    };

    debug!(strategy = ?cfg.strategy, roots = cfg.roots.len(), threads = cfg.nthreads, "traversal started");

    if deepening {
        let mut ceiling = 0u32;
        let mut previous: Option<u32> = None;
        loop {
            let effective = ceiling.min(cfg.max_depth);
            engine.pass = Pass {
                floor: previous.map_or(0, |prev| prev + 1),
                ceiling: effective,
                prev_ceiling: previous,
            };
            let clipped = engine.run_pass(&mut callback);
            if engine.stopped || !clipped || effective >= cfg.max_depth {
                break;
            }
            previous = Some(effective);
            ceiling = match cfg.strategy {
                Strategy::Ids => effective + 1,
                Strategy::Eds => (effective * 2).max(1),
                Strategy::Bfs | Strategy::Dfs => unreachable!(),
            };
        }
    } else {
        engine.run_pass(&mut callback);
    }

    engine.shutdown();
    debug!(visits = engine.visits, errors = engine.errors, stopped = engine.stopped, "traversal finished");

    Ok(Summary {
        visits: engine.visits,
        errors: engine.errors,
        stopped: engine.stopped,
    })
}

impl<'cfg> Engine<'cfg> {
    // ------------------------------------------------------------------
    // slab plumbing

    fn subtree(&self, id: usize) -> Option<&Subtree> {
        self.subtrees.get(id).and_then(Option::as_ref)
    }

    fn subtree_mut(&mut self, id: usize) -> Option<&mut Subtree> {
        self.subtrees.get_mut(id).and_then(Option::as_mut)
    }

    fn alloc_subtree(&mut self, subtree: Subtree) -> usize {
        if let Some(id) = self.free.pop() {
            self.subtrees[id] = Some(subtree);
            id
        } else {
            self.subtrees.push(Some(subtree));
            self.subtrees.len() - 1
        }
    }

    fn new_subtree(
        &mut self,
        parent: Option<usize>,
        depth: u32,
        path: DirPath,
        name: CString,
        follow: bool,
    ) -> usize {
        self.alloc_subtree(Subtree {
            parent,
            depth,
            path,
            name,
            follow,
            open: OpenState::Unissued,
            sealed: false,
            pending_children: 0,
            completed_children: 0,
            refs: 0,
            parent_pinned: false,
            dev_ino: None,
            root_dev: None,
            errno: None,
            error_reported: false,
            retried: false,
            clipped: false,
            need: depth,
        })
    }

    // ------------------------------------------------------------------
    // one pass of the machine

    fn run_pass<F>(&mut self, callback: &mut F) -> bool
    where
        F: FnMut(&Entry<'_>) -> Visit,
    {
        self.clipped_pass = false;
        self.seed_roots();

        loop {
            if self.stopped {
                self.abort_pass();
                return self.clipped_pass;
            }

            // Opportunistically bank whatever the workers finished, then
            // keep the open pipeline full.
            while let Some(completion) = self.ioq.poll() {
                self.handle_completion(completion, callback);
            }
            self.pump_opens();

            let Some(item) = self.queue.pop_front() else {
                // Late stat completions may still hold subtree refs.
                if self.ioq.outstanding() > 0 {
                    if let Some(completion) = self.ioq.wait() {
                        self.handle_completion(completion, callback);
                        continue;
                    }
                }
                break;
            };
            self.visit_item(item, callback);
        }

        debug_assert!(
            self.stopped || self.subtrees.iter().all(Option::is_none),
            "subtrees survived a completed pass"
        );
        self.stat_results.clear();
        self.clipped_pass
    }

    fn seed_roots(&mut self) {
        let follow_roots = matches!(
            self.cfg.follow,
            FollowPolicy::ComFollow | FollowPolicy::Logical
        );
        for index in 0..self.cfg.roots.len() {
            let root = self.cfg.roots[index].clone();
            let root_path = DirPath::new(root.to_bytes());
            let root_pruned = self
                .pruned
                .as_ref()
                .is_some_and(|set| set.contains(root_path.dir()));
            let subtree = if self.pass.ceiling > 0 && !root_pruned {
                let id = self.new_subtree(None, 0, root_path, root.clone(), follow_roots);
                self.to_open.push_back(id);
                Some(id)
            } else {
                None // depth-0 pass never reads anything
            };
            self.queue.push_back(Item {
                parent: None,
                name: root,
                depth: 0,
                ftype: FileType::Unknown,
                subtree,
                stat: OnceCell::new(),
                stat_token: None,
                follow: follow_roots,
            });
        }
    }

    /// Tears down a stopped pass: pending visits are dropped, in-flight
    /// completions are drained with their resources released.
    fn abort_pass(&mut self) {
        self.queue.clear();
        self.to_open.clear();
        while self.ioq.outstanding() > 0 {
            let Some(completion) = self.ioq.wait() else { break };
            drop(completion); // a successful open closes with the drop
        }
        self.subtrees.clear();
        self.free.clear();
        self.stat_parent.clear();
        self.stat_wanted.clear();
        self.stat_results.clear();
        self.in_flight_opens = 0;
    }

    fn shutdown(&mut self) {
        while self.ioq.outstanding() > 0 {
            let Some(completion) = self.ioq.wait() else { break };
            drop(completion);
        }
        trace!(cached = self.cache.len(), "closing cached descriptors");
        for fd in self.cache.drain() {
            let _ = self.ioq.submit(Op::Close { fd: fd.into_raw() }, 0);
        }
        self.ioq.cancel();
        // Dropping the queue joins the workers, which executes every close.
    }

    // ------------------------------------------------------------------
    // the open pipeline

    /// Dispatches speculative opens for queued directories, front first, up
    /// to the in-flight cap.
    fn pump_opens(&mut self) {
        while self.in_flight_opens < self.cfg.open_cap {
            let Some(id) = self.to_open.pop_front() else { return };
            if self
                .subtree(id)
                .is_some_and(|st| st.open == OpenState::Unissued)
                && !self.issue_open(id)
            {
                // Queue full; keep the slot for the next pump.
                self.to_open.push_front(id);
                return;
            }
        }
    }

    /// Submits the open for `id`, pinning the parent descriptor for the
    /// flight. Returns false only when the queue refused the submission.
    fn issue_open(&mut self, id: usize) -> bool {
        let Some(st) = self.subtree(id) else { return true };
        debug_assert!(st.open == OpenState::Unissued);
        let (parent, name, follow) = (st.parent, st.name.clone(), st.follow);

        let dirfd = match parent {
            None => None,
            Some(p) => match self.ensure_dirfd(p) {
                Ok(raw) => Some(raw),
                Err(errno) => {
                    // The parent descriptor is gone and could not come back;
                    // the child inherits the failure.
                    self.record_failure(id, errno);
                    return true;
                }
            },
        };

        match self.ioq.submit(Op::Open { parent: dirfd, name, follow }, id as u64) {
            Ok(_) => {
                if let Some(p) = parent {
                    if let Some(ps) = self.subtree_mut(p) {
                        ps.refs += 1;
                    }
                    if let Some(st) = self.subtree_mut(id) {
                        st.parent_pinned = true;
                    }
                }
                if let Some(st) = self.subtree_mut(id) {
                    st.open = OpenState::Pending;
                }
                self.in_flight_opens += 1;
                true
            }
            Err(_refused) => {
                if let Some(p) = parent {
                    self.cache.release(p);
                }
                false
            }
        }
    }

    fn record_failure(&mut self, id: usize, errno: i32) {
        self.errors += 1;
        if let Some(st) = self.subtree_mut(id) {
            st.open = OpenState::Failed;
            st.errno = Some(errno);
        }
    }

    /// Pins and returns the descriptor for `id`, reopening through the
    /// ancestor chain after an eviction. The caller owns one release.
    fn ensure_dirfd(&mut self, id: usize) -> Result<i32, i32> {
        if let Some(raw) = self.cache.acquire(id) {
            return Ok(raw);
        }
        self.reopen(id)?;
        self.cache.acquire(id).ok_or(libc::EBADF)
    }

    /// Reopens an evicted directory. Relative to the parent descriptor so
    /// paths beyond `PATH_MAX` keep working; the ancestor chain is revived
    /// recursively as needed.
    fn reopen(&mut self, id: usize) -> Result<(), i32> {
        debug_assert!(!self.cache.contains(id), "reopening a cached directory");
        let Some(st) = self.subtree(id) else {
            return Err(libc::EBADF);
        };
        let (parent, name, follow, dev_ino) = (st.parent, st.name.clone(), st.follow, st.dev_ino);
        trace!(id, "reopening evicted directory");

        let fd = match parent {
            None => open_dir_at(None, &name, follow)?,
            Some(p) => {
                let praw = self.ensure_dirfd(p)?;
                let opened = open_dir_at(Some(praw), &name, follow);
                self.cache.release(p);
                opened?
            }
        };

        // The directory may have been replaced since we first opened it.
        if let Some((dev, ino)) = dev_ino {
            let st = stat_fd(fd.raw())?;
            if (st.dev(), st.ino()) != (dev, ino) {
                return Err(libc::ESTALE);
            }
        }
        self.cache_insert(id, fd);
        // The insert may evict another slot, never this one: the openat
        // above succeeded and must not turn into a miss for the caller.
        debug_assert!(self.cache.contains(id), "fresh reopen lost its slot");
        Ok(())
    }

    fn cache_insert(&mut self, id: usize, fd: crate::fs::FileDes) {
        if let Some((victim, vfd)) = self.cache.insert(id, fd) {
            // Over capacity: the LRU unpinned slot closes asynchronously.
            trace!(victim, "evicting cached descriptor");
            let _ = self.ioq.submit(Op::Close { fd: vfd.into_raw() }, 0);
        }
    }

    /// Blocks until the speculative open of `id` has settled, applying every
    /// other completion that arrives in the meantime.
    fn await_open<F>(&mut self, id: usize, callback: &mut F)
    where
        F: FnMut(&Entry<'_>) -> Visit,
    {
        loop {
            if self.stopped {
                return;
            }
            match self.subtree(id).map(|st| st.open) {
                None | Some(OpenState::Ready | OpenState::Failed) => return,
                Some(OpenState::Unissued) => {
                    if !self.issue_open(id) {
                        // Queue full: make room and try again.
                        match self.ioq.wait() {
                            Some(completion) => self.handle_completion(completion, callback),
                            None => {
                                self.record_failure(id, libc::EAGAIN);
                                return;
                            }
                        }
                    }
                }
                Some(OpenState::Pending) => match self.ioq.wait() {
                    Some(completion) => self.handle_completion(completion, callback),
                    None => {
                        // Nothing outstanding yet the open never settled;
                        // fail it rather than spin.
                        self.in_flight_opens = self.in_flight_opens.saturating_sub(1);
                        self.record_failure(id, libc::EIO);
                        return;
                    }
                },
            }
        }
    }

    fn handle_completion<F>(&mut self, completion: Completion, callback: &mut F)
    where
        F: FnMut(&Entry<'_>) -> Visit,
    {
        if completion.token & STAT_TOKEN != 0 {
            self.handle_stat_completion(completion, callback);
            return;
        }

        #[allow(clippy::cast_possible_truncation)] // tokens below STAT_TOKEN are slab ids
        let id = completion.token as usize;
        self.in_flight_opens = self.in_flight_opens.saturating_sub(1);

        // Release the parent pin taken at issue time.
        let parent = self.subtree(id).and_then(|st| st.parent);
        if self.subtree(id).is_some_and(|st| st.parent_pinned) {
            if let Some(p) = parent {
                self.cache.release(p);
                if let Some(ps) = self.subtree_mut(p) {
                    ps.refs = ps.refs.saturating_sub(1);
                }
            }
            if let Some(st) = self.subtree_mut(id) {
                st.parent_pinned = false;
            }
        }

        let Some(retried) = self.subtree(id).map(|st| st.retried) else {
            // Subtree vanished (stopped pass); dropping the completion
            // closes any descriptor it carried.
            return;
        };

        match completion.result {
            Ok(Output::Fd(fd)) => {
                if let Some(st) = self.subtree_mut(id) {
                    st.open = OpenState::Ready;
                }
                self.cache_insert(id, fd);
            }
            Err(errno @ (libc::EMFILE | libc::ENFILE)) if !retried => {
                // Descriptor exhaustion: force an eviction and retry once.
                if let Some(st) = self.subtree_mut(id) {
                    st.retried = true;
                    st.open = OpenState::Unissued;
                }
                if let Some((victim, vfd)) = self.cache.evict_one() {
                    warn!(victim, "descriptor limit hit, evicting and retrying open");
                    drop(vfd); // closed synchronously, the retry needs the slot now
                    let _ = self.issue_open(id);
                } else {
                    self.record_failure(id, errno);
                }
            }
            Err(errno) => self.record_failure(id, errno),
            Ok(Output::Stat(_)) => debug_assert!(false, "stat completion with an open token"),
        }
    }

    fn handle_stat_completion<F>(&mut self, completion: Completion, callback: &mut F)
    where
        F: FnMut(&Entry<'_>) -> Visit,
    {
        let token = completion.token;
        if let Some(parent) = self.stat_parent.remove(&token) {
            self.cache.release(parent);
            if let Some(ps) = self.subtree_mut(parent) {
                ps.refs = ps.refs.saturating_sub(1);
            }
            // The parent may have been waiting on this ref to finish.
            self.try_complete(parent, callback);
        }
        if self.stat_wanted.remove(&token) {
            let mapped = match completion.result {
                Ok(Output::Stat(st)) => Ok(st),
                Ok(Output::Fd(_)) => Err(libc::EIO),
                Err(errno) => Err(errno),
            };
            self.stat_results.insert(token, mapped);
        }
    }

    // ------------------------------------------------------------------
    // visiting

    fn visit_item<F>(&mut self, mut item: Item, callback: &mut F)
    where
        F: FnMut(&Entry<'_>) -> Visit,
    {
        // Claim a prefetched stat, or withdraw interest in one still flying.
        if let Some(token) = item.stat_token.take() {
            if let Some(result) = self.stat_results.remove(&token) {
                let _ = item.stat.set(result);
            } else {
                self.stat_wanted.remove(&token);
            }
        }

        let visible = item.depth >= self.pass.floor && item.depth >= self.cfg.min_depth;
        match item.subtree {
            Some(id) => self.visit_directory(&item, id, visible, callback),
            None => self.visit_plain(&item, visible, callback),
        }
    }

    /// Visits an entry that is not being descended into: files, and
    /// directories held back by the depth ceiling.
    fn visit_plain<F>(&mut self, item: &Item, visible: bool, callback: &mut F)
    where
        F: FnMut(&Entry<'_>) -> Visit,
    {
        let mut ftype = item.ftype;
        if ftype == FileType::Unknown && (visible || item.depth >= self.pass.ceiling) {
            // No d_type from the filesystem; resolve before choosing the
            // visit kind (and before the ceiling check below, which needs to
            // know directories from files). Seeds the lazy stat en passant.
            ftype = self.resolve_type(item).unwrap_or(FileType::Unknown);
        }

        if ftype.is_dir() && item.depth >= self.pass.ceiling && item.depth < self.cfg.max_depth {
            // Cut off by this pass's ceiling; a deeper pass will descend.
            self.clipped_pass = true;
            if let Some(p) = item.parent {
                if let Some(ps) = self.subtree_mut(p) {
                    ps.clipped = true;
                }
            }
        }

        if visible && !self.stopped {
            let kind = if ftype.is_dir() { VisitKind::Pre } else { VisitKind::Leaf };
            let control = self.deliver(item, kind, ftype, None, callback);
            if control == Visit::Stop {
                self.stopped = true;
            } else {
                if control == Visit::Prune && self.cfg.prune && ftype.is_dir() {
                    // The dir is only queued, not descended, this pass; a
                    // deeper pass must still honour the prune.
                    self.remember_prune(item);
                }
                if kind == VisitKind::Pre
                    && self.cfg.post_order
                    && item.depth == self.cfg.max_depth
                {
                    // A directory at the depth limit has a trivially complete
                    // subtree: its post-order visit follows immediately.
                    if self.deliver(item, VisitKind::Post, ftype, None, callback) == Visit::Stop {
                        self.stopped = true;
                    }
                }
            }
        }

        self.finish_child(item.parent, callback);
    }

    /// Records a pruned path so suppressed callbacks on later deepening
    /// passes cannot descend it.
    fn remember_prune(&mut self, item: &Item) {
        if self.pruned.is_none() {
            return;
        }
        let full = match item.parent {
            Some(p) => self
                .subtree(p)
                .map(|ps| ps.path.child(item.name.to_bytes()).dir().to_vec()),
            None => Some(DirPath::new(item.name.to_bytes()).dir().to_vec()),
        };
        if let (Some(set), Some(path)) = (self.pruned.as_mut(), full) {
            set.insert(path);
        }
    }

    /// Resolves an unknown type with a relative stat, preferring the cached
    /// parent descriptor.
    fn resolve_type(&mut self, item: &Item) -> Option<FileType> {
        if let Some(Ok(st)) = item.stat.get() {
            return Some(st.file_type());
        }
        let parent_fd = item.parent.and_then(|p| self.cache.acquire(p));
        let result = match (parent_fd, item.parent) {
            (Some(raw), Some(p)) => {
                let res = stat_at(Some(raw), &item.name, item.follow);
                self.cache.release(p);
                res
            }
            _ => stat_at(None, &item.name, item.follow),
        };
        let _ = item.stat.set(result);
        item.stat.get().and_then(|r| r.as_ref().ok()).map(FileStat::file_type)
    }

    fn visit_directory<F>(&mut self, item: &Item, id: usize, visible: bool, callback: &mut F)
    where
        F: FnMut(&Entry<'_>) -> Visit,
    {
        // Settle the speculative open first so the pre-order visit can carry
        // its outcome. Issuance order is preserved even when later opens
        // completed earlier.
        self.await_open(id, callback);
        if self.stopped {
            return;
        }

        let (state, errno) = match self.subtree(id) {
            Some(st) => (st.open, st.errno),
            None => return,
        };

        if state == OpenState::Failed {
            // The type hint can lie (a racing rename) and a symlink given as
            // a root is not an error under the physical policy: both surface
            // as ENOTDIR/ELOOP here (EMLINK/EFTYPE on the BSDs) and re-type
            // into plain entries.
            #[cfg(any(target_os = "netbsd", target_os = "freebsd", target_os = "dragonfly"))]
            let not_a_dir = matches!(
                errno,
                Some(libc::ENOTDIR | libc::ELOOP | libc::EMLINK | libc::EFTYPE)
            );
            #[cfg(not(any(target_os = "netbsd", target_os = "freebsd", target_os = "dragonfly")))]
            let not_a_dir = matches!(errno, Some(libc::ENOTDIR | libc::ELOOP | libc::EMLINK));
            if not_a_dir {
                let resolved = self.resolve_type(item).unwrap_or(item.ftype);
                if !resolved.is_dir() {
                    self.errors = self.errors.saturating_sub(1); // not an error after all
                    if visible && !self.stopped {
                        let kind = if resolved.is_dir() { VisitKind::Pre } else { VisitKind::Leaf };
                        if self.deliver(item, kind, resolved, None, callback) == Visit::Stop {
                            self.stopped = true;
                        }
                    }
                    self.discard_subtree(id, callback);
                    return;
                }
            }

            // A genuinely unopenable directory: the pre-order visit carries
            // the error and there are no children.
            if visible && !self.stopped {
                let control = self.deliver(item, VisitKind::Pre, FileType::Directory, errno, callback);
                if let Some(st) = self.subtree_mut(id) {
                    st.error_reported = true;
                }
                if control == Visit::Stop {
                    self.stopped = true;
                }
            }
            if let Some(st) = self.subtree_mut(id) {
                st.sealed = true;
                st.need = st.depth + 1; // reading it was required and never happened
            }
            self.try_complete(id, callback);
            return;
        }

        debug_assert!(state == OpenState::Ready);
        let mut descend = true;
        if visible && !self.stopped {
            let control = self.deliver(item, VisitKind::Pre, FileType::Directory, None, callback);
            match control {
                Visit::Stop => {
                    self.stopped = true;
                    return;
                }
                Visit::Prune if self.cfg.prune => {
                    descend = false;
                    if let Some(set) = self.pruned.as_mut() {
                        if let Some(st) = self.subtrees.get(id).and_then(Option::as_ref) {
                            set.insert(st.path.dir().to_vec());
                        }
                    }
                }
                Visit::Prune | Visit::Continue => {}
            }
        }

        if descend {
            self.read_subtree(id);
        } else if let Some(st) = self.subtree_mut(id) {
            st.sealed = true;
            st.need = st.depth; // pruned: complete within policy as it stands
        }
        self.try_complete(id, callback);
    }

    // ------------------------------------------------------------------
    // reading a directory stream

    fn read_subtree(&mut self, id: usize) {
        let raw = match self.ensure_dirfd(id) {
            Ok(raw) => raw,
            Err(errno) => {
                self.record_failure(id, errno);
                if let Some(st) = self.subtree_mut(id) {
                    st.sealed = true;
                    st.need = st.depth + 1;
                }
                return;
            }
        };

        // Identity first: it anchors the mount policy, the cycle check, and
        // eviction-survival for every descendant.
        if let Some(reason) = self.check_boundaries(id, raw) {
            self.cache.release(id);
            if let Some(st) = self.subtree_mut(id) {
                st.sealed = true;
                match reason {
                    Boundary::Mount => st.need = st.depth,
                    Boundary::Cycle => {
                        st.errno = Some(libc::ELOOP);
                        st.need = st.depth + 1;
                    }
                }
            }
            if matches!(reason, Boundary::Cycle) {
                self.errors += 1;
            }
            return;
        }

        let mut children: Vec<Dirent> = Vec::new();
        let mut read_error = None;
        match DirReader::new(raw) {
            Ok(mut reader) => loop {
                match reader.next_entry() {
                    Ok(Some(entry)) => children.push(entry),
                    Ok(None) => break,
                    Err(errno) => {
                        read_error = Some(errno);
                        break;
                    }
                }
            },
            Err(errno) => read_error = Some(errno),
        }

        if let Some(errno) = read_error {
            self.errors += 1;
            if let Some(st) = self.subtree_mut(id) {
                st.errno = Some(errno);
            }
            if !self.cfg.recover {
                // Without recovery a broken stream reports only the error.
                children.clear();
            }
        }

        if self.cfg.sort {
            children.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        }

        let child_depth = match self.subtree(id) {
            Some(st) => st.depth + 1,
            None => return,
        };
        let mut batch = Vec::with_capacity(children.len());
        let mut new_dirs = Vec::new();
        for dirent in children {
            let item = self.make_item(id, raw, dirent, child_depth, &mut new_dirs);
            batch.push(item);
        }
        self.cache.release(id);

        if let Some(st) = self.subtree_mut(id) {
            st.pending_children = batch.len();
            st.sealed = true;
            st.need = st.need.max(st.depth + 1);
        }

        // The whole brood lands as one contiguous block: tail for FIFO
        // strategies, reversed at the front for depth-first, which is what
        // keeps sibling subtrees from interleaving mid-directory.
        match self.cfg.strategy {
            Strategy::Dfs => {
                for item in batch.into_iter().rev() {
                    self.queue.push_front(item);
                }
                for dir in new_dirs.into_iter().rev() {
                    self.to_open.push_front(dir);
                }
            }
            Strategy::Bfs | Strategy::Ids | Strategy::Eds => {
                self.queue.extend(batch);
                self.to_open.extend(new_dirs);
            }
        }
    }

    /// Applies the mount policy and the ancestor cycle check, recording the
    /// subtree's identity along the way.
    fn check_boundaries(&mut self, id: usize, raw: i32) -> Option<Boundary> {
        let identity = match stat_fd(raw) {
            Ok(st) => (st.dev(), st.ino()),
            Err(_) => return None, // unreadable identity; the stream decides
        };

        let parent = self.subtree(id).and_then(|st| st.parent);
        let parent_dev = parent
            .and_then(|p| self.subtree(p))
            .and_then(|ps| ps.dev_ino)
            .map(|(dev, _)| dev);
        let root_dev = match parent {
            None => Some(identity.0),
            Some(p) => self.subtree(p).and_then(|ps| ps.root_dev),
        };

        if let Some(st) = self.subtree_mut(id) {
            st.dev_ino = Some(identity);
            st.root_dev = root_dev;
        }

        match self.cfg.mount {
            MountPolicy::Crossing => {}
            MountPolicy::NoCross => {
                if parent_dev.is_some_and(|dev| dev != identity.0) {
                    trace!(id, "not crossing below a mount point");
                    return Some(Boundary::Mount);
                }
            }
            MountPolicy::SameFs => {
                if root_dev.is_some_and(|dev| dev != identity.0) {
                    trace!(id, "leaving the root filesystem, not descending");
                    return Some(Boundary::Mount);
                }
            }
        }

        if self.cfg.follow != FollowPolicy::Physical {
            // Walk the ancestor chain; a matching (dev, ino) means a symlink
            // led back into something already being read.
            let mut cursor = parent;
            while let Some(ancestor) = cursor {
                let Some(anc) = self.subtree(ancestor) else { break };
                if anc.dev_ino == Some(identity) {
                    warn!(id, "symlink cycle detected");
                    return Some(Boundary::Cycle);
                }
                cursor = anc.parent;
            }
        }
        None
    }

    /// Builds the queue item for one freshly read child, creating its
    /// subtree when it is a directory due for descent.
    fn make_item(
        &mut self,
        parent_id: usize,
        parent_raw: i32,
        dirent: Dirent,
        depth: u32,
        new_dirs: &mut Vec<usize>,
    ) -> Item {
        let stat_cell = OnceCell::new();
        let follow = self.cfg.follow == FollowPolicy::Logical;
        let mut ftype = dirent.ftype;

        // An unknown type needs resolving to route the entry, and a symlink
        // only becomes walkable if it points at a directory.
        if ftype == FileType::Unknown || (ftype == FileType::Symlink && follow) {
            if let Ok(st) = stat_at(Some(parent_raw), &dirent.name, follow) {
                ftype = st.file_type();
                let _ = stat_cell.set(Ok(st));
            }
        }

        let mut subtree = None;
        if ftype.is_dir() && depth < self.pass.ceiling {
            let not_pruned = match (&self.pruned, self.subtree(parent_id)) {
                (Some(set), Some(ps)) => {
                    !set.contains(ps.path.child(dirent.name.to_bytes()).dir())
                }
                _ => true,
            };
            if not_pruned {
                let child_path = match self.subtree(parent_id) {
                    Some(ps) => ps.path.child(dirent.name.to_bytes()),
                    None => DirPath::new(dirent.name.to_bytes()),
                };
                let sid =
                    self.new_subtree(Some(parent_id), depth, child_path, dirent.name.clone(), follow);
                new_dirs.push(sid);
                subtree = Some(sid);
            }
        }

        let mut item = Item {
            parent: Some(parent_id),
            name: dirent.name,
            depth,
            ftype,
            subtree,
            stat: stat_cell,
            stat_token: None,
            follow,
        };

        if self.cfg.stat_all && item.stat.get().is_none() {
            self.prefetch_stat(parent_id, parent_raw, &mut item);
        }
        item
    }

    /// Queues a stat for the entry, pinning the parent descriptor until the
    /// completion lands. Skipped silently when the queue is full; the lazy
    /// stat at visit time covers the gap.
    fn prefetch_stat(&mut self, parent_id: usize, parent_raw: i32, item: &mut Item) {
        if self.cache.acquire(parent_id).is_none() {
            return;
        }
        let token = STAT_TOKEN | self.stat_counter;
        self.stat_counter += 1;
        let op = Op::Stat {
            parent: Some(parent_raw),
            name: item.name.clone(),
            follow: item.follow,
        };
        match self.ioq.submit(op, token) {
            Ok(_) => {
                self.stat_parent.insert(token, parent_id);
                self.stat_wanted.insert(token);
                if let Some(ps) = self.subtree_mut(parent_id) {
                    ps.refs += 1;
                }
                item.stat_token = Some(token);
            }
            Err(_) => self.cache.release(parent_id),
        }
    }

    // ------------------------------------------------------------------
    // completion of subtrees, post-order visits, teardown of entries

    /// Marks a plain entry finished and cascades completion up the chain.
    fn finish_child<F>(&mut self, parent: Option<usize>, callback: &mut F)
    where
        F: FnMut(&Entry<'_>) -> Visit,
    {
        let Some(p) = parent else { return };
        if let Some(ps) = self.subtree_mut(p) {
            ps.pending_children = ps.pending_children.saturating_sub(1);
            ps.completed_children += 1;
        }
        self.try_complete(p, callback);
    }

    /// Destroys a subtree that turned out not to be a directory at all.
    fn discard_subtree<F>(&mut self, id: usize, callback: &mut F)
    where
        F: FnMut(&Entry<'_>) -> Visit,
    {
        if let Some(st) = self.subtree_mut(id) {
            st.sealed = true;
            st.need = st.depth;
        }
        if let Some(parent) = self.destroy_subtree(id) {
            self.try_complete(parent, callback);
        }
    }

    /**
    Completes every subtree in the chain that is sealed with no pending
    children and no outstanding operations, firing post-order visits on the
    way up.

    A post-order visit fires when requested, or unconditionally to deliver
    an error the pre-order visit could not carry. Under the deepening
    strategies it additionally fires only on the first pass whose ceiling
    covers the whole subtree (`prev_ceiling < need`), which makes it fire
    exactly once per directory across all passes.
    */
    fn try_complete<F>(&mut self, start: usize, callback: &mut F)
    where
        F: FnMut(&Entry<'_>) -> Visit,
    {
        let mut cursor = Some(start);
        while let Some(id) = cursor {
            let Some(st) = self.subtree(id) else { return };
            if !(st.sealed && st.pending_children == 0 && st.refs == 0) {
                return;
            }
            debug_assert!(!st.parent_pinned, "completing with an open still in flight");

            let wants_post = self.cfg.post_order || (st.errno.is_some() && !st.error_reported);
            let first_covering_pass = self
                .pass
                .prev_ceiling
                .is_none_or(|prev| prev < st.need.max(st.depth));
            let fire = wants_post
                && !st.clipped
                && st.depth >= self.cfg.min_depth
                && first_covering_pass
                && !self.stopped;

            if fire && self.deliver_post(id, callback) == Visit::Stop {
                self.stopped = true;
            }
            cursor = self.destroy_subtree(id);
        }
    }

    /// Frees the slab slot, closes the cached descriptor through the queue,
    /// and folds the completion counters into the parent.
    fn destroy_subtree(&mut self, id: usize) -> Option<usize> {
        if let Some(fd) = self.cache.take(id) {
            let _ = self.ioq.submit(Op::Close { fd: fd.into_raw() }, 0);
        }
        let subtree = self.subtrees.get_mut(id).and_then(Option::take)?;
        self.free.push(id);
        trace!(id, children = subtree.completed_children, "subtree complete");

        let parent = subtree.parent?;
        let ps = self.subtree_mut(parent)?;
        ps.pending_children = ps.pending_children.saturating_sub(1);
        ps.completed_children += 1;
        ps.need = ps.need.max(subtree.need);
        ps.clipped |= subtree.clipped;
        Some(parent)
    }

    // ------------------------------------------------------------------
    // callback delivery

    /// Delivers one visit for a queued entry, assembling its path in the
    /// parent's buffer for the duration of the callback.
    fn deliver<F>(
        &mut self,
        item: &Item,
        kind: VisitKind,
        ftype: FileType,
        errno: Option<i32>,
        callback: &mut F,
    ) -> Visit
    where
        F: FnMut(&Entry<'_>) -> Visit,
    {
        self.visits += 1;
        let name_bytes = item.name.to_bytes();

        match item.parent {
            Some(p) => {
                // Transient pin so the callback's lazy stat can go through
                // the parent descriptor; harmless if it was evicted.
                let parent_fd = self.cache.acquire(p);
                let Some(ps) = self.subtree_mut(p) else {
                    return Visit::Continue;
                };
                ps.path.push(name_bytes);

                let control = {
                    let Some(ps) = self.subtree(p) else {
                        return Visit::Continue;
                    };
                    let entry = Entry {
                        path: ps.path.full(),
                        name_len: name_bytes.len(),
                        depth: item.depth,
                        kind,
                        ftype,
                        errno,
                        parent_fd,
                        name_c: Some(item.name.as_c_str()),
                        follow: item.follow,
                        stat: &item.stat,
                    };
                    callback(&entry)
                };

                if let Some(ps) = self.subtree_mut(p) {
                    ps.path.pop();
                }
                if parent_fd.is_some() {
                    self.cache.release(p);
                }
                control
            }
            None => {
                let entry = Entry {
                    path: name_bytes,
                    name_len: final_component_len(name_bytes),
                    depth: item.depth,
                    kind,
                    ftype,
                    errno,
                    parent_fd: None,
                    name_c: None,
                    follow: item.follow,
                    stat: &item.stat,
                };
                callback(&entry)
            }
        }
    }

    /// Delivers the post-order visit of a completing subtree.
    fn deliver_post<F>(&mut self, id: usize, callback: &mut F) -> Visit
    where
        F: FnMut(&Entry<'_>) -> Visit,
    {
        self.visits += 1;
        let stat_cell = OnceCell::new();
        let Some(st) = self.subtree(id) else {
            return Visit::Continue;
        };
        let dir = st.path.dir();
        let entry = Entry {
            path: dir,
            name_len: final_component_len(dir),
            depth: st.depth,
            kind: VisitKind::Post,
            ftype: FileType::Directory,
            errno: if st.error_reported { None } else { st.errno },
            parent_fd: None,
            name_c: None,
            follow: st.follow,
            stat: &stat_cell,
        };
        callback(&entry)
    }
}

/// Which policy stopped a directory from being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Mount,
    Cycle,
}

/// Length of the final path component ("/" counts as its own name).
fn final_component_len(path: &[u8]) -> usize {
    match path.iter().rposition(|&b| b == b'/') {
        Some(slash) if path.len() > slash + 1 => path.len() - slash - 1,
        Some(_) => path.len(),
        None => path.len(),
    }
}
