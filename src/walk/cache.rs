use crate::fs::FileDes;
use std::collections::HashMap;

/**
Bounded cache of open directory descriptors.

Descriptors are the traversal's scarcest resource: every queued `openat`
wants its parent descriptor alive, while the process descriptor limit caps
how many can exist at once. The cache keys slots by subtree id, counts pins
(a pinned slot is never evicted), and evicts least-recently-used among the
unpinned slots when capacity is breached.

Only the consumer thread touches the cache, so a plain map plus a monotonic
touch counter is enough; eviction scans are rare and the slot count is
bounded by the descriptor limit.
*/
#[derive(Debug)]
pub(crate) struct FdCache {
    slots: HashMap<usize, Slot>,
    capacity: usize,
    tick: u64,
}

#[derive(Debug)]
struct Slot {
    fd: FileDes,
    pins: u32,
    touched: u64,
}

impl FdCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            capacity: capacity.max(1),
            tick: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn contains(&self, id: usize) -> bool {
        self.slots.contains_key(&id)
    }

    /**
    Stores a descriptor for `id`. If the cache is above capacity afterwards,
    the least-recently-used unpinned slot is evicted and returned so the
    caller can close it (asynchronously, via the I/O queue).

    The slot just inserted is exempt from that eviction: when everything
    else is pinned the cache overflows softly instead of eating the entry
    whose insertion triggered the overflow.
    */
    pub fn insert(&mut self, id: usize, fd: FileDes) -> Option<(usize, FileDes)> {
        self.tick += 1;
        let previous = self.slots.insert(
            id,
            Slot {
                fd,
                pins: 0,
                touched: self.tick,
            },
        );
        debug_assert!(previous.is_none(), "subtree already had a descriptor");

        if self.slots.len() > self.capacity {
            self.evict_where(Some(id))
        } else {
            None
        }
    }

    /// Pins the slot for `id` and returns the raw descriptor, or `None` if it
    /// was evicted and the caller has to reopen.
    pub fn acquire(&mut self, id: usize) -> Option<i32> {
        self.tick += 1;
        let slot = self.slots.get_mut(&id)?;
        slot.pins += 1;
        slot.touched = self.tick;
        Some(slot.fd.raw())
    }

    /// Unpins the slot for `id`, refreshing its LRU position.
    pub fn release(&mut self, id: usize) {
        self.tick += 1;
        if let Some(slot) = self.slots.get_mut(&id) {
            debug_assert!(slot.pins > 0, "release without a matching acquire");
            slot.pins = slot.pins.saturating_sub(1);
            slot.touched = self.tick;
        }
    }

    /// Evicts the least-recently-used unpinned slot, returning its id and
    /// descriptor. `None` when every slot is pinned (or the cache is empty).
    pub fn evict_one(&mut self) -> Option<(usize, FileDes)> {
        self.evict_where(None)
    }

    /// LRU eviction scan. `keep` is never selected, so an overflowing
    /// insert cannot evict the slot it just created.
    fn evict_where(&mut self, keep: Option<usize>) -> Option<(usize, FileDes)> {
        let victim = self
            .slots
            .iter()
            .filter(|&(&id, slot)| slot.pins == 0 && Some(id) != keep)
            .min_by_key(|(_, slot)| slot.touched)
            .map(|(&id, _)| id)?;
        let slot = self.slots.remove(&victim)?;
        Some((victim, slot.fd))
    }

    /// Removes the slot for `id` unconditionally, handing the descriptor back.
    pub fn take(&mut self, id: usize) -> Option<FileDes> {
        self.slots.remove(&id).map(|slot| slot.fd)
    }

    /// Empties the cache, returning every descriptor for closure.
    pub fn drain(&mut self) -> Vec<FileDes> {
        self.slots.drain().map(|(_, slot)| slot.fd).collect()
    }
}
