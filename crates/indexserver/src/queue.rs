//! The indexing work queue: a priority heap over repositories keyed by
//! freshness and failure state, with FIFO tiebreak and failure backoff.
//!
//! Entries are known forever (until ownership is lost) but are only *queued*
//! while they sit on the heap. Every entry knows its heap position so
//! repositioning and removal are O(log n) without scanning.

use models::{IndexOptions, IndexState, RepoId};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Failure backoff: after `k` consecutive failures an entry becomes
/// eligible again no sooner than `min(k·base, max)` past the failure. A
/// zero base or max disables backoff entirely.
#[derive(Copy, Clone, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn disabled() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    fn enabled(&self) -> bool {
        !self.base.is_zero() && !self.max.is_zero()
    }

    fn delay_for(&self, consecutive_failures: u32) -> Duration {
        std::cmp::min(self.base * consecutive_failures, self.max)
    }
}

#[derive(Debug, Default)]
struct Backoff {
    eligible_at: Option<Instant>,
    consecutive_failures: u32,
}

impl Backoff {
    fn fail(&mut self, policy: &BackoffPolicy, now: Instant) {
        self.consecutive_failures += 1;
        if policy.enabled() {
            self.eligible_at = Some(now + policy.delay_for(self.consecutive_failures));
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn eligible(&self, now: Instant) -> bool {
        self.eligible_at.map_or(true, |at| now >= at)
    }
}

struct Item {
    opts: IndexOptions,
    /// Whether the last successful build reflects the current options.
    indexed: bool,
    state: Option<IndexState>,
    /// Monotone insertion sequence, the FIFO tiebreak.
    seq: u64,
    /// Position on the heap, or -1 while off it.
    heap_idx: i32,
    backoff: Backoff,
}

/// A read-only view of one entry, passed to [`Queue::iterate`] callbacks.
pub struct EntryView<'a> {
    pub opts: &'a IndexOptions,
    pub indexed: bool,
    pub state: Option<IndexState>,
    pub seq: u64,
    pub queued: bool,
    pub consecutive_failures: u32,
}

#[derive(Default)]
struct Inner {
    heap: Vec<RepoId>,
    items: HashMap<RepoId, Item>,
    next_seq: u64,
}

pub struct Queue {
    policy: BackoffPolicy,
    inner: Mutex<Inner>,
}

impl Queue {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Insert or refresh a repository's options. Changed options mark the
    /// entry stale; the entry joins the heap unless it is backing off.
    pub fn add_or_update(&self, opts: IndexOptions) {
        self.add_or_update_at(opts, Instant::now())
    }

    fn add_or_update_at(&self, opts: IndexOptions, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;

        let id = opts.repo_id;
        match inner.items.entry(id) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                slot.insert(Item {
                    opts,
                    indexed: false,
                    state: None,
                    seq,
                    heap_idx: -1,
                    backoff: Backoff::default(),
                });
            }
            std::collections::hash_map::Entry::Occupied(slot) => {
                let item = slot.into_mut();
                if item.opts != opts {
                    item.opts = opts;
                    item.indexed = false;
                }
            }
        }

        let (heap_idx, eligible) = {
            let item = &inner.items[&id];
            (item.heap_idx, item.backoff.eligible(now))
        };
        if heap_idx >= 0 {
            inner.fix(heap_idx as usize);
        } else if eligible {
            inner.push(id);
        }
    }

    /// Record the outcome of the most recent indexing attempt.
    pub fn set_indexed(&self, opts: &IndexOptions, state: IndexState) {
        self.set_indexed_at(opts, state, Instant::now())
    }

    fn set_indexed_at(&self, opts: &IndexOptions, state: IndexState, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;

        let heap_idx = {
            let Some(item) = inner.items.get_mut(&opts.repo_id) else {
                return;
            };
            item.state = Some(state);
            if state == IndexState::Fail {
                item.backoff.fail(&self.policy, now);
            } else {
                item.backoff.reset();
                item.indexed = item.opts == *opts;
            }
            item.heap_idx
        };
        if heap_idx >= 0 {
            inner.fix(heap_idx as usize);
        }
    }

    /// Remove and return the minimum entry's options, or None when nothing
    /// is queued. The entry itself stays known.
    pub fn pop(&self) -> Option<IndexOptions> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.pop_min()?;
        Some(inner.items[&id].opts.clone())
    }

    /// Re-queue known entries by id, subject to backoff. Returns the subset
    /// of ids the queue does not know, for the caller to fetch options for.
    pub fn bump(&self, ids: &[RepoId]) -> Vec<RepoId> {
        self.bump_at(ids, Instant::now())
    }

    fn bump_at(&self, ids: &[RepoId], now: Instant) -> Vec<RepoId> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;

        let mut unknown = Vec::new();
        for &id in ids {
            let should_push = match inner.items.get(&id) {
                None => {
                    unknown.push(id);
                    false
                }
                Some(item) => item.heap_idx < 0 && item.backoff.eligible(now),
            };
            if should_push {
                inner.push(id);
            }
        }
        unknown
    }

    /// Drop every entry whose id is not in `owned`. The steady-state queue
    /// size equals the owned-set size, so equal sizes skip the scan; a
    /// same-size swap is corrected on the following cycle once the new id
    /// has been added.
    pub fn maybe_remove_missing(&self, owned: &HashSet<RepoId>) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;

        if inner.items.len() == owned.len() {
            return 0;
        }

        let victims: Vec<RepoId> = inner
            .items
            .keys()
            .filter(|id| !owned.contains(id))
            .copied()
            .collect();
        for id in &victims {
            let heap_idx = inner.items.get(id).map(|item| item.heap_idx);
            if let Some(idx) = heap_idx.filter(|idx| *idx >= 0) {
                inner.remove_at(idx as usize);
            }
            inner.items.remove(id);
        }
        victims.len()
    }

    /// Mark a known entry stale and queue it immediately, bypassing backoff.
    /// Used by the debug surface's forced re-index. Returns false for
    /// unknown ids.
    pub fn force(&self, id: RepoId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;

        let heap_idx = {
            let Some(item) = inner.items.get_mut(&id) else {
                return false;
            };
            item.indexed = false;
            item.backoff.reset();
            item.heap_idx
        };
        if heap_idx >= 0 {
            inner.fix(heap_idx as usize);
        } else {
            inner.push(id);
        }
        true
    }

    /// Visit every known entry under the queue lock. The callback must not
    /// reenter the queue.
    pub fn iterate(&self, mut f: impl FnMut(EntryView<'_>)) {
        let inner = self.inner.lock().unwrap();
        for item in inner.items.values() {
            f(EntryView {
                opts: &item.opts,
                indexed: item.indexed,
                state: item.state,
                seq: item.seq,
                queued: item.heap_idx >= 0,
                consecutive_failures: item.backoff.consecutive_failures,
            });
        }
    }

    /// Number of known repositories.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries currently queued on the heap.
    pub fn queued_len(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }
}

/// Heap order: stale entries first, then entries whose last attempt did not
/// fail, then first-in first-out.
fn less(a: &Item, b: &Item) -> bool {
    if a.indexed != b.indexed {
        return !a.indexed;
    }
    let a_fail = a.state == Some(IndexState::Fail);
    let b_fail = b.state == Some(IndexState::Fail);
    if a_fail != b_fail {
        return !a_fail;
    }
    a.seq < b.seq
}

impl Inner {
    fn less_at(&self, i: usize, j: usize) -> bool {
        less(&self.items[&self.heap[i]], &self.items[&self.heap[j]])
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        for idx in [i, j] {
            let id = self.heap[idx];
            self.items
                .get_mut(&id)
                .expect("heap ids are always known")
                .heap_idx = idx as i32;
        }
    }

    fn push(&mut self, id: RepoId) {
        self.heap.push(id);
        let idx = self.heap.len() - 1;
        self.items
            .get_mut(&id)
            .expect("heap ids are always known")
            .heap_idx = idx as i32;
        self.sift_up(idx);
    }

    fn fix(&mut self, idx: usize) {
        self.sift_up(idx);
        self.sift_down(idx);
    }

    fn pop_min(&mut self) -> Option<RepoId> {
        if self.heap.is_empty() {
            return None;
        }
        Some(self.remove_at(0))
    }

    fn remove_at(&mut self, idx: usize) -> RepoId {
        let last = self.heap.len() - 1;
        self.swap(idx, last);
        let id = self.heap.pop().expect("heap is non-empty");
        self.items
            .get_mut(&id)
            .expect("heap ids are always known")
            .heap_idx = -1;
        if idx < self.heap.len() {
            self.fix(idx);
        }
        id
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if !self.less_at(idx, parent) {
                break;
            }
            self.swap(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        loop {
            let mut min = idx;
            for child in [2 * idx + 1, 2 * idx + 2] {
                if child < self.heap.len() && self.less_at(child, min) {
                    min = child;
                }
            }
            if min == idx {
                return;
            }
            self.swap(idx, min);
            idx = min;
        }
    }
}
