//! Bounded LRU cache of recently seen packet ids.
//!
//! Duplicate suppression is what keeps a dense mesh from echoing the same
//! SOS around forever, so `check_and_mark` must be atomic: two concurrent
//! receives of the same id must resolve to exactly one "new".

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Verdict from [`SeenCache::check_and_mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seen {
    New,
    AlreadySeen,
}

struct LruState {
    /// id → most recent touch sequence
    entries: HashMap<String, u64>,
    /// touch log, front = oldest; entries whose seq no longer matches
    /// `entries` are stale and skipped during eviction
    queue: VecDeque<(u64, String)>,
    next_seq: u64,
}

/// Thread-safe bounded LRU over packet ids.
pub struct SeenCache {
    state: Mutex<LruState>,
    capacity: usize,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LruState {
                entries: HashMap::with_capacity(capacity),
                queue: VecDeque::with_capacity(capacity),
                next_seq: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Atomically record `id` and report whether it was already present.
    /// A repeat touch refreshes the id's recency.
    pub fn check_and_mark(&self, id: &str) -> Seen {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let seen = if state.entries.contains_key(id) {
            Seen::AlreadySeen
        } else {
            Seen::New
        };
        Self::touch(&mut state, id);
        self.evict(&mut state);
        seen
    }

    /// Record `id` without caring whether it was present.
    pub fn mark(&self, id: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::touch(&mut state, id);
        self.evict(&mut state);
    }

    pub fn contains(&self, id: &str) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn touch(state: &mut LruState, id: &str) {
        state.next_seq += 1;
        let seq = state.next_seq;
        state.entries.insert(id.to_string(), seq);
        state.queue.push_back((seq, id.to_string()));
    }

    /// Evict least-recently-touched ids past capacity. Stale queue entries
    /// (superseded by a later touch) are discarded as they surface, which
    /// keeps every operation O(1) amortized.
    fn evict(&self, state: &mut LruState) {
        while state.entries.len() > self.capacity || state.queue.len() > self.capacity * 2 {
            let Some((seq, id)) = state.queue.pop_front() else {
                break;
            };
            if state.entries.get(&id) == Some(&seq) && state.entries.len() > self.capacity {
                state.entries.remove(&id);
            }
        }
    }
}
