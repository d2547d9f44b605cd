//! The call-stack cache.
//!
//! A fixed-capacity memo from a raw frame sequence to the backend and rule
//! previously matched against it, avoiding a full classifier pass on every
//! allocation from a call site already seen. Grounded on flexmalloc's
//! `cache-callstack.cxx`/`.hxx`: a small fixed-size table,
//! FIFO-evicted, with a frame-count ceiling above which a call stack is
//! simply never cached (and so always falls through to the classifier).

use parking_lot::Mutex;

use crate::header::BackendId;

pub const NUM_ENTRIES: usize = 64;
pub const CALLSTACKS_PER_ENTRY: usize = 32;

#[derive(Clone, Copy)]
struct Entry {
    frames: [u64; CALLSTACKS_PER_ENTRY],
    nframes: usize,
    backend: BackendId,
    rule_id: u32,
}

impl Entry {
    fn matches(&self, frames: &[u64]) -> bool {
        self.nframes == frames.len() && self.frames[..self.nframes] == frames[..]
    }
}

struct Slots {
    entries: Vec<Option<Entry>>,
    next: usize,
}

pub struct CallStackCache {
    slots: Mutex<Slots>,
    hits: std::sync::atomic::AtomicU64,
    misses: std::sync::atomic::AtomicU64,
    misses_too_long: std::sync::atomic::AtomicU64,
}

impl Default for CallStackCache {
    fn default() -> Self {
        CallStackCache {
            slots: Mutex::new(Slots {
                entries: vec![None; NUM_ENTRIES],
                next: 0,
            }),
            hits: std::sync::atomic::AtomicU64::new(0),
            misses: std::sync::atomic::AtomicU64::new(0),
            misses_too_long: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

impl CallStackCache {
    /// Looks up a previously remembered classification for this exact frame
    /// sequence. Stacks deeper than [`CALLSTACKS_PER_ENTRY`] are never
    /// cached and always miss here.
    pub fn lookup(&self, frames: &[u64]) -> Option<(BackendId, u32)> {
        if frames.len() > CALLSTACKS_PER_ENTRY {
            self.misses_too_long
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return None;
        }
        let slots = self.slots.lock();
        for entry in slots.entries.iter().flatten() {
            if entry.matches(frames) {
                self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Some((entry.backend, entry.rule_id));
            }
        }
        self.misses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        None
    }

    /// Remembers a classification, overwriting the oldest live entry
    /// (FIFO) once the table is full. Stacks over the per-entry frame
    /// ceiling are silently dropped: caching them would require a second,
    /// unbounded allocation inside the allocator's own hot path.
    pub fn remember(&self, frames: &[u64], backend: BackendId, rule_id: u32) {
        if frames.len() > CALLSTACKS_PER_ENTRY {
            return;
        }
        let mut buf = [0u64; CALLSTACKS_PER_ENTRY];
        buf[..frames.len()].copy_from_slice(frames);
        let entry = Entry {
            frames: buf,
            nframes: frames.len(),
            backend,
            rule_id,
        };
        let mut slots = self.slots.lock();
        let idx = slots.next;
        slots.entries[idx] = Some(entry);
        slots.next = (idx + 1) % NUM_ENTRIES;
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(std::sync::atomic::Ordering::Relaxed)
    }
    pub fn misses(&self) -> u64 {
        self.misses.load(std::sync::atomic::Ordering::Relaxed)
    }
    pub fn misses_too_long(&self) -> u64 {
        self.misses_too_long.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Fraction of lookups that hit, including too-long lookups which can
    /// never hit. This is the raw ratio an operator sees in aggregate.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits() + self.misses() + self.misses_too_long();
        if total == 0 {
            return 0.0;
        }
        self.hits() as f64 / total as f64
    }

    /// Hit ratio restricted to lookups that were even eligible to be
    /// cached, so a workload dominated by oversized call stacks doesn't
    /// make the cache look worse than it is at the depths it actually
    /// covers.
    pub fn normalized_hit_ratio(&self) -> f64 {
        let eligible = self.hits() + self.misses();
        if eligible == 0 {
            return 0.0;
        }
        self.hits() as f64 / eligible as f64
    }

    pub fn report(&self, out: &mut String) {
        use std::fmt::Write as _;
        let _ = writeln!(
            out,
            "Call-stack cache: {} hits, {} misses, {} too-long ({:.2}% hit ratio, {:.2}% normalized)",
            self.hits(),
            self.misses(),
            self.misses_too_long(),
            self.hit_ratio() * 100.0,
            self.normalized_hit_ratio() * 100.0
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remembered_stack_hits_on_next_lookup() {
        let cache = CallStackCache::default();
        let frames = [1u64, 2, 3];
        assert!(cache.lookup(&frames).is_none());
        cache.remember(&frames, 0, 5);
        assert_eq!(cache.lookup(&frames), Some((0, 5)));
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn oversized_stack_never_caches() {
        let cache = CallStackCache::default();
        let frames: Vec<u64> = (0..CALLSTACKS_PER_ENTRY as u64 + 1).collect();
        cache.remember(&frames, 0, 0);
        assert!(cache.lookup(&frames).is_none());
        assert_eq!(cache.misses_too_long(), 1);
    }

    #[test]
    fn fifo_eviction_drops_oldest_entry_first() {
        let cache = CallStackCache::default();
        for i in 0..NUM_ENTRIES as u64 {
            cache.remember(&[i], 0, i as u32);
        }
        assert!(cache.lookup(&[0]).is_some());
        cache.remember(&[999], 1, 1);
        assert!(cache.lookup(&[0]).is_none());
        assert!(cache.lookup(&[1]).is_some());
        assert!(cache.lookup(&[999]).is_some());
    }

    #[test]
    fn different_frame_sequences_do_not_collide() {
        let cache = CallStackCache::default();
        cache.remember(&[1, 2], 0, 1);
        cache.remember(&[1, 2, 3], 1, 2);
        assert_eq!(cache.lookup(&[1, 2]), Some((0, 1)));
        assert_eq!(cache.lookup(&[1, 2, 3]), Some((1, 2)));
    }
}
