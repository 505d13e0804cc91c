//! Bounded retention caches for empty blocks and recycled big mappings.
//!
//! A cache remembers admission order. Reuse takes the freshest entry (most
//! recently admitted, most likely still cache-warm); overflow evicts the
//! oldest entry, which the caller then demotes or purges.

use std::collections::VecDeque;

/// Retained blocks per size class in the hot cache.
pub const HOT_BLOCKS_PER_CLASS: usize = 16;
/// Retained blocks per size class in the cold cache.
pub const COLD_BLOCKS_PER_CLASS: usize = 16;
/// Retained big mappings per big size class.
pub const BIG_BLOCKS_PER_CLASS: usize = 8;

/// Admission-ordered cache holding at most `capacity` entries.
#[derive(Debug, Clone)]
pub struct RetentionCache<T> {
    /// Oldest entry at the front, freshest at the back.
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> RetentionCache<T> {
    /// Creates a new empty cache with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Admits `item` as the freshest entry.
    ///
    /// Returns the evicted oldest entry when the cache was already full. With
    /// a capacity of zero the item itself comes straight back.
    #[must_use = "an evicted entry must be demoted or purged"]
    pub fn admit(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(item);
        }
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(item);
        evicted
    }

    /// Removes and returns the most recently admitted entry.
    pub fn take_freshest(&mut self) -> Option<T> {
        self.entries.pop_back()
    }

    /// Puts back an entry just returned by
    /// [`take_freshest`](Self::take_freshest), leaving admission order as it
    /// was before the take.
    pub fn restore_freshest(&mut self, item: T) {
        self.entries.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns true if admitting another entry would evict one.
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Drains every entry, oldest first.
    pub fn drain(&mut self) -> Vec<T> {
        self.entries.drain(..).collect()
    }
}
