//! Allocator configuration.
//!
//! Toggles are read once when an allocator context is created and never
//! change afterwards. The process-wide heap reads them from the environment:
//! - `BLOCKHEAP_NOSCRUB_MALLOC`: do not fill fresh allocations with
//!   [`MALLOC_SCRUB_BYTE`].
//! - `BLOCKHEAP_NOSCRUB_FREE`: do not fill freed memory with
//!   [`FREE_SCRUB_BYTE`].
//! - `BLOCKHEAP_LOG_MALLOC`: record trace/debug lifecycle records.
//! - `BLOCKHEAP_PROFILE_MALLOC`: forward events to the profiler hook.
//! - `BLOCKHEAP_HOT_BLOCKS`, `BLOCKHEAP_COLD_BLOCKS`, `BLOCKHEAP_BIG_BLOCKS`:
//!   retention cache capacities.

use serde::Serialize;

use super::retention::{BIG_BLOCKS_PER_CLASS, COLD_BLOCKS_PER_CLASS, HOT_BLOCKS_PER_CLASS};

/// Fill byte for memory handed out by `malloc` when scrubbing is on.
pub const MALLOC_SCRUB_BYTE: u8 = 0xdc;
/// Fill byte for memory returned by `free` when scrubbing is on.
pub const FREE_SCRUB_BYTE: u8 = 0xed;

pub const ENV_NOSCRUB_MALLOC: &str = "BLOCKHEAP_NOSCRUB_MALLOC";
pub const ENV_NOSCRUB_FREE: &str = "BLOCKHEAP_NOSCRUB_FREE";
pub const ENV_LOG_MALLOC: &str = "BLOCKHEAP_LOG_MALLOC";
pub const ENV_PROFILE_MALLOC: &str = "BLOCKHEAP_PROFILE_MALLOC";
pub const ENV_HOT_BLOCKS: &str = "BLOCKHEAP_HOT_BLOCKS";
pub const ENV_COLD_BLOCKS: &str = "BLOCKHEAP_COLD_BLOCKS";
pub const ENV_BIG_BLOCKS: &str = "BLOCKHEAP_BIG_BLOCKS";

/// Runtime toggles and retention policy for one allocator context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MallocConfig {
    /// Fill newly allocated memory with [`MALLOC_SCRUB_BYTE`].
    pub scrub_on_alloc: bool,
    /// Fill freed memory with [`FREE_SCRUB_BYTE`].
    pub scrub_on_free: bool,
    /// Record trace/debug lifecycle records.
    pub log: bool,
    /// Forward allocation events to the profiler hook.
    pub notify_profiler: bool,
    pub hot_blocks_per_class: usize,
    pub cold_blocks_per_class: usize,
    pub big_blocks_per_class: usize,
}

impl Default for MallocConfig {
    fn default() -> Self {
        Self {
            scrub_on_alloc: true,
            scrub_on_free: true,
            log: false,
            notify_profiler: false,
            hot_blocks_per_class: HOT_BLOCKS_PER_CLASS,
            cold_blocks_per_class: COLD_BLOCKS_PER_CLASS,
            big_blocks_per_class: BIG_BLOCKS_PER_CLASS,
        }
    }
}

/// Parses a flag variable. Presence means on unless it spells a negative.
fn parse_flag(raw: &str) -> bool {
    !matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "off" | "no"
    )
}

fn parse_count(raw: &str, default: usize) -> usize {
    raw.trim().parse().unwrap_or(default)
}

impl MallocConfig {
    /// Reads the configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let flag = |key: &str| lookup(key).is_some_and(|raw| parse_flag(&raw));
        let count = |key: &str, default: usize| {
            lookup(key).map_or(default, |raw| parse_count(&raw, default))
        };
        Self {
            scrub_on_alloc: !flag(ENV_NOSCRUB_MALLOC),
            scrub_on_free: !flag(ENV_NOSCRUB_FREE),
            log: flag(ENV_LOG_MALLOC),
            notify_profiler: flag(ENV_PROFILE_MALLOC),
            hot_blocks_per_class: count(ENV_HOT_BLOCKS, defaults.hot_blocks_per_class),
            cold_blocks_per_class: count(ENV_COLD_BLOCKS, defaults.cold_blocks_per_class),
            big_blocks_per_class: count(ENV_BIG_BLOCKS, defaults.big_blocks_per_class),
        }
    }

    #[must_use]
    pub fn with_scrub_on_alloc(mut self, on: bool) -> Self {
        self.scrub_on_alloc = on;
        self
    }

    #[must_use]
    pub fn with_scrub_on_free(mut self, on: bool) -> Self {
        self.scrub_on_free = on;
        self
    }

    #[must_use]
    pub fn with_log(mut self, on: bool) -> Self {
        self.log = on;
        self
    }

    #[must_use]
    pub fn with_notify_profiler(mut self, on: bool) -> Self {
        self.notify_profiler = on;
        self
    }

    #[must_use]
    pub fn with_retention(mut self, hot: usize, cold: usize, big: usize) -> Self {
        self.hot_blocks_per_class = hot;
        self.cold_blocks_per_class = cold;
        self.big_blocks_per_class = big;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_scrub_but_do_not_log() {
        let config = MallocConfig::default();
        assert!(config.scrub_on_alloc);
        assert!(config.scrub_on_free);
        assert!(!config.log);
        assert!(!config.notify_profiler);
        assert_eq!(config.hot_blocks_per_class, 16);
        assert_eq!(config.cold_blocks_per_class, 16);
        assert_eq!(config.big_blocks_per_class, 8);
    }

    #[test]
    fn test_empty_environment_is_default() {
        assert_eq!(
            MallocConfig::from_lookup(|_| None),
            MallocConfig::default()
        );
    }

    #[test]
    fn test_flags_from_lookup() {
        let config = MallocConfig::from_lookup(lookup_from(&[
            (ENV_NOSCRUB_MALLOC, "1"),
            (ENV_NOSCRUB_FREE, ""),
            (ENV_LOG_MALLOC, "yes"),
            (ENV_PROFILE_MALLOC, "off"),
        ]));
        assert!(!config.scrub_on_alloc);
        assert!(!config.scrub_on_free);
        assert!(config.log);
        assert!(!config.notify_profiler);
    }

    #[test]
    fn test_counts_from_lookup_fall_back_on_garbage() {
        let config = MallocConfig::from_lookup(lookup_from(&[
            (ENV_HOT_BLOCKS, "4"),
            (ENV_COLD_BLOCKS, " 2 "),
            (ENV_BIG_BLOCKS, "many"),
        ]));
        assert_eq!(config.hot_blocks_per_class, 4);
        assert_eq!(config.cold_blocks_per_class, 2);
        assert_eq!(config.big_blocks_per_class, BIG_BLOCKS_PER_CLASS);
    }

    #[test]
    fn test_parse_flag_negatives() {
        for raw in ["0", "false", "OFF", " no "] {
            assert!(!parse_flag(raw), "{raw:?} should be off");
        }
        for raw in ["1", "true", "on", ""] {
            assert!(parse_flag(raw), "{raw:?} should be on");
        }
    }

    #[test]
    fn test_builders() {
        let config = MallocConfig::default()
            .with_scrub_on_alloc(false)
            .with_scrub_on_free(false)
            .with_log(true)
            .with_notify_profiler(true)
            .with_retention(1, 2, 3);
        assert!(!config.scrub_on_alloc && !config.scrub_on_free);
        assert!(config.log && config.notify_profiler);
        assert_eq!(
            (
                config.hot_blocks_per_class,
                config.cold_blocks_per_class,
                config.big_blocks_per_class
            ),
            (1, 2, 3)
        );
    }
}
