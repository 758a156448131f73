//! Per-transaction transformation cache.
//!
//! Two invariants make transformations cacheable: they are pure, and input
//! slices have stable identity within a transaction (every string value is a
//! [`SharedStr`], and cache entries pin a clone of their input so the
//! `(ptr, len)` key cannot be reused by a new allocation).
//!
//! A lookup has three outcomes: miss, hit with a cached output, or hit with
//! the "no change" bit set, meaning the transformation declined to rewrite
//! and the consumer should keep the original slice.

use crate::transform::TransformKind;
use crate::{SharedStr, StrIdentity};

use std::collections::HashMap;

/// Inputs shorter than this are not cached: hashing costs more than the win.
pub const CACHE_MIN_INPUT_LEN: usize = 32;

struct CacheEntry {
    /// Keeps the keyed allocation alive for the cache's lifetime.
    _input_pin: SharedStr,
    /// `None` records the "no change" outcome.
    output: Option<SharedStr>,
}

#[derive(Default)]
pub struct TransformCache {
    entries: HashMap<(TransformKind, StrIdentity), CacheEntry>,
}

impl TransformCache {
    /// Look up `(kind, input)`. `None` is a miss; `Some(None)` is a
    /// hit-no-change; `Some(Some(out))` is a hit with a cached output.
    pub fn lookup(&self, kind: TransformKind, input: &SharedStr) -> Option<Option<SharedStr>> {
        if input.len() < CACHE_MIN_INPUT_LEN {
            return None;
        }
        self.entries.get(&(kind, input.identity())).map(|entry| entry.output.clone())
    }

    pub fn store(&mut self, kind: TransformKind, input: SharedStr, output: Option<SharedStr>) {
        if input.len() < CACHE_MIN_INPUT_LEN {
            return;
        }
        let key = (kind, input.identity());
        self.entries.insert(key, CacheEntry { _input_pin: input, output });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long(text: &str) -> SharedStr {
        let mut s = String::from(text);
        while s.len() < CACHE_MIN_INPUT_LEN {
            s.push('_');
        }
        SharedStr::from(s)
    }

    #[test]
    fn cache_is_a_function_of_kind_and_identity() {
        let mut cache = TransformCache::default();
        let input = long("SOME INPUT");
        let output = SharedStr::from("some output");

        assert_eq!(cache.lookup(TransformKind::Lowercase, &input), None);
        cache.store(TransformKind::Lowercase, input.clone(), Some(output.clone()));

        // Same identity, same answer; repeated lookups agree.
        assert_eq!(cache.lookup(TransformKind::Lowercase, &input), Some(Some(output.clone())));
        assert_eq!(cache.lookup(TransformKind::Lowercase, &input), Some(Some(output)));

        // A different kind over the same input is a distinct key.
        assert_eq!(cache.lookup(TransformKind::Uppercase, &input), None);

        // Equal content, different allocation: a different identity.
        let twin = SharedStr::from(input.as_str());
        assert_eq!(cache.lookup(TransformKind::Lowercase, &twin), None);
    }

    #[test]
    fn no_change_bit_round_trips() {
        let mut cache = TransformCache::default();
        let input = long("already lowercase");
        cache.store(TransformKind::Lowercase, input.clone(), None);
        assert_eq!(cache.lookup(TransformKind::Lowercase, &input), Some(None));
    }

    #[test]
    fn short_inputs_bypass_the_cache() {
        let mut cache = TransformCache::default();
        let input = SharedStr::from("short");
        cache.store(TransformKind::Lowercase, input.clone(), Some("x".into()));
        assert_eq!(cache.lookup(TransformKind::Lowercase, &input), None);
        assert_eq!(cache.len(), 0);
    }
}
