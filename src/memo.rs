//! Identity memoization for change recipes.
//!
//! When a change is recomputed against a new base, the same logical binding
//! must resolve to the same identifier it resolved to the first time around,
//! instead of minting a fresh one. A [`Memoizer`] keeps those bindings
//! across recomputation rounds, tagged with the epoch of the round that
//! last touched them.

use std::{collections::HashMap, fmt::Debug, hash::Hash};

/// A unique key was bound twice within the same epoch.
///
/// This is a programmer-error signal: it means a recipe re-derived two
/// different bindings under one key in a single run, which would make
/// recomputation nondeterministic.
#[derive(Debug, thiserror::Error)]
#[error("duplicate binding for unique key {key:?} within one epoch")]
pub struct DuplicateKey {
    /// The offending key, rendered for diagnostics.
    pub key: String,
}

/// Maps a caller-supplied key to a stable value across recomputation rounds.
#[derive(Debug, Clone)]
pub struct Memoizer<K, V> {
    entries: HashMap<K, (V, u64)>,
    epoch: u64,
}

impl<K, V> Default for Memoizer<K, V> {
    fn default() -> Self {
        Memoizer {
            entries: HashMap::new(),
            epoch: 0,
        }
    }
}

impl<K, V> Memoizer<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    /// Create an empty memoizer at epoch zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance to the next epoch.
    ///
    /// Call once per top-level change attempt, before running the recipe.
    pub fn next_epoch(&mut self) {
        self.epoch += 1;
    }

    /// The current epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Resolve `key` to a value, computing it on first use.
    ///
    /// A repeated lookup within the same epoch fails with [`DuplicateKey`]
    /// when `unique` is set; otherwise, and for lookups in later epochs,
    /// the memoized value is returned and its epoch tag refreshed.
    pub fn memo(
        &mut self,
        unique: bool,
        key: K,
        compute: impl FnOnce() -> V,
    ) -> Result<V, DuplicateKey> {
        if let Some((value, seen)) = self.entries.get_mut(&key) {
            if unique && *seen == self.epoch {
                return Err(DuplicateKey {
                    key: format!("{key:?}"),
                });
            }
            *seen = self.epoch;
            return Ok(value.clone());
        }
        let value = compute();
        self.entries.insert(key, (value.clone(), self.epoch));
        Ok(value)
    }

    /// Number of memoized bindings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been memoized yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
