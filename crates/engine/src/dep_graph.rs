//! Dependency graph for formula cells.
//!
//! Tracks dependees (cells a formula references) and dependents (cells whose
//! formulas reference a given cell) for efficient queries in both directions.
//!
//! # Edge Direction
//!
//! ```text
//! A → B  means  "B's formula references A"  (A is a dependee of B)
//! ```
//!
//! This makes "what must be recomputed if A changes?" a walk over outgoing
//! edges.

use rustc_hash::{FxHashMap, FxHashSet};

/// Bidirectional adjacency over normalized cell names.
///
/// # Invariants
///
/// 1. **Bidirectional consistency:** `t ∈ dependents[s]` iff `s ∈ dependees[t]`.
/// 2. **No dangling entries:** empty sets are removed, not stored.
/// 3. **No duplicate edges:** set semantics enforced by `FxHashSet`.
///
/// Self-loops are representable here; cycle rejection is the recomputation
/// walk's job.
#[derive(Default, Debug, Clone)]
pub struct DepGraph {
    /// For each formula cell t, the cells its formula references.
    dependees: FxHashMap<String, FxHashSet<String>>,

    /// For each referenced cell s, the formula cells that reference it.
    dependents: FxHashMap<String, FxHashSet<String>>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cells whose formulas reference `s`.
    pub fn dependents_of<'a>(&'a self, s: &str) -> impl Iterator<Item = &'a str> {
        self.dependents
            .get(s)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Cells that `t`'s formula references.
    pub fn dependees_of<'a>(&'a self, t: &str) -> impl Iterator<Item = &'a str> {
        self.dependees
            .get(t)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    pub fn has_dependents(&self, s: &str) -> bool {
        self.dependents.contains_key(s)
    }

    pub fn has_dependees(&self, t: &str) -> bool {
        self.dependees.contains_key(t)
    }

    /// Record that `t`'s formula references `s`.
    pub fn add_dependency(&mut self, s: &str, t: &str) {
        self.dependents
            .entry(s.to_string())
            .or_default()
            .insert(t.to_string());
        self.dependees
            .entry(t.to_string())
            .or_default()
            .insert(s.to_string());
    }

    /// Remove the edge `s → t` if present.
    pub fn remove_dependency(&mut self, s: &str, t: &str) {
        if let Some(set) = self.dependents.get_mut(s) {
            set.remove(t);
            if set.is_empty() {
                self.dependents.remove(s);
            }
        }
        if let Some(set) = self.dependees.get_mut(t) {
            set.remove(s);
            if set.is_empty() {
                self.dependees.remove(t);
            }
        }
    }

    /// Replace all dependees of `t` atomically.
    ///
    /// This is the primary mutation API: it unlinks `t` from every current
    /// dependee's dependent set, then links the new set. Pass an empty set
    /// to clear `t` from the graph entirely.
    pub fn replace_dependees(&mut self, t: &str, new_dependees: FxHashSet<String>) {
        if let Some(old) = self.dependees.remove(t) {
            for s in old {
                if let Some(set) = self.dependents.get_mut(&s) {
                    set.remove(t);
                    if set.is_empty() {
                        self.dependents.remove(&s);
                    }
                }
            }
        }

        if new_dependees.is_empty() {
            return;
        }

        for s in &new_dependees {
            self.dependents
                .entry(s.clone())
                .or_default()
                .insert(t.to_string());
        }
        self.dependees.insert(t.to_string(), new_dependees);
    }

    /// Check all invariants. Panics if any are violated.
    #[cfg(test)]
    pub fn assert_consistent(&self) {
        for (t, dependees) in &self.dependees {
            for s in dependees {
                assert!(
                    self.dependents.get(s).is_some_and(|set| set.contains(t)),
                    "missing dependent edge: {} should list {}",
                    s,
                    t
                );
            }
        }

        for (s, dependents) in &self.dependents {
            for t in dependents {
                assert!(
                    self.dependees.get(t).is_some_and(|set| set.contains(s)),
                    "missing dependee edge: {} should list {}",
                    t,
                    s
                );
            }
        }

        for (t, set) in &self.dependees {
            assert!(!set.is_empty(), "empty dependee set stored for {}", t);
        }
        for (s, set) in &self.dependents {
            assert!(!set.is_empty(), "empty dependent set stored for {}", s);
        }
    }
}
