//! Excluded folder prefixes.
//!
//! Rules live in a prefix tree keyed by path segment, so `is_excluded`
//! costs one hash lookup per segment of the candidate path no matter how
//! many rules exist. The crawler consults the rules to prune whole
//! subtrees; the evaluator re-checks them for records indexed before a
//! rule was added.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fnv::FnvHashMap;
use parking_lot::RwLock;

use crate::error::{IndexError, Result};
use crate::path::{normalize_path_for_compare, path_segments};

#[derive(Debug, Clone, Default)]
struct PrefixNode {
    terminal: bool,
    children: FnvHashMap<Box<str>, PrefixNode>,
}

/// An immutable-by-convention set of exclusion prefixes.
#[derive(Debug, Clone, Default)]
pub struct ExclusionRules {
    root: PrefixNode,
    prefixes: BTreeSet<String>,
}

impl ExclusionRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a rule set from prefixes, skipping invalid ones.
    pub fn from_prefixes<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Self::new();
        for prefix in prefixes {
            if let Err(error) = rules.add(prefix.as_ref()) {
                log::warn!("ignoring exclusion rule: {error}");
            }
        }
        rules
    }

    /// Adds a prefix. Returns false if it was already present.
    pub fn add(&mut self, prefix: &str) -> Result<bool> {
        let normalized = normalize_rule(prefix)?;
        if self.prefixes.contains(&normalized) {
            return Ok(false);
        }
        let mut node = &mut self.root;
        for segment in path_segments(&normalized) {
            node = node.children.entry(segment.into()).or_default();
        }
        node.terminal = true;
        self.prefixes.insert(normalized);
        Ok(true)
    }

    /// Removes a prefix. Returns false if it was not present.
    pub fn remove(&mut self, prefix: &str) -> bool {
        let Ok(normalized) = normalize_rule(prefix) else {
            return false;
        };
        if !self.prefixes.remove(&normalized) {
            return false;
        }
        let segments = path_segments(&normalized).collect::<Vec<_>>();
        unmark(&mut self.root, &segments);
        true
    }

    /// True if `path` or any of its ancestors is an excluded prefix.
    pub fn is_excluded(&self, path: &str) -> bool {
        let mut node = &self.root;
        if node.terminal {
            return true;
        }
        for segment in path_segments(path) {
            let Some(child) = node.children.get(segment) else {
                return false;
            };
            if child.terminal {
                return true;
            }
            node = child;
        }
        false
    }

    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.prefixes.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

/// Clears the terminal flag for `segments` and prunes empty branches.
/// Returns true if `node` became empty.
fn unmark(node: &mut PrefixNode, segments: &[&str]) -> bool {
    match segments.split_first() {
        None => node.terminal = false,
        Some((first, rest)) => {
            let prune = match node.children.get_mut(*first) {
                Some(child) => unmark(child, rest),
                None => false,
            };
            if prune {
                node.children.remove(*first);
            }
        }
    }
    !node.terminal && node.children.is_empty()
}

fn normalize_rule(prefix: &str) -> Result<String> {
    let trimmed = prefix.trim();
    if trimmed.is_empty() {
        return Err(IndexError::InvalidInput(
            "exclusion prefix must not be empty".to_string(),
        ));
    }
    let normalized = normalize_path_for_compare(trimmed);
    let absolute = normalized.starts_with('/')
        || path_segments(&normalized)
            .next()
            .is_some_and(|first| first.len() == 2 && first.ends_with(':'));
    if !absolute {
        return Err(IndexError::InvalidInput(format!(
            "exclusion prefix must be an absolute path: {prefix}"
        )));
    }
    Ok(normalized)
}

/// Process-wide, shareable exclusion rules.
///
/// Readers take an `Arc` snapshot; mutations swap in a new rule set, so an
/// evaluation that already holds a snapshot finishes under the old rules.
#[derive(Debug, Default)]
pub struct ExclusionSet {
    rules: RwLock<Arc<ExclusionRules>>,
    generation: AtomicU64,
}

impl ExclusionSet {
    pub fn new(rules: ExclusionRules) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
            generation: AtomicU64::new(0),
        }
    }

    /// Current rules.
    pub fn snapshot(&self) -> Arc<ExclusionRules> {
        self.rules.read().clone()
    }

    /// Bumped on every effective mutation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn add(&self, prefix: &str) -> Result<bool> {
        let mut guard = self.rules.write();
        let mut next = (**guard).clone();
        let added = next.add(prefix)?;
        if added {
            *guard = Arc::new(next);
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        Ok(added)
    }

    pub fn remove(&self, prefix: &str) -> bool {
        let mut guard = self.rules.write();
        let mut next = (**guard).clone();
        let removed = next.remove(prefix);
        if removed {
            *guard = Arc::new(next);
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.rules.read().is_excluded(path)
    }

    pub fn prefixes(&self) -> Vec<String> {
        self.snapshot().prefixes().map(ToString::to_string).collect()
    }
}
