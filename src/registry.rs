//! Target registry - per-enqueuer map from subscriptions to live resources.
//!
//! Targets arrive over a network boundary, so entries are keyed by a
//! normalized value (`TargetKey`) rather than by reference identity.

use std::collections::HashMap;
use std::fmt;

use crate::event::Target;

/// Normalized, comparable identity of a target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetKey(String);

impl TargetKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&Target> for TargetKey {
    fn from(target: &Target) -> Self {
        TargetKey(target.id.trim().to_string())
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors that can occur during registry operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Target '{0}' is already subscribed")]
    AlreadySubscribed(String),
}

/// A single subscription: target, its options, and the enqueuer-owned resource.
#[derive(Debug)]
pub struct RegistryEntry<O, R> {
    pub target: Target,
    pub options: O,
    pub resource: R,
}

/// Map of subscriptions owned by one enqueuer.
///
/// Holds at most one entry per distinct target. The caller serializes access
/// (each enqueuer wraps its registry in a mutex together with any secondary
/// indexes it maintains).
#[derive(Debug)]
pub struct TargetRegistry<O, R> {
    entries: HashMap<TargetKey, RegistryEntry<O, R>>,
}

impl<O, R> Default for TargetRegistry<O, R> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<O, R> TargetRegistry<O, R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail if the target already has an entry.
    ///
    /// Enqueuers call this before allocating a resource so a rejected
    /// subscribe never opens a watcher or timer.
    pub fn ensure_vacant(&self, target: &Target) -> Result<(), RegistryError> {
        let key = TargetKey::from(target);
        if self.entries.contains_key(&key) {
            return Err(RegistryError::AlreadySubscribed(key.0));
        }
        Ok(())
    }

    /// Add an entry for a target that has none yet.
    pub fn insert(&mut self, target: Target, options: O, resource: R) -> Result<TargetKey, RegistryError> {
        self.ensure_vacant(&target)?;
        let key = TargetKey::from(&target);
        self.entries.insert(
            key.clone(),
            RegistryEntry {
                target,
                options,
                resource,
            },
        );
        Ok(key)
    }

    /// Remove and return the entry for a target, if any.
    pub fn remove(&mut self, target: &Target) -> Option<RegistryEntry<O, R>> {
        self.entries.remove(&TargetKey::from(target))
    }

    pub fn get(&self, key: &TargetKey) -> Option<&RegistryEntry<O, R>> {
        self.entries.get(key)
    }

    pub fn contains(&self, target: &Target) -> bool {
        self.entries.contains_key(&TargetKey::from(target))
    }

    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry<O, R>> {
        self.entries.values()
    }

    /// Remove every entry, returning them for teardown.
    pub fn drain(&mut self) -> Vec<RegistryEntry<O, R>> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
