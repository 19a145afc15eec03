//! Schema registry: databases, tables, variables and cached rows.
//!
//! Every entity is a cheap, cloneable handle. Two handles compare equal only
//! when they refer to the same instance. Parents keep their *loaded* children
//! in a [`Registry`]; unloaded handles live only as long as callers hold them.
//!
//! Lifecycle rules shared by all entities:
//! - `start` fails if already loaded or if the parent is not loaded, performs
//!   the idempotent backend step, registers, then flips `loaded`.
//! - `stop` fails if not loaded, stops loaded children first, unregisters, then
//!   clears `loaded`.

pub mod database;
pub mod row;
pub mod table;
pub mod variable;

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use parking_lot::Mutex;

use crate::error::{Error, Result};

pub use database::Database;
pub use row::Row;
pub use table::Table;
pub use variable::Variable;

/// Longest accepted identifier.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Check a database, table or variable name against `^[A-Za-z0-9_]{1,63}$`.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_name(name, "must not be empty"));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::invalid_name(
            name,
            format!("longer than {MAX_IDENTIFIER_LEN} characters"),
        ));
    }
    if let Some(c) = name.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '_')) {
        return Err(Error::invalid_name(name, format!("contains '{c}'")));
    }
    Ok(())
}

/// A set of loaded children keyed by identity, behind one lock.
pub(crate) struct Registry<K, V> {
    kind: &'static str,
    entries: Mutex<HashMap<K, V>>,
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone + fmt::Display,
    V: Clone + PartialEq,
{
    pub(crate) fn new(kind: &'static str) -> Self {
        Self { kind, entries: Mutex::new(HashMap::new()) }
    }

    /// Register `value`. A key already present is a precondition failure.
    pub(crate) fn insert(&self, key: K, value: V) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return Err(Error::state(format!("{} '{key}' is already loaded", self.kind)));
        }
        entries.insert(key, value);
        Ok(())
    }

    pub(crate) fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.lock().get(key).cloned()
    }

    #[cfg(test)]
    pub(crate) fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.lock().contains_key(key)
    }

    /// Unregister `key` only if it still maps to `value`.
    pub(crate) fn remove<Q>(&self, key: &Q, value: &V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut entries = self.entries.lock();
        if entries.get(key) == Some(value) {
            entries.remove(key);
            true
        } else {
            false
        }
    }

    /// Snapshot of the registered values.
    pub(crate) fn values(&self) -> Vec<V> {
        self.entries.lock().values().cloned().collect()
    }

    /// Snapshot of the registered keys.
    pub(crate) fn keys(&self) -> Vec<K> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Remove and return everything.
    pub(crate) fn drain(&self) -> Vec<V> {
        self.entries.lock().drain().map(|(_, v)| v).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_rules() {
        assert!(validate_identifier("player_stats_2").is_ok());
        assert!(validate_identifier(&"a".repeat(63)).is_ok());
        assert!(validate_identifier(&"a".repeat(64)).is_err());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("drop table").is_err());
        assert!(validate_identifier("naïve").is_err());

        let err = validate_identifier("a-b").unwrap_err();
        assert_eq!(err.to_string(), "Invalid name 'a-b': contains '-'");
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let registry: Registry<String, u32> = Registry::new("table");
        registry.insert("a".to_string(), 1).unwrap();

        let err = registry.insert("a".to_string(), 2).unwrap_err();
        assert!(err.is_state());
        assert_eq!(registry.get("a"), Some(1));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_remove_checks_identity() {
        let registry: Registry<String, u32> = Registry::new("table");
        registry.insert("a".to_string(), 1).unwrap();

        assert!(!registry.remove("a", &2));
        assert!(registry.contains("a"));
        assert!(registry.remove("a", &1));
        assert!(!registry.contains("a"));
    }

    #[test]
    fn test_registry_drain() {
        let registry: Registry<u32, u32> = Registry::new("row");
        registry.insert(1, 10).unwrap();
        registry.insert(2, 20).unwrap();

        let mut drained = registry.drain();
        drained.sort_unstable();
        assert_eq!(drained, vec![10, 20]);
        assert!(registry.keys().is_empty());
    }
}
