//! Surrogate key registries for one load session.
//!
//! A registry is filled from the rows the dimension loader has just written and is
//! dropped when the load finishes. It is never read back from the warehouse and must
//! not outlive the session that built it.

use std::borrow::Borrow;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

use thiserror::Error;

use crate::error::{LoadError, Result};
use crate::types::{DateKey, Dimension};

pub type SurrogateId = i32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no {dimension} surrogate registered for natural key {key}")]
pub struct Unresolved {
    pub dimension: Dimension,
    pub key: String,
}

/// Bidirectional natural key <-> surrogate id mapping for a single dimension.
#[derive(Debug, Clone)]
pub struct SurrogateKeyRegistry<K> {
    dimension: Dimension,
    ids: HashMap<K, SurrogateId>,
    keys: HashMap<SurrogateId, K>,
}

impl<K> SurrogateKeyRegistry<K>
where
    K: Eq + Hash + Clone + Display,
{
    pub fn new(dimension: Dimension) -> Self {
        Self::with_capacity(dimension, 0)
    }

    pub fn with_capacity(dimension: Dimension, capacity: usize) -> Self {
        Self {
            dimension,
            ids: HashMap::with_capacity(capacity),
            keys: HashMap::with_capacity(capacity),
        }
    }

    pub fn dimension(&self) -> Dimension {
        self.dimension
    }

    /// Record the surrogate id generated for `key`.
    ///
    /// Registering the same natural key twice means the dimension loader wrote it twice,
    /// which is reported as [`LoadError::DuplicateNaturalKey`]. An id already mapped to
    /// another key is [`LoadError::SurrogateIdReused`]; either way the registry is unchanged.
    pub fn register(&mut self, key: K, id: SurrogateId) -> Result<()> {
        if let Some(existing) = self.keys.get(&id) {
            if *existing != key {
                return Err(LoadError::SurrogateIdReused {
                    dimension: self.dimension,
                    id,
                    existing_key: existing.to_string(),
                    key: key.to_string(),
                });
            }
        }
        match self.ids.entry(key) {
            Entry::Occupied(entry) => Err(LoadError::DuplicateNaturalKey {
                dimension: self.dimension,
                key: entry.key().to_string(),
                existing: *entry.get(),
            }),
            Entry::Vacant(entry) => {
                self.keys.insert(id, entry.key().clone());
                entry.insert(id);
                Ok(())
            }
        }
    }

    pub fn resolve<Q>(&self, key: &Q) -> std::result::Result<SurrogateId, Unresolved>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Display + ?Sized,
    {
        self.ids.get(key).copied().ok_or_else(|| Unresolved {
            dimension: self.dimension,
            key: key.to_string(),
        })
    }

    pub fn natural_key(&self, id: SurrogateId) -> Option<&K> {
        self.keys.get(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// The pair of registries a fact load resolves against.
#[derive(Debug, Clone)]
pub struct Registries {
    pub dates: SurrogateKeyRegistry<DateKey>,
    pub stations: SurrogateKeyRegistry<String>,
}

impl Registries {
    pub fn new() -> Self {
        Self {
            dates: SurrogateKeyRegistry::new(Dimension::Date),
            stations: SurrogateKeyRegistry::new(Dimension::Station),
        }
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_resolve_both_directions() {
        let mut registry = SurrogateKeyRegistry::new(Dimension::Date);
        let key = DateKey::new(1, 1, 2020);
        registry.register(key, 7).unwrap();

        assert_eq!(registry.resolve(&key), Ok(7));
        assert_eq!(registry.natural_key(7), Some(&key));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = SurrogateKeyRegistry::new(Dimension::Station);
        registry.register("ST1".to_string(), 1).unwrap();

        let err = registry.register("ST1".to_string(), 2).unwrap_err();
        match err {
            LoadError::DuplicateNaturalKey {
                dimension,
                key,
                existing,
            } => {
                assert_eq!(dimension, Dimension::Station);
                assert_eq!(key, "ST1");
                assert_eq!(existing, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(registry.resolve("ST1"), Ok(1));
        assert_eq!(registry.natural_key(2), None);
    }

    #[test]
    fn surrogate_id_cannot_be_shared_by_two_keys() {
        let mut registry = SurrogateKeyRegistry::new(Dimension::Date);
        let first = DateKey::new(1, 1, 2020);
        let second = DateKey::new(2, 1, 2020);
        registry.register(first, 5).unwrap();

        let err = registry.register(second, 5).unwrap_err();
        assert!(matches!(
            err,
            LoadError::SurrogateIdReused { id: 5, ref existing_key, ref key, .. }
                if existing_key == "2020-01-01" && key == "2020-01-02"
        ));
        assert_eq!(registry.natural_key(5), Some(&first));
        assert!(registry.resolve(&second).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn resolving_unknown_key_reports_dimension_and_key() {
        let registry: SurrogateKeyRegistry<String> = SurrogateKeyRegistry::new(Dimension::Station);
        let err = registry.resolve("MISSING").unwrap_err();
        assert_eq!(err.dimension, Dimension::Station);
        assert_eq!(err.key, "MISSING");
        assert_eq!(
            err.to_string(),
            "no station surrogate registered for natural key MISSING"
        );
    }
}
