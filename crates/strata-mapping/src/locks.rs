//! Striped per-key locks.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

use strata_types::ObjectKey;

use crate::error::{MappingResult, MappingStoreError};

const STRIPES: usize = 256;

/// A fixed set of mutexes; each object key maps to one stripe.
///
/// Two keys may share a stripe. A thread never holds more than one stripe at
/// a time.
pub(crate) struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    pub(crate) fn new() -> Self {
        Self {
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub(crate) fn lock(&self, key: &ObjectKey) -> MappingResult<MutexGuard<'_, ()>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[idx]
            .lock()
            .map_err(|_| MappingStoreError::Unavailable("key lock poisoned".into()))
    }
}
