use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock, Weak};

/// A handle that may or may not still point at a live value.
pub(crate) trait WeakHandle {
    type Strong;
    fn upgrade(&self) -> Option<Self::Strong>;
}

impl<T> WeakHandle for Weak<T> {
    type Strong = Arc<T>;
    fn upgrade(&self) -> Option<Arc<T>> { Weak::upgrade(self) }
}

/// A weak-valued map. Entries whose value has been dropped are reaped
/// opportunistically on access; reaping is best-effort bookkeeping and emits
/// nothing beyond a trace line. Locks are held only for map operations, never
/// across calls into other code.
pub(crate) struct WeakCache<K: Hash + Eq, H> {
    map: RwLock<HashMap<K, H>>,
}

impl<K: Hash + Eq + Clone, H: WeakHandle> WeakCache<K, H> {
    pub fn new() -> Self { Self { map: RwLock::new(HashMap::new()) } }

    pub fn get(&self, key: &K) -> Option<H::Strong> {
        {
            let map = self.map.read().expect("weak cache lock");
            match map.get(key) {
                None => return None,
                Some(handle) => {
                    if let Some(strong) = handle.upgrade() {
                        return Some(strong);
                    }
                }
            }
        }
        // The entry is dead; finalize it.
        let mut map = self.map.write().expect("weak cache lock");
        if map.get(key).is_some_and(|h| h.upgrade().is_none()) {
            map.remove(key);
            tracing::trace!("weak cache entry finalized");
        }
        None
    }

    pub fn insert(&self, key: K, handle: H) { self.map.write().expect("weak cache lock").insert(key, handle); }

    pub fn remove(&self, key: &K) -> bool { self.map.write().expect("weak cache lock").remove(key).is_some() }

    /// Snapshot of all live entries; dead entries are reaped along the way.
    pub fn live(&self) -> Vec<(K, H::Strong)> {
        let mut map = self.map.write().expect("weak cache lock");
        let mut alive = Vec::with_capacity(map.len());
        map.retain(|key, handle| match handle.upgrade() {
            Some(strong) => {
                alive.push((key.clone(), strong));
                true
            }
            None => false,
        });
        alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_entries_are_reaped_on_access() {
        let cache: WeakCache<u32, Weak<String>> = WeakCache::new();
        let value = Arc::new("hello".to_string());
        cache.insert(1, Arc::downgrade(&value));

        assert_eq!(cache.get(&1).as_deref(), Some(&"hello".to_string()));
        drop(value);
        assert!(cache.get(&1).is_none());
        // Second lookup hits the reaped slot
        assert!(cache.get(&1).is_none());
    }

    #[test]
    fn live_prunes_and_snapshots() {
        let cache: WeakCache<u32, Weak<u32>> = WeakCache::new();
        let keep = Arc::new(7);
        let lose = Arc::new(9);
        cache.insert(1, Arc::downgrade(&keep));
        cache.insert(2, Arc::downgrade(&lose));
        drop(lose);

        let live = cache.live();
        assert_eq!(live.len(), 1);
        assert_eq!(*live[0].1, 7);
        assert!(!cache.remove(&2));
    }
}
