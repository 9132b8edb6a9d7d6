//! Per-connection key/value storage.
use std::{any::Any, collections::HashMap, sync::Arc};

use parking_lot::RwLock;

type Value = Arc<dyn Any + Send + Sync>;

/// Values attached to one connection, shared between its handler calls.
///
/// Values are stored type-erased and retrieved by type: [`Session::get`] returns `None` if the
/// key is missing or holds a value of a different type.
///
/// ```rust
/// use wsengine::Session;
///
/// let session = Session::default();
/// session.insert("user_id", 42u64);
/// assert_eq!(session.get::<u64>("user_id").as_deref(), Some(&42));
/// assert!(session.get::<String>("user_id").is_none());
/// ```
#[derive(Default)]
pub struct Session {
    values: RwLock<HashMap<String, Value>>,
}

impl Session {
    /// Stores `value` under `key`, replacing any previous value.
    pub fn insert<T>(&self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.values.write().insert(key.into(), Arc::new(value));
    }

    /// Returns the value under `key` if it has type `T`.
    pub fn get<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let value = Arc::clone(self.values.read().get(key)?);
        value.downcast::<T>().ok()
    }

    /// Removes the value under `key`, returning whether there was one.
    pub fn remove(&self, key: &str) -> bool {
        self.values.write().remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    /// Snapshot of the stored keys, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.values.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("keys", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let session = Session::default();
        assert!(session.is_empty());

        session.insert("name", String::from("alice"));
        session.insert("visits", 3u32);

        assert_eq!(session.len(), 2);
        assert_eq!(session.get::<String>("name").unwrap().as_str(), "alice");
        assert_eq!(*session.get::<u32>("visits").unwrap(), 3);
        assert!(session.get::<u64>("visits").is_none());
        assert!(session.get::<u32>("missing").is_none());

        assert!(session.remove("name"));
        assert!(!session.remove("name"));
        assert!(!session.contains("name"));
        assert_eq!(session.keys(), vec![String::from("visits")]);
    }

    #[test]
    fn test_insert_replaces() {
        let session = Session::default();
        session.insert("k", 1i32);
        session.insert("k", "text");

        assert!(session.get::<i32>("k").is_none());
        assert_eq!(*session.get::<&str>("k").unwrap(), "text");
        assert_eq!(session.len(), 1);
    }
}
