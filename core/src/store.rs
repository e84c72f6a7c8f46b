//! Pluggable persistence for access, refresh and download tokens.
//!
//! # Design
//! When a store is attached it is the source of truth for reads; the
//! dispatcher still keeps an in-memory copy and every write goes to both.
//! The three tokens are written with independent `set` calls, so a crash
//! between them can leave the store partially populated.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Whether the store can be read right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreInit {
    Ready,
    /// The store loads asynchronously; the host calls
    /// `Dispatcher::store_ready` once it has.
    Deferred,
}

/// Key/value contract for token persistence.
pub trait TokenStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str);
    fn cut(&mut self, key: &str);

    fn init(&mut self) -> StoreInit {
        StoreInit::Ready
    }

    /// Told which keys the dispatcher owns so a cache clean can drop them.
    fn register_owned_keys(&mut self, _keys: &[String]) {}
}

/// A recorded store mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Set(String, String),
    Cut(String),
}

#[derive(Debug, Default)]
struct Inner {
    values: HashMap<String, String>,
    ops: Vec<StoreOp>,
    owned_keys: Vec<String>,
    deferred: bool,
}

/// In-memory store. Clones share the same backing map, so a host can keep a
/// handle to inspect what the dispatcher wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryTokenStore {
    inner: Rc<RefCell<Inner>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that reports `StoreInit::Deferred` from `init`.
    pub fn deferred() -> Self {
        let store = Self::default();
        store.inner.borrow_mut().deferred = true;
        store
    }

    /// Seed a value without recording an operation.
    pub fn with_value(self, key: &str, value: &str) -> Self {
        self.inner
            .borrow_mut()
            .values
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.inner.borrow().values.get(key).cloned()
    }

    pub fn ops(&self) -> Vec<StoreOp> {
        self.inner.borrow().ops.clone()
    }

    pub fn owned_keys(&self) -> Vec<String> {
        self.inner.borrow().owned_keys.clone()
    }

    /// Drop every key registered as owned, as a cache clean would.
    pub fn clean(&self) {
        let mut inner = self.inner.borrow_mut();
        let keys = inner.owned_keys.clone();
        for key in keys {
            inner.values.remove(&key);
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, key: &str) -> Option<String> {
        self.inner.borrow().values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        let mut inner = self.inner.borrow_mut();
        inner.values.insert(key.to_string(), value.to_string());
        inner.ops.push(StoreOp::Set(key.to_string(), value.to_string()));
    }

    fn cut(&mut self, key: &str) {
        let mut inner = self.inner.borrow_mut();
        inner.values.remove(key);
        inner.ops.push(StoreOp::Cut(key.to_string()));
    }

    fn init(&mut self) -> StoreInit {
        if self.inner.borrow().deferred {
            StoreInit::Deferred
        } else {
            StoreInit::Ready
        }
    }

    fn register_owned_keys(&mut self, keys: &[String]) {
        self.inner.borrow_mut().owned_keys = keys.to_vec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let store = MemoryTokenStore::new();
        let mut handle = store.clone();
        handle.set("AuthAccessToken", "abc");
        assert_eq!(store.value("AuthAccessToken").as_deref(), Some("abc"));
        assert_eq!(
            store.ops(),
            vec![StoreOp::Set("AuthAccessToken".to_string(), "abc".to_string())]
        );
    }

    #[test]
    fn clean_drops_only_owned_keys() {
        let mut store = MemoryTokenStore::new().with_value("other", "1");
        store.set("AuthAccessToken", "abc");
        store.register_owned_keys(&["AuthAccessToken".to_string()]);
        store.clean();
        assert!(store.value("AuthAccessToken").is_none());
        assert_eq!(store.value("other").as_deref(), Some("1"));
    }

    #[test]
    fn deferred_store_reports_deferred_init() {
        assert_eq!(MemoryTokenStore::deferred().init(), StoreInit::Deferred);
        assert_eq!(MemoryTokenStore::new().init(), StoreInit::Ready);
    }
}
