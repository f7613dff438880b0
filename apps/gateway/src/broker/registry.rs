//! Token-keyed session tables.
//!
//! Two registries exist per process, one for management sessions and one for
//! extension-host sessions, so the two kinds are disjoint keyspaces even for
//! the same token. Entries are created on first connect and only looked up
//! on `reconnection=true`.

use std::sync::Arc;

use dashmap::DashMap;

/// Shared registry of sessions of one kind.
///
/// Uses `DashMap` for shard-level concurrency; entries carry their own
/// interior mutability where they need it.
pub struct SessionRegistry<S> {
    sessions: DashMap<String, Arc<S>>,
}

impl<S> SessionRegistry<S> {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Insert a new session entry for `token`, replacing any stale one.
    pub fn register(&self, token: String, session: Arc<S>) {
        self.sessions.insert(token, session);
    }

    /// Look up (never create) the entry for `token`.
    pub fn lookup(&self, token: &str) -> Option<Arc<S>> {
        self.sessions.get(token).map(|entry| entry.value().clone())
    }

    /// Drop the entry for `token`, returning it if present.
    pub fn remove(&self, token: &str) -> Option<Arc<S>> {
        self.sessions.remove(token).map(|(_, session)| session)
    }

    /// Visit every live entry.
    pub fn for_each(&self, mut f: impl FnMut(&str, &Arc<S>)) {
        for entry in self.sessions.iter() {
            f(entry.key(), entry.value());
        }
    }

    /// Keep only entries the predicate approves; returns how many were
    /// dropped.
    pub fn retain(&self, mut keep: impl FnMut(&str, &Arc<S>) -> bool) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|token, session| keep(token, session));
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fake {
        name: &'static str,
    }

    #[test]
    fn register_lookup_remove() {
        let registry = SessionRegistry::new();
        registry.register("t1".to_string(), Arc::new(Fake { name: "a" }));
        assert_eq!(registry.lookup("t1").unwrap().name, "a");
        assert!(registry.lookup("t2").is_none());
        assert_eq!(registry.remove("t1").unwrap().name, "a");
        assert!(registry.lookup("t1").is_none());
    }

    #[test]
    fn kinds_are_independent_tables() {
        // The same token in two registries never aliases.
        let mgmt: SessionRegistry<Fake> = SessionRegistry::new();
        let ext: SessionRegistry<Fake> = SessionRegistry::new();
        mgmt.register("tok".to_string(), Arc::new(Fake { name: "mgmt" }));
        assert!(ext.lookup("tok").is_none());
        ext.register("tok".to_string(), Arc::new(Fake { name: "ext" }));
        assert_eq!(mgmt.lookup("tok").unwrap().name, "mgmt");
        assert_eq!(ext.lookup("tok").unwrap().name, "ext");
        mgmt.remove("tok");
        assert!(ext.lookup("tok").is_some());
    }

    #[test]
    fn retain_reports_dropped_count() {
        let registry = SessionRegistry::new();
        registry.register("a".to_string(), Arc::new(Fake { name: "a" }));
        registry.register("b".to_string(), Arc::new(Fake { name: "b" }));
        let dropped = registry.retain(|token, _| token == "a");
        assert_eq!(dropped, 1);
        assert_eq!(registry.len(), 1);
    }
}
