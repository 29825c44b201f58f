//! Client-side session cache
//!
//! The cache is the UI's source of truth between connections: an ordered
//! list of sessions plus the current selection, persisted through a
//! [`KvStore`] on every mutation. Other components mutate UI-visible state
//! only through the methods here.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use canon_protocol::SessionStatus;
use canon_utils::{CanonError, Result};

use crate::store::KvStore;

const SESSIONS_KEY: &str = "sessions";
const CURRENT_KEY: &str = "current";

/// A terminal session as the client believes it exists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Namespaced identifier, unique within the cache
    pub id: String,
    /// User-visible name
    pub display_name: String,
    /// Multiplexer process identity used by the backend
    pub registry_name: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Opaque presentation profile reference
    pub profile_ref: String,
    pub status: SessionStatus,
    /// Unix milliseconds the session was last confirmed alive
    #[serde(default)]
    pub last_seen_at: u64,
    /// The display name was set locally and must not be overwritten remotely
    #[serde(default)]
    pub name_locked: bool,
    /// The profile was set locally and must not be overwritten remotely
    #[serde(default)]
    pub profile_locked: bool,
}

/// Pick the session to select after `removed` ids leave `order`
///
/// The session preceding the current one (in the original order) wins; if
/// nothing precedes it, the first survivor; if nothing survives, `None`.
pub fn adjacent_selection(
    order: &[String],
    removed: &HashSet<&str>,
    current: &str,
) -> Option<String> {
    let survives = |id: &&String| !removed.contains(id.as_str());

    let preceding = order
        .iter()
        .position(|id| id == current)
        .and_then(|idx| order[..idx].iter().rev().find(survives));

    preceding
        .or_else(|| order.iter().find(survives))
        .cloned()
}

/// Ordered, persisted session list with a current selection
pub struct SessionCache<S: KvStore> {
    store: S,
    sessions: Vec<Session>,
    current: Option<String>,
}

impl<S: KvStore> SessionCache<S> {
    /// Open the cache, loading whatever the store holds
    ///
    /// An unreadable store is logged and treated as empty so the client can
    /// always start.
    pub fn open(store: S) -> Self {
        let mut cache = Self {
            store,
            sessions: Vec::new(),
            current: None,
        };
        if let Err(e) = cache.load() {
            warn!("Session cache unreadable, starting empty: {}", e);
        }
        cache
    }

    /// Re-read sessions and selection from the store
    pub fn load(&mut self) -> Result<Vec<Session>> {
        let sessions: Vec<Session> = match self.store.get(SESSIONS_KEY)? {
            Some(value) => serde_json::from_value(value)?,
            None => Vec::new(),
        };
        let current: Option<String> = match self.store.get(CURRENT_KEY)? {
            Some(value) => serde_json::from_value(value)?,
            None => None,
        };

        self.sessions = dedup(sessions);
        self.current = current.filter(|id| self.contains(id));
        if self.current.is_none() {
            self.current = self.sessions.first().map(|s| s.id.clone());
        }

        debug!(
            "Loaded {} cached sessions, current={:?}",
            self.sessions.len(),
            self.current
        );
        Ok(self.sessions.clone())
    }

    /// Replace the whole session list
    ///
    /// The current selection is kept if it survives, otherwise re-derived
    /// with [`adjacent_selection`].
    pub fn persist(&mut self, sessions: Vec<Session>) -> Result<()> {
        let sessions = dedup(sessions);
        let current = self.current.as_deref().and_then(|current| {
            if sessions.iter().any(|s| s.id == current) {
                return Some(current.to_string());
            }
            let before = self.ids();
            let kept: HashSet<&str> = sessions.iter().map(|s| s.id.as_str()).collect();
            let removed: HashSet<&str> = before
                .iter()
                .map(String::as_str)
                .filter(|id| !kept.contains(id))
                .collect();
            let mut order = before.clone();
            order.extend(
                sessions
                    .iter()
                    .filter(|s| !before.contains(&s.id))
                    .map(|s| s.id.clone()),
            );
            adjacent_selection(&order, &removed, current)
        });
        let current = current.or_else(|| sessions.first().map(|s| s.id.clone()));
        self.commit(sessions, current)
    }

    /// Insert a session or replace the entry with the same id
    ///
    /// A different entry holding the same registry name is replaced in
    /// place, so each registry name maps to one session.
    pub fn upsert(&mut self, session: Session) -> Result<()> {
        let mut sessions = self.sessions.clone();
        let mut current = self.current.clone();

        if let Some(existing) = sessions.iter_mut().find(|s| s.id == session.id) {
            *existing = session;
        } else if let Some(existing) = sessions
            .iter_mut()
            .find(|s| s.registry_name == session.registry_name)
        {
            warn!(
                "Session {} replaces {} for registry name {}",
                session.id, existing.id, session.registry_name
            );
            if current.as_deref() == Some(existing.id.as_str()) {
                current = Some(session.id.clone());
            }
            *existing = session;
        } else {
            sessions.push(session);
        }

        if current.is_none() {
            current = sessions.first().map(|s| s.id.clone());
        }
        self.commit(sessions, current)
    }

    /// Remove a session, re-selecting if it was current
    pub fn remove(&mut self, id: &str) -> Result<Option<Session>> {
        let Some(idx) = self.sessions.iter().position(|s| s.id == id) else {
            return Ok(None);
        };

        let mut current = self.current.clone();
        if current.as_deref() == Some(id) {
            let removed: HashSet<&str> = [id].into_iter().collect();
            current = adjacent_selection(&self.ids(), &removed, id);
        }

        let mut sessions = self.sessions.clone();
        let session = sessions.remove(idx);
        self.commit(sessions, current)?;
        Ok(Some(session))
    }

    /// All sessions in list order
    pub fn all(&self) -> &[Session] {
        &self.sessions
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Currently selected session id
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Select a session
    pub fn select(&mut self, id: &str) -> Result<()> {
        if !self.contains(id) {
            return Err(CanonError::SessionNotFound(id.to_string()));
        }
        if self.current.as_deref() == Some(id) {
            return Ok(());
        }
        self.commit(self.sessions.clone(), Some(id.to_string()))
    }

    /// Rename a session locally
    ///
    /// The name is locked against remote overwrites from then on.
    pub fn rename(&mut self, id: &str, name: impl Into<String>) -> Result<()> {
        let mut sessions = self.sessions.clone();
        let session = sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| CanonError::SessionNotFound(id.to_string()))?;
        session.display_name = name.into();
        session.name_locked = true;
        self.commit(sessions, self.current.clone())
    }

    /// Write a new state through the store, then adopt it
    ///
    /// In-memory state only changes once the store accepted the write.
    pub(crate) fn commit(&mut self, sessions: Vec<Session>, current: Option<String>) -> Result<()> {
        let current = current.filter(|id| sessions.iter().any(|s| &s.id == id));
        self.store.put_all(vec![
            (SESSIONS_KEY.to_string(), serde_json::to_value(&sessions)?),
            (
                CURRENT_KEY.to_string(),
                current.clone().map(Value::String).unwrap_or(Value::Null),
            ),
        ])?;
        self.sessions = sessions;
        self.current = current;
        Ok(())
    }
}

/// Drop later entries that repeat an id or registry name
fn dedup(sessions: Vec<Session>) -> Vec<Session> {
    let mut ids = HashSet::new();
    let mut registry_names = HashSet::new();
    sessions
        .into_iter()
        .filter(|s| {
            let fresh = !ids.contains(&s.id) && !registry_names.contains(&s.registry_name);
            if fresh {
                ids.insert(s.id.clone());
                registry_names.insert(s.registry_name.clone());
            } else {
                warn!("Dropping duplicate cached session {}", s.id);
            }
            fresh
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::{FileStore, MemoryStore};
    use tempfile::tempdir;

    pub(crate) fn session(id: &str) -> Session {
        Session {
            id: id.to_string(),
            display_name: id.to_string(),
            registry_name: id.to_string(),
            working_dir: None,
            profile_ref: "shell".to_string(),
            status: SessionStatus::Active,
            last_seen_at: 0,
            name_locked: false,
            profile_locked: false,
        }
    }

    fn order(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_adjacent_selection_prefers_preceding() {
        let removed: HashSet<&str> = ["b"].into_iter().collect();
        assert_eq!(
            adjacent_selection(&order(&["a", "b", "c"]), &removed, "b"),
            Some("a".to_string())
        );
    }

    #[test]
    fn test_adjacent_selection_first_element_falls_to_next() {
        let removed: HashSet<&str> = ["a"].into_iter().collect();
        assert_eq!(
            adjacent_selection(&order(&["a", "b", "c"]), &removed, "a"),
            Some("b".to_string())
        );
    }

    #[test]
    fn test_adjacent_selection_skips_removed_neighbours() {
        let removed: HashSet<&str> = ["b", "c"].into_iter().collect();
        assert_eq!(
            adjacent_selection(&order(&["a", "b", "c", "d"]), &removed, "c"),
            Some("a".to_string())
        );
    }

    #[test]
    fn test_adjacent_selection_empty_result() {
        let removed: HashSet<&str> = ["a"].into_iter().collect();
        assert_eq!(adjacent_selection(&order(&["a"]), &removed, "a"), None);
    }

    #[test]
    fn test_upsert_selects_first_session() {
        let mut cache = SessionCache::open(MemoryStore::new());
        cache.upsert(session("canon-a")).unwrap();
        cache.upsert(session("canon-b")).unwrap();

        assert_eq!(cache.ids(), vec!["canon-a", "canon-b"]);
        assert_eq!(cache.current(), Some("canon-a"));
    }

    #[test]
    fn test_upsert_replaces_same_id_in_place() {
        let mut cache = SessionCache::open(MemoryStore::new());
        cache.upsert(session("canon-a")).unwrap();
        cache.upsert(session("canon-b")).unwrap();

        let mut updated = session("canon-a");
        updated.status = SessionStatus::Detached;
        cache.upsert(updated).unwrap();

        assert_eq!(cache.ids(), vec!["canon-a", "canon-b"]);
        assert_eq!(cache.get("canon-a").unwrap().status, SessionStatus::Detached);
    }

    #[test]
    fn test_upsert_keeps_one_session_per_registry_name() {
        let mut cache = SessionCache::open(MemoryStore::new());
        cache.upsert(session("canon-a")).unwrap();

        let mut other = session("canon-z");
        other.registry_name = "canon-a".to_string();
        cache.upsert(other).unwrap();

        assert_eq!(cache.ids(), vec!["canon-z"]);
        assert_eq!(cache.current(), Some("canon-z"));
    }

    #[test]
    fn test_remove_current_selects_preceding() {
        let mut cache = SessionCache::open(MemoryStore::new());
        for id in ["a", "b", "c"] {
            cache.upsert(session(id)).unwrap();
        }
        cache.select("b").unwrap();

        let removed = cache.remove("b").unwrap();
        assert_eq!(removed.unwrap().id, "b");
        assert_eq!(cache.current(), Some("a"));
    }

    #[test]
    fn test_remove_last_session_clears_selection() {
        let mut cache = SessionCache::open(MemoryStore::new());
        cache.upsert(session("a")).unwrap();

        cache.remove("a").unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.current(), None);
    }

    #[test]
    fn test_remove_non_current_keeps_selection() {
        let mut cache = SessionCache::open(MemoryStore::new());
        for id in ["a", "b", "c"] {
            cache.upsert(session(id)).unwrap();
        }
        cache.select("c").unwrap();

        cache.remove("a").unwrap();
        assert_eq!(cache.current(), Some("c"));
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let mut cache = SessionCache::open(MemoryStore::new());
        assert!(cache.remove("missing").unwrap().is_none());
    }

    #[test]
    fn test_rename_locks_name() {
        let mut cache = SessionCache::open(MemoryStore::new());
        cache.upsert(session("a")).unwrap();

        cache.rename("a", "Deploy").unwrap();
        let renamed = cache.get("a").unwrap();
        assert_eq!(renamed.display_name, "Deploy");
        assert!(renamed.name_locked);
    }

    #[test]
    fn test_rename_unknown_session() {
        let mut cache = SessionCache::open(MemoryStore::new());
        let err = cache.rename("nope", "x").unwrap_err();
        assert!(matches!(err, CanonError::SessionNotFound(_)));
    }

    #[test]
    fn test_select_unknown_session() {
        let mut cache = SessionCache::open(MemoryStore::new());
        assert!(cache.select("nope").is_err());
    }

    #[test]
    fn test_persist_reselects_adjacent() {
        let mut cache = SessionCache::open(MemoryStore::new());
        for id in ["a", "b", "c"] {
            cache.upsert(session(id)).unwrap();
        }
        cache.select("c").unwrap();

        cache.persist(vec![session("a"), session("b")]).unwrap();
        assert_eq!(cache.current(), Some("b"));
    }

    #[test]
    fn test_state_survives_reopen() {
        let store = MemoryStore::new();
        let mut cache = SessionCache::open(store.clone());
        cache.upsert(session("a")).unwrap();
        cache.upsert(session("b")).unwrap();
        cache.select("b").unwrap();
        cache.rename("a", "Logs").unwrap();
        drop(cache);

        let reopened = SessionCache::open(store);
        assert_eq!(reopened.ids(), vec!["a", "b"]);
        assert_eq!(reopened.current(), Some("b"));
        assert_eq!(reopened.get("a").unwrap().display_name, "Logs");
    }

    #[test]
    fn test_file_backed_cache_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.json");

        let mut cache = SessionCache::open(FileStore::open(&path).unwrap());
        cache.upsert(session("canon-a")).unwrap();
        drop(cache);

        let reopened = SessionCache::open(FileStore::open(&path).unwrap());
        assert_eq!(reopened.ids(), vec!["canon-a"]);
        assert_eq!(reopened.current(), Some("canon-a"));
    }

    #[test]
    fn test_corrupt_entries_start_empty() {
        let mut store = MemoryStore::new();
        store
            .put(SESSIONS_KEY, serde_json::json!([{"id": 1}]))
            .unwrap();

        let cache = SessionCache::open(store);
        assert!(cache.is_empty());
        assert_eq!(cache.current(), None);
    }

    #[test]
    fn test_load_drops_duplicate_entries() {
        let mut store = MemoryStore::new();
        let entries = vec![session("a"), session("a"), session("b")];
        store
            .put(SESSIONS_KEY, serde_json::to_value(&entries).unwrap())
            .unwrap();

        let cache = SessionCache::open(store);
        assert_eq!(cache.ids(), vec!["a", "b"]);
    }
}
