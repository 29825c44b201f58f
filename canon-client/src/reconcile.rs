//! Reconciliation of remote session reports into the session cache
//!
//! The backend is authoritative for whether a session is alive; the cache
//! is authoritative for how it is presented. A report only removes cached
//! sessions when it is flagged complete; a partial report can add and
//! update but never shrink the cache.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use canon_protocol::{RemoteSession, SessionEntry, SessionStatus};
use canon_utils::Result;

use crate::cache::{adjacent_selection, Session, SessionCache};
use crate::namespace::{Namespace, DEFAULT_PROFILE};
use crate::store::KvStore;

/// A remote session report
#[derive(Debug, Clone, PartialEq)]
pub struct RecoverySnapshot {
    pub sessions: Vec<SessionEntry>,
    /// The report is complete and authoritative, so stale entries may go
    pub recovery_complete: bool,
    /// Unix milliseconds the report was received
    pub observed_at: u64,
}

impl RecoverySnapshot {
    pub fn new(sessions: Vec<SessionEntry>, recovery_complete: bool, observed_at: u64) -> Self {
        Self {
            sessions,
            recovery_complete,
            observed_at,
        }
    }

    /// Build a snapshot from well-formed remote sessions
    pub fn from_sessions(
        sessions: impl IntoIterator<Item = RemoteSession>,
        recovery_complete: bool,
        observed_at: u64,
    ) -> Self {
        Self::new(
            sessions.into_iter().map(SessionEntry::from).collect(),
            recovery_complete,
            observed_at,
        )
    }
}

/// What a reconciliation pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Sessions discovered remotely that were not cached, in report order
    pub added: Vec<String>,
    /// Cached sessions whose fields changed
    pub updated: Vec<String>,
    /// Cached sessions dropped by a complete report
    pub removed: Vec<String>,
    /// Entries skipped as malformed, foreign, or conflicting
    pub ignored: usize,
    pub selection_changed: bool,
}

impl ReconcileOutcome {
    /// Whether the pass left the cache untouched
    pub fn is_noop(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && !self.selection_changed
    }
}

/// Merges remote reports into the session cache
#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    namespace: Namespace,
}

impl ReconciliationEngine {
    pub fn new(namespace: Namespace) -> Self {
        Self { namespace }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Apply one report to the cache
    ///
    /// Errors only come from the store write; the cache is unchanged in
    /// that case.
    pub fn reconcile<S: KvStore>(
        &self,
        cache: &mut SessionCache<S>,
        snapshot: &RecoverySnapshot,
    ) -> Result<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();
        let before_ids = cache.ids();
        let mut sessions = cache.all().to_vec();
        let mut reported: HashSet<&str> = HashSet::new();

        // A complete report retires every cached id it omits, and those
        // holders release their registry names to the reported sessions.
        let survivors: Option<HashSet<&str>> = snapshot.recovery_complete.then(|| {
            snapshot
                .sessions
                .iter()
                .filter_map(SessionEntry::session)
                .map(|remote| remote.id.as_str())
                .collect()
        });

        for entry in &snapshot.sessions {
            let Some(remote) = entry.session() else {
                debug!("Ignoring malformed session entry");
                outcome.ignored += 1;
                continue;
            };
            if !self.namespace.owns(&remote.id) {
                debug!("Ignoring foreign session {}", remote.id);
                outcome.ignored += 1;
                continue;
            }
            if !reported.insert(remote.id.as_str()) {
                continue;
            }

            if let Some(existing) = sessions.iter_mut().find(|s| s.id == remote.id) {
                if refresh(existing, remote, snapshot.observed_at) {
                    outcome.updated.push(remote.id.clone());
                }
                continue;
            }

            let registry_name = remote.registry_name_or_id();
            let holder = sessions.iter().find(|s| {
                s.registry_name == registry_name
                    && survivors
                        .as_ref()
                        .map_or(true, |ids| ids.contains(s.id.as_str()))
            });
            if let Some(holder) = holder {
                warn!(
                    "Session {} reports registry name {} already held by {}",
                    remote.id, registry_name, holder.id
                );
                reported.remove(remote.id.as_str());
                outcome.ignored += 1;
                continue;
            }

            sessions.push(discover(&self.namespace, remote, snapshot.observed_at));
            outcome.added.push(remote.id.clone());
        }

        if snapshot.recovery_complete {
            sessions.retain(|s| {
                let stale = self.namespace.owns(&s.id) && !reported.contains(s.id.as_str());
                if stale {
                    outcome.removed.push(s.id.clone());
                }
                !stale
            });
        } else {
            debug!("Partial report, no sessions removed");
        }

        let current = self.next_selection(cache.current(), &before_ids, &outcome, &sessions);
        outcome.selection_changed = current.as_deref() != cache.current();

        if outcome.is_noop() {
            debug!("Reconciliation produced no changes");
            return Ok(outcome);
        }

        cache.commit(sessions, current)?;

        info!(
            added = outcome.added.len(),
            updated = outcome.updated.len(),
            removed = outcome.removed.len(),
            ignored = outcome.ignored,
            complete = snapshot.recovery_complete,
            "Reconciled session report"
        );
        Ok(outcome)
    }

    fn next_selection(
        &self,
        current: Option<&str>,
        before_ids: &[String],
        outcome: &ReconcileOutcome,
        sessions: &[Session],
    ) -> Option<String> {
        let first = || sessions.first().map(|s| s.id.clone());
        match current {
            Some(id) if sessions.iter().any(|s| s.id == id) => Some(id.to_string()),
            Some(id) => {
                let removed: HashSet<&str> = outcome.removed.iter().map(String::as_str).collect();
                let mut order = before_ids.to_vec();
                order.extend(outcome.added.iter().cloned());
                adjacent_selection(&order, &removed, id).or_else(first)
            }
            None => first(),
        }
    }
}

/// Build a cache entry for a session first seen remotely
///
/// Missing presentation fields are inferred from the id.
pub(crate) fn discover(namespace: &Namespace, remote: &RemoteSession, observed_at: u64) -> Session {
    let profile_ref = remote
        .profile_ref
        .clone()
        .or_else(|| namespace.infer_profile(&remote.id))
        .unwrap_or_else(|| DEFAULT_PROFILE.to_string());
    let display_name = remote
        .display_name
        .clone()
        .unwrap_or_else(|| namespace.infer_display_name(&remote.id));

    Session {
        id: remote.id.clone(),
        display_name,
        registry_name: remote.registry_name_or_id().to_string(),
        working_dir: remote.working_dir.clone(),
        profile_ref,
        status: remote.status.unwrap_or(SessionStatus::Active),
        last_seen_at: remote.last_seen_at.unwrap_or(observed_at),
        name_locked: false,
        profile_locked: false,
    }
}

/// Update liveness fields of a cached session from its remote entry
///
/// Presentation fields only follow the backend while they are not locked
/// locally. Returns whether anything changed.
pub(crate) fn refresh(existing: &mut Session, remote: &RemoteSession, observed_at: u64) -> bool {
    let before = existing.clone();

    existing.status = remote.status.unwrap_or(SessionStatus::Active);
    existing.last_seen_at = remote.last_seen_at.unwrap_or(observed_at);

    if !existing.name_locked {
        if let Some(name) = &remote.display_name {
            existing.display_name = name.clone();
        }
    }
    if !existing.profile_locked {
        if let Some(profile) = &remote.profile_ref {
            existing.profile_ref = profile.clone();
        }
    }
    if existing.working_dir.is_none() {
        existing.working_dir = remote.working_dir.clone();
    }

    *existing != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::session;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn engine() -> ReconciliationEngine {
        ReconciliationEngine::new(Namespace::new("canon-"))
    }

    fn cache_with(ids: &[&str]) -> SessionCache<MemoryStore> {
        let mut cache = SessionCache::open(MemoryStore::new());
        for id in ids {
            cache.upsert(session(id)).unwrap();
        }
        cache
    }

    fn report(ids: &[&str], complete: bool) -> RecoverySnapshot {
        RecoverySnapshot::from_sessions(ids.iter().map(|id| RemoteSession::new(*id)), complete, 100)
    }

    #[test]
    fn test_complete_report_removes_stale() {
        let mut cache = cache_with(&["canon-x", "canon-y"]);

        let outcome = engine()
            .reconcile(&mut cache, &report(&["canon-x"], true))
            .unwrap();

        assert_eq!(cache.ids(), vec!["canon-x"]);
        assert_eq!(outcome.removed, vec!["canon-y"]);
    }

    #[test]
    fn test_partial_report_never_removes() {
        let mut cache = cache_with(&["canon-x", "canon-y"]);

        let outcome = engine()
            .reconcile(&mut cache, &report(&["canon-z"], false))
            .unwrap();

        assert_eq!(cache.ids(), vec!["canon-x", "canon-y", "canon-z"]);
        assert!(outcome.removed.is_empty());
        assert_eq!(outcome.added, vec!["canon-z"]);
    }

    #[test]
    fn test_empty_partial_report_keeps_everything() {
        let mut cache = cache_with(&["canon-x", "canon-y"]);

        let outcome = engine().reconcile(&mut cache, &report(&[], false)).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(outcome.is_noop());
    }

    #[test]
    fn test_cold_start_adds_all_and_selects_first() {
        let mut cache = cache_with(&[]);

        let outcome = engine()
            .reconcile(&mut cache, &report(&["canon-x", "canon-y"], true))
            .unwrap();

        assert_eq!(cache.ids(), vec!["canon-x", "canon-y"]);
        assert_eq!(cache.current(), Some("canon-x"));
        assert_eq!(outcome.added, vec!["canon-x", "canon-y"]);
        assert!(outcome.selection_changed);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let mut cache = cache_with(&["canon-x"]);
        let snapshot = report(&["canon-x", "canon-y"], true);

        engine().reconcile(&mut cache, &snapshot).unwrap();
        let after_first = cache.all().to_vec();

        let second = engine().reconcile(&mut cache, &snapshot).unwrap();
        assert!(second.is_noop());
        assert_eq!(cache.all(), after_first.as_slice());
    }

    #[test]
    fn test_foreign_sessions_are_invisible() {
        let mut cache = cache_with(&["canon-x"]);

        let outcome = engine()
            .reconcile(&mut cache, &report(&["canon-x", "other-y"], true))
            .unwrap();

        assert_eq!(cache.ids(), vec!["canon-x"]);
        assert_eq!(outcome.ignored, 1);
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let mut cache = cache_with(&[]);
        let snapshot = RecoverySnapshot::new(
            vec![
                RemoteSession::new("canon-x").into(),
                SessionEntry::Malformed(json!({"displayName": "no id"})),
            ],
            true,
            100,
        );

        let outcome = engine().reconcile(&mut cache, &snapshot).unwrap();
        assert_eq!(cache.ids(), vec!["canon-x"]);
        assert_eq!(outcome.ignored, 1);
    }

    #[test]
    fn test_local_rename_survives() {
        let mut cache = cache_with(&["canon-shell-1"]);
        cache.rename("canon-shell-1", "Deploy").unwrap();

        let snapshot = RecoverySnapshot::from_sessions(
            [RemoteSession::new("canon-shell-1").with_display_name("Shell 1")],
            true,
            100,
        );
        engine().reconcile(&mut cache, &snapshot).unwrap();

        assert_eq!(cache.get("canon-shell-1").unwrap().display_name, "Deploy");
    }

    #[test]
    fn test_unlocked_name_follows_backend() {
        let mut cache = cache_with(&["canon-shell-1"]);

        let snapshot = RecoverySnapshot::from_sessions(
            [RemoteSession::new("canon-shell-1").with_display_name("Build")],
            true,
            100,
        );
        let outcome = engine().reconcile(&mut cache, &snapshot).unwrap();

        assert_eq!(cache.get("canon-shell-1").unwrap().display_name, "Build");
        assert_eq!(outcome.updated, vec!["canon-shell-1"]);
    }

    #[test]
    fn test_report_without_name_keeps_name() {
        let mut cache = cache_with(&["canon-shell-1"]);
        cache.rename("canon-shell-1", "Deploy").unwrap();

        engine()
            .reconcile(&mut cache, &report(&["canon-shell-1"], true))
            .unwrap();

        assert_eq!(cache.get("canon-shell-1").unwrap().display_name, "Deploy");
    }

    #[test]
    fn test_liveness_fields_update() {
        let mut cache = cache_with(&["canon-x"]);

        let snapshot = RecoverySnapshot::from_sessions(
            [RemoteSession::new("canon-x").with_status(SessionStatus::Detached)],
            false,
            500,
        );
        engine().reconcile(&mut cache, &snapshot).unwrap();

        let cached = cache.get("canon-x").unwrap();
        assert_eq!(cached.status, SessionStatus::Detached);
        assert_eq!(cached.last_seen_at, 500);
    }

    #[test]
    fn test_discovered_session_infers_defaults() {
        let mut cache = cache_with(&[]);

        engine()
            .reconcile(&mut cache, &report(&["canon-claude-9a1b"], true))
            .unwrap();

        let found = cache.get("canon-claude-9a1b").unwrap();
        assert_eq!(found.profile_ref, "claude");
        assert_eq!(found.display_name, "Claude 9a1b");
        assert!(!found.name_locked);
    }

    #[test]
    fn test_discovered_session_uses_supplied_metadata() {
        let mut cache = cache_with(&[]);
        let snapshot = RecoverySnapshot::from_sessions(
            [RemoteSession::new("canon-claude-9a1b")
                .with_display_name("Reviewer")
                .with_profile("opus")
                .with_registry_name("mux-12")
                .with_working_dir("/repo")],
            true,
            100,
        );

        engine().reconcile(&mut cache, &snapshot).unwrap();

        let found = cache.get("canon-claude-9a1b").unwrap();
        assert_eq!(found.display_name, "Reviewer");
        assert_eq!(found.profile_ref, "opus");
        assert_eq!(found.registry_name, "mux-12");
        assert_eq!(found.working_dir.as_deref(), Some("/repo"));
    }

    #[test]
    fn test_duplicate_report_entries_create_one_session() {
        let mut cache = cache_with(&[]);

        engine()
            .reconcile(&mut cache, &report(&["canon-x", "canon-x"], true))
            .unwrap();

        assert_eq!(cache.ids(), vec!["canon-x"]);
    }

    #[test]
    fn test_registry_name_conflict_is_ignored() {
        let mut cache = cache_with(&["canon-x"]);
        let snapshot = RecoverySnapshot::from_sessions(
            [
                RemoteSession::new("canon-x"),
                RemoteSession::new("canon-y").with_registry_name("canon-x"),
            ],
            true,
            100,
        );

        let outcome = engine().reconcile(&mut cache, &snapshot).unwrap();
        assert_eq!(cache.ids(), vec!["canon-x"]);
        assert_eq!(outcome.ignored, 1);
    }

    #[test]
    fn test_complete_report_hands_registry_name_to_new_id() {
        let mut cache = cache_with(&[]);
        let mut old = session("canon-shell-old");
        old.registry_name = "mux-1".into();
        cache.upsert(old).unwrap();

        let snapshot = RecoverySnapshot::from_sessions(
            [RemoteSession::new("canon-shell-new").with_registry_name("mux-1")],
            true,
            100,
        );

        let outcome = engine().reconcile(&mut cache, &snapshot).unwrap();
        assert_eq!(cache.ids(), vec!["canon-shell-new"]);
        assert_eq!(outcome.added, vec!["canon-shell-new"]);
        assert_eq!(outcome.removed, vec!["canon-shell-old"]);
        assert_eq!(outcome.ignored, 0);
        assert_eq!(cache.current(), Some("canon-shell-new"));

        // Same report again changes nothing
        let again = engine().reconcile(&mut cache, &snapshot).unwrap();
        assert!(again.is_noop());
        assert_eq!(cache.ids(), vec!["canon-shell-new"]);
    }

    #[test]
    fn test_partial_report_leaves_registry_name_with_holder() {
        let mut cache = cache_with(&[]);
        let mut old = session("canon-shell-old");
        old.registry_name = "mux-1".into();
        cache.upsert(old).unwrap();

        let snapshot = RecoverySnapshot::from_sessions(
            [RemoteSession::new("canon-shell-new").with_registry_name("mux-1")],
            false,
            100,
        );

        let outcome = engine().reconcile(&mut cache, &snapshot).unwrap();
        assert_eq!(cache.ids(), vec!["canon-shell-old"]);
        assert_eq!(outcome.ignored, 1);
    }

    #[test]
    fn test_removed_current_selects_preceding() {
        let mut cache = cache_with(&["canon-a", "canon-b", "canon-c"]);
        cache.select("canon-b").unwrap();

        engine()
            .reconcile(&mut cache, &report(&["canon-a", "canon-c"], true))
            .unwrap();

        assert_eq!(cache.current(), Some("canon-a"));
    }

    #[test]
    fn test_complete_empty_report_clears_selection() {
        let mut cache = cache_with(&["canon-a"]);

        engine().reconcile(&mut cache, &report(&[], true)).unwrap();

        assert!(cache.is_empty());
        assert_eq!(cache.current(), None);
    }

    #[test]
    fn test_foreign_cached_entry_survives_complete_report() {
        let mut cache = cache_with(&["canon-a", "legacy-b"]);

        engine()
            .reconcile(&mut cache, &report(&["canon-a"], true))
            .unwrap();

        assert_eq!(cache.ids(), vec!["canon-a", "legacy-b"]);
    }
}
