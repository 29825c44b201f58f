//! Orphan recovery against a fake registry that is also the session backend

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use canon_client::{
    resync_once, Backoff, ClientConfig, ConnectionManager, Connector, ItemResult, Link,
    ManualClock, MemoryAlarmScheduler, MemoryStore, OperationReport, OrphanBackend,
    OrphanDetector, OrphanedSession, SessionCache, SyncClient, SystemClock,
};
use canon_protocol::{ClientMessage, RemoteSession, ServerMessage};
use canon_utils::{CanonError, Result};

#[derive(Default)]
struct RegistryState {
    /// Registry names of every live process
    processes: Vec<String>,
    /// Sessions the backend reports
    attached: Vec<RemoteSession>,
}

#[derive(Clone, Default)]
struct Registry {
    state: Arc<Mutex<RegistryState>>,
}

impl Registry {
    fn with(processes: &[&str], attached: &[(&str, &str)]) -> Self {
        let registry = Self::default();
        {
            let mut state = registry.state.lock().unwrap();
            state.processes = processes.iter().map(|p| p.to_string()).collect();
            state.attached = attached
                .iter()
                .map(|(id, name)| RemoteSession::new(*id).with_registry_name(*name))
                .collect();
        }
        registry
    }

    fn snapshot(&self) -> ServerMessage {
        let state = self.state.lock().unwrap();
        ServerMessage::Terminals {
            sessions: state.attached.iter().cloned().map(Into::into).collect(),
            recovery_complete: true,
            connection_count: 1,
        }
    }
}

#[async_trait]
impl OrphanBackend for Registry {
    async fn list_orphaned(&self) -> Result<Vec<OrphanedSession>> {
        let state = self.state.lock().unwrap();
        let attached: HashSet<&str> = state
            .attached
            .iter()
            .map(|s| s.registry_name_or_id())
            .collect();
        Ok(state
            .processes
            .iter()
            .filter(|p| !attached.contains(p.as_str()))
            .map(|p| OrphanedSession::new(p.clone()))
            .collect())
    }

    async fn reattach(&self, names: &[String]) -> Result<OperationReport> {
        let mut state = self.state.lock().unwrap();
        let mut items = Vec::new();
        for name in names {
            let alive = state.processes.contains(name);
            if alive {
                let session = RemoteSession::new(format!("canon-shell-{}", name))
                    .with_registry_name(name.clone());
                state.attached.push(session);
            }
            items.push(ItemResult {
                name: name.clone(),
                success: alive,
                message: (!alive).then(|| "process not found".to_string()),
            });
        }
        Ok(OperationReport {
            success: items.iter().all(|item| item.success),
            message: String::new(),
            items,
        })
    }

    async fn kill(&self, names: &[String]) -> Result<OperationReport> {
        let mut state = self.state.lock().unwrap();
        state.processes.retain(|p| !names.contains(p));
        Ok(OperationReport {
            success: true,
            message: format!("killed {}", names.len()),
            items: Vec::new(),
        })
    }
}

#[async_trait]
impl Connector for Registry {
    async fn connect(&self) -> Result<Link> {
        let (client_tx, mut client_rx) = mpsc::channel(16);
        let (server_tx, server_rx) = mpsc::channel(16);
        let registry = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = client_rx.recv().await {
                if msg == ClientMessage::ListTerminals {
                    // Something unrelated arrives first
                    let _ = server_tx
                        .send(ServerMessage::ConnectionCount { count: 1 })
                        .await;
                    if server_tx.send(registry.snapshot()).await.is_err() {
                        break;
                    }
                }
            }
        });
        Ok(Link::from_channels(client_tx, server_rx))
    }
}

async fn resync(registry: &Registry, cache: &mut SessionCache<MemoryStore>) {
    resync_once(
        &ClientConfig::default(),
        cache,
        registry,
        &ManualClock::new(1_000),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
}

fn orphan_names(detector: &OrphanDetector<Registry>) -> Vec<String> {
    detector
        .orphans()
        .iter()
        .map(|o| o.registry_name.clone())
        .collect()
}

#[tokio::test]
async fn test_kill_then_refresh_shows_remaining_orphan() {
    let registry = Registry::with(&["main", "s1", "s2"], &[("canon-shell-main", "main")]);
    let mut cache = SessionCache::open(MemoryStore::new());
    resync(&registry, &mut cache).await;

    let mut detector = OrphanDetector::new(registry.clone());
    detector.refresh_for(cache.all()).await.unwrap();
    assert_eq!(orphan_names(&detector), vec!["s1", "s2"]);

    assert!(detector.toggle("s1"));
    let report = detector.kill_selected().await;
    assert!(report.success);

    // Nothing removed until the registry confirms it
    assert_eq!(orphan_names(&detector), vec!["s1", "s2"]);

    detector.refresh_for(cache.all()).await.unwrap();
    assert_eq!(orphan_names(&detector), vec!["s2"]);
    assert!(detector.selected().is_empty());
}

#[tokio::test]
async fn test_reattach_followed_by_resync_adopts_session() {
    let registry = Registry::with(&["main", "s2"], &[("canon-shell-main", "main")]);
    let mut cache = SessionCache::open(MemoryStore::new());
    resync(&registry, &mut cache).await;

    let mut detector = OrphanDetector::new(registry.clone());
    detector.refresh_for(cache.all()).await.unwrap();
    detector.select_all();

    let report = detector.reattach_selected().await;
    assert!(report.any_succeeded());
    resync(&registry, &mut cache).await;

    assert_eq!(
        cache.ids(),
        vec!["canon-shell-main".to_string(), "canon-shell-s2".to_string()]
    );
    detector.refresh_for(cache.all()).await.unwrap();
    assert!(detector.orphans().is_empty());
}

#[tokio::test]
async fn test_partial_reattach_reports_failed_items() {
    let registry = Registry::with(&["s1"], &[]);
    let detector = OrphanDetector::new(registry);

    let report = detector
        .reattach(&["s1".to_string(), "gone".to_string()])
        .await;

    assert!(!report.success);
    assert!(report.any_succeeded());
    let failed: Vec<&str> = report.failed_items().map(|i| i.name.as_str()).collect();
    assert_eq!(failed, vec!["gone"]);
}

#[tokio::test]
async fn test_empty_selection_is_a_failure_report() {
    let registry = Registry::with(&["s1"], &[]);
    let mut detector = OrphanDetector::new(registry.clone());
    detector.refresh(&HashSet::new()).await.unwrap();

    let report = detector.kill_selected().await;
    assert!(!report.success);
    assert!(!report.message.is_empty());
    assert_eq!(registry.state.lock().unwrap().processes, vec!["s1"]);
}

#[tokio::test]
async fn test_resync_times_out_without_a_report() {
    struct Silent;

    #[async_trait]
    impl Connector for Silent {
        async fn connect(&self) -> Result<Link> {
            let (tx, rx) = mpsc::channel(1);
            let (_keep, server_rx) = mpsc::channel(1);
            // The receiving end lives on so sends succeed
            tokio::spawn(async move {
                let _keep = _keep;
                let mut rx: mpsc::Receiver<ClientMessage> = rx;
                while rx.recv().await.is_some() {}
            });
            Ok(Link::from_channels(tx, server_rx))
        }
    }

    let mut cache = SessionCache::open(MemoryStore::new());
    let result = resync_once(
        &ClientConfig::default(),
        &mut cache,
        &Silent,
        &ManualClock::new(0),
        Duration::from_millis(50),
    )
    .await;

    assert!(matches!(result, Err(CanonError::ConnectionTimeout { .. })));
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_reattach_requests_resync_from_runtime() {
    let registry = Registry::with(&["main", "s2"], &[("canon-shell-main", "main")]);
    let manager = ConnectionManager::new(Backoff::default(), MemoryAlarmScheduler::new(), SystemClock);
    let (client, handle, _events) = SyncClient::new(
        &ClientConfig::default(),
        SessionCache::open(MemoryStore::new()),
        manager,
        registry.clone(),
    );
    let runtime = tokio::spawn(client.run());

    let mut sessions = handle.sessions();
    timeout(Duration::from_secs(5), sessions.wait_for(|s| s.len() == 1))
        .await
        .unwrap()
        .unwrap();

    let mut detector = OrphanDetector::new(registry.clone()).with_resync(handle.clone());
    let current = sessions.borrow().clone();
    detector.refresh_for(&current).await.unwrap();
    assert_eq!(orphan_names(&detector), vec!["s2"]);

    detector.select_all();
    assert!(detector.reattach_selected().await.success);

    // Only the runtime's own reconciliation pass can add the session
    let ids: Vec<String> = timeout(Duration::from_secs(5), sessions.wait_for(|s| s.len() == 2))
        .await
        .unwrap()
        .unwrap()
        .iter()
        .map(|s| s.id.clone())
        .collect();
    assert_eq!(ids, vec!["canon-shell-main", "canon-shell-s2"]);

    let current = sessions.borrow().clone();
    detector.refresh_for(&current).await.unwrap();
    assert!(detector.orphans().is_empty());

    handle.shutdown().await.unwrap();
    timeout(Duration::from_secs(5), runtime)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
