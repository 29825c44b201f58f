//! Orphaned session detection, reattach and kill
//!
//! An orphan is a multiplexer process the backend registry knows about
//! that has no session in the cache. The detector never edits the cache or
//! its own orphan list on the strength of an acknowledgement: reattached
//! sessions arrive through the reconciliation pass a successful reattach
//! requests, and killed sessions disappear on the next refresh.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use canon_utils::{CanonError, Result};

use crate::cache::Session;
use crate::sync::SyncHandle;

/// A registry-known process with no cached session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanedSession {
    pub registry_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Unix milliseconds the process was started, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
}

impl OrphanedSession {
    pub fn new(registry_name: impl Into<String>) -> Self {
        Self {
            registry_name: registry_name.into(),
            working_dir: None,
            created_at: None,
        }
    }
}

/// Outcome for one session in a bulk operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    pub name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Result of a reattach or kill
///
/// Failures are values, never errors: the caller shows `message` and the
/// per-item results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationReport {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, alias = "results")]
    pub items: Vec<ItemResult>,
}

impl OperationReport {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            items: Vec::new(),
        }
    }

    /// Whether the registry may have changed, bulk or per item
    pub fn any_succeeded(&self) -> bool {
        self.success || self.items.iter().any(|item| item.success)
    }

    pub fn failed_items(&self) -> impl Iterator<Item = &ItemResult> {
        self.items.iter().filter(|item| !item.success)
    }
}

/// Collaborator endpoints for orphan management
#[async_trait]
pub trait OrphanBackend: Send + Sync {
    async fn list_orphaned(&self) -> Result<Vec<OrphanedSession>>;

    async fn reattach(&self, names: &[String]) -> Result<OperationReport>;

    async fn kill(&self, names: &[String]) -> Result<OperationReport>;
}

#[async_trait]
impl<B: OrphanBackend + ?Sized> OrphanBackend for Arc<B> {
    async fn list_orphaned(&self) -> Result<Vec<OrphanedSession>> {
        (**self).list_orphaned().await
    }

    async fn reattach(&self, names: &[String]) -> Result<OperationReport> {
        (**self).reattach(names).await
    }

    async fn kill(&self, names: &[String]) -> Result<OperationReport> {
        (**self).kill(names).await
    }
}

#[derive(Debug, Deserialize)]
struct OrphanListResponse {
    #[serde(default = "default_true")]
    success: bool,
    #[serde(default)]
    message: String,
    #[serde(default, alias = "orphans")]
    sessions: Vec<OrphanedSession>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct NamesRequest<'a> {
    names: &'a [String],
}

/// Orphan endpoints over HTTP with JSON bodies
///
/// `GET {endpoint}/terminals/orphaned`, `POST {endpoint}/terminals/reattach`
/// and `POST {endpoint}/terminals/kill`.
#[derive(Debug, Clone)]
pub struct HttpOrphanBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpOrphanBackend {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let parsed = Url::parse(endpoint)
            .map_err(|e| CanonError::config(format!("Invalid orphan endpoint '{}': {}", endpoint, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CanonError::config(format!(
                "Orphan endpoint must be http or https: {}",
                endpoint
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CanonError::http(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: parsed.as_str().trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path)
    }

    async fn post_names(&self, path: &str, names: &[String]) -> Result<OperationReport> {
        let url = self.url(path);
        debug!(url = %url, count = names.len(), "Posting orphan operation");

        let response = self
            .client
            .post(&url)
            .json(&NamesRequest { names })
            .send()
            .await
            .map_err(|e| CanonError::http(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CanonError::http(format!("Failed to read response: {}", e)))?;

        match serde_json::from_str::<OperationReport>(&body) {
            Ok(report) => Ok(report),
            Err(_) if status.is_success() => Ok(OperationReport {
                success: true,
                message: body,
                items: Vec::new(),
            }),
            Err(_) => {
                warn!(status = %status, "Orphan endpoint returned error status");
                Ok(OperationReport::failure(format!("HTTP {}: {}", status, body)))
            }
        }
    }
}

#[async_trait]
impl OrphanBackend for HttpOrphanBackend {
    async fn list_orphaned(&self) -> Result<Vec<OrphanedSession>> {
        let url = self.url("terminals/orphaned");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CanonError::http(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CanonError::http(format!("HTTP {}: {}", status, text)));
        }

        let listing: OrphanListResponse = response
            .json()
            .await
            .map_err(|e| CanonError::http(format!("Malformed orphan list: {}", e)))?;
        if !listing.success {
            return Err(CanonError::http(listing.message));
        }
        Ok(listing.sessions)
    }

    async fn reattach(&self, names: &[String]) -> Result<OperationReport> {
        self.post_names("terminals/reattach", names).await
    }

    async fn kill(&self, names: &[String]) -> Result<OperationReport> {
        self.post_names("terminals/kill", names).await
    }
}

/// Orphan list with multi-select and bulk operations
pub struct OrphanDetector<B: OrphanBackend> {
    backend: B,
    orphans: Vec<OrphanedSession>,
    selected: BTreeSet<String>,
    resync: Option<SyncHandle>,
}

impl<B: OrphanBackend> OrphanDetector<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            orphans: Vec::new(),
            selected: BTreeSet::new(),
            resync: None,
        }
    }

    /// Ask this sync runtime for a fresh session list after every reattach
    /// that changed the registry
    pub fn with_resync(mut self, handle: SyncHandle) -> Self {
        self.resync = Some(handle);
        self
    }

    /// Re-query the backend
    ///
    /// Anything whose registry name is in `known` is not an orphan. The
    /// selection keeps only names still listed. On failure the previous
    /// list is kept.
    pub async fn refresh(&mut self, known: &HashSet<String>) -> Result<&[OrphanedSession]> {
        let listed = self.backend.list_orphaned().await?;
        Ok(self.apply_listing(listed, known))
    }

    /// Replace the orphan list with a registry listing fetched elsewhere
    pub fn apply_listing(
        &mut self,
        listed: Vec<OrphanedSession>,
        known: &HashSet<String>,
    ) -> &[OrphanedSession] {
        let mut seen = HashSet::new();
        self.orphans = listed
            .into_iter()
            .filter(|o| !o.registry_name.is_empty())
            .filter(|o| !known.contains(&o.registry_name))
            .filter(|o| seen.insert(o.registry_name.clone()))
            .collect();

        let listed: HashSet<&str> = self.orphans.iter().map(|o| o.registry_name.as_str()).collect();
        self.selected.retain(|name| listed.contains(name.as_str()));

        debug!("{} orphaned sessions", self.orphans.len());
        &self.orphans
    }

    /// Refresh against the registry names of `sessions`
    pub async fn refresh_for(&mut self, sessions: &[Session]) -> Result<&[OrphanedSession]> {
        let known = sessions.iter().map(|s| s.registry_name.clone()).collect();
        self.refresh(&known).await
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn orphans(&self) -> &[OrphanedSession] {
        &self.orphans
    }

    pub fn selected(&self) -> Vec<String> {
        self.selected.iter().cloned().collect()
    }

    pub fn is_selected(&self, name: &str) -> bool {
        self.selected.contains(name)
    }

    /// Flip one orphan's selection; unknown names are ignored
    pub fn toggle(&mut self, name: &str) -> bool {
        if !self.orphans.iter().any(|o| o.registry_name == name) {
            return false;
        }
        if !self.selected.remove(name) {
            self.selected.insert(name.to_string());
        }
        true
    }

    pub fn select_all(&mut self) {
        self.selected = self
            .orphans
            .iter()
            .map(|o| o.registry_name.clone())
            .collect();
    }

    pub fn clear_selection(&mut self) {
        self.selected.clear();
    }

    /// Reattach the selected orphans
    pub async fn reattach_selected(&mut self) -> OperationReport {
        let names = self.selected();
        self.reattach(&names).await
    }

    /// Kill the selected orphans
    ///
    /// The orphan list is left as is until the next refresh.
    pub async fn kill_selected(&mut self) -> OperationReport {
        let names = self.selected();
        self.kill(&names).await
    }

    pub async fn reattach(&self, names: &[String]) -> OperationReport {
        if names.is_empty() {
            return OperationReport::failure("No sessions selected");
        }
        info!("Reattaching {} orphaned sessions", names.len());
        let report = settle("Reattach", self.backend.reattach(names).await);
        if report.any_succeeded() {
            self.request_resync().await;
        }
        report
    }

    async fn request_resync(&self) {
        let Some(handle) = &self.resync else {
            return;
        };
        if let Err(e) = handle.resync().await {
            warn!("Could not request resync after reattach: {}", e);
        }
    }

    pub async fn kill(&self, names: &[String]) -> OperationReport {
        if names.is_empty() {
            return OperationReport::failure("No sessions selected");
        }
        info!("Killing {} orphaned sessions", names.len());
        settle("Kill", self.backend.kill(names).await)
    }
}

fn settle(operation: &str, result: Result<OperationReport>) -> OperationReport {
    match result {
        Ok(report) => {
            for item in report.failed_items() {
                warn!(
                    "{} of {} failed: {}",
                    operation,
                    item.name,
                    item.message.as_deref().unwrap_or("no message")
                );
            }
            report
        }
        Err(e) => {
            warn!("{} failed: {}", operation, e);
            OperationReport::failure(e.to_string())
        }
    }
}

/// Refresh orphans periodically and whenever the session list changes
///
/// The detector is locked only to apply a listing, never across the
/// request.
pub fn spawn_refresher<B>(
    detector: Arc<Mutex<OrphanDetector<B>>>,
    mut sessions: watch::Receiver<Vec<Session>>,
    interval: Duration,
) -> JoinHandle<()>
where
    B: OrphanBackend + Clone + 'static,
{
    tokio::spawn(async move {
        let backend = detector.lock().await.backend().clone();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = sessions.changed() => {
                    if changed.is_err() {
                        debug!("Session feed closed, stopping orphan refresher");
                        return;
                    }
                }
            }

            let known: HashSet<String> = sessions
                .borrow_and_update()
                .iter()
                .map(|s| s.registry_name.clone())
                .collect();
            match backend.list_orphaned().await {
                Ok(listed) => {
                    detector.lock().await.apply_listing(listed, &known);
                }
                Err(e) => warn!("Orphan refresh failed: {}", e),
            }
        }
    })
}
