//! Session types shared between the backend registry and clients

use serde::{Deserialize, Deserializer, Serialize};

/// Liveness status of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Spawn requested or attach in progress
    Connecting,
    /// Process alive and attached
    #[default]
    Active,
    /// Process alive, no client attached
    Detached,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Active => "active",
            SessionStatus::Detached => "detached",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A session as reported by the backend registry
///
/// Only `id` is required. Everything else is metadata the backend may or
/// may not know; missing presentation fields are inferred client-side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSession {
    /// Namespaced session identifier
    pub id: String,
    /// Multiplexer process identity used by the registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_name: Option<String>,
    /// Explicit display name, if the backend has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Explicit profile reference, if the backend has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Reported liveness. Unrecognized values decode as `None`.
    #[serde(
        default,
        deserialize_with = "lenient_status",
        skip_serializing_if = "Option::is_none"
    )]
    pub status: Option<SessionStatus>,
    /// Unix milliseconds the registry last saw the process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<u64>,
}

impl RemoteSession {
    /// Create a report entry with just an id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile_ref = Some(profile.into());
        self
    }

    pub fn with_registry_name(mut self, name: impl Into<String>) -> Self {
        self.registry_name = Some(name.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Registry identity, falling back to the session id
    pub fn registry_name_or_id(&self) -> &str {
        self.registry_name.as_deref().unwrap_or(&self.id)
    }
}

fn lenient_status<'de, D>(deserializer: D) -> Result<Option<SessionStatus>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw.and_then(|value| serde_json::from_value(value).ok()))
}

/// One entry of a `terminals` report
///
/// Entries that do not decode as a [`RemoteSession`] are kept as
/// `Malformed` so a single bad entry never rejects the whole report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SessionEntry {
    Valid(RemoteSession),
    Malformed(serde_json::Value),
}

impl SessionEntry {
    /// The decoded session, if this entry is well formed
    pub fn session(&self) -> Option<&RemoteSession> {
        match self {
            SessionEntry::Valid(session) if !session.id.trim().is_empty() => Some(session),
            _ => None,
        }
    }
}

impl From<RemoteSession> for SessionEntry {
    fn from(session: RemoteSession) -> Self {
        SessionEntry::Valid(session)
    }
}
