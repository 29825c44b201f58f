//! Spawn and close coordination
//!
//! Turns user spawn/close intents into backend requests and backend
//! acknowledgements into cache mutations, keeping the current selection
//! well defined.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use canon_protocol::{ClientMessage, RemoteSession};
use canon_utils::Result;

use crate::cache::SessionCache;
use crate::connection::MessageSender;
use crate::namespace::Namespace;
use crate::reconcile::{discover, refresh};
use crate::store::KvStore;

/// A user request for a new session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub profile_ref: String,
    pub working_dir: Option<String>,
    pub command: Option<String>,
    pub display_name: Option<String>,
}

impl SpawnRequest {
    pub fn new(profile_ref: impl Into<String>) -> Self {
        Self {
            profile_ref: profile_ref.into(),
            working_dir: None,
            command: None,
            display_name: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Normalized dedup key: profile, working directory, command
    pub fn signature(&self) -> String {
        let profile = self.profile_ref.trim().to_lowercase();
        let dir = self
            .working_dir
            .as_deref()
            .map(|d| {
                let d = d.trim();
                if d.len() > 1 {
                    d.trim_end_matches('/')
                } else {
                    d
                }
            })
            .unwrap_or("");
        let command = self
            .command
            .as_deref()
            .map(|c| c.split_whitespace().collect::<Vec<_>>().join(" "))
            .unwrap_or_default();
        format!("{}\u{1f}{}\u{1f}{}", profile, dir, command)
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    id: String,
    issued_at: u64,
}

/// Coordinates spawn/close requests and their acknowledgements
pub struct SpawnCloseCoordinator {
    namespace: Namespace,
    suppression: Duration,
    attach_stagger: Duration,
    /// Recently issued spawns by signature
    in_flight: HashMap<String, InFlight>,
    /// Locally requested spawns awaiting acknowledgement, by id
    awaiting_ack: HashMap<String, SpawnRequest>,
}

impl SpawnCloseCoordinator {
    pub fn new(namespace: Namespace, suppression: Duration, attach_stagger: Duration) -> Self {
        Self {
            namespace,
            suppression,
            attach_stagger,
            in_flight: HashMap::new(),
            awaiting_ack: HashMap::new(),
        }
    }

    pub fn attach_stagger(&self) -> Duration {
        self.attach_stagger
    }

    /// Turn a spawn request into a backend message
    ///
    /// Returns `None` when an identical request was issued within the
    /// suppression window.
    pub fn request_spawn(&mut self, request: SpawnRequest, now_ms: u64) -> Option<ClientMessage> {
        self.prune(now_ms);

        let signature = request.signature();
        if let Some(previous) = self.in_flight.get(&signature) {
            debug!(
                "Suppressing duplicate spawn of {} (in flight as {})",
                request.profile_ref, previous.id
            );
            return None;
        }

        let id = self.namespace.new_id(&request.profile_ref);
        info!("Requesting spawn of {} as {}", request.profile_ref, id);
        self.in_flight.insert(
            signature,
            InFlight {
                id: id.clone(),
                issued_at: now_ms,
            },
        );
        self.awaiting_ack.insert(id.clone(), request.clone());

        Some(ClientMessage::SpawnTerminal {
            id,
            profile_ref: request.profile_ref,
            working_dir: request.working_dir,
            command: request.command,
            display_name: request.display_name,
        })
    }

    /// Close request for an owned session
    pub fn request_close(&self, id: &str) -> Option<ClientMessage> {
        if !self.namespace.owns(id) {
            debug!("Refusing to close foreign session {}", id);
            return None;
        }
        Some(ClientMessage::CloseTerminal { id: id.to_string() })
    }

    /// Apply a spawn acknowledgement: create or update the session and
    /// select it
    ///
    /// Returns false for sessions outside the namespace.
    pub fn on_spawned<S: KvStore>(
        &mut self,
        cache: &mut SessionCache<S>,
        remote: &RemoteSession,
        now_ms: u64,
    ) -> Result<bool> {
        if !self.namespace.owns(&remote.id) {
            debug!("Ignoring spawn of foreign session {}", remote.id);
            return Ok(false);
        }
        self.in_flight.retain(|_, spawn| spawn.id != remote.id);

        let session = match cache.get(&remote.id) {
            Some(existing) => {
                let mut session = existing.clone();
                refresh(&mut session, remote, now_ms);
                session
            }
            None => {
                let mut session = discover(&self.namespace, remote, now_ms);
                if let Some(request) = self.awaiting_ack.get(&remote.id) {
                    session.profile_ref = request.profile_ref.clone();
                    session.profile_locked = true;
                    if let Some(name) = &request.display_name {
                        session.display_name = name.clone();
                        session.name_locked = true;
                    }
                    if session.working_dir.is_none() {
                        session.working_dir = request.working_dir.clone();
                    }
                }
                session
            }
        };
        self.awaiting_ack.remove(&remote.id);

        let id = session.id.clone();
        cache.upsert(session)?;
        cache.select(&id)?;
        info!("Session {} spawned", id);
        Ok(true)
    }

    /// Apply a close acknowledgement
    ///
    /// The cache re-selects the adjacent session if the closed one was
    /// current. Returns whether a session was removed.
    pub fn on_closed<S: KvStore>(&mut self, cache: &mut SessionCache<S>, id: &str) -> Result<bool> {
        if !self.namespace.owns(id) {
            debug!("Ignoring close of foreign session {}", id);
            return Ok(false);
        }
        self.awaiting_ack.remove(id);
        self.in_flight.retain(|_, spawn| spawn.id != id);

        let removed = cache.remove(id)?.is_some();
        if removed {
            info!("Session {} closed, current={:?}", id, cache.current());
        }
        Ok(removed)
    }

    /// Attach handshakes for `ids`, each with its offset from now
    pub fn plan_attaches(&self, ids: &[String]) -> Vec<(Duration, ClientMessage)> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| {
                (
                    self.attach_stagger * i as u32,
                    ClientMessage::Reconnect { id: id.clone() },
                )
            })
            .collect()
    }

    /// Send attach handshakes from a background task, staggered
    pub fn spawn_attaches(&self, sender: MessageSender, ids: Vec<String>) -> JoinHandle<()> {
        let stagger = self.attach_stagger;
        tokio::spawn(async move {
            for (i, id) in ids.into_iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(stagger).await;
                }
                if sender.is_closed() {
                    debug!("Link closed, abandoning attach handshakes");
                    return;
                }
                debug!("Attaching to {}", id);
                if sender.send(ClientMessage::Reconnect { id }).await.is_err() {
                    return;
                }
            }
        })
    }

    fn prune(&mut self, now_ms: u64) {
        let window = self.suppression.as_millis() as u64;
        self.in_flight
            .retain(|_, spawn| now_ms.saturating_sub(spawn.issued_at) < window);
    }
}
