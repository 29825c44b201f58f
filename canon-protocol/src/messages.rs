//! Client-backend message types
//!
//! Messages are JSON objects internally tagged by `"type"`. Any tag the
//! client does not recognize decodes to [`ServerMessage::Unknown`] and is
//! ignored by consumers.

use serde::{Deserialize, Serialize};

use crate::types::{RemoteSession, SessionEntry};

/// Messages sent from the backend to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Full or partial session report
    #[serde(rename_all = "camelCase")]
    Terminals {
        sessions: Vec<SessionEntry>,
        /// Whether the report is authoritative and complete. A missing flag
        /// is treated as partial.
        #[serde(default)]
        recovery_complete: bool,
        #[serde(default)]
        connection_count: u32,
    },

    /// A spawn request was fulfilled
    TerminalSpawned { session: RemoteSession },

    /// A session was closed
    TerminalClosed { id: String },

    /// Number of clients observing the backend
    ConnectionCount { count: u32 },

    /// Any message kind this client does not handle
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Terminals { .. } => "terminals",
            ServerMessage::TerminalSpawned { .. } => "terminal-spawned",
            ServerMessage::TerminalClosed { .. } => "terminal-closed",
            ServerMessage::ConnectionCount { .. } => "connection-count",
            ServerMessage::Unknown => "unknown",
        }
    }
}

/// Messages sent from the client to the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Request a full session snapshot
    ListTerminals,

    /// Lightweight attach handshake for a known session
    Reconnect { id: String },

    /// Spawn a new session
    #[serde(rename_all = "camelCase")]
    SpawnTerminal {
        id: String,
        profile_ref: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_dir: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },

    /// Close a session
    CloseTerminal { id: String },
}

impl ClientMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::ListTerminals => "list-terminals",
            ClientMessage::Reconnect { .. } => "reconnect",
            ClientMessage::SpawnTerminal { .. } => "spawn-terminal",
            ClientMessage::CloseTerminal { .. } => "close-terminal",
        }
    }
}
