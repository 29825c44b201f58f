//! Backend connection management
//!
//! `manager` holds the connection state machine and reconnect policy;
//! `client` provides the framed transport it drives.

mod client;
mod handler;
mod manager;

pub use client::{Connector, Link, SocketConnector, StreamTrait};
pub use handler::MessageSender;
pub use manager::{ConnectionAction, ConnectionManager, ConnectionPhase, ConnectionState};
