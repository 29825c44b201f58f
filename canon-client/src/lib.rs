//! canon-client: terminal session sync and recovery
//!
//! Keeps a persisted session cache consistent with a backend session
//! registry reached over an intermittent transport:
//!
//! - [`cache`]: the persisted session list and current selection
//! - [`reconcile`]: merges remote session reports into the cache
//! - [`connection`]: transport links and the reconnect state machine
//! - [`scheduler`]: durable reconnect alarms
//! - [`coordinator`]: spawn/close acknowledgements and attach handshakes
//! - [`orphans`]: registry sessions with no cache entry
//! - [`sync`]: the runtime tying it together

pub mod backoff;
pub mod cache;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod namespace;
pub mod orphans;
pub mod reconcile;
pub mod scheduler;
pub mod store;
pub mod sync;

pub use backoff::Backoff;
pub use cache::{adjacent_selection, Session, SessionCache};
pub use config::{ClientConfig, ConfigLoader};
pub use connection::{
    ConnectionAction, ConnectionManager, ConnectionPhase, ConnectionState, Connector, Link,
    MessageSender, SocketConnector,
};
pub use coordinator::{SpawnCloseCoordinator, SpawnRequest};
pub use namespace::Namespace;
pub use orphans::{
    spawn_refresher, HttpOrphanBackend, ItemResult, OperationReport, OrphanBackend,
    OrphanDetector, OrphanedSession,
};
pub use reconcile::{ReconcileOutcome, ReconciliationEngine, RecoverySnapshot};
pub use scheduler::{
    Alarm, AlarmScheduler, Clock, FileAlarmScheduler, ManualClock, MemoryAlarmScheduler,
    SystemClock,
};
pub use store::{FileStore, KvStore, MemoryStore};
pub use sync::{resync_once, SyncClient, SyncCommand, SyncEvent, SyncHandle};
