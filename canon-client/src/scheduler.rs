//! Durable alarms for reconnect scheduling
//!
//! A reconnect retry must still fire if the process is suspended or
//! restarted between scheduling and the deadline. Alarms therefore store an
//! absolute wall-clock deadline in a durable store, and the remaining wait
//! is re-derived from the clock every time it is checked.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use canon_utils::Result;

use crate::store::{FileStore, KvStore};

const ALARM_KEY: &str = "alarm";

/// Wall clock in Unix milliseconds
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// The system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to
///
/// Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(now_ms)),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// A scheduled reconnect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alarm {
    /// Absolute deadline, Unix milliseconds
    pub deadline_ms: u64,
    /// Reconnect attempt this alarm fires
    pub attempt: u32,
    /// Reconnect cycle the alarm belongs to
    pub generation: u64,
}

impl Alarm {
    pub fn new(deadline_ms: u64, attempt: u32, generation: u64) -> Self {
        Self {
            deadline_ms,
            attempt,
            generation,
        }
    }

    /// Time left until the deadline, zero once due
    pub fn remaining(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.deadline_ms.saturating_sub(now_ms))
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        now_ms >= self.deadline_ms
    }
}

/// Host-level alarm registration
///
/// At most one alarm is pending; scheduling replaces it.
pub trait AlarmScheduler: Send {
    fn schedule(&mut self, alarm: Alarm) -> Result<()>;

    fn pending(&self) -> Option<Alarm>;

    fn cancel(&mut self) -> Result<()>;
}

/// Alarm persisted to a JSON file
#[derive(Debug)]
pub struct FileAlarmScheduler {
    store: FileStore,
}

impl FileAlarmScheduler {
    /// Open the alarm file, discarding it if unreadable
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let store = match FileStore::open(&path) {
            Ok(store) => store,
            Err(e) => {
                warn!("Discarding unreadable alarm file {}: {}", path.display(), e);
                FileStore::fresh(path)
            }
        };
        Self { store }
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }
}

impl AlarmScheduler for FileAlarmScheduler {
    fn schedule(&mut self, alarm: Alarm) -> Result<()> {
        debug!(
            deadline_ms = alarm.deadline_ms,
            attempt = alarm.attempt,
            "Scheduling reconnect alarm"
        );
        self.store.put(ALARM_KEY, serde_json::to_value(alarm)?)
    }

    fn pending(&self) -> Option<Alarm> {
        let value = self.store.get(ALARM_KEY).ok()??;
        match serde_json::from_value(value) {
            Ok(alarm) => Some(alarm),
            Err(e) => {
                warn!("Ignoring malformed reconnect alarm: {}", e);
                None
            }
        }
    }

    fn cancel(&mut self) -> Result<()> {
        self.store.delete(ALARM_KEY)
    }
}

/// In-memory alarm
///
/// Clones share the pending alarm, so a clone handed to a fresh manager
/// behaves like the alarm service seen after a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryAlarmScheduler {
    alarm: Arc<Mutex<Option<Alarm>>>,
}

impl MemoryAlarmScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AlarmScheduler for MemoryAlarmScheduler {
    fn schedule(&mut self, alarm: Alarm) -> Result<()> {
        *self.alarm.lock().unwrap_or_else(|e| e.into_inner()) = Some(alarm);
        Ok(())
    }

    fn pending(&self) -> Option<Alarm> {
        *self.alarm.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cancel(&mut self) -> Result<()> {
        *self.alarm.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}
