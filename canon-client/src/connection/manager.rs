//! Connection state machine with durable reconnect scheduling
//!
//! The manager does no I/O. The sync runtime reports transport events
//! (`on_connected`, `on_connect_failed`, `on_disconnected`) and timer
//! ticks (`on_alarm`, `on_health_check`), and the manager answers with the
//! [`ConnectionAction`] the runtime should take next.

use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::scheduler::{Alarm, AlarmScheduler, Clock};

/// Transport phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionPhase::Disconnected => "disconnected",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Connected => "connected",
            ConnectionPhase::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    /// Failed attempts in the current reconnect cycle
    pub attempt: u32,
    /// Unix milliseconds of the last successful connect
    pub last_connected_at: Option<u64>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            attempt: 0,
            last_connected_at: None,
        }
    }
}

/// What the runtime should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Nothing to do
    None,
    /// Open the transport now
    Connect,
    /// Ask the backend for a full session list
    RequestList,
    /// A retry is registered with the alarm scheduler
    RetryScheduled(Alarm),
    /// Automatic retries have stopped; manual intervention required
    Exhausted,
}

/// Owns the connection state and the reconnect alarm
///
/// One instance per client process. Alarms are tagged with a cycle
/// generation that changes on every successful connect or manual reset, so
/// an alarm from an abandoned cycle can never trigger a connect.
pub struct ConnectionManager<A: AlarmScheduler, C: Clock> {
    backoff: Backoff,
    scheduler: A,
    clock: C,
    state: ConnectionState,
    generation: u64,
    exhausted: bool,
}

impl<A: AlarmScheduler, C: Clock> ConnectionManager<A, C> {
    pub fn new(backoff: Backoff, scheduler: A, clock: C) -> Self {
        Self {
            backoff,
            scheduler,
            clock,
            state: ConnectionState::default(),
            generation: 0,
            exhausted: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state.phase
    }

    pub fn attempt(&self) -> u32 {
        self.state.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Pick up a reconnect cycle left pending by a previous process
    ///
    /// Call once at startup, before the first `begin_connect`. Returns the
    /// restored alarm; the runtime waits for it instead of connecting.
    pub fn resume(&mut self) -> Option<Alarm> {
        let alarm = self.scheduler.pending()?;
        if alarm.attempt == 0 {
            self.cancel_alarm();
            return None;
        }

        info!(
            attempt = alarm.attempt,
            remaining_ms = alarm.remaining(self.clock.now_ms()).as_millis() as u64,
            "Resuming pending reconnect"
        );
        self.generation = alarm.generation;
        self.state.attempt = alarm.attempt;
        self.state.phase = ConnectionPhase::Reconnecting;
        Some(alarm)
    }

    /// Enter `connecting`; false if a connect is already in flight or up
    pub fn begin_connect(&mut self) -> bool {
        match self.state.phase {
            ConnectionPhase::Connecting | ConnectionPhase::Connected => false,
            _ => {
                self.state.phase = ConnectionPhase::Connecting;
                true
            }
        }
    }

    /// The transport came up
    pub fn on_connected(&mut self) -> ConnectionAction {
        if self.state.attempt > 0 {
            info!("Reconnected after {} failed attempts", self.state.attempt);
        } else {
            info!("Connected");
        }
        self.generation = self.generation.wrapping_add(1);
        self.cancel_alarm();
        self.exhausted = false;
        self.state = ConnectionState {
            phase: ConnectionPhase::Connected,
            attempt: 0,
            last_connected_at: Some(self.clock.now_ms()),
        };
        ConnectionAction::RequestList
    }

    /// A connect attempt failed
    pub fn on_connect_failed(&mut self) -> ConnectionAction {
        if self.state.phase != ConnectionPhase::Connecting {
            debug!(phase = %self.state.phase, "Ignoring connect failure outside connecting");
            return ConnectionAction::None;
        }
        self.schedule_retry()
    }

    /// An established transport was lost
    pub fn on_disconnected(&mut self) -> ConnectionAction {
        match self.state.phase {
            ConnectionPhase::Connected | ConnectionPhase::Connecting => {
                warn!("Connection lost");
                self.schedule_retry()
            }
            _ => ConnectionAction::None,
        }
    }

    /// Deadline of the alarm belonging to the current cycle, if any
    pub fn next_alarm(&self) -> Option<Alarm> {
        if self.state.phase != ConnectionPhase::Reconnecting {
            return None;
        }
        self.scheduler
            .pending()
            .filter(|alarm| self.is_current(alarm))
    }

    /// The alarm service woke us
    ///
    /// Only a due alarm from the current cycle moves to `connecting`; stale
    /// alarms are dropped and early wakeups are ignored.
    pub fn on_alarm(&mut self) -> ConnectionAction {
        let Some(alarm) = self.scheduler.pending() else {
            return ConnectionAction::None;
        };

        if !self.is_current(&alarm) || self.state.phase != ConnectionPhase::Reconnecting {
            debug!(
                alarm_generation = alarm.generation,
                generation = self.generation,
                "Dropping stale reconnect alarm"
            );
            if !self.is_current(&alarm) {
                self.cancel_alarm();
            }
            return ConnectionAction::None;
        }

        if !alarm.is_due(self.clock.now_ms()) {
            return ConnectionAction::None;
        }

        self.cancel_alarm();
        info!("Reconnect attempt {}/{}", alarm.attempt, self.backoff.max_attempts);
        self.state.phase = ConnectionPhase::Connecting;
        ConnectionAction::Connect
    }

    /// Periodic liveness tick
    pub fn on_health_check(&mut self) -> ConnectionAction {
        match self.state.phase {
            ConnectionPhase::Connected => ConnectionAction::RequestList,
            ConnectionPhase::Reconnecting => {
                debug!("Health check firing pending reconnect early");
                self.cancel_alarm();
                self.state.phase = ConnectionPhase::Connecting;
                ConnectionAction::Connect
            }
            ConnectionPhase::Disconnected if !self.exhausted => {
                self.state.phase = ConnectionPhase::Connecting;
                ConnectionAction::Connect
            }
            _ => ConnectionAction::None,
        }
    }

    /// Manual intervention: clear exhaustion and start a fresh cycle
    pub fn reset(&mut self) -> ConnectionAction {
        info!("Resetting reconnect cycle");
        self.exhausted = false;
        self.generation = self.generation.wrapping_add(1);
        self.cancel_alarm();
        self.state.attempt = 0;
        match self.state.phase {
            ConnectionPhase::Connected => ConnectionAction::RequestList,
            ConnectionPhase::Connecting => ConnectionAction::None,
            _ => {
                self.state.phase = ConnectionPhase::Connecting;
                ConnectionAction::Connect
            }
        }
    }

    /// Stop driving the connection
    ///
    /// A pending alarm stays registered so the next process resumes it.
    pub fn shutdown(&mut self) {
        self.state.phase = ConnectionPhase::Disconnected;
    }

    fn schedule_retry(&mut self) -> ConnectionAction {
        let attempt = self.state.attempt.saturating_add(1);
        let Some(delay) = self.backoff.delay(attempt) else {
            warn!(
                "All {} reconnect attempts exhausted",
                self.backoff.max_attempts
            );
            self.exhausted = true;
            self.cancel_alarm();
            self.state.phase = ConnectionPhase::Disconnected;
            return ConnectionAction::Exhausted;
        };

        let alarm = Alarm::new(
            self.clock.now_ms().saturating_add(delay.as_millis() as u64),
            attempt,
            self.generation,
        );
        if let Err(e) = self.scheduler.schedule(alarm) {
            warn!("Failed to persist reconnect alarm: {}", e);
        }

        info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduled reconnect"
        );
        self.state.attempt = attempt;
        self.state.phase = ConnectionPhase::Reconnecting;
        ConnectionAction::RetryScheduled(alarm)
    }

    fn is_current(&self, alarm: &Alarm) -> bool {
        alarm.generation == self.generation && alarm.attempt == self.state.attempt
    }

    fn cancel_alarm(&mut self) {
        if let Err(e) = self.scheduler.cancel() {
            warn!("Failed to cancel reconnect alarm: {}", e);
        }
    }
}
