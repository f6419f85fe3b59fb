//! Connection health monitoring and bounded recovery.
//!
//! State machine: `Healthy → Degraded → Recovering → Healthy`, or
//! `Recovering → Failed` once the bounded attempts are exhausted.
//!
//! A timer issues a cheap probe (`Target.getTargets`) through the primary
//! connection. Success within the latency ceiling is healthy; anything
//! else degrades the connection and triggers recovery: ownership-aware
//! teardown, exponential backoff (`base × attempt`), reconnect with the
//! last-known options, and a fresh discovery pass.
//!
//! Recovery holds the command lock while it tears the connection down, so
//! an in-flight command never observes a half-torn-down session. Failed
//! is terminal for the automatic path; manual reconnection resets it.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing::{debug, info, warn};

use crate::command::CommandMutex;
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::protocol::CdpCommand;
use crate::session::SessionMultiplexer;

// ============================================================================
// HealthStatus
// ============================================================================

/// Connection health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Last probe succeeded within the latency ceiling.
    Healthy,
    /// Last probe failed; recovery not yet started.
    Degraded,
    /// Reconnection in progress.
    Recovering,
    /// Bounded reconnect attempts exhausted; manual reattach required.
    Failed,
}

// ============================================================================
// HealthOptions
// ============================================================================

/// Monitor tuning. Boundedness is the hard requirement; the particular
/// constants are per-deployment configurable.
#[derive(Debug, Clone)]
pub struct HealthOptions {
    /// Interval between liveness probes.
    pub probe_interval: Duration,

    /// Latency ceiling for a probe to count as healthy.
    pub probe_timeout: Duration,

    /// Backoff base; attempt N waits `base × N`.
    pub backoff_base: Duration,

    /// Maximum automatic reconnect attempts.
    pub max_attempts: u32,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_secs(2),
            max_attempts: 3,
        }
    }
}

// ============================================================================
// HealthReport
// ============================================================================

/// Snapshot for the `getHealth` boundary operation.
#[derive(Debug, Clone, Copy)]
pub struct HealthReport {
    /// Current state.
    pub status: HealthStatus,

    /// When the last probe completed, if any.
    pub last_check: Option<SystemTime>,

    /// Reconnect attempts performed in the current degradation episode.
    pub reconnect_attempts: u32,
}

// ============================================================================
// HealthMonitor
// ============================================================================

struct HealthState {
    status: HealthStatus,
    last_check: Option<SystemTime>,
    attempts: u32,
}

/// Periodic liveness probing plus bounded auto-reconnect.
pub struct HealthMonitor {
    state: Mutex<HealthState>,
    options: HealthOptions,
    manager: Arc<ConnectionManager>,
    mux: SessionMultiplexer,
    command_mutex: CommandMutex,
    /// Fired by a manual reconnect to cancel a pending backoff sleep.
    cancel: Notify,
}

impl HealthMonitor {
    /// Creates a monitor over the given manager and multiplexer.
    #[must_use]
    pub fn new(
        manager: Arc<ConnectionManager>,
        mux: SessionMultiplexer,
        command_mutex: CommandMutex,
        options: HealthOptions,
    ) -> Self {
        Self {
            state: Mutex::new(HealthState {
                status: HealthStatus::Healthy,
                last_check: None,
                attempts: 0,
            }),
            options,
            manager,
            mux,
            command_mutex,
            cancel: Notify::new(),
        }
    }

    /// Returns the current state snapshot.
    #[must_use]
    pub fn report(&self) -> HealthReport {
        let state = self.state.lock();
        HealthReport {
            status: state.status,
            last_check: state.last_check,
            reconnect_attempts: state.attempts,
        }
    }

    /// Returns the current status.
    #[inline]
    #[must_use]
    pub fn status(&self) -> HealthStatus {
        self.state.lock().status
    }

    /// Fails fast when the automatic path has given up.
    ///
    /// # Errors
    ///
    /// [`Error::HealthDegraded`] in the `Failed` state.
    pub fn ensure_usable(&self) -> Result<()> {
        let state = self.state.lock();
        if state.status == HealthStatus::Failed {
            return Err(Error::health_degraded(state.attempts));
        }
        Ok(())
    }

    /// Cancels a pending recovery backoff. Manual actions take
    /// precedence over the automatic retry loop.
    ///
    /// The cancellation is latched: `notify_one` stores a permit, so a
    /// manual action that lands between two backoff sleeps (or before
    /// recovery reaches its first one) still cancels instead of being
    /// lost.
    pub fn cancel_backoff(&self) {
        self.cancel.notify_one();
    }

    /// Resets the machine after a successful manual reconnect.
    pub fn mark_recovered(&self) {
        let mut state = self.state.lock();
        state.status = HealthStatus::Healthy;
        state.attempts = 0;
        state.last_check = Some(SystemTime::now());
    }

    /// Spawns the probe timer task.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.options.probe_interval);
            // First tick fires immediately; skip it so a freshly created
            // monitor does not probe before the connection exists.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                self.probe_once().await;
            }
        })
    }

    /// Runs one probe cycle; degrades and recovers as needed.
    pub async fn probe_once(&self) {
        if self.status() == HealthStatus::Failed {
            // Terminal for the automatic path.
            return;
        }

        let healthy = self.probe().await;
        {
            let mut state = self.state.lock();
            state.last_check = Some(SystemTime::now());
            if healthy {
                state.status = HealthStatus::Healthy;
                state.attempts = 0;
                return;
            }
            state.status = HealthStatus::Degraded;
        }

        warn!("Liveness probe failed, connection degraded");
        self.recover().await;
    }

    /// Issues the cheap liveness call.
    async fn probe(&self) -> bool {
        let Ok(connection) = self.manager.connection().await else {
            return false;
        };

        connection
            .send_with_timeout(
                CdpCommand::simple("Target.getTargets"),
                self.options.probe_timeout,
            )
            .await
            .is_ok()
    }

    /// Bounded backoff-reconnect loop.
    async fn recover(&self) {
        // Exclude in-flight commands for the whole recovery episode so
        // none of them observes the teardown mid-way.
        let _guard = self.command_mutex.acquire().await;

        // One listener for the whole episode; a cancellation arriving
        // while a reconnect attempt is in flight is picked up by the
        // next backoff select rather than lost.
        let cancelled = self.cancel.notified();
        tokio::pin!(cancelled);

        for attempt in 1..=self.options.max_attempts {
            {
                let mut state = self.state.lock();
                state.status = HealthStatus::Recovering;
                state.attempts = attempt;
            }
            info!(attempt, max = self.options.max_attempts, "Reconnect attempt");

            if let Err(e) = self.manager.teardown().await {
                warn!(error = %e, "Teardown during recovery failed");
            }

            let backoff = self.options.backoff_base * attempt;
            tokio::select! {
                () = sleep(backoff) => {}
                () = &mut cancelled => {
                    debug!("Recovery backoff cancelled by manual action");
                    self.state.lock().status = HealthStatus::Degraded;
                    return;
                }
            }

            match self.try_reconnect().await {
                Ok(()) => {
                    info!(attempt, "Recovery succeeded");
                    let mut state = self.state.lock();
                    state.status = HealthStatus::Healthy;
                    state.attempts = 0;
                    return;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Reconnect attempt failed");
                }
            }
        }

        warn!(
            attempts = self.options.max_attempts,
            "Reconnect attempts exhausted, entering failed state"
        );
        self.state.lock().status = HealthStatus::Failed;
    }

    /// One reconnect: establish with last-known options, rediscover.
    async fn try_reconnect(&self) -> Result<()> {
        self.manager.ensure_connection().await?;
        self.mux.discover_and_attach().await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc;

    use crate::connection::ConnectOptions;
    use crate::session::TargetRegistry;

    /// Monitor wired to a manager whose attach can never succeed.
    fn failing_monitor(max_attempts: u32) -> Arc<HealthMonitor> {
        let (log_tx, _log_rx) = mpsc::unbounded_channel();
        let mux = SessionMultiplexer::new(TargetRegistry::new(), log_tx);
        let manager = Arc::new(ConnectionManager::new(
            ConnectOptions {
                port: 1,
                prefer_attach: true,
                allow_launch: false,
                ..ConnectOptions::default()
            },
            mux.clone(),
        ));

        Arc::new(HealthMonitor::new(
            manager,
            mux,
            CommandMutex::new(),
            HealthOptions {
                probe_interval: Duration::from_millis(50),
                probe_timeout: Duration::from_millis(100),
                backoff_base: Duration::from_millis(1),
                max_attempts,
            },
        ))
    }

    #[tokio::test]
    async fn test_bounded_reconnect_reaches_failed() {
        let monitor = failing_monitor(3);
        assert_eq!(monitor.status(), HealthStatus::Healthy);

        monitor.probe_once().await;

        let report = monitor.report();
        assert_eq!(report.status, HealthStatus::Failed);
        assert_eq!(report.reconnect_attempts, 3);
        assert!(report.last_check.is_some());
    }

    #[tokio::test]
    async fn test_failed_state_stops_retrying() {
        let monitor = failing_monitor(2);
        monitor.probe_once().await;
        assert_eq!(monitor.report().reconnect_attempts, 2);

        // Further probes must not restart the loop.
        monitor.probe_once().await;
        assert_eq!(monitor.report().reconnect_attempts, 2);
        assert_eq!(monitor.status(), HealthStatus::Failed);
    }

    #[tokio::test]
    async fn test_ensure_usable_surfaces_degraded_error() {
        let monitor = failing_monitor(1);
        assert!(monitor.ensure_usable().is_ok());

        monitor.probe_once().await;

        let err = monitor.ensure_usable().unwrap_err();
        assert!(matches!(err, Error::HealthDegraded { attempts: 1 }));
    }

    #[tokio::test]
    async fn test_recovery_releases_command_lock() {
        let monitor = failing_monitor(2);
        monitor.probe_once().await;

        // Recovery must not leave the lock held even after exhaustion.
        assert!(!monitor.command_mutex.is_locked());
    }

    #[tokio::test]
    async fn test_cancel_before_backoff_is_latched() {
        let monitor = failing_monitor(3);

        // Manual action fires before recovery reaches its first backoff;
        // the stored permit must still cancel it instead of being lost.
        monitor.cancel_backoff();
        monitor.probe_once().await;

        let report = monitor.report();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.reconnect_attempts, 1);
        assert!(!monitor.command_mutex.is_locked());
    }

    #[tokio::test]
    async fn test_manual_recovery_resets_state() {
        let monitor = failing_monitor(1);
        monitor.probe_once().await;
        assert_eq!(monitor.status(), HealthStatus::Failed);

        monitor.mark_recovered();
        let report = monitor.report();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.reconnect_attempts, 0);
    }
}
