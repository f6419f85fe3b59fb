//! FIFO command serialization.
//!
//! At most one externally invoked command executes against the browser at
//! a time. [`CommandMutex`] is an async lock with strict FIFO fairness:
//! release hands ownership directly to the oldest waiter without the lock
//! ever observing an unlocked state in between, so a racing fresh
//! `acquire` can never jump the queue.
//!
//! The returned [`CommandGuard`] releases on drop, which makes release
//! run on every propagation path, including errors and early returns.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

// ============================================================================
// Types
// ============================================================================

/// Lock state shared between handles and guards.
struct MutexState {
    /// Whether the lock is currently held.
    locked: bool,
    /// Pending waiters, oldest first.
    waiters: VecDeque<oneshot::Sender<Grant>>,
}

/// Ownership in flight between a releasing guard and a queued waiter.
///
/// A waiter that receives the grant converts it into its guard. A waiter
/// cancelled after the grant was sent never polls the channel; the grant
/// is then dropped inside it, and drop returns ownership to the queue so
/// the lock cannot leak to a dead task.
struct Grant {
    state: Option<Arc<Mutex<MutexState>>>,
}

impl Grant {
    fn into_guard(mut self) -> CommandGuard {
        CommandGuard {
            state: self.state.take().expect("grant already consumed"),
        }
    }

    /// Defuses the grant without releasing. Only for a grant rejected by
    /// a closed channel while the releaser already holds the state lock.
    fn defuse(mut self) {
        self.state = None;
    }
}

impl Drop for Grant {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            release(&state);
        }
    }
}

// ============================================================================
// CommandMutex
// ============================================================================

/// FIFO async mutual exclusion for command execution.
#[derive(Clone)]
pub struct CommandMutex {
    state: Arc<Mutex<MutexState>>,
}

impl Default for CommandMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandMutex {
    /// Creates an unlocked mutex.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MutexState {
                locked: false,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Acquires the lock, suspending until it is granted.
    ///
    /// If the lock is free, acquisition succeeds immediately. Otherwise
    /// the caller joins the tail of the queue and is granted ownership in
    /// arrival order. A waiter cancelled before its grant is skipped at
    /// release time; one cancelled after the grant was sent returns
    /// ownership to the queue instead of leaking it.
    pub async fn acquire(&self) -> CommandGuard {
        let pending = {
            let mut state = self.state.lock();
            if state.locked {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                trace!(queue_depth = state.waiters.len(), "Command queued");
                Some(rx)
            } else {
                state.locked = true;
                None
            }
        };

        match pending {
            Some(rx) => match rx.await {
                Ok(grant) => grant.into_guard(),
                // The only holder of the senders is `state`, which we keep
                // alive, so a dropped sender without a grant cannot happen
                // while `self` exists.
                Err(_) => CommandGuard {
                    state: Arc::clone(&self.state),
                },
            },
            None => CommandGuard {
                state: Arc::clone(&self.state),
            },
        }
    }

    /// Runs a future while holding the lock.
    pub async fn with_lock<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.acquire().await;
        fut.await
    }

    /// Returns `true` if the lock is currently held.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Returns the number of queued waiters.
    #[inline]
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

// ============================================================================
// CommandGuard
// ============================================================================

/// RAII lock token; releases on drop.
///
/// Dropping the guard either transfers ownership to the oldest live
/// waiter (the lock stays marked held throughout) or, with no waiters,
/// clears the held flag.
#[must_use = "dropping the guard releases the command lock"]
pub struct CommandGuard {
    state: Arc<Mutex<MutexState>>,
}

impl Drop for CommandGuard {
    fn drop(&mut self) {
        release(&self.state);
    }
}

/// Hands ownership to the oldest waiter whose receiver is still alive, or
/// clears the held flag when the queue drains.
///
/// Called from [`CommandGuard::drop`] and from [`Grant::drop`] when a grant
/// was sent but the waiter vanished before claiming it.
fn release(state: &Arc<Mutex<MutexState>>) {
    let mut locked = state.lock();

    while let Some(tx) = locked.waiters.pop_front() {
        let grant = Grant {
            state: Some(Arc::clone(state)),
        };
        match tx.send(grant) {
            Ok(()) => {
                trace!(
                    queue_depth = locked.waiters.len(),
                    "Lock handed to next waiter"
                );
                return;
            }
            // Waiter cancelled its acquire before the grant; defuse the
            // rejected grant (we hold the state lock, it must not recurse)
            // and try the next one.
            Err(rejected) => rejected.defuse(),
        }
    }

    locked.locked = false;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::time::sleep;

    #[tokio::test]
    async fn test_uncontended_acquire() {
        let mutex = CommandMutex::new();
        assert!(!mutex.is_locked());

        let guard = mutex.acquire().await;
        assert!(mutex.is_locked());
        assert_eq!(mutex.queue_depth(), 0);

        drop(guard);
        assert!(!mutex.is_locked());
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let mutex = CommandMutex::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = mutex.acquire().await;

        let mut handles = Vec::new();
        for name in ["A", "B", "C"] {
            let mutex = mutex.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _guard = mutex.acquire().await;
                order.lock().push(name);
                // Simulated work so a racing later waiter would be visible
                sleep(Duration::from_millis(10)).await;
            }));
            // Let the task reach its queue position before spawning the next
            sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(mutex.queue_depth(), 3);
        drop(first);

        for handle in handles {
            handle.await.expect("waiter task");
        }

        assert_eq!(*order.lock(), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_handoff_never_observes_unlocked() {
        let mutex = CommandMutex::new();
        let guard = mutex.acquire().await;

        let waiter = {
            let mutex = mutex.clone();
            tokio::spawn(async move {
                let _guard = mutex.acquire().await;
                sleep(Duration::from_millis(50)).await;
            })
        };
        sleep(Duration::from_millis(20)).await;
        assert_eq!(mutex.queue_depth(), 1);

        // Ownership transfers directly; the held flag never clears.
        drop(guard);
        sleep(Duration::from_millis(10)).await;
        assert!(mutex.is_locked());

        waiter.await.expect("waiter task");
        assert!(!mutex.is_locked());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_skipped() {
        let mutex = CommandMutex::new();
        let guard = mutex.acquire().await;

        // Queue a waiter, then cancel it before it is granted.
        let cancelled = {
            let mutex = mutex.clone();
            tokio::spawn(async move {
                let _guard = mutex.acquire().await;
            })
        };
        sleep(Duration::from_millis(20)).await;
        cancelled.abort();
        let _ = cancelled.await;

        // Release must skip the dead waiter and unlock.
        drop(guard);
        assert!(!mutex.is_locked());

        // Lock still works afterwards.
        let _guard = mutex.acquire().await;
    }

    #[tokio::test]
    async fn test_waiter_cancelled_after_grant_returns_ownership() {
        let mutex = CommandMutex::new();
        let holder = mutex.acquire().await;

        // Queue a waiter, then abandon it after the grant is already in
        // its channel.
        let mut waiter = tokio_test::task::spawn(mutex.acquire());
        assert!(waiter.poll().is_pending());
        assert_eq!(mutex.queue_depth(), 1);

        drop(holder);
        drop(waiter);

        // Ownership must come back; a fresh acquire cannot hang.
        let guard = tokio::time::timeout(Duration::from_millis(200), mutex.acquire())
            .await
            .expect("lock leaked to an abandoned waiter");
        drop(guard);
        assert!(!mutex.is_locked());
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_completion() {
        let mutex = CommandMutex::new();
        let result = mutex.with_lock(async { 41 + 1 }).await;
        assert_eq!(result, 42);
        assert!(!mutex.is_locked());
    }
}
