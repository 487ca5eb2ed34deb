//! Admission controller: bounds in-flight requests and queues the overflow.
//!
//! The controller composes a [`ConnectionRegistry`], a [`WaitQueue`] and a
//! [`MetricsAggregator`] behind one mutex. Every operation takes the lock once,
//! applies all of its state changes, and drops it before any `.await` or
//! telemetry call, so the three components always agree with each other.
//!
//! Callers get an [`AdmissionPermit`] from [`AdmissionController::acquire`];
//! dropping the permit releases the slot and hands it straight to the oldest
//! live waiter. Promotion never goes back through `acquire`.
//!
//! A queued caller whose future is dropped (client disconnect, request abort)
//! is taken out of the queue by a drop guard. If it had already been promoted
//! when it went away, its slot is released on the spot.
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::Serialize;
use tokio::{sync::oneshot, time::Instant};

use crate::{
    config::models::AdmissionConfig,
    core::{
        connection::{ClientInfo, Connection, ConnectionToken},
        registry::ConnectionRegistry,
        stats::{MetricsAggregator, MetricsSnapshot},
        wait_queue::{WaitQueue, Waiter},
    },
    metrics,
};

/// Why a caller did not get a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    #[error("timed out waiting for a free slot")]
    QueueTimeout,
    #[error("caller went away while queued")]
    Cancelled,
    #[error("admission controller is shutting down")]
    ShuttingDown,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::QueueTimeout => "queue_timeout",
            RejectReason::Cancelled => "cancelled",
            RejectReason::ShuttingDown => "shutting_down",
        }
    }
}

/// Result of a failed `acquire`, carrying the queue depth at rejection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("request rejected: {reason} ({queue_depth} queued)")]
pub struct Rejection {
    pub reason: RejectReason,
    pub queue_depth: usize,
}

/// Registry, queue and stats: one consistency domain.
#[derive(Debug, Default)]
struct AdmissionState {
    registry: ConnectionRegistry,
    queue: WaitQueue,
    stats: MetricsAggregator,
    closed: bool,
}

/// What happened to the waiters looked at while filling freed slots.
#[derive(Debug, Default)]
struct Promotions {
    admitted: Vec<(ConnectionToken, Duration)>,
    expired: usize,
    abandoned: usize,
}

impl AdmissionState {
    fn admit(&mut self, connection: Connection) {
        debug_assert!(!self.queue.contains(&connection.token));
        if self.registry.insert(connection).is_some() {
            tracing::error!("Connection token collision in registry");
        }
        self.stats.record_admission();
    }

    fn reject(&mut self, reason: RejectReason) -> Rejection {
        self.stats.record_rejection();
        Rejection {
            reason,
            queue_depth: self.queue.len(),
        }
    }

    /// Remove an admitted connection, account for it, and refill the slot.
    fn release(
        &mut self,
        token: &ConnectionToken,
        max_concurrent: usize,
    ) -> Option<(Connection, Promotions)> {
        let connection = self.registry.remove(token)?;
        self.stats.record_completion(connection.age());
        let promotions = self.promote_waiters(max_concurrent);
        Some((connection, promotions))
    }

    /// Hand free slots to waiters in enqueue order. Expired waiters and waiters
    /// whose caller is gone are dropped and counted as rejected.
    fn promote_waiters(&mut self, max_concurrent: usize) -> Promotions {
        let mut promotions = Promotions::default();
        let now = Instant::now();

        while self.registry.len() < max_concurrent {
            let Some(waiter) = self.queue.dequeue_oldest() else {
                break;
            };
            self.stats.record_queued(-1);

            if waiter.is_expired(now) {
                self.stats.record_rejection();
                promotions.expired += 1;
                continue;
            }

            let token = waiter.token;
            let connection = Connection::promote(
                token,
                waiter.client.clone(),
                waiter.enqueued_at.into_std(),
            );
            let queue_wait = connection.queue_wait();
            self.registry.insert(connection);

            if waiter.signal() {
                self.stats.record_admission();
                promotions.admitted.push((token, queue_wait));
            } else {
                self.registry.remove(&token);
                self.stats.record_rejection();
                promotions.abandoned += 1;
            }
        }

        promotions
    }
}

struct Inner {
    max_concurrent: usize,
    default_timeout: Duration,
    state: Mutex<AdmissionState>,
}

/// Shared admission controller. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("max_concurrent", &self.inner.max_concurrent)
            .field("default_timeout", &self.inner.default_timeout)
            .finish_non_exhaustive()
    }
}

enum Entry {
    Admitted,
    Rejected(Rejection),
    Queued(oneshot::Receiver<()>),
}

impl AdmissionController {
    /// Create a controller admitting at most `max_concurrent` requests at once.
    /// A limit of zero would reject everything, so it is raised to one.
    pub fn new(max_concurrent: usize, default_timeout: Duration) -> Self {
        if max_concurrent == 0 {
            tracing::warn!("max_concurrent of 0 would never admit anything, using 1");
        }
        Self {
            inner: Arc::new(Inner {
                max_concurrent: max_concurrent.max(1),
                default_timeout,
                state: Mutex::new(AdmissionState::default()),
            }),
        }
    }

    /// Build a controller from the `[admission]` configuration section.
    pub fn from_config(config: &AdmissionConfig) -> eyre::Result<Self> {
        let default_timeout = config.acquire_timeout()?;
        tracing::info!(
            "Creating admission controller: max_concurrent={}, acquire_timeout={:?}",
            config.max_concurrent,
            default_timeout
        );
        Ok(Self::new(config.max_concurrent, default_timeout))
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    fn lock_state(&self) -> MutexGuard<'_, AdmissionState> {
        // Each critical section applies its changes without a fallible step in
        // between, so state behind a poisoned lock is still consistent.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// [`acquire`](Self::acquire) with the configured default timeout.
    pub async fn acquire_default(&self, client: ClientInfo) -> Result<AdmissionPermit, Rejection> {
        self.acquire(client, self.inner.default_timeout).await
    }

    /// Take a slot, waiting up to `timeout` in FIFO order if none is free.
    ///
    /// With a zero timeout a full controller rejects at once without queueing.
    /// Dropping the returned future while queued withdraws the caller.
    pub async fn acquire(
        &self,
        client: ClientInfo,
        timeout: Duration,
    ) -> Result<AdmissionPermit, Rejection> {
        let token = ConnectionToken::new();
        let deadline = deadline_after(timeout);

        let (entry, snapshot) = {
            let mut state = self.lock_state();
            let entry = if state.closed {
                Entry::Rejected(state.reject(RejectReason::ShuttingDown))
            } else if state.registry.len() < self.inner.max_concurrent {
                state.admit(Connection::admit(token, client));
                Entry::Admitted
            } else if timeout.is_zero() {
                Entry::Rejected(state.reject(RejectReason::QueueTimeout))
            } else {
                let (waiter, promote_rx) = Waiter::new(token, client, deadline);
                state.queue.enqueue(waiter);
                state.stats.record_queued(1);
                Entry::Queued(promote_rx)
            };
            (entry, state.stats.snapshot())
        };
        metrics::publish_snapshot(&snapshot);

        let promote_rx = match entry {
            Entry::Admitted => {
                tracing::debug!(
                    "Connection admitted: token={}, active={}",
                    token,
                    snapshot.active_connections
                );
                metrics::record_admission(Duration::ZERO);
                return Ok(self.permit(token));
            }
            Entry::Rejected(rejection) => {
                tracing::warn!(
                    "Connection rejected: reason={}, queued={}",
                    rejection.reason.as_str(),
                    rejection.queue_depth
                );
                metrics::record_rejection(rejection.reason);
                return Err(rejection);
            }
            Entry::Queued(promote_rx) => promote_rx,
        };

        tracing::debug!(
            "No free slot, queued: token={}, queued={}, timeout={:?}",
            token,
            snapshot.queued_connections,
            timeout
        );

        let pending = PendingWaiter {
            controller: self,
            token,
            armed: true,
        };
        let outcome = tokio::time::timeout_at(deadline, promote_rx).await;
        pending.disarm();

        match outcome {
            Ok(Ok(())) => Ok(self.permit(token)),
            // Deadline hit, or the waiter was dropped by a release (expired) or by close().
            Ok(Err(_)) | Err(_) => self.settle_unpromoted(token),
        }
    }

    /// Decide the fate of a waiter whose promotion signal never arrived.
    fn settle_unpromoted(&self, token: ConnectionToken) -> Result<AdmissionPermit, Rejection> {
        let (result, snapshot) = {
            let mut state = self.lock_state();
            let result = if state.queue.remove(&token).is_some() {
                state.stats.record_queued(-1);
                Err((state.reject(RejectReason::QueueTimeout), true))
            } else if state.registry.contains(&token) {
                // Promoted in the same instant the deadline fired.
                Ok(())
            } else {
                // Claimed and already counted by a release or by close().
                let reason = if state.closed {
                    RejectReason::ShuttingDown
                } else {
                    RejectReason::QueueTimeout
                };
                Err((
                    Rejection {
                        reason,
                        queue_depth: state.queue.len(),
                    },
                    false,
                ))
            };
            (result, state.stats.snapshot())
        };
        metrics::publish_snapshot(&snapshot);

        match result {
            Ok(()) => Ok(self.permit(token)),
            Err((rejection, counted_here)) => {
                tracing::warn!(
                    "Queued connection rejected: token={}, reason={}, queued={}",
                    token,
                    rejection.reason.as_str(),
                    rejection.queue_depth
                );
                if counted_here {
                    metrics::record_rejection(rejection.reason);
                }
                Err(rejection)
            }
        }
    }

    /// Release the slot held by `token` and promote the oldest live waiter.
    ///
    /// Unknown tokens (never admitted, or already released) are ignored and
    /// `false` is returned.
    pub fn release(&self, token: ConnectionToken) -> bool {
        let (released, snapshot) = {
            let mut state = self.lock_state();
            let released = state.release(&token, self.inner.max_concurrent);
            (released, state.stats.snapshot())
        };

        let Some((connection, promotions)) = released else {
            tracing::debug!("Release of unknown connection ignored: token={}", token);
            return false;
        };

        tracing::debug!(
            "Connection released: token={}, duration={:?}, active={}",
            token,
            connection.age(),
            snapshot.active_connections
        );
        metrics::record_response_time(connection.age());
        self.report_promotions(promotions, &snapshot);
        true
    }

    /// Withdraw a caller whose `acquire` future was dropped while queued.
    fn abandon(&self, token: ConnectionToken) {
        let (outcome, snapshot) = {
            let mut state = self.lock_state();
            let outcome = if state.queue.remove(&token).is_some() {
                state.stats.record_queued(-1);
                state.stats.record_rejection();
                Some(None)
            } else {
                state
                    .release(&token, self.inner.max_concurrent)
                    .map(|(_, promotions)| Some(promotions))
            };
            (outcome, state.stats.snapshot())
        };
        metrics::publish_snapshot(&snapshot);

        match outcome {
            Some(None) => {
                tracing::debug!("Queued connection cancelled: token={}", token);
                metrics::record_rejection(RejectReason::Cancelled);
            }
            Some(Some(promotions)) => {
                tracing::debug!(
                    "Connection promoted after its caller went away, released: token={}",
                    token
                );
                self.report_promotions(promotions, &snapshot);
            }
            None => {}
        }
    }

    fn report_promotions(&self, promotions: Promotions, snapshot: &MetricsSnapshot) {
        for (token, queue_wait) in &promotions.admitted {
            tracing::debug!(
                "Queued connection promoted: token={}, waited={:?}",
                token,
                queue_wait
            );
            metrics::record_admission(*queue_wait);
        }
        for _ in 0..promotions.expired {
            metrics::record_rejection(RejectReason::QueueTimeout);
        }
        for _ in 0..promotions.abandoned {
            metrics::record_rejection(RejectReason::Cancelled);
        }
        metrics::publish_snapshot(snapshot);
    }

    /// Stop admitting and reject everything still queued. Admitted
    /// connections keep their slots until released. Returns the number of
    /// waiters drained.
    pub fn close(&self) -> usize {
        let (drained, snapshot) = {
            let mut state = self.lock_state();
            state.closed = true;
            let drained = state.queue.drain();
            for _ in &drained {
                state.stats.record_queued(-1);
                state.stats.record_rejection();
            }
            (drained, state.stats.snapshot())
        };
        let count = drained.len();
        // Dropping the waiters wakes their callers.
        drop(drained);

        for _ in 0..count {
            metrics::record_rejection(RejectReason::ShuttingDown);
        }
        metrics::publish_snapshot(&snapshot);
        tracing::info!(
            "Admission controller closed: drained {} waiters, {} connections still active",
            count,
            snapshot.active_connections
        );
        count
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Consistent copy of the current counters.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.lock_state().stats.snapshot()
    }

    /// Look up an admitted connection.
    pub fn connection(&self, token: ConnectionToken) -> Option<Connection> {
        self.lock_state().registry.get(&token).cloned()
    }

    /// Number of registry entries; equals `active_connections` whenever no
    /// call is in flight.
    pub fn registry_len(&self) -> usize {
        self.lock_state().registry.len()
    }

    /// Number of waiters currently queued.
    pub fn queue_len(&self) -> usize {
        self.lock_state().queue.len()
    }

    fn permit(&self, token: ConnectionToken) -> AdmissionPermit {
        AdmissionPermit {
            controller: self.clone(),
            token,
        }
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    // Roughly thirty years: effectively "wait forever" without overflowing.
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365 * 30))
}

/// Withdraws a queued caller if its `acquire` future is dropped mid-wait.
struct PendingWaiter<'a> {
    controller: &'a AdmissionController,
    token: ConnectionToken,
    armed: bool,
}

impl PendingWaiter<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingWaiter<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.controller.abandon(self.token);
        }
    }
}

/// A granted slot. Dropping it releases the slot, so the release happens on
/// every exit path of the guarded work, including panics and cancellation.
#[must_use = "dropping the permit releases the slot immediately"]
#[derive(Debug)]
pub struct AdmissionPermit {
    controller: AdmissionController,
    token: ConnectionToken,
}

impl AdmissionPermit {
    pub fn token(&self) -> ConnectionToken {
        self.token
    }

    /// The connection record this permit holds.
    pub fn connection(&self) -> Option<Connection> {
        self.controller.connection(self.token)
    }

    /// Release explicitly instead of waiting for drop.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.release(self.token);
    }
}
