//! Connection Pool
//!
//! A bounded set of reusable backend connections with a ceiling that the
//! scaling controller moves at runtime.
//!
//! All bookkeeping (`idle`, `active`, `waiting`, `current_max`) lives in one
//! mutex-guarded `PoolState`; every acquire/release mutation is a single
//! critical section. Waiters park on a [`Notify`] and re-check the state when
//! woken. Invariant: `idle + active == total` and, outside of a pending
//! scale-down, `total <= current_max`. `active` includes connections that are
//! still being opened.

mod manager;
mod postgres;

pub use manager::ConnectionManager;
pub use postgres::{PgConnection, PgManager};

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use medrota_core::HealthStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use crate::config::PoolConfig;
use crate::constants::WAIT_TIME_WINDOW;
use crate::error::{DbError, DbResult};
use crate::scaling::{PoolSample, ScalablePool};
use crate::telemetry::metrics::with_metrics;

// ============================================================================
// METRICS
// ============================================================================

/// Point-in-time view of the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    pub waiting: usize,
    pub min_connections: usize,
    pub max_connections: usize,
    /// `active / total`, 0 when the pool is empty
    pub utilization: f64,
    /// Mean acquire wait over the recent window
    pub avg_wait_ms: f64,
    /// 95th percentile acquire wait over the recent window
    pub p95_wait_ms: f64,
    pub acquired: u64,
    pub timeouts: u64,
    pub created: u64,
    pub destroyed: u64,
    pub closed: bool,
}

/// Result of [`Pool::health_check`]. Failures are reported here, never raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolHealth {
    pub healthy: bool,
    pub status: HealthStatus,
    pub latency_ms: u64,
    pub metrics: PoolMetrics,
    pub error: Option<String>,
}

// ============================================================================
// STATE
// ============================================================================

struct Slot<C> {
    conn: C,
    uses: u64,
    idle_since: Instant,
}

impl<C> Slot<C> {
    fn new(conn: C) -> Self {
        Self {
            conn,
            uses: 0,
            idle_since: Instant::now(),
        }
    }
}

struct PoolState<C> {
    idle: VecDeque<Slot<C>>,
    active: usize,
    waiting: usize,
    current_max: usize,
    closed: bool,
    wait_times: VecDeque<Duration>,
    acquired: u64,
    timeouts: u64,
    created: u64,
    destroyed: u64,
}

impl<C> PoolState<C> {
    fn total(&self) -> usize {
        self.idle.len() + self.active
    }

    fn utilization(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.active as f64 / total as f64,
        }
    }

    fn record_wait(&mut self, waited: Duration) {
        if self.wait_times.len() == WAIT_TIME_WINDOW {
            self.wait_times.pop_front();
        }
        self.wait_times.push_back(waited);
    }

    fn wait_stats_ms(&self) -> (f64, f64) {
        if self.wait_times.is_empty() {
            return (0.0, 0.0);
        }
        let mut sorted: Vec<f64> = self
            .wait_times
            .iter()
            .map(|d| d.as_secs_f64() * 1000.0)
            .collect();
        sorted.sort_by(f64::total_cmp);
        let avg = sorted.iter().sum::<f64>() / sorted.len() as f64;
        let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
        let p95 = sorted[rank.saturating_sub(1).min(sorted.len() - 1)];
        (avg, p95)
    }
}

struct PoolInner<M: ConnectionManager> {
    manager: M,
    config: PoolConfig,
    state: Mutex<PoolState<M::Connection>>,
    notify: Notify,
}

impl<M: ConnectionManager> PoolInner<M> {
    fn lock(&self) -> MutexGuard<'_, PoolState<M::Connection>> {
        // No critical section can panic halfway through a mutation.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn open(&self) -> DbResult<M::Connection> {
        let mut conn = self.manager.connect().await?;
        self.manager
            .apply_session_guards(&mut conn, &self.config.session_guards)
            .await?;
        self.lock().created += 1;
        with_metrics(|m| m.record_connection_event("created"));
        tracing::debug!("Opened pooled connection");
        Ok(conn)
    }

    fn release_slot(&self, mut slot: Slot<M::Connection>, broken: bool) {
        let destroyed = {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
            let reason = if state.closed {
                Some("closed")
            } else if broken || self.manager.is_broken(&slot.conn) {
                Some("broken")
            } else if slot.uses >= self.config.max_uses {
                Some("max_uses")
            } else if state.total() >= state.current_max {
                Some("over_max")
            } else {
                None
            };
            match reason {
                None => {
                    slot.idle_since = Instant::now();
                    state.idle.push_back(slot);
                    None
                }
                Some(reason) => {
                    state.destroyed += 1;
                    Some((reason, slot))
                }
            }
        };

        if let Some((reason, slot)) = destroyed {
            let uses = slot.uses;
            drop(slot);
            with_metrics(|m| m.record_connection_event(reason));
            tracing::debug!(reason, uses, "Destroyed pooled connection on release");
        }
        self.notify.notify_one();
    }

    fn discard_reserved(&self, conn: M::Connection, reason: &'static str) {
        {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
            state.destroyed += 1;
        }
        drop(conn);
        with_metrics(|m| m.record_connection_event(reason));
        self.notify.notify_one();
    }
}

/// Counts the caller in `waiting` until dropped or unregistered.
struct WaitRegistration<'a, M: ConnectionManager> {
    inner: &'a PoolInner<M>,
    registered: bool,
}

impl<M: ConnectionManager> WaitRegistration<'_, M> {
    fn register(&mut self, state: &mut PoolState<M::Connection>) {
        if !self.registered {
            state.waiting += 1;
            self.registered = true;
        }
    }

    fn unregister(&mut self, state: &mut PoolState<M::Connection>) {
        if self.registered {
            state.waiting = state.waiting.saturating_sub(1);
            self.registered = false;
        }
    }
}

impl<M: ConnectionManager> Drop for WaitRegistration<'_, M> {
    fn drop(&mut self) {
        if self.registered {
            let mut state = self.inner.lock();
            state.waiting = state.waiting.saturating_sub(1);
        }
    }
}

/// A slot counted in `active` for a connection that is still being opened.
/// Released again if the open fails or the future is dropped.
struct Reservation<'a, M: ConnectionManager> {
    inner: &'a PoolInner<M>,
    armed: bool,
}

impl<M: ConnectionManager> Reservation<'_, M> {
    fn commit(mut self) {
        self.armed = false;
    }
}

impl<M: ConnectionManager> Drop for Reservation<'_, M> {
    fn drop(&mut self) {
        if self.armed {
            {
                let mut state = self.inner.lock();
                state.active = state.active.saturating_sub(1);
            }
            self.inner.notify.notify_one();
        }
    }
}

enum Step<C> {
    Reuse(Slot<C>),
    Open,
    Wait,
}

// ============================================================================
// POOL
// ============================================================================

/// Bounded, self-scaling connection pool.
///
/// Construction never connects; connections are opened by the first
/// `acquire()` or by [`Pool::ensure_min`].
pub struct Pool<M: ConnectionManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ConnectionManager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ConnectionManager> std::fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl<M: ConnectionManager> Pool<M> {
    pub fn new(manager: M, config: PoolConfig) -> DbResult<Self> {
        config.validate()?;
        with_metrics(|m| m.set_pool_max(config.max_connections));
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_connections),
            active: 0,
            waiting: 0,
            current_max: config.max_connections,
            closed: false,
            wait_times: VecDeque::with_capacity(WAIT_TIME_WINDOW),
            acquired: 0,
            timeouts: 0,
            created: 0,
            destroyed: 0,
        };
        Ok(Self {
            inner: Arc::new(PoolInner {
                manager,
                config,
                state: Mutex::new(state),
                notify: Notify::new(),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Borrow an exclusively owned connection, waiting up to
    /// `connection_timeout` when the pool is exhausted.
    pub async fn acquire(&self) -> DbResult<PooledConnection<M>> {
        let start = Instant::now();
        let deadline = start + self.inner.config.connection_timeout;
        let mut registration = WaitRegistration {
            inner: &self.inner,
            registered: false,
        };

        loop {
            // Registered before inspecting the state so a release between the
            // check and the await is not missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut state = self.inner.lock();
                if state.closed {
                    registration.unregister(&mut state);
                    return Err(DbError::PoolClosed);
                }
                if let Some(slot) = state.idle.pop_back() {
                    state.active += 1;
                    registration.unregister(&mut state);
                    Step::Reuse(slot)
                } else if state.total() < state.current_max {
                    state.active += 1;
                    registration.unregister(&mut state);
                    Step::Open
                } else {
                    registration.register(&mut state);
                    Step::Wait
                }
            };

            match step {
                Step::Reuse(slot) => {
                    if self.inner.manager.is_broken(&slot.conn) {
                        tracing::debug!("Evicted broken idle connection");
                        self.inner.discard_reserved(slot.conn, "broken");
                        continue;
                    }
                    return Ok(self.checkout(slot, start));
                }
                Step::Open => {
                    let reservation = Reservation {
                        inner: &self.inner,
                        armed: true,
                    };
                    return match timeout_at(deadline, self.inner.open()).await {
                        Ok(Ok(conn)) => {
                            reservation.commit();
                            Ok(self.checkout(Slot::new(conn), start))
                        }
                        Ok(Err(err)) => {
                            tracing::warn!(error = %err, "Failed to open pooled connection");
                            Err(err)
                        }
                        Err(_) => {
                            drop(reservation);
                            Err(self.timed_out(start))
                        }
                    };
                }
                Step::Wait => {
                    if timeout_at(deadline, notified).await.is_err() {
                        {
                            let mut state = self.inner.lock();
                            registration.unregister(&mut state);
                        }
                        return Err(self.timed_out(start));
                    }
                }
            }
        }
    }

    fn checkout(&self, mut slot: Slot<M::Connection>, start: Instant) -> PooledConnection<M> {
        slot.uses += 1;
        let waited = start.elapsed();
        {
            let mut state = self.inner.lock();
            state.acquired += 1;
            state.record_wait(waited);
        }
        with_metrics(|m| m.record_acquire(true, waited.as_secs_f64()));
        PooledConnection {
            slot: Some(slot),
            pool: self.clone(),
            broken: false,
        }
    }

    fn timed_out(&self, start: Instant) -> DbError {
        let waited = start.elapsed();
        let (max_connections, waiting) = {
            let mut state = self.inner.lock();
            state.timeouts += 1;
            state.record_wait(waited);
            (state.current_max, state.waiting)
        };
        with_metrics(|m| m.record_acquire(false, waited.as_secs_f64()));
        tracing::warn!(
            waited_ms = waited.as_millis() as u64,
            max_connections,
            waiting,
            "Timed out waiting for a pooled connection"
        );
        DbError::AcquireTimeout {
            waited,
            max_connections,
        }
    }

    /// Return a connection to the pool. Equivalent to dropping it.
    pub fn release(&self, conn: PooledConnection<M>) {
        drop(conn);
    }

    /// Acquire, ping and release. Never fails; problems are reported in the
    /// returned value.
    pub async fn health_check(&self) -> PoolHealth {
        let start = Instant::now();
        let result = match self.acquire().await {
            Ok(mut conn) => {
                let outcome = self.inner.manager.ping(&mut conn).await;
                if matches!(&outcome, Err(e) if e.is_connection_fatal()) {
                    conn.mark_broken();
                }
                outcome
            }
            Err(err) => Err(err),
        };
        let latency_ms = start.elapsed().as_millis() as u64;
        let metrics = self.metrics();

        match result {
            Ok(()) => PoolHealth {
                healthy: true,
                status: HealthStatus::from_probe(true, metrics.waiting),
                latency_ms,
                metrics,
                error: None,
            },
            Err(err) => {
                tracing::warn!(error = %err, latency_ms, "Pool health check failed");
                PoolHealth {
                    healthy: false,
                    status: HealthStatus::from_probe(false, metrics.waiting),
                    latency_ms,
                    metrics,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    pub fn metrics(&self) -> PoolMetrics {
        let state = self.inner.lock();
        let (avg_wait_ms, p95_wait_ms) = state.wait_stats_ms();
        PoolMetrics {
            total: state.total(),
            idle: state.idle.len(),
            active: state.active,
            waiting: state.waiting,
            min_connections: self.inner.config.min_connections,
            max_connections: state.current_max,
            utilization: state.utilization(),
            avg_wait_ms,
            p95_wait_ms,
            acquired: state.acquired,
            timeouts: state.timeouts,
            created: state.created,
            destroyed: state.destroyed,
            closed: state.closed,
        }
    }

    /// `active / total`, 0 when the pool holds no connections.
    pub fn utilization(&self) -> f64 {
        self.inner.lock().utilization()
    }

    pub fn max_connections(&self) -> usize {
        self.inner.lock().current_max
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Open connections until the pool holds at least `min_connections`.
    /// Returns how many were opened.
    pub async fn ensure_min(&self) -> DbResult<usize> {
        let mut opened = 0;
        loop {
            {
                let mut state = self.inner.lock();
                if state.closed {
                    return Err(DbError::PoolClosed);
                }
                let target = self.inner.config.min_connections.min(state.current_max);
                if state.total() >= target {
                    break;
                }
                state.active += 1;
            }
            let reservation = Reservation {
                inner: &self.inner,
                armed: true,
            };
            let conn = self.inner.open().await?;
            reservation.commit();
            self.inner.release_slot(Slot::new(conn), false);
            opened += 1;
        }
        if opened > 0 {
            tracing::debug!(opened, "Warmed pool to minimum size");
        }
        Ok(opened)
    }

    /// Destroy idle connections older than `idle_timeout` without dropping
    /// below `min_connections`. Broken idle connections are always evicted.
    pub fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.inner.config.idle_timeout;
        let min = self.inner.config.min_connections;

        let reaped = {
            let mut state = self.inner.lock();
            let mut kept = VecDeque::with_capacity(state.idle.len());
            let mut reaped = Vec::new();
            // Oldest first.
            while let Some(slot) = state.idle.pop_front() {
                let total = state.idle.len() + kept.len() + state.active + 1;
                let expired = now.saturating_duration_since(slot.idle_since) >= idle_timeout;
                if self.inner.manager.is_broken(&slot.conn) || (expired && total > min) {
                    reaped.push(slot);
                } else {
                    kept.push_back(slot);
                }
            }
            state.idle = kept;
            state.destroyed += reaped.len() as u64;
            reaped
        };

        let count = reaped.len();
        drop(reaped);
        if count > 0 {
            with_metrics(|m| {
                for _ in 0..count {
                    m.record_connection_event("idle");
                }
            });
            tracing::debug!(count, "Reaped idle connections");
            self.inner.notify.notify_one();
        }
        count
    }

    /// Change the ceiling and return the value applied. Values below
    /// `min_connections` are raised to it. Excess connections are reclaimed
    /// as they are released.
    pub fn set_max_connections(&self, max: usize) -> DbResult<usize> {
        let max = max.max(self.inner.config.min_connections).max(1);
        let previous = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(DbError::PoolClosed);
            }
            std::mem::replace(&mut state.current_max, max)
        };
        with_metrics(|m| m.set_pool_max(max));
        if max > previous {
            self.inner.notify.notify_waiters();
        }
        Ok(max)
    }

    /// Shut the pool down: idle connections are destroyed, waiters fail with
    /// [`DbError::PoolClosed`], and loaned connections are destroyed when
    /// they come back.
    pub fn close(&self) {
        let drained: Vec<_> = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.destroyed += state.idle.len() as u64;
            state.idle.drain(..).collect()
        };
        let closed = drained.len();
        drop(drained);
        self.inner.notify.notify_waiters();
        tracing::info!(closed, "Connection pool closed");
    }
}

impl<M: ConnectionManager> ScalablePool for Pool<M> {
    fn sample(&self) -> PoolSample {
        let state = self.inner.lock();
        let (avg_wait_ms, _) = state.wait_stats_ms();
        PoolSample {
            utilization: state.utilization(),
            waiting: state.waiting,
            active: state.active,
            total: state.total(),
            current_max: state.current_max,
            avg_wait: Duration::from_secs_f64(avg_wait_ms / 1000.0),
        }
    }

    fn set_max_connections(&self, max: usize) -> DbResult<usize> {
        Pool::set_max_connections(self, max)
    }
}

// ============================================================================
// POOLED CONNECTION GUARD
// ============================================================================

/// Exclusive loan of a pooled connection. Dropping it releases the
/// connection back to the pool.
pub struct PooledConnection<M: ConnectionManager> {
    slot: Option<Slot<M::Connection>>,
    pool: Pool<M>,
    broken: bool,
}

impl<M: ConnectionManager> PooledConnection<M> {
    /// Report a transport failure; the connection is evicted on release.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Number of times this connection has been loaned, including this one.
    pub fn uses(&self) -> u64 {
        self.slot.as_ref().map(|s| s.uses).unwrap_or(0)
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        match &self.slot {
            Some(slot) => &slot.conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.slot {
            Some(slot) => &mut slot.conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<M: ConnectionManager> std::fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("uses", &self.uses())
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.inner.release_slot(slot, self.broken);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionGuards;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingManager {
        connects: AtomicUsize,
        guards_applied: AtomicUsize,
        fail_connect: AtomicBool,
        fail_ping: AtomicBool,
    }

    struct FakeConn {
        id: usize,
        dead: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ConnectionManager for Arc<CountingManager> {
        type Connection = FakeConn;

        async fn connect(&self) -> DbResult<FakeConn> {
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(DbError::connection("refused"));
            }
            let id = self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(FakeConn {
                id,
                dead: Arc::new(AtomicBool::new(false)),
            })
        }

        async fn apply_session_guards(
            &self,
            _conn: &mut FakeConn,
            _guards: &SessionGuards,
        ) -> DbResult<()> {
            self.guards_applied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn ping(&self, _conn: &mut FakeConn) -> DbResult<()> {
            if self.fail_ping.load(Ordering::SeqCst) {
                return Err(DbError::connection("reset by peer"));
            }
            Ok(())
        }

        fn is_broken(&self, conn: &FakeConn) -> bool {
            conn.dead.load(Ordering::SeqCst)
        }
    }

    fn pool(min: usize, max: usize) -> (Pool<Arc<CountingManager>>, Arc<CountingManager>) {
        let manager = Arc::new(CountingManager::default());
        let config = PoolConfig::default()
            .with_bounds(min, max)
            .with_connection_timeout(Duration::from_millis(500))
            .with_idle_timeout(Duration::from_secs(30));
        (Pool::new(Arc::clone(&manager), config).unwrap(), manager)
    }

    fn assert_invariant(pool: &Pool<Arc<CountingManager>>) {
        let m = pool.metrics();
        assert_eq!(m.idle + m.active, m.total);
        assert!(m.total <= m.max_connections);
    }

    #[tokio::test]
    async fn test_construction_does_not_connect() {
        let (pool, manager) = pool(2, 5);
        assert_eq!(manager.connects.load(Ordering::SeqCst), 0);
        assert_eq!(pool.metrics().total, 0);
        assert_eq!(pool.utilization(), 0.0);
    }

    #[tokio::test]
    async fn test_acquire_reuses_released_connection() {
        let (pool, manager) = pool(0, 5);
        let first_id = {
            let conn = pool.acquire().await.unwrap();
            conn.id
        };
        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id, first_id);
        assert_eq!(conn.uses(), 2);
        assert_eq!(manager.connects.load(Ordering::SeqCst), 1);
        assert_eq!(manager.guards_applied.load(Ordering::SeqCst), 1);
        assert_invariant(&pool);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_pool_times_out() {
        let (pool, _) = pool(0, 2);
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        match err {
            DbError::AcquireTimeout {
                waited,
                max_connections,
            } => {
                assert!(waited >= Duration::from_millis(500));
                assert_eq!(max_connections, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let metrics = pool.metrics();
        assert_eq!(metrics.timeouts, 1);
        assert_eq!(metrics.waiting, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_is_served_by_release() {
        let (pool, _) = pool(0, 1);
        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|c| c.id) })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.metrics().waiting, 1);
        let held_id = held.id;
        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), held_id);
        assert_eq!(pool.metrics().waiting, 0);
    }

    #[tokio::test]
    async fn test_max_uses_recycles_connection() {
        let manager = Arc::new(CountingManager::default());
        let config = PoolConfig::default().with_bounds(0, 2).with_max_uses(2);
        let pool = Pool::new(Arc::clone(&manager), config).unwrap();

        for _ in 0..2 {
            drop(pool.acquire().await.unwrap());
        }
        assert_eq!(pool.metrics().total, 0);
        assert_eq!(pool.metrics().destroyed, 1);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id, 1);
        assert_eq!(manager.guards_applied.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_marked_broken_connection_is_evicted() {
        let (pool, _) = pool(0, 3);
        let mut conn = pool.acquire().await.unwrap();
        conn.mark_broken();
        pool.release(conn);
        let metrics = pool.metrics();
        assert_eq!(metrics.total, 0);
        assert_eq!(metrics.destroyed, 1);
    }

    #[tokio::test]
    async fn test_dead_idle_connection_is_skipped_on_acquire() {
        let (pool, _) = pool(0, 3);
        let dead = {
            let conn = pool.acquire().await.unwrap();
            Arc::clone(&conn.dead)
        };
        dead.store(true, Ordering::SeqCst);
        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id, 1);
        assert_invariant(&pool);
    }

    #[tokio::test]
    async fn test_failed_connect_releases_reservation() {
        let (pool, manager) = pool(0, 1);
        manager.fail_connect.store(true, Ordering::SeqCst);
        assert!(matches!(
            pool.acquire().await,
            Err(DbError::Connection { .. })
        ));
        let metrics = pool.metrics();
        assert_eq!(metrics.total, 0);
        assert_eq!(metrics.active, 0);

        manager.fail_connect.store(false, Ordering::SeqCst);
        pool.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn test_scale_down_reclaims_on_release() {
        let (pool, _) = pool(1, 4);
        let conns: Vec<_> = futures_util::future::try_join_all((0..4).map(|_| pool.acquire()))
            .await
            .unwrap();
        pool.set_max_connections(2).unwrap();
        drop(conns);
        let metrics = pool.metrics();
        assert_eq!(metrics.total, 2);
        assert_eq!(metrics.max_connections, 2);
        assert_invariant(&pool);
    }

    #[tokio::test]
    async fn test_set_max_never_drops_below_min() {
        let (pool, _) = pool(3, 10);
        assert_eq!(pool.set_max_connections(1).unwrap(), 3);
        assert_eq!(pool.max_connections(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_idle_respects_min() {
        let (pool, _) = pool(1, 5);
        let conns: Vec<_> = futures_util::future::try_join_all((0..3).map(|_| pool.acquire()))
            .await
            .unwrap();
        drop(conns);
        assert_eq!(pool.reap_idle(), 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(pool.reap_idle(), 2);
        assert_eq!(pool.metrics().total, 1);
    }

    #[tokio::test]
    async fn test_ensure_min_warms_pool() {
        let (pool, manager) = pool(3, 5);
        assert_eq!(pool.ensure_min().await.unwrap(), 3);
        assert_eq!(pool.ensure_min().await.unwrap(), 0);
        let metrics = pool.metrics();
        assert_eq!(metrics.idle, 3);
        assert_eq!(manager.guards_applied.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_fails_waiters_and_destroys_loans() {
        let (pool, _) = pool(0, 1);
        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.close();
        assert!(matches!(waiter.await.unwrap(), Err(DbError::PoolClosed)));

        drop(held);
        assert_eq!(pool.metrics().total, 0);
        assert!(matches!(pool.acquire().await, Err(DbError::PoolClosed)));
        assert!(pool.set_max_connections(5).is_err());
    }

    #[tokio::test]
    async fn test_health_check_reports_instead_of_failing() {
        let (pool, manager) = pool(0, 2);
        let health = pool.health_check().await;
        assert!(health.healthy);
        assert_eq!(health.status, HealthStatus::Healthy);

        manager.fail_ping.store(true, Ordering::SeqCst);
        let health = pool.health_check().await;
        assert!(!health.healthy);
        assert!(health.error.is_some());
        // The connection that failed the ping is evicted.
        assert_eq!(health.metrics.total, 0);
        assert_eq!(health.status, HealthStatus::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_time_statistics() {
        let (pool, _) = pool(0, 1);
        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(held);
        waiter.await.unwrap().unwrap();

        let metrics = pool.metrics();
        assert_eq!(metrics.acquired, 2);
        assert!(metrics.p95_wait_ms >= 200.0);
        assert!(metrics.avg_wait_ms >= 100.0);
    }
}
