//! Per-node connection pool.
//!
//! Idle tubes are cached LIFO so hot connections stay hot. Dials are
//! bounded by a gate of `max_concurrent_conn_attempts` permits; acquirers
//! beyond the gate wait for a completed dial or a returned tube, with
//! control-plane acquirers served first. A pool session fences tubes across
//! `close`: a tube returned under an older session is closed, never cached.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use kestrel_common::{KestrelError, KestrelResult};
use kestrel_observability as obs;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Semaphore};

use crate::tube::{default_dialer, unix_now, DialFn, Tube};

/// Default dial gate width.
pub const DEFAULT_MAX_CONCURRENT_CONN_ATTEMPTS: usize = 10;

#[derive(Clone)]
pub struct TubePoolOptions {
    pub max_concurrent_conn_attempts: usize,
    pub dial: DialFn,
}

impl Default for TubePoolOptions {
    fn default() -> TubePoolOptions {
        TubePoolOptions {
            max_concurrent_conn_attempts: DEFAULT_MAX_CONCURRENT_CONN_ATTEMPTS,
            dial: default_dialer(),
        }
    }
}

type Waiter = oneshot::Sender<KestrelResult<Tube>>;

struct PoolState {
    idle: Vec<Tube>,
    session: u64,
    closed: bool,
    high_waiters: VecDeque<Waiter>,
    waiters: VecDeque<Waiter>,
}

impl PoolState {
    fn next_waiter(&mut self) -> Option<Waiter> {
        self.high_waiters
            .pop_front()
            .or_else(|| self.waiters.pop_front())
    }

    fn has_waiters(&self) -> bool {
        !self.high_waiters.is_empty() || !self.waiters.is_empty()
    }
}

struct PoolInner {
    endpoint: String,
    dial: DialFn,
    gate: Arc<Semaphore>,
    gate_width: usize,
    state: Mutex<PoolState>,
}

#[derive(Clone)]
pub struct TubePool {
    inner: Arc<PoolInner>,
}

impl TubePool {
    pub fn new(endpoint: impl Into<String>, options: TubePoolOptions) -> TubePool {
        let width = options.max_concurrent_conn_attempts.max(1);
        TubePool {
            inner: Arc::new(PoolInner {
                endpoint: endpoint.into(),
                dial: options.dial,
                gate: Arc::new(Semaphore::new(width)),
                gate_width: width,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    session: 0,
                    closed: false,
                    high_waiters: VecDeque::new(),
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Number of cached idle tubes.
    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Acquire exclusive ownership of a tube, dialing if none is cached.
    ///
    /// Dropping the returned future unregisters the waiter; an in-flight
    /// dial continues and its tube is cached for the next acquirer.
    pub async fn acquire(&self, high_priority: bool) -> KestrelResult<Tube> {
        let rx = {
            let mut st = self.inner.state.lock();
            if st.closed {
                return Err(KestrelError::PoolClosed);
            }
            if let Some(mut tube) = st.idle.pop() {
                obs::record_idle_connections(st.idle.len());
                tube.touch();
                return Ok(tube);
            }
            let (tx, rx) = oneshot::channel();
            if high_priority {
                st.high_waiters.push_back(tx);
            } else {
                st.waiters.push_back(tx);
            }
            rx
        };
        Self::maybe_spawn_dial(&self.inner);

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(KestrelError::PoolClosed),
        }
    }

    /// Start one dial if a gate permit is free. Non-blocking.
    fn maybe_spawn_dial(inner: &Arc<PoolInner>) {
        let Ok(permit) = Arc::clone(&inner.gate).try_acquire_owned() else {
            return;
        };
        let session = {
            let st = inner.state.lock();
            if st.closed {
                return;
            }
            st.session
        };
        obs::record_connection_attempts(inner.gate_width - inner.gate.available_permits());
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let result = (inner.dial)(inner.endpoint.clone()).await;
            drop(permit);
            obs::record_connection_attempts(inner.gate_width - inner.gate.available_permits());
            match result {
                Ok(conn) => {
                    obs::record_connection_created();
                    Self::deliver_tube(&inner, Tube::new(conn, session));
                }
                Err(e) => Self::deliver_error(&inner, KestrelError::Io(e)),
            }
        });
    }

    /// Hand a tube to the oldest live waiter (control-plane first), or cache
    /// it. Closes the tube instead when the pool is closed or the tube's
    /// session is stale. Waiters left behind a handoff get a fresh dial
    /// attempt: the receiver may never return the tube.
    fn deliver_tube(inner: &Arc<PoolInner>, tube: Tube) {
        let mut tube = tube;
        let redial = {
            let mut st = inner.state.lock();
            if st.closed || tube.session() != st.session {
                drop(st);
                obs::record_connection_closed(obs::CloseReason::Session);
                tokio::spawn(tube.close());
                return;
            }
            loop {
                let Some(waiter) = st.next_waiter() else {
                    tube.touch();
                    st.idle.push(tube);
                    obs::record_idle_connections(st.idle.len());
                    break false;
                };
                match waiter.send(Ok(tube)) {
                    Ok(()) => break st.has_waiters(),
                    // the waiter gave up; try the next one
                    Err(Ok(t)) => tube = t,
                    Err(Err(_)) => unreachable!("sent Ok"),
                }
            }
        };
        if redial {
            Self::maybe_spawn_dial(inner);
        }
    }

    /// Hand a dial failure to the oldest live waiter. Waiters left behind
    /// get a fresh dial attempt so the queue cannot strand.
    fn deliver_error(inner: &Arc<PoolInner>, err: KestrelError) {
        let mut err = err;
        let redial = {
            let mut st = inner.state.lock();
            loop {
                let Some(waiter) = st.next_waiter() else {
                    tracing::debug!(
                        endpoint = %inner.endpoint,
                        error = %err,
                        "dial failed with no waiters"
                    );
                    break false;
                };
                match waiter.send(Err(err)) {
                    Ok(()) => break st.has_waiters(),
                    Err(Err(e)) => err = e,
                    Err(Ok(_)) => unreachable!("sent Err"),
                }
            }
        };
        if redial {
            Self::maybe_spawn_dial(inner);
        }
    }

    /// Return a tube for reuse.
    pub fn put(&self, tube: Tube) {
        Self::deliver_tube(&self.inner, tube);
    }

    /// Close a tube whose stream state is unknown. Waiters relying on this
    /// tube's return get a fresh dial attempt instead.
    pub async fn discard(&self, tube: Tube) {
        obs::record_connection_closed(obs::CloseReason::Error);
        tube.close().await;
        if self.inner.state.lock().has_waiters() {
            Self::maybe_spawn_dial(&self.inner);
        }
    }

    /// Close idle tubes that have not been used within `max_idle_age`.
    pub async fn reap_idle_connections(&self, max_idle_age: Duration) {
        let cutoff = unix_now() - max_idle_age.as_secs() as i64;
        let expired: Vec<Tube> = {
            let mut st = self.inner.state.lock();
            let (keep, expired) = std::mem::take(&mut st.idle)
                .into_iter()
                .partition(|t| t.last_used_unix() >= cutoff);
            st.idle = keep;
            obs::record_idle_connections(st.idle.len());
            expired
        };
        for tube in expired {
            obs::record_connection_closed(obs::CloseReason::Idle);
            tube.close().await;
        }
    }

    /// Close the pool: bump the session, drain the idle stack and wake every
    /// pending acquirer with a closed-pool error. Safe to call repeatedly.
    pub async fn close(&self) {
        let (tubes, waiters) = {
            let mut st = self.inner.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.session += 1;
            let tubes = std::mem::take(&mut st.idle);
            let mut waiters: Vec<Waiter> = st.high_waiters.drain(..).collect();
            waiters.extend(st.waiters.drain(..));
            obs::record_idle_connections(0);
            (tubes, waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Err(KestrelError::PoolClosed));
        }
        for tube in tubes {
            obs::record_connection_closed(obs::CloseReason::Session);
            tube.close().await;
        }
    }

    #[cfg(test)]
    fn age_idle_tubes(&self, by_secs: i64) {
        let mut st = self.inner.state.lock();
        for tube in st.idle.iter_mut() {
            tube.set_last_used_unix(tube.last_used_unix() - by_secs);
        }
    }
}
