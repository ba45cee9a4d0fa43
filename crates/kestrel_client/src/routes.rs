//! Route selection and fail-open management.
//!
//! The route manager serves round-robin picks over the active node clients
//! and may evict routes reported unhealthy. To avoid cascading eviction it
//! tracks removal times: three consecutive removals inside a short window
//! disable the manager for a cooling-off period, during which membership
//! mutations are ignored and whatever routes remain keep serving. A one-shot
//! timer then rebuilds the routes from the live active map and re-enables.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use kestrel_observability as obs;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::node::NodeApi;

/// Removals within a window of this many consecutive events trigger the
/// fail-open state.
const FAIL_OPEN_REMOVAL_COUNT: usize = 3;

/// Supplies the authoritative route set when the manager re-enables.
pub trait RouteSource: Send + Sync {
    fn current_routes(&self) -> Vec<Arc<dyn NodeApi>>;
}

struct RouteState {
    is_enabled: bool,
    routes: Vec<Arc<dyn NodeApi>>,
    next_index: usize,
    fail_open_times: VecDeque<Instant>,
    timer: Option<JoinHandle<()>>,
}

struct RouteManagerInner {
    management_enabled: bool,
    disable_duration: Duration,
    fail_open_window: Duration,
    source: Mutex<Option<Weak<dyn RouteSource>>>,
    state: Mutex<RouteState>,
}

#[derive(Clone)]
pub struct RouteManager {
    inner: Arc<RouteManagerInner>,
}

impl RouteManager {
    /// `management_enabled` controls whether add/remove mutations do
    /// anything at all; selection always works off the routes set by the
    /// cluster.
    pub fn new(
        management_enabled: bool,
        disable_duration: Duration,
        fail_open_window: Duration,
    ) -> RouteManager {
        RouteManager {
            inner: Arc::new(RouteManagerInner {
                management_enabled,
                disable_duration,
                fail_open_window,
                source: Mutex::new(None),
                state: Mutex::new(RouteState {
                    is_enabled: management_enabled,
                    routes: Vec::new(),
                    next_index: 0,
                    fail_open_times: VecDeque::new(),
                    timer: None,
                }),
            }),
        }
    }

    /// Install the authority consulted when the manager re-enables.
    pub fn set_source(&self, source: Weak<dyn RouteSource>) {
        *self.inner.source.lock() = Some(source);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.state.lock().is_enabled
    }

    /// Replace the full route set. Applied even while fail-open: the cluster
    /// roster is authoritative.
    pub fn set_routes(&self, routes: Vec<Arc<dyn NodeApi>>) {
        let mut st = self.inner.state.lock();
        st.routes = routes;
        st.next_index = 0;
    }

    pub fn route_count(&self) -> usize {
        self.inner.state.lock().routes.len()
    }

    pub fn all_routes(&self) -> Vec<Arc<dyn NodeApi>> {
        self.inner.state.lock().routes.clone()
    }

    /// The next route in round-robin order, avoiding `prev` when another
    /// choice exists. Returns `None` when no routes are recorded.
    pub fn get_route(&self, prev: Option<&Arc<dyn NodeApi>>) -> Option<Arc<dyn NodeApi>> {
        let mut st = self.inner.state.lock();
        if st.routes.is_empty() {
            return None;
        }
        let len = st.routes.len();
        let idx = st.next_index % len;
        let mut pick = Arc::clone(&st.routes[idx]);
        st.next_index = idx + 1;
        if let Some(prev) = prev {
            if len > 1 && Arc::ptr_eq(&pick, prev) {
                let idx = st.next_index % len;
                pick = Arc::clone(&st.routes[idx]);
                st.next_index = idx + 1;
            }
        }
        Some(pick)
    }

    /// Add a recovered route back. No-op while disabled.
    pub fn add_route(&self, endpoint: &str, route: Arc<dyn NodeApi>) {
        let mut st = self.inner.state.lock();
        if !st.is_enabled {
            return;
        }
        if st.routes.iter().any(|r| Arc::ptr_eq(r, &route)) {
            return;
        }
        st.routes.push(route);
        obs::record_route_added();
        tracing::debug!(endpoint, routes = st.routes.len(), "route added");
    }

    /// Remove an unhealthy route and record the removal time; three
    /// consecutive removals within the window disable the manager. No-op
    /// while disabled.
    pub fn remove_route(&self, endpoint: &str, route: Arc<dyn NodeApi>) {
        let mut st = self.inner.state.lock();
        if !st.is_enabled {
            return;
        }
        if let Some(pos) = st.routes.iter().position(|r| Arc::ptr_eq(r, &route)) {
            st.routes.remove(pos);
            if st.next_index > pos {
                st.next_index -= 1;
            }
            obs::record_route_removed();
            tracing::debug!(endpoint, routes = st.routes.len(), "route removed");
        }

        let now = Instant::now();
        st.fail_open_times.push_back(now);
        while st.fail_open_times.len() > FAIL_OPEN_REMOVAL_COUNT {
            st.fail_open_times.pop_front();
        }
        self.verify_and_disable(&mut st, now);
    }

    /// Disable the manager when the recorded removals are three consecutive
    /// events inside the fail-open window, and arm the re-enable timer.
    fn verify_and_disable(&self, st: &mut RouteState, now: Instant) {
        if st.fail_open_times.len() < FAIL_OPEN_REMOVAL_COUNT {
            return;
        }
        let oldest = *st.fail_open_times.front().expect("times checked non-empty");
        if now.duration_since(oldest) > self.inner.fail_open_window {
            return;
        }

        st.is_enabled = false;
        st.fail_open_times.clear();
        obs::record_fail_open_event();
        tracing::warn!(
            disable_ms = self.inner.disable_duration.as_millis() as u64,
            "route manager entering fail-open state"
        );

        let manager = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(manager.inner.disable_duration).await;
            manager.re_enable();
        });
        if let Some(old) = st.timer.replace(timer) {
            old.abort();
        }
    }

    /// Timer body: rebuild routes from the authoritative source and resume
    /// management.
    fn re_enable(&self) {
        let source = self.inner.source.lock().clone();
        let rebuilt = source
            .and_then(|s| s.upgrade())
            .map(|s| s.current_routes());
        let mut st = self.inner.state.lock();
        if let Some(routes) = rebuilt {
            st.routes = routes;
            st.next_index = 0;
        }
        st.is_enabled = self.inner.management_enabled;
        tracing::info!(routes = st.routes.len(), "route manager re-enabled");
    }

    /// Stop the re-enable timer. Called on cluster close.
    pub fn close(&self) {
        let mut st = self.inner.state.lock();
        st.routes.clear();
        if let Some(timer) = st.timer.take() {
            timer.abort();
        }
    }
}
