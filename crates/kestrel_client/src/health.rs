//! Per-node health accounting.
//!
//! Consecutive I/O failures on the read path flip a node to unhealthy and
//! evict its route; a successful health probe flips it back. The listener
//! handle is non-owning so a node client never keeps its cluster alive.

use std::sync::{Arc, Weak};

use kestrel_common::KestrelError;
use parking_lot::RwLock;

use crate::node::NodeApi;

/// Remove the route after this many consecutive read I/O errors.
pub const READ_TIMEOUT_ERROR_THRESHOLD: u32 = 5;

/// Route membership callbacks a health status may invoke.
pub trait RouteListener: Send + Sync {
    fn is_route_manager_enabled(&self) -> bool;
    fn add_route(&self, endpoint: &str, route: Arc<dyn NodeApi>);
    fn remove_route(&self, endpoint: &str, route: Arc<dyn NodeApi>);
}

struct HealthState {
    is_healthy: bool,
    cur_read_timeout_count: u32,
}

pub enum HealthStatus {
    Enabled(EnabledHealthStatus),
    Disabled,
}

pub struct EnabledHealthStatus {
    listener: Weak<dyn RouteListener>,
    endpoint: String,
    state: RwLock<HealthState>,
}

impl HealthStatus {
    /// Health accounting is active only when a route listener exists and
    /// route management is enabled on it.
    pub fn new(endpoint: &str, listener: Option<Weak<dyn RouteListener>>) -> HealthStatus {
        let enabled = listener
            .as_ref()
            .and_then(|l| l.upgrade())
            .map(|l| l.is_route_manager_enabled())
            .unwrap_or(false);
        match (enabled, listener) {
            (true, Some(listener)) => HealthStatus::Enabled(EnabledHealthStatus {
                listener,
                endpoint: endpoint.to_string(),
                state: RwLock::new(HealthState { is_healthy: true, cur_read_timeout_count: 0 }),
            }),
            _ => HealthStatus::Disabled,
        }
    }

    pub fn on_error_in_read_request(&self, err: &KestrelError, route: &Arc<dyn NodeApi>) {
        let HealthStatus::Enabled(hs) = self else {
            return;
        };
        if !err.is_io_error() {
            return;
        }
        if !hs.state.read().is_healthy {
            return;
        }

        let mut st = hs.state.write();
        st.cur_read_timeout_count += 1;
        if st.cur_read_timeout_count >= READ_TIMEOUT_ERROR_THRESHOLD {
            st.is_healthy = false;
            drop(st);
            if let Some(listener) = hs.listener.upgrade() {
                tracing::debug!(endpoint = %hs.endpoint, "read errors reached threshold, removing route");
                listener.remove_route(&hs.endpoint, Arc::clone(route));
            }
        }
    }

    pub fn on_success_in_read_request(&self) {
        let HealthStatus::Enabled(hs) = self else {
            return;
        };
        // fast path: no exclusive lock unless there is something to reset
        {
            let st = hs.state.read();
            if st.cur_read_timeout_count == 0 || !st.is_healthy {
                return;
            }
        }
        hs.state.write().cur_read_timeout_count = 0;
    }

    pub fn on_health_check_success(&self, route: &Arc<dyn NodeApi>) {
        let HealthStatus::Enabled(hs) = self else {
            return;
        };
        {
            let st = hs.state.read();
            if st.cur_read_timeout_count == 0 && st.is_healthy {
                return;
            }
        }
        let mut st = hs.state.write();
        st.cur_read_timeout_count = 0;
        if !st.is_healthy {
            st.is_healthy = true;
            drop(st);
            if let Some(listener) = hs.listener.upgrade() {
                tracing::debug!(endpoint = %hs.endpoint, "health probe recovered, adding route back");
                listener.add_route(&hs.endpoint, Arc::clone(route));
            }
        }
    }

    /// Whether the node is currently considered healthy.
    pub fn is_healthy(&self) -> bool {
        match self {
            HealthStatus::Enabled(hs) => hs.state.read().is_healthy,
            HealthStatus::Disabled => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::test_support::MockNode;
    use parking_lot::Mutex;

    struct RecordingListener {
        enabled: bool,
        added: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
    }

    impl RecordingListener {
        fn new(enabled: bool) -> Arc<RecordingListener> {
            Arc::new(RecordingListener {
                enabled,
                added: Mutex::new(Vec::new()),
                removed: Mutex::new(Vec::new()),
            })
        }
    }

    impl RouteListener for RecordingListener {
        fn is_route_manager_enabled(&self) -> bool {
            self.enabled
        }
        fn add_route(&self, endpoint: &str, _route: Arc<dyn NodeApi>) {
            self.added.lock().push(endpoint.to_string());
        }
        fn remove_route(&self, endpoint: &str, _route: Arc<dyn NodeApi>) {
            self.removed.lock().push(endpoint.to_string());
        }
    }

    fn io_error() -> KestrelError {
        KestrelError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "read timeout"))
    }

    #[test]
    fn test_disabled_when_listener_disabled() {
        let listener = RecordingListener::new(false);
        let strong: Arc<dyn RouteListener> = Arc::clone(&listener) as Arc<dyn RouteListener>;
        let hs = HealthStatus::new("n1:8111", Some(Arc::downgrade(&strong)));
        assert!(matches!(hs, HealthStatus::Disabled));
    }

    #[tokio::test]
    async fn test_threshold_errors_remove_route() {
        let listener = RecordingListener::new(true);
        let strong: Arc<dyn RouteListener> = Arc::clone(&listener) as Arc<dyn RouteListener>;
        let hs = HealthStatus::new("n1:8111", Some(Arc::downgrade(&strong)));
        let route: Arc<dyn NodeApi> = Arc::new(MockNode::healthy("n1:8111"));

        for _ in 0..READ_TIMEOUT_ERROR_THRESHOLD - 1 {
            hs.on_error_in_read_request(&io_error(), &route);
        }
        assert!(hs.is_healthy());
        assert!(listener.removed.lock().is_empty());

        hs.on_error_in_read_request(&io_error(), &route);
        assert!(!hs.is_healthy());
        assert_eq!(listener.removed.lock().as_slice(), ["n1:8111"]);

        // further errors while unhealthy are ignored
        hs.on_error_in_read_request(&io_error(), &route);
        assert_eq!(listener.removed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_non_io_errors_ignored() {
        let listener = RecordingListener::new(true);
        let strong: Arc<dyn RouteListener> = Arc::clone(&listener) as Arc<dyn RouteListener>;
        let hs = HealthStatus::new("n1:8111", Some(Arc::downgrade(&strong)));
        let route: Arc<dyn NodeApi> = Arc::new(MockNode::healthy("n1:8111"));

        for _ in 0..READ_TIMEOUT_ERROR_THRESHOLD * 2 {
            let server = KestrelError::server_failure(
                vec![2],
                "empty",
                "retry",
                "rid",
                500,
                kestrel_common::Fault::Server,
            );
            hs.on_error_in_read_request(&server, &route);
        }
        assert!(hs.is_healthy());
        assert!(listener.removed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_success_resets_count() {
        let listener = RecordingListener::new(true);
        let strong: Arc<dyn RouteListener> = Arc::clone(&listener) as Arc<dyn RouteListener>;
        let hs = HealthStatus::new("n1:8111", Some(Arc::downgrade(&strong)));
        let route: Arc<dyn NodeApi> = Arc::new(MockNode::healthy("n1:8111"));

        for _ in 0..READ_TIMEOUT_ERROR_THRESHOLD - 1 {
            hs.on_error_in_read_request(&io_error(), &route);
        }
        hs.on_success_in_read_request();
        // the streak restarts: threshold - 1 more errors do not evict
        for _ in 0..READ_TIMEOUT_ERROR_THRESHOLD - 1 {
            hs.on_error_in_read_request(&io_error(), &route);
        }
        assert!(hs.is_healthy());
        assert!(listener.removed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_health_check_success_restores_route() {
        let listener = RecordingListener::new(true);
        let strong: Arc<dyn RouteListener> = Arc::clone(&listener) as Arc<dyn RouteListener>;
        let hs = HealthStatus::new("n1:8111", Some(Arc::downgrade(&strong)));
        let route: Arc<dyn NodeApi> = Arc::new(MockNode::healthy("n1:8111"));

        for _ in 0..READ_TIMEOUT_ERROR_THRESHOLD {
            hs.on_error_in_read_request(&io_error(), &route);
        }
        assert!(!hs.is_healthy());

        hs.on_health_check_success(&route);
        assert!(hs.is_healthy());
        assert_eq!(listener.added.lock().as_slice(), ["n1:8111"]);

        // already healthy: nothing further happens
        hs.on_health_check_success(&route);
        assert_eq!(listener.added.lock().len(), 1);
    }

    #[test]
    fn test_fully_disabled_status_is_inert() {
        let hs = HealthStatus::new("n1:8111", None);
        assert!(matches!(hs, HealthStatus::Disabled));
        assert!(hs.is_healthy());
        hs.on_success_in_read_request();
    }
}
