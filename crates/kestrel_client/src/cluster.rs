//! Cluster membership, discovery refresh and the public client.
//!
//! The cluster owns one node client per active endpoint, keyed by host and
//! port. A periodic refresh pulls the roster from the seeds, diffs it
//! against the active set and swaps in the changes; per-node health probes
//! replace individual clients that stop answering. Route selection is
//! delegated to the route manager, and the public client wraps everything
//! in the cross-route retry loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use kestrel_common::config::{Config, ConnConfig, HostPort};
use kestrel_common::{CredentialsProvider, KestrelError, KestrelResult, TaskExecutor};
use parking_lot::RwLock;
use rand::Rng;

use crate::health::RouteListener;
use crate::node::{Decoder, Encoder, NodeApi, NodeClient, RequestOptions};
use crate::pool::TubePoolOptions;
use crate::retry::{sleep_with_deadline, Retryer};
use crate::routes::{RouteManager, RouteSource};
use crate::service::{
    decode_endpoints_response, encode_endpoints_request, ServiceEndpoint, OP_ENDPOINTS,
};
use crate::tube::{default_dialer, DialFn};

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
const DISCOVERY_RETRIES: u32 = 2;

/// Builds a node client for an endpoint. Production uses
/// [`SingleClientBuilder`]; tests substitute mocks.
#[async_trait]
pub trait ClientBuilder: Send + Sync {
    async fn build(&self, host: &HostPort) -> KestrelResult<Arc<dyn NodeApi>>;
}

/// Production builder: one [`NodeClient`] per endpoint, wired to the
/// cluster's route listener.
pub struct SingleClientBuilder {
    region: String,
    credentials: Arc<dyn CredentialsProvider>,
    max_pending_connections: usize,
    dial: DialFn,
    listener: Weak<Cluster>,
}

#[async_trait]
impl ClientBuilder for SingleClientBuilder {
    async fn build(&self, host: &HostPort) -> KestrelResult<Arc<dyn NodeApi>> {
        let listener: Weak<dyn RouteListener> = self.listener.clone();
        let client = NodeClient::new(
            host.to_string(),
            &self.region,
            Arc::clone(&self.credentials),
            TubePoolOptions {
                max_concurrent_conn_attempts: self.max_pending_connections,
                dial: self.dial.clone(),
            },
            Some(listener),
        );
        Ok(client as Arc<dyn NodeApi>)
    }
}

struct ClusterState {
    active: HashMap<HostPort, Arc<dyn NodeApi>>,
    closed: bool,
    last_refresh_err: Option<String>,
}

pub struct Cluster {
    config: Config,
    seeds: Vec<HostPort>,
    #[allow(dead_code)] // carried for the injected dialer's TLS settings
    conn_config: ConnConfig,
    state: RwLock<ClusterState>,
    last_update_ns: AtomicI64,
    executor: TaskExecutor,
    route_manager: RouteManager,
    builder: Arc<dyn ClientBuilder>,
    self_ref: Weak<Cluster>,
}

fn nanos_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

impl Cluster {
    /// Validate the configuration and assemble the cluster with the
    /// production client builder.
    pub fn new(config: Config, dial: Option<DialFn>) -> KestrelResult<Arc<Cluster>> {
        let (seeds, conn_config) = config.validate()?;
        let credentials = config
            .credentials
            .clone()
            .ok_or_else(|| KestrelError::param("credentials", "a credentials provider is required"))?;
        let dial = dial.unwrap_or_else(default_dialer);
        let max_pending = config.max_pending_connections_per_host.max(1) as usize;
        let region = config.region.clone();

        let cluster = Arc::new_cyclic(|weak: &Weak<Cluster>| {
            let builder = SingleClientBuilder {
                region,
                credentials,
                max_pending_connections: max_pending,
                dial,
                listener: weak.clone(),
            };
            Cluster::assemble(config, seeds, conn_config, Arc::new(builder), weak.clone())
        });
        let source: Weak<dyn RouteSource> = Arc::downgrade(&(cluster.clone() as Arc<dyn RouteSource>));
        cluster.route_manager.set_source(source);
        Ok(cluster)
    }

    /// Assemble the cluster around an injected client builder.
    pub fn new_with_builder(
        config: Config,
        builder: Arc<dyn ClientBuilder>,
    ) -> KestrelResult<Arc<Cluster>> {
        let (seeds, conn_config) = config.validate()?;
        let cluster = Arc::new_cyclic(|weak: &Weak<Cluster>| {
            Cluster::assemble(config, seeds, conn_config, Arc::clone(&builder), weak.clone())
        });
        let source: Weak<dyn RouteSource> = Arc::downgrade(&(cluster.clone() as Arc<dyn RouteSource>));
        cluster.route_manager.set_source(source);
        Ok(cluster)
    }

    fn assemble(
        config: Config,
        seeds: Vec<HostPort>,
        conn_config: ConnConfig,
        builder: Arc<dyn ClientBuilder>,
        self_ref: Weak<Cluster>,
    ) -> Cluster {
        let route_manager = RouteManager::new(
            config.route_manager_enabled,
            config.client_health_check_interval(),
            config.fail_open_window(),
        );
        Cluster {
            seeds,
            conn_config,
            state: RwLock::new(ClusterState {
                active: HashMap::new(),
                closed: false,
                last_refresh_err: None,
            }),
            last_update_ns: AtomicI64::new(0),
            executor: TaskExecutor::new(),
            route_manager,
            builder,
            self_ref,
            config,
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        self.config.client_health_check_interval()
    }

    /// Kick off the periodic refresh and idle-reap tasks and perform the
    /// initial roster pull.
    pub async fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.executor.start(self.config.cluster_update_interval(), move || {
            let weak = weak.clone();
            async move {
                if let Some(cluster) = weak.upgrade() {
                    cluster.safe_refresh(false).await;
                }
            }
        });

        let weak = Arc::downgrade(self);
        let reap_age = self.config.idle_connection_reap_delay();
        self.executor.start(reap_age, move || {
            let weak = weak.clone();
            async move {
                if let Some(cluster) = weak.upgrade() {
                    cluster.reap_idle_connections(reap_age).await;
                }
            }
        });

        self.safe_refresh(false).await;
    }

    /// Stop the background tasks, then tear down every node client.
    pub async fn close(&self) {
        self.executor.stop_all().await;
        let clients: Vec<Arc<dyn NodeApi>> = {
            let mut st = self.state.write();
            if st.closed {
                return;
            }
            st.closed = true;
            st.active.drain().map(|(_, c)| c).collect()
        };
        self.route_manager.close();
        for client in clients {
            client.close().await;
        }
    }

    /// Pick the next route, avoiding `prev` when possible.
    pub fn client(&self, prev: Option<&Arc<dyn NodeApi>>) -> KestrelResult<Arc<dyn NodeApi>> {
        let last_refresh_error = {
            let st = self.state.read();
            if st.closed {
                return Err(KestrelError::PoolClosed);
            }
            st.last_refresh_err.clone().unwrap_or_default()
        };
        self.route_manager
            .get_route(prev)
            .ok_or(KestrelError::NoRoutes { last_refresh_error })
    }

    /// Number of currently routable node clients.
    pub fn route_count(&self) -> usize {
        self.route_manager.route_count()
    }

    async fn reap_idle_connections(&self, max_idle_age: Duration) {
        for route in self.route_manager.all_routes() {
            route.reap_idle_connections(max_idle_age).await;
        }
    }

    /// Refresh and remember the outcome for `NoRoutes` diagnostics.
    pub async fn safe_refresh(&self, force: bool) {
        let result = self.refresh(force).await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "cluster roster refresh failed");
        }
        let mut st = self.state.write();
        st.last_refresh_err = result.err().map(|e| e.to_string());
    }

    /// Throttled refresh: pull only when forced or the threshold elapsed,
    /// with a compare-and-swap guaranteeing at most one concurrent pull.
    async fn refresh(&self, force: bool) -> KestrelResult<()> {
        let last = self.last_update_ns.load(Ordering::Acquire);
        let now = nanos_now();
        let threshold = self.config.cluster_update_threshold().as_nanos() as i64;
        if now - last > threshold || force {
            if self
                .last_update_ns
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return self.refresh_now().await;
            }
        }
        Ok(())
    }

    async fn refresh_now(&self) -> KestrelResult<()> {
        let roster = self.pull_endpoints().await?;
        if !self.has_changed(&roster) {
            return Ok(());
        }
        self.update(roster).await
    }

    fn has_changed(&self, roster: &[ServiceEndpoint]) -> bool {
        let st = self.state.read();
        for ep in roster {
            if !st.active.contains_key(&ep.host_port()) {
                return true;
            }
        }
        roster.len() != st.active.len()
    }

    /// Ask the seeds for the roster. Addresses behind each seed are tried
    /// in random order; the first non-empty roster wins, and per-seed
    /// failures are swallowed into the final error.
    async fn pull_endpoints(&self) -> KestrelResult<Vec<ServiceEndpoint>> {
        let mut last_err: Option<KestrelError> = None;
        for seed in &self.seeds {
            let mut addrs: Vec<HostPort> =
                match tokio::net::lookup_host((seed.host.as_str(), seed.port)).await {
                    Ok(resolved) => resolved
                        .map(|a| HostPort::new(a.ip().to_string(), a.port()))
                        .collect(),
                    Err(e) => {
                        last_err = Some(KestrelError::Io(e));
                        continue;
                    }
                };
            // in-place Fisher-Yates shuffle spreads discovery load
            {
                let mut rng = rand::thread_rng();
                for j in (1..addrs.len()).rev() {
                    let k = rng.gen_range(0..=j);
                    addrs.swap(j, k);
                }
            }

            for addr in addrs {
                match self.pull_endpoints_from(&addr).await {
                    Ok(endpoints) if !endpoints.is_empty() => {
                        tracing::debug!(seed = %addr, count = endpoints.len(), "pulled endpoints");
                        return Ok(endpoints);
                    }
                    Ok(_) => {}
                    Err(e) => last_err = Some(e),
                }
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(Vec::new()),
        }
    }

    /// One discovery call through a short-lived client.
    async fn pull_endpoints_from(&self, host: &HostPort) -> KestrelResult<Vec<ServiceEndpoint>> {
        let client = self.builder.build(host).await?;
        let opt = RequestOptions {
            retry_max_attempts: DISCOVERY_RETRIES,
            retry_delay: Duration::ZERO,
            deadline: Some(Instant::now() + DISCOVERY_TIMEOUT),
        };
        let result = client.endpoints(opt).await;
        client.close().await;
        result
    }

    /// Apply a new roster: reuse unchanged clients, build the new ones,
    /// retire the removed ones. A build failure leaves the active set and
    /// routes untouched and closes everything built so far.
    pub(crate) async fn update(&self, roster: Vec<ServiceEndpoint>) -> KestrelResult<()> {
        let existing: HashMap<HostPort, Arc<dyn NodeApi>> = {
            let st = self.state.read();
            if st.closed {
                return Ok(());
            }
            st.active.clone()
        };

        // build clients for roster entries we do not have yet
        let mut newly_built: Vec<(HostPort, Arc<dyn NodeApi>)> = Vec::new();
        let mut build_err: Option<KestrelError> = None;
        for ep in &roster {
            let host = ep.host_port();
            if existing.contains_key(&host) || newly_built.iter().any(|(h, _)| *h == host) {
                continue;
            }
            match self.builder.build(&host).await {
                Ok(client) => newly_built.push((host, client)),
                Err(e) => {
                    tracing::warn!(endpoint = %host, error = %e, "building node client failed");
                    build_err = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = build_err {
            for (_, client) in newly_built {
                client.close().await;
            }
            return Err(e);
        }

        let mut to_close: Vec<Arc<dyn NodeApi>> = Vec::new();
        let mut to_start: Vec<(HostPort, Arc<dyn NodeApi>)> = Vec::new();
        let mut was_closed = false;
        let mut new_routes: Vec<Arc<dyn NodeApi>> = Vec::new();
        {
            let mut st = self.state.write();
            if st.closed {
                was_closed = true;
                to_close.extend(newly_built.into_iter().map(|(_, c)| c));
            } else {
                let mut built: HashMap<HostPort, Arc<dyn NodeApi>> =
                    newly_built.into_iter().collect();
                let mut new_active: HashMap<HostPort, Arc<dyn NodeApi>> =
                    HashMap::with_capacity(roster.len());
                for ep in &roster {
                    let host = ep.host_port();
                    if let Some(client) = new_active.get(&host) {
                        new_routes.push(Arc::clone(client));
                        continue;
                    }
                    let client = match st.active.get(&host) {
                        Some(existing) => Arc::clone(existing),
                        None => match built.remove(&host) {
                            Some(client) => {
                                to_start.push((host.clone(), Arc::clone(&client)));
                                client
                            }
                            // a concurrent replacement raced us here; fall
                            // back to whatever is active next refresh
                            None => continue,
                        },
                    };
                    new_routes.push(Arc::clone(&client));
                    new_active.insert(host, client);
                }

                for (host, client) in st.active.iter() {
                    if !new_active.contains_key(host) {
                        tracing::debug!(endpoint = %host, "endpoint left the roster, retiring client");
                        to_close.push(Arc::clone(client));
                    }
                }
                // clients built for hosts that appeared while we were
                // building are redundant
                to_close.extend(built.into_values());
                st.active = new_active;
            }
        }

        if was_closed {
            for client in to_close {
                client.close().await;
            }
            return Ok(());
        }

        self.route_manager.set_routes(new_routes);

        if let Some(cluster) = self.self_ref.upgrade() {
            for (host, client) in &to_start {
                client.start_health_checks(&cluster, host.clone());
            }
        }

        // retired clients close off the request path
        if !to_close.is_empty() {
            tokio::spawn(async move {
                for client in to_close {
                    client.close().await;
                }
            });
        }
        Ok(())
    }

    /// Replace the client at `host` after its health probe failed.
    pub async fn on_health_check_failed(&self, host: HostPort) {
        {
            let st = self.state.read();
            if st.closed || !st.active.contains_key(&host) {
                tracing::debug!(endpoint = %host, "ignoring health check failure for inactive endpoint");
                return;
            }
        }

        let new_client = match self.builder.build(&host).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(endpoint = %host, error = %e, "rebuilding node client failed");
                return;
            }
        };

        let (old_client, new_routes) = {
            let mut st = self.state.write();
            if st.closed || !st.active.contains_key(&host) {
                (None, None)
            } else {
                let old = st.active.insert(host.clone(), Arc::clone(&new_client));
                let routes = st.active.values().cloned().collect::<Vec<_>>();
                (old, Some(routes))
            }
        };

        match new_routes {
            Some(routes) => {
                self.route_manager.set_routes(routes);
                if let Some(cluster) = self.self_ref.upgrade() {
                    new_client.start_health_checks(&cluster, host.clone());
                }
                if let Some(old) = old_client {
                    tracing::debug!(endpoint = %host, "replaced node client after failed health check");
                    old.close().await;
                }
            }
            None => new_client.close().await,
        }
    }

    #[cfg(test)]
    pub(crate) fn active_hosts(&self) -> Vec<HostPort> {
        self.state.read().active.keys().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn last_refresh_err(&self) -> Option<String> {
        self.state.read().last_refresh_err.clone()
    }
}

impl RouteListener for Cluster {
    fn is_route_manager_enabled(&self) -> bool {
        self.config.route_manager_enabled
    }

    fn add_route(&self, endpoint: &str, route: Arc<dyn NodeApi>) {
        self.route_manager.add_route(endpoint, route);
    }

    fn remove_route(&self, endpoint: &str, route: Arc<dyn NodeApi>) {
        self.route_manager.remove_route(endpoint, route);
    }
}

impl RouteSource for Cluster {
    fn current_routes(&self) -> Vec<Arc<dyn NodeApi>> {
        self.state.read().active.values().cloned().collect()
    }
}

/// The user-facing client: route selection plus the cross-route retry loop.
pub struct ClusterClient {
    cluster: Arc<Cluster>,
    retryer: Retryer,
}

impl ClusterClient {
    /// Connect with the system dialer.
    pub async fn new(config: Config) -> KestrelResult<ClusterClient> {
        ClusterClient::with_dialer(config, None).await
    }

    /// Connect with an injected dialer (TLS, proxies, tests).
    pub async fn with_dialer(config: Config, dial: Option<DialFn>) -> KestrelResult<ClusterClient> {
        let cluster = Cluster::new(config, dial)?;
        cluster.start().await;
        Ok(ClusterClient { cluster, retryer: Retryer::default() })
    }

    pub(crate) fn from_cluster(cluster: Arc<Cluster>) -> ClusterClient {
        ClusterClient { cluster, retryer: Retryer::default() }
    }

    pub async fn close(&self) {
        self.cluster.close().await;
    }

    /// Execute one operation with up to `retry_max_attempts` retries across
    /// routes. Canceled errors propagate immediately without consuming an
    /// attempt; throttled failures back off exponentially with jitter; the
    /// final error is canonicalized.
    pub async fn execute(
        &self,
        op: &'static str,
        opt: RequestOptions,
        enc: Encoder<'_>,
        dec: Decoder<'_>,
    ) -> KestrelResult<()> {
        let attempts = opt.retry_max_attempts;
        // the per-node client runs with retries disabled to avoid double
        // counting
        let mut inner = opt.clone();
        inner.retry_max_attempts = 0;

        let mut prev: Option<Arc<dyn NodeApi>> = None;
        let mut last: Option<KestrelError> = None;
        for attempt in 0..=attempts {
            if attempt > 0 {
                tracing::debug!(op, attempt, "retrying request on another route");
            }
            let result = match self.cluster.client(prev.as_ref()) {
                Ok(route) => {
                    prev = Some(Arc::clone(&route));
                    route.invoke(op, inner.clone(), enc, &mut *dec).await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => {
                    if !self.retryer.is_retryable(&e) {
                        return Err(e.translate());
                    }
                    if attempt != attempts {
                        let mut delay = self.retryer.retry_delay(attempt + 1, &e);
                        if delay.is_zero() {
                            delay = opt.retry_delay;
                        }
                        sleep_with_deadline(op, delay, opt.deadline).await?;
                    }
                    last = Some(e);
                }
            }
        }
        Err(last.expect("attempted at least once").translate())
    }

    /// The discovery RPC, routed like any other operation.
    pub async fn endpoints(&self, opt: RequestOptions) -> KestrelResult<Vec<ServiceEndpoint>> {
        let enc = |w: &mut kestrel_codec::CborWriter| -> kestrel_codec::CodecResult<()> {
            encode_endpoints_request(w);
            Ok(())
        };
        let mut out = Vec::new();
        let mut dec =
            |r: &mut kestrel_codec::CborReader<'_>| -> kestrel_codec::CodecResult<()> {
                out = decode_endpoints_response(r)?;
                Ok(())
            };
        self.execute(OP_ENDPOINTS, opt, &enc, &mut dec).await?;
        Ok(out)
    }
}
