//! Per-node client: the execute pipeline, cached authentication, the
//! control-plane caches and the health probe task.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use kestrel_codec::{CborReader, CborWriter, CodecError, CodecResult};
use kestrel_common::config::HostPort;
use kestrel_common::{CredentialsProvider, KestrelError, KestrelResult, TaskExecutor};
use kestrel_observability as obs;

use crate::cache::{CacheKey, LoadFuture, SingleFlightCache};
use crate::cluster::Cluster;
use crate::health::{HealthStatus, RouteListener};
use crate::pool::{TubePool, TubePoolOptions};
use crate::retry::sleep_with_deadline;
use crate::service::*;
use crate::sig;
use crate::tube::{unix_now, Tube};

/// Client identification sent in every auth frame.
pub const USER_AGENT: &str = "KestrelRustClient-0.1.0";
/// Fixed service endpoint URL requests are signed against.
pub const SERVICE_ADDRESS: &str = "https://dax.amazonaws.com";

/// Lifetime of one signature.
pub const AUTH_TTL_SECS: i64 = 5 * 60;
/// Fraction of the auth TTL after which a connection re-signs.
pub const TUBE_AUTH_WINDOW_SCALAR: f64 = 0.75;

/// The id the server reserves for an empty attribute list.
pub const EMPTY_ATTRIBUTE_LIST_ID: i64 = 1;

const KEY_SCHEMA_CACHE_SIZE: usize = 100;
const ATTRIBUTE_LIST_CACHE_SIZE: usize = 1000;

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(1);
const HEALTH_CHECK_RETRIES: u32 = 3;

/// Per-request knobs threaded through every operation.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Retries on top of the initial attempt.
    pub retry_max_attempts: u32,
    /// Fixed delay between non-throttled retries.
    pub retry_delay: Duration,
    /// Absolute deadline for the whole operation.
    pub deadline: Option<Instant>,
}

/// Opaque request encoder: writes one request item.
pub type Encoder<'a> = &'a (dyn Fn(&mut CborWriter) -> CodecResult<()> + Send + Sync);
/// Opaque response-body decoder: reads one response body.
pub type Decoder<'a> = &'a mut (dyn FnMut(&mut CborReader<'_>) -> CodecResult<()> + Send);

/// The capability set a routed node exposes. Production nodes are
/// [`NodeClient`]; tests substitute mocks.
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// Execute one operation against this node.
    async fn invoke(
        &self,
        op: &'static str,
        opt: RequestOptions,
        enc: Encoder<'_>,
        dec: Decoder<'_>,
    ) -> KestrelResult<()>;

    /// The discovery RPC.
    async fn endpoints(&self, opt: RequestOptions) -> KestrelResult<Vec<ServiceEndpoint>>;

    /// Stop background work and close the connection pool.
    async fn close(&self);

    /// Close idle connections older than `max_idle_age`.
    async fn reap_idle_connections(&self, max_idle_age: Duration);

    fn endpoint(&self) -> &str;

    /// Begin periodic health probing, reporting failures to the cluster.
    fn start_health_checks(&self, cluster: &Arc<Cluster>, host: HostPort) {
        let _ = (cluster, host);
    }
}

impl std::fmt::Debug for dyn NodeApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn NodeApi").field("endpoint", &self.endpoint()).finish()
    }
}

enum ResponseOutcome {
    Success(usize),
    ServerError(KestrelError, usize),
    Incomplete,
    Malformed(CodecError),
}

pub struct NodeClient {
    endpoint: String,
    region: String,
    credentials: Arc<dyn CredentialsProvider>,
    auth_window_secs: i64,
    pool: TubePool,
    executor: TaskExecutor,
    health: HealthStatus,
    key_schema: SingleFlightCache<String, Arc<Vec<AttributeDefinition>>>,
    attr_names_to_id: SingleFlightCache<Vec<String>, i64>,
    attr_id_to_names: SingleFlightCache<i64, Arc<Vec<String>>>,
    self_ref: Weak<NodeClient>,
}

impl NodeClient {
    pub fn new(
        endpoint: String,
        region: &str,
        credentials: Arc<dyn CredentialsProvider>,
        pool_options: TubePoolOptions,
        listener: Option<Weak<dyn RouteListener>>,
    ) -> Arc<NodeClient> {
        Arc::new_cyclic(|weak: &Weak<NodeClient>| {
            let key_schema = {
                let weak = weak.clone();
                SingleFlightCache::new(
                    KEY_SCHEMA_CACHE_SIZE,
                    Arc::new(move |table: String| {
                        let weak = weak.clone();
                        Box::pin(async move {
                            let client = weak.upgrade().ok_or(KestrelError::PoolClosed)?;
                            client.define_key_schema(&table).await.map(Arc::new)
                        }) as LoadFuture<Arc<Vec<AttributeDefinition>>>
                    }),
                )
            };
            let attr_names_to_id = {
                let weak = weak.clone();
                SingleFlightCache::new(
                    ATTRIBUTE_LIST_CACHE_SIZE,
                    Arc::new(move |names: Vec<String>| {
                        let weak = weak.clone();
                        Box::pin(async move {
                            let client = weak.upgrade().ok_or(KestrelError::PoolClosed)?;
                            client.define_attribute_list_id(&names).await
                        }) as LoadFuture<i64>
                    }),
                )
                .with_marshaller(Arc::new(|names: &Vec<String>| {
                    let mut w = CborWriter::new();
                    for n in names {
                        w.write_string(n);
                    }
                    CacheKey::Bytes(w.take().to_vec())
                }))
            };
            let attr_id_to_names = {
                let weak = weak.clone();
                SingleFlightCache::new(
                    ATTRIBUTE_LIST_CACHE_SIZE,
                    Arc::new(move |id: i64| {
                        let weak = weak.clone();
                        Box::pin(async move {
                            let client = weak.upgrade().ok_or(KestrelError::PoolClosed)?;
                            client.define_attribute_list(id).await.map(Arc::new)
                        }) as LoadFuture<Arc<Vec<String>>>
                    }),
                )
            };

            NodeClient {
                region: region.to_string(),
                credentials,
                auth_window_secs: (AUTH_TTL_SECS as f64 * TUBE_AUTH_WINDOW_SCALAR) as i64,
                pool: TubePool::new(endpoint.clone(), pool_options),
                executor: TaskExecutor::new(),
                health: HealthStatus::new(&endpoint, listener),
                key_schema,
                attr_names_to_id,
                attr_id_to_names,
                self_ref: weak.clone(),
                endpoint,
            }
        })
    }

    pub fn health(&self) -> &HealthStatus {
        &self.health
    }

    /// Execute one operation with the per-node retry loop: canceled errors
    /// propagate immediately, everything else retries after the fixed delay
    /// until the attempts run out, and the final error is canonicalized.
    pub async fn execute_with_retries(
        &self,
        op: &'static str,
        opt: RequestOptions,
        enc: Encoder<'_>,
        dec: Decoder<'_>,
    ) -> KestrelResult<()> {
        let attempts = opt.retry_max_attempts;
        let mut last: Option<KestrelError> = None;
        for attempt in 0..=attempts {
            if attempt > 0 {
                tracing::debug!(op, attempt, "retrying request");
            }
            match self.execute(op, &opt, enc, &mut *dec).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => {
                    if attempt != attempts {
                        tracing::debug!(op, error = %e, "request attempt failed");
                        sleep_with_deadline(op, opt.retry_delay, opt.deadline).await?;
                    }
                    last = Some(e);
                }
            }
        }
        Err(last.expect("at least one attempt ran").translate())
    }

    async fn execute(
        &self,
        op: &'static str,
        opt: &RequestOptions,
        enc: Encoder<'_>,
        dec: Decoder<'_>,
    ) -> KestrelResult<()> {
        let started = Instant::now();
        let result = self.execute_once(op, opt, enc, dec).await;
        obs::record_op(op, started, result.is_ok());
        result
    }

    async fn execute_once(
        &self,
        op: &'static str,
        opt: &RequestOptions,
        enc: Encoder<'_>,
        dec: Decoder<'_>,
    ) -> KestrelResult<()> {
        let mut tube = self.pool.acquire(is_high_priority(op)).await?;

        if let Err(e) = tube.set_deadline(opt.deadline) {
            // nothing was written yet; an already-expired deadline leaves
            // the tube reusable
            return match e {
                KestrelError::DeadlineExceeded => {
                    self.pool.put(tube);
                    Err(KestrelError::DeadlineExceeded)
                }
                other => {
                    self.pool.discard(tube).await;
                    Err(other)
                }
            };
        }

        // the auth frame may be partially written on failure
        if let Err(e) = self.auth(&mut tube).await {
            self.pool.discard(tube).await;
            return Err(e);
        }

        let mut w = CborWriter::new();
        if let Err(e) = enc(&mut w) {
            self.pool.discard(tube).await;
            return Err(e.into());
        }
        let frame = w.take();
        if let Err(e) = tube.write_all_flush(&frame).await {
            self.pool.discard(tube).await;
            return Err(e);
        }

        let outcome = loop {
            match Self::try_decode_response(tube.buffered(), &mut *dec) {
                ResponseOutcome::Incomplete => {
                    if let Err(e) = tube.fill().await {
                        self.pool.discard(tube).await;
                        return Err(e);
                    }
                }
                other => break other,
            }
        };

        match outcome {
            ResponseOutcome::Success(n) => {
                tube.consume(n);
                self.pool.put(tube);
                Ok(())
            }
            ResponseOutcome::ServerError(err, n) => {
                tube.consume(n);
                self.recycle(tube, &err).await;
                Err(err)
            }
            ResponseOutcome::Malformed(e) => {
                self.pool.discard(tube).await;
                Err(e.into())
            }
            ResponseOutcome::Incomplete => unreachable!("loop breaks on terminal outcomes only"),
        }
    }

    /// One decode pass over the buffered response. The whole pass restarts
    /// after each refill, so it must stay a pure function of the buffer.
    fn try_decode_response(buf: &[u8], dec: Decoder<'_>) -> ResponseOutcome {
        let mut r = CborReader::new(buf);
        match decode_error(&mut r) {
            Err(e) if e.is_incomplete() => ResponseOutcome::Incomplete,
            Err(e) => ResponseOutcome::Malformed(e),
            Ok(Some(server_err)) => ResponseOutcome::ServerError(server_err, r.consumed()),
            Ok(None) => match dec(&mut r) {
                Ok(()) => ResponseOutcome::Success(r.consumed()),
                Err(e) if e.is_incomplete() => ResponseOutcome::Incomplete,
                Err(e) => ResponseOutcome::Malformed(e),
            },
        }
    }

    /// Server failures leave the stream fully drained and the tube
    /// reusable; a rejected credential additionally forces the next use to
    /// re-authenticate. Anything else discards the tube.
    async fn recycle(&self, mut tube: Tube, err: &KestrelError) {
        match err {
            KestrelError::ServerRequestFailure { .. } => {
                if err.auth_error() {
                    tube.set_auth_expiry_unix(unix_now());
                }
                self.pool.put(tube);
            }
            _ => self.pool.discard(tube).await,
        }
    }

    /// Write an auth frame when the cached identity changed or its window
    /// expired.
    async fn auth(&self, tube: &mut Tube) -> KestrelResult<()> {
        let creds = self.credentials.retrieve().await?;
        let now_unix = unix_now();
        if tube.compare_and_swap_auth_id(&creds.access_key_id) || tube.auth_expiry_unix() <= now_unix
        {
            let (string_to_sign, signature) =
                sig::generate_sig_v4(&creds, SERVICE_ADDRESS, &self.region, "", SystemTime::now());
            let mut w = CborWriter::new();
            encode_auth_frame(
                &mut w,
                &creds.access_key_id,
                creds.session_token.as_deref(),
                &string_to_sign,
                &signature,
                USER_AGENT,
            );
            tube.write_all_flush(&w.take()).await?;
            tube.set_auth_expiry_unix(now_unix + self.auth_window_secs);
        }
        Ok(())
    }

    // ── Control-plane lookups (single-flight cached) ────────────────────

    /// The key schema of `table`, cached.
    pub async fn key_schema(
        &self,
        table: &str,
        deadline: Option<Instant>,
    ) -> KestrelResult<Arc<Vec<AttributeDefinition>>> {
        self.key_schema
            .get_with_deadline(table.to_string(), deadline)
            .await
            .map_err(|e| e.duplicate())
    }

    /// The id assigned to an attribute name list, cached.
    pub async fn attribute_list_id(
        &self,
        names: &[String],
        deadline: Option<Instant>,
    ) -> KestrelResult<i64> {
        if names.is_empty() {
            return Ok(EMPTY_ATTRIBUTE_LIST_ID);
        }
        self.attr_names_to_id
            .get_with_deadline(names.to_vec(), deadline)
            .await
            .map_err(|e| e.duplicate())
    }

    /// The attribute name list behind an id, cached.
    pub async fn attribute_list(
        &self,
        id: i64,
        deadline: Option<Instant>,
    ) -> KestrelResult<Arc<Vec<String>>> {
        if id == EMPTY_ATTRIBUTE_LIST_ID {
            return Ok(Arc::new(Vec::new()));
        }
        self.attr_id_to_names
            .get_with_deadline(id, deadline)
            .await
            .map_err(|e| e.duplicate())
    }

    async fn define_key_schema(&self, table: &str) -> KestrelResult<Vec<AttributeDefinition>> {
        let table_name = table.to_string();
        let enc = move |w: &mut CborWriter| -> CodecResult<()> {
            encode_define_key_schema_request(w, &table_name);
            Ok(())
        };
        let mut out = Vec::new();
        let mut dec = |r: &mut CborReader<'_>| -> CodecResult<()> {
            out = decode_define_key_schema_response(r)?;
            Ok(())
        };
        self.execute_with_retries(OP_DEFINE_KEY_SCHEMA, RequestOptions::default(), &enc, &mut dec)
            .await?;
        Ok(out)
    }

    async fn define_attribute_list_id(&self, names: &[String]) -> KestrelResult<i64> {
        let names = names.to_vec();
        let enc = move |w: &mut CborWriter| -> CodecResult<()> {
            encode_define_attribute_list_id_request(w, &names);
            Ok(())
        };
        let mut out = 0;
        let mut dec = |r: &mut CborReader<'_>| -> CodecResult<()> {
            out = decode_define_attribute_list_id_response(r)?;
            Ok(())
        };
        self.execute_with_retries(
            OP_DEFINE_ATTRIBUTE_LIST_ID,
            RequestOptions::default(),
            &enc,
            &mut dec,
        )
        .await?;
        Ok(out)
    }

    async fn define_attribute_list(&self, id: i64) -> KestrelResult<Vec<String>> {
        let enc = move |w: &mut CborWriter| -> CodecResult<()> {
            encode_define_attribute_list_request(w, id);
            Ok(())
        };
        let mut out = Vec::new();
        let mut dec = |r: &mut CborReader<'_>| -> CodecResult<()> {
            out = decode_define_attribute_list_response(r)?;
            Ok(())
        };
        self.execute_with_retries(
            OP_DEFINE_ATTRIBUTE_LIST,
            RequestOptions::default(),
            &enc,
            &mut dec,
        )
        .await?;
        Ok(out)
    }
}

#[async_trait]
impl NodeApi for NodeClient {
    async fn invoke(
        &self,
        op: &'static str,
        opt: RequestOptions,
        enc: Encoder<'_>,
        dec: Decoder<'_>,
    ) -> KestrelResult<()> {
        let result = self.execute_with_retries(op, opt, enc, dec).await;
        if is_read_op(op) {
            if let Some(this) = self.self_ref.upgrade() {
                let route: Arc<dyn NodeApi> = this;
                match &result {
                    Ok(()) => self.health.on_success_in_read_request(),
                    Err(e) => self.health.on_error_in_read_request(e, &route),
                }
            }
        }
        result
    }

    async fn endpoints(&self, opt: RequestOptions) -> KestrelResult<Vec<ServiceEndpoint>> {
        let enc = |w: &mut CborWriter| -> CodecResult<()> {
            encode_endpoints_request(w);
            Ok(())
        };
        let mut out = Vec::new();
        let mut dec = |r: &mut CborReader<'_>| -> CodecResult<()> {
            out = decode_endpoints_response(r)?;
            Ok(())
        };
        self.execute_with_retries(OP_ENDPOINTS, opt, &enc, &mut dec).await?;
        Ok(out)
    }

    async fn close(&self) {
        self.executor.stop_all().await;
        self.pool.close().await;
    }

    async fn reap_idle_connections(&self, max_idle_age: Duration) {
        self.pool.reap_idle_connections(max_idle_age).await;
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn start_health_checks(&self, cluster: &Arc<Cluster>, host: HostPort) {
        tracing::debug!(endpoint = %host, "starting health checks");
        let interval = cluster.health_check_interval();
        let weak_cluster = Arc::downgrade(cluster);
        let weak_self = self.self_ref.clone();
        self.executor.start(interval, move || {
            let weak_cluster = weak_cluster.clone();
            let weak_self = weak_self.clone();
            let host = host.clone();
            async move {
                let (Some(cluster), Some(client)) = (weak_cluster.upgrade(), weak_self.upgrade())
                else {
                    return;
                };
                let opt = RequestOptions {
                    retry_max_attempts: HEALTH_CHECK_RETRIES,
                    retry_delay: Duration::ZERO,
                    deadline: Some(Instant::now() + HEALTH_CHECK_TIMEOUT),
                };
                match NodeApi::endpoints(client.as_ref(), opt).await {
                    Ok(_) => {
                        let route: Arc<dyn NodeApi> = Arc::clone(&client) as Arc<dyn NodeApi>;
                        client.health.on_health_check_success(&route);
                        tracing::trace!(endpoint = %host, "health check succeeded");
                    }
                    Err(e) => {
                        tracing::debug!(endpoint = %host, error = %e, "health check failed");
                        cluster.on_health_check_failed(host).await;
                    }
                }
            }
        });
    }
}
