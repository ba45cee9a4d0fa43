//! Cluster-aware client for the kestrel in-memory cache.
//!
//! The client discovers the cluster from seed endpoints, keeps one
//! connection pool per node, authenticates connections lazily, spreads
//! requests round-robin across healthy nodes and retries recoverable
//! failures on other routes. Request and response bodies are opaque to the
//! core: operations supply encode/decode callbacks over the wire codec.

pub mod cache;
pub mod cluster;
pub mod health;
pub mod node;
pub mod pool;
pub mod retry;
pub mod routes;
pub mod service;
pub mod sig;
pub mod tube;

pub use cache::{CacheKey, SingleFlightCache};
pub use cluster::{ClientBuilder, Cluster, ClusterClient, SingleClientBuilder};
pub use health::{HealthStatus, RouteListener};
pub use kestrel_codec::{AttributeValue, CborReader, CborWriter};
pub use kestrel_common::{Config, Credentials, CredentialsProvider, HostPort, KestrelError,
    KestrelResult, StaticCredentialsProvider};
pub use node::{NodeApi, NodeClient, RequestOptions};
pub use pool::{TubePool, TubePoolOptions};
pub use retry::Retryer;
pub use routes::RouteManager;
pub use service::ServiceEndpoint;
pub use tube::{Conn, DialFn, Tube};
