//! One framed connection to a cache node.
//!
//! A tube carries a byte stream plus the per-connection state the execute
//! pipeline needs: a read buffer compatible with the codec's resumable
//! decode, an absolute deadline applied to every I/O future, an auth cache
//! and the pool session it belongs to.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BytesMut};
use kestrel_common::{KestrelError, KestrelResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// The byte stream a tube runs over. An injected dialer may return plain
/// TCP, TLS, or an in-memory stream for tests.
pub trait Conn: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin> Conn for T {}

pub type DialFuture = Pin<Box<dyn Future<Output = io::Result<Box<dyn Conn>>> + Send>>;

/// Dial function: address in `host:port` form to an established stream.
pub type DialFn = Arc<dyn Fn(String) -> DialFuture + Send + Sync>;

/// The system dialer: plain TCP with Nagle disabled.
pub fn default_dialer() -> DialFn {
    Arc::new(|address: String| {
        Box::pin(async move {
            let stream = TcpStream::connect(&address).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as Box<dyn Conn>)
        }) as DialFuture
    })
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

const READ_CHUNK: usize = 4096;

pub struct Tube {
    conn: Box<dyn Conn>,
    session: u64,
    auth_id: String,
    auth_expiry_unix: i64,
    last_used_unix: i64,
    deadline: Option<Instant>,
    read_buf: BytesMut,
}

impl Tube {
    pub fn new(conn: Box<dyn Conn>, session: u64) -> Tube {
        Tube {
            conn,
            session,
            auth_id: String::new(),
            auth_expiry_unix: 0,
            last_used_unix: unix_now(),
            deadline: None,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Install the absolute deadline for subsequent I/O. Fails with
    /// `DeadlineExceeded` when the deadline has already passed.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) -> KestrelResult<()> {
        if let Some(d) = deadline {
            if d <= Instant::now() {
                return Err(KestrelError::DeadlineExceeded);
            }
        }
        self.deadline = deadline;
        Ok(())
    }

    /// Swap the cached auth identity. Returns true when it changed, meaning
    /// the connection must re-authenticate.
    pub fn compare_and_swap_auth_id(&mut self, access_key_id: &str) -> bool {
        if self.auth_id == access_key_id {
            return false;
        }
        self.auth_id = access_key_id.to_string();
        true
    }

    pub fn auth_expiry_unix(&self) -> i64 {
        self.auth_expiry_unix
    }

    pub fn set_auth_expiry_unix(&mut self, expiry: i64) {
        self.auth_expiry_unix = expiry;
    }

    pub fn last_used_unix(&self) -> i64 {
        self.last_used_unix
    }

    pub fn touch(&mut self) {
        self.last_used_unix = unix_now();
    }

    #[cfg(test)]
    pub(crate) fn set_last_used_unix(&mut self, t: i64) {
        self.last_used_unix = t;
    }

    async fn with_deadline<T>(
        deadline: Option<Instant>,
        fut: impl Future<Output = io::Result<T>>,
    ) -> KestrelResult<T> {
        match deadline {
            Some(d) => match tokio::time::timeout_at(d.into(), fut).await {
                Ok(res) => Ok(res?),
                Err(_) => Err(KestrelError::DeadlineExceeded),
            },
            None => Ok(fut.await?),
        }
    }

    /// Write a complete frame and flush it.
    pub async fn write_all_flush(&mut self, bytes: &[u8]) -> KestrelResult<()> {
        let deadline = self.deadline;
        let conn = &mut self.conn;
        Self::with_deadline(deadline, async move {
            conn.write_all(bytes).await?;
            conn.flush().await
        })
        .await
    }

    /// Bytes of the response read so far but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.read_buf
    }

    /// Drop `n` decoded bytes from the front of the read buffer.
    pub fn consume(&mut self, n: usize) {
        self.read_buf.advance(n);
    }

    /// Read at least one more byte into the buffer. A clean remote close is
    /// an unexpected-eof error: responses are always complete items.
    pub async fn fill(&mut self) -> KestrelResult<()> {
        let deadline = self.deadline;
        let conn = &mut self.conn;
        let buf = &mut self.read_buf;
        Self::with_deadline(deadline, async move {
            buf.reserve(READ_CHUNK);
            let n = conn.read_buf(buf).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-response",
                ));
            }
            Ok(())
        })
        .await
    }

    /// Shut the stream down, ignoring errors from an already-dead peer.
    pub async fn close(mut self) {
        let _ = self.conn.shutdown().await;
    }
}

impl std::fmt::Debug for Tube {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tube")
            .field("session", &self.session)
            .field("auth_id", &self.auth_id)
            .field("auth_expiry_unix", &self.auth_expiry_unix)
            .field("last_used_unix", &self.last_used_unix)
            .field("buffered", &self.read_buf.len())
            .finish()
    }
}
