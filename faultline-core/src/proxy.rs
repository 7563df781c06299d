//! Chaos proxy: a TCP relay that delays (and optionally rewrites) traffic.
//!
//! Each [`ProxyRoute`] listens on one address and relays every accepted
//! connection to one fixed destination. Per connection two copy loops run
//! concurrently, one per [`Direction`]. Every chunk read is held for a
//! uniformly random delay within the route's bounds, passed through the
//! route's [`ChunkTransform`], then written to the peer.
//!
//! ```text
//!  client ──► listen ──[upstream: read, delay, transform, write]──► destination
//!  client ◄──────────[downstream: read, delay, transform, write]◄── destination
//! ```
//!
//! There is no half-close: when either loop ends both sockets are closed.
//! Connection failures stay inside their connection. Accept failures are
//! retried with backoff until `max_accept_failures` consecutive failures,
//! after which the route is declared dead.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::error::ProxyError;
use crate::shutdown::Shutdown;

/// Direction of a relayed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to destination.
    Upstream,
    /// Destination to client.
    Downstream,
}

impl Direction {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upstream => "upstream",
            Direction::Downstream => "downstream",
        }
    }
}

/// Per-chunk observer/mutator.
///
/// `transform` may rewrite `chunk` in place and returns how many leading
/// bytes to forward. Values larger than the chunk are clamped.
pub trait ChunkTransform: Send + Sync {
    /// Inspect or rewrite one chunk travelling in `direction`.
    fn transform(&self, chunk: &mut [u8], direction: Direction) -> usize;
}

/// Forwards every chunk unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

impl ChunkTransform for Identity {
    fn transform(&self, chunk: &mut [u8], _direction: Direction) -> usize {
        chunk.len()
    }
}

/// One relay route.
#[derive(Clone, Deserialize)]
pub struct ProxyRoute {
    /// Address to listen on.
    pub listen: SocketAddr,
    /// `host:port` to relay to.
    pub destination: String,
    /// Lower delay bound in milliseconds.
    #[serde(default)]
    pub min_delay_ms: u64,
    /// Upper delay bound in milliseconds.
    #[serde(default)]
    pub max_delay_ms: u64,
    /// Read buffer size per direction (default: 4096).
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Consecutive accept failures before the route is declared dead
    /// (default: 16, 0 retries forever).
    #[serde(default = "default_max_accept_failures")]
    pub max_accept_failures: u32,
    /// Chunk transform (identity unless set in code).
    #[serde(skip, default = "default_transform")]
    pub transform: Arc<dyn ChunkTransform>,
}

fn default_buffer_size() -> usize {
    4096
}

fn default_max_accept_failures() -> u32 {
    16
}

fn default_transform() -> Arc<dyn ChunkTransform> {
    Arc::new(Identity)
}

impl std::fmt::Debug for ProxyRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRoute")
            .field("listen", &self.listen)
            .field("destination", &self.destination)
            .field("min_delay_ms", &self.min_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("buffer_size", &self.buffer_size)
            .field("max_accept_failures", &self.max_accept_failures)
            .finish_non_exhaustive()
    }
}

impl ProxyRoute {
    /// A pass-through route with default buffer size.
    pub fn new(listen: SocketAddr, destination: impl Into<String>) -> Self {
        Self {
            listen,
            destination: destination.into(),
            min_delay_ms: 0,
            max_delay_ms: 0,
            buffer_size: default_buffer_size(),
            max_accept_failures: default_max_accept_failures(),
            transform: default_transform(),
        }
    }

    /// Set the delay bounds.
    pub fn delay(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.min_delay_ms = min_ms;
        self.max_delay_ms = max_ms;
        self
    }

    /// Set the read buffer size.
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set the chunk transform.
    pub fn transform(mut self, transform: impl ChunkTransform + 'static) -> Self {
        self.transform = Arc::new(transform);
        self
    }

    /// Check the route for internal consistency.
    pub fn validate(&self) -> Result<(), ProxyError> {
        let invalid = |reason: String| ProxyError::InvalidRoute {
            listen: self.listen,
            destination: self.destination.clone(),
            reason,
        };

        if self.min_delay_ms > self.max_delay_ms {
            return Err(invalid(format!(
                "min_delay_ms ({}) exceeds max_delay_ms ({})",
                self.min_delay_ms, self.max_delay_ms
            )));
        }
        if self.buffer_size == 0 {
            return Err(invalid("buffer_size must be nonzero".into()));
        }
        if self.destination.is_empty() {
            return Err(invalid("destination is empty".into()));
        }
        Ok(())
    }

    /// Delay to apply to the next chunk. Only applies when both bounds are nonzero.
    fn sample_delay(&self) -> Option<Duration> {
        if self.min_delay_ms == 0 || self.max_delay_ms == 0 {
            return None;
        }
        let ms = rand::thread_rng().gen_range(self.min_delay_ms..=self.max_delay_ms);
        Some(Duration::from_millis(ms))
    }
}

/// Relay counters for one route.
///
/// All counters are monotonically increasing.
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    /// Connections accepted.
    pub connections_total: AtomicU64,
    /// Destination dials that failed.
    pub dial_failures: AtomicU64,
    /// Listener accept errors.
    pub accept_failures: AtomicU64,
    /// Bytes forwarded client to destination.
    pub bytes_upstream: AtomicU64,
    /// Bytes forwarded destination to client.
    pub bytes_downstream: AtomicU64,
}

impl ProxyMetrics {
    fn bytes(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::Upstream => &self.bytes_upstream,
            Direction::Downstream => &self.bytes_downstream,
        }
    }
}

/// A bound chaos proxy, ready to serve.
#[derive(Debug)]
pub struct ChaosProxy {
    route: ProxyRoute,
    listener: TcpListener,
    local_addr: SocketAddr,
    metrics: Arc<ProxyMetrics>,
}

impl ChaosProxy {
    /// Validate the route and bind its listener.
    ///
    /// # Errors
    ///
    /// [`ProxyError::InvalidRoute`] or [`ProxyError::Listen`].
    pub async fn bind(route: ProxyRoute) -> Result<Self, ProxyError> {
        route.validate()?;

        let listener = TcpListener::bind(route.listen)
            .await
            .map_err(|source| ProxyError::Listen {
                addr: route.listen,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ProxyError::Listen {
            addr: route.listen,
            source,
        })?;

        tracing::info!(
            "Chaos proxy listening on {} -> {} (delay {}-{}ms)",
            local_addr,
            route.destination,
            route.min_delay_ms,
            route.max_delay_ms
        );

        Ok(Self {
            route,
            listener,
            local_addr,
            metrics: Arc::new(ProxyMetrics::default()),
        })
    }

    /// Bind the route and spawn its accept loop.
    pub async fn listen(route: ProxyRoute, shutdown: Shutdown) -> Result<ProxyHandle, ProxyError> {
        let proxy = Self::bind(route).await?;
        let local_addr = proxy.local_addr;
        let metrics = proxy.metrics.clone();
        let task = tokio::spawn(proxy.serve(shutdown));

        Ok(ProxyHandle {
            local_addr,
            metrics,
            task,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Relay counters.
    pub fn metrics(&self) -> Arc<ProxyMetrics> {
        self.metrics.clone()
    }

    /// Run the accept loop until shutdown or until the route is declared dead.
    ///
    /// Connections already being relayed keep running after this returns.
    pub async fn serve(self, mut shutdown: Shutdown) -> Result<(), ProxyError> {
        let mut failures = 0u32;

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown.wait() => {
                    tracing::info!("Chaos proxy on {} stopped", self.local_addr);
                    return Ok(());
                }
            };

            match accepted {
                Ok((inbound, peer)) => {
                    failures = 0;
                    self.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(relay(
                        inbound,
                        peer,
                        self.route.clone(),
                        self.metrics.clone(),
                    ));
                }
                Err(source) => {
                    failures += 1;
                    self.metrics.accept_failures.fetch_add(1, Ordering::Relaxed);

                    let limit = self.route.max_accept_failures;
                    if limit > 0 && failures >= limit {
                        tracing::error!(
                            "Chaos proxy on {} giving up after {} accept failures: {}",
                            self.local_addr,
                            failures,
                            source
                        );
                        return Err(ProxyError::RouteDead {
                            addr: self.local_addr,
                            failures,
                            source,
                        });
                    }

                    let backoff = accept_backoff(failures);
                    tracing::warn!(
                        "Accept failed on {} ({}), retrying in {:?}",
                        self.local_addr,
                        source,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

/// Running proxy returned by [`ChaosProxy::listen`].
#[derive(Debug)]
pub struct ProxyHandle {
    local_addr: SocketAddr,
    metrics: Arc<ProxyMetrics>,
    task: JoinHandle<Result<(), ProxyError>>,
}

impl ProxyHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Relay counters.
    pub fn metrics(&self) -> Arc<ProxyMetrics> {
        self.metrics.clone()
    }

    /// Wait for the accept loop to end.
    pub async fn join(self) -> Result<(), ProxyError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ProxyError::Connection(std::io::Error::other(e))),
        }
    }

    /// Stop the accept loop without waiting.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// 10ms doubling per consecutive failure, capped at one second.
fn accept_backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(7);
    Duration::from_millis((10u64 << exp).min(1000))
}

async fn relay(inbound: TcpStream, peer: SocketAddr, route: ProxyRoute, metrics: Arc<ProxyMetrics>) {
    let outbound = match TcpStream::connect(&route.destination).await {
        Ok(stream) => stream,
        Err(e) => {
            metrics.dial_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "Dial {} failed for client {}: {}",
                route.destination,
                peer,
                e
            );
            return;
        }
    };

    let _ = inbound.set_nodelay(true);
    let _ = outbound.set_nodelay(true);
    tracing::debug!("Relaying {} -> {}", peer, route.destination);

    let (client_read, client_write) = inbound.into_split();
    let (dest_read, dest_write) = outbound.into_split();

    let upstream = pump(client_read, dest_write, Direction::Upstream, &route, &metrics);
    let downstream = pump(dest_read, client_write, Direction::Downstream, &route, &metrics);

    // First loop to finish ends the connection; dropping the other closes both sockets.
    let (direction, result) = tokio::select! {
        result = upstream => (Direction::Upstream, result),
        result = downstream => (Direction::Downstream, result),
    };
    match result {
        Ok(bytes) => tracing::debug!(
            "Connection {} closed ({} ended after {} bytes)",
            peer,
            direction.as_str(),
            bytes
        ),
        Err(e) => tracing::debug!(
            "Connection {} closed ({} failed: {})",
            peer,
            direction.as_str(),
            e
        ),
    }
}

async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    route: &ProxyRoute,
    metrics: &ProxyMetrics,
) -> Result<u64, ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; route.buffer_size];
    let mut forwarded = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(forwarded);
        }

        if let Some(delay) = route.sample_delay() {
            tokio::time::sleep(delay).await;
        }

        let len = route.transform.transform(&mut buf[..n], direction).min(n);
        if len > 0 {
            writer.write_all(&buf[..len]).await?;
        }

        forwarded += len as u64;
        metrics.bytes(direction).fetch_add(len as u64, Ordering::Relaxed);
    }
}
