//! HTTP relay listener
//!
//! Serves `GET /<channel>`: each accepted request becomes a listener
//! session whose bytes are streamed as the response body.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::stream;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};

use crate::error::Result;
use crate::registry::{ChannelName, ChannelRegistry, RegistryConfig};
use crate::server::config::ServerConfig;
use crate::session::{ChannelSink, ListenerSession};
use crate::stats::ServerStats;
use crate::upstream::{HttpUpstream, UpstreamConfig, UpstreamSource};

/// State shared by every request handler
struct Shared<S: UpstreamSource> {
    config: ServerConfig,
    registry: Arc<ChannelRegistry<S>>,
    next_session_id: AtomicU64,
    listener_semaphore: Option<Arc<Semaphore>>,
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    started_at: Instant,
}

/// Audio relay server
pub struct RelayServer<S: UpstreamSource> {
    shared: Arc<Shared<S>>,
}

impl RelayServer<HttpUpstream> {
    /// Create a server relaying from an HTTP origin
    pub fn with_upstream(
        config: ServerConfig,
        registry_config: RegistryConfig,
        upstream: UpstreamConfig,
    ) -> Result<Self> {
        let source = HttpUpstream::new(&upstream)?;
        let registry = ChannelRegistry::with_config(source, registry_config, upstream);
        Ok(Self::new(config, Arc::new(registry)))
    }
}

impl<S: UpstreamSource> RelayServer<S> {
    /// Create a server over an existing registry
    pub fn new(config: ServerConfig, registry: Arc<ChannelRegistry<S>>) -> Self {
        let listener_semaphore = if config.max_listeners > 0 {
            Some(Arc::new(Semaphore::new(config.max_listeners)))
        } else {
            None
        };

        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                next_session_id: AtomicU64::new(1),
                listener_semaphore,
                total_connections: AtomicU64::new(0),
                active_connections: AtomicU64::new(0),
                rejected_connections: AtomicU64::new(0),
                started_at: Instant::now(),
            }),
        }
    }

    /// Get a reference to the channel registry
    pub fn registry(&self) -> &Arc<ChannelRegistry<S>> {
        &self.shared.registry
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.shared.config.bind_addr
    }

    /// Router serving every channel; mount it to embed the relay
    pub fn router(&self) -> Router {
        Router::new()
            .route("/{*channel}", get(serve_channel::<S>))
            .with_state(Arc::clone(&self.shared))
    }

    /// Run the server
    ///
    /// This method blocks until the server fails.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Run the server until `shutdown` resolves
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.shared.config.bind_addr).await?;

        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.serve(listener) => result,
        }
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "Relay server listening");

        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    /// Snapshot of server counters
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.shared.total_connections.load(Ordering::Relaxed),
            active_connections: self.shared.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.shared.rejected_connections.load(Ordering::Relaxed),
            active_channels: self.shared.registry.channel_count().await as u64,
            uptime: self.shared.started_at.elapsed(),
        }
    }
}

async fn serve_channel<S: UpstreamSource>(
    State(shared): State<Arc<Shared<S>>>,
    Path(path): Path<String>,
) -> Response {
    let name = match ChannelName::new(path) {
        Ok(name) => name,
        Err(e) => {
            tracing::debug!(error = %e, "Rejected request");
            return (StatusCode::NOT_FOUND, e.to_string()).into_response();
        }
    };

    // Check listener limit
    let permit = if let Some(ref sem) = shared.listener_semaphore {
        match Arc::clone(sem).try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                shared.rejected_connections.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(channel = %name, "Listener rejected: limit reached");
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
        }
    } else {
        None
    };

    let session_id = shared.next_session_id.fetch_add(1, Ordering::Relaxed);
    let (sink, rx) = ChannelSink::pair(shared.config.sink_capacity);

    let session = match ListenerSession::attach(
        session_id,
        &shared.registry,
        name.clone(),
        sink,
        shared.config.session,
    )
    .await
    {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(session_id = session_id, channel = %name, error = %e, "Attach failed");
            return (StatusCode::BAD_GATEWAY, e.to_string()).into_response();
        }
    };

    // Hold the headers until the origin delivered something
    if let Err(e) = session.wait_ready().await {
        tracing::warn!(session_id = session_id, channel = %name, error = %e, "Channel unavailable");
        session.close().await;
        return (StatusCode::BAD_GATEWAY, e.to_string()).into_response();
    }

    shared.total_connections.fetch_add(1, Ordering::Relaxed);
    shared.active_connections.fetch_add(1, Ordering::Relaxed);

    let task_shared = Arc::clone(&shared);
    tokio::spawn(async move {
        let _permit = permit;
        let stats = session.run().await;
        task_shared
            .active_connections
            .fetch_sub(1, Ordering::Relaxed);

        tracing::debug!(
            session_id = session_id,
            bytes_sent = stats.bytes_sent,
            resumes = stats.resumes_triggered,
            bitrate = stats.bitrate(),
            "Connection closed"
        );
    });

    stream_response(&shared.config, &name, rx)
}

fn stream_response(config: &ServerConfig, name: &ChannelName, rx: mpsc::Receiver<Bytes>) -> Response {
    let body = Body::from_stream(stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|chunk| (Ok::<_, Infallible>(chunk), rx))
    }));

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(&config.content_type)
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if let Ok(value) = HeaderValue::from_str(name.as_str()) {
        headers.insert("icy-name", value);
    }
    response
}
