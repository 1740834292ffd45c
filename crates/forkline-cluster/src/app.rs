// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP application served by each worker.
//!
//! Connections are driven by hyper's http1 server directly so that both
//! timeouts apply: `headers_timeout` bounds how long a client may take to
//! send request headers, and `keep_alive_timeout` closes connections that
//! have seen no traffic for that long.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use forkline_core::{Role, StoreRegistry};
use hyper::Request;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Lower bound on how often idle connections are checked.
const MIN_IDLE_CHECK: Duration = Duration::from_millis(10);

/// HTTP connection timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeOptions {
    pub keep_alive_timeout: Duration,
    pub headers_timeout: Duration,
}

impl ServeOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            keep_alive_timeout: config.keep_alive_timeout,
            headers_timeout: config.headers_timeout,
        }
    }
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            keep_alive_timeout: Duration::from_millis(65_000),
            headers_timeout: Duration::from_millis(66_000),
        }
    }
}

/// Everything an application gets when a worker starts serving.
#[derive(Debug, Clone)]
pub struct ServeContext {
    pub role: Role,
    pub registry: StoreRegistry,
    pub options: ServeOptions,
    /// Flips to `true` when the worker should stop accepting and drain.
    pub shutdown: watch::Receiver<bool>,
}

/// The request handling side of a worker.
#[async_trait]
pub trait Application: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &str;

    /// Serve on `listener` until `ctx.shutdown` fires.
    async fn serve(&self, listener: TcpListener, ctx: ServeContext) -> anyhow::Result<()>;
}

type RouterFactory = dyn Fn(&ServeContext) -> Router + Send + Sync;

/// [`Application`] backed by an axum [`Router`].
pub struct RouterApplication {
    name: String,
    routes: Box<RouterFactory>,
}

impl std::fmt::Debug for RouterApplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterApplication")
            .field("name", &self.name)
            .finish()
    }
}

impl RouterApplication {
    /// Build the router per worker from the serve context.
    pub fn new<F>(name: impl Into<String>, routes: F) -> Self
    where
        F: Fn(&ServeContext) -> Router + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            routes: Box::new(routes),
        }
    }

    /// `GET /health` and `GET /config`, the latter returning the store on
    /// `channel`.
    pub fn with_default_routes(channel: impl Into<String>) -> Self {
        let channel = channel.into();
        Self::new("forkline", move |ctx| default_routes(ctx, &channel))
    }
}

#[async_trait]
impl Application for RouterApplication {
    fn name(&self) -> &str {
        &self.name
    }

    async fn serve(&self, listener: TcpListener, ctx: ServeContext) -> anyhow::Result<()> {
        let router = (self.routes)(&ctx);
        info!(
            app = %self.name,
            role = %ctx.role,
            addr = ?listener.local_addr().ok(),
            "Serving HTTP"
        );
        serve_router(listener, router, ctx.options, ctx.shutdown).await?;
        Ok(())
    }
}

#[derive(Clone)]
struct RouteState {
    role: Role,
    registry: StoreRegistry,
    channel: Arc<str>,
}

/// Router with the built-in endpoints.
pub fn default_routes(ctx: &ServeContext, channel: &str) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/config", get(config_snapshot))
        .with_state(RouteState {
            role: ctx.role,
            registry: ctx.registry.clone(),
            channel: Arc::from(channel),
        })
}

async fn health(State(state): State<RouteState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "role": state.role.to_string(),
        "pid": std::process::id(),
    }))
}

async fn config_snapshot(State(state): State<RouteState>) -> impl IntoResponse {
    let Some(store) = state.registry.get(&state.channel) else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("no store on channel {}", state.channel)})),
        )
            .into_response();
    };
    match store.snapshot().await {
        Ok(document) => Json(document).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

/// Accept connections on `listener` until `shutdown` fires, then wait for
/// open connections to finish their current request.
pub async fn serve_router(
    listener: TcpListener,
    router: Router,
    options: ServeOptions,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted connection");
                    connections.spawn(serve_connection(
                        stream,
                        router.clone(),
                        options,
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown_requested(&mut shutdown) => break,
        }
    }

    drop(listener);
    info!(open = connections.len(), "Draining HTTP connections");
    while connections.join_next().await.is_some() {}
    Ok(())
}

async fn serve_connection(
    stream: TcpStream,
    router: Router,
    options: ServeOptions,
    mut shutdown: watch::Receiver<bool>,
) {
    let activity = Arc::new(Activity::new());
    let io = TokioIo::new(TrackedStream {
        inner: stream,
        activity: activity.clone(),
    });
    let service =
        hyper::service::service_fn(move |req: Request<Incoming>| router.clone().oneshot(req));

    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(options.headers_timeout)
        .keep_alive(true);
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    let mut idle_check =
        tokio::time::interval((options.keep_alive_timeout / 4).max(MIN_IDLE_CHECK));
    let mut closing = false;

    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(error = %e, "Connection ended with error");
                }
                break;
            }
            _ = idle_check.tick(), if !closing => {
                if activity.idle_for() >= options.keep_alive_timeout {
                    debug!("Closing idle keep-alive connection");
                    closing = true;
                    conn.as_mut().graceful_shutdown();
                }
            }
            _ = shutdown_requested(&mut shutdown), if !closing => {
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender also means shut down.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Time of the last byte read or written on a connection.
struct Activity {
    epoch: Instant,
    last_millis: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_millis.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

/// TCP stream that records traffic in an [`Activity`].
struct TrackedStream {
    inner: TcpStream,
    activity: Arc<Activity>,
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.activity.touch();
        }
        poll
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if matches!(poll, Poll::Ready(Ok(n)) if n > 0) {
            this.activity.touch();
        }
        poll
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        if matches!(poll, Poll::Ready(Ok(n)) if n > 0) {
            this.activity.touch();
        }
        poll
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
