// Axum request handlers: translate player HTTP requests into stream proxy calls.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::access::token::Credential;
use crate::config::EXPOSED_HEADERS;
use crate::engine::origin::StreamTarget;
use crate::engine::proxy::{StreamProxy, StreamRequest};
use crate::engine::stats::StatsSnapshot;
use crate::engine::transport::RangeSpec;

pub struct ProxyServer {
    port: u16,
    proxy: Arc<StreamProxy>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ProxyServer {
    /// Bind `addr` (port 0 picks a free one) and start serving in the background.
    pub async fn start(proxy: Arc<StreamProxy>, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let app = router(proxy.clone());

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                warn!("stream server exited with error: {}", e);
            }
        });

        info!("stream server listening on {}:{}", addr.ip(), port);
        Ok(Self {
            port,
            proxy,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Loopback URL for streaming a content item.
    pub fn url_for_content(&self, content_id: &str) -> String {
        format!(
            "http://127.0.0.1:{}/api/content/{}/stream",
            self.port, content_id
        )
    }

    /// Loopback URL for streaming one episode of a series.
    pub fn url_for_episode(&self, content_id: &str, index: usize) -> String {
        format!(
            "http://127.0.0.1:{}/api/content/{}/episodes/{}/stream",
            self.port, content_id, index
        )
    }

    pub fn proxy(&self) -> &Arc<StreamProxy> {
        &self.proxy
    }

    /// Stop accepting connections and abort in-flight relays.
    pub fn shutdown(mut self) {
        self.signal_shutdown();
    }

    /// Like [`shutdown`](Self::shutdown), but waits for the server task to finish.
    pub async fn shutdown_and_wait(mut self) {
        self.signal_shutdown();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn signal_shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.proxy.cancel_streams();
    }
}

/// Build the HTTP routes around a stream proxy.
pub fn router(proxy: Arc<StreamProxy>) -> Router {
    Router::new()
        .route(
            "/api/content/{id}/stream",
            get(stream_handler).options(preflight_handler),
        )
        .route(
            "/api/content/{id}/episodes/{index}/stream",
            get(episode_stream_handler).options(preflight_handler),
        )
        .route("/api/stream/stats", get(stats_handler))
        .with_state(proxy)
}

#[derive(Debug, Default, Deserialize)]
struct StreamQuery {
    /// Media elements cannot set headers, so a token may also ride in the query.
    token: Option<String>,
}

/// Pull the bits the proxy cares about out of the inbound request. Only `Range` and
/// `User-Agent` are ever forwarded.
fn build_request(
    content_id: String,
    target: StreamTarget,
    headers: &HeaderMap,
    query: StreamQuery,
) -> StreamRequest {
    // The query token only stands in when no Authorization header was sent at all.
    let credential = match headers.get(header::AUTHORIZATION) {
        Some(value) => value.to_str().ok().and_then(Credential::from_authorization),
        None => query
            .token
            .filter(|t| !t.trim().is_empty())
            .map(Credential::new),
    };

    StreamRequest {
        content_id,
        target,
        range: headers.get(header::RANGE).cloned().map(RangeSpec::new),
        credential,
        user_agent: headers.get(header::USER_AGENT).cloned(),
    }
}

async fn serve(proxy: &StreamProxy, request: StreamRequest) -> Response {
    debug!(
        "stream request content={} target={:?} range={:?}",
        request.content_id, request.target, request.range
    );
    match proxy.stream(request).await {
        Ok(relayed) => relayed.into_response(),
        Err(e) => {
            let mut response = e.into_response();
            response.headers_mut().insert(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                proxy.allow_origin().clone(),
            );
            response
        }
    }
}

/// GET /api/content/{id}/stream: relay the item's video with Range support.
async fn stream_handler(
    State(proxy): State<Arc<StreamProxy>>,
    Path(content_id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Response {
    let request = build_request(content_id, StreamTarget::Main, &headers, query);
    serve(&proxy, request).await
}

/// GET /api/content/{id}/episodes/{index}/stream: relay one episode of a series.
async fn episode_stream_handler(
    State(proxy): State<Arc<StreamProxy>>,
    Path((content_id, index)): Path<(String, usize)>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Response {
    let request = build_request(content_id, StreamTarget::Episode(index), &headers, query);
    serve(&proxy, request).await
}

/// OPTIONS: CORS preflight for browser players sending `Range` / `Authorization`.
async fn preflight_handler(State(proxy): State<Arc<StreamProxy>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        proxy.allow_origin().clone(),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, HEAD, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Range, Authorization"),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(EXPOSED_HEADERS),
    );
    (StatusCode::NO_CONTENT, headers).into_response()
}

/// GET /api/stream/stats: live relay counters.
async fn stats_handler(State(proxy): State<Arc<StreamProxy>>) -> Json<StatsSnapshot> {
    Json(proxy.stats().snapshot())
}
