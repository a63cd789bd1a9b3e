// Stream proxy core: access check, origin resolution, upstream open, relay.

use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::origin::{OriginResolver, StreamTarget};
use super::relay::{start_relay, OpenUpstream, RelayBody};
use super::session::{ProxySession, SessionState};
use super::stats::StatsCollector;
use super::transport::{
    origin_authority, RangeSpec, TransportSelector, UpstreamRequest, UpstreamResponse,
};
use crate::access::gate::{AccessDecision, AccessGate};
use crate::access::token::Credential;
use crate::catalog::traits::ContentCatalog;
use crate::config::{ProxyConfig, EXPOSED_HEADERS};
use crate::error::StreamError;

/// Connection-scoped headers that must not be copied between hops.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// One inbound play/seek request.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub content_id: String,
    pub target: StreamTarget,
    pub range: Option<RangeSpec>,
    pub credential: Option<Credential>,
    pub user_agent: Option<HeaderValue>,
}

impl StreamRequest {
    pub fn new(content_id: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            target: StreamTarget::Main,
            range: None,
            credential: None,
            user_agent: None,
        }
    }
}

/// The origin's status and headers plus a live body relay.
pub struct RelayedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: RelayBody,
}

impl IntoResponse for RelayedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from_stream(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

pub struct StreamProxy {
    catalog: Arc<dyn ContentCatalog>,
    gate: AccessGate,
    resolver: OriginResolver,
    transports: TransportSelector,
    stats: Arc<StatsCollector>,
    allow_origin: HeaderValue,
    channel_capacity: usize,
    shutdown: CancellationToken,
}

impl StreamProxy {
    pub fn new(
        catalog: Arc<dyn ContentCatalog>,
        gate: AccessGate,
        transports: TransportSelector,
        config: &ProxyConfig,
    ) -> Self {
        let allow_origin = HeaderValue::from_str(&config.allow_origin).unwrap_or_else(|_| {
            warn!(
                "invalid allow-origin {:?}, falling back to *",
                config.allow_origin
            );
            HeaderValue::from_static("*")
        });
        Self {
            catalog,
            gate,
            resolver: OriginResolver::new(),
            transports,
            stats: Arc::new(StatsCollector::new()),
            allow_origin,
            channel_capacity: config.channel_capacity,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    pub fn allow_origin(&self) -> &HeaderValue {
        &self.allow_origin
    }

    /// Abort every in-flight relay. New requests are still served.
    pub fn cancel_streams(&self) {
        self.shutdown.cancel();
    }

    /// Serve one stream request.
    pub async fn stream(&self, request: StreamRequest) -> Result<RelayedResponse, StreamError> {
        let mut session = ProxySession::new(&request.content_id, Arc::clone(&self.stats));

        let upstream = match self.open_upstream(&mut session, &request).await {
            Ok(upstream) => upstream,
            Err(e) => {
                session.fail(e.status().as_u16());
                return Err(e);
            }
        };
        session.advance(SessionState::UpstreamHeadersReceived);

        let UpstreamResponse {
            status,
            headers: upstream_headers,
            body,
        } = upstream;
        let headers = relay_headers(&upstream_headers, &self.allow_origin);
        let upstream = OpenUpstream::new(body, Arc::clone(&self.stats));
        let body = start_relay(
            session,
            upstream,
            self.channel_capacity,
            self.shutdown.child_token(),
        );

        Ok(RelayedResponse {
            status,
            headers,
            body,
        })
    }

    async fn open_upstream(
        &self,
        session: &mut ProxySession,
        request: &StreamRequest,
    ) -> Result<UpstreamResponse, StreamError> {
        let record = self
            .catalog
            .get_content_by_id(&request.content_id)
            .await?
            .ok_or(StreamError::ContentNotFound)?;

        match self
            .gate
            .check_access(record.access, request.credential.as_ref())
            .await?
        {
            AccessDecision::Granted(principal) => {
                debug!(
                    "session {} access granted content={} principal={:?}",
                    session.session_id, record.id, principal
                );
            }
            AccessDecision::Denied(denial) => {
                warn!(
                    "session {} access denied content={} reason={}",
                    session.session_id, record.id, denial
                );
                return Err(StreamError::AccessDenied(denial));
            }
        }
        session.advance(SessionState::AccessChecked);

        let url = self.resolver.resolve_target(&record, request.target)?;
        session.advance(SessionState::OriginResolved);

        let transport = self.transports.select(&url)?;
        if let Some((host, port)) = origin_authority(&url) {
            info!(
                "session {} connecting to origin {}:{} via {} range={}",
                session.session_id,
                host,
                port,
                transport.scheme(),
                request
                    .range
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "-".to_string())
            );
        }
        session.advance(SessionState::UpstreamConnecting);

        transport
            .open(UpstreamRequest {
                url,
                range: request.range.clone(),
                user_agent: request.user_agent.clone(),
            })
            .await
            .inspect_err(|_| self.stats.record_upstream_failure())
    }
}

/// Copy the origin's end-to-end headers and stamp the cross-origin ones browser players need.
pub fn relay_headers(upstream: &HeaderMap, allow_origin: &HeaderValue) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len() + 2);
    for (name, value) in upstream {
        if is_hop_by_hop(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin.clone());
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(EXPOSED_HEADERS),
    );
    headers
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::{stream, StreamExt};

    use super::*;
    use crate::access::gate::Denial;
    use crate::access::token::JwtVerifier;
    use crate::catalog::memory::{MemoryCatalog, MemorySubscriptions};
    use crate::catalog::model::{ContentRecord, Visibility};
    use crate::engine::transport::UpstreamTransport;

    /// Counts opens and serves a fixed body; never touches the network.
    struct CountingTransport {
        scheme: &'static str,
        opens: AtomicUsize,
    }

    #[async_trait]
    impl UpstreamTransport for CountingTransport {
        fn scheme(&self) -> &'static str {
            self.scheme
        }

        async fn open(&self, request: UpstreamRequest) -> Result<UpstreamResponse, StreamError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
            let status = if let Some(range) = request.range {
                headers.insert(header::CONTENT_RANGE, range.header_value().clone());
                StatusCode::PARTIAL_CONTENT
            } else {
                StatusCode::OK
            };
            let body = stream::iter(vec![Ok(Bytes::from_static(b"video"))]).boxed();
            Ok(UpstreamResponse {
                status,
                headers,
                body,
            })
        }
    }

    struct Fixture {
        proxy: StreamProxy,
        plain: Arc<CountingTransport>,
        tls: Arc<CountingTransport>,
        verifier: JwtVerifier,
    }

    fn fixture() -> Fixture {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.insert(ContentRecord::movie("free", Visibility::Free, "http://origin.test/free.mp4"));
        catalog.insert(ContentRecord::movie("paid", Visibility::Paid, "https://origin.test/paid.mp4"));
        catalog.insert(ContentRecord::movie("empty", Visibility::Free, ""));

        let verifier = JwtVerifier::new("proxy-test");
        let gate = AccessGate::new(
            Arc::new(verifier.clone()),
            Arc::new(MemorySubscriptions::new()),
        );
        let plain = Arc::new(CountingTransport {
            scheme: "http",
            opens: AtomicUsize::new(0),
        });
        let tls = Arc::new(CountingTransport {
            scheme: "https",
            opens: AtomicUsize::new(0),
        });
        let transports = TransportSelector::new(plain.clone(), tls.clone());
        let proxy = StreamProxy::new(catalog, gate, transports, &ProxyConfig::default());
        Fixture {
            proxy,
            plain,
            tls,
            verifier,
        }
    }

    fn opens(f: &Fixture) -> usize {
        f.plain.opens.load(Ordering::SeqCst) + f.tls.opens.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_unknown_content_never_connects() {
        let f = fixture();
        let result = f.proxy.stream(StreamRequest::new("missing")).await;
        assert!(matches!(result, Err(StreamError::ContentNotFound)));
        assert_eq!(opens(&f), 0);
    }

    #[tokio::test]
    async fn test_denied_before_any_io() {
        let f = fixture();
        let result = f.proxy.stream(StreamRequest::new("paid")).await;
        assert!(matches!(
            result,
            Err(StreamError::AccessDenied(Denial::NoCredential))
        ));

        let mut request = StreamRequest::new("paid");
        request.credential = Some(Credential::new(f.verifier.issue("nobody", 60).unwrap()));
        let result = f.proxy.stream(request).await;
        assert!(matches!(
            result,
            Err(StreamError::AccessDenied(Denial::SubscriptionRequired))
        ));
        assert_eq!(opens(&f), 0);
    }

    #[tokio::test]
    async fn test_missing_origin_never_connects() {
        let f = fixture();
        let result = f.proxy.stream(StreamRequest::new("empty")).await;
        assert!(matches!(result, Err(StreamError::NoVideo)));
        assert_eq!(opens(&f), 0);
    }

    #[tokio::test]
    async fn test_transport_picked_by_scheme_and_range_forwarded() {
        let f = fixture();
        let mut request = StreamRequest::new("free");
        request.range = Some(RangeSpec::new(HeaderValue::from_static("bytes=0-4")));
        let relayed = f.proxy.stream(request).await.unwrap();

        assert_eq!(relayed.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(relayed.headers[header::CONTENT_RANGE], "bytes=0-4");
        assert_eq!(relayed.headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(f.plain.opens.load(Ordering::SeqCst), 1);
        assert_eq!(f.tls.opens.load(Ordering::SeqCst), 0);

        let chunks: Vec<_> = relayed.body.collect().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref().unwrap(), &Bytes::from_static(b"video"));
    }

    #[test]
    fn test_relay_headers_strips_hop_by_hop() {
        let mut upstream = HeaderMap::new();
        upstream.insert(header::CONTENT_LENGTH, HeaderValue::from_static("100"));
        upstream.insert(header::CONTENT_RANGE, HeaderValue::from_static("bytes 100-199/1000"));
        upstream.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        upstream.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        upstream.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        upstream.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("https://cdn.test"),
        );
        upstream.append(header::SET_COOKIE, HeaderValue::from_static("a=1"));
        upstream.append(header::SET_COOKIE, HeaderValue::from_static("b=2"));

        let origin = HeaderValue::from_static("https://app.test");
        let headers = relay_headers(&upstream, &origin);

        assert_eq!(headers[header::CONTENT_LENGTH], "100");
        assert_eq!(headers[header::CONTENT_RANGE], "bytes 100-199/1000");
        assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://app.test");
        assert_eq!(headers.get_all(header::SET_COOKIE).iter().count(), 2);
    }

    #[test]
    fn test_invalid_allow_origin_falls_back() {
        let config = ProxyConfig {
            allow_origin: "bad\norigin".to_string(),
            ..ProxyConfig::default()
        };
        let catalog = Arc::new(MemoryCatalog::new());
        let gate = AccessGate::new(
            Arc::new(JwtVerifier::new("x")),
            Arc::new(MemorySubscriptions::new()),
        );
        let selector = TransportSelector::from_config(&config).unwrap();
        let proxy = StreamProxy::new(catalog, gate, selector, &config);
        assert_eq!(proxy.allow_origin(), "*");
    }
}
