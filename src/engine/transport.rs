// Upstream transport strategies: one for plain HTTP origins, one for TLS, picked per
// request from the resolved URL's scheme.

use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue, RANGE, USER_AGENT};
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode, Url};
use tracing::{debug, warn};

use crate::config::ProxyConfig;
use crate::error::StreamError;

/// The caller's `Range` header, kept byte-for-byte. Never parsed here; the origin
/// decides whether a range is satisfiable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSpec(HeaderValue);

impl RangeSpec {
    pub fn new(value: HeaderValue) -> Self {
        Self(value)
    }

    pub fn header_value(&self) -> &HeaderValue {
        &self.0
    }
}

impl std::fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.0.as_bytes()))
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: Url,
    pub range: Option<RangeSpec>,
    pub user_agent: Option<HeaderValue>,
}

pub type UpstreamBody = BoxStream<'static, std::io::Result<Bytes>>;

pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: UpstreamBody,
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Opens one GET against an origin and hands back its headers plus a lazily read body.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// URL scheme this transport serves.
    fn scheme(&self) -> &'static str;

    /// Resolves once response headers arrive. Any failure before that point is reported
    /// here; failures afterwards surface as errors in the body stream.
    async fn open(&self, request: UpstreamRequest) -> Result<UpstreamResponse, StreamError>;
}

/// reqwest-backed transport. Redirects are relayed rather than followed and bodies are
/// never decompressed, so the caller sees exactly what the origin sent.
pub struct HttpTransport {
    client: Client,
    scheme: &'static str,
    connect_timeout: Duration,
    header_timeout: Duration,
}

impl HttpTransport {
    pub fn plain(connect_timeout: Duration, header_timeout: Duration) -> Result<Self> {
        let client = Self::builder(connect_timeout).build()?;
        Ok(Self {
            client,
            scheme: "http",
            connect_timeout,
            header_timeout,
        })
    }

    pub fn tls(connect_timeout: Duration, header_timeout: Duration) -> Result<Self> {
        let client = Self::builder(connect_timeout)
            .use_rustls_tls()
            .https_only(true)
            .build()?;
        Ok(Self {
            client,
            scheme: "https",
            connect_timeout,
            header_timeout,
        })
    }

    fn builder(connect_timeout: Duration) -> reqwest::ClientBuilder {
        // No overall request timeout: it would also cut off long body downloads.
        Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(Policy::none())
            .tcp_nodelay(true)
            .pool_max_idle_per_host(20)
    }
}

#[async_trait]
impl UpstreamTransport for HttpTransport {
    fn scheme(&self) -> &'static str {
        self.scheme
    }

    async fn open(&self, request: UpstreamRequest) -> Result<UpstreamResponse, StreamError> {
        let mut req = self.client.get(request.url.clone());
        if let Some(range) = &request.range {
            req = req.header(RANGE, range.header_value().clone());
        }
        if let Some(ua) = &request.user_agent {
            req = req.header(USER_AGENT, ua.clone());
        }

        let resp = match tokio::time::timeout(self.header_timeout, req.send()).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) if e.is_timeout() => {
                warn!("upstream connect timed out url={}", request.url);
                return Err(StreamError::UpstreamTimeout(self.connect_timeout));
            }
            Ok(Err(e)) => {
                let detail = error_chain(&e);
                warn!("upstream connect failed url={} error={}", request.url, detail);
                return Err(StreamError::UpstreamConnect(detail));
            }
            Err(_) => {
                warn!(
                    "upstream headers not received within {:?} url={}",
                    self.header_timeout, request.url
                );
                return Err(StreamError::UpstreamTimeout(self.header_timeout));
            }
        };

        let status = resp.status();
        let headers = resp.headers().clone();
        debug!(
            "upstream responded status={} content_range={:?} url={}",
            status.as_u16(),
            headers.get(reqwest::header::CONTENT_RANGE),
            request.url
        );

        let body = resp.bytes_stream().map_err(std::io::Error::other).boxed();
        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

fn error_chain(e: &reqwest::Error) -> String {
    let mut out = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        out.push_str(": ");
        out.push_str(&s.to_string());
        source = s.source();
    }
    out
}

/// Per-request transport strategy lookup, injected into the proxy.
#[derive(Clone)]
pub struct TransportSelector {
    plain: Arc<dyn UpstreamTransport>,
    tls: Arc<dyn UpstreamTransport>,
}

impl TransportSelector {
    pub fn new(plain: Arc<dyn UpstreamTransport>, tls: Arc<dyn UpstreamTransport>) -> Self {
        Self { plain, tls }
    }

    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let plain = HttpTransport::plain(config.connect_timeout, config.header_timeout)?;
        let tls = HttpTransport::tls(config.connect_timeout, config.header_timeout)?;
        Ok(Self::new(Arc::new(plain), Arc::new(tls)))
    }

    pub fn select(&self, url: &Url) -> Result<Arc<dyn UpstreamTransport>, StreamError> {
        match url.scheme() {
            "http" => Ok(Arc::clone(&self.plain)),
            "https" => Ok(Arc::clone(&self.tls)),
            other => Err(StreamError::InvalidOrigin(format!(
                "unsupported scheme {}",
                other
            ))),
        }
    }
}

/// Host and effective port of an origin URL; 80/443 when the URL names none.
pub fn origin_authority(url: &Url) -> Option<(String, u16)> {
    let host = url.host_str()?.to_string();
    let port = url.port_or_known_default()?;
    Some((host, port))
}
