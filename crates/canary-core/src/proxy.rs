//! The split reverse proxy: every request goes to exactly one of the two
//! upstreams, and the planner decides how often that is the canary.
//!
//! Dispatch walks a 64-bit counter by a fixed odd stride and compares the
//! residue mod 100 against the planner's live percentage. The stride is
//! coprime to 100, so 100 consecutive requests visit every residue exactly
//! once and a pinned percentage p yields exactly p canary hits per cycle.
//! The counter is seeded randomly so parallel router instances do not
//! phase-lock their canary bursts.
//!
//! The proxy is transparent: method, path, query, headers, and body are
//! forwarded and the upstream's response is streamed back. The one deliberate
//! rewrite is the request authority: the incoming `Host` is dropped so the
//! upstream sees its own, which keeps name-based routers behind the upstream
//! URL from dispatching on the client's host.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::warn;
use url::Url;

/// Amount added to the dispatch counter per request; odd and coprime to 100.
const DISPATCH_STRIDE: u64 = 13;

/// Capability to ask how much traffic the canary should receive right now.
pub trait TrafficPlanner: Send + Sync {
    /// The live percentage (0..=100) of requests to send to the canary.
    fn current_percentage(&self) -> u32;
}

/// Errors constructing a [`SplitProxy`]. All of them are fatal
/// configuration problems.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// An upstream URL did not parse.
    #[error("failed to parse upstream URL ({url}): {source}")]
    InvalidUpstream {
        /// The offending URL text.
        url: String,
        /// The parser's complaint.
        #[source]
        source: url::ParseError,
    },

    /// An upstream URL parsed but is not plain HTTP(S).
    #[error("unsupported upstream scheme '{scheme}' in {url}")]
    UnsupportedScheme {
        /// The offending URL text.
        url: String,
        /// Its scheme.
        scheme: String,
    },

    /// The outbound HTTP client could not be built.
    #[error("failed to build upstream client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Tuning knobs for the proxy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyOptions {
    /// Skip TLS peer verification when connecting to upstreams.
    pub skip_tls_verify: bool,
}

/// The traffic-splitting reverse proxy.
pub struct SplitProxy {
    current: Url,
    canary: Url,
    planner: Arc<dyn TrafficPlanner>,
    client: reqwest::Client,
    idx: AtomicU64,
}

impl SplitProxy {
    /// Builds a proxy over the two upstreams.
    ///
    /// # Errors
    ///
    /// Returns a [`ProxyError`] when either URL is unusable or the outbound
    /// client cannot be constructed.
    pub fn new(
        current: &str,
        canary: &str,
        planner: Arc<dyn TrafficPlanner>,
        options: ProxyOptions,
    ) -> Result<Self, ProxyError> {
        let current = parse_upstream(current)?;
        let canary = parse_upstream(canary)?;

        // Redirects pass through untouched; a transparent proxy must not
        // chase them on the client's behalf.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(options.skip_tls_verify)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(ProxyError::Client)?;

        Ok(Self {
            current,
            canary,
            planner,
            client,
            idx: AtomicU64::new(rand::random()),
        })
    }

    /// Wraps the proxy in a catch-all router: any method, any path.
    #[must_use]
    pub fn router(self) -> Router {
        Router::new()
            .fallback(forward)
            .with_state(Arc::new(self))
    }

    /// Picks the upstream for one request. The percentage is read fresh on
    /// every call; the planner advances underneath us.
    fn pick(&self) -> &Url {
        let idx = self
            .idx
            .fetch_add(DISPATCH_STRIDE, Ordering::Relaxed)
            .wrapping_add(DISPATCH_STRIDE);

        if idx % 100 < u64::from(self.planner.current_percentage()) {
            &self.canary
        } else {
            &self.current
        }
    }

    async fn dispatch(&self, request: Request) -> Response {
        let upstream = self.pick();
        match self.send(upstream, request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(upstream = %upstream, %err, "upstream request failed");
                StatusCode::BAD_GATEWAY.into_response()
            }
        }
    }

    async fn send(&self, upstream: &Url, request: Request) -> Result<Response, reqwest::Error> {
        let (mut parts, body) = request.into_parts();

        strip_hop_by_hop(&mut parts.headers);
        // The outbound client derives the authority from the upstream URL.
        parts.headers.remove(header::HOST);

        let outbound = self
            .client
            .request(parts.method, target_url(upstream, &parts.uri))
            .headers(parts.headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await?;

        let status = outbound.status();
        let mut headers = outbound.headers().clone();
        strip_hop_by_hop(&mut headers);

        let mut response = Response::new(Body::from_stream(outbound.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

async fn forward(State(proxy): State<Arc<SplitProxy>>, request: Request) -> Response {
    proxy.dispatch(request).await
}

fn parse_upstream(raw: &str) -> Result<Url, ProxyError> {
    let url = Url::parse(raw).map_err(|source| ProxyError::InvalidUpstream {
        url: raw.to_string(),
        source,
    })?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(ProxyError::UnsupportedScheme {
            url: raw.to_string(),
            scheme: scheme.to_string(),
        }),
    }
}

/// Grafts the request's path and query onto the upstream's, preserving any
/// path prefix and query the upstream URL carries.
fn target_url(upstream: &Url, uri: &Uri) -> Url {
    let mut url = upstream.clone();

    let base = upstream.path().trim_end_matches('/');
    let path = uri.path();
    if path.is_empty() || path == "/" {
        url.set_path(if base.is_empty() { "/" } else { base });
    } else if path.starts_with('/') {
        url.set_path(&format!("{base}{path}"));
    } else {
        url.set_path(&format!("{base}/{path}"));
    }

    let query = match (upstream.query(), uri.query()) {
        (Some(ours), Some(theirs)) => Some(format!("{ours}&{theirs}")),
        (Some(ours), None) => Some(ours.to_string()),
        (None, Some(theirs)) => Some(theirs.to_string()),
        (None, None) => None,
    };
    url.set_query(query.as_deref());

    url
}

/// Removes connection-scoped headers that must not travel past one hop,
/// including anything the `Connection` header itself names.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| name.trim().parse().ok())
        .collect();
    for name in named {
        headers.remove(name);
    }

    for name in [
        header::CONNECTION,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ] {
        headers.remove(name);
    }
    headers.remove(HeaderName::from_static("keep-alive"));
}
