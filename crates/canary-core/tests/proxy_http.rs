//! End-to-end proxy behavior over real sockets: two recording upstreams, a
//! proxy in front, a client issuing requests through it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{Request, State};
use axum::http::header;
use canary_core::proxy::{ProxyOptions, SplitProxy, TrafficPlanner};

struct PinnedPlanner(AtomicU32);

impl PinnedPlanner {
    fn at(percentage: u32) -> Arc<Self> {
        Arc::new(Self(AtomicU32::new(percentage)))
    }

    fn set(&self, percentage: u32) {
        self.0.store(percentage, Ordering::SeqCst);
    }
}

impl TrafficPlanner for PinnedPlanner {
    fn current_percentage(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
struct Recorded {
    method: String,
    path_and_query: String,
    host: String,
    body: Vec<u8>,
}

#[derive(Clone, Default)]
struct Upstream {
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl Upstream {
    fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn clear(&self) {
        self.requests.lock().unwrap().clear();
    }

    fn last(&self) -> Recorded {
        self.requests.lock().unwrap().last().unwrap().clone()
    }
}

async fn record(
    State((name, upstream)): State<(&'static str, Upstream)>,
    request: Request,
) -> String {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let method = request.method().to_string();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(ToString::to_string)
        .unwrap_or_default();

    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap();

    upstream.requests.lock().unwrap().push(Recorded {
        method,
        path_and_query,
        host,
        body: body.to_vec(),
    });

    name.to_string()
}

/// Binds an upstream on an ephemeral port and returns its base URL plus the
/// request log.
async fn spawn_upstream(name: &'static str) -> (String, Upstream) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let upstream = Upstream::default();
    let app = Router::new()
        .fallback(record)
        .with_state((name, upstream.clone()));

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), upstream)
}

async fn spawn_proxy(current: &str, canary: &str, planner: Arc<PinnedPlanner>) -> String {
    let proxy = SplitProxy::new(current, canary, planner, ProxyOptions::default()).unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, proxy.router()).await.unwrap();
    });

    format!("http://{addr}")
}

#[tokio::test]
async fn test_follows_the_planner_split() {
    let (current_url, current) = spawn_upstream("current").await;
    let (canary_url, canary) = spawn_upstream("canary").await;
    let planner = PinnedPlanner::at(5);
    let proxy_url = spawn_proxy(&current_url, &canary_url, planner.clone()).await;

    let client = reqwest::Client::new();
    for _ in 0..100 {
        let response = client.get(&proxy_url).send().await.unwrap();
        assert_eq!(response.status(), 200);
    }
    assert_eq!(canary.count(), 5);
    assert_eq!(current.count(), 95);

    planner.set(10);
    current.clear();
    canary.clear();

    for _ in 0..100 {
        client.get(&proxy_url).send().await.unwrap();
    }
    assert_eq!(canary.count(), 10);
    assert_eq!(current.count(), 90);
}

#[tokio::test]
async fn test_rewrites_the_host_header_to_the_upstream_authority() {
    let (current_url, _current) = spawn_upstream("current").await;
    let (canary_url, canary) = spawn_upstream("canary").await;
    let proxy_url = spawn_proxy(&current_url, &canary_url, PinnedPlanner::at(100)).await;

    let client = reqwest::Client::new();
    let response = client
        .get(&proxy_url)
        .header(header::HOST, "canary.example")
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "canary");

    let expected_authority = canary_url.trim_start_matches("http://");
    assert_eq!(canary.last().host, expected_authority);
}

#[tokio::test]
async fn test_forwards_method_path_query_and_body() {
    let (current_url, current) = spawn_upstream("current").await;
    let (canary_url, _canary) = spawn_upstream("canary").await;
    let proxy_url = spawn_proxy(&current_url, &canary_url, PinnedPlanner::at(0)).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{proxy_url}/api/items?page=2"))
        .body("hello upstream")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "current");

    let recorded = current.last();
    assert_eq!(recorded.method, "POST");
    assert_eq!(recorded.path_and_query, "/api/items?page=2");
    assert_eq!(recorded.body, b"hello upstream");
}

#[tokio::test]
async fn test_unreachable_upstream_surfaces_as_bad_gateway() {
    let (current_url, _current) = spawn_upstream("current").await;

    // Bind and immediately drop a listener so the canary port is closed.
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_url = format!("http://{}", dead.local_addr().unwrap());
    drop(dead);

    let proxy_url = spawn_proxy(&current_url, &dead_url, PinnedPlanner::at(100)).await;

    let client = reqwest::Client::new();
    let response = client.get(&proxy_url).send().await.unwrap();
    assert_eq!(response.status(), 502);
}
