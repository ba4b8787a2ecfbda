//! The whole rollout loop in one place: a real planner drives a real proxy
//! while a spy sink collects the lifecycle events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use canary_core::events::{self, Event, EventSink};
use canary_core::plan::{Plan, PlanStep};
use canary_core::planner::RoutePlanner;
use canary_core::proxy::{ProxyOptions, SplitProxy};

#[derive(Default)]
struct SpySink {
    events: Mutex<Vec<Event>>,
}

impl EventSink for SpySink {
    fn emit(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl SpySink {
    fn with_code(&self, code: i32) -> Vec<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.code == code)
            .cloned()
            .collect()
    }
}

#[derive(Clone, Default)]
struct HitCounter {
    hits: Arc<Mutex<usize>>,
}

impl HitCounter {
    fn take(&self) -> usize {
        std::mem::take(&mut *self.hits.lock().unwrap())
    }
}

async fn count(State(counter): State<HitCounter>) -> &'static str {
    *counter.hits.lock().unwrap() += 1;
    "ok"
}

async fn spawn_counting_upstream() -> (String, HitCounter) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let counter = HitCounter::default();
    let app = Router::new().fallback(count).with_state(counter.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), counter)
}

#[tokio::test]
async fn test_steady_ramp_to_full_canary() {
    let (current_url, current) = spawn_counting_upstream().await;
    let (canary_url, canary) = spawn_counting_upstream().await;

    let plan = Plan::new(vec![
        PlanStep::new(5, Duration::from_secs(1)).unwrap(),
        PlanStep::new(10, Duration::from_secs(1)).unwrap(),
    ])
    .unwrap();

    let sink = Arc::new(SpySink::default());
    let planner = Arc::new(RoutePlanner::new(plan, || true, sink.clone()));
    let proxy = SplitProxy::new(
        &current_url,
        &canary_url,
        planner,
        ProxyOptions::default(),
    )
    .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, proxy.router()).await.unwrap();
    });

    let client = reqwest::Client::new();
    for _ in 0..100 {
        client.get(&proxy_url).send().await.unwrap();
    }
    assert_eq!(canary.take(), 5);
    assert_eq!(current.take(), 95);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    for _ in 0..100 {
        client.get(&proxy_url).send().await.unwrap();
    }
    assert_eq!(canary.take(), 10);
    assert_eq!(current.take(), 90);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    for _ in 0..100 {
        client.get(&proxy_url).send().await.unwrap();
    }
    assert_eq!(canary.take(), 100);
    assert_eq!(current.take(), 0);

    let next_steps = sink.with_code(events::NEXT_PLAN_STEP);
    assert_eq!(next_steps.len(), 1);
    assert!(
        next_steps[0].message.contains("Percentage:10 Duration:1s"),
        "unexpected message: {}",
        next_steps[0].message
    );
    assert_eq!(sink.with_code(events::FINISHED_PLAN_STEPS).len(), 1);
    assert!(sink.with_code(events::ABORT).is_empty());
}

#[tokio::test]
async fn test_unhealthy_predicate_sends_everything_to_current() {
    let (current_url, current) = spawn_counting_upstream().await;
    let (canary_url, canary) = spawn_counting_upstream().await;

    let plan = Plan::new(vec![PlanStep::new(50, Duration::from_secs(60)).unwrap()]).unwrap();
    let healthy = Arc::new(AtomicBool::new(false));
    let signal = {
        let healthy = healthy.clone();
        move || healthy.load(Ordering::SeqCst)
    };

    let sink = Arc::new(SpySink::default());
    let planner = Arc::new(RoutePlanner::new(plan, signal, sink.clone()));
    let proxy = SplitProxy::new(
        &current_url,
        &canary_url,
        planner,
        ProxyOptions::default(),
    )
    .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, proxy.router()).await.unwrap();
    });

    let client = reqwest::Client::new();
    for _ in 0..50 {
        client.get(&proxy_url).send().await.unwrap();
    }
    assert_eq!(current.take(), 50);
    assert_eq!(canary.take(), 0);

    let aborts = sink.with_code(events::ABORT);
    assert_eq!(aborts.len(), 50);
    assert_eq!(aborts[0].code, events::ABORT);
}
