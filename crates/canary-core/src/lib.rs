//! # canary-core
//!
//! Core library for the canary traffic router: an HTTP reverse proxy that
//! splits live traffic between a known-good *current* upstream and a *canary*
//! upstream according to a time-phased rollout plan, while a metric predicate
//! is continuously evaluated against a time-series store.
//!
//! ## Building blocks
//!
//! - **Events**: typed lifecycle records written as line-delimited JSON so a
//!   surrounding deployment tool can follow the rollout
//! - **Plan**: the ordered `(percentage, duration)` steps governing how much
//!   traffic the canary receives over time
//! - **Planner**: the state machine that advances through plan steps over
//!   wall time and aborts when the predicate turns unhealthy
//! - **Predicate**: the background evaluator that runs an instant metric
//!   query on every tick and publishes a boolean health verdict
//! - **Proxy**: the split reverse proxy that dispatches each request to one
//!   of the two upstreams
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use canary_core::events::EventWriter;
//! use canary_core::plan::{Plan, PlanStep};
//! use canary_core::planner::RoutePlanner;
//! use canary_core::proxy::{ProxyOptions, SplitProxy};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let plan = Plan::new(vec![
//!     PlanStep::new(5, Duration::from_secs(60))?,
//!     PlanStep::new(50, Duration::from_secs(60))?,
//! ])?;
//!
//! let sink = Arc::new(EventWriter::new(std::io::stdout()));
//! let planner = Arc::new(RoutePlanner::new(plan, || true, sink));
//! let proxy = SplitProxy::new(
//!     "https://current.example.com",
//!     "https://canary.example.com",
//!     planner,
//!     ProxyOptions::default(),
//! )?;
//! let app = proxy.router();
//! # let _ = app;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod events;
pub mod plan;
pub mod planner;
pub mod predicate;
pub mod proxy;
pub mod timeseries;

pub use events::{Event, EventReader, EventSink, EventWriter};
pub use plan::{Plan, PlanStep};
pub use planner::RoutePlanner;
pub use predicate::MetricPredicate;
pub use proxy::{ProxyOptions, SplitProxy};
pub use timeseries::{Envelope, MetricReader};
