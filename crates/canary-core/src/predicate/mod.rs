//! The metric predicate: a background loop that keeps answering "is the
//! canary healthy right now?".
//!
//! On every tick of an injected time source the evaluator runs the
//! configured expression as an instant query against the time-series reader
//! and publishes a boolean verdict:
//!
//! - a successful, non-empty result publishes `true` and clears the failure
//!   run;
//! - an evaluation error (backend unreachable, evaluation failure, deadline
//!   exceeded) publishes `false` but keeps ticking, so a later success can
//!   recover;
//! - an empty result leaves the verdict untouched until it has happened a
//!   configured number of times in a row, at which point the verdict is
//!   latched `false` and the loop stops for good. A predicate that matches
//!   nothing during a startup window should not instantly fail a deploy;
//!   sustained absence of data should.
//!
//! The verdict starts `true`: a deploy must not abort before any evaluation
//! has happened.

mod query;
mod series;


use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub use query::QueryError;

use query::InstantQuery;

use crate::planner::HealthSignal;
use crate::timeseries::MetricReader;

/// Deadline for a single evaluation, reader call included.
const EVALUATION_TIMEOUT: Duration = Duration::from_secs(5);

/// A continuously evaluated health predicate over a metric expression.
pub struct MetricPredicate {
    healthy: Arc<AtomicBool>,
}

impl MetricPredicate {
    /// Parses and validates `query`, then spawns the evaluation loop on the
    /// current tokio runtime. The loop runs until the tick channel closes or
    /// the failure limit latches the verdict.
    ///
    /// # Errors
    ///
    /// Returns a [`QueryError`] when the expression cannot be parsed or a
    /// selector lacks a `source_id` equality matcher. Both are configuration
    /// errors: the caller should refuse to start.
    pub fn spawn(
        query: &str,
        max_failures: usize,
        reader: Arc<dyn MetricReader>,
        ticks: mpsc::Receiver<DateTime<Utc>>,
    ) -> Result<Self, QueryError> {
        let parsed = InstantQuery::parse(query)?;
        let healthy = Arc::new(AtomicBool::new(true));

        tokio::spawn(evaluation_loop(
            parsed,
            max_failures,
            reader,
            ticks,
            healthy.clone(),
        ));

        Ok(Self { healthy })
    }

    /// The current verdict. Non-blocking; read freely from request handlers.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// A cloneable read handle for the verdict, suitable for handing to the
    /// planner.
    #[must_use]
    pub fn probe(&self) -> HealthProbe {
        HealthProbe {
            healthy: self.healthy.clone(),
        }
    }
}

/// A cheap, cloneable view of the predicate's verdict.
#[derive(Clone)]
pub struct HealthProbe {
    healthy: Arc<AtomicBool>,
}

impl HealthProbe {
    /// The current verdict.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

impl HealthSignal for HealthProbe {
    fn is_healthy(&self) -> bool {
        Self::is_healthy(self)
    }
}

async fn evaluation_loop(
    query: InstantQuery,
    max_failures: usize,
    reader: Arc<dyn MetricReader>,
    mut ticks: mpsc::Receiver<DateTime<Utc>>,
    healthy: Arc<AtomicBool>,
) {
    let mut failures = 0usize;

    while let Some(at) = ticks.recv().await {
        let outcome =
            tokio::time::timeout(EVALUATION_TIMEOUT, query.evaluate(reader.as_ref(), at)).await;

        let value = match outcome {
            Err(_) => {
                warn!("metric evaluation timed out");
                healthy.store(false, Ordering::SeqCst);
                continue;
            }
            Ok(Err(err)) => {
                warn!(%err, "metric evaluation failed");
                healthy.store(false, Ordering::SeqCst);
                continue;
            }
            Ok(Ok(value)) => value,
        };

        if value.is_empty() {
            failures += 1;
            debug!(failures, max_failures, "metric query returned no data");
            if failures >= max_failures {
                warn!(
                    failures,
                    "metric query returned no data too many times, marking unhealthy for good"
                );
                healthy.store(false, Ordering::SeqCst);
                return;
            }
            continue;
        }

        failures = 0;
        healthy.store(true, Ordering::SeqCst);
    }
}

/// Builds a tick channel fed by wall time every `period`, for production
/// use. Tests inject their own channel instead.
#[must_use]
pub fn wall_clock_ticks(period: Duration) -> mpsc::Receiver<DateTime<Utc>> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if tx.send(Utc::now()).await.is_err() {
                return;
            }
        }
    });
    rx
}
