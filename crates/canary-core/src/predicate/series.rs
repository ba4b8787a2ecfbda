//! Glue between the raw envelope stream and the query engine.
//!
//! A selector turns into a single read against its `source_id`. The returned
//! envelopes are filtered down to the selector's metric name and tag
//! matchers, their timestamps are bucketed so samples from different series
//! align, and they are partitioned into series by their full tag set. The
//! engine then sees one instant sample per series: the latest one in the
//! window.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::warn;

use super::query::{EvalError, MatchOp, Matcher, Sample, Selector};
use crate::timeseries::{MetricReader, ReadOptions};

/// Envelope timestamps are bucketed down to this interval before the engine
/// sees them.
const SAMPLE_INTERVAL_NANOS: i64 = 1_000_000_000;

/// Resolves a selector to its instant samples at the end of the window.
pub(crate) async fn select(
    reader: &dyn MetricReader,
    selector: &Selector,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<Sample>, EvalError> {
    let envelopes = reader
        .read(
            &selector.source_id,
            start,
            ReadOptions {
                end_time: Some(end),
            },
        )
        .await
        .map_err(|err| {
            warn!(source_id = %selector.source_id, %err, "failed to read envelopes");
            err
        })?;

    // Partition matching envelopes into series by tag set, keeping each
    // series' latest bucketed sample. Equal timestamps resolve to the later
    // envelope in read order.
    let mut latest: BTreeMap<BTreeMap<String, String>, (i64, f64)> = BTreeMap::new();
    for envelope in envelopes {
        if !envelope.carries_metric(&selector.metric) {
            continue;
        }
        if !matches_tags(&envelope.tags, &selector.matchers) {
            continue;
        }

        let timestamp = bucket(envelope.timestamp);
        let value = envelope.metric_value(&selector.metric);
        match latest.get_mut(&envelope.tags) {
            Some(entry) if entry.0 > timestamp => {}
            Some(entry) => *entry = (timestamp, value),
            None => {
                latest.insert(envelope.tags, (timestamp, value));
            }
        }
    }

    Ok(latest
        .into_iter()
        .map(|(labels, (_, value))| Sample { labels, value })
        .collect())
}

fn bucket(timestamp: i64) -> i64 {
    timestamp - timestamp.rem_euclid(SAMPLE_INTERVAL_NANOS)
}

/// Applies the selector's non-reserved matchers to an envelope's tags. An
/// equality matcher requires the tag to be present and equal; an inequality
/// matcher passes when the tag is absent or different.
fn matches_tags(tags: &BTreeMap<String, String>, matchers: &[Matcher]) -> bool {
    matchers.iter().all(|matcher| {
        let tag = tags.get(&matcher.name);
        match matcher.op {
            MatchOp::Eq => tag == Some(&matcher.value),
            MatchOp::Ne => tag != Some(&matcher.value),
        }
    })
}
