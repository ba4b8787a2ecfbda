//! Lifecycle events and their line-delimited JSON transport.
//!
//! The router reports rollout progress to the surrounding deployment tool by
//! writing one JSON object per line to a byte sink (normally its stdout).
//! Because the same transport interleaves ordinary application logs with
//! events, the reading side skips any line that does not decode as an event.
//!
//! The code values are a wire contract with the deployment tool and must not
//! be renumbered.

use std::io::Write;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// The planner entered the next plan step.
pub const NEXT_PLAN_STEP: i32 = 10;

/// The planner finished every plan step; all traffic goes to the canary.
pub const FINISHED_PLAN_STEPS: i32 = 20;

/// The predicate failed; all traffic goes back to the current route.
pub const ABORT: i32 = 30;

/// A single lifecycle record.
///
/// Encoded as compact JSON with capitalized field names, e.g.
/// `{"Code":10,"Message":"..."}`. Unknown fields are ignored on decode and a
/// missing `Message` decodes as empty, so the decoder tolerates foreign lines
/// that merely look event-shaped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// One of [`NEXT_PLAN_STEP`], [`FINISHED_PLAN_STEPS`], or [`ABORT`].
    #[serde(rename = "Code")]
    pub code: i32,

    /// Human-readable detail for the event.
    #[serde(rename = "Message", default)]
    pub message: String,
}

impl Event {
    /// Creates an event from a code and message.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Capability to publish events.
///
/// The planner holds a sink it does not own; emission is best-effort
/// telemetry, never a control path, so the trait offers no error channel.
pub trait EventSink: Send + Sync {
    /// Publishes a single event.
    fn emit(&self, event: Event);
}

/// Writes events as line-delimited JSON to an underlying byte sink.
pub struct EventWriter<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> EventWriter<W> {
    /// Wraps a byte sink, typically stdout.
    pub const fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> EventSink for EventWriter<W> {
    fn emit(&self, event: Event) {
        let Ok(data) = serde_json::to_string(&event) else {
            debug!(code = event.code, "dropping unencodable event");
            return;
        };

        let Ok(mut writer) = self.writer.lock() else {
            return;
        };

        if let Err(err) = writeln!(writer, "{data}") {
            debug!(code = event.code, %err, "dropping event after write error");
        }
    }
}

/// Reads events back out of a stream of lines.
///
/// The deployment tool points this at the router's log stream; anything that
/// fails to decode as an [`Event`] is discarded.
pub struct EventReader<I> {
    lines: I,
}

impl<I> EventReader<I>
where
    I: Iterator<Item = String>,
{
    /// Wraps a line source.
    pub const fn new(lines: I) -> Self {
        Self { lines }
    }

    /// Returns the next decodable event, or `None` once the line source is
    /// exhausted.
    pub fn next_event(&mut self) -> Option<Event> {
        self.lines
            .by_ref()
            .find_map(|line| serde_json::from_str(&line).ok())
    }
}
