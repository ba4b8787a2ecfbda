//! The rollout plan: how much traffic the canary receives, and for how long.
//!
//! A plan is an ordered list of steps. Each step names the percentage of
//! requests to route to the canary and the wall-clock duration the step
//! lasts. Once every step has elapsed the planner recommends sending all
//! traffic to the canary.
//!
//! On the wire (the `PLAN` environment variable) a plan is JSON with
//! capitalized field names and nanosecond durations:
//!
//! ```json
//! {"Plan":[{"Percentage":5,"Duration":60000000000}]}
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while building or decoding a [`Plan`].
#[derive(Debug, Error)]
pub enum PlanError {
    /// The plan contained no steps.
    #[error("a plan requires at least one step")]
    Empty,

    /// A step's percentage fell outside `0..=100`.
    #[error("step percentage {0} is out of range (0..=100)")]
    PercentageOutOfRange(u32),

    /// A step's duration was not positive.
    #[error("step duration must be greater than zero")]
    ZeroDuration,

    /// The wire form could not be decoded.
    #[error("invalid plan JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// One phase of the rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Percentage of requests to route to the canary during this step.
    #[serde(rename = "Percentage")]
    pub percentage: u32,

    /// How long the step lasts before the planner moves on.
    #[serde(rename = "Duration", with = "duration_nanos")]
    pub duration: Duration,
}

impl PlanStep {
    /// Creates a step, validating the percentage range and that the duration
    /// is positive.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::PercentageOutOfRange`] or
    /// [`PlanError::ZeroDuration`].
    pub fn new(percentage: u32, duration: Duration) -> Result<Self, PlanError> {
        let step = Self {
            percentage,
            duration,
        };
        step.validate()?;
        Ok(step)
    }

    fn validate(&self) -> Result<(), PlanError> {
        if self.percentage > 100 {
            return Err(PlanError::PercentageOutOfRange(self.percentage));
        }
        if self.duration.is_zero() {
            return Err(PlanError::ZeroDuration);
        }
        Ok(())
    }
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Percentage:{} Duration:{}",
            self.percentage,
            humantime::format_duration(self.duration)
        )
    }
}

/// An ordered, validated, immutable sequence of [`PlanStep`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    steps: Vec<PlanStep>,
}

impl Plan {
    /// Builds a plan from steps, validating each one and rejecting an empty
    /// sequence.
    ///
    /// # Errors
    ///
    /// Returns a [`PlanError`] naming the first violated invariant.
    pub fn new(steps: Vec<PlanStep>) -> Result<Self, PlanError> {
        if steps.is_empty() {
            return Err(PlanError::Empty);
        }
        for step in &steps {
            step.validate()?;
        }
        Ok(Self { steps })
    }

    /// Decodes the `{"Plan":[...]}` wire form and validates it.
    ///
    /// # Errors
    ///
    /// Returns a [`PlanError`] if the JSON is malformed or any invariant is
    /// violated.
    pub fn from_json(data: &str) -> Result<Self, PlanError> {
        let envelope: PlanEnvelope = serde_json::from_str(data)?;
        Self::new(envelope.plan)
    }

    /// The plan's steps, in rollout order.
    #[must_use]
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    /// Number of steps in the plan (always at least one).
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Always false: construction rejects an empty step sequence.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PlanEnvelope {
    #[serde(rename = "Plan")]
    plan: Vec<PlanStep>,
}

mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let nanos = i64::try_from(duration.as_nanos())
            .map_err(|_| serde::ser::Error::custom("duration exceeds int64 nanoseconds"))?;
        serializer.serialize_i64(nanos)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let nanos = i64::deserialize(deserializer)?;
        let nanos = u64::try_from(nanos)
            .map_err(|_| serde::de::Error::custom("duration nanoseconds must not be negative"))?;
        Ok(Duration::from_nanos(nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_plan() {
        assert!(matches!(Plan::new(vec![]), Err(PlanError::Empty)));
    }

    #[test]
    fn test_rejects_percentage_over_100() {
        assert!(matches!(
            PlanStep::new(101, Duration::from_secs(1)),
            Err(PlanError::PercentageOutOfRange(101))
        ));
    }

    #[test]
    fn test_rejects_zero_duration() {
        assert!(matches!(
            PlanStep::new(5, Duration::ZERO),
            Err(PlanError::ZeroDuration)
        ));
    }

    #[test]
    fn test_boundary_percentages_are_valid() {
        assert!(PlanStep::new(0, Duration::from_secs(1)).is_ok());
        assert!(PlanStep::new(100, Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_decodes_the_wire_form() {
        let plan = Plan::from_json(
            r#"{"Plan":[{"Percentage":5,"Duration":100000000},{"Percentage":10,"Duration":60000000000}]}"#,
        )
        .unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(plan.steps()[0].percentage, 5);
        assert_eq!(plan.steps()[0].duration, Duration::from_millis(100));
        assert_eq!(plan.steps()[1].percentage, 10);
        assert_eq!(plan.steps()[1].duration, Duration::from_secs(60));
    }

    #[test]
    fn test_rejects_invalid_wire_values() {
        assert!(Plan::from_json("not json").is_err());
        assert!(Plan::from_json(r#"{"Plan":[]}"#).is_err());
        assert!(Plan::from_json(r#"{"Plan":[{"Percentage":5,"Duration":-1}]}"#).is_err());
        assert!(Plan::from_json(r#"{"Plan":[{"Percentage":500,"Duration":1000}]}"#).is_err());
    }

    #[test]
    fn test_step_display_names_percentage_and_duration() {
        let step = PlanStep::new(10, Duration::from_millis(100)).unwrap();
        assert_eq!(step.to_string(), "Percentage:10 Duration:100ms");

        let step = PlanStep::new(50, Duration::from_secs(90)).unwrap();
        assert_eq!(step.to_string(), "Percentage:50 Duration:1m 30s");
    }
}
