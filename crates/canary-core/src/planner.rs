//! The route planner: decides what share of traffic the canary receives
//! right now.
//!
//! The planner is a forward-only state machine driven entirely by
//! [`RoutePlanner::current_percentage`] calls from request handlers. It
//! starts idle, walks the plan's steps as their durations elapse, and ends
//! finished, at which point it recommends sending all traffic to the canary.
//! If the health predicate reports unhealthy it recommends zero instead and
//! emits an abort event on every such call; the consumer de-duplicates.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crate::events::{self, Event, EventSink};
use crate::plan::Plan;

/// Capability to observe the current health verdict.
///
/// Blanket-implemented for closures so the verdict can be backed by the
/// predicate evaluator's atomic boolean or by a test stub.
pub trait HealthSignal: Send + Sync {
    /// Returns the live verdict; must be cheap and non-blocking.
    fn is_healthy(&self) -> bool;
}

impl<F> HealthSignal for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_healthy(&self) -> bool {
        self()
    }
}

/// Where the planner currently stands in the plan.
#[derive(Debug, Clone, Copy)]
enum Position {
    /// No request has arrived yet.
    Idle,

    /// `plan.steps()[index]` is active since `started`.
    Step { index: usize, started: Instant },

    /// Every step has elapsed.
    Finished,
}

/// Advances through plan steps over wall time and publishes lifecycle
/// events at the boundaries.
pub struct RoutePlanner<P> {
    plan: Plan,
    predicate: P,
    sink: Arc<dyn EventSink>,
    position: Mutex<Position>,
}

impl<P: HealthSignal> RoutePlanner<P> {
    /// Creates a planner over a validated plan.
    ///
    /// The sink is a borrowed capability, not owned: the planner writes
    /// lifecycle events through it but never closes it.
    pub fn new(plan: Plan, predicate: P, sink: Arc<dyn EventSink>) -> Self {
        Self {
            plan,
            predicate,
            sink,
            position: Mutex::new(Position::Idle),
        }
    }

    /// Returns the percentage of traffic (0..=100) to route to the canary
    /// right now.
    ///
    /// Safe to call from many request threads concurrently: transitions are
    /// performed under a short critical section, so exactly one caller wins
    /// each step boundary and only the winner emits the boundary's event.
    pub fn current_percentage(&self) -> u32 {
        if !self.predicate.is_healthy() {
            self.sink.emit(Event::new(
                events::ABORT,
                "predicate failed, routing all traffic to the current route",
            ));
            return 0;
        }

        let mut position = self
            .position
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        loop {
            match *position {
                Position::Finished => return 100,
                Position::Idle => *position = self.enter(0),
                Position::Step { index, started } => {
                    // Saturates to zero, so a misbehaving clock can never
                    // regress the step index.
                    let elapsed = Instant::now().saturating_duration_since(started);
                    if elapsed >= self.plan.steps()[index].duration {
                        *position = self.enter(index + 1);
                    } else {
                        return self.plan.steps()[index].percentage;
                    }
                }
            }
        }
    }

    /// Performs the transition into step `index`, emitting the boundary
    /// event. Entering the first step is silent: the event marks a change of
    /// step, and there is no previous step to change from.
    fn enter(&self, index: usize) -> Position {
        if index >= self.plan.len() {
            self.sink.emit(Event::new(
                events::FINISHED_PLAN_STEPS,
                "finished all plan steps",
            ));
            return Position::Finished;
        }

        if index > 0 {
            self.sink.emit(Event::new(
                events::NEXT_PLAN_STEP,
                format!("starting next step: {}", self.plan.steps()[index]),
            ));
        }

        Position::Step {
            index,
            started: Instant::now(),
        }
    }
}

impl<P: HealthSignal> crate::proxy::TrafficPlanner for RoutePlanner<P> {
    fn current_percentage(&self) -> u32 {
        Self::current_percentage(self)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;
    use crate::plan::PlanStep;

    #[derive(Default)]
    struct SpySink {
        events: StdMutex<Vec<Event>>,
    }

    impl EventSink for SpySink {
        fn emit(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl SpySink {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn count(&self, code: i32) -> usize {
            self.events().iter().filter(|e| e.code == code).count()
        }
    }

    fn ramp_plan() -> Plan {
        Plan::new(vec![
            PlanStep::new(5, Duration::from_millis(100)).unwrap(),
            PlanStep::new(10, Duration::from_millis(100)).unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn test_returns_the_plan_over_time() {
        let sink = Arc::new(SpySink::default());
        let planner = RoutePlanner::new(ramp_plan(), || true, sink.clone());

        for _ in 0..100 {
            assert_eq!(planner.current_percentage(), 5);
        }
        // Entering the first step emits nothing.
        assert!(sink.events().is_empty());

        std::thread::sleep(Duration::from_millis(120));
        for _ in 0..100 {
            assert_eq!(planner.current_percentage(), 10);
        }

        std::thread::sleep(Duration::from_millis(120));
        for _ in 0..100 {
            assert_eq!(planner.current_percentage(), 100);
        }

        let next_steps: Vec<_> = sink
            .events()
            .into_iter()
            .filter(|e| e.code == events::NEXT_PLAN_STEP)
            .collect();
        assert_eq!(next_steps.len(), 1);
        assert!(
            next_steps[0].message.contains("Percentage:10 Duration:100ms"),
            "unexpected message: {}",
            next_steps[0].message
        );
        assert_eq!(sink.count(events::FINISHED_PLAN_STEPS), 1);
    }

    #[test]
    fn test_finished_event_fires_only_on_the_transition() {
        let sink = Arc::new(SpySink::default());
        let plan = Plan::new(vec![PlanStep::new(5, Duration::from_millis(10)).unwrap()]).unwrap();
        let planner = RoutePlanner::new(plan, || true, sink.clone());

        assert_eq!(planner.current_percentage(), 5);
        std::thread::sleep(Duration::from_millis(20));

        for _ in 0..50 {
            assert_eq!(planner.current_percentage(), 100);
        }
        assert_eq!(sink.count(events::FINISHED_PLAN_STEPS), 1);
    }

    #[test]
    fn test_aborts_and_returns_zero_when_the_predicate_fails() {
        let sink = Arc::new(SpySink::default());
        let planner = RoutePlanner::new(ramp_plan(), || false, sink.clone());

        for _ in 0..100 {
            assert_eq!(planner.current_percentage(), 0);
        }

        let observed = sink.events();
        assert_eq!(observed.len(), 100);
        assert!(observed.iter().all(|e| e.code == events::ABORT));
    }

    #[test]
    fn test_unhealthy_calls_do_not_advance_the_plan() {
        let sink = Arc::new(SpySink::default());
        let healthy = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let signal = {
            let healthy = healthy.clone();
            move || healthy.load(std::sync::atomic::Ordering::SeqCst)
        };
        let planner = RoutePlanner::new(ramp_plan(), signal, sink.clone());

        assert_eq!(planner.current_percentage(), 0);
        healthy.store(true, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(planner.current_percentage(), 5);
    }

    #[test]
    fn test_concurrent_callers_observe_exactly_one_transition_each() {
        let sink = Arc::new(SpySink::default());
        let planner = Arc::new(RoutePlanner::new(ramp_plan(), || true, sink.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let planner = planner.clone();
            handles.push(std::thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_millis(250);
                while Instant::now() < deadline {
                    let percentage = planner.current_percentage();
                    assert!(
                        matches!(percentage, 5 | 10 | 100),
                        "unexpected percentage {percentage}"
                    );
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(sink.count(events::NEXT_PLAN_STEP), 1);
        assert_eq!(sink.count(events::FINISHED_PLAN_STEPS), 1);
    }
}
