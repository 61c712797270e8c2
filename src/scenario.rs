//! Declarative scheduling scenarios.
//!
//! A scenario is a JSON script of scheduling and time-control steps. Replaying it
//! inside a [`Scheduler`] run yields a trace of every callback that fired, which
//! makes ordering behaviour easy to inspect and diff.
//!
//! ```json
//! {
//!   "name": "interleave",
//!   "steps": [
//!     { "op": "set_timeout", "label": "a", "delay": 10,
//!       "then": [ { "op": "queue_microtask", "label": "a.micro" } ] },
//!     { "op": "set_timeout", "label": "b", "delay": 10 },
//!     { "op": "tick", "ms": 10 }
//!   ]
//! }
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::hooks;
use crate::scheduler::Scheduler;
use crate::task_queue::TimerId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<SchedulerConfig>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    SetTimeout {
        label: String,
        delay: i64,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<Value>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        then: Vec<Step>,
    },
    SetInterval {
        label: String,
        interval: i64,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<Value>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        then: Vec<Step>,
    },
    QueueMicrotask {
        label: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        then: Vec<Step>,
    },
    Cancel {
        label: String,
    },
    Tick {
        #[serde(default)]
        ms: u64,
    },
    FlushMicrotasks,
    Flush,
    DiscardPeriodic,
}

impl Step {
    /// Steps allowed inside a callback's `then` list.
    const fn is_scheduling(&self) -> bool {
        matches!(
            self,
            Self::SetTimeout { .. }
                | Self::SetInterval { .. }
                | Self::QueueMicrotask { .. }
                | Self::Cancel { .. }
        )
    }

    fn nested(&self) -> &[Self] {
        match self {
            Self::SetTimeout { then, .. }
            | Self::SetInterval { then, .. }
            | Self::QueueMicrotask { then, .. } => then,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    Timer,
    Interval,
    Microtask,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEntry {
    pub at_ms: u64,
    pub label: String,
    pub kind: TraceKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioReport {
    pub name: String,
    pub final_ms: u64,
    pub trace: Vec<TraceEntry>,
    pub outcome: Outcome,
}

impl ScenarioReport {
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self.outcome, Outcome::Ok)
    }

    /// Labels in firing order.
    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        self.trace.iter().map(|entry| entry.label.as_str()).collect()
    }
}

impl Scenario {
    pub fn from_json(input: &str) -> Result<Self> {
        let scenario: Self = serde_json::from_str(input)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let input = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&input)
    }

    /// Reject control steps nested inside callbacks.
    pub fn validate(&self) -> Result<()> {
        fn check(steps: &[Step], depth: usize) -> Result<()> {
            for step in steps {
                if depth > 0 && !step.is_scheduling() {
                    return Err(Error::scenario(format!(
                        "step {step:?} is not allowed inside a callback"
                    )));
                }
                check(step.nested(), depth + 1)?;
            }
            Ok(())
        }
        check(&self.steps, 0)
    }

    /// Replay the steps inside a fresh scheduler run.
    #[must_use]
    pub fn replay(&self) -> ScenarioReport {
        let scheduler = Scheduler::with_config(self.config.unwrap_or_default());
        let replay = Rc::new(Replay {
            scheduler: scheduler.clone(),
            trace: RefCell::new(Vec::new()),
            timers: RefCell::new(HashMap::new()),
            deferred: RefCell::new(None),
        });

        tracing::debug!(
            event = "fake_async.scenario.replay",
            name = %self.name,
            steps = self.steps.len(),
            "Replaying scenario"
        );

        let result = scheduler.try_run(|_| {
            for step in &self.steps {
                Replay::apply(&replay, step)?;
                replay.take_deferred()?;
            }
            Ok::<_, Error>(())
        });
        // Microtasks drained on exit may still have failed.
        let result = replay.take_deferred().and(result);

        let trace = replay.trace.take();
        ScenarioReport {
            name: self.name.clone(),
            final_ms: scheduler.now_ms(),
            trace,
            outcome: match result {
                Ok(()) => Outcome::Ok,
                Err(err) => Outcome::Failed {
                    error: err.to_string(),
                },
            },
        }
    }
}

struct Replay {
    scheduler: Scheduler,
    trace: RefCell<Vec<TraceEntry>>,
    timers: RefCell<HashMap<String, TimerId>>,
    /// First error raised inside a callback, reported after the current step.
    deferred: RefCell<Option<Error>>,
}

impl Replay {
    fn apply(this: &Rc<Self>, step: &Step) -> Result<()> {
        match step {
            Step::SetTimeout {
                label,
                delay,
                args,
                then,
            } => {
                let fired = Self::callback(this, label, TraceKind::Timer, then);
                let id = hooks::set_timeout_with_args(fired, *delay, args.clone())?;
                this.timers.borrow_mut().insert(label.clone(), id);
            }
            Step::SetInterval {
                label,
                interval,
                args,
                then,
            } => {
                let fired = Self::callback(this, label, TraceKind::Interval, then);
                let id = hooks::set_interval_with_args(fired, *interval, args.clone())?;
                this.timers.borrow_mut().insert(label.clone(), id);
            }
            Step::QueueMicrotask { label, then } => {
                let mut fired = Self::callback(this, label, TraceKind::Microtask, then);
                hooks::queue_microtask(move || fired(&[]))?;
            }
            Step::Cancel { label } => {
                let id = this
                    .timers
                    .borrow()
                    .get(label)
                    .copied()
                    .ok_or_else(|| Error::scenario(format!("unknown timer label `{label}`")))?;
                hooks::clear_timeout(id);
            }
            Step::Tick { ms } => this.scheduler.tick(*ms)?,
            Step::FlushMicrotasks => this.scheduler.flush_microtasks()?,
            Step::Flush => {
                this.scheduler.flush()?;
            }
            Step::DiscardPeriodic => this.scheduler.discard_periodic_tasks()?,
        }
        Ok(())
    }

    fn callback(
        this: &Rc<Self>,
        label: &str,
        kind: TraceKind,
        then: &[Step],
    ) -> impl FnMut(&[Value]) + use<> {
        let replay = Rc::clone(this);
        let label = label.to_string();
        let then: Rc<[Step]> = then.into();
        move |args: &[Value]| {
            replay.trace.borrow_mut().push(TraceEntry {
                at_ms: replay.scheduler.now_ms(),
                label: label.clone(),
                kind,
                args: args.to_vec(),
            });
            for step in then.iter() {
                if let Err(err) = Self::apply(&replay, step) {
                    replay.defer(err);
                    break;
                }
            }
        }
    }

    fn defer(&self, err: Error) {
        let mut deferred = self.deferred.borrow_mut();
        if deferred.is_none() {
            *deferred = Some(err);
        }
    }

    fn take_deferred(&self) -> Result<()> {
        self.deferred.borrow_mut().take().map_or(Ok(()), Err)
    }
}
