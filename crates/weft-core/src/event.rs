//! Execution event schema
//!
//! Events are a closed tagged union with an explicit version field so
//! subscribers can evolve additively. Every event names its run; step
//! events also name their step, which is what topic selectors match on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;
use crate::types::{LogLevel, RunState, StepMetrics};

pub const EVENT_SCHEMA_VERSION: u32 = 1;

/// One event on the bus and in the `step_events` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub run_id: String,
    pub ts: DateTime<Utc>,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(flatten)]
    pub payload: EventPayload,
}

fn default_version() -> u32 {
    EVENT_SCHEMA_VERSION
}

impl Event {
    pub fn new(run_id: impl Into<String>, ts: DateTime<Utc>, payload: EventPayload) -> Self {
        Self {
            run_id: run_id.into(),
            ts,
            version: EVENT_SCHEMA_VERSION,
            payload,
        }
    }

    /// Step id for step-scoped events.
    pub fn step_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::StepStarted { step_id, .. }
            | EventPayload::StepSucceeded { step_id, .. }
            | EventPayload::StepFailed { step_id, .. }
            | EventPayload::StepSkipped { step_id, .. }
            | EventPayload::StepCancelled { step_id, .. }
            | EventPayload::StepStreamChunk { step_id, .. }
            | EventPayload::StepLog { step_id, .. } => Some(step_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    RunStarted {
        pipeline_id: String,
        dry_run: bool,
    },
    RunFinished {
        state: RunState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    StepStarted {
        step_id: String,
        attempt: u32,
    },
    StepSucceeded {
        step_id: String,
        metrics: StepMetrics,
    },
    StepFailed {
        step_id: String,
        error: String,
        code: String,
        attempt: u32,
    },
    StepSkipped {
        step_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    StepCancelled {
        step_id: String,
        attempt: u32,
    },
    StepStreamChunk {
        step_id: String,
        delta: String,
    },
    StepLog {
        step_id: String,
        level: LogLevel,
        message: String,
        seq: u64,
    },
    DryRunReport {
        report: Value,
    },
    /// Synthesized locally for a subscriber that fell behind; `missed`
    /// events were dropped oldest-first for that subscriber only.
    SubscriberLag {
        missed: u64,
    },
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::RunStarted { .. } => "run_started",
            EventPayload::RunFinished { .. } => "run_finished",
            EventPayload::StepStarted { .. } => "step_started",
            EventPayload::StepSucceeded { .. } => "step_succeeded",
            EventPayload::StepFailed { .. } => "step_failed",
            EventPayload::StepSkipped { .. } => "step_skipped",
            EventPayload::StepCancelled { .. } => "step_cancelled",
            EventPayload::StepStreamChunk { .. } => "step_stream_chunk",
            EventPayload::StepLog { .. } => "step_log",
            EventPayload::DryRunReport { .. } => "dry_run_report",
            EventPayload::SubscriberLag { .. } => "subscriber_lag",
        }
    }
}

/// Subscription selector: `run:<id>`, `step:<run_id>:<step_id>`, or the
/// wildcards `run:*` and `step:*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    Run(String),
    AllRuns,
    Step { run_id: String, step_id: String },
    AllSteps,
}

impl Topic {
    pub fn parse(selector: &str) -> Result<Self, EngineError> {
        let mut parts = selector.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("run"), Some("*"), None) => Ok(Topic::AllRuns),
            (Some("run"), Some(id), None) if !id.is_empty() => Ok(Topic::Run(id.to_string())),
            (Some("step"), Some("*"), None) => Ok(Topic::AllSteps),
            (Some("step"), Some(run_id), Some(step_id))
                if !run_id.is_empty() && !step_id.is_empty() =>
            {
                Ok(Topic::Step {
                    run_id: run_id.to_string(),
                    step_id: step_id.to_string(),
                })
            }
            _ => Err(EngineError::InvalidSelector(selector.to_string())),
        }
    }

    /// Whether an event belongs to this topic. Run topics include the
    /// run's step events; step topics match step events only.
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Topic::AllRuns => true,
            Topic::Run(id) => event.run_id == *id,
            Topic::AllSteps => event.step_id().is_some(),
            Topic::Step { run_id, step_id } => {
                event.run_id == *run_id && event.step_id() == Some(step_id.as_str())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step_event(run: &str, step: &str) -> Event {
        Event::new(
            run,
            Utc::now(),
            EventPayload::StepStarted { step_id: step.to_string(), attempt: 1 },
        )
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = Event::new(
            "run-1",
            Utc::now(),
            EventPayload::RunFinished { state: RunState::Succeeded, error: None },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "run_finished");
        assert_eq!(value["run_id"], "run-1");
        assert_eq!(value["state"], "succeeded");
        assert_eq!(value["version"], 1);
    }

    #[test]
    fn test_subscribers_tolerate_additive_fields() {
        let raw = json!({
            "run_id": "run-2",
            "ts": Utc::now(),
            "kind": "step_skipped",
            "step_id": "b",
            "some_future_field": {"nested": true}
        });
        let event: Event = serde_json::from_value(raw).unwrap();
        assert_eq!(event.step_id(), Some("b"));
    }

    #[test]
    fn test_topic_parse_and_match() {
        let event = step_event("r1", "s1");
        assert!(Topic::parse("run:*").unwrap().matches(&event));
        assert!(Topic::parse("run:r1").unwrap().matches(&event));
        assert!(!Topic::parse("run:r2").unwrap().matches(&event));
        assert!(Topic::parse("step:*").unwrap().matches(&event));
        assert!(Topic::parse("step:r1:s1").unwrap().matches(&event));
        assert!(!Topic::parse("step:r1:s2").unwrap().matches(&event));

        let run_event = Event::new(
            "r1",
            Utc::now(),
            EventPayload::RunStarted { pipeline_id: "p".into(), dry_run: false },
        );
        assert!(!Topic::parse("step:*").unwrap().matches(&run_event));

        assert!(Topic::parse("bogus").is_err());
        assert!(Topic::parse("run:").is_err());
        assert!(Topic::parse("step:r1").is_err());
    }
}
