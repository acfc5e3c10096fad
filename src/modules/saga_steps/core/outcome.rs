// Outcome of one saga step, serialized into the record the orchestrator reads.
//
// Boundaries
// - No input or output here. The publisher receives the finished bytes.
// - Malformed outcomes are rejected before they ever reach the publisher.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeEnvelope {
    pub event_id: String,
    pub saga_id: String,
    pub step: String,
    #[serde(flatten)]
    pub outcome: StepOutcome,
    pub occurred_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeRecord {
    pub topic: String,
    pub event_id: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum OutcomeError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OutcomeEnvelope {
    pub fn new(saga_id: impl Into<String>, step: impl Into<String>, outcome: StepOutcome) -> Self {
        Self {
            event_id: Uuid::now_v7().to_string(),
            saga_id: saga_id.into(),
            step: step.into(),
            outcome,
            occurred_at: Utc::now().timestamp_millis(),
        }
    }

    fn validate(&self) -> Result<(), OutcomeError> {
        if self.saga_id.trim().is_empty() {
            return Err(OutcomeError::Validation("saga_id must not be empty".into()));
        }
        if self.step.trim().is_empty() {
            return Err(OutcomeError::Validation("step must not be empty".into()));
        }
        if let StepOutcome::Failed { reason } = &self.outcome {
            if reason.trim().is_empty() {
                return Err(OutcomeError::Validation(
                    "a failed step needs a reason".into(),
                ));
            }
        }
        Ok(())
    }
}

pub fn build_outcome_record(
    topic: &str,
    envelope: &OutcomeEnvelope,
) -> Result<OutcomeRecord, OutcomeError> {
    envelope.validate()?;
    Ok(OutcomeRecord {
        topic: topic.to_string(),
        event_id: envelope.event_id.clone(),
        payload: serde_json::to_vec(envelope)?,
    })
}

#[cfg(test)]
mod step_outcome_tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn it_should_serialize_a_succeeded_step() {
        let envelope = OutcomeEnvelope::new("saga-0001", "save-settings", StepOutcome::Succeeded);
        let record = build_outcome_record("saga-step-results", &envelope).unwrap();
        assert_eq!(record.topic, "saga-step-results");
        assert_eq!(record.event_id, envelope.event_id);
        let json: serde_json::Value = serde_json::from_slice(&record.payload).unwrap();
        assert_eq!(json["saga_id"], "saga-0001");
        assert_eq!(json["step"], "save-settings");
        assert_eq!(json["status"], "succeeded");
        assert!(json.get("reason").is_none());
    }

    #[rstest]
    fn it_should_serialize_a_failed_step_with_its_reason() {
        let envelope = OutcomeEnvelope::new(
            "saga-0001",
            "send-email",
            StepOutcome::Failed {
                reason: "smtp rejected recipient".into(),
            },
        );
        let record = build_outcome_record("saga-step-results", &envelope).unwrap();
        let decoded: OutcomeEnvelope = serde_json::from_slice(&record.payload).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[rstest]
    #[case("", "save-settings", StepOutcome::Succeeded)]
    #[case("saga-0001", " ", StepOutcome::Succeeded)]
    #[case("saga-0001", "send-email", StepOutcome::Failed { reason: "".into() })]
    fn it_should_reject_incomplete_outcomes(
        #[case] saga_id: &str,
        #[case] step: &str,
        #[case] outcome: StepOutcome,
    ) {
        let envelope = OutcomeEnvelope::new(saga_id, step, outcome);
        let result = build_outcome_record("saga-step-results", &envelope);
        assert!(matches!(result, Err(OutcomeError::Validation(_))));
    }
}
