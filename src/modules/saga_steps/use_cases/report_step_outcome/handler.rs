use crate::modules::outcome_publisher::use_cases::publish_outcome::port::{
    OutcomeSink, PublishError,
};
use crate::modules::saga_steps::core::outcome::{
    OutcomeEnvelope, OutcomeError, StepOutcome, build_outcome_record,
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error(transparent)]
    Outcome(#[from] OutcomeError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportStepOutcome {
    pub saga_id: String,
    pub step: String,
    pub outcome: StepOutcome,
}

pub struct ReportStepOutcomeHandler {
    topic: String,
    sink: Arc<dyn OutcomeSink>,
}

impl ReportStepOutcomeHandler {
    pub fn new(topic: impl Into<String>, sink: Arc<dyn OutcomeSink>) -> Self {
        Self {
            topic: topic.into(),
            sink,
        }
    }

    /// Records the outcome on the results topic and returns its event id.
    pub async fn handle(&self, command: ReportStepOutcome) -> Result<String, ApplicationError> {
        let envelope = OutcomeEnvelope::new(command.saga_id, command.step, command.outcome);
        let record = build_outcome_record(&self.topic, &envelope)?;
        self.sink.publish(&record.topic, &record.payload).await?;
        Ok(record.event_id)
    }
}
