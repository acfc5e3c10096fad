use crate::modules::saga_steps::use_cases::report_step_outcome::handler::ReportStepOutcomeHandler;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub report_handler: Arc<ReportStepOutcomeHandler>,
}

#[cfg(test)]
impl AppState {
    /// State wired to an in memory broker with immediate retries.
    pub fn in_memory(
        broker: &crate::shared::infrastructure::broker::in_memory::InMemoryBroker,
        topic: &str,
    ) -> Self {
        use crate::modules::outcome_publisher::adapters::outbound::producer_factory::{
            ProducerFactory, ProducerOptions,
        };
        use crate::modules::outcome_publisher::adapters::outbound::producer_pool::ProducerPool;
        use crate::modules::outcome_publisher::use_cases::publish_outcome::handler::OutcomePublisher;
        use crate::shared::core::backoff::BackoffPolicy;

        let factory = ProducerFactory::new(
            broker.clone(),
            ProducerOptions::new(vec!["in-memory:9092".to_string()], "saga-outcomes"),
        );
        let pool = Arc::new(ProducerPool::new(factory, BackoffPolicy::immediate(1)));
        let publisher = Arc::new(OutcomePublisher::new(pool, BackoffPolicy::immediate(1)));
        Self {
            report_handler: Arc::new(ReportStepOutcomeHandler::new(topic, publisher)),
        }
    }
}
