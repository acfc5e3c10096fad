use crate::modules::outcome_publisher::adapters::outbound::producer_pool::PoolError;
use crate::shared::infrastructure::broker::BrokerError;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("could not begin transaction: {0}")]
    Begin(#[source] BrokerError),

    #[error("transaction aborted: {0}")]
    Aborted(#[source] BrokerError),

    #[error("gave up after {attempts} retries: {last}")]
    RetriesExhausted { attempts: u32, last: BrokerError },

    #[error("publish cancelled before commit")]
    Cancelled,

    #[error("fatal error on producer {transactional_id}: {reason}")]
    Fatal {
        transactional_id: String,
        reason: BrokerError,
    },

    #[error("publish task interrupted: {0}")]
    Interrupted(String),
}

impl PublishError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PublishError::Fatal { .. })
    }
}

/// What saga step handlers call to record an already serialized outcome on a topic.
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError>;
}
