// Builds transactional producer handles bound to the configured brokers.
//
// Responsibilities
// - Derive a unique transactional id per handle: `<base>-<n>`.
// - Open an idempotent transactional session and register it with the broker (InitProducerId).
// - Never hand out a half built handle: a session whose registration failed is closed.

use crate::modules::outcome_publisher::core::handle::ProducerHandle;
use crate::modules::outcome_publisher::core::transaction_id::TransactionIdAllocator;
use crate::shared::infrastructure::broker::{
    BrokerError, ProducerSettings, SessionConnector, TransactionalSession,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub brokers: Arc<[String]>,
    pub base_transactional_id: String,
    pub transaction_timeout: Duration,
    pub operation_timeout: Duration,
}

impl ProducerOptions {
    pub fn new(brokers: Vec<String>, base_transactional_id: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            base_transactional_id: base_transactional_id.into(),
            transaction_timeout: Duration::from_secs(60),
            operation_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }
}

pub struct ProducerFactory<C: SessionConnector> {
    connector: C,
    options: ProducerOptions,
    allocator: TransactionIdAllocator,
}

impl<C: SessionConnector> ProducerFactory<C> {
    pub fn new(connector: C, options: ProducerOptions) -> Self {
        Self {
            connector,
            options,
            allocator: TransactionIdAllocator::new(),
        }
    }

    pub fn options(&self) -> &ProducerOptions {
        &self.options
    }

    pub fn next_transactional_id(&self) -> String {
        self.allocator
            .transactional_id(&self.options.base_transactional_id)
    }

    pub fn settings_for(&self, transactional_id: &str) -> ProducerSettings {
        ProducerSettings::transactional(
            self.options.brokers.clone(),
            transactional_id,
            self.options.transaction_timeout,
        )
    }

    pub async fn create(
        &self,
        transactional_id: String,
    ) -> Result<ProducerHandle<C::Session>, BrokerError> {
        let settings = self.settings_for(&transactional_id);
        let timeout = self.options.operation_timeout;
        let mut session = tokio::time::timeout(timeout, self.connector.connect(&settings))
            .await
            .unwrap_or_else(|_| {
                Err(BrokerError::Unreachable(format!(
                    "no connection within {timeout:?}"
                )))
            })?;
        let registered = tokio::time::timeout(timeout, session.init_transactions())
            .await
            .unwrap_or_else(|_| {
                Err(BrokerError::Unreachable(format!(
                    "producer id not assigned within {timeout:?}"
                )))
            });
        if let Err(error) = registered {
            warn!(%transactional_id, %error, "producer registration failed");
            session.close().await;
            return Err(error);
        }
        info!(%transactional_id, "transactional producer created");
        Ok(ProducerHandle::new(
            session,
            self.options.brokers.clone(),
            transactional_id,
            timeout,
        ))
    }
}
