// ProducerHandle is one connection-bound transactional publishing session plus its status.
//
// Responsibilities
// - Refuse operations the current status does not permit, so at most one transaction is
//   ever open on a session.
// - Bound every broker round trip by the operation timeout; a timeout counts as retriable.
// - Advance the status after each call according to the outcome classification.

use crate::modules::outcome_publisher::core::status::TransactionStatus;
use crate::shared::infrastructure::broker::{BrokerError, Operation, TransactionalSession};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct ProducerHandle<S: TransactionalSession> {
    session: S,
    brokers: Arc<[String]>,
    transactional_id: String,
    status: TransactionStatus,
    operation_timeout: Duration,
}

async fn within(
    timeout: Duration,
    call: impl Future<Output = Result<(), BrokerError>>,
) -> Result<(), BrokerError> {
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or_else(|_| {
            Err(BrokerError::Retriable(format!(
                "no broker response within {timeout:?}"
            )))
        })
}

impl<S: TransactionalSession> ProducerHandle<S> {
    pub fn new(
        session: S,
        brokers: Arc<[String]>,
        transactional_id: impl Into<String>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            session,
            brokers,
            transactional_id: transactional_id.into(),
            status: TransactionStatus::Ready,
            operation_timeout,
        }
    }

    pub fn transactional_id(&self) -> &str {
        &self.transactional_id
    }

    pub fn brokers(&self) -> &[String] {
        &self.brokers
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub async fn begin(&mut self) -> Result<(), BrokerError> {
        self.ensure_permitted(Operation::Begin)?;
        let outcome = within(self.operation_timeout, self.session.begin_transaction()).await;
        self.record(Operation::Begin, outcome)
    }

    pub async fn send(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.ensure_permitted(Operation::Send)?;
        let outcome = within(self.operation_timeout, self.session.send(topic, payload)).await;
        self.record(Operation::Send, outcome)
    }

    pub async fn commit(&mut self) -> Result<(), BrokerError> {
        self.ensure_permitted(Operation::Commit)?;
        let outcome = within(self.operation_timeout, self.session.commit_transaction()).await;
        self.record(Operation::Commit, outcome)
    }

    pub async fn abort(&mut self) -> Result<(), BrokerError> {
        self.ensure_permitted(Operation::Abort)?;
        let outcome = within(self.operation_timeout, self.session.abort_transaction()).await;
        self.record(Operation::Abort, outcome)
    }

    pub async fn close(&mut self) {
        if self.status == TransactionStatus::Closed {
            return;
        }
        if tokio::time::timeout(self.operation_timeout, self.session.close())
            .await
            .is_err()
        {
            debug!(transactional_id = %self.transactional_id, "close timed out");
        }
        self.status = self.status.after(Operation::Close, Ok(()));
    }

    /// Poisons a handle that could not be brought back to a terminal transactional state.
    pub fn mark_fatal(&mut self) {
        if self.status != TransactionStatus::Closed {
            self.status = TransactionStatus::Fatal;
        }
    }

    fn ensure_permitted(&self, operation: Operation) -> Result<(), BrokerError> {
        if self.status.permits(operation) {
            Ok(())
        } else {
            Err(BrokerError::IllegalState {
                operation,
                state: self.status.to_string(),
            })
        }
    }

    fn record(
        &mut self,
        operation: Operation,
        outcome: Result<(), BrokerError>,
    ) -> Result<(), BrokerError> {
        let next = self.status.after(operation, outcome.as_ref().map(|_| ()));
        if next != self.status {
            debug!(
                transactional_id = %self.transactional_id,
                %operation,
                from = %self.status,
                to = %next,
                "producer status changed"
            );
        }
        self.status = next;
        outcome
    }
}
