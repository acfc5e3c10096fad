// Kafka implementation of the broker port, backed by librdkafka through the rdkafka crate.
//
// Purpose
// - Open transactional producer sessions against a real Kafka cluster.
//
// Responsibilities
// - Translate producer settings into librdkafka configuration.
// - Run the blocking transactional calls on tokio's blocking pool, one at a time per session,
//   even when the handle stopped waiting for an earlier one.
// - Classify rdkafka errors into the broker error taxonomy.

use crate::shared::infrastructure::broker::blocking::BlockingCalls;
use crate::shared::infrastructure::broker::{
    Acks, BrokerError, Operation, ProducerSettings, SessionConnector, TransactionalSession,
};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{BaseRecord, DefaultProducerContext, Producer, ThreadedProducer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

type KafkaProducer = ThreadedProducer<DefaultProducerContext>;

#[derive(Debug, Clone)]
pub struct KafkaConnector {
    operation_timeout: Duration,
}

impl KafkaConnector {
    pub fn new(operation_timeout: Duration) -> Self {
        Self { operation_timeout }
    }
}

fn client_config(settings: &ProducerSettings) -> ClientConfig {
    let acks = match settings.acks {
        Acks::All => "all",
        Acks::Leader => "1",
    };
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", settings.brokers.join(","))
        .set("transactional.id", &settings.transactional_id)
        .set("enable.idempotence", settings.idempotent.to_string())
        .set("acks", acks)
        .set(
            "max.in.flight.requests.per.connection",
            settings.max_in_flight_requests.to_string(),
        )
        // librdkafka has no round robin partitioner; keyless records with random partitioning
        // and sticky batching disabled spread the same way.
        .set("partitioner", "random")
        .set("sticky.partitioning.linger.ms", "0")
        .set(
            "transaction.timeout.ms",
            settings.transaction_timeout.as_millis().to_string(),
        );
    config
}

fn classify(error: KafkaError) -> BrokerError {
    let message = error.to_string();
    match &error {
        KafkaError::Transaction(e) if e.is_fatal() => BrokerError::Fatal(message),
        KafkaError::Transaction(e) if e.txn_requires_abort() => BrokerError::Abortable(message),
        KafkaError::Transaction(e) if e.is_retriable() => BrokerError::Retriable(message),
        KafkaError::Transaction(_) => BrokerError::Fatal(message),
        KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull) => {
            BrokerError::Retriable(message)
        }
        KafkaError::MessageProduction(_) => BrokerError::Abortable(message),
        KafkaError::ClientCreation(_) | KafkaError::ClientConfig(..) => {
            BrokerError::Unreachable(message)
        }
        KafkaError::Canceled => BrokerError::Retriable(message),
        _ => BrokerError::Fatal(message),
    }
}

#[async_trait]
impl SessionConnector for KafkaConnector {
    type Session = KafkaSession;

    async fn connect(&self, settings: &ProducerSettings) -> Result<KafkaSession, BrokerError> {
        let producer: KafkaProducer = client_config(settings).create().map_err(classify)?;
        debug!(transactional_id = %settings.transactional_id, "kafka producer created");
        Ok(KafkaSession {
            producer: Some(Arc::new(producer)),
            transactional_id: settings.transactional_id.clone(),
            timeout: self.operation_timeout,
            calls: BlockingCalls::new(),
        })
    }
}

pub struct KafkaSession {
    producer: Option<Arc<KafkaProducer>>,
    transactional_id: String,
    timeout: Duration,
    calls: BlockingCalls,
}

impl KafkaSession {
    fn producer(&self) -> Result<Arc<KafkaProducer>, BrokerError> {
        self.producer
            .clone()
            .ok_or_else(|| BrokerError::Fatal("session closed".into()))
    }

    async fn blocking<F>(&mut self, operation: Operation, call: F) -> Result<(), BrokerError>
    where
        F: FnOnce(&KafkaProducer, Duration) -> Result<(), KafkaError> + Send + 'static,
    {
        let producer = self.producer()?;
        let timeout = self.timeout;
        self.calls
            .run(operation, move || call(&producer, timeout).map_err(classify))
            .await
    }
}

#[async_trait]
impl TransactionalSession for KafkaSession {
    async fn init_transactions(&mut self) -> Result<(), BrokerError> {
        self.blocking(Operation::Init, |p, timeout| p.init_transactions(timeout))
            .await
    }

    async fn begin_transaction(&mut self) -> Result<(), BrokerError> {
        self.blocking(Operation::Begin, |p, _| p.begin_transaction())
            .await
    }

    async fn send(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if let Some(Err(error)) = self.calls.settle().await {
            debug!(transactional_id = %self.transactional_id, %error, "earlier call failed");
        }
        let producer = self.producer()?;
        producer
            .send(BaseRecord::<(), [u8]>::to(topic).payload(payload))
            .map_err(|(e, _)| classify(e))
    }

    async fn commit_transaction(&mut self) -> Result<(), BrokerError> {
        self.blocking(Operation::Commit, |p, timeout| p.commit_transaction(timeout))
            .await
    }

    async fn abort_transaction(&mut self) -> Result<(), BrokerError> {
        self.blocking(Operation::Abort, |p, timeout| p.abort_transaction(timeout))
            .await
    }

    async fn close(&mut self) {
        if let Some(Err(error)) = self.calls.settle().await {
            debug!(transactional_id = %self.transactional_id, %error, "earlier call failed");
        }
        let Some(producer) = self.producer.take() else {
            return;
        };
        let timeout = self.timeout;
        match tokio::task::spawn_blocking(move || producer.flush(timeout)).await {
            Ok(Ok(())) => debug!(transactional_id = %self.transactional_id, "kafka producer closed"),
            Ok(Err(error)) => warn!(
                transactional_id = %self.transactional_id,
                %error,
                "flush on close failed"
            ),
            Err(error) => warn!(
                transactional_id = %self.transactional_id,
                %error,
                "flush task failed"
            ),
        }
    }
}
