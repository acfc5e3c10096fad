// Broker port: what the outcome publisher needs from a transactional message broker.
//
// Purpose
// - Describe a transactional producer session (InitProducerId, AddPartitionsToTxn, Produce,
//   EndTxn) as an async trait, independent of any client library.
//
// Responsibilities
// - Carry the producer settings a session is opened with.
// - Classify every broker failure as unreachable, retriable, abortable or fatal.
//
// Boundaries
// - No transaction bookkeeping here. The producer handle owns the state machine.
//
// Testing guidance
// - Use the in memory broker; it buffers transactional records and supports fault injection.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Init,
    Begin,
    Send,
    Commit,
    Abort,
    Close,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Init => "init",
            Operation::Begin => "begin",
            Operation::Send => "send",
            Operation::Commit => "commit",
            Operation::Abort => "abort",
            Operation::Close => "close",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unreachable,
    Retriable,
    Abortable,
    Fatal,
    IllegalState,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("retriable broker error: {0}")]
    Retriable(String),

    #[error("transaction must be aborted: {0}")]
    Abortable(String),

    #[error("fatal producer error: {0}")]
    Fatal(String),

    #[error("{operation} is not permitted while the producer is {state}")]
    IllegalState { operation: Operation, state: String },
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::Unreachable(_) => ErrorKind::Unreachable,
            BrokerError::Retriable(_) => ErrorKind::Retriable,
            BrokerError::Abortable(_) => ErrorKind::Abortable,
            BrokerError::Fatal(_) => ErrorKind::Fatal,
            BrokerError::IllegalState { .. } => ErrorKind::IllegalState,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acks {
    Leader,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partitioner {
    RoundRobin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerSettings {
    pub brokers: Arc<[String]>,
    pub transactional_id: String,
    pub idempotent: bool,
    pub acks: Acks,
    pub partitioner: Partitioner,
    pub max_in_flight_requests: u32,
    pub transaction_timeout: Duration,
}

impl ProducerSettings {
    /// Idempotent transactional producer with acks=all and one request in flight.
    pub fn transactional(
        brokers: Arc<[String]>,
        transactional_id: impl Into<String>,
        transaction_timeout: Duration,
    ) -> Self {
        Self {
            brokers,
            transactional_id: transactional_id.into(),
            idempotent: true,
            acks: Acks::All,
            partitioner: Partitioner::RoundRobin,
            max_in_flight_requests: 1,
            transaction_timeout,
        }
    }

    pub fn supports_transactions(&self) -> bool {
        self.idempotent && self.acks == Acks::All && self.max_in_flight_requests == 1
    }
}

/// One connection-bound transactional session. Calls are strictly sequential per session.
#[async_trait]
pub trait TransactionalSession: Send + 'static {
    async fn init_transactions(&mut self) -> Result<(), BrokerError>;
    async fn begin_transaction(&mut self) -> Result<(), BrokerError>;
    async fn send(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError>;
    async fn commit_transaction(&mut self) -> Result<(), BrokerError>;
    async fn abort_transaction(&mut self) -> Result<(), BrokerError>;
    async fn close(&mut self);
}

#[async_trait]
pub trait SessionConnector: Send + Sync + 'static {
    type Session: TransactionalSession;

    async fn connect(&self, settings: &ProducerSettings) -> Result<Self::Session, BrokerError>;
}

pub mod blocking;
pub mod in_memory;

#[cfg(feature = "kafka")]
pub mod kafka;
