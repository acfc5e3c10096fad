// In memory implementation of the broker port.
//
// Purpose
// - Support publisher tests and local development without a running broker.
//
// Responsibilities
// - Buffer transactional records per session and expose them only on commit.
// - Spread committed records round robin over the partitions of a topic.
// - Fence older sessions when a transactional id is initialised again.
// - Inject failures on demand so recovery paths can be exercised.

use crate::shared::infrastructure::broker::{
    BrokerError, Operation, ProducerSettings, SessionConnector, TransactionalSession,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const DEFAULT_PARTITIONS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub partition: usize,
    pub offset: u64,
    pub transactional_id: String,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct TopicLog {
    partitions: Vec<Vec<StoredRecord>>,
    next_partition: usize,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, TopicLog>,
    epochs: HashMap<String, u64>,
    faults: HashMap<Operation, VecDeque<BrokerError>>,
    refused_connections: usize,
    open_sessions: usize,
}

struct Inner {
    partitions_per_topic: usize,
    offline: AtomicBool,
    state: Mutex<BrokerState>,
}

#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    pub fn with_partitions(partitions_per_topic: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                partitions_per_topic: partitions_per_topic.max(1),
                offline: AtomicBool::new(false),
                state: Mutex::new(BrokerState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn toggle_offline(&self) {
        self.inner.offline.fetch_xor(true, Ordering::SeqCst);
    }

    /// The next `count` connection attempts fail as if the broker were unreachable.
    pub fn refuse_connections(&self, count: usize) {
        self.state().refused_connections += count;
    }

    /// Queues `error` for the next `operation` performed by any session.
    pub fn fail_next(&self, operation: Operation, error: BrokerError) {
        self.state()
            .faults
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    pub fn committed_records(&self, topic: &str) -> Vec<StoredRecord> {
        let state = self.state();
        let mut records: Vec<StoredRecord> = state
            .topics
            .get(topic)
            .map(|log| log.partitions.iter().flatten().cloned().collect())
            .unwrap_or_default();
        records.sort_by_key(|r| (r.partition, r.offset));
        records
    }

    pub fn payloads(&self, topic: &str) -> Vec<Vec<u8>> {
        self.committed_records(topic)
            .into_iter()
            .map(|r| r.payload)
            .collect()
    }

    /// Number of sessions connected and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.state().open_sessions
    }

    fn register_producer(&self, transactional_id: &str) -> u64 {
        let mut state = self.state();
        let epoch = state
            .epochs
            .entry(transactional_id.to_string())
            .or_insert(0);
        *epoch += 1;
        *epoch
    }

    fn current_epoch(&self, transactional_id: &str) -> u64 {
        self.state()
            .epochs
            .get(transactional_id)
            .copied()
            .unwrap_or(0)
    }

    fn take_fault(&self, operation: Operation) -> Option<BrokerError> {
        self.state()
            .faults
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
    }

    fn append(&self, transactional_id: &str, records: Vec<(String, Vec<u8>)>) {
        let partitions = self.inner.partitions_per_topic;
        let mut state = self.state();
        for (topic, payload) in records {
            let log = state.topics.entry(topic).or_default();
            if log.partitions.is_empty() {
                log.partitions = vec![Vec::new(); partitions];
            }
            let partition = log.next_partition;
            log.next_partition = (partition + 1) % log.partitions.len();
            let entries = &mut log.partitions[partition];
            let offset = entries.len() as u64;
            entries.push(StoredRecord {
                partition,
                offset,
                transactional_id: transactional_id.to_string(),
                payload,
            });
        }
    }

    fn disconnect(&self) {
        let mut state = self.state();
        state.open_sessions = state.open_sessions.saturating_sub(1);
    }
}

#[async_trait]
impl SessionConnector for InMemoryBroker {
    type Session = InMemorySession;

    async fn connect(&self, settings: &ProducerSettings) -> Result<InMemorySession, BrokerError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(BrokerError::Unreachable("In memory broker offline".into()));
        }
        if !settings.supports_transactions() {
            return Err(BrokerError::Fatal(
                "transactional producers require idempotence, acks=all and one in-flight request"
                    .into(),
            ));
        }
        {
            let mut state = self.state();
            if state.refused_connections > 0 {
                state.refused_connections -= 1;
                return Err(BrokerError::Unreachable("connection refused".into()));
            }
            state.open_sessions += 1;
        }
        Ok(InMemorySession {
            broker: self.clone(),
            transactional_id: settings.transactional_id.clone(),
            epoch: 0,
            pending: Vec::new(),
            fatal: None,
            closed: false,
        })
    }
}

pub struct InMemorySession {
    broker: InMemoryBroker,
    transactional_id: String,
    epoch: u64,
    pending: Vec<(String, Vec<u8>)>,
    fatal: Option<String>,
    closed: bool,
}

impl InMemorySession {
    fn check(&mut self, operation: Operation) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Fatal("session closed".into()));
        }
        if let Some(reason) = &self.fatal {
            return Err(BrokerError::Fatal(reason.clone()));
        }
        if self.broker.current_epoch(&self.transactional_id) > self.epoch {
            let reason = format!(
                "producer fenced: transactional id {} was initialised by a newer session",
                self.transactional_id
            );
            self.fatal = Some(reason.clone());
            return Err(BrokerError::Fatal(reason));
        }
        if let Some(error) = self.broker.take_fault(operation) {
            if let BrokerError::Fatal(reason) = &error {
                self.fatal = Some(reason.clone());
            }
            return Err(error);
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionalSession for InMemorySession {
    async fn init_transactions(&mut self) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Fatal("session closed".into()));
        }
        if let Some(error) = self.broker.take_fault(Operation::Init) {
            return Err(error);
        }
        self.epoch = self.broker.register_producer(&self.transactional_id);
        Ok(())
    }

    async fn begin_transaction(&mut self) -> Result<(), BrokerError> {
        self.check(Operation::Begin)?;
        self.pending.clear();
        Ok(())
    }

    async fn send(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.check(Operation::Send)?;
        self.pending.push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<(), BrokerError> {
        self.check(Operation::Commit)?;
        let records = std::mem::take(&mut self.pending);
        self.broker.append(&self.transactional_id, records);
        Ok(())
    }

    async fn abort_transaction(&mut self) -> Result<(), BrokerError> {
        self.check(Operation::Abort)?;
        self.pending.clear();
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.pending.clear();
            self.broker.disconnect();
        }
    }
}
