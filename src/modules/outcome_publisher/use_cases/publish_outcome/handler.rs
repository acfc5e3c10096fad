// Publishes one outcome record per call inside its own broker transaction.
//
// Flow
// - Borrow a handle, begin, send one keyless record, commit.
// - Retriable failures are retried with backoff; abortable ones are aborted; fatal ones poison
//   the handle so the pool drops it and the next borrow builds a fresh one.
// - The handle always goes back to the pool with no open transaction, even when the caller
//   cancels or drops the publish future.

use crate::modules::outcome_publisher::adapters::outbound::producer_pool::ProducerPool;
use crate::modules::outcome_publisher::core::handle::ProducerHandle;
use crate::modules::outcome_publisher::core::status::TransactionStatus;
use crate::modules::outcome_publisher::use_cases::publish_outcome::port::{
    OutcomeSink, PublishError,
};
use crate::shared::core::backoff::BackoffPolicy;
use crate::shared::infrastructure::broker::{
    BrokerError, Operation, SessionConnector, TransactionalSession,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Clone, Copy)]
enum Step<'a> {
    Send { topic: &'a str, payload: &'a [u8] },
    Commit,
}

pub struct TransactionRunner<C: SessionConnector> {
    pool: Arc<ProducerPool<C>>,
    retry: BackoffPolicy,
}

impl<C: SessionConnector> Clone for TransactionRunner<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            retry: self.retry,
        }
    }
}

impl<C: SessionConnector> TransactionRunner<C> {
    pub fn new(pool: Arc<ProducerPool<C>>, retry: BackoffPolicy) -> Self {
        Self { pool, retry }
    }

    pub async fn run(
        &self,
        topic: &str,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), PublishError> {
        let mut handle = self.pool.borrow(cancel).await?;
        let outcome = self.transact(&mut handle, topic, payload, cancel).await;
        match &outcome {
            Ok(()) => debug!(
                transactional_id = %handle.transactional_id(),
                topic,
                "outcome committed"
            ),
            Err(e) if e.is_fatal() => {}
            Err(e) => warn!(
                transactional_id = %handle.transactional_id(),
                topic,
                error = %e,
                "outcome not published"
            ),
        }
        self.pool.release(handle).await;
        outcome
    }

    async fn transact(
        &self,
        handle: &mut ProducerHandle<C::Session>,
        topic: &str,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), PublishError> {
        if let Err(error) = handle.begin().await {
            return Err(if handle.status() == TransactionStatus::Fatal {
                fatal(handle, error)
            } else {
                PublishError::Begin(error)
            });
        }
        self.complete(handle, Step::Send { topic, payload }, cancel)
            .await?;
        if cancel.is_cancelled() {
            return Err(self.abort(handle, PublishError::Cancelled).await);
        }
        self.complete(handle, Step::Commit, cancel).await
    }

    async fn perform(
        handle: &mut ProducerHandle<C::Session>,
        step: Step<'_>,
    ) -> Result<(), BrokerError> {
        match step {
            Step::Send { topic, payload } => handle.send(topic, payload).await,
            Step::Commit => handle.commit().await,
        }
    }

    /// Drives `step` until it succeeds or the transaction reaches a terminal state.
    async fn complete(
        &self,
        handle: &mut ProducerHandle<C::Session>,
        step: Step<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError> {
        let mut attempt = 0;
        loop {
            let error = match Self::perform(handle, step).await {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };
            match handle.status() {
                TransactionStatus::Fatal => return Err(fatal(handle, error)),
                TransactionStatus::Abortable => {
                    return Err(self.abort(handle, PublishError::Aborted(error)).await);
                }
                _ => {}
            }
            attempt += 1;
            if !self.retry.can_retry(attempt) {
                let reason = PublishError::RetriesExhausted {
                    attempts: attempt - 1,
                    last: error,
                };
                return Err(self.abort(handle, reason).await);
            }
            warn!(
                transactional_id = %handle.transactional_id(),
                attempt,
                %error,
                "retrying transactional step"
            );
            if !self.retry.wait(attempt, cancel).await {
                return Err(self.abort(handle, PublishError::Cancelled).await);
            }
        }
    }

    /// Aborts the open transaction and hands back `reason`. Cancellation is ignored here: the
    /// handle must not leave this call mid-transaction.
    async fn abort(
        &self,
        handle: &mut ProducerHandle<C::Session>,
        reason: PublishError,
    ) -> PublishError {
        let mut attempt = 0;
        loop {
            let error = match handle.abort().await {
                Ok(()) => {
                    debug!(transactional_id = %handle.transactional_id(), "transaction aborted");
                    return reason;
                }
                Err(error) => error,
            };
            if handle.status() == TransactionStatus::Fatal {
                return fatal(handle, error);
            }
            if !handle.status().permits(Operation::Abort) {
                return reason;
            }
            attempt += 1;
            if !self.retry.can_retry(attempt) {
                warn!(
                    transactional_id = %handle.transactional_id(),
                    %error,
                    "abort kept failing, discarding producer"
                );
                handle.mark_fatal();
                return reason;
            }
            self.retry.wait_uninterruptible(attempt).await;
        }
    }
}

fn fatal<S: TransactionalSession>(handle: &ProducerHandle<S>, reason: BrokerError) -> PublishError {
    error!(
        transactional_id = %handle.transactional_id(),
        %reason,
        "fatal producer error, producer will be replaced"
    );
    PublishError::Fatal {
        transactional_id: handle.transactional_id().to_string(),
        reason,
    }
}

pub struct OutcomePublisher<C: SessionConnector> {
    runner: TransactionRunner<C>,
}

impl<C: SessionConnector> OutcomePublisher<C> {
    pub fn new(pool: Arc<ProducerPool<C>>, retry: BackoffPolicy) -> Self {
        Self {
            runner: TransactionRunner::new(pool, retry),
        }
    }

    pub fn pool(&self) -> &Arc<ProducerPool<C>> {
        &self.runner.pool
    }

    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        self.publish_with_cancel(topic, payload, &CancellationToken::new())
            .await
    }

    /// Runs the publish on its own task so that dropping this future cannot strand a handle
    /// mid-transaction. Cancel through `cancel` instead.
    pub async fn publish_with_cancel(
        &self,
        topic: &str,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), PublishError> {
        let runner = self.runner.clone();
        let topic = topic.to_string();
        let payload = payload.to_vec();
        let cancel = cancel.clone();
        tokio::spawn(async move { runner.run(&topic, &payload, &cancel).await })
            .await
            .map_err(|e| PublishError::Interrupted(e.to_string()))?
    }

    /// Closes the idle producers. Publishes still in flight close theirs when they finish.
    pub async fn shutdown(&self) -> usize {
        self.runner.pool.drain_and_close().await
    }
}

#[async_trait]
impl<C: SessionConnector> OutcomeSink for OutcomePublisher<C> {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        OutcomePublisher::publish(self, topic, payload).await
    }
}

#[cfg(test)]
mod outcome_publisher_tests {
    use super::*;
    use crate::modules::outcome_publisher::adapters::outbound::producer_factory::{
        ProducerFactory, ProducerOptions,
    };
    use crate::modules::outcome_publisher::adapters::outbound::producer_pool::{
        PoolError, PoolStats,
    };
    use crate::shared::infrastructure::broker::in_memory::InMemoryBroker;
    use rstest::{fixture, rstest};
    use std::collections::HashSet;
    use std::time::Duration;

    const TOPIC: &str = "saga-step-results";

    type BeforeEachReturn = (InMemoryBroker, OutcomePublisher<InMemoryBroker>);

    fn publisher(broker: &InMemoryBroker) -> OutcomePublisher<InMemoryBroker> {
        publisher_with_retry(broker, BackoffPolicy::immediate(3))
    }

    fn publisher_with_retry(
        broker: &InMemoryBroker,
        retry: BackoffPolicy,
    ) -> OutcomePublisher<InMemoryBroker> {
        let factory = ProducerFactory::new(
            broker.clone(),
            ProducerOptions::new(vec!["in-memory:9092".to_string()], "settings-svc"),
        );
        let pool = Arc::new(ProducerPool::new(factory, BackoffPolicy::immediate(3)));
        OutcomePublisher::new(pool, retry)
    }

    #[fixture]
    fn before_each() -> BeforeEachReturn {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);
        (broker, publisher)
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_publish_exactly_one_record(before_each: BeforeEachReturn) {
        let (broker, publisher) = before_each;
        publisher.publish(TOPIC, b"step-1-ok").await.unwrap();
        assert_eq!(broker.payloads(TOPIC), vec![b"step-1-ok".to_vec()]);
        let records = broker.committed_records(TOPIC);
        assert_eq!(records[0].transactional_id, "settings-svc-1");
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_absorb_retriable_commit_failures(before_each: BeforeEachReturn) {
        let (broker, publisher) = before_each;
        for _ in 0..3 {
            broker.fail_next(Operation::Commit, BrokerError::Retriable("timeout".into()));
        }
        publisher.publish(TOPIC, b"step-1-ok").await.unwrap();
        assert_eq!(broker.payloads(TOPIC), vec![b"step-1-ok".to_vec()]);
        assert_eq!(
            publisher.pool().stats().await,
            PoolStats {
                idle: 1,
                created: 1,
                discarded: 0
            }
        );
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_absorb_retriable_send_failures(before_each: BeforeEachReturn) {
        let (broker, publisher) = before_each;
        broker.fail_next(Operation::Send, BrokerError::Retriable("queue full".into()));
        publisher.publish(TOPIC, b"step-1-ok").await.unwrap();
        assert_eq!(broker.payloads(TOPIC), vec![b"step-1-ok".to_vec()]);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_reuse_the_producer_across_publishes(before_each: BeforeEachReturn) {
        let (broker, publisher) = before_each;
        publisher.publish(TOPIC, b"first").await.unwrap();
        publisher.publish(TOPIC, b"second").await.unwrap();
        let ids: HashSet<String> = broker
            .committed_records(TOPIC)
            .into_iter()
            .map(|r| r.transactional_id)
            .collect();
        assert_eq!(ids, HashSet::from(["settings-svc-1".to_string()]));
        assert_eq!(publisher.pool().stats().await.created, 1);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_abort_and_keep_the_producer_when_commit_is_abortable(
        before_each: BeforeEachReturn,
    ) {
        let (broker, publisher) = before_each;
        broker.fail_next(Operation::Commit, BrokerError::Abortable("delivery failed".into()));
        let result = publisher.publish(TOPIC, b"lost").await;
        assert!(matches!(result, Err(PublishError::Aborted(BrokerError::Abortable(_)))));
        assert!(broker.payloads(TOPIC).is_empty());
        assert_eq!(publisher.pool().stats().await.idle, 1);

        publisher.publish(TOPIC, b"recorded").await.unwrap();
        let records = broker.committed_records(TOPIC);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, b"recorded".to_vec());
        assert_eq!(records[0].transactional_id, "settings-svc-1");
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_abort_when_send_is_abortable(before_each: BeforeEachReturn) {
        let (broker, publisher) = before_each;
        broker.fail_next(Operation::Send, BrokerError::Abortable("unknown partition".into()));
        let result = publisher.publish(TOPIC, b"lost").await;
        assert!(matches!(result, Err(PublishError::Aborted(_))));
        assert_eq!(publisher.pool().stats().await.idle, 1);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_replace_a_producer_after_a_fatal_commit(before_each: BeforeEachReturn) {
        let (broker, publisher) = before_each;
        broker.fail_next(Operation::Commit, BrokerError::Fatal("producer fenced".into()));
        let result = publisher.publish(TOPIC, b"lost").await;
        match result {
            Err(PublishError::Fatal {
                transactional_id,
                reason,
            }) => {
                assert_eq!(transactional_id, "settings-svc-1");
                assert!(reason.is_fatal());
            }
            other => panic!("expected Fatal, got {other:?}"),
        }
        assert_eq!(broker.open_sessions(), 0);
        assert_eq!(publisher.pool().stats().await.discarded, 1);

        publisher.publish(TOPIC, b"recorded").await.unwrap();
        let records = broker.committed_records(TOPIC);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].transactional_id, "settings-svc-2");
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_report_a_fatal_begin(before_each: BeforeEachReturn) {
        let (broker, publisher) = before_each;
        broker.fail_next(Operation::Begin, BrokerError::Fatal("producer fenced".into()));
        let result = publisher.publish(TOPIC, b"lost").await;
        assert!(result.unwrap_err().is_fatal());
        assert_eq!(publisher.pool().stats().await.discarded, 1);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_return_a_retriable_begin_failure(before_each: BeforeEachReturn) {
        let (broker, publisher) = before_each;
        broker.fail_next(Operation::Begin, BrokerError::Retriable("coordinator loading".into()));
        let result = publisher.publish(TOPIC, b"lost").await;
        assert!(matches!(result, Err(PublishError::Begin(_))));
        assert_eq!(publisher.pool().stats().await.idle, 1);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_abort_once_commit_retries_are_exhausted(before_each: BeforeEachReturn) {
        let (broker, publisher) = before_each;
        for _ in 0..4 {
            broker.fail_next(Operation::Commit, BrokerError::Retriable("timeout".into()));
        }
        let result = publisher.publish(TOPIC, b"lost").await;
        assert!(matches!(
            result,
            Err(PublishError::RetriesExhausted { attempts: 3, .. })
        ));
        assert!(broker.payloads(TOPIC).is_empty());
        assert_eq!(publisher.pool().stats().await.idle, 1);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_discard_a_producer_whose_abort_keeps_failing(
        before_each: BeforeEachReturn,
    ) {
        let (broker, publisher) = before_each;
        broker.fail_next(Operation::Commit, BrokerError::Abortable("delivery failed".into()));
        for _ in 0..4 {
            broker.fail_next(Operation::Abort, BrokerError::Retriable("timeout".into()));
        }
        let result = publisher.publish(TOPIC, b"lost").await;
        assert!(matches!(result, Err(PublishError::Aborted(_))));
        let stats = publisher.pool().stats().await;
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.discarded, 1);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_abort_when_cancelled_before_commit(before_each: BeforeEachReturn) {
        let (broker, publisher) = before_each;
        publisher.publish(TOPIC, b"warm-up").await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = publisher.publish_with_cancel(TOPIC, b"lost", &cancel).await;
        assert!(matches!(result, Err(PublishError::Cancelled)));
        assert_eq!(broker.payloads(TOPIC), vec![b"warm-up".to_vec()]);
        assert_eq!(publisher.pool().stats().await.idle, 1);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_abort_when_cancelled_while_backing_off_a_commit() {
        let broker = InMemoryBroker::new();
        let publisher = publisher_with_retry(
            &broker,
            BackoffPolicy::new(Duration::from_secs(30), Duration::from_secs(30), 3),
        );
        broker.fail_next(Operation::Commit, BrokerError::Retriable("timeout".into()));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result = publisher.publish_with_cancel(TOPIC, b"lost", &cancel).await;
        assert!(matches!(result, Err(PublishError::Cancelled)));
        assert!(broker.payloads(TOPIC).is_empty());
        assert_eq!(
            publisher.pool().stats().await,
            PoolStats {
                idle: 1,
                created: 1,
                discarded: 0
            }
        );
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_discard_a_producer_whose_abort_is_fatal(before_each: BeforeEachReturn) {
        let (broker, publisher) = before_each;
        broker.fail_next(Operation::Commit, BrokerError::Abortable("delivery failed".into()));
        broker.fail_next(Operation::Abort, BrokerError::Fatal("producer fenced".into()));
        let result = publisher.publish(TOPIC, b"lost").await;
        match result {
            Err(PublishError::Fatal {
                transactional_id, ..
            }) => assert_eq!(transactional_id, "settings-svc-1"),
            other => panic!("expected Fatal, got {other:?}"),
        }
        assert!(broker.payloads(TOPIC).is_empty());
        assert_eq!(broker.open_sessions(), 0);
        let stats = publisher.pool().stats().await;
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.discarded, 1);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_fail_when_no_producer_can_be_created(before_each: BeforeEachReturn) {
        let (broker, publisher) = before_each;
        broker.toggle_offline();
        let result = publisher.publish(TOPIC, b"lost").await;
        assert!(matches!(
            result,
            Err(PublishError::Pool(PoolError::CreationExhausted { .. }))
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_close_idle_producers_on_shutdown(before_each: BeforeEachReturn) {
        let (broker, publisher) = before_each;
        publisher.publish(TOPIC, b"step-1-ok").await.unwrap();
        assert_eq!(publisher.shutdown().await, 1);
        assert_eq!(broker.open_sessions(), 0);
        let result = publisher.publish(TOPIC, b"late").await;
        assert!(matches!(result, Err(PublishError::Pool(PoolError::Closed))));
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn it_should_publish_each_of_fifty_concurrent_outcomes_once() {
        let broker = InMemoryBroker::new();
        let publisher = Arc::new(publisher(&broker));
        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let publisher = publisher.clone();
                tokio::spawn(async move {
                    let payload = format!("payload-{i}");
                    publisher.publish("results", payload.as_bytes()).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let payloads: Vec<String> = broker
            .payloads("results")
            .into_iter()
            .map(|p| String::from_utf8(p).unwrap())
            .collect();
        assert_eq!(payloads.len(), 50);
        let distinct: HashSet<&String> = payloads.iter().collect();
        assert_eq!(distinct.len(), 50);
        let stats = publisher.pool().stats().await;
        assert_eq!(stats.idle as u64, stats.created);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_serve_as_an_outcome_sink(before_each: BeforeEachReturn) {
        let (broker, publisher) = before_each;
        let sink: Arc<dyn OutcomeSink> = Arc::new(publisher);
        sink.publish(TOPIC, b"step-1-ok").await.unwrap();
        assert_eq!(broker.payloads(TOPIC).len(), 1);
    }
}
