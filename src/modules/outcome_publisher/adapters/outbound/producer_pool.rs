// Pool of idle, healthy transactional producer handles.
//
// Purpose
// - Let many concurrent publishes share a bounded number of broker sessions without two tasks
//   ever driving the same session.
//
// Responsibilities
// - Lend an idle handle, or create one through the factory on a miss.
// - Take handles back after use; close and drop the ones that are no longer reusable.
// - Close every idle handle on shutdown.
//
// Invariants
// - A handle is in the idle set if and only if it is Ready.
// - The lock guards the idle set only; no broker round trip happens while it is held.

use crate::modules::outcome_publisher::adapters::outbound::producer_factory::ProducerFactory;
use crate::modules::outcome_publisher::core::handle::ProducerHandle;
use crate::shared::core::backoff::BackoffPolicy;
use crate::shared::infrastructure::broker::{BrokerError, SessionConnector};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no producer could be created after {attempts} attempts: {last}")]
    CreationExhausted { attempts: u32, last: BrokerError },

    #[error("cancelled while waiting for a producer")]
    Cancelled,

    #[error("producer pool is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub created: u64,
    pub discarded: u64,
}

struct IdleSet<H> {
    handles: Vec<H>,
    closed: bool,
}

pub struct ProducerPool<C: SessionConnector> {
    factory: ProducerFactory<C>,
    creation: BackoffPolicy,
    idle: Mutex<IdleSet<ProducerHandle<C::Session>>>,
    created: AtomicU64,
    discarded: AtomicU64,
}

impl<C: SessionConnector> ProducerPool<C> {
    pub fn new(factory: ProducerFactory<C>, creation: BackoffPolicy) -> Self {
        Self {
            factory,
            creation,
            idle: Mutex::new(IdleSet {
                handles: Vec::new(),
                closed: false,
            }),
            created: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    pub fn factory(&self) -> &ProducerFactory<C> {
        &self.factory
    }

    pub async fn borrow(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ProducerHandle<C::Session>, PoolError> {
        let transactional_id = {
            let mut idle = self.idle.lock().await;
            if idle.closed {
                return Err(PoolError::Closed);
            }
            if let Some(handle) = idle.handles.pop() {
                debug!(transactional_id = %handle.transactional_id(), "reusing idle producer");
                return Ok(handle);
            }
            self.factory.next_transactional_id()
        };
        self.create(transactional_id, cancel).await
    }

    async fn create(
        &self,
        transactional_id: String,
        cancel: &CancellationToken,
    ) -> Result<ProducerHandle<C::Session>, PoolError> {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(PoolError::Cancelled);
            }
            let error = match self.factory.create(transactional_id.clone()).await {
                Ok(handle) => {
                    self.created.fetch_add(1, Ordering::SeqCst);
                    return Ok(handle);
                }
                Err(error) => error,
            };
            attempt += 1;
            if error.is_fatal() || !self.creation.can_retry(attempt) {
                return Err(PoolError::CreationExhausted {
                    attempts: attempt,
                    last: error,
                });
            }
            warn!(%transactional_id, attempt, %error, "producer creation failed, retrying");
            if !self.creation.wait(attempt, cancel).await {
                return Err(PoolError::Cancelled);
            }
        }
    }

    pub async fn release(&self, mut handle: ProducerHandle<C::Session>) {
        let status = handle.status();
        if !status.is_reusable() {
            warn!(
                transactional_id = %handle.transactional_id(),
                %status,
                "discarding producer"
            );
            handle.close().await;
            self.discarded.fetch_add(1, Ordering::SeqCst);
            return;
        }
        let mut idle = self.idle.lock().await;
        if !idle.closed {
            idle.handles.push(handle);
            return;
        }
        drop(idle);
        debug!(
            transactional_id = %handle.transactional_id(),
            "pool closed, closing returned producer"
        );
        handle.close().await;
    }

    /// Closes every idle handle and refuses further borrows. Returns how many were closed.
    pub async fn drain_and_close(&self) -> usize {
        let handles = {
            let mut idle = self.idle.lock().await;
            idle.closed = true;
            std::mem::take(&mut idle.handles)
        };
        let count = handles.len();
        for mut handle in handles {
            handle.close().await;
        }
        info!(closed = count, "producer pool drained");
        count
    }

    pub async fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().await.handles.len();
        PoolStats {
            idle,
            created: self.created.load(Ordering::SeqCst),
            discarded: self.discarded.load(Ordering::SeqCst),
        }
    }
}
