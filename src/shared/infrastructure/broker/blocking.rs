// Serialises blocking client calls of one broker session.
//
// A caller that stops waiting (the handle's deadline fired) drops only its future; the blocking
// call keeps running on tokio's blocking pool. The call is parked here and finished before the
// session issues anything else, so two calls never run against one producer at the same time.
// When the next request repeats the parked operation and the parked call succeeded, its outcome
// is returned instead of issuing the call twice.

use crate::shared::infrastructure::broker::{BrokerError, Operation};
use tokio::task::JoinHandle;

type Call = JoinHandle<Result<(), BrokerError>>;

#[derive(Debug, Default)]
pub struct BlockingCalls {
    in_flight: Option<(Operation, Call)>,
}

async fn join(task: &mut Call) -> Result<(), BrokerError> {
    task.await
        .unwrap_or_else(|e| Err(BrokerError::Retriable(format!("blocking task failed: {e}"))))
}

impl BlockingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    pub async fn run<F>(&mut self, operation: Operation, call: F) -> Result<(), BrokerError>
    where
        F: FnOnce() -> Result<(), BrokerError> + Send + 'static,
    {
        if let Some((parked, task)) = self.in_flight.as_mut() {
            let parked = *parked;
            let outcome = join(task).await;
            self.in_flight = None;
            if parked == operation && outcome.is_ok() {
                return outcome;
            }
        }
        let (_, task) = self
            .in_flight
            .insert((operation, tokio::task::spawn_blocking(call)));
        let outcome = join(task).await;
        self.in_flight = None;
        outcome
    }

    /// Waits for a parked call. Returns its outcome, or `None` when nothing was running.
    pub async fn settle(&mut self) -> Option<Result<(), BrokerError>> {
        let (_, task) = self.in_flight.as_mut()?;
        let outcome = join(task).await;
        self.in_flight = None;
        Some(outcome)
    }
}
