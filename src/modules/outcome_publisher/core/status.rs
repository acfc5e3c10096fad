// Transactional status of a producer handle, modelled as an explicit state machine.
//
// Boundaries
// - Pure functions only. The handle applies the transitions around real broker calls.
//
// Testing guidance
// - Assert transitions as a table of (status, operation, outcome) -> next status.

use crate::shared::infrastructure::broker::{BrokerError, ErrorKind, Operation};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Ready,
    InTransaction,
    Abortable,
    Fatal,
    Closed,
}

impl TransactionStatus {
    pub fn permits(self, operation: Operation) -> bool {
        use TransactionStatus::*;
        match operation {
            Operation::Begin => self == Ready,
            Operation::Send | Operation::Commit => self == InTransaction,
            Operation::Abort => matches!(self, InTransaction | Abortable),
            Operation::Close => true,
            Operation::Init => false,
        }
    }

    /// Status after `operation` completed with `outcome`.
    pub fn after(self, operation: Operation, outcome: Result<(), &BrokerError>) -> Self {
        use TransactionStatus::*;
        if operation == Operation::Close {
            return Closed;
        }
        if matches!(self, Fatal | Closed) {
            return self;
        }
        let kind = match outcome {
            Ok(()) => None,
            Err(error) => Some(error.kind()),
        };
        match (operation, kind) {
            (_, Some(ErrorKind::Fatal)) => Fatal,
            (Operation::Begin, None) => InTransaction,
            (Operation::Commit | Operation::Abort, None) => Ready,
            (Operation::Send | Operation::Commit, Some(ErrorKind::Abortable)) => Abortable,
            _ => self,
        }
    }

    pub fn is_reusable(self) -> bool {
        self == TransactionStatus::Ready
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionStatus::Fatal | TransactionStatus::Closed)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionStatus::Ready => "ready",
            TransactionStatus::InTransaction => "in transaction",
            TransactionStatus::Abortable => "abortable",
            TransactionStatus::Fatal => "fatal",
            TransactionStatus::Closed => "closed",
        };
        f.write_str(name)
    }
}
