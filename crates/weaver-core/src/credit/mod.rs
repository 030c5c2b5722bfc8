//! Credit metering: admission control, per-node deduction, and settlement.
//!
//! An execution reserves an estimated budget up front (a `false` reservation
//! prevents it from starting), deducts each node's cost as it completes, and
//! settles at the end: unspent credits are released back to the account.
//! `reserved = spent + released` holds for every closed ledger.

pub mod coordinator;
pub mod pricing;
pub mod store;

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CreditError {
    #[error("credit reservation exhausted for execution {execution_id}: requested {requested}, remaining {remaining}")]
    Exhausted {
        execution_id: Uuid,
        requested: u64,
        remaining: u64,
    },

    #[error("no open credit ledger for execution {0}")]
    LedgerNotFound(Uuid),

    #[error("credit ledger for execution {0} is already open")]
    AlreadyOpen(Uuid),

    #[error("credit store error: {0}")]
    Store(String),
}
