//! Account balance storage behind the credit coordinator.
//!
//! A store keeps per-account balances and per-execution holds. `hold` moves
//! credits out of the available balance; `settle` drops the hold and debits
//! what was actually spent.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use super::CreditError;

/// Account balance storage.
///
/// Uses native async fn in traits (Rust 2024 edition, RPITIT).
/// For dynamic dispatch, use [`BoxCreditStore`].
pub trait CreditStore: Send + Sync {
    /// Credits available for new holds.
    fn balance(&self, account: &str) -> impl Future<Output = Result<u64, CreditError>> + Send;

    /// Place a hold of `amount`. Returns `false` when the available balance is too low.
    fn hold(
        &self,
        account: &str,
        execution_id: Uuid,
        amount: u64,
    ) -> impl Future<Output = Result<bool, CreditError>> + Send;

    /// Drop the execution's hold and debit `spent`.
    fn settle(
        &self,
        account: &str,
        execution_id: Uuid,
        spent: u64,
    ) -> impl Future<Output = Result<(), CreditError>> + Send;
}

// ---------------------------------------------------------------------------
// Dynamic dispatch
// ---------------------------------------------------------------------------

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`CreditStore`] with boxed futures.
pub trait CreditStoreDyn: Send + Sync {
    fn balance_boxed<'a>(&'a self, account: &'a str) -> BoxFuture<'a, Result<u64, CreditError>>;

    fn hold_boxed<'a>(
        &'a self,
        account: &'a str,
        execution_id: Uuid,
        amount: u64,
    ) -> BoxFuture<'a, Result<bool, CreditError>>;

    fn settle_boxed<'a>(
        &'a self,
        account: &'a str,
        execution_id: Uuid,
        spent: u64,
    ) -> BoxFuture<'a, Result<(), CreditError>>;
}

impl<T: CreditStore> CreditStoreDyn for T {
    fn balance_boxed<'a>(&'a self, account: &'a str) -> BoxFuture<'a, Result<u64, CreditError>> {
        Box::pin(self.balance(account))
    }

    fn hold_boxed<'a>(
        &'a self,
        account: &'a str,
        execution_id: Uuid,
        amount: u64,
    ) -> BoxFuture<'a, Result<bool, CreditError>> {
        Box::pin(self.hold(account, execution_id, amount))
    }

    fn settle_boxed<'a>(
        &'a self,
        account: &'a str,
        execution_id: Uuid,
        spent: u64,
    ) -> BoxFuture<'a, Result<(), CreditError>> {
        Box::pin(self.settle(account, execution_id, spent))
    }
}

/// Type-erased credit store.
#[derive(Clone)]
pub struct BoxCreditStore {
    inner: Arc<dyn CreditStoreDyn + Send + Sync>,
}

impl BoxCreditStore {
    pub fn new<T: CreditStore + 'static>(store: T) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    pub async fn balance(&self, account: &str) -> Result<u64, CreditError> {
        self.inner.balance_boxed(account).await
    }

    pub async fn hold(&self, account: &str, execution_id: Uuid, amount: u64) -> Result<bool, CreditError> {
        self.inner.hold_boxed(account, execution_id, amount).await
    }

    pub async fn settle(&self, account: &str, execution_id: Uuid, spent: u64) -> Result<(), CreditError> {
        self.inner.settle_boxed(account, execution_id, spent).await
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Account {
    balance: u64,
    holds: BTreeMap<Uuid, u64>,
}

impl Account {
    fn available(&self) -> u64 {
        self.balance.saturating_sub(self.holds.values().sum())
    }
}

/// Process-local store, shareable via `Clone`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCreditStore {
    accounts: Arc<DashMap<String, Account>>,
}

impl InMemoryCreditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with one funded account.
    pub fn with_balance(account: &str, balance: u64) -> Self {
        let store = Self::new();
        store.deposit(account, balance);
        store
    }

    pub fn deposit(&self, account: &str, amount: u64) {
        let mut entry = self.accounts.entry(account.to_string()).or_default();
        entry.balance = entry.balance.saturating_add(amount);
    }

    /// Total balance including held credits.
    pub fn total_balance(&self, account: &str) -> u64 {
        self.accounts.get(account).map(|a| a.balance).unwrap_or(0)
    }

    pub fn held(&self, account: &str) -> u64 {
        self.accounts
            .get(account)
            .map(|a| a.holds.values().sum())
            .unwrap_or(0)
    }
}

impl CreditStore for InMemoryCreditStore {
    async fn balance(&self, account: &str) -> Result<u64, CreditError> {
        Ok(self.accounts.get(account).map(|a| a.available()).unwrap_or(0))
    }

    async fn hold(&self, account: &str, execution_id: Uuid, amount: u64) -> Result<bool, CreditError> {
        let mut entry = self.accounts.entry(account.to_string()).or_default();
        if entry.holds.contains_key(&execution_id) {
            return Err(CreditError::AlreadyOpen(execution_id));
        }
        if entry.available() < amount {
            return Ok(false);
        }
        entry.holds.insert(execution_id, amount);
        Ok(true)
    }

    async fn settle(&self, account: &str, execution_id: Uuid, spent: u64) -> Result<(), CreditError> {
        let mut entry = self
            .accounts
            .get_mut(account)
            .ok_or_else(|| CreditError::Store(format!("unknown account '{account}'")))?;
        entry
            .holds
            .remove(&execution_id)
            .ok_or(CreditError::LedgerNotFound(execution_id))?;
        entry.balance = entry.balance.saturating_sub(spent);
        Ok(())
    }
}
