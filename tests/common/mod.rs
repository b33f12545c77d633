#![allow(dead_code)]

use async_trait::async_trait;
use futures::future::BoxFuture;
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use txledger::application::LedgerStore;
use txledger::context::TxContext;
use txledger::domain::account::{
    Account, AccountId, AddAccountBalanceParams, CreateAccountParams, Currency,
    ListAccountsParams, UpdateAccountParams,
};
use txledger::domain::ports::{LedgerQueries, LedgerTx, TxBackend};
use txledger::domain::transfer::{
    CreateEntryParams, CreateTransferParams, Entry, EntryId, ListEntriesParams,
    ListTransfersParams, Transfer, TransferId,
};
use txledger::domain::user::{CreateUserParams, UpdateUserParams, User};
use txledger::error::{LedgerError, Result};
use txledger::infrastructure::in_memory::{InMemoryBackend, InMemoryTx};

pub fn random_owner() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("owner_{}", suffix.to_lowercase())
}

pub fn random_money() -> i64 {
    rand::thread_rng().gen_range(100..=1000)
}

pub fn memory_store() -> (InMemoryBackend, LedgerStore) {
    let backend = InMemoryBackend::new();
    let store = LedgerStore::new(Arc::new(backend.clone()));
    (backend, store)
}

pub async fn create_random_user(store: &LedgerStore) -> User {
    let username = random_owner();
    store
        .create_user(
            &TxContext::background(),
            CreateUserParams {
                username: username.clone(),
                hashed_password: "hash".to_string(),
                full_name: username.clone(),
                email: format!("{username}@example.com"),
            },
        )
        .await
        .unwrap()
}

/// Creates a USD account with the given balance for a fresh random owner.
pub async fn create_account(store: &LedgerStore, balance: i64) -> Account {
    let user = create_random_user(store).await;
    store
        .create_account(
            &TxContext::background(),
            CreateAccountParams {
                owner: user.username,
                balance,
                currency: Currency::USD,
            },
        )
        .await
        .unwrap()
}

pub async fn balance_of(store: &LedgerStore, id: AccountId) -> i64 {
    store
        .get_account(&TxContext::background(), id)
        .await
        .unwrap()
        .balance
}

/// The step of a transfer at which a [`FaultyBackend`] transaction fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    Nothing,
    CreateTransfer,
    DebitEntry,
    CreditEntry,
    BalanceUpdate,
    /// Fails after the first account's balance has already been changed.
    SecondBalanceUpdate,
}

/// Wraps the in-memory backend and injects storage failures.
#[derive(Clone)]
pub struct FaultyBackend {
    inner: InMemoryBackend,
    fail_at: FailAt,
    fail_rollback: bool,
}

impl FaultyBackend {
    pub fn new(inner: InMemoryBackend, fail_at: FailAt) -> Self {
        Self {
            inner,
            fail_at,
            fail_rollback: false,
        }
    }

    pub fn failing_rollback(mut self) -> Self {
        self.fail_rollback = true;
        self
    }
}

#[async_trait]
impl TxBackend for FaultyBackend {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        Ok(Box::new(FaultyTx {
            inner: self.inner.begin_tx(),
            fail_at: self.fail_at,
            fail_rollback: self.fail_rollback,
            balance_updates: AtomicUsize::new(0),
        }))
    }
}

pub struct FaultyTx {
    inner: InMemoryTx,
    fail_at: FailAt,
    fail_rollback: bool,
    balance_updates: AtomicUsize,
}

impl FaultyTx {
    fn check(&self, step: FailAt) -> Result<()> {
        if self.fail_at == step {
            return Err(LedgerError::Storage(format!("injected failure at {step:?}")));
        }
        Ok(())
    }
}

impl LedgerTx for FaultyTx {
    fn queries(&self) -> &dyn LedgerQueries {
        self
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        let this = *self;
        Box::new(this.inner).commit()
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        let this = *self;
        let fail = this.fail_rollback;
        let rollback = Box::new(this.inner).rollback();
        Box::pin(async move {
            rollback.await?;
            if fail {
                return Err(LedgerError::ConnectionFailure(
                    "connection reset during rollback".to_string(),
                ));
            }
            Ok(())
        })
    }
}

#[async_trait]
impl LedgerQueries for FaultyTx {
    async fn create_user(&self, arg: CreateUserParams) -> Result<User> {
        self.inner.create_user(arg).await
    }

    async fn get_user(&self, username: &str) -> Result<User> {
        self.inner.get_user(username).await
    }

    async fn update_user(&self, arg: UpdateUserParams) -> Result<User> {
        self.inner.update_user(arg).await
    }

    async fn create_account(&self, arg: CreateAccountParams) -> Result<Account> {
        self.inner.create_account(arg).await
    }

    async fn get_account(&self, id: AccountId) -> Result<Account> {
        self.inner.get_account(id).await
    }

    async fn get_account_for_update(&self, id: AccountId) -> Result<Account> {
        self.inner.get_account_for_update(id).await
    }

    async fn list_accounts(&self, arg: ListAccountsParams) -> Result<Vec<Account>> {
        self.inner.list_accounts(arg).await
    }

    async fn update_account(&self, arg: UpdateAccountParams) -> Result<Account> {
        self.inner.update_account(arg).await
    }

    async fn add_account_balance(&self, arg: AddAccountBalanceParams) -> Result<Account> {
        let call = self.balance_updates.fetch_add(1, Ordering::SeqCst) + 1;
        match call {
            1 => self.check(FailAt::BalanceUpdate)?,
            _ => self.check(FailAt::SecondBalanceUpdate)?,
        }
        self.inner.add_account_balance(arg).await
    }

    async fn delete_account(&self, id: AccountId) -> Result<()> {
        self.inner.delete_account(id).await
    }

    async fn create_entry(&self, arg: CreateEntryParams) -> Result<Entry> {
        if arg.amount < 0 {
            self.check(FailAt::DebitEntry)?;
        } else {
            self.check(FailAt::CreditEntry)?;
        }
        self.inner.create_entry(arg).await
    }

    async fn get_entry(&self, id: EntryId) -> Result<Entry> {
        self.inner.get_entry(id).await
    }

    async fn list_entries(&self, arg: ListEntriesParams) -> Result<Vec<Entry>> {
        self.inner.list_entries(arg).await
    }

    async fn create_transfer(&self, arg: CreateTransferParams) -> Result<Transfer> {
        self.check(FailAt::CreateTransfer)?;
        self.inner.create_transfer(arg).await
    }

    async fn get_transfer(&self, id: TransferId) -> Result<Transfer> {
        self.inner.get_transfer(id).await
    }

    async fn list_transfers(&self, arg: ListTransfersParams) -> Result<Vec<Transfer>> {
        self.inner.list_transfers(arg).await
    }
}
