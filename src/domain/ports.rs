use super::account::{
    Account, AccountId, AddAccountBalanceParams, CreateAccountParams, ListAccountsParams,
    UpdateAccountParams,
};
use super::transfer::{
    CreateEntryParams, CreateTransferParams, Entry, EntryId, ListEntriesParams,
    ListTransfersParams, Transfer, TransferId,
};
use super::user::{CreateUserParams, UpdateUserParams, User};
use crate::error::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Parameterized reads and writes over the ledger tables, bound to one open
/// transaction.
#[async_trait]
pub trait LedgerQueries: Send + Sync {
    async fn create_user(&self, arg: CreateUserParams) -> Result<User>;
    async fn get_user(&self, username: &str) -> Result<User>;
    async fn update_user(&self, arg: UpdateUserParams) -> Result<User>;

    async fn create_account(&self, arg: CreateAccountParams) -> Result<Account>;
    async fn get_account(&self, id: AccountId) -> Result<Account>;
    /// Reads the account after taking an exclusive row lock that is held until
    /// the transaction ends.
    async fn get_account_for_update(&self, id: AccountId) -> Result<Account>;
    async fn list_accounts(&self, arg: ListAccountsParams) -> Result<Vec<Account>>;
    async fn update_account(&self, arg: UpdateAccountParams) -> Result<Account>;
    async fn add_account_balance(&self, arg: AddAccountBalanceParams) -> Result<Account>;
    async fn delete_account(&self, id: AccountId) -> Result<()>;

    async fn create_entry(&self, arg: CreateEntryParams) -> Result<Entry>;
    async fn get_entry(&self, id: EntryId) -> Result<Entry>;
    async fn list_entries(&self, arg: ListEntriesParams) -> Result<Vec<Entry>>;

    async fn create_transfer(&self, arg: CreateTransferParams) -> Result<Transfer>;
    async fn get_transfer(&self, id: TransferId) -> Result<Transfer>;
    async fn list_transfers(&self, arg: ListTransfersParams) -> Result<Vec<Transfer>>;
}

/// An open backend transaction.
///
/// Dropping it without calling `commit` discards its writes and releases its
/// locks.
pub trait LedgerTx: Send + Sync {
    fn queries(&self) -> &dyn LedgerQueries;
    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}

#[async_trait]
pub trait TxBackend: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>>;
}

pub type TxBackendRef = Arc<dyn TxBackend>;
