use crate::domain::account::{
    Account, AccountId, AddAccountBalanceParams, CreateAccountParams, ListAccountsParams,
    UpdateAccountParams,
};
use crate::domain::ports::{LedgerQueries, LedgerTx, TxBackend};
use crate::domain::transfer::{
    CreateEntryParams, CreateTransferParams, Entry, EntryId, ListEntriesParams,
    ListTransfersParams, Transfer, TransferId,
};
use crate::domain::user::{CreateUserParams, UpdateUserParams, User};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::error::Elapsed;

pub const DEFAULT_LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Tables {
    users: BTreeMap<String, User>,
    accounts: BTreeMap<AccountId, Account>,
    entries: BTreeMap<EntryId, Entry>,
    transfers: BTreeMap<TransferId, Transfer>,
}

type LockMap<K> = Arc<StdMutex<HashMap<K, Arc<Mutex<()>>>>>;

/// One mutex per row key, created on first use.
///
/// An entry is dropped again as soon as nobody holds or waits for it, so the
/// table only grows with the number of rows currently in contention.
struct LockTable<K> {
    rows: LockMap<K>,
}

impl<K: Eq + Hash + Clone> LockTable<K> {
    fn new() -> Self {
        Self {
            rows: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    async fn acquire(&self, key: K, timeout: Duration) -> std::result::Result<RowGuard<K>, Elapsed> {
        let row = {
            let mut rows = self.rows.lock().unwrap_or_else(|p| p.into_inner());
            rows.entry(key.clone()).or_default().clone()
        };
        match tokio::time::timeout(timeout, row.lock_owned()).await {
            Ok(guard) => Ok(RowGuard {
                rows: self.rows.clone(),
                key,
                guard: Some(guard),
            }),
            Err(elapsed) => {
                prune(&self.rows, &key);
                Err(elapsed)
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// Removes `key` if the map holds the only reference to its mutex.
fn prune<K: Eq + Hash>(rows: &LockMap<K>, key: &K) {
    let mut rows = rows.lock().unwrap_or_else(|p| p.into_inner());
    if rows.get(key).is_some_and(|row| Arc::strong_count(row) == 1) {
        rows.remove(key);
    }
}

/// A held row lock. Releasing it prunes the lock table entry.
struct RowGuard<K: Eq + Hash> {
    rows: LockMap<K>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash> Drop for RowGuard<K> {
    fn drop(&mut self) {
        self.guard.take();
        prune(&self.rows, &self.key);
    }
}

struct Shared {
    tables: RwLock<Tables>,
    account_locks: LockTable<AccountId>,
    user_locks: LockTable<String>,
    next_account_id: AtomicI64,
    next_entry_id: AtomicI64,
    next_transfer_id: AtomicI64,
    lock_wait_timeout: Duration,
}

/// A transactional in-memory backend.
///
/// Committed rows live in shared tables behind a `RwLock`. Each transaction
/// buffers its writes and applies them on commit, so other transactions only
/// ever see committed state. Account and user rows are locked with per-row
/// tokio mutexes held by the transaction until commit or rollback; a waiter
/// gives up with `LockTimeout` after the configured lock-wait timeout.
///
/// Foreign keys are checked when a row is inserted and again at commit, so an
/// entry or transfer never survives the deletion of its account.
///
/// Ids come from sequences that are not rolled back, like a bigserial column.
#[derive(Clone)]
pub struct InMemoryBackend {
    shared: Arc<Shared>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    /// Creates a new, empty in-memory backend.
    pub fn new() -> Self {
        Self::with_lock_wait_timeout(DEFAULT_LOCK_WAIT_TIMEOUT)
    }

    pub fn with_lock_wait_timeout(lock_wait_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: RwLock::new(Tables::default()),
                account_locks: LockTable::new(),
                user_locks: LockTable::new(),
                next_account_id: AtomicI64::new(1),
                next_entry_id: AtomicI64::new(1),
                next_transfer_id: AtomicI64::new(1),
                lock_wait_timeout,
            }),
        }
    }

    /// Opens a transaction with its concrete type.
    pub fn begin_tx(&self) -> InMemoryTx {
        InMemoryTx {
            shared: self.shared.clone(),
            state: Mutex::new(TxState::default()),
        }
    }
}

#[async_trait]
impl TxBackend for InMemoryBackend {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        Ok(Box::new(self.begin_tx()))
    }
}

#[derive(Default)]
struct TxState {
    users: BTreeMap<String, User>,
    created_users: BTreeSet<String>,
    /// Row images written by this transaction, new or updated.
    accounts: BTreeMap<AccountId, Account>,
    created_accounts: BTreeSet<AccountId>,
    deleted_accounts: BTreeSet<AccountId>,
    entries: BTreeMap<EntryId, Entry>,
    transfers: BTreeMap<TransferId, Transfer>,
    locks: HashMap<AccountId, RowGuard<AccountId>>,
    user_locks: HashMap<String, RowGuard<String>>,
}

impl TxState {
    fn visible_account(&self, tables: &Tables, id: AccountId) -> Option<Account> {
        if self.deleted_accounts.contains(&id) {
            return None;
        }
        self.accounts
            .get(&id)
            .or_else(|| tables.accounts.get(&id))
            .cloned()
    }

    fn visible_user(&self, tables: &Tables, username: &str) -> Option<User> {
        self.users
            .get(username)
            .or_else(|| tables.users.get(username))
            .cloned()
    }

    fn email_taken(&self, tables: &Tables, email: &str, except: &str) -> bool {
        self.users
            .values()
            .chain(tables.users.values())
            .any(|u| u.email == email && u.username != except)
    }

    fn account_is_referenced(&self, tables: &Tables, id: AccountId) -> bool {
        self.entries
            .values()
            .chain(tables.entries.values())
            .any(|e| e.account_id == id)
            || self
                .transfers
                .values()
                .chain(tables.transfers.values())
                .any(|t| t.from_account_id == id || t.to_account_id == id)
    }

    /// Accounts referenced by the entries and transfers this transaction wrote.
    fn referenced_accounts(&self) -> BTreeSet<AccountId> {
        self.entries
            .values()
            .map(|e| e.account_id)
            .chain(
                self.transfers
                    .values()
                    .flat_map(|t| [t.from_account_id, t.to_account_id]),
            )
            .collect()
    }
}

/// A transaction against an [`InMemoryBackend`].
pub struct InMemoryTx {
    shared: Arc<Shared>,
    state: Mutex<TxState>,
}

impl InMemoryTx {
    /// Takes the row lock on `id` unless this transaction already holds it.
    async fn lock_row(&self, id: AccountId) -> Result<()> {
        if self.state.lock().await.locks.contains_key(&id) {
            return Ok(());
        }

        let guard = self
            .shared
            .account_locks
            .acquire(id, self.shared.lock_wait_timeout)
            .await
            .map_err(|_| {
                tracing::warn!(account_id = id, "row lock wait timed out");
                LedgerError::LockTimeout(format!("account {id}"))
            })?;

        self.state.lock().await.locks.insert(id, guard);
        Ok(())
    }

    async fn lock_user(&self, username: &str) -> Result<()> {
        if self.state.lock().await.user_locks.contains_key(username) {
            return Ok(());
        }

        let guard = self
            .shared
            .user_locks
            .acquire(username.to_string(), self.shared.lock_wait_timeout)
            .await
            .map_err(|_| {
                tracing::warn!(username, "user lock wait timed out");
                LedgerError::LockTimeout(format!("user {username}"))
            })?;

        self.state
            .lock()
            .await
            .user_locks
            .insert(username.to_string(), guard);
        Ok(())
    }

    /// Locks the row and applies `f` to its current image.
    async fn modify_account<F>(&self, id: AccountId, f: F) -> Result<Account>
    where
        F: FnOnce(&mut Account) + Send,
    {
        self.lock_row(id).await?;

        let tables = self.shared.tables.read().await;
        let mut state = self.state.lock().await;
        let mut account = state
            .visible_account(&tables, id)
            .ok_or_else(|| LedgerError::not_found("account", id))?;
        f(&mut account);
        state.accounts.insert(id, account.clone());
        Ok(account)
    }

    async fn apply(self) -> Result<()> {
        let state = self.state.into_inner();
        let mut tables = self.shared.tables.write().await;

        for username in &state.created_users {
            if tables.users.contains_key(username) {
                return Err(LedgerError::ConstraintViolation(format!(
                    "username {username} already exists"
                )));
            }
        }
        for user in state.users.values() {
            let conflict = tables.users.values().any(|u| {
                u.email == user.email && u.username != user.username
            });
            if conflict {
                return Err(LedgerError::ConstraintViolation(format!(
                    "email {} already in use",
                    user.email
                )));
            }
        }
        for id in state.referenced_accounts() {
            if !tables.accounts.contains_key(&id) && !state.accounts.contains_key(&id) {
                return Err(LedgerError::not_found("account", id));
            }
        }
        for id in &state.deleted_accounts {
            let referenced = tables.entries.values().any(|e| e.account_id == *id)
                || tables
                    .transfers
                    .values()
                    .any(|t| t.from_account_id == *id || t.to_account_id == *id);
            if referenced {
                return Err(LedgerError::ConstraintViolation(format!(
                    "account {id} is still referenced by ledger rows"
                )));
            }
        }
        for id in &state.created_accounts {
            if let Some(account) = state.accounts.get(id) {
                let duplicate = tables.accounts.values().any(|a| {
                    a.owner == account.owner && a.currency == account.currency
                });
                if duplicate {
                    return Err(LedgerError::ConstraintViolation(format!(
                        "owner {} already has a {} account",
                        account.owner, account.currency
                    )));
                }
            }
        }

        tables.users.extend(state.users);
        for id in &state.deleted_accounts {
            tables.accounts.remove(id);
        }
        tables.accounts.extend(state.accounts);
        tables.entries.extend(state.entries);
        tables.transfers.extend(state.transfers);

        // Row locks are released here, after the tables reflect the commit.
        drop(tables);
        drop(state.locks);
        drop(state.user_locks);
        Ok(())
    }
}

impl LedgerTx for InMemoryTx {
    fn queries(&self) -> &dyn LedgerQueries {
        self
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move { (*self).apply().await })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            drop(self);
            Ok(())
        })
    }
}

#[async_trait]
impl LedgerQueries for InMemoryTx {
    async fn create_user(&self, arg: CreateUserParams) -> Result<User> {
        let tables = self.shared.tables.read().await;
        let mut state = self.state.lock().await;

        if state.visible_user(&tables, &arg.username).is_some() {
            return Err(LedgerError::ConstraintViolation(format!(
                "username {} already exists",
                arg.username
            )));
        }
        if state.email_taken(&tables, &arg.email, &arg.username) {
            return Err(LedgerError::ConstraintViolation(format!(
                "email {} already in use",
                arg.email
            )));
        }

        let user = User {
            username: arg.username,
            hashed_password: arg.hashed_password,
            full_name: arg.full_name,
            email: arg.email,
            password_changed_at: None,
            created_at: Utc::now(),
        };
        state.created_users.insert(user.username.clone());
        state.users.insert(user.username.clone(), user.clone());
        Ok(user)
    }

    async fn get_user(&self, username: &str) -> Result<User> {
        let tables = self.shared.tables.read().await;
        let state = self.state.lock().await;
        state
            .visible_user(&tables, username)
            .ok_or_else(|| LedgerError::not_found("user", username))
    }

    async fn update_user(&self, arg: UpdateUserParams) -> Result<User> {
        self.lock_user(&arg.username).await?;

        let tables = self.shared.tables.read().await;
        let mut state = self.state.lock().await;

        let mut user = state
            .visible_user(&tables, &arg.username)
            .ok_or_else(|| LedgerError::not_found("user", &arg.username))?;
        if let Some(email) = arg.email {
            if state.email_taken(&tables, &email, &user.username) {
                return Err(LedgerError::ConstraintViolation(format!(
                    "email {email} already in use"
                )));
            }
            user.email = email;
        }
        if let Some(full_name) = arg.full_name {
            user.full_name = full_name;
        }
        if let Some(hashed_password) = arg.hashed_password {
            user.hashed_password = hashed_password;
            user.password_changed_at = Some(Utc::now());
        }

        state.users.insert(user.username.clone(), user.clone());
        Ok(user)
    }

    async fn create_account(&self, arg: CreateAccountParams) -> Result<Account> {
        let tables = self.shared.tables.read().await;
        let mut state = self.state.lock().await;

        if state.visible_user(&tables, &arg.owner).is_none() {
            return Err(LedgerError::ConstraintViolation(format!(
                "owner {} does not exist",
                arg.owner
            )));
        }
        let duplicate = state
            .accounts
            .values()
            .chain(tables.accounts.values())
            .filter(|a| !state.deleted_accounts.contains(&a.id))
            .any(|a| a.owner == arg.owner && a.currency == arg.currency);
        if duplicate {
            return Err(LedgerError::ConstraintViolation(format!(
                "owner {} already has a {} account",
                arg.owner, arg.currency
            )));
        }

        let account = Account {
            id: self.shared.next_account_id.fetch_add(1, Ordering::SeqCst),
            owner: arg.owner,
            balance: arg.balance,
            currency: arg.currency,
            created_at: Utc::now(),
        };
        state.created_accounts.insert(account.id);
        state.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&self, id: AccountId) -> Result<Account> {
        let tables = self.shared.tables.read().await;
        let state = self.state.lock().await;
        state
            .visible_account(&tables, id)
            .ok_or_else(|| LedgerError::not_found("account", id))
    }

    async fn get_account_for_update(&self, id: AccountId) -> Result<Account> {
        self.lock_row(id).await?;
        self.get_account(id).await
    }

    async fn list_accounts(&self, arg: ListAccountsParams) -> Result<Vec<Account>> {
        let tables = self.shared.tables.read().await;
        let state = self.state.lock().await;

        let mut merged: BTreeMap<AccountId, &Account> =
            tables.accounts.iter().map(|(k, v)| (*k, v)).collect();
        merged.extend(state.accounts.iter().map(|(k, v)| (*k, v)));

        Ok(merged
            .into_values()
            .filter(|a| !state.deleted_accounts.contains(&a.id))
            .filter(|a| arg.owner.as_ref().is_none_or(|owner| &a.owner == owner))
            .skip(arg.offset)
            .take(arg.limit)
            .cloned()
            .collect())
    }

    async fn update_account(&self, arg: UpdateAccountParams) -> Result<Account> {
        self.modify_account(arg.id, |account| account.balance = arg.balance)
            .await
    }

    async fn add_account_balance(&self, arg: AddAccountBalanceParams) -> Result<Account> {
        self.modify_account(arg.id, |account| account.balance += arg.amount)
            .await
    }

    async fn delete_account(&self, id: AccountId) -> Result<()> {
        self.lock_row(id).await?;

        let tables = self.shared.tables.read().await;
        let mut state = self.state.lock().await;
        if state.visible_account(&tables, id).is_none() {
            return Err(LedgerError::not_found("account", id));
        }
        if state.account_is_referenced(&tables, id) {
            return Err(LedgerError::ConstraintViolation(format!(
                "account {id} is still referenced by ledger rows"
            )));
        }

        state.accounts.remove(&id);
        state.created_accounts.remove(&id);
        state.deleted_accounts.insert(id);
        Ok(())
    }

    async fn create_entry(&self, arg: CreateEntryParams) -> Result<Entry> {
        let tables = self.shared.tables.read().await;
        let mut state = self.state.lock().await;

        if state.visible_account(&tables, arg.account_id).is_none() {
            return Err(LedgerError::not_found("account", arg.account_id));
        }

        let entry = Entry {
            id: self.shared.next_entry_id.fetch_add(1, Ordering::SeqCst),
            account_id: arg.account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        state.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn get_entry(&self, id: EntryId) -> Result<Entry> {
        let tables = self.shared.tables.read().await;
        let state = self.state.lock().await;
        state
            .entries
            .get(&id)
            .or_else(|| tables.entries.get(&id))
            .cloned()
            .ok_or_else(|| LedgerError::not_found("entry", id))
    }

    async fn list_entries(&self, arg: ListEntriesParams) -> Result<Vec<Entry>> {
        let tables = self.shared.tables.read().await;
        let state = self.state.lock().await;

        let mut merged: BTreeMap<EntryId, &Entry> =
            tables.entries.iter().map(|(k, v)| (*k, v)).collect();
        merged.extend(state.entries.iter().map(|(k, v)| (*k, v)));

        Ok(merged
            .into_values()
            .filter(|e| e.account_id == arg.account_id)
            .skip(arg.offset)
            .take(arg.limit)
            .cloned()
            .collect())
    }

    async fn create_transfer(&self, arg: CreateTransferParams) -> Result<Transfer> {
        let tables = self.shared.tables.read().await;
        let mut state = self.state.lock().await;

        for id in [arg.from_account_id, arg.to_account_id] {
            if state.visible_account(&tables, id).is_none() {
                return Err(LedgerError::not_found("account", id));
            }
        }

        let transfer = Transfer {
            id: self.shared.next_transfer_id.fetch_add(1, Ordering::SeqCst),
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount.value(),
            created_at: Utc::now(),
        };
        state.transfers.insert(transfer.id, transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&self, id: TransferId) -> Result<Transfer> {
        let tables = self.shared.tables.read().await;
        let state = self.state.lock().await;
        state
            .transfers
            .get(&id)
            .or_else(|| tables.transfers.get(&id))
            .cloned()
            .ok_or_else(|| LedgerError::not_found("transfer", id))
    }

    async fn list_transfers(&self, arg: ListTransfersParams) -> Result<Vec<Transfer>> {
        let tables = self.shared.tables.read().await;
        let state = self.state.lock().await;

        let mut merged: BTreeMap<TransferId, &Transfer> =
            tables.transfers.iter().map(|(k, v)| (*k, v)).collect();
        merged.extend(state.transfers.iter().map(|(k, v)| (*k, v)));

        Ok(merged
            .into_values()
            .filter(|t| {
                t.from_account_id == arg.from_account_id || t.to_account_id == arg.to_account_id
            })
            .skip(arg.offset)
            .take(arg.limit)
            .cloned()
            .collect())
    }
}
