//! PostgreSQL backend.
//!
//! Row locks are real `SELECT ... FOR NO KEY UPDATE` locks, so they do not
//! conflict with the key-share locks taken by foreign keys when entries are
//! inserted. Each transaction sets `lock_timeout` locally; a wait that runs
//! out, or a deadlock found by the server, surfaces as `LockTimeout`.
//!
//! ## Error mapping
//!
//! | SQLx error | code | LedgerError |
//! |------------|------|-------------|
//! | Database | `23505`, `23514` | `ConstraintViolation` |
//! | Database | `23503` | `NotFound` on entry / transfer inserts, `ConstraintViolation` elsewhere |
//! | Database | `40P01`, `55P03` | `LockTimeout` |
//! | Database | `08xxx` | `ConnectionFailure` |
//! | Io, Tls, PoolTimedOut, PoolClosed, WorkerCrashed | | `ConnectionFailure` |
//! | anything else | | `Storage` |

use crate::domain::account::{
    Account, AccountId, AddAccountBalanceParams, CreateAccountParams, Currency,
    ListAccountsParams, UpdateAccountParams,
};
use crate::domain::ports::{LedgerQueries, LedgerTx, TxBackend};
use crate::domain::transfer::{
    CreateEntryParams, CreateTransferParams, Entry, EntryId, ListEntriesParams,
    ListTransfersParams, Transfer, TransferId,
};
use crate::domain::user::{CreateUserParams, UpdateUserParams, User};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use tokio::sync::Mutex;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        username            VARCHAR PRIMARY KEY,
        hashed_password     VARCHAR NOT NULL,
        full_name           VARCHAR NOT NULL,
        email               VARCHAR UNIQUE NOT NULL,
        password_changed_at TIMESTAMPTZ,
        created_at          TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS accounts (
        id         BIGSERIAL PRIMARY KEY,
        owner      VARCHAR NOT NULL REFERENCES users (username),
        balance    BIGINT NOT NULL,
        currency   VARCHAR NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (owner, currency)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS entries (
        id         BIGSERIAL PRIMARY KEY,
        account_id BIGINT NOT NULL REFERENCES accounts (id),
        amount     BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transfers (
        id              BIGSERIAL PRIMARY KEY,
        from_account_id BIGINT NOT NULL REFERENCES accounts (id),
        to_account_id   BIGINT NOT NULL REFERENCES accounts (id),
        amount          BIGINT NOT NULL CHECK (amount > 0),
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS entries_account_id_idx ON entries (account_id)",
    "CREATE INDEX IF NOT EXISTS transfers_from_to_idx ON transfers (from_account_id, to_account_id)",
];

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const USER_COLUMNS: &str =
    "username, hashed_password, full_name, email, password_changed_at, created_at";

/// Transactional backend on a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: PgPool,
    lock_wait_timeout: Duration,
}

impl PostgresBackend {
    pub fn new(pool: PgPool, lock_wait_timeout: Duration) -> Self {
        Self {
            pool,
            lock_wait_timeout,
        }
    }

    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        lock_wait_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, lock_wait_timeout))
    }

    /// Creates the ledger tables if they are missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl TxBackend for PostgresBackend {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_wait_timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;

        Ok(Box::new(PostgresTx { tx: Mutex::new(tx) }))
    }
}

pub struct PostgresTx {
    tx: Mutex<Transaction<'static, Postgres>>,
}

impl LedgerTx for PostgresTx {
    fn queries(&self) -> &dyn LedgerQueries {
        self
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        let this = *self;
        Box::pin(async move {
            this.tx
                .into_inner()
                .commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))
        })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        let this = *self;
        Box::pin(async move {
            this.tx
                .into_inner()
                .rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))
        })
    }
}

#[async_trait]
impl LedgerQueries for PostgresTx {
    async fn create_user(&self, arg: CreateUserParams) -> Result<User> {
        let mut tx = self.tx.lock().await;
        let row = sqlx::query(&format!(
            "INSERT INTO users (username, hashed_password, full_name, email) \
             VALUES ($1, $2, $3, $4) RETURNING {USER_COLUMNS}"
        ))
        .bind(&arg.username)
        .bind(&arg.hashed_password)
        .bind(&arg.full_name)
        .bind(&arg.email)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("create_user", e))?;
        row_to_user(&row)
    }

    async fn get_user(&self, username: &str) -> Result<User> {
        let mut tx = self.tx.lock().await;
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1 LIMIT 1"
        ))
        .bind(username)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("get_user", e))?;
        match row {
            Some(row) => row_to_user(&row),
            None => Err(LedgerError::not_found("user", username)),
        }
    }

    async fn update_user(&self, arg: UpdateUserParams) -> Result<User> {
        let mut tx = self.tx.lock().await;
        let row = sqlx::query(&format!(
            "UPDATE users SET \
               hashed_password = COALESCE($1, hashed_password), \
               password_changed_at = CASE WHEN $1 IS NULL THEN password_changed_at ELSE now() END, \
               full_name = COALESCE($2, full_name), \
               email = COALESCE($3, email) \
             WHERE username = $4 RETURNING {USER_COLUMNS}"
        ))
        .bind(&arg.hashed_password)
        .bind(&arg.full_name)
        .bind(&arg.email)
        .bind(&arg.username)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_user", e))?;
        match row {
            Some(row) => row_to_user(&row),
            None => Err(LedgerError::not_found("user", &arg.username)),
        }
    }

    async fn create_account(&self, arg: CreateAccountParams) -> Result<Account> {
        let mut tx = self.tx.lock().await;
        let row = sqlx::query(&format!(
            "INSERT INTO accounts (owner, balance, currency) \
             VALUES ($1, $2, $3) RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(&arg.owner)
        .bind(arg.balance)
        .bind(arg.currency.as_str())
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("create_account", e))?;
        row_to_account(&row)
    }

    async fn get_account(&self, id: AccountId) -> Result<Account> {
        let mut tx = self.tx.lock().await;
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 LIMIT 1"
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("get_account", e))?;
        optional_account(row, id)
    }

    async fn get_account_for_update(&self, id: AccountId) -> Result<Account> {
        let mut tx = self.tx.lock().await;
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 LIMIT 1 FOR NO KEY UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("get_account_for_update", e))?;
        optional_account(row, id)
    }

    async fn list_accounts(&self, arg: ListAccountsParams) -> Result<Vec<Account>> {
        let mut tx = self.tx.lock().await;
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts \
             WHERE $1::varchar IS NULL OR owner = $1 \
             ORDER BY id LIMIT $2 OFFSET $3"
        ))
        .bind(&arg.owner)
        .bind(arg.limit as i64)
        .bind(arg.offset as i64)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("list_accounts", e))?;
        rows.iter().map(row_to_account).collect()
    }

    async fn update_account(&self, arg: UpdateAccountParams) -> Result<Account> {
        let mut tx = self.tx.lock().await;
        let row = sqlx::query(&format!(
            "UPDATE accounts SET balance = $2 WHERE id = $1 RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(arg.id)
        .bind(arg.balance)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_account", e))?;
        optional_account(row, arg.id)
    }

    async fn add_account_balance(&self, arg: AddAccountBalanceParams) -> Result<Account> {
        let mut tx = self.tx.lock().await;
        let row = sqlx::query(&format!(
            "UPDATE accounts SET balance = balance + $2 WHERE id = $1 RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(arg.id)
        .bind(arg.amount)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("add_account_balance", e))?;
        optional_account(row, arg.id)
    }

    async fn delete_account(&self, id: AccountId) -> Result<()> {
        let mut tx = self.tx.lock().await;
        let result = sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("delete_account", e))?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::not_found("account", id));
        }
        Ok(())
    }

    async fn create_entry(&self, arg: CreateEntryParams) -> Result<Entry> {
        let mut tx = self.tx.lock().await;
        let row = sqlx::query(
            "INSERT INTO entries (account_id, amount) VALUES ($1, $2) \
             RETURNING id, account_id, amount, created_at",
        )
        .bind(arg.account_id)
        .bind(arg.amount)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_reference_error("create_entry", e, arg.account_id.to_string()))?;
        row_to_entry(&row)
    }

    async fn get_entry(&self, id: EntryId) -> Result<Entry> {
        let mut tx = self.tx.lock().await;
        let row = sqlx::query(
            "SELECT id, account_id, amount, created_at FROM entries WHERE id = $1 LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("get_entry", e))?;
        match row {
            Some(row) => row_to_entry(&row),
            None => Err(LedgerError::not_found("entry", id)),
        }
    }

    async fn list_entries(&self, arg: ListEntriesParams) -> Result<Vec<Entry>> {
        let mut tx = self.tx.lock().await;
        let rows = sqlx::query(
            "SELECT id, account_id, amount, created_at FROM entries \
             WHERE account_id = $1 ORDER BY id LIMIT $2 OFFSET $3",
        )
        .bind(arg.account_id)
        .bind(arg.limit as i64)
        .bind(arg.offset as i64)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("list_entries", e))?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn create_transfer(&self, arg: CreateTransferParams) -> Result<Transfer> {
        let mut tx = self.tx.lock().await;
        let row = sqlx::query(
            "INSERT INTO transfers (from_account_id, to_account_id, amount) VALUES ($1, $2, $3) \
             RETURNING id, from_account_id, to_account_id, amount, created_at",
        )
        .bind(arg.from_account_id)
        .bind(arg.to_account_id)
        .bind(arg.amount.value())
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| {
            let key = format!("{} or {}", arg.from_account_id, arg.to_account_id);
            map_reference_error("create_transfer", e, key)
        })?;
        row_to_transfer(&row)
    }

    async fn get_transfer(&self, id: TransferId) -> Result<Transfer> {
        let mut tx = self.tx.lock().await;
        let row = sqlx::query(
            "SELECT id, from_account_id, to_account_id, amount, created_at \
             FROM transfers WHERE id = $1 LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("get_transfer", e))?;
        match row {
            Some(row) => row_to_transfer(&row),
            None => Err(LedgerError::not_found("transfer", id)),
        }
    }

    async fn list_transfers(&self, arg: ListTransfersParams) -> Result<Vec<Transfer>> {
        let mut tx = self.tx.lock().await;
        let rows = sqlx::query(
            "SELECT id, from_account_id, to_account_id, amount, created_at FROM transfers \
             WHERE from_account_id = $1 OR to_account_id = $2 \
             ORDER BY id LIMIT $3 OFFSET $4",
        )
        .bind(arg.from_account_id)
        .bind(arg.to_account_id)
        .bind(arg.limit as i64)
        .bind(arg.offset as i64)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("list_transfers", e))?;
        rows.iter().map(row_to_transfer).collect()
    }
}

fn optional_account(row: Option<PgRow>, id: AccountId) -> Result<Account> {
    match row {
        Some(row) => row_to_account(&row),
        None => Err(LedgerError::not_found("account", id)),
    }
}

fn row_to_account(row: &PgRow) -> Result<Account> {
    let currency: String = row.try_get("currency").map_err(decode_error)?;
    Ok(Account {
        id: row.try_get("id").map_err(decode_error)?,
        owner: row.try_get("owner").map_err(decode_error)?,
        balance: row.try_get("balance").map_err(decode_error)?,
        currency: currency.parse::<Currency>()?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
    })
}

fn row_to_user(row: &PgRow) -> Result<User> {
    Ok(User {
        username: row.try_get("username").map_err(decode_error)?,
        hashed_password: row.try_get("hashed_password").map_err(decode_error)?,
        full_name: row.try_get("full_name").map_err(decode_error)?,
        email: row.try_get("email").map_err(decode_error)?,
        password_changed_at: row.try_get("password_changed_at").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
    })
}

fn row_to_entry(row: &PgRow) -> Result<Entry> {
    Ok(Entry {
        id: row.try_get("id").map_err(decode_error)?,
        account_id: row.try_get("account_id").map_err(decode_error)?,
        amount: row.try_get("amount").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
    })
}

fn row_to_transfer(row: &PgRow) -> Result<Transfer> {
    Ok(Transfer {
        id: row.try_get("id").map_err(decode_error)?,
        from_account_id: row.try_get("from_account_id").map_err(decode_error)?,
        to_account_id: row.try_get("to_account_id").map_err(decode_error)?,
        amount: row.try_get("amount").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
    })
}

fn decode_error(err: sqlx::Error) -> LedgerError {
    LedgerError::Storage(format!("failed to decode row: {err}"))
}

/// Like [`map_sqlx_error`], but a foreign-key violation means the referenced
/// account does not exist.
fn map_reference_error(operation: &str, err: sqlx::Error, key: String) -> LedgerError {
    if sqlstate(&err).as_deref() == Some("23503") {
        return LedgerError::NotFound {
            entity: "account",
            key,
        };
    }
    map_sqlx_error(operation, err)
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
        _ => None,
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("23514") | Some("23503") => {
                    LedgerError::ConstraintViolation(msg)
                }
                Some("40P01") | Some("55P03") => LedgerError::LockTimeout(msg),
                Some(code) if code.starts_with("08") => LedgerError::ConnectionFailure(msg),
                _ => LedgerError::Storage(msg),
            }
        }
        err @ (sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed) => {
            LedgerError::ConnectionFailure(format!("{operation}: {err}"))
        }
        other => LedgerError::Storage(format!("{operation}: {other}")),
    }
}
