use crate::context::TxContext;
use crate::domain::account::{
    Account, AccountId, CreateAccountParams, ListAccountsParams, UpdateAccountParams,
};
use crate::domain::ports::{LedgerQueries, TxBackendRef};
use crate::domain::transfer::{
    Entry, EntryId, ListEntriesParams, ListTransfersParams, Transfer, TransferId,
};
use crate::domain::user::{CreateUserParams, UpdateUserParams, User};
use crate::error::{LedgerError, Result};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::Instrument;

/// Entry point for every ledger operation.
///
/// `LedgerStore` owns a transactional backend and runs all work through
/// [`LedgerStore::exec_tx`]. It is cheap to clone and safe to share between
/// tasks; all mutual exclusion happens in the backend.
#[derive(Clone)]
pub struct LedgerStore {
    backend: TxBackendRef,
    tx_seq: Arc<AtomicU64>,
}

impl LedgerStore {
    pub fn new(backend: TxBackendRef) -> Self {
        Self {
            backend,
            tx_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Runs `work` inside one backend transaction.
    ///
    /// The handle passed to `work` is only valid for the duration of the call.
    /// On success the transaction commits; on failure it rolls back and the
    /// original error is returned, or a `RollbackFailure` carrying both errors
    /// if the rollback fails too. Cancelling `ctx` or passing its deadline
    /// abandons `work` and rolls back.
    pub async fn exec_tx<T, F>(&self, ctx: &TxContext, work: F) -> Result<T>
    where
        T: Send,
        F: for<'q> FnOnce(&'q dyn LedgerQueries) -> BoxFuture<'q, Result<T>> + Send,
    {
        let seq = self.tx_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let span = tracing::debug_span!("ledger_tx", tx = seq, label = ctx.label());
        self.run_tx(ctx, work).instrument(span).await
    }

    async fn run_tx<T, F>(&self, ctx: &TxContext, work: F) -> Result<T>
    where
        T: Send,
        F: for<'q> FnOnce(&'q dyn LedgerQueries) -> BoxFuture<'q, Result<T>> + Send,
    {
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let tx = self.backend.begin().await?;
        tracing::debug!("begin");

        let outcome = {
            let work = work(tx.queries());
            tokio::select! {
                biased;
                err = ctx.done() => Err(err),
                res = work => res,
            }
        };

        match outcome {
            Ok(value) => {
                tx.commit().await?;
                tracing::debug!("commit");
                Ok(value)
            }
            Err(tx_err) => match tx.rollback().await {
                Ok(()) => {
                    tracing::debug!(error = %tx_err, "rollback");
                    Err(tx_err)
                }
                Err(rb_err) => {
                    tracing::error!(error = %tx_err, rollback_error = %rb_err, "rollback failed");
                    Err(LedgerError::RollbackFailure {
                        tx_err: Box::new(tx_err),
                        rb_err: Box::new(rb_err),
                    })
                }
            },
        }
    }

    pub async fn create_user(&self, ctx: &TxContext, arg: CreateUserParams) -> Result<User> {
        self.exec_tx(ctx, move |q| q.create_user(arg)).await
    }

    pub async fn get_user(&self, ctx: &TxContext, username: &str) -> Result<User> {
        let username = username.to_string();
        self.exec_tx(ctx, move |q| {
            Box::pin(async move { q.get_user(&username).await })
        })
        .await
    }

    pub async fn update_user(&self, ctx: &TxContext, arg: UpdateUserParams) -> Result<User> {
        self.exec_tx(ctx, move |q| q.update_user(arg)).await
    }

    pub async fn create_account(
        &self,
        ctx: &TxContext,
        arg: CreateAccountParams,
    ) -> Result<Account> {
        self.exec_tx(ctx, move |q| q.create_account(arg)).await
    }

    pub async fn get_account(&self, ctx: &TxContext, id: AccountId) -> Result<Account> {
        self.exec_tx(ctx, move |q| q.get_account(id)).await
    }

    pub async fn list_accounts(
        &self,
        ctx: &TxContext,
        arg: ListAccountsParams,
    ) -> Result<Vec<Account>> {
        self.exec_tx(ctx, move |q| q.list_accounts(arg)).await
    }

    pub async fn update_account(
        &self,
        ctx: &TxContext,
        arg: UpdateAccountParams,
    ) -> Result<Account> {
        self.exec_tx(ctx, move |q| q.update_account(arg)).await
    }

    pub async fn delete_account(&self, ctx: &TxContext, id: AccountId) -> Result<()> {
        self.exec_tx(ctx, move |q| q.delete_account(id)).await
    }

    pub async fn get_entry(&self, ctx: &TxContext, id: EntryId) -> Result<Entry> {
        self.exec_tx(ctx, move |q| q.get_entry(id)).await
    }

    pub async fn list_entries(
        &self,
        ctx: &TxContext,
        arg: ListEntriesParams,
    ) -> Result<Vec<Entry>> {
        self.exec_tx(ctx, move |q| q.list_entries(arg)).await
    }

    pub async fn get_transfer(&self, ctx: &TxContext, id: TransferId) -> Result<Transfer> {
        self.exec_tx(ctx, move |q| q.get_transfer(id)).await
    }

    pub async fn list_transfers(
        &self,
        ctx: &TxContext,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>> {
        self.exec_tx(ctx, move |q| q.list_transfers(arg)).await
    }
}
