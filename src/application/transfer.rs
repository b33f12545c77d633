use super::store::LedgerStore;
use crate::context::TxContext;
use crate::domain::account::{Account, AccountId, AddAccountBalanceParams};
use crate::domain::ports::LedgerQueries;
use crate::domain::transfer::{
    CreateEntryParams, CreateTransferParams, TransferTxParams, TransferTxResult,
};
use crate::error::Result;

/// The order in which two account rows are locked.
///
/// Every path that touches two accounts goes through this type, so any two
/// transactions on the same pair request the row locks lowest id first and
/// can never wait on each other in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOrder {
    pub first: AccountId,
    pub second: AccountId,
    /// True when `first` is the second argument given to [`LockOrder::of`].
    pub swapped: bool,
}

impl LockOrder {
    pub fn of(a: AccountId, b: AccountId) -> Self {
        if a <= b {
            Self {
                first: a,
                second: b,
                swapped: false,
            }
        } else {
            Self {
                first: b,
                second: a,
                swapped: true,
            }
        }
    }
}

/// Applies `delta_a` to account `a` and `delta_b` to account `b`, locking the
/// rows in [`LockOrder`]. Returns the updated rows as `(a, b)`.
pub async fn add_money(
    q: &dyn LedgerQueries,
    a: AccountId,
    delta_a: i64,
    b: AccountId,
    delta_b: i64,
) -> Result<(Account, Account)> {
    let order = LockOrder::of(a, b);
    let (first_delta, second_delta) = if order.swapped {
        (delta_b, delta_a)
    } else {
        (delta_a, delta_b)
    };

    let first = lock_and_add(q, order.first, first_delta).await?;
    let second = lock_and_add(q, order.second, second_delta).await?;

    if order.swapped {
        Ok((second, first))
    } else {
        Ok((first, second))
    }
}

async fn lock_and_add(q: &dyn LedgerQueries, id: AccountId, amount: i64) -> Result<Account> {
    q.get_account_for_update(id).await?;
    q.add_account_balance(AddAccountBalanceParams { id, amount })
        .await
}

impl LedgerStore {
    /// Moves `amount` from one account to another in a single transaction.
    ///
    /// Creates the transfer record and its two entries, then updates both
    /// balances. Callers are expected to have rejected self-transfers and
    /// checked ownership and currencies. No retries happen here: each call
    /// records a new transfer.
    pub async fn transfer_tx(
        &self,
        ctx: &TxContext,
        arg: TransferTxParams,
    ) -> Result<TransferTxResult> {
        let result = self
            .exec_tx(ctx, move |q| {
                Box::pin(async move {
                    let amount = arg.amount.value();

                    let transfer = q
                        .create_transfer(CreateTransferParams {
                            from_account_id: arg.from_account_id,
                            to_account_id: arg.to_account_id,
                            amount: arg.amount,
                        })
                        .await?;

                    let from_entry = q
                        .create_entry(CreateEntryParams {
                            account_id: arg.from_account_id,
                            amount: -amount,
                        })
                        .await?;

                    let to_entry = q
                        .create_entry(CreateEntryParams {
                            account_id: arg.to_account_id,
                            amount,
                        })
                        .await?;

                    let (from_account, to_account) = add_money(
                        q,
                        arg.from_account_id,
                        -amount,
                        arg.to_account_id,
                        amount,
                    )
                    .await?;

                    Ok(TransferTxResult {
                        transfer,
                        from_account,
                        to_account,
                        from_entry,
                        to_entry,
                    })
                })
            })
            .await?;

        tracing::info!(
            transfer_id = result.transfer.id,
            from = arg.from_account_id,
            to = arg.to_account_id,
            amount = arg.amount.value(),
            "transfer committed"
        );
        Ok(result)
    }
}
