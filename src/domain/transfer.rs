use super::account::{Account, AccountId, Amount};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type EntryId = i64;
pub type TransferId = i64;

/// One signed line against a single account. Negative amounts are debits.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Entry {
    pub id: EntryId,
    pub account_id: AccountId,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// Record of a money movement between two accounts. Always paired with two
/// entries that sum to zero.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Transfer {
    pub id: TransferId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateEntryParams {
    pub account_id: AccountId,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListEntriesParams {
    pub account_id: AccountId,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateTransferParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: Amount,
}

/// Transfers whose source is `from_account_id` or whose destination is `to_account_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListTransfersParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}
