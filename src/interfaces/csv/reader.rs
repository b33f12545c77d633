use crate::domain::account::Currency;
use crate::error::{LedgerError, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::io::Read;
use std::marker::PhantomData;

/// Caller-side label for an account, as written in the input files.
pub type AccountLabel = u32;

/// One opening account: `account, owner, balance, currency`.
#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
pub struct AccountRecord {
    pub account: AccountLabel,
    pub owner: String,
    pub balance: i64,
    pub currency: Currency,
}

/// One requested transfer: `from, to, amount`. The amount is validated by the
/// caller, not here.
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
pub struct TransferRecord {
    pub from: AccountLabel,
    pub to: AccountLabel,
    pub amount: i64,
}

/// Reads typed records from a CSV source.
///
/// Wraps `csv::Reader` with whitespace trimming and flexible record lengths,
/// and yields records lazily so large inputs are streamed.
pub struct RecordReader<R: Read, T> {
    reader: csv::Reader<R>,
    _record: PhantomData<T>,
}

impl<R: Read, T: DeserializeOwned> RecordReader<R, T> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self {
            reader,
            _record: PhantomData,
        }
    }

    pub fn records(self) -> impl Iterator<Item = Result<T>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(LedgerError::from))
    }
}
