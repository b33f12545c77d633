use super::reader::AccountLabel;
use crate::domain::account::{Account, Currency};
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

/// Final state of one account, keyed by the caller's label.
#[derive(Debug, Serialize, PartialEq, Eq, Clone)]
pub struct AccountRow {
    pub account: AccountLabel,
    pub owner: String,
    pub balance: i64,
    pub currency: Currency,
}

impl AccountRow {
    pub fn new(account: AccountLabel, row: Account) -> Self {
        Self {
            account,
            owner: row.owner,
            balance: row.balance,
            currency: row.currency,
        }
    }
}

/// Writes account rows as CSV with a header line.
pub struct AccountWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> AccountWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_accounts(&mut self, rows: impl IntoIterator<Item = AccountRow>) -> Result<()> {
        for row in rows {
            self.writer.serialize(row)?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_header_and_rows() {
        let mut out = Vec::new();
        {
            let mut writer = AccountWriter::new(&mut out);
            writer
                .write_accounts(vec![
                    AccountRow {
                        account: 1,
                        owner: "alice".to_string(),
                        balance: 700,
                        currency: Currency::USD,
                    },
                    AccountRow {
                        account: 2,
                        owner: "bob".to_string(),
                        balance: 800,
                        currency: Currency::USD,
                    },
                ])
                .unwrap();
        }

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "account,owner,balance,currency\n1,alice,700,USD\n2,bob,800,USD\n");
    }
}
