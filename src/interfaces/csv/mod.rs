//! CSV input and output for the command-line caller.

pub mod account_writer;
pub mod reader;

pub use account_writer::{AccountRow, AccountWriter};
pub use reader::{AccountRecord, RecordReader, TransferRecord};
