//! Application layer: the transaction executor and the operations built on it.
//!
//! [`LedgerStore`] wraps a transactional backend. Every operation, from a
//! point lookup to a money transfer, runs as one backend transaction through
//! [`LedgerStore::exec_tx`].

pub mod store;
pub mod transfer;
pub mod user;

pub use store::LedgerStore;
