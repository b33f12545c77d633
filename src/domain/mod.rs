//! Ledger entities, their query parameters and the storage ports.

pub mod account;
pub mod ports;
pub mod transfer;
pub mod user;
