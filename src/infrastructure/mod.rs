//! Transactional backends implementing the storage ports.

pub mod in_memory;
#[cfg(feature = "storage-postgres")]
pub mod postgres;
