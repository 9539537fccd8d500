#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod entities;
pub mod identity;
pub mod memory_store;
pub mod schedule;
pub mod sqlite_store;
pub mod store_trait;

pub use entities::*;
pub use memory_store::InMemoryStateStore;
pub use sqlite_store::SqliteStateStore;
pub use store_trait::{MergedMessage, StateStore, StoreError, StoreResult};
