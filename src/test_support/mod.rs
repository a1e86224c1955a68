//! Test doubles shared by unit and integration tests.

mod database;
mod memory;
mod provider;

pub use database::{TestDatabase, TestDatabaseError};
pub use memory::{MemoryConnection, MemoryConnector};
pub use provider::{HistoryCall, ScriptedProvider, group, text_message, user};
