//! Relational store access for the crawl pipeline.
//!
//! The crawl never talks to a driver directly. It goes through three pieces
//! that together make concurrent get-or-create safe:
//!
//! - **`pool`**: fixed-capacity set of lazily connected store handles,
//!   checked out and back in by index. Checkout never blocks; an exhausted
//!   pool is reported to the caller, who decides whether to retry.
//!
//! - **`locks`**: per-entity lock table keyed by `(kind, remote id)`. Locks
//!   are created on first access and torn down once at shutdown.
//!
//! - **`upsert`**: the get-or-create protocol shared by chats, users and
//!   messages (lookup without lock, then lock, transaction, re-check, insert).
//!
//! The driver boundary itself is the pair of traits below. `postgres`
//! implements them on top of `sqlx::PgConnection`; `test_support` implements
//! them in memory.

pub mod locks;
pub mod migration;
pub mod pool;
pub mod postgres;
pub mod upsert;

use crate::models::{ChatMeta, Message, UserMeta};
use std::fmt;
use std::future::Future;
use thiserror::Error;

pub use locks::{EntityGuard, EntityKey, EntityKind, EntityLock, EntityLocks};
pub use migration::run_migrations;
pub use pool::{CheckoutError, ConnectionPool, PooledConnection};
pub use postgres::{PgConnector, PgStoreConnection};
pub use upsert::{ChatRecord, MessageRecord, Record, Upsert, UpsertError, UserRecord, get_or_create};

/// Primary key of a stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowId(pub i64);

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised by a store connection.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("duplicate {0} row")]
    Duplicate(&'static str),
    #[error("store is closed")]
    Closed,
}

impl StoreError {
    /// A unique constraint rejected the write; another writer got there first.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::Duplicate(_))
    }
}

/// Lowest and highest remote message id stored for one chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageBounds {
    pub min: i64,
    pub max: i64,
}

/// Opens new store connections with fixed credentials.
pub trait Connector: Send + Sync + 'static {
    type Connection: StoreConnection;

    fn connect(&self) -> impl Future<Output = Result<Self::Connection, StoreError>> + Send;
}

/// One open store connection.
///
/// Transactions are explicit: `begin`, then any number of row operations,
/// then `commit` or `rollback`. Row operations outside a transaction run in
/// autocommit mode.
pub trait StoreConnection: Send + 'static {
    /// `false` once the underlying connection stopped answering.
    fn ping(&mut self) -> impl Future<Output = bool> + Send;

    fn begin(&mut self) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn commit(&mut self) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn rollback(&mut self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// `true` between a successful `begin` and the matching `commit` or
    /// `rollback`.
    fn in_transaction(&self) -> bool;

    fn close(self) -> impl Future<Output = ()> + Send;

    fn find_chat(
        &mut self,
        remote_chat_id: i64,
    ) -> impl Future<Output = Result<Option<RowId>, StoreError>> + Send;

    fn insert_chat(
        &mut self,
        chat: &ChatMeta,
    ) -> impl Future<Output = Result<RowId, StoreError>> + Send;

    fn find_user(
        &mut self,
        remote_user_id: i64,
    ) -> impl Future<Output = Result<Option<RowId>, StoreError>> + Send;

    fn insert_user(
        &mut self,
        user: &UserMeta,
    ) -> impl Future<Output = Result<RowId, StoreError>> + Send;

    fn find_message(
        &mut self,
        chat: RowId,
        remote_message_id: i64,
    ) -> impl Future<Output = Result<Option<RowId>, StoreError>> + Send;

    /// Inserts the message row together with its content and forward rows.
    fn insert_message(
        &mut self,
        chat: RowId,
        sender: RowId,
        message: &Message,
    ) -> impl Future<Output = Result<RowId, StoreError>> + Send;

    /// `None` when nothing is stored for the chat yet.
    fn message_bounds(
        &mut self,
        remote_chat_id: i64,
    ) -> impl Future<Output = Result<Option<MessageBounds>, StoreError>> + Send;
}
