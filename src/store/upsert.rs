//! Get-or-create protocol shared by every archived entity.
//!
//! 1. Look the natural key up without any lock (the common case once a
//!    record exists).
//! 2. Otherwise take the entity's lock, open a transaction, look again and
//!    insert only if the row is still missing.
//! 3. Commit; on any failure roll back and report it.
//!
//! Callers for the same natural key converge on one row. A `Duplicate`
//! raised by the insert means a writer outside this process won the race;
//! the row is looked up once more after the rollback.

use super::{EntityKey, EntityLocks, RowId, StoreConnection, StoreError};
use crate::models::{ChatMeta, Message, UserMeta};
use std::future::Future;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("entity lock table is closed")]
    LocksClosed,
}

/// Result of a successful get-or-create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Found(RowId),
    Created(RowId),
}

impl Upsert {
    pub fn id(&self) -> RowId {
        match self {
            Upsert::Found(id) | Upsert::Created(id) => *id,
        }
    }

    pub fn created(&self) -> bool {
        matches!(self, Upsert::Created(_))
    }
}

/// One entity kind that can be looked up by natural key and inserted.
pub trait Record: Sync {
    /// Table-ish name used in logs.
    fn kind(&self) -> &'static str;

    /// Lock serializing creation of this record.
    fn lock_key(&self) -> EntityKey;

    fn find<C: StoreConnection>(
        &self,
        conn: &mut C,
    ) -> impl Future<Output = Result<Option<RowId>, StoreError>> + Send;

    fn insert<C: StoreConnection>(
        &self,
        conn: &mut C,
    ) -> impl Future<Output = Result<RowId, StoreError>> + Send;
}

pub struct ChatRecord<'a>(pub &'a ChatMeta);

impl Record for ChatRecord<'_> {
    fn kind(&self) -> &'static str {
        "chat"
    }

    fn lock_key(&self) -> EntityKey {
        EntityKey::chat(self.0.id)
    }

    async fn find<C: StoreConnection>(&self, conn: &mut C) -> Result<Option<RowId>, StoreError> {
        conn.find_chat(self.0.id).await
    }

    async fn insert<C: StoreConnection>(&self, conn: &mut C) -> Result<RowId, StoreError> {
        conn.insert_chat(self.0).await
    }
}

pub struct UserRecord<'a>(pub &'a UserMeta);

impl Record for UserRecord<'_> {
    fn kind(&self) -> &'static str {
        "user"
    }

    fn lock_key(&self) -> EntityKey {
        EntityKey::user(self.0.id)
    }

    async fn find<C: StoreConnection>(&self, conn: &mut C) -> Result<Option<RowId>, StoreError> {
        conn.find_user(self.0.id).await
    }

    async fn insert<C: StoreConnection>(&self, conn: &mut C) -> Result<RowId, StoreError> {
        conn.insert_user(self.0).await
    }
}

/// A message keyed on `(chat primary key, remote message id)`.
///
/// Messages lock on their chat rather than on themselves, which keeps the
/// lock table proportional to chats and users instead of messages.
pub struct MessageRecord<'a> {
    pub chat: RowId,
    pub sender: RowId,
    pub message: &'a Message,
}

impl Record for MessageRecord<'_> {
    fn kind(&self) -> &'static str {
        "message"
    }

    fn lock_key(&self) -> EntityKey {
        EntityKey::chat(self.message.chat_id)
    }

    async fn find<C: StoreConnection>(&self, conn: &mut C) -> Result<Option<RowId>, StoreError> {
        conn.find_message(self.chat, self.message.id).await
    }

    async fn insert<C: StoreConnection>(&self, conn: &mut C) -> Result<RowId, StoreError> {
        conn.insert_message(self.chat, self.sender, self.message).await
    }
}

pub async fn get_or_create<C, R>(
    conn: &mut C,
    locks: &EntityLocks,
    record: &R,
) -> Result<Upsert, UpsertError>
where
    C: StoreConnection,
    R: Record,
{
    if let Some(id) = record.find(conn).await? {
        return Ok(Upsert::Found(id));
    }

    let key = record.lock_key();
    let lock = locks.get(key).ok_or(UpsertError::LocksClosed)?;
    let _guard = lock.acquire().await;

    conn.begin().await?;

    let created = match find_or_insert(conn, record).await {
        Ok(outcome) => outcome,
        Err(e) => {
            rollback(conn, record.kind()).await;
            if e.is_duplicate() {
                log::debug!("{} {}: lost insert race, re-checking", record.kind(), key);
                if let Some(id) = record.find(conn).await? {
                    return Ok(Upsert::Found(id));
                }
            }
            log::error!("{} {}: get-or-create failed: {}", record.kind(), key, e);
            return Err(e.into());
        }
    };

    if let Err(e) = conn.commit().await {
        log::error!("{} {}: commit failed: {}", record.kind(), key, e);
        rollback(conn, record.kind()).await;
        return Err(e.into());
    }

    Ok(created)
}

async fn find_or_insert<C, R>(conn: &mut C, record: &R) -> Result<Upsert, StoreError>
where
    C: StoreConnection,
    R: Record,
{
    if let Some(id) = record.find(conn).await? {
        return Ok(Upsert::Found(id));
    }
    let id = record.insert(conn).await?;
    Ok(Upsert::Created(id))
}

async fn rollback<C: StoreConnection>(conn: &mut C, kind: &str) {
    if let Err(e) = conn.rollback().await {
        log::error!("{}: rollback failed: {}", kind, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatKind;
    use crate::store::Connector;
    use crate::test_support::MemoryConnector;

    fn group(id: i64) -> ChatMeta {
        ChatMeta {
            id,
            title: format!("group {id}"),
            kind: ChatKind::Supergroup,
        }
    }

    #[tokio::test]
    async fn test_second_call_takes_fast_path() {
        let connector = MemoryConnector::new();
        let mut conn = connector.connect().await.expect("connect");
        let locks = EntityLocks::new();
        let chat = group(555);

        let first = get_or_create(&mut conn, &locks, &ChatRecord(&chat))
            .await
            .expect("create");
        let second = get_or_create(&mut conn, &locks, &ChatRecord(&chat))
            .await
            .expect("find");

        assert!(first.created());
        assert_eq!(second, Upsert::Found(first.id()));
        assert_eq!(connector.chat_rows(555), 1);
    }

    #[tokio::test]
    async fn test_failed_insert_rolls_back() {
        let connector = MemoryConnector::new();
        let mut conn = connector.connect().await.expect("connect");
        let locks = EntityLocks::new();
        let chat = group(9);

        connector.fail_next_insert();
        let result = get_or_create(&mut conn, &locks, &ChatRecord(&chat)).await;
        assert!(matches!(result, Err(UpsertError::Store(_))));
        assert_eq!(connector.chat_rows(9), 0);

        let retried = get_or_create(&mut conn, &locks, &ChatRecord(&chat))
            .await
            .expect("retry");
        assert!(retried.created());
        assert_eq!(connector.chat_rows(9), 1);
    }

    #[tokio::test]
    async fn test_duplicate_from_outside_writer_resolves_to_existing_row() {
        let connector = MemoryConnector::new();
        let mut conn = connector.connect().await.expect("connect");
        let locks = EntityLocks::new();
        let chat = group(77);

        // Another process commits the row right before our insert.
        connector.commit_before_next_insert(&chat);
        let outcome = get_or_create(&mut conn, &locks, &ChatRecord(&chat))
            .await
            .expect("resolves");

        assert!(!outcome.created());
        assert_eq!(connector.chat_rows(77), 1);
    }

    #[tokio::test]
    async fn test_closed_lock_table_fails_slow_path_only() {
        let connector = MemoryConnector::new();
        let mut conn = connector.connect().await.expect("connect");
        let locks = EntityLocks::new();
        let known = group(1);

        get_or_create(&mut conn, &locks, &ChatRecord(&known))
            .await
            .expect("create");
        locks.close().await;

        let found = get_or_create(&mut conn, &locks, &ChatRecord(&known)).await;
        assert!(matches!(found, Ok(Upsert::Found(_))));

        let unknown = group(2);
        let missing = get_or_create(&mut conn, &locks, &ChatRecord(&unknown)).await;
        assert!(matches!(missing, Err(UpsertError::LocksClosed)));
    }
}
