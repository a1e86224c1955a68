use super::{Connector, MessageBounds, RowId, StoreConnection, StoreError};
use crate::models::{ChatMeta, ForwardInfo, ForwardOrigin, Message, MessageContent, UserMeta};
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection};

const UNIQUE_VIOLATION: &str = "23505";

/// Opens plain Postgres connections; pooling is done by `ConnectionPool`.
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
}

impl PgConnector {
    pub fn new(options: PgConnectOptions) -> Self {
        Self { options }
    }
}

impl Connector for PgConnector {
    type Connection = PgStoreConnection;

    async fn connect(&self) -> Result<PgStoreConnection, StoreError> {
        let conn = PgConnection::connect_with(&self.options).await?;
        Ok(PgStoreConnection {
            conn,
            in_transaction: false,
        })
    }
}

/// A Postgres connection that remembers whether it has an open transaction.
#[derive(Debug)]
pub struct PgStoreConnection {
    conn: PgConnection,
    in_transaction: bool,
}

fn insert_error(table: &'static str, e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
            return StoreError::Duplicate(table);
        }
    }
    StoreError::Database(e)
}

impl StoreConnection for PgStoreConnection {
    async fn ping(&mut self) -> bool {
        self.conn.ping().await.is_ok()
    }

    async fn begin(&mut self) -> Result<(), StoreError> {
        sqlx::query("BEGIN").execute(&mut self.conn).await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        sqlx::query("COMMIT").execute(&mut self.conn).await?;
        self.in_transaction = false;
        Ok(())
    }

    // A failed ROLLBACK leaves the flag set so the pool discards the connection.
    async fn rollback(&mut self) -> Result<(), StoreError> {
        sqlx::query("ROLLBACK").execute(&mut self.conn).await?;
        self.in_transaction = false;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn close(self) {
        if let Err(e) = self.conn.close().await {
            log::warn!("failed to close db connection cleanly: {}", e);
        }
    }

    async fn find_chat(&mut self, remote_chat_id: i64) -> Result<Option<RowId>, StoreError> {
        let id: Option<i64> = sqlx::query_scalar("SELECT id FROM chats WHERE remote_chat_id = $1")
            .bind(remote_chat_id)
            .fetch_optional(&mut self.conn)
            .await?;
        Ok(id.map(RowId))
    }

    async fn insert_chat(&mut self, chat: &ChatMeta) -> Result<RowId, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"INSERT INTO chats (remote_chat_id, title, kind)
               VALUES ($1, $2, $3)
               RETURNING id"#,
        )
        .bind(chat.id)
        .bind(&chat.title)
        .bind(chat.kind.as_str())
        .fetch_one(&mut self.conn)
        .await
        .map_err(|e| insert_error("chat", e))?;
        Ok(RowId(id))
    }

    async fn find_user(&mut self, remote_user_id: i64) -> Result<Option<RowId>, StoreError> {
        let id: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE remote_user_id = $1")
            .bind(remote_user_id)
            .fetch_optional(&mut self.conn)
            .await?;
        Ok(id.map(RowId))
    }

    async fn insert_user(&mut self, user: &UserMeta) -> Result<RowId, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"INSERT INTO users (
                   remote_user_id, username, first_name, last_name, phone,
                   is_verified, is_support, is_scam, kind
               )
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               RETURNING id"#,
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.phone)
        .bind(user.flags.is_verified)
        .bind(user.flags.is_support)
        .bind(user.flags.is_scam)
        .bind(user.kind.as_str())
        .fetch_one(&mut self.conn)
        .await
        .map_err(|e| insert_error("user", e))?;
        Ok(RowId(id))
    }

    async fn find_message(
        &mut self,
        chat: RowId,
        remote_message_id: i64,
    ) -> Result<Option<RowId>, StoreError> {
        let id: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM messages WHERE chat_id = $1 AND remote_msg_id = $2",
        )
        .bind(chat.0)
        .bind(remote_message_id)
        .fetch_optional(&mut self.conn)
        .await?;
        Ok(id.map(RowId))
    }

    async fn insert_message(
        &mut self,
        chat: RowId,
        sender: RowId,
        message: &Message,
    ) -> Result<RowId, StoreError> {
        let msg_type = match &message.content {
            MessageContent::Text { .. } => "text",
            MessageContent::Unsupported => "unsupported",
        };

        let id: i64 = sqlx::query_scalar(
            r#"INSERT INTO messages (
                   chat_id, sender_id, remote_msg_id, reply_to_remote_msg_id, msg_type,
                   has_edited_msg, is_forwarded_msg, sent_at
               )
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               RETURNING id"#,
        )
        .bind(chat.0)
        .bind(sender.0)
        .bind(message.id)
        .bind(message.reply_to_id)
        .bind(msg_type)
        .bind(message.edited_at.is_some())
        .bind(message.forward_info.is_some())
        .bind(message.sent_at)
        .fetch_one(&mut self.conn)
        .await
        .map_err(|e| insert_error("message", e))?;

        if let MessageContent::Text { text, entities } = &message.content {
            sqlx::query(
                r#"INSERT INTO message_contents (
                       message_id, text, text_entities, is_edited_msg, remote_date
                   )
                   VALUES ($1, $2, $3, $4, $5)"#,
            )
            .bind(id)
            .bind(text)
            .bind(entities)
            .bind(message.edited_at.is_some())
            .bind(message.effective_date())
            .execute(&mut self.conn)
            .await?;
        }

        if let Some(forward) = &message.forward_info {
            insert_forward(&mut self.conn, id, forward).await?;
        }

        Ok(RowId(id))
    }

    async fn message_bounds(
        &mut self,
        remote_chat_id: i64,
    ) -> Result<Option<MessageBounds>, StoreError> {
        let (min, max): (Option<i64>, Option<i64>) = sqlx::query_as(
            r#"SELECT MIN(m.remote_msg_id), MAX(m.remote_msg_id)
               FROM messages m
               JOIN chats c ON c.id = m.chat_id
               WHERE c.remote_chat_id = $1"#,
        )
        .bind(remote_chat_id)
        .fetch_one(&mut self.conn)
        .await?;

        Ok(min.zip(max).map(|(min, max)| MessageBounds { min, max }))
    }
}

async fn insert_forward(
    conn: &mut PgConnection,
    message_id: i64,
    forward: &ForwardInfo,
) -> Result<(), StoreError> {
    let mut origin_user_id = None;
    let mut origin_chat_id = None;
    let mut origin_msg_id = None;
    let mut sender_name = None;
    let mut author_signature = None;

    match &forward.origin {
        ForwardOrigin::User { sender_user_id } => origin_user_id = Some(*sender_user_id),
        ForwardOrigin::HiddenUser { sender_name: name }
        | ForwardOrigin::MessageImport { sender_name: name } => sender_name = Some(name.as_str()),
        ForwardOrigin::Chat {
            sender_chat_id,
            author_signature: signature,
        } => {
            origin_chat_id = Some(*sender_chat_id);
            author_signature = signature.as_deref();
        }
        ForwardOrigin::Channel {
            chat_id,
            message_id,
            author_signature: signature,
        } => {
            origin_chat_id = Some(*chat_id);
            origin_msg_id = Some(*message_id);
            author_signature = signature.as_deref();
        }
    }

    sqlx::query(
        r#"INSERT INTO message_forwards (
               message_id, origin_kind, origin_user_id, origin_chat_id, origin_msg_id,
               sender_name, author_signature, public_service_announcement_type,
               from_remote_chat_id, from_remote_msg_id, remote_date
           )
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
    )
    .bind(message_id)
    .bind(forward.origin.kind())
    .bind(origin_user_id)
    .bind(origin_chat_id)
    .bind(origin_msg_id)
    .bind(sender_name)
    .bind(author_signature)
    .bind(&forward.public_service_announcement_type)
    .bind(forward.from_chat_id)
    .bind(forward.from_message_id)
    .bind(forward.date)
    .execute(&mut *conn)
    .await?;

    Ok(())
}
