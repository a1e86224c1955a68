use super::cursor::{Direction, cursor};
use super::{CrawlTask, VisitStats};
use crate::config::CrawlConfig;
use crate::models::{ChatMeta, Message, UserMeta};
use crate::provider::ChatProvider;
use crate::scheduler::{TaskContext, TaskError, TaskHandler};
use crate::store::{
    ChatRecord, ConnectionPool, Connector, EntityLocks, MessageRecord, PooledConnection, RowId,
    StoreConnection, UpsertError, UserRecord, get_or_create,
};
use dashmap::DashSet;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Runs chat visits on scheduler workers.
///
/// Only one visit per chat runs at a time; a second visit of a chat already
/// in flight is skipped rather than queued behind it.
pub struct CrawlHandler<P, K: Connector> {
    provider: Arc<P>,
    pool: Arc<ConnectionPool<K>>,
    locks: Arc<EntityLocks>,
    config: CrawlConfig,
    in_flight: DashSet<i64>,
    totals: Mutex<VisitStats>,
}

/// Marks a chat as being visited until dropped.
struct VisitClaim<'a> {
    in_flight: &'a DashSet<i64>,
    chat_id: i64,
}

impl<'a> VisitClaim<'a> {
    fn try_claim(in_flight: &'a DashSet<i64>, chat_id: i64) -> Option<Self> {
        in_flight
            .insert(chat_id)
            .then_some(Self { in_flight, chat_id })
    }
}

impl Drop for VisitClaim<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.chat_id);
    }
}

impl<P, K> CrawlHandler<P, K>
where
    P: ChatProvider,
    K: Connector,
{
    pub fn new(
        provider: Arc<P>,
        pool: Arc<ConnectionPool<K>>,
        locks: Arc<EntityLocks>,
        config: CrawlConfig,
    ) -> Self {
        Self {
            provider,
            pool,
            locks,
            config,
            in_flight: DashSet::new(),
            totals: Mutex::new(VisitStats::default()),
        }
    }

    /// Counters summed over every finished visit.
    pub fn totals(&self) -> VisitStats {
        *self.totals.lock()
    }

    /// Archive one window of a chat's history.
    pub async fn visit(
        &self,
        chat: &ChatMeta,
        direction: Direction,
        cancel: &CancellationToken,
    ) -> Result<VisitStats, TaskError> {
        let mut stats = VisitStats::default();

        let Some(_claim) = VisitClaim::try_claim(&self.in_flight, chat.id) else {
            log::debug!("chat {}: visit already in flight, skipping", chat.id);
            return Ok(stats);
        };

        let bounds = {
            let mut conn = self.checkout(cancel).await?;
            conn.message_bounds(chat.id).await?
        };
        let at = cursor(direction, bounds, self.config.history_window);

        let history = self
            .provider
            .get_chat_history(chat.id, at.from_message_id, at.offset, at.limit)
            .await?;
        stats.fetched = history.len();

        let mut archivable = Vec::with_capacity(history.len());
        for message in history {
            match message.sender.user_id() {
                Some(user_id) if message.text().is_some() => archivable.push((user_id, message)),
                _ => stats.skipped += 1,
            }
        }

        let senders = self.fetch_senders(&archivable, cancel).await?;

        if archivable.is_empty() {
            log::debug!("chat {}: nothing to archive in this window", chat.id);
            return Ok(stats);
        }

        let mut conn = self.checkout(cancel).await?;
        let chat_row = get_or_create(&mut *conn, &self.locks, &ChatRecord(chat))
            .await?
            .id();
        let mut user_rows: HashMap<i64, RowId> = HashMap::new();

        for (user_id, message) in &archivable {
            if cancel.is_cancelled() {
                log::debug!("chat {}: visit cancelled mid-window", chat.id);
                return Err(TaskError::Cancelled);
            }

            let Some(user) = senders.get(user_id) else {
                stats.skipped += 1;
                continue;
            };

            match self
                .save_message(&mut *conn, chat_row, user, message, &mut user_rows)
                .await
            {
                Ok(true) => stats.inserted += 1,
                Ok(false) => stats.existing += 1,
                Err(UpsertError::LocksClosed) => return Err(UpsertError::LocksClosed.into()),
                Err(e) => {
                    log::warn!("chat {}: message {} not archived: {}", chat.id, message.id, e);
                    stats.failed += 1;
                }
            }
        }

        Ok(stats)
    }

    async fn checkout(
        &self,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection<'_, K>, TaskError> {
        let conn = self
            .pool
            .checkout_with_retry(
                self.config.checkout_attempts,
                self.config.checkout_retry,
                cancel,
            )
            .await?;
        Ok(conn)
    }

    /// Profiles of every distinct sender, fetched before any connection is
    /// taken. A sender whose profile cannot be fetched is left out.
    async fn fetch_senders(
        &self,
        archivable: &[(i64, Message)],
        cancel: &CancellationToken,
    ) -> Result<HashMap<i64, UserMeta>, TaskError> {
        let mut senders = HashMap::new();

        for (user_id, _) in archivable {
            if senders.contains_key(user_id) {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }

            match self.provider.get_user(*user_id).await {
                Ok(user) => {
                    senders.insert(*user_id, user);
                }
                Err(e) => log::warn!("user {}: profile unavailable: {}", user_id, e),
            }
        }

        Ok(senders)
    }

    /// Upsert the sender, then the message. `true` when the message row is new.
    async fn save_message(
        &self,
        conn: &mut K::Connection,
        chat_row: RowId,
        user: &UserMeta,
        message: &Message,
        user_rows: &mut HashMap<i64, RowId>,
    ) -> Result<bool, UpsertError> {
        let sender = match user_rows.get(&user.id) {
            Some(id) => *id,
            None => {
                let id = get_or_create(&mut *conn, &self.locks, &UserRecord(user)).await?.id();
                user_rows.insert(user.id, id);
                id
            }
        };

        let record = MessageRecord {
            chat: chat_row,
            sender,
            message,
        };
        let outcome = get_or_create(&mut *conn, &self.locks, &record).await?;
        Ok(outcome.created())
    }
}

impl<P, K> TaskHandler for CrawlHandler<P, K>
where
    P: ChatProvider,
    K: Connector,
{
    type Task = CrawlTask;

    async fn handle(&self, task: CrawlTask, ctx: TaskContext<CrawlTask>) -> Result<(), TaskError> {
        match task {
            CrawlTask::VisitChat { chat, direction } => {
                let stats = self.visit(&chat, direction, ctx.token()).await?;
                self.totals.lock().merge(stats);
                if stats.fetched > 0 {
                    log::info!(
                        "worker {}: chat {} ({:?}): fetched {}, inserted {}, existing {}, skipped {}, failed {}",
                        ctx.worker(),
                        chat.id,
                        direction,
                        stats.fetched,
                        stats.inserted,
                        stats.existing,
                        stats.skipped,
                        stats.failed
                    );
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChatKind, MessageContent, MessageSender};
    use crate::test_support::{MemoryConnector, ScriptedProvider, group, text_message, user};

    fn handler(
        provider: ScriptedProvider,
        connector: MemoryConnector,
    ) -> CrawlHandler<ScriptedProvider, MemoryConnector> {
        let pool = ConnectionPool::new(connector, 4).expect("pool");
        CrawlHandler::new(
            Arc::new(provider),
            Arc::new(pool),
            Arc::new(EntityLocks::new()),
            CrawlConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_revisit_does_not_duplicate_messages() {
        let provider = ScriptedProvider::new();
        let chat = group(-100);
        provider.add_chat(chat.clone());
        provider.add_user(user(42));
        for id in [10, 11, 12] {
            provider.add_message(text_message(chat.id, id, 42, "hello"));
        }

        let connector = MemoryConnector::new();
        let crawl = handler(provider, connector.clone());
        let cancel = CancellationToken::new();

        let first = crawl
            .visit(&chat, Direction::Backfill, &cancel)
            .await
            .expect("first visit");
        let second = crawl
            .visit(&chat, Direction::CatchUp, &cancel)
            .await
            .expect("second visit");

        assert_eq!(first.inserted, 3);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.existing, 3);
        assert_eq!(connector.message_rows(chat.id), 3);
        assert_eq!(connector.user_rows(42), 1);
        assert_eq!(connector.chat_rows(chat.id), 1);
    }

    #[tokio::test]
    async fn test_non_text_and_chat_senders_are_skipped() {
        let provider = ScriptedProvider::new();
        let chat = group(-200);
        provider.add_chat(chat.clone());
        provider.add_user(user(7));

        provider.add_message(text_message(chat.id, 1, 7, "kept"));
        let mut sticker = text_message(chat.id, 2, 7, "");
        sticker.content = MessageContent::Unsupported;
        provider.add_message(sticker);
        let mut anonymous_admin = text_message(chat.id, 3, 7, "posted as the group");
        anonymous_admin.sender = MessageSender::Chat { chat_id: chat.id };
        provider.add_message(anonymous_admin);

        let connector = MemoryConnector::new();
        let crawl = handler(provider, connector.clone());

        let stats = crawl
            .visit(&chat, Direction::CatchUp, &CancellationToken::new())
            .await
            .expect("visit");

        assert_eq!(stats.fetched, 3);
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_unknown_sender_skips_only_their_messages() {
        let provider = ScriptedProvider::new();
        let chat = group(-300);
        provider.add_chat(chat.clone());
        provider.add_user(user(1));
        provider.add_message(text_message(chat.id, 1, 1, "known"));
        provider.add_message(text_message(chat.id, 2, 2, "unknown sender"));

        let connector = MemoryConnector::new();
        let crawl = handler(provider, connector.clone());

        let stats = crawl
            .visit(&chat, Direction::Backfill, &CancellationToken::new())
            .await
            .expect("visit");

        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(connector.user_rows(2), 0);
    }

    #[tokio::test]
    async fn test_concurrent_visit_of_same_chat_is_skipped() {
        let provider = ScriptedProvider::new();
        let chat = ChatMeta {
            id: -400,
            title: "busy".to_string(),
            kind: ChatKind::BasicGroup,
        };
        provider.add_chat(chat.clone());

        let crawl = handler(provider, MemoryConnector::new());
        let _claim = VisitClaim::try_claim(&crawl.in_flight, chat.id).expect("claim");

        let stats = crawl
            .visit(&chat, Direction::Backfill, &CancellationToken::new())
            .await
            .expect("visit");
        assert_eq!(stats, VisitStats::default());
    }

    #[tokio::test]
    async fn test_cancelled_visit_stops_before_archiving() {
        let provider = ScriptedProvider::new();
        let chat = group(-500);
        provider.add_chat(chat.clone());
        provider.add_user(user(5));
        provider.add_message(text_message(chat.id, 1, 5, "late"));

        let connector = MemoryConnector::new();
        let crawl = handler(provider, connector.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = crawl.visit(&chat, Direction::Backfill, &cancel).await;
        assert!(matches!(result, Err(TaskError::Cancelled)));
        assert_eq!(connector.message_rows(chat.id), 0);
    }
}
