//! In-memory store speaking the same connection protocol as Postgres.

use crate::models::{ChatMeta, Message, UserMeta};
use crate::store::{Connector, MessageBounds, RowId, StoreConnection, StoreError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct MessageRow {
    id: RowId,
    chat: RowId,
    remote_id: i64,
}

#[derive(Debug, Clone, Copy)]
enum Write {
    Chat { id: RowId, remote_id: i64 },
    User { id: RowId, remote_id: i64 },
    Message(MessageRow),
}

struct State {
    next_id: i64,
    chats: Vec<(RowId, i64)>,
    users: Vec<(RowId, i64)>,
    messages: Vec<MessageRow>,
    unique_keys: bool,
    generation: u64,
    connects: usize,
    fail_connects: bool,
    fail_next_insert: bool,
    foreign_chat: Option<i64>,
    latency: Option<Duration>,
}

impl State {
    fn allocate(&mut self) -> RowId {
        self.next_id += 1;
        RowId(self.next_id)
    }

    fn find_chat(&self, remote_id: i64, pending: &[Write]) -> Option<RowId> {
        self.chats
            .iter()
            .find(|(_, remote)| *remote == remote_id)
            .map(|(id, _)| *id)
            .or_else(|| {
                pending.iter().find_map(|write| match write {
                    Write::Chat { id, remote_id: r } if *r == remote_id => Some(*id),
                    _ => None,
                })
            })
    }

    fn find_user(&self, remote_id: i64, pending: &[Write]) -> Option<RowId> {
        self.users
            .iter()
            .find(|(_, remote)| *remote == remote_id)
            .map(|(id, _)| *id)
            .or_else(|| {
                pending.iter().find_map(|write| match write {
                    Write::User { id, remote_id: r } if *r == remote_id => Some(*id),
                    _ => None,
                })
            })
    }

    fn find_message(&self, chat: RowId, remote_id: i64, pending: &[Write]) -> Option<RowId> {
        let matches = |row: &MessageRow| row.chat == chat && row.remote_id == remote_id;
        self.messages
            .iter()
            .find(|row| matches(row))
            .map(|row| row.id)
            .or_else(|| {
                pending.iter().find_map(|write| match write {
                    Write::Message(row) if matches(row) => Some(row.id),
                    _ => None,
                })
            })
    }

    /// Unique-key check against committed rows only; pending rows of the
    /// writer itself were checked when they were staged.
    fn conflicts(&self, write: &Write) -> Option<&'static str> {
        if !self.unique_keys {
            return None;
        }
        match write {
            Write::Chat { remote_id, .. } => {
                self.find_chat(*remote_id, &[]).map(|_| "chat")
            }
            Write::User { remote_id, .. } => {
                self.find_user(*remote_id, &[]).map(|_| "user")
            }
            Write::Message(row) => self
                .find_message(row.chat, row.remote_id, &[])
                .map(|_| "message"),
        }
    }

    fn apply(&mut self, write: Write) {
        match write {
            Write::Chat { id, remote_id } => self.chats.push((id, remote_id)),
            Write::User { id, remote_id } => self.users.push((id, remote_id)),
            Write::Message(row) => self.messages.push(row),
        }
    }
}

/// Shared in-memory database. Clones see the same tables.
#[derive(Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                next_id: 0,
                chats: Vec::new(),
                users: Vec::new(),
                messages: Vec::new(),
                unique_keys: true,
                generation: 0,
                connects: 0,
                fail_connects: false,
                fail_next_insert: false,
                foreign_chat: None,
                latency: None,
            })),
        }
    }

    /// A store without unique constraints, where only the entity locks
    /// prevent duplicate rows.
    pub fn without_unique_keys() -> Self {
        let connector = Self::new();
        connector.state.lock().unique_keys = false;
        connector
    }

    /// Delay every row operation, widening race windows.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = Some(latency);
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    /// Every open connection stops answering pings.
    pub fn kill_connections(&self) {
        self.state.lock().generation += 1;
    }

    pub fn fail_connects(&self, fail: bool) {
        self.state.lock().fail_connects = fail;
    }

    /// The next insert of any kind fails with a driver error.
    pub fn fail_next_insert(&self) {
        self.state.lock().fail_next_insert = true;
    }

    /// Simulate a writer outside this process: right before the next chat
    /// insert, a row for `chat` is committed behind our back.
    pub fn commit_before_next_insert(&self, chat: &ChatMeta) {
        self.state.lock().foreign_chat = Some(chat.id);
    }

    pub fn chat_rows(&self, remote_chat_id: i64) -> usize {
        let state = self.state.lock();
        state
            .chats
            .iter()
            .filter(|(_, remote)| *remote == remote_chat_id)
            .count()
    }

    pub fn user_rows(&self, remote_user_id: i64) -> usize {
        let state = self.state.lock();
        state
            .users
            .iter()
            .filter(|(_, remote)| *remote == remote_user_id)
            .count()
    }

    /// Committed message rows of every stored chat with this remote id.
    pub fn message_rows(&self, remote_chat_id: i64) -> usize {
        let state = self.state.lock();
        let chats: Vec<RowId> = state
            .chats
            .iter()
            .filter(|(_, remote)| *remote == remote_chat_id)
            .map(|(id, _)| *id)
            .collect();
        state
            .messages
            .iter()
            .filter(|row| chats.contains(&row.chat))
            .count()
    }
}

impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, StoreError> {
        let mut state = self.state.lock();
        if state.fail_connects {
            return Err(StoreError::Database(sqlx::Error::Protocol(
                "connection refused".to_string(),
            )));
        }
        state.connects += 1;

        Ok(MemoryConnection {
            state: self.state.clone(),
            generation: state.generation,
            tx: None,
        })
    }
}

pub struct MemoryConnection {
    state: Arc<Mutex<State>>,
    generation: u64,
    tx: Option<Vec<Write>>,
}

impl MemoryConnection {
    async fn delay(&self) -> Result<(), StoreError> {
        let (latency, generation) = {
            let state = self.state.lock();
            (state.latency, state.generation)
        };
        if generation != self.generation {
            return Err(StoreError::Closed);
        }
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn pending(&self) -> &[Write] {
        self.tx.as_deref().unwrap_or(&[])
    }

    /// Stage or apply one insert, honouring unique keys and injected faults.
    fn write(&mut self, make: impl FnOnce(RowId) -> Write) -> Result<RowId, StoreError> {
        let mut state = self.state.lock();

        if std::mem::take(&mut state.fail_next_insert) {
            return Err(StoreError::Database(sqlx::Error::Protocol(
                "injected insert failure".to_string(),
            )));
        }

        let id = state.allocate();
        let write = make(id);

        if let (Write::Chat { remote_id, .. }, Some(foreign)) = (&write, state.foreign_chat) {
            if *remote_id == foreign {
                state.foreign_chat = None;
                let foreign_id = state.allocate();
                state.apply(Write::Chat {
                    id: foreign_id,
                    remote_id: foreign,
                });
            }
        }

        if let Some(table) = state.conflicts(&write) {
            return Err(StoreError::Duplicate(table));
        }

        match self.tx.as_mut() {
            Some(pending) => pending.push(write),
            None => state.apply(write),
        }
        Ok(id)
    }
}

impl StoreConnection for MemoryConnection {
    async fn ping(&mut self) -> bool {
        self.state.lock().generation == self.generation
    }

    async fn begin(&mut self) -> Result<(), StoreError> {
        self.delay().await?;
        self.tx = Some(Vec::new());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let pending = self.tx.take().unwrap_or_default();
        let mut state = self.state.lock();

        if let Some(table) = pending.iter().find_map(|write| state.conflicts(write)) {
            return Err(StoreError::Duplicate(table));
        }
        for write in pending {
            state.apply(write);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.tx = None;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    async fn close(self) {}

    async fn find_chat(&mut self, remote_chat_id: i64) -> Result<Option<RowId>, StoreError> {
        self.delay().await?;
        Ok(self.state.lock().find_chat(remote_chat_id, self.pending()))
    }

    async fn insert_chat(&mut self, chat: &ChatMeta) -> Result<RowId, StoreError> {
        self.delay().await?;
        let remote_id = chat.id;
        self.write(|id| Write::Chat { id, remote_id })
    }

    async fn find_user(&mut self, remote_user_id: i64) -> Result<Option<RowId>, StoreError> {
        self.delay().await?;
        Ok(self.state.lock().find_user(remote_user_id, self.pending()))
    }

    async fn insert_user(&mut self, user: &UserMeta) -> Result<RowId, StoreError> {
        self.delay().await?;
        let remote_id = user.id;
        self.write(|id| Write::User { id, remote_id })
    }

    async fn find_message(
        &mut self,
        chat: RowId,
        remote_message_id: i64,
    ) -> Result<Option<RowId>, StoreError> {
        self.delay().await?;
        Ok(self
            .state
            .lock()
            .find_message(chat, remote_message_id, self.pending()))
    }

    async fn insert_message(
        &mut self,
        chat: RowId,
        _sender: RowId,
        message: &Message,
    ) -> Result<RowId, StoreError> {
        self.delay().await?;
        let remote_id = message.id;
        self.write(|id| {
            Write::Message(MessageRow {
                id,
                chat,
                remote_id,
            })
        })
    }

    async fn message_bounds(
        &mut self,
        remote_chat_id: i64,
    ) -> Result<Option<MessageBounds>, StoreError> {
        self.delay().await?;
        let state = self.state.lock();

        let Some(chat) = state.find_chat(remote_chat_id, &[]) else {
            return Ok(None);
        };
        let ids = state
            .messages
            .iter()
            .filter(|row| row.chat == chat)
            .map(|row| row.remote_id);

        let bounds = ids.fold(None, |bounds: Option<MessageBounds>, id| {
            Some(match bounds {
                Some(b) => MessageBounds {
                    min: b.min.min(id),
                    max: b.max.max(id),
                },
                None => MessageBounds { min: id, max: id },
            })
        });
        Ok(bounds)
    }
}
