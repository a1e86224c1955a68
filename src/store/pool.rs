//! Fixed-capacity pool of lazily connected store handles.
//!
//! Every slot is addressed by index. Free indices live on a stack; a slot's
//! connection is opened the first time the slot is checked out and then kept
//! for the lifetime of the process, unless a ping shows it went away, in
//! which case it is reopened on the spot.
//!
//! A connection handed back with a transaction still open, or after the pool
//! was closed, is not kept: it is closed and the slot reconnects on its next
//! checkout.

use super::{Connector, StoreConnection, StoreError};
use crate::error::ZeroCapacity;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("all connections are checked out")]
    Exhausted,
    #[error("connection pool is closed")]
    Closed,
    #[error("checkout cancelled")]
    Cancelled,
    #[error("failed to connect: {0}")]
    Connect(#[from] StoreError),
}

pub struct ConnectionPool<K: Connector> {
    connector: K,
    slots: Box<[Mutex<Option<K::Connection>>]>,
    free: Mutex<Vec<usize>>,
    closed: AtomicBool,
    opened: AtomicUsize,
}

impl<K: Connector> ConnectionPool<K> {
    pub fn new(connector: K, capacity: usize) -> Result<Self, ZeroCapacity> {
        if capacity == 0 {
            return Err(ZeroCapacity("connection pool"));
        }

        let slots = (0..capacity).map(|_| Mutex::new(None)).collect();
        // Reverse so that index 0 is handed out first.
        let free = (0..capacity).rev().collect();

        Ok(Self {
            connector,
            slots,
            free: Mutex::new(free),
            closed: AtomicBool::new(false),
            opened: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Indices currently checked out.
    pub fn in_use(&self) -> usize {
        self.capacity() - self.free.lock().len()
    }

    /// Connections opened since startup, reconnects included.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }

    /// Check out a connection without waiting for one to come back.
    pub async fn checkout(&self) -> Result<PooledConnection<'_, K>, CheckoutError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CheckoutError::Closed);
        }

        let index = self.free.lock().pop().ok_or(CheckoutError::Exhausted)?;
        let reservation = Reservation {
            pool: self,
            index,
            armed: true,
        };

        let cached = self.slots[index].lock().take();
        let conn = match cached {
            Some(mut conn) => {
                if conn.ping().await {
                    conn
                } else {
                    log::warn!("db pool {}: connection lost, reconnecting", index);
                    conn.close().await;
                    self.connect(index).await?
                }
            }
            None => self.connect(index).await?,
        };

        Ok(PooledConnection {
            pool: self,
            index: reservation.disarm(),
            conn: Some(conn),
        })
    }

    /// Retry an exhausted pool `attempts` times, `delay` apart.
    pub async fn checkout_with_retry(
        &self,
        attempts: usize,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection<'_, K>, CheckoutError> {
        let mut tried = 0;

        loop {
            match self.checkout().await {
                Err(CheckoutError::Exhausted) => {
                    tried += 1;
                    if tried >= attempts {
                        return Err(CheckoutError::Exhausted);
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CheckoutError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => return other,
            }
        }
    }

    /// Refuse further checkouts and close every idle connection.
    ///
    /// Connections checked out at this point are closed when dropped.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut closed = 0;
        for slot in self.slots.iter() {
            let conn = slot.lock().take();
            if let Some(conn) = conn {
                conn.close().await;
                closed += 1;
            }
        }

        log::info!("db pool closed ({} connections)", closed);
    }

    async fn connect(&self, index: usize) -> Result<K::Connection, StoreError> {
        match self.connector.connect().await {
            Ok(conn) => {
                self.opened.fetch_add(1, Ordering::Relaxed);
                log::debug!("db pool {}: connected", index);
                Ok(conn)
            }
            Err(e) => {
                log::error!("db pool {}: connect failed: {}", index, e);
                Err(e)
            }
        }
    }

    fn put_back(&self, index: usize) {
        self.free.lock().push(index);
    }

    fn check_in(&self, index: usize, conn: K::Connection) {
        let discarded = {
            // Read `closed` under the slot lock so `close` cannot miss a
            // connection stored concurrently.
            let mut slot = self.slots[index].lock();
            if self.closed.load(Ordering::Acquire) {
                log::debug!("db pool {}: closed, dropping returned connection", index);
                Some(conn)
            } else if conn.in_transaction() {
                log::warn!(
                    "db pool {}: connection returned inside a transaction, discarding",
                    index
                );
                Some(conn)
            } else {
                *slot = Some(conn);
                None
            }
        };

        if let Some(conn) = discarded {
            discard(conn);
        }
        self.put_back(index);
    }
}

/// Close a connection that cannot go back to its slot.
///
/// Without a runtime the connection is simply dropped, which also ends any
/// open transaction on the server side.
fn discard<C: StoreConnection>(conn: C) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(conn.close());
        }
        Err(_) => drop(conn),
    }
}

/// Gives an index back to the free stack unless the checkout completed.
struct Reservation<'a, K: Connector> {
    pool: &'a ConnectionPool<K>,
    index: usize,
    armed: bool,
}

impl<K: Connector> Reservation<'_, K> {
    fn disarm(mut self) -> usize {
        self.armed = false;
        self.index
    }
}

impl<K: Connector> Drop for Reservation<'_, K> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.put_back(self.index);
        }
    }
}

/// A checked-out connection. Dropping it checks the connection back in.
pub struct PooledConnection<'a, K: Connector> {
    pool: &'a ConnectionPool<K>,
    index: usize,
    conn: Option<K::Connection>,
}

impl<K: Connector> PooledConnection<'_, K> {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<K: Connector> Deref for PooledConnection<'_, K> {
    type Target = K::Connection;

    fn deref(&self) -> &Self::Target {
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after check-in"),
        }
    }
}

impl<K: Connector> DerefMut for PooledConnection<'_, K> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after check-in"),
        }
    }
}

impl<K: Connector> Drop for PooledConnection<'_, K> {
    fn drop(&mut self) {
        match self.conn.take() {
            Some(conn) => self.pool.check_in(self.index, conn),
            None => self.pool.put_back(self.index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryConnector;

    #[tokio::test]
    async fn test_zero_capacity_rejected() {
        let result = ConnectionPool::new(MemoryConnector::new(), 0);
        assert!(matches!(result, Err(ZeroCapacity("connection pool"))));
    }

    #[tokio::test]
    async fn test_checkout_exhausts_and_recovers() {
        let pool = ConnectionPool::new(MemoryConnector::new(), 2).expect("pool");

        let first = pool.checkout().await.expect("first");
        let second = pool.checkout().await.expect("second");
        assert_ne!(first.index(), second.index());
        assert!(matches!(pool.checkout().await, Err(CheckoutError::Exhausted)));
        assert_eq!(pool.in_use(), 2);

        drop(first);
        let third = pool.checkout().await.expect("index returned on drop");
        assert_eq!(pool.in_use(), 2);
        drop(third);
        drop(second);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_connects_lazily_and_reuses() {
        let connector = MemoryConnector::new();
        let pool = ConnectionPool::new(connector.clone(), 4).expect("pool");
        assert_eq!(connector.connects(), 0);

        for _ in 0..5 {
            let conn = pool.checkout().await.expect("checkout");
            assert_eq!(conn.index(), 0);
        }

        assert_eq!(connector.connects(), 1);
        assert_eq!(pool.opened(), 1);
    }

    #[tokio::test]
    async fn test_reconnects_dead_connection() {
        let connector = MemoryConnector::new();
        let pool = ConnectionPool::new(connector.clone(), 1).expect("pool");

        drop(pool.checkout().await.expect("checkout"));
        connector.kill_connections();
        drop(pool.checkout().await.expect("checkout after kill"));

        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_failed_connect_returns_index() {
        let connector = MemoryConnector::new();
        let pool = ConnectionPool::new(connector.clone(), 1).expect("pool");

        connector.fail_connects(true);
        assert!(matches!(pool.checkout().await, Err(CheckoutError::Connect(_))));
        assert_eq!(pool.in_use(), 0);

        connector.fail_connects(false);
        assert!(pool.checkout().await.is_ok());
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_attempts() {
        let pool = ConnectionPool::new(MemoryConnector::new(), 1).expect("pool");
        let cancel = CancellationToken::new();

        let _held = pool.checkout().await.expect("checkout");
        let result = pool
            .checkout_with_retry(3, Duration::from_millis(1), &cancel)
            .await;
        assert!(matches!(result, Err(CheckoutError::Exhausted)));
    }

    #[tokio::test]
    async fn test_retry_stops_when_cancelled() {
        let pool = ConnectionPool::new(MemoryConnector::new(), 1).expect("pool");
        let cancel = CancellationToken::new();
        let _held = pool.checkout().await.expect("checkout");

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let result = pool
            .checkout_with_retry(5, Duration::from_secs(10), &cancel)
            .await;
        assert!(matches!(result, Err(CheckoutError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_open_transaction_is_not_reused() {
        let connector = MemoryConnector::new();
        let pool = ConnectionPool::new(connector.clone(), 1).expect("pool");

        let mut conn = pool.checkout().await.expect("checkout");
        conn.begin().await.expect("begin");
        drop(conn);
        assert!(pool.slots[0].lock().is_none());
        assert_eq!(pool.in_use(), 0);

        let conn = pool.checkout().await.expect("checkout after discard");
        assert!(!conn.in_transaction());
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_committed_connection_is_reused() {
        let connector = MemoryConnector::new();
        let pool = ConnectionPool::new(connector.clone(), 1).expect("pool");

        let mut conn = pool.checkout().await.expect("checkout");
        conn.begin().await.expect("begin");
        conn.commit().await.expect("commit");
        drop(conn);

        drop(pool.checkout().await.expect("checkout"));
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_connection_returned_after_close_is_dropped() {
        let pool = ConnectionPool::new(MemoryConnector::new(), 2).expect("pool");
        let held = pool.checkout().await.expect("checkout");
        let index = held.index();

        pool.close().await;
        drop(held);

        assert!(pool.slots[index].lock().is_none());
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_checkout() {
        let pool = ConnectionPool::new(MemoryConnector::new(), 1).expect("pool");
        drop(pool.checkout().await.expect("checkout"));

        pool.close().await;
        pool.close().await;
        assert!(matches!(pool.checkout().await, Err(CheckoutError::Closed)));
    }
}
