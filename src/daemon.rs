//! Process lifecycle: wire the pools, the scheduler and the coordinator
//! together and take them down again in order.

use crate::config::{CrawlConfig, SchedulerConfig};
use crate::crawl::{Coordinator, CrawlHandler, VisitStats};
use crate::error::Error;
use crate::provider::ChatProvider;
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::store::{ConnectionPool, Connector, EntityLocks};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
    pub scheduler: SchedulerConfig,
    pub crawl: CrawlConfig,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        Self {
            scheduler: SchedulerConfig::from_env(),
            crawl: CrawlConfig::from_env(),
        }
    }
}

pub struct Daemon<P: ChatProvider, K: Connector> {
    scheduler: Scheduler<CrawlHandler<P, K>>,
    pool: Arc<ConnectionPool<K>>,
    locks: Arc<EntityLocks>,
    cancel: CancellationToken,
    coordinator: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl<P: ChatProvider, K: Connector> Daemon<P, K> {
    /// Allocate the connection pool, lock table and task slots, then start
    /// the scheduler and the crawl coordinator.
    pub fn start(config: DaemonConfig, provider: P, connector: K) -> Result<Self, Error> {
        config.scheduler.validate()?;
        config.crawl.validate()?;

        let pool = Arc::new(ConnectionPool::new(
            connector,
            config.scheduler.max_connections,
        )?);
        let locks = Arc::new(EntityLocks::new());
        let provider = Arc::new(provider);

        let handler = CrawlHandler::new(
            provider.clone(),
            pool.clone(),
            locks.clone(),
            config.crawl.clone(),
        );
        let scheduler = Scheduler::start(config.scheduler, handler)?;

        let cancel = CancellationToken::new();
        let coordinator = Coordinator::new(provider, scheduler.handle(), config.crawl, cancel.clone());
        let coordinator = tokio::spawn(coordinator.run());

        log::info!("archiver daemon started");

        Ok(Self {
            scheduler,
            pool,
            locks,
            cancel,
            coordinator: Mutex::new(Some(coordinator)),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Archive counters over every visit finished so far.
    pub fn crawl_totals(&self) -> VisitStats {
        self.scheduler.handler().totals()
    }

    pub fn pool(&self) -> &ConnectionPool<K> {
        &self.pool
    }

    pub fn locks(&self) -> &EntityLocks {
        &self.locks
    }

    /// Stop the coordinator, then the scheduler, then release the connection
    /// pool and the lock table. Later calls return immediately.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        log::info!("archiver daemon stopping");
        self.cancel.cancel();

        let coordinator = self.coordinator.lock().take();
        if let Some(coordinator) = coordinator {
            if let Err(e) = coordinator.await {
                log::error!("crawl coordinator exited abnormally: {}", e);
            }
        }

        self.scheduler.shutdown().await;
        self.pool.close().await;
        self.locks.close().await;

        let totals = self.crawl_totals();
        log::info!(
            "archiver daemon stopped ({} messages fetched, {} inserted, {} already stored, {} failed)",
            totals.fetched,
            totals.inserted,
            totals.existing,
            totals.failed
        );
    }
}
