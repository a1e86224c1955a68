//! Producer side of the crawl.
//!
//! The coordinator alternates two duty-cycle phases until cancelled: a fast
//! phase of `fast_rounds` enumerations `fast_interval` apart, then a slow
//! phase of `slow_rounds` enumerations `slow_interval` apart. Each
//! enumeration submits one visit per eligible chat, and the visit direction
//! flips from one enumeration to the next.

use super::{CrawlTask, Direction, is_eligible};
use crate::config::CrawlConfig;
use crate::provider::ChatProvider;
use crate::scheduler::{SchedulerHandle, SubmitError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why a round ended early.
#[derive(Debug, PartialEq, Eq)]
enum Halt {
    Cancelled,
    SchedulerClosed,
}

pub struct Coordinator<P> {
    provider: Arc<P>,
    scheduler: SchedulerHandle<CrawlTask>,
    config: CrawlConfig,
    cancel: CancellationToken,
}

impl<P: ChatProvider> Coordinator<P> {
    pub fn new(
        provider: Arc<P>,
        scheduler: SchedulerHandle<CrawlTask>,
        config: CrawlConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            provider,
            scheduler,
            config,
            cancel,
        }
    }

    /// Crawl until cancelled or the scheduler closes.
    pub async fn run(self) {
        if self.config.fast_rounds == 0 && self.config.slow_rounds == 0 {
            log::warn!("crawl coordinator has no rounds configured, not starting");
            return;
        }

        log::info!(
            "crawl coordinator started ({} fast rounds every {:?}, {} slow rounds every {:?})",
            self.config.fast_rounds,
            self.config.fast_interval,
            self.config.slow_rounds,
            self.config.slow_interval
        );

        let mut direction = Direction::Backfill;
        let halt = loop {
            let phases = [
                (self.config.fast_rounds, self.config.fast_interval),
                (self.config.slow_rounds, self.config.slow_interval),
            ];

            let mut halted = None;
            'phases: for (rounds, interval) in phases {
                for _ in 0..rounds {
                    if let Err(halt) = self.round(direction).await {
                        halted = Some(halt);
                        break 'phases;
                    }
                    direction = direction.flip();

                    if !self.pause(interval).await {
                        halted = Some(Halt::Cancelled);
                        break 'phases;
                    }
                }
            }

            if let Some(halt) = halted {
                break halt;
            }
        };

        log::info!("crawl coordinator stopped ({:?})", halt);
    }

    /// List chats and submit a visit for every eligible one.
    async fn round(&self, direction: Direction) -> Result<usize, Halt> {
        if self.cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }

        let chat_ids = match self.provider.list_chats(self.config.chat_list_limit).await {
            Ok(ids) => ids,
            Err(e) => {
                log::warn!("crawl: failed to list chats: {}", e);
                return Ok(0);
            }
        };

        let mut submitted = 0;
        for chat_id in chat_ids {
            if self.cancel.is_cancelled() {
                return Err(Halt::Cancelled);
            }

            let chat = match self.provider.get_chat(chat_id).await {
                Ok(chat) => chat,
                Err(e) => {
                    log::warn!("chat {}: failed to fetch metadata: {}", chat_id, e);
                    continue;
                }
            };

            if !is_eligible(chat.kind, self.config.include_private_chats) {
                log::debug!("chat {}: {} not archived", chat.id, chat.kind.as_str());
                continue;
            }

            self.submit(CrawlTask::VisitChat { chat, direction }).await?;
            submitted += 1;
        }

        log::debug!("crawl: submitted {} visits ({:?})", submitted, direction);
        Ok(submitted)
    }

    /// Submit, sleeping `busy_retry` between attempts while the queue is full.
    async fn submit(&self, mut task: CrawlTask) -> Result<(), Halt> {
        loop {
            match self.scheduler.submit(task) {
                Ok(()) => return Ok(()),
                Err(SubmitError::Closed(_)) => return Err(Halt::SchedulerClosed),
                Err(SubmitError::Busy(rejected)) => {
                    task = rejected;
                    log::debug!("crawl: task queue full, retrying in {:?}", self.config.busy_retry);
                    if !self.pause(self.config.busy_retry).await {
                        return Err(Halt::Cancelled);
                    }
                }
            }
        }
    }

    /// Sleep unless cancelled first. `false` when cancelled.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
