//! Self-sizing worker pool fed by a bounded task slot table.
//!
//! # Architecture
//!
//! - **`slots`**: the bounded queue. `submit` never waits; a full table hands
//!   the task back as `SubmitError::Busy`.
//! - **`worker`**: up to `max_workers` workers, each pulling from the ready
//!   FIFO. A worker that sees no work for `worker_idle_cycles` consecutive
//!   idle waits retires and parks its index on the join queue.
//! - **`master`**: a periodic loop (also woken early when the backlog
//!   outgrows the workers) that reaps retired workers and spawns new ones up
//!   to the cap.
//!
//! Task actions run in their own tokio task, so an `Err` or a panic is logged
//! and counted at the dispatch boundary and the worker moves on.

mod master;
pub mod slots;
mod worker;

use crate::config::SchedulerConfig;
use crate::error::ZeroCapacity;
use crate::provider::ProviderError;
use crate::store::{CheckoutError, StoreError, UpsertError};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use slots::{SlotTicket, SubmitError, TakenTask, TaskSlots};
use worker::WorkerPool;

/// What a task action reports back to the dispatch boundary.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Upsert(#[from] UpsertError),
    #[error("connection checkout failed: {0}")]
    Checkout(#[from] CheckoutError),
    #[error("task cancelled")]
    Cancelled,
}

/// Executes one kind of task.
pub trait TaskHandler: Send + Sync + 'static {
    type Task: Send + 'static;

    fn handle(
        &self,
        task: Self::Task,
        ctx: TaskContext<Self::Task>,
    ) -> impl Future<Output = Result<(), TaskError>> + Send;
}

/// Handed to every task action.
pub struct TaskContext<T> {
    worker: usize,
    cancel: CancellationToken,
    scheduler: SchedulerHandle<T>,
}

impl<T> TaskContext<T> {
    /// Index of the worker running this task.
    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the worker is asked to stop.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn scheduler(&self) -> &SchedulerHandle<T> {
        &self.scheduler
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub active_workers: usize,
    pub busy_workers: usize,
    pub queued_tasks: usize,
    pub free_slots: usize,
    pub spawned_total: usize,
    pub retired_total: usize,
    pub completed_total: usize,
    pub failed_total: usize,
    pub abandoned_total: usize,
}

/// State shared by the handle, the workers and the master.
struct Core<T> {
    config: SchedulerConfig,
    slots: TaskSlots<T>,
    workers: WorkerPool,
    master_wake: Notify,
    cancel: CancellationToken,
    completed: AtomicUsize,
    failed: AtomicUsize,
    abandoned: AtomicUsize,
}

impl<T> Core<T> {
    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            active_workers: self.workers.active(),
            busy_workers: self.workers.busy(),
            queued_tasks: self.slots.queued(),
            free_slots: self.slots.free(),
            spawned_total: self.workers.spawned_total(),
            retired_total: self.workers.retired_total(),
            completed_total: self.completed.load(Ordering::Relaxed),
            failed_total: self.failed.load(Ordering::Relaxed),
            abandoned_total: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

struct Shared<H: TaskHandler> {
    core: Arc<Core<H::Task>>,
    handler: Arc<H>,
}

impl<H: TaskHandler> Shared<H> {
    fn spawn_worker(self: &Arc<Self>) -> Option<usize> {
        let shared = self.clone();
        self.core
            .workers
            .spawn(&self.core.cancel, move |index, stop| {
                worker::run(shared, index, stop)
            })
    }
}

/// Cheap, cloneable submission side of a running scheduler.
pub struct SchedulerHandle<T> {
    core: Arc<Core<T>>,
}

impl<T> Clone for SchedulerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T> SchedulerHandle<T> {
    /// Queue a task without waiting.
    ///
    /// When the workers cannot drain the backlog the master is signalled to
    /// grow the pool; otherwise one idle worker is woken.
    pub fn submit(&self, task: T) -> Result<(), SubmitError<T>> {
        if self.core.cancel.is_cancelled() {
            return Err(SubmitError::Closed(task));
        }

        let queued = self.core.slots.submit(task)?;
        if self.core.workers.active() <= queued {
            self.core.master_wake.notify_one();
        } else {
            self.core.slots.wake_one();
        }
        Ok(())
    }

    /// Resolves once a slot is free or the scheduler stops.
    pub async fn wait_for_free_slot(&self) {
        tokio::select! {
            _ = self.core.cancel.cancelled() => {}
            _ = self.core.slots.wait_for_free_slot() => {}
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.core.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.core.cancel.is_cancelled()
    }
}

pub struct Scheduler<H: TaskHandler> {
    shared: Arc<Shared<H>>,
    master: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl<H: TaskHandler> Scheduler<H> {
    /// Allocate the slot table and start the master loop. Workers are spawned
    /// on demand. Must be called inside a tokio runtime.
    pub fn start(config: SchedulerConfig, handler: H) -> Result<Self, ZeroCapacity> {
        let slots = TaskSlots::new(config.max_queued_tasks)?;
        let workers = WorkerPool::new(config.max_workers)?;
        if config.worker_idle_cycles == 0 {
            return Err(ZeroCapacity("worker idle cycle"));
        }

        let core = Arc::new(Core {
            config,
            slots,
            workers,
            master_wake: Notify::new(),
            cancel: CancellationToken::new(),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            abandoned: AtomicUsize::new(0),
        });
        let shared = Arc::new(Shared {
            core,
            handler: Arc::new(handler),
        });

        let master = tokio::spawn(master::run(shared.clone()));
        log::info!(
            "scheduler started ({} workers max, {} task slots)",
            shared.core.config.max_workers,
            shared.core.config.max_queued_tasks
        );

        Ok(Self {
            shared,
            master: Mutex::new(Some(master)),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn handle(&self) -> SchedulerHandle<H::Task> {
        SchedulerHandle {
            core: self.shared.core.clone(),
        }
    }

    pub fn submit(&self, task: H::Task) -> Result<(), SubmitError<H::Task>> {
        self.handle().submit(task)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.core.stats()
    }

    pub fn handler(&self) -> &H {
        &self.shared.handler
    }

    /// Stop the master, stop and join every worker, and abandon whatever is
    /// still queued. Later calls return immediately.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let core = &self.shared.core;
        log::info!("scheduler stopping");

        core.cancel.cancel();
        core.slots.close();
        core.master_wake.notify_one();

        let master = self.master.lock().take();
        if let Some(master) = master {
            if let Err(e) = master.await {
                log::error!("master scheduler exited abnormally: {}", e);
            }
        }

        let joined = core.workers.stop_all().await;

        let abandoned = core.slots.drain_ready();
        if abandoned > 0 {
            log::warn!("scheduler: abandoned {} queued tasks", abandoned);
            core.abandoned.fetch_add(abandoned, Ordering::Relaxed);
        }

        let stats = core.stats();
        log::info!(
            "scheduler stopped ({} workers joined, {} completed, {} failed, {} abandoned)",
            joined,
            stats.completed_total,
            stats.failed_total,
            stats.abandoned_total
        );
    }
}

/// Scheduler bookkeeping no longer holds; continuing would corrupt it.
pub(crate) fn fatal(message: &str) -> ! {
    log::error!("scheduler invariant violated: {}", message);
    std::process::abort()
}
