use super::{Shared, TaskContext, TaskError, TaskHandler, TakenTask, fatal};
use crate::error::ZeroCapacity;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct WorkerHandle {
    stop: CancellationToken,
    join: JoinHandle<()>,
}

/// Bookkeeping for the worker tasks: one handle per worker index, a stack of
/// indices free for spawning and the join queue of retired workers.
pub(super) struct WorkerPool {
    handles: Mutex<Vec<Option<WorkerHandle>>>,
    free: Mutex<Vec<usize>>,
    join_queue: Mutex<Vec<usize>>,
    active: AtomicUsize,
    busy: AtomicUsize,
    spawned_total: AtomicUsize,
    retired_total: AtomicUsize,
}

impl WorkerPool {
    pub(super) fn new(max_workers: usize) -> Result<Self, ZeroCapacity> {
        if max_workers == 0 {
            return Err(ZeroCapacity("worker pool"));
        }

        Ok(Self {
            handles: Mutex::new((0..max_workers).map(|_| None).collect()),
            free: Mutex::new((0..max_workers).rev().collect()),
            join_queue: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            spawned_total: AtomicUsize::new(0),
            retired_total: AtomicUsize::new(0),
        })
    }

    pub(super) fn max_workers(&self) -> usize {
        self.handles.lock().len()
    }

    pub(super) fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub(super) fn busy(&self) -> usize {
        self.busy.load(Ordering::Relaxed)
    }

    pub(super) fn spawned_total(&self) -> usize {
        self.spawned_total.load(Ordering::Relaxed)
    }

    pub(super) fn retired_total(&self) -> usize {
        self.retired_total.load(Ordering::Relaxed)
    }

    /// Start a worker on a free index. `None` when every index is taken,
    /// retired workers waiting to be reaped included.
    pub(super) fn spawn<F, Fut>(&self, parent: &CancellationToken, start: F) -> Option<usize>
    where
        F: FnOnce(usize, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let index = self.free.lock().pop()?;
        let stop = parent.child_token();

        let mut handles = self.handles.lock();
        if handles[index].is_some() {
            fatal(&format!("worker {index} spawned over a live handle"));
        }

        self.active.fetch_add(1, Ordering::AcqRel);
        self.spawned_total.fetch_add(1, Ordering::Relaxed);
        let join = tokio::spawn(start(index, stop.clone()));
        handles[index] = Some(WorkerHandle { stop, join });

        Some(index)
    }

    /// Called by an idle worker on its way out.
    fn retire(&self, index: usize) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.retired_total.fetch_add(1, Ordering::Relaxed);
        self.join_queue.lock().push(index);
    }

    /// Called by a worker leaving because it was told to stop.
    fn exited(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }

    /// Join every retired worker and make its index available again.
    pub(super) async fn reap(&self) -> usize {
        let retired = std::mem::take(&mut *self.join_queue.lock());

        for &index in &retired {
            let handle = self.handles.lock()[index].take();
            let Some(handle) = handle else {
                fatal(&format!("retired worker {index} has no handle"));
            };
            if let Err(e) = handle.join.await {
                log::error!("worker {}: join failed: {}", index, e);
            }
            self.free.lock().push(index);
        }

        retired.len()
    }

    /// Stop and join every worker, running or retired. Returns how many were
    /// joined.
    pub(super) async fn stop_all(&self) -> usize {
        let handles: Vec<(usize, WorkerHandle)> = self
            .handles
            .lock()
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| slot.take().map(|handle| (index, handle)))
            .collect();

        for (_, handle) in &handles {
            handle.stop.cancel();
        }

        let joined = handles.len();
        for (index, handle) in handles {
            if let Err(e) = handle.join.await {
                log::error!("worker {}: join failed: {}", index, e);
            }
            self.free.lock().push(index);
        }
        self.join_queue.lock().clear();

        joined
    }
}

pub(super) async fn run<H: TaskHandler>(
    shared: Arc<Shared<H>>,
    index: usize,
    stop: CancellationToken,
) {
    let core = &shared.core;
    let idle_timeout = core.config.worker_idle_timeout;
    let idle_limit = core.config.worker_idle_cycles;
    let mut idle_cycles = 0;

    log::debug!("worker {}: started", index);

    loop {
        if stop.is_cancelled() {
            break;
        }

        if let Some(taken) = core.slots.take() {
            idle_cycles = 0;
            dispatch(&shared, index, taken, &stop).await;
            continue;
        }

        tokio::select! {
            _ = stop.cancelled() => break,
            woken = tokio::time::timeout(idle_timeout, core.slots.wait_for_task()) => {
                if woken.is_err() {
                    idle_cycles += 1;
                    if idle_cycles >= idle_limit {
                        log::debug!("worker {}: retiring after {} idle cycles", index, idle_cycles);
                        core.workers.retire(index);
                        return;
                    }
                }
            }
        }
    }

    core.workers.exited();
    log::debug!("worker {}: stopped", index);
}

async fn dispatch<H: TaskHandler>(
    shared: &Arc<Shared<H>>,
    index: usize,
    taken: TakenTask<H::Task>,
    stop: &CancellationToken,
) {
    let core = &shared.core;
    let TakenTask { ticket, task } = taken;
    let slot = ticket.index();

    core.workers.busy.fetch_add(1, Ordering::Relaxed);

    let ctx = TaskContext {
        worker: index,
        cancel: stop.clone(),
        scheduler: super::SchedulerHandle {
            core: core.clone(),
        },
    };
    let handler = shared.handler.clone();
    let outcome = tokio::spawn(async move { handler.handle(task, ctx).await }).await;

    core.slots.release(ticket);
    core.workers.busy.fetch_sub(1, Ordering::Relaxed);

    match outcome {
        Ok(Ok(())) => {
            core.completed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Err(TaskError::Cancelled)) => {
            log::warn!("worker {}: task in slot {} cancelled", index, slot);
            core.failed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Err(e)) => {
            log::error!("worker {}: task in slot {} failed: {}", index, slot, e);
            core.failed.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) if e.is_panic() => {
            log::error!("worker {}: task in slot {} panicked", index, slot);
            core.failed.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            log::error!("worker {}: task in slot {} aborted: {}", index, slot, e);
            core.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}
