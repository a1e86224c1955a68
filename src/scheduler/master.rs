use super::{Shared, TaskHandler};
use std::sync::Arc;

/// Master loop: every tick, or earlier when a submission outgrows the
/// workers, reap retired workers and size the pool to the backlog.
pub(super) async fn run<H: TaskHandler>(shared: Arc<Shared<H>>) {
    let core = &shared.core;
    let tick = core.config.master_tick;

    log::debug!("master scheduler started (tick {:?})", tick);

    loop {
        tokio::select! {
            _ = core.cancel.cancelled() => break,
            _ = core.master_wake.notified() => {}
            _ = tokio::time::sleep(tick) => {}
        }

        if core.cancel.is_cancelled() {
            break;
        }

        adjust(&shared).await;
    }

    log::debug!("master scheduler stopped");
}

async fn adjust<H: TaskHandler>(shared: &Arc<Shared<H>>) {
    let core = &shared.core;

    let reaped = core.workers.reap().await;
    if reaped > 0 {
        log::debug!("master: reaped {} retired workers", reaped);
    }

    let backlog = core.slots.queued();
    let active = core.workers.active();
    let max_workers = core.workers.max_workers();

    if backlog >= active && active < max_workers {
        let wanted = (backlog - active).min(max_workers - active);
        let mut spawned = 0;
        for _ in 0..wanted {
            match shared.spawn_worker() {
                Some(index) => {
                    log::debug!("master: spawned worker {}", index);
                    spawned += 1;
                }
                None => break,
            }
        }
        if spawned > 0 {
            log::info!(
                "master: backlog {} with {} workers, spawned {}",
                backlog,
                active,
                spawned
            );
        }
        core.slots.wake_all();
    } else {
        core.slots.wake_one();
    }

    log::debug!("master: {:?}", core.stats());
}
