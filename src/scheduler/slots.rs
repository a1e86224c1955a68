//! Bounded task slot table.
//!
//! `capacity` slots are allocated up front. A slot index lives in exactly one
//! of three places: the free stack, the ready FIFO, or the hands of the worker
//! executing it (as a [`SlotTicket`]). When the free stack is empty, `submit`
//! hands the task straight back; that is the backpressure signal.

use super::fatal;
use crate::error::ZeroCapacity;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Rejected submission. The task is handed back untouched.
pub enum SubmitError<T> {
    /// Every slot is occupied; retry later.
    Busy(T),
    /// The scheduler is shutting down.
    Closed(T),
}

impl<T> SubmitError<T> {
    pub fn into_inner(self) -> T {
        match self {
            SubmitError::Busy(task) | SubmitError::Closed(task) => task,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, SubmitError::Busy(_))
    }
}

impl<T> fmt::Debug for SubmitError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::Busy(_) => f.write_str("Busy(..)"),
            SubmitError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for SubmitError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::Busy(_) => f.write_str("task queue is full"),
            SubmitError::Closed(_) => f.write_str("task queue is closed"),
        }
    }
}

impl<T> std::error::Error for SubmitError<T> {}

/// Proof that the holder owns a dispatched slot. Consumed by `release`.
#[derive(Debug)]
pub struct SlotTicket {
    index: usize,
}

impl SlotTicket {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// A task taken off the ready FIFO together with its slot.
#[derive(Debug)]
pub struct TakenTask<T> {
    pub ticket: SlotTicket,
    pub task: T,
}

struct Slot<T> {
    index: usize,
    used: bool,
    task: Option<T>,
}

pub struct TaskSlots<T> {
    slots: Box<[Mutex<Slot<T>>]>,
    free: Mutex<Vec<usize>>,
    ready: Mutex<VecDeque<usize>>,
    closed: AtomicBool,
    task_ready: Notify,
    slot_freed: Notify,
}

impl<T> TaskSlots<T> {
    pub fn new(capacity: usize) -> Result<Self, ZeroCapacity> {
        if capacity == 0 {
            return Err(ZeroCapacity("task slot table"));
        }

        let slots = (0..capacity)
            .map(|index| {
                Mutex::new(Slot {
                    index,
                    used: false,
                    task: None,
                })
            })
            .collect();

        Ok(Self {
            slots,
            free: Mutex::new((0..capacity).rev().collect()),
            ready: Mutex::new(VecDeque::with_capacity(capacity)),
            closed: AtomicBool::new(false),
            task_ready: Notify::new(),
            slot_freed: Notify::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Tasks waiting in the ready FIFO.
    pub fn queued(&self) -> usize {
        self.ready.lock().len()
    }

    pub fn free(&self) -> usize {
        self.free.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue a task. Never waits. Returns the ready FIFO depth after the push.
    ///
    /// Waking a consumer is left to the caller, which knows how many
    /// workers are around to drain the queue.
    pub fn submit(&self, task: T) -> Result<usize, SubmitError<T>> {
        if self.is_closed() {
            return Err(SubmitError::Closed(task));
        }

        let Some(index) = self.free.lock().pop() else {
            return Err(SubmitError::Busy(task));
        };

        {
            let mut slot = self.slots[index].lock();
            if slot.used {
                fatal(&format!("slot {index} on the free stack is in use"));
            }
            slot.used = true;
            slot.task = Some(task);
        }

        let mut ready = self.ready.lock();
        ready.push_back(index);
        Ok(ready.len())
    }

    /// Pop the oldest ready task, if any.
    pub fn take(&self) -> Option<TakenTask<T>> {
        let index = self.ready.lock().pop_front()?;

        let mut slot = self.slots[index].lock();
        if slot.index != index {
            fatal(&format!(
                "slot dequeued as {index} records index {}",
                slot.index
            ));
        }
        if !slot.used {
            fatal(&format!("slot {index} dequeued while free"));
        }
        let Some(task) = slot.task.take() else {
            fatal(&format!("slot {index} dequeued without a task"));
        };

        Some(TakenTask {
            ticket: SlotTicket { index },
            task,
        })
    }

    /// Return a dispatched slot to the free stack.
    pub fn release(&self, ticket: SlotTicket) {
        let index = ticket.index;
        {
            let mut slot = self.slots[index].lock();
            if !slot.used {
                fatal(&format!("slot {index} released twice"));
            }
            slot.used = false;
            slot.task = None;
        }

        self.free.lock().push(index);
        self.slot_freed.notify_waiters();
    }

    /// Refuse further submissions and wake everyone waiting on the table.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.task_ready.notify_waiters();
        self.slot_freed.notify_waiters();
    }

    /// Drop every queued task, returning how many were abandoned.
    pub fn drain_ready(&self) -> usize {
        let mut abandoned = 0;
        while let Some(taken) = self.take() {
            self.release(taken.ticket);
            abandoned += 1;
        }
        abandoned
    }

    /// Resolves once a slot is free or the table is closed.
    pub async fn wait_for_free_slot(&self) {
        loop {
            let notified = self.slot_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.free() > 0 || self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Resolves when a consumer is woken.
    pub async fn wait_for_task(&self) {
        self.task_ready.notified().await;
    }

    pub fn wake_one(&self) {
        self.task_ready.notify_one();
    }

    pub fn wake_all(&self) {
        self.task_ready.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            TaskSlots::<u32>::new(0),
            Err(ZeroCapacity("task slot table"))
        ));
    }

    #[test]
    fn test_full_table_reports_busy_until_release() {
        let slots = TaskSlots::new(4).expect("slots");
        for n in 0..4 {
            assert_eq!(slots.submit(n).expect("room"), n as usize + 1);
        }

        let rejected = slots.submit(99).expect_err("full");
        assert!(rejected.is_busy());
        assert_eq!(rejected.into_inner(), 99);

        let taken = slots.take().expect("queued");
        assert!(slots.submit(100).is_err());
        slots.release(taken.ticket);
        assert!(slots.submit(100).is_ok());
    }

    #[test]
    fn test_take_is_fifo() {
        let slots = TaskSlots::new(8).expect("slots");
        for n in ["a", "b", "c"] {
            slots.submit(n).expect("room");
        }

        let order: Vec<&str> = std::iter::from_fn(|| slots.take())
            .map(|taken| {
                let task = taken.task;
                slots.release(taken.ticket);
                task
            })
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(slots.free(), 8);
    }

    #[test]
    fn test_closed_table_hands_task_back() {
        let slots = TaskSlots::new(2).expect("slots");
        slots.close();
        assert!(matches!(slots.submit(7), Err(SubmitError::Closed(7))));
    }

    #[test]
    fn test_drain_abandons_queued_tasks() {
        let slots = TaskSlots::new(4).expect("slots");
        slots.submit(1).expect("room");
        slots.submit(2).expect("room");
        slots.submit(3).expect("room");
        let running = slots.take().expect("queued");

        assert_eq!(slots.drain_ready(), 2);
        assert_eq!(slots.queued(), 0);
        assert_eq!(slots.free(), 3);

        slots.release(running.ticket);
        assert_eq!(slots.free(), 4);
    }

    #[tokio::test]
    async fn test_waiter_woken_by_release() {
        let slots = Arc::new(TaskSlots::new(1).expect("slots"));
        slots.submit(1).expect("room");
        let taken = slots.take().expect("queued");

        let waiting = slots.clone();
        let waiter = tokio::spawn(async move { waiting.wait_for_free_slot().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        slots.release(taken.ticket);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woken")
            .expect("waiter task");
    }
}
