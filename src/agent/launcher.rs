use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::join_all;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::EngineError;
use crate::identity::WorkerIdentity;

use super::worker::{Worker, WorkerDestroyer, WorkerFactory};

struct LiveWorker {
    identity: WorkerIdentity,
    destroyer: WorkerDestroyer,
}

enum Slot {
    Empty,
    /// Reserved by a start whose `create` has not returned yet.
    Starting,
    Live(LiveWorker),
}

/// Slots below `next_index` are reserved, live or finished; slots at or
/// above it are always empty. `next_index` only decreases to hand back the
/// slot of a failed start, and never once `closed` is set.
struct SlotTable {
    slots: Vec<Slot>,
    next_index: usize,
    closed: bool,
}

impl SlotTable {
    fn all_finished(&self) -> bool {
        self.next_index >= self.slots.len()
            && self.slots.iter().all(|slot| matches!(slot, Slot::Empty))
    }

    fn remaining(&self) -> usize {
        self.slots.len().saturating_sub(self.next_index)
    }

    fn live(&self) -> impl Iterator<Item = &LiveWorker> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Live(live) => Some(live),
            Slot::Empty | Slot::Starting => None,
        })
    }

    fn set(&mut self, index: usize, value: Slot) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = value;
        }
    }
}

/// Starts a fixed population of workers and tracks them until they exit.
///
/// Every time the table becomes finished the shared `events` notifier is
/// signalled.
pub struct WorkerLauncher {
    factory: Arc<dyn WorkerFactory>,
    table: Arc<Mutex<SlotTable>>,
    start_lock: tokio::sync::Mutex<()>,
    events: Arc<Notify>,
    wait_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerLauncher {
    #[must_use]
    pub fn new(population: usize, factory: Arc<dyn WorkerFactory>, events: Arc<Notify>) -> Self {
        let mut slots = Vec::with_capacity(population);
        slots.resize_with(population, || Slot::Empty);
        Self {
            factory,
            table: Arc::new(Mutex::new(SlotTable {
                slots,
                next_index: 0,
                closed: false,
            })),
            start_lock: tokio::sync::Mutex::new(()),
            events,
            wait_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Starts up to `count` more workers and reports whether any remain to
    /// be started.
    ///
    /// # Errors
    ///
    /// Returns the factory's error; workers already started keep running.
    pub async fn start_some_workers(&self, count: usize) -> Result<bool, EngineError> {
        let _starting = self.start_lock.lock().await;
        for _ in 0..count {
            let index = {
                let mut table = lock_table(&self.table);
                if table.remaining() == 0 {
                    break;
                }
                let index = table.next_index;
                table.set(index, Slot::Starting);
                table.next_index = index.saturating_add(1);
                index
            };

            let worker = match self.factory.create().await {
                Ok(worker) => worker,
                Err(err) => {
                    self.release_failed_slot(index);
                    return Err(err);
                }
            };
            let identity = worker.identity().clone();
            let destroyer = worker.destroyer();
            let closed = {
                let mut table = lock_table(&self.table);
                table.set(
                    index,
                    Slot::Live(LiveWorker {
                        identity: identity.clone(),
                        destroyer: destroyer.clone(),
                    }),
                );
                table.closed
            };
            if closed {
                info!("Worker {} started after starts were closed, destroying it", identity);
                destroyer.destroy();
            } else {
                info!("Worker {} started", identity);
            }
            self.spawn_wait_task(index, worker);
        }
        Ok(lock_table(&self.table).remaining() > 0)
    }

    /// # Errors
    ///
    /// Returns the factory's error; workers already started keep running.
    pub async fn start_all_workers(&self) -> Result<(), EngineError> {
        let remaining = lock_table(&self.table).remaining();
        self.start_some_workers(remaining).await?;
        Ok(())
    }

    /// Closes every slot not yet reserved. A start already in progress
    /// destroys its worker as soon as `create` returns.
    pub fn dont_start_any_more(&self) {
        let finished = {
            let mut table = lock_table(&self.table);
            table.next_index = table.slots.len();
            table.closed = true;
            table.all_finished()
        };
        if finished {
            self.events.notify_waiters();
        }
    }

    pub fn destroy_all_workers(&self) {
        self.dont_start_any_more();
        let destroyers: Vec<WorkerDestroyer> = lock_table(&self.table)
            .live()
            .map(|live| live.destroyer.clone())
            .collect();
        for destroyer in destroyers {
            destroyer.destroy();
        }
    }

    #[must_use]
    pub fn all_finished(&self) -> bool {
        lock_table(&self.table).all_finished()
    }

    #[must_use]
    pub fn live_workers(&self) -> Vec<WorkerIdentity> {
        lock_table(&self.table)
            .live()
            .map(|live| live.identity.clone())
            .collect()
    }

    /// Waits for every wait task to observe its worker's exit.
    pub async fn shutdown(&self) {
        let tasks = match self.wait_tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for joined in join_all(tasks).await {
            if let Err(err) = joined {
                eprintln!("Worker wait task failed: {}", err);
            }
        }
    }

    fn release_failed_slot(&self, index: usize) {
        let finished = {
            let mut table = lock_table(&self.table);
            table.set(index, Slot::Empty);
            if !table.closed && table.next_index == index.saturating_add(1) {
                table.next_index = index;
            }
            table.all_finished()
        };
        if finished {
            self.events.notify_waiters();
        }
    }

    fn spawn_wait_task(&self, index: usize, mut worker: Box<dyn Worker>) {
        let table = Arc::clone(&self.table);
        let events = Arc::clone(&self.events);
        let handle = tokio::spawn(async move {
            match worker.wait_for().await {
                Ok(code) => info!("Worker {} exited with code {}", worker.identity(), code),
                Err(err) => eprintln!("Lost track of worker {}: {}", worker.identity(), err),
            }
            let finished = {
                let mut table = lock_table(&table);
                table.set(index, Slot::Empty);
                table.all_finished()
            };
            if finished {
                events.notify_waiters();
            }
        });
        match self.wait_tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }
}

fn lock_table(table: &Mutex<SlotTable>) -> MutexGuard<'_, SlotTable> {
    match table.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
