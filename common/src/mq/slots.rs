// Bounded worker slots for a running jobber

use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Fixed pool of numbered worker slots
///
/// Acquiring blocks while every slot is held. Waiting for all slots at once
/// (`drain`) is the barrier that guarantees no delivery is still in flight.
#[derive(Debug)]
pub struct WorkerSlots {
    semaphore: Arc<Semaphore>,
    free_ids: Arc<Mutex<Vec<usize>>>,
    capacity: usize,
}

impl WorkerSlots {
    pub fn new(capacity: usize) -> Self {
        // Popped from the back, so slot 0 is handed out first
        let free_ids = (0..capacity).rev().collect();
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            free_ids: Arc::new(Mutex::new(free_ids)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held by deliveries
    pub fn in_flight(&self) -> usize {
        self.capacity
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Wait for a free slot
    ///
    /// The semaphore is never closed, so this only ever waits; callers race
    /// it against their own cancellation.
    pub async fn acquire(&self) -> WorkerSlot {
        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => std::future::pending().await,
        };
        // Every held permit has a matching id on the free list
        let id = self
            .free_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .unwrap_or_default();

        WorkerSlot {
            id,
            free_ids: Arc::clone(&self.free_ids),
            _permit: permit,
        }
    }

    /// Wait until every slot has been returned
    pub async fn drain(&self) {
        let all = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        if let Ok(permits) = self.semaphore.acquire_many(all).await {
            drop(permits);
        }
    }
}

/// A held worker slot; released on drop, including while unwinding
#[derive(Debug)]
pub struct WorkerSlot {
    id: usize,
    free_ids: Arc<Mutex<Vec<usize>>>,
    _permit: OwnedSemaphorePermit,
}

impl WorkerSlot {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        // The id goes back before the permit field is dropped, so whoever
        // acquires the permit next always finds an id
        self.free_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(self.id);
    }
}
