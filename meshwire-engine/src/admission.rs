//! Bounded admission of initial handshakes.
//!
//! When a large map lands, hundreds of sessions would otherwise start ICE
//! gathering at once and hammer the STUN/TURN fleet. Sessions take a slot
//! before their first gathering and hold it until they reach `Connected` or
//! give up the attempt; reconnections after a successful connection bypass
//! the gate.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

pub struct Admission {
    sem: Arc<Semaphore>,
    capacity: usize,
}

impl Admission {
    pub fn new(capacity: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    /// Wait for a slot, or `None` if the engine shuts down first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            permit = self.sem.clone().acquire_owned() => {
                // The semaphore is never closed while the engine is alive.
                permit.ok()
            }
            _ = cancel.cancelled() => None,
        }
    }
}
