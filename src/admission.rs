//! Admission control for concurrently served connections.
//!
//! A semaphore with one permit per client slot bounds the number of live
//! handlers. The dispatcher acquires a permit *before* calling accept, so
//! once the ceiling is reached new connections stay in the kernel backlog
//! until a handler finishes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Connection ceiling plus the live-connection counter.
#[derive(Debug, Clone)]
pub struct Admission {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    permits: Arc<Semaphore>,
    live: AtomicUsize,
    max: usize,
}

impl Admission {
    pub fn new(max: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                permits: Arc::new(Semaphore::new(max)),
                live: AtomicUsize::new(0),
                max,
            }),
        }
    }

    /// Wait until a slot is free and reserve it.
    ///
    /// Only fails if the semaphore has been closed.
    pub async fn acquire(&self) -> Result<Reservation, AcquireError> {
        let permit = Arc::clone(&self.inner.permits).acquire_owned().await?;
        Ok(Reservation {
            permit,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Number of connections currently counted.
    pub fn live(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> usize {
        self.inner.max
    }

    /// Slots that can be admitted right now without waiting.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }
}

/// A free slot held while the dispatcher waits in accept.
///
/// Dropping it returns the permit without touching the counter.
#[derive(Debug)]
pub struct Reservation {
    permit: OwnedSemaphorePermit,
    inner: Arc<Inner>,
}

impl Reservation {
    /// Count an accepted connection against the ceiling.
    ///
    /// Returns the slot and the updated live count.
    pub fn admit(self) -> (ConnectionSlot, usize) {
        let live = self.inner.live.fetch_add(1, Ordering::SeqCst) + 1;
        let slot = ConnectionSlot {
            permit: Some(self.permit),
            inner: self.inner,
        };
        (slot, live)
    }
}

/// One counted connection. The counter is decremented exactly once,
/// through [`ConnectionSlot::release`] or when the slot is dropped.
#[derive(Debug)]
pub struct ConnectionSlot {
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<Inner>,
}

impl ConnectionSlot {
    /// Give the slot back and return the remaining live count.
    pub fn release(mut self) -> usize {
        self.give_back()
    }

    fn give_back(&mut self) -> usize {
        match self.permit.take() {
            Some(permit) => {
                let remaining = self.inner.live.fetch_sub(1, Ordering::SeqCst) - 1;
                drop(permit);
                remaining
            }
            None => self.inner.live.load(Ordering::SeqCst),
        }
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.give_back();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_admit_and_release() {
        let admission = Admission::new(2);

        let (first, live) = admission.acquire().await.unwrap().admit();
        assert_eq!(live, 1);
        let (second, live) = admission.acquire().await.unwrap().admit();
        assert_eq!(live, 2);
        assert_eq!(admission.available(), 0);

        assert_eq!(first.release(), 1);
        assert_eq!(admission.available(), 1);
        drop(second);
        assert_eq!(admission.live(), 0);
        assert_eq!(admission.available(), 2);
    }

    #[tokio::test]
    async fn test_reservation_drop_does_not_count() {
        let admission = Admission::new(1);
        let reservation = admission.acquire().await.unwrap();
        assert_eq!(admission.live(), 0);
        assert_eq!(admission.available(), 0);

        drop(reservation);
        assert_eq!(admission.live(), 0);
        assert_eq!(admission.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_at_capacity() {
        let admission = Admission::new(1);
        let (slot, _) = admission.acquire().await.unwrap().admit();

        let blocked =
            tokio::time::timeout(Duration::from_millis(100), admission.acquire()).await;
        assert!(blocked.is_err(), "admitted past the ceiling");

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.acquire().await.map(Reservation::admit) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        assert_eq!(slot.release(), 0);
        let (_slot, live) = waiter.await.unwrap().unwrap();
        assert_eq!(live, 1);
        assert_eq!(admission.live(), 1);
    }

    #[tokio::test]
    async fn test_live_never_exceeds_max() {
        let admission = Admission::new(4);
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let admission = admission.clone();
            tasks.push(tokio::spawn(async move {
                let (slot, live) = admission.acquire().await.unwrap().admit();
                assert!(live <= admission.max());
                tokio::task::yield_now().await;
                assert!(admission.live() <= admission.max());
                slot.release();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(admission.live(), 0);
    }
}
