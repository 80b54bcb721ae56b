//! Memory admission control.
//!
//! A single [`MemoryManager`] owns the byte budget for a sync. Every in-flight
//! payload holds a [`Reservation`] against it; the bytes go back to the budget
//! when the reservation is released or dropped. Reserving is the pipeline's
//! only backpressure point: queues are unbounded, the budget is not.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{PipelineError, Result};

struct Budget {
    total: u64,
    used: AtomicU64,
    high_water: AtomicU64,
    /// Wakes reservers when bytes are returned.
    notify: Notify,
    /// First failed give-back as `(released, outstanding)`. Once set, nothing
    /// more is handed out.
    poisoned: OnceLock<(u64, u64)>,
}

impl Budget {
    fn poison(&self) -> Option<PipelineError> {
        self.poisoned
            .get()
            .map(|&(released, outstanding)| PipelineError::OverRelease {
                released,
                outstanding,
            })
    }

    fn try_take(&self, bytes: u64) -> bool {
        if self.poisoned.get().is_some() {
            return false;
        }
        let taken = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|next| *next <= self.total)
            });
        match taken {
            Ok(prev) => {
                self.high_water.fetch_max(prev + bytes, Ordering::Relaxed);
                true
            }
            Err(_) => false,
        }
    }

    fn give_back(&self, bytes: u64) -> Result<()> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_sub(bytes)
            })
            .map_err(|outstanding| {
                let _ = self.poisoned.set((bytes, outstanding));
                self.notify.notify_waiters();
                PipelineError::OverRelease {
                    released: bytes,
                    outstanding,
                }
            })?;
        if bytes > 0 {
            self.notify.notify_waiters();
        }
        Ok(())
    }
}

/// Global byte budget with blocking reservation.
#[derive(Clone)]
pub struct MemoryManager {
    budget: Arc<Budget>,
    timeout: Option<Duration>,
}

impl MemoryManager {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            budget: Arc::new(Budget {
                total: total_bytes,
                used: AtomicU64::new(0),
                high_water: AtomicU64::new(0),
                notify: Notify::new(),
                poisoned: OnceLock::new(),
            }),
            timeout: None,
        }
    }

    /// Fail reservations that wait longer than `timeout` instead of parking forever.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn total_bytes(&self) -> u64 {
        self.budget.total
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.budget.used.load(Ordering::Acquire)
    }

    pub fn available_bytes(&self) -> u64 {
        self.budget.total.saturating_sub(self.reserved_bytes())
    }

    /// Highest number of bytes reserved at once since creation.
    pub fn high_water_bytes(&self) -> u64 {
        self.budget.high_water.load(Ordering::Relaxed)
    }

    /// Wait until `bytes` fit in the budget, then attach them to `payload`.
    ///
    /// Requests larger than the whole budget can never be satisfied and fail
    /// immediately with [`PipelineError::ReservationTooLarge`]. Once a
    /// give-back has failed the budget is poisoned and every reservation
    /// fails with [`PipelineError::OverRelease`].
    pub async fn reserve<T>(&self, bytes: u64, payload: T) -> Result<Reserved<T>> {
        if let Some(e) = self.budget.poison() {
            return Err(e);
        }
        if bytes > self.budget.total {
            return Err(PipelineError::ReservationTooLarge {
                requested: bytes,
                budget: self.budget.total,
            });
        }

        let reservation = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.wait_for(bytes))
                .await
                .map_err(|_| PipelineError::ReservationTimeout {
                    requested: bytes,
                    waited: limit,
                })??,
            None => self.wait_for(bytes).await?,
        };

        Ok(Reserved::from_parts(payload, reservation))
    }

    /// Reserve without waiting. Hands the payload back when the budget is short
    /// or poisoned.
    pub fn try_reserve<T>(&self, bytes: u64, payload: T) -> std::result::Result<Reserved<T>, T> {
        if self.budget.try_take(bytes) {
            Ok(Reserved::from_parts(payload, self.reservation(bytes)))
        } else {
            Err(payload)
        }
    }

    /// Return a handle's bytes to the budget and hand back its payload.
    pub fn release<T>(&self, handle: Reserved<T>) -> T {
        handle.release()
    }

    /// The over-release that poisoned this budget, if any.
    pub fn check(&self) -> Result<()> {
        match self.budget.poison() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Zero-byte reservation, useful as an accumulator for [`Reservation::merge`].
    pub fn empty_reservation(&self) -> Reservation {
        self.reservation(0)
    }

    async fn wait_for(&self, bytes: u64) -> Result<Reservation> {
        loop {
            let notified = self.budget.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and the
            // await still wakes us.
            notified.as_mut().enable();

            if self.budget.try_take(bytes) {
                return Ok(self.reservation(bytes));
            }
            if let Some(e) = self.budget.poison() {
                return Err(e);
            }

            tracing::trace!(
                requested = bytes,
                available = self.available_bytes(),
                "waiting for memory"
            );
            notified.await;
        }
    }

    fn reservation(&self, bytes: u64) -> Reservation {
        Reservation {
            bytes,
            budget: Some(self.budget.clone()),
        }
    }
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("total", &self.budget.total)
            .field("reserved", &self.reserved_bytes())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Bytes held against a [`MemoryManager`].
///
/// Move-only: releasing consumes it, so one reservation can only be returned
/// once. Dropping it returns the bytes as well.
pub struct Reservation {
    bytes: u64,
    budget: Option<Arc<Budget>>,
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn release(self) {
        drop(self)
    }

    /// Fold `other` into this reservation; both must come from the same manager.
    pub fn merge(&mut self, mut other: Reservation) {
        debug_assert!(
            match (&self.budget, &other.budget) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => true,
            },
            "merging reservations from different budgets"
        );
        self.bytes += other.bytes;
        other.bytes = 0;
        if self.budget.is_none() {
            self.budget = other.budget.take();
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(budget) = self.budget.take() {
            if let Err(e) = budget.give_back(self.bytes) {
                tracing::error!(error = %e, "memory accounting corrupted");
            }
        }
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("bytes", &self.bytes)
            .finish()
    }
}

/// A payload paired with the memory reserved for it.
#[derive(Debug)]
pub struct Reserved<T> {
    payload: T,
    reservation: Reservation,
}

impl<T> Reserved<T> {
    pub fn from_parts(payload: T, reservation: Reservation) -> Self {
        Self {
            payload,
            reservation,
        }
    }

    pub fn bytes_reserved(&self) -> u64 {
        self.reservation.bytes
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_parts(self) -> (T, Reservation) {
        (self.payload, self.reservation)
    }

    /// Swap the payload while keeping the same reservation.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Reserved<U> {
        Reserved {
            payload: f(self.payload),
            reservation: self.reservation,
        }
    }

    /// Return the bytes and keep the payload.
    pub fn release(self) -> T {
        let (payload, reservation) = self.into_parts();
        reservation.release();
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reserve_and_release_restores_budget() {
        let memory = MemoryManager::new(100);
        let handle = memory.reserve(40, "payload").await.unwrap();
        assert_eq!(handle.bytes_reserved(), 40);
        assert_eq!(memory.available_bytes(), 60);

        let payload = memory.release(handle);
        assert_eq!(payload, "payload");
        assert_eq!(memory.available_bytes(), 100);
    }

    #[tokio::test]
    async fn test_drop_returns_bytes() {
        let memory = MemoryManager::new(10);
        {
            let _held = memory.reserve(10, ()).await.unwrap();
            assert_eq!(memory.available_bytes(), 0);
        }
        assert_eq!(memory.available_bytes(), 10);
    }

    #[tokio::test]
    async fn test_reserve_blocks_until_release() {
        let memory = MemoryManager::new(10);
        let first = memory.reserve(8, 1u32).await.unwrap();

        let waiter = {
            let memory = memory.clone();
            tokio::spawn(async move { memory.reserve(5, 2u32).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "reservation should be parked");

        first.release();
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(*second.payload(), 2);
        assert_eq!(memory.reserved_bytes(), 5);
    }

    #[tokio::test]
    async fn test_oversized_request_is_rejected() {
        let memory = MemoryManager::new(10);
        let err = memory.reserve(11, ()).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ReservationTooLarge {
                requested: 11,
                budget: 10
            }
        ));
    }

    #[tokio::test]
    async fn test_timeout_converts_starvation_into_error() {
        let memory = MemoryManager::new(10).with_timeout(Duration::from_millis(20));
        let _held = memory.reserve(10, ()).await.unwrap();
        let err = memory.reserve(1, ()).await.unwrap_err();
        assert!(matches!(err, PipelineError::ReservationTimeout { .. }));
    }

    #[test]
    fn test_release_returns_only_own_bytes_with_other_handle_outstanding() {
        let memory = MemoryManager::new(10);
        let held = memory.try_reserve(6, "held").unwrap();
        let other = memory.try_reserve(4, "other").unwrap();

        memory.release(other);
        assert_eq!(memory.reserved_bytes(), 6);
        assert!(memory.try_reserve(8, ()).is_err());

        drop(held);
        assert_eq!(memory.reserved_bytes(), 0);
        memory.check().unwrap();
    }

    #[tokio::test]
    async fn test_failed_give_back_poisons_budget() {
        let memory = MemoryManager::new(10);
        let held = memory.reserve(6, ()).await.unwrap();

        let err = memory.budget.give_back(7).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::OverRelease {
                released: 7,
                outstanding: 6
            }
        ));
        assert!(err.is_fatal());
        assert_eq!(memory.reserved_bytes(), 6);

        assert!(memory.try_reserve(1, ()).is_err());
        let err = memory.reserve(1, ()).await.unwrap_err();
        assert!(matches!(err, PipelineError::OverRelease { released: 7, .. }));
        assert!(memory.check().is_err());

        drop(held);
        assert!(memory.try_reserve(1, ()).is_err());
    }

    #[tokio::test]
    async fn test_poison_wakes_parked_reserver() {
        let memory = MemoryManager::new(10);
        let _held = memory.reserve(10, ()).await.unwrap();
        let waiter = {
            let memory = memory.clone();
            tokio::spawn(async move { memory.reserve(5, ()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        memory.budget.give_back(11).unwrap_err();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, PipelineError::OverRelease { .. }));
    }

    #[test]
    fn test_try_reserve_and_merge() {
        let memory = MemoryManager::new(10);
        let a = memory.try_reserve(3, 'a').unwrap();
        let b = memory.try_reserve(7, 'b').unwrap();
        assert_eq!(memory.try_reserve(1, 'c').unwrap_err(), 'c');

        let mut total = memory.empty_reservation();
        total.merge(a.into_parts().1);
        total.merge(b.into_parts().1);
        assert_eq!(total.bytes(), 10);
        assert_eq!(memory.available_bytes(), 0);

        total.release();
        assert_eq!(memory.available_bytes(), 10);
        assert_eq!(memory.high_water_bytes(), 10);
    }

    #[test]
    fn test_map_keeps_reservation() {
        let memory = MemoryManager::new(10);
        let handle = memory.try_reserve(6, 21u32).unwrap();
        let doubled = handle.map(|n| n * 2);
        assert_eq!(*doubled.payload(), 42);
        assert_eq!(doubled.bytes_reserved(), 6);
        drop(doubled);
        assert_eq!(memory.reserved_bytes(), 0);
    }
}
