use async_trait::async_trait;
use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, Journal};

/// Transactional store the admission core runs against.
///
/// `begin` is the per-shop critical section: the returned transaction
/// excludes every other transaction on the same shop until it is dropped,
/// whichever way the caller leaves (commit, rejection, `?`, panic).
#[async_trait]
pub trait ReservationStore: Send + Sync {
    type Tx: StoreTransaction;

    /// Load the shop and lock it for the lifetime of the returned transaction.
    async fn begin(&self, shop_id: Ulid) -> Result<Self::Tx, EngineError>;

    /// Which shop holds this reservation. Unlocked hint; re-check inside the transaction.
    fn shop_of(&self, reservation_id: &Ulid) -> Option<Ulid>;
}

/// One shop, locked. Writes are durable when they return `Ok` and never partial.
#[async_trait]
pub trait StoreTransaction: Send + Sync {
    fn shop(&self) -> &Shop;

    fn reservation(&self, id: &Ulid) -> Option<&Reservation>;

    /// Reservations overlapping `span`, ordered by start. May return a
    /// superset of the true overlaps, never a subset.
    fn overlapping_reservations(&self, span: &Span) -> Vec<Reservation>;

    async fn insert_reservation(&mut self, reservation: Reservation) -> Result<(), EngineError>;

    /// Replace the stored reservation with the same id.
    async fn update_reservation(&mut self, reservation: Reservation) -> Result<(), EngineError>;

    async fn delete_reservation(&mut self, id: Ulid) -> Result<Reservation, EngineError>;
}

/// [`Engine`]'s transaction: the shop's owned write guard plus a journal handle.
pub struct ShopTransaction {
    guard: OwnedRwLockWriteGuard<ShopState>,
    journal: Journal,
}

#[async_trait]
impl ReservationStore for Engine {
    type Tx = ShopTransaction;

    async fn begin(&self, shop_id: Ulid) -> Result<ShopTransaction, EngineError> {
        let guard = self.lock_shop(shop_id).await?;
        Ok(ShopTransaction {
            guard,
            journal: self.journal.clone(),
        })
    }

    fn shop_of(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.get_shop_for_reservation(reservation_id)
    }
}

impl ShopTransaction {
    fn check_owned(&self, reservation: &Reservation) -> Result<(), EngineError> {
        if reservation.shop_id != self.guard.shop.id {
            return Err(EngineError::WrongShop {
                admitted: reservation.shop_id,
                transaction: self.guard.shop.id,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for ShopTransaction {
    fn shop(&self) -> &Shop {
        &self.guard.shop
    }

    fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.guard.reservation(id)
    }

    fn overlapping_reservations(&self, span: &Span) -> Vec<Reservation> {
        self.guard.overlapping(span).cloned().collect()
    }

    async fn insert_reservation(&mut self, reservation: Reservation) -> Result<(), EngineError> {
        self.check_owned(&reservation)?;
        if self.guard.reservations.len() >= MAX_RESERVATIONS_PER_SHOP {
            return Err(EngineError::LimitExceeded("too many reservations on shop"));
        }
        if self.journal.knows_reservation(&reservation.id) {
            return Err(EngineError::AlreadyExists(reservation.id));
        }
        let event = Event::ReservationCreated { reservation };
        self.journal.persist_and_apply(&mut self.guard, &event).await
    }

    async fn update_reservation(&mut self, reservation: Reservation) -> Result<(), EngineError> {
        self.check_owned(&reservation)?;
        if self.guard.reservation(&reservation.id).is_none() {
            return Err(EngineError::NotFound(reservation.id));
        }
        let event = Event::ReservationUpdated { reservation };
        self.journal.persist_and_apply(&mut self.guard, &event).await
    }

    async fn delete_reservation(&mut self, id: Ulid) -> Result<Reservation, EngineError> {
        let removed = self
            .guard
            .reservation(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        let event = Event::ReservationCancelled {
            id,
            shop_id: self.guard.shop.id,
        };
        self.journal.persist_and_apply(&mut self.guard, &event).await?;
        Ok(removed)
    }
}
