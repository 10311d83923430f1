use std::time::Instant;

use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::admission::{
    AdmissionController, BookingRequest, Candidate, admit_in_transaction, record,
};
use super::error::{EngineError, ForbiddenReason};
use super::store::{ReservationStore, StoreTransaction};

/// Mutations of an existing reservation. Creation goes through admission alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Update,
    Cancel,
    Validate,
    Reassign,
}

/// May `actor` apply `transition` to `reservation`?
///
/// Administrators may do anything. Everyone else may only update or cancel
/// their own reservations, and only while those are still `Active`.
pub fn authorize(
    reservation: &Reservation,
    actor: &Actor,
    transition: Transition,
) -> Result<(), EngineError> {
    if actor.privileged {
        return Ok(());
    }
    match transition {
        Transition::Validate | Transition::Reassign => {
            Err(EngineError::Forbidden(ForbiddenReason::PrivilegeRequired))
        }
        Transition::Update | Transition::Cancel => {
            if reservation.user_id != actor.user_id {
                return Err(EngineError::Forbidden(ForbiddenReason::NotOwner));
            }
            if reservation.is_validated() {
                return Err(EngineError::Forbidden(ForbiddenReason::Validated));
            }
            Ok(())
        }
    }
}

fn locate<S: ReservationStore + ?Sized>(store: &S, id: Ulid) -> Result<Ulid, EngineError> {
    store.shop_of(&id).ok_or(EngineError::NotFound(id))
}

fn load<T: StoreTransaction + ?Sized>(tx: &T, id: Ulid) -> Result<Reservation, EngineError> {
    tx.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
}

/// Move a reservation, re-admitting it as a replacement of itself.
/// Moving to the interval it already holds succeeds without writing.
pub async fn update_reservation<S: ReservationStore + ?Sized>(
    store: &S,
    controller: &AdmissionController,
    id: Ulid,
    start: Ts,
    duration_minutes: i64,
    actor: &Actor,
    now: Ts,
) -> Result<Reservation, EngineError> {
    let started = Instant::now();
    let result = async {
        let shop_id = locate(store, id)?;
        let mut tx = store.begin(shop_id).await?;
        let owner = load(&tx, id)?.user_id;
        let request = BookingRequest {
            shop_id,
            start,
            duration_minutes,
            user_id: owner,
            replaces: Some(id),
        };
        admit_in_transaction(&mut tx, controller, &request, actor, now).await
    }
    .await;
    record("update", &result, started);
    result
}

/// Remove a reservation. Frees capacity, so nothing is re-checked.
pub async fn cancel_reservation<S: ReservationStore + ?Sized>(
    store: &S,
    id: Ulid,
    actor: &Actor,
) -> Result<Reservation, EngineError> {
    let shop_id = locate(store, id)?;
    let mut tx = store.begin(shop_id).await?;
    let reservation = load(&tx, id)?;
    authorize(&reservation, actor, Transition::Cancel)?;

    let removed = tx.delete_reservation(id).await?;
    metrics::counter!(observability::CANCELLATIONS_TOTAL).increment(1);
    debug!(shop = %shop_id, reservation = %id, "reservation cancelled");
    Ok(removed)
}

/// `Active -> Validated`. Validating twice is a no-op.
pub async fn validate_reservation<S: ReservationStore + ?Sized>(
    store: &S,
    id: Ulid,
    actor: &Actor,
    now: Ts,
) -> Result<Reservation, EngineError> {
    let shop_id = locate(store, id)?;
    let mut tx = store.begin(shop_id).await?;
    let reservation = load(&tx, id)?;
    authorize(&reservation, actor, Transition::Validate)?;
    if reservation.is_validated() {
        return Ok(reservation);
    }

    let validated = Reservation {
        status: ReservationStatus::Validated,
        updated_at: now,
        ..reservation
    };
    tx.update_reservation(validated.clone()).await?;
    debug!(shop = %shop_id, reservation = %id, "reservation validated");
    Ok(validated)
}

/// Hand a reservation over to another user, keeping its interval.
pub async fn reassign_reservation<S: ReservationStore + ?Sized>(
    store: &S,
    controller: &AdmissionController,
    id: Ulid,
    new_user: Ulid,
    actor: &Actor,
    now: Ts,
) -> Result<Reservation, EngineError> {
    let shop_id = locate(store, id)?;
    let mut tx = store.begin(shop_id).await?;
    let reservation = load(&tx, id)?;
    authorize(&reservation, actor, Transition::Reassign)?;
    if reservation.user_id == new_user {
        return Ok(reservation);
    }

    let candidate = Candidate {
        span: reservation.span,
        user_id: new_user,
        replaces: Some(id),
    };
    let admission = controller.evaluate(&tx, &candidate, actor, now)?;
    controller.commit(admission, &mut tx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn reservation(owner: Ulid, status: ReservationStatus) -> Reservation {
        let at = NaiveDate::from_ymd_opt(2030, 1, 7)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        Reservation {
            id: Ulid::new(),
            shop_id: Ulid::new(),
            user_id: owner,
            span: Span::from_minutes(at, 60).unwrap(),
            status,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn owner_may_update_and_cancel_active() {
        let me = Ulid::new();
        let r = reservation(me, ReservationStatus::Active);
        let actor = Actor::user(me);
        assert!(authorize(&r, &actor, Transition::Update).is_ok());
        assert!(authorize(&r, &actor, Transition::Cancel).is_ok());
    }

    #[test]
    fn validated_is_frozen_for_owner() {
        let me = Ulid::new();
        let r = reservation(me, ReservationStatus::Validated);
        for t in [Transition::Update, Transition::Cancel] {
            assert!(matches!(
                authorize(&r, &Actor::user(me), t),
                Err(EngineError::Forbidden(ForbiddenReason::Validated))
            ));
        }
    }

    #[test]
    fn strangers_are_refused() {
        let r = reservation(Ulid::new(), ReservationStatus::Active);
        let stranger = Actor::user(Ulid::new());
        assert!(matches!(
            authorize(&r, &stranger, Transition::Cancel),
            Err(EngineError::Forbidden(ForbiddenReason::NotOwner))
        ));
    }

    #[test]
    fn validate_and_reassign_need_privilege() {
        let me = Ulid::new();
        let r = reservation(me, ReservationStatus::Active);
        for t in [Transition::Validate, Transition::Reassign] {
            assert!(matches!(
                authorize(&r, &Actor::user(me), t),
                Err(EngineError::Forbidden(ForbiddenReason::PrivilegeRequired))
            ));
        }
    }

    #[test]
    fn admin_may_do_anything() {
        let r = reservation(Ulid::new(), ReservationStatus::Validated);
        let admin = Actor::admin(Ulid::new());
        for t in [
            Transition::Update,
            Transition::Cancel,
            Transition::Validate,
            Transition::Reassign,
        ] {
            assert!(authorize(&r, &admin, t).is_ok());
        }
    }
}
