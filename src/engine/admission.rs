use std::time::Instant;

use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::error::{EngineError, ForbiddenReason, PolicyRule};
use super::lifecycle::{Transition, authorize};
use super::policy::{AdmissionContext, PolicySet};
use super::store::{ReservationStore, StoreTransaction};

/// What a caller asks for: `duration_minutes` starting at `start` for `user_id`.
/// `replaces` turns the booking into a move of that reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub shop_id: Ulid,
    pub start: Ts,
    pub duration_minutes: i64,
    pub user_id: Ulid,
    pub replaces: Option<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub span: Span,
    pub user_id: Ulid,
    pub replaces: Option<Ulid>,
}

/// Proof that a candidate passed the policy set. Only [`AdmissionController::commit`]
/// can consume it, and only inside a transaction on the same shop.
#[derive(Debug)]
pub struct Admission {
    shop_id: Ulid,
    reservation: Reservation,
    replaces: bool,
    bypassed: Vec<&'static str>,
}

impl Admission {
    pub fn reservation(&self) -> &Reservation {
        &self.reservation
    }

    /// Rules an administrator overrode to get here.
    pub fn bypassed(&self) -> &[&'static str] {
        &self.bypassed
    }
}

pub struct AdmissionController {
    policies: PolicySet,
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(PolicySet::standard())
    }
}

impl AdmissionController {
    pub fn new(policies: PolicySet) -> Self {
        Self { policies }
    }

    /// Run the policy set against the reservations visible in `tx`.
    pub fn evaluate<T: StoreTransaction + ?Sized>(
        &self,
        tx: &T,
        candidate: &Candidate,
        actor: &Actor,
        now: Ts,
    ) -> Result<Admission, EngineError> {
        let shop = tx.shop();
        let existing = tx.overlapping_reservations(&candidate.span);
        let ctx = AdmissionContext {
            shop,
            span: candidate.span,
            user_id: candidate.user_id,
            actor,
            exclude_id: candidate.replaces,
            existing: &existing,
            now,
        };
        let bypassed = self.policies.evaluate(&ctx)?;

        let reservation = match candidate.replaces {
            Some(id) => {
                let previous = tx.reservation(&id).ok_or(EngineError::NotFound(id))?;
                Reservation {
                    user_id: candidate.user_id,
                    span: candidate.span,
                    updated_at: now,
                    ..previous.clone()
                }
            }
            None => Reservation {
                id: Ulid::new(),
                shop_id: shop.id,
                user_id: candidate.user_id,
                span: candidate.span,
                status: ReservationStatus::Active,
                created_at: now,
                updated_at: now,
            },
        };

        Ok(Admission {
            shop_id: shop.id,
            reservation,
            replaces: candidate.replaces.is_some(),
            bypassed,
        })
    }

    /// Apply an admission inside the transaction it was evaluated in.
    pub async fn commit<T: StoreTransaction + ?Sized>(
        &self,
        admission: Admission,
        tx: &mut T,
    ) -> Result<Reservation, EngineError> {
        let shop_id = tx.shop().id;
        if admission.shop_id != shop_id {
            return Err(EngineError::WrongShop {
                admitted: admission.shop_id,
                transaction: shop_id,
            });
        }
        if !admission.bypassed.is_empty() {
            metrics::counter!(observability::PRIVILEGED_BYPASS_TOTAL).increment(1);
        }

        let reservation = admission.reservation;
        if admission.replaces {
            tx.update_reservation(reservation.clone()).await?;
        } else {
            tx.insert_reservation(reservation.clone()).await?;
        }
        debug!(
            shop = %shop_id,
            reservation = %reservation.id,
            user = %reservation.user_id,
            start = %reservation.span.start,
            end = %reservation.span.end,
            bypassed = ?admission.bypassed,
            "reservation committed"
        );
        Ok(reservation)
    }
}

/// Wall-clock "now" in the same naive local time reservations are stored in.
pub fn local_now() -> Ts {
    chrono::Local::now().naive_local()
}

/// Open a transaction on the request's shop, admit, commit. The shop stays
/// locked from the read of existing reservations until the write is durable.
pub async fn evaluate_and_commit<S: ReservationStore + ?Sized>(
    store: &S,
    controller: &AdmissionController,
    request: BookingRequest,
    actor: &Actor,
    now: Ts,
) -> Result<Reservation, EngineError> {
    let operation = if request.replaces.is_some() {
        "update"
    } else {
        "create"
    };
    let started = Instant::now();

    let result = async {
        let mut tx = store.begin(request.shop_id).await?;
        admit_in_transaction(&mut tx, controller, &request, actor, now).await
    }
    .await;

    record(operation, &result, started);
    result
}

pub(super) fn record<T>(operation: &'static str, result: &Result<T, EngineError>, started: Instant) {
    metrics::counter!(
        observability::ADMISSIONS_TOTAL,
        "operation" => operation,
        "outcome" => observability::outcome_label(result)
    )
    .increment(1);
    metrics::histogram!(observability::ADMISSION_DURATION_SECONDS, "operation" => operation)
        .record(started.elapsed().as_secs_f64());
}

/// Authorization, normalization and admission for a request, inside an open transaction.
pub async fn admit_in_transaction<T: StoreTransaction + ?Sized>(
    tx: &mut T,
    controller: &AdmissionController,
    request: &BookingRequest,
    actor: &Actor,
    now: Ts,
) -> Result<Reservation, EngineError> {
    let shop_id = tx.shop().id;
    if request.shop_id != shop_id {
        return Err(EngineError::WrongShop {
            admitted: request.shop_id,
            transaction: shop_id,
        });
    }

    let previous = match request.replaces {
        Some(id) => {
            let previous = tx
                .reservation(&id)
                .cloned()
                .ok_or(EngineError::NotFound(id))?;
            authorize(&previous, actor, Transition::Update)?;
            if previous.user_id != request.user_id {
                return Err(EngineError::InvalidArgument(
                    "update cannot change the owner; reassign instead",
                ));
            }
            Some(previous)
        }
        None => {
            if !actor.privileged && request.user_id != actor.user_id {
                return Err(EngineError::Forbidden(ForbiddenReason::OtherUser));
            }
            None
        }
    };

    if request.duration_minutes <= 0 {
        return Err(EngineError::PolicyViolation(PolicyRule::TooShort));
    }
    let span = Span::from_minutes(truncate_to_minute(request.start), request.duration_minutes)
        .ok_or(EngineError::InvalidArgument("interval out of range"))?;

    if let Some(previous) = previous
        && previous.span == span
    {
        return Ok(previous);
    }

    let candidate = Candidate {
        span,
        user_id: request.user_id,
        replaces: request.replaces,
    };
    let admission = controller.evaluate(&*tx, &candidate, actor, now)?;
    controller.commit(admission, tx).await
}
