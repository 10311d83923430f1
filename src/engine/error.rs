use std::fmt;

use thiserror::Error;
use ulid::Ulid;

/// Admission rule that rejected a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyRule {
    TooShort,
    TooLong,
    InThePast,
    BeforeAvailableFrom,
    AfterAvailableUntil,
    OutsideOpeningHours,
}

impl PolicyRule {
    /// Stable message key for caller-facing translation.
    pub fn code(&self) -> &'static str {
        match self {
            PolicyRule::TooShort => "error.reservation.too_short",
            PolicyRule::TooLong => "error.reservation.too_long",
            PolicyRule::InThePast => "error.reservation.past_time",
            PolicyRule::BeforeAvailableFrom => "error.reservation.before_open",
            PolicyRule::AfterAvailableUntil => "error.reservation.after_close",
            PolicyRule::OutsideOpeningHours => "error.reservation.outside_open",
        }
    }
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            PolicyRule::TooShort => "shorter than the shop minimum",
            PolicyRule::TooLong => "longer than the shop maximum",
            PolicyRule::InThePast => "starts in the past",
            PolicyRule::BeforeAvailableFrom => "starts before the shop opens for bookings",
            PolicyRule::AfterAvailableUntil => "starts after the shop closes for bookings",
            PolicyRule::OutsideOpeningHours => "outside the opening hours",
        };
        f.write_str(msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForbiddenReason {
    /// Non-privileged actor touching someone else's reservation.
    NotOwner,
    /// Non-privileged actor touching a validated reservation.
    Validated,
    /// Operation reserved to administrators.
    PrivilegeRequired,
    /// Non-privileged actor booking on behalf of another user.
    OtherUser,
}

impl fmt::Display for ForbiddenReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ForbiddenReason::NotOwner => "reservation belongs to another user",
            ForbiddenReason::Validated => "reservation is validated",
            ForbiddenReason::PrivilegeRequired => "administrator privilege required",
            ForbiddenReason::OtherUser => "cannot book for another user",
        };
        f.write_str(msg)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("policy violation: {0}")]
    PolicyViolation(PolicyRule),
    #[error("capacity {capacity} exceeded: occupancy would reach {peak}")]
    CapacityExceeded { capacity: u32, peak: u32 },
    #[error("user already holds overlapping reservation {0}")]
    SameUserConflict(Ulid),
    #[error("forbidden: {0}")]
    Forbidden(ForbiddenReason),
    #[error("invalid shop: {0}")]
    InvalidShop(&'static str),
    #[error("invalid opening window: {0}")]
    InvalidWindow(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("admission for shop {admitted} cannot commit in shop {transaction}")]
    WrongShop { admitted: Ulid, transaction: Ulid },
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Stable message key, where one exists.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "error.not_found",
            EngineError::PolicyViolation(rule) => rule.code(),
            EngineError::CapacityExceeded { .. } | EngineError::SameUserConflict(_) => {
                "error.reservation.overlap"
            }
            EngineError::Forbidden(ForbiddenReason::Validated) => {
                "error.reservation.cant_update_validated"
            }
            EngineError::Forbidden(_) => "error.forbidden",
            _ => "error.internal",
        }
    }
}
