use chrono::{Duration, NaiveDateTime, NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Naive local wall-clock time. The only instant type.
pub type Ts = NaiveDateTime;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ts,
    pub end: Ts,
}

impl Span {
    pub fn new(start: Ts, end: Ts) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Build `[start, start + minutes)`. Returns `None` for a non-positive length.
    pub fn from_minutes(start: Ts, minutes: i64) -> Option<Self> {
        if minutes <= 0 {
            return None;
        }
        let end = start.checked_add_signed(Duration::try_minutes(minutes)?)?;
        Some(Self { start, end })
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ts) -> bool {
        self.start <= t && t < self.end
    }
}

/// Drop seconds and sub-second precision. Bookings are made on whole minutes.
pub fn truncate_to_minute(t: Ts) -> Ts {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

/// Who is asking. Identity is established upstream; the core only trusts these two fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Ulid,
    /// Administrators may bypass admission rules and act on any reservation.
    pub privileged: bool,
}

impl Actor {
    pub fn user(user_id: Ulid) -> Self {
        Self { user_id, privileged: false }
    }

    pub fn admin(user_id: Ulid) -> Self {
        Self { user_id, privileged: true }
    }
}

/// Weekly recurring opening window. Disabled unless `start_time < end_time`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningWindow {
    pub id: Ulid,
    pub weekday: Weekday,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

impl OpeningWindow {
    pub fn new(weekday: Weekday, start_time: NaiveTime, end_time: NaiveTime) -> Self {
        Self {
            id: Ulid::new(),
            weekday,
            start_time,
            end_time,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.start_time < self.end_time
    }

    /// Same weekday and intersecting time ranges.
    pub fn overlaps(&self, other: &OpeningWindow) -> bool {
        self.weekday == other.weekday
            && self.start_time < other.end_time
            && other.start_time < self.end_time
    }
}

/// Capacity resource descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shop {
    pub id: Ulid,
    pub name: String,
    /// Max concurrent occupants.
    pub capacity: u32,
    /// Minutes.
    pub min_duration: u32,
    /// Minutes.
    pub max_duration: u32,
    pub available_from: Ts,
    pub available_until: Ts,
    pub windows: Vec<OpeningWindow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    /// Bookable and mutable by its owner.
    Active,
    /// Confirmed by an administrator; frozen for everyone else.
    Validated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub shop_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub status: ReservationStatus,
    pub created_at: Ts,
    pub updated_at: Ts,
}

impl Reservation {
    pub fn is_validated(&self) -> bool {
        self.status == ReservationStatus::Validated
    }
}

/// Mutable fields of a shop. Opening windows are managed separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShopSettings {
    pub name: String,
    pub capacity: u32,
    pub min_duration: u32,
    pub max_duration: u32,
    pub available_from: Ts,
    pub available_until: Ts,
}

#[derive(Debug, Clone)]
pub struct ShopState {
    pub shop: Shop,
    /// All live reservations, sorted by `span.start`.
    pub reservations: Vec<Reservation>,
    /// Set under the write lock when the shop is deleted; late lockers must bail out.
    pub retired: bool,
}

impl ShopState {
    pub fn new(shop: Shop) -> Self {
        Self {
            shop,
            reservations: Vec::new(),
            retired: false,
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    /// Return only reservations whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }
}

/// The event types, flat. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ShopCreated {
        shop: Shop,
    },
    ShopUpdated {
        id: Ulid,
        settings: ShopSettings,
    },
    ShopDeleted {
        id: Ulid,
    },
    WindowAdded {
        shop_id: Ulid,
        window: OpeningWindow,
    },
    WindowUpdated {
        shop_id: Ulid,
        window: OpeningWindow,
    },
    WindowRemoved {
        shop_id: Ulid,
        id: Ulid,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    /// Full replacement: moves, validation and reassignment all land here.
    ReservationUpdated {
        reservation: Reservation,
    },
    ReservationCancelled {
        id: Ulid,
        shop_id: Ulid,
    },
}

impl Event {
    pub fn shop_id(&self) -> Ulid {
        match self {
            Event::ShopCreated { shop } => shop.id,
            Event::ShopUpdated { id, .. } | Event::ShopDeleted { id } => *id,
            Event::WindowAdded { shop_id, .. }
            | Event::WindowUpdated { shop_id, .. }
            | Event::WindowRemoved { shop_id, .. }
            | Event::ReservationCancelled { shop_id, .. } => *shop_id,
            Event::ReservationCreated { reservation }
            | Event::ReservationUpdated { reservation } => reservation.shop_id,
        }
    }
}

// ── Query types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    pub shop_id: Option<Ulid>,
    pub user_id: Option<Ulid>,
    /// Monday of the week to restrict to (by reservation start).
    pub week_of: Option<chrono::NaiveDate>,
}

/// Who holds a planned slot, as far as the viewer is allowed to know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Booker {
    /// The viewer's own reservation.
    You,
    /// Another user, named for administrators only.
    User(Ulid),
    /// Another user, hidden from regular viewers.
    Someone,
}

/// A reservation as shown on a weekly planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSlot {
    pub id: Ulid,
    pub span: Span,
    pub validated: bool,
    pub booker: Booker,
}

impl PlannedSlot {
    pub fn view(reservation: &Reservation, viewer: &Actor) -> Self {
        let booker = if reservation.user_id == viewer.user_id {
            Booker::You
        } else if viewer.privileged {
            Booker::User(reservation.user_id)
        } else {
            Booker::Someone
        };
        Self {
            id: reservation.id,
            span: reservation.span,
            validated: reservation.is_validated(),
            booker,
        }
    }
}

/// One day of a shop's weekly planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayPlan {
    pub date: chrono::NaiveDate,
    /// Slots starting that day, by start. A slot running past midnight is
    /// listed on its start day only.
    pub slots: Vec<PlannedSlot>,
}
