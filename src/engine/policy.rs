use ulid::Ulid;

use crate::model::*;

use super::calendar::fits;
use super::error::{EngineError, PolicyRule};
use super::ledger::{peak_occupancy, same_user_conflict};

/// Everything a rule may look at. Borrowed from the open transaction.
pub struct AdmissionContext<'a> {
    pub shop: &'a Shop,
    pub span: Span,
    pub user_id: Ulid,
    pub actor: &'a Actor,
    /// Reservation being replaced; its footprint is ignored.
    pub exclude_id: Option<Ulid>,
    /// Reservations overlapping `span` (a superset is fine).
    pub existing: &'a [Reservation],
    pub now: Ts,
}

impl AdmissionContext<'_> {
    pub fn duration_minutes(&self) -> i64 {
        self.span.duration_minutes()
    }
}

#[derive(Debug)]
pub enum Outcome {
    Admit,
    /// The rule failed but an override let the candidate through.
    Bypassed(EngineError),
    Reject(EngineError),
}

pub trait Rule: Send + Sync {
    /// Short label used in logs and metrics.
    fn name(&self) -> &'static str;

    fn evaluate(&self, ctx: &AdmissionContext<'_>) -> Outcome;
}

/// Wraps a rule so that a rejection becomes [`Outcome::Bypassed`] whenever
/// `allow` holds for the context.
pub struct Bypass<R> {
    rule: R,
    allow: fn(&AdmissionContext<'_>) -> bool,
}

impl<R: Rule> Bypass<R> {
    pub fn new(rule: R, allow: fn(&AdmissionContext<'_>) -> bool) -> Self {
        Self { rule, allow }
    }

    /// Administrators override.
    pub fn privileged(rule: R) -> Self {
        Self::new(rule, |ctx| ctx.actor.privileged)
    }
}

impl<R: Rule> Rule for Bypass<R> {
    fn name(&self) -> &'static str {
        self.rule.name()
    }

    fn evaluate(&self, ctx: &AdmissionContext<'_>) -> Outcome {
        match self.rule.evaluate(ctx) {
            Outcome::Reject(e) if (self.allow)(ctx) => Outcome::Bypassed(e),
            other => other,
        }
    }
}

// ── Rules ────────────────────────────────────────────────

pub struct SameUserRule;

impl Rule for SameUserRule {
    fn name(&self) -> &'static str {
        "same_user"
    }

    fn evaluate(&self, ctx: &AdmissionContext<'_>) -> Outcome {
        match same_user_conflict(ctx.existing, &ctx.span, ctx.user_id, ctx.exclude_id) {
            Some(r) => Outcome::Reject(EngineError::SameUserConflict(r.id)),
            None => Outcome::Admit,
        }
    }
}

pub struct CapacityRule;

impl Rule for CapacityRule {
    fn name(&self) -> &'static str {
        "capacity"
    }

    fn evaluate(&self, ctx: &AdmissionContext<'_>) -> Outcome {
        let peak = peak_occupancy(ctx.existing, &ctx.span, ctx.exclude_id);
        if peak > ctx.shop.capacity {
            return Outcome::Reject(EngineError::CapacityExceeded {
                capacity: ctx.shop.capacity,
                peak,
            });
        }
        Outcome::Admit
    }
}

pub struct MinDurationRule;

impl Rule for MinDurationRule {
    fn name(&self) -> &'static str {
        "min_duration"
    }

    fn evaluate(&self, ctx: &AdmissionContext<'_>) -> Outcome {
        if ctx.duration_minutes() < i64::from(ctx.shop.min_duration) {
            return Outcome::Reject(EngineError::PolicyViolation(PolicyRule::TooShort));
        }
        Outcome::Admit
    }
}

pub struct MaxDurationRule;

impl Rule for MaxDurationRule {
    fn name(&self) -> &'static str {
        "max_duration"
    }

    fn evaluate(&self, ctx: &AdmissionContext<'_>) -> Outcome {
        if ctx.duration_minutes() > i64::from(ctx.shop.max_duration) {
            return Outcome::Reject(EngineError::PolicyViolation(PolicyRule::TooLong));
        }
        Outcome::Admit
    }
}

pub struct NotInPastRule;

impl Rule for NotInPastRule {
    fn name(&self) -> &'static str {
        "not_in_past"
    }

    fn evaluate(&self, ctx: &AdmissionContext<'_>) -> Outcome {
        if ctx.span.start < ctx.now {
            return Outcome::Reject(EngineError::PolicyViolation(PolicyRule::InThePast));
        }
        Outcome::Admit
    }
}

/// `available_from <= start <= available_until`. Only the start is checked.
pub struct ValidityWindowRule;

impl Rule for ValidityWindowRule {
    fn name(&self) -> &'static str {
        "validity_window"
    }

    fn evaluate(&self, ctx: &AdmissionContext<'_>) -> Outcome {
        let start = ctx.span.start;
        if start < ctx.shop.available_from {
            return Outcome::Reject(EngineError::PolicyViolation(
                PolicyRule::BeforeAvailableFrom,
            ));
        }
        if start > ctx.shop.available_until {
            return Outcome::Reject(EngineError::PolicyViolation(
                PolicyRule::AfterAvailableUntil,
            ));
        }
        Outcome::Admit
    }
}

pub struct OpeningHoursRule;

impl Rule for OpeningHoursRule {
    fn name(&self) -> &'static str {
        "opening_hours"
    }

    fn evaluate(&self, ctx: &AdmissionContext<'_>) -> Outcome {
        if fits(ctx.shop, &ctx.span) {
            Outcome::Admit
        } else {
            Outcome::Reject(EngineError::PolicyViolation(PolicyRule::OutsideOpeningHours))
        }
    }
}

// ── Policy set ───────────────────────────────────────────

/// Ordered rules; the first rejection wins. The default set is empty and admits everything.
#[derive(Default)]
pub struct PolicySet {
    rules: Vec<Box<dyn Rule>>,
}

impl PolicySet {
    /// Booking rules in evaluation order, each overridable by administrators.
    /// The minimum length is only waived for a positive duration.
    pub fn standard() -> Self {
        Self::default()
            .with(Bypass::privileged(SameUserRule))
            .with(Bypass::privileged(CapacityRule))
            .with(Bypass::new(MinDurationRule, |ctx| {
                ctx.actor.privileged && ctx.duration_minutes() > 0
            }))
            .with(Bypass::privileged(MaxDurationRule))
            .with(Bypass::privileged(NotInPastRule))
            .with(Bypass::privileged(ValidityWindowRule))
            .with(Bypass::privileged(OpeningHoursRule))
    }

    pub fn with(mut self, rule: impl Rule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Names of the rules that were overridden, or the first rejection.
    pub fn evaluate(&self, ctx: &AdmissionContext<'_>) -> Result<Vec<&'static str>, EngineError> {
        let mut bypassed = Vec::new();
        for rule in &self.rules {
            match rule.evaluate(ctx) {
                Outcome::Admit => {}
                Outcome::Bypassed(_) => bypassed.push(rule.name()),
                Outcome::Reject(e) => return Err(e),
            }
        }
        Ok(bypassed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime, Weekday};

    fn at(h: u32, m: u32) -> Ts {
        NaiveDate::from_ymd_opt(2030, 1, 7)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn shop() -> Shop {
        let t = |h| NaiveTime::from_hms_opt(h, 0, 0).unwrap();
        Shop {
            id: Ulid::new(),
            name: "Ressourcerie".into(),
            capacity: 1,
            min_duration: 30,
            max_duration: 120,
            available_from: at(0, 0),
            available_until: at(23, 0),
            windows: vec![OpeningWindow::new(Weekday::Mon, t(9), t(12))],
        }
    }

    fn res(user_id: Ulid, span: Span) -> Reservation {
        Reservation {
            id: Ulid::new(),
            shop_id: Ulid::nil(),
            user_id,
            span,
            status: ReservationStatus::Active,
            created_at: at(0, 0),
            updated_at: at(0, 0),
        }
    }

    fn ctx<'a>(
        shop: &'a Shop,
        actor: &'a Actor,
        existing: &'a [Reservation],
        span: Span,
    ) -> AdmissionContext<'a> {
        AdmissionContext {
            shop,
            span,
            user_id: actor.user_id,
            actor,
            exclude_id: None,
            existing,
            now: at(1, 0),
        }
    }

    #[test]
    fn empty_set_admits_everything() {
        let shop = shop();
        let actor = Actor::user(Ulid::new());
        let c = ctx(&shop, &actor, &[], Span::new(at(0, 0), at(0, 1)));
        assert!(PolicySet::default().evaluate(&c).unwrap().is_empty());
    }

    #[test]
    fn standard_order_reports_first_failure() {
        // Too short AND outside opening hours: the duration rule runs first.
        let shop = shop();
        let actor = Actor::user(Ulid::new());
        let c = ctx(&shop, &actor, &[], Span::new(at(7, 0), at(7, 10)));
        let err = PolicySet::standard().evaluate(&c).unwrap_err();
        assert!(matches!(err, EngineError::PolicyViolation(PolicyRule::TooShort)));
    }

    #[test]
    fn capacity_before_calendar() {
        let shop = shop();
        let actor = Actor::user(Ulid::new());
        let existing = vec![res(Ulid::new(), Span::new(at(7, 0), at(8, 0)))];
        let c = ctx(&shop, &actor, &existing, Span::new(at(7, 0), at(8, 0)));
        let err = PolicySet::standard().evaluate(&c).unwrap_err();
        assert!(matches!(
            err,
            EngineError::CapacityExceeded { capacity: 1, peak: 2 }
        ));
    }

    #[test]
    fn privileged_bypasses_and_reports_names() {
        let shop = shop();
        let admin = Actor::admin(Ulid::new());
        let existing = vec![res(Ulid::new(), Span::new(at(7, 0), at(8, 0)))];
        let c = ctx(&shop, &admin, &existing, Span::new(at(7, 0), at(7, 10)));
        let bypassed = PolicySet::standard().evaluate(&c).unwrap();
        assert_eq!(bypassed, vec!["capacity", "min_duration", "opening_hours"]);
    }

    #[test]
    fn validity_window_checks_start_only() {
        let mut shop = shop();
        shop.available_until = at(10, 0);
        let actor = Actor::user(Ulid::new());

        let c = ctx(&shop, &actor, &[], Span::new(at(10, 0), at(11, 0)));
        assert!(PolicySet::standard().evaluate(&c).is_ok());

        let c = ctx(&shop, &actor, &[], Span::new(at(10, 1), at(11, 0)));
        let err = PolicySet::standard().evaluate(&c).unwrap_err();
        assert!(matches!(
            err,
            EngineError::PolicyViolation(PolicyRule::AfterAvailableUntil)
        ));
    }

    #[test]
    fn past_start_rejected() {
        let shop = shop();
        let actor = Actor::user(Ulid::new());
        let mut c = ctx(&shop, &actor, &[], Span::new(at(9, 0), at(10, 0)));
        c.now = at(9, 1);
        let err = PolicySet::standard().evaluate(&c).unwrap_err();
        assert!(matches!(err, EngineError::PolicyViolation(PolicyRule::InThePast)));
    }

    #[test]
    fn custom_bypass_predicate() {
        struct Never;
        impl Rule for Never {
            fn name(&self) -> &'static str {
                "never"
            }
            fn evaluate(&self, _: &AdmissionContext<'_>) -> Outcome {
                Outcome::Reject(EngineError::InvalidArgument("never"))
            }
        }

        let shop = shop();
        let owner = Actor::user(shop.id);
        let other = Actor::user(Ulid::new());
        let set = PolicySet::default().with(Bypass::new(Never, |ctx| ctx.user_id == ctx.shop.id));
        let span = Span::new(at(9, 0), at(10, 0));
        assert_eq!(set.evaluate(&ctx(&shop, &owner, &[], span)).unwrap(), vec!["never"]);
        assert!(set.evaluate(&ctx(&shop, &other, &[], span)).is_err());
    }
}
