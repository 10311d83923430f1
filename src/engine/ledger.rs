use ulid::Ulid;

use crate::model::*;

// ── Occupancy ledger ──────────────────────────────────────────────

/// Existing reservations that overlap `candidate`, minus `exclude_id`.
fn overlapping_others<'a>(
    existing: &'a [Reservation],
    candidate: &'a Span,
    exclude_id: Option<Ulid>,
) -> impl Iterator<Item = &'a Reservation> {
    existing
        .iter()
        .filter(move |r| Some(r.id) != exclude_id && r.span.overlaps(candidate))
}

/// Peak number of concurrent reservations inside `candidate`, counting the
/// candidate itself.
///
/// Sweep line over `(instant, ±1)` events clamped to the candidate. At equal
/// instants `-1` sorts before `+1`: a reservation ending at `t` frees its slot
/// before one starting at `t` takes it, so back-to-back bookings never stack.
/// `existing` may be a superset of the true overlaps; non-overlapping entries
/// are ignored.
pub fn peak_occupancy(existing: &[Reservation], candidate: &Span, exclude_id: Option<Ulid>) -> u32 {
    let mut events: Vec<(Ts, i32)> = Vec::with_capacity(existing.len() * 2 + 2);
    events.push((candidate.start, 1));
    events.push((candidate.end, -1));
    for r in overlapping_others(existing, candidate, exclude_id) {
        events.push((r.span.start.max(candidate.start), 1));
        events.push((r.span.end.min(candidate.end), -1));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut count: i64 = 0;
    let mut peak: i64 = 0;
    for (_, delta) in &events {
        count += i64::from(*delta);
        peak = peak.max(count);
    }
    u32::try_from(peak).unwrap_or(u32::MAX)
}

/// First overlapping reservation already held by `user_id`.
pub fn same_user_conflict<'a>(
    existing: &'a [Reservation],
    candidate: &Span,
    user_id: Ulid,
    exclude_id: Option<Ulid>,
) -> Option<&'a Reservation> {
    existing.iter().find(|r| {
        r.user_id == user_id && Some(r.id) != exclude_id && r.span.overlaps(candidate)
    })
}

/// Capacity feasibility plus the unconditional same-user rule.
pub fn admits(
    existing: &[Reservation],
    candidate: &Span,
    user_id: Ulid,
    capacity: u32,
    exclude_id: Option<Ulid>,
) -> bool {
    same_user_conflict(existing, candidate, user_id, exclude_id).is_none()
        && peak_occupancy(existing, candidate, exclude_id) <= capacity
}

// ── Span algebra ─────────────────────────────────────────────────

/// Collapse spans sorted by start into disjoint spans; touching spans join.
/// `saturated_spans` uses this so a full-to-full handover at one instant
/// reads as one busy stretch when `free_spans` cuts it out of open hours.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    sorted.iter().fold(Vec::new(), |mut acc: Vec<Span>, &span| {
        match acc.last_mut() {
            Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
            _ => acc.push(span),
        }
        acc
    })
}

/// What is left of `open` once every span in `busy` is cut out. Both are
/// sorted by start; `busy` may overlap itself. This is the last step of
/// `free_spans`: open hours minus the stretches where the shop is full.
pub fn subtract_intervals(open: &[Span], busy: &[Span]) -> Vec<Span> {
    let mut free = Vec::new();
    // First busy span that can still reach the current open span.
    let mut first = 0;

    for &window in open {
        while busy.get(first).is_some_and(|b| b.end <= window.start) {
            first += 1;
        }

        let mut cursor = window.start;
        for b in busy[first..].iter().take_while(|b| b.start < window.end) {
            if cursor < b.start {
                free.push(Span::new(cursor, b.start));
            }
            cursor = cursor.max(b.end);
        }
        if cursor < window.end {
            free.push(Span::new(cursor, window.end));
        }
    }

    free
}

/// Time ranges where at least `capacity` spans are active at once.
/// Same tie-break as [`peak_occupancy`]: ends before starts.
pub fn saturated_spans(spans: &[Span], capacity: u32) -> Vec<Span> {
    if spans.is_empty() || capacity == 0 {
        return Vec::new();
    }

    let mut events: Vec<(Ts, i32)> = Vec::with_capacity(spans.len() * 2);
    for s in spans {
        events.push((s.start, 1));
        events.push((s.end, -1));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut result: Vec<Span> = Vec::new();
    let mut count: u32 = 0;
    let mut saturated_start: Option<Ts> = None;

    for &(time, delta) in &events {
        if delta > 0 {
            count += 1;
        } else {
            count -= 1;
        }

        if count >= capacity && saturated_start.is_none() {
            saturated_start = Some(time);
        } else if count < capacity
            && let Some(start) = saturated_start.take()
            && time > start
        {
            result.push(Span::new(start, time));
        }
    }

    merge_overlapping(&result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> Ts {
        NaiveDate::from_ymd_opt(2030, 1, 7)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn span(h1: u32, m1: u32, h2: u32, m2: u32) -> Span {
        Span::new(at(h1, m1), at(h2, m2))
    }

    fn res(user_id: Ulid, s: Span) -> Reservation {
        Reservation {
            id: Ulid::new(),
            shop_id: Ulid::nil(),
            user_id,
            span: s,
            status: ReservationStatus::Active,
            created_at: s.start,
            updated_at: s.start,
        }
    }

    // ── peak_occupancy / admits ─────────────────────────

    #[test]
    fn empty_ledger_admits_anything_at_capacity_one() {
        let candidate = span(9, 0, 10, 0);
        assert_eq!(peak_occupancy(&[], &candidate, None), 1);
        assert!(admits(&[], &candidate, Ulid::new(), 1, None));
    }

    #[test]
    fn monday_scenario() {
        let (u1, u2, u3) = (Ulid::new(), Ulid::new(), Ulid::new());
        let existing = vec![res(u1, span(9, 0, 10, 0)), res(u2, span(9, 30, 10, 30))];

        let c = span(9, 45, 10, 15);
        assert_eq!(peak_occupancy(&existing, &c, None), 3);
        assert!(!admits(&existing, &c, u3, 2, None));

        let d = span(10, 0, 10, 30);
        assert_eq!(peak_occupancy(&existing, &d, None), 2);
        assert!(admits(&existing, &d, u3, 2, None));
    }

    #[test]
    fn end_frees_slot_before_coincident_start() {
        let existing = vec![res(Ulid::new(), span(9, 0, 10, 0))];
        let back_to_back = span(10, 0, 11, 0);
        assert_eq!(peak_occupancy(&existing, &back_to_back, None), 1);
        assert!(admits(&existing, &back_to_back, Ulid::new(), 1, None));
    }

    #[test]
    fn chained_handover_inside_candidate() {
        // A ends exactly when B starts; together they never exceed one.
        let existing = vec![
            res(Ulid::new(), span(9, 0, 10, 0)),
            res(Ulid::new(), span(10, 0, 11, 0)),
        ];
        let c = span(9, 30, 10, 30);
        assert_eq!(peak_occupancy(&existing, &c, None), 2);
        assert!(admits(&existing, &c, Ulid::new(), 2, None));
    }

    #[test]
    fn disjoint_overlaps_do_not_add_up() {
        // Both overlap the candidate but never each other.
        let existing = vec![
            res(Ulid::new(), span(8, 0, 9, 30)),
            res(Ulid::new(), span(10, 30, 12, 0)),
        ];
        let c = span(9, 0, 11, 0);
        assert_eq!(peak_occupancy(&existing, &c, None), 2);
    }

    #[test]
    fn exclude_id_ignores_own_footprint() {
        let me = Ulid::new();
        let mine = res(me, span(9, 0, 10, 0));
        let id = mine.id;
        let existing = vec![mine];
        let c = span(9, 0, 10, 0);
        assert_eq!(peak_occupancy(&existing, &c, Some(id)), 1);
        assert!(admits(&existing, &c, me, 1, Some(id)));
        assert!(!admits(&existing, &c, me, 1, None));
    }

    #[test]
    fn superset_input_is_filtered() {
        let existing = vec![
            res(Ulid::new(), span(7, 0, 8, 0)),
            res(Ulid::new(), span(12, 0, 13, 0)),
        ];
        assert_eq!(peak_occupancy(&existing, &span(9, 0, 10, 0), None), 1);
    }

    #[test]
    fn same_user_rejected_regardless_of_capacity() {
        let me = Ulid::new();
        let existing = vec![res(me, span(9, 0, 10, 0))];
        let c = span(9, 59, 10, 30);
        assert_eq!(
            same_user_conflict(&existing, &c, me, None).map(|r| r.id),
            Some(existing[0].id)
        );
        assert!(!admits(&existing, &c, me, 50, None));
        // Back-to-back for the same user is fine.
        assert!(same_user_conflict(&existing, &span(10, 0, 10, 30), me, None).is_none());
    }

    // ── span algebra ────────────────────────────────────

    #[test]
    fn subtract_middle_punch() {
        let base = vec![span(9, 0, 12, 0)];
        let remove = vec![span(10, 0, 10, 30)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![span(9, 0, 10, 0), span(10, 30, 12, 0)]
        );
    }

    #[test]
    fn subtract_across_adjacent_bases() {
        let base = vec![span(9, 0, 10, 0), span(10, 0, 11, 0)];
        let remove = vec![span(9, 30, 10, 15)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![span(9, 0, 9, 30), span(10, 15, 11, 0)]
        );
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![span(9, 0, 10, 0)];
        let remove = vec![span(8, 0, 11, 0)];
        assert!(subtract_intervals(&base, &remove).is_empty());
    }

    #[test]
    fn merge_joins_touching_spans() {
        let spans = vec![span(9, 0, 10, 0), span(10, 0, 11, 0), span(12, 0, 13, 0)];
        assert_eq!(
            merge_overlapping(&spans),
            vec![span(9, 0, 11, 0), span(12, 0, 13, 0)]
        );
    }

    #[test]
    fn saturated_basic() {
        let spans = vec![span(9, 0, 10, 0), span(9, 30, 10, 30)];
        assert_eq!(saturated_spans(&spans, 2), vec![span(9, 30, 10, 0)]);
        assert_eq!(saturated_spans(&spans, 1), vec![span(9, 0, 10, 30)]);
        assert!(saturated_spans(&spans, 3).is_empty());
    }

    #[test]
    fn saturated_handover_is_continuous_at_capacity_one() {
        let spans = vec![span(9, 0, 10, 0), span(10, 0, 11, 0)];
        assert_eq!(saturated_spans(&spans, 1), vec![span(9, 0, 11, 0)]);
    }

    #[test]
    fn saturated_empty() {
        assert!(saturated_spans(&[], 3).is_empty());
    }
}
