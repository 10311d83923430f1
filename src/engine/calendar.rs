use chrono::{Datelike, NaiveDate};

use crate::model::*;

/// Does `span` fit entirely inside one enabled opening window of its weekday?
///
/// The span must start and end on the same calendar date, so anything
/// crossing midnight is rejected even when both halves are open.
/// Windows with `start_time >= end_time` are disabled and never match.
pub fn fits(shop: &Shop, span: &Span) -> bool {
    if span.start.date() != span.end.date() {
        return false;
    }
    let weekday = span.start.weekday();
    let (start, end) = (span.start.time(), span.end.time());
    shop.windows.iter().any(|w| {
        w.weekday == weekday && w.is_enabled() && w.start_time <= start && end <= w.end_time
    })
}

/// Enabled windows for `date`'s weekday as concrete spans, sorted by start.
/// Back-to-back windows stay separate: a booking cannot straddle them.
pub fn open_spans(shop: &Shop, date: NaiveDate) -> Vec<Span> {
    let weekday = date.weekday();
    let mut spans: Vec<Span> = shop
        .windows
        .iter()
        .filter(|w| w.weekday == weekday && w.is_enabled())
        .map(|w| Span::new(date.and_time(w.start_time), date.and_time(w.end_time)))
        .collect();
    spans.sort_by_key(|s| s.start);
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, Weekday};
    use ulid::Ulid;

    // 2030-01-07 is a Monday.
    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 1, 7).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn at(date: NaiveDate, h: u32, m: u32) -> Ts {
        date.and_time(t(h, m))
    }

    fn shop_with(windows: Vec<OpeningWindow>) -> Shop {
        Shop {
            id: Ulid::new(),
            name: "Recyclerie".into(),
            capacity: 2,
            min_duration: 30,
            max_duration: 240,
            available_from: at(monday(), 0, 0),
            available_until: at(monday(), 0, 0) + chrono::Duration::days(30),
            windows,
        }
    }

    #[test]
    fn inside_window_fits() {
        let shop = shop_with(vec![OpeningWindow::new(Weekday::Mon, t(9, 0), t(12, 0))]);
        let d = monday();
        assert!(fits(&shop, &Span::new(at(d, 9, 0), at(d, 12, 0))));
        assert!(fits(&shop, &Span::new(at(d, 10, 0), at(d, 11, 0))));
    }

    #[test]
    fn sticking_out_does_not_fit() {
        let shop = shop_with(vec![OpeningWindow::new(Weekday::Mon, t(9, 0), t(12, 0))]);
        let d = monday();
        assert!(!fits(&shop, &Span::new(at(d, 8, 0), at(d, 9, 0))));
        assert!(!fits(&shop, &Span::new(at(d, 8, 59), at(d, 10, 0))));
        assert!(!fits(&shop, &Span::new(at(d, 11, 30), at(d, 12, 1))));
    }

    #[test]
    fn wrong_weekday_does_not_fit() {
        let shop = shop_with(vec![OpeningWindow::new(Weekday::Tue, t(9, 0), t(12, 0))]);
        let d = monday();
        assert!(!fits(&shop, &Span::new(at(d, 9, 0), at(d, 10, 0))));
        let tue = d.succ_opt().unwrap();
        assert!(fits(&shop, &Span::new(at(tue, 9, 0), at(tue, 10, 0))));
    }

    #[test]
    fn must_fit_a_single_window() {
        // Two back-to-back windows do not combine into one.
        let shop = shop_with(vec![
            OpeningWindow::new(Weekday::Mon, t(9, 0), t(10, 0)),
            OpeningWindow::new(Weekday::Mon, t(10, 0), t(11, 0)),
        ]);
        let d = monday();
        assert!(!fits(&shop, &Span::new(at(d, 9, 30), at(d, 10, 30))));
        assert!(fits(&shop, &Span::new(at(d, 10, 0), at(d, 10, 30))));
    }

    #[test]
    fn disabled_window_is_ignored() {
        // start > end is not read as an overnight window.
        let shop = shop_with(vec![OpeningWindow::new(Weekday::Mon, t(22, 0), t(6, 0))]);
        let d = monday();
        assert!(!fits(&shop, &Span::new(at(d, 22, 30), at(d, 23, 0))));
        assert!(!fits(&shop, &Span::new(at(d, 1, 0), at(d, 2, 0))));

        let empty = shop_with(vec![OpeningWindow::new(Weekday::Mon, t(9, 0), t(9, 0))]);
        assert!(!fits(&empty, &Span::new(at(d, 9, 0), at(d, 9, 30))));
    }

    #[test]
    fn crossing_midnight_never_fits() {
        let shop = shop_with(vec![
            OpeningWindow::new(Weekday::Mon, t(0, 0), t(23, 59)),
            OpeningWindow::new(Weekday::Tue, t(0, 0), t(23, 59)),
        ]);
        let d = monday();
        let tue = d.succ_opt().unwrap();
        assert!(!fits(&shop, &Span::new(at(d, 23, 30), at(tue, 0, 30))));
        assert!(!fits(&shop, &Span::new(at(d, 23, 0), at(tue, 0, 0))));
    }

    #[test]
    fn open_spans_sorted_and_skips_disabled() {
        let shop = shop_with(vec![
            OpeningWindow::new(Weekday::Mon, t(14, 0), t(17, 0)),
            OpeningWindow::new(Weekday::Mon, t(9, 0), t(12, 0)),
            OpeningWindow::new(Weekday::Mon, t(12, 0), t(13, 0)),
            OpeningWindow::new(Weekday::Mon, t(20, 0), t(18, 0)),
            OpeningWindow::new(Weekday::Wed, t(9, 0), t(12, 0)),
        ]);
        let d = monday();
        assert_eq!(
            open_spans(&shop, d),
            vec![
                Span::new(at(d, 9, 0), at(d, 12, 0)),
                Span::new(at(d, 12, 0), at(d, 13, 0)),
                Span::new(at(d, 14, 0), at(d, 17, 0)),
            ]
        );
        assert!(open_spans(&shop, d.succ_opt().unwrap()).is_empty());
    }
}
