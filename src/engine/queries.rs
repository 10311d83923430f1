use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use ulid::Ulid;

use crate::model::*;

use super::admission::local_now;
use super::calendar::open_spans;
use super::ledger::{saturated_spans, subtract_intervals};
use super::{Engine, EngineError};

fn day_span(date: NaiveDate) -> Result<Span, EngineError> {
    let next = date
        .succ_opt()
        .ok_or(EngineError::InvalidArgument("date out of range"))?;
    Ok(Span::new(
        date.and_time(NaiveTime::MIN),
        next.and_time(NaiveTime::MIN),
    ))
}

fn require_monday(date: NaiveDate) -> Result<(), EngineError> {
    if date.weekday() != Weekday::Mon {
        return Err(EngineError::InvalidArgument("week must start on a Monday"));
    }
    Ok(())
}

impl Engine {
    pub async fn get_shop(&self, id: Ulid) -> Result<Shop, EngineError> {
        let state = self.get_shop_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = state.read().await;
        if guard.retired {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard.shop.clone())
    }

    /// All shops, oldest first.
    pub async fn list_shops(&self) -> Vec<Shop> {
        let states: Vec<_> = self.shops.iter().map(|e| e.value().clone()).collect();
        let mut shops = Vec::with_capacity(states.len());
        for state in states {
            let guard = state.read().await;
            if !guard.retired {
                shops.push(guard.shop.clone());
            }
        }
        shops.sort_by_key(|s| s.id);
        shops
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let shop_id = self
            .get_shop_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let state = self
            .get_shop_state(&shop_id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = state.read().await;
        guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Seven days of reservations starting at `monday`, grouped by start date.
    /// Other people's names are visible to privileged viewers only.
    pub async fn planning(
        &self,
        shop_id: Ulid,
        monday: NaiveDate,
        viewer: &Actor,
    ) -> Result<Vec<DayPlan>, EngineError> {
        require_monday(monday)?;
        let state = self
            .get_shop_state(&shop_id)
            .ok_or(EngineError::NotFound(shop_id))?;
        let guard = state.read().await;
        if guard.retired {
            return Err(EngineError::NotFound(shop_id));
        }

        let mut days = Vec::with_capacity(7);
        for date in monday.iter_days().take(7) {
            days.push(DayPlan {
                date,
                slots: guard
                    .reservations
                    .iter()
                    .filter(|r| r.span.start.date() == date)
                    .map(|r| PlannedSlot::view(r, viewer))
                    .collect(),
            });
        }
        Ok(days)
    }

    /// Bookable stretches of `date`: open hours from `available_from` on,
    /// minus wherever the shop is already full, keeping stretches that start
    /// no later than `available_until`. Stretches shorter than
    /// `min_duration` minutes (default: the shop's minimum) are dropped.
    pub async fn free_spans(
        &self,
        shop_id: Ulid,
        date: NaiveDate,
        min_duration: Option<u32>,
    ) -> Result<Vec<Span>, EngineError> {
        let day = day_span(date)?;
        let state = self
            .get_shop_state(&shop_id)
            .ok_or(EngineError::NotFound(shop_id))?;
        let guard = state.read().await;
        if guard.retired {
            return Err(EngineError::NotFound(shop_id));
        }
        let shop = &guard.shop;

        let open: Vec<Span> = open_spans(shop, date)
            .into_iter()
            .filter_map(|s| {
                let start = s.start.max(shop.available_from);
                (start < s.end).then(|| Span::new(start, s.end))
            })
            .collect();

        let taken: Vec<Span> = guard.overlapping(&day).map(|r| r.span).collect();
        let full = saturated_spans(&taken, shop.capacity);
        let min = i64::from(min_duration.unwrap_or(shop.min_duration));

        // Only the start has to fall inside the validity window.
        Ok(subtract_intervals(&open, &full)
            .into_iter()
            .filter(|s| s.start <= shop.available_until && s.duration_minutes() >= min)
            .collect())
    }

    /// A user's reservations across all shops, by start. With `upcoming_only`,
    /// reservations that already ended are left out.
    pub async fn reservations_for_user(&self, user_id: Ulid, upcoming_only: bool) -> Vec<Reservation> {
        let now = local_now();
        let mut found = self
            .collect_reservations(None, |r| {
                r.user_id == user_id && (!upcoming_only || r.span.end > now)
            })
            .await;
        found.sort_by_key(|r| r.span.start);
        found
    }

    /// Reservations matching every field set in `filter`, by start.
    pub async fn search(&self, filter: &SearchFilter) -> Result<Vec<Reservation>, EngineError> {
        let week = match filter.week_of {
            Some(monday) => {
                require_monday(monday)?;
                let end = monday
                    .checked_add_days(chrono::Days::new(7))
                    .ok_or(EngineError::InvalidArgument("date out of range"))?;
                Some((monday, end))
            }
            None => None,
        };

        let mut found = self
            .collect_reservations(filter.shop_id, |r| {
                filter.user_id.is_none_or(|u| r.user_id == u)
                    && week.is_none_or(|(from, to)| {
                        let d = r.span.start.date();
                        from <= d && d < to
                    })
            })
            .await;
        found.sort_by_key(|r| r.span.start);
        Ok(found)
    }

    async fn collect_reservations(
        &self,
        shop_id: Option<Ulid>,
        keep: impl Fn(&Reservation) -> bool,
    ) -> Vec<Reservation> {
        let states: Vec<_> = match shop_id {
            Some(id) => self.get_shop_state(&id).into_iter().collect(),
            None => self.shops.iter().map(|e| e.value().clone()).collect(),
        };
        let mut found = Vec::new();
        for state in states {
            let guard = state.read().await;
            if guard.retired {
                continue;
            }
            found.extend(guard.reservations.iter().filter(|&r| keep(r)).cloned());
        }
        found
    }
}
