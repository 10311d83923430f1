use std::sync::Arc;

use chrono::{NaiveTime, Weekday};
use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::admission::{BookingRequest, evaluate_and_commit, local_now};
use super::{Engine, EngineError, lifecycle};

fn validate_settings(settings: &ShopSettings) -> Result<(), EngineError> {
    if settings.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("shop name too long"));
    }
    if settings.capacity == 0 {
        return Err(EngineError::InvalidShop("capacity must be at least 1"));
    }
    if settings.min_duration == 0 {
        return Err(EngineError::InvalidShop("min_duration must be positive"));
    }
    if settings.min_duration > settings.max_duration {
        return Err(EngineError::InvalidShop("min_duration exceeds max_duration"));
    }
    if settings.available_from > settings.available_until {
        return Err(EngineError::InvalidShop(
            "available_from is after available_until",
        ));
    }
    Ok(())
}

impl Engine {
    // ── Shop administration ──────────────────────────────

    pub async fn create_shop(&self, id: Ulid, settings: ShopSettings) -> Result<Shop, EngineError> {
        validate_settings(&settings)?;
        let _admin = self.admin.lock().await;
        if self.shops.len() >= MAX_SHOPS {
            return Err(EngineError::LimitExceeded("too many shops"));
        }
        if self.shops.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let shop = Shop {
            id,
            name: settings.name,
            capacity: settings.capacity,
            min_duration: settings.min_duration,
            max_duration: settings.max_duration,
            available_from: settings.available_from,
            available_until: settings.available_until,
            windows: Vec::new(),
        };
        let event = Event::ShopCreated { shop: shop.clone() };
        self.journal.wal_append(&event).await?;
        self.shops
            .insert(id, Arc::new(RwLock::new(ShopState::new(shop.clone()))));
        self.journal.notify.send(&event);

        metrics::gauge!(observability::SHOPS_ACTIVE).set(self.shops.len() as f64);
        info!(shop = %id, name = %shop.name, capacity = shop.capacity, "shop created");
        Ok(shop)
    }

    /// Change a shop's settings. Existing reservations are kept as they are.
    pub async fn update_shop(&self, id: Ulid, settings: ShopSettings) -> Result<Shop, EngineError> {
        validate_settings(&settings)?;
        let mut guard = self.lock_shop(id).await?;
        let event = Event::ShopUpdated { id, settings };
        self.journal.persist_and_apply(&mut guard, &event).await?;
        Ok(guard.shop.clone())
    }

    /// Delete a shop together with all its reservations.
    pub async fn delete_shop(&self, id: Ulid) -> Result<(), EngineError> {
        let _admin = self.admin.lock().await;
        let mut guard = self.lock_shop(id).await?;

        let event = Event::ShopDeleted { id };
        self.journal.wal_append(&event).await?;
        guard.retired = true;
        for r in &guard.reservations {
            self.journal.reservation_index.remove(&r.id);
        }
        let dropped = guard.reservations.len();
        drop(guard);
        self.shops.remove(&id);
        self.journal.notify.send(&event);

        metrics::gauge!(observability::SHOPS_ACTIVE).set(self.shops.len() as f64);
        info!(shop = %id, reservations = dropped, "shop deleted");
        Ok(())
    }

    /// Add a weekly opening window. It must not overlap another window of the same day.
    pub async fn add_window(
        &self,
        shop_id: Ulid,
        weekday: Weekday,
        start_time: NaiveTime,
        end_time: NaiveTime,
    ) -> Result<OpeningWindow, EngineError> {
        if start_time >= end_time {
            return Err(EngineError::InvalidWindow("start_time must be before end_time"));
        }
        let window = OpeningWindow::new(weekday, start_time, end_time);

        let mut guard = self.lock_shop(shop_id).await?;
        if guard.shop.windows.len() >= MAX_WINDOWS_PER_SHOP {
            return Err(EngineError::LimitExceeded("too many opening windows on shop"));
        }
        if guard
            .shop
            .windows
            .iter()
            .any(|w| w.is_enabled() && w.overlaps(&window))
        {
            return Err(EngineError::InvalidWindow("overlaps an existing window"));
        }

        let event = Event::WindowAdded {
            shop_id,
            window: window.clone(),
        };
        self.journal.persist_and_apply(&mut guard, &event).await?;
        Ok(window)
    }

    /// Replace a window's fields. No overlap or ordering check: a window
    /// with `start_time >= end_time` is stored and stays disabled.
    pub async fn update_window(
        &self,
        shop_id: Ulid,
        window: OpeningWindow,
    ) -> Result<(), EngineError> {
        let mut guard = self.lock_shop(shop_id).await?;
        if !guard.shop.windows.iter().any(|w| w.id == window.id) {
            return Err(EngineError::NotFound(window.id));
        }
        let event = Event::WindowUpdated { shop_id, window };
        self.journal.persist_and_apply(&mut guard, &event).await
    }

    pub async fn remove_window(&self, shop_id: Ulid, id: Ulid) -> Result<(), EngineError> {
        let mut guard = self.lock_shop(shop_id).await?;
        if !guard.shop.windows.iter().any(|w| w.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::WindowRemoved { shop_id, id };
        self.journal.persist_and_apply(&mut guard, &event).await
    }

    // ── Reservations, against the wall clock ─────────────

    pub async fn book(
        &self,
        request: BookingRequest,
        actor: &Actor,
    ) -> Result<Reservation, EngineError> {
        evaluate_and_commit(self, &self.controller, request, actor, local_now()).await
    }

    pub async fn update_reservation(
        &self,
        id: Ulid,
        start: Ts,
        duration_minutes: i64,
        actor: &Actor,
    ) -> Result<Reservation, EngineError> {
        lifecycle::update_reservation(
            self,
            &self.controller,
            id,
            start,
            duration_minutes,
            actor,
            local_now(),
        )
        .await
    }

    pub async fn cancel_reservation(
        &self,
        id: Ulid,
        actor: &Actor,
    ) -> Result<Reservation, EngineError> {
        lifecycle::cancel_reservation(self, id, actor).await
    }

    pub async fn validate_reservation(
        &self,
        id: Ulid,
        actor: &Actor,
    ) -> Result<Reservation, EngineError> {
        lifecycle::validate_reservation(self, id, actor, local_now()).await
    }

    pub async fn reassign_reservation(
        &self,
        id: Ulid,
        new_user: Ulid,
        actor: &Actor,
    ) -> Result<Reservation, EngineError> {
        lifecycle::reassign_reservation(self, &self.controller, id, new_user, actor, local_now())
            .await
    }
}
