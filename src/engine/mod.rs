mod admission;
mod calendar;
mod error;
mod ledger;
mod lifecycle;
mod mutations;
mod policy;
mod queries;
mod store;

pub use admission::{
    Admission, AdmissionController, BookingRequest, Candidate, admit_in_transaction,
    evaluate_and_commit, local_now,
};
pub use calendar::{fits, open_spans};
pub use error::{EngineError, ForbiddenReason, PolicyRule};
pub use ledger::{
    admits, merge_overlapping, peak_occupancy, same_user_conflict, saturated_spans,
    subtract_intervals,
};
pub use lifecycle::{
    Transition, authorize, cancel_reservation, reassign_reservation, update_reservation,
    validate_reservation,
};
pub use policy::{AdmissionContext, Bypass, Outcome, PolicySet, Rule};
pub use store::{ReservationStore, ShopTransaction, StoreTransaction};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, broadcast, mpsc, oneshot};
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::config::Config;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::{self, Wal};

pub type SharedShopState = Arc<RwLock<ShopState>>;

// ── Group-commit WAL writer ──────────────────────────────

pub(crate) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL. Appends that queue up while a flush is
/// running are written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut deferred: Option<WalCommand> = None;
    loop {
        let cmd = match deferred.take() {
            Some(cmd) => cmd,
            None => match rx.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { event, response } => batch.push((event, response)),
                        other => {
                            // Keep ordering: flush what we have, then run it.
                            deferred = Some(other);
                            break;
                        }
                    }
                }
                flush_batch(&mut wal, batch);
            }
            WalCommand::Compact { events, response } => {
                let result = wal.compact(&events);
                if result.is_ok() {
                    metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
                }
                let _ = response.send(result);
            }
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(wal.appends_since_compact());
            }
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    // One failure fails the whole batch: nobody in it sees memory change, and
    // none of its bytes may survive into a later flush.
    if let Err(e) = &result {
        warn!(error = %e, events = batch.len(), "WAL batch failed, rolling back");
    }
    if result.is_err()
        && let Err(e) = wal.rollback()
    {
        error!(error = %e, "WAL rollback failed; refusing further appends");
        result = Err(e);
    }

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

// ── Journal ──────────────────────────────────────────────

/// Durable write path shared by the engine and its transactions:
/// WAL append, then in-memory apply, then notify.
#[derive(Clone)]
pub(crate) struct Journal {
    wal_tx: mpsc::Sender<WalCommand>,
    notify: Arc<NotifyHub>,
    /// Reverse lookup: reservation id → shop id.
    reservation_index: Arc<DashMap<Ulid, Ulid>>,
}

impl Journal {
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Caller holds the shop's write lock. Memory is untouched if the append fails.
    pub(crate) async fn persist_and_apply(
        &self,
        state: &mut ShopState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_shop(state, event, &self.reservation_index);
        self.notify.send(event);
        Ok(())
    }

    pub(crate) fn knows_reservation(&self, id: &Ulid) -> bool {
        self.reservation_index.contains_key(id)
    }
}

/// Apply a shop-scoped event. Caller holds the shop's write lock.
fn apply_to_shop(state: &mut ShopState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ShopUpdated { settings, .. } => {
            let shop = &mut state.shop;
            shop.name = settings.name.clone();
            shop.capacity = settings.capacity;
            shop.min_duration = settings.min_duration;
            shop.max_duration = settings.max_duration;
            shop.available_from = settings.available_from;
            shop.available_until = settings.available_until;
        }
        Event::WindowAdded { window, .. } => {
            state.shop.windows.push(window.clone());
        }
        Event::WindowUpdated { window, .. } => {
            if let Some(w) = state.shop.windows.iter_mut().find(|w| w.id == window.id) {
                *w = window.clone();
            }
        }
        Event::WindowRemoved { id, .. } => {
            state.shop.windows.retain(|w| w.id != *id);
        }
        Event::ReservationCreated { reservation } => {
            index.insert(reservation.id, reservation.shop_id);
            state.insert_reservation(reservation.clone());
        }
        Event::ReservationUpdated { reservation } => {
            state.remove_reservation(reservation.id);
            state.insert_reservation(reservation.clone());
        }
        Event::ReservationCancelled { id, .. } => {
            state.remove_reservation(*id);
            index.remove(id);
        }
        // Creation and deletion change the shop map, not a single shop's state.
        Event::ShopCreated { .. } | Event::ShopDeleted { .. } => {}
    }
}

// ── Engine ───────────────────────────────────────────────

/// In-memory shop/reservation store with one lock per shop, made durable by the WAL.
pub struct Engine {
    shops: DashMap<Ulid, SharedShopState>,
    journal: Journal,
    controller: AdmissionController,
    /// Serializes shop creation/deletion and WAL compaction.
    admin: Mutex<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_bytes > 0 {
            warn!(
                path = %wal_path.display(),
                bytes = replay.discarded_bytes,
                "discarded torn WAL tail"
            );
            wal::truncate_tail(&wal_path, replay.discarded_bytes)?;
        }

        // Rebuild without locks, then wrap.
        let index = Arc::new(DashMap::new());
        let mut states: HashMap<Ulid, ShopState> = HashMap::new();
        for event in &replay.events {
            match event {
                Event::ShopCreated { shop } => {
                    states.insert(shop.id, ShopState::new(shop.clone()));
                }
                Event::ShopDeleted { id } => {
                    if let Some(state) = states.remove(id) {
                        for r in &state.reservations {
                            index.remove(&r.id);
                        }
                    }
                }
                other => {
                    if let Some(state) = states.get_mut(&other.shop_id()) {
                        apply_to_shop(state, other, &index);
                    }
                }
            }
        }

        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let shops = DashMap::new();
        for (id, state) in states {
            shops.insert(id, Arc::new(RwLock::new(state)));
        }
        info!(
            shops = shops.len(),
            reservations = index.len(),
            events = replay.events.len(),
            "replayed WAL"
        );
        metrics::gauge!(observability::SHOPS_ACTIVE).set(shops.len() as f64);

        Ok(Self {
            shops,
            journal: Journal {
                wal_tx,
                notify,
                reservation_index: index,
            },
            controller: AdmissionController::default(),
            admin: Mutex::new(()),
        })
    }

    /// Open the engine for the configured data directory, creating it if needed.
    pub fn open(config: &Config) -> io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        Self::new(config.wal_path(), Arc::new(NotifyHub::new()))
    }

    /// Replace the admission policy set used by the convenience methods.
    pub fn with_controller(mut self, controller: AdmissionController) -> Self {
        self.controller = controller;
        self
    }

    pub fn controller(&self) -> &AdmissionController {
        &self.controller
    }

    /// Committed events of one shop, in commit order.
    pub fn subscribe(&self, shop_id: Ulid) -> broadcast::Receiver<Event> {
        self.journal.notify.subscribe(shop_id)
    }

    pub fn shop_count(&self) -> usize {
        self.shops.len()
    }

    pub(crate) fn get_shop_state(&self, id: &Ulid) -> Option<SharedShopState> {
        self.shops.get(id).map(|e| e.value().clone())
    }

    pub(crate) fn get_shop_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.journal
            .reservation_index
            .get(reservation_id)
            .map(|e| *e.value())
    }

    /// Acquire a shop's write lock. A shop deleted while we waited is gone.
    pub(crate) async fn lock_shop(
        &self,
        shop_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ShopState>, EngineError> {
        let state = self
            .get_shop_state(&shop_id)
            .ok_or(EngineError::NotFound(shop_id))?;
        let guard = state.write_owned().await;
        if guard.retired {
            return Err(EngineError::NotFound(shop_id));
        }
        Ok(guard)
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    ///
    /// Holds every shop's read lock while the snapshot is taken and written, so
    /// no commit can land in the old log after its shop was captured.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _admin = self.admin.lock().await;

        let states: Vec<SharedShopState> = self.shops.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(states.len());
        for state in states {
            guards.push(state.read_owned().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::ShopCreated {
                shop: guard.shop.clone(),
            });
            for reservation in &guard.reservations {
                events.push(Event::ReservationCreated {
                    reservation: reservation.clone(),
                });
            }
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.journal
            .wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        info!(events = count, "compacted WAL");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .journal
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
