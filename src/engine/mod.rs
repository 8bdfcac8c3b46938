mod conflict;
mod error;
mod mutations;
mod queries;
mod state;

pub use conflict::{check_window, Tier};
#[cfg(test)]
pub(crate) use conflict::today_ms;
pub use error::{EngineError, Rejection};
pub use state::{AdvertState, CabinState, Ledger, Parent};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedCabin = Arc<RwLock<CabinState>>;
pub type SharedAdvert = Arc<RwLock<AdvertState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Every append that is already queued when the first one
/// arrives joins its batch, and the whole batch shares one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL batch of {} failed: {e}", batch.len());
        // Every caller in this batch is told it failed, so none of its frames
        // may survive into the log.
        if let Err(e) = wal.rollback() {
            tracing::error!("WAL rollback failed: {e}");
        }
    }

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// In-memory booking ledger backed by the WAL.
///
/// Lock order is cabin → advert. Advert mutations hold the cabin write lock
/// (its adverts are the siblings); booking mutations hold the advert write
/// lock. Validation and commit happen inside that one critical section, so
/// two overlapping requests against the same parent can never both commit.
pub struct Engine {
    pub(super) cabins: DashMap<Ulid, SharedCabin>,
    pub(super) adverts: DashMap<Ulid, SharedAdvert>,
    /// advert id → cabin id
    pub(super) advert_index: DashMap<Ulid, Ulid>,
    /// booking id → advert id
    pub(super) booking_index: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Advert and booking ids whose create is still in flight.
    pub(super) pending_ids: DashMap<Ulid, ()>,
    /// Serializes cabin creation so the id and count checks hold until commit.
    pub(super) cabin_create: Mutex<()>,
    /// Mutations hold it shared; compaction holds it exclusively while it
    /// snapshots state and swaps the log.
    pub(super) commit_gate: RwLock<()>,
}

/// A client-chosen id held from validation until commit. Dropping it
/// releases the id; a committed create has put it in its index by then.
pub(super) struct IdClaim<'a> {
    pending: &'a DashMap<Ulid, ()>,
    id: Ulid,
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            cabins: DashMap::new(),
            adverts: DashMap::new(),
            advert_index: DashMap::new(),
            booking_index: DashMap::new(),
            pending_ids: DashMap::new(),
            cabin_create: Mutex::new(()),
            wal_tx,
            commit_gate: RwLock::new(()),
        };

        // We are the sole owner of every lock here, so try_write always
        // succeeds. Never block: this can run inside an async context.
        for event in &events {
            let cabin = event_cabin_id(event).and_then(|id| engine.get_cabin_state(&id));
            let advert = event_advert_id(event).and_then(|id| engine.get_advert_state(&id));
            let mut cabin_guard = cabin.as_ref().and_then(|c| c.try_write().ok());
            let mut advert_guard = advert.as_ref().and_then(|a| a.try_write().ok());
            engine.apply(event, cabin_guard.as_deref_mut(), advert_guard.as_deref_mut());
        }
        tracing::debug!("replayed {} WAL events", events.len());

        Ok(engine)
    }

    /// Reserve `id` for a create. Fails if it is already committed in
    /// `index` or another create holds it.
    pub(super) fn claim_id<V>(
        &self,
        id: Ulid,
        index: &DashMap<Ulid, V>,
    ) -> Result<IdClaim<'_>, EngineError> {
        match self.pending_ids.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                if index.contains_key(&id) {
                    return Err(EngineError::AlreadyExists(id));
                }
                slot.insert(());
                Ok(IdClaim {
                    pending: &self.pending_ids,
                    id,
                })
            }
        }
    }

    pub(super) fn get_cabin_state(&self, id: &Ulid) -> Option<SharedCabin> {
        self.cabins.get(id).map(|e| e.value().clone())
    }

    pub(super) fn get_advert_state(&self, id: &Ulid) -> Option<SharedAdvert> {
        self.adverts.get(id).map(|e| e.value().clone())
    }

    /// Apply an event to in-memory state. The caller holds the write locks
    /// for whichever of `cabin` / `advert` the event touches.
    pub(super) fn apply(
        &self,
        event: &Event,
        cabin: Option<&mut CabinState>,
        advert: Option<&mut AdvertState>,
    ) {
        match event {
            Event::CabinCreated { id, owner, details } => {
                let cabin = Cabin {
                    id: *id,
                    owner: owner.clone(),
                    details: details.clone(),
                };
                self.cabins
                    .insert(*id, Arc::new(RwLock::new(CabinState::new(cabin))));
            }
            Event::CabinUpdated { details, .. } => {
                if let Some(cs) = cabin {
                    cs.cabin.details = details.clone();
                }
            }
            Event::CabinDeleted { id } => {
                self.cabins.remove(id);
            }
            Event::AdvertListed {
                id,
                cabin_id,
                price_per_day,
                span,
                created_by,
            } => {
                if let Some(cs) = cabin {
                    cs.adverts.insert(Advert {
                        id: *id,
                        cabin_id: *cabin_id,
                        price_per_day: *price_per_day,
                        span: *span,
                        created_by: created_by.clone(),
                    });
                }
                self.adverts.insert(
                    *id,
                    Arc::new(RwLock::new(AdvertState::new(*id, *cabin_id, *span))),
                );
                self.advert_index.insert(*id, *cabin_id);
            }
            Event::AdvertUpdated {
                id,
                price_per_day,
                span,
                ..
            } => {
                if let Some(cs) = cabin
                    && let Some(mut advert) = cs.adverts.remove(*id)
                {
                    advert.price_per_day = *price_per_day;
                    advert.span = *span;
                    cs.adverts.insert(advert);
                }
                if let Some(st) = advert {
                    st.window = *span;
                }
            }
            Event::AdvertWithdrawn { id, .. } => {
                if let Some(cs) = cabin {
                    cs.adverts.remove(*id);
                }
                self.adverts.remove(id);
                self.advert_index.remove(id);
            }
            Event::BookingPlaced {
                id,
                advert_id,
                booked_by,
                span,
            } => {
                if let Some(st) = advert {
                    st.bookings.insert(Booking {
                        id: *id,
                        advert_id: *advert_id,
                        booked_by: booked_by.clone(),
                        span: *span,
                    });
                }
                self.booking_index.insert(*id, *advert_id);
            }
            Event::BookingUpdated { id, span, .. } => {
                if let Some(st) = advert
                    && let Some(mut booking) = st.bookings.remove(*id)
                {
                    booking.span = *span;
                    st.bookings.insert(booking);
                }
            }
            Event::BookingCancelled { id, .. } => {
                if let Some(st) = advert {
                    st.bookings.remove(*id);
                }
                self.booking_index.remove(id);
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
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

    /// WAL-append, then apply. Nothing is applied if the append fails.
    pub(super) async fn commit(
        &self,
        event: Event,
        cabin: Option<&mut CabinState>,
        advert: Option<&mut AdvertState>,
    ) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.apply(&event, cabin, advert);
        tracing::debug!(?event, "committed");
        Ok(())
    }

    /// Resolve an advert to its cabin and take the cabin write lock, then the
    /// advert write lock.
    pub(super) async fn lock_advert_for_write(
        &self,
        advert_id: &Ulid,
    ) -> Result<(OwnedRwLockWriteGuard<CabinState>, OwnedRwLockWriteGuard<AdvertState>), EngineError>
    {
        let cabin_id = self
            .advert_index
            .get(advert_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*advert_id))?;
        let cabin_guard = lock_live(&self.cabins, &cabin_id).await?;
        // Adverts are only withdrawn under the cabin lock, so this lookup is current.
        let advert_guard = lock_live(&self.adverts, advert_id).await?;
        Ok((cabin_guard, advert_guard))
    }

    /// Resolve a booking to its advert and take the advert write lock.
    pub(super) async fn lock_booking_for_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<AdvertState>, EngineError> {
        let advert_id = self
            .booking_index
            .get(booking_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*booking_id))?;
        let guard = lock_live(&self.adverts, &advert_id).await?;
        if guard.bookings.get(*booking_id).is_none() {
            return Err(EngineError::NotFound(*booking_id));
        }
        Ok(guard)
    }
}

/// Take the write lock on `id`'s state and confirm it is still the live
/// entry. A state removed while we waited for its lock reports NotFound.
pub(super) async fn lock_live<T>(
    map: &DashMap<Ulid, Arc<RwLock<T>>>,
    id: &Ulid,
) -> Result<OwnedRwLockWriteGuard<T>, EngineError> {
    let shared = map
        .get(id)
        .map(|e| e.value().clone())
        .ok_or(EngineError::NotFound(*id))?;
    let guard = shared.clone().write_owned().await;
    let live = map.get(id).is_some_and(|e| Arc::ptr_eq(e.value(), &shared));
    if !live {
        return Err(EngineError::NotFound(*id));
    }
    Ok(guard)
}

/// The cabin whose lock an event needs during replay, if any.
fn event_cabin_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::CabinUpdated { id, .. } => Some(*id),
        Event::AdvertListed { cabin_id, .. }
        | Event::AdvertUpdated { cabin_id, .. }
        | Event::AdvertWithdrawn { cabin_id, .. } => Some(*cabin_id),
        _ => None,
    }
}

/// The advert whose lock an event needs during replay, if any.
fn event_advert_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::AdvertUpdated { id, .. } => Some(*id),
        Event::BookingPlaced { advert_id, .. }
        | Event::BookingUpdated { advert_id, .. }
        | Event::BookingCancelled { advert_id, .. } => Some(*advert_id),
        _ => None,
    }
}
