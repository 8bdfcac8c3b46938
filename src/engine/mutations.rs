use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_against, today_ms, validate_actor, validate_span};
use super::{Engine, EngineError, SharedCabin, WalCommand, lock_live};

fn validate_details(details: &CabinDetails) -> Result<(), EngineError> {
    if details.address.len() > MAX_ADDRESS_LEN {
        return Err(EngineError::LimitExceeded("address too long"));
    }
    Ok(())
}

fn ensure_actor(owner: &str, id: Ulid, actor: &str) -> Result<(), EngineError> {
    if owner != actor {
        return Err(EngineError::Forbidden {
            id,
            actor: actor.to_string(),
        });
    }
    Ok(())
}

impl Engine {
    pub async fn create_cabin(
        &self,
        id: Ulid,
        owner: &str,
        details: CabinDetails,
    ) -> Result<(), EngineError> {
        validate_actor(owner)?;
        validate_details(&details)?;
        let _gate = self.commit_gate.read().await;
        let _create = self.cabin_create.lock().await;
        if self.cabins.len() >= MAX_CABINS {
            return Err(EngineError::LimitExceeded("too many cabins"));
        }
        if self.cabins.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::CabinCreated {
            id,
            owner: owner.to_string(),
            details,
        };
        self.commit(event, None, None).await
    }

    pub async fn update_cabin(
        &self,
        id: Ulid,
        actor: &str,
        patch: CabinPatch,
    ) -> Result<Cabin, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut cabin = lock_live(&self.cabins, &id).await?;
        ensure_actor(&cabin.cabin.owner, id, actor)?;

        let details = patch.apply(&cabin.cabin.details);
        validate_details(&details)?;
        let event = Event::CabinUpdated { id, details };
        self.commit(event, Some(&mut *cabin), None).await?;
        Ok(cabin.cabin.clone())
    }

    pub async fn delete_cabin(&self, id: Ulid, actor: &str) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut cabin = lock_live(&self.cabins, &id).await?;
        ensure_actor(&cabin.cabin.owner, id, actor)?;
        if !cabin.adverts.is_empty() {
            return Err(EngineError::HasChildren(id));
        }
        self.commit(Event::CabinDeleted { id }, Some(&mut *cabin), None)
            .await
    }

    /// List a cabin for rent. Only the cabin's owner may advertise it, and
    /// the new span must not touch any other advert of the same cabin.
    pub async fn list_advert(
        &self,
        id: Ulid,
        cabin_id: Ulid,
        actor: &str,
        price_per_day: u32,
        span: Span,
    ) -> Result<(), EngineError> {
        validate_actor(actor)?;
        validate_span(&span)?;
        let _gate = self.commit_gate.read().await;
        let _claim = self.claim_id(id, &self.advert_index)?;

        let mut cabin = lock_live(&self.cabins, &cabin_id).await?;
        ensure_actor(&cabin.cabin.owner, cabin_id, actor)?;
        if cabin.adverts.len() >= MAX_RESERVATIONS_PER_PARENT {
            return Err(EngineError::LimitExceeded("too many adverts on cabin"));
        }
        check_against(&*cabin, &span, None, today_ms())?;

        let event = Event::AdvertListed {
            id,
            cabin_id,
            price_per_day,
            span,
            created_by: actor.to_string(),
        };
        self.commit(event, Some(&mut *cabin), None).await
    }

    /// Change an advert's price and/or window. Missing bounds come from the
    /// stored advert; the window is only re-checked when a bound is given.
    pub async fn update_advert(
        &self,
        id: Ulid,
        actor: &str,
        patch: AdvertPatch,
    ) -> Result<Advert, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (mut cabin, mut advert_state) = self.lock_advert_for_write(&id).await?;
        let current = cabin
            .adverts
            .get(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        ensure_actor(&cabin.cabin.owner, id, actor)?;

        let span = patch.span.resolve(current.span);
        if !patch.span.is_empty() {
            validate_span(&span)?;
            check_against(&*cabin, &span, Some(id), today_ms())?;
            if let Some(stranded) = advert_state
                .bookings
                .iter()
                .find(|b| !span.contains_span(&b.span))
            {
                return Err(EngineError::WouldStrandBooking {
                    advert_id: id,
                    booking_id: stranded.id,
                });
            }
        }

        let updated = Advert {
            price_per_day: patch.price_per_day.unwrap_or(current.price_per_day),
            span,
            ..current
        };
        let event = Event::AdvertUpdated {
            id,
            cabin_id: updated.cabin_id,
            price_per_day: updated.price_per_day,
            span,
        };
        self.commit(event, Some(&mut *cabin), Some(&mut *advert_state))
            .await?;
        Ok(updated)
    }

    pub async fn withdraw_advert(&self, id: Ulid, actor: &str) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let (mut cabin, mut advert_state) = self.lock_advert_for_write(&id).await?;
        ensure_actor(&cabin.cabin.owner, id, actor)?;
        if !advert_state.bookings.is_empty() {
            return Err(EngineError::HasChildren(id));
        }
        let event = Event::AdvertWithdrawn {
            id,
            cabin_id: advert_state.cabin_id,
        };
        self.commit(event, Some(&mut *cabin), Some(&mut *advert_state))
            .await
    }

    /// Book `span` against an advert. The span must sit inside the advert's
    /// window and must not touch another booking of the same advert.
    pub async fn place_booking(
        &self,
        id: Ulid,
        advert_id: Ulid,
        actor: &str,
        span: Span,
    ) -> Result<(), EngineError> {
        validate_actor(actor)?;
        validate_span(&span)?;
        let _gate = self.commit_gate.read().await;
        let _claim = self.claim_id(id, &self.booking_index)?;

        let mut advert_state = lock_live(&self.adverts, &advert_id).await?;
        if advert_state.bookings.len() >= MAX_RESERVATIONS_PER_PARENT {
            return Err(EngineError::LimitExceeded("too many bookings on advert"));
        }
        check_against(&*advert_state, &span, None, today_ms())?;

        let event = Event::BookingPlaced {
            id,
            advert_id,
            booked_by: actor.to_string(),
            span,
        };
        self.commit(event, None, Some(&mut *advert_state)).await
    }

    pub async fn update_booking(
        &self,
        id: Ulid,
        actor: &str,
        patch: SpanPatch,
    ) -> Result<Booking, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut advert_state = self.lock_booking_for_write(&id).await?;
        let current = advert_state
            .bookings
            .get(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        ensure_actor(&current.booked_by, id, actor)?;
        if patch.is_empty() {
            return Ok(current);
        }

        let span = patch.resolve(current.span);
        validate_span(&span)?;
        check_against(&*advert_state, &span, Some(id), today_ms())?;

        let event = Event::BookingUpdated {
            id,
            advert_id: current.advert_id,
            span,
        };
        self.commit(event, None, Some(&mut *advert_state)).await?;
        Ok(Booking { span, ..current })
    }

    pub async fn cancel_booking(&self, id: Ulid, actor: &str) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut advert_state = self.lock_booking_for_write(&id).await?;
        let booking = advert_state
            .bookings
            .get(id)
            .ok_or(EngineError::NotFound(id))?;
        ensure_actor(&booking.booked_by, id, actor)?;
        let event = Event::BookingCancelled {
            id,
            advert_id: advert_state.id,
        };
        self.commit(event, None, Some(&mut *advert_state)).await
    }

    /// Rewrite the WAL as the minimal event sequence that rebuilds current
    /// state. Mutations are paused for the duration.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        let cabins: Vec<SharedCabin> = self.cabins.iter().map(|e| e.value().clone()).collect();
        for shared in cabins {
            let cabin = shared.read().await;
            events.push(Event::CabinCreated {
                id: cabin.cabin.id,
                owner: cabin.cabin.owner.clone(),
                details: cabin.cabin.details.clone(),
            });
            for advert in cabin.adverts.iter() {
                events.push(Event::AdvertListed {
                    id: advert.id,
                    cabin_id: advert.cabin_id,
                    price_per_day: advert.price_per_day,
                    span: advert.span,
                    created_by: advert.created_by.clone(),
                });
                let Some(advert_state) = self.get_advert_state(&advert.id) else {
                    continue;
                };
                let advert_state = advert_state.read().await;
                events.extend(advert_state.bookings.iter().map(|b| Event::BookingPlaced {
                    id: b.id,
                    advert_id: b.advert_id,
                    booked_by: b.booked_by.clone(),
                    span: b.span,
                }));
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
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
