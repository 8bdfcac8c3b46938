use ulid::Ulid;

use crate::model::*;

use super::conflict::{check_against, today_ms, validate_span};
use super::{Engine, EngineError, SharedAdvert, SharedCabin};

impl Engine {
    /// Would `proposed` be accepted as an advert window on `cabin_id`?
    /// Read-only: nothing is reserved by a passing check.
    pub async fn validate_advert_window(
        &self,
        cabin_id: Ulid,
        proposed: Span,
        exclude: Option<Ulid>,
    ) -> Result<(), EngineError> {
        validate_span(&proposed)?;
        let shared = self
            .get_cabin_state(&cabin_id)
            .ok_or(EngineError::NotFound(cabin_id))?;
        let cabin = shared.read().await;
        if let Some(ex) = exclude
            && cabin.adverts.get(ex).is_none()
        {
            return Err(EngineError::NotFound(ex));
        }
        check_against(&*cabin, &proposed, exclude, today_ms())
    }

    /// Would `proposed` be accepted as a booking on `advert_id`?
    pub async fn validate_booking_window(
        &self,
        advert_id: Ulid,
        proposed: Span,
        exclude: Option<Ulid>,
    ) -> Result<(), EngineError> {
        validate_span(&proposed)?;
        let shared = self
            .get_advert_state(&advert_id)
            .ok_or(EngineError::NotFound(advert_id))?;
        let advert = shared.read().await;
        if let Some(ex) = exclude
            && advert.bookings.get(ex).is_none()
        {
            return Err(EngineError::NotFound(ex));
        }
        check_against(&*advert, &proposed, exclude, today_ms())
    }

    pub async fn get_cabin(&self, id: Ulid) -> Result<Cabin, EngineError> {
        let shared = self.get_cabin_state(&id).ok_or(EngineError::NotFound(id))?;
        let cabin = shared.read().await;
        Ok(cabin.cabin.clone())
    }

    pub async fn list_cabins(&self) -> Vec<Cabin> {
        let shared: Vec<SharedCabin> = self.cabins.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(shared.len());
        for cabin in shared {
            out.push(cabin.read().await.cabin.clone());
        }
        out.sort_by_key(|c| c.id);
        out
    }

    pub async fn get_advert(&self, id: Ulid) -> Result<Advert, EngineError> {
        let cabin_id = self
            .advert_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let shared = self
            .get_cabin_state(&cabin_id)
            .ok_or(EngineError::NotFound(id))?;
        let cabin = shared.read().await;
        cabin.adverts.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Adverts of one cabin in start order, or every advert when `cabin_id`
    /// is `None`.
    pub async fn list_adverts(&self, cabin_id: Option<Ulid>) -> Result<Vec<Advert>, EngineError> {
        let shared: Vec<SharedCabin> = match cabin_id {
            Some(id) => vec![self.get_cabin_state(&id).ok_or(EngineError::NotFound(id))?],
            None => self.cabins.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::new();
        for cabin in shared {
            let cabin = cabin.read().await;
            out.extend(cabin.adverts.iter().cloned());
        }
        if cabin_id.is_none() {
            out.sort_by_key(|a| (a.cabin_id, a.span.start));
        }
        Ok(out)
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let advert_id = self
            .booking_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let shared = self
            .get_advert_state(&advert_id)
            .ok_or(EngineError::NotFound(id))?;
        let advert = shared.read().await;
        advert.bookings.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn list_bookings(
        &self,
        advert_id: Option<Ulid>,
    ) -> Result<Vec<Booking>, EngineError> {
        let shared: Vec<SharedAdvert> = match advert_id {
            Some(id) => vec![self.get_advert_state(&id).ok_or(EngineError::NotFound(id))?],
            None => self.adverts.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::new();
        for advert in shared {
            let advert = advert.read().await;
            out.extend(advert.bookings.iter().cloned());
        }
        if advert_id.is_none() {
            out.sort_by_key(|b| (b.advert_id, b.span.start));
        }
        Ok(out)
    }
}
