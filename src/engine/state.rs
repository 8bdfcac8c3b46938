use ulid::Ulid;

use crate::model::*;

use super::conflict::Tier;

/// Reservations under one parent, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct Ledger<R> {
    entries: Vec<R>,
}

impl<R> Default for Ledger<R> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<R: Reservation> Ledger<R> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.entries.iter()
    }

    pub fn get(&self, id: Ulid) -> Option<&R> {
        self.entries.iter().find(|r| r.id() == id)
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, reservation: R) {
        let start = reservation.span().start;
        let pos = self.entries.partition_point(|r| r.span().start <= start);
        self.entries.insert(pos, reservation);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<R> {
        let pos = self.entries.iter().position(|r| r.id() == id)?;
        Some(self.entries.remove(pos))
    }

    /// Siblings sharing an instant with `query`, minus `exclude`.
    /// Everything at or past the partition point starts after `query.end`.
    pub fn overlapping<'a>(
        &'a self,
        query: &'a Span,
        exclude: Option<Ulid>,
    ) -> impl Iterator<Item = &'a R> + 'a {
        let right_bound = self.entries.partition_point(|r| r.span().start <= query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |r| Some(r.id()) != exclude)
            .filter(move |r| r.span().overlaps(query))
    }
}

/// A resource that bounds child reservations.
pub trait Parent {
    type Child: Reservation;

    /// Which window rules apply to this parent's children.
    const TIER: Tier;

    fn id(&self) -> Ulid;

    /// Outer bound for children, if the parent has one.
    fn bounding_window(&self) -> Option<Span>;

    fn children(&self) -> &Ledger<Self::Child>;
}

#[derive(Debug, Clone)]
pub struct CabinState {
    pub cabin: Cabin,
    pub adverts: Ledger<Advert>,
}

impl CabinState {
    pub fn new(cabin: Cabin) -> Self {
        Self {
            cabin,
            adverts: Ledger::default(),
        }
    }
}

impl Parent for CabinState {
    type Child = Advert;
    const TIER: Tier = Tier::Advert;

    fn id(&self) -> Ulid {
        self.cabin.id
    }

    fn bounding_window(&self) -> Option<Span> {
        None
    }

    fn children(&self) -> &Ledger<Advert> {
        &self.adverts
    }
}

/// Booking-side view of an advert. The advert record itself lives in its
/// cabin's ledger; `window` mirrors its span.
#[derive(Debug, Clone)]
pub struct AdvertState {
    pub id: Ulid,
    pub cabin_id: Ulid,
    pub window: Span,
    pub bookings: Ledger<Booking>,
}

impl AdvertState {
    pub fn new(id: Ulid, cabin_id: Ulid, window: Span) -> Self {
        Self {
            id,
            cabin_id,
            window,
            bookings: Ledger::default(),
        }
    }
}

impl Parent for AdvertState {
    type Child = Booking;
    const TIER: Tier = Tier::Booking;

    fn id(&self) -> Ulid {
        self.id
    }

    fn bounding_window(&self) -> Option<Span> {
        Some(self.window)
    }

    fn children(&self) -> &Ledger<Booking> {
        &self.bookings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(start: Ms, end: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            advert_id: Ulid::nil(),
            booked_by: "ola".into(),
            span: Span::new(start, end),
        }
    }

    #[test]
    fn ledger_keeps_start_order() {
        let mut ledger = Ledger::default();
        ledger.insert(booking(300, 400));
        ledger.insert(booking(100, 200));
        ledger.insert(booking(201, 299));
        let starts: Vec<Ms> = ledger.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 201, 300]);
    }

    #[test]
    fn ledger_remove() {
        let mut ledger = Ledger::default();
        let b = booking(100, 200);
        let id = b.id;
        ledger.insert(b);
        ledger.insert(booking(300, 400));
        assert_eq!(ledger.remove(id).map(|b| b.id), Some(id));
        assert_eq!(ledger.len(), 1);
        assert!(ledger.remove(Ulid::new()).is_none());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn overlapping_includes_touching_neighbours() {
        let mut ledger = Ledger::default();
        ledger.insert(booking(0, 100));
        ledger.insert(booking(200, 300));
        ledger.insert(booking(301, 400));

        let query = Span::new(100, 200);
        let hits: Vec<Span> = ledger.overlapping(&query, None).map(|b| b.span).collect();
        assert_eq!(hits, vec![Span::new(0, 100), Span::new(200, 300)]);
    }

    #[test]
    fn overlapping_skips_excluded() {
        let mut ledger = Ledger::default();
        let own = booking(50, 150);
        let own_id = own.id;
        ledger.insert(own);

        let query = Span::new(60, 140);
        assert_eq!(ledger.overlapping(&query, None).count(), 1);
        assert_eq!(ledger.overlapping(&query, Some(own_id)).count(), 0);
    }

    #[test]
    fn overlapping_finds_long_earlier_reservation() {
        let mut ledger = Ledger::default();
        ledger.insert(booking(0, 10_000));
        ledger.insert(booking(20_000, 30_000));
        let query = Span::new(5_000, 6_000);
        let hits: Vec<_> = ledger.overlapping(&query, None).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(0, 10_000));
    }

    #[test]
    fn parents_report_their_tier_and_window() {
        let cabin = CabinState::new(Cabin {
            id: Ulid::new(),
            owner: "ola".into(),
            details: CabinDetails {
                address: "Strandveien 2".into(),
                squarage_property: 500,
                squarage_cabin: 40,
                sauna: true,
                beachfront: true,
            },
        });
        assert_eq!(CabinState::TIER, Tier::Advert);
        assert_eq!(cabin.bounding_window(), None);

        let advert = AdvertState::new(Ulid::new(), cabin.id(), Span::new(10, 20));
        assert_eq!(AdvertState::TIER, Tier::Booking);
        assert_eq!(advert.bounding_window(), Some(Span::new(10, 20)));
    }
}
