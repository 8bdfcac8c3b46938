use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every timestamp in the system uses this type.
pub type Ms = i64;

/// Closed interval `[start, end]`.
///
/// A span may arrive reversed (`start > end`) from a client; it is kept as-is
/// so the window check can reject it rather than silently reordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn is_ordered(&self) -> bool {
        self.start <= self.end
    }

    /// True if `other` lies entirely inside `self`, endpoints included.
    pub fn contains_span(&self, other: &Span) -> bool {
        other.start >= self.start
            && other.start <= self.end
            && other.end <= self.end
            && other.end >= self.start
    }

    /// True if the two spans share at least one instant. Touching spans
    /// (`a.end == b.start`) overlap: back-to-back reservations are refused.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Partial span from an update request. Missing bounds are taken from the
/// stored record before any validation runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpanPatch {
    pub start: Option<Ms>,
    pub end: Option<Ms>,
}

impl SpanPatch {
    pub fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn resolve(&self, current: Span) -> Span {
        Span::new(
            self.start.unwrap_or(current.start),
            self.end.unwrap_or(current.end),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CabinDetails {
    pub address: String,
    pub squarage_property: u32,
    pub squarage_cabin: u32,
    pub sauna: bool,
    pub beachfront: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CabinPatch {
    pub address: Option<String>,
    pub squarage_property: Option<u32>,
    pub squarage_cabin: Option<u32>,
    pub sauna: Option<bool>,
    pub beachfront: Option<bool>,
}

impl CabinPatch {
    pub fn apply(self, details: &CabinDetails) -> CabinDetails {
        CabinDetails {
            address: self.address.unwrap_or_else(|| details.address.clone()),
            squarage_property: self.squarage_property.unwrap_or(details.squarage_property),
            squarage_cabin: self.squarage_cabin.unwrap_or(details.squarage_cabin),
            sauna: self.sauna.unwrap_or(details.sauna),
            beachfront: self.beachfront.unwrap_or(details.beachfront),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdvertPatch {
    pub price_per_day: Option<u32>,
    pub span: SpanPatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cabin {
    pub id: Ulid,
    pub owner: String,
    pub details: CabinDetails,
}

/// A cabin listed for rent over `span`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advert {
    pub id: Ulid,
    pub cabin_id: Ulid,
    pub price_per_day: u32,
    pub span: Span,
    pub created_by: String,
}

/// A date range reserved against an advert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub id: Ulid,
    pub advert_id: Ulid,
    pub booked_by: String,
    pub span: Span,
}

/// Anything that occupies a span under a parent and must not collide with
/// its siblings.
pub trait Reservation {
    fn id(&self) -> Ulid;
    fn span(&self) -> Span;
}

impl Reservation for Advert {
    fn id(&self) -> Ulid {
        self.id
    }

    fn span(&self) -> Span {
        self.span
    }
}

impl Reservation for Booking {
    fn id(&self) -> Ulid {
        self.id
    }

    fn span(&self) -> Span {
        self.span
    }
}

/// WAL record format. Events are flat and never nest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CabinCreated {
        id: Ulid,
        owner: String,
        details: CabinDetails,
    },
    CabinUpdated {
        id: Ulid,
        details: CabinDetails,
    },
    CabinDeleted {
        id: Ulid,
    },
    AdvertListed {
        id: Ulid,
        cabin_id: Ulid,
        price_per_day: u32,
        span: Span,
        created_by: String,
    },
    AdvertUpdated {
        id: Ulid,
        cabin_id: Ulid,
        price_per_day: u32,
        span: Span,
    },
    AdvertWithdrawn {
        id: Ulid,
        cabin_id: Ulid,
    },
    BookingPlaced {
        id: Ulid,
        advert_id: Ulid,
        booked_by: String,
        span: Span,
    },
    BookingUpdated {
        id: Ulid,
        advert_id: Ulid,
        span: Span,
    },
    BookingCancelled {
        id: Ulid,
        advert_id: Ulid,
    },
}
