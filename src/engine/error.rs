use ulid::Ulid;

/// Why a proposed span was refused. The string forms are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rejection {
    StartAfterEnd,
    DatesInPast,
    OutsideParentWindow,
    OverlapsExisting,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::StartAfterEnd => "start_after_end",
            Rejection::DatesInPast => "dates_in_past",
            Rejection::OutsideParentWindow => "outside_parent_window",
            Rejection::OverlapsExisting => "overlaps_existing",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    Rejected(Rejection),
    Forbidden { id: Ulid, actor: String },
    HasChildren(Ulid),
    WouldStrandBooking { advert_id: Ulid, booking_id: Ulid },
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Rejected(reason) => write!(f, "rejected: {reason}"),
            EngineError::Forbidden { id, actor } => {
                write!(f, "{actor} may not modify {id}")
            }
            EngineError::HasChildren(id) => {
                write!(f, "cannot delete {id}: reservations still attached")
            }
            EngineError::WouldStrandBooking { advert_id, booking_id } => write!(
                f,
                "advert {advert_id} window would no longer cover booking {booking_id}"
            ),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<Rejection> for EngineError {
    fn from(reason: Rejection) -> Self {
        EngineError::Rejected(reason)
    }
}
