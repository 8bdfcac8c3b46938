use crate::model::Ms;

pub const MAX_CABINS: usize = 100_000;
pub const MAX_RESERVATIONS_PER_PARENT: usize = 10_000;
pub const MAX_ADDRESS_LEN: usize = 512;
pub const MAX_ACTOR_LEN: usize = 128;

/// 1970-01-01. Nothing before the epoch is bookable.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
/// Ten years.
pub const MAX_SPAN_DURATION_MS: Ms = 10 * 366 * DAY_MS;

pub const DAY_MS: Ms = 86_400_000;
