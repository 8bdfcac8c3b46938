use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::state::Parent;
use super::{EngineError, Rejection};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Ms
}

/// Start of the current UTC day. Reservations may not start or end before it.
pub(crate) fn today_ms() -> Ms {
    let now = now_ms();
    now - now.rem_euclid(DAY_MS)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    for t in [span.start, span.end] {
        if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
    }
    if span.is_ordered() && span.end - span.start > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn validate_actor(actor: &str) -> Result<(), EngineError> {
    if actor.is_empty() {
        return Err(EngineError::LimitExceeded("actor name empty"));
    }
    if actor.len() > MAX_ACTOR_LEN {
        return Err(EngineError::LimitExceeded("actor name too long"));
    }
    Ok(())
}

/// The two reservation tiers. They share one check and differ only in
/// whether the child must nest inside its parent's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Adverts of a cabin: no outer bound, only sibling exclusivity.
    Advert,
    /// Bookings of an advert: must also sit inside the advert's span.
    Booking,
}

impl Tier {
    pub fn requires_containment(self) -> bool {
        matches!(self, Tier::Booking)
    }

    pub fn label(self) -> &'static str {
        match self {
            Tier::Advert => "advert",
            Tier::Booking => "booking",
        }
    }
}

/// Decide whether `proposed` may be committed next to `siblings`.
///
/// Order: reversed span, past dates, sibling collision, then containment.
/// The sibling set must already exclude the record being updated.
pub fn check_window<I>(
    tier: Tier,
    proposed: &Span,
    window: Option<&Span>,
    siblings: I,
    today: Ms,
) -> Result<(), Rejection>
where
    I: IntoIterator<Item = Span>,
{
    if !proposed.is_ordered() {
        return Err(Rejection::StartAfterEnd);
    }
    if proposed.start < today || proposed.end < today {
        return Err(Rejection::DatesInPast);
    }
    if siblings.into_iter().any(|s| proposed.overlaps(&s)) {
        return Err(Rejection::OverlapsExisting);
    }
    if tier.requires_containment() && !window.is_some_and(|w| w.contains_span(proposed)) {
        return Err(Rejection::OutsideParentWindow);
    }
    Ok(())
}

/// Run [`check_window`] against a parent's current window and children.
pub(crate) fn check_against<P: Parent>(
    parent: &P,
    proposed: &Span,
    exclude: Option<Ulid>,
    today: Ms,
) -> Result<(), EngineError> {
    let window = parent.bounding_window();
    let siblings: Vec<Span> = if proposed.is_ordered() {
        parent
            .children()
            .overlapping(proposed, exclude)
            .map(|r| r.span())
            .collect()
    } else {
        Vec::new()
    };
    check_window(P::TIER, proposed, window.as_ref(), siblings, today).map_err(|reason| {
        metrics::counter!(
            crate::observability::WINDOW_REJECTIONS_TOTAL,
            "tier" => P::TIER.label(),
            "reason" => reason.as_str()
        )
        .increment(1);
        tracing::debug!(
            parent = %parent.id(),
            tier = P::TIER.label(),
            start = proposed.start,
            end = proposed.end,
            "window rejected: {reason}"
        );
        EngineError::Rejected(reason)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(start: Ms, end: Ms) -> Span {
        Span::new(start, end)
    }

    const TODAY: Ms = 0;
    const NO_SIBLINGS: [Span; 0] = [];

    #[test]
    fn booking_filling_whole_window_is_accepted() {
        let window = span(10, 20);
        let result = check_window(Tier::Booking, &span(10, 20), Some(&window), NO_SIBLINGS, TODAY);
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn booking_starting_before_window_is_rejected() {
        let window = span(10, 20);
        let result = check_window(Tier::Booking, &span(9, 15), Some(&window), NO_SIBLINGS, TODAY);
        assert_eq!(result, Err(Rejection::OutsideParentWindow));
    }

    #[test]
    fn booking_collision_reported_before_containment() {
        let window = span(10, 20);
        let sibling = span(15, 25);
        let result = check_window(Tier::Booking, &span(12, 18), Some(&window), [sibling], TODAY);
        assert_eq!(result, Err(Rejection::OverlapsExisting));

        // Out of window and colliding: the collision wins.
        let result = check_window(Tier::Booking, &span(18, 30), Some(&window), [sibling], TODAY);
        assert_eq!(result, Err(Rejection::OverlapsExisting));
    }

    #[test]
    fn booking_without_window_is_outside() {
        let result = check_window(Tier::Booking, &span(10, 20), None, NO_SIBLINGS, TODAY);
        assert_eq!(result, Err(Rejection::OutsideParentWindow));
    }

    #[test]
    fn advert_touching_existing_advert_is_rejected() {
        let existing = span(1, 10);
        let result = check_window(Tier::Advert, &span(10, 20), None, [existing], TODAY);
        assert_eq!(result, Err(Rejection::OverlapsExisting));

        let result = check_window(Tier::Advert, &span(11, 20), None, [existing], TODAY);
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn advert_ignores_window() {
        let window = span(0, 5);
        let result = check_window(Tier::Advert, &span(100, 200), Some(&window), NO_SIBLINGS, TODAY);
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn reversed_span_is_rejected() {
        for tier in [Tier::Advert, Tier::Booking] {
            let window = span(0, 100);
            let result = check_window(tier, &span(50, 40), Some(&window), NO_SIBLINGS, TODAY);
            assert_eq!(result, Err(Rejection::StartAfterEnd));
        }
    }

    #[test]
    fn single_instant_span_is_ordered() {
        let window = span(10, 20);
        let result = check_window(Tier::Booking, &span(15, 15), Some(&window), NO_SIBLINGS, TODAY);
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn past_dates_rejected_regardless_of_other_conditions() {
        let today = 10 * DAY_MS;
        let yesterday = today - DAY_MS;
        let window = span(0, 20 * DAY_MS);
        let sibling = span(yesterday, today + DAY_MS);

        for tier in [Tier::Advert, Tier::Booking] {
            let proposed = span(yesterday, today + 2 * DAY_MS);
            assert_eq!(
                check_window(tier, &proposed, Some(&window), [sibling], today),
                Err(Rejection::DatesInPast)
            );
            assert_eq!(
                check_window(tier, &proposed, None, NO_SIBLINGS, today),
                Err(Rejection::DatesInPast)
            );
        }
    }

    #[test]
    fn today_itself_is_not_in_the_past() {
        let today = 10 * DAY_MS;
        let result = check_window(Tier::Advert, &span(today, today + DAY_MS), None, NO_SIBLINGS, today);
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn reversal_reported_before_past_end() {
        let today = 10 * DAY_MS;
        let result = check_window(Tier::Advert, &span(today, today - 1), None, NO_SIBLINGS, today);
        assert_eq!(result, Err(Rejection::StartAfterEnd));
    }

    #[test]
    fn partial_update_merged_before_check() {
        // Booking X is [5,15] on advert [0,30], no siblings; update sets end = 25.
        let current = span(5, 15);
        let patch = SpanPatch { start: None, end: Some(25) };
        let proposed = patch.resolve(current);
        assert_eq!(proposed, span(5, 25));
        let window = span(0, 30);
        assert_eq!(
            check_window(Tier::Booking, &proposed, Some(&window), NO_SIBLINGS, TODAY),
            Ok(())
        );
    }

    #[test]
    fn non_overlapping_siblings_pass() {
        let window = span(0, 100);
        let siblings = [span(0, 9), span(31, 40), span(90, 100)];
        let result = check_window(Tier::Booking, &span(10, 30), Some(&window), siblings, TODAY);
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn validate_span_bounds() {
        assert!(validate_span(&span(0, DAY_MS)).is_ok());
        assert!(matches!(
            validate_span(&span(-1, DAY_MS)),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            validate_span(&span(0, MAX_SPAN_DURATION_MS + 1)),
            Err(EngineError::LimitExceeded("span too wide"))
        ));
        // Reversed spans pass the limit check and are rejected by the window check.
        assert!(validate_span(&span(DAY_MS, 0)).is_ok());
    }

    #[test]
    fn validate_actor_rules() {
        assert!(validate_actor("kari").is_ok());
        assert!(validate_actor("").is_err());
        assert!(validate_actor(&"x".repeat(MAX_ACTOR_LEN + 1)).is_err());
    }

    #[test]
    fn today_is_midnight_aligned() {
        let today = today_ms();
        assert_eq!(today.rem_euclid(DAY_MS), 0);
        assert!(now_ms() - today < DAY_MS);
    }
}
