//! Pure functions turning a `WaterEvent` into concrete firing times (§4.4).
//! Kept free of I/O and the clock trait entirely — callers pass in whatever
//! "now" and "lights-on time" they already resolved via `HostClient`, the
//! same separation the teacher draws between `mqtt.rs`'s pure topic parsers
//! and the stateful code that calls them.

use time::{OffsetDateTime, Time};
use tracing::warn;

use crate::model::{WaterEvent, WaterEventSchedule};

/// A single resolved firing time for an event, today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Firing {
    pub at: OffsetDateTime,
}

/// Parses "HH:MM" or "HH:MM:SS" into a `Time`. Returns `None` on anything
/// else rather than panicking — callers treat an unparseable `time_of_day`
/// as "this event never fires today".
pub(crate) fn parse_time_of_day(s: &str) -> Option<Time> {
    let parts: Vec<&str> = s.split(':').collect();
    let (h, m, sec) = match parts.as_slice() {
        [h, m] => (*h, *m, "0"),
        [h, m, s] => (*h, *m, *s),
        _ => return None,
    };
    let h: u8 = h.parse().ok()?;
    let m: u8 = m.parse().ok()?;
    let sec: u8 = sec.parse().ok()?;
    Time::from_hms(h, m, sec).ok()
}

/// Computes the set of times `event` fires on the calendar day of `now`.
///
/// - P1 fires once, at `lights_on + delay_minutes`, if `lights_on` is
///   `Some` (the room's lights-on reference was readable).
/// - P2 fires once, at its fixed `time_of_day` on `now`'s date.
/// - Auto is a deliberately-unimplemented v1 concept (§9 open question #2):
///   this always returns no firings and logs a warning, so a config that
///   still names it fails safe instead of silently matching nothing.
pub fn next_firings_today(
    event: &WaterEvent,
    lights_on: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> Vec<Firing> {
    if !event.enabled {
        return Vec::new();
    }

    match &event.schedule {
        WaterEventSchedule::P1 { delay_minutes } => match lights_on {
            Some(lights_on) => {
                let at = lights_on + time::Duration::minutes(*delay_minutes);
                vec![Firing { at }]
            }
            None => Vec::new(),
        },
        WaterEventSchedule::P2 { time_of_day } => match parse_time_of_day(time_of_day) {
            Some(t) => {
                let at = now.replace_time(t);
                vec![Firing { at }]
            }
            None => {
                warn!(event = %event.id, time_of_day, "unparseable P2 time_of_day — event will not fire");
                Vec::new()
            }
        },
        WaterEventSchedule::Auto => {
            warn!(event = %event.id, "event uses unsupported Auto schedule kind — it will never fire");
            Vec::new()
        }
    }
}

/// Whether `firing` should fire given the current time, within a tolerance
/// window (§4.4: a tick that runs slightly late must still catch firings
/// whose instant has just passed, but a tick must never fire something from
/// tomorrow or run stale firings from hours ago after a restart).
pub fn is_due(firing: Firing, now: OffsetDateTime, window: time::Duration) -> bool {
    let elapsed = now - firing.at;
    elapsed >= time::Duration::ZERO && elapsed < window
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn p1_event(delay_minutes: i64) -> WaterEvent {
        WaterEvent {
            id: "e1".into(),
            room_id: "r1".into(),
            name: "P1".into(),
            schedule: WaterEventSchedule::P1 { delay_minutes },
            run_seconds: 60,
            enabled: true,
            assigned_zone_ids: vec!["z1".into()],
        }
    }

    fn p2_event(time_of_day: &str) -> WaterEvent {
        WaterEvent {
            id: "e2".into(),
            room_id: "r1".into(),
            name: "P2".into(),
            schedule: WaterEventSchedule::P2 {
                time_of_day: time_of_day.to_string(),
            },
            run_seconds: 60,
            enabled: true,
            assigned_zone_ids: vec!["z1".into()],
        }
    }

    #[test]
    fn p1_fires_delay_minutes_after_lights_on() {
        let lights_on = datetime!(2024-03-01 08:00:00 UTC);
        let now = datetime!(2024-03-01 08:10:00 UTC);
        let firings = next_firings_today(&p1_event(15), Some(lights_on), now);
        assert_eq!(firings, vec![Firing { at: datetime!(2024-03-01 08:15:00 UTC) }]);
    }

    #[test]
    fn p1_with_unreadable_lights_on_never_fires() {
        let now = datetime!(2024-03-01 08:10:00 UTC);
        let firings = next_firings_today(&p1_event(15), None, now);
        assert!(firings.is_empty());
    }

    #[test]
    fn p2_fires_at_fixed_time_today() {
        let now = datetime!(2024-03-01 06:00:00 UTC);
        let firings = next_firings_today(&p2_event("14:30"), None, now);
        assert_eq!(firings, vec![Firing { at: datetime!(2024-03-01 14:30:00 UTC) }]);
    }

    #[test]
    fn p2_accepts_hh_mm_ss() {
        let now = datetime!(2024-03-01 06:00:00 UTC);
        let firings = next_firings_today(&p2_event("14:30:15"), None, now);
        assert_eq!(firings, vec![Firing { at: datetime!(2024-03-01 14:30:15 UTC) }]);
    }

    #[test]
    fn p2_malformed_time_of_day_yields_no_firings() {
        let now = datetime!(2024-03-01 06:00:00 UTC);
        let firings = next_firings_today(&p2_event("not-a-time"), None, now);
        assert!(firings.is_empty());
    }

    #[test]
    fn auto_schedule_never_fires() {
        let event = WaterEvent {
            id: "e3".into(),
            room_id: "r1".into(),
            name: "Auto".into(),
            schedule: WaterEventSchedule::Auto,
            run_seconds: 60,
            enabled: true,
            assigned_zone_ids: vec!["z1".into()],
        };
        let now = datetime!(2024-03-01 06:00:00 UTC);
        assert!(next_firings_today(&event, None, now).is_empty());
    }

    #[test]
    fn disabled_event_never_fires() {
        let mut event = p2_event("08:00");
        event.enabled = false;
        let now = datetime!(2024-03-01 08:00:00 UTC);
        assert!(next_firings_today(&event, None, now).is_empty());
    }

    #[test]
    fn is_due_true_just_after_firing_within_window() {
        let firing = Firing { at: datetime!(2024-03-01 08:00:00 UTC) };
        let now = datetime!(2024-03-01 08:00:30 UTC);
        assert!(is_due(firing, now, time::Duration::minutes(1)));
    }

    #[test]
    fn is_due_false_before_firing() {
        let firing = Firing { at: datetime!(2024-03-01 08:00:00 UTC) };
        let now = datetime!(2024-03-01 07:59:00 UTC);
        assert!(!is_due(firing, now, time::Duration::minutes(1)));
    }

    #[test]
    fn is_due_false_once_window_elapsed() {
        let firing = Firing { at: datetime!(2024-03-01 08:00:00 UTC) };
        let now = datetime!(2024-03-01 08:02:00 UTC);
        assert!(!is_due(firing, now, time::Duration::minutes(1)));
    }

    #[test]
    fn is_due_false_exactly_at_window_boundary() {
        let firing = Firing { at: datetime!(2024-03-01 08:00:00 UTC) };
        let now = datetime!(2024-03-01 08:01:00 UTC);
        assert!(!is_due(firing, now, time::Duration::minutes(1)));
    }
}
