//! Working-hours evaluation for `AgentSettings.schedule_config`.
//!
//! Fails open: any malformed input (unknown timezone, bad day name) is
//! treated as "available" rather than blocking the pipeline.

use crate::entities::ScheduleConfig;
use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;

fn day_key(weekday: chrono::Weekday) -> &'static str {
    use chrono::Weekday::*;
    match weekday {
        Mon => "mon",
        Tue => "tue",
        Wed => "wed",
        Thu => "thu",
        Fri => "fri",
        Sat => "sat",
        Sun => "sun",
    }
}

fn parse_hhmm(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    Some((h.parse().ok()?, m.parse().ok()?))
}

/// Returns `(allowed, reason)`. `reason` is populated only when blocked.
pub fn within_schedule(config: &ScheduleConfig, now: DateTime<Utc>) -> (bool, Option<String>) {
    if !config.enabled || config.working_hours.is_empty() {
        return (true, None);
    }

    let tz: Tz = config
        .timezone
        .as_deref()
        .and_then(|tz| tz.parse().ok())
        .unwrap_or(chrono_tz::UTC);

    let local = now.with_timezone(&tz);
    let key = day_key(local.weekday());
    let minutes_now = local.hour() * 60 + local.minute();

    let todays_windows: Vec<_> = config.working_hours.iter().filter(|w| w.day.to_ascii_lowercase() == key).collect();
    if todays_windows.is_empty() {
        return (false, Some(format!("no working hours configured for {key}")));
    }

    for window in todays_windows {
        let (Some((sh, sm)), Some((eh, em))) = (parse_hhmm(&window.start), parse_hhmm(&window.end)) else {
            continue;
        };
        let start = sh * 60 + sm;
        let end = eh * 60 + em;
        if minutes_now >= start && minutes_now < end {
            return (true, None);
        }
    }

    (false, Some(format!("outside working hours for {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::WorkingHoursWindow;
    use chrono::TimeZone;

    fn cfg(day: &str, start: &str, end: &str) -> ScheduleConfig {
        ScheduleConfig {
            enabled: true,
            timezone: Some("UTC".to_string()),
            working_hours: vec![WorkingHoursWindow { day: day.to_string(), start: start.to_string(), end: end.to_string() }],
        }
    }

    #[test]
    fn disabled_schedule_is_always_available() {
        let config = ScheduleConfig { enabled: false, ..Default::default() };
        let now = Utc.with_ymd_and_hms(2026, 7, 27, 3, 0, 0).unwrap();
        assert_eq!(within_schedule(&config, now), (true, None));
    }

    #[test]
    fn within_window_is_allowed() {
        // 2026-07-27 is a Monday.
        let config = cfg("mon", "09:00", "18:00");
        let now = Utc.with_ymd_and_hms(2026, 7, 27, 12, 0, 0).unwrap();
        assert_eq!(within_schedule(&config, now), (true, None));
    }

    #[test]
    fn outside_window_is_blocked_with_reason() {
        let config = cfg("mon", "09:00", "18:00");
        let now = Utc.with_ymd_and_hms(2026, 7, 27, 20, 0, 0).unwrap();
        let (allowed, reason) = within_schedule(&config, now);
        assert!(!allowed);
        assert!(reason.is_some());
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let config = ScheduleConfig {
            enabled: true,
            timezone: Some("Not/AZone".to_string()),
            working_hours: vec![WorkingHoursWindow { day: "mon".to_string(), start: "09:00".to_string(), end: "18:00".to_string() }],
        };
        let now = Utc.with_ymd_and_hms(2026, 7, 27, 12, 0, 0).unwrap();
        assert_eq!(within_schedule(&config, now), (true, None));
    }
}
