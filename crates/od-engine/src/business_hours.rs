//! Business hours evaluation and provider block-rule compilation
//!
//! Slots are "HH:MM" 24h strings interpreted in the schedule's timezone
//! (falling back to the campaign timezone, then UTC). An end of "24:00" or
//! "23:59" means end of day.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use od_common::{BusinessHoursConfig, Campaign, DayOfWeek, TimeSlot};
use serde::Serialize;
use thiserror::Error;

const DAY_END: u16 = 24 * 60;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusinessHoursError {
    #[error("Invalid time '{0}', expected HH:MM")]
    InvalidTime(String),

    #[error("Unknown timezone '{0}'")]
    UnknownTimezone(String),

    #[error("{day}: slot {start}-{end} must start before it ends")]
    EmptySlot { day: &'static str, start: String, end: String },

    #[error("{day}: slots {first} and {second} overlap")]
    Overlap { day: &'static str, first: String, second: String },
}

/// Start of the next open window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NextWindow {
    pub at: DateTime<Utc>,
    pub day_name: String,
    /// Window start rendered in the schedule's timezone
    pub formatted_local_time: String,
}

/// Minutes since midnight. "24:00" is accepted as end of day.
fn parse_minutes(value: &str) -> Result<u16, BusinessHoursError> {
    let invalid = || BusinessHoursError::InvalidTime(value.to_string());
    let (hours, minutes) = value.trim().split_once(':').ok_or_else(invalid)?;
    if hours.is_empty() || hours.len() > 2 || minutes.len() != 2 {
        return Err(invalid());
    }
    let hours: u16 = hours.parse().map_err(|_| invalid())?;
    let minutes: u16 = minutes.parse().map_err(|_| invalid())?;

    match (hours, minutes) {
        (24, 0) => Ok(DAY_END),
        (h, m) if h < 24 && m < 60 => Ok(h * 60 + m),
        _ => Err(invalid()),
    }
}

/// Parse one slot into `[start, end)` minutes, normalising 23:59 to end of day
fn parse_slot(day: DayOfWeek, slot: &TimeSlot) -> Result<(u16, u16), BusinessHoursError> {
    let start = parse_minutes(&slot.start)?;
    let mut end = parse_minutes(&slot.end)?;
    if end >= DAY_END - 1 {
        end = DAY_END;
    }
    if start >= end {
        return Err(BusinessHoursError::EmptySlot {
            day: day.name(),
            start: slot.start.clone(),
            end: slot.end.clone(),
        });
    }
    Ok((start, end))
}

/// Sorted, validated slots of one day
fn day_slots(config: &BusinessHoursConfig, day: DayOfWeek) -> Result<Vec<(u16, u16)>, BusinessHoursError> {
    let mut slots = config
        .slots(day)
        .iter()
        .map(|slot| parse_slot(day, slot))
        .collect::<Result<Vec<_>, _>>()?;
    slots.sort_unstable();

    for pair in slots.windows(2) {
        if pair[1].0 < pair[0].1 {
            return Err(BusinessHoursError::Overlap {
                day: day.name(),
                first: format!("{}-{}", format_hhmm(pair[0].0, ":"), format_hhmm(pair[0].1, ":")),
                second: format!("{}-{}", format_hhmm(pair[1].0, ":"), format_hhmm(pair[1].1, ":")),
            });
        }
    }
    Ok(slots)
}

fn format_hhmm(minutes: u16, separator: &str) -> String {
    // Block rules express end of day as 23:59
    let minutes = minutes.min(DAY_END - 1);
    format!("{:02}{}{:02}", minutes / 60, separator, minutes % 60)
}

fn resolve_timezone(config: &BusinessHoursConfig, fallback: &str) -> Result<Tz, BusinessHoursError> {
    let name = config
        .timezone
        .as_deref()
        .map(str::trim)
        .filter(|tz| !tz.is_empty())
        .or_else(|| Some(fallback.trim()).filter(|tz| !tz.is_empty()))
        .unwrap_or("UTC");

    name.parse::<Tz>()
        .map_err(|_| BusinessHoursError::UnknownTimezone(name.to_string()))
}

/// Reject malformed times, empty or overlapping slots and unknown timezones
pub fn validate(config: &BusinessHoursConfig, fallback_timezone: &str) -> Result<(), BusinessHoursError> {
    BusinessHoursEvaluator::new(config, fallback_timezone).map(|_| ())
}

/// Compile the weekly schedule into provider block rules, `"<Day>|<HHMM>-<HHMM>"`,
/// one rule per closed window, Monday first. Disabled hours block nothing.
pub fn compile_block_rules(config: &BusinessHoursConfig) -> Result<Vec<String>, BusinessHoursError> {
    if !config.enabled {
        return Ok(Vec::new());
    }

    let mut rules = Vec::new();
    for day in DayOfWeek::ALL {
        let slots = day_slots(config, day)?;
        let mut push = |from: u16, to: u16| {
            rules.push(format!("{}|{}-{}", day.abbrev(), format_hhmm(from, ""), format_hhmm(to, "")));
        };

        if slots.is_empty() {
            push(0, DAY_END);
            continue;
        }

        let mut cursor = 0;
        for (start, end) in slots {
            if start > cursor {
                push(cursor, start);
            }
            cursor = end;
        }
        if cursor < DAY_END {
            push(cursor, DAY_END);
        }
    }
    Ok(rules)
}

/// Compiled weekly schedule bound to a timezone
#[derive(Debug, Clone)]
pub struct BusinessHoursEvaluator {
    enabled: bool,
    timezone: Tz,
    /// Indexed Monday = 0
    week: [Vec<(u16, u16)>; 7],
}

impl BusinessHoursEvaluator {
    pub fn new(config: &BusinessHoursConfig, fallback_timezone: &str) -> Result<Self, BusinessHoursError> {
        let timezone = resolve_timezone(config, fallback_timezone)?;
        let mut week: [Vec<(u16, u16)>; 7] = Default::default();
        for (idx, day) in DayOfWeek::ALL.into_iter().enumerate() {
            week[idx] = day_slots(config, day)?;
        }

        Ok(Self {
            enabled: config.enabled,
            timezone,
            week,
        })
    }

    pub fn for_campaign(campaign: &Campaign) -> Result<Self, BusinessHoursError> {
        Self::new(&campaign.business_hours, &campaign.timezone)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    fn slots_for(&self, day: DayOfWeek) -> &[(u16, u16)] {
        let idx = DayOfWeek::ALL.iter().position(|d| *d == day).unwrap_or(0);
        &self.week[idx]
    }

    pub fn is_within_business_hours(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return true;
        }

        let local = now.with_timezone(&self.timezone);
        let minute = (local.hour() * 60 + local.minute()) as u16;
        self.slots_for(DayOfWeek::from(local.weekday()))
            .iter()
            .any(|&(start, end)| start <= minute && minute < end)
    }

    /// Earliest slot start strictly after `now`, scanning today and the next
    /// seven days. `None` when hours are disabled or every day is closed.
    pub fn next_business_hours_start(&self, now: DateTime<Utc>) -> Option<NextWindow> {
        if !self.enabled {
            return None;
        }

        let local_now = now.with_timezone(&self.timezone);
        let today = local_now.date_naive();

        for offset in 0..=7 {
            let date = today + Duration::days(offset);
            let day = DayOfWeek::from(date.weekday());

            for &(start, _) in self.slots_for(day) {
                let Some(at) = self.local_instant(date, start) else {
                    continue;
                };
                if at > now {
                    let local = at.with_timezone(&self.timezone);
                    return Some(NextWindow {
                        at,
                        day_name: day.name().to_string(),
                        formatted_local_time: local.format("%Y-%m-%d %H:%M %Z").to_string(),
                    });
                }
            }
        }
        None
    }

    /// Resolve a local wall-clock time, skipping forward over DST gaps
    fn local_instant(&self, date: NaiveDate, minutes: u16) -> Option<DateTime<Utc>> {
        let naive = date.and_hms_opt(u32::from(minutes / 60), u32::from(minutes % 60), 0)?;
        self.timezone
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| self.timezone.from_local_datetime(&(naive + Duration::hours(1))).earliest())
            .map(|local| local.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weekday_hours() -> BusinessHoursConfig {
        let mut config = BusinessHoursConfig {
            enabled: true,
            timezone: Some("America/New_York".to_string()),
            ..Default::default()
        };
        for day in [DayOfWeek::Monday, DayOfWeek::Tuesday, DayOfWeek::Wednesday, DayOfWeek::Thursday, DayOfWeek::Friday] {
            config = config.with_day(day, vec![TimeSlot::new("09:00", "12:00"), TimeSlot::new("13:00", "17:00")]);
        }
        config
    }

    #[test]
    fn test_block_rules_for_split_day() {
        let rules = compile_block_rules(&weekday_hours()).unwrap();
        let monday: Vec<_> = rules.iter().filter(|r| r.starts_with("Mon|")).cloned().collect();
        assert_eq!(monday, vec!["Mon|0000-0900", "Mon|1200-1300", "Mon|1700-2359"]);
    }

    #[test]
    fn test_block_rules_for_closed_day() {
        let rules = compile_block_rules(&weekday_hours()).unwrap();
        let sunday: Vec<_> = rules.iter().filter(|r| r.starts_with("Sun|")).collect();
        assert_eq!(sunday, vec!["Sun|0000-2359"]);
        assert_eq!(rules.len(), 5 * 3 + 2);
        assert!(rules[0].starts_with("Mon|"));
    }

    #[test]
    fn test_block_rules_day_end_markers() {
        let config = BusinessHoursConfig { enabled: true, ..Default::default() }
            .with_day(DayOfWeek::Monday, vec![TimeSlot::new("00:00", "24:00")])
            .with_day(DayOfWeek::Tuesday, vec![TimeSlot::new("08:00", "23:59")])
            .with_day(DayOfWeek::Wednesday, vec![TimeSlot::new("08:00", "12:00"), TimeSlot::new("12:00", "18:00")]);
        let rules = compile_block_rules(&config).unwrap();

        assert!(!rules.iter().any(|r| r.starts_with("Mon|")));
        assert_eq!(rules.iter().filter(|r| r.starts_with("Tue|")).collect::<Vec<_>>(), vec!["Tue|0000-0800"]);
        assert_eq!(
            rules.iter().filter(|r| r.starts_with("Wed|")).collect::<Vec<_>>(),
            vec!["Wed|0000-0800", "Wed|1800-2359"]
        );
    }

    #[test]
    fn test_disabled_hours_block_nothing_and_always_open() {
        let config = BusinessHoursConfig::disabled();
        assert!(compile_block_rules(&config).unwrap().is_empty());

        let evaluator = BusinessHoursEvaluator::new(&config, "UTC").unwrap();
        assert!(evaluator.is_within_business_hours(Utc::now()));
        assert!(evaluator.next_business_hours_start(Utc::now()).is_none());
    }

    #[test]
    fn test_within_hours_uses_schedule_timezone() {
        let evaluator = BusinessHoursEvaluator::new(&weekday_hours(), "UTC").unwrap();

        // Monday 2024-03-04 10:30 New York = 15:30 UTC
        assert!(evaluator.is_within_business_hours(Utc.with_ymd_and_hms(2024, 3, 4, 15, 30, 0).unwrap()));
        // Monday 12:30 New York, lunch gap
        assert!(!evaluator.is_within_business_hours(Utc.with_ymd_and_hms(2024, 3, 4, 17, 30, 0).unwrap()));
        // Monday 10:30 UTC = 05:30 New York
        assert!(!evaluator.is_within_business_hours(Utc.with_ymd_and_hms(2024, 3, 4, 10, 30, 0).unwrap()));
        // Exactly 17:00 New York is closed
        assert!(!evaluator.is_within_business_hours(Utc.with_ymd_and_hms(2024, 3, 4, 22, 0, 0).unwrap()));
    }

    #[test]
    fn test_next_start_skips_weekend() {
        let evaluator = BusinessHoursEvaluator::new(&weekday_hours(), "UTC").unwrap();

        // Saturday 2024-03-09 12:00 UTC
        let next = evaluator
            .next_business_hours_start(Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap())
            .unwrap();

        assert_eq!(next.day_name, "Monday");
        // 2024-03-10 is the US DST switch, so Monday 09:00 is UTC-4
        assert_eq!(next.at, Utc.with_ymd_and_hms(2024, 3, 11, 13, 0, 0).unwrap());
        assert!(next.formatted_local_time.starts_with("2024-03-11 09:00"));
    }

    #[test]
    fn test_next_start_same_day_after_gap() {
        let evaluator = BusinessHoursEvaluator::new(&weekday_hours(), "UTC").unwrap();
        // Monday 12:15 New York (EST, UTC-5)
        let next = evaluator
            .next_business_hours_start(Utc.with_ymd_and_hms(2024, 3, 4, 17, 15, 0).unwrap())
            .unwrap();
        assert_eq!(next.at, Utc.with_ymd_and_hms(2024, 3, 4, 18, 0, 0).unwrap());
    }

    #[test]
    fn test_next_start_is_open_whenever_now_is_closed() {
        let evaluator = BusinessHoursEvaluator::new(&weekday_hours(), "UTC").unwrap();
        let mut t = Utc.with_ymd_and_hms(2024, 3, 1, 0, 7, 0).unwrap();
        let end = t + Duration::days(15);

        while t < end {
            if !evaluator.is_within_business_hours(t) {
                let next = evaluator.next_business_hours_start(t).unwrap();
                assert!(next.at > t, "next start {} not after {}", next.at, t);
                assert!(evaluator.is_within_business_hours(next.at), "next start {} is closed", next.at);
            }
            t += Duration::minutes(37);
        }
    }

    #[test]
    fn test_all_days_closed_has_no_next_start() {
        let config = BusinessHoursConfig { enabled: true, ..Default::default() };
        let evaluator = BusinessHoursEvaluator::new(&config, "UTC").unwrap();
        assert!(!evaluator.is_within_business_hours(Utc::now()));
        assert!(evaluator.next_business_hours_start(Utc::now()).is_none());
    }

    #[test]
    fn test_timezone_fallback_chain() {
        let config = BusinessHoursConfig { enabled: true, timezone: None, ..Default::default() };
        let evaluator = BusinessHoursEvaluator::new(&config, "Europe/London").unwrap();
        assert_eq!(evaluator.timezone(), chrono_tz::Europe::London);

        let evaluator = BusinessHoursEvaluator::new(&config, "").unwrap();
        assert_eq!(evaluator.timezone(), chrono_tz::UTC);
    }

    #[test]
    fn test_validation_errors() {
        let bad_time = BusinessHoursConfig { enabled: true, ..Default::default() }
            .with_day(DayOfWeek::Monday, vec![TimeSlot::new("9am", "17:00")]);
        assert!(matches!(validate(&bad_time, "UTC"), Err(BusinessHoursError::InvalidTime(_))));

        let inverted = BusinessHoursConfig { enabled: true, ..Default::default() }
            .with_day(DayOfWeek::Monday, vec![TimeSlot::new("17:00", "09:00")]);
        assert!(matches!(validate(&inverted, "UTC"), Err(BusinessHoursError::EmptySlot { .. })));

        let overlapping = BusinessHoursConfig { enabled: true, ..Default::default() }
            .with_day(DayOfWeek::Monday, vec![TimeSlot::new("09:00", "13:00"), TimeSlot::new("12:00", "17:00")]);
        assert!(matches!(validate(&overlapping, "UTC"), Err(BusinessHoursError::Overlap { .. })));

        let unknown_tz = BusinessHoursConfig {
            enabled: true,
            timezone: Some("Mars/Olympus".to_string()),
            ..Default::default()
        };
        assert!(matches!(validate(&unknown_tz, "UTC"), Err(BusinessHoursError::UnknownTimezone(_))));
    }

    #[test]
    fn test_parse_minutes() {
        assert_eq!(parse_minutes("00:00").unwrap(), 0);
        assert_eq!(parse_minutes("9:30").unwrap(), 570);
        assert_eq!(parse_minutes("24:00").unwrap(), DAY_END);
        assert!(parse_minutes("24:30").is_err());
        assert!(parse_minutes("12:60").is_err());
        assert!(parse_minutes("1200").is_err());
    }
}
