//! Next-run computation.

use chrono::{DateTime, Datelike, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;

use crate::error::ScheduleError;
use crate::schedule::{Schedule, ScheduleKind};

/// How many cron candidates to scan when a day-of-week restriction is in
/// play. Two weeks of minutely firings; any restriction that can match at
/// all matches within that window.
const DAY_FILTER_SCAN_LIMIT: usize = 20_160;

/// Compute when a schedule should fire next, strictly after `now`.
///
/// Pure function of the schedule and the probe instant:
///
/// 1. A future `start_time` wins over everything.
/// 2. Interval schedules fire `minutes` after `now`.
/// 3. Cron schedules fire at the soonest expression match, evaluated in
///    the schedule's timezone and filtered by `days_of_week`.
/// 4. One-shot schedules whose moment has passed are exhausted.
/// 5. Any candidate past `end_time` exhausts the schedule.
///
/// `Ok(None)` means exhausted: the schedule proposes no further firings.
pub fn next_run(
    schedule: &Schedule,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let candidate = if schedule.start_time > now {
        Some(schedule.start_time)
    } else {
        match &schedule.kind {
            ScheduleKind::OneShot => None,
            ScheduleKind::Interval { minutes } => {
                Some(now + Duration::minutes(i64::from(*minutes)))
            }
            ScheduleKind::Cron {
                expression,
                days_of_week,
            } => next_cron_run(expression, days_of_week.as_deref(), &schedule.timezone, now)?,
        }
    };

    Ok(candidate.filter(|instant| match schedule.end_time {
        Some(end_time) => *instant <= end_time,
        None => true,
    }))
}

fn next_cron_run(
    expression: &str,
    days_of_week: Option<&[u8]>,
    timezone: &str,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let tz = parse_timezone(timezone)?;
    let cron: CronSchedule = expression.parse()?;
    let local_now = now.with_timezone(&tz);

    let limit = match days_of_week {
        Some(_) => DAY_FILTER_SCAN_LIMIT,
        None => 1,
    };
    let hit = cron
        .after(&local_now)
        .take(limit)
        .find(|instant| match days_of_week {
            Some(days) => days.contains(&day_index(instant)),
            None => true,
        });

    Ok(hit.map(|instant| instant.with_timezone(&Utc)))
}

fn day_index(instant: &DateTime<Tz>) -> u8 {
    instant.weekday().num_days_from_sunday() as u8
}

pub(crate) fn parse_timezone(timezone: &str) -> Result<Tz, ScheduleError> {
    timezone
        .parse::<Tz>()
        .map_err(|_| ScheduleError::Validation(format!("unknown timezone: {timezone}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{NewSchedule, ScheduleKind};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn schedule(kind: ScheduleKind, start_time: DateTime<Utc>) -> Schedule {
        let new = NewSchedule::new("test", kind);
        Schedule {
            id: Uuid::new_v4(),
            name: new.name,
            kind: new.kind,
            start_time,
            end_time: None,
            timezone: new.timezone,
            entity_type: new.entity_type,
            entity_id: None,
            action: new.action,
            action_config: new.action_config,
            is_active: true,
            run_count: 0,
            last_run_at: None,
            last_status: None,
            next_run_at: None,
            created_at: start_time,
            updated_at: start_time,
        }
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_future_start_time_wins() {
        let now = at(2024, 1, 1, 10, 0);
        let start = at(2024, 1, 5, 0, 0);
        let schedule = schedule(ScheduleKind::Interval { minutes: 30 }, start);

        assert_eq!(next_run(&schedule, now).unwrap(), Some(start));
    }

    #[test]
    fn test_interval_adds_minutes() {
        let now = at(2024, 1, 1, 10, 0);
        let schedule = schedule(ScheduleKind::Interval { minutes: 30 }, at(2024, 1, 1, 0, 0));

        assert_eq!(
            next_run(&schedule, now).unwrap(),
            Some(at(2024, 1, 1, 10, 30))
        );
    }

    #[test]
    fn test_one_shot_exhausts_after_start() {
        let start = at(2024, 1, 1, 9, 0);
        let schedule = schedule(ScheduleKind::OneShot, start);

        assert_eq!(next_run(&schedule, at(2024, 1, 1, 8, 0)).unwrap(), Some(start));
        assert_eq!(next_run(&schedule, at(2024, 1, 1, 9, 30)).unwrap(), None);
    }

    #[test]
    fn test_end_time_exhausts() {
        let now = at(2024, 1, 1, 10, 0);
        let mut schedule = schedule(ScheduleKind::Interval { minutes: 60 }, at(2024, 1, 1, 0, 0));
        schedule.end_time = Some(at(2024, 1, 1, 10, 30));

        assert_eq!(next_run(&schedule, now).unwrap(), None);
    }

    #[test]
    fn test_cron_daily_next_match() {
        let now = at(2024, 1, 1, 10, 0);
        let schedule = schedule(
            ScheduleKind::Cron {
                expression: "0 0 9 * * *".to_string(),
                days_of_week: None,
            },
            at(2024, 1, 1, 0, 0),
        );

        assert_eq!(next_run(&schedule, now).unwrap(), Some(at(2024, 1, 2, 9, 0)));
    }

    #[test]
    fn test_cron_respects_days_of_week() {
        // 2024-01-01 is a Monday; restricting to Friday (5) skips ahead.
        let now = at(2024, 1, 1, 10, 0);
        let schedule = schedule(
            ScheduleKind::Cron {
                expression: "0 0 9 * * *".to_string(),
                days_of_week: Some(vec![5]),
            },
            at(2024, 1, 1, 0, 0),
        );

        assert_eq!(next_run(&schedule, now).unwrap(), Some(at(2024, 1, 5, 9, 0)));
    }

    #[test]
    fn test_cron_evaluates_in_timezone() {
        // 9 AM New York in January is 14:00 UTC.
        let now = at(2024, 1, 1, 10, 0);
        let mut schedule = schedule(
            ScheduleKind::Cron {
                expression: "0 0 9 * * *".to_string(),
                days_of_week: None,
            },
            at(2024, 1, 1, 0, 0),
        );
        schedule.timezone = "America/New_York".to_string();

        assert_eq!(next_run(&schedule, now).unwrap(), Some(at(2024, 1, 1, 14, 0)));
    }

    #[test]
    fn test_unknown_timezone_is_rejected() {
        let now = at(2024, 1, 1, 10, 0);
        let mut schedule = schedule(
            ScheduleKind::Cron {
                expression: "0 0 9 * * *".to_string(),
                days_of_week: None,
            },
            at(2024, 1, 1, 0, 0),
        );
        schedule.timezone = "Mars/Olympus_Mons".to_string();

        assert!(matches!(
            next_run(&schedule, now),
            Err(ScheduleError::Validation(_))
        ));
    }

    #[test]
    fn test_impossible_day_filter_exhausts() {
        let now = at(2024, 1, 1, 10, 0);
        let schedule = schedule(
            ScheduleKind::Cron {
                // 7 is not a real weekday index, so no candidate passes.
                expression: "0 0 9 * * *".to_string(),
                days_of_week: Some(vec![7]),
            },
            at(2024, 1, 1, 0, 0),
        );

        assert_eq!(next_run(&schedule, now).unwrap(), None);
    }
}
