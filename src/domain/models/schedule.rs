//! Time-based schedule definitions and their fire-time arithmetic.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::errors::{RobotError, RobotResult};
use crate::domain::models::variable::VariableMap;

/// When a schedule fires. All times are UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Fire once at a fixed instant.
    Once { at: DateTime<Utc> },
    /// Fire every `every_secs` seconds.
    Interval { every_secs: u64 },
    /// Fire daily at hour:minute.
    Daily { hour: u32, minute: u32 },
    /// Fire weekly; `weekday` is 0 = Monday .. 6 = Sunday.
    Weekly { weekday: u32, hour: u32, minute: u32 },
    /// Fire monthly on `day` (1-31); months without that day are skipped.
    Monthly { day: u32, hour: u32, minute: u32 },
    /// 5- or 6-field cron expression (seconds field optional).
    Cron { expression: String },
}

impl ScheduleSpec {
    /// Validate the definition; cron expressions must parse and field
    /// ranges must be sane.
    pub fn validate(&self) -> RobotResult<()> {
        match self {
            Self::Once { .. } => Ok(()),
            Self::Interval { every_secs } => {
                if *every_secs == 0 {
                    Err(RobotError::Config("interval must be non-zero".into()))
                } else {
                    Ok(())
                }
            }
            Self::Daily { hour, minute } => check_time(*hour, *minute),
            Self::Weekly {
                weekday,
                hour,
                minute,
            } => {
                if *weekday > 6 {
                    return Err(RobotError::Config(format!(
                        "weekday {} out of range 0-6",
                        weekday
                    )));
                }
                check_time(*hour, *minute)
            }
            Self::Monthly { day, hour, minute } => {
                if *day == 0 || *day > 31 {
                    return Err(RobotError::Config(format!("day {} out of range 1-31", day)));
                }
                check_time(*hour, *minute)
            }
            Self::Cron { expression } => {
                cron::Schedule::from_str(&normalize_cron(expression)).map_err(|e| {
                    RobotError::Config(format!("invalid cron expression '{}': {}", expression, e))
                })?;
                Ok(())
            }
        }
    }

    /// The next fire time strictly after `after`, or `None` when the
    /// schedule is exhausted.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Once { at } => (*at > after).then_some(*at),
            Self::Interval { every_secs } => {
                Some(after + Duration::seconds(*every_secs as i64))
            }
            Self::Daily { hour, minute } => {
                let today = at_time(after.date_naive(), *hour, *minute)?;
                if today > after {
                    Some(today)
                } else {
                    at_time(after.date_naive() + Duration::days(1), *hour, *minute)
                }
            }
            Self::Weekly {
                weekday,
                hour,
                minute,
            } => {
                for offset in 0..8 {
                    let date = after.date_naive() + Duration::days(offset);
                    if date.weekday().num_days_from_monday() != *weekday {
                        continue;
                    }
                    if let Some(candidate) = at_time(date, *hour, *minute) {
                        if candidate > after {
                            return Some(candidate);
                        }
                    }
                }
                None
            }
            Self::Monthly { day, hour, minute } => {
                let mut year = after.year();
                let mut month = after.month();
                // Bounded search; a valid day-of-month recurs within a year.
                for _ in 0..14 {
                    if let Some(date) = NaiveDate::from_ymd_opt(year, month, *day) {
                        if let Some(candidate) = at_time(date, *hour, *minute) {
                            if candidate > after {
                                return Some(candidate);
                            }
                        }
                    }
                    month += 1;
                    if month > 12 {
                        month = 1;
                        year += 1;
                    }
                }
                None
            }
            Self::Cron { expression } => {
                let schedule = cron::Schedule::from_str(&normalize_cron(expression)).ok()?;
                schedule.after(&after).next()
            }
        }
    }
}

fn check_time(hour: u32, minute: u32) -> RobotResult<()> {
    if hour > 23 || minute > 59 {
        return Err(RobotError::Config(format!(
            "time {:02}:{:02} out of range",
            hour, minute
        )));
    }
    Ok(())
}

fn at_time(date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    date.and_hms_opt(hour, minute, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// The cron crate expects a seconds field; prepend one to 5-field
/// expressions.
fn normalize_cron(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    }
}

/// Whether a schedule may fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
    /// One-shot schedules end here after firing.
    Completed,
}

/// A registered schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub workflow_path: PathBuf,
    pub spec: ScheduleSpec,
    pub status: ScheduleStatus,
    #[serde(default)]
    pub variables: VariableMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
}

impl Schedule {
    pub fn new(name: impl Into<String>, workflow_path: PathBuf, spec: ScheduleSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            workflow_path,
            spec,
            status: ScheduleStatus::Active,
            variables: VariableMap::new(),
            created_at: now,
            updated_at: now,
            last_run_at: None,
            next_run_at: None,
            run_count: 0,
            success_count: 0,
            failure_count: 0,
        }
    }
}

/// Terminal status of one schedule fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// One entry in the scheduler's execution history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub schedule_id: String,
    pub schedule_name: String,
    pub workflow_path: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub error_message: String,
    /// Total attempts including retries.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

fn default_attempts() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn ts(s: &str) -> DateTime<Utc> {
        Utc.from_utc_datetime(&NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap())
    }

    #[test]
    fn test_once() {
        let at = ts("2025-06-01 12:00:00");
        let spec = ScheduleSpec::Once { at };
        assert_eq!(spec.next_fire(ts("2025-06-01 11:00:00")), Some(at));
        assert_eq!(spec.next_fire(at), None);
    }

    #[test]
    fn test_interval() {
        let spec = ScheduleSpec::Interval { every_secs: 3600 };
        assert_eq!(
            spec.next_fire(ts("2025-06-01 11:00:00")),
            Some(ts("2025-06-01 12:00:00"))
        );
    }

    #[test]
    fn test_daily_wraps() {
        let spec = ScheduleSpec::Daily { hour: 9, minute: 30 };
        assert_eq!(
            spec.next_fire(ts("2025-06-01 08:00:00")),
            Some(ts("2025-06-01 09:30:00"))
        );
        assert_eq!(
            spec.next_fire(ts("2025-06-01 10:00:00")),
            Some(ts("2025-06-02 09:30:00"))
        );
    }

    #[test]
    fn test_weekly() {
        // 2025-06-01 is a Sunday (weekday 6).
        let spec = ScheduleSpec::Weekly {
            weekday: 0,
            hour: 8,
            minute: 0,
        };
        assert_eq!(
            spec.next_fire(ts("2025-06-01 12:00:00")),
            Some(ts("2025-06-02 08:00:00"))
        );
    }

    #[test]
    fn test_monthly_skips_short_months() {
        let spec = ScheduleSpec::Monthly {
            day: 31,
            hour: 0,
            minute: 0,
        };
        // After January 31 the next month with a day 31 is March.
        assert_eq!(
            spec.next_fire(ts("2025-01-31 01:00:00")),
            Some(ts("2025-03-31 00:00:00"))
        );
    }

    #[test]
    fn test_cron_five_fields() {
        let spec = ScheduleSpec::Cron {
            expression: "*/15 * * * *".to_string(),
        };
        spec.validate().unwrap();
        assert_eq!(
            spec.next_fire(ts("2025-06-01 10:01:00")),
            Some(ts("2025-06-01 10:15:00"))
        );
    }

    #[test]
    fn test_cron_invalid() {
        let spec = ScheduleSpec::Cron {
            expression: "not a cron".to_string(),
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_ranges() {
        assert!(ScheduleSpec::Daily { hour: 24, minute: 0 }.validate().is_err());
        assert!(ScheduleSpec::Weekly {
            weekday: 7,
            hour: 0,
            minute: 0
        }
        .validate()
        .is_err());
        assert!(ScheduleSpec::Monthly {
            day: 0,
            hour: 0,
            minute: 0
        }
        .validate()
        .is_err());
        assert!(ScheduleSpec::Interval { every_secs: 0 }.validate().is_err());
    }
}
