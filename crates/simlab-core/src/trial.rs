use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

pub const TRIAL_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Identity of one trial as encoded in its directory name:
/// `<task_id>_<repeat_index>_<YYYYmmdd>_<HHMMSS>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialName {
    pub task_id: String,
    pub repeat_index: usize,
    pub timestamp: String,
}

pub fn trial_dir_name<Tz>(task_id: &str, repeat_index: usize, started_at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    format!(
        "{}_{}_{}",
        task_id,
        repeat_index,
        started_at.format(TRIAL_TIMESTAMP_FORMAT)
    )
}

/// Parses from the right so task ids may themselves contain underscores.
pub fn parse_trial_dir_name(name: &str) -> Option<TrialName> {
    let mut parts = name.rsplitn(4, '_');
    let time = parts.next()?;
    let date = parts.next()?;
    let repeat = parts.next()?;
    let task_id = parts.next()?;
    if task_id.is_empty() || !all_digits(time, 6) || !all_digits(date, 8) {
        return None;
    }
    if repeat.is_empty() || !repeat.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(TrialName {
        task_id: task_id.to_string(),
        repeat_index: repeat.parse().ok()?,
        timestamp: format!("{}_{}", date, time),
    })
}

fn all_digits(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| b.is_ascii_digit())
}
