use std::collections::BTreeSet;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

/// The singleton rest-window configuration.
///
/// Days use 0 = Monday .. 6 = Sunday. Times are `HH:MM` local; an end
/// at or before the start means the window spans midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub days_of_week: BTreeSet<u8>,
    pub start_time: String,
    pub end_time: String,
    pub use_host_rest_hours: bool,
    pub max_concurrent_jobs: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            days_of_week: (0..=6).collect(),
            start_time: "22:00".to_string(),
            end_time: "06:00".to_string(),
            use_host_rest_hours: false,
            max_concurrent_jobs: 1,
        }
    }
}

impl ScheduleConfig {
    /// Days as the persisted CSV form, e.g. `"0,1,2,3,4,5,6"`.
    pub fn days_csv(&self) -> String {
        self.days_of_week
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parse the persisted CSV day list, dropping anything outside
    /// 0..=6. An unparseable list falls back to all days.
    pub fn days_from_csv(csv: &str) -> BTreeSet<u8> {
        let days: BTreeSet<u8> = csv
            .split(',')
            .filter_map(|part| part.trim().parse::<u8>().ok())
            .filter(|d| *d <= 6)
            .collect();
        if days.is_empty() { (0..=6).collect() } else { days }
    }
}

/// Parse an `HH:MM` clock string.
pub fn parse_hhmm(value: &str) -> Option<NaiveTime> {
    let (h, m) = value.split_once(':')?;
    let hour: u32 = h.trim().parse().ok()?;
    let minute: u32 = m.trim().parse().ok()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hhmm_parsing() {
        assert_eq!(parse_hhmm("22:00"), NaiveTime::from_hms_opt(22, 0, 0));
        assert_eq!(parse_hhmm("06:30"), NaiveTime::from_hms_opt(6, 30, 0));
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("nope"), None);
        assert_eq!(parse_hhmm("12"), None);
    }

    #[test]
    fn days_csv_round_trip() {
        let mut cfg = ScheduleConfig::default();
        cfg.days_of_week = [0u8, 2, 4].into_iter().collect();
        assert_eq!(cfg.days_csv(), "0,2,4");
        assert_eq!(ScheduleConfig::days_from_csv("0,2,4"), cfg.days_of_week);
    }

    #[test]
    fn bad_day_lists_fall_back_to_all_days() {
        assert_eq!(ScheduleConfig::days_from_csv("").len(), 7);
        assert_eq!(ScheduleConfig::days_from_csv("8,9").len(), 7);
        assert_eq!(ScheduleConfig::days_from_csv("1,8").len(), 1);
    }
}
