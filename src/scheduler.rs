//! Rest-window scheduling: a periodic tick that starts the encoder
//! pool inside the window and stops it outside, unless the operator
//! has taken manual control.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{Datelike, Local, NaiveDateTime, NaiveTime};
use serde::Serialize;
use tracing::{error, info};

use crate::db::Database;
use crate::domain::{ScheduleConfig, parse_hhmm};
use crate::encoder::EncoderPool;
use crate::sync_ext::MutexExt;

/// Active hours reported by the host (start hour, end hour), when the
/// platform exposes such metadata. The rest window is their
/// complement. Hosts without the concept return `None` and the
/// configured window applies.
pub fn host_active_hours() -> Option<(u32, u32)> {
    None
}

fn host_rest_window() -> Option<(NaiveTime, NaiveTime)> {
    let (active_start, active_end) = host_active_hours()?;
    let rest_start = NaiveTime::from_hms_opt(active_end % 24, 0, 0)?;
    let rest_end = NaiveTime::from_hms_opt(active_start % 24, 0, 0)?;
    Some((rest_start, rest_end))
}

/// Whether `now` falls inside the configured rest window.
///
/// `host_rest` overrides the configured times when
/// `use_host_rest_hours` is set. An end at or before the start means
/// the window spans midnight.
pub fn window_contains(
    config: &ScheduleConfig,
    host_rest: Option<(NaiveTime, NaiveTime)>,
    now: NaiveDateTime,
) -> bool {
    if !config.enabled {
        return false;
    }
    let weekday = now.weekday().num_days_from_monday() as u8;
    if !config.days_of_week.contains(&weekday) {
        return false;
    }

    let (start, end) = if config.use_host_rest_hours {
        match host_rest {
            Some(window) => window,
            None => match (parse_hhmm(&config.start_time), parse_hhmm(&config.end_time)) {
                (Some(start), Some(end)) => (start, end),
                _ => return false,
            },
        }
    } else {
        match (parse_hhmm(&config.start_time), parse_hhmm(&config.end_time)) {
            (Some(start), Some(end)) => (start, end),
            _ => return false,
        }
    };

    let time = now.time();
    if start <= end {
        start <= time && time <= end
    } else {
        time >= start || time <= end
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub enabled: bool,
    pub manual_override: bool,
    pub within_window: bool,
    pub pool_running: bool,
    pub config: ScheduleConfig,
}

pub struct Scheduler {
    db: Arc<Database>,
    pool: Arc<EncoderPool>,
    tick_interval: Duration,
    manual_override: AtomicBool,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tick_interval", &self.tick_interval)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(db: Arc<Database>, pool: Arc<EncoderPool>, tick_interval: Duration) -> Self {
        Self {
            db,
            pool,
            tick_interval,
            manual_override: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let scheduler = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("recodarr-scheduler".to_string())
            .spawn(move || {
                while scheduler.running.load(Ordering::SeqCst) {
                    scheduler.tick();
                    let seconds = scheduler.tick_interval.as_secs().max(1);
                    for _ in 0..seconds {
                        if !scheduler.running.load(Ordering::SeqCst) {
                            return;
                        }
                        std::thread::sleep(Duration::from_secs(1));
                    }
                }
            })
            .ok();
        *self.handle.lock_unpoisoned() = handle;
        info!(tick_s = self.tick_interval.as_secs(), "scheduler started");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock_unpoisoned().take() {
            let _ = handle.join();
        }
        info!("scheduler stopped");
    }

    /// One scheduling decision. Public so operators (and tests) can
    /// force an immediate evaluation.
    pub fn tick(&self) {
        if self.manual_override.load(Ordering::SeqCst) {
            return;
        }
        let config = match self.db.schedule() {
            Ok(config) => config,
            Err(err) => {
                error!(error = %err, "could not load schedule");
                return;
            }
        };
        let within = window_contains(&config, host_rest_window(), Local::now().naive_local());
        let pool_running = self.pool.is_running();

        if within && !pool_running {
            info!("rest window open, starting encoder pool");
            self.pool.start();
        } else if !within && pool_running {
            info!("rest window closed, stopping encoder pool");
            self.pool.stop();
        }
    }

    /// Operator start: runs the pool now and pins it against the tick.
    pub fn manual_start(&self) {
        self.manual_override.store(true, Ordering::SeqCst);
        self.pool.start();
        info!("manual override: encoding started");
    }

    /// Operator stop: halts the pool and pins it against the tick.
    pub fn manual_stop(&self) {
        self.manual_override.store(true, Ordering::SeqCst);
        self.pool.stop();
        info!("manual override: encoding stopped");
    }

    /// Give control back to the schedule.
    pub fn clear_override(&self) {
        self.manual_override.store(false, Ordering::SeqCst);
        info!("manual override cleared");
    }

    pub fn manual_override(&self) -> bool {
        self.manual_override.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> crate::error::StorageResult<SchedulerStatus> {
        let config = self.db.schedule()?;
        Ok(SchedulerStatus {
            enabled: config.enabled,
            manual_override: self.manual_override(),
            within_window: window_contains(
                &config,
                host_rest_window(),
                Local::now().naive_local(),
            ),
            pool_running: self.pool.is_running(),
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn overnight_config() -> ScheduleConfig {
        ScheduleConfig {
            enabled: true,
            days_of_week: (0..=6).collect(),
            start_time: "22:00".to_string(),
            end_time: "06:00".to_string(),
            use_host_rest_hours: false,
            max_concurrent_jobs: 1,
        }
    }

    fn at(date: NaiveDate, h: u32, m: u32) -> NaiveDateTime {
        date.and_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn disabled_schedule_is_never_within() {
        let mut config = overnight_config();
        config.enabled = false;
        let monday = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        assert!(!window_contains(&config, None, at(monday, 23, 0)));
    }

    #[test]
    fn daytime_window_is_inclusive_on_both_ends() {
        let mut config = overnight_config();
        config.start_time = "09:00".to_string();
        config.end_time = "17:00".to_string();
        let monday = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        assert!(!window_contains(&config, None, at(monday, 8, 59)));
        assert!(window_contains(&config, None, at(monday, 9, 0)));
        assert!(window_contains(&config, None, at(monday, 12, 30)));
        assert!(window_contains(&config, None, at(monday, 17, 0)));
        assert!(!window_contains(&config, None, at(monday, 17, 1)));
    }

    #[test]
    fn overnight_window_is_correct_for_every_minute_of_a_week() {
        let config = overnight_config();
        let start = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        for day in 0..7 {
            let date = start + chrono::Duration::days(day);
            for hour in 0..24 {
                for minute in 0..60 {
                    let now = at(date, hour, minute);
                    let expected = hour >= 22 || hour < 6 || (hour == 6 && minute == 0);
                    assert_eq!(
                        window_contains(&config, None, now),
                        expected,
                        "at {now}"
                    );
                }
            }
        }
    }

    #[test]
    fn day_filter_applies_to_the_calendar_day() {
        let mut config = overnight_config();
        // Monday only.
        config.days_of_week = [0u8].into_iter().collect();
        let monday = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        let tuesday = NaiveDate::from_ymd_opt(2026, 1, 6).unwrap();

        assert!(window_contains(&config, None, at(monday, 23, 0)));
        // Tuesday 01:00 is outside: the overnight tail belongs to the
        // calendar day it falls on.
        assert!(!window_contains(&config, None, at(tuesday, 1, 0)));
    }

    #[test]
    fn host_rest_hours_complement_active_hours() {
        let mut config = overnight_config();
        config.use_host_rest_hours = true;
        // Host says active 08–22, so rest is 22 → 08.
        let host_rest = Some((
            NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
        ));
        let monday = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        assert!(window_contains(&config, host_rest, at(monday, 23, 30)));
        assert!(window_contains(&config, host_rest, at(monday, 7, 0)));
        assert!(!window_contains(&config, host_rest, at(monday, 12, 0)));

        // Without host metadata the configured window applies.
        assert!(window_contains(&config, None, at(monday, 23, 30)));
        assert!(!window_contains(&config, None, at(monday, 7, 0)));
    }

    #[test]
    fn garbage_times_never_match() {
        let mut config = overnight_config();
        config.start_time = "25:99".to_string();
        let monday = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        assert!(!window_contains(&config, None, at(monday, 23, 0)));
    }

    #[test]
    fn scenario_window_closes_at_six() {
        // Job running at 05:55 must be stopped by the 06:01 tick.
        let config = overnight_config();
        let day = NaiveDate::from_ymd_opt(2026, 1, 7).unwrap();
        assert!(window_contains(&config, None, at(day, 5, 55)));
        assert!(window_contains(&config, None, at(day, 6, 0)));
        assert!(!window_contains(&config, None, at(day, 6, 1)));
    }
}
