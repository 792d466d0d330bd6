use rusqlite::params;

use super::Database;
use crate::domain::ScheduleConfig;
use crate::error::StorageResult;

impl Database {
    /// Read the singleton schedule row (seeded at startup).
    pub fn schedule(&self) -> StorageResult<ScheduleConfig> {
        self.with_conn(|conn| {
            let (enabled, days_csv, start, end, host_rest, max_jobs): (
                bool,
                String,
                String,
                String,
                bool,
                i64,
            ) = conn.query_row(
                "SELECT enabled, days_of_week, start_time, end_time, use_host_rest_hours, \
                 max_concurrent_jobs FROM schedule ORDER BY id LIMIT 1",
                [],
                |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                        r.get(5)?,
                    ))
                },
            )?;
            Ok(ScheduleConfig {
                enabled,
                days_of_week: ScheduleConfig::days_from_csv(&days_csv),
                start_time: start,
                end_time: end,
                use_host_rest_hours: host_rest,
                max_concurrent_jobs: max_jobs.clamp(1, 64) as u32,
            })
        })
    }

    pub fn save_schedule(&self, config: &ScheduleConfig) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE schedule SET enabled = ?1, days_of_week = ?2, start_time = ?3, \
                 end_time = ?4, use_host_rest_hours = ?5, max_concurrent_jobs = ?6",
                params![
                    config.enabled,
                    config.days_csv(),
                    config.start_time,
                    config.end_time,
                    config.use_host_rest_hours,
                    i64::from(config.max_concurrent_jobs),
                ],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_round_trips() {
        let db = Database::open_in_memory().unwrap();
        let mut config = db.schedule().unwrap();
        config.enabled = true;
        config.days_of_week = [0u8, 1, 2, 3, 4].into_iter().collect();
        config.start_time = "23:30".to_string();
        config.end_time = "05:45".to_string();
        config.max_concurrent_jobs = 2;
        db.save_schedule(&config).unwrap();

        let loaded = db.schedule().unwrap();
        assert_eq!(loaded, config);
    }
}
