//! In-memory visit counters

use chrono::{DateTime, Duration as ChronoDuration, LocalResult, NaiveTime, TimeZone};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tally_common::{SnapshotError, StatsSnapshot};
use tracing::{info, warn};

/// Calendar day of `now` in its own timezone, as `YYYY-MM-DD`
pub fn date_key<Tz>(now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    now.format("%Y-%m-%d").to_string()
}

/// First instant of the calendar day after `now`
///
/// When local midnight does not exist (a DST jump at 00:00) the first valid
/// hour of that day is used instead.
pub fn next_midnight<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Tz> {
    let tz = now.timezone();
    if let Some(tomorrow) = now.date_naive().succ_opt() {
        for hour in 0..3 {
            let Some(time) = NaiveTime::from_hms_opt(hour, 0, 0) else {
                continue;
            };
            match tz.from_local_datetime(&tomorrow.and_time(time)) {
                LocalResult::Single(at) => return at,
                LocalResult::Ambiguous(earliest, _) => return earliest,
                LocalResult::None => {}
            }
        }
    }
    now.clone() + ChronoDuration::days(1)
}

/// Wall-clock time left until [`next_midnight`]
pub fn until_next_midnight<Tz: TimeZone>(now: &DateTime<Tz>) -> Duration {
    (next_midnight(now) - now.clone())
        .to_std()
        .unwrap_or_default()
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    daily: BTreeMap<String, u64>,
}

/// Visit counters shared by every request handler and the persistence tasks
///
/// Both fields sit behind one mutex, so an increment is never observed
/// half-applied. Nothing inside the lock can fail or block on I/O.
#[derive(Debug, Default)]
pub struct StatsStore {
    inner: Mutex<Counters>,
}

impl StatsStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded from a previously persisted snapshot
    pub fn from_snapshot(snapshot: StatsSnapshot) -> Self {
        Self {
            inner: Mutex::new(Counters {
                total: snapshot.total,
                daily: snapshot.daily,
            }),
        }
    }

    /// Restore the store from `path`, starting empty if it cannot be read
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match StatsSnapshot::load(path) {
            Ok(snapshot) => {
                info!(
                    "Restored stats from {} (total {})",
                    path.display(),
                    snapshot.total
                );
                Self::from_snapshot(snapshot)
            }
            Err(SnapshotError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                info!("No stats file at {}, starting empty", path.display());
                Self::new()
            }
            Err(e) => {
                warn!(
                    "Failed to load stats from {}: {}, starting empty",
                    path.display(),
                    e
                );
                Self::new()
            }
        }
    }

    // A panic while holding the guard cannot leave the counters half
    // updated, so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count one visit against the total and the day of `now`
    pub fn increment<Tz>(&self, now: &DateTime<Tz>)
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let day = date_key(now);
        let mut counters = self.lock();
        counters.total = counters.total.saturating_add(1);
        let count = counters.daily.entry(day).or_insert(0);
        *count = count.saturating_add(1);
    }

    /// Consistent copy of both counters
    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = self.lock();
        StatsSnapshot {
            total: counters.total,
            daily: counters.daily.clone(),
        }
    }

    /// Lifetime total
    pub fn total(&self) -> u64 {
        self.lock().total
    }

    /// Count for `day`, zero if nothing was recorded
    pub fn daily(&self, day: &str) -> u64 {
        self.lock().daily.get(day).copied().unwrap_or(0)
    }

    /// Zero the count for `day`, leaving the total alone
    pub fn reset_day(&self, day: &str) {
        self.lock().daily.insert(day.to_string(), 0);
    }
}
