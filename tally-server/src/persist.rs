//! Snapshot persistence and day rollover

use crate::store::{date_key, next_midnight, until_next_midnight, StatsStore};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tally_common::SnapshotError;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Source of "now" for the rollover task
pub type Clock = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

/// Wall-clock time in the process timezone
pub fn system_clock() -> Clock {
    Arc::new(Local::now)
}

/// Single writer for the snapshot file
///
/// The write lock is separate from the store's own guard; the store is only
/// locked long enough to copy the counters.
pub struct Persister {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Persister {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the current counters to disk
    pub async fn flush(&self, store: &StatsStore) -> Result<(), SnapshotError> {
        let _guard = self.write_lock.lock().await;

        // Copy under the write lock so a later write never carries older data
        let snapshot = store.snapshot();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || snapshot.save(&path))
            .await
            .map_err(|e| SnapshotError::Io(std::io::Error::other(e)))?
    }

    /// Flush and log the outcome; the store stays authoritative either way
    pub async fn flush_logged(&self, store: &StatsStore) {
        match self.flush(store).await {
            Ok(()) => debug!("Saved stats to {}", self.path.display()),
            Err(e) => error!("Failed to save stats to {}: {}", self.path.display(), e),
        }
    }
}

/// Background flush and rollover tasks
pub struct Scheduler {
    store: Arc<StatsStore>,
    persister: Arc<Persister>,
    shutdown: watch::Sender<bool>,
    flush_handle: JoinHandle<()>,
    rollover_handle: JoinHandle<()>,
}

impl Scheduler {
    /// Start both triggers using the system clock
    pub fn spawn(store: Arc<StatsStore>, persister: Arc<Persister>, interval: Duration) -> Self {
        Self::spawn_with_clock(store, persister, interval, system_clock())
    }

    pub fn spawn_with_clock(
        store: Arc<StatsStore>,
        persister: Arc<Persister>,
        interval: Duration,
        clock: Clock,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);

        let flush_handle = tokio::spawn(run_flush_loop(
            store.clone(),
            persister.clone(),
            interval,
            shutdown_rx.clone(),
        ));
        let rollover_handle = tokio::spawn(run_rollover_loop(
            store.clone(),
            persister.clone(),
            clock,
            shutdown_rx,
        ));

        info!(
            "Persisting stats to {} every {:?}",
            persister.path().display(),
            interval
        );

        Self {
            store,
            persister,
            shutdown,
            flush_handle,
            rollover_handle,
        }
    }

    /// Stop both triggers and write one final snapshot
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);

        for (name, handle) in [
            ("flush", self.flush_handle),
            ("rollover", self.rollover_handle),
        ] {
            if let Err(e) = handle.await {
                error!("Stats {} task failed: {}", name, e);
            }
        }

        self.persister.flush_logged(&self.store).await;
        info!("Final stats flush to {}", self.persister.path().display());
    }
}

async fn run_flush_loop(
    store: Arc<StatsStore>,
    persister: Arc<Persister>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    // First tick one interval from now; startup state was just loaded
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => persister.flush_logged(&store).await,
            _ = shutdown.changed() => break,
        }
    }
}

async fn run_rollover_loop(
    store: Arc<StatsStore>,
    persister: Arc<Persister>,
    clock: Clock,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        // Recomputed every round; a midnight timer only fires once
        let armed_at = clock();
        let midnight = next_midnight(&armed_at);
        let wait = until_next_midnight(&armed_at);
        debug!("Next stats rollover in {:?}", wait);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                let today = rollover_key(&midnight, &clock());
                store.reset_day(&today);
                info!("Rolled over daily count for {}", today);
                persister.flush_logged(&store).await;
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Day to zero when the rollover timer fires
///
/// The key comes from the clock at fire time, not when the timer was armed.
/// The timer runs on the monotonic clock, so the wall clock may still read
/// the day that just ended; that day is never zeroed.
fn rollover_key(midnight: &DateTime<Local>, now: &DateTime<Local>) -> String {
    date_key(now.max(midnight))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tally_common::StatsSnapshot;
    use tempfile::TempDir;

    fn fixed_clock(hour: u32, min: u32) -> Clock {
        let now = Local
            .with_ymd_and_hms(2024, 1, 1, hour, min, 0)
            .earliest()
            .unwrap();
        Arc::new(move || now)
    }

    fn local(day: u32, hour: u32, min: u32, sec: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 1, day, hour, min, sec)
            .earliest()
            .unwrap()
    }

    /// Hands out `times` one call at a time, then repeats the last one
    fn step_clock(times: Vec<DateTime<Local>>) -> Clock {
        let calls = std::sync::atomic::AtomicUsize::new(0);
        Arc::new(move || {
            let call = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            times[call.min(times.len() - 1)]
        })
    }

    fn seeded_store(days: &[(&str, u64)]) -> Arc<StatsStore> {
        let daily: std::collections::BTreeMap<String, u64> = days
            .iter()
            .map(|(day, count)| (day.to_string(), *count))
            .collect();
        let total = daily.values().sum();
        Arc::new(StatsStore::from_snapshot(StatsSnapshot { total, daily }))
    }

    /// Let paused time run in one-second steps until `done` holds
    async fn advance_until(limit_secs: u64, mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..limit_secs {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        done()
    }

    fn saved_total(path: &Path) -> Option<u64> {
        StatsSnapshot::load(path).ok().map(|snapshot| snapshot.total)
    }

    #[tokio::test]
    async fn test_flush_writes_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("count.json");
        let store = StatsStore::new();
        store.increment(&Local::now());
        store.increment(&Local::now());

        let persister = Persister::new(&path);
        persister.flush(&store).await.unwrap();

        let saved = StatsSnapshot::load(&path).unwrap();
        assert_eq!(saved, store.snapshot());
        assert_eq!(saved.total, 2);
    }

    #[tokio::test]
    async fn test_flush_error_is_reported() {
        let dir = TempDir::new().unwrap();
        // A directory cannot be replaced by the snapshot file
        let path = dir.path().join("taken");
        std::fs::create_dir_all(path.join("child")).unwrap();

        let store = StatsStore::new();
        let persister = Persister::new(&path);
        assert!(persister.flush(&store).await.is_err());

        // Logged failures leave the store untouched
        store.increment(&Local::now());
        persister.flush_logged(&store).await;
        assert_eq!(store.total(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_flushes_leave_valid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("count.json");
        let store = Arc::new(StatsStore::new());
        let persister = Arc::new(Persister::new(&path));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let persister = persister.clone();
            tasks.push(tokio::spawn(async move {
                store.increment(&Local::now());
                persister.flush(&store).await
            }));
        }
        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        let saved = StatsSnapshot::load(&path).unwrap();
        assert_eq!(saved.total, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("count.json");
        let store = Arc::new(StatsStore::new());
        let persister = Arc::new(Persister::new(&path));

        let scheduler = Scheduler::spawn_with_clock(
            store.clone(),
            persister,
            Duration::from_secs(10),
            fixed_clock(12, 0),
        );
        store.increment(&Local::now());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!path.exists());

        // First tick lands at 10s, well before shutdown
        assert!(advance_until(15, || saved_total(&path) == Some(1)).await);

        store.increment(&Local::now());
        assert!(advance_until(15, || saved_total(&path) == Some(2)).await);

        store.increment(&Local::now());
        scheduler.shutdown().await;
        assert_eq!(saved_total(&path), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollover_rearms_for_each_midnight() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("count.json");
        let store = seeded_store(&[("2024-01-01", 5), ("2024-01-02", 3), ("2024-01-03", 2)]);

        // Armed and fired alternately: two midnights, then a quiet afternoon
        let clock = step_clock(vec![
            local(1, 23, 59, 0),
            local(2, 0, 0, 0),
            local(2, 23, 59, 0),
            local(3, 0, 0, 0),
            local(3, 12, 0, 0),
        ]);
        let scheduler = Scheduler::spawn_with_clock(
            store.clone(),
            Arc::new(Persister::new(&path)),
            Duration::from_secs(3600),
            clock,
        );

        let rolled = advance_until(600, || {
            store.daily("2024-01-02") == 0 && store.daily("2024-01-03") == 0
        })
        .await;
        scheduler.shutdown().await;

        assert!(rolled);
        assert_eq!(store.daily("2024-01-01"), 5);
        assert_eq!(store.total(), 10);

        let saved = StatsSnapshot::load(&path).unwrap();
        assert_eq!(saved.daily.get("2024-01-01"), Some(&5));
        assert_eq!(saved.daily.get("2024-01-02"), Some(&0));
        assert_eq!(saved.daily.get("2024-01-03"), Some(&0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollover_with_lagging_wall_clock() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&[("2024-01-01", 5), ("2024-01-02", 1)]);

        // Timer fires while the wall clock still reads the old day
        let clock = step_clock(vec![
            local(1, 23, 59, 0),
            local(1, 23, 59, 58),
            local(2, 12, 0, 0),
        ]);
        let scheduler = Scheduler::spawn_with_clock(
            store.clone(),
            Arc::new(Persister::new(dir.path().join("count.json"))),
            Duration::from_secs(3600),
            clock,
        );

        let rolled = advance_until(600, || store.daily("2024-01-02") == 0).await;
        scheduler.shutdown().await;

        assert!(rolled);
        assert_eq!(store.daily("2024-01-01"), 5);
    }

    #[test]
    fn test_rollover_key() {
        let midnight = local(2, 0, 0, 0);
        assert_eq!(rollover_key(&midnight, &local(2, 0, 0, 1)), "2024-01-02");
        assert_eq!(rollover_key(&midnight, &local(1, 23, 59, 59)), "2024-01-02");
        // A late timer still uses the day it actually fired on
        assert_eq!(rollover_key(&midnight, &local(3, 0, 5, 0)), "2024-01-03");
    }

    #[tokio::test(start_paused = true)]
    async fn test_midnight_rollover_resets_today() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("count.json");
        let store = seeded_store(&[("2024-01-02", 5)]);

        // Armed one minute before midnight, fires on the new day
        let clock = step_clock(vec![
            local(1, 23, 59, 0),
            local(2, 0, 0, 0),
            local(2, 12, 0, 0),
        ]);
        let scheduler = Scheduler::spawn_with_clock(
            store.clone(),
            Arc::new(Persister::new(&path)),
            Duration::from_secs(3600),
            clock,
        );

        let rolled = advance_until(600, || saved_total(&path).is_some()).await;
        assert!(rolled);
        scheduler.shutdown().await;

        assert_eq!(store.daily("2024-01-02"), 0);
        assert_eq!(store.total(), 5);

        let saved = StatsSnapshot::load(&path).unwrap();
        assert_eq!(saved.daily.get("2024-01-02"), Some(&0));
        assert_eq!(saved.total, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_rollover_before_midnight() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StatsStore::new());
        let now = Local.with_ymd_and_hms(2024, 1, 1, 22, 0, 0).earliest().unwrap();
        store.increment(&now);

        let scheduler = Scheduler::spawn_with_clock(
            store.clone(),
            Arc::new(Persister::new(dir.path().join("count.json"))),
            Duration::from_secs(3600),
            fixed_clock(22, 0),
        );

        tokio::time::sleep(Duration::from_secs(30 * 60)).await;
        scheduler.shutdown().await;

        assert_eq!(store.daily("2024-01-01"), 1);
    }
}
