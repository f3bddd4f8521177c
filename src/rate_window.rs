//! Rolling-window quota for irreversible remote actions.
//!
//! The window is persisted to disk after every recorded action so the
//! quota survives process restarts. Only the timestamp list is stored;
//! limits come from configuration.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::Result;

/// Timestamps (ms since the Unix epoch) of recent actions plus the quota they
/// are checked against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateWindow {
    timestamps: Vec<u64>,
    limit_per_window: usize,
    window: Duration,
}

impl RateWindow {
    /// Empty window admitting `limit_per_window` actions per `window`.
    pub fn new(limit_per_window: usize, window: Duration) -> Self {
        Self {
            timestamps: Vec::new(),
            limit_per_window,
            window,
        }
    }

    /// Replace the recorded timestamps (ms since the Unix epoch).
    pub fn with_timestamps(mut self, mut timestamps: Vec<u64>) -> Self {
        timestamps.sort_unstable();
        self.timestamps = timestamps;
        self
    }

    /// Recorded timestamps in ascending order.
    pub fn timestamps(&self) -> &[u64] {
        &self.timestamps
    }

    /// Maximum number of actions per window.
    pub fn limit_per_window(&self) -> usize {
        self.limit_per_window
    }

    /// Length of the rolling window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Actions counted against the quota at `now_ms`. A timestamp exactly one
    /// window old has aged out; one later than `now_ms` (clock skew) still counts.
    pub fn used_at(&self, now_ms: u64) -> usize {
        self.timestamps
            .iter()
            .filter(|&&t| self.in_window(t, now_ms))
            .count()
    }

    /// Actions that still fit in the window at `now_ms`.
    pub fn remaining_at(&self, now_ms: u64) -> usize {
        self.limit_per_window.saturating_sub(self.used_at(now_ms))
    }

    /// Whether `count` more actions fit in the window at `now_ms`.
    pub fn admits(&self, count: usize, now_ms: u64) -> bool {
        count <= self.remaining_at(now_ms)
    }

    /// Earliest instant at which one more action would be admitted, if the
    /// window is currently full.
    pub fn next_slot_at(&self, now_ms: u64) -> Option<u64> {
        if self.remaining_at(now_ms) > 0 {
            return None;
        }
        let window_ms = self.window_ms();
        self.timestamps
            .iter()
            .filter(|&&t| self.in_window(t, now_ms))
            .min()
            .map(|&oldest| oldest + window_ms)
    }

    /// Record an executed action and drop timestamps that have aged out.
    pub fn record(&mut self, at_ms: u64) {
        self.prune(at_ms);
        let at = self.timestamps.partition_point(|&t| t <= at_ms);
        self.timestamps.insert(at, at_ms);
    }

    /// Drop timestamps that no longer count at `now_ms`.
    pub fn prune(&mut self, now_ms: u64) {
        let window_ms = self.window_ms();
        self.timestamps
            .retain(|&t| t > now_ms || now_ms - t < window_ms);
    }

    fn in_window(&self, t: u64, now_ms: u64) -> bool {
        t > now_ms || now_ms - t < self.window_ms()
    }

    fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredWindow {
    timestamps: Vec<u64>,
}

/// File-backed persistence for a [`RateWindow`].
#[derive(Debug, Clone)]
pub struct RateWindowStore {
    path: PathBuf,
}

impl RateWindowStore {
    /// Store backed by the JSON file at `path`. The file is created on first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored timestamps. A missing file is an empty window. A
    /// corrupt file is an error: an unreadable quota must not reset to zero.
    pub async fn load(&self, limit_per_window: usize, window: Duration) -> Result<RateWindow> {
        let base = RateWindow::new(limit_per_window, window);
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(base),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<StoredWindow>(&text) {
            Ok(stored) => Ok(base.with_timestamps(stored.timestamps)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "rate window file is corrupt");
                Err(e.into())
            }
        }
    }

    /// Write through a temporary file so a crash never leaves a truncated window.
    pub async fn save(&self, window: &RateWindow) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let stored = StoredWindow {
            timestamps: window.timestamps.clone(),
        };
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(&stored)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), count = stored.timestamps.len(), "rate window saved");
        Ok(())
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);
    const DAY_MS: u64 = 24 * 60 * 60 * 1000;

    #[test]
    fn full_window_rejects_then_admits_after_age_out() {
        let now = 10 * DAY_MS;
        let stamps: Vec<u64> = (1..=10).map(|i| now - i * 60_000).collect();
        let window = RateWindow::new(10, DAY).with_timestamps(stamps);

        assert!(!window.admits(1, now));
        assert_eq!(window.next_slot_at(now), Some(now - 10 * 60_000 + DAY_MS));

        // The oldest entry crosses the boundary ten minutes later.
        let later = now + 10 * 60_000;
        assert!(window.admits(1, later));
        assert!(!window.admits(2, later));
    }

    #[test]
    fn boundary_timestamp_has_aged_out() {
        let now = 5 * DAY_MS;
        let window = RateWindow::new(1, DAY).with_timestamps(vec![now - DAY_MS]);
        assert_eq!(window.used_at(now), 0);
        assert!(window.admits(1, now));
    }

    #[test]
    fn record_prunes_expired_entries() {
        let now = 5 * DAY_MS;
        let mut window = RateWindow::new(10, DAY).with_timestamps(vec![now - 2 * DAY_MS, now - 1000]);
        window.record(now);
        assert_eq!(window.timestamps(), &[now - 1000, now]);
    }

    #[test]
    fn timestamps_ahead_of_the_clock_still_count() {
        let now = 5 * DAY_MS;
        let ahead: Vec<u64> = (1..=10).map(|i| now + i * 60_000).collect();
        let mut window = RateWindow::new(10, DAY).with_timestamps(ahead);

        assert_eq!(window.used_at(now), 10);
        assert!(!window.admits(1, now));
        assert_eq!(window.next_slot_at(now), Some(now + 60_000 + DAY_MS));

        window.record(now);
        assert_eq!(window.timestamps().len(), 11);
        assert_eq!(window.timestamps()[0], now);
    }

    #[tokio::test]
    async fn store_round_trips_and_tolerates_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RateWindowStore::new(dir.path().join("nested").join("comments.json"));

        let empty = store.load(10, DAY).await.unwrap();
        assert!(empty.timestamps().is_empty());

        let mut window = empty;
        window.record(1_000);
        window.record(2_000);
        store.save(&window).await.unwrap();

        let reloaded = store.load(10, DAY).await.unwrap();
        assert_eq!(reloaded.timestamps(), &[1_000, 2_000]);
    }

    #[tokio::test]
    async fn corrupt_file_fails_closed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("window.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let err = RateWindowStore::new(&path).load(10, DAY).await.unwrap_err();
        assert!(matches!(err, crate::errors::SyncError::Json(_)));
    }
}
