//! Time-series store for decoded signal values
//!
//! One series per (session, catalog, message key, signal). Series are
//! append-only with non-decreasing timestamps and hold a bounded number of
//! points; the oldest point is dropped when a series is full.

use crate::shared::{read, write};
use crate::types::{CatalogKey, MessageKey};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, RwLock};

/// Identity of one series
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub session_id: Arc<str>,
    pub catalog: CatalogKey,
    /// Standard and extended frames with the same id are different series
    pub message: MessageKey,
    pub signal: String,
}

impl SeriesKey {
    pub fn new(
        session_id: impl Into<Arc<str>>,
        catalog: impl Into<CatalogKey>,
        message: MessageKey,
        signal: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            catalog: catalog.into(),
            message,
            signal: signal.into(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.session_id, self.catalog, self.message, self.signal
        )
    }
}

/// One sample: session timestamp and physical value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    pub timestamp_us: u64,
    pub value: f64,
}

/// Inclusive timestamp window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start_us: u64,
    pub end_us: u64,
}

impl TimeRange {
    /// Every timestamp
    pub fn all() -> Self {
        Self {
            start_us: 0,
            end_us: u64::MAX,
        }
    }

    /// `start_us <= t <= end_us`
    pub fn between(start_us: u64, end_us: u64) -> Self {
        Self { start_us, end_us }
    }

    /// `t >= start_us`
    pub fn since(start_us: u64) -> Self {
        Self {
            start_us,
            end_us: u64::MAX,
        }
    }
}

/// DataStore statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataStoreStats {
    pub series: usize,
    pub points: usize,
    pub appended: u64,
    /// Points older than the last point of their series
    pub rejected: u64,
    /// Points dropped because a series was full
    pub evicted: u64,
}

#[derive(Debug, Default)]
struct StoreInner {
    series: HashMap<SeriesKey, VecDeque<SeriesPoint>>,
    appended: u64,
    rejected: u64,
    evicted: u64,
}

impl StoreInner {
    fn push(&mut self, key: SeriesKey, point: SeriesPoint, max_points: usize) -> bool {
        let series = self.series.entry(key).or_default();
        if series
            .back()
            .is_some_and(|last| point.timestamp_us < last.timestamp_us)
        {
            self.rejected += 1;
            return false;
        }

        if series.len() == max_points {
            series.pop_front();
            self.evicted += 1;
        }
        series.push_back(point);
        self.appended += 1;
        true
    }
}

/// Keyed, bounded time-series store
#[derive(Debug)]
pub struct DataStore {
    max_points: usize,
    inner: RwLock<StoreInner>,
}

impl DataStore {
    /// Create a store keeping at most `max_points` per series
    pub fn new(max_points: usize) -> Self {
        Self {
            max_points: max_points.max(1),
            inner: RwLock::new(StoreInner::default()),
        }
    }

    /// Append one point; `false` if it is older than the series' last point
    pub fn append(&self, key: SeriesKey, point: SeriesPoint) -> bool {
        write(&self.inner).push(key, point, self.max_points)
    }

    /// Append several points under one lock; returns how many were accepted
    pub fn append_batch(&self, points: impl IntoIterator<Item = (SeriesKey, SeriesPoint)>) -> usize {
        let mut inner = write(&self.inner);
        points
            .into_iter()
            .filter(|(key, point)| inner.push(key.clone(), *point, self.max_points))
            .count()
    }

    /// Points of a series inside the window, in timestamp order
    pub fn query(&self, key: &SeriesKey, range: TimeRange) -> Vec<SeriesPoint> {
        let inner = read(&self.inner);
        let Some(series) = inner.series.get(key) else {
            return Vec::new();
        };
        if range.end_us < range.start_us {
            return Vec::new();
        }
        let start = series.partition_point(|p| p.timestamp_us < range.start_us);
        let end = series.partition_point(|p| p.timestamp_us <= range.end_us);
        series.range(start..end).copied().collect()
    }

    /// Newest point of a series
    pub fn latest(&self, key: &SeriesKey) -> Option<SeriesPoint> {
        read(&self.inner)
            .series
            .get(key)
            .and_then(|s| s.back().copied())
    }

    /// All series keys, sorted
    pub fn keys(&self) -> Vec<SeriesKey> {
        let mut keys: Vec<_> = read(&self.inner).series.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of points in one series
    pub fn len(&self, key: &SeriesKey) -> usize {
        read(&self.inner).series.get(key).map_or(0, VecDeque::len)
    }

    pub fn series_count(&self) -> usize {
        read(&self.inner).series.len()
    }

    pub fn max_points(&self) -> usize {
        self.max_points
    }

    /// Drop every series
    pub fn clear(&self) {
        write(&self.inner).series.clear();
    }

    pub fn stats(&self) -> DataStoreStats {
        let inner = read(&self.inner);
        DataStoreStats {
            series: inner.series.len(),
            points: inner.series.values().map(VecDeque::len).sum(),
            appended: inner.appended,
            rejected: inner.rejected,
            evicted: inner.evicted,
        }
    }
}
