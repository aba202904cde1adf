//! Reconciliation window planning
//!
//! The record time axis is cut into contiguous, non-overlapping windows that
//! are reconciled newest first:
//!
//! ```text
//!   earliest                                                        now
//!      │ older_3 │     older_2     │     older_1     │    recent    │
//!      └─────────┴─────────────────┴─────────────────┴──────────────┘
//!        order 3       order 2           order 1         order 0
//! ```
//!
//! When a session runs out of round budget, the windows that were not
//! reached are the oldest ones.

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Seconds per day
pub const DAY_SECS: i64 = 86_400;

/// Name of the single window used by a full-history rebuild
pub const FULL_HISTORY_WINDOW: &str = "full_history";

/// A time-bounded slice of the record space reconciled as one unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncWindow {
    pub name: String,
    /// Inclusive lower bound (epoch seconds)
    pub from_ts: i64,
    /// Inclusive upper bound (epoch seconds)
    pub to_ts: i64,
    /// Record cap for one rebuild of this window
    pub max_records: usize,
    /// Reconciliation priority, 0 first
    pub order: u32,
}

impl SyncWindow {
    /// A window covering every representable timestamp with no record cap
    pub fn full_history() -> Self {
        Self {
            name: FULL_HISTORY_WINDOW.to_string(),
            from_ts: i64::MIN,
            to_ts: i64::MAX,
            max_records: usize::MAX,
            order: 0,
        }
    }

    pub fn contains(&self, ts: i64) -> bool {
        self.from_ts <= ts && ts <= self.to_ts
    }
}

/// Partitions the record time axis into priority-ordered windows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowPlanner {
    recent_window_days: u32,
    older_window_days: u32,
    max_records_per_window: usize,
    floor_ts: Option<i64>,
}

impl WindowPlanner {
    /// Create a planner; all three bounds must be positive.
    pub fn new(
        recent_window_days: u32,
        older_window_days: u32,
        max_records_per_window: usize,
    ) -> SyncResult<Self> {
        if recent_window_days == 0 {
            return Err(SyncError::config("recentWindowDays", "expected a positive integer"));
        }
        if older_window_days == 0 {
            return Err(SyncError::config("olderWindowDays", "expected a positive integer"));
        }
        if max_records_per_window == 0 {
            return Err(SyncError::config(
                "maxRecordsPerWindow",
                "expected a positive integer",
            ));
        }
        Ok(Self {
            recent_window_days,
            older_window_days,
            max_records_per_window,
            floor_ts: None,
        })
    }

    /// Never plan windows below `floor_ts`
    pub fn with_floor(mut self, floor_ts: i64) -> Self {
        self.floor_ts = Some(floor_ts);
        self
    }

    pub fn max_records_per_window(&self) -> usize {
        self.max_records_per_window
    }

    /// Plan windows from `now_ts` back to `earliest_ts`.
    ///
    /// `earliest_ts` is the oldest record timestamp; `None` (empty store)
    /// yields no windows.
    pub fn plan(&self, now_ts: i64, earliest_ts: Option<i64>) -> SyncResult<Vec<SyncWindow>> {
        if now_ts < 0 {
            return Err(SyncError::InvalidTimestamp(format!(
                "nowTs must be a non-negative epoch timestamp, got {now_ts}"
            )));
        }
        let Some(earliest) = earliest_ts else {
            return Ok(Vec::new());
        };
        let earliest = match self.floor_ts {
            Some(floor) => earliest.max(floor),
            None => earliest,
        };

        let recent_span = i64::from(self.recent_window_days) * DAY_SECS;
        let older_span = i64::from(self.older_window_days) * DAY_SECS;
        let recent_start = earliest.max(now_ts - recent_span).min(now_ts);

        let mut windows = vec![SyncWindow {
            name: "recent".to_string(),
            from_ts: recent_start,
            to_ts: now_ts,
            max_records: self.max_records_per_window,
            order: 0,
        }];

        let mut cursor_to = recent_start - 1;
        let mut order = 1;
        while cursor_to >= earliest {
            let from_ts = earliest.max(cursor_to - older_span + 1);
            windows.push(SyncWindow {
                name: format!("older_{order}"),
                from_ts,
                to_ts: cursor_to,
                max_records: self.max_records_per_window,
                order,
            });
            cursor_to = from_ts - 1;
            order += 1;
        }

        Ok(windows)
    }
}
