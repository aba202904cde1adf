//! Windowed negentropy adapter
//!
//! Wraps the range-reconciliation primitive from the `negentropy` crate and
//! builds it from sync store contents one window at a time.
//!
//! ## Lifecycle
//!
//! ```text
//!  Uninitialized ──build──▶ Built ──initiate/respond──▶ Reconciling
//!                            ▲                               │
//!                            └────────rebuild──── Idle ◀─────┘
//!                                                 (converged)
//! ```
//!
//! A built adapter reconciles against the snapshot loaded at build time and
//! does not observe later writes until it is rebuilt. All mutating methods
//! take `&mut self`, so one session owns an adapter at a time.

use std::collections::HashSet;
use std::time::Instant;

use negentropy::{Id, Negentropy, NegentropyStorageVector};
use serde::Serialize;
use tracing::debug;

use super::windows::{SyncWindow, WindowPlanner};
use crate::error::{SyncError, SyncResult};
use crate::storage::OperationSyncStore;
use crate::types::{IterateOptions, SyncCursor, SyncId, DEFAULT_ITERATE_LIMIT};

/// Smallest non-zero frame size limit the primitive accepts
pub const MIN_FRAME_SIZE_LIMIT: u64 = 4096;
pub const DEFAULT_RECENT_WINDOW_DAYS: u32 = 7;
pub const DEFAULT_OLDER_WINDOW_DAYS: u32 = 30;
pub const DEFAULT_MAX_RECORDS_PER_WINDOW: usize = 25_000;
pub const DEFAULT_MAX_ROUNDS_PER_SESSION: u32 = 64;

/// Adapter configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterOptions {
    /// 0 = unbounded, otherwise at least [`MIN_FRAME_SIZE_LIMIT`]
    pub frame_size_limit: u64,
    /// Page size used when streaming rows out of the store
    pub iterate_limit: usize,
    pub recent_window_days: u32,
    pub older_window_days: u32,
    pub max_records_per_window: usize,
    pub max_rounds_per_session: u32,
    /// Skip the full-history build in [`NegentropyAdapter::create`]
    pub defer_initial_build: bool,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            frame_size_limit: 0,
            iterate_limit: DEFAULT_ITERATE_LIMIT,
            recent_window_days: DEFAULT_RECENT_WINDOW_DAYS,
            older_window_days: DEFAULT_OLDER_WINDOW_DAYS,
            max_records_per_window: DEFAULT_MAX_RECORDS_PER_WINDOW,
            max_rounds_per_session: DEFAULT_MAX_ROUNDS_PER_SESSION,
            defer_initial_build: false,
        }
    }
}

impl AdapterOptions {
    pub fn deferred(mut self) -> Self {
        self.defer_initial_build = true;
        self
    }

    pub fn validate(&self) -> SyncResult<()> {
        validate_frame_size_limit("frameSizeLimit", self.frame_size_limit)?;
        if self.iterate_limit == 0 {
            return Err(SyncError::config("iterateLimit", "expected a positive integer"));
        }
        if self.max_rounds_per_session == 0 {
            return Err(SyncError::config(
                "maxRoundsPerSession",
                "expected a positive integer",
            ));
        }
        self.planner().map(|_| ())
    }

    fn planner(&self) -> SyncResult<WindowPlanner> {
        WindowPlanner::new(
            self.recent_window_days,
            self.older_window_days,
            self.max_records_per_window,
        )
    }
}

/// Frame size limits must be 0 or at least [`MIN_FRAME_SIZE_LIMIT`].
pub fn validate_frame_size_limit(setting: &str, limit: u64) -> SyncResult<()> {
    if limit != 0 && limit < MIN_FRAME_SIZE_LIMIT {
        return Err(SyncError::config(
            setting,
            format!("expected 0 or >= {MIN_FRAME_SIZE_LIMIT}"),
        ));
    }
    Ok(())
}

/// Where an adapter is in its build/reconcile cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    Uninitialized,
    Built,
    Reconciling,
    Idle,
}

/// Telemetry for one window in one session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowStats {
    pub window_name: String,
    pub from_ts: i64,
    pub to_ts: i64,
    pub loaded: usize,
    pub skipped: usize,
    pub capped_by_records: bool,
    pub capped_by_rounds: bool,
    pub rounds: u32,
    pub completed: bool,
    pub duration_ms: u64,
    pub frame_size_limit: u64,
}

/// Totals for a windowed session
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub window_count: usize,
    pub rounds: u32,
    pub loaded: usize,
    pub skipped: usize,
    /// Ids held locally and missing on the peer
    pub have_ids: Vec<String>,
    /// Ids held by the peer and missing locally
    pub need_ids: Vec<String>,
    pub duration_ms: u64,
    pub windows: Vec<WindowStats>,
}

/// Result of consuming one peer reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub have_ids: Vec<String>,
    pub need_ids: Vec<String>,
    /// Next frame to send; `None` once both sides have converged
    pub next_msg: Option<Vec<u8>>,
}

/// Outcome of driving rounds against an in-process peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundOutcome {
    pub rounds: u32,
    pub completed: bool,
    pub capped_by_rounds: bool,
}

/// Have/need ids accumulated since the last build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedIds {
    pub have_ids: Vec<String>,
    pub need_ids: Vec<String>,
}

/// Options for [`NegentropyAdapter::run_windowed_session_with_peer`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Session clock in epoch seconds (defaults to now)
    pub now_ts: Option<i64>,
    /// Overrides the adapter's configured round cap
    pub max_rounds_per_session: Option<u32>,
}

/// Per-window wrapper around the range-reconciliation primitive
pub struct NegentropyAdapter<S> {
    store: S,
    options: AdapterOptions,
    planner: WindowPlanner,
    engine: Option<Negentropy<'static, NegentropyStorageVector>>,
    state: AdapterState,
    last_window_stats: Option<WindowStats>,
    resolved: ResolvedIds,
    seen: HashSet<String>,
}

impl<S: OperationSyncStore> NegentropyAdapter<S> {
    /// Validate options and, unless deferred, build over the full history.
    pub fn create(store: S, options: AdapterOptions) -> SyncResult<Self> {
        options.validate()?;
        let planner = options.planner()?;
        let defer = options.defer_initial_build;

        let mut adapter = Self {
            store,
            options,
            planner,
            engine: None,
            state: AdapterState::Uninitialized,
            last_window_stats: None,
            resolved: ResolvedIds::default(),
            seen: HashSet::new(),
        };
        if !defer {
            adapter.rebuild_from_store()?;
        }
        Ok(adapter)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn options(&self) -> &AdapterOptions {
        &self.options
    }

    pub fn state(&self) -> AdapterState {
        self.state
    }

    pub fn last_window_stats(&self) -> Option<&WindowStats> {
        self.last_window_stats.as_ref()
    }

    /// Build over every record in the store, uncapped
    pub fn rebuild_from_store(&mut self) -> SyncResult<WindowStats> {
        self.rebuild_for_window(&SyncWindow::full_history())
    }

    /// Plan windows from `now_ts` back to the store's earliest record
    pub fn plan_windows(&self, now_ts: i64) -> SyncResult<Vec<SyncWindow>> {
        self.planner.plan(now_ts, self.store.earliest_ts()?)
    }

    /// Plan with an explicit earliest timestamp (e.g. the minimum of two peers)
    pub fn plan_windows_from(
        &self,
        now_ts: i64,
        earliest_ts: Option<i64>,
    ) -> SyncResult<Vec<SyncWindow>> {
        self.planner.plan(now_ts, earliest_ts)
    }

    /// Rebuild the primitive from the rows inside `window`.
    ///
    /// Rows with an unparseable id or a negative timestamp are counted as
    /// skipped. `capped_by_records` is set when rows remained in range after
    /// the window's record cap was reached.
    pub fn rebuild_for_window(&mut self, window: &SyncWindow) -> SyncResult<WindowStats> {
        let started = Instant::now();
        let mut storage = NegentropyStorageVector::new();

        let mut loaded = 0;
        let mut skipped = 0;
        let mut processed = 0;
        let mut capped_by_records = false;
        let mut after: Option<SyncCursor> = None;

        loop {
            let page = IterateOptions {
                limit: Some(self.options.iterate_limit),
                from_ts: Some(window.from_ts),
                to_ts: Some(window.to_ts),
                after: after.take(),
            };
            let rows = self.store.iterate_sorted(&page)?;
            let Some(last) = rows.last() else {
                break;
            };
            after = Some(last.cursor());

            for row in &rows {
                if processed >= window.max_records {
                    capped_by_records = true;
                    break;
                }
                processed += 1;

                match SyncId::from_hex(&row.id) {
                    Some(id) if row.ts >= 0 => {
                        storage.insert(row.ts as u64, Id::from(id))?;
                        loaded += 1;
                    }
                    _ => skipped += 1,
                }
            }

            if capped_by_records || rows.len() < self.options.iterate_limit {
                break;
            }
        }

        storage.seal()?;
        self.engine = Some(Negentropy::owned(storage, self.options.frame_size_limit)?);
        self.state = AdapterState::Built;
        self.resolved = ResolvedIds::default();
        self.seen.clear();

        let stats = WindowStats {
            window_name: window.name.clone(),
            from_ts: window.from_ts,
            to_ts: window.to_ts,
            loaded,
            skipped,
            capped_by_records,
            capped_by_rounds: false,
            rounds: 0,
            completed: false,
            duration_ms: started.elapsed().as_millis() as u64,
            frame_size_limit: self.options.frame_size_limit,
        };

        debug!(
            window = %stats.window_name,
            from_ts = stats.from_ts,
            to_ts = stats.to_ts,
            loaded,
            skipped,
            capped_by_records,
            duration_ms = stats.duration_ms,
            "negentropy adapter rebuilt"
        );

        self.last_window_stats = Some(stats.clone());
        Ok(stats)
    }

    fn engine_mut(&mut self) -> SyncResult<&mut Negentropy<'static, NegentropyStorageVector>> {
        self.engine.as_mut().ok_or(SyncError::NotInitialized)
    }

    /// Produce the opening frame of a session
    pub fn initiate(&mut self) -> SyncResult<Vec<u8>> {
        let frame = self.engine_mut()?.initiate()?;
        self.state = AdapterState::Reconciling;
        Ok(frame)
    }

    /// Answer a peer's frame as the responder.
    ///
    /// Returns `None` when the reply carries nothing beyond the protocol
    /// header, meaning the peer's run has reached a terminal state.
    pub fn respond(&mut self, frame: &[u8]) -> SyncResult<Option<Vec<u8>>> {
        let reply = self.engine_mut()?.reconcile(frame)?;
        if reply.len() <= 1 {
            self.state = AdapterState::Idle;
            return Ok(None);
        }
        self.state = AdapterState::Reconciling;
        Ok(Some(reply))
    }

    /// Consume a peer reply as the initiator
    pub fn reconcile(&mut self, frame: &[u8]) -> SyncResult<ReconcileResult> {
        let mut have = Vec::new();
        let mut need = Vec::new();
        let next_msg = self
            .engine_mut()?
            .reconcile_with_ids(frame, &mut have, &mut need)?;

        let have_ids = self.accumulate(have, true);
        let need_ids = self.accumulate(need, false);
        self.state = if next_msg.is_some() {
            AdapterState::Reconciling
        } else {
            AdapterState::Idle
        };

        Ok(ReconcileResult {
            have_ids,
            need_ids,
            next_msg,
        })
    }

    fn accumulate(&mut self, ids: Vec<Id>, have: bool) -> Vec<String> {
        let mut fresh = Vec::with_capacity(ids.len());
        for id in ids {
            let hex = SyncId::from(id).to_hex();
            if self.seen.insert(hex.clone()) {
                if have {
                    self.resolved.have_ids.push(hex.clone());
                } else {
                    self.resolved.need_ids.push(hex.clone());
                }
                fresh.push(hex);
            }
        }
        fresh
    }

    /// Have/need ids accumulated since the last build
    pub fn resolved(&self) -> &ResolvedIds {
        &self.resolved
    }

    /// Take the accumulated have/need ids, leaving them empty
    pub fn take_resolved(&mut self) -> ResolvedIds {
        self.seen.clear();
        std::mem::take(&mut self.resolved)
    }

    /// Drive rounds against an already-built in-process peer.
    pub fn reconcile_with_peer<P: OperationSyncStore>(
        &mut self,
        peer: &mut NegentropyAdapter<P>,
        max_rounds: u32,
    ) -> SyncResult<RoundOutcome> {
        let mut msg = Some(self.initiate()?);
        let mut rounds = 0;

        while let Some(frame) = msg.take() {
            if rounds >= max_rounds {
                msg = Some(frame);
                break;
            }
            rounds += 1;
            let Some(response) = peer.respond(&frame)? else {
                break;
            };
            msg = self.reconcile(&response)?.next_msg;
        }

        let completed = msg.is_none();
        if completed {
            self.state = AdapterState::Idle;
        }
        Ok(RoundOutcome {
            rounds,
            completed,
            capped_by_rounds: !completed && rounds >= max_rounds,
        })
    }

    /// Reconcile every planned window with an in-process peer, newest first.
    ///
    /// A window that hits the round cap is marked `capped_by_rounds` and the
    /// session moves on to the next window.
    pub fn run_windowed_session_with_peer<P: OperationSyncStore>(
        &mut self,
        peer: &mut NegentropyAdapter<P>,
        options: SessionOptions,
    ) -> SyncResult<SessionStats> {
        let started = Instant::now();
        let now_ts = options
            .now_ts
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        let max_rounds = options
            .max_rounds_per_session
            .unwrap_or(self.options.max_rounds_per_session);
        if max_rounds == 0 {
            return Err(SyncError::config(
                "maxRoundsPerSession",
                "expected a positive integer",
            ));
        }

        let earliest = match (self.store.earliest_ts()?, peer.store.earliest_ts()?) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let windows = self.planner.plan(now_ts, earliest)?;

        let mut session = SessionStats::default();
        for window in &windows {
            let window_started = Instant::now();
            let local = self.rebuild_for_window(window)?;
            peer.rebuild_for_window(window)?;

            let outcome = self.reconcile_with_peer(peer, max_rounds)?;
            let resolved = self.take_resolved();

            let stats = WindowStats {
                rounds: outcome.rounds,
                completed: outcome.completed,
                capped_by_rounds: outcome.capped_by_rounds,
                duration_ms: window_started.elapsed().as_millis() as u64,
                ..local
            };

            debug!(
                window = %stats.window_name,
                loaded = stats.loaded,
                skipped = stats.skipped,
                rounds = stats.rounds,
                completed = stats.completed,
                capped_by_records = stats.capped_by_records,
                capped_by_rounds = stats.capped_by_rounds,
                have = resolved.have_ids.len(),
                need = resolved.need_ids.len(),
                "negentropy window session"
            );

            session.rounds += stats.rounds;
            session.loaded += stats.loaded;
            session.skipped += stats.skipped;
            session.have_ids.extend(resolved.have_ids);
            session.need_ids.extend(resolved.need_ids);
            session.windows.push(stats);
        }

        session.window_count = session.windows.len();
        session.duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            windows = session.window_count,
            rounds = session.rounds,
            loaded = session.loaded,
            skipped = session.skipped,
            duration_ms = session.duration_ms,
            "negentropy windowed session summary"
        );
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySyncStore;
    use crate::types::{Operation, SyncRecord};
    use serde_json::json;
    use std::sync::Arc;

    fn id(c: char) -> String {
        c.to_string().repeat(64)
    }

    fn store_with(ids: &[(String, i64)]) -> Arc<MemorySyncStore> {
        let records: Vec<_> = ids
            .iter()
            .map(|(id, ts)| SyncRecord::new(id.clone(), *ts, Operation::new(json!({}))))
            .collect();
        Arc::new(MemorySyncStore::with_records(&records))
    }

    #[test]
    fn test_rejects_small_frame_limit() {
        let opts = AdapterOptions {
            frame_size_limit: 1024,
            ..AdapterOptions::default()
        };
        let err = NegentropyAdapter::create(store_with(&[]), opts)
            .err()
            .unwrap();
        assert!(err.to_string().contains("expected 0 or >= 4096"));
    }

    #[test]
    fn test_rejects_zero_rounds() {
        let opts = AdapterOptions {
            max_rounds_per_session: 0,
            ..AdapterOptions::default()
        };
        assert!(NegentropyAdapter::create(store_with(&[]), opts).is_err());
    }

    #[test]
    fn test_initiate_before_build_fails() {
        let mut adapter =
            NegentropyAdapter::create(store_with(&[]), AdapterOptions::default().deferred())
                .unwrap();
        assert_eq!(adapter.state(), AdapterState::Uninitialized);
        assert!(matches!(adapter.initiate(), Err(SyncError::NotInitialized)));
        assert!(matches!(adapter.respond(&[0x61]), Err(SyncError::NotInitialized)));
    }

    #[test]
    fn test_invalid_rows_are_skipped() {
        let store = store_with(&[(id('a'), 10), ("not-hex".into(), 11), (id('b'), -5)]);
        let adapter = NegentropyAdapter::create(store, AdapterOptions::default()).unwrap();
        let stats = adapter.last_window_stats().unwrap();
        assert_eq!(stats.loaded, 1);
        assert_eq!(stats.skipped, 2);
        assert_eq!(adapter.state(), AdapterState::Built);
    }

    #[test]
    fn test_record_cap_marks_window() {
        let store = store_with(&[(id('a'), 1), (id('b'), 2), (id('c'), 3)]);
        let mut adapter =
            NegentropyAdapter::create(store, AdapterOptions::default().deferred()).unwrap();
        let window = SyncWindow {
            name: "w".into(),
            from_ts: 0,
            to_ts: 10,
            max_records: 2,
            order: 0,
        };
        let stats = adapter.rebuild_for_window(&window).unwrap();
        assert_eq!(stats.loaded, 2);
        assert!(stats.capped_by_records);

        let exact = SyncWindow {
            max_records: 3,
            ..window
        };
        assert!(!adapter.rebuild_for_window(&exact).unwrap().capped_by_records);
    }

    #[test]
    fn test_small_pages_are_streamed() {
        let ids: Vec<_> = ('a'..='f').enumerate().map(|(i, c)| (id(c), i as i64)).collect();
        let opts = AdapterOptions {
            iterate_limit: 2,
            ..AdapterOptions::default()
        };
        let adapter = NegentropyAdapter::create(store_with(&ids), opts).unwrap();
        assert_eq!(adapter.last_window_stats().unwrap().loaded, 6);
    }

    #[test]
    fn test_converges_and_goes_idle() {
        let mut a = NegentropyAdapter::create(
            store_with(&[(id('a'), 1), (id('b'), 2), (id('c'), 3)]),
            AdapterOptions::default(),
        )
        .unwrap();
        let mut b = NegentropyAdapter::create(
            store_with(&[(id('b'), 2), (id('c'), 3), (id('d'), 4)]),
            AdapterOptions::default(),
        )
        .unwrap();

        let outcome = a.reconcile_with_peer(&mut b, 8).unwrap();
        assert!(outcome.completed);
        assert!(!outcome.capped_by_rounds);
        assert_eq!(a.state(), AdapterState::Idle);
        assert_eq!(a.resolved().have_ids, vec![id('a')]);
        assert_eq!(a.resolved().need_ids, vec![id('d')]);
    }

    #[test]
    fn test_initiator_cannot_respond() {
        let mut a =
            NegentropyAdapter::create(store_with(&[(id('a'), 1)]), AdapterOptions::default())
                .unwrap();
        let frame = a.initiate().unwrap();
        assert!(matches!(
            a.respond(&frame),
            Err(SyncError::Reconciliation(_))
        ));
    }
}
