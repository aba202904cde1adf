//! Mediator - connects the sync index, the ledger and the peer mesh
//!
//! The mediator coordinates:
//! - Capability negotiation on connect (negentropy or legacy flood sync)
//! - Windowed negentropy sessions, one `neg_open` per planned window
//! - An import queue that applies received operations to the ledger and
//!   indexes the accepted ones
//! - An export queue for full-ledger shares with legacy peers
//! - A sync queue that asks legacy peers for their ledger once imports drain
//! - Background loops for the local queue, connection health and repair
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use meshsync_core::{ChannelTransport, MediatorConfig, Mediator, MemoryLedger, MemorySyncStore};
//!
//! let transport = Arc::new(ChannelTransport::new());
//! let mediator = Mediator::new(
//!     MediatorConfig::from_env()?,
//!     Arc::new(MemorySyncStore::new()),
//!     Arc::new(MemoryLedger::new()),
//!     transport.clone(),
//! )?;
//! mediator.bootstrap().await?;
//! mediator.start();
//!
//! let inbound = transport.register("peer-key");
//! mediator.peer_connected("peer-key", true).await?;
//! mediator.spawn_inbound("peer-key", inbound);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bootstrap::{bootstrap_sync_store_if_empty, BootstrapResult};
use crate::config::MediatorConfig;
use crate::error::{SyncError, SyncResult};
use crate::ledger::{Ledger, LedgerEvent, REGISTRY};
use crate::mapping::{filter_index_rejected_operations, map_accepted_operations_to_sync_records};
use crate::metrics::{MetricsSnapshot, SyncMetrics};
use crate::storage::OperationSyncStore;
use crate::sync::adapter::{NegentropyAdapter, SessionStats, WindowStats};
use crate::sync::connections::{short_name, ConnectionManager};
use crate::sync::events::{ImportSource, ImportSummary, MediatorEvent};
use crate::sync::policy::{
    should_accept_legacy_sync, should_schedule_periodic_repair,
    should_start_connect_time_negentropy, RepairContext,
};
use crate::sync::protocol::{
    choose_connect_sync_mode, decode_negentropy_frame, encode_negentropy_frame,
    normalize_negentropy_ids, normalize_peer_capabilities, MediatorMessage, NegentropyFrame,
    PeerCapabilities, SyncMode,
};
use crate::sync::queue::{QueueTracker, WorkQueue};
use crate::sync::ticker::Ticker;
use crate::sync::transfer::TransferBatcher;
use crate::sync::transport::PeerTransport;
use crate::sync::windows::SyncWindow;
use crate::types::Operation;

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Export loop delay while the import queue still has work
const IMPORT_BACKLOG_DELAY: Duration = Duration::from_secs(60);

/// Upper bound on how often repair gates are evaluated
const REPAIR_CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// DIDs exported per ledger call when sharing the whole ledger
const SHARE_DID_CHUNK: usize = 1000;

/// Legacy batch digests remembered for de-duplication
const SEEN_BATCH_CAPACITY: usize = 10_000;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

type SessionAdapter = NegentropyAdapter<Arc<dyn OperationSyncStore>>;

/// Session driven by this node
struct InitiatorSession {
    session_id: u64,
    adapter: SessionAdapter,
    pending_windows: VecDeque<SyncWindow>,
    window_stats: WindowStats,
    window_started: Instant,
    /// Frames sent for the current window
    rounds: u32,
    started: Instant,
    summary: SessionStats,
}

/// Session answered by this node
struct ResponderSession {
    session_id: u64,
    adapter: SessionAdapter,
}

enum PeerSession {
    Initiator(InitiatorSession),
    Responder(ResponderSession),
}

/// Work computed under the session lock, carried out after it is released
#[derive(Default)]
struct InitiatorStep {
    /// Ids the peer lacks; pushed before `messages`
    have_ids: Vec<String>,
    /// Ids this node lacks; requested before `messages`
    need_ids: Vec<String>,
    window: Option<WindowStats>,
    finished: Option<SessionStats>,
    messages: Vec<MediatorMessage>,
}

struct ImportTask {
    peer_key: String,
    source: ImportSource,
    operations: Vec<Operation>,
}

/// Bounded set of batch digests, oldest evicted first
#[derive(Default)]
struct SeenBatches {
    order: VecDeque<String>,
    digests: HashSet<String>,
}

impl SeenBatches {
    /// Record a digest; false if it was already present
    fn insert(&mut self, digest: String) -> bool {
        if !self.digests.insert(digest.clone()) {
            return false;
        }
        self.order.push_back(digest);
        if self.order.len() > SEEN_BATCH_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.digests.remove(&oldest);
            }
        }
        true
    }
}

fn batch_digest(operations: &[Operation]) -> String {
    let body = serde_json::to_vec(operations).unwrap_or_default();
    hex::encode(Sha256::digest(&body))
}

/// State shared with queue workers
struct Shared {
    config: MediatorConfig,
    store: Arc<dyn OperationSyncStore>,
    ledger: Arc<dyn Ledger>,
    transport: Arc<dyn PeerTransport>,
    connections: ConnectionManager,
    metrics: SyncMetrics,
    batcher: TransferBatcher,
    event_tx: broadcast::Sender<MediatorEvent>,
}

impl Shared {
    fn emit(&self, event: MediatorEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    async fn send(&self, peer_key: &str, message: &MediatorMessage) -> SyncResult<()> {
        let bytes = message.encode()?;
        self.metrics.message_sent(bytes.len());
        debug!(
            peer = %short_name(peer_key),
            kind = message.kind(),
            bytes = bytes.len(),
            "Sending message"
        );
        self.transport.send(peer_key, bytes).await
    }

    /// Stored operations for `ids`, as push batches
    fn push_batches_for(&self, ids: &[String]) -> SyncResult<Vec<Vec<Operation>>> {
        let mut operations = Vec::with_capacity(ids.len());
        for chunk in self.batcher.id_chunks(ids) {
            let records = self.store.get_by_ids(&chunk)?;
            operations.extend(records.into_iter().map(|r| r.operation));
        }
        Ok(self.batcher.push_batches(operations))
    }
}

/// Apply one received batch: ledger first, then the sync index.
async fn apply_import(shared: Arc<Shared>, task: ImportTask) -> SyncResult<()> {
    if task.operations.is_empty() {
        return Ok(());
    }

    let mut summary = ImportSummary {
        received: task.operations.len(),
        ..Default::default()
    };
    for chunk in task.operations.chunks(shared.config.import_batch_size) {
        let events = LedgerEvent::wrap_batch(REGISTRY, chunk, now_ms());
        let report = match shared.ledger.import_batch(events).await {
            Ok(report) => report,
            Err(e) => {
                warn!(
                    peer = %short_name(&task.peer_key),
                    size = chunk.len(),
                    error = %e,
                    "Ledger import failed for chunk"
                );
                summary.failed_chunks += 1;
                continue;
            }
        };

        let accepted = filter_index_rejected_operations(chunk, &report.rejected_indices);
        summary.rejected += chunk.len() - accepted.len();

        let mapped = map_accepted_operations_to_sync_records(&accepted);
        summary.invalid += mapped.invalid;
        summary.inserted += shared.store.upsert_many(&mapped.records)?;
    }

    let processed = shared.ledger.process_events().await?;
    shared.metrics.ops_rejected(summary.rejected);

    info!(
        peer = %short_name(&task.peer_key),
        source = ?task.source,
        received = summary.received,
        rejected = summary.rejected,
        invalid = summary.invalid,
        inserted = summary.inserted,
        failed_chunks = summary.failed_chunks,
        added = processed.added,
        merged = processed.merged,
        "Imported operations"
    );
    shared.emit(MediatorEvent::OperationsImported {
        peer_key: task.peer_key,
        source: task.source,
        summary,
    });
    Ok(())
}

/// Ask a legacy peer for its ledger once our import queue is drained.
///
/// Runs on the sync queue, never the export queue.
async fn request_sync(shared: Arc<Shared>, imports: QueueTracker, peer_key: String) -> SyncResult<()> {
    if !imports.is_empty() {
        info!(
            peer = %short_name(&peer_key),
            pending = imports.len(),
            "Waiting for import queue before requesting sync"
        );
        imports.drained().await;
    }
    let message = MediatorMessage::Sync {
        node: shared.config.node_name.clone(),
    };
    shared.send(&peer_key, &message).await
}

async fn share_ledger(shared: &Shared, peer_key: &str) -> SyncResult<()> {
    let started = Instant::now();
    let dids = shared.ledger.get_dids().await?;

    let mut sent = 0;
    for chunk in dids.chunks(SHARE_DID_CHUNK) {
        let operations: Vec<Operation> = shared
            .ledger
            .export_batch(Some(chunk))
            .await?
            .into_iter()
            .filter_map(|event| event.operation)
            .collect();

        for batch in shared.batcher.push_batches(operations) {
            sent += batch.len();
            let message = MediatorMessage::Batch {
                node: shared.config.node_name.clone(),
                data: batch,
            };
            shared.send(peer_key, &message).await?;
        }
    }

    info!(
        peer = %short_name(peer_key),
        dids = dids.len(),
        operations = sent,
        duration_ms = started.elapsed().as_millis() as u64,
        "Shared ledger with legacy peer"
    );
    Ok(())
}

/// Mesh mediator for one node
///
/// Must be created inside a tokio runtime: the queue workers are spawned
/// immediately. Background loops only run after [`Mediator::start`].
pub struct Mediator {
    shared: Arc<Shared>,
    sessions: Mutex<HashMap<String, PeerSession>>,
    import_queue: WorkQueue<ImportTask>,
    /// Peers waiting for a full-ledger share
    export_queue: WorkQueue<String>,
    /// Legacy peers to send `sync` once imports drain
    sync_queue: WorkQueue<String>,
    seen_batches: Mutex<SeenBatches>,
    next_session_id: AtomicU64,
    tickers: Mutex<Vec<Ticker>>,
}

impl Mediator {
    pub fn new(
        config: MediatorConfig,
        store: Arc<dyn OperationSyncStore>,
        ledger: Arc<dyn Ledger>,
        transport: Arc<dyn PeerTransport>,
    ) -> SyncResult<Arc<Self>> {
        config.validate()?;
        let batcher = config.transfer_batcher()?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let shared = Arc::new(Shared {
            config,
            store,
            ledger,
            transport,
            connections: ConnectionManager::new(),
            metrics: SyncMetrics::new(),
            batcher,
            event_tx,
        });

        let import_queue = {
            let shared = shared.clone();
            WorkQueue::spawn("import", move |task| apply_import(shared.clone(), task))
        };
        let export_queue = {
            let shared = shared.clone();
            WorkQueue::spawn("export", move |peer_key: String| {
                let shared = shared.clone();
                async move { share_ledger(&shared, &peer_key).await }
            })
        };
        let sync_queue = {
            let shared = shared.clone();
            let imports = import_queue.tracker();
            WorkQueue::spawn("sync", move |peer_key| {
                request_sync(shared.clone(), imports.clone(), peer_key)
            })
        };

        info!(
            node = %shared.config.node_name,
            negentropy = shared.config.negentropy_enabled,
            legacy = shared.config.legacy_sync_enabled,
            "Mediator created"
        );

        Ok(Arc::new(Self {
            shared,
            sessions: Mutex::new(HashMap::new()),
            import_queue,
            export_queue,
            sync_queue,
            seen_batches: Mutex::new(SeenBatches::default()),
            next_session_id: AtomicU64::new(0),
            tickers: Mutex::new(Vec::new()),
        }))
    }

    pub fn config(&self) -> &MediatorConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &Arc<dyn OperationSyncStore> {
        &self.shared.store
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.shared.connections
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediatorEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Import tasks waiting or running
    pub fn import_queue_len(&self) -> usize {
        self.import_queue.len()
    }

    /// Wait until every queue is empty
    pub async fn wait_idle(&self) {
        self.import_queue.drained().await;
        self.sync_queue.drained().await;
        self.export_queue.drained().await;
        self.import_queue.drained().await;
    }

    /// Make sure the sync index reflects the ledger
    pub async fn bootstrap(&self) -> SyncResult<BootstrapResult> {
        let result = bootstrap_sync_store_if_empty(
            &*self.shared.store,
            &*self.shared.ledger,
            &self.shared.config.bootstrap_options(),
        )
        .await?;
        self.shared.emit(MediatorEvent::Bootstrapped(result.clone()));
        Ok(result)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Background loops
    // ═══════════════════════════════════════════════════════════════════════

    /// Start the export, connection and repair loops. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut tickers = self.tickers.lock();
        if !tickers.is_empty() {
            return;
        }

        let weak = Arc::downgrade(self);
        tickers.push(Ticker::start("export", Duration::ZERO, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(mediator) => mediator.export_tick().await,
                    None => Duration::MAX,
                }
            }
        }));

        let weak = Arc::downgrade(self);
        let check = self.shared.config.connection_check_interval();
        tickers.push(Ticker::start("connections", check, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(mediator) => {
                        mediator.check_connections().await;
                        mediator.shared.config.connection_check_interval()
                    }
                    None => Duration::MAX,
                }
            }
        }));

        let weak = Arc::downgrade(self);
        let repair = REPAIR_CHECK_INTERVAL.min(self.shared.config.repair_interval());
        tickers.push(Ticker::start("repair", repair, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(mediator) => {
                        mediator.run_repair_checks().await;
                        repair
                    }
                    None => Duration::MAX,
                }
            }
        }));

        info!(node = %self.shared.config.node_name, "Mediator started");
    }

    /// Stop the loops and the queues. Nothing runs after this returns.
    pub async fn stop(&self) {
        let tickers = std::mem::take(&mut *self.tickers.lock());
        for ticker in &tickers {
            ticker.stop().await;
        }
        self.import_queue.shutdown();
        self.export_queue.shutdown();
        self.sync_queue.shutdown();
        info!(node = %self.shared.config.node_name, "Mediator stopped");
    }

    async fn export_tick(&self) -> Duration {
        if let Err(e) = self.flush_local_queue().await {
            warn!(error = %e, "Failed to export local queue");
        }
        if !self.import_queue.is_empty() {
            info!(
                pending = self.import_queue.len(),
                "Import queue busy, delaying export loop"
            );
            return IMPORT_BACKLOG_DELAY;
        }
        self.shared.config.export_interval()
    }

    /// Share operations submitted on this node with every connected peer.
    ///
    /// Returns the number of operations flushed.
    pub async fn flush_local_queue(&self) -> SyncResult<usize> {
        let shared = &self.shared;
        let operations = shared.ledger.get_queue(REGISTRY).await?;
        if operations.is_empty() {
            return Ok(0);
        }
        shared.ledger.clear_queue(REGISTRY, &operations).await?;

        let count = operations.len();
        let mapped = map_accepted_operations_to_sync_records(&operations);
        let inserted = shared.store.upsert_many(&mapped.records)?;

        for batch in shared.batcher.push_batches(operations) {
            // Echoes relayed back to us are dropped as duplicates
            self.seen_batches.lock().insert(batch_digest(&batch));
            let message = MediatorMessage::Queue {
                node: shared.config.node_name.clone(),
                relays: Vec::new(),
                data: batch,
            };
            self.relay(&[], &message).await;
        }

        info!(
            operations = count,
            inserted,
            invalid = mapped.invalid,
            peers = shared.connections.len(),
            "Exported local queue"
        );
        shared.emit(MediatorEvent::OperationsImported {
            peer_key: shared.config.node_name.clone(),
            source: ImportSource::Local,
            summary: ImportSummary {
                received: count,
                invalid: mapped.invalid,
                inserted,
                ..Default::default()
            },
        });
        Ok(count)
    }

    /// Expire idle peers, ping the rest and publish a metrics snapshot
    pub async fn check_connections(&self) {
        let shared = &self.shared;
        let timeout_ms = shared.config.connection_timeout().as_millis() as i64;
        for state in shared.connections.expire_stale(now_ms(), timeout_ms) {
            info!(
                peer = %state.short_name(),
                node = %state.node_name,
                last_seen_ms = state.last_seen_ms,
                "Removing stale connection"
            );
            self.drop_session(&state.peer_key);
            shared.emit(MediatorEvent::PeerDisconnected {
                peer_key: state.peer_key,
                expired: true,
            });
        }

        let ping = MediatorMessage::Ping {
            node: shared.config.node_name.clone(),
            peers: shared.connections.peer_keys(),
        };
        self.relay(&[], &ping).await;

        let snapshot = shared.metrics.snapshot();
        info!(
            peers = shared.connections.len(),
            sessions = snapshot.sessions_started,
            windows = snapshot.windows,
            ops_received = snapshot.ops_received,
            ops_pushed = snapshot.ops_pushed,
            round_cap_rate = snapshot.round_cap_rate,
            "Sync metrics"
        );
        shared.emit(MediatorEvent::Metrics(snapshot));
    }

    /// Start repair sessions where every gate is open; returns how many started.
    pub async fn run_repair_checks(&self) -> usize {
        let shared = &self.shared;
        let repair_interval_ms = shared.config.repair_interval().as_millis() as i64;
        let mut started = 0;

        for state in shared.connections.snapshot() {
            let ctx = RepairContext {
                sync_mode: state.sync_mode,
                has_active_session: state.has_active_session,
                import_queue_length: self.import_queue.len(),
                active_negentropy_sessions: shared.connections.active_sessions(),
                last_repair_at_ms: state.last_repair_at_ms,
                now_ms: now_ms(),
                repair_interval_ms,
                is_initiator: state.is_initiator,
            };
            if !should_schedule_periodic_repair(&ctx) {
                continue;
            }
            debug!(peer = %state.short_name(), "Scheduling periodic repair");
            match self.start_session(&state.peer_key).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => warn!(peer = %state.short_name(), error = %e, "Repair failed to start"),
            }
        }
        started
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Connections
    // ═══════════════════════════════════════════════════════════════════════

    /// Register a new connection and introduce ourselves
    pub async fn peer_connected(&self, peer_key: &str, is_initiator: bool) -> SyncResult<()> {
        let shared = &self.shared;
        if !shared.connections.add(peer_key, is_initiator, now_ms()) {
            debug!(peer = %short_name(peer_key), "Peer already connected");
            return Ok(());
        }
        info!(
            peer = %short_name(peer_key),
            is_initiator,
            connections = shared.connections.len(),
            "Peer connected"
        );
        shared.emit(MediatorEvent::PeerConnected {
            peer_key: peer_key.to_string(),
            is_initiator,
        });

        let hello = MediatorMessage::Hello {
            node: shared.config.node_name.clone(),
            capabilities: Some(PeerCapabilities::local(shared.config.negentropy_enabled)),
        };
        shared.send(peer_key, &hello).await
    }

    pub fn peer_disconnected(&self, peer_key: &str) {
        let Some(state) = self.shared.connections.remove(peer_key) else {
            return;
        };
        self.drop_session(peer_key);
        info!(
            peer = %state.short_name(),
            node = %state.node_name,
            connections = self.shared.connections.len(),
            "Peer disconnected"
        );
        self.shared.emit(MediatorEvent::PeerDisconnected {
            peer_key: peer_key.to_string(),
            expired: false,
        });
    }

    /// Feed messages from one peer into the mediator until the stream ends
    pub fn spawn_inbound(
        self: &Arc<Self>,
        peer_key: impl Into<String>,
        mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> JoinHandle<()> {
        let mediator = Arc::clone(self);
        let peer_key = peer_key.into();
        tokio::spawn(async move {
            while let Some(bytes) = inbound.recv().await {
                if let Err(e) = mediator.handle_message(&peer_key, &bytes).await {
                    warn!(peer = %short_name(&peer_key), error = %e, "Failed to handle message");
                }
            }
            debug!(peer = %short_name(&peer_key), "Inbound stream closed");
        })
    }

    fn drop_message(&self, peer_key: &str, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(peer = %short_name(peer_key), reason = %reason, "Dropping message");
        self.shared.emit(MediatorEvent::MessageDropped {
            peer_key: peer_key.to_string(),
            reason,
        });
    }

    fn is_new_batch(&self, operations: &[Operation]) -> bool {
        self.seen_batches.lock().insert(batch_digest(operations))
    }

    /// Send to every connected peer not in `relays`; failures are logged
    async fn relay(&self, relays: &[String], message: &MediatorMessage) {
        for peer_key in self.shared.connections.peer_keys() {
            if relays.contains(&peer_key) {
                continue;
            }
            if let Err(e) = self.shared.send(&peer_key, message).await {
                warn!(peer = %short_name(&peer_key), kind = message.kind(), error = %e, "Relay failed");
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inbound dispatch
    // ═══════════════════════════════════════════════════════════════════════

    /// Handle one encoded message from `peer_key`.
    ///
    /// Undecodable messages and messages from unknown peers are logged and
    /// dropped; errors are reserved for local failures.
    pub async fn handle_message(&self, peer_key: &str, bytes: &[u8]) -> SyncResult<()> {
        self.shared.metrics.message_received(bytes.len());
        let message = match MediatorMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                self.drop_message(peer_key, e.to_string());
                return Ok(());
            }
        };
        if !self.shared.connections.touch(peer_key, now_ms()) {
            self.drop_message(peer_key, format!("{} from unknown peer", message.kind()));
            return Ok(());
        }
        debug!(peer = %short_name(peer_key), kind = message.kind(), "Received message");

        match message {
            MediatorMessage::Hello { node, capabilities } => {
                self.on_hello(peer_key, &node, capabilities.as_ref()).await
            }
            MediatorMessage::Ping { node, peers } => {
                self.shared.connections.set_node_name(peer_key, &node);
                debug!(peer = %short_name(peer_key), node = %node, peers = peers.len(), "Ping");
                Ok(())
            }
            MediatorMessage::Sync { node } => self.on_legacy_sync(peer_key, &node),
            MediatorMessage::Batch { node, data } => self.on_legacy_batch(peer_key, &node, data),
            MediatorMessage::Queue { node, relays, data } => {
                self.on_queue(peer_key, node, relays, data).await
            }
            MediatorMessage::NegOpen {
                session_id,
                window,
                frame,
            } => self.on_neg_open(peer_key, session_id, &window, &frame).await,
            MediatorMessage::NegMsg { session_id, frame } => {
                self.on_neg_msg(peer_key, session_id, frame.as_ref()).await
            }
            MediatorMessage::NegClose { session_id } => {
                self.on_neg_close(peer_key, session_id);
                Ok(())
            }
            MediatorMessage::OpsReq { session_id, ids } => {
                self.on_ops_req(peer_key, session_id, ids).await
            }
            MediatorMessage::OpsPush { session_id, data } => {
                self.on_ops_push(peer_key, session_id, data)
            }
        }
    }

    async fn on_hello(
        &self,
        peer_key: &str,
        node: &str,
        capabilities: Option<&PeerCapabilities>,
    ) -> SyncResult<()> {
        let shared = &self.shared;
        let config = &shared.config;
        shared.connections.set_node_name(peer_key, node);

        let caps = normalize_peer_capabilities(capabilities);
        let decision = choose_connect_sync_mode(
            &caps,
            config.negentropy_min_version,
            config.legacy_sync_enabled,
            config.negentropy_enabled,
        );
        shared.connections.set_negotiated(peer_key, caps, decision);
        info!(
            peer = %short_name(peer_key),
            node = %node,
            mode = ?decision.mode,
            reason = %decision.reason,
            "Negotiated sync mode"
        );
        shared.emit(MediatorEvent::ModeNegotiated {
            peer_key: peer_key.to_string(),
            node_name: node.to_string(),
            mode: decision.mode,
            reason: decision.reason,
        });

        let Some(state) = shared.connections.get(peer_key) else {
            return Ok(());
        };
        match decision.mode {
            Some(SyncMode::Negentropy) => {
                if should_start_connect_time_negentropy(
                    decision.mode,
                    state.has_active_session,
                    state.is_initiator,
                ) {
                    self.start_session(peer_key).await?;
                }
            }
            Some(SyncMode::Legacy) => self.sync_queue.push(peer_key.to_string())?,
            None => warn!(
                peer = %short_name(peer_key),
                reason = %decision.reason,
                "No compatible sync mode"
            ),
        }
        Ok(())
    }

    fn on_legacy_sync(&self, peer_key: &str, node: &str) -> SyncResult<()> {
        let mode = self.shared.connections.sync_mode(peer_key);
        if !should_accept_legacy_sync(mode, self.shared.config.legacy_sync_enabled) {
            self.drop_message(peer_key, "legacy sync not accepted for this peer");
            return Ok(());
        }
        info!(peer = %short_name(peer_key), node = %node, "Legacy sync requested");
        self.export_queue.push(peer_key.to_string())
    }

    fn on_legacy_batch(&self, peer_key: &str, node: &str, data: Vec<Operation>) -> SyncResult<()> {
        let mode = self.shared.connections.sync_mode(peer_key);
        if !should_accept_legacy_sync(mode, self.shared.config.legacy_sync_enabled) {
            self.drop_message(peer_key, "legacy batch not accepted for this peer");
            return Ok(());
        }
        if data.is_empty() {
            return Ok(());
        }

        let fresh = self.is_new_batch(&data);
        self.shared.metrics.legacy_batch(!fresh);
        if !fresh {
            debug!(peer = %short_name(peer_key), node = %node, size = data.len(), "Duplicate batch");
            return Ok(());
        }

        self.shared.metrics.ops_received(&data, now_ms());
        self.import_queue.push(ImportTask {
            peer_key: peer_key.to_string(),
            source: ImportSource::LegacyBatch,
            operations: data,
        })
    }

    async fn on_queue(
        &self,
        peer_key: &str,
        node: String,
        mut relays: Vec<String>,
        data: Vec<Operation>,
    ) -> SyncResult<()> {
        if self.shared.connections.sync_mode(peer_key).is_none() {
            self.drop_message(peer_key, "queue before sync mode was negotiated");
            return Ok(());
        }
        if data.is_empty() {
            return Ok(());
        }
        if !self.is_new_batch(&data) {
            self.shared.metrics.legacy_batch(true);
            debug!(peer = %short_name(peer_key), node = %node, "Duplicate queue");
            return Ok(());
        }

        self.shared.metrics.ops_received(&data, now_ms());
        self.import_queue.push(ImportTask {
            peer_key: peer_key.to_string(),
            source: ImportSource::Queue,
            operations: data.clone(),
        })?;

        relays.push(peer_key.to_string());
        let message = MediatorMessage::Queue {
            node,
            relays: relays.clone(),
            data,
        };
        self.relay(&relays, &message).await;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Negentropy sessions
    // ═══════════════════════════════════════════════════════════════════════

    fn negentropy_negotiated(&self, peer_key: &str) -> bool {
        self.shared.config.negentropy_enabled
            && self.shared.connections.sync_mode(peer_key) == Some(SyncMode::Negentropy)
    }

    /// Start a windowed session with `peer_key`.
    ///
    /// Returns false when the peer is not in negentropy mode or a session is
    /// already running on the connection.
    pub async fn start_session(&self, peer_key: &str) -> SyncResult<bool> {
        if !self.negentropy_negotiated(peer_key) {
            return Ok(false);
        }
        if !self.shared.connections.begin_session(peer_key) {
            return Ok(false);
        }

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (session, open) = match self.open_session(session_id) {
            Ok(opened) => opened,
            Err(e) => {
                self.shared.connections.end_session(peer_key, None);
                return Err(e);
            }
        };
        let windows = session.pending_windows.len() + 1;
        self.sessions
            .lock()
            .insert(peer_key.to_string(), PeerSession::Initiator(session));
        self.shared.metrics.session_started();
        info!(peer = %short_name(peer_key), session_id, windows, "Negentropy session started");

        if let Err(e) = self.shared.send(peer_key, &open).await {
            self.fail_session(peer_key, session_id, &e, false).await;
            return Err(e);
        }
        Ok(true)
    }

    fn open_session(&self, session_id: u64) -> SyncResult<(InitiatorSession, MediatorMessage)> {
        let config = &self.shared.config;
        let mut adapter = NegentropyAdapter::create(self.shared.store.clone(), config.adapter_options())?;

        let mut windows: VecDeque<SyncWindow> =
            adapter.plan_windows(chrono::Utc::now().timestamp())?.into();
        // Peer records outside our own bounds still land in a window
        if let Some(newest) = windows.front_mut() {
            newest.to_ts = i64::MAX;
        }
        if let Some(oldest) = windows.back_mut() {
            oldest.from_ts = i64::MIN;
        }
        let first = windows.pop_front().unwrap_or_else(|| SyncWindow {
            max_records: config.max_records_per_window,
            ..SyncWindow::full_history()
        });

        let window_stats = adapter.rebuild_for_window(&first)?;
        let frame = adapter.initiate()?;
        let session = InitiatorSession {
            session_id,
            adapter,
            pending_windows: windows,
            window_stats,
            window_started: Instant::now(),
            rounds: 1,
            started: Instant::now(),
            summary: SessionStats::default(),
        };
        let open = MediatorMessage::NegOpen {
            session_id,
            window: first,
            frame: encode_negentropy_frame(frame),
        };
        Ok((session, open))
    }

    /// Drop any session on the connection without notifying the peer
    fn drop_session(&self, peer_key: &str) {
        if let Some(PeerSession::Initiator(session)) = self.sessions.lock().remove(peer_key) {
            self.shared
                .metrics
                .session_finished(session.started.elapsed().as_millis() as u64, false);
        }
    }

    async fn fail_session(&self, peer_key: &str, session_id: u64, error: &SyncError, notify: bool) {
        let removed = {
            let mut sessions = self.sessions.lock();
            let matches = match sessions.get(peer_key) {
                Some(PeerSession::Initiator(s)) => s.session_id == session_id,
                Some(PeerSession::Responder(s)) => s.session_id == session_id,
                None => false,
            };
            if matches {
                sessions.remove(peer_key)
            } else {
                None
            }
        };
        let Some(session) = removed else {
            return;
        };

        self.shared.connections.end_session(peer_key, None);
        if let PeerSession::Initiator(session) = session {
            self.shared
                .metrics
                .session_finished(session.started.elapsed().as_millis() as u64, false);
        }
        warn!(peer = %short_name(peer_key), session_id, error = %error, "Negentropy session failed");
        self.shared.emit(MediatorEvent::SessionFailed {
            peer_key: peer_key.to_string(),
            session_id,
            error: error.to_string(),
        });

        if notify {
            let close = MediatorMessage::NegClose { session_id };
            if let Err(e) = self.shared.send(peer_key, &close).await {
                debug!(peer = %short_name(peer_key), error = %e, "Could not send neg_close");
            }
        }
    }

    async fn on_neg_open(
        &self,
        peer_key: &str,
        session_id: u64,
        window: &SyncWindow,
        frame: &NegentropyFrame,
    ) -> SyncResult<()> {
        if !self.negentropy_negotiated(peer_key) {
            self.drop_message(peer_key, "neg_open without negentropy mode");
            return Ok(());
        }

        let reply = match self.respond_to_open(peer_key, session_id, window, frame) {
            Ok(Some(reply)) => reply,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.fail_session(peer_key, session_id, &e, true).await;
                return Ok(());
            }
        };
        debug!(
            peer = %short_name(peer_key),
            session_id,
            window = %window.name,
            "Answering neg_open"
        );
        let message = MediatorMessage::NegMsg {
            session_id,
            frame: reply.map(encode_negentropy_frame),
        };
        self.shared.send(peer_key, &message).await
    }

    /// Rebuild the responder for `window` and answer the opening frame.
    ///
    /// The outer `None` means the open was refused and nothing is sent.
    fn respond_to_open(
        &self,
        peer_key: &str,
        session_id: u64,
        window: &SyncWindow,
        frame: &NegentropyFrame,
    ) -> SyncResult<Option<Option<Vec<u8>>>> {
        let bytes = decode_negentropy_frame(frame)?.into_bytes();
        let mut sessions = self.sessions.lock();

        let existing = match sessions.get(peer_key) {
            Some(PeerSession::Initiator(_)) => None,
            Some(PeerSession::Responder(s)) => Some(s.session_id == session_id),
            None => Some(false),
        };
        let Some(reuse) = existing else {
            drop(sessions);
            self.drop_message(peer_key, "neg_open while our own session is running");
            return Ok(None);
        };
        if !reuse {
            let adapter = NegentropyAdapter::create(
                self.shared.store.clone(),
                self.shared.config.adapter_options(),
            )?;
            sessions.insert(
                peer_key.to_string(),
                PeerSession::Responder(ResponderSession {
                    session_id,
                    adapter,
                }),
            );
            self.shared.connections.begin_session(peer_key);
        }

        let Some(PeerSession::Responder(session)) = sessions.get_mut(peer_key) else {
            return Ok(None);
        };
        // The peer's window never lifts our own record cap
        let window = SyncWindow {
            max_records: window
                .max_records
                .min(self.shared.config.max_records_per_window),
            ..window.clone()
        };
        session.adapter.rebuild_for_window(&window)?;
        Ok(Some(session.adapter.respond(&bytes)?))
    }

    async fn on_neg_msg(
        &self,
        peer_key: &str,
        session_id: u64,
        frame: Option<&NegentropyFrame>,
    ) -> SyncResult<()> {
        let is_initiator = match self.sessions.lock().get(peer_key) {
            Some(PeerSession::Initiator(s)) if s.session_id == session_id => true,
            Some(PeerSession::Responder(s)) if s.session_id == session_id => false,
            _ => {
                self.drop_message(peer_key, format!("neg_msg for unknown session {session_id}"));
                return Ok(());
            }
        };

        if !is_initiator {
            let Some(frame) = frame else {
                return Ok(());
            };
            let reply = match self.respond_to_msg(peer_key, session_id, frame) {
                Ok(reply) => reply,
                Err(e) => {
                    self.fail_session(peer_key, session_id, &e, true).await;
                    return Ok(());
                }
            };
            let message = MediatorMessage::NegMsg {
                session_id,
                frame: reply.map(encode_negentropy_frame),
            };
            return self.shared.send(peer_key, &message).await;
        }

        let step = match self.step_initiator(peer_key, session_id, frame) {
            Ok(step) => step,
            Err(e) => {
                self.fail_session(peer_key, session_id, &e, true).await;
                return Ok(());
            }
        };
        self.carry_out(peer_key, session_id, step).await
    }

    fn respond_to_msg(
        &self,
        peer_key: &str,
        session_id: u64,
        frame: &NegentropyFrame,
    ) -> SyncResult<Option<Vec<u8>>> {
        let bytes = decode_negentropy_frame(frame)?.into_bytes();
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(peer_key) {
            Some(PeerSession::Responder(session)) if session.session_id == session_id => {
                session.adapter.respond(&bytes)
            }
            _ => Ok(None),
        }
    }

    /// Consume a responder frame and decide what to send next
    fn step_initiator(
        &self,
        peer_key: &str,
        session_id: u64,
        frame: Option<&NegentropyFrame>,
    ) -> SyncResult<InitiatorStep> {
        let max_rounds = self.shared.config.max_rounds_per_session;
        let mut sessions = self.sessions.lock();
        let Some(PeerSession::Initiator(session)) = sessions.get_mut(peer_key) else {
            return Ok(InitiatorStep::default());
        };
        if session.session_id != session_id {
            return Ok(InitiatorStep::default());
        }

        // `frame: None` means the responder reached a terminal state
        let converged = match frame {
            None => true,
            Some(frame) => {
                let bytes = decode_negentropy_frame(frame)?.into_bytes();
                match session.adapter.reconcile(&bytes)?.next_msg {
                    None => true,
                    Some(_) if session.rounds >= max_rounds => false,
                    Some(next) => {
                        session.rounds += 1;
                        return Ok(InitiatorStep {
                            messages: vec![MediatorMessage::NegMsg {
                                session_id,
                                frame: Some(encode_negentropy_frame(next)),
                            }],
                            ..Default::default()
                        });
                    }
                }
            }
        };

        let resolved = session.adapter.take_resolved();
        let stats = WindowStats {
            rounds: session.rounds,
            completed: converged,
            capped_by_rounds: !converged,
            duration_ms: session.window_started.elapsed().as_millis() as u64,
            ..session.window_stats.clone()
        };

        let summary = &mut session.summary;
        summary.window_count += 1;
        summary.rounds += stats.rounds;
        summary.loaded += stats.loaded;
        summary.skipped += stats.skipped;
        summary.have_ids.extend(resolved.have_ids.iter().cloned());
        summary.need_ids.extend(resolved.need_ids.iter().cloned());
        summary.windows.push(stats.clone());

        let mut step = InitiatorStep {
            have_ids: resolved.have_ids,
            need_ids: resolved.need_ids,
            window: Some(stats),
            ..Default::default()
        };

        match session.pending_windows.pop_front() {
            Some(window) => {
                session.window_stats = session.adapter.rebuild_for_window(&window)?;
                let frame = session.adapter.initiate()?;
                session.window_started = Instant::now();
                session.rounds = 1;
                step.messages.push(MediatorMessage::NegOpen {
                    session_id,
                    window,
                    frame: encode_negentropy_frame(frame),
                });
            }
            None => {
                session.summary.duration_ms = session.started.elapsed().as_millis() as u64;
                let summary = std::mem::take(&mut session.summary);
                sessions.remove(peer_key);
                step.messages.push(MediatorMessage::NegClose { session_id });
                step.finished = Some(summary);
            }
        }
        Ok(step)
    }

    async fn carry_out(&self, peer_key: &str, session_id: u64, step: InitiatorStep) -> SyncResult<()> {
        let shared = &self.shared;

        if let Some(stats) = &step.window {
            let (have, need) = (step.have_ids.len(), step.need_ids.len());
            shared.metrics.record_window(stats, have, need);
            info!(
                peer = %short_name(peer_key),
                session_id,
                window = %stats.window_name,
                loaded = stats.loaded,
                rounds = stats.rounds,
                completed = stats.completed,
                capped_by_rounds = stats.capped_by_rounds,
                capped_by_records = stats.capped_by_records,
                have,
                need,
                duration_ms = stats.duration_ms,
                "Window reconciled"
            );
            shared.emit(MediatorEvent::WindowCompleted {
                peer_key: peer_key.to_string(),
                stats: stats.clone(),
                have,
                need,
            });
        }

        if !step.have_ids.is_empty() {
            let mut pushed = 0;
            for data in shared.push_batches_for(&step.have_ids)? {
                pushed += data.len();
                shared
                    .send(peer_key, &MediatorMessage::OpsPush { session_id, data })
                    .await?;
            }
            shared.metrics.ops_pushed(pushed);
        }
        if !step.need_ids.is_empty() {
            for ids in shared.batcher.id_chunks(&step.need_ids) {
                shared.metrics.ops_requested(ids.len());
                shared
                    .send(peer_key, &MediatorMessage::OpsReq { session_id, ids })
                    .await?;
            }
        }

        for message in &step.messages {
            shared.send(peer_key, message).await?;
        }

        if let Some(stats) = step.finished {
            shared.connections.end_session(peer_key, Some(now_ms()));
            shared.metrics.session_finished(stats.duration_ms, true);
            info!(
                peer = %short_name(peer_key),
                session_id,
                windows = stats.window_count,
                rounds = stats.rounds,
                have = stats.have_ids.len(),
                need = stats.need_ids.len(),
                duration_ms = stats.duration_ms,
                "Negentropy session completed"
            );
            shared.emit(MediatorEvent::SessionCompleted {
                peer_key: peer_key.to_string(),
                session_id,
                stats,
            });
        }
        Ok(())
    }

    fn on_neg_close(&self, peer_key: &str, session_id: u64) {
        let removed = {
            let mut sessions = self.sessions.lock();
            match sessions.get(peer_key) {
                Some(PeerSession::Responder(s)) if s.session_id == session_id => {
                    sessions.remove(peer_key)
                }
                Some(PeerSession::Initiator(s)) if s.session_id == session_id => {
                    sessions.remove(peer_key)
                }
                _ => None,
            }
        };

        match removed {
            Some(PeerSession::Responder(_)) => {
                self.shared.connections.end_session(peer_key, None);
                debug!(peer = %short_name(peer_key), session_id, "Responder session closed");
            }
            Some(PeerSession::Initiator(session)) => {
                self.shared.connections.end_session(peer_key, None);
                self.shared
                    .metrics
                    .session_finished(session.started.elapsed().as_millis() as u64, false);
                warn!(peer = %short_name(peer_key), session_id, "Peer aborted negentropy session");
                self.shared.emit(MediatorEvent::SessionFailed {
                    peer_key: peer_key.to_string(),
                    session_id,
                    error: "closed by peer".to_string(),
                });
            }
            None => debug!(peer = %short_name(peer_key), session_id, "neg_close for unknown session"),
        }
    }

    async fn on_ops_req(&self, peer_key: &str, session_id: u64, ids: Vec<String>) -> SyncResult<()> {
        if !self.negentropy_negotiated(peer_key) {
            self.drop_message(peer_key, "ops_req without negentropy mode");
            return Ok(());
        }
        let ids = normalize_negentropy_ids(ids);
        if ids.is_empty() {
            return Ok(());
        }

        let mut pushed = 0;
        for data in self.shared.push_batches_for(&ids)? {
            pushed += data.len();
            self.shared
                .send(peer_key, &MediatorMessage::OpsPush { session_id, data })
                .await?;
        }
        self.shared.metrics.ops_pushed(pushed);
        debug!(
            peer = %short_name(peer_key),
            session_id,
            requested = ids.len(),
            pushed,
            "Answered ops_req"
        );
        Ok(())
    }

    fn on_ops_push(&self, peer_key: &str, session_id: u64, data: Vec<Operation>) -> SyncResult<()> {
        if !self.negentropy_negotiated(peer_key) {
            self.drop_message(peer_key, "ops_push without negentropy mode");
            return Ok(());
        }
        if data.is_empty() {
            return Ok(());
        }
        debug!(peer = %short_name(peer_key), session_id, size = data.len(), "Received ops_push");
        self.shared.metrics.ops_received(&data, now_ms());
        self.import_queue.push(ImportTask {
            peer_key: peer_key.to_string(),
            source: ImportSource::Negentropy,
            operations: data,
        })
    }
}
