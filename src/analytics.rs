//! Tool usage analytics.
//!
//! Every recorded call lands in an in-memory stats map immediately; a
//! background writer drains the dirtied keys to SQLite on a fixed interval,
//! so a burst of calls costs one write per tool instead of one per call.
//! A crash can lose at most one interval of unwritten history.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Duration, Instant};

use crate::errors::McpError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Samples kept per tool for the rolling execution-time window.
const MAX_SAMPLES: usize = 100;

/// How long dirtied stats may sit in memory before the writer persists them.
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Stats are keyed by server id and tool name.
type StatKey = (String, String);

// ─── Usage Stats ─────────────────────────────────────────────────────────────

/// Rolling usage record for one tool on one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUsageStat {
    pub usage_count: u64,
    pub success_count: u64,
    pub last_used_at: DateTime<Utc>,
    /// Most recent execution times, oldest first, capped at `MAX_SAMPLES`.
    pub execution_times_ms: VecDeque<u64>,
}

impl ToolUsageStat {
    fn new() -> Self {
        Self {
            usage_count: 0,
            success_count: 0,
            last_used_at: Utc::now(),
            execution_times_ms: VecDeque::new(),
        }
    }

    fn record(&mut self, success: bool, execution_time_ms: u64) {
        self.usage_count += 1;
        if success {
            self.success_count += 1;
        }
        self.last_used_at = Utc::now();
        self.execution_times_ms.push_back(execution_time_ms);
        while self.execution_times_ms.len() > MAX_SAMPLES {
            self.execution_times_ms.pop_front();
        }
    }

    /// Mean of the sampled execution times, 0.0 when none are recorded.
    pub fn avg_execution_time_ms(&self) -> f64 {
        if self.execution_times_ms.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.execution_times_ms.iter().sum();
        sum as f64 / self.execution_times_ms.len() as f64
    }

    /// Fraction of recorded calls that succeeded; 1.0 when nothing has
    /// been recorded.
    pub fn success_rate(&self) -> f64 {
        if self.usage_count == 0 {
            return 1.0;
        }
        self.success_count as f64 / self.usage_count as f64
    }
}

// ─── Stat Store ──────────────────────────────────────────────────────────────

/// SQLite persistence for usage stats.
///
/// Uses `rusqlite` in synchronous mode; writes are small and batched by the
/// analytics writer. Pass `":memory:"` for an in-memory database (tests).
pub struct StatStore {
    conn: Connection,
}

impl StatStore {
    /// Open (or create) the stat database at the given path.
    pub fn open(path: &str) -> Result<Self, McpError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self { conn };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<(), McpError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tool_usage_stats (
                server_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                usage_count INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                last_used_at TEXT NOT NULL,
                execution_times TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (server_id, tool_name)
            );
            ",
        )?;
        Ok(())
    }

    /// Load every persisted stat, keyed by (server id, tool name).
    pub fn load_all(&self) -> Result<HashMap<StatKey, ToolUsageStat>, McpError> {
        let mut stmt = self.conn.prepare(
            "SELECT server_id, tool_name, usage_count, success_count,
                    last_used_at, execution_times
             FROM tool_usage_stats",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                ToolUsageStat {
                    usage_count: row.get::<_, i64>(2)? as u64,
                    success_count: row.get::<_, i64>(3)? as u64,
                    last_used_at: parse_timestamp(row.get::<_, String>(4)?),
                    execution_times_ms: parse_samples(row.get::<_, String>(5)?),
                },
            ))
        })?;

        let mut stats = HashMap::new();
        for row in rows {
            let (server_id, tool_name, stat) = row?;
            stats.insert((server_id, tool_name), stat);
        }
        Ok(stats)
    }

    /// Write one stat, replacing any previous row for the same tool.
    pub fn upsert(
        &self,
        server_id: &str,
        tool_name: &str,
        stat: &ToolUsageStat,
    ) -> Result<(), McpError> {
        let samples = serde_json::to_string(&stat.execution_times_ms)
            .unwrap_or_else(|_| "[]".to_string());

        self.conn.execute(
            "INSERT INTO tool_usage_stats
             (server_id, tool_name, usage_count, success_count, last_used_at, execution_times)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(server_id, tool_name) DO UPDATE SET
                 usage_count = excluded.usage_count,
                 success_count = excluded.success_count,
                 last_used_at = excluded.last_used_at,
                 execution_times = excluded.execution_times",
            params![
                server_id,
                tool_name,
                stat.usage_count as i64,
                stat.success_count as i64,
                stat.last_used_at.to_rfc3339(),
                samples,
            ],
        )?;
        Ok(())
    }
}

/// Parse an RFC 3339 column, falling back to now for unreadable rows.
fn parse_timestamp(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Parse a JSON sample column, defaulting to empty.
fn parse_samples(raw: String) -> VecDeque<u64> {
    serde_json::from_str(&raw).unwrap_or_default()
}

// ─── Analytics ───────────────────────────────────────────────────────────────

enum WriterCommand {
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// In-memory usage stats with debounced SQLite persistence.
///
/// Reads and writes hit the in-memory map directly; the writer task owns
/// the store and persists dirtied entries once per flush interval. Must be
/// constructed inside a Tokio runtime.
pub struct UsageAnalytics {
    stats: Arc<RwLock<HashMap<StatKey, ToolUsageStat>>>,
    dirty_tx: mpsc::UnboundedSender<StatKey>,
    commands: mpsc::UnboundedSender<WriterCommand>,
}

impl UsageAnalytics {
    /// Open file-backed analytics, loading whatever stats are already there.
    pub fn open(path: &Path) -> Result<Self, McpError> {
        let store = StatStore::open(&path.to_string_lossy())?;
        Self::with_store(store)
    }

    /// Analytics with no file behind them, for tests and ephemeral use.
    pub fn in_memory() -> Result<Self, McpError> {
        Self::with_store(StatStore::open(":memory:")?)
    }

    fn with_store(store: StatStore) -> Result<Self, McpError> {
        let stats = Arc::new(RwLock::new(store.load_all()?));
        let (dirty_tx, dirty_rx) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_writer(Arc::clone(&stats), store, dirty_rx, command_rx));

        Ok(Self {
            stats,
            dirty_tx,
            commands,
        })
    }

    /// Record one tool call. Visible to readers immediately; persisted on
    /// the next flush.
    pub fn record_usage(
        &self,
        server_id: &str,
        tool_name: &str,
        success: bool,
        execution_time_ms: u64,
    ) {
        let key = (server_id.to_string(), tool_name.to_string());
        {
            let mut stats = write_lock(&self.stats);
            stats
                .entry(key.clone())
                .or_insert_with(ToolUsageStat::new)
                .record(success, execution_time_ms);
        }
        let _ = self.dirty_tx.send(key);
    }

    /// Current stat for one tool, if any calls have been recorded or loaded.
    pub fn stat(&self, server_id: &str, tool_name: &str) -> Option<ToolUsageStat> {
        read_lock(&self.stats)
            .get(&(server_id.to_string(), tool_name.to_string()))
            .cloned()
    }

    /// Usage count shortcut for scoring.
    pub fn usage_count(&self, server_id: &str, tool_name: &str) -> u64 {
        read_lock(&self.stats)
            .get(&(server_id.to_string(), tool_name.to_string()))
            .map(|s| s.usage_count)
            .unwrap_or(0)
    }

    /// Persist everything dirty right now instead of waiting for the
    /// interval.
    pub async fn flush_now(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(WriterCommand::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Final flush and writer shutdown. Further records stay in memory only.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(WriterCommand::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

fn read_lock<'a>(
    stats: &'a RwLock<HashMap<StatKey, ToolUsageStat>>,
) -> std::sync::RwLockReadGuard<'a, HashMap<StatKey, ToolUsageStat>> {
    stats.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<'a>(
    stats: &'a RwLock<HashMap<StatKey, ToolUsageStat>>,
) -> std::sync::RwLockWriteGuard<'a, HashMap<StatKey, ToolUsageStat>> {
    stats.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Writer task: drain dirty keys to the store once per interval, on
/// explicit flushes, and once more at shutdown.
async fn run_writer(
    stats: Arc<RwLock<HashMap<StatKey, ToolUsageStat>>>,
    store: StatStore,
    mut dirty_rx: mpsc::UnboundedReceiver<StatKey>,
    mut command_rx: mpsc::UnboundedReceiver<WriterCommand>,
) {
    // First tick lands one full interval out, not immediately.
    let mut ticker = interval_at(Instant::now() + FLUSH_INTERVAL, FLUSH_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                flush_dirty(&stats, &store, &mut dirty_rx);
            }
            cmd = command_rx.recv() => match cmd {
                Some(WriterCommand::Flush(ack)) => {
                    flush_dirty(&stats, &store, &mut dirty_rx);
                    let _ = ack.send(());
                }
                Some(WriterCommand::Shutdown(ack)) => {
                    flush_dirty(&stats, &store, &mut dirty_rx);
                    let _ = ack.send(());
                    return;
                }
                // All handles dropped; drain once and stop.
                None => {
                    flush_dirty(&stats, &store, &mut dirty_rx);
                    return;
                }
            },
        }
    }
}

fn flush_dirty(
    stats: &RwLock<HashMap<StatKey, ToolUsageStat>>,
    store: &StatStore,
    dirty_rx: &mut mpsc::UnboundedReceiver<StatKey>,
) {
    let mut keys = HashSet::new();
    while let Ok(key) = dirty_rx.try_recv() {
        keys.insert(key);
    }
    if keys.is_empty() {
        return;
    }

    let count = keys.len();
    let snapshot = read_lock(stats);
    for key in keys {
        if let Some(stat) = snapshot.get(&key) {
            if let Err(e) = store.upsert(&key.0, &key.1, stat) {
                tracing::warn!(
                    server = %key.0,
                    tool = %key.1,
                    error = %e,
                    "failed to persist tool usage stat"
                );
            }
        }
    }
    tracing::debug!(count, "persisted tool usage stats");
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_caps_samples_fifo() {
        let mut stat = ToolUsageStat::new();
        for i in 0..150u64 {
            stat.record(true, i);
        }

        assert_eq!(stat.usage_count, 150);
        assert_eq!(stat.execution_times_ms.len(), MAX_SAMPLES);
        // The 50 oldest samples were evicted.
        assert_eq!(stat.execution_times_ms.front(), Some(&50));
        assert_eq!(stat.execution_times_ms.back(), Some(&149));
    }

    #[test]
    fn test_stat_success_rate_and_avg() {
        let mut stat = ToolUsageStat::new();
        assert_eq!(stat.success_rate(), 1.0);
        assert_eq!(stat.avg_execution_time_ms(), 0.0);

        stat.record(true, 10);
        stat.record(false, 30);
        assert_eq!(stat.success_rate(), 0.5);
        assert_eq!(stat.avg_execution_time_ms(), 20.0);
    }

    #[test]
    fn test_store_roundtrip() {
        let store = StatStore::open(":memory:").unwrap();

        let mut stat = ToolUsageStat::new();
        stat.record(true, 12);
        stat.record(false, 40);
        store.upsert("files", "read_file", &stat).unwrap();

        let loaded = store.load_all().unwrap();
        let restored = &loaded[&("files".to_string(), "read_file".to_string())];
        assert_eq!(restored.usage_count, 2);
        assert_eq!(restored.success_count, 1);
        assert_eq!(restored.execution_times_ms, VecDeque::from([12, 40]));
    }

    #[test]
    fn test_store_upsert_replaces_row() {
        let store = StatStore::open(":memory:").unwrap();

        let mut stat = ToolUsageStat::new();
        stat.record(true, 5);
        store.upsert("files", "read_file", &stat).unwrap();
        stat.record(true, 7);
        store.upsert("files", "read_file", &stat).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(
            loaded[&("files".to_string(), "read_file".to_string())].usage_count,
            2
        );
    }

    #[tokio::test]
    async fn test_record_visible_immediately() {
        let analytics = UsageAnalytics::in_memory().unwrap();
        assert!(analytics.stat("files", "read_file").is_none());

        analytics.record_usage("files", "read_file", true, 9);

        let stat = analytics.stat("files", "read_file").unwrap();
        assert_eq!(stat.usage_count, 1);
        assert_eq!(analytics.usage_count("files", "read_file"), 1);
        assert_eq!(analytics.usage_count("files", "unseen_tool"), 0);
    }

    #[tokio::test]
    async fn test_flush_now_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.db");

        let analytics = UsageAnalytics::open(&path).unwrap();
        analytics.record_usage("files", "read_file", true, 9);
        analytics.flush_now().await;

        let probe = StatStore::open(&path.to_string_lossy()).unwrap();
        let loaded = probe.load_all().unwrap();
        assert_eq!(
            loaded[&("files".to_string(), "read_file".to_string())].usage_count,
            1
        );
    }

    #[tokio::test]
    async fn test_open_loads_persisted_stats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.db");

        {
            let analytics = UsageAnalytics::open(&path).unwrap();
            analytics.record_usage("files", "search", false, 120);
            analytics.shutdown().await;
        }

        let reopened = UsageAnalytics::open(&path).unwrap();
        let stat = reopened.stat("files", "search").unwrap();
        assert_eq!(stat.usage_count, 1);
        assert_eq!(stat.success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_debounced_to_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.db");

        let analytics = UsageAnalytics::open(&path).unwrap();
        // Poll the writer once so its interval starts before time moves.
        tokio::task::yield_now().await;
        analytics.record_usage("files", "read_file", true, 3);
        analytics.record_usage("files", "read_file", true, 4);

        // Inside the window: in memory, not yet in the store.
        tokio::time::advance(Duration::from_millis(4_900)).await;
        tokio::task::yield_now().await;
        let probe = StatStore::open(&path.to_string_lossy()).unwrap();
        assert!(probe.load_all().unwrap().is_empty());
        assert_eq!(analytics.usage_count("files", "read_file"), 2);

        // Crossing it: the writer coalesces both records into one row.
        tokio::time::advance(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let loaded = probe.load_all().unwrap();
        assert_eq!(
            loaded[&("files".to_string(), "read_file".to_string())].usage_count,
            2
        );
    }
}
