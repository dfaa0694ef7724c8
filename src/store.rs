//! SQLite-backed record sink and checkpoint store.
//!
//! - WAL journal, foreign keys enforced
//! - one transaction per batch, cached prepared statements
//! - upserts only touch rows whose content actually changed
//! - `fetch_runs` is append-only (triggers reject UPDATE and DELETE)

use crate::aggregate::{ParentStats, ThreadStats};
use crate::checkpoint::{Checkpoint, CheckpointStore, RunAudit, RunCounts, RunHandle, RunStatus};
use crate::date::now_ts;
use crate::error::WriteError;
use crate::model::{Actor, ChildRecord, ParentRecord, ParentRef};
use crate::window::Window;
use crate::writer::RecordSink;
use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sources (
    name TEXT PRIMARY KEY,
    last_checkpoint INTEGER,
    last_checkpoint_cursor TEXT,
    run_seq INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS actors (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS parents (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    created_utc INTEGER NOT NULL,
    edited_at INTEGER,
    author_id TEXT REFERENCES actors(id),
    author_name TEXT,
    title TEXT NOT NULL,
    selftext TEXT,
    score INTEGER NOT NULL,
    num_comments INTEGER NOT NULL,
    url TEXT,
    permalink TEXT,
    stickied INTEGER NOT NULL,
    retrieved_at INTEGER NOT NULL,
    payload_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_parents_source_created
    ON parents(source, created_utc DESC);

CREATE TABLE IF NOT EXISTS children (
    id TEXT PRIMARY KEY,
    parent_id TEXT NOT NULL REFERENCES parents(id),
    parent_child_id TEXT REFERENCES children(id),
    depth INTEGER NOT NULL,
    api_depth INTEGER,
    created_utc INTEGER NOT NULL,
    edited_at INTEGER,
    author_id TEXT REFERENCES actors(id),
    author_name TEXT,
    body TEXT NOT NULL,
    score INTEGER NOT NULL,
    ups INTEGER NOT NULL,
    downs INTEGER NOT NULL,
    gilded INTEGER NOT NULL,
    stickied INTEGER NOT NULL,
    distinguished TEXT,
    is_submitter INTEGER NOT NULL,
    collapsed INTEGER NOT NULL,
    collapsed_reason TEXT,
    controversiality INTEGER NOT NULL,
    permalink TEXT,
    retrieved_at INTEGER NOT NULL,
    is_deleted INTEGER NOT NULL,
    is_removed INTEGER NOT NULL,
    payload_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_children_parent
    ON children(parent_id, depth);

CREATE TABLE IF NOT EXISTS thread_stats (
    parent_id TEXT PRIMARY KEY REFERENCES parents(id),
    total_comments INTEGER NOT NULL,
    unique_authors INTEGER NOT NULL,
    deleted_comments INTEGER NOT NULL,
    removed_comments INTEGER NOT NULL,
    average_score REAL NOT NULL,
    max_depth INTEGER NOT NULL,
    gilded_comments INTEGER NOT NULL,
    computed_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS fetch_runs (
    run_id TEXT PRIMARY KEY,
    source TEXT NOT NULL REFERENCES sources(name),
    window_start INTEGER NOT NULL,
    window_end INTEGER NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('succeeded', 'failed', 'partial')),
    actors_written INTEGER NOT NULL,
    parents_written INTEGER NOT NULL,
    children_written INTEGER NOT NULL,
    aggregates_written INTEGER NOT NULL,
    error_count INTEGER NOT NULL,
    started_at INTEGER NOT NULL,
    finished_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_fetch_runs_source
    ON fetch_runs(source, started_at);

CREATE TRIGGER IF NOT EXISTS fetch_runs_no_update BEFORE UPDATE ON fetch_runs
BEGIN
    SELECT RAISE(ABORT, 'fetch_runs is append-only');
END;

CREATE TRIGGER IF NOT EXISTS fetch_runs_no_delete BEFORE DELETE ON fetch_runs
BEGIN
    SELECT RAISE(ABORT, 'fetch_runs is append-only');
END;
"#;

const UPSERT_ACTOR: &str = "INSERT INTO actors (id, name) VALUES (?1, ?2) \
     ON CONFLICT(id) DO UPDATE SET name = excluded.name \
     WHERE actors.name IS NOT excluded.name";

const UPSERT_PARENT: &str = "INSERT INTO parents \
     (id, source, created_utc, edited_at, author_id, author_name, title, selftext, score, \
      num_comments, url, permalink, stickied, retrieved_at, payload_json) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15) \
     ON CONFLICT(id) DO UPDATE SET \
        edited_at = excluded.edited_at, author_id = excluded.author_id, \
        author_name = excluded.author_name, title = excluded.title, \
        selftext = excluded.selftext, score = excluded.score, \
        num_comments = excluded.num_comments, url = excluded.url, \
        permalink = excluded.permalink, stickied = excluded.stickied, \
        retrieved_at = excluded.retrieved_at, payload_json = excluded.payload_json \
     WHERE COALESCE(excluded.edited_at, -1) > COALESCE(parents.edited_at, -1)";

const UPSERT_CHILD: &str = "INSERT INTO children \
     (id, parent_id, parent_child_id, depth, api_depth, created_utc, edited_at, author_id, \
      author_name, body, score, ups, downs, gilded, stickied, distinguished, is_submitter, \
      collapsed, collapsed_reason, controversiality, permalink, retrieved_at, is_deleted, \
      is_removed, payload_json) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
             ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25) \
     ON CONFLICT(id) DO UPDATE SET \
        depth = excluded.depth, edited_at = excluded.edited_at, author_id = excluded.author_id, \
        author_name = excluded.author_name, body = excluded.body, score = excluded.score, \
        ups = excluded.ups, downs = excluded.downs, gilded = excluded.gilded, \
        stickied = excluded.stickied, distinguished = excluded.distinguished, \
        collapsed = excluded.collapsed, collapsed_reason = excluded.collapsed_reason, \
        controversiality = excluded.controversiality, retrieved_at = excluded.retrieved_at, \
        is_deleted = excluded.is_deleted, is_removed = excluded.is_removed, \
        payload_json = excluded.payload_json \
     WHERE COALESCE(excluded.edited_at, -1) > COALESCE(children.edited_at, -1)";

const UPSERT_STATS: &str = "INSERT INTO thread_stats \
     (parent_id, total_comments, unique_authors, deleted_comments, removed_comments, \
      average_score, max_depth, gilded_comments, computed_at) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
     ON CONFLICT(parent_id) DO UPDATE SET \
        total_comments = excluded.total_comments, unique_authors = excluded.unique_authors, \
        deleted_comments = excluded.deleted_comments, removed_comments = excluded.removed_comments, \
        average_score = excluded.average_score, max_depth = excluded.max_depth, \
        gilded_comments = excluded.gilded_comments, computed_at = excluded.computed_at \
     WHERE thread_stats.total_comments IS NOT excluded.total_comments \
        OR thread_stats.unique_authors IS NOT excluded.unique_authors \
        OR thread_stats.deleted_comments IS NOT excluded.deleted_comments \
        OR thread_stats.removed_comments IS NOT excluded.removed_comments \
        OR thread_stats.average_score IS NOT excluded.average_score \
        OR thread_stats.max_depth IS NOT excluded.max_depth \
        OR thread_stats.gilded_comments IS NOT excluded.gilded_comments";

const COUNTABLE_TABLES: &[&str] = &["sources", "actors", "parents", "children", "thread_stats", "fetch_runs"];

/// Shared SQLite connection implementing both storage seams.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).with_context(|| format!("open database at {}", path.display()))?;
        let journal: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .context("set journal mode")?;
        if !journal.eq_ignore_ascii_case("wal") {
            tracing::warn!("WAL mode not active, journal_mode = {}", journal);
        }
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON").context("enable foreign keys")?;
        conn.pragma_update(None, "synchronous", "NORMAL").context("set synchronous mode")?;
        conn.execute_batch(SCHEMA_SQL).context("initialize database schema")?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Row count of one of the store's tables.
    pub fn table_count(&self, table: &str) -> Result<u64> {
        if !COUNTABLE_TABLES.contains(&table) {
            bail!("unknown table '{table}'");
        }
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn child_depth(&self, id: &str) -> Result<Option<u32>> {
        let conn = self.conn.lock();
        let depth: Option<i64> = conn
            .query_row("SELECT depth FROM children WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        Ok(depth.map(|d| d as u32))
    }

    pub fn parent_title(&self, id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row("SELECT title FROM parents WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?)
    }

    pub fn thread_stats(&self, parent_id: &str) -> Result<Option<ThreadStats>> {
        let conn = self.conn.lock();
        let stats = conn
            .query_row(
                "SELECT total_comments, unique_authors, deleted_comments, removed_comments, \
                        average_score, max_depth, gilded_comments \
                 FROM thread_stats WHERE parent_id = ?1",
                params![parent_id],
                |row| {
                    Ok(ThreadStats {
                        total_comments: row.get::<_, i64>(0)? as u64,
                        unique_authors: row.get::<_, i64>(1)? as u64,
                        deleted_comments: row.get::<_, i64>(2)? as u64,
                        removed_comments: row.get::<_, i64>(3)? as u64,
                        average_score: row.get(4)?,
                        max_depth: row.get::<_, i64>(5)? as u32,
                        gilded_comments: row.get::<_, i64>(6)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(stats)
    }

    /// Run `f` against the locked connection. Test and maintenance hook.
    pub fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<R>) -> Result<R> {
        let conn = self.conn.lock();
        Ok(f(&conn)?)
    }

    fn batch<T>(
        &self,
        sql: &str,
        rows: &[T],
        bind: impl Fn(&mut rusqlite::CachedStatement<'_>, &T) -> rusqlite::Result<usize>,
    ) -> Result<usize, WriteError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut changed = 0usize;
        {
            let mut stmt = tx.prepare_cached(sql)?;
            for row in rows {
                changed += bind(&mut stmt, row)?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }
}

fn payload_json(v: &serde_json::Value) -> Result<String, WriteError> {
    serde_json::to_string(v).map_err(|e| WriteError::failure(format!("serialize payload: {e}")))
}

impl RecordSink for SqliteStore {
    fn upsert_actors(&self, batch: &[Actor]) -> Result<usize, WriteError> {
        self.batch(UPSERT_ACTOR, batch, |stmt, a| stmt.execute(params![a.id, a.name]))
    }

    fn upsert_parents(&self, batch: &[ParentRecord]) -> Result<usize, WriteError> {
        let payloads = batch.iter().map(|p| payload_json(&p.payload)).collect::<Result<Vec<_>, _>>()?;
        let rows: Vec<(&ParentRecord, String)> = batch.iter().zip(payloads).collect();
        self.batch(UPSERT_PARENT, &rows, |stmt, (p, payload)| {
            stmt.execute(params![
                p.id,
                p.source,
                p.created_utc,
                p.edited_at,
                p.author_ref,
                p.author_name,
                p.title,
                p.selftext,
                p.score,
                p.num_comments,
                p.url,
                p.permalink,
                p.stickied,
                p.retrieved_at,
                payload,
            ])
        })
    }

    fn upsert_children(&self, batch: &[ChildRecord]) -> Result<usize, WriteError> {
        let payloads = batch.iter().map(|c| payload_json(&c.payload)).collect::<Result<Vec<_>, _>>()?;
        let rows: Vec<(&ChildRecord, String)> = batch.iter().zip(payloads).collect();
        self.batch(UPSERT_CHILD, &rows, |stmt, (c, payload)| {
            let parent_child = match &c.parent_ref {
                ParentRef::Child(id) => Some(id.as_str()),
                ParentRef::Parent(_) => None,
            };
            stmt.execute(params![
                c.id,
                c.parent_id,
                parent_child,
                c.depth,
                c.api_depth,
                c.created_utc,
                c.edited_at,
                c.author_ref,
                c.author_name,
                c.body,
                c.score,
                c.ups,
                c.downs,
                c.gilded,
                c.stickied,
                c.distinguished.map(|d| d.as_str()),
                c.is_submitter,
                c.collapsed,
                c.collapsed_reason,
                c.controversiality,
                c.permalink,
                c.retrieved_at,
                c.is_deleted,
                c.is_removed,
                payload,
            ])
        })
    }

    fn upsert_thread_stats(&self, batch: &[ParentStats]) -> Result<usize, WriteError> {
        let computed_at = now_ts();
        self.batch(UPSERT_STATS, batch, |stmt, s| {
            let t = &s.stats;
            stmt.execute(params![
                s.parent_id,
                t.total_comments as i64,
                t.unique_authors as i64,
                t.deleted_comments as i64,
                t.removed_comments as i64,
                t.average_score,
                t.max_depth,
                t.gilded_comments as i64,
                computed_at,
            ])
        })
    }
}

impl CheckpointStore for SqliteStore {
    fn ensure_source(&self, source: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("INSERT OR IGNORE INTO sources (name) VALUES (?1)", params![source])
            .with_context(|| format!("register source {source}"))?;
        Ok(())
    }

    fn checkpoint(&self, source: &str) -> Result<Option<Checkpoint>> {
        let conn = self.conn.lock();
        let row: Option<(Option<i64>, Option<String>)> = conn
            .query_row(
                "SELECT last_checkpoint, last_checkpoint_cursor FROM sources WHERE name = ?1",
                params![source],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .with_context(|| format!("read checkpoint for {source}"))?;
        Ok(row.and_then(|(at, cursor)| at.map(|at| Checkpoint { at, cursor })))
    }

    fn record_run_start(&self, source: &str, window: Window) -> Result<RunHandle> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("INSERT OR IGNORE INTO sources (name) VALUES (?1)", params![source])?;
        tx.execute("UPDATE sources SET run_seq = run_seq + 1 WHERE name = ?1", params![source])?;
        let seq: i64 = tx.query_row("SELECT run_seq FROM sources WHERE name = ?1", params![source], |row| row.get(0))?;
        tx.commit().with_context(|| format!("open run for {source}"))?;
        Ok(RunHandle {
            run_id: format!("{source}-{seq:06}"),
            source: source.to_string(),
            window,
            started_at: now_ts(),
        })
    }

    fn record_run_result(&self, handle: &RunHandle, status: RunStatus, counts: RunCounts) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO fetch_runs \
             (run_id, source, window_start, window_end, status, actors_written, parents_written, \
              children_written, aggregates_written, error_count, started_at, finished_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                handle.run_id,
                handle.source,
                handle.window.start,
                handle.window.end,
                status.as_str(),
                counts.actors as i64,
                counts.parents as i64,
                counts.children as i64,
                counts.aggregates as i64,
                counts.errors as i64,
                handle.started_at,
                now_ts(),
            ],
        )
        .with_context(|| format!("record result of run {}", handle.run_id))?;
        Ok(())
    }

    fn advance_checkpoint(&self, source: &str, cp: &Checkpoint) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE sources SET last_checkpoint = ?2, last_checkpoint_cursor = ?3 \
                 WHERE name = ?1 AND (last_checkpoint IS NULL OR last_checkpoint <= ?2)",
                params![source, cp.at, cp.cursor],
            )
            .with_context(|| format!("advance checkpoint for {source}"))?;
        if changed == 0 {
            tracing::warn!("checkpoint for {} not moved back to {}", source, cp.at);
        }
        Ok(changed > 0)
    }

    fn run_history(&self, source: &str) -> Result<Vec<RunAudit>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT run_id, source, window_start, window_end, status, actors_written, \
                    parents_written, children_written, aggregates_written, error_count, \
                    started_at, finished_at \
             FROM fetch_runs WHERE source = ?1 ORDER BY started_at, run_id",
        )?;
        let rows = stmt.query_map(params![source], |row| {
            let status: String = row.get(4)?;
            Ok((
                RunAudit {
                    run_id: row.get(0)?,
                    source: row.get(1)?,
                    window: Window::new(row.get(2)?, row.get(3)?),
                    status: RunStatus::Failed,
                    counts: RunCounts {
                        actors: row.get::<_, i64>(5)? as u64,
                        parents: row.get::<_, i64>(6)? as u64,
                        children: row.get::<_, i64>(7)? as u64,
                        aggregates: row.get::<_, i64>(8)? as u64,
                        errors: row.get::<_, i64>(9)? as u64,
                    },
                    started_at: row.get(10)?,
                    finished_at: row.get(11)?,
                },
                status,
            ))
        })?;
        let mut out = Vec::new();
        for r in rows {
            let (mut audit, status) = r?;
            audit.status = RunStatus::parse(&status)
                .with_context(|| format!("unknown status '{status}' in run {}", audit.run_id))?;
            out.push(audit);
        }
        Ok(out)
    }
}
