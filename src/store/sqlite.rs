//! SQLite 存储实现
//!
//! 时间统一存为 UTC 微秒整数，便于 last-writer-wins 比较；批量迁移在单事务内校验行数，不满足即回滚。

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use super::{
    Agent, AgentStatus, NewUnit, PostingStore, PostingUnit, RegistrationReport, StatusStore,
    StatusUpdate, UnitFilter, UnitStatus, WriteOutcome,
};
use crate::core::RelayError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS agent_status (
    agent_name TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    health INTEGER NOT NULL,
    last_activity TEXT NOT NULL DEFAULT '',
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS posting_units (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content TEXT NOT NULL,
    status TEXT NOT NULL,
    scheduled_for INTEGER NOT NULL,
    posted_at INTEGER,
    thread_key TEXT,
    position INTEGER,
    UNIQUE (thread_key, position)
);
CREATE INDEX IF NOT EXISTS idx_units_thread ON posting_units(thread_key);
CREATE INDEX IF NOT EXISTS idx_units_due ON posting_units(status, scheduled_for);
";

const UNIT_COLUMNS: &str =
    "id, content, status, scheduled_for, posted_at, thread_key, position";

/// SQLite 存储；克隆共享同一连接
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// 打开（必要时创建）数据库文件
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RelayError::Persistence(e.to_string()))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    /// 内存数据库（测试、dry run）
    pub fn in_memory() -> Result<Self, RelayError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, RelayError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }
}

pub(crate) fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(
        micros.div_euclid(1_000_000),
        (micros.rem_euclid(1_000_000) * 1_000) as u32,
    )
    .unwrap_or_default()
}

struct RawAgent {
    name: String,
    status: String,
    health: i64,
    last_activity: String,
    updated_at: i64,
}

fn raw_agent(row: &Row<'_>) -> rusqlite::Result<RawAgent> {
    Ok(RawAgent {
        name: row.get(0)?,
        status: row.get(1)?,
        health: row.get(2)?,
        last_activity: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

impl TryFrom<RawAgent> for Agent {
    type Error = RelayError;

    fn try_from(raw: RawAgent) -> Result<Self, Self::Error> {
        let status = raw
            .status
            .parse::<AgentStatus>()
            .map_err(|e| RelayError::Persistence(format!("corrupt agent row {}: {e}", raw.name)))?;
        Ok(Agent {
            name: raw.name,
            status,
            health: raw.health.clamp(0, 100) as u8,
            last_activity: raw.last_activity,
            updated_at: from_micros(raw.updated_at),
        })
    }
}

struct RawUnit {
    id: i64,
    content: String,
    status: String,
    scheduled_for: i64,
    posted_at: Option<i64>,
    thread_key: Option<String>,
    position: Option<i64>,
}

fn raw_unit(row: &Row<'_>) -> rusqlite::Result<RawUnit> {
    Ok(RawUnit {
        id: row.get(0)?,
        content: row.get(1)?,
        status: row.get(2)?,
        scheduled_for: row.get(3)?,
        posted_at: row.get(4)?,
        thread_key: row.get(5)?,
        position: row.get(6)?,
    })
}

impl TryFrom<RawUnit> for PostingUnit {
    type Error = RelayError;

    fn try_from(raw: RawUnit) -> Result<Self, Self::Error> {
        Ok(PostingUnit {
            id: raw.id,
            content: raw.content,
            status: raw.status.parse()?,
            scheduled_for: from_micros(raw.scheduled_for),
            posted_at: raw.posted_at.map(from_micros),
            thread_key: raw.thread_key,
            position: raw.position.map(|p| p.max(0) as u32),
        })
    }
}

fn collect_units(
    rows: impl Iterator<Item = rusqlite::Result<RawUnit>>,
) -> Result<Vec<PostingUnit>, RelayError> {
    let mut units = Vec::new();
    for row in rows {
        units.push(PostingUnit::try_from(row?)?);
    }
    Ok(units)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[async_trait]
impl StatusStore for SqliteStore {
    async fn ensure_registered(&self, names: &[&str]) -> RegistrationReport {
        let db = self.db.lock().await;
        let now = to_micros(Utc::now());
        let mut report = RegistrationReport::default();

        for name in names {
            let inserted = db.execute(
                "INSERT OR IGNORE INTO agent_status (agent_name, status, health, last_activity, updated_at)
                 VALUES (?1, 'stopped', 0, 'registered', ?2)",
                params![name, now],
            );
            match inserted {
                Ok(0) => report.already_existed.push(name.to_string()),
                Ok(_) => report.added.push(name.to_string()),
                Err(e) => report.errors.push((name.to_string(), e.to_string())),
            }
        }

        if !report.added.is_empty() {
            tracing::info!(added = ?report.added, "registered missing agent rows");
        }
        report
    }

    async fn set_status(&self, update: &StatusUpdate) -> Result<WriteOutcome, RelayError> {
        update.validate()?;
        let db = self.db.lock().await;
        let changed = db.execute(
            "INSERT INTO agent_status (agent_name, status, health, last_activity, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(agent_name) DO UPDATE SET
                status = excluded.status,
                health = excluded.health,
                last_activity = excluded.last_activity,
                updated_at = excluded.updated_at
             WHERE excluded.updated_at >= agent_status.updated_at",
            params![
                update.name,
                update.status.as_str(),
                update.health,
                update.activity,
                to_micros(update.at)
            ],
        )?;

        if changed == 0 {
            tracing::debug!(agent = %update.name, status = %update.status, "status write superseded by newer record");
            Ok(WriteOutcome::Superseded)
        } else {
            Ok(WriteOutcome::Applied)
        }
    }

    async fn get(&self, name: &str) -> Result<Agent, RelayError> {
        let db = self.db.lock().await;
        let raw = db
            .query_row(
                "SELECT agent_name, status, health, last_activity, updated_at
                 FROM agent_status WHERE agent_name = ?1",
                params![name],
                raw_agent,
            )
            .optional()?;
        match raw {
            Some(raw) => Agent::try_from(raw),
            None => Err(RelayError::NotFound(format!("agent '{name}'"))),
        }
    }

    async fn list(&self) -> Result<Vec<Agent>, RelayError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT agent_name, status, health, last_activity, updated_at
             FROM agent_status ORDER BY agent_name ASC",
        )?;
        let rows = stmt.query_map([], raw_agent)?;

        let mut agents = Vec::new();
        for row in rows {
            agents.push(Agent::try_from(row?)?);
        }
        Ok(agents)
    }
}

#[async_trait]
impl PostingStore for SqliteStore {
    async fn insert_unit(&self, unit: &NewUnit) -> Result<PostingUnit, RelayError> {
        let db = self.db.lock().await;
        // 线程只在全部成员仍为 scheduled 时接受新成员
        let inserted = db.execute(
            "INSERT INTO posting_units (content, status, scheduled_for, posted_at, thread_key, position)
             SELECT ?1, 'scheduled', ?2, NULL, ?3, ?4
             WHERE ?3 IS NULL OR NOT EXISTS (
                SELECT 1 FROM posting_units WHERE thread_key = ?3 AND status <> 'scheduled'
             )",
            params![
                unit.content,
                to_micros(unit.scheduled_for),
                unit.thread_key,
                unit.position
            ],
        )?;
        if inserted == 0 {
            return Err(RelayError::Validation(format!(
                "thread '{}' is no longer open for new members",
                unit.thread_key.as_deref().unwrap_or_default()
            )));
        }
        let id = db.last_insert_rowid();
        Ok(PostingUnit {
            id,
            content: unit.content.clone(),
            status: UnitStatus::Scheduled,
            scheduled_for: unit.scheduled_for,
            posted_at: None,
            thread_key: unit.thread_key.clone(),
            position: unit.position,
        })
    }

    async fn unit(&self, id: i64) -> Result<Option<PostingUnit>, RelayError> {
        let db = self.db.lock().await;
        let raw = db
            .query_row(
                &format!("SELECT {UNIT_COLUMNS} FROM posting_units WHERE id = ?1"),
                params![id],
                raw_unit,
            )
            .optional()?;
        raw.map(PostingUnit::try_from).transpose()
    }

    async fn thread_units(&self, thread_key: &str) -> Result<Vec<PostingUnit>, RelayError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {UNIT_COLUMNS} FROM posting_units WHERE thread_key = ?1 ORDER BY position ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![thread_key], raw_unit)?;
        collect_units(rows)
    }

    async fn due_units(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PostingUnit>, RelayError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {UNIT_COLUMNS} FROM posting_units
             WHERE status = 'scheduled' AND scheduled_for <= ?1
             ORDER BY scheduled_for ASC, position ASC, id ASC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![to_micros(now), limit as i64], raw_unit)?;
        collect_units(rows)
    }

    async fn transition_all(
        &self,
        ids: &[i64],
        from: &[UnitStatus],
        to: UnitStatus,
        posted_at: Option<DateTime<Utc>>,
    ) -> Result<bool, RelayError> {
        let ids: BTreeSet<i64> = ids.iter().copied().collect();
        if ids.is_empty() || from.is_empty() {
            return Err(RelayError::Validation("empty transition batch".into()));
        }

        let sql = format!(
            "UPDATE posting_units SET status = ?, posted_at = COALESCE(?, posted_at)
             WHERE id IN ({}) AND status IN ({})",
            placeholders(ids.len()),
            placeholders(from.len())
        );
        let mut values: Vec<Value> = vec![
            Value::Text(to.as_str().to_string()),
            posted_at.map(to_micros).map_or(Value::Null, Value::Integer),
        ];
        values.extend(ids.iter().map(|id| Value::Integer(*id)));
        values.extend(from.iter().map(|s| Value::Text(s.as_str().to_string())));

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let changed = tx.execute(&sql, params_from_iter(values))?;
        if changed != ids.len() {
            tx.rollback()?;
            tracing::debug!(expected = ids.len(), changed, to = %to, "batch transition rejected, nothing written");
            return Ok(false);
        }
        tx.commit()?;
        Ok(true)
    }

    async fn claim_thread(&self, thread_key: &str, ids: &[i64]) -> Result<bool, RelayError> {
        let expected: BTreeSet<i64> = ids.iter().copied().collect();
        if expected.is_empty() {
            return Err(RelayError::Validation("empty thread claim".into()));
        }

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let mut stmt = tx.prepare("SELECT id FROM posting_units WHERE thread_key = ?1")?;
        let members: BTreeSet<i64> = stmt
            .query_map(params![thread_key], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        if members != expected {
            tx.rollback()?;
            tracing::debug!(thread_key, "thread membership changed before claim");
            return Ok(false);
        }

        let changed = tx.execute(
            "UPDATE posting_units SET status = 'posting'
             WHERE thread_key = ?1 AND status = 'scheduled'",
            params![thread_key],
        )?;
        if changed != expected.len() {
            tx.rollback()?;
            tracing::debug!(thread_key, expected = expected.len(), changed, "thread claim rejected, nothing written");
            return Ok(false);
        }
        tx.commit()?;
        Ok(true)
    }

    async fn reschedule_scheduled(
        &self,
        filter: &UnitFilter,
        new_time: DateTime<Utc>,
    ) -> Result<usize, RelayError> {
        let db = self.db.lock().await;
        let changed = match filter {
            UnitFilter::Id(id) => db.execute(
                "UPDATE posting_units SET scheduled_for = ?1 WHERE id = ?2 AND status = 'scheduled'",
                params![to_micros(new_time), id],
            )?,
            UnitFilter::Thread(key) => db.execute(
                "UPDATE posting_units SET scheduled_for = ?1 WHERE thread_key = ?2 AND status = 'scheduled'",
                params![to_micros(new_time), key],
            )?,
        };
        Ok(changed)
    }

    async fn delete_scheduled(&self, filter: &UnitFilter) -> Result<usize, RelayError> {
        let db = self.db.lock().await;
        let changed = match filter {
            UnitFilter::Id(id) => db.execute(
                "DELETE FROM posting_units WHERE id = ?1 AND status = 'scheduled'",
                params![id],
            )?,
            UnitFilter::Thread(key) => db.execute(
                "DELETE FROM posting_units WHERE thread_key = ?1 AND status = 'scheduled'",
                params![key],
            )?,
        };
        Ok(changed)
    }
}
