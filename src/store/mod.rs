//! 持久化层：Agent 状态表与发帖单元表
//!
//! 核心只通过 `StatusStore` / `PostingStore` 两个 trait 访问存储；批量迁移必须由存储以单条语句或单事务完成，
//! 读者永远看不到半批状态。默认实现为 SQLite（`SqliteStore`）。

mod sqlite;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::RelayError;

pub use sqlite::SqliteStore;

/// Agent 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Stopped,
    Running,
    Warning,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Stopped => "stopped",
            AgentStatus::Running => "running",
            AgentStatus::Warning => "warning",
            AgentStatus::Error => "error",
        }
    }
}

impl FromStr for AgentStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(AgentStatus::Stopped),
            "running" => Ok(AgentStatus::Running),
            "warning" => Ok(AgentStatus::Warning),
            "error" => Ok(AgentStatus::Error),
            other => Err(RelayError::Validation(format!(
                "invalid status '{other}', must be one of: running, warning, error, stopped"
            ))),
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent 状态记录（每个注册名恰好一行）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Agent {
    pub name: String,
    pub status: AgentStatus,
    pub health: u8,
    pub last_activity: String,
    pub updated_at: DateTime<Utc>,
}

/// 一次状态写入；`at` 为事件发生时刻，存储按它做 last-writer-wins
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub name: String,
    pub status: AgentStatus,
    pub health: u8,
    pub activity: String,
    pub at: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn new(
        name: impl Into<String>,
        status: AgentStatus,
        health: u8,
        activity: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            status,
            health,
            activity: activity.into(),
            at: Utc::now(),
        }
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.name.trim().is_empty() {
            return Err(RelayError::Validation("agent name is empty".into()));
        }
        if self.health > 100 {
            return Err(RelayError::Validation(format!(
                "invalid health {}, must be between 0 and 100",
                self.health
            )));
        }
        Ok(())
    }
}

/// 条件写入的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Applied,
    /// 已存在更新时间更晚的记录，本次写入被忽略
    Superseded,
}

/// ensure_registered 的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrationReport {
    pub added: Vec<String>,
    pub already_existed: Vec<String>,
    pub errors: Vec<(String, String)>,
}

/// Agent 状态存储
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// 幂等补齐：不存在的名字插入 stopped/0，已存在的绝不覆盖
    async fn ensure_registered(&self, names: &[&str]) -> RegistrationReport;

    /// 按时间戳条件写入：比已存储记录更旧的写入返回 Superseded
    async fn set_status(&self, update: &StatusUpdate) -> Result<WriteOutcome, RelayError>;

    async fn get(&self, name: &str) -> Result<Agent, RelayError>;

    async fn list(&self) -> Result<Vec<Agent>, RelayError>;
}

/// 发帖单元状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Scheduled,
    Posting,
    Posted,
    Failed,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Scheduled => "scheduled",
            UnitStatus::Posting => "posting",
            UnitStatus::Posted => "posted",
            UnitStatus::Failed => "failed",
        }
    }
}

impl FromStr for UnitStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(UnitStatus::Scheduled),
            "posting" => Ok(UnitStatus::Posting),
            "posted" => Ok(UnitStatus::Posted),
            "failed" => Ok(UnitStatus::Failed),
            other => Err(RelayError::Persistence(format!("unknown unit status '{other}'"))),
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单条帖子或线程中的一条
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostingUnit {
    pub id: i64,
    pub content: String,
    pub status: UnitStatus,
    pub scheduled_for: DateTime<Utc>,
    pub posted_at: Option<DateTime<Utc>>,
    pub thread_key: Option<String>,
    pub position: Option<u32>,
}

/// 待插入的单元（状态固定为 scheduled）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUnit {
    pub content: String,
    pub scheduled_for: DateTime<Utc>,
    pub thread_key: Option<String>,
    pub position: Option<u32>,
}

/// 过滤目标：单个单元或整个线程
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitFilter {
    Id(i64),
    Thread(String),
}

impl fmt::Display for UnitFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitFilter::Id(id) => write!(f, "unit {id}"),
            UnitFilter::Thread(key) => write!(f, "thread {key}"),
        }
    }
}

/// 发帖单元存储
#[async_trait]
pub trait PostingStore: Send + Sync {
    async fn insert_unit(&self, unit: &NewUnit) -> Result<PostingUnit, RelayError>;

    async fn unit(&self, id: i64) -> Result<Option<PostingUnit>, RelayError>;

    /// 按 position 升序返回线程全部成员
    async fn thread_units(&self, thread_key: &str) -> Result<Vec<PostingUnit>, RelayError>;

    /// scheduled 且 scheduled_for <= now 的单元，按时间、position 排序
    async fn due_units(&self, now: DateTime<Utc>, limit: usize)
        -> Result<Vec<PostingUnit>, RelayError>;

    /// 全有或全无的批量迁移：仅当每个 id 当前状态都在 `from` 中时整体提交并返回 true；
    /// 否则不修改任何行并返回 false
    async fn transition_all(
        &self,
        ids: &[i64],
        from: &[UnitStatus],
        to: UnitStatus,
        posted_at: Option<DateTime<Utc>>,
    ) -> Result<bool, RelayError>;

    /// 线程整体 claim 为 posting：同一事务内确认成员集合恰为 `ids` 且全部 scheduled，
    /// 否则不修改任何行并返回 false
    async fn claim_thread(&self, thread_key: &str, ids: &[i64]) -> Result<bool, RelayError>;

    /// 单条语句改期：只作用于 status = scheduled 的行，返回受影响行数
    async fn reschedule_scheduled(
        &self,
        filter: &UnitFilter,
        new_time: DateTime<Utc>,
    ) -> Result<usize, RelayError>;

    /// 单条语句删除：只作用于 status = scheduled 的行，返回受影响行数
    async fn delete_scheduled(&self, filter: &UnitFilter) -> Result<usize, RelayError>;
}
