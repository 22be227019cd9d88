//! 错误分类与结构化失败结果
//!
//! 所有对外操作返回 `Result<_, RelayError>`；`RelayError::kind()` 给出可序列化的机器可读类别，
//! 供 Dashboard 层按类别展示，不把底层异常直接抛给调用方。

use serde::Serialize;
use thiserror::Error;

/// 机器可读的错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Capacity,
    AlreadyRunning,
    NotFound,
    ProcessSpawn,
    ProcessExit,
    ProcessTimeout,
    Persistence,
    PartialBatch,
    Config,
}

/// 核心层统一错误
#[derive(Error, Debug)]
pub enum RelayError {
    /// 调用方输入错误（缺字段、health 越界、删除已发布内容、线程成员不匹配等）
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Capacity reached: {running}/{ceiling} agents running")]
    Capacity { running: usize, ceiling: usize },

    #[error("Agent already running: {0}")]
    AlreadyRunning(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// 可执行文件不存在、无权限等启动失败
    #[error("Failed to spawn process for {target}: {reason}")]
    ProcessSpawn { target: String, reason: String },

    /// 非零退出；code 为 None 表示被信号终止
    #[error("Process for {target} exited with code {code:?}")]
    ProcessExit { target: String, code: Option<i32> },

    /// 超过截止时间，进程已被强制终止
    #[error("Process for {target} exceeded {secs}s deadline and was killed")]
    ProcessTimeout { target: String, secs: u64 },

    #[error("Persistence error: {0}")]
    Persistence(String),

    /// 批量操作部分成功：succeeded 为已写入的 id，failed_positions 为失败成员的位置
    #[error("Partial batch failure: positions {failed_positions:?} failed ({reason})")]
    PartialBatch {
        succeeded: Vec<i64>,
        failed_positions: Vec<u32>,
        reason: String,
    },

    #[error("Config error: {0}")]
    Config(String),
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Validation(_) => ErrorKind::Validation,
            RelayError::Capacity { .. } => ErrorKind::Capacity,
            RelayError::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            RelayError::NotFound(_) => ErrorKind::NotFound,
            RelayError::ProcessSpawn { .. } => ErrorKind::ProcessSpawn,
            RelayError::ProcessExit { .. } => ErrorKind::ProcessExit,
            RelayError::ProcessTimeout { .. } => ErrorKind::ProcessTimeout,
            RelayError::Persistence(_) => ErrorKind::Persistence,
            RelayError::PartialBatch { .. } => ErrorKind::PartialBatch,
            RelayError::Config(_) => ErrorKind::Config,
        }
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(e: rusqlite::Error) -> Self {
        RelayError::Persistence(e.to_string())
    }
}

impl From<config::ConfigError> for RelayError {
    fn from(e: config::ConfigError) -> Self {
        RelayError::Config(e.to_string())
    }
}

/// 结构化失败：类别 + 可读详情
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub detail: String,
}

impl From<&RelayError> for Failure {
    fn from(e: &RelayError) -> Self {
        Self {
            kind: e.kind(),
            detail: e.to_string(),
        }
    }
}
