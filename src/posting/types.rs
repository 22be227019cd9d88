//! 发帖请求与结果类型

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{ErrorKind, RelayError};
use crate::store::UnitStatus;

/// 单条内容或按顺序排列的线程内容
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ScheduleContent {
    Single(String),
    Thread(Vec<String>),
}

impl ScheduleContent {
    pub fn parts(&self) -> Vec<&str> {
        match self {
            ScheduleContent::Single(text) => vec![text.as_str()],
            ScheduleContent::Thread(parts) => parts.iter().map(String::as_str).collect(),
        }
    }
}

/// 排期请求
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleRequest {
    pub content: ScheduleContent,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub thread_key: Option<String>,
    /// 线程起始位置，缺省为 1
    #[serde(default)]
    pub position: Option<u32>,
}

impl ScheduleRequest {
    pub fn single(content: impl Into<String>, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            content: ScheduleContent::Single(content.into()),
            scheduled_for: Some(scheduled_for),
            thread_key: None,
            position: None,
        }
    }

    pub fn thread<I, S>(thread_key: impl Into<String>, parts: I, scheduled_for: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            content: ScheduleContent::Thread(parts.into_iter().map(Into::into).collect()),
            scheduled_for: Some(scheduled_for),
            thread_key: Some(thread_key.into()),
            position: None,
        }
    }

    /// 输入校验，不访问存储
    pub(crate) fn validate(&self) -> Result<DateTime<Utc>, RelayError> {
        let parts = self.content.parts();
        if parts.is_empty() {
            return Err(RelayError::Validation("content is empty".into()));
        }
        let empty: Vec<usize> = parts
            .iter()
            .enumerate()
            .filter(|(_, p)| p.trim().is_empty())
            .map(|(i, _)| i + 1)
            .collect();
        if !empty.is_empty() {
            return Err(RelayError::Validation(format!(
                "content is empty at parts {empty:?}"
            )));
        }
        // 存储精度为微秒，截断后返回给调用方的时间与落库值一致
        let scheduled_for = self
            .scheduled_for
            .ok_or_else(|| RelayError::Validation("scheduled_for is required".into()))?
            .trunc_subsecs(6);
        if let Some(key) = &self.thread_key {
            if key.trim().is_empty() {
                return Err(RelayError::Validation("thread_key is empty".into()));
            }
        }
        if parts.len() > 1 && self.thread_key.is_none() {
            return Err(RelayError::Validation(
                "thread content requires a thread_key".into(),
            ));
        }
        if self.position == Some(0) {
            return Err(RelayError::Validation("position starts at 1".into()));
        }
        Ok(scheduled_for)
    }
}

/// 线程发布请求：调用方给出它认为的成员集合，需与存储一致
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostThreadRequest {
    pub thread_key: String,
    pub member_ids: Vec<i64>,
}

impl PostThreadRequest {
    pub fn new(thread_key: impl Into<String>, member_ids: Vec<i64>) -> Self {
        Self {
            thread_key: thread_key.into(),
            member_ids,
        }
    }
}

/// 一次发布的结果；失败时所有成员处于同一状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PostOutcome {
    Posted {
        unit_ids: Vec<i64>,
        posted_at: DateTime<Utc>,
    },
    Failed {
        unit_ids: Vec<i64>,
        kind: ErrorKind,
        detail: String,
        rolled_back_to: UnitStatus,
    },
}

impl PostOutcome {
    pub fn is_posted(&self) -> bool {
        matches!(self, PostOutcome::Posted { .. })
    }

    pub fn unit_ids(&self) -> &[i64] {
        match self {
            PostOutcome::Posted { unit_ids, .. } | PostOutcome::Failed { unit_ids, .. } => unit_ids,
        }
    }
}
