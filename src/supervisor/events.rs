//! Supervisor 对外结果与事件

use serde::{Deserialize, Serialize};

use crate::core::{Failure, RelayError};
use crate::store::{AgentStatus, StatusUpdate};

/// start 的三值结果（spawn 失败等走 Err）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    Started { pid: Option<u32> },
    Rejected { reason: RejectReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    AtCapacity,
    AlreadyRunning,
}

impl StartOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, StartOutcome::Started { .. })
    }
}

/// start_all 的汇总；queued 的后续结果通过事件通道通知
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartAllReport {
    pub started: Vec<String>,
    pub already_running: Vec<String>,
    pub queued: Vec<String>,
    pub failed: Vec<StartFailure>,
}

impl StartAllReport {
    pub fn is_partial_failure(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn failed_names(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.agent.as_str()).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StartFailure {
    pub agent: String,
    pub failure: Failure,
}

/// 进程结束时的归因
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitOutcome {
    /// 正常退出且未自报，已写 stopped
    Completed,
    /// 正常退出，保留 Agent 自己最后一次上报的状态
    SelfReported { status: AgentStatus },
    /// 非零退出（含重启后再次失败）
    Failed { code: Option<i32> },
    RestartFailed { reason: String },
    /// 运维 stop
    Stopped,
}

/// 广播给订阅者的生命周期事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SupervisorEvent {
    Started { agent: String, pid: Option<u32> },
    Restarting { agent: String, previous_code: Option<i32> },
    Exited { agent: String, outcome: ExitOutcome },
    QueuedStartFailed { agent: String, reason: String },
    /// 排队期间已被其他调用启动，本次跳过
    QueuedSkipped { agent: String, failure: Failure },
}

impl SupervisorEvent {
    pub fn agent(&self) -> &str {
        match self {
            SupervisorEvent::Started { agent, .. }
            | SupervisorEvent::Restarting { agent, .. }
            | SupervisorEvent::Exited { agent, .. }
            | SupervisorEvent::QueuedStartFailed { agent, .. }
            | SupervisorEvent::QueuedSkipped { agent, .. } => agent,
        }
    }
}

/// 运维强制写状态的请求体；未知字段直接拒绝
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForceStatusRequest {
    pub agent: String,
    pub status: String,
    pub health: i64,
    #[serde(default)]
    pub activity: Option<String>,
}

impl ForceStatusRequest {
    pub fn new(
        agent: impl Into<String>,
        status: impl Into<String>,
        health: i64,
        activity: impl Into<String>,
    ) -> Self {
        Self {
            agent: agent.into(),
            status: status.into(),
            health,
            activity: Some(activity.into()),
        }
    }

    /// 校验并转为带当前时间戳的写入
    pub fn into_update(self) -> Result<StatusUpdate, RelayError> {
        let status = self.status.parse::<AgentStatus>()?;
        if !(0..=100).contains(&self.health) {
            return Err(RelayError::Validation(format!(
                "invalid health {}, must be between 0 and 100",
                self.health
            )));
        }
        let activity = self
            .activity
            .unwrap_or_else(|| "Status manually fixed".to_string());
        let update = StatusUpdate::new(self.agent, status, self.health as u8, activity);
        update.validate()?;
        Ok(update)
    }
}
