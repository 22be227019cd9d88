//! 外部进程抽象：启动、等待、强制终止
//!
//! `ProcessLauncher` 是 Supervisor 与发帖状态机共用的进程工厂；生产环境用 `CommandLauncher`
//! （tokio::process，kill_on_drop 保证 future 被丢弃时子进程也会被杀掉），测试注入假实现统计 spawn 次数。

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::core::RelayError;

/// 一次进程启动的描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// 日志与错误中使用的目标名（Agent 名或 "unit 12" / "thread blog-7"）
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchSpec {
    pub fn new(label: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// 进程退出结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    /// None 表示被信号终止
    pub code: Option<i32>,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// 已启动的子进程
#[async_trait]
pub trait ChildProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// 等待进程退出
    async fn wait(&mut self) -> Result<ExitReport, RelayError>;

    /// 强制终止并回收；进程已退出时视为成功
    async fn kill(&mut self) -> Result<(), RelayError>;
}

/// 进程工厂
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ChildProcess>, RelayError>;
}

/// 基于 tokio::process 的真实进程工厂
#[derive(Debug, Default, Clone)]
pub struct CommandLauncher;

impl CommandLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessLauncher for CommandLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ChildProcess>, RelayError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| RelayError::ProcessSpawn {
            target: spec.label.clone(),
            reason: e.to_string(),
        })?;
        tracing::info!(target_name = %spec.label, pid = ?child.id(), program = %spec.program, "process spawned");

        Ok(Box::new(TokioChild {
            label: spec.label.clone(),
            child,
        }))
    }
}

struct TokioChild {
    label: String,
    child: Child,
}

#[async_trait]
impl ChildProcess for TokioChild {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<ExitReport, RelayError> {
        let status = self.child.wait().await.map_err(|e| {
            tracing::warn!(target_name = %self.label, "wait failed: {}", e);
            RelayError::ProcessExit {
                target: self.label.clone(),
                code: None,
            }
        })?;
        Ok(ExitReport {
            code: status.code(),
        })
    }

    async fn kill(&mut self) -> Result<(), RelayError> {
        if let Err(e) = self.child.kill().await {
            // 已退出的进程无法再 kill，tokio 返回 InvalidInput
            if e.kind() != std::io::ErrorKind::InvalidInput {
                return Err(RelayError::ProcessExit {
                    target: self.label.clone(),
                    code: None,
                });
            }
            tracing::debug!(target_name = %self.label, "kill on exited process: {}", e);
        }
        Ok(())
    }
}

/// 在截止时间内等待进程；超时则强制终止并返回 ProcessTimeout，非零退出返回 ProcessExit
pub async fn wait_with_deadline(
    mut child: Box<dyn ChildProcess>,
    deadline: Duration,
    target: &str,
) -> Result<ExitReport, RelayError> {
    let waited = tokio::time::timeout(deadline, child.wait()).await;
    match waited {
        Ok(Ok(exit)) if exit.success() => Ok(exit),
        Ok(Ok(exit)) => Err(RelayError::ProcessExit {
            target: target.to_string(),
            code: exit.code,
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            tracing::warn!(target_name = %target, deadline_secs = deadline.as_secs(), "deadline exceeded, killing process");
            if let Err(e) = child.kill().await {
                tracing::error!(target_name = %target, "failed to kill timed out process: {}", e);
            }
            Err(RelayError::ProcessTimeout {
                target: target.to_string(),
                secs: deadline.as_secs(),
            })
        }
    }
}
