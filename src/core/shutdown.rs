//! 优雅关闭
//!
//! 统一监听 Ctrl+C / SIGTERM，然后按注册顺序执行清理：
//! - 终止所有受监管的 Agent 进程，状态写回 stopped
//! - 关闭并发闸门，排队中的 start_all 放弃启动

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::supervisor::Supervisor;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// 主循环正常结束
    Finished,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Interrupt => f.write_str("interrupt"),
            ShutdownReason::Terminate => f.write_str("terminate"),
            ShutdownReason::Finished => f.write_str("finished"),
        }
    }
}

/// 关闭信号：一个 token 加上第一次触发时的原因
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 子任务用来感知关闭
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；重复触发只保留第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        if let Ok(mut slot) = self.reason.lock() {
            if slot.is_none() {
                tracing::info!(%reason, "shutdown triggered");
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().ok().and_then(|slot| slot.clone())
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装 Ctrl+C 与 SIGTERM 处理
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, stopping agents...");
                manager.shutdown(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let manager = self.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, stopping agents...");
                    manager.shutdown(ShutdownReason::Terminate);
                }
            });
        }
    }
}

/// 关闭时执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 日志中的名字
    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理，每个任务有独立超时
pub struct ShutdownCoordinator {
    manager: ShutdownManager,
    tasks: Vec<Box<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: ShutdownManager) -> Self {
        Self {
            manager,
            tasks: Vec::new(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.tasks.push(Box::new(task));
    }

    pub fn manager(&self) -> &ShutdownManager {
        &self.manager
    }

    /// 执行全部清理，返回失败或超时的任务名
    pub async fn run_cleanup(&self) -> Vec<&'static str> {
        tracing::info!(tasks = self.tasks.len(), "running shutdown cleanup");
        let mut failed = Vec::new();
        for task in &self.tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::info!(task = name, "cleanup completed"),
                Ok(Err(e)) => {
                    tracing::warn!(task = name, "cleanup failed: {}", e);
                    failed.push(name);
                }
                Err(_) => {
                    tracing::warn!(task = name, timeout_secs = self.timeout.as_secs(), "cleanup timed out");
                    failed.push(name);
                }
            }
        }
        failed
    }
}

/// 关机时停止所有受监管的 Agent
pub struct SupervisorCleanup {
    supervisor: Supervisor,
    grace: Duration,
}

impl SupervisorCleanup {
    pub fn new(supervisor: Supervisor, grace: Duration) -> Self {
        Self { supervisor, grace }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for SupervisorCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let remaining = self.supervisor.stop_all(self.grace).await;
        if remaining > 0 {
            anyhow::bail!("{} agent processes did not exit within {:?}", remaining, self.grace);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "supervisor"
    }
}

/// 运行 app 直到它结束或收到关闭信号，随后执行清理；返回关闭原因
pub async fn run_until_shutdown<F>(coordinator: &ShutdownCoordinator, app: F) -> ShutdownReason
where
    F: Future<Output = ()>,
{
    let manager = coordinator.manager().clone();
    tokio::select! {
        _ = app => manager.shutdown(ShutdownReason::Finished),
        _ = manager.wait_for_shutdown() => {}
    }
    let failed = coordinator.run_cleanup().await;
    if !failed.is_empty() {
        tracing::error!(tasks = ?failed, "some cleanup tasks failed");
    }
    manager.reason().unwrap_or(ShutdownReason::Finished)
}
