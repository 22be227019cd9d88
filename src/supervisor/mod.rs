//! Agent 进程监管
//!
//! 每个 Agent 一个 OS 进程，由一个后台监控任务负责等待退出、归因写状态，并在出错时最多自动重启一次。
//! 同时运行的进程数受 `CapacityGate` 限制：`start` 非阻塞拒绝，`start_all` 排队等待。
//! 所有状态写入都带事件时间戳，交给存储做 last-writer-wins。

pub mod events;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, MutexGuard, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agents::AgentRegistry;
use crate::config::SupervisorSection;
use crate::core::{CapacityGate, ChildProcess, Failure, LaunchSpec, ProcessLauncher, RelayError};
use crate::store::{
    AgentStatus, RegistrationReport, StatusStore, StatusUpdate, WriteOutcome,
};

pub use events::{
    ExitOutcome, ForceStatusRequest, RejectReason, StartAllReport, StartFailure, StartOutcome,
    SupervisorEvent,
};

const STARTED_ACTIVITY: &str = "started";
const RESTARTED_ACTIVITY: &str = "restarted after error";
const STOPPED_BY_OPERATOR: &str = "stopped by operator";
const ORPHAN_ACTIVITY: &str = "Automatically stopped (reason: process not running)";
/// 错误退出后的健康度
const ERROR_HEALTH: u8 = 30;
const EVENT_CAPACITY: usize = 128;

/// Supervisor 运行参数
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub max_concurrent_agents: usize,
    pub auto_restart: bool,
    pub restart_delay: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self::from(&SupervisorSection::default())
    }
}

impl From<&SupervisorSection> for SupervisorOptions {
    fn from(cfg: &SupervisorSection) -> Self {
        Self {
            max_concurrent_agents: cfg.max_concurrent_agents,
            auto_restart: cfg.enable_auto_restart,
            restart_delay: Duration::from_millis(cfg.restart_delay_ms),
        }
    }
}

/// 正在监管的进程快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningInfo {
    pub agent: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

struct RunningAgent {
    /// 区分同名 Agent 的前后两次启动，防止旧监控任务清掉新条目
    generation: u64,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

type RunningMap = HashMap<String, RunningAgent>;

struct Inner {
    store: Arc<dyn StatusStore>,
    launcher: Arc<dyn ProcessLauncher>,
    registry: AgentRegistry,
    gate: CapacityGate,
    options: SupervisorOptions,
    running: Mutex<RunningMap>,
    next_generation: AtomicU64,
    events: broadcast::Sender<SupervisorEvent>,
}

/// Agent 进程监管者（可廉价 Clone，内部共享）
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn StatusStore>,
        launcher: Arc<dyn ProcessLauncher>,
        registry: AgentRegistry,
        options: SupervisorOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store,
                launcher,
                registry,
                gate: CapacityGate::new(options.max_concurrent_agents),
                options,
                running: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                events,
            }),
        }
    }

    /// 默认注册表 + 配置中的并发与重启参数
    pub fn from_config(
        cfg: &SupervisorSection,
        store: Arc<dyn StatusStore>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self::new(
            store,
            launcher,
            AgentRegistry::from_config(cfg),
            SupervisorOptions::from(cfg),
        )
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.inner.registry
    }

    pub fn ceiling(&self) -> usize {
        self.inner.gate.ceiling()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    /// 为注册表中每个 Agent 补齐状态行
    pub async fn reconcile_registry(&self) -> RegistrationReport {
        let names = self.inner.registry.names();
        let report = self.inner.store.ensure_registered(&names).await;
        if !report.added.is_empty() {
            tracing::info!(added = ?report.added, "registered missing agents");
        }
        for (name, err) in &report.errors {
            tracing::error!(agent = %name, "registration failed: {}", err);
        }
        report
    }

    /// 启动单个 Agent；满员或已在运行时拒绝且不 spawn
    pub async fn start(&self, name: &str) -> Result<StartOutcome, RelayError> {
        let spec = self.launch_spec(name)?;
        let guard = self.inner.running.lock().await;
        if guard.contains_key(name) {
            tracing::info!(agent = %name, "start rejected: already running");
            return Ok(StartOutcome::Rejected {
                reason: RejectReason::AlreadyRunning,
            });
        }
        let permit = match self.inner.gate.try_acquire() {
            Ok(permit) => permit,
            Err(e) => {
                tracing::info!(agent = %name, "start rejected: {}", e);
                return Ok(StartOutcome::Rejected {
                    reason: RejectReason::AtCapacity,
                });
            }
        };
        let pid = self.spawn_supervised(guard, name, &spec, permit).await?;
        Ok(StartOutcome::Started { pid })
    }

    /// 按注册顺序启动全部 Agent；超出上限的进入后台队列，有槽位时依次启动
    pub async fn start_all(&self) -> StartAllReport {
        let mut report = StartAllReport::default();
        let names: Vec<String> = self
            .inner
            .registry
            .names()
            .into_iter()
            .map(String::from)
            .collect();

        for name in names {
            // 一旦开始排队，后面的 Agent 也排队，保持注册顺序
            if !report.queued.is_empty() {
                if self.is_running(&name).await {
                    report.already_running.push(name);
                } else {
                    report.queued.push(name);
                }
                continue;
            }
            match self.start(&name).await {
                Ok(StartOutcome::Started { .. }) => report.started.push(name),
                Ok(StartOutcome::Rejected {
                    reason: RejectReason::AlreadyRunning,
                }) => report.already_running.push(name),
                Ok(StartOutcome::Rejected {
                    reason: RejectReason::AtCapacity,
                }) => report.queued.push(name),
                Err(e) => report.failed.push(StartFailure {
                    failure: Failure::from(&e),
                    agent: name,
                }),
            }
        }

        if !report.queued.is_empty() {
            let this = self.clone();
            let queue = report.queued.clone();
            tokio::spawn(async move { this.drain_queue(queue).await });
        }

        tracing::info!(
            started = report.started.len(),
            already_running = report.already_running.len(),
            queued = report.queued.len(),
            failed = report.failed.len(),
            "start_all dispatched"
        );
        report
    }

    /// 停止单个 Agent，返回时监控任务已完成状态写入
    pub async fn stop(&self, name: &str) -> Result<(), RelayError> {
        let task = {
            let mut running = self.inner.running.lock().await;
            let entry = running
                .get_mut(name)
                .ok_or_else(|| RelayError::NotFound(format!("agent '{name}' is not running")))?;
            entry.stop.cancel();
            entry.task.take()
        };
        tracing::info!(agent = %name, "stop requested");
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(agent = %name, "monitor task failed: {}", e);
            }
        }
        Ok(())
    }

    /// 关机：关闭闸门、停止全部进程，在 grace 内等待监控任务收尾；返回未按时结束的数量
    pub async fn stop_all(&self, grace: Duration) -> usize {
        self.inner.gate.close();
        let tasks: Vec<(String, JoinHandle<()>)> = {
            let mut running = self.inner.running.lock().await;
            running
                .iter_mut()
                .filter_map(|(name, entry)| {
                    entry.stop.cancel();
                    entry.task.take().map(|task| (name.clone(), task))
                })
                .collect()
        };
        tracing::info!(count = tasks.len(), "stopping all agents");

        let deadline = tokio::time::Instant::now() + grace;
        let mut remaining = 0;
        for (name, task) in tasks {
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                tracing::warn!(agent = %name, "agent did not stop within grace period");
                remaining += 1;
            }
        }
        remaining
    }

    /// 运维带外写状态；与退出处理的写入按时间戳竞争
    pub async fn force_status(
        &self,
        request: ForceStatusRequest,
    ) -> Result<WriteOutcome, RelayError> {
        if !self.inner.registry.contains(&request.agent) {
            return Err(RelayError::Validation(format!(
                "unknown agent '{}'",
                request.agent
            )));
        }
        let update = request.into_update()?;
        let outcome = self.inner.store.set_status(&update).await?;
        tracing::info!(
            agent = %update.name,
            status = %update.status,
            health = update.health,
            ?outcome,
            "status forced"
        );
        Ok(outcome)
    }

    /// 存储中标记为 running 但并未被监管的 Agent 改写为 stopped，返回被修正的名字
    pub async fn reconcile_orphans(&self) -> Result<Vec<String>, RelayError> {
        // 持锁期间不会有新的启动写入
        let running = self.inner.running.lock().await;
        let mut fixed = Vec::new();
        for agent in self.inner.store.list().await? {
            if agent.status != AgentStatus::Running || running.contains_key(&agent.name) {
                continue;
            }
            let update = StatusUpdate::new(&agent.name, AgentStatus::Stopped, 0, ORPHAN_ACTIVITY);
            if self.inner.store.set_status(&update).await? == WriteOutcome::Applied {
                tracing::warn!(agent = %agent.name, "orphaned running status reset to stopped");
                fixed.push(agent.name);
            }
        }
        Ok(fixed)
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.inner.running.lock().await.contains_key(name)
    }

    /// 当前监管中的进程，按名字排序
    pub async fn running(&self) -> Vec<RunningInfo> {
        let running = self.inner.running.lock().await;
        let mut list: Vec<RunningInfo> = running
            .iter()
            .map(|(name, entry)| RunningInfo {
                agent: name.clone(),
                pid: entry.pid,
                started_at: entry.started_at,
            })
            .collect();
        list.sort_by(|a, b| a.agent.cmp(&b.agent));
        list
    }

    fn launch_spec(&self, name: &str) -> Result<LaunchSpec, RelayError> {
        self.inner
            .registry
            .launch_spec(name)
            .ok_or_else(|| RelayError::Validation(format!("unknown agent '{name}'")))
    }

    /// 持有 running 锁与槽位时 spawn 并登记监控任务
    async fn spawn_supervised(
        &self,
        mut guard: MutexGuard<'_, RunningMap>,
        name: &str,
        spec: &LaunchSpec,
        permit: OwnedSemaphorePermit,
    ) -> Result<Option<u32>, RelayError> {
        let started_at = Utc::now();
        let child = match self.inner.launcher.launch(spec) {
            Ok(child) => child,
            Err(e) => {
                drop(guard);
                drop(permit);
                tracing::error!(agent = %name, "spawn failed: {}", e);
                self.record(StatusUpdate::new(
                    name,
                    AgentStatus::Error,
                    0,
                    format!("spawn failed: {e}"),
                ))
                .await;
                return Err(e);
            }
        };

        let pid = child.pid();
        self.record(
            StatusUpdate::new(name, AgentStatus::Running, 100, STARTED_ACTIVITY).at(started_at),
        )
        .await;

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let stop = CancellationToken::new();
        let task = tokio::spawn(self.clone().monitor(
            name.to_string(),
            generation,
            child,
            started_at,
            stop.clone(),
            permit,
        ));
        guard.insert(
            name.to_string(),
            RunningAgent {
                generation,
                pid,
                started_at,
                stop,
                task: Some(task),
            },
        );
        tracing::info!(agent = %name, pid = ?pid, "agent started");
        self.emit(SupervisorEvent::Started {
            agent: name.to_string(),
            pid,
        });
        Ok(pid)
    }

    async fn drain_queue(self, queue: Vec<String>) {
        for name in queue {
            let permit = match self.inner.gate.acquire().await {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::warn!(agent = %name, "queued start abandoned: {}", e);
                    self.emit(SupervisorEvent::QueuedStartFailed {
                        agent: name,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            let spec = match self.launch_spec(&name) {
                Ok(spec) => spec,
                Err(e) => {
                    self.emit(SupervisorEvent::QueuedStartFailed {
                        agent: name,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            let guard = self.inner.running.lock().await;
            if guard.contains_key(&name) {
                drop(guard);
                tracing::info!(agent = %name, "queued agent already running, skipped");
                let failure = Failure::from(&RelayError::AlreadyRunning(name.clone()));
                self.emit(SupervisorEvent::QueuedSkipped {
                    agent: name,
                    failure,
                });
                continue;
            }
            if let Err(e) = self.spawn_supervised(guard, &name, &spec, permit).await {
                self.emit(SupervisorEvent::QueuedStartFailed {
                    agent: name,
                    reason: e.to_string(),
                });
            }
        }
    }

    /// 监控任务：等待退出并归因，必要时重启一次；结束时释放条目与槽位
    async fn monitor(
        self,
        name: String,
        generation: u64,
        mut child: Box<dyn ChildProcess>,
        mut started_at: DateTime<Utc>,
        stop: CancellationToken,
        permit: OwnedSemaphorePermit,
    ) {
        let mut restarts_left: u32 = if self.inner.options.auto_restart { 1 } else { 0 };

        let outcome = loop {
            let exit = tokio::select! {
                exit = child.wait() => exit,
                _ = stop.cancelled() => {
                    if let Err(e) = child.kill().await {
                        tracing::error!(agent = %name, "kill failed: {}", e);
                    }
                    self.record(StatusUpdate::new(&name, AgentStatus::Stopped, 0, STOPPED_BY_OPERATOR))
                        .await;
                    break ExitOutcome::Stopped;
                }
            };

            let code = match exit {
                Ok(report) if report.success() => {
                    break self.settle_clean_exit(&name, started_at).await;
                }
                Ok(report) => report.code,
                Err(e) => {
                    tracing::warn!(agent = %name, "wait failed: {}", e);
                    None
                }
            };

            tracing::warn!(agent = %name, code = ?code, "agent exited with error");
            self.record(StatusUpdate::new(
                &name,
                AgentStatus::Error,
                ERROR_HEALTH,
                exit_activity(code),
            ))
            .await;

            if restarts_left == 0 {
                break ExitOutcome::Failed { code };
            }
            restarts_left -= 1;
            self.emit(SupervisorEvent::Restarting {
                agent: name.clone(),
                previous_code: code,
            });

            tokio::select! {
                _ = tokio::time::sleep(self.inner.options.restart_delay) => {}
                _ = stop.cancelled() => {
                    self.record(StatusUpdate::new(&name, AgentStatus::Stopped, 0, STOPPED_BY_OPERATOR))
                        .await;
                    break ExitOutcome::Stopped;
                }
            }

            let relaunched = self
                .launch_spec(&name)
                .and_then(|spec| self.inner.launcher.launch(&spec));
            match relaunched {
                Ok(next) => {
                    child = next;
                    started_at = Utc::now();
                    let pid = child.pid();
                    self.update_entry(&name, generation, pid, started_at).await;
                    self.record(
                        StatusUpdate::new(&name, AgentStatus::Running, 100, RESTARTED_ACTIVITY)
                            .at(started_at),
                    )
                    .await;
                    tracing::info!(agent = %name, pid = ?pid, "agent restarted");
                    self.emit(SupervisorEvent::Started {
                        agent: name.clone(),
                        pid,
                    });
                }
                Err(e) => {
                    tracing::error!(agent = %name, "restart failed: {}", e);
                    self.record(StatusUpdate::new(
                        &name,
                        AgentStatus::Error,
                        ERROR_HEALTH,
                        format!("restart failed: {e}"),
                    ))
                    .await;
                    break ExitOutcome::RestartFailed {
                        reason: e.to_string(),
                    };
                }
            }
        };

        let mut running = self.inner.running.lock().await;
        if running
            .get(&name)
            .is_some_and(|entry| entry.generation == generation)
        {
            running.remove(&name);
        }
        drop(permit);
        tracing::info!(agent = %name, outcome = ?outcome, "agent exited");
        self.emit(SupervisorEvent::Exited {
            agent: name,
            outcome,
        });
    }

    /// 正常退出：启动之后若 Agent 自己上报过状态则保留，否则写 stopped
    async fn settle_clean_exit(&self, name: &str, started_at: DateTime<Utc>) -> ExitOutcome {
        match self.inner.store.get(name).await {
            Ok(agent) if agent.updated_at.timestamp_micros() > started_at.timestamp_micros() => {
                tracing::info!(agent = %name, status = %agent.status, "clean exit, keeping self-reported status");
                return ExitOutcome::SelfReported {
                    status: agent.status,
                };
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(agent = %name, "could not read status on exit: {}", e),
        }
        self.record(StatusUpdate::new(name, AgentStatus::Stopped, 0, "exited cleanly"))
            .await;
        ExitOutcome::Completed
    }

    async fn update_entry(
        &self,
        name: &str,
        generation: u64,
        pid: Option<u32>,
        started_at: DateTime<Utc>,
    ) {
        let mut running = self.inner.running.lock().await;
        if let Some(entry) = running.get_mut(name) {
            if entry.generation == generation {
                entry.pid = pid;
                entry.started_at = started_at;
            }
        }
    }

    /// 状态写入失败只记日志，不影响进程监管
    async fn record(&self, update: StatusUpdate) -> Option<WriteOutcome> {
        match self.inner.store.set_status(&update).await {
            Ok(WriteOutcome::Superseded) => {
                tracing::debug!(agent = %update.name, status = %update.status, "status write superseded by newer record");
                Some(WriteOutcome::Superseded)
            }
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::error!(agent = %update.name, status = %update.status, "status write failed: {}", e);
                None
            }
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        // 没有订阅者时 send 返回 Err，忽略
        let _ = self.inner.events.send(event);
    }
}

fn exit_activity(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with code {code}"),
        None => "terminated by signal".to_string(),
    }
}
