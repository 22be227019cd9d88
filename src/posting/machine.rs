//! 发帖状态机实现
//!
//! 每次发布先在存储里把目标单元整体 claim 为 posting（单事务，失败即拒绝），再启动一次外部发布进程并施加截止时间。
//! 进程结束后整批写入 posted 或回滚状态；写入失败按配置重试，返回时不会留下 posting 状态的单元。
//! 每次发布进程调用输出一行 JSON 审计日志。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use super::types::{PostOutcome, PostThreadRequest, ScheduleContent, ScheduleRequest};
use crate::config::{PostingSection, RollbackPolicy};
use crate::core::{wait_with_deadline, LaunchSpec, ProcessLauncher, RelayError};
use crate::store::{NewUnit, PostingStore, PostingUnit, UnitFilter, UnitStatus};

/// 状态机参数
#[derive(Debug, Clone)]
pub struct PostingOptions {
    pub publisher_program: String,
    pub publisher_args: Vec<String>,
    pub single_deadline: Duration,
    pub thread_deadline: Duration,
    pub rollback_policy: RollbackPolicy,
    pub persistence_retries: u32,
    pub retry_backoff: Duration,
}

impl From<&PostingSection> for PostingOptions {
    fn from(cfg: &PostingSection) -> Self {
        Self {
            publisher_program: cfg.publisher_program.clone(),
            publisher_args: cfg.publisher_args.clone(),
            single_deadline: Duration::from_secs(cfg.single_deadline_secs),
            thread_deadline: Duration::from_secs(cfg.thread_deadline_secs),
            rollback_policy: cfg.rollback_policy,
            persistence_retries: cfg.persistence_retries,
            retry_backoff: Duration::from_millis(cfg.retry_backoff_ms),
        }
    }
}

impl Default for PostingOptions {
    fn default() -> Self {
        Self::from(&PostingSection::default())
    }
}

impl PostingOptions {
    fn thread_rollback_status(&self) -> UnitStatus {
        match self.rollback_policy {
            RollbackPolicy::Failed => UnitStatus::Failed,
            RollbackPolicy::Scheduled => UnitStatus::Scheduled,
        }
    }
}

/// 发帖状态机
pub struct PostingMachine {
    store: Arc<dyn PostingStore>,
    launcher: Arc<dyn ProcessLauncher>,
    options: PostingOptions,
}

impl PostingMachine {
    pub fn new(
        store: Arc<dyn PostingStore>,
        launcher: Arc<dyn ProcessLauncher>,
        options: PostingOptions,
    ) -> Self {
        Self {
            store,
            launcher,
            options,
        }
    }

    pub fn options(&self) -> &PostingOptions {
        &self.options
    }

    /// 排期：单条直接插入；线程按 position 逐个插入，部分失败返回 PartialBatch（成功的保留）
    pub async fn schedule(&self, request: ScheduleRequest) -> Result<Vec<PostingUnit>, RelayError> {
        let scheduled_for = request.validate()?;
        let parts = request.content.parts();

        let Some(key) = request.thread_key.as_deref() else {
            let unit = self
                .store
                .insert_unit(&NewUnit {
                    content: parts[0].to_string(),
                    scheduled_for,
                    thread_key: None,
                    position: None,
                })
                .await?;
            tracing::info!(unit_id = unit.id, %scheduled_for, "post scheduled");
            return Ok(vec![unit]);
        };

        let existing = self.store.thread_units(key).await?;
        let first_position = match (&request.content, existing.first()) {
            (ScheduleContent::Thread(_), Some(_)) => {
                return Err(RelayError::Validation(format!(
                    "thread '{key}' already exists"
                )));
            }
            (ScheduleContent::Single(_), Some(head)) => {
                let started: Vec<String> = existing
                    .iter()
                    .filter(|u| u.status != UnitStatus::Scheduled)
                    .map(|u| format!("{}={}", u.id, u.status))
                    .collect();
                if !started.is_empty() {
                    return Err(RelayError::Validation(format!(
                        "thread '{key}' cannot take new members, not scheduled: {}",
                        started.join(", ")
                    )));
                }
                if head.scheduled_for.timestamp_micros() != scheduled_for.timestamp_micros() {
                    return Err(RelayError::Validation(format!(
                        "thread '{key}' is scheduled for {}, members must share it",
                        head.scheduled_for
                    )));
                }
                let taken: BTreeSet<u32> = existing.iter().filter_map(|u| u.position).collect();
                match request.position {
                    Some(p) if taken.contains(&p) => {
                        return Err(RelayError::Validation(format!(
                            "position {p} already taken in thread '{key}'"
                        )));
                    }
                    Some(p) => p,
                    None => taken.last().copied().unwrap_or(0) + 1,
                }
            }
            (_, None) => request.position.unwrap_or(1),
        };

        let mut inserted = Vec::with_capacity(parts.len());
        let mut failed_positions = Vec::new();
        let mut reasons = Vec::new();
        for (offset, part) in parts.iter().enumerate() {
            let position = first_position + offset as u32;
            let unit = NewUnit {
                content: part.to_string(),
                scheduled_for,
                thread_key: Some(key.to_string()),
                position: Some(position),
            };
            match self.store.insert_unit(&unit).await {
                Ok(unit) => inserted.push(unit),
                Err(e) => {
                    tracing::warn!(thread_key = %key, position, "member insert failed: {}", e);
                    failed_positions.push(position);
                    reasons.push(format!("position {position}: {e}"));
                }
            }
        }

        if !failed_positions.is_empty() {
            return Err(RelayError::PartialBatch {
                succeeded: inserted.iter().map(|u| u.id).collect(),
                failed_positions,
                reason: reasons.join("; "),
            });
        }
        tracing::info!(thread_key = %key, members = inserted.len(), %scheduled_for, "thread scheduled");
        Ok(inserted)
    }

    /// 改期：线程为单条 UPDATE，只作用于 scheduled 成员；单个单元必须处于 scheduled
    pub async fn reschedule(
        &self,
        target: &UnitFilter,
        new_time: DateTime<Utc>,
    ) -> Result<usize, RelayError> {
        if let UnitFilter::Id(id) = target {
            let unit = self.unit(*id).await?;
            reject_thread_member(&unit, "reschedule")?;
            if unit.status != UnitStatus::Scheduled {
                return Err(RelayError::Validation(format!(
                    "unit {id} is {}, only scheduled units can be rescheduled",
                    unit.status
                )));
            }
        } else {
            self.target_units(target).await?;
        }

        let changed = self.store.reschedule_scheduled(target, new_time).await?;
        if changed == 0 && matches!(target, UnitFilter::Id(_)) {
            return Err(RelayError::Validation(format!(
                "{target} is no longer scheduled"
            )));
        }
        tracing::info!(%target, changed, %new_time, "rescheduled");
        Ok(changed)
    }

    /// 删除：目标中含已发布单元时整体拒绝；否则删除其中的 scheduled 单元
    pub async fn delete(&self, target: &UnitFilter) -> Result<usize, RelayError> {
        let units = self.target_units(target).await?;
        let posted: Vec<i64> = units
            .iter()
            .filter(|u| u.status == UnitStatus::Posted)
            .map(|u| u.id)
            .collect();
        if !posted.is_empty() {
            return Err(RelayError::Validation(format!(
                "{target} contains posted units {posted:?}, posted content cannot be deleted"
            )));
        }
        if let (UnitFilter::Id(id), Some(unit)) = (target, units.first()) {
            reject_thread_member(unit, "delete")?;
            if unit.status != UnitStatus::Scheduled {
                return Err(RelayError::Validation(format!(
                    "unit {id} is {}, only scheduled units can be deleted",
                    unit.status
                )));
            }
        }

        let removed = self.store.delete_scheduled(target).await?;
        tracing::info!(%target, removed, "deleted scheduled units");
        Ok(removed)
    }

    /// 发布单条（非线程）帖子
    pub async fn post(&self, unit_id: i64) -> Result<PostOutcome, RelayError> {
        let unit = self.unit(unit_id).await?;
        reject_thread_member(&unit, "post")?;
        match unit.status {
            UnitStatus::Scheduled => {}
            UnitStatus::Posting => {
                return Err(RelayError::Validation(format!(
                    "unit {unit_id} is already posting"
                )));
            }
            other => {
                return Err(RelayError::Validation(format!(
                    "unit {unit_id} is already {other}"
                )));
            }
        }

        let ids = vec![unit_id];
        if !self
            .store
            .transition_all(&ids, &[UnitStatus::Scheduled], UnitStatus::Posting, None)
            .await?
        {
            return Err(RelayError::Validation(format!(
                "unit {unit_id} is no longer scheduled"
            )));
        }

        let target = UnitFilter::Id(unit_id).to_string();
        let result = self
            .run_publisher(&target, unit_id, false, self.options.single_deadline)
            .await;
        self.finish(&target, ids, result, UnitStatus::Failed).await
    }

    /// 发布整条线程：校验成员、单事务 claim、一次发布进程，结果对全部成员统一生效
    pub async fn post_thread(&self, request: PostThreadRequest) -> Result<PostOutcome, RelayError> {
        let key = request.thread_key.as_str();
        let members = self.thread(key).await?;

        let stored: BTreeSet<i64> = members.iter().map(|u| u.id).collect();
        let requested: BTreeSet<i64> = request.member_ids.iter().copied().collect();
        let missing: Vec<i64> = stored.difference(&requested).copied().collect();
        let unexpected: Vec<i64> = requested.difference(&stored).copied().collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            return Err(RelayError::Validation(format!(
                "thread '{key}' membership mismatch: missing {missing:?}, not in thread {unexpected:?}"
            )));
        }

        if members.iter().any(|u| u.status == UnitStatus::Posting) {
            return Err(RelayError::Validation(format!(
                "thread '{key}' is already posting"
            )));
        }
        let not_scheduled: Vec<String> = members
            .iter()
            .filter(|u| u.status != UnitStatus::Scheduled)
            .map(|u| format!("{}={}", u.id, u.status))
            .collect();
        if !not_scheduled.is_empty() {
            return Err(RelayError::Validation(format!(
                "thread '{key}' has members that are not scheduled: {}",
                not_scheduled.join(", ")
            )));
        }

        // 按 position 排序，第一个成员的 id 交给发布进程
        let ids: Vec<i64> = members.iter().map(|u| u.id).collect();
        if !self.store.claim_thread(key, &ids).await? {
            return Err(RelayError::Validation(format!(
                "thread '{key}' changed before it could be claimed (already posting or members added)"
            )));
        }

        let target = UnitFilter::Thread(key.to_string()).to_string();
        let result = self
            .run_publisher(&target, ids[0], true, self.options.thread_deadline)
            .await;
        let rollback = self.options.thread_rollback_status();
        self.finish(&target, ids, result, rollback).await
    }

    pub async fn unit(&self, id: i64) -> Result<PostingUnit, RelayError> {
        self.store
            .unit(id)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("unit {id}")))
    }

    /// 线程成员（按 position）；不存在时 NotFound
    pub async fn thread(&self, thread_key: &str) -> Result<Vec<PostingUnit>, RelayError> {
        let units = self.store.thread_units(thread_key).await?;
        if units.is_empty() {
            return Err(RelayError::NotFound(format!("thread '{thread_key}'")));
        }
        Ok(units)
    }

    /// 到期待发的 scheduled 单元
    pub async fn due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PostingUnit>, RelayError> {
        self.store.due_units(now, limit).await
    }

    async fn target_units(&self, target: &UnitFilter) -> Result<Vec<PostingUnit>, RelayError> {
        match target {
            UnitFilter::Id(id) => Ok(vec![self.unit(*id).await?]),
            UnitFilter::Thread(key) => self.thread(key).await,
        }
    }

    /// 启动发布进程并等待；无论结果如何都输出审计日志
    async fn run_publisher(
        &self,
        target: &str,
        tweet_id: i64,
        thread: bool,
        deadline: Duration,
    ) -> Result<(), RelayError> {
        let spec = LaunchSpec::new(target, &self.options.publisher_program)
            .args(self.options.publisher_args.iter().cloned())
            .arg("--tweet_id")
            .arg(tweet_id.to_string())
            .arg("--thread")
            .arg(thread.to_string());

        let start = Instant::now();
        let result = match self.launcher.launch(&spec) {
            Ok(child) => wait_with_deadline(child, deadline, target).await.map(|_| ()),
            Err(e) => Err(e),
        };

        let outcome = match &result {
            Ok(()) => "ok",
            Err(RelayError::ProcessTimeout { .. }) => "timeout",
            Err(RelayError::ProcessSpawn { .. }) => "spawn_failed",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "publisher_audit",
            "target": target,
            "tweet_id": tweet_id,
            "thread": thread,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "deadline_secs": deadline.as_secs(),
        });
        tracing::info!(audit = %audit.to_string(), "publisher");
        result
    }

    /// 把 posting 中的整批单元写到终态
    async fn finish(
        &self,
        target: &str,
        ids: Vec<i64>,
        result: Result<(), RelayError>,
        rollback_to: UnitStatus,
    ) -> Result<PostOutcome, RelayError> {
        match result {
            Ok(()) => {
                let posted_at = Utc::now();
                self.settle(&ids, UnitStatus::Posted, Some(posted_at)).await?;
                tracing::info!(target_name = %target, units = ids.len(), "posted");
                Ok(PostOutcome::Posted {
                    unit_ids: ids,
                    posted_at,
                })
            }
            Err(e) => {
                tracing::warn!(target_name = %target, rolled_back_to = %rollback_to, "publish failed: {}", e);
                self.settle(&ids, rollback_to, None).await?;
                Ok(PostOutcome::Failed {
                    unit_ids: ids,
                    kind: e.kind(),
                    detail: e.to_string(),
                    rolled_back_to: rollback_to,
                })
            }
        }
    }

    /// posting → to，失败按 persistence_retries 重试（至少一次）
    async fn settle(
        &self,
        ids: &[i64],
        to: UnitStatus,
        posted_at: Option<DateTime<Utc>>,
    ) -> Result<(), RelayError> {
        let attempts = self.options.persistence_retries.max(1) + 1;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self
                .store
                .transition_all(ids, &[UnitStatus::Posting], to, posted_at)
                .await
            {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    // 上一次尝试可能已提交但报告失败
                    if self.all_in_status(ids, to).await? {
                        return Ok(());
                    }
                    return Err(RelayError::Persistence(format!(
                        "units {ids:?} left posting before settling to {to}"
                    )));
                }
                Err(e) => {
                    tracing::warn!(units = ?ids, %to, attempt, "settle write failed: {}", e);
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.options.retry_backoff * attempt).await;
            }
        }
        tracing::error!(units = ?ids, %to, attempts, "giving up settling units");
        Err(RelayError::Persistence(format!(
            "could not move units {ids:?} to {to} after {attempts} attempts: {last_error}"
        )))
    }

    async fn all_in_status(&self, ids: &[i64], status: UnitStatus) -> Result<bool, RelayError> {
        for id in ids {
            match self.store.unit(*id).await? {
                Some(unit) if unit.status == status => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}

/// 线程成员只能按整个线程操作
fn reject_thread_member(unit: &PostingUnit, action: &str) -> Result<(), RelayError> {
    match &unit.thread_key {
        Some(key) => Err(RelayError::Validation(format!(
            "unit {} belongs to thread '{key}', {action} the whole thread (thread:{key})",
            unit.id
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use proptest::prelude::*;

    use super::*;
    use crate::core::fake_process::{Behavior, FakeLauncher};
    use crate::core::ErrorKind;
    use crate::store::SqliteStore;

    /// 可注入故障的存储：终态写入前 N 次失败，指定 position 的插入失败
    struct FlakyStore {
        inner: SqliteStore,
        settle_failures: AtomicU32,
        settle_calls: AtomicU32,
        fail_positions: Vec<u32>,
        /// 读取线程成员后插入一个新成员，模拟读取与 claim 之间的并发追加
        append_after_read: std::sync::Mutex<Option<NewUnit>>,
    }

    impl FlakyStore {
        fn new(settle_failures: u32, fail_positions: Vec<u32>) -> Self {
            Self {
                inner: SqliteStore::in_memory().unwrap(),
                settle_failures: AtomicU32::new(settle_failures),
                settle_calls: AtomicU32::new(0),
                fail_positions,
                append_after_read: std::sync::Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl PostingStore for FlakyStore {
        async fn insert_unit(&self, unit: &NewUnit) -> Result<PostingUnit, RelayError> {
            if unit.position.is_some_and(|p| self.fail_positions.contains(&p)) {
                return Err(RelayError::Persistence("disk I/O error".into()));
            }
            self.inner.insert_unit(unit).await
        }

        async fn unit(&self, id: i64) -> Result<Option<PostingUnit>, RelayError> {
            self.inner.unit(id).await
        }

        async fn thread_units(&self, thread_key: &str) -> Result<Vec<PostingUnit>, RelayError> {
            let units = self.inner.thread_units(thread_key).await?;
            let late = self.append_after_read.lock().unwrap().take();
            if let Some(late) = late {
                self.inner.insert_unit(&late).await?;
            }
            Ok(units)
        }

        async fn due_units(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<PostingUnit>, RelayError> {
            self.inner.due_units(now, limit).await
        }

        async fn transition_all(
            &self,
            ids: &[i64],
            from: &[UnitStatus],
            to: UnitStatus,
            posted_at: Option<DateTime<Utc>>,
        ) -> Result<bool, RelayError> {
            if to != UnitStatus::Posting {
                self.settle_calls.fetch_add(1, Ordering::SeqCst);
                let left = self.settle_failures.load(Ordering::SeqCst);
                if left > 0 {
                    self.settle_failures.store(left - 1, Ordering::SeqCst);
                    return Err(RelayError::Persistence("database is locked".into()));
                }
            }
            self.inner.transition_all(ids, from, to, posted_at).await
        }

        async fn claim_thread(&self, thread_key: &str, ids: &[i64]) -> Result<bool, RelayError> {
            self.inner.claim_thread(thread_key, ids).await
        }

        async fn reschedule_scheduled(
            &self,
            filter: &UnitFilter,
            new_time: DateTime<Utc>,
        ) -> Result<usize, RelayError> {
            self.inner.reschedule_scheduled(filter, new_time).await
        }

        async fn delete_scheduled(&self, filter: &UnitFilter) -> Result<usize, RelayError> {
            self.inner.delete_scheduled(filter).await
        }
    }

    fn options() -> PostingOptions {
        PostingOptions {
            publisher_program: "publisher".into(),
            publisher_args: vec!["post.py".into()],
            single_deadline: Duration::from_secs(2),
            thread_deadline: Duration::from_secs(4),
            rollback_policy: RollbackPolicy::Failed,
            persistence_retries: 3,
            retry_backoff: Duration::from_millis(1),
        }
    }

    fn machine_with(
        store: Arc<dyn PostingStore>,
        launcher: &Arc<FakeLauncher>,
        options: PostingOptions,
    ) -> PostingMachine {
        PostingMachine::new(store, launcher.clone(), options)
    }

    fn machine(launcher: &Arc<FakeLauncher>) -> (PostingMachine, SqliteStore) {
        let store = SqliteStore::in_memory().unwrap();
        (machine_with(Arc::new(store.clone()), launcher, options()), store)
    }

    async fn schedule_thread(m: &PostingMachine, key: &str, n: usize) -> Vec<i64> {
        schedule_thread_at(m, key, n, Utc::now()).await
    }

    async fn schedule_thread_at(
        m: &PostingMachine,
        key: &str,
        n: usize,
        at: DateTime<Utc>,
    ) -> Vec<i64> {
        let parts: Vec<String> = (1..=n).map(|i| format!("part {i}")).collect();
        m.schedule(ScheduleRequest::thread(key, parts, at))
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.id)
            .collect()
    }

    async fn statuses(m: &PostingMachine, ids: &[i64]) -> Vec<UnitStatus> {
        let mut out = Vec::new();
        for id in ids {
            out.push(m.unit(*id).await.unwrap().status);
        }
        out
    }

    #[tokio::test]
    async fn test_post_single_success() {
        let launcher = FakeLauncher::new();
        launcher.set_default_behavior(Behavior::Exit(0));
        let (m, _store) = machine(&launcher);

        let unit = m.schedule(ScheduleRequest::single("hello", Utc::now())).await.unwrap()[0].clone();
        let outcome = m.post(unit.id).await.unwrap();
        assert!(outcome.is_posted());

        let stored = m.unit(unit.id).await.unwrap();
        assert_eq!(stored.status, UnitStatus::Posted);
        assert!(stored.posted_at.is_some());

        let spec = &launcher.spawned()[0];
        assert_eq!(spec.program, "publisher");
        let id = unit.id.to_string();
        assert_eq!(spec.args, vec!["post.py", "--tweet_id", id.as_str(), "--thread", "false"]);
    }

    #[tokio::test]
    async fn test_post_single_failure_marks_failed() {
        let launcher = FakeLauncher::new();
        launcher.set_default_behavior(Behavior::Exit(2));
        let (m, _store) = machine(&launcher);

        let id = m.schedule(ScheduleRequest::single("x", Utc::now())).await.unwrap()[0].id;
        match m.post(id).await.unwrap() {
            PostOutcome::Failed { kind, rolled_back_to, .. } => {
                assert_eq!(kind, ErrorKind::ProcessExit);
                assert_eq!(rolled_back_to, UnitStatus::Failed);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let stored = m.unit(id).await.unwrap();
        assert_eq!(stored.status, UnitStatus::Failed);
        assert!(stored.posted_at.is_none());
    }

    #[tokio::test]
    async fn test_post_deadline_kills_publisher() {
        let launcher = FakeLauncher::new();
        launcher.set_default_behavior(Behavior::Hang);
        let store = SqliteStore::in_memory().unwrap();
        let m = machine_with(
            Arc::new(store),
            &launcher,
            PostingOptions {
                single_deadline: Duration::from_millis(50),
                ..options()
            },
        );

        let id = m.schedule(ScheduleRequest::single("x", Utc::now())).await.unwrap()[0].id;
        let outcome = m.post(id).await.unwrap();
        assert!(matches!(
            outcome,
            PostOutcome::Failed { kind: ErrorKind::ProcessTimeout, .. }
        ));
        assert_eq!(launcher.killed(), vec![format!("unit {id}")]);
        assert_eq!(m.unit(id).await.unwrap().status, UnitStatus::Failed);
    }

    #[tokio::test]
    async fn test_post_spawn_failure_never_leaves_posting() {
        let launcher = FakeLauncher::new();
        let (m, _store) = machine(&launcher);
        let id = m.schedule(ScheduleRequest::single("x", Utc::now())).await.unwrap()[0].id;
        launcher.fail_spawn_for(&format!("unit {id}"));

        let outcome = m.post(id).await.unwrap();
        assert!(matches!(
            outcome,
            PostOutcome::Failed { kind: ErrorKind::ProcessSpawn, .. }
        ));
        assert_eq!(m.unit(id).await.unwrap().status, UnitStatus::Failed);
    }

    #[tokio::test]
    async fn test_post_rejections() {
        let launcher = FakeLauncher::new();
        launcher.set_default_behavior(Behavior::Exit(0));
        let (m, _store) = machine(&launcher);

        assert!(matches!(m.post(999).await, Err(RelayError::NotFound(_))));

        let id = m.schedule(ScheduleRequest::single("x", Utc::now())).await.unwrap()[0].id;
        m.post(id).await.unwrap();
        assert!(matches!(m.post(id).await, Err(RelayError::Validation(_))));

        let members = schedule_thread(&m, "t", 2).await;
        let err = m.post(members[0]).await.unwrap_err();
        assert!(err.to_string().contains("whole thread"));
        assert_eq!(launcher.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_thread_success_posts_every_member() {
        let launcher = FakeLauncher::new();
        launcher.set_default_behavior(Behavior::Exit(0));
        let (m, _store) = machine(&launcher);

        let ids = schedule_thread(&m, "blog-7", 3).await;
        let outcome = m.post_thread(PostThreadRequest::new("blog-7", ids.clone())).await.unwrap();
        assert_eq!(outcome.unit_ids(), ids.as_slice());

        let members = m.thread("blog-7").await.unwrap();
        assert!(members.iter().all(|u| u.status == UnitStatus::Posted));
        let posted_at: BTreeSet<_> = members.iter().map(|u| u.posted_at).collect();
        assert_eq!(posted_at.len(), 1);

        let spec = &launcher.spawned()[0];
        assert_eq!(spec.label, "thread blog-7");
        let first = ids[0].to_string();
        assert_eq!(spec.args[1..], ["--tweet_id", first.as_str(), "--thread", "true"]);
    }

    #[tokio::test]
    async fn test_thread_failure_rolls_back_all_members() {
        let launcher = FakeLauncher::new();
        launcher.set_default_behavior(Behavior::Exit(1));
        let (m, _store) = machine(&launcher);

        let ids = schedule_thread(&m, "t3", 3).await;
        let outcome = m.post_thread(PostThreadRequest::new("t3", ids.clone())).await.unwrap();
        assert!(!outcome.is_posted());

        let members = m.thread("t3").await.unwrap();
        assert_eq!(members.len(), 3);
        assert!(members.iter().all(|u| u.status == UnitStatus::Failed));
        assert!(members.iter().all(|u| u.posted_at.is_none()));
    }

    #[tokio::test]
    async fn test_thread_rollback_to_scheduled_allows_retry() {
        let launcher = FakeLauncher::new();
        launcher.push_behavior("thread t", Behavior::Exit(1));
        launcher.push_behavior("thread t", Behavior::Exit(0));
        let store = SqliteStore::in_memory().unwrap();
        let m = machine_with(
            Arc::new(store),
            &launcher,
            PostingOptions {
                rollback_policy: RollbackPolicy::Scheduled,
                ..options()
            },
        );

        let ids = schedule_thread(&m, "t", 2).await;
        let first = m.post_thread(PostThreadRequest::new("t", ids.clone())).await.unwrap();
        assert!(matches!(
            first,
            PostOutcome::Failed { rolled_back_to: UnitStatus::Scheduled, .. }
        ));
        assert_eq!(statuses(&m, &ids).await, vec![UnitStatus::Scheduled; 2]);

        let second = m.post_thread(PostThreadRequest::new("t", ids.clone())).await.unwrap();
        assert!(second.is_posted());
        assert_eq!(statuses(&m, &ids).await, vec![UnitStatus::Posted; 2]);
    }

    #[tokio::test]
    async fn test_thread_membership_mismatch_touches_nothing() {
        let launcher = FakeLauncher::new();
        launcher.set_default_behavior(Behavior::Exit(0));
        let (m, _store) = machine(&launcher);

        let ids = schedule_thread(&m, "t", 3).await;
        let request = PostThreadRequest::new("t", vec![ids[0], ids[1], 4040]);
        let err = m.post_thread(request).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains(&format!("missing [{}]", ids[2])));
        assert!(msg.contains("[4040]"));

        assert_eq!(statuses(&m, &ids).await, vec![UnitStatus::Scheduled; 3]);
        assert_eq!(launcher.spawn_count(), 0);
        assert!(matches!(
            m.post_thread(PostThreadRequest::new("nope", vec![1])).await,
            Err(RelayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_thread_with_non_scheduled_member_rejected() {
        let launcher = FakeLauncher::new();
        launcher.set_default_behavior(Behavior::Exit(0));
        let (m, store) = machine(&launcher);

        let ids = schedule_thread(&m, "t", 3).await;
        store
            .transition_all(&[ids[1]], &[UnitStatus::Scheduled], UnitStatus::Failed, None)
            .await
            .unwrap();

        let err = m.post_thread(PostThreadRequest::new("t", ids.clone())).await.unwrap_err();
        assert!(err.to_string().contains(&format!("{}=failed", ids[1])));
        assert_eq!(
            statuses(&m, &ids).await,
            vec![UnitStatus::Scheduled, UnitStatus::Failed, UnitStatus::Scheduled]
        );
        assert_eq!(launcher.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_post_thread_spawns_once() {
        let launcher = FakeLauncher::new();
        let store = SqliteStore::in_memory().unwrap();
        let m = Arc::new(machine_with(Arc::new(store), &launcher, options()));

        let ids = schedule_thread(&m, "race", 2).await;
        let first = {
            let m = m.clone();
            let ids = ids.clone();
            tokio::spawn(async move { m.post_thread(PostThreadRequest::new("race", ids)).await })
        };
        for _ in 0..200 {
            if launcher.spawn_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(launcher.spawn_count(), 1);

        let err = m.post_thread(PostThreadRequest::new("race", ids.clone())).await.unwrap_err();
        assert!(err.to_string().contains("already posting"));

        assert!(launcher.exit("thread race", 0));
        assert!(first.await.unwrap().unwrap().is_posted());
        assert_eq!(launcher.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_rollback_write_is_retried() {
        let launcher = FakeLauncher::new();
        launcher.set_default_behavior(Behavior::Exit(1));
        let store = Arc::new(FlakyStore::new(2, vec![]));
        let m = machine_with(store.clone(), &launcher, options());

        let ids = schedule_thread(&m, "t", 3).await;
        let outcome = m.post_thread(PostThreadRequest::new("t", ids.clone())).await.unwrap();
        assert!(!outcome.is_posted());
        assert_eq!(store.settle_calls.load(Ordering::SeqCst), 3);
        assert_eq!(statuses(&m, &ids).await, vec![UnitStatus::Failed; 3]);
    }

    #[tokio::test]
    async fn test_persistent_write_failure_surfaces() {
        let launcher = FakeLauncher::new();
        launcher.set_default_behavior(Behavior::Exit(0));
        let store = Arc::new(FlakyStore::new(100, vec![]));
        let m = machine_with(store.clone(), &launcher, options());

        let id = m.schedule(ScheduleRequest::single("x", Utc::now())).await.unwrap()[0].id;
        let err = m.post(id).await.unwrap_err();
        assert!(matches!(err, RelayError::Persistence(_)));
        // 1 次首写 + 3 次重试
        assert_eq!(store.settle_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_partial_batch_names_failed_positions() {
        let launcher = FakeLauncher::new();
        let store = Arc::new(FlakyStore::new(0, vec![2]));
        let m = machine_with(store, &launcher, options());

        let err = m
            .schedule(ScheduleRequest::thread("t", ["a", "b", "c"], Utc::now()))
            .await
            .unwrap_err();
        match err {
            RelayError::PartialBatch { succeeded, failed_positions, .. } => {
                assert_eq!(succeeded.len(), 2);
                assert_eq!(failed_positions, vec![2]);
            }
            other => panic!("expected PartialBatch, got {other}"),
        }
        let kept: Vec<Option<u32>> = m.thread("t").await.unwrap().iter().map(|u| u.position).collect();
        assert_eq!(kept, vec![Some(1), Some(3)]);
    }

    #[tokio::test]
    async fn test_schedule_validation_writes_nothing() {
        let launcher = FakeLauncher::new();
        let (m, store) = machine(&launcher);
        let bad = ScheduleRequest {
            thread_key: None,
            ..ScheduleRequest::thread("k", ["a", "b"], Utc::now())
        };
        assert!(matches!(m.schedule(bad).await, Err(RelayError::Validation(_))));
        assert!(store.due_units(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_to_existing_thread() {
        let launcher = FakeLauncher::new();
        let (m, _store) = machine(&launcher);
        let at = Utc::now();
        m.schedule(ScheduleRequest::thread("k", ["a", "b"], at)).await.unwrap();

        let appended = ScheduleRequest {
            thread_key: Some("k".into()),
            ..ScheduleRequest::single("c", at)
        };
        let unit = m.schedule(appended).await.unwrap()[0].clone();
        assert_eq!(unit.position, Some(3));

        let other_time = ScheduleRequest {
            thread_key: Some("k".into()),
            ..ScheduleRequest::single("d", at + chrono::Duration::hours(1))
        };
        assert!(m.schedule(other_time).await.is_err());
        assert!(m.schedule(ScheduleRequest::thread("k", ["x", "y"], at)).await.is_err());
        assert_eq!(m.thread("k").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_append_accepts_sub_micro_times() {
        let launcher = FakeLauncher::new();
        let (m, _store) = machine(&launcher);
        let at = DateTime::parse_from_rfc3339("2026-05-01T09:00:00.000000700Z")
            .unwrap()
            .with_timezone(&Utc);
        m.schedule(ScheduleRequest::thread("k", ["a", "b"], at)).await.unwrap();

        let later = DateTime::parse_from_rfc3339("2026-05-01T09:00:00.000000900Z")
            .unwrap()
            .with_timezone(&Utc);
        let appended = ScheduleRequest {
            thread_key: Some("k".into()),
            ..ScheduleRequest::single("c", later)
        };
        assert_eq!(m.schedule(appended).await.unwrap()[0].position, Some(3));
    }

    #[tokio::test]
    async fn test_append_rejected_once_thread_started() {
        let launcher = FakeLauncher::new();
        launcher.set_default_behavior(Behavior::Exit(0));
        let (m, _store) = machine(&launcher);
        let at = Utc::now();
        let ids = schedule_thread_at(&m, "t", 2, at).await;
        m.post_thread(PostThreadRequest::new("t", ids.clone())).await.unwrap();

        let appended = ScheduleRequest {
            thread_key: Some("t".into()),
            ..ScheduleRequest::single("late", at)
        };
        let err = m.schedule(appended).await.unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
        assert!(err.to_string().contains("posted"));

        let members = m.thread("t").await.unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|u| u.status == UnitStatus::Posted));
    }

    #[tokio::test]
    async fn test_thread_member_cannot_be_rescheduled_or_deleted_alone() {
        let launcher = FakeLauncher::new();
        let (m, _store) = machine(&launcher);
        let ids = schedule_thread(&m, "t", 3).await;
        let before = m.thread("t").await.unwrap();

        let later = Utc::now() + chrono::Duration::hours(3);
        assert!(matches!(
            m.reschedule(&UnitFilter::Id(ids[1]), later).await,
            Err(RelayError::Validation(_))
        ));
        assert!(matches!(
            m.delete(&UnitFilter::Id(ids[0])).await,
            Err(RelayError::Validation(_))
        ));
        assert_eq!(m.thread("t").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_member_added_before_claim_aborts_post_thread() {
        let launcher = FakeLauncher::new();
        launcher.set_default_behavior(Behavior::Exit(0));
        let store = Arc::new(FlakyStore::new(0, vec![]));
        let m = machine_with(store.clone(), &launcher, options());
        let at = Utc::now();
        let ids = schedule_thread_at(&m, "t", 2, at).await;

        *store.append_after_read.lock().unwrap() = Some(NewUnit {
            content: "late".into(),
            scheduled_for: at,
            thread_key: Some("t".into()),
            position: Some(3),
        });
        let err = m.post_thread(PostThreadRequest::new("t", ids)).await.unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
        assert_eq!(launcher.spawn_count(), 0);

        let members = m.thread("t").await.unwrap();
        assert_eq!(members.len(), 3);
        assert!(members.iter().all(|u| u.status == UnitStatus::Scheduled));
    }

    #[tokio::test]
    async fn test_delete_posted_is_rejected() {
        let launcher = FakeLauncher::new();
        launcher.set_default_behavior(Behavior::Exit(0));
        let (m, store) = machine(&launcher);

        let id = m.schedule(ScheduleRequest::single("x", Utc::now())).await.unwrap()[0].id;
        m.post(id).await.unwrap();
        let before = m.unit(id).await.unwrap();
        assert!(matches!(m.delete(&UnitFilter::Id(id)).await, Err(RelayError::Validation(_))));
        assert_eq!(m.unit(id).await.unwrap(), before);

        let ids = schedule_thread(&m, "t", 3).await;
        store
            .transition_all(&[ids[0]], &[UnitStatus::Scheduled], UnitStatus::Posted, Some(Utc::now()))
            .await
            .unwrap();
        let filter = UnitFilter::Thread("t".into());
        assert!(matches!(m.delete(&filter).await, Err(RelayError::Validation(_))));
        assert_eq!(m.thread("t").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_schedule_reschedule_delete_roundtrip() {
        let launcher = FakeLauncher::new();
        let (m, _store) = machine(&launcher);
        let ids = schedule_thread(&m, "rt", 3).await;
        let filter = UnitFilter::Thread("rt".into());

        let later = Utc::now() + chrono::Duration::days(1);
        assert_eq!(m.reschedule(&filter, later).await.unwrap(), 3);
        for unit in m.thread("rt").await.unwrap() {
            assert_eq!(unit.scheduled_for.timestamp_micros(), later.timestamp_micros());
        }

        assert_eq!(m.delete(&filter).await.unwrap(), 3);
        assert!(matches!(m.thread("rt").await, Err(RelayError::NotFound(_))));
        for id in ids {
            assert!(matches!(m.unit(id).await, Err(RelayError::NotFound(_))));
        }
    }

    #[tokio::test]
    async fn test_reschedule_rules() {
        let launcher = FakeLauncher::new();
        launcher.set_default_behavior(Behavior::Exit(1));
        let (m, store) = machine(&launcher);
        let later = Utc::now() + chrono::Duration::hours(2);

        let id = m.schedule(ScheduleRequest::single("x", Utc::now())).await.unwrap()[0].id;
        m.post(id).await.unwrap();
        assert!(matches!(
            m.reschedule(&UnitFilter::Id(id), later).await,
            Err(RelayError::Validation(_))
        ));

        let ids = schedule_thread(&m, "t", 3).await;
        store
            .transition_all(&[ids[2]], &[UnitStatus::Scheduled], UnitStatus::Failed, None)
            .await
            .unwrap();
        assert_eq!(m.reschedule(&UnitFilter::Thread("t".into()), later).await.unwrap(), 2);
        assert!(matches!(
            m.reschedule(&UnitFilter::Thread("ghost".into()), later).await,
            Err(RelayError::NotFound(_))
        ));
    }

    fn run<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap()
            .block_on(fut)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        /// 发布结果与写入故障任意组合，线程成员永远处于同一状态
        #[test]
        fn prop_thread_outcome_is_uniform(
            members in 1usize..6,
            exit_code in prop_oneof![Just(0i32), 1i32..4],
            settle_failures in 0u32..4,
            rollback_scheduled in any::<bool>(),
        ) {
            let (posted, uniform, any_posting) = run(async move {
                let launcher = FakeLauncher::new();
                launcher.set_default_behavior(Behavior::Exit(exit_code));
                let store = Arc::new(FlakyStore::new(settle_failures, vec![]));
                let policy = if rollback_scheduled { RollbackPolicy::Scheduled } else { RollbackPolicy::Failed };
                let m = machine_with(store, &launcher, PostingOptions { rollback_policy: policy, ..options() });

                let ids = schedule_thread(&m, "p", members).await;
                let outcome = m.post_thread(PostThreadRequest::new("p", ids.clone())).await.unwrap();
                let states = statuses(&m, &ids).await;
                let uniform = states.windows(2).all(|w| w[0] == w[1]);
                let any_posting = states.contains(&UnitStatus::Posting);
                (outcome.is_posted() && states[0] == UnitStatus::Posted, uniform, any_posting)
            });
            prop_assert!(uniform);
            prop_assert!(!any_posting);
            prop_assert_eq!(posted, exit_code == 0);
        }

        /// 任意成员子集不在 scheduled 时整体拒绝，状态不变
        #[test]
        fn prop_non_scheduled_subset_rejects_without_change(
            mask in proptest::collection::vec(any::<bool>(), 1..6),
        ) {
            let (result_ok, before, after, spawned) = run(async move {
                let launcher = FakeLauncher::new();
                launcher.set_default_behavior(Behavior::Exit(0));
                let (m, store) = machine(&launcher);
                let ids = schedule_thread(&m, "s", mask.len()).await;
                for (id, failed) in ids.iter().zip(&mask) {
                    if *failed {
                        store
                            .transition_all(&[*id], &[UnitStatus::Scheduled], UnitStatus::Failed, None)
                            .await
                            .unwrap();
                    }
                }
                let before = statuses(&m, &ids).await;
                let result = m.post_thread(PostThreadRequest::new("s", ids.clone())).await;
                let after = statuses(&m, &ids).await;
                (result.is_ok(), before, after, launcher.spawn_count())
            });
            let any_failed = before.contains(&UnitStatus::Failed);
            prop_assert_eq!(result_ok, !any_failed);
            if any_failed {
                prop_assert_eq!(before, after);
                prop_assert_eq!(spawned, 0);
            } else {
                prop_assert!(after.iter().all(|s| *s == UnitStatus::Posted));
            }
        }
    }
}
