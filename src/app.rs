//! 组装与命令分发
//!
//! `App` 持有存储、Supervisor、发帖状态机与配额追踪器；`execute` 把一行命令分发到对应操作，
//! 结果统一转成 JSON，供一次性 CLI 与 serve 模式的标准输入共用。

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::AppConfig;
use crate::core::{CommandLauncher, ProcessLauncher};
use crate::posting::{PostThreadRequest, PostingMachine, PostingOptions, ScheduleRequest};
use crate::store::{SqliteStore, StatusStore, UnitFilter};
use crate::supervisor::{ForceStatusRequest, Supervisor};
use crate::usage::UsageTracker;

const DUE_LIMIT: usize = 50;

pub const USAGE: &str = "\
usage: relay [--config PATH] <command>

commands:
  serve                                  start all agents and read commands from stdin
  status [agent]                         show agent status
  running                                list supervised processes
  start <agent> | start-all              start and supervise until exit or Ctrl+C
  stop <agent>                           stop a supervised agent (serve mode)
  force <agent> <status> <health> [activity...]
  schedule <json>                        e.g. {\"content\":[\"a\",\"b\"],\"thread_key\":\"t1\",\"scheduled_for\":\"2026-01-01T10:00:00Z\"}
  reschedule <id|thread:KEY> <rfc3339>
  delete <id|thread:KEY>
  post <id>
  post-thread <key> [member ids...]
  thread <key> | unit <id> | due
  usage [endpoint...]";

pub struct App {
    pub config: AppConfig,
    pub store: SqliteStore,
    pub supervisor: Supervisor,
    pub posting: PostingMachine,
    pub usage: UsageTracker,
}

impl App {
    /// 按配置打开数据库并使用真实进程
    pub fn open(config: AppConfig) -> anyhow::Result<Self> {
        let path = config.app.database_path.clone();
        let store = SqliteStore::open(&path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        Ok(Self::from_parts(config, store, Arc::new(CommandLauncher::new())))
    }

    pub fn from_parts(
        config: AppConfig,
        store: SqliteStore,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        let supervisor =
            Supervisor::from_config(&config.supervisor, Arc::new(store.clone()), launcher.clone());
        let posting = PostingMachine::new(
            Arc::new(store.clone()),
            launcher,
            PostingOptions::from(&config.posting),
        );
        let usage = UsageTracker::new(&config.usage);
        Self {
            config,
            store,
            supervisor,
            posting,
            usage,
        }
    }

    /// 执行一条命令
    pub async fn execute(&self, words: &[&str]) -> anyhow::Result<serde_json::Value> {
        match words {
            ["status"] => json(self.store.list().await?),
            ["status", agent] => json(self.store.get(agent).await?),
            ["running"] => json(self.supervisor.running().await),
            ["start", agent] => json(self.supervisor.start(agent).await?),
            ["start-all"] => json(self.supervisor.start_all().await),
            ["stop", agent] => {
                self.supervisor.stop(agent).await?;
                Ok(serde_json::json!({ "stopped": agent }))
            }
            ["force", agent, status, health, activity @ ..] => {
                let health: i64 = health
                    .parse()
                    .with_context(|| format!("health must be an integer, got '{health}'"))?;
                let request = ForceStatusRequest {
                    agent: agent.to_string(),
                    status: status.to_string(),
                    health,
                    activity: (!activity.is_empty()).then(|| activity.join(" ")),
                };
                json(self.supervisor.force_status(request).await?)
            }
            ["schedule", body @ ..] if !body.is_empty() => {
                let request: ScheduleRequest =
                    serde_json::from_str(&body.join(" ")).context("Invalid schedule request")?;
                json(self.posting.schedule(request).await?)
            }
            ["reschedule", target, time] => {
                let new_time = parse_time(time)?;
                let changed = self.posting.reschedule(&parse_target(target)?, new_time).await?;
                Ok(serde_json::json!({ "rescheduled": changed }))
            }
            ["delete", target] => {
                let removed = self.posting.delete(&parse_target(target)?).await?;
                Ok(serde_json::json!({ "deleted": removed }))
            }
            ["post", id] => json(self.posting.post(parse_id(id)?).await?),
            ["post-thread", key] => {
                let ids = self
                    .posting
                    .thread(key)
                    .await?
                    .iter()
                    .map(|u| u.id)
                    .collect();
                json(self.posting.post_thread(PostThreadRequest::new(*key, ids)).await?)
            }
            ["post-thread", key, ids @ ..] => {
                let ids = ids.iter().map(|id| parse_id(id)).collect::<anyhow::Result<Vec<_>>>()?;
                json(self.posting.post_thread(PostThreadRequest::new(*key, ids)).await?)
            }
            ["thread", key] => json(self.posting.thread(key).await?),
            ["unit", id] => json(self.posting.unit(parse_id(id)?).await?),
            ["due"] => json(self.posting.due(Utc::now(), DUE_LIMIT).await?),
            ["usage", endpoints @ ..] => json(self.usage.poll(endpoints).await),
            _ => anyhow::bail!("unknown command: {}\n\n{}", words.join(" "), USAGE),
        }
    }
}

fn json<T: Serialize>(value: T) -> anyhow::Result<serde_json::Value> {
    serde_json::to_value(value).context("Failed to serialize result")
}

fn parse_id(raw: &str) -> anyhow::Result<i64> {
    raw.parse()
        .with_context(|| format!("invalid unit id '{raw}'"))
}

fn parse_time(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("invalid RFC 3339 time '{raw}'"))
}

/// `12` → 单元，`thread:blog-7` → 线程
fn parse_target(raw: &str) -> anyhow::Result<UnitFilter> {
    match raw.strip_prefix("thread:") {
        Some(key) if !key.is_empty() => Ok(UnitFilter::Thread(key.to_string())),
        Some(_) => anyhow::bail!("empty thread key"),
        None => Ok(UnitFilter::Id(parse_id(raw)?)),
    }
}

/// 按空白切分，双引号内保留空格（Agent 名含空格）
pub fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut has_word = false;
    for ch in line.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                has_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if has_word {
                    words.push(std::mem::take(&mut current));
                    has_word = false;
                }
            }
            c => {
                current.push(c);
                has_word = true;
            }
        }
    }
    if has_word {
        words.push(current);
    }
    words
}
