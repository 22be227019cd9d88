//! API 配额追踪
//!
//! 轮询配额接口（Bearer token），把每个 endpoint 的用量归入 normal / warning / critical 区间。
//! 缺少凭据、网络错误、非 2xx、响应格式不对时一律退回合成数据，并在报告与每个窗口上标记 is_mock 与原因。

mod cache;

use std::time::Duration;

use chrono::{DateTime, Days, NaiveDate, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::UsageSection;

pub use cache::UsageCache;

const WARNING_PERCENT: f64 = 70.0;
const CRITICAL_PERCENT: f64 = 90.0;

/// 合成数据：(endpoint, 已用, 配额)
const MOCK_WINDOWS: [(&str, u64, u64); 4] = [
    ("POST /2/tweets", 120, 300),
    ("GET /2/users/me", 40, 75),
    ("GET /2/tweets/search/recent", 380, 450),
    ("client-app", 1520, 0),
];

/// 用量区间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageBand {
    Normal,
    Warning,
    Critical,
    /// 配额为 0：只显示原始计数
    Unbounded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUsage {
    pub date: NaiveDate,
    pub count: u64,
}

/// 单个 endpoint 的配额窗口
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageWindow {
    pub endpoint: String,
    pub requests_made: u64,
    pub quota: u64,
    #[serde(default)]
    pub reset_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub daily_usage: Vec<DailyUsage>,
    #[serde(default)]
    pub is_mock: bool,
    #[serde(default)]
    pub mock_reason: Option<String>,
}

impl UsageWindow {
    /// 已用百分比；配额为 0 时为 None
    pub fn percentage(&self) -> Option<f64> {
        if self.quota == 0 {
            return None;
        }
        Some(self.requests_made as f64 / self.quota as f64 * 100.0)
    }

    pub fn band(&self) -> UsageBand {
        match self.percentage() {
            None => UsageBand::Unbounded,
            Some(p) if p >= CRITICAL_PERCENT => UsageBand::Critical,
            Some(p) if p >= WARNING_PERCENT => UsageBand::Warning,
            Some(_) => UsageBand::Normal,
        }
    }
}

/// 一次 poll 的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReport {
    pub windows: Vec<UsageWindow>,
    pub is_mock: bool,
    pub reason: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct UsagePayload {
    endpoints: Vec<UsageWindow>,
}

/// 配额追踪器
pub struct UsageTracker {
    client: Client,
    base_url: Option<String>,
    api_token: Option<String>,
    cache: UsageCache,
}

impl UsageTracker {
    pub fn new(cfg: &UsageSection) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: cfg.base_url.clone().filter(|s| !s.trim().is_empty()),
            api_token: cfg.api_token.clone().filter(|s| !s.trim().is_empty()),
            cache: UsageCache::new(Duration::from_secs(cfg.cache_ttl_secs)),
        }
    }

    pub fn cache(&self) -> &UsageCache {
        &self.cache
    }

    /// 查询指定 endpoint 的用量，空切片表示全部；结果按 TTL 缓存
    pub async fn poll(&self, endpoints: &[&str]) -> UsageReport {
        let key = cache_key(endpoints);
        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!(key = %key, "usage cache hit");
            return hit;
        }

        let report = match self.fetch(endpoints).await {
            Ok(windows) => UsageReport {
                windows,
                is_mock: false,
                reason: None,
                fetched_at: Utc::now(),
            },
            Err(reason) => {
                tracing::warn!(reason = %reason, "usage API unavailable, using mock data");
                mock_report(endpoints, reason)
            }
        };
        self.cache.put(key, report.clone());
        report
    }

    async fn fetch(&self, endpoints: &[&str]) -> Result<Vec<UsageWindow>, String> {
        let (Some(url), Some(token)) = (&self.base_url, &self.api_token) else {
            return Err("API credentials not configured".to_string());
        };
        let resp = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let payload: UsagePayload = resp
            .json()
            .await
            .map_err(|e| format!("malformed payload: {}", e))?;

        let mut windows = payload.endpoints;
        if !endpoints.is_empty() {
            windows.retain(|w| endpoints.contains(&w.endpoint.as_str()));
        }
        Ok(windows)
    }
}

fn cache_key(endpoints: &[&str]) -> String {
    if endpoints.is_empty() {
        return "*".to_string();
    }
    let mut sorted: Vec<&str> = endpoints.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.join(",")
}

/// 合成数据集；每个窗口都带上原因
fn mock_report(endpoints: &[&str], reason: String) -> UsageReport {
    let now = Utc::now();
    let known: Vec<(String, u64, u64)> = MOCK_WINDOWS
        .iter()
        .map(|(e, made, quota)| (e.to_string(), *made, *quota))
        .collect();
    let selected: Vec<(String, u64, u64)> = if endpoints.is_empty() {
        known
    } else {
        endpoints
            .iter()
            .map(|e| {
                known
                    .iter()
                    .find(|(name, _, _)| name == e)
                    .cloned()
                    .unwrap_or_else(|| (e.to_string(), 0, 0))
            })
            .collect()
    };

    let windows = selected
        .into_iter()
        .map(|(endpoint, requests_made, quota)| UsageWindow {
            daily_usage: mock_daily(now.date_naive(), requests_made),
            endpoint,
            requests_made,
            quota,
            reset_time: Some(now + chrono::Duration::minutes(15)),
            is_mock: true,
            mock_reason: Some(reason.clone()),
        })
        .collect();

    UsageReport {
        windows,
        is_mock: true,
        reason: Some(reason),
        fetched_at: now,
    }
}

/// 最近 7 天的平摊计数，余数记在今天
fn mock_daily(today: NaiveDate, total: u64) -> Vec<DailyUsage> {
    let per_day = total / 7;
    (0..7u64)
        .rev()
        .filter_map(|back| {
            let date = today.checked_sub_days(Days::new(back))?;
            let count = if back == 0 { total - per_day * 6 } else { per_day };
            Some(DailyUsage { date, count })
        })
        .collect()
}
