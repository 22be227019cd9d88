//! 配额结果缓存：显式句柄，带 TTL 与手动失效

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::UsageReport;

pub struct UsageCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, UsageReport)>>,
}

impl UsageCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// 未过期的缓存结果
    pub fn get(&self, key: &str) -> Option<UsageReport> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|(stored_at, _)| stored_at.elapsed() < self.ttl)
            .map(|(_, report)| report.clone())
    }

    pub fn put(&self, key: impl Into<String>, report: UsageReport) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, (stored_at, _)| stored_at.elapsed() < self.ttl);
        entries.insert(key.into(), (Instant::now(), report));
    }

    /// 清空全部缓存，下一次 poll 必定重新请求
    pub fn invalidate(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
