//! 并发上限：Semaphore 限制同时运行的 Agent 进程数
//!
//! `try_acquire` 非阻塞，满员立即返回 Capacity；`acquire` 排队等待（start_all 使用）。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::RelayError;

/// 进程槽位闸门，permit 被 drop 即释放槽位
#[derive(Debug, Clone)]
pub struct CapacityGate {
    semaphore: Arc<Semaphore>,
    ceiling: usize,
}

impl CapacityGate {
    pub fn new(ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(ceiling)),
            ceiling,
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// 当前占用的槽位数
    pub fn in_use(&self) -> usize {
        self.ceiling - self.semaphore.available_permits()
    }

    /// 非阻塞获取槽位
    pub fn try_acquire(&self) -> Result<OwnedSemaphorePermit, RelayError> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| RelayError::Capacity {
                running: self.in_use(),
                ceiling: self.ceiling,
            })
    }

    /// 排队等待槽位；闸门关闭（关机）时返回 Capacity
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, RelayError> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RelayError::Capacity {
                running: self.in_use(),
                ceiling: self.ceiling,
            })
    }

    /// 关闭闸门，唤醒所有排队者并令其失败
    pub fn close(&self) {
        self.semaphore.close();
    }
}

impl Default for CapacityGate {
    fn default() -> Self {
        Self::new(3)
    }
}
