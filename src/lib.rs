//! Relay - 内容流水线运维核心
//!
//! 模块划分：
//! - **agents**: 固定 Agent 注册表（显示名 → 工作脚本）
//! - **app**: 组装与命令分发（CLI / serve 共用）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、并发闸门、外部进程抽象、优雅关闭
//! - **observability**: 日志
//! - **posting**: 发帖状态机（scheduled → posting → posted / failed）
//! - **store**: 状态与发帖单元持久化（SQLite）
//! - **supervisor**: Agent 进程监管
//! - **usage**: API 配额追踪

pub mod agents;
pub mod app;
pub mod config;
pub mod core;
pub mod observability;
pub mod posting;
pub mod store;
pub mod supervisor;
pub mod usage;

pub use app::App;
pub use core::{ErrorKind, RelayError};
pub use supervisor::Supervisor;
