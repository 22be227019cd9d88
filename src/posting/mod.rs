//! 发帖状态机
//!
//! - **types**: 排期 / 线程发布请求与发布结果
//! - **machine**: scheduled → posting → {posted | failed} 的迁移、外部发布进程调用、回滚与重试

pub mod machine;
pub mod types;

pub use machine::{PostingMachine, PostingOptions};
pub use types::{PostOutcome, PostThreadRequest, ScheduleContent, ScheduleRequest};
