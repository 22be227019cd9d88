//! 核心基础设施：错误分类、并发闸门、外部进程抽象、优雅关闭

pub mod capacity;
pub mod error;
pub mod process;
pub mod shutdown;

#[cfg(test)]
pub(crate) mod fake_process;

pub use capacity::CapacityGate;
pub use error::{ErrorKind, Failure, RelayError};
pub use process::{
    wait_with_deadline, ChildProcess, CommandLauncher, ExitReport, LaunchSpec, ProcessLauncher,
};
pub use shutdown::{
    run_until_shutdown, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
    SupervisorCleanup,
};
