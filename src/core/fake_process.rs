//! 测试用进程工厂：记录每次 spawn，按预设行为或手动指令退出

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::process::{ChildProcess, ExitReport, LaunchSpec, ProcessLauncher};
use crate::core::RelayError;

/// 预设的子进程行为
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Behavior {
    /// 立即以给定退出码结束
    Exit(i32),
    /// 永不退出，只能被 kill
    Hang,
}

#[derive(Default)]
pub(crate) struct FakeLauncher {
    spawned: Mutex<Vec<LaunchSpec>>,
    fail_spawn: Mutex<HashSet<String>>,
    behaviors: Mutex<HashMap<String, VecDeque<Behavior>>>,
    default_behavior: Mutex<Option<Behavior>>,
    pending: Mutex<HashMap<String, VecDeque<oneshot::Sender<i32>>>>,
    killed: Arc<Mutex<Vec<String>>>,
}

impl FakeLauncher {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail_spawn_for(&self, label: &str) {
        self.fail_spawn.lock().unwrap().insert(label.to_string());
    }

    /// 为某个 label 的下一次 spawn 预设行为（按顺序消费）
    pub(crate) fn push_behavior(&self, label: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .entry(label.to_string())
            .or_default()
            .push_back(behavior);
    }

    pub(crate) fn set_default_behavior(&self, behavior: Behavior) {
        *self.default_behavior.lock().unwrap() = Some(behavior);
    }

    pub(crate) fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    pub(crate) fn spawned(&self) -> Vec<LaunchSpec> {
        self.spawned.lock().unwrap().clone()
    }

    pub(crate) fn killed(&self) -> Vec<String> {
        self.killed.lock().unwrap().clone()
    }

    /// 让该 label 最早一个手动控制的子进程以 code 退出
    pub(crate) fn exit(&self, label: &str, code: i32) -> bool {
        let sender = self
            .pending
            .lock()
            .unwrap()
            .get_mut(label)
            .and_then(|q| q.pop_front());
        match sender {
            Some(tx) => tx.send(code).is_ok(),
            None => false,
        }
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ChildProcess>, RelayError> {
        if self.fail_spawn.lock().unwrap().contains(&spec.label) {
            return Err(RelayError::ProcessSpawn {
                target: spec.label.clone(),
                reason: "No such file or directory (os error 2)".into(),
            });
        }
        self.spawned.lock().unwrap().push(spec.clone());

        let preset = self
            .behaviors
            .lock()
            .unwrap()
            .get_mut(&spec.label)
            .and_then(|q| q.pop_front())
            .or(*self.default_behavior.lock().unwrap());

        let state = match preset {
            Some(Behavior::Exit(code)) => ChildState::Exit(code),
            Some(Behavior::Hang) => ChildState::Hang,
            None => {
                let (tx, rx) = oneshot::channel();
                self.pending
                    .lock()
                    .unwrap()
                    .entry(spec.label.clone())
                    .or_default()
                    .push_back(tx);
                ChildState::Controlled(rx)
            }
        };

        Ok(Box::new(FakeChild {
            label: spec.label.clone(),
            state,
            killed: self.killed.clone(),
        }))
    }
}

enum ChildState {
    Exit(i32),
    Hang,
    Controlled(oneshot::Receiver<i32>),
}

struct FakeChild {
    label: String,
    state: ChildState,
    killed: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ChildProcess for FakeChild {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    async fn wait(&mut self) -> Result<ExitReport, RelayError> {
        match &mut self.state {
            ChildState::Exit(code) => Ok(ExitReport { code: Some(*code) }),
            ChildState::Hang => std::future::pending().await,
            ChildState::Controlled(rx) => match rx.await {
                Ok(code) => Ok(ExitReport { code: Some(code) }),
                Err(_) => std::future::pending().await,
            },
        }
    }

    async fn kill(&mut self) -> Result<(), RelayError> {
        self.killed.lock().unwrap().push(self.label.clone());
        Ok(())
    }
}
