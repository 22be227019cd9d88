//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RELAY__*` 覆盖（双下划线表示嵌套，如 `RELAY__SUPERVISOR__MAX_CONCURRENT_AGENTS=2`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub posting: PostingSection,
    #[serde(default)]
    pub usage: UsageSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    /// SQLite 文件路径
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/relay.db")
}

/// [supervisor] 段：并发上限、自动重启、Agent 脚本位置
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSection {
    #[serde(default = "default_max_concurrent_agents")]
    pub max_concurrent_agents: usize,
    /// 错误退出后是否自动重启一次
    #[serde(default = "default_true")]
    pub enable_auto_restart: bool,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,
    /// 关机时等待 Agent 退出的秒数
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// 自动重启前的等待
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            max_concurrent_agents: default_max_concurrent_agents(),
            enable_auto_restart: true,
            interpreter: default_interpreter(),
            scripts_dir: default_scripts_dir(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            restart_delay_ms: default_restart_delay_ms(),
        }
    }
}

fn default_restart_delay_ms() -> u64 {
    1000
}

fn default_max_concurrent_agents() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("agents")
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

/// 线程发布失败后的回滚目标，对全部成员统一生效
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RollbackPolicy {
    /// 终态，需新建单元重发
    #[default]
    Failed,
    /// 回到 scheduled，允许重试
    Scheduled,
}

/// [posting] 段：发布进程、截止时间、回滚策略
#[derive(Debug, Clone, Deserialize)]
pub struct PostingSection {
    #[serde(default = "default_interpreter")]
    pub publisher_program: String,
    #[serde(default = "default_publisher_args")]
    pub publisher_args: Vec<String>,
    #[serde(default = "default_single_deadline_secs")]
    pub single_deadline_secs: u64,
    #[serde(default = "default_thread_deadline_secs")]
    pub thread_deadline_secs: u64,
    #[serde(default)]
    pub rollback_policy: RollbackPolicy,
    /// 终态/回滚写入失败后的重试次数（至少 1）
    #[serde(default = "default_persistence_retries")]
    pub persistence_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for PostingSection {
    fn default() -> Self {
        Self {
            publisher_program: default_interpreter(),
            publisher_args: default_publisher_args(),
            single_deadline_secs: default_single_deadline_secs(),
            thread_deadline_secs: default_thread_deadline_secs(),
            rollback_policy: RollbackPolicy::default(),
            persistence_retries: default_persistence_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_publisher_args() -> Vec<String> {
    vec!["agents/7_langchain_twitter_posting_agent_v3.py".to_string()]
}

fn default_single_deadline_secs() -> u64 {
    30
}

fn default_thread_deadline_secs() -> u64 {
    120
}

fn default_persistence_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

/// [usage] 段：配额 API 与缓存
#[derive(Debug, Clone, Deserialize)]
pub struct UsageSection {
    pub base_url: Option<String>,
    pub api_token: Option<String>,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_usage_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for UsageSection {
    fn default() -> Self {
        Self {
            base_url: None,
            api_token: None,
            cache_ttl_secs: default_cache_ttl_secs(),
            timeout_secs: default_usage_timeout_secs(),
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_usage_timeout_secs() -> u64 {
    10
}

/// 从 config 目录加载配置，环境变量 RELAY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RELAY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RELAY")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
