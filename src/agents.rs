//! 固定 Agent 注册表：显示名 → 工作脚本
//!
//! 顺序即流水线顺序（抓取 → 热点 → 调研 → 写作 → 评审 → 转推文 → 发布 → 回复），start_all 按此顺序启动与排队。

use std::path::PathBuf;

use crate::config::SupervisorSection;
use crate::core::LaunchSpec;

/// 默认注册表
pub const DEFAULT_AGENTS: [(&str, &str); 8] = [
    ("Tweet Scraping Agent", "2_langchain_tweet_scraping_agent.py"),
    ("Hot Topic Agent", "3.5_langchain_hot_topic_agent.py"),
    ("Tweet Research Agent", "3_langchain_tweet_research_agent.py"),
    ("Blog Writing Agent", "4_langchain_blog_writing_agent.py"),
    ("Blog Critique Agent", "4_langchain_blog_critique_agent.py"),
    ("Blog to Tweet Agent", "5_langchain_blog_to_tweet_agent.py"),
    ("Twitter Posting Agent", "7_langchain_twitter_posting_agent_v3.py"),
    ("X Reply Agent", "6_langchain_x_reply_agent_simple.py"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEntry {
    pub name: String,
    pub script: String,
}

/// Agent 注册表：名字唯一，决定每个 Agent 如何启动
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    interpreter: String,
    scripts_dir: PathBuf,
    entries: Vec<AgentEntry>,
}

impl AgentRegistry {
    pub fn new(
        interpreter: impl Into<String>,
        scripts_dir: impl Into<PathBuf>,
        entries: Vec<AgentEntry>,
    ) -> Self {
        let mut unique: Vec<AgentEntry> = Vec::with_capacity(entries.len());
        for entry in entries {
            if unique.iter().any(|e| e.name == entry.name) {
                tracing::warn!(agent = %entry.name, "duplicate registry entry ignored");
                continue;
            }
            unique.push(entry);
        }
        Self {
            interpreter: interpreter.into(),
            scripts_dir: scripts_dir.into(),
            entries: unique,
        }
    }

    /// 默认 8 个 Agent，解释器与脚本目录取自配置
    pub fn from_config(cfg: &SupervisorSection) -> Self {
        let entries = DEFAULT_AGENTS
            .iter()
            .map(|(name, script)| AgentEntry {
                name: name.to_string(),
                script: script.to_string(),
            })
            .collect();
        Self::new(cfg.interpreter.clone(), cfg.scripts_dir.clone(), entries)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `<interpreter> <scripts_dir>/<script>`
    pub fn launch_spec(&self, name: &str) -> Option<LaunchSpec> {
        self.entries.iter().find(|e| e.name == name).map(|e| {
            let script = self.scripts_dir.join(&e.script);
            LaunchSpec::new(&e.name, &self.interpreter).arg(script.to_string_lossy())
        })
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::from_config(&SupervisorSection::default())
    }
}
