//! Relay 命令行入口
//!
//! 一次性命令直接执行并输出 JSON；`start` / `start-all` 会在前台监管到进程全部退出或收到 Ctrl+C；
//! `serve` 启动全部 Agent 后从标准输入读取命令，直到 quit / EOF / 关闭信号。

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use relay::app::{split_words, App, USAGE};
use relay::config::load_config;
use relay::core::{run_until_shutdown, ShutdownCoordinator, ShutdownManager, SupervisorCleanup};
use relay::supervisor::{StartOutcome, SupervisorEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relay::observability::init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = take_flag(&mut args, "--config").map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;
    let app = App::open(config).context("Failed to initialize relay")?;
    app.supervisor.reconcile_registry().await;

    let words: Vec<&str> = args.iter().map(String::as_str).collect();
    match words.as_slice() {
        [] | ["help"] | ["--help"] | ["-h"] => {
            println!("{USAGE}");
            Ok(())
        }
        ["serve"] => serve(&app).await,
        ["start", ..] | ["start-all"] => run_foreground(&app, &words).await,
        _ => {
            let value = app.execute(&words).await?;
            print_json(&value);
            Ok(())
        }
    }
}

/// 取出 `--flag value`
fn take_flag(args: &mut Vec<String>, flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    if pos + 1 >= args.len() {
        args.remove(pos);
        return None;
    }
    let value = args.remove(pos + 1);
    args.remove(pos);
    Some(value)
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("error: {e}"),
    }
}

fn coordinator(app: &App) -> ShutdownCoordinator {
    let grace = Duration::from_secs(app.config.supervisor.shutdown_grace_secs);
    let manager = ShutdownManager::new();
    manager.install_signal_handlers();
    let mut coordinator = ShutdownCoordinator::new(manager).with_timeout(grace + Duration::from_secs(5));
    coordinator.register(SupervisorCleanup::new(app.supervisor.clone(), grace));
    coordinator
}

/// 启动后在前台等待，直到本次启动的 Agent 全部退出
async fn run_foreground(app: &App, words: &[&str]) -> anyhow::Result<()> {
    let mut events = app.supervisor.subscribe();
    let pending = match words {
        ["start-all"] => {
            let report = app.supervisor.start_all().await;
            print_json(&serde_json::to_value(&report)?);
            report.started.len() + report.queued.len()
        }
        ["start", agent] => {
            let outcome = app.supervisor.start(agent).await?;
            print_json(&serde_json::to_value(&outcome)?);
            usize::from(matches!(outcome, StartOutcome::Started { .. }))
        }
        _ => anyhow::bail!("usage: start <agent> | start-all"),
    };
    if pending == 0 {
        return Ok(());
    }

    let coordinator = coordinator(app);
    let reason = run_until_shutdown(&coordinator, async move {
        let mut remaining = pending;
        while remaining > 0 {
            match events.recv().await {
                Ok(event) => {
                    if matches!(
                        event,
                        SupervisorEvent::Exited { .. }
                            | SupervisorEvent::QueuedStartFailed { .. }
                            | SupervisorEvent::QueuedSkipped { .. }
                    ) {
                        remaining -= 1;
                    }
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
    .await;
    tracing::info!(%reason, "relay finished");
    Ok(())
}

/// 常驻模式：修正遗留状态、启动全部 Agent，并从 stdin 读取命令
async fn serve(app: &App) -> anyhow::Result<()> {
    let fixed = app
        .supervisor
        .reconcile_orphans()
        .await
        .context("Failed to reconcile agent status")?;
    if !fixed.is_empty() {
        tracing::info!(agents = ?fixed, "reset stale running status");
    }

    let mut events = app.supervisor.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let line = serde_json::to_string(&event).unwrap_or_default();
                    tracing::info!(event = %line, "supervisor event");
                }
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let report = app.supervisor.start_all().await;
    print_json(&serde_json::to_value(&report)?);

    let coordinator = coordinator(app);
    let reason = run_until_shutdown(&coordinator, async {
        let mut lines = stdin_lines();
        while let Some(line) = lines.recv().await {
            let words = split_words(&line);
            let refs: Vec<&str> = words.iter().map(String::as_str).collect();
            match refs.as_slice() {
                [] => continue,
                ["quit"] | ["exit"] => break,
                ["help"] => println!("{USAGE}"),
                _ => match app.execute(&refs).await {
                    Ok(value) => print_json(&value),
                    Err(e) => eprintln!("error: {e:#}"),
                },
            }
        }
    })
    .await;
    tracing::info!(%reason, "relay stopped");
    Ok(())
}

/// 独立线程读 stdin，关闭时不会阻塞运行时退出
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    read_lines(std::io::BufReader::new(std::io::stdin()))
}

fn read_lines<R>(reader: R) -> mpsc::UnboundedReceiver<String>
where
    R: std::io::BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in reader.lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("stdin read failed: {}", e);
                    break;
                }
            }
        }
    });
    rx
}
