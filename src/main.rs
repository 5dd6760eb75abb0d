//! Event Log Monitor CLI
//!
//! 发现主机上的日志源，跟踪每个源的读取偏移，按规则过滤，
//! 输出自上次轮询以来的增量报告

use anyhow::Result;
use clap::{Parser, Subcommand};
use eventlog_monitor::{LogWatchEngine, MonitorConfig, SourceAccess};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "evmon")]
#[command(about = "Event Log Monitor - 主机日志源监控与增量报告")]
#[command(version)]
struct Cli {
    /// 配置文件路径（默认 ~/.config/eventlog-monitor/config.yaml）
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 执行一轮轮询并输出报告
    Poll {
        /// 端点标识，决定使用哪个专属状态文件
        #[arg(long)]
        endpoint: Option<String>,
        /// 清零已存偏移，全量重放
        #[arg(long)]
        reset: bool,
    },
    /// 周期轮询，每轮输出一份报告
    Watch {
        /// 轮询间隔（秒）
        #[arg(long, short, default_value = "60")]
        interval: u64,
        /// 端点标识
        #[arg(long)]
        endpoint: Option<String>,
    },
    /// 列出发现的日志源及生效的规则
    Sources {
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
    /// 查看持久化的读取偏移
    State {
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
        /// 端点标识
        #[arg(long)]
        endpoint: Option<String>,
    },
}

/// sources 子命令的展示条目
#[derive(Serialize)]
struct SourceView {
    name: String,
    level: String,
    context: String,
    in_config: bool,
}

fn source_views(config: &MonitorConfig) -> Vec<SourceView> {
    use eventlog_monitor::{ContextMode, EventLevel, RuleSet};

    let access = SourceAccess::new(&config.log_dir, config.logwatch.enriched_api);
    let rules = RuleSet::load(&config.logwatch.sources);

    access
        .list_sources()
        .into_iter()
        .map(|name| {
            // 精确匹配优先于通配默认，重名规则后写的生效
            let entry = rules
                .entries
                .iter()
                .rev()
                .find(|e| e.name.eq_ignore_ascii_case(&name))
                .unwrap_or_else(|| rules.default_entry());
            let in_config = entry.name != "*" || entry.level != EventLevel::Off;
            SourceView {
                name,
                level: entry.level.to_string(),
                context: match entry.context {
                    ContextMode::With => "context".to_string(),
                    ContextMode::Hide => "hide".to_string(),
                },
                in_config,
            }
        })
        .collect()
}

fn main() -> Result<()> {
    // 初始化 tracing 日志系统，RUST_LOG 控制级别，默认 info
    // 日志写到 stderr，报告正文走 stdout
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("eventlog_monitor=info,evmon=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    let config = MonitorConfig::load_or_default(cli.config.as_deref());

    match cli.command {
        Commands::Poll { endpoint, reset } => {
            let engine = LogWatchEngine::new(&config);
            let report = engine.poll(endpoint.as_deref(), reset);
            print!("{}", report);
        }
        Commands::Watch { interval, endpoint } => {
            let engine = LogWatchEngine::new(&config);
            info!("开始周期轮询，间隔 {} 秒", interval);
            loop {
                let report = engine.poll(endpoint.as_deref(), false);
                print!("{}", report);
                std::thread::sleep(std::time::Duration::from_secs(interval));
            }
        }
        Commands::Sources { json } => {
            let views = source_views(&config);
            if json {
                println!("{}", serde_json::to_string_pretty(&views)?);
            } else {
                println!("发现 {} 个日志源:\n", views.len());
                for view in views {
                    println!(
                        "  {} | 级别: {} | 上下文: {} | 已配置: {}",
                        view.name, view.level, view.context, view.in_config
                    );
                }
            }
        }
        Commands::State { json, endpoint } => {
            let store = eventlog_monitor::StateStore::new(&config.state_dir);
            let candidates = store.state_file_candidates(endpoint.as_deref());
            let states = store.load(&candidates, false);

            if json {
                let all: Vec<_> = states.iter().collect();
                println!("{}", serde_json::to_string_pretty(&all)?);
            } else {
                println!("已存 {} 条源状态:\n", states.len());
                for state in states.iter() {
                    println!("  {}|{}", state.name, state.position);
                }
            }
        }
    }

    Ok(())
}
