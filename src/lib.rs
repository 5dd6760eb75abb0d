//! Event Log Monitor - 主机日志源监控与增量报告

pub mod config;
pub mod engine;
pub mod level;
pub mod reconcile;
pub mod source;
pub mod state;

pub use config::{
    default_config_path, LogWatchConfig, LogWatchEntry, LogWatchLimits, MonitorConfig, RawRule,
    RuleSet,
};
pub use engine::LogWatchEngine;
pub use level::{parse_context, parse_level, ContextMode, EventLevel};
pub use reconcile::SendMode;
pub use source::{ApiKind, ClassicLogReader, JournalReader, SourceAccess, SourceReader};
pub use state::{SourceState, StateSet, StateStore, FROM_BEGIN};
