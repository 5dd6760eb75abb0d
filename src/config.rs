//! 配置模块 - logwatch 规则、限额与配置文件加载

use crate::level::{
    parse_context, parse_level, ContextMode, EventLevel, DEFAULT_LEVEL_TOKEN,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 输出限额默认值，配置缺失时生效；配置为非正数表示该维度不限制
pub const DEFAULT_MAX_SIZE: i64 = 500_000;
pub const DEFAULT_MAX_ENTRIES: i64 = 5_000;
pub const DEFAULT_MAX_LINE_LENGTH: i64 = 5_000;
pub const DEFAULT_TIMEOUT_SECS: i64 = 30;

/// 单条 logwatch 规则
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogWatchEntry {
    pub name: String,
    pub level: EventLevel,
    pub context: ContextMode,
}

impl LogWatchEntry {
    pub fn new(name: impl Into<String>, level: EventLevel, context: ContextMode) -> Self {
        Self {
            name: name.into(),
            level,
            context,
        }
    }

    /// 通配默认规则（配置缺省时合成）
    pub fn default_wildcard() -> Self {
        Self::new("*", EventLevel::Off, ContextMode::Hide)
    }

    /// 解析一行规则，例如 `System: crit context`
    ///
    /// 名字部分 trim 后剥掉一层匹配的引号再 trim；为空则丢弃该条。
    /// 级别缺失时使用默认 token；解析失败不向上抛错。
    pub fn parse(line: &str) -> Option<Self> {
        let (raw_name, body) = match line.split_once(':') {
            Some((n, b)) => (n, b.trim()),
            None => (line, ""),
        };

        let name = unquote(raw_name.trim()).trim().to_string();
        if name.is_empty() {
            debug!("跳过空名字的规则 '{}'", line);
            return None;
        }

        let mut tokens = body.split_whitespace();
        let level_token = match tokens.next() {
            Some(t) => t,
            None => {
                debug!("规则 '{}' 没有级别，使用默认值 '{}'", name, DEFAULT_LEVEL_TOKEN);
                DEFAULT_LEVEL_TOKEN
            }
        };
        let context = tokens.next().map(parse_context).unwrap_or_default();

        Some(Self::new(name, parse_level(level_token), context))
    }

    fn from_mapping(name: &str, level: Option<&str>, context: bool) -> Option<Self> {
        let name = unquote(name.trim()).trim().to_string();
        if name.is_empty() {
            debug!("跳过空名字的结构化规则");
            return None;
        }
        let level = parse_level(level.unwrap_or(DEFAULT_LEVEL_TOKEN));
        let context = if context {
            ContextMode::With
        } else {
            ContextMode::Hide
        };
        Some(Self::new(name, level, context))
    }
}

/// 剥掉一层匹配的引号（`'...'` 或 `"..."`）
fn unquote(s: &str) -> &str {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// 配置文件里的规则形式：一行字符串或结构化映射
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawRule {
    Line(String),
    Map {
        name: String,
        #[serde(default)]
        level: Option<String>,
        #[serde(default)]
        context: bool,
    },
}

/// 解析后的规则集合，默认规则已解析到位
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub entries: Vec<LogWatchEntry>,
    default_index: usize,
}

impl RuleSet {
    /// 逐条加载规则，单条失败只跳过不打断整批
    pub fn load(rules: &[RawRule]) -> Self {
        let mut entries = Vec::new();
        for rule in rules {
            let entry = match rule {
                RawRule::Line(line) => LogWatchEntry::parse(line),
                RawRule::Map {
                    name,
                    level,
                    context,
                } => LogWatchEntry::from_mapping(name, level.as_deref(), *context),
            };
            match entry {
                Some(e) => entries.push(e),
                None => warn!("logwatch 规则无效，已跳过: {:?}", rule),
            }
        }
        info!("已加载 [{}] 条 logwatch 规则", entries.len());

        // 默认规则：最后一条名为 "*" 的生效；一条都没有则合成
        let default_index = match entries.iter().rposition(|e| e.name == "*") {
            Some(idx) => idx,
            None => {
                entries.push(LogWatchEntry::default_wildcard());
                entries.len() - 1
            }
        };

        Self {
            entries,
            default_index,
        }
    }

    /// 默认（通配）规则
    pub fn default_entry(&self) -> &LogWatchEntry {
        &self.entries[self.default_index]
    }
}

/// 转储限额，四个维度任一触发都会提前结束转储
#[derive(Debug, Clone, Copy)]
pub struct LogWatchLimits {
    pub max_size: i64,
    pub max_entries: i64,
    pub max_line_length: i64,
    pub timeout: i64,
    pub skip_duplicates: bool,
}

/// logwatch 配置段
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogWatchConfig {
    /// 新发现的源从头读取（同时触发已存偏移清零重放）
    pub send_all: bool,
    /// 使用结构化 journal 读取方式，主机不支持时回退到经典方式
    pub enriched_api: bool,
    /// 跳过与前一条内容相同的连续记录
    pub skip_duplicates: bool,
    /// 转储被限额截断后，把偏移推进到全量扫描末尾（丢弃未读积压）
    pub snap_to_end: bool,
    pub max_size: i64,
    pub max_entries: i64,
    pub max_line_length: i64,
    pub timeout: i64,
    pub sources: Vec<RawRule>,
}

impl Default for LogWatchConfig {
    fn default() -> Self {
        Self {
            send_all: true,
            enriched_api: true,
            skip_duplicates: false,
            snap_to_end: false,
            max_size: DEFAULT_MAX_SIZE,
            max_entries: DEFAULT_MAX_ENTRIES,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            timeout: DEFAULT_TIMEOUT_SECS,
            sources: Vec::new(),
        }
    }
}

impl LogWatchConfig {
    pub fn limits(&self) -> LogWatchLimits {
        LogWatchLimits {
            max_size: self.max_size,
            max_entries: self.max_entries,
            max_line_length: self.max_line_length,
            timeout: self.timeout,
            skip_duplicates: self.skip_duplicates,
        }
    }
}

/// 监控配置文件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// 日志源所在目录
    pub log_dir: PathBuf,
    /// 状态文件目录
    pub state_dir: PathBuf,
    pub logwatch: LogWatchConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("/var/log"),
            state_dir: default_state_dir(),
            logwatch: LogWatchConfig::default(),
        }
    }
}

/// 默认状态目录：~/.config/eventlog-monitor
fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config/eventlog-monitor")
}

/// 默认配置文件路径：~/.config/eventlog-monitor/config.yaml
pub fn default_config_path() -> PathBuf {
    default_state_dir().join("config.yaml")
}

impl MonitorConfig {
    /// 从 YAML 文件加载配置
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        Ok(config)
    }

    /// 加载配置；文件缺失或损坏时回退到默认值
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path(),
        };
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!("配置不可用（{:#}），使用默认配置", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entry_full_form() {
        let entry = LogWatchEntry::parse("System: crit context").unwrap();
        assert_eq!(entry.name, "System");
        assert_eq!(entry.level, EventLevel::Crit);
        assert_eq!(entry.context, ContextMode::With);
    }

    #[test]
    fn test_parse_entry_level_only() {
        let entry = LogWatchEntry::parse("Application: warn").unwrap();
        assert_eq!(entry.name, "Application");
        assert_eq!(entry.level, EventLevel::Warn);
        assert_eq!(entry.context, ContextMode::Hide);
    }

    #[test]
    fn test_parse_entry_missing_level_uses_default() {
        let entry = LogWatchEntry::parse("Security:").unwrap();
        assert_eq!(entry.level, EventLevel::Off);
    }

    #[test]
    fn test_parse_entry_without_colon() {
        let entry = LogWatchEntry::parse("Security").unwrap();
        assert_eq!(entry.name, "Security");
        assert_eq!(entry.level, EventLevel::Off);
    }

    #[test]
    fn test_parse_entry_quoted_name() {
        let entry = LogWatchEntry::parse("'My Log': warn").unwrap();
        assert_eq!(entry.name, "My Log");

        let entry = LogWatchEntry::parse("\" Padded \": all").unwrap();
        assert_eq!(entry.name, "Padded");
    }

    #[test]
    fn test_parse_entry_empty_name_dropped() {
        assert!(LogWatchEntry::parse(": warn").is_none());
        assert!(LogWatchEntry::parse("  : warn").is_none());
        assert!(LogWatchEntry::parse("'': warn").is_none());
    }

    #[test]
    fn test_parse_entry_unknown_context_token() {
        let entry = LogWatchEntry::parse("System: warn nocontext").unwrap();
        assert_eq!(entry.context, ContextMode::Hide);
    }

    #[test]
    fn test_ruleset_synthesizes_default() {
        let rules = vec![RawRule::Line("System: crit".to_string())];
        let set = RuleSet::load(&rules);
        assert_eq!(set.entries.len(), 2);
        assert_eq!(set.default_entry().name, "*");
        assert_eq!(set.default_entry().level, EventLevel::Off);
    }

    #[test]
    fn test_ruleset_last_wildcard_wins() {
        let rules = vec![
            RawRule::Line("*: warn".to_string()),
            RawRule::Line("System: crit".to_string()),
            RawRule::Line("*: all context".to_string()),
        ];
        let set = RuleSet::load(&rules);
        assert_eq!(set.default_entry().level, EventLevel::All);
        assert_eq!(set.default_entry().context, ContextMode::With);
    }

    #[test]
    fn test_ruleset_skips_bad_entries() {
        let rules = vec![
            RawRule::Line(": warn".to_string()),
            RawRule::Line("System: crit".to_string()),
        ];
        let set = RuleSet::load(&rules);
        // 坏条目被跳过，仍加载了其余条目并合成默认规则
        assert_eq!(set.entries.len(), 2);
        assert_eq!(set.entries[0].name, "System");
    }

    #[test]
    fn test_structured_rule_mapping() {
        let yaml = "- name: Application\n  level: crit\n  context: true\n- 'System: warn'\n";
        let rules: Vec<RawRule> = serde_yaml::from_str(yaml).unwrap();
        let set = RuleSet::load(&rules);
        assert_eq!(set.entries[0].name, "Application");
        assert_eq!(set.entries[0].level, EventLevel::Crit);
        assert_eq!(set.entries[0].context, ContextMode::With);
        assert_eq!(set.entries[1].name, "System");
        assert_eq!(set.entries[1].level, EventLevel::Warn);
    }

    #[test]
    fn test_logwatch_config_defaults() {
        let config = LogWatchConfig::default();
        assert!(config.send_all);
        assert!(config.enriched_api);
        assert!(!config.skip_duplicates);
        assert!(!config.snap_to_end);
        assert_eq!(config.max_size, DEFAULT_MAX_SIZE);
        assert_eq!(config.max_entries, DEFAULT_MAX_ENTRIES);
    }

    #[test]
    fn test_monitor_config_from_yaml() {
        let yaml = r#"
log_dir: /tmp/logs
logwatch:
  send_all: false
  max_entries: 10
  sources:
    - "System: crit"
"#;
        let config: MonitorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.log_dir, PathBuf::from("/tmp/logs"));
        assert!(!config.logwatch.send_all);
        assert_eq!(config.logwatch.max_entries, 10);
        // 未配置的限额保持默认值
        assert_eq!(config.logwatch.max_size, DEFAULT_MAX_SIZE);
        assert_eq!(config.logwatch.sources.len(), 1);
    }
}
