//! 事件级别模块 - 级别枚举与上下文模式

use serde::{Deserialize, Serialize};
use tracing::debug;

/// 未配置级别时使用的默认 token
pub const DEFAULT_LEVEL_TOKEN: &str = "off";

/// 事件级别
///
/// `Ignore` 和 `Off` 是控制状态，不参与记录严重度比较；
/// 真正的过滤顺序只在 `All < Warn < Crit` 之间成立。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Ignore,
    Off,
    All,
    Warn,
    Crit,
}

impl EventLevel {
    /// 报告行使用的级别前缀字符
    pub fn marker(&self) -> char {
        match self {
            EventLevel::Crit => 'C',
            EventLevel::Warn => 'W',
            _ => 'O',
        }
    }
}

impl std::fmt::Display for EventLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventLevel::Ignore => "ignore",
            EventLevel::Off => "off",
            EventLevel::All => "all",
            EventLevel::Warn => "warn",
            EventLevel::Crit => "crit",
        };
        write!(f, "{}", s)
    }
}

/// 解析级别 token，无法识别时回退到 `off`
pub fn parse_level(token: &str) -> EventLevel {
    match token.trim().to_lowercase().as_str() {
        "ignore" => EventLevel::Ignore,
        "off" => EventLevel::Off,
        "all" => EventLevel::All,
        "warn" => EventLevel::Warn,
        "crit" => EventLevel::Crit,
        other => {
            debug!("级别 '{}' 不可识别，回退到 off", other);
            EventLevel::Off
        }
    }
}

/// 上下文模式 - 匹配记录是否携带补充上下文行
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    #[default]
    Hide,
    With,
}

/// 解析上下文 token，只有 `context` 表示携带上下文
pub fn parse_context(token: &str) -> ContextMode {
    if token.trim().eq_ignore_ascii_case("context") {
        ContextMode::With
    } else {
        ContextMode::Hide
    }
}
