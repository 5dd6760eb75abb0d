//! 源调和模块 - 持久状态、发现列表与配置的三方合并

use crate::config::{LogWatchEntry, RuleSet};
use crate::level::EventLevel;
use crate::state::{SourceState, StateSet, FROM_BEGIN};
use tracing::debug;

/// 新发现源的初始读取模式
///
/// `All` 从头读取全部历史，`Normal` 首轮跳到末尾只看增量。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    All,
    Normal,
}

/// 登记一个发现的源
///
/// 已有状态刷新为默认标志并标记出现；新源按发送模式决定初始偏移。
pub fn add_source_state(states: &mut StateSet, name: &str, send_mode: SendMode) {
    if let Some(state) = states.get_mut(name) {
        debug!("已知源 '{}'", name);
        state.reset_defaults();
        state.in_config = false;
        state.presented = true;
        return;
    }

    let pos = match send_mode {
        SendMode::All => 0,
        SendMode::Normal => FROM_BEGIN,
    };
    debug!("登记新源 '{}'，初始偏移 {}", name, pos);
    states.insert(SourceState::new(name, pos, true));
}

/// 把发现列表合并进状态集，返回处理的源数量
pub fn update_source_states(
    states: &mut StateSet,
    discovered: &[String],
    send_mode: SendMode,
) -> usize {
    for name in discovered {
        add_source_state(states, name, send_mode);
    }
    discovered.len()
}

/// 登记一条配置规则对应的源
///
/// journal API 支持打开枚举之外的源，操作员可以预先声明稍后出现的源。
pub fn add_config_entry(states: &mut StateSet, entry: &LogWatchEntry, reset_to_null: bool) {
    if let Some(state) = states.get_mut(&entry.name) {
        debug!("已知配置源 '{}'", entry.name);
        state.reset_defaults();
        state.level = entry.level;
        state.context = entry.context;
        state.in_config = true;
        state.presented = true;
        return;
    }

    let pos = if reset_to_null { 0 } else { FROM_BEGIN };
    debug!("登记配置源 '{}'，初始偏移 {}", entry.name, pos);
    let mut state = SourceState::new(entry.name.clone(), pos, true);
    state.level = entry.level;
    state.context = entry.context;
    state.in_config = true;
    states.insert(state);
}

/// 给单个状态找精确匹配的规则（忽略大小写）；重名规则后写的生效
fn apply_entry(state: &mut SourceState, entries: &[LogWatchEntry]) -> bool {
    for entry in entries.iter().rev() {
        if entry.name.eq_ignore_ascii_case(&state.name) {
            state.context = entry.context;
            state.level = entry.level;
            state.in_config = true;
            return true;
        }
    }
    false
}

/// 给所有状态套配置
///
/// 精确匹配永远优先于通配默认；没有匹配的采用默认规则的级别和上下文，
/// 但只有默认级别不是 off 时才算已配置 —— off 默认不能悄悄启用任意源。
pub fn apply_config(states: &mut StateSet, rules: &RuleSet) {
    let default_entry = rules.default_entry().clone();
    for state in states.iter_mut() {
        if apply_entry(state, &rules.entries) {
            continue;
        }
        state.context = default_entry.context;
        state.level = default_entry.level;
        if state.level != EventLevel::Off {
            state.in_config = true;
        }
    }
}
