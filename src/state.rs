//! 状态存储模块 - 每个日志源的读取偏移持久化

use crate::level::{ContextMode, EventLevel};
use anyhow::Result;
use fs2::FileExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// "未初始化" 偏移哨兵：首次读取时跳到当前末尾，不回放历史
pub const FROM_BEGIN: u64 = u64::MAX;

/// 单个日志源的轮询状态
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SourceState {
    pub name: String,
    /// 读取偏移，或 [`FROM_BEGIN`] 哨兵
    pub position: u64,
    /// 本轮发现列表里是否出现
    pub presented: bool,
    /// 是否有生效的配置规则（级别非 off）
    pub in_config: bool,
    pub level: EventLevel,
    pub context: ContextMode,
}

impl SourceState {
    pub fn new(name: impl Into<String>, position: u64, presented: bool) -> Self {
        Self {
            name: name.into(),
            position,
            presented,
            in_config: false,
            level: EventLevel::Off,
            context: ContextMode::Hide,
        }
    }

    /// 重置为默认级别/上下文，配置应用阶段会重新覆盖
    pub fn reset_defaults(&mut self) {
        self.level = EventLevel::Off;
        self.context = ContextMode::Hide;
    }
}

/// 状态集合
///
/// 内部按大小写折叠后的名字索引，精确匹配只需一次查找；
/// 持久化和输出边界暴露按名字排序的视图。
#[derive(Debug, Clone, Default)]
pub struct StateSet {
    states: BTreeMap<String, SourceState>,
}

fn fold(name: &str) -> String {
    name.to_lowercase()
}

impl StateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn get(&self, name: &str) -> Option<&SourceState> {
        self.states.get(&fold(name))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut SourceState> {
        self.states.get_mut(&fold(name))
    }

    /// 插入状态；同名（忽略大小写）状态被替换
    pub fn insert(&mut self, state: SourceState) {
        self.states.insert(fold(&state.name), state);
    }

    /// 按名字排序的视图
    pub fn iter(&self) -> impl Iterator<Item = &SourceState> {
        self.states.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SourceState> {
        self.states.values_mut()
    }
}

/// 解析一行状态，例如 `System|1234`
///
/// 两段都必须非空且偏移是非负整数，否则整行跳过。
fn parse_state_line(line: &str) -> Option<(String, u64)> {
    let parts: Vec<&str> = line.split('|').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        warn!("状态行无效: {}", line);
        return None;
    }
    match parts[1].trim().parse::<u64>() {
        Ok(pos) => Some((parts[0].to_string(), pos)),
        Err(_) => {
            warn!("状态行偏移无效: {}", line);
            None
        }
    }
}

/// 状态文件存储
///
/// 同一台机器上一次性 CLI 与后台 watch 循环可能并发访问状态文件，
/// 读写都持建议性文件锁。
pub struct StateStore {
    state_dir: PathBuf,
}

impl StateStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        let _ = fs::create_dir_all(&state_dir);
        Self { state_dir }
    }

    /// 状态文件候选链：端点专属文件优先于通用文件
    pub fn state_file_candidates(&self, endpoint: Option<&str>) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(endpoint) = endpoint {
            let sanitized: String = endpoint
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                        c
                    } else {
                        '_'
                    }
                })
                .collect();
            if !sanitized.is_empty() {
                candidates.push(self.state_dir.join(format!("eventstate_{}.txt", sanitized)));
            }
        }
        candidates.push(self.state_dir.join("eventstate.txt"));
        candidates
    }

    /// 获取状态目录的建议性排他锁；失败时降级为无锁访问
    fn acquire_lock(&self) -> Option<File> {
        let path = self.state_dir.join("eventstate.lock");
        let result: Result<File> = (|| {
            let file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(path)?;
            file.lock_exclusive()?;
            Ok(file)
        })();
        match result {
            Ok(file) => Some(file),
            Err(e) => {
                warn!("状态锁获取失败（{}），继续无锁访问", e);
                None
            }
        }
    }

    /// 从候选链加载状态
    ///
    /// 第一个产出有效状态的文件胜出；`reset_positions` 把所有偏移清零，
    /// 用于操作员要求的全量重放。没有文件可用时返回空集合。
    pub fn load(&self, candidates: &[PathBuf], reset_positions: bool) -> StateSet {
        let lock = self.acquire_lock();

        for path in candidates {
            let file = match File::open(path) {
                Ok(f) => f,
                Err(_) => continue,
            };

            let mut states = StateSet::new();
            for line in BufReader::new(file).lines() {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        warn!("读取状态文件 {} 出错: {}", path.display(), e);
                        break;
                    }
                };
                let line = line.trim_end_matches('\r');
                if line.is_empty() {
                    continue;
                }
                if let Some((name, pos)) = parse_state_line(line) {
                    let pos = if reset_positions { 0 } else { pos };
                    states.insert(SourceState::new(name, pos, false));
                }
            }

            if !states.is_empty() {
                debug!("从 {} 加载了 {} 条状态", path.display(), states.len());
                if let Some(f) = &lock {
                    let _ = f.unlock();
                }
                return states;
            }
        }

        if let Some(f) = &lock {
            let _ = f.unlock();
        }
        StateSet::new()
    }

    /// 保存状态到目标文件（截断写）
    ///
    /// 通配 "*" 条目不落盘。打开或写入失败只记日志并放弃本轮保存，
    /// 绝不让持久化失败打断轮询。
    pub fn save(&self, path: &Path, states: &StateSet) {
        let lock = self.acquire_lock();

        if let Err(e) = self.save_inner(path, states) {
            warn!("写状态文件 {} 失败: {}", path.display(), e);
        }

        if let Some(f) = &lock {
            let _ = f.unlock();
        }
    }

    fn save_inner(&self, path: &Path, states: &StateSet) -> Result<()> {
        let mut file = File::create(path)?;
        for state in states.iter() {
            if state.name == "*" {
                continue;
            }
            // 名字里不允许出现分隔符，持久化格式无法表达
            if state.name.contains('|') {
                warn!("状态名含 '|'，跳过持久化: {}", state.name);
                continue;
            }
            writeln!(file, "{}|{}", state.name, state.position)?;
        }
        Ok(())
    }
}
