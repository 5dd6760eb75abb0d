//! 日志源访问模块 - 经典文本与结构化 journal 两种读取方式

use crate::level::{ContextMode, EventLevel};
use regex::Regex;
use serde::Deserialize;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 日志源读取能力接口
///
/// 两种实现：经典文本读取（逐行模式分类）和结构化 journal 读取。
/// 调和与扫描引擎只依赖这个接口。
pub trait SourceReader {
    /// 源当前是否可读
    fn is_valid(&self) -> bool;

    /// 源的当前末尾位置
    fn last_position(&self) -> u64;

    /// 从偏移扫描到末尾，返回（新末尾位置，范围内见到的最高严重度）
    fn scan(&self, from: u64, min_level: EventLevel) -> (u64, EventLevel);

    /// 从偏移做转储，每行经回调发出；回调返回 false 时停止。
    /// 返回值是和实际消费一致的新位置。
    fn dump(
        &self,
        from: u64,
        min_level: EventLevel,
        context: ContextMode,
        skip_duplicates: bool,
        on_line: &mut dyn FnMut(&str) -> bool,
    ) -> u64;
}

/// 经典文本行的严重度分类器
pub struct LineClassifier {
    crit_re: Regex,
    warn_re: Regex,
}

impl LineClassifier {
    pub fn new() -> Self {
        Self {
            crit_re: Regex::new(
                r"(?i)\b(crit(ical)?|error|err|fail(ed|ure)?|fatal|panic|emerg(ency)?|alert)\b",
            )
            .unwrap(),
            warn_re: Regex::new(r"(?i)\b(warn(ing)?|deprecated|unable to|could not)\b").unwrap(),
        }
    }

    /// 按措辞分类一行文本；默认 All
    pub fn classify(&self, line: &str) -> EventLevel {
        if self.crit_re.is_match(line) {
            EventLevel::Crit
        } else if self.warn_re.is_match(line) {
            EventLevel::Warn
        } else {
            EventLevel::All
        }
    }
}

impl Default for LineClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// journal 记录的级别 token 映射到事件级别
fn record_severity(token: &str) -> EventLevel {
    match token.trim().to_lowercase().as_str() {
        "crit" | "critical" | "error" | "err" | "fatal" | "panic" | "alert" | "emerg" => {
            EventLevel::Crit
        }
        "warn" | "warning" => EventLevel::Warn,
        _ => EventLevel::All,
    }
}

/// 打开文件并定位到偏移；偏移超过文件长度时收敛到末尾
fn open_at(path: &Path, from: u64) -> std::io::Result<(BufReader<File>, u64, u64)> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    let start = from.min(len);
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(start))?;
    Ok((reader, len, start))
}

/// 解析好的一条记录，end 是文件里该记录之后的字节位置
struct SourceRecord {
    severity: EventLevel,
    /// 报告基础行（不含级别前缀和换行）
    base: String,
    /// 去重键
    message: String,
    context: Vec<String>,
    end: u64,
}

/// 把记录列表按回调推给调用方，返回消费到的位置
fn drive_dump(
    records: Vec<SourceRecord>,
    start: u64,
    min_level: EventLevel,
    context: ContextMode,
    skip_duplicates: bool,
    on_line: &mut dyn FnMut(&str) -> bool,
) -> u64 {
    let mut committed = start;
    let mut last_message: Option<String> = None;

    for rec in records {
        let duplicate = skip_duplicates && last_message.as_deref() == Some(rec.message.as_str());
        last_message = Some(rec.message.clone());

        if !duplicate && rec.severity >= min_level {
            let mut stopped = !on_line(&format!("{} {}\n", rec.severity.marker(), rec.base));
            if !stopped && context == ContextMode::With {
                for ctx in &rec.context {
                    if !on_line(&format!(". {}\n", ctx)) {
                        stopped = true;
                        break;
                    }
                }
            }
            if stopped {
                // 当前记录已整条消费
                return rec.end;
            }
        }
        committed = rec.end;
    }
    committed
}

/// 经典文本日志读取器
///
/// 一行一条记录；行首空白的行是上一条记录的补充上下文。
pub struct ClassicLogReader {
    path: PathBuf,
    classifier: LineClassifier,
}

impl ClassicLogReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            classifier: LineClassifier::new(),
        }
    }

    fn read_records(&self, from: u64) -> (Vec<SourceRecord>, u64) {
        let (reader, _len, start) = match open_at(&self.path, from) {
            Ok(v) => v,
            Err(e) => {
                warn!("打开 {} 失败: {}", self.path.display(), e);
                return (Vec::new(), from);
            }
        };

        let mut records: Vec<SourceRecord> = Vec::new();
        let mut cursor = start;
        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!("读取 {} 出错: {}", self.path.display(), e);
                    break;
                }
            };
            cursor += line.len() as u64 + 1;

            if line.trim().is_empty() {
                // 空行只推进位置
                if let Some(last) = records.last_mut() {
                    last.end = cursor;
                }
                continue;
            }

            if line.starts_with(' ') || line.starts_with('\t') {
                // 行首空白是上一条记录的上下文；开头悬空的按普通记录处理
                if let Some(last) = records.last_mut() {
                    last.context.push(line.trim().to_string());
                    last.end = cursor;
                    continue;
                }
            }

            records.push(SourceRecord {
                severity: self.classifier.classify(&line),
                message: line.clone(),
                base: line,
                context: Vec::new(),
                end: cursor,
            });
        }
        (records, start)
    }
}

impl SourceReader for ClassicLogReader {
    fn is_valid(&self) -> bool {
        self.path.is_file()
    }

    fn last_position(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    fn scan(&self, from: u64, _min_level: EventLevel) -> (u64, EventLevel) {
        let (reader, len, start) = match open_at(&self.path, from) {
            Ok(v) => v,
            Err(e) => {
                warn!("打开 {} 失败: {}", self.path.display(), e);
                return (from, EventLevel::Ignore);
            }
        };
        if start >= len {
            return (len, EventLevel::Ignore);
        }

        let mut worst = EventLevel::Ignore;
        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };
            if line.trim().is_empty() || line.starts_with(' ') || line.starts_with('\t') {
                continue;
            }
            worst = worst.max(self.classifier.classify(&line));
            if worst >= EventLevel::Crit {
                // 严重度已到顶，末尾位置来自文件长度
                break;
            }
        }
        (len, worst)
    }

    fn dump(
        &self,
        from: u64,
        min_level: EventLevel,
        context: ContextMode,
        skip_duplicates: bool,
        on_line: &mut dyn FnMut(&str) -> bool,
    ) -> u64 {
        let (records, start) = self.read_records(from);
        drive_dump(records, start, min_level, context, skip_duplicates, on_line)
    }
}

/// journal 记录的线上形式
#[derive(Debug, Deserialize)]
struct RawJournalRecord {
    ts: Option<String>,
    level: Option<String>,
    message: Option<String>,
    #[serde(default)]
    context: Vec<String>,
}

/// 结构化 journal 读取器
///
/// 一行一条 JSON 记录，级别显式给出；解析不了的行退化为模式分类。
pub struct JournalReader {
    path: PathBuf,
    classifier: LineClassifier,
}

impl JournalReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            classifier: LineClassifier::new(),
        }
    }

    /// rfc3339 时间戳规整为报告格式，解析不了就原样保留
    fn format_ts(ts: &str) -> String {
        match chrono::DateTime::parse_from_rfc3339(ts) {
            Ok(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            Err(_) => ts.to_string(),
        }
    }

    fn parse_record(&self, line: &str) -> (EventLevel, String, String, Vec<String>) {
        match serde_json::from_str::<RawJournalRecord>(line) {
            Ok(rec) => {
                let severity = rec
                    .level
                    .as_deref()
                    .map(record_severity)
                    .unwrap_or(EventLevel::All);
                let message = rec.message.unwrap_or_else(|| line.to_string());
                let base = match rec.ts.as_deref() {
                    Some(ts) => format!("{} {}", Self::format_ts(ts), message),
                    None => message.clone(),
                };
                (severity, base, message, rec.context)
            }
            Err(_) => (
                self.classifier.classify(line),
                line.to_string(),
                line.to_string(),
                Vec::new(),
            ),
        }
    }

    fn read_records(&self, from: u64) -> (Vec<SourceRecord>, u64) {
        let (reader, _len, start) = match open_at(&self.path, from) {
            Ok(v) => v,
            Err(e) => {
                warn!("打开 {} 失败: {}", self.path.display(), e);
                return (Vec::new(), from);
            }
        };

        let mut records: Vec<SourceRecord> = Vec::new();
        let mut cursor = start;
        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!("读取 {} 出错: {}", self.path.display(), e);
                    break;
                }
            };
            cursor += line.len() as u64 + 1;

            if line.trim().is_empty() {
                if let Some(last) = records.last_mut() {
                    last.end = cursor;
                }
                continue;
            }

            let (severity, base, message, context) = self.parse_record(&line);
            records.push(SourceRecord {
                severity,
                base,
                message,
                context,
                end: cursor,
            });
        }
        (records, start)
    }
}

impl SourceReader for JournalReader {
    fn is_valid(&self) -> bool {
        self.path.is_file()
    }

    fn last_position(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    fn scan(&self, from: u64, _min_level: EventLevel) -> (u64, EventLevel) {
        let (reader, len, start) = match open_at(&self.path, from) {
            Ok(v) => v,
            Err(e) => {
                warn!("打开 {} 失败: {}", self.path.display(), e);
                return (from, EventLevel::Ignore);
            }
        };
        if start >= len {
            return (len, EventLevel::Ignore);
        }

        let mut worst = EventLevel::Ignore;
        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            let (severity, _, _, _) = self.parse_record(&line);
            worst = worst.max(severity);
            if worst >= EventLevel::Crit {
                break;
            }
        }
        (len, worst)
    }

    fn dump(
        &self,
        from: u64,
        min_level: EventLevel,
        context: ContextMode,
        skip_duplicates: bool,
        on_line: &mut dyn FnMut(&str) -> bool,
    ) -> u64 {
        let (records, start) = self.read_records(from);
        drive_dump(records, start, min_level, context, skip_duplicates, on_line)
    }
}

/// 源访问 API 形态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiKind {
    Classic,
    Enriched,
}

fn journal_dir(log_dir: &Path) -> PathBuf {
    log_dir.join("journal")
}

/// 日志源访问入口
///
/// API 形态在配置加载时决定一次；后续调和与扫描都只经过这里。
pub struct SourceAccess {
    log_dir: PathBuf,
    api: ApiKind,
}

impl SourceAccess {
    /// 按配置选择 API；配置要求 journal 但主机没有 journal 目录时回退经典方式
    pub fn new(log_dir: impl Into<PathBuf>, want_enriched: bool) -> Self {
        let log_dir = log_dir.into();
        let api = if want_enriched {
            if journal_dir(&log_dir).is_dir() {
                ApiKind::Enriched
            } else {
                debug!("配置要求 journal API，但主机上不可用，回退经典方式");
                ApiKind::Classic
            }
        } else {
            ApiKind::Classic
        };
        Self { log_dir, api }
    }

    pub fn api(&self) -> ApiKind {
        self.api
    }

    /// journal API 支持打开枚举之外（预先声明、稍后出现）的源
    pub fn supports_unlisted(&self) -> bool {
        self.api == ApiKind::Enriched
    }

    fn stems_in(dir: &Path, ext: &str) -> Vec<String> {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };
        let mut names = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(ext) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names
    }

    /// 枚举当前可用的源名字，排序去重（忽略大小写）
    pub fn list_sources(&self) -> Vec<String> {
        let mut names = Self::stems_in(&self.log_dir, "log");
        if self.api == ApiKind::Enriched {
            names.extend(Self::stems_in(&journal_dir(&self.log_dir), "jsonl"));
        }
        names.sort_by_key(|n| n.to_lowercase());
        names.dedup_by(|a, b| a.to_lowercase() == b.to_lowercase());
        names
    }

    /// 打开一个源
    ///
    /// 经典方式只允许打开枚举里出现的源；journal 方式优先结构化记录文件，
    /// 没有时退回同名文本文件。打不开返回 None，由调用方按缺失处理。
    pub fn open(&self, name: &str) -> Option<Box<dyn SourceReader>> {
        match self.api {
            ApiKind::Classic => {
                let actual = self
                    .list_sources()
                    .into_iter()
                    .find(|s| s.eq_ignore_ascii_case(name));
                let actual = match actual {
                    Some(a) => a,
                    None => {
                        debug!("源 '{}' 不在枚举列表里", name);
                        return None;
                    }
                };
                let reader = ClassicLogReader::new(self.log_dir.join(format!("{}.log", actual)));
                if reader.is_valid() {
                    Some(Box::new(reader))
                } else {
                    None
                }
            }
            ApiKind::Enriched => {
                let dir = journal_dir(&self.log_dir);
                let journal_name = Self::stems_in(&dir, "jsonl")
                    .into_iter()
                    .find(|s| s.eq_ignore_ascii_case(name));
                if let Some(actual) = journal_name {
                    let reader = JournalReader::new(dir.join(format!("{}.jsonl", actual)));
                    if reader.is_valid() {
                        return Some(Box::new(reader));
                    }
                }
                // 没有结构化记录文件时退回文本文件
                let classic_name = Self::stems_in(&self.log_dir, "log")
                    .into_iter()
                    .find(|s| s.eq_ignore_ascii_case(name))?;
                let reader = JournalReader::new(self.log_dir.join(format!("{}.log", classic_name)));
                if reader.is_valid() {
                    Some(Box::new(reader))
                } else {
                    None
                }
            }
        }
    }

    /// off 级别源刷新偏移用的末尾位置
    pub fn last_position(&self, name: &str) -> Option<u64> {
        self.open(name).map(|r| r.last_position())
    }
}
