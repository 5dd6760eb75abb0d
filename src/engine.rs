//! 扫描引擎模块 - 按状态读取日志源、汇编报告并驱动持久化

use crate::config::{LogWatchLimits, MonitorConfig, RuleSet};
use crate::level::EventLevel;
use crate::reconcile::{add_config_entry, apply_config, update_source_states, SendMode};
use crate::source::{SourceAccess, SourceReader};
use crate::state::{SourceState, StateSet, StateStore, FROM_BEGIN};
use std::time::Instant;
use tracing::{debug, warn};

/// 有界转储
///
/// 四个限额按优先级生效：行长截断、累计大小、条数、墙钟超时。
/// 超时是协作式的，每接受一行检查一次。
fn dump_source(
    reader: &dyn SourceReader,
    state: &SourceState,
    limits: &LogWatchLimits,
) -> (u64, String) {
    let mut out = String::new();
    let mut count: i64 = 0;
    let started = Instant::now();

    let pos = reader.dump(
        state.position,
        state.level,
        state.context,
        limits.skip_duplicates,
        &mut |line| {
            if limits.max_line_length > 0 && line.chars().count() as i64 >= limits.max_line_length
            {
                out.extend(line.chars().take(limits.max_line_length as usize));
                out.push('\n');
            } else {
                out.push_str(line);
            }
            if limits.max_size > 0 && out.len() as i64 >= limits.max_size {
                return false;
            }
            count += 1;
            if limits.max_entries > 0 && count >= limits.max_entries {
                return false;
            }
            if limits.timeout > 0 && started.elapsed().as_secs() as i64 > limits.timeout {
                return false;
            }
            true
        },
    );

    (pos, out)
}

/// 读一个源自上次偏移以来的新增数据
///
/// `None` 表示源打不开，按缺失处理；`Some("")` 表示本轮没有要报告的内容
/// 但偏移照常推进。
fn read_source_data(
    access: &SourceAccess,
    state: &mut SourceState,
    limits: &LogWatchLimits,
    snap_to_end: bool,
) -> Option<String> {
    let reader = access.open(&state.name)?;
    if !reader.is_valid() {
        return None;
    }

    if state.position == FROM_BEGIN {
        // 首次见到这个源：跳到当前末尾，绝不倾倒历史积压
        state.position = reader.last_position();
        return Some(String::new());
    }

    let (last_pos, worst) = reader.scan(state.position, state.level);

    if worst < state.level {
        // 扫描范围内没有到阈值的内容，只推进偏移
        state.position = last_pos;
        return Some(String::new());
    }

    let (pos, out) = dump_source(reader.as_ref(), state, limits);

    let pos = if snap_to_end && last_pos > pos {
        debug!(
            "源 '{}' 偏移从 {} 跳到 {}，丢弃未读积压",
            state.name, pos, last_pos
        );
        last_pos
    } else {
        pos
    };

    state.position = pos;
    Some(out)
}

/// 按状态集生成报告正文（状态按名字排序遍历）
pub fn generate_output(
    access: &SourceAccess,
    states: &mut StateSet,
    limits: &LogWatchLimits,
    snap_to_end: bool,
) -> String {
    let mut out = String::new();
    for state in states.iter_mut() {
        match state.level {
            EventLevel::Off => {
                // 关闭的源也刷新偏移，之后重新启用时不会倾倒无界积压
                state.position = access.last_position(&state.name).unwrap_or(0);
            }
            EventLevel::Ignore => {
                // 管理噪音条目：不读也不动偏移
            }
            EventLevel::All | EventLevel::Warn | EventLevel::Crit => {
                if !state.in_config {
                    debug!("跳过未配置的源 '{}'", state.name);
                    continue;
                }
                match read_source_data(access, state, limits, snap_to_end) {
                    Some(data) => {
                        out.push_str(&format!("[[[{}]]]\n", state.name));
                        out.push_str(&data);
                    }
                    None => {
                        out.push_str(&format!("[[[{}:missing]]]\n", state.name));
                    }
                }
            }
        }
    }
    out
}

/// logwatch 引擎
///
/// 一次 `poll` 是一轮完整的同步轮询：加载状态、发现源、调和、
/// 扫描转储、写回状态。
pub struct LogWatchEngine {
    access: SourceAccess,
    store: StateStore,
    rules: RuleSet,
    limits: LogWatchLimits,
    send_all: bool,
    snap_to_end: bool,
}

impl LogWatchEngine {
    pub fn new(config: &MonitorConfig) -> Self {
        let access = SourceAccess::new(&config.log_dir, config.logwatch.enriched_api);
        let store = StateStore::new(&config.state_dir);
        let rules = RuleSet::load(&config.logwatch.sources);
        Self {
            access,
            store,
            rules,
            limits: config.logwatch.limits(),
            send_all: config.logwatch.send_all,
            snap_to_end: config.logwatch.snap_to_end,
        }
    }

    pub fn access(&self) -> &SourceAccess {
        &self.access
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// 执行一轮轮询，返回报告文本
    ///
    /// `endpoint` 决定状态文件候选链里的专属文件；`reset_positions`
    /// 是操作员显式要求的全量重放。
    pub fn poll(&self, endpoint: Option<&str>, reset_positions: bool) -> String {
        let candidates = self.store.state_file_candidates(endpoint);

        // send-all 本身就意味着全量重放，已存偏移清零
        let mut states = self
            .store
            .load(&candidates, self.send_all || reset_positions);

        let discovered = self.access.list_sources();
        if discovered.is_empty() {
            warn!("没有发现任何日志源");
        }
        let send_mode = if self.send_all {
            SendMode::All
        } else {
            SendMode::Normal
        };
        update_source_states(&mut states, &discovered, send_mode);

        // journal API 下登记配置里预先声明、尚未被发现的源
        if self.access.supports_unlisted() {
            for entry in &self.rules.entries {
                add_config_entry(&mut states, entry, self.send_all);
            }
        }

        apply_config(&mut states, &self.rules);

        let out = generate_output(&self.access, &mut states, &self.limits, self.snap_to_end);

        // 永远写最具体的那个候选状态文件
        self.store.save(&candidates[0], &states);

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawRule;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn test_config(dir: &Path, rules: &[&str]) -> MonitorConfig {
        let mut config = MonitorConfig::default();
        config.log_dir = dir.join("logs");
        config.state_dir = dir.join("state");
        config.logwatch.send_all = false;
        config.logwatch.enriched_api = false;
        config.logwatch.sources = rules
            .iter()
            .map(|l| RawRule::Line(l.to_string()))
            .collect();
        fs::create_dir_all(&config.log_dir).unwrap();
        fs::create_dir_all(&config.state_dir).unwrap();
        config
    }

    fn write_log(config: &MonitorConfig, name: &str, content: &str) {
        fs::write(config.log_dir.join(format!("{}.log", name)), content).unwrap();
    }

    fn append_log(config: &MonitorConfig, name: &str, content: &str) {
        use std::io::Write;
        let mut f = fs::OpenOptions::new()
            .append(true)
            .open(config.log_dir.join(format!("{}.log", name)))
            .unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    fn state_position(config: &MonitorConfig, name: &str) -> u64 {
        let content = fs::read_to_string(config.state_dir.join("eventstate.txt")).unwrap();
        for line in content.lines() {
            let (n, pos) = line.split_once('|').unwrap();
            if n == name {
                return pos.parse().unwrap();
            }
        }
        panic!("state for {} not found", name);
    }

    #[test]
    fn test_first_cycle_skips_backlog_then_reports_new_entries() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), &["System: all"]);
        write_log(&config, "System", "old line\n");

        let engine = LogWatchEngine::new(&config);

        // 首轮：跳到末尾，不回放历史
        let report = engine.poll(None, false);
        assert_eq!(report, "[[[System]]]\n");
        assert_eq!(state_position(&config, "System"), 9);

        // 新增内容后第二轮报告增量
        append_log(&config, "System", "fresh line\n");
        let report = engine.poll(None, false);
        assert_eq!(report, "[[[System]]]\nO fresh line\n");
        assert_eq!(state_position(&config, "System"), 20);
    }

    #[test]
    fn test_idempotent_cycles_without_new_activity() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), &["System: all"]);
        write_log(&config, "System", "line one\n");

        let engine = LogWatchEngine::new(&config);
        engine.poll(None, false);
        let pos_after_first = state_position(&config, "System");

        // 没有新内容：两轮报告都只有块头，偏移不再变化
        let report = engine.poll(None, false);
        assert_eq!(report, "[[[System]]]\n");
        assert_eq!(state_position(&config, "System"), pos_after_first);

        let report = engine.poll(None, false);
        assert_eq!(report, "[[[System]]]\n");
        assert_eq!(state_position(&config, "System"), pos_after_first);
    }

    #[test]
    fn test_below_threshold_advances_position_without_output() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), &["System: crit"]);
        write_log(&config, "System", "");

        let engine = LogWatchEngine::new(&config);
        engine.poll(None, false);

        // 只有 warn 级别的内容，crit 阈值下不输出
        append_log(&config, "System", "warning: low memory\n");
        let report = engine.poll(None, false);
        assert_eq!(report, "[[[System]]]\n");
        // 扫描成本已付，偏移推进到扫描末尾
        assert_eq!(state_position(&config, "System"), 20);
    }

    #[test]
    fn test_send_all_reads_from_beginning() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path(), &["System: all"]);
        config.logwatch.send_all = true;
        write_log(&config, "System", "historic line\n");

        let engine = LogWatchEngine::new(&config);
        let report = engine.poll(None, false);
        assert_eq!(report, "[[[System]]]\nO historic line\n");
    }

    #[test]
    fn test_off_level_refreshes_position_and_emits_nothing() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), &["System: off"]);
        write_log(&config, "System", "some content here\n");

        let engine = LogWatchEngine::new(&config);
        let report = engine.poll(None, false);
        assert_eq!(report, "");
        // off 的源偏移刷到末尾
        assert_eq!(state_position(&config, "System"), 18);
    }

    #[test]
    fn test_ignore_level_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), &["System: ignore", "Other: all"]);
        write_log(&config, "System", "noise\n");
        write_log(&config, "Other", "");

        let engine = LogWatchEngine::new(&config);
        // 先造出一个已知偏移
        fs::write(config.state_dir.join("eventstate.txt"), "System|3\nOther|0\n").unwrap();

        let report = engine.poll(None, false);
        assert!(!report.contains("[[[System]]]"));
        // ignore 的源偏移原样保留
        assert_eq!(state_position(&config, "System"), 3);
    }

    #[test]
    fn test_unconfigured_source_position_untouched() {
        let dir = TempDir::new().unwrap();
        // 默认规则是合成的 *: off，Application 没有规则
        let config = test_config(dir.path(), &["System: all"]);
        write_log(&config, "System", "");
        write_log(&config, "Application", "content\n");

        let engine = LogWatchEngine::new(&config);
        let report = engine.poll(None, false);
        // Application 级别为 off：不出现在报告里，但偏移被刷新
        assert!(!report.contains("Application"));
        assert_eq!(state_position(&config, "Application"), 8);
    }

    #[test]
    fn test_max_entries_limit() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path(), &["System: all"]);
        config.logwatch.max_entries = 2;
        write_log(&config, "System", "");

        let engine = LogWatchEngine::new(&config);
        engine.poll(None, false);

        append_log(&config, "System", "a 1\na 2\na 3\na 4\na 5\n");
        let report = engine.poll(None, false);
        let lines: Vec<&str> = report.lines().collect();
        // 块头 + 恰好两行
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "O a 1");
        assert_eq!(lines[2], "O a 2");
        // 偏移和实际消费一致：两行各 4 字节
        assert_eq!(state_position(&config, "System"), 8);

        // 下一轮继续报剩下的
        let report = engine.poll(None, false);
        assert!(report.contains("O a 3"));
        assert!(report.contains("O a 4"));
    }

    #[test]
    fn test_max_size_cutoff_and_snap_to_end() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path(), &["System: all"]);
        config.logwatch.max_size = 10;
        write_log(&config, "System", "");

        let engine = LogWatchEngine::new(&config);
        engine.poll(None, false);

        append_log(&config, "System", "line one\nline two\nline three\n");
        let report = engine.poll(None, false);
        // 第一行发出后累计大小到限，转储截断
        assert_eq!(report, "[[[System]]]\nO line one\n");
        assert_eq!(state_position(&config, "System"), 9);

        // 同样内容，开启 snap-to-end：偏移直接跳到扫描末尾，积压被丢弃
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path(), &["System: all"]);
        config.logwatch.max_size = 10;
        config.logwatch.snap_to_end = true;
        write_log(&config, "System", "");

        let engine = LogWatchEngine::new(&config);
        engine.poll(None, false);
        append_log(&config, "System", "line one\nline two\nline three\n");
        let report = engine.poll(None, false);
        assert_eq!(report, "[[[System]]]\nO line one\n");
        assert_eq!(state_position(&config, "System"), 29);

        // 之后不再重报积压
        let report = engine.poll(None, false);
        assert_eq!(report, "[[[System]]]\n");
    }

    #[test]
    fn test_max_line_length_truncation() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path(), &["System: all"]);
        config.logwatch.max_line_length = 8;
        write_log(&config, "System", "");

        let engine = LogWatchEngine::new(&config);
        engine.poll(None, false);

        append_log(&config, "System", "abcdefghijklmnop\n");
        let report = engine.poll(None, false);
        // "O abcdefghijklmnop\n" 被截断成前 8 个字符加换行
        assert_eq!(report, "[[[System]]]\nO abcdef\n");
    }

    #[test]
    fn test_missing_declared_source_reports_missing() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path(), &["Phantom: crit"]);
        config.logwatch.enriched_api = true;
        fs::create_dir_all(config.log_dir.join("journal")).unwrap();

        let engine = LogWatchEngine::new(&config);
        let report = engine.poll(None, false);
        assert_eq!(report, "[[[Phantom:missing]]]\n");
    }

    #[test]
    fn test_classic_api_does_not_register_undiscovered_config_sources() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), &["Phantom: crit"]);

        let engine = LogWatchEngine::new(&config);
        let report = engine.poll(None, false);
        // 经典 API 不支持枚举之外的源，配置声明不会生成状态
        assert_eq!(report, "");
    }

    #[test]
    fn test_enriched_journal_source_end_to_end() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path(), &["Mail: warn context"]);
        config.logwatch.enriched_api = true;
        let journal = config.log_dir.join("journal");
        fs::create_dir_all(&journal).unwrap();
        fs::write(journal.join("Mail.jsonl"), "").unwrap();

        let engine = LogWatchEngine::new(&config);
        engine.poll(None, false);

        let record = concat!(
            r#"{"ts":"2026-08-01T09:30:00Z","level":"warn","message":"queue backlog","context":["132 messages"]}"#,
            "\n"
        );
        let mut content = String::new();
        content.push_str(record);
        fs::write(journal.join("Mail.jsonl"), &content).unwrap();

        let report = engine.poll(None, false);
        assert_eq!(
            report,
            "[[[Mail]]]\nW 2026-08-01 09:30:00 queue backlog\n. 132 messages\n"
        );
    }

    #[test]
    fn test_endpoint_specific_state_file() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), &["System: all"]);
        write_log(&config, "System", "line\n");

        let engine = LogWatchEngine::new(&config);
        engine.poll(Some("10.0.0.9"), false);

        assert!(config.state_dir.join("eventstate_10.0.0.9.txt").exists());
        assert!(!config.state_dir.join("eventstate.txt").exists());
    }

    #[test]
    fn test_report_blocks_in_name_order() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), &["*: all"]);
        write_log(&config, "Zebra", "");
        write_log(&config, "Alpha", "");

        let engine = LogWatchEngine::new(&config);
        let report = engine.poll(None, false);
        let alpha = report.find("[[[Alpha]]]").unwrap();
        let zebra = report.find("[[[Zebra]]]").unwrap();
        assert!(alpha < zebra);
    }
}
