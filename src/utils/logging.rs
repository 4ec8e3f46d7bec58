//! 日志汇总
//!
//! 整个进程只有一个写者：`LogAggregator` 启动的专用线程持有控制台和日志文件，
//! 其他任务（主流程和每个 worker）只往队列里投递 `LogRecord`。
//!
//! 不安装全局 subscriber。每个任务通过 `LogHandle::dispatch()` 拿到自己的
//! `Dispatch`，再用 `WithSubscriber::with_subscriber` 挂到任务上，
//! 任务里的 `tracing` 宏就会带着该任务的来源标识进入队列。

use chrono::{DateTime, Local};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Dispatch, Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{EnvFilter, Layer};

/// 一条日志记录
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub timestamp: DateTime<Local>,
    /// 产生该记录的 worker 标识
    pub origin: Arc<str>,
    pub level: Level,
    pub message: String,
}

impl LogRecord {
    /// `[HH:MM:SS] [origin] [LEVEL] message`
    pub fn render(&self) -> String {
        format!(
            "[{}] [{}] [{}] {}",
            self.timestamp.format("%H:%M:%S"),
            self.origin,
            self.level,
            self.message
        )
    }
}

enum Message {
    Record(LogRecord),
    Shutdown,
}

/// 日志文件打开方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFileMode {
    /// 新运行：创建（或截断）文件
    Create,
    /// 同一运行内重新初始化：追加
    Append,
}

/// 控制台输出目标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleSink {
    Stderr,
    Disabled,
}

/// 日志汇总器，持有唯一的写线程
pub struct LogAggregator {
    tx: mpsc::UnboundedSender<Message>,
    writer: Option<JoinHandle<io::Result<u64>>>,
    path: PathBuf,
    filter: Arc<str>,
}

impl LogAggregator {
    /// 为一次新运行启动汇总器，日志文件名由启动时间决定
    pub fn start_run(work_dir: &Path) -> io::Result<Self> {
        let file_name = format!("almaqso_{}.log", Local::now().format("%Y%m%d_%H%M%S"));
        Self::start(work_dir.join(file_name), LogFileMode::Create, ConsoleSink::Stderr)
    }

    /// 在同一运行内重新初始化，继续写入已有文件
    pub fn reopen(path: impl Into<PathBuf>) -> io::Result<Self> {
        Self::start(path, LogFileMode::Append, ConsoleSink::Stderr)
    }

    pub fn start(
        path: impl Into<PathBuf>,
        mode: LogFileMode,
        console: ConsoleSink,
    ) -> io::Result<Self> {
        let path = path.into();
        let file = match mode {
            LogFileMode::Create => File::create(&path)?,
            LogFileMode::Append => OpenOptions::new().create(true).append(true).open(&path)?,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = std::thread::Builder::new()
            .name("log-aggregator".to_string())
            .spawn(move || drain(rx, file, console))?;

        Ok(Self {
            tx,
            writer: Some(writer),
            path,
            filter: Arc::from("info"),
        })
    }

    /// 设置级别过滤指令（`RUST_LOG` 优先）
    pub fn with_filter(mut self, directive: impl AsRef<str>) -> Self {
        self.filter = Arc::from(directive.as_ref());
        self
    }

    /// 日志文件路径
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 为某个来源创建投递句柄
    pub fn handle(&self, origin: impl AsRef<str>) -> LogHandle {
        LogHandle {
            tx: self.tx.clone(),
            origin: Arc::from(origin.as_ref()),
            filter: self.filter.clone(),
        }
    }

    /// 投递结束标记，等写线程处理完之前的所有记录后返回
    ///
    /// 返回写入文件的记录数。
    pub fn stop(mut self) -> io::Result<u64> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> io::Result<u64> {
        let Some(writer) = self.writer.take() else {
            return Ok(0);
        };
        // 写线程已退出时发送会失败，join 仍然能拿到结果
        let _ = self.tx.send(Message::Shutdown);
        writer
            .join()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "日志写线程崩溃"))?
    }
}

impl Drop for LogAggregator {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl fmt::Debug for LogAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogAggregator")
            .field("path", &self.path)
            .field("running", &self.writer.is_some())
            .finish()
    }
}

/// 日志投递句柄，可克隆，可跨线程
#[derive(Clone)]
pub struct LogHandle {
    tx: mpsc::UnboundedSender<Message>,
    origin: Arc<str>,
    filter: Arc<str>,
}

impl LogHandle {
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// 同一汇总器下的另一个来源
    pub fn with_origin(&self, origin: impl AsRef<str>) -> LogHandle {
        LogHandle {
            tx: self.tx.clone(),
            origin: Arc::from(origin.as_ref()),
            filter: self.filter.clone(),
        }
    }

    /// 投递一条记录；汇总器已停止时返回 false
    pub fn log(&self, level: Level, message: impl Into<String>) -> bool {
        let record = LogRecord {
            timestamp: Local::now(),
            origin: self.origin.clone(),
            level,
            message: message.into(),
        };
        self.tx.send(Message::Record(record)).is_ok()
    }

    pub fn info(&self, message: impl Into<String>) -> bool {
        self.log(Level::INFO, message)
    }

    pub fn warn(&self, message: impl Into<String>) -> bool {
        self.log(Level::WARN, message)
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        self.log(Level::ERROR, message)
    }

    /// 构建把 `tracing` 事件转发到本句柄的 dispatcher
    pub fn dispatch(&self) -> Dispatch {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&*self.filter))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(AggregatorLayer {
                handle: self.clone(),
            });
        Dispatch::new(subscriber)
    }
}

impl fmt::Debug for LogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogHandle")
            .field("origin", &self.origin)
            .finish()
    }
}

struct AggregatorLayer {
    handle: LogHandle,
}

impl<S: Subscriber> Layer<S> for AggregatorLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.handle.log(*event.metadata().level(), visitor.finish());
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

// ========== 写线程 ==========

// 记录在写线程上按已拥有的数据渲染，这里没有 tracing 的 Event，
// fmt 层的着色只作用于它自己格式化的事件，所以颜色在此直接写出。
const RESET: &str = "\x1b[0m";

fn level_color(level: Level) -> &'static str {
    match level {
        Level::ERROR => "\x1b[1;31m",
        Level::WARN => "\x1b[33m",
        Level::INFO => "\x1b[32m",
        Level::DEBUG => "\x1b[36m",
        Level::TRACE => "\x1b[35m",
    }
}

fn paint(level: Level, line: &str) -> String {
    format!("{}{}{}", level_color(level), line, RESET)
}

fn drain(
    mut rx: mpsc::UnboundedReceiver<Message>,
    mut file: File,
    console: ConsoleSink,
) -> io::Result<u64> {
    let colored = console == ConsoleSink::Stderr && io::stderr().is_terminal();
    let mut written = 0u64;
    let mut first_error: Option<io::Error> = None;

    while let Some(message) = rx.blocking_recv() {
        let record = match message {
            Message::Record(record) => record,
            Message::Shutdown => break,
        };
        let line = record.render();

        if console == ConsoleSink::Stderr {
            let mut err = io::stderr().lock();
            let _ = if colored {
                writeln!(err, "{}", paint(record.level, &line))
            } else {
                writeln!(err, "{line}")
            };
        }

        // 整行一次写入，进程中途退出时不会留下半行
        match file.write_all(format!("{line}\n").as_bytes()) {
            Ok(()) => written += 1,
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    file.sync_all()?;
    match first_error {
        Some(e) => Err(e),
        None => Ok(written),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_paint_wraps_line_in_level_colour() {
        assert_eq!(paint(Level::ERROR, "boom"), "\x1b[1;31mboom\x1b[0m");
        assert_eq!(paint(Level::WARN, "hm"), "\x1b[33mhm\x1b[0m");
        assert_ne!(level_color(Level::INFO), level_color(Level::DEBUG));
    }

    fn start_quiet(path: &Path, mode: LogFileMode) -> LogAggregator {
        LogAggregator::start(path, mode, ConsoleSink::Disabled).unwrap()
    }

    #[test]
    fn test_concurrent_producers_keep_their_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let aggregator = start_quiet(&path, LogFileMode::Create);

        const PRODUCERS: usize = 8;
        const RECORDS: usize = 200;

        let threads: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let handle = aggregator.handle(format!("worker-{p}"));
                std::thread::spawn(move || {
                    for i in 0..RECORDS {
                        assert!(handle.info(format!("seq={i}")));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let written = aggregator.stop().unwrap();
        assert_eq!(written, (PRODUCERS * RECORDS) as u64);

        let content = std::fs::read_to_string(&path).unwrap();
        let mut per_worker: HashMap<String, Vec<usize>> = HashMap::new();
        for line in content.lines() {
            let origin = line.split("] [").nth(1).unwrap().to_string();
            let seq: usize = line.rsplit("seq=").next().unwrap().parse().unwrap();
            per_worker.entry(origin).or_default().push(seq);
        }

        assert_eq!(per_worker.len(), PRODUCERS);
        for seqs in per_worker.values() {
            assert_eq!(*seqs, (0..RECORDS).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_tracing_events_are_routed_through_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let aggregator = start_quiet(&path, LogFileMode::Create);
        let handle = aggregator.handle("uid___A002_X1");

        tracing::dispatcher::with_default(&handle.dispatch(), || {
            tracing::warn!(stage = "calibrate", "校准失败");
        });
        aggregator.stop().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("[uid___A002_X1] [WARN] 校准失败 stage=calibrate"));
    }

    #[test]
    fn test_reopen_appends_and_start_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");

        let first = start_quiet(&path, LogFileMode::Create);
        first.handle("main").info("first");
        first.stop().unwrap();

        let second = start_quiet(&path, LogFileMode::Append);
        second.handle("main").info("second");
        second.stop().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);

        let fresh = start_quiet(&path, LogFileMode::Create);
        fresh.handle("main").info("third");
        fresh.stop().unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("third"));
    }

    #[test]
    fn test_handle_after_stop_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let aggregator = start_quiet(&dir.path().join("run.log"), LogFileMode::Create);
        let handle = aggregator.handle("late");
        aggregator.stop().unwrap();
        assert!(!handle.info("lost"));
    }

    #[test]
    fn test_drop_drains_pending_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        {
            let aggregator = start_quiet(&path, LogFileMode::Create);
            let handle = aggregator.handle("main");
            for i in 0..50 {
                handle.info(format!("line {i}"));
            }
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 50);
    }
}
