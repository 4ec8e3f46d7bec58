//! 成功记录服务 - 业务能力层
//!
//! 只负责"记住哪些数据单元已经成功"，不关心流程。
//!
//! 记录文件每行一个单元标识，只追加。所有写操作都交给一个写任务串行执行，
//! 调用方之间不会交错或互相截断。

use crate::error::LedgerError;
use crate::models::WorkUnit;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// 工作根目录下的记录文件名
pub const LEDGER_FILE_NAME: &str = "almaqso_successful.txt";

type Ack = oneshot::Sender<std::io::Result<()>>;

enum LedgerCommand {
    Record { unit_id: String, ack: Ack },
    Reset { ack: Ack },
}

/// 按是否已成功划分后的单元列表
#[derive(Debug, Default)]
pub struct LedgerFilter {
    /// 需要处理的单元
    pub pending: Vec<WorkUnit>,
    /// 之前已成功、本次跳过的单元
    pub skipped: Vec<WorkUnit>,
}

/// 成功记录
///
/// 可克隆，所有副本共享同一个写任务。
#[derive(Clone)]
pub struct SuccessLedger {
    path: PathBuf,
    tx: mpsc::Sender<LedgerCommand>,
}

impl SuccessLedger {
    /// 打开（必要时创建）记录文件并启动写任务
    ///
    /// 必须在 tokio 运行时内调用。
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| LedgerError::Io {
                path: path.clone(),
                source,
            })?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run_writer(file, rx));

        Ok(Self { path, tx })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 追加一个单元标识，返回时已落盘
    pub async fn record(&self, unit_id: &str) -> Result<(), LedgerError> {
        let unit_id = unit_id.trim().to_string();
        debug!("写入成功记录: {}", unit_id);
        self.send(|ack| LedgerCommand::Record { unit_id, ack }).await
    }

    /// 清空记录
    pub async fn reset(&self) -> Result<(), LedgerError> {
        self.send(|ack| LedgerCommand::Reset { ack }).await
    }

    /// 读取之前所有运行记录的标识
    pub async fn load(&self) -> Result<HashSet<String>, LedgerError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(source) => {
                return Err(LedgerError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// 按记录过滤待处理单元
    ///
    /// `resume` 为 false 时先清空记录，所有单元都需要处理。
    pub async fn filter(
        &self,
        units: Vec<WorkUnit>,
        resume: bool,
    ) -> Result<LedgerFilter, LedgerError> {
        if !resume {
            self.reset().await?;
            return Ok(LedgerFilter {
                pending: units,
                skipped: Vec::new(),
            });
        }

        let done = self.load().await?;
        let mut result = LedgerFilter::default();
        for unit in units {
            if done.contains(&unit.id) {
                info!("⏭️ 跳过之前已成功处理的单元: {}", unit.id);
                result.skipped.push(unit);
            } else {
                result.pending.push(unit);
            }
        }
        Ok(result)
    }

    async fn send(&self, command: impl FnOnce(Ack) -> LedgerCommand) -> Result<(), LedgerError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(command(ack))
            .await
            .map_err(|_| LedgerError::WriterGone)?;
        done.await
            .map_err(|_| LedgerError::WriterGone)?
            .map_err(|source| LedgerError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

async fn run_writer(mut file: File, mut rx: mpsc::Receiver<LedgerCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            LedgerCommand::Record { unit_id, ack } => {
                let result = append_line(&mut file, &unit_id).await;
                let _ = ack.send(result);
            }
            LedgerCommand::Reset { ack } => {
                let result = match file.set_len(0).await {
                    Ok(()) => file.sync_all().await,
                    Err(e) => Err(e),
                };
                let _ = ack.send(result);
            }
        }
    }
}

async fn append_line(file: &mut File, unit_id: &str) -> std::io::Result<()> {
    // 一次写入整行
    file.write_all(format!("{unit_id}\n").as_bytes()).await?;
    file.flush().await?;
    file.sync_data().await
}
