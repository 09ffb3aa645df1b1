//! 延迟备份调度器
//!
//! 脚本正在运行时备份请求会被推迟（目录中标记 `pending_backup`），
//! 由本调度器在后台定期重试，直到没有待备份的记录为止。
//!
//! 状态机：
//!
//! ```text
//!            ensure_running()
//!   [Idle] ──────────────────► [Polling] ──┐ sweep → sleep → sweep ...
//!     ▲                                    │
//!     └──────── 没有待备份记录 / stop() ───┘
//! ```
//!
//! - 同一时间最多一个轮询任务（原子标志）
//! - 轮询任务清空后自行退出，不会自己重启；新的延迟请求通过 `ensure_running()` 重新拉起
//! - 正在执行的一轮扫描（包括目录写回）总会完整结束，取消只在两轮之间生效

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::archive::{BackupArchive, BackupOutcome};
use super::catalog::CatalogStore;
use super::detector::RunningFileDetector;
use super::error::VaultError;

/// 默认轮询间隔
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// 调度器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// 没有轮询任务
    Idle,
    /// 轮询任务运行中
    Polling,
}

/// 一轮扫描的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// 本轮尝试备份的脚本
    pub attempted: Vec<String>,
    /// 本轮清除了待备份标记的脚本
    pub cleared: Vec<String>,
    /// 扫描结束后仍待备份的记录数
    pub still_pending: usize,
}

/// 延迟备份调度器
pub struct PendingBackupScheduler {
    /// 脚本目录
    store: Arc<dyn CatalogStore>,
    /// 备份归档
    archive: Arc<BackupArchive>,
    /// 运行检测
    detector: Arc<dyn RunningFileDetector>,
    /// 轮询间隔
    interval: Duration,
    /// 是否有轮询任务在跑
    polling: AtomicBool,
    /// 轮询任务收尾期间收到的启动请求
    rearm: AtomicBool,
    /// 停止信号
    cancel_token: CancellationToken,
    /// 回到 Idle 时通知等待者
    idle_notify: Notify,
    /// 已完成的扫描轮数
    sweeps_completed: AtomicU64,
}

impl PendingBackupScheduler {
    /// 创建调度器（初始为 Idle）
    pub fn new(
        store: Arc<dyn CatalogStore>,
        archive: Arc<BackupArchive>,
        detector: Arc<dyn RunningFileDetector>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            archive,
            detector,
            interval,
            polling: AtomicBool::new(false),
            rearm: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
            idle_notify: Notify::new(),
            sweeps_completed: AtomicU64::new(0),
        }
    }

    /// 当前状态
    pub fn state(&self) -> SchedulerState {
        if self.polling.load(Ordering::SeqCst) {
            SchedulerState::Polling
        } else {
            SchedulerState::Idle
        }
    }

    /// 轮询间隔
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 已完成的扫描轮数
    pub fn sweeps_completed(&self) -> u64 {
        self.sweeps_completed.load(Ordering::SeqCst)
    }

    /// 是否已停止
    pub fn is_stopped(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 确保有一个轮询任务在运行
    ///
    /// - Idle 时启动新的轮询任务并返回其句柄
    /// - 已在轮询时返回 None；如果轮询任务恰好在收尾，会被重新拉起
    /// - 已停止或当前不在 tokio 运行时内时返回 None，记录保留待备份标记
    pub fn ensure_running(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.is_stopped() {
            tracing::debug!("延迟备份调度器已停止，忽略启动请求");
            return None;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("不在异步运行时中，延迟备份将在下次启动调度器时处理");
            return None;
        };

        loop {
            if self
                .polling
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                tracing::info!("延迟备份调度器启动，轮询间隔: {:?}", self.interval);
                let scheduler = self.clone();
                return Some(handle.spawn(async move { scheduler.run().await }));
            }

            // 已在轮询：留下重启请求；若轮询任务已经退出则重新抢占
            self.rearm.store(true, Ordering::SeqCst);
            if self.polling.load(Ordering::SeqCst) {
                return None;
            }
        }
    }

    /// 发出停止信号
    ///
    /// 轮询任务在当前扫描结束后、下一次休眠前退出。停止后不再接受启动请求。
    pub fn stop(&self) {
        tracing::info!("延迟备份调度器停止请求已发送");
        self.cancel_token.cancel();
    }

    /// 等待调度器回到 Idle
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle_notify.notified();
            if self.state() == SchedulerState::Idle {
                return;
            }
            notified.await;
        }
    }

    /// 轮询主循环（持有 polling 标志）
    async fn run(self: Arc<Self>) {
        loop {
            let scheduler = self.clone();
            let still_pending = match tokio::task::spawn_blocking(move || scheduler.sweep()).await {
                Ok(Ok(report)) => report.still_pending,
                Ok(Err(e)) => {
                    tracing::error!("延迟备份扫描失败: {}", e);
                    // 目录读不出来时无法确认是否还有待备份记录，继续轮询
                    1
                }
                Err(e) => {
                    tracing::error!("延迟备份扫描任务异常退出: {}", e);
                    1
                }
            };

            if still_pending == 0 && !self.rearm.swap(false, Ordering::SeqCst) {
                if self.try_go_idle() {
                    tracing::info!("没有待备份的脚本，延迟备份调度器退出");
                    return;
                }
                continue;
            }

            // 休眠前检查停止信号
            if self.cancel_token.is_cancelled() {
                break;
            }
            tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        tracing::info!("延迟备份调度器已取消");
        self.polling.store(false, Ordering::SeqCst);
        self.idle_notify.notify_waiters();
    }

    /// 释放 polling 标志；收尾期间有新的启动请求时重新抢占并返回 false
    fn try_go_idle(&self) -> bool {
        self.polling.store(false, Ordering::SeqCst);
        if self.rearm.swap(false, Ordering::SeqCst)
            && !self.is_stopped()
            && self
                .polling
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            tracing::debug!("收尾期间收到新的延迟备份请求，继续轮询");
            return false;
        }
        self.idle_notify.notify_waiters();
        true
    }

    /// 执行一轮扫描
    ///
    /// 1. 读取目录快照
    /// 2. 对每条待备份记录：文件不再被使用时执行备份，成功则清除标记
    /// 3. 有标记被清除时写回目录
    pub fn sweep(&self) -> Result<SweepReport, VaultError> {
        let records = self.store.load()?;
        let mut report = SweepReport::default();
        let mut settled: Vec<(&str, Option<&Path>)> = Vec::new();

        for record in records.iter().filter(|r| r.pending_backup) {
            let in_use = record
                .path
                .as_deref()
                .map(|path| self.detector.is_in_use(path))
                .unwrap_or(false);
            if in_use {
                tracing::debug!("'{}' 仍在使用中，稍后重试", record.name);
                report.still_pending += 1;
                continue;
            }

            tracing::info!("[pending] 开始备份 '{}'", record.name);
            report.attempted.push(record.name.clone());
            let outcome = self.archive.create(record);
            if outcome.settles_pending() {
                if let BackupOutcome::NoSource = outcome {
                    tracing::warn!("'{}' 的源文件已不存在，放弃延迟备份", record.name);
                }
                report.cleared.push(record.name.clone());
                settled.push((record.name.as_str(), record.path.as_deref()));
            } else {
                report.still_pending += 1;
            }
        }

        if !settled.is_empty() {
            self.persist_cleared(&settled)?;
        }

        self.sweeps_completed.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            "延迟备份扫描完成: 尝试 {}, 清除 {}, 剩余 {}",
            report.attempted.len(),
            report.cleared.len(),
            report.still_pending
        );
        Ok(report)
    }

    /// 把清除的标记写回目录
    ///
    /// 写回前重新读取目录，只清除名称和路径都与本次备份一致的记录；
    /// 扫描期间前台新增、修改或删除的记录保持前台写入的样子。
    fn persist_cleared(&self, settled: &[(&str, Option<&Path>)]) -> Result<(), VaultError> {
        let mut latest = self.store.load()?;
        let mut changed = false;
        for record in latest.iter_mut() {
            let backed_up = settled
                .iter()
                .any(|(name, path)| *name == record.name && *path == record.path.as_deref());
            if record.pending_backup && backed_up {
                record.pending_backup = false;
                changed = true;
            }
        }
        if changed {
            self.store.save(&latest)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PendingBackupScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingBackupScheduler")
            .field("interval", &self.interval)
            .field("state", &self.state())
            .field("stopped", &self.is_stopped())
            .field("sweeps_completed", &self.sweeps_completed())
            .finish()
    }
}

/// 目录中是否有待备份的记录
pub fn has_pending(store: &dyn CatalogStore) -> Result<bool, VaultError> {
    Ok(store.load()?.iter().any(|r| r.pending_backup))
}
