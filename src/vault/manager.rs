//! 脚本仓库管理器
//!
//! 把目录、归档、运行检测和延迟备份调度器组合成面向调用方的操作：
//! 添加 / 修改 / 删除 / 列出脚本，立即备份，恢复，校验。
//!
//! 所有操作都是同步的；延迟备份交给后台调度器处理。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::archive::{BackupArchive, BackupOutcome, RestoreReport, VerifyReport};
use super::catalog::{validate_name, CatalogStore, ScriptRecord};
use super::detector::RunningFileDetector;
use super::error::VaultError;
use super::scheduler::{has_pending, PendingBackupScheduler};

/// 备份请求的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupRequest {
    /// 立即执行了备份
    Completed(BackupOutcome),
    /// 文件正在使用，已标记为待备份
    Deferred,
}

impl BackupRequest {
    /// 是否被推迟
    pub fn is_deferred(&self) -> bool {
        matches!(self, BackupRequest::Deferred)
    }
}

/// 脚本修改内容（None 表示保持原值）
#[derive(Debug, Clone, Default)]
pub struct ScriptUpdate {
    /// 新名称
    pub name: Option<String>,
    /// 新路径
    pub path: Option<PathBuf>,
    /// 新描述
    pub description: Option<String>,
}

/// 脚本仓库管理器
pub struct VaultManager {
    /// 脚本目录
    store: Arc<dyn CatalogStore>,
    /// 备份归档
    archive: Arc<BackupArchive>,
    /// 运行检测
    detector: Arc<dyn RunningFileDetector>,
    /// 延迟备份调度器
    scheduler: Arc<PendingBackupScheduler>,
    /// 默认恢复目录（`reproduced/`）
    reproduced_dir: PathBuf,
}

impl std::fmt::Debug for VaultManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultManager")
            .field("archive", &self.archive)
            .field("scheduler", &self.scheduler)
            .field("reproduced_dir", &self.reproduced_dir)
            .finish()
    }
}

impl VaultManager {
    /// 创建管理器
    pub fn new(
        store: Arc<dyn CatalogStore>,
        archive: Arc<BackupArchive>,
        detector: Arc<dyn RunningFileDetector>,
        scheduler: Arc<PendingBackupScheduler>,
        reproduced_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            archive,
            detector,
            scheduler,
            reproduced_dir: reproduced_dir.into(),
        }
    }

    /// 备份归档
    pub fn archive(&self) -> &BackupArchive {
        &self.archive
    }

    /// 延迟备份调度器
    pub fn scheduler(&self) -> &Arc<PendingBackupScheduler> {
        &self.scheduler
    }

    /// 列出全部脚本
    pub fn list(&self) -> Result<Vec<ScriptRecord>, VaultError> {
        self.store.load()
    }

    /// 按名称查找脚本
    pub fn get(&self, name: &str) -> Result<ScriptRecord, VaultError> {
        self.store
            .load()?
            .into_iter()
            .find(|r| r.name == name)
            .ok_or_else(|| VaultError::ScriptNotFound(name.to_string()))
    }

    /// 添加脚本并立即备份（文件正在使用时推迟）
    pub fn add_script(
        &self,
        name: &str,
        path: impl Into<PathBuf>,
        description: &str,
    ) -> Result<BackupRequest, VaultError> {
        validate_name(name)?;
        let mut records = self.store.load()?;
        if records.iter().any(|r| r.name == name) {
            return Err(VaultError::DuplicateName(name.to_string()));
        }

        let mut record = ScriptRecord::new(name, path, description);
        let request = self.backup_or_defer(&mut record);
        records.push(record);
        self.store.save(&records)?;
        tracing::info!("已添加脚本 '{}'", name);

        self.after_save(&request);
        Ok(request)
    }

    /// 修改脚本
    ///
    /// 修改后文件正在使用则推迟备份；否则仅在归档已过期时重新备份，返回 None 表示无需备份。
    /// 改名不会移动旧名称下的归档。
    pub fn modify_script(
        &self,
        name: &str,
        update: ScriptUpdate,
    ) -> Result<Option<BackupRequest>, VaultError> {
        let mut records = self.store.load()?;
        let index = records
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| VaultError::ScriptNotFound(name.to_string()))?;

        if let Some(new_name) = update.name.as_deref().filter(|n| *n != name) {
            validate_name(new_name)?;
            if records.iter().any(|r| r.name == new_name) {
                return Err(VaultError::DuplicateName(new_name.to_string()));
            }
        }

        let record = &mut records[index];
        if let Some(new_name) = update.name {
            record.name = new_name;
        }
        if let Some(path) = update.path {
            record.path = Some(path);
        }
        if let Some(description) = update.description {
            record.description = description;
        }

        let request = if self.source_in_use(record) {
            tracing::warn!("'{}' 似乎正在运行，备份已推迟", record.name);
            record.pending_backup = true;
            Some(BackupRequest::Deferred)
        } else if self.archive.needs_backup(record) {
            Some(self.backup_or_defer(record))
        } else {
            None
        };

        let renamed = record.name.clone();
        self.store.save(&records)?;
        tracing::info!("已修改脚本 '{}' -> '{}'", name, renamed);

        if let Some(request) = &request {
            self.after_save(request);
        }
        Ok(request)
    }

    /// 从目录中删除脚本（归档保留在磁盘上）
    pub fn remove_script(&self, name: &str) -> Result<ScriptRecord, VaultError> {
        let mut records = self.store.load()?;
        let index = records
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| VaultError::ScriptNotFound(name.to_string()))?;

        let removed = records.remove(index);
        self.store.save(&records)?;
        tracing::info!(
            "已删除脚本 '{}'，备份保留在 {}",
            name,
            self.archive.archive_dir(name).display()
        );
        Ok(removed)
    }

    /// 立即备份（文件正在使用时推迟）
    pub fn backup_now(&self, name: &str) -> Result<BackupRequest, VaultError> {
        let mut records = self.store.load()?;
        let record = records
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or_else(|| VaultError::ScriptNotFound(name.to_string()))?;

        let request = self.backup_or_defer(record);
        self.store.save(&records)?;

        self.after_save(&request);
        Ok(request)
    }

    /// 恢复到默认目录 `reproduced/<name>/`
    pub fn restore(&self, name: &str) -> Result<RestoreReport, VaultError> {
        self.restore_to(name, &self.reproduced_dir)
    }

    /// 恢复到 `destination_root/<name>/`
    ///
    /// 已从目录删除的脚本只要归档还在，也可以恢复。
    pub fn restore_to(
        &self,
        name: &str,
        destination_root: &Path,
    ) -> Result<RestoreReport, VaultError> {
        self.archive.restore(name, destination_root)
    }

    /// 校验归档
    pub fn verify(&self, name: &str) -> Result<VerifyReport, VaultError> {
        self.archive.verify(name)
    }

    /// 目录中有待备份记录时确保调度器在运行
    pub fn resume_pending(&self) -> Result<bool, VaultError> {
        if !has_pending(self.store.as_ref())? {
            return Ok(false);
        }
        tracing::info!("发现待备份的脚本，启动延迟备份调度器");
        self.scheduler.ensure_running();
        Ok(true)
    }

    /// 文件正在使用则标记待备份，否则立即备份
    ///
    /// 备份成功或源文件已不存在时清除旧的待备份标记；失败时保留原标记不变。
    fn backup_or_defer(&self, record: &mut ScriptRecord) -> BackupRequest {
        if self.source_in_use(record) {
            tracing::warn!("'{}' 似乎正在运行，备份已推迟", record.name);
            record.pending_backup = true;
            return BackupRequest::Deferred;
        }

        let outcome = self.archive.create(record);
        if outcome.settles_pending() {
            record.pending_backup = false;
        }
        BackupRequest::Completed(outcome)
    }

    fn source_in_use(&self, record: &ScriptRecord) -> bool {
        record
            .path
            .as_deref()
            .map(|path| self.detector.is_in_use(path))
            .unwrap_or(false)
    }

    /// 目录写入后：有延迟请求时拉起调度器
    fn after_save(&self, request: &BackupRequest) {
        if request.is_deferred() {
            self.scheduler.ensure_running();
        }
    }
}
