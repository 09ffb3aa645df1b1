//! 备份归档
//!
//! 每个脚本名对应一个归档目录 `backups/<name>/`，其中包含：
//! - 每个原始文件一个压缩数据文件 `<原始文件名>.gz`
//! - 一个元数据文件 `metadata.json`
//!
//! 写入顺序固定为“先数据、后元数据”，两者都经临时文件 rename 落盘，
//! 因此元数据永远不会引用一个尚未写完的数据文件。
//!
//! 恢复是尽力而为的：单个文件缺失、损坏或摘要不符只记录警告，
//! 不影响其他文件。

use std::fmt;
use std::path::{Path, PathBuf};

use super::catalog::{validate_name, ScriptRecord};
use super::content;
use super::error::VaultError;
use super::manifest::{
    blob_name_for, original_name_from_blob, ArchiveManifest, ManifestEntry, MANIFEST_FILE_NAME,
};
use crate::common::{cleanup_stale_temp_files, is_temp_file_name, write_atomic};

/// 一次备份的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    /// 备份成功
    Created {
        /// 原始内容的 SHA-256
        digest: String,
        /// 原始大小（字节）
        size: u64,
        /// 压缩数据文件路径
        blob: PathBuf,
    },
    /// 源文件不存在：只写入了空的元数据
    NoSource,
    /// 备份过程中发生 I/O 错误
    PartialFailure {
        /// 失败原因
        reason: String,
    },
}

impl BackupOutcome {
    /// 是否成功写入了数据
    pub fn is_created(&self) -> bool {
        matches!(self, BackupOutcome::Created { .. })
    }

    /// 该结果是否结束了一个延迟备份请求
    ///
    /// 源文件已不存在时没有可快照的内容，继续重试只会无限轮询。
    pub fn settles_pending(&self) -> bool {
        matches!(
            self,
            BackupOutcome::Created { .. } | BackupOutcome::NoSource
        )
    }
}

/// 恢复或校验过程中的单文件警告
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreWarning {
    /// 元数据记录了文件，但压缩数据不存在
    MissingBlob { file: String },
    /// 压缩数据无法读取或解压
    Corrupt { file: String, reason: String },
    /// 恢复内容的摘要与记录不符（文件仍会写出）
    IntegrityMismatch {
        file: String,
        expected: String,
        actual: String,
    },
    /// 写出恢复文件失败
    WriteFailed { file: String, reason: String },
    /// 元数据存在但无法解析
    ManifestUnreadable { reason: String },
}

impl RestoreWarning {
    /// 相关的文件名（元数据级别的警告没有文件名）
    pub fn file(&self) -> Option<&str> {
        match self {
            RestoreWarning::MissingBlob { file }
            | RestoreWarning::Corrupt { file, .. }
            | RestoreWarning::IntegrityMismatch { file, .. }
            | RestoreWarning::WriteFailed { file, .. } => Some(file),
            RestoreWarning::ManifestUnreadable { .. } => None,
        }
    }
}

impl fmt::Display for RestoreWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreWarning::MissingBlob { file } => write!(f, "{}: backup data missing", file),
            RestoreWarning::Corrupt { file, reason } => {
                write!(f, "{}: failed decompressing ({})", file, reason)
            }
            RestoreWarning::IntegrityMismatch {
                file,
                expected,
                actual,
            } => write!(
                f,
                "{}: integrity mismatch (expected {}, got {})",
                file, expected, actual
            ),
            RestoreWarning::WriteFailed { file, reason } => {
                write!(f, "{}: write failed ({})", file, reason)
            }
            RestoreWarning::ManifestUnreadable { reason } => {
                write!(f, "metadata unreadable ({})", reason)
            }
        }
    }
}

/// 恢复结果
#[derive(Debug, Clone)]
pub struct RestoreReport {
    /// 脚本名
    pub script_name: String,
    /// 恢复目标目录 `<destination_root>/<name>`
    pub target_dir: PathBuf,
    /// 已写出的文件
    pub restored: Vec<PathBuf>,
    /// 警告
    pub warnings: Vec<RestoreWarning>,
    /// 是否按元数据恢复（否则为扫描 `.gz` 的回退模式）
    pub from_manifest: bool,
}

impl RestoreReport {
    /// 恢复的文件数
    pub fn restored_count(&self) -> usize {
        self.restored.len()
    }

    /// 没有恢复任何文件
    pub fn is_noop(&self) -> bool {
        self.restored.is_empty()
    }
}

/// 校验结果
#[derive(Debug, Clone)]
pub struct VerifyReport {
    /// 脚本名
    pub script_name: String,
    /// 通过校验的原始文件名
    pub verified: Vec<String>,
    /// 警告
    pub warnings: Vec<RestoreWarning>,
}

impl VerifyReport {
    /// 所有记录的文件都完好
    pub fn is_intact(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// 备份归档
#[derive(Debug, Clone)]
pub struct BackupArchive {
    /// 归档根目录（`backups/`）
    backups_dir: PathBuf,
}

impl BackupArchive {
    /// 创建归档管理器
    pub fn new(backups_dir: impl Into<PathBuf>) -> Self {
        Self {
            backups_dir: backups_dir.into(),
        }
    }

    /// 归档根目录
    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }

    /// 脚本的归档目录
    pub fn archive_dir(&self, name: &str) -> PathBuf {
        self.backups_dir.join(name)
    }

    /// 脚本的元数据路径
    pub fn manifest_path(&self, name: &str) -> PathBuf {
        self.archive_dir(name).join(MANIFEST_FILE_NAME)
    }

    /// 是否存在归档目录
    pub fn has_archive(&self, name: &str) -> bool {
        validate_name(name).is_ok() && self.archive_dir(name).is_dir()
    }

    /// 读取元数据（不存在时返回 None）
    pub fn load_manifest(&self, name: &str) -> Result<Option<ArchiveManifest>, VaultError> {
        validate_name(name)?;
        let path = self.manifest_path(name);
        if !path.exists() {
            return Ok(None);
        }
        ArchiveManifest::load(&path).map(Some)
    }

    /// 为脚本创建备份
    ///
    /// 不会返回错误：I/O 失败记录日志后以 [`BackupOutcome::PartialFailure`] 返回，
    /// 调用方的目录操作可以继续。
    pub fn create(&self, record: &ScriptRecord) -> BackupOutcome {
        match self.try_create(record) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("备份 '{}' 失败: {}", record.name, e);
                BackupOutcome::PartialFailure {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn try_create(&self, record: &ScriptRecord) -> Result<BackupOutcome, VaultError> {
        validate_name(&record.name)?;

        let dir = self.archive_dir(&record.name);
        std::fs::create_dir_all(&dir)?;
        if let Err(e) = cleanup_stale_temp_files(&dir) {
            tracing::debug!("清理 {:?} 中的临时文件失败: {}", dir, e);
        }

        let manifest_path = dir.join(MANIFEST_FILE_NAME);
        let original_path = record
            .path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        let manifest = ArchiveManifest::new(original_path, record.description.clone());

        let source = match record.path.as_deref().filter(|p| p.exists()) {
            Some(source) => source,
            None => {
                manifest.save(&manifest_path)?;
                tracing::warn!(
                    "'{}' 的源文件不存在，只保存了元数据: {:?}",
                    record.name,
                    record.path
                );
                return Ok(BackupOutcome::NoSource);
            }
        };

        let base_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                VaultError::FileSystem(format!("无法确定文件名: {}", source.display()))
            })?;

        let raw = std::fs::read(source)?;
        let digest = content::digest(&raw);
        let size = raw.len() as u64;

        // 先写数据，再写元数据
        let blob_name = blob_name_for(&base_name);
        let blob_path = dir.join(&blob_name);
        write_atomic(&blob_path, &content::compress(&raw))?;

        let manifest = manifest.with_file(
            base_name,
            ManifestEntry {
                backup_file: blob_name,
                sha256: digest.clone(),
                orig_size: size,
            },
        );
        manifest.save(&manifest_path)?;

        tracing::info!(
            "备份完成: '{}' -> {} ({} 字节, sha256={})",
            record.name,
            blob_path.display(),
            size,
            digest
        );

        Ok(BackupOutcome::Created {
            digest,
            size,
            blob: blob_path,
        })
    }

    /// 将脚本的备份恢复到 `destination_root/<name>/`
    ///
    /// 归档目录不存在时返回 [`VaultError::NoBackupFound`]，且不创建任何目录。
    pub fn restore(
        &self,
        name: &str,
        destination_root: &Path,
    ) -> Result<RestoreReport, VaultError> {
        validate_name(name)?;
        let dir = self.archive_dir(name);
        if !dir.is_dir() {
            return Err(VaultError::NoBackupFound(name.to_string()));
        }

        let mut report = RestoreReport {
            script_name: name.to_string(),
            target_dir: destination_root.join(name),
            restored: Vec::new(),
            warnings: Vec::new(),
            from_manifest: false,
        };

        match self.load_manifest(name) {
            Ok(Some(manifest)) => {
                report.from_manifest = true;
                self.restore_from_manifest(&dir, &manifest, &mut report);
            }
            Ok(None) => self.restore_from_blobs(&dir, &mut report)?,
            Err(e) => {
                report.warnings.push(RestoreWarning::ManifestUnreadable {
                    reason: e.to_string(),
                });
                self.restore_from_blobs(&dir, &mut report)?;
            }
        }

        for warning in &report.warnings {
            tracing::warn!("恢复 '{}': {}", name, warning);
        }
        if report.is_noop() {
            tracing::info!("'{}' 没有恢复任何文件", name);
        } else {
            tracing::info!(
                "已恢复 {} 个文件到 {}",
                report.restored_count(),
                report.target_dir.display()
            );
        }

        Ok(report)
    }

    fn restore_from_manifest(
        &self,
        dir: &Path,
        manifest: &ArchiveManifest,
        report: &mut RestoreReport,
    ) {
        for (original_name, entry) in &manifest.files {
            let data = match read_entry(dir, original_name, entry) {
                Ok(data) => data,
                Err(warning) => {
                    report.warnings.push(warning);
                    continue;
                }
            };

            // 摘要不符只告警，文件照常写出
            if let Some(warning) = check_integrity(original_name, entry, &data) {
                report.warnings.push(warning);
            }

            write_restored(original_name, &data, report);
        }
    }

    fn restore_from_blobs(&self, dir: &Path, report: &mut RestoreReport) -> Result<(), VaultError> {
        let mut blobs: Vec<(String, PathBuf)> = std::fs::read_dir(dir)?
            .flatten()
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| {
                let file_name = entry.file_name().to_string_lossy().into_owned();
                if is_temp_file_name(&file_name) {
                    return None;
                }
                original_name_from_blob(&file_name)
                    .map(|original| (original.to_string(), entry.path()))
            })
            .collect();
        blobs.sort();

        for (original_name, blob_path) in blobs {
            let data = match std::fs::read(&blob_path)
                .map_err(VaultError::from)
                .and_then(|bytes| content::decompress(&bytes))
            {
                Ok(data) => data,
                Err(e) => {
                    report.warnings.push(RestoreWarning::Corrupt {
                        file: original_name,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            write_restored(&original_name, &data, report);
        }

        Ok(())
    }

    /// 校验归档：每个记录的文件都存在、可解压、摘要和大小一致，不写出任何文件
    pub fn verify(&self, name: &str) -> Result<VerifyReport, VaultError> {
        validate_name(name)?;
        let dir = self.archive_dir(name);
        if !dir.is_dir() {
            return Err(VaultError::NoBackupFound(name.to_string()));
        }

        let mut report = VerifyReport {
            script_name: name.to_string(),
            verified: Vec::new(),
            warnings: Vec::new(),
        };

        let manifest = match self.load_manifest(name) {
            Ok(Some(manifest)) => manifest,
            Ok(None) => {
                report.warnings.push(RestoreWarning::ManifestUnreadable {
                    reason: format!("{} 不存在", MANIFEST_FILE_NAME),
                });
                return Ok(report);
            }
            Err(e) => {
                report.warnings.push(RestoreWarning::ManifestUnreadable {
                    reason: e.to_string(),
                });
                return Ok(report);
            }
        };

        for (original_name, entry) in &manifest.files {
            match read_entry(&dir, original_name, entry) {
                Ok(data) => match check_integrity(original_name, entry, &data) {
                    Some(warning) => report.warnings.push(warning),
                    None => report.verified.push(original_name.clone()),
                },
                Err(warning) => report.warnings.push(warning),
            }
        }

        Ok(report)
    }

    /// 判断脚本是否需要重新备份
    ///
    /// 以下情况需要：没有元数据或元数据损坏、没有文件记录、记录的源路径不同、
    /// 数据文件缺失、当前源文件内容与记录的摘要或大小不同。
    pub fn needs_backup(&self, record: &ScriptRecord) -> bool {
        let manifest = match self.load_manifest(&record.name) {
            Ok(Some(manifest)) => manifest,
            _ => return true,
        };
        if manifest.files.is_empty() {
            return true;
        }

        let Some(source) = record.path.as_deref() else {
            return false;
        };
        if manifest.original_path.as_deref() != Some(&*source.to_string_lossy()) {
            return true;
        }

        let Some(base_name) = source.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return true;
        };
        let Some(entry) = manifest.files.get(&base_name) else {
            return true;
        };
        if !self.archive_dir(&record.name).join(&entry.backup_file).is_file() {
            return true;
        }

        match std::fs::read(source) {
            Ok(raw) => raw.len() as u64 != entry.orig_size || content::digest(&raw) != entry.sha256,
            Err(_) => true,
        }
    }
}

/// 取路径的最后一段，拒绝 `..` 之类会逃出目录的名字
fn plain_file_name(name: &str) -> Option<&str> {
    let file_name = Path::new(name).file_name()?.to_str()?;
    (file_name == name).then_some(file_name)
}

/// 读取并解压单个元数据条目
fn read_entry(
    dir: &Path,
    original_name: &str,
    entry: &ManifestEntry,
) -> Result<Vec<u8>, RestoreWarning> {
    let blob_name = plain_file_name(&entry.backup_file).ok_or_else(|| RestoreWarning::Corrupt {
        file: original_name.to_string(),
        reason: format!("非法的数据文件名 {:?}", entry.backup_file),
    })?;

    let blob_path = dir.join(blob_name);
    if !blob_path.is_file() {
        return Err(RestoreWarning::MissingBlob {
            file: original_name.to_string(),
        });
    }

    std::fs::read(&blob_path)
        .map_err(VaultError::from)
        .and_then(|bytes| content::decompress(&bytes))
        .map_err(|e| RestoreWarning::Corrupt {
            file: original_name.to_string(),
            reason: e.to_string(),
        })
}

/// 比较恢复内容与记录的摘要和大小（旧元数据可能没有摘要，此时跳过）
fn check_integrity(
    original_name: &str,
    entry: &ManifestEntry,
    data: &[u8],
) -> Option<RestoreWarning> {
    if entry.sha256.is_empty() {
        return None;
    }
    let actual = content::digest(data);
    if actual != entry.sha256 || data.len() as u64 != entry.orig_size {
        return Some(RestoreWarning::IntegrityMismatch {
            file: original_name.to_string(),
            expected: entry.sha256.clone(),
            actual,
        });
    }
    None
}

/// 写出一个恢复文件，结果记入报告
fn write_restored(original_name: &str, data: &[u8], report: &mut RestoreReport) {
    let Some(file_name) = plain_file_name(original_name) else {
        report.warnings.push(RestoreWarning::WriteFailed {
            file: original_name.to_string(),
            reason: "文件名不是单一路径段".to_string(),
        });
        return;
    };

    let out_path = report.target_dir.join(file_name);
    let result = std::fs::create_dir_all(&report.target_dir)
        .and_then(|()| write_atomic(&out_path, data));
    match result {
        Ok(()) => report.restored.push(out_path),
        Err(e) => report.warnings.push(RestoreWarning::WriteFailed {
            file: original_name.to_string(),
            reason: e.to_string(),
        }),
    }
}
