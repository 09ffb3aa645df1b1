//! 临时文件与原子写入
//!
//! 归档数据、元数据和脚本目录都先写入同目录下的临时文件，再 rename 到最终位置：
//! 读者要么看到旧内容，要么看到完整的新内容，不会看到写了一半的文件。

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// 临时文件名前缀
pub const TEMP_PREFIX: &str = ".vault-";

/// 临时文件名后缀
pub const TEMP_SUFFIX: &str = ".tmp";

/// 临时文件守卫
///
/// 使用 RAII 模式自动清理临时文件。
/// 守卫被丢弃时，如果文件还没有被 rename 到最终位置，就删除它。
pub struct TempFileGuard {
    /// 临时文件路径
    path: PathBuf,
    /// 是否已被持久化（如果是，则不删除）
    persisted: AtomicBool,
}

impl TempFileGuard {
    /// 创建新的临时文件守卫
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            persisted: AtomicBool::new(false),
        }
    }

    /// 在目标文件所在目录下分配一个临时文件
    pub fn beside(target: &Path) -> Self {
        let dir = target.parent().unwrap_or_else(|| Path::new("."));
        let filename = format!("{}{}{}", TEMP_PREFIX, uuid::Uuid::new_v4(), TEMP_SUFFIX);
        Self::new(dir.join(filename))
    }

    /// 获取文件路径
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 标记文件已持久化（不会被自动删除）
    pub fn persist(&self) {
        self.persisted.store(true, Ordering::SeqCst);
    }

    /// 检查文件是否已持久化
    pub fn is_persisted(&self) -> bool {
        self.persisted.load(Ordering::SeqCst)
    }

    /// 检查文件是否存在
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// 手动删除文件
    pub fn remove(&self) -> std::io::Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// 重命名到最终位置（同时标记为持久化）
    pub fn rename_to(&self, new_path: &Path) -> std::io::Result<()> {
        std::fs::rename(&self.path, new_path)?;
        self.persist();
        Ok(())
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.is_persisted() {
            if let Err(e) = self.remove() {
                tracing::warn!("清理临时文件失败: {} - {}", self.path.display(), e);
            }
        }
    }
}

impl std::fmt::Debug for TempFileGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempFileGuard")
            .field("path", &self.path)
            .field("persisted", &self.is_persisted())
            .finish()
    }
}

/// 原子写入：先写同目录临时文件并落盘，再 rename 覆盖目标
///
/// 任何一步失败时目标文件保持原样，临时文件由守卫清理。
pub fn write_atomic(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let guard = TempFileGuard::beside(target);
    {
        let mut file = File::create(guard.path())?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    guard.rename_to(target)
}

/// 判断文件名是否是本模块产生的临时文件
pub fn is_temp_file_name(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX)
}

/// 清理目录中残留的临时文件（进程中途退出时留下的）
pub fn cleanup_stale_temp_files(dir: &Path) -> std::io::Result<usize> {
    let mut cleaned = 0;

    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let is_temp = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(is_temp_file_name)
            .unwrap_or(false);
        if !is_temp {
            continue;
        }

        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!("已清理残留临时文件: {}", path.display());
                cleaned += 1;
            }
            Err(e) => tracing::warn!("删除残留临时文件失败: {} - {}", path.display(), e),
        }
    }

    Ok(cleaned)
}
