//! 脚本目录
//!
//! 目录是 [`ScriptRecord`] 的有序列表，整体读取、整体写回。
//! 备份子系统只通过 [`CatalogStore`] 的 load/save 访问它，
//! 存储方式（JSON 文件、内存）可以替换而不影响调用方。

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::error::VaultError;
use crate::common::write_atomic;

/// 脚本记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptRecord {
    /// 脚本名（目录内唯一，也是归档目录名）
    pub name: String,
    /// 脚本文件路径
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// 描述
    #[serde(default)]
    pub description: String,
    /// 是否有待执行的延迟备份
    #[serde(default, skip_serializing_if = "is_false")]
    pub pending_backup: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl ScriptRecord {
    /// 创建新记录
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            path: Some(path.into()),
            description: description.into(),
            pending_backup: false,
        }
    }
}

/// 校验脚本名
///
/// 脚本名会直接作为归档目录名和恢复目录名使用。
pub fn validate_name(name: &str) -> Result<(), VaultError> {
    let invalid = name.trim().is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(VaultError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// 目录存储
pub trait CatalogStore: Send + Sync {
    /// 读取全部记录（保持顺序）
    fn load(&self) -> Result<Vec<ScriptRecord>, VaultError>;

    /// 整体写回全部记录
    fn save(&self, records: &[ScriptRecord]) -> Result<(), VaultError>;
}

/// JSON 文件目录（scripts.json）
#[derive(Debug)]
pub struct JsonCatalogStore {
    path: PathBuf,
}

impl JsonCatalogStore {
    /// 创建 JSON 目录存储
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 目录文件路径
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CatalogStore for JsonCatalogStore {
    fn load(&self) -> Result<Vec<ScriptRecord>, VaultError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| VaultError::Catalog(format!("读取 {} 失败: {}", self.path.display(), e)))?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&content)
            .map_err(|e| VaultError::Catalog(format!("解析 {} 失败: {}", self.path.display(), e)))
    }

    fn save(&self, records: &[ScriptRecord]) -> Result<(), VaultError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(records)
            .map_err(|e| VaultError::Catalog(format!("序列化目录失败: {}", e)))?;
        write_atomic(&self.path, content.as_bytes())
            .map_err(|e| VaultError::Catalog(format!("写入 {} 失败: {}", self.path.display(), e)))?;

        tracing::debug!("目录已保存: {} 条记录 -> {:?}", records.len(), self.path);
        Ok(())
    }
}

/// 内存目录（嵌入使用或测试）
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    records: RwLock<Vec<ScriptRecord>>,
}

impl MemoryCatalogStore {
    /// 用初始记录创建
    pub fn with_records(records: Vec<ScriptRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }
}

impl CatalogStore for MemoryCatalogStore {
    fn load(&self) -> Result<Vec<ScriptRecord>, VaultError> {
        Ok(self.records.read().clone())
    }

    fn save(&self, records: &[ScriptRecord]) -> Result<(), VaultError> {
        *self.records.write() = records.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("demo").is_ok());
        assert!(validate_name("my script v2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("   ").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\\b").is_err());
    }

    #[test]
    fn test_json_store_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = JsonCatalogStore::new(dir.path().join("scripts.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_json_store_save_and_load() {
        let dir = tempdir().unwrap();
        let store = JsonCatalogStore::new(dir.path().join("nested").join("scripts.json"));

        let mut pending = ScriptRecord::new("b", "/tmp/b.sh", "");
        pending.pending_backup = true;
        let records = vec![ScriptRecord::new("a", "/tmp/a.py", "first"), pending];
        store.save(&records).unwrap();

        assert_eq!(store.load().unwrap(), records);

        // pending_backup 为 false 时不写出
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(raw.matches("pending_backup").count(), 1);
    }

    #[test]
    fn test_json_store_reads_legacy_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scripts.json");
        std::fs::write(
            &path,
            r#"[
    {"name": "demo", "path": "C:\\tools\\demo.py", "description": "x"},
    {"name": "busy", "path": "/opt/busy.sh", "description": "", "pending_backup": true},
    {"name": "bare"}
]"#,
        )
        .unwrap();

        let records = JsonCatalogStore::new(&path).load().unwrap();
        assert_eq!(records.len(), 3);
        assert!(!records[0].pending_backup);
        assert!(records[1].pending_backup);
        assert!(records[2].path.is_none());
    }

    #[test]
    fn test_json_store_rejects_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scripts.json");
        std::fs::write(&path, "[{ broken").unwrap();

        let store = JsonCatalogStore::new(&path);
        assert!(matches!(store.load(), Err(VaultError::Catalog(_))));
        // 损坏的文件不会被覆盖
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[{ broken");
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryCatalogStore::default();
        assert!(store.load().unwrap().is_empty());

        store.save(&[ScriptRecord::new("a", "/a", "")]).unwrap();
        assert_eq!(store.load().unwrap()[0].name, "a");
    }
}
