//! 归档元数据（metadata.json）
//!
//! 字段名与磁盘格式保持稳定：
//!
//! ```json
//! {
//!     "original_path": "/home/me/tools/demo.py",
//!     "description": "demo",
//!     "timestamp": "2026-10-19T12:00:00.123456",
//!     "files": {
//!         "demo.py": { "backup_file": "demo.py.gz", "sha256": "…", "orig_size": 8 }
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::error::VaultError;
use crate::common::write_atomic;

/// 元数据文件名
pub const MANIFEST_FILE_NAME: &str = "metadata.json";

/// 压缩数据文件后缀
pub const BLOB_SUFFIX: &str = ".gz";

/// 单个已归档文件的记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// 归档目录中的压缩数据文件名
    pub backup_file: String,
    /// 原始（未压缩）内容的 SHA-256
    pub sha256: String,
    /// 原始大小（字节）
    pub orig_size: u64,
}

/// 归档元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    /// 备份时记录的源路径
    #[serde(default)]
    pub original_path: Option<String>,
    /// 备份时的脚本描述
    #[serde(default)]
    pub description: String,
    /// 创建时间（本地时间，ISO-8601，不带时区）
    pub timestamp: NaiveDateTime,
    /// 原始文件名 → 归档记录
    #[serde(default)]
    pub files: BTreeMap<String, ManifestEntry>,
}

impl ArchiveManifest {
    /// 创建不含任何文件的元数据
    pub fn new(original_path: Option<String>, description: impl Into<String>) -> Self {
        Self {
            original_path,
            description: description.into(),
            timestamp: chrono::Local::now().naive_local(),
            files: BTreeMap::new(),
        }
    }

    /// 添加文件记录
    pub fn with_file(mut self, original_name: impl Into<String>, entry: ManifestEntry) -> Self {
        self.files.insert(original_name.into(), entry);
        self
    }

    /// 从文件加载
    pub fn load(path: &Path) -> Result<Self, VaultError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| VaultError::CorruptArchive(format!("解析 {} 失败: {}", path.display(), e)))
    }

    /// 原子写入文件
    pub fn save(&self, path: &Path) -> Result<(), VaultError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| VaultError::FileSystem(format!("序列化元数据失败: {}", e)))?;
        write_atomic(path, content.as_bytes())?;
        Ok(())
    }
}

/// 由原始文件名得到压缩数据文件名
pub fn blob_name_for(original_name: &str) -> String {
    format!("{}{}", original_name, BLOB_SUFFIX)
}

/// 由压缩数据文件名还原原始文件名（不是 `.gz` 结尾时返回 None）
pub fn original_name_from_blob(blob_name: &str) -> Option<&str> {
    blob_name
        .strip_suffix(BLOB_SUFFIX)
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_blob_naming() {
        assert_eq!(blob_name_for("demo.py"), "demo.py.gz");
        assert_eq!(original_name_from_blob("demo.py.gz"), Some("demo.py"));
        assert_eq!(original_name_from_blob("metadata.json"), None);
        assert_eq!(original_name_from_blob(".gz"), None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE_NAME);

        let manifest = ArchiveManifest::new(Some("/tmp/demo.py".to_string()), "demo").with_file(
            "demo.py",
            ManifestEntry {
                backup_file: blob_name_for("demo.py"),
                sha256: "ab".repeat(32),
                orig_size: 8,
            },
        );
        manifest.save(&path).unwrap();

        let loaded = ArchiveManifest::load(&path).unwrap();
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn test_load_legacy_manifest() {
        // 旧工具写出的格式：Python isoformat 时间戳，original_path 可能为 null
        let dir = tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE_NAME);
        std::fs::write(
            &path,
            r#"{
    "original_path": null,
    "description": "",
    "timestamp": "2024-05-01T09:30:15.123456",
    "files": {}
}"#,
        )
        .unwrap();

        let loaded = ArchiveManifest::load(&path).unwrap();
        assert!(loaded.original_path.is_none());
        assert!(loaded.files.is_empty());
        assert_eq!(loaded.timestamp.to_string(), "2024-05-01 09:30:15.123456");
    }

    #[test]
    fn test_load_invalid_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            ArchiveManifest::load(&path),
            Err(VaultError::CorruptArchive(_))
        ));
    }
}
