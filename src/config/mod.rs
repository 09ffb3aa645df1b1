// 配置管理模块

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// 默认配置文件名
pub const DEFAULT_CONFIG_FILE: &str = "script-vault.toml";

/// 应用配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// 存储路径配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 延迟备份配置
    #[serde(default)]
    pub pending: PendingConfig,
    /// 运行检测配置
    #[serde(default)]
    pub detector: DetectorConfig,
}

/// 存储路径配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// 脚本目录文件
    pub catalog_path: PathBuf,
    /// 备份根目录
    pub backups_dir: PathBuf,
    /// 默认恢复目录
    pub reproduced_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("scripts.json"),
            backups_dir: PathBuf::from("backups"),
            reproduced_dir: PathBuf::from("reproduced"),
        }
    }
}

/// 延迟备份配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PendingConfig {
    /// 轮询间隔（秒）
    pub poll_interval_secs: u64,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
        }
    }
}

/// 运行检测配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// 是否启用进程表检测（关闭后所有文件都视为空闲）
    pub enabled: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        Ok(())
    }

    /// 加载或创建默认配置
    ///
    /// 文件不存在时写出默认配置；文件存在但无效时只使用默认配置，不覆盖原文件。
    pub async fn load_or_default(path: &Path) -> Self {
        if !fs::try_exists(path).await.unwrap_or(false) {
            tracing::info!("配置文件不存在，创建默认配置: {}", path.display());
            let default_config = Self::default();

            // 尝试保存默认配置
            if let Err(e) = default_config.save_to_file(path).await {
                tracing::error!("保存默认配置失败: {:#}", e);
            }

            return default_config;
        }

        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path.display());
                config
            }
            Err(e) => {
                tracing::warn!(
                    "配置文件无效，本次使用默认配置（未修改 {}）: {:#}",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.pending.poll_interval_secs == 0 {
            bail!("pending.poll_interval_secs 必须大于等于 1");
        }
        if self.storage.catalog_path.as_os_str().is_empty() {
            bail!("storage.catalog_path 不能为空");
        }
        if self.storage.backups_dir.as_os_str().is_empty() {
            bail!("storage.backups_dir 不能为空");
        }
        Ok(())
    }

    /// 轮询间隔
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.pending.poll_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.storage.catalog_path, PathBuf::from("scripts.json"));
        assert_eq!(config.storage.backups_dir, PathBuf::from("backups"));
        assert_eq!(config.storage.reproduced_dir, PathBuf::from("reproduced"));
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert!(config.detector.enabled);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();

        let mut config = AppConfig::default();
        config.pending.poll_interval_secs = 30;
        config.detector.enabled = false;
        config.save_to_file(temp_file.path()).await.unwrap();

        let loaded = AppConfig::load_from_file(temp_file.path()).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "[pending]\npoll_interval_secs = 2\n").unwrap();

        let loaded = AppConfig::load_from_file(temp_file.path()).await.unwrap();
        assert_eq!(loaded.poll_interval(), Duration::from_secs(2));
        assert_eq!(loaded.storage, StorageConfig::default());
        assert!(loaded.detector.enabled);
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "[pending]\npoll_interval_secs = 0\n").unwrap();

        assert!(AppConfig::load_from_file(temp_file.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_load_or_default_keeps_invalid_file() {
        let temp_file = NamedTempFile::new().unwrap();
        let original =
            "[storage]\nbackups_dir = \"/srv/backups\"\n[pending]\npoll_interval_secs = 0\n";
        std::fs::write(temp_file.path(), original).unwrap();

        let config = AppConfig::load_or_default(temp_file.path()).await;
        assert_eq!(config, AppConfig::default());
        assert_eq!(std::fs::read_to_string(temp_file.path()).unwrap(), original);

        std::fs::write(temp_file.path(), "[storage\ntypo").unwrap();
        AppConfig::load_or_default(temp_file.path()).await;
        assert_eq!(std::fs::read_to_string(temp_file.path()).unwrap(), "[storage\ntypo");
    }

    #[tokio::test]
    async fn test_load_or_default_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conf").join(DEFAULT_CONFIG_FILE);

        let config = AppConfig::load_or_default(&path).await;
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());

        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded, config);
    }
}
