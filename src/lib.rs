// Script Vault Library
// 脚本仓库核心库：脚本目录 + 压缩备份 / 恢复

// 公共工具模块
pub mod common;

// 配置管理模块
pub mod config;

// 脚本仓库模块
pub mod vault;

// 导出常用类型
pub use config::AppConfig;
pub use vault::{
    BackupArchive, BackupOutcome, BackupRequest, CatalogStore, JsonCatalogStore,
    PendingBackupScheduler, RestoreReport, RunningFileDetector, ScriptRecord, ScriptUpdate,
    VaultError, VaultManager,
};
