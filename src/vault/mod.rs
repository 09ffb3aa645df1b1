//! 脚本仓库模块
//!
//! 维护脚本目录，并为每个脚本保存压缩备份，支持：
//! - 内容压缩与 SHA-256 校验
//! - 每个脚本一个归档目录（`metadata.json` + `.gz` 数据块）
//! - 恢复时逐文件隔离损坏，校验失败给出警告
//! - 运行检测（文件正在使用时推迟备份）
//! - 后台延迟备份调度

pub mod archive;
pub mod catalog;
pub mod content;
pub mod detector;
pub mod error;
pub mod manager;
pub mod manifest;
pub mod scheduler;

pub use archive::{BackupArchive, BackupOutcome, RestoreReport, RestoreWarning, VerifyReport};
pub use catalog::{validate_name, CatalogStore, JsonCatalogStore, MemoryCatalogStore, ScriptRecord};
pub use detector::{NeverInUse, ProcessTableDetector, RunningFileDetector};
pub use error::{ErrorCategory, VaultError};
pub use manager::{BackupRequest, ScriptUpdate, VaultManager};
pub use manifest::{ArchiveManifest, ManifestEntry};
pub use scheduler::{PendingBackupScheduler, SchedulerState, SweepReport};
