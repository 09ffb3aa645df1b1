//! 备份错误处理模块
//!
//! 提供统一的错误分类和用户友好的错误消息。
//! 单个文件的失败（缺失数据、解压失败、摘要不符）不走这里，
//! 它们作为 [`RestoreWarning`](super::archive::RestoreWarning) 随结果返回。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 脚本仓库错误
#[derive(Debug, Error)]
pub enum VaultError {
    /// 脚本名不合法
    #[error("脚本名不合法: {0:?}")]
    InvalidName(String),

    /// 脚本名重复
    #[error("脚本名已存在: {0}")]
    DuplicateName(String),

    /// 目录中没有该脚本
    #[error("未找到脚本: {0}")]
    ScriptNotFound(String),

    /// 没有备份
    #[error("没有找到备份: {0}")]
    NoBackupFound(String),

    /// 压缩数据损坏
    #[error("备份数据损坏: {0}")]
    CorruptArchive(String),

    /// 脚本目录读写错误
    #[error("脚本目录错误: {0}")]
    Catalog(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 权限错误
    #[error("权限错误: {0}")]
    PermissionDenied(String),

    /// 文件不存在
    #[error("文件不存在: {0}")]
    FileNotFound(String),

    /// 文件系统错误
    #[error("文件系统错误: {0}")]
    FileSystem(String),
}

impl VaultError {
    /// 获取错误分类
    pub fn category(&self) -> ErrorCategory {
        classify_error(self)
    }

    /// 获取用户友好的错误消息
    pub fn user_message(&self) -> String {
        to_user_message(self)
    }
}

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// 调用方输入有误
    Input,
    /// 资源错误（文件缺失、备份缺失）
    Resource,
    /// 数据损坏
    Integrity,
    /// 权限错误
    Permission,
    /// 配置错误
    Configuration,
    /// 临时性 I/O 错误
    Transient,
}

impl ErrorCategory {
    /// 命令行退出码：输入或配置有误为 2，其余为 1
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorCategory::Input | ErrorCategory::Configuration => 2,
            _ => 1,
        }
    }
}

/// 错误分类函数
pub fn classify_error(error: &VaultError) -> ErrorCategory {
    match error {
        VaultError::InvalidName(_)
        | VaultError::DuplicateName(_)
        | VaultError::ScriptNotFound(_) => ErrorCategory::Input,
        VaultError::NoBackupFound(_) | VaultError::FileNotFound(_) => ErrorCategory::Resource,
        VaultError::CorruptArchive(_) | VaultError::Catalog(_) => ErrorCategory::Integrity,
        VaultError::PermissionDenied(_) => ErrorCategory::Permission,
        VaultError::Config(_) => ErrorCategory::Configuration,
        VaultError::FileSystem(_) => ErrorCategory::Transient,
    }
}

/// 生成用户友好的错误消息
pub fn to_user_message(error: &VaultError) -> String {
    match error {
        VaultError::InvalidName(name) => {
            format!("脚本名 {:?} 不可用：不能为空，也不能包含路径分隔符", name)
        }
        VaultError::DuplicateName(name) => format!("已存在名为 {} 的脚本", name),
        VaultError::ScriptNotFound(name) => format!("目录中没有名为 {} 的脚本", name),
        VaultError::NoBackupFound(name) => format!("脚本 {} 还没有任何备份", name),
        VaultError::CorruptArchive(_) => "备份数据已损坏，无法解压".to_string(),
        VaultError::Catalog(msg) => format!("脚本目录读写失败：{}", msg),
        VaultError::Config(msg) => format!("配置有误：{}", msg),
        VaultError::PermissionDenied(_) => "没有操作权限，请检查文件权限".to_string(),
        VaultError::FileNotFound(path) => format!("文件不存在：{}", path),
        VaultError::FileSystem(msg) => format!("文件操作失败：{}", msg),
    }
}

/// 从 std::io::Error 转换
impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => VaultError::FileNotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => VaultError::PermissionDenied(err.to_string()),
            _ => VaultError::FileSystem(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = VaultError::NoBackupFound("demo".to_string());
        assert_eq!(err.category(), ErrorCategory::Resource);

        let err = VaultError::CorruptArchive("invalid gzip header".to_string());
        assert_eq!(err.category(), ErrorCategory::Integrity);

        let err = VaultError::DuplicateName("demo".to_string());
        assert_eq!(err.category(), ErrorCategory::Input);
    }

    #[test]
    fn test_io_error_conversion() {
        let err: VaultError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, VaultError::FileNotFound(_)));

        let err: VaultError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert_eq!(err.category(), ErrorCategory::Permission);

        let err: VaultError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert!(matches!(err, VaultError::FileSystem(_)));
    }

    #[test]
    fn test_user_message() {
        let err = VaultError::NoBackupFound("demo".to_string());
        assert_eq!(err.user_message(), "脚本 demo 还没有任何备份");
    }

    #[test]
    fn test_exit_code() {
        assert_eq!(VaultError::ScriptNotFound("x".to_string()).category().exit_code(), 2);
        assert_eq!(VaultError::Config("x".to_string()).category().exit_code(), 2);
        assert_eq!(VaultError::NoBackupFound("x".to_string()).category().exit_code(), 1);
        assert_eq!(VaultError::FileSystem("x".to_string()).category().exit_code(), 1);
    }
}
