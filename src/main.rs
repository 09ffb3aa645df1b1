use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use script_vault::config::{AppConfig, DEFAULT_CONFIG_FILE};
use script_vault::vault::{
    BackupArchive, BackupOutcome, BackupRequest, CatalogStore, JsonCatalogStore, NeverInUse,
    PendingBackupScheduler, ProcessTableDetector, RunningFileDetector, ScriptUpdate, VaultError,
    VaultManager,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// 脚本仓库：登记脚本并保存压缩备份
#[derive(Debug, Parser)]
#[command(name = "script-vault", version)]
struct Cli {
    /// 配置文件路径
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 列出已登记的脚本
    List,

    /// 登记脚本并立即备份
    Add {
        name: String,
        path: PathBuf,
        #[arg(long, default_value = "")]
        description: String,
        /// 备份被推迟时等待其完成
        #[arg(long)]
        wait: bool,
    },

    /// 修改脚本（必要时重新备份）
    Modify {
        name: String,
        #[arg(long = "name")]
        new_name: Option<String>,
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        wait: bool,
    },

    /// 从目录中删除脚本（保留备份）
    Remove { name: String },

    /// 立即备份
    Backup {
        name: String,
        #[arg(long)]
        wait: bool,
    },

    /// 恢复到 <dest>/<name>/
    Restore {
        name: String,
        /// 恢复根目录（默认使用配置中的 reproduced_dir）
        #[arg(long)]
        dest: Option<PathBuf>,
    },

    /// 校验备份完整性
    Verify { name: String },

    /// 处理所有待备份的脚本并等待完成
    Pending,
}

#[tokio::main]
async fn main() -> ExitCode {
    // 初始化日志系统
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report_error(&e),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = AppConfig::load_or_default(&cli.config).await;
    let manager = build_manager(&config);

    // Ctrl-C：停止调度器，当前扫描结束后退出
    let scheduler = manager.scheduler().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到中断信号，正在停止延迟备份调度器");
            scheduler.stop();
        }
    });

    match cli.command {
        Command::List => {
            let records = manager.list()?;
            if records.is_empty() {
                println!("(空)");
            }
            for record in records {
                let path = record
                    .path
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                let pending = if record.pending_backup { " [待备份]" } else { "" };
                println!("{}\t{}\t{}{}", record.name, path, record.description, pending);
            }
        }
        Command::Add {
            name,
            path,
            description,
            wait,
        } => {
            let request = manager.add_script(&name, path, &description)?;
            report_request(&name, &request, wait);
            if wait && request.is_deferred() {
                wait_for_scheduler(&manager).await;
            }
        }
        Command::Modify {
            name,
            new_name,
            path,
            description,
            wait,
        } => {
            let update = ScriptUpdate {
                name: new_name,
                path,
                description,
            };
            match manager.modify_script(&name, update)? {
                Some(request) => {
                    report_request(&name, &request, wait);
                    if wait && request.is_deferred() {
                        wait_for_scheduler(&manager).await;
                    }
                }
                None => println!("{}: 备份已是最新", name),
            }
        }
        Command::Remove { name } => {
            manager.remove_script(&name)?;
            println!(
                "已删除 {}，备份保留在 {}",
                name,
                manager.archive().archive_dir(&name).display()
            );
        }
        Command::Backup { name, wait } => {
            let request = manager.backup_now(&name)?;
            report_request(&name, &request, wait);
            if wait && request.is_deferred() {
                wait_for_scheduler(&manager).await;
            }
        }
        Command::Restore { name, dest } => {
            let report = match dest {
                Some(dest) => manager.restore_to(&name, &dest)?,
                None => manager.restore(&name)?,
            };
            for warning in &report.warnings {
                eprintln!("警告: {}", warning);
            }
            if report.is_noop() {
                println!("{}: 归档中没有可恢复的文件", name);
            } else {
                println!(
                    "已恢复 {} 个文件到 {}",
                    report.restored_count(),
                    report.target_dir.display()
                );
            }
        }
        Command::Verify { name } => {
            let report = manager.verify(&name)?;
            for warning in &report.warnings {
                eprintln!("警告: {}", warning);
            }
            if report.is_intact() {
                println!("{}: {} 个文件校验通过", name, report.verified.len());
            } else {
                anyhow::bail!("{}: 归档校验失败（{} 个问题）", name, report.warnings.len());
            }
        }
        Command::Pending => {
            if manager.resume_pending()? {
                wait_for_scheduler(&manager).await;
            } else {
                println!("没有待备份的脚本");
            }
        }
    }

    Ok(())
}

fn build_manager(config: &AppConfig) -> VaultManager {
    let store: Arc<dyn CatalogStore> =
        Arc::new(JsonCatalogStore::new(&config.storage.catalog_path));
    let archive = Arc::new(BackupArchive::new(&config.storage.backups_dir));
    let detector: Arc<dyn RunningFileDetector> =
        if config.detector.enabled && ProcessTableDetector::is_supported() {
            Arc::new(ProcessTableDetector::new())
        } else {
            info!("运行检测已关闭");
            Arc::new(NeverInUse)
        };
    let scheduler = Arc::new(PendingBackupScheduler::new(
        store.clone(),
        archive.clone(),
        detector.clone(),
        config.poll_interval(),
    ));

    VaultManager::new(
        store,
        archive,
        detector,
        scheduler,
        &config.storage.reproduced_dir,
    )
}

/// 错误输出：仓库错误使用用户友好的消息，退出码按错误分类
fn report_error(error: &anyhow::Error) -> ExitCode {
    match error.downcast_ref::<VaultError>() {
        Some(vault_error) => {
            tracing::debug!("{:?}", vault_error);
            eprintln!("错误: {}", vault_error.user_message());
            ExitCode::from(vault_error.category().exit_code())
        }
        None => {
            eprintln!("错误: {:#}", error);
            ExitCode::FAILURE
        }
    }
}

fn report_request(name: &str, request: &BackupRequest, waiting: bool) {
    println!("{}", request_message(name, request, waiting));
}

fn request_message(name: &str, request: &BackupRequest, waiting: bool) -> String {
    match request {
        BackupRequest::Deferred if waiting => format!("{}: 文件正在使用，备份已推迟", name),
        BackupRequest::Deferred => format!(
            "{}: 文件正在使用，备份已推迟；文件空闲后运行 `script-vault pending` 完成备份",
            name
        ),
        BackupRequest::Completed(BackupOutcome::Created { size, digest, .. }) => {
            format!("{}: 已备份 {} 字节 (sha256 {})", name, size, digest)
        }
        BackupRequest::Completed(BackupOutcome::NoSource) => {
            format!("{}: 源文件不存在，已记录空归档", name)
        }
        BackupRequest::Completed(BackupOutcome::PartialFailure { reason }) => {
            format!("{}: 备份失败: {}", name, reason)
        }
    }
}

async fn wait_for_scheduler(manager: &VaultManager) {
    info!("等待延迟备份完成（Ctrl-C 停止）");
    manager.scheduler().wait_idle().await;
    let pending = manager
        .list()
        .map(|records| records.iter().filter(|r| r.pending_backup).count())
        .context("读取目录失败");
    match pending {
        Ok(0) => println!("所有延迟备份已完成"),
        Ok(n) => println!("仍有 {} 个脚本待备份", n),
        Err(e) => eprintln!("{:#}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deferred_message_points_to_pending() {
        let message = request_message("job", &BackupRequest::Deferred, false);
        assert!(message.contains("script-vault pending"));

        let message = request_message("job", &BackupRequest::Deferred, true);
        assert!(!message.contains("script-vault pending"));
    }

    #[test]
    fn test_vault_errors_survive_anyhow() {
        let error = anyhow::Error::from(VaultError::ScriptNotFound("job".to_string()))
            .context("读取目录失败");
        let vault_error = error.downcast_ref::<VaultError>().unwrap();
        assert_eq!(vault_error.category().exit_code(), 2);
        assert_eq!(vault_error.user_message(), "目录中没有名为 job 的脚本");
    }
}
