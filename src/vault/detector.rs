//! 运行检测
//!
//! 判断脚本文件是否正被某个进程使用。这是基于进程表的启发式判断，不是文件锁：
//! - 返回 false 只表示“假定空闲”，不表示“确认空闲”
//! - 子串匹配可能误报（例如同名文件被其他进程打开）
//!
//! 平台上有更精确的机制（例如咨询锁）时，实现 [`RunningFileDetector`] 替换即可。

use std::path::{Component, Path, PathBuf};

use parking_lot::Mutex;
use sysinfo::{Pid, System};

/// 运行检测能力
pub trait RunningFileDetector: Send + Sync {
    /// 文件是否正被使用
    fn is_in_use(&self, path: &Path) -> bool;
}

/// 不做检测：总是返回 false
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverInUse;

impl RunningFileDetector for NeverInUse {
    fn is_in_use(&self, _path: &Path) -> bool {
        false
    }
}

/// 基于进程表的检测器
///
/// 对每个存活进程检查可执行文件路径和命令行参数，满足任一条件即视为在使用：
/// 1. 某个参数的绝对路径等于目标的绝对路径
/// 2. 可执行文件名与目标文件名相同（忽略大小写）
/// 3. 目标文件名是某个参数的子串
pub struct ProcessTableDetector {
    /// 系统信息实例
    system: Mutex<System>,
    /// 当前进程 ID（自身的命令行常常带着脚本名，需要跳过）
    own_pid: Pid,
}

impl ProcessTableDetector {
    /// 创建检测器
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            own_pid: Pid::from_u32(std::process::id()),
        }
    }

    /// 当前平台是否支持枚举进程
    pub fn is_supported() -> bool {
        sysinfo::IS_SUPPORTED_SYSTEM
    }
}

impl Default for ProcessTableDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProcessTableDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTableDetector")
            .field("own_pid", &self.own_pid)
            .finish()
    }
}

impl RunningFileDetector for ProcessTableDetector {
    fn is_in_use(&self, path: &Path) -> bool {
        if !Self::is_supported() {
            return false;
        }
        let Some(target) = MatchTarget::new(path) else {
            return false;
        };

        let mut system = self.system.lock();
        system.refresh_processes();

        let hit = system
            .processes()
            .iter()
            .filter(|(pid, _)| **pid != self.own_pid)
            .find(|(_, process)| target.matches(process.exe(), process.cmd()));

        match hit {
            Some((pid, process)) => {
                tracing::debug!(
                    "{} 疑似被进程 {} ({}) 使用",
                    path.display(),
                    pid,
                    process.name()
                );
                true
            }
            None => false,
        }
    }
}

/// 预先计算好的匹配目标
#[derive(Debug, Clone)]
pub struct MatchTarget {
    /// 目标的绝对路径
    absolute: PathBuf,
    /// 目标文件名
    file_name: String,
}

impl MatchTarget {
    /// 由目标路径构造（没有文件名时返回 None）
    pub fn new(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_string_lossy().into_owned();
        Some(Self {
            absolute: absolutize(path),
            file_name,
        })
    }

    /// 判断一个进程是否在使用目标
    pub fn matches<S: AsRef<str>>(&self, exe: Option<&Path>, cmd: &[S]) -> bool {
        let args = cmd.iter().map(AsRef::as_ref).filter(|arg| !arg.is_empty());

        for arg in args {
            if absolutize(Path::new(arg)) == self.absolute {
                return true;
            }
            if arg.contains(self.file_name.as_str()) {
                return true;
            }
        }

        exe.and_then(Path::file_name)
            .map(|exe_name| {
                exe_name
                    .to_string_lossy()
                    .eq_ignore_ascii_case(&self.file_name)
            })
            .unwrap_or(false)
    }
}

/// 词法意义上的绝对路径：相对路径拼接当前目录，并消去 `.` 与 `..`，不解析符号链接
pub fn absolutize(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> MatchTarget {
        MatchTarget::new(Path::new("/opt/tools/sync_job.py")).unwrap()
    }

    #[test]
    fn test_absolutize() {
        assert_eq!(
            absolutize(Path::new("/opt/tools/../tools/./a.py")),
            PathBuf::from("/opt/tools/a.py")
        );
        let relative = absolutize(Path::new("a.py"));
        assert!(relative.is_absolute());
        assert!(relative.ends_with("a.py"));
    }

    #[test]
    fn test_matches_absolute_argument() {
        let t = target();
        assert!(t.matches(
            Some(Path::new("/usr/bin/python3")),
            &["python3", "/opt/tools/../tools/sync_job.py"],
        ));
    }

    #[test]
    fn test_matches_executable_name_case_insensitive() {
        let t = MatchTarget::new(Path::new("C:/tools/Backup.EXE")).unwrap();
        let empty: [&str; 0] = [];
        assert!(t.matches(Some(Path::new("/mnt/c/tools/backup.exe")), &empty));
    }

    #[test]
    fn test_matches_substring_of_argument() {
        let t = target();
        assert!(t.matches(None, &["python3", "-u", "./sync_job.py"]));
        assert!(t.matches(None, &["--script=sync_job.py"]));
    }

    #[test]
    fn test_no_match() {
        let t = target();
        assert!(!t.matches(
            Some(Path::new("/usr/bin/python3")),
            &["python3", "/opt/tools/other.py"],
        ));
        let empty: [String; 0] = [];
        assert!(!t.matches(None, &empty));
    }

    #[test]
    fn test_never_in_use() {
        assert!(!NeverInUse.is_in_use(Path::new("/bin/sh")));
    }

    #[test]
    fn test_path_without_file_name() {
        assert!(MatchTarget::new(Path::new("/")).is_none());
        let detector = ProcessTableDetector::new();
        assert!(!detector.is_in_use(Path::new("/")));
    }

    #[test]
    fn test_unused_file_is_free() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never-started-7f3c2a.sh");
        std::fs::write(&path, "exit 0").unwrap();

        let detector = ProcessTableDetector::new();
        assert!(!detector.is_in_use(&path));
    }
}
