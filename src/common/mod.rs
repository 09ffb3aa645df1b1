//! 公共模块
//!
//! 提供跨模块使用的通用组件

mod temp_file;

pub use temp_file::{
    cleanup_stale_temp_files, is_temp_file_name, write_atomic, TempFileGuard, TEMP_PREFIX,
    TEMP_SUFFIX,
};
