use std::fmt;

/// 存储引擎错误类型
#[derive(Debug)]
pub enum FsError {
    NotInitialized,                           // 介质或分配表尚未就绪
    NotMounted,                               // 未挂载就调用引擎操作
    InvalidBlockId(u64),                      // 块号越界或状态不允许该操作
    CapacityExhausted(String),                // 无空闲块 / 句柄表已满
    ReadFailure(std::io::Error),              // 底层介质读失败
    WriteFailure(std::io::Error),             // 底层介质写失败
    FlushFailed(Vec<(u64, FsError)>),         // 批量回写失败，按块号逐项记录
    BrokenChain { start: u64, at: u64 },      // 块链在 at 处损坏
    PathInvalid(String),                      // 路径非法
    NotFound(String),                         // 路径未命中活动条目
    WrongKind(String),                        // 期望文件/目录，实际相反
    AlreadyExists(String),                    // 创建时重名
    NotEmpty(String),                         // 目录下仍有活动条目
    ReadOnly(String),                         // 对只读文件做修改
    BadHandle(u32),                           // 句柄槽位未打开或已关闭
    ModeViolation(String),                    // 读写操作与句柄访问模式不符
    CursorOutOfBounds { pos: u64, size: u64 }, // 游标越过 [0, 文件大小]
    // 引擎层包装：保留底层原因，便于区分“请求非法”与“存储层异常”
    Operation {
        op: &'static str,
        path: String,
        source: Box<FsError>,
    },
}

impl FsError {
    /// 是否属于存储层自身的故障（而非调用方请求问题）
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            Self::NotInitialized
                | Self::InvalidBlockId(_)
                | Self::CapacityExhausted(_)
                | Self::ReadFailure(_)
                | Self::WriteFailure(_)
                | Self::FlushFailed(_)
                | Self::BrokenChain { .. }
        )
    }

    /// 存储层故障包装为操作级错误，请求类错误原样透传
    pub fn wrap(self, op: &'static str, path: &str) -> FsError {
        if self.is_storage_failure() {
            FsError::Operation {
                op,
                path: path.to_string(),
                source: Box::new(self),
            }
        } else {
            self
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "Storage medium is not initialized"),
            Self::NotMounted => write!(f, "File system is not mounted"),
            Self::InvalidBlockId(id) => write!(f, "Invalid block id: {}", id),
            Self::CapacityExhausted(what) => write!(f, "Capacity exhausted: {}", what),
            Self::ReadFailure(e) => write!(f, "Disk read failed: {}", e),
            Self::WriteFailure(e) => write!(f, "Disk write failed: {}", e),
            Self::FlushFailed(items) => {
                let ids: Vec<String> = items.iter().map(|(id, _)| id.to_string()).collect();
                write!(f, "Flush failed for blocks [{}]", ids.join(", "))
            }
            Self::BrokenChain { start, at } => {
                write!(f, "Block chain starting at {} is broken at {}", start, at)
            }
            Self::PathInvalid(path) => write!(f, "Invalid path: {}", path),
            Self::NotFound(path) => write!(f, "File or directory not found: {}", path),
            Self::WrongKind(path) => write!(f, "Wrong entry kind for operation: {}", path),
            Self::AlreadyExists(path) => write!(f, "File or directory already exists: {}", path),
            Self::NotEmpty(path) => write!(f, "Directory is not empty: {}", path),
            Self::ReadOnly(path) => write!(f, "Target is read-only: {}", path),
            Self::BadHandle(slot) => write!(f, "Handle {} is not open", slot),
            Self::ModeViolation(path) => {
                write!(f, "Handle access mode forbids this operation: {}", path)
            }
            Self::CursorOutOfBounds { pos, size } => {
                write!(f, "Cursor {} out of bounds (file size {})", pos, size)
            }
            Self::Operation { op, path, source } => {
                write!(f, "Operation '{}' failed on '{}': {}", op, path, source)
            }
        }
    }
}

impl std::error::Error for FsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFailure(e) | Self::WriteFailure(e) => Some(e),
            Self::Operation { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// 存储引擎统一结果类型
pub type Result<T> = std::result::Result<T, FsError>;
