/// 分配表镜像固定存放在块 0、块 1
pub const FAT_START_BLOCK: u64 = 0;
pub const FAT_RESERVED_BLOCKS: u64 = 2;

/// 分配表单字节编码：0 = 空闲，255 = 链尾，254 = 坏块/保留，
/// 其余值 = 下一块块号
pub const FAT_FREE: u8 = 0;
pub const FAT_EOC: u8 = 255;
pub const FAT_BAD: u8 = 254;

/// 链指针不能与哨兵值冲突，因此该编码最多寻址 254 个块
pub const MAX_ADDRESSABLE_BLOCKS: u64 = FAT_BAD as u64;

/// 目录记录格式：字段分隔符、记录终止符
pub const DIR_FIELD_SEP: char = '|';
pub const DIR_RECORD_END: char = ';';

/// 目录项名称最大长度（超出截断）
pub const MAX_NAME_LEN: usize = 32;

/// 每块最多打包的目录记录数
pub const DIR_ENTRIES_PER_BLOCK: usize = 4;

/// 同时打开的文件句柄上限
pub const MAX_OPEN_HANDLES: usize = 5;

/// 块缓存默认参数
pub const DEFAULT_CACHE_CAPACITY: usize = 16;
pub const DEFAULT_DIRTY_THRESHOLD: usize = 8;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 2000;
