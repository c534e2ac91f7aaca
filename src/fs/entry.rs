use serde::{Deserialize, Serialize};

use crate::utils::{current_timestamp, generate_uuid};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// 文件/目录的元数据记录
///
/// id 是重新加载后仍然稳定的唯一标识，两个条目相等当且仅当 id 相等。
/// deleted 是唯一权威的软删除标记，只能通过 mark_deleted 设置。
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FileEntry {
    pub id: String,
    pub name: String,
    pub kind: EntryKind,
    pub parent: String,            // 父目录完整路径
    pub size: u64,                 // 仅文件有意义，目录恒为 0
    pub start_block: Option<u64>,  // None = 尚未分配
    pub created: u64,
    pub modified: u64,
    pub read_only: bool,
    deleted: bool,
}

impl FileEntry {
    pub fn new(name: &str, kind: EntryKind, parent: &str) -> Self {
        let now = current_timestamp();
        Self {
            id: generate_uuid(),
            name: name.to_string(),
            kind,
            parent: parent.to_string(),
            size: 0,
            start_block: None,
            created: now,
            modified: now,
            read_only: false,
            deleted: false,
        }
    }

    /// 从磁盘记录重建条目（时间戳不持久化，取加载时刻）
    pub fn from_record(
        name: String,
        kind: EntryKind,
        parent: &str,
        size: u64,
        start_block: Option<u64>,
        deleted: bool,
        id: String,
    ) -> Self {
        let now = current_timestamp();
        Self {
            id,
            name,
            kind,
            parent: parent.to_string(),
            size,
            start_block,
            created: now,
            modified: now,
            read_only: false,
            deleted,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// 软删除；物理清理发生在所属目录下一次持久化时
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.touch();
    }

    /// 更新修改时间
    pub fn touch(&mut self) {
        self.modified = current_timestamp();
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

impl PartialEq for FileEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for FileEntry {}
