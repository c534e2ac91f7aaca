use bitflags::bitflags;

use crate::fs::{
    config::MAX_OPEN_HANDLES,
    error::{FsError, Result},
};

bitflags! {
    /// 打开文件时的访问模式
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessMode: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
        const READ_WRITE = 0b11;
    }
}

/// 一个打开的文件句柄，读写游标彼此独立
#[derive(Debug, Clone)]
pub struct OpenHandle {
    pub slot: u32,
    pub path: String,
    pub entry_id: String,
    pub mode: AccessMode,
    pub read_pos: u64,
    pub write_pos: u64,
    pub active: bool,
}

impl OpenHandle {
    pub fn can_read(&self) -> bool {
        self.mode.contains(AccessMode::READ)
    }

    pub fn can_write(&self) -> bool {
        self.mode.contains(AccessMode::WRITE)
    }

    /// 游标必须落在 [0, file_size] 内
    pub fn seek_read(&mut self, pos: u64, file_size: u64) -> Result<()> {
        if pos > file_size {
            return Err(FsError::CursorOutOfBounds {
                pos,
                size: file_size,
            });
        }
        self.read_pos = pos;
        Ok(())
    }

    pub fn seek_write(&mut self, pos: u64, file_size: u64) -> Result<()> {
        if pos > file_size {
            return Err(FsError::CursorOutOfBounds {
                pos,
                size: file_size,
            });
        }
        self.write_pos = pos;
        Ok(())
    }
}

/// 打开文件句柄表，固定 5 个槽位
///
/// 槽位占满时 open 直接报容量错误，从不阻塞等待。
#[derive(Debug)]
pub struct HandleTable {
    slots: Vec<Option<OpenHandle>>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_OPEN_HANDLES).map(|_| None).collect(),
        }
    }

    /// 打开句柄：同一路径已打开则复用，否则占用第一个空槽
    pub fn open(&mut self, path: &str, entry_id: &str, mode: AccessMode) -> Result<u32> {
        if let Some(existing) = self
            .slots
            .iter()
            .flatten()
            .find(|h| h.active && h.path == path)
        {
            return Ok(existing.slot);
        }

        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or_else(|| FsError::CapacityExhausted("open handle table is full".to_string()))?;

        self.slots[slot] = Some(OpenHandle {
            slot: slot as u32,
            path: path.to_string(),
            entry_id: entry_id.to_string(),
            mode,
            read_pos: 0,
            write_pos: 0,
            active: true,
        });
        Ok(slot as u32)
    }

    pub fn close(&mut self, slot: u32) -> Result<()> {
        let handle = self
            .slots
            .get_mut(slot as usize)
            .ok_or(FsError::BadHandle(slot))?;
        match handle {
            Some(h) if h.active => {
                h.active = false;
                *handle = None;
                Ok(())
            }
            _ => Err(FsError::BadHandle(slot)),
        }
    }

    pub fn close_all(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }

    pub fn get(&self, slot: u32) -> Result<&OpenHandle> {
        self.slots
            .get(slot as usize)
            .and_then(|s| s.as_ref())
            .filter(|h| h.active)
            .ok_or(FsError::BadHandle(slot))
    }

    pub fn get_mut(&mut self, slot: u32) -> Result<&mut OpenHandle> {
        self.slots
            .get_mut(slot as usize)
            .and_then(|s| s.as_mut())
            .filter(|h| h.active)
            .ok_or(FsError::BadHandle(slot))
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().flatten().filter(|h| h.active).count()
    }

    /// 某路径对应的活动句柄槽位
    pub fn find_by_path(&self, path: &str) -> Option<u32> {
        self.slots
            .iter()
            .flatten()
            .find(|h| h.active && h.path == path)
            .map(|h| h.slot)
    }
}
