use std::sync::Mutex;

use crate::{
    disk::block_device::BlockDevice,
    fs::error::{FsError, Result},
};

/// 内存虚拟磁盘，接口与 FileDisk 完全一致
///
/// 用于嵌入场景和测试，不落盘。
#[derive(Debug)]
pub struct MemDisk {
    data: Mutex<Option<Vec<u8>>>,
    block_size: usize,
    total_blocks: u64,
}

impl MemDisk {
    pub fn new(block_size: usize, total_blocks: u64) -> Self {
        Self {
            data: Mutex::new(Some(vec![0u8; block_size * total_blocks as usize])),
            block_size,
            total_blocks,
        }
    }

    fn check_id(&self, block_id: u64) -> Result<()> {
        if block_id >= self.total_blocks {
            return Err(FsError::InvalidBlockId(block_id));
        }
        Ok(())
    }
}

impl BlockDevice for MemDisk {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    fn read_block(&self, block_id: u64, buf: &mut [u8]) -> Result<()> {
        self.check_id(block_id)?;
        let guard = self.data.lock().unwrap();
        let data = guard.as_ref().ok_or(FsError::NotInitialized)?;

        let start = block_id as usize * self.block_size;
        buf[..self.block_size].copy_from_slice(&data[start..start + self.block_size]);
        Ok(())
    }

    fn write_block(&self, block_id: u64, buf: &[u8]) -> Result<()> {
        self.check_id(block_id)?;
        let mut guard = self.data.lock().unwrap();
        let data = guard.as_mut().ok_or(FsError::NotInitialized)?;

        let start = block_id as usize * self.block_size;
        let block = &mut data[start..start + self.block_size];
        let n = buf.len().min(self.block_size);
        block[..n].copy_from_slice(&buf[..n]);
        block[n..].fill(0);
        Ok(())
    }

    fn format(&self) -> Result<()> {
        let mut guard = self.data.lock().unwrap();
        let data = guard.as_mut().ok_or(FsError::NotInitialized)?;
        data.fill(0);
        Ok(())
    }

    fn release(&self) {
        self.data.lock().unwrap().take();
    }
}
