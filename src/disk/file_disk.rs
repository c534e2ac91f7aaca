use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
    sync::Mutex,
};

use crate::{
    disk::block_device::BlockDevice,
    fs::error::{FsError, Result},
};

/// 基于宿主机单个文件的虚拟磁盘
///
/// 文件大小固定为 block_size * total_blocks，
/// 块 n 占据字节区间 [n*block_size, (n+1)*block_size)。
#[derive(Debug)]
pub struct FileDisk {
    file: Mutex<Option<File>>,
    block_size: usize,
    total_blocks: u64,
}

impl FileDisk {
    /// 打开（不存在则创建）虚拟磁盘文件，并扩展到完整大小
    pub fn open(path: impl AsRef<Path>, block_size: usize, total_blocks: u64) -> Result<Self> {
        let disk_size = block_size as u64 * total_blocks;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(FsError::ReadFailure)?;

        if file.metadata().map_err(FsError::ReadFailure)?.len() < disk_size {
            // 顶分配空间
            file.set_len(disk_size).map_err(FsError::WriteFailure)?;
        }

        Ok(Self {
            file: Mutex::new(Some(file)),
            block_size,
            total_blocks,
        })
    }

    fn check_id(&self, block_id: u64) -> Result<()> {
        if block_id >= self.total_blocks {
            return Err(FsError::InvalidBlockId(block_id));
        }
        Ok(())
    }
}

impl BlockDevice for FileDisk {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    fn read_block(&self, block_id: u64, buf: &mut [u8]) -> Result<()> {
        self.check_id(block_id)?;
        let mut guard = self.file.lock().unwrap();
        let file = guard.as_mut().ok_or(FsError::NotInitialized)?;

        file.seek(SeekFrom::Start(block_id * self.block_size as u64))
            .map_err(FsError::ReadFailure)?;

        // 读到 EOF 为止，不足一块用 0 补齐
        let out = &mut buf[..self.block_size];
        let mut read = 0;
        while read < out.len() {
            let n = file.read(&mut out[read..]).map_err(FsError::ReadFailure)?;
            if n == 0 {
                break;
            }
            read += n;
        }
        out[read..].fill(0);
        Ok(())
    }

    fn write_block(&self, block_id: u64, buf: &[u8]) -> Result<()> {
        self.check_id(block_id)?;
        let mut guard = self.file.lock().unwrap();
        let file = guard.as_mut().ok_or(FsError::NotInitialized)?;

        // 固定写满一块：超长截断，不足补 0
        let mut block = vec![0u8; self.block_size];
        let n = buf.len().min(self.block_size);
        block[..n].copy_from_slice(&buf[..n]);

        file.seek(SeekFrom::Start(block_id * self.block_size as u64))
            .map_err(FsError::WriteFailure)?;
        file.write_all(&block).map_err(FsError::WriteFailure)?;
        Ok(())
    }

    fn format(&self) -> Result<()> {
        let mut guard = self.file.lock().unwrap();
        let file = guard.as_mut().ok_or(FsError::NotInitialized)?;

        let zeros = vec![0u8; self.block_size];
        file.seek(SeekFrom::Start(0)).map_err(FsError::WriteFailure)?;
        for _ in 0..self.total_blocks {
            file.write_all(&zeros).map_err(FsError::WriteFailure)?;
        }
        file.flush().map_err(FsError::WriteFailure)?;
        Ok(())
    }

    fn release(&self) {
        self.file.lock().unwrap().take();
    }
}
