use serde::Serialize;

use crate::fs::{
    block_cache::BlockCache,
    config::{
        FAT_BAD, FAT_EOC, FAT_FREE, FAT_RESERVED_BLOCKS, FAT_START_BLOCK, MAX_ADDRESSABLE_BLOCKS,
    },
    error::{FsError, Result},
};

/// 单个块的分配状态（对外诊断视图）
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    EndOfChain,
    Bad,
    Next(u64),
}

/// 块分配表：每块一个字节的状态记录
///
/// 0 = 空闲，255 = 链尾，254 = 坏块/保留，其余值 = 下一块块号。
/// 链指针不能与哨兵冲突，因此总块数上限为 254。
/// 镜像持久化在保留块 0、1 中；紧跟表项之后的一个字节记录
/// 根目录链首（255 = 未分配）。
#[derive(Debug)]
pub struct Fat {
    entries: Vec<u8>,
    total_blocks: u64,
    root_start: Option<u64>,
}

impl Fat {
    /// 新建空表，块 0、1 标记为保留
    pub fn new(total_blocks: u64) -> Result<Self> {
        if total_blocks <= FAT_RESERVED_BLOCKS || total_blocks > MAX_ADDRESSABLE_BLOCKS {
            return Err(FsError::InvalidBlockId(total_blocks));
        }
        let mut entries = vec![FAT_FREE; total_blocks as usize];
        entries[0] = FAT_BAD;
        entries[1] = FAT_BAD;
        Ok(Self {
            entries,
            total_blocks,
            root_start: None,
        })
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub fn root_start(&self) -> Option<u64> {
        self.root_start
    }

    pub fn set_root_start(&mut self, start: Option<u64>) {
        self.root_start = start;
    }

    fn check_id(&self, block_id: u64) -> Result<()> {
        if block_id >= self.total_blocks {
            return Err(FsError::InvalidBlockId(block_id));
        }
        Ok(())
    }

    /// 分配第一个空闲块，标记为链尾
    pub fn allocate(&mut self) -> Result<u64> {
        for (id, entry) in self.entries.iter_mut().enumerate() {
            if *entry == FAT_FREE {
                *entry = FAT_EOC;
                return Ok(id as u64);
            }
        }
        Err(FsError::CapacityExhausted("no free block".to_string()))
    }

    /// 在链尾 block_id 之后追加一个新块
    pub fn allocate_next(&mut self, block_id: u64) -> Result<u64> {
        self.check_id(block_id)?;
        if self.entries[block_id as usize] != FAT_EOC {
            // 只允许从链尾扩展
            return Err(FsError::InvalidBlockId(block_id));
        }
        let new_id = self.allocate()?;
        self.entries[block_id as usize] = new_id as u8;
        Ok(new_id)
    }

    /// 链上 block_id 的下一块；None 表示到达链尾
    pub fn next_of(&self, block_id: u64) -> Result<Option<u64>> {
        self.check_id(block_id)?;
        match self.entries[block_id as usize] {
            FAT_FREE | FAT_BAD => Err(FsError::InvalidBlockId(block_id)),
            FAT_EOC => Ok(None),
            next => Ok(Some(next as u64)),
        }
    }

    /// 从 start 开始收集整条链的块号；损坏的链直接拒绝
    pub fn walk(&self, start: u64) -> Result<Vec<u64>> {
        let mut blocks = Vec::new();
        let mut cur = start;
        loop {
            if cur >= self.total_blocks || blocks.contains(&cur) {
                return Err(FsError::BrokenChain { start, at: cur });
            }
            match self.entries[cur as usize] {
                FAT_FREE | FAT_BAD => return Err(FsError::BrokenChain { start, at: cur }),
                FAT_EOC => {
                    blocks.push(cur);
                    return Ok(blocks);
                }
                next => {
                    blocks.push(cur);
                    cur = next as u64;
                }
            }
        }
    }

    pub fn chain_length(&self, start: u64) -> Result<u64> {
        Ok(self.walk(start)?.len() as u64)
    }

    /// 释放从 start 开始的整条链
    ///
    /// 逐块置为空闲；途中发现损坏（指向空闲块、越界、成环）时，
    /// 已走过的前缀保持释放，并报告损坏位置。
    pub fn free(&mut self, start: u64) -> Result<()> {
        let mut cur = start;
        loop {
            if cur >= self.total_blocks {
                return Err(FsError::BrokenChain { start, at: cur });
            }
            match self.entries[cur as usize] {
                // 已释放的前缀形成的环也会落到这里
                FAT_FREE | FAT_BAD => return Err(FsError::BrokenChain { start, at: cur }),
                FAT_EOC => {
                    self.entries[cur as usize] = FAT_FREE;
                    return Ok(());
                }
                next => {
                    self.entries[cur as usize] = FAT_FREE;
                    cur = next as u64;
                }
            }
        }
    }

    /// 把一个空闲块标记为坏块；已分配的块不允许标记
    pub fn mark_bad(&mut self, block_id: u64) -> Result<()> {
        self.check_id(block_id)?;
        match self.entries[block_id as usize] {
            FAT_FREE => {
                self.entries[block_id as usize] = FAT_BAD;
                Ok(())
            }
            FAT_BAD => Ok(()),
            _ => Err(FsError::InvalidBlockId(block_id)),
        }
    }

    pub fn is_bad(&self, block_id: u64) -> bool {
        block_id < self.total_blocks && self.entries[block_id as usize] == FAT_BAD
    }

    /// 当前空闲块数
    pub fn free_blocks(&self) -> u64 {
        self.entries.iter().filter(|&&e| e == FAT_FREE).count() as u64
    }

    pub fn state_of(&self, block_id: u64) -> Result<BlockState> {
        self.check_id(block_id)?;
        Ok(match self.entries[block_id as usize] {
            FAT_FREE => BlockState::Free,
            FAT_EOC => BlockState::EndOfChain,
            FAT_BAD => BlockState::Bad,
            next => BlockState::Next(next as u64),
        })
    }

    /// 整表状态快照（诊断视图用）
    pub fn snapshot(&self) -> Vec<BlockState> {
        self.entries
            .iter()
            .map(|&e| match e {
                FAT_FREE => BlockState::Free,
                FAT_EOC => BlockState::EndOfChain,
                FAT_BAD => BlockState::Bad,
                next => BlockState::Next(next as u64),
            })
            .collect()
    }

    /// 镜像字节：总块数个表项 + 一个根目录链首字节
    fn image(&self) -> Vec<u8> {
        let mut image = self.entries.clone();
        image.push(match self.root_start {
            Some(id) => id as u8,
            None => FAT_EOC,
        });
        image
    }

    /// 写入保留块 0、1；放不下两块时立即失败
    pub fn persist(&self, cache: &BlockCache) -> Result<()> {
        let block_size = cache.block_size();
        let image = self.image();
        if image.len() > block_size * FAT_RESERVED_BLOCKS as usize {
            return Err(FsError::CapacityExhausted(
                "allocation table does not fit in reserved blocks".to_string(),
            ));
        }

        let first = &image[..image.len().min(block_size)];
        cache.write(FAT_START_BLOCK, first)?;
        let rest = if image.len() > block_size {
            &image[block_size..]
        } else {
            &[]
        };
        cache.write(FAT_START_BLOCK + 1, rest)?;
        Ok(())
    }

    /// 从保留块加载；加载后块 0、1 必须仍是保留状态
    pub fn load(cache: &BlockCache, total_blocks: u64) -> Result<Self> {
        if total_blocks <= FAT_RESERVED_BLOCKS || total_blocks > MAX_ADDRESSABLE_BLOCKS {
            return Err(FsError::InvalidBlockId(total_blocks));
        }

        let mut image = cache.read(FAT_START_BLOCK)?;
        image.extend(cache.read(FAT_START_BLOCK + 1)?);
        if image.len() <= total_blocks as usize {
            return Err(FsError::CapacityExhausted(
                "allocation table does not fit in reserved blocks".to_string(),
            ));
        }

        let entries = image[..total_blocks as usize].to_vec();
        if entries[0] != FAT_BAD || entries[1] != FAT_BAD {
            return Err(FsError::NotInitialized);
        }

        let root_byte = image[total_blocks as usize];
        let root_start = if root_byte == FAT_EOC {
            None
        } else {
            Some(root_byte as u64)
        };

        Ok(Self {
            entries,
            total_blocks,
            root_start,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;
    use crate::fs::block_cache::CacheConfig;
    use std::sync::Arc;

    fn fat16() -> Fat {
        Fat::new(16).unwrap()
    }

    #[test]
    fn test_reserved_blocks_never_allocated() {
        let mut fat = fat16();
        assert_eq!(fat.allocate().unwrap(), 2);
        assert_eq!(fat.allocate().unwrap(), 3);
        assert!(fat.is_bad(0));
        assert!(fat.is_bad(1));
    }

    #[test]
    fn test_total_blocks_capped_by_sentinels() {
        assert!(Fat::new(254).is_ok());
        assert!(matches!(Fat::new(255), Err(FsError::InvalidBlockId(255))));
        assert!(matches!(Fat::new(2), Err(FsError::InvalidBlockId(2))));
    }

    #[test]
    fn test_chain_growth_and_walk() {
        let mut fat = fat16();
        let start = fat.allocate().unwrap();
        let mut tail = start;
        for _ in 0..3 {
            tail = fat.allocate_next(tail).unwrap();
        }

        assert_eq!(fat.chain_length(start).unwrap(), 4);
        let blocks = fat.walk(start).unwrap();
        assert_eq!(blocks.len(), 4);
        // 无重复块号
        let mut dedup = blocks.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), 4);
        assert_eq!(fat.next_of(tail).unwrap(), None);
    }

    #[test]
    fn test_allocate_next_requires_chain_tail() {
        let mut fat = fat16();
        let start = fat.allocate().unwrap();
        let second = fat.allocate_next(start).unwrap();
        // start 已不是链尾
        assert!(matches!(
            fat.allocate_next(start),
            Err(FsError::InvalidBlockId(_))
        ));
        assert!(fat.allocate_next(second).is_ok());
    }

    #[test]
    fn test_free_returns_chain_to_free_pool() {
        let mut fat = fat16();
        let before = fat.free_blocks();
        let start = fat.allocate().unwrap();
        let tail = fat.allocate_next(start).unwrap();
        fat.allocate_next(tail).unwrap();
        assert_eq!(fat.free_blocks(), before - 3);

        fat.free(start).unwrap();
        assert_eq!(fat.free_blocks(), before);
        // 释放后的块可重新分配
        assert_eq!(fat.allocate().unwrap(), start);
    }

    #[test]
    fn test_free_rejects_broken_chain() {
        let mut fat = fat16();
        let a = fat.allocate().unwrap();
        assert!(matches!(
            fat.free(a + 1),
            Err(FsError::BrokenChain { .. })
        ));
        // 指向空闲块的链
        fat.entries[a as usize] = (a + 5) as u8;
        assert!(matches!(fat.free(a), Err(FsError::BrokenChain { .. })));
    }

    #[test]
    fn test_capacity_exhausted_and_recovery() {
        let mut fat = fat16();
        let mut first = None;
        while let Ok(id) = fat.allocate() {
            first.get_or_insert(id);
        }
        assert_eq!(fat.free_blocks(), 0);
        assert!(matches!(
            fat.allocate(),
            Err(FsError::CapacityExhausted(_))
        ));

        fat.free(first.unwrap()).unwrap();
        assert_eq!(fat.allocate().unwrap(), first.unwrap());
    }

    #[test]
    fn test_persist_and_load() {
        let disk = Arc::new(MemDisk::new(512, 16));
        let cache = BlockCache::new(disk, CacheConfig::default());

        let mut fat = fat16();
        let start = fat.allocate().unwrap();
        fat.allocate_next(start).unwrap();
        fat.mark_bad(9).unwrap();
        fat.set_root_start(Some(start));

        fat.persist(&cache).unwrap();
        let loaded = Fat::load(&cache, 16).unwrap();
        assert_eq!(loaded.snapshot(), fat.snapshot());
        assert_eq!(loaded.root_start(), Some(start));
        assert!(loaded.is_bad(9));
    }

    #[test]
    fn test_load_requires_reserved_marks() {
        let disk = Arc::new(MemDisk::new(512, 16));
        let cache = BlockCache::new(disk, CacheConfig::default());
        // 块 0、1 全零（空闲）的镜像不是合法的表
        assert!(matches!(
            Fat::load(&cache, 16),
            Err(FsError::NotInitialized)
        ));
    }
}
