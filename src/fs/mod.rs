use std::{collections::HashMap, sync::Arc};

use crate::{
    disk::BlockDevice,
    fs::{
        block_cache::{BlockCache, FlushDaemon},
        config::MAX_NAME_LEN,
        directory::Directory,
        entry::{EntryKind, FileEntry},
        error::{FsError, Result},
        fat::{BlockState, Fat},
        handle::{AccessMode, HandleTable},
    },
};

pub mod block_cache;
pub mod config;
pub mod directory;
pub mod entry;
pub mod error;
pub mod fat;
pub mod handle;
pub mod path;

/// 存储引擎：路径/句柄两套操作的唯一入口
///
/// 自己持有分配表、块缓存、目录集合和路径索引，全部显式构造传入，
/// 不存在任何全局实例。目录按需懒加载；路径索引保存各目录条目的
/// 副本，用于快速查找，凡是改动条目的操作都同时刷新两份副本。
pub struct FileSystem {
    device: Arc<dyn BlockDevice>,
    cache: Arc<BlockCache>,
    fat: Fat,
    dirs: HashMap<String, Directory>,
    index: HashMap<String, FileEntry>,
    handles: HandleTable,
    flusher: Option<FlushDaemon>,
    mounted: bool,
}

impl FileSystem {
    pub fn new(device: Arc<dyn BlockDevice>, cache: BlockCache, fat: Fat) -> Result<Self> {
        if fat.total_blocks() != device.total_blocks() {
            return Err(FsError::InvalidBlockId(fat.total_blocks()));
        }
        Ok(Self {
            device,
            cache: Arc::new(cache),
            fat,
            dirs: HashMap::new(),
            index: HashMap::new(),
            handles: HandleTable::new(),
            flusher: None,
            mounted: false,
        })
    }

    fn ensure_mounted(&self) -> Result<()> {
        if !self.mounted {
            return Err(FsError::NotMounted);
        }
        Ok(())
    }

    /// 清零介质并写入一张全新的分配表
    ///
    /// 已挂载时直接作废当前挂载状态，不保留任何数据。
    pub fn format(&mut self) -> Result<()> {
        if self.mounted {
            self.handles.close_all();
            if let Some(mut daemon) = self.flusher.take() {
                daemon.stop();
            }
            self.mounted = false;
            self.index.clear();
            self.dirs.clear();
        }
        self.cache.discard();
        self.device.format()?;
        self.fat = Fat::new(self.device.total_blocks())?;
        self.fat.persist(&self.cache)?;
        self.cache.flush()?;
        Ok(())
    }

    /// 挂载：从保留块加载分配表，建立根目录并启动后台回写
    pub fn mount(&mut self) -> Result<()> {
        if self.mounted {
            return Ok(());
        }
        self.fat = Fat::load(&self.cache, self.device.total_blocks())?;
        self.index.clear();
        self.dirs.clear();

        let mut root = FileEntry::new("/", EntryKind::Directory, "");
        root.start_block = self.fat.root_start();
        self.index.insert("/".to_string(), root);
        self.load_dir("/")?;
        self.mounted = true;

        self.flusher = Some(FlushDaemon::start(
            self.cache.clone(),
            self.cache.flush_interval(),
        ));
        log::debug!("file system mounted, {} free blocks", self.fat.free_blocks());
        Ok(())
    }

    /// 卸载：关闭全部句柄，落盘所有状态，然后释放介质
    pub fn unmount(&mut self) -> Result<()> {
        self.ensure_mounted()?;
        self.handles.close_all();
        self.persist_all()?;
        self.cache.clear()?;
        if let Some(mut daemon) = self.flusher.take() {
            daemon.stop();
        }
        self.mounted = false;
        self.index.clear();
        self.dirs.clear();
        self.device.release();
        Ok(())
    }

    /// 不卸载的前提下把所有脏状态写回介质
    pub fn sync(&mut self) -> Result<()> {
        self.ensure_mounted()?;
        self.persist_all()?;
        self.cache.flush()?;
        Ok(())
    }

    fn persist_all(&mut self) -> Result<()> {
        // 深目录先持久化，链首变化沿途向上传播
        let mut paths: Vec<String> = self.dirs.keys().cloned().collect();
        paths.sort_by_key(|p| std::cmp::Reverse(if p == "/" { 0 } else { p.matches('/').count() }));
        for p in paths {
            self.persist_dir(&p)?;
        }
        self.fat.persist(&self.cache)?;
        self.cache.flush()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // 路径解析与目录懒加载
    // ------------------------------------------------------------------

    /// 懒加载一个目录：读出条目集合并把副本挂进路径索引
    fn load_dir(&mut self, dir_path: &str) -> Result<()> {
        if self.dirs.contains_key(dir_path) {
            return Ok(());
        }
        let entry = self
            .index
            .get(dir_path)
            .ok_or_else(|| FsError::NotFound(dir_path.to_string()))?;
        if !entry.is_directory() {
            return Err(FsError::WrongKind(dir_path.to_string()));
        }

        let mut dir = Directory::new(dir_path, entry.start_block);
        dir.load(&self.fat, &self.cache)?;
        for child in dir.active_entries() {
            let child_path = path::join(dir_path, &child.name);
            self.index.entry(child_path).or_insert_with(|| child.clone());
        }
        self.dirs.insert(dir_path.to_string(), dir);
        Ok(())
    }

    /// 确保从根到 dir_path 的每一级目录都已加载
    fn ensure_tree(&mut self, dir_path: &str) -> Result<()> {
        let mut chain = path::ancestors(dir_path);
        if dir_path != "/" {
            chain.push(dir_path.to_string());
        }
        for p in chain {
            self.load_dir(&p)?;
        }
        Ok(())
    }

    /// 解析路径为（规范化路径，条目副本）
    fn resolve(&mut self, raw: &str) -> Result<(String, FileEntry)> {
        let normalized = path::normalize(raw)?;
        if normalized == "/" {
            let root = self
                .index
                .get("/")
                .ok_or(FsError::NotMounted)?
                .clone();
            return Ok((normalized, root));
        }
        let (parent, _) = path::split(&normalized)?;
        self.ensure_tree(&parent)?;
        let entry = self
            .index
            .get(&normalized)
            .filter(|e| !e.is_deleted())
            .cloned()
            .ok_or_else(|| FsError::NotFound(normalized.clone()))?;
        Ok((normalized, entry))
    }

    /// 持久化一个目录；链首变化时逐级更新上级记录，根的链首进分配表
    fn persist_dir(&mut self, dir_path: &str) -> Result<()> {
        let mut cur = dir_path.to_string();
        loop {
            let Some(mut dir) = self.dirs.remove(&cur) else {
                return Ok(());
            };
            if !dir.is_modified() {
                self.dirs.insert(cur, dir);
                return Ok(());
            }
            let old_start = dir.start_block;
            let result = dir.persist(&mut self.fat, &self.cache);
            let new_start = dir.start_block;
            self.dirs.insert(cur.clone(), dir);
            result?;

            if new_start == old_start {
                return Ok(());
            }
            if let Some(e) = self.index.get_mut(&cur) {
                e.start_block = new_start;
            }
            if cur == "/" {
                self.fat.set_root_start(new_start);
                return Ok(());
            }
            let (parent, name) = path::split(&cur)?;
            if let Some(pd) = self.dirs.get_mut(&parent) {
                pd.update_entry(&name, |e| e.start_block = new_start)?;
            }
            cur = parent;
        }
    }

    /// 同步更新条目的两份副本（索引 + 所属目录），并刷新父目录时间戳
    fn apply_entry_update(&mut self, full: &str, f: impl Fn(&mut FileEntry)) -> Result<()> {
        if let Some(e) = self.index.get_mut(full) {
            f(e);
        }
        let (parent, name) = path::split(full)?;
        if let Some(pe) = self.index.get_mut(&parent) {
            pe.touch();
        }
        if let Some(dir) = self.dirs.get_mut(&parent) {
            dir.update_entry(&name, |e| f(e))?;
        }
        Ok(())
    }

    /// 尽力收集一条链的可用前缀，损坏时告警而不是让读路径失败
    fn chain_prefix(&self, start: u64) -> Vec<u64> {
        match self.fat.walk(start) {
            Ok(blocks) => blocks,
            Err(e) => {
                log::warn!("degraded chain walk from {}: {}", start, e);
                let mut blocks = Vec::new();
                let mut cur = start;
                while !blocks.contains(&cur) {
                    match self.fat.next_of(cur) {
                        Ok(next) => {
                            blocks.push(cur);
                            match next {
                                Some(n) => cur = n,
                                None => break,
                            }
                        }
                        Err(_) => break,
                    }
                }
                blocks
            }
        }
    }

    // ------------------------------------------------------------------
    // 路径型操作
    // ------------------------------------------------------------------

    pub fn create_file(&mut self, raw: &str) -> Result<()> {
        self.create_entry(raw, EntryKind::File).map(|_| ())
    }

    pub fn create_directory(&mut self, raw: &str) -> Result<()> {
        self.create_entry(raw, EntryKind::Directory).map(|_| ())
    }

    fn create_entry(&mut self, raw: &str, kind: EntryKind) -> Result<FileEntry> {
        self.ensure_mounted()?;
        let normalized = path::normalize(raw)?;
        if normalized == "/" {
            return Err(FsError::AlreadyExists(normalized));
        }
        let (parent, name) = path::split(&normalized)?;
        if name.len() > MAX_NAME_LEN {
            return Err(FsError::PathInvalid(normalized));
        }
        self.ensure_tree(&parent)?;

        let parent_dir = self
            .dirs
            .get(&parent)
            .ok_or_else(|| FsError::NotFound(parent.clone()))?;
        if parent_dir.find(&name).is_some() {
            return Err(FsError::AlreadyExists(normalized));
        }

        let mut entry = FileEntry::new(&name, kind, &parent);
        if kind == EntryKind::File {
            // 文件创建即占一个起始块；目录保持未分配
            let start = self.fat.allocate().map_err(|e| e.wrap("create", raw))?;
            if let Err(e) = self.cache.write(start, &[]) {
                let _ = self.fat.free(start);
                return Err(e.wrap("create", raw));
            }
            entry.start_block = Some(start);
        }

        self.dirs
            .get_mut(&parent)
            .ok_or_else(|| FsError::NotFound(parent.clone()))?
            .add(entry.clone())?;
        self.index.insert(normalized.clone(), entry.clone());
        if kind == EntryKind::Directory {
            self.dirs
                .insert(normalized.clone(), Directory::new(&normalized, None));
        }
        if let Some(pe) = self.index.get_mut(&parent) {
            pe.touch();
        }
        self.persist_dir(&parent).map_err(|e| e.wrap("create", raw))?;
        Ok(entry)
    }

    pub fn delete_file(&mut self, raw: &str) -> Result<()> {
        self.ensure_mounted()?;
        let (normalized, entry) = self.resolve(raw)?;
        if !entry.is_file() {
            return Err(FsError::WrongKind(normalized));
        }
        if entry.read_only {
            return Err(FsError::ReadOnly(normalized));
        }
        if let Some(slot) = self.handles.find_by_path(&normalized) {
            let _ = self.handles.close(slot);
        }
        if let Some(start) = entry.start_block {
            if let Err(e) = self.fat.free(start) {
                log::warn!("file '{}': chain not fully freed: {}", normalized, e);
            }
        }

        let (parent, name) = path::split(&normalized)?;
        self.dirs
            .get_mut(&parent)
            .ok_or_else(|| FsError::NotFound(parent.clone()))?
            .remove(&name)?;
        self.index.remove(&normalized);
        if let Some(pe) = self.index.get_mut(&parent) {
            pe.touch();
        }
        self.persist_dir(&parent).map_err(|e| e.wrap("delete_file", raw))
    }

    pub fn delete_directory(&mut self, raw: &str) -> Result<()> {
        self.ensure_mounted()?;
        let (normalized, entry) = self.resolve(raw)?;
        if normalized == "/" {
            // 根目录永远不可删除
            return Err(FsError::PathInvalid(normalized));
        }
        if !entry.is_directory() {
            return Err(FsError::WrongKind(normalized));
        }

        self.load_subtree(&normalized)?;
        let prefix = format!("{}/", normalized);
        if self.index.keys().any(|k| k.starts_with(&prefix)) {
            return Err(FsError::NotEmpty(normalized));
        }

        if let Some(start) = entry.start_block {
            if let Err(e) = self.fat.free(start) {
                log::warn!("directory '{}': chain not fully freed: {}", normalized, e);
            }
        }
        self.dirs.remove(&normalized);
        let (parent, name) = path::split(&normalized)?;
        self.dirs
            .get_mut(&parent)
            .ok_or_else(|| FsError::NotFound(parent.clone()))?
            .remove(&name)?;
        self.index.remove(&normalized);
        if let Some(pe) = self.index.get_mut(&parent) {
            pe.touch();
        }
        self.persist_dir(&parent)
            .map_err(|e| e.wrap("delete_directory", raw))
    }

    /// 加载 dir_path 之下的全部子目录
    fn load_subtree(&mut self, dir_path: &str) -> Result<()> {
        let mut queue = vec![dir_path.to_string()];
        while let Some(p) = queue.pop() {
            self.load_dir(&p)?;
            if let Some(dir) = self.dirs.get(&p) {
                for child in dir.active_entries() {
                    if child.is_directory() {
                        queue.push(path::join(&p, &child.name));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn write_file(&mut self, raw: &str, content: &[u8]) -> Result<()> {
        self.ensure_mounted()?;
        let (normalized, entry) = self.resolve(raw)?;
        if !entry.is_file() {
            return Err(FsError::WrongKind(normalized));
        }
        if entry.read_only {
            return Err(FsError::ReadOnly(normalized));
        }

        let start = match entry.start_block {
            Some(s) => s,
            None => self.fat.allocate().map_err(|e| e.wrap("write_file", raw))?,
        };
        let block_size = self.cache.block_size();
        let needed = (content.len().div_ceil(block_size)).max(1);

        let mut blocks = self.fat.walk(start).map_err(|e| e.wrap("write_file", raw))?;
        while blocks.len() < needed {
            let tail = *blocks.last().unwrap();
            let next = self
                .fat
                .allocate_next(tail)
                .map_err(|e| e.wrap("write_file", raw))?;
            blocks.push(next);
        }

        for (i, &block_id) in blocks.iter().take(needed).enumerate() {
            let lo = i * block_size;
            let hi = ((i + 1) * block_size).min(content.len());
            self.cache
                .write(block_id, &content[lo..hi])
                .map_err(|e| e.wrap("write_file", raw))?;
        }

        // 收缩只改大小，尾部块不回收
        let size = content.len() as u64;
        self.apply_entry_update(&normalized, |e| {
            e.size = size;
            e.start_block = Some(start);
            e.touch();
        })?;
        let (parent, _) = path::split(&normalized)?;
        self.persist_dir(&parent).map_err(|e| e.wrap("write_file", raw))
    }

    pub fn read_file(&mut self, raw: &str) -> Result<Vec<u8>> {
        self.ensure_mounted()?;
        let (normalized, entry) = self.resolve(raw)?;
        if !entry.is_file() {
            return Err(FsError::WrongKind(normalized));
        }
        let Some(start) = entry.start_block else {
            return Ok(Vec::new());
        };
        if entry.size == 0 {
            return Ok(Vec::new());
        }

        let block_size = self.cache.block_size();
        let needed = (entry.size as usize).div_ceil(block_size);
        let blocks = self.chain_prefix(start);

        let mut data = Vec::with_capacity(entry.size as usize);
        for &block_id in blocks.iter().take(needed) {
            let chunk = self
                .cache
                .read(block_id)
                .map_err(|e| e.wrap("read_file", raw))?;
            data.extend(chunk);
        }
        data.truncate(entry.size as usize);
        Ok(data)
    }

    pub fn resize_file(&mut self, raw: &str, new_size: u64) -> Result<()> {
        self.ensure_mounted()?;
        let (normalized, entry) = self.resolve(raw)?;
        if !entry.is_file() {
            return Err(FsError::WrongKind(normalized));
        }
        if entry.read_only {
            return Err(FsError::ReadOnly(normalized));
        }

        let start = match entry.start_block {
            Some(s) => s,
            None => self.fat.allocate().map_err(|e| e.wrap("resize_file", raw))?,
        };
        let block_size = self.cache.block_size() as u64;
        let needed = (new_size.div_ceil(block_size)).max(1) as usize;

        let mut blocks = self.fat.walk(start).map_err(|e| e.wrap("resize_file", raw))?;
        let old_len = blocks.len();
        while blocks.len() < needed {
            let tail = *blocks.last().unwrap();
            let next = self
                .fat
                .allocate_next(tail)
                .map_err(|e| e.wrap("resize_file", raw))?;
            blocks.push(next);
        }
        // 新增的块清零，读出来就是空洞
        for &block_id in &blocks[old_len..] {
            self.cache
                .write(block_id, &[])
                .map_err(|e| e.wrap("resize_file", raw))?;
        }

        self.apply_entry_update(&normalized, |e| {
            e.size = new_size;
            e.start_block = Some(start);
            e.touch();
        })?;
        let (parent, _) = path::split(&normalized)?;
        self.persist_dir(&parent)
            .map_err(|e| e.wrap("resize_file", raw))
    }

    /// 目录在前、按名称排序的活动条目列表
    pub fn list_directory(&mut self, raw: &str) -> Result<Vec<FileEntry>> {
        self.ensure_mounted()?;
        let (normalized, entry) = self.resolve(raw)?;
        if !entry.is_directory() {
            return Err(FsError::WrongKind(normalized));
        }
        self.ensure_tree(&normalized)?;
        let dir = self
            .dirs
            .get(&normalized)
            .ok_or_else(|| FsError::NotFound(normalized.clone()))?;
        Ok(dir.list_sorted().into_iter().cloned().collect())
    }

    pub fn copy_file(&mut self, src: &str, dst: &str) -> Result<()> {
        self.ensure_mounted()?;
        let src_path = path::normalize(src)?;
        let dst_path = path::normalize(dst)?;
        if src_path == dst_path {
            return Err(FsError::PathInvalid(dst_path));
        }
        let content = self.read_file(&src_path)?;
        self.create_file(&dst_path)?;
        self.write_file(&dst_path, &content)
    }

    pub fn stat(&mut self, raw: &str) -> Result<FileEntry> {
        self.ensure_mounted()?;
        Ok(self.resolve(raw)?.1)
    }

    /// 只读标记是内存属性，不落盘
    pub fn set_read_only(&mut self, raw: &str, read_only: bool) -> Result<()> {
        self.ensure_mounted()?;
        let (normalized, _) = self.resolve(raw)?;
        if normalized == "/" {
            return Err(FsError::PathInvalid(normalized));
        }
        self.apply_entry_update(&normalized, |e| e.read_only = read_only)
    }

    // ------------------------------------------------------------------
    // 句柄型操作
    // ------------------------------------------------------------------

    pub fn open(&mut self, raw: &str, mode: AccessMode) -> Result<u32> {
        self.ensure_mounted()?;
        let (normalized, entry) = self.resolve(raw)?;
        if !entry.is_file() {
            return Err(FsError::WrongKind(normalized));
        }
        if mode.contains(AccessMode::WRITE) && entry.read_only {
            return Err(FsError::ReadOnly(normalized));
        }
        self.handles.open(&normalized, &entry.id, mode)
    }

    pub fn close(&mut self, handle: u32) -> Result<()> {
        self.ensure_mounted()?;
        self.handles.close(handle)
    }

    /// 句柄路径解析出的条目必须仍是打开句柄时的那一个
    fn check_handle_entry(&mut self, handle: u32, hpath: &str, hid: &str) -> Result<()> {
        let (_, entry) = self.resolve(hpath)?;
        if entry.id != hid {
            return Err(FsError::BadHandle(handle));
        }
        Ok(())
    }

    /// 从读游标处读取至多 len 字节并推进游标
    pub fn read_at(&mut self, handle: u32, len: usize) -> Result<Vec<u8>> {
        self.ensure_mounted()?;
        let (hpath, hid, pos, can_read) = {
            let h = self.handles.get(handle)?;
            (
                h.path.clone(),
                h.entry_id.clone(),
                h.read_pos as usize,
                h.can_read(),
            )
        };
        if !can_read {
            return Err(FsError::ModeViolation(hpath));
        }
        self.check_handle_entry(handle, &hpath, &hid)?;

        let data = self.read_file(&hpath)?;
        let lo = pos.min(data.len());
        let hi = (lo + len).min(data.len());
        let out = data[lo..hi].to_vec();
        self.handles.get_mut(handle)?.read_pos = hi as u64;
        Ok(out)
    }

    /// 在写游标处覆盖写入并推进游标，文件和块链按需增长
    pub fn write_at(&mut self, handle: u32, buf: &[u8]) -> Result<()> {
        self.ensure_mounted()?;
        let (hpath, hid, pos, can_write) = {
            let h = self.handles.get(handle)?;
            (
                h.path.clone(),
                h.entry_id.clone(),
                h.write_pos as usize,
                h.can_write(),
            )
        };
        if !can_write {
            return Err(FsError::ModeViolation(hpath));
        }
        self.check_handle_entry(handle, &hpath, &hid)?;

        let mut data = self.read_file(&hpath)?;
        let new_len = data.len().max(pos + buf.len());
        data.resize(new_len, 0);
        data[pos..pos + buf.len()].copy_from_slice(buf);
        self.write_file(&hpath, &data)?;

        self.handles.get_mut(handle)?.write_pos = (pos + buf.len()) as u64;
        Ok(())
    }

    pub fn seek_read(&mut self, handle: u32, pos: u64) -> Result<()> {
        self.ensure_mounted()?;
        let hpath = self.handles.get(handle)?.path.clone();
        let (_, entry) = self.resolve(&hpath)?;
        self.handles.get_mut(handle)?.seek_read(pos, entry.size)
    }

    pub fn seek_write(&mut self, handle: u32, pos: u64) -> Result<()> {
        self.ensure_mounted()?;
        let hpath = self.handles.get(handle)?.path.clone();
        let (_, entry) = self.resolve(&hpath)?;
        self.handles.get_mut(handle)?.seek_write(pos, entry.size)
    }

    pub fn open_handle_count(&self) -> usize {
        self.handles.active_count()
    }

    // ------------------------------------------------------------------
    // 诊断视图
    // ------------------------------------------------------------------

    pub fn block_size(&self) -> usize {
        self.cache.block_size()
    }

    pub fn total_blocks(&self) -> u64 {
        self.device.total_blocks()
    }

    pub fn free_blocks(&self) -> u64 {
        self.fat.free_blocks()
    }

    /// 分配表当前状态的快照
    pub fn allocation_snapshot(&self) -> Vec<BlockState> {
        self.fat.snapshot()
    }

    /// 某块的原始内容（检查视图用）
    pub fn raw_block(&self, block_id: u64) -> Result<Vec<u8>> {
        self.ensure_mounted()?;
        self.cache.read(block_id)
    }

    /// 把一个空闲块标记为模拟坏块
    pub fn mark_bad_block(&mut self, block_id: u64) -> Result<()> {
        self.ensure_mounted()?;
        self.fat.mark_bad(block_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;
    use crate::fs::block_cache::CacheConfig;

    const BS: usize = 512;

    fn engine_on(device: Arc<MemDisk>) -> FileSystem {
        let total = device.total_blocks();
        let cache = BlockCache::new(device.clone(), CacheConfig::default());
        let fat = Fat::new(total).unwrap();
        let mut fs = FileSystem::new(device, cache, fat).unwrap();
        fs.format().unwrap();
        fs.mount().unwrap();
        fs
    }

    fn engine(total_blocks: u64) -> FileSystem {
        engine_on(Arc::new(MemDisk::new(BS, total_blocks)))
    }

    fn chain_len(fs: &FileSystem, start: u64) -> usize {
        let snapshot = fs.allocation_snapshot();
        let mut len = 0;
        let mut cur = start;
        loop {
            len += 1;
            match snapshot[cur as usize] {
                BlockState::Next(n) => cur = n,
                BlockState::EndOfChain => return len,
                other => panic!("unexpected state {:?} at {}", other, cur),
            }
        }
    }

    fn storage_cause(err: &FsError) -> Option<&FsError> {
        match err {
            FsError::Operation { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }

    #[test]
    fn test_scenario_write_read_chain() {
        let mut fs = engine(64);
        fs.create_file("/a.txt").unwrap();

        let content: Vec<u8> = (0..BS * 3 + 10).map(|i| (i % 251) as u8).collect();
        fs.write_file("/a.txt", &content).unwrap();

        assert_eq!(fs.read_file("/a.txt").unwrap(), content);
        let start = fs.stat("/a.txt").unwrap().start_block.unwrap();
        assert_eq!(chain_len(&fs, start), 4);
    }

    #[test]
    fn test_scenario_delete_file_then_directory() {
        let mut fs = engine(64);
        fs.create_directory("/d").unwrap();
        fs.create_file("/d/f.txt").unwrap();
        fs.delete_file("/d/f.txt").unwrap();
        fs.delete_directory("/d").unwrap();
        assert!(matches!(fs.stat("/d"), Err(FsError::NotFound(_))));
    }

    #[test]
    fn test_scenario_delete_directory_not_empty() {
        let mut fs = engine(64);
        fs.create_directory("/d").unwrap();
        fs.create_file("/d/f.txt").unwrap();
        assert!(matches!(
            fs.delete_directory("/d"),
            Err(FsError::NotEmpty(_))
        ));
        // 根目录永远删不掉
        assert!(matches!(
            fs.delete_directory("/"),
            Err(FsError::PathInvalid(_))
        ));
    }

    #[test]
    fn test_scenario_disk_full_and_recovery() {
        let mut fs = engine(16);
        fs.create_file("/spare").unwrap();
        fs.create_file("/big").unwrap();

        let err = fs.resize_file("/big", (BS * 20) as u64).unwrap_err();
        assert!(matches!(
            storage_cause(&err),
            Some(FsError::CapacityExhausted(_))
        ));

        fs.delete_file("/spare").unwrap();
        fs.resize_file("/big", (BS * 12) as u64).unwrap();
        assert_eq!(fs.stat("/big").unwrap().size, (BS * 12) as u64);
    }

    #[test]
    fn test_shrink_keeps_trailing_blocks() {
        let mut fs = engine(64);
        fs.create_file("/f").unwrap();
        fs.write_file("/f", &vec![7u8; BS * 3]).unwrap();
        let start = fs.stat("/f").unwrap().start_block.unwrap();
        assert_eq!(chain_len(&fs, start), 3);

        fs.resize_file("/f", 5).unwrap();
        assert_eq!(fs.stat("/f").unwrap().size, 5);
        // 尾部块保持挂在链上
        assert_eq!(chain_len(&fs, start), 3);
        assert_eq!(fs.read_file("/f").unwrap(), vec![7u8; 5]);
    }

    #[test]
    fn test_resize_growth_reads_zeroes() {
        let mut fs = engine(64);
        fs.create_file("/f").unwrap();
        fs.write_file("/f", b"abc").unwrap();
        fs.resize_file("/f", (BS + 4) as u64).unwrap();

        let data = fs.read_file("/f").unwrap();
        assert_eq!(data.len(), BS + 4);
        assert_eq!(&data[..3], b"abc");
        assert!(data[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_create_validations() {
        let mut fs = engine(64);
        fs.create_directory("/d").unwrap();
        fs.create_file("/d/f").unwrap();

        assert!(matches!(
            fs.create_file("/d/f"),
            Err(FsError::AlreadyExists(_))
        ));
        assert!(matches!(
            fs.create_file("/missing/f"),
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            fs.create_file("/d/f/x"),
            Err(FsError::WrongKind(_))
        ));
        assert!(matches!(fs.create_file("bad"), Err(FsError::PathInvalid(_))));
        let long = format!("/{}", "n".repeat(MAX_NAME_LEN + 1));
        assert!(matches!(fs.create_file(&long), Err(FsError::PathInvalid(_))));
    }

    #[test]
    fn test_list_directory_sorted() {
        let mut fs = engine(64);
        fs.create_file("/b.txt").unwrap();
        fs.create_directory("/z").unwrap();
        fs.create_file("/a.txt").unwrap();

        let names: Vec<String> = fs
            .list_directory("/")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["z", "a.txt", "b.txt"]);
    }

    #[test]
    fn test_copy_file() {
        let mut fs = engine(64);
        fs.create_file("/src").unwrap();
        fs.write_file("/src", b"payload").unwrap();

        fs.copy_file("/src", "/dst").unwrap();
        assert_eq!(fs.read_file("/dst").unwrap(), b"payload");
        // 两个文件各自独立
        assert_ne!(
            fs.stat("/src").unwrap().start_block,
            fs.stat("/dst").unwrap().start_block
        );

        assert!(matches!(
            fs.copy_file("/src", "/src"),
            Err(FsError::PathInvalid(_))
        ));
        assert!(matches!(
            fs.copy_file("/src", "/dst"),
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_read_only_flag() {
        let mut fs = engine(64);
        fs.create_file("/f").unwrap();
        fs.write_file("/f", b"x").unwrap();
        fs.set_read_only("/f", true).unwrap();

        assert!(matches!(
            fs.write_file("/f", b"y"),
            Err(FsError::ReadOnly(_))
        ));
        assert!(matches!(fs.delete_file("/f"), Err(FsError::ReadOnly(_))));
        assert!(matches!(
            fs.open("/f", AccessMode::READ_WRITE),
            Err(FsError::ReadOnly(_))
        ));
        // 只读文件仍可读
        assert_eq!(fs.read_file("/f").unwrap(), b"x");

        fs.set_read_only("/f", false).unwrap();
        fs.write_file("/f", b"y").unwrap();
    }

    #[test]
    fn test_handle_capacity_limit() {
        let mut fs = engine(64);
        for i in 0..5 {
            fs.create_file(&format!("/f{}", i)).unwrap();
        }
        fs.create_file("/f5").unwrap();

        let mut handles = Vec::new();
        for i in 0..5 {
            handles.push(fs.open(&format!("/f{}", i), AccessMode::READ).unwrap());
        }
        assert!(matches!(
            fs.open("/f5", AccessMode::READ),
            Err(FsError::CapacityExhausted(_))
        ));

        fs.close(handles[0]).unwrap();
        fs.open("/f5", AccessMode::READ).unwrap();
        assert_eq!(fs.open_handle_count(), 5);
    }

    #[test]
    fn test_handle_cursors_and_growth() {
        let mut fs = engine(64);
        fs.create_file("/f").unwrap();
        let h = fs.open("/f", AccessMode::READ_WRITE).unwrap();

        fs.write_at(h, b"hello world").unwrap();
        assert_eq!(fs.stat("/f").unwrap().size, 11);

        // 读游标独立于写游标
        assert_eq!(fs.read_at(h, 5).unwrap(), b"hello");
        assert_eq!(fs.read_at(h, 100).unwrap(), b" world");
        assert_eq!(fs.read_at(h, 1).unwrap(), b"");

        fs.seek_write(h, 6).unwrap();
        fs.write_at(h, b"there").unwrap();
        fs.seek_read(h, 0).unwrap();
        assert_eq!(fs.read_at(h, 100).unwrap(), b"hello there");

        // 越过文件末尾的游标被拒绝
        assert!(fs.seek_read(h, 12).is_err());
        assert!(fs.seek_write(h, 12).is_err());
    }

    #[test]
    fn test_handle_mode_enforcement() {
        let mut fs = engine(64);
        fs.create_file("/r").unwrap();
        fs.write_file("/r", b"data").unwrap();

        let h = fs.open("/r", AccessMode::READ).unwrap();
        assert!(matches!(
            fs.write_at(h, b"x"),
            Err(FsError::ModeViolation(_))
        ));
        fs.close(h).unwrap();

        let h = fs.open("/r", AccessMode::WRITE).unwrap();
        assert!(matches!(fs.read_at(h, 4), Err(FsError::ModeViolation(_))));
        fs.close(h).unwrap();

        assert!(matches!(fs.read_at(99, 1), Err(FsError::BadHandle(99))));
    }

    #[test]
    fn test_handle_bound_to_entry_identity() {
        let mut fs = engine(64);
        fs.create_file("/f").unwrap();
        fs.write_file("/f", b"data").unwrap();
        let h = fs.open("/f", AccessMode::READ_WRITE).unwrap();
        assert_eq!(fs.read_at(h, 4).unwrap(), b"data");

        // 句柄指向的条目 id 和路径当前条目不一致时拒绝读写
        fs.handles.get_mut(h).unwrap().entry_id = "stale".to_string();
        assert!(matches!(fs.read_at(h, 4), Err(FsError::BadHandle(_))));
        assert!(matches!(fs.write_at(h, b"x"), Err(FsError::BadHandle(_))));
    }

    #[test]
    fn test_same_path_open_reuses_slot() {
        let mut fs = engine(64);
        fs.create_file("/f").unwrap();
        let a = fs.open("/f", AccessMode::READ).unwrap();
        let b = fs.open("/f", AccessMode::READ).unwrap();
        assert_eq!(a, b);
        assert_eq!(fs.open_handle_count(), 1);
    }

    #[test]
    fn test_not_mounted_guard() {
        let device = Arc::new(MemDisk::new(BS, 64));
        let cache = BlockCache::new(device.clone(), CacheConfig::default());
        let fat = Fat::new(64).unwrap();
        let mut fs = FileSystem::new(device, cache, fat).unwrap();
        assert!(matches!(fs.create_file("/f"), Err(FsError::NotMounted)));
        assert!(matches!(fs.read_file("/f"), Err(FsError::NotMounted)));
        assert!(matches!(fs.unmount(), Err(FsError::NotMounted)));
    }

    #[test]
    fn test_mount_requires_formatted_medium() {
        let device = Arc::new(MemDisk::new(BS, 64));
        let cache = BlockCache::new(device.clone(), CacheConfig::default());
        let fat = Fat::new(64).unwrap();
        let mut fs = FileSystem::new(device, cache, fat).unwrap();
        assert!(matches!(fs.mount(), Err(FsError::NotInitialized)));
    }

    #[test]
    fn test_state_survives_remount() {
        let device = Arc::new(MemDisk::new(BS, 64));
        let content: Vec<u8> = (0..700).map(|i| (i % 256) as u8).collect();
        let file_id;
        {
            let mut fs = engine_on(device.clone());
            fs.create_directory("/docs").unwrap();
            fs.create_directory("/docs/old").unwrap();
            fs.create_file("/docs/a.txt").unwrap();
            fs.write_file("/docs/a.txt", &content).unwrap();
            file_id = fs.stat("/docs/a.txt").unwrap().id.clone();
            fs.sync().unwrap();
        }

        // 另起一套缓存和分配表，从同一介质重新挂载
        let cache = BlockCache::new(device.clone(), CacheConfig::default());
        let fat = Fat::new(64).unwrap();
        let mut fs = FileSystem::new(device, cache, fat).unwrap();
        fs.mount().unwrap();

        assert_eq!(fs.read_file("/docs/a.txt").unwrap(), content);
        let entry = fs.stat("/docs/a.txt").unwrap();
        assert_eq!(entry.size, 700);
        assert_eq!(entry.id, file_id);
        assert_eq!(fs.list_directory("/docs").unwrap().len(), 2);
        assert!(fs.stat("/docs/old").unwrap().is_directory());
    }

    #[test]
    fn test_unmount_releases_device() {
        let device = Arc::new(MemDisk::new(BS, 64));
        let mut fs = engine_on(device.clone());
        fs.create_file("/f").unwrap();
        fs.open("/f", AccessMode::READ).unwrap();
        fs.unmount().unwrap();

        assert_eq!(fs.open_handle_count(), 0);
        let mut buf = vec![0u8; BS];
        assert!(matches!(
            device.read_block(0, &mut buf),
            Err(FsError::NotInitialized)
        ));
    }

    #[test]
    fn test_raw_block_and_snapshot_views() {
        let mut fs = engine(64);
        fs.create_file("/f").unwrap();
        fs.write_file("/f", b"peek").unwrap();

        let start = fs.stat("/f").unwrap().start_block.unwrap();
        assert_eq!(&fs.raw_block(start).unwrap()[..4], b"peek");

        let snapshot = fs.allocation_snapshot();
        assert_eq!(snapshot[0], BlockState::Bad);
        assert_eq!(snapshot[1], BlockState::Bad);
        assert_eq!(snapshot[start as usize], BlockState::EndOfChain);
    }

    #[test]
    fn test_mark_bad_block_is_skipped_by_allocation() {
        let mut fs = engine(16);
        fs.mark_bad_block(2).unwrap();
        fs.create_file("/f").unwrap();
        assert_ne!(fs.stat("/f").unwrap().start_block, Some(2));
        assert_eq!(fs.allocation_snapshot()[2], BlockState::Bad);
    }

    #[test]
    fn test_deleting_open_file_closes_its_handle() {
        let mut fs = engine(64);
        fs.create_file("/f").unwrap();
        let h = fs.open("/f", AccessMode::READ).unwrap();
        fs.delete_file("/f").unwrap();
        assert!(matches!(fs.read_at(h, 1), Err(FsError::BadHandle(_))));
    }
}
