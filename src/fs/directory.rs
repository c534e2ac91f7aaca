use crate::fs::{
    block_cache::BlockCache,
    config::{DIR_ENTRIES_PER_BLOCK, DIR_FIELD_SEP, DIR_RECORD_END, MAX_NAME_LEN},
    entry::{EntryKind, FileEntry},
    error::{FsError, Result},
    fat::Fat,
    path,
};

/// 一个目录的条目集合与其块链的映射
///
/// 条目在内存中增删改，显式调用 persist 才落盘。
/// 软删除的记录保留在内存列表里，直到下一次持久化时被丢弃。
#[derive(Debug)]
pub struct Directory {
    pub path: String,
    pub start_block: Option<u64>,
    entries: Vec<FileEntry>,
    modified: bool,
}

impl Directory {
    pub fn new(path: &str, start_block: Option<u64>) -> Self {
        Self {
            path: path.to_string(),
            start_block,
            entries: Vec::new(),
            modified: false,
        }
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// 活动条目（不含软删除）
    pub fn active_entries(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.iter().filter(|e| !e.is_deleted())
    }

    /// 全部在内存的记录，包含已软删除的
    pub fn all_entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn find(&self, name: &str) -> Option<&FileEntry> {
        self.active_entries().find(|e| e.name == name)
    }

    /// 条目排序视图：目录在前，各自按名称排序
    pub fn list_sorted(&self) -> Vec<&FileEntry> {
        let mut entries: Vec<&FileEntry> = self.active_entries().collect();
        entries.sort_by(|a, b| match (a.kind, b.kind) {
            (EntryKind::Directory, EntryKind::File) => std::cmp::Ordering::Less,
            (EntryKind::File, EntryKind::Directory) => std::cmp::Ordering::Greater,
            _ => a.name.cmp(&b.name),
        });
        entries
    }

    /// 追加一个条目；重名或父路径不符直接拒绝，不隐式持久化
    pub fn add(&mut self, entry: FileEntry) -> Result<()> {
        if entry.parent != self.path {
            return Err(FsError::PathInvalid(path::join(&entry.parent, &entry.name)));
        }
        if self.find(&entry.name).is_some() {
            return Err(FsError::AlreadyExists(path::join(&self.path, &entry.name)));
        }
        self.entries.push(entry);
        self.modified = true;
        Ok(())
    }

    /// 软删除一个条目，返回其副本；不隐式持久化
    pub fn remove(&mut self, name: &str) -> Result<FileEntry> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| !e.is_deleted() && e.name == name)
            .ok_or_else(|| FsError::NotFound(path::join(&self.path, name)))?;
        entry.mark_deleted();
        self.modified = true;
        Ok(entry.clone())
    }

    /// 修改某个活动条目并标记目录已变更
    pub fn update_entry(&mut self, name: &str, f: impl FnOnce(&mut FileEntry)) -> Result<()> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| !e.is_deleted() && e.name == name)
            .ok_or_else(|| FsError::NotFound(path::join(&self.path, name)))?;
        f(entry);
        self.modified = true;
        Ok(())
    }

    /// 从块链加载条目集合，替换内存中的集合
    ///
    /// 软删除记录、重名记录、无法解析的记录一律丢弃并告警，
    /// 链损坏时退化为空目录而不是让引擎崩溃。
    pub fn load(&mut self, fat: &Fat, cache: &BlockCache) -> Result<()> {
        self.entries.clear();
        self.modified = false;

        let Some(start) = self.start_block else {
            return Ok(());
        };

        let blocks = match fat.walk(start) {
            Ok(blocks) => blocks,
            Err(e) => {
                log::warn!("directory '{}' has a broken chain: {}", self.path, e);
                return Ok(());
            }
        };

        for block_id in blocks {
            let data = cache.read(block_id)?;
            for entry in parse_block(&data, &self.path) {
                if entry.is_deleted() {
                    continue;
                }
                if self.find(&entry.name).is_some() {
                    log::warn!(
                        "directory '{}': duplicate entry '{}' dropped on load",
                        self.path,
                        entry.name
                    );
                    continue;
                }
                self.entries.push(entry);
            }
        }
        Ok(())
    }

    /// 将活动条目写入一条新链，提交后再释放旧链
    ///
    /// 新链完整落盘之前旧链不动，中途失败不会丢已有数据。
    /// 持久化同时物理清理软删除记录。
    pub fn persist(&mut self, fat: &mut Fat, cache: &BlockCache) -> Result<()> {
        if !self.modified {
            return Ok(());
        }

        let active: Vec<FileEntry> = self.active_entries().cloned().collect();
        let old_start = self.start_block;

        if active.is_empty() {
            self.start_block = None;
        } else {
            let blocks = serialize_entries(&active, cache.block_size());
            let chain = allocate_chain(fat, blocks.len() as u64)?;
            for (block_id, data) in chain.iter().zip(blocks.iter()) {
                if let Err(e) = cache.write(*block_id, data) {
                    // 新链未提交，回收它，旧链保持原样
                    let _ = fat.free(chain[0]);
                    return Err(e);
                }
            }
            self.start_block = Some(chain[0]);
        }

        if let Some(old) = old_start {
            if let Err(e) = fat.free(old) {
                log::warn!("directory '{}': stale chain not fully freed: {}", self.path, e);
            }
        }

        self.entries.retain(|e| !e.is_deleted());
        self.modified = false;
        Ok(())
    }
}

/// 一次性分配 n 块的链；中途失败时回收已分配的部分
fn allocate_chain(fat: &mut Fat, n: u64) -> Result<Vec<u64>> {
    let head = fat.allocate()?;
    let mut chain = vec![head];
    for _ in 1..n {
        match fat.allocate_next(*chain.last().unwrap()) {
            Ok(id) => chain.push(id),
            Err(e) => {
                let _ = fat.free(head);
                return Err(e);
            }
        }
    }
    Ok(chain)
}

/// 单条记录：name|kind|start|size|deleted|id;
fn serialize_record(entry: &FileEntry) -> String {
    let mut name = entry.name.clone();
    if name.len() > MAX_NAME_LEN {
        // 截断点必须落在字符边界上，多字节字符整个丢弃
        let mut cut = MAX_NAME_LEN;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }
    let kind = match entry.kind {
        EntryKind::File => 'F',
        EntryKind::Directory => 'D',
    };
    let start = entry.start_block.map(|b| b as i64).unwrap_or(-1);
    format!(
        "{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}{end}",
        name,
        kind,
        start,
        entry.size,
        entry.is_deleted() as u8,
        entry.id,
        sep = DIR_FIELD_SEP,
        end = DIR_RECORD_END,
    )
}

/// 把条目按每块固定容量打包成块内容，尾部补零
fn serialize_entries(entries: &[FileEntry], block_size: usize) -> Vec<Vec<u8>> {
    entries
        .chunks(DIR_ENTRIES_PER_BLOCK)
        .map(|chunk| {
            let mut text = String::new();
            for entry in chunk {
                text.push_str(&serialize_record(entry));
            }
            let mut block = text.into_bytes();
            block.resize(block_size, 0);
            block
        })
        .collect()
}

/// 解析一个块里的全部记录；无法解析的记录丢弃并告警
fn parse_block(data: &[u8], parent: &str) -> Vec<FileEntry> {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    let text = String::from_utf8_lossy(&data[..end]);

    let mut entries = Vec::new();
    for record in text.split(DIR_RECORD_END) {
        if record.is_empty() {
            continue;
        }
        match parse_record(record, parent) {
            Some(entry) => entries.push(entry),
            None => log::warn!("unparsable directory record dropped: '{}'", record),
        }
    }
    entries
}

fn parse_record(record: &str, parent: &str) -> Option<FileEntry> {
    let fields: Vec<&str> = record.split(DIR_FIELD_SEP).collect();
    if fields.len() != 6 {
        return None;
    }
    let kind = match fields[1] {
        "F" => EntryKind::File,
        "D" => EntryKind::Directory,
        _ => return None,
    };
    let start: i64 = fields[2].parse().ok()?;
    let size: u64 = fields[3].parse().ok()?;
    let deleted = match fields[4] {
        "0" => false,
        "1" => true,
        _ => return None,
    };
    Some(FileEntry::from_record(
        fields[0].to_string(),
        kind,
        parent,
        size,
        (start >= 0).then_some(start as u64),
        deleted,
        fields[5].to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;
    use crate::fs::block_cache::CacheConfig;
    use std::sync::Arc;

    fn setup() -> (Fat, BlockCache) {
        let disk = Arc::new(MemDisk::new(512, 32));
        let cache = BlockCache::new(disk, CacheConfig::default());
        (Fat::new(32).unwrap(), cache)
    }

    fn file_entry(name: &str, parent: &str) -> FileEntry {
        FileEntry::new(name, EntryKind::File, parent)
    }

    #[test]
    fn test_add_rejects_duplicates_and_foreign_parent() {
        let mut dir = Directory::new("/d", None);
        dir.add(file_entry("a", "/d")).unwrap();
        assert!(matches!(
            dir.add(file_entry("a", "/d")),
            Err(FsError::AlreadyExists(_))
        ));
        assert!(matches!(
            dir.add(file_entry("b", "/other")),
            Err(FsError::PathInvalid(_))
        ));
    }

    #[test]
    fn test_removed_entry_lingers_until_persist() {
        let (mut fat, cache) = setup();
        let mut dir = Directory::new("/d", None);
        dir.add(file_entry("a", "/d")).unwrap();
        dir.add(file_entry("b", "/d")).unwrap();
        dir.remove("a").unwrap();

        // 软删除的记录还在原始列表里，但不再是活动条目
        assert_eq!(dir.all_entries().len(), 2);
        assert_eq!(dir.active_entries().count(), 1);
        assert!(dir.find("a").is_none());

        dir.persist(&mut fat, &cache).unwrap();
        assert_eq!(dir.all_entries().len(), 1);
    }

    #[test]
    fn test_persist_then_load_reproduces_active_set() {
        let (mut fat, cache) = setup();
        let mut dir = Directory::new("/d", None);
        let mut f = file_entry("notes.txt", "/d");
        f.size = 1234;
        f.start_block = Some(7);
        dir.add(f).unwrap();
        dir.add(FileEntry::new("sub", EntryKind::Directory, "/d"))
            .unwrap();
        dir.persist(&mut fat, &cache).unwrap();

        let mut reloaded = Directory::new("/d", dir.start_block);
        reloaded.load(&fat, &cache).unwrap();

        assert_eq!(reloaded.active_entries().count(), 2);
        let f = reloaded.find("notes.txt").unwrap();
        assert_eq!(f.size, 1234);
        assert_eq!(f.start_block, Some(7));
        assert_eq!(f.kind, EntryKind::File);
        assert_eq!(f.id, dir.find("notes.txt").unwrap().id);
        assert!(reloaded.find("sub").unwrap().is_directory());
    }

    #[test]
    fn test_persist_unmodified_is_noop() {
        let (mut fat, cache) = setup();
        let mut dir = Directory::new("/d", None);
        dir.add(file_entry("a", "/d")).unwrap();
        dir.persist(&mut fat, &cache).unwrap();

        let start = dir.start_block;
        dir.persist(&mut fat, &cache).unwrap();
        assert_eq!(dir.start_block, start);
    }

    #[test]
    fn test_persist_empty_set_frees_chain() {
        let (mut fat, cache) = setup();
        let mut dir = Directory::new("/d", None);
        dir.add(file_entry("a", "/d")).unwrap();
        dir.persist(&mut fat, &cache).unwrap();
        let free_before = fat.free_blocks();

        dir.remove("a").unwrap();
        dir.persist(&mut fat, &cache).unwrap();
        assert_eq!(dir.start_block, None);
        assert_eq!(fat.free_blocks(), free_before + 1);
    }

    #[test]
    fn test_persist_rewrites_into_fresh_chain() {
        let (mut fat, cache) = setup();
        let mut dir = Directory::new("/d", None);
        // 超过单块容量，链长 > 1
        for i in 0..DIR_ENTRIES_PER_BLOCK + 1 {
            dir.add(file_entry(&format!("f{}", i), "/d")).unwrap();
        }
        dir.persist(&mut fat, &cache).unwrap();
        let first = dir.start_block.unwrap();
        assert_eq!(fat.chain_length(first).unwrap(), 2);

        dir.remove("f0").unwrap();
        dir.persist(&mut fat, &cache).unwrap();
        let second = dir.start_block.unwrap();
        // 旧链已释放，新链只需一块
        assert_eq!(fat.chain_length(second).unwrap(), 1);

        let mut reloaded = Directory::new("/d", Some(second));
        reloaded.load(&fat, &cache).unwrap();
        assert_eq!(reloaded.active_entries().count(), DIR_ENTRIES_PER_BLOCK);
    }

    #[test]
    fn test_load_drops_duplicate_names() {
        let (mut fat, cache) = setup();
        let a = file_entry("same", "/d");
        let b = file_entry("same", "/d");
        let blocks = serialize_entries(&[a.clone(), b], 512);
        let block_id = fat.allocate().unwrap();
        cache.write(block_id, &blocks[0]).unwrap();

        let mut dir = Directory::new("/d", Some(block_id));
        dir.load(&fat, &cache).unwrap();
        assert_eq!(dir.active_entries().count(), 1);
        assert_eq!(dir.find("same").unwrap().id, a.id);
    }

    #[test]
    fn test_load_degrades_on_broken_chain() {
        let (fat, cache) = setup();
        // 起始块根本未分配
        let mut dir = Directory::new("/d", Some(9));
        dir.load(&fat, &cache).unwrap();
        assert_eq!(dir.active_entries().count(), 0);
    }

    #[test]
    fn test_long_multibyte_name_truncated_on_char_boundary() {
        let (mut fat, cache) = setup();
        let mut dir = Directory::new("/d", None);
        // 30 个单字节字符后跟一个三字节字符，总字节数越过名称上限
        let name = format!("{}€", "n".repeat(30));
        dir.add(file_entry(&name, "/d")).unwrap();
        dir.persist(&mut fat, &cache).unwrap();

        let mut reloaded = Directory::new("/d", dir.start_block);
        reloaded.load(&fat, &cache).unwrap();
        assert_eq!(reloaded.active_entries().count(), 1);
        assert!(reloaded.find(&"n".repeat(30)).is_some());
    }

    #[test]
    fn test_unparsable_records_are_skipped() {
        let (mut fat, cache) = setup();
        let good = serialize_record(&file_entry("ok", "/d"));
        let mixed = format!("garbage|record;{}not-enough-fields;", good);
        let block_id = fat.allocate().unwrap();
        cache.write(block_id, mixed.as_bytes()).unwrap();

        let mut dir = Directory::new("/d", Some(block_id));
        dir.load(&fat, &cache).unwrap();
        assert_eq!(dir.active_entries().count(), 1);
        assert!(dir.find("ok").is_some());
    }
}
