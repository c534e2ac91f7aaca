use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    disk::BlockDevice,
    fs::config::{DEFAULT_CACHE_CAPACITY, DEFAULT_DIRTY_THRESHOLD, DEFAULT_FLUSH_INTERVAL_MS},
    fs::error::{FsError, Result},
};

/// 块缓存参数
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub capacity: usize,
    /// 脏块数达到该值时立即触发回写
    pub dirty_threshold: usize,
    /// 距上次回写超过该间隔时，下一次写入触发回写
    pub flush_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
            dirty_threshold: DEFAULT_DIRTY_THRESHOLD,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
        }
    }
}

/// 缓存条目，只在缓存内部存在
#[derive(Debug)]
struct CacheEntry {
    data: Vec<u8>,
    dirty: bool,
    last_access: u64, // 单调递增的访问序号，最小者即 LRU
    access_count: u64,
}

#[derive(Debug)]
struct CacheInner {
    entries: HashMap<u64, CacheEntry>,
    capacity: usize,
    tick: u64,
    last_flush: Instant,
}

/// 写回式 LRU 块缓存
///
/// 命中直接走内存；写入只标脏不落盘，由显式 flush、
/// 阈值/间隔触发或后台 FlushDaemon 统一回写。
/// 淘汰脏块前必须先写回介质。
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    inner: Mutex<CacheInner>,
    dirty_threshold: usize,
    flush_interval: Duration,
}

impl BlockCache {
    pub fn new(device: Arc<dyn BlockDevice>, config: CacheConfig) -> Self {
        Self {
            device,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                capacity: config.capacity.max(1),
                tick: 0,
                last_flush: Instant::now(),
            }),
            dirty_threshold: config.dirty_threshold.max(1),
            flush_interval: config.flush_interval,
        }
    }

    pub fn block_size(&self) -> usize {
        self.device.block_size()
    }

    pub fn total_blocks(&self) -> u64 {
        self.device.total_blocks()
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    fn check_id(&self, block_id: u64) -> Result<()> {
        if block_id >= self.device.total_blocks() {
            return Err(FsError::InvalidBlockId(block_id));
        }
        Ok(())
    }

    /// 读取一个块的内容副本；未命中时从介质拉取并缓存
    pub fn read(&self, block_id: u64) -> Result<Vec<u8>> {
        self.check_id(block_id)?;
        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(entry) = inner.entries.get_mut(&block_id) {
            entry.last_access = tick;
            entry.access_count += 1;
            return Ok(entry.data.clone());
        }

        self.make_room(&mut inner)?;
        let mut data = vec![0u8; self.device.block_size()];
        self.device.read_block(block_id, &mut data)?;
        inner.entries.insert(
            block_id,
            CacheEntry {
                data: data.clone(),
                dirty: false,
                last_access: tick,
                access_count: 1,
            },
        );
        Ok(data)
    }

    /// 写入一个块：只更新缓存并标脏，不同步触达介质
    pub fn write(&self, block_id: u64, buf: &[u8]) -> Result<()> {
        self.check_id(block_id)?;
        let block_size = self.device.block_size();
        let mut data = vec![0u8; block_size];
        let n = buf.len().min(block_size);
        data[..n].copy_from_slice(&buf[..n]);

        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(entry) = inner.entries.get_mut(&block_id) {
            entry.data = data;
            entry.dirty = true;
            entry.last_access = tick;
            entry.access_count += 1;
        } else {
            self.make_room(&mut inner)?;
            inner.entries.insert(
                block_id,
                CacheEntry {
                    data,
                    dirty: true,
                    last_access: tick,
                    access_count: 1,
                },
            );
        }

        let dirty = inner.entries.values().filter(|e| e.dirty).count();
        if dirty >= self.dirty_threshold || inner.last_flush.elapsed() >= self.flush_interval {
            self.flush_locked(&mut inner)?;
        }
        Ok(())
    }

    /// 回写全部脏块；失败的条目保持脏状态并逐项上报
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        self.flush_locked(&mut inner)
    }

    fn flush_locked(&self, inner: &mut MutexGuard<'_, CacheInner>) -> Result<()> {
        let mut dirty_ids: Vec<u64> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(&id, _)| id)
            .collect();
        dirty_ids.sort_unstable();

        let mut failures = Vec::new();
        for id in dirty_ids {
            let entry = inner.entries.get_mut(&id).unwrap();
            match self.device.write_block(id, &entry.data) {
                Ok(()) => entry.dirty = false,
                Err(e) => failures.push((id, e)),
            }
        }
        inner.last_flush = Instant::now();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(FsError::FlushFailed(failures))
        }
    }

    /// 淘汰 LRU 条目直到有空位；脏条目先写回介质再丢弃
    fn make_room(&self, inner: &mut MutexGuard<'_, CacheInner>) -> Result<()> {
        while inner.entries.len() >= inner.capacity {
            self.evict_one(inner)?;
        }
        Ok(())
    }

    fn evict_one(&self, inner: &mut MutexGuard<'_, CacheInner>) -> Result<()> {
        let victim = inner
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_access)
            .map(|(&id, _)| id);
        let Some(id) = victim else {
            return Ok(());
        };

        let entry = inner.entries.get(&id).unwrap();
        if entry.dirty {
            // 写回失败则条目留在缓存里，绝不丢弃脏数据
            self.device.write_block(id, &entry.data)?;
        }
        inner.entries.remove(&id);
        Ok(())
    }

    /// 调整容量；收缩时按同样的脏安全规则淘汰多余条目
    pub fn resize(&self, capacity: usize) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.capacity = capacity.max(1);
        while inner.entries.len() > inner.capacity {
            self.evict_one(&mut inner)?;
        }
        Ok(())
    }

    /// 回写后清空全部缓存条目
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        self.flush_locked(&mut inner)?;
        inner.entries.clear();
        Ok(())
    }

    /// 不回写直接丢弃全部条目，仅在随后要整盘清零时使用
    pub fn discard(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
    }

    pub fn dirty_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.entries.values().filter(|e| e.dirty).count()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 某块的累计访问次数（诊断用）
    pub fn access_count(&self, block_id: u64) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(&block_id).map(|e| e.access_count)
    }
}

/// 后台定时回写线程
///
/// 只在存在脏块时触发 flush；与前台 flush 竞争同一把缓存锁，
/// 因此两者不会同时改动脏块集合。停止时合并线程。
pub struct FlushDaemon {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FlushDaemon {
    pub fn start(cache: Arc<BlockCache>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = thread::spawn(move || {
            let mut last = Instant::now();
            while !stop_flag.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(20));
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }
                if last.elapsed() < interval {
                    continue;
                }
                last = Instant::now();
                if cache.dirty_count() == 0 {
                    continue;
                }
                if let Err(e) = cache.flush() {
                    log::warn!("background flush failed: {}", e);
                }
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FlushDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}
