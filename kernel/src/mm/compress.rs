//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 压缩缓存（类似 zswap）
//!
//! 被回收的匿名页先尝试压缩后留在内存中，失败才写入交换区。
//!
//! # 结构
//! - 每个池有一张哈希表（按页标识查找）和一条 LRU 链表
//! - 条目存放在槽位表里，哈希链和 LRU 链都是下标
//! - 一个条目在哈希表中当且仅当它在 LRU 链表上恰好出现一次
//!
//! # 算法
//! - 全零页只存 4 字节标记
//! - Lz4 槽位使用游程编码：长度 ≥ 3 的游程写成 `0xFF len byte`，
//!   字面量 0xFF 写成 `0xFF 0x00 0xFF`，游程最长 255
//! - Zstd / Lzo / Deflate 没有实现，不能用来建池

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use serde::Serialize;
use spin::{Mutex, RwLock};

use super::address_space::SpaceId;
use super::list::{Linked, Links, ListHead};
use super::page::{Vpn, PAGE_SIZE};
use crate::config::{COMPRESSION_MAX_POOLS, COMPRESSION_MAX_TIME_US, COMPRESSION_MIN_RATIO};
use crate::error::{corruption, MmError, MmResult, RejectReason};
use crate::platform::Platform;

/// 条目魔数
const ENTRY_MAGIC: u32 = 0x5A50_4F4F;

/// 全零页标记
const ZERO_PAGE_MARKER: [u8; 4] = *b"ZERO";

/// 可接受的最大压缩结果
pub const MAX_COMPRESSED_SIZE: usize = PAGE_SIZE * 3 / 4;

const RLE_ESCAPE: u8 = 0xFF;
const RLE_MIN_RUN: usize = 3;
const RLE_MAX_RUN: usize = 255;

/// 压缩算法
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompressionAlgorithm {
    /// 只处理全零页
    None = 0,
    Lz4 = 1,
    Zstd = 2,
    Lzo = 3,
    Deflate = 4,
}

impl CompressionAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::Zstd => "zstd",
            CompressionAlgorithm::Lzo => "lzo",
            CompressionAlgorithm::Deflate => "deflate",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(CompressionAlgorithm::None),
            1 => Some(CompressionAlgorithm::Lz4),
            2 => Some(CompressionAlgorithm::Zstd),
            3 => Some(CompressionAlgorithm::Lzo),
            4 => Some(CompressionAlgorithm::Deflate),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> MmResult<Self> {
        [
            CompressionAlgorithm::None,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Zstd,
            CompressionAlgorithm::Lzo,
            CompressionAlgorithm::Deflate,
        ]
        .into_iter()
        .find(|a| a.name() == name)
        .ok_or(MmError::InvalidArgument)
    }

    /// 是否有可用实现
    pub fn is_available(&self) -> bool {
        matches!(self, CompressionAlgorithm::None | CompressionAlgorithm::Lz4)
    }
}

/// 游程编码；输出不短于输入时返回 None
pub fn rle_compress(input: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() / 2);
    let mut i = 0;
    while i < input.len() {
        let byte = input[i];
        let mut run = 1;
        while i + run < input.len() && input[i + run] == byte && run < RLE_MAX_RUN {
            run += 1;
        }
        if run >= RLE_MIN_RUN {
            out.extend_from_slice(&[RLE_ESCAPE, run as u8, byte]);
            i += run;
        } else {
            if byte == RLE_ESCAPE {
                out.extend_from_slice(&[RLE_ESCAPE, 0, RLE_ESCAPE]);
            } else {
                out.push(byte);
            }
            i += 1;
        }
        if out.len() >= input.len() {
            return None;
        }
    }
    Some(out)
}

/// 游程解码，返回写入的字节数
pub fn rle_decompress(input: &[u8], out: &mut [u8]) -> MmResult<usize> {
    let mut i = 0;
    let mut o = 0;
    while i < input.len() {
        if input[i] == RLE_ESCAPE {
            let (len, byte) = match (input.get(i + 1), input.get(i + 2)) {
                (Some(&len), Some(&byte)) => (len as usize, byte),
                _ => return Err(MmError::Corrupted),
            };
            let len = if len == 0 { 1 } else { len };
            let dst = out.get_mut(o..o + len).ok_or(MmError::Corrupted)?;
            dst.fill(byte);
            o += len;
            i += 3;
        } else {
            *out.get_mut(o).ok_or(MmError::Corrupted)? = input[i];
            o += 1;
            i += 1;
        }
    }
    Ok(o)
}

/// 被压缩页的标识：所属地址空间和虚拟页号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageKey(u64);

impl PageKey {
    const VPN_BITS: u32 = 40;

    pub const fn new(space: SpaceId, vpn: Vpn) -> Self {
        Self(((space as u64) << Self::VPN_BITS) | (vpn as u64 & ((1 << Self::VPN_BITS) - 1)))
    }

    pub const fn space(&self) -> SpaceId {
        (self.0 >> Self::VPN_BITS) as SpaceId
    }

    pub const fn vpn(&self) -> Vpn {
        (self.0 & ((1 << Self::VPN_BITS) - 1)) as Vpn
    }

    #[inline]
    fn hash(&self, mask: usize) -> usize {
        (self.0.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize & mask
    }
}

struct Entry {
    magic: u32,
    key: PageKey,
    algorithm: CompressionAlgorithm,
    data: Vec<u8>,
    access_time: u64,
    access_count: u32,
    hash_next: Option<u32>,
    lru: Links,
}

impl Linked for Entry {
    fn links(&self) -> &Links {
        &self.lru
    }

    fn links_mut(&mut self) -> &mut Links {
        &mut self.lru
    }
}

impl Entry {
    fn check(&self) {
        if self.magic != ENTRY_MAGIC {
            corruption("compressed entry", self.magic, ENTRY_MAGIC);
        }
    }

    fn decode(&self, dest: &mut [u8; PAGE_SIZE]) -> MmResult<()> {
        self.check();
        match self.algorithm {
            CompressionAlgorithm::None => {
                dest.fill(0);
                Ok(())
            }
            CompressionAlgorithm::Lz4 => {
                if rle_decompress(&self.data, dest)? != PAGE_SIZE {
                    return Err(MmError::Corrupted);
                }
                Ok(())
            }
            _ => Err(MmError::Corrupted),
        }
    }
}

struct PoolInner {
    entries: Vec<Option<Entry>>,
    free_slots: Vec<u32>,
    buckets: Vec<Option<u32>>,
    /// 表头最新，表尾最旧
    lru: ListHead,
    used_bytes: usize,
}

impl PoolInner {
    fn entry(&self, idx: u32) -> &Entry {
        match self.entries.get(idx as usize) {
            Some(Some(e)) => e,
            _ => panic!("compress: dangling entry {}", idx),
        }
    }

    fn entry_mut(&mut self, idx: u32) -> &mut Entry {
        match self.entries.get_mut(idx as usize) {
            Some(Some(e)) => e,
            _ => panic!("compress: dangling entry {}", idx),
        }
    }

    fn mask(&self) -> usize {
        self.buckets.len() - 1
    }

    fn find(&self, key: PageKey) -> Option<u32> {
        let mut cur = self.buckets[key.hash(self.mask())];
        while let Some(idx) = cur {
            let e = self.entry(idx);
            e.check();
            if e.key == key {
                return Some(idx);
            }
            cur = e.hash_next;
        }
        None
    }

    fn insert(&mut self, entry: Entry) -> u32 {
        let bucket = entry.key.hash(self.mask());
        self.used_bytes += entry.data.len();
        let idx = match self.free_slots.pop() {
            Some(slot) => {
                self.entries[slot as usize] = Some(entry);
                slot
            }
            None => {
                self.entries.push(Some(entry));
                (self.entries.len() - 1) as u32
            }
        };
        let head = self.buckets[bucket];
        self.entry_mut(idx).hash_next = head;
        self.buckets[bucket] = Some(idx);
        self.lru.push_front(&mut self.entries, idx);
        idx
    }

    fn remove(&mut self, idx: u32) -> Entry {
        let key = self.entry(idx).key;
        let bucket = key.hash(self.mask());
        let next = self.entry(idx).hash_next;
        if self.buckets[bucket] == Some(idx) {
            self.buckets[bucket] = next;
        } else {
            let mut cur = self.buckets[bucket];
            while let Some(i) = cur {
                let n = self.entry(i).hash_next;
                if n == Some(idx) {
                    self.entry_mut(i).hash_next = next;
                    break;
                }
                cur = n;
            }
        }
        self.lru.remove(&mut self.entries, idx);
        let entry = match self.entries[idx as usize].take() {
            Some(e) => e,
            None => panic!("compress: dangling entry {}", idx),
        };
        self.free_slots.push(idx);
        self.used_bytes -= entry.data.len();
        entry
    }
}

/// 被挤出压缩池的页
pub struct EvictedPage {
    pub key: PageKey,
    pub data: alloc::boxed::Box<[u8; PAGE_SIZE]>,
}

/// `try_compress` 成功的结果
pub struct CompressOutcome {
    pub compressed_size: usize,
    /// 为腾出空间而淘汰的页，调用者负责把它们写到别处
    pub evicted: Vec<EvictedPage>,
}

#[derive(Default)]
struct PoolCounters {
    compressions: AtomicU64,
    decompressions: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    bytes_saved: AtomicU64,
    failures: AtomicU64,
    evictions: AtomicU64,
}

/// 压缩池统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub id: usize,
    pub name: String,
    pub algorithm: Option<CompressionAlgorithm>,
    pub enabled: bool,
    pub max_pages: usize,
    pub byte_budget: usize,
    pub compressed_pages: usize,
    pub used_bytes: usize,
    pub compressions: u64,
    pub decompressions: u64,
    pub hits: u64,
    pub misses: u64,
    pub bytes_saved: u64,
    pub failures: u64,
    pub evictions: u64,
}

/// 压缩池
pub struct CompressionPool {
    id: usize,
    name: String,
    algorithm: AtomicU8,
    max_pages: usize,
    byte_budget: AtomicUsize,
    min_ratio: u32,
    max_time_us: u64,
    enabled: AtomicBool,
    platform: Arc<dyn Platform>,
    inner: Mutex<PoolInner>,
    counters: PoolCounters,
}

impl CompressionPool {
    pub fn new(
        id: usize,
        name: &str,
        algorithm: CompressionAlgorithm,
        max_pages: usize,
        platform: Arc<dyn Platform>,
    ) -> MmResult<Self> {
        if !algorithm.is_available() || max_pages == 0 {
            return Err(MmError::InvalidArgument);
        }
        let nbuckets = (2 * max_pages).next_power_of_two();
        Ok(Self {
            id,
            name: String::from(name),
            algorithm: AtomicU8::new(algorithm as u8),
            max_pages,
            byte_budget: AtomicUsize::new(max_pages * PAGE_SIZE / 2),
            min_ratio: COMPRESSION_MIN_RATIO,
            max_time_us: COMPRESSION_MAX_TIME_US,
            enabled: AtomicBool::new(true),
            platform,
            inner: Mutex::new(PoolInner {
                entries: Vec::new(),
                free_slots: Vec::new(),
                buckets: vec![None; nbuckets],
                lru: ListHead::new(),
                used_bytes: 0,
            }),
            counters: PoolCounters::default(),
        })
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::from_u8(self.algorithm.load(Ordering::Acquire))
            .unwrap_or(CompressionAlgorithm::None)
    }

    /// 切换算法；已有条目保留各自的算法标签
    pub fn set_algorithm(&self, algorithm: CompressionAlgorithm) -> MmResult<()> {
        if !algorithm.is_available() {
            return Err(MmError::InvalidArgument);
        }
        self.algorithm.store(algorithm as u8, Ordering::Release);
        Ok(())
    }

    pub fn set_byte_budget(&self, bytes: usize) {
        self.byte_budget.store(bytes, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used_bytes(&self) -> usize {
        self.inner.lock().used_bytes
    }

    pub fn contains(&self, key: PageKey) -> bool {
        self.inner.lock().find(key).is_some()
    }

    fn reject(&self, reason: RejectReason) -> MmError {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        MmError::CompressionRejected(reason)
    }

    /// 压缩并存入一页
    ///
    /// 同一 key 的旧条目先被替换。池满时从 LRU 尾部淘汰。
    pub fn try_compress(&self, key: PageKey, page: &[u8; PAGE_SIZE]) -> MmResult<CompressOutcome> {
        if !self.is_enabled() {
            return Err(self.reject(RejectReason::Disabled));
        }

        let start = self.platform.now_us();
        let (algorithm, data) = if page.iter().all(|&b| b == 0) {
            (CompressionAlgorithm::None, Vec::from(ZERO_PAGE_MARKER))
        } else {
            match self.algorithm() {
                CompressionAlgorithm::Lz4 => match rle_compress(page) {
                    Some(out) => (CompressionAlgorithm::Lz4, out),
                    None => return Err(self.reject(RejectReason::Incompressible)),
                },
                _ => return Err(self.reject(RejectReason::Incompressible)),
            }
        };
        let elapsed = self.platform.now_us().saturating_sub(start);

        if data.len() * 100 / PAGE_SIZE > self.min_ratio as usize {
            log::debug!("compress: {} ratio reject ({} bytes)", self.name, data.len());
            return Err(self.reject(RejectReason::Ratio));
        }
        if elapsed > self.max_time_us {
            log::debug!("compress: {} timeout ({} us)", self.name, elapsed);
            return Err(self.reject(RejectReason::Timeout));
        }

        let budget = self.byte_budget.load(Ordering::Acquire);
        if data.len() > budget {
            return Err(self.reject(RejectReason::PoolFull));
        }

        let size = data.len();
        let mut evicted = Vec::new();
        let mut inner = self.inner.lock();
        if let Some(old) = inner.find(key) {
            inner.remove(old);
        }
        // 先从尾部解出全部淘汰页，任何一个失败都不改动池
        let (mut len, mut used) = (inner.lru.len(), inner.used_bytes);
        let mut cursor = inner.lru.last();
        while len + 1 > self.max_pages || used + size > budget {
            let Some(idx) = cursor else {
                break;
            };
            let victim = inner.entry(idx);
            let mut image = alloc::boxed::Box::new([0u8; PAGE_SIZE]);
            if let Err(e) = victim.decode(&mut image) {
                log::error!("compress: {} cannot evict {:?}: {:?}", self.name, victim.key, e);
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
            len -= 1;
            used -= victim.data.len();
            cursor = victim.lru.prev;
            evicted.push((
                idx,
                EvictedPage {
                    key: victim.key,
                    data: image,
                },
            ));
        }
        let evicted: Vec<EvictedPage> = evicted
            .into_iter()
            .map(|(idx, page)| {
                inner.remove(idx);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                page
            })
            .collect();
        inner.insert(Entry {
            magic: ENTRY_MAGIC,
            key,
            algorithm,
            data,
            access_time: start,
            access_count: 0,
            hash_next: None,
            lru: Links::default(),
        });
        drop(inner);

        self.counters.compressions.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_saved
            .fetch_add((PAGE_SIZE - size) as u64, Ordering::Relaxed);
        #[cfg(feature = "debug_log")]
        log::trace!("compress: {} stored {:?} in {} bytes", self.name, key, size);
        Ok(CompressOutcome {
            compressed_size: size,
            evicted,
        })
    }

    /// 解压到调用者提供的页缓冲；条目保留并移到 LRU 表头
    pub fn decompress(&self, key: PageKey, dest: &mut [u8; PAGE_SIZE]) -> MmResult<()> {
        let now = self.platform.now_us();
        let mut inner = self.inner.lock();
        let Some(idx) = inner.find(key) else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Err(MmError::NotFound);
        };
        inner.entry(idx).decode(dest)?;
        let e = inner.entry_mut(idx);
        e.access_time = now;
        e.access_count = e.access_count.saturating_add(1);
        let PoolInner { entries, lru, .. } = &mut *inner;
        lru.move_to_front(entries, idx);
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        self.counters.decompressions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// 原页被改写或释放时丢弃条目
    pub fn invalidate(&self, key: PageKey) -> bool {
        let mut inner = self.inner.lock();
        match inner.find(key) {
            Some(idx) => {
                let e = inner.remove(idx);
                self.counters
                    .bytes_saved
                    .fetch_sub((PAGE_SIZE - e.data.len()) as u64, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// 丢弃某个地址空间的全部条目
    pub fn invalidate_space(&self, space: SpaceId) -> usize {
        let keys: Vec<PageKey> = {
            let inner = self.inner.lock();
            inner
                .lru
                .iter(&inner.entries)
                .map(|i| inner.entry(i).key)
                .filter(|k| k.space() == space)
                .collect()
        };
        keys.into_iter().filter(|&k| self.invalidate(k)).count()
    }

    /// 按 LRU 从旧到新列出 key
    pub fn keys(&self) -> Vec<PageKey> {
        let inner = self.inner.lock();
        let mut keys: Vec<PageKey> = inner.lru.iter(&inner.entries).map(|i| inner.entry(i).key).collect();
        keys.reverse();
        keys
    }

    /// 哈希表与 LRU 链表一致
    pub fn check_invariant(&self) -> bool {
        let inner = self.inner.lock();
        let mut in_hash = 0;
        for head in inner.buckets.iter() {
            let mut cur = *head;
            while let Some(idx) = cur {
                in_hash += 1;
                cur = inner.entry(idx).hash_next;
            }
        }
        let mut in_lru = 0;
        let mut bytes = 0;
        for idx in inner.lru.iter(&inner.entries) {
            let e = inner.entry(idx);
            if inner.find(e.key) != Some(idx) {
                return false;
            }
            in_lru += 1;
            bytes += e.data.len();
        }
        in_hash == in_lru && in_lru == inner.lru.len() && bytes == inner.used_bytes
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.counters;
        let inner = self.inner.lock();
        PoolStats {
            id: self.id,
            name: self.name.clone(),
            algorithm: Some(self.algorithm()),
            enabled: self.is_enabled(),
            max_pages: self.max_pages,
            byte_budget: self.byte_budget.load(Ordering::Relaxed),
            compressed_pages: inner.lru.len(),
            used_bytes: inner.used_bytes,
            compressions: c.compressions.load(Ordering::Relaxed),
            decompressions: c.decompressions.load(Ordering::Relaxed),
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            bytes_saved: c.bytes_saved.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
        }
    }
}

/// 压缩缓存汇总统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompressionStats {
    pub enabled: bool,
    pub active_pools: usize,
    pub compressed_pages: usize,
    pub used_bytes: usize,
    pub compressions: u64,
    pub decompressions: u64,
    pub hits: u64,
    pub misses: u64,
    pub bytes_saved: u64,
    pub failures: u64,
    pub evictions: u64,
}

/// 全部压缩池
pub struct CompressionCache {
    pools: RwLock<Vec<Option<Arc<CompressionPool>>>>,
    default_pool: AtomicUsize,
    enabled: AtomicBool,
    platform: Arc<dyn Platform>,
}

impl CompressionCache {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            pools: RwLock::new(Vec::new()),
            default_pool: AtomicUsize::new(usize::MAX),
            enabled: AtomicBool::new(true),
            platform,
        }
    }

    /// 新建池；第一个池成为默认池
    pub fn create_pool(&self, name: &str, algorithm: CompressionAlgorithm, max_pages: usize) -> MmResult<usize> {
        let mut pools = self.pools.write();
        if pools.iter().flatten().any(|p| p.name() == name) {
            return Err(MmError::Exists);
        }
        let id = match pools.iter().position(|p| p.is_none()) {
            Some(id) => id,
            None if pools.len() < COMPRESSION_MAX_POOLS => {
                pools.push(None);
                pools.len() - 1
            }
            None => return Err(MmError::OutOfMemory),
        };
        let pool = CompressionPool::new(id, name, algorithm, max_pages, self.platform.clone())?;
        pools[id] = Some(Arc::new(pool));
        let _ = self
            .default_pool
            .compare_exchange(usize::MAX, id, Ordering::AcqRel, Ordering::Acquire);
        log::info!(
            "compress: pool {} '{}' created ({}, {} pages)",
            id,
            name,
            algorithm.name(),
            max_pages
        );
        Ok(id)
    }

    /// 销毁空池
    pub fn destroy_pool(&self, id: usize) -> MmResult<()> {
        let mut pools = self.pools.write();
        let slot = pools.get_mut(id).ok_or(MmError::NotFound)?;
        match slot {
            Some(pool) if !pool.is_empty() => return Err(MmError::Busy),
            Some(_) => *slot = None,
            None => return Err(MmError::NotFound),
        }
        let _ = self
            .default_pool
            .compare_exchange(id, usize::MAX, Ordering::AcqRel, Ordering::Acquire);
        log::info!("compress: pool {} destroyed", id);
        Ok(())
    }

    pub fn pool(&self, id: usize) -> Option<Arc<CompressionPool>> {
        self.pools.read().get(id).cloned().flatten()
    }

    pub fn pools(&self) -> Vec<Arc<CompressionPool>> {
        self.pools.read().iter().flatten().cloned().collect()
    }

    pub fn default_pool(&self) -> Option<Arc<CompressionPool>> {
        self.pool(self.default_pool.load(Ordering::Acquire))
    }

    pub fn set_default_pool(&self, id: usize) -> MmResult<()> {
        self.pool(id).ok_or(MmError::NotFound)?;
        self.default_pool.store(id, Ordering::Release);
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        log::info!("compress: {}", if enabled { "enabled" } else { "disabled" });
    }

    /// 切换默认池的算法
    pub fn set_algorithm(&self, algorithm: CompressionAlgorithm) -> MmResult<()> {
        self.default_pool().ok_or(MmError::NotFound)?.set_algorithm(algorithm)
    }

    /// 存入默认池，返回池编号
    pub fn try_compress(&self, key: PageKey, page: &[u8; PAGE_SIZE]) -> MmResult<(usize, CompressOutcome)> {
        if !self.is_enabled() {
            return Err(MmError::CompressionRejected(RejectReason::Disabled));
        }
        let pool = self
            .default_pool()
            .ok_or(MmError::CompressionRejected(RejectReason::Disabled))?;
        let outcome = pool.try_compress(key, page)?;
        Ok((pool.id(), outcome))
    }

    pub fn decompress(&self, pool: usize, key: PageKey, dest: &mut [u8; PAGE_SIZE]) -> MmResult<()> {
        self.pool(pool).ok_or(MmError::NotFound)?.decompress(key, dest)
    }

    pub fn invalidate(&self, pool: usize, key: PageKey) -> bool {
        self.pool(pool).map(|p| p.invalidate(key)).unwrap_or(false)
    }

    pub fn invalidate_space(&self, space: SpaceId) -> usize {
        self.pools().iter().map(|p| p.invalidate_space(space)).sum()
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools().iter().map(|p| p.stats()).collect()
    }

    pub fn stats(&self) -> CompressionStats {
        let mut s = CompressionStats {
            enabled: self.is_enabled(),
            ..Default::default()
        };
        for p in self.pool_stats() {
            s.active_pools += p.enabled as usize;
            s.compressed_pages += p.compressed_pages;
            s.used_bytes += p.used_bytes;
            s.compressions += p.compressions;
            s.decompressions += p.decompressions;
            s.hits += p.hits;
            s.misses += p.misses;
            s.bytes_saved += p.bytes_saved;
            s.failures += p.failures;
            s.evictions += p.evictions;
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::SimPlatform;

    fn patterned(seed: u8) -> [u8; PAGE_SIZE] {
        let mut page = [0u8; PAGE_SIZE];
        for (i, chunk) in page.chunks_mut(64).enumerate() {
            chunk.fill(seed.wrapping_add(i as u8));
        }
        page
    }

    fn noisy() -> [u8; PAGE_SIZE] {
        let mut page = [0u8; PAGE_SIZE];
        let mut x: u32 = 0x1234_5678;
        for b in page.iter_mut() {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            *b = x as u8;
        }
        page
    }

    fn pool(max_pages: usize) -> (CompressionPool, Arc<SimPlatform>) {
        let platform = Arc::new(SimPlatform::new());
        let p = CompressionPool::new(0, "test", CompressionAlgorithm::Lz4, max_pages, platform.clone()).unwrap();
        (p, platform)
    }

    #[test]
    fn test_rle_codec() {
        let input = [1u8, 1, 1, 1, 0xFF, 2, 3, 3, 3];
        let out = rle_compress(&[input.as_slice(), &[9u8; 40]].concat()).unwrap();
        assert_eq!(&out[..4], &[RLE_ESCAPE, 4, 1, RLE_ESCAPE]);
        let mut buf = [0u8; 49];
        assert_eq!(rle_decompress(&out, &mut buf).unwrap(), 49);
        assert_eq!(&buf[..9], &input);
        assert!(buf[9..].iter().all(|&b| b == 9));
        assert_eq!(rle_compress(&[1, 2, 3, 4]), None);
        assert_eq!(rle_decompress(&[RLE_ESCAPE, 3], &mut buf), Err(MmError::Corrupted));
    }

    #[test]
    fn test_zero_page_marker() {
        let (p, _) = pool(4);
        let out = p.try_compress(PageKey::new(1, 5), &[0u8; PAGE_SIZE]).unwrap();
        assert_eq!(out.compressed_size, 4);
        let mut dest = [0xAAu8; PAGE_SIZE];
        p.decompress(PageKey::new(1, 5), &mut dest).unwrap();
        assert!(dest.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_roundtrip_keeps_entry() {
        let (p, _) = pool(4);
        let page = patterned(3);
        let key = PageKey::new(2, 0x40);
        p.try_compress(key, &page).unwrap();
        let mut dest = [0u8; PAGE_SIZE];
        p.decompress(key, &mut dest).unwrap();
        assert_eq!(dest, page);
        assert!(p.contains(key));
        assert!(p.invalidate(key));
        assert_eq!(p.decompress(key, &mut dest), Err(MmError::NotFound));
        assert!(p.check_invariant());
    }

    #[test]
    fn test_ratio_gate() {
        let (p, _) = pool(4);
        // 每 5 字节压成 4 字节，约 80%
        let mut page = [0u8; PAGE_SIZE];
        for (i, chunk) in page.chunks_mut(5).enumerate() {
            let n = chunk.len();
            chunk.fill(i as u8 | 1);
            chunk[n - 1] = 0x7e;
        }
        let key = PageKey::new(1, 1);
        assert_eq!(
            p.try_compress(key, &page).err(),
            Some(MmError::CompressionRejected(RejectReason::Ratio))
        );
        assert!(!p.contains(key));
        assert_eq!(
            p.try_compress(key, &noisy()).err(),
            Some(MmError::CompressionRejected(RejectReason::Incompressible))
        );
        assert_eq!(p.stats().failures, 2);
        assert!(p.is_empty());
    }

    #[test]
    fn test_timeout() {
        let (p, platform) = pool(4);
        platform.set_tick(COMPRESSION_MAX_TIME_US + 1);
        assert_eq!(
            p.try_compress(PageKey::new(1, 1), &patterned(1)).err(),
            Some(MmError::CompressionRejected(RejectReason::Timeout))
        );
    }

    #[test]
    fn test_lru_eviction() {
        let (p, _) = pool(2);
        let (a, b, c) = (PageKey::new(1, 1), PageKey::new(1, 2), PageKey::new(1, 3));
        p.try_compress(a, &patterned(1)).unwrap();
        p.try_compress(b, &patterned(2)).unwrap();
        // 访问 a 使 b 成为最旧
        let mut dest = [0u8; PAGE_SIZE];
        p.decompress(a, &mut dest).unwrap();
        let out = p.try_compress(c, &patterned(3)).unwrap();
        assert_eq!(out.evicted.len(), 1);
        assert_eq!(out.evicted[0].key, b);
        assert_eq!(*out.evicted[0].data, patterned(2));
        assert_eq!(p.keys(), alloc::vec![a, c]);
        assert!(p.check_invariant());
    }

    #[test]
    fn test_eviction_decode_failure_keeps_pool() {
        let (p, _) = pool(2);
        let (a, b, c) = (PageKey::new(2, 1), PageKey::new(2, 2), PageKey::new(2, 3));
        p.try_compress(a, &patterned(1)).unwrap();
        p.try_compress(b, &patterned(2)).unwrap();
        {
            // 把最旧条目的第一个游程长度改短，解出的长度不足一页
            let mut inner = p.inner.lock();
            let idx = inner.find(a).unwrap();
            let e = inner.entry_mut(idx);
            assert_eq!(e.data[0], RLE_ESCAPE);
            e.data[1] = 1;
        }
        assert_eq!(p.try_compress(c, &patterned(3)).err(), Some(MmError::Corrupted));
        // 两个旧条目都还在，调用者可以改走交换区
        assert_eq!(p.keys(), alloc::vec![a, b]);
        assert!(!p.contains(c));
        assert!(p.check_invariant());
    }

    #[test]
    fn test_cache_pools() {
        let cache = CompressionCache::new(Arc::new(SimPlatform::new()));
        assert_eq!(
            cache.create_pool("z", CompressionAlgorithm::Zstd, 8),
            Err(MmError::InvalidArgument)
        );
        let id = cache.create_pool("main", CompressionAlgorithm::Lz4, 8).unwrap();
        assert_eq!(cache.create_pool("main", CompressionAlgorithm::Lz4, 8), Err(MmError::Exists));
        let (pid, _) = cache.try_compress(PageKey::new(1, 1), &patterned(5)).unwrap();
        assert_eq!(pid, id);
        assert_eq!(cache.destroy_pool(id), Err(MmError::Busy));
        cache.set_enabled(false);
        assert!(cache.try_compress(PageKey::new(1, 2), &patterned(5)).is_err());
        assert_eq!(cache.invalidate_space(1), 1);
        cache.destroy_pool(id).unwrap();
        assert!(cache.default_pool().is_none());
        let json = serde_json::to_string(&cache.stats()).unwrap();
        assert!(json.contains("\"compressions\":1"));
    }

    #[test]
    fn test_page_key() {
        let k = PageKey::new(7, 0x12345);
        assert_eq!(k.space(), 7);
        assert_eq!(k.vpn(), 0x12345);
    }
}
