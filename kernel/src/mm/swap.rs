//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 交换空间管理
//!
//! 参考：Linux mm/swapfile.c
//!
//! # 设计
//! - 最多 SWAP_MAX_FILES 个交换文件，每个文件一张空闲槽位图
//! - 槽位分配：选优先级最高且还有空闲槽的文件，取第一个清零位
//! - 交换项编码：`(file_idx << 7) | (slot << 12) | 1`
//! - 每个槽位恰好存放一页；磁盘上没有超级块
//!
//! 块设备 I/O 从不在持有交换表锁或文件锁时进行。

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use serde::Serialize;
use spin::{Mutex, MutexGuard};

use super::page::PAGE_SIZE;
use crate::config::{SWAP_BLOCKS_PER_FILE, SWAP_MAX_FILES};
use crate::error::{MmError, MmResult};

/// 交换块大小（一页）
pub const SWAP_BLOCK_SIZE: usize = PAGE_SIZE;

const ENTRY_PRESENT: u64 = 1;
const ENTRY_FILE_SHIFT: u32 = 7;
const ENTRY_FILE_MASK: u64 = 0x1f;
const ENTRY_SLOT_SHIFT: u32 = 12;

/// 交换项
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapEntry(u64);

impl SwapEntry {
    pub const fn new(file: usize, slot: usize) -> Self {
        Self(((file as u64 & ENTRY_FILE_MASK) << ENTRY_FILE_SHIFT) | ((slot as u64) << ENTRY_SLOT_SHIFT) | ENTRY_PRESENT)
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(&self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_present(&self) -> bool {
        self.0 & ENTRY_PRESENT != 0
    }

    /// 文件下标（bit 7..11）
    #[inline]
    pub const fn file(&self) -> usize {
        ((self.0 >> ENTRY_FILE_SHIFT) & ENTRY_FILE_MASK) as usize
    }

    /// 槽位（bit 12 起）
    #[inline]
    pub const fn slot(&self) -> usize {
        (self.0 >> ENTRY_SLOT_SHIFT) as usize
    }
}

/// 块设备接口
pub trait BlockDevice: Send + Sync {
    fn block_size(&self) -> usize;

    fn num_blocks(&self) -> u64;

    fn read_block(&self, idx: u64, buf: &mut [u8]) -> MmResult<()>;

    fn write_block(&self, idx: u64, buf: &[u8]) -> MmResult<()>;
}

/// 内存模拟块设备（稀疏存储）
pub struct RamDisk {
    block_size: usize,
    num_blocks: u64,
    blocks: Mutex<BTreeMap<u64, Box<[u8]>>>,
    fail_io: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl RamDisk {
    pub fn new(block_size: usize, num_blocks: u64) -> Self {
        Self {
            block_size,
            num_blocks,
            blocks: Mutex::new(BTreeMap::new()),
            fail_io: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// 可容纳 pages 页的设备
    pub fn with_pages(pages: usize) -> Self {
        Self::new(SWAP_BLOCK_SIZE, pages as u64)
    }

    /// 之后的 I/O 全部返回错误
    pub fn set_fail(&self, fail: bool) {
        self.fail_io.store(fail, Ordering::Release);
    }

    pub fn io_counts(&self) -> (u64, u64) {
        (self.reads.load(Ordering::Relaxed), self.writes.load(Ordering::Relaxed))
    }
}

impl BlockDevice for RamDisk {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn read_block(&self, idx: u64, buf: &mut [u8]) -> MmResult<()> {
        if self.fail_io.load(Ordering::Acquire) || idx >= self.num_blocks || buf.len() != self.block_size {
            return Err(MmError::Io);
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        match self.blocks.lock().get(&idx) {
            Some(b) => buf.copy_from_slice(b),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_block(&self, idx: u64, buf: &[u8]) -> MmResult<()> {
        if self.fail_io.load(Ordering::Acquire) || idx >= self.num_blocks || buf.len() != self.block_size {
            return Err(MmError::Io);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.blocks.lock().insert(idx, buf.to_vec().into_boxed_slice());
        Ok(())
    }
}

struct SwapMap {
    bitmap: Vec<u64>,
    free_pages: usize,
}

/// 交换文件
struct SwapFile {
    path: String,
    priority: i32,
    device: Arc<dyn BlockDevice>,
    pages: usize,
    blocks_per_page: u64,
    /// swapoff 期间不再分配新槽
    active: AtomicBool,
    map: Mutex<SwapMap>,
}

impl SwapFile {
    /// 取第一个清零位
    fn alloc_bit(map: &mut SwapMap, pages: usize) -> Option<usize> {
        for (w, word) in map.bitmap.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let slot = w * 64 + bit;
            if slot >= pages {
                return None;
            }
            *word |= 1 << bit;
            map.free_pages -= 1;
            return Some(slot);
        }
        None
    }
}

/// 交换文件信息
#[derive(Debug, Clone, Serialize)]
pub struct SwapFileInfo {
    pub index: usize,
    pub path: String,
    pub priority: i32,
    pub pages: usize,
    pub free_pages: usize,
    pub active: bool,
}

/// 交换统计
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SwapStats {
    pub files: usize,
    pub total_pages: usize,
    pub free_pages: usize,
    pub slot_allocs: u64,
    pub slot_frees: u64,
    pub pages_written: u64,
    pub pages_read: u64,
}

/// 交换管理器
pub struct SwapManager {
    table: Mutex<Vec<Option<Arc<SwapFile>>>>,
    /// 当前持有的交换锁数量（诊断用）
    held: Arc<AtomicUsize>,
    slot_allocs: AtomicU64,
    slot_frees: AtomicU64,
    pages_written: AtomicU64,
    pages_read: AtomicU64,
}

/// 持锁计数守卫
struct Held<'a, T> {
    guard: MutexGuard<'a, T>,
    counter: &'a AtomicUsize,
}

impl<'a, T> Held<'a, T> {
    fn lock(m: &'a Mutex<T>, counter: &'a AtomicUsize) -> Self {
        let guard = m.lock();
        counter.fetch_add(1, Ordering::AcqRel);
        Self { guard, counter }
    }
}

impl<T> core::ops::Deref for Held<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> core::ops::DerefMut for Held<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for Held<'_, T> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

impl SwapManager {
    pub fn new() -> Self {
        Self {
            table: Mutex::new((0..SWAP_MAX_FILES).map(|_| None).collect()),
            held: Arc::new(AtomicUsize::new(0)),
            slot_allocs: AtomicU64::new(0),
            slot_frees: AtomicU64::new(0),
            pages_written: AtomicU64::new(0),
            pages_read: AtomicU64::new(0),
        }
    }

    fn lock_table(&self) -> Held<'_, Vec<Option<Arc<SwapFile>>>> {
        Held::lock(&self.table, &self.held)
    }

    /// 持有交换锁的计数器，块设备实现可据此检查没有在锁内做 I/O
    pub fn lock_probe(&self) -> Arc<AtomicUsize> {
        self.held.clone()
    }

    fn file(&self, idx: usize) -> MmResult<Arc<SwapFile>> {
        self.lock_table()
            .get(idx)
            .and_then(|f| f.clone())
            .ok_or(MmError::NotFound)
    }

    /// 启用交换文件，返回文件下标
    pub fn swapon(&self, path: &str, priority: i32, device: Arc<dyn BlockDevice>) -> MmResult<usize> {
        let bs = device.block_size();
        if path.is_empty() || bs == 0 || bs > PAGE_SIZE || PAGE_SIZE % bs != 0 {
            return Err(MmError::InvalidArgument);
        }
        let blocks_per_page = (PAGE_SIZE / bs) as u64;
        let pages = ((device.num_blocks() / blocks_per_page) as usize).min(SWAP_BLOCKS_PER_FILE);
        if pages == 0 {
            return Err(MmError::InvalidArgument);
        }

        let mut table = self.lock_table();
        if table.iter().flatten().any(|f| f.path == path) {
            return Err(MmError::Exists);
        }
        let idx = table
            .iter()
            .position(|f| f.is_none())
            .ok_or(MmError::NoSwapSpace)?;
        let words = pages.div_ceil(64);
        table[idx] = Some(Arc::new(SwapFile {
            path: path.to_string(),
            priority,
            device,
            pages,
            blocks_per_page,
            active: AtomicBool::new(true),
            map: Mutex::new(SwapMap {
                bitmap: alloc::vec![0; words],
                free_pages: pages,
            }),
        }));
        log::info!("swap: swapon {} ({} pages, priority {})", path, pages, priority);
        Ok(idx)
    }

    /// swapoff 第一步：停止在该文件上分配，返回文件下标
    pub fn begin_swapoff(&self, path: &str) -> MmResult<usize> {
        let table = self.lock_table();
        let (idx, file) = table
            .iter()
            .enumerate()
            .find_map(|(i, f)| f.as_ref().filter(|f| f.path == path).map(|f| (i, f)))
            .ok_or(MmError::NotFound)?;
        file.active.store(false, Ordering::Release);
        Ok(idx)
    }

    /// swapoff 第二步：文件已无占用槽时移除
    pub fn finish_swapoff(&self, idx: usize) -> MmResult<()> {
        let mut table = self.lock_table();
        let file = table.get(idx).and_then(|f| f.clone()).ok_or(MmError::NotFound)?;
        let in_use = {
            let map = Held::lock(&file.map, &self.held);
            file.pages - map.free_pages
        };
        if in_use != 0 {
            file.active.store(true, Ordering::Release);
            return Err(MmError::Busy);
        }
        table[idx] = None;
        log::info!("swap: swapoff {}", file.path);
        Ok(())
    }

    /// 放弃 swapoff，重新启用文件
    pub fn abort_swapoff(&self, idx: usize) {
        if let Ok(file) = self.file(idx) {
            file.active.store(true, Ordering::Release);
        }
    }

    /// 分配一个交换槽
    pub fn alloc_slot(&self) -> MmResult<SwapEntry> {
        let files: Vec<(usize, Arc<SwapFile>)> = {
            let table = self.lock_table();
            let mut v: Vec<_> = table
                .iter()
                .enumerate()
                .filter_map(|(i, f)| f.clone().map(|f| (i, f)))
                .filter(|(_, f)| f.active.load(Ordering::Acquire))
                .collect();
            // 优先级高的在前，同优先级按下标
            v.sort_by(|a, b| b.1.priority.cmp(&a.1.priority).then(a.0.cmp(&b.0)));
            v
        };
        for (idx, file) in files {
            let mut map = Held::lock(&file.map, &self.held);
            if map.free_pages == 0 {
                continue;
            }
            if let Some(slot) = SwapFile::alloc_bit(&mut map, file.pages) {
                self.slot_allocs.fetch_add(1, Ordering::Relaxed);
                return Ok(SwapEntry::new(idx, slot));
            }
        }
        Err(MmError::NoSwapSpace)
    }

    /// 释放交换槽
    pub fn free_slot(&self, entry: SwapEntry) -> MmResult<()> {
        if !entry.is_present() {
            return Err(MmError::InvalidArgument);
        }
        let file = self.file(entry.file())?;
        let slot = entry.slot();
        if slot >= file.pages {
            return Err(MmError::InvalidArgument);
        }
        let mut map = Held::lock(&file.map, &self.held);
        let (w, b) = (slot / 64, slot % 64);
        if map.bitmap[w] & (1 << b) == 0 {
            return Err(MmError::InvalidArgument);
        }
        map.bitmap[w] &= !(1 << b);
        map.free_pages += 1;
        self.slot_frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// 槽位是否已分配
    pub fn slot_in_use(&self, entry: SwapEntry) -> bool {
        let Ok(file) = self.file(entry.file()) else {
            return false;
        };
        let slot = entry.slot();
        if slot >= file.pages {
            return false;
        }
        let map = Held::lock(&file.map, &self.held);
        map.bitmap[slot / 64] & (1 << (slot % 64)) != 0
    }

    /// 换出一页到交换槽（锁外 I/O）
    pub fn write_page(&self, entry: SwapEntry, page: &[u8; PAGE_SIZE]) -> MmResult<()> {
        let file = self.file(entry.file())?;
        if entry.slot() >= file.pages {
            return Err(MmError::InvalidArgument);
        }
        let bs = file.device.block_size();
        let first = entry.slot() as u64 * file.blocks_per_page;
        for (i, chunk) in page.chunks(bs).enumerate() {
            file.device.write_block(first + i as u64, chunk)?;
        }
        self.pages_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// 从交换槽读入一页（锁外 I/O）
    pub fn read_page(&self, entry: SwapEntry, page: &mut [u8; PAGE_SIZE]) -> MmResult<()> {
        let file = self.file(entry.file())?;
        if entry.slot() >= file.pages {
            return Err(MmError::InvalidArgument);
        }
        let bs = file.device.block_size();
        let first = entry.slot() as u64 * file.blocks_per_page;
        for (i, chunk) in page.chunks_mut(bs).enumerate() {
            file.device.read_block(first + i as u64, chunk)?;
        }
        self.pages_read.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// 位图快照（测试用）
    pub fn bitmap_snapshot(&self, idx: usize) -> MmResult<Vec<u64>> {
        let file = self.file(idx)?;
        let map = Held::lock(&file.map, &self.held);
        Ok(map.bitmap.clone())
    }

    pub fn files(&self) -> Vec<SwapFileInfo> {
        let files: Vec<(usize, Arc<SwapFile>)> = self
            .lock_table()
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.clone().map(|f| (i, f)))
            .collect();
        files
            .into_iter()
            .map(|(index, f)| {
                let free_pages = Held::lock(&f.map, &self.held).free_pages;
                SwapFileInfo {
                    index,
                    path: f.path.clone(),
                    priority: f.priority,
                    pages: f.pages,
                    free_pages,
                    active: f.active.load(Ordering::Acquire),
                }
            })
            .collect()
    }

    pub fn total_pages(&self) -> usize {
        self.files().iter().map(|f| f.pages).sum()
    }

    pub fn free_pages(&self) -> usize {
        self.files().iter().map(|f| f.free_pages).sum()
    }

    pub fn stats(&self) -> SwapStats {
        let files = self.files();
        SwapStats {
            files: files.len(),
            total_pages: files.iter().map(|f| f.pages).sum(),
            free_pages: files.iter().map(|f| f.free_pages).sum(),
            slot_allocs: self.slot_allocs.load(Ordering::Relaxed),
            slot_frees: self.slot_frees.load(Ordering::Relaxed),
            pages_written: self.pages_written.load(Ordering::Relaxed),
            pages_read: self.pages_read.load(Ordering::Relaxed),
        }
    }
}

impl Default for SwapManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_encoding() {
        let e = SwapEntry::new(3, 77);
        assert_eq!(e.raw(), (3 << 7) | (77 << 12) | 1);
        assert_eq!(e.file(), 3);
        assert_eq!(e.slot(), 77);
        assert!(e.is_present());
        assert!(!SwapEntry::from_raw(0).is_present());
    }

    #[test]
    fn test_priority_selection() {
        let swap = SwapManager::new();
        swap.swapon("/low", 1, Arc::new(RamDisk::with_pages(4))).unwrap();
        let hi = swap.swapon("/high", 5, Arc::new(RamDisk::with_pages(2))).unwrap();
        let a = swap.alloc_slot().unwrap();
        let b = swap.alloc_slot().unwrap();
        assert_eq!((a.file(), a.slot()), (hi, 0));
        assert_eq!((b.file(), b.slot()), (hi, 1));
        // 高优先级文件满后落到低优先级
        let c = swap.alloc_slot().unwrap();
        assert_ne!(c.file(), hi);
    }

    #[test]
    fn test_exhaustion_and_double_free() {
        let swap = SwapManager::new();
        swap.swapon("/s", 0, Arc::new(RamDisk::with_pages(2))).unwrap();
        let a = swap.alloc_slot().unwrap();
        let _b = swap.alloc_slot().unwrap();
        assert_eq!(swap.alloc_slot(), Err(MmError::NoSwapSpace));
        swap.free_slot(a).unwrap();
        assert_eq!(swap.free_slot(a), Err(MmError::InvalidArgument));
    }

    #[test]
    fn test_page_io_roundtrip() {
        let swap = SwapManager::new();
        // 512 字节块：每页 8 块
        swap.swapon("/s", 0, Arc::new(RamDisk::new(512, 64))).unwrap();
        let e = swap.alloc_slot().unwrap();
        let mut page = [0u8; PAGE_SIZE];
        page[0] = 1;
        page[PAGE_SIZE - 1] = 2;
        swap.write_page(e, &page).unwrap();
        let mut back = [0u8; PAGE_SIZE];
        swap.read_page(e, &mut back).unwrap();
        assert_eq!(back[0], 1);
        assert_eq!(back[PAGE_SIZE - 1], 2);
        assert_eq!(swap.lock_probe().load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_swapon_errors() {
        let swap = SwapManager::new();
        swap.swapon("/s", 0, Arc::new(RamDisk::with_pages(1))).unwrap();
        assert_eq!(
            swap.swapon("/s", 0, Arc::new(RamDisk::with_pages(1))),
            Err(MmError::Exists)
        );
        assert_eq!(
            swap.swapon("/t", 0, Arc::new(RamDisk::new(3000, 8))),
            Err(MmError::InvalidArgument)
        );
        for i in 1..SWAP_MAX_FILES {
            swap.swapon(&alloc::format!("/f{}", i), 0, Arc::new(RamDisk::with_pages(1)))
                .unwrap();
        }
        assert_eq!(
            swap.swapon("/full", 0, Arc::new(RamDisk::with_pages(1))),
            Err(MmError::NoSwapSpace)
        );
    }

    #[test]
    fn test_swapoff_busy() {
        let swap = SwapManager::new();
        swap.swapon("/s", 0, Arc::new(RamDisk::with_pages(2))).unwrap();
        let e = swap.alloc_slot().unwrap();
        let idx = swap.begin_swapoff("/s").unwrap();
        assert_eq!(swap.alloc_slot(), Err(MmError::NoSwapSpace));
        assert_eq!(swap.finish_swapoff(idx), Err(MmError::Busy));
        swap.free_slot(e).unwrap();
        swap.begin_swapoff("/s").unwrap();
        swap.finish_swapoff(idx).unwrap();
        assert_eq!(swap.total_pages(), 0);
    }
}
