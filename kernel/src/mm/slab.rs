//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! Slab 分配器
//!
//! 用于固定大小内核对象的高效分配，减少 buddy allocator 的碎片。
//!
//! 参考：
//! - https://www.kernel.org/doc/html/latest/core-api/memory-allocation.html
//! - Linux mm/slab.c (array_cache / kmem_cache_node)
//!
//! # 设计
//! - SlabCache: 管理一种对象大小的缓存，三条 slab 链表 (full / partial / empty)
//! - Slab: 由 buddy 分配的 2^order 个页，空闲对象通过对象内部的下标串成单链表
//! - 每 CPU 前端缓存：空闲对象地址组成的栈，命中时不碰共享锁
//! - 前端缓存未命中时在共享锁下批量 refill，超过 3/4 容量时批量 drain 一半
//!
//! 锁顺序：CPU 前端缓存 → 缓存共享锁 → 页归属表 → zone

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use serde::Serialize;
use spin::{Mutex, MutexGuard, RwLock};

use super::buddy::FrameProvider;
use super::gfp::GfpFlags;
use super::list::{Linked, Links, ListHead};
use super::page::{align_up, order_pages, PhysAddr, Pfn, PAGE_SIZE};
use super::phys::PhysMem;
use crate::config::{SLAB_COLOUR_ALIGN, SLAB_MAX_CACHES, SLAB_MAX_COLOUR, SLAB_MIN_ALIGN};
use crate::error::{corruption, MmError, MmResult};
use crate::platform::Platform;

/// 缓存与 slab 描述符魔数
pub const SLAB_MAGIC: u32 = 0xCAFE_BABE;

/// slab 可管理的最大对象
pub const SLAB_MAX_SIZE: usize = PAGE_SIZE / 2;

/// 每个 slab 至少容纳的对象数
const MIN_OBJS_PER_SLAB: usize = 8;

const MAX_SLAB_ORDER: usize = 3;

/// 空闲链表结束标记
const FREE_END: u32 = u32::MAX;

/// POISON 填充字节
const POISON_FREE: u8 = 0x6b;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SlabFlags: u32 {
        /// 按缓存行对齐
        const HWCACHE_ALIGN = 0x01;
        /// 新建对象填充毒化字节
        const POISON = 0x02;
        const RED_ZONE = 0x04;
        const STORE_USER = 0x08;
        /// 分配失败时 panic
        const PANIC = 0x10;
    }
}

/// 对象构造/析构函数
pub type ObjectCtor = fn(&mut [u8]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CacheId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlabList {
    Full = 0,
    Partial = 1,
    Empty = 2,
}

/// Slab 描述符
struct Slab {
    magic: u32,
    pfn: Pfn,
    node: usize,
    colour_off: usize,
    inuse: u32,
    free_head: u32,
    list: SlabList,
    links: Links,
}

impl Linked for Slab {
    fn links(&self) -> &Links {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }
}

/// 页 → slab 的归属记录，slab 存活期间不变
#[derive(Debug, Clone)]
struct SlabRef {
    cache: CacheId,
    slab: u32,
    first_pfn: Pfn,
    colour_off: usize,
    /// 每个对象一位：置位表示对象在调用者手里（前端缓存中的对象不算）
    held: Arc<[AtomicU64]>,
}

impl SlabRef {
    fn new_held(objs: usize) -> Arc<[AtomicU64]> {
        (0..objs.div_ceil(64)).map(|_| AtomicU64::new(0)).collect()
    }

    /// 置位并返回原值
    fn set_held(&self, idx: usize) -> bool {
        let bit = 1u64 << (idx % 64);
        self.held[idx / 64].fetch_or(bit, Ordering::AcqRel) & bit != 0
    }

    /// 清位并返回原值
    fn clear_held(&self, idx: usize) -> bool {
        let bit = 1u64 << (idx % 64);
        self.held[idx / 64].fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }
}

/// 缓存共享状态（受缓存共享锁保护）
struct CacheShared {
    slabs: Vec<Option<Slab>>,
    free_slots: Vec<u32>,
    lists: [ListHead; 3],
    colour_next: usize,
}

impl CacheShared {
    fn slab(&self, idx: u32) -> &Slab {
        match self.slabs.get(idx as usize) {
            Some(Some(s)) => s,
            _ => panic!("slab: dangling slab index {}", idx),
        }
    }

    fn slab_mut(&mut self, idx: u32) -> &mut Slab {
        match self.slabs.get_mut(idx as usize) {
            Some(Some(s)) => s,
            _ => panic!("slab: dangling slab index {}", idx),
        }
    }

    fn live_slabs(&self) -> usize {
        self.lists.iter().map(|l| l.len()).sum()
    }
}

/// 每 CPU 前端缓存
struct CpuCache {
    avail: Vec<PhysAddr>,
    allocs: u64,
    frees: u64,
    transfers_in: u64,
    transfers_out: u64,
    high_water: usize,
}

/// 每 CPU 前端缓存统计
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CpuCacheStats {
    pub avail: usize,
    pub limit: usize,
    pub batch: usize,
    pub allocs: u64,
    pub frees: u64,
    pub transfers_in: u64,
    pub transfers_out: u64,
    /// 观测到的最大占用
    pub high_water: usize,
}

/// 单个缓存统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub name: String,
    pub object_size: usize,
    pub stride: usize,
    pub order: usize,
    pub objs_per_slab: usize,
    pub total_allocations: u64,
    pub total_frees: u64,
    pub active_objects: usize,
    pub peak_usage: usize,
    pub shared_lock_acquisitions: u64,
    pub full_slabs: usize,
    pub partial_slabs: usize,
    pub empty_slabs: usize,
}

/// 全局 slab 统计
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SlabStats {
    pub total_caches: usize,
    pub total_slabs: u64,
    pub total_objects: u64,
    pub allocated_objects: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// 前端缓存命中率（百分比）
    pub hit_ratio: u64,
    pub slab_pages: u64,
}

/// 所有缓存共享的页归属表和全局计数
#[derive(Default)]
struct SlabShared {
    owners: RwLock<BTreeMap<Pfn, SlabRef>>,
    total_slabs: AtomicU64,
    total_objects: AtomicU64,
    allocated_objects: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    slab_pages: AtomicU64,
}

/// 创建缓存的参数
#[derive(Clone)]
pub struct CacheDesc<'a> {
    pub name: &'a str,
    pub size: usize,
    pub align: usize,
    pub flags: SlabFlags,
    pub ctor: Option<ObjectCtor>,
    pub dtor: Option<ObjectCtor>,
    /// 覆盖默认的前端缓存容量
    pub cpu_limit: Option<usize>,
    pub cpu_batch: Option<usize>,
}

impl<'a> CacheDesc<'a> {
    pub fn new(name: &'a str, size: usize) -> Self {
        Self {
            name,
            size,
            align: SLAB_MIN_ALIGN,
            flags: SlabFlags::empty(),
            ctor: None,
            dtor: None,
            cpu_limit: None,
            cpu_batch: None,
        }
    }
}

/// Slab 缓存
pub struct SlabCache {
    magic: u32,
    id: CacheId,
    name: String,
    object_size: usize,
    stride: usize,
    /// 空闲链表下标在对象内的偏移
    link_offset: usize,
    flags: SlabFlags,
    ctor: Option<ObjectCtor>,
    dtor: Option<ObjectCtor>,
    order: usize,
    objs_per_slab: usize,
    colours: usize,
    colour_step: usize,
    limit: usize,
    batch: usize,
    cpus: Vec<Mutex<CpuCache>>,
    shared: Mutex<CacheShared>,
    shared_locks: AtomicU64,
    total_allocations: AtomicU64,
    total_frees: AtomicU64,
    active_objects: AtomicUsize,
    peak_usage: AtomicUsize,
    provider: Arc<dyn FrameProvider>,
    phys: Arc<PhysMem>,
    platform: Arc<dyn Platform>,
    global: Arc<SlabShared>,
}

impl SlabCache {
    #[inline]
    pub fn id(&self) -> CacheId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    #[inline]
    pub fn objs_per_slab(&self) -> usize {
        self.objs_per_slab
    }

    #[inline]
    pub fn cpu_limit(&self) -> usize {
        self.limit
    }

    #[inline]
    pub fn cpu_batch(&self) -> usize {
        self.batch
    }

    /// 共享锁获取次数
    pub fn shared_lock_acquisitions(&self) -> u64 {
        self.shared_locks.load(Ordering::Relaxed)
    }

    fn check_magic(&self) {
        if self.magic != SLAB_MAGIC {
            corruption("slab cache", self.magic, SLAB_MAGIC);
        }
    }

    #[inline]
    fn cpu_index(&self) -> usize {
        self.platform.current_cpu() % self.cpus.len()
    }

    fn lock_shared(&self) -> MutexGuard<'_, CacheShared> {
        self.shared_locks.fetch_add(1, Ordering::Relaxed);
        self.shared.lock()
    }

    #[inline]
    fn obj_addr(&self, pfn: Pfn, colour_off: usize, idx: u32) -> PhysAddr {
        PhysAddr::from_pfn(pfn).add(colour_off + idx as usize * self.stride)
    }

    fn fail(&self, err: MmError) -> MmError {
        if self.flags.contains(SlabFlags::PANIC) {
            panic!("slab: cache {} allocation failed: {}", self.name, err);
        }
        err
    }

    /// 分配一个对象
    pub fn alloc(&self) -> MmResult<PhysAddr> {
        self.check_magic();
        let mut cc = self.cpus[self.cpu_index()].lock();
        let obj = match cc.avail.pop() {
            Some(obj) => {
                self.global.cache_hits.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "debug_log")]
                log::trace!("slab: {} front cache hit {:#x}", self.name, obj.as_usize());
                obj
            }
            None => {
                self.global.cache_misses.fetch_add(1, Ordering::Relaxed);
                self.refill(&mut cc).map_err(|e| self.fail(e))?;
                cc.avail.pop().ok_or_else(|| self.fail(MmError::OutOfMemory))?
            }
        };
        cc.allocs += 1;
        drop(cc);
        self.note_alloc(obj);
        Ok(obj)
    }

    /// 在指定 NUMA 节点的 slab 上分配对象（绕过前端缓存）
    pub fn alloc_node(&self, node: usize) -> MmResult<PhysAddr> {
        self.check_magic();
        let mut shared = self.lock_shared();
        let found = shared.lists[SlabList::Partial as usize]
            .iter(&shared.slabs)
            .chain(shared.lists[SlabList::Empty as usize].iter(&shared.slabs))
            .find(|&i| shared.slab(i).node == node);
        let idx = match found {
            Some(i) => i,
            None => self.grow(&mut shared, Some(node)).map_err(|e| self.fail(e))?,
        };
        let obj = self
            .take_object(&mut shared, idx)
            .ok_or_else(|| self.fail(MmError::OutOfMemory))?;
        drop(shared);
        self.note_alloc(obj);
        Ok(obj)
    }

    /// 释放对象；重复释放返回 InvalidArgument，缓存状态不变
    pub fn free(&self, obj: PhysAddr) -> MmResult<()> {
        self.check_magic();
        let (r, idx) = self.validate(obj)?;
        if !r.clear_held(idx) {
            log::warn!("slab: {} double free of {:#x}", self.name, obj.as_usize());
            return Err(MmError::InvalidArgument);
        }
        let mut cc = self.cpus[self.cpu_index()].lock();
        cc.avail.push(obj);
        cc.frees += 1;
        cc.high_water = cc.high_water.max(cc.avail.len());
        if cc.avail.len() > self.limit * 3 / 4 {
            let n = cc.avail.len() / 2;
            self.drain(&mut cc, n);
        }
        drop(cc);
        self.total_frees.fetch_add(1, Ordering::Relaxed);
        self.active_objects.fetch_sub(1, Ordering::Relaxed);
        self.global.allocated_objects.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    fn note_alloc(&self, obj: PhysAddr) {
        match self.validate(obj) {
            Ok((r, idx)) => {
                if r.set_held(idx) {
                    log::error!("slab: {} handed out {:#x} twice", self.name, obj.as_usize());
                    panic!("slab: {} object {:#x} already held", self.name, obj.as_usize());
                }
            }
            Err(_) => panic!("slab: {} allocated foreign object {:#x}", self.name, obj.as_usize()),
        }
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        let active = self.active_objects.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_usage.fetch_max(active, Ordering::Relaxed);
        self.global.allocated_objects.fetch_add(1, Ordering::Relaxed);
    }

    /// 校验对象地址属于本缓存且落在对象边界上，返回归属记录和对象下标
    fn validate(&self, obj: PhysAddr) -> MmResult<(SlabRef, usize)> {
        let r = self
            .global
            .owners
            .read()
            .get(&obj.pfn())
            .cloned()
            .ok_or(MmError::InvalidArgument)?;
        if r.cache != self.id {
            return Err(MmError::InvalidArgument);
        }
        let base = PhysAddr::from_pfn(r.first_pfn).add(r.colour_off).as_usize();
        let off = obj.as_usize().checked_sub(base).ok_or(MmError::InvalidArgument)?;
        if off % self.stride != 0 || off / self.stride >= self.objs_per_slab {
            return Err(MmError::InvalidArgument);
        }
        Ok((r, off / self.stride))
    }

    /// 从共享 slab 批量搬运对象到前端缓存
    fn refill(&self, cc: &mut CpuCache) -> MmResult<()> {
        let want = self.batch.min(self.limit - cc.avail.len());
        let mut shared = self.lock_shared();
        let mut moved = 0;
        while moved < want {
            let idx = match shared.lists[SlabList::Partial as usize]
                .first()
                .or(shared.lists[SlabList::Empty as usize].first())
            {
                Some(i) => i,
                None => match self.grow(&mut shared, None) {
                    Ok(i) => i,
                    Err(e) if moved == 0 => return Err(e),
                    Err(_) => break,
                },
            };
            while moved < want {
                match self.take_object(&mut shared, idx) {
                    Some(obj) => {
                        cc.avail.push(obj);
                        moved += 1;
                    }
                    None => break,
                }
            }
        }
        cc.transfers_in += moved as u64;
        cc.high_water = cc.high_water.max(cc.avail.len());
        log::debug!("slab: {} refill {} objects", self.name, moved);
        Ok(())
    }

    /// 把前端缓存底部（最旧）的 count 个对象还给 slab
    fn drain(&self, cc: &mut CpuCache, count: usize) {
        if count == 0 {
            return;
        }
        let mut shared = self.lock_shared();
        let owners = self.global.owners.read();
        for obj in cc.avail.drain(..count) {
            match owners.get(&obj.pfn()) {
                Some(r) => self.put_object(&mut shared, r.slab, obj),
                None => log::error!("slab: {} drain lost owner of {:#x}", self.name, obj.as_usize()),
            }
        }
        cc.transfers_out += count as u64;
        log::debug!("slab: {} drain {} objects", self.name, count);
    }

    /// 从 slab 取出一个空闲对象
    fn take_object(&self, shared: &mut CacheShared, idx: u32) -> Option<PhysAddr> {
        let slab = shared.slab_mut(idx);
        if slab.magic != SLAB_MAGIC {
            corruption("slab", slab.magic, SLAB_MAGIC);
        }
        if slab.free_head == FREE_END {
            return None;
        }
        let obj = self.obj_addr(slab.pfn, slab.colour_off, slab.free_head);
        slab.free_head = self.phys.read_u32(obj.add(self.link_offset));
        slab.inuse += 1;
        self.relist(shared, idx);
        Some(obj)
    }

    /// 把对象放回所属 slab 的空闲链表
    fn put_object(&self, shared: &mut CacheShared, idx: u32, obj: PhysAddr) {
        let stride = self.stride;
        let slab = shared.slab_mut(idx);
        if slab.magic != SLAB_MAGIC {
            corruption("slab", slab.magic, SLAB_MAGIC);
        }
        let base = PhysAddr::from_pfn(slab.pfn).add(slab.colour_off);
        let obj_idx = ((obj.as_usize() - base.as_usize()) / stride) as u32;
        self.phys.write_u32(obj.add(self.link_offset), slab.free_head);
        slab.free_head = obj_idx;
        slab.inuse -= 1;
        self.relist(shared, idx);
    }

    /// 根据 inuse 重新确定 slab 所在链表
    fn relist(&self, shared: &mut CacheShared, idx: u32) {
        let slab = shared.slab(idx);
        let want = if slab.inuse as usize == self.objs_per_slab {
            SlabList::Full
        } else if slab.inuse == 0 {
            SlabList::Empty
        } else {
            SlabList::Partial
        };
        let cur = slab.list;
        if cur == want {
            return;
        }
        let CacheShared { slabs, lists, .. } = &mut *shared;
        lists[cur as usize].remove(slabs, idx);
        lists[want as usize].push_front(slabs, idx);
        shared.slab_mut(idx).list = want;
    }

    /// 新建一个 slab，放入 empty 链表
    fn grow(&self, shared: &mut CacheShared, node_hint: Option<usize>) -> MmResult<u32> {
        let pfn = self
            .provider
            .alloc_frames(self.order, GfpFlags::KERNEL, node_hint)?;
        let node = self.provider.node_of(pfn).unwrap_or(0);
        let colour_off = (shared.colour_next % self.colours) * self.colour_step;
        shared.colour_next = (shared.colour_next + 1) % self.colours;

        let mut scratch = alloc::vec![0u8; self.object_size];
        for i in 0..self.objs_per_slab {
            let addr = self.obj_addr(pfn, colour_off, i as u32);
            if let Some(ctor) = self.ctor {
                scratch.fill(0);
                ctor(&mut scratch);
                self.phys.write(addr, &scratch);
            } else if self.flags.contains(SlabFlags::POISON) {
                self.phys.fill(addr, self.object_size, POISON_FREE);
            }
            let next = if i + 1 < self.objs_per_slab {
                (i + 1) as u32
            } else {
                FREE_END
            };
            self.phys.write_u32(addr.add(self.link_offset), next);
        }

        let slab = Slab {
            magic: SLAB_MAGIC,
            pfn,
            node,
            colour_off,
            inuse: 0,
            free_head: 0,
            list: SlabList::Empty,
            links: Links::default(),
        };
        let idx = match shared.free_slots.pop() {
            Some(slot) => {
                shared.slabs[slot as usize] = Some(slab);
                slot
            }
            None => {
                shared.slabs.push(Some(slab));
                (shared.slabs.len() - 1) as u32
            }
        };
        let CacheShared { slabs, lists, .. } = &mut *shared;
        lists[SlabList::Empty as usize].push_front(slabs, idx);

        {
            let held = SlabRef::new_held(self.objs_per_slab);
            let mut owners = self.global.owners.write();
            for p in pfn..pfn + order_pages(self.order) {
                owners.insert(
                    p,
                    SlabRef {
                        cache: self.id,
                        slab: idx,
                        first_pfn: pfn,
                        colour_off,
                        held: held.clone(),
                    },
                );
            }
        }
        self.global.total_slabs.fetch_add(1, Ordering::Relaxed);
        self.global
            .total_objects
            .fetch_add(self.objs_per_slab as u64, Ordering::Relaxed);
        self.global
            .slab_pages
            .fetch_add(order_pages(self.order) as u64, Ordering::Relaxed);
        log::debug!(
            "slab: {} new slab pfn {:#x} node {} colour {}",
            self.name,
            pfn,
            node,
            colour_off
        );
        Ok(idx)
    }

    /// 销毁一个空 slab：运行析构函数并归还页
    fn destroy_slab(&self, shared: &mut CacheShared, idx: u32) {
        let (pfn, colour_off, list) = {
            let s = shared.slab(idx);
            (s.pfn, s.colour_off, s.list)
        };
        {
            let CacheShared { slabs, lists, .. } = &mut *shared;
            lists[list as usize].remove(slabs, idx);
        }
        shared.slabs[idx as usize] = None;
        shared.free_slots.push(idx);

        if let Some(dtor) = self.dtor {
            let mut scratch = alloc::vec![0u8; self.object_size];
            for i in 0..self.objs_per_slab {
                let addr = self.obj_addr(pfn, colour_off, i as u32);
                self.phys.read(addr, &mut scratch);
                dtor(&mut scratch);
            }
        }

        {
            let mut owners = self.global.owners.write();
            for p in pfn..pfn + order_pages(self.order) {
                owners.remove(&p);
            }
        }
        if let Err(e) = self.provider.free_frames(pfn, self.order) {
            log::warn!("slab: {} failed to release pfn {:#x}: {}", self.name, pfn, e);
        }
        self.global.total_slabs.fetch_sub(1, Ordering::Relaxed);
        self.global
            .total_objects
            .fetch_sub(self.objs_per_slab as u64, Ordering::Relaxed);
        self.global
            .slab_pages
            .fetch_sub(order_pages(self.order) as u64, Ordering::Relaxed);
    }

    /// 清空所有 CPU 的前端缓存
    pub fn drain_cpu_caches(&self) {
        for cpu in &self.cpus {
            let mut cc = cpu.lock();
            let n = cc.avail.len();
            self.drain(&mut cc, n);
        }
    }

    /// 清空前端缓存后释放所有空 slab，返回释放的页数
    pub fn shrink(&self) -> usize {
        self.drain_cpu_caches();
        let mut shared = self.lock_shared();
        let mut released = 0;
        while let Some(idx) = shared.lists[SlabList::Empty as usize].first() {
            self.destroy_slab(&mut shared, idx);
            released += order_pages(self.order);
        }
        if released > 0 {
            log::debug!("slab: {} shrink released {} pages", self.name, released);
        }
        released
    }

    /// 销毁缓存的全部 slab；仍有对象在用时返回 Busy
    fn destroy(&self) -> MmResult<()> {
        self.drain_cpu_caches();
        let mut shared = self.lock_shared();
        if !shared.lists[SlabList::Full as usize].is_empty()
            || !shared.lists[SlabList::Partial as usize].is_empty()
        {
            return Err(MmError::Busy);
        }
        while let Some(idx) = shared.lists[SlabList::Empty as usize].first() {
            self.destroy_slab(&mut shared, idx);
        }
        for cpu in &self.cpus {
            let mut cc = cpu.lock();
            cc.avail = Vec::new();
        }
        Ok(())
    }

    /// (full, partial, empty) slab 数
    pub fn slab_counts(&self) -> (usize, usize, usize) {
        let shared = self.lock_shared();
        (
            shared.lists[SlabList::Full as usize].len(),
            shared.lists[SlabList::Partial as usize].len(),
            shared.lists[SlabList::Empty as usize].len(),
        )
    }

    /// 校验 slab 链表划分：每个 slab 恰好在与其 inuse 一致的链表上
    pub fn check_lists(&self) -> bool {
        let shared = self.shared.lock();
        let mut seen = 0;
        for (li, list) in shared.lists.iter().enumerate() {
            for idx in list.iter(&shared.slabs) {
                let s = shared.slab(idx);
                let ok = match li {
                    0 => s.inuse as usize == self.objs_per_slab,
                    1 => s.inuse > 0 && (s.inuse as usize) < self.objs_per_slab,
                    _ => s.inuse == 0,
                };
                if !ok || s.list as usize != li {
                    return false;
                }
                seen += 1;
            }
        }
        let live = shared.slabs.iter().filter(|s| s.is_some()).count();
        seen == live && seen == shared.live_slabs()
    }

    /// 某个 CPU 前端缓存当前的对象数
    pub fn cpu_avail(&self, cpu: usize) -> usize {
        self.cpus[cpu % self.cpus.len()].lock().avail.len()
    }

    pub fn cpu_stats(&self, cpu: usize) -> CpuCacheStats {
        let cc = self.cpus[cpu % self.cpus.len()].lock();
        CpuCacheStats {
            avail: cc.avail.len(),
            limit: self.limit,
            batch: self.batch,
            allocs: cc.allocs,
            frees: cc.frees,
            transfers_in: cc.transfers_in,
            transfers_out: cc.transfers_out,
            high_water: cc.high_water,
        }
    }

    pub fn stats(&self) -> CacheStats {
        let (full, partial, empty) = {
            let shared = self.shared.lock();
            (
                shared.lists[SlabList::Full as usize].len(),
                shared.lists[SlabList::Partial as usize].len(),
                shared.lists[SlabList::Empty as usize].len(),
            )
        };
        CacheStats {
            name: self.name.clone(),
            object_size: self.object_size,
            stride: self.stride,
            order: self.order,
            objs_per_slab: self.objs_per_slab,
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            total_frees: self.total_frees.load(Ordering::Relaxed),
            active_objects: self.active_objects.load(Ordering::Relaxed),
            peak_usage: self.peak_usage.load(Ordering::Relaxed),
            shared_lock_acquisitions: self.shared_locks.load(Ordering::Relaxed),
            full_slabs: full,
            partial_slabs: partial,
            empty_slabs: empty,
        }
    }
}

/// Slab 分配器：缓存链与全局统计
pub struct SlabAllocator {
    /// 全局缓存链
    chain: Mutex<Vec<Option<Arc<SlabCache>>>>,
    global: Arc<SlabShared>,
    provider: Arc<dyn FrameProvider>,
    phys: Arc<PhysMem>,
    platform: Arc<dyn Platform>,
    nr_cpus: usize,
    cpu_limit: usize,
    cpu_batch: usize,
}

impl SlabAllocator {
    pub fn new(
        provider: Arc<dyn FrameProvider>,
        phys: Arc<PhysMem>,
        platform: Arc<dyn Platform>,
        nr_cpus: usize,
        cpu_limit: usize,
        cpu_batch: usize,
    ) -> Self {
        Self {
            chain: Mutex::new(Vec::new()),
            global: Arc::new(SlabShared::default()),
            provider,
            phys,
            platform,
            nr_cpus: nr_cpus.max(1),
            cpu_limit,
            cpu_batch,
        }
    }

    /// 创建缓存
    pub fn cache_create(
        &self,
        name: &str,
        size: usize,
        align: usize,
        ctor: Option<ObjectCtor>,
    ) -> MmResult<Arc<SlabCache>> {
        let mut desc = CacheDesc::new(name, size);
        desc.align = align;
        desc.ctor = ctor;
        self.cache_create_with(&desc)
    }

    pub fn cache_create_with(&self, desc: &CacheDesc<'_>) -> MmResult<Arc<SlabCache>> {
        if desc.size == 0 || desc.size > SLAB_MAX_SIZE || desc.name.is_empty() {
            return Err(MmError::InvalidArgument);
        }
        let mut align = desc.align.max(SLAB_MIN_ALIGN);
        if !align.is_power_of_two() {
            return Err(MmError::InvalidArgument);
        }
        if desc.flags.contains(SlabFlags::HWCACHE_ALIGN) {
            align = align.max(SLAB_COLOUR_ALIGN);
        }
        let limit = desc.cpu_limit.unwrap_or(self.cpu_limit).max(1);
        let batch = desc.cpu_batch.unwrap_or(self.cpu_batch).clamp(1, limit);

        // 有构造函数时链接字放在对象末尾，不破坏构造出的内容
        let (stride, link_offset) = if desc.ctor.is_some() {
            let s = align_up(desc.size + 4, align);
            (s, s - 4)
        } else {
            (align_up(desc.size, align), 0)
        };

        let mut order = 0;
        while order < MAX_SLAB_ORDER && (PAGE_SIZE << order) / stride < MIN_OBJS_PER_SLAB {
            order += 1;
        }
        let slab_bytes = PAGE_SIZE << order;
        let objs_per_slab = slab_bytes / stride;
        let leftover = slab_bytes - objs_per_slab * stride;
        let colour_step = SLAB_COLOUR_ALIGN.max(align);
        let colours = (leftover / colour_step + 1).min(SLAB_MAX_COLOUR);

        let mut chain = self.chain.lock();
        if chain.iter().flatten().any(|c| c.name == desc.name) {
            return Err(MmError::Exists);
        }
        let slot = match chain.iter().position(|c| c.is_none()) {
            Some(slot) => slot,
            None if chain.len() < SLAB_MAX_CACHES => {
                chain.push(None);
                chain.len() - 1
            }
            None => return Err(MmError::OutOfMemory),
        };

        let cache = Arc::new(SlabCache {
            magic: SLAB_MAGIC,
            id: CacheId(slot as u16),
            name: desc.name.to_string(),
            object_size: desc.size,
            stride,
            link_offset,
            flags: desc.flags,
            ctor: desc.ctor,
            dtor: desc.dtor,
            order,
            objs_per_slab,
            colours,
            colour_step,
            limit,
            batch,
            cpus: (0..self.nr_cpus)
                .map(|_| {
                    Mutex::new(CpuCache {
                        avail: Vec::with_capacity(limit),
                        allocs: 0,
                        frees: 0,
                        transfers_in: 0,
                        transfers_out: 0,
                        high_water: 0,
                    })
                })
                .collect(),
            shared: Mutex::new(CacheShared {
                slabs: Vec::new(),
                free_slots: Vec::new(),
                lists: [ListHead::new(); 3],
                colour_next: 0,
            }),
            shared_locks: AtomicU64::new(0),
            total_allocations: AtomicU64::new(0),
            total_frees: AtomicU64::new(0),
            active_objects: AtomicUsize::new(0),
            peak_usage: AtomicUsize::new(0),
            provider: self.provider.clone(),
            phys: self.phys.clone(),
            platform: self.platform.clone(),
            global: self.global.clone(),
        });
        chain[slot] = Some(cache.clone());
        log::info!(
            "slab: created cache {} (size {}, stride {}, order {}, {} objs/slab)",
            desc.name,
            desc.size,
            stride,
            order,
            objs_per_slab
        );
        Ok(cache)
    }

    /// 销毁缓存；仍有对象在用时返回 Busy
    pub fn cache_destroy(&self, cache: &Arc<SlabCache>) -> MmResult<()> {
        let mut chain = self.chain.lock();
        let slot = cache.id.0 as usize;
        match chain.get(slot) {
            Some(Some(c)) if Arc::ptr_eq(c, cache) => {}
            _ => return Err(MmError::NotFound),
        }
        cache.destroy()?;
        chain[slot] = None;
        log::info!("slab: destroyed cache {}", cache.name);
        Ok(())
    }

    pub fn find_cache(&self, name: &str) -> Option<Arc<SlabCache>> {
        self.chain
            .lock()
            .iter()
            .flatten()
            .find(|c| c.name == name)
            .cloned()
    }

    /// 对象所属的缓存
    pub fn cache_of(&self, addr: PhysAddr) -> Option<Arc<SlabCache>> {
        let id = self.global.owners.read().get(&addr.pfn())?.cache;
        self.chain.lock().get(id.0 as usize)?.clone()
    }

    /// 地址是否落在某个 slab 页上
    pub fn owns(&self, addr: PhysAddr) -> bool {
        self.global.owners.read().contains_key(&addr.pfn())
    }

    pub fn caches(&self) -> Vec<Arc<SlabCache>> {
        self.chain.lock().iter().flatten().cloned().collect()
    }

    pub fn drain_all(&self) {
        for cache in self.caches() {
            cache.drain_cpu_caches();
        }
    }

    /// 收缩所有缓存，返回释放的页数
    pub fn shrink_all(&self) -> usize {
        self.caches().iter().map(|c| c.shrink()).sum()
    }

    /// 空 slab 占用的页数（可由 shrink 回收）
    pub fn empty_slab_pages(&self) -> usize {
        self.caches()
            .iter()
            .map(|c| c.slab_counts().2 * order_pages(c.order))
            .sum()
    }

    pub fn stats(&self) -> SlabStats {
        let g = &self.global;
        let hits = g.cache_hits.load(Ordering::Relaxed);
        let misses = g.cache_misses.load(Ordering::Relaxed);
        SlabStats {
            total_caches: self.chain.lock().iter().flatten().count(),
            total_slabs: g.total_slabs.load(Ordering::Relaxed),
            total_objects: g.total_objects.load(Ordering::Relaxed),
            allocated_objects: g.allocated_objects.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: misses,
            hit_ratio: if hits + misses > 0 {
                hits * 100 / (hits + misses)
            } else {
                0
            },
            slab_pages: g.slab_pages.load(Ordering::Relaxed),
        }
    }
}
