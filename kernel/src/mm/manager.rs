//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 内存管理器上下文
//!
//! `MemoryManager` 持有全部子系统：NUMA 节点（各自的伙伴系统）、slab 与 kmalloc、
//! 交换、回收链表、压缩缓存、COW 表、共享内存段和所有用户地址空间。
//! 内核启动时用 `init_global` 安装唯一实例，之后通过 `global()` 访问；
//! 测试直接构造独立实例。
//!
//! 页回收流程：
//! 1. 从回收链表选出牺牲页，核对页表项仍指向该页帧
//! 2. 先尝试压缩；被拒绝时写入交换区
//! 3. 更新页表项，释放页帧，记录换出时间用于抖动检测
//!
//! 压缩池为腾出空间淘汰的旧页在锁外转存到交换区。

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use serde::Serialize;
use spin::{Once, RwLock};

use super::address_space::{AddressSpace, SpaceId, SpaceInner};
use super::buddy::{BuddyStats, FrameProvider};
use super::compress::{CompressionAlgorithm, CompressionCache, CompressionStats, EvictedPage, PageKey, PoolStats};
use super::cow::{CowStats, CowTracker};
use super::fault::{FaultCode, PagingCounters, PagingStats};
use super::gfp::GfpFlags;
use super::kmalloc::Kmalloc;
use super::numa::{NumaAllocator, NumaPolicy, NumaStats};
use super::page::{order_pages, PhysAddr, Pfn, VirtAddr, Vpn, PAGE_SIZE};
use super::pagemap::Pte;
use super::phys::PhysMem;
use super::reclaim::{ReclaimLists, ReclaimStats, ReplacementPolicy};
use super::setup::MmConfig;
use super::shm::ShmManager;
use super::slab::{ObjectCtor, SlabAllocator, SlabCache, SlabStats};
use super::swap::{BlockDevice, SwapEntry, SwapManager, SwapStats};
use super::zone::ZoneStats;
use crate::config::{KMM_NAME, KMM_VERSION};
use crate::error::{MmError, MmResult};
use crate::platform::Platform;

/// 全部子系统的统计快照
#[derive(Debug, Clone, Serialize)]
pub struct MmStats {
    pub buddy: BuddyStats,
    pub zones: Vec<ZoneStats>,
    pub slab: SlabStats,
    pub numa: NumaStats,
    pub swap: SwapStats,
    pub compression: CompressionStats,
    pub pools: Vec<PoolStats>,
    pub cow: CowStats,
    pub reclaim: ReclaimStats,
    pub paging: PagingStats,
    pub replacement: ReplacementPolicy,
}

/// gc 的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    /// slab 收缩释放的页
    pub slab_pages: usize,
    /// NUMA 每 CPU 缓存归还的页
    pub cached_pages: usize,
    /// 压缩或换出的用户页
    pub reclaimed_pages: usize,
}

pub struct MemoryManager {
    pub(crate) config: MmConfig,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) phys: Arc<PhysMem>,
    pub(crate) numa: Arc<NumaAllocator>,
    pub(crate) slab: Arc<SlabAllocator>,
    pub(crate) kmalloc: Kmalloc,
    pub(crate) swap: SwapManager,
    pub(crate) reclaim: ReclaimLists,
    pub(crate) compress: CompressionCache,
    pub(crate) cow: CowTracker,
    pub(crate) shm: ShmManager,
    pub(crate) spaces: RwLock<BTreeMap<SpaceId, Arc<AddressSpace>>>,
    pub(crate) next_space: AtomicU32,
    pub(crate) paging: PagingCounters,
}

static MM: Once<MemoryManager> = Once::new();

/// 安装全局内存管理器，只能调用一次
pub fn init_global(config: MmConfig, platform: Arc<dyn Platform>) -> MmResult<&'static MemoryManager> {
    if MM.is_completed() {
        return Err(MmError::Exists);
    }
    let mm = MemoryManager::new(config, platform)?;
    let mut installed = false;
    let r = MM.call_once(|| {
        installed = true;
        mm
    });
    if installed {
        Ok(r)
    } else {
        Err(MmError::Exists)
    }
}

/// 全局内存管理器
pub fn global() -> Option<&'static MemoryManager> {
    MM.get()
}

enum Evict {
    Done,
    /// 描述符已过期（页已释放或被 COW 共享）
    Stale,
}

impl MemoryManager {
    pub fn new(config: MmConfig, platform: Arc<dyn Platform>) -> MmResult<Self> {
        config.validate()?;
        let phys = Arc::new(PhysMem::new());
        let nodes = config.build_nodes(&phys)?;
        let numa = Arc::new(NumaAllocator::new(nodes, platform.clone(), config.nr_cpus)?);
        numa.set_policy(config.numa_policy)?;

        let provider: Arc<dyn FrameProvider> = numa.clone();
        let slab = Arc::new(SlabAllocator::new(
            provider.clone(),
            phys.clone(),
            platform.clone(),
            config.nr_cpus,
            config.slab_cpu_limit,
            config.slab_cpu_batch,
        ));
        let kmalloc = Kmalloc::new(slab.clone(), provider, phys.clone())?;

        let compress = CompressionCache::new(platform.clone());
        if config.compression_pool_pages > 0 {
            compress.create_pool("default", config.compression_algorithm, config.compression_pool_pages)?;
        }
        compress.set_enabled(config.compression_enabled);

        let reclaim = ReclaimLists::new(config.replacement, config.thrash_window_us, config.rng_seed);

        log::info!(
            "mm: {} v{}: {} nodes, {} pages, {} cpus, replacement {}, numa {}",
            KMM_NAME,
            KMM_VERSION,
            config.nodes.len(),
            numa.total_pages(),
            config.nr_cpus,
            config.replacement.name(),
            config.numa_policy.name()
        );

        Ok(Self {
            config,
            platform,
            phys,
            numa,
            slab,
            kmalloc,
            swap: SwapManager::new(),
            reclaim,
            compress,
            cow: CowTracker::new(),
            shm: ShmManager::new(),
            spaces: RwLock::new(BTreeMap::new()),
            next_space: AtomicU32::new(1),
            paging: PagingCounters::default(),
        })
    }

    pub fn config(&self) -> &MmConfig {
        &self.config
    }

    pub fn phys(&self) -> &PhysMem {
        &self.phys
    }

    pub fn numa(&self) -> &NumaAllocator {
        &self.numa
    }

    pub fn slab(&self) -> &SlabAllocator {
        &self.slab
    }

    pub fn swap(&self) -> &SwapManager {
        &self.swap
    }

    pub fn reclaim_lists(&self) -> &ReclaimLists {
        &self.reclaim
    }

    pub fn compression(&self) -> &CompressionCache {
        &self.compress
    }

    pub fn cow(&self) -> &CowTracker {
        &self.cow
    }

    pub fn shm_manager(&self) -> &ShmManager {
        &self.shm
    }

    pub(crate) fn space(&self, id: SpaceId) -> MmResult<Arc<AddressSpace>> {
        self.spaces.read().get(&id).cloned().ok_or(MmError::NotFound)
    }

    pub fn address_space(&self, id: SpaceId) -> Option<Arc<AddressSpace>> {
        self.spaces.read().get(&id).cloned()
    }

    pub fn space_ids(&self) -> Vec<SpaceId> {
        self.spaces.read().keys().copied().collect()
    }

    // ========== 页与对象分配 ==========

    pub(crate) fn alloc_user_frame(&self, zero: bool) -> MmResult<Pfn> {
        let mut gfp = GfpFlags::USER;
        if zero {
            gfp |= GfpFlags::ZERO;
        }
        self.numa.alloc(0, gfp, self.numa.policy(), None)
    }

    pub(crate) fn free_frame(&self, pfn: Pfn) {
        if let Err(e) = self.numa.free(pfn, 0) {
            log::error!("mm: freeing pfn {:#x} failed: {:?}", pfn, e);
        }
    }

    pub(crate) fn free_frames(&self, frames: Vec<Pfn>) {
        for pfn in frames {
            self.free_frame(pfn);
        }
    }

    /// 按当前 NUMA 策略分配 2^order 页；可睡眠的请求失败时先回收再重试一次
    pub fn alloc_pages(&self, order: usize, gfp: GfpFlags) -> MmResult<Pfn> {
        match self.numa.alloc(order, gfp, self.numa.policy(), None) {
            Err(MmError::OutOfMemory) if !gfp.intersects(GfpFlags::ATOMIC | GfpFlags::NOWAIT) => {
                let want = order_pages(order).max(self.config.gentle_reclaim);
                if self.reclaim_pages(want) == 0 {
                    return Err(MmError::OutOfMemory);
                }
                self.numa.alloc(order, gfp, self.numa.policy(), None)
            }
            r => r,
        }
    }

    pub fn free_pages(&self, pfn: Pfn, order: usize) -> MmResult<()> {
        self.numa.free(pfn, order)
    }

    /// 单页分配，走当前 CPU 的 NUMA 页缓存
    pub fn alloc_page(&self, gfp: GfpFlags) -> MmResult<Pfn> {
        self.numa.alloc_cached(gfp)
    }

    pub fn free_page(&self, pfn: Pfn) -> MmResult<()> {
        self.numa.free_cached(pfn)
    }

    pub fn kmalloc(&self, size: usize, gfp: GfpFlags) -> MmResult<PhysAddr> {
        self.kmalloc.kmalloc(size, gfp)
    }

    pub fn kzalloc(&self, size: usize, gfp: GfpFlags) -> MmResult<PhysAddr> {
        self.kmalloc.kzalloc(size, gfp)
    }

    pub fn kfree(&self, addr: PhysAddr) -> MmResult<()> {
        self.kmalloc.kfree(addr)
    }

    pub fn ksize(&self, addr: PhysAddr) -> MmResult<usize> {
        self.kmalloc.ksize(addr)
    }

    pub fn cache_create(
        &self,
        name: &str,
        size: usize,
        align: usize,
        ctor: Option<ObjectCtor>,
    ) -> MmResult<Arc<SlabCache>> {
        self.slab.cache_create(name, size, align, ctor)
    }

    pub fn cache_destroy(&self, cache: &Arc<SlabCache>) -> MmResult<()> {
        self.slab.cache_destroy(cache)
    }

    pub fn find_cache(&self, name: &str) -> Option<Arc<SlabCache>> {
        self.slab.find_cache(name)
    }

    // ========== 回收 ==========

    fn swap_out(&self, page: &[u8; PAGE_SIZE]) -> MmResult<SwapEntry> {
        let entry = self.swap.alloc_slot()?;
        if let Err(e) = self.swap.write_page(entry, page) {
            if let Err(e2) = self.swap.free_slot(entry) {
                log::warn!("swap: releasing slot {:#x} after failed write: {:?}", entry.raw(), e2);
            }
            return Err(e);
        }
        Ok(entry)
    }

    fn note_zone_reclaim(&self, pfn: Pfn) {
        let zone = self
            .numa
            .pfn_node(pfn)
            .and_then(|n| self.numa.node(n))
            .and_then(|n| n.buddy().zone_of(pfn));
        if let Some(zone) = zone {
            zone.note_reclaim(1);
        }
    }

    fn reclaim_one(&self) -> MmResult<Option<Evict>> {
        let Some(victim) = self.reclaim.select_victim() else {
            return Ok(None);
        };
        let Some(space) = self.spaces.read().get(&victim.space).cloned() else {
            return Ok(Some(Evict::Stale));
        };
        let vpn = victim.vaddr.vpn();
        let key = PageKey::new(victim.space, vpn);

        // 换出期间页保持映射但只读；写入或 mprotect/fork/munmap 都会改掉这个表项
        let mut inner = space.lock();
        let perm = match inner.pt.lookup(vpn) {
            Some(Pte::Present {
                pfn,
                perm,
                cow: false,
                shm: false,
            }) if pfn == victim.pfn => perm,
            _ => return Ok(Some(Evict::Stale)),
        };
        let parked = Pte::Present {
            pfn: victim.pfn,
            perm: perm.read_only(),
            cow: false,
            shm: false,
        };
        inner.pt.protect(vpn, perm.read_only());
        let mut page = Box::new([0u8; PAGE_SIZE]);
        self.phys.read_frame(victim.pfn, &mut page);
        drop(inner);

        let (pte, spill) = match self.stash(key, &page) {
            Ok(r) => r,
            Err(e) => {
                let mut inner = space.lock();
                if inner.pt.lookup(vpn) == Some(parked) {
                    inner.pt.protect(vpn, perm);
                }
                drop(inner);
                self.reclaim.restore(victim);
                return Err(e);
            }
        };

        let mut inner = space.lock();
        let current = inner.pt.lookup(vpn);
        if current != Some(parked) {
            drop(inner);
            self.discard_stash(key, pte);
            if matches!(current, Some(Pte::Present { pfn, cow: false, shm: false, .. }) if pfn == victim.pfn) {
                self.reclaim.restore(victim);
            }
            log::debug!("reclaim: space {} vpn {:#x} changed during write-out", victim.space, vpn);
            for page in spill {
                self.spill(page);
            }
            return Ok(Some(Evict::Stale));
        }
        inner.pt.map(vpn, pte);
        space.sub_rss(1);
        drop(inner);

        match pte {
            Pte::Swapped(_) => PagingCounters::inc(&self.paging.swap_outs),
            _ => PagingCounters::inc(&self.paging.compressed_outs),
        }
        let now = self.platform.now_us();
        self.reclaim.note_evicted(victim.space, vpn, now);
        self.note_zone_reclaim(victim.pfn);
        self.free_frame(victim.pfn);
        PagingCounters::inc(&self.paging.pages_reclaimed);
        #[cfg(feature = "debug_log")]
        log::trace!("reclaim: space {} vpn {:#x} pfn {:#x} -> {:?}", victim.space, vpn, victim.pfn, pte);

        for page in spill {
            self.spill(page);
        }
        Ok(Some(Evict::Done))
    }

    /// 把页内容存进压缩池，被拒绝时写到交换区；调用时不持有地址空间锁
    fn stash(&self, key: PageKey, page: &[u8; PAGE_SIZE]) -> MmResult<(Pte, Vec<EvictedPage>)> {
        match self.compress.try_compress(key, page) {
            Ok((pool, outcome)) => Ok((Pte::Compressed(pool), outcome.evicted)),
            Err(reason) => {
                log::debug!("reclaim: vpn {:#x} not compressed ({:?}), swapping", key.vpn(), reason);
                let entry = self.swap_out(page)?;
                Ok((Pte::Swapped(entry), Vec::new()))
            }
        }
    }

    /// 丢弃一份没能提交到页表的副本
    fn discard_stash(&self, key: PageKey, pte: Pte) {
        match pte {
            Pte::Compressed(pool) => {
                self.compress.invalidate(pool, key);
            }
            Pte::Swapped(entry) => self.release_slot(entry),
            Pte::Present { .. } => {}
        }
    }

    fn release_slot(&self, entry: SwapEntry) {
        if let Err(e) = self.swap.free_slot(entry) {
            log::warn!("swap: releasing slot {:#x}: {:?}", entry.raw(), e);
        }
    }

    /// 压缩池淘汰的页转存到交换区，交换区不可用时重新装回内存
    fn spill(&self, page: EvictedPage) {
        let (space_id, vpn) = (page.key.space(), page.key.vpn());
        let Some(space) = self.spaces.read().get(&space_id).cloned() else {
            return;
        };
        let still_compressed = |inner: &SpaceInner| matches!(inner.pt.lookup(vpn), Some(Pte::Compressed(_)));
        if !still_compressed(&*space.lock()) {
            return;
        }
        // 写盘不持锁，回来后再确认表项
        let written = self.swap_out(&page.data);
        let mut guard = space.lock();
        let inner = &mut *guard;
        if !still_compressed(inner) {
            drop(guard);
            if let Ok(entry) = written {
                self.release_slot(entry);
            }
            return;
        }
        match written {
            Ok(entry) => {
                inner.pt.map(vpn, Pte::Swapped(entry));
                PagingCounters::inc(&self.paging.swap_outs);
            }
            Err(e) => {
                let vaddr = VirtAddr::from_vpn(vpn);
                let perm = inner.vmas.find(vaddr).map(|v| v.flags().to_page_perm());
                match (perm, self.alloc_user_frame(false)) {
                    (Some(perm), Ok(pfn)) => {
                        self.phys.write_frame(pfn, &page.data);
                        inner.pt.map(
                            vpn,
                            Pte::Present {
                                pfn,
                                perm,
                                cow: false,
                                shm: false,
                            },
                        );
                        space.add_rss(1);
                        self.reclaim.track(pfn, space_id, vaddr, true, self.platform.now_us());
                        log::debug!("reclaim: spill of vpn {:#x} failed ({:?}), page made resident", vpn, e);
                    }
                    (_, frame) => {
                        if let Ok(pfn) = frame {
                            self.free_frame(pfn);
                        }
                        inner.pt.unmap(vpn);
                        log::error!("reclaim: space {} vpn {:#x} lost: {:?}", space_id, vpn, e);
                    }
                }
            }
        }
    }

    /// 回收最多 `target` 页，返回实际回收数
    pub fn reclaim_pages(&self, target: usize) -> usize {
        if target == 0 {
            return 0;
        }
        let inactive = self.reclaim.inactive_count();
        if inactive < target {
            self.reclaim.deactivate(target - inactive);
        }
        let mut done = 0;
        let mut failures = 0;
        let mut attempts = self.reclaim.tracked() + target;
        while done < target && attempts > 0 {
            attempts -= 1;
            match self.reclaim_one() {
                Ok(Some(Evict::Done)) => done += 1,
                Ok(Some(Evict::Stale)) => {}
                Ok(None) => break,
                Err(e) => {
                    failures += 1;
                    if failures == 1 {
                        log::warn!("reclaim: eviction failed: {:?}", e);
                    }
                    if matches!(e, MmError::NoSwapSpace) && !self.compress.is_enabled() {
                        break;
                    }
                }
            }
        }
        if done > 0 {
            log::debug!("reclaim: {} of {} pages reclaimed", done, target);
        }
        done
    }

    /// 根据空闲比例决定回收力度，返回回收的页数
    pub fn check_memory_pressure(&self) -> usize {
        let total = self.numa.total_pages();
        if total == 0 {
            return 0;
        }
        let free_pct = self.numa.nr_free_pages() * 100 / total;
        if free_pct <= self.config.high_threshold {
            log::warn!("mm: free memory at {}%, aggressive reclaim", free_pct);
            self.reclaim_pages(self.config.aggressive_reclaim)
        } else if free_pct <= self.config.low_threshold {
            self.reclaim_pages(self.config.gentle_reclaim)
        } else {
            0
        }
    }

    /// 清理：刷新并收缩 slab、归还 NUMA 页缓存、回收全部非活跃页
    pub fn gc(&self) -> GcReport {
        self.slab.drain_all();
        let slab_pages = self.slab.shrink_all();
        let cached_pages = self.numa.drain_caches();
        let reclaimed_pages = self.reclaim_pages(self.reclaim.inactive_count());
        let report = GcReport {
            slab_pages,
            cached_pages,
            reclaimed_pages,
        };
        log::debug!("mm: gc {:?}", report);
        report
    }

    /// 把一个驻留的私有页迁移到指定节点，返回新页帧
    pub fn migrate_page(&self, space: SpaceId, addr: VirtAddr, node: usize) -> MmResult<Pfn> {
        let as_ = self.space(space)?;
        let vpn = addr.vpn();
        let mut inner = as_.lock();
        let (pfn, perm) = match inner.pt.lookup(vpn) {
            Some(Pte::Present {
                pfn,
                perm,
                cow: false,
                shm: false,
            }) => (pfn, perm),
            Some(Pte::Present { .. }) => return Err(MmError::Busy),
            _ => return Err(MmError::NotFound),
        };
        let from = self.numa.pfn_node(pfn).ok_or(MmError::Corrupted)?;
        if from == node {
            return Ok(pfn);
        }
        let new = self.numa.alloc_on_node(node, 0, GfpFlags::USER)?;
        self.phys.copy_frame(pfn, new);
        inner.pt.map(
            vpn,
            Pte::Present {
                pfn: new,
                perm,
                cow: false,
                shm: false,
            },
        );
        let dirty = self.reclaim.untrack(pfn).map_or(true, |d| d.dirty);
        self.reclaim
            .track(new, space, VirtAddr::from_vpn(vpn), dirty, self.platform.now_us());
        drop(inner);

        self.free_frame(pfn);
        self.numa.note_migration(from, node);
        PagingCounters::inc(&self.paging.migrations);
        log::debug!("numa: migrated space {} vpn {:#x} node{} -> node{}", space, vpn, from, node);
        Ok(new)
    }

    // ========== 交换区管理 ==========

    pub fn swapon(&self, path: &str, priority: i32, device: Arc<dyn BlockDevice>) -> MmResult<usize> {
        self.swap.swapon(path, priority, device)
    }

    /// 停用交换文件：先把存放在上面的页全部调回内存
    pub fn swapoff(&self, path: &str) -> MmResult<()> {
        let idx = self.swap.begin_swapoff(path)?;
        let targets: Vec<(Arc<AddressSpace>, Vpn)> = {
            let spaces = self.spaces.read();
            spaces
                .values()
                .flat_map(|s| {
                    let inner = s.lock();
                    let found: Vec<(Arc<AddressSpace>, Vpn)> = inner
                        .vmas
                        .iter()
                        .flat_map(|v| inner.pt.entries(v.start().vpn(), v.end().vpn()))
                        .filter(|(_, pte)| matches!(pte, Pte::Swapped(e) if e.file() == idx))
                        .map(|(vpn, _)| (s.clone(), vpn))
                        .collect();
                    found
                })
                .collect()
        };
        log::info!("swap: swapoff {}: {} pages to bring back", path, targets.len());
        for (space, vpn) in targets {
            if let Err(e) = self.fault_in(&space, VirtAddr::from_vpn(vpn), FaultCode::USER, false) {
                self.swap.abort_swapoff(idx);
                log::warn!("swap: swapoff {} aborted: {:?}", path, e);
                return Err(e);
            }
        }
        self.swap.finish_swapoff(idx)
    }

    // ========== 管理接口 ==========

    pub fn set_replacement_policy(&self, policy: ReplacementPolicy) {
        self.reclaim.set_policy(policy);
        log::info!("paging: replacement policy {}", policy.name());
    }

    pub fn replacement_policy(&self) -> ReplacementPolicy {
        self.reclaim.policy()
    }

    pub fn set_numa_policy(&self, policy: NumaPolicy) -> MmResult<()> {
        self.numa.set_policy(policy)?;
        log::info!("numa: policy {}", policy.name());
        Ok(())
    }

    pub fn numa_policy(&self) -> NumaPolicy {
        self.numa.policy()
    }

    pub fn enable_compression(&self, enabled: bool) {
        self.compress.set_enabled(enabled);
    }

    pub fn set_compression_algorithm(&self, algorithm: CompressionAlgorithm) -> MmResult<()> {
        self.compress.set_algorithm(algorithm)
    }

    pub fn create_compression_pool(&self, name: &str, algorithm: CompressionAlgorithm, max_pages: usize) -> MmResult<usize> {
        self.compress.create_pool(name, algorithm, max_pages)
    }

    pub fn destroy_compression_pool(&self, id: usize) -> MmResult<()> {
        self.compress.destroy_pool(id)
    }

    pub fn paging_stats(&self) -> PagingStats {
        self.paging.snapshot()
    }

    pub fn stats(&self) -> MmStats {
        let zones = self
            .numa
            .nodes()
            .iter()
            .flat_map(|n| n.buddy().zone_stats())
            .collect();
        MmStats {
            buddy: self.numa.buddy_stats(),
            zones,
            slab: self.slab.stats(),
            numa: self.numa.stats(),
            swap: self.swap.stats(),
            compression: self.compress.stats(),
            pools: self.compress.pool_stats(),
            cow: self.cow.stats(),
            reclaim: self.reclaim.stats(),
            paging: self.paging.snapshot(),
            replacement: self.reclaim.policy(),
        }
    }

    /// 一致性检查：空闲计数、slab 链表、压缩池、COW 表
    pub fn check_consistency(&self) -> MmResult<()> {
        for node in self.numa.nodes() {
            if !node.buddy().zones().iter().all(|z| z.check_free_invariant()) {
                log::error!("mm: node{} free counters inconsistent", node.id());
                return Err(MmError::Corrupted);
            }
        }
        if !self.slab.caches().iter().all(|c| c.check_lists()) {
            return Err(MmError::Corrupted);
        }
        if !self.compress.pools().iter().all(|p| p.check_invariant()) {
            return Err(MmError::Corrupted);
        }
        self.cow.validate()
    }
}
