//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! Buddy System (伙伴系统) 页分配器
//!
//! 对应 Linux 的 page allocation (mm/page_alloc.c)
//!
//! 算法原理：
//! - 内存按 2^order 页划分为块，order 范围 0..=MAX_ORDER
//! - 分配时从满足要求的最小 order 取块，逐级对半分裂
//! - 释放时与伙伴 (`idx ^ (1 << order)`) 合并，保留低地址作为新块基址
//!
//! 一个 `BuddyAllocator` 管理一个 NUMA 节点上的全部 zone。
//! 分配按 GFP 的区域偏好顺序进行：首选 zone 水位不足时依次回退到其他 zone
//! （NOWAIT 除外），回退成功计一次 zone_fallback。
//! 分配失败直接返回错误，不会在内部等待或回收。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use serde::Serialize;

use super::gfp::GfpFlags;
use super::page::{order_pages, Pfn, MAX_ORDER};
use super::phys::PhysMem;
use super::zone::{FrameInfo, Zone, ZoneAllocError, ZoneStats, ZoneType};
use crate::error::{MmError, MmResult};

/// 页帧来源
///
/// 伙伴系统和 NUMA 层都实现这个接口，slab 只依赖它。
pub trait FrameProvider: Send + Sync {
    /// 分配 2^order 个连续页帧，`node_hint` 为偏好的 NUMA 节点
    fn alloc_frames(&self, order: usize, gfp: GfpFlags, node_hint: Option<usize>) -> MmResult<Pfn>;

    /// 释放页帧
    fn free_frames(&self, pfn: Pfn, order: usize) -> MmResult<()>;

    /// 页帧所属节点
    fn node_of(&self, _pfn: Pfn) -> Option<usize> {
        Some(0)
    }
}

#[derive(Default)]
struct BuddyCounters {
    total_allocations: AtomicU64,
    total_frees: AtomicU64,
    allocation_failures: AtomicU64,
    coalescing_operations: AtomicU64,
    fragmentation_events: AtomicU64,
    zone_fallbacks: AtomicU64,
}

/// 伙伴系统统计
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BuddyStats {
    pub total_allocations: u64,
    pub total_frees: u64,
    pub allocation_failures: u64,
    pub coalescing_operations: u64,
    pub fragmentation_events: u64,
    pub zone_fallbacks: u64,
    pub total_pages: usize,
    pub free_pages: usize,
}

impl BuddyStats {
    pub fn merge(&mut self, other: &BuddyStats) {
        self.total_allocations += other.total_allocations;
        self.total_frees += other.total_frees;
        self.allocation_failures += other.allocation_failures;
        self.coalescing_operations += other.coalescing_operations;
        self.fragmentation_events += other.fragmentation_events;
        self.zone_fallbacks += other.zone_fallbacks;
        self.total_pages += other.total_pages;
        self.free_pages += other.free_pages;
    }
}

/// Buddy System 分配器
pub struct BuddyAllocator {
    node: usize,
    /// 按起始 PFN 排序
    zones: Vec<Zone>,
    phys: Arc<PhysMem>,
    counters: BuddyCounters,
}

impl BuddyAllocator {
    pub fn new(node: usize, mut zones: Vec<Zone>, phys: Arc<PhysMem>) -> MmResult<Self> {
        zones.sort_by_key(|z| z.start_pfn());
        for pair in zones.windows(2) {
            if pair[0].end_pfn() > pair[1].start_pfn() {
                return Err(MmError::InvalidArgument);
            }
        }
        Ok(Self {
            node,
            zones,
            phys,
            counters: BuddyCounters::default(),
        })
    }

    #[inline]
    pub fn node(&self) -> usize {
        self.node
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn zone(&self, zone_type: ZoneType) -> Option<&Zone> {
        self.zones.iter().find(|z| z.zone_type() == zone_type)
    }

    /// 包含 pfn 的 zone
    pub fn zone_of(&self, pfn: Pfn) -> Option<&Zone> {
        self.zones.iter().find(|z| z.contains(pfn))
    }

    #[inline]
    pub fn contains(&self, pfn: Pfn) -> bool {
        self.zone_of(pfn).is_some()
    }

    pub fn total_pages(&self) -> usize {
        self.zones.iter().map(|z| z.total_pages()).sum()
    }

    pub fn nr_free_pages(&self) -> usize {
        self.zones.iter().map(|z| z.free_pages()).sum()
    }

    /// 分配 2^order 个连续页
    pub fn alloc_pages(&self, order: usize, gfp: GfpFlags) -> MmResult<Pfn> {
        if order > MAX_ORDER {
            return Err(MmError::InvalidArgument);
        }
        let tier = gfp.watermark_tier();
        let mut preferred = true;
        let mut fragmented = false;

        for zt in gfp.zonelist() {
            let Some(zone) = self.zone(*zt) else {
                continue;
            };
            if !preferred && !gfp.allows_fallback() {
                break;
            }
            match zone.alloc(order, tier) {
                Ok(pfn) => {
                    if !preferred {
                        self.counters.zone_fallbacks.fetch_add(1, Ordering::Relaxed);
                        log::debug!(
                            "buddy: node{} order {} fell back to zone {}",
                            self.node,
                            order,
                            zt.name()
                        );
                    }
                    self.counters.total_allocations.fetch_add(1, Ordering::Relaxed);
                    if gfp.contains(GfpFlags::ZERO) {
                        self.phys.zero_frames(pfn, order_pages(order));
                    }
                    return Ok(pfn);
                }
                Err(ZoneAllocError::Fragmented) => fragmented = true,
                Err(_) => {}
            }
            preferred = false;
        }

        self.counters.allocation_failures.fetch_add(1, Ordering::Relaxed);
        if fragmented {
            self.counters.fragmentation_events.fetch_add(1, Ordering::Relaxed);
        }
        log::warn!("buddy: node{} order {} allocation failed ({:?})", self.node, order, gfp);
        Err(MmError::OutOfMemory)
    }

    /// 释放 2^order 个连续页
    pub fn free_pages(&self, pfn: Pfn, order: usize) -> MmResult<()> {
        let zone = self.zone_of(pfn).ok_or(MmError::InvalidArgument)?;
        let merges = zone.free(pfn, order)?;
        self.phys.discard(pfn, order_pages(order));
        self.counters.total_frees.fetch_add(1, Ordering::Relaxed);
        self.counters
            .coalescing_operations
            .fetch_add(merges as u64, Ordering::Relaxed);
        Ok(())
    }

    #[inline]
    pub fn get_free_page(&self, gfp: GfpFlags) -> MmResult<Pfn> {
        self.alloc_pages(0, gfp)
    }

    #[inline]
    pub fn get_free_pages(&self, gfp: GfpFlags, order: usize) -> MmResult<Pfn> {
        self.alloc_pages(order, gfp)
    }

    #[inline]
    pub fn free_page(&self, pfn: Pfn) -> MmResult<()> {
        self.free_pages(pfn, 0)
    }

    pub fn frame_info(&self, pfn: Pfn) -> Option<FrameInfo> {
        self.zone_of(pfn)?.frame_info(pfn)
    }

    pub fn stats(&self) -> BuddyStats {
        let c = &self.counters;
        BuddyStats {
            total_allocations: c.total_allocations.load(Ordering::Relaxed),
            total_frees: c.total_frees.load(Ordering::Relaxed),
            allocation_failures: c.allocation_failures.load(Ordering::Relaxed),
            coalescing_operations: c.coalescing_operations.load(Ordering::Relaxed),
            fragmentation_events: c.fragmentation_events.load(Ordering::Relaxed),
            zone_fallbacks: c.zone_fallbacks.load(Ordering::Relaxed),
            total_pages: self.total_pages(),
            free_pages: self.nr_free_pages(),
        }
    }

    pub fn zone_stats(&self) -> Vec<ZoneStats> {
        self.zones.iter().map(|z| z.stats()).collect()
    }
}

impl FrameProvider for BuddyAllocator {
    fn alloc_frames(&self, order: usize, gfp: GfpFlags, _node_hint: Option<usize>) -> MmResult<Pfn> {
        self.alloc_pages(order, gfp)
    }

    fn free_frames(&self, pfn: Pfn, order: usize) -> MmResult<()> {
        self.free_pages(pfn, order)
    }

    fn node_of(&self, pfn: Pfn) -> Option<usize> {
        self.contains(pfn).then_some(self.node)
    }
}
