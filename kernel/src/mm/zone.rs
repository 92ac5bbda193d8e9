//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 内存区域 (Zone) 与页帧描述符
//!
//! 对应 Linux 的 struct zone / struct page / struct free_area
//!
//! # 设计
//! - 每个 zone 覆盖一段连续的 PFN，拥有独立的自旋锁
//! - 页帧描述符存放在 zone 内的稠密数组中，按 zone 内偏移索引
//! - free_area[order] 是该 order 空闲块的链表，只有块首页帧挂在链表上
//! - 伙伴关系按 zone 内偏移计算：`buddy = idx ^ (1 << order)`，
//!   不会跨 zone 合并
//!
//! 不变式：`free_pages == Σ nr_free[order] * 2^order`

use alloc::vec::Vec;
use serde::Serialize;
use spin::Mutex;

use super::list::{Linked, Links, ListHead};
use super::page::{order_pages, Pfn, MAX_ORDER};
use crate::error::{MmError, MmResult};

/// 区域类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ZoneType {
    Dma,
    Normal,
    HighMem,
    Movable,
}

impl ZoneType {
    pub fn name(&self) -> &'static str {
        match self {
            ZoneType::Dma => "DMA",
            ZoneType::Normal => "Normal",
            ZoneType::HighMem => "HighMem",
            ZoneType::Movable => "Movable",
        }
    }
}

/// 水位档位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkTier {
    Min,
    Low,
    High,
}

/// 区域水位（页数）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Watermarks {
    pub min: usize,
    pub low: usize,
    pub high: usize,
}

impl Watermarks {
    /// 按区域大小计算默认水位：5% / 10% / 15%
    pub fn for_total(total: usize) -> Self {
        Self {
            min: total / 20,
            low: total / 10,
            high: total * 3 / 20,
        }
    }

    pub const fn zero() -> Self {
        Self {
            min: 0,
            low: 0,
            high: 0,
        }
    }

    #[inline]
    pub fn get(&self, tier: WatermarkTier) -> usize {
        match tier {
            WatermarkTier::Min => self.min,
            WatermarkTier::Low => self.low,
            WatermarkTier::High => self.high,
        }
    }
}

/// 页帧标志
const PG_FREE: u8 = 0x01;
/// 已分配块的首页帧
const PG_HEAD: u8 = 0x02;

/// 页帧描述符
///
/// `order` 只在页帧是块首时有意义：
/// 空闲时是所在空闲块的 order，已分配时记录原始分配 order，
/// 释放时据此合并。
#[derive(Debug, Clone, Copy, Default)]
pub struct PageFrame {
    flags: u8,
    order: u8,
    refcount: u32,
    links: Links,
}

impl Linked for PageFrame {
    #[inline]
    fn links(&self) -> &Links {
        &self.links
    }

    #[inline]
    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }
}

impl PageFrame {
    #[inline]
    fn is_free_head(&self) -> bool {
        self.flags & PG_FREE != 0
    }

    #[inline]
    fn is_alloc_head(&self) -> bool {
        self.flags & PG_HEAD != 0
    }
}

/// 页帧查询结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub pfn: Pfn,
    pub zone: ZoneType,
    /// 是否为空闲块首
    pub free: bool,
    /// 是否为已分配块首
    pub allocated: bool,
    pub order: usize,
    pub refcount: u32,
}

/// 区域分配失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneAllocError {
    /// 低于水位
    Watermark,
    /// 总空闲页足够但没有足够大的连续块
    Fragmented,
    /// 空闲页不足
    Exhausted,
}

#[derive(Debug, Clone, Copy, Default)]
struct ZoneCounters {
    allocations: u64,
    failures: u64,
    reclaim_attempts: u64,
    reclaimed_pages: u64,
}

/// 区域统计快照
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ZoneStats {
    pub zone_type: Option<ZoneType>,
    pub node: usize,
    pub start_pfn: Pfn,
    pub end_pfn: Pfn,
    pub total_pages: usize,
    pub free_pages: usize,
    pub watermarks: Watermarks,
    pub nr_free: [usize; MAX_ORDER + 1],
    pub allocations: u64,
    pub failures: u64,
    pub reclaim_attempts: u64,
    pub reclaimed_pages: u64,
}

struct ZoneInner {
    frames: Vec<PageFrame>,
    free_area: [ListHead; MAX_ORDER + 1],
    free_pages: usize,
    watermarks: Watermarks,
    counters: ZoneCounters,
}

/// 内存区域
pub struct Zone {
    zone_type: ZoneType,
    node: usize,
    start_pfn: Pfn,
    end_pfn: Pfn,
    inner: Mutex<ZoneInner>,
}

impl Zone {
    /// 创建区域，整个 PFN 范围初始为空闲
    ///
    /// 范围被切成尽可能大的对齐块放入 free_area。
    /// `watermarks` 为 None 时按区域大小计算默认值。
    pub fn new(
        zone_type: ZoneType,
        node: usize,
        start_pfn: Pfn,
        end_pfn: Pfn,
        watermarks: Option<Watermarks>,
    ) -> MmResult<Self> {
        if end_pfn <= start_pfn || end_pfn - start_pfn > u32::MAX as usize {
            return Err(MmError::InvalidArgument);
        }
        let span = end_pfn - start_pfn;
        let mut inner = ZoneInner {
            frames: alloc::vec![PageFrame::default(); span],
            free_area: [ListHead::new(); MAX_ORDER + 1],
            free_pages: 0,
            watermarks: watermarks.unwrap_or_else(|| Watermarks::for_total(span)),
            counters: ZoneCounters::default(),
        };

        let mut idx = 0usize;
        while idx < span {
            let mut order = MAX_ORDER;
            while order > 0 && (idx % order_pages(order) != 0 || idx + order_pages(order) > span) {
                order -= 1;
            }
            inner.push_free(idx as u32, order);
            idx += order_pages(order);
        }

        log::debug!(
            "zone: node{} {} pfn {:#x}-{:#x} ({} pages)",
            node,
            zone_type.name(),
            start_pfn,
            end_pfn,
            span
        );

        Ok(Self {
            zone_type,
            node,
            start_pfn,
            end_pfn,
            inner: Mutex::new(inner),
        })
    }

    #[inline]
    pub fn zone_type(&self) -> ZoneType {
        self.zone_type
    }

    #[inline]
    pub fn node(&self) -> usize {
        self.node
    }

    #[inline]
    pub fn start_pfn(&self) -> Pfn {
        self.start_pfn
    }

    #[inline]
    pub fn end_pfn(&self) -> Pfn {
        self.end_pfn
    }

    #[inline]
    pub fn contains(&self, pfn: Pfn) -> bool {
        pfn >= self.start_pfn && pfn < self.end_pfn
    }

    #[inline]
    pub fn total_pages(&self) -> usize {
        self.end_pfn - self.start_pfn
    }

    pub fn free_pages(&self) -> usize {
        self.inner.lock().free_pages
    }

    pub fn watermarks(&self) -> Watermarks {
        self.inner.lock().watermarks
    }

    pub fn set_watermarks(&self, wm: Watermarks) {
        self.inner.lock().watermarks = wm;
    }

    /// 指定 order 的空闲块数
    pub fn nr_free(&self, order: usize) -> usize {
        self.inner.lock().free_area[order].len()
    }

    /// 各 order 的空闲块数
    pub fn free_area_snapshot(&self) -> [usize; MAX_ORDER + 1] {
        let inner = self.inner.lock();
        let mut out = [0; MAX_ORDER + 1];
        for (o, area) in inner.free_area.iter().enumerate() {
            out[o] = area.len();
        }
        out
    }

    /// 从本区域分配 2^order 个连续页
    pub fn alloc(&self, order: usize, tier: WatermarkTier) -> Result<Pfn, ZoneAllocError> {
        let mut inner = self.inner.lock();
        let want = order_pages(order);

        if inner.free_pages < want {
            inner.counters.failures += 1;
            return Err(ZoneAllocError::Exhausted);
        }
        if inner.free_pages - want < inner.watermarks.get(tier) {
            inner.counters.failures += 1;
            return Err(ZoneAllocError::Watermark);
        }

        let Some(mut cur) = (order..=MAX_ORDER).find(|&o| !inner.free_area[o].is_empty()) else {
            inner.counters.failures += 1;
            return Err(ZoneAllocError::Fragmented);
        };

        let ZoneInner {
            frames, free_area, ..
        } = &mut *inner;
        let idx = match free_area[cur].pop_front(frames.as_mut_slice()) {
            Some(idx) => idx,
            None => return Err(ZoneAllocError::Fragmented),
        };
        frames[idx as usize].flags = 0;

        // 分裂：保留低半部分，高半部分放回 order-1 的空闲链表
        while cur > order {
            cur -= 1;
            let upper = idx + order_pages(cur) as u32;
            let f = &mut frames[upper as usize];
            f.flags = PG_FREE;
            f.order = cur as u8;
            free_area[cur].push_front(frames.as_mut_slice(), upper);
            #[cfg(feature = "debug_log")]
            log::trace!("zone: split pfn {:#x} -> order {}", self.start_pfn + upper as usize, cur);
        }

        let head = &mut frames[idx as usize];
        head.flags = PG_HEAD;
        head.order = order as u8;
        head.refcount = 1;

        inner.free_pages -= want;
        inner.counters.allocations += 1;
        Ok(self.start_pfn + idx as usize)
    }

    /// 释放块并与伙伴合并，返回合并次数
    pub fn free(&self, pfn: Pfn, order: usize) -> MmResult<u32> {
        if !self.contains(pfn) || order > MAX_ORDER {
            return Err(MmError::InvalidArgument);
        }
        let span = self.total_pages();
        let mut idx = pfn - self.start_pfn;
        if idx % order_pages(order) != 0 || idx + order_pages(order) > span {
            return Err(MmError::InvalidArgument);
        }

        let mut inner = self.inner.lock();
        {
            let f = &inner.frames[idx];
            if !f.is_alloc_head() || f.order as usize != order {
                log::warn!(
                    "zone: bad free pfn {:#x} order {} (flags {:#x} order {})",
                    pfn,
                    order,
                    f.flags,
                    f.order
                );
                return Err(MmError::InvalidArgument);
            }
        }
        inner.frames[idx].flags = 0;
        inner.frames[idx].refcount = 0;

        let mut cur = order;
        let mut merges = 0;
        {
            let ZoneInner {
                frames, free_area, ..
            } = &mut *inner;
            while cur < MAX_ORDER {
                let buddy = idx ^ order_pages(cur);
                if buddy + order_pages(cur) > span {
                    break;
                }
                let b = &frames[buddy];
                if !b.is_free_head() || b.order as usize != cur {
                    break;
                }
                free_area[cur].remove(frames.as_mut_slice(), buddy as u32);
                frames[buddy].flags = 0;
                idx = idx.min(buddy);
                cur += 1;
                merges += 1;
            }
        }

        inner.push_free(idx as u32, cur);
        inner.free_pages -= order_pages(cur);
        inner.free_pages += order_pages(order);
        if merges > 0 {
            log::debug!(
                "zone: coalesced pfn {:#x} order {} -> order {}",
                pfn,
                order,
                cur
            );
        }
        Ok(merges)
    }

    /// 页帧信息
    pub fn frame_info(&self, pfn: Pfn) -> Option<FrameInfo> {
        if !self.contains(pfn) {
            return None;
        }
        let inner = self.inner.lock();
        let f = &inner.frames[pfn - self.start_pfn];
        Some(FrameInfo {
            pfn,
            zone: self.zone_type,
            free: f.is_free_head(),
            allocated: f.is_alloc_head(),
            order: f.order as usize,
            refcount: f.refcount,
        })
    }

    /// 记录一次回收
    pub fn note_reclaim(&self, pages: usize) {
        let mut inner = self.inner.lock();
        inner.counters.reclaim_attempts += 1;
        inner.counters.reclaimed_pages += pages as u64;
    }

    /// 校验 free_pages 与空闲链表一致
    pub fn check_free_invariant(&self) -> bool {
        let inner = self.inner.lock();
        let sum: usize = inner
            .free_area
            .iter()
            .enumerate()
            .map(|(o, area)| area.len() * order_pages(o))
            .sum();
        sum == inner.free_pages
    }

    pub fn stats(&self) -> ZoneStats {
        let inner = self.inner.lock();
        let mut nr_free = [0; MAX_ORDER + 1];
        for (o, area) in inner.free_area.iter().enumerate() {
            nr_free[o] = area.len();
        }
        ZoneStats {
            zone_type: Some(self.zone_type),
            node: self.node,
            start_pfn: self.start_pfn,
            end_pfn: self.end_pfn,
            total_pages: self.total_pages(),
            free_pages: inner.free_pages,
            watermarks: inner.watermarks,
            nr_free,
            allocations: inner.counters.allocations,
            failures: inner.counters.failures,
            reclaim_attempts: inner.counters.reclaim_attempts,
            reclaimed_pages: inner.counters.reclaimed_pages,
        }
    }
}

impl ZoneInner {
    fn push_free(&mut self, idx: u32, order: usize) {
        let f = &mut self.frames[idx as usize];
        f.flags = PG_FREE;
        f.order = order as u8;
        f.refcount = 0;
        self.free_area[order].push_front(self.frames.as_mut_slice(), idx);
        self.free_pages += order_pages(order);
        #[cfg(feature = "debug_log")]
        log::trace!("zone: free block idx {} order {}", idx, order);
    }
}
