//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! kmalloc / kfree 通用分配接口
//!
//! - 8..=2048 字节走 kmalloc-N 尺寸类缓存
//! - 更大的请求直接向页分配器申请覆盖它的最小 order
//! - kfree 只需要地址：先查大块表，再查 slab 页归属表

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::buddy::FrameProvider;
use super::gfp::GfpFlags;
use super::page::{order_pages, size_to_order, PhysAddr, MAX_ORDER, PAGE_SIZE};
use super::phys::PhysMem;
use super::slab::{SlabAllocator, SlabCache};
use crate::error::{MmError, MmResult};

/// 尺寸类
pub const KMALLOC_SIZES: [usize; 9] = [8, 16, 32, 64, 128, 256, 512, 1024, 2048];

pub const KMALLOC_MAX_CACHE_SIZE: usize = 2048;

pub struct Kmalloc {
    slab: Arc<SlabAllocator>,
    caches: Vec<Arc<SlabCache>>,
    provider: Arc<dyn FrameProvider>,
    phys: Arc<PhysMem>,
    /// 大块分配：起始地址 → order
    large: Mutex<BTreeMap<PhysAddr, usize>>,
}

impl Kmalloc {
    /// 创建 kmalloc-8 .. kmalloc-2048 缓存
    pub fn new(
        slab: Arc<SlabAllocator>,
        provider: Arc<dyn FrameProvider>,
        phys: Arc<PhysMem>,
    ) -> MmResult<Self> {
        let mut caches = Vec::with_capacity(KMALLOC_SIZES.len());
        for size in KMALLOC_SIZES {
            let name = format!("kmalloc-{}", size);
            caches.push(slab.cache_create(&name, size, size.min(PAGE_SIZE), None)?);
        }
        Ok(Self {
            slab,
            caches,
            provider,
            phys,
            large: Mutex::new(BTreeMap::new()),
        })
    }

    fn class_of(size: usize) -> Option<usize> {
        KMALLOC_SIZES.iter().position(|&s| s >= size)
    }

    /// 分配 size 字节
    pub fn kmalloc(&self, size: usize, gfp: GfpFlags) -> MmResult<PhysAddr> {
        if size == 0 {
            return Err(MmError::InvalidArgument);
        }
        if let Some(class) = Self::class_of(size) {
            let obj = self.caches[class].alloc()?;
            if gfp.contains(GfpFlags::ZERO) {
                self.phys.fill(obj, KMALLOC_SIZES[class], 0);
            }
            return Ok(obj);
        }

        let order = size_to_order(size);
        if order > MAX_ORDER {
            return Err(MmError::InvalidArgument);
        }
        let pfn = self.provider.alloc_frames(order, gfp, None)?;
        let addr = PhysAddr::from_pfn(pfn);
        self.large.lock().insert(addr, order);
        log::debug!("kmalloc: large {} bytes -> order {} at {:#x}", size, order, addr.as_usize());
        Ok(addr)
    }

    /// 分配并清零
    #[inline]
    pub fn kzalloc(&self, size: usize, gfp: GfpFlags) -> MmResult<PhysAddr> {
        self.kmalloc(size, gfp | GfpFlags::ZERO)
    }

    /// 释放 kmalloc 返回的地址
    pub fn kfree(&self, addr: PhysAddr) -> MmResult<()> {
        let large = self.large.lock().remove(&addr);
        if let Some(order) = large {
            return self.provider.free_frames(addr.pfn(), order);
        }
        let cache = self.slab.cache_of(addr).ok_or(MmError::InvalidArgument)?;
        if !self.caches.iter().any(|c| Arc::ptr_eq(c, &cache)) {
            return Err(MmError::InvalidArgument);
        }
        cache.free(addr)
    }

    /// 分配块的实际可用大小
    pub fn ksize(&self, addr: PhysAddr) -> MmResult<usize> {
        if let Some(order) = self.large.lock().get(&addr) {
            return Ok(order_pages(*order) * PAGE_SIZE);
        }
        let cache = self.slab.cache_of(addr).ok_or(MmError::InvalidArgument)?;
        Ok(cache.object_size())
    }

    pub fn caches(&self) -> &[Arc<SlabCache>] {
        &self.caches
    }

    /// 大块分配占用的页数
    pub fn large_pages(&self) -> usize {
        self.large.lock().values().map(|&o| order_pages(o)).sum()
    }
}
