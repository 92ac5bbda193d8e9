//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 页帧与地址类型

pub use crate::config::{MAX_ORDER, PAGE_SHIFT, PAGE_SIZE};

pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// 物理页帧号
pub type Pfn = usize;

/// 虚拟页号
pub type Vpn = usize;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysAddr(pub usize);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtAddr(pub usize);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn from_pfn(pfn: Pfn) -> Self {
        Self(pfn << PAGE_SHIFT)
    }

    #[inline]
    pub const fn as_usize(&self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_aligned(&self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    #[inline]
    pub const fn floor(&self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    #[inline]
    pub const fn ceil(&self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// 物理页帧号 (PFN)
    #[inline]
    pub const fn pfn(&self) -> Pfn {
        self.0 >> PAGE_SHIFT
    }

    /// 页内偏移
    #[inline]
    pub const fn page_offset(&self) -> usize {
        self.0 & PAGE_MASK
    }

    #[inline]
    pub const fn add(&self, off: usize) -> Self {
        Self(self.0 + off)
    }
}

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn from_vpn(vpn: Vpn) -> Self {
        Self(vpn << PAGE_SHIFT)
    }

    #[inline]
    pub const fn as_usize(&self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_aligned(&self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    #[inline]
    pub const fn floor(&self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    #[inline]
    pub const fn ceil(&self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    #[inline]
    pub const fn vpn(&self) -> Vpn {
        self.0 >> PAGE_SHIFT
    }

    #[inline]
    pub const fn page_offset(&self) -> usize {
        self.0 & PAGE_MASK
    }

    #[inline]
    pub const fn add(&self, off: usize) -> Self {
        Self(self.0 + off)
    }
}

/// order 对应的页数
#[inline]
pub const fn order_pages(order: usize) -> usize {
    1 << order
}

/// 覆盖 `pages` 个页所需的最小 order
pub fn pages_to_order(pages: usize) -> usize {
    let mut order = 0;
    while order_pages(order) < pages {
        order += 1;
    }
    order
}

/// 覆盖 `size` 字节所需的最小 order
#[inline]
pub fn size_to_order(size: usize) -> usize {
    pages_to_order(page_align_up(size.max(1)) / PAGE_SIZE)
}

/// 向上对齐到页边界，溢出时返回 None
#[inline]
pub fn checked_page_align_up(len: usize) -> Option<usize> {
    len.checked_add(PAGE_MASK).map(|v| v & !PAGE_MASK)
}

#[inline]
pub const fn page_align_up(len: usize) -> usize {
    (len + PAGE_MASK) & !PAGE_MASK
}

#[inline]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}
