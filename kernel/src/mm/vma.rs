//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 虚拟内存区域 (Virtual Memory Area) 管理
//!
//! VMA 表示进程地址空间中一个连续的虚拟内存区域，具有相同的
//! 访问权限和映射属性。
//!
//! 本模块只包含平台无关的数据结构：
//! - VmaFlags: VMA 标志
//! - Vma: VMA 结构体
//! - VmaManager: VMA 管理器（区间拆分、裁剪、改权限、找空洞）

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use bitflags::bitflags;

use super::page::{VirtAddr, PAGE_SIZE};
use super::pagemap::Perm;

bitflags! {
    /// VMA 标志，低三位与 PROT_* 取值相同
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VmaFlags: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        const EXEC = 0x04;
        const SHARED = 0x08;
        const PRIVATE = 0x10;
    }
}

impl VmaFlags {
    pub const PROT_MASK: Self = Self::READ.union(Self::WRITE).union(Self::EXEC);

    /// 只取 PROT_* 位，其余忽略
    #[inline]
    pub fn from_prot(prot: u32) -> Self {
        Self::from_bits_truncate(prot) & Self::PROT_MASK
    }

    /// 换掉权限位，共享 / 私有属性不变
    #[inline]
    pub fn with_prot(self, prot: VmaFlags) -> Self {
        self.difference(Self::PROT_MASK) | (prot & Self::PROT_MASK)
    }

    #[inline]
    pub fn is_readable(self) -> bool {
        self.contains(Self::READ)
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.contains(Self::WRITE)
    }

    #[inline]
    pub fn is_executable(self) -> bool {
        self.contains(Self::EXEC)
    }

    #[inline]
    pub fn is_shared(self) -> bool {
        self.contains(Self::SHARED)
    }

    /// 页表项权限：WRITE 隐含可读，单独的 EXEC 按只读处理
    pub fn to_page_perm(self) -> Perm {
        if self.is_writable() {
            if self.is_executable() {
                Perm::ReadWriteExec
            } else {
                Perm::ReadWrite
            }
        } else if self.intersects(Self::READ | Self::EXEC) {
            Perm::Read
        } else {
            Perm::None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaType {
    /// 匿名映射（堆、栈、私有数据）
    Anonymous,
    /// 共享内存段
    SharedMemory(usize),
}

/// 一段 [start, end) 的映射，地址页对齐
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Vma {
    start: VirtAddr,
    end: VirtAddr,
    flags: VmaFlags,
    /// 共享内存段内的页偏移
    offset: usize,
    vma_type: VmaType,
}

impl Vma {
    /// 创建新的匿名 VMA，范围必须非空且页对齐
    pub fn new(start: VirtAddr, end: VirtAddr, flags: VmaFlags) -> Result<Self, VmaError> {
        if start >= end || !start.is_aligned() || !end.is_aligned() {
            return Err(VmaError::Invalid);
        }
        Ok(Self {
            start,
            end,
            flags,
            offset: 0,
            vma_type: VmaType::Anonymous,
        })
    }

    #[inline]
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    #[inline]
    pub fn end(&self) -> VirtAddr {
        self.end
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.end.as_usize() - self.start.as_usize()
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        self.size() >> super::page::PAGE_SHIFT
    }

    #[inline]
    pub fn flags(&self) -> VmaFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: VmaFlags) {
        self.flags = flags;
    }

    #[inline]
    pub fn vma_type(&self) -> VmaType {
        self.vma_type
    }

    pub fn set_type(&mut self, vma_type: VmaType) {
        self.vma_type = vma_type;
    }

    /// 共享内存段编号
    pub fn shm_id(&self) -> Option<usize> {
        match self.vma_type {
            VmaType::SharedMemory(id) => Some(id),
            VmaType::Anonymous => None,
        }
    }

    /// 私有可写：fork 时走 COW
    #[inline]
    pub fn is_private_writable(&self) -> bool {
        self.flags.is_writable() && !self.flags.is_shared()
    }

    #[inline]
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn overlaps(&self, other: &Vma) -> bool {
        self.overlaps_range(other.start, other.end)
    }

    pub fn overlaps_range(&self, start: VirtAddr, end: VirtAddr) -> bool {
        self.start < end && start < self.end
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    /// 地址对应的段内页下标
    pub fn page_index(&self, addr: VirtAddr) -> usize {
        self.offset + (addr.floor().as_usize() - self.start.as_usize()) / PAGE_SIZE
    }

    /// 在 addr 所在页的起点切成两段；addr 不在内部时返回 None
    pub fn split(&self, addr: VirtAddr) -> Option<(Vma, Vma)> {
        let at = addr.floor();
        if at <= self.start || at >= self.end {
            return None;
        }

        let first = Vma { end: at, ..*self };
        let second = Vma {
            start: at,
            offset: self.offset + (at.as_usize() - self.start.as_usize()) / PAGE_SIZE,
            ..*self
        };
        Some((first, second))
    }

    /// 相邻且属性相同（共享段还要求偏移连续）
    pub fn can_merge(&self, other: &Vma) -> bool {
        self.end == other.start
            && self.flags == other.flags
            && self.vma_type == other.vma_type
            && (self.shm_id().is_none() || self.offset + self.page_count() == other.offset)
    }

    /// 把紧随其后的 other 并入自身
    pub fn merge(&mut self, other: Vma) -> bool {
        let ok = self.can_merge(&other);
        if ok {
            self.end = other.end;
        }
        ok
    }
}

impl core::fmt::Debug for Vma {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Vma({:#x}..{:#x} {:?} {:?}",
            self.start.as_usize(),
            self.end.as_usize(),
            self.flags,
            self.vma_type
        )?;
        if self.offset != 0 {
            write!(f, " +{}", self.offset)?;
        }
        write!(f, ")")
    }
}

/// 一个地址空间的全部 VMA，按起始地址排序且互不重叠
#[derive(Clone, Default)]
pub struct VmaManager {
    vmas: BTreeMap<VirtAddr, Vma>,
}

impl VmaManager {
    pub const fn new() -> Self {
        Self { vmas: BTreeMap::new() }
    }

    /// 插入 VMA，与前后属性相同的邻居合并；重叠时返回 `Overlap`
    pub fn add(&mut self, vma: Vma) -> Result<(), VmaError> {
        if self.overlaps(vma.start(), vma.end()) {
            return Err(VmaError::Overlap);
        }

        let mut vma = vma;
        let prev = self.vmas.range(..vma.start()).next_back().map(|(_, v)| *v);
        if let Some(mut p) = prev {
            if p.can_merge(&vma) {
                self.vmas.remove(&p.start());
                p.merge(vma);
                vma = p;
            }
        }
        let next = self.vmas.get(&vma.end()).copied();
        if let Some(n) = next {
            if vma.can_merge(&n) {
                self.vmas.remove(&n.start());
                vma.merge(n);
            }
        }
        self.vmas.insert(vma.start(), vma);
        Ok(())
    }

    /// 区间内是否有任何 VMA
    pub fn overlaps(&self, start: VirtAddr, end: VirtAddr) -> bool {
        if let Some((_, v)) = self.vmas.range(..end).next_back() {
            if v.overlaps_range(start, end) {
                return true;
            }
        }
        false
    }

    pub fn find(&self, addr: VirtAddr) -> Option<&Vma> {
        self.vmas
            .range(..=addr)
            .next_back()
            .map(|(_, v)| v)
            .filter(|v| v.contains(addr))
    }

    pub fn find_mut(&mut self, addr: VirtAddr) -> Option<&mut Vma> {
        self.vmas
            .range_mut(..=addr)
            .next_back()
            .map(|(_, v)| v)
            .filter(|v| v.contains(addr))
    }

    pub fn remove(&mut self, start: VirtAddr) -> Result<Vma, VmaError> {
        self.vmas.remove(&start).ok_or(VmaError::NotFound)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.vmas.values()
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.vmas.len()
    }

    pub fn get(&self, start: VirtAddr) -> Option<&Vma> {
        self.vmas.get(&start)
    }

    /// 在 [base, top) 内找第一个能放下 len 字节的空洞
    pub fn find_free_area(&self, len: usize, base: VirtAddr, top: VirtAddr) -> Option<VirtAddr> {
        let mut cursor = base.ceil();
        for vma in self.vmas.values() {
            if vma.end() <= cursor {
                continue;
            }
            if vma.start() > cursor && vma.start().as_usize() - cursor.as_usize() >= len {
                break;
            }
            cursor = vma.end();
        }
        let end = cursor.as_usize().checked_add(len)?;
        (end <= top.as_usize()).then_some(cursor)
    }

    /// 在 addr 处把所在的 VMA 一分为二
    fn split_at(&mut self, addr: VirtAddr) {
        let Some(vma) = self.find(addr).copied() else {
            return;
        };
        if let Some((a, b)) = vma.split(addr) {
            self.vmas.insert(a.start(), a);
            self.vmas.insert(b.start(), b);
        }
    }

    fn starts_in(&self, start: VirtAddr, end: VirtAddr) -> Vec<VirtAddr> {
        self.vmas.range(start..end).map(|(k, _)| *k).collect()
    }

    /// 移除 [start, end) 内的映射，裁剪或拆分跨边界的 VMA
    ///
    /// 返回被移除的部分，调用者据此释放页面。
    pub fn remove_range(&mut self, start: VirtAddr, end: VirtAddr) -> Vec<Vma> {
        self.split_at(start);
        self.split_at(end);
        self.starts_in(start, end)
            .into_iter()
            .filter_map(|k| self.vmas.remove(&k))
            .collect()
    }

    /// 修改 [start, end) 的权限位
    ///
    /// 区间必须完全被 VMA 覆盖，否则返回 NotFound 且不做修改。
    pub fn protect_range(&mut self, start: VirtAddr, end: VirtAddr, prot: VmaFlags) -> Result<Vec<Vma>, VmaError> {
        if !self.covers(start, end) {
            return Err(VmaError::NotFound);
        }
        self.split_at(start);
        self.split_at(end);
        let mut changed = Vec::new();
        for k in self.starts_in(start, end) {
            if let Some(v) = self.vmas.get_mut(&k) {
                v.flags = v.flags.with_prot(prot);
                changed.push(*v);
            }
        }
        self.merge_range(start, end);
        Ok(changed)
    }

    /// 合并 [start, end] 附近属性相同的相邻 VMA
    fn merge_range(&mut self, start: VirtAddr, end: VirtAddr) {
        let first = match self.vmas.range(..start).next_back() {
            Some((k, _)) => *k,
            None => start,
        };
        let mut keys: Vec<VirtAddr> = self.vmas.range(first..=end).map(|(k, _)| *k).collect();
        keys.reverse();
        let mut next: Option<Vma> = None;
        for k in keys {
            let Some(mut cur) = self.vmas.get(&k).copied() else {
                continue;
            };
            if let Some(n) = next {
                if cur.merge(n) {
                    self.vmas.remove(&n.start());
                    self.vmas.insert(k, cur);
                }
            }
            next = Some(cur);
        }
    }

    /// [start, end) 是否被连续的 VMA 完全覆盖
    pub fn covers(&self, start: VirtAddr, end: VirtAddr) -> bool {
        let mut cursor = start;
        while cursor < end {
            match self.find(cursor) {
                Some(v) => cursor = v.end(),
                None => return false,
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.vmas.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaError {
    Overlap,
    /// 区间没有被完全映射
    NotFound,
    /// 空区间或未对齐
    Invalid,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn va(a: usize) -> VirtAddr {
        VirtAddr::new(a)
    }

    fn rw() -> VmaFlags {
        VmaFlags::READ | VmaFlags::WRITE | VmaFlags::PRIVATE
    }

    #[test]
    fn test_vma_creation() {
        let vma = Vma::new(va(0x1000), va(0x2000), rw()).unwrap();
        assert_eq!(vma.size(), 0x1000);
        assert_eq!(vma.page_count(), 1);
        assert_eq!(vma.flags().to_page_perm(), Perm::ReadWrite);
        assert_eq!(Vma::new(va(0x2000), va(0x2000), rw()), Err(VmaError::Invalid));
        assert_eq!(Vma::new(va(0x1001), va(0x2000), rw()), Err(VmaError::Invalid));
    }

    #[test]
    fn test_vma_contains() {
        let vma = Vma::new(va(0x1000), va(0x3000), VmaFlags::empty()).unwrap();
        assert!(vma.contains(va(0x1000)));
        assert!(vma.contains(va(0x2fff)));
        assert!(!vma.contains(va(0x3000)));
        assert!(!vma.contains(va(0xfff)));
    }

    #[test]
    fn test_add_merges_and_rejects_overlap() {
        let mut m = VmaManager::new();
        m.add(Vma::new(va(0x1000), va(0x3000), rw()).unwrap()).unwrap();
        m.add(Vma::new(va(0x3000), va(0x4000), rw()).unwrap()).unwrap();
        assert_eq!(m.count(), 1);
        assert_eq!(m.find(va(0x3800)).unwrap().end(), va(0x4000));
        assert_eq!(
            m.add(Vma::new(va(0x2000), va(0x5000), rw()).unwrap()),
            Err(VmaError::Overlap)
        );
        assert!(m.find(va(0x4000)).is_none());
    }

    #[test]
    fn test_remove_range_splits() {
        let mut m = VmaManager::new();
        m.add(Vma::new(va(0x10000), va(0x20000), rw()).unwrap()).unwrap();
        let removed = m.remove_range(va(0x14000), va(0x16000));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].page_count(), 2);
        assert_eq!(m.count(), 2);
        assert!(m.find(va(0x15000)).is_none());
        assert_eq!(m.find(va(0x17000)).unwrap().start(), va(0x16000));
    }

    #[test]
    fn test_protect_range() {
        let mut m = VmaManager::new();
        m.add(Vma::new(va(0x10000), va(0x14000), rw()).unwrap()).unwrap();
        let changed = m.protect_range(va(0x11000), va(0x12000), VmaFlags::READ).unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(m.count(), 3);
        assert!(!m.find(va(0x11000)).unwrap().flags().is_writable());
        assert!(m.find(va(0x12000)).unwrap().flags().is_writable());
        assert_eq!(
            m.protect_range(va(0x13000), va(0x15000), VmaFlags::READ),
            Err(VmaError::NotFound)
        );
        // 恢复原权限后重新合并
        m.protect_range(va(0x11000), va(0x12000), VmaFlags::READ | VmaFlags::WRITE).unwrap();
        assert_eq!(m.count(), 1);
    }

    #[test]
    fn test_find_free_area() {
        let mut m = VmaManager::new();
        m.add(Vma::new(va(0x10000), va(0x12000), rw()).unwrap()).unwrap();
        m.add(Vma::new(va(0x13000), va(0x14000), VmaFlags::READ).unwrap()).unwrap();
        assert_eq!(m.find_free_area(0x1000, va(0x10000), va(0x20000)), Some(va(0x12000)));
        assert_eq!(m.find_free_area(0x2000, va(0x10000), va(0x20000)), Some(va(0x14000)));
        assert_eq!(m.find_free_area(0x10000, va(0x10000), va(0x20000)), None);
    }

    #[test]
    fn test_split_offsets() {
        let mut vma = Vma::new(va(0x1000), va(0x5000), rw()).unwrap();
        vma.set_type(VmaType::SharedMemory(3));
        vma.set_offset(2);
        let (a, b) = vma.split(va(0x3000)).unwrap();
        assert_eq!(a.page_count(), 2);
        assert_eq!(b.offset(), 4);
        assert_eq!(b.page_index(va(0x4abc)), 5);
        assert!(a.can_merge(&b));
    }
}
