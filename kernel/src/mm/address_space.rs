//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 用户地址空间与 mmap / munmap / mprotect / fork
//!
//! 每个地址空间由一组 VMA 和一张页表组成，二者在同一把锁下修改。
//! 私有页在 fork 时变成 COW 共享；共享映射（MAP_SHARED 或 shmat）的页属于
//! 共享内存段，不参与回收和 COW。
//!
//! 锁顺序：地址空间 → COW → 回收链表 → 交换/压缩 → 共享内存 → NUMA 节点 → zone

use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::{Mutex, MutexGuard};

use super::compress::PageKey;
use super::fault::FaultCode;
use super::manager::MemoryManager;
use super::page::{checked_page_align_up, VirtAddr, Vpn, PAGE_SIZE};
use super::pagemap::{PageTable, Pte, SoftPageTable};
use super::vma::{Vma, VmaFlags, VmaManager, VmaType};
use crate::error::{MmError, MmResult};

/// 地址空间编号
pub type SpaceId = u32;

pub const PROT_NONE: u32 = 0x0;
pub const PROT_READ: u32 = 0x1;
pub const PROT_WRITE: u32 = 0x2;
pub const PROT_EXEC: u32 = 0x4;

pub const MAP_SHARED: u32 = 0x01;
pub const MAP_PRIVATE: u32 = 0x02;
pub const MAP_FIXED: u32 = 0x10;
pub const MAP_ANONYMOUS: u32 = 0x20;
pub const MAP_POPULATE: u32 = 0x8000;

/// 受地址空间锁保护的部分
pub struct SpaceInner {
    pub vmas: VmaManager,
    pub pt: Box<dyn PageTable>,
}

/// 用户地址空间
pub struct AddressSpace {
    id: SpaceId,
    inner: Mutex<SpaceInner>,
    /// 驻留的私有页数
    rss: AtomicUsize,
    mmap_base: VirtAddr,
    task_size: VirtAddr,
}

impl AddressSpace {
    pub fn new(id: SpaceId, pt: Box<dyn PageTable>, mmap_base: VirtAddr, task_size: VirtAddr) -> Self {
        Self {
            id,
            inner: Mutex::new(SpaceInner {
                vmas: VmaManager::new(),
                pt,
            }),
            rss: AtomicUsize::new(0),
            mmap_base,
            task_size,
        }
    }

    #[inline]
    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, SpaceInner> {
        self.inner.lock()
    }

    /// 锁当前是否被持有
    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn rss(&self) -> usize {
        self.rss.load(Ordering::Relaxed)
    }

    pub(crate) fn add_rss(&self, pages: usize) {
        self.rss.fetch_add(pages, Ordering::Relaxed);
    }

    pub(crate) fn sub_rss(&self, pages: usize) {
        self.rss.fetch_sub(pages, Ordering::Relaxed);
    }

    pub fn mmap_base(&self) -> VirtAddr {
        self.mmap_base
    }

    pub fn task_size(&self) -> VirtAddr {
        self.task_size
    }

    pub fn lookup(&self, addr: VirtAddr) -> Option<Pte> {
        self.inner.lock().pt.lookup(addr.vpn())
    }

    pub fn find_vma(&self, addr: VirtAddr) -> Option<Vma> {
        self.inner.lock().vmas.find(addr).copied()
    }

    pub fn vmas(&self) -> Vec<Vma> {
        self.inner.lock().vmas.iter().copied().collect()
    }

    /// 在 [base, task_size) 内且未越界
    fn in_range(&self, start: usize, len: usize) -> bool {
        match start.checked_add(len) {
            Some(end) => start >= PAGE_SIZE && end <= self.task_size.as_usize(),
            None => false,
        }
    }
}

impl MemoryManager {
    /// 新建空的用户地址空间（软件页表）
    pub fn create_space(&self) -> MmResult<SpaceId> {
        self.create_space_with(Box::new(SoftPageTable::new()))
    }

    /// 使用外部页表实现新建地址空间
    pub fn create_space_with(&self, pt: Box<dyn PageTable>) -> MmResult<SpaceId> {
        let space = self.new_space(pt);
        let id = space.id();
        self.spaces.write().insert(id, space);
        log::debug!("mm: address space {} created", id);
        Ok(id)
    }

    fn new_space(&self, pt: Box<dyn PageTable>) -> Arc<AddressSpace> {
        let id = self.next_space.fetch_add(1, Ordering::Relaxed);
        Arc::new(AddressSpace::new(
            id,
            pt,
            VirtAddr::new(self.config.mmap_base),
            VirtAddr::new(self.config.task_size),
        ))
    }

    /// 释放一个页表项引用的资源
    pub(crate) fn release_pte(&self, space: &AddressSpace, vpn: Vpn, pte: Pte) {
        match pte {
            Pte::Present { shm: true, .. } => {}
            Pte::Present { pfn, .. } => {
                self.reclaim.untrack(pfn);
                if self.cow.release(pfn) {
                    self.free_frame(pfn);
                }
                space.sub_rss(1);
            }
            Pte::Swapped(entry) => {
                if let Err(e) = self.swap.free_slot(entry) {
                    log::warn!("mm: space {} vpn {:#x}: stale swap entry {:#x}: {:?}", space.id(), vpn, entry.raw(), e);
                }
            }
            Pte::Compressed(pool) => {
                self.compress.invalidate(pool, PageKey::new(space.id(), vpn));
            }
        }
    }

    /// 拆除被移除 VMA 的页表项，必要时解除共享内存段的挂接
    pub(crate) fn release_vmas(&self, space: &AddressSpace, inner: &mut SpaceInner, removed: &[Vma]) {
        let mut segments = BTreeSet::new();
        for vma in removed {
            for (vpn, _) in inner.pt.entries(vma.start().vpn(), vma.end().vpn()) {
                if let Some(pte) = inner.pt.unmap(vpn) {
                    self.release_pte(space, vpn, pte);
                }
            }
            if let Some(id) = vma.shm_id() {
                segments.insert(id);
            }
        }
        for id in segments {
            if !inner.vmas.iter().any(|v| v.shm_id() == Some(id)) {
                let frames = self.shm.detach(id, space.id(), true, self.platform.now_us());
                self.free_frames(frames);
            }
        }
    }

    /// mmap：只支持匿名映射
    ///
    /// - 长度按页向上取整
    /// - MAP_FIXED 要求地址对齐，并替换区间内已有的映射
    /// - 否则先尝试提示地址，再从 mmap 基址找第一个空洞
    /// - MAP_SHARED | MAP_ANONYMOUS 背后是一个匿名共享内存段
    pub fn mmap(&self, space: SpaceId, addr: usize, len: usize, prot: u32, flags: u32) -> MmResult<VirtAddr> {
        let as_ = self.space(space)?;
        if len == 0 || prot & !(PROT_READ | PROT_WRITE | PROT_EXEC) != 0 {
            return Err(MmError::InvalidArgument);
        }
        let len = checked_page_align_up(len).ok_or(MmError::OutOfMemory)?;
        let shared = match (flags & MAP_SHARED != 0, flags & MAP_PRIVATE != 0) {
            (true, false) => true,
            (false, true) => false,
            _ => return Err(MmError::InvalidArgument),
        };
        if flags & MAP_ANONYMOUS == 0 {
            return Err(MmError::InvalidArgument);
        }

        let start = {
            let mut guard = as_.lock();
            let inner = &mut *guard;
            let start = if flags & MAP_FIXED != 0 {
                if addr % PAGE_SIZE != 0 || !as_.in_range(addr, len) {
                    return Err(MmError::InvalidArgument);
                }
                let start = VirtAddr::new(addr);
                let removed = inner.vmas.remove_range(start, start.add(len));
                self.release_vmas(&as_, inner, &removed);
                start
            } else {
                let hint = VirtAddr::new(addr);
                if addr != 0
                    && hint.is_aligned()
                    && as_.in_range(addr, len)
                    && !inner.vmas.overlaps(hint, hint.add(len))
                {
                    hint
                } else {
                    inner
                        .vmas
                        .find_free_area(len, as_.mmap_base(), as_.task_size())
                        .ok_or(MmError::OutOfMemory)?
                }
            };

            let mut vflags = VmaFlags::from_prot(prot);
            vflags.insert(if shared { VmaFlags::SHARED } else { VmaFlags::PRIVATE });
            let mut vma = Vma::new(start, start.add(len), vflags)?;
            if shared {
                let now = self.platform.now_us();
                let id = self.shm.create_anonymous(len, now)?;
                self.shm.attach(id, space, now)?;
                vma.set_type(VmaType::SharedMemory(id));
            }
            if let Err(e) = inner.vmas.add(vma) {
                if let Some(id) = vma.shm_id() {
                    let frames = self.shm.detach(id, space, true, self.platform.now_us());
                    self.free_frames(frames);
                }
                return Err(e.into());
            }
            start
        };

        log::debug!(
            "mmap: space {} {:#x}+{:#x} prot {:#x} flags {:#x}",
            space,
            start.as_usize(),
            len,
            prot,
            flags
        );

        if flags & MAP_POPULATE != 0 && prot != PROT_NONE {
            let mut code = FaultCode::USER;
            if prot & PROT_WRITE != 0 {
                code |= FaultCode::WRITE;
            }
            for off in (0..len).step_by(PAGE_SIZE) {
                self.fault_in(&as_, start.add(off), code, true)?;
            }
        }
        Ok(start)
    }

    /// munmap：移除、裁剪或拆分区间内的 VMA 并释放其页面
    pub fn munmap(&self, space: SpaceId, addr: usize, len: usize) -> MmResult<()> {
        let as_ = self.space(space)?;
        if addr % PAGE_SIZE != 0 || len == 0 {
            return Err(MmError::InvalidArgument);
        }
        let len = checked_page_align_up(len).ok_or(MmError::InvalidArgument)?;
        let end = addr.checked_add(len).ok_or(MmError::InvalidArgument)?;

        let mut guard = as_.lock();
        let inner = &mut *guard;
        let removed = inner.vmas.remove_range(VirtAddr::new(addr), VirtAddr::new(end));
        self.release_vmas(&as_, inner, &removed);
        log::debug!("munmap: space {} {:#x}-{:#x}, {} vmas", space, addr, end, removed.len());
        Ok(())
    }

    /// mprotect：拆分边界上的 VMA 并更新驻留页的权限
    ///
    /// COW 共享页保持只读，写入时再走 COW。
    pub fn mprotect(&self, space: SpaceId, addr: usize, len: usize, prot: u32) -> MmResult<()> {
        let as_ = self.space(space)?;
        if addr % PAGE_SIZE != 0 || prot & !(PROT_READ | PROT_WRITE | PROT_EXEC) != 0 {
            return Err(MmError::InvalidArgument);
        }
        if len == 0 {
            return Ok(());
        }
        let len = checked_page_align_up(len).ok_or(MmError::InvalidArgument)?;
        let end = addr.checked_add(len).ok_or(MmError::InvalidArgument)?;

        let mut guard = as_.lock();
        let inner = &mut *guard;
        let changed = inner
            .vmas
            .protect_range(VirtAddr::new(addr), VirtAddr::new(end), VmaFlags::from_prot(prot))?;
        for vma in changed.iter() {
            let perm = vma.flags().to_page_perm();
            for (vpn, pte) in inner.pt.entries(vma.start().vpn(), vma.end().vpn()) {
                if let Pte::Present { cow, .. } = pte {
                    inner.pt.protect(vpn, if cow { perm.read_only() } else { perm });
                }
            }
        }
        log::debug!("mprotect: space {} {:#x}-{:#x} prot {:#x}", space, addr, end, prot);
        Ok(())
    }

    /// fork：复制地址空间
    ///
    /// 私有页变为 COW 共享且两边都只读，共享页按引用共享。
    /// 换出或压缩的私有页先调回内存。
    pub fn fork(&self, parent: SpaceId) -> MmResult<SpaceId> {
        self.fork_with(parent, Box::new(SoftPageTable::new()))
    }

    pub fn fork_with(&self, parent: SpaceId, pt: Box<dyn PageTable>) -> MmResult<SpaceId> {
        let p = self.space(parent)?;

        let pending: Vec<VirtAddr> = {
            let inner = p.lock();
            inner
                .vmas
                .iter()
                .filter(|v| v.shm_id().is_none())
                .flat_map(|v| inner.pt.entries(v.start().vpn(), v.end().vpn()))
                .filter(|(_, pte)| !pte.is_present())
                .map(|(vpn, _)| VirtAddr::from_vpn(vpn))
                .collect()
        };
        for va in pending {
            self.fault_in(&p, va, FaultCode::USER, false)?;
        }

        let child = self.new_space(pt);
        if let Err(e) = self.copy_mappings(&p, &child) {
            self.teardown(&child);
            return Err(e);
        }
        self.shm.fork_attaches(parent, child.id());
        let id = child.id();
        self.spaces.write().insert(id, child);
        log::debug!("fork: space {} -> {}", parent, id);
        Ok(id)
    }

    fn copy_mappings(&self, parent: &AddressSpace, child: &AddressSpace) -> MmResult<()> {
        let mut pi = parent.lock();
        let mut ci = child.lock();
        let vmas: Vec<Vma> = pi.vmas.iter().copied().collect();
        for vma in vmas {
            ci.vmas.add(vma)?;
            for (vpn, pte) in pi.pt.entries(vma.start().vpn(), vma.end().vpn()) {
                match pte {
                    Pte::Present { shm: true, .. } => {
                        ci.pt.map(vpn, pte);
                    }
                    Pte::Present { pfn, perm, .. } => {
                        self.cow.mark_shared(pfn);
                        self.reclaim.untrack(pfn);
                        let ro = Pte::Present {
                            pfn,
                            perm: perm.read_only(),
                            cow: true,
                            shm: false,
                        };
                        pi.pt.map(vpn, ro);
                        ci.pt.map(vpn, ro);
                        child.add_rss(1);
                    }
                    // 调页期间又被换出
                    _ => return Err(MmError::Busy),
                }
            }
        }
        Ok(())
    }

    /// 释放地址空间的全部映射
    fn teardown(&self, space: &AddressSpace) {
        let mut guard = space.lock();
        let inner = &mut *guard;
        let removed = inner.vmas.remove_range(VirtAddr::new(0), VirtAddr::new(usize::MAX));
        self.release_vmas(space, inner, &removed);
        drop(guard);
        self.reclaim.forget_space(space.id());
        self.compress.invalidate_space(space.id());
        let frames = self.shm.drop_space(space.id(), self.platform.now_us());
        self.free_frames(frames);
    }

    /// 进程退出：拆除并注销地址空间
    pub fn exit_space(&self, space: SpaceId) -> MmResult<()> {
        let as_ = self.spaces.write().remove(&space).ok_or(MmError::NotFound)?;
        self.teardown(&as_);
        log::debug!("mm: address space {} destroyed", space);
        Ok(())
    }
}
