//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 缺页处理（请求调页）
//!
//! 处理顺序：
//! 1. 找到地址所在的 VMA 并检查访问权限
//! 2. 根据页表项状态分类（驻留 / 匿名未映射 / 换出 / 压缩 / 权限冲突）
//! 3. 分配页帧并装入内容，失败时回收一批页面再重试一次
//!
//! 换入的页在抖动窗口内再次被换出会记一次抖动事件。

use alloc::boxed::Box;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};
use serde::Serialize;

use super::address_space::{AddressSpace, SpaceId, SpaceInner};
use super::compress::PageKey;
use super::manager::MemoryManager;
use super::page::{PhysAddr, Pfn, VirtAddr, Vpn, PAGE_SIZE};
use super::pagemap::{Perm, Pte};
use super::swap::SwapEntry;
use super::vma::Vma;
use crate::error::{MmError, MmResult};

bitflags! {
    /// 缺页错误码（与 x86 页错误码位定义一致）
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultCode: u32 {
        /// 页存在，属于权限冲突
        const PROT = 0x01;
        const WRITE = 0x02;
        const USER = 0x04;
        const RSVD = 0x08;
        /// 取指
        const INSTR = 0x10;
    }
}

/// 页表项在缺页时的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Resident,
    NotPresentAnonymous,
    NotPresentSwapped,
    NotPresentCompressed,
    ProtectionViolation,
}

/// 根据页表项和错误码分类
pub fn classify(pte: Option<Pte>, code: FaultCode) -> PageState {
    match pte {
        None => PageState::NotPresentAnonymous,
        Some(Pte::Swapped(_)) => PageState::NotPresentSwapped,
        Some(Pte::Compressed(_)) => PageState::NotPresentCompressed,
        Some(Pte::Present { perm, .. }) => {
            if (code.contains(FaultCode::WRITE) && !perm.writable()) || !perm.readable() {
                PageState::ProtectionViolation
            } else {
                PageState::Resident
            }
        }
    }
}

/// 缺页处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// 分配零页或从压缩池 / 共享段装入
    Minor,
    /// 从交换区读入
    Major,
    /// COW 复制了新页
    CowCopy,
    /// COW 最后一个持有者，就地恢复可写
    CowPromote,
    /// 页已驻留（并发缺页或权限滞后）
    Spurious,
}

#[derive(Default)]
pub(crate) struct PagingCounters {
    pub page_faults: AtomicU64,
    pub major_faults: AtomicU64,
    pub minor_faults: AtomicU64,
    pub cow_faults: AtomicU64,
    pub spurious_faults: AtomicU64,
    pub segfaults: AtomicU64,
    pub swap_ins: AtomicU64,
    pub swap_outs: AtomicU64,
    pub compressed_ins: AtomicU64,
    pub compressed_outs: AtomicU64,
    pub pages_reclaimed: AtomicU64,
    pub oom_kills: AtomicU64,
    pub thrashing_events: AtomicU64,
    pub migrations: AtomicU64,
}

impl PagingCounters {
    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PagingStats {
        let ld = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PagingStats {
            page_faults: ld(&self.page_faults),
            major_faults: ld(&self.major_faults),
            minor_faults: ld(&self.minor_faults),
            cow_faults: ld(&self.cow_faults),
            spurious_faults: ld(&self.spurious_faults),
            segfaults: ld(&self.segfaults),
            swap_ins: ld(&self.swap_ins),
            swap_outs: ld(&self.swap_outs),
            compressed_ins: ld(&self.compressed_ins),
            compressed_outs: ld(&self.compressed_outs),
            pages_reclaimed: ld(&self.pages_reclaimed),
            oom_kills: ld(&self.oom_kills),
            thrashing_events: ld(&self.thrashing_events),
            migrations: ld(&self.migrations),
        }
    }
}

/// 调页统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PagingStats {
    pub page_faults: u64,
    pub major_faults: u64,
    pub minor_faults: u64,
    pub cow_faults: u64,
    pub spurious_faults: u64,
    pub segfaults: u64,
    pub swap_ins: u64,
    pub swap_outs: u64,
    pub compressed_ins: u64,
    pub compressed_outs: u64,
    pub pages_reclaimed: u64,
    pub oom_kills: u64,
    pub thrashing_events: u64,
    pub migrations: u64,
}

impl MemoryManager {
    /// 缺页入口
    pub fn handle_page_fault(&self, space: SpaceId, addr: VirtAddr, code: FaultCode) -> MmResult<FaultKind> {
        let as_ = self.space(space)?;
        self.fault_in(&as_, addr, code, true)
    }

    /// 处理一次缺页；内存不足时回收后重试一次
    ///
    /// `check_access` 为 false 时跳过 VMA 权限检查（fork 和 swapoff 调回页面用）。
    pub(crate) fn fault_in(
        &self,
        space: &Arc<AddressSpace>,
        addr: VirtAddr,
        code: FaultCode,
        check_access: bool,
    ) -> MmResult<FaultKind> {
        PagingCounters::inc(&self.paging.page_faults);
        let mut retried = false;
        loop {
            match self.fault_once(space, addr, code, check_access) {
                Err(MmError::OutOfMemory | MmError::PolicyUnsatisfiable) if !retried => {
                    retried = true;
                    let n = self.reclaim_pages(self.config.aggressive_reclaim);
                    log::debug!("fault: space {} {:#x}: reclaimed {} pages, retrying", space.id(), addr.as_usize(), n);
                }
                Err(e @ (MmError::OutOfMemory | MmError::PolicyUnsatisfiable)) => {
                    PagingCounters::inc(&self.paging.oom_kills);
                    log::warn!("fault: space {} {:#x}: out of memory", space.id(), addr.as_usize());
                    return Err(e);
                }
                other => return other,
            }
        }
    }

    fn fault_once(
        &self,
        space: &AddressSpace,
        addr: VirtAddr,
        code: FaultCode,
        check_access: bool,
    ) -> MmResult<FaultKind> {
        let now = self.platform.now_us();
        let mut guard = space.lock();
        let inner = &mut *guard;

        let vma = match inner.vmas.find(addr) {
            Some(v) => *v,
            None => {
                PagingCounters::inc(&self.paging.segfaults);
                log::debug!("fault: space {} {:#x}: no vma", space.id(), addr.as_usize());
                return Err(MmError::BadAddress);
            }
        };
        let write = code.contains(FaultCode::WRITE);
        if check_access {
            let f = vma.flags();
            let allowed = if write {
                f.is_writable()
            } else if code.contains(FaultCode::INSTR) {
                f.is_executable()
            } else {
                f.is_readable()
            };
            if !allowed {
                PagingCounters::inc(&self.paging.segfaults);
                log::debug!("fault: space {} {:#x}: access {:?} denied by {:?}", space.id(), addr.as_usize(), code, f);
                return Err(MmError::PermissionDenied);
            }
        }

        let vpn = addr.vpn();
        let pte = inner.pt.lookup(vpn);
        let perm = vma.flags().to_page_perm();
        let state = classify(pte, code);
        #[cfg(feature = "debug_log")]
        log::trace!("fault: space {} vpn {:#x} {:?} {:?}", space.id(), vpn, state, code);

        match pte {
            None => match vma.shm_id() {
                Some(id) => self.shm_fault(inner, &vma, id, addr),
                None => self.anon_fault(space, inner, vpn, perm, write, now),
            },
            Some(Pte::Swapped(entry)) => {
                drop(guard);
                self.swap_in(space, vpn, perm, entry, now)
            }
            Some(Pte::Compressed(pool)) => self.decompress_in(space, inner, vpn, perm, pool, now),
            Some(Pte::Present { pfn, cow, shm, .. }) => {
                if state == PageState::Resident {
                    if !shm {
                        self.reclaim.touch(pfn, write, now);
                    }
                    PagingCounters::inc(&self.paging.spurious_faults);
                    return Ok(FaultKind::Spurious);
                }
                if cow && write {
                    return self.cow_fault(space, inner, vpn, pfn, perm, now);
                }
                // 页表权限落后于 VMA
                inner.pt.protect(vpn, if cow { perm.read_only() } else { perm });
                PagingCounters::inc(&self.paging.spurious_faults);
                Ok(FaultKind::Spurious)
            }
        }
    }

    fn map_private(&self, space: &AddressSpace, inner: &mut SpaceInner, vpn: Vpn, pfn: Pfn, perm: Perm) {
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
    }

    fn anon_fault(
        &self,
        space: &AddressSpace,
        inner: &mut SpaceInner,
        vpn: Vpn,
        perm: Perm,
        write: bool,
        now: u64,
    ) -> MmResult<FaultKind> {
        let pfn = self.alloc_user_frame(true)?;
        self.map_private(space, inner, vpn, pfn, perm);
        self.reclaim.track(pfn, space.id(), VirtAddr::from_vpn(vpn), write, now);
        PagingCounters::inc(&self.paging.minor_faults);
        Ok(FaultKind::Minor)
    }

    /// 读盘时不持有地址空间锁，回来后确认表项仍指向同一个交换槽
    fn swap_in(&self, space: &AddressSpace, vpn: Vpn, perm: Perm, entry: SwapEntry, now: u64) -> MmResult<FaultKind> {
        let pfn = self.alloc_user_frame(false)?;
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        if let Err(e) = self.swap.read_page(entry, &mut buf) {
            self.free_frame(pfn);
            log::error!("fault: swap-in of entry {:#x} failed: {:?}", entry.raw(), e);
            return Err(e);
        }

        let mut guard = space.lock();
        if guard.pt.lookup(vpn) != Some(Pte::Swapped(entry)) {
            // 并发缺页已换入，或者区域被解除映射
            drop(guard);
            self.free_frame(pfn);
            PagingCounters::inc(&self.paging.spurious_faults);
            return Ok(FaultKind::Spurious);
        }
        self.phys.write_frame(pfn, &buf);
        if let Err(e) = self.swap.free_slot(entry) {
            log::warn!("fault: freeing swap entry {:#x}: {:?}", entry.raw(), e);
        }
        self.map_private(space, &mut guard, vpn, pfn, perm);
        drop(guard);
        // 内容只存在于内存中了
        self.reclaim.track(pfn, space.id(), VirtAddr::from_vpn(vpn), true, now);
        self.note_refault(space.id(), vpn, now);
        PagingCounters::inc(&self.paging.major_faults);
        PagingCounters::inc(&self.paging.swap_ins);
        Ok(FaultKind::Major)
    }

    fn decompress_in(
        &self,
        space: &AddressSpace,
        inner: &mut SpaceInner,
        vpn: Vpn,
        perm: Perm,
        pool: usize,
        now: u64,
    ) -> MmResult<FaultKind> {
        let key = PageKey::new(space.id(), vpn);
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        self.compress.decompress(pool, key, &mut buf)?;
        let pfn = self.alloc_user_frame(false)?;
        self.phys.write_frame(pfn, &buf);
        self.compress.invalidate(pool, key);
        self.map_private(space, inner, vpn, pfn, perm);
        self.reclaim.track(pfn, space.id(), VirtAddr::from_vpn(vpn), true, now);
        self.note_refault(space.id(), vpn, now);
        PagingCounters::inc(&self.paging.minor_faults);
        PagingCounters::inc(&self.paging.compressed_ins);
        Ok(FaultKind::Minor)
    }

    fn shm_fault(&self, inner: &mut SpaceInner, vma: &Vma, id: usize, addr: VirtAddr) -> MmResult<FaultKind> {
        let pfn = self
            .shm
            .page_frame(id, vma.page_index(addr), || self.alloc_user_frame(true))?;
        inner.pt.map(
            addr.vpn(),
            Pte::Present {
                pfn,
                perm: vma.flags().to_page_perm(),
                cow: false,
                shm: true,
            },
        );
        PagingCounters::inc(&self.paging.minor_faults);
        Ok(FaultKind::Minor)
    }

    fn cow_fault(
        &self,
        space: &AddressSpace,
        inner: &mut SpaceInner,
        vpn: Vpn,
        pfn: Pfn,
        perm: Perm,
        now: u64,
    ) -> MmResult<FaultKind> {
        use super::cow::CowDecision;

        PagingCounters::inc(&self.paging.cow_faults);
        let vaddr = VirtAddr::from_vpn(vpn);
        match self.cow.on_write_fault(pfn) {
            CowDecision::Promote => {
                inner.pt.map(
                    vpn,
                    Pte::Present {
                        pfn,
                        perm,
                        cow: false,
                        shm: false,
                    },
                );
                self.reclaim.track(pfn, space.id(), vaddr, true, now);
                Ok(FaultKind::CowPromote)
            }
            CowDecision::Copy => {
                let new = match self.alloc_user_frame(false) {
                    Ok(p) => p,
                    Err(e) => {
                        self.cow.restore_share(pfn);
                        return Err(e);
                    }
                };
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
                self.reclaim.track(new, space.id(), vaddr, true, now);
                log::debug!("fault: space {} vpn {:#x}: cow copy {:#x} -> {:#x}", space.id(), vpn, pfn, new);
                Ok(FaultKind::CowCopy)
            }
        }
    }

    fn note_refault(&self, space: SpaceId, vpn: Vpn, now: u64) {
        if self.reclaim.check_refault(space, vpn, now) {
            PagingCounters::inc(&self.paging.thrashing_events);
            log::warn!("paging: thrashing on space {} vpn {:#x}", space, vpn);
        }
    }

    /// 在地址空间锁内访问一个驻留页，不满足权限时按 MMU 的方式缺页后重试
    fn with_user_page<R>(
        &self,
        space: &Arc<AddressSpace>,
        addr: VirtAddr,
        write: bool,
        mut f: impl FnMut(PhysAddr) -> R,
    ) -> MmResult<R> {
        for _ in 0..3 {
            let mut code = FaultCode::USER;
            if write {
                code |= FaultCode::WRITE;
            }
            {
                let inner = space.lock();
                match inner.pt.lookup(addr.vpn()) {
                    Some(Pte::Present { pfn, perm, shm, .. })
                        if perm.readable() && (!write || perm.writable()) =>
                    {
                        if !shm {
                            self.reclaim.touch(pfn, write, self.platform.now_us());
                        }
                        return Ok(f(PhysAddr::from_pfn(pfn).add(addr.page_offset())));
                    }
                    Some(Pte::Present { .. }) => code |= FaultCode::PROT,
                    _ => {}
                }
            }
            self.fault_in(space, addr, code, true)?;
        }
        Err(MmError::BadAddress)
    }

    /// 以用户身份读取虚拟内存
    pub fn read_user(&self, space: SpaceId, addr: VirtAddr, buf: &mut [u8]) -> MmResult<()> {
        let as_ = self.space(space)?;
        let mut done = 0;
        while done < buf.len() {
            let va = VirtAddr::new(addr.as_usize().checked_add(done).ok_or(MmError::BadAddress)?);
            let chunk = (PAGE_SIZE - va.page_offset()).min(buf.len() - done);
            let dst = &mut buf[done..done + chunk];
            self.with_user_page(&as_, va, false, |pa| self.phys.read(pa, &mut *dst))?;
            done += chunk;
        }
        Ok(())
    }

    /// 以用户身份写入虚拟内存
    pub fn write_user(&self, space: SpaceId, addr: VirtAddr, data: &[u8]) -> MmResult<()> {
        let as_ = self.space(space)?;
        let mut done = 0;
        while done < data.len() {
            let va = VirtAddr::new(addr.as_usize().checked_add(done).ok_or(MmError::BadAddress)?);
            let chunk = (PAGE_SIZE - va.page_offset()).min(data.len() - done);
            let src = &data[done..done + chunk];
            self.with_user_page(&as_, va, true, |pa| self.phys.write(pa, src))?;
            done += chunk;
        }
        Ok(())
    }

    pub fn read_user_u32(&self, space: SpaceId, addr: VirtAddr) -> MmResult<u32> {
        let mut b = [0u8; 4];
        self.read_user(space, addr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn write_user_u32(&self, space: SpaceId, addr: VirtAddr, val: u32) -> MmResult<()> {
        self.write_user(space, addr, &val.to_le_bytes())
    }
}
