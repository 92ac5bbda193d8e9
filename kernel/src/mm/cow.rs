//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 写时复制（COW）页跟踪
//!
//! fork 时父子进程共享私有可写页，页被标记为只读共享，按物理页帧计数。
//! 写缺页时：
//! - 计数为 1（最后一个持有者）或不在表中：就地恢复可写，不复制
//! - 计数大于 1：调用者分配新页并复制，原页计数减一
//!
//! 只有本模块在自己的锁内把页从共享转为独占。

use alloc::collections::BTreeMap;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};
use serde::Serialize;
use spin::Mutex;

use super::page::{Pfn, PAGE_SIZE};
use crate::error::{MmError, MmResult};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CowFlags: u32 {
        const SHARED = 0x01;
        /// 至少有一个共享者写过
        const WRITTEN = 0x02;
        const READONLY = 0x04;
    }
}

#[derive(Debug, Clone, Copy)]
struct CowEntry {
    refcount: u32,
    flags: CowFlags,
}

/// 写缺页的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowDecision {
    /// 已是唯一持有者，就地改为可写
    Promote,
    /// 需要复制；原页计数已减一
    Copy,
}

#[derive(Default)]
struct CowCounters {
    pages_created: AtomicU64,
    pages_copied: AtomicU64,
    faults_handled: AtomicU64,
}

/// COW 统计
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CowStats {
    pub shared_pages: usize,
    pub cow_pages_created: u64,
    pub cow_pages_copied: u64,
    pub cow_faults_handled: u64,
    /// 共享节省的字节数
    pub memory_saved: u64,
}

pub struct CowTracker {
    entries: Mutex<BTreeMap<Pfn, CowEntry>>,
    counters: CowCounters,
}

impl CowTracker {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            counters: CowCounters {
                pages_created: AtomicU64::new(0),
                pages_copied: AtomicU64::new(0),
                faults_handled: AtomicU64::new(0),
            },
        }
    }

    /// 增加一个共享者；首次共享时计数从 2 开始
    pub fn mark_shared(&self, pfn: Pfn) -> u32 {
        let mut map = self.entries.lock();
        let e = map.entry(pfn).or_insert_with(|| {
            self.counters.pages_created.fetch_add(1, Ordering::Relaxed);
            CowEntry {
                refcount: 1,
                flags: CowFlags::SHARED | CowFlags::READONLY,
            }
        });
        e.refcount += 1;
        e.refcount
    }

    pub fn is_shared(&self, pfn: Pfn) -> bool {
        self.entries.lock().contains_key(&pfn)
    }

    pub fn refcount(&self, pfn: Pfn) -> Option<u32> {
        self.entries.lock().get(&pfn).map(|e| e.refcount)
    }

    pub fn flags(&self, pfn: Pfn) -> Option<CowFlags> {
        self.entries.lock().get(&pfn).map(|e| e.flags)
    }

    /// 写缺页决策
    pub fn on_write_fault(&self, pfn: Pfn) -> CowDecision {
        self.counters.faults_handled.fetch_add(1, Ordering::Relaxed);
        let mut map = self.entries.lock();
        match map.get_mut(&pfn) {
            Some(e) if e.refcount > 1 => {
                e.refcount -= 1;
                e.flags |= CowFlags::WRITTEN;
                self.counters.pages_copied.fetch_add(1, Ordering::Relaxed);
                log::debug!("cow: copy pfn {:#x}, {} sharers left", pfn, e.refcount);
                CowDecision::Copy
            }
            _ => {
                map.remove(&pfn);
                log::debug!("cow: promote pfn {:#x} in place", pfn);
                CowDecision::Promote
            }
        }
    }

    /// 复制失败时把减掉的计数加回去
    pub fn restore_share(&self, pfn: Pfn) {
        let mut map = self.entries.lock();
        match map.get_mut(&pfn) {
            Some(e) => e.refcount += 1,
            None => {
                map.insert(
                    pfn,
                    CowEntry {
                        refcount: 2,
                        flags: CowFlags::SHARED | CowFlags::READONLY,
                    },
                );
            }
        }
        self.counters.pages_copied.fetch_sub(1, Ordering::Relaxed);
    }

    /// 一个持有者放弃页帧；返回 true 表示调用者应释放它
    ///
    /// 不在表中的页视为独占。
    pub fn release(&self, pfn: Pfn) -> bool {
        let mut map = self.entries.lock();
        match map.get_mut(&pfn) {
            Some(e) => {
                e.refcount -= 1;
                if e.refcount == 0 {
                    map.remove(&pfn);
                    return true;
                }
                false
            }
            None => true,
        }
    }

    /// 所有条目计数非零且带 SHARED
    pub fn validate(&self) -> MmResult<()> {
        let map = self.entries.lock();
        for (pfn, e) in map.iter() {
            if e.refcount == 0 || !e.flags.contains(CowFlags::SHARED) {
                log::error!("cow: bad entry pfn {:#x} refcount {} flags {:?}", pfn, e.refcount, e.flags);
                return Err(MmError::Corrupted);
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> CowStats {
        let map = self.entries.lock();
        let saved: u64 = map.values().map(|e| (e.refcount as u64 - 1) * PAGE_SIZE as u64).sum();
        CowStats {
            shared_pages: map.len(),
            cow_pages_created: self.counters.pages_created.load(Ordering::Relaxed),
            cow_pages_copied: self.counters.pages_copied.load(Ordering::Relaxed),
            cow_faults_handled: self.counters.faults_handled.load(Ordering::Relaxed),
            memory_saved: saved,
        }
    }
}

impl Default for CowTracker {
    fn default() -> Self {
        Self::new()
    }
}
