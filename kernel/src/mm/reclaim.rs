//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 页面置换：驻留页跟踪与牺牲页选择
//!
//! 参考：Linux mm/vmscan.c (active / inactive LRU)
//!
//! # 设计
//! - 每个可回收的驻留用户页有一个帧描述符，挂在 active 或 inactive 链表上
//! - 新页进入 active 链表并带引用位；`deactivate` 把最旧的 active 页降到 inactive
//! - 置换算法：
//!   - LRU：inactive 中访问时间最早者，inactive 为空时看 active
//!   - Clock：环形扫描帧表，清除引用位，淘汰第一个未被引用的帧
//!   - FIFO：装入时间最早者
//!   - Random：xorshift 在 inactive（否则 active）中随机选
//! - COW 共享页和共享内存页不在这里跟踪，不会被选为牺牲页
//!
//! 被选中的描述符从链表中摘除后交给调用者；回写失败时由调用者 `restore`。

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use serde::Serialize;
use spin::Mutex;

use super::address_space::SpaceId;
use super::list::{Linked, Links, ListHead};
use super::page::{Pfn, VirtAddr, Vpn};
use crate::error::{MmError, MmResult};

/// 置换算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplacementPolicy {
    Lru,
    Clock,
    Fifo,
    Random,
}

impl ReplacementPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            ReplacementPolicy::Lru => "lru",
            ReplacementPolicy::Clock => "clock",
            ReplacementPolicy::Fifo => "fifo",
            ReplacementPolicy::Random => "random",
        }
    }

    pub fn from_name(name: &str) -> MmResult<Self> {
        match name {
            "lru" => Ok(ReplacementPolicy::Lru),
            "clock" => Ok(ReplacementPolicy::Clock),
            "fifo" => Ok(ReplacementPolicy::Fifo),
            "random" => Ok(ReplacementPolicy::Random),
            _ => Err(MmError::InvalidArgument),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Active,
    Inactive,
}

/// 帧描述符
#[derive(Debug, Clone, Copy)]
pub struct FrameDescriptor {
    pub pfn: Pfn,
    pub space: SpaceId,
    pub vaddr: VirtAddr,
    pub dirty: bool,
    pub referenced: bool,
    pub access_time: u64,
    pub load_time: u64,
    list: ListKind,
    links: Links,
}

impl Linked for FrameDescriptor {
    fn links(&self) -> &Links {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }
}

struct Lists {
    arena: Vec<Option<FrameDescriptor>>,
    free_slots: Vec<u32>,
    by_pfn: BTreeMap<Pfn, u32>,
    active: ListHead,
    inactive: ListHead,
    clock_hand: usize,
    rng: u64,
}

impl Lists {
    fn desc(&self, idx: u32) -> &FrameDescriptor {
        match self.arena.get(idx as usize) {
            Some(Some(d)) => d,
            _ => panic!("reclaim: dangling descriptor {}", idx),
        }
    }

    fn desc_mut(&mut self, idx: u32) -> &mut FrameDescriptor {
        match self.arena.get_mut(idx as usize) {
            Some(Some(d)) => d,
            _ => panic!("reclaim: dangling descriptor {}", idx),
        }
    }

    fn insert(&mut self, d: FrameDescriptor) -> u32 {
        let pfn = d.pfn;
        let list = d.list;
        let idx = match self.free_slots.pop() {
            Some(slot) => {
                self.arena[slot as usize] = Some(d);
                slot
            }
            None => {
                self.arena.push(Some(d));
                (self.arena.len() - 1) as u32
            }
        };
        match list {
            ListKind::Active => self.active.push_back(&mut self.arena, idx),
            ListKind::Inactive => self.inactive.push_back(&mut self.arena, idx),
        }
        self.by_pfn.insert(pfn, idx);
        idx
    }

    fn take(&mut self, idx: u32) -> FrameDescriptor {
        match self.desc(idx).list {
            ListKind::Active => self.active.remove(&mut self.arena, idx),
            ListKind::Inactive => self.inactive.remove(&mut self.arena, idx),
        }
        let d = match self.arena[idx as usize].take() {
            Some(d) => d,
            None => panic!("reclaim: dangling descriptor {}", idx),
        };
        self.free_slots.push(idx);
        self.by_pfn.remove(&d.pfn);
        d
    }

    fn next_random(&mut self) -> u64 {
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng = x;
        x
    }

    /// 在链表上按 key 取最小者
    fn min_by_key(&self, list: &ListHead, key: impl Fn(&FrameDescriptor) -> u64) -> Option<u32> {
        list.iter(&self.arena).min_by_key(|&i| key(self.desc(i)))
    }
}

/// 回收统计
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReclaimStats {
    pub active_pages: usize,
    pub inactive_pages: usize,
    pub victims_selected: u64,
    pub deactivations: u64,
}

/// 驻留页跟踪
pub struct ReclaimLists {
    inner: Mutex<Lists>,
    policy: Mutex<ReplacementPolicy>,
    /// 最近被淘汰的页 → 淘汰时间，用于抖动检测
    evicted: Mutex<BTreeMap<(SpaceId, Vpn), u64>>,
    thrash_window_us: u64,
    victims: AtomicU64,
    deactivations: AtomicU64,
}

/// 抖动检测记录上限
const EVICTED_HISTORY: usize = 4096;

impl ReclaimLists {
    pub fn new(policy: ReplacementPolicy, thrash_window_us: u64, seed: u64) -> Self {
        Self {
            inner: Mutex::new(Lists {
                arena: Vec::new(),
                free_slots: Vec::new(),
                by_pfn: BTreeMap::new(),
                active: ListHead::new(),
                inactive: ListHead::new(),
                clock_hand: 0,
                rng: seed | 1,
            }),
            policy: Mutex::new(policy),
            evicted: Mutex::new(BTreeMap::new()),
            thrash_window_us,
            victims: AtomicU64::new(0),
            deactivations: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> ReplacementPolicy {
        *self.policy.lock()
    }

    pub fn set_policy(&self, policy: ReplacementPolicy) {
        *self.policy.lock() = policy;
        log::info!("reclaim: replacement policy -> {}", policy.name());
    }

    /// 开始跟踪驻留页（进入 active 链表，带引用位）
    pub fn track(&self, pfn: Pfn, space: SpaceId, vaddr: VirtAddr, dirty: bool, now: u64) {
        let mut l = self.inner.lock();
        if let Some(&idx) = l.by_pfn.get(&pfn) {
            l.take(idx);
        }
        l.insert(FrameDescriptor {
            pfn,
            space,
            vaddr,
            dirty,
            referenced: true,
            access_time: now,
            load_time: now,
            list: ListKind::Active,
            links: Links::default(),
        });
    }

    /// 停止跟踪
    pub fn untrack(&self, pfn: Pfn) -> Option<FrameDescriptor> {
        let mut l = self.inner.lock();
        let idx = *l.by_pfn.get(&pfn)?;
        Some(l.take(idx))
    }

    pub fn is_tracked(&self, pfn: Pfn) -> bool {
        self.inner.lock().by_pfn.contains_key(&pfn)
    }

    pub fn descriptor(&self, pfn: Pfn) -> Option<FrameDescriptor> {
        let l = self.inner.lock();
        l.by_pfn.get(&pfn).map(|&i| *l.desc(i))
    }

    /// 记录一次访问；inactive 页被再次访问时提升回 active
    pub fn touch(&self, pfn: Pfn, write: bool, now: u64) {
        let mut l = self.inner.lock();
        let Some(&idx) = l.by_pfn.get(&pfn) else {
            return;
        };
        let d = l.desc_mut(idx);
        d.referenced = true;
        d.access_time = now;
        d.dirty |= write;
        if d.list == ListKind::Inactive {
            d.list = ListKind::Active;
            let Lists {
                arena,
                active,
                inactive,
                ..
            } = &mut *l;
            inactive.remove(arena, idx);
            active.push_back(arena, idx);
        }
    }

    pub fn mark_dirty(&self, pfn: Pfn) {
        let mut l = self.inner.lock();
        if let Some(&idx) = l.by_pfn.get(&pfn) {
            l.desc_mut(idx).dirty = true;
        }
    }

    /// 页框内容已写回，视为干净
    pub fn mark_clean(&self, pfn: Pfn) {
        let mut l = self.inner.lock();
        if let Some(&idx) = l.by_pfn.get(&pfn) {
            l.desc_mut(idx).dirty = false;
        }
    }

    /// 把最多 n 个最旧的 active 页降到 inactive，清除引用位
    pub fn deactivate(&self, n: usize) -> usize {
        let mut l = self.inner.lock();
        let mut moved = 0;
        while moved < n {
            let Lists {
                arena,
                active,
                inactive,
                ..
            } = &mut *l;
            let Some(idx) = active.pop_front(arena) else {
                break;
            };
            if let Some(Some(d)) = arena.get_mut(idx as usize) {
                d.list = ListKind::Inactive;
                d.referenced = false;
            }
            inactive.push_back(arena, idx);
            moved += 1;
        }
        self.deactivations.fetch_add(moved as u64, Ordering::Relaxed);
        moved
    }

    /// 按当前算法选出牺牲页并摘除
    pub fn select_victim(&self) -> Option<FrameDescriptor> {
        let policy = self.policy();
        let mut l = self.inner.lock();
        let idx = match policy {
            ReplacementPolicy::Lru => {
                let inactive = l.inactive;
                let active = l.active;
                l.min_by_key(&inactive, |d| d.access_time)
                    .or_else(|| l.min_by_key(&active, |d| d.access_time))
            }
            ReplacementPolicy::Fifo => {
                let inactive = l.inactive;
                let active = l.active;
                l.min_by_key(&inactive, |d| d.load_time)
                    .or_else(|| l.min_by_key(&active, |d| d.load_time))
            }
            ReplacementPolicy::Clock => Self::clock_sweep(&mut l),
            ReplacementPolicy::Random => {
                let list = if l.inactive.is_empty() { l.active } else { l.inactive };
                if list.is_empty() {
                    None
                } else {
                    let pick = (l.next_random() % list.len() as u64) as usize;
                    list.iter(&l.arena).nth(pick)
                }
            }
        }?;
        let d = l.take(idx);
        self.victims.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "reclaim: {} victim pfn {:#x} (space {}, va {:#x}, dirty {})",
            policy.name(),
            d.pfn,
            d.space,
            d.vaddr.as_usize(),
            d.dirty
        );
        Some(d)
    }

    /// 第二次机会：最多扫两圈
    fn clock_sweep(l: &mut Lists) -> Option<u32> {
        let n = l.arena.len();
        if n == 0 || l.by_pfn.is_empty() {
            return None;
        }
        for _ in 0..2 * n {
            let idx = l.clock_hand % n;
            l.clock_hand = (idx + 1) % n;
            if let Some(d) = l.arena[idx].as_mut() {
                if d.referenced {
                    d.referenced = false;
                } else {
                    return Some(idx as u32);
                }
            }
        }
        None
    }

    /// 回写失败后放回 inactive 链表
    pub fn restore(&self, mut d: FrameDescriptor) {
        d.list = ListKind::Inactive;
        d.links = Links::default();
        let mut l = self.inner.lock();
        if !l.by_pfn.contains_key(&d.pfn) {
            l.insert(d);
        }
    }

    /// 记录淘汰时间
    pub fn note_evicted(&self, space: SpaceId, vpn: Vpn, now: u64) {
        let mut ev = self.evicted.lock();
        if ev.len() >= EVICTED_HISTORY {
            let cutoff = now.saturating_sub(self.thrash_window_us);
            ev.retain(|_, t| *t >= cutoff);
            if ev.len() >= EVICTED_HISTORY {
                ev.clear();
            }
        }
        ev.insert((space, vpn), now);
    }

    /// 页刚被换入：若在抖动窗口内被淘汰过则返回 true
    pub fn check_refault(&self, space: SpaceId, vpn: Vpn, now: u64) -> bool {
        match self.evicted.lock().remove(&(space, vpn)) {
            Some(t) => now.saturating_sub(t) <= self.thrash_window_us,
            None => false,
        }
    }

    /// 地址空间销毁时丢弃其全部记录
    pub fn forget_space(&self, space: SpaceId) {
        self.evicted.lock().retain(|(s, _), _| *s != space);
        let mut l = self.inner.lock();
        let victims: Vec<u32> = l
            .by_pfn
            .values()
            .copied()
            .filter(|&i| l.desc(i).space == space)
            .collect();
        for idx in victims {
            l.take(idx);
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub fn inactive_count(&self) -> usize {
        self.inner.lock().inactive.len()
    }

    pub fn tracked(&self) -> usize {
        self.inner.lock().by_pfn.len()
    }

    pub fn stats(&self) -> ReclaimStats {
        let l = self.inner.lock();
        ReclaimStats {
            active_pages: l.active.len(),
            inactive_pages: l.inactive.len(),
            victims_selected: self.victims.load(Ordering::Relaxed),
            deactivations: self.deactivations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lists(policy: ReplacementPolicy) -> ReclaimLists {
        let r = ReclaimLists::new(policy, 100, 42);
        for (i, t) in [(10usize, 5u64), (11, 1), (12, 3)] {
            r.track(i, 1, VirtAddr::from_vpn(i), false, t);
        }
        r
    }

    #[test]
    fn test_lru_prefers_inactive() {
        let r = lists(ReplacementPolicy::Lru);
        // 全在 active：选访问最早的
        assert_eq!(r.select_victim().unwrap().pfn, 11);
        r.track(11, 1, VirtAddr::from_vpn(11), false, 9);
        assert_eq!(r.deactivate(1), 1);
        // 最旧的 active 是 10，降级后优先从 inactive 选
        assert_eq!(r.select_victim().unwrap().pfn, 10);
    }

    #[test]
    fn test_fifo() {
        let r = lists(ReplacementPolicy::Fifo);
        r.touch(11, false, 50);
        assert_eq!(r.select_victim().unwrap().pfn, 11);
        assert_eq!(r.select_victim().unwrap().pfn, 12);
    }

    #[test]
    fn test_clock_second_chance() {
        let r = lists(ReplacementPolicy::Clock);
        // 第一圈清除引用位，第二圈淘汰第一个
        assert_eq!(r.select_victim().unwrap().pfn, 10);
        r.touch(11, false, 20);
        // 11 刚被引用，跳过到 12
        assert_eq!(r.select_victim().unwrap().pfn, 12);
    }

    #[test]
    fn test_random_and_restore() {
        let r = lists(ReplacementPolicy::Random);
        let v = r.select_victim().unwrap();
        assert_eq!(r.tracked(), 2);
        r.restore(v);
        assert_eq!(r.tracked(), 3);
        assert_eq!(r.inactive_count(), 1);
    }

    #[test]
    fn test_thrash_window() {
        let r = ReclaimLists::new(ReplacementPolicy::Lru, 100, 1);
        r.note_evicted(1, 7, 1000);
        assert!(r.check_refault(1, 7, 1050));
        r.note_evicted(1, 8, 1000);
        assert!(!r.check_refault(1, 8, 2000));
        assert!(!r.check_refault(1, 9, 2000));
    }

    #[test]
    fn test_policy_names() {
        assert_eq!(ReplacementPolicy::from_name("clock").unwrap(), ReplacementPolicy::Clock);
        assert!(ReplacementPolicy::from_name("mru").is_err());
    }
}
