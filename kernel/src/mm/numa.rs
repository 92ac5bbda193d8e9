//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! NUMA 节点与放置策略
//!
//! 参考：Linux mm/mempolicy.c
//!
//! 每个节点拥有自己的伙伴分配器（节点内的全部 zone）。分配按策略挑节点：
//! - `Default` / `Preferred(n)`：从首选节点开始按距离升序尝试，落在其他节点计一次 fallback
//! - `Interleave`：原子游标在在线节点间轮转，失败后扫描任意在线节点
//! - `Local`：只用当前 CPU 所在节点，不回退
//! - `Bind(mask)`：只用掩码内的节点，不回退
//!
//! 每个 CPU 还有一个小的页缓存，分 local / remote 两个池，
//! 释放的单页按归属节点放入对应的池，分配时优先取 local 池。

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use serde::Serialize;
use spin::Mutex;

use super::buddy::{BuddyAllocator, BuddyStats, FrameProvider};
use super::gfp::GfpFlags;
use super::page::Pfn;
use crate::config::{
    MAX_ORDER, NUMA_DISTANCE_LOCAL, NUMA_DISTANCE_REMOTE, NUMA_LOCAL_CACHE_LIMIT, NUMA_MAX_NODES,
    NUMA_REMOTE_CACHE_LIMIT,
};
use crate::error::{MmError, MmResult};
use crate::platform::Platform;

/// 内存放置策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum NumaPolicy {
    /// 等同于以当前节点为首选
    #[default]
    Default,
    Preferred(usize),
    /// 节点掩码
    Bind(u64),
    Interleave,
    Local,
}

impl NumaPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            NumaPolicy::Default => "default",
            NumaPolicy::Preferred(_) => "preferred",
            NumaPolicy::Bind(_) => "bind",
            NumaPolicy::Interleave => "interleave",
            NumaPolicy::Local => "local",
        }
    }
}

#[derive(Default)]
struct NodeCounters {
    local_allocs: AtomicU64,
    remote_allocs: AtomicU64,
    migrations_in: AtomicU64,
    migrations_out: AtomicU64,
}

/// 节点统计
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct NodeStats {
    pub id: usize,
    pub online: bool,
    pub cpu_mask: u64,
    pub total_pages: usize,
    pub free_pages: usize,
    pub local_allocs: u64,
    pub remote_allocs: u64,
    pub migrations_in: u64,
    pub migrations_out: u64,
    /// 已用百分比
    pub load_factor: usize,
    /// 0..=3
    pub pressure_level: u8,
}

/// NUMA 节点
pub struct NumaNode {
    id: usize,
    online: AtomicBool,
    cpu_mask: u64,
    distances: Vec<u8>,
    buddy: BuddyAllocator,
    counters: NodeCounters,
}

impl NumaNode {
    /// `distances` 为空时按本地 10 / 远端 20 填充
    pub fn new(id: usize, cpu_mask: u64, distances: Vec<u8>, buddy: BuddyAllocator) -> Self {
        Self {
            id,
            online: AtomicBool::new(true),
            cpu_mask,
            distances,
            buddy,
            counters: NodeCounters::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn cpu_mask(&self) -> u64 {
        self.cpu_mask
    }

    pub fn buddy(&self) -> &BuddyAllocator {
        &self.buddy
    }

    pub fn distance_to(&self, other: usize) -> u8 {
        match self.distances.get(other) {
            Some(&d) => d,
            None if other == self.id => NUMA_DISTANCE_LOCAL,
            None => NUMA_DISTANCE_REMOTE,
        }
    }

    pub fn load_factor(&self) -> usize {
        let total = self.buddy.total_pages();
        if total == 0 {
            return 100;
        }
        (total - self.buddy.nr_free_pages()) * 100 / total
    }

    pub fn pressure_level(&self) -> u8 {
        match self.load_factor() {
            l if l > 90 => 3,
            l if l > 70 => 2,
            l if l > 50 => 1,
            _ => 0,
        }
    }

    pub fn stats(&self) -> NodeStats {
        let c = &self.counters;
        NodeStats {
            id: self.id,
            online: self.is_online(),
            cpu_mask: self.cpu_mask,
            total_pages: self.buddy.total_pages(),
            free_pages: self.buddy.nr_free_pages(),
            local_allocs: c.local_allocs.load(Ordering::Relaxed),
            remote_allocs: c.remote_allocs.load(Ordering::Relaxed),
            migrations_in: c.migrations_in.load(Ordering::Relaxed),
            migrations_out: c.migrations_out.load(Ordering::Relaxed),
            load_factor: self.load_factor(),
            pressure_level: self.pressure_level(),
        }
    }
}

#[derive(Default)]
struct CpuNumaCache {
    local: Vec<Pfn>,
    remote: Vec<Pfn>,
    hits: u64,
    misses: u64,
}

/// 每 CPU 页缓存统计
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CpuNumaStats {
    pub local: usize,
    pub remote: usize,
    pub hits: u64,
    pub misses: u64,
}

/// NUMA 层汇总统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct NumaStats {
    pub policy: NumaPolicy,
    pub nodes: Vec<NodeStats>,
    pub fallback_allocs: u64,
    pub policy_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// NUMA 分配器
pub struct NumaAllocator {
    nodes: Vec<NumaNode>,
    platform: Arc<dyn Platform>,
    policy: Mutex<NumaPolicy>,
    interleave: AtomicUsize,
    cpu_caches: Vec<Mutex<CpuNumaCache>>,
    fallback_allocs: AtomicU64,
    policy_failures: AtomicU64,
}

impl NumaAllocator {
    pub fn new(mut nodes: Vec<NumaNode>, platform: Arc<dyn Platform>, nr_cpus: usize) -> MmResult<Self> {
        if nodes.is_empty() || nodes.len() > NUMA_MAX_NODES || nr_cpus == 0 {
            return Err(MmError::InvalidArgument);
        }
        nodes.sort_by_key(|n| n.id);
        for (i, n) in nodes.iter().enumerate() {
            if n.id != i || (!n.distances.is_empty() && n.distances.len() != nodes.len()) {
                return Err(MmError::InvalidArgument);
            }
        }
        for n in nodes.iter() {
            log::info!(
                "numa: node{} {} pages, cpus {:#x}",
                n.id,
                n.buddy.total_pages(),
                n.cpu_mask
            );
        }
        Ok(Self {
            nodes,
            platform,
            policy: Mutex::new(NumaPolicy::Default),
            interleave: AtomicUsize::new(0),
            cpu_caches: (0..nr_cpus).map(|_| Mutex::new(CpuNumaCache::default())).collect(),
            fallback_allocs: AtomicU64::new(0),
            policy_failures: AtomicU64::new(0),
        })
    }

    pub fn nodes(&self) -> &[NumaNode] {
        &self.nodes
    }

    pub fn node(&self, id: usize) -> Option<&NumaNode> {
        self.nodes.get(id)
    }

    pub fn nr_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn policy(&self) -> NumaPolicy {
        *self.policy.lock()
    }

    /// 设置默认策略
    pub fn set_policy(&self, policy: NumaPolicy) -> MmResult<()> {
        self.validate(policy)?;
        *self.policy.lock() = policy;
        log::info!("numa: default policy -> {:?}", policy);
        Ok(())
    }

    fn validate(&self, policy: NumaPolicy) -> MmResult<()> {
        match policy {
            NumaPolicy::Preferred(n) if n >= self.nodes.len() => Err(MmError::InvalidArgument),
            NumaPolicy::Bind(mask) if mask == 0 || (self.nodes.len() < 64 && mask >> self.nodes.len() != 0) => {
                Err(MmError::InvalidArgument)
            }
            _ => Ok(()),
        }
    }

    pub fn set_online(&self, node: usize, online: bool) -> MmResult<()> {
        let n = self.nodes.get(node).ok_or(MmError::InvalidArgument)?;
        n.online.store(online, Ordering::Release);
        log::info!("numa: node{} {}", node, if online { "online" } else { "offline" });
        Ok(())
    }

    /// CPU 所在节点；不在任何掩码里时归节点 0
    pub fn node_of_cpu(&self, cpu: usize) -> usize {
        self.nodes
            .iter()
            .find(|n| cpu < 64 && n.cpu_mask & (1 << cpu) != 0)
            .map(|n| n.id)
            .unwrap_or(0)
    }

    pub fn current_node(&self) -> usize {
        self.node_of_cpu(self.platform.current_cpu())
    }

    pub fn distance(&self, from: usize, to: usize) -> u8 {
        self.nodes
            .get(from)
            .map(|n| n.distance_to(to))
            .unwrap_or(u8::MAX)
    }

    /// 从 `from` 出发按距离升序（同距离按编号）排列的在线节点
    pub fn nodes_by_distance(&self, from: usize) -> Vec<usize> {
        let mut ids: Vec<usize> = self.nodes.iter().filter(|n| n.is_online()).map(|n| n.id).collect();
        ids.sort_by_key(|&id| (self.distance(from, id), id));
        ids
    }

    /// 页帧所在节点
    pub fn pfn_node(&self, pfn: Pfn) -> Option<usize> {
        self.nodes.iter().find(|n| n.buddy.contains(pfn)).map(|n| n.id)
    }

    fn try_node(&self, node: usize, order: usize, gfp: GfpFlags, origin: usize) -> Option<Pfn> {
        let n = self.nodes.get(node)?;
        if !n.is_online() {
            return None;
        }
        let pfn = n.buddy.alloc_pages(order, gfp).ok()?;
        if node == origin {
            n.counters.local_allocs.fetch_add(1, Ordering::Relaxed);
        } else {
            n.counters.remote_allocs.fetch_add(1, Ordering::Relaxed);
        }
        Some(pfn)
    }

    fn fallback(&self, order: usize, gfp: GfpFlags, from: usize, skip: Option<usize>) -> MmResult<Pfn> {
        for node in self.nodes_by_distance(from) {
            if Some(node) == skip {
                continue;
            }
            if let Some(pfn) = self.try_node(node, order, gfp, from) {
                self.fallback_allocs.fetch_add(1, Ordering::Relaxed);
                log::debug!("numa: order {} fell back from node{} to node{}", order, from, node);
                return Ok(pfn);
            }
        }
        Err(MmError::OutOfMemory)
    }

    /// 按策略分配 2^order 页
    pub fn alloc(&self, order: usize, gfp: GfpFlags, policy: NumaPolicy, hint: Option<usize>) -> MmResult<Pfn> {
        if order > MAX_ORDER {
            return Err(MmError::InvalidArgument);
        }
        self.validate(policy)?;
        let local = hint.filter(|&h| h < self.nodes.len()).unwrap_or_else(|| self.current_node());

        match policy {
            NumaPolicy::Local => self.try_node(local, order, gfp, local).ok_or_else(|| {
                self.policy_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("numa: local node{} cannot satisfy order {}", local, order);
                MmError::PolicyUnsatisfiable
            }),
            NumaPolicy::Bind(mask) => {
                for node in self.nodes_by_distance(local) {
                    if node < 64 && mask & (1 << node) != 0 {
                        if let Some(pfn) = self.try_node(node, order, gfp, local) {
                            return Ok(pfn);
                        }
                    }
                }
                self.policy_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("numa: bind mask {:#x} cannot satisfy order {}", mask, order);
                Err(MmError::PolicyUnsatisfiable)
            }
            NumaPolicy::Default | NumaPolicy::Preferred(_) => {
                let preferred = match policy {
                    NumaPolicy::Preferred(n) => n,
                    _ => local,
                };
                if let Some(pfn) = self.try_node(preferred, order, gfp, preferred) {
                    return Ok(pfn);
                }
                self.fallback(order, gfp, preferred, Some(preferred))
            }
            NumaPolicy::Interleave => {
                let online: Vec<usize> = self.nodes.iter().filter(|n| n.is_online()).map(|n| n.id).collect();
                if online.is_empty() {
                    return Err(MmError::OutOfMemory);
                }
                let pick = online[self.interleave.fetch_add(1, Ordering::Relaxed) % online.len()];
                if let Some(pfn) = self.try_node(pick, order, gfp, local) {
                    return Ok(pfn);
                }
                self.fallback(order, gfp, pick, Some(pick))
            }
        }
    }

    /// 直接从指定节点分配（页迁移用）
    pub fn alloc_on_node(&self, node: usize, order: usize, gfp: GfpFlags) -> MmResult<Pfn> {
        self.try_node(node, order, gfp, node).ok_or(MmError::OutOfMemory)
    }

    /// 释放到页帧所属节点
    pub fn free(&self, pfn: Pfn, order: usize) -> MmResult<()> {
        let node = self.pfn_node(pfn).ok_or(MmError::InvalidArgument)?;
        self.nodes[node].buddy.free_pages(pfn, order)
    }

    pub fn note_migration(&self, from: usize, to: usize) {
        if let Some(n) = self.nodes.get(from) {
            n.counters.migrations_out.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(n) = self.nodes.get(to) {
            n.counters.migrations_in.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn cpu_cache(&self) -> (usize, &Mutex<CpuNumaCache>) {
        let cpu = self.platform.current_cpu() % self.cpu_caches.len();
        (cpu, &self.cpu_caches[cpu])
    }

    /// 从当前 CPU 的缓存取一页，未命中时按默认策略分配
    pub fn alloc_cached(&self, gfp: GfpFlags) -> MmResult<Pfn> {
        let (_, cache) = self.cpu_cache();
        {
            let mut c = cache.lock();
            if let Some(pfn) = c.local.pop() {
                c.hits += 1;
                #[cfg(feature = "debug_log")]
                log::trace!("numa: cached local page {:#x}", pfn);
                return Ok(pfn);
            }
            c.misses += 1;
        }
        match self.alloc(0, gfp, self.policy(), None) {
            Ok(pfn) => Ok(pfn),
            Err(e) => cache.lock().remote.pop().ok_or(e),
        }
    }

    /// 把单页还给当前 CPU 的缓存，池满时直接释放
    pub fn free_cached(&self, pfn: Pfn) -> MmResult<()> {
        let node = self.pfn_node(pfn).ok_or(MmError::InvalidArgument)?;
        let (cpu, cache) = self.cpu_cache();
        let local = node == self.node_of_cpu(cpu);
        {
            let mut c = cache.lock();
            let (pool, limit) = if local {
                (&mut c.local, NUMA_LOCAL_CACHE_LIMIT)
            } else {
                (&mut c.remote, NUMA_REMOTE_CACHE_LIMIT)
            };
            if pool.len() < limit {
                pool.push(pfn);
                return Ok(());
            }
        }
        self.nodes[node].buddy.free_pages(pfn, 0)
    }

    /// 清空全部 CPU 缓存，返回释放的页数
    pub fn drain_caches(&self) -> usize {
        let mut pages = Vec::new();
        for cache in self.cpu_caches.iter() {
            let mut c = cache.lock();
            pages.append(&mut c.local);
            pages.append(&mut c.remote);
        }
        let n = pages.len();
        for pfn in pages {
            if let Err(e) = self.free(pfn, 0) {
                log::error!("numa: drain of pfn {:#x} failed: {:?}", pfn, e);
            }
        }
        n
    }

    pub fn cpu_cache_stats(&self, cpu: usize) -> Option<CpuNumaStats> {
        let c = self.cpu_caches.get(cpu)?.lock();
        Some(CpuNumaStats {
            local: c.local.len(),
            remote: c.remote.len(),
            hits: c.hits,
            misses: c.misses,
        })
    }

    pub fn total_pages(&self) -> usize {
        self.nodes.iter().map(|n| n.buddy.total_pages()).sum()
    }

    /// 伙伴系统中的空闲页，加上 CPU 缓存中的页
    pub fn nr_free_pages(&self) -> usize {
        let cached: usize = self
            .cpu_caches
            .iter()
            .map(|c| {
                let c = c.lock();
                c.local.len() + c.remote.len()
            })
            .sum();
        self.nodes.iter().map(|n| n.buddy.nr_free_pages()).sum::<usize>() + cached
    }

    pub fn buddy_stats(&self) -> BuddyStats {
        let mut s = BuddyStats::default();
        for n in self.nodes.iter() {
            s.merge(&n.buddy.stats());
        }
        s
    }

    pub fn fallback_allocs(&self) -> u64 {
        self.fallback_allocs.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> NumaStats {
        let (hits, misses) = self.cpu_caches.iter().fold((0, 0), |(h, m), c| {
            let c = c.lock();
            (h + c.hits, m + c.misses)
        });
        NumaStats {
            policy: self.policy(),
            nodes: self.nodes.iter().map(|n| n.stats()).collect(),
            fallback_allocs: self.fallback_allocs(),
            policy_failures: self.policy_failures.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: misses,
        }
    }
}

impl FrameProvider for NumaAllocator {
    fn alloc_frames(&self, order: usize, gfp: GfpFlags, node_hint: Option<usize>) -> MmResult<Pfn> {
        let policy = match (self.policy(), node_hint) {
            (NumaPolicy::Default, Some(n)) => NumaPolicy::Preferred(n),
            (p, _) => p,
        };
        self.alloc(order, gfp, policy, node_hint)
    }

    fn free_frames(&self, pfn: Pfn, order: usize) -> MmResult<()> {
        self.free(pfn, order)
    }

    fn node_of(&self, pfn: Pfn) -> Option<usize> {
        self.pfn_node(pfn)
    }
}

/// 按节点数生成默认距离矩阵
pub fn default_distances(nr_nodes: usize) -> Vec<Vec<u8>> {
    (0..nr_nodes)
        .map(|i| {
            let mut row = vec![NUMA_DISTANCE_REMOTE; nr_nodes];
            row[i] = NUMA_DISTANCE_LOCAL;
            row
        })
        .collect()
}
