//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 运行时配置
//!
//! `MmConfig::default()` 来自 Kernel.toml 生成的常量；
//! 测试和模拟环境直接构造小布局（见 `single_node` / `uniform`）。

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use serde::Serialize;

use super::buddy::BuddyAllocator;
use super::compress::CompressionAlgorithm;
use super::numa::{default_distances, NumaNode, NumaPolicy};
use super::page::Pfn;
use super::phys::PhysMem;
use super::reclaim::ReplacementPolicy;
use super::zone::{Watermarks, Zone, ZoneType};
use super::{USER_VIRT_BASE, USER_VIRT_TOP};
use crate::config::*;
use crate::error::{MmError, MmResult};

/// 区域配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZoneConfig {
    pub zone_type: ZoneType,
    pub start_pfn: Pfn,
    pub end_pfn: Pfn,
    /// None 时按区域大小计算
    pub watermarks: Option<Watermarks>,
}

impl ZoneConfig {
    pub fn new(zone_type: ZoneType, start_pfn: Pfn, end_pfn: Pfn) -> Self {
        Self {
            zone_type,
            start_pfn,
            end_pfn,
            watermarks: None,
        }
    }

    pub fn with_watermarks(mut self, wm: Watermarks) -> Self {
        self.watermarks = Some(wm);
        self
    }

    pub fn pages(&self) -> usize {
        self.end_pfn.saturating_sub(self.start_pfn)
    }
}

/// NUMA 节点配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeConfig {
    pub id: usize,
    pub cpu_mask: u64,
    /// 到各节点的距离，下标为节点号
    pub distances: Vec<u8>,
    pub zones: Vec<ZoneConfig>,
}

/// 内存管理器配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MmConfig {
    pub nodes: Vec<NodeConfig>,
    pub nr_cpus: usize,

    pub slab_cpu_limit: usize,
    pub slab_cpu_batch: usize,

    pub compression_enabled: bool,
    pub compression_algorithm: CompressionAlgorithm,
    /// 默认压缩池页数，0 表示不建默认池
    pub compression_pool_pages: usize,

    pub replacement: ReplacementPolicy,
    pub numa_policy: NumaPolicy,

    /// 空闲百分比低于此值时温和回收
    pub low_threshold: usize,
    /// 空闲百分比低于此值时激进回收
    pub high_threshold: usize,
    pub gentle_reclaim: usize,
    pub aggressive_reclaim: usize,
    pub thrash_window_us: u64,
    pub rng_seed: u64,

    pub mmap_base: usize,
    pub task_size: usize,
}

impl Default for MmConfig {
    fn default() -> Self {
        let zones = vec![
            ZoneConfig::new(ZoneType::Dma, ZONE_DMA_START, ZONE_DMA_END),
            ZoneConfig::new(ZoneType::Normal, ZONE_NORMAL_START, ZONE_NORMAL_END),
            ZoneConfig::new(ZoneType::HighMem, ZONE_HIGHMEM_START, ZONE_HIGHMEM_END),
        ];
        Self {
            nodes: vec![NodeConfig {
                id: 0,
                cpu_mask: cpu_mask(MAX_CPUS),
                distances: vec![NUMA_DISTANCE_LOCAL],
                zones,
            }],
            nr_cpus: MAX_CPUS,
            slab_cpu_limit: SLAB_CPU_CACHE_LIMIT,
            slab_cpu_batch: SLAB_CPU_CACHE_BATCH,
            compression_enabled: true,
            compression_algorithm: CompressionAlgorithm::Lz4,
            compression_pool_pages: COMPRESSION_DEFAULT_POOL_PAGES,
            replacement: PAGING_DEFAULT_REPLACEMENT,
            numa_policy: NumaPolicy::Default,
            low_threshold: PAGING_LOW_THRESHOLD,
            high_threshold: PAGING_HIGH_THRESHOLD,
            gentle_reclaim: PAGING_GENTLE_RECLAIM,
            aggressive_reclaim: PAGING_AGGRESSIVE_RECLAIM,
            thrash_window_us: PAGING_THRASH_WINDOW_US,
            rng_seed: 0x2545_f491_4f6c_dd1d,
            mmap_base: USER_VIRT_BASE,
            task_size: USER_VIRT_TOP,
        }
    }
}

fn cpu_mask(nr_cpus: usize) -> u64 {
    if nr_cpus >= 64 {
        u64::MAX
    } else {
        (1u64 << nr_cpus) - 1
    }
}

impl MmConfig {
    /// 单节点、单个 Normal 区域
    pub fn single_node(start_pfn: Pfn, pages: usize) -> Self {
        Self::uniform(1, start_pfn, pages)
    }

    /// `nr_nodes` 个节点，每个节点一个 `pages` 页的 Normal 区域，CPU 平均分配
    pub fn uniform(nr_nodes: usize, start_pfn: Pfn, pages: usize) -> Self {
        let nr_nodes = nr_nodes.max(1);
        let distances = default_distances(nr_nodes);
        let nr_cpus = nr_nodes.max(2);
        let per = nr_cpus / nr_nodes;
        let nodes = (0..nr_nodes)
            .map(|i| {
                let start = start_pfn + i * pages;
                let mask = if nr_nodes == 1 {
                    cpu_mask(nr_cpus)
                } else {
                    cpu_mask(per) << (i * per)
                };
                NodeConfig {
                    id: i,
                    cpu_mask: mask,
                    distances: distances[i].clone(),
                    zones: vec![ZoneConfig::new(ZoneType::Normal, start, start + pages)],
                }
            })
            .collect();
        Self {
            nodes,
            nr_cpus,
            compression_pool_pages: pages.max(1),
            ..Self::default()
        }
    }

    /// 所有区域使用零水位
    pub fn with_zero_watermarks(mut self) -> Self {
        for zone in self.nodes.iter_mut().flat_map(|n| n.zones.iter_mut()) {
            zone.watermarks = Some(Watermarks::zero());
        }
        self
    }

    pub fn total_pages(&self) -> usize {
        self.nodes.iter().flat_map(|n| n.zones.iter()).map(|z| z.pages()).sum()
    }

    pub fn validate(&self) -> MmResult<()> {
        if self.nodes.is_empty() || self.nodes.len() > NUMA_MAX_NODES {
            return Err(MmError::InvalidArgument);
        }
        if self.nr_cpus == 0 || self.nr_cpus > MAX_CPUS {
            return Err(MmError::InvalidArgument);
        }
        if self.slab_cpu_batch == 0 || self.slab_cpu_batch > self.slab_cpu_limit {
            return Err(MmError::InvalidArgument);
        }
        if self.high_threshold > self.low_threshold || self.low_threshold > 100 {
            return Err(MmError::InvalidArgument);
        }
        if self.mmap_base >= self.task_size {
            return Err(MmError::InvalidArgument);
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if node.id != i || node.distances.len() != self.nodes.len() || node.zones.is_empty() {
                return Err(MmError::InvalidArgument);
            }
        }
        Ok(())
    }

    /// 按配置建立各节点的区域和伙伴分配器
    pub fn build_nodes(&self, phys: &Arc<PhysMem>) -> MmResult<Vec<NumaNode>> {
        self.nodes
            .iter()
            .map(|n| {
                let zones = n
                    .zones
                    .iter()
                    .map(|z| Zone::new(z.zone_type, n.id, z.start_pfn, z.end_pfn, z.watermarks))
                    .collect::<MmResult<Vec<_>>>()?;
                let buddy = BuddyAllocator::new(n.id, zones, phys.clone())?;
                Ok(NumaNode::new(n.id, n.cpu_mask, n.distances.clone(), buddy))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let cfg = MmConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.nodes[0].zones.len(), 3);
        assert_eq!(cfg.total_pages(), ZONE_HIGHMEM_END - ZONE_DMA_START);
        assert_eq!(cfg.replacement, ReplacementPolicy::Lru);
    }

    #[test]
    fn test_uniform() {
        let cfg = MmConfig::uniform(2, 0x100, 64).with_zero_watermarks();
        cfg.validate().unwrap();
        assert_eq!(cfg.nodes[1].zones[0].start_pfn, 0x140);
        assert_eq!(cfg.nodes[0].cpu_mask, 0b01);
        assert_eq!(cfg.nodes[1].cpu_mask, 0b10);
        assert_eq!(cfg.nodes[0].zones[0].watermarks, Some(Watermarks::zero()));

        let phys = Arc::new(PhysMem::new());
        let nodes = cfg.build_nodes(&phys).unwrap();
        assert_eq!(nodes[1].buddy().total_pages(), 64);
    }

    #[test]
    fn test_validate_rejects() {
        let mut cfg = MmConfig::single_node(0, 16);
        cfg.high_threshold = 50;
        assert_eq!(cfg.validate(), Err(MmError::InvalidArgument));
        let mut cfg = MmConfig::single_node(0, 16);
        cfg.nodes[0].distances = vec![10, 20];
        assert_eq!(cfg.validate(), Err(MmError::InvalidArgument));
    }
}
