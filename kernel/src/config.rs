//! kmm 内存管理配置（自动生成）
//!
//! 此文件由 build.rs 根据 Kernel.toml 自动生成，请勿手动修改

// ============================================================
// 基本信息
// ============================================================

/// 名称
pub const KMM_NAME: &str = "kmm";

/// 版本
pub const KMM_VERSION: &str = "0.1.0";

// ============================================================
// 内存配置
// ============================================================

/// 页大小
pub const PAGE_SIZE: usize = 4096;

/// 页大小位移
pub const PAGE_SHIFT: usize = 12;

/// 伙伴系统最大 order
pub const MAX_ORDER: usize = 10;

/// 最大CPU数量
pub const MAX_CPUS: usize = 32;

// ============================================================
// 默认区域布局（页帧号）
// ============================================================

pub const ZONE_DMA_START: usize = 0x0;
pub const ZONE_DMA_END: usize = 0x1000;
pub const ZONE_NORMAL_START: usize = 0x1000;
pub const ZONE_NORMAL_END: usize = 0x38000;
pub const ZONE_HIGHMEM_START: usize = 0x38000;
pub const ZONE_HIGHMEM_END: usize = 0x100000;

// ============================================================
// Slab 配置
// ============================================================

/// 最大缓存数量
pub const SLAB_MAX_CACHES: usize = 128;

/// 最小对象对齐
pub const SLAB_MIN_ALIGN: usize = 8;

/// 每CPU缓存容量
pub const SLAB_CPU_CACHE_LIMIT: usize = 64;

/// 每CPU缓存批量传输数
pub const SLAB_CPU_CACHE_BATCH: usize = 16;

/// 着色对齐（缓存行）
pub const SLAB_COLOUR_ALIGN: usize = 64;

/// 最大着色数
pub const SLAB_MAX_COLOUR: usize = 16;

// ============================================================
// 交换配置
// ============================================================

/// 最大交换文件数
pub const SWAP_MAX_FILES: usize = 8;

/// 每个交换文件的最大块数
pub const SWAP_BLOCKS_PER_FILE: usize = 1048576;

// ============================================================
// 压缩配置
// ============================================================

/// 最大压缩池数量
pub const COMPRESSION_MAX_POOLS: usize = 16;

/// 最小压缩率（百分比，超过则拒绝）
pub const COMPRESSION_MIN_RATIO: u32 = 75;

/// 单页压缩时间上限（微秒）
pub const COMPRESSION_MAX_TIME_US: u64 = 1000;

/// 默认压缩池页数
pub const COMPRESSION_DEFAULT_POOL_PAGES: usize = 4096;

// ============================================================
// NUMA 配置
// ============================================================

/// 最大 NUMA 节点数
pub const NUMA_MAX_NODES: usize = 64;

/// 每CPU本地对象缓存容量
pub const NUMA_LOCAL_CACHE_LIMIT: usize = 64;

/// 每CPU远端对象缓存容量
pub const NUMA_REMOTE_CACHE_LIMIT: usize = 32;

/// 本地节点距离
pub const NUMA_DISTANCE_LOCAL: u8 = 10;

/// 默认远端节点距离
pub const NUMA_DISTANCE_REMOTE: u8 = 20;

// ============================================================
// 换页配置
// ============================================================

/// 低内存阈值（空闲百分比）
pub const PAGING_LOW_THRESHOLD: usize = 10;

/// 高内存压力阈值（空闲百分比）
pub const PAGING_HIGH_THRESHOLD: usize = 5;

/// 激进回收页数
pub const PAGING_AGGRESSIVE_RECLAIM: usize = 16;

/// 温和回收页数
pub const PAGING_GENTLE_RECLAIM: usize = 4;

/// 抖动检测窗口（微秒）
pub const PAGING_THRASH_WINDOW_US: u64 = 100000;

/// 默认页面置换算法
pub const PAGING_DEFAULT_REPLACEMENT: crate::mm::reclaim::ReplacementPolicy =
    crate::mm::reclaim::ReplacementPolicy::Lru;
