//! kmm 构建脚本
//!
//! 这个脚本在编译前运行，负责：
//! 1. 解析 Kernel.toml 配置文件（或 menuconfig 生成的 build/.config）
//! 2. 生成 src/config.rs 常量

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KernelConfig {
    general: General,
    memory: Memory,
    zones: Zones,
    slab: Slab,
    swap: Swap,
    compression: Compression,
    numa: Numa,
    paging: Paging,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct General {
    name: String,
    version: String,
}

impl Default for General {
    fn default() -> Self {
        Self { name: "kmm".into(), version: "0.1.0".into() }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Memory {
    page_size: u64,
    max_order: u64,
    max_cpus: u64,
}

impl Default for Memory {
    fn default() -> Self {
        Self { page_size: 4096, max_order: 10, max_cpus: 32 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Zones {
    dma_start: u64,
    dma_end: u64,
    normal_start: u64,
    normal_end: u64,
    highmem_start: u64,
    highmem_end: u64,
}

impl Default for Zones {
    fn default() -> Self {
        Self {
            dma_start: 0,
            dma_end: 0x1000,
            normal_start: 0x1000,
            normal_end: 0x38000,
            highmem_start: 0x38000,
            highmem_end: 0x100000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Slab {
    max_caches: u64,
    min_align: u64,
    cpu_cache_limit: u64,
    cpu_cache_batch: u64,
    colour_align: u64,
    max_colour: u64,
}

impl Default for Slab {
    fn default() -> Self {
        Self {
            max_caches: 128,
            min_align: 8,
            cpu_cache_limit: 64,
            cpu_cache_batch: 16,
            colour_align: 64,
            max_colour: 16,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Swap {
    max_files: u64,
    blocks_per_file: u64,
}

impl Default for Swap {
    fn default() -> Self {
        Self { max_files: 8, blocks_per_file: 1 << 20 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Compression {
    max_pools: u64,
    min_ratio: u64,
    max_time_us: u64,
    default_pool_pages: u64,
}

impl Default for Compression {
    fn default() -> Self {
        Self { max_pools: 16, min_ratio: 75, max_time_us: 1000, default_pool_pages: 4096 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Numa {
    max_nodes: u64,
    local_cache_limit: u64,
    remote_cache_limit: u64,
    distance_local: u64,
    distance_remote: u64,
}

impl Default for Numa {
    fn default() -> Self {
        Self {
            max_nodes: 64,
            local_cache_limit: 64,
            remote_cache_limit: 32,
            distance_local: 10,
            distance_remote: 20,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Paging {
    low_threshold: u64,
    high_threshold: u64,
    aggressive_reclaim: u64,
    gentle_reclaim: u64,
    thrash_window_us: u64,
    replacement: String,
}

impl Default for Paging {
    fn default() -> Self {
        Self {
            low_threshold: 10,
            high_threshold: 5,
            aggressive_reclaim: 16,
            gentle_reclaim: 4,
            thrash_window_us: 100_000,
            replacement: "lru".into(),
        }
    }
}

/// 解析 build/.config 文件（简单 section_key=value 格式）
fn parse_dot_config(content: &str) -> toml::Value {
    let mut sections: HashMap<String, toml::map::Map<String, toml::Value>> = HashMap::new();

    for line in content.lines() {
        let line = line.trim();

        // 跳过注释和空行
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();

        // 分割 section_key（使用第一个下划线分割）
        let Some((section, config_key)) = key.split_once('_') else {
            continue;
        };

        let parsed_value = if value == "true" {
            toml::Value::Boolean(true)
        } else if value == "false" {
            toml::Value::Boolean(false)
        } else if let Ok(int_val) = value.parse::<i64>() {
            toml::Value::Integer(int_val)
        } else if let Some(hex) = value.strip_prefix("0x") {
            i64::from_str_radix(hex, 16)
                .map(toml::Value::Integer)
                .unwrap_or_else(|_| toml::Value::String(value.to_string()))
        } else {
            toml::Value::String(value.trim_matches('"').to_string())
        };

        sections
            .entry(section.to_string())
            .or_default()
            .insert(config_key.to_string(), parsed_value);
    }

    let mut root_map = toml::map::Map::new();
    for (section_name, section_data) in sections {
        root_map.insert(section_name, toml::Value::Table(section_data));
    }
    toml::Value::Table(root_map)
}

fn main() {
    println!("cargo:rerun-if-changed=../Kernel.toml");
    println!("cargo:rerun-if-changed=../build/.config");
    println!("cargo:rerun-if-changed=build.rs");

    // 优先使用 build/.config（menuconfig 生成的配置），否则回退到 Kernel.toml
    let content = fs::read_to_string("../build/.config")
        .or_else(|_| fs::read_to_string("../Kernel.toml"))
        .unwrap_or_default();

    let is_toml = content.lines().any(|line| {
        let trimmed = line.trim();
        trimmed.starts_with('[') && trimmed.ends_with(']')
    });

    let config: KernelConfig = if content.is_empty() {
        println!("cargo:warning=Kernel.toml not found, using built-in defaults");
        KernelConfig::default()
    } else if is_toml {
        toml::from_str(&content).expect("Kernel.toml 解析失败")
    } else {
        parse_dot_config(&content)
            .try_into()
            .expect("build/.config 解析失败")
    };

    validate(&config);

    println!("cargo:rustc-env=KMM_NAME={}", config.general.name);
    println!("cargo:rustc-env=KMM_VERSION={}", config.general.version);

    generate_config_code(&config);
}

fn validate(config: &KernelConfig) {
    assert!(config.memory.page_size.is_power_of_two(), "page_size 必须是 2 的幂");
    assert!(config.memory.max_order <= 20, "max_order 过大");
    assert!(config.slab.cpu_cache_batch <= config.slab.cpu_cache_limit, "batch 不能超过 limit");
    assert!(config.paging.high_threshold <= config.paging.low_threshold, "high 阈值必须 <= low 阈值");
    assert!(config.swap.max_files <= 32, "swap 文件索引只有 5 位");
    assert!(
        matches!(config.paging.replacement.as_str(), "lru" | "clock" | "fifo" | "random"),
        "未知的页面置换算法"
    );
}

fn generate_config_code(config: &KernelConfig) {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR"));

    let replacement = match config.paging.replacement.as_str() {
        "clock" => "Clock",
        "fifo" => "Fifo",
        "random" => "Random",
        _ => "Lru",
    };

    let code = format!(
        r#"//! kmm 内存管理配置（自动生成）
//!
//! 此文件由 build.rs 根据 Kernel.toml 自动生成，请勿手动修改

// ============================================================
// 基本信息
// ============================================================

/// 名称
pub const KMM_NAME: &str = "{name}";

/// 版本
pub const KMM_VERSION: &str = "{version}";

// ============================================================
// 内存配置
// ============================================================

/// 页大小
pub const PAGE_SIZE: usize = {page_size};

/// 页大小位移
pub const PAGE_SHIFT: usize = {page_shift};

/// 伙伴系统最大 order
pub const MAX_ORDER: usize = {max_order};

/// 最大CPU数量
pub const MAX_CPUS: usize = {max_cpus};

// ============================================================
// 默认区域布局（页帧号）
// ============================================================

pub const ZONE_DMA_START: usize = {dma_start:#x};
pub const ZONE_DMA_END: usize = {dma_end:#x};
pub const ZONE_NORMAL_START: usize = {normal_start:#x};
pub const ZONE_NORMAL_END: usize = {normal_end:#x};
pub const ZONE_HIGHMEM_START: usize = {high_start:#x};
pub const ZONE_HIGHMEM_END: usize = {high_end:#x};

// ============================================================
// Slab 配置
// ============================================================

/// 最大缓存数量
pub const SLAB_MAX_CACHES: usize = {max_caches};

/// 最小对象对齐
pub const SLAB_MIN_ALIGN: usize = {min_align};

/// 每CPU缓存容量
pub const SLAB_CPU_CACHE_LIMIT: usize = {cpu_limit};

/// 每CPU缓存批量传输数
pub const SLAB_CPU_CACHE_BATCH: usize = {cpu_batch};

/// 着色对齐（缓存行）
pub const SLAB_COLOUR_ALIGN: usize = {colour_align};

/// 最大着色数
pub const SLAB_MAX_COLOUR: usize = {max_colour};

// ============================================================
// 交换配置
// ============================================================

/// 最大交换文件数
pub const SWAP_MAX_FILES: usize = {swap_files};

/// 每个交换文件的最大块数
pub const SWAP_BLOCKS_PER_FILE: usize = {swap_blocks};

// ============================================================
// 压缩配置
// ============================================================

/// 最大压缩池数量
pub const COMPRESSION_MAX_POOLS: usize = {max_pools};

/// 最小压缩率（百分比，超过则拒绝）
pub const COMPRESSION_MIN_RATIO: u32 = {min_ratio};

/// 单页压缩时间上限（微秒）
pub const COMPRESSION_MAX_TIME_US: u64 = {max_time};

/// 默认压缩池页数
pub const COMPRESSION_DEFAULT_POOL_PAGES: usize = {pool_pages};

// ============================================================
// NUMA 配置
// ============================================================

/// 最大 NUMA 节点数
pub const NUMA_MAX_NODES: usize = {max_nodes};

/// 每CPU本地对象缓存容量
pub const NUMA_LOCAL_CACHE_LIMIT: usize = {local_limit};

/// 每CPU远端对象缓存容量
pub const NUMA_REMOTE_CACHE_LIMIT: usize = {remote_limit};

/// 本地节点距离
pub const NUMA_DISTANCE_LOCAL: u8 = {dist_local};

/// 默认远端节点距离
pub const NUMA_DISTANCE_REMOTE: u8 = {dist_remote};

// ============================================================
// 换页配置
// ============================================================

/// 低内存阈值（空闲百分比）
pub const PAGING_LOW_THRESHOLD: usize = {low};

/// 高内存压力阈值（空闲百分比）
pub const PAGING_HIGH_THRESHOLD: usize = {high};

/// 激进回收页数
pub const PAGING_AGGRESSIVE_RECLAIM: usize = {aggressive};

/// 温和回收页数
pub const PAGING_GENTLE_RECLAIM: usize = {gentle};

/// 抖动检测窗口（微秒）
pub const PAGING_THRASH_WINDOW_US: u64 = {thrash};

/// 默认页面置换算法
pub const PAGING_DEFAULT_REPLACEMENT: crate::mm::reclaim::ReplacementPolicy =
    crate::mm::reclaim::ReplacementPolicy::{replacement};
"#,
        name = config.general.name,
        version = config.general.version,
        page_size = config.memory.page_size,
        page_shift = config.memory.page_size.trailing_zeros(),
        max_order = config.memory.max_order,
        max_cpus = config.memory.max_cpus,
        dma_start = config.zones.dma_start,
        dma_end = config.zones.dma_end,
        normal_start = config.zones.normal_start,
        normal_end = config.zones.normal_end,
        high_start = config.zones.highmem_start,
        high_end = config.zones.highmem_end,
        max_caches = config.slab.max_caches,
        min_align = config.slab.min_align,
        cpu_limit = config.slab.cpu_cache_limit,
        cpu_batch = config.slab.cpu_cache_batch,
        colour_align = config.slab.colour_align,
        max_colour = config.slab.max_colour,
        swap_files = config.swap.max_files,
        swap_blocks = config.swap.blocks_per_file,
        max_pools = config.compression.max_pools,
        min_ratio = config.compression.min_ratio,
        max_time = config.compression.max_time_us,
        pool_pages = config.compression.default_pool_pages,
        max_nodes = config.numa.max_nodes,
        local_limit = config.numa.local_cache_limit,
        remote_limit = config.numa.remote_cache_limit,
        dist_local = config.numa.distance_local,
        dist_remote = config.numa.distance_remote,
        low = config.paging.low_threshold,
        high = config.paging.high_threshold,
        aggressive = config.paging.aggressive_reclaim,
        gentle = config.paging.gentle_reclaim,
        thrash = config.paging.thrash_window_us,
        replacement = replacement,
    );

    let config_path = manifest_dir.join("src").join("config.rs");
    // 内容未变化时不重写，避免触发无意义的重新编译
    if fs::read_to_string(&config_path).map(|old| old == code).unwrap_or(false) {
        return;
    }
    fs::write(&config_path, code).expect("无法写入 src/config.rs");
}
