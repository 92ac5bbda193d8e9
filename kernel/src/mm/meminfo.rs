//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 内存统计
//!
//! 提供类似 /proc/meminfo 的内存统计快照。
//!
//! # 统计内容
//! - 物理页（伙伴系统，含 NUMA 每 CPU 缓存）
//! - Slab 与 kmalloc 大块
//! - 活跃 / 非活跃链表
//! - 交换区、压缩缓存
//! - COW 共享页、共享内存段
//! - 缺页计数

use serde::Serialize;

use super::manager::MemoryManager;
use super::PAGE_SIZE;

/// 内存统计信息（类似 /proc/meminfo），大小单位为字节
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryInfo {
    // ========== 物理内存 ==========
    pub mem_total: usize,
    pub mem_free: usize,
    /// 空闲 + 非活跃页 + 空 slab 可回收页的估计
    pub mem_available: usize,
    pub mem_used: usize,

    // ========== Slab / kmalloc ==========
    pub slab_pages: usize,
    pub slab_objects: usize,
    pub kmalloc_large_pages: usize,

    // ========== 回收链表 ==========
    pub active_pages: usize,
    pub inactive_pages: usize,
    /// 用户私有驻留页
    pub anon_pages: usize,

    // ========== 交换 / 压缩 ==========
    pub swap_total: usize,
    pub swap_free: usize,
    pub compressed_pages: usize,
    pub compressed_bytes: usize,

    // ========== 共享 ==========
    pub cow_shared_pages: usize,
    pub shm_segments: usize,
    pub shm_pages: usize,

    // ========== 缺页 ==========
    pub page_faults: u64,
    pub major_faults: u64,
    pub oom_kills: u64,
}

impl MemoryInfo {
    /// 格式化为人类可读字符串
    pub fn format(&self) -> MemoryInfoFormatter<'_> {
        MemoryInfoFormatter { info: self }
    }

    /// 内存压力 0..=100：已用比例，交换区用量过半时再加权
    pub fn pressure(&self) -> u8 {
        if self.mem_total == 0 {
            return 0;
        }
        let used = (self.mem_total - self.mem_available.min(self.mem_total)) * 100 / self.mem_total;
        let swap_used = if self.swap_total > 0 {
            (self.swap_total - self.swap_free) * 100 / self.swap_total
        } else {
            0
        };
        let bonus = if swap_used > 50 { (swap_used - 50) / 5 } else { 0 };
        (used + bonus).min(100) as u8
    }

    /// 空闲内存少于 5%
    pub fn is_memory_low(&self) -> bool {
        self.mem_total > 0 && self.mem_free * 100 / self.mem_total < 5
    }

    /// 空闲内存少于 1% 且没有可回收页
    pub fn should_trigger_oom(&self) -> bool {
        self.mem_total > 0 && self.mem_free * 100 / self.mem_total < 1 && self.inactive_pages + self.active_pages == 0
    }
}

/// 内存信息格式化器
pub struct MemoryInfoFormatter<'a> {
    info: &'a MemoryInfo,
}

impl<'a> core::fmt::Display for MemoryInfoFormatter<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let i = self.info;
        writeln!(f, "Memory Info:")?;
        writeln!(f, "  MemTotal:       {:>10} kB ({} MB)", i.mem_total / 1024, i.mem_total / 1024 / 1024)?;
        writeln!(f, "  MemFree:        {:>10} kB ({} MB)", i.mem_free / 1024, i.mem_free / 1024 / 1024)?;
        writeln!(f, "  MemAvailable:   {:>10} kB ({} MB)", i.mem_available / 1024, i.mem_available / 1024 / 1024)?;
        writeln!(f, "  MemUsed:        {:>10} kB ({} MB)", i.mem_used / 1024, i.mem_used / 1024 / 1024)?;
        writeln!(f)?;
        writeln!(f, "  Active:         {:>10} kB", i.active_pages * PAGE_SIZE / 1024)?;
        writeln!(f, "  Inactive:       {:>10} kB", i.inactive_pages * PAGE_SIZE / 1024)?;
        writeln!(f, "  AnonPages:      {:>10} kB", i.anon_pages * PAGE_SIZE / 1024)?;
        writeln!(f)?;
        writeln!(f, "  Slab:           {:>10} kB ({} objects)", i.slab_pages * PAGE_SIZE / 1024, i.slab_objects)?;
        writeln!(f, "  KmallocLarge:   {:>10} kB", i.kmalloc_large_pages * PAGE_SIZE / 1024)?;
        writeln!(f)?;
        writeln!(f, "  SwapTotal:      {:>10} kB", i.swap_total / 1024)?;
        writeln!(f, "  SwapFree:       {:>10} kB", i.swap_free / 1024)?;
        writeln!(f, "  Compressed:     {:>10} pages ({} kB stored)", i.compressed_pages, i.compressed_bytes / 1024)?;
        writeln!(f)?;
        writeln!(f, "  CowShared:      {:>10} pages", i.cow_shared_pages)?;
        writeln!(f, "  Shmem:          {:>10} pages ({} segments)", i.shm_pages, i.shm_segments)?;
        writeln!(f)?;
        writeln!(f, "  PageFaults:     {:>10} ({} major)", i.page_faults, i.major_faults)?;
        writeln!(f, "  OomKills:       {:>10}", i.oom_kills)?;
        write!(f, "  Pressure:       {:>10}%", i.pressure())
    }
}

impl MemoryManager {
    /// 获取完整的内存统计信息
    pub fn memory_info(&self) -> MemoryInfo {
        let total = self.numa.total_pages();
        let free = self.numa.nr_free_pages();
        let slab = self.slab.stats();
        let reclaim = self.reclaim.stats();
        let swap = self.swap.stats();
        let comp = self.compress.stats();
        let paging = self.paging.snapshot();
        let anon: usize = self.spaces.read().values().map(|s| s.rss()).sum();
        let reclaimable = reclaim.inactive_pages + self.slab.empty_slab_pages();

        MemoryInfo {
            mem_total: total * PAGE_SIZE,
            mem_free: free * PAGE_SIZE,
            mem_available: (free + reclaimable).min(total) * PAGE_SIZE,
            mem_used: total.saturating_sub(free) * PAGE_SIZE,
            slab_pages: slab.slab_pages as usize,
            slab_objects: slab.allocated_objects as usize,
            kmalloc_large_pages: self.kmalloc.large_pages(),
            active_pages: reclaim.active_pages,
            inactive_pages: reclaim.inactive_pages,
            anon_pages: anon,
            swap_total: swap.total_pages * PAGE_SIZE,
            swap_free: swap.free_pages * PAGE_SIZE,
            compressed_pages: comp.compressed_pages,
            compressed_bytes: comp.used_bytes,
            cow_shared_pages: self.cow.stats().shared_pages,
            shm_segments: self.shm.nr_segments(),
            shm_pages: self.shm.resident_pages(),
            page_faults: paging.page_faults,
            major_faults: paging.major_faults,
            oom_kills: paging.oom_kills,
        }
    }

    /// 内存压力 0..=100
    pub fn memory_pressure(&self) -> u8 {
        self.memory_info().pressure()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_pressure() {
        let mut info = MemoryInfo {
            mem_total: 100 * PAGE_SIZE,
            mem_free: 40 * PAGE_SIZE,
            mem_available: 50 * PAGE_SIZE,
            ..Default::default()
        };
        assert_eq!(info.pressure(), 50);
        assert!(!info.is_memory_low());

        info.swap_total = 100;
        info.swap_free = 0;
        assert_eq!(info.pressure(), 60);

        info.mem_available = 0;
        assert_eq!(info.pressure(), 100);
        assert_eq!(MemoryInfo::default().pressure(), 0);
    }

    #[test]
    fn test_format() {
        let info = MemoryInfo {
            mem_total: 8 * 1024 * 1024,
            mem_free: 2 * 1024 * 1024,
            ..Default::default()
        };
        let s = info.format().to_string();
        assert!(s.contains("MemTotal:             8192 kB (8 MB)"));
        assert!(s.contains("MemFree:              2048 kB (2 MB)"));
        assert!(s.ends_with("%"));
    }
}
