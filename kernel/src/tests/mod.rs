//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 端到端测试
//!
//! 每个文件覆盖一个子系统，通过 `MemoryManager` 的公开接口驱动。
//! 宿主机上运行：
//! ```bash
//! cargo test --package kmm
//! ```

use alloc::sync::Arc;

use crate::mm::setup::MmConfig;
use crate::mm::MemoryManager;
use crate::platform::SimPlatform;

pub mod slab;
pub mod mem_mmap;
pub mod compression;
pub mod numa;
pub mod shm;

/// 测试内存的起始页帧号
pub const BASE_PFN: usize = 0x100;

/// 单节点、零水位的小内存管理器
pub fn mm(pages: usize) -> MemoryManager {
    mm_with(MmConfig::single_node(BASE_PFN, pages).with_zero_watermarks()).0
}

/// 按给定配置构造，同时返回模拟平台以便控制时钟和 CPU
pub fn mm_with(cfg: MmConfig) -> (MemoryManager, Arc<SimPlatform>) {
    let platform = Arc::new(SimPlatform::new());
    let mm = MemoryManager::new(cfg, platform.clone()).unwrap();
    (mm, platform)
}

/// 页面 i 的测试图案
pub fn pattern(i: usize) -> u32 {
    0x5a5a_0000 ^ (i as u32).wrapping_mul(2_654_435_761)
}
