//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 内存管理模块

pub mod list;
pub mod page;
pub mod phys;
pub mod gfp;
pub mod zone;
pub mod buddy;
pub mod slab;
pub mod kmalloc;
pub mod numa;
pub mod swap;
pub mod reclaim;
pub mod compress;
pub mod cow;
pub mod vma;
pub mod pagemap;
pub mod address_space;
pub mod fault;
pub mod shm;
pub mod meminfo;
pub mod setup;
pub mod manager;

pub use page::*;
pub use gfp::GfpFlags;
pub use zone::ZoneType;
pub use buddy::{BuddyAllocator, FrameProvider};
pub use numa::NumaPolicy;
pub use reclaim::ReplacementPolicy;
pub use compress::CompressionAlgorithm;
pub use setup::MmConfig;
pub use manager::{global, init_global, MemoryManager};

/// 用户 mmap 区域默认起始地址
pub const USER_VIRT_BASE: usize = 0x0000_0000_1000_0000;
/// 用户地址空间上限
pub const USER_VIRT_TOP: usize = 0x0000_0000_7fff_f000;
