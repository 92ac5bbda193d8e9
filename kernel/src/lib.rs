//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! kmm - 内核内存管理核心
//!
//! 分层结构（自底向上）：
//! - 区域 / 页帧模型（mm::zone）
//! - 伙伴系统（mm::buddy）
//! - Slab 分配器与 kmalloc（mm::slab, mm::kmalloc）
//! - NUMA 策略层（mm::numa）
//! - 请求调页与交换（mm::fault, mm::reclaim, mm::swap）
//! - 压缩缓存（mm::compress）
//! - 写时复制（mm::cow）
//! - mmap / 共享内存接口（mm::manager, mm::shm）
//!
//! 宿主机测试时以 std 编译，其余情况下为 `no_std`。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod errno;
pub mod error;
pub mod mm;
pub mod platform;

#[cfg(test)]
mod tests;

pub use error::{MmError, MmResult};
pub use mm::manager::MemoryManager;
