//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 平台接口
//!
//! 内存管理核心只需要平台提供两样东西：当前 CPU 编号和单调时钟。
//! 真实内核由 arch 层实现；`SimPlatform` 用于宿主机测试和模拟环境。

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// 平台钩子
pub trait Platform: Send + Sync {
    /// 当前 CPU 编号
    fn current_cpu(&self) -> usize;

    /// 单调时钟（微秒）
    fn now_us(&self) -> u64;
}

/// 模拟平台
///
/// - CPU 编号可以由测试显式切换
/// - 时钟每次读取前进 `tick_us` 微秒，保证时间戳严格递增
pub struct SimPlatform {
    cpu: AtomicUsize,
    clock: AtomicU64,
    tick_us: AtomicU64,
}

impl SimPlatform {
    pub const fn new() -> Self {
        Self {
            cpu: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            tick_us: AtomicU64::new(1),
        }
    }

    /// 切换当前 CPU
    pub fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::Release);
    }

    /// 设置每次读取时钟的步进
    pub fn set_tick(&self, tick_us: u64) {
        self.tick_us.store(tick_us, Ordering::Release);
    }

    /// 手动推进时钟
    pub fn advance(&self, us: u64) {
        self.clock.fetch_add(us, Ordering::AcqRel);
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for SimPlatform {
    fn current_cpu(&self) -> usize {
        self.cpu.load(Ordering::Acquire)
    }

    fn now_us(&self) -> u64 {
        let tick = self.tick_us.load(Ordering::Acquire);
        self.clock.fetch_add(tick, Ordering::AcqRel) + tick
    }
}
