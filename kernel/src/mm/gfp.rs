//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! GFP (Get Free Page) 分配标志
//!
//! 决定两件事：
//! - 区域偏好顺序（先尝试哪个 zone，失败后回退到哪些 zone）
//! - 水位档位（请求的紧急程度）

use bitflags::bitflags;

use super::zone::{WatermarkTier, ZoneType};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GfpFlags: u32 {
        /// 普通内核分配
        const KERNEL = 0x01;
        /// 原子上下文，可以用到 min 水位
        const ATOMIC = 0x02;
        /// 用户页
        const USER = 0x04;
        /// 需要 DMA 区域
        const DMA = 0x08;
        /// 不等待、不回退到其他区域
        const NOWAIT = 0x10;
        /// 返回前清零
        const ZERO = 0x20;
    }
}

const KERNEL_ZONES: [ZoneType; 4] = [
    ZoneType::Normal,
    ZoneType::Dma,
    ZoneType::HighMem,
    ZoneType::Movable,
];

const DMA_ZONES: [ZoneType; 4] = [
    ZoneType::Dma,
    ZoneType::Normal,
    ZoneType::HighMem,
    ZoneType::Movable,
];

const USER_ZONES: [ZoneType; 4] = [
    ZoneType::HighMem,
    ZoneType::Normal,
    ZoneType::Movable,
    ZoneType::Dma,
];

impl GfpFlags {
    /// 区域偏好顺序，第一个是首选区域
    pub fn zonelist(&self) -> &'static [ZoneType] {
        if self.contains(GfpFlags::DMA) {
            &DMA_ZONES
        } else if self.contains(GfpFlags::USER) {
            &USER_ZONES
        } else {
            // KERNEL 与 ATOMIC 共用
            &KERNEL_ZONES
        }
    }

    /// 水位档位
    pub fn watermark_tier(&self) -> WatermarkTier {
        if self.contains(GfpFlags::ATOMIC) {
            WatermarkTier::Min
        } else if self.contains(GfpFlags::NOWAIT) {
            WatermarkTier::Low
        } else {
            WatermarkTier::High
        }
    }

    #[inline]
    pub fn allows_fallback(&self) -> bool {
        !self.contains(GfpFlags::NOWAIT)
    }
}

impl Default for GfpFlags {
    fn default() -> Self {
        GfpFlags::KERNEL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zonelists() {
        assert_eq!(GfpFlags::KERNEL.zonelist()[0], ZoneType::Normal);
        assert_eq!(GfpFlags::ATOMIC.zonelist()[0], ZoneType::Normal);
        assert_eq!(GfpFlags::DMA.zonelist()[0], ZoneType::Dma);
        assert_eq!(GfpFlags::USER.zonelist()[0], ZoneType::HighMem);
        assert_eq!(GfpFlags::USER.zonelist()[3], ZoneType::Dma);
    }

    #[test]
    fn test_watermark_tier() {
        assert_eq!(GfpFlags::ATOMIC.watermark_tier(), WatermarkTier::Min);
        assert_eq!(GfpFlags::NOWAIT.watermark_tier(), WatermarkTier::Low);
        assert_eq!(GfpFlags::KERNEL.watermark_tier(), WatermarkTier::High);
        assert!(!(GfpFlags::KERNEL | GfpFlags::NOWAIT).allows_fallback());
    }
}
