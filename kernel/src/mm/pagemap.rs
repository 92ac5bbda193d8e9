//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 页表接口
//!
//! 内存管理核心通过 `PageTable` 回调修改进程页表，真正的页表由 arch 层实现。
//! 每个用户页的状态用 `Pte` 表示：
//! - `Present`：驻留在物理页帧上
//! - `Swapped`：内容在交换区
//! - `Compressed`：内容在压缩池
//!
//! 一页不会同时处于换出和压缩状态。
//!
//! `SoftPageTable` 是基于 BTreeMap 的软件实现，供测试和模拟环境使用。

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::page::{Pfn, Vpn};
use super::swap::SwapEntry;
use super::vma::VmaError;
use crate::error::MmError;

impl From<VmaError> for MmError {
    fn from(err: VmaError) -> Self {
        match err {
            VmaError::Overlap => MmError::Exists,
            VmaError::NotFound => MmError::BadAddress,
            VmaError::Invalid => MmError::InvalidArgument,
        }
    }
}

/// 页权限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Perm {
    /// 无访问
    None = 0,
    /// 只读
    Read = 1,
    /// 读写
    ReadWrite = 2,
    /// 读写执行
    ReadWriteExec = 3,
}

impl Perm {
    #[inline]
    pub fn readable(&self) -> bool {
        *self != Perm::None
    }

    #[inline]
    pub fn writable(&self) -> bool {
        matches!(self, Perm::ReadWrite | Perm::ReadWriteExec)
    }

    /// 去掉写权限
    pub fn read_only(&self) -> Perm {
        match self {
            Perm::None => Perm::None,
            _ => Perm::Read,
        }
    }
}

/// 页表项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pte {
    Present {
        pfn: Pfn,
        perm: Perm,
        /// 写时复制共享，写入需要先经过 COW 处理
        cow: bool,
        /// 属于共享内存段，不参与回收
        shm: bool,
    },
    Swapped(SwapEntry),
    /// 压缩池编号
    Compressed(usize),
}

impl Pte {
    #[inline]
    pub fn is_present(&self) -> bool {
        matches!(self, Pte::Present { .. })
    }

    pub fn pfn(&self) -> Option<Pfn> {
        match self {
            Pte::Present { pfn, .. } => Some(*pfn),
            _ => None,
        }
    }
}

/// 页表回调
pub trait PageTable: Send {
    /// 建立或替换映射，返回旧的表项
    fn map(&mut self, vpn: Vpn, pte: Pte) -> Option<Pte>;

    fn unmap(&mut self, vpn: Vpn) -> Option<Pte>;

    /// 修改驻留页的权限，非驻留页返回 false
    fn protect(&mut self, vpn: Vpn, perm: Perm) -> bool;

    fn lookup(&self, vpn: Vpn) -> Option<Pte>;

    /// 按虚拟页号升序列出 [start, end) 内的表项
    fn entries(&self, start: Vpn, end: Vpn) -> Vec<(Vpn, Pte)>;
}

/// 软件页表
#[derive(Debug, Default)]
pub struct SoftPageTable {
    ptes: BTreeMap<Vpn, Pte>,
}

impl SoftPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ptes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ptes.is_empty()
    }
}

impl PageTable for SoftPageTable {
    fn map(&mut self, vpn: Vpn, pte: Pte) -> Option<Pte> {
        self.ptes.insert(vpn, pte)
    }

    fn unmap(&mut self, vpn: Vpn) -> Option<Pte> {
        self.ptes.remove(&vpn)
    }

    fn protect(&mut self, vpn: Vpn, new_perm: Perm) -> bool {
        match self.ptes.get_mut(&vpn) {
            Some(Pte::Present { perm, .. }) => {
                *perm = new_perm;
                true
            }
            _ => false,
        }
    }

    fn lookup(&self, vpn: Vpn) -> Option<Pte> {
        self.ptes.get(&vpn).copied()
    }

    fn entries(&self, start: Vpn, end: Vpn) -> Vec<(Vpn, Pte)> {
        if start >= end {
            return Vec::new();
        }
        self.ptes.range(start..end).map(|(k, v)| (*k, *v)).collect()
    }
}
