//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 内存管理错误类型

use crate::errno::Errno;

/// 压缩被拒绝的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// 压缩率不达标
    Ratio,
    /// 压缩超时
    Timeout,
    /// 输出不小于输入
    Incompressible,
    /// 池已满且无法腾出空间
    PoolFull,
    /// 压缩功能或该池已禁用
    Disabled,
}

/// 内存管理核心的统一错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MmError {
    /// 参数错误（大小、对齐、空 VMA 等）
    #[error("invalid argument")]
    InvalidArgument,
    /// 资源耗尽（伙伴/slab/压缩容量）
    #[error("out of memory")]
    OutOfMemory,
    /// 对象不存在（未映射地址、缓存、交换项）
    #[error("not found")]
    NotFound,
    /// 访问权限不足
    #[error("permission denied")]
    PermissionDenied,
    /// 地址不属于任何 VMA
    #[error("bad address")]
    BadAddress,
    /// NUMA 策略无法满足（如 Local/Bind 节点耗尽）
    #[error("numa policy unsatisfiable")]
    PolicyUnsatisfiable,
    /// 资源仍在使用
    #[error("resource busy")]
    Busy,
    /// 对象已存在
    #[error("already exists")]
    Exists,
    /// 块设备 I/O 失败
    #[error("block device i/o error")]
    Io,
    /// 没有可用的交换槽
    #[error("no swap space")]
    NoSwapSpace,
    /// 压缩缓存拒绝存储
    #[error("compression rejected: {0:?}")]
    CompressionRejected(RejectReason),
    /// 结构损坏（魔数校验失败）
    #[error("structure corrupted")]
    Corrupted,
}

impl MmError {
    /// 转换为系统调用风格的负错误码
    #[inline]
    pub fn as_neg_i32(self) -> i32 {
        Errno::from(self).as_neg_i32()
    }
}

pub type MmResult<T> = Result<T, MmError>;

/// 结构魔数校验失败：记录并停机
#[cold]
pub(crate) fn corruption(what: &str, found: u32, expected: u32) -> ! {
    log::error!("{}: bad magic {:#x} (expected {:#x})", what, found, expected);
    panic!("memory corruption detected in {}", what);
}
