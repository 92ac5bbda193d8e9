//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 系统调用错误码
//!
//! mmap / munmap / mprotect / shm* 只会返回下面这几种，
//! 数值与 include/uapi/asm-generic/errno-base.h 一致。
//!
//! ```rust
//! use kmm::errno::Errno;
//! use kmm::MmError;
//!
//! assert_eq!(MmError::OutOfMemory.as_neg_i32(), -12);
//! assert_eq!(Errno::from(MmError::Busy).name(), "EBUSY");
//! ```

use crate::error::MmError;

#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Errno {
    ENOENT = 2,
    EIO = 5,
    EAGAIN = 11,
    ENOMEM = 12,
    EACCES = 13,
    EFAULT = 14,
    EBUSY = 16,
    EEXIST = 17,
    EINVAL = 22,
    ENOSPC = 28,
}

impl Errno {
    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// 系统调用返回值（负数）
    #[inline]
    pub const fn as_neg_i32(self) -> i32 {
        -self.code()
    }

    /// 以 usize 形式返回给用户态，与寄存器宽度一致
    #[inline]
    pub const fn as_ret(self) -> usize {
        self.as_neg_i32() as isize as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Errno::ENOENT => "ENOENT",
            Errno::EIO => "EIO",
            Errno::EAGAIN => "EAGAIN",
            Errno::ENOMEM => "ENOMEM",
            Errno::EACCES => "EACCES",
            Errno::EFAULT => "EFAULT",
            Errno::EBUSY => "EBUSY",
            Errno::EEXIST => "EEXIST",
            Errno::EINVAL => "EINVAL",
            Errno::ENOSPC => "ENOSPC",
        }
    }
}

impl From<MmError> for Errno {
    fn from(err: MmError) -> Self {
        match err {
            MmError::InvalidArgument => Errno::EINVAL,
            // 策略无法满足对用户态来说就是内存不足
            MmError::OutOfMemory | MmError::PolicyUnsatisfiable => Errno::ENOMEM,
            MmError::NotFound => Errno::ENOENT,
            MmError::PermissionDenied => Errno::EACCES,
            MmError::BadAddress | MmError::Corrupted => Errno::EFAULT,
            MmError::Busy => Errno::EBUSY,
            MmError::Exists => Errno::EEXIST,
            MmError::Io => Errno::EIO,
            MmError::NoSwapSpace => Errno::ENOSPC,
            MmError::CompressionRejected(_) => Errno::EAGAIN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectReason;

    #[test]
    fn test_codes() {
        assert_eq!(Errno::ENOENT.code(), 2);
        assert_eq!(Errno::ENOMEM.code(), 12);
        assert_eq!(Errno::EINVAL.as_neg_i32(), -22);
        assert_eq!(Errno::EFAULT.as_ret(), usize::MAX - 13);
    }

    #[test]
    fn test_mm_error_mapping() {
        assert_eq!(Errno::from(MmError::PolicyUnsatisfiable), Errno::ENOMEM);
        assert_eq!(Errno::from(MmError::Exists), Errno::EEXIST);
        assert_eq!(
            Errno::from(MmError::CompressionRejected(RejectReason::Ratio)).name(),
            "EAGAIN"
        );
        assert_eq!(MmError::NoSwapSpace.as_neg_i32(), -28);
    }
}
