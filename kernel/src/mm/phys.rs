//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 物理内存内容访问
//!
//! 分配器核心本身只处理页帧号；需要读写页帧内容的地方
//! （slab 空闲链表、压缩、交换 I/O、COW 复制）统一通过 `PhysMem`。
//!
//! 这里用稀疏的页帧表模拟物理内存：从未写过的页帧读出全零，
//! 页帧释放回伙伴系统时其内容被丢弃。

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use spin::Mutex;

use super::page::{PhysAddr, Pfn, PAGE_SIZE};

type Frame = Box<[u8; PAGE_SIZE]>;

pub struct PhysMem {
    frames: Mutex<BTreeMap<Pfn, Frame>>,
}

impl PhysMem {
    pub const fn new() -> Self {
        Self {
            frames: Mutex::new(BTreeMap::new()),
        }
    }

    /// 读取任意长度（可跨页）
    pub fn read(&self, addr: PhysAddr, buf: &mut [u8]) {
        let frames = self.frames.lock();
        let mut done = 0;
        while done < buf.len() {
            let pa = addr.add(done);
            let off = pa.page_offset();
            let n = (PAGE_SIZE - off).min(buf.len() - done);
            match frames.get(&pa.pfn()) {
                Some(frame) => buf[done..done + n].copy_from_slice(&frame[off..off + n]),
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
    }

    /// 写入任意长度（可跨页）
    pub fn write(&self, addr: PhysAddr, data: &[u8]) {
        let mut frames = self.frames.lock();
        let mut done = 0;
        while done < data.len() {
            let pa = addr.add(done);
            let off = pa.page_offset();
            let n = (PAGE_SIZE - off).min(data.len() - done);
            let frame = frames
                .entry(pa.pfn())
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
            frame[off..off + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
    }

    /// 填充字节
    pub fn fill(&self, addr: PhysAddr, len: usize, byte: u8) {
        let mut frames = self.frames.lock();
        let mut done = 0;
        while done < len {
            let pa = addr.add(done);
            let off = pa.page_offset();
            let n = (PAGE_SIZE - off).min(len - done);
            if byte == 0 && off == 0 && n == PAGE_SIZE {
                frames.remove(&pa.pfn());
            } else {
                let frame = frames
                    .entry(pa.pfn())
                    .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
                frame[off..off + n].fill(byte);
            }
            done += n;
        }
    }

    pub fn read_u32(&self, addr: PhysAddr) -> u32 {
        let mut b = [0u8; 4];
        self.read(addr, &mut b);
        u32::from_le_bytes(b)
    }

    pub fn write_u32(&self, addr: PhysAddr, val: u32) {
        self.write(addr, &val.to_le_bytes());
    }

    /// 读取整页
    pub fn read_frame(&self, pfn: Pfn, buf: &mut [u8; PAGE_SIZE]) {
        match self.frames.lock().get(&pfn) {
            Some(frame) => buf.copy_from_slice(&frame[..]),
            None => buf.fill(0),
        }
    }

    /// 写入整页
    pub fn write_frame(&self, pfn: Pfn, data: &[u8; PAGE_SIZE]) {
        let mut frames = self.frames.lock();
        match frames.get_mut(&pfn) {
            Some(frame) => frame.copy_from_slice(data),
            None => {
                frames.insert(pfn, Box::new(*data));
            }
        }
    }

    /// 复制整页内容
    pub fn copy_frame(&self, src: Pfn, dst: Pfn) {
        let mut frames = self.frames.lock();
        match frames.get(&src) {
            Some(frame) => {
                let copy: Frame = frame.clone();
                frames.insert(dst, copy);
            }
            None => {
                frames.remove(&dst);
            }
        }
    }

    /// 清零连续页帧
    pub fn zero_frames(&self, pfn: Pfn, count: usize) {
        let mut frames = self.frames.lock();
        for p in pfn..pfn + count {
            frames.remove(&p);
        }
    }

    /// 丢弃页帧内容（释放回伙伴系统时调用）
    #[inline]
    pub fn discard(&self, pfn: Pfn, count: usize) {
        self.zero_frames(pfn, count);
    }

    /// 当前持有内容的页帧数
    pub fn populated_frames(&self) -> usize {
        self.frames.lock().len()
    }
}

impl Default for PhysMem {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_across_pages() {
        let mem = PhysMem::new();
        let addr = PhysAddr::from_pfn(7).add(PAGE_SIZE - 2);
        mem.write(addr, &[1, 2, 3, 4]);

        let mut buf = [0u8; 4];
        mem.read(addr, &mut buf);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(mem.populated_frames(), 2);

        mem.discard(7, 2);
        mem.read(addr, &mut buf);
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn test_copy_frame() {
        let mem = PhysMem::new();
        mem.write_u32(PhysAddr::from_pfn(1), 0xdead_beef);
        mem.copy_frame(1, 2);
        assert_eq!(mem.read_u32(PhysAddr::from_pfn(2)), 0xdead_beef);

        mem.fill(PhysAddr::from_pfn(2), PAGE_SIZE, 0);
        assert_eq!(mem.read_u32(PhysAddr::from_pfn(2)), 0);
    }
}
