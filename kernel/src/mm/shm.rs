//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 共享内存（System V shm 与 POSIX shm_open）
//!
//! 段的页帧在第一次缺页时分配，段销毁时统一释放。
//! IPC_RMID / shm_unlink 只打删除标记，最后一个挂接者离开后才真正销毁。
//! MAP_SHARED | MAP_ANONYMOUS 建立的段一开始就带删除标记，随映射消失。

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use serde::Serialize;
use spin::Mutex;

use super::address_space::SpaceId;
use super::manager::MemoryManager;
use super::page::{checked_page_align_up, Pfn, VirtAddr, PAGE_SIZE};
use super::vma::{Vma, VmaFlags, VmaType};
use crate::error::{MmError, MmResult};

pub const IPC_PRIVATE: i32 = 0;
pub const IPC_CREAT: u32 = 0x200;
pub const IPC_EXCL: u32 = 0x400;

pub const IPC_RMID: u32 = 0;
pub const IPC_SET: u32 = 1;
pub const IPC_STAT: u32 = 2;

pub const SHM_RDONLY: u32 = 0x1000;
pub const SHM_RND: u32 = 0x2000;

/// shm_open 的 O_CREAT / O_EXCL
pub const O_CREAT: u32 = 0x40;
pub const O_EXCL: u32 = 0x80;

/// 系统段数上限
pub const SHMMNI: usize = 4096;
/// 单段最大字节数
pub const SHMMAX: usize = 256 * 1024 * 1024;

struct Segment {
    key: i32,
    name: Option<String>,
    size: usize,
    pages: Vec<Option<Pfn>>,
    /// 地址空间 -> 挂接次数
    attaches: BTreeMap<SpaceId, usize>,
    marked_for_removal: bool,
    ctime: u64,
    atime: u64,
    dtime: u64,
}

impl Segment {
    fn nattch(&self) -> usize {
        self.attaches.values().sum()
    }

    fn take_frames(&mut self) -> Vec<Pfn> {
        self.pages.iter_mut().filter_map(|p| p.take()).collect()
    }
}

/// IPC_STAT 的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShmInfo {
    pub id: usize,
    pub key: i32,
    pub name: Option<String>,
    pub size: usize,
    pub nattch: usize,
    pub resident_pages: usize,
    pub marked_for_removal: bool,
    pub ctime: u64,
    pub atime: u64,
    pub dtime: u64,
}

#[derive(Default)]
struct ShmInner {
    segments: BTreeMap<usize, Segment>,
    keys: BTreeMap<i32, usize>,
    names: BTreeMap<String, usize>,
    next_id: usize,
}

impl ShmInner {
    fn create(&mut self, key: i32, name: Option<String>, size: usize, now: u64) -> MmResult<usize> {
        if size == 0 || size > SHMMAX {
            return Err(MmError::InvalidArgument);
        }
        if self.segments.len() >= SHMMNI {
            return Err(MmError::OutOfMemory);
        }
        let size = checked_page_align_up(size).ok_or(MmError::InvalidArgument)?;
        let id = self.next_id;
        self.next_id += 1;
        self.segments.insert(
            id,
            Segment {
                key,
                name,
                size,
                pages: alloc::vec![None; size / PAGE_SIZE],
                attaches: BTreeMap::new(),
                marked_for_removal: false,
                ctime: now,
                atime: 0,
                dtime: 0,
            },
        );
        Ok(id)
    }

    /// 满足销毁条件时移除段并交出页帧
    fn reap(&mut self, id: usize) -> Vec<Pfn> {
        let done = matches!(self.segments.get(&id), Some(s) if s.marked_for_removal && s.nattch() == 0);
        if !done {
            return Vec::new();
        }
        match self.segments.remove(&id) {
            Some(mut seg) => {
                if self.keys.get(&seg.key) == Some(&id) {
                    self.keys.remove(&seg.key);
                }
                if let Some(name) = seg.name.as_ref() {
                    if self.names.get(name) == Some(&id) {
                        self.names.remove(name);
                    }
                }
                log::debug!("shm: segment {} destroyed", id);
                seg.take_frames()
            }
            None => Vec::new(),
        }
    }
}

/// 共享内存段表
pub struct ShmManager {
    inner: Mutex<ShmInner>,
}

impl ShmManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ShmInner::default()),
        }
    }

    /// System V shmget
    pub fn shmget(&self, key: i32, size: usize, flags: u32, now: u64) -> MmResult<usize> {
        let mut inner = self.inner.lock();
        if key != IPC_PRIVATE {
            if let Some(&id) = inner.keys.get(&key) {
                if flags & (IPC_CREAT | IPC_EXCL) == IPC_CREAT | IPC_EXCL {
                    return Err(MmError::Exists);
                }
                let seg = inner.segments.get(&id).ok_or(MmError::NotFound)?;
                if size > seg.size {
                    return Err(MmError::InvalidArgument);
                }
                return Ok(id);
            }
            if flags & IPC_CREAT == 0 {
                return Err(MmError::NotFound);
            }
        }
        let id = inner.create(key, None, size, now)?;
        if key != IPC_PRIVATE {
            inner.keys.insert(key, id);
        }
        log::debug!("shm: shmget key {:#x} size {:#x} -> {}", key, size, id);
        Ok(id)
    }

    /// POSIX shm_open；已存在的段忽略 size
    pub fn shm_open(&self, name: &str, size: usize, flags: u32, now: u64) -> MmResult<usize> {
        if name.is_empty() {
            return Err(MmError::InvalidArgument);
        }
        let mut inner = self.inner.lock();
        if let Some(&id) = inner.names.get(name) {
            if flags & (O_CREAT | O_EXCL) == O_CREAT | O_EXCL {
                return Err(MmError::Exists);
            }
            return Ok(id);
        }
        if flags & O_CREAT == 0 {
            return Err(MmError::NotFound);
        }
        let id = inner.create(IPC_PRIVATE, Some(name.to_string()), size, now)?;
        inner.names.insert(name.to_string(), id);
        log::debug!("shm: shm_open {:?} size {:#x} -> {}", name, size, id);
        Ok(id)
    }

    /// 删除名字；返回需要释放的页帧
    pub fn shm_unlink(&self, name: &str) -> MmResult<Vec<Pfn>> {
        let mut inner = self.inner.lock();
        let id = inner.names.remove(name).ok_or(MmError::NotFound)?;
        if let Some(seg) = inner.segments.get_mut(&id) {
            seg.marked_for_removal = true;
        }
        Ok(inner.reap(id))
    }

    /// MAP_SHARED | MAP_ANONYMOUS 背后的匿名段
    pub fn create_anonymous(&self, size: usize, now: u64) -> MmResult<usize> {
        let mut inner = self.inner.lock();
        let id = inner.create(IPC_PRIVATE, None, size, now)?;
        if let Some(seg) = inner.segments.get_mut(&id) {
            seg.marked_for_removal = true;
        }
        Ok(id)
    }

    pub fn size_of(&self, id: usize) -> MmResult<usize> {
        self.inner.lock().segments.get(&id).map(|s| s.size).ok_or(MmError::NotFound)
    }

    /// 段内第 index 页的页帧，必要时用 `alloc` 分配
    pub fn page_frame(&self, id: usize, index: usize, alloc: impl FnOnce() -> MmResult<Pfn>) -> MmResult<Pfn> {
        let mut inner = self.inner.lock();
        let seg = inner.segments.get_mut(&id).ok_or(MmError::NotFound)?;
        let slot = seg.pages.get_mut(index).ok_or(MmError::BadAddress)?;
        match *slot {
            Some(pfn) => Ok(pfn),
            None => {
                let pfn = alloc()?;
                *slot = Some(pfn);
                Ok(pfn)
            }
        }
    }

    pub fn attach(&self, id: usize, space: SpaceId, now: u64) -> MmResult<()> {
        let mut inner = self.inner.lock();
        let seg = inner.segments.get_mut(&id).ok_or(MmError::NotFound)?;
        *seg.attaches.entry(space).or_insert(0) += 1;
        seg.atime = now;
        Ok(())
    }

    /// 解除挂接；`all` 为真时去掉该地址空间的全部挂接
    ///
    /// 返回段被销毁时需要释放的页帧。
    pub fn detach(&self, id: usize, space: SpaceId, all: bool, now: u64) -> Vec<Pfn> {
        let mut inner = self.inner.lock();
        let Some(seg) = inner.segments.get_mut(&id) else {
            return Vec::new();
        };
        if let Some(n) = seg.attaches.get_mut(&space) {
            if all || *n <= 1 {
                seg.attaches.remove(&space);
            } else {
                *n -= 1;
            }
            seg.dtime = now;
        }
        inner.reap(id)
    }

    /// IPC_RMID
    pub fn rmid(&self, id: usize) -> MmResult<Vec<Pfn>> {
        let mut inner = self.inner.lock();
        let seg = inner.segments.get_mut(&id).ok_or(MmError::NotFound)?;
        seg.marked_for_removal = true;
        let key = seg.key;
        // 已删除的段不能再按 key 找到
        if key != IPC_PRIVATE && inner.keys.get(&key) == Some(&id) {
            inner.keys.remove(&key);
        }
        Ok(inner.reap(id))
    }

    /// IPC_STAT
    pub fn stat(&self, id: usize) -> MmResult<ShmInfo> {
        let inner = self.inner.lock();
        let seg = inner.segments.get(&id).ok_or(MmError::NotFound)?;
        Ok(ShmInfo {
            id,
            key: seg.key,
            name: seg.name.clone(),
            size: seg.size,
            nattch: seg.nattch(),
            resident_pages: seg.pages.iter().filter(|p| p.is_some()).count(),
            marked_for_removal: seg.marked_for_removal,
            ctime: seg.ctime,
            atime: seg.atime,
            dtime: seg.dtime,
        })
    }

    /// fork 时子进程继承父进程的挂接
    pub fn fork_attaches(&self, parent: SpaceId, child: SpaceId) {
        let mut inner = self.inner.lock();
        for seg in inner.segments.values_mut() {
            if let Some(&n) = seg.attaches.get(&parent) {
                seg.attaches.insert(child, n);
            }
        }
    }

    /// 地址空间销毁时去掉它的全部挂接
    pub fn drop_space(&self, space: SpaceId, now: u64) -> Vec<Pfn> {
        let mut inner = self.inner.lock();
        let ids: Vec<usize> = inner
            .segments
            .iter()
            .filter(|(_, s)| s.attaches.contains_key(&space))
            .map(|(id, _)| *id)
            .collect();
        let mut frames = Vec::new();
        for id in ids {
            if let Some(seg) = inner.segments.get_mut(&id) {
                seg.attaches.remove(&space);
                seg.dtime = now;
            }
            frames.extend(inner.reap(id));
        }
        frames
    }

    pub fn segments(&self) -> Vec<ShmInfo> {
        let ids: Vec<usize> = self.inner.lock().segments.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.stat(id).ok()).collect()
    }

    pub fn nr_segments(&self) -> usize {
        self.inner.lock().segments.len()
    }

    /// 所有段已分配的页数
    pub fn resident_pages(&self) -> usize {
        self.inner
            .lock()
            .segments
            .values()
            .map(|s| s.pages.iter().filter(|p| p.is_some()).count())
            .sum()
    }
}

impl Default for ShmManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManager {
    pub fn shmget(&self, key: i32, size: usize, flags: u32) -> MmResult<usize> {
        self.shm.shmget(key, size, flags, self.platform.now_us())
    }

    /// shmat：把段映射进地址空间，返回映射地址
    pub fn shmat(&self, space: SpaceId, id: usize, addr: usize, flags: u32) -> MmResult<VirtAddr> {
        let as_ = self.space(space)?;
        let size = self.shm.size_of(id)?;
        let addr = if flags & SHM_RND != 0 {
            addr & !(PAGE_SIZE - 1)
        } else {
            addr
        };
        if addr % PAGE_SIZE != 0 {
            return Err(MmError::InvalidArgument);
        }

        let mut inner = as_.lock();
        let start = if addr != 0 {
            let start = VirtAddr::new(addr);
            let end = addr.checked_add(size).ok_or(MmError::InvalidArgument)?;
            if end > as_.task_size().as_usize() || inner.vmas.overlaps(start, VirtAddr::new(end)) {
                return Err(MmError::InvalidArgument);
            }
            start
        } else {
            inner
                .vmas
                .find_free_area(size, as_.mmap_base(), as_.task_size())
                .ok_or(MmError::OutOfMemory)?
        };

        let mut vflags = VmaFlags::READ | VmaFlags::SHARED;
        if flags & SHM_RDONLY == 0 {
            vflags.insert(VmaFlags::WRITE);
        }
        let mut vma = Vma::new(start, start.add(size), vflags)?;
        vma.set_type(VmaType::SharedMemory(id));
        self.shm.attach(id, space, self.platform.now_us())?;
        if let Err(e) = inner.vmas.add(vma) {
            let frames = self.shm.detach(id, space, false, self.platform.now_us());
            self.free_frames(frames);
            return Err(e.into());
        }
        log::debug!("shm: space {} attached segment {} at {:#x}", space, id, start.as_usize());
        Ok(start)
    }

    /// shmdt：addr 必须是某次 shmat 返回的地址
    pub fn shmdt(&self, space: SpaceId, addr: usize) -> MmResult<()> {
        let as_ = self.space(space)?;
        let mut guard = as_.lock();
        let inner = &mut *guard;
        let vma = inner.vmas.get(VirtAddr::new(addr)).copied().ok_or(MmError::InvalidArgument)?;
        let id = match vma.vma_type() {
            VmaType::SharedMemory(id) if vma.offset() == 0 => id,
            _ => return Err(MmError::InvalidArgument),
        };
        let mut end = vma.end();
        while let Some(next) = inner.vmas.get(end) {
            if next.shm_id() != Some(id) {
                break;
            }
            end = next.end();
        }
        let removed = inner.vmas.remove_range(vma.start(), end);
        for v in removed.iter() {
            for (vpn, _) in inner.pt.entries(v.start().vpn(), v.end().vpn()) {
                inner.pt.unmap(vpn);
            }
        }
        let frames = self.shm.detach(id, space, false, self.platform.now_us());
        self.free_frames(frames);
        Ok(())
    }

    /// shmctl：IPC_STAT 返回段信息，IPC_RMID 标记删除
    pub fn shmctl(&self, id: usize, cmd: u32) -> MmResult<Option<ShmInfo>> {
        match cmd {
            IPC_STAT => self.shm.stat(id).map(Some),
            IPC_RMID => {
                let frames = self.shm.rmid(id)?;
                self.free_frames(frames);
                Ok(None)
            }
            _ => Err(MmError::InvalidArgument),
        }
    }

    pub fn shm_open(&self, name: &str, size: usize, flags: u32) -> MmResult<usize> {
        self.shm.shm_open(name, size, flags, self.platform.now_us())
    }

    pub fn shm_unlink(&self, name: &str) -> MmResult<()> {
        let frames = self.shm.shm_unlink(name)?;
        self.free_frames(frames);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shmget_keys() {
        let shm = ShmManager::new();
        let a = shm.shmget(42, 5000, IPC_CREAT, 1).unwrap();
        assert_eq!(shm.shmget(42, 4096, 0, 2).unwrap(), a);
        assert_eq!(shm.shmget(42, 4096, IPC_CREAT | IPC_EXCL, 3), Err(MmError::Exists));
        assert_eq!(shm.shmget(43, 4096, 0, 4), Err(MmError::NotFound));
        assert_eq!(shm.size_of(a).unwrap(), 2 * PAGE_SIZE);
        // 超过段大小
        assert_eq!(shm.shmget(42, 3 * PAGE_SIZE, 0, 5), Err(MmError::InvalidArgument));
        // IPC_PRIVATE 每次都是新段
        let p1 = shm.shmget(IPC_PRIVATE, 4096, 0, 6).unwrap();
        let p2 = shm.shmget(IPC_PRIVATE, 4096, 0, 7).unwrap();
        assert_ne!(p1, p2);
    }

    #[test]
    fn test_deferred_removal() {
        let shm = ShmManager::new();
        let id = shm.shmget(7, PAGE_SIZE * 2, IPC_CREAT, 1).unwrap();
        shm.attach(id, 1, 2).unwrap();
        let mut next = 100;
        let pfn = shm
            .page_frame(id, 1, || {
                next += 1;
                Ok(next)
            })
            .unwrap();
        assert_eq!(pfn, 101);
        // 第二次取到同一页帧
        assert_eq!(shm.page_frame(id, 1, || Ok(999)).unwrap(), 101);

        assert!(shm.rmid(id).unwrap().is_empty());
        let st = shm.stat(id).unwrap();
        assert!(st.marked_for_removal);
        assert_eq!(st.nattch, 1);
        assert_eq!(st.resident_pages, 1);
        // key 已不可见
        assert_eq!(shm.shmget(7, PAGE_SIZE, 0, 3), Err(MmError::NotFound));

        assert_eq!(shm.detach(id, 1, false, 4), alloc::vec![101]);
        assert_eq!(shm.stat(id), Err(MmError::NotFound));
    }

    #[test]
    fn test_shm_open_unlink() {
        let shm = ShmManager::new();
        assert_eq!(shm.shm_open("/a", PAGE_SIZE, 0, 1), Err(MmError::NotFound));
        let id = shm.shm_open("/a", PAGE_SIZE, O_CREAT, 1).unwrap();
        assert_eq!(shm.shm_open("/a", 0, 0, 2).unwrap(), id);
        assert_eq!(shm.shm_open("/a", PAGE_SIZE, O_CREAT | O_EXCL, 3), Err(MmError::Exists));
        shm.attach(id, 3, 4).unwrap();
        shm.shm_unlink("/a").unwrap();
        assert_eq!(shm.shm_open("/a", 0, 0, 5), Err(MmError::NotFound));
        assert_eq!(shm.nr_segments(), 1);
        shm.drop_space(3, 6);
        assert_eq!(shm.nr_segments(), 0);
    }

    #[test]
    fn test_fork_attaches() {
        let shm = ShmManager::new();
        let id = shm.create_anonymous(PAGE_SIZE, 1).unwrap();
        shm.attach(id, 1, 1).unwrap();
        shm.fork_attaches(1, 2);
        assert_eq!(shm.stat(id).unwrap().nattch, 2);
        assert!(shm.detach(id, 1, true, 2).is_empty());
        assert_eq!(shm.nr_segments(), 1);
        shm.detach(id, 2, true, 3);
        assert_eq!(shm.nr_segments(), 0);
    }
}
