//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 共享内存测试

use super::mm;
use crate::mm::address_space::{MAP_ANONYMOUS, MAP_SHARED, PROT_READ, PROT_WRITE};
use crate::mm::shm::{
    IPC_CREAT, IPC_EXCL, IPC_PRIVATE, IPC_RMID, IPC_STAT, O_CREAT, O_EXCL, SHM_RDONLY,
    SHM_RND,
};
use crate::mm::PAGE_SIZE;
use crate::MmError;

const KEY: i32 = 0x4b4d;

#[test]
fn test_shm() {
    println!("test: ===== Starting Shared Memory Tests =====");

    // 测试 1: shmget 语义
    println!("test: 1. Testing shmget keys and flags...");
    test_shmget();

    // 测试 2: 两个地址空间共享
    println!("test: 2. Testing shmat across spaces...");
    test_shmat_shared();

    // 测试 3: IPC_RMID 延迟删除
    println!("test: 3. Testing deferred IPC_RMID...");
    test_rmid_deferred();

    // 测试 4: 只读挂接
    println!("test: 4. Testing SHM_RDONLY...");
    test_rdonly();

    // 测试 5: POSIX 命名段
    println!("test: 5. Testing shm_open/shm_unlink...");
    test_posix();

    // 测试 6: MAP_SHARED 跨 fork
    println!("test: 6. Testing MAP_SHARED across fork...");
    test_map_shared_fork();

    println!("test: ===== Shared Memory Tests Completed =====");
}

fn test_shmget() {
    let mm = mm(32);
    assert_eq!(mm.shmget(KEY, PAGE_SIZE, 0), Err(MmError::NotFound));
    let id = mm.shmget(KEY, PAGE_SIZE + 1, IPC_CREAT).unwrap();
    assert_eq!(mm.shmget(KEY, PAGE_SIZE, 0).unwrap(), id);
    assert_eq!(mm.shmget(KEY, PAGE_SIZE, IPC_CREAT | IPC_EXCL), Err(MmError::Exists));
    // 比现有段大
    assert_eq!(mm.shmget(KEY, 4 * PAGE_SIZE, IPC_CREAT), Err(MmError::InvalidArgument));
    assert_eq!(mm.shmget(KEY + 1, 0, IPC_CREAT), Err(MmError::InvalidArgument));

    let p1 = mm.shmget(IPC_PRIVATE, PAGE_SIZE, 0).unwrap();
    let p2 = mm.shmget(IPC_PRIVATE, PAGE_SIZE, 0).unwrap();
    assert_ne!(p1, p2);

    let info = mm.shmctl(id, IPC_STAT).unwrap().unwrap();
    assert_eq!(info.size, 2 * PAGE_SIZE);
    assert_eq!(info.key, KEY);
    assert_eq!(info.nattch, 0);
    assert_eq!(mm.shmctl(id, 99), Err(MmError::InvalidArgument));
    println!("test:    SUCCESS - keys, IPC_CREAT and IPC_EXCL behave");
}

fn test_shmat_shared() {
    let mm = mm(32);
    let a = mm.create_space().unwrap();
    let b = mm.create_space().unwrap();
    let id = mm.shmget(KEY, 2 * PAGE_SIZE, IPC_CREAT).unwrap();
    let va = mm.shmat(a, id, 0, 0).unwrap();
    let vb = mm.shmat(b, id, 0, 0).unwrap();

    mm.write_user_u32(a, va.add(PAGE_SIZE + 16), 0xc0ffee).unwrap();
    assert_eq!(mm.read_user_u32(b, vb.add(PAGE_SIZE + 16)).unwrap(), 0xc0ffee);
    mm.write_user_u32(b, vb, 42).unwrap();
    assert_eq!(mm.read_user_u32(a, va).unwrap(), 42);

    let info = mm.shmctl(id, IPC_STAT).unwrap().unwrap();
    assert_eq!(info.nattch, 2);
    assert_eq!(info.resident_pages, 2);
    // 共享页不计入进程 RSS
    assert_eq!(mm.address_space(a).unwrap().rss(), 0);
    let meminfo = mm.memory_info();
    assert_eq!((meminfo.shm_segments, meminfo.shm_pages), (1, 2));

    // 非挂接地址
    assert_eq!(mm.shmdt(a, va.add(PAGE_SIZE).as_usize()), Err(MmError::InvalidArgument));
    mm.shmdt(a, va.as_usize()).unwrap();
    assert_eq!(mm.read_user_u32(a, va), Err(MmError::BadAddress));
    assert_eq!(mm.read_user_u32(b, vb).unwrap(), 42);
    assert_eq!(mm.shmctl(id, IPC_STAT).unwrap().unwrap().nattch, 1);

    // 没有删除标记时段在最后一次 shmdt 后仍保留
    mm.shmdt(b, vb.as_usize()).unwrap();
    assert_eq!(mm.shm_manager().nr_segments(), 1);
    let vc = mm.shmat(a, id, 0, 0).unwrap();
    assert_eq!(mm.read_user_u32(a, vc).unwrap(), 42);
    println!("test:    SUCCESS - both spaces see the same frames");
}

fn test_rmid_deferred() {
    let mm = mm(32);
    let a = mm.create_space().unwrap();
    let id = mm.shmget(KEY, 2 * PAGE_SIZE, IPC_CREAT).unwrap();
    let va = mm.shmat(a, id, 0, 0).unwrap();
    mm.write_user_u32(a, va, 5).unwrap();
    mm.write_user_u32(a, va.add(PAGE_SIZE), 6).unwrap();
    let free = mm.numa().nr_free_pages();

    assert_eq!(mm.shmctl(id, IPC_RMID).unwrap(), None);
    let info = mm.shmctl(id, IPC_STAT).unwrap().unwrap();
    assert!(info.marked_for_removal);
    // 仍挂接时可以继续访问，key 已不可见
    assert_eq!(mm.read_user_u32(a, va.add(PAGE_SIZE)).unwrap(), 6);
    assert_eq!(mm.shmget(KEY, PAGE_SIZE, 0), Err(MmError::NotFound));

    mm.shmdt(a, va.as_usize()).unwrap();
    assert_eq!(mm.shmctl(id, IPC_STAT), Err(MmError::NotFound));
    assert_eq!(mm.numa().nr_free_pages(), free + 2);

    // 未挂接的段立即删除
    let id2 = mm.shmget(IPC_PRIVATE, PAGE_SIZE, 0).unwrap();
    mm.shmctl(id2, IPC_RMID).unwrap();
    assert_eq!(mm.shm_manager().nr_segments(), 0);
    println!("test:    SUCCESS - segment destroyed after the last detach");
}

fn test_rdonly() {
    let mm = mm(32);
    let a = mm.create_space().unwrap();
    let id = mm.shmget(IPC_PRIVATE, PAGE_SIZE, 0).unwrap();
    let w = mm.shmat(a, id, 0, 0).unwrap();
    mm.write_user_u32(a, w, 9).unwrap();
    let r = mm.shmat(a, id, 0, SHM_RDONLY).unwrap();
    assert_ne!(w, r);
    assert_eq!(mm.read_user_u32(a, r).unwrap(), 9);
    assert_eq!(mm.write_user_u32(a, r, 1), Err(MmError::PermissionDenied));
    // 未对齐且没有 SHM_RND
    assert_eq!(mm.shmat(a, id, 0x2000_0123, 0), Err(MmError::InvalidArgument));
    let rnd = mm.shmat(a, id, 0x2000_0123, SHM_RND).unwrap();
    assert_eq!(rnd.as_usize(), 0x2000_0000);
    println!("test:    SUCCESS - read-only attach refuses writes");
}

fn test_posix() {
    let mm = mm(32);
    let a = mm.create_space().unwrap();
    assert_eq!(mm.shm_open("/db", PAGE_SIZE, 0), Err(MmError::NotFound));
    let id = mm.shm_open("/db", PAGE_SIZE, O_CREAT).unwrap();
    assert_eq!(mm.shm_open("/db", 0, 0).unwrap(), id);
    assert_eq!(mm.shm_open("/db", PAGE_SIZE, O_CREAT | O_EXCL), Err(MmError::Exists));
    assert_eq!(mm.shm_open("", PAGE_SIZE, O_CREAT), Err(MmError::InvalidArgument));

    let va = mm.shmat(a, id, 0, 0).unwrap();
    mm.write_user_u32(a, va, 0x600d).unwrap();
    mm.shm_unlink("/db").unwrap();
    assert_eq!(mm.shm_unlink("/db"), Err(MmError::NotFound));
    // 名字已删除，映射仍有效
    assert_eq!(mm.shm_open("/db", PAGE_SIZE, 0), Err(MmError::NotFound));
    assert_eq!(mm.read_user_u32(a, va).unwrap(), 0x600d);

    // 同名新段与旧段无关
    let id2 = mm.shm_open("/db", PAGE_SIZE, O_CREAT).unwrap();
    assert_ne!(id, id2);
    mm.exit_space(a).unwrap();
    assert_eq!(mm.shmctl(id, IPC_STAT), Err(MmError::NotFound));
    assert!(mm.shmctl(id2, IPC_STAT).is_ok());
    println!("test:    SUCCESS - named segments outlive unlink until detached");
}

fn test_map_shared_fork() {
    let mm = mm(32);
    let parent = mm.create_space().unwrap();
    let free = mm.numa().nr_free_pages();
    let base = mm
        .mmap(parent, 0, 2 * PAGE_SIZE, PROT_READ | PROT_WRITE, MAP_SHARED | MAP_ANONYMOUS)
        .unwrap();
    mm.write_user_u32(parent, base, 1).unwrap();

    let child = mm.fork(parent).unwrap();
    mm.write_user_u32(child, base, 2).unwrap();
    mm.write_user_u32(child, base.add(PAGE_SIZE), 3).unwrap();
    // 共享映射不走 COW
    assert_eq!(mm.read_user_u32(parent, base).unwrap(), 2);
    assert_eq!(mm.read_user_u32(parent, base.add(PAGE_SIZE)).unwrap(), 3);
    assert_eq!(mm.cow().stats().shared_pages, 0);

    let id = mm.address_space(parent).unwrap().find_vma(base).unwrap().shm_id().unwrap();
    assert_eq!(mm.shmctl(id, IPC_STAT).unwrap().unwrap().nattch, 2);

    mm.exit_space(parent).unwrap();
    assert_eq!(mm.read_user_u32(child, base).unwrap(), 2);
    mm.munmap(child, base.as_usize(), 2 * PAGE_SIZE).unwrap();
    // 匿名共享段随最后一个映射消失
    assert_eq!(mm.shm_manager().nr_segments(), 0);
    assert_eq!(mm.numa().nr_free_pages(), free);
    println!("test:    SUCCESS - MAP_SHARED pages shared with the child");
}
