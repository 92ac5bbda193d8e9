//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! mmap / munmap / mprotect 测试

use super::{mm, pattern};
use crate::mm::address_space::{
    MAP_ANONYMOUS, MAP_FIXED, MAP_POPULATE, MAP_PRIVATE, MAP_SHARED, PROT_EXEC, PROT_NONE, PROT_READ,
    PROT_WRITE,
};
use crate::mm::fault::FaultCode;
use crate::mm::pagemap::Pte;
use crate::mm::{PAGE_SIZE, USER_VIRT_BASE};
use crate::MmError;

const RW: u32 = PROT_READ | PROT_WRITE;
const ANON: u32 = MAP_PRIVATE | MAP_ANONYMOUS;

#[test]
fn test_mmap() {
    println!("test: ===== Starting mmap Tests =====");

    // 测试 1: 参数校验
    println!("test: 1. Testing mmap argument checks...");
    test_mmap_args();

    // 测试 2: 按需分配
    println!("test: 2. Testing demand paging...");
    test_demand_paging();

    // 测试 3: MAP_FIXED 与地址提示
    println!("test: 3. Testing MAP_FIXED and hints...");
    test_fixed_and_hint();

    // 测试 4: MAP_POPULATE
    println!("test: 4. Testing MAP_POPULATE...");
    test_populate();

    // 测试 5: munmap 拆分
    println!("test: 5. Testing munmap split...");
    test_munmap_split();

    // 测试 6: mprotect
    println!("test: 6. Testing mprotect...");
    test_mprotect();

    println!("test: ===== mmap Tests Completed =====");
}

fn test_mmap_args() {
    let mm = mm(32);
    let s = mm.create_space().unwrap();
    assert_eq!(mm.mmap(s, 0, 0, RW, ANON), Err(MmError::InvalidArgument));
    assert_eq!(mm.mmap(s, 0, PAGE_SIZE, 0x80, ANON), Err(MmError::InvalidArgument));
    // SHARED 与 PRIVATE 必须二选一
    assert_eq!(
        mm.mmap(s, 0, PAGE_SIZE, RW, MAP_SHARED | MAP_PRIVATE | MAP_ANONYMOUS),
        Err(MmError::InvalidArgument)
    );
    assert_eq!(mm.mmap(s, 0, PAGE_SIZE, RW, MAP_PRIVATE), Err(MmError::InvalidArgument));
    assert_eq!(mm.mmap(s, 0x1001, PAGE_SIZE, RW, ANON | MAP_FIXED), Err(MmError::InvalidArgument));
    assert_eq!(mm.mmap(999, 0, PAGE_SIZE, RW, ANON), Err(MmError::NotFound));
    assert!(mm.address_space(s).unwrap().vmas().is_empty());
    println!("test:    SUCCESS - bad arguments rejected");
}

fn test_demand_paging() {
    let mm = mm(32);
    let s = mm.create_space().unwrap();
    let free = mm.numa().nr_free_pages();
    // 长度向上取整到页
    let base = mm.mmap(s, 0, 3 * PAGE_SIZE + 1, RW, ANON).unwrap();
    let space = mm.address_space(s).unwrap();
    assert_eq!(space.find_vma(base).unwrap().end(), base.add(4 * PAGE_SIZE));
    // 映射本身不占物理页
    assert_eq!(mm.numa().nr_free_pages(), free);
    assert_eq!(space.rss(), 0);

    // 首次读得到零页
    assert_eq!(mm.read_user_u32(s, base.add(2 * PAGE_SIZE + 8)).unwrap(), 0);
    assert_eq!(space.rss(), 1);
    mm.write_user(s, base.add(PAGE_SIZE - 2), &[1, 2, 3, 4]).unwrap();
    let mut buf = [0u8; 4];
    mm.read_user(s, base.add(PAGE_SIZE - 2), &mut buf).unwrap();
    assert_eq!(buf, [1, 2, 3, 4]);
    assert_eq!(space.rss(), 3);
    assert_eq!(mm.paging_stats().minor_faults, 3);

    // VMA 之外
    assert_eq!(
        mm.handle_page_fault(s, base.add(8 * PAGE_SIZE), FaultCode::USER),
        Err(MmError::BadAddress)
    );
    assert_eq!(mm.paging_stats().segfaults, 1);
    println!("test:    SUCCESS - pages allocated on first touch");
}

fn test_fixed_and_hint() {
    let mm = mm(32);
    let s = mm.create_space().unwrap();
    let hint = USER_VIRT_BASE + 0x10_0000;
    let a = mm.mmap(s, hint, 2 * PAGE_SIZE, RW, ANON).unwrap();
    assert_eq!(a.as_usize(), hint);
    mm.write_user_u32(s, a, 0xdead).unwrap();

    // 提示地址被占用时另找位置
    let b = mm.mmap(s, hint, PAGE_SIZE, RW, ANON).unwrap();
    assert_ne!(b.as_usize(), hint);

    // MAP_FIXED 覆盖原有映射，旧页被释放
    let free = mm.numa().nr_free_pages();
    let c = mm.mmap(s, hint, PAGE_SIZE, PROT_READ, ANON | MAP_FIXED).unwrap();
    assert_eq!(c.as_usize(), hint);
    assert_eq!(mm.numa().nr_free_pages(), free + 1);
    assert_eq!(mm.read_user_u32(s, c).unwrap(), 0);
    // 第二页仍属于旧映射
    let rest = mm.address_space(s).unwrap().find_vma(c.add(PAGE_SIZE)).unwrap();
    assert!(rest.flags().is_writable());
    println!("test:    SUCCESS - hint and MAP_FIXED placement");
}

fn test_populate() {
    let mm = mm(32);
    let s = mm.create_space().unwrap();
    let free = mm.numa().nr_free_pages();
    let base = mm.mmap(s, 0, 4 * PAGE_SIZE, RW, ANON | MAP_POPULATE).unwrap();
    assert_eq!(mm.numa().nr_free_pages(), free - 4);
    let space = mm.address_space(s).unwrap();
    for i in 0..4 {
        assert!(matches!(space.lookup(base.add(i * PAGE_SIZE)), Some(Pte::Present { .. })));
    }
    // PROT_NONE 不预填
    mm.mmap(s, 0, 2 * PAGE_SIZE, PROT_NONE, ANON | MAP_POPULATE).unwrap();
    assert_eq!(mm.numa().nr_free_pages(), free - 4);
    println!("test:    SUCCESS - populated mappings are resident");
}

fn test_munmap_split() {
    let mm = mm(32);
    let s = mm.create_space().unwrap();
    let base = mm.mmap(s, 0, 4 * PAGE_SIZE, RW, ANON).unwrap();
    for i in 0..4 {
        mm.write_user_u32(s, base.add(i * PAGE_SIZE), pattern(i)).unwrap();
    }
    let free = mm.numa().nr_free_pages();
    mm.munmap(s, base.add(PAGE_SIZE).as_usize(), 2 * PAGE_SIZE).unwrap();
    assert_eq!(mm.numa().nr_free_pages(), free + 2);

    let space = mm.address_space(s).unwrap();
    assert_eq!(space.vmas().len(), 2);
    assert_eq!(space.rss(), 2);
    assert_eq!(mm.read_user_u32(s, base).unwrap(), pattern(0));
    assert_eq!(mm.read_user_u32(s, base.add(3 * PAGE_SIZE)).unwrap(), pattern(3));
    assert_eq!(mm.read_user_u32(s, base.add(PAGE_SIZE)), Err(MmError::BadAddress));

    assert_eq!(mm.munmap(s, base.as_usize() + 1, PAGE_SIZE), Err(MmError::InvalidArgument));
    // 空区间不是错误
    mm.munmap(s, base.add(PAGE_SIZE).as_usize(), PAGE_SIZE).unwrap();
    mm.munmap(s, base.as_usize(), 4 * PAGE_SIZE).unwrap();
    assert!(space.vmas().is_empty());
    assert_eq!(space.rss(), 0);
    println!("test:    SUCCESS - munmap splits and frees");
}

fn test_mprotect() {
    let mm = mm(32);
    let s = mm.create_space().unwrap();
    let base = mm.mmap(s, 0, 3 * PAGE_SIZE, RW, ANON).unwrap();
    for i in 0..3 {
        mm.write_user_u32(s, base.add(i * PAGE_SIZE), pattern(i)).unwrap();
    }
    mm.mprotect(s, base.add(PAGE_SIZE).as_usize(), PAGE_SIZE, PROT_READ).unwrap();
    let space = mm.address_space(s).unwrap();
    assert_eq!(space.vmas().len(), 3);
    match space.lookup(base.add(PAGE_SIZE)) {
        Some(Pte::Present { perm, .. }) => assert!(perm.readable() && !perm.writable()),
        other => panic!("unexpected pte {:?}", other),
    }
    assert_eq!(mm.write_user_u32(s, base.add(PAGE_SIZE), 1), Err(MmError::PermissionDenied));
    assert_eq!(mm.read_user_u32(s, base.add(PAGE_SIZE)).unwrap(), pattern(1));
    mm.write_user_u32(s, base.add(2 * PAGE_SIZE), 9).unwrap();

    // 执行权限检查
    assert_eq!(
        mm.handle_page_fault(s, base, FaultCode::USER | FaultCode::INSTR),
        Err(MmError::PermissionDenied)
    );
    mm.mprotect(s, base.as_usize(), PAGE_SIZE, PROT_READ | PROT_EXEC).unwrap();
    mm.handle_page_fault(s, base, FaultCode::USER | FaultCode::INSTR).unwrap();

    // 恢复写权限后可写，相邻 VMA 重新合并
    mm.mprotect(s, base.as_usize(), 3 * PAGE_SIZE, RW).unwrap();
    mm.write_user_u32(s, base.add(PAGE_SIZE), 5).unwrap();
    assert_eq!(space.vmas().len(), 1);
    println!("test:    SUCCESS - protections applied to vmas and ptes");
}
