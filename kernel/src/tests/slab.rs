//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! Slab 与 kmalloc 测试

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use super::{mm, mm_with, BASE_PFN};
use crate::mm::setup::MmConfig;
use crate::mm::{GfpFlags, PAGE_SIZE};
use crate::MmError;

#[test]
fn test_slab() {
    println!("test: ===== Starting Slab Tests =====");

    // 测试 1: 命名缓存
    println!("test: 1. Testing named cache create/find/destroy...");
    test_named_cache();

    // 测试 2: kmalloc 大小类
    println!("test: 2. Testing kmalloc size classes...");
    test_kmalloc_classes();

    // 测试 3: 大块分配
    println!("test: 3. Testing large kmalloc...");
    test_kmalloc_large();

    // 测试 4: 每 CPU 前端缓存
    println!("test: 4. Testing per-CPU front caches...");
    test_per_cpu();

    // 测试 5: gc 收缩
    println!("test: 5. Testing gc shrink...");
    test_gc_shrink();

    // 测试 6: 重复释放
    println!("test: 6. Testing double free rejection...");
    test_double_free();

    println!("test: ===== Slab Tests Completed =====");
}

fn test_named_cache() {
    let mm = mm(64);
    let cache = mm.cache_create("inode", 200, 8, None).unwrap();
    assert!(mm.find_cache("inode").is_some());
    assert_eq!(mm.cache_create("inode", 200, 8, None).err(), Some(MmError::Exists));

    let objs: Vec<_> = (0..40).map(|_| cache.alloc().unwrap()).collect();
    let distinct: BTreeSet<usize> = objs.iter().map(|o| o.as_usize()).collect();
    assert_eq!(distinct.len(), objs.len());
    // 仍有对象在用
    assert_eq!(mm.cache_destroy(&cache), Err(MmError::Busy));
    for obj in objs {
        cache.free(obj).unwrap();
    }
    assert!(cache.check_lists());
    mm.cache_destroy(&cache).unwrap();
    assert!(mm.find_cache("inode").is_none());
    println!("test:    SUCCESS - cache lifecycle ok");
}

fn test_kmalloc_classes() {
    let mm = mm(128);
    let cases = [(1usize, 8usize), (8, 8), (9, 16), (100, 128), (513, 1024), (2048, 2048)];
    let mut held = Vec::new();
    for (size, class) in cases {
        let p = mm.kmalloc(size, GfpFlags::KERNEL).unwrap();
        assert_eq!(mm.ksize(p).unwrap(), class);
        held.push(p);
    }
    assert_eq!(mm.kmalloc(0, GfpFlags::KERNEL), Err(MmError::InvalidArgument));

    let z = mm.kzalloc(64, GfpFlags::KERNEL).unwrap();
    let mut buf = [0xffu8; 64];
    mm.phys().read(z, &mut buf);
    assert!(buf.iter().all(|&b| b == 0));
    held.push(z);

    for p in held {
        mm.kfree(p).unwrap();
    }
    // 不是 kmalloc 返回的地址
    let pfn = mm.alloc_pages(0, GfpFlags::KERNEL).unwrap();
    assert_eq!(mm.kfree(crate::mm::PhysAddr::from_pfn(pfn)), Err(MmError::InvalidArgument));
    mm.free_pages(pfn, 0).unwrap();
    println!("test:    SUCCESS - sizes rounded to the next class");
}

fn test_kmalloc_large() {
    let mm = mm(64);
    let before = mm.numa().nr_free_pages();
    let p = mm.kmalloc(3 * PAGE_SIZE, GfpFlags::KERNEL).unwrap();
    assert_eq!(p.page_offset(), 0);
    assert_eq!(mm.ksize(p).unwrap(), 4 * PAGE_SIZE);
    assert_eq!(mm.memory_info().kmalloc_large_pages, 4);
    mm.kfree(p).unwrap();
    assert_eq!(mm.numa().nr_free_pages(), before);
    println!("test:    SUCCESS - large requests go straight to the page allocator");
}

fn test_per_cpu() {
    let mut cfg = MmConfig::single_node(BASE_PFN, 128).with_zero_watermarks();
    cfg.slab_cpu_limit = 8;
    cfg.slab_cpu_batch = 4;
    let (mm, platform) = mm_with(cfg);
    let cache = mm.cache_create("pcpu", 64, 8, None).unwrap();

    platform.set_cpu(0);
    let a: Vec<_> = (0..6).map(|_| cache.alloc().unwrap()).collect();
    platform.set_cpu(1);
    let b: Vec<_> = (0..6).map(|_| cache.alloc().unwrap()).collect();

    // CPU 1 释放 CPU 0 分配的对象
    for obj in a {
        cache.free(obj).unwrap();
        assert!(cache.cpu_avail(1) <= cache.cpu_limit());
    }
    for obj in b {
        cache.free(obj).unwrap();
        assert!(cache.cpu_avail(1) <= cache.cpu_limit());
    }
    let held = cache.cpu_avail(0) + cache.cpu_avail(1);
    assert!(held > 0);
    mm.slab().drain_all();
    assert_eq!(cache.cpu_avail(0) + cache.cpu_avail(1), 0);
    let (full, partial, _) = cache.slab_counts();
    assert_eq!((full, partial), (0, 0));
    assert!(cache.check_lists());
    println!("test:    SUCCESS - front caches bounded and drainable");
}

fn test_gc_shrink() {
    let mm = mm(64);
    let objs: Vec<_> = (0..200).map(|_| mm.kmalloc(256, GfpFlags::KERNEL).unwrap()).collect();
    let low = mm.numa().nr_free_pages();
    for obj in objs {
        mm.kfree(obj).unwrap();
    }
    let report = mm.gc();
    assert!(report.slab_pages > 0);
    assert!(mm.numa().nr_free_pages() > low);
    assert_eq!(mm.slab().empty_slab_pages(), 0);
    mm.check_consistency().unwrap();
    println!("test:    SUCCESS - gc released {} slab pages", report.slab_pages);
}

fn test_double_free() {
    let mm = mm(64);
    let cache = mm.cache_create("dentry", 96, 8, None).unwrap();
    let a = cache.alloc().unwrap();
    let b = cache.alloc().unwrap();
    cache.free(a).unwrap();
    assert_eq!(cache.free(a), Err(MmError::InvalidArgument));
    // kfree 走同一条检查
    let k = mm.kmalloc(32, GfpFlags::KERNEL).unwrap();
    mm.kfree(k).unwrap();
    assert_eq!(mm.kfree(k), Err(MmError::InvalidArgument));

    // 之后的分配互不重叠
    let again: Vec<_> = (0..16).map(|_| cache.alloc().unwrap()).collect();
    let distinct: BTreeSet<usize> = again.iter().map(|o| o.as_usize()).collect();
    assert_eq!(distinct.len(), again.len());
    assert!(!distinct.contains(&b.as_usize()));
    assert_eq!(cache.stats().active_objects, 17);

    cache.free(b).unwrap();
    for obj in again {
        cache.free(obj).unwrap();
    }
    cache.drain_cpu_caches();
    assert!(cache.check_lists());
    mm.cache_destroy(&cache).unwrap();
    println!("test:    SUCCESS - second free rejected, state intact");
}
