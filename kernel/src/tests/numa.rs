//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! NUMA 策略测试

use alloc::vec::Vec;

use super::{mm_with, BASE_PFN};
use crate::mm::address_space::{MAP_ANONYMOUS, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use crate::mm::pagemap::Pte;
use crate::mm::setup::MmConfig;
use crate::mm::{GfpFlags, NumaPolicy, PAGE_SIZE};
use crate::platform::SimPlatform;
use crate::{MemoryManager, MmError};

const NODE_PAGES: usize = 32;

fn two_nodes() -> (MemoryManager, alloc::sync::Arc<SimPlatform>) {
    mm_with(MmConfig::uniform(2, BASE_PFN, NODE_PAGES).with_zero_watermarks())
}

fn node_of(pfn: usize) -> usize {
    (pfn - BASE_PFN) / NODE_PAGES
}

/// 占满某个节点，返回占用的页
fn exhaust(mm: &MemoryManager, node: usize) -> Vec<usize> {
    let mut held = Vec::new();
    while let Ok(pfn) = mm.numa().alloc_on_node(node, 0, GfpFlags::KERNEL) {
        held.push(pfn);
    }
    held
}

#[test]
fn test_numa() {
    println!("test: ===== Starting NUMA Tests =====");

    // 测试 1: 本地优先
    println!("test: 1. Testing default policy allocates locally...");
    test_default_local();

    // 测试 2: Preferred 回退
    println!("test: 2. Testing preferred node fallback...");
    test_preferred_fallback();

    // 测试 3: Local 与 Bind 不回退
    println!("test: 3. Testing local/bind do not fall back...");
    test_strict_policies();

    // 测试 4: 交错分配
    println!("test: 4. Testing interleave...");
    test_interleave();

    // 测试 5: 页迁移
    println!("test: 5. Testing page migration...");
    test_migrate();

    println!("test: ===== NUMA Tests Completed =====");
}

fn test_default_local() {
    let (mm, platform) = two_nodes();
    assert_eq!(mm.numa().nr_nodes(), 2);
    assert_eq!(mm.numa().distance(0, 1), 20);

    platform.set_cpu(0);
    let a = mm.alloc_pages(0, GfpFlags::KERNEL).unwrap();
    platform.set_cpu(1);
    let b = mm.alloc_pages(0, GfpFlags::KERNEL).unwrap();
    assert_eq!(node_of(a), 0);
    assert_eq!(node_of(b), 1);

    // 用户页也在当前 CPU 的节点上分配
    let s = mm.create_space().unwrap();
    let base = mm
        .mmap(s, 0, PAGE_SIZE, PROT_READ | PROT_WRITE, MAP_PRIVATE | MAP_ANONYMOUS)
        .unwrap();
    mm.write_user_u32(s, base, 1).unwrap();
    match mm.address_space(s).unwrap().lookup(base) {
        Some(Pte::Present { pfn, .. }) => assert_eq!(node_of(pfn), 1),
        other => panic!("unexpected pte {:?}", other),
    }
    let stats = mm.numa().stats();
    assert_eq!(stats.nodes[0].local_allocs, 1);
    assert_eq!(stats.nodes[1].local_allocs, 2);
    mm.free_pages(a, 0).unwrap();
    mm.free_pages(b, 0).unwrap();
    println!("test:    SUCCESS - allocations follow the current cpu");
}

fn test_preferred_fallback() {
    let (mm, platform) = two_nodes();
    platform.set_cpu(0);
    mm.set_numa_policy(NumaPolicy::Preferred(1)).unwrap();
    let held = exhaust(&mm, 1);
    assert_eq!(held.len(), NODE_PAGES);

    let pfn = mm.alloc_pages(0, GfpFlags::KERNEL).unwrap();
    assert_eq!(node_of(pfn), 0);
    let stats = mm.numa().stats();
    assert_eq!(stats.fallback_allocs, 1);
    assert_eq!(stats.nodes[0].remote_allocs, 1);

    assert_eq!(mm.set_numa_policy(NumaPolicy::Preferred(5)), Err(MmError::InvalidArgument));
    assert_eq!(mm.numa_policy(), NumaPolicy::Preferred(1));
    println!("test:    SUCCESS - preferred node falls back by distance");
}

fn test_strict_policies() {
    let (mm, platform) = two_nodes();
    platform.set_cpu(0);
    let held = exhaust(&mm, 0);

    mm.set_numa_policy(NumaPolicy::Local).unwrap();
    assert_eq!(mm.alloc_pages(0, GfpFlags::KERNEL), Err(MmError::PolicyUnsatisfiable));

    mm.set_numa_policy(NumaPolicy::Bind(0b01)).unwrap();
    assert_eq!(mm.alloc_pages(0, GfpFlags::KERNEL), Err(MmError::PolicyUnsatisfiable));
    mm.set_numa_policy(NumaPolicy::Bind(0b10)).unwrap();
    let pfn = mm.alloc_pages(0, GfpFlags::KERNEL).unwrap();
    assert_eq!(node_of(pfn), 1);

    // 节点不存在
    assert_eq!(mm.set_numa_policy(NumaPolicy::Bind(0b100)), Err(MmError::InvalidArgument));
    assert_eq!(mm.set_numa_policy(NumaPolicy::Bind(0)), Err(MmError::InvalidArgument));
    assert!(mm.numa().stats().policy_failures >= 2);

    for pfn in held {
        mm.free_pages(pfn, 0).unwrap();
    }
    mm.set_numa_policy(NumaPolicy::Local).unwrap();
    assert_eq!(node_of(mm.alloc_pages(0, GfpFlags::KERNEL).unwrap()), 0);
    println!("test:    SUCCESS - strict policies report unsatisfiable");
}

fn test_interleave() {
    let (mm, _) = two_nodes();
    mm.set_numa_policy(NumaPolicy::Interleave).unwrap();
    let nodes: Vec<usize> = (0..6)
        .map(|_| node_of(mm.alloc_pages(0, GfpFlags::KERNEL).unwrap()))
        .collect();
    assert_eq!(nodes.iter().filter(|&&n| n == 0).count(), 3);
    assert!(nodes.windows(2).all(|w| w[0] != w[1]));
    println!("test:    SUCCESS - interleave alternates nodes");
}

fn test_migrate() {
    let (mm, platform) = two_nodes();
    platform.set_cpu(0);
    let s = mm.create_space().unwrap();
    let base = mm
        .mmap(s, 0, 2 * PAGE_SIZE, PROT_READ | PROT_WRITE, MAP_PRIVATE | MAP_ANONYMOUS)
        .unwrap();
    mm.write_user_u32(s, base, 0xfeed).unwrap();
    let free0 = mm.numa().node(0).unwrap().buddy().nr_free_pages();

    let new = mm.migrate_page(s, base, 1).unwrap();
    assert_eq!(node_of(new), 1);
    assert_eq!(mm.numa().node(0).unwrap().buddy().nr_free_pages(), free0 + 1);
    assert_eq!(mm.read_user_u32(s, base).unwrap(), 0xfeed);
    assert!(mm.reclaim_lists().is_tracked(new));
    // 已在目标节点
    assert_eq!(mm.migrate_page(s, base, 1).unwrap(), new);

    let stats = mm.numa().stats();
    assert_eq!(stats.nodes[0].migrations_out, 1);
    assert_eq!(stats.nodes[1].migrations_in, 1);
    assert_eq!(mm.paging_stats().migrations, 1);

    // 未驻留的页
    assert_eq!(mm.migrate_page(s, base.add(PAGE_SIZE), 1), Err(MmError::NotFound));
    // COW 共享页不能迁移
    let child = mm.fork(s).unwrap();
    assert_eq!(mm.migrate_page(child, base, 0), Err(MmError::Busy));
    println!("test:    SUCCESS - page moved between nodes with its contents");
}
