//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 压缩缓存测试

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::{mm, mm_with, pattern, BASE_PFN};
use crate::mm::address_space::{MAP_ANONYMOUS, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use crate::mm::fault::{FaultCode, FaultKind};
use crate::mm::pagemap::Pte;
use crate::mm::setup::MmConfig;
use crate::mm::swap::RamDisk;
use crate::mm::{CompressionAlgorithm, VirtAddr, PAGE_SIZE};
use crate::{MemoryManager, MmError};

const RW: u32 = PROT_READ | PROT_WRITE;
const ANON: u32 = MAP_PRIVATE | MAP_ANONYMOUS;

/// 伪随机字节，压缩不了
fn noise(seed: u64) -> Vec<u8> {
    let mut x = seed | 1;
    (0..PAGE_SIZE)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            x as u8
        })
        .collect()
}

fn fill(mm: &MemoryManager, pages: usize) -> (u32, VirtAddr) {
    let s = mm.create_space().unwrap();
    let base = mm.mmap(s, 0, pages * PAGE_SIZE, RW, ANON).unwrap();
    for i in 0..pages {
        mm.write_user_u32(s, base.add(i * PAGE_SIZE), pattern(i)).unwrap();
    }
    (s, base)
}

fn count_ptes(mm: &MemoryManager, s: u32, base: VirtAddr, pages: usize) -> (usize, usize, usize) {
    let space = mm.address_space(s).unwrap();
    let mut n = (0, 0, 0);
    for i in 0..pages {
        match space.lookup(base.add(i * PAGE_SIZE)) {
            Some(Pte::Present { .. }) => n.0 += 1,
            Some(Pte::Compressed(_)) => n.1 += 1,
            Some(Pte::Swapped(_)) => n.2 += 1,
            None => {}
        }
    }
    n
}

#[test]
fn test_compression() {
    println!("test: ===== Starting Compression Cache Tests =====");

    // 测试 1: 压缩与解压
    println!("test: 1. Testing compress on reclaim and decompress on fault...");
    test_round_trip();

    // 测试 2: 不可压缩页
    println!("test: 2. Testing incompressible pages go to swap...");
    test_incompressible();

    // 测试 3: 池满转存交换区
    println!("test: 3. Testing pool eviction spills to swap...");
    test_spill_to_swap();

    // 测试 4: 没有交换区时的转存
    println!("test: 4. Testing spill without swap...");
    test_spill_without_swap();

    // 测试 5: 池管理
    println!("test: 5. Testing pool administration...");
    test_pools();

    println!("test: ===== Compression Cache Tests Completed =====");
}

fn test_round_trip() {
    let mm = mm(64);
    let (s, base) = fill(&mm, 4);
    let free = mm.numa().nr_free_pages();
    assert_eq!(mm.reclaim_pages(4), 4);
    assert_eq!(mm.numa().nr_free_pages(), free + 4);
    assert_eq!(count_ptes(&mm, s, base, 4), (0, 4, 0));
    let info = mm.memory_info();
    assert_eq!(info.compressed_pages, 4);
    assert!(info.compressed_bytes < 4 * PAGE_SIZE / 4);

    let kind = mm.handle_page_fault(s, base, FaultCode::USER).unwrap();
    assert_eq!(kind, FaultKind::Minor);
    for i in 0..4 {
        assert_eq!(mm.read_user_u32(s, base.add(i * PAGE_SIZE)).unwrap(), pattern(i));
    }
    let stats = mm.paging_stats();
    assert_eq!(stats.compressed_outs, 4);
    assert_eq!(stats.compressed_ins, 4);
    assert_eq!(stats.major_faults, 0);
    assert_eq!(mm.compression().stats().compressed_pages, 0);

    // 退出时丢弃压缩副本
    mm.reclaim_pages(2);
    mm.exit_space(s).unwrap();
    assert_eq!(mm.compression().stats().compressed_pages, 0);
    mm.check_consistency().unwrap();
    println!("test:    SUCCESS - pages round-tripped through the pool");
}

fn test_incompressible() {
    let mm = mm(64);
    mm.swapon("/swap", 0, Arc::new(RamDisk::with_pages(8))).unwrap();
    let s = mm.create_space().unwrap();
    let base = mm.mmap(s, 0, PAGE_SIZE, RW, ANON).unwrap();
    let data = noise(0x1234);
    mm.write_user(s, base, &data).unwrap();

    assert_eq!(mm.reclaim_pages(1), 1);
    assert_eq!(count_ptes(&mm, s, base, 1), (0, 0, 1));
    assert!(mm.compression().stats().failures >= 1);

    let mut back = alloc::vec![0u8; PAGE_SIZE];
    mm.read_user(s, base, &mut back).unwrap();
    assert_eq!(back, data);
    println!("test:    SUCCESS - rejected page stored in swap");
}

fn test_spill_to_swap() {
    let mut cfg = MmConfig::single_node(BASE_PFN, 64).with_zero_watermarks();
    cfg.compression_pool_pages = 2;
    let (mm, _) = mm_with(cfg);
    mm.swapon("/swap", 0, Arc::new(RamDisk::with_pages(8))).unwrap();
    let (s, base) = fill(&mm, 4);

    assert_eq!(mm.reclaim_pages(4), 4);
    assert_eq!(count_ptes(&mm, s, base, 4), (0, 2, 2));
    assert_eq!(mm.compression().stats().evictions, 2);
    assert_eq!(mm.swap().stats().free_pages, 6);
    for i in 0..4 {
        assert_eq!(mm.read_user_u32(s, base.add(i * PAGE_SIZE)).unwrap(), pattern(i));
    }
    assert_eq!(mm.swap().stats().free_pages, 8);
    println!("test:    SUCCESS - evicted entries moved to swap");
}

fn test_spill_without_swap() {
    let mut cfg = MmConfig::single_node(BASE_PFN, 64).with_zero_watermarks();
    cfg.compression_pool_pages = 2;
    let (mm, _) = mm_with(cfg);
    let (s, base) = fill(&mm, 3);

    mm.reclaim_pages(3);
    // 被淘汰的条目无处可去，重新驻留
    let (present, compressed, swapped) = count_ptes(&mm, s, base, 3);
    assert_eq!((present, compressed, swapped), (1, 2, 0));
    for i in 0..3 {
        assert_eq!(mm.read_user_u32(s, base.add(i * PAGE_SIZE)).unwrap(), pattern(i));
    }
    println!("test:    SUCCESS - no data lost when the pool overflows");
}

fn test_pools() {
    let mm = mm(64);
    let id = mm.create_compression_pool("fast", CompressionAlgorithm::Lz4, 8).unwrap();
    assert_eq!(id, 1);
    assert_eq!(
        mm.create_compression_pool("fast", CompressionAlgorithm::Lz4, 8),
        Err(MmError::Exists)
    );
    assert_eq!(
        mm.create_compression_pool("big", CompressionAlgorithm::Zstd, 8),
        Err(MmError::InvalidArgument)
    );
    assert_eq!(mm.compression().pool_stats().len(), 2);
    mm.destroy_compression_pool(id).unwrap();
    assert_eq!(mm.destroy_compression_pool(id), Err(MmError::NotFound));

    // 默认池非空时不能销毁
    let (s, base) = fill(&mm, 1);
    mm.reclaim_pages(1);
    assert_eq!(mm.destroy_compression_pool(0), Err(MmError::Busy));
    mm.read_user_u32(s, base).unwrap();
    mm.destroy_compression_pool(0).unwrap();

    // 没有默认池时直接走交换区
    mm.swapon("/swap", 0, Arc::new(RamDisk::with_pages(4))).unwrap();
    mm.reclaim_pages(1);
    assert_eq!(count_ptes(&mm, s, base, 1), (0, 0, 1));

    assert_eq!(
        mm.set_compression_algorithm(CompressionAlgorithm::None),
        Err(MmError::NotFound)
    );
    mm.enable_compression(false);
    assert!(!mm.compression().is_enabled());
    println!("test:    SUCCESS - pools created, listed and destroyed");
}
