//! Descriptor Allocation Tests
//!
//! Tests for:
//! - DescriptorAllocator: stale deferral by frame, full coalescing, page growth
//! - Concurrent allocation: no two live blocks overlap
//! - GpuContext descriptor helpers: create_view, release_stale_descriptors

use std::sync::Arc;
use std::thread;

use ember::descriptors::DescriptorAllocation;
use ember::hal::headless::HeadlessDevice;
use ember::hal::{DescriptorHeapKind, ViewDesc};
use ember::{EmberError, FrameNumber, GpuContext, GpuSettings};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn context(descriptors_per_page: u32) -> GpuContext {
    init_logger();
    GpuContext::new(
        Arc::new(HeadlessDevice::new()),
        GpuSettings {
            descriptors_per_page,
            max_descriptors_per_page: 4096,
            ..Default::default()
        },
    )
}

// ============================================================================
// Stale Deferral
// ============================================================================

#[test]
fn freed_block_returns_only_after_its_frame_is_released() {
    let ctx = context(256);
    let pool = ctx.descriptor_allocator(DescriptorHeapKind::CbvSrvUav).clone();

    ctx.frame_clock().set(FrameNumber::new(10));
    let block = ctx
        .allocate_descriptors(DescriptorHeapKind::CbvSrvUav, 4)
        .unwrap();
    assert_eq!(pool.num_free_handles(), 252);
    drop(block);

    ctx.release_stale_descriptors(FrameNumber::new(9));
    assert_eq!(pool.num_free_handles(), 252);
    assert_eq!(pool.free_blocks(0), vec![(4, 252)]);

    ctx.release_stale_descriptors(FrameNumber::new(10));
    assert_eq!(pool.num_free_handles(), 256);
    assert_eq!(pool.free_blocks(0), vec![(0, 256)]);

    let whole = ctx
        .allocate_descriptors(DescriptorHeapKind::CbvSrvUav, 256)
        .unwrap();
    assert_eq!(whole.page_index(), 0);
    assert_eq!(whole.offset(), 0);
    assert_eq!(pool.page_count(), 1);
}

#[test]
fn stale_blocks_are_not_reused_before_release() {
    let ctx = context(8);
    let pool = ctx.descriptor_allocator(DescriptorHeapKind::Sampler).clone();

    let first = pool.allocate(8).unwrap();
    drop(first);

    // The only page is full of stale slots, so a new page is created.
    let second = pool.allocate(8).unwrap();
    assert_eq!(second.page_index(), 1);
    assert_eq!(pool.page_count(), 2);
}

#[test]
fn releasing_every_block_coalesces_each_page() {
    let ctx = context(64);
    let pool = ctx.descriptor_allocator(DescriptorHeapKind::CbvSrvUav).clone();

    let sizes = [3u32, 7, 1, 12, 5, 9, 2, 16, 4, 8, 6, 11, 1, 30, 2];
    let mut blocks: Vec<DescriptorAllocation> =
        sizes.iter().map(|&n| pool.allocate(n).unwrap()).collect();

    // Free in an interleaved order so every merge case is hit.
    let mut order: Vec<usize> = (0..blocks.len()).step_by(2).collect();
    order.extend((1..blocks.len()).step_by(2));
    order.reverse();
    let mut slots: Vec<Option<DescriptorAllocation>> = blocks.drain(..).map(Some).collect();
    for index in order {
        slots[index] = None;
    }

    ctx.release_stale_descriptors(ctx.frame_clock().current());
    for page in 0..pool.page_count() {
        let capacity = pool.page_capacity(page);
        assert_eq!(pool.free_blocks(page), vec![(0, capacity)]);
        assert_eq!(pool.free_block_count(page), 1);
        assert!(pool.is_page_available(page));
    }
}

#[test]
fn blocks_from_different_frames_release_in_order() {
    let ctx = context(32);
    let pool = ctx.descriptor_allocator(DescriptorHeapKind::CbvSrvUav).clone();

    let a = pool.allocate(4).unwrap();
    let b = pool.allocate(4).unwrap();

    let frame_a = ctx.advance_frame();
    drop(a);
    let frame_b = ctx.advance_frame();
    drop(b);

    ctx.release_stale_descriptors(frame_a);
    assert_eq!(pool.num_free_handles(), 28);
    ctx.release_stale_descriptors(frame_b);
    assert_eq!(pool.num_free_handles(), 32);
}

// ============================================================================
// Growth & Limits
// ============================================================================

#[test]
fn large_request_gets_its_own_page() {
    let ctx = context(16);
    let pool = ctx.descriptor_allocator(DescriptorHeapKind::Rtv).clone();

    let _small = pool.allocate(4).unwrap();
    let big = pool.allocate(100).unwrap();
    assert_eq!(big.page_index(), 1);
    assert_eq!(pool.page_capacity(1), 100);
    assert_eq!(big.count(), 100);
    assert_eq!(big.kind(), DescriptorHeapKind::Rtv);
}

#[test]
fn request_above_hard_maximum_is_an_error() {
    let ctx = context(16);
    let err = ctx
        .allocate_descriptors(DescriptorHeapKind::Dsv, 5000)
        .unwrap_err();
    assert!(matches!(
        err,
        EmberError::DescriptorRequestTooLarge {
            kind: DescriptorHeapKind::Dsv,
            requested: 5000,
            max: 4096,
        }
    ));
}

#[test]
fn device_failure_surfaces_as_creation_error() {
    init_logger();
    let device = HeadlessDevice::new();
    let ctx = GpuContext::new(Arc::new(device.clone()), GpuSettings::default());

    device.fail_next_creation();
    let err = ctx
        .allocate_descriptors(DescriptorHeapKind::CbvSrvUav, 1)
        .unwrap_err();
    assert!(matches!(err, EmberError::DeviceObjectCreation { .. }));

    // The failure is one-shot.
    assert!(ctx.allocate_descriptors(DescriptorHeapKind::CbvSrvUav, 1).is_ok());
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn concurrent_allocations_never_overlap() {
    let ctx = Arc::new(context(64));

    let handles: Vec<_> = (0..4u32)
        .map(|t| {
            let ctx = ctx.clone();
            thread::spawn(move || {
                (0..50u32)
                    .map(|i| {
                        ctx.allocate_descriptors(DescriptorHeapKind::CbvSrvUav, 1 + (i + t) % 8)
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let blocks: Vec<DescriptorAllocation> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    let mut ranges: Vec<(usize, u32, u32)> = blocks
        .iter()
        .map(|b| (b.page_index(), b.offset(), b.offset() + b.count()))
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        let (page_a, _, end_a) = pair[0];
        let (page_b, start_b, _) = pair[1];
        if page_a == page_b {
            assert!(end_a <= start_b, "overlap in page {page_a}: {pair:?}");
        }
    }

    // Handles are unique too.
    let mut bases: Vec<_> = blocks.iter().map(|b| b.base()).collect();
    bases.sort_unstable();
    bases.dedup();
    assert_eq!(bases.len(), blocks.len());
}

// ============================================================================
// Views
// ============================================================================

#[test]
fn created_views_are_readable_through_their_handles() {
    init_logger();
    let device = HeadlessDevice::new();
    let ctx = GpuContext::new(Arc::new(device.clone()), GpuSettings::default());

    let sampler = ViewDesc::Sampler {
        filter: wgpu::FilterMode::Linear,
        address_mode: wgpu::AddressMode::Repeat,
    };
    let view = ctx.create_view(DescriptorHeapKind::Sampler, &sampler).unwrap();
    assert_eq!(device.descriptor(view.handle(0)), Some(sampler));
}
