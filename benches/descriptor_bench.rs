//! Descriptor and barrier hot-path benchmarks.
//!
//! Run with `cargo bench --bench descriptor_bench`.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};

use ember::descriptors::{DescriptorRange, DescriptorRangeKind};
use ember::hal::headless::HeadlessDevice;
use ember::hal::{DescriptorHeapKind, HeapType, QueueKind, ResourceStates, Subresource, ViewDesc};
use ember::{GpuContext, GpuSettings, RootParameter, RootSignature};

fn context() -> GpuContext {
    GpuContext::new(Arc::new(HeadlessDevice::new()), GpuSettings::default())
}

fn bench_allocate_release(c: &mut Criterion) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut group = c.benchmark_group("descriptor_allocator");

    for count in [1u32, 8, 64] {
        group.bench_with_input(BenchmarkId::new("allocate_drop", count), &count, |b, &count| {
            let ctx = context();
            b.iter(|| {
                let block = ctx
                    .allocate_descriptors(DescriptorHeapKind::CbvSrvUav, count)
                    .unwrap();
                black_box(block.base());
                drop(block);
                ctx.release_stale_descriptors(ctx.frame_clock().current());
            });
        });
    }

    group.bench_function("fragmented_page_release", |b| {
        let ctx = context();
        b.iter_batched(
            || {
                let blocks: Vec<_> = (0..128)
                    .map(|i| {
                        ctx.allocate_descriptors(DescriptorHeapKind::CbvSrvUav, 1 + i % 4)
                            .unwrap()
                    })
                    .collect();
                // Drop every other block first so releases have to merge.
                let (even, odd): (Vec<_>, Vec<_>) =
                    blocks.into_iter().enumerate().partition(|(i, _)| i % 2 == 0);
                (even, odd)
            },
            |(even, odd)| {
                drop(even);
                drop(odd);
                ctx.release_stale_descriptors(ctx.frame_clock().current());
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn bench_stage_and_draw(c: &mut Criterion) {
    let ctx = context();
    let queue = ctx.create_queue(QueueKind::Direct).unwrap();
    let signature = RootSignature::new(vec![
        RootParameter::DescriptorTable {
            ranges: vec![DescriptorRange::new(DescriptorRangeKind::ShaderResource, 8, 0)],
            visibility: wgpu::ShaderStages::FRAGMENT,
        },
        RootParameter::DescriptorTable {
            ranges: vec![DescriptorRange::new(DescriptorRangeKind::Sampler, 2, 0)],
            visibility: wgpu::ShaderStages::FRAGMENT,
        },
    ])
    .unwrap();
    let srv = ctx
        .create_view(DescriptorHeapKind::CbvSrvUav, &ViewDesc::Null)
        .unwrap();
    let sampler = ctx
        .create_view(
            DescriptorHeapKind::Sampler,
            &ViewDesc::Sampler {
                filter: wgpu::FilterMode::Linear,
                address_mode: wgpu::AddressMode::ClampToEdge,
            },
        )
        .unwrap();
    let srvs = [srv.base(); 8];
    let samplers = [sampler.base(); 2];

    c.bench_function("command_list/stage_commit_draw_x100", |b| {
        b.iter(|| {
            let mut list = queue.get_command_list().unwrap();
            list.set_graphics_root_signature(&signature).unwrap();
            for _ in 0..100 {
                list.stage_descriptors(DescriptorHeapKind::CbvSrvUav, 0, 0, &srvs);
                list.stage_descriptors(DescriptorHeapKind::Sampler, 1, 0, &samplers);
                list.draw(3, 1, 0, 0).unwrap();
            }
            black_box(queue.submit_one(list).unwrap())
        });
    });
    queue.flush().unwrap();
}

fn bench_barrier_resolution(c: &mut Criterion) {
    let ctx = context();
    let queue = ctx.create_queue(QueueKind::Direct).unwrap();
    let resources: Vec<_> = (0..256)
        .map(|_| {
            ctx.create_buffer(256, HeapType::Default, ResourceStates::COMMON)
                .unwrap()
                .resource()
                .unwrap()
        })
        .collect();

    let states = [
        ResourceStates::COPY_DEST,
        ResourceStates::VERTEX_AND_CONSTANT_BUFFER,
        ResourceStates::UNORDERED_ACCESS,
    ];
    let mut round = 0usize;

    c.bench_function("command_queue/resolve_256_pending", |b| {
        b.iter(|| {
            round += 1;
            let mut list = queue.get_command_list().unwrap();
            for (i, &resource) in resources.iter().enumerate() {
                list.transition_barrier(resource, states[(i + round) % 3], Subresource::All);
            }
            black_box(queue.submit_one(list).unwrap())
        });
    });
    queue.flush().unwrap();
}

criterion_group!(
    benches,
    bench_allocate_release,
    bench_stage_and_draw,
    bench_barrier_resolution
);
criterion_main!(benches);
