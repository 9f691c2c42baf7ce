use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use redlilium_rhi::sync::{AccessRecord, AccessTracker, BufferSyncState, ImageSyncState};
use redlilium_rhi::{ResourceState, SubresourceRange};

const STATES: [ResourceState; 5] = [
    ResourceState::ShaderResource,
    ResourceState::RenderTarget,
    ResourceState::CopyDest,
    ResourceState::CopySource,
    ResourceState::UnorderedAccess,
];

fn image(raw: u64, mips: u32, layers: u32) -> Arc<ImageSyncState> {
    Arc::new(ImageSyncState::new(
        vk::Image::from_raw(raw),
        vk::ImageAspectFlags::COLOR,
        SubresourceRange::new(0, mips, 0, layers),
    ))
}

// ---------------------------------------------------------------------------
// Transitions within one command list
// ---------------------------------------------------------------------------

fn bench_whole_image_transitions(c: &mut Criterion) {
    let images: Vec<_> = (1..=64).map(|i| image(i, 1, 1)).collect();
    c.bench_function("tracker_64_images_upload_then_sample", |b| {
        b.iter(|| {
            let mut tracker = AccessTracker::new();
            for image in &images {
                let range = image.full_range();
                tracker.transition_image(image, range, AccessRecord::from_state(ResourceState::CopyDest));
                tracker.transition_image(
                    image,
                    range,
                    AccessRecord::from_state(ResourceState::ShaderResource),
                );
            }
            black_box(tracker.pending_barriers().image_barriers().len());
        });
    });
}

/// Mip chain generation: each level is written then read by the next.
fn bench_mip_chain(c: &mut Criterion) {
    let texture = image(1, 12, 6);
    c.bench_function("tracker_mip_chain_12x6", |b| {
        b.iter(|| {
            let mut tracker = AccessTracker::new();
            for mip in 1..12 {
                tracker.transition_image(
                    &texture,
                    SubresourceRange::new(mip - 1, 1, 0, 6),
                    AccessRecord::from_state(ResourceState::CopySource),
                );
                tracker.transition_image(
                    &texture,
                    SubresourceRange::new(mip, 1, 0, 6),
                    AccessRecord::from_state(ResourceState::CopyDest),
                );
            }
            tracker.transition_image(
                &texture,
                texture.full_range(),
                AccessRecord::from_state(ResourceState::ShaderResource),
            );
            black_box(tracker.tracked_images());
        });
    });
}

/// Random subresource rectangles fragment the partitions.
fn bench_random_ranges(c: &mut Criterion) {
    let texture = image(1, 10, 16);
    let mut rng = StdRng::seed_from_u64(42);
    let accesses: Vec<_> = (0..256)
        .map(|_| {
            let base_mip = rng.gen_range(0..10);
            let base_layer = rng.gen_range(0..16);
            let range = SubresourceRange::new(
                base_mip,
                rng.gen_range(1..=10 - base_mip),
                base_layer,
                rng.gen_range(1..=16 - base_layer),
            );
            (range, STATES[rng.gen_range(0..STATES.len())])
        })
        .collect();

    c.bench_function("tracker_random_ranges_256", |b| {
        b.iter(|| {
            let mut tracker = AccessTracker::new();
            for (range, state) in &accesses {
                tracker.transition_image(&texture, *range, AccessRecord::from_state(*state));
            }
            black_box(tracker.last_accesses(texture.handle()).len());
        });
    });
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

fn bench_resolve_first_accesses(c: &mut Criterion) {
    let images: Vec<_> = (1..=32).map(|i| image(i, 4, 2)).collect();
    let buffers: Vec<_> = (1..=32)
        .map(|i| Arc::new(BufferSyncState::new(vk::Buffer::from_raw(1000 + i))))
        .collect();
    let mut rng = StdRng::seed_from_u64(7);
    let plan: Vec<_> = (0..images.len())
        .map(|_| {
            (
                STATES[rng.gen_range(0..STATES.len())],
                STATES[rng.gen_range(0..STATES.len())],
            )
        })
        .collect();

    c.bench_function("tracker_resolve_32_images_32_buffers", |b| {
        b.iter(|| {
            let mut tracker = AccessTracker::new();
            for ((image, buffer), (image_state, buffer_state)) in
                images.iter().zip(&buffers).zip(&plan)
            {
                tracker.transition_image(
                    image,
                    image.full_range(),
                    AccessRecord::from_state(*image_state),
                );
                tracker.transition_buffer(buffer, AccessRecord::from_state(*buffer_state));
            }
            let batch = tracker.resolve_first_accesses();
            black_box(batch.image_barriers().len() + batch.memory_barriers().len());
        });
    });
}

criterion_group!(
    benches,
    bench_whole_image_transitions,
    bench_mip_chain,
    bench_random_ranges,
    bench_resolve_first_accesses,
);
criterion_main!(benches);
