//! Submission, GPU job retirement and resource lifetime tests.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ash::vk;
use rstest::rstest;

use common::{generate_test_pattern, init_logging, TestContext};
use redlilium_rhi::backend::null::NullDriver;
use redlilium_rhi::{
    BufferDescriptor, BufferUsage, ClearValue, Device, DeviceParameters, Image, ImageDescriptor,
    ImageFormat, ImageUsage, MemoryLocation, NullCompletion, QueueType, RhiError,
    SubmissionState,
};

// ============================================================================
// Lifetime
// ============================================================================

/// A buffer dropped by the caller while the GPU still copies into it stays
/// alive until the job's fence signals.
#[test]
fn test_buffer_outlives_caller_until_fence() {
    let ctx = TestContext::new(NullCompletion::Manual);
    let staging = ctx.create_staging(&generate_test_pattern(256));
    let target = ctx.create_gpu_buffer(256, BufferUsage::STORAGE);
    let handle = target.handle();

    let queue = ctx.queue(QueueType::Transfer);
    let list = queue.create_command_list(Some("upload"));
    {
        let mut context = list.begin().unwrap();
        context.copy_buffer(&staging, 0, &target, 0, 256).unwrap();
        context.finish().unwrap();
    }
    list.commit().unwrap();
    assert_eq!(queue.submit().unwrap(), 1);

    drop(target);
    assert!(ctx.driver.is_alive(handle));
    assert_eq!(queue.poll().unwrap(), 0);
    assert!(ctx.driver.is_alive(handle));
    assert_eq!(queue.in_flight_jobs(), 1);

    ctx.driver.complete_all();
    assert_eq!(queue.poll().unwrap(), 1);
    assert!(!ctx.driver.is_alive(handle));
    assert_eq!(list.submission_state(), SubmissionState::Retired);
    assert_eq!(ctx.device.deferred_count(), 0);
}

/// A resource dropped after a submission on another queue waits for that
/// queue too.
#[test]
fn test_drop_waits_for_every_queue() {
    let ctx = TestContext::new(NullCompletion::Manual);
    let (texture, _view) = ctx.create_texture(4, 4);
    let handle = texture.handle();

    let compute = ctx.queue(QueueType::Compute);
    let list = compute.create_command_list(None);
    {
        let mut context = list.begin().unwrap();
        context
            .transition_image(&texture, None, redlilium_rhi::ResourceState::ShaderResource)
            .unwrap();
        context.finish().unwrap();
    }
    list.commit().unwrap();
    compute.submit().unwrap();

    drop(texture);
    assert!(ctx.driver.is_alive(handle));

    ctx.driver.complete_all();
    compute.poll().unwrap();
    assert!(!ctx.driver.is_alive(handle));
}

/// Creating and dropping resources, recording and submitting leaves no
/// native object behind once the device is gone.
#[rstest]
#[case::immediate(NullCompletion::Immediate)]
#[case::manual(NullCompletion::Manual)]
fn test_no_native_objects_leak(#[case] completion: NullCompletion) {
    init_logging();
    let driver = Arc::new(NullDriver::new(completion));
    {
        let ctx = TestContext {
            driver: driver.clone(),
            device: Device::with_driver(driver.clone(), DeviceParameters::headless(completion))
                .unwrap(),
        };
        let (texture, view) = ctx.create_texture(16, 16);
        let staging = ctx.create_staging(&generate_test_pattern(16 * 16 * 4));
        let target = ctx.create_render_target(16, 16);
        let pipeline = ctx.create_textured_pipeline(&target.render_pass);

        let queue = ctx.queue(QueueType::Graphics);
        let list = queue.create_command_list(None);
        {
            let mut upload = list.begin().unwrap();
            upload.copy_buffer_to_image(&staging, 0, &texture, 0).unwrap();
            upload.finish().unwrap();
        }
        {
            let pass = list
                .begin_render_pass(&target.framebuffer, &[ClearValue::default()])
                .unwrap();
            let mut draws = pass.subpass_context().unwrap();
            draws.bind_pipeline(&pipeline).unwrap();
            draws.bind_image_view(0, 0, 0, &view).unwrap();
            draws.draw(3, 1, 0, 0).unwrap();
            draws.finish().unwrap();
            pass.finish().unwrap();
        }
        list.commit().unwrap();
        queue.submit_frame().unwrap();
        assert!(driver.live_count("image") >= 2);
    }
    assert_eq!(driver.live_handles(), 0);
}

// ============================================================================
// Frame and job pacing
// ============================================================================

/// Starting a frame on a slot whose previous frame is still running blocks
/// until the GPU finishes it.
#[test]
fn test_frame_ring_blocks_until_completion() {
    let ctx = TestContext::with_parameters(
        DeviceParameters::headless(NullCompletion::Manual).with_frames_in_flight(2),
    );
    let queue = ctx.queue(QueueType::Graphics).clone();
    queue.submit_frame().unwrap();
    queue.submit_frame().unwrap();
    assert_eq!(ctx.driver.pending_submissions(), 2);
    assert_eq!(queue.frame_index(), 2);

    let released = Arc::new(AtomicBool::new(false));
    let completer = {
        let driver = ctx.driver.clone();
        let released = released.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            released.store(true, Ordering::SeqCst);
            driver.complete_next();
        })
    };

    queue.submit_frame().unwrap();
    assert!(released.load(Ordering::SeqCst));
    completer.join().unwrap();
    assert_eq!(queue.frame_index(), 3);
}

#[test]
fn test_frame_ring_times_out() {
    let ctx = TestContext::with_parameters(
        DeviceParameters::headless(NullCompletion::Manual)
            .with_frames_in_flight(1)
            .with_fence_timeout(Duration::from_millis(20)),
    );
    let queue = ctx.queue(QueueType::Graphics);
    queue.submit_frame().unwrap();
    assert_eq!(queue.submit_frame(), Err(RhiError::FenceTimeout));

    ctx.driver.complete_all();
    queue.submit_frame().unwrap();
}

/// With a full job ring, the next submission waits for the oldest job.
#[test]
fn test_job_ring_is_bounded() {
    let ctx = TestContext::with_parameters(
        DeviceParameters::headless(NullCompletion::Manual)
            .with_max_jobs_in_flight(2)
            .with_fence_timeout(Duration::from_millis(20)),
    );
    let staging = ctx.create_staging(&generate_test_pattern(64));
    let target = ctx.create_gpu_buffer(64, BufferUsage::empty());
    let queue = ctx.queue(QueueType::Transfer);

    let submit_copy = || {
        let list = queue.create_command_list(None);
        let mut context = list.begin()?;
        context.copy_buffer(&staging, 0, &target, 0, 64)?;
        context.finish()?;
        list.commit()?;
        queue.submit()
    };
    submit_copy().unwrap();
    submit_copy().unwrap();
    assert_eq!(queue.in_flight_jobs(), 2);
    assert_eq!(submit_copy(), Err(RhiError::FenceTimeout));

    ctx.driver.complete_next();
    submit_copy().unwrap();
    assert_eq!(queue.in_flight_jobs(), 2);
}

/// A submission that cannot get a fence leaves its lists pending and the
/// images they touch in their previous state.
#[test]
fn test_fence_timeout_keeps_lists_pending() {
    let ctx = TestContext::with_parameters(
        DeviceParameters::headless(NullCompletion::Manual)
            .with_max_jobs_in_flight(1)
            .with_fence_timeout(Duration::from_millis(20)),
    );
    let staging = ctx.create_staging(&generate_test_pattern(256));
    let (texture, _view) = ctx.create_texture(8, 8);
    let queue = ctx.queue(QueueType::Transfer);

    let busy = queue.create_command_list(Some("busy"));
    busy.begin().unwrap().finish().unwrap();
    busy.commit().unwrap();
    queue.submit().unwrap();

    let upload = queue.create_command_list(Some("upload"));
    {
        let mut context = upload.begin().unwrap();
        context.copy_buffer_to_image(&staging, 0, &texture, 0).unwrap();
        context.finish().unwrap();
    }
    upload.commit().unwrap();
    assert_eq!(queue.submit(), Err(RhiError::FenceTimeout));

    let layout = |texture: &Image| {
        texture.sync_state().state_at(0, 0).map(|access| access.layout)
    };
    assert_eq!(upload.submission_state(), SubmissionState::Committed);
    assert_eq!(queue.pending_count(), 1);
    assert_eq!(layout(&texture), Some(vk::ImageLayout::UNDEFINED));
    assert!(upload.touches_image(&texture));

    ctx.driver.complete_all();
    assert_eq!(queue.submit().unwrap(), 1);
    assert_eq!(queue.pending_count(), 0);
    assert_eq!(upload.submission_state(), SubmissionState::InFlight);
    assert_eq!(layout(&texture), Some(vk::ImageLayout::TRANSFER_DST_OPTIMAL));

    // The retried submission carries the barrier out of UNDEFINED.
    let submission = ctx.job_submissions().pop().unwrap();
    let barriers = common::image_barriers(&submission, texture.handle());
    assert_eq!(barriers[0].old_layout, vk::ImageLayout::UNDEFINED);
    assert_eq!(barriers[0].new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);

    ctx.driver.complete_all();
    queue.poll().unwrap();
    assert_eq!(upload.submission_state(), SubmissionState::Retired);
}

// ============================================================================
// Submission details
// ============================================================================

#[test]
fn test_only_committed_lists_are_submitted() {
    let ctx = TestContext::new(NullCompletion::Immediate);
    let queue = ctx.queue(QueueType::Compute);

    let first = queue.create_command_list(Some("first"));
    let second = queue.create_command_list(Some("second"));
    first.enqueue().unwrap();
    second.enqueue().unwrap();
    first.enqueue().unwrap();
    assert_eq!(queue.pending_count(), 2);

    second.begin().unwrap().finish().unwrap();
    second.commit().unwrap();
    assert_eq!(queue.submit().unwrap(), 1);
    assert_eq!(second.submission_state(), SubmissionState::Retired);
    assert_eq!(first.submission_state(), SubmissionState::Enqueued);
    assert_eq!(queue.pending_count(), 1);

    first.commit().unwrap();
    assert_eq!(queue.submit().unwrap(), 1);
    assert_eq!(queue.pending_count(), 0);
    assert!(first.commit().is_err());
}

#[test]
fn test_commit_while_recording_fails() {
    let ctx = TestContext::new(NullCompletion::Immediate);
    let list = ctx.queue(QueueType::Graphics).create_command_list(None);
    let context = list.begin().unwrap();
    assert!(matches!(list.commit(), Err(RhiError::InvalidState(_))));
    context.finish().unwrap();
    list.commit().unwrap();
}

/// A semaphore registered for an image is waited on by the first list
/// that touches the image, and only by that one.
#[test]
fn test_image_wait_attaches_to_first_user() {
    let ctx = TestContext::new(NullCompletion::Immediate);
    let target = ctx.create_render_target(8, 8);
    let acquired = ctx.device.create_semaphore().unwrap();
    let queue = ctx.queue(QueueType::Graphics);
    queue.wait_for_image(
        &target.image,
        acquired.clone(),
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
    );

    let unrelated = queue.create_command_list(Some("unrelated"));
    unrelated.begin().unwrap().finish().unwrap();
    unrelated.commit().unwrap();
    queue.submit().unwrap();

    for _ in 0..2 {
        let list = queue.create_command_list(Some("draw"));
        list.begin_render_pass(&target.framebuffer, &[ClearValue::default()])
            .unwrap()
            .finish()
            .unwrap();
        list.commit().unwrap();
        queue.submit().unwrap();
    }

    let waits: Vec<usize> = ctx
        .job_submissions()
        .iter()
        .map(|submission| submission.batches[0].wait_semaphores.len())
        .collect();
    assert_eq!(waits, vec![0, 1, 0]);
    let submissions = ctx.job_submissions();
    assert_eq!(
        submissions[1].batches[0].wait_semaphores[0],
        (
            acquired.handle(),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        )
    );
}

// ============================================================================
// Device uploads
// ============================================================================

#[test]
fn test_buffer_init_through_staging() {
    let ctx = TestContext::new(NullCompletion::Immediate);
    let data = generate_test_pattern(512);
    let buffer = ctx
        .device
        .create_buffer_init(
            &BufferDescriptor::new(512, BufferUsage::VERTEX | BufferUsage::COPY_DST),
            &data,
        )
        .unwrap();
    assert_eq!(ctx.driver.buffer_contents(buffer.handle()), Some(data));

    let transfers = ctx
        .job_submissions()
        .iter()
        .filter(|submission| submission.queue == QueueType::Transfer)
        .count();
    assert_eq!(transfers, 1);
    // The staging buffer is gone once the upload retired.
    assert_eq!(ctx.driver.live_count("buffer"), 1);
}

#[test]
fn test_buffer_init_host_visible_and_pod() {
    let ctx = TestContext::new(NullCompletion::Manual);
    let values: [f32; 4] = [1.0, 2.0, 3.0, 4.0];
    let buffer = ctx
        .device
        .create_buffer_from_slice(
            &BufferDescriptor::new(16, BufferUsage::UNIFORM).with_location(MemoryLocation::CpuToGpu),
            &values,
        )
        .unwrap();
    assert!(ctx.job_submissions().is_empty());

    let mut out = [0u8; 16];
    ctx.device.read_buffer(&buffer, 0, &mut out).unwrap();
    assert_eq!(&out, bytemuck::cast_slice::<f32, u8>(&values));
}

#[test]
fn test_buffer_init_needs_copy_dst() {
    let ctx = TestContext::new(NullCompletion::Immediate);
    let result = ctx
        .device
        .create_buffer_init(&BufferDescriptor::new(16, BufferUsage::VERTEX), &[0; 16]);
    assert!(matches!(result, Err(RhiError::InvalidState(_))));
}

#[test]
fn test_image_init_settles_in_default_state() {
    let ctx = TestContext::new(NullCompletion::Immediate);
    let image = ctx
        .device
        .create_image_init(
            &ImageDescriptor::new_2d(4, 4, ImageFormat::Rgba8Unorm, ImageUsage::COPY_DST | ImageUsage::SAMPLED),
            &generate_test_pattern(4 * 4 * 4),
        )
        .unwrap();
    let states = image.sync_state().states();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].1.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

    let short = ctx.device.create_image_init(
        &ImageDescriptor::new_2d(4, 4, ImageFormat::Rgba8Unorm, ImageUsage::COPY_DST),
        &[0; 8],
    );
    assert!(matches!(short, Err(RhiError::InvalidState(_))));
}
