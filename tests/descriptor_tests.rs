//! Resource binding and descriptor set tests.

mod common;

use std::sync::Arc;

use ash::vk;
use rstest::rstest;

use common::{command_names, image_barriers, TestContext, SPIRV_MAGIC};
use redlilium_rhi::backend::null::RecordedCommand;
use redlilium_rhi::backend::{DescriptorResource, DescriptorWrite};
use redlilium_rhi::{
    BufferUsage, ClearValue, ComputePipelineDescriptor, DescriptorType, ImageDescriptor,
    ImageFormat, ImageUsage, ImageViewDescriptor, NullCompletion, Pipeline, QueueType,
    ResourceBinding, RhiError, ShaderDescriptor, ShaderKey, ShaderStages,
};

fn compute_pipeline(ctx: &TestContext, bindings: Vec<ResourceBinding>) -> Arc<Pipeline> {
    let mut descriptor = ShaderDescriptor::new(
        ShaderKey::new("shaders/simulate.comp", "spirv-1.3", "main"),
        ShaderStages::COMPUTE,
        vec![SPIRV_MAGIC],
    );
    for binding in bindings {
        descriptor = descriptor.with_resource(0, binding);
    }
    let shader = ctx.device.create_shader(&descriptor).unwrap();
    ctx.device
        .create_compute_pipeline(&ComputePipelineDescriptor::new(shader).with_label("simulate"))
        .unwrap()
}

/// Changing one binding between draws writes a fresh set; the set used by
/// the earlier draw is left as it was written.
#[rstest]
#[case::immediate(NullCompletion::Immediate)]
#[case::manual(NullCompletion::Manual)]
fn test_rebinding_allocates_fresh_set(#[case] completion: NullCompletion) {
    let ctx = TestContext::new(completion);
    let (_first, first_view) = ctx.create_texture(8, 8);
    let (_second, second_view) = ctx.create_texture(8, 8);
    let target = ctx.create_render_target(8, 8);
    let pipeline = ctx.create_textured_pipeline(&target.render_pass);
    let allocations = ctx.driver.descriptor_set_allocations();

    let queue = ctx.queue(QueueType::Graphics);
    let list = queue.create_command_list(None);
    {
        let pass = list
            .begin_render_pass(&target.framebuffer, &[ClearValue::default()])
            .unwrap();
        let mut draws = pass.subpass_context().unwrap();
        draws.bind_pipeline(&pipeline).unwrap();
        draws.bind_image_view(0, 0, 0, &first_view).unwrap();
        draws.draw(3, 1, 0, 0).unwrap();
        assert!(!draws.bindings().is_dirty());

        draws.bind_image_view(0, 0, 0, &second_view).unwrap();
        assert!(draws.bindings().is_set_dirty(0));
        draws.draw(3, 1, 0, 0).unwrap();
        // Nothing changed: the bound set is reused.
        draws.draw(3, 1, 0, 0).unwrap();
        draws.finish().unwrap();
        pass.finish().unwrap();
    }
    assert_eq!(ctx.driver.descriptor_set_allocations(), allocations + 2);

    let updates = ctx.driver.descriptor_updates();
    let (first_set, first_writes) = &updates[updates.len() - 2];
    let (second_set, second_writes) = &updates[updates.len() - 1];
    assert_ne!(first_set, second_set);
    assert_eq!(
        first_writes.as_slice(),
        &[DescriptorWrite {
            binding: 0,
            array_element: 0,
            ty: DescriptorType::SampledImage,
            resource: DescriptorResource::Image {
                view: first_view.handle(),
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        }]
    );
    assert_eq!(
        second_writes[0].resource,
        DescriptorResource::Image {
            view: second_view.handle(),
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    );
    assert_eq!(
        updates.iter().filter(|(set, _)| set == first_set).count(),
        1
    );

    // Transient sets go back to their pool once the job retires.
    list.commit().unwrap();
    queue.submit().unwrap();
    ctx.driver.complete_all();
    queue.poll().unwrap();
    assert_eq!(pipeline.set_layout(0).unwrap().live_sets(), 0);
}

/// Uniform buffer A, dispatch, uniform buffer B, dispatch: B lands in a new
/// set and the set written for A still points at A.
#[test]
fn test_rebinding_buffer_allocates_fresh_set() {
    let ctx = TestContext::new(NullCompletion::Manual);
    let a = ctx.create_gpu_buffer(256, BufferUsage::UNIFORM);
    let b = ctx.create_gpu_buffer(256, BufferUsage::UNIFORM);
    let pipeline = compute_pipeline(
        &ctx,
        vec![ResourceBinding::new(0, DescriptorType::UniformBuffer, ShaderStages::COMPUTE)],
    );
    let allocations = ctx.driver.descriptor_set_allocations();

    let queue = ctx.queue(QueueType::Compute);
    let list = queue.create_command_list(None);
    {
        let mut context = list.begin().unwrap();
        context.bind_pipeline(&pipeline).unwrap();
        context.bind_uniform_buffer(0, 0, 0, &a, 0, Some(128)).unwrap();
        context.dispatch(1, 1, 1).unwrap();
        context.bind_uniform_buffer(0, 0, 0, &b, 64, None).unwrap();
        context.dispatch(1, 1, 1).unwrap();
        context.finish().unwrap();
    }
    assert_eq!(ctx.driver.descriptor_set_allocations(), allocations + 2);

    let updates = ctx.driver.descriptor_updates();
    let (first_set, first_writes) = &updates[updates.len() - 2];
    let (second_set, second_writes) = &updates[updates.len() - 1];
    assert_ne!(first_set, second_set);
    assert_eq!(
        first_writes[0].resource,
        DescriptorResource::Buffer {
            buffer: a.handle(),
            offset: 0,
            range: 128,
        }
    );
    assert_eq!(
        second_writes[0].resource,
        DescriptorResource::Buffer {
            buffer: b.handle(),
            offset: 64,
            range: vk::WHOLE_SIZE,
        }
    );
    assert_eq!(
        updates.iter().filter(|(set, _)| set == first_set).count(),
        1
    );

    list.commit().unwrap();
    queue.submit().unwrap();
    ctx.driver.complete_all();
    queue.poll().unwrap();
    assert_eq!(pipeline.set_layout(0).unwrap().live_sets(), 0);
}

/// Every dispatch through a storage binding is a new write, so consecutive
/// dispatches are separated by a barrier even without rebinding.
#[test]
fn test_repeated_storage_buffer_writes_are_ordered() {
    let ctx = TestContext::new(NullCompletion::Immediate);
    let particles = ctx.create_gpu_buffer(1024, BufferUsage::STORAGE);
    let pipeline = compute_pipeline(
        &ctx,
        vec![ResourceBinding::new(0, DescriptorType::StorageBuffer, ShaderStages::COMPUTE)],
    );

    let queue = ctx.queue(QueueType::Compute);
    let list = queue.create_command_list(None);
    {
        let mut context = list.begin().unwrap();
        context.bind_pipeline(&pipeline).unwrap();
        context.bind_storage_buffer(0, 0, 0, &particles, 0, None).unwrap();
        for _ in 0..3 {
            context.dispatch(64, 1, 1).unwrap();
        }
        context.finish().unwrap();
    }
    list.commit().unwrap();
    queue.submit().unwrap();

    let submission = ctx.job_submissions().pop().unwrap();
    let names: Vec<_> = command_names(&submission.commands)
        .into_iter()
        .filter(|name| matches!(*name, "barrier" | "dispatch"))
        .collect();
    assert_eq!(
        names[names.len() - 5..],
        ["dispatch", "barrier", "dispatch", "barrier", "dispatch"]
    );
    let write_barriers = submission
        .commands
        .iter()
        .filter_map(|command| match command {
            RecordedCommand::PipelineBarrier(batch) => Some(batch.memory_barriers()),
            _ => None,
        })
        .flatten()
        .filter(|barrier| {
            barrier.src_access.contains(vk::AccessFlags::SHADER_WRITE)
                && barrier.dst_access.contains(vk::AccessFlags::SHADER_WRITE)
        })
        .count();
    assert_eq!(write_barriers, 2);
}

#[test]
fn test_repeated_storage_image_writes_are_ordered() {
    let ctx = TestContext::new(NullCompletion::Immediate);
    let image = ctx
        .device
        .create_image(&ImageDescriptor::new_2d(
            32,
            32,
            ImageFormat::Rgba8Unorm,
            ImageUsage::STORAGE | ImageUsage::SAMPLED,
        ))
        .unwrap();
    let view = ctx
        .device
        .create_image_view(&image, &ImageViewDescriptor::default())
        .unwrap();
    let pipeline = compute_pipeline(
        &ctx,
        vec![ResourceBinding::new(0, DescriptorType::StorageImage, ShaderStages::COMPUTE)],
    );

    let queue = ctx.queue(QueueType::Compute);
    let list = queue.create_command_list(None);
    {
        let mut context = list.begin().unwrap();
        context.bind_pipeline(&pipeline).unwrap();
        context.bind_storage_image(0, 0, 0, &view).unwrap();
        context.dispatch(4, 4, 1).unwrap();
        context.dispatch(4, 4, 1).unwrap();
        context.finish().unwrap();
    }
    list.commit().unwrap();
    queue.submit().unwrap();

    let submission = ctx.job_submissions().pop().unwrap();
    let barriers = image_barriers(&submission, image.handle());
    // Into GENERAL before the list, then between the two dispatches.
    assert_eq!(barriers.len(), 2);
    assert_eq!(barriers[1].old_layout, vk::ImageLayout::GENERAL);
    assert_eq!(barriers[1].new_layout, vk::ImageLayout::GENERAL);
    assert!(barriers[1].src_access.contains(vk::AccessFlags::SHADER_WRITE));
}

#[test]
fn test_unbind_removes_entry() {
    let ctx = TestContext::new(NullCompletion::Immediate);
    let buffer = ctx.create_gpu_buffer(256, BufferUsage::STORAGE);
    let pipeline = compute_pipeline(
        &ctx,
        vec![ResourceBinding::new(0, DescriptorType::StorageBuffer, ShaderStages::COMPUTE)],
    );

    let queue = ctx.queue(QueueType::Compute);
    let list = queue.create_command_list(None);
    let mut context = list.begin().unwrap();
    context.bind_pipeline(&pipeline).unwrap();
    context.bind_storage_buffer(0, 0, 0, &buffer, 0, None).unwrap();
    assert_eq!(context.bindings().len(), 1);
    context.dispatch(4, 1, 1).unwrap();

    context.unbind(0, 0, 0);
    assert!(context.bindings().get(0, 0, 0).is_none());
    assert!(context.bindings().is_empty());
    assert!(context.bindings().is_set_dirty(0));
    context.finish().unwrap();
}

/// Storage buffers are written as whole-size ranges and tracked as writes.
#[test]
fn test_dispatch_writes_storage_buffer() {
    let ctx = TestContext::new(NullCompletion::Immediate);
    let particles = ctx.create_gpu_buffer(1024, BufferUsage::STORAGE);
    let pipeline = compute_pipeline(
        &ctx,
        vec![ResourceBinding::new(0, DescriptorType::StorageBuffer, ShaderStages::COMPUTE)],
    );

    let queue = ctx.queue(QueueType::Compute);
    let list = queue.create_command_list(Some("simulate"));
    {
        let mut context = list.begin().unwrap();
        context.bind_pipeline(&pipeline).unwrap();
        context.bind_storage_buffer(0, 0, 0, &particles, 0, None).unwrap();
        context.dispatch(16, 1, 1).unwrap();
        context.finish().unwrap();
    }
    list.commit().unwrap();
    queue.submit().unwrap();

    let updates = ctx.driver.descriptor_updates();
    let (_, writes) = updates.last().unwrap();
    assert_eq!(
        writes[0].resource,
        DescriptorResource::Buffer {
            buffer: particles.handle(),
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    );
}

#[test]
fn test_binding_not_in_layout_is_skipped() {
    let ctx = TestContext::new(NullCompletion::Immediate);
    let used = ctx.create_gpu_buffer(64, BufferUsage::STORAGE);
    let unused = ctx.create_gpu_buffer(64, BufferUsage::STORAGE);
    let pipeline = compute_pipeline(
        &ctx,
        vec![ResourceBinding::new(0, DescriptorType::StorageBuffer, ShaderStages::COMPUTE)],
    );

    let queue = ctx.queue(QueueType::Compute);
    let list = queue.create_command_list(None);
    let mut context = list.begin().unwrap();
    context.bind_pipeline(&pipeline).unwrap();
    context.bind_storage_buffer(0, 0, 0, &used, 0, None).unwrap();
    context.bind_storage_buffer(0, 7, 0, &unused, 0, None).unwrap();
    context.dispatch(1, 1, 1).unwrap();
    context.finish().unwrap();

    let updates = ctx.driver.descriptor_updates();
    assert_eq!(updates.last().unwrap().1.len(), 1);
}

#[test]
fn test_array_element_out_of_range() {
    let ctx = TestContext::new(NullCompletion::Immediate);
    let buffer = ctx.create_gpu_buffer(64, BufferUsage::STORAGE);
    let pipeline = compute_pipeline(
        &ctx,
        vec![
            ResourceBinding::new(0, DescriptorType::StorageBuffer, ShaderStages::COMPUTE)
                .with_count(2),
        ],
    );

    let queue = ctx.queue(QueueType::Compute);
    let list = queue.create_command_list(None);
    let mut context = list.begin().unwrap();
    context.bind_pipeline(&pipeline).unwrap();
    context.bind_storage_buffer(0, 0, 2, &buffer, 0, None).unwrap();
    assert!(matches!(
        context.dispatch(1, 1, 1),
        Err(RhiError::InvalidState(_))
    ));
    context.unbind(0, 0, 2);
    context.bind_storage_buffer(0, 0, 1, &buffer, 0, None).unwrap();
    context.dispatch(1, 1, 1).unwrap();
    context.finish().unwrap();
}

#[test]
fn test_binding_type_mismatch() {
    let ctx = TestContext::new(NullCompletion::Immediate);
    let (_texture, view) = ctx.create_texture(4, 4);
    let pipeline = compute_pipeline(
        &ctx,
        vec![ResourceBinding::new(0, DescriptorType::UniformBuffer, ShaderStages::COMPUTE)],
    );

    let queue = ctx.queue(QueueType::Compute);
    let list = queue.create_command_list(None);
    let mut context = list.begin().unwrap();
    context.bind_pipeline(&pipeline).unwrap();
    context.bind_image_view(0, 0, 0, &view).unwrap();
    assert!(matches!(
        context.dispatch(1, 1, 1),
        Err(RhiError::InvalidState(_))
    ));
    context.finish().unwrap();
}

#[test]
fn test_texel_buffers_are_unimplemented() {
    let ctx = TestContext::new(NullCompletion::Immediate);
    let buffer = ctx.create_gpu_buffer(64, BufferUsage::UNIFORM);
    let queue = ctx.queue(QueueType::Compute);
    let list = queue.create_command_list(None);
    let mut context = list.begin().unwrap();
    assert_eq!(
        context.bind_texel_buffer(0, 0, 0, &buffer),
        Err(RhiError::Unimplemented("bind_texel_buffer"))
    );
    context.finish().unwrap();
}

/// Pipelines with structurally identical set layouts share one layout.
#[test]
fn test_pipelines_share_layouts() {
    let ctx = TestContext::new(NullCompletion::Immediate);
    let bindings = vec![ResourceBinding::new(
        0,
        DescriptorType::StorageBuffer,
        ShaderStages::COMPUTE,
    )];
    let a = compute_pipeline(&ctx, bindings.clone());
    let b = ctx
        .device
        .create_compute_pipeline(&ComputePipelineDescriptor::new(
            ctx.device
                .create_shader(
                    &ShaderDescriptor::new(
                        ShaderKey::new("shaders/integrate.comp", "spirv-1.3", "main"),
                        ShaderStages::COMPUTE,
                        vec![SPIRV_MAGIC],
                    )
                    .with_resource(0, bindings[0]),
                )
                .unwrap(),
        ))
        .unwrap();
    assert!(Arc::ptr_eq(
        a.set_layout(0).unwrap(),
        b.set_layout(0).unwrap()
    ));
}
