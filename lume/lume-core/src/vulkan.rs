//! Synchronization2 translation of barrier batches.
//!
//! Only `ash` types are touched here; recording `vkCmdPipelineBarrier2` is left to the
//! native command list that owns the `vk::CommandBuffer`.

use crate::barrier::{BarrierAccess, BarrierBatch, BarrierSync, ResourceBarrierItem, TextureLayout};
use crate::resource::ResourceHandle;
use ash::vk;

const LOG_TARGET: &str = "lume::barrier";

pub fn sync_to_vk(sync: BarrierSync) -> vk::PipelineStageFlags2 {
    if sync.contains(BarrierSync::ALL) {
        return vk::PipelineStageFlags2::ALL_COMMANDS;
    }
    let mut flags = vk::PipelineStageFlags2::NONE;
    if sync.contains(BarrierSync::DRAW) {
        flags |= vk::PipelineStageFlags2::ALL_GRAPHICS;
    }
    if sync.contains(BarrierSync::INDEX_INPUT) {
        flags |= vk::PipelineStageFlags2::INDEX_INPUT;
    }
    if sync.contains(BarrierSync::VERTEX_SHADING) {
        flags |= vk::PipelineStageFlags2::VERTEX_SHADER;
    }
    if sync.contains(BarrierSync::PIXEL_SHADING) {
        flags |= vk::PipelineStageFlags2::FRAGMENT_SHADER;
    }
    if sync.contains(BarrierSync::DEPTH_STENCIL) {
        flags |= vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS;
    }
    if sync.contains(BarrierSync::RENDER_TARGET) {
        flags |= vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT;
    }
    if sync.contains(BarrierSync::COMPUTE_SHADING) {
        flags |= vk::PipelineStageFlags2::COMPUTE_SHADER;
    }
    if sync.contains(BarrierSync::RAYTRACING) {
        flags |= vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR;
    }
    if sync.contains(BarrierSync::COPY) {
        flags |= vk::PipelineStageFlags2::COPY;
    }
    if sync.contains(BarrierSync::RESOLVE) {
        flags |= vk::PipelineStageFlags2::RESOLVE;
    }
    if sync.contains(BarrierSync::EXECUTE_INDIRECT) {
        flags |= vk::PipelineStageFlags2::DRAW_INDIRECT;
    }
    if sync.contains(BarrierSync::BUILD_ACCELERATION_STRUCTURE) {
        flags |= vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR;
    }
    if sync.contains(BarrierSync::COPY_ACCELERATION_STRUCTURE) {
        flags |= vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_COPY_KHR;
    }
    flags
}

pub fn access_to_vk(access: BarrierAccess) -> vk::AccessFlags2 {
    const TABLE: &[(BarrierAccess, vk::AccessFlags2)] = &[
        (BarrierAccess::VERTEX_BUFFER, vk::AccessFlags2::VERTEX_ATTRIBUTE_READ),
        (BarrierAccess::CONSTANT_BUFFER, vk::AccessFlags2::UNIFORM_READ),
        (BarrierAccess::INDEX_BUFFER, vk::AccessFlags2::INDEX_READ),
        (BarrierAccess::RENDER_TARGET, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE),
        (BarrierAccess::UNORDERED_ACCESS, vk::AccessFlags2::SHADER_STORAGE_WRITE),
        (
            BarrierAccess::DEPTH_STENCIL_WRITE,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        (
            BarrierAccess::DEPTH_STENCIL_READ,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
        ),
        (BarrierAccess::INDIRECT_ARGUMENT, vk::AccessFlags2::INDIRECT_COMMAND_READ),
        (BarrierAccess::COPY_DEST, vk::AccessFlags2::TRANSFER_WRITE),
        (BarrierAccess::COPY_SOURCE, vk::AccessFlags2::TRANSFER_READ),
        (BarrierAccess::RESOLVE_DEST, vk::AccessFlags2::TRANSFER_WRITE),
        (BarrierAccess::RESOLVE_SOURCE, vk::AccessFlags2::TRANSFER_READ),
        (
            BarrierAccess::ACCELERATION_STRUCTURE_READ,
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
        ),
        (
            BarrierAccess::ACCELERATION_STRUCTURE_WRITE,
            vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
        ),
    ];
    let mut flags = vk::AccessFlags2::NONE;
    for (ours, theirs) in TABLE {
        if access.contains(*ours) {
            flags |= *theirs;
        }
    }
    // Storage writes are read-modify-write from the shader's point of view.
    if access.contains(BarrierAccess::UNORDERED_ACCESS) {
        flags |= vk::AccessFlags2::SHADER_STORAGE_READ;
    }
    if access.contains(BarrierAccess::RENDER_TARGET) {
        flags |= vk::AccessFlags2::COLOR_ATTACHMENT_READ;
    }
    // Shader reads may come from sampled images or storage buffers.
    if access.contains(BarrierAccess::SHADER_RESOURCE) {
        flags |= vk::AccessFlags2::SHADER_SAMPLED_READ | vk::AccessFlags2::SHADER_STORAGE_READ;
    }
    flags
}

pub fn layout_to_vk(layout: TextureLayout) -> vk::ImageLayout {
    match layout {
        TextureLayout::Undefined => vk::ImageLayout::UNDEFINED,
        TextureLayout::Common | TextureLayout::UnorderedAccess => vk::ImageLayout::GENERAL,
        TextureLayout::ShaderResource => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        TextureLayout::RenderTarget => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        TextureLayout::DepthStencilWrite => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        TextureLayout::DepthStencilRead => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        TextureLayout::CopySource => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        TextureLayout::CopyDest => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        TextureLayout::Present => vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

/// Looks up native objects for resource handles.
pub trait VulkanResourceResolver {
    fn buffer(&self, resource: ResourceHandle) -> Option<vk::Buffer>;
    fn image(&self, resource: ResourceHandle) -> Option<(vk::Image, vk::ImageAspectFlags)>;
}

/// Native barriers for one batch, ready for `vkCmdPipelineBarrier2`.
#[derive(Debug, Default)]
pub struct VulkanBarrierSet {
    pub buffers: Vec<vk::BufferMemoryBarrier2<'static>>,
    pub images: Vec<vk::ImageMemoryBarrier2<'static>>,
}

impl VulkanBarrierSet {
    pub fn len(&self) -> usize {
        self.buffers.len() + self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dependency_info(&self) -> vk::DependencyInfo<'_> {
        vk::DependencyInfo::default()
            .buffer_memory_barriers(&self.buffers)
            .image_memory_barriers(&self.images)
    }
}

fn stages(item: &ResourceBarrierItem) -> (vk::PipelineStageFlags2, vk::PipelineStageFlags2) {
    (sync_to_vk(item.sync_before), sync_to_vk(item.sync_after))
}

/// Translates a batch. Handles the resolver does not know are logged and skipped.
pub fn translate_pipeline_barriers(
    batch: &BarrierBatch<'_>,
    resolver: &dyn VulkanResourceResolver,
) -> VulkanBarrierSet {
    let mut set = VulkanBarrierSet::default();
    for item in batch.buffers {
        let Some(buffer) = resolver.buffer(item.resource) else {
            log::error!(target: LOG_TARGET, "no native buffer for {:?}", item.resource);
            continue;
        };
        let (src_stage, dst_stage) = stages(item);
        set.buffers.push(
            vk::BufferMemoryBarrier2::default()
                .src_stage_mask(src_stage)
                .src_access_mask(access_to_vk(item.access_before))
                .dst_stage_mask(dst_stage)
                .dst_access_mask(access_to_vk(item.access_after))
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(buffer)
                .offset(0)
                .size(vk::WHOLE_SIZE),
        );
    }
    for item in batch.textures {
        let Some((image, aspect)) = resolver.image(item.resource) else {
            log::error!(target: LOG_TARGET, "no native image for {:?}", item.resource);
            continue;
        };
        let (src_stage, dst_stage) = stages(item);
        set.images.push(
            vk::ImageMemoryBarrier2::default()
                .src_stage_mask(src_stage)
                .src_access_mask(access_to_vk(item.access_before))
                .dst_stage_mask(dst_stage)
                .dst_access_mask(access_to_vk(item.access_after))
                .old_layout(layout_to_vk(item.layout_before))
                .new_layout(layout_to_vk(item.layout_after))
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(aspect)
                        .base_mip_level(0)
                        .level_count(vk::REMAINING_MIP_LEVELS)
                        .base_array_layer(0)
                        .layer_count(vk::REMAINING_ARRAY_LAYERS),
                ),
        );
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;
    use ash::vk::Handle as _;

    struct Fixed;

    impl VulkanResourceResolver for Fixed {
        fn buffer(&self, resource: ResourceHandle) -> Option<vk::Buffer> {
            (resource.index() == 0).then(|| vk::Buffer::from_raw(0x10))
        }

        fn image(&self, resource: ResourceHandle) -> Option<(vk::Image, vk::ImageAspectFlags)> {
            (resource.index() == 1)
                .then(|| (vk::Image::from_raw(0x20), vk::ImageAspectFlags::COLOR))
        }
    }

    fn item(index: u32, kind: ResourceKind) -> ResourceBarrierItem {
        ResourceBarrierItem {
            resource: ResourceHandle::new(index, 1),
            kind,
            sync_before: BarrierSync::COMPUTE_SHADING,
            sync_after: BarrierSync::PIXEL_SHADING,
            access_before: BarrierAccess::UNORDERED_ACCESS,
            access_after: BarrierAccess::SHADER_RESOURCE,
            layout_before: TextureLayout::UnorderedAccess,
            layout_after: TextureLayout::ShaderResource,
        }
    }

    #[test]
    fn translates_buffers_and_images() {
        let buffers = [item(0, ResourceKind::Buffer), item(7, ResourceKind::Buffer)];
        let textures = [item(1, ResourceKind::Texture)];
        let set = translate_pipeline_barriers(
            &BarrierBatch {
                buffers: &buffers,
                textures: &textures,
            },
            &Fixed,
        );
        assert_eq!(set.buffers.len(), 1);
        assert_eq!(set.images.len(), 1);
        let b = &set.buffers[0];
        assert_eq!(b.src_stage_mask, vk::PipelineStageFlags2::COMPUTE_SHADER);
        assert_eq!(b.dst_stage_mask, vk::PipelineStageFlags2::FRAGMENT_SHADER);
        assert!(b.src_access_mask.contains(vk::AccessFlags2::SHADER_STORAGE_WRITE));
        assert!(b.dst_access_mask.contains(vk::AccessFlags2::SHADER_STORAGE_READ));
        assert_eq!(b.size, vk::WHOLE_SIZE);
        let i = &set.images[0];
        assert_eq!(i.old_layout, vk::ImageLayout::GENERAL);
        assert_eq!(i.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(set.dependency_info().image_memory_barrier_count, 1);
    }

    #[test]
    fn shader_reads_cover_storage_buffers_and_sampled_images() {
        let read = access_to_vk(BarrierAccess::SHADER_RESOURCE);
        assert!(read.contains(vk::AccessFlags2::SHADER_STORAGE_READ));
        assert!(read.contains(vk::AccessFlags2::SHADER_SAMPLED_READ));
        assert!(!read.intersects(vk::AccessFlags2::SHADER_WRITE));
    }

    #[test]
    fn empty_sync_maps_to_none() {
        assert_eq!(sync_to_vk(BarrierSync::NONE), vk::PipelineStageFlags2::NONE);
        assert_eq!(access_to_vk(BarrierAccess::NO_ACCESS), vk::AccessFlags2::NONE);
        assert_eq!(
            sync_to_vk(BarrierSync::ALL | BarrierSync::COPY),
            vk::PipelineStageFlags2::ALL_COMMANDS
        );
    }
}
