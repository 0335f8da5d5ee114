//! Backend-side shapes of a [`BarrierBatch`].
//!
//! Each backend consumes batches through one of three models. The enhanced model maps
//! the engine's `(sync, access, layout)` triples almost one to one; the encoder-fence
//! model only keeps stage scopes; the pipeline-barrier model lives in [`crate::vulkan`]
//! because it needs native stage and access enums.

use super::{BarrierAccess, BarrierBatch, BarrierSync, ResourceBarrierItem, TextureLayout};
use crate::resource::ResourceHandle;

/// How a backend expresses resource transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierModel {
    /// Stage/access masks plus image layouts (Vulkan synchronization2).
    PipelineBarrier,
    /// Sync/access/layout triples per resource (D3D12 enhanced barriers).
    Enhanced,
    /// Encoder-level waits between stages (Metal fences); no layouts.
    EncoderFence,
}

impl BarrierModel {
    /// Whether the model tracks texture layouts.
    pub fn has_texture_layouts(self) -> bool {
        !matches!(self, BarrierModel::EncoderFence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnhancedBufferBarrier {
    pub resource: ResourceHandle,
    pub sync_before: BarrierSync,
    pub sync_after: BarrierSync,
    pub access_before: BarrierAccess,
    pub access_after: BarrierAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnhancedTextureBarrier {
    pub resource: ResourceHandle,
    pub sync_before: BarrierSync,
    pub sync_after: BarrierSync,
    pub access_before: BarrierAccess,
    pub access_after: BarrierAccess,
    pub layout_before: TextureLayout,
    pub layout_after: TextureLayout,
    /// Contents may be dropped; set when the texture comes from an undefined layout.
    pub discard: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnhancedBarrierGroup {
    pub buffers: Vec<EnhancedBufferBarrier>,
    pub textures: Vec<EnhancedTextureBarrier>,
}

impl EnhancedBarrierGroup {
    pub fn len(&self) -> usize {
        self.buffers.len() + self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// An empty sync scope may not carry an access.
fn legal_access(sync: BarrierSync, access: BarrierAccess) -> BarrierAccess {
    if sync.is_empty() {
        BarrierAccess::NO_ACCESS
    } else {
        access
    }
}

fn enhanced_texture(item: &ResourceBarrierItem) -> EnhancedTextureBarrier {
    let discard = item.layout_before == TextureLayout::Undefined
        && item.layout_after != TextureLayout::Undefined;
    let (sync_before, access_before) = if discard {
        (BarrierSync::NONE, BarrierAccess::NO_ACCESS)
    } else {
        (
            item.sync_before,
            legal_access(item.sync_before, item.access_before),
        )
    };
    EnhancedTextureBarrier {
        resource: item.resource,
        sync_before,
        sync_after: item.sync_after,
        access_before,
        access_after: legal_access(item.sync_after, item.access_after),
        layout_before: item.layout_before,
        layout_after: item.layout_after,
        discard,
    }
}

/// Builds the enhanced-barrier groups for a batch.
pub fn legalize_enhanced(batch: &BarrierBatch<'_>) -> EnhancedBarrierGroup {
    let buffers = batch
        .buffers
        .iter()
        .map(|item| EnhancedBufferBarrier {
            resource: item.resource,
            sync_before: item.sync_before,
            sync_after: item.sync_after,
            access_before: legal_access(item.sync_before, item.access_before),
            access_after: legal_access(item.sync_after, item.access_after),
        })
        .collect();
    let textures = batch.textures.iter().map(enhanced_texture).collect();
    EnhancedBarrierGroup { buffers, textures }
}

bitflags::bitflags! {
    /// Encoder stages a fence waits on or updates after.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EncoderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const DISPATCH = 1 << 2;
        const BLIT = 1 << 3;
        const ACCELERATION_STRUCTURE = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Resource classes a memory barrier covers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BarrierScope: u32 {
        const BUFFERS = 1 << 0;
        const TEXTURES = 1 << 1;
        const RENDER_TARGETS = 1 << 2;
    }
}

/// Maps a sync scope to the encoder stages that run it.
pub fn encoder_stages(sync: BarrierSync) -> EncoderStages {
    if sync.contains(BarrierSync::ALL) {
        return EncoderStages::all();
    }
    let mut stages = EncoderStages::empty();
    if sync.intersects(
        BarrierSync::DRAW
            | BarrierSync::INDEX_INPUT
            | BarrierSync::VERTEX_SHADING
            | BarrierSync::EXECUTE_INDIRECT,
    ) {
        stages |= EncoderStages::VERTEX;
    }
    if sync.intersects(
        BarrierSync::DRAW
            | BarrierSync::PIXEL_SHADING
            | BarrierSync::DEPTH_STENCIL
            | BarrierSync::RENDER_TARGET,
    ) {
        stages |= EncoderStages::FRAGMENT;
    }
    if sync.intersects(BarrierSync::COMPUTE_SHADING | BarrierSync::RAYTRACING) {
        stages |= EncoderStages::DISPATCH;
    }
    if sync.intersects(BarrierSync::COPY | BarrierSync::RESOLVE) {
        stages |= EncoderStages::BLIT;
    }
    if sync.intersects(
        BarrierSync::BUILD_ACCELERATION_STRUCTURE | BarrierSync::COPY_ACCELERATION_STRUCTURE,
    ) {
        stages |= EncoderStages::ACCELERATION_STRUCTURE;
    }
    stages
}

/// One encoder fence: the next encoder waits on `wait_stages` of the previous work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderFencePlan {
    pub wait_stages: EncoderStages,
    pub update_stages: EncoderStages,
    pub scope: BarrierScope,
    pub resources: Vec<ResourceHandle>,
}

/// Collapses a batch into a single encoder fence. Transitions with no prior work
/// (empty before-sync) need no wait and are dropped; returns `None` when nothing is left.
pub fn plan_encoder_fence(batch: &BarrierBatch<'_>) -> Option<EncoderFencePlan> {
    let mut plan = EncoderFencePlan {
        wait_stages: EncoderStages::empty(),
        update_stages: EncoderStages::empty(),
        scope: BarrierScope::empty(),
        resources: Vec::new(),
    };
    for item in batch.iter().filter(|item| !item.sync_before.is_empty()) {
        plan.wait_stages |= encoder_stages(item.sync_before);
        plan.update_stages |= encoder_stages(item.sync_after);
        plan.scope |= match item.kind {
            crate::resource::ResourceKind::Buffer => BarrierScope::BUFFERS,
            crate::resource::ResourceKind::Texture
                if item.access_before.contains(BarrierAccess::RENDER_TARGET)
                    || item.access_after.contains(BarrierAccess::RENDER_TARGET) =>
            {
                BarrierScope::TEXTURES | BarrierScope::RENDER_TARGETS
            }
            crate::resource::ResourceKind::Texture => BarrierScope::TEXTURES,
        };
        plan.resources.push(item.resource);
    }
    if plan.resources.is_empty() {
        None
    } else {
        Some(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;

    fn item(
        kind: ResourceKind,
        before: (BarrierSync, BarrierAccess, TextureLayout),
    ) -> ResourceBarrierItem {
        ResourceBarrierItem {
            resource: ResourceHandle::new(0, 1),
            kind,
            sync_before: before.0,
            sync_after: BarrierSync::COMPUTE_SHADING,
            access_before: before.1,
            access_after: BarrierAccess::SHADER_RESOURCE,
            layout_before: before.2,
            layout_after: if kind == ResourceKind::Texture {
                TextureLayout::ShaderResource
            } else {
                TextureLayout::Undefined
            },
        }
    }

    #[test]
    fn undefined_layout_discards() {
        let tex = item(
            ResourceKind::Texture,
            (
                BarrierSync::COPY,
                BarrierAccess::COPY_DEST,
                TextureLayout::Undefined,
            ),
        );
        let textures = [tex];
        let group = legalize_enhanced(&BarrierBatch {
            buffers: &[],
            textures: &textures,
        });
        assert_eq!(group.len(), 1);
        let t = group.textures[0];
        assert!(t.discard);
        assert_eq!(t.sync_before, BarrierSync::NONE);
        assert_eq!(t.access_before, BarrierAccess::NO_ACCESS);
    }

    #[test]
    fn empty_sync_strips_access() {
        let buf = item(
            ResourceKind::Buffer,
            (
                BarrierSync::NONE,
                BarrierAccess::UNORDERED_ACCESS,
                TextureLayout::Undefined,
            ),
        );
        let buffers = [buf];
        let group = legalize_enhanced(&BarrierBatch {
            buffers: &buffers,
            textures: &[],
        });
        assert_eq!(group.buffers[0].access_before, BarrierAccess::NO_ACCESS);
        assert_eq!(group.buffers[0].access_after, BarrierAccess::SHADER_RESOURCE);
    }

    #[test]
    fn encoder_fence_skips_first_use() {
        let first = item(
            ResourceKind::Buffer,
            (BarrierSync::NONE, BarrierAccess::NO_ACCESS, TextureLayout::Undefined),
        );
        let first = [first];
        assert!(plan_encoder_fence(&BarrierBatch {
            buffers: &first,
            textures: &[],
        })
        .is_none());

        let after_draw = item(
            ResourceKind::Texture,
            (
                BarrierSync::RENDER_TARGET,
                BarrierAccess::RENDER_TARGET,
                TextureLayout::RenderTarget,
            ),
        );
        let textures = [after_draw];
        let plan = plan_encoder_fence(&BarrierBatch {
            buffers: &first,
            textures: &textures,
        })
        .unwrap();
        assert_eq!(plan.wait_stages, EncoderStages::FRAGMENT);
        assert_eq!(plan.update_stages, EncoderStages::DISPATCH);
        assert!(plan.scope.contains(BarrierScope::RENDER_TARGETS));
        assert_eq!(plan.resources.len(), 1);
    }

    #[test]
    fn all_sync_waits_on_everything() {
        assert_eq!(encoder_stages(BarrierSync::ALL), EncoderStages::all());
        assert_eq!(
            encoder_stages(BarrierSync::COPY | BarrierSync::COMPUTE_SHADING),
            EncoderStages::BLIT | EncoderStages::DISPATCH
        );
    }
}
