//! Resource barrier tracking.
//!
//! Commands declare how they access a resource (read or write, optionally in a
//! render-target, depth-stencil or acceleration-structure role). The
//! [`ResourceBarrierEngine`] of a command list queues those declarations and, at the next
//! flush point, emits the minimal batch of transitions. [`translate`] turns a batch
//! into the native shape of each barrier model.

mod engine;
pub mod translate;

pub use engine::{BarrierStats, ResourceBarrierEngine};
pub use translate::BarrierModel;

use crate::resource::{ResourceHandle, ResourceKind};

bitflags::bitflags! {
    /// Pipeline scopes a barrier waits on (before) or blocks (after).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BarrierSync: u32 {
        const ALL = 1 << 0;
        const DRAW = 1 << 1;
        const INDEX_INPUT = 1 << 2;
        const VERTEX_SHADING = 1 << 3;
        const PIXEL_SHADING = 1 << 4;
        const DEPTH_STENCIL = 1 << 5;
        const RENDER_TARGET = 1 << 6;
        const COMPUTE_SHADING = 1 << 7;
        const RAYTRACING = 1 << 8;
        const COPY = 1 << 9;
        const RESOLVE = 1 << 10;
        const EXECUTE_INDIRECT = 1 << 11;
        const BUILD_ACCELERATION_STRUCTURE = 1 << 12;
        const COPY_ACCELERATION_STRUCTURE = 1 << 13;
    }
}

impl BarrierSync {
    pub const NONE: Self = Self::empty();
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BarrierAccess: u32 {
        const VERTEX_BUFFER = 1 << 0;
        const CONSTANT_BUFFER = 1 << 1;
        const INDEX_BUFFER = 1 << 2;
        const RENDER_TARGET = 1 << 3;
        const UNORDERED_ACCESS = 1 << 4;
        const DEPTH_STENCIL_WRITE = 1 << 5;
        const DEPTH_STENCIL_READ = 1 << 6;
        const SHADER_RESOURCE = 1 << 7;
        const INDIRECT_ARGUMENT = 1 << 8;
        const COPY_DEST = 1 << 9;
        const COPY_SOURCE = 1 << 10;
        const RESOLVE_DEST = 1 << 11;
        const RESOLVE_SOURCE = 1 << 12;
        const ACCELERATION_STRUCTURE_READ = 1 << 13;
        const ACCELERATION_STRUCTURE_WRITE = 1 << 14;
    }
}

impl BarrierAccess {
    pub const NO_ACCESS: Self = Self::empty();

    pub const WRITES: Self = Self::RENDER_TARGET
        .union(Self::UNORDERED_ACCESS)
        .union(Self::DEPTH_STENCIL_WRITE)
        .union(Self::COPY_DEST)
        .union(Self::RESOLVE_DEST)
        .union(Self::ACCELERATION_STRUCTURE_WRITE);

    pub fn is_write(self) -> bool {
        self.intersects(Self::WRITES)
    }
}

/// Texture layout. Backends without layouts never see anything but `Undefined`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureLayout {
    #[default]
    Undefined,
    Common,
    ShaderResource,
    UnorderedAccess,
    RenderTarget,
    DepthStencilWrite,
    DepthStencilRead,
    CopySource,
    CopyDest,
    Present,
}

/// Last known `(sync, access, layout)` of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceState {
    pub sync: BarrierSync,
    pub access: BarrierAccess,
    pub layout: TextureLayout,
}

impl ResourceState {
    /// State of a resource the command list has not touched yet.
    pub const INITIAL: Self = Self {
        sync: BarrierSync::NONE,
        access: BarrierAccess::NO_ACCESS,
        layout: TextureLayout::Undefined,
    };

    pub const fn new(sync: BarrierSync, access: BarrierAccess, layout: TextureLayout) -> Self {
        Self {
            sync,
            access,
            layout,
        }
    }
}

impl Default for ResourceState {
    fn default() -> Self {
        Self::INITIAL
    }
}

/// One transition emitted by a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceBarrierItem {
    pub resource: ResourceHandle,
    pub kind: ResourceKind,
    pub sync_before: BarrierSync,
    pub sync_after: BarrierSync,
    pub access_before: BarrierAccess,
    pub access_after: BarrierAccess,
    pub layout_before: TextureLayout,
    pub layout_after: TextureLayout,
}

impl ResourceBarrierItem {
    pub fn before(&self) -> ResourceState {
        ResourceState::new(self.sync_before, self.access_before, self.layout_before)
    }

    pub fn after(&self) -> ResourceState {
        ResourceState::new(self.sync_after, self.access_after, self.layout_after)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierUsage {
    Read,
    Write,
}

/// How the next command uses the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BarrierRole {
    #[default]
    Shader,
    RenderTarget,
    DepthStencil,
    AccelerationStructure,
    CopySource,
    CopyDestination,
}

/// Declared access to a resource, queued on a command list until the next flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierRequest {
    pub resource: ResourceHandle,
    pub usage: BarrierUsage,
    pub role: BarrierRole,
    /// Overrides the tracked before-state. Used to chain state across command lists,
    /// which the engine does not track on its own.
    pub before: Option<ResourceState>,
    /// Overrides the sync scope derived from the flush point.
    pub sync_after: Option<BarrierSync>,
}

impl BarrierRequest {
    pub const fn new(resource: ResourceHandle, usage: BarrierUsage) -> Self {
        Self {
            resource,
            usage,
            role: BarrierRole::Shader,
            before: None,
            sync_after: None,
        }
    }

    pub const fn read(resource: ResourceHandle) -> Self {
        Self::new(resource, BarrierUsage::Read)
    }

    pub const fn write(resource: ResourceHandle) -> Self {
        Self::new(resource, BarrierUsage::Write)
    }

    pub const fn with_role(mut self, role: BarrierRole) -> Self {
        self.role = role;
        self
    }

    pub const fn with_before(mut self, before: ResourceState) -> Self {
        self.before = Some(before);
        self
    }

    pub const fn with_sync_after(mut self, sync: BarrierSync) -> Self {
        self.sync_after = Some(sync);
        self
    }
}

/// Command that triggered a flush; it picks the default after-sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushPoint {
    Dispatch,
    Draw,
    Copy,
    Explicit,
}

/// Buffer and texture transitions emitted together as one barrier command, each list in
/// request order.
#[derive(Debug, Clone, Copy)]
pub struct BarrierBatch<'a> {
    pub buffers: &'a [ResourceBarrierItem],
    pub textures: &'a [ResourceBarrierItem],
}

impl BarrierBatch<'_> {
    pub fn len(&self) -> usize {
        self.buffers.len() + self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceBarrierItem> {
        self.buffers.iter().chain(self.textures.iter())
    }

    pub fn touches(&self, resource: ResourceHandle) -> bool {
        self.iter().any(|item| item.resource == resource)
    }
}

/// Access implied by a request.
pub fn access_for(role: BarrierRole, usage: BarrierUsage) -> BarrierAccess {
    match (role, usage) {
        (BarrierRole::Shader, BarrierUsage::Read) => BarrierAccess::SHADER_RESOURCE,
        (BarrierRole::Shader, BarrierUsage::Write) => BarrierAccess::UNORDERED_ACCESS,
        (BarrierRole::RenderTarget, _) => BarrierAccess::RENDER_TARGET,
        (BarrierRole::DepthStencil, BarrierUsage::Read) => BarrierAccess::DEPTH_STENCIL_READ,
        (BarrierRole::DepthStencil, BarrierUsage::Write) => BarrierAccess::DEPTH_STENCIL_WRITE,
        (BarrierRole::AccelerationStructure, BarrierUsage::Read) => {
            BarrierAccess::ACCELERATION_STRUCTURE_READ
        }
        (BarrierRole::AccelerationStructure, BarrierUsage::Write) => {
            BarrierAccess::ACCELERATION_STRUCTURE_WRITE
        }
        (BarrierRole::CopySource, _) => BarrierAccess::COPY_SOURCE,
        (BarrierRole::CopyDestination, _) => BarrierAccess::COPY_DEST,
    }
}

/// Texture layout implied by a request.
pub fn layout_for(role: BarrierRole, usage: BarrierUsage) -> TextureLayout {
    match (role, usage) {
        (BarrierRole::Shader, BarrierUsage::Read) => TextureLayout::ShaderResource,
        (BarrierRole::Shader, BarrierUsage::Write) => TextureLayout::UnorderedAccess,
        (BarrierRole::RenderTarget, _) => TextureLayout::RenderTarget,
        (BarrierRole::DepthStencil, BarrierUsage::Read) => TextureLayout::DepthStencilRead,
        (BarrierRole::DepthStencil, BarrierUsage::Write) => TextureLayout::DepthStencilWrite,
        (BarrierRole::AccelerationStructure, _) => TextureLayout::Common,
        (BarrierRole::CopySource, _) => TextureLayout::CopySource,
        (BarrierRole::CopyDestination, _) => TextureLayout::CopyDest,
    }
}

/// Sync scope of the command that consumes the barrier.
pub fn default_sync(point: FlushPoint, role: BarrierRole, usage: BarrierUsage) -> BarrierSync {
    match role {
        BarrierRole::RenderTarget => BarrierSync::RENDER_TARGET,
        BarrierRole::DepthStencil => BarrierSync::DEPTH_STENCIL,
        BarrierRole::CopySource | BarrierRole::CopyDestination => BarrierSync::COPY,
        BarrierRole::AccelerationStructure => match usage {
            BarrierUsage::Write => BarrierSync::BUILD_ACCELERATION_STRUCTURE,
            BarrierUsage::Read => BarrierSync::RAYTRACING | BarrierSync::COMPUTE_SHADING,
        },
        BarrierRole::Shader => match point {
            FlushPoint::Dispatch => BarrierSync::COMPUTE_SHADING,
            FlushPoint::Draw => BarrierSync::VERTEX_SHADING | BarrierSync::PIXEL_SHADING,
            FlushPoint::Copy => BarrierSync::COPY,
            FlushPoint::Explicit => BarrierSync::ALL,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_mask() {
        assert!(BarrierAccess::UNORDERED_ACCESS.is_write());
        assert!(BarrierAccess::COPY_DEST.is_write());
        assert!(!BarrierAccess::SHADER_RESOURCE.is_write());
        assert!(!BarrierAccess::NO_ACCESS.is_write());
        assert!((BarrierAccess::SHADER_RESOURCE | BarrierAccess::RENDER_TARGET).is_write());
    }

    #[test]
    fn implied_states() {
        assert_eq!(
            access_for(BarrierRole::Shader, BarrierUsage::Write),
            BarrierAccess::UNORDERED_ACCESS
        );
        assert_eq!(
            layout_for(BarrierRole::RenderTarget, BarrierUsage::Read),
            TextureLayout::RenderTarget
        );
        assert_eq!(
            default_sync(FlushPoint::Dispatch, BarrierRole::Shader, BarrierUsage::Read),
            BarrierSync::COMPUTE_SHADING
        );
        assert_eq!(
            default_sync(FlushPoint::Dispatch, BarrierRole::CopySource, BarrierUsage::Read),
            BarrierSync::COPY
        );
    }
}
