//! Resource and descriptor records stored in the device's handle pools.

use crate::backend::NativeResource;
use crate::barrier::{BarrierRole, BarrierUsage};
use crate::handle_pool::Handle;
use crate::{BufferDescriptor, BufferUsage, TextureDescriptor, TextureUsage};
use std::sync::Arc;

pub type ResourceHandle = Handle<ResourceRecord>;
pub type DescriptorHandle = Handle<DescriptorRecord>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Texture,
}

/// What a resource was created for. Barrier validation checks requests against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceInfo {
    Buffer { size: u64, usage: BufferUsage },
    Texture {
        size: (u32, u32, u32),
        usage: TextureUsage,
    },
}

impl ResourceInfo {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceInfo::Buffer { .. } => ResourceKind::Buffer,
            ResourceInfo::Texture { .. } => ResourceKind::Texture,
        }
    }

    /// Whether the resource may be accessed in `role` with `usage`.
    pub fn supports(&self, role: BarrierRole, usage: BarrierUsage) -> bool {
        match (*self, role) {
            (ResourceInfo::Buffer { usage: u, .. }, BarrierRole::Shader) => match usage {
                BarrierUsage::Read => u.intersects(
                    BufferUsage::STORAGE
                        | BufferUsage::UNIFORM
                        | BufferUsage::VERTEX
                        | BufferUsage::INDEX
                        | BufferUsage::INDIRECT,
                ),
                BarrierUsage::Write => u.contains(BufferUsage::STORAGE),
            },
            (ResourceInfo::Buffer { usage: u, .. }, BarrierRole::AccelerationStructure) => {
                u.contains(BufferUsage::ACCELERATION_STRUCTURE)
            }
            (ResourceInfo::Buffer { usage: u, .. }, BarrierRole::CopySource) => {
                u.contains(BufferUsage::COPY_SRC)
            }
            (ResourceInfo::Buffer { usage: u, .. }, BarrierRole::CopyDestination) => {
                u.contains(BufferUsage::COPY_DST)
            }
            (
                ResourceInfo::Buffer { .. },
                BarrierRole::RenderTarget | BarrierRole::DepthStencil,
            ) => {
                false
            }
            (ResourceInfo::Texture { usage: u, .. }, BarrierRole::Shader) => match usage {
                BarrierUsage::Read => {
                    u.intersects(TextureUsage::TEXTURE_BINDING | TextureUsage::STORAGE_BINDING)
                }
                BarrierUsage::Write => u.contains(TextureUsage::STORAGE_BINDING),
            },
            (ResourceInfo::Texture { usage: u, .. }, BarrierRole::RenderTarget) => {
                u.contains(TextureUsage::RENDER_ATTACHMENT)
            }
            (ResourceInfo::Texture { usage: u, .. }, BarrierRole::DepthStencil) => {
                u.contains(TextureUsage::DEPTH_STENCIL_ATTACHMENT)
            }
            (ResourceInfo::Texture { usage: u, .. }, BarrierRole::CopySource) => {
                u.contains(TextureUsage::COPY_SRC)
            }
            (ResourceInfo::Texture { usage: u, .. }, BarrierRole::CopyDestination) => {
                u.contains(TextureUsage::COPY_DST)
            }
            (ResourceInfo::Texture { .. }, BarrierRole::AccelerationStructure) => false,
        }
    }
}

impl From<&BufferDescriptor> for ResourceInfo {
    fn from(desc: &BufferDescriptor) -> Self {
        ResourceInfo::Buffer {
            size: desc.size,
            usage: desc.usage,
        }
    }
}

impl From<&TextureDescriptor> for ResourceInfo {
    fn from(desc: &TextureDescriptor) -> Self {
        ResourceInfo::Texture {
            size: desc.size,
            usage: desc.usage,
        }
    }
}

/// Device-side entry for a buffer or texture.
pub struct ResourceRecord {
    pub(crate) label: Option<&'static str>,
    pub(crate) info: ResourceInfo,
    pub(crate) host_visible: bool,
    pub(crate) native: Arc<dyn NativeResource>,
}

impl ResourceRecord {
    pub fn label(&self) -> Option<&'static str> {
        self.label
    }

    pub fn info(&self) -> ResourceInfo {
        self.info
    }
}

impl std::fmt::Debug for ResourceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRecord")
            .field("label", &self.label)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// How a shader accesses a resource through a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorUsage {
    Read,
    Write,
}

impl From<DescriptorUsage> for BarrierUsage {
    fn from(usage: DescriptorUsage) -> Self {
        match usage {
            DescriptorUsage::Read => BarrierUsage::Read,
            DescriptorUsage::Write => BarrierUsage::Write,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceDescriptorInfo {
    pub resource: ResourceHandle,
    pub usage: DescriptorUsage,
}

/// Device-side entry for a shader-visible descriptor.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorRecord {
    pub(crate) resource: ResourceHandle,
    pub(crate) usage: DescriptorUsage,
}

impl DescriptorRecord {
    pub fn resource(&self) -> ResourceHandle {
        self.resource
    }

    pub fn usage(&self) -> DescriptorUsage {
        self.usage
    }
}

/// Index a shader uses to reach a descriptor (passed through push constants).
pub fn shader_index(descriptor: DescriptorHandle) -> u32 {
    descriptor.index()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_target_requires_attachment_usage() {
        let sampled = ResourceInfo::Texture {
            size: (4, 4, 1),
            usage: TextureUsage::TEXTURE_BINDING,
        };
        assert!(!sampled.supports(BarrierRole::RenderTarget, BarrierUsage::Write));
        assert!(sampled.supports(BarrierRole::Shader, BarrierUsage::Read));
        let target = ResourceInfo::Texture {
            size: (4, 4, 1),
            usage: TextureUsage::RENDER_ATTACHMENT,
        };
        assert!(target.supports(BarrierRole::RenderTarget, BarrierUsage::Write));
    }

    #[test]
    fn storage_write_requires_storage_usage() {
        let uniform = ResourceInfo::Buffer {
            size: 64,
            usage: BufferUsage::UNIFORM,
        };
        assert!(uniform.supports(BarrierRole::Shader, BarrierUsage::Read));
        assert!(!uniform.supports(BarrierRole::Shader, BarrierUsage::Write));
        assert!(!uniform.supports(BarrierRole::AccelerationStructure, BarrierUsage::Read));
    }
}
