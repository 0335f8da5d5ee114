//! The backend-adapter boundary.
//!
//! A backend creates native objects and executes native command lists. Everything a
//! backend returns is wrapped in a handle from the device's pools, so adapters never
//! hand raw objects to callers.

use crate::barrier::{BarrierBatch, BarrierModel};
use crate::error::RhiResult;
use crate::resource::{DescriptorUsage, ResourceKind};
use crate::{
    BufferDescriptor, ClearColor, ComputePipelineDescriptor, GraphicsPipelineDescriptor, LoadOp,
    QueueType, TextureDescriptor,
};
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

/// Closed set of native APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Vulkan,
    Direct3D12,
    Metal,
    Software,
}

impl BackendKind {
    /// Barrier model and layout support a backend of this kind uses.
    pub fn default_capabilities(self) -> BackendCapabilities {
        let barrier_model = match self {
            BackendKind::Vulkan => BarrierModel::PipelineBarrier,
            BackendKind::Direct3D12 | BackendKind::Software => BarrierModel::Enhanced,
            BackendKind::Metal => BarrierModel::EncoderFence,
        };
        BackendCapabilities {
            kind: self,
            barrier_model,
            texture_layouts: barrier_model.has_texture_layouts(),
        }
    }
}

/// Fixed once a device is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub kind: BackendKind,
    pub barrier_model: BarrierModel,
    /// False when textures have no layout concept; layout transitions are then dropped.
    pub texture_layouts: bool,
}

/// The core device trait every backend adapter implements.
pub trait Backend: Send + Sync + Debug {
    fn capabilities(&self) -> BackendCapabilities;

    fn create_queue(&self, queue_type: QueueType) -> RhiResult<Arc<dyn NativeQueue>>;
    fn create_buffer(&self, desc: &BufferDescriptor) -> RhiResult<Arc<dyn NativeResource>>;
    fn create_texture(&self, desc: &TextureDescriptor) -> RhiResult<Arc<dyn NativeResource>>;
    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDescriptor,
    ) -> RhiResult<Arc<dyn NativePipeline>>;
    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDescriptor,
    ) -> RhiResult<Arc<dyn NativePipeline>>;

    /// Writes a shader-visible descriptor at `shader_index`.
    fn create_descriptor(
        &self,
        shader_index: u32,
        resource: &Arc<dyn NativeResource>,
        usage: DescriptorUsage,
    ) -> RhiResult<()>;
    fn free_descriptor(&self, shader_index: u32);

    /// Host write into a mappable buffer. Bounds are checked by the caller.
    fn write_buffer(&self, buffer: &dyn NativeResource, offset: u64, data: &[u8]) -> RhiResult<()>;
    fn read_buffer(
        &self,
        buffer: &dyn NativeResource,
        offset: u64,
        out: &mut [u8],
    ) -> RhiResult<()>;
}

/// A native queue with a monotonically increasing completion counter.
pub trait NativeQueue: Send + Sync + Debug {
    fn queue_type(&self) -> QueueType;
    fn create_command_allocator(&self) -> RhiResult<Box<dyn NativeCommandAllocator>>;
    /// Submits closed lists in order. The queue waits for every `(queue, value)` in
    /// `waits` before running them and sets its counter to `signal_value` after.
    fn submit(&self, submission: Submission<'_>) -> RhiResult<()>;
    fn completed_value(&self) -> u64;
    /// Blocks until the completion counter reaches `value`.
    fn wait_for_value(&self, value: u64);
    fn as_any(&self) -> &dyn Any;
}

pub struct Submission<'a> {
    pub lists: &'a [&'a dyn NativeCommandList],
    pub waits: &'a [(Arc<dyn NativeQueue>, u64)],
    pub signal_value: u64,
}

/// Owns the memory of the command lists allocated from it.
pub trait NativeCommandAllocator: Send + Debug {
    /// Invalidates every list recorded from this allocator. Callers ensure the GPU is done.
    fn reset(&mut self) -> RhiResult<()>;
    fn allocate_list(&mut self, queue_type: QueueType) -> RhiResult<Box<dyn NativeCommandList>>;
}

/// Attachment as seen by a backend at render-pass begin.
#[derive(Debug, Clone)]
pub struct NativeColorAttachment {
    pub texture: Arc<dyn NativeResource>,
    pub load_op: LoadOp,
    pub clear_value: Option<ClearColor>,
}

/// Recording interface of a native command list.
pub trait NativeCommandList: Send + Debug {
    fn begin(&mut self) -> RhiResult<()>;
    fn close(&mut self) -> RhiResult<()>;
    fn barrier(&mut self, batch: &BarrierBatch<'_>);
    fn set_pipeline(&mut self, pipeline: &Arc<dyn NativePipeline>);
    fn push_constants(&mut self, offset: u32, values: &[u32]);
    fn dispatch(&mut self, groups: [u32; 3]);
    fn begin_render_pass(&mut self, attachments: &[NativeColorAttachment]);
    fn end_render_pass(&mut self);
    fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn copy_buffer(
        &mut self,
        src: &Arc<dyn NativeResource>,
        src_offset: u64,
        dst: &Arc<dyn NativeResource>,
        dst_offset: u64,
        size: u64,
    );
    fn as_any(&self) -> &dyn Any;
}

pub trait NativeResource: Send + Sync + Debug {
    fn kind(&self) -> ResourceKind;
    fn size_bytes(&self) -> u64;
    fn as_any(&self) -> &dyn Any;
}

pub trait NativePipeline: Send + Sync + Debug {
    fn as_any(&self) -> &dyn Any;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_models_per_kind() {
        let metal = BackendKind::Metal.default_capabilities();
        assert_eq!(metal.barrier_model, BarrierModel::EncoderFence);
        assert!(!metal.texture_layouts);
        let vk = BackendKind::Vulkan.default_capabilities();
        assert_eq!(vk.barrier_model, BarrierModel::PipelineBarrier);
        assert!(vk.texture_layouts);
    }
}
