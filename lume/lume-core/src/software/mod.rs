//! CPU reference backend.
//!
//! Shader "bytecode" is the UTF-8 name of a kernel registered with
//! [`SoftwareBackend::register_kernel`]. Dispatches run the kernel once per thread;
//! draws run the vertex kernel once per vertex and instance (nothing is rasterized).
//! Every barrier batch a command list records is kept in a log together with its
//! translation for the configured barrier model, so tests can inspect exactly what
//! a native backend would have been asked to do.

mod kernel;
mod queue;
mod resources;

pub use kernel::{ComputeKernel, KernelInvocation};
pub use queue::SoftwareQueue;
pub use resources::{SoftwareBuffer, SoftwareTexture};

use crate::backend::{
    Backend, BackendCapabilities, BackendKind, NativePipeline, NativeQueue, NativeResource,
};
use crate::barrier::translate::{legalize_enhanced, plan_encoder_fence};
use crate::barrier::{BarrierBatch, BarrierModel, ResourceBarrierItem};
use crate::dictionary::{ConcurrentDictionary, DictionaryConfig, DictionaryGrowth};
use crate::error::{RhiError, RhiResult};
use crate::resource::{DescriptorUsage, ResourceHandle};
use crate::{
    BufferDescriptor, BufferMemoryPreference, ComputePipelineDescriptor,
    GraphicsPipelineDescriptor, QueueType, ShaderStage, TextureDescriptor,
};
use resources::{lock, SoftwarePipeline};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const LOG_TARGET: &str = "lume::device";

#[derive(Debug, Clone)]
pub(crate) struct SoftwareDescriptor {
    pub(crate) resource: Arc<dyn NativeResource>,
    pub(crate) usage: DescriptorUsage,
}

/// One barrier command as received by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedBarrier {
    pub model: BarrierModel,
    pub buffers: Vec<ResourceBarrierItem>,
    pub textures: Vec<ResourceBarrierItem>,
    /// Native barriers (or fence resources) the model translation produced.
    pub native_count: usize,
}

impl RecordedBarrier {
    pub fn touches(&self, resource: ResourceHandle) -> bool {
        self.buffers
            .iter()
            .chain(self.textures.iter())
            .any(|item| item.resource == resource)
    }
}

pub(crate) struct SoftwareShared {
    caps: BackendCapabilities,
    kernels: ConcurrentDictionary<String, Arc<dyn ComputeKernel>>,
    pub(crate) descriptors: ConcurrentDictionary<u32, SoftwareDescriptor>,
    barrier_log: Mutex<Vec<RecordedBarrier>>,
    allocator_resets: AtomicUsize,
    submissions: AtomicUsize,
}

impl SoftwareShared {
    pub(crate) fn count_submission(&self) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_allocator_reset(&self) {
        self.allocator_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_barrier(&self, batch: &BarrierBatch<'_>) {
        let model = self.caps.barrier_model;
        let native_count = match model {
            BarrierModel::Enhanced => legalize_enhanced(batch).len(),
            BarrierModel::EncoderFence => {
                plan_encoder_fence(batch).map_or(0, |p| p.resources.len())
            }
            BarrierModel::PipelineBarrier => pipeline_barrier_count(batch),
        };
        lock(&self.barrier_log).push(RecordedBarrier {
            model,
            buffers: batch.buffers.to_vec(),
            textures: batch.textures.to_vec(),
            native_count,
        });
    }
}

#[cfg(feature = "vulkan")]
fn pipeline_barrier_count(batch: &BarrierBatch<'_>) -> usize {
    use ash::vk::{self, Handle as _};

    // The software backend has no Vulkan objects; handles stand in for them.
    struct HandleIdentity;

    impl crate::vulkan::VulkanResourceResolver for HandleIdentity {
        fn buffer(&self, resource: ResourceHandle) -> Option<vk::Buffer> {
            Some(vk::Buffer::from_raw(resource.to_raw()))
        }

        fn image(&self, resource: ResourceHandle) -> Option<(vk::Image, vk::ImageAspectFlags)> {
            Some((vk::Image::from_raw(resource.to_raw()), vk::ImageAspectFlags::COLOR))
        }
    }

    crate::vulkan::translate_pipeline_barriers(batch, &HandleIdentity).len()
}

#[cfg(not(feature = "vulkan"))]
fn pipeline_barrier_count(batch: &BarrierBatch<'_>) -> usize {
    batch.len()
}

impl std::fmt::Debug for SoftwareShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareShared")
            .field("caps", &self.caps)
            .field("kernels", &self.kernels.len())
            .field("descriptors", &self.descriptors.len())
            .finish_non_exhaustive()
    }
}

/// Backend executing everything on the CPU. Cloning shares the kernel registry and logs.
#[derive(Debug, Clone)]
pub struct SoftwareBackend {
    shared: Arc<SoftwareShared>,
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::with_capabilities(BackendKind::Software.default_capabilities())
    }

    /// Emulates the barrier model of another backend kind.
    pub fn emulating(kind: BackendKind) -> Self {
        let caps = kind.default_capabilities();
        Self::with_capabilities(BackendCapabilities {
            kind: BackendKind::Software,
            ..caps
        })
    }

    pub fn with_capabilities(caps: BackendCapabilities) -> Self {
        let growable = |capacity| DictionaryConfig {
            capacity,
            growth: DictionaryGrowth::Rehash {
                max_capacity: capacity * 16,
            },
        };
        Self {
            shared: Arc::new(SoftwareShared {
                caps,
                kernels: ConcurrentDictionary::with_config("software kernels", growable(64)),
                descriptors: ConcurrentDictionary::with_config(
                    "software descriptors",
                    growable(1024),
                ),
                barrier_log: Mutex::new(Vec::new()),
                allocator_resets: AtomicUsize::new(0),
                submissions: AtomicUsize::new(0),
            }),
        }
    }

    /// Registers a kernel under `name`, replacing any previous one.
    pub fn register_kernel<F>(&self, name: &str, kernel: F)
    where
        F: Fn(&mut KernelInvocation<'_>) + Send + Sync + 'static,
    {
        let kernel: Arc<dyn ComputeKernel> = Arc::new(kernel);
        self.shared.kernels.remove(&name.to_owned());
        if !self.shared.kernels.add(name.to_owned(), kernel) {
            log::error!(target: LOG_TARGET, "kernel registry is full; {} not registered", name);
        }
    }

    /// Every barrier batch recorded so far, in recording order.
    pub fn barrier_log(&self) -> Vec<RecordedBarrier> {
        lock(&self.shared.barrier_log).clone()
    }

    /// Number of recorded batches containing a transition of `resource`.
    pub fn barrier_batches_touching(&self, resource: ResourceHandle) -> usize {
        lock(&self.shared.barrier_log)
            .iter()
            .filter(|b| b.touches(resource))
            .count()
    }

    pub fn clear_barrier_log(&self) {
        lock(&self.shared.barrier_log).clear();
    }

    pub fn allocator_reset_count(&self) -> usize {
        self.shared.allocator_resets.load(Ordering::Relaxed)
    }

    pub fn submission_count(&self) -> usize {
        self.shared.submissions.load(Ordering::Relaxed)
    }

    fn kernel(&self, stage: &ShaderStage) -> RhiResult<Arc<dyn ComputeKernel>> {
        let name = std::str::from_utf8(&stage.bytecode)
            .map_err(|_| {
                RhiError::Backend("software shader bytecode is not a kernel name".into())
            })?;
        self.shared
            .kernels
            .get(&name.to_owned())
            .ok_or_else(|| RhiError::Backend(format!("no kernel registered as {:?}", name)))
    }
}

fn software_buffer(resource: &dyn NativeResource) -> RhiResult<&SoftwareBuffer> {
    resource
        .as_any()
        .downcast_ref::<SoftwareBuffer>()
        .ok_or_else(|| RhiError::Backend("resource is not a software buffer".into()))
}

impl Backend for SoftwareBackend {
    fn capabilities(&self) -> BackendCapabilities {
        self.shared.caps
    }

    fn create_queue(&self, queue_type: QueueType) -> RhiResult<Arc<dyn NativeQueue>> {
        Ok(Arc::new(SoftwareQueue::spawn(
            queue_type,
            Arc::clone(&self.shared),
        )?))
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> RhiResult<Arc<dyn NativeResource>> {
        Ok(Arc::new(SoftwareBuffer::new(
            desc.size,
            desc.memory == BufferMemoryPreference::HostVisible,
        )))
    }

    fn create_texture(&self, desc: &TextureDescriptor) -> RhiResult<Arc<dyn NativeResource>> {
        Ok(Arc::new(SoftwareTexture::new(desc.format, desc.size)))
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDescriptor,
    ) -> RhiResult<Arc<dyn NativePipeline>> {
        Ok(Arc::new(SoftwarePipeline::Compute {
            kernel: self.kernel(&desc.shader)?,
            metadata: desc.shader.metadata,
        }))
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDescriptor,
    ) -> RhiResult<Arc<dyn NativePipeline>> {
        Ok(Arc::new(SoftwarePipeline::Graphics {
            vertex: self.kernel(&desc.vertex_shader)?,
            has_fragment: desc.fragment_shader.is_some(),
        }))
    }

    fn create_descriptor(
        &self,
        shader_index: u32,
        resource: &Arc<dyn NativeResource>,
        usage: DescriptorUsage,
    ) -> RhiResult<()> {
        let descriptor = SoftwareDescriptor {
            resource: Arc::clone(resource),
            usage,
        };
        self.shared.descriptors.remove(&shader_index);
        if self.shared.descriptors.add(shader_index, descriptor) {
            Ok(())
        } else {
            Err(RhiError::Backend(format!(
                "descriptor heap is full at index {}",
                shader_index
            )))
        }
    }

    fn free_descriptor(&self, shader_index: u32) {
        self.shared.descriptors.remove(&shader_index);
    }

    fn write_buffer(&self, buffer: &dyn NativeResource, offset: u64, data: &[u8]) -> RhiResult<()> {
        mapped_buffer(buffer)?.write(offset as usize, data);
        Ok(())
    }

    fn read_buffer(
        &self,
        buffer: &dyn NativeResource,
        offset: u64,
        out: &mut [u8],
    ) -> RhiResult<()> {
        mapped_buffer(buffer)?.read(offset as usize, out);
        Ok(())
    }
}

fn mapped_buffer(buffer: &dyn NativeResource) -> RhiResult<&SoftwareBuffer> {
    let buffer = software_buffer(buffer)?;
    if buffer.is_host_visible() {
        Ok(buffer)
    } else {
        Err(RhiError::NotHostVisible)
    }
}
