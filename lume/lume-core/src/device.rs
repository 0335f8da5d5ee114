//! Graphics context and device facade.
//!
//! A [`GraphicsContext`] owns the diagnostics sink and the registry of live devices.
//! A [`GraphicsDevice`] owns the handle pools for resources, descriptors, pipelines
//! and queues, the root memory arena that command-list scratch space is carved from,
//! the pipeline cache and the delete queue.

use crate::backend::{Backend, BackendCapabilities, NativePipeline, NativeQueue, NativeResource};
use crate::command::{CommandQueue, Fence, QueueEntry, QueueHandle};
use crate::config::{ContextOptions, DeviceOptions};
use crate::diagnostics::{Diagnostics, LogCategory, LogHandler};
use crate::dictionary::{ConcurrentDictionary, DictionaryConfig, DictionaryGrowth};
use crate::error::{RhiError, RhiResult};
use crate::handle_pool::{Handle, HandlePool};
use crate::memory::MemoryArena;
use crate::pipeline::{PipelineCache, PipelineHandle, PipelineKey, PipelineKind, PipelineRecord};
use crate::resource::{
    DescriptorHandle, DescriptorRecord, DescriptorUsage, ResourceDescriptorInfo, ResourceHandle,
    ResourceInfo, ResourceRecord,
};
use crate::{
    BufferDescriptor, BufferMemoryPreference, BufferUsage, ComputePipelineDescriptor,
    GraphicsPipelineDescriptor, QueueType, ShaderMetadata, TextureDescriptor, TextureUsage,
};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Adds to a pool, turning a full pool into an error. Reporting is left to the caller
/// so it happens after the pool lock is released.
fn add_to_pool<T>(pool: &mut HandlePool<T>, value: T) -> RhiResult<Handle<T>> {
    let handle = pool.add(value);
    if handle.is_null() {
        Err(RhiError::CapacityExhausted {
            kind: pool.label(),
            capacity: pool.capacity(),
        })
    } else {
        Ok(handle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u32);

impl DeviceId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeleteItem {
    Resource(ResourceHandle),
    Descriptor(DescriptorHandle),
    Pipeline(PipelineHandle),
}

#[derive(Debug)]
struct PendingDelete {
    item: DeleteItem,
    fences: Vec<Fence>,
}

pub(crate) struct DeviceShared {
    pub(crate) id: DeviceId,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) caps: BackendCapabilities,
    pub(crate) diagnostics: Arc<Diagnostics>,
    pub(crate) options: DeviceOptions,
    pub(crate) arena: MemoryArena,
    pub(crate) resources: Mutex<HandlePool<ResourceRecord>>,
    pub(crate) descriptors: Mutex<HandlePool<DescriptorRecord>>,
    pub(crate) pipelines: Mutex<HandlePool<PipelineRecord>>,
    pub(crate) queues: Mutex<HandlePool<QueueEntry>>,
    pub(crate) pipeline_cache: PipelineCache,
    delete_queue: Mutex<Vec<PendingDelete>>,
    /// Bumped by [`GraphicsDevice::reset_command_allocation`]; invalidates every
    /// thread's cached command pool item.
    pub(crate) command_pool_generation: AtomicU64,
}

impl DeviceShared {
    pub(crate) fn queue_native(&self, queue: QueueHandle) -> Option<Arc<dyn NativeQueue>> {
        lock(&self.queues).get(queue).map(|q| Arc::clone(&q.native))
    }

    pub(crate) fn resource_info(&self, resource: ResourceHandle) -> Option<ResourceInfo> {
        lock(&self.resources).get(resource).map(|r| r.info)
    }

    pub(crate) fn native_resource(
        &self,
        resource: ResourceHandle,
    ) -> Option<Arc<dyn NativeResource>> {
        lock(&self.resources)
            .get(resource)
            .map(|r| Arc::clone(&r.native))
    }

    pub(crate) fn descriptor_record(
        &self,
        descriptor: DescriptorHandle,
    ) -> Option<DescriptorRecord> {
        lock(&self.descriptors).get(descriptor).copied()
    }

    pub(crate) fn pipeline_entry(
        &self,
        pipeline: PipelineHandle,
    ) -> Option<(PipelineKind, Arc<dyn NativePipeline>, ShaderMetadata)> {
        lock(&self.pipelines)
            .get(pipeline)
            .map(|p| (p.kind, Arc::clone(&p.native), p.metadata))
    }

    /// A fence whose queue is gone counts as reached: a queue waits for its last
    /// submission before it is destroyed.
    fn fence_reached(&self, fence: &Fence) -> bool {
        match self.queue_native(fence.queue) {
            Some(native) => native.completed_value() >= fence.value,
            None => true,
        }
    }

    /// Reports `err`. Never called with a pool or queue lock held, so log handlers may
    /// call back into the device.
    fn fail(&self, category: LogCategory, function: &'static str, err: RhiError) -> RhiError {
        self.diagnostics.error(category, function, err.to_string());
        err
    }
}

impl std::fmt::Debug for DeviceShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceShared")
            .field("id", &self.id)
            .field("label", &self.options.label)
            .field("caps", &self.caps)
            .finish_non_exhaustive()
    }
}

/// A device bound to one backend. Cloning shares the device.
#[derive(Clone, Debug)]
pub struct GraphicsDevice {
    shared: Arc<DeviceShared>,
}

impl GraphicsDevice {
    pub fn id(&self) -> DeviceId {
        self.shared.id
    }

    pub fn label(&self) -> Option<&'static str> {
        self.shared.options.label
    }

    pub fn capabilities(&self) -> BackendCapabilities {
        self.shared.caps
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.shared.options
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.shared.diagnostics
    }

    /// Root arena command-list scratch space is carved from.
    pub fn arena(&self) -> &MemoryArena {
        &self.shared.arena
    }

    pub fn pipeline_cache(&self) -> &PipelineCache {
        &self.shared.pipeline_cache
    }

    pub fn resource_count(&self) -> usize {
        lock(&self.shared.resources).len()
    }

    pub fn descriptor_count(&self) -> usize {
        lock(&self.shared.descriptors).len()
    }

    pub fn pipeline_count(&self) -> usize {
        lock(&self.shared.pipelines).len()
    }

    pub fn queue_count(&self) -> usize {
        lock(&self.shared.queues).len()
    }

    pub fn pending_delete_count(&self) -> usize {
        lock(&self.shared.delete_queue).len()
    }

    pub fn create_command_queue(&self, queue_type: QueueType) -> RhiResult<CommandQueue> {
        const FUNCTION: &str = "create_command_queue";
        let shared = &self.shared;
        let native = shared
            .backend
            .create_queue(queue_type)
            .map_err(|e| shared.fail(LogCategory::Device, FUNCTION, e))?;
        let entry = QueueEntry {
            native: Arc::clone(&native),
            queue_type,
        };
        let added = add_to_pool(&mut *lock(&shared.queues), entry);
        let handle = added.map_err(|e| shared.fail(LogCategory::Device, FUNCTION, e))?;
        log::debug!(
            target: "lume::device",
            "{} created {:?} queue {:?}",
            shared.id,
            queue_type,
            handle
        );
        Ok(CommandQueue::new(Arc::clone(shared), handle, queue_type, native))
    }

    fn insert_resource(
        &self,
        function: &'static str,
        label: Option<&'static str>,
        info: ResourceInfo,
        host_visible: bool,
        native: Arc<dyn NativeResource>,
    ) -> RhiResult<ResourceHandle> {
        let record = ResourceRecord {
            label,
            info,
            host_visible,
            native,
        };
        let added = add_to_pool(&mut *lock(&self.shared.resources), record);
        added.map_err(|e| self.shared.fail(LogCategory::Resource, function, e))
    }

    pub fn create_buffer(&self, desc: &BufferDescriptor) -> RhiResult<ResourceHandle> {
        const FUNCTION: &str = "create_buffer";
        let shared = &self.shared;
        if desc.size == 0 {
            return Err(shared.fail(
                LogCategory::Resource,
                FUNCTION,
                RhiError::Usage("buffer size must be non-zero".into()),
            ));
        }
        let native = shared
            .backend
            .create_buffer(desc)
            .map_err(|e| shared.fail(LogCategory::Resource, FUNCTION, e))?;
        self.insert_resource(
            FUNCTION,
            desc.label,
            ResourceInfo::from(desc),
            desc.memory == BufferMemoryPreference::HostVisible,
            native,
        )
    }

    pub fn create_texture(&self, desc: &TextureDescriptor) -> RhiResult<ResourceHandle> {
        const FUNCTION: &str = "create_texture";
        let shared = &self.shared;
        let (w, h, d) = desc.size;
        if w == 0 || h == 0 || d == 0 {
            return Err(shared.fail(
                LogCategory::Resource,
                FUNCTION,
                RhiError::Usage(format!("texture size {:?} has a zero extent", desc.size)),
            ));
        }
        let native = shared
            .backend
            .create_texture(desc)
            .map_err(|e| shared.fail(LogCategory::Resource, FUNCTION, e))?;
        self.insert_resource(FUNCTION, desc.label, ResourceInfo::from(desc), false, native)
    }

    pub fn resource_info(&self, resource: ResourceHandle) -> Option<ResourceInfo> {
        self.shared.resource_info(resource)
    }

    /// Backend object behind a resource, for adapters and tests that downcast it.
    pub fn native_resource(&self, resource: ResourceHandle) -> Option<Arc<dyn NativeResource>> {
        self.shared.native_resource(resource)
    }

    pub fn is_resource_alive(&self, resource: ResourceHandle) -> bool {
        lock(&self.shared.resources).contains(resource)
    }

    /// Creates a shader-visible descriptor. Write descriptors need storage usage.
    pub fn create_resource_descriptor(
        &self,
        info: ResourceDescriptorInfo,
    ) -> RhiResult<DescriptorHandle> {
        const FUNCTION: &str = "create_resource_descriptor";
        let shared = &self.shared;
        let Some(resource_info) = shared.resource_info(info.resource) else {
            return Err(shared.fail(
                LogCategory::Resource,
                FUNCTION,
                RhiError::StaleHandle("resource"),
            ));
        };
        let allowed = match (resource_info, info.usage) {
            (ResourceInfo::Buffer { usage, .. }, DescriptorUsage::Write) => {
                usage.contains(BufferUsage::STORAGE)
            }
            (ResourceInfo::Buffer { usage, .. }, DescriptorUsage::Read) => {
                usage.intersects(BufferUsage::STORAGE | BufferUsage::UNIFORM)
            }
            (ResourceInfo::Texture { usage, .. }, DescriptorUsage::Write) => {
                usage.contains(TextureUsage::STORAGE_BINDING)
            }
            (ResourceInfo::Texture { usage, .. }, DescriptorUsage::Read) => {
                usage.intersects(TextureUsage::TEXTURE_BINDING | TextureUsage::STORAGE_BINDING)
            }
        };
        if !allowed {
            return Err(shared.fail(
                LogCategory::Resource,
                FUNCTION,
                RhiError::Usage(format!(
                    "{:?} descriptor on a resource without the matching usage ({:?})",
                    info.usage, resource_info
                )),
            ));
        }
        let native = shared
            .native_resource(info.resource)
            .ok_or(RhiError::StaleHandle("resource"))
            .map_err(|e| shared.fail(LogCategory::Resource, FUNCTION, e))?;
        let record = DescriptorRecord {
            resource: info.resource,
            usage: info.usage,
        };
        let added = add_to_pool(&mut *lock(&shared.descriptors), record);
        let handle = added.map_err(|e| shared.fail(LogCategory::Resource, FUNCTION, e))?;
        if let Err(e) = shared.backend.create_descriptor(handle.index(), &native, info.usage) {
            lock(&shared.descriptors).remove(handle);
            return Err(shared.fail(LogCategory::Resource, FUNCTION, e));
        }
        Ok(handle)
    }

    pub fn descriptor(&self, descriptor: DescriptorHandle) -> Option<DescriptorRecord> {
        self.shared.descriptor_record(descriptor)
    }

    fn host_buffer(
        &self,
        function: &'static str,
        buffer: ResourceHandle,
        offset: u64,
        len: usize,
    ) -> RhiResult<Arc<dyn NativeResource>> {
        let checked = |resources: &HandlePool<ResourceRecord>| -> RhiResult<_> {
            let record = resources
                .get(buffer)
                .ok_or(RhiError::StaleHandle("resource"))?;
            let ResourceInfo::Buffer { size, .. } = record.info else {
                return Err(RhiError::Usage("host access to a texture".into()));
            };
            if !record.host_visible {
                return Err(RhiError::NotHostVisible);
            }
            let end = offset.saturating_add(len as u64);
            if end > size {
                return Err(RhiError::OutOfRange { offset, end, size });
            }
            Ok(Arc::clone(&record.native))
        };
        let result = checked(&*lock(&self.shared.resources));
        result.map_err(|e| self.shared.fail(LogCategory::Resource, function, e))
    }

    /// Writes `data` into a host-visible buffer at `offset`.
    pub fn write_buffer(&self, buffer: ResourceHandle, offset: u64, data: &[u8]) -> RhiResult<()> {
        const FUNCTION: &str = "write_buffer";
        let native = self.host_buffer(FUNCTION, buffer, offset, data.len())?;
        self.shared
            .backend
            .write_buffer(native.as_ref(), offset, data)
            .map_err(|e| self.shared.fail(LogCategory::Resource, FUNCTION, e))
    }

    pub fn read_buffer(
        &self,
        buffer: ResourceHandle,
        offset: u64,
        out: &mut [u8],
    ) -> RhiResult<()> {
        const FUNCTION: &str = "read_buffer";
        let native = self.host_buffer(FUNCTION, buffer, offset, out.len())?;
        self.shared
            .backend
            .read_buffer(native.as_ref(), offset, out)
            .map_err(|e| self.shared.fail(LogCategory::Resource, FUNCTION, e))
    }

    pub fn write_buffer_pod<T: bytemuck::Pod>(
        &self,
        buffer: ResourceHandle,
        offset: u64,
        data: &[T],
    ) -> RhiResult<()> {
        self.write_buffer(buffer, offset, bytemuck::cast_slice(data))
    }

    /// Reads `count` values of `T` starting at `offset`.
    pub fn read_buffer_pod<T: bytemuck::Pod>(
        &self,
        buffer: ResourceHandle,
        offset: u64,
        count: usize,
    ) -> RhiResult<Vec<T>> {
        let mut out = vec![T::zeroed(); count];
        self.read_buffer(buffer, offset, bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }

    fn compile_pipeline<D: PipelineKey>(
        &self,
        function: &'static str,
        desc: &D,
        metadata: ShaderMetadata,
        create: impl FnOnce(&dyn Backend) -> RhiResult<Arc<dyn NativePipeline>>,
    ) -> RhiResult<PipelineHandle> {
        let shared = &self.shared;
        let key = desc.cache_key();
        if let Some(cached) = shared.pipeline_cache.get(key) {
            if lock(&shared.pipelines).contains(cached) {
                return Ok(cached);
            }
            shared.pipeline_cache.evict(key, cached);
        }
        let native = create(shared.backend.as_ref())
            .map_err(|e| shared.fail(LogCategory::Pipeline, function, e))?;
        let record = PipelineRecord {
            kind: desc.kind(),
            native,
            metadata,
            cache_key: key,
        };
        let added = add_to_pool(&mut *lock(&shared.pipelines), record);
        let handle = added.map_err(|e| shared.fail(LogCategory::Pipeline, function, e))?;
        let winner = shared.pipeline_cache.insert(key, handle);
        if winner != handle {
            // Another thread compiled the same state first.
            lock(&shared.pipelines).remove(handle);
            return Ok(winner);
        }
        log::debug!(target: "lume::pipeline", "compiled {:?} pipeline {:016x}", desc.kind(), key);
        Ok(handle)
    }

    /// Compiles a compute pipeline, or returns the cached one for identical state.
    pub fn compile_compute_pipeline(
        &self,
        desc: &ComputePipelineDescriptor,
    ) -> RhiResult<PipelineHandle> {
        self.compile_pipeline(
            "compile_compute_pipeline",
            desc,
            desc.shader.metadata,
            |backend| backend.create_compute_pipeline(desc),
        )
    }

    pub fn compile_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDescriptor,
    ) -> RhiResult<PipelineHandle> {
        self.compile_pipeline(
            "compile_graphics_pipeline",
            desc,
            desc.vertex_shader.metadata,
            |backend| backend.create_graphics_pipeline(desc),
        )
    }

    pub fn pipeline_kind(&self, pipeline: PipelineHandle) -> Option<PipelineKind> {
        lock(&self.shared.pipelines).get(pipeline).map(|p| p.kind)
    }

    fn enqueue_delete(
        &self,
        function: &'static str,
        category: LogCategory,
        item: DeleteItem,
        alive: bool,
        fences: &[Fence],
    ) -> RhiResult<()> {
        let shared = &self.shared;
        if !alive {
            return Err(shared.fail(category, function, RhiError::StaleHandle("freed")));
        }
        let freed_twice = {
            let mut queue = lock(&shared.delete_queue);
            let queued = queue.iter().any(|pending| pending.item == item);
            if !queued {
                queue.push(PendingDelete {
                    item,
                    fences: fences.to_vec(),
                });
            }
            queued
        };
        if freed_twice {
            return Err(shared.fail(
                category,
                function,
                RhiError::Usage(format!("{:?} freed twice", item)),
            ));
        }
        Ok(())
    }

    /// Queues a resource for release once every fence in `fences` is reached.
    /// The handle stays valid until [`Self::process_delete_queue`] reclaims it.
    pub fn free_resource(&self, resource: ResourceHandle, fences: &[Fence]) -> RhiResult<()> {
        let alive = self.is_resource_alive(resource);
        self.enqueue_delete(
            "free_resource",
            LogCategory::Resource,
            DeleteItem::Resource(resource),
            alive,
            fences,
        )
    }

    pub fn free_resource_descriptor(
        &self,
        descriptor: DescriptorHandle,
        fences: &[Fence],
    ) -> RhiResult<()> {
        let alive = lock(&self.shared.descriptors).contains(descriptor);
        self.enqueue_delete(
            "free_resource_descriptor",
            LogCategory::Resource,
            DeleteItem::Descriptor(descriptor),
            alive,
            fences,
        )
    }

    /// Queues a pipeline for release. It leaves the pipeline cache right away, so
    /// later compiles of the same state create a new pipeline.
    pub fn free_pipeline(&self, pipeline: PipelineHandle, fences: &[Fence]) -> RhiResult<()> {
        let key = lock(&self.shared.pipelines).get(pipeline).map(|p| p.cache_key);
        self.enqueue_delete(
            "free_pipeline",
            LogCategory::Pipeline,
            DeleteItem::Pipeline(pipeline),
            key.is_some(),
            fences,
        )?;
        if let Some(key) = key {
            self.shared.pipeline_cache.evict(key, pipeline);
        }
        Ok(())
    }

    /// Releases every queued item whose fences have all been reached. Returns how
    /// many were released.
    pub fn process_delete_queue(&self) -> usize {
        let shared = &self.shared;
        let ready: Vec<DeleteItem> = {
            let mut queue = lock(&shared.delete_queue);
            let mut ready = Vec::new();
            queue.retain(|pending| {
                if pending.fences.iter().all(|f| shared.fence_reached(f)) {
                    ready.push(pending.item);
                    false
                } else {
                    true
                }
            });
            ready
        };
        for item in &ready {
            match *item {
                DeleteItem::Resource(resource) => {
                    lock(&shared.resources).remove(resource);
                }
                DeleteItem::Descriptor(descriptor) => {
                    if lock(&shared.descriptors).remove(descriptor).is_some() {
                        shared.backend.free_descriptor(descriptor.index());
                    }
                }
                DeleteItem::Pipeline(pipeline) => {
                    lock(&shared.pipelines).remove(pipeline);
                }
            }
        }
        if !ready.is_empty() {
            log::trace!(
                target: "lume::device",
                "{} released {} deferred objects",
                shared.id,
                ready.len()
            );
        }
        ready.len()
    }

    /// Frame boundary: every thread re-evaluates which command pool item is free at
    /// its next acquire.
    pub fn reset_command_allocation(&self) {
        let generation = self
            .shared
            .command_pool_generation
            .fetch_add(1, Ordering::AcqRel)
            + 1;
        log::trace!(
            target: "lume::submission",
            "{} command pool generation {}",
            self.shared.id,
            generation
        );
    }

    pub fn command_pool_generation(&self) -> u64 {
        self.shared.command_pool_generation.load(Ordering::Acquire)
    }

    pub fn is_fence_completed(&self, fence: Fence) -> bool {
        self.shared.fence_reached(&fence)
    }

    /// Blocks until the fence's queue has completed `fence.value()`. Returns at once
    /// when it already has.
    pub fn wait_for_fence_on_cpu(&self, fence: Fence) -> RhiResult<()> {
        const FUNCTION: &str = "wait_for_fence_on_cpu";
        match self.shared.queue_native(fence.queue) {
            Some(native) => {
                if native.completed_value() < fence.value {
                    native.wait_for_value(fence.value);
                }
                Ok(())
            }
            None => {
                self.shared.diagnostics.debug(
                    LogCategory::Submission,
                    FUNCTION,
                    format!("{} refers to a destroyed queue; treating it as reached", fence),
                );
                Ok(())
            }
        }
    }
}

struct ContextInner {
    options: ContextOptions,
    diagnostics: Arc<Diagnostics>,
    devices: ConcurrentDictionary<DeviceId, GraphicsDevice>,
    next_id: AtomicU32,
}

/// Process-wide entry point. Cloning shares the context.
#[derive(Clone)]
pub struct GraphicsContext {
    inner: Arc<ContextInner>,
}

impl GraphicsContext {
    pub fn new(options: ContextOptions) -> Self {
        let diagnostics = Arc::new(Diagnostics::new(options.validation));
        log::info!(
            target: "lume::device",
            "graphics context created (validation {})",
            options.validation
        );
        Self {
            inner: Arc::new(ContextInner {
                options,
                diagnostics,
                devices: ConcurrentDictionary::with_config(
                    "device registry",
                    DictionaryConfig {
                        capacity: 8,
                        growth: DictionaryGrowth::Rehash { max_capacity: 256 },
                    },
                ),
                next_id: AtomicU32::new(1),
            }),
        }
    }

    pub fn options(&self) -> &ContextOptions {
        &self.inner.options
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.inner.diagnostics
    }

    /// Routes every diagnostic record raised by this context's devices to `handler`.
    pub fn set_log_handler<F>(&self, handler: F)
    where
        F: Fn(&crate::DiagnosticRecord) + Send + Sync + 'static,
    {
        let handler: LogHandler = Arc::new(handler);
        self.inner.diagnostics.set_handler(Some(handler));
    }

    pub fn clear_log_handler(&self) {
        self.inner.diagnostics.set_handler(None);
    }

    pub fn create_device(
        &self,
        backend: Arc<dyn Backend>,
        options: DeviceOptions,
    ) -> RhiResult<GraphicsDevice> {
        const FUNCTION: &str = "create_device";
        let diagnostics = &self.inner.diagnostics;
        let arena = MemoryArena::with_capacity(options.arena_reserve_bytes).map_err(|e| {
            diagnostics.error(LogCategory::Memory, FUNCTION, e.to_string());
            RhiError::from(e)
        })?;
        let id = DeviceId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let caps = backend.capabilities();
        let shared = DeviceShared {
            id,
            backend,
            caps,
            diagnostics: Arc::clone(diagnostics),
            arena,
            resources: Mutex::new(HandlePool::with_label("resource", options.resource_capacity)),
            descriptors: Mutex::new(HandlePool::with_label(
                "descriptor",
                options.descriptor_capacity,
            )),
            pipelines: Mutex::new(HandlePool::with_label("pipeline", options.pipeline_capacity)),
            queues: Mutex::new(HandlePool::with_label("queue", options.queue_capacity)),
            pipeline_cache: PipelineCache::new(options.pipeline_cache_capacity),
            delete_queue: Mutex::new(Vec::new()),
            command_pool_generation: AtomicU64::new(0),
            options,
        };
        let device = GraphicsDevice {
            shared: Arc::new(shared),
        };
        if !self.inner.devices.add(id, device.clone()) {
            let err = RhiError::CapacityExhausted {
                kind: "device",
                capacity: self.inner.devices.capacity(),
            };
            diagnostics.error(LogCategory::Device, FUNCTION, err.to_string());
            return Err(err);
        }
        log::info!(
            target: "lume::device",
            "{} created on {:?} ({:?} barriers)",
            id,
            caps.kind,
            caps.barrier_model
        );
        Ok(device)
    }

    pub fn device(&self, id: DeviceId) -> Option<GraphicsDevice> {
        self.inner.devices.get(&id)
    }

    pub fn devices(&self) -> Vec<GraphicsDevice> {
        self.inner.devices.enumerate().collect()
    }

    /// Drops the context's reference. The device lives on while clones of it do.
    pub fn destroy_device(&self, id: DeviceId) -> bool {
        self.inner.devices.remove(&id).is_some()
    }
}

impl std::fmt::Debug for GraphicsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsContext")
            .field("options", &self.inner.options)
            .field("devices", &self.inner.devices.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::software::SoftwareBackend;
    use crate::DiagnosticRecord;

    fn device() -> (GraphicsContext, GraphicsDevice) {
        let context = GraphicsContext::new(ContextOptions { validation: true });
        let device = context
            .create_device(
                Arc::new(SoftwareBackend::new()),
                DeviceOptions {
                    resource_capacity: 2,
                    arena_reserve_bytes: 1 << 20,
                    ..Default::default()
                },
            )
            .unwrap();
        (context, device)
    }

    fn buffer(size: u64) -> BufferDescriptor {
        BufferDescriptor {
            size,
            usage: BufferUsage::STORAGE | BufferUsage::COPY_SRC,
            ..Default::default()
        }
    }

    #[test]
    fn registry_tracks_devices() {
        let (context, device) = device();
        assert!(context.device(device.id()).is_some());
        assert_eq!(context.devices().len(), 1);
        assert!(context.destroy_device(device.id()));
        assert!(context.device(device.id()).is_none());
        assert!(!context.destroy_device(device.id()));
    }

    #[test]
    fn resource_pool_capacity_is_reported() {
        let (_context, device) = device();
        device.create_buffer(&buffer(16)).unwrap();
        device.create_buffer(&buffer(16)).unwrap();
        assert!(matches!(
            device.create_buffer(&buffer(16)),
            Err(RhiError::CapacityExhausted { kind: "resource", .. })
        ));
    }

    #[test]
    fn host_access_is_bounds_checked() {
        let (_context, device) = device();
        let b = device.create_buffer(&buffer(16)).unwrap();
        device.write_buffer_pod(b, 4, &[7u32, 8, 9]).unwrap();
        assert_eq!(device.read_buffer_pod::<u32>(b, 4, 3).unwrap(), vec![7, 8, 9]);
        assert!(matches!(
            device.write_buffer(b, 12, &[0; 8]),
            Err(RhiError::OutOfRange { end: 20, size: 16, .. })
        ));
    }

    #[test]
    fn device_local_buffers_reject_host_access() {
        let (_context, device) = device();
        let b = device
            .create_buffer(&BufferDescriptor {
                memory: BufferMemoryPreference::DeviceLocal,
                ..buffer(16)
            })
            .unwrap();
        assert!(matches!(
            device.read_buffer_pod::<u32>(b, 0, 1),
            Err(RhiError::NotHostVisible)
        ));
    }

    #[test]
    fn write_descriptor_requires_storage() {
        let (_context, device) = device();
        let uniform = device
            .create_buffer(&BufferDescriptor {
                usage: BufferUsage::UNIFORM,
                ..buffer(16)
            })
            .unwrap();
        let result = device.create_resource_descriptor(ResourceDescriptorInfo {
            resource: uniform,
            usage: DescriptorUsage::Write,
        });
        assert!(matches!(result, Err(RhiError::Usage(_))));
        let read = device
            .create_resource_descriptor(ResourceDescriptorInfo {
                resource: uniform,
                usage: DescriptorUsage::Read,
            })
            .unwrap();
        assert_eq!(device.descriptor(read).map(|d| d.resource()), Some(uniform));
    }

    #[test]
    fn log_handlers_may_call_back_into_the_device() {
        let (context, device) = device();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (handler_device, sink) = (device.clone(), Arc::clone(&seen));
        context.set_log_handler(move |record: &DiagnosticRecord| {
            let counts = (
                handler_device.resource_count(),
                handler_device.pending_delete_count(),
            );
            lock(&sink).push((record.function, counts));
        });

        let b = device.create_buffer(&buffer(16)).unwrap();
        device.create_buffer(&buffer(16)).unwrap();
        assert!(device.create_buffer(&buffer(16)).is_err());
        assert!(device.read_buffer(b, 12, &mut [0; 8]).is_err());
        device.free_resource(b, &[]).unwrap();
        assert!(device.free_resource(b, &[]).is_err());
        context.clear_log_handler();

        let seen = lock(&seen).clone();
        assert_eq!(
            seen,
            vec![
                ("create_buffer", (2, 0)),
                ("read_buffer", (2, 0)),
                ("free_resource", (2, 1)),
            ]
        );
    }

    #[test]
    fn free_without_fences_releases_on_process() {
        let (_context, device) = device();
        let b = device.create_buffer(&buffer(16)).unwrap();
        device.free_resource(b, &[]).unwrap();
        assert!(device.is_resource_alive(b));
        assert!(matches!(device.free_resource(b, &[]), Err(RhiError::Usage(_))));
        assert_eq!(device.process_delete_queue(), 1);
        assert!(!device.is_resource_alive(b));
        assert!(matches!(
            device.free_resource(b, &[]),
            Err(RhiError::StaleHandle(_))
        ));
    }

    #[test]
    fn generation_counter_advances() {
        let (_context, device) = device();
        assert_eq!(device.command_pool_generation(), 0);
        device.reset_command_allocation();
        device.reset_command_allocation();
        assert_eq!(device.command_pool_generation(), 2);
    }
}
