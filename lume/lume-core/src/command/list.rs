//! Command list recording.

use super::queue::QueueInner;
use crate::backend::{NativeColorAttachment, NativeCommandAllocator, NativeCommandList};
use crate::barrier::{BarrierRequest, BarrierRole, FlushPoint, ResourceBarrierEngine};
use crate::diagnostics::LogCategory;
use crate::error::{RhiError, RhiResult};
use crate::memory::StackArena;
use crate::pipeline::{PipelineHandle, PipelineKind};
use crate::resource::{DescriptorHandle, ResourceHandle, ResourceInfo};
use crate::{QueueType, RenderPassDescriptor, ShaderMetadata};
use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::thread::ThreadId;

/// Native list plus the per-list state recycled with it.
pub(crate) struct PooledList {
    pub(crate) native: Box<dyn NativeCommandList>,
    pub(crate) scratch: StackArena,
    pub(crate) engine: ResourceBarrierEngine,
}

pub(crate) enum ListOrigin {
    Pooled {
        ring_index: usize,
        slot: usize,
        epoch: u64,
    },
    /// Allocated outside the pool; owns its allocator.
    Overflow {
        #[allow(dead_code)]
        allocator: Box<dyn NativeCommandAllocator>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListState {
    Recording,
    Committed,
    Submitted(u64),
}

#[derive(Debug, Clone, Copy)]
struct BoundPipeline {
    kind: PipelineKind,
    metadata: ShaderMetadata,
}

/// A command list in the recording or committed state.
///
/// Dropping a list returns it to its pool item, whether or not it was executed.
pub struct CommandList {
    pub(crate) queue: Arc<QueueInner>,
    thread: ThreadId,
    origin: Option<ListOrigin>,
    body: ManuallyDrop<PooledList>,
    state: ListState,
    pipeline: Option<BoundPipeline>,
    in_render_pass: bool,
}

impl CommandList {
    pub(crate) fn new(
        queue: Arc<QueueInner>,
        thread: ThreadId,
        origin: ListOrigin,
        body: PooledList,
    ) -> Self {
        Self {
            queue,
            thread,
            origin: Some(origin),
            body: ManuallyDrop::new(body),
            state: ListState::Recording,
            pipeline: None,
            in_render_pass: false,
        }
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue.queue_type
    }

    pub fn is_committed(&self) -> bool {
        self.state == ListState::Committed
    }

    /// Whether the list came from the queue's pool rather than the overflow path.
    pub fn is_pooled(&self) -> bool {
        matches!(self.origin, Some(ListOrigin::Pooled { .. }))
    }

    pub fn barrier_engine(&self) -> &ResourceBarrierEngine {
        &self.body.engine
    }

    pub(crate) fn native(&self) -> &dyn NativeCommandList {
        self.body.native.as_ref()
    }

    pub(crate) fn mark_submitted(&mut self, value: u64) {
        self.state = ListState::Submitted(value);
    }

    fn usage_error(&self, function: &'static str, message: impl Into<String>) -> RhiError {
        let message = message.into();
        self.queue
            .device
            .diagnostics
            .error(LogCategory::Submission, function, message.clone());
        RhiError::Usage(message)
    }

    fn check_recording(&self, function: &'static str) -> RhiResult<()> {
        match self.state {
            ListState::Recording => Ok(()),
            _ => Err(self.usage_error(function, "command list is no longer recording")),
        }
    }

    fn report<T>(&self, function: &'static str, result: RhiResult<T>) -> RhiResult<T> {
        result.inspect_err(|e| {
            let category = match e {
                RhiError::Validation(_) => LogCategory::Barrier,
                _ => LogCategory::Submission,
            };
            self.queue
                .device
                .diagnostics
                .error(category, function, e.to_string())
        })
    }

    fn request(&mut self, request: BarrierRequest) -> RhiResult<()> {
        let info = self.queue.device.resource_info(request.resource);
        self.body.engine.request(&request, info)
    }

    /// Resolves pending barrier requests and records them as one barrier command.
    fn flush(&mut self, point: FlushPoint) -> RhiResult<()> {
        let body = &mut *self.body;
        let scope = body.scratch.scope();
        if let Some(batch) = body.engine.flush(point, &scope)? {
            body.native.barrier(&batch);
        }
        Ok(())
    }

    /// Declares that the next command accesses the descriptor's resource with the
    /// descriptor's usage.
    pub fn barrier_descriptor(&mut self, descriptor: DescriptorHandle) -> RhiResult<()> {
        const FUNCTION: &str = "barrier_descriptor";
        self.check_recording(FUNCTION)?;
        let result = match self.queue.device.descriptor_record(descriptor) {
            Some(record) => self.request(BarrierRequest::new(record.resource, record.usage.into())),
            None => Err(RhiError::Validation(format!(
                "barrier on invalid or freed descriptor {:?}",
                descriptor
            ))),
        };
        self.report(FUNCTION, result)
    }

    /// Declares an access with an explicit role, before-state or sync scope.
    pub fn barrier_resource(&mut self, request: BarrierRequest) -> RhiResult<()> {
        const FUNCTION: &str = "barrier_resource";
        self.check_recording(FUNCTION)?;
        let result = self.request(request);
        self.report(FUNCTION, result)
    }

    /// Records pending barriers now instead of at the next command.
    pub fn flush_barriers(&mut self) -> RhiResult<()> {
        const FUNCTION: &str = "flush_barriers";
        self.check_recording(FUNCTION)?;
        let result = self.flush(FlushPoint::Explicit);
        self.report(FUNCTION, result)
    }

    pub fn set_pipeline(&mut self, pipeline: PipelineHandle) -> RhiResult<()> {
        const FUNCTION: &str = "set_pipeline";
        self.check_recording(FUNCTION)?;
        let Some((kind, native, metadata)) = self.queue.device.pipeline_entry(pipeline) else {
            return self.report(FUNCTION, Err(RhiError::StaleHandle("pipeline")));
        };
        if kind == PipelineKind::Graphics && self.queue.queue_type != QueueType::Graphics {
            return Err(self.usage_error(
                FUNCTION,
                format!("graphics pipeline bound on a {:?} queue", self.queue.queue_type),
            ));
        }
        self.body.native.set_pipeline(&native);
        self.pipeline = Some(BoundPipeline { kind, metadata });
        Ok(())
    }

    /// Sets 32-bit root constants starting at `offset`.
    pub fn push_constants(&mut self, offset: u32, values: &[u32]) -> RhiResult<()> {
        const FUNCTION: &str = "push_constants";
        self.check_recording(FUNCTION)?;
        if let Some(bound) = self.pipeline {
            let end = offset as usize + values.len();
            if end > bound.metadata.push_constant_count as usize {
                self.queue.device.diagnostics.warning(
                    LogCategory::Submission,
                    FUNCTION,
                    format!(
                        "writing constants up to {} but the shader declares {}",
                        end, bound.metadata.push_constant_count
                    ),
                );
            }
        }
        self.body.native.push_constants(offset, values);
        Ok(())
    }

    fn bound(&self, function: &'static str, kind: PipelineKind) -> RhiResult<BoundPipeline> {
        match self.pipeline {
            Some(bound) if bound.kind == kind => Ok(bound),
            _ => Err(self.usage_error(function, format!("no {:?} pipeline bound", kind))),
        }
    }

    pub fn dispatch(&mut self, groups_x: u32, groups_y: u32, groups_z: u32) -> RhiResult<()> {
        const FUNCTION: &str = "dispatch";
        self.check_recording(FUNCTION)?;
        self.bound(FUNCTION, PipelineKind::Compute)?;
        if self.in_render_pass {
            return Err(self.usage_error(FUNCTION, "dispatch inside a render pass"));
        }
        let result = self.flush(FlushPoint::Dispatch);
        self.report(FUNCTION, result)?;
        self.body.native.dispatch([groups_x, groups_y, groups_z]);
        Ok(())
    }

    /// Dispatches enough thread groups to cover `threads`, using the bound shader's
    /// thread-group size.
    pub fn dispatch_threads(&mut self, threads: [u32; 3]) -> RhiResult<()> {
        let bound = self.bound("dispatch_threads", PipelineKind::Compute)?;
        let size = bound.metadata.thread_group_size;
        let groups = |i: usize| threads[i].div_ceil(size[i].max(1));
        self.dispatch(groups(0), groups(1), groups(2))
    }

    /// Begins a render pass. Color attachments are transitioned to the render-target
    /// state first.
    pub fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) -> RhiResult<()> {
        const FUNCTION: &str = "begin_render_pass";
        self.check_recording(FUNCTION)?;
        if self.in_render_pass {
            return Err(self.usage_error(FUNCTION, "render pass already open"));
        }
        let mut attachments = Vec::with_capacity(desc.color_attachments.len());
        for attachment in &desc.color_attachments {
            let result = self.request(
                BarrierRequest::write(attachment.texture).with_role(BarrierRole::RenderTarget),
            );
            self.report(FUNCTION, result)?;
            let Some(texture) = self.queue.device.native_resource(attachment.texture) else {
                return self.report(FUNCTION, Err(RhiError::StaleHandle("resource")));
            };
            attachments.push(NativeColorAttachment {
                texture,
                load_op: attachment.load_op,
                clear_value: attachment.clear_value,
            });
        }
        let result = self.flush(FlushPoint::Draw);
        self.report(FUNCTION, result)?;
        self.body.native.begin_render_pass(&attachments);
        self.in_render_pass = true;
        Ok(())
    }

    pub fn end_render_pass(&mut self) -> RhiResult<()> {
        const FUNCTION: &str = "end_render_pass";
        self.check_recording(FUNCTION)?;
        if !self.in_render_pass {
            return Err(self.usage_error(FUNCTION, "no render pass open"));
        }
        self.body.native.end_render_pass();
        self.in_render_pass = false;
        Ok(())
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> RhiResult<()> {
        const FUNCTION: &str = "draw";
        self.check_recording(FUNCTION)?;
        if !self.in_render_pass {
            return Err(self.usage_error(FUNCTION, "draw outside a render pass"));
        }
        self.bound(FUNCTION, PipelineKind::Graphics)?;
        let result = self.flush(FlushPoint::Draw);
        self.report(FUNCTION, result)?;
        self.body
            .native
            .draw(vertex_count, instance_count, first_vertex, first_instance);
        Ok(())
    }

    /// Copies `size` bytes between buffers, transitioning both for the copy.
    pub fn copy_buffer(
        &mut self,
        src: ResourceHandle,
        src_offset: u64,
        dst: ResourceHandle,
        dst_offset: u64,
        size: u64,
    ) -> RhiResult<()> {
        const FUNCTION: &str = "copy_buffer";
        self.check_recording(FUNCTION)?;
        if self.in_render_pass {
            return Err(self.usage_error(FUNCTION, "copy inside a render pass"));
        }
        let device = &self.queue.device;
        let (Some(src_native), Some(dst_native)) =
            (device.native_resource(src), device.native_resource(dst))
        else {
            return self.report(FUNCTION, Err(RhiError::StaleHandle("resource")));
        };
        for (offset, info) in [
            (src_offset, device.resource_info(src)),
            (dst_offset, device.resource_info(dst)),
        ] {
            let Some(ResourceInfo::Buffer { size: total, .. }) = info else {
                return Err(self.usage_error(FUNCTION, "copy_buffer on a texture"));
            };
            let end = offset.checked_add(size).unwrap_or(u64::MAX);
            if end > total {
                return self.report(
                    FUNCTION,
                    Err(RhiError::OutOfRange {
                        offset,
                        end,
                        size: total,
                    }),
                );
            }
        }
        let result = self
            .request(BarrierRequest::read(src).with_role(BarrierRole::CopySource))
            .and_then(|()| {
                self.request(BarrierRequest::write(dst).with_role(BarrierRole::CopyDestination))
            })
            .and_then(|()| self.flush(FlushPoint::Copy));
        self.report(FUNCTION, result)?;
        self.body
            .native
            .copy_buffer(&src_native, src_offset, &dst_native, dst_offset, size);
        Ok(())
    }

    /// Ends recording. Pending barriers are flushed first.
    pub fn commit(&mut self) -> RhiResult<()> {
        const FUNCTION: &str = "commit";
        if self.state != ListState::Recording {
            return Err(self.usage_error(FUNCTION, "command list committed twice"));
        }
        if self.in_render_pass {
            return Err(self.usage_error(FUNCTION, "commit with an open render pass"));
        }
        let result = self
            .flush(FlushPoint::Explicit)
            .and_then(|()| self.body.native.close());
        self.report(FUNCTION, result)?;
        self.state = ListState::Committed;
        Ok(())
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        // SAFETY: `body` is taken exactly once, here.
        let body = unsafe { ManuallyDrop::take(&mut self.body) };
        let submitted = match self.state {
            ListState::Submitted(value) => Some(value),
            _ => None,
        };
        if let Some(origin) = self.origin.take() {
            self.queue.release(self.thread, origin, body, submitted);
        }
    }
}

impl std::fmt::Debug for CommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("queue_type", &self.queue.queue_type)
            .field("state", &self.state)
            .field("pooled", &self.is_pooled())
            .field("pending_barriers", &self.body.engine.pending_count())
            .finish()
    }
}
