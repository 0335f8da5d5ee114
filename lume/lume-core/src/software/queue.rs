//! Queues, allocators and command lists of the software backend.
//!
//! Each queue owns a worker thread that executes submitted command lists in order and
//! advances a timeline after every submission.

use super::kernel::KernelInvocation;
use super::resources::{lock, SoftwareBuffer, SoftwarePipeline, SoftwareTexture};
use super::SoftwareShared;
use crate::backend::{
    NativeColorAttachment, NativeCommandAllocator, NativeCommandList, NativePipeline,
    NativeQueue, NativeResource, Submission,
};
use crate::barrier::BarrierBatch;
use crate::error::{RhiError, RhiResult};
use crate::QueueType;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

const LOG_TARGET: &str = "lume::submission";

/// Monotonic completion counter.
#[derive(Debug, Default)]
pub(crate) struct Timeline {
    value: Mutex<u64>,
    reached: Condvar,
}

impl Timeline {
    pub fn value(&self) -> u64 {
        *lock(&self.value)
    }

    pub fn signal(&self, value: u64) {
        let mut current = lock(&self.value);
        if value > *current {
            *current = value;
        }
        self.reached.notify_all();
    }

    pub fn wait(&self, value: u64) {
        let mut current = lock(&self.value);
        while *current < value {
            current = self
                .reached
                .wait(current)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum SoftwareCommand {
    Barrier { count: usize },
    SetPipeline(Arc<dyn NativePipeline>),
    PushConstants { offset: u32, values: Vec<u32> },
    Dispatch([u32; 3]),
    BeginRenderPass(Vec<NativeColorAttachment>),
    EndRenderPass,
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    CopyBuffer {
        src: Arc<dyn NativeResource>,
        src_offset: u64,
        dst: Arc<dyn NativeResource>,
        dst_offset: u64,
        size: u64,
    },
}

struct Job {
    lists: Vec<Arc<Vec<SoftwareCommand>>>,
    waits: Vec<(Arc<Timeline>, u64)>,
    signal: u64,
}

/// A queue executing on a dedicated worker thread.
pub struct SoftwareQueue {
    queue_type: QueueType,
    shared: Arc<SoftwareShared>,
    timeline: Arc<Timeline>,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SoftwareQueue {
    pub(crate) fn spawn(queue_type: QueueType, shared: Arc<SoftwareShared>) -> RhiResult<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let timeline = Arc::new(Timeline::default());
        let worker_timeline = Arc::clone(&timeline);
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(format!("lume-{:?}-queue", queue_type).to_lowercase())
            .spawn(move || {
                for job in receiver {
                    for (timeline, value) in &job.waits {
                        timeline.wait(*value);
                    }
                    for commands in &job.lists {
                        let run = catch_unwind(AssertUnwindSafe(|| {
                            Executor::new(&worker_shared).run(commands)
                        }));
                        if run.is_err() {
                            log::error!(
                                target: LOG_TARGET,
                                "software kernel panicked; skipping rest of the list"
                            );
                        }
                    }
                    worker_timeline.signal(job.signal);
                }
            })
            .map_err(|e| RhiError::Backend(format!("failed to spawn queue worker: {}", e)))?;
        Ok(Self {
            queue_type,
            shared,
            timeline,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }
}

impl std::fmt::Debug for SoftwareQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareQueue")
            .field("queue_type", &self.queue_type)
            .field("completed", &self.timeline.value())
            .finish()
    }
}

impl Drop for SoftwareQueue {
    fn drop(&mut self) {
        lock(&self.sender).take();
        if let Some(worker) = lock(&self.worker).take() {
            if worker.join().is_err() {
                log::error!(target: LOG_TARGET, "queue worker terminated abnormally");
            }
        }
    }
}

impl NativeQueue for SoftwareQueue {
    fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    fn create_command_allocator(&self) -> RhiResult<Box<dyn NativeCommandAllocator>> {
        Ok(Box::new(SoftwareCommandAllocator {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn submit(&self, submission: Submission<'_>) -> RhiResult<()> {
        let mut lists = Vec::with_capacity(submission.lists.len());
        for list in submission.lists {
            let list = list
                .as_any()
                .downcast_ref::<SoftwareCommandList>()
                .ok_or_else(|| RhiError::Backend("foreign command list".into()))?;
            let commands = list
                .closed
                .clone()
                .ok_or_else(|| RhiError::Backend("command list is not closed".into()))?;
            lists.push(commands);
        }
        let mut waits = Vec::with_capacity(submission.waits.len());
        for (queue, value) in submission.waits {
            let queue = queue
                .as_any()
                .downcast_ref::<SoftwareQueue>()
                .ok_or_else(|| RhiError::Backend("wait on a foreign queue".into()))?;
            waits.push((Arc::clone(&queue.timeline), *value));
        }
        let sender = lock(&self.sender);
        let sender = sender
            .as_ref()
            .ok_or_else(|| RhiError::Backend("queue is shut down".into()))?;
        sender
            .send(Job {
                lists,
                waits,
                signal: submission.signal_value,
            })
            .map_err(|_| RhiError::Backend("queue worker is gone".into()))?;
        self.shared.count_submission();
        Ok(())
    }

    fn completed_value(&self) -> u64 {
        self.timeline.value()
    }

    fn wait_for_value(&self, value: u64) {
        self.timeline.wait(value);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
pub(crate) struct SoftwareCommandAllocator {
    shared: Arc<SoftwareShared>,
}

impl NativeCommandAllocator for SoftwareCommandAllocator {
    fn reset(&mut self) -> RhiResult<()> {
        self.shared.count_allocator_reset();
        Ok(())
    }

    fn allocate_list(&mut self, queue_type: QueueType) -> RhiResult<Box<dyn NativeCommandList>> {
        Ok(Box::new(SoftwareCommandList {
            shared: Arc::clone(&self.shared),
            queue_type,
            recording: Vec::new(),
            closed: None,
        }))
    }
}

/// Records commands into a vector; closing freezes them for submission.
#[derive(Debug)]
pub(crate) struct SoftwareCommandList {
    shared: Arc<SoftwareShared>,
    queue_type: QueueType,
    recording: Vec<SoftwareCommand>,
    closed: Option<Arc<Vec<SoftwareCommand>>>,
}

impl NativeCommandList for SoftwareCommandList {
    fn begin(&mut self) -> RhiResult<()> {
        self.recording.clear();
        self.closed = None;
        Ok(())
    }

    fn close(&mut self) -> RhiResult<()> {
        self.closed = Some(Arc::new(std::mem::take(&mut self.recording)));
        Ok(())
    }

    fn barrier(&mut self, batch: &BarrierBatch<'_>) {
        self.shared.record_barrier(batch);
        self.recording.push(SoftwareCommand::Barrier { count: batch.len() });
    }

    fn set_pipeline(&mut self, pipeline: &Arc<dyn NativePipeline>) {
        self.recording
            .push(SoftwareCommand::SetPipeline(Arc::clone(pipeline)));
    }

    fn push_constants(&mut self, offset: u32, values: &[u32]) {
        self.recording.push(SoftwareCommand::PushConstants {
            offset,
            values: values.to_vec(),
        });
    }

    fn dispatch(&mut self, groups: [u32; 3]) {
        if self.queue_type == QueueType::Copy {
            log::warn!(target: LOG_TARGET, "dispatch recorded on a copy queue");
        }
        self.recording.push(SoftwareCommand::Dispatch(groups));
    }

    fn begin_render_pass(&mut self, attachments: &[NativeColorAttachment]) {
        self.recording
            .push(SoftwareCommand::BeginRenderPass(attachments.to_vec()));
    }

    fn end_render_pass(&mut self) {
        self.recording.push(SoftwareCommand::EndRenderPass);
    }

    fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.recording.push(SoftwareCommand::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    fn copy_buffer(
        &mut self,
        src: &Arc<dyn NativeResource>,
        src_offset: u64,
        dst: &Arc<dyn NativeResource>,
        dst_offset: u64,
        size: u64,
    ) {
        self.recording.push(SoftwareCommand::CopyBuffer {
            src: Arc::clone(src),
            src_offset,
            dst: Arc::clone(dst),
            dst_offset,
            size,
        });
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Per-list execution state on the worker thread.
struct Executor<'a> {
    shared: &'a SoftwareShared,
    pipeline: Option<Arc<dyn NativePipeline>>,
    push_constants: Vec<u32>,
    in_render_pass: bool,
}

impl<'a> Executor<'a> {
    fn new(shared: &'a SoftwareShared) -> Self {
        Self {
            shared,
            pipeline: None,
            push_constants: Vec::new(),
            in_render_pass: false,
        }
    }

    fn run(&mut self, commands: &[SoftwareCommand]) {
        for command in commands {
            match command {
                SoftwareCommand::Barrier { count } => {
                    log::trace!(target: LOG_TARGET, "barrier ({} transitions)", count);
                }
                SoftwareCommand::SetPipeline(pipeline) => {
                    self.pipeline = Some(Arc::clone(pipeline))
                }
                SoftwareCommand::PushConstants { offset, values } => {
                    let start = *offset as usize;
                    let end = start + values.len();
                    if self.push_constants.len() < end {
                        self.push_constants.resize(end, 0);
                    }
                    self.push_constants[start..end].copy_from_slice(values);
                }
                SoftwareCommand::Dispatch(groups) => self.dispatch(*groups),
                SoftwareCommand::BeginRenderPass(attachments) => {
                    self.in_render_pass = true;
                    for attachment in attachments {
                        self.load_attachment(attachment);
                    }
                }
                SoftwareCommand::EndRenderPass => self.in_render_pass = false,
                SoftwareCommand::Draw {
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                } => self.draw(*vertex_count, *instance_count, *first_vertex, *first_instance),
                SoftwareCommand::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    let (Some(src), Some(dst)) = (
                        src.as_any().downcast_ref::<SoftwareBuffer>(),
                        dst.as_any().downcast_ref::<SoftwareBuffer>(),
                    ) else {
                        log::error!(target: LOG_TARGET, "copy between non-buffer resources");
                        continue;
                    };
                    SoftwareBuffer::copy(
                        src,
                        *src_offset as usize,
                        dst,
                        *dst_offset as usize,
                        *size as usize,
                    );
                }
            }
        }
    }

    fn invocation(&self, thread_id: [u32; 3]) -> KernelInvocation<'_> {
        KernelInvocation {
            thread_id,
            push_constants: &self.push_constants,
            descriptors: &self.shared.descriptors,
        }
    }

    fn dispatch(&self, groups: [u32; 3]) {
        let Some(SoftwarePipeline::Compute { kernel, metadata }) = self
            .pipeline
            .as_ref()
            .and_then(|p| p.as_any().downcast_ref::<SoftwarePipeline>())
        else {
            log::error!(target: LOG_TARGET, "dispatch without a compute pipeline bound");
            return;
        };
        let [sx, sy, sz] = metadata.thread_group_size;
        for gz in 0..groups[2] {
            for gy in 0..groups[1] {
                for gx in 0..groups[0] {
                    for tz in 0..sz {
                        for ty in 0..sy {
                            for tx in 0..sx {
                                let id = [gx * sx + tx, gy * sy + ty, gz * sz + tz];
                                kernel.run(&mut self.invocation(id));
                            }
                        }
                    }
                }
            }
        }
    }

    fn draw(&self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        if !self.in_render_pass {
            log::error!(target: LOG_TARGET, "draw outside a render pass");
            return;
        }
        let Some(SoftwarePipeline::Graphics { vertex, has_fragment }) = self
            .pipeline
            .as_ref()
            .and_then(|p| p.as_any().downcast_ref::<SoftwarePipeline>())
        else {
            log::error!(target: LOG_TARGET, "draw without a graphics pipeline bound");
            return;
        };
        if *has_fragment {
            log::trace!(
                target: LOG_TARGET,
                "fragment stage is not rasterized by the software backend"
            );
        }
        for instance in first_instance..first_instance + instance_count {
            for v in first_vertex..first_vertex + vertex_count {
                vertex.run(&mut self.invocation([v, instance, 0]));
            }
        }
    }

    fn load_attachment(&self, attachment: &NativeColorAttachment) {
        if attachment.load_op != crate::LoadOp::Clear {
            return;
        }
        let Some(texture) = attachment.texture.as_any().downcast_ref::<SoftwareTexture>() else {
            log::error!(target: LOG_TARGET, "render pass attachment is not a texture");
            return;
        };
        let color = attachment.clear_value.unwrap_or(crate::ClearColor::BLACK);
        if !texture.clear(color) {
            log::warn!(
                target: LOG_TARGET,
                "clear of {:?} is not supported by the software backend",
                texture.format()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeline_wakes_waiters() {
        let timeline = Arc::new(Timeline::default());
        let waiter = {
            let timeline = Arc::clone(&timeline);
            std::thread::spawn(move || {
                timeline.wait(3);
                timeline.value()
            })
        };
        timeline.signal(1);
        timeline.signal(3);
        assert!(waiter.join().unwrap() >= 3);
        timeline.signal(2);
        assert_eq!(timeline.value(), 3);
    }
}
