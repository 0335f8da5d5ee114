//! Per-command-list barrier state machine.

use super::{
    access_for, default_sync, layout_for, BarrierBatch, BarrierRequest, BarrierRole,
    BarrierSync, BarrierUsage, FlushPoint, ResourceBarrierItem, ResourceState, TextureLayout,
};
use crate::error::RhiError;
use crate::memory::ArenaScope;
use crate::resource::{ResourceHandle, ResourceInfo, ResourceKind};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
struct PendingBarrier {
    resource: ResourceHandle,
    kind: ResourceKind,
    role: BarrierRole,
    usage: BarrierUsage,
    before: Option<ResourceState>,
    sync_after: Option<BarrierSync>,
}

/// Pending requests for one resource, collapsed to first-before / last-after.
#[derive(Debug, Clone, Copy)]
struct NetTransition {
    resource: ResourceHandle,
    kind: ResourceKind,
    before: ResourceState,
    last: PendingBarrier,
}

/// Counters over the lifetime of an engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BarrierStats {
    pub batches: usize,
    pub barriers: usize,
    /// Requests that needed no barrier.
    pub elided: usize,
    /// Requests dropped by validation.
    pub rejected: usize,
}

/// Tracks the last known state of every resource a command list touched and turns
/// queued requests into minimal barrier batches.
///
/// State is local to one command list. Work submitted in an earlier list is not
/// visible here; callers chain it through [`BarrierRequest::before`].
#[derive(Debug)]
pub struct ResourceBarrierEngine {
    texture_layouts: bool,
    tracked: HashMap<ResourceHandle, ResourceState>,
    pending: Vec<PendingBarrier>,
    net: Vec<NetTransition>,
    /// After-states of the flush in progress, applied to `tracked` once it succeeds.
    staged: Vec<(ResourceHandle, ResourceState)>,
    buffer_items: Vec<ResourceBarrierItem>,
    texture_items: Vec<ResourceBarrierItem>,
    stats: BarrierStats,
}

impl ResourceBarrierEngine {
    /// `texture_layouts` is false for backends without a layout concept; layout
    /// transitions are then compiled away.
    pub fn new(texture_layouts: bool) -> Self {
        Self {
            texture_layouts,
            tracked: HashMap::new(),
            pending: Vec::new(),
            net: Vec::new(),
            staged: Vec::new(),
            buffer_items: Vec::new(),
            texture_items: Vec::new(),
            stats: BarrierStats::default(),
        }
    }

    /// Forgets all tracked state, as at the start of a new command list.
    pub fn reset(&mut self) {
        self.tracked.clear();
        self.pending.clear();
        self.stats = BarrierStats::default();
    }

    pub fn texture_layouts(&self) -> bool {
        self.texture_layouts
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn tracked_state(&self, resource: ResourceHandle) -> Option<ResourceState> {
        self.tracked.get(&resource).copied()
    }

    pub fn stats(&self) -> BarrierStats {
        self.stats
    }

    /// Queues a request. `info` is the resource's creation info, `None` when the handle is
    /// stale. Invalid requests are rejected and nothing is queued.
    pub fn request(
        &mut self,
        request: &BarrierRequest,
        info: Option<ResourceInfo>,
    ) -> Result<(), RhiError> {
        let Some(info) = info else {
            self.stats.rejected += 1;
            return Err(RhiError::Validation(format!(
                "barrier on invalid or freed resource {:?}",
                request.resource
            )));
        };
        if !info.supports(request.role, request.usage) {
            self.stats.rejected += 1;
            return Err(RhiError::Validation(format!(
                "{:?} {:?} barrier on {:?} {:?} created without the matching usage",
                request.role,
                request.usage,
                info.kind(),
                request.resource
            )));
        }
        self.pending.push(PendingBarrier {
            resource: request.resource,
            kind: info.kind(),
            role: request.role,
            usage: request.usage,
            before: request.before,
            sync_after: request.sync_after,
        });
        Ok(())
    }

    fn strip_layout(&self, kind: ResourceKind, state: ResourceState) -> ResourceState {
        if kind == ResourceKind::Texture && self.texture_layouts {
            state
        } else {
            ResourceState {
                layout: TextureLayout::Undefined,
                ..state
            }
        }
    }

    /// Resolves pending requests for a command at `point` and copies the barriers that
    /// must be emitted into `scope`. Returns `None` when nothing needs a barrier.
    ///
    /// When `scope` cannot hold the batch the error is returned with the pending
    /// requests and tracked states untouched, so a later flush emits the same barriers.
    pub fn flush<'s>(
        &mut self,
        point: FlushPoint,
        scope: &'s ArenaScope<'_>,
    ) -> Result<Option<BarrierBatch<'s>>, RhiError> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        self.net.clear();
        for pending in &self.pending {
            if let Some(existing) = self.net.iter_mut().find(|n| n.resource == pending.resource) {
                existing.last = *pending;
                continue;
            }
            let before = pending
                .before
                .or_else(|| self.tracked.get(&pending.resource).copied())
                .unwrap_or(ResourceState::INITIAL);
            self.net.push(NetTransition {
                resource: pending.resource,
                kind: pending.kind,
                before,
                last: *pending,
            });
        }

        self.staged.clear();
        self.buffer_items.clear();
        self.texture_items.clear();
        let mut elided = 0;
        for index in 0..self.net.len() {
            let net = self.net[index];
            let last = net.last;
            let after = self.strip_layout(
                net.kind,
                ResourceState {
                    sync: last
                        .sync_after
                        .unwrap_or_else(|| default_sync(point, last.role, last.usage)),
                    access: access_for(last.role, last.usage),
                    layout: layout_for(last.role, last.usage),
                },
            );
            let before = self.strip_layout(net.kind, net.before);
            self.staged.push((net.resource, after));
            if after == before && !before.access.is_write() {
                elided += 1;
                continue;
            }
            let item = ResourceBarrierItem {
                resource: net.resource,
                kind: net.kind,
                sync_before: before.sync,
                sync_after: after.sync,
                access_before: before.access,
                access_after: after.access,
                layout_before: before.layout,
                layout_after: after.layout,
            };
            match net.kind {
                ResourceKind::Buffer => self.buffer_items.push(item),
                ResourceKind::Texture => self.texture_items.push(item),
            }
        }

        let batch = if self.buffer_items.is_empty() && self.texture_items.is_empty() {
            None
        } else {
            let buffers = scope.alloc_slice_copy(&self.buffer_items)?;
            let textures = scope.alloc_slice_copy(&self.texture_items)?;
            Some(BarrierBatch {
                buffers: &*buffers,
                textures: &*textures,
            })
        };

        self.tracked.extend(self.staged.drain(..));
        self.pending.clear();
        self.stats.elided += elided;
        if let Some(batch) = &batch {
            self.stats.batches += 1;
            self.stats.barriers += batch.buffers.len() + batch.textures.len();
            log::trace!(
                target: "lume::barrier",
                "{:?} flush: {} buffer and {} texture barriers",
                point,
                batch.buffers.len(),
                batch.textures.len()
            );
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::BarrierAccess;
    use crate::memory::StackArena;
    use crate::{BufferUsage, TextureUsage};

    fn buffer(index: u32) -> (ResourceHandle, Option<ResourceInfo>) {
        (
            ResourceHandle::new(index, 1),
            Some(ResourceInfo::Buffer {
                size: 256,
                usage: BufferUsage::STORAGE | BufferUsage::COPY_SRC,
            }),
        )
    }

    fn texture(index: u32, usage: TextureUsage) -> (ResourceHandle, Option<ResourceInfo>) {
        (
            ResourceHandle::new(index, 1),
            Some(ResourceInfo::Texture {
                size: (8, 8, 1),
                usage,
            }),
        )
    }

    fn flush_items(
        engine: &mut ResourceBarrierEngine,
        point: FlushPoint,
    ) -> Option<(Vec<ResourceBarrierItem>, Vec<ResourceBarrierItem>)> {
        let arena = StackArena::with_capacity(4096).unwrap();
        let scope = arena.scope();
        let items = engine
            .flush(point, &scope)
            .unwrap()
            .map(|b| (b.buffers.to_vec(), b.textures.to_vec()));
        items
    }

    #[test]
    fn read_after_write_then_read_again() {
        let mut engine = ResourceBarrierEngine::new(true);
        let (r, info) = buffer(0);
        engine.request(&BarrierRequest::write(r), info).unwrap();
        let (first, _) = flush_items(&mut engine, FlushPoint::Dispatch).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].access_after, BarrierAccess::UNORDERED_ACCESS);

        engine.request(&BarrierRequest::read(r), info).unwrap();
        let (second, _) = flush_items(&mut engine, FlushPoint::Dispatch).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].access_before, BarrierAccess::UNORDERED_ACCESS);
        assert_eq!(second[0].access_after, BarrierAccess::SHADER_RESOURCE);

        engine.request(&BarrierRequest::read(r), info).unwrap();
        assert!(flush_items(&mut engine, FlushPoint::Dispatch).is_none());
        assert_eq!(engine.stats().elided, 1);
    }

    #[test]
    fn same_resource_twice_collapses() {
        let mut engine = ResourceBarrierEngine::new(true);
        let (r, info) = buffer(3);
        engine.request(&BarrierRequest::write(r), info).unwrap();
        let write_after = ResourceState::new(
            BarrierSync::COMPUTE_SHADING,
            BarrierAccess::UNORDERED_ACCESS,
            TextureLayout::Undefined,
        );
        engine
            .request(&BarrierRequest::read(r).with_before(write_after), info)
            .unwrap();
        let (items, textures) = flush_items(&mut engine, FlushPoint::Dispatch).unwrap();
        assert!(textures.is_empty());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].before(), ResourceState::INITIAL);
        assert_eq!(items[0].access_after, BarrierAccess::SHADER_RESOURCE);
    }

    #[test]
    fn write_after_write_is_a_hazard() {
        let mut engine = ResourceBarrierEngine::new(true);
        let (r, info) = buffer(1);
        engine.request(&BarrierRequest::write(r), info).unwrap();
        flush_items(&mut engine, FlushPoint::Dispatch).unwrap();
        engine.request(&BarrierRequest::write(r), info).unwrap();
        let (items, _) = flush_items(&mut engine, FlushPoint::Dispatch).unwrap();
        assert_eq!(items[0].access_before, BarrierAccess::UNORDERED_ACCESS);
        assert_eq!(items[0].access_after, BarrierAccess::UNORDERED_ACCESS);
    }

    #[test]
    fn buffers_and_textures_partition_in_request_order() {
        let mut engine = ResourceBarrierEngine::new(true);
        let (b0, bi) = buffer(0);
        let (t0, ti) = texture(1, TextureUsage::STORAGE_BINDING);
        let (b1, _) = buffer(2);
        engine.request(&BarrierRequest::write(b0), bi).unwrap();
        engine.request(&BarrierRequest::write(t0), ti).unwrap();
        engine.request(&BarrierRequest::read(b1), bi).unwrap();
        let (buffers, textures) = flush_items(&mut engine, FlushPoint::Dispatch).unwrap();
        assert_eq!(
            buffers.iter().map(|i| i.resource).collect::<Vec<_>>(),
            vec![b0, b1]
        );
        assert_eq!(textures[0].resource, t0);
        assert_eq!(textures[0].layout_after, TextureLayout::UnorderedAccess);
        assert_eq!(buffers[0].layout_after, TextureLayout::Undefined);
    }

    #[test]
    fn layouts_compiled_away_without_backend_support() {
        let mut engine = ResourceBarrierEngine::new(false);
        let (t, info) = texture(0, TextureUsage::TEXTURE_BINDING);
        engine.request(&BarrierRequest::read(t), info).unwrap();
        let (_, textures) = flush_items(&mut engine, FlushPoint::Draw).unwrap();
        assert_eq!(textures[0].layout_before, TextureLayout::Undefined);
        assert_eq!(textures[0].layout_after, TextureLayout::Undefined);
        assert_eq!(
            textures[0].sync_after,
            BarrierSync::VERTEX_SHADING | BarrierSync::PIXEL_SHADING
        );
    }

    #[test]
    fn invalid_requests_are_dropped() {
        let mut engine = ResourceBarrierEngine::new(true);
        let (t, info) = texture(0, TextureUsage::TEXTURE_BINDING);
        let rt = BarrierRequest::write(t).with_role(BarrierRole::RenderTarget);
        assert!(matches!(engine.request(&rt, info), Err(RhiError::Validation(_))));
        assert!(engine.request(&BarrierRequest::read(t), None).is_err());
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.stats().rejected, 2);
    }

    #[test]
    fn explicit_sync_override() {
        let mut engine = ResourceBarrierEngine::new(true);
        let (r, info) = buffer(0);
        engine
            .request(
                &BarrierRequest::read(r).with_sync_after(BarrierSync::PIXEL_SHADING),
                info,
            )
            .unwrap();
        let (items, _) = flush_items(&mut engine, FlushPoint::Dispatch).unwrap();
        assert_eq!(items[0].sync_after, BarrierSync::PIXEL_SHADING);
        assert_eq!(
            engine.tracked_state(r).map(|s| s.sync),
            Some(BarrierSync::PIXEL_SHADING)
        );
    }

    #[test]
    fn failed_flush_keeps_pending_and_tracked_state() {
        let mut engine = ResourceBarrierEngine::new(true);
        let (r, info) = buffer(0);
        engine.request(&BarrierRequest::write(r), info).unwrap();

        let tiny = StackArena::with_capacity(8).unwrap();
        let scope = tiny.scope();
        assert!(matches!(
            engine.flush(FlushPoint::Dispatch, &scope),
            Err(RhiError::Arena(_))
        ));
        drop(scope);
        assert_eq!(engine.pending_count(), 1);
        assert_eq!(engine.tracked_state(r), None);
        assert_eq!(engine.stats(), BarrierStats::default());

        let (items, _) = flush_items(&mut engine, FlushPoint::Dispatch).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].access_after, BarrierAccess::UNORDERED_ACCESS);
        assert_eq!(engine.stats().batches, 1);
    }
}
