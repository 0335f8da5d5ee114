//! Pipeline state records and the content-hash pipeline cache.

use crate::backend::NativePipeline;
use crate::dictionary::{ConcurrentDictionary, DictionaryConfig, DictionaryGrowth};
use crate::handle_pool::Handle;
use crate::{ComputePipelineDescriptor, GraphicsPipelineDescriptor, ShaderMetadata};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub type PipelineHandle = Handle<PipelineRecord>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Compute,
    Graphics,
}

/// Device-side entry for a compiled pipeline.
#[derive(Debug)]
pub struct PipelineRecord {
    pub(crate) kind: PipelineKind,
    pub(crate) native: Arc<dyn NativePipeline>,
    pub(crate) metadata: ShaderMetadata,
    pub(crate) cache_key: u64,
}

impl PipelineRecord {
    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    /// Metadata of the compute shader, or of the vertex shader for graphics pipelines.
    pub fn metadata(&self) -> ShaderMetadata {
        self.metadata
    }

    pub fn cache_key(&self) -> u64 {
        self.cache_key
    }
}

/// Pipeline descriptors that can be content-hashed.
pub trait PipelineKey {
    fn kind(&self) -> PipelineKind;
    fn cache_key(&self) -> u64;
}

fn hash_with_kind<T: Hash>(kind: PipelineKind, value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    kind.hash(&mut hasher);
    value.hash(&mut hasher);
    hasher.finish()
}

impl PipelineKey for ComputePipelineDescriptor {
    fn kind(&self) -> PipelineKind {
        PipelineKind::Compute
    }

    // The label does not affect the compiled state.
    fn cache_key(&self) -> u64 {
        hash_with_kind(PipelineKind::Compute, &self.shader)
    }
}

impl PipelineKey for GraphicsPipelineDescriptor {
    fn kind(&self) -> PipelineKind {
        PipelineKind::Graphics
    }

    fn cache_key(&self) -> u64 {
        hash_with_kind(
            PipelineKind::Graphics,
            &(
                &self.vertex_shader,
                &self.fragment_shader,
                self.primitive_topology,
                &self.rasterization,
                &self.color_targets,
                &self.depth_stencil,
            ),
        )
    }
}

/// Maps content hashes to compiled pipelines. Once full it stops caching; pipelines
/// are still created, just not shared.
#[derive(Debug)]
pub struct PipelineCache {
    entries: ConcurrentDictionary<u64, PipelineHandle>,
}

impl PipelineCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: ConcurrentDictionary::with_config(
                "pipeline cache",
                DictionaryConfig {
                    capacity,
                    growth: DictionaryGrowth::Fixed,
                },
            ),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    pub fn get(&self, key: u64) -> Option<PipelineHandle> {
        self.entries.get(&key)
    }

    /// Returns the handle already cached for `key`, if another thread won the race.
    pub fn insert(&self, key: u64, pipeline: PipelineHandle) -> PipelineHandle {
        self.entries.get_or_add(key, || pipeline)
    }

    /// Drops `key` if it still maps to `pipeline`.
    pub fn evict(&self, key: u64, pipeline: PipelineHandle) -> bool {
        self.entries
            .remove_if(&key, |cached| *cached == pipeline)
            .is_some()
    }

    pub fn handles(&self) -> Vec<PipelineHandle> {
        self.entries.enumerate().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ShaderStage, TextureFormat};

    fn stage(name: &str) -> ShaderStage {
        ShaderStage {
            bytecode: name.as_bytes().to_vec(),
            entry_point: "main".into(),
            metadata: ShaderMetadata::default(),
        }
    }

    #[test]
    fn key_ignores_label() {
        let a = ComputePipelineDescriptor {
            label: Some("a"),
            shader: stage("fill"),
        };
        let b = ComputePipelineDescriptor {
            label: Some("b"),
            ..a.clone()
        };
        assert_eq!(a.cache_key(), b.cache_key());
        let c = ComputePipelineDescriptor {
            label: None,
            shader: stage("copy"),
        };
        assert_ne!(a.cache_key(), c.cache_key());
    }

    #[test]
    fn graphics_key_tracks_targets() {
        let base = GraphicsPipelineDescriptor {
            label: None,
            vertex_shader: stage("vs"),
            fragment_shader: None,
            primitive_topology: Default::default(),
            rasterization: Default::default(),
            color_targets: vec![crate::ColorTargetState {
                format: TextureFormat::Rgba8Unorm,
                blend: None,
            }],
            depth_stencil: None,
        };
        let mut other = base.clone();
        other.color_targets[0].format = TextureFormat::Bgra8Unorm;
        assert_ne!(base.cache_key(), other.cache_key());
    }

    #[test]
    fn full_cache_stops_caching() {
        let cache = PipelineCache::new(1);
        let first = PipelineHandle::new(0, 1);
        let second = PipelineHandle::new(1, 1);
        assert_eq!(cache.insert(10, first), first);
        assert_eq!(cache.insert(10, second), first);
        assert_eq!(cache.insert(11, second), second);
        assert_eq!(cache.get(11), None);
        assert!(!cache.evict(10, second));
        assert!(cache.evict(10, first));
        assert!(cache.is_empty());
    }
}
