//! Lume core: backend-agnostic GPU command and resource bookkeeping.
//!
//! Devices, command queues and lists, resources, descriptors, pipeline states and fences
//! are exposed through one API surface. Native backends plug in through the traits in
//! [`backend`]; everything else (arenas, handle pools, the concurrent dictionary, barrier
//! tracking and command-pool recycling) lives here and is shared by every backend.

pub mod backend;
pub mod barrier;
pub mod command;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod dictionary;
pub mod error;
pub mod handle_pool;
pub mod memory;
pub mod pipeline;
pub mod resource;
pub mod software;

#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use backend::{Backend, BackendCapabilities, BackendKind};
pub use barrier::{
    BarrierAccess, BarrierBatch, BarrierModel, BarrierRequest, BarrierRole, BarrierSync,
    BarrierUsage, ResourceBarrierEngine, ResourceBarrierItem, ResourceState, TextureLayout,
};
pub use command::{CommandList, CommandQueue, Fence};
pub use config::{ContextOptions, DeviceOptions};
pub use device::{DeviceId, GraphicsContext, GraphicsDevice};
pub use diagnostics::{DiagnosticRecord, Diagnostics, LogCategory, Severity};
pub use dictionary::{ConcurrentDictionary, DictionaryConfig, DictionaryGrowth};
pub use error::{RhiError, RhiResult};
pub use handle_pool::{Handle, HandlePool};
pub use memory::{AllocationState, ArenaError, ArenaScope, MemoryArena, StackArena};
pub use pipeline::{PipelineCache, PipelineHandle, PipelineKind};
pub use resource::{
    DescriptorHandle, DescriptorUsage, ResourceDescriptorInfo, ResourceHandle, ResourceInfo,
    ResourceKind,
};

bitflags::bitflags! {
    /// Buffer usage flags; combine for buffers used in multiple ways (e.g. STORAGE | COPY_SRC).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const COPY_SRC = 1 << 4;
        const COPY_DST = 1 << 5;
        const INDIRECT = 1 << 6;
        const ACCELERATION_STRUCTURE = 1 << 7;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct TextureUsage: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        const TEXTURE_BINDING = 1 << 2;
        const STORAGE_BINDING = 1 << 3;
        const RENDER_ATTACHMENT = 1 << 4;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Bgra8Unorm,
    R32Float,
    R32Uint,
    Rgba16Float,
    D32Float,
    Rgba32Float,
}

impl TextureFormat {
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm
            | TextureFormat::Bgra8Unorm
            | TextureFormat::R32Float
            | TextureFormat::R32Uint
            | TextureFormat::D32Float => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, TextureFormat::D32Float)
    }
}

/// Texture dimension / type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureDimension {
    #[default]
    D2,
    D2Array,
    D3,
    Cube,
}

/// Queue families a device can create queues for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    Graphics,
    Compute,
    Copy,
}

/// When HostVisible, the buffer is mappable and `write_buffer`/`read_buffer` work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferMemoryPreference {
    #[default]
    HostVisible,
    DeviceLocal,
}

#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: Option<&'static str>,
    pub size: u64,
    pub usage: BufferUsage,
    pub memory: BufferMemoryPreference,
}

impl Default for BufferDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            size: 0,
            usage: BufferUsage::STORAGE,
            memory: BufferMemoryPreference::HostVisible,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub label: Option<&'static str>,
    /// (width, height, depth_or_layers). For 2D: depth=1. For 2DArray: depth=array_layers.
    pub size: (u32, u32, u32),
    pub format: TextureFormat,
    pub usage: TextureUsage,
    pub dimension: TextureDimension,
    pub mip_level_count: u32,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            size: (1, 1, 1),
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::empty(),
            dimension: TextureDimension::D2,
            mip_level_count: 1,
        }
    }
}

/// Thread-group size and argument count shipped next to pre-compiled shader bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderMetadata {
    pub thread_group_size: [u32; 3],
    /// Number of 32-bit push constants the shader reads.
    pub push_constant_count: u32,
}

impl Default for ShaderMetadata {
    fn default() -> Self {
        Self {
            thread_group_size: [1, 1, 1],
            push_constant_count: 0,
        }
    }
}

/// Backend-native shader bytecode, already cross-compiled.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderStage {
    pub bytecode: Vec<u8>,
    pub entry_point: String,
    pub metadata: ShaderMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComputePipelineDescriptor {
    pub label: Option<&'static str>,
    pub shader: ShaderStage,
}

/// Descriptor for creating a graphics pipeline.
/// The pipeline's `color_targets` and `depth_stencil` formats must match the attachments
/// of the render pass it is used in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineDescriptor {
    pub label: Option<&'static str>,
    pub vertex_shader: ShaderStage,
    pub fragment_shader: Option<ShaderStage>,
    pub primitive_topology: PrimitiveTopology,
    pub rasterization: RasterizationState,
    pub color_targets: Vec<ColorTargetState>,
    pub depth_stencil: Option<DepthStencilState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    #[default]
    TriangleList,
    TriangleStrip,
    LineList,
    PointList,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RasterizationState {
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub polygon_mode: PolygonMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    None,
    #[default]
    Back,
    Front,
    FrontAndBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
    Point,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColorTargetState {
    pub format: TextureFormat,
    pub blend: Option<BlendState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub color: BlendComponent,
    pub alpha: BlendComponent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendComponent {
    pub src_factor: BlendFactor,
    pub dst_factor: BlendFactor,
    pub operation: BlendOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    One,
    Zero,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendOp {
    Add,
    Subtract,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub format: TextureFormat,
    pub depth_write_enabled: bool,
    pub depth_compare: CompareOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadOp {
    Load,
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Store,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl ClearColor {
    pub const BLACK: Self = Self {
        r: 0.0,
        g: 0.0,
        b: 0.0,
        a: 1.0,
    };
}

/// One color attachment of a render pass. The texture is transitioned to the render-target
/// state through the list's barrier engine before the pass begins.
#[derive(Debug, Clone, Copy)]
pub struct ColorAttachment {
    pub texture: ResourceHandle,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub clear_value: Option<ClearColor>,
}

#[derive(Debug, Clone, Default)]
pub struct RenderPassDescriptor {
    pub label: Option<&'static str>,
    pub color_attachments: Vec<ColorAttachment>,
}
