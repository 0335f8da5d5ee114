//! Clears a render target and runs a vertex kernel over a small draw, on a software
//! backend emulating each barrier model in turn.
//! Run: RUST_LOG=lume=trace cargo run --bin clear_and_draw

use lume_core::resource::shader_index;
use lume_core::software::{SoftwareBackend, SoftwareTexture};
use lume_core::{
    BackendKind, BufferDescriptor, BufferUsage, ClearColor, ColorAttachment, ColorTargetState,
    ContextOptions, DescriptorUsage, DeviceOptions, GraphicsContext, GraphicsPipelineDescriptor,
    LoadOp, QueueType, RenderPassDescriptor, ResourceDescriptorInfo, ShaderMetadata, ShaderStage,
    StoreOp, TextureDescriptor, TextureFormat, TextureUsage,
};
use std::sync::Arc;

const VERTICES: u32 = 3;
const INSTANCES: u32 = 2;

fn run(context: &GraphicsContext, kind: BackendKind) -> Result<(), Box<dyn std::error::Error>> {
    let backend = SoftwareBackend::emulating(kind);
    backend.register_kernel("count_vertices", |inv| {
        let [vertex, instance, _] = inv.thread_id();
        let out = inv.push_constant(0);
        let slot = (instance * inv.push_constant(1) + vertex) as usize;
        inv.store_u32(out, slot, vertex);
    });
    let device = context.create_device(
        Arc::new(backend.clone()),
        DeviceOptions {
            label: Some("clear_and_draw"),
            ..Default::default()
        },
    )?;

    let target = device.create_texture(&TextureDescriptor {
        label: Some("target"),
        size: (8, 8, 1),
        format: TextureFormat::Bgra8Unorm,
        usage: TextureUsage::RENDER_ATTACHMENT,
        ..Default::default()
    })?;
    let counts = device.create_buffer(&BufferDescriptor {
        label: Some("counts"),
        size: (VERTICES * INSTANCES) as u64 * 4,
        usage: BufferUsage::STORAGE,
        ..Default::default()
    })?;
    let counts_write = device.create_resource_descriptor(ResourceDescriptorInfo {
        resource: counts,
        usage: DescriptorUsage::Write,
    })?;
    let pipeline = device.compile_graphics_pipeline(&GraphicsPipelineDescriptor {
        label: Some("count"),
        vertex_shader: ShaderStage {
            bytecode: b"count_vertices".to_vec(),
            entry_point: "main".into(),
            metadata: ShaderMetadata {
                thread_group_size: [1, 1, 1],
                push_constant_count: 2,
            },
        },
        fragment_shader: None,
        primitive_topology: Default::default(),
        rasterization: Default::default(),
        color_targets: vec![ColorTargetState {
            format: TextureFormat::Bgra8Unorm,
            blend: None,
        }],
        depth_stencil: None,
    })?;

    let queue = device.create_command_queue(QueueType::Graphics)?;
    let mut list = queue.acquire_command_list()?;
    list.begin_render_pass(&RenderPassDescriptor {
        label: Some("main"),
        color_attachments: vec![ColorAttachment {
            texture: target,
            load_op: LoadOp::Clear,
            store_op: StoreOp::Store,
            clear_value: Some(ClearColor {
                r: 0.2,
                g: 0.4,
                b: 0.8,
                a: 1.0,
            }),
        }],
    })?;
    list.set_pipeline(pipeline)?;
    list.barrier_descriptor(counts_write)?;
    list.push_constants(0, &[shader_index(counts_write), VERTICES])?;
    list.draw(VERTICES, INSTANCES, 0, 0)?;
    list.end_render_pass()?;
    list.commit()?;
    let fence = queue.execute_command_lists(vec![list], &[])?;
    device.wait_for_fence_on_cpu(fence)?;

    let texel = device
        .native_resource(target)
        .and_then(|native| {
            native
                .as_any()
                .downcast_ref::<SoftwareTexture>()
                .map(|t| t.texels()[..4].to_vec())
        })
        .unwrap_or_default();
    let counts = device.read_buffer_pod::<u32>(counts, 0, (VERTICES * INSTANCES) as usize)?;
    println!("{:?}: first texel {:?}, vertex ids {:?}", kind, texel, counts);
    for batch in backend.barrier_log() {
        println!(
            "  {:?} batch: {} buffer, {} texture transitions -> {} native",
            batch.model,
            batch.buffers.len(),
            batch.textures.len(),
            batch.native_count
        );
    }
    context.destroy_device(device.id());
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let context = GraphicsContext::new(ContextOptions::default());
    context.set_log_handler(|record| eprintln!("lume: {}", record));
    for kind in [BackendKind::Vulkan, BackendKind::Direct3D12, BackendKind::Metal] {
        run(&context, kind)?;
    }
    Ok(())
}
