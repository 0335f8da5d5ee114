//! Compute readback on the software backend: one dispatch writes N integers in
//! reverse order, a second copies them into a readback buffer.
//! Run: RUST_LOG=lume=debug cargo run --bin compute_readback

use lume_core::resource::shader_index;
use lume_core::software::SoftwareBackend;
use lume_core::{
    BufferDescriptor, BufferUsage, ComputePipelineDescriptor, ContextOptions, DescriptorUsage,
    DeviceOptions, GraphicsContext, QueueType, ResourceDescriptorInfo, ShaderMetadata,
    ShaderStage,
};
use std::sync::Arc;

const N: u32 = 1024;

fn kernel(name: &str, push_constant_count: u32) -> ShaderStage {
    ShaderStage {
        bytecode: name.as_bytes().to_vec(),
        entry_point: "main".into(),
        metadata: ShaderMetadata {
            thread_group_size: [64, 1, 1],
            push_constant_count,
        },
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let backend = SoftwareBackend::new();
    backend.register_kernel("fill_reverse", |inv| {
        let [id, _, _] = inv.thread_id();
        let count = inv.push_constant(1);
        if id < count {
            inv.store_u32(inv.push_constant(0), id as usize, count - 1 - id);
        }
    });
    backend.register_kernel("copy_u32", |inv| {
        let [id, _, _] = inv.thread_id();
        if id < inv.push_constant(2) {
            let value = inv.load_u32(inv.push_constant(0), id as usize);
            inv.store_u32(inv.push_constant(1), id as usize, value);
        }
    });

    let context = GraphicsContext::new(ContextOptions::default());
    context.set_log_handler(|record| eprintln!("lume: {}", record));
    let device = context.create_device(Arc::new(backend.clone()), DeviceOptions::default())?;

    let buffer = |label| BufferDescriptor {
        label: Some(label),
        size: N as u64 * 4,
        usage: BufferUsage::STORAGE,
        ..Default::default()
    };
    let data = device.create_buffer(&buffer("data"))?;
    let readback = device.create_buffer(&buffer("readback"))?;
    let descriptor = |resource, usage| {
        device.create_resource_descriptor(ResourceDescriptorInfo { resource, usage })
    };
    let data_write = descriptor(data, DescriptorUsage::Write)?;
    let data_read = descriptor(data, DescriptorUsage::Read)?;
    let readback_write = descriptor(readback, DescriptorUsage::Write)?;

    let fill = device.compile_compute_pipeline(&ComputePipelineDescriptor {
        label: Some("fill_reverse"),
        shader: kernel("fill_reverse", 2),
    })?;
    let copy = device.compile_compute_pipeline(&ComputePipelineDescriptor {
        label: Some("copy_u32"),
        shader: kernel("copy_u32", 3),
    })?;

    let queue = device.create_command_queue(QueueType::Compute)?;
    let mut list = queue.acquire_command_list()?;
    list.barrier_descriptor(data_write)?;
    list.set_pipeline(fill)?;
    list.push_constants(0, &[shader_index(data_write), N])?;
    list.dispatch_threads([N, 1, 1])?;
    list.barrier_descriptor(data_read)?;
    list.barrier_descriptor(readback_write)?;
    list.set_pipeline(copy)?;
    list.push_constants(0, &[shader_index(data_read), shader_index(readback_write), N])?;
    list.dispatch_threads([N, 1, 1])?;
    list.commit()?;

    let fence = queue.execute_command_lists(vec![list], &[])?;
    device.wait_for_fence_on_cpu(fence)?;

    let values = device.read_buffer_pod::<u32>(readback, 0, N as usize)?;
    let correct = values.iter().copied().eq((0..N).rev());
    println!(
        "{} values read back ({}), first {:?}, {} barrier batches on the data buffer",
        values.len(),
        if correct { "correct" } else { "MISMATCH" },
        &values[..4],
        backend.barrier_batches_touching(data)
    );

    for d in [data_write, data_read, readback_write] {
        device.free_resource_descriptor(d, &[fence])?;
    }
    device.free_resource(data, &[fence])?;
    device.free_resource(readback, &[fence])?;
    let released = device.process_delete_queue();
    log::info!("released {} objects", released);

    if correct {
        Ok(())
    } else {
        Err("readback mismatch".into())
    }
}
