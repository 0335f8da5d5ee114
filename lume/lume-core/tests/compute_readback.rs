mod common;

use common::{kernel_stage, storage_buffer, Harness};
use lume_core::resource::shader_index;
use lume_core::software::SoftwareBackend;
use lume_core::{
    BackendKind, BarrierAccess, ComputePipelineDescriptor, DescriptorHandle, DescriptorUsage,
    DeviceOptions, PipelineHandle, QueueType, ResourceDescriptorInfo, ResourceHandle, RhiError,
    Severity,
};
use std::sync::{Arc, Condvar, Mutex};

const N: u32 = 100;

fn register_kernels(backend: &SoftwareBackend) {
    // push constants: [output descriptor, count]
    backend.register_kernel("fill_reverse", |inv| {
        let [id, _, _] = inv.thread_id();
        let (out, count) = (inv.push_constant(0), inv.push_constant(1));
        if id < count {
            inv.store_u32(out, id as usize, count - 1 - id);
        }
    });
    // push constants: [source descriptor, destination descriptor, count]
    backend.register_kernel("copy_u32", |inv| {
        let [id, _, _] = inv.thread_id();
        let (src, dst, count) = (inv.push_constant(0), inv.push_constant(1), inv.push_constant(2));
        if id < count {
            let value = inv.load_u32(src, id as usize);
            inv.store_u32(dst, id as usize, value);
        }
    });
}

fn pipelines(h: &Harness) -> (PipelineHandle, PipelineHandle) {
    let fill = h
        .device
        .compile_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("fill_reverse"),
            shader: kernel_stage("fill_reverse", [64, 1, 1], 2),
        })
        .unwrap();
    let copy = h
        .device
        .compile_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("copy_u32"),
            shader: kernel_stage("copy_u32", [64, 1, 1], 3),
        })
        .unwrap();
    (fill, copy)
}

fn descriptor(h: &Harness, resource: ResourceHandle, usage: DescriptorUsage) -> DescriptorHandle {
    h.device
        .create_resource_descriptor(ResourceDescriptorInfo { resource, usage })
        .unwrap()
}

#[test]
fn reversed_integers_reach_the_readback_buffer() {
    let h = Harness::new();
    register_kernels(&h.backend);
    let (fill, copy) = pipelines(&h);

    let data = h.device.create_buffer(&storage_buffer("data", N as u64 * 4)).unwrap();
    let readback = h
        .device
        .create_buffer(&storage_buffer("readback", N as u64 * 4))
        .unwrap();
    let data_write = descriptor(&h, data, DescriptorUsage::Write);
    let data_read = descriptor(&h, data, DescriptorUsage::Read);
    let readback_write = descriptor(&h, readback, DescriptorUsage::Write);

    let queue = h.device.create_command_queue(QueueType::Compute).unwrap();
    let mut list = queue.acquire_command_list().unwrap();
    list.barrier_descriptor(data_write).unwrap();
    list.set_pipeline(fill).unwrap();
    list.push_constants(0, &[shader_index(data_write), N]).unwrap();
    list.dispatch_threads([N, 1, 1]).unwrap();

    list.barrier_descriptor(data_read).unwrap();
    list.barrier_descriptor(readback_write).unwrap();
    list.set_pipeline(copy).unwrap();
    list.push_constants(0, &[shader_index(data_read), shader_index(readback_write), N])
        .unwrap();
    list.dispatch_threads([N, 1, 1]).unwrap();
    list.commit().unwrap();

    let fence = queue.execute_command_lists(vec![list], &[]).unwrap();
    h.device.wait_for_fence_on_cpu(fence).unwrap();
    assert!(h.device.is_fence_completed(fence));

    let values = h.device.read_buffer_pod::<u32>(readback, 0, N as usize).unwrap();
    let expected: Vec<u32> = (0..N).rev().collect();
    assert_eq!(values, expected);
    assert_eq!(h.backend.barrier_batches_touching(data), 2);
    let problems: Vec<_> = h
        .records()
        .into_iter()
        .filter(|r| r.severity >= Severity::Warning)
        .collect();
    assert!(problems.is_empty(), "{:?}", problems);
}

#[test]
fn read_after_write_emits_once() {
    let h = Harness::new();
    register_kernels(&h.backend);
    let (fill, _) = pipelines(&h);
    let data = h.device.create_buffer(&storage_buffer("data", 64)).unwrap();
    let write = descriptor(&h, data, DescriptorUsage::Write);
    let read = descriptor(&h, data, DescriptorUsage::Read);

    let queue = h.device.create_command_queue(QueueType::Compute).unwrap();
    let mut list = queue.acquire_command_list().unwrap();
    list.set_pipeline(fill).unwrap();
    list.barrier_descriptor(write).unwrap();
    list.dispatch(1, 1, 1).unwrap();
    h.backend.clear_barrier_log();

    list.barrier_descriptor(read).unwrap();
    list.dispatch(1, 1, 1).unwrap();
    let log = h.backend.barrier_log();
    assert_eq!(log.len(), 1);
    let item = log[0].buffers[0];
    assert_eq!(item.access_before, BarrierAccess::UNORDERED_ACCESS);
    assert_eq!(item.access_after, BarrierAccess::SHADER_RESOURCE);

    list.barrier_descriptor(read).unwrap();
    list.dispatch(1, 1, 1).unwrap();
    assert_eq!(h.backend.barrier_log().len(), 1);
    assert_eq!(list.barrier_engine().stats().elided, 1);
}

#[test]
fn copy_queue_waits_on_compute_fence() {
    let h = Harness::new();
    register_kernels(&h.backend);
    let (fill, _) = pipelines(&h);
    let data = h.device.create_buffer(&storage_buffer("data", N as u64 * 4)).unwrap();
    let readback = h
        .device
        .create_buffer(&storage_buffer("readback", N as u64 * 4))
        .unwrap();
    let write = descriptor(&h, data, DescriptorUsage::Write);

    let compute = h.device.create_command_queue(QueueType::Compute).unwrap();
    let copy = h.device.create_command_queue(QueueType::Copy).unwrap();

    let mut list = compute.acquire_command_list().unwrap();
    list.barrier_descriptor(write).unwrap();
    list.set_pipeline(fill).unwrap();
    list.push_constants(0, &[shader_index(write), N]).unwrap();
    list.dispatch_threads([N, 1, 1]).unwrap();
    list.commit().unwrap();
    let filled = compute.execute_command_lists(vec![list], &[]).unwrap();

    let mut list = copy.acquire_command_list().unwrap();
    list.copy_buffer(data, 0, readback, 0, N as u64 * 4).unwrap();
    list.commit().unwrap();
    let copied = copy.execute_command_lists(vec![list], &[filled]).unwrap();
    h.device.wait_for_fence_on_cpu(copied).unwrap();

    let values = h.device.read_buffer_pod::<u32>(readback, 0, N as usize).unwrap();
    assert_eq!(values[0], N - 1);
    assert_eq!(values[N as usize - 1], 0);
}

#[test]
fn copy_out_of_range_is_rejected() {
    let h = Harness::new();
    let a = h.device.create_buffer(&storage_buffer("a", 16)).unwrap();
    let b = h.device.create_buffer(&storage_buffer("b", 8)).unwrap();
    let queue = h.device.create_command_queue(QueueType::Copy).unwrap();
    let mut list = queue.acquire_command_list().unwrap();
    assert!(matches!(
        list.copy_buffer(a, 0, b, 0, 16),
        Err(RhiError::OutOfRange { size: 8, .. })
    ));
    assert_eq!(h.errors_from("copy_buffer"), 1);
    assert!(h.backend.barrier_log().is_empty());
}

#[test]
fn pipelines_are_cached_by_content() {
    let h = Harness::new();
    register_kernels(&h.backend);
    let (fill, _) = pipelines(&h);
    let again = h
        .device
        .compile_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("another label"),
            shader: kernel_stage("fill_reverse", [64, 1, 1], 2),
        })
        .unwrap();
    assert_eq!(fill, again);
    assert_eq!(h.device.pipeline_count(), 2);

    h.device.free_pipeline(fill, &[]).unwrap();
    assert_eq!(h.device.process_delete_queue(), 1);
    assert_eq!(h.device.pipeline_kind(fill), None);
    let rebuilt = h
        .device
        .compile_compute_pipeline(&ComputePipelineDescriptor {
            label: None,
            shader: kernel_stage("fill_reverse", [64, 1, 1], 2),
        })
        .unwrap();
    assert_ne!(rebuilt, fill);
}

#[test]
fn delete_queue_waits_for_fences() {
    let h = Harness::new();
    let gate = Arc::new((Mutex::new(false), Condvar::new()));
    let kernel_gate = Arc::clone(&gate);
    h.backend.register_kernel("blocked", move |_inv| {
        let (open, signal) = &*kernel_gate;
        let mut open = open.lock().unwrap();
        while !*open {
            open = signal.wait(open).unwrap();
        }
    });
    let blocked = h
        .device
        .compile_compute_pipeline(&ComputePipelineDescriptor {
            label: None,
            shader: kernel_stage("blocked", [1, 1, 1], 0),
        })
        .unwrap();
    let data = h.device.create_buffer(&storage_buffer("data", 16)).unwrap();
    let descriptor = descriptor(&h, data, DescriptorUsage::Read);

    let queue = h.device.create_command_queue(QueueType::Compute).unwrap();
    let mut list = queue.acquire_command_list().unwrap();
    list.set_pipeline(blocked).unwrap();
    list.dispatch(1, 1, 1).unwrap();
    list.commit().unwrap();
    let fence = queue.execute_command_lists(vec![list], &[]).unwrap();

    h.device.free_resource_descriptor(descriptor, &[fence]).unwrap();
    h.device.free_resource(data, &[fence]).unwrap();
    assert_eq!(h.device.process_delete_queue(), 0);
    assert!(h.device.is_resource_alive(data));
    assert_eq!(h.device.pending_delete_count(), 2);

    {
        let (open, signal) = &*gate;
        *open.lock().unwrap() = true;
        signal.notify_all();
    }
    h.device.wait_for_fence_on_cpu(fence).unwrap();
    assert_eq!(h.device.process_delete_queue(), 2);
    assert!(!h.device.is_resource_alive(data));
    assert!(h.device.descriptor(descriptor).is_none());
}

#[test]
fn pipeline_barrier_model_translates_batches() {
    let h = Harness::with(
        SoftwareBackend::emulating(BackendKind::Vulkan),
        DeviceOptions::default(),
    );
    register_kernels(&h.backend);
    let (fill, _) = pipelines(&h);
    let data = h.device.create_buffer(&storage_buffer("data", 64)).unwrap();
    let write = descriptor(&h, data, DescriptorUsage::Write);

    let queue = h.device.create_command_queue(QueueType::Compute).unwrap();
    let mut list = queue.acquire_command_list().unwrap();
    list.set_pipeline(fill).unwrap();
    list.barrier_descriptor(write).unwrap();
    list.dispatch(1, 1, 1).unwrap();
    list.barrier_descriptor(write).unwrap();
    list.dispatch(1, 1, 1).unwrap();

    let log = h.backend.barrier_log();
    assert_eq!(log.len(), 2, "write after write needs a barrier");
    assert!(log.iter().all(|b| b.native_count == 1));
}
