mod common;

use common::Harness;
use lume_core::software::SoftwareBackend;
use lume_core::{DeviceOptions, QueueType, RhiError, Severity};

fn small_pool(ring: usize, lists: usize) -> Harness {
    Harness::with(
        SoftwareBackend::new(),
        DeviceOptions {
            command_pool_ring_size: ring,
            command_lists_per_pool: lists,
            ..Default::default()
        },
    )
}

#[test]
fn second_acquire_before_execute_is_a_usage_error() {
    let h = Harness::new();
    let queue = h.device.create_command_queue(QueueType::Graphics).unwrap();

    let mut first = queue.acquire_command_list().unwrap();
    first.commit().unwrap();
    let mut second = queue.acquire_command_list().unwrap();
    assert_eq!(h.errors_from("acquire_command_list"), 1);

    second.commit().unwrap();
    let fence = queue.execute_command_lists(vec![first, second], &[]).unwrap();
    h.device.wait_for_fence_on_cpu(fence).unwrap();

    h.clear_records();
    let mut third = queue.acquire_command_list().unwrap();
    assert_eq!(h.errors_from("acquire_command_list"), 0);
    third.commit().unwrap();
}

#[test]
fn uncommitted_lists_are_not_executed() {
    let h = Harness::new();
    let queue = h.device.create_command_queue(QueueType::Compute).unwrap();
    let list = queue.acquire_command_list().unwrap();
    let result = queue.execute_command_lists(vec![list], &[]);
    assert!(matches!(result, Err(RhiError::Usage(_))));
    assert_eq!(h.errors_from("execute_command_lists"), 1);
    assert_eq!(queue.last_submitted_value(), 0);
    assert_eq!(h.backend.submission_count(), 0);
}

#[test]
fn double_commit_is_rejected() {
    let h = Harness::new();
    let queue = h.device.create_command_queue(QueueType::Compute).unwrap();
    let mut list = queue.acquire_command_list().unwrap();
    list.commit().unwrap();
    assert!(matches!(list.commit(), Err(RhiError::Usage(_))));
    assert!(matches!(list.flush_barriers(), Err(RhiError::Usage(_))));
}

#[test]
fn lists_from_another_queue_are_rejected() {
    let h = Harness::new();
    let compute = h.device.create_command_queue(QueueType::Compute).unwrap();
    let copy = h.device.create_command_queue(QueueType::Copy).unwrap();
    let mut list = compute.acquire_command_list().unwrap();
    list.commit().unwrap();
    assert!(matches!(
        copy.execute_command_lists(vec![list], &[]),
        Err(RhiError::Usage(_))
    ));
}

#[test]
fn fence_values_follow_submission_order() {
    let h = Harness::new();
    let queue = h.device.create_command_queue(QueueType::Compute).unwrap();
    let mut fences = Vec::new();
    for _ in 0..3 {
        let mut list = queue.acquire_command_list().unwrap();
        list.commit().unwrap();
        fences.push(queue.execute_command_lists(vec![list], &[]).unwrap());
    }
    let values: Vec<u64> = fences.iter().map(|f| f.value()).collect();
    assert_eq!(values, vec![1, 2, 3]);
    assert!(fences.iter().all(|f| f.queue() == queue.handle()));
    h.device.wait_for_fence_on_cpu(fences[2]).unwrap();
    assert!(fences.iter().all(|f| h.device.is_fence_completed(*f)));
    assert_eq!(queue.completed_value(), 3);
}

#[test]
fn cached_pool_item_is_reused_until_generation_changes() {
    let h = small_pool(2, 2);
    let queue = h.device.create_command_queue(QueueType::Compute).unwrap();
    for _ in 0..10 {
        let mut list = queue.acquire_command_list().unwrap();
        assert!(list.is_pooled());
        list.commit().unwrap();
        let fence = queue.execute_command_lists(vec![list], &[]).unwrap();
        h.device.wait_for_fence_on_cpu(fence).unwrap();
    }
    assert_eq!(h.backend.allocator_reset_count(), 1);

    h.device.reset_command_allocation();
    let list = queue.acquire_command_list().unwrap();
    assert!(list.is_pooled());
    assert_eq!(h.backend.allocator_reset_count(), 2);
}

#[test]
fn dropped_lists_return_to_their_pool_item() {
    let h = small_pool(1, 1);
    let queue = h.device.create_command_queue(QueueType::Compute).unwrap();
    for _ in 0..4 {
        let list = queue.acquire_command_list().unwrap();
        assert!(list.is_pooled());
        drop(list);
    }
    assert_eq!(h.backend.allocator_reset_count(), 1);
    assert_eq!(h.errors_from("acquire_command_list"), 0);
}

#[test]
fn exhausted_pool_falls_back_to_overflow_lists() {
    let h = small_pool(1, 1);
    let queue = h.device.create_command_queue(QueueType::Compute).unwrap();
    let first = queue.acquire_command_list().unwrap();
    let second = queue.acquire_command_list().unwrap();
    assert!(first.is_pooled());
    assert!(!second.is_pooled());
    let warnings = h
        .records()
        .iter()
        .filter(|r| r.severity == Severity::Warning && r.function == "acquire_command_list")
        .count();
    assert_eq!(warnings, 1);

    let other_thread = std::thread::scope(|s| {
        s.spawn(|| queue.acquire_command_list().map(|l| l.is_pooled()))
            .join()
            .unwrap()
    });
    assert!(matches!(other_thread, Ok(false)));
    drop((first, second));
}

#[test]
fn recycling_waits_for_the_pool_item_fence() {
    let h = small_pool(1, 2);
    let queue = h.device.create_command_queue(QueueType::Compute).unwrap();
    let mut list = queue.acquire_command_list().unwrap();
    list.commit().unwrap();
    let fence = queue.execute_command_lists(vec![list], &[]).unwrap();

    h.device.reset_command_allocation();
    let list = queue.acquire_command_list().unwrap();
    assert!(list.is_pooled());
    assert!(h.device.is_fence_completed(fence));
    assert_eq!(h.backend.allocator_reset_count(), 2);
}

#[test]
fn threads_keep_separate_pool_items() {
    let h = small_pool(4, 2);
    let queue = h.device.create_command_queue(QueueType::Compute).unwrap();
    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..8 {
                    let mut list = queue.acquire_command_list().unwrap();
                    list.commit().unwrap();
                    let fence = queue.execute_command_lists(vec![list], &[]).unwrap();
                    h.device.wait_for_fence_on_cpu(fence).unwrap();
                }
            });
        }
    });
    assert_eq!(queue.last_submitted_value(), 32);
    assert_eq!(h.errors_from("acquire_command_list"), 0);
    queue.wait_idle();
    assert_eq!(queue.completed_value(), 32);
}

#[test]
fn dropped_queues_give_their_scratch_back_to_the_device_arena() {
    let h = Harness::new();
    let mut used_after_first = None;
    for _ in 0..32 {
        let queue = h.device.create_command_queue(QueueType::Compute).unwrap();
        let mut list = queue.acquire_command_list().unwrap();
        assert!(list.is_pooled());
        list.commit().unwrap();
        let fence = queue.execute_command_lists(vec![list], &[]).unwrap();
        h.device.wait_for_fence_on_cpu(fence).unwrap();
        drop(queue);
        let used = h.device.arena().used_bytes();
        assert_eq!(*used_after_first.get_or_insert(used), used);
    }
    assert_eq!(h.device.queue_count(), 0);
    assert_eq!(h.errors_from("acquire_command_list"), 0);
}

#[test]
fn idle_thread_entries_are_dropped_after_a_frame_boundary() {
    let h = Harness::new();
    let queue = h.device.create_command_queue(QueueType::Compute).unwrap();
    std::thread::scope(|s| {
        for _ in 0..16 {
            s.spawn(|| {
                let mut list = queue.acquire_command_list().unwrap();
                list.commit().unwrap();
                let fence = queue.execute_command_lists(vec![list], &[]).unwrap();
                h.device.wait_for_fence_on_cpu(fence).unwrap();
            });
        }
    });
    assert_eq!(queue.cached_thread_count(), 16);

    h.device.reset_command_allocation();
    let mut first = queue.acquire_command_list().unwrap();
    assert_eq!(queue.cached_thread_count(), 1);

    first.commit().unwrap();
    let _second = queue.acquire_command_list().unwrap();
    assert_eq!(h.errors_from("acquire_command_list"), 1);
}
