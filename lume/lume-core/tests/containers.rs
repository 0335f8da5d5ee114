use lume_core::{
    ConcurrentDictionary, DictionaryConfig, DictionaryGrowth, Handle, HandlePool, MemoryArena,
};
use std::sync::Arc;

const THREADS: u32 = 8;
const PER_THREAD: u32 = 500;

fn fill_concurrently(dictionary: &Arc<ConcurrentDictionary<u32, u32>>) {
    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let dictionary = Arc::clone(dictionary);
            std::thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let key = t * PER_THREAD + i;
                    assert!(dictionary.add(key, key * 2));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn disjoint_concurrent_adds_are_all_visible() {
    let dictionary = Arc::new(ConcurrentDictionary::new((THREADS * PER_THREAD) as usize));
    fill_concurrently(&dictionary);
    let total = (THREADS * PER_THREAD) as usize;
    assert_eq!(dictionary.len(), total);
    assert!((0..THREADS * PER_THREAD).all(|k| dictionary.contains_key(&k)));
    assert_eq!(dictionary.enumerate().count(), total);
    assert_eq!(dictionary.get(&7), Some(14));
}

#[test]
fn concurrent_adds_survive_rehashing() {
    let dictionary = Arc::new(ConcurrentDictionary::with_config(
        "growing",
        DictionaryConfig {
            capacity: 16,
            growth: DictionaryGrowth::Rehash {
                max_capacity: 1 << 14,
            },
        },
    ));
    fill_concurrently(&dictionary);
    let mut values: Vec<u32> = dictionary.enumerate().collect();
    values.sort_unstable();
    let expected: Vec<u32> = (0..THREADS * PER_THREAD).map(|k| k * 2).collect();
    assert_eq!(values, expected);
    assert!(dictionary.capacity() >= (THREADS * PER_THREAD) as usize);
}

#[test]
fn concurrent_removes_and_adds_of_one_key_stay_consistent() {
    let dictionary = Arc::new(ConcurrentDictionary::<u32, u32>::new(4));
    let workers: Vec<_> = (0..4)
        .map(|t| {
            let dictionary = Arc::clone(&dictionary);
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    dictionary.add(1, t);
                    dictionary.remove(&1);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(dictionary.len() <= 1);
    assert_eq!(dictionary.enumerate().count(), dictionary.len());
}

#[test]
fn capacity_one_pool_reuses_its_slot() {
    let mut pool: HandlePool<&str> = HandlePool::new(1);
    let first = pool.add("first");
    assert_eq!(pool.remove(first), Some("first"));
    let second = pool.add("second");
    assert!(!second.is_null());
    assert_eq!(second.index(), first.index());
    assert_eq!(second.generation(), first.generation() + 1);
    assert_eq!(pool.get(first), None);
    assert_eq!(pool.get(second), Some(&"second"));
    assert_eq!(pool.add("third"), Handle::NULL);
}

#[test]
fn child_arenas_carved_from_threads_do_not_overlap() {
    let root = Arc::new(MemoryArena::with_capacity(1 << 20).unwrap());
    let workers: Vec<_> = (0..4u8)
        .map(|t| {
            let root = Arc::clone(&root);
            std::thread::spawn(move || {
                let child = root.carve_stack_arena(4096).unwrap();
                let scope = child.scope();
                let bytes = scope.alloc_slice_copy(&[t; 256]).unwrap();
                assert!(bytes.iter().all(|b| *b == t));
                bytes.as_ptr() as usize
            })
        })
        .collect();
    let mut starts: Vec<usize> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    starts.sort_unstable();
    assert!(starts.windows(2).all(|w| w[1] - w[0] >= 4096));
    assert!(root.allocated_bytes() >= 4 * 4096);
}
