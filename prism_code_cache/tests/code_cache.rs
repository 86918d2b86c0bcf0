use parking_lot::Mutex;
use prism_code_cache::config::KB;
use prism_code_cache::{
    Checkpoint, CodeCache, CodeCacheConfig, CollectionOutcome, CompiledCode, FrameInfo,
    JitMethod, MethodRef, MethodSlot, OwnerId, StackWalker, ThreadList,
};
use std::collections::HashSet;
use std::sync::Arc;

const BRIDGE: usize = 0x7777_0000;

/// A single simulated thread whose stack holds a fixed set of return addresses.
struct FakeStack {
    pcs: Mutex<Vec<usize>>,
}

impl FakeStack {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            pcs: Mutex::new(Vec::new()),
        })
    }

    fn push(&self, pc: usize) {
        self.pcs.lock().push(pc);
    }
}

impl StackWalker for FakeStack {
    fn walk_stack(&self, visitor: &mut dyn FnMut(usize)) {
        for &pc in self.pcs.lock().iter() {
            visitor(pc);
        }
    }
}

impl ThreadList for FakeStack {
    fn run_checkpoint(&self, checkpoint: Arc<dyn Checkpoint>) -> usize {
        checkpoint.run(self);
        1
    }
}

fn create(config: CodeCacheConfig) -> (CodeCache, Arc<FakeStack>) {
    let stack = FakeStack::new();
    let cache = CodeCache::create(config, BRIDGE, stack.clone()).expect("create cache");
    (cache, stack)
}

fn new_method(id: u64) -> (Arc<MethodSlot>, MethodRef) {
    let slot = Arc::new(MethodSlot::new(id, OwnerId(id / 100), BRIDGE));
    (slot.clone(), slot)
}

/// Distinct, recognizable machine code for each method.
fn code_for(id: u64, len: usize) -> Vec<u8> {
    (0..len).map(|i| (id as usize + i) as u8).collect()
}

fn assert_capacity_invariant(cache: &CodeCache) {
    let used = cache.code_cache_size() + cache.data_cache_size();
    let capacity = cache.current_capacity();
    assert!(used <= capacity, "{used} bytes used over capacity {capacity}");
    assert!(capacity <= cache.max_capacity());
}

#[test]
fn test_unreferenced_code_is_collected() {
    let (cache, _stack) = create(CodeCacheConfig::for_testing());
    let baseline = cache.code_cache_size();

    let slots: Vec<_> = (0..10)
        .map(|id| {
            let (slot, method) = new_method(id);
            cache
                .commit(&method, &CompiledCode::new(&code_for(id, 24)))
                .expect("commit");
            slot
        })
        .collect();
    assert_eq!(cache.number_of_compiled_code(), 10);
    assert!(cache.code_cache_size() > baseline);

    let outcome = cache.collect();

    assert_eq!(outcome, CollectionOutcome::Swept { freed: 10, kept: 0 });
    assert_eq!(cache.number_of_compiled_code(), 0);
    assert_eq!(cache.code_cache_size(), baseline);
    for slot in &slots {
        assert_eq!(slot.entry_point(), BRIDGE);
    }
}

#[test]
fn test_code_on_stack_is_kept_and_restored() {
    let (cache, stack) = create(CodeCacheConfig::for_testing());
    let (slot, method) = new_method(1);
    let header = cache
        .commit(&method, &CompiledCode::new(&code_for(1, 32)))
        .expect("commit");
    let code = header.code_ptr() as usize;
    stack.push(code + 8);

    cache.collect();

    assert!(cache.contains_method(&*slot));
    assert_eq!(slot.entry_point(), code);
    let found = cache.lookup_header(code + 8, Some(&*slot as &dyn JitMethod));
    assert_eq!(found.map(|h| h.code_ptr() as usize), Some(code));
}

#[test]
fn test_only_stack_referenced_code_survives() {
    let (cache, stack) = create(CodeCacheConfig::for_testing());
    let mut committed = Vec::new();
    for id in 0..20 {
        let (slot, method) = new_method(id);
        let header = cache
            .commit(&method, &CompiledCode::new(&code_for(id, 16)))
            .expect("commit");
        committed.push((slot, header.code_ptr() as usize));
    }
    let live: HashSet<u64> = [3, 7, 11, 19].into_iter().collect();
    for (slot, code) in &committed {
        if live.contains(&slot.id()) {
            // Return address at the inclusive end of the method.
            stack.push(code + 16);
        }
    }

    cache.collect();

    for (slot, code) in &committed {
        if live.contains(&slot.id()) {
            assert!(cache.contains_method(&**slot), "method {} was freed", slot.id());
            assert_eq!(slot.entry_point(), *code);
            let bytes = unsafe { std::slice::from_raw_parts(*code as *const u8, 16) };
            assert_eq!(bytes, &code_for(slot.id(), 16)[..]);
        } else {
            assert!(!cache.contains_method(&**slot));
            assert_eq!(slot.entry_point(), BRIDGE);
        }
    }
    assert_eq!(cache.number_of_compiled_code(), live.len());
}

#[test]
fn test_commit_retries_once_then_gives_up() {
    let (cache, stack) = create(CodeCacheConfig::for_testing());
    let code = code_for(0, 1000);

    // Keep everything on the stack so sweeping cannot free anything.
    let mut id = 0;
    loop {
        let (_, method) = new_method(id);
        let before = cache.stats().collections;
        match cache.commit(&method, &CompiledCode::new(&code)) {
            Some(header) => stack.push(header.code_ptr() as usize),
            None => {
                assert_eq!(cache.stats().collections, before + 1);
                break;
            }
        }
        assert_capacity_invariant(&cache);
        id += 1;
        assert!(id < 1000, "commit never reported exhaustion");
    }

    // Exhaustion is stable: the next attempt also collects exactly once.
    let (slot, method) = new_method(id + 1);
    let before = cache.stats().collections;
    assert!(cache.commit(&method, &CompiledCode::new(&code)).is_none());
    assert_eq!(cache.stats().collections, before + 1);
    assert_eq!(slot.entry_point(), BRIDGE);
    assert_eq!(cache.number_of_compiled_code(), id as usize);
}

#[test]
fn test_reserve_data_retries_once_then_gives_up() {
    let (cache, _stack) = create(CodeCacheConfig::for_testing());
    // Unattached reservations are not reclaimed by sweeping.
    let held = cache.reserve_data(20 * KB).expect("first reservation");
    let before = cache.stats();

    assert!(cache.reserve_data(20 * KB).is_none());

    let after = cache.stats();
    assert_eq!(after.collections, before.collections + 1);
    assert_eq!(after.data_failures, before.data_failures + 2);
    assert!(cache.reserve_data(64).is_some());

    cache.clear_data(held);
    assert!(cache.reserve_data(20 * KB).is_some());
}

#[test]
fn test_no_two_entries_share_a_start_address() {
    let (cache, stack) = create(CodeCacheConfig::for_testing());
    let mut live_codes = Vec::new();

    for round in 0..3u64 {
        for i in 0..30 {
            let id = round * 100 + i;
            let (_, method) = new_method(id);
            let header = cache
                .commit(&method, &CompiledCode::new(&code_for(id, 40)))
                .expect("commit");
            if i % 10 == 0 {
                stack.push(header.code_ptr() as usize);
                live_codes.push(header.code_ptr() as usize);
            }
        }
        cache.collect();
    }

    let unique: HashSet<usize> = live_codes.iter().copied().collect();
    assert_eq!(unique.len(), live_codes.len());
    for code in &live_codes {
        let header = cache.lookup_header(*code, None).expect("live entry");
        assert_eq!(header.code_ptr() as usize, *code);
    }
    assert_eq!(cache.number_of_compiled_code(), live_codes.len());
}

#[test]
fn test_first_cycle_grows_then_sweeps_at_max() {
    let config = CodeCacheConfig {
        initial_capacity: 64 * KB,
        max_capacity: 128 * KB,
    };
    let (cache, _stack) = create(config);
    let (slot, method) = new_method(1);
    let header = cache
        .commit(&method, &CompiledCode::new(&code_for(1, 8)))
        .expect("commit");
    assert!(!cache.has_done_one_collection());

    assert_eq!(cache.collect(), CollectionOutcome::Grew { capacity: 128 * KB });
    assert_eq!(cache.current_capacity(), 128 * KB);
    // Growth leaves methods and entry points alone.
    assert_eq!(slot.entry_point(), header.code_ptr() as usize);

    assert!(matches!(cache.collect(), CollectionOutcome::Swept { .. }));
    assert!(cache.has_done_one_collection());
    assert_eq!(slot.entry_point(), BRIDGE);
}

#[test]
fn test_pressure_grows_capacity() {
    let config = CodeCacheConfig {
        initial_capacity: 64 * KB,
        max_capacity: 256 * KB,
    };
    let (cache, stack) = create(config);
    let code = code_for(0, 2000);

    // Twenty live entries overflow the initial 32KB code half once.
    for id in 0..20 {
        let (_, method) = new_method(id);
        let header = cache
            .commit(&method, &CompiledCode::new(&code))
            .expect("commit");
        stack.push(header.code_ptr() as usize);
        assert_capacity_invariant(&cache);
    }
    assert_eq!(cache.current_capacity(), 128 * KB);
    assert_eq!(cache.stats().growths, 1);
    assert_eq!(cache.stats().collections, 0);
}

#[test]
fn test_profiling_attach_is_idempotent() {
    let (cache, _stack) = create(CodeCacheConfig::for_testing());
    let (slot, method) = new_method(5);

    let first = cache.add_profiling_info(&method, &[0, 6, 14]).expect("record");
    // SAFETY: attached to `slot` and no collection has run.
    (unsafe { first.entries() })[1].add_class(0x40);
    let second = cache.add_profiling_info(&method, &[0, 6, 14]).expect("record");

    assert_eq!(first, second);
    assert_eq!(slot.profiling_record(), Some(first.as_ptr()));
    unsafe {
        assert_eq!(second.method(), 5);
        assert_eq!(second.inline_cache(6).map(|c| c.is_monomorphic()), Some(true));
    }

    cache.collect();
    assert!(slot.profiling_record().is_none());
    let third = cache.add_profiling_info(&method, &[2]).expect("record");
    assert_eq!(unsafe { third.entries() }.len(), 1);
}

#[test]
fn test_unloading_an_owner() {
    let (cache, _stack) = create(CodeCacheConfig::for_testing());
    let mut slots = Vec::new();
    for id in [1, 2, 101, 102, 103] {
        let (slot, method) = new_method(id);
        cache
            .commit(&method, &CompiledCode::new(&code_for(id, 12)))
            .expect("commit");
        cache.add_profiling_info(&method, &[0]).expect("record");
        slots.push(slot);
    }
    assert_eq!(cache.compiled_methods_owned_by(OwnerId(1)).len(), 3);

    cache.remove_methods_owned_by(OwnerId(1));

    assert_eq!(cache.number_of_compiled_code(), 2);
    assert_eq!(cache.number_of_profiling_records(), 2);
    for slot in &slots {
        let kept = slot.owner() == OwnerId(0);
        assert_eq!(cache.contains_method(&**slot), kept);
        assert_eq!(slot.profiling_record().is_some(), kept);
    }
}

#[test]
fn test_tables_follow_their_entry() {
    let (cache, _stack) = create(CodeCacheConfig::for_testing());
    let (_, method) = new_method(9);
    let mapping = cache.add_data_array(&[9; 20]).expect("mapping");
    let vmap = cache.add_data_array(&[8; 12]).expect("vmap");
    let gc_map = cache.add_data_array(&[7; 4]).expect("gc map");
    let data_in_use = cache.data_cache_size();

    let code = code_for(9, 20);
    let compiled = CompiledCode::new(&code)
        .with_mapping_table(mapping)
        .with_vmap_table(vmap)
        .with_gc_map(gc_map)
        .with_frame_info(FrameInfo::new(48, 0b1010, 0));
    let view = cache.commit(&method, &compiled).expect("commit");
    let header = unsafe { view.get() };
    assert_eq!(header.mapping_table(), Some(mapping));
    assert_eq!(header.vmap_table(), Some(vmap));
    assert_eq!(header.gc_map(), Some(gc_map));
    assert_eq!(cache.data_cache_size(), data_in_use);

    cache.collect();
    assert_eq!(cache.data_cache_size(), 0);
}

#[test]
fn test_contains_address_is_a_range_check() {
    let (cache, _stack) = create(CodeCacheConfig::for_testing());
    let (_, method) = new_method(1);
    let header = cache
        .commit(&method, &CompiledCode::new(&code_for(1, 4)))
        .expect("commit");
    let code = header.code_ptr() as usize;

    assert!(cache.contains_address(code));
    // Unallocated but inside the code half.
    assert!(cache.contains_address(code + 4096));
    assert!(cache.lookup_header(code + 4096, None).is_none());
    assert!(!cache.contains_address(0));
    let data = cache.reserve_data(8).expect("data");
    assert!(!cache.contains_address(data.as_ptr() as usize));
}

#[test]
fn test_last_update_time_tracks_commits() {
    let (cache, _stack) = create(CodeCacheConfig::for_testing());
    assert_eq!(cache.last_update_time_ns(), 0);

    let (_, first) = new_method(1);
    cache.commit(&first, &CompiledCode::new(&[0x90])).expect("commit");
    let t1 = cache.last_update_time_ns();
    assert!(t1 > 0);

    let (_, second) = new_method(2);
    cache.commit(&second, &CompiledCode::new(&[0x90])).expect("commit");
    assert!(cache.last_update_time_ns() >= t1);
}

#[test]
fn test_dump_info_mentions_sizes() {
    let (cache, _stack) = create(CodeCacheConfig::for_testing());
    let (_, method) = new_method(1);
    cache
        .commit(&method, &CompiledCode::new(&code_for(1, 100)))
        .expect("commit");
    let text = cache.dump_info().to_string();
    assert!(text.contains("Code cache size="), "{text}");
    assert!(text.contains("Number of compiled code=1"), "{text}");
}
