use std::path::PathBuf;
use std::sync::Mutex;

use lazy_static::lazy_static;

use pmalloc::descriptor::HEADER_SIZE;
use pmalloc::region::SBSIZE;
use pmalloc::{register_filter, AllocError, Allocator, AttachKind, FILTER_CONSERVATIVE};

lazy_static! {
    // the Region maps at a fixed Address, so attached Tests are exclusive
    static ref REGION: Mutex<()> = Mutex::new(());
}

fn region_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("pmalloc-{}-{}", name, std::process::id()));
    path
}

fn remove_region(path: &PathBuf) {
    for section in ["meta", "desc", "sb"].iter() {
        let _ = std::fs::remove_file(format!("{}_{}", path.display(), section));
    }
}

#[test]
fn root_survives_detach_attach() {
    let _guard = REGION.lock().unwrap_or_else(|e| e.into_inner());
    let path = region_path("root-round-trip");
    remove_region(&path);

    let (allocator, kind) = Allocator::attach(&path, 1).unwrap();
    assert_eq!(AttachKind::Fresh, kind);

    let ptr = allocator.allocate(64).unwrap().as_ptr();
    for i in 0..64 {
        unsafe { ptr.add(i).write(i as u8 ^ 0x5a) };
    }
    allocator.set_root(0, ptr, FILTER_CONSERVATIVE).unwrap();
    allocator.detach();

    let (allocator, kind) = Allocator::attach(&path, 1).unwrap();
    assert_eq!(AttachKind::Resumed, kind);

    let recovered = allocator.get_root(0).unwrap();
    assert_eq!(ptr, recovered);
    for i in 0..64 {
        assert_eq!(i as u8 ^ 0x5a, unsafe { recovered.add(i).read() });
    }

    allocator.detach();
    remove_region(&path);
}

#[test]
fn attach_detach_is_identity_without_allocations() {
    let _guard = REGION.lock().unwrap_or_else(|e| e.into_inner());
    let path = region_path("identity");
    remove_region(&path);

    let (allocator, kind) = Allocator::attach(&path, 1).unwrap();
    assert_eq!(AttachKind::Fresh, kind);
    allocator.detach();

    let (allocator, kind) = Allocator::attach(&path, 1).unwrap();
    assert_eq!(AttachKind::Resumed, kind);
    for index in 0..8 {
        assert_eq!(std::ptr::null_mut(), allocator.get_root(index).unwrap());
    }

    let ptr = allocator.allocate(32).unwrap();
    allocator.free(ptr.as_ptr());

    allocator.detach();
    remove_region(&path);
}

#[test]
fn large_sentinels_survive_restart() {
    let _guard = REGION.lock().unwrap_or_else(|e| e.into_inner());
    let path = region_path("large-sentinels");
    remove_region(&path);

    const SIZE: usize = 1_000_000;

    let (allocator, _) = Allocator::attach(&path, 1).unwrap();

    let mut blocks = Vec::new();
    for i in 0..10_u8 {
        let ptr = allocator.allocate(SIZE).unwrap().as_ptr();
        unsafe {
            ptr.write(i);
            ptr.add(SIZE - 1).write(i ^ 0xff);
        }
        blocks.push(ptr);
    }

    // free every second Block, anchor the others as Roots
    for (i, &ptr) in blocks.iter().enumerate() {
        if i % 2 == 0 {
            allocator.set_root(i / 2, ptr, FILTER_CONSERVATIVE).unwrap();
        } else {
            allocator.free(ptr);
        }
    }
    allocator.detach();

    let (allocator, kind) = Allocator::attach(&path, 1).unwrap();
    assert_eq!(AttachKind::Resumed, kind);

    for i in (0..10_u8).step_by(2) {
        let ptr = allocator.get_root(i as usize / 2).unwrap();
        assert_eq!(blocks[i as usize], ptr);
        unsafe {
            assert_eq!(i, ptr.read());
            assert_eq!(i ^ 0xff, ptr.add(SIZE - 1).read());
        }
    }

    allocator.detach();
    remove_region(&path);
}

#[test]
fn linked_list_reachable_through_root() {
    let _guard = REGION.lock().unwrap_or_else(|e| e.into_inner());
    let path = region_path("linked-list");
    remove_region(&path);

    const NODES: usize = 100;

    let (allocator, _) = Allocator::attach(&path, 1).unwrap();

    // a Node is (next: u64, value: u64), linked head to tail
    let mut nodes = Vec::new();
    let mut next: u64 = 0;
    for value in (0..NODES as u64).rev() {
        let node = allocator.allocate(16).unwrap().as_ptr() as *mut u64;
        unsafe {
            node.write(next);
            node.add(1).write(value);
        }
        next = node as u64;
        nodes.push(node as usize);
    }
    let head = next as *mut u8;

    allocator.set_root(0, head, FILTER_CONSERVATIVE).unwrap();
    allocator.detach();

    let (allocator, kind) = Allocator::attach(&path, 1).unwrap();
    assert_eq!(AttachKind::Resumed, kind);

    let mut current = allocator.get_root(0).unwrap() as *const u64;
    let mut expected_addrs = nodes.iter().rev();
    for value in 0..NODES as u64 {
        assert_eq!(
            *expected_addrs
                .next()
                .expect("The List was built with exactly NODES entries"),
            current as usize
        );
        unsafe {
            assert_eq!(value, current.add(1).read());
            current = current.read() as *const u64;
        }
    }
    assert!(current.is_null());

    allocator.detach();
    remove_region(&path);
}

#[test]
fn unreachable_blocks_are_reclaimed() {
    let _guard = REGION.lock().unwrap_or_else(|e| e.into_inner());
    let path = region_path("reclaim");
    remove_region(&path);

    let (allocator, _) = Allocator::attach_with(&path, 1, 64 * SBSIZE).unwrap();

    // allocate without any Root and "crash" by detaching with everything
    // still in flight
    for _ in 0..32 {
        allocator.allocate(SBSIZE - HEADER_SIZE).unwrap();
    }
    for _ in 0..1000 {
        allocator.allocate(64).unwrap();
    }
    allocator.detach();

    let (allocator, kind) = Allocator::attach_with(&path, 1, 64 * SBSIZE).unwrap();
    assert_eq!(AttachKind::Resumed, kind);

    // everything was unreachable, so the full Capacity is back
    let mut capacity = 0;
    while allocator.allocate(SBSIZE - HEADER_SIZE).is_ok() {
        capacity += 1;
    }
    assert_eq!(64, capacity);

    allocator.detach();
    remove_region(&path);
}

#[test]
fn reachable_blocks_keep_their_size_class() {
    let _guard = REGION.lock().unwrap_or_else(|e| e.into_inner());
    let path = region_path("mixed-recovery");
    remove_region(&path);

    let (allocator, _) = Allocator::attach_with(&path, 1, 64 * SBSIZE).unwrap();

    // two live Blocks in the same Superblock, the rest of it dies
    let keep_a = allocator.allocate(100).unwrap().as_ptr();
    let keep_b = allocator.allocate(100).unwrap().as_ptr();
    for _ in 0..50 {
        allocator.allocate(100).unwrap();
    }
    unsafe {
        keep_a.write(0x11);
        keep_b.write(0x22);
    }
    allocator.set_root(0, keep_a, FILTER_CONSERVATIVE).unwrap();
    allocator.set_root(1, keep_b, FILTER_CONSERVATIVE).unwrap();
    allocator.detach();

    let (allocator, kind) = Allocator::attach_with(&path, 1, 64 * SBSIZE).unwrap();
    assert_eq!(AttachKind::Resumed, kind);

    let keep_a = allocator.get_root(0).unwrap();
    let keep_b = allocator.get_root(1).unwrap();
    assert_eq!(0x11, unsafe { keep_a.read() });
    assert_eq!(0x22, unsafe { keep_b.read() });

    // the recovered Blocks are still valid Allocations: the Slots around
    // them get handed out again without clobbering them
    let mut fresh = Vec::new();
    for _ in 0..50 {
        let ptr = allocator.allocate(100).unwrap().as_ptr();
        assert_ne!(keep_a, ptr);
        assert_ne!(keep_b, ptr);
        fresh.push(ptr);
    }
    assert_eq!(0x11, unsafe { keep_a.read() });
    assert_eq!(0x22, unsafe { keep_b.read() });

    allocator.free(keep_a);
    allocator.free(keep_b);
    for ptr in fresh {
        allocator.free(ptr);
    }

    allocator.detach();
    remove_region(&path);
}

#[test]
fn typed_filter_limits_the_scan() {
    let _guard = REGION.lock().unwrap_or_else(|e| e.into_inner());
    let path = region_path("typed-filter");
    remove_region(&path);

    // only the first Payload-Word of the Root-Block is a Pointer, the rest
    // is Data that must not keep anything alive
    fn head_only(block: *const u8, _size: usize, sink: &mut dyn FnMut(usize)) {
        let next = unsafe { (block.add(HEADER_SIZE) as *const u64).read() };
        sink(next as usize);
    }
    register_filter(1, head_only).unwrap();

    let (allocator, _) = Allocator::attach_with(&path, 1, 64 * SBSIZE).unwrap();

    let child = allocator.allocate(64).unwrap().as_ptr();
    unsafe { child.write(0x77) };

    let root = allocator.allocate(32).unwrap().as_ptr();
    unsafe {
        (root as *mut u64).write(child as u64);
        (root as *mut u64).add(1).write(0xdead_beef);
    }
    allocator.set_root(0, root, 1).unwrap();
    allocator.detach();

    // Filters are process-local but this Process still has it registered
    let (allocator, kind) = Allocator::attach_with(&path, 1, 64 * SBSIZE).unwrap();
    assert_eq!(AttachKind::Resumed, kind);

    let root = allocator.get_root(0).unwrap();
    let child = unsafe { (root as *const u64).read() } as *const u8;
    assert_eq!(0x77, unsafe { child.read() });

    allocator.detach();
    remove_region(&path);
}

#[test]
fn only_one_allocator_per_process() {
    let _guard = REGION.lock().unwrap_or_else(|e| e.into_inner());
    let path = region_path("exclusive");
    remove_region(&path);

    let (allocator, _) = Allocator::attach(&path, 1).unwrap();

    let second = Allocator::attach(&path, 1);
    assert!(matches!(
        second,
        Err(pmalloc::AttachError::AlreadyAttached)
    ));

    allocator.detach();
    remove_region(&path);
}

#[test]
fn root_index_bounds() {
    let _guard = REGION.lock().unwrap_or_else(|e| e.into_inner());
    let path = region_path("root-bounds");
    remove_region(&path);

    let (allocator, _) = Allocator::attach(&path, 1).unwrap();

    let ptr = allocator.allocate(8).unwrap().as_ptr();
    assert_eq!(
        Err(AllocError::InvalidArgument),
        allocator.set_root(pmalloc::MAX_ROOTS, ptr, 0)
    );
    assert_eq!(
        Err(AllocError::InvalidArgument),
        allocator.get_root(pmalloc::MAX_ROOTS).map(|_| ())
    );
    allocator.free(ptr);

    allocator.detach();
    remove_region(&path);
}
