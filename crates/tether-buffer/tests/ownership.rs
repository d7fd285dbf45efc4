use std::sync::Arc;

use tether_buffer::{
    BufferDescriptor, BufferError, BufferRegistry, DirectReleaser, ElementType, ExclusiveState,
    Ownership,
};
use tether_mem::{HostModule, LinearMemory, ModuleAllocator};

fn setup() -> (Arc<HostModule>, BufferRegistry) {
    let module = HostModule::new(LinearMemory::new(1 << 20).unwrap(), 64).unwrap();
    let registry = BufferRegistry::with_strict(
        module.memory().clone(),
        Arc::new(DirectReleaser::new(module.clone())),
        true,
    );
    (module, registry)
}

fn module_vec(module: &HostModule, bytes: &[u8]) -> u32 {
    let ptr = module.alloc_vec(bytes.len() as u32).unwrap();
    module.memory().write(ptr, bytes).unwrap();
    ptr
}

#[test]
fn partial_view_cannot_be_transferred() {
    let (module, registry) = setup();
    let ptr = module_vec(&module, &[0, 1, 2, 3, 4, 5, 6, 7]);
    let buffer = registry.register_exclusive(ptr, 8, 8, ElementType::U8).unwrap();

    let sub = buffer.view().subview(3..7).unwrap();
    assert_eq!(sub.to_vec().unwrap(), vec![3, 4, 5, 6]);
    assert!(matches!(
        sub.transfer(),
        Err(BufferError::PartialView { span_len: 8, .. })
    ));

    // The failed attempt left the buffer untouched.
    assert!(!buffer.is_transferred());
    assert_eq!(buffer.to_vec().unwrap(), vec![0, 1, 2, 3, 4, 5, 6, 7]);
}

#[test]
fn reinterpreted_view_cannot_be_transferred() {
    let (module, registry) = setup();
    let ptr = module_vec(&module, &[0; 8]);
    let buffer = registry.register_exclusive(ptr, 8, 8, ElementType::U8).unwrap();

    let as_u32 = buffer.view_as(ElementType::U32).unwrap();
    assert_eq!(as_u32.element_count(), 2);
    assert_eq!(
        as_u32.transfer(),
        Err(BufferError::TypeMismatch {
            expected: ElementType::U8,
            found: ElementType::U32,
        })
    );
}

#[test]
fn views_are_bounds_and_alignment_checked() {
    let (module, registry) = setup();
    let ptr = module_vec(&module, &[0; 8]);
    let buffer = registry.register_exclusive(ptr, 8, 8, ElementType::U8).unwrap();

    assert!(matches!(
        buffer.view().subview(4..9),
        Err(BufferError::OutOfBounds { .. })
    ));
    assert!(matches!(
        buffer.view_as(ElementType::F64).unwrap().subview(0..2),
        Err(BufferError::OutOfBounds { .. })
    ));
    assert!(matches!(
        tether_buffer::BufferView::wrap(&buffer, ptr + 2, 4, ElementType::U32),
        Err(BufferError::Misaligned { element_size: 4, .. })
    ));
}

#[test]
fn exclusive_buffer_is_destroyed_exactly_once_on_drop() {
    let (module, registry) = setup();
    let ptr = module_vec(&module, &[1, 2, 3, 4]);
    let buffer = registry.register_exclusive(ptr, 4, 4, ElementType::U8).unwrap();
    let clone = buffer.clone();

    drop(buffer);
    assert!(module.is_live_allocation(ptr));
    drop(clone);

    assert!(!module.is_live_allocation(ptr));
    assert_eq!(
        registry.ledger().unwrap().exclusive_state(ptr),
        Some(ExclusiveState::Destroyed)
    );
}

#[test]
fn transferred_exclusive_buffer_is_never_destroyed_by_the_host() {
    let (module, registry) = setup();
    let ptr = module_vec(&module, &[9; 16]);
    let buffer = registry.register_exclusive(ptr, 16, 16, ElementType::U8).unwrap();
    let other = buffer.clone();

    let descriptor = buffer.transfer().unwrap();
    assert_eq!(descriptor, BufferDescriptor::exclusive(ptr, 16, 16));
    assert!(other.is_transferred());
    assert_eq!(other.to_vec(), Err(BufferError::Transferred));
    assert_eq!(other.write(0, &[1]), Err(BufferError::Transferred));
    assert_eq!(other.transfer(), Err(BufferError::Transferred));

    drop(buffer);
    drop(other);
    assert!(module.is_live_allocation(ptr));
    assert_eq!(
        registry.ledger().unwrap().exclusive_state(ptr),
        Some(ExclusiveState::Transferred)
    );

    // The module now owns the vector.
    module.dealloc_vec(ptr, 16, 16).unwrap();
}

#[test]
fn unregister_detaches_without_freeing() {
    let (module, registry) = setup();
    let ptr = module_vec(&module, &[0; 4]);
    let buffer = registry.register_exclusive(ptr, 4, 4, ElementType::U8).unwrap();

    registry.unregister(&buffer).unwrap();
    assert_eq!(registry.unregister(&buffer), Err(BufferError::Transferred));
    drop(buffer);
    assert!(module.is_live_allocation(ptr));
}

#[test]
fn refcounted_wrappers_are_deduplicated_and_release_their_reference() {
    let (module, registry) = setup();
    let vec_ptr = module_vec(&module, &[5, 6, 7]);
    let handle = module.create_arc_vec(vec_ptr, 3).unwrap();
    let descriptor = BufferDescriptor::refcounted(vec_ptr, 3, handle);

    let first = registry.reclaim(descriptor, ElementType::U8).unwrap();
    assert_eq!(module.arc_count(handle), Some(1));
    assert!(registry.resolve(handle).unwrap().same_buffer(&first));

    // The module hands out another reference to the same allocation.
    module.increment_arc(handle).unwrap();
    let second = registry.reclaim(descriptor, ElementType::U8).unwrap();
    assert!(second.same_buffer(&first));
    assert_eq!(module.arc_count(handle), Some(1));
    assert_eq!(registry.ledger().unwrap().live_refs(handle), 1);

    assert_eq!(first.to_vec().unwrap(), vec![5, 6, 7]);
    assert_eq!(first.write(0, &[0]), Err(BufferError::ReadOnly));

    drop(first);
    drop(second);
    assert_eq!(module.arc_count(handle), None);
    assert!(!module.is_live_allocation(vec_ptr));
    assert!(registry.resolve(handle).is_none());
    assert_eq!(registry.cached_handles(), 0);
    assert_eq!(registry.ledger().unwrap().live_refs(handle), 0);
}

#[test]
fn registering_a_live_handle_again_returns_the_existing_wrapper() {
    let (module, registry) = setup();
    let vec_ptr = module_vec(&module, &[9; 4]);
    let handle = module.create_arc_vec(vec_ptr, 4).unwrap();

    let first = registry
        .register_refcounted(vec_ptr, 4, handle, ElementType::U8)
        .unwrap();
    module.increment_arc(handle).unwrap();
    let second = registry
        .register_refcounted(vec_ptr, 4, handle, ElementType::U8)
        .unwrap();

    assert!(second.same_buffer(&first));
    assert!(registry.resolve(handle).unwrap().same_buffer(&first));
    assert_eq!(module.arc_count(handle), Some(1));
    assert_eq!(registry.ledger().unwrap().live_refs(handle), 1);

    drop(first);
    drop(second);
    assert_eq!(module.arc_count(handle), None);
    assert_eq!(registry.ledger().unwrap().live_allocations(), 0);
}

#[test]
fn transferring_a_refcounted_buffer_adds_a_module_reference() {
    let (module, registry) = setup();
    let vec_ptr = module_vec(&module, &[1; 8]);
    let handle = module.create_arc_vec(vec_ptr, 8).unwrap();
    let buffer = registry
        .reclaim(BufferDescriptor::refcounted(vec_ptr, 8, handle), ElementType::U8)
        .unwrap();

    let descriptor = buffer.transfer().unwrap();
    assert_eq!(descriptor.ownership, Ownership::SharedRefcounted { handle });
    assert_eq!(module.arc_count(handle), Some(2));
    assert!(!buffer.is_transferred());
    assert_eq!(buffer.to_vec().unwrap(), vec![1; 8]);

    drop(buffer);
    assert_eq!(module.arc_count(handle), Some(1));

    // The module drops the reference it was given.
    module.decrement_arc(handle).unwrap();
    assert_eq!(module.arc_count(handle), None);
}

#[test]
fn descriptors_outside_memory_are_rejected() {
    let (module, registry) = setup();
    let len = module.memory().len() as u32;
    let err = registry
        .reclaim(BufferDescriptor::exclusive(len - 4, 8, 8), ElementType::U8)
        .unwrap_err();
    assert!(matches!(err, BufferError::Memory(_)));
}

#[test]
fn concurrent_reclaims_share_one_wrapper() {
    let (module, registry) = setup();
    let vec_ptr = module_vec(&module, &[3; 32]);
    let handle = module.create_arc_vec(vec_ptr, 32).unwrap();
    let descriptor = BufferDescriptor::refcounted(vec_ptr, 32, handle);
    let anchor = registry.reclaim(descriptor, ElementType::U8).unwrap();

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..200 {
                    module.increment_arc(handle).unwrap();
                    let buffer = registry.reclaim(descriptor, ElementType::U8).unwrap();
                    assert!(buffer.same_buffer(&anchor));
                }
            });
        }
    });

    assert_eq!(module.arc_count(handle), Some(1));
    drop(anchor);
    assert_eq!(module.arc_count(handle), None);
}

#[test]
fn churned_wrappers_release_every_reference() {
    let (module, registry) = setup();
    let vec_ptr = module_vec(&module, &[3; 32]);
    let handle = module.create_arc_vec(vec_ptr, 32).unwrap();
    let descriptor = BufferDescriptor::refcounted(vec_ptr, 32, handle);
    // Keeps the allocation alive while wrappers come and go.
    module.increment_arc(handle).unwrap();

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..200 {
                    module.increment_arc(handle).unwrap();
                    drop(registry.reclaim(descriptor, ElementType::U8).unwrap());
                }
            });
        }
    });

    // The reference taken by `create_arc_vec` and the extra one remain.
    assert_eq!(module.arc_count(handle), Some(2));
    assert_eq!(registry.ledger().unwrap().live_refs(handle), 0);
}
