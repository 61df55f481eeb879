use kernel_alloc::FrameArena;
use kernel_info::memory::{PUBLIC_BOUNDARY, kernel_stack_top};
use kernel_vmem::{
    AddressSpace, CopyWindow, FaultError, FrameAlloc, MapError, Mmu, PageFlags, PagingLayout,
    PageTableWalker, PhysMapper, PhysicalFrame, SpaceKind, VirtualAddress, X86_64_4LEVEL,
};
use std::cell::{Cell, RefCell};

type Space<'a> = AddressSpace<'a, FrameArena, FrameArena>;

struct MockMmu<'a> {
    arena: &'a FrameArena,
    active: Cell<PhysicalFrame>,
    loads: Cell<usize>,
    flushed: RefCell<Vec<VirtualAddress>>,
}

impl<'a> MockMmu<'a> {
    fn new(arena: &'a FrameArena, active: PhysicalFrame) -> Self {
        Self {
            arena,
            active: Cell::new(active),
            loads: Cell::new(0),
            flushed: RefCell::new(Vec::new()),
        }
    }
}

impl Mmu for MockMmu<'_> {
    fn active_root(&self) -> PhysicalFrame {
        self.active.get()
    }

    unsafe fn load_root(&self, root: PhysicalFrame) {
        self.active.set(root);
        self.loads.set(self.loads.get() + 1);
    }

    fn flush_page(&self, va: VirtualAddress) {
        self.flushed.borrow_mut().push(va);
    }

    unsafe fn page_bytes<'b>(&self, va: VirtualAddress) -> &'b mut [u8; 4096] {
        // SAFETY: every root in these tests comes from `arena`.
        let walker = unsafe {
            PageTableWalker::from_root(self.active.get(), X86_64_4LEVEL, self.arena, self.arena)
        };
        let pa = walker.translate(va).expect("window page is mapped");
        // SAFETY: forwarded to the caller.
        unsafe { self.arena.frame_bytes(pa.frame()) }
    }
}

fn kernel(arena: &FrameArena) -> Space<'_> {
    AddressSpace::new_kernel(
        X86_64_4LEVEL,
        VirtualAddress::new(PUBLIC_BOUNDARY),
        arena,
        arena,
    )
}

fn bytes(arena: &FrameArena, frame: PhysicalFrame) -> &mut [u8; 4096] {
    // SAFETY: tests never hold two references to the same frame at once.
    unsafe { arena.frame_bytes(frame) }
}

const PRIVATE: VirtualAddress = VirtualAddress::new(0x0000_0040_0000_0000);
const PUBLIC: VirtualAddress = VirtualAddress::new(0xffff_c000_0000_0000);

#[test]
fn resolve_follows_map_and_unmap() {
    let arena = FrameArena::new(1024);
    let kernel = kernel(&arena);
    let space = kernel.new_process();
    assert_eq!(space.kind(), SpaceKind::Process);

    let frame = space.map_page(PRIVATE, PageFlags::USER_DATA).unwrap();
    assert!(bytes(&arena, frame).iter().all(|&b| b == 0));

    let inside = VirtualAddress::new(PRIVATE.as_u64() + 0x123);
    let pa = space.resolve(inside).unwrap();
    assert_eq!(pa.frame(), frame);
    assert_eq!(pa.frame_offset(), 0x123);
    assert!(kernel.resolve(PRIVATE).is_none());

    assert_eq!(space.unmap_page(PRIVATE), frame);
    assert!(space.resolve(PRIVATE).is_none());
    assert!(!space.is_page_mapped(inside));
    arena.free(frame);
}

#[test]
fn map_range_to_uses_consecutive_frames() {
    let arena = FrameArena::new(1024);
    let kernel = kernel(&arena);
    let space = kernel.new_process();
    let first = PhysicalFrame::from_number(0x9000);

    space.map_range_to(PRIVATE, first, 3, PageFlags::USER_CODE);
    for i in 0..3 {
        let pa = space.resolve(PRIVATE.add_pages(i)).unwrap();
        assert_eq!(pa.frame().number(), 0x9000 + i);
    }
    let entry = space.leaf_entry(PRIVATE).unwrap();
    assert!(entry.user_access());
    assert!(!entry.writable());
    assert!(!entry.owned());
}

#[test]
fn public_pages_are_shared_with_every_task() {
    let arena = FrameArena::new(1024);
    let kernel = kernel(&arena);
    let early = kernel.new_process();

    let frame = kernel.map_page(PUBLIC, PageFlags::KERNEL_DATA).unwrap();
    let late = kernel.new_process();

    assert_eq!(early.resolve(PUBLIC).unwrap().frame(), frame);
    assert_eq!(late.resolve(PUBLIC).unwrap().frame(), frame);

    early.unmap_page(PUBLIC);
    assert!(kernel.resolve(PUBLIC).is_none());
    assert!(late.resolve(PUBLIC).is_none());
    arena.free(frame);
}

#[test]
fn deferred_page_is_backed_on_first_fault_only() {
    let arena = FrameArena::new(1024);
    let kernel = kernel(&arena);
    let space = kernel.new_process();

    assert_eq!(space.map_page(PRIVATE, PageFlags::USER_DATA | PageFlags::DEFER), None);
    assert!(space.resolve(PRIVATE).is_none());
    assert!(space.leaf_entry(PRIVATE).unwrap().is_deferred());

    let fault = VirtualAddress::new(PRIVATE.as_u64() + 8);
    let frame = space.handle_fault(fault).unwrap();
    assert!(bytes(&arena, frame).iter().all(|&b| b == 0));
    assert_eq!(space.resolve(fault).unwrap().frame(), frame);
    assert!(space.leaf_entry(PRIVATE).unwrap().writable());

    assert_eq!(space.handle_fault(fault), Err(FaultError::AlreadyPresent(fault)));
}

#[test]
fn faults_outside_reservations_are_reported() {
    let arena = FrameArena::new(1024);
    let kernel = kernel(&arena);
    let space = kernel.new_process();
    let elsewhere = VirtualAddress::new(0x1000);
    assert_eq!(space.handle_fault(elsewhere), Err(FaultError::NotMapped(elsewhere)));

    space.map_page(PRIVATE, PageFlags::USER_DATA);
    let neighbour = PRIVATE.add_pages(1);
    assert_eq!(space.handle_fault(neighbour), Err(FaultError::NotMapped(neighbour)));
}

#[test]
fn check_mapping_reports_each_rule() {
    let arena = FrameArena::new(1024);
    let kernel = kernel(&arena);
    let odd = VirtualAddress::new(0x1001);
    let hole = VirtualAddress::new(0x0000_8000_0000_0000);

    assert_eq!(kernel.check_mapping(odd, PageFlags::USER_DATA), Err(MapError::Misaligned(odd)));
    assert_eq!(kernel.check_mapping(hole, PageFlags::USER_DATA), Err(MapError::NonCanonical(hole)));
    assert_eq!(
        kernel.check_mapping(PUBLIC, PageFlags::USER_DATA),
        Err(MapError::PrivateAboveBoundary(PUBLIC))
    );
    assert_eq!(
        kernel.check_mapping(PRIVATE, PageFlags::KERNEL_DATA),
        Err(MapError::PublicBelowBoundary(PRIVATE))
    );
    assert_eq!(kernel.check_mapping(PRIVATE, PageFlags::USER_DATA), Ok(()));
    assert_eq!(kernel.check_mapping(PUBLIC, PageFlags::KERNEL_DATA), Ok(()));
}

#[test]
#[should_panic(expected = "invalid mapping")]
fn private_page_above_boundary_is_fatal() {
    let arena = FrameArena::new(1024);
    let kernel = kernel(&arena);
    let space = kernel.new_process();
    space.map_page(PUBLIC, PageFlags::USER_DATA);
}

#[test]
#[should_panic(expected = "invalid mapping")]
fn public_page_below_boundary_is_fatal() {
    let arena = FrameArena::new(1024);
    let kernel = kernel(&arena);
    kernel.map_page(PRIVATE, PageFlags::KERNEL_DATA);
}

#[test]
#[should_panic(expected = "already mapped")]
fn double_map_is_fatal() {
    let arena = FrameArena::new(1024);
    let kernel = kernel(&arena);
    let space = kernel.new_process();
    space.map_page(PRIVATE, PageFlags::USER_DATA);
    space.map_page(PRIVATE, PageFlags::USER_DATA);
}

#[test]
#[should_panic(expected = "is not mapped")]
fn unmapping_a_hole_is_fatal() {
    let arena = FrameArena::new(1024);
    let kernel = kernel(&arena);
    let space = kernel.new_process();
    space.unmap_page(PRIVATE);
}

#[test]
fn duplicate_copies_private_pages_into_fresh_frames() {
    let arena = FrameArena::new(1024);
    let kernel = kernel(&arena);
    let mmu = MockMmu::new(&arena, kernel.root());
    let parent = kernel.new_process();

    let data = parent.map_page(PRIVATE, PageFlags::USER_DATA).unwrap();
    bytes(&arena, data)[..5].copy_from_slice(b"hello");
    let lazy = PRIVATE.add_pages(16);
    parent.map_page(lazy, PageFlags::USER_DATA | PageFlags::DEFER);
    let public = kernel.map_page(PUBLIC, PageFlags::KERNEL_DATA).unwrap();

    let child = parent.duplicate(&kernel, &CopyWindow::DEFAULT, &mmu);

    let copy = child.resolve(PRIVATE).unwrap().frame();
    assert_ne!(copy, data);
    assert_eq!(&bytes(&arena, copy)[..5], b"hello");
    assert!(child.leaf_entry(lazy).unwrap().is_deferred());
    assert_eq!(child.resolve(PUBLIC).unwrap().frame(), public);

    bytes(&arena, copy)[0] = b'j';
    assert_eq!(bytes(&arena, data)[0], b'h');

    let window = CopyWindow::DEFAULT;
    assert!(!kernel.is_page_mapped(window.source()));
    assert!(!kernel.is_page_mapped(window.target()));
    let flushed = mmu.flushed.borrow();
    assert!(flushed.contains(&window.source()));
    assert!(flushed.contains(&window.target()));
}

#[test]
fn activate_loads_root_once_and_keeps_the_stack() {
    let arena = FrameArena::new(1024);
    let kernel = kernel(&arena);
    let mmu = MockMmu::new(&arena, kernel.root());
    let stack = VirtualAddress::new(kernel_stack_top(1) - 4096);
    kernel.map_page(stack, PageFlags::KERNEL_DATA);

    let space = kernel.new_process();
    space.activate(&mmu, stack);
    assert_eq!(mmu.active_root(), space.root());
    assert_eq!(mmu.loads.get(), 1);

    space.activate(&mmu, stack);
    assert_eq!(mmu.loads.get(), 1);

    kernel.activate(&mmu, stack);
    assert_eq!(mmu.active_root(), kernel.root());
}

#[test]
#[should_panic(expected = "kernel stack is not shared")]
fn activate_refuses_a_private_stack() {
    let arena = FrameArena::new(1024);
    let kernel = kernel(&arena);
    let a = kernel.new_process();
    let b = kernel.new_process();
    let mmu = MockMmu::new(&arena, a.root());
    a.map_page(PRIVATE, PageFlags::USER_DATA);
    b.activate(&mmu, PRIVATE);
}

#[test]
#[should_panic(expected = "destroying the active address space")]
fn destroying_the_installed_space_is_fatal() {
    let arena = FrameArena::new(1024);
    let kernel = kernel(&arena);
    let mmu = MockMmu::new(&arena, kernel.root());
    let stack = VirtualAddress::new(kernel_stack_top(1) - 4096);
    kernel.map_page(stack, PageFlags::KERNEL_DATA);

    let space = kernel.new_process();
    space.activate(&mmu, stack);
    space.destroy(&mmu);
}

#[test]
fn destroy_after_switching_away_frees_the_space() {
    let arena = FrameArena::new(1024);
    let kernel = kernel(&arena);
    let mmu = MockMmu::new(&arena, kernel.root());
    let stack = VirtualAddress::new(kernel_stack_top(1) - 4096);
    kernel.map_page(stack, PageFlags::KERNEL_DATA);
    let baseline = arena.allocated_frames();

    let space = kernel.new_process();
    space.map_range(PRIVATE, 3, PageFlags::USER_DATA);
    space.activate(&mmu, stack);
    kernel.activate(&mmu, stack);
    space.destroy(&mmu);
    assert_eq!(arena.allocated_frames(), baseline);
}

#[test]
fn dropping_spaces_returns_every_owned_frame() {
    let arena = FrameArena::new(1024);
    let kernel = kernel(&arena);
    let mmu = MockMmu::new(&arena, kernel.root());
    let window = CopyWindow::DEFAULT;
    kernel.reserve_tables(window.source(), 2, None);
    let baseline = arena.allocated_frames();

    let borrowed = arena.allocate().unwrap();
    {
        let parent = kernel.new_process();
        parent.map_range(PRIVATE, 4, PageFlags::USER_DATA);
        parent.map_page(PRIVATE.add_pages(600), PageFlags::USER_DATA | PageFlags::DEFER);
        parent.handle_fault(PRIVATE.add_pages(600)).unwrap();
        parent.map_page_to(VirtualAddress::new(0x1000), borrowed, PageFlags::USER_DATA);
        let child = parent.duplicate(&kernel, &window, &mmu);
        assert!(arena.allocated_frames() > baseline + 10);
        drop(child);
    }
    assert!(arena.is_allocated(borrowed));
    arena.free(borrowed);
    assert_eq!(arena.allocated_frames(), baseline);

    drop(kernel);
    assert_eq!(arena.allocated_frames(), 0);
}

#[test]
fn other_layouts_walk_the_same_way() {
    const SV39: PagingLayout = PagingLayout::new(&[9, 9, 9], 12);
    let arena = FrameArena::new(1024);
    let boundary = SV39.canonical(1 << 38);
    assert_eq!(boundary.as_u64(), 0xffff_ffc0_0000_0000);

    let kernel = AddressSpace::new_kernel(SV39, boundary, &arena, &arena);
    let space = kernel.new_process();
    let va = VirtualAddress::new(0x0000_0012_3456_7000);
    let frame = space.map_page(va, PageFlags::USER_DATA).unwrap();
    assert_eq!(space.resolve(va).unwrap().frame(), frame);
    assert_eq!(
        space.check_mapping(VirtualAddress::new(1 << 38), PageFlags::USER_DATA),
        Err(MapError::NonCanonical(VirtualAddress::new(1 << 38)))
    );
}
