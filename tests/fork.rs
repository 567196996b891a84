//! End-to-end scenarios for the copy-on-write fork protocol, run against
//! the in-memory machine.

use ucow::{
    KernelError,
    addressing::{PAGE_SIZE, USTACK_TOP, UXSTACK_BASE, Va},
    env::{EnvId, EnvServices, EnvStatus},
    fork::{ForkResult, fork, sfork},
    machine::Machine,
    page_table::{FrameId, PteFlags},
};

fn va(addr: usize) -> Va {
    Va::new(addr).unwrap()
}

fn user_rw() -> PteFlags {
    PteFlags::P | PteFlags::RW | PteFlags::US
}

fn user_ro() -> PteFlags {
    PteFlags::P | PteFlags::US
}

fn user_cow() -> PteFlags {
    PteFlags::P | PteFlags::US | PteFlags::COW
}

/// Allocate a writable page at `addr` in `env` and fill it with `byte`.
fn fill_page(m: &mut Machine, env: EnvId, addr: usize, byte: u8) {
    m.env(env).page_alloc(env, va(addr), user_rw()).unwrap();
    m.env(env).write_bytes(va(addr), &[byte; PAGE_SIZE]).unwrap();
}

/// Rewrite the permission bits at `addr` so the page is plain read-only.
fn make_read_only(m: &mut Machine, env: EnvId, addr: usize) {
    m.set_mapping_flags(env, va(addr).page_number(), user_ro())
        .unwrap();
}

fn frame_of(m: &Machine, env: EnvId, addr: usize) -> FrameId {
    m.mapping(env, va(addr).page_number())
        .unwrap()
        .frame()
        .unwrap()
}

fn flags_of(m: &Machine, env: EnvId, addr: usize) -> PteFlags {
    m.mapping(env, va(addr).page_number()).unwrap().flags()
}

fn do_fork(m: &mut Machine, parent: EnvId) -> EnvId {
    match fork(&mut m.env(parent)).unwrap() {
        ForkResult::Parent(child) => child,
        ForkResult::Child => panic!("parent observed the child side"),
    }
}

#[test]
fn fork_marks_writable_pages_cow() {
    let mut m = Machine::new();
    let parent = m.env_create();
    fill_page(&mut m, parent, 0x5000, 0xaa);

    let child = do_fork(&mut m, parent);

    // Both sides hold the same frame, copy-on-write, not writable.
    assert_eq!(flags_of(&m, parent, 0x5000), user_cow());
    assert_eq!(flags_of(&m, child, 0x5000), user_cow());
    assert_eq!(frame_of(&m, parent, 0x5000), frame_of(&m, child, 0x5000));
    assert_eq!(m.status(child), Some(EnvStatus::Runnable));
}

#[test]
fn fork_shares_read_only_pages() {
    let mut m = Machine::new();
    let parent = m.env_create();
    fill_page(&mut m, parent, 0x3000, 7);
    make_read_only(&mut m, parent, 0x3000);

    let child = do_fork(&mut m, parent);

    // Identical frame, identical permission set, no COW bit introduced.
    assert_eq!(frame_of(&m, parent, 0x3000), frame_of(&m, child, 0x3000));
    assert_eq!(flags_of(&m, parent, 0x3000), user_ro());
    assert_eq!(flags_of(&m, child, 0x3000), user_ro());
}

#[test]
fn read_only_page_stays_illegal_to_write() {
    let mut m = Machine::new();
    let parent = m.env_create();
    fill_page(&mut m, parent, 0x3000, 7);
    make_read_only(&mut m, parent, 0x3000);
    let child = do_fork(&mut m, parent);

    // A write to a present, non-COW page is a genuine protection
    // violation. The handler refuses it and the environment dies.
    let err = m.env(child).write_bytes(va(0x3000), &[1]);
    assert_eq!(err, Err(KernelError::InvalidAccess));
    assert_eq!(m.status(child), Some(EnvStatus::Dying));

    let err = m.env(parent).write_bytes(va(0x3000), &[1]);
    assert_eq!(err, Err(KernelError::InvalidAccess));
    assert_eq!(m.status(parent), Some(EnvStatus::Dying));
}

#[test]
fn cow_scenario_child_write_copies_page() {
    let mut m = Machine::new();
    let parent = m.env_create();
    fill_page(&mut m, parent, 0x5000, 0xaa);
    let child = do_fork(&mut m, parent);
    let shared = frame_of(&m, parent, 0x5000);

    // Child writes one byte at offset 10. The fault resolves into a
    // private copy before the write lands.
    m.env(child).write_bytes(va(0x500a), &[0x55]).unwrap();

    let child_frame = frame_of(&m, child, 0x5000);
    assert_ne!(child_frame, shared);
    assert!(flags_of(&m, child, 0x5000).contains(PteFlags::RW));
    assert!(!flags_of(&m, child, 0x5000).contains(PteFlags::COW));

    // The copy is exact except for the written byte.
    let data = m.frame_contents(child_frame).unwrap();
    for (i, b) in data.iter().enumerate() {
        assert_eq!(*b, if i == 10 { 0x55 } else { 0xaa });
    }

    // The parent is untouched: same frame, still copy-on-write, original
    // contents.
    assert_eq!(frame_of(&m, parent, 0x5000), shared);
    assert_eq!(flags_of(&m, parent, 0x5000), user_cow());
    assert!(m.frame_contents(shared).unwrap().iter().all(|b| *b == 0xaa));
}

#[test]
fn second_write_does_not_copy_again() {
    let mut m = Machine::new();
    let parent = m.env_create();
    fill_page(&mut m, parent, 0x5000, 0xaa);
    let child = do_fork(&mut m, parent);

    m.env(child).write_bytes(va(0x500a), &[1]).unwrap();
    let owned = frame_of(&m, child, 0x5000);
    m.env(child).write_bytes(va(0x500a), &[2]).unwrap();

    // The page is privately writable now; no further transition happens.
    assert_eq!(frame_of(&m, child, 0x5000), owned);
    assert_eq!(m.frame_contents(owned).unwrap()[10], 2);
}

#[test]
fn parent_write_also_copies() {
    let mut m = Machine::new();
    let parent = m.env_create();
    fill_page(&mut m, parent, 0x7000, 0x33);
    let child = do_fork(&mut m, parent);
    let shared = frame_of(&m, parent, 0x7000);

    m.env(parent).write_bytes(va(0x7000), &[9]).unwrap();

    assert_ne!(frame_of(&m, parent, 0x7000), shared);
    // The child keeps the original frame and contents.
    assert_eq!(frame_of(&m, child, 0x7000), shared);
    assert_eq!(flags_of(&m, child, 0x7000), user_cow());
    assert!(m.frame_contents(shared).unwrap().iter().all(|b| *b == 0x33));
}

#[test]
fn exception_stack_is_never_shared() {
    let mut m = Machine::new();
    let parent = m.env_create();
    fill_page(&mut m, parent, 0x5000, 0xaa);
    let child = do_fork(&mut m, parent);

    let parent_ux = frame_of(&m, parent, UXSTACK_BASE.into_usize());
    let child_ux = frame_of(&m, child, UXSTACK_BASE.into_usize());
    assert_ne!(parent_ux, child_ux);
    for env in [parent, child] {
        let flags = flags_of(&m, env, UXSTACK_BASE.into_usize());
        assert!(flags.contains(PteFlags::RW));
        assert!(!flags.contains(PteFlags::COW));
    }
}

#[test]
fn second_fork_reasserts_cow_on_parent() {
    let mut m = Machine::new();
    let parent = m.env_create();
    fill_page(&mut m, parent, 0x5000, 0xaa);
    let first = do_fork(&mut m, parent);
    // The page is already copy-on-write in the parent. A second fork must
    // still mirror exactly those bits into the new child and re-assert
    // them on the parent.
    let second = do_fork(&mut m, parent);

    let shared = frame_of(&m, parent, 0x5000);
    for env in [parent, first, second] {
        assert_eq!(frame_of(&m, env, 0x5000), shared);
        assert_eq!(flags_of(&m, env, 0x5000), user_cow());
    }
}

#[test]
fn resumed_child_observes_child_side() {
    let mut m = Machine::new();
    let parent = m.env_create();
    fill_page(&mut m, parent, 0x5000, 0xaa);
    let child = do_fork(&mut m, parent);
    let child_ux = frame_of(&m, child, UXSTACK_BASE.into_usize());

    // The child resumes inside fork. It must report the child side and
    // perform no orchestration of its own: its exception stack, installed
    // by the parent, stays in place.
    assert_eq!(fork(&mut m.env(child)), Ok(ForkResult::Child));
    assert_eq!(m.env(child).getenvid(), child);
    assert_eq!(frame_of(&m, child, UXSTACK_BASE.into_usize()), child_ux);
}

#[test]
fn non_write_fault_is_fatal() {
    let mut m = Machine::new();
    let parent = m.env_create();
    fill_page(&mut m, parent, 0x5000, 0xaa);
    let _child = do_fork(&mut m, parent);

    // The parent has the COW handler registered; a read of an unmapped
    // page delivers a non-write fault, which the handler refuses.
    let mut buf = [0u8; 4];
    let err = m.env(parent).read_bytes(va(0x9000_0000), &mut buf);
    assert_eq!(err, Err(KernelError::InvalidAccess));
    assert_eq!(m.status(parent), Some(EnvStatus::Dying));
}

#[test]
fn fault_without_handler_is_fatal() {
    let mut m = Machine::new();
    let env = m.env_create();
    let err = m.env(env).write_bytes(va(0x1000), &[0]);
    assert_eq!(err, Err(KernelError::InvalidAccess));
    assert_eq!(m.status(env), Some(EnvStatus::Dying));
}

#[test]
fn fork_without_frames_fails() {
    // Two frames fit the parent's data page and exception stack; the
    // child's private exception stack does not.
    let mut m = Machine::with_frame_limit(2);
    let parent = m.env_create();
    fill_page(&mut m, parent, 0x5000, 0xaa);
    assert_eq!(fork(&mut m.env(parent)), Err(KernelError::NoMemory));
}

#[test]
fn cow_fault_without_frames_kills_the_writer() {
    // Exactly enough frames to fork, none spare for the private copy.
    let mut m = Machine::with_frame_limit(3);
    let parent = m.env_create();
    fill_page(&mut m, parent, 0x5000, 0xaa);
    let child = do_fork(&mut m, parent);

    let err = m.env(child).write_bytes(va(0x5000), &[1]);
    assert_eq!(err, Err(KernelError::NoMemory));
    assert_eq!(m.status(child), Some(EnvStatus::Dying));
    // The parent still holds the page, untouched.
    assert_eq!(flags_of(&m, parent, 0x5000), user_cow());
}

#[test]
fn sfork_shares_writable_pages() {
    let mut m = Machine::new();
    let parent = m.env_create();
    fill_page(&mut m, parent, 0x4000, 0x11);

    let child = match sfork(&mut m.env(parent)).unwrap() {
        ForkResult::Parent(child) => child,
        ForkResult::Child => panic!("parent observed the child side"),
    };

    // Writable pages are shared outright: same frame, both writable.
    assert_eq!(frame_of(&m, parent, 0x4000), frame_of(&m, child, 0x4000));
    assert!(flags_of(&m, child, 0x4000).contains(PteFlags::RW));

    // Writes on one side are visible on the other.
    m.env(child).write_bytes(va(0x4000), &[0x77]).unwrap();
    let mut buf = [0u8; 1];
    m.env(parent).read_bytes(va(0x4000), &mut buf).unwrap();
    assert_eq!(buf[0], 0x77);
}

#[test]
fn sfork_keeps_the_stack_private() {
    let stack = USTACK_TOP - PAGE_SIZE;
    let mut m = Machine::new();
    let parent = m.env_create();
    fill_page(&mut m, parent, stack, 0xcc);

    let child = match sfork(&mut m.env(parent)).unwrap() {
        ForkResult::Parent(child) => child,
        ForkResult::Child => panic!("parent observed the child side"),
    };

    // The stack page follows the copy-on-write policy instead.
    assert_eq!(flags_of(&m, parent, stack), user_cow());
    assert_eq!(flags_of(&m, child, stack), user_cow());
    let shared = frame_of(&m, parent, stack);

    m.env(child).write_bytes(va(stack), &[0xdd]).unwrap();
    assert_ne!(frame_of(&m, child, stack), shared);
    assert_eq!(frame_of(&m, parent, stack), shared);
    assert!(m.frame_contents(shared).unwrap().iter().all(|b| *b == 0xcc));
}

#[test]
fn duplication_covers_every_present_page() {
    let mut m = Machine::new();
    let parent = m.env_create();
    for (i, addr) in [0x2000, 0x10_0000, 0x40_0000].iter().enumerate() {
        fill_page(&mut m, parent, *addr, i as u8 + 1);
    }
    make_read_only(&mut m, parent, 0x10_0000);

    let child = do_fork(&mut m, parent);

    assert_eq!(flags_of(&m, child, 0x2000), user_cow());
    assert_eq!(flags_of(&m, child, 0x10_0000), user_ro());
    assert_eq!(flags_of(&m, child, 0x40_0000), user_cow());
    for addr in [0x2000, 0x10_0000, 0x40_0000] {
        assert_eq!(frame_of(&m, parent, addr), frame_of(&m, child, addr));
    }
}
