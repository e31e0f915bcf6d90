// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Forks real processes against shared segments. Everything runs from a
//! single test so no other test thread is alive while forking.

use libdd_shmem::{Arena, Dshm, RefState, ShmAlloc, ShmKey, StringPool};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::ptr::NonNull;

const CHILDREN: usize = 4;
const STRINGS: usize = 200;

fn spawn(child: impl FnOnce() -> bool) -> Pid {
    // SAFETY: the test process is single threaded apart from the idle test
    // harness thread, and the child only exits through _exit.
    match unsafe { fork() }.unwrap() {
        ForkResult::Parent { child } => child,
        ForkResult::Child => {
            let code = if child() { 0 } else { 1 };
            unsafe { libc::_exit(code) }
        }
    }
}

fn wait_ok(pid: Pid) {
    assert_eq!(waitpid(pid, None).unwrap(), WaitStatus::Exited(pid, 0));
}

fn concurrent_interning_never_duplicates() {
    let path = format!("/libdd-shmem-mp/{}/pool", std::process::id());
    let _owner = StringPool::create(&path, 4 << 20).unwrap();
    let pool = StringPool::attach(&path).unwrap();
    let strings: Vec<String> = (0..STRINGS)
        .map(|i| format!("system.cpu.util[,iowait,{i}]"))
        .collect();

    let children: Vec<Pid> = (0..CHILDREN)
        .map(|_| {
            spawn(|| {
                strings.iter().all(|s| match pool.intern(s) {
                    // Ownership stays with the pool; the parent counts it.
                    Ok(handle) => {
                        handle.into_raw();
                        true
                    }
                    Err(_) => false,
                })
            })
        })
        .collect();
    children.into_iter().for_each(wait_ok);

    assert_eq!(pool.len().unwrap(), STRINGS);
    for s in &strings {
        assert_eq!(pool.refcount(s).unwrap(), CHILDREN as u32);
    }
}

fn growth_in_another_process_is_observed() {
    let key = ShmKey::derive(format!("/libdd-shmem-mp/{}/dshm", std::process::id()), 2);
    let dshm = Dshm::create(&key, 4096, Arena::copy_grow).unwrap();
    let mut local = dshm.new_ref().unwrap();
    let root = {
        let guard = dshm.lock().unwrap();
        let region = NonNull::from(guard.mapping(&mut local).unwrap());
        let arena = unsafe { Arena::init_in(region, "mp") }.unwrap();
        let heap = arena.lock().unwrap();
        let data = heap.malloc(8).unwrap();
        unsafe { std::ptr::write(heap.resolve(data).as_ptr() as *mut u64, 0xfeed) };
        heap.set_root(Some(data));
        data
    };

    let other = Dshm::open(&key, Arena::copy_grow).unwrap();
    wait_ok(spawn(|| {
        other
            .lock()
            .and_then(|guard| guard.realloc(256 * 1024))
            .is_ok()
    }));

    assert_eq!(dshm.validate_ref(&local), RefState::Stale);
    let guard = dshm.lock().unwrap();
    let region = NonNull::from(guard.mapping(&mut local).unwrap());
    assert_eq!(region.len(), 256 * 1024);
    let arena = unsafe { Arena::attach_in(region, "mp") }.unwrap();
    let heap = arena.lock().unwrap();
    assert_eq!(heap.root(), Some(root));
    assert_eq!(
        unsafe { std::ptr::read(heap.resolve(root).as_ptr() as *const u64) },
        0xfeed
    );
    heap.verify().unwrap();
}

#[test]
#[cfg_attr(miri, ignore)]
fn multi_process() {
    concurrent_interning_never_duplicates();
    growth_in_another_process_is_observed();
}
