//! The idle thread
//!
//! The lowest-priority thread, always ready. It reclaims defunct dynamic
//! threads (which must happen outside interrupt context, since it frees
//! heap allocations) and runs the application idle hook.
use crate::{
    klock::{lock_cpu, CpuLockCell},
    port,
    thread::{self, readyqueue::PRI_MAX, Thread},
    timeout::Tick,
};

const IDLE_STACK_SIZE: usize = 4096;
const IDLE_TICK: Tick = 32;

static IDLE_HOOK: CpuLockCell<Option<fn()>> = CpuLockCell::new(None);

/// Install a function the idle thread calls on every iteration.
pub fn set_hook(hook: Option<fn()>) {
    let mut lock = lock_cpu();
    IDLE_HOOK.replace(&mut *lock, hook);
}

unsafe fn idle_entry(_param: usize) {
    loop {
        thread::reap_defunct();

        let hook = {
            let lock = lock_cpu();
            IDLE_HOOK.get(&*lock)
        };
        if let Some(hook) = hook {
            hook();
        }

        (port::port().idle_wait)();
    }
}

/// Create and start the idle thread. Called once during kernel
/// initialization.
pub(crate) fn init() {
    let idle = Thread::create(
        "tidle",
        idle_entry,
        0,
        IDLE_STACK_SIZE,
        (PRI_MAX - 1) as u8,
        IDLE_TICK,
    )
    .expect("failed to create the idle thread");
    idle.startup().expect("failed to start the idle thread");
}
