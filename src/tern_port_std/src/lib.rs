//! Simulation environment for running the tern kernel on a hosted target
//!
//! Each kernel thread is backed by a host OS thread, but only the one the
//! kernel considers running is ever awake: a context switch wakes the
//! incoming thread and blocks the outgoing one on a condition variable. The
//! interrupt gate is a process-global mutex with a per-host-thread nesting
//! count, so "masking interrupts" excludes every other simulated context
//! exactly as it would on a single CPU.
//!
//! Preemption of a *running* host thread is not simulated; switches happen
//! when the simulated context enters the port (a kernel call or
//! [`Port::idle_wait`]). Tests drive interrupts from the harness thread with
//! [`isr`] and [`tick`], which play the role of the interrupt controller:
//! the interrupt body runs with the gate held for its whole duration, and
//! the deferred switch at `interrupt_leave` merely redirects which worker is
//! awake.
use std::{
    cell::{Cell, RefCell},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Condvar, Mutex, MutexGuard},
    thread,
};

use tern_kernel::port::{IrqState, Port, ThreadEntry};

struct PortState {
    /// The worker record of the running simulated context; `0` before the
    /// scheduler dispatches the first thread.
    current: usize,
}

static STATE: Mutex<PortState> = Mutex::new(PortState { current: 0 });
static SCHED_EVENT: Condvar = Condvar::new();

/// Everything the simulator knows about one kernel thread.
struct WorkerRecord {
    entry: ThreadEntry,
    param: usize,
    exit: fn() -> !,
}

/// The panic payload used to unwind a worker whose kernel thread exited.
struct WorkerExit;

thread_local! {
    /// The interrupt gate state of this host thread: the held state mutex
    /// guard and the nesting depth.
    static GATE: RefCell<Option<(MutexGuard<'static, PortState>, u32)>> =
        const { RefCell::new(None) };

    /// The worker record address, if this host thread backs a kernel thread.
    static WORKER: Cell<usize> = const { Cell::new(0) };
}

fn interrupt_disable() -> IrqState {
    GATE.with(|gate| {
        let mut gate = gate.borrow_mut();
        match &mut *gate {
            Some((_, nest)) => {
                let prev = *nest;
                *nest += 1;
                prev as IrqState
            }
            None => {
                let guard = STATE.lock().unwrap();
                *gate = Some((guard, 1));
                0
            }
        }
    })
}

fn interrupt_enable(saved: IrqState) {
    GATE.with(|gate| {
        let mut gate = gate.borrow_mut();
        let (_guard, nest) = gate.as_mut().expect("interrupt gate is not held");
        *nest -= 1;
        debug_assert_eq!(*nest as IrqState, saved);
        if *nest == 0 {
            *gate = None;
        }
    })
}

/// "Lay out the initial frame": spawn the backing host thread, parked until
/// the kernel dispatches it, and hand the kernel a fake stack pointer that
/// identifies the worker.
unsafe fn stack_init(
    entry: ThreadEntry,
    param: usize,
    _stack_top: *mut u8,
    exit: fn() -> !,
) -> *mut u8 {
    let record: &'static WorkerRecord = Box::leak(Box::new(WorkerRecord { entry, param, exit }));
    let record_addr = record as *const WorkerRecord as usize;

    thread::spawn(move || {
        WORKER.with(|w| w.set(record_addr));

        // Block until the kernel dispatches this context for the first time.
        {
            let mut state = STATE.lock().unwrap();
            while state.current != record_addr {
                state = SCHED_EVENT.wait(state).unwrap();
            }
        }

        log::trace!("worker {record_addr:#x} dispatched for the first time");

        let result = catch_unwind(AssertUnwindSafe(|| {
            // Safety: the kernel hands us the entry point it was created
            // with
            unsafe { (record.entry)(record.param) };

            // The entry function returned; run the exit trampoline, exactly
            // like the seeded return address would on real hardware.
            (record.exit)();
        }));

        match result {
            Ok(()) => unreachable!("the exit trampoline returned"),
            Err(payload) if payload.is::<WorkerExit>() => {
                log::trace!("worker {record_addr:#x} exited");
            }
            Err(_) => {
                // A genuine panic in a kernel thread. The default hook has
                // already printed it; take the whole process down so the
                // test fails loudly instead of hanging.
                std::process::abort();
            }
        }
    });

    record_addr as *mut u8
}

/// Make `record_addr` the running context and wake its host thread. The
/// caller must hold the interrupt gate.
fn redirect_current(record_addr: usize) {
    GATE.with(|gate| {
        let mut gate = gate.borrow_mut();
        let (guard, _) = gate.as_mut().expect("context switch outside the interrupt gate");
        guard.current = record_addr;
    });
    SCHED_EVENT.notify_all();
}

unsafe fn context_switch(from_sp: *mut *mut u8, to_sp: *mut *mut u8) {
    // Safety: the kernel passes the `sp` slots of live control blocks, which
    // hold the record addresses returned by `stack_init`
    let from = unsafe { *from_sp } as usize;
    let to = unsafe { *to_sp } as usize;

    redirect_current(to);

    let me = WORKER.with(|w| w.get());
    if me == 0 {
        // Interrupt or boot context: the switch is pended. The outgoing
        // worker keeps running until it next enters the port and observes it
        // is no longer current; the incoming one wakes once the gate is
        // released.
        log::trace!("pended switch to {to:#x}");
        return;
    }

    // A preempted context must not re-enter the kernel before it is current
    // again; the outgoing slot always identifies the calling worker.
    debug_assert_eq!(from, me);

    // Move our gate guard into the condition-variable wait so the incoming
    // context can take over the "CPU", then reclaim it when we are
    // dispatched again.
    let (mut guard, nest) = GATE.with(|gate| gate.borrow_mut().take()).unwrap();
    debug_assert_eq!(nest, 1, "context switch inside a nested critical section");

    log::trace!("switching {me:#x} -> {to:#x}");
    while guard.current != me {
        guard = SCHED_EVENT.wait(guard).unwrap();
    }
    GATE.with(|gate| *gate.borrow_mut() = Some((guard, nest)));
}

unsafe fn context_switch_to(to_sp: *mut *mut u8) -> ! {
    // Safety: see `context_switch`
    let to = unsafe { *to_sp } as usize;

    redirect_current(to);

    // Discard this context along with its critical section.
    GATE.with(|gate| *gate.borrow_mut() = None);

    if WORKER.with(|w| w.get()) != 0 {
        // An exiting kernel thread: unwind the host thread.
        std::panic::panic_any(WorkerExit);
    }

    // The boot context has nothing left to do.
    log::trace!("boot context retired");
    loop {
        thread::park();
    }
}

/// Block the idle thread's host thread until the idle thread is scheduled
/// out and in again. This is the hosted stand-in for "wait for interrupt".
fn idle_wait() {
    let me = WORKER.with(|w| w.get());
    debug_assert_ne!(me, 0, "idle_wait outside a worker");

    let mut state = STATE.lock().unwrap();
    while state.current == me {
        state = SCHED_EVENT.wait(state).unwrap();
    }
    while state.current != me {
        state = SCHED_EVENT.wait(state).unwrap();
    }
}

/// The simulator port table.
pub static PORT: Port = Port {
    interrupt_disable,
    interrupt_enable,
    stack_init,
    context_switch,
    context_switch_to,
    idle_wait,
};

/// Register the simulator port and initialize the kernel. Call once per
/// process, before creating any kernel object.
pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
    tern_kernel::port::register(&PORT);
    tern_kernel::init();
}

/// Enter the scheduler on a dedicated host thread and wait until the first
/// thread has been dispatched.
pub fn start_scheduler() {
    thread::spawn(|| tern_kernel::start());

    while tern_kernel::Thread::current().is_none() {
        thread::yield_now();
    }
}

/// Run `f` as the body of a simulated interrupt handler. The interrupt gate
/// is held for the whole duration, and any context switch the handler causes
/// is applied at the end, as on real hardware.
pub fn isr<R>(f: impl FnOnce() -> R) -> R {
    let saved = (PORT.interrupt_disable)();
    tern_kernel::interrupt_enter();
    let result = f();
    tern_kernel::interrupt_leave();
    (PORT.interrupt_enable)(saved);
    result
}

/// Deliver `n` timer interrupts.
pub fn tick(n: u32) {
    for _ in 0..n {
        isr(tern_kernel::tick_advance);
    }
}
