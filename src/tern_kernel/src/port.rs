//! The hardware boundary
//!
//! The kernel is chipset-agnostic; everything that touches real hardware is
//! funneled through a [`Port`], a table of plain function pointers registered
//! once at boot. This keeps the kernel free of virtual dispatch while letting
//! a hosted simulator stand in for the real thing in tests.
use core::sync::atomic::{AtomicPtr, Ordering};

/// An opaque token describing the interrupt mask state saved by
/// [`Port::interrupt_disable`].
pub type IrqState = usize;

/// The type of a thread entry function.
pub type ThreadEntry = unsafe fn(usize);

/// The hardware primitives a target must provide.
pub struct Port {
    /// Atomically mask interrupts, returning the previous mask state.
    /// Must be nestable.
    pub interrupt_disable: fn() -> IrqState,

    /// Restore the interrupt mask state saved by the matching
    /// [`Self::interrupt_disable`] call.
    pub interrupt_enable: fn(IrqState),

    /// Lay out the initial context of a thread on its stack and return the
    /// initial stack pointer.
    ///
    /// The frame must be arranged so that dispatching to the returned stack
    /// pointer calls `entry(param)`, and so that `exit` runs if `entry`
    /// returns.
    ///
    /// # Safety
    ///
    /// `stack_top` must point one past the end of a stack region that is
    /// owned exclusively by the thread being created.
    pub stack_init: unsafe fn(
        entry: ThreadEntry,
        param: usize,
        stack_top: *mut u8,
        exit: fn() -> !,
    ) -> *mut u8,

    /// Save the current context to `*from_sp` and dispatch the context saved
    /// at `*to_sp`.
    ///
    /// The call returns when the saved context is dispatched again. The
    /// caller's critical section is preserved across the suspension; the
    /// incoming context resumes with whatever interrupt state it saved.
    ///
    /// May also be called from an interrupt context, in which case the switch
    /// is pended until the outermost interrupt handler returns.
    ///
    /// # Safety
    ///
    /// Both locations must be the `sp` slots of live thread control blocks.
    pub context_switch: unsafe fn(from_sp: *mut *mut u8, to_sp: *mut *mut u8),

    /// Dispatch the context saved at `*to_sp`, discarding the current
    /// context. Used for the initial dispatch and for exiting threads.
    ///
    /// # Safety
    ///
    /// `to_sp` must be the `sp` slot of a live thread control block.
    pub context_switch_to: unsafe fn(to_sp: *mut *mut u8) -> !,

    /// Called by the idle thread when there is nothing to do. A real port
    /// would wait for an interrupt here; a hosted port can block the host
    /// thread until the kernel schedules the idle thread out.
    pub idle_wait: fn(),
}

static PORT: AtomicPtr<Port> = AtomicPtr::new(core::ptr::null_mut());

/// Register the port. Must happen exactly once, before any other kernel call.
pub fn register(port: &'static Port) {
    let prev = PORT.swap(port as *const Port as *mut Port, Ordering::Release);
    assert!(prev.is_null(), "port is already registered");
}

/// Get the registered port.
pub(crate) fn port() -> &'static Port {
    let ptr = PORT.load(Ordering::Acquire);
    assert!(!ptr.is_null(), "no port is registered");

    // Safety: `register` only ever stores a `&'static Port`
    unsafe { &*ptr }
}
