//! Threads
//!
//! A thread's control block embeds everything the kernel needs to schedule
//! it: its saved stack pointer, its scheduling state, one list node that is a
//! member of exactly one of {a ready list, an IPC wait queue, the defunct
//! list}, and a one-shot timer used for bounded waits.
use alloc::boxed::Box;
use core::{cell::UnsafeCell, fmt, ptr::NonNull};

use crate::{
    error::{Error, Result},
    event::EventFlags,
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    mutex::MutexRef,
    object::{self, KernelObject, ObjectClass, ObjectFlags, ObjectName},
    port,
    sched,
    timeout::Tick,
    timer::{self, TimerCb},
    utils::{
        intrusive_list::{ElemRef, ListHead, ListNode},
        Init,
    },
};

pub mod readyqueue;
use readyqueue::ThreadPriority;

/// Thread state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Initialized but never started.
    Init,

    /// Runnable: linked into the ready list of its current priority. The
    /// running thread keeps this state.
    Ready,

    /// Blocked: linked into at most one IPC wait queue, possibly with the
    /// thread timer armed.
    Suspend,

    /// Terminal. Dynamic threads additionally sit on the defunct list until
    /// the idle thread reclaims them.
    Close,
}

/// *Thread control block* - the state data of a thread.
pub struct ThreadCb {
    pub(crate) object: KernelObject,

    /// The saved stack pointer. Written by the port during context switches.
    pub(crate) sp: UnsafeCell<*mut u8>,

    entry: CpuLockCell<Option<port::ThreadEntry>>,
    param: CpuLockCell<usize>,

    stack_addr: CpuLockCell<usize>,
    stack_size: CpuLockCell<usize>,

    pub(crate) init_priority: CpuLockCell<u8>,

    /// The current priority with its cached bitmap operands. May be
    /// temporarily raised by priority inheritance.
    pub(crate) priority: CpuLockCell<ThreadPriority>,

    pub(crate) init_tick: CpuLockCell<Tick>,
    pub(crate) remaining_tick: CpuLockCell<Tick>,

    pub(crate) state: CpuLockCell<ThreadState>,

    /// The outcome of the last wait, written by the waker or the timeout
    /// path before the thread is re-readied.
    pub(crate) error: CpuLockCell<Result>,

    /// The event mask this thread is waiting for (or, after a wake-up, the
    /// set snapshot stored by the waker).
    pub(crate) event_set: CpuLockCell<u32>,
    pub(crate) event_info: CpuLockCell<EventFlags>,

    /// The most recently acquired mutex still held by this thread; the rest
    /// chain through `MutexCb::prev_mutex_held`. Releasing a mutex restores
    /// the priority the remaining entries still demand.
    pub(crate) last_mutex_held: CpuLockCell<Option<MutexRef>>,

    /// Membership in exactly one of: a ready list, an IPC wait queue, the
    /// defunct list.
    pub(crate) schedule_node: ListNode<ThreadCb>,

    /// The one-shot timer backing bounded waits; expiration invokes
    /// `thread_timeout`. Idle whenever the thread is `Ready`.
    pub(crate) thread_timer: TimerCb,

    user_data: CpuLockCell<usize>,
}

// Safety: all mutable state is token-gated; `sp` is only touched by the port
// during context switches, with the CPU lock held
unsafe impl Send for ThreadCb {}
unsafe impl Sync for ThreadCb {}

impl ThreadCb {
    pub const fn new() -> Self {
        Self {
            object: KernelObject::new(),
            sp: UnsafeCell::new(core::ptr::null_mut()),
            entry: CpuLockCell::new(None),
            param: CpuLockCell::new(0),
            stack_addr: CpuLockCell::new(0),
            stack_size: CpuLockCell::new(0),
            init_priority: CpuLockCell::new(0),
            priority: CpuLockCell::new(ThreadPriority::new(0)),
            init_tick: CpuLockCell::new(0),
            remaining_tick: CpuLockCell::new(0),
            state: CpuLockCell::new(ThreadState::Init),
            error: CpuLockCell::new(Ok(())),
            event_set: CpuLockCell::new(0),
            event_info: CpuLockCell::new(EventFlags::empty()),
            last_mutex_held: CpuLockCell::new(None),
            schedule_node: ListNode::new(),
            thread_timer: TimerCb::new(),
            user_data: CpuLockCell::new(0),
        }
    }

    pub fn as_object(&self) -> &KernelObject {
        &self.object
    }
}

impl Init for ThreadCb {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

/// A reference to a [`ThreadCb`].
pub(crate) struct ThreadRef(NonNull<ThreadCb>);

// Safety: `ThreadCb` is `Send + Sync`
unsafe impl Send for ThreadRef {}
unsafe impl Sync for ThreadRef {}

impl Clone for ThreadRef {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl Copy for ThreadRef {}

impl PartialEq for ThreadRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for ThreadRef {}

impl fmt::Debug for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("ThreadRef").field(&self.0).finish()
    }
}

impl ThreadRef {
    pub(crate) fn from_nonnull(ptr: NonNull<ThreadCb>) -> Self {
        Self(ptr)
    }

    /// Dereference the control block.
    ///
    /// Thread control blocks referenced by the kernel are live: a defunct
    /// thread is only reclaimed after it has been unlinked from every kernel
    /// list and the registry.
    pub(crate) fn cb(&self) -> &ThreadCb {
        // Safety: see above
        unsafe { self.0.as_ref() }
    }
}

/// Threads in terminal state awaiting reclamation by the idle thread.
static DEFUNCT: ListHead<ThreadCb> = ListHead::new();

/// An opaque thread handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thread(pub(crate) ThreadRef);

// Safety: `ThreadRef` is `Send + Sync`
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

/// Commands accepted by [`Thread::control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadControl {
    /// Change the thread's current priority.
    ChangePriority(u8),
    /// Equivalent to [`Thread::startup`].
    Startup,
    /// Tear the thread down (detach or delete, matching its lifecycle).
    Close,
}

#[allow(clippy::too_many_arguments)]
unsafe fn init_common(
    mut lock: CpuLockTokenRefMut<'_>,
    cb: &ThreadCb,
    name: &str,
    entry: port::ThreadEntry,
    param: usize,
    stack_addr: *mut u8,
    stack_size: usize,
    priority: u8,
    tick: Tick,
    lifecycle: ObjectFlags,
) {
    cb.entry.replace(&mut *lock, Some(entry));
    cb.param.replace(&mut *lock, param);
    cb.stack_addr.replace(&mut *lock, stack_addr as usize);
    cb.stack_size.replace(&mut *lock, stack_size);
    cb.init_priority.replace(&mut *lock, priority);
    cb.priority
        .replace(&mut *lock, ThreadPriority::new(priority));
    cb.init_tick.replace(&mut *lock, tick);
    cb.remaining_tick.replace(&mut *lock, tick);
    cb.state.replace(&mut *lock, ThreadState::Init);
    cb.error.replace(&mut *lock, Ok(()));
    cb.event_set.replace(&mut *lock, 0);
    cb.event_info.replace(&mut *lock, EventFlags::empty());
    cb.last_mutex_held.replace(&mut *lock, None);
    cb.user_data.replace(&mut *lock, 0);
    cb.schedule_node
        .set_owner(lock.borrow_mut(), ElemRef::new(cb));

    // Plant the initial frame, with the exit trampoline seeded as the return
    // address of the entry function.
    let stack_top = stack_addr.wrapping_add(stack_size);
    // Safety: the caller guarantees the stack region; see `Thread::init`
    let sp = unsafe { (port::port().stack_init)(entry, param, stack_top, thread_exit) };
    // Safety: the thread is not running yet, so the slot is not aliased
    unsafe { *cb.sp.get() = sp };

    timer::init_embedded(
        lock.borrow_mut(),
        &cb.thread_timer,
        name,
        thread_timeout,
        cb as *const ThreadCb as usize,
    );

    object::register(
        lock,
        &cb.object,
        ObjectClass::Thread,
        name,
        lifecycle,
        NonNull::from(cb),
    );
}

/// The return address planted below every thread entry function.
fn thread_exit() -> ! {
    exit_current()
}

/// Terminate the calling thread: leave the scheduler, release the thread
/// timer, and either unregister (static) or queue for reclamation (dynamic).
pub(crate) fn exit_current() -> ! {
    let mut lock = lock_cpu();

    let cur = sched::running(lock.borrow_mut()).expect("thread exit outside a thread context");
    let cb = cur.cb();

    readyqueue::remove(lock.borrow_mut(), cur);
    cb.state.replace(&mut *lock, ThreadState::Close);

    timer::detach_locked(lock.borrow_mut(), &cb.thread_timer);

    if cb.object.is_static(lock.borrow_mut()) {
        object::unregister(lock.borrow_mut(), &cb.object);
    } else {
        DEFUNCT.push_back(lock.borrow_mut(), &cb.schedule_node);
    }

    sched::dispatch_exit(lock)
}

/// Make a `Suspend` thread runnable: detach it from any wait queue, cancel
/// its timer, and link it into the ready list.
pub(crate) fn resume_locked(mut lock: CpuLockTokenRefMut<'_>, thread: ThreadRef) -> Result {
    let cb = thread.cb();

    if cb.state.get(&*lock) != ThreadState::Suspend {
        return Err(Error::Failed);
    }

    if cb.schedule_node.is_linked(lock.borrow_mut()) {
        cb.schedule_node.unlink(lock.borrow_mut());
    }
    timer::stop_locked(lock.borrow_mut(), &cb.thread_timer);

    cb.state.replace(&mut *lock, ThreadState::Ready);
    readyqueue::push_back(lock, thread);
    Ok(())
}

/// Wake a thread parked on an IPC wait queue whose node has already been
/// unlinked by the waker.
pub(crate) fn wake_locked(mut lock: CpuLockTokenRefMut<'_>, thread: ThreadRef) {
    let cb = thread.cb();
    debug_assert_eq!(cb.state.get(&*lock), ThreadState::Suspend);
    debug_assert!(!cb.schedule_node.is_linked(lock.borrow_mut()));

    timer::stop_locked(lock.borrow_mut(), &cb.thread_timer);
    cb.state.replace(&mut *lock, ThreadState::Ready);
    readyqueue::push_back(lock, thread);
}

/// Take a `Ready` thread off the scheduler.
pub(crate) fn suspend_locked(mut lock: CpuLockTokenRefMut<'_>, thread: ThreadRef) -> Result {
    let cb = thread.cb();

    if cb.state.get(&*lock) != ThreadState::Ready {
        return Err(Error::Failed);
    }

    readyqueue::remove(lock.borrow_mut(), thread);
    cb.state.replace(&mut *lock, ThreadState::Suspend);
    Ok(())
}

/// Change a thread's current priority, re-linking it into the matching ready
/// list if it is runnable. The initial priority is left untouched.
pub(crate) fn change_priority_locked(
    mut lock: CpuLockTokenRefMut<'_>,
    thread: ThreadRef,
    priority: u8,
) {
    let cb = thread.cb();

    if cb.state.get(&*lock) == ThreadState::Ready {
        readyqueue::remove(lock.borrow_mut(), thread);
        cb.priority
            .replace(&mut *lock, ThreadPriority::new(priority));
        readyqueue::push_back(lock.borrow_mut(), thread);
    } else {
        cb.priority
            .replace(&mut *lock, ThreadPriority::new(priority));
    }
}

/// The thread timer expiration handler: cancel the wait the owning thread is
/// blocked in.
///
/// Runs in the tick interrupt. Both this path and the waker path run inside
/// the interrupt gate and check the thread's state first, so whichever runs
/// second finds nothing to do.
pub(crate) fn thread_timeout(param: usize) {
    // Safety: the parameter was set to the owning `ThreadCb`'s address at
    // timer initialization, and the timer is detached before the control
    // block is ever reclaimed
    let cb = unsafe { &*(param as *const ThreadCb) };
    let thread = ThreadRef::from_nonnull(NonNull::from(cb));

    let mut lock = lock_cpu();

    if cb.state.get(&*lock) != ThreadState::Suspend {
        // A waker beat the timer to it.
        return;
    }

    cb.error.replace(&mut *lock, Err(Error::Timeout));

    if cb.schedule_node.is_linked(lock.borrow_mut()) {
        // The wait queue's counter stays inflated here; the timed-out
        // operation re-balances it when it observes the error.
        cb.schedule_node.unlink(lock.borrow_mut());
    }

    cb.state.replace(&mut *lock, ThreadState::Ready);
    readyqueue::push_back(lock.borrow_mut(), thread);
    drop(lock);

    sched::schedule();
}

/// Reclaim defunct dynamic threads. Called from the idle thread, never from
/// an interrupt handler.
pub(crate) fn reap_defunct() {
    loop {
        let mut lock = lock_cpu();
        let Some(elem) = DEFUNCT.pop_front(lock.borrow_mut()) else {
            return;
        };

        let cb = elem.get();
        object::unregister(lock.borrow_mut(), &cb.object);
        let stack_addr = cb.stack_addr.get(&*lock) as *mut u8;
        let stack_size = cb.stack_size.get(&*lock);
        drop(lock);

        // Safety: both allocations were leaked from `Box`es in
        // `Thread::create` and are no longer reachable from any kernel list
        // or the registry
        unsafe {
            drop(Box::from_raw(core::ptr::slice_from_raw_parts_mut(
                stack_addr, stack_size,
            )));
            drop(Box::from_raw(elem.nonnull().as_ptr()));
        }
    }
}

impl Thread {
    fn cb(&self) -> &ThreadCb {
        self.0.cb()
    }

    /// Initialize a thread in caller-owned storage.
    ///
    /// The thread is left in the `Init` state; call [`Thread::startup`] to
    /// make it runnable.
    ///
    /// # Safety
    ///
    /// `stack_addr..stack_addr + stack_size` must be a byte region owned
    /// exclusively by this thread for its entire lifetime.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn init(
        cb: &'static ThreadCb,
        name: &str,
        entry: port::ThreadEntry,
        param: usize,
        stack_addr: *mut u8,
        stack_size: usize,
        priority: u8,
        tick: Tick,
    ) -> Result<Thread> {
        let mut lock = lock_cpu();
        // Safety: forwarded to the caller
        unsafe {
            init_common(
                lock.borrow_mut(),
                cb,
                name,
                entry,
                param,
                stack_addr,
                stack_size,
                priority,
                tick,
                ObjectFlags::STATIC,
            );
        }
        Ok(Thread(ThreadRef(NonNull::from(cb))))
    }

    /// Allocate and initialize a thread and its stack.
    pub fn create(
        name: &str,
        entry: port::ThreadEntry,
        param: usize,
        stack_size: usize,
        priority: u8,
        tick: Tick,
    ) -> Result<Thread> {
        let cb = Box::leak(Box::new(ThreadCb::new()));
        let stack = Box::leak(alloc::vec![0u8; stack_size].into_boxed_slice());

        let mut lock = lock_cpu();
        // Safety: the stack region was just allocated for this thread
        unsafe {
            init_common(
                lock.borrow_mut(),
                cb,
                name,
                entry,
                param,
                stack.as_mut_ptr(),
                stack_size,
                priority,
                tick,
                ObjectFlags::empty(),
            );
        }
        Ok(Thread(ThreadRef(NonNull::from(cb))))
    }

    /// The calling thread.
    pub fn current() -> Option<Thread> {
        let mut lock = lock_cpu();
        sched::running(lock.borrow_mut()).map(Thread)
    }

    /// Find a registered thread by name.
    pub fn find(name: &str) -> Option<Thread> {
        let mut lock = lock_cpu();
        object::find(lock.borrow_mut(), ObjectClass::Thread, name)
            // Safety: objects registered under `ObjectClass::Thread` are
            // always `ThreadCb`s
            .map(|owner| Thread(ThreadRef(unsafe { owner.cast() })))
    }

    /// Make an `Init` thread runnable, through the `Init → Suspend → Ready`
    /// transition.
    pub fn startup(&self) -> Result {
        let mut lock = lock_cpu();

        if self.cb().state.get(&*lock) != ThreadState::Init {
            return Err(Error::Failed);
        }
        self.cb().state.replace(&mut *lock, ThreadState::Suspend);
        resume_locked(lock.borrow_mut(), self.0)?;
        drop(lock);

        sched::schedule();
        Ok(())
    }

    /// Suspend a `Ready` thread. If the target is the calling thread, the
    /// caller must invoke [`schedule`](crate::schedule) afterwards.
    pub fn suspend(&self) -> Result {
        let mut lock = lock_cpu();
        suspend_locked(lock.borrow_mut(), self.0)
    }

    /// Resume a `Suspend` thread. The thread becomes ready but the processor
    /// is not yielded; call [`schedule`](crate::schedule) to let it run.
    pub fn resume(&self) -> Result {
        let mut lock = lock_cpu();
        resume_locked(lock.borrow_mut(), self.0)
    }

    /// Apply a [`ThreadControl`] command.
    pub fn control(&self, cmd: ThreadControl) -> Result {
        match cmd {
            ThreadControl::Startup => self.startup(),
            ThreadControl::ChangePriority(priority) => {
                let mut lock = lock_cpu();
                change_priority_locked(lock.borrow_mut(), self.0, priority);
                drop(lock);
                sched::schedule();
                Ok(())
            }
            ThreadControl::Close => {
                let mut lock = lock_cpu();
                let is_static = self.cb().object.is_static(lock.borrow_mut());
                drop(lock);
                if is_static {
                    self.detach()
                } else {
                    // Safety: `Close` is the owner's request to destroy the
                    // thread; further use of the handle is the caller's
                    // responsibility, as with `delete`
                    unsafe { self.delete() }
                }
            }
        }
    }

    /// Tear down a caller-owned thread. A thread may detach itself, in which
    /// case this never returns.
    pub fn detach(&self) -> Result {
        self.teardown(true)
    }

    /// Tear down a kernel-allocated thread, queueing its storage for
    /// reclamation by the idle thread. A thread may delete itself, in which
    /// case this never returns.
    ///
    /// # Safety
    ///
    /// No other handle to this thread may be used afterwards.
    pub unsafe fn delete(&self) -> Result {
        self.teardown(false)
    }

    fn teardown(&self, expect_static: bool) -> Result {
        let mut lock = lock_cpu();
        let cb = self.cb();

        if cb.object.is_static(lock.borrow_mut()) != expect_static {
            return Err(Error::Failed);
        }

        if sched::running(lock.borrow_mut()) == Some(self.0) {
            drop(lock);
            exit_current();
        }

        match cb.state.get(&*lock) {
            ThreadState::Close => return Err(Error::Failed),
            ThreadState::Ready => readyqueue::remove(lock.borrow_mut(), self.0),
            _ => {
                if cb.schedule_node.is_linked(lock.borrow_mut()) {
                    cb.schedule_node.unlink(lock.borrow_mut());
                }
            }
        }

        cb.state.replace(&mut *lock, ThreadState::Close);
        timer::detach_locked(lock.borrow_mut(), &cb.thread_timer);

        if expect_static {
            object::unregister(lock.borrow_mut(), &cb.object);
        } else {
            DEFUNCT.push_back(lock.borrow_mut(), &cb.schedule_node);
        }
        Ok(())
    }

    /// The thread's current priority.
    pub fn priority(&self) -> u8 {
        let lock = lock_cpu();
        self.cb().priority.get(&*lock).current()
    }

    /// The thread's scheduling state.
    pub fn state(&self) -> ThreadState {
        let lock = lock_cpu();
        self.cb().state.get(&*lock)
    }

    /// The thread's name.
    pub fn name(&self) -> ObjectName {
        self.cb().object.read_name()
    }

    /// The opaque per-thread user word.
    pub fn user_data(&self) -> usize {
        let lock = lock_cpu();
        self.cb().user_data.get(&*lock)
    }

    pub fn set_user_data(&self, value: usize) {
        let mut lock = lock_cpu();
        self.cb().user_data.replace(&mut *lock, value);
    }
}

/// Round-rotate the calling thread within its priority and reschedule.
pub fn yield_now() -> Result {
    let mut lock = lock_cpu();
    let cur = sched::running(lock.borrow_mut()).ok_or(Error::Failed)?;
    readyqueue::rotate(lock.borrow_mut(), cur);
    drop(lock);

    sched::schedule();
    Ok(())
}

/// Put the calling thread to sleep for `ticks` kernel ticks.
pub fn sleep(ticks: Tick) -> Result {
    if ticks == 0 {
        return yield_now();
    }

    let mut lock = lock_cpu();

    if sched::in_isr(lock.borrow_mut()) {
        return Err(Error::Failed);
    }
    let cur = sched::running(lock.borrow_mut()).ok_or(Error::Failed)?;

    suspend_locked(lock.borrow_mut(), cur)?;
    cur.cb().error.replace(&mut *lock, Ok(()));

    timer::set_ticks_locked(lock.borrow_mut(), &cur.cb().thread_timer, ticks);
    timer::start_locked(lock.borrow_mut(), &cur.cb().thread_timer);
    drop(lock);

    sched::schedule();
    Ok(())
}

/// Alias of [`sleep`].
pub fn delay(ticks: Tick) -> Result {
    sleep(ticks)
}
