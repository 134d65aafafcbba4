//! Named kernel objects and the object registry
//!
//! Every kernel entity (thread, timer, IPC object) embeds a [`KernelObject`]
//! header by composition and registers itself in a per-class container, which
//! gives it a bounded name, a class tag, the FIFO/priority flag byte, and
//! `find`-by-name support.
use arrayvec::ArrayString;
use core::ptr::NonNull;

use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    utils::{
        intrusive_list::{ElemRef, ListHead, ListNode},
        Init,
    },
};

/// The maximum length of an object name, in bytes.
pub const NAME_LEN: usize = 8;

/// A bounded object name.
pub type ObjectName = ArrayString<NAME_LEN>;

/// The class tag carried by every kernel object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectClass {
    Thread = 0,
    Timer,
    Semaphore,
    Mutex,
    Event,
    Mailbox,
    MessageQueue,
}

const CLASS_COUNT: usize = 7;

bitflags::bitflags! {
    /// The flag byte of a kernel object.
    pub(crate) struct ObjectFlags: u8 {
        /// Bit 0: the object's wait queue is priority-ordered rather than
        /// FIFO.
        const PRIORITY = 1 << 0;

        /// The object lives in caller-owned storage (`init`/`detach`
        /// lifecycle) rather than kernel-allocated storage
        /// (`create`/`delete`).
        const STATIC = 1 << 7;
    }
}

impl Init for ObjectFlags {
    const INIT: Self = ObjectFlags::empty();
}

/// A type-erased reference to the control block owning a [`KernelObject`].
#[derive(Clone, Copy)]
pub(crate) struct OwnerRef(NonNull<()>);

// Safety: control blocks are `Send + Sync`
unsafe impl Send for OwnerRef {}
unsafe impl Sync for OwnerRef {}

impl OwnerRef {
    pub(crate) fn new<T>(owner: NonNull<T>) -> Self {
        Self(owner.cast())
    }

    /// Recover the owning control block.
    ///
    /// # Safety
    ///
    /// `T` must be the control block type matching the object's class tag.
    /// The class tag ↔ control block type correspondence is a kernel
    /// invariant maintained by `register`'s callers.
    pub(crate) unsafe fn cast<T>(self) -> NonNull<T> {
        self.0.cast()
    }
}

/// The header embedded in every kernel object.
pub struct KernelObject {
    name: CpuLockCell<Option<ObjectName>>,
    class: CpuLockCell<Option<ObjectClass>>,
    flags: CpuLockCell<ObjectFlags>,
    owner: CpuLockCell<Option<OwnerRef>>,

    /// Membership in the per-class registry container.
    link: ListNode<KernelObject>,
}

impl Init for KernelObject {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        name: CpuLockCell::new(None),
        class: CpuLockCell::new(None),
        flags: CpuLockCell::new(ObjectFlags::empty()),
        owner: CpuLockCell::new(None),
        link: ListNode::INIT,
    };
}

impl KernelObject {
    pub(crate) const fn new() -> Self {
        Self {
            name: CpuLockCell::new(None),
            class: CpuLockCell::new(None),
            flags: CpuLockCell::new(ObjectFlags::empty()),
            owner: CpuLockCell::new(None),
            link: ListNode::new(),
        }
    }

    pub(crate) fn is_static(&self, lock: CpuLockTokenRefMut<'_>) -> bool {
        self.flags.get(&*lock).contains(ObjectFlags::STATIC)
    }

    pub(crate) fn name(&self, lock: CpuLockTokenRefMut<'_>) -> ObjectName {
        self.name.get(&*lock).unwrap_or_default()
    }

    /// Read the object's name, entering a critical section.
    pub fn read_name(&self) -> ObjectName {
        let mut lock = crate::klock::lock_cpu();
        self.name(lock.borrow_mut())
    }
}

/// The per-class containers of registered objects.
static CONTAINERS: [ListHead<KernelObject>; CLASS_COUNT] = [
    ListHead::new(),
    ListHead::new(),
    ListHead::new(),
    ListHead::new(),
    ListHead::new(),
    ListHead::new(),
    ListHead::new(),
];

/// Truncate `name` to [`NAME_LEN`] bytes at a character boundary.
pub(crate) fn name_from_str(name: &str) -> ObjectName {
    let mut out = ObjectName::new();
    for c in name.chars() {
        if out.try_push(c).is_err() {
            break;
        }
    }
    out
}

/// Fill in an object header and link it into its class container.
pub(crate) fn register<T>(
    mut lock: CpuLockTokenRefMut<'_>,
    object: &KernelObject,
    class: ObjectClass,
    name: &str,
    flags: ObjectFlags,
    owner: NonNull<T>,
) {
    assert!(
        object.class.read(&*lock).is_none(),
        "object is already registered"
    );

    object.name.replace(&mut *lock, Some(name_from_str(name)));
    object.class.replace(&mut *lock, Some(class));
    object.flags.replace(&mut *lock, flags);
    object.owner.replace(&mut *lock, Some(OwnerRef::new(owner)));
    object
        .link
        .set_owner(lock.borrow_mut(), ElemRef::new(object));

    CONTAINERS[class as usize].push_back(lock, &object.link);
}

/// Unlink an object from its class container and clear the header, returning
/// it to the pre-`register` state.
pub(crate) fn unregister(mut lock: CpuLockTokenRefMut<'_>, object: &KernelObject) {
    assert!(
        object.class.read(&*lock).is_some(),
        "object is not registered"
    );

    object.link.unlink(lock.borrow_mut());
    object.name.replace(&mut *lock, None);
    object.class.replace(&mut *lock, None);
    object.owner.replace(&mut *lock, None);
    object.flags.replace(&mut *lock, ObjectFlags::empty());
}

/// Find a registered object by class and name, returning the owning control
/// block reference.
pub(crate) fn find(
    mut lock: CpuLockTokenRefMut<'_>,
    class: ObjectClass,
    name: &str,
) -> Option<OwnerRef> {
    let wanted = name_from_str(name);
    let container = &CONTAINERS[class as usize];

    let mut cur = container.first(lock.borrow_mut());
    while let Some(node) = cur {
        cur = container.next(lock.borrow_mut(), node);

        let object = node.elem(lock.borrow_mut());
        let object = object.get();
        if object.name.get(&*lock) == Some(wanted) {
            return object.owner.get(&*lock);
        }
    }
    None
}
