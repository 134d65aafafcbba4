//! Intrusive circular doubly-linked lists
//!
//! Every schedulable entity embeds its own [`ListNode`]s, so list membership
//! never allocates. The lists are circular with a sentinel node embedded in
//! the [`ListHead`], which makes removal a purely link-local operation, a
//! requirement for the timeout path, which must take a thread off whatever
//! wait queue it is on without knowing which queue that is.
//!
//! A node can be a member of at most one list at a time; inserting a node
//! that is already linked is a fatal error.
//!
//! All link state lives in [`CpuLockCell`]s, so every operation requires the
//! CPU lock token.
use core::{fmt, ptr::NonNull};

use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    utils::Init,
};

/// A reference to an entity that owns a [`ListNode`].
pub(crate) struct ElemRef<T>(NonNull<T>);

// Safety: the pointees are kernel control blocks, which are `Send + Sync`
// (their mutable state is token-gated)
unsafe impl<T> Send for ElemRef<T> {}
unsafe impl<T> Sync for ElemRef<T> {}

impl<T> Clone for ElemRef<T> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl<T> Copy for ElemRef<T> {}

impl<T> PartialEq for ElemRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T> Eq for ElemRef<T> {}

impl<T> fmt::Debug for ElemRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("ElemRef").field(&self.0).finish()
    }
}

impl<T> ElemRef<T> {
    pub(crate) fn new(x: &T) -> Self {
        Self(NonNull::from(x))
    }

    pub(crate) fn nonnull(self) -> NonNull<T> {
        self.0
    }

    /// Dereference the entity.
    ///
    /// All `ElemRef`s reachable through a list refer to live control blocks:
    /// the kernel never destroys a control block while one of its nodes is
    /// linked, and a defunct thread is only reclaimed after it has been
    /// unlinked from everything.
    pub(crate) fn get<'a>(&'a self) -> &'a T {
        // Safety: see above
        unsafe { self.0.as_ref() }
    }
}

/// A reference to a [`ListNode`].
pub(crate) struct NodeRef<T>(NonNull<ListNode<T>>);

// Safety: same as `ElemRef`
unsafe impl<T> Send for NodeRef<T> {}
unsafe impl<T> Sync for NodeRef<T> {}

impl<T> Clone for NodeRef<T> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl<T> Copy for NodeRef<T> {}

impl<T> PartialEq for NodeRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T> Eq for NodeRef<T> {}

impl<T> fmt::Debug for NodeRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("NodeRef").field(&self.0).finish()
    }
}

impl<T> NodeRef<T> {
    fn node<'a>(&'a self) -> &'a ListNode<T> {
        // Safety: linked nodes are extant; see `ElemRef::get`
        unsafe { self.0.as_ref() }
    }

    /// The entity owning the pointed-to node.
    pub(crate) fn elem(&self, lock: CpuLockTokenRefMut<'_>) -> ElemRef<T> {
        self.node().owner(lock)
    }
}

/// The neighbor links of a linked node.
struct Links<T> {
    prev: NodeRef<T>,
    next: NodeRef<T>,
}

impl<T> Clone for Links<T> {
    fn clone(&self) -> Self {
        Self {
            prev: self.prev,
            next: self.next,
        }
    }
}

impl<T> Copy for Links<T> {}

/// A list membership node, embedded in the owning entity.
///
/// `links` is `None` iff the node is not a member of any list (for a
/// sentinel: iff the list has never contained an element; an emptied list
/// leaves the sentinel self-linked).
pub(crate) struct ListNode<T> {
    links: CpuLockCell<Option<Links<T>>>,

    /// Backreference to the owning entity. `None` only for sentinels and
    /// nodes whose owner has not been initialized yet.
    owner: CpuLockCell<Option<ElemRef<T>>>,
}

impl<T> Init for ListNode<T> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        links: CpuLockCell::new(None),
        owner: CpuLockCell::new(None),
    };
}

impl<T> ListNode<T> {
    pub(crate) const fn new() -> Self {
        Self {
            links: CpuLockCell::new(None),
            owner: CpuLockCell::new(None),
        }
    }

    /// Record the owning entity. Called once when the entity is initialized.
    pub(crate) fn set_owner(&self, mut lock: CpuLockTokenRefMut<'_>, owner: ElemRef<T>) {
        self.owner.replace(&mut *lock, Some(owner));
    }

    pub(crate) fn owner(&self, lock: CpuLockTokenRefMut<'_>) -> ElemRef<T> {
        self.owner.get(&*lock).expect("node has no owner")
    }

    pub(crate) fn is_linked(&self, lock: CpuLockTokenRefMut<'_>) -> bool {
        self.links.read(&*lock).is_some()
    }

    fn node_ref(&self) -> NodeRef<T> {
        NodeRef(NonNull::from(self))
    }

    /// Remove this node from the list containing it. Link-local; does not
    /// require access to the list head.
    pub(crate) fn unlink(&self, mut lock: CpuLockTokenRefMut<'_>) {
        let links = self
            .links
            .replace(&mut *lock, None)
            .expect("unlinking a node that is not linked");

        links
            .prev
            .node()
            .links
            .write(&mut *lock)
            .as_mut()
            .unwrap()
            .next = links.next;
        links
            .next
            .node()
            .links
            .write(&mut *lock)
            .as_mut()
            .unwrap()
            .prev = links.prev;
    }
}

/// The head of an intrusive list: a sentinel [`ListNode`] with no owner.
pub(crate) struct ListHead<T> {
    sentinel: ListNode<T>,
}

impl<T> Init for ListHead<T> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        sentinel: ListNode::INIT,
    };
}

impl<T> ListHead<T> {
    pub(crate) const fn new() -> Self {
        Self {
            sentinel: ListNode::new(),
        }
    }

    fn sentinel_ref(&self) -> NodeRef<T> {
        self.sentinel.node_ref()
    }

    pub(crate) fn is_empty(&self, lock: CpuLockTokenRefMut<'_>) -> bool {
        match *self.sentinel.links.read(&*lock) {
            None => true,
            Some(links) => links.next == self.sentinel_ref(),
        }
    }

    /// The node of the first element, or `None` if the list is empty.
    pub(crate) fn first(&self, mut lock: CpuLockTokenRefMut<'_>) -> Option<NodeRef<T>> {
        if self.is_empty(lock.borrow_mut()) {
            None
        } else {
            Some(self.sentinel.links.read(&*lock).unwrap().next)
        }
    }

    /// The node following `node`, or `None` if `node` is the last element.
    pub(crate) fn next(
        &self,
        lock: CpuLockTokenRefMut<'_>,
        node: NodeRef<T>,
    ) -> Option<NodeRef<T>> {
        let next = node.node().links.read(&*lock).expect("node is not linked").next;
        if next == self.sentinel_ref() {
            None
        } else {
            Some(next)
        }
    }

    /// The first element, or `None` if the list is empty.
    pub(crate) fn front(&self, mut lock: CpuLockTokenRefMut<'_>) -> Option<ElemRef<T>> {
        self.first(lock.borrow_mut())
            .map(|node| node.node().owner(lock))
    }

    /// Append `node` at the tail.
    pub(crate) fn push_back(&self, mut lock: CpuLockTokenRefMut<'_>, node: &ListNode<T>) {
        self.insert_before(lock.borrow_mut(), self.sentinel_ref(), node);
    }

    /// Prepend `node` at the head.
    pub(crate) fn push_front(&self, mut lock: CpuLockTokenRefMut<'_>, node: &ListNode<T>) {
        match self.first(lock.borrow_mut()) {
            Some(first) => self.insert_before(lock.borrow_mut(), first, node),
            None => self.insert_before(lock.borrow_mut(), self.sentinel_ref(), node),
        }
    }

    /// Insert `node` before the position `at` (which may be the sentinel to
    /// insert at the tail).
    pub(crate) fn insert_before(
        &self,
        mut lock: CpuLockTokenRefMut<'_>,
        at: NodeRef<T>,
        node: &ListNode<T>,
    ) {
        assert!(
            node.links.read(&*lock).is_none(),
            "inserting a node that is already linked"
        );

        let sentinel = self.sentinel_ref();

        // Normalize a never-used sentinel into the self-linked empty form.
        if self.sentinel.links.read(&*lock).is_none() {
            self.sentinel.links.replace(
                &mut *lock,
                Some(Links {
                    prev: sentinel,
                    next: sentinel,
                }),
            );
        }

        let prev = at.node().links.read(&*lock).unwrap().prev;
        let new = node.node_ref();

        prev.node().links.write(&mut *lock).as_mut().unwrap().next = new;
        at.node().links.write(&mut *lock).as_mut().unwrap().prev = new;
        node.links.replace(&mut *lock, Some(Links { prev, next: at }));
    }

    /// Unlink and return the first element.
    pub(crate) fn pop_front(&self, mut lock: CpuLockTokenRefMut<'_>) -> Option<ElemRef<T>> {
        let first = self.first(lock.borrow_mut())?;
        let owner = first.node().owner(lock.borrow_mut());
        first.node().unlink(lock);
        Some(owner)
    }

    /// Count the elements. O(n); used by assertions and tests.
    #[allow(dead_code)]
    pub(crate) fn len(&self, mut lock: CpuLockTokenRefMut<'_>) -> usize {
        let mut n = 0;
        let mut cur = self.first(lock.borrow_mut());
        while let Some(node) = cur {
            n += 1;
            cur = self.next(lock.borrow_mut(), node);
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klock::tests_util::fabricate_token;
    use quickcheck_macros::quickcheck;
    use std::collections::VecDeque;

    struct Entity {
        id: usize,
        node: ListNode<Entity>,
    }

    fn new_entity(id: usize) -> &'static Entity {
        let entity = Box::leak(Box::new(Entity {
            id,
            node: ListNode::new(),
        }));
        entity
    }

    /// A modifying operation on a list.
    #[derive(Debug)]
    enum Cmd {
        PushBack(usize),
        PushFront(usize),
        PopFront,
        RemoveNth(usize),
    }

    /// Map random bytes to operations on a list.
    fn interpret(bytecode: &[u8]) -> impl Iterator<Item = Cmd> + '_ {
        let mut i = 0;
        let mut next_id = 0;
        let mut len = 0usize;
        std::iter::from_fn(move || {
            if let Some(instr) = bytecode.get(i..i + 2) {
                i += 2;
                Some(match instr[0] % 4 {
                    0 => {
                        next_id += 1;
                        len += 1;
                        Cmd::PushBack(next_id)
                    }
                    1 => {
                        next_id += 1;
                        len += 1;
                        Cmd::PushFront(next_id)
                    }
                    2 if len > 0 => {
                        len -= 1;
                        Cmd::PopFront
                    }
                    _ if len > 0 => {
                        len -= 1;
                        Cmd::RemoveNth(instr[1] as usize % (len + 1))
                    }
                    _ => {
                        next_id += 1;
                        len += 1;
                        Cmd::PushBack(next_id)
                    }
                })
            } else {
                None
            }
        })
    }

    fn enum_ids(
        head: &ListHead<Entity>,
        mut lock: CpuLockTokenRefMut<'_>,
    ) -> Vec<usize> {
        let mut ids = Vec::new();
        let mut cur = head.first(lock.borrow_mut());
        while let Some(node) = cur {
            ids.push(node.node().owner(lock.borrow_mut()).get().id);
            cur = head.next(lock.borrow_mut(), node);
        }
        ids
    }

    #[quickcheck]
    fn matches_vecdeque_oracle(bytecode: Vec<u8>) {
        // Safety: the token is only used on the list created below, which no
        // other test can reach
        let mut token = unsafe { fabricate_token() };
        let head = Box::leak(Box::new(ListHead::<Entity>::new()));
        let mut oracle: VecDeque<(&'static Entity, usize)> = VecDeque::new();

        for cmd in interpret(&bytecode) {
            match cmd {
                Cmd::PushBack(id) => {
                    let e = new_entity(id);
                    e.node.set_owner(token.borrow_mut(), ElemRef::new(e));
                    head.push_back(token.borrow_mut(), &e.node);
                    oracle.push_back((e, id));
                }
                Cmd::PushFront(id) => {
                    let e = new_entity(id);
                    e.node.set_owner(token.borrow_mut(), ElemRef::new(e));
                    head.push_front(token.borrow_mut(), &e.node);
                    oracle.push_front((e, id));
                }
                Cmd::PopFront => {
                    let got = head.pop_front(token.borrow_mut());
                    let want = oracle.pop_front();
                    assert_eq!(
                        got.map(|e| e.get().id),
                        want.map(|(_, id)| id),
                    );
                    if let Some((e, _)) = want {
                        assert!(!e.node.is_linked(token.borrow_mut()));
                    }
                }
                Cmd::RemoveNth(n) => {
                    let (e, _) = oracle.remove(n).unwrap();
                    e.node.unlink(token.borrow_mut());
                    assert!(!e.node.is_linked(token.borrow_mut()));
                }
            }

            assert_eq!(
                enum_ids(head, token.borrow_mut()),
                oracle.iter().map(|(_, id)| *id).collect::<Vec<_>>(),
            );
            assert_eq!(head.len(token.borrow_mut()), oracle.len());
            assert_eq!(head.is_empty(token.borrow_mut()), oracle.is_empty());
        }
    }

    #[test]
    fn emptied_list_is_reusable() {
        // Safety: see above
        let mut token = unsafe { fabricate_token() };
        let head = ListHead::<Entity>::new();
        let a = new_entity(1);
        a.node.set_owner(token.borrow_mut(), ElemRef::new(a));

        for _ in 0..3 {
            head.push_back(token.borrow_mut(), &a.node);
            assert!(a.node.is_linked(token.borrow_mut()));
            assert_eq!(head.front(token.borrow_mut()).unwrap().get().id, 1);
            a.node.unlink(token.borrow_mut());
            assert!(head.is_empty(token.borrow_mut()));
        }
    }
}
