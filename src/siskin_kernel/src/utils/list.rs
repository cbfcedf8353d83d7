//! Intrusive doubly linked lists with owner back-pointers.
//!
//! Nodes are embedded in kernel objects living in static pools, so moving an
//! object between lists is a constant-time pointer splice with no allocation.
//! Each linked node records the list it currently sits on; this makes
//! membership tests cheap and lets a node be detached without naming its
//! list. A node belongs to at most one list at a time.
//!
//! The lists are circular and headed by a `first` pointer, and every link
//! word lives in a [`CpuLockCell`], so no structure is readable or writable
//! without the CPU lock.
use core::{fmt, ptr::NonNull};

use crate::{
    klock::{CpuLockCell, CpuLockTokenRef, CpuLockTokenRefMut},
    utils::Init,
    PortThreading,
};

/// A reference to a list node. Compares by identity.
pub(crate) struct NodeRef<T>(NonNull<T>);

// Safety: `NodeRef` only ever points into static object pools
unsafe impl<T> Send for NodeRef<T> {}
unsafe impl<T> Sync for NodeRef<T> {}

impl<T> NodeRef<T> {
    pub(crate) fn new(r: &'static T) -> Self {
        Self(NonNull::from(r))
    }

    /// Get the pointee.
    ///
    /// Sound because nodes live in static pools: the pointee can never move
    /// or be deallocated.
    pub(crate) fn get(self) -> &'static T {
        unsafe { self.0.as_ref() }
    }

    pub(crate) fn ptr_eq(self, other: &T) -> bool {
        core::ptr::eq(self.0.as_ptr(), other)
    }
}

impl<T> Clone for NodeRef<T> {
    fn clone(&self) -> Self {
        *self
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

/// Circular linked list header.
pub(crate) struct ListHead<T> {
    pub(crate) first: Option<NodeRef<T>>,
}

impl<T> Clone for ListHead<T> {
    fn clone(&self) -> Self {
        Self { first: self.first }
    }
}
impl<T> Copy for ListHead<T> {}

impl<T> Init for ListHead<T> {
    const INIT: Self = Self { first: None };
}

/// The cell a list head lives in.
pub(crate) type HeadCell<Traits, T> = CpuLockCell<Traits, ListHead<T>>;

/// A reference to a list head cell: the owner back-pointer stored in every
/// linked node. Compares by identity.
pub(crate) struct HeadRef<Traits, T>(NonNull<HeadCell<Traits, T>>);

// Safety: `HeadRef` only ever points at statically allocated list heads
unsafe impl<Traits, T> Send for HeadRef<Traits, T> {}
unsafe impl<Traits, T> Sync for HeadRef<Traits, T> {}

impl<Traits, T> HeadRef<Traits, T> {
    pub(crate) fn new(cell: &'static HeadCell<Traits, T>) -> Self {
        Self(NonNull::from(cell))
    }

    fn get(self) -> &'static HeadCell<Traits, T> {
        // Safety: list heads are statically allocated
        unsafe { self.0.as_ref() }
    }
}

impl<Traits, T> Clone for HeadRef<Traits, T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits, T> Copy for HeadRef<Traits, T> {}

impl<Traits, T> PartialEq for HeadRef<Traits, T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<Traits, T> Eq for HeadRef<Traits, T> {}

impl<Traits, T> fmt::Debug for HeadRef<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("HeadRef").field(&self.0).finish()
    }
}

/// Links to the neighbor nodes plus the owning list.
pub(crate) struct Link<Traits, T> {
    prev: NodeRef<T>,
    next: NodeRef<T>,
    owner: HeadRef<Traits, T>,
}

impl<Traits, T> Clone for Link<Traits, T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits, T> Copy for Link<Traits, T> {}

/// Implemented by objects that embed a list node.
pub(crate) trait ListNode<Traits: PortThreading>: Sized + 'static {
    fn link(&self) -> &CpuLockCell<Traits, Option<Link<Traits, Self>>>;
}

/// The list a node currently sits on, if any.
pub(crate) fn owner_of<Traits: PortThreading, T: ListNode<Traits>>(
    node: &T,
    lock: CpuLockTokenRef<'_, Traits>,
) -> Option<HeadRef<Traits, T>> {
    node.link().get(&*lock).map(|link| link.owner)
}

/// `true` iff the node sits on any list.
pub(crate) fn is_linked<Traits: PortThreading, T: ListNode<Traits>>(
    node: &T,
    lock: CpuLockTokenRef<'_, Traits>,
) -> bool {
    node.link().read(&*lock).is_some()
}

pub(crate) fn first<Traits: PortThreading, T: ListNode<Traits>>(
    head: HeadRef<Traits, T>,
    lock: CpuLockTokenRef<'_, Traits>,
) -> Option<NodeRef<T>> {
    head.get().read(&*lock).first
}

/// The node after `node`, or `None` once the iteration wraps around.
pub(crate) fn next<Traits: PortThreading, T: ListNode<Traits>>(
    head: HeadRef<Traits, T>,
    node: NodeRef<T>,
    lock: CpuLockTokenRef<'_, Traits>,
) -> Option<NodeRef<T>> {
    let link = node.get().link().get(&*lock).expect("node not linked");
    debug_assert_eq!(link.owner, head);
    let n = link.next;
    if Some(n) == head.get().read(&*lock).first {
        None
    } else {
        Some(n)
    }
}

/// `true` iff the list holds at least `n` nodes. Constant-time for small `n`.
pub(crate) fn holds_at_least<Traits: PortThreading, T: ListNode<Traits>>(
    head: HeadRef<Traits, T>,
    n: usize,
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> bool {
    let mut cursor = first(head, lock.borrow());
    let mut seen = 0;
    while let Some(node) = cursor {
        seen += 1;
        if seen >= n {
            return true;
        }
        cursor = next(head, node, lock.borrow());
    }
    n == 0
}

/// Append the node at the back.
///
/// Panics if the node is already linked somewhere; callers detach first (or
/// use [`transfer`]).
pub(crate) fn push_back<Traits: PortThreading, T: ListNode<Traits>>(
    head: HeadRef<Traits, T>,
    node: &'static T,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    assert!(node.link().read(&*lock).is_none(), "node already linked");

    let node_ref = NodeRef::new(node);
    let head_state = *head.get().read(&*lock);

    if let Some(first) = head_state.first {
        let last = first.get().link().get(&*lock).expect("corrupt list").prev;
        write_neighbor(last, |l| l.next = node_ref, lock.borrow_mut());
        write_neighbor(first, |l| l.prev = node_ref, lock.borrow_mut());
        node.link().replace(
            &mut *lock,
            Some(Link {
                prev: last,
                next: first,
                owner: head,
            }),
        );
    } else {
        node.link().replace(
            &mut *lock,
            Some(Link {
                prev: node_ref,
                next: node_ref,
                owner: head,
            }),
        );
        head.get().replace(
            &mut *lock,
            ListHead {
                first: Some(node_ref),
            },
        );
    }
}

/// Insert the node in sorted position: immediately before the first existing
/// node for which `is_before(new, existing)` holds. Ties therefore preserve
/// insertion order.
pub(crate) fn insert_sorted<Traits: PortThreading, T: ListNode<Traits>>(
    head: HeadRef<Traits, T>,
    node: &'static T,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    is_before: impl Fn(&T, &T, CpuLockTokenRef<'_, Traits>) -> bool,
) {
    let mut at = first(head, lock.borrow());
    while let Some(existing) = at {
        if is_before(node, existing.get(), lock.borrow()) {
            break;
        }
        at = next(head, existing, lock.borrow());
    }

    match at {
        None => push_back(head, node, lock),
        Some(existing) => {
            assert!(node.link().read(&*lock).is_none(), "node already linked");
            let node_ref = NodeRef::new(node);
            let prev = existing.get().link().get(&*lock).expect("corrupt list").prev;
            write_neighbor(prev, |l| l.next = node_ref, lock.borrow_mut());
            write_neighbor(existing, |l| l.prev = node_ref, lock.borrow_mut());
            node.link().replace(
                &mut *lock,
                Some(Link {
                    prev,
                    next: existing,
                    owner: head,
                }),
            );
            if head.get().read(&*lock).first == Some(existing) {
                head.get().replace(
                    &mut *lock,
                    ListHead {
                        first: Some(node_ref),
                    },
                );
            }
        }
    }
}

/// Insert the node immediately before `before`, which must be linked on
/// this list.
pub(crate) fn insert_before<Traits: PortThreading, T: ListNode<Traits>>(
    head: HeadRef<Traits, T>,
    node: &'static T,
    before: NodeRef<T>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    assert!(node.link().read(&*lock).is_none(), "node already linked");
    let node_ref = NodeRef::new(node);
    let prev = before.get().link().get(&*lock).expect("corrupt list").prev;
    write_neighbor(prev, |l| l.next = node_ref, lock.borrow_mut());
    write_neighbor(before, |l| l.prev = node_ref, lock.borrow_mut());
    node.link().replace(
        &mut *lock,
        Some(Link {
            prev,
            next: before,
            owner: head,
        }),
    );
    if head.get().read(&*lock).first == Some(before) {
        head.get().replace(
            &mut *lock,
            ListHead {
                first: Some(node_ref),
            },
        );
    }
}

/// Detach the node from whatever list it sits on. Returns `false` if it was
/// not linked.
pub(crate) fn remove<Traits: PortThreading, T: ListNode<Traits>>(
    node: &T,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) -> bool {
    let Some(link) = *node.link().read(&*lock) else {
        return false;
    };
    let head = link.owner;

    if link.next.ptr_eq(node) {
        // The node links to itself: the list just became empty
        head.get().replace(&mut *lock, ListHead { first: None });
    } else {
        write_neighbor(link.prev, |l| l.next = link.next, lock.borrow_mut());
        write_neighbor(link.next, |l| l.prev = link.prev, lock.borrow_mut());
        let first = head.get().read(&*lock).first;
        if let Some(f) = first {
            if f.ptr_eq(node) {
                head.get().replace(
                    &mut *lock,
                    ListHead {
                        first: Some(link.next),
                    },
                );
            }
        }
    }

    node.link().replace(&mut *lock, None);
    true
}

/// Detach the node from its current list (if any) and append it to `to`.
pub(crate) fn transfer<Traits: PortThreading, T: ListNode<Traits>>(
    node: &'static T,
    to: HeadRef<Traits, T>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    remove(node, lock.borrow_mut());
    push_back(to, node, lock);
}

/// Detach the node from its current list (if any) and insert it into `to` in
/// sorted position.
pub(crate) fn transfer_sorted<Traits: PortThreading, T: ListNode<Traits>>(
    node: &'static T,
    to: HeadRef<Traits, T>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    is_before: impl Fn(&T, &T, CpuLockTokenRef<'_, Traits>) -> bool,
) {
    remove(node, lock.borrow_mut());
    insert_sorted(to, node, lock, is_before);
}

fn write_neighbor<Traits: PortThreading, T: ListNode<Traits>>(
    node: NodeRef<T>,
    f: impl FnOnce(&mut Link<Traits, T>),
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    let cell = node.get().link();
    let mut link = cell.get(&*lock).expect("corrupt list");
    f(&mut link);
    cell.replace(&mut *lock, Some(link));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klock;
    use crate::utils::Init;

    struct Item<Traits: PortThreading> {
        value: i16,
        link: CpuLockCell<Traits, Option<Link<Traits, Self>>>,
    }

    impl<Traits: PortThreading> ListNode<Traits> for Item<Traits> {
        fn link(&self) -> &CpuLockCell<Traits, Option<Link<Traits, Self>>> {
            &self.link
        }
    }

    fn item<Traits: PortThreading>(value: i16) -> &'static Item<Traits> {
        Box::leak(Box::new(Item {
            value,
            link: CpuLockCell::new(None),
        }))
    }

    fn head<Traits: PortThreading>() -> HeadRef<Traits, Item<Traits>> {
        HeadRef::new(Box::leak(Box::new(HeadCell::<Traits, _>::INIT)))
    }

    fn collect<Traits: PortThreading>(
        h: HeadRef<Traits, Item<Traits>>,
        lock: &mut klock::CpuLockGuard<Traits>,
    ) -> Vec<i16> {
        let mut out = Vec::new();
        let mut cursor = first(h, lock.borrow_mut().borrow());
        while let Some(node) = cursor {
            out.push(node.get().value);
            cursor = next(h, node, lock.borrow_mut().borrow());
        }
        out
    }

    crate::test_utils::mock_port!(PushPort);

    #[test]
    fn push_back_preserves_order() {
        let h = head::<PushPort>();
        let mut lock = klock::lock_cpu::<PushPort>().unwrap();
        for v in [3, 1, 2] {
            push_back(h, item(v), lock.borrow_mut());
        }
        assert_eq!(collect(h, &mut lock), vec![3, 1, 2]);
        assert!(holds_at_least(h, 3, lock.borrow_mut()));
        assert!(!holds_at_least(h, 4, lock.borrow_mut()));
    }

    crate::test_utils::mock_port!(SortPort);

    #[test]
    fn sorted_insert_is_stable() {
        let h = head::<SortPort>();
        let mut lock = klock::lock_cpu::<SortPort>().unwrap();
        let by_value = |new: &Item<SortPort>,
                        old: &Item<SortPort>,
                        _: CpuLockTokenRef<'_, SortPort>| new.value < old.value;
        let first_five = item(5);
        for it in [item(7), first_five, item(5), item(1), item(9)] {
            insert_sorted(h, it, lock.borrow_mut(), by_value);
        }
        assert_eq!(collect(h, &mut lock), vec![1, 5, 5, 7, 9]);
        // The earlier 5 stays ahead of the later one
        let second = next(h, first(h, lock.borrow_mut().borrow()).unwrap(), lock.borrow_mut().borrow());
        assert!(second.unwrap().ptr_eq(first_five));
    }

    crate::test_utils::mock_port!(RemovePort);

    #[test]
    fn remove_and_transfer_update_owner() {
        let a = head::<RemovePort>();
        let b = head::<RemovePort>();
        let mut lock = klock::lock_cpu::<RemovePort>().unwrap();
        let x = item(10);
        let y = item(20);
        push_back(a, x, lock.borrow_mut());
        push_back(a, y, lock.borrow_mut());

        assert_eq!(owner_of(x, lock.borrow_mut().borrow()), Some(a));
        transfer(x, b, lock.borrow_mut());
        assert_eq!(owner_of(x, lock.borrow_mut().borrow()), Some(b));
        assert_eq!(collect(a, &mut lock), vec![20]);
        assert_eq!(collect(b, &mut lock), vec![10]);

        assert!(remove(y, lock.borrow_mut()));
        assert!(!remove(y, lock.borrow_mut()));
        assert!(collect(a, &mut lock).is_empty());
        assert!(!is_linked(y, lock.borrow_mut().borrow()));
    }

    crate::test_utils::mock_port!(BackPort);

    #[quickcheck_macros::quickcheck]
    fn every_linked_node_points_back_at_its_list(values: Vec<i16>) -> bool {
        // A fresh head per run; nodes are leaked statics
        let h = head::<BackPort>();
        let mut lock = klock::lock_cpu::<BackPort>().unwrap();
        let by_value = |new: &Item<BackPort>,
                        old: &Item<BackPort>,
                        _: CpuLockTokenRef<'_, BackPort>| new.value < old.value;
        let mut ok = true;
        for v in &values {
            insert_sorted(h, item(*v), lock.borrow_mut(), by_value);
        }
        let mut cursor = first(h, lock.borrow_mut().borrow());
        let mut sorted = Vec::new();
        while let Some(node) = cursor {
            ok &= owner_of(node.get(), lock.borrow_mut().borrow()) == Some(h);
            sorted.push(node.get().value);
            cursor = next(h, node, lock.borrow_mut().borrow());
        }
        let mut expected = values;
        expected.sort();
        ok && sorted == expected
    }
}
