//! The timer wheel: timed events and the kernel clock.
//!
//! Active timeout nodes form a delta-encoded list ordered by remaining
//! time: each node stores the gap to its predecessor, so the hardware tick
//! only ever decrements the head. Expired *internal* nodes (one per task,
//! re-armed across successive blocking calls) wake their owning task with
//! the timeout postcode right away; expired *timer* nodes are flagged for
//! the housekeeping thread, which runs the user callback outside the
//! critical section.
use crate::{
    error,
    klock::{self, CpuLockCell, CpuLockTokenRef, CpuLockTokenRefMut},
    kthread, sched,
    task::TaskCb,
    timer::TimerCb,
    utils::list::{self, HeadCell, HeadRef, Link, ListNode, NodeRef},
    utils::Init,
    KernelTraits, PortThreading,
};

/// Whose clock a timeout node drives.
pub(crate) enum TimeoutKind<Traits: PortThreading> {
    /// Not yet bound.
    Unbound,
    /// The internal timeout of a blocked task.
    Task(NodeRef<TaskCb<Traits>>),
    /// A free-standing user timer.
    Timer(NodeRef<TimerCb<Traits>>),
}

impl<Traits: PortThreading> Clone for TimeoutKind<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for TimeoutKind<Traits> {}

impl<Traits: PortThreading> Init for TimeoutKind<Traits> {
    const INIT: Self = Self::Unbound;
}

/// A timeout node: membership in the wheel plus the delta to its
/// predecessor.
pub struct TimeoutNode<Traits: PortThreading> {
    link: CpuLockCell<Traits, Option<Link<Traits, Self>>>,
    delta_us: CpuLockCell<Traits, u64>,
    pub(crate) kind: CpuLockCell<Traits, TimeoutKind<Traits>>,
}

impl<Traits: PortThreading> Init for TimeoutNode<Traits> {
    const INIT: Self = Self {
        link: Init::INIT,
        delta_us: Init::INIT,
        kind: Init::INIT,
    };
}

impl<Traits: PortThreading> ListNode<Traits> for TimeoutNode<Traits> {
    fn link(&self) -> &CpuLockCell<Traits, Option<Link<Traits, Self>>> {
        &self.link
    }
}

/// A kernel-global state for timed event management.
pub(crate) struct TimeoutGlobals<Traits: PortThreading> {
    /// The delta-encoded wheel of armed timeout nodes.
    wheel: HeadCell<Traits, TimeoutNode<Traits>>,

    /// Microseconds elapsed since boot.
    total_us: CpuLockCell<Traits, u64>,
}

impl<Traits: PortThreading> Init for TimeoutGlobals<Traits> {
    const INIT: Self = Self {
        wheel: Init::INIT,
        total_us: Init::INIT,
    };
}

fn wheel<Traits: KernelTraits>() -> HeadRef<Traits, TimeoutNode<Traits>> {
    HeadRef::new(&Traits::state().timeout.wheel)
}

/// Monotonic milliseconds since boot.
pub(crate) fn total_ms<Traits: KernelTraits>(lock: CpuLockTokenRef<'_, Traits>) -> u32 {
    (*Traits::state().timeout.total_us.read(&*lock) / 1000) as u32
}

/// Monotonic microseconds since boot.
pub(crate) fn total_us<Traits: KernelTraits>(lock: CpuLockTokenRef<'_, Traits>) -> u64 {
    *Traits::state().timeout.total_us.read(&*lock)
}

/// Bind a task's internal timeout node to its owner. Done once at thread
/// creation.
pub(crate) fn bind_to_task<Traits: KernelTraits>(
    node: &TimeoutNode<Traits>,
    task: &'static TaskCb<Traits>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    node.kind
        .replace(&mut *lock, TimeoutKind::Task(NodeRef::new(task)));
}

/// Bind a timer's timeout node to its control block. Done once at timer
/// creation.
pub(crate) fn bind_to_timer<Traits: KernelTraits>(
    node: &TimeoutNode<Traits>,
    timer: &'static TimerCb<Traits>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    node.kind
        .replace(&mut *lock, TimeoutKind::Timer(NodeRef::new(timer)));
}

/// Arm the node to expire in `ms` milliseconds, inserting it in sorted
/// position. A node whose remaining time is already zero fires on the next
/// tick, not immediately.
pub(crate) fn set<Traits: KernelTraits>(
    node: &'static TimeoutNode<Traits>,
    ms: u32,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    remove(node, lock.borrow_mut());

    let target_us = ms as u64 * 1000;
    let head = wheel::<Traits>();

    let mut acc: u64 = 0;
    let mut cursor = list::first(head, lock.borrow());
    while let Some(existing) = cursor {
        let delta = existing.get().delta_us.get(&*lock);
        if target_us < acc + delta {
            // Insert before `existing`, splitting its delta
            node.delta_us.replace(&mut *lock, target_us - acc);
            existing
                .get()
                .delta_us
                .replace(&mut *lock, acc + delta - target_us);
            list::insert_before(head, node, existing, lock.borrow_mut());
            return;
        }
        acc += delta;
        cursor = list::next(head, existing, lock.borrow());
    }

    node.delta_us.replace(&mut *lock, target_us - acc);
    list::push_back(head, node, lock.borrow_mut());
}

/// Disarm the node. The successor inherits the node's remaining delta. Does
/// nothing if the node is not armed.
pub(crate) fn remove<Traits: KernelTraits>(
    node: &'static TimeoutNode<Traits>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    let Some(owner) = list::owner_of(node, lock.borrow()) else {
        return;
    };
    let this = NodeRef::new(node);
    if let Some(successor) = list::next(owner, this, lock.borrow()) {
        let inherited = successor.get().delta_us.get(&*lock) + node.delta_us.get(&*lock);
        successor.get().delta_us.replace(&mut *lock, inherited);
    }
    list::remove(node, lock.borrow_mut());
}

/// `true` iff the node is armed.
pub(crate) fn is_busy<Traits: KernelTraits>(
    node: &TimeoutNode<Traits>,
    lock: CpuLockTokenRef<'_, Traits>,
) -> bool {
    list::is_linked(node, lock)
}

/// The tick entry point handed to the port's clock driver. Called from an
/// interrupt context with the microseconds elapsed since the previous call.
pub(crate) unsafe fn tick_handler<Traits: KernelTraits>(elapsed_us: u32) {
    // The tick arrives with the CPU lock inactive
    let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
        return;
    };

    let total = Traits::state().timeout.total_us.get(&*lock);
    Traits::state()
        .timeout
        .total_us
        .replace(&mut *lock, total + elapsed_us as u64);

    let head = wheel::<Traits>();
    let mut unspent = elapsed_us as u64;
    let mut notify = false;

    while let Some(node_ref) = list::first(head, lock.borrow_mut().borrow()) {
        let node = node_ref.get();
        let delta = node.delta_us.get(&*lock);
        if delta > unspent {
            node.delta_us.replace(&mut *lock, delta - unspent);
            break;
        }
        unspent -= delta;

        list::remove(node, lock.borrow_mut());
        match node.kind.get(&*lock) {
            TimeoutKind::Task(task) => {
                // The waiter leaves its wait queue; the blocking object's
                // state is untouched
                sched::entry_trigger(task.get(), None, error::WAKE_TIMEOUT, lock.borrow_mut());
            }
            TimeoutKind::Timer(timer) => {
                crate::timer::expire(timer.get(), lock.borrow_mut());
                notify = true;
            }
            TimeoutKind::Unbound => {}
        }
    }

    if notify {
        kthread::notify(lock.borrow_mut());
    }
}
