//! The scheduler core.
//!
//! The scheduler owns four task lists plus the running-task pointer:
//!
//!  - **pend** — ready tasks, ordered by priority; the head is the running
//!    task.
//!  - **entry** — tasks becoming ready at the next scheduling point.
//!  - **exit** — tasks being suspended at the next scheduling point.
//!  - **wait** — sleeping or suspended tasks with no object-specific queue.
//!
//! Blocking primitives never touch CPU state; they stage transitions with
//! [`exit_trigger`] and [`entry_trigger`] and the scheduling point
//! ([`scheduler_pendsv`]) performs the drains and picks the next task.
use core::ptr::NonNull;

use crate::{
    error::{self, pc, Kind, Postcode},
    klock::{self, CpuLockTokenRef, CpuLockTokenRefMut},
    task::TaskCb,
    timeout,
    utils::list::{self, HeadRef, NodeRef},
    KernelTraits, PortThreading, System, TIME_FOREVER,
};

pub(crate) type TaskRef<Traits> = NodeRef<TaskCb<Traits>>;

/// A weak back-reference from a blocked task to the object blocking it. The
/// scheduler reads and clears it; only the owning primitive's wake-up
/// callback follows it.
pub(crate) struct PendCtx(NonNull<()>);

// Safety: `PendCtx` only ever points into static object pools
unsafe impl Send for PendCtx {}
unsafe impl Sync for PendCtx {}

impl PendCtx {
    pub(crate) fn new<T>(r: &'static T) -> Self {
        Self(NonNull::from(r).cast())
    }

    /// Get the pointee back.
    ///
    /// # Safety
    ///
    /// `T` must be the type this context was constructed from.
    pub(crate) unsafe fn cast<T>(&self) -> &'static T {
        unsafe { self.0.cast::<T>().as_ref() }
    }
}

impl Clone for PendCtx {
    fn clone(&self) -> Self {
        *self
    }
}
impl Copy for PendCtx {}

/// Primitive-specific scratch recorded while a task is blocked.
pub(crate) enum PendPayload {
    None,
    Event { listen: u32, trigger: u32 },
    Queue(crate::queue::QueuePend),
}

/// Primitive-specific epilogue run inside the scheduling point when the task
/// is woken up. Runs with the CPU lock held; must not block.
pub(crate) type EntryCallback<Traits> =
    fn(&'static TaskCb<Traits>, CpuLockTokenRefMut<'_, Traits>);

/// Ordering predicate shared by every priority-ordered task list: ascending
/// priority, stable ties.
pub(crate) fn before_by_priority<Traits: PortThreading>(
    new: &TaskCb<Traits>,
    existing: &TaskCb<Traits>,
    lock: CpuLockTokenRef<'_, Traits>,
) -> bool {
    new.priority.read(&*lock) < existing.priority.read(&*lock)
}

pub(crate) fn pend_list<Traits: KernelTraits>() -> HeadRef<Traits, TaskCb<Traits>> {
    HeadRef::new(&Traits::state().pend_list)
}

pub(crate) fn entry_list<Traits: KernelTraits>() -> HeadRef<Traits, TaskCb<Traits>> {
    HeadRef::new(&Traits::state().entry_list)
}

pub(crate) fn exit_list<Traits: KernelTraits>() -> HeadRef<Traits, TaskCb<Traits>> {
    HeadRef::new(&Traits::state().exit_list)
}

pub(crate) fn wait_list<Traits: KernelTraits>() -> HeadRef<Traits, TaskCb<Traits>> {
    HeadRef::new(&Traits::state().wait_list)
}

/// The currently running task.
pub(crate) fn running_task<Traits: KernelTraits>(
    lock: CpuLockTokenRef<'_, Traits>,
) -> Option<TaskRef<Traits>> {
    *Traits::state().running_task.read(&*lock)
}

/// `true` iff the pend list holds at least two tasks. Used by yield, suspend
/// and delete to reject requests that would leave no runnable task.
pub(crate) fn has_two_pending<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> bool {
    list::holds_at_least(pend_list::<Traits>(), 2, lock)
}

/// Request the port to run a scheduling point. Only callable from a
/// privileged context.
pub(crate) fn schedule_request<Traits: KernelTraits>() -> Result<(), Postcode> {
    if Traits::is_interrupt_context() {
        // Safety: privileged context, as just checked
        unsafe { Traits::pend_switch() };
        Ok(())
    } else {
        Err(pc!(Sched, WrongContext))
    }
}

/// Move `task` from the running/pend state into a blocked state.
///
/// `to_list` is the object's wait queue (priority-ordered), the scheduler's
/// wait list, or `None` for thread delete. With `immediate`, the transfer and
/// the timeout arming happen inline; otherwise they are deferred to the exit
/// drain of the next scheduling point.
pub(crate) fn exit_trigger<Traits: KernelTraits>(
    task: &'static TaskCb<Traits>,
    hold_ctx: Option<PendCtx>,
    hold_data: PendPayload,
    to_list: Option<HeadRef<Traits, TaskCb<Traits>>>,
    timeout_ms: u32,
    immediate: bool,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    task.pend_ctx.replace(&mut *lock, hold_ctx);
    match hold_data {
        PendPayload::None => {}
        PendPayload::Event { listen, trigger } => {
            task.pend_event.replace(
                &mut *lock,
                crate::task::EventPend {
                    listen,
                    trigger,
                    collected: 0,
                },
            );
        }
        PendPayload::Queue(pend) => {
            task.pend_queue.replace(&mut *lock, pend);
        }
    }

    if immediate {
        task.exec
            .entry_result
            .replace(&mut *lock, error::CHANNEL_PLACEHOLDER);
        // A stale timeout from an earlier wait must not fire into the new
        // one
        timeout::remove(&task.expire, lock.borrow_mut());
        if timeout_ms != 0 && timeout_ms < TIME_FOREVER {
            timeout::set(&task.expire, timeout_ms, lock.borrow_mut());
        }
        match to_list {
            Some(to) => {
                list::transfer_sorted(task, to, lock.borrow_mut(), before_by_priority)
            }
            None => detach_and_scrub(task, lock.borrow_mut()),
        }
    } else {
        task.exec.exit_to.replace(&mut *lock, to_list);
        task.exec.exit_timeout_ms.replace(&mut *lock, timeout_ms);
        list::transfer_sorted(
            task,
            exit_list::<Traits>(),
            lock.borrow_mut(),
            before_by_priority,
        );
    }

    let _ = schedule_request::<Traits>();
}

/// Stage a wake-up for `task`. `result` becomes the task's wake-up channel
/// value; `callback`, if any, runs inside the scheduling point and finishes
/// primitive-specific work.
pub(crate) fn entry_trigger<Traits: KernelTraits>(
    task: &'static TaskCb<Traits>,
    callback: Option<EntryCallback<Traits>>,
    result: i32,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    task.exec.entry_result.replace(&mut *lock, result);
    task.exec.entry_fn.replace(&mut *lock, callback);
    list::transfer(task, entry_list::<Traits>(), lock.borrow_mut());

    let _ = schedule_request::<Traits>();
}

/// Re-sort the task within whatever ordered list it currently sits on.
/// Necessary after its priority changes.
pub(crate) fn reposition<Traits: KernelTraits>(
    task: &'static TaskCb<Traits>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    if let Some(owner) = list::owner_of(task, lock.borrow()) {
        list::transfer_sorted(task, owner, lock.borrow_mut(), before_by_priority);
    }
}

/// Detach the task from every kernel structure and return its slot to the
/// pool. The stack is repainted with the unused marker so that stack-usage
/// analysis keeps working.
fn detach_and_scrub<Traits: KernelTraits>(
    task: &'static TaskCb<Traits>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    timeout::remove(&task.expire, lock.borrow_mut());
    list::remove(task, lock.borrow_mut());
    task.scrub(lock.borrow_mut());
}

/// The scheduling point. Runs in the port's PendSV-equivalent with the CPU
/// lock inactive.
pub(crate) fn scheduler_pendsv<Traits: KernelTraits>() {
    // The precondition includes the CPU lock being inactive, so this cannot
    // fail
    let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
        return;
    };

    let ms = timeout::total_ms::<Traits>(lock.borrow_mut().borrow());

    drain_exit(lock.borrow_mut());
    drain_entry(ms, lock.borrow_mut());

    let state = Traits::state();
    let prev = *state.running_task.read(&*lock);
    let next = list::first(pend_list::<Traits>(), lock.borrow_mut().borrow());

    if *state.lock_nest.read(&*lock) > 0 && prev.is_some() {
        // The schedule lock reselects the incumbent
        return;
    }

    if prev == next {
        return;
    }

    if let Some(p) = prev {
        let p = p.get();
        let last_active = p.exec.analyze.last_active_ms.get(&*lock);
        let ran = ms.wrapping_sub(last_active);
        p.exec.analyze.last_run_ms.replace(&mut *lock, ran);
        let total = p.exec.analyze.total_run_ms.get(&*lock);
        p.exec
            .analyze
            .total_run_ms
            .replace(&mut *lock, total.wrapping_add(ran));
    }
    if let Some(n) = next {
        n.get()
            .exec
            .analyze
            .last_active_ms
            .replace(&mut *lock, ms);
    }

    state.running_task.replace(&mut *lock, next);
    state.pendsv_ms.replace(&mut *lock, ms);
}

/// Drain the exit list: arm exit timeouts, zero wake-up channels, and
/// transfer each task onto its target wait list (or scrub it, for thread
/// delete).
fn drain_exit<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    while let Some(node) = list::first(exit_list::<Traits>(), lock.borrow()) {
        let task = node.get();
        let to = *task.exec.exit_to.read(&*lock);
        let timeout_ms = task.exec.exit_timeout_ms.get(&*lock);

        task.exec
            .entry_result
            .replace(&mut *lock, error::CHANNEL_PLACEHOLDER);

        timeout::remove(&task.expire, lock.borrow_mut());
        if timeout_ms != 0 && timeout_ms < TIME_FOREVER {
            timeout::set(&task.expire, timeout_ms, lock.borrow_mut());
        }

        match to {
            Some(to) => {
                list::transfer_sorted(task, to, lock.borrow_mut(), before_by_priority)
            }
            None => detach_and_scrub(task, lock.borrow_mut()),
        }
    }
}

/// Drain the entry list: stop the internal timeout, run the wake-up
/// epilogue, clear the pend context and transfer each task back onto the
/// pend list.
fn drain_entry<Traits: KernelTraits>(ms: u32, mut lock: CpuLockTokenRefMut<'_, Traits>) {
    while let Some(node) = list::first(entry_list::<Traits>(), lock.borrow()) {
        let task = node.get();

        timeout::remove(&task.expire, lock.borrow_mut());

        if let Some(f) = task.exec.entry_fn.replace(&mut *lock, None) {
            f(task, lock.borrow_mut());
        }

        task.pend_ctx.replace(&mut *lock, None);
        task.exec.analyze.last_pend_ms.replace(&mut *lock, ms);

        list::transfer_sorted(
            task,
            pend_list::<Traits>(),
            lock.borrow_mut(),
            before_by_priority,
        );
    }
}

/// Consume the wake-up channel of the task that issued a blocking call.
///
/// Returns the unavailable marker when the channel still holds the
/// placeholder, which means the task has not been woken up yet (this is only
/// observable under a simulation port that returns to the caller instead of
/// context-switching away).
pub(crate) fn blocking_finish<Traits: KernelTraits>(
    caller: TaskRef<Traits>,
) -> Result<(), Postcode> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let task = caller.get();
    let raw = task.exec.entry_result.get(&*lock);
    match Postcode::from_raw(raw) {
        Err(code) if code.kind() == Kind::InvalidOperation => Err(pc!(Sched, Unavailable)),
        result => {
            task.exec
                .entry_result
                .replace(&mut *lock, error::CHANNEL_PLACEHOLDER);
            result
        }
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// Consume the running task's wake-up channel, leaving the
    /// invalid-operation placeholder behind.
    pub fn schedule_result_take() -> Result<(), Postcode> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let Some(task) = running_task::<Traits>(lock.borrow_mut().borrow()) else {
            return Err(pc!(Sched, WrongContext));
        };
        let raw = task
            .get()
            .exec
            .entry_result
            .replace(&mut *lock, error::CHANNEL_PLACEHOLDER);
        Postcode::from_raw(raw)
    }

    /// Hold off preemption. Nestable.
    pub fn schedule_lock() -> Result<(), Postcode> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let nest = Traits::state().lock_nest.get(&*lock);
        Traits::state().lock_nest.replace(&mut *lock, nest + 1);
        Ok(())
    }

    /// Release [`schedule_lock`](Self::schedule_lock). A reschedule is
    /// requested when the last nesting level is released.
    pub fn schedule_unlock() -> Result<(), Postcode> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let nest = Traits::state().lock_nest.get(&*lock) - 1;
        Traits::state()
            .lock_nest
            .replace(&mut *lock, nest.max(0));
        drop(lock);
        if nest <= 0 {
            let args = ();
            let _ = crate::svc::invoke::<Traits, ()>(unlock_pend_routine::<Traits>, &args);
        }
        Ok(())
    }
}

fn unlock_pend_routine<Traits: KernelTraits>(_packet: usize) -> i32 {
    match schedule_request::<Traits>() {
        Ok(()) => 0,
        Err(code) => code.raw(),
    }
}
