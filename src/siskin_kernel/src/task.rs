//! Threads.
use core::fmt;

use crate::{
    error::{pc, Kind, Postcode},
    handle::{Handle, ObjectHead, ObjectKind},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    sched::{self, EntryCallback, PendCtx, PendPayload, TaskRef},
    svc, timeout,
    utils::{
        list::{self, Link},
        Init, RawCell,
    },
    KernelTraits, PortThreading, Priority, System, PRIORITY_USER_HIGHEST,
    PRIORITY_USER_LOWEST, TIME_FOREVER,
};

/// The byte pattern stacks are painted with so that unused depth can be
/// estimated by scanning for it.
pub const STACK_UNUSED_MARKER: u8 = 0xa5;

/// A raw memory region handed to the kernel: a thread stack or a queue's
/// slot storage.
#[derive(Clone, Copy)]
pub struct Region {
    base: *mut u8,
    len: usize,
}

// Safety: regions refer to statically allocated storage
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Construct a region from raw parts.
    ///
    /// # Safety
    ///
    /// The region must refer to memory that outlives the kernel and is not
    /// aliased by safe code.
    pub const unsafe fn from_raw_parts(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The highest address of the region, rounded down to an 8-byte
    /// boundary. Stacks grow downwards from here.
    pub fn top(&self) -> usize {
        (self.base as usize + self.len) & !7
    }
}

impl Init for Region {
    const INIT: Self = Self {
        base: core::ptr::null_mut(),
        len: 0,
    };
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Region({:p}+{:#x})", self.base, self.len)
    }
}

/// Statically allocated storage for a thread stack or queue slots.
///
/// ```ignore
/// static STACK: Arena<4096> = Arena::INIT;
/// let region = STACK.region();
/// ```
#[repr(align(8))]
pub struct Arena<const LEN: usize>(RawCell<[u8; LEN]>);

impl<const LEN: usize> Arena<LEN> {
    pub fn region(&'static self) -> Region {
        // Safety: the arena is statically allocated and only ever handed to
        // the kernel through this method
        unsafe { Region::from_raw_parts(self.0.get().cast(), LEN) }
    }
}

impl<const LEN: usize> Init for Arena<LEN> {
    const INIT: Self = Self(RawCell::new([0; LEN]));
}

/// The conventional name for an [`Arena`] used as a thread stack.
pub type Stack<const LEN: usize> = Arena<LEN>;

/// Run-time figures kept per task by the scheduling point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAnalyze {
    /// When the task last left the blocked state, in kernel milliseconds.
    pub last_pend_ms: u32,
    /// The length of the task's most recent run, in milliseconds.
    pub last_run_ms: u32,
    /// Accumulated run time, in milliseconds.
    pub total_run_ms: u32,
}

pub(crate) struct AnalyzeState<Traits: PortThreading> {
    pub(crate) last_pend_ms: CpuLockCell<Traits, u32>,
    pub(crate) last_active_ms: CpuLockCell<Traits, u32>,
    pub(crate) last_run_ms: CpuLockCell<Traits, u32>,
    pub(crate) total_run_ms: CpuLockCell<Traits, u32>,
}

impl<Traits: PortThreading> Init for AnalyzeState<Traits> {
    const INIT: Self = Self {
        last_pend_ms: Init::INIT,
        last_active_ms: Init::INIT,
        last_run_ms: Init::INIT,
        total_run_ms: Init::INIT,
    };
}

/// Event-wait scratch recorded in the waiter's pend data.
#[derive(Clone, Copy)]
pub(crate) struct EventPend {
    /// Which event bits this waiter listens to.
    pub(crate) listen: u32,
    /// All-of mask; zero selects any-of mode.
    pub(crate) trigger: u32,
    /// Listened bits seen so far.
    pub(crate) collected: u32,
}

impl Init for EventPend {
    const INIT: Self = Self {
        listen: 0,
        trigger: 0,
        collected: 0,
    };
}

/// The exit/entry staging records and analyzer figures of a task.
pub(crate) struct ExecState<Traits: PortThreading> {
    /// The wake-up channel: the result the task observes when it resumes
    /// from a blocking call.
    pub(crate) entry_result: CpuLockCell<Traits, i32>,
    pub(crate) entry_fn: CpuLockCell<Traits, Option<EntryCallback<Traits>>>,
    /// Deferred-exit target; `None` means the task is being deleted.
    pub(crate) exit_to:
        CpuLockCell<Traits, Option<list::HeadRef<Traits, TaskCb<Traits>>>>,
    pub(crate) exit_timeout_ms: CpuLockCell<Traits, u32>,
    pub(crate) analyze: AnalyzeState<Traits>,
}

impl<Traits: PortThreading> Init for ExecState<Traits> {
    const INIT: Self = Self {
        entry_result: CpuLockCell::new(crate::error::CHANNEL_PLACEHOLDER),
        entry_fn: Init::INIT,
        exit_to: Init::INIT,
        exit_timeout_ms: Init::INIT,
        analyze: Init::INIT,
    };
}

/// *Task control block* — the state data of a thread.
#[repr(C)]
pub struct TaskCb<Traits: PortThreading> {
    /// Port-specific per-task state.
    ///
    /// This is guaranteed to be placed at the beginning of the struct so
    /// that low-level dispatch code can refer to it easily.
    pub port_task_state: Traits::PortTaskState,

    pub(crate) head: ObjectHead,

    /// Participates in exactly one of the scheduler's lists or an object's
    /// wait queue.
    pub(crate) link: CpuLockCell<Traits, Option<Link<Traits, TaskCb<Traits>>>>,

    /// Effective priority. May be temporarily raised by priority
    /// inheritance; the mutex holds the original snapshot.
    pub(crate) priority: CpuLockCell<Traits, Priority>,

    pub(crate) entry: CpuLockCell<Traits, Option<fn()>>,

    pub(crate) stack: CpuLockCell<Traits, Region>,

    /// Saved stack pointer, updated by the context switch.
    pub(crate) psp: CpuLockCell<Traits, usize>,

    /// The task's internal timeout node, re-armed across successive blocking
    /// calls.
    pub(crate) expire: timeout::TimeoutNode<Traits>,

    /// Weak back-reference to the object this task is blocked on.
    pub(crate) pend_ctx: CpuLockCell<Traits, Option<PendCtx>>,

    pub(crate) pend_event: CpuLockCell<Traits, EventPend>,
    pub(crate) pend_queue: CpuLockCell<Traits, crate::queue::QueuePend>,

    pub(crate) exec: ExecState<Traits>,
}

impl<Traits: PortThreading> Init for TaskCb<Traits> {
    const INIT: Self = Self {
        port_task_state: Init::INIT,
        head: Init::INIT,
        link: Init::INIT,
        priority: Init::INIT,
        entry: Init::INIT,
        stack: Init::INIT,
        psp: Init::INIT,
        expire: Init::INIT,
        pend_ctx: Init::INIT,
        pend_event: Init::INIT,
        pend_queue: Init::INIT,
        exec: Init::INIT,
    };
}

impl<Traits: PortThreading> list::ListNode<Traits> for TaskCb<Traits> {
    fn link(&self) -> &CpuLockCell<Traits, Option<Link<Traits, Self>>> {
        &self.link
    }
}

impl<Traits: PortThreading> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("name", &self.head.name())
            .finish()
    }
}

impl<Traits: KernelTraits> TaskCb<Traits> {
    /// Reset every field and return the slot to the pool. The stack is
    /// repainted with the unused marker.
    pub(crate) fn scrub(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        let stack = self.stack.get(&*lock);
        if !stack.is_empty() {
            // Safety: the task no longer runs; its stack is exclusively ours
            unsafe {
                core::ptr::write_bytes(stack.base(), STACK_UNUSED_MARKER, stack.len())
            };
        }
        self.priority.replace(&mut *lock, 0);
        self.entry.replace(&mut *lock, None);
        self.stack.replace(&mut *lock, Region::INIT);
        self.psp.replace(&mut *lock, 0);
        self.pend_ctx.replace(&mut *lock, None);
        self.pend_event.replace(&mut *lock, EventPend::INIT);
        self.pend_queue
            .replace(&mut *lock, crate::queue::QueuePend::INIT);
        self.exec
            .entry_result
            .replace(&mut *lock, crate::error::CHANNEL_PLACEHOLDER);
        self.exec.entry_fn.replace(&mut *lock, None);
        self.exec.exit_to.replace(&mut *lock, None);
        self.exec.exit_timeout_ms.replace(&mut *lock, 0);
        self.head.scrub();
    }
}

/// Find the handle of a pool-resident task control block.
pub(crate) fn task_handle<Traits: KernelTraits>(task: &'static TaskCb<Traits>) -> Handle {
    let pool = Traits::task_cb_pool();
    let offset_bytes = task as *const TaskCb<Traits> as usize - pool.as_ptr() as usize;
    Handle::new(
        ObjectKind::Thread,
        offset_bytes / core::mem::size_of::<TaskCb<Traits>>(),
    )
}

/// Resolve a handle into a task control block, verifying the range and the
/// construction state. Runs outside the critical section.
pub(crate) fn task_cb<Traits: KernelTraits>(
    handle: Handle,
) -> Result<&'static TaskCb<Traits>, Postcode> {
    let pool = Traits::task_cb_pool();
    if !handle.is_in_range(ObjectKind::Thread, pool.len()) {
        return Err(pc!(Task, InvalidHandle));
    }
    let cb = &pool[handle.index()];
    if !cb.head.is_inited() {
        return Err(pc!(Task, InvalidHandle));
    }
    Ok(cb)
}

/// Claim a free task slot and initialize it. Runs inside the critical
/// section; shared between the public privileged routine and kernel-thread
/// creation.
pub(crate) fn init_task_in_slot<Traits: KernelTraits>(
    entry: fn(),
    stack: Region,
    priority: Priority,
    name: &'static str,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) -> Result<Handle, Postcode> {
    let pool = Traits::task_cb_pool();
    let Some(cb) = pool.iter().find(|cb| !cb.head.is_inited()) else {
        return Err(pc!(Task, Exhausted));
    };

    cb.head.claim(name);
    cb.priority.replace(&mut *lock, priority);
    cb.entry.replace(&mut *lock, Some(entry));
    cb.stack.replace(&mut *lock, stack);

    // Safety: the slot was free, so the stack is not in use by anyone
    unsafe { core::ptr::write_bytes(stack.base(), STACK_UNUSED_MARKER, stack.len()) };
    // Safety: CPU lock active, stack exclusively ours
    let psp = unsafe { Traits::stack_frame_init(entry, stack) };
    cb.psp.replace(&mut *lock, psp);

    timeout::bind_to_task(&cb.expire, cb, lock.borrow_mut());

    list::insert_sorted(
        sched::pend_list::<Traits>(),
        cb,
        lock.borrow_mut(),
        sched::before_by_priority,
    );

    Ok(task_handle::<Traits>(cb))
}

struct InitArgs {
    entry: fn(),
    stack: Region,
    priority: Priority,
    name: &'static str,
}

fn init_routine<Traits: KernelTraits>(packet: usize) -> i32 {
    // Safety: dispatched by the trampoline inside a critical section
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    // Safety: `packet` is the argument struct built by `thread_init`
    let args = unsafe { svc::packet_args::<InitArgs>(packet) };
    let ret = match init_task_in_slot::<Traits>(
        args.entry,
        args.stack,
        args.priority,
        args.name,
        lock.borrow_mut(),
    ) {
        Ok(handle) => handle.raw() as i32,
        Err(code) => code.raw(),
    };
    core::mem::forget(lock);
    ret
}

struct TargetArgs {
    handle: Handle,
}

fn resume_routine<Traits: KernelTraits>(packet: usize) -> i32 {
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    let args = unsafe { svc::packet_args::<TargetArgs>(packet) };
    let ret = (|| {
        let cb = task_cb::<Traits>(args.handle)?;
        let running = sched::running_task::<Traits>(lock.borrow_mut().borrow());
        if running.map_or(false, |t| t.ptr_eq(cb)) {
            // Already running: nothing to do
            return Ok(());
        }
        sched::entry_trigger(cb, None, crate::error::WAKE_SUCCESS, lock.borrow_mut());
        Ok(())
    })();
    core::mem::forget(lock);
    postcode_or_zero(ret)
}

fn suspend_routine<Traits: KernelTraits>(packet: usize) -> i32 {
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    let args = unsafe { svc::packet_args::<TargetArgs>(packet) };
    let ret = (|| {
        let cb = task_cb::<Traits>(args.handle)?;
        if !sched::has_two_pending::<Traits>(lock.borrow_mut()) {
            return Err(pc!(Task, StateViolation));
        }
        sched::exit_trigger(
            cb,
            None,
            PendPayload::None,
            Some(sched::wait_list::<Traits>()),
            TIME_FOREVER,
            true,
            lock.borrow_mut(),
        );
        Ok(())
    })();
    core::mem::forget(lock);
    postcode_or_zero(ret)
}

fn yield_routine<Traits: KernelTraits>(_packet: usize) -> i32 {
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    let ret = (|| {
        let Some(running) = sched::running_task::<Traits>(lock.borrow_mut().borrow()) else {
            return Err(pc!(Task, WrongContext));
        };
        // Yielding is a no-op unless an equal-or-more-urgent peer is ready
        // to take over
        let peer = list::next(
            sched::pend_list::<Traits>(),
            running,
            lock.borrow_mut().borrow(),
        );
        match peer {
            Some(p) if p.get().priority.get(&*lock) <= running.get().priority.get(&*lock) => {}
            _ => return Err(pc!(Task, StateViolation)),
        }
        let task = running.get();
        // Drop to the back of this priority class: out through the wait
        // list, immediately staged to come back in
        sched::exit_trigger(
            task,
            None,
            PendPayload::None,
            Some(sched::wait_list::<Traits>()),
            TIME_FOREVER,
            true,
            lock.borrow_mut(),
        );
        sched::entry_trigger(task, None, crate::error::WAKE_SUCCESS, lock.borrow_mut());
        Ok(())
    })();
    core::mem::forget(lock);
    postcode_or_zero(ret)
}

struct SleepArgs {
    timeout_ms: u32,
}

fn sleep_routine<Traits: KernelTraits>(packet: usize) -> i32 {
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    let args = unsafe { svc::packet_args::<SleepArgs>(packet) };
    let ret = (|| {
        let Some(running) = sched::running_task::<Traits>(lock.borrow_mut().borrow()) else {
            return Err(pc!(Task, WrongContext));
        };
        sched::exit_trigger(
            running.get(),
            None,
            PendPayload::None,
            Some(sched::wait_list::<Traits>()),
            args.timeout_ms,
            true,
            lock.borrow_mut(),
        );
        Err(pc!(Task, Unavailable))
    })();
    core::mem::forget(lock);
    postcode_or_zero(ret)
}

fn delete_routine<Traits: KernelTraits>(packet: usize) -> i32 {
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    let args = unsafe { svc::packet_args::<TargetArgs>(packet) };
    let ret = (|| {
        let cb = task_cb::<Traits>(args.handle)?;
        let running = sched::running_task::<Traits>(lock.borrow_mut().borrow());
        if running.map_or(false, |t| t.ptr_eq(cb)) {
            // A thread cannot delete itself
            return Err(pc!(Task, StateViolation));
        }
        let on_pend = list::owner_of(cb, lock.borrow_mut().borrow())
            == Some(sched::pend_list::<Traits>());
        if on_pend && !sched::has_two_pending::<Traits>(lock.borrow_mut()) {
            return Err(pc!(Task, StateViolation));
        }
        // Deferred so that a late wake-up becomes a no-op and the scrub
        // happens inside the scheduling point
        sched::exit_trigger(
            cb,
            None,
            PendPayload::None,
            None,
            0,
            false,
            lock.borrow_mut(),
        );
        Ok(())
    })();
    core::mem::forget(lock);
    postcode_or_zero(ret)
}

pub(crate) fn postcode_or_zero(r: Result<(), Postcode>) -> i32 {
    match r {
        Ok(()) => 0,
        Err(code) => code.raw(),
    }
}

/// These associate functions implement the thread portion of the public API.
impl<Traits: KernelTraits> System<Traits> {
    /// Create a thread and place it on the pend list.
    pub fn thread_init(
        entry: fn(),
        stack: Region,
        priority: Priority,
        name: &'static str,
    ) -> Result<Handle, Postcode> {
        if !(PRIORITY_USER_HIGHEST..=PRIORITY_USER_LOWEST).contains(&priority) {
            return Err(pc!(Task, InvalidArgument));
        }
        if stack.base().is_null()
            || stack.len() < Traits::STACK_SIZE_MIN
            || stack.len() > Traits::STACK_SIZE_MAX
        {
            return Err(pc!(Task, InvalidArgument));
        }

        let args = InitArgs {
            entry,
            stack,
            priority,
            name,
        };
        let raw = svc::invoke::<Traits, _>(init_routine::<Traits>, &args);
        match Postcode::from_raw(raw) {
            Ok(()) => Ok(Handle::from_raw(raw as u32)),
            Err(code) => Err(code),
        }
    }

    /// Stage a wake-up for the thread. No effect if it is already running.
    pub fn thread_resume(handle: Handle) -> Result<(), Postcode> {
        task_cb::<Traits>(handle)?;
        let args = TargetArgs { handle };
        Postcode::from_raw(svc::invoke::<Traits, _>(resume_routine::<Traits>, &args))
    }

    /// Move the thread onto the wait list until a later
    /// [`thread_resume`](Self::thread_resume).
    pub fn thread_suspend(handle: Handle) -> Result<(), Postcode> {
        task_cb::<Traits>(handle)?;
        let args = TargetArgs { handle };
        Postcode::from_raw(svc::invoke::<Traits, _>(suspend_routine::<Traits>, &args))
    }

    /// Round-robin among equal-priority peers: requeue the calling thread at
    /// the back of its priority class.
    pub fn thread_yield() -> Result<(), Postcode> {
        if !Traits::is_thread_context() {
            return Err(pc!(Task, WrongContext));
        }
        let args = ();
        Postcode::from_raw(svc::invoke::<Traits, ()>(yield_routine::<Traits>, &args))
    }

    /// Block the calling thread for `timeout_ms` milliseconds.
    pub fn thread_sleep(timeout_ms: u32) -> Result<(), Postcode> {
        if timeout_ms == 0 || timeout_ms >= TIME_FOREVER {
            return Err(pc!(Task, InvalidArgument));
        }
        if !Traits::is_thread_context() {
            return Err(pc!(Task, WrongContext));
        }
        let caller = Self::caller_task()?;
        let args = SleepArgs { timeout_ms };
        let raw = svc::invoke::<Traits, _>(sleep_routine::<Traits>, &args);
        match Postcode::from_raw(raw) {
            Err(code) if code.kind() == Kind::Unavailable => {
                match sched::blocking_finish::<Traits>(caller) {
                    // The internal timer is what wakes a sleeper; its
                    // timeout is the success path
                    Err(code) if code.kind() == Kind::Timeout => Ok(()),
                    other => other,
                }
            }
            other => other,
        }
    }

    /// Delete the thread, scrub its stack, and return its slot to the pool.
    /// The running thread and the last runnable thread are rejected.
    pub fn thread_delete(handle: Handle) -> Result<(), Postcode> {
        task_cb::<Traits>(handle)?;
        let args = TargetArgs { handle };
        Postcode::from_raw(svc::invoke::<Traits, _>(delete_routine::<Traits>, &args))
    }

    /// The handle of the currently running thread.
    pub fn current_thread() -> Result<Handle, Postcode> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let Some(task) = sched::running_task::<Traits>(lock.borrow_mut().borrow()) else {
            return Err(pc!(Task, WrongContext));
        };
        Ok(task_handle::<Traits>(task.get()))
    }

    /// The thread's name.
    pub fn thread_name(handle: Handle) -> Result<&'static str, Postcode> {
        Ok(task_cb::<Traits>(handle)?.head.name())
    }

    /// The thread's current effective priority (including any inherited
    /// urgency).
    pub fn thread_priority(handle: Handle) -> Result<Priority, Postcode> {
        let cb = task_cb::<Traits>(handle)?;
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(*cb.priority.read(&*lock))
    }

    /// Estimate the unused depth of the thread's stack by scanning the
    /// painted marker region.
    pub fn thread_stack_free(handle: Handle) -> Result<usize, Postcode> {
        let cb = task_cb::<Traits>(handle)?;
        let lock = klock::lock_cpu::<Traits>()?;
        let stack = cb.stack.get(&*lock);
        drop(lock);
        Ok(Traits::stack_free_estimate(stack))
    }

    /// The thread's run-time analyzer record.
    pub fn thread_analyze(handle: Handle) -> Result<ThreadAnalyze, Postcode> {
        let cb = task_cb::<Traits>(handle)?;
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(ThreadAnalyze {
            last_pend_ms: cb.exec.analyze.last_pend_ms.read(&*lock).clone(),
            last_run_ms: cb.exec.analyze.last_run_ms.read(&*lock).clone(),
            total_run_ms: cb.exec.analyze.total_run_ms.read(&*lock).clone(),
        })
    }

    /// The task that issued the current call, captured for reading its
    /// wake-up channel after the trampoline returns.
    pub(crate) fn caller_task() -> Result<TaskRef<Traits>, Postcode> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        match sched::running_task::<Traits>(lock.borrow_mut().borrow()) {
            Some(task) => Ok(task),
            None => Err(pc!(Task, WrongContext)),
        }
    }
}
