//! A preemptive priority-based real-time kernel for resource-constrained
//! processors.
//!
//! The kernel is generic over a *kernel trait type* (`Traits`) that
//! aggregates the port layer ([`PortThreading`], [`PortTimer`],
//! [`PortPrivilege`]) and the static configuration ([`KernelCfg`],
//! implemented by the [`build!`] macro). All kernel objects live in
//! statically allocated pools and are referred to by opaque [`Handle`]s.
//!
//! # Contexts
//!
//! Application code runs in *thread context*. The kernel's own state
//! mutations run in *privileged context*, reached through the port's
//! supervisor-call trampoline, inside a critical section. Blocking calls are
//! only allowed in thread context.
//!
//! # Callbacks
//!
//! Timer and event callbacks run on the kernel housekeeping thread, outside
//! of any application thread but still subject to one strict contract: they
//! must not block.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::AtomicBool;

pub mod error;
pub mod handle;
mod klock;
pub mod utils;

mod event;
mod kthread;
mod mutex;
mod queue;
mod sched;
mod semaphore;
mod svc;
mod task;
mod timeout;
mod timer;

pub use crate::{
    error::{Kind, Postcode},
    event::EventCb,
    handle::{Handle, ObjectKind},
    mutex::MutexCb,
    queue::QueueCb,
    semaphore::{SemaphoreCb, SEMAPHORE_BINARY, SEMAPHORE_LIMIT_MAX},
    task::{Arena, Region, Stack, TaskCb, ThreadAnalyze, STACK_UNUSED_MARKER},
    timer::TimerCb,
    utils::Init,
};

use crate::klock::CpuLockCell;
use crate::utils::list::{HeadCell, NodeRef};

/// Task priority. Lower values are more urgent.
pub type Priority = i16;

/// The reserved priority of the kernel housekeeping thread (most urgent).
pub const PRIORITY_KERNEL: Priority = 0;
/// The most urgent priority available to application threads.
pub const PRIORITY_USER_HIGHEST: Priority = 1;
/// The least urgent priority available to application threads.
pub const PRIORITY_USER_LOWEST: Priority = 253;
/// The reserved priority of the idle thread (least urgent).
pub const PRIORITY_IDLE: Priority = 254;

/// Timeout value disabling the timeout timer entirely.
pub const TIME_FOREVER: u32 = 0xffff_fffe;

/// Implemented by a port. This trait contains items related to low-level
/// operations for controlling CPU states and context switching.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// initializing the execution environment and providing a dispatcher
/// implementation. These methods are only meant to be called by the kernel.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    /// Port-specific per-task state, stored at the beginning of each task
    /// control block so that low-level dispatch code can refer to it easily.
    type PortTaskState: Send + Sync + Init + fmt::Debug + 'static;

    /// The smallest stack a thread may be created with.
    const STACK_SIZE_MIN: usize = 128;

    /// The largest stack a thread may be created with.
    const STACK_SIZE_MAX: usize = 1 << 20;

    /// Attempt to enter the CPU Lock state (the critical section). Returns
    /// `false` if it was already active.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Enter the CPU Lock state.
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn enter_cpu_lock();

    /// Leave the CPU Lock state.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Return a flag indicating whether the CPU Lock state is active.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the current context is an interrupt
    /// (or otherwise privileged) context.
    fn is_interrupt_context() -> bool;

    /// Return a flag indicating whether the current context is a thread
    /// context.
    fn is_thread_context() -> bool;

    /// Request a deferred reschedule (the PendSV-equivalent). The port calls
    /// [`PortToKernel::scheduler_pendsv`] when the request is honored.
    unsafe fn pend_switch();

    /// Fabricate the initial saved context on the given stack so that the
    /// first dispatch of the task lands in `entry` with a separate stack.
    /// Returns the initial saved stack pointer.
    ///
    /// Precondition: CPU Lock active
    unsafe fn stack_frame_init(entry: fn(), stack: Region) -> usize;

    /// Scan the unused-marker region of the stack to report the unused depth
    /// in bytes.
    fn stack_free_estimate(stack: Region) -> usize;

    /// Transfer the control to the first thread, discarding the current
    /// (startup) context. A hosted simulation port may instead return to the
    /// caller.
    ///
    /// Precondition: CPU Lock active, startup phase
    unsafe fn run_first_thread(psp: usize);
}

/// Implemented by a port. Wires the hardware tick to the timer wheel.
///
/// # Safety
///
/// These methods are only meant to be called by the kernel.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortTimer: Sized + 'static {
    /// Register the tick entry point. The port must arrange for `tick` to be
    /// called periodically from an interrupt context with the number of
    /// microseconds elapsed since the previous call.
    unsafe fn clock_init(tick: unsafe fn(u32));
}

/// Implemented by a port. The supervisor-call trampoline.
///
/// # Safety
///
/// These methods are only meant to be called by the kernel.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortPrivilege: Sized + 'static {
    /// Invoke `routine(packet)` in the privileged context with interrupts
    /// disabled, returning the routine's result in place of the call.
    ///
    /// When called from a context that is already privileged, the port may
    /// dispatch directly instead of raising a synchronous exception.
    unsafe fn call_privileged(routine: fn(usize) -> i32, packet: usize) -> i32;
}

/// Represents the group of traits a port must implement.
pub trait Port: PortThreading + PortTimer + PortPrivilege {}
impl<T: PortThreading + PortTimer + PortPrivilege> Port for T {}

/// Associates a kernel trait type with its static object pools and global
/// state. Use [`build!`] to implement.
///
/// # Safety
///
/// This is only intended to be implemented by [`build!`].
pub unsafe trait KernelCfg: Port + Sized + 'static {
    /// Access the kernel's global state.
    fn state() -> &'static State<Self>;

    fn task_cb_pool() -> &'static [TaskCb<Self>];
    fn semaphore_cb_pool() -> &'static [SemaphoreCb<Self>];
    fn mutex_cb_pool() -> &'static [MutexCb<Self>];
    fn event_cb_pool() -> &'static [EventCb<Self>];
    fn queue_cb_pool() -> &'static [QueueCb<Self>];
    fn timer_cb_pool() -> &'static [TimerCb<Self>];

    /// The stack reserved for the kernel housekeeping thread.
    fn kernel_stack() -> Region;

    /// The stack reserved for the idle thread.
    fn idle_stack() -> Region;
}

/// The complete trait bound of a usable kernel trait type.
pub trait KernelTraits: Port + KernelCfg {}
impl<T: Port + KernelCfg> KernelTraits for T {}

/// Methods intended to be called by a port.
///
/// # Safety
///
/// These are only meant to be called by the port.
#[allow(clippy::missing_safety_doc)]
pub trait PortToKernel {
    /// Run the scheduling point: drain the exit and entry lists and choose
    /// the next running task.
    ///
    /// Precondition: CPU Lock inactive, privileged context
    unsafe fn scheduler_pendsv();

    /// Announce elapsed time to the timer wheel.
    ///
    /// Precondition: CPU Lock inactive, interrupt context
    unsafe fn timer_tick(elapsed_us: u32);
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn scheduler_pendsv() {
        sched::scheduler_pendsv::<Traits>();
    }

    unsafe fn timer_tick(elapsed_us: u32) {
        unsafe { timeout::tick_handler::<Traits>(elapsed_us) };
    }
}

/// Global kernel state.
pub struct State<Traits: PortThreading> {
    /// The currently running task: the pend-list head as of the last
    /// scheduling point.
    pub(crate) running_task: CpuLockCell<Traits, Option<NodeRef<TaskCb<Traits>>>>,

    /// Ready tasks, ordered by priority. The head is the running task.
    pub(crate) pend_list: HeadCell<Traits, TaskCb<Traits>>,

    /// Tasks becoming ready at the next scheduling point.
    pub(crate) entry_list: HeadCell<Traits, TaskCb<Traits>>,

    /// Tasks being suspended at the next scheduling point.
    pub(crate) exit_list: HeadCell<Traits, TaskCb<Traits>>,

    /// Sleeping or suspended tasks with no object-specific queue.
    pub(crate) wait_list: HeadCell<Traits, TaskCb<Traits>>,

    /// Schedule lock nesting counter. While positive, the current task is
    /// always reselected.
    pub(crate) lock_nest: CpuLockCell<Traits, i32>,

    /// The kernel has started scheduling.
    pub(crate) run: AtomicBool,

    /// Monotonic milliseconds captured at the last scheduling point.
    pub(crate) pendsv_ms: CpuLockCell<Traits, u32>,

    pub(crate) timeout: timeout::TimeoutGlobals<Traits>,

    pub(crate) kthread: kthread::KThreadGlobals<Traits>,
}

impl<Traits: PortThreading> Init for State<Traits> {
    const INIT: Self = Self {
        running_task: Init::INIT,
        pend_list: Init::INIT,
        entry_list: Init::INIT,
        exit_list: Init::INIT,
        wait_list: Init::INIT,
        lock_nest: Init::INIT,
        run: AtomicBool::new(false),
        pendsv_ms: Init::INIT,
        timeout: Init::INIT,
        kthread: Init::INIT,
    };
}

/// Provides access to the global API functions exposed by the kernel.
///
/// Operations are associate functions, grouped by object kind across the
/// kernel's modules.
pub struct System<Traits>(PhantomData<Traits>);

/// Implement [`KernelCfg`] on a kernel trait type, instantiating the static
/// object pools and the global kernel state from compile-time capacities.
///
/// `threads` is the application thread capacity; two more slots are reserved
/// for the kernel housekeeping thread and the idle thread.
///
/// ```ignore
/// siskin_kernel::build! {
///     impl KernelCfg for App {
///         threads: 8,
///         semaphores: 4,
///         mutexes: 4,
///         events: 4,
///         queues: 4,
///         timers: 4,
///         kernel_stack: 1024,
///         idle_stack: 256,
///     }
/// }
/// ```
#[macro_export]
macro_rules! build {
    (impl KernelCfg for $Traits:ty {
        threads: $threads:expr,
        semaphores: $semaphores:expr,
        mutexes: $mutexes:expr,
        events: $events:expr,
        queues: $queues:expr,
        timers: $timers:expr,
        kernel_stack: $kernel_stack:expr,
        idle_stack: $idle_stack:expr $(,)?
    }) => {
        const _: () = {
            use $crate::utils::Init;

            static KERNEL_STATE: $crate::State<$Traits> = Init::INIT;

            static TASK_CB_POOL: [$crate::TaskCb<$Traits>; { $threads } + 2] = Init::INIT;
            static SEMAPHORE_CB_POOL: [$crate::SemaphoreCb<$Traits>; { $semaphores } + 1] =
                Init::INIT;
            static MUTEX_CB_POOL: [$crate::MutexCb<$Traits>; $mutexes] = Init::INIT;
            static EVENT_CB_POOL: [$crate::EventCb<$Traits>; $events] = Init::INIT;
            static QUEUE_CB_POOL: [$crate::QueueCb<$Traits>; $queues] = Init::INIT;
            static TIMER_CB_POOL: [$crate::TimerCb<$Traits>; $timers] = Init::INIT;

            static KERNEL_STACK: $crate::Stack<{ $kernel_stack }> = Init::INIT;
            static IDLE_STACK: $crate::Stack<{ $idle_stack }> = Init::INIT;

            unsafe impl $crate::KernelCfg for $Traits {
                #[inline(always)]
                fn state() -> &'static $crate::State<$Traits> {
                    &KERNEL_STATE
                }

                #[inline(always)]
                fn task_cb_pool() -> &'static [$crate::TaskCb<$Traits>] {
                    &TASK_CB_POOL
                }

                #[inline(always)]
                fn semaphore_cb_pool() -> &'static [$crate::SemaphoreCb<$Traits>] {
                    &SEMAPHORE_CB_POOL
                }

                #[inline(always)]
                fn mutex_cb_pool() -> &'static [$crate::MutexCb<$Traits>] {
                    &MUTEX_CB_POOL
                }

                #[inline(always)]
                fn event_cb_pool() -> &'static [$crate::EventCb<$Traits>] {
                    &EVENT_CB_POOL
                }

                #[inline(always)]
                fn queue_cb_pool() -> &'static [$crate::QueueCb<$Traits>] {
                    &QUEUE_CB_POOL
                }

                #[inline(always)]
                fn timer_cb_pool() -> &'static [$crate::TimerCb<$Traits>] {
                    &TIMER_CB_POOL
                }

                #[inline(always)]
                fn kernel_stack() -> $crate::Region {
                    KERNEL_STACK.region()
                }

                #[inline(always)]
                fn idle_stack() -> $crate::Region {
                    IDLE_STACK.region()
                }
            }
        };
    };
}

#[cfg(test)]
pub(crate) mod test_utils {
    /// Define a minimal port type for unit tests. Each invocation gets its
    /// own lock word, so tests using distinct mock ports can run in
    /// parallel.
    macro_rules! mock_port {
        ($name:ident) => {
            struct $name;

            impl $name {
                fn lock_word() -> &'static std::sync::atomic::AtomicBool {
                    static LOCK: std::sync::atomic::AtomicBool =
                        std::sync::atomic::AtomicBool::new(false);
                    &LOCK
                }
            }

            unsafe impl $crate::PortThreading for $name {
                type PortTaskState = ();

                unsafe fn try_enter_cpu_lock() -> bool {
                    !Self::lock_word().swap(true, std::sync::atomic::Ordering::SeqCst)
                }

                unsafe fn enter_cpu_lock() {
                    assert!(unsafe { Self::try_enter_cpu_lock() });
                }

                unsafe fn leave_cpu_lock() {
                    Self::lock_word().store(false, std::sync::atomic::Ordering::SeqCst);
                }

                fn is_cpu_lock_active() -> bool {
                    Self::lock_word().load(std::sync::atomic::Ordering::SeqCst)
                }

                fn is_interrupt_context() -> bool {
                    false
                }

                fn is_thread_context() -> bool {
                    true
                }

                unsafe fn pend_switch() {}

                unsafe fn stack_frame_init(_entry: fn(), stack: $crate::Region) -> usize {
                    stack.top()
                }

                fn stack_free_estimate(_stack: $crate::Region) -> usize {
                    0
                }

                unsafe fn run_first_thread(_psp: usize) {}
            }

            unsafe impl $crate::PortTimer for $name {
                unsafe fn clock_init(_tick: unsafe fn(u32)) {}
            }

            unsafe impl $crate::PortPrivilege for $name {
                unsafe fn call_privileged(routine: fn(usize) -> i32, packet: usize) -> i32 {
                    unsafe { Self::enter_cpu_lock() };
                    let ret = routine(packet);
                    unsafe { Self::leave_cpu_lock() };
                    ret
                }
            }
        };
    }
    pub(crate) use mock_port;
}
