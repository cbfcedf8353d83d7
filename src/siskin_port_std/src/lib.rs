//! A hosted simulation port for the Siskin kernel.
//!
//! The port models the target's execution modes with a handful of atomics:
//! a CPU-lock word, a privileged-call depth, and a deferred-reschedule flag.
//! "PendSV" is delivered synchronously at the moment the outermost
//! privileged call (or simulated tick interrupt) finishes, which is exactly
//! when the hardware exception would tail-chain on a real target.
//!
//! No context switching takes place: the scheduler's bookkeeping — the four
//! task lists, the running-task pointer, the wake-up channels — is what runs
//! here, and the test driver acts on behalf of whichever task the scheduler
//! last picked. Blocking calls therefore surface the kernel's internal
//! unavailable marker to the driver instead of suspending it; the driver
//! delivers the wake-up and then reads the woken task's channel, the same
//! thing the resumed thread would do on hardware.

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate siskin_kernel;
/// Used by `use_port!`
#[doc(hidden)]
pub extern crate log;

/// Instantiate the port on a fresh kernel trait type.
///
/// ```ignore
/// siskin_port_std::use_port!(struct App);
/// siskin_kernel::build! {
///     impl KernelCfg for App { /* capacities */ }
/// }
/// ```
///
/// Each instantiation owns its port state, so multiple kernel instances can
/// coexist in one test binary.
#[macro_export]
macro_rules! use_port {
    (struct $name:ident) => {
        struct $name;

        impl $name {
            fn port_lock_word() -> &'static ::std::sync::atomic::AtomicBool {
                static LOCK: ::std::sync::atomic::AtomicBool =
                    ::std::sync::atomic::AtomicBool::new(false);
                &LOCK
            }

            fn port_pend_word() -> &'static ::std::sync::atomic::AtomicBool {
                static PEND: ::std::sync::atomic::AtomicBool =
                    ::std::sync::atomic::AtomicBool::new(false);
                &PEND
            }

            fn port_priv_depth() -> &'static ::std::sync::atomic::AtomicUsize {
                static DEPTH: ::std::sync::atomic::AtomicUsize =
                    ::std::sync::atomic::AtomicUsize::new(0);
                &DEPTH
            }

            fn port_tick_entry() -> &'static ::std::sync::atomic::AtomicUsize {
                static TICK: ::std::sync::atomic::AtomicUsize =
                    ::std::sync::atomic::AtomicUsize::new(0);
                &TICK
            }

            /// Run the deferred reschedule if one is pending and every
            /// privileged frame has unwound.
            fn port_dispatch_pending() {
                use ::std::sync::atomic::Ordering;
                use $crate::siskin_kernel::PortToKernel;
                while Self::port_priv_depth().load(Ordering::SeqCst) == 0
                    && !Self::port_lock_word().load(Ordering::SeqCst)
                    && Self::port_pend_word().swap(false, Ordering::SeqCst)
                {
                    $crate::log::trace!(
                        concat!(stringify!($name), ": delivering deferred reschedule")
                    );
                    // Safety: CPU lock inactive, outside any privileged frame
                    unsafe { <$name as PortToKernel>::scheduler_pendsv() };
                }
            }

            /// Simulate the periodic tick interrupt: `elapsed_us`
            /// microseconds have passed.
            pub fn tick(elapsed_us: u32) {
                use ::std::sync::atomic::Ordering;
                let entry = Self::port_tick_entry().load(Ordering::SeqCst);
                assert!(entry != 0, "clock not initialized; call run() first");
                let entry: unsafe fn(u32) = unsafe { ::core::mem::transmute(entry) };
                Self::port_priv_depth().fetch_add(1, Ordering::SeqCst);
                // Safety: interrupt context modeled by the depth counter
                unsafe { entry(elapsed_us) };
                Self::port_priv_depth().fetch_sub(1, Ordering::SeqCst);
                Self::port_dispatch_pending();
            }

            /// Keep driving the housekeeping thread while the scheduler has
            /// it selected, then return with an application thread (or the
            /// idle thread) current.
            pub fn advance_housekeeping() {
                type Sys = $crate::siskin_kernel::System<$name>;
                loop {
                    let Ok(current) = Sys::current_thread() else { break };
                    let Ok(keeper) = Sys::kernel_schedule_thread() else { break };
                    if current != keeper {
                        break;
                    }
                    let _ = Sys::kernel_housekeeping_iteration();
                }
            }
        }

        unsafe impl $crate::siskin_kernel::PortThreading for $name {
            type PortTaskState = ();

            unsafe fn try_enter_cpu_lock() -> bool {
                !Self::port_lock_word().swap(true, ::std::sync::atomic::Ordering::SeqCst)
            }

            unsafe fn enter_cpu_lock() {
                let ok = unsafe { <Self as $crate::siskin_kernel::PortThreading>::try_enter_cpu_lock() };
                assert!(ok, "CPU lock already active");
            }

            unsafe fn leave_cpu_lock() {
                Self::port_lock_word().store(false, ::std::sync::atomic::Ordering::SeqCst);
            }

            fn is_cpu_lock_active() -> bool {
                Self::port_lock_word().load(::std::sync::atomic::Ordering::SeqCst)
            }

            fn is_interrupt_context() -> bool {
                Self::port_priv_depth().load(::std::sync::atomic::Ordering::SeqCst) > 0
            }

            fn is_thread_context() -> bool {
                Self::port_priv_depth().load(::std::sync::atomic::Ordering::SeqCst) == 0
            }

            unsafe fn pend_switch() {
                Self::port_pend_word().store(true, ::std::sync::atomic::Ordering::SeqCst);
            }

            unsafe fn stack_frame_init(
                _entry: fn(),
                stack: $crate::siskin_kernel::Region,
            ) -> usize {
                // No machine context to fabricate; the saved stack pointer
                // starts at the top of the (painted) stack
                stack.top()
            }

            fn stack_free_estimate(stack: $crate::siskin_kernel::Region) -> usize {
                $crate::stack_free_estimate(stack)
            }

            unsafe fn run_first_thread(_psp: usize) {
                // A hosted simulation returns to the caller, which then
                // drives the kernel explicitly
            }
        }

        unsafe impl $crate::siskin_kernel::PortTimer for $name {
            unsafe fn clock_init(tick: unsafe fn(u32)) {
                Self::port_tick_entry()
                    .store(tick as usize, ::std::sync::atomic::Ordering::SeqCst);
            }
        }

        unsafe impl $crate::siskin_kernel::PortPrivilege for $name {
            unsafe fn call_privileged(routine: fn(usize) -> i32, packet: usize) -> i32 {
                use ::std::sync::atomic::Ordering;
                use $crate::siskin_kernel::PortThreading;
                Self::port_priv_depth().fetch_add(1, Ordering::SeqCst);
                // Safety: CPU lock inactive on entry to a privileged call
                unsafe { <Self as PortThreading>::enter_cpu_lock() };
                let ret = routine(packet);
                // Safety: the routine leaves the lock held for us to release
                unsafe { <Self as PortThreading>::leave_cpu_lock() };
                Self::port_priv_depth().fetch_sub(1, Ordering::SeqCst);
                Self::port_dispatch_pending();
                ret
            }
        }
    };
}

/// Scan the painted marker region of a stack to estimate its unused depth.
/// Stacks grow downwards, so the unused bytes sit at the base.
pub fn stack_free_estimate(stack: siskin_kernel::Region) -> usize {
    let mut free = 0;
    // Safety: the region was handed to the kernel as a stack and stays
    // allocated for the program's lifetime
    unsafe {
        let base = stack.base();
        while free < stack.len() && *base.add(free) == siskin_kernel::STACK_UNUSED_MARKER {
            free += 1;
        }
    }
    free
}
