//! The kernel's own threads and the boot sequence.
//!
//! Two reserved threads are created before the first application thread
//! runs: the housekeeping thread at the most urgent priority, which sleeps
//! on the kernel notification semaphore and runs timer and event callbacks,
//! and the idle thread at the least urgent priority, which guarantees the
//! pend list is never empty.
use crate::{
    error::{pc, Kind, Postcode},
    handle::Handle,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    sched, semaphore, svc, task, timer,
    utils::{list, Init},
    KernelTraits, PortThreading, System, PRIORITY_IDLE, PRIORITY_KERNEL, TIME_FOREVER,
};

pub(crate) struct KThreadGlobals<Traits: PortThreading> {
    pub(crate) schedule_thread: CpuLockCell<Traits, Handle>,
    pub(crate) idle_thread: CpuLockCell<Traits, Handle>,
    /// The kernel notification semaphore: given by interrupt-side producers,
    /// taken by the housekeeping thread.
    pub(crate) notify_sem: CpuLockCell<Traits, Handle>,
}

impl<Traits: PortThreading> Init for KThreadGlobals<Traits> {
    const INIT: Self = Self {
        schedule_thread: Init::INIT,
        idle_thread: Init::INIT,
        notify_sem: Init::INIT,
    };
}

/// Post a kernel notification: nudge the housekeeping thread. Safe to call
/// with the CPU lock held, from the tick handler or an event publication.
pub(crate) fn notify<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let handle = Traits::state().kthread.notify_sem.get(&*lock);
    let Ok(cb) = semaphore::semaphore_cb::<Traits>(handle) else {
        return;
    };
    // A full notification box already guarantees a wake-up
    let _ = semaphore::give_core::<Traits>(cb, lock.borrow_mut());
}

fn schedule_thread_body<Traits: KernelTraits>() {
    loop {
        if System::<Traits>::kernel_housekeeping_iteration().is_err() {
            break;
        }
    }
}

fn idle_thread_body<Traits: KernelTraits>() {
    loop {
        core::hint::spin_loop();
    }
}

fn start_routine<Traits: KernelTraits>(_packet: usize) -> i32 {
    // Safety: dispatched by the trampoline inside a critical section
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    let ret = (|| {
        let state = Traits::state();

        let sem = semaphore::init_semaphore_in_slot::<Traits>(
            0,
            semaphore::SEMAPHORE_LIMIT_MAX,
            "kernel",
            lock.borrow_mut(),
        )?;
        state.kthread.notify_sem.replace(&mut *lock, sem);

        let schedule = task::init_task_in_slot::<Traits>(
            schedule_thread_body::<Traits>,
            Traits::kernel_stack(),
            PRIORITY_KERNEL,
            "kernel",
            lock.borrow_mut(),
        )?;
        state.kthread.schedule_thread.replace(&mut *lock, schedule);

        let idle = task::init_task_in_slot::<Traits>(
            idle_thread_body::<Traits>,
            Traits::idle_stack(),
            PRIORITY_IDLE,
            "idle",
            lock.borrow_mut(),
        )?;
        state.kthread.idle_thread.replace(&mut *lock, idle);

        // Safety: CPU lock active, boot phase
        unsafe { Traits::clock_init(crate::timeout::tick_handler::<Traits>) };

        let first = list::first(sched::pend_list::<Traits>(), lock.borrow_mut().borrow());
        state.running_task.replace(&mut *lock, first);
        state.run.store(true, core::sync::atomic::Ordering::Release);
        Ok(())
    })();
    core::mem::forget(lock);
    task::postcode_or_zero(ret)
}

/// These associate functions implement the kernel lifecycle portion of the
/// public API.
impl<Traits: KernelTraits> System<Traits> {
    /// Start scheduling: create the reserved threads and the notification
    /// semaphore, wire the clock, and dispatch the first thread. On a real
    /// port this never returns.
    pub fn run() -> Result<(), Postcode> {
        if Self::is_running() {
            return Err(pc!(KThread, StateViolation));
        }
        let args = ();
        Postcode::from_raw(svc::invoke::<Traits, ()>(start_routine::<Traits>, &args))?;

        let psp = {
            let mut lock = klock::lock_cpu::<Traits>()?;
            let running = sched::running_task::<Traits>(lock.borrow_mut().borrow());
            match running {
                Some(task) => task.get().psp.get(&*lock),
                None => return Err(pc!(KThread, StateViolation)),
            }
        };
        // Safety: CPU lock inactive, startup phase complete. On a real port
        // this call never returns.
        unsafe {
            Traits::run_first_thread(psp);
        }
        Ok(())
    }

    /// `true` once [`run`](Self::run) has started scheduling.
    pub fn is_running() -> bool {
        Traits::state()
            .run
            .load(core::sync::atomic::Ordering::Acquire)
    }

    /// One iteration of the housekeeping thread's loop: sleep on the kernel
    /// notification semaphore, then run the timer and event callbacks that
    /// have come due.
    ///
    /// This is the body of the reserved highest-priority thread; a
    /// simulation port drives it explicitly.
    pub fn kernel_housekeeping_iteration() -> Result<(), Postcode> {
        // Consume a wake-up that was delivered while blocked on the
        // notification semaphore. On a real port the resumed take consumes
        // it; a simulation driver arrives here with the channel still
        // loaded.
        if Self::schedule_result_take().is_ok() {
            timer::run_expired::<Traits>();
            crate::event::run_fired::<Traits>();
            return Ok(());
        }

        let sem = {
            let lock = klock::lock_cpu::<Traits>()?;
            *Traits::state().kthread.notify_sem.read(&*lock)
        };
        match Self::semaphore_take(sem, TIME_FOREVER) {
            Ok(()) => {
                timer::run_expired::<Traits>();
                crate::event::run_fired::<Traits>();
                Ok(())
            }
            Err(code) if code.kind() == Kind::Unavailable => {
                // Hosted simulation only: the thread is now blocked and the
                // driver must deliver the next notification
                Err(code)
            }
            Err(code) => Err(code),
        }
    }

    /// The handle of the reserved housekeeping thread.
    pub fn kernel_schedule_thread() -> Result<Handle, Postcode> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(*Traits::state().kthread.schedule_thread.read(&*lock))
    }

    /// The handle of the reserved idle thread.
    pub fn kernel_idle_thread() -> Result<Handle, Postcode> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(*Traits::state().kthread.idle_thread.read(&*lock))
    }
}
