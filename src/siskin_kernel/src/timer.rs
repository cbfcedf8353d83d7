//! Timers.
//!
//! Free-standing timers ride the same wheel as the tasks' internal timeout
//! nodes. When one expires the tick handler flags it and pokes the
//! housekeeping thread, which runs the user callback outside the critical
//! section. Periodic timers are re-armed before the callback runs.
use core::fmt;

use crate::{
    error::{pc, Postcode},
    handle::{Handle, ObjectHead, ObjectKind},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    svc,
    timeout::{self, TimeoutNode},
    utils::Init,
    KernelTraits, PortThreading, System, TIME_FOREVER,
};

/// *Timer control block* — the state data of a timer.
pub struct TimerCb<Traits: PortThreading> {
    pub(crate) head: ObjectHead,

    pub(crate) node: TimeoutNode<Traits>,

    /// Runs on the housekeeping thread after expiry. Must not block.
    pub(crate) callback: CpuLockCell<Traits, Option<fn()>>,

    /// Re-arm interval; zero for one-shot timers.
    pub(crate) period_ms: CpuLockCell<Traits, u32>,

    /// Expired; the housekeeping thread owes a callback run.
    pub(crate) expired: CpuLockCell<Traits, bool>,
}

impl<Traits: PortThreading> Init for TimerCb<Traits> {
    const INIT: Self = Self {
        head: Init::INIT,
        node: Init::INIT,
        callback: Init::INIT,
        period_ms: Init::INIT,
        expired: Init::INIT,
    };
}

impl<Traits: PortThreading> fmt::Debug for TimerCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerCb")
            .field("self", &(self as *const _))
            .field("name", &self.head.name())
            .finish()
    }
}

pub(crate) fn timer_cb<Traits: KernelTraits>(
    handle: Handle,
) -> Result<&'static TimerCb<Traits>, Postcode> {
    let pool = Traits::timer_cb_pool();
    if !handle.is_in_range(ObjectKind::Timer, pool.len()) {
        return Err(pc!(Timer, InvalidHandle));
    }
    let cb = &pool[handle.index()];
    if !cb.head.is_inited() {
        return Err(pc!(Timer, InvalidHandle));
    }
    Ok(cb)
}

fn timer_handle<Traits: KernelTraits>(cb: &'static TimerCb<Traits>) -> Handle {
    let pool = Traits::timer_cb_pool();
    let offset_bytes = cb as *const TimerCb<Traits> as usize - pool.as_ptr() as usize;
    Handle::new(
        ObjectKind::Timer,
        offset_bytes / core::mem::size_of::<TimerCb<Traits>>(),
    )
}

/// Expiry half, run by the tick handler: flag the timer for the
/// housekeeping thread and re-arm it when periodic.
pub(crate) fn expire<Traits: KernelTraits>(
    cb: &'static TimerCb<Traits>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    cb.expired.replace(&mut *lock, true);
    let period = cb.period_ms.get(&*lock);
    if period != 0 {
        timeout::set(&cb.node, period, lock.borrow_mut());
    }
}

/// Callback half, run by the housekeeping thread. Expired timers are
/// collected in batches under the CPU lock and their callbacks run with the
/// lock released.
pub(crate) fn run_expired<Traits: KernelTraits>() {
    let mut batch: arrayvec::ArrayVec<fn(), 8> = arrayvec::ArrayVec::new();
    loop {
        batch.clear();
        {
            let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
                return;
            };
            for cb in Traits::timer_cb_pool() {
                if batch.is_full() {
                    break;
                }
                if !cb.head.is_inited() || !cb.expired.get(&*lock) {
                    continue;
                }
                cb.expired.replace(&mut *lock, false);
                if let Some(f) = cb.callback.get(&*lock) {
                    batch.push(f);
                }
            }
        }
        if batch.is_empty() {
            return;
        }
        for f in &batch {
            f();
        }
    }
}

struct InitArgs {
    callback: Option<fn()>,
    name: &'static str,
}

fn init_routine<Traits: KernelTraits>(packet: usize) -> i32 {
    // Safety: dispatched by the trampoline inside a critical section
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    // Safety: `packet` is the argument struct built by `timer_init`
    let args = unsafe { svc::packet_args::<InitArgs>(packet) };
    let pool = Traits::timer_cb_pool();
    let ret = match pool.iter().find(|cb| !cb.head.is_inited()) {
        Some(cb) => {
            cb.head.claim(args.name);
            cb.callback.replace(&mut *lock, args.callback);
            timeout::bind_to_timer(&cb.node, cb, lock.borrow_mut());
            timer_handle::<Traits>(cb).raw() as i32
        }
        None => pc!(Timer, Exhausted).raw(),
    };
    core::mem::forget(lock);
    ret
}

struct StartArgs<Traits: PortThreading> {
    cb: &'static TimerCb<Traits>,
    timeout_ms: u32,
    period_ms: u32,
}

fn start_routine<Traits: KernelTraits>(packet: usize) -> i32 {
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    let args = unsafe { svc::packet_args::<StartArgs<Traits>>(packet) };
    args.cb.period_ms.replace(&mut *lock, args.period_ms);
    args.cb.expired.replace(&mut *lock, false);
    timeout::set(&args.cb.node, args.timeout_ms, lock.borrow_mut());
    core::mem::forget(lock);
    0
}

struct StopArgs<Traits: PortThreading> {
    cb: &'static TimerCb<Traits>,
}

fn stop_routine<Traits: KernelTraits>(packet: usize) -> i32 {
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    let args = unsafe { svc::packet_args::<StopArgs<Traits>>(packet) };
    args.cb.period_ms.replace(&mut *lock, 0);
    timeout::remove(&args.cb.node, lock.borrow_mut());
    core::mem::forget(lock);
    0
}

/// These associate functions implement the timer portion of the public API.
impl<Traits: KernelTraits> System<Traits> {
    /// Create a timer. The callback runs on the housekeeping thread and must
    /// not block.
    pub fn timer_init(callback: fn(), name: &'static str) -> Result<Handle, Postcode> {
        let args = InitArgs {
            callback: Some(callback),
            name,
        };
        let raw = svc::invoke::<Traits, _>(init_routine::<Traits>, &args);
        match Postcode::from_raw(raw) {
            Ok(()) => Ok(Handle::from_raw(raw as u32)),
            Err(code) => Err(code),
        }
    }

    /// Arm the timer to fire in `timeout_ms` milliseconds, and every
    /// `timeout_ms` after that when `periodic`. A zero delay fires on the
    /// next tick, not immediately.
    pub fn timer_start(handle: Handle, timeout_ms: u32, periodic: bool) -> Result<(), Postcode> {
        let cb = timer_cb::<Traits>(handle)?;
        if timeout_ms >= TIME_FOREVER || (periodic && timeout_ms == 0) {
            return Err(pc!(Timer, InvalidArgument));
        }
        let args = StartArgs {
            cb,
            timeout_ms,
            period_ms: if periodic { timeout_ms } else { 0 },
        };
        Postcode::from_raw(svc::invoke::<Traits, _>(start_routine::<Traits>, &args))
    }

    /// Disarm the timer.
    pub fn timer_stop(handle: Handle) -> Result<(), Postcode> {
        let cb = timer_cb::<Traits>(handle)?;
        let args = StopArgs { cb };
        Postcode::from_raw(svc::invoke::<Traits, _>(stop_routine::<Traits>, &args))
    }

    /// `true` iff the timer is armed.
    pub fn timer_is_busy(handle: Handle) -> Result<bool, Postcode> {
        let cb = timer_cb::<Traits>(handle)?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        Ok(timeout::is_busy(&cb.node, lock.borrow_mut().borrow()))
    }

    /// Monotonic milliseconds since the kernel clock started.
    pub fn timer_total_ms() -> Result<u32, Postcode> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        Ok(timeout::total_ms::<Traits>(lock.borrow_mut().borrow()))
    }
}
