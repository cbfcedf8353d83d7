//! Counting semaphores.
use core::fmt;

use crate::{
    error::{self, pc, Kind, Postcode},
    handle::{Handle, ObjectHead, ObjectKind},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    sched::{self, PendCtx, PendPayload},
    svc,
    task::{postcode_or_zero, TaskCb},
    utils::{
        list::{self, HeadCell, HeadRef},
        Init,
    },
    KernelTraits, PortThreading, System,
};

/// The hard upper bound on a semaphore's limit.
pub const SEMAPHORE_LIMIT_MAX: u8 = 254;

/// The limit of a binary semaphore.
pub const SEMAPHORE_BINARY: u8 = 1;

/// *Semaphore control block* — the state data of a semaphore.
pub struct SemaphoreCb<Traits: PortThreading> {
    pub(crate) head: ObjectHead,
    pub(crate) remaining: CpuLockCell<Traits, u8>,
    pub(crate) limit: CpuLockCell<Traits, u8>,
    pub(crate) wait_queue: HeadCell<Traits, TaskCb<Traits>>,
}

impl<Traits: PortThreading> Init for SemaphoreCb<Traits> {
    const INIT: Self = Self {
        head: Init::INIT,
        remaining: Init::INIT,
        limit: Init::INIT,
        wait_queue: Init::INIT,
    };
}

impl<Traits: PortThreading> fmt::Debug for SemaphoreCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SemaphoreCb")
            .field("self", &(self as *const _))
            .field("name", &self.head.name())
            .finish()
    }
}

pub(crate) fn semaphore_cb<Traits: KernelTraits>(
    handle: Handle,
) -> Result<&'static SemaphoreCb<Traits>, Postcode> {
    let pool = Traits::semaphore_cb_pool();
    if !handle.is_in_range(ObjectKind::Semaphore, pool.len()) {
        return Err(pc!(Semaphore, InvalidHandle));
    }
    let cb = &pool[handle.index()];
    if !cb.head.is_inited() {
        return Err(pc!(Semaphore, InvalidHandle));
    }
    Ok(cb)
}

fn semaphore_handle<Traits: KernelTraits>(cb: &'static SemaphoreCb<Traits>) -> Handle {
    let pool = Traits::semaphore_cb_pool();
    let offset_bytes = cb as *const SemaphoreCb<Traits> as usize - pool.as_ptr() as usize;
    Handle::new(
        ObjectKind::Semaphore,
        offset_bytes / core::mem::size_of::<SemaphoreCb<Traits>>(),
    )
}

/// Claim a free semaphore slot. Shared between the public privileged routine
/// and the kernel notification semaphore.
pub(crate) fn init_semaphore_in_slot<Traits: KernelTraits>(
    remaining: u8,
    limit: u8,
    name: &'static str,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) -> Result<Handle, Postcode> {
    let pool = Traits::semaphore_cb_pool();
    let Some(cb) = pool.iter().find(|cb| !cb.head.is_inited()) else {
        return Err(pc!(Semaphore, Exhausted));
    };

    cb.head.claim(name);
    cb.remaining.replace(&mut *lock, remaining);
    cb.limit.replace(&mut *lock, limit);
    Ok(semaphore_handle::<Traits>(cb))
}

/// Wake-up epilogue for a released waiter: consume the permit it was handed.
/// Runs inside the scheduling point, so the count balance holds whether the
/// waiter woke by release or by timeout (the timeout wake carries no
/// epilogue and leaves the count untouched).
fn semaphore_wake_epilogue<Traits: KernelTraits>(
    task: &'static TaskCb<Traits>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    let Some(ctx) = *task.pend_ctx.read(&*lock) else {
        return;
    };
    // Safety: the pend context of a semaphore waiter is its semaphore
    let cb: &'static SemaphoreCb<Traits> = unsafe { ctx.cast() };
    let remaining = cb.remaining.get(&*lock);
    debug_assert!(remaining > 0);
    cb.remaining.replace(&mut *lock, remaining.saturating_sub(1));
}

/// Release one permit. If a waiter exists, it is handed the permit through
/// its wake-up epilogue. Fails above the limit.
pub(crate) fn give_core<Traits: KernelTraits>(
    cb: &'static SemaphoreCb<Traits>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) -> Result<(), Postcode> {
    let remaining = cb.remaining.get(&*lock);
    if remaining >= cb.limit.get(&*lock) {
        return Err(pc!(Semaphore, StateViolation));
    }
    cb.remaining.replace(&mut *lock, remaining + 1);

    let queue = HeadRef::new(&cb.wait_queue);
    if let Some(waiter) = list::first(queue, lock.borrow()) {
        sched::entry_trigger(
            waiter.get(),
            Some(semaphore_wake_epilogue::<Traits>),
            error::WAKE_SUCCESS,
            lock.borrow_mut(),
        );
    }
    Ok(())
}

struct InitArgs {
    remaining: u8,
    limit: u8,
    name: &'static str,
}

fn init_routine<Traits: KernelTraits>(packet: usize) -> i32 {
    // Safety: dispatched by the trampoline inside a critical section
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    // Safety: `packet` is the argument struct built by `semaphore_init`
    let args = unsafe { svc::packet_args::<InitArgs>(packet) };
    let ret = match init_semaphore_in_slot::<Traits>(
        args.remaining,
        args.limit,
        args.name,
        lock.borrow_mut(),
    ) {
        Ok(handle) => handle.raw() as i32,
        Err(code) => code.raw(),
    };
    core::mem::forget(lock);
    ret
}

struct TakeArgs<Traits: PortThreading> {
    cb: &'static SemaphoreCb<Traits>,
    timeout_ms: u32,
}

fn take_routine<Traits: KernelTraits>(packet: usize) -> i32 {
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    let args = unsafe { svc::packet_args::<TakeArgs<Traits>>(packet) };
    let ret = (|| {
        let cb = args.cb;
        let remaining = cb.remaining.get(&*lock);
        if remaining > 0 {
            cb.remaining.replace(&mut *lock, remaining - 1);
            return Ok(());
        }

        let Some(running) = sched::running_task::<Traits>(lock.borrow_mut().borrow()) else {
            return Err(pc!(Semaphore, WrongContext));
        };
        sched::exit_trigger(
            running.get(),
            Some(PendCtx::new(cb)),
            PendPayload::None,
            Some(HeadRef::new(&cb.wait_queue)),
            args.timeout_ms,
            true,
            lock.borrow_mut(),
        );
        Err(pc!(Semaphore, Unavailable))
    })();
    core::mem::forget(lock);
    postcode_or_zero(ret)
}

struct GiveArgs<Traits: PortThreading> {
    cb: &'static SemaphoreCb<Traits>,
}

fn give_routine<Traits: KernelTraits>(packet: usize) -> i32 {
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    let args = unsafe { svc::packet_args::<GiveArgs<Traits>>(packet) };
    let ret = give_core::<Traits>(args.cb, lock.borrow_mut());
    core::mem::forget(lock);
    postcode_or_zero(ret)
}

fn flush_routine<Traits: KernelTraits>(packet: usize) -> i32 {
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    let args = unsafe { svc::packet_args::<GiveArgs<Traits>>(packet) };
    let cb = args.cb;
    let queue = HeadRef::new(&cb.wait_queue);
    // Every waiter leaves with success; the permits pass straight through,
    // so the count never moves
    while let Some(waiter) = list::first(queue, lock.borrow_mut().borrow()) {
        sched::entry_trigger(
            waiter.get(),
            None,
            error::WAKE_SUCCESS,
            lock.borrow_mut(),
        );
    }
    core::mem::forget(lock);
    0
}

/// These associate functions implement the semaphore portion of the public
/// API.
impl<Traits: KernelTraits> System<Traits> {
    /// Create a counting semaphore. `limit` is capped at
    /// [`SEMAPHORE_LIMIT_MAX`]; [`SEMAPHORE_BINARY`] gives a binary
    /// semaphore.
    pub fn semaphore_init(
        remaining: u8,
        limit: u8,
        name: &'static str,
    ) -> Result<Handle, Postcode> {
        if limit == 0 || limit > SEMAPHORE_LIMIT_MAX || remaining > limit {
            return Err(pc!(Semaphore, InvalidArgument));
        }
        let args = InitArgs {
            remaining,
            limit,
            name,
        };
        let raw = svc::invoke::<Traits, _>(init_routine::<Traits>, &args);
        match Postcode::from_raw(raw) {
            Ok(()) => Ok(Handle::from_raw(raw as u32)),
            Err(code) => Err(code),
        }
    }

    /// Acquire one permit, blocking up to `timeout_ms` milliseconds
    /// ([`TIME_FOREVER`](crate::TIME_FOREVER) blocks indefinitely).
    pub fn semaphore_take(handle: Handle, timeout_ms: u32) -> Result<(), Postcode> {
        let cb = semaphore_cb::<Traits>(handle)?;
        if timeout_ms == 0 {
            return Err(pc!(Semaphore, InvalidArgument));
        }
        if !Traits::is_thread_context() {
            return Err(pc!(Semaphore, WrongContext));
        }
        let caller = Self::caller_task()?;
        let args = TakeArgs {
            cb,
            timeout_ms,
        };
        let raw = svc::invoke::<Traits, _>(take_routine::<Traits>, &args);
        match Postcode::from_raw(raw) {
            Err(code) if code.kind() == Kind::Unavailable => {
                sched::blocking_finish::<Traits>(caller)
            }
            other => other,
        }
    }

    /// Release one permit. Fails with a state violation above the limit.
    pub fn semaphore_give(handle: Handle) -> Result<(), Postcode> {
        let cb = semaphore_cb::<Traits>(handle)?;
        let args = GiveArgs { cb };
        Postcode::from_raw(svc::invoke::<Traits, _>(give_routine::<Traits>, &args))
    }

    /// Release every waiter with success. The count is unchanged.
    pub fn semaphore_flush(handle: Handle) -> Result<(), Postcode> {
        let cb = semaphore_cb::<Traits>(handle)?;
        let args = GiveArgs { cb };
        Postcode::from_raw(svc::invoke::<Traits, _>(flush_routine::<Traits>, &args))
    }

    /// The number of permits currently available.
    pub fn semaphore_count(handle: Handle) -> Result<u8, Postcode> {
        let cb = semaphore_cb::<Traits>(handle)?;
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(*cb.remaining.read(&*lock))
    }
}
