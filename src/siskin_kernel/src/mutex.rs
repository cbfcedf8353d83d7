//! Mutexes with priority inheritance.
use core::fmt;

use crate::{
    error::{self, pc, Kind, Postcode},
    handle::{Handle, ObjectHead, ObjectKind},
    klock::{self, CpuLockCell},
    sched::{self, PendCtx, PendPayload, TaskRef},
    svc,
    task::{postcode_or_zero, TaskCb},
    utils::{
        list::{self, HeadCell, HeadRef},
        Init,
    },
    KernelTraits, PortThreading, Priority, System, TIME_FOREVER,
};

/// *Mutex control block* — the state data of a mutex.
///
/// Mutexes are not recursive: a second lock by the holder is a state
/// violation. While held, the holder's effective priority is kept at least
/// as urgent as its most urgent waiter; the pre-lock priority is snapshotted
/// here and restored at unlock.
pub struct MutexCb<Traits: PortThreading> {
    pub(crate) head: ObjectHead,

    /// The task currently holding the lock.
    pub(crate) holder: CpuLockCell<Traits, Option<TaskRef<Traits>>>,

    /// The holder's priority at the moment it took the lock.
    pub(crate) original_priority: CpuLockCell<Traits, Priority>,

    /// Blocked requesters, ordered by priority.
    pub(crate) wait_queue: HeadCell<Traits, TaskCb<Traits>>,
}

impl<Traits: PortThreading> Init for MutexCb<Traits> {
    const INIT: Self = Self {
        head: Init::INIT,
        holder: Init::INIT,
        original_priority: Init::INIT,
        wait_queue: Init::INIT,
    };
}

impl<Traits: PortThreading> fmt::Debug for MutexCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MutexCb")
            .field("self", &(self as *const _))
            .field("name", &self.head.name())
            .finish()
    }
}

pub(crate) fn mutex_cb<Traits: KernelTraits>(
    handle: Handle,
) -> Result<&'static MutexCb<Traits>, Postcode> {
    let pool = Traits::mutex_cb_pool();
    if !handle.is_in_range(ObjectKind::Mutex, pool.len()) {
        return Err(pc!(Mutex, InvalidHandle));
    }
    let cb = &pool[handle.index()];
    if !cb.head.is_inited() {
        return Err(pc!(Mutex, InvalidHandle));
    }
    Ok(cb)
}

fn mutex_handle<Traits: KernelTraits>(cb: &'static MutexCb<Traits>) -> Handle {
    let pool = Traits::mutex_cb_pool();
    let offset_bytes = cb as *const MutexCb<Traits> as usize - pool.as_ptr() as usize;
    Handle::new(
        ObjectKind::Mutex,
        offset_bytes / core::mem::size_of::<MutexCb<Traits>>(),
    )
}

struct InitArgs {
    name: &'static str,
}

fn init_routine<Traits: KernelTraits>(packet: usize) -> i32 {
    // Safety: dispatched by the trampoline inside a critical section
    let lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    // Safety: `packet` is the argument struct built by `mutex_init`
    let args = unsafe { svc::packet_args::<InitArgs>(packet) };
    let pool = Traits::mutex_cb_pool();
    let ret = match pool.iter().find(|cb| !cb.head.is_inited()) {
        Some(cb) => {
            cb.head.claim(args.name);
            mutex_handle::<Traits>(cb).raw() as i32
        }
        None => pc!(Mutex, Exhausted).raw(),
    };
    core::mem::forget(lock);
    ret
}

struct OpArgs<Traits: PortThreading> {
    cb: &'static MutexCb<Traits>,
}

fn lock_routine<Traits: KernelTraits>(packet: usize) -> i32 {
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    let args = unsafe { svc::packet_args::<OpArgs<Traits>>(packet) };
    let ret = (|| {
        let cb = args.cb;
        let Some(running) = sched::running_task::<Traits>(lock.borrow_mut().borrow()) else {
            return Err(pc!(Mutex, WrongContext));
        };
        let requester = running.get();

        match *cb.holder.read(&*lock) {
            None => {
                cb.holder.replace(&mut *lock, Some(running));
                let requester_priority = requester.priority.get(&*lock);
                cb.original_priority.replace(&mut *lock, requester_priority);
                Ok(())
            }
            Some(holder) if holder == running => {
                // Not recursive: a second lock would deadlock
                Err(pc!(Mutex, StateViolation))
            }
            Some(holder) => {
                let holder = holder.get();
                let requester_priority = requester.priority.get(&*lock);
                if requester_priority < holder.priority.get(&*lock) {
                    // Inherit: raise the holder to the requester's urgency
                    holder.priority.replace(&mut *lock, requester_priority);
                    sched::reposition(holder, lock.borrow_mut());
                }
                sched::exit_trigger(
                    requester,
                    Some(PendCtx::new(cb)),
                    PendPayload::None,
                    Some(HeadRef::new(&cb.wait_queue)),
                    TIME_FOREVER,
                    true,
                    lock.borrow_mut(),
                );
                Err(pc!(Mutex, Unavailable))
            }
        }
    })();
    core::mem::forget(lock);
    postcode_or_zero(ret)
}

fn unlock_routine<Traits: KernelTraits>(packet: usize) -> i32 {
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    let args = unsafe { svc::packet_args::<OpArgs<Traits>>(packet) };
    let ret = (|| {
        let cb = args.cb;
        let Some(running) = sched::running_task::<Traits>(lock.borrow_mut().borrow()) else {
            return Err(pc!(Mutex, WrongContext));
        };
        if *cb.holder.read(&*lock) != Some(running) {
            // Only the holder may unlock
            return Err(pc!(Mutex, StateViolation));
        }

        // Shed any inherited urgency
        let original = cb.original_priority.get(&*lock);
        running.get().priority.replace(&mut *lock, original);
        sched::reposition(running.get(), lock.borrow_mut());

        let queue = HeadRef::new(&cb.wait_queue);
        if let Some(next) = list::first(queue, lock.borrow()) {
            // Hand the lock to the most urgent waiter
            let next_task = next.get();
            cb.holder.replace(&mut *lock, Some(next));
            let next_priority = next_task.priority.get(&*lock);
            cb.original_priority.replace(&mut *lock, next_priority);
            sched::entry_trigger(
                next_task,
                None,
                error::WAKE_SUCCESS,
                lock.borrow_mut(),
            );
        } else {
            cb.holder.replace(&mut *lock, None);
        }
        Ok(())
    })();
    core::mem::forget(lock);
    postcode_or_zero(ret)
}

/// These associate functions implement the mutex portion of the public API.
impl<Traits: KernelTraits> System<Traits> {
    /// Create a mutex.
    pub fn mutex_init(name: &'static str) -> Result<Handle, Postcode> {
        let args = InitArgs { name };
        let raw = svc::invoke::<Traits, _>(init_routine::<Traits>, &args);
        match Postcode::from_raw(raw) {
            Ok(()) => Ok(Handle::from_raw(raw as u32)),
            Err(code) => Err(code),
        }
    }

    /// Acquire the lock, inheriting the caller's priority into the holder
    /// and blocking until the lock is handed over.
    pub fn mutex_lock(handle: Handle) -> Result<(), Postcode> {
        let cb = mutex_cb::<Traits>(handle)?;
        if !Traits::is_thread_context() {
            return Err(pc!(Mutex, WrongContext));
        }
        let caller = Self::caller_task()?;
        let args = OpArgs { cb };
        let raw = svc::invoke::<Traits, _>(lock_routine::<Traits>, &args);
        match Postcode::from_raw(raw) {
            Err(code) if code.kind() == Kind::Unavailable => {
                sched::blocking_finish::<Traits>(caller)
            }
            other => other,
        }
    }

    /// Release the lock, restoring the holder's pre-lock priority and
    /// handing the lock to the most urgent waiter, if any.
    pub fn mutex_unlock(handle: Handle) -> Result<(), Postcode> {
        let cb = mutex_cb::<Traits>(handle)?;
        if !Traits::is_thread_context() {
            return Err(pc!(Mutex, WrongContext));
        }
        let args = OpArgs { cb };
        Postcode::from_raw(svc::invoke::<Traits, _>(unlock_routine::<Traits>, &args))
    }

    /// The thread currently holding the lock, if any.
    pub fn mutex_holder(handle: Handle) -> Result<Option<Handle>, Postcode> {
        let cb = mutex_cb::<Traits>(handle)?;
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(cb
            .holder
            .read(&*lock)
            .map(|t| crate::task::task_handle::<Traits>(t.get())))
    }
}
