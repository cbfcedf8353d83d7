//! Events: bitmask-based synchronization.
//!
//! A published value is a pulse: it fans out to the waiters and is then
//! logically held at zero again. Each waiter accumulates the bits it listens
//! to across successive publications; an any-of waiter (`trigger == 0`)
//! wakes on the first listened bit, an all-of waiter wakes once every bit of
//! its trigger mask has been seen.
use core::fmt;

use crate::{
    error::{self, pc, Kind, Postcode},
    handle::{Handle, ObjectHead, ObjectKind},
    klock::{self, CpuLockCell},
    sched::{self, PendCtx, PendPayload},
    svc,
    task::{postcode_or_zero, TaskCb},
    utils::{
        list::{self, HeadCell, HeadRef},
        Init,
    },
    KernelTraits, PortThreading, System,
};

/// *Event control block* — the state data of an event.
pub struct EventCb<Traits: PortThreading> {
    pub(crate) head: ObjectHead,

    /// Bits whose publication invokes the callback.
    pub(crate) edge: CpuLockCell<Traits, u32>,

    /// Invoked from the kernel notification path when an edge bit fires.
    /// Must not block.
    pub(crate) callback: CpuLockCell<Traits, Option<fn()>>,

    /// An edge bit fired; the housekeeping thread owes a callback run.
    pub(crate) fired: CpuLockCell<Traits, bool>,

    /// Waiters, ordered by priority.
    pub(crate) wait_queue: HeadCell<Traits, TaskCb<Traits>>,
}

impl<Traits: PortThreading> Init for EventCb<Traits> {
    const INIT: Self = Self {
        head: Init::INIT,
        edge: Init::INIT,
        callback: Init::INIT,
        fired: Init::INIT,
        wait_queue: Init::INIT,
    };
}

impl<Traits: PortThreading> fmt::Debug for EventCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventCb")
            .field("self", &(self as *const _))
            .field("name", &self.head.name())
            .finish()
    }
}

pub(crate) fn event_cb<Traits: KernelTraits>(
    handle: Handle,
) -> Result<&'static EventCb<Traits>, Postcode> {
    let pool = Traits::event_cb_pool();
    if !handle.is_in_range(ObjectKind::Event, pool.len()) {
        return Err(pc!(Event, InvalidHandle));
    }
    let cb = &pool[handle.index()];
    if !cb.head.is_inited() {
        return Err(pc!(Event, InvalidHandle));
    }
    Ok(cb)
}

fn event_handle<Traits: KernelTraits>(cb: &'static EventCb<Traits>) -> Handle {
    let pool = Traits::event_cb_pool();
    let offset_bytes = cb as *const EventCb<Traits> as usize - pool.as_ptr() as usize;
    Handle::new(
        ObjectKind::Event,
        offset_bytes / core::mem::size_of::<EventCb<Traits>>(),
    )
}

/// Run the edge callbacks of events flagged by [`event_set`] since the last
/// notification. Runs on the housekeeping thread with the CPU lock
/// released.
///
/// [`event_set`]: System::event_set
pub(crate) fn run_fired<Traits: KernelTraits>() {
    let mut batch: arrayvec::ArrayVec<fn(), 8> = arrayvec::ArrayVec::new();
    loop {
        batch.clear();
        {
            let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
                return;
            };
            for cb in Traits::event_cb_pool() {
                if batch.is_full() {
                    break;
                }
                if !cb.head.is_inited() || !cb.fired.get(&*lock) {
                    continue;
                }
                cb.fired.replace(&mut *lock, false);
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
    edge: u32,
    callback: Option<fn()>,
    name: &'static str,
}

fn init_routine<Traits: KernelTraits>(packet: usize) -> i32 {
    // Safety: dispatched by the trampoline inside a critical section
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    // Safety: `packet` is the argument struct built by `event_init`
    let args = unsafe { svc::packet_args::<InitArgs>(packet) };
    let pool = Traits::event_cb_pool();
    let ret = match pool.iter().find(|cb| !cb.head.is_inited()) {
        Some(cb) => {
            cb.head.claim(args.name);
            cb.edge.replace(&mut *lock, args.edge);
            cb.callback.replace(&mut *lock, args.callback);
            event_handle::<Traits>(cb).raw() as i32
        }
        None => pc!(Event, Exhausted).raw(),
    };
    core::mem::forget(lock);
    ret
}

struct SetArgs<Traits: PortThreading> {
    cb: &'static EventCb<Traits>,
    value: u32,
}

fn set_routine<Traits: KernelTraits>(packet: usize) -> i32 {
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    let args = unsafe { svc::packet_args::<SetArgs<Traits>>(packet) };
    let cb = args.cb;
    let value = args.value;

    if value & cb.edge.get(&*lock) != 0 && cb.callback.read(&*lock).is_some() {
        cb.fired.replace(&mut *lock, true);
        crate::kthread::notify(lock.borrow_mut());
    }

    // Fan the pulse out to the waiters (the queue is priority-ordered, so
    // wake-ups are staged in priority order)
    let queue = HeadRef::new(&cb.wait_queue);
    let mut cursor = list::first(queue, lock.borrow_mut().borrow());
    while let Some(waiter) = cursor {
        // The wake-up below unlinks the waiter; step first
        cursor = list::next(queue, waiter, lock.borrow_mut().borrow());

        let task = waiter.get();
        let mut pend = task.pend_event.get(&*lock);
        let newly = pend.listen & value;
        if newly == 0 {
            continue;
        }
        pend.collected |= newly;
        task.pend_event.replace(&mut *lock, pend);

        let wake = if pend.trigger == 0 {
            // Any-of: the first listened bit suffices
            true
        } else {
            pend.collected & pend.trigger == pend.trigger
        };
        if wake {
            sched::entry_trigger(task, None, error::WAKE_SUCCESS, lock.borrow_mut());
        }
    }

    // The pulse is consumed; the value is logically held at zero again
    core::mem::forget(lock);
    0
}

struct WaitArgs<Traits: PortThreading> {
    cb: &'static EventCb<Traits>,
    listen: u32,
    trigger: u32,
    timeout_ms: u32,
}

fn wait_routine<Traits: KernelTraits>(packet: usize) -> i32 {
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    let args = unsafe { svc::packet_args::<WaitArgs<Traits>>(packet) };
    let ret = (|| {
        let Some(running) = sched::running_task::<Traits>(lock.borrow_mut().borrow()) else {
            return Err(pc!(Event, WrongContext));
        };
        sched::exit_trigger(
            running.get(),
            Some(PendCtx::new(args.cb)),
            PendPayload::Event {
                listen: args.listen,
                trigger: args.trigger,
            },
            Some(HeadRef::new(&args.cb.wait_queue)),
            args.timeout_ms,
            true,
            lock.borrow_mut(),
        );
        Err(pc!(Event, Unavailable))
    })();
    core::mem::forget(lock);
    postcode_or_zero(ret)
}

/// These associate functions implement the event portion of the public API.
impl<Traits: KernelTraits> System<Traits> {
    /// Create an event. Publishing any bit of `edge` additionally invokes
    /// `callback` from the kernel notification path; the callback must not
    /// block.
    pub fn event_init(
        edge: u32,
        callback: Option<fn()>,
        name: &'static str,
    ) -> Result<Handle, Postcode> {
        let args = InitArgs {
            edge,
            callback,
            name,
        };
        let raw = svc::invoke::<Traits, _>(init_routine::<Traits>, &args);
        match Postcode::from_raw(raw) {
            Ok(()) => Ok(Handle::from_raw(raw as u32)),
            Err(code) => Err(code),
        }
    }

    /// Publish a bitmask pulse to every waiter.
    pub fn event_set(handle: Handle, value: u32) -> Result<(), Postcode> {
        let cb = event_cb::<Traits>(handle)?;
        if value == 0 {
            return Err(pc!(Event, InvalidArgument));
        }
        let args = SetArgs { cb, value };
        Postcode::from_raw(svc::invoke::<Traits, _>(set_routine::<Traits>, &args))
    }

    /// Wait for listened bits. With `trigger == 0` the wait completes on the
    /// first listened bit; otherwise it completes once every bit of
    /// `trigger` has been seen. Returns the accumulated bits.
    pub fn event_wait(
        handle: Handle,
        listen: u32,
        trigger: u32,
        timeout_ms: u32,
    ) -> Result<u32, Postcode> {
        let cb = event_cb::<Traits>(handle)?;
        if listen == 0 || trigger & !listen != 0 || timeout_ms == 0 {
            return Err(pc!(Event, InvalidArgument));
        }
        if !Traits::is_thread_context() {
            return Err(pc!(Event, WrongContext));
        }
        let caller = Self::caller_task()?;
        let args = WaitArgs {
            cb,
            listen,
            trigger,
            timeout_ms,
        };
        let raw = svc::invoke::<Traits, _>(wait_routine::<Traits>, &args);
        let finished = match Postcode::from_raw(raw) {
            Err(code) if code.kind() == Kind::Unavailable => {
                sched::blocking_finish::<Traits>(caller)
            }
            other => other,
        };
        finished?;
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(caller.get().pend_event.read(&*lock).collected)
    }

    /// Diagnostic: the listened bits the thread has accumulated across the
    /// publications seen by its current (or most recent) event wait.
    pub fn event_collected_bits(thread: Handle) -> Result<u32, Postcode> {
        let cb = crate::task::task_cb::<Traits>(thread)?;
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(cb.pend_event.read(&*lock).collected)
    }
}
