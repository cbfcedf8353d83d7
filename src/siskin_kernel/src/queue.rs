//! Bounded message queues.
//!
//! A queue is a ring of fixed-size slots with a send wait queue and a
//! receive wait queue. Payloads shorter than the slot are zero-padded;
//! longer payloads are rejected. A send may target the front of the ring and
//! a receive may drain from the back, giving LIFO behavior in either
//! direction. Exactly one peer is woken per successful operation; the woken
//! peer's payload moves through the ring in its wake-up epilogue, so a
//! timeout wake has no effect on the ring.
use core::fmt;

use crate::{
    error::{pc, Kind, Postcode},
    handle::{Handle, ObjectHead, ObjectKind},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    sched::{self, PendCtx, PendPayload},
    svc,
    task::{postcode_or_zero, Region, TaskCb},
    utils::{
        list::{self, HeadCell, HeadRef},
        Init,
    },
    KernelTraits, PortThreading, System,
};

/// Wake-up channel sentinel: the woken task is a receiver that must pop a
/// slot in its epilogue.
const WAKE_RECEIVER: i32 = 11;
/// Wake-up channel sentinel: the woken task is a sender whose payload must
/// be pushed in its epilogue.
const WAKE_SENDER: i32 = 10;

/// Queue-wait scratch recorded in the blocked peer's pend data.
#[derive(Clone, Copy)]
pub(crate) struct QueuePend {
    pub(crate) buf: *mut u8,
    pub(crate) len: usize,
    /// Send to the front / receive from the back.
    pub(crate) reverse: bool,
}

// Safety: the buffer belongs to a task that stays blocked while the kernel
// holds this record
unsafe impl Send for QueuePend {}
unsafe impl Sync for QueuePend {}

impl Init for QueuePend {
    const INIT: Self = Self {
        buf: core::ptr::null_mut(),
        len: 0,
        reverse: false,
    };
}

/// *Queue control block* — the state data of a message queue.
pub struct QueueCb<Traits: PortThreading> {
    pub(crate) head: ObjectHead,

    pub(crate) storage: CpuLockCell<Traits, Region>,
    pub(crate) slot_len: CpuLockCell<Traits, u16>,
    pub(crate) slot_count: CpuLockCell<Traits, u16>,

    /// Producer index: the slot the next back-send writes.
    pub(crate) left: CpuLockCell<Traits, u16>,
    /// Consumer index: the slot the next front-receive reads.
    pub(crate) right: CpuLockCell<Traits, u16>,
    pub(crate) cached: CpuLockCell<Traits, u16>,

    /// Senders blocked on a full ring, ordered by priority.
    pub(crate) send_queue: HeadCell<Traits, TaskCb<Traits>>,
    /// Receivers blocked on an empty ring, ordered by priority.
    pub(crate) recv_queue: HeadCell<Traits, TaskCb<Traits>>,
}

impl<Traits: PortThreading> Init for QueueCb<Traits> {
    const INIT: Self = Self {
        head: Init::INIT,
        storage: Init::INIT,
        slot_len: Init::INIT,
        slot_count: Init::INIT,
        left: Init::INIT,
        right: Init::INIT,
        cached: Init::INIT,
        send_queue: Init::INIT,
        recv_queue: Init::INIT,
    };
}

impl<Traits: PortThreading> fmt::Debug for QueueCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QueueCb")
            .field("self", &(self as *const _))
            .field("name", &self.head.name())
            .finish()
    }
}

pub(crate) fn queue_cb<Traits: KernelTraits>(
    handle: Handle,
) -> Result<&'static QueueCb<Traits>, Postcode> {
    let pool = Traits::queue_cb_pool();
    if !handle.is_in_range(ObjectKind::Queue, pool.len()) {
        return Err(pc!(Queue, InvalidHandle));
    }
    let cb = &pool[handle.index()];
    if !cb.head.is_inited() {
        return Err(pc!(Queue, InvalidHandle));
    }
    Ok(cb)
}

fn queue_handle<Traits: KernelTraits>(cb: &'static QueueCb<Traits>) -> Handle {
    let pool = Traits::queue_cb_pool();
    let offset_bytes = cb as *const QueueCb<Traits> as usize - pool.as_ptr() as usize;
    Handle::new(
        ObjectKind::Queue,
        offset_bytes / core::mem::size_of::<QueueCb<Traits>>(),
    )
}

fn slot_ptr<Traits: KernelTraits>(
    cb: &QueueCb<Traits>,
    index: u16,
    lock: crate::klock::CpuLockTokenRef<'_, Traits>,
) -> *mut u8 {
    let storage = cb.storage.get(&*lock);
    let slot_len = cb.slot_len.get(&*lock) as usize;
    // In range: index < slot_count and storage was validated at init
    unsafe { storage.base().add(index as usize * slot_len) }
}

/// Copy a payload into the back of the ring (the producer side),
/// zero-padding the slot.
fn message_send<Traits: KernelTraits>(
    cb: &QueueCb<Traits>,
    pend: QueuePend,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    let slot_len = cb.slot_len.get(&*lock) as usize;
    let count = cb.slot_count.get(&*lock);

    let index = if pend.reverse {
        // Send to the front: back the consumer index up and write there
        let right = cb.right.get(&*lock);
        let right = if right == 0 { count - 1 } else { right - 1 };
        cb.right.replace(&mut *lock, right);
        right
    } else {
        let left = cb.left.get(&*lock);
        cb.left.replace(&mut *lock, (left + 1) % count);
        left
    };

    let slot = slot_ptr(cb, index, lock.borrow());
    // Safety: the slot is in-range scratch owned by the queue; the source
    // buffer belongs to the (blocked or calling) sender
    unsafe {
        core::ptr::write_bytes(slot, 0, slot_len);
        core::ptr::copy_nonoverlapping(pend.buf, slot, pend.len);
    }

    let cached = cb.cached.get(&*lock);
    cb.cached.replace(&mut *lock, cached + 1);
}

/// Copy a slot out of the front of the ring (the consumer side) into the
/// receiver's buffer.
fn message_receive<Traits: KernelTraits>(
    cb: &QueueCb<Traits>,
    pend: QueuePend,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    let count = cb.slot_count.get(&*lock);

    let index = if pend.reverse {
        // Receive from the back: back the producer index up and read there
        let left = cb.left.get(&*lock);
        let left = if left == 0 { count - 1 } else { left - 1 };
        cb.left.replace(&mut *lock, left);
        left
    } else {
        let right = cb.right.get(&*lock);
        cb.right.replace(&mut *lock, (right + 1) % count);
        right
    };

    let slot = slot_ptr(cb, index, lock.borrow());
    // Safety: symmetric to `message_send`
    unsafe {
        core::ptr::copy_nonoverlapping(slot, pend.buf, pend.len);
    }

    let cached = cb.cached.get(&*lock);
    cb.cached.replace(&mut *lock, cached - 1);
}

/// Wake-up epilogue shared by both directions: move the woken peer's payload
/// through the ring. A timeout wake never reaches here, so the ring is
/// untouched in that case.
fn queue_wake_epilogue<Traits: KernelTraits>(
    task: &'static TaskCb<Traits>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    let Some(ctx) = *task.pend_ctx.read(&*lock) else {
        return;
    };
    // Safety: the pend context of a queue waiter is its queue
    let cb: &'static QueueCb<Traits> = unsafe { ctx.cast() };
    let pend = task.pend_queue.get(&*lock);

    match task.exec.entry_result.get(&*lock) {
        WAKE_RECEIVER => {
            message_receive(cb, pend, lock.borrow_mut());
            task.exec
                .entry_result
                .replace(&mut *lock, crate::error::WAKE_SUCCESS);
        }
        WAKE_SENDER => {
            message_send(cb, pend, lock.borrow_mut());
            task.exec
                .entry_result
                .replace(&mut *lock, crate::error::WAKE_SUCCESS);
        }
        _ => {}
    }
}

struct InitArgs {
    storage: Region,
    slot_len: u16,
    slot_count: u16,
    name: &'static str,
}

fn init_routine<Traits: KernelTraits>(packet: usize) -> i32 {
    // Safety: dispatched by the trampoline inside a critical section
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    // Safety: `packet` is the argument struct built by `queue_init`
    let args = unsafe { svc::packet_args::<InitArgs>(packet) };
    let pool = Traits::queue_cb_pool();
    let ret = match pool.iter().find(|cb| !cb.head.is_inited()) {
        Some(cb) => {
            cb.head.claim(args.name);
            cb.storage.replace(&mut *lock, args.storage);
            cb.slot_len.replace(&mut *lock, args.slot_len);
            cb.slot_count.replace(&mut *lock, args.slot_count);
            cb.left.replace(&mut *lock, 0);
            cb.right.replace(&mut *lock, 0);
            cb.cached.replace(&mut *lock, 0);
            queue_handle::<Traits>(cb).raw() as i32
        }
        None => pc!(Queue, Exhausted).raw(),
    };
    core::mem::forget(lock);
    ret
}

struct XferArgs<Traits: PortThreading> {
    cb: &'static QueueCb<Traits>,
    pend: QueuePend,
    timeout_ms: u32,
}

fn send_routine<Traits: KernelTraits>(packet: usize) -> i32 {
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    let args = unsafe { svc::packet_args::<XferArgs<Traits>>(packet) };
    let ret = (|| {
        let cb = args.cb;
        if cb.cached.get(&*lock) < cb.slot_count.get(&*lock) {
            message_send(cb, args.pend, lock.borrow_mut());
            let queue = HeadRef::new(&cb.recv_queue);
            if let Some(receiver) = list::first(queue, lock.borrow()) {
                sched::entry_trigger(
                    receiver.get(),
                    Some(queue_wake_epilogue::<Traits>),
                    WAKE_RECEIVER,
                    lock.borrow_mut(),
                );
            }
            return Ok(());
        }

        // Ring full: block on the send queue
        let Some(running) = sched::running_task::<Traits>(lock.borrow_mut().borrow()) else {
            return Err(pc!(Queue, WrongContext));
        };
        sched::exit_trigger(
            running.get(),
            Some(PendCtx::new(cb)),
            PendPayload::Queue(args.pend),
            Some(HeadRef::new(&cb.send_queue)),
            args.timeout_ms,
            true,
            lock.borrow_mut(),
        );
        Err(pc!(Queue, Unavailable))
    })();
    core::mem::forget(lock);
    postcode_or_zero(ret)
}

fn receive_routine<Traits: KernelTraits>(packet: usize) -> i32 {
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    let args = unsafe { svc::packet_args::<XferArgs<Traits>>(packet) };
    let ret = (|| {
        let cb = args.cb;
        if cb.cached.get(&*lock) > 0 {
            message_receive(cb, args.pend, lock.borrow_mut());
            let queue = HeadRef::new(&cb.send_queue);
            if let Some(sender) = list::first(queue, lock.borrow()) {
                sched::entry_trigger(
                    sender.get(),
                    Some(queue_wake_epilogue::<Traits>),
                    WAKE_SENDER,
                    lock.borrow_mut(),
                );
            }
            return Ok(());
        }

        // Ring empty: block on the receive queue
        let Some(running) = sched::running_task::<Traits>(lock.borrow_mut().borrow()) else {
            return Err(pc!(Queue, WrongContext));
        };
        sched::exit_trigger(
            running.get(),
            Some(PendCtx::new(cb)),
            PendPayload::Queue(args.pend),
            Some(HeadRef::new(&cb.recv_queue)),
            args.timeout_ms,
            true,
            lock.borrow_mut(),
        );
        Err(pc!(Queue, Unavailable))
    })();
    core::mem::forget(lock);
    postcode_or_zero(ret)
}

/// These associate functions implement the queue portion of the public API.
impl<Traits: KernelTraits> System<Traits> {
    /// Create a message queue over caller-supplied slot storage.
    pub fn queue_init(
        storage: Region,
        slot_len: u16,
        slot_count: u16,
        name: &'static str,
    ) -> Result<Handle, Postcode> {
        if slot_len == 0
            || slot_count == 0
            || storage.base().is_null()
            || storage.len() < slot_len as usize * slot_count as usize
        {
            return Err(pc!(Queue, InvalidArgument));
        }
        let args = InitArgs {
            storage,
            slot_len,
            slot_count,
            name,
        };
        let raw = svc::invoke::<Traits, _>(init_routine::<Traits>, &args);
        match Postcode::from_raw(raw) {
            Ok(()) => Ok(Handle::from_raw(raw as u32)),
            Err(code) => Err(code),
        }
    }

    /// Send a payload, blocking while the ring is full. `to_front` jumps the
    /// line: the payload lands at the consumer end.
    pub fn queue_send(
        handle: Handle,
        payload: &[u8],
        to_front: bool,
        timeout_ms: u32,
    ) -> Result<(), Postcode> {
        let cb = queue_cb::<Traits>(handle)?;
        Self::queue_xfer(
            cb,
            QueuePend {
                buf: payload.as_ptr() as *mut u8,
                len: payload.len(),
                reverse: to_front,
            },
            timeout_ms,
            send_routine::<Traits>,
        )
    }

    /// Receive a payload, blocking while the ring is empty. `from_back`
    /// drains the newest payload instead of the oldest.
    pub fn queue_receive(
        handle: Handle,
        payload: &mut [u8],
        from_back: bool,
        timeout_ms: u32,
    ) -> Result<(), Postcode> {
        let cb = queue_cb::<Traits>(handle)?;
        Self::queue_xfer(
            cb,
            QueuePend {
                buf: payload.as_mut_ptr(),
                len: payload.len(),
                reverse: from_back,
            },
            timeout_ms,
            receive_routine::<Traits>,
        )
    }

    /// The number of payloads currently buffered.
    pub fn queue_count(handle: Handle) -> Result<u16, Postcode> {
        let cb = queue_cb::<Traits>(handle)?;
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(*cb.cached.read(&*lock))
    }

    fn queue_xfer(
        cb: &'static QueueCb<Traits>,
        pend: QueuePend,
        timeout_ms: u32,
        routine: fn(usize) -> i32,
    ) -> Result<(), Postcode> {
        if pend.len == 0 {
            return Err(pc!(Queue, InvalidArgument));
        }
        {
            let lock = klock::lock_cpu::<Traits>()?;
            if pend.len > *cb.slot_len.read(&*lock) as usize {
                return Err(pc!(Queue, InvalidArgument));
            }
        }
        if timeout_ms == 0 {
            return Err(pc!(Queue, InvalidArgument));
        }
        if !Traits::is_thread_context() {
            return Err(pc!(Queue, WrongContext));
        }
        let caller = Self::caller_task()?;
        let args = XferArgs {
            cb,
            pend,
            timeout_ms,
        };
        let raw = svc::invoke::<Traits, _>(routine, &args);
        match Postcode::from_raw(raw) {
            Err(code) if code.kind() == Kind::Unavailable => {
                sched::blocking_finish::<Traits>(caller)
            }
            other => other,
        }
    }
}
