//! The privilege trampoline.
//!
//! Exactly one supervisor-call dispatch shape exists: "call this routine
//! with this argument packet". The routine runs in the privileged context
//! with interrupts disabled and its `i32` return value replaces the call
//! result. This gives unprivileged threads a uniform entry into the kernel
//! and a natural serialization point, so primitives need no locking beyond
//! critical sections.
use crate::PortPrivilege;

/// Invoke a privileged routine through the port's supervisor-call shim,
/// passing the argument struct by address.
///
/// The argument struct lives on the caller's stack and stays valid for the
/// whole synchronous call.
pub(crate) fn invoke<Traits: PortPrivilege, A>(routine: fn(usize) -> i32, args: &A) -> i32 {
    // Safety: `args` outlives the synchronous call, and `routine` is a
    // kernel routine expecting exactly this packet type
    unsafe { Traits::call_privileged(routine, args as *const A as usize) }
}

/// Recover the argument struct inside a privileged routine.
///
/// # Safety
///
/// `packet` must be the address of an `A` passed to [`invoke`] for this
/// routine.
pub(crate) unsafe fn packet_args<'a, A>(packet: usize) -> &'a A {
    unsafe { &*(packet as *const A) }
}
