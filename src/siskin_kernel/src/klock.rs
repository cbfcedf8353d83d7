//! The CPU lock, as a type.
//!
//! Interrupt masking is what actually protects kernel state, but masking
//! alone gives the compiler nothing to check. This module ties the masked
//! state to a zero-sized singleton token: holding [`CpuLockGuard`] *is*
//! holding the critical section, and every mutable word of kernel state
//! sits in a [`CpuLockCell`] that cannot be read or written without
//! presenting that token. Forgetting to take the lock before touching a
//! list link or a counter is a type error, not a race.
//!
//! The token is per kernel instance: the tag type carries `Traits`, so two
//! kernels in one program cannot unlock each other's cells.
use core::ops;
use tokenlock::UnsyncTokenLock;

use crate::{
    error::{pc, Postcode},
    utils::Init,
    PortThreading,
};

pub(super) struct CpuLockTag<Traits>(Traits);

pub(super) type CpuLockToken<Traits> = tokenlock::UnsyncSingletonToken<CpuLockTag<Traits>>;
pub(super) type CpuLockKeyhole<Traits> = tokenlock::SingletonTokenId<CpuLockTag<Traits>>;

/// Owns the critical section. Created by [`lock_cpu`] or (when the port has
/// already masked interrupts, e.g. inside a privileged routine) by
/// [`assume_cpu_lock`]; dropping it unmasks.
///
/// Dereferences to the [`CpuLockToken`] that opens every [`CpuLockCell`].
pub(super) struct CpuLockGuard<Traits: PortThreading> {
    token: CpuLockToken<Traits>,
}

/// Mask interrupts and take ownership of the critical section.
///
/// Fails with a wrong-context postcode when the critical section is already
/// active — the kernel never nests guards, so an active lock means the
/// caller is somewhere it should not be.
pub(super) fn lock_cpu<Traits: PortThreading>() -> Result<CpuLockGuard<Traits>, Postcode> {
    // Safety: entering the CPU lock is reserved to the kernel, and that is
    // who we are
    if !unsafe { Traits::try_enter_cpu_lock() } {
        return Err(pc!(Kernel, WrongContext));
    }
    // Safety: the swap above succeeded, so no other guard (and hence no
    // other token) exists right now
    Ok(CpuLockGuard {
        token: unsafe { CpuLockToken::new_unchecked() },
    })
}

/// Materialize a guard for a critical section somebody else has already
/// entered — the privilege trampoline masks interrupts before dispatching a
/// routine, and the routine picks the token up here.
///
/// The matching exit also belongs to that somebody: callers `forget` the
/// guard instead of dropping it.
///
/// # Safety
///
/// Interrupts must really be masked, and no other guard may be live.
pub(super) unsafe fn assume_cpu_lock<Traits: PortThreading>() -> CpuLockGuard<Traits> {
    debug_assert!(Traits::is_cpu_lock_active());
    CpuLockGuard {
        // Safety: the caller vouches for the singleton property
        token: unsafe { CpuLockToken::new_unchecked() },
    }
}

impl<Traits: PortThreading> CpuLockGuard<Traits> {
    /// Reborrow as a [`CpuLockTokenRefMut`], the form the kernel's internal
    /// functions take.
    pub(super) fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, Traits> {
        self.token.borrow_mut()
    }
}

impl<Traits: PortThreading> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        // Safety: this guard is the critical section; it ends where the
        // guard ends
        unsafe { Traits::leave_cpu_lock() };
    }
}

impl<Traits: PortThreading> ops::Deref for CpuLockGuard<Traits> {
    type Target = CpuLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: PortThreading> ops::DerefMut for CpuLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// The borrowed form of the token, passed down through the kernel's call
/// trees.
///
/// Unlike an ordinary `&mut`, a token ref is not reborrowed implicitly at
/// call sites; pass `lock.borrow_mut()` when handing it to a callee that
/// should give it back.
pub(super) type CpuLockTokenRefMut<'a, Traits> =
    tokenlock::UnsyncSingletonTokenRefMut<'a, CpuLockTag<Traits>>;

/// Shared borrow of the token: enough to read kernel state, too little to
/// change it. Handed to ordering predicates and other callbacks that must
/// not mutate behind their caller's back.
pub(super) type CpuLockTokenRef<'a, Traits> =
    tokenlock::UnsyncSingletonTokenRef<'a, CpuLockTag<Traits>>;

/// One word of kernel state, openable only by the CPU-lock token.
///
/// Dereferences to the underlying [`UnsyncTokenLock`], whose `read`/`get`/
/// `replace` methods all demand a token argument — which is the point.
pub(super) struct CpuLockCell<Traits, T: ?Sized>(UnsyncTokenLock<T, CpuLockKeyhole<Traits>>);

impl<Traits, T> CpuLockCell<Traits, T> {
    pub(super) const fn new(value: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::INIT, value))
    }
}

impl<Traits, T: Init> Init for CpuLockCell<Traits, T> {
    const INIT: Self = Self::new(T::INIT);
}

impl<Traits, T> ops::Deref for CpuLockCell<Traits, T> {
    type Target = UnsyncTokenLock<T, CpuLockKeyhole<Traits>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<Traits, T> ops::DerefMut for CpuLockCell<Traits, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
