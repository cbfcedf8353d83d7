//! Constant initialization.
//!
//! Every kernel object lives in a static pool, so every type that appears
//! inside one needs a value that can be computed at compile time. `Default`
//! cannot promise that; [`Init`] does.
#![allow(clippy::declare_interior_mutable_const)]

/// A compile-time default value.
///
/// `INIT` is the state of a freshly declared, never-touched kernel object:
/// counters at zero, links detached, options empty, cells unlocked.
pub trait Init {
    const INIT: Self;
}

// The CPU-lock cells are token locks whose keyhole is a zero-sized
// singleton id, so both halves initialize structurally.
impl<T: Init, I: Init> Init for tokenlock::UnsyncTokenLock<T, I> {
    const INIT: Self = Self::new(I::INIT, T::INIT);
}

impl<Tag: ?Sized> Init for tokenlock::SingletonTokenId<Tag> {
    const INIT: Self = Self::new();
}

impl<T> Init for Option<T> {
    const INIT: Self = None;
}

// Object pools are arrays of control blocks.
impl<T: Init, const LEN: usize> Init for [T; LEN] {
    const INIT: Self = [const { T::INIT }; LEN];
}

macro_rules! zero_init {
    ( $( $ty:ty ),* $(,)? ) => {
        $(
            impl Init for $ty {
                const INIT: Self = 0 as $ty;
            }
        )*
    };
}

// The numeric fields of the control blocks: counters, indices, priorities,
// postcodes, saved stack pointers, and the kernel clock.
zero_init! {
    u8, u16, u32, u64, usize,
    i16, i32,
}

impl Init for bool {
    const INIT: Self = false;
}

// Ports with no per-task machine state use `()` for it.
impl Init for () {
    const INIT: Self = ();
}
