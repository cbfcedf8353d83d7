//! Postcode-based error reporting.
//!
//! Every fallible kernel operation reports its outcome as a *postcode*: a
//! signed 32-bit value whose sign bit marks failure, whose high bits tag the
//! originating component and source line, and whose low bits carry a stable
//! error kind. Success is zero. The most recent failing postcode of each
//! component is kept in a trace slot for post-mortem inspection.
use core::fmt;
use core::sync::atomic::{AtomicI32, Ordering};

/// Stable error kinds carried in the low bits of a failing [`Postcode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    /// The operation completed. Never appears in a failing postcode.
    Success = 0,
    /// The handle is out of range or refers to an uninitialized object.
    InvalidHandle = 1,
    /// A parameter is malformed (zero length, out-of-band priority, ...).
    InvalidArgument = 2,
    /// The call is not allowed in the current execution context.
    WrongContext = 3,
    /// A blocking call elapsed without success.
    Timeout = 4,
    /// Internal marker: the scheduler has taken over and the caller must
    /// re-read the final result from its wake-up channel.
    Unavailable = 5,
    /// The operation would violate an object's state machine.
    StateViolation = 6,
    /// No free object slot of the requested kind.
    Exhausted = 7,
    /// Placeholder found in a wake-up channel that holds no result.
    InvalidOperation = 8,
}

impl Kind {
    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::InvalidHandle,
            2 => Self::InvalidArgument,
            3 => Self::WrongContext,
            4 => Self::Timeout,
            5 => Self::Unavailable,
            6 => Self::StateViolation,
            7 => Self::Exhausted,
            8 => Self::InvalidOperation,
            _ => Self::Success,
        }
    }
}

/// Component tags carried in the high bits of a failing [`Postcode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Component {
    Kernel = 1,
    Sched = 2,
    Timeout = 3,
    Task = 4,
    Semaphore = 5,
    Mutex = 6,
    Event = 7,
    Queue = 8,
    Timer = 9,
    KThread = 10,
}

const COMPONENT_COUNT: usize = 11;

/// The last failing postcode recorded per component.
static TRACE_SLOTS: [AtomicI32; COMPONENT_COUNT] = [const { AtomicI32::new(0) }; COMPONENT_COUNT];

const KIND_MASK: i32 = 0xff;
const LINE_SHIFT: u32 = 8;
const LINE_MASK: i32 = 0x3ffff;
const COMPONENT_SHIFT: u32 = 26;

/// The outcome of a kernel operation.
///
/// `Postcode` is only ever constructed for failures; successful operations
/// return `Ok(_)`. The raw `i32` form (zero = success) crosses the privilege
/// trampoline and the per-task wake-up channel.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Postcode(i32);

impl Postcode {
    /// Construct a failing postcode and record it in the component's trace
    /// slot.
    pub(crate) fn err(component: Component, kind: Kind, line: u32) -> Self {
        debug_assert!(kind != Kind::Success);
        let magnitude = ((component as i32) << COMPONENT_SHIFT)
            | (((line as i32) & LINE_MASK) << LINE_SHIFT)
            | (kind as i32);
        let code = Self(-magnitude);
        TRACE_SLOTS[component as usize].store(code.0, Ordering::Relaxed);
        code
    }

    /// Reinterpret a raw channel value. Zero becomes `Ok(())`.
    pub(crate) fn from_raw(raw: i32) -> Result<(), Self> {
        if raw >= 0 {
            Ok(())
        } else {
            Err(Self(raw))
        }
    }

    /// The raw `i32` form.
    pub fn raw(self) -> i32 {
        self.0
    }

    /// The stable error kind.
    pub fn kind(self) -> Kind {
        Kind::from_bits((self.0.wrapping_neg() & KIND_MASK) as u8)
    }

    /// The originating component.
    pub fn component(self) -> u8 {
        (self.0.wrapping_neg() >> COMPONENT_SHIFT) as u8
    }

    /// The source line the failure was reported from.
    pub fn line(self) -> u32 {
        ((self.0.wrapping_neg() >> LINE_SHIFT) & LINE_MASK) as u32
    }
}

impl fmt::Debug for Postcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Postcode")
            .field("component", &self.component())
            .field("kind", &self.kind())
            .field("line", &self.line())
            .finish()
    }
}

/// Read the most recent failing postcode recorded for `component`, if any.
pub fn trace_last_failure(component: Component) -> Option<Postcode> {
    let raw = TRACE_SLOTS[component as usize].load(Ordering::Relaxed);
    if raw < 0 {
        Some(Postcode(raw))
    } else {
        None
    }
}

/// Construct a failing [`Postcode`] tagged with the current source line.
///
/// Each module names its component once and reports every failure through
/// this macro so that the line tag is meaningful.
macro_rules! pc {
    ($component:ident, $kind:ident) => {
        $crate::error::Postcode::err(
            $crate::error::Component::$component,
            $crate::error::Kind::$kind,
            line!(),
        )
    };
}
pub(crate) use pc;

/// Compose a raw failing postcode without touching the trace slots. Used for
/// the well-known wake-up channel values.
pub(crate) const fn raw_code(component: Component, kind: Kind, line: u32) -> i32 {
    -(((component as i32) << COMPONENT_SHIFT)
        | (((line as i32) & LINE_MASK) << LINE_SHIFT)
        | (kind as i32))
}

/// The value delivered through a wake-up channel on success.
pub(crate) const WAKE_SUCCESS: i32 = 0;

/// The value delivered through a wake-up channel by an expired wait timeout.
pub(crate) const WAKE_TIMEOUT: i32 = raw_code(Component::Sched, Kind::Timeout, 0);

/// The placeholder held by a wake-up channel that carries no result.
pub(crate) const CHANNEL_PLACEHOLDER: i32 =
    raw_code(Component::Sched, Kind::InvalidOperation, 0);

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn success_is_zero() {
        assert!(Postcode::from_raw(0).is_ok());
    }

    #[test]
    fn round_trips_component_and_kind() {
        let code = Postcode::err(Component::Queue, Kind::Timeout, 1234);
        assert!(code.raw() < 0);
        assert_eq!(code.kind(), Kind::Timeout);
        assert_eq!(code.component(), Component::Queue as u8);
        assert_eq!(code.line(), 1234);
    }

    #[test]
    fn failure_is_recorded_in_trace_slot() {
        let code = Postcode::err(Component::Mutex, Kind::StateViolation, 77);
        assert_eq!(trace_last_failure(Component::Mutex), Some(code));
    }

    #[quickcheck]
    fn line_tag_survives_masking(line: u32) -> bool {
        let code = Postcode::err(Component::Event, Kind::InvalidArgument, line);
        code.line() == (line & 0x3ffff) && code.kind() == Kind::InvalidArgument
    }
}
