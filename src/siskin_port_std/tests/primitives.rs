//! Per-primitive behavior: round trips, boundary rejections, and the
//! housekeeping path for timer and event callbacks.
use std::sync::atomic::{AtomicUsize, Ordering};

use siskin_kernel::{Init, Kind};

fn noop() {}

fn blocked<T>(r: Result<T, siskin_kernel::Postcode>) -> bool {
    matches!(r, Err(code) if code.kind() == Kind::Unavailable)
}

macro_rules! fixture {
    ($port:ident) => {
        siskin_port_std::use_port!(struct $port);
        siskin_kernel::build! {
            impl KernelCfg for $port {
                threads: 4,
                semaphores: 2,
                mutexes: 2,
                events: 2,
                queues: 2,
                timers: 2,
                kernel_stack: 2048,
                idle_stack: 512,
            }
        }
        type Sys = siskin_port_std::siskin_kernel::System<$port>;

        #[allow(dead_code)]
        fn boot() {
            let _ = env_logger::builder().is_test(true).try_init();
            Sys::run().unwrap();
            $port::advance_housekeeping();
        }
    };
}

mod validation {
    use super::*;

    fixture!(App);

    static STACK_U: siskin_kernel::Stack<512> = Init::INIT;

    #[test]
    fn malformed_requests_are_rejected_before_the_critical_section() {
        let u = Sys::thread_init(noop, STACK_U.region(), 5, "u").unwrap();

        // Reserved priorities are not available to applications
        let r = Sys::thread_init(noop, STACK_U.region(), 0, "bad");
        assert!(matches!(r, Err(code) if code.kind() == Kind::InvalidArgument));
        let r = Sys::thread_init(noop, STACK_U.region(), 254, "bad");
        assert!(matches!(r, Err(code) if code.kind() == Kind::InvalidArgument));

        // A handle of the wrong kind never reaches an object
        let r = Sys::semaphore_take(u, 10);
        assert!(matches!(r, Err(code) if code.kind() == Kind::InvalidHandle));

        // Zero sleeps are refused outright
        let r = Sys::thread_sleep(0);
        assert!(matches!(r, Err(code) if code.kind() == Kind::InvalidArgument));

        // Over-limit semaphore shape
        let r = Sys::semaphore_init(2, 1, "s");
        assert!(matches!(r, Err(code) if code.kind() == Kind::InvalidArgument));
    }
}

mod exhaustion {
    use super::*;

    fixture!(App);

    #[test]
    fn object_pools_report_exhaustion() {
        Sys::mutex_init("m0").unwrap();
        Sys::mutex_init("m1").unwrap();
        let r = Sys::mutex_init("m2");
        assert!(matches!(r, Err(code) if code.kind() == Kind::Exhausted));
    }
}

mod yield_round_robin {
    use super::*;

    fixture!(App);

    static STACK_A: siskin_kernel::Stack<512> = Init::INIT;
    static STACK_B: siskin_kernel::Stack<512> = Init::INIT;

    #[test]
    fn yield_rotates_equal_priorities_and_rejects_no_ops() {
        let a = Sys::thread_init(noop, STACK_A.region(), 5, "a").unwrap();
        let b = Sys::thread_init(noop, STACK_B.region(), 5, "b").unwrap();
        boot();

        // Insertion order breaks the tie
        assert_eq!(Sys::current_thread().unwrap(), a);
        Sys::thread_yield().unwrap();
        assert_eq!(Sys::current_thread().unwrap(), b);
        Sys::thread_yield().unwrap();
        assert_eq!(Sys::current_thread().unwrap(), a);

        // With no equal-or-more-urgent peer the request is a state
        // violation and nothing switches
        Sys::thread_suspend(b).unwrap();
        let r = Sys::thread_yield();
        assert!(matches!(r, Err(code) if code.kind() == Kind::StateViolation));
        assert_eq!(Sys::current_thread().unwrap(), a);
    }
}

mod suspend_last_runnable {
    use super::*;

    fixture!(App);

    #[test]
    fn the_last_runnable_task_cannot_leave() {
        boot();
        // Only the idle thread is selectable; suspending it would leave
        // nothing to run
        let idle = Sys::kernel_idle_thread().unwrap();
        assert_eq!(Sys::current_thread().unwrap(), idle);
        let r = Sys::thread_suspend(idle);
        assert!(matches!(r, Err(code) if code.kind() == Kind::StateViolation));
    }
}

mod semaphore_strict_give {
    use super::*;

    fixture!(App);

    #[test]
    fn give_above_the_limit_fails_instead_of_clamping() {
        let s = Sys::semaphore_init(1, 1, "s").unwrap();
        boot();
        let r = Sys::semaphore_give(s);
        assert!(matches!(r, Err(code) if code.kind() == Kind::StateViolation));
        assert_eq!(Sys::semaphore_count(s).unwrap(), 1);
    }
}

mod semaphore_flush {
    use super::*;

    fixture!(App);

    static STACK_A: siskin_kernel::Stack<512> = Init::INIT;
    static STACK_B: siskin_kernel::Stack<512> = Init::INIT;

    #[test]
    fn flush_wakes_every_waiter_with_success() {
        let a = Sys::thread_init(noop, STACK_A.region(), 5, "a").unwrap();
        let b = Sys::thread_init(noop, STACK_B.region(), 6, "b").unwrap();
        let s = Sys::semaphore_init(0, 4, "s").unwrap();
        boot();

        assert!(blocked(Sys::semaphore_take(s, siskin_kernel::TIME_FOREVER)));
        assert!(blocked(Sys::semaphore_take(s, siskin_kernel::TIME_FOREVER)));

        Sys::semaphore_flush(s).unwrap();
        assert_eq!(Sys::semaphore_count(s).unwrap(), 0);

        // Both waiters drain with success, in priority order
        assert_eq!(Sys::current_thread().unwrap(), a);
        assert_eq!(Sys::schedule_result_take(), Ok(()));
        Sys::thread_suspend(a).unwrap();
        assert_eq!(Sys::current_thread().unwrap(), b);
        assert_eq!(Sys::schedule_result_take(), Ok(()));
    }
}

mod semaphore_take_timeout {
    use super::*;

    fixture!(App);

    static STACK_A: siskin_kernel::Stack<512> = Init::INIT;

    #[test]
    fn an_unserved_take_times_out_without_touching_the_count() {
        let a = Sys::thread_init(noop, STACK_A.region(), 5, "a").unwrap();
        let s = Sys::semaphore_init(0, 1, "s").unwrap();
        boot();

        assert!(blocked(Sys::semaphore_take(s, 20)));
        App::tick(20_000);
        assert_eq!(Sys::current_thread().unwrap(), a);
        let r = Sys::schedule_result_take();
        assert!(matches!(r, Err(code) if code.kind() == Kind::Timeout));
        assert_eq!(Sys::semaphore_count(s).unwrap(), 0);

        // A later give finds no waiter and banks the permit
        Sys::semaphore_give(s).unwrap();
        assert_eq!(Sys::semaphore_count(s).unwrap(), 1);
        Sys::semaphore_take(s, 20).unwrap();
    }
}

mod mutex_misuse {
    use super::*;

    fixture!(App);

    static STACK_A: siskin_kernel::Stack<512> = Init::INIT;
    static STACK_B: siskin_kernel::Stack<512> = Init::INIT;

    #[test]
    fn relocking_and_foreign_unlocks_are_state_violations() {
        let a = Sys::thread_init(noop, STACK_A.region(), 5, "a").unwrap();
        let b = Sys::thread_init(noop, STACK_B.region(), 6, "b").unwrap();
        let m = Sys::mutex_init("m").unwrap();
        boot();

        assert_eq!(Sys::current_thread().unwrap(), a);
        Sys::mutex_lock(m).unwrap();
        let r = Sys::mutex_lock(m);
        assert!(matches!(r, Err(code) if code.kind() == Kind::StateViolation));

        // Unlock from a thread that does not hold the lock
        Sys::thread_suspend(a).unwrap();
        assert_eq!(Sys::current_thread().unwrap(), b);
        let r = Sys::mutex_unlock(m);
        assert!(matches!(r, Err(code) if code.kind() == Kind::StateViolation));
    }
}

mod queue_directions {
    use super::*;

    fixture!(App);

    static STACK_A: siskin_kernel::Stack<512> = Init::INIT;
    static SLOTS: siskin_kernel::Arena<16> = Init::INIT;

    #[test]
    fn front_sends_and_back_receives_reverse_the_order() {
        let _a = Sys::thread_init(noop, STACK_A.region(), 5, "a").unwrap();
        let q = Sys::queue_init(SLOTS.region(), 4, 4, "q").unwrap();
        boot();

        Sys::queue_send(q, &[1; 4], false, siskin_kernel::TIME_FOREVER).unwrap();
        Sys::queue_send(q, &[2; 4], false, siskin_kernel::TIME_FOREVER).unwrap();
        // Jump the line
        Sys::queue_send(q, &[3; 4], true, siskin_kernel::TIME_FOREVER).unwrap();

        let mut buf = [0u8; 4];
        Sys::queue_receive(q, &mut buf, false, siskin_kernel::TIME_FOREVER).unwrap();
        assert_eq!(buf, [3; 4]);
        // Drain the newest instead of the oldest
        Sys::queue_receive(q, &mut buf, true, siskin_kernel::TIME_FOREVER).unwrap();
        assert_eq!(buf, [2; 4]);
        Sys::queue_receive(q, &mut buf, false, siskin_kernel::TIME_FOREVER).unwrap();
        assert_eq!(buf, [1; 4]);
    }
}

mod queue_sizing {
    use super::*;

    fixture!(App);

    static STACK_A: siskin_kernel::Stack<512> = Init::INIT;
    static SLOTS: siskin_kernel::Arena<8> = Init::INIT;

    #[test]
    fn short_payloads_are_zero_padded_and_long_ones_rejected() {
        let _a = Sys::thread_init(noop, STACK_A.region(), 5, "a").unwrap();
        let q = Sys::queue_init(SLOTS.region(), 4, 2, "q").unwrap();
        boot();

        let r = Sys::queue_send(q, &[0xff; 5], false, siskin_kernel::TIME_FOREVER);
        assert!(matches!(r, Err(code) if code.kind() == Kind::InvalidArgument));

        Sys::queue_send(q, &[0xaa; 2], false, siskin_kernel::TIME_FOREVER).unwrap();
        let mut buf = [0x55u8; 4];
        Sys::queue_receive(q, &mut buf, false, siskin_kernel::TIME_FOREVER).unwrap();
        assert_eq!(buf, [0xaa, 0xaa, 0x00, 0x00]);
    }
}

mod timer_wheel {
    use super::*;

    fixture!(App);

    static STACK_A: siskin_kernel::Stack<512> = Init::INIT;
    static EARLY: AtomicUsize = AtomicUsize::new(0);
    static LATE: AtomicUsize = AtomicUsize::new(0);

    fn early_cb() {
        EARLY.fetch_add(1, Ordering::SeqCst);
    }

    fn late_cb() {
        LATE.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn timers_fire_in_deadline_order_through_the_housekeeping_thread() {
        let _a = Sys::thread_init(noop, STACK_A.region(), 5, "a").unwrap();
        let early = Sys::timer_init(early_cb, "early").unwrap();
        let late = Sys::timer_init(late_cb, "late").unwrap();
        boot();

        // Armed out of deadline order
        Sys::timer_start(late, 10, false).unwrap();
        Sys::timer_start(early, 5, false).unwrap();
        assert!(Sys::timer_is_busy(early).unwrap());

        App::tick(5_000);
        App::advance_housekeeping();
        assert_eq!(EARLY.load(Ordering::SeqCst), 1);
        assert_eq!(LATE.load(Ordering::SeqCst), 0);
        assert!(!Sys::timer_is_busy(early).unwrap());
        assert!(Sys::timer_is_busy(late).unwrap());

        App::tick(5_000);
        App::advance_housekeeping();
        assert_eq!(LATE.load(Ordering::SeqCst), 1);
    }
}

mod timer_periodic {
    use super::*;

    fixture!(App);

    static STACK_A: siskin_kernel::Stack<512> = Init::INIT;
    static FIRED: AtomicUsize = AtomicUsize::new(0);

    fn cb() {
        FIRED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn periodic_timers_rearm_until_stopped() {
        let _a = Sys::thread_init(noop, STACK_A.region(), 5, "a").unwrap();
        let t = Sys::timer_init(cb, "t").unwrap();
        boot();

        Sys::timer_start(t, 3, true).unwrap();
        for _ in 0..3 {
            App::tick(3_000);
            App::advance_housekeeping();
        }
        assert_eq!(FIRED.load(Ordering::SeqCst), 3);

        Sys::timer_stop(t).unwrap();
        assert!(!Sys::timer_is_busy(t).unwrap());
        App::tick(3_000);
        App::advance_housekeeping();
        assert_eq!(FIRED.load(Ordering::SeqCst), 3);
    }
}

mod timer_zero_delay {
    use super::*;

    fixture!(App);

    static STACK_A: siskin_kernel::Stack<512> = Init::INIT;
    static FIRED: AtomicUsize = AtomicUsize::new(0);

    fn cb() {
        FIRED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn a_zero_delay_fires_on_the_next_tick_not_immediately() {
        let _a = Sys::thread_init(noop, STACK_A.region(), 5, "a").unwrap();
        let t = Sys::timer_init(cb, "t").unwrap();
        boot();

        Sys::timer_start(t, 0, false).unwrap();
        App::advance_housekeeping();
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);

        App::tick(1_000);
        App::advance_housekeeping();
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }
}

mod event_edge_callback {
    use super::*;

    fixture!(App);

    static STACK_A: siskin_kernel::Stack<512> = Init::INIT;
    static FIRED: AtomicUsize = AtomicUsize::new(0);

    fn cb() {
        FIRED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn edge_bits_run_the_callback_from_the_notification_path() {
        let _a = Sys::thread_init(noop, STACK_A.region(), 5, "a").unwrap();
        let e = Sys::event_init(0x4, Some(cb), "e").unwrap();
        boot();

        // A publication outside the edge mask stays quiet
        Sys::event_set(e, 0x2).unwrap();
        App::advance_housekeeping();
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);

        Sys::event_set(e, 0x6).unwrap();
        App::advance_housekeeping();
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }
}

mod stack_accounting {
    use super::*;

    fixture!(App);

    static STACK_A: siskin_kernel::Stack<512> = Init::INIT;

    #[test]
    fn an_unrun_stack_is_fully_painted_and_delete_scrubs_the_slot() {
        let a = Sys::thread_init(noop, STACK_A.region(), 5, "a").unwrap();
        let b = {
            static STACK_B: siskin_kernel::Stack<512> = Init::INIT;
            Sys::thread_init(noop, STACK_B.region(), 6, "b").unwrap()
        };
        boot();

        assert_eq!(Sys::thread_stack_free(b).unwrap(), 512);

        // The running thread cannot delete itself
        assert_eq!(Sys::current_thread().unwrap(), a);
        let r = Sys::thread_delete(a);
        assert!(matches!(r, Err(code) if code.kind() == Kind::StateViolation));

        Sys::thread_delete(b).unwrap();
        let r = Sys::thread_name(b);
        assert!(matches!(r, Err(code) if code.kind() == Kind::InvalidHandle));

        // The slot is reusable
        static STACK_C: siskin_kernel::Stack<512> = Init::INIT;
        let c = Sys::thread_init(noop, STACK_C.region(), 7, "c").unwrap();
        assert_eq!(Sys::thread_name(c).unwrap(), "c");
    }
}

mod run_analyzer {
    use super::*;

    fixture!(App);

    static STACK_A: siskin_kernel::Stack<512> = Init::INIT;

    #[test]
    fn the_analyzer_accounts_run_time_across_switches() {
        let a = Sys::thread_init(noop, STACK_A.region(), 5, "a").unwrap();
        boot();

        assert_eq!(Sys::current_thread().unwrap(), a);
        App::tick(5_000);
        assert!(blocked(Sys::thread_sleep(10)));

        let analyze = Sys::thread_analyze(a).unwrap();
        assert_eq!(analyze.last_run_ms, 5);
        assert_eq!(analyze.total_run_ms, 5);
    }
}

mod schedule_lock {
    use super::*;

    fixture!(App);

    static STACK_A: siskin_kernel::Stack<512> = Init::INIT;
    static STACK_B: siskin_kernel::Stack<512> = Init::INIT;

    #[test]
    fn the_schedule_lock_defers_preemption() {
        let a = Sys::thread_init(noop, STACK_A.region(), 5, "a").unwrap();
        let b = Sys::thread_init(noop, STACK_B.region(), 6, "b").unwrap();
        boot();

        assert_eq!(Sys::current_thread().unwrap(), a);
        Sys::thread_suspend(a).unwrap();
        assert_eq!(Sys::current_thread().unwrap(), b);

        // With the lock held, waking the more urgent A does not switch
        Sys::schedule_lock().unwrap();
        Sys::thread_resume(a).unwrap();
        assert_eq!(Sys::current_thread().unwrap(), b);

        // Releasing the last nesting level delivers the deferred switch
        Sys::schedule_unlock().unwrap();
        assert_eq!(Sys::current_thread().unwrap(), a);
    }
}
