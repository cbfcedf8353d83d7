//! End-to-end scheduling scenarios driven through the hosted port.
//!
//! Each test owns a complete kernel instance. The driver thread acts on
//! behalf of whichever task the scheduler has selected; a blocking call that
//! suspends the selected task returns the kernel's unavailable marker, after
//! which the driver delivers the wake-up and reads the woken task's channel
//! with `schedule_result_take`, exactly as the resumed thread would.
use siskin_kernel::{Init, Kind};

fn noop() {}

/// `true` iff the result is the hosted port's "now blocked" marker.
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

mod mutex_priority_inheritance {
    use super::*;

    fixture!(App);

    static STACK_A: siskin_kernel::Stack<512> = Init::INIT;
    static STACK_B: siskin_kernel::Stack<512> = Init::INIT;

    #[test]
    fn holder_inherits_and_sheds_the_waiter_priority() {
        let b = Sys::thread_init(noop, STACK_B.region(), 10, "b").unwrap();
        let a = Sys::thread_init(noop, STACK_A.region(), 5, "a").unwrap();
        let m = Sys::mutex_init("m").unwrap();
        boot();

        // A is the most urgent, so it runs first; have it step aside so B
        // can take the lock
        assert_eq!(Sys::current_thread().unwrap(), a);
        Sys::thread_suspend(a).unwrap();
        assert_eq!(Sys::current_thread().unwrap(), b);
        Sys::mutex_lock(m).unwrap();
        assert_eq!(Sys::mutex_holder(m).unwrap(), Some(b));

        // Back to A, which now contends for the lock
        Sys::thread_resume(a).unwrap();
        assert_eq!(Sys::current_thread().unwrap(), a);
        assert!(blocked(Sys::mutex_lock(m)));

        // B inherited A's urgency and keeps running
        assert_eq!(Sys::current_thread().unwrap(), b);
        assert_eq!(Sys::thread_priority(b).unwrap(), 5);

        // Unlock: B reverts, A becomes the holder and wakes with success
        Sys::mutex_unlock(m).unwrap();
        assert_eq!(Sys::thread_priority(b).unwrap(), 10);
        assert_eq!(Sys::mutex_holder(m).unwrap(), Some(a));
        assert_eq!(Sys::current_thread().unwrap(), a);
        assert_eq!(Sys::schedule_result_take(), Ok(()));

        // Round trip: a plain lock/unlock leaves the priority untouched
        Sys::mutex_unlock(m).unwrap();
        assert_eq!(Sys::thread_priority(a).unwrap(), 5);
    }
}

mod event_all_of_accumulation {
    use super::*;

    fixture!(App);

    static STACK_T1: siskin_kernel::Stack<512> = Init::INIT;
    static STACK_T2: siskin_kernel::Stack<512> = Init::INIT;

    #[test]
    fn waiter_accumulates_bits_across_pulses() {
        let t2 = Sys::thread_init(noop, STACK_T2.region(), 10, "t2").unwrap();
        let t1 = Sys::thread_init(noop, STACK_T1.region(), 20, "t1").unwrap();
        let e = Sys::event_init(0, None, "e").unwrap();
        boot();

        // Park T2 so the less urgent T1 can start its wait
        assert_eq!(Sys::current_thread().unwrap(), t2);
        Sys::thread_suspend(t2).unwrap();
        assert_eq!(Sys::current_thread().unwrap(), t1);
        assert!(blocked(Sys::event_wait(e, 0x3, 0x3, 1000)));

        Sys::thread_resume(t2).unwrap();
        assert_eq!(Sys::current_thread().unwrap(), t2);

        // First pulse: one of the two bits arrives; T1 stays blocked
        Sys::event_set(e, 0x1).unwrap();
        assert_eq!(Sys::event_collected_bits(t1).unwrap(), 0x1);
        assert_eq!(Sys::current_thread().unwrap(), t2);

        // Second pulse completes the trigger mask
        Sys::event_set(e, 0x2).unwrap();
        assert_eq!(Sys::event_collected_bits(t1).unwrap(), 0x3);

        // T1 is ready again but less urgent than T2; step T2 aside to let
        // it consume its wake-up
        Sys::thread_suspend(t2).unwrap();
        assert_eq!(Sys::current_thread().unwrap(), t1);
        assert_eq!(Sys::schedule_result_take(), Ok(()));
    }
}

mod event_timeout_partial_bits {
    use super::*;

    fixture!(App);

    static STACK_T3: siskin_kernel::Stack<512> = Init::INIT;
    static STACK_T4: siskin_kernel::Stack<512> = Init::INIT;

    #[test]
    fn unfinished_trigger_times_out_with_partial_bits() {
        let t4 = Sys::thread_init(noop, STACK_T4.region(), 10, "t4").unwrap();
        let t3 = Sys::thread_init(noop, STACK_T3.region(), 20, "t3").unwrap();
        let e = Sys::event_init(0, None, "e2").unwrap();
        boot();

        assert_eq!(Sys::current_thread().unwrap(), t4);
        Sys::thread_suspend(t4).unwrap();
        assert!(blocked(Sys::event_wait(e, 0x3, 0x3, 1000)));

        Sys::thread_resume(t4).unwrap();
        Sys::event_set(e, 0x1).unwrap();
        assert_eq!(Sys::event_collected_bits(t3).unwrap(), 0x1);

        // Let the wait expire
        App::tick(1_000_000);
        Sys::thread_suspend(t4).unwrap();
        assert_eq!(Sys::current_thread().unwrap(), t3);
        let r = Sys::schedule_result_take();
        assert!(matches!(r, Err(code) if code.kind() == Kind::Timeout));
        assert_eq!(Sys::event_collected_bits(t3).unwrap(), 0x1);
    }
}

mod queue_full_and_rendezvous {
    use super::*;

    fixture!(App);

    static STACK_P: siskin_kernel::Stack<512> = Init::INIT;
    static STACK_C: siskin_kernel::Stack<512> = Init::INIT;
    static SLOTS: siskin_kernel::Arena<12> = Init::INIT;

    #[test]
    fn blocked_sender_completes_after_one_receive() {
        let p = Sys::thread_init(noop, STACK_P.region(), 5, "p").unwrap();
        let _c = Sys::thread_init(noop, STACK_C.region(), 6, "c").unwrap();
        let q = Sys::queue_init(SLOTS.region(), 4, 3, "q").unwrap();
        boot();

        assert_eq!(Sys::current_thread().unwrap(), p);
        for i in 1..=3u8 {
            Sys::queue_send(q, &[i; 4], false, siskin_kernel::TIME_FOREVER).unwrap();
        }
        assert_eq!(Sys::queue_count(q).unwrap(), 3);

        // Fourth send finds the ring full and times out
        assert!(blocked(Sys::queue_send(q, &[9; 4], false, 100)));
        App::tick(100_000);
        assert_eq!(Sys::current_thread().unwrap(), p);
        let r = Sys::schedule_result_take();
        assert!(matches!(r, Err(code) if code.kind() == Kind::Timeout));
        assert_eq!(Sys::queue_count(q).unwrap(), 3);

        // Retry, then unblock it by draining one slot
        assert!(blocked(Sys::queue_send(q, &[9; 4], false, siskin_kernel::TIME_FOREVER)));
        let mut buf = [0u8; 4];
        Sys::queue_receive(q, &mut buf, false, siskin_kernel::TIME_FOREVER).unwrap();
        assert_eq!(buf, [1; 4]);

        // The sender's payload moved through the ring in its wake-up
        // epilogue
        assert_eq!(Sys::current_thread().unwrap(), p);
        assert_eq!(Sys::schedule_result_take(), Ok(()));
        assert_eq!(Sys::queue_count(q).unwrap(), 3);

        for expected in [[2u8; 4], [3; 4], [9; 4]] {
            Sys::queue_receive(q, &mut buf, false, siskin_kernel::TIME_FOREVER).unwrap();
            assert_eq!(buf, expected);
        }
    }
}

mod binary_semaphore_ordering {
    use super::*;

    fixture!(App);

    static STACK_T1: siskin_kernel::Stack<512> = Init::INIT;
    static STACK_T2: siskin_kernel::Stack<512> = Init::INIT;
    static STACK_T3: siskin_kernel::Stack<512> = Init::INIT;

    #[test]
    fn most_urgent_waiter_wakes_first_and_count_stays_zero() {
        let t1 = Sys::thread_init(noop, STACK_T1.region(), 5, "t1").unwrap();
        let t2 = Sys::thread_init(noop, STACK_T2.region(), 6, "t2").unwrap();
        let t3 = Sys::thread_init(noop, STACK_T3.region(), 7, "t3").unwrap();
        let s = Sys::semaphore_init(0, siskin_kernel::SEMAPHORE_BINARY, "s").unwrap();
        boot();

        assert_eq!(Sys::current_thread().unwrap(), t1);
        assert!(blocked(Sys::semaphore_take(s, siskin_kernel::TIME_FOREVER)));
        assert_eq!(Sys::current_thread().unwrap(), t2);
        assert!(blocked(Sys::semaphore_take(s, siskin_kernel::TIME_FOREVER)));
        assert_eq!(Sys::current_thread().unwrap(), t3);

        Sys::semaphore_give(s).unwrap();
        assert_eq!(Sys::current_thread().unwrap(), t1);
        assert_eq!(Sys::schedule_result_take(), Ok(()));
        assert_eq!(Sys::semaphore_count(s).unwrap(), 0);

        // T2 is still queued; the next permit goes to it
        Sys::thread_suspend(t1).unwrap();
        assert_eq!(Sys::current_thread().unwrap(), t3);
        Sys::semaphore_give(s).unwrap();
        assert_eq!(Sys::current_thread().unwrap(), t2);
        assert_eq!(Sys::schedule_result_take(), Ok(()));
        assert_eq!(Sys::semaphore_count(s).unwrap(), 0);
    }
}

mod sleep_wakes_on_internal_timer {
    use super::*;

    fixture!(App);

    static STACK_U: siskin_kernel::Stack<512> = Init::INIT;

    #[test]
    fn elapsed_time_is_at_least_the_requested_delay() {
        let u = Sys::thread_init(noop, STACK_U.region(), 5, "u").unwrap();
        boot();

        assert_eq!(Sys::current_thread().unwrap(), u);
        assert!(blocked(Sys::thread_sleep(50)));

        // One tick shy of the deadline: still asleep
        App::tick(49_000);
        assert_ne!(Sys::current_thread().unwrap(), u);

        App::tick(1_000);
        assert_eq!(Sys::current_thread().unwrap(), u);
        // The internal timer delivers a timeout; the sleep wrapper counts
        // that as success
        let r = Sys::schedule_result_take();
        assert!(matches!(r, Err(code) if code.kind() == Kind::Timeout));
        assert!(Sys::timer_total_ms().unwrap() >= 50);
    }
}

mod idle_is_the_fallback {
    use super::*;

    fixture!(App);

    static STACK_U: siskin_kernel::Stack<512> = Init::INIT;

    #[test]
    fn suspending_every_user_thread_selects_idle() {
        let u = Sys::thread_init(noop, STACK_U.region(), 5, "u").unwrap();
        boot();

        assert_eq!(Sys::current_thread().unwrap(), u);
        Sys::thread_suspend(u).unwrap();
        assert_eq!(
            Sys::current_thread().unwrap(),
            Sys::kernel_idle_thread().unwrap()
        );

        // And back again
        Sys::thread_resume(u).unwrap();
        assert_eq!(Sys::current_thread().unwrap(), u);
    }
}
