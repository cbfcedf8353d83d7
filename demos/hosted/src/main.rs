//! A small simulation walkthrough: two threads sharing a message queue, a
//! periodic timer, and an event, driven entirely from the host.
//!
//! The hosted port performs no real context switching; this driver plays the
//! role of whichever thread the scheduler selects and feeds the kernel
//! simulated ticks, logging what the scheduler decides along the way.
use siskin_kernel::{Init, Kind, System, TIME_FOREVER};

siskin_port_std::use_port!(struct App);
siskin_kernel::build! {
    impl KernelCfg for App {
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

type Sys = System<App>;

static PRODUCER_STACK: siskin_kernel::Stack<1024> = Init::INIT;
static CONSUMER_STACK: siskin_kernel::Stack<1024> = Init::INIT;
static QUEUE_SLOTS: siskin_kernel::Arena<32> = Init::INIT;

fn producer_entry() {}
fn consumer_entry() {}

fn heartbeat() {
    log::info!("heartbeat at {} ms", Sys::timer_total_ms().unwrap());
}

fn main() {
    env_logger::init();

    let producer =
        Sys::thread_init(producer_entry, PRODUCER_STACK.region(), 10, "producer").unwrap();
    let consumer =
        Sys::thread_init(consumer_entry, CONSUMER_STACK.region(), 5, "consumer").unwrap();
    let queue = Sys::queue_init(QUEUE_SLOTS.region(), 8, 4, "mail").unwrap();
    let beat = Sys::timer_init(heartbeat, "beat").unwrap();

    Sys::run().unwrap();
    App::advance_housekeeping();
    Sys::timer_start(beat, 100, true).unwrap();

    // The consumer is the more urgent thread, so it runs first and parks on
    // the empty queue
    assert_eq!(Sys::current_thread().unwrap(), consumer);
    let mut inbox = [0u8; 8];
    let r = Sys::queue_receive(queue, &mut inbox, false, TIME_FOREVER);
    assert!(matches!(r, Err(code) if code.kind() == Kind::Unavailable));
    log::info!(
        "consumer '{}' parked on an empty queue",
        Sys::thread_name(consumer).unwrap()
    );

    // The producer takes over and posts a message; the consumer's wake-up
    // epilogue moves it straight into `inbox`
    assert_eq!(Sys::current_thread().unwrap(), producer);
    Sys::queue_send(queue, b"ping\0\0\0\0", false, TIME_FOREVER).unwrap();

    assert_eq!(Sys::current_thread().unwrap(), consumer);
    Sys::schedule_result_take().unwrap();
    log::info!("consumer woke with {:?}", &inbox[..4]);
    assert_eq!(&inbox[..4], b"ping");

    // Let the clock run: the heartbeat timer fires twice on the
    // housekeeping thread
    for _ in 0..20 {
        App::tick(10_000);
        App::advance_housekeeping();
    }
    assert_eq!(Sys::timer_total_ms().unwrap(), 200);

    // A 50 ms nap for the consumer
    let r = Sys::thread_sleep(50);
    assert!(matches!(r, Err(code) if code.kind() == Kind::Unavailable));
    assert_eq!(Sys::current_thread().unwrap(), producer);
    App::tick(50_000);
    assert_eq!(Sys::current_thread().unwrap(), consumer);
    log::info!("consumer slept through to {} ms", Sys::timer_total_ms().unwrap());

    println!("simulation complete at {} ms", Sys::timer_total_ms().unwrap());
}
