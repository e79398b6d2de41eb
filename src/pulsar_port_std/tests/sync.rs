//! Semaphores, mutexes, and events
mod common;

mod semaphore_priority_order {
    use crate::common::Trace;
    use pulsar_kernel::{Semaphore, System, TaskAttr};

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 4,
        tasks: [
            TaskAttr::new("low", 1, 3, low),
            TaskAttr::new("mid", 2, 2, mid),
            TaskAttr::new("high", 3, 1, high),
            TaskAttr::new("signaller", 4, 4, signaller),
        ],
    }

    static TRACE: Trace = Trace::new();
    static SEM: Semaphore<App> = Semaphore::new(0);

    fn waiter(name: &str) -> ! {
        SEM.wait().unwrap();
        TRACE.push(name);
        crate::common::park::<App>();
    }

    // The waiters block in the reverse order of their priorities
    fn low() {
        waiter("low");
    }

    fn mid() {
        System::<App>::sleep(1).unwrap();
        waiter("mid");
    }

    fn high() {
        System::<App>::sleep(2).unwrap();
        waiter("high");
    }

    fn signaller() {
        System::<App>::sleep(5).unwrap();
        TRACE.push(format!("value {:?}", SEM.value()));
        for _ in 0..3 {
            SEM.signal().unwrap();
        }
        TRACE.push(format!("value {:?}", SEM.value()));
        pulsar_port_std::shutdown::<App>();
    }

    #[test]
    fn run() {
        pulsar_port_std::run::<App>().unwrap();
        assert_eq!(
            TRACE.take(),
            ["value Ok(-3)", "high", "mid", "low", "value Ok(0)"]
        );
    }
}

mod semaphore_fifo_order {
    use crate::common::Trace;
    use pulsar_kernel::{QueueOrder, Semaphore, System, TaskAttr};

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 4,
        tasks: [
            TaskAttr::new("low", 1, 3, low),
            TaskAttr::new("high", 2, 1, high),
            TaskAttr::new("signaller", 3, 4, signaller),
        ],
    }

    static TRACE: Trace = Trace::new();
    static SEM: Semaphore<App> = Semaphore::with_order(0, QueueOrder::Fifo);

    fn low() {
        SEM.wait().unwrap();
        TRACE.push("low");
        crate::common::park::<App>();
    }

    fn high() {
        System::<App>::sleep(1).unwrap();
        SEM.wait().unwrap();
        TRACE.push("high");
        crate::common::park::<App>();
    }

    fn signaller() {
        System::<App>::sleep(3).unwrap();
        SEM.signal().unwrap();
        SEM.signal().unwrap();
        pulsar_port_std::shutdown::<App>();
    }

    #[test]
    fn run() {
        pulsar_port_std::run::<App>().unwrap();
        assert_eq!(TRACE.take(), ["low", "high"]);
    }
}

mod semaphore_timeout {
    use crate::common::Trace;
    use pulsar_kernel::{Semaphore, System, TaskAttr};

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 4,
        tasks: [
            TaskAttr::new("main", 1, 1, main_task),
            TaskAttr::new("helper", 2, 2, helper),
        ],
    }

    static TRACE: Trace = Trace::new();
    static SEM: Semaphore<App> = Semaphore::new(0);

    fn timed_wait(ticks: u32) {
        let start = System::<App>::tick_count();
        let result = SEM.wait_timeout(ticks);
        TRACE.push(format!(
            "{result:?} after {}",
            System::<App>::tick_count() - start
        ));
    }

    fn main_task() {
        timed_wait(3);
        // The count taken by the aborted wait is given back
        TRACE.push(format!("{:?}", SEM.value()));
        TRACE.push(format!("{:?}", SEM.try_wait()));

        SEM.signal().unwrap();
        TRACE.push(format!("{:?}", SEM.try_wait()));
        TRACE.push(format!("{:?}", SEM.value()));

        timed_wait(10);
        pulsar_port_std::shutdown::<App>();
    }

    fn helper() {
        System::<App>::sleep(5).unwrap();
        TRACE.push(format!("helper sees {:?}", SEM.value()));
        SEM.signal().unwrap();
        crate::common::park::<App>();
    }

    #[test]
    fn run() {
        pulsar_port_std::run::<App>().unwrap();
        assert_eq!(
            TRACE.take(),
            [
                "Err(Timeout) after 3",
                "Ok(0)",
                "Err(Timeout)",
                "Ok(())",
                "Ok(0)",
                "helper sees Ok(-1)",
                "Ok(()) after 2",
            ]
        );
    }
}

mod signal_from_interrupt {
    use crate::common::Trace;
    use pulsar_kernel::{Mutex, Semaphore, System, TaskAttr};

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 4,
        tasks: [
            TaskAttr::new("waiter", 1, 1, waiter),
            TaskAttr::new("worker", 2, 2, worker),
        ],
    }

    static TRACE: Trace = Trace::new();
    static SEM: Semaphore<App> = Semaphore::new(0);
    static MUTEX: Mutex<App> = Mutex::new();

    fn waiter() {
        SEM.wait().unwrap();
        TRACE.push("waiter woke");
        pulsar_port_std::shutdown::<App>();
    }

    fn worker() {
        pulsar_port_std::simulate_interrupt::<App>(|| {
            TRACE.push(format!("in isr {}", System::<App>::is_interrupt_context()));
            TRACE.push(format!("{:?}", System::<App>::current_task()));
            TRACE.push(format!("{:?}", MUTEX.try_lock()));
            SEM.signal().unwrap();
            // The waiter runs only after the handler returns
            TRACE.push("isr done");
        });
        TRACE.push("worker resumed");
        crate::common::park::<App>();
    }

    #[test]
    fn run() {
        pulsar_port_std::run::<App>().unwrap();
        assert_eq!(
            TRACE.take(),
            [
                "in isr true",
                "Err(BadContext)",
                "Err(BadContext)",
                "isr done",
                "waiter woke",
            ]
        );
    }
}

mod wait_in_interrupt {
    use pulsar_kernel::{Fault, Semaphore, System, TaskAttr};
    use pulsar_port_std::SimError;

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 4,
        tasks: [TaskAttr::new("main", 1, 1, main_task)],
    }

    static SEM: Semaphore<App> = Semaphore::new(0);

    fn main_task() {
        pulsar_port_std::simulate_interrupt::<App>(|| {
            let _ = SEM.wait();
        });
        pulsar_port_std::shutdown::<App>();
    }

    #[test]
    fn run() {
        assert_eq!(
            pulsar_port_std::run::<App>(),
            Err(SimError::Fault(Fault::IsrInvalidPrimitive))
        );
        assert_eq!(System::<App>::last_fault(), Some(Fault::IsrInvalidPrimitive));
    }
}

mod priority_inheritance {
    use crate::common::Trace;
    use pulsar_kernel::{Mutex, System, TaskAttr};

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 4,
        tasks: [
            TaskAttr::new("low", 1, 3, low),
            TaskAttr::new("mid", 2, 2, mid),
            TaskAttr::new("high", 3, 1, high),
        ],
    }

    static TRACE: Trace = Trace::new();
    static MUTEX: Mutex<App> = Mutex::new();

    fn low() {
        MUTEX.lock().unwrap();
        TRACE.push("low locked");

        // `high` blocks on the mutex at tick 2. `mid` becomes Ready at tick 3
        // but can't preempt the boosted owner.
        System::<App>::busy_delay(5).unwrap();
        TRACE.push(format!("low boosted {:?}", System::<App>::task_effective_priority(1)));

        MUTEX.unlock().unwrap();
        TRACE.push(format!("low {:?}", System::<App>::task_effective_priority(1)));
        pulsar_port_std::shutdown::<App>();
    }

    fn mid() {
        System::<App>::sleep(3).unwrap();
        TRACE.push("mid");
        crate::common::park::<App>();
    }

    fn high() {
        System::<App>::sleep(2).unwrap();
        MUTEX.lock().unwrap();
        TRACE.push(format!("high locked {:?}", MUTEX.owner()));
        MUTEX.unlock().unwrap();
        crate::common::park::<App>();
    }

    #[test]
    fn run() {
        pulsar_port_std::run::<App>().unwrap();
        assert_eq!(
            TRACE.take(),
            [
                "low locked",
                "low boosted Ok(1)",
                "high locked Ok(Some(3))",
                "mid",
                "low Ok(3)",
            ]
        );
    }
}

mod transitive_inheritance {
    use crate::common::Trace;
    use pulsar_kernel::{Mutex, System, TaskAttr};

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 5,
        time_slice: false,
        num_timers: 4,
        tasks: [
            TaskAttr::new("a", 1, 4, task_a),
            TaskAttr::new("b", 2, 3, task_b),
            TaskAttr::new("c", 3, 1, task_c),
        ],
    }

    static TRACE: Trace = Trace::new();
    static M1: Mutex<App> = Mutex::new();
    static M2: Mutex<App> = Mutex::new();

    fn effective_priority(id: u8) -> String {
        format!("{:?}", System::<App>::task_effective_priority(id))
    }

    fn task_a() {
        M1.lock().unwrap();
        // `b` blocks on M1 at tick 1, and `c` blocks on M2 (held by `b`) at
        // tick 2
        System::<App>::busy_delay(3).unwrap();
        TRACE.push(format!("a {}", effective_priority(1)));

        M1.unlock().unwrap();
        TRACE.push(format!("a {}", effective_priority(1)));
        pulsar_port_std::shutdown::<App>();
    }

    fn task_b() {
        System::<App>::sleep(1).unwrap();
        M2.lock().unwrap();
        M1.lock().unwrap();
        TRACE.push(format!("b {}", effective_priority(2)));

        M2.unlock().unwrap();
        TRACE.push(format!("b {}", effective_priority(2)));
        M1.unlock().unwrap();
        crate::common::park::<App>();
    }

    fn task_c() {
        System::<App>::sleep(2).unwrap();
        M2.lock().unwrap();
        TRACE.push("c locked");
        M2.unlock().unwrap();
        crate::common::park::<App>();
    }

    #[test]
    fn run() {
        pulsar_port_std::run::<App>().unwrap();
        assert_eq!(
            TRACE.take(),
            ["a Ok(1)", "b Ok(1)", "c locked", "b Ok(3)", "a Ok(4)"]
        );
    }
}

mod mutex_misuse {
    use crate::common::Trace;
    use pulsar_kernel::{Fault, Mutex, System, TaskAttr};
    use pulsar_port_std::SimError;

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 4,
        tasks: [
            TaskAttr::new("main", 1, 1, main_task),
            TaskAttr::new("holder", 2, 3, holder),
        ],
    }

    static TRACE: Trace = Trace::new();
    static MUTEX: Mutex<App> = Mutex::new();

    fn main_task() {
        TRACE.push(format!("{:?}", MUTEX.unlock()));

        MUTEX.lock().unwrap();
        TRACE.push(format!("{:?}", MUTEX.lock()));
        TRACE.push(format!("{:?}", MUTEX.try_lock()));
        TRACE.push(format!("{:?}", MUTEX.lock_timeout(1)));
        MUTEX.unlock().unwrap();

        // Let `holder` take the mutex
        System::<App>::sleep(1).unwrap();
        TRACE.push(format!("{:?}", MUTEX.try_lock()));

        let start = System::<App>::tick_count();
        let result = MUTEX.lock_timeout(2);
        TRACE.push(format!(
            "{result:?} after {}",
            System::<App>::tick_count() - start
        ));

        // The boost ends with the wait
        TRACE.push(format!("{:?}", System::<App>::task_effective_priority(2)));
        TRACE.push(format!("{:?}", MUTEX.owner()));

        let _ = MUTEX.unlock();
        TRACE.push("unreachable");
    }

    fn holder() {
        MUTEX.lock().unwrap();
        TRACE.push("holder locked");
        System::<App>::sleep(100).unwrap();
        crate::common::park::<App>();
    }

    #[test]
    fn run() {
        assert_eq!(
            pulsar_port_std::run::<App>(),
            Err(SimError::Fault(Fault::UnlockNotOwner))
        );
        assert_eq!(
            TRACE.take(),
            [
                "Err(NotLocked)",
                "Err(WouldDeadlock)",
                "Err(WouldDeadlock)",
                "Err(WouldDeadlock)",
                "holder locked",
                "Err(Timeout)",
                "Err(Timeout) after 2",
                "Ok(3)",
                "Ok(Some(2))",
            ]
        );
    }
}

mod event_wakeups {
    use crate::common::Trace;
    use pulsar_kernel::{Event, System, TaskAttr};

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 4,
        tasks: [
            TaskAttr::new("s1", 1, 2, sleeper1),
            TaskAttr::new("s2", 2, 1, sleeper2),
            TaskAttr::new("waker", 3, 3, waker),
        ],
    }

    static TRACE: Trace = Trace::new();
    static EVENT: Event<App> = Event::new();

    fn sleeper1() {
        EVENT.sleep().unwrap();
        TRACE.push("s1");
        crate::common::park::<App>();
    }

    fn sleeper2() {
        // Sleep on the event after `s1` despite the higher priority
        System::<App>::sleep(1).unwrap();
        EVENT.sleep().unwrap();
        TRACE.push("s2");
        crate::common::park::<App>();
    }

    fn waker() {
        System::<App>::sleep(2).unwrap();
        TRACE.push(format!("waiters {:?}", EVENT.waiters()));
        let woken = EVENT.wake();
        TRACE.push(format!("wake {woken:?}"));
        let woken = EVENT.wake_all();
        TRACE.push(format!("wake_all {woken:?}"));
        let woken = EVENT.wake();
        TRACE.push(format!("wake {woken:?}"));

        let start = System::<App>::tick_count();
        let result = EVENT.sleep_timeout(3);
        TRACE.push(format!(
            "{result:?} after {}",
            System::<App>::tick_count() - start
        ));
        pulsar_port_std::shutdown::<App>();
    }

    #[test]
    fn run() {
        pulsar_port_std::run::<App>().unwrap();
        assert_eq!(
            TRACE.take(),
            [
                "waiters Ok(2)",
                "s1",
                "wake Ok(true)",
                "s2",
                "wake_all Ok(1)",
                "wake Ok(false)",
                "Err(Timeout) after 3",
            ]
        );
    }
}

mod semaphore_owner_tracking {
    use crate::common::Trace;
    use pulsar_kernel::{Semaphore, System, TaskAttr};

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 4,
        tasks: [
            TaskAttr::new("low", 1, 3, low),
            TaskAttr::new("high", 2, 1, high),
        ],
    }

    static TRACE: Trace = Trace::new();
    static SEM: Semaphore<App> = Semaphore::with_owner_tracking(1);

    fn low() {
        SEM.wait().unwrap();
        // `high` blocks on the semaphore at tick 1
        System::<App>::busy_delay(2).unwrap();
        TRACE.push(format!("low {:?}", System::<App>::task_effective_priority(1)));
        SEM.signal().unwrap();
        TRACE.push(format!("low {:?}", System::<App>::task_effective_priority(1)));
        pulsar_port_std::shutdown::<App>();
    }

    fn high() {
        System::<App>::sleep(1).unwrap();
        SEM.wait().unwrap();
        TRACE.push("high took");
        crate::common::park::<App>();
    }

    #[test]
    fn run() {
        pulsar_port_std::run::<App>().unwrap();
        assert_eq!(TRACE.take(), ["low Ok(1)", "high took", "low Ok(3)"]);
    }
}

mod semaphore_boost_after_waiter_timeout {
    use crate::common::Trace;
    use pulsar_kernel::{Semaphore, System, TaskAttr};

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 4,
        tasks: [
            TaskAttr::new("low", 1, 3, low),
            TaskAttr::new("mid", 2, 2, mid),
            TaskAttr::new("high", 3, 1, high),
        ],
    }

    static TRACE: Trace = Trace::new();
    static SEM: Semaphore<App> = Semaphore::with_owner_tracking(1);

    fn low() {
        SEM.wait().unwrap();
        // `mid` blocks at tick 1, `high` at tick 2 until tick 4
        System::<App>::busy_delay(8).unwrap();
        TRACE.push(format!("low {:?}", System::<App>::task_effective_priority(1)));
        SEM.signal().unwrap();
        TRACE.push(format!("low {:?}", System::<App>::task_effective_priority(1)));
        pulsar_port_std::shutdown::<App>();
    }

    fn mid() {
        System::<App>::sleep(1).unwrap();
        SEM.wait().unwrap();
        TRACE.push("mid took");
        crate::common::park::<App>();
    }

    fn high() {
        System::<App>::sleep(2).unwrap();
        TRACE.push(format!("high {:?}", SEM.wait_timeout(2)));
        crate::common::park::<App>();
    }

    #[test]
    fn run() {
        pulsar_port_std::run::<App>().unwrap();
        // The boost from `mid` outlives the one from `high`
        assert_eq!(
            TRACE.take(),
            ["high Err(Timeout)", "low Ok(2)", "mid took", "low Ok(3)"]
        );
    }
}

mod semaphore_boost_survives_mutex_unlock {
    use crate::common::Trace;
    use pulsar_kernel::{Mutex, Semaphore, System, TaskAttr};

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 4,
        tasks: [
            TaskAttr::new("low", 1, 3, low),
            TaskAttr::new("high", 2, 1, high),
        ],
    }

    static TRACE: Trace = Trace::new();
    static SEM: Semaphore<App> = Semaphore::with_owner_tracking(1);
    static MUTEX: Mutex<App> = Mutex::new();

    fn low() {
        SEM.wait().unwrap();
        MUTEX.lock().unwrap();
        System::<App>::busy_delay(3).unwrap();
        MUTEX.unlock().unwrap();
        TRACE.push(format!("low {:?}", System::<App>::task_effective_priority(1)));
        SEM.signal().unwrap();
        TRACE.push(format!("low {:?}", System::<App>::task_effective_priority(1)));
        pulsar_port_std::shutdown::<App>();
    }

    fn high() {
        System::<App>::sleep(1).unwrap();
        SEM.wait().unwrap();
        TRACE.push("high took");
        crate::common::park::<App>();
    }

    #[test]
    fn run() {
        pulsar_port_std::run::<App>().unwrap();
        assert_eq!(TRACE.take(), ["low Ok(1)", "high took", "low Ok(3)"]);
    }
}

mod mutex_boost_after_waiter_timeout {
    use crate::common::Trace;
    use pulsar_kernel::{Mutex, System, TaskAttr};

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 4,
        tasks: [
            TaskAttr::new("low", 1, 3, low),
            TaskAttr::new("mid", 2, 2, mid),
            TaskAttr::new("high", 3, 1, high),
        ],
    }

    static TRACE: Trace = Trace::new();
    static MUTEX: Mutex<App> = Mutex::new();

    fn low() {
        MUTEX.lock().unwrap();
        // `mid` blocks at tick 1, `high` at tick 2 until tick 4
        System::<App>::busy_delay(8).unwrap();
        TRACE.push(format!("low {:?}", System::<App>::task_effective_priority(1)));
        MUTEX.unlock().unwrap();
        TRACE.push(format!("low {:?}", System::<App>::task_effective_priority(1)));
        pulsar_port_std::shutdown::<App>();
    }

    fn mid() {
        System::<App>::sleep(1).unwrap();
        MUTEX.lock().unwrap();
        TRACE.push("mid locked");
        MUTEX.unlock().unwrap();
        crate::common::park::<App>();
    }

    fn high() {
        System::<App>::sleep(2).unwrap();
        TRACE.push(format!("high {:?}", MUTEX.lock_timeout(2)));
        crate::common::park::<App>();
    }

    #[test]
    fn run() {
        pulsar_port_std::run::<App>().unwrap();
        assert_eq!(
            TRACE.take(),
            ["high Err(Timeout)", "low Ok(2)", "mid locked", "low Ok(3)"]
        );
    }
}

mod late_init {
    use crate::common::Trace;
    use pulsar_kernel::{utils::Init, Event, Fault, Semaphore, TaskAttr};
    use pulsar_port_std::SimError;

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 4,
        tasks: [TaskAttr::new("main", 1, 1, main_task)],
    }

    static TRACE: Trace = Trace::new();
    static SEM: Semaphore<App> = Init::INIT;
    static EVENT: Event<App> = Init::INIT;

    fn main_task() {
        TRACE.push(format!("{:?}", SEM.init(-1)));
        TRACE.push(format!("{:?}", SEM.init(2)));
        TRACE.push(format!("{:?}", SEM.value()));

        let _ = EVENT.wake();
        TRACE.push("unreachable");
    }

    #[test]
    fn run() {
        assert_eq!(
            pulsar_port_std::run::<App>(),
            Err(SimError::Fault(Fault::ObjectNotInit))
        );
        assert_eq!(TRACE.take(), ["Err(BadParam)", "Ok(())", "Ok(2)"]);
    }
}
