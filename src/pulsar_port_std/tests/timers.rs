//! Application timers and the timer pool
mod common;

mod one_shot {
    use crate::common::Trace;
    use pulsar_kernel::{timer, System, TaskAttr};

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 4,
        tasks: [TaskAttr::new("main", 1, 1, main_task)],
    }

    static TRACE: Trace = Trace::new();

    fn fire(arg: usize) {
        TRACE.push(format!("fired {arg} at {}", System::<App>::tick_count()));
    }

    fn main_task() {
        let id = timer::start::<App>(5, fire, 42, false).unwrap();
        TRACE.push(format!("{:?}", timer::free_slots::<App>()));
        System::<App>::sleep(10).unwrap();

        TRACE.push(format!("{:?}", timer::stop::<App>(id)));
        TRACE.push(format!("{:?}", timer::free_slots::<App>()));
        TRACE.push(format!("{:?}", timer::start::<App>(0, fire, 0, false)));

        // Stopped before it fires
        let id = timer::start::<App>(3, fire, 7, false).unwrap();
        TRACE.push(format!("{:?}", timer::stop::<App>(id)));
        TRACE.push(format!("{:?}", timer::stop::<App>(id)));
        System::<App>::sleep(5).unwrap();
        TRACE.push("done");
        pulsar_port_std::shutdown::<App>();
    }

    #[test]
    fn run() {
        pulsar_port_std::run::<App>().unwrap();
        assert_eq!(
            TRACE.take(),
            [
                "Ok(3)",
                "fired 42 at 5",
                "Err(BadParam)",
                "Ok(4)",
                "Err(BadParam)",
                "Ok(())",
                "Err(BadParam)",
                "done",
            ]
        );
    }
}

mod periodic {
    use crate::common::Trace;
    use pulsar_kernel::{timer, System, TaskAttr};

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 4,
        tasks: [TaskAttr::new("main", 1, 1, main_task)],
    }

    static TRACE: Trace = Trace::new();

    fn tick(_: usize) {
        TRACE.push(format!("tick at {}", System::<App>::tick_count()));
    }

    fn main_task() {
        let id = timer::start::<App>(2, tick, 0, true).unwrap();
        System::<App>::sleep(7).unwrap();

        TRACE.push(format!("{:?}", timer::stop::<App>(id)));
        System::<App>::sleep(5).unwrap();
        TRACE.push(format!("{:?}", timer::stop::<App>(id)));
        pulsar_port_std::shutdown::<App>();
    }

    #[test]
    fn run() {
        pulsar_port_std::run::<App>().unwrap();
        assert_eq!(
            TRACE.take(),
            ["tick at 2", "tick at 4", "tick at 6", "Ok(())", "Err(BadParam)"]
        );
    }
}

mod callback_signals_task {
    use crate::common::Trace;
    use pulsar_kernel::{timer, System, TaskAttr};

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 2,
        tasks: [TaskAttr::new("main", 1, 1, main_task)],
    }

    static TRACE: Trace = Trace::new();

    fn kick(id: usize) {
        System::<App>::signal(id as u8).unwrap();
    }

    fn main_task() {
        let id = timer::start::<App>(3, kick, 1, true).unwrap();
        for _ in 0..3 {
            System::<App>::pend().unwrap();
            TRACE.push(format!("woke at {}", System::<App>::tick_count()));
        }
        timer::stop::<App>(id).unwrap();
        pulsar_port_std::shutdown::<App>();
    }

    #[test]
    fn run() {
        pulsar_port_std::run::<App>().unwrap();
        assert_eq!(TRACE.take(), ["woke at 3", "woke at 6", "woke at 9"]);
    }
}

mod pool_exhaustion {
    use crate::common::Trace;
    use pulsar_kernel::{timer, Semaphore, System, TaskAttr};

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 1,
        tasks: [TaskAttr::new("main", 1, 1, main_task)],
    }

    static TRACE: Trace = Trace::new();
    static SEM: Semaphore<App> = Semaphore::new(0);

    fn never(_: usize) {
        TRACE.push("fired");
    }

    fn main_task() {
        let id = timer::start::<App>(100, never, 0, false).unwrap();
        TRACE.push(format!("{:?}", timer::free_slots::<App>()));
        TRACE.push(format!("{:?}", timer::start::<App>(1, never, 0, false)));
        TRACE.push(format!("{:?}", System::<App>::sleep(1)));

        // The wait never starts, so the count is left as it was
        TRACE.push(format!("{:?}", SEM.wait_timeout(1)));
        TRACE.push(format!("{:?}", SEM.value()));

        timer::stop::<App>(id).unwrap();
        TRACE.push(format!("{:?}", System::<App>::sleep(1)));
        pulsar_port_std::shutdown::<App>();
    }

    #[test]
    fn run() {
        pulsar_port_std::run::<App>().unwrap();
        assert_eq!(
            TRACE.take(),
            [
                "Ok(0)",
                "Err(NoTimerSlot)",
                "Err(NoTimerSlot)",
                "Err(NoTimerSlot)",
                "Ok(0)",
                "Ok(())",
            ]
        );
    }
}

mod blocking_callback {
    use pulsar_kernel::{timer, Fault, System, TaskAttr};
    use pulsar_port_std::SimError;

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 4,
        tasks: [TaskAttr::new("main", 1, 1, main_task)],
    }

    fn bad_callback(_: usize) {
        let _ = System::<App>::sleep(1);
    }

    fn main_task() {
        timer::start::<App>(1, bad_callback, 0, false).unwrap();
        System::<App>::sleep(5).unwrap();
        pulsar_port_std::shutdown::<App>();
    }

    #[test]
    fn run() {
        assert_eq!(
            pulsar_port_std::run::<App>(),
            Err(SimError::Fault(Fault::IsrInvalidPrimitive))
        );
    }
}
