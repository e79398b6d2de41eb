//! Task scheduling, direct task notification, and task faults
mod common;

mod priority_order {
    use crate::common::Trace;
    use pulsar_kernel::{System, TaskAttr};

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 4,
        tasks: [
            TaskAttr::new("low", 1, 2, low),
            TaskAttr::new("high", 2, 1, high),
        ],
    }

    static TRACE: Trace = Trace::new();

    fn high() {
        TRACE.push("high");
        System::<App>::sleep(1).unwrap();
        TRACE.push("high woke");
        pulsar_port_std::shutdown::<App>();
    }

    fn low() {
        TRACE.push("low");
        crate::common::park::<App>();
    }

    #[test]
    fn run() {
        pulsar_port_std::run::<App>().unwrap();
        assert_eq!(TRACE.take(), ["high", "low", "high woke"]);
    }
}

mod signal_preempts {
    use crate::common::Trace;
    use pulsar_kernel::{System, TaskAttr};

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

    fn high() {
        TRACE.push("high pend");
        System::<App>::pend().unwrap();
        TRACE.push("high woke");
        pulsar_port_std::shutdown::<App>();
    }

    fn low() {
        TRACE.push("low signal");
        System::<App>::signal(2).unwrap();
        TRACE.push("low after signal");
        crate::common::park::<App>();
    }

    #[test]
    fn run() {
        pulsar_port_std::run::<App>().unwrap();
        assert_eq!(TRACE.take(), ["high pend", "low signal", "high woke"]);
    }
}

mod yield_round_robin {
    use crate::common::Trace;
    use pulsar_kernel::{System, TaskAttr};

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 4,
        tasks: [
            TaskAttr::new("a", 1, 2, task_a),
            TaskAttr::new("b", 2, 2, task_b),
        ],
    }

    static TRACE: Trace = Trace::new();

    fn task_a() {
        for i in 0..3 {
            TRACE.push(format!("a{i}"));
            System::<App>::yield_now().unwrap();
        }
        pulsar_port_std::shutdown::<App>();
    }

    fn task_b() {
        for i in 0..3 {
            TRACE.push(format!("b{i}"));
            System::<App>::yield_now().unwrap();
        }
        crate::common::park::<App>();
    }

    #[test]
    fn run() {
        pulsar_port_std::run::<App>().unwrap();
        assert_eq!(TRACE.take(), ["a0", "b0", "a1", "b1", "a2", "b2"]);
    }
}

mod time_slice {
    use crate::common::Trace;
    use pulsar_kernel::{System, TaskAttr};

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: true,
        num_timers: 4,
        tasks: [
            TaskAttr::new("a", 1, 2, task_a).time_slice(2),
            TaskAttr::new("b", 2, 2, task_b).time_slice(2),
        ],
    }

    static TRACE: Trace = Trace::new();

    fn task_a() {
        TRACE.push("a start");
        System::<App>::busy_delay(3).unwrap();
        TRACE.push("a end");
        crate::common::park::<App>();
    }

    fn task_b() {
        TRACE.push("b start");
        System::<App>::busy_delay(1).unwrap();
        TRACE.push("b end");
        pulsar_port_std::shutdown::<App>();
    }

    #[test]
    fn run() {
        pulsar_port_std::run::<App>().unwrap();
        // `a` exhausts its slice after two ticks and goes behind `b`
        assert_eq!(TRACE.take(), ["a start", "b start", "b end"]);
    }
}

mod run_to_completion {
    use crate::common::Trace;
    use pulsar_kernel::{System, TaskAttr};

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: true,
        num_timers: 4,
        tasks: [
            TaskAttr::new("rtc", 1, 3, rtc).run_to_completion(),
            TaskAttr::new("high", 2, 1, high),
        ],
    }

    static TRACE: Trace = Trace::new();

    fn high() {
        System::<App>::pend().unwrap();
        TRACE.push("high");
        pulsar_port_std::shutdown::<App>();
    }

    fn rtc() {
        TRACE.push("rtc signal");
        System::<App>::signal(2).unwrap();
        TRACE.push("rtc busy");
        System::<App>::busy_delay(10).unwrap();
        TRACE.push("rtc done");
        crate::common::park::<App>();
    }

    #[test]
    fn run() {
        pulsar_port_std::run::<App>().unwrap();
        assert_eq!(TRACE.take(), ["rtc signal", "rtc busy", "rtc done", "high"]);
    }
}

mod sleep_ticks {
    use crate::common::Trace;
    use pulsar_kernel::{System, TaskAttr};

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 4,
        tasks: [
            TaskAttr::new("sleeper", 1, 1, sleeper),
            TaskAttr::new("short", 2, 2, short_sleeper),
        ],
    }

    static TRACE: Trace = Trace::new();

    fn sleeper() {
        let start = System::<App>::tick_count();
        System::<App>::sleep(10).unwrap();
        TRACE.push(format!("sleeper +{}", System::<App>::tick_count() - start));

        // `sleep(0)` only yields
        System::<App>::sleep(0).unwrap();
        TRACE.push(format!("sleeper +{}", System::<App>::tick_count() - start));
        pulsar_port_std::shutdown::<App>();
    }

    fn short_sleeper() {
        let start = System::<App>::tick_count();
        System::<App>::sleep(4).unwrap();
        TRACE.push(format!("short +{}", System::<App>::tick_count() - start));
        crate::common::park::<App>();
    }

    #[test]
    fn run() {
        pulsar_port_std::run::<App>().unwrap();
        assert_eq!(TRACE.take(), ["short +4", "sleeper +10", "sleeper +10"]);
        assert_eq!(System::<App>::tick_wraps(), 0);
    }
}

mod suspend_and_signal {
    use crate::common::Trace;
    use pulsar_kernel::{System, TaskAttr};

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 4,
        tasks: [
            TaskAttr::new("main", 1, 1, main_task),
            TaskAttr::new("victim", 2, 2, victim),
        ],
    }

    static TRACE: Trace = Trace::new();

    fn main_task() {
        // `victim` is Ready, so the signal is lost
        System::<App>::signal(2).unwrap();
        TRACE.push(format!("lost {}", System::<App>::lost_signals(2).unwrap()));

        System::<App>::suspend(2).unwrap();
        TRACE.push(format!("{:?}", System::<App>::task_state(2).unwrap()));
        TRACE.push(format!("{:?}", System::<App>::suspend(2)));

        // `victim` must not run while suspended
        System::<App>::sleep(3).unwrap();
        TRACE.push("main woke");

        System::<App>::signal(2).unwrap();
        TRACE.push(format!("{:?}", System::<App>::task_state(2).unwrap()));
        System::<App>::pend().unwrap();
        TRACE.push("main signalled");
        pulsar_port_std::shutdown::<App>();
    }

    fn victim() {
        TRACE.push(format!("victim is {:?}", System::<App>::current_task()));
        System::<App>::signal(1).unwrap();
        crate::common::park::<App>();
    }

    #[test]
    fn run() {
        pulsar_port_std::run::<App>().unwrap();
        assert_eq!(
            TRACE.take(),
            [
                "lost 1",
                "Suspended",
                "Err(BadObjectState)",
                "main woke",
                "Ready",
                "victim is Ok(2)",
                "main signalled",
            ]
        );
    }
}

mod task_queries {
    use crate::common::Trace;
    use pulsar_kernel::{System, TaskAttr, IDLE_TASK_ID, TIMER_TASK_ID};

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 6,
        time_slice: false,
        num_timers: 4,
        tasks: [TaskAttr::new("main", 7, 5, main_task)],
    }

    static TRACE: Trace = Trace::new();

    fn main_task() {
        TRACE.push(format!("{:?}", System::<App>::task_priority(7)));
        TRACE.push(format!("{:?}", System::<App>::task_priority(IDLE_TASK_ID)));
        TRACE.push(format!("{:?}", System::<App>::task_priority(TIMER_TASK_ID)));
        TRACE.push(format!("{:?}", System::<App>::task_priority(8)));
        TRACE.push(format!("{:?}", System::<App>::signal(TIMER_TASK_ID)));
        TRACE.push(format!("{}", System::<App>::is_task_context()));
        pulsar_port_std::shutdown::<App>();
    }

    #[test]
    fn run() {
        pulsar_port_std::run::<App>().unwrap();
        assert_eq!(
            TRACE.take(),
            ["Ok(5)", "Ok(7)", "Ok(0)", "Err(InvalidId)", "Err(InvalidId)", "true"]
        );
    }
}

mod entry_returns {
    use pulsar_kernel::{Fault, System, TaskAttr};
    use pulsar_port_std::SimError;

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 4,
        tasks: [TaskAttr::new("main", 1, 1, main_task)],
    }

    fn main_task() {}

    #[test]
    fn run() {
        assert_eq!(
            pulsar_port_std::run::<App>(),
            Err(SimError::Fault(Fault::TaskInvalidState))
        );
        assert_eq!(System::<App>::last_fault(), Some(Fault::TaskInvalidState));
    }
}

mod reserved_task_id {
    use pulsar_kernel::{Fault, TaskAttr};
    use pulsar_port_std::SimError;

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 4,
        tasks: [TaskAttr::new("main", 255, 1, main_task)],
    }

    fn main_task() {
        pulsar_port_std::shutdown::<App>();
    }

    #[test]
    fn run() {
        assert_eq!(
            pulsar_port_std::run::<App>(),
            Err(SimError::Fault(Fault::InvalidTaskId))
        );
    }
}

mod priority_out_of_range {
    use pulsar_kernel::{Fault, TaskAttr};
    use pulsar_port_std::SimError;

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 4,
        tasks: [TaskAttr::new("main", 1, 5, main_task)],
    }

    fn main_task() {
        pulsar_port_std::shutdown::<App>();
    }

    #[test]
    fn run() {
        assert_eq!(
            pulsar_port_std::run::<App>(),
            Err(SimError::Fault(Fault::InvalidTaskPriority))
        );
    }
}

mod stall {
    use pulsar_kernel::{System, TaskAttr};
    use pulsar_port_std::{Limits, SimError};
    use std::time::Duration;

    pulsar_port_std::use_port!(unsafe struct App);

    pulsar_kernel::build! {
        App,
        min_priority: 4,
        time_slice: false,
        num_timers: 4,
        tasks: [TaskAttr::new("main", 1, 1, main_task)],
    }

    fn main_task() {
        // Nobody will ever signal us
        System::<App>::pend().unwrap();
        pulsar_port_std::shutdown::<App>();
    }

    #[test]
    fn run() {
        let limits = Limits {
            max_idle_ticks: 50,
            deadline: Duration::from_secs(30),
        };
        assert_eq!(
            pulsar_port_std::run_with_limits::<App>(limits),
            Err(SimError::Stalled)
        );
    }
}
