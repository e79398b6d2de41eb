//! Simulation environment for running Pulsar on a hosted environment
//!
//! Every task runs on its own OS thread. A single *baton* guarantees that
//! exactly one of these threads executes kernel or task code at any point of
//! time, so the kernel sees a uniprocessor system.
//!
//! Interrupts are simulated synchronously on the thread holding the baton.
//! Time is virtual: a tick is delivered whenever the idle task waits for an
//! interrupt or a task spins in [`System::busy_delay`]. A simulation therefore
//! runs as fast as the host allows, and its outcome doesn't depend on the host
//! scheduler.
//!
//! ```rust,ignore
//! pulsar_port_std::use_port!(unsafe struct App);
//!
//! pulsar_kernel::build! {
//!     App,
//!     min_priority: 4,
//!     time_slice: false,
//!     num_timers: 4,
//!     tasks: [TaskAttr::new("main", 1, 1, main_task)],
//! }
//!
//! fn main_task() {
//!     System::<App>::sleep(10).unwrap();
//!     pulsar_port_std::shutdown::<App>();
//! }
//!
//! pulsar_port_std::run::<App>().unwrap();
//! ```
//!
//! [`System::busy_delay`]: pulsar_kernel::System::busy_delay
#![deny(unsafe_op_in_unsafe_fn)]
use once_cell::sync::OnceCell;
use pulsar_kernel::{Fault, KernelTraits, Port, PortToKernel, IDLE_TASK_ID, TIMER_TASK_ID};
use spin::Mutex as SpinMutex;
use std::{
    cell::Cell,
    fmt,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate pulsar_kernel;

/// The default value of [`Limits::max_idle_ticks`].
pub const DEFAULT_MAX_IDLE_TICKS: u64 = 100_000;

/// The default value of [`Limits::deadline`].
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// The reason a simulation ended abnormally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimError {
    /// The kernel halted with a fault.
    Fault(Fault),
    /// The system made no progress: it idled for [`Limits::max_idle_ticks`]
    /// consecutive ticks, or [`Limits::deadline`] passed.
    Stalled,
    /// The host refused to create a thread for a task.
    ThreadSpawn,
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Fault(fault) => write!(f, "the kernel halted with {fault:?}"),
            Self::Stalled => f.write_str("the system stalled"),
            Self::ThreadSpawn => f.write_str("failed to spawn a task thread"),
        }
    }
}

impl std::error::Error for SimError {}

/// Bounds on a simulation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// The number of consecutive ticks the idle task may consume before the
    /// system is considered stalled.
    pub max_idle_ticks: u64,
    /// The wall-clock time after which the system is considered stalled.
    pub deadline: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_idle_ticks: DEFAULT_MAX_IDLE_TICKS,
            deadline: DEFAULT_DEADLINE,
        }
    }
}

/// Implemented on a kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
#[doc(hidden)]
pub unsafe trait PortInstance: KernelTraits + Port<PortTaskState = TaskState> {
    fn port_state() -> &'static State;
}

/// The internal state of the port.
///
/// # Safety
///
/// For the safety information of this type's methods, see the documentation of
/// the corresponding trait methods of [`Port`].
#[doc(hidden)]
pub struct State {
    sched: Mutex<Sched>,
    /// Signalled whenever the baton changes hands or the simulation ends.
    baton: Condvar,
    outcome: OnceCell<Result<(), SimError>>,
}

/// The scheduler state, protected by `State::sched`.
#[derive(Debug)]
struct Sched {
    /// The pool index of the task whose thread holds the baton. `None` while
    /// the boot thread holds it.
    current: Option<usize>,
    cpu_lock: bool,
    in_interrupt: bool,
    /// A dispatch was requested by an interrupt handler.
    dispatch_pending: bool,
    /// The number of ticks consumed by the idle task since a user task last
    /// got the baton.
    idle_ticks: u64,
    max_idle_ticks: u64,
}

#[derive(Debug)]
pub struct TaskState {
    /// The task's state in the task state machine.
    ///
    /// This field is only accessed by the baton holder, so `SpinMutex` is
    /// sufficient.
    tsm: SpinMutex<Tsm>,
}

impl TaskState {
    pub const fn new() -> Self {
        Self {
            tsm: SpinMutex::new(Tsm::Uninit),
        }
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

/// Task state machine
///
/// These don't exactly align with the task states defined in the kernel.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Tsm {
    /// The kernel hasn't called `initialize_task_state` yet.
    Uninit,
    /// The task is ready to start, but its thread hasn't been spawned.
    Dormant,
    /// The task has a thread.
    Spawned,
}

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    Boot,
    /// The backing thread for the task at the given pool index.
    Task(usize),
}

thread_local! {
    /// The current thread's role. It's automatically assigned after the
    /// creation of a thread managed by the port.
    static THREAD_ROLE: Cell<ThreadRole> = const { Cell::new(ThreadRole::Unknown) };
}

fn thread_role() -> ThreadRole {
    THREAD_ROLE.with(|role| role.get())
}

/// Get the pool index of the task backed by the current thread.
fn expect_task_thread() -> usize {
    match thread_role() {
        ThreadRole::Task(task) => task,
        role => panic!("expected a task thread, but the current thread is {role:?}"),
    }
}

/// Block the current thread for good. Used by threads whose simulated
/// processor has stopped.
fn park_forever() -> ! {
    loop {
        thread::park();
    }
}

#[allow(clippy::missing_safety_doc)]
impl State {
    pub const fn new() -> Self {
        Self {
            sched: Mutex::new(Sched {
                current: None,
                cpu_lock: false,
                in_interrupt: false,
                dispatch_pending: false,
                idle_ticks: 0,
                max_idle_ticks: DEFAULT_MAX_IDLE_TICKS,
            }),
            baton: Condvar::new(),
            outcome: OnceCell::new(),
        }
    }

    fn lock_sched(&self) -> MutexGuard<'_, Sched> {
        self.sched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Boot the kernel and wait until the simulation ends.
    pub fn port_boot<Traits: PortInstance>(
        &'static self,
        limits: Limits,
    ) -> Result<(), SimError> {
        let deadline = Instant::now() + limits.deadline;
        {
            let mut sched = self.lock_sched();
            sched.max_idle_ticks = limits.max_idle_ticks;
            // `boot` runs with CPU Lock active
            sched.cpu_lock = true;
        }

        log::trace!("starting the boot thread");
        let spawned = thread::Builder::new()
            .name("pulsar boot".into())
            .spawn(|| {
                THREAD_ROLE.with(|role| role.set(ThreadRole::Boot));
                // Safety: We are a port, so it's okay to call this
                unsafe { <Traits as PortToKernel>::boot() }
            });
        if let Err(e) = spawned {
            log::error!("failed to spawn the boot thread: {e}");
            return Err(SimError::ThreadSpawn);
        }

        let mut sched = self.lock_sched();
        loop {
            if let Some(outcome) = self.outcome.get() {
                return *outcome;
            }

            let now = Instant::now();
            if now >= deadline {
                log::warn!("the simulation has passed its deadline");
                let _ = self.outcome.set(Err(SimError::Stalled));
                continue;
            }

            sched = self
                .baton
                .wait_timeout(sched, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Record the outcome of the simulation and stop the current thread.
    fn finish(&self, outcome: Result<(), SimError>) -> ! {
        if self.outcome.set(outcome).is_ok() {
            log::debug!("simulation finished: {outcome:?}");
        }

        // Wake up `port_boot`
        let sched = self.lock_sched();
        self.baton.notify_all();
        drop(sched);

        park_forever()
    }

    pub unsafe fn dispatch_first_task<Traits: PortInstance>(&'static self) -> ! {
        log::trace!("dispatch_first_task");
        assert_eq!(thread_role(), ThreadRole::Boot);
        assert!(self.is_cpu_lock_active());

        // Safety: CPU Lock active
        unsafe { <Traits as PortToKernel>::choose_running_task() };
        let next = self.running_task::<Traits>();

        let mut sched = self.lock_sched();
        sched.cpu_lock = false;
        let result = self.switch_to::<Traits>(&mut sched, next);
        drop(sched);

        if let Err(e) = result {
            self.finish(Err(e));
        }

        // The boot thread is no longer needed
        park_forever()
    }

    /// Get the task chosen by the kernel. The idle task is always ready, so
    /// there always is one after boot.
    fn running_task<Traits: PortInstance>(&self) -> usize {
        match Traits::state().running_task() {
            Some(task) => task,
            None => pulsar_kernel::error::fault::<Traits>(Fault::TaskInvalidState),
        }
    }

    /// Pass the baton to `task`, spawning its thread on the first dispatch.
    fn switch_to<Traits: PortInstance>(
        &'static self,
        sched: &mut Sched,
        task: usize,
    ) -> Result<(), SimError> {
        let cb = &Traits::task_cb_pool()[task];
        if cb.attr.id != IDLE_TASK_ID && cb.attr.id != TIMER_TASK_ID {
            sched.idle_ticks = 0;
        }

        let mut tsm = cb.port_task_state.tsm.lock();
        match *tsm {
            Tsm::Dormant => {
                thread::Builder::new()
                    .name(format!("pulsar task {}", cb.attr.name))
                    .spawn(move || self.task_thread_body::<Traits>(task))
                    .map_err(|e| {
                        log::error!("failed to spawn a thread for task {task}: {e}");
                        SimError::ThreadSpawn
                    })?;
                log::trace!("spawned a thread for task {task}");
                *tsm = Tsm::Spawned;
            }
            Tsm::Spawned => {}
            Tsm::Uninit => unreachable!("task {task} was dispatched before initialization"),
        }

        log::trace!("baton: {:?} -> {task}", sched.current);
        sched.current = Some(task);
        self.baton.notify_all();
        Ok(())
    }

    fn task_thread_body<Traits: PortInstance>(&'static self, task: usize) {
        THREAD_ROLE.with(|role| role.set(ThreadRole::Task(task)));

        drop(self.wait_for_baton(self.lock_sched(), task));

        let cb = &Traits::task_cb_pool()[task];
        log::debug!("task {:?} is now running", cb.attr.name);

        (cb.attr.entry_point)();

        <Traits as PortToKernel>::task_returned()
    }

    /// Block the current thread until `task` gets the baton.
    fn wait_for_baton<'a>(
        &'a self,
        sched: MutexGuard<'a, Sched>,
        task: usize,
    ) -> MutexGuard<'a, Sched> {
        self.baton
            .wait_while(sched, |sched| sched.current != Some(task))
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Choose the next task and pass the baton to it. Returns when the
    /// current thread gets the baton back.
    fn dispatch<Traits: PortInstance>(&'static self) {
        let me = expect_task_thread();

        self.lock_sched().cpu_lock = true;
        // Safety: CPU Lock active
        unsafe { <Traits as PortToKernel>::choose_running_task() };
        self.lock_sched().cpu_lock = false;

        let next = self.running_task::<Traits>();
        if next == me {
            return;
        }

        let mut sched = self.lock_sched();
        if let Err(e) = self.switch_to::<Traits>(&mut sched, next) {
            drop(sched);
            self.finish(Err(e));
        }
        drop(self.wait_for_baton(sched, me));
    }

    pub unsafe fn yield_cpu<Traits: PortInstance>(&'static self) {
        log::trace!("yield_cpu");
        let mut sched = self.lock_sched();
        assert!(!sched.cpu_lock);

        if sched.in_interrupt {
            // Dispatch on return from the interrupt
            sched.dispatch_pending = true;
            return;
        }
        drop(sched);

        self.dispatch::<Traits>();
    }

    pub unsafe fn enter_cpu_lock(&self) {
        let mut sched = self.lock_sched();
        assert!(!sched.cpu_lock);
        sched.cpu_lock = true;
    }

    pub unsafe fn leave_cpu_lock(&self) {
        let mut sched = self.lock_sched();
        assert!(sched.cpu_lock);
        sched.cpu_lock = false;
    }

    pub unsafe fn initialize_task_state(&self, task: &TaskState) {
        assert!(self.is_cpu_lock_active());
        let mut tsm = task.tsm.lock();
        if *tsm == Tsm::Uninit {
            *tsm = Tsm::Dormant;
        }
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        self.lock_sched().cpu_lock
    }

    pub fn is_task_context(&self) -> bool {
        matches!(thread_role(), ThreadRole::Task(_)) && !self.lock_sched().in_interrupt
    }

    pub fn is_interrupt_context(&self) -> bool {
        thread_role() != ThreadRole::Unknown && self.lock_sched().in_interrupt
    }

    pub fn wait_for_interrupt<Traits: PortInstance>(&'static self) {
        let (idle_ticks, stalled) = {
            let mut sched = self.lock_sched();
            sched.idle_ticks += 1;
            (sched.idle_ticks, sched.idle_ticks > sched.max_idle_ticks)
        };
        if stalled {
            log::warn!("no task has run for {idle_ticks} ticks");
            self.finish(Err(SimError::Stalled));
        }

        self.tick::<Traits>();
    }

    pub fn spin_hint<Traits: PortInstance>(&'static self) {
        self.tick::<Traits>();
    }

    pub fn halt(&self, fault: Fault) -> ! {
        log::debug!("halted by {fault:?}");
        self.finish(Err(SimError::Fault(fault)))
    }

    /// Advance the virtual time by one tick.
    fn tick<Traits: PortInstance>(&'static self) {
        self.interrupt::<Traits>(|| {
            // Safety: CPU Lock inactive, an interrupt context
            unsafe { <Traits as PortToKernel>::timer_tick() }
        });
    }

    /// Run `handler` in an interrupt context on the current thread, and then
    /// dispatch if the handler made a higher-priority task Ready.
    fn interrupt<Traits: PortInstance>(&'static self, handler: impl FnOnce()) {
        if self.outcome.get().is_some() {
            // The simulated processor has stopped
            park_forever();
        }

        {
            let mut sched = self.lock_sched();
            assert!(!sched.in_interrupt, "nested interrupts are not supported");
            assert!(!sched.cpu_lock, "interrupts are masked by CPU Lock");
            sched.in_interrupt = true;
        }

        handler();

        let dispatch_pending = {
            let mut sched = self.lock_sched();
            sched.in_interrupt = false;
            std::mem::take(&mut sched.dispatch_pending)
        };
        if dispatch_pending {
            self.dispatch::<Traits>();
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Boot the kernel and block until the simulation ends.
///
/// Returns `Ok(())` after [`shutdown`] and `Err(_)` if the kernel faulted or
/// the system stalled. The simulated system can only be run once per process.
pub fn run<Traits: PortInstance>() -> Result<(), SimError> {
    run_with_limits::<Traits>(Limits::default())
}

/// [`run`] with custom stall detection limits.
pub fn run_with_limits<Traits: PortInstance>(limits: Limits) -> Result<(), SimError> {
    let _ = env_logger::Builder::from_default_env()
        .is_test(true)
        .try_init();

    Traits::port_state().port_boot::<Traits>(limits)
}

/// End the simulation successfully. [`run`] returns `Ok(())`.
///
/// The simulated processor stops, so this function never returns.
pub fn shutdown<Traits: PortInstance>() -> ! {
    log::debug!("shutdown requested");
    Traits::port_state().finish(Ok(()))
}

/// Run `handler` as an interrupt handler, preempting the calling task.
///
/// Must be called by a task. Kernel services that make a task Ready from
/// `handler` take effect when `handler` returns.
pub fn simulate_interrupt<Traits: PortInstance>(handler: impl FnOnce()) {
    expect_task_thread();
    Traits::port_state().interrupt::<Traits>(handler);
}

/// Implement [`Port`] on a system type by the simulation port.
///
/// ```rust,ignore
/// pulsar_port_std::use_port!(unsafe struct App);
/// ```
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $vis struct $SystemTraits;

        const _: () = {
            use $crate::pulsar_kernel::{Fault, Port, TaskCb};
            use $crate::{PortInstance, State, TaskState};

            static PORT_STATE: State = State::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            // Assume `$SystemTraits: KernelCfg`
            unsafe impl Port for $SystemTraits {
                type PortTaskState = TaskState;
                #[allow(clippy::declare_interior_mutable_const)]
                const PORT_TASK_STATE_INIT: Self::PortTaskState = TaskState::new();

                unsafe fn dispatch_first_task() -> ! {
                    unsafe { PORT_STATE.dispatch_first_task::<Self>() }
                }

                unsafe fn yield_cpu() {
                    unsafe { PORT_STATE.yield_cpu::<Self>() }
                }

                unsafe fn enter_cpu_lock() {
                    unsafe { PORT_STATE.enter_cpu_lock() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock() }
                }

                unsafe fn initialize_task_state(task: &'static TaskCb<Self>) {
                    unsafe { PORT_STATE.initialize_task_state(&task.port_task_state) }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active()
                }

                fn is_task_context() -> bool {
                    PORT_STATE.is_task_context()
                }

                fn is_interrupt_context() -> bool {
                    PORT_STATE.is_interrupt_context()
                }

                fn wait_for_interrupt() {
                    PORT_STATE.wait_for_interrupt::<Self>()
                }

                fn spin_hint() {
                    PORT_STATE.spin_hint::<Self>()
                }

                fn halt(fault: Fault) -> ! {
                    PORT_STATE.halt(fault)
                }
            }
        };
    };
}
