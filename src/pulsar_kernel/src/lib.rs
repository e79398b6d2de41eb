//! The Pulsar kernel
//!
//! Pulsar is a preemptive real-time kernel for single-core systems. The task
//! set is fixed at compile time and declared with [`build!`]. Scheduling is
//! priority-based, and every blocking service (semaphores, mutexes, events,
//! mailboxes, message queues, and pipes) shares one wait/wakeup protocol.
//!
//! The kernel is hardware-agnostic. A *port* implements [`Port`] to supply
//! context switching, the CPU Lock critical section, and the idle wait. The
//! port drives the kernel through [`PortToKernel`].
//!
//! # Contexts
//!
//! - A **task context** runs the code of a task. Only task contexts are
//!   *waitable*, i.e., allowed to block.
//! - An **interrupt context** runs an interrupt handler, including the timer
//!   tick. Calling a blocking service from an interrupt context is a
//!   [`Fault::IsrInvalidPrimitive`].
//! - User timer callbacks run on the timer-handler task but are not waitable
//!   either.
//!
//! # Priorities
//!
//! Lower values represent higher priorities. User tasks use the range
//! `0..=MIN_PRIORITY`. The timer-handler task runs at priority 0, and the idle
//! task runs below every user task at `MIN_PRIORITY + 1`.
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]
use core::marker::PhantomData;

pub mod error;
mod event;
mod klock;
mod mailbox;
mod mesgq;
mod mutex;
mod pdq;
mod pipe;
mod semaphore;
mod state;
mod task;
pub mod timer;
pub mod utils;
mod version;
mod wait;

pub use self::{
    error::{Fault, ResultCode},
    event::Event,
    mailbox::{Mail, Mailbox},
    mesgq::MessageQueue,
    mutex::Mutex,
    pdq::{PdBufId, Pdq},
    pipe::Pipe,
    semaphore::Semaphore,
    state::State,
    task::{TaskAttr, TaskCb, TaskId, TaskSt, IDLE_TASK_ID, TIMER_TASK_ID},
    timer::TimerCb,
    version::{version, version_string, VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH},
    wait::QueueOrder,
};

/// The number of priority levels supported by the ready queue.
pub const NUM_PRIORITY_LEVELS: usize = utils::PRIO_BITMAP_LEN;

/// The maximum value of [`KernelCfg::MIN_PRIORITY`]. The level below it is
/// reserved for the idle task.
pub const MAX_MIN_PRIORITY: usize = NUM_PRIORITY_LEVELS - 2;

/// Implemented by a port.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// initializing the execution environment and providing a dispatcher
/// implementation.
///
/// These methods are only meant to be called by the kernel.
pub unsafe trait Port: Sized + 'static {
    type PortTaskState: Send + Sync + 'static;

    /// The initial value of [`TaskCb::port_task_state`] for all tasks.
    const PORT_TASK_STATE_INIT: Self::PortTaskState;

    /// Transfer the control to [`State::running_task`], discarding the current
    /// (startup) context.
    ///
    /// Precondition: CPU Lock active, Startup phase
    unsafe fn dispatch_first_task() -> !;

    /// Yield the processor.
    ///
    /// In a task context, this method immediately transfers the control to
    /// a dispatcher. The dispatcher calls
    /// [`PortToKernel::choose_running_task`] to find the next task to run and
    /// transfers the control to that task.
    ///
    /// In an interrupt context, the effect of this method is deferred until
    /// the processor completes the execution of all active interrupt handler
    /// threads.
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn yield_cpu();

    /// Disable all kernel-managed interrupts (this state is called *CPU Lock*).
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn enter_cpu_lock();

    /// Re-enable kernel-managed interrupts previously disabled by
    /// `enter_cpu_lock`, thus deactivating the CPU Lock state.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Activate CPU Lock. Return `true` iff CPU Lock was inactive before the
    /// call.
    unsafe fn try_enter_cpu_lock() -> bool {
        if Self::is_cpu_lock_active() {
            false
        } else {
            // Safety: CPU Lock inactive
            unsafe { Self::enter_cpu_lock() };
            true
        }
    }

    /// Prepare the task for activation, ensuring the task will start
    /// execution from [`TaskAttr::entry_point`] next time the task receives
    /// the control.
    ///
    /// Precondition: CPU Lock active, the task is not running
    unsafe fn initialize_task_state(task: &'static TaskCb<Self>);

    /// Return a flag indicating whether a CPU Lock state is active.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the current context is a task
    /// context.
    fn is_task_context() -> bool;

    /// Return a flag indicating whether the current context is an interrupt
    /// context.
    fn is_interrupt_context() -> bool;

    /// Wait until an interrupt is taken. Called by the idle task with CPU Lock
    /// inactive.
    fn wait_for_interrupt();

    /// Called in every iteration of a busy-wait loop.
    fn spin_hint() {
        core::hint::spin_loop();
    }

    /// Disable interrupts and stop the system. Called after a fault has been
    /// latched.
    fn halt(fault: Fault) -> !;
}

/// Methods intended to be called by a port.
///
/// # Safety
///
/// These are only meant to be called by the port.
pub trait PortToKernel {
    /// Initialize runtime structures and start the first task.
    ///
    /// Should be called for exactly once by the port.
    ///
    /// Precondition: CPU Lock active
    unsafe fn boot() -> !;

    /// Determine the next task to run and store it in [`State::running_task`].
    ///
    /// Precondition: CPU Lock active / Postcondition: CPU Lock active
    unsafe fn choose_running_task();

    /// Advance the system time by one tick.
    ///
    /// Precondition: CPU Lock inactive, an interrupt context
    unsafe fn timer_tick();

    /// Called by the port when a task's entry function returns. Tasks in this
    /// kernel never terminate, so this is always a fault.
    fn task_returned() -> !;
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot() -> ! {
        // Safety: The precondition of this method includes CPU Lock being
        // active
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

        // Safety: This is the boot phase, and CPU Lock is active
        unsafe { task::init_tasks::<Traits>(lock.borrow_mut()) };

        timer::init_timers::<Traits>(lock.borrow_mut());

        log::trace!(
            "boot: {} tasks, {} timer slots",
            Traits::task_cb_pool().len(),
            Traits::timer_cb_pool().len()
        );

        // `dispatch_first_task` takes over the CPU Lock state
        core::mem::forget(lock);

        // Safety: CPU Lock active, Startup phase
        unsafe { Traits::dispatch_first_task() }
    }

    unsafe fn choose_running_task() {
        // Safety: The precondition of this method includes CPU Lock being
        // active
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

        task::choose_next_running_task::<Traits>(lock.borrow_mut());

        // Post-condition: CPU Lock active
        core::mem::forget(lock);
    }

    unsafe fn timer_tick() {
        timer::handle_tick::<Traits>();
    }

    fn task_returned() -> ! {
        log::error!(
            "task {:?} returned from its entry point",
            Traits::state().running_task()
        );
        error::fault::<Traits>(Fault::TaskInvalidState)
    }
}

/// Associates "system" types with kernel-private data. Use [`build!`] to
/// implement.
///
/// # Safety
///
/// This is only intended to be implemented by `build!`.
pub unsafe trait KernelCfg: Port + Sized {
    /// The numerically largest (i.e., lowest) priority a user task can have.
    const MIN_PRIORITY: usize;

    /// Enables round-robin scheduling among tasks sharing a priority.
    const TIME_SLICE: bool;

    /// Access the kernel's global state.
    fn state() -> &'static State<Self>;

    #[doc(hidden)]
    fn task_cb_pool() -> &'static [TaskCb<Self>];

    #[doc(hidden)]
    fn timer_cb_pool() -> &'static [TimerCb<Self>];
}

/// Represents "system" types having sufficient trait `impl`s to instantiate the
/// kernel.
pub trait KernelTraits: Port + KernelCfg + 'static {}
impl<T: Port + KernelCfg + 'static> KernelTraits for T {}

/// Wraps a system type to provide the kernel services.
///
/// ```rust,ignore
/// System::<App>::sleep(10)?;
/// ```
pub struct System<Traits>(PhantomData<Traits>);

/// Instantiate the kernel for a system type.
///
/// ```rust,ignore
/// pulsar_kernel::build! {
///     App,
///     min_priority: 5,
///     time_slice: false,
///     num_timers: 4,
///     tasks: [
///         TaskAttr::new("producer", 1, 1, producer),
///         TaskAttr::new("consumer", 2, 2, consumer).time_slice(5),
///     ],
/// }
/// ```
///
/// The idle task and the timer-handler task are added automatically. The
/// system type must also implement [`Port`], usually by the port's
/// `use_port!` macro.
#[macro_export]
macro_rules! build {
    (
        $Traits:ty,
        min_priority: $min_priority:expr,
        time_slice: $time_slice:expr,
        num_timers: $num_timers:expr,
        tasks: [ $( $task:expr ),* $(,)? ] $(,)?
    ) => {
        const _: () = {
            use $crate::{utils::Init, KernelCfg, State, TaskAttr, TaskCb, TimerCb};

            const _: () = assert!(
                $min_priority <= $crate::MAX_MIN_PRIORITY,
                "`min_priority` is out of range",
            );

            static TASK_CB_POOL: [TaskCb<$Traits>; 2 $( + $crate::replace_expr!($task 1) )*] = [
                TaskCb::new(TaskAttr::idle::<$Traits>()),
                TaskCb::new(TaskAttr::timer_handler::<$Traits>()),
                $( TaskCb::new($task), )*
            ];

            static TIMER_CB_POOL: [TimerCb<$Traits>; $num_timers] = Init::INIT;

            static STATE: State<$Traits> = Init::INIT;

            unsafe impl KernelCfg for $Traits {
                const MIN_PRIORITY: usize = $min_priority;
                const TIME_SLICE: bool = $time_slice;

                #[inline(always)]
                fn state() -> &'static State<Self> {
                    &STATE
                }

                #[inline(always)]
                fn task_cb_pool() -> &'static [TaskCb<Self>] {
                    &TASK_CB_POOL
                }

                #[inline(always)]
                fn timer_cb_pool() -> &'static [TimerCb<Self>] {
                    &TIMER_CB_POOL
                }
            }
        };
    };
}
