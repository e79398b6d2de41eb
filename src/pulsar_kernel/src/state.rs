//! Global kernel state
use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering},
};

use crate::{
    error::{self, Fault},
    task::readyqueue::ReadyQueue,
    timer::TimerQueues,
    utils::Init,
    wait::{QueueOrder, WaitQueue},
    KernelTraits, System,
};

/// `State::running_task` when no task is running.
const NO_TASK: usize = usize::MAX;

/// Global kernel state.
pub struct State<Traits: 'static> {
    /// The pool index of the currently running task. `NO_TASK` if there is
    /// none.
    running_task: AtomicUsize,

    /// The task ready queue.
    pub(crate) ready_queue: ReadyQueue<Traits>,

    /// Tasks that are pending, sleeping, or suspended. This queue is not
    /// associated with any kernel object.
    pub(crate) sleep_queue: WaitQueue<Traits>,

    /// The delta lists and the free list of the timer pool.
    pub(crate) timers: TimerQueues<Traits>,

    /// The number of ticks since boot, modulo `2^32`.
    pub(crate) tick_count: AtomicU32,

    /// The number of times `tick_count` has wrapped around.
    pub(crate) tick_wraps: AtomicU32,

    /// Set while the timer-handler task is running a user timer callback.
    pub(crate) in_timer_callback: AtomicBool,

    pub(crate) faulted: AtomicBool,
    pub(crate) fault_code: AtomicU8,
}

impl<Traits: 'static> Init for State<Traits> {
    const INIT: Self = Self {
        running_task: AtomicUsize::new(NO_TASK),
        ready_queue: Init::INIT,
        sleep_queue: WaitQueue::new(QueueOrder::Fifo),
        timers: Init::INIT,
        tick_count: AtomicU32::new(0),
        tick_wraps: AtomicU32::new(0),
        in_timer_callback: AtomicBool::new(false),
        faulted: AtomicBool::new(false),
        fault_code: AtomicU8::new(0),
    };
}

impl<Traits: 'static> State<Traits> {
    /// Get the pool index of the currently running task.
    ///
    /// The port reads this after [`PortToKernel::choose_running_task`] to find
    /// the task to dispatch.
    ///
    /// [`PortToKernel::choose_running_task`]: crate::PortToKernel::choose_running_task
    #[inline]
    pub fn running_task(&self) -> Option<usize> {
        match self.running_task.load(Ordering::Relaxed) {
            NO_TASK => None,
            i => Some(i),
        }
    }

    /// Update the running task. Only the scheduler modifies this, with CPU
    /// Lock held.
    #[inline]
    pub(crate) fn set_running_task(&self, task: Option<usize>) {
        self.running_task
            .store(task.unwrap_or(NO_TASK), Ordering::Relaxed);
    }
}

impl<Traits: KernelTraits> fmt::Debug for State<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("State")
            .field("running_task", &self.running_task())
            .field("ready_queue", &self.ready_queue)
            .field("tick_count", &self.tick_count.load(Ordering::Relaxed))
            .field("faulted", &self.faulted.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// If the current context is not a task context, return `Err(BadContext)`.
pub(super) fn expect_task_context<Traits: KernelTraits>() -> Result<(), error::BadContextError> {
    if !Traits::is_task_context() {
        Err(error::BadContextError::BadContext)
    } else {
        Ok(())
    }
}

/// Fault with `IsrInvalidPrimitive` if the current context is not waitable.
///
/// Interrupt handlers and user timer callbacks are not waitable.
pub(super) fn expect_waitable_context<Traits: KernelTraits>() {
    if !Traits::is_task_context()
        || Traits::state().in_timer_callback.load(Ordering::Relaxed)
    {
        error::fault::<Traits>(Fault::IsrInvalidPrimitive);
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// Get the fault that halted the system, if any.
    pub fn last_fault() -> Option<Fault> {
        let state = Traits::state();
        if state.faulted.load(Ordering::Acquire) {
            Fault::from_code(state.fault_code.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    /// Get the number of ticks since boot, modulo `2^32`.
    pub fn tick_count() -> u32 {
        Traits::state().tick_count.load(Ordering::Relaxed)
    }

    /// Get the number of times [`Self::tick_count`] has wrapped around.
    pub fn tick_wraps() -> u32 {
        Traits::state().tick_wraps.load(Ordering::Relaxed)
    }

    /// Return a flag indicating whether the current context is a task
    /// context.
    pub fn is_task_context() -> bool {
        Traits::is_task_context()
    }

    /// Return a flag indicating whether the current context is an interrupt
    /// context.
    pub fn is_interrupt_context() -> bool {
        Traits::is_interrupt_context()
    }
}
