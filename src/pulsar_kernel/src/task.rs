//! Tasks
use core::fmt;

use crate::{
    error::{
        self, BusyDelayError, CreateTaskError, Fault, GetCurrentTaskError,
        GetTaskInfoError, InvalidIdError, PendError, SignalTaskError, SleepError,
        SuspendTaskError, WaitTimeoutError, YieldError,
    },
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    mutex, state,
    utils::Init,
    wait::{self, WaitPayload},
    KernelCfg, KernelTraits, Port, System,
};

pub(crate) mod list;
pub(crate) mod readyqueue;
use self::readyqueue::ScheduleDecision;

/// The user-visible identifier of a task.
pub type TaskId = u8;

/// The ID of the idle task.
pub const IDLE_TASK_ID: TaskId = 0;

/// The ID of the timer-handler task.
pub const TIMER_TASK_ID: TaskId = 255;

/// The pool index of the idle task.
pub(crate) const IDLE_TASK: usize = 0;

/// The pool index of the timer-handler task.
pub(crate) const TIMER_TASK: usize = 1;

/// The time slice assigned by [`TaskAttr::new`].
pub const DEFAULT_TIME_SLICE: u32 = 5;

/// The stack size assigned by [`TaskAttr::new`].
pub const DEFAULT_STACK_SIZE: usize = 4096;

/// The static properties of a task.
#[derive(Clone, Copy)]
pub struct TaskAttr {
    /// The entry point of the task. This function must never return.
    pub entry_point: fn(),

    /// A human-readable name used in diagnostics.
    pub name: &'static str,

    /// The user-visible ID. `1..=254` for user tasks.
    pub id: TaskId,

    /// The base priority.
    pub priority: usize,

    /// The length of a time slice in ticks. Only meaningful if
    /// [`KernelCfg::TIME_SLICE`] is `true`.
    pub time_slice: u32,

    /// If `true`, the task can only be preempted by the timer-handler task.
    pub run_to_completion: bool,

    /// The stack size. Ports that allocate stacks by themselves may ignore
    /// this.
    pub stack_size: usize,
}

impl TaskAttr {
    /// Construct a `TaskAttr` with the default time slice and stack size.
    pub const fn new(name: &'static str, id: TaskId, priority: usize, entry_point: fn()) -> Self {
        Self {
            entry_point,
            name,
            id,
            priority,
            time_slice: DEFAULT_TIME_SLICE,
            run_to_completion: false,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    /// Set the time slice.
    pub const fn time_slice(self, time_slice: u32) -> Self {
        Self { time_slice, ..self }
    }

    /// Mark the task as run-to-completion.
    pub const fn run_to_completion(self) -> Self {
        Self {
            run_to_completion: true,
            ..self
        }
    }

    /// Set the stack size.
    pub const fn stack_size(self, stack_size: usize) -> Self {
        Self { stack_size, ..self }
    }

    #[doc(hidden)]
    pub const fn idle<Traits: KernelTraits>() -> Self {
        Self {
            entry_point: idle_task_body::<Traits>,
            name: "idle",
            id: IDLE_TASK_ID,
            priority: Traits::MIN_PRIORITY + 1,
            time_slice: u32::MAX,
            run_to_completion: false,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    #[doc(hidden)]
    pub const fn timer_handler<Traits: KernelTraits>() -> Self {
        Self {
            entry_point: crate::timer::timer_handler_body::<Traits>,
            name: "timer",
            id: TIMER_TASK_ID,
            priority: 0,
            time_slice: u32::MAX,
            run_to_completion: false,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    /// Check the attributes of a user task against the kernel configuration.
    /// IDs `0` and `255` are reserved for the system tasks.
    pub fn validate<Traits: KernelCfg>(&self) -> Result<(), CreateTaskError> {
        if self.id == IDLE_TASK_ID || self.id == TIMER_TASK_ID {
            Err(CreateTaskError::InvalidId)
        } else if self.priority > Traits::MIN_PRIORITY {
            Err(CreateTaskError::InvalidPriority)
        } else if Traits::TIME_SLICE && self.time_slice == 0 && !self.run_to_completion {
            Err(CreateTaskError::InvalidTimeSlice)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for TaskAttr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskAttr")
            .field("entry_point", &(self.entry_point as *const ()))
            .field("name", &self.name)
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("time_slice", &self.time_slice)
            .field("run_to_completion", &self.run_to_completion)
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

/// Task state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskSt {
    /// The task has not been initialized by the kernel.
    Invalid,
    Ready,
    Running,
    /// Waiting for a semaphore or a mutex.
    Blocked,
    /// Waiting for [`System::signal`].
    Pending,
    /// Waiting for a timer or an event.
    Sleeping,
    /// Suspended by [`System::suspend`].
    Suspended,
    /// Waiting for room in a message-passing object.
    Sending,
    /// Waiting for data in a message-passing object.
    Receiving,
}

impl TaskSt {
    /// Return a flag indicating whether the state is one of the waiting
    /// states.
    pub fn is_waiting(self) -> bool {
        !matches!(self, Self::Invalid | Self::Ready | Self::Running)
    }
}

impl Init for TaskSt {
    const INIT: Self = Self::Invalid;
}

/// *Task control block* - the state data of a task.
pub struct TaskCb<Traits: Port> {
    /// Port-specific state of the task.
    pub port_task_state: Traits::PortTaskState,

    /// The static properties of the task.
    pub attr: TaskAttr,

    /// The task's base priority.
    pub(crate) base_priority: CpuLockCell<Traits, usize>,

    /// The task's effective priority. It's calculated based on `base_priority`
    /// and may be temporarily elevated by priority inheritance.
    ///
    /// The effective priority determines the task's position within the task
    /// ready queue and priority-ordered wait queues.
    pub(crate) effective_priority: CpuLockCell<Traits, usize>,

    pub(crate) st: CpuLockCell<Traits, TaskSt>,

    /// Allows `TaskCb` to participate in one of linked lists.
    ///
    ///  - In a `Ready` state, this forms the linked list headed by one of the
    ///    levels of [`State::ready_queue`].
    ///  - In a waiting state, this forms the linked list headed by a wait
    ///    queue.
    ///
    /// [`State::ready_queue`]: crate::State::ready_queue
    pub(crate) link: CpuLockCell<Traits, Option<list::TaskLink>>,

    /// The wait state of the task.
    pub(crate) wait: wait::TaskWait<Traits>,

    /// The last mutex locked by the task.
    pub(crate) last_mutex_held: CpuLockCell<Traits, Option<&'static mutex::Mutex<Traits>>>,

    /// The timer slot armed for the current sleep or wait timeout.
    pub(crate) pending_timer: CpuLockCell<Traits, Option<usize>>,

    /// The remaining ticks of the current time slice.
    pub(crate) time_left: CpuLockCell<Traits, u32>,

    /// Decremented by every tick while the task is running. Polled by
    /// [`System::busy_delay`].
    pub(crate) busy_wait: CpuLockCell<Traits, u32>,

    /// The number of signals that arrived while the task was not pending.
    pub(crate) lost_signals: CpuLockCell<Traits, u32>,
}

impl<Traits: Port> TaskCb<Traits> {
    #[doc(hidden)]
    pub const fn new(attr: TaskAttr) -> Self {
        Self {
            port_task_state: Traits::PORT_TASK_STATE_INIT,
            attr,
            base_priority: CpuLockCell::new(attr.priority),
            effective_priority: CpuLockCell::new(attr.priority),
            st: Init::INIT,
            link: Init::INIT,
            wait: Init::INIT,
            last_mutex_held: Init::INIT,
            pending_timer: Init::INIT,
            time_left: CpuLockCell::new(attr.time_slice),
            busy_wait: Init::INIT,
            lost_signals: Init::INIT,
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for TaskCb<Traits>
where
    Traits::PortTaskState: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("port_task_state", &self.port_task_state)
            .field("attr", &self.attr)
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("st", &self.st)
            .field("link", &self.link)
            .field("wait", &self.wait)
            .field("pending_timer", &self.pending_timer)
            .field("time_left", &self.time_left)
            .field("lost_signals", &self.lost_signals)
            .finish_non_exhaustive()
    }
}

#[inline]
pub(crate) fn task_cb<Traits: KernelTraits>(task: usize) -> &'static TaskCb<Traits> {
    &Traits::task_cb_pool()[task]
}

/// Find the pool index of the task with the user-visible ID `id`.
pub(crate) fn index_of<Traits: KernelTraits>(id: TaskId) -> Result<usize, InvalidIdError> {
    Traits::task_cb_pool()
        .iter()
        .position(|cb| cb.attr.id == id)
        .ok_or(InvalidIdError::InvalidId)
}

/// Find the pool index of a task that [`System::suspend`] and
/// [`System::signal`] can target.
fn user_task_index<Traits: KernelTraits>(id: TaskId) -> Result<usize, InvalidIdError> {
    match id {
        IDLE_TASK_ID | TIMER_TASK_ID => Err(InvalidIdError::InvalidId),
        _ => index_of::<Traits>(id),
    }
}

/// Get the running task. Faults if there is none, which can only happen
/// before boot.
#[inline]
pub(crate) fn running_task<Traits: KernelTraits>() -> usize {
    match Traits::state().running_task() {
        Some(task) => task,
        None => error::fault::<Traits>(Fault::TaskInvalidState),
    }
}

/// Validate the task attributes and make every task Ready.
///
/// # Safety
///
/// Must be called for exactly once during boot.
pub(crate) unsafe fn init_tasks<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let pool = Traits::task_cb_pool();

    for (i, cb) in pool.iter().enumerate() {
        if i != IDLE_TASK && i != TIMER_TASK {
            if let Err(e) = cb.attr.validate::<Traits>() {
                log::error!("task {:?} is misconfigured: {e:?}", cb.attr.name);
                error::fault::<Traits>(e.into());
            }
            if pool[..i].iter().any(|other| other.attr.id == cb.attr.id) {
                log::error!("task ID {} is used twice", cb.attr.id);
                error::fault::<Traits>(CreateTaskError::InvalidId.into());
            }
        }

        cb.base_priority.replace(&mut *lock, cb.attr.priority);
        cb.effective_priority.replace(&mut *lock, cb.attr.priority);
        cb.time_left.replace(&mut *lock, cb.attr.time_slice);

        // Safety: CPU Lock active, the task is not running
        unsafe { Traits::initialize_task_state(cb) };

        make_ready(lock.borrow_mut(), i);
    }
}

/// Transition the task into the Ready state. This function doesn't do any
/// proper cleanup for a previous state.
pub(crate) fn make_ready<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: usize,
) {
    task_cb::<Traits>(task).st.replace(&mut *lock, TaskSt::Ready);
    Traits::state().ready_queue.push_back_task(lock, task);
}

/// Relinquish CPU Lock. After that, if there's a higher-priority task than
/// `running_task`, call `Port::yield_cpu`.
///
/// System services that transition a task into the Ready state should call
/// this before returning to the caller.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) {
    let state = Traits::state();

    let has_preempting_task = match state.running_task() {
        Some(running) if *task_cb::<Traits>(running).st.read(&*lock) == TaskSt::Running => {
            let cb = task_cb::<Traits>(running);
            if cb.attr.run_to_completion {
                *task_cb::<Traits>(TIMER_TASK).st.read(&*lock) == TaskSt::Ready
            } else {
                let pri = *cb.effective_priority.read(&*lock);
                state
                    .ready_queue
                    .has_ready_task_in_priority_range(lock.borrow_mut(), pri)
            }
        }
        _ => true,
    };

    // Relinquish CPU Lock
    drop(lock);

    if has_preempting_task {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Implements `PortToKernel::choose_running_task`.
pub(crate) fn choose_next_running_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    let state = Traits::state();

    // The priority of `running_task`
    let prev_running_task = state.running_task();
    let still_running = prev_running_task
        .filter(|&task| *task_cb::<Traits>(task).st.read(&*lock) == TaskSt::Running);

    let decision = match still_running {
        // A run-to-completion task only gives way to the timer-handler task
        Some(task) if task_cb::<Traits>(task).attr.run_to_completion => {
            if *task_cb::<Traits>(TIMER_TASK).st.read(&*lock) == TaskSt::Ready {
                state.ready_queue.remove_task(lock.borrow_mut(), TIMER_TASK);
                ScheduleDecision::SwitchTo(Some(TIMER_TASK))
            } else {
                ScheduleDecision::Keep
            }
        }
        Some(task) => {
            let pri = *task_cb::<Traits>(task).effective_priority.read(&*lock);
            state.ready_queue.pop_front_task(lock.borrow_mut(), pri)
        }
        None => state.ready_queue.pop_front_task(lock.borrow_mut(), usize::MAX),
    };

    let next_running_task = match decision {
        ScheduleDecision::SwitchTo(task) => task,

        // Return if there's no task willing to take over the current one, and
        // the current one can still run.
        ScheduleDecision::Keep => return,
    };

    if let Some(task) = next_running_task {
        // Transition `next_running_task` into the Running state
        task_cb::<Traits>(task).st.replace(&mut *lock, TaskSt::Running);

        if prev_running_task == Some(task) {
            // Skip the remaining steps if `task == prev_running_task`
            return;
        }
    }

    // `prev_running_task` now loses the control of the processor.
    if let Some(task) = still_running {
        // Preempted. Go to the back of its level.
        make_ready(lock.borrow_mut(), task);
    }

    log::trace!("dispatch {:?} -> {:?}", prev_running_task, next_running_task);

    state.set_running_task(next_running_task);
}

/// Transition the currently running task into the waiting state `st`.
/// Returns when woken up.
///
/// The current context must be waitable (This function doesn't check
/// that). The caller should use `expect_waitable_context` to do that.
pub(crate) fn wait_until_woken_up<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    st: TaskSt,
) {
    debug_assert!(st.is_waiting());

    // Transition the current task to the waiting state
    let running = task_cb::<Traits>(running_task::<Traits>());
    if *running.st.read(&*lock) != TaskSt::Running {
        error::fault::<Traits>(Fault::TaskInvalidState);
    }
    running.st.replace(&mut *lock, st);

    loop {
        // Temporarily release the CPU Lock before calling `yield_cpu`
        // Safety: (1) We don't access resources protected by CPU Lock.
        //         (2) We currently have CPU Lock.
        //         (3) We will re-acquire a CPU Lock before returning from this
        //             function.
        unsafe { Traits::leave_cpu_lock() };

        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };

        // Re-acquire a CPU Lock
        unsafe { Traits::enter_cpu_lock() };

        if *running.st.read(&*lock) == TaskSt::Running {
            break;
        }

        debug_assert_eq!(*running.st.read(&*lock), st);
    }
}

/// Set the effective priority of `task` and reposition it in whatever queue
/// it's in.
fn set_effective_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: usize,
    new_pri: usize,
) {
    let cb = task_cb::<Traits>(task);
    let old_pri = cb.effective_priority.replace(&mut *lock, new_pri);
    if old_pri == new_pri {
        return;
    }

    log::trace!("task {task}: effective priority {old_pri} -> {new_pri}");

    match *cb.st.read(&*lock) {
        TaskSt::Ready => {
            Traits::state()
                .ready_queue
                .reorder_task(lock, task, new_pri, old_pri);
        }
        st if st.is_waiting() => {
            if let Some(wait) = cb.wait.current_wait.get(&*lock) {
                wait.queue.reorder_task(lock, task);
            }
        }
        _ => {}
    }
}

/// Raise the effective priority of `task` to at least `pri`. If `task` is
/// itself blocked on an object with priority inheritance, the boost
/// propagates to that object's owner.
pub(crate) fn raise_effective_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: usize,
    pri: usize,
) {
    let mut task = task;

    // Owners can form a cycle (e.g., two tasks each blocked on a mutex the
    // other holds). The loop bound stops the walk in that case.
    for _ in 0..Traits::task_cb_pool().len() {
        let cb = task_cb::<Traits>(task);
        if pri >= *cb.effective_priority.read(&*lock) {
            return;
        }

        set_effective_priority(lock.borrow_mut(), task, pri);

        match blocking_owner(lock.borrow_mut(), task) {
            Some(owner) => task = owner,
            None => return,
        }
    }
}

/// Recalculate the effective priority of `task` from its base priority and
/// the tasks blocked on what it owns:
///
/// ```text
/// effective = min(base,
///                 min(head waiter priority of each held mutex),
///                 min(priority of each waiter of an owned inheriting object))
/// ```
///
/// If the result changes the priority of a task blocked on an object with
/// priority inheritance, the owner of that object is updated in turn.
pub(crate) fn recompute_effective_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: usize,
) {
    let mut task = task;

    for _ in 0..Traits::task_cb_pool().len() {
        let cb = task_cb::<Traits>(task);
        let mut pri = *cb.base_priority.read(&*lock);

        let mut maybe_mutex = cb.last_mutex_held.get(&*lock);
        while let Some(mutex) = maybe_mutex {
            if let Some(waiter) = mutex.wait_queue.first_waiter(lock.borrow_mut()) {
                pri = pri.min(*task_cb::<Traits>(waiter).effective_priority.read(&*lock));
            }
            maybe_mutex = mutex.prev_mutex_held.get(&*lock);
        }

        if let Some(inherited) = object_waiter_priority(lock.borrow_mut(), task) {
            pri = pri.min(inherited);
        }

        if pri == *cb.effective_priority.read(&*lock) {
            return;
        }

        set_effective_priority(lock.borrow_mut(), task, pri);

        match blocking_owner(lock.borrow_mut(), task) {
            Some(owner) => task = owner,
            None => return,
        }
    }
}

/// Get the highest effective priority among the tasks blocked on the
/// semaphores and message-passing objects for which `owner` inherits
/// priorities.
fn object_waiter_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    owner: usize,
) -> Option<usize> {
    let mut pri = None;
    for (waiter, cb) in Traits::task_cb_pool().iter().enumerate() {
        let Some(wait) = cb.wait.current_wait.get(&*lock) else {
            continue;
        };
        if waiter == owner || matches!(wait.payload, WaitPayload::Mutex(_)) {
            continue;
        }
        if wait.payload.inheriting_owner(lock.borrow_mut()) == Some(owner) {
            let waiter_pri = *cb.effective_priority.read(&*lock);
            pri = Some(pri.map_or(waiter_pri, |pri: usize| pri.min(waiter_pri)));
        }
    }
    pri
}

/// If `task` is blocked on an object with priority inheritance, get the
/// object's owner.
fn blocking_owner<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: usize,
) -> Option<usize> {
    let wait = task_cb::<Traits>(task).wait.current_wait.get(&*lock)?;
    wait.payload
        .inheriting_owner(lock.borrow_mut())
        .filter(|&owner| owner != task)
}

/// Charge one tick to the running task. Called by the timer tick. Returns
/// `true` if the task's time slice has expired and it was moved to the back
/// of its level.
pub(crate) fn charge_running_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) -> bool {
    let Some(task) = Traits::state().running_task() else {
        return false;
    };
    let cb = task_cb::<Traits>(task);
    if *cb.st.read(&*lock) != TaskSt::Running {
        return false;
    }

    let busy_wait = cb.busy_wait.write(&mut *lock);
    *busy_wait = busy_wait.saturating_sub(1);

    if !Traits::TIME_SLICE || cb.attr.run_to_completion || task == IDLE_TASK {
        return false;
    }

    let time_left = cb.time_left.write(&mut *lock);
    *time_left = time_left.saturating_sub(1);
    if *time_left > 0 {
        return false;
    }

    log::trace!("task {task}: time slice expired");
    cb.time_left.replace(&mut *lock, cb.attr.time_slice);
    make_ready(lock, task);
    true
}

/// The body of the idle task.
fn idle_task_body<Traits: KernelTraits>() {
    loop {
        Traits::wait_for_interrupt();
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// Get the ID of the currently running task.
    pub fn current_task() -> Result<TaskId, GetCurrentTaskError> {
        state::expect_task_context::<Traits>()?;
        if Traits::is_cpu_lock_active() {
            return Err(GetCurrentTaskError::BadContext);
        }
        Ok(task_cb::<Traits>(running_task::<Traits>()).attr.id)
    }

    /// Relinquish the processor to other Ready tasks of the same priority.
    pub fn yield_now() -> Result<(), YieldError> {
        state::expect_task_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        yield_running_task(lock.borrow_mut());
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Block the calling task for `ticks` ticks. `sleep(0)` is equivalent to
    /// [`Self::yield_now`].
    pub fn sleep(ticks: u32) -> Result<(), SleepError> {
        state::expect_waitable_context::<Traits>();
        let mut lock = klock::lock_cpu::<Traits>()?;

        if ticks == 0 {
            yield_running_task(lock.borrow_mut());
            unlock_cpu_and_check_preemption(lock);
            return Ok(());
        }

        let result = Traits::state().sleep_queue.wait_timeout(
            lock.borrow_mut(),
            TaskSt::Sleeping,
            WaitPayload::Sleep,
            ticks,
        );

        match result {
            Ok(()) | Err(WaitTimeoutError::Timeout) => Ok(()),
            Err(WaitTimeoutError::NoTimerSlot) => Err(SleepError::NoTimerSlot),
        }
    }

    /// Spin for `ticks` ticks without giving up the processor to
    /// lower-priority tasks.
    pub fn busy_delay(ticks: u32) -> Result<(), BusyDelayError> {
        state::expect_task_context::<Traits>()?;
        let cb = task_cb::<Traits>(running_task::<Traits>());

        let mut lock = klock::lock_cpu::<Traits>()?;
        cb.busy_wait.replace(&mut *lock, ticks);
        drop(lock);

        loop {
            let lock = klock::lock_cpu::<Traits>()?;
            let remaining = *cb.busy_wait.read(&*lock);
            drop(lock);

            if remaining == 0 {
                return Ok(());
            }
            Traits::spin_hint();
        }
    }

    /// Block the calling task until another task or an interrupt handler
    /// calls [`Self::signal`] on it.
    pub fn pend() -> Result<(), PendError> {
        state::expect_waitable_context::<Traits>();
        let mut lock = klock::lock_cpu::<Traits>()?;
        Traits::state()
            .sleep_queue
            .wait(lock.borrow_mut(), TaskSt::Pending, WaitPayload::Pend);
        Ok(())
    }

    /// Wake up a task blocked by [`Self::pend`] or [`Self::suspend`]. If the
    /// task is in any other state, the signal is counted as lost.
    ///
    /// This method may be called from an interrupt context.
    pub fn signal(id: TaskId) -> Result<(), SignalTaskError> {
        let task = user_task_index::<Traits>(id)?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        signal_index(lock.borrow_mut(), task);
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Suspend a Ready or Running task until [`Self::signal`] is called on it.
    pub fn suspend(id: TaskId) -> Result<(), SuspendTaskError> {
        let task = user_task_index::<Traits>(id)?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = task_cb::<Traits>(task);
        let state = Traits::state();

        match *cb.st.read(&*lock) {
            TaskSt::Running if Traits::is_task_context() => {
                // Suspending itself
                state::expect_waitable_context::<Traits>();
                state
                    .sleep_queue
                    .wait(lock.borrow_mut(), TaskSt::Suspended, WaitPayload::Suspend);
                return Ok(());
            }
            TaskSt::Running => {
                // The running task was interrupted
                state
                    .sleep_queue
                    .park(lock.borrow_mut(), task, TaskSt::Suspended, WaitPayload::Suspend);
            }
            TaskSt::Ready => {
                state.ready_queue.remove_task(lock.borrow_mut(), task);
                state
                    .sleep_queue
                    .park(lock.borrow_mut(), task, TaskSt::Suspended, WaitPayload::Suspend);
            }
            _ => return Err(SuspendTaskError::BadObjectState),
        }

        log::trace!("task {task}: suspended");
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Get the number of signals that arrived while the task was not
    /// pending.
    pub fn lost_signals(id: TaskId) -> Result<u32, GetTaskInfoError> {
        Self::with_task(id, |lock, cb| *cb.lost_signals.read(lock))
    }

    /// Get the base priority of a task.
    pub fn task_priority(id: TaskId) -> Result<usize, GetTaskInfoError> {
        Self::with_task(id, |lock, cb| *cb.base_priority.read(lock))
    }

    /// Get the effective priority of a task.
    pub fn task_effective_priority(id: TaskId) -> Result<usize, GetTaskInfoError> {
        Self::with_task(id, |lock, cb| *cb.effective_priority.read(lock))
    }

    /// Get the state of a task.
    pub fn task_state(id: TaskId) -> Result<TaskSt, GetTaskInfoError> {
        Self::with_task(id, |lock, cb| *cb.st.read(lock))
    }

    fn with_task<R>(
        id: TaskId,
        f: impl FnOnce(&klock::CpuLockToken<Traits>, &'static TaskCb<Traits>) -> R,
    ) -> Result<R, GetTaskInfoError> {
        let task = index_of::<Traits>(id)?;
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(f(&*lock, task_cb::<Traits>(task)))
    }
}

/// Put the running task at the back of its level.
fn yield_running_task<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let task = running_task::<Traits>();
    if *task_cb::<Traits>(task).st.read(&*lock) == TaskSt::Running {
        make_ready(lock.borrow_mut(), task);
    }
}

/// Implements [`System::signal`] for a pool index. Also used by the timer
/// tick to kick the timer-handler task.
pub(crate) fn signal_index<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: usize,
) {
    let cb = task_cb::<Traits>(task);
    match *cb.st.read(&*lock) {
        TaskSt::Pending | TaskSt::Suspended => {
            log::trace!("task {task}: signalled");
            wait::resume_task(lock.borrow_mut(), task);
        }
        _ => {
            let lost = cb.lost_signals.write(&mut *lock);
            *lost = lost.wrapping_add(1);
        }
    }
}
