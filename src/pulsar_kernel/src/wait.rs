//! The wait/wakeup protocol shared by every blocking service
//!
//! A waiting task is linked into exactly one [`WaitQueue`] through
//! [`TaskCb::link`], and its [`TaskWait::current_wait`] records the queue and a
//! [`WaitPayload`] describing what it waits for. A task leaves the queue in
//! one of three ways:
//!
//!  - A waker calls [`WaitQueue::wake_up_one_with`] (or a variant), which
//!    completes the transfer on the waiter's behalf and makes it Ready with
//!    `Ok(())`.
//!  - The wait timeout expires. [`interrupt_task`] removes the task, runs the
//!    payload's abort hook, and makes it Ready with `Err(Timeout)`.
//!  - [`resume_task`] ends a pend or a suspension.
//!
//! [`TaskCb::link`]: crate::TaskCb
use core::{fmt, ptr::NonNull};

use crate::{
    error::{Fault, FaultExt, WaitTimeoutError},
    klock::{CpuLockCell, CpuLockTokenRefMut},
    mutex::Mutex,
    semaphore::Semaphore,
    task::{self, list::TaskList, task_cb, TaskSt},
    timer,
    utils::Init,
    KernelTraits,
};

/// Specifies the sorting order of a wait queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrder {
    /// The wait queue is processed in a FIFO order.
    Fifo,
    /// The wait queue is processed in a task priority order. Tasks with the
    /// same priorities follow a FIFO order.
    TaskPriority,
}

/// A queue of tasks waiting on a particular waitable object.
pub(crate) struct WaitQueue<Traits> {
    /// The waiting tasks, identified by pool index. The tasks must be in a
    /// waiting state.
    waits: TaskList<Traits>,

    order: QueueOrder,
}

impl<Traits> WaitQueue<Traits> {
    /// Construct a `WaitQueue`.
    pub(crate) const fn new(order: QueueOrder) -> Self {
        Self {
            waits: TaskList::new(),
            order,
        }
    }
}

/// A pointer to the transfer buffer of a task blocked in a message-passing
/// operation. Only the object the task waits on knows the pointee type.
#[derive(Clone, Copy)]
pub(crate) struct TransferSlot(NonNull<()>);

// Safety: The pointee is only accessed with CPU Lock held while the owning
//         task is blocked, so there is no concurrent access
unsafe impl Send for TransferSlot {}
unsafe impl Sync for TransferSlot {}

impl TransferSlot {
    pub(crate) fn new<T>(x: &mut T) -> Self {
        Self(NonNull::from(x).cast())
    }

    /// Get the pointee.
    ///
    /// # Safety
    ///
    /// `T` must be the type `self` was created from. The owning task must be
    /// still waiting, and no other reference to the pointee may exist.
    pub(crate) unsafe fn as_mut<'a, T>(self) -> &'a mut T {
        // Safety: Upheld by the caller
        unsafe { &mut *self.0.cast::<T>().as_ptr() }
    }
}

impl fmt::Debug for TransferSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TransferSlot").field(&self.0).finish()
    }
}

/// Additional information included in [`Wait`], specific to waitable object
/// types.
pub(crate) enum WaitPayload<Traits: 'static> {
    Semaphore(&'static Semaphore<Traits>),
    Mutex(&'static Mutex<Traits>),
    Event,
    Sleep,
    Pend,
    Suspend,
    /// A blocked send or receive of a message-passing object.
    Transfer {
        slot: TransferSlot,
        /// Insert at the front of the destination (a jam).
        front: bool,
        owner: &'static ObjectOwner<Traits>,
    },
}

impl<Traits: 'static> Clone for WaitPayload<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: 'static> Copy for WaitPayload<Traits> {}

impl<Traits: 'static> fmt::Debug for WaitPayload<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Semaphore(x) => f.debug_tuple("Semaphore").field(&(*x as *const _)).finish(),
            Self::Mutex(x) => f.debug_tuple("Mutex").field(&(*x as *const _)).finish(),
            Self::Event => f.write_str("Event"),
            Self::Sleep => f.write_str("Sleep"),
            Self::Pend => f.write_str("Pend"),
            Self::Suspend => f.write_str("Suspend"),
            Self::Transfer { slot, front, .. } => f
                .debug_struct("Transfer")
                .field("slot", slot)
                .field("front", front)
                .finish_non_exhaustive(),
        }
    }
}

impl<Traits: KernelTraits> WaitPayload<Traits> {
    /// Undo the side effects the wait had on the waited object. Called when
    /// the wait is aborted by a timeout, after the task was removed from the
    /// wait queue.
    fn on_abort(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        match *self {
            Self::Semaphore(semaphore) => {
                let value = semaphore.value.write(&mut *lock);
                *value += 1;
                semaphore.owner.restore(lock);
            }
            Self::Mutex(mutex) => {
                if let Some(owner) = mutex.owner.get(&*lock) {
                    task::recompute_effective_priority(lock, owner);
                }
            }
            Self::Transfer { owner, .. } => owner.restore(lock),
            Self::Event | Self::Sleep | Self::Pend | Self::Suspend => {}
        }
    }

    /// Get the task that inherits the priority of a task blocked with this
    /// payload.
    pub(crate) fn inheriting_owner(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> Option<usize> {
        match *self {
            Self::Mutex(mutex) => mutex.owner.get(&*lock),
            Self::Semaphore(semaphore) => semaphore.owner.inheriting(lock),
            Self::Transfer { owner, .. } => owner.inheriting(lock),
            Self::Event | Self::Sleep | Self::Pend | Self::Suspend => None,
        }
    }

    /// Get the transfer buffer of a blocked send or receive and whether it's
    /// a jam.
    ///
    /// # Safety
    ///
    /// See [`TransferSlot::as_mut`].
    pub(crate) unsafe fn transfer<'a, T>(&self) -> (&'a mut T, bool) {
        match *self {
            // Safety: Upheld by the caller
            Self::Transfer { slot, front, .. } => (unsafe { slot.as_mut() }, front),
            _ => crate::error::fault::<Traits>(Fault::TaskInvalidState),
        }
    }
}

/// Describes *which queue* a task waits in and *what for*.
pub(crate) struct Wait<Traits: 'static> {
    pub(crate) queue: &'static WaitQueue<Traits>,
    pub(crate) payload: WaitPayload<Traits>,
}

impl<Traits: 'static> Clone for Wait<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: 'static> Copy for Wait<Traits> {}

impl<Traits: 'static> fmt::Debug for Wait<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Wait")
            .field("queue", &(self.queue as *const _))
            .field("payload", &self.payload)
            .finish()
    }
}

/// The wait state of a task.
pub(crate) struct TaskWait<Traits: 'static> {
    /// The ongoing wait of the task. Should be `Some(_)` iff the task is in a
    /// waiting state.
    pub(crate) current_wait: CpuLockCell<Traits, Option<Wait<Traits>>>,

    /// The result of the last wait operation. Set by a wake-upper. Returned by
    /// [`WaitQueue::wait_timeout`].
    pub(crate) wait_result: CpuLockCell<Traits, Result<(), WaitTimeoutError>>,
}

impl<Traits: 'static> Init for TaskWait<Traits> {
    const INIT: Self = Self {
        current_wait: Init::INIT,
        wait_result: CpuLockCell::new(Ok(())),
    };
}

impl<Traits: KernelTraits> fmt::Debug for TaskWait<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskWait")
            .field("current_wait", &self.current_wait)
            .field("wait_result", &self.wait_result)
            .finish()
    }
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    /// Insert the currently running task to `self`, transitioning the task
    /// into the waiting state `st`. Returns when the task is woken up.
    ///
    /// The current context must be waitable (This function doesn't check
    /// that). The caller should use `expect_waitable_context` to do that.
    pub(crate) fn wait(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        st: TaskSt,
        payload: WaitPayload<Traits>,
    ) {
        // Without a timeout, there's nothing that could make the wait fail
        let result = self.wait_inner(lock, st, payload, None);
        debug_assert_eq!(result, Ok(()));
    }

    /// [`Self::wait`] with a timeout.
    ///
    /// Returns `Err(NoTimerSlot)` without waiting if no timer is available.
    pub(crate) fn wait_timeout(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        st: TaskSt,
        payload: WaitPayload<Traits>,
        ticks: u32,
    ) -> Result<(), WaitTimeoutError> {
        self.wait_inner(lock, st, payload, Some(ticks))
    }

    fn wait_inner(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        st: TaskSt,
        payload: WaitPayload<Traits>,
        timeout: Option<u32>,
    ) -> Result<(), WaitTimeoutError> {
        let task = task::running_task::<Traits>();
        let cb = task_cb::<Traits>(task);

        // Arm the timer first so that nothing needs to be undone if the timer
        // pool is exhausted
        let timer = match timeout {
            Some(ticks) => Some(timer::start_task_timer(lock.borrow_mut(), task, ticks)?),
            None => None,
        };

        self.insert(lock.borrow_mut(), task);

        cb.wait
            .current_wait
            .replace(&mut *lock, Some(Wait { queue: self, payload }));
        cb.wait.wait_result.replace(&mut *lock, Ok(()));
        cb.pending_timer.replace(&mut *lock, timer);

        log::trace!("task {task}: wait {st:?} {payload:?}");

        // Transition the task into the waiting state. This statement will
        // complete when the task is woken up.
        task::wait_until_woken_up(lock.borrow_mut(), st);

        // The wake-upper should have unlinked the task
        debug_assert!(cb.wait.current_wait.read(&*lock).is_none());
        debug_assert!(cb.link.read(&*lock).is_none());

        cb.wait.wait_result.get(&*lock)
    }

    /// Insert a task that is not running to `self`, transitioning it into the
    /// waiting state `st`. The task must not be in any queue.
    pub(crate) fn park(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task: usize,
        st: TaskSt,
        payload: WaitPayload<Traits>,
    ) {
        let cb = task_cb::<Traits>(task);
        self.insert(lock.borrow_mut(), task);
        cb.st.replace(&mut *lock, st);
        cb.wait
            .current_wait
            .replace(&mut *lock, Some(Wait { queue: self, payload }));
    }

    /// Link `task` to `self`, respecting `self.order`.
    fn insert(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, task: usize) {
        let insert_at = match self.order {
            QueueOrder::Fifo => {
                // FIFO order - insert at the back
                None
            }
            QueueOrder::TaskPriority => {
                let cur_task_pri = task_cb::<Traits>(task).effective_priority.get(&*lock);
                let mut insert_at = None;
                let mut cursor = self
                    .waits
                    .back(lock.borrow_mut())
                    .or_fault::<Traits>(Fault::List);
                while let Some(next_cursor) = cursor {
                    // Should the new task be inserted at this or an earlier
                    // position?
                    let pri = task_cb::<Traits>(next_cursor).effective_priority.get(&*lock);
                    if pri > cur_task_pri {
                        // If so, update `insert_at`. Continue searching because
                        // there might be a viable position that is even
                        // earlier.
                        insert_at = Some(next_cursor);
                        cursor = self
                            .waits
                            .prev(lock.borrow_mut(), next_cursor)
                            .or_fault::<Traits>(Fault::List);
                    } else {
                        break;
                    }
                }
                insert_at
            }
        };

        self.waits
            .insert_before(lock, task, insert_at)
            .or_fault::<Traits>(Fault::List);
    }

    /// Unlink `task` from `self`.
    fn remove(&self, lock: CpuLockTokenRefMut<'_, Traits>, task: usize) {
        self.waits.remove(lock, task).or_fault::<Traits>(Fault::List);
    }

    /// Reposition `task` after its effective priority has changed.
    pub(crate) fn reorder_task(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, task: usize) {
        if self.order == QueueOrder::TaskPriority {
            self.remove(lock.borrow_mut(), task);
            self.insert(lock, task);
        }
    }

    /// Get the task at the head of the queue.
    pub(crate) fn first_waiter(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> Option<usize> {
        self.waits.front(lock)
    }

    /// Get the number of waiting tasks.
    pub(crate) fn len(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> usize {
        self.waits
            .fold(lock, 0, |count, _, _| count + 1)
            .or_fault::<Traits>(Fault::List)
    }

    /// Wake up up to one waiting task. Returns `true` if it has successfully
    /// woken up a task.
    ///
    /// This method may make a task Ready, but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(crate) fn wake_up_one(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.wake_up_one_with(lock, |_, _, _| {}).is_some()
    }

    /// Wake up up to one waiting task, calling `f` to complete its transfer
    /// before it's made Ready. Returns the woken task.
    ///
    /// This method may make a task Ready, but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(crate) fn wake_up_one_with(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        f: impl FnOnce(CpuLockTokenRefMut<'_, Traits>, usize, &WaitPayload<Traits>),
    ) -> Option<usize> {
        let task = self
            .waits
            .pop_front(lock.borrow_mut())
            .or_fault::<Traits>(Fault::List)?;

        let cb = task_cb::<Traits>(task);
        let Some(wait) = cb.wait.current_wait.get(&*lock) else {
            crate::error::fault::<Traits>(Fault::TaskInvalidState);
        };
        debug_assert!(core::ptr::eq(wait.queue, self));

        f(lock.borrow_mut(), task, &wait.payload);

        log::trace!("task {task}: woken up");
        complete_wait(lock, task, Ok(()));

        Some(task)
    }

    /// Wake up all waiting tasks. Returns the number of woken tasks.
    ///
    /// This method may make a task Ready, but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(crate) fn wake_up_all(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> usize {
        let mut count = 0;
        while self.wake_up_one(lock.borrow_mut()) {
            count += 1;
        }
        count
    }
}

/// Complete the wait of a task that has just been removed from its wait
/// queue, and make it Ready.
fn complete_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: usize,
    result: Result<(), WaitTimeoutError>,
) {
    let cb = task_cb::<Traits>(task);

    cb.wait.current_wait.replace(&mut *lock, None);
    cb.wait.wait_result.replace(&mut *lock, result);

    if let Some(timer) = cb.pending_timer.replace(&mut *lock, None) {
        timer::cancel(lock.borrow_mut(), timer);
    }

    task::make_ready(lock, task);
}

/// End the pend or the suspension of `task`.
pub(crate) fn resume_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: usize,
) {
    let cb = task_cb::<Traits>(task);
    let Some(wait) = cb.wait.current_wait.get(&*lock) else {
        return;
    };
    wait.queue.remove(lock.borrow_mut(), task);

    match wait.payload {
        WaitPayload::Suspend => {
            // The task might have been Ready with the result of an earlier
            // wait, which it hasn't seen yet
            cb.wait.current_wait.replace(&mut *lock, None);
            task::make_ready(lock, task);
        }
        _ => complete_wait(lock, task, Ok(())),
    }
}

/// Abort the wait of `task` because its timer has expired.
pub(crate) fn interrupt_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: usize,
) {
    let cb = task_cb::<Traits>(task);

    // The timer has been consumed by the caller
    cb.pending_timer.replace(&mut *lock, None);

    let Some(wait) = cb.wait.current_wait.replace(&mut *lock, None) else {
        return;
    };

    wait.queue.remove(lock.borrow_mut(), task);
    wait.payload.on_abort(lock.borrow_mut());

    let result = match wait.payload {
        WaitPayload::Sleep => Ok(()),
        _ => Err(WaitTimeoutError::Timeout),
    };
    log::trace!("task {task}: wait ended by timer {result:?}");

    cb.wait.wait_result.replace(&mut *lock, result);
    task::make_ready(lock, task);
}

/// Tracks the owner of a semaphore or a message-passing object and, if
/// enabled, applies priority inheritance to it.
///
/// While enabled, the owner's effective priority is at least that of every
/// task blocked on the object (see [`task::recompute_effective_priority`]).
pub(crate) struct ObjectOwner<Traits> {
    owner: CpuLockCell<Traits, Option<usize>>,
    enabled: bool,
}

impl<Traits> ObjectOwner<Traits> {
    pub(crate) const fn new(enabled: bool) -> Self {
        Self {
            owner: CpuLockCell::new(None),
            enabled,
        }
    }
}

impl<Traits: KernelTraits> ObjectOwner<Traits> {
    /// Get the owner if it inherits the priorities of waiters.
    pub(crate) fn inheriting(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> Option<usize> {
        if !self.enabled {
            return None;
        }
        self.owner.get(&*lock)
    }

    /// Boost the owner to the effective priority of `waiter`, which is about
    /// to block on the object.
    pub(crate) fn boost(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, waiter: usize) {
        match self.inheriting(lock.borrow_mut()) {
            Some(owner) if owner != waiter => {
                let pri = *task_cb::<Traits>(waiter).effective_priority.read(&*lock);
                task::raise_effective_priority(lock, owner, pri);
            }
            _ => {}
        }
    }

    /// Make `task` the owner, moving the inherited priority from the previous
    /// owner to `task`.
    ///
    /// `task` must not be linked to a wait queue.
    pub(crate) fn take(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, task: usize) {
        if !self.enabled {
            return;
        }
        let prev = self.owner.replace(&mut *lock, Some(task));
        if let Some(prev) = prev.filter(|&prev| prev != task) {
            task::recompute_effective_priority(lock.borrow_mut(), prev);
        }
        task::recompute_effective_priority(lock, task);
    }

    /// Restore the priority of the owner and clear the owner.
    pub(crate) fn release(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        if !self.enabled {
            return;
        }
        if let Some(prev) = self.owner.replace(&mut *lock, None) {
            task::recompute_effective_priority(lock, prev);
        }
    }

    /// Recompute the priority of the owner after a waiter has given up.
    pub(crate) fn restore(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        if let Some(owner) = self.inheriting(lock.borrow_mut()) {
            task::recompute_effective_priority(lock, owner);
        }
    }
}
