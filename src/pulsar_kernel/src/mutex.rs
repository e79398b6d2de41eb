//! Mutexes
//!
//! Mutexes implement the priority inheritance protocol. A task that blocks on
//! a mutex raises the effective priority of the owner to its own, and the
//! boost propagates along the chain of owners if the owner is itself blocked
//! on another mutex. When a mutex changes hands, the effective priorities of
//! both parties are recomputed from the mutexes they still hold.
use core::fmt;

use crate::{
    error::{
        self, Fault, InitObjectError, LockMutexError, LockMutexTimeoutError, QueryError,
        TryLockMutexError, UnlockMutexError, WaitTimeoutError,
    },
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    state,
    task::{self, task_cb, TaskId, TaskSt},
    utils::Init,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    KernelTraits,
};

/// A mutual exclusion lock with priority inheritance.
pub struct Mutex<Traits: 'static> {
    initialized: CpuLockCell<Traits, bool>,

    /// The pool index of the task that currently owns the mutex lock.
    pub(crate) owner: CpuLockCell<Traits, Option<usize>>,

    /// The tasks waiting for the mutex, sorted by effective priority.
    pub(crate) wait_queue: WaitQueue<Traits>,

    /// The next element in the singly-linked list headed by
    /// `TaskCb::last_mutex_held`, containing all mutexes currently held by the
    /// task.
    pub(crate) prev_mutex_held: CpuLockCell<Traits, Option<&'static Self>>,
}

impl<Traits: 'static> Init for Mutex<Traits> {
    /// An uninitialized mutex. [`Mutex::init`] must be called before use.
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        initialized: CpuLockCell::new(false),
        owner: Init::INIT,
        wait_queue: WaitQueue::new(QueueOrder::TaskPriority),
        prev_mutex_held: Init::INIT,
    };
}

impl<Traits: 'static> Mutex<Traits> {
    /// Construct an unlocked mutex.
    pub const fn new() -> Self {
        Self {
            initialized: CpuLockCell::new(true),
            owner: Init::INIT,
            wait_queue: WaitQueue::new(QueueOrder::TaskPriority),
            prev_mutex_held: Init::INIT,
        }
    }
}

impl<Traits: 'static> Default for Mutex<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> Mutex<Traits> {
    /// Initialize a mutex created by [`Init::INIT`].
    ///
    /// Initializing a mutex twice is a [`Fault::ObjectInit`].
    pub fn init(&'static self) -> Result<(), InitObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.initialized.replace(&mut *lock, true) {
            error::fault::<Traits>(Fault::ObjectInit);
        }
        Ok(())
    }

    fn expect_init(&self, lock: CpuLockTokenRefMut<'_, Traits>) {
        if !*self.initialized.read(&*lock) {
            error::fault::<Traits>(Fault::ObjectNotInit);
        }
    }

    /// Check the common preconditions of the locking operations and get the
    /// running task.
    fn precheck(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Result<usize, LockMutexError> {
        self.expect_init(lock.borrow_mut());
        let task = task::running_task::<Traits>();
        if self.owner.get(&*lock) == Some(task) {
            return Err(LockMutexError::WouldDeadlock);
        }
        Ok(task)
    }

    /// Acquire the mutex, blocking until it's available.
    ///
    /// Locking a mutex that the calling task already owns returns
    /// `WouldDeadlock`.
    pub fn lock(&'static self) -> Result<(), LockMutexError> {
        state::expect_waitable_context::<Traits>();
        let mut lock = klock::lock_cpu::<Traits>()?;
        let task = self.precheck(lock.borrow_mut())?;

        if !self.poll_core(lock.borrow_mut(), task) {
            self.boost_owner(lock.borrow_mut(), task);

            // The unlocker gives us the ownership before waking us up
            self.wait_queue
                .wait(lock.borrow_mut(), TaskSt::Blocked, WaitPayload::Mutex(self));
        }

        debug_assert_eq!(self.owner.get(&*lock), Some(task));
        Ok(())
    }

    /// [`Self::lock`] with a timeout.
    pub fn lock_timeout(&'static self, ticks: u32) -> Result<(), LockMutexTimeoutError> {
        state::expect_waitable_context::<Traits>();
        let mut lock = klock::lock_cpu::<Traits>()?;
        let task = self.precheck(lock.borrow_mut()).map_err(|e| match e {
            LockMutexError::BadContext => LockMutexTimeoutError::BadContext,
            LockMutexError::WouldDeadlock => LockMutexTimeoutError::WouldDeadlock,
        })?;

        if !self.poll_core(lock.borrow_mut(), task) {
            self.boost_owner(lock.borrow_mut(), task);

            let result = self.wait_queue.wait_timeout(
                lock.borrow_mut(),
                TaskSt::Blocked,
                WaitPayload::Mutex(self),
                ticks,
            );

            if let Err(WaitTimeoutError::NoTimerSlot) = result {
                // Undo the boost
                if let Some(owner) = self.owner.get(&*lock) {
                    task::recompute_effective_priority(lock.borrow_mut(), owner);
                }
            }
            result?;
        }

        Ok(())
    }

    /// Acquire the mutex if it's available. Returns `Timeout` otherwise.
    pub fn try_lock(&'static self) -> Result<(), TryLockMutexError> {
        state::expect_task_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let task = self.precheck(lock.borrow_mut()).map_err(|e| match e {
            LockMutexError::BadContext => TryLockMutexError::BadContext,
            LockMutexError::WouldDeadlock => TryLockMutexError::WouldDeadlock,
        })?;

        if self.poll_core(lock.borrow_mut(), task) {
            Ok(())
        } else {
            Err(TryLockMutexError::Timeout)
        }
    }

    /// Release the mutex. If there are waiters, the ownership passes directly
    /// to the first one.
    ///
    /// Mutexes can be unlocked in any order. Unlocking a mutex owned by
    /// another task is a [`Fault::UnlockNotOwner`].
    pub fn unlock(&'static self) -> Result<(), UnlockMutexError> {
        state::expect_task_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.expect_init(lock.borrow_mut());

        let task = task::running_task::<Traits>();
        match self.owner.get(&*lock) {
            None => return Err(UnlockMutexError::NotLocked),
            Some(owner) if owner != task => {
                log::error!("task {task} unlocked a mutex owned by task {owner}");
                error::fault::<Traits>(Fault::UnlockNotOwner);
            }
            Some(_) => {}
        }

        self.unlink_from_held_list(lock.borrow_mut(), task);

        // Wake up the next waiter
        let next_task = self.unlock_core(lock.borrow_mut());

        // Lower the task's effective priority. This may cause preemption.
        task::recompute_effective_priority(lock.borrow_mut(), task);

        if let Some(next_task) = next_task {
            // The remaining waiters now boost the new owner
            task::recompute_effective_priority(lock.borrow_mut(), next_task);
        }

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Get a flag indicating whether the mutex is locked.
    pub fn is_locked(&'static self) -> Result<bool, QueryError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.expect_init(lock.borrow_mut());
        Ok(self.owner.get(&*lock).is_some())
    }

    /// Get the ID of the owning task.
    pub fn owner(&'static self) -> Result<Option<TaskId>, QueryError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.expect_init(lock.borrow_mut());
        Ok(self
            .owner
            .get(&*lock)
            .map(|task| task_cb::<Traits>(task).attr.id))
    }

    /// Acquire the mutex if it's unlocked. Returns `false` if the caller has
    /// to wait.
    fn poll_core(&'static self, lock: CpuLockTokenRefMut<'_, Traits>, task: usize) -> bool {
        if self.owner.get(&*lock).is_some() {
            false
        } else {
            self.lock_core(lock, task);
            true
        }
    }

    /// Give the ownership of the mutex to `task`.
    fn lock_core(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, task: usize) {
        self.owner.replace(&mut *lock, Some(task));

        // Push `self` to the list of the mutexes held by the task.
        let prev_mutex_held = task_cb::<Traits>(task)
            .last_mutex_held
            .replace(&mut *lock, Some(self));
        self.prev_mutex_held.replace(&mut *lock, prev_mutex_held);
    }

    /// Pass the ownership to the first waiter, or release the mutex if there
    /// is none. Returns the new owner.
    ///
    /// This method may make a task Ready, but doesn't yield the processor.
    fn unlock_core(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> Option<usize> {
        let next_task = self
            .wait_queue
            .wake_up_one_with(lock.borrow_mut(), |lock, next_task, _| {
                self.lock_core(lock, next_task)
            });

        if next_task.is_none() {
            // There's no one waiting
            self.owner.replace(&mut *lock, None);
        } else {
            log::trace!("mutex {:p}: handed off to task {:?}", self, next_task);
        }

        next_task
    }

    /// Remove `self` from the list of the mutexes held by `task`.
    fn unlink_from_held_list(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, task: usize) {
        let cb = task_cb::<Traits>(task);
        let prev = self.prev_mutex_held.replace(&mut *lock, None);

        match cb.last_mutex_held.get(&*lock) {
            Some(head) if core::ptr::eq(head, self) => {
                cb.last_mutex_held.replace(&mut *lock, prev);
                return;
            }
            _ => {}
        }

        let mut maybe_mutex = cb.last_mutex_held.get(&*lock);
        while let Some(mutex) = maybe_mutex {
            let next = mutex.prev_mutex_held.get(&*lock);
            if matches!(next, Some(next) if core::ptr::eq(next, self)) {
                mutex.prev_mutex_held.replace(&mut *lock, prev);
                return;
            }
            maybe_mutex = next;
        }

        // The owner must be holding the mutex
        error::fault::<Traits>(Fault::List);
    }

    /// Raise the owner's priority to that of `task`, which is about to wait.
    fn boost_owner(&'static self, lock: CpuLockTokenRefMut<'_, Traits>, task: usize) {
        if let Some(owner) = self.owner.get(&*lock) {
            let pri = *task_cb::<Traits>(task).effective_priority.read(&*lock);
            task::raise_effective_priority(lock, owner, pri);
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for Mutex<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("self", &(self as *const _))
            .field("initialized", &self.initialized)
            .field("owner", &self.owner)
            .field(
                "prev_mutex_held",
                // Print the address only, or every held mutex would be
                // printed again through the chain
                &self
                    .prev_mutex_held
                    .debug_map(|x| x.map(|x| x as *const Self)),
            )
            .finish_non_exhaustive()
    }
}
