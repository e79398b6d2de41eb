//! Semaphores
use core::fmt;

use crate::{
    error::{
        Fault, InitObjectError, PollSemaphoreError, QueryError, SignalSemaphoreError,
        WaitSemaphoreError, WaitSemaphoreTimeoutError, WaitTimeoutError,
    },
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    state, task,
    utils::Init,
    wait::{ObjectOwner, QueueOrder, WaitPayload, WaitQueue},
    KernelTraits,
};

/// A counting semaphore.
///
/// The counter goes negative while tasks are waiting. In that case, its
/// magnitude equals the number of waiting tasks.
///
/// Waiters are woken in task priority order unless another order is chosen
/// with [`Self::with_order`].
pub struct Semaphore<Traits: 'static> {
    initialized: CpuLockCell<Traits, bool>,

    pub(crate) value: CpuLockCell<Traits, i32>,

    wait_queue: WaitQueue<Traits>,

    /// The task that took the semaphore last.
    pub(crate) owner: ObjectOwner<Traits>,
}

impl<Traits: 'static> Init for Semaphore<Traits> {
    /// An uninitialized semaphore. [`Semaphore::init`] must be called before
    /// use.
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        initialized: CpuLockCell::new(false),
        value: Init::INIT,
        wait_queue: WaitQueue::new(QueueOrder::TaskPriority),
        owner: ObjectOwner::new(false),
    };
}

impl<Traits: 'static> Semaphore<Traits> {
    /// Construct a semaphore with the initial count `count`.
    pub const fn new(count: i32) -> Self {
        Self::with_order(count, QueueOrder::TaskPriority)
    }

    /// Construct a semaphore whose waiters are woken in the specified order.
    pub const fn with_order(count: i32, order: QueueOrder) -> Self {
        Self {
            initialized: CpuLockCell::new(true),
            value: CpuLockCell::new(count),
            wait_queue: WaitQueue::new(order),
            owner: ObjectOwner::new(false),
        }
    }

    /// Construct a semaphore that tracks the last task that took it. A task
    /// that blocks on the semaphore raises the priority of that task to its
    /// own.
    pub const fn with_owner_tracking(count: i32) -> Self {
        Self {
            initialized: CpuLockCell::new(true),
            value: CpuLockCell::new(count),
            wait_queue: WaitQueue::new(QueueOrder::TaskPriority),
            owner: ObjectOwner::new(true),
        }
    }
}

impl<Traits: KernelTraits> Semaphore<Traits> {
    /// Initialize a semaphore created by [`Init::INIT`].
    ///
    /// Initializing a semaphore twice is a [`Fault::ObjectInit`].
    pub fn init(&'static self, count: i32) -> Result<(), InitObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.initialized.replace(&mut *lock, true) {
            crate::error::fault::<Traits>(Fault::ObjectInit);
        }
        if count < 0 {
            self.initialized.replace(&mut *lock, false);
            return Err(InitObjectError::BadParam);
        }
        self.value.replace(&mut *lock, count);
        Ok(())
    }

    fn expect_init(&self, lock: CpuLockTokenRefMut<'_, Traits>) {
        if !*self.initialized.read(&*lock) {
            crate::error::fault::<Traits>(Fault::ObjectNotInit);
        }
    }

    /// Take one count, blocking until it's available.
    pub fn wait(&'static self) -> Result<(), WaitSemaphoreError> {
        state::expect_waitable_context::<Traits>();
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.expect_init(lock.borrow_mut());

        let task = task::running_task::<Traits>();
        if !self.take_core(lock.borrow_mut()) {
            // The signaller keeps the count for us, so being woken up means
            // the count was taken
            self.owner.boost(lock.borrow_mut(), task);
            self.wait_queue
                .wait(lock.borrow_mut(), task::TaskSt::Blocked, WaitPayload::Semaphore(self));
        }

        self.owner.take(lock.borrow_mut(), task);
        Ok(())
    }

    /// [`Self::wait`] with a timeout. On timeout, the count is given back.
    pub fn wait_timeout(&'static self, ticks: u32) -> Result<(), WaitSemaphoreTimeoutError> {
        state::expect_waitable_context::<Traits>();
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.expect_init(lock.borrow_mut());

        let task = task::running_task::<Traits>();
        if !self.take_core(lock.borrow_mut()) {
            self.owner.boost(lock.borrow_mut(), task);
            let result = self.wait_queue.wait_timeout(
                lock.borrow_mut(),
                task::TaskSt::Blocked,
                WaitPayload::Semaphore(self),
                ticks,
            );

            if let Err(WaitTimeoutError::NoTimerSlot) = result {
                // We never entered the queue
                *self.value.write(&mut *lock) += 1;
                self.owner.restore(lock.borrow_mut());
            }
            result?;
        }

        self.owner.take(lock.borrow_mut(), task);
        Ok(())
    }

    /// Take one count if it's available. Returns `Timeout` otherwise.
    ///
    /// This method may be called from an interrupt context.
    pub fn try_wait(&'static self) -> Result<(), PollSemaphoreError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.expect_init(lock.borrow_mut());

        let value = self.value.write(&mut *lock);
        if *value <= 0 {
            return Err(PollSemaphoreError::Timeout);
        }
        *value -= 1;

        if Traits::is_task_context() {
            self.owner.take(lock.borrow_mut(), task::running_task::<Traits>());
        }
        Ok(())
    }

    /// Return one count, waking up the first waiter if any.
    ///
    /// This method may be called from an interrupt context.
    pub fn signal(&'static self) -> Result<(), SignalSemaphoreError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.expect_init(lock.borrow_mut());

        let value = self.value.write(&mut *lock);
        *value += 1;

        if *value <= 0 {
            // Hand the count over to the first waiter. It's made Ready before
            // it becomes the owner.
            if let Some(task) = self.wait_queue.wake_up_one_with(lock.borrow_mut(), |_, _, _| {}) {
                self.owner.take(lock.borrow_mut(), task);
            }
        } else {
            self.owner.release(lock.borrow_mut());
        }

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Get the current count. A negative value indicates the number of
    /// waiting tasks.
    pub fn value(&'static self) -> Result<i32, QueryError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.expect_init(lock.borrow_mut());
        Ok(*self.value.read(&*lock))
    }

    /// Decrement the counter. Returns `false` if the caller has to wait.
    fn take_core(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        let value = self.value.write(&mut *lock);
        *value -= 1;
        *value >= 0
    }
}

impl<Traits: KernelTraits> fmt::Debug for Semaphore<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("self", &(self as *const _))
            .field("initialized", &self.initialized)
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}
