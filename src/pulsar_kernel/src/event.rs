//! Events
use core::fmt;

use crate::{
    error::{Fault, InitObjectError, QueryError, WaitEventError, WaitEventTimeoutError, WakeEventError},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    state,
    task::{self, TaskSt},
    utils::Init,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    KernelTraits,
};

/// A condition that tasks can sleep on until another task or an interrupt
/// handler wakes them up. Events carry no state, so a wake-up with no
/// sleeping task has no effect.
pub struct Event<Traits: 'static> {
    initialized: CpuLockCell<Traits, bool>,
    wait_queue: WaitQueue<Traits>,
}

impl<Traits: 'static> Init for Event<Traits> {
    /// An uninitialized event. [`Event::init`] must be called before use.
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        initialized: CpuLockCell::new(false),
        wait_queue: WaitQueue::new(QueueOrder::Fifo),
    };
}

impl<Traits: 'static> Event<Traits> {
    /// Construct an event whose sleepers are woken in FIFO order.
    pub const fn new() -> Self {
        Self::with_order(QueueOrder::Fifo)
    }

    /// Construct an event whose sleepers are woken in the specified order.
    pub const fn with_order(order: QueueOrder) -> Self {
        Self {
            initialized: CpuLockCell::new(true),
            wait_queue: WaitQueue::new(order),
        }
    }
}

impl<Traits: 'static> Default for Event<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> Event<Traits> {
    /// Initialize an event created by [`Init::INIT`].
    pub fn init(&'static self) -> Result<(), InitObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.initialized.replace(&mut *lock, true) {
            crate::error::fault::<Traits>(Fault::ObjectInit);
        }
        Ok(())
    }

    fn expect_init(&self, lock: CpuLockTokenRefMut<'_, Traits>) {
        if !*self.initialized.read(&*lock) {
            crate::error::fault::<Traits>(Fault::ObjectNotInit);
        }
    }

    /// Sleep until woken up by [`Self::wake`] or [`Self::wake_all`].
    pub fn sleep(&'static self) -> Result<(), WaitEventError> {
        state::expect_waitable_context::<Traits>();
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.expect_init(lock.borrow_mut());

        self.wait_queue
            .wait(lock.borrow_mut(), TaskSt::Sleeping, WaitPayload::Event);
        Ok(())
    }

    /// [`Self::sleep`] with a timeout.
    pub fn sleep_timeout(&'static self, ticks: u32) -> Result<(), WaitEventTimeoutError> {
        state::expect_waitable_context::<Traits>();
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.expect_init(lock.borrow_mut());

        self.wait_queue
            .wait_timeout(lock.borrow_mut(), TaskSt::Sleeping, WaitPayload::Event, ticks)?;
        Ok(())
    }

    /// Wake up the first sleeping task. Returns `true` if there was one.
    ///
    /// This method may be called from an interrupt context.
    pub fn wake(&'static self) -> Result<bool, WakeEventError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.expect_init(lock.borrow_mut());

        let woken = self.wait_queue.wake_up_one(lock.borrow_mut());
        task::unlock_cpu_and_check_preemption(lock);
        Ok(woken)
    }

    /// Wake up all sleeping tasks. Returns the number of woken tasks.
    ///
    /// This method may be called from an interrupt context.
    pub fn wake_all(&'static self) -> Result<usize, WakeEventError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.expect_init(lock.borrow_mut());

        let count = self.wait_queue.wake_up_all(lock.borrow_mut());
        if count > 0 {
            log::trace!("event {:p}: woke up {count} tasks", self);
        }
        task::unlock_cpu_and_check_preemption(lock);
        Ok(count)
    }

    /// Get the number of sleeping tasks.
    pub fn waiters(&'static self) -> Result<usize, QueryError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.expect_init(lock.borrow_mut());
        Ok(self.wait_queue.len(lock.borrow_mut()))
    }
}

impl<Traits: KernelTraits> fmt::Debug for Event<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Event")
            .field("self", &(self as *const _))
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}
