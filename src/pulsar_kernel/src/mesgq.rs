//! Message queues
use core::fmt;

use crate::{
    error::{
        self, BadContextError, Fault, InitObjectError, QueryError, RecvError, RecvTimeoutError,
        SendError, SendTimeoutError, TryRecvError, TrySendError, WaitTimeoutError,
    },
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    mailbox::Mail,
    state,
    task::{self, task_cb, TaskSt},
    utils::{Init, Ring},
    wait::{ObjectOwner, QueueOrder, TransferSlot, WaitPayload, WaitQueue},
    KernelTraits,
};

/// A bounded FIFO queue of `N` messages of type `T`.
///
/// Each message is stored with the ID of the task that sent it, and the
/// receiver gets both as a [`Mail`].
///
/// Messages are normally appended at the back. A *jam* inserts a message at
/// the front so that it's received next. As with [`Mailbox`], a task that
/// unblocks a task on the other side completes that task's transfer before
/// waking it up.
///
/// [`Mailbox`]: crate::Mailbox
pub struct MessageQueue<Traits: 'static, T: 'static, const N: usize> {
    initialized: CpuLockCell<Traits, bool>,
    ring: CpuLockCell<Traits, Ring<Mail<T>, N>>,
    senders: WaitQueue<Traits>,
    receivers: WaitQueue<Traits>,
    owner: ObjectOwner<Traits>,
}

impl<Traits: 'static, T: 'static, const N: usize> Init for MessageQueue<Traits, T, N> {
    /// An uninitialized message queue. [`MessageQueue::init`] must be called
    /// before use.
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        initialized: CpuLockCell::new(false),
        ring: Init::INIT,
        senders: WaitQueue::new(QueueOrder::Fifo),
        receivers: WaitQueue::new(QueueOrder::Fifo),
        owner: ObjectOwner::new(false),
    };
}

impl<Traits: 'static, T: 'static, const N: usize> MessageQueue<Traits, T, N> {
    const CAPACITY_CHECK: () = assert!(N > 0, "a message queue must have at least one slot");

    /// Construct an empty message queue.
    pub const fn new() -> Self {
        Self::with_options(QueueOrder::Fifo, false)
    }

    /// Construct an empty message queue whose last successful sender or
    /// receiver inherits the priority of tasks blocking on it.
    pub const fn with_priority_inheritance() -> Self {
        Self::with_options(QueueOrder::Fifo, true)
    }

    /// Construct an empty message queue whose waiters are woken in the
    /// specified order.
    pub const fn with_order(order: QueueOrder) -> Self {
        Self::with_options(order, false)
    }

    const fn with_options(order: QueueOrder, inherit: bool) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_CHECK;
        Self {
            initialized: CpuLockCell::new(true),
            ring: CpuLockCell::new(Ring::new()),
            senders: WaitQueue::new(order),
            receivers: WaitQueue::new(order),
            owner: ObjectOwner::new(inherit),
        }
    }

    /// Get the number of messages the queue can hold.
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<Traits: KernelTraits, T: Send + 'static, const N: usize> MessageQueue<Traits, T, N> {
    /// Initialize a message queue created by [`Init::INIT`].
    pub fn init(&'static self) -> Result<(), InitObjectError> {
        if N == 0 {
            return Err(InitObjectError::BadParam);
        }
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.initialized.replace(&mut *lock, true) {
            error::fault::<Traits>(Fault::ObjectInit);
        }
        Ok(())
    }

    /// Enter CPU Lock, checking that the queue is initialized.
    fn lock_cpu(&self) -> Result<CpuLockGuard<Traits>, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        if !*self.initialized.read(&*lock) {
            error::fault::<Traits>(Fault::ObjectNotInit);
        }
        Ok(lock)
    }

    /// Append a message, blocking while the queue is full.
    pub fn send(&'static self, msg: T) -> Result<(), SendError> {
        state::expect_waitable_context::<Traits>();
        let lock = self.lock_cpu()?;
        let result = self.send_blocking(lock, msg, false, None);
        debug_assert!(result.is_ok());
        Ok(())
    }

    /// [`Self::send`] with a timeout.
    pub fn send_timeout(&'static self, msg: T, ticks: u32) -> Result<(), SendTimeoutError> {
        state::expect_waitable_context::<Traits>();
        let lock = self.lock_cpu()?;
        self.send_blocking(lock, msg, false, Some(ticks))?;
        Ok(())
    }

    /// Insert a message at the front, blocking while the queue is full.
    pub fn jam(&'static self, msg: T) -> Result<(), SendError> {
        state::expect_waitable_context::<Traits>();
        let lock = self.lock_cpu()?;
        let result = self.send_blocking(lock, msg, true, None);
        debug_assert!(result.is_ok());
        Ok(())
    }

    /// [`Self::jam`] with a timeout.
    pub fn jam_timeout(&'static self, msg: T, ticks: u32) -> Result<(), SendTimeoutError> {
        state::expect_waitable_context::<Traits>();
        let lock = self.lock_cpu()?;
        self.send_blocking(lock, msg, true, Some(ticks))?;
        Ok(())
    }

    /// Append a message if there's room. Returns `Full` otherwise.
    ///
    /// This method may be called from an interrupt context.
    pub fn try_send(&'static self, msg: T) -> Result<(), TrySendError> {
        self.try_send_inner(msg, false)
    }

    /// Insert a message at the front if there's room. Returns `Full`
    /// otherwise.
    ///
    /// This method may be called from an interrupt context.
    pub fn try_jam(&'static self, msg: T) -> Result<(), TrySendError> {
        self.try_send_inner(msg, true)
    }

    /// Take the message at the front, blocking while the queue is empty.
    pub fn recv(&'static self) -> Result<Mail<T>, RecvError> {
        state::expect_waitable_context::<Traits>();
        let lock = self.lock_cpu()?;
        match self.recv_blocking(lock, None) {
            Ok(msg) => Ok(msg),
            Err(e) => {
                log::error!("wait without a timeout failed: {e:?}");
                error::fault::<Traits>(Fault::TaskInvalidState)
            }
        }
    }

    /// [`Self::recv`] with a timeout.
    pub fn recv_timeout(&'static self, ticks: u32) -> Result<Mail<T>, RecvTimeoutError> {
        state::expect_waitable_context::<Traits>();
        let lock = self.lock_cpu()?;
        Ok(self.recv_blocking(lock, Some(ticks))?)
    }

    /// Take the message at the front if there is one. Returns `Empty`
    /// otherwise.
    ///
    /// This method may be called from an interrupt context.
    pub fn try_recv(&'static self) -> Result<Mail<T>, TryRecvError> {
        let mut lock = self.lock_cpu()?;
        let msg = self
            .recv_core(lock.borrow_mut())
            .ok_or(TryRecvError::Empty)?;
        let task = Traits::is_task_context().then(task::running_task::<Traits>);
        self.finish(lock, task);
        Ok(msg)
    }

    /// Get a copy of the message at the front without taking it.
    pub fn peek(&'static self) -> Result<Mail<T>, TryRecvError>
    where
        T: Clone,
    {
        let lock = self.lock_cpu()?;
        self.ring
            .read(&*lock)
            .front()
            .cloned()
            .ok_or(TryRecvError::Empty)
    }

    /// Get the number of queued messages.
    pub fn len(&'static self) -> Result<usize, QueryError> {
        let lock = self.lock_cpu()?;
        Ok(self.ring.read(&*lock).len())
    }

    /// Get a flag indicating whether the queue is empty.
    pub fn is_empty(&'static self) -> Result<bool, QueryError> {
        Ok(self.len()? == 0)
    }

    fn try_send_inner(&'static self, msg: T, front: bool) -> Result<(), TrySendError> {
        let mut lock = self.lock_cpu()?;
        let task = Traits::is_task_context().then(task::running_task::<Traits>);
        if self.send_core(lock.borrow_mut(), mail::<Traits, _>(task, msg), front).is_err() {
            return Err(TrySendError::Full);
        }
        self.finish(lock, task);
        Ok(())
    }

    fn send_blocking(
        &'static self,
        mut lock: CpuLockGuard<Traits>,
        msg: T,
        front: bool,
        timeout: Option<u32>,
    ) -> Result<(), WaitTimeoutError> {
        let task = task::running_task::<Traits>();

        let msg = mail::<Traits, _>(Some(task), msg);
        if let Err(msg) = self.send_core(lock.borrow_mut(), msg, front) {
            // A receiver moves `buf` into the queue before waking us up
            let mut buf = Some(msg);
            self.owner.boost(lock.borrow_mut(), task);
            let payload = self.transfer_payload(&mut buf, front);
            self.block(lock.borrow_mut(), &self.senders, TaskSt::Sending, payload, timeout)?;
        }

        self.finish(lock, Some(task));
        Ok(())
    }

    fn recv_blocking(
        &'static self,
        mut lock: CpuLockGuard<Traits>,
        timeout: Option<u32>,
    ) -> Result<Mail<T>, WaitTimeoutError> {
        let task = task::running_task::<Traits>();

        let msg = match self.recv_core(lock.borrow_mut()) {
            Some(msg) => msg,
            None => {
                // A sender fills `buf` before waking us up
                let mut buf = None;
                self.owner.boost(lock.borrow_mut(), task);
                let payload = self.transfer_payload(&mut buf, false);
                self.block(lock.borrow_mut(), &self.receivers, TaskSt::Receiving, payload, timeout)?;
                match buf {
                    Some(msg) => msg,
                    None => error::fault::<Traits>(Fault::TaskInvalidState),
                }
            }
        };

        self.finish(lock, Some(task));
        Ok(msg)
    }

    /// Wait in `queue`, undoing the boost if the wait couldn't start.
    fn block(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        queue: &'static WaitQueue<Traits>,
        st: TaskSt,
        payload: WaitPayload<Traits>,
        timeout: Option<u32>,
    ) -> Result<(), WaitTimeoutError> {
        let Some(ticks) = timeout else {
            queue.wait(lock, st, payload);
            return Ok(());
        };

        let result = queue.wait_timeout(lock.borrow_mut(), st, payload, ticks);
        if let Err(WaitTimeoutError::NoTimerSlot) = result {
            self.owner.restore(lock);
        }
        result
    }

    fn transfer_payload(
        &'static self,
        buf: &mut Option<Mail<T>>,
        front: bool,
    ) -> WaitPayload<Traits> {
        WaitPayload::Transfer {
            slot: TransferSlot::new(buf),
            front,
            owner: &self.owner,
        }
    }

    /// Hand `msg` to the first waiting receiver, or queue it. Returns
    /// `Err(msg)` if the queue is full.
    fn send_core(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        msg: Mail<T>,
        front: bool,
    ) -> Result<(), Mail<T>> {
        // Receivers only wait while the queue is empty
        let mut msg = Some(msg);
        self.receivers
            .wake_up_one_with(lock.borrow_mut(), |_, _, payload| {
                // Safety: Receivers create their slots from `Option<Mail<T>>`
                let (buf, _) = unsafe { payload.transfer::<Option<Mail<T>>>() };
                *buf = msg.take();
            });

        match msg {
            None => Ok(()),
            Some(msg) if front => self.ring.write(&mut *lock).push_front(msg),
            Some(msg) => self.ring.write(&mut *lock).push_back(msg),
        }
    }

    /// Dequeue the message at the front and refill the queue from the first
    /// waiting sender.
    fn recv_core(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> Option<Mail<T>> {
        let msg = self.ring.write(&mut *lock).pop_front()?;

        let ring = &self.ring;
        self.senders
            .wake_up_one_with(lock.borrow_mut(), |mut lock, _, payload| {
                // Safety: Senders create their slots from `Option<Mail<T>>`
                let (buf, front) = unsafe { payload.transfer::<Option<Mail<T>>>() };
                let Some(next) = buf.take() else {
                    error::fault::<Traits>(Fault::TaskInvalidState);
                };
                let ring = ring.write(&mut *lock);
                // We have just made room
                let result = if front {
                    ring.push_front(next)
                } else {
                    ring.push_back(next)
                };
                if result.is_err() {
                    error::fault::<Traits>(Fault::General);
                }
            });

        Some(msg)
    }

    /// Take the ownership and release CPU Lock, switching to a woken task if
    /// it outranks the caller.
    fn finish(&'static self, mut lock: CpuLockGuard<Traits>, task: Option<usize>) {
        if let Some(task) = task {
            self.owner.take(lock.borrow_mut(), task);
        }
        task::unlock_cpu_and_check_preemption(lock);
    }
}

/// Stamp `data` with the user-visible ID of `task`.
fn mail<Traits: KernelTraits, T>(task: Option<usize>, data: T) -> Mail<T> {
    Mail {
        data,
        sender: task.map(|task| task_cb::<Traits>(task).attr.id),
    }
}

impl<Traits: KernelTraits, T: fmt::Debug + 'static, const N: usize> fmt::Debug
    for MessageQueue<Traits, T, N>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MessageQueue")
            .field("self", &(self as *const _))
            .field("initialized", &self.initialized)
            .field("ring", &self.ring)
            .finish_non_exhaustive()
    }
}
