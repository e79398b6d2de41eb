//! Mailboxes
use core::fmt;

use crate::{
    error::{
        self, Fault, InitObjectError, QueryError, RecvError, RecvTimeoutError, SendError,
        SendTimeoutError, SetRecipientError, TryRecvError, TrySendError, WaitTimeoutError,
    },
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    state,
    task::{self, task_cb, TaskId, TaskSt},
    utils::Init,
    wait::{ObjectOwner, QueueOrder, TransferSlot, WaitPayload, WaitQueue},
    KernelTraits,
};

/// A message delivered through a [`Mailbox`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mail<T> {
    pub data: T,
    /// The ID of the sending task. `None` if the message was posted by an
    /// interrupt handler.
    pub sender: Option<TaskId>,
}

/// A single-slot mailbox.
///
/// Blocked senders and receivers are served in FIFO order. When a transfer
/// unblocks a task on the other side, the transfer of that task is completed
/// before it's woken up, so a woken task never finds the slot taken by
/// someone else.
pub struct Mailbox<Traits: 'static, T: 'static> {
    initialized: CpuLockCell<Traits, bool>,

    slot: CpuLockCell<Traits, Option<Mail<T>>>,

    /// The pool index of the only task allowed to receive.
    recipient: CpuLockCell<Traits, Option<usize>>,

    last_sender: CpuLockCell<Traits, Option<TaskId>>,

    /// Tasks waiting for the slot to become empty.
    senders: WaitQueue<Traits>,

    /// Tasks waiting for the slot to become full.
    receivers: WaitQueue<Traits>,

    owner: ObjectOwner<Traits>,
}

impl<Traits: 'static, T: 'static> Init for Mailbox<Traits, T> {
    /// An uninitialized mailbox. [`Mailbox::init`] must be called before use.
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        initialized: CpuLockCell::new(false),
        slot: Init::INIT,
        recipient: Init::INIT,
        last_sender: Init::INIT,
        senders: WaitQueue::new(QueueOrder::Fifo),
        receivers: WaitQueue::new(QueueOrder::Fifo),
        owner: ObjectOwner::new(false),
    };
}

impl<Traits: 'static, T: 'static> Mailbox<Traits, T> {
    /// Construct an empty mailbox.
    pub const fn new() -> Self {
        Self::with_options(QueueOrder::Fifo, false)
    }

    /// Construct an empty mailbox whose last successful sender or receiver
    /// inherits the priority of tasks blocking on it.
    pub const fn with_priority_inheritance() -> Self {
        Self::with_options(QueueOrder::Fifo, true)
    }

    /// Construct an empty mailbox whose waiters are woken in the specified
    /// order.
    pub const fn with_order(order: QueueOrder) -> Self {
        Self::with_options(order, false)
    }

    const fn with_options(order: QueueOrder, inherit: bool) -> Self {
        Self {
            initialized: CpuLockCell::new(true),
            slot: Init::INIT,
            recipient: Init::INIT,
            last_sender: Init::INIT,
            senders: WaitQueue::new(order),
            receivers: WaitQueue::new(order),
            owner: ObjectOwner::new(inherit),
        }
    }
}

impl<Traits: KernelTraits, T: Copy + Send + 'static> Mailbox<Traits, T> {
    /// Initialize a mailbox created by [`Init::INIT`].
    pub fn init(&'static self) -> Result<(), InitObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.initialized.replace(&mut *lock, true) {
            error::fault::<Traits>(Fault::ObjectInit);
        }
        Ok(())
    }

    /// Enter CPU Lock, checking that the mailbox is initialized.
    fn lock_cpu(&self) -> Result<CpuLockGuard<Traits>, error::BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        if !*self.initialized.read(&*lock) {
            error::fault::<Traits>(Fault::ObjectNotInit);
        }
        Ok(lock)
    }

    /// Get the calling task if it's allowed to send.
    fn sender(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> Result<Option<usize>, SendError> {
        if !Traits::is_task_context() {
            return Ok(None);
        }
        let task = task::running_task::<Traits>();
        if *self.recipient.read(&*lock) == Some(task) {
            return Err(SendError::SendToSelf);
        }
        Ok(Some(task))
    }

    /// Get the calling task if it's allowed to receive.
    fn receiver(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> Result<Option<usize>, RecvError> {
        let task = Traits::is_task_context().then(task::running_task::<Traits>);
        match *self.recipient.read(&*lock) {
            Some(recipient) if Some(recipient) != task => Err(RecvError::NotRecipient),
            _ => Ok(task),
        }
    }

    fn mail(&self, task: Option<usize>, data: T) -> Mail<T> {
        Mail {
            data,
            sender: task.map(|task| task_cb::<Traits>(task).attr.id),
        }
    }

    /// Deposit a message, blocking while the slot is full.
    pub fn post(&'static self, data: T) -> Result<(), SendError> {
        state::expect_waitable_context::<Traits>();
        let mut lock = self.lock_cpu()?;
        let task = self.sender(lock.borrow_mut())?;
        let mail = self.mail(task, data);

        if let Err(mail) = self.post_core(lock.borrow_mut(), mail) {
            let mut buf = Some(mail);
            let task = task::running_task::<Traits>();
            self.owner.boost(lock.borrow_mut(), task);

            // A receiver moves `buf` into the slot before waking us up
            self.senders
                .wait(lock.borrow_mut(), TaskSt::Sending, self.transfer_payload(&mut buf));
        }

        self.finish(lock, task);
        Ok(())
    }

    /// [`Self::post`] with a timeout.
    pub fn post_timeout(&'static self, data: T, ticks: u32) -> Result<(), SendTimeoutError> {
        state::expect_waitable_context::<Traits>();
        let mut lock = self.lock_cpu()?;
        let task = self.sender(lock.borrow_mut()).map_err(|e| match e {
            SendError::BadContext => SendTimeoutError::BadContext,
            SendError::SendToSelf => SendTimeoutError::SendToSelf,
        })?;
        let mail = self.mail(task, data);

        if let Err(mail) = self.post_core(lock.borrow_mut(), mail) {
            let mut buf = Some(mail);
            let task = task::running_task::<Traits>();
            self.owner.boost(lock.borrow_mut(), task);

            let result = self.senders.wait_timeout(
                lock.borrow_mut(),
                TaskSt::Sending,
                self.transfer_payload(&mut buf),
                ticks,
            );
            if let Err(WaitTimeoutError::NoTimerSlot) = result {
                self.owner.restore(lock.borrow_mut());
            }
            result?;
        }

        self.finish(lock, task);
        Ok(())
    }

    /// Deposit a message if the slot is empty. Returns `Full` otherwise.
    ///
    /// This method may be called from an interrupt context.
    pub fn try_post(&'static self, data: T) -> Result<(), TrySendError> {
        let mut lock = self.lock_cpu()?;
        let task = self.sender(lock.borrow_mut()).map_err(|e| match e {
            SendError::BadContext => TrySendError::BadContext,
            SendError::SendToSelf => TrySendError::SendToSelf,
        })?;
        let mail = self.mail(task, data);

        if self.post_core(lock.borrow_mut(), mail).is_err() {
            return Err(TrySendError::Full);
        }

        self.finish(lock, task);
        Ok(())
    }

    /// Deposit a message, replacing the current one if the slot is full.
    ///
    /// This method may be called from an interrupt context.
    pub fn post_overwrite(&'static self, data: T) -> Result<(), TrySendError> {
        let mut lock = self.lock_cpu()?;
        let task = self.sender(lock.borrow_mut()).map_err(|e| match e {
            SendError::BadContext => TrySendError::BadContext,
            SendError::SendToSelf => TrySendError::SendToSelf,
        })?;
        let mail = self.mail(task, data);

        if let Err(mail) = self.post_core(lock.borrow_mut(), mail) {
            self.slot.replace(&mut *lock, Some(mail));
            self.last_sender.replace(&mut *lock, mail.sender);
        }

        self.finish(lock, task);
        Ok(())
    }

    /// Take the message, blocking while the slot is empty.
    pub fn pend(&'static self) -> Result<Mail<T>, RecvError> {
        state::expect_waitable_context::<Traits>();
        let mut lock = self.lock_cpu()?;
        let task = self.receiver(lock.borrow_mut())?;

        let mail = match self.pend_core(lock.borrow_mut()) {
            Some(mail) => mail,
            None => {
                let mut buf = None;
                let task = task::running_task::<Traits>();
                self.owner.boost(lock.borrow_mut(), task);

                // A sender fills `buf` before waking us up
                self.receivers
                    .wait(lock.borrow_mut(), TaskSt::Receiving, self.transfer_payload(&mut buf));
                self.expect_delivered(buf)
            }
        };

        self.finish(lock, task);
        Ok(mail)
    }

    /// [`Self::pend`] with a timeout.
    pub fn pend_timeout(&'static self, ticks: u32) -> Result<Mail<T>, RecvTimeoutError> {
        state::expect_waitable_context::<Traits>();
        let mut lock = self.lock_cpu()?;
        let task = self.receiver(lock.borrow_mut()).map_err(|e| match e {
            RecvError::BadContext => RecvTimeoutError::BadContext,
            RecvError::NotRecipient => RecvTimeoutError::NotRecipient,
        })?;

        let mail = match self.pend_core(lock.borrow_mut()) {
            Some(mail) => mail,
            None => {
                let mut buf = None;
                let task = task::running_task::<Traits>();
                self.owner.boost(lock.borrow_mut(), task);

                let result = self.receivers.wait_timeout(
                    lock.borrow_mut(),
                    TaskSt::Receiving,
                    self.transfer_payload(&mut buf),
                    ticks,
                );
                if let Err(WaitTimeoutError::NoTimerSlot) = result {
                    self.owner.restore(lock.borrow_mut());
                }
                result?;
                self.expect_delivered(buf)
            }
        };

        self.finish(lock, task);
        Ok(mail)
    }

    /// Take the message if there is one. Returns `Empty` otherwise.
    ///
    /// This method may be called from an interrupt context.
    pub fn try_pend(&'static self) -> Result<Mail<T>, TryRecvError> {
        let mut lock = self.lock_cpu()?;
        let task = self.receiver(lock.borrow_mut()).map_err(|e| match e {
            RecvError::BadContext => TryRecvError::BadContext,
            RecvError::NotRecipient => TryRecvError::NotRecipient,
        })?;

        let mail = self
            .pend_core(lock.borrow_mut())
            .ok_or(TryRecvError::Empty)?;

        self.finish(lock, task);
        Ok(mail)
    }

    /// Get a copy of the message without taking it.
    pub fn peek(&'static self) -> Result<Mail<T>, TryRecvError> {
        let lock = self.lock_cpu()?;
        self.slot.get(&*lock).ok_or(TryRecvError::Empty)
    }

    /// Restrict receiving to the task `id`. `None` lifts the restriction.
    pub fn set_recipient(&'static self, id: Option<TaskId>) -> Result<(), SetRecipientError> {
        let task = id.map(task::index_of::<Traits>).transpose()?;
        let mut lock = self.lock_cpu()?;
        self.recipient.replace(&mut *lock, task);
        Ok(())
    }

    /// Get a flag indicating whether the slot holds a message.
    pub fn is_full(&'static self) -> Result<bool, QueryError> {
        let lock = self.lock_cpu()?;
        Ok(self.slot.read(&*lock).is_some())
    }

    /// Get the sender of the last message deposited in the slot.
    pub fn last_sender(&'static self) -> Result<Option<TaskId>, QueryError> {
        let lock = self.lock_cpu()?;
        Ok(self.last_sender.get(&*lock))
    }

    /// Get the number of messages the mailbox can hold.
    pub const fn capacity(&self) -> usize {
        1
    }

    fn transfer_payload(&'static self, buf: &mut Option<Mail<T>>) -> WaitPayload<Traits> {
        WaitPayload::Transfer {
            slot: TransferSlot::new(buf),
            front: false,
            owner: &self.owner,
        }
    }

    fn expect_delivered(&self, buf: Option<Mail<T>>) -> Mail<T> {
        match buf {
            Some(mail) => mail,
            None => error::fault::<Traits>(Fault::TaskInvalidState),
        }
    }

    /// Hand `mail` to the first waiting receiver, or put it in the slot.
    /// Returns `Err(mail)` if the slot is full.
    fn post_core(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        mail: Mail<T>,
    ) -> Result<(), Mail<T>> {
        let delivered = self
            .receivers
            .wake_up_one_with(lock.borrow_mut(), |_, _, payload| {
                // Safety: Receivers create their slots from `Option<Mail<T>>`
                let (buf, _) = unsafe { payload.transfer::<Option<Mail<T>>>() };
                *buf = Some(mail);
            });

        if delivered.is_none() {
            let slot = self.slot.write(&mut *lock);
            if slot.is_some() {
                return Err(mail);
            }
            *slot = Some(mail);
        }

        self.last_sender.replace(&mut *lock, mail.sender);
        Ok(())
    }

    /// Take the message from the slot and refill it from the first waiting
    /// sender.
    fn pend_core(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> Option<Mail<T>> {
        let mail = self.slot.replace(&mut *lock, None)?;

        let slot = &self.slot;
        let last_sender = &self.last_sender;
        self.senders
            .wake_up_one_with(lock.borrow_mut(), |mut lock, _, payload| {
                // Safety: Senders create their slots from `Option<Mail<T>>`
                let (buf, _) = unsafe { payload.transfer::<Option<Mail<T>>>() };
                let next = buf.take();
                last_sender.replace(&mut *lock, next.and_then(|mail| mail.sender));
                slot.replace(&mut *lock, next);
            });

        Some(mail)
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

impl<Traits: KernelTraits, T: fmt::Debug + 'static> fmt::Debug for Mailbox<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("self", &(self as *const _))
            .field("initialized", &self.initialized)
            .field("slot", &self.slot)
            .field("recipient", &self.recipient)
            .field("last_sender", &self.last_sender)
            .finish_non_exhaustive()
    }
}
