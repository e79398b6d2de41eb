//! Pipes
//!
//! A pipe is a byte stream between tasks. Readers block while the pipe is
//! empty and writers block while it's full. Both sides make partial progress:
//! a read returns whatever is available up to the size of the destination,
//! and a write stores as much as fits.
use core::fmt;

use crate::{
    error::{
        self, BadContextError, Fault, InitObjectError, QueryError, RecvError, RecvTimeoutError,
        SendError, SendTimeoutError, TryRecvError, TrySendError, WaitTimeoutError,
    },
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    state,
    task::{self, TaskSt},
    utils::{Init, Ring},
    wait::{ObjectOwner, QueueOrder, TransferSlot, WaitPayload, WaitQueue},
    KernelTraits,
};

/// The destination of a blocked read.
struct ReadReq<'a> {
    dst: &'a mut [u8],
    /// The number of bytes delivered by writers.
    len: usize,
}

/// The source of a blocked write.
struct WriteReq<'a> {
    src: &'a [u8],
    /// The number of bytes taken by readers.
    len: usize,
}

/// A byte ring of `N` bytes with separate reader and writer wait queues.
pub struct Pipe<Traits: 'static, const N: usize = 32> {
    initialized: CpuLockCell<Traits, bool>,
    ring: CpuLockCell<Traits, Ring<u8, N>>,
    writers: WaitQueue<Traits>,
    readers: WaitQueue<Traits>,
    owner: ObjectOwner<Traits>,
}

impl<Traits: 'static, const N: usize> Init for Pipe<Traits, N> {
    /// An uninitialized pipe. [`Pipe::init`] must be called before use.
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        initialized: CpuLockCell::new(false),
        ring: Init::INIT,
        writers: WaitQueue::new(QueueOrder::Fifo),
        readers: WaitQueue::new(QueueOrder::Fifo),
        owner: ObjectOwner::new(false),
    };
}

impl<Traits: 'static, const N: usize> Pipe<Traits, N> {
    const CAPACITY_CHECK: () = assert!(N > 0, "a pipe must hold at least one byte");

    /// Construct an empty pipe.
    pub const fn new() -> Self {
        Self::with_options(QueueOrder::Fifo, false)
    }

    /// Construct an empty pipe whose last reader or writer inherits the
    /// priority of tasks blocking on it.
    pub const fn with_priority_inheritance() -> Self {
        Self::with_options(QueueOrder::Fifo, true)
    }

    /// Construct an empty pipe whose waiters are woken in the specified order.
    pub const fn with_order(order: QueueOrder) -> Self {
        Self::with_options(order, false)
    }

    const fn with_options(order: QueueOrder, inherit: bool) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_CHECK;
        Self {
            initialized: CpuLockCell::new(true),
            ring: CpuLockCell::new(Ring::new()),
            writers: WaitQueue::new(order),
            readers: WaitQueue::new(order),
            owner: ObjectOwner::new(inherit),
        }
    }

    /// Get the number of bytes the pipe can hold.
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<Traits: 'static> Default for Pipe<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits, const N: usize> Pipe<Traits, N> {
    /// Initialize a pipe created by [`Init::INIT`].
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

    fn lock_cpu(&self) -> Result<CpuLockGuard<Traits>, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        if !*self.initialized.read(&*lock) {
            error::fault::<Traits>(Fault::ObjectNotInit);
        }
        Ok(lock)
    }

    /// Read up to `dst.len()` bytes, blocking while the pipe is empty.
    /// Returns the number of bytes read.
    pub fn read(&'static self, dst: &mut [u8]) -> Result<usize, RecvError> {
        state::expect_waitable_context::<Traits>();
        let lock = self.lock_cpu()?;
        match self.read_blocking(lock, dst, None) {
            Ok(len) => Ok(len),
            Err(e) => {
                log::error!("wait without a timeout failed: {e:?}");
                error::fault::<Traits>(Fault::TaskInvalidState)
            }
        }
    }

    /// [`Self::read`] with a timeout.
    pub fn read_timeout(&'static self, dst: &mut [u8], ticks: u32) -> Result<usize, RecvTimeoutError> {
        state::expect_waitable_context::<Traits>();
        let lock = self.lock_cpu()?;
        Ok(self.read_blocking(lock, dst, Some(ticks))?)
    }

    /// Read up to `dst.len()` bytes if there are any. Returns `Empty`
    /// otherwise.
    ///
    /// This method may be called from an interrupt context.
    pub fn try_read(&'static self, dst: &mut [u8]) -> Result<usize, TryRecvError> {
        let mut lock = self.lock_cpu()?;
        if dst.is_empty() {
            return Ok(0);
        }
        let len = self.read_core(lock.borrow_mut(), dst);
        if len == 0 {
            return Err(TryRecvError::Empty);
        }
        let task = Traits::is_task_context().then(task::running_task::<Traits>);
        self.finish(lock, task);
        Ok(len)
    }

    /// Write as many bytes of `src` as fit, blocking while the pipe is full.
    /// Returns the number of bytes written.
    pub fn write(&'static self, src: &[u8]) -> Result<usize, SendError> {
        state::expect_waitable_context::<Traits>();
        let lock = self.lock_cpu()?;
        match self.write_blocking(lock, src, None) {
            Ok(len) => Ok(len),
            Err(e) => {
                log::error!("wait without a timeout failed: {e:?}");
                error::fault::<Traits>(Fault::TaskInvalidState)
            }
        }
    }

    /// [`Self::write`] with a timeout.
    pub fn write_timeout(&'static self, src: &[u8], ticks: u32) -> Result<usize, SendTimeoutError> {
        state::expect_waitable_context::<Traits>();
        let lock = self.lock_cpu()?;
        Ok(self.write_blocking(lock, src, Some(ticks))?)
    }

    /// Write as many bytes of `src` as fit. Returns `Full` if none do.
    ///
    /// This method may be called from an interrupt context.
    pub fn try_write(&'static self, src: &[u8]) -> Result<usize, TrySendError> {
        let mut lock = self.lock_cpu()?;
        if src.is_empty() {
            return Ok(0);
        }
        let len = self.write_core(lock.borrow_mut(), src);
        if len == 0 {
            return Err(TrySendError::Full);
        }
        let task = Traits::is_task_context().then(task::running_task::<Traits>);
        self.finish(lock, task);
        Ok(len)
    }

    /// Get the number of buffered bytes.
    pub fn len(&'static self) -> Result<usize, QueryError> {
        let lock = self.lock_cpu()?;
        Ok(self.ring.read(&*lock).len())
    }

    /// Get a flag indicating whether the pipe is empty.
    pub fn is_empty(&'static self) -> Result<bool, QueryError> {
        Ok(self.len()? == 0)
    }

    fn read_blocking(
        &'static self,
        mut lock: CpuLockGuard<Traits>,
        dst: &mut [u8],
        timeout: Option<u32>,
    ) -> Result<usize, WaitTimeoutError> {
        if dst.is_empty() {
            return Ok(0);
        }
        let task = task::running_task::<Traits>();

        let mut len = self.read_core(lock.borrow_mut(), dst);
        if len == 0 {
            // A writer fills `req.dst` before waking us up
            let mut req = ReadReq { dst, len: 0 };
            self.owner.boost(lock.borrow_mut(), task);
            let payload = self.transfer_payload(&mut req);
            self.block(lock.borrow_mut(), &self.readers, TaskSt::Receiving, payload, timeout)?;
            if req.len == 0 {
                error::fault::<Traits>(Fault::TaskInvalidState);
            }
            len = req.len;
        }

        self.finish(lock, Some(task));
        Ok(len)
    }

    fn write_blocking(
        &'static self,
        mut lock: CpuLockGuard<Traits>,
        src: &[u8],
        timeout: Option<u32>,
    ) -> Result<usize, WaitTimeoutError> {
        if src.is_empty() {
            return Ok(0);
        }
        let task = task::running_task::<Traits>();

        let mut len = self.write_core(lock.borrow_mut(), src);
        if len == 0 {
            // A reader moves bytes from `req.src` into the ring before waking
            // us up
            let mut req = WriteReq { src, len: 0 };
            self.owner.boost(lock.borrow_mut(), task);
            let payload = self.transfer_payload(&mut req);
            self.block(lock.borrow_mut(), &self.writers, TaskSt::Sending, payload, timeout)?;
            if req.len == 0 {
                error::fault::<Traits>(Fault::TaskInvalidState);
            }
            len = req.len;
        }

        self.finish(lock, Some(task));
        Ok(len)
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

    fn transfer_payload<R>(&'static self, req: &mut R) -> WaitPayload<Traits> {
        WaitPayload::Transfer {
            slot: TransferSlot::new(req),
            front: false,
            owner: &self.owner,
        }
    }

    /// Deliver `src` to waiting readers, then buffer the rest. Returns the
    /// number of bytes consumed.
    fn write_core(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, src: &[u8]) -> usize {
        let mut done = 0;

        // Readers only wait while the pipe is empty
        while done < src.len() && self.readers.first_waiter(lock.borrow_mut()).is_some() {
            self.readers
                .wake_up_one_with(lock.borrow_mut(), |_, _, payload| {
                    // Safety: Readers create their slots from `ReadReq`
                    let (req, _) = unsafe { payload.transfer::<ReadReq<'_>>() };
                    let chunk = (src.len() - done).min(req.dst.len());
                    req.dst[..chunk].copy_from_slice(&src[done..done + chunk]);
                    req.len = chunk;
                    done += chunk;
                });
        }

        done += self.ring.write(&mut *lock).write(&src[done..]);

        if done > 0 {
            log::trace!("pipe {:p}: {done} bytes written", self);
        }
        done
    }

    /// Drain buffered bytes into `dst`, then refill the ring from waiting
    /// writers. Returns the number of bytes read.
    fn read_core(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, dst: &mut [u8]) -> usize {
        let len = self.ring.write(&mut *lock).read(dst);
        if len == 0 {
            return 0;
        }

        // Writers only wait while the pipe is full
        while self.ring.read(&*lock).room() > 0
            && self.writers.first_waiter(lock.borrow_mut()).is_some()
        {
            let ring = &self.ring;
            self.writers
                .wake_up_one_with(lock.borrow_mut(), |mut lock, _, payload| {
                    // Safety: Writers create their slots from `WriteReq`
                    let (req, _) = unsafe { payload.transfer::<WriteReq<'_>>() };
                    req.len += ring.write(&mut *lock).write(&req.src[req.len..]);
                });
        }

        log::trace!("pipe {:p}: {len} bytes read", self);
        len
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

impl<Traits: KernelTraits, const N: usize> fmt::Debug for Pipe<Traits, N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("self", &(self as *const _))
            .field("initialized", &self.initialized)
            .field("ring", &self.ring)
            .finish_non_exhaustive()
    }
}
