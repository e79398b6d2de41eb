//! Pump-drop queues
//!
//! A pump-drop queue passes the latest value of a periodically updated
//! quantity from producers to any number of consumers without blocking.
//!
//! ```text
//! producer:  reserve → write → pump
//! consumer:  fetch → read → drop_buf
//! ```
//!
//! The most recently pumped buffer is the *current* buffer. A buffer that is
//! superseded while being read stays alive until its last reader drops it.
use arrayvec::ArrayVec;
use core::fmt;

use crate::{
    error::{self, BadParamError, Fault, InitObjectError, PdqError, QueryError},
    klock::{self, CpuLockCell, CpuLockGuard},
    utils::Init,
    KernelTraits,
};

/// A handle to a buffer of a [`Pdq`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PdBufId {
    index: u8,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufSt {
    Free,
    /// Owned by a producer.
    Reserved,
    /// Pumped. Readable by consumers.
    Published,
}

struct PdBuf<T> {
    data: Option<T>,
    st: BufSt,
    /// The number of consumers that fetched the buffer and haven't dropped it.
    users: u32,
    /// Incremented every time the buffer is freed.
    generation: u32,
}

impl<T> Init for PdBuf<T> {
    const INIT: Self = Self {
        data: None,
        st: BufSt::Free,
        users: 0,
        generation: 0,
    };
}

/// The buffer bookkeeping of [`Pdq`].
struct PdPool<T, const N: usize> {
    bufs: [PdBuf<T>; N],
    /// Recycled buffers.
    free: ArrayVec<u8, N>,
    /// Buffers at and after this index have never been used.
    fresh: usize,
    current: Option<u8>,
    failed_reservations: u32,
}

impl<T, const N: usize> Init for PdPool<T, N> {
    const INIT: Self = Self {
        bufs: Init::INIT,
        free: Init::INIT,
        fresh: 0,
        current: None,
        failed_reservations: 0,
    };
}

impl<T: Clone, const N: usize> PdPool<T, N> {
    fn buf_mut(&mut self, id: PdBufId, st: BufSt) -> Result<&mut PdBuf<T>, BadParamError> {
        match self.bufs.get_mut(usize::from(id.index)) {
            Some(buf) if buf.generation == id.generation && buf.st == st => Ok(buf),
            _ => Err(BadParamError::BadParam),
        }
    }

    fn id(&self, index: u8) -> PdBufId {
        PdBufId {
            index,
            generation: self.bufs[usize::from(index)].generation,
        }
    }

    fn free_buf(&mut self, index: u8) {
        let buf = &mut self.bufs[usize::from(index)];
        debug_assert_ne!(buf.st, BufSt::Free, "buffer {index} freed twice");
        buf.st = BufSt::Free;
        buf.data = None;
        buf.generation = buf.generation.wrapping_add(1);
        // Every buffer is either in use or in `free`, so there's always room
        let pushed = self.free.try_push(index);
        debug_assert!(pushed.is_ok(), "free list overflow");
    }

    fn reserve(&mut self) -> Option<PdBufId> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.fresh < N => {
                self.fresh += 1;
                (self.fresh - 1) as u8
            }
            None => {
                self.failed_reservations = self.failed_reservations.wrapping_add(1);
                return None;
            }
        };
        self.bufs[usize::from(index)].st = BufSt::Reserved;
        Some(self.id(index))
    }

    fn write(&mut self, id: PdBufId, data: T) -> Result<(), BadParamError> {
        self.buf_mut(id, BufSt::Reserved)?.data = Some(data);
        Ok(())
    }

    fn pump(&mut self, id: PdBufId) -> Result<(), BadParamError> {
        let buf = self.buf_mut(id, BufSt::Reserved)?;
        if buf.data.is_none() {
            // Nothing was written
            return Err(BadParamError::BadParam);
        }
        buf.st = BufSt::Published;
        buf.users = 0;

        if let Some(prev) = self.current.replace(id.index) {
            if self.bufs[usize::from(prev)].users == 0 {
                self.free_buf(prev);
            }
        }
        Ok(())
    }

    fn fetch(&mut self) -> Option<PdBufId> {
        let index = self.current?;
        self.bufs[usize::from(index)].users += 1;
        Some(self.id(index))
    }

    fn read(&mut self, id: PdBufId) -> Result<T, BadParamError> {
        let buf = self.buf_mut(id, BufSt::Published)?;
        match &buf.data {
            Some(data) if buf.users > 0 => Ok(data.clone()),
            _ => Err(BadParamError::BadParam),
        }
    }

    fn drop_buf(&mut self, id: PdBufId) -> Result<(), BadParamError> {
        let buf = self.buf_mut(id, BufSt::Published)?;
        if buf.users == 0 {
            return Err(BadParamError::BadParam);
        }
        buf.users -= 1;
        if buf.users == 0 && self.current != Some(id.index) {
            self.free_buf(id.index);
        }
        Ok(())
    }
}

/// A pump-drop queue of `N` buffers holding a `T` each.
///
/// `N` must be at least the number of buffers that can be in use at the same
/// time: one per producer between [`reserve`](Self::reserve) and
/// [`pump`](Self::pump), one per consumer between [`fetch`](Self::fetch) and
/// [`drop_buf`](Self::drop_buf), and the current buffer.
pub struct Pdq<Traits: 'static, T: 'static, const N: usize> {
    initialized: CpuLockCell<Traits, bool>,
    pool: CpuLockCell<Traits, PdPool<T, N>>,
}

impl<Traits: 'static, T: 'static, const N: usize> Init for Pdq<Traits, T, N> {
    /// An uninitialized queue. [`Pdq::init`] must be called before use.
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        initialized: CpuLockCell::new(false),
        pool: Init::INIT,
    };
}

impl<Traits: 'static, T: 'static, const N: usize> Pdq<Traits, T, N> {
    const SIZE_CHECK: () = assert!(N > 0 && N <= 256, "`N` must be in range `1..=256`");

    /// Construct a queue with no current buffer.
    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::SIZE_CHECK;
        Self {
            initialized: CpuLockCell::new(true),
            pool: Init::INIT,
        }
    }
}

impl<Traits: KernelTraits, T: Clone + Send + 'static, const N: usize> Pdq<Traits, T, N> {
    /// Initialize a queue created by [`Init::INIT`].
    pub fn init(&'static self) -> Result<(), InitObjectError> {
        if N == 0 || N > 256 {
            return Err(InitObjectError::BadParam);
        }
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.initialized.replace(&mut *lock, true) {
            error::fault::<Traits>(Fault::ObjectInit);
        }
        Ok(())
    }

    fn lock_cpu(&self) -> Result<CpuLockGuard<Traits>, error::BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        if !*self.initialized.read(&*lock) {
            error::fault::<Traits>(Fault::ObjectNotInit);
        }
        Ok(lock)
    }

    /// Allocate a buffer for writing. Returns `None` (and counts the failure)
    /// if all buffers are in use.
    pub fn reserve(&'static self) -> Result<Option<PdBufId>, PdqError> {
        let mut lock = self.lock_cpu()?;
        let id = self.pool.write(&mut *lock).reserve();
        if id.is_none() {
            log::trace!("pdq {:p}: no buffer to reserve", self);
        }
        Ok(id)
    }

    /// Store `data` in a reserved buffer.
    pub fn write(&'static self, buf: PdBufId, data: T) -> Result<(), PdqError> {
        let mut lock = self.lock_cpu()?;
        Ok(self.pool.write(&mut *lock).write(buf, data)?)
    }

    /// Publish a reserved and written buffer as the current buffer.
    pub fn pump(&'static self, buf: PdBufId) -> Result<(), PdqError> {
        let mut lock = self.lock_cpu()?;
        Ok(self.pool.write(&mut *lock).pump(buf)?)
    }

    /// Start reading the current buffer. Returns `None` if nothing has been
    /// pumped yet.
    pub fn fetch(&'static self) -> Result<Option<PdBufId>, PdqError> {
        let mut lock = self.lock_cpu()?;
        Ok(self.pool.write(&mut *lock).fetch())
    }

    /// Get the contents of a fetched buffer.
    pub fn read(&'static self, buf: PdBufId) -> Result<T, PdqError> {
        let mut lock = self.lock_cpu()?;
        Ok(self.pool.write(&mut *lock).read(buf)?)
    }

    /// Finish reading a fetched buffer.
    pub fn drop_buf(&'static self, buf: PdBufId) -> Result<(), PdqError> {
        let mut lock = self.lock_cpu()?;
        Ok(self.pool.write(&mut *lock).drop_buf(buf)?)
    }

    /// Get the number of failed calls to [`Self::reserve`].
    pub fn failed_reservations(&'static self) -> Result<u32, QueryError> {
        let lock = self.lock_cpu()?;
        Ok(self.pool.read(&*lock).failed_reservations)
    }
}

impl<Traits: KernelTraits, T: 'static, const N: usize> fmt::Debug for Pdq<Traits, T, N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pdq")
            .field("self", &(self as *const _))
            .field("initialized", &self.initialized)
            .field(
                "current",
                &self.pool.debug_map(|pool| pool.current),
            )
            .finish_non_exhaustive()
    }
}
