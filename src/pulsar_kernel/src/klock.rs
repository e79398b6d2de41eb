//! CPU Lock, the kernel's only critical section
//!
//! Mutable kernel state lives in [`CpuLockCell`]s. A cell opens only with
//! the [`CpuLockToken`], and the token exists only while CPU Lock is active:
//! [`lock_cpu`] enters CPU Lock and returns a [`CpuLockGuard`] that owns the
//! token until it's dropped. Helpers that run inside the critical section
//! take a [`CpuLockTokenRefMut`] borrowed from the guard.
use core::{fmt, marker::PhantomData, ops};
use tokenlock::{SingletonTokenId, UnsyncSingletonToken, UnsyncSingletonTokenRefMut, UnsyncTokenLock};

use crate::{error::BadContextError, utils::Init, Port};

/// Singleton tag of the CPU Lock token of the kernel instance `Traits`.
pub(super) struct CpuLockTag<Traits>(Traits);

/// Proof that CPU Lock is active.
pub(super) type CpuLockToken<Traits> = UnsyncSingletonToken<CpuLockTag<Traits>>;

/// A reborrow of [`CpuLockToken`] passed down to helper functions. Unlike
/// `&mut CpuLockGuard`, it isn't implicitly reborrowed at call sites, so call
/// [`borrow_mut`] to keep using it after passing it on.
///
/// [`borrow_mut`]: UnsyncSingletonTokenRefMut::borrow_mut
pub(super) type CpuLockTokenRefMut<'a, Traits> =
    UnsyncSingletonTokenRefMut<'a, CpuLockTag<Traits>>;

/// A piece of kernel state that can only be accessed with CPU Lock active.
pub(super) struct CpuLockCell<Traits, T>(UnsyncTokenLock<T, SingletonTokenId<CpuLockTag<Traits>>>);

impl<Traits, T> CpuLockCell<Traits, T> {
    pub(super) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(SingletonTokenId::new(), x))
    }

    #[inline]
    pub(super) fn read<'a>(&'a self, token: &'a CpuLockToken<Traits>) -> &'a T {
        self.0.read(token)
    }

    #[inline]
    pub(super) fn write<'a>(&'a self, token: &'a mut CpuLockToken<Traits>) -> &'a mut T {
        self.0.write(token)
    }

    #[inline]
    pub(super) fn get(&self, token: &CpuLockToken<Traits>) -> T
    where
        T: Clone,
    {
        self.read(token).clone()
    }

    /// Store `x` and return the previous contents.
    #[inline]
    pub(super) fn replace(&self, token: &mut CpuLockToken<Traits>, x: T) -> T {
        core::mem::replace(self.write(token), x)
    }
}

impl<Traits, T: Init> Init for CpuLockCell<Traits, T> {
    const INIT: Self = Self::new(T::INIT);
}

impl<Traits: Port, T> CpuLockCell<Traits, T> {
    /// Get a `Debug` proxy printing `map` applied to the contents. The
    /// proxy can't see the contents if CPU Lock is already active when it's
    /// formatted.
    pub(super) fn debug_map<'a, U: fmt::Debug + 'a>(
        &'a self,
        map: impl Fn(&T) -> U + 'a,
    ) -> impl fmt::Debug + 'a {
        struct Mapped<'a, Traits, T, F, U>(&'a CpuLockCell<Traits, T>, F, PhantomData<fn() -> U>);

        impl<Traits: Port, T, F: Fn(&T) -> U, U: fmt::Debug> fmt::Debug for Mapped<'_, Traits, T, F, U> {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                match lock_cpu::<Traits>() {
                    Ok(lock) => (self.1)(self.0.read(&lock)).fmt(f),
                    Err(_) => f.write_str("<CPU Lock active>"),
                }
            }
        }

        Mapped(self, map, PhantomData)
    }
}

impl<Traits: Port, T: fmt::Debug> fmt::Debug for CpuLockCell<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match lock_cpu::<Traits>() {
            Ok(lock) => self.read(&lock).fmt(f),
            Err(_) => f.write_str("<CPU Lock active>"),
        }
    }
}

/// Enter CPU Lock. Returns `BadContext` if it's already active, e.g.,
/// because the caller is a kernel service further up the stack.
pub(super) fn lock_cpu<Traits: Port>() -> Result<CpuLockGuard<Traits>, BadContextError> {
    // Safety: Only the kernel controls CPU Lock through this method
    if unsafe { Traits::try_enter_cpu_lock() } {
        // Safety: We have just entered CPU Lock, so no other guard exists
        Ok(unsafe { assume_cpu_lock() })
    } else {
        Err(BadContextError::BadContext)
    }
}

/// Take over a CPU Lock state entered by the port.
///
/// # Safety
///
/// CPU Lock must be active, and no `CpuLockGuard` may exist.
pub(super) unsafe fn assume_cpu_lock<Traits: Port>() -> CpuLockGuard<Traits> {
    debug_assert!(Traits::is_cpu_lock_active());

    CpuLockGuard {
        // Safety: Upheld by the caller
        token: unsafe { CpuLockToken::new_unchecked() },
    }
}

/// Owns [`CpuLockToken`] and leaves CPU Lock when dropped.
pub(super) struct CpuLockGuard<Traits: Port> {
    token: CpuLockToken<Traits>,
}

impl<Traits: Port> CpuLockGuard<Traits> {
    pub(super) fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, Traits> {
        self.token.borrow_mut()
    }
}

impl<Traits: Port> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        // Safety: CPU Lock is active, and the guard is the one holding it
        unsafe { Traits::leave_cpu_lock() };
    }
}

impl<Traits: Port> ops::Deref for CpuLockGuard<Traits> {
    type Target = CpuLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: Port> ops::DerefMut for CpuLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}
