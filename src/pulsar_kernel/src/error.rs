//! Error types
//!
//! Kernel services report two kinds of failure:
//!
//!  - **Recoverable errors** are returned to the caller as one of the
//!    per-operation error enums defined here. Every such enum shares its
//!    discriminants with [`ResultCode`], so converting it is free.
//!
//!  - **Faults** ([`Fault`]) indicate a programming defect, such as the use
//!    of an uninitialized object or a blocking call from an interrupt handler.
//!    A fault is never returned. [`fault`] latches the fault code and halts
//!    the system through [`Port::halt`].
//!
//! [`Port::halt`]: crate::Port::halt
use core::{fmt, mem::transmute, sync::atomic::Ordering};

use crate::KernelTraits;

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use pulsar_kernel::error::ResultCode;
            /// assert_eq!(ResultCode::NoTimerSlot.as_str(), "NoTimerSlot");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            fn fmt(self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that a kernel service can
    /// produce.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful. No additional information is available.
        Success = 0,
        /// A parameter is invalid in a way that is no covered by any other error
        /// codes.
        BadParam = -17,
        /// The specified task ID does not refer to any task.
        InvalidId = -18,
        /// The specified priority is out of range.
        InvalidPriority = -19,
        /// The time-slice length is invalid.
        InvalidTimeSlice = -20,
        /// The current context disallows the operation.
        BadContext = -25,
        /// The calling task is not the designated recipient of the mailbox.
        NotRecipient = -27,
        /// The calling task is the designated recipient of the mailbox and
        /// thus cannot send a message to it.
        SendToSelf = -28,
        /// The caller does not own the resource.
        NotOwner = -29,
        /// Resource deadlock would occur.
        WouldDeadlock = -30,
        /// The mutex is not locked.
        NotLocked = -40,
        /// A target object is in a state that disallows the operation.
        BadObjectState = -41,
        /// The timer pool has no free slot.
        NoTimerSlot = -43,
        /// The operation timed out.
        Timeout = -50,
        /// The object has no room for another element.
        Full = -60,
        /// The object has no element to take.
        Empty = -61,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    ///
    /// Success codes have non-negative values.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident $(: $($subty:ident),* $(,)*)? {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for cost-free
                // conversion
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                // Safety: `ResultCode` and `$name` has the same representation
                //         type, and the representation of `ResultCode` is a
                //         superset of `x`.
                unsafe { transmute(x) }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                )*
            }

            #[test]
            fn result_to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from(Err($name::$vname)),
                    );
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }

        $($(
            $subty!(impl From<_> for $name);
        )*)?

        #[allow(unused_macros)]
        macro_rules! $name {
            (impl From<_> for $dest_ty:ty) => {
                impl From<$name> for $dest_ty {
                    #[inline]
                    fn from(x: $name) -> Self {
                        match x {
                            $(
                                $name::$vname => Self::$vname,
                            )*
                        }
                    }
                }
            };
        }
    };
}

// Building blocks
// ---------------------------------------------------------------------------
//
// These are produced by internal functions and converted into the
// per-operation error types by `?`.

define_error! {
    mod bad_context_error {}
    /// `BadContext`
    pub enum BadContextError {
        BadContext,
    }
}

define_error! {
    mod bad_param_error {}
    /// `BadParam`
    pub enum BadParamError {
        BadParam,
    }
}

define_error! {
    mod invalid_id_error {}
    /// `InvalidId`
    pub enum InvalidIdError {
        InvalidId,
    }
}

define_error! {
    mod no_timer_slot_error {}
    /// `NoTimerSlot`
    pub enum NoTimerSlotError {
        NoTimerSlot,
    }
}

define_error! {
    mod wait_timeout_error {}
    /// The outcome of a blocking wait with a timeout.
    pub enum WaitTimeoutError: NoTimerSlotError {
        /// No timer slot was available to arm the timeout. The task did not
        /// start waiting.
        NoTimerSlot,
        /// The task was woken up by the timeout.
        Timeout,
    }
}

// Task management
// ---------------------------------------------------------------------------

define_error! {
    mod create_task_error {}
    /// Error type for [`TaskAttr::validate`].
    ///
    /// [`TaskAttr::validate`]: crate::TaskAttr::validate
    pub enum CreateTaskError {
        /// The user ID is reserved (0 or 255) or is used by another task.
        InvalidId,
        /// The priority is lower than the configured minimum priority.
        InvalidPriority,
        /// Time slicing is enabled, and the time slice is zero.
        InvalidTimeSlice,
    }
}

define_error! {
    mod get_current_task_error {}
    /// Error type for [`System::current_task`].
    ///
    /// [`System::current_task`]: crate::System::current_task
    pub enum GetCurrentTaskError: BadContextError {
        /// CPU Lock is active, or the current context is not a task context.
        BadContext,
    }
}

define_error! {
    mod yield_error {}
    /// Error type for [`System::yield_now`].
    ///
    /// [`System::yield_now`]: crate::System::yield_now
    pub enum YieldError: BadContextError {
        /// CPU Lock is active, or the current context is not a task context.
        BadContext,
    }
}

define_error! {
    mod sleep_error {}
    /// Error type for [`System::sleep`].
    ///
    /// [`System::sleep`]: crate::System::sleep
    pub enum SleepError: BadContextError, NoTimerSlotError {
        /// CPU Lock is active.
        BadContext,
        /// The timer pool is exhausted.
        NoTimerSlot,
    }
}

define_error! {
    mod busy_delay_error {}
    /// Error type for [`System::busy_delay`].
    ///
    /// [`System::busy_delay`]: crate::System::busy_delay
    pub enum BusyDelayError: BadContextError {
        /// CPU Lock is active, or the current context is not a task context.
        BadContext,
    }
}

define_error! {
    mod pend_error {}
    /// Error type for [`System::pend`].
    ///
    /// [`System::pend`]: crate::System::pend
    pub enum PendError: BadContextError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod signal_task_error {}
    /// Error type for [`System::signal`].
    ///
    /// [`System::signal`]: crate::System::signal
    pub enum SignalTaskError: BadContextError, InvalidIdError {
        /// CPU Lock is active.
        BadContext,
        /// No task has the specified ID.
        InvalidId,
    }
}

define_error! {
    mod suspend_task_error {}
    /// Error type for [`System::suspend`].
    ///
    /// [`System::suspend`]: crate::System::suspend
    pub enum SuspendTaskError: BadContextError, InvalidIdError {
        /// CPU Lock is active.
        BadContext,
        /// No task has the specified ID, or the task is a system task.
        InvalidId,
        /// The task is neither Ready nor Running.
        BadObjectState,
    }
}

define_error! {
    mod get_task_info_error {}
    /// Error type for the task query methods of [`System`].
    ///
    /// [`System`]: crate::System
    pub enum GetTaskInfoError: BadContextError, InvalidIdError {
        /// CPU Lock is active.
        BadContext,
        /// No task has the specified ID.
        InvalidId,
    }
}

// Timers
// ---------------------------------------------------------------------------

define_error! {
    mod start_timer_error {}
    /// Error type for [`timer::start`].
    ///
    /// [`timer::start`]: crate::timer::start
    pub enum StartTimerError: BadContextError, BadParamError, NoTimerSlotError {
        /// CPU Lock is active.
        BadContext,
        /// The delay is zero.
        BadParam,
        /// The timer pool is exhausted.
        NoTimerSlot,
    }
}

define_error! {
    mod stop_timer_error {}
    /// Error type for [`timer::stop`].
    ///
    /// [`timer::stop`]: crate::timer::stop
    pub enum StopTimerError: BadContextError, BadParamError {
        /// CPU Lock is active.
        BadContext,
        /// The timer has already fired or been stopped.
        BadParam,
    }
}

// Object set-up
// ---------------------------------------------------------------------------

define_error! {
    mod init_object_error {}
    /// Error type for the `init` methods of kernel objects.
    pub enum InitObjectError: BadContextError, BadParamError {
        /// CPU Lock is active.
        BadContext,
        /// The initial value is out of range.
        BadParam,
    }
}

define_error! {
    mod query_error {}
    /// Error type for the query methods of kernel objects.
    pub enum QueryError: BadContextError {
        /// CPU Lock is active.
        BadContext,
    }
}

// Semaphores
// ---------------------------------------------------------------------------

define_error! {
    mod wait_semaphore_error {}
    /// Error type for [`Semaphore::wait`].
    ///
    /// [`Semaphore::wait`]: crate::Semaphore::wait
    pub enum WaitSemaphoreError: BadContextError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod wait_semaphore_timeout_error {}
    /// Error type for [`Semaphore::wait_timeout`].
    ///
    /// [`Semaphore::wait_timeout`]: crate::Semaphore::wait_timeout
    pub enum WaitSemaphoreTimeoutError: BadContextError, WaitTimeoutError {
        /// CPU Lock is active.
        BadContext,
        /// The timer pool is exhausted.
        NoTimerSlot,
        /// The operation timed out.
        Timeout,
    }
}

define_error! {
    mod poll_semaphore_error {}
    /// Error type for [`Semaphore::try_wait`].
    ///
    /// [`Semaphore::try_wait`]: crate::Semaphore::try_wait
    pub enum PollSemaphoreError: BadContextError {
        /// CPU Lock is active.
        BadContext,
        /// The count is not positive.
        Timeout,
    }
}

define_error! {
    mod signal_semaphore_error {}
    /// Error type for [`Semaphore::signal`].
    ///
    /// [`Semaphore::signal`]: crate::Semaphore::signal
    pub enum SignalSemaphoreError: BadContextError {
        /// CPU Lock is active.
        BadContext,
    }
}

// Mutexes
// ---------------------------------------------------------------------------

define_error! {
    mod lock_mutex_error {}
    /// Error type for [`Mutex::lock`].
    ///
    /// [`Mutex::lock`]: crate::Mutex::lock
    pub enum LockMutexError: BadContextError {
        /// CPU Lock is active.
        BadContext,
        /// The current task already owns the mutex.
        WouldDeadlock,
    }
}

define_error! {
    mod lock_mutex_timeout_error {}
    /// Error type for [`Mutex::lock_timeout`].
    ///
    /// [`Mutex::lock_timeout`]: crate::Mutex::lock_timeout
    pub enum LockMutexTimeoutError: BadContextError, WaitTimeoutError {
        /// CPU Lock is active.
        BadContext,
        /// The current task already owns the mutex.
        WouldDeadlock,
        /// The timer pool is exhausted.
        NoTimerSlot,
        /// The operation timed out.
        Timeout,
    }
}

define_error! {
    mod try_lock_mutex_error {}
    /// Error type for [`Mutex::try_lock`].
    ///
    /// [`Mutex::try_lock`]: crate::Mutex::try_lock
    pub enum TryLockMutexError: BadContextError {
        /// CPU Lock is active.
        BadContext,
        /// The current task already owns the mutex.
        WouldDeadlock,
        /// The mutex is owned by another task.
        Timeout,
    }
}

define_error! {
    mod unlock_mutex_error {}
    /// Error type for [`Mutex::unlock`].
    ///
    /// Unlocking a mutex owned by another task is not an error but a
    /// [`Fault::UnlockNotOwner`].
    ///
    /// [`Mutex::unlock`]: crate::Mutex::unlock
    pub enum UnlockMutexError: BadContextError {
        /// CPU Lock is active.
        BadContext,
        /// The mutex is not locked.
        NotLocked,
    }
}

// Events
// ---------------------------------------------------------------------------

define_error! {
    mod wait_event_error {}
    /// Error type for [`Event::sleep`].
    ///
    /// [`Event::sleep`]: crate::Event::sleep
    pub enum WaitEventError: BadContextError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod wait_event_timeout_error {}
    /// Error type for [`Event::sleep_timeout`].
    ///
    /// [`Event::sleep_timeout`]: crate::Event::sleep_timeout
    pub enum WaitEventTimeoutError: BadContextError, WaitTimeoutError {
        /// CPU Lock is active.
        BadContext,
        /// The timer pool is exhausted.
        NoTimerSlot,
        /// The operation timed out.
        Timeout,
    }
}

define_error! {
    mod wake_event_error {}
    /// Error type for [`Event::wake`] and [`Event::wake_all`].
    ///
    /// [`Event::wake`]: crate::Event::wake
    /// [`Event::wake_all`]: crate::Event::wake_all
    pub enum WakeEventError: BadContextError {
        /// CPU Lock is active.
        BadContext,
    }
}

// Message passing
// ---------------------------------------------------------------------------
//
// These are shared by mailboxes, message queues, and pipes.

define_error! {
    mod send_error {}
    /// Error type for blocking send operations.
    pub enum SendError: BadContextError {
        /// CPU Lock is active.
        BadContext,
        /// The calling task is the designated recipient.
        SendToSelf,
    }
}

define_error! {
    mod send_timeout_error {}
    /// Error type for blocking send operations with a timeout.
    pub enum SendTimeoutError: BadContextError, WaitTimeoutError {
        /// CPU Lock is active.
        BadContext,
        /// The calling task is the designated recipient.
        SendToSelf,
        /// The timer pool is exhausted.
        NoTimerSlot,
        /// The operation timed out.
        Timeout,
    }
}

define_error! {
    mod try_send_error {}
    /// Error type for non-blocking send operations.
    pub enum TrySendError: BadContextError {
        /// CPU Lock is active.
        BadContext,
        /// The calling task is the designated recipient.
        SendToSelf,
        /// There is no room for the message.
        Full,
    }
}

define_error! {
    mod recv_error {}
    /// Error type for blocking receive operations.
    pub enum RecvError: BadContextError {
        /// CPU Lock is active.
        BadContext,
        /// The calling task is not the designated recipient.
        NotRecipient,
    }
}

define_error! {
    mod recv_timeout_error {}
    /// Error type for blocking receive operations with a timeout.
    pub enum RecvTimeoutError: BadContextError, WaitTimeoutError {
        /// CPU Lock is active.
        BadContext,
        /// The calling task is not the designated recipient.
        NotRecipient,
        /// The timer pool is exhausted.
        NoTimerSlot,
        /// The operation timed out.
        Timeout,
    }
}

define_error! {
    mod try_recv_error {}
    /// Error type for non-blocking receive operations.
    pub enum TryRecvError: BadContextError {
        /// CPU Lock is active.
        BadContext,
        /// The calling task is not the designated recipient.
        NotRecipient,
        /// There is no message to take.
        Empty,
    }
}

define_error! {
    mod set_recipient_error {}
    /// Error type for [`Mailbox::set_recipient`].
    ///
    /// [`Mailbox::set_recipient`]: crate::Mailbox::set_recipient
    pub enum SetRecipientError: BadContextError, InvalidIdError {
        /// CPU Lock is active.
        BadContext,
        /// No task has the specified ID.
        InvalidId,
    }
}

define_error! {
    mod pdq_error {}
    /// Error type for [`Pdq`] operations.
    ///
    /// [`Pdq`]: crate::Pdq
    pub enum PdqError: BadContextError, BadParamError {
        /// CPU Lock is active.
        BadContext,
        /// The buffer handle does not refer to a buffer in the appropriate
        /// state.
        BadParam,
    }
}

// Faults
// ---------------------------------------------------------------------------

/// Unrecoverable kernel faults.
///
/// The discriminants are the fault codes latched for postmortem inspection
/// (see [`System::last_fault`]).
///
/// [`System::last_fault`]: crate::System::last_fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Fault {
    /// Unclassified fault.
    General = 0x00,
    /// The ready queue is corrupted.
    ReadyQueue = 0x01,
    /// A linked list is corrupted.
    List = 0x03,
    /// A kernel object was used before being initialized.
    ObjectNotInit = 0x0e,
    /// A task was configured with an out-of-range priority.
    InvalidTaskPriority = 0x1f,
    /// A task was configured with a reserved or duplicate ID.
    InvalidTaskId = 0x2f,
    /// A kernel object was initialized twice.
    ObjectInit = 0x3f,
    /// A task tried to unlock a mutex owned by another task.
    UnlockNotOwner = 0x5f,
    /// A blocking service was called from an interrupt handler or a timer
    /// callback.
    IsrInvalidPrimitive = 0x6f,
    /// A task is in a state that the kernel does not expect, e.g., it
    /// returned from its entry point.
    TaskInvalidState = 0x7f,
}

impl Fault {
    /// Get the fault code.
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Convert a fault code back to `Fault`.
    pub fn from_code(code: u8) -> Option<Self> {
        [
            Self::General,
            Self::ReadyQueue,
            Self::List,
            Self::ObjectNotInit,
            Self::InvalidTaskPriority,
            Self::InvalidTaskId,
            Self::ObjectInit,
            Self::UnlockNotOwner,
            Self::IsrInvalidPrimitive,
            Self::TaskInvalidState,
        ]
        .into_iter()
        .find(|f| f.code() == code)
    }
}

impl From<CreateTaskError> for Fault {
    fn from(x: CreateTaskError) -> Self {
        match x {
            CreateTaskError::InvalidId => Self::InvalidTaskId,
            CreateTaskError::InvalidPriority => Self::InvalidTaskPriority,
            CreateTaskError::InvalidTimeSlice => Self::TaskInvalidState,
        }
    }
}

/// Latch `f` and halt the system. This function never returns.
#[cold]
pub fn fault<Traits: KernelTraits>(f: Fault) -> ! {
    log::error!("kernel fault {f:?} (code {:#04x})", f.code());

    let state = Traits::state();
    state.fault_code.store(f.code(), Ordering::Relaxed);
    state.faulted.store(true, Ordering::Release);

    Traits::halt(f)
}

/// Extension trait for escalating structural inconsistency to a [`Fault`].
pub(crate) trait FaultExt<T> {
    /// Unwrap the result or halt the system with `f`.
    fn or_fault<Traits: KernelTraits>(self, f: Fault) -> T;
}

impl<T, E: fmt::Debug> FaultExt<T> for Result<T, E> {
    #[inline]
    fn or_fault<Traits: KernelTraits>(self, f: Fault) -> T {
        match self {
            Ok(x) => x,
            Err(e) => {
                log::error!("internal inconsistency: {e:?}");
                fault::<Traits>(f)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_code_round_trip() {
        for f in [
            Fault::General,
            Fault::List,
            Fault::UnlockNotOwner,
            Fault::TaskInvalidState,
        ] {
            assert_eq!(Fault::from_code(f.code()), Some(f));
        }
        assert_eq!(Fault::from_code(0x42), None);
    }

    #[test]
    fn suberror_conversion() {
        let e: LockMutexTimeoutError = WaitTimeoutError::Timeout.into();
        assert_eq!(e, LockMutexTimeoutError::Timeout);
        let e: SendTimeoutError = WaitTimeoutError::NoTimerSlot.into();
        assert_eq!(e, SendTimeoutError::NoTimerSlot);
        let e: SleepError = BadContextError::BadContext.into();
        assert_eq!(ResultCode::from(e), ResultCode::BadContext);
    }

    #[test]
    fn create_task_error_maps_to_fault() {
        assert_eq!(Fault::from(CreateTaskError::InvalidId), Fault::InvalidTaskId);
        assert_eq!(
            Fault::from(CreateTaskError::InvalidPriority),
            Fault::InvalidTaskPriority
        );
    }

    #[test]
    fn result_code_sign() {
        assert!(ResultCode::Success.is_ok());
        assert!(ResultCode::Full.is_err());
        assert_eq!(ResultCode::Empty.as_str(), "Empty");
    }
}
