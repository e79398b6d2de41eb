//! Timers
//!
//! The timer pool holds a fixed number of [`TimerCb`] slots shared by
//! application timers ([`start`]) and the kernel's own sleep and timeout
//! timers. Armed slots are linked into one of two delta lists (see
//! [`delta`]): one for one-shot timers and one for periodic timers.
//!
//! The tick handler ([`PortToKernel::timer_tick`]) only advances the lists.
//! Expired timers are processed by the timer-handler task, which runs at the
//! highest priority. Kernel timers (ending a sleep or a wait) are handled
//! inside the critical section, while application callbacks are called with
//! CPU Lock released.
//!
//! [`PortToKernel::timer_tick`]: crate::PortToKernel::timer_tick
use core::{fmt, sync::atomic::Ordering};

use crate::{
    error::{self, Fault, FaultExt, NoTimerSlotError, StartTimerError, StopTimerError},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    task::{self, TaskSt, TIMER_TASK},
    utils::Init,
    wait::{self, WaitPayload},
    KernelTraits,
};

mod delta;
use self::delta::DeltaPool;

/// What happens when a timer expires.
#[derive(Clone, Copy)]
enum TimerKind {
    /// The slot is free.
    Unused,
    /// End the sleep or the wait of the task.
    Task(usize),
    /// Call `callback(arg)`.
    User { callback: fn(usize), arg: usize },
}

impl Init for TimerKind {
    const INIT: Self = Self::Unused;
}

impl fmt::Debug for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Unused => f.write_str("Unused"),
            Self::Task(task) => f.debug_tuple("Task").field(task).finish(),
            Self::User { callback, arg } => f
                .debug_struct("User")
                .field("callback", &(*callback as *const ()))
                .field("arg", arg)
                .finish(),
        }
    }
}

/// The list a timer slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerList {
    Free,
    OneShot,
    Periodic,
}

impl Init for TimerList {
    const INIT: Self = Self::Free;
}

/// *Timer control block* - the state data of a timer slot.
pub struct TimerCb<Traits> {
    /// The next slot in the list this slot belongs to.
    next: CpuLockCell<Traits, Option<usize>>,

    /// The ticks between the expiration of the predecessor and this timer.
    delta: CpuLockCell<Traits, u32>,

    /// The reload value of a periodic timer.
    period: CpuLockCell<Traits, u32>,

    kind: CpuLockCell<Traits, TimerKind>,

    list: CpuLockCell<Traits, TimerList>,

    /// Incremented every time the slot is freed, so that a stale [`TimerId`]
    /// can be detected.
    generation: CpuLockCell<Traits, u32>,
}

impl<Traits> Init for TimerCb<Traits> {
    const INIT: Self = Self {
        next: Init::INIT,
        delta: Init::INIT,
        period: Init::INIT,
        kind: Init::INIT,
        list: Init::INIT,
        generation: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for TimerCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerCb")
            .field("self", &(self as *const _))
            .field("next", &self.next)
            .field("delta", &self.delta)
            .field("period", &self.period)
            .field("kind", &self.kind)
            .field("list", &self.list)
            .finish_non_exhaustive()
    }
}

/// The heads of the timer lists.
pub(crate) struct TimerQueues<Traits> {
    free: CpuLockCell<Traits, Option<usize>>,
    one_shot: CpuLockCell<Traits, Option<usize>>,
    periodic: CpuLockCell<Traits, Option<usize>>,
}

impl<Traits> Init for TimerQueues<Traits> {
    const INIT: Self = Self {
        free: Init::INIT,
        one_shot: Init::INIT,
        periodic: Init::INIT,
    };
}

impl<Traits> TimerQueues<Traits> {
    fn head(&self, list: TimerList) -> &CpuLockCell<Traits, Option<usize>> {
        match list {
            TimerList::Free => &self.free,
            TimerList::OneShot => &self.one_shot,
            TimerList::Periodic => &self.periodic,
        }
    }
}

/// A handle to an application timer created by [`start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    slot: usize,
    generation: u32,
}

/// Lets the functions in [`delta`] operate on the timer pool.
struct PoolView<'a, Traits: KernelTraits> {
    lock: CpuLockTokenRefMut<'a, Traits>,
}

impl<Traits: KernelTraits> DeltaPool for PoolView<'_, Traits> {
    fn delta(&self, i: usize) -> u32 {
        *Traits::timer_cb_pool()[i].delta.read(&*self.lock)
    }
    fn set_delta(&mut self, i: usize, delta: u32) {
        Traits::timer_cb_pool()[i].delta.replace(&mut *self.lock, delta);
    }
    fn next(&self, i: usize) -> Option<usize> {
        *Traits::timer_cb_pool()[i].next.read(&*self.lock)
    }
    fn set_next(&mut self, i: usize, next: Option<usize>) {
        Traits::timer_cb_pool()[i].next.replace(&mut *self.lock, next);
    }
}

/// Link every slot into the free list.
pub(crate) fn init_timers<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let pool = Traits::timer_cb_pool();
    for (i, cb) in pool.iter().enumerate() {
        let next = if i + 1 < pool.len() { Some(i + 1) } else { None };
        cb.next.replace(&mut *lock, next);
        cb.list.replace(&mut *lock, TimerList::Free);
    }
    let first = if pool.is_empty() { None } else { Some(0) };
    Traits::state().timers.free.replace(&mut *lock, first);
}

/// Take a slot from the free list and arm it.
fn arm<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    ticks: u32,
    kind: TimerKind,
    periodic: bool,
) -> Result<usize, NoTimerSlotError> {
    let queues = &Traits::state().timers;
    let Some(slot) = queues.free.get(&*lock) else {
        log::trace!("timer pool exhausted");
        return Err(NoTimerSlotError::NoTimerSlot);
    };
    let cb = &Traits::timer_cb_pool()[slot];
    let next = cb.next.get(&*lock);
    queues.free.replace(&mut *lock, next);

    let list = if periodic {
        TimerList::Periodic
    } else {
        TimerList::OneShot
    };
    cb.kind.replace(&mut *lock, kind);
    cb.period.replace(&mut *lock, ticks);
    cb.list.replace(&mut *lock, list);

    insert(lock, slot, list, ticks);
    Ok(slot)
}

fn insert<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    slot: usize,
    list: TimerList,
    ticks: u32,
) {
    let head_cell = Traits::state().timers.head(list);
    let mut head = head_cell.get(&*lock);
    delta::insert(
        &mut PoolView {
            lock: lock.borrow_mut(),
        },
        &mut head,
        slot,
        ticks,
    );
    head_cell.replace(&mut *lock, head);
}

/// Return an unlinked slot to the free list.
fn release<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>, slot: usize) {
    let queues = &Traits::state().timers;
    let cb = &Traits::timer_cb_pool()[slot];
    cb.kind.replace(&mut *lock, TimerKind::Unused);
    cb.list.replace(&mut *lock, TimerList::Free);
    let generation = cb.generation.write(&mut *lock);
    *generation = generation.wrapping_add(1);
    let free_head = queues.free.get(&*lock);
    cb.next.replace(&mut *lock, free_head);
    queues.free.replace(&mut *lock, Some(slot));
}

/// Arm a one-shot timer that ends the wait of `task` after `ticks` ticks.
pub(crate) fn start_task_timer<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task: usize,
    ticks: u32,
) -> Result<usize, NoTimerSlotError> {
    arm(lock, ticks, TimerKind::Task(task), false)
}

/// Disarm a timer and free its slot.
pub(crate) fn cancel<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>, slot: usize) {
    let list = Traits::timer_cb_pool()[slot].list.get(&*lock);
    if list == TimerList::Free {
        return;
    }

    let head_cell = Traits::state().timers.head(list);
    let mut head = head_cell.get(&*lock);
    let found = delta::remove(
        &mut PoolView {
            lock: lock.borrow_mut(),
        },
        &mut head,
        slot,
    );
    if !found {
        error::fault::<Traits>(Fault::List);
    }
    head_cell.replace(&mut *lock, head);

    release(lock, slot);
}

/// Start an application timer that calls `callback(arg)` after `ticks` ticks
/// and, if `periodic` is `true`, every `ticks` ticks after that.
///
/// The callback runs on the timer-handler task with CPU Lock inactive. It
/// must not call blocking services.
///
/// This function may be called from an interrupt context.
pub fn start<Traits: KernelTraits>(
    ticks: u32,
    callback: fn(usize),
    arg: usize,
    periodic: bool,
) -> Result<TimerId, StartTimerError> {
    if ticks == 0 {
        return Err(StartTimerError::BadParam);
    }
    let mut lock = klock::lock_cpu::<Traits>()?;
    let slot = arm(
        lock.borrow_mut(),
        ticks,
        TimerKind::User { callback, arg },
        periodic,
    )?;
    log::trace!("timer {slot}: started ({ticks} ticks, periodic = {periodic})");
    Ok(TimerId {
        slot,
        generation: *Traits::timer_cb_pool()[slot].generation.read(&*lock),
    })
}

/// Stop an application timer started by [`start`]. Returns `BadParam` if the
/// one-shot timer has already fired or the timer was already stopped.
pub fn stop<Traits: KernelTraits>(timer: TimerId) -> Result<(), StopTimerError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let cb = Traits::timer_cb_pool()
        .get(timer.slot)
        .ok_or(StopTimerError::BadParam)?;

    let is_live = *cb.generation.read(&*lock) == timer.generation
        && matches!(*cb.kind.read(&*lock), TimerKind::User { .. });
    if !is_live {
        return Err(StopTimerError::BadParam);
    }

    cancel(lock.borrow_mut(), timer.slot);
    log::trace!("timer {}: stopped", timer.slot);
    Ok(())
}

/// Get the number of free timer slots.
pub fn free_slots<Traits: KernelTraits>() -> Result<usize, error::QueryError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let mut count = 0;
    let mut cur = Traits::state().timers.free.get(&*lock);
    while let Some(slot) = cur {
        count += 1;
        cur = PoolView {
            lock: lock.borrow_mut(),
        }
        .next(slot);
    }
    Ok(count)
}

/// Implements [`PortToKernel::timer_tick`].
///
/// [`PortToKernel::timer_tick`]: crate::PortToKernel::timer_tick
pub(crate) fn handle_tick<Traits: KernelTraits>() {
    let mut lock = klock::lock_cpu::<Traits>().or_fault::<Traits>(Fault::General);
    let state = Traits::state();

    let now = state.tick_count.load(Ordering::Relaxed).wrapping_add(1);
    state.tick_count.store(now, Ordering::Relaxed);
    if now == 0 {
        state.tick_wraps.fetch_add(1, Ordering::Relaxed);
    }

    task::charge_running_task(lock.borrow_mut());

    let mut expired = false;
    for list in [TimerList::OneShot, TimerList::Periodic] {
        let head = state.timers.head(list).get(&*lock);
        expired |= delta::tick(
            &mut PoolView {
                lock: lock.borrow_mut(),
            },
            head,
        );
    }

    if expired && *task::task_cb::<Traits>(TIMER_TASK).st.read(&*lock) == TaskSt::Pending {
        task::signal_index(lock.borrow_mut(), TIMER_TASK);
    }

    task::unlock_cpu_and_check_preemption(lock);
}

/// An expired timer that needs attention outside the critical section.
enum Expired {
    User { callback: fn(usize), arg: usize },
}

/// Unlink the next expired timer, handling kernel timers on the spot.
/// Returns `None` when there are no more expired timers.
fn pop_expired<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) -> Option<Expired> {
    let queues = &Traits::state().timers;

    loop {
        let mut head = queues.one_shot.get(&*lock);
        if let Some(slot) = delta::pop_expired(
            &mut PoolView {
                lock: lock.borrow_mut(),
            },
            &mut head,
        ) {
            queues.one_shot.replace(&mut *lock, head);

            let kind = Traits::timer_cb_pool()[slot].kind.get(&*lock);
            release(lock.borrow_mut(), slot);

            match kind {
                TimerKind::Task(task) => {
                    log::trace!("timer {slot}: wakes up task {task}");
                    wait::interrupt_task(lock.borrow_mut(), task);
                    continue;
                }
                TimerKind::User { callback, arg } => {
                    log::trace!("timer {slot}: one-shot fired");
                    return Some(Expired::User { callback, arg });
                }
                TimerKind::Unused => error::fault::<Traits>(Fault::List),
            }
        }

        let mut head = queues.periodic.get(&*lock);
        if let Some(slot) = delta::pop_expired(
            &mut PoolView {
                lock: lock.borrow_mut(),
            },
            &mut head,
        ) {
            queues.periodic.replace(&mut *lock, head);

            // Copy the record before the callback gets a chance to touch the
            // slot
            let cb = &Traits::timer_cb_pool()[slot];
            let kind = cb.kind.get(&*lock);
            let period = cb.period.get(&*lock);
            insert(lock.borrow_mut(), slot, TimerList::Periodic, period);

            return match kind {
                TimerKind::User { callback, arg } => {
                    log::trace!("timer {slot}: periodic fired");
                    Some(Expired::User { callback, arg })
                }
                TimerKind::Task(_) | TimerKind::Unused => error::fault::<Traits>(Fault::List),
            };
        }

        return None;
    }
}

/// The body of the timer-handler task.
pub(crate) fn timer_handler_body<Traits: KernelTraits>() {
    let state = Traits::state();
    let mut lock = klock::lock_cpu::<Traits>().or_fault::<Traits>(Fault::General);

    loop {
        match pop_expired(lock.borrow_mut()) {
            Some(Expired::User { callback, arg }) => {
                drop(lock);

                state.in_timer_callback.store(true, Ordering::Relaxed);
                callback(arg);
                state.in_timer_callback.store(false, Ordering::Relaxed);

                lock = klock::lock_cpu::<Traits>().or_fault::<Traits>(Fault::General);
            }
            None => {
                state
                    .sleep_queue
                    .wait(lock.borrow_mut(), TaskSt::Pending, WaitPayload::Pend);
            }
        }
    }
}
