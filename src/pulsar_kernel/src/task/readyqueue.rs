//! Task ready queue implementation (internal use only).
use core::fmt;

use crate::{
    error::{Fault, FaultExt},
    klock::{CpuLockCell, CpuLockTokenRefMut},
    task::list::TaskList,
    utils::{Init, PrioBitmap, PRIO_BITMAP_LEN},
    KernelTraits,
};

/// The outcome of [`ReadyQueue::pop_front_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScheduleDecision<T> {
    /// The current task should keep running.
    Keep,
    /// The specified task (or none) should take over.
    SwitchTo(T),
}

/// Tracks the tasks in the Ready state, sorted by effective priority. Each
/// priority level is a FIFO list, and a bitmap indicates which levels are
/// occupied.
///
/// Invariant: `!queues[i].is_empty() == bitmap.get(i)`
pub(crate) struct ReadyQueue<Traits> {
    queues: [TaskList<Traits>; PRIO_BITMAP_LEN],
    bitmap: CpuLockCell<Traits, PrioBitmap>,
}

impl<Traits> Init for ReadyQueue<Traits> {
    const INIT: Self = Self {
        queues: Init::INIT,
        bitmap: Init::INIT,
    };
}

impl<Traits: KernelTraits> ReadyQueue<Traits> {
    /// Return a flag indicating whether there's a task in Ready state whose
    /// priority is numerically lower than `end`.
    pub(crate) fn has_ready_task_in_priority_range(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        end: usize,
    ) -> bool {
        self.bitmap.read(&*lock).any_below(end)
    }

    /// Insert `task` at the back of the level of its effective priority.
    pub(crate) fn push_back_task(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, task: usize) {
        let pri = *Traits::task_cb_pool()[task].effective_priority.read(&*lock);

        self.queues[pri]
            .push_back(lock.borrow_mut(), task)
            .or_fault::<Traits>(Fault::ReadyQueue);

        self.bitmap.write(&mut *lock).set(pri);
    }

    /// Remove `task` from the queue.
    pub(crate) fn remove_task(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, task: usize) {
        let pri = *Traits::task_cb_pool()[task].effective_priority.read(&*lock);

        let queue = &self.queues[pri];
        queue
            .remove(lock.borrow_mut(), task)
            .or_fault::<Traits>(Fault::ReadyQueue);

        if queue.is_empty(lock.borrow_mut()) {
            self.bitmap.write(&mut *lock).clear(pri);
        }
    }

    /// Choose the next task to schedule based on `prev_task_priority`, the
    /// priority of the current task. If there's no such current task,
    /// `prev_task_priority` should be `usize::MAX`, in which case this method
    /// will return `SwitchTo(_)`.
    ///
    /// If this method returns `SwitchTo(Some(task))`, `task` is removed from
    /// the queue.
    pub(crate) fn pop_front_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        prev_task_priority: usize,
    ) -> ScheduleDecision<Option<usize>> {
        // `usize::MAX - 1` makes sure that we return `SwitchTo(None)` instead
        // of `Keep` if there's no current task and no ready task
        let next_task_priority = self
            .bitmap
            .read(&*lock)
            .find_set()
            .unwrap_or(usize::MAX - 1);

        if prev_task_priority <= next_task_priority {
            ScheduleDecision::Keep
        } else if next_task_priority < PRIO_BITMAP_LEN {
            let queue = &self.queues[next_task_priority];
            let task = queue
                .pop_front(lock.borrow_mut())
                .or_fault::<Traits>(Fault::ReadyQueue);

            if queue.is_empty(lock.borrow_mut()) {
                self.bitmap.write(&mut *lock).clear(next_task_priority);
            }

            // The bitmap indicated a non-empty level
            if task.is_none() {
                crate::error::fault::<Traits>(Fault::ReadyQueue);
            }

            ScheduleDecision::SwitchTo(task)
        } else {
            ScheduleDecision::SwitchTo(None)
        }
    }

    /// Move `task` between levels after its effective priority was changed
    /// from `old_effective_priority` to `effective_priority`. The task is
    /// placed at the back of its new level.
    pub(crate) fn reorder_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task: usize,
        effective_priority: usize,
        old_effective_priority: usize,
    ) {
        debug_assert_ne!(effective_priority, old_effective_priority);

        let old_queue = &self.queues[old_effective_priority];
        old_queue
            .remove(lock.borrow_mut(), task)
            .or_fault::<Traits>(Fault::ReadyQueue);
        let old_pri_empty = old_queue.is_empty(lock.borrow_mut());

        self.queues[effective_priority]
            .push_back(lock.borrow_mut(), task)
            .or_fault::<Traits>(Fault::ReadyQueue);

        let bitmap = self.bitmap.write(&mut *lock);
        bitmap.set(effective_priority);
        if old_pri_empty {
            bitmap.clear(old_effective_priority);
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for ReadyQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReadyQueue")
            .field("bitmap", &self.bitmap)
            .finish_non_exhaustive()
    }
}
