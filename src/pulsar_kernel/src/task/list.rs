//! Circular doubly-linked lists of tasks
//!
//! A task is identified by its index into the task control block pool, and
//! its neighbors are stored in [`TaskCb::link`]. All lists share this one
//! link field, so a task belongs to at most one list at a time: a level of
//! the ready queue or the wait queue it's blocked in.
//!
//! The list algorithms are written against [`Links`] so that they can be
//! exercised without a kernel instance.
//!
//! [`TaskCb::link`]: crate::TaskCb
use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    task::task_cb,
    utils::Init,
    KernelTraits,
};

/// The neighbors of a linked task. A task alone in its list is its own
/// neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TaskLink {
    prev: usize,
    next: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListError {
    /// The task to insert is already in a list.
    AlreadyLinked,
    /// The task to remove or visit is not in a list.
    NotLinked,
    /// The links contradict each other.
    Broken,
}

/// The link storage of a task pool.
pub(crate) trait Links {
    fn link(&self, task: usize) -> Option<TaskLink>;
    fn set_link(&mut self, task: usize, link: Option<TaskLink>);

    fn linked(&self, task: usize) -> Result<TaskLink, ListError> {
        self.link(task).ok_or(ListError::NotLinked)
    }
}

/// The first task of a list.
type Head = Option<usize>;

/// Insert `task` before `at`, or at the back if `at` is `None`.
fn insert(
    head: &mut Head,
    links: &mut impl Links,
    task: usize,
    at: Option<usize>,
) -> Result<(), ListError> {
    if links.link(task).is_some() {
        return Err(ListError::AlreadyLinked);
    }

    let Some(first) = *head else {
        if at.is_some() {
            return Err(ListError::Broken);
        }
        links.set_link(task, Some(TaskLink { prev: task, next: task }));
        *head = Some(task);
        return Ok(());
    };

    let next = at.unwrap_or(first);
    let prev = links.linked(next).map_err(|_| ListError::Broken)?.prev;

    let mut prev_link = links.linked(prev).map_err(|_| ListError::Broken)?;
    prev_link.next = task;
    links.set_link(prev, Some(prev_link));

    // Read after the write above, since `prev == next` in a one-task list
    let mut next_link = links.linked(next).map_err(|_| ListError::Broken)?;
    next_link.prev = task;
    links.set_link(next, Some(next_link));

    links.set_link(task, Some(TaskLink { prev, next }));

    if at == Some(first) {
        *head = Some(task);
    }
    Ok(())
}

fn remove(head: &mut Head, links: &mut impl Links, task: usize) -> Result<(), ListError> {
    let link = links.linked(task)?;

    if link.next == task {
        if *head != Some(task) {
            return Err(ListError::Broken);
        }
        *head = None;
    } else {
        let mut prev_link = links.linked(link.prev).map_err(|_| ListError::Broken)?;
        prev_link.next = link.next;
        links.set_link(link.prev, Some(prev_link));

        let mut next_link = links.linked(link.next).map_err(|_| ListError::Broken)?;
        next_link.prev = link.prev;
        links.set_link(link.next, Some(next_link));

        if *head == Some(task) {
            *head = Some(link.next);
        }
    }

    links.set_link(task, None);
    Ok(())
}

fn back(head: Head, links: &impl Links) -> Result<Option<usize>, ListError> {
    head.map(|first| links.linked(first).map(|link| link.prev))
        .transpose()
}

/// Get the task after `task`, or `None` at the back.
fn next(head: Head, links: &impl Links, task: usize) -> Result<Option<usize>, ListError> {
    let next = links.linked(task)?.next;
    Ok(Some(next).filter(|&next| Some(next) != head))
}

/// Get the task before `task`, or `None` at the front.
fn prev(head: Head, links: &impl Links, task: usize) -> Result<Option<usize>, ListError> {
    let prev = links.linked(task)?.prev;
    Ok(Some(prev).filter(|_| Some(task) != head))
}

/// [`Links`] of the kernel's task pool.
struct PoolLinks<'a, Traits> {
    lock: CpuLockTokenRefMut<'a, Traits>,
}

impl<Traits: KernelTraits> Links for PoolLinks<'_, Traits> {
    fn link(&self, task: usize) -> Option<TaskLink> {
        task_cb::<Traits>(task).link.get(&self.lock)
    }

    fn set_link(&mut self, task: usize, link: Option<TaskLink>) {
        task_cb::<Traits>(task).link.replace(&mut self.lock, link);
    }
}

/// A list of tasks linked through [`TaskCb::link`](crate::TaskCb).
pub(crate) struct TaskList<Traits> {
    head: CpuLockCell<Traits, Head>,
}

impl<Traits> Init for TaskList<Traits> {
    const INIT: Self = Self::new();
}

impl<Traits> TaskList<Traits> {
    pub(crate) const fn new() -> Self {
        Self {
            head: CpuLockCell::new(None),
        }
    }
}

impl<Traits: KernelTraits> TaskList<Traits> {
    /// Run a list algorithm on the current head and store the head back.
    fn modify<R>(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        f: impl FnOnce(&mut Head, &mut PoolLinks<'_, Traits>) -> R,
    ) -> R {
        let mut head = self.head.get(&lock);
        let result = f(&mut head, &mut PoolLinks { lock: lock.borrow_mut() });
        self.head.replace(&mut lock, head);
        result
    }

    pub(crate) fn front(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> Option<usize> {
        self.head.get(&lock)
    }

    pub(crate) fn is_empty(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.front(lock).is_none()
    }

    pub(crate) fn back(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> Result<Option<usize>, ListError> {
        let head = self.head.get(&lock);
        back(head, &PoolLinks { lock })
    }

    pub(crate) fn next(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        task: usize,
    ) -> Result<Option<usize>, ListError> {
        let head = self.head.get(&lock);
        next(head, &PoolLinks { lock }, task)
    }

    pub(crate) fn prev(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        task: usize,
    ) -> Result<Option<usize>, ListError> {
        let head = self.head.get(&lock);
        prev(head, &PoolLinks { lock }, task)
    }

    pub(crate) fn push_back(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        task: usize,
    ) -> Result<(), ListError> {
        self.insert_before(lock, task, None)
    }

    /// Insert `task` before `at`, or at the back if `at` is `None`.
    pub(crate) fn insert_before(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        task: usize,
        at: Option<usize>,
    ) -> Result<(), ListError> {
        self.modify(lock, |head, links| insert(head, links, task, at))
    }

    pub(crate) fn remove(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        task: usize,
    ) -> Result<(), ListError> {
        self.modify(lock, |head, links| remove(head, links, task))
    }

    pub(crate) fn pop_front(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Result<Option<usize>, ListError> {
        self.modify(lock, |head, links| {
            let Some(first) = *head else {
                return Ok(None);
            };
            remove(head, links, first).map(|()| Some(first))
        })
    }

    /// Fold the tasks from front to back.
    pub(crate) fn fold<B>(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        init: B,
        mut f: impl FnMut(B, usize, CpuLockTokenRefMut<'_, Traits>) -> B,
    ) -> Result<B, ListError> {
        let mut acc = init;
        let mut cursor = self.front(lock.borrow_mut());
        while let Some(task) = cursor {
            acc = f(acc, task, lock.borrow_mut());
            cursor = self.next(lock.borrow_mut(), task)?;
        }
        Ok(acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::VecDeque;

    const POOL_LEN: usize = 8;

    impl Links for Vec<Option<TaskLink>> {
        fn link(&self, task: usize) -> Option<TaskLink> {
            self[task]
        }

        fn set_link(&mut self, task: usize, link: Option<TaskLink>) {
            self[task] = link;
        }
    }

    fn collect(head: Head, links: &Vec<Option<TaskLink>>) -> Vec<usize> {
        let mut tasks = Vec::new();
        let mut cursor = head;
        while let Some(task) = cursor {
            tasks.push(task);
            cursor = next(head, links, task).unwrap();
        }
        tasks
    }

    fn collect_rev(head: Head, links: &Vec<Option<TaskLink>>) -> Vec<usize> {
        let mut tasks = Vec::new();
        let mut cursor = back(head, links).unwrap();
        while let Some(task) = cursor {
            tasks.push(task);
            cursor = prev(head, links, task).unwrap();
        }
        tasks
    }

    #[test]
    fn insert_before_front_moves_head() {
        let mut links = vec![None; POOL_LEN];
        let mut head = None;

        insert(&mut head, &mut links, 1, None).unwrap();
        insert(&mut head, &mut links, 2, None).unwrap();
        insert(&mut head, &mut links, 3, Some(1)).unwrap();
        insert(&mut head, &mut links, 4, Some(2)).unwrap();

        assert_eq!(collect(head, &links), [3, 1, 4, 2]);
        assert_eq!(collect_rev(head, &links), [2, 4, 1, 3]);
    }

    #[test]
    fn membership_errors() {
        let mut links = vec![None; POOL_LEN];
        let mut head = None;
        let mut other_head = None;

        insert(&mut head, &mut links, 0, None).unwrap();
        assert_eq!(insert(&mut head, &mut links, 0, None), Err(ListError::AlreadyLinked));

        // The link field is shared between lists
        assert_eq!(
            insert(&mut other_head, &mut links, 0, None),
            Err(ListError::AlreadyLinked)
        );
        assert_eq!(remove(&mut other_head, &mut links, 5), Err(ListError::NotLinked));
        assert_eq!(next(head, &links, 5), Err(ListError::NotLinked));

        remove(&mut head, &mut links, 0).unwrap();
        assert_eq!(head, None);
        assert!(links.iter().all(Option::is_none));
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        PushBack(usize),
        InsertBefore(usize, usize),
        Remove(usize),
    }

    impl quickcheck::Arbitrary for Op {
        fn arbitrary(g: &mut quickcheck::Gen) -> Self {
            let task = usize::arbitrary(g) % POOL_LEN;
            match u8::arbitrary(g) % 3 {
                0 => Self::PushBack(task),
                1 => Self::InsertBefore(task, usize::arbitrary(g) % POOL_LEN),
                _ => Self::Remove(task),
            }
        }
    }

    #[quickcheck]
    fn matches_deque_model(ops: Vec<Op>) {
        let mut links = vec![None; POOL_LEN];
        let mut head = None;
        let mut model = VecDeque::new();

        for op in ops {
            match op {
                Op::PushBack(task) => {
                    let result = insert(&mut head, &mut links, task, None);
                    if model.contains(&task) {
                        assert_eq!(result, Err(ListError::AlreadyLinked));
                    } else {
                        result.unwrap();
                        model.push_back(task);
                    }
                }
                Op::InsertBefore(task, at) => {
                    let Some(pos) = model.iter().position(|&x| x == at) else {
                        continue;
                    };
                    let result = insert(&mut head, &mut links, task, Some(at));
                    if model.contains(&task) {
                        assert_eq!(result, Err(ListError::AlreadyLinked));
                    } else {
                        result.unwrap();
                        model.insert(pos, task);
                    }
                }
                Op::Remove(task) => {
                    let result = remove(&mut head, &mut links, task);
                    match model.iter().position(|&x| x == task) {
                        Some(pos) => {
                            result.unwrap();
                            model.remove(pos);
                        }
                        None => assert_eq!(result, Err(ListError::NotLinked)),
                    }
                }
            }

            let expected: Vec<usize> = model.iter().copied().collect();
            assert_eq!(collect(head, &links), expected);

            let mut reversed = expected.clone();
            reversed.reverse();
            assert_eq!(collect_rev(head, &links), reversed);
        }
    }
}
