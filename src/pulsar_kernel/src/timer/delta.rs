//! Delta list arithmetic
//!
//! A delta list is a singly linked list of timers sorted by expiration time.
//! Each node stores the number of ticks between its predecessor's expiration
//! and its own, so the expiration time of a node is the sum of the deltas up
//! to and including it. Only the head-most node with a positive delta needs
//! to be decremented on a tick.

/// Storage for the nodes of delta lists.
pub(crate) trait DeltaPool {
    fn delta(&self, i: usize) -> u32;
    fn set_delta(&mut self, i: usize, delta: u32);
    fn next(&self, i: usize) -> Option<usize>;
    fn set_next(&mut self, i: usize, next: Option<usize>);
}

/// Insert `item` to expire `ticks` ticks from now. Nodes expiring at the same
/// tick are kept in insertion order.
pub(crate) fn insert<P: DeltaPool + ?Sized>(
    pool: &mut P,
    head: &mut Option<usize>,
    item: usize,
    ticks: u32,
) {
    let mut remaining = ticks;
    let mut prev = None;
    let mut cur = *head;

    while let Some(c) = cur {
        let delta = pool.delta(c);
        if delta > remaining {
            break;
        }
        remaining -= delta;
        prev = Some(c);
        cur = pool.next(c);
    }

    pool.set_delta(item, remaining);
    pool.set_next(item, cur);

    if let Some(c) = cur {
        let delta = pool.delta(c);
        pool.set_delta(c, delta - remaining);
    }

    match prev {
        Some(p) => pool.set_next(p, Some(item)),
        None => *head = Some(item),
    }
}

/// Unlink `item`. Its remaining delta is carried over to its successor.
/// Returns `false` if `item` is not in the list.
pub(crate) fn remove<P: DeltaPool + ?Sized>(
    pool: &mut P,
    head: &mut Option<usize>,
    item: usize,
) -> bool {
    let mut prev = None;
    let mut cur = *head;

    while let Some(c) = cur {
        if c == item {
            let next = pool.next(c);
            if let Some(n) = next {
                let delta = pool.delta(n).saturating_add(pool.delta(c));
                pool.set_delta(n, delta);
            }
            match prev {
                Some(p) => pool.set_next(p, next),
                None => *head = next,
            }
            pool.set_next(c, None);
            return true;
        }
        prev = Some(c);
        cur = pool.next(c);
    }

    false
}

/// Advance the list by one tick. Returns `true` if the head has expired.
///
/// Expired nodes stay at the head with a zero delta until they are popped,
/// so deferring the handling doesn't lose ticks.
pub(crate) fn tick<P: DeltaPool + ?Sized>(pool: &mut P, head: Option<usize>) -> bool {
    let mut cur = head;
    while let Some(c) = cur {
        let delta = pool.delta(c);
        if delta > 0 {
            pool.set_delta(c, delta - 1);
            break;
        }
        cur = pool.next(c);
    }

    matches!(head, Some(h) if pool.delta(h) == 0)
}

/// Unlink and return the head if it has expired.
pub(crate) fn pop_expired<P: DeltaPool + ?Sized>(
    pool: &mut P,
    head: &mut Option<usize>,
) -> Option<usize> {
    let h = (*head)?;
    if pool.delta(h) != 0 {
        return None;
    }
    *head = pool.next(h);
    pool.set_next(h, None);
    Some(h)
}
