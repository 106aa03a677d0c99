//! Append-only broadcast list over pool nodes.
//!
//! Producers append with a CAS on the tail and link the previous tail
//! afterwards. Consumers walk `next` links independently, each holding a
//! reference on the node it stopped at. There is no removal: a node goes back
//! to the pool once its publisher and every consumer have released it.
//!
//! Consumers register with [`BroadcastList::attach`]. A node's countdown is
//! set from the live consumer count when it is published, so attaching and
//! detaching exclude publication for their short critical section.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::pool::{NodeHandle, NodePool};

/// Wakes idle workers after a publication.
///
/// `notify` never blocks: the condvar is only signalled when the mutex is free
/// at that instant. A waiter that misses a signal sleeps at most its timeout.
#[derive(Default)]
pub struct Notifier {
    lock: Mutex<()>,
    cond: Condvar,
    epoch: AtomicU64,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of notifications so far.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn notify(&self) {
        self.epoch.fetch_add(1, Ordering::Release);
        if let Some(_guard) = self.lock.try_lock() {
            self.cond.notify_all();
        }
    }

    /// Sleep up to `timeout` unless a notification arrived after `seen`.
    pub fn wait(&self, seen: u64, timeout: Duration) {
        let mut guard = self.lock.lock();
        if self.epoch() == seen {
            self.cond.wait_for(&mut guard, timeout);
        }
    }

    /// Wake every waiter regardless of the mutex state.
    pub fn wake_all(&self) {
        self.epoch.fetch_add(1, Ordering::Release);
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }
}

pub struct BroadcastList {
    pool: NodePool,
    tail: CachePadded<AtomicU32>,
    consumers: AtomicU32,
    /// Shared by publishers, exclusive for consumer registration.
    membership: RwLock<()>,
    published: AtomicU64,
    notifier: Notifier,
}

impl BroadcastList {
    pub fn new(pool: NodePool) -> Self {
        let sentinel = pool.sentinel();
        Self {
            pool,
            tail: CachePadded::new(AtomicU32::new(sentinel.0)),
            consumers: AtomicU32::new(0),
            membership: RwLock::new(()),
            published: AtomicU64::new(0),
            notifier: Notifier::new(),
        }
    }

    #[inline(always)]
    pub fn pool(&self) -> &NodePool {
        &self.pool
    }

    #[inline(always)]
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Append a filled node owned by the caller.
    ///
    /// The countdown becomes the number of attached consumers plus one. The
    /// publisher's own reference moves from the previous tail to `handle`; it
    /// is released when the next node is linked behind it.
    pub fn publish(&self, handle: NodeHandle) {
        debug_assert!(handle.is_valid() && handle != self.pool.sentinel());

        let members = self.membership.read();
        self.pool
            .set_refs(handle, self.consumers.load(Ordering::Acquire) + 1);

        let mut prev = self.tail.load(Ordering::Acquire);
        loop {
            match self.tail.compare_exchange_weak(
                prev,
                handle.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => prev = current,
            }
        }

        let prev = NodeHandle(prev);
        self.pool.get(prev).next.store(handle.0, Ordering::Release);
        self.pool.release(prev);
        drop(members);

        self.published.fetch_add(1, Ordering::Relaxed);
        self.notifier.notify();
    }

    /// Register a consumer and return its starting position.
    ///
    /// The consumer holds a reference on the returned node and is counted in
    /// every node published afterwards. `None` stands for the sentinel: the
    /// list was empty.
    pub fn attach(&self) -> Option<NodeHandle> {
        let _members = self.membership.write();
        self.consumers.fetch_add(1, Ordering::AcqRel);
        let tail = self.tail();
        if tail == self.pool.sentinel() {
            return None;
        }
        // The publisher's reference keeps the tail alive.
        self.pool.retain(tail);
        Some(tail)
    }

    /// Unregister a consumer positioned at `last`.
    ///
    /// Releases `last` and every node after it, which all counted the
    /// consumer.
    pub fn detach(&self, last: Option<NodeHandle>) {
        let _members = self.membership.write();
        let prev = self.consumers.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "detach without attach");

        // Read each link before the release can recycle its node.
        let mut following = self.next(last);
        if let Some(handle) = last {
            self.pool.release(handle);
        }
        while let Some(node) = following {
            following = self.next(Some(node));
            self.pool.release(node);
        }
    }

    /// Consumers currently attached.
    pub fn consumers(&self) -> u32 {
        self.consumers.load(Ordering::Acquire)
    }

    /// Successor of `prev`, or the first node after the sentinel for `None`.
    ///
    /// `None` means nothing new yet; retry later with the same `prev`. Only
    /// a consumer attached to an empty list may start from `None`.
    #[inline]
    pub fn next(&self, prev: Option<NodeHandle>) -> Option<NodeHandle> {
        let from = prev.unwrap_or_else(|| self.pool.sentinel());
        let raw = self.pool.get(from).next.load(Ordering::Acquire);
        let next = NodeHandle(raw);
        next.is_valid().then_some(next)
    }

    /// Number of nodes published so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Handle of the most recently published node, or the sentinel.
    pub fn tail(&self) -> NodeHandle {
        NodeHandle(self.tail.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidal_proto::{Message, PriceLevel};

    fn fill(list: &BroadcastList, tag: i64) -> NodeHandle {
        let pool = list.pool();
        let h = pool.allocate().unwrap();
        let node = pool.get(h);
        // SAFETY: freshly allocated.
        unsafe {
            node.storage_mut()[0] = Message::from_record(&PriceLevel::new(1, tag, 100, 1, tag));
        }
        node.set_len(1);
        h
    }

    fn tag_of(list: &BroadcastList, h: NodeHandle) -> i64 {
        list.pool().get(h).messages()[0].time()
    }

    #[test]
    fn test_empty_list() {
        let list = BroadcastList::new(NodePool::new(4));
        assert_eq!(list.next(None), None);
        assert_eq!(list.tail(), list.pool().sentinel());
    }

    #[test]
    fn test_walk_in_publication_order() {
        let list = BroadcastList::new(NodePool::new(8));
        let mut cursor = list.attach();
        assert_eq!(cursor, None);
        assert_eq!(list.next(cursor), None);

        for t in 1..=5 {
            let h = fill(&list, t);
            list.publish(h);
        }
        assert_eq!(list.published(), 5);

        let mut seen = Vec::new();
        while let Some(n) = list.next(cursor) {
            seen.push(tag_of(&list, n));
            if let Some(prev) = cursor {
                list.pool().release(prev);
            }
            cursor = Some(n);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_node_recycled_after_n_plus_one_releases() {
        const SINKS: u32 = 3;
        let list = BroadcastList::new(NodePool::new(8));
        let pool = list.pool();
        for _ in 0..SINKS {
            assert_eq!(list.attach(), None);
        }
        assert_eq!(list.consumers(), SINKS);

        let first = fill(&list, 1);
        list.publish(first);
        for _ in 0..SINKS {
            pool.release(first);
        }
        // Publisher's reference is still held until a successor is linked.
        assert_eq!(pool.get(first).refs(), 1);
        assert_eq!(pool.recycled(), 0);

        let second = fill(&list, 2);
        list.publish(second);
        assert_eq!(pool.recycled(), 1);
        assert_eq!(pool.available(), 7);
    }

    #[test]
    fn test_consumer_released_node_survives_until_publisher_links() {
        let list = BroadcastList::new(NodePool::new(4));
        let pool = list.pool();
        list.attach();

        let a = fill(&list, 1);
        list.publish(a);
        assert_eq!(list.next(None), Some(a));
        pool.release(a);
        assert_eq!(pool.recycled(), 0);
        assert_eq!(tag_of(&list, a), 1);
    }

    #[test]
    fn test_concurrent_publishers_and_cursor() {
        const PUBLISHERS: i64 = 4;
        const PER_PUBLISHER: i64 = 2_000;

        let list = BroadcastList::new(NodePool::new(32));
        let total = (PUBLISHERS * PER_PUBLISHER) as usize;
        let start = list.attach();

        std::thread::scope(|s| {
            for p in 0..PUBLISHERS {
                let list = &list;
                s.spawn(move || {
                    for i in 0..PER_PUBLISHER {
                        let h = loop {
                            match list.pool().allocate() {
                                Ok(h) => break h,
                                Err(_) => std::thread::yield_now(),
                            }
                        };
                        let node = list.pool().get(h);
                        let tag = p * PER_PUBLISHER + i + 1;
                        // SAFETY: freshly allocated.
                        unsafe {
                            node.storage_mut()[0] =
                                Message::from_record(&PriceLevel::new(p as u32, i, 0, 0, tag));
                        }
                        node.set_len(1);
                        list.publish(h);
                    }
                });
            }

            let mut cursor = start;
            let mut last_per_publisher = [0i64; PUBLISHERS as usize];
            let mut count = 0;
            while count < total {
                let Some(n) = list.next(cursor) else {
                    std::thread::yield_now();
                    continue;
                };
                let record = *list.pool().get(n).messages()[0].record::<PriceLevel>().unwrap();
                let (p, i) = (record.security_id as usize, record.level_id);
                assert!(i >= last_per_publisher[p], "publisher {p} reordered");
                last_per_publisher[p] = i;
                if let Some(prev) = cursor {
                    list.pool().release(prev);
                }
                cursor = Some(n);
                count += 1;
            }
        });
        assert_eq!(list.published(), total as u64);
    }

    #[test]
    fn test_late_consumer_starts_at_tail() {
        let list = BroadcastList::new(NodePool::new(4));
        let pool = list.pool();
        let early = list.attach();
        assert_eq!(early, None);

        // Cycle the whole pool through the list a few times.
        let mut cursor = early;
        for t in 1..=10 {
            list.publish(fill(&list, t));
            let n = list.next(cursor).unwrap();
            if let Some(prev) = cursor {
                pool.release(prev);
            }
            cursor = Some(n);
        }
        assert!(pool.recycled() >= 8);

        let late = list.attach();
        assert_eq!(late, Some(list.tail()));
        assert_eq!(list.consumers(), 2);
        // Publisher, early consumer and late consumer.
        assert_eq!(pool.get(list.tail()).refs(), 3);

        list.publish(fill(&list, 11));
        let n = list.next(late).unwrap();
        assert_eq!(tag_of(&list, n), 11);
        assert_eq!(pool.get(n).refs(), 3);
        pool.release(late.unwrap());

        // Detaching hands back every reference the consumer still owed.
        list.detach(Some(n));
        list.detach(cursor);
        assert_eq!(list.consumers(), 0);
        assert_eq!(pool.get(n).refs(), 1);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_notifier_wait_returns_on_stale_epoch() {
        let notifier = Notifier::new();
        let seen = notifier.epoch();
        notifier.notify();
        let start = std::time::Instant::now();
        notifier.wait(seen, Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
