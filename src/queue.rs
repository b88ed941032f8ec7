//! Two-lock FIFO shared by the board threads and the event aggregator.
//!
//! Producers only ever touch the tail lock and the consumer only the head
//! lock, so a push and a pop never wait on each other. The list always starts
//! with a dummy node whose payload has already been taken; popping moves the
//! dummy role to the node that held the returned item.

use crate::QueueError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

struct Node<T> {
    slot: Mutex<Slot<T>>,
}

struct Slot<T> {
    item: Option<T>,
    next: Option<Arc<Node<T>>>,
}

impl<T> Node<T> {
    fn new(item: Option<T>) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Slot { item, next: None }),
        })
    }
}

struct Head<T> {
    node: Arc<Node<T>>,
    popped: usize,
}

pub struct ConcurrentQueue<T> {
    head: Mutex<Head<T>>,
    tail: Mutex<Arc<Node<T>>>,
    // Incremented only after the node is reachable from the head side.
    pushed: AtomicUsize,
}

impl<T> Default for ConcurrentQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConcurrentQueue<T> {
    pub fn new() -> Self {
        let dummy = Node::new(None);
        Self {
            head: Mutex::new(Head {
                node: Arc::clone(&dummy),
                popped: 0,
            }),
            tail: Mutex::new(dummy),
            pushed: AtomicUsize::new(0),
        }
    }

    /// Append `item` at the tail. Safe to call from any number of threads.
    pub fn push(&self, item: T) -> Result<(), QueueError> {
        // Allocate outside the critical section.
        let node = Node::new(Some(item));

        let mut tail = self.tail.lock().map_err(|_| QueueError::Poisoned)?;
        tail.slot
            .lock()
            .map_err(|_| QueueError::Poisoned)?
            .next = Some(Arc::clone(&node));
        *tail = node;
        self.pushed.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Take the oldest item, or `None` if the queue is currently empty.
    ///
    /// Intended for a single consumer; it never blocks on producers beyond
    /// the link of the last node.
    pub fn pop(&self) -> Option<T> {
        let mut head = self.head.lock().unwrap_or_else(PoisonError::into_inner);
        let next = head
            .node
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next
            .clone()?;
        let item = next
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .item
            .take();
        head.node = next;
        head.popped += 1;
        item
    }

    /// Number of queued items, never more than the true count.
    ///
    /// Producers that are mid-push are not counted yet.
    pub fn approx_size(&self) -> usize {
        let head = self.head.lock().unwrap_or_else(PoisonError::into_inner);
        self.pushed
            .load(Ordering::Acquire)
            .saturating_sub(head.popped)
    }

    pub fn is_empty(&self) -> bool {
        let head = self.head.lock().unwrap_or_else(PoisonError::into_inner);
        let empty = head
            .node
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next
            .is_none();
        empty
    }
}

impl<T> Drop for ConcurrentQueue<T> {
    fn drop(&mut self) {
        // Unlink iteratively so a long backlog does not recurse through Arc drops.
        let head = self.head.get_mut().unwrap_or_else(PoisonError::into_inner);
        let mut next = head
            .node
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next
            .take();
        while let Some(node) = next {
            next = match Arc::try_unwrap(node) {
                Ok(node) => node
                    .slot
                    .into_inner()
                    .unwrap_or_else(PoisonError::into_inner)
                    .next,
                // The tail still holds this one; it is the last node.
                Err(_) => None,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_empty_pop() {
        let queue: ConcurrentQueue<u32> = ConcurrentQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.approx_size(), 0);
    }

    #[test]
    fn test_fifo_single_thread() {
        let queue = ConcurrentQueue::new();
        for i in 0..10 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.approx_size(), 10);
        for i in 0..10 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());

        // The last popped node is the new dummy; pushing after it must work.
        queue.push(42).unwrap();
        assert_eq!(queue.pop(), Some(42));
    }

    #[test]
    fn test_fifo_per_producer() {
        let queue = Arc::new(ConcurrentQueue::new());
        let producers = 4;
        let per_producer = 10_000;

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for seq in 0..per_producer {
                        queue.push((p, seq)).unwrap();
                    }
                })
            })
            .collect();

        // Consume concurrently with the producers.
        let mut next_expected = vec![0usize; producers];
        let mut received = 0;
        while received < producers * per_producer {
            match queue.pop() {
                Some((p, seq)) => {
                    assert_eq!(seq, next_expected[p], "producer {p} out of order");
                    next_expected[p] += 1;
                    received += 1;
                }
                None => thread::yield_now(),
            }
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(next_expected.iter().all(|&n| n == per_producer));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_approx_size_never_overcounts() {
        let queue = Arc::new(ConcurrentQueue::new());
        // Reference count: incremented before a push starts, decremented after a pop.
        // approx_size may lag behind it but must never exceed it.
        let outstanding = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let outstanding = Arc::clone(&outstanding);
                thread::spawn(move || {
                    for i in 0..5_000u32 {
                        outstanding.fetch_add(1, Ordering::SeqCst);
                        queue.push(i).unwrap();
                    }
                })
            })
            .collect();

        let mut popped = 0;
        while popped < 15_000 {
            let approx = queue.approx_size();
            assert!(approx <= outstanding.load(Ordering::SeqCst));
            if queue.pop().is_some() {
                outstanding.fetch_sub(1, Ordering::SeqCst);
                popped += 1;
            }
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(queue.approx_size(), 0);
    }

    #[test]
    fn test_drop_with_backlog() {
        let queue = ConcurrentQueue::new();
        for i in 0..200_000u64 {
            queue.push(vec![i]).unwrap();
        }
        queue.pop();
        drop(queue);
    }
}
