// Thread-safe multi-queue dequeue (L0.9, 4.9): hands work produced on
// the event thread over to the presenter/render thread.
//
// Grounded on the mpsc `Task` channel this crate's renderer plumbing
// is descended from, generalized from "one channel, one consumer"
// into named queues with per-queue callbacks and a depth-first or
// breadth-first draining *proc*.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Draining order when a *proc* owns more than one queue (4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Fully drain queue 0, then queue 1, ...
    DepthFirst,
    /// Take one item from each non-empty queue in turn.
    BreadthFirst,
}

type Callback<T> = dyn Fn(&T) + Send + Sync;

struct Queue<T> {
    items: VecDeque<T>,
    callback: Option<Arc<Callback<T>>>,
}

/// A bounded FIFO + multi-queue dequeue. Each named queue is FIFO;
/// `enqueue_first` jumps the line within its queue.
pub struct Deq<T> {
    queues: Mutex<Vec<Queue<T>>>,
    condvar: Condvar,
    is_processing: AtomicBool,
    destroyed: AtomicBool,
}

impl<T: Send + 'static> Deq<T> {
    pub fn new(queue_count: usize) -> Arc<Self> {
        let mut queues = Vec::with_capacity(queue_count);
        for _ in 0..queue_count {
            queues.push(Queue {
                items: VecDeque::new(),
                callback: None,
            });
        }

        Arc::new(Deq {
            queues: Mutex::new(queues),
            condvar: Condvar::new(),
            is_processing: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Registers a callback invoked for every item drained from
    /// `queue_idx` by `proc` (4.9: `callback(queue_idx, type, fn)`;
    /// the `type` discriminant is folded into `T` itself here).
    pub fn callback(&self, queue_idx: usize, f: impl Fn(&T) + Send + Sync + 'static) {
        let mut queues = self.queues.lock().unwrap();
        queues[queue_idx].callback = Some(Arc::new(f));
    }

    pub fn enqueue(&self, queue_idx: usize, item: T) {
        {
            let mut queues = self.queues.lock().unwrap();
            queues[queue_idx].items.push_back(item);
        }
        self.condvar.notify_all();
    }

    pub fn enqueue_first(&self, queue_idx: usize, item: T) {
        {
            let mut queues = self.queues.lock().unwrap();
            queues[queue_idx].items.push_front(item);
        }
        self.condvar.notify_all();
    }

    /// Pops one item from `queue_idx`. If `wait` is true, blocks until
    /// an item is available or `max_wait` elapses (`None` = block
    /// indefinitely, matching "if zero, blocks indefinitely" for the
    /// no-timeout case).
    pub fn dequeue(&self, queue_idx: usize, wait: bool, max_wait: Option<Duration>) -> Option<T> {
        let mut queues = self.queues.lock().unwrap();

        if !wait {
            return queues[queue_idx].items.pop_front();
        }

        let deadline = max_wait.map(|d| Instant::now() + d);
        loop {
            if let Some(item) = queues[queue_idx].items.pop_front() {
                return Some(item);
            }
            if self.destroyed.load(Ordering::Acquire) {
                return None;
            }

            queues = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (q, timeout_result) =
                        self.condvar.wait_timeout(queues, deadline - now).unwrap();
                    if timeout_result.timed_out() {
                        return q.into_iter().next().and_then(|mut qs| qs.items.pop_front());
                    }
                    q
                }
                None => self.condvar.wait(queues).unwrap(),
            };
        }
    }

    /// Drains every currently-queued item from `queue_idx` at once.
    pub fn dequeue_batch(&self, queue_idx: usize) -> Vec<T> {
        let mut queues = self.queues.lock().unwrap();
        queues[queue_idx].items.drain(..).collect()
    }

    /// Blocks until `queue_idx` is non-empty or `max_wait` elapses,
    /// without consuming anything.
    pub fn wait(&self, queue_idx: usize, max_wait: Option<Duration>) -> bool {
        let mut queues = self.queues.lock().unwrap();
        let deadline = max_wait.map(|d| Instant::now() + d);

        while queues[queue_idx].items.is_empty() {
            if self.destroyed.load(Ordering::Acquire) {
                return false;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (q, timeout_result) =
                        self.condvar.wait_timeout(queues, deadline - now).unwrap();
                    queues = q;
                    if timeout_result.timed_out() && queues[queue_idx].items.is_empty() {
                        return false;
                    }
                }
                None => {
                    queues = self.condvar.wait(queues).unwrap();
                }
            }
        }
        true
    }

    /// Drains `queue_ids` according to `strategy`, releasing the
    /// queues' mutex before invoking each callback so a callback may
    /// re-enqueue without deadlocking (4.9).
    pub fn proc(&self, queue_ids: &[usize], strategy: Strategy) {
        if self
            .is_processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        match strategy {
            Strategy::DepthFirst => {
                for &queue_idx in queue_ids {
                    while self.drain_one_item(queue_idx) {}
                }
            }
            Strategy::BreadthFirst => loop {
                let mut any = false;
                for &queue_idx in queue_ids {
                    if self.drain_one_item(queue_idx) {
                        any = true;
                    }
                }
                if !any {
                    break;
                }
            },
        }

        self.is_processing.store(false, Ordering::Release);
    }

    /// Pops one item and its queue's callback (if any) under the
    /// lock, then drops the lock before invoking the callback so a
    /// re-entrant `enqueue` from within it doesn't deadlock.
    fn drain_one_item(&self, queue_idx: usize) -> bool {
        let (item, callback) = {
            let mut queues = self.queues.lock().unwrap();
            match queues[queue_idx].items.pop_front() {
                Some(item) => (Some(item), queues[queue_idx].callback.clone()),
                None => (None, None),
            }
        };

        match item {
            Some(item) => {
                if let Some(cb) = callback {
                    cb(&item);
                }
                true
            }
            None => false,
        }
    }

    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn enqueue_dequeue_is_fifo() {
        let deq: Arc<Deq<u32>> = Deq::new(1);
        deq.enqueue(0, 1);
        deq.enqueue(0, 2);
        deq.enqueue(0, 3);
        assert_eq!(deq.dequeue(0, false, None), Some(1));
        assert_eq!(deq.dequeue(0, false, None), Some(2));
        assert_eq!(deq.dequeue(0, false, None), Some(3));
        assert_eq!(deq.dequeue(0, false, None), None);
    }

    #[test]
    fn enqueue_first_jumps_the_line() {
        let deq: Arc<Deq<u32>> = Deq::new(1);
        deq.enqueue(0, 1);
        deq.enqueue_first(0, 2);
        assert_eq!(deq.dequeue(0, false, None), Some(2));
        assert_eq!(deq.dequeue(0, false, None), Some(1));
    }

    #[test]
    fn dequeue_batch_drains_everything() {
        let deq: Arc<Deq<u32>> = Deq::new(1);
        deq.enqueue(0, 1);
        deq.enqueue(0, 2);
        let batch = deq.dequeue_batch(0);
        assert_eq!(batch, vec![1, 2]);
        assert!(deq.dequeue_batch(0).is_empty());
    }

    #[test]
    fn proc_depth_first_drains_callback_queue() {
        let deq: Arc<Deq<u32>> = Deq::new(2);
        let seen: Arc<Mutex<Vec<(usize, u32)>>> = Arc::new(Mutex::new(Vec::new()));

        for idx in 0..2 {
            let seen = seen.clone();
            deq.callback(idx, move |item: &u32| {
                seen.lock().unwrap().push((idx, *item));
            });
        }

        deq.enqueue(0, 1);
        deq.enqueue(0, 2);
        deq.enqueue(1, 3);

        deq.proc(&[0, 1], Strategy::DepthFirst);

        let order = seen.lock().unwrap().clone();
        assert_eq!(order, vec![(0, 1), (0, 2), (1, 3)]);
    }

    #[test]
    fn proc_breadth_first_interleaves_queues() {
        let deq: Arc<Deq<u32>> = Deq::new(2);
        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        for idx in 0..2 {
            let seen = seen.clone();
            deq.callback(idx, move |_: &u32| seen.lock().unwrap().push(idx));
        }

        deq.enqueue(0, 1);
        deq.enqueue(0, 2);
        deq.enqueue(1, 3);
        deq.proc(&[0, 1], Strategy::BreadthFirst);

        assert_eq!(seen.lock().unwrap().clone(), vec![0, 1, 0]);
    }

    #[test]
    fn wait_returns_false_once_destroyed() {
        let deq: Arc<Deq<u32>> = Deq::new(1);
        deq.destroy();
        assert!(!deq.wait(0, Some(Duration::from_millis(50))));
        assert_eq!(deq.dequeue(0, true, Some(Duration::from_millis(50))), None);
    }

    #[test]
    fn callback_can_reenqueue_without_deadlock() {
        let deq: Arc<Deq<u32>> = Deq::new(1);
        let fired = Arc::new(AtomicU32::new(0));
        let deq_for_cb = deq.clone();
        let fired_for_cb = fired.clone();
        deq.callback(0, move |item: &u32| {
            fired_for_cb.fetch_add(1, Ordering::SeqCst);
            if *item == 1 {
                deq_for_cb.enqueue(0, 2);
            }
        });

        deq.enqueue(0, 1);
        deq.proc(&[0], Strategy::DepthFirst);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
