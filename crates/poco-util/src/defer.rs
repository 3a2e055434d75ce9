//! Deferred task queue.
//!
//! Listeners registered in deferred mode do not run inside `emit`; their
//! invocations land here and execute when the owner drains the queue.
//! A drain runs exactly the tasks that were queued when it started, so a
//! task scheduled by a running task waits for the next drain.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::lock;

type Task = Box<dyn FnOnce() + Send>;

/// FIFO queue of deferred invocations.
#[derive(Default)]
pub struct DeferQueue {
    tasks: Mutex<VecDeque<Task>>,
}

impl DeferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a task for the next drain.
    pub fn push(&self, task: impl FnOnce() + Send + 'static) {
        lock(&self.tasks).push_back(Box::new(task));
    }

    /// Run every task that was queued before this call, in order.
    /// Returns how many ran. Tasks pushed while draining stay queued.
    pub fn run(&self) -> usize {
        let batch: Vec<Task> = {
            let mut tasks = lock(&self.tasks);
            let n = tasks.len();
            tasks.drain(..n).collect()
        };
        let ran = batch.len();
        for task in batch {
            task();
        }
        ran
    }

    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.tasks).is_empty()
    }
}

impl std::fmt::Debug for DeferQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferQueue").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_in_push_order() {
        let queue = DeferQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            queue.push(move || seen.lock().unwrap().push(i));
        }
        assert_eq!(queue.run(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn tasks_pushed_while_draining_wait_for_next_drain() {
        let queue = Arc::new(DeferQueue::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let q = queue.clone();
        let h = hits.clone();
        queue.push(move || {
            h.fetch_add(1, Ordering::SeqCst);
            let h2 = h.clone();
            q.push(move || {
                h2.fetch_add(1, Ordering::SeqCst);
            });
        });

        assert_eq!(queue.run(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.run(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn run_on_empty_queue_is_a_no_op() {
        let queue = DeferQueue::new();
        assert_eq!(queue.run(), 0);
    }
}
