//! Intrusive task queues: the FIFO runqueue and the wake-ordered sleep
//! list. Links thread through `Task::next`; a task is on at most one queue
//! at a time, which the scheduler lock enforces.

use super::task::{Task, TaskState};

/// FIFO runqueue.
pub struct RunQueue {
    head: *mut Task,
    tail: *mut Task,
}

// SAFETY: Only touched under the scheduler lock.
unsafe impl Send for RunQueue {}

impl RunQueue {
    /// An empty queue.
    pub const fn new() -> Self {
        Self {
            head: core::ptr::null_mut(),
            tail: core::ptr::null_mut(),
        }
    }

    /// Returns whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Appends a runnable task at the tail.
    ///
    /// # Safety
    ///
    /// `task` must be live, runnable, and on no other queue.
    pub unsafe fn enqueue(&mut self, task: *mut Task) {
        // SAFETY: Caller guarantees the task is live and unlinked.
        unsafe {
            debug_assert_eq!((*task).state, TaskState::Runnable);
            (*task).next = core::ptr::null_mut();
            if self.head.is_null() {
                self.head = task;
                self.tail = task;
            } else {
                (*self.tail).next = task;
                self.tail = task;
            }
        }
    }

    /// Pops the head, or null when empty.
    pub fn dequeue(&mut self) -> *mut Task {
        let task = self.head;
        if !task.is_null() {
            // SAFETY: Head tasks are live while linked.
            unsafe {
                self.head = (*task).next;
                if self.head.is_null() {
                    self.tail = core::ptr::null_mut();
                }
                (*task).next = core::ptr::null_mut();
            }
        }
        task
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep list ordered by ascending `wake_tick`.
pub struct SleepList {
    head: *mut Task,
}

// SAFETY: Only touched under the scheduler lock.
unsafe impl Send for SleepList {}

impl SleepList {
    /// An empty list.
    pub const fn new() -> Self {
        Self {
            head: core::ptr::null_mut(),
        }
    }

    /// Inserts a task at its wake position (stable for equal deadlines).
    ///
    /// # Safety
    ///
    /// `task` must be live, blocked with `wake_tick` set, and unlinked.
    pub unsafe fn insert(&mut self, task: *mut Task) {
        // SAFETY: Caller guarantees liveness; links are list-owned.
        unsafe {
            (*task).next = core::ptr::null_mut();
            if self.head.is_null() || (*task).wake_tick < (*self.head).wake_tick {
                (*task).next = self.head;
                self.head = task;
                return;
            }
            let mut cur = self.head;
            while !(*cur).next.is_null() && (*(*cur).next).wake_tick <= (*task).wake_tick {
                cur = (*cur).next;
            }
            (*task).next = (*cur).next;
            (*cur).next = task;
        }
    }

    /// Unlinks `task` if present. Returns whether it was found.
    ///
    /// # Safety
    ///
    /// `task` must be a live task pointer.
    pub unsafe fn remove(&mut self, task: *mut Task) -> bool {
        if self.head.is_null() {
            return false;
        }
        // SAFETY: All links are live while listed.
        unsafe {
            if self.head == task {
                self.head = (*task).next;
                (*task).next = core::ptr::null_mut();
                return true;
            }
            let mut cur = self.head;
            while !(*cur).next.is_null() {
                if (*cur).next == task {
                    (*cur).next = (*task).next;
                    (*task).next = core::ptr::null_mut();
                    return true;
                }
                cur = (*cur).next;
            }
        }
        false
    }

    /// Pops every task whose deadline has passed, handing each to `f`.
    pub fn drain_due(&mut self, now: u64, mut f: impl FnMut(*mut Task)) {
        // SAFETY: Head tasks are live while listed; each is unlinked before
        // the callback sees it.
        unsafe {
            while !self.head.is_null() && (*self.head).wake_tick <= now {
                let task = self.head;
                self.head = (*task).next;
                (*task).next = core::ptr::null_mut();
                f(task);
            }
        }
    }

    /// Returns the earliest wake deadline, if any task sleeps.
    pub fn next_deadline(&self) -> Option<u64> {
        if self.head.is_null() {
            None
        } else {
            // SAFETY: The head is live while listed.
            Some(unsafe { (*self.head).wake_tick })
        }
    }
}

impl Default for SleepList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaked_task(id: u64) -> *mut Task {
        Box::into_raw(Box::new(Task::new(id, "t")))
    }

    fn sleeper(id: u64, wake_tick: u64) -> *mut Task {
        let t = leaked_task(id);
        unsafe {
            (*t).state = TaskState::Blocked;
            (*t).wake_tick = wake_tick;
        }
        t
    }

    fn reclaim(t: *mut Task) {
        drop(unsafe { Box::from_raw(t) });
    }

    #[test]
    fn runqueue_is_fifo() {
        let mut q = RunQueue::new();
        let (a, b, c) = (leaked_task(1), leaked_task(2), leaked_task(3));
        unsafe {
            q.enqueue(a);
            q.enqueue(b);
            q.enqueue(c);
        }
        assert_eq!(q.dequeue(), a);
        assert_eq!(q.dequeue(), b);
        assert_eq!(q.dequeue(), c);
        assert!(q.dequeue().is_null());
        assert!(q.is_empty());
        for t in [a, b, c] {
            reclaim(t);
        }
    }

    #[test]
    fn requeue_goes_to_tail() {
        let mut q = RunQueue::new();
        let (a, b) = (leaked_task(1), leaked_task(2));
        unsafe {
            q.enqueue(a);
            q.enqueue(b);
        }
        let first = q.dequeue();
        unsafe { q.enqueue(first) };
        assert_eq!(q.dequeue(), b);
        assert_eq!(q.dequeue(), a);
        for t in [a, b] {
            reclaim(t);
        }
    }

    #[test]
    fn sleep_list_orders_by_deadline() {
        let mut list = SleepList::new();
        let (a, b, c) = (sleeper(1, 30), sleeper(2, 10), sleeper(3, 20));
        unsafe {
            list.insert(a);
            list.insert(b);
            list.insert(c);
        }
        assert_eq!(list.next_deadline(), Some(10));

        let mut order = Vec::new();
        list.drain_due(u64::MAX, |t| order.push(unsafe { (*t).id }));
        assert_eq!(order, vec![2, 3, 1]);
        for t in [a, b, c] {
            reclaim(t);
        }
    }

    #[test]
    fn equal_deadlines_drain_in_insert_order() {
        let mut list = SleepList::new();
        let (a, b) = (sleeper(1, 5), sleeper(2, 5));
        unsafe {
            list.insert(a);
            list.insert(b);
        }
        let mut order = Vec::new();
        list.drain_due(5, |t| order.push(unsafe { (*t).id }));
        assert_eq!(order, vec![1, 2]);
        for t in [a, b] {
            reclaim(t);
        }
    }

    #[test]
    fn drain_stops_at_future_deadlines() {
        let mut list = SleepList::new();
        let (a, b) = (sleeper(1, 5), sleeper(2, 50));
        unsafe {
            list.insert(a);
            list.insert(b);
        }
        let mut woken = Vec::new();
        list.drain_due(10, |t| woken.push(unsafe { (*t).id }));
        assert_eq!(woken, vec![1]);
        assert_eq!(list.next_deadline(), Some(50));
        list.drain_due(50, |t| woken.push(unsafe { (*t).id }));
        assert_eq!(woken, vec![1, 2]);
        for t in [a, b] {
            reclaim(t);
        }
    }

    #[test]
    fn remove_unlinks_middle_and_head() {
        let mut list = SleepList::new();
        let (a, b, c) = (sleeper(1, 1), sleeper(2, 2), sleeper(3, 3));
        unsafe {
            list.insert(a);
            list.insert(b);
            list.insert(c);

            assert!(list.remove(b));
            assert!(!list.remove(b), "double remove must fail");
            assert!(list.remove(a));
        }
        assert_eq!(list.next_deadline(), Some(3));
        unsafe { assert!(list.remove(c)) };
        assert_eq!(list.next_deadline(), None);
        for t in [a, b, c] {
            reclaim(t);
        }
    }
}
