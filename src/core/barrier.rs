use super::sync::{Ordering, AtomicU32, Mutex, Condvar, Arc};

/// The fork-join synchronization utility.
///
/// A barrier is created with the number of workers that will report to it. Each worker
/// calls `worker_done` exactly once when its share of the work is over, and a single
/// thread calls `join` to block until all of them have done so.
///
/// Everything a worker wrote before calling `worker_done` is visible to the thread that
/// returns from `join`.
///
/// The barrier is typically shared via an `Arc` so that workers that are still in the
/// process of signaling keep it alive even after the joining thread has observed the
/// count reach zero.
pub struct ForkJoinBarrier {
    // The number of workers that haven't reported yet.
    remaining: AtomicU32,
    // Workers signal the condition variable every time they report, whether or not they
    // are the last one. The joining thread re-checks `remaining` after every wake up.
    mutex: Mutex<()>,
    cond: Condvar,
}

impl ForkJoinBarrier {
    pub fn new(num_workers: u32) -> Self {
        ForkJoinBarrier {
            remaining: AtomicU32::new(num_workers),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn new_shared(num_workers: u32) -> Arc<Self> {
        Arc::new(ForkJoinBarrier::new(num_workers))
    }

    /// Number of workers that haven't called `worker_done` yet.
    #[inline]
    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.remaining() == 0
    }

    /// Report the completion of one worker.
    ///
    /// Returns true if this was the last worker.
    ///
    /// Panics if called more times than the number of workers the barrier was
    /// created with.
    pub fn worker_done(&self) -> bool {
        profiling::scope!("worker_done");

        let prev = self.remaining.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |n| n.checked_sub(1),
        );

        let prev = match prev {
            Ok(prev) => prev,
            Err(_) => panic!("ForkJoinBarrier: more workers reported than expected"),
        };

        // Taking the lock here means the joining thread is either before its check of
        // `remaining` (and will see our decrement) or already waiting on the condvar
        // (and will get the notification).
        std::mem::drop(self.mutex.lock().unwrap());
        self.cond.notify_all();

        prev == 1
    }

    /// Block the current thread until all workers have reported.
    pub fn join(&self) {
        profiling::scope!("join");

        if self.is_done() {
            return;
        }

        let mut guard = self.mutex.lock().unwrap();
        while self.remaining.load(Ordering::Acquire) > 0 {
            guard = self.cond.wait(guard).unwrap();
        }
    }

    /// Like `join`, but try to make progress via `assist` before putting the thread
    /// to sleep.
    ///
    /// `assist` should execute one unit of the work this barrier is waiting on and return
    /// false if none is left to claim. This is what prevents a thread pool worker waiting
    /// on work that is queued behind it from deadlocking. It must not pick up unrelated
    /// work, which could block the joining thread for an unbounded amount of time.
    pub fn join_with<F>(&self, mut assist: F)
    where F: FnMut() -> bool
    {
        profiling::scope!("join_with");

        loop {
            if self.is_done() {
                return;
            }

            if assist() {
                continue;
            }

            let guard = self.mutex.lock().unwrap();
            if self.remaining.load(Ordering::Acquire) > 0 {
                // A single wait, then back to the top: there may be work to pick up now.
                let _guard = self.cond.wait(guard).unwrap();
            }
        }
    }
}

/// Calls `worker_done` on the barrier when dropped, including while unwinding.
pub(crate) struct DoneOnDrop {
    barrier: Arc<ForkJoinBarrier>,
}

impl DoneOnDrop {
    pub fn new(barrier: Arc<ForkJoinBarrier>) -> Self {
        DoneOnDrop { barrier }
    }
}

impl Drop for DoneOnDrop {
    fn drop(&mut self) {
        self.barrier.worker_done();
    }
}

#[cfg(not(loom))]
#[test]
fn test_empty_barrier() {
    let barrier = ForkJoinBarrier::new(0);
    assert!(barrier.is_done());
    barrier.join();
    barrier.join_with(|| panic!("nothing to assist"));
}

#[cfg(not(loom))]
#[test]
#[should_panic]
fn test_barrier_underflow() {
    let barrier = ForkJoinBarrier::new(1);
    barrier.worker_done();
    barrier.worker_done();
}

#[cfg(not(loom))]
#[test]
fn test_barrier_threads() {
    use std::sync::atomic::AtomicU32;

    for num_workers in 1..16 {
        let barrier = ForkJoinBarrier::new_shared(num_workers);
        let counter = Arc::new(AtomicU32::new(0));
        let mut last = Vec::new();

        for i in 0..num_workers {
            let barrier = barrier.clone();
            let counter = counter.clone();
            last.push(std::thread::spawn(move || {
                if i % 2 == 0 {
                    std::thread::yield_now();
                }
                counter.fetch_add(1, Ordering::Relaxed);
                barrier.worker_done()
            }));
        }

        barrier.join();

        assert_eq!(counter.load(Ordering::Relaxed), num_workers);
        assert_eq!(barrier.remaining(), 0);

        let num_last = last.into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|was_last| *was_last)
            .count();
        assert_eq!(num_last, 1);
    }
}

#[cfg(not(loom))]
#[test]
fn test_barrier_assist() {
    let barrier = ForkJoinBarrier::new_shared(3);
    let mut assisted = 0;
    barrier.join_with(|| {
        if barrier.is_done() {
            return false;
        }
        assisted += 1;
        barrier.worker_done();
        true
    });

    assert_eq!(assisted, 3);
}

#[cfg(loom)]
#[test]
fn test_loom_barrier() {
    use super::sync::thread;

    loom::model(|| {
        let barrier = ForkJoinBarrier::new_shared(2);
        let output = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..2u32).map(|i| {
            let barrier = barrier.clone();
            let output = output.clone();
            thread::spawn(move || {
                let _done = DoneOnDrop::new(barrier);
                output.lock().unwrap().push(i);
            })
        }).collect();

        barrier.join();

        assert_eq!(output.lock().unwrap().len(), 2);

        for handle in handles {
            handle.join().unwrap();
        }
    });
}
