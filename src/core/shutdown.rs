/// Shutdown
///
/// Workers check whether the thread pool is shutting down by reading an atomic that is
/// set when the shutdown starts, and exit once the queue is drained. A mutex/condvar pair
/// tracks the remaining number of workers to shut down so that we can wait on it.
///
/// Once shut down, a pool keeps accepting work but runs it on the dispatching thread.

use crate::sync::{Ordering, AtomicBool, Mutex, Condvar, Arc};

use crate::core::Shared;

pub(crate) struct Shutdown {
    pub is_shutting_down: AtomicBool,
    pub shutdown_mutex: Mutex<u32>,
    pub shutdown_cond: Condvar,
}

impl Shutdown {
    pub fn new(num_threads: u32) -> Self {
        Shutdown {
            is_shutting_down: AtomicBool::new(false),
            shutdown_mutex: Mutex::new(num_threads),
            shutdown_cond: Condvar::new(),
        }
    }

    pub fn begin_shut_down(shared: Arc<Shared>) -> ShutdownHandle {
        log::debug!("Shutting down thread pool {:?}", shared.id);

        shared.shutdown.is_shutting_down.store(true, Ordering::SeqCst);

        shared.sleep.wake_all();

        ShutdownHandle { shared }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    pub fn has_shut_down(&self) -> bool {
        self.is_shutting_down() && *self.shutdown_mutex.lock().unwrap() == 0
    }

    pub fn wait_shutdown(&self) {
        let mut num_workers = self.shutdown_mutex.lock().unwrap();
        while *num_workers > 0 {
            num_workers = self.shutdown_cond.wait(num_workers).unwrap();
        }
    }

    pub fn worker_has_shut_down(&self) {
        let mut num_workers = self.shutdown_mutex.lock().unwrap();
        *num_workers -= 1;
        if *num_workers == 0 {
            self.shutdown_cond.notify_all();
        }
    }

    /// Remove workers that were never started from the count.
    pub fn forget_workers(&self, n: u32) {
        let mut num_workers = self.shutdown_mutex.lock().unwrap();
        *num_workers -= n;
        if *num_workers == 0 {
            self.shutdown_cond.notify_all();
        }
    }
}

pub struct ShutdownHandle {
    shared: Arc<Shared>
}

impl ShutdownHandle {
    /// Block until all worker threads have exited.
    pub fn wait(self) {
        self.shared.shutdown.wait_shutdown();
        log::debug!("Thread pool {:?} shut down", self.shared.id);
    }
}

#[test]
fn test_shutdown() {
    use std::sync::atomic::AtomicU32;
    use crate::ThreadPool;
    static INITIALIZED_WORKERS: AtomicU32 = AtomicU32::new(0);
    static SHUTDOWN_WORKERS: AtomicU32 = AtomicU32::new(0);

    for _ in 0..20 {
        for num_threads in [1, 2, 3, 7, 16, 33, 64] {
            INITIALIZED_WORKERS.store(0, Ordering::SeqCst);
            SHUTDOWN_WORKERS.store(0, Ordering::SeqCst);

            let pool = ThreadPool::builder()
                .with_worker_threads(num_threads)
                .with_start_handler(|_id| { INITIALIZED_WORKERS.fetch_add(1, Ordering::SeqCst); })
                .with_exit_handler(|_id| { SHUTDOWN_WORKERS.fetch_add(1, Ordering::SeqCst); })
                .build()
                .unwrap();

            let handle = pool.shut_down();
            handle.wait();

            assert!(pool.has_shut_down());
            assert_eq!(INITIALIZED_WORKERS.load(Ordering::SeqCst), num_threads);
            assert_eq!(SHUTDOWN_WORKERS.load(Ordering::SeqCst), num_threads);
        }
    }
}

#[test]
fn test_dispatch_after_shutdown_runs_inline() {
    use std::sync::atomic::AtomicU32;
    use crate::{ThreadPool, Dispatcher};

    let pool = ThreadPool::builder().with_worker_threads(2).build().unwrap();
    pool.shut_down().wait();

    let counter = Arc::new(AtomicU32::new(0));
    let c = counter.clone();
    let caller = std::thread::current().id();
    pool.dispatch(move || {
        assert_eq!(std::thread::current().id(), caller);
        c.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_shutdown_drains_queue() {
    use std::sync::atomic::AtomicU32;
    use crate::{ThreadPool, Dispatcher};

    let pool = ThreadPool::builder().with_worker_threads(2).build().unwrap();

    let counter = Arc::new(AtomicU32::new(0));
    for _ in 0..1000 {
        let c = counter.clone();
        pool.dispatch(move || { c.fetch_add(1, Ordering::SeqCst); });
    }

    pool.shut_down().wait();

    assert_eq!(counter.load(Ordering::SeqCst), 1000);
}
