use super::{Shared, WorkerHook, MAX_WORKER_THREADS};
use super::sync::Arc;
use super::shutdown::{Shutdown, ShutdownHandle};
use super::job::Job;
use crate::dispatch::Dispatcher;
use crate::util::hardware_concurrency;
use crate::Error;

use std::sync::OnceLock;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ThreadPoolId(pub(crate) u32);

/// A reference to a thread pool.
#[derive(Clone)]
pub struct ThreadPool {
    pub(crate) shared: Arc<Shared>,
}

static GLOBAL_POOL: OnceLock<Option<ThreadPool>> = OnceLock::new();

impl ThreadPool {
    /// The default builder creates one worker per hardware thread.
    pub fn builder() -> ThreadPoolBuilder {
        ThreadPoolBuilder {
            num_threads: (hardware_concurrency() as u32).min(MAX_WORKER_THREADS),
            max_pending_jobs: None,
            start_handler: None,
            exit_handler: None,
            name_handler: Box::new(|idx| format!("Worker#{}", idx)),
            stack_size: None,
        }
    }

    /// The process-wide pool used by the free functions `dispatch` and `parallel_for`.
    ///
    /// It is created with the default builder the first time it is requested and never
    /// shut down. Returns None if the worker threads could not be spawned.
    pub fn global() -> Option<&'static ThreadPool> {
        GLOBAL_POOL.get_or_init(|| {
            ThreadPool::builder()
                .with_thread_names(|idx| format!("parfor#{}", idx))
                .build()
                .map_err(|err| log::error!("Failed to create the global thread pool: {}", err))
                .ok()
        }).as_ref()
    }

    pub fn shut_down(&self) -> ShutdownHandle {
        Shutdown::begin_shut_down(Arc::clone(&self.shared))
    }

    /// Whether all worker threads have exited.
    pub fn has_shut_down(&self) -> bool {
        self.shared.shutdown.has_shut_down()
    }

    pub fn id(&self) -> ThreadPoolId {
        self.shared.id
    }

    pub fn num_worker_threads(&self) -> u32 { self.shared.num_workers }

    /// Number of jobs waiting for a worker.
    pub fn pending_jobs(&self) -> usize { self.shared.queue.len() }
}

impl Dispatcher for ThreadPool {
    fn dispatch_job(&self, job: Job) {
        self.shared.dispatch(job);
    }
}

pub struct ThreadPoolBuilder {
    pub(crate) num_threads: u32,
    pub(crate) max_pending_jobs: Option<usize>,
    pub(crate) start_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) exit_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) name_handler: Box<dyn Fn(u32) -> String>,
    pub(crate) stack_size: Option<usize>,
}

impl ThreadPoolBuilder {
    pub fn with_start_handler<F>(mut self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        self.start_handler = Some(Box::new(handler));

        self
    }

    pub fn with_exit_handler<F>(mut self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        self.exit_handler = Some(Box::new(handler));

        self
    }

    pub fn with_thread_names<F>(mut self, handler: F) -> Self
    where F: Fn(u32) -> String + 'static
    {
        self.name_handler = Box::new(handler);

        self
    }

    pub fn with_worker_threads(mut self, num_threads: u32) -> Self {
        self.num_threads = num_threads.max(1);

        // We are limited to 64 workers because of the sleepy worker bitfield.
        assert!(self.num_threads <= MAX_WORKER_THREADS);

        self
    }

    /// Beyond this many queued jobs, dispatching runs the job on the calling thread
    /// instead of queuing it.
    pub fn with_max_pending_jobs(mut self, max: usize) -> Self {
        self.max_pending_jobs = Some(max);

        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);

        self
    }

    pub fn build(self) -> Result<ThreadPool, Error> {
        crate::core::init(self)
    }
}

#[test]
fn test_builder_clamps_threads() {
    let pool = ThreadPool::builder().with_worker_threads(0).build().unwrap();
    assert_eq!(pool.num_worker_threads(), 1);
    pool.shut_down().wait();

    let pool = ThreadPool::builder().build().unwrap();
    assert!(pool.num_worker_threads() >= 1);
    assert!(pool.num_worker_threads() <= MAX_WORKER_THREADS);
    pool.shut_down().wait();
}

#[test]
#[should_panic]
fn test_builder_too_many_threads() {
    let _ = ThreadPool::builder().with_worker_threads(MAX_WORKER_THREADS + 1);
}

#[test]
fn test_global_pool() {
    let a = ThreadPool::global().unwrap();
    let b = ThreadPool::global().unwrap();
    assert_eq!(a.id(), b.id());
    assert!(!a.has_shut_down());
}

#[test]
fn test_backlog_runs_inline() {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc;

    let pool = ThreadPool::builder()
        .with_worker_threads(1)
        .with_max_pending_jobs(1)
        .build()
        .unwrap();

    // Keep the only worker busy until we are done filling the queue.
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    pool.dispatch(move || {
        started_tx.send(()).unwrap();
        let _ = release_rx.recv();
    });
    started_rx.recv().unwrap();

    let queued = Arc::new(AtomicU32::new(0));
    let q = queued.clone();
    pool.dispatch(move || { q.fetch_add(1, Ordering::SeqCst); });
    assert_eq!(pool.pending_jobs(), 1);

    let caller = std::thread::current().id();
    let inline = Arc::new(AtomicU32::new(0));
    let i = inline.clone();
    pool.dispatch(move || {
        assert_eq!(std::thread::current().id(), caller);
        i.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(inline.load(Ordering::SeqCst), 1);

    release_tx.send(()).unwrap();
    pool.shut_down().wait();

    assert_eq!(queued.load(Ordering::SeqCst), 1);
}
