//! Running units of work in the background.
//!
//! A `Dispatcher` takes a closure and makes sure it runs to completion independently of
//! the caller, without telling anyone when it is done. Anything that needs to know about
//! completion has to be built into the closure itself (see `ForkJoinBarrier`).
//!
//! Dispatchers never drop work: when they can't schedule it they run it on the calling
//! thread instead.

use crate::core::job::Job;
use crate::parallel_for::{ParallelFor, RangeIndex};
use crate::ThreadPool;

use std::ops::Range;
use std::thread;

pub trait Dispatcher {
    /// Arrange for the job to be executed, possibly on another thread.
    fn dispatch_job(&self, job: Job);

    #[inline]
    fn dispatch<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
        Self: Sized,
    {
        self.dispatch_job(Job::new(work))
    }

    /// Run a function over a range of indices in parallel using this dispatcher.
    #[inline]
    fn parallel_for<T: RangeIndex>(&self, range: Range<T>) -> ParallelFor<'_, T, Self>
    where Self: Sized
    {
        ParallelFor::new(self, range)
    }
}

/// Spawns a new thread for each unit of work.
///
/// If the thread can't be spawned, the work is executed on the calling thread.
#[derive(Clone, Debug, Default)]
pub struct SpawnDispatcher {
    name: Option<String>,
    stack_size: Option<usize>,
}

impl SpawnDispatcher {
    pub fn new() -> Self {
        SpawnDispatcher::default()
    }

    pub fn with_thread_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }
}

impl Dispatcher for SpawnDispatcher {
    fn dispatch_job(&self, job: Job) {
        profiling::scope!("spawn");

        let mut builder = thread::Builder::new();
        if let Some(name) = &self.name {
            builder = builder.name(name.clone());
        }
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }

        // The job is handed back through the slot if spawning fails, since the closure
        // that owns it is dropped along with the error.
        let slot = std::sync::Arc::new(std::sync::Mutex::new(Some(job)));
        let thread_slot = slot.clone();

        let spawned = builder.spawn(move || {
            let job = thread_slot.lock().unwrap().take();
            if let Some(job) = job {
                job.execute();
            }
        });

        if let Err(err) = spawned {
            log::warn!("Failed to spawn a thread ({}), running job on the calling thread", err);
            let job = slot.lock().unwrap().take();
            if let Some(job) = job {
                job.execute();
            }
        }
    }
}

/// Executes work immediately on the calling thread.
///
/// Useful to get deterministic, single-threaded behavior when debugging.
#[derive(Copy, Clone, Debug, Default)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn dispatch_job(&self, job: Job) {
        job.execute();
    }
}

/// Run a function in the background on the global thread pool.
///
/// If the global thread pool isn't available the function runs on the calling thread.
pub fn dispatch<F>(work: F)
where F: FnOnce() + Send + 'static
{
    match ThreadPool::global() {
        Some(pool) => pool.dispatch(work),
        None => {
            log::warn!("No global thread pool, running job on the calling thread");
            InlineDispatcher.dispatch(work);
        }
    }
}

#[test]
fn test_dispatch_global() {
    use std::sync::mpsc;

    let (tx, rx) = mpsc::channel();
    for i in 0..100u32 {
        let tx = tx.clone();
        dispatch(move || { tx.send(i).unwrap(); });
    }
    drop(tx);

    let mut received: Vec<u32> = rx.iter().collect();
    received.sort();
    assert_eq!(received, (0..100).collect::<Vec<_>>());
}

#[test]
fn test_spawn_dispatcher() {
    use std::sync::mpsc;

    let dispatcher = SpawnDispatcher::new().with_thread_name("spawned");
    let (tx, rx) = mpsc::channel();
    dispatcher.dispatch(move || {
        tx.send(thread::current().name().map(str::to_string)).unwrap();
    });

    assert_eq!(rx.recv().unwrap().as_deref(), Some("spawned"));
}

#[test]
fn test_inline_dispatcher() {
    let caller = thread::current().id();
    let (tx, rx) = std::sync::mpsc::channel();
    InlineDispatcher.dispatch(move || { tx.send(thread::current().id()).unwrap(); });
    assert_eq!(rx.try_recv().unwrap(), caller);
}

#[test]
fn test_pool_job_panic_keeps_worker_alive() {
    use std::sync::mpsc;

    let pool = ThreadPool::builder().with_worker_threads(1).build().unwrap();
    pool.dispatch(|| panic!("job failure"));

    let (tx, rx) = mpsc::channel();
    pool.dispatch(move || { tx.send(42).unwrap(); });
    assert_eq!(rx.recv().unwrap(), 42);

    pool.shut_down().wait();
}
