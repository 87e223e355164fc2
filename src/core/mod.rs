pub mod job;
pub mod barrier;
pub mod thread_pool;
pub mod shutdown;
/// basic std::sync types reexported here so that we can hook loom into them for
/// testing.
pub mod sync;

use crossbeam_deque::{Injector, Steal};
use crossbeam_utils::{Backoff, CachePadded, sync::{Parker, Unparker}};

use sync::{Arc, Ordering, AtomicU64, AtomicUsize, thread};
use job::Job;
use thread_pool::{ThreadPool, ThreadPoolBuilder, ThreadPoolId};
use shutdown::Shutdown;

use crate::Error;

// Use std's atomic type explicitly here because loom's doesn't support static initialization.
static NEXT_THREADPOOL_ID: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);

/// The sleepy worker bitfield is a single 64 bits atomic.
pub const MAX_WORKER_THREADS: u32 = 64;

/// Data accessible by the pool handles and workers from any thread.
pub(crate) struct Shared {
    /// Number of dedicated worker threads.
    pub num_workers: u32,
    /// Jobs waiting to be picked up.
    pub queue: Queue,
    /// State and logic to put worker threads to sleep and wake them up.
    pub sleep: Sleep,
    /// A unique ID per thread pool, mostly useful for debugging.
    pub id: ThreadPoolId,
    /// state and logic to handle shutting down.
    pub shutdown: Shutdown,
    // A few hooks to register work
    handlers: ThreadPoolHooks,
}

pub(crate) fn init(params: ThreadPoolBuilder) -> Result<ThreadPool, Error> {
    let num_threads = params.num_threads;

    let (sleep, parkers) = Sleep::new(num_threads as usize);

    let shared = Arc::new(Shared {
        num_workers: num_threads,
        queue: Queue::new(params.max_pending_jobs),
        sleep,
        id: ThreadPoolId(NEXT_THREADPOOL_ID.fetch_add(1, Ordering::Relaxed)),
        shutdown: Shutdown::new(num_threads),
        handlers: ThreadPoolHooks {
            start: params.start_handler,
            exit: params.exit_handler,
        },
    });

    for (i, parker) in (0..num_threads).zip(parkers) {
        let mut worker = Worker {
            index: i,
            shared: shared.clone(),
            parker,
        };

        let mut builder = thread::Builder::new()
            .name((params.name_handler)(i));

        if let Some(stack_size) = params.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let spawned = builder.spawn(move || {
            profiling::register_thread!("Worker");

            worker.run();
        });

        if let Err(err) = spawned {
            log::error!("Thread pool {:?}: failed to spawn worker {}: {}", shared.id, i, err);

            // Take the workers that will never exist out of the shutdown count and
            // tear down the ones that did start.
            shared.shutdown.forget_workers(num_threads - i);
            Shutdown::begin_shut_down(Arc::clone(&shared)).wait();

            return Err(Error::ThreadSpawn(err));
        }
    }

    log::debug!("Thread pool {:?} started with {} workers", shared.id, num_threads);

    Ok(ThreadPool { shared })
}

impl Shared {
    /// Push a job to the queue, or run it on the current thread if the pool can't
    /// accept it. Jobs are never dropped.
    pub fn dispatch(&self, job: Job) {
        profiling::scope!("dispatch");

        if self.shutdown.is_shutting_down() {
            log::warn!("Thread pool {:?} is shut down, running job on the calling thread", self.id);
            job.execute();
            return;
        }

        if let Err(job) = self.queue.try_push(job) {
            log::warn!(
                "Thread pool {:?} has {} pending jobs, running job on the calling thread",
                self.id, self.queue.len(),
            );
            job.execute();
            return;
        }

        if self.shutdown.is_shutting_down() {
            // The workers may have already exited after seeing an empty queue.
            self.drain_after_shutdown();
            return;
        }

        self.sleep.wake(1);
    }

    /// Run the jobs left in the queue on the current thread once the workers may be gone.
    ///
    /// The injector can't hand back a specific job, so this also runs jobs pushed by other
    /// threads in the same window. Their panics are caught and logged like on a worker.
    fn drain_after_shutdown(&self) {
        while let Some(job) = self.queue.pop() {
            self.execute_job(job, None);
        }
    }

    fn execute_job(&self, job: Job, worker: Option<u32>) {
        profiling::scope!("execute_job");
        if let Err(panic) = job.execute_catching() {
            log::error!(
                "Thread pool {:?}: job panicked on {}: {}",
                self.id,
                worker.map_or_else(|| "the dispatching thread".to_string(), |idx| format!("worker #{}", idx)),
                panic.message(),
            );
        }
    }
}

/// The shared job queue.
///
/// All contexts push into and steal from the same injector. `pending` mirrors the number
/// of jobs in the queue and is what workers check before going to sleep.
pub(crate) struct Queue {
    injector: Injector<Job>,
    pending: CachePadded<AtomicUsize>,
    max_pending: Option<usize>,
}

impl Queue {
    fn new(max_pending: Option<usize>) -> Self {
        Queue {
            injector: Injector::new(),
            pending: CachePadded::new(AtomicUsize::new(0)),
            max_pending,
        }
    }

    /// Returns the job back if the queue is full.
    fn try_push(&self, job: Job) -> Result<(), Job> {
        let max = self.max_pending.unwrap_or(usize::MAX);
        let reserved = self.pending.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| if n >= max { None } else { Some(n + 1) },
        );

        if reserved.is_err() {
            return Err(job);
        }

        self.injector.push(job);

        Ok(())
    }

    pub fn pop(&self) -> Option<Job> {
        let backoff = Backoff::new();
        loop {
            match self.injector.steal() {
                Steal::Success(job) => {
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    return Some(job);
                }
                Steal::Empty => {
                    return None;
                }
                Steal::Retry => {
                    backoff.spin();
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) struct Sleep {
    /// Atomic bitfield. Setting the Nth bit to one means the Nth worker thread is sleepy.
    sleepy_workers: AtomicU64,
    unparkers: Vec<CachePadded<Unparker>>,
}

impl Sleep {
    fn new(num_threads: usize) -> (Self, Vec<Parker>) {
        debug_assert!(num_threads <= MAX_WORKER_THREADS as usize);

        let mut parkers = Vec::with_capacity(num_threads);
        let mut unparkers = Vec::with_capacity(num_threads);

        for _ in 0..num_threads {
            let parker = Parker::new();
            unparkers.push(CachePadded::new(parker.unparker().clone()));
            parkers.push(parker);
        }

        (
            Sleep {
                // Workers mark themselves sleepy once they find the queue empty.
                sleepy_workers: AtomicU64::new(0),
                unparkers,
            },
            parkers,
        )
    }

    /// Wake up to n worker threads (stop when they are all awake).
    ///
    /// This function is fairly expensive when it causes a thread to
    /// wake up, however it is cheap if all workers are already awake.
    pub fn wake(&self, mut n: u32) {
        while n > 0 {
            let mut sleepy_bits = self.sleepy_workers.load(Ordering::SeqCst);

            if sleepy_bits == 0 {
                // Everyone is already awake.
                return;
            }

            profiling::scope!("wake worker");

            let mut woke_one = false;
            for i in 0..(self.unparkers.len() as u32) {
                let bit = 1u64 << i;
                if sleepy_bits & bit == 0 {
                    continue;
                }

                let prev = self.sleepy_workers.fetch_and(!bit, Ordering::SeqCst);
                if prev & bit == 0 {
                    // Someone else woke the thread up before we got to it.
                    // A good time to refresh our view of the sleep thread bits.
                    sleepy_bits = self.sleepy_workers.load(Ordering::SeqCst);

                    if sleepy_bits == 0 {
                        return;
                    }

                    continue;
                }

                self.unparkers[i as usize].unpark();
                woke_one = true;
                break;
            }

            if !woke_one {
                return;
            }

            n -= 1;
        }
    }

    fn mark_sleepy(&self, worker: u32) {
        let sleepy_bit = 1u64 << worker;
        self.sleepy_workers.fetch_or(sleepy_bit, Ordering::SeqCst);
    }

    fn mark_awake(&self, worker: u32) {
        let sleepy_bit = 1u64 << worker;
        self.sleepy_workers.fetch_and(!sleepy_bit, Ordering::SeqCst);
    }

    /// Wake all workers.
    ///
    /// This is a bit heavy handed and mostly intended for the shutdown code. In the majority
    /// of cases (other than shutdown), using `wake` is better.
    fn wake_all(&self) {
        for unparker in &self.unparkers {
            unparker.unpark();
        }
    }
}

struct Worker {
    index: u32,
    shared: Arc<Shared>,
    parker: Parker,
}

impl Worker {
    fn run(&mut self) {
        let shared = Arc::clone(&self.shared);

        if let Some(handler) = &shared.handlers.start {
            handler.run(self.index);
        }

        loop {
            while let Some(job) = shared.queue.pop() {
                shared.execute_job(job, Some(self.index));
            }

            if shared.shutdown.is_shutting_down() {
                // A job may have been pushed right before the shutdown started.
                if shared.queue.is_empty() {
                    break;
                }
                continue;
            }

            // Couldn't find work to do, so it's sleepy time.
            shared.sleep.mark_sleepy(self.index);

            // A job pushed between our last pop and marking ourselves sleepy would
            // have found no one to wake up.
            if !shared.queue.is_empty() || shared.shutdown.is_shutting_down() {
                shared.sleep.mark_awake(self.index);
                continue;
            }

            self.parker.park();

            shared.sleep.mark_awake(self.index);
        }

        // Shutdown phase.

        if let Some(handler) = &shared.handlers.exit {
            handler.run(self.index);
        }

        shared.shutdown.worker_has_shut_down();
    }
}

pub(crate) struct ThreadPoolHooks {
    start: Option<Box<dyn WorkerHook>>,
    exit: Option<Box<dyn WorkerHook>>,
}

pub trait WorkerHook: Send + Sync {
    fn run(&self, worker_index: u32);
}

impl<F> WorkerHook for F where F: Fn(u32) + Send + Sync + 'static {
    fn run(&self, worker_index: u32) { self(worker_index) }
}

#[test]
fn test_drain_after_shutdown_catches_panics() {
    use std::sync::atomic::AtomicU32;

    let pool = ThreadPool::builder().with_worker_threads(1).build().unwrap();
    pool.shut_down().wait();

    // Jobs that other threads pushed right before noticing the shutdown.
    let counter = Arc::new(AtomicU32::new(0));
    let c = counter.clone();
    assert!(pool.shared.queue.try_push(Job::new(|| panic!("foreign job"))).is_ok());
    assert!(pool.shared.queue.try_push(Job::new(move || { c.fetch_add(1, Ordering::SeqCst); })).is_ok());

    // A panicking job must not unwind into the dispatching thread nor stop the drain.
    pool.shared.drain_after_shutdown();

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(pool.shared.queue.is_empty());
}
