//! Parallel loops over ranges of indices.
//!
//! The range is split into one contiguous slice per worker and one job per slice is handed
//! to the dispatcher. Jobs claim slices from a cursor private to the loop. The calling
//! thread claims the slices nobody has started yet, then waits on a fork-join barrier until
//! every slice has reported. It never runs work that doesn't belong to its own loop.
//!
//! The callback and everything it captures are moved into an `Arc` shared by the slice
//! jobs, which is why it must be `Send + Sync + 'static`. Data the callback writes into
//! must be shared the same way (for example an `Arc<[AtomicU64]>` with one slot per
//! index), and it is visible to the caller as soon as `run` returns.
//!
//! A callback that panics (or returns an error with `try_run`) stops its own slice. The
//! other slices are not affected, and all failures are reported after every slice has
//! completed.

use crate::core::barrier::{ForkJoinBarrier, DoneOnDrop};
use crate::core::job::PanicPayload;
use crate::core::sync::{Arc, Mutex, AtomicUsize, Ordering};
use crate::dispatch::{Dispatcher, SpawnDispatcher};
use crate::error::{Error, FailureKind, Result, WorkerFailure};
use crate::partition::Partition;
use crate::range::IndexRange;
use crate::util::hardware_concurrency;
use crate::ThreadPool;

pub use crate::range::RangeIndex;

use std::convert::Infallible;
use std::fmt::Display;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};

/// A builder for a parallel loop over a range, created by `Dispatcher::parallel_for`.
pub struct ParallelFor<'d, T, D> {
    dispatcher: &'d D,
    range: Range<T>,
    step: T,
    num_workers: Option<usize>,
}

impl<'d, T: RangeIndex, D: Dispatcher> ParallelFor<'d, T, D> {
    pub(crate) fn new(dispatcher: &'d D, range: Range<T>) -> Self {
        ParallelFor {
            dispatcher,
            range,
            step: T::unit_step(),
            num_workers: None,
        }
    }

    /// Walk the range by `step` instead of one.
    ///
    /// The step must be strictly positive, otherwise `run` fails without doing anything.
    #[inline]
    pub fn with_step(mut self, step: T) -> Self {
        self.step = step;

        self
    }

    /// Split the range into this many slices instead of one per hardware thread.
    #[inline]
    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = Some(num_workers.max(1));

        self
    }

    /// Call `function` for each index of the range in parallel.
    ///
    /// This function returns after all slices have completed.
    pub fn run<F>(self, function: F) -> Result<()>
    where F: Fn(T) + Send + Sync + 'static
    {
        self.try_run(move |index| -> std::result::Result<(), Infallible> {
            function(index);
            Ok(())
        })
    }

    /// Like `run`, with a callback that can fail.
    ///
    /// An error stops the slice it happened in, and is reported after all slices
    /// have completed.
    pub fn try_run<F, E>(self, function: F) -> Result<()>
    where
        F: Fn(T) -> std::result::Result<(), E> + Send + Sync + 'static,
        E: Display,
    {
        let range = IndexRange::new(self.range.start, self.range.end, self.step)?;
        let num_workers = self.num_workers.unwrap_or_else(hardware_concurrency);

        parallel_for_impl(self.dispatcher, range, num_workers, function)
    }
}

fn parallel_for_impl<T, D, F, E>(
    dispatcher: &D,
    range: IndexRange<T>,
    num_workers: usize,
    function: F,
) -> Result<()>
where
    T: RangeIndex,
    D: Dispatcher,
    F: Fn(T) -> std::result::Result<(), E> + Send + Sync + 'static,
    E: Display,
{
    if range.is_empty() {
        return Ok(());
    }

    profiling::scope!("parallel_for");

    let num_workers = num_workers.clamp(1, u32::MAX as usize);
    let partition = Partition::new(range.len(), num_workers);
    let num_slices = partition.num_slices();

    let job_data = Arc::new(SliceJobData {
        range,
        partition,
        next_slice: AtomicUsize::new(0),
        function: Mutex::new(Some(Arc::new(function))),
        barrier: ForkJoinBarrier::new_shared(num_slices as u32),
        failures: Mutex::new(Vec::new()),
    });

    // Empty slices are dispatched too. Each job claims one slice, which may already have
    // been taken by the joining thread, in which case the job has nothing to do.
    for _ in 0..num_slices {
        let data = Arc::clone(&job_data);
        dispatcher.dispatch(move || { data.run_next_slice(); });
    }

    // The joining thread only ever helps with slices of this loop. Jobs that other
    // threads queued in front of ours can't delay the join.
    job_data.barrier.join_with(|| job_data.run_next_slice());

    // Jobs that haven't run yet still reference the job data but must not keep whatever
    // the callback captured alive after we return.
    let function = job_data.function.lock().unwrap().take();
    drop(function);

    let mut failures = std::mem::take(&mut *job_data.failures.lock().unwrap());
    if failures.is_empty() {
        return Ok(());
    }

    failures.sort_by_key(|failure| failure.worker);

    Err(Error::WorkerFailures(failures))
}

struct SliceJobData<T, F> {
    range: IndexRange<T>,
    partition: Partition,
    // Slices are claimed in order by whichever thread gets there first.
    next_slice: AtomicUsize,
    // Taken out by the joining thread once every slice has reported.
    function: Mutex<Option<Arc<F>>>,
    // Counts slices, not jobs.
    barrier: Arc<ForkJoinBarrier>,
    failures: Mutex<Vec<WorkerFailure>>,
}

impl<T, F, E> SliceJobData<T, F>
where
    T: RangeIndex,
    F: Fn(T) -> std::result::Result<(), E>,
    E: Display,
{
    /// Claim the next unstarted slice and run it.
    ///
    /// Returns false if all slices were already claimed.
    fn run_next_slice(&self) -> bool {
        let worker = self.next_slice.fetch_add(1, Ordering::Relaxed);
        if worker >= self.partition.num_slices() {
            return false;
        }

        // Reports to the barrier even if the slice unwinds.
        let _done = DoneOnDrop::new(Arc::clone(&self.barrier));

        let function = self.function.lock().unwrap().clone();
        if let Some(function) = function {
            self.execute_slice(&*function, worker, self.partition.slice(worker));
            // The callback reference is released here, before reporting.
        }

        true
    }

    fn execute_slice(&self, function: &F, worker: usize, offsets: Range<usize>) {
        profiling::scope!("parallel_for slice");

        let mut current = offsets.start;
        let result = panic::catch_unwind(AssertUnwindSafe(|| -> std::result::Result<(), E> {
            for (offset, index) in offsets.clone().zip(self.range.indices(offsets.clone())) {
                current = offset;
                function(index)?;
            }

            Ok(())
        }));

        let (kind, message) = match result {
            Ok(Ok(())) => {
                return;
            }
            Ok(Err(err)) => (FailureKind::Error, err.to_string()),
            Err(payload) => (FailureKind::Panic, PanicPayload(payload).message()),
        };

        let failure = WorkerFailure { worker, offset: current, kind, message };
        log::debug!("parallel_for: {}", failure);

        self.failures.lock().unwrap().push(failure);
    }
}

/// Call `callback` for each index in `start, start + step, ...` below `end`, in parallel
/// on the global thread pool, and return once all of them have completed.
///
/// Fails without calling anything if `step` isn't strictly positive. Panics in the
/// callback are reported as `Error::WorkerFailures` after all workers are done.
pub fn parallel_for<T, F>(start: T, end: T, step: T, callback: F) -> Result<()>
where
    T: RangeIndex,
    F: Fn(T) + Send + Sync + 'static,
{
    match ThreadPool::global() {
        Some(pool) => pool.parallel_for(start..end).with_step(step).run(callback),
        None => {
            SpawnDispatcher::new()
                .parallel_for(start..end)
                .with_step(step)
                .run(callback)
        }
    }
}

#[cfg(test)]
use crate::core::job::Job;
#[cfg(test)]
use std::sync::atomic::{AtomicU32, AtomicU64};

/// Forwards to a thread pool while counting the dispatched jobs.
#[cfg(test)]
struct CountingDispatcher {
    pool: ThreadPool,
    dispatched: AtomicUsize,
}

#[cfg(test)]
impl CountingDispatcher {
    fn new(num_threads: u32) -> Self {
        CountingDispatcher {
            pool: ThreadPool::builder().with_worker_threads(num_threads).build().unwrap(),
            dispatched: AtomicUsize::new(0),
        }
    }

    fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
impl Dispatcher for CountingDispatcher {
    fn dispatch_job(&self, job: Job) {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        self.pool.dispatch_job(job);
    }
}

#[cfg(test)]
fn counters(n: usize) -> Arc<Vec<AtomicU32>> {
    Arc::new((0..n).map(|_| AtomicU32::new(0)).collect())
}

#[test]
fn test_every_index_once() {
    let pool = ThreadPool::builder().with_worker_threads(3).build().unwrap();

    for num_workers in [1, 2, 3, 5, 8, 64] {
        for len in [1usize, 2, 3, 10, 100, 1000] {
            let visits = counters(len);
            let v = visits.clone();
            pool.parallel_for(0..len)
                .with_workers(num_workers)
                .run(move |i| { v[i].fetch_add(1, Ordering::Relaxed); })
                .unwrap();

            for (i, count) in visits.iter().enumerate() {
                assert_eq!(count.load(Ordering::Relaxed), 1, "index {} of {} with {} workers", i, len, num_workers);
            }
        }
    }

    pool.shut_down().wait();
}

#[test]
fn test_stepped_range() {
    let pool = ThreadPool::builder().with_worker_threads(3).build().unwrap();

    let visited = Arc::new(Mutex::new(Vec::new()));
    let v = visited.clone();
    pool.parallel_for(-7i32..40)
        .with_step(5)
        .with_workers(4)
        .run(move |i| { v.lock().unwrap().push(i); })
        .unwrap();

    let mut visited = visited.lock().unwrap().clone();
    visited.sort();
    assert_eq!(visited, vec![-7, -2, 3, 8, 13, 18, 23, 28, 33, 38]);

    pool.shut_down().wait();
}

#[test]
fn test_empty_range() {
    let dispatcher = CountingDispatcher::new(2);

    dispatcher.parallel_for(5..5).run(|_| panic!("empty range")).unwrap();
    dispatcher.parallel_for(10..0).with_workers(4).run(|_| panic!("empty range")).unwrap();
    dispatcher.parallel_for(1.0f64..0.0).with_step(0.5).run(|_| panic!("empty range")).unwrap();

    assert_eq!(dispatcher.dispatched(), 0);

    dispatcher.pool.shut_down().wait();
}

#[test]
fn test_invalid_step() {
    let dispatcher = CountingDispatcher::new(2);
    let calls = Arc::new(AtomicU32::new(0));

    for step in [0, -1, -100] {
        let c = calls.clone();
        let result = dispatcher.parallel_for(0..100)
            .with_step(step)
            .run(move |_| { c.fetch_add(1, Ordering::SeqCst); });
        assert!(matches!(result, Err(Error::InvalidStep(_))));
    }

    let c = calls.clone();
    let result = dispatcher.parallel_for(0.0..1.0)
        .with_step(f64::NAN)
        .run(move |_| { c.fetch_add(1, Ordering::SeqCst); });
    assert!(matches!(result, Err(Error::InvalidStep(_))));

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(dispatcher.dispatched(), 0);

    dispatcher.pool.shut_down().wait();
}

#[test]
fn test_ten_indices_three_workers() {
    let dispatcher = CountingDispatcher::new(3);

    let visited = Arc::new(Mutex::new(Vec::new()));
    let v = visited.clone();
    dispatcher.parallel_for(0..10)
        .with_workers(3)
        .run(move |i| { v.lock().unwrap().push(i); })
        .unwrap();

    assert_eq!(dispatcher.dispatched(), 3);

    let mut visited = visited.lock().unwrap().clone();
    visited.sort();
    assert_eq!(visited, (0..10).collect::<Vec<_>>());

    dispatcher.pool.shut_down().wait();
}

#[test]
fn test_more_workers_than_indices() {
    let dispatcher = CountingDispatcher::new(2);

    for _ in 0..100 {
        let visits = counters(2);
        let v = visits.clone();
        dispatcher.parallel_for(0usize..2)
            .with_workers(8)
            .run(move |i| { v[i].fetch_add(1, Ordering::Relaxed); })
            .unwrap();

        assert_eq!(visits[0].load(Ordering::Relaxed), 1);
        assert_eq!(visits[1].load(Ordering::Relaxed), 1);
    }

    // The empty slices are dispatched as well.
    assert_eq!(dispatcher.dispatched(), 800);

    dispatcher.pool.shut_down().wait();
}

#[test]
fn test_join_waits_for_all_slices() {
    use rand::Rng;
    use std::time::Duration;

    let pool = ThreadPool::builder().with_worker_threads(4).build().unwrap();

    for _ in 0..10 {
        let markers = counters(64);
        let m = markers.clone();
        pool.parallel_for(0usize..64)
            .with_workers(8)
            .run(move |i| {
                let micros = rand::thread_rng().gen_range(0..2000);
                std::thread::sleep(Duration::from_micros(micros));
                m[i].store(1, Ordering::Relaxed);
            })
            .unwrap();

        assert!(markers.iter().all(|marker| marker.load(Ordering::Relaxed) == 1));
    }

    pool.shut_down().wait();
}

#[test]
fn test_squares() {
    let pool = ThreadPool::builder().with_worker_threads(4).build().unwrap();

    const N: usize = 1_000_000;
    let output: Arc<Vec<AtomicU64>> = Arc::new((0..N).map(|_| AtomicU64::new(0)).collect());
    let out = output.clone();
    pool.parallel_for(0..N)
        .with_workers(4)
        .run(move |i| { out[i].store((i * i) as u64, Ordering::Relaxed); })
        .unwrap();

    // The job's references to the callback are released before the join completes.
    let output = Arc::try_unwrap(output).ok().unwrap();
    for (i, slot) in output.into_iter().enumerate() {
        assert_eq!(slot.into_inner(), (i * i) as u64);
    }

    pool.shut_down().wait();
}

#[test]
fn test_panic_is_reported_after_join() {
    let pool = ThreadPool::builder().with_worker_threads(3).build().unwrap();

    let visits = counters(20);
    let v = visits.clone();
    let result = pool.parallel_for(0usize..20)
        .with_workers(4)
        .run(move |i| {
            if i == 7 {
                panic!("bad index {}", i);
            }
            v[i].fetch_add(1, Ordering::Relaxed);
        });

    let err = result.unwrap_err();
    let failures = err.worker_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].worker, 1);
    assert_eq!(failures[0].offset, 7);
    assert_eq!(failures[0].kind, FailureKind::Panic);
    assert_eq!(failures[0].message, "bad index 7");

    // Slice 1 (5..10) stopped at the panic, the other slices completed.
    for i in 0..20 {
        let expected = if (7..10).contains(&i) { 0 } else { 1 };
        assert_eq!(visits[i].load(Ordering::Relaxed), expected, "index {}", i);
    }

    pool.shut_down().wait();
}

#[test]
fn test_try_run_collects_errors() {
    let pool = ThreadPool::builder().with_worker_threads(2).build().unwrap();

    let result = pool.parallel_for(0u32..8)
        .with_workers(2)
        .try_run(|i| if i % 2 == 1 { Err(format!("odd {}", i)) } else { Ok(()) });

    match result {
        Err(Error::WorkerFailures(failures)) => {
            assert_eq!(failures, vec![
                WorkerFailure { worker: 0, offset: 1, kind: FailureKind::Error, message: "odd 1".into() },
                WorkerFailure { worker: 1, offset: 5, kind: FailureKind::Error, message: "odd 5".into() },
            ]);
        }
        other => panic!("unexpected result {:?}", other),
    }

    assert!(pool.parallel_for(0u32..8).try_run(|_| Ok::<(), String>(())).is_ok());

    pool.shut_down().wait();
}

#[test]
fn test_nested_parallel_for() {
    // With a single worker thread, nested loops only make progress if waiting threads
    // pick up pending jobs.
    let pool = ThreadPool::builder().with_worker_threads(1).build().unwrap();

    let total = Arc::new(AtomicU32::new(0));
    let t = total.clone();
    let inner_pool = pool.clone();
    pool.parallel_for(0..8)
        .with_workers(4)
        .run(move |_| {
            let t = t.clone();
            inner_pool.parallel_for(0..10)
                .with_workers(4)
                .run(move |_| { t.fetch_add(1, Ordering::Relaxed); })
                .unwrap();
        })
        .unwrap();

    assert_eq!(total.load(Ordering::Relaxed), 80);

    pool.shut_down().wait();
}

#[test]
fn test_join_ignores_unrelated_jobs() {
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    let pool = ThreadPool::builder().with_worker_threads(1).build().unwrap();

    // Keep the only worker busy, with another long job queued behind it. Both are
    // released by the caller after the loop returns.
    let (started_tx, started_rx) = mpsc::channel();
    let (release_busy_tx, release_busy_rx) = mpsc::channel::<()>();
    let (release_queued_tx, release_queued_rx) = mpsc::channel::<()>();
    pool.dispatch(move || {
        started_tx.send(()).unwrap();
        let _ = release_busy_rx.recv_timeout(Duration::from_secs(10));
    });
    started_rx.recv().unwrap();
    pool.dispatch(move || {
        let _ = release_queued_rx.recv_timeout(Duration::from_secs(10));
    });

    let visits = counters(4);
    let v = visits.clone();
    let start = Instant::now();
    pool.parallel_for(0usize..4)
        .with_workers(2)
        .run(move |i| { v[i].fetch_add(1, Ordering::Relaxed); })
        .unwrap();
    let elapsed = start.elapsed();

    let _ = release_busy_tx.send(());
    let _ = release_queued_tx.send(());

    assert!(visits.iter().all(|count| count.load(Ordering::Relaxed) == 1));
    assert!(elapsed < Duration::from_secs(5), "the join waited on unrelated jobs ({:?})", elapsed);

    pool.shut_down().wait();
}

#[test]
fn test_inline_dispatcher_is_sequential() {
    use crate::InlineDispatcher;

    let visited = Arc::new(Mutex::new(Vec::new()));
    let v = visited.clone();
    InlineDispatcher.parallel_for(0..25)
        .with_workers(4)
        .run(move |i| { v.lock().unwrap().push(i); })
        .unwrap();

    assert_eq!(*visited.lock().unwrap(), (0..25).collect::<Vec<_>>());
}

#[test]
fn test_spawn_dispatcher() {
    let visits = counters(100);
    let v = visits.clone();
    SpawnDispatcher::new()
        .parallel_for(0usize..100)
        .with_workers(5)
        .run(move |i| { v[i].fetch_add(1, Ordering::Relaxed); })
        .unwrap();

    assert!(visits.iter().all(|count| count.load(Ordering::Relaxed) == 1));
}

#[test]
fn test_global_parallel_for() {
    let visits = counters(34);
    let v = visits.clone();
    parallel_for(0usize, 100, 3, move |i| {
        assert_eq!(i % 3, 0);
        v[i / 3].fetch_add(1, Ordering::Relaxed);
    }).unwrap();

    assert!(visits.iter().all(|count| count.load(Ordering::Relaxed) == 1));

    assert!(matches!(parallel_for(0, 10, 0, |_| {}), Err(Error::InvalidStep(_))));
}

#[test]
fn test_float_parallel_for() {
    let sum = Arc::new(Mutex::new(0.0f64));
    let s = sum.clone();
    parallel_for(0.0, 1.0, 0.25, move |x: f64| { *s.lock().unwrap() += x; }).unwrap();

    assert_eq!(*sum.lock().unwrap(), 0.0 + 0.25 + 0.5 + 0.75);
}
