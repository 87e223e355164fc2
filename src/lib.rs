//! A small fork-join parallel range executor.
//!
//! `parallel_for` splits a range of indices into one contiguous slice per worker, runs a
//! callback over each slice on a background thread, and blocks until all slices are done.
//!
//! It is built on two pieces that can be used on their own:
//! - Dispatchers, which run units of work in the background without any completion
//!   tracking (a thread pool, a thread per job, or the calling thread).
//! - `ForkJoinBarrier`, which lets one thread wait until a known number of workers have
//!   reported.
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! let output: Arc<Vec<AtomicU64>> = Arc::new((0..1000).map(|_| AtomicU64::new(0)).collect());
//! let out = output.clone();
//! parfor::parallel_for(0usize, 1000, 1, move |i| {
//!     out[i].store((i * i) as u64, Ordering::Relaxed);
//! }).unwrap();
//!
//! assert_eq!(output[30].load(Ordering::Relaxed), 900);
//! ```
//!
//! What we want:
//! - No task graph, no cancellation: the loop runs to completion once started.
//! - Never lose work: dispatchers that can't schedule a job run it on the calling thread.
//! - Never hang because of a failing callback: panics are caught per slice and reported
//!   once every slice is done.
//! - A thread waiting on a loop runs the slices of that loop nobody has started yet, so
//!   nested loops can't deadlock the pool, and it never runs unrelated jobs.

mod core;
mod error;
mod partition;
mod range;
pub mod dispatch;
pub mod parallel_for;
pub mod util;

pub use crate::core::barrier::ForkJoinBarrier;
pub use crate::core::job::Job;
pub use crate::core::thread_pool::{ThreadPool, ThreadPoolId, ThreadPoolBuilder};
pub use crate::core::shutdown::ShutdownHandle;
pub use crate::core::{sync, WorkerHook, MAX_WORKER_THREADS};
pub use dispatch::{dispatch, Dispatcher, InlineDispatcher, SpawnDispatcher};
pub use error::{Error, FailureKind, Result, WorkerFailure};
pub use parallel_for::{parallel_for, ParallelFor, RangeIndex};
pub use partition::Partition;
pub use range::IndexRange;
pub use util::hardware_concurrency;
