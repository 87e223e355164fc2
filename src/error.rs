use std::fmt;

/// Errors reported by the parallel range executor and the thread pool.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The step of a range must be strictly positive. Reported before any work starts.
    #[error("invalid step {0}: the step must be strictly positive")]
    InvalidStep(String),

    /// The range holds more indices than can be addressed.
    #[error("range {0} holds too many indices")]
    RangeTooLarge(String),

    /// Some slices of a parallel range failed. Every other slice ran to completion.
    #[error("{} worker(s) failed, first: {}", .0.len(), first_failure(.0))]
    WorkerFailures(Vec<WorkerFailure>),

    #[error("failed to spawn a worker thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// The callback panicked.
    Panic,
    /// The callback returned an error.
    Error,
}

/// Describes the failure of one slice of a parallel range.
///
/// A failing slice stops at the first failing index. The remaining indices of that slice
/// are not visited.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerFailure {
    /// Index of the slice, from 0 to the number of workers.
    pub worker: usize,
    /// Position of the failing index in the range (0 for `start`, 1 for `start + step`...).
    pub offset: usize,
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            FailureKind::Panic => "panicked",
            FailureKind::Error => "failed",
        };
        write!(f, "worker #{} {} at offset {}: {}", self.worker, what, self.offset, self.message)
    }
}

fn first_failure(failures: &[WorkerFailure]) -> String {
    failures.first().map_or_else(String::new, |failure| failure.to_string())
}

impl Error {
    /// The individual failures if this is a `WorkerFailures` error.
    pub fn worker_failures(&self) -> &[WorkerFailure] {
        match self {
            Error::WorkerFailures(failures) => failures,
            _ => &[],
        }
    }
}

#[test]
fn test_error_messages() {
    let err = Error::InvalidStep("0".to_string());
    assert_eq!(err.to_string(), "invalid step 0: the step must be strictly positive");

    let err = Error::WorkerFailures(vec![
        WorkerFailure { worker: 1, offset: 5, kind: FailureKind::Panic, message: "boom".into() },
        WorkerFailure { worker: 2, offset: 9, kind: FailureKind::Error, message: "nope".into() },
    ]);
    assert_eq!(err.to_string(), "2 worker(s) failed, first: worker #1 panicked at offset 5: boom");
    assert_eq!(err.worker_failures().len(), 2);
    assert!(Error::RangeTooLarge(String::new()).worker_failures().is_empty());
}
