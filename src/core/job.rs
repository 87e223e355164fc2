use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// A unit of work with its type erased, in the form of a boxed closure.
///
/// This is what gets pushed into and stolen from the queues. A `Job` runs at most once
/// since executing it consumes it.
pub struct Job {
    func: Box<dyn FnOnce() + Send + 'static>,
}

impl Job {
    pub fn new<F>(func: F) -> Self
    where F: FnOnce() + Send + 'static
    {
        Job { func: Box::new(func) }
    }

    #[inline]
    pub fn execute(self) {
        (self.func)()
    }

    /// Execute the job, catching a panic if it happens.
    ///
    /// The job owns everything it touches so observing its state after a panic isn't
    /// possible, which is why asserting unwind safety is fine here.
    pub(crate) fn execute_catching(self) -> Result<(), PanicPayload> {
        panic::catch_unwind(AssertUnwindSafe(self.func)).map_err(PanicPayload)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Job")
    }
}

/// The value a panicking closure unwound with.
pub(crate) struct PanicPayload(pub Box<dyn Any + Send + 'static>);

impl PanicPayload {
    /// Best-effort extraction of the panic message.
    pub fn message(&self) -> String {
        if let Some(msg) = self.0.downcast_ref::<&'static str>() {
            return (*msg).to_string();
        }
        if let Some(msg) = self.0.downcast_ref::<String>() {
            return msg.clone();
        }

        "non-string panic payload".to_string()
    }
}

#[test]
fn test_job_panic_message() {
    let job = Job::new(|| panic!("oh no"));
    let err = job.execute_catching().err().unwrap();
    assert_eq!(err.message(), "oh no");

    let n = 42;
    let job = Job::new(move || panic!("formatted {}", n));
    let err = job.execute_catching().err().unwrap();
    assert_eq!(err.message(), "formatted 42");

    let job = Job::new(|| std::panic::panic_any(3u32));
    let err = job.execute_catching().err().unwrap();
    assert_eq!(err.message(), "non-string panic payload");

    assert!(Job::new(|| {}).execute_catching().is_ok());
}
