use std::num::NonZeroUsize;
use std::sync::OnceLock;
use std::thread;

static HARDWARE_CONCURRENCY: OnceLock<NonZeroUsize> = OnceLock::new();

/// The number of hardware threads available to the process.
///
/// Queried once and cached. Always at least one, even if the platform can't tell.
pub fn hardware_concurrency() -> usize {
    HARDWARE_CONCURRENCY.get_or_init(|| {
        match thread::available_parallelism() {
            Ok(n) => n,
            Err(err) => {
                log::debug!("Could not query the available parallelism ({}), assuming 1", err);
                NonZeroUsize::MIN
            }
        }
    }).get()
}

#[test]
fn test_hardware_concurrency() {
    let n = hardware_concurrency();
    assert!(n >= 1);
    assert_eq!(hardware_concurrency(), n);
}
