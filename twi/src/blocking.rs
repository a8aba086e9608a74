//! Blocking adapter
//!
//! Turns a non-blocking start into a call that returns once the transfer has
//! ended. The end-of-transfer path consumes the `blocking` flag: only the
//! first transfer ending while it is set records its result for the caller
//! and posts the instance's semaphore. The flag is cleared again on every
//! exit, since a rejected start leaves it set.

use crate::bus::Error;
use core::sync::atomic::{AtomicBool, Ordering};
use fugit::MillisDurationU32;
use twi_core::Semaphore;

/// Run `start` and wait up to `timeout` for the transfer to end.
///
/// On expiry `abort` tears the transfer down and recording the timeout is up
/// to it; it returns `false` if the transfer had already ended by then, in
/// which case the real outcome is reported. `outcome` reads the result the
/// end-of-transfer path recorded for this call.
pub(crate) fn run_blocking<S: Semaphore>(
    semaphore: &S,
    blocking: &AtomicBool,
    timeout: MillisDurationU32,
    start: impl FnOnce() -> Result<(), Error>,
    abort: impl FnOnce() -> bool,
    outcome: impl FnOnce() -> Result<(), Error>,
) -> Result<(), Error> {
    semaphore.clear();
    blocking.store(true, Ordering::Release);
    let result = match start() {
        Err(e) => Err(e),
        Ok(()) if semaphore.wait(timeout) => outcome(),
        Ok(()) => {
            if abort() {
                warn!("blocking transfer timed out");
                Err(Error::Timeout)
            } else {
                outcome()
            }
        }
    };
    blocking.store(false, Ordering::Release);
    result
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::TestSemaphore;
    use fugit::ExtU32;

    #[test]
    fn posted_semaphore_reports_the_outcome() {
        let semaphore = TestSemaphore::default();
        let blocking = AtomicBool::new(false);
        let result = run_blocking(
            &semaphore,
            &blocking,
            10.millis(),
            || {
                assert!(blocking.load(Ordering::Acquire));
                semaphore.post();
                Ok(())
            },
            || panic!("no abort expected"),
            || Err(Error::Nack),
        );
        assert_eq!(result, Err(Error::Nack));
        assert!(!blocking.load(Ordering::Acquire));
    }

    #[test]
    fn expiry_aborts_and_reports_timeout() {
        let semaphore = TestSemaphore::default();
        let blocking = AtomicBool::new(false);
        let mut aborted = false;
        let result = run_blocking(
            &semaphore,
            &blocking,
            5.millis(),
            || Ok(()),
            || {
                aborted = true;
                true
            },
            || Ok(()),
        );
        assert!(aborted);
        assert_eq!(result, Err(Error::Timeout));
        assert!(!blocking.load(Ordering::Acquire));
    }

    #[test]
    fn completion_racing_the_deadline_wins() {
        let semaphore = TestSemaphore::default();
        let blocking = AtomicBool::new(false);
        let result = run_blocking(&semaphore, &blocking, 1.millis(), || Ok(()), || false, || Ok(()));
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn rejected_start_does_not_wait() {
        let semaphore = TestSemaphore::default();
        // A stale count from an earlier transfer must not leak into this call
        semaphore.post();
        let blocking = AtomicBool::new(false);
        let result = run_blocking(
            &semaphore,
            &blocking,
            10_000.millis(),
            || Err(Error::Busy),
            || panic!("no abort expected"),
            || Ok(()),
        );
        assert_eq!(result, Err(Error::Busy));
        assert!(!blocking.load(Ordering::Acquire));
        assert!(!semaphore.wait(1.millis()));
    }
}
