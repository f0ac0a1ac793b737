use crate::metrics::CacheMetrics;
use crate::sync::{AtomicU8, Ordering, spin_loop};

/// Result of a CAS retry operation
#[derive(Debug, PartialEq)]
pub(crate) enum CasResult<T> {
    /// Operation succeeded with the given result
    Success(T),
    /// Operation failed after all retries, with the final observed value
    Failed(u8),
    /// Operation declined to proceed, with the value it observed
    Aborted(u8),
}

/// Configuration for CAS retry operations
#[derive(Clone, Copy)]
pub(crate) struct CasRetryConfig {
    pub max_attempts: u32,
    pub early_spin_threshold: u32,
}

impl Default for CasRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 16,
            early_spin_threshold: 8,
        }
    }
}

/// Spin with exponential backoff for the given attempt number.
///
/// Attempt 0 spins once, doubling per attempt up to 64 spins.
#[inline]
pub(crate) fn backoff(attempt: u32) {
    let spin_count = 1u32 << attempt.min(6);
    for _ in 0..spin_count {
        spin_loop();
    }
}

/// Retry a CAS operation on a small state word with progressive backoff.
///
/// The closure inspects the current value and returns:
/// - `Some((new_value, result))` to attempt the CAS
/// - `None` to abort because the observed state needs no transition
#[inline]
pub(crate) fn retry_cas_u8<T, F>(
    atomic: &AtomicU8,
    mut operation: F,
    config: CasRetryConfig,
    metrics: &CacheMetrics,
) -> CasResult<T>
where
    F: FnMut(u8) -> Option<(u8, T)>,
{
    let mut current = atomic.load(Ordering::Acquire);

    for attempt in 0..config.max_attempts {
        if attempt > 0 {
            metrics.cas_retry.increment();
        }

        let (new_value, success_result) = match operation(current) {
            Some(result) => result,
            None => return CasResult::Aborted(current),
        };

        match atomic.compare_exchange_weak(current, new_value, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => return CasResult::Success(success_result),
            Err(actual) => {
                current = actual;
                if attempt < config.early_spin_threshold {
                    backoff(attempt);
                } else {
                    for _ in 0..128 {
                        spin_loop();
                    }
                }
            }
        }
    }

    CasResult::Failed(current)
}
